//! The update coordinator.
//!
//! An update is one serialized pass over the graph in four phases:
//!
//! 1. **Dry run** - walk `pending ?? current` (dynamic-import edges
//!    included), stage `pending`/`previous` slots, and decide whether
//!    the change is dispatchable at all: somebody declined, or the
//!    invalidation reached the entry module with no self-accept
//!    breaking the chain, and nothing is touched.
//! 2. **Link test** - for every node with new code, link a throwaway
//!    clone against the prospective graph. Catches missing exports
//!    before any state is swapped. The test is a heuristic: it cannot
//!    anticipate `invalidate()` calls made later by accept callbacks,
//!    so passing it is necessary but not sufficient.
//! 3. **Dispatch** - component by component in dependency order:
//!    dispose the old instance, swap, link, evaluate, then offer the
//!    swap to self-accepts and the parents' accept groups.
//! 4. **Cleanup** - prune controllers that fell out of the reachable
//!    graph and restore the steady-state slot discipline.
//!
//! Evaluation errors roll the failing component back to its previous
//! instances and surface as a typed result; the application keeps
//! running on the pre-update graph. Teardown errors are fatal and
//! latch: every later update request short-circuits with the same
//! result.

use crate::future::Step;
use crate::hot::UpdateUnit;
use crate::module::ModuleUrl;
use crate::module::controller::{ModuleControllerRc, SlotSelector};
use crate::module::instance::ModuleInstanceRc;
use crate::prelude::*;
use crate::runtime::Runtime;
use crate::traverse::{TraverseDriver, traverse};

use itertools::Itertools;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct UpdateStats {
  pub duration: Duration,
  /// Modules that evaluated a new declaration.
  pub loads: usize,
  /// Modules re-evaluated on their existing declaration.
  pub reevaluations: usize,
}

#[derive(Debug, Clone)]
/// One node of an invalidation diagnostic: the modules of a component
/// that nothing accepted, and where the invalidation went next.
pub struct ChainNode {
  pub modules: Vec<ModuleUrl>,
  pub next: ChainLink,
}

#[derive(Debug, Clone)]
pub enum ChainLink {
  /// The invalidation surfaced here, at the traversal root.
  Leaf,
  /// Subtree already reported under another parent.
  Elided,
  Children(Vec<ChainNode>),
}

#[derive(Debug, Clone)]
pub enum UpdateResult {
  /// Nothing to do.
  Unchanged,
  Success {
    stats: UpdateStats,
  },
  /// Dispatch ran, but a failed self-accept carried the invalidation
  /// all the way to the root.
  UnacceptedEvaluation {
    stats: UpdateStats,
  },
  Declined {
    declined: Vec<ModuleControllerRc>,
  },
  Unaccepted {
    chain: Vec<ChainNode>,
  },
  EvaluationError {
    error: SharedErr,
    stats: UpdateStats,
  },
  LinkError {
    error: SharedErr,
  },
  FatalError {
    error: SharedErr,
  },
}

impl UpdateResult {
  pub fn log(&self, root: &str) {
    match self {
      UpdateResult::Unchanged => debug!("update {root:?}: nothing to do"),
      UpdateResult::Success { stats } => info!(
        "update {root:?}: ok, {} loaded, {} reevaluated in {}ms",
        stats.loads,
        stats.reevaluations,
        stats.duration.as_millis()
      ),
      UpdateResult::UnacceptedEvaluation { stats } => warn!(
        "update {root:?}: evaluated ({} loaded, {} reevaluated) but not \
         accepted at the root",
        stats.loads, stats.reevaluations
      ),
      UpdateResult::Declined { declined } => error!(
        "update {root:?} declined by: {}",
        declined.iter().map(|c| c.url().to_string()).join(", ")
      ),
      UpdateResult::Unaccepted { chain } => {
        let mut rendered = String::new();
        render_chain(chain, 1, &mut rendered);
        error!("update {root:?} not accepted by:\n{rendered}");
      }
      UpdateResult::EvaluationError { error, .. } => {
        error!("update {root:?} failed evaluating: {error:#}");
      }
      UpdateResult::LinkError { error } => {
        error!("update {root:?} failed linking: {error:#}");
      }
      UpdateResult::FatalError { error } => {
        error!("update {root:?}: runtime is defunct: {error:#}");
      }
    }
  }
}

fn render_chain(nodes: &[ChainNode], depth: usize, out: &mut String) {
  for node in nodes {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&node.modules.iter().join(", "));
    match &node.next {
      ChainLink::Leaf => out.push('\n'),
      ChainLink::Elided => out.push_str(" (...)\n"),
      ChainLink::Children(children) => {
        out.push('\n');
        render_chain(children, depth + 1, out);
      }
    }
  }
}

/// Attach `node` at every open tip of the invalidation trees.
fn graft_chain(chains: &mut [ChainNode], node: &ChainNode) {
  for chain in chains {
    match &mut chain.next {
      ChainLink::Leaf => {
        chain.next = ChainLink::Children(vec![node.clone()]);
      }
      ChainLink::Children(children) => graft_chain(children, node),
      ChainLink::Elided => {}
    }
  }
}

/// Replace repeated subtrees (diamonds in the import graph) with an
/// elision marker so the printed chain stays a tree.
fn elide_repeats(
  nodes: Vec<ChainNode>,
  seen: &mut HashSet<String>,
) -> Vec<ChainNode> {
  nodes
    .into_iter()
    .map(|node| {
      let key = node.modules.iter().join(",");
      if !seen.insert(key) {
        return ChainNode {
          modules: node.modules,
          next: ChainLink::Elided,
        };
      }
      let next = match node.next {
        ChainLink::Children(children) => {
          ChainLink::Children(elide_repeats(children, seen))
        }
        other => other,
      };
      ChainNode {
        modules: node.modules,
        next,
      }
    })
    .collect()
}

fn same_instance(
  a: &Option<ModuleInstanceRc>,
  b: &Option<ModuleInstanceRc>,
) -> bool {
  match (a, b) {
    (Some(a), Some(b)) => Rc::ptr_eq(a, b),
    (None, None) => true,
    _ => false,
  }
}

fn dedup_by_url(
  controllers: impl IntoIterator<Item = ModuleControllerRc>,
) -> Vec<ModuleControllerRc> {
  let mut seen: HashSet<String> = HashSet::new();
  controllers
    .into_iter()
    .filter(|c| seen.insert(c.url().to_string()))
    .collect()
}

/// Units arriving over several edges of a diamond are the same `Rc`.
fn dedup_units(units: impl IntoIterator<Item = UpdateUnit>) -> Vec<UpdateUnit> {
  let mut out: Vec<UpdateUnit> = vec![];
  for unit in units {
    if !out.iter().any(|seen| Rc::ptr_eq(seen, &unit)) {
      out.push(unit);
    }
  }
  out
}

// Phase 1: dry run {

#[derive(Clone, Default)]
struct DryRunOutcome {
  needs_dispatch: bool,
  has_decline: bool,
  has_new_code: bool,
  /// Updated-and-not-absorbed units the parents must accept.
  invalidated: Vec<UpdateUnit>,
  declined: Vec<ModuleControllerRc>,
  chains: Vec<ChainNode>,
}

#[derive(Default)]
struct DryRunDriver {
  visited: RefCell<Vec<ModuleControllerRc>>,
}

impl TraverseDriver for DryRunDriver {
  type Fwd = DryRunOutcome;

  fn begin(
    &self,
    node: &ModuleControllerRc,
  ) -> AnyResult<Vec<ModuleControllerRc>> {
    self.visited.borrow_mut().push(node.clone());
    node.set_previous(node.current());
    node.set_pending(node.staging().or_else(|| node.current()));
    node.update_successors(SlotSelector::Pending)
  }

  fn join(
    &self,
    members: Vec<ModuleControllerRc>,
    forward: Vec<DryRunOutcome>,
  ) -> Step<SharedResult<DryRunOutcome>> {
    let mut outcome = DryRunOutcome::default();
    for fwd in forward {
      outcome.needs_dispatch |= fwd.needs_dispatch;
      outcome.has_decline |= fwd.has_decline;
      outcome.has_new_code |= fwd.has_new_code;
      outcome.invalidated.extend(fwd.invalidated);
      outcome.declined.extend(fwd.declined);
      outcome.chains.extend(fwd.chains);
    }
    outcome.invalidated = dedup_units(outcome.invalidated);
    let forward_invalidated = outcome.invalidated.clone();

    let mut scc_invalidated = false;
    for member in &members {
      let has_new = !same_instance(&member.pending(), &member.current());
      outcome.has_new_code |= has_new;
      let hot = member.current().and_then(|instance| instance.hot());
      let hot_invalidated =
        hot.as_ref().map(|hot| hot.is_invalidated()).unwrap_or(false);
      let accepted = match &hot {
        Some(hot) => hot.is_accepted(&forward_invalidated),
        None => forward_invalidated.is_empty(),
      };
      if has_new || hot_invalidated || !accepted {
        scc_invalidated = true;
      }
    }

    if scc_invalidated {
      outcome.needs_dispatch = true;
      // Import cycles swap as one unit, every member counts as
      // invalidated.
      for member in &members {
        let declined = member
          .current()
          .and_then(|instance| instance.hot())
          .map(|hot| hot.is_declined())
          .unwrap_or(false);
        if declined {
          outcome.declined.push(member.clone());
          outcome.has_decline = true;
        }
      }
      let self_accepted = members.iter().all(|member| {
        member
          .current()
          .and_then(|instance| instance.hot())
          .map(|hot| hot.is_accepted_self())
          .unwrap_or(false)
      });
      if self_accepted {
        // Absorbed here, parents never hear about it.
        outcome.invalidated = vec![];
        outcome.chains = vec![];
      } else {
        outcome.invalidated = vec![Rc::new(members.clone())];
        // The chain grows from the first-invalidated modules towards
        // the root: this component attaches itself at the open tips of
        // whatever arrived from below.
        let node = ChainNode {
          modules: members.iter().map(|m| m.url().to_string()).collect(),
          next: ChainLink::Leaf,
        };
        if outcome.chains.is_empty() {
          outcome.chains = vec![node];
        } else {
          graft_chain(&mut outcome.chains, &node);
        }
      }
    } else {
      // This component accepts whatever changed below it.
      outcome.invalidated = vec![];
      outcome.chains = vec![];
    }

    Step::Ready(Ok(outcome))
  }
}

// Phase 1: dry run }

// Phase 3: dispatch {

#[derive(Clone, Default)]
struct DispatchOutcome {
  /// Swapped units whose self-accept did not absorb the swap.
  updated: Vec<UpdateUnit>,
}

#[derive(Default)]
struct StatsAcc {
  loads: usize,
  reevaluations: usize,
}

#[derive(Default)]
struct DispatchDriver {
  stats: Rc<RefCell<StatsAcc>>,
  /// Dispose/prune failure: latches the runtime.
  fatal: Rc<RefCell<Option<SharedErr>>>,
  /// Link failure surfaced during dispatch.
  link_error: Rc<RefCell<Option<SharedErr>>>,
}

impl TraverseDriver for DispatchDriver {
  type Fwd = DispatchOutcome;

  fn begin(
    &self,
    node: &ModuleControllerRc,
  ) -> AnyResult<Vec<ModuleControllerRc>> {
    node.update_successors(SlotSelector::Pending)
  }

  fn join(
    &self,
    members: Vec<ModuleControllerRc>,
    forward: Vec<DispatchOutcome>,
  ) -> Step<SharedResult<DispatchOutcome>> {
    let updated =
      dedup_units(forward.into_iter().flat_map(|fwd| fwd.updated));

    let needs_swap = members.iter().any(|member| {
      !same_instance(&member.pending(), &member.current())
        || member
          .current()
          .and_then(|instance| instance.hot())
          .map(|hot| hot.is_invalidated())
          .unwrap_or(false)
    });

    if !needs_swap && updated.is_empty() {
      // Nothing below changed either; component keeps its instances.
      for member in &members {
        member.set_pending(None);
      }
      return Step::Ready(Ok(DispatchOutcome::default()));
    }

    let stats = self.stats.clone();
    let fatal = self.fatal.clone();
    let link_error = self.link_error.clone();
    Step::pending(async move {
      dispatch_component(members, updated, needs_swap, stats, fatal, link_error)
        .await
    })
  }
}

/// Dispatch one strongly connected component: dispose, swap, link,
/// evaluate, self-accept. Members are handled strictly in discovery
/// order within the component boundary.
async fn dispatch_component(
  members: Vec<ModuleControllerRc>,
  updated: Vec<UpdateUnit>,
  needs_swap: bool,
  stats: Rc<RefCell<StatsAcc>>,
  fatal: Rc<RefCell<Option<SharedErr>>>,
  link_error: Rc<RefCell<Option<SharedErr>>>,
) -> SharedResult<DispatchOutcome> {
  if !needs_swap {
    // Only dependencies changed. Rewire live bindings, then ask the
    // accept groups whether the swap stops here.
    for member in &members {
      if let Some(instance) = member.current() {
        if let Err(e) = instance.link(SlotSelector::Current) {
          let e = share_err(e);
          link_error.borrow_mut().replace(e.clone());
          return Err(e);
        }
      }
    }
    let mut accepted = true;
    for member in &members {
      let hot = member.current().and_then(|instance| instance.hot());
      let ok = match hot {
        Some(hot) => hot.try_accept(updated.clone()).wait().await,
        None => false,
      };
      if !ok {
        accepted = false;
        break;
      }
    }
    if accepted {
      for member in &members {
        member.set_pending(None);
      }
      return Ok(DispatchOutcome::default());
    }
  }

  // Full swap of the component.
  let mut swapped: Vec<ModuleControllerRc> = vec![];
  let rollback = |swapped: &[ModuleControllerRc]| {
    // Restored instances keep reading consistent values: every binding
    // funnels through controller-level live getters.
    for member in swapped {
      member.set_current(member.previous());
    }
  };

  for member in &members {
    let old = member.current();
    let data = match old.as_ref().and_then(|instance| instance.hot()) {
      Some(hot) => match hot.dispose_all().wait().await {
        Ok(data) => data,
        Err(e) => {
          let e = share_err(e);
          fatal.borrow_mut().replace(e.clone());
          return Err(e);
        }
      },
      None => crate::hot::Hot::empty_data(),
    };

    let next = if same_instance(&member.pending(), &old) {
      // Same declaration, re-evaluate on a fresh instance.
      stats.borrow_mut().reevaluations += 1;
      old.as_ref().unwrap().clone_fresh()
    } else {
      stats.borrow_mut().loads += 1;
      member.pending().unwrap()
    };
    // The staged instance is consumed by this swap.
    if same_instance(&member.staging(), &Some(next.clone())) {
      member.take_staging();
    }
    member.set_current(Some(next.clone()));
    swapped.push(member.clone());

    if let Err(e) = member.instantiate_instance(&next, data) {
      rollback(&swapped);
      return Err(share_err(e));
    }
  }

  for member in &members {
    let instance = member.current().unwrap();
    if let Err(e) = instance.link(SlotSelector::Current) {
      let e = share_err(e);
      link_error.borrow_mut().replace(e.clone());
      rollback(&swapped);
      return Err(e);
    }
  }

  for member in &members {
    let instance = member.current().unwrap();
    if let Err(e) = instance.evaluate().wait().await {
      // Partial rollback: the whole component reverts to its previous
      // instances, components upstream unwind without evaluating.
      rollback(&swapped);
      return Err(e);
    }
  }

  for member in &members {
    member.set_pending(None);
  }

  // Offer every swapped module its self-accept; whoever does not
  // absorb the swap is surfaced to the parents as one unit.
  let mut unit: Vec<ModuleControllerRc> = vec![];
  for member in &members {
    let hot = member.current().unwrap().hot();
    let absorbed = match hot {
      Some(hot) => hot.try_accept_self().wait().await,
      None => false,
    };
    if !absorbed {
      unit.push(member.clone());
    }
  }
  let mut outcome = DispatchOutcome::default();
  if !unit.is_empty() {
    outcome.updated.push(Rc::new(unit));
  }
  Ok(outcome)
}

// Phase 3: dispatch }

// Phase 2: link test {

/// Link a throwaway clone of every new-code instance against the
/// prospective graph. Temporaries are always torn down.
fn link_test(visited: &[ModuleControllerRc]) -> AnyResult<()> {
  let mut tested: Vec<ModuleControllerRc> = vec![];
  let result: AnyResult<()> = (|| {
    for node in visited {
      if !same_instance(&node.pending(), &node.current()) {
        if let Some(pending) = node.pending() {
          node.set_temporary(Some(pending.clone_fresh()));
          tested.push(node.clone());
        }
      }
    }
    for node in &tested {
      let temporary = node.temporary().unwrap();
      node.instantiate_instance(&temporary, crate::hot::Hot::empty_data())?;
    }
    for node in &tested {
      let temporary = node.temporary().unwrap();
      temporary.link(SlotSelector::LinkTest)?;
    }
    Ok(())
  })();
  for node in &tested {
    if let Some(temporary) = node.take_temporary() {
      temporary.unlink();
    }
  }
  result
}

// Phase 2: link test }

// Phase 4: cleanup {

/// Controllers reachable from `root` through current instances,
/// static and dynamic edges alike.
fn reachable_from(root: &ModuleControllerRc) -> AnyResult<Vec<ModuleControllerRc>> {
  let mut seen: HashSet<String> = HashSet::new();
  let mut queue = vec![root.clone()];
  let mut reached = vec![];
  while let Some(node) = queue.pop() {
    if !seen.insert(node.url().to_string()) {
      continue;
    }
    queue.extend(node.update_successors(SlotSelector::Current)?);
    reached.push(node);
  }
  Ok(reached)
}

/// Prune controllers that dropped out of the reachable graph: retire
/// the instance (dispose, then prune) and park it back in staging so
/// a future import boots the module afresh.
async fn cleanup_unreachable(
  root: &ModuleControllerRc,
  before: &[ModuleControllerRc],
) -> AnyResult<()> {
  let reached: HashSet<String> = reachable_from(root)?
    .into_iter()
    .map(|node| node.url().to_string())
    .collect();
  for node in before {
    if reached.contains(node.url()) {
      continue;
    }
    let Some(instance) = node.current() else {
      continue;
    };
    if let Some(hot) = instance.hot() {
      hot.dispose_all().wait().await?;
      hot.prune_all().wait().await?;
    }
    debug!("|update| pruned {:?}", node.url());
    node.set_staging(Some(instance));
    node.set_current(None);
    node.clear_update_slots();
  }
  Ok(())
}

// Phase 4: cleanup }

fn rollback_slots(visited: &[ModuleControllerRc], drop_staging: bool) {
  for node in visited {
    node.clear_update_slots();
    if drop_staging {
      node.take_staging();
    }
  }
}

/// Put every swapped controller back on its previous instance. New
/// declarations are re-staged as fresh clones so the failed source is
/// retried by the next update.
fn restore_graph(visited: &[ModuleControllerRc]) {
  let stage_if_new = |node: &ModuleControllerRc, instance: &ModuleInstanceRc| {
    let fresh_code = match node.previous() {
      Some(previous) => {
        !Rc::ptr_eq(previous.declaration(), instance.declaration())
      }
      None => true,
    };
    if fresh_code {
      node.set_staging(Some(instance.clone_fresh()));
    }
  };
  for node in visited {
    let previous = node.previous();
    let current = node.current();
    if !same_instance(&previous, &current) {
      // The swap is still in place, undo it.
      if let Some(current) = &current {
        stage_if_new(node, current);
      }
      node.set_current(previous);
    } else if let Some(pending) = node.pending() {
      // Never swapped, or already rolled back by the failing
      // component.
      stage_if_new(node, &pending);
    }
  }
}

/// Run one update rooted at `root`. The caller (the runtime) holds the
/// serialization lock and has already checked the fatal latch.
pub(crate) async fn run_update(
  runtime: Runtime,
  root: ModuleControllerRc,
) -> UpdateResult {
  let started = Instant::now();

  // The pre-update graph decides what counts as removed in phase 4;
  // it must be computed before anything swaps.
  let before = match reachable_from(&root) {
    Ok(before) => before,
    Err(e) => {
      return UpdateResult::LinkError {
        error: share_err(e),
      };
    }
  };

  // Phase 1: feasibility.
  let dry_run = Rc::new(DryRunDriver::default());
  let outcome = traverse(dry_run.clone(), root.clone()).wait().await;
  let visited = dry_run.visited.borrow().clone();
  let outcome = match outcome {
    Ok(outcome) => outcome,
    Err(error) => {
      // A resolver refused mid-walk; nothing was swapped yet.
      rollback_slots(&visited, false);
      return UpdateResult::LinkError { error };
    }
  };

  if !outcome.needs_dispatch {
    rollback_slots(&visited, false);
    return UpdateResult::Unchanged;
  }
  if outcome.has_decline {
    let declined = dedup_by_url(outcome.declined);
    rollback_slots(&visited, true);
    return UpdateResult::Declined { declined };
  }
  if !outcome.invalidated.is_empty() {
    let chain = elide_repeats(outcome.chains, &mut HashSet::new());
    rollback_slots(&visited, true);
    return UpdateResult::Unaccepted { chain };
  }

  // Phase 2: link test, only worth it when new code is involved.
  if outcome.has_new_code {
    if let Err(e) = link_test(&visited) {
      rollback_slots(&visited, false);
      return UpdateResult::LinkError {
        error: share_err(e),
      };
    }
  }

  // Phase 3: dispatch.
  let dispatch = Rc::new(DispatchDriver::default());
  let dispatched = traverse(dispatch.clone(), root.clone()).wait().await;
  let stats = {
    let acc = dispatch.stats.borrow();
    UpdateStats {
      duration: started.elapsed(),
      loads: acc.loads,
      reevaluations: acc.reevaluations,
    }
  };
  let dispatched = match dispatched {
    Ok(outcome) => outcome,
    Err(error) => {
      if let Some(error) = dispatch.fatal.borrow_mut().take() {
        runtime.latch_fatal(error.clone());
        return UpdateResult::FatalError { error };
      }
      if let Some(error) = dispatch.link_error.borrow_mut().take() {
        // A link failure restores the whole graph, components that
        // already swapped included.
        restore_graph(&visited);
        rollback_slots(&visited, false);
        return UpdateResult::LinkError { error };
      }
      rollback_slots(&visited, false);
      return UpdateResult::EvaluationError { error, stats };
    }
  };

  // Phase 4: cleanup.
  if let Err(e) = cleanup_unreachable(&root, &before).await {
    let error = share_err(e);
    runtime.latch_fatal(error.clone());
    return UpdateResult::FatalError { error };
  }
  rollback_slots(&visited, false);

  if dispatched.updated.is_empty() {
    UpdateResult::Success { stats }
  } else {
    UpdateResult::UnacceptedEvaluation { stats }
  }
}
