//! Cycle-aware module graph traversal.
//!
//! A single depth-first primitive underlies boot dispatch, update
//! feasibility checks, and update dispatch. It is a one-pass
//! Tarjan-style walk: every strongly connected component of the graph
//! is handed to the driver exactly once, members in discovery order,
//! so import cycles are processed as one atomic unit.
//!
//! Results flow backwards along the edges. Each component's `join`
//! receives the results produced by the components it points at,
//! deduplicated per collecting component: a component whose members
//! hold several edges to the same dependency sees that dependency's
//! result once.
//!
//! `join` may complete synchronously or hand back a future (modules
//! with top-level await). The walk only becomes asynchronous where the
//! graph forces it to: a component with pending dependencies completes
//! as a future, everything else joins inline.

use crate::future::Step;
use crate::module::controller::ModuleControllerRc;
use crate::prelude::*;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use futures::future::Shared;
use futures::future::join_all;
use log::trace;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Traversal visit index, bumped once per walk.
///
/// Per-walk scratch state is owned by the walk itself, the index only
/// tags log lines so interleaved walks (a dynamic import starting a
/// boot in the middle of an update) can be told apart.
pub fn next_visit_index() -> u64 {
  static GLOBAL: AtomicU64 = AtomicU64::new(1);
  GLOBAL.fetch_add(1, Ordering::Relaxed)
}

/// Hooks a traversal consumer implements.
pub trait TraverseDriver {
  /// Result type flowing backwards along graph edges.
  type Fwd: Clone + 'static;

  /// Record entry into `node` and yield its successors.
  ///
  /// Failing here aborts the walk synchronously; `unwind` then
  /// receives the nodes still on the stack.
  fn begin(&self, node: &ModuleControllerRc)
  -> AnyResult<Vec<ModuleControllerRc>>;

  /// Process one strongly connected component.
  ///
  /// `members` are in discovery order. `forward` holds the results of
  /// the components this one points at, one entry per distinct
  /// dependency.
  fn join(
    &self,
    members: Vec<ModuleControllerRc>,
    forward: Vec<Self::Fwd>,
  ) -> Step<SharedResult<Self::Fwd>>;

  /// Called once on exceptional exit with every node whose component
  /// never reached `join`, in reverse discovery order.
  fn unwind(&self, _nodes: Vec<ModuleControllerRc>) {}
}

/// Completion of one strongly connected component. Shared because
/// several downstream components may await the same dependency.
type SccFuture = Shared<LocalBoxFuture<'static, SharedResult<()>>>;

enum SccCompletion {
  /// Joined synchronously and succeeded.
  Ready,
  Pending(SccFuture),
}

struct Scc<F> {
  members: Vec<ModuleControllerRc>,
  completion: SccCompletion,
  /// The join result, present once the completion resolved ok.
  result: Rc<RefCell<Option<F>>>,
  /// Set when `join` has been invoked (possibly still pending).
  joined: Rc<Cell<bool>>,
}

struct NodeState {
  index: u32,
  on_stack: bool,
  /// Component id, set when the node's component pops.
  scc: Option<usize>,
  /// Out-edges to already popped components, in discovery order.
  edges: Vec<usize>,
}

struct Walk<D: TraverseDriver> {
  driver: Rc<D>,
  visit_index: u64,
  next_index: u32,
  nodes: HashMap<String, NodeState>,
  stack: Vec<ModuleControllerRc>,
  sccs: Vec<Scc<D::Fwd>>,
}

impl<D: TraverseDriver + 'static> Walk<D> {
  /// Returns the node's low-link.
  fn visit(&mut self, node: &ModuleControllerRc) -> SharedResult<u32> {
    let url = node.url().to_string();
    let index = self.next_index;
    self.next_index += 1;
    trace!(
      "|traverse#{}| enter {:?} index:{}",
      self.visit_index, url, index
    );
    self.nodes.insert(
      url.clone(),
      NodeState {
        index,
        on_stack: true,
        scc: None,
        edges: vec![],
      },
    );
    self.stack.push(node.clone());

    let children = self.driver.begin(node).map_err(share_err)?;
    let mut low = index;
    for child in children {
      let child_url = child.url().to_string();
      let seen = self
        .nodes
        .get(&child_url)
        .map(|state| (state.on_stack, state.index, state.scc));
      match seen {
        None => {
          let child_low = self.visit(&child)?;
          low = low.min(child_low);
          if let Some(scc) = self.nodes.get(&child_url).unwrap().scc {
            self.record_edge(&url, scc);
          }
        }
        // Back edge, the target belongs to the component in progress.
        // No result crosses a cycle-internal edge.
        Some((true, child_index, _)) => {
          low = low.min(child_index);
        }
        Some((false, _, scc)) => {
          self.record_edge(&url, scc.unwrap());
        }
      }
    }

    if low == index {
      self.pop_component(node)?;
    }
    Ok(low)
  }

  fn record_edge(&mut self, url: &str, scc: usize) {
    let state = self.nodes.get_mut(url).unwrap();
    if !state.edges.contains(&scc) {
      state.edges.push(scc);
    }
  }

  /// Pop the stack suffix started by `root_node` as one component and
  /// wire up its join.
  fn pop_component(
    &mut self,
    root_node: &ModuleControllerRc,
  ) -> SharedResult<()> {
    let at = self
      .stack
      .iter()
      .rposition(|n| Rc::ptr_eq(n, root_node))
      .unwrap();
    let members = self.stack.split_off(at);
    let scc_id = self.sccs.len();

    // Out-edges of the whole component, member discovery order,
    // deduplicated.
    let mut edges: Vec<usize> = vec![];
    for member in &members {
      let state = self.nodes.get_mut(member.url()).unwrap();
      state.on_stack = false;
      state.scc = Some(scc_id);
      for edge in std::mem::take(&mut state.edges) {
        if !edges.contains(&edge) {
          edges.push(edge);
        }
      }
    }
    trace!(
      "|traverse#{}| component {} members:{} edges:{:?}",
      self.visit_index,
      scc_id,
      members.len(),
      edges
    );

    // Dependencies to wait for, and the result slots to read once they
    // settled.
    let mut waits: Vec<SccFuture> = vec![];
    let mut claims: Vec<Rc<RefCell<Option<D::Fwd>>>> = vec![];
    for &edge in &edges {
      let dep = &self.sccs[edge];
      if let SccCompletion::Pending(fut) = &dep.completion {
        waits.push(fut.clone());
      }
      claims.push(dep.result.clone());
    }

    let result: Rc<RefCell<Option<D::Fwd>>> = Rc::new(RefCell::new(None));
    let joined = Rc::new(Cell::new(false));

    let completion = if waits.is_empty() {
      // Every dependency finished synchronously, join inline.
      let forward = claims
        .iter()
        .filter_map(|slot| slot.borrow().clone())
        .collect();
      joined.set(true);
      match self.driver.join(members.clone(), forward) {
        Step::Ready(Ok(value)) => {
          result.borrow_mut().replace(value);
          SccCompletion::Ready
        }
        Step::Ready(Err(e)) => return Err(e),
        Step::Pending(fut) => {
          let result = result.clone();
          let fut = async move {
            let value = fut.await?;
            result.borrow_mut().replace(value);
            Ok(())
          };
          SccCompletion::Pending(fut.boxed_local().shared())
        }
      }
    } else {
      let driver = self.driver.clone();
      let result = result.clone();
      let joined = joined.clone();
      let join_members = members.clone();
      let fut = async move {
        // Wait for every dependency, then surface the first failure in
        // edge order. Siblings are left to run to completion rather
        // than cancelled, their instances stay in a defined state.
        let settled = join_all(waits).await;
        if let Some(e) = settled.into_iter().find_map(|r| r.err()) {
          return Err(e);
        }
        let forward = claims
          .iter()
          .filter_map(|slot| slot.borrow().clone())
          .collect();
        joined.set(true);
        let value = driver.join(join_members, forward).wait().await?;
        result.borrow_mut().replace(value);
        Ok(())
      };
      SccCompletion::Pending(fut.boxed_local().shared())
    };

    self.sccs.push(Scc {
      members,
      completion,
      result,
      joined,
    });
    Ok(())
  }
}

/// Walk the graph from `root` and fold it through `driver`.
///
/// Completes synchronously when no component produced a pending join.
pub fn traverse<D>(
  driver: Rc<D>,
  root: ModuleControllerRc,
) -> Step<SharedResult<D::Fwd>>
where
  D: TraverseDriver + 'static,
{
  let mut walk = Walk {
    driver: driver.clone(),
    visit_index: next_visit_index(),
    next_index: 0,
    nodes: HashMap::new(),
    stack: vec![],
    sccs: vec![],
  };

  if let Err(e) = walk.visit(&root) {
    // Synchronous abort, the stack still holds every unfinished node.
    let mut stack = std::mem::take(&mut walk.stack);
    stack.reverse();
    driver.unwind(stack);
    return Step::Ready(Err(e));
  }

  // The root's component is always the last one formed.
  let root_scc = walk.sccs.last().unwrap();
  let root_result = root_scc.result.clone();
  match &root_scc.completion {
    SccCompletion::Ready => {
      Step::Ready(Ok(root_result.borrow_mut().take().unwrap()))
    }
    SccCompletion::Pending(fut) => {
      let fut = fut.clone();
      let sccs: Vec<(Vec<ModuleControllerRc>, Rc<Cell<bool>>)> = walk
        .sccs
        .iter()
        .map(|scc| (scc.members.clone(), scc.joined.clone()))
        .collect();
      Step::pending(async move {
        match fut.await {
          Ok(()) => Ok(root_result.borrow_mut().take().unwrap()),
          Err(e) => {
            // Components whose join never started unwind in reverse
            // discovery order.
            let mut nodes = vec![];
            for (members, joined) in sccs.iter().rev() {
              if !joined.get() {
                nodes.extend(members.iter().rev().cloned());
              }
            }
            driver.unwind(nodes);
            Err(e)
          }
        }
      })
    }
  }
}
