//! The HMR surface, `import.meta.hot`.
//!
//! One per instance, created when the instance is instantiated and
//! dropped with it. User code registers accept groups and teardown
//! callbacks here; the update coordinator consults the same object to
//! decide whether an invalidation can stop before reaching the entry
//! module.

use crate::future::Step;
use crate::module::ModuleUrl;
use crate::module::binding::{ModuleRef, Value};
use crate::module::controller::{ModuleControllerRc, SlotSelector};
use crate::module::instance::ModuleInstanceWk;
use crate::prelude::*;
use crate::runtime::{Runtime, RuntimeStateWk};

use log::{error, trace};
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

/// Data handed from a disposed instance to its successor, reachable
/// there as `hot.data()`.
pub type HotData = HashMap<String, Value>;
pub type HotDataRc = Rc<RefCell<HotData>>;

/// One updated unit of the graph: a whole strongly connected
/// component, swapped atomically. Accepting any member accepts the
/// unit.
pub type UpdateUnit = Rc<Vec<ModuleControllerRc>>;

/// Callback of an accept group, invoked with the refreshed namespaces
/// of the updated modules the group matched.
pub type AcceptCallback = Rc<dyn Fn(Vec<Value>) -> Step<AnyResult<()>>>;

/// Teardown on replacement. Writes into the data map delivered to the
/// next instance.
pub type DisposeCallback = Box<dyn FnOnce(HotDataRc) -> Step<AnyResult<()>>>;

/// Teardown on removal from the graph.
pub type PruneCallback = Box<dyn FnOnce() -> Step<AnyResult<()>>>;

/// One `accept(...)` registration. `specifiers: None` is a
/// self-accept: the module absorbs its own re-evaluation.
struct AcceptGroup {
  specifiers: Option<Vec<String>>,
  callback: Option<AcceptCallback>,
}

pub struct Hot {
  url: ModuleUrl,
  me: std::rc::Weak<Hot>,
  runtime: RuntimeStateWk,
  instance: RefCell<Option<ModuleInstanceWk>>,
  data: HotDataRc,
  accepts: RefCell<Vec<AcceptGroup>>,
  declined: Cell<bool>,
  invalidated: Cell<bool>,
  disposers: RefCell<Vec<DisposeCallback>>,
  pruners: RefCell<Vec<PruneCallback>>,
}

pub type HotRc = Rc<Hot>;

impl Hot {
  pub fn create(
    url: ModuleUrl,
    data: HotDataRc,
    runtime: RuntimeStateWk,
  ) -> HotRc {
    Rc::new_cyclic(|me| Self {
      url,
      me: me.clone(),
      runtime,
      instance: RefCell::new(None),
      data,
      accepts: RefCell::new(vec![]),
      declined: Cell::new(false),
      invalidated: Cell::new(false),
      disposers: RefCell::new(vec![]),
      pruners: RefCell::new(vec![]),
    })
  }

  pub fn empty_data() -> HotDataRc {
    Rc::new(RefCell::new(HashMap::new()))
  }

  pub(crate) fn attach(&self, instance: ModuleInstanceWk) {
    self.instance.borrow_mut().replace(instance);
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Whatever the replaced instance's dispose callbacks produced.
  pub fn data(&self) -> HotDataRc {
    self.data.clone()
  }

  // User registrations {

  /// Self-accept: this module absorbs its own re-evaluation, parents
  /// are not invalidated by it.
  pub fn accept_self(&self, callback: Option<AcceptCallback>) {
    self.accepts.borrow_mut().push(AcceptGroup {
      specifiers: None,
      callback,
    });
  }

  /// Accept updates of the listed dependencies. Specifiers must name a
  /// declared static import or an observed dynamic import; a group
  /// with an unknown specifier is logged and dropped.
  pub fn accept(
    &self,
    specifiers: Vec<String>,
    callback: Option<AcceptCallback>,
  ) {
    for specifier in &specifiers {
      if self.resolve_specifier(specifier).is_none() {
        error!(
          "hot accept in {:?} does not match any import: {:?}",
          self.url, specifier
        );
        return;
      }
    }
    self.accepts.borrow_mut().push(AcceptGroup {
      specifiers: Some(specifiers),
      callback,
    });
  }

  /// Refuse every update that would touch this module.
  pub fn decline(&self) {
    self.declined.set(true);
  }

  /// Register teardown for replacement, run in reverse registration
  /// order before the successor instantiates.
  pub fn dispose(&self, callback: DisposeCallback) {
    self.disposers.borrow_mut().push(callback);
  }

  /// Register teardown for removal from the graph.
  pub fn prune(&self, callback: PruneCallback) {
    self.pruners.borrow_mut().push(callback);
  }

  /// Mark this instance invalidated. Inside a running update this
  /// cancels the instance's self-accept; outside one it schedules a
  /// fresh update.
  pub fn invalidate(&self) {
    self.invalidated.set(true);
    trace!("|hot| {:?} invalidated", self.url);
    if let Some(state) = self.runtime.upgrade() {
      let runtime = Runtime::from_state(state);
      if !runtime.update_running() {
        runtime.schedule_update();
      }
    }
  }

  // User registrations }

  // Coordinator queries {

  pub fn is_declined(&self) -> bool {
    self.declined.get()
  }

  pub fn is_invalidated(&self) -> bool {
    self.invalidated.get()
  }

  pub fn is_accepted_self(&self) -> bool {
    self
      .accepts
      .borrow()
      .iter()
      .any(|group| group.specifiers.is_none())
  }

  /// Whether every unit in `updated` is covered by at least one
  /// accept group whose specifiers all currently resolve. A unit is
  /// covered when any of its members is.
  pub fn is_accepted(&self, updated: &[UpdateUnit]) -> bool {
    updated.iter().all(|unit| {
      self.accepts.borrow().iter().any(|group| {
        unit
          .iter()
          .any(|controller| self.group_covers(group, controller.url()))
      })
    })
  }

  /// The callback-invoking variant of [`is_accepted`](Hot::is_accepted):
  /// runs matching groups' callbacks in registration order, each
  /// awaited before the next. `false` when a callback throws or the
  /// instance invalidates itself during the calls.
  pub fn try_accept(&self, updated: Vec<UpdateUnit>) -> Step<bool> {
    if !self.is_accepted(&updated) {
      return Step::Ready(false);
    }
    let mut calls: Vec<(AcceptCallback, Vec<Value>)> = vec![];
    for group in self.accepts.borrow().iter() {
      // The callback sees the refreshed namespaces of the members its
      // specifiers actually name.
      let matched: Vec<Value> = updated
        .iter()
        .flat_map(|unit| unit.iter())
        .filter(|controller| self.group_covers(group, controller.url()))
        .filter_map(|controller| {
          controller
            .module_namespace(SlotSelector::Current)
            .ok()
            .map(|namespace| {
              let value: Value = namespace;
              value
            })
        })
        .collect();
      if matched.is_empty() {
        continue;
      }
      if let Some(callback) = &group.callback {
        calls.push((callback.clone(), matched));
      }
    }
    self.run_accept_calls(calls)
  }

  pub fn try_accept_self(&self) -> Step<bool> {
    if !self.is_accepted_self() {
      return Step::Ready(false);
    }
    let namespace = self.instance.borrow().as_ref().and_then(|instance| {
      instance.upgrade().and_then(|instance| {
        instance.cached_namespace().map(|namespace| {
          let value: Value = namespace;
          value
        })
      })
    });
    let mut calls: Vec<(AcceptCallback, Vec<Value>)> = vec![];
    for group in self.accepts.borrow().iter() {
      if group.specifiers.is_some() {
        continue;
      }
      if let Some(callback) = &group.callback {
        calls.push((callback.clone(), namespace.iter().cloned().collect()));
      }
    }
    self.run_accept_calls(calls)
  }

  fn run_accept_calls(
    &self,
    calls: Vec<(AcceptCallback, Vec<Value>)>,
  ) -> Step<bool> {
    if calls.is_empty() {
      return Step::Ready(!self.invalidated.get());
    }
    let this = self.me.upgrade().unwrap();
    Step::pending(async move {
      for (callback, namespaces) in calls {
        if let Err(e) = callback(namespaces).wait().await {
          error!("hot accept callback in {:?} failed: {e:#}", this.url);
          return false;
        }
      }
      !this.invalidated.get()
    })
  }

  /// Run dispose callbacks in reverse registration order, collecting
  /// the data map for the successor instance. A throwing callback is
  /// fatal to the coordinator.
  pub fn dispose_all(&self) -> Step<AnyResult<HotDataRc>> {
    let callbacks: Vec<DisposeCallback> =
      self.disposers.borrow_mut().drain(..).rev().collect();
    let data = Hot::empty_data();
    if callbacks.is_empty() {
      return Step::Ready(Ok(data));
    }
    let url = self.url.clone();
    Step::pending(async move {
      for callback in callbacks {
        callback(data.clone())
          .wait()
          .await
          .map_err(|e| e.context(format!("dispose callback in {url:?}")))?;
      }
      Ok(data)
    })
  }

  /// Run prune callbacks in reverse registration order. A throwing
  /// callback is fatal to the coordinator.
  pub fn prune_all(&self) -> Step<AnyResult<()>> {
    let callbacks: Vec<PruneCallback> =
      self.pruners.borrow_mut().drain(..).rev().collect();
    if callbacks.is_empty() {
      return Step::Ready(Ok(()));
    }
    let url = self.url.clone();
    Step::pending(async move {
      for callback in callbacks {
        callback()
          .wait()
          .await
          .map_err(|e| e.context(format!("prune callback in {url:?}")))?;
      }
      Ok(())
    })
  }

  // Coordinator queries }

  fn group_covers(&self, group: &AcceptGroup, url: &str) -> bool {
    match &group.specifiers {
      None => false,
      Some(specifiers) => specifiers.iter().any(|specifier| {
        matches!(
          self.resolve_specifier(specifier),
          Some(ModuleRef::Reloadable(controller)) if controller.url() == url
        )
      }),
    }
  }

  /// Resolve an accept specifier against the declared static imports
  /// and the observed dynamic imports of the owning instance.
  fn resolve_specifier(&self, specifier: &str) -> Option<ModuleRef> {
    let instance = self.instance.borrow().as_ref()?.upgrade()?;
    for request in instance.declaration().requests() {
      if request.specifier() == specifier {
        return request.module().ok();
      }
    }
    instance
      .dynamic_imports()
      .into_iter()
      .find(|record| record.specifier == specifier)
      .map(|record| record.module)
  }
}

impl std::fmt::Debug for Hot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Hot")
      .field("url", &self.url)
      .field("accepts", &self.accepts.borrow().len())
      .field("declined", &self.declined.get())
      .field("invalidated", &self.invalidated.get())
      .finish()
  }
}
