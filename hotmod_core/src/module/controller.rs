//! Module controllers.

use crate::future::Step;
use crate::hot::{Hot, HotDataRc};
use crate::module::ModuleUrl;
use crate::module::binding::{Getter, ModuleRef, Value};
use crate::module::body::{BodyContext, DynamicImport};
use crate::module::declaration::{ModuleDeclaration, ModuleSource};
use crate::module::instance::{
  ModuleInstance, ModuleInstanceRc, ModuleState, evaluate_in_order,
};
use crate::prelude::*;
use crate::rc_ptr;
use crate::runtime::{Runtime, RuntimeStateWk};
use crate::traverse::{TraverseDriver, traverse};
use crate::update::UpdateResult;
use crate::watch::Unwatch;

use log::{debug, trace};
use once_cell::unsync::OnceCell;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which instance of a controller an operation works against.
pub enum SlotSelector {
  /// The active instance the application sees.
  Current,
  /// During an update: the instance about to become current.
  Pending,
  /// During the link test: the throwaway clone, then pending.
  LinkTest,
}

/// Per-URL module identity.
///
/// A controller outlives every instance of its module. Dependents hold
/// controller references, so swapping the instance in place never
/// breaks an edge of the graph.
///
/// Slot discipline: outside an update only `current` (and possibly
/// `staging`, freshly loaded new code) is occupied. `pending`,
/// `previous` and `temporary` exist only between the first and last
/// phase of one update run.
pub struct ModuleController {
  url: ModuleUrl,
  me: ModuleControllerWk,
  runtime: RuntimeStateWk,
  /// Cache-busting fetch version, bumped on every file change.
  version: Cell<u64>,
  /// The fetch version whose `load` we already consumed.
  loaded_version: Cell<Option<u64>>,
  current: RefCell<Option<ModuleInstanceRc>>,
  staging: RefCell<Option<ModuleInstanceRc>>,
  pending: RefCell<Option<ModuleInstanceRc>>,
  previous: RefCell<Option<ModuleInstanceRc>>,
  temporary: RefCell<Option<ModuleInstanceRc>>,
  /// Memoized live export getters, keyed by local export name.
  export_getters: RefCell<HashMap<String, Getter>>,
  ns_getter: OnceCell<Getter>,
  watch_token: RefCell<Option<Unwatch>>,
}

rc_ptr!(ModuleController);

impl ModuleController {
  pub fn new(url: ModuleUrl, runtime: RuntimeStateWk) -> ModuleControllerRc {
    Rc::new_cyclic(|me| Self {
      url,
      me: me.clone(),
      runtime,
      version: Cell::new(0),
      loaded_version: Cell::new(None),
      current: RefCell::new(None),
      staging: RefCell::new(None),
      pending: RefCell::new(None),
      previous: RefCell::new(None),
      temporary: RefCell::new(None),
      export_getters: RefCell::new(HashMap::new()),
      ns_getter: OnceCell::new(),
      watch_token: RefCell::new(None),
    })
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub(crate) fn me(&self) -> ModuleControllerRc {
    self.me.upgrade().unwrap()
  }

  pub fn version(&self) -> u64 {
    self.version.get()
  }

  pub fn bump_version(&self) -> u64 {
    self.version.set(self.version.get() + 1);
    self.version.get()
  }

  pub fn set_watch_token(&self, token: Unwatch) {
    self.watch_token.borrow_mut().replace(token);
  }

  pub(crate) fn runtime(&self) -> Runtime {
    Runtime::from_state(self.runtime.upgrade().unwrap())
  }

  // Slots {

  pub fn current(&self) -> Option<ModuleInstanceRc> {
    self.current.borrow().clone()
  }

  pub fn set_current(&self, instance: Option<ModuleInstanceRc>) {
    *self.current.borrow_mut() = instance;
  }

  pub fn staging(&self) -> Option<ModuleInstanceRc> {
    self.staging.borrow().clone()
  }

  pub fn set_staging(&self, instance: Option<ModuleInstanceRc>) {
    *self.staging.borrow_mut() = instance;
  }

  pub fn take_staging(&self) -> Option<ModuleInstanceRc> {
    self.staging.borrow_mut().take()
  }

  pub fn pending(&self) -> Option<ModuleInstanceRc> {
    self.pending.borrow().clone()
  }

  pub fn set_pending(&self, instance: Option<ModuleInstanceRc>) {
    *self.pending.borrow_mut() = instance;
  }

  pub fn previous(&self) -> Option<ModuleInstanceRc> {
    self.previous.borrow().clone()
  }

  pub fn set_previous(&self, instance: Option<ModuleInstanceRc>) {
    *self.previous.borrow_mut() = instance;
  }

  pub fn temporary(&self) -> Option<ModuleInstanceRc> {
    self.temporary.borrow().clone()
  }

  pub fn set_temporary(&self, instance: Option<ModuleInstanceRc>) {
    *self.temporary.borrow_mut() = instance;
  }

  pub fn take_temporary(&self) -> Option<ModuleInstanceRc> {
    self.temporary.borrow_mut().take()
  }

  /// Whether a not-yet-dispatched source version is staged.
  pub fn has_new_code(&self) -> bool {
    self.staging.borrow().is_some()
  }

  /// Drop every update-scoped slot.
  pub fn clear_update_slots(&self) {
    self.pending.borrow_mut().take();
    self.previous.borrow_mut().take();
    self.temporary.borrow_mut().take();
  }

  pub fn instance_for(&self, sel: SlotSelector) -> Option<ModuleInstanceRc> {
    match sel {
      SlotSelector::Current => self.current(),
      SlotSelector::Pending => self.pending().or_else(|| self.current()),
      SlotSelector::LinkTest => self
        .temporary()
        .or_else(|| self.pending())
        .or_else(|| self.current()),
    }
  }

  // Slots }

  /// Install a fresh staging instance for a newly executed source
  /// version. Called by the transformed module's top level, idempotent
  /// across re-executions of the same fetch version.
  pub fn load(&self, source: ModuleSource) {
    if self.loaded_version.get() == Some(self.version.get()) {
      trace!("|controller| {:?} load ignored (same version)", self.url);
      return;
    }
    let declaration = ModuleDeclaration::to_rc(ModuleDeclaration::new(source));
    let instance = ModuleInstance::new(self.url.clone(), declaration);
    self.staging.borrow_mut().replace(instance);
    self.loaded_version.set(Some(self.version.get()));
    debug!(
      "|controller| {:?} staged version {}",
      self.url,
      self.version.get()
    );
  }

  /// The memoized live getter for one of this module's local exports.
  /// It reads through `current`, so the same getter stays valid across
  /// in-place swaps.
  pub fn live_export_getter(&self, name: &str) -> Getter {
    if let Some(getter) = self.export_getters.borrow().get(name) {
      return getter.clone();
    }
    let controller = self.me.clone();
    let export = name.to_string();
    let getter: Getter = Rc::new(move || {
      let controller = controller.upgrade().unwrap();
      let instance = controller.current().unwrap();
      let environment = instance.environment().unwrap();
      environment.export_getter(&export).unwrap()()
    });
    self
      .export_getters
      .borrow_mut()
      .insert(name.to_string(), getter.clone());
    getter
  }

  /// The memoized live getter handing out `current`'s namespace.
  pub fn namespace_getter(&self) -> Getter {
    self
      .ns_getter
      .get_or_init(|| {
        let controller = self.me.clone();
        Rc::new(move || {
          let controller = controller.upgrade().unwrap();
          let namespace =
            controller.module_namespace(SlotSelector::Current).unwrap();
          let value: Value = namespace;
          value
        })
      })
      .clone()
  }

  /// Build the HMR surface and body context for `instance` and start
  /// its body. `data` is whatever the replaced instance's dispose
  /// callbacks produced.
  pub fn instantiate_instance(
    &self,
    instance: &ModuleInstanceRc,
    data: HotDataRc,
  ) -> AnyResult<()> {
    let hot = Hot::create(self.url.clone(), data, self.runtime.clone());
    hot.attach(Rc::downgrade(instance));
    let ctx = BodyContext {
      meta: instance.declaration().meta().clone(),
      hot,
      dynamic_import: self.dynamic_import_hook(instance),
    };
    instance.instantiate(ctx)
  }

  fn dynamic_import_hook(
    &self,
    instance: &ModuleInstanceRc,
  ) -> DynamicImport {
    let state = self.runtime.clone();
    let parent_url = self.url.clone();
    let parent = Rc::downgrade(instance);
    Rc::new(move |specifier: String| {
      let runtime = Runtime::from_state(state.upgrade().unwrap());
      runtime.dynamic_import(parent_url.clone(), parent.clone(), specifier)
    })
  }

  /// Reloadable static dependencies of the active declaration.
  pub fn static_successors(&self) -> AnyResult<Vec<ModuleControllerRc>> {
    let mut successors = vec![];
    if let Some(instance) = self.current() {
      for request in instance.declaration().requests() {
        if let ModuleRef::Reloadable(controller) = request.module()? {
          successors.push(controller);
        }
      }
    }
    Ok(successors)
  }

  /// Update-phase successors: static dependencies of the selected
  /// instance plus the dynamic imports the current instance observed.
  pub fn update_successors(
    &self,
    sel: SlotSelector,
  ) -> AnyResult<Vec<ModuleControllerRc>> {
    let mut successors = vec![];
    if let Some(instance) = self.instance_for(sel) {
      for request in instance.declaration().requests() {
        if let ModuleRef::Reloadable(controller) = request.module()? {
          successors.push(controller);
        }
      }
    }
    if let Some(instance) = self.current() {
      for record in instance.dynamic_imports() {
        if let ModuleRef::Reloadable(controller) = record.module {
          successors.push(controller);
        }
      }
    }
    Ok(successors)
  }

  /// Boot the subgraph rooted here: promote staged instances to
  /// current, then link and evaluate in dependency order, cycles as
  /// single units.
  ///
  /// Safe to call on overlapping graphs: a controller whose instance
  /// is mid `evaluating-async` hands back that evaluation's
  /// completion instead of starting another walk.
  pub fn dispatch(&self) -> Step<SharedResult<()>> {
    if let Some(instance) = self.current() {
      match instance.state() {
        ModuleState::Evaluated => {
          return Step::Ready(instance.evaluation_result());
        }
        ModuleState::EvaluatingAsync => return instance.evaluate(),
        _ => {}
      }
    }
    traverse(Rc::new(BootDriver), self.me())
  }

  /// Boot the entry module and install the coalescing update
  /// scheduler for file-change events.
  pub async fn main(&self) -> AnyResult<()> {
    let runtime = self.runtime();
    runtime.install_main(self.me());
    self.dispatch().wait().await.map_err(unshare_err)
  }

  /// Run an update now and log its outcome.
  pub async fn request_update(&self) {
    let result = self.request_update_result().await;
    result.log(self.url());
  }

  /// Run an update now and hand back the structured result.
  pub async fn request_update_result(&self) -> UpdateResult {
    self.runtime().update_from(self.me()).await
  }
}

impl std::fmt::Debug for ModuleController {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModuleController")
      .field("url", &self.url)
      .field("version", &self.version.get())
      .field("current", &self.current.borrow().is_some())
      .field("staging", &self.staging.borrow().is_some())
      .field("pending", &self.pending.borrow().is_some())
      .field("previous", &self.previous.borrow().is_some())
      .field("temporary", &self.temporary.borrow().is_some())
      .finish()
  }
}

/// Initial boot walk: promote staged code, instantiate, link, evaluate.
struct BootDriver;

impl TraverseDriver for BootDriver {
  type Fwd = ();

  fn begin(
    &self,
    node: &ModuleControllerRc,
  ) -> AnyResult<Vec<ModuleControllerRc>> {
    if node.current().is_none() {
      match node.take_staging() {
        Some(instance) => node.set_current(Some(instance)),
        None => anyhow::bail!(TheErr::NotLoaded(node.url().to_string())),
      }
    }
    node.static_successors()
  }

  fn join(
    &self,
    members: Vec<ModuleControllerRc>,
    _forward: Vec<()>,
  ) -> Step<SharedResult<()>> {
    let mut unlinked = vec![];
    let mut evaluable = vec![];
    for member in &members {
      let instance = member.current().unwrap();
      match instance.state() {
        ModuleState::New => {
          if let Err(e) =
            member.instantiate_instance(&instance, Hot::empty_data())
          {
            return Step::Ready(Err(share_err(e)));
          }
          unlinked.push(instance.clone());
          evaluable.push(instance);
        }
        // A link that failed on an earlier boot attempt retries here.
        ModuleState::Linking => {
          unlinked.push(instance.clone());
          evaluable.push(instance);
        }
        ModuleState::Evaluated => {}
        _ => evaluable.push(instance),
      }
    }
    for instance in &unlinked {
      if let Err(e) = instance.link(SlotSelector::Current) {
        return Step::Ready(Err(share_err(e)));
      }
    }
    evaluate_in_order(evaluable)
  }
}
