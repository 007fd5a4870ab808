//! The runtime: module registry, host wiring, update scheduling.

use crate::consts::UPDATE_DEBOUNCE;
use crate::loader::{LoadRequest, LoadedModule, ModuleLoader};
use crate::module::ModuleUrl;
use crate::module::binding::{ModuleRef, Value};
use crate::module::controller::{
  ModuleController, ModuleControllerRc, SlotSelector,
};
use crate::module::instance::ModuleInstanceWk;
use crate::prelude::*;
use crate::rc_refcell_ptr;
use crate::update::{UpdateResult, run_update};
use crate::watch::ModuleWatcher;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use log::{debug, error, trace};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc::{
  UnboundedReceiver, UnboundedSender, unbounded_channel,
};

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
  /// Trailing-edge coalescing window for file-change driven updates.
  pub debounce: Duration,
}

impl Default for RuntimeOptions {
  fn default() -> Self {
    Self {
      debounce: UPDATE_DEBOUNCE,
    }
  }
}

/// What the scheduler wakes up for.
enum SchedulerEvent {
  /// A watched URL changed on disk; refetch before updating.
  Changed(ModuleUrl),
  /// Run an update without refetching (`hot.invalidate()`).
  Update,
}

pub struct RuntimeState {
  loader: Rc<dyn ModuleLoader>,
  watcher: Option<Rc<dyn ModuleWatcher>>,
  options: RuntimeOptions,
  /// Append-only url -> controller registry.
  registry: HashMap<ModuleUrl, ModuleControllerRc>,
  main: Option<ModuleControllerRc>,
  /// Latched teardown failure; every later update fails fast with it.
  fatal: Option<SharedErr>,
  update_running: bool,
  update_lock: Rc<tokio::sync::Mutex<()>>,
  scheduler_tx: UnboundedSender<SchedulerEvent>,
  scheduler_rx: Option<UnboundedReceiver<SchedulerEvent>>,
}

rc_refcell_ptr!(RuntimeState);

/// Cloneable handle over the process-wide runtime state.
#[derive(Clone)]
pub struct Runtime {
  state: RuntimeStateRc,
}

impl Runtime {
  pub fn new(
    loader: Rc<dyn ModuleLoader>,
    watcher: Option<Rc<dyn ModuleWatcher>>,
    options: RuntimeOptions,
  ) -> Self {
    let (scheduler_tx, scheduler_rx) = unbounded_channel();
    let state = RuntimeState::to_rc(RuntimeState {
      loader,
      watcher,
      options,
      registry: HashMap::new(),
      main: None,
      fatal: None,
      update_running: false,
      update_lock: Rc::new(tokio::sync::Mutex::new(())),
      scheduler_tx,
      scheduler_rx: Some(scheduler_rx),
    });
    Self { state }
  }

  pub(crate) fn from_state(state: RuntimeStateRc) -> Self {
    Self { state }
  }

  pub fn loader(&self) -> Rc<dyn ModuleLoader> {
    self.state.borrow().loader.clone()
  }

  /// The unique controller for `url`, created on first use. First
  /// acquisition registers the file-change watch.
  pub fn acquire(&self, url: &str) -> ModuleControllerRc {
    if let Some(controller) = self.state.borrow().registry.get(url) {
      return controller.clone();
    }
    let controller =
      ModuleController::new(url.to_string(), Rc::downgrade(&self.state));
    self
      .state
      .borrow_mut()
      .registry
      .insert(url.to_string(), controller.clone());
    trace!("|runtime| acquired {:?}", url);

    let watcher = self.state.borrow().watcher.clone();
    if let Some(watcher) = watcher {
      let tx = self.state.borrow().scheduler_tx.clone();
      let changed = url.to_string();
      let callback = Rc::new(move || {
        let _ = tx.send(SchedulerEvent::Changed(changed.clone()));
      });
      match watcher.watch(&url.to_string(), callback) {
        Ok(token) => controller.set_watch_token(token),
        Err(e) => error!("cannot watch {url:?}: {e:#}"),
      }
    }
    controller
  }

  /// The controller for `url` if one was ever acquired.
  pub fn lookup(&self, url: &str) -> Option<ModuleControllerRc> {
    self.state.borrow().registry.get(url).cloned()
  }

  /// Re-import a changed module through the host under a
  /// version-bumped request, so the host re-parses and the transformed
  /// top level installs a fresh staging instance.
  pub async fn reload(&self, url: &str) -> AnyResult<()> {
    let controller = self.acquire(url);
    let version = controller.bump_version();
    let attributes = controller
      .instance_for(SlotSelector::Current)
      .map(|instance| instance.declaration().attributes().clone())
      .unwrap_or_default();
    let request = LoadRequest {
      url: url.to_string(),
      version,
      attributes,
    };
    debug!("|runtime| reloading {:?}", request.cache_busting_url());
    match self.loader().fetch(self, &request).await? {
      LoadedModule::Reloadable(_) => Ok(()),
      LoadedModule::Adapter(_) => {
        anyhow::bail!(TheErr::Message(format!(
          "reload of {url:?} produced a non-reloadable module"
        )))
      }
    }
  }

  /// Ask the scheduler for an update run without a refetch.
  pub fn schedule_update(&self) {
    let _ = self
      .state
      .borrow()
      .scheduler_tx
      .send(SchedulerEvent::Update);
  }

  pub fn update_running(&self) -> bool {
    self.state.borrow().update_running
  }

  pub(crate) fn latch_fatal(&self, error: SharedErr) {
    self.state.borrow_mut().fatal.replace(error);
  }

  pub fn fatal_error(&self) -> Option<SharedErr> {
    self.state.borrow().fatal.clone()
  }

  pub fn main_controller(&self) -> Option<ModuleControllerRc> {
    self.state.borrow().main.clone()
  }

  /// Remember the entry controller and spawn the coalescing update
  /// scheduler onto the current `LocalSet`.
  pub fn install_main(&self, root: ModuleControllerRc) {
    self.state.borrow_mut().main.replace(root.clone());
    let rx = self.state.borrow_mut().scheduler_rx.take();
    if let Some(rx) = rx {
      tokio::task::spawn_local(scheduler_loop(self.clone(), root, rx));
    }
  }

  /// One serialized update run rooted at `root`: overlapping requests
  /// queue behind the lock, and a latched fatal error short-circuits.
  pub async fn update_from(&self, root: ModuleControllerRc) -> UpdateResult {
    if let Some(error) = self.fatal_error() {
      return UpdateResult::FatalError { error };
    }
    let lock = self.state.borrow().update_lock.clone();
    let _guard = lock.lock().await;
    if let Some(error) = self.fatal_error() {
      return UpdateResult::FatalError { error };
    }
    self.state.borrow_mut().update_running = true;
    let result = run_update(self.clone(), root).await;
    self.state.borrow_mut().update_running = false;
    result
  }

  /// Host dynamic import: resolve, fetch if unseen, boot the target
  /// subgraph, hand back the live namespace.
  pub fn dynamic_import(
    &self,
    parent_url: ModuleUrl,
    parent: ModuleInstanceWk,
    specifier: String,
  ) -> LocalBoxFuture<'static, AnyResult<Value>> {
    let runtime = self.clone();
    async move {
      let url =
        runtime.loader().resolve(Some(parent_url.as_str()), &specifier)?;
      let module = match runtime.lookup(&url) {
        Some(controller)
          if controller.current().is_some()
            || controller.staging().is_some() =>
        {
          ModuleRef::Reloadable(controller)
        }
        existing => {
          let request = LoadRequest {
            url: url.clone(),
            version: existing.map(|c| c.version()).unwrap_or(0),
            attributes: vec![],
          };
          match runtime.loader().fetch(&runtime, &request).await? {
            LoadedModule::Reloadable(controller) => {
              ModuleRef::Reloadable(controller)
            }
            LoadedModule::Adapter(adapter) => ModuleRef::Adapter(adapter),
          }
        }
      };
      if let Some(parent) = parent.upgrade() {
        parent.record_dynamic_import(specifier.clone(), module.clone());
      }
      match &module {
        ModuleRef::Reloadable(controller) => {
          controller.dispatch().wait().await.map_err(unshare_err)?;
          let namespace =
            controller.module_namespace(SlotSelector::Current)?;
          let value: Value = namespace;
          Ok(value)
        }
        ModuleRef::Adapter(adapter) => {
          let value: Value = adapter.namespace();
          Ok(value)
        }
      }
    }
    .boxed_local()
  }
}

/// Coalesce file-change events, refetch the changed modules, then run
/// one update per quiet window. Runs strictly serially: the next batch
/// waits for the previous update's last phase.
async fn scheduler_loop(
  runtime: Runtime,
  root: ModuleControllerRc,
  mut rx: UnboundedReceiver<SchedulerEvent>,
) {
  let debounce = runtime.state.borrow().options.debounce;
  let mut open = true;
  while open {
    let Some(event) = rx.recv().await else {
      return;
    };
    fn note(
      event: SchedulerEvent,
      changed: &mut Vec<ModuleUrl>,
      requested: &mut bool,
    ) {
      match event {
        SchedulerEvent::Changed(url) => {
          if !changed.contains(&url) {
            changed.push(url);
          }
        }
        SchedulerEvent::Update => *requested = true,
      }
    }

    let mut changed: Vec<ModuleUrl> = vec![];
    let mut requested = false;
    note(event, &mut changed, &mut requested);

    // Trailing edge: absorb everything until the window stays quiet.
    loop {
      match tokio::time::timeout(debounce, rx.recv()).await {
        Ok(Some(event)) => note(event, &mut changed, &mut requested),
        Ok(None) => {
          open = false;
          break;
        }
        Err(_) => break,
      }
    }

    let mut refetched = false;
    for url in &changed {
      match runtime.reload(url).await {
        Ok(()) => refetched = true,
        // The changed source itself failed to load; keep running on
        // the old graph and wait for the next save.
        Err(e) => error!("reload of {url:?} failed: {e:#}"),
      }
    }
    if refetched || requested {
      let result = runtime.update_from(root.clone()).await;
      result.log(root.url());
    }
  }
}
