//! Script modules: declarative fake module sources for testing.
//!
//! A [`ScriptModule`] stands in for one transformed source version:
//! constant exports, imports, re-exports, HMR registrations and a few
//! behavior switches (async body, throwing body, dynamic imports).
//! [`ScriptHost`] plays the host module system: it owns the sources,
//! fetches them recursively the way ESM would, and records everything
//! observable into a journal.

use crate::future::Step;
use crate::hot::{AcceptCallback, HotRc};
use crate::loader::{LoadRequest, LoadedModule, ModuleLoader};
use crate::module::{
  AdapterModule, AdapterModuleRc, BodyContext, BodyStart, Getter,
  ImportBinding, Imports, ModuleBody, ModuleControllerRc, ModuleRef,
  ModuleRequest, ModuleSource, ModuleUrl, Value,
};
use crate::module::controller::SlotSelector;
use crate::prelude::*;
use crate::runtime::{Runtime, RuntimeOptions};
use crate::watch::ModuleWatcher;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone, Copy, Debug)]
pub enum AcceptBehavior {
  /// Record the call and succeed.
  Record,
  /// Throw out of the callback.
  Fail,
  /// Call `invalidate()` from inside the callback.
  Invalidate,
}

#[derive(Clone)]
struct ScriptAccept {
  /// `None` is a self-accept.
  specifiers: Option<Vec<String>>,
  behavior: Option<AcceptBehavior>,
}

#[derive(Clone, Copy)]
enum Teardown {
  Dispose,
  Prune,
}

/// One fake source version.
#[derive(Clone, Default)]
pub struct ScriptModule {
  imports: Vec<(String, Vec<ImportBinding>)>,
  consts: Vec<(String, i64)>,
  /// Exported name, computed at evaluation from an imported local.
  computed: Vec<(String, String)>,
  accepts: Vec<ScriptAccept>,
  declined: bool,
  async_body: bool,
  fail_eval: Option<String>,
  dyn_imports: Vec<String>,
  teardown: Vec<(Teardown, i64)>,
  dispose_data: Vec<(String, i64)>,
  fail_dispose: bool,
}

pub fn module() -> ScriptModule {
  ScriptModule::default()
}

impl ScriptModule {
  pub fn export_const(mut self, name: &str, value: i64) -> Self {
    self.consts.push((name.to_string(), value));
    self
  }

  /// `export const <name> = <local>;` where `<local>` is an imported
  /// binding, read once at evaluation.
  pub fn export_computed(mut self, name: &str, local: &str) -> Self {
    self.computed.push((name.to_string(), local.to_string()));
    self
  }

  /// `import { <names> } from <specifier>;`
  pub fn import(mut self, specifier: &str, names: &[&str]) -> Self {
    let bindings = names
      .iter()
      .map(|name| ImportBinding::Named {
        name: name.to_string(),
        local: name.to_string(),
      })
      .collect();
    self.imports.push((specifier.to_string(), bindings));
    self
  }

  /// `import * as <local> from <specifier>;`
  pub fn import_namespace(mut self, specifier: &str, local: &str) -> Self {
    self.imports.push((
      specifier.to_string(),
      vec![ImportBinding::Namespace {
        local: local.to_string(),
      }],
    ));
    self
  }

  /// `export { <name> } from <specifier>;`
  pub fn reexport(mut self, specifier: &str, name: &str) -> Self {
    self.imports.push((
      specifier.to_string(),
      vec![ImportBinding::IndirectExport {
        name: name.to_string(),
        exported: name.to_string(),
      }],
    ));
    self
  }

  /// `export { <name> as <exported> } from <specifier>;`
  pub fn reexport_as(
    mut self,
    specifier: &str,
    name: &str,
    exported: &str,
  ) -> Self {
    self.imports.push((
      specifier.to_string(),
      vec![ImportBinding::IndirectExport {
        name: name.to_string(),
        exported: exported.to_string(),
      }],
    ));
    self
  }

  /// `export * as <name> from <specifier>;`
  pub fn star_as(mut self, specifier: &str, name: &str) -> Self {
    self.imports.push((
      specifier.to_string(),
      vec![ImportBinding::IndirectStarExport {
        name: name.to_string(),
      }],
    ));
    self
  }

  /// `export * from <specifier>;`
  pub fn star(mut self, specifier: &str) -> Self {
    self
      .imports
      .push((specifier.to_string(), vec![ImportBinding::StarExport]));
    self
  }

  pub fn accept(self, specifiers: &[&str]) -> Self {
    self.accept_with(specifiers, AcceptBehavior::Record)
  }

  pub fn accept_with(
    mut self,
    specifiers: &[&str],
    behavior: AcceptBehavior,
  ) -> Self {
    self.accepts.push(ScriptAccept {
      specifiers: Some(
        specifiers.iter().map(|s| s.to_string()).collect(),
      ),
      behavior: Some(behavior),
    });
    self
  }

  pub fn accept_self(mut self) -> Self {
    self.accepts.push(ScriptAccept {
      specifiers: None,
      behavior: None,
    });
    self
  }

  pub fn accept_self_with(mut self, behavior: AcceptBehavior) -> Self {
    self.accepts.push(ScriptAccept {
      specifiers: None,
      behavior: Some(behavior),
    });
    self
  }

  pub fn decline(mut self) -> Self {
    self.declined = true;
    self
  }

  pub fn async_body(mut self) -> Self {
    self.async_body = true;
    self
  }

  pub fn fail_eval(mut self, message: &str) -> Self {
    self.fail_eval = Some(message.to_string());
    self
  }

  /// `await import(<specifier>)` during evaluation.
  pub fn dynamic(mut self, specifier: &str) -> Self {
    self.dyn_imports.push(specifier.to_string());
    self
  }

  pub fn dispose_mark(mut self, mark: i64) -> Self {
    self.teardown.push((Teardown::Dispose, mark));
    self
  }

  pub fn prune_mark(mut self, mark: i64) -> Self {
    self.teardown.push((Teardown::Prune, mark));
    self
  }

  /// A dispose callback writing `key = value` into the handover data.
  pub fn dispose_data(mut self, key: &str, value: i64) -> Self {
    self.dispose_data.push((key.to_string(), value));
    self
  }

  /// A dispose callback that throws.
  pub fn fail_dispose(mut self) -> Self {
    self.fail_dispose = true;
    self
  }
}

type Journal = Rc<RefCell<Vec<String>>>;

struct HostInner {
  modules: RefCell<HashMap<ModuleUrl, ScriptModule>>,
  adapters: RefCell<HashMap<ModuleUrl, AdapterModuleRc>>,
  journal: Journal,
  /// Latest import holder per URL, for live-binding assertions.
  envs: RefCell<HashMap<ModuleUrl, Rc<RefCell<Imports>>>>,
  in_flight: RefCell<HashSet<ModuleUrl>>,
}

/// The host module system for tests.
pub struct ScriptHost {
  inner: Rc<HostInner>,
  runtime: Runtime,
}

impl ScriptHost {
  pub fn new() -> Self {
    Self::with_watcher(None)
  }

  pub fn with_watcher(watcher: Option<Rc<dyn ModuleWatcher>>) -> Self {
    let inner = Rc::new(HostInner {
      modules: RefCell::new(HashMap::new()),
      adapters: RefCell::new(HashMap::new()),
      journal: Rc::new(RefCell::new(vec![])),
      envs: RefCell::new(HashMap::new()),
      in_flight: RefCell::new(HashSet::new()),
    });
    let loader = Rc::new(ScriptLoader {
      inner: inner.clone(),
    });
    let runtime = Runtime::new(loader, watcher, RuntimeOptions::default());
    Self { inner, runtime }
  }

  pub fn runtime(&self) -> &Runtime {
    &self.runtime
  }

  pub fn set(&self, url: &str, module: ScriptModule) {
    self
      .inner
      .modules
      .borrow_mut()
      .insert(url.to_string(), module);
  }

  pub fn set_adapter(&self, url: &str, entries: &[(&str, i64)]) {
    let entries = entries
      .iter()
      .map(|(name, value)| {
        (name.to_string(), Rc::new(*value) as Value)
      })
      .collect();
    self.inner.adapters.borrow_mut().insert(
      url.to_string(),
      AdapterModule::to_rc(AdapterModule::new(url.to_string(), entries)),
    );
  }

  /// Fetch the module tree rooted at `url` without evaluating it.
  pub async fn load(&self, url: &str) -> AnyResult<ModuleControllerRc> {
    let request = LoadRequest {
      url: url.to_string(),
      version: self.runtime.lookup(url).map(|c| c.version()).unwrap_or(0),
      attributes: vec![],
    };
    match self.runtime.loader().fetch(&self.runtime, &request).await? {
      LoadedModule::Reloadable(controller) => Ok(controller),
      LoadedModule::Adapter(_) => {
        anyhow::bail!(TheErr::NotLoaded(url.to_string()))
      }
    }
  }

  /// Fetch and boot the module tree rooted at `url`.
  pub async fn boot(&self, url: &str) -> AnyResult<ModuleControllerRc> {
    let controller = self.load(url).await?;
    controller.dispatch().wait().await.map_err(unshare_err)?;
    Ok(controller)
  }

  /// Install a new source version and refetch it, as the watcher
  /// reaction would.
  pub async fn update(&self, url: &str, module: ScriptModule) -> AnyResult<()> {
    self.set(url, module);
    self.runtime.reload(url).await
  }

  pub fn journal(&self) -> Vec<String> {
    self.inner.journal.borrow().clone()
  }

  pub fn take_journal(&self) -> Vec<String> {
    self.inner.journal.borrow_mut().drain(..).collect()
  }

  /// How often `url` evaluated so far.
  pub fn eval_count(&self, url: &str) -> usize {
    let needle = format!("eval:{url}");
    self
      .inner
      .journal
      .borrow()
      .iter()
      .filter(|entry| **entry == needle)
      .count()
  }

  /// Read an imported binding of `url` through its live holder.
  pub fn import_value(&self, url: &str, local: &str) -> Option<i64> {
    let holder = self.inner.envs.borrow().get(url)?.clone();
    let getter = holder.borrow().get(local)?.clone();
    Some(as_i64(&getter()))
  }
}

pub fn as_i64(value: &Value) -> i64 {
  *value.downcast_ref::<i64>().unwrap()
}

/// Read an export of the controller's current namespace.
pub fn export_i64(controller: &ModuleControllerRc, name: &str) -> i64 {
  let namespace = controller.module_namespace(SlotSelector::Current).unwrap();
  as_i64(&namespace.get(name).unwrap())
}

struct ScriptLoader {
  inner: Rc<HostInner>,
}

fn resolve_specifier(base: Option<&str>, specifier: &str) -> ModuleUrl {
  if let Some(rest) = specifier.strip_prefix("./") {
    if let Some(base) = base {
      if let Some((dir, _)) = base.rsplit_once('/') {
        return format!("{dir}/{rest}");
      }
    }
  }
  specifier.to_string()
}

impl ModuleLoader for ScriptLoader {
  fn resolve(
    &self,
    base: Option<&str>,
    specifier: &str,
  ) -> AnyResult<ModuleUrl> {
    Ok(resolve_specifier(base, specifier))
  }

  fn fetch(
    &self,
    runtime: &Runtime,
    request: &LoadRequest,
  ) -> LocalBoxFuture<'static, AnyResult<LoadedModule>> {
    fetch_script(runtime.clone(), request.clone(), self.inner.clone())
      .boxed_local()
  }
}

/// Execute one "transformed module": fetch unseen static dependencies
/// first, then register the declaration with the controller.
async fn fetch_script(
  runtime: Runtime,
  request: LoadRequest,
  inner: Rc<HostInner>,
) -> AnyResult<LoadedModule> {
  let url = request.url.clone();
  if let Some(adapter) = inner.adapters.borrow().get(&url) {
    return Ok(LoadedModule::Adapter(adapter.clone()));
  }
  let module = inner
    .modules
    .borrow()
    .get(&url)
    .cloned()
    .ok_or_else(|| TheErr::UnresolvedSpecifier(url.clone()))?;

  inner.in_flight.borrow_mut().insert(url.clone());
  let result =
    fetch_script_inner(&runtime, &url, &request, module, &inner).await;
  inner.in_flight.borrow_mut().remove(&url);
  result
}

async fn fetch_script_inner(
  runtime: &Runtime,
  url: &str,
  request: &LoadRequest,
  module: ScriptModule,
  inner: &Rc<HostInner>,
) -> AnyResult<LoadedModule> {
  let mut requests = vec![];
  for (specifier, bindings) in &module.imports {
    let dep_url = resolve_specifier(Some(url), specifier);
    let is_adapter = inner.adapters.borrow().contains_key(&dep_url);
    let unseen = runtime
      .lookup(&dep_url)
      .map(|dep| dep.current().is_none() && dep.staging().is_none())
      .unwrap_or(true);
    if !is_adapter && unseen && !inner.in_flight.borrow().contains(&dep_url) {
      let dep_request = LoadRequest {
        url: dep_url.clone(),
        version: runtime.lookup(&dep_url).map(|d| d.version()).unwrap_or(0),
        attributes: vec![],
      };
      Box::pin(fetch_script(
        runtime.clone(),
        dep_request,
        inner.clone(),
      ))
      .await?;
    }

    let resolver_inner = inner.clone();
    let resolver_runtime = runtime.clone();
    let resolver_url = dep_url.clone();
    requests.push(ModuleRequest::new(
      specifier.clone(),
      bindings.clone(),
      Box::new(move || {
        if let Some(adapter) =
          resolver_inner.adapters.borrow().get(&resolver_url)
        {
          return Ok(ModuleRef::Adapter(adapter.clone()));
        }
        Ok(ModuleRef::Reloadable(
          resolver_runtime.acquire(&resolver_url),
        ))
      }),
    ));
  }

  let body = Rc::new(ScriptBody {
    url: url.to_string(),
    module,
    inner: inner.clone(),
  });
  let controller = runtime.acquire(url);
  controller.load(ModuleSource {
    body,
    meta: None,
    uses_dynamic_import: false,
    attributes: request.attributes.clone(),
    requests,
  });
  Ok(LoadedModule::Reloadable(controller))
}

struct ScriptBody {
  url: ModuleUrl,
  module: ScriptModule,
  inner: Rc<HostInner>,
}

impl ModuleBody for ScriptBody {
  fn start(&self, ctx: &BodyContext) -> AnyResult<BodyStart> {
    let slots: Rc<RefCell<HashMap<String, Value>>> =
      Rc::new(RefCell::new(HashMap::new()));
    let holder: Rc<RefCell<Imports>> = Rc::new(RefCell::new(HashMap::new()));
    self
      .inner
      .envs
      .borrow_mut()
      .insert(self.url.clone(), holder.clone());

    let mut exports: Vec<(String, Getter)> = vec![];
    let names = self
      .module
      .consts
      .iter()
      .map(|(name, _)| name)
      .chain(self.module.computed.iter().map(|(name, _)| name));
    for name in names {
      let slots = slots.clone();
      let slot = name.clone();
      let getter: Getter =
        Rc::new(move || slots.borrow().get(&slot).unwrap().clone());
      exports.push((name.clone(), getter));
    }

    let replace_holder = holder.clone();
    let replace_imports = Rc::new(move |imports: &Imports| {
      *replace_holder.borrow_mut() = imports.clone();
    });

    let journal = self.inner.journal.clone();
    let url = self.url.clone();
    let module = self.module.clone();
    let hot = ctx.hot.clone();
    let dynamic_import = ctx.dynamic_import.clone();

    let run = {
      let journal = journal.clone();
      let url = url.clone();
      let hot = hot.clone();
      move || -> AnyResult<()> {
        {
          let data = hot.data();
          let data = data.borrow();
          let mut keys: Vec<&String> = data.keys().collect();
          keys.sort();
          for key in keys {
            let value = as_i64(data.get(key).unwrap());
            journal
              .borrow_mut()
              .push(format!("data:{url}:{key}={value}"));
          }
        }
        journal.borrow_mut().push(format!("eval:{url}"));
        if let Some(message) = &module.fail_eval {
          anyhow::bail!(TheErr::Message(message.clone()));
        }

        for (name, value) in &module.consts {
          slots
            .borrow_mut()
            .insert(name.clone(), Rc::new(*value) as Value);
        }
        for (name, local) in &module.computed {
          let getter =
            holder.borrow().get(local).cloned().ok_or_else(|| {
              TheErr::Message(format!("{url}: unknown import {local:?}"))
            })?;
          slots.borrow_mut().insert(name.clone(), getter());
        }

        for accept in &module.accepts {
          register_accept(accept, &hot, &journal, &url);
        }
        if module.declined {
          hot.decline();
        }
        for (kind, mark) in &module.teardown {
          let journal = journal.clone();
          let mark = *mark;
          match kind {
            Teardown::Dispose => hot.dispose(Box::new(move |_data| {
              journal.borrow_mut().push(format!("teardown:{mark}"));
              Step::Ready(Ok(()))
            })),
            Teardown::Prune => hot.prune(Box::new(move || {
              journal.borrow_mut().push(format!("teardown:{mark}"));
              Step::Ready(Ok(()))
            })),
          }
        }
        for (key, value) in &module.dispose_data {
          let key = key.clone();
          let value = *value;
          hot.dispose(Box::new(move |data| {
            data.borrow_mut().insert(key.clone(), Rc::new(value) as Value);
            Step::Ready(Ok(()))
          }));
        }
        if module.fail_dispose {
          hot.dispose(Box::new(move |_data| {
            Step::Ready(Err(
              TheErr::Message("dispose failed".to_string()).into(),
            ))
          }));
        }
        Ok(())
      }
    };

    let resume: crate::module::BodyResume = if self.module.async_body
      || !self.module.dyn_imports.is_empty()
    {
      let dyn_specs = self.module.dyn_imports.clone();
      Box::new(move || {
        Step::pending(async move {
          tokio::task::yield_now().await;
          run()?;
          for specifier in dyn_specs {
            dynamic_import(specifier.clone()).await?;
            journal.borrow_mut().push(format!("dyn:{url}:{specifier}"));
          }
          Ok(())
        })
      })
    } else {
      Box::new(move || Step::Ready(run()))
    };

    let cleanup_journal = self.inner.journal.clone();
    let cleanup_url = self.url.clone();
    Ok(BodyStart {
      exports,
      replace_imports,
      resume,
      cleanup: Some(Box::new(move || {
        cleanup_journal
          .borrow_mut()
          .push(format!("cleanup:{cleanup_url}"));
      })),
    })
  }
}

fn register_accept(
  accept: &ScriptAccept,
  hot: &HotRc,
  journal: &Journal,
  url: &str,
) {
  let callback: Option<AcceptCallback> =
    accept.behavior.map(|behavior| {
      let journal = journal.clone();
      let url = url.to_string();
      let hot = Rc::downgrade(hot);
      Rc::new(move |_namespaces: Vec<Value>| -> Step<AnyResult<()>> {
        journal.borrow_mut().push(format!("accept:{url}"));
        match behavior {
          AcceptBehavior::Record => Step::Ready(Ok(())),
          AcceptBehavior::Fail => {
            let e: AnyErr =
              TheErr::Message("accept callback failed".to_string()).into();
            Step::Ready(Err(e))
          }
          AcceptBehavior::Invalidate => {
            if let Some(hot) = hot.upgrade() {
              hot.invalidate();
            }
            Step::Ready(Ok(()))
          }
        }
      }) as AcceptCallback
    });
  match &accept.specifiers {
    None => hot.accept_self(callback),
    Some(specifiers) => hot.accept(specifiers.clone(), callback),
  }
}
