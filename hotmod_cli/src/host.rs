//! Manifest host: loader and module bodies over TOML manifests.

use crate::manifest::ModuleManifest;

use anyhow::Context;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use hotmod_core::future::Step;
use hotmod_core::loader::{LoadRequest, LoadedModule, ModuleLoader};
use hotmod_core::module::{
  BodyContext, BodyStart, Getter, ImportBinding, Imports, ModuleBody,
  ModuleRef, ModuleRequest, ModuleSource, ModuleUrl, Value,
};
use hotmod_core::prelude::*;
use hotmod_core::runtime::Runtime;
use log::{error, info};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Loads module manifests from the filesystem; URLs are absolute
/// paths.
#[derive(Default)]
pub struct ManifestLoader {
  /// Guards cyclic manifest graphs during a recursive fetch.
  in_flight: Rc<RefCell<HashSet<ModuleUrl>>>,
}

impl ManifestLoader {
  pub fn create() -> Rc<Self> {
    Rc::new(Self::default())
  }
}

fn normalize(path: PathBuf) -> ModuleUrl {
  // Fold `.` and `..` without touching the filesystem, so unsaved
  // siblings resolve too.
  let mut parts: Vec<std::ffi::OsString> = vec![];
  for part in path.components() {
    match part {
      std::path::Component::CurDir => {}
      std::path::Component::ParentDir => {
        parts.pop();
      }
      other => parts.push(other.as_os_str().to_os_string()),
    }
  }
  let mut out = PathBuf::new();
  for part in parts {
    out.push(part);
  }
  out.to_string_lossy().into_owned()
}

impl ModuleLoader for ManifestLoader {
  fn resolve(
    &self,
    base: Option<&str>,
    specifier: &str,
  ) -> AnyResult<ModuleUrl> {
    if specifier.starts_with("./") || specifier.starts_with("../") {
      let base = base
        .ok_or_else(|| TheErr::UnresolvedSpecifier(specifier.to_string()))?;
      let dir = Path::new(base).parent().unwrap_or(Path::new(""));
      return Ok(normalize(dir.join(specifier)));
    }
    Ok(normalize(
      std::env::current_dir()
        .map(|dir| dir.join(specifier))
        .unwrap_or_else(|_| PathBuf::from(specifier)),
    ))
  }

  fn fetch(
    &self,
    runtime: &Runtime,
    request: &LoadRequest,
  ) -> LocalBoxFuture<'static, AnyResult<LoadedModule>> {
    fetch_manifest(runtime.clone(), request.clone(), self.in_flight.clone())
      .boxed_local()
  }
}

/// Read and register one manifest, fetching its not-yet-loaded static
/// dependencies first the way a host module system would.
async fn fetch_manifest(
  runtime: Runtime,
  request: LoadRequest,
  in_flight: Rc<RefCell<HashSet<ModuleUrl>>>,
) -> AnyResult<LoadedModule> {
  let url = request.url.clone();
  in_flight.borrow_mut().insert(url.clone());
  let result =
    fetch_manifest_inner(&runtime, &request, &in_flight).await;
  in_flight.borrow_mut().remove(&url);
  result
}

async fn fetch_manifest_inner(
  runtime: &Runtime,
  request: &LoadRequest,
  in_flight: &Rc<RefCell<HashSet<ModuleUrl>>>,
) -> AnyResult<LoadedModule> {
  let url = request.url.clone();
  let source = std::fs::read_to_string(&url)
    .with_context(|| format!("cannot read module manifest {url:?}"))?;
  let manifest = ModuleManifest::parse(&source)
    .with_context(|| format!("cannot parse module manifest {url:?}"))?;

  let loader = runtime.loader();
  let mut requests = vec![];
  for import in &manifest.import {
    let dep_url = loader.resolve(Some(url.as_str()), &import.from)?;

    let unseen = runtime
      .lookup(&dep_url)
      .map(|dep| dep.current().is_none() && dep.staging().is_none())
      .unwrap_or(true);
    if unseen && !in_flight.borrow().contains(&dep_url) {
      let dep_request = LoadRequest {
        url: dep_url.clone(),
        version: runtime.lookup(&dep_url).map(|d| d.version()).unwrap_or(0),
        attributes: vec![],
      };
      Box::pin(fetch_manifest(
        runtime.clone(),
        dep_request,
        in_flight.clone(),
      ))
      .await?;
    }

    let mut bindings = vec![];
    for name in &import.names {
      bindings.push(ImportBinding::Named {
        name: name.clone(),
        local: name.clone(),
      });
    }
    if let Some(local) = &import.namespace {
      bindings.push(ImportBinding::Namespace {
        local: local.clone(),
      });
    }
    for name in &import.reexport {
      bindings.push(ImportBinding::IndirectExport {
        name: name.clone(),
        exported: name.clone(),
      });
    }
    if import.star {
      bindings.push(ImportBinding::StarExport);
    }

    let resolver_runtime = runtime.clone();
    let resolver_url = dep_url.clone();
    requests.push(ModuleRequest::new(
      import.from.clone(),
      bindings,
      Box::new(move || {
        Ok(ModuleRef::Reloadable(resolver_runtime.acquire(&resolver_url)))
      }),
    ));
  }

  let body = Rc::new(ManifestBody {
    url: url.clone(),
    manifest,
  });
  let controller = runtime.acquire(&url);
  controller.load(ModuleSource {
    body,
    meta: None,
    uses_dynamic_import: false,
    attributes: request.attributes.clone(),
    requests,
  });
  Ok(LoadedModule::Reloadable(controller))
}

/// The executable form of a manifest.
struct ManifestBody {
  url: ModuleUrl,
  manifest: ModuleManifest,
}

impl ModuleBody for ManifestBody {
  fn start(&self, ctx: &BodyContext) -> AnyResult<BodyStart> {
    let slots: Rc<RefCell<BTreeMap<String, Value>>> =
      Rc::new(RefCell::new(BTreeMap::new()));
    let holder: Rc<RefCell<Imports>> = Rc::new(RefCell::new(HashMap::new()));

    let mut exports: Vec<(String, Getter)> = vec![];
    let names = self
      .manifest
      .exports
      .keys()
      .chain(self.manifest.copies.keys());
    for name in names {
      let slots = slots.clone();
      let slot = name.clone();
      let getter: Getter =
        Rc::new(move || slots.borrow().get(&slot).unwrap().clone());
      exports.push((name.clone(), getter));
    }

    let replace_holder = holder.clone();
    let replace_imports =
      Rc::new(move |imports: &Imports| {
        *replace_holder.borrow_mut() = imports.clone();
      });

    let url = self.url.clone();
    let manifest = self.manifest.clone();
    let hot = ctx.hot.clone();
    let resume: hotmod_core::module::BodyResume = Box::new(move || {
      for (name, value) in &manifest.exports {
        let value: Value = Rc::new(value.clone());
        slots.borrow_mut().insert(name.clone(), value);
      }
      for (name, local) in &manifest.copies {
        let Some(getter) = holder.borrow().get(local).cloned() else {
          return Step::Ready(Err(
            TheErr::Message(format!(
              "manifest {url:?} copies unknown import {local:?}"
            ))
            .into(),
          ));
        };
        slots.borrow_mut().insert(name.clone(), getter());
      }

      if !manifest.hot.accept.is_empty() {
        let accepted_in = url.clone();
        hot.accept(
          manifest.hot.accept.clone(),
          Some(Rc::new(move |namespaces: Vec<Value>| {
            info!(
              "{accepted_in}: accepted {} updated import(s)",
              namespaces.len()
            );
            Step::Ready(Ok(()))
          })),
        );
      }
      if manifest.hot.accept_self {
        hot.accept_self(None);
      }
      if manifest.hot.decline {
        hot.decline();
      }

      info!("{url}: evaluated [{}]", render_exports(&slots.borrow()));
      Step::Ready(Ok(()))
    });

    Ok(BodyStart {
      exports,
      replace_imports,
      resume,
      cleanup: None,
    })
  }
}

fn render_exports(slots: &BTreeMap<String, Value>) -> String {
  let mut parts = vec![];
  for (name, value) in slots {
    match value.downcast_ref::<toml::Value>() {
      Some(value) => parts.push(format!("{name} = {value}")),
      None => parts.push(format!("{name} = <namespace>")),
    }
  }
  parts.join(", ")
}

/// Boot the entry manifest and hand back its controller.
pub async fn boot(
  runtime: &Runtime,
  entry: &Path,
) -> AnyResult<hotmod_core::module::ModuleControllerRc> {
  let url = normalize(
    std::env::current_dir()
      .map(|dir| dir.join(entry))
      .unwrap_or_else(|_| entry.to_path_buf()),
  );
  let request = LoadRequest {
    url: url.clone(),
    version: 0,
    attributes: vec![],
  };
  match runtime.loader().fetch(runtime, &request).await? {
    LoadedModule::Reloadable(controller) => Ok(controller),
    LoadedModule::Adapter(_) => {
      error!("{url}: entry resolved to a non-reloadable module");
      anyhow::bail!(TheErr::NotLoaded(url))
    }
  }
}
