//! Export resolution and module namespaces.
//!
//! Follows the resolution rules of ECMAScript Cyclic Module Records:
//! - [ResolveExport](https://tc39.es/ecma262/#sec-resolveexport)
//! - [GetExportedNames](https://tc39.es/ecma262/#sec-getexportednames)
//!
//! Resolution operates on controllers, not instances, so the getter a
//! dependent receives stays valid across in-place swaps: it reads
//! whatever instance is `current` at access time.

use crate::consts::DEFAULT_EXPORT;
use crate::module::binding::{Getter, ModuleRef, Value};
use crate::module::controller::{ModuleController, SlotSelector};
use crate::module::declaration::IndirectExport;
use crate::prelude::*;

use std::rc::Rc;

/// Outcome of resolving one exported name.
pub enum ResolvedExport {
  /// The live getter of the defining module's binding.
  Found(Getter),
  /// Conflicting star-export sources.
  Ambiguous,
  /// No module in the re-export chain provides the name.
  Unresolved,
}

/// Circularity guard: (controller address, export name) pairs already
/// being resolved further up the recursion.
pub type ResolveSet = Vec<(usize, String)>;

/// Guard for `export * from` fan-out in name enumeration, controller
/// addresses already visited.
pub type StarSet = Vec<usize>;

/// Frozen module namespace: enumerable entries sorted by name, each
/// reading the live resolution of its export.
pub struct ModuleNamespace {
  entries: Vec<(String, Getter)>,
}

impl ModuleNamespace {
  pub fn new(mut entries: Vec<(String, Getter)>) -> Self {
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    Self { entries }
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|(name, _)| name.as_str())
  }

  pub fn getter(&self, name: &str) -> Option<Getter> {
    self
      .entries
      .binary_search_by(|(n, _)| n.as_str().cmp(name))
      .ok()
      .map(|at| self.entries[at].1.clone())
  }

  pub fn get(&self, name: &str) -> Option<Value> {
    self.getter(name).map(|getter| getter())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl std::fmt::Debug for ModuleNamespace {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModuleNamespace")
      .field("names", &self.names().collect::<Vec<_>>())
      .finish()
  }
}

// Resolution over graph edges {

impl ModuleRef {
  pub fn resolve_export(
    &self,
    name: &str,
    resolve_set: &mut ResolveSet,
    sel: SlotSelector,
  ) -> AnyResult<ResolvedExport> {
    match self {
      ModuleRef::Reloadable(controller) => {
        controller.resolve_export(name, resolve_set, sel)
      }
      ModuleRef::Adapter(adapter) => Ok(adapter.resolve_export(name)),
    }
  }

  pub fn exported_names(
    &self,
    star_set: &mut StarSet,
    sel: SlotSelector,
  ) -> AnyResult<Vec<String>> {
    match self {
      ModuleRef::Reloadable(controller) => {
        controller.exported_names(star_set, sel)
      }
      ModuleRef::Adapter(adapter) => Ok(adapter.exported_names()),
    }
  }

  /// Stable thunk to the module's namespace, reading the live
  /// namespace of whatever instance is active at access time.
  pub fn namespace_getter(&self, sel: SlotSelector) -> AnyResult<Getter> {
    match self {
      ModuleRef::Reloadable(controller) => {
        // Validate now so link errors surface at link time, then hand
        // out the live thunk.
        controller.module_namespace(sel)?;
        Ok(controller.namespace_getter())
      }
      ModuleRef::Adapter(adapter) => Ok(adapter.namespace_getter()),
    }
  }
}

// Resolution over graph edges }

// Controller-level resolution {

impl ModuleController {
  /// [ResolveExport](https://tc39.es/ecma262/#sec-resolveexport):
  /// the live getter, `Ambiguous`, or `Unresolved`.
  pub fn resolve_export(
    &self,
    name: &str,
    resolve_set: &mut ResolveSet,
    sel: SlotSelector,
  ) -> AnyResult<ResolvedExport> {
    let key = (self as *const ModuleController as usize, name.to_string());
    if resolve_set.contains(&key) {
      // Circular import request.
      return Ok(ResolvedExport::Unresolved);
    }
    resolve_set.push(key);

    let instance = self
      .instance_for(sel)
      .ok_or_else(|| TheErr::NotLoaded(self.url().to_string()))?;
    let environment = instance
      .environment()
      .ok_or_else(|| TheErr::NotLoaded(self.url().to_string()))?;

    if environment.has_export(name) {
      return Ok(ResolvedExport::Found(self.live_export_getter(name)));
    }

    if let Some(entry) = instance.declaration().indirect_export(name) {
      match entry {
        IndirectExport::Named { request, name } => {
          return request.module()?.resolve_export(name, resolve_set, sel);
        }
        IndirectExport::Star { request } => {
          let getter = request.module()?.namespace_getter(sel)?;
          return Ok(ResolvedExport::Found(getter));
        }
      }
    }

    // A star export never provides `default`.
    if name == DEFAULT_EXPORT {
      return Ok(ResolvedExport::Unresolved);
    }

    let mut star_resolution: Option<Getter> = None;
    for request in instance.declaration().star_exports() {
      let module = request.module()?;
      match module.resolve_export(name, resolve_set, sel)? {
        ResolvedExport::Ambiguous => return Ok(ResolvedExport::Ambiguous),
        ResolvedExport::Found(getter) => match &star_resolution {
          None => star_resolution = Some(getter),
          Some(previous) if Rc::ptr_eq(previous, &getter) => {}
          Some(_) => return Ok(ResolvedExport::Ambiguous),
        },
        ResolvedExport::Unresolved => {}
      }
    }
    Ok(match star_resolution {
      Some(getter) => ResolvedExport::Found(getter),
      None => ResolvedExport::Unresolved,
    })
  }

  /// [GetExportedNames](https://tc39.es/ecma262/#sec-getexportednames).
  pub fn exported_names(
    &self,
    star_set: &mut StarSet,
    sel: SlotSelector,
  ) -> AnyResult<Vec<String>> {
    let key = self as *const ModuleController as usize;
    if star_set.contains(&key) {
      return Ok(vec![]);
    }
    star_set.push(key);

    let instance = self
      .instance_for(sel)
      .ok_or_else(|| TheErr::NotLoaded(self.url().to_string()))?;
    let environment = instance
      .environment()
      .ok_or_else(|| TheErr::NotLoaded(self.url().to_string()))?;

    let mut names = environment.export_names();
    for name in instance.declaration().indirect_export_names() {
      if !names.contains(name) {
        names.push(name.clone());
      }
    }
    for request in instance.declaration().star_exports() {
      let module = request.module()?;
      for name in module.exported_names(star_set, sel)? {
        if name != DEFAULT_EXPORT && !names.contains(&name) {
          names.push(name);
        }
      }
    }
    Ok(names)
  }

  /// The frozen namespace of the selected instance, built lazily and
  /// cached for that instance's lifetime. Names resolving ambiguous
  /// are omitted.
  pub fn module_namespace(
    &self,
    sel: SlotSelector,
  ) -> AnyResult<Rc<ModuleNamespace>> {
    let instance = self
      .instance_for(sel)
      .ok_or_else(|| TheErr::NotLoaded(self.url().to_string()))?;
    if let Some(namespace) = instance.cached_namespace() {
      return Ok(namespace);
    }

    let names = self.exported_names(&mut vec![], sel)?;
    let mut entries = vec![];
    for name in names {
      match self.resolve_export(&name, &mut vec![], sel)? {
        ResolvedExport::Found(getter) => entries.push((name, getter)),
        // Ambiguous star names are left off the namespace entirely.
        ResolvedExport::Ambiguous => {}
        ResolvedExport::Unresolved => {}
      }
    }
    let namespace = Rc::new(ModuleNamespace::new(entries));
    instance.cache_namespace(namespace.clone());
    Ok(namespace)
  }
}

// Controller-level resolution }
