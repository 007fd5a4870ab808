//! Import/export binding model.

use crate::module::adapter::AdapterModuleRc;
use crate::module::controller::ModuleControllerRc;
use crate::prelude::*;

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

/// An opaque host value. The engine never looks inside, it only moves
/// values between export slots and import holders.
pub type Value = Rc<dyn Any>;

/// Zero-argument getter returning the current value of one binding.
pub type Getter = Rc<dyn Fn() -> Value>;

/// Imported bindings delivered to a module body, keyed by local name.
pub type Imports = HashMap<String, Getter>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One binding requested from a dependency.
pub enum ImportBinding {
  /// `import { name as local }`
  Named { name: String, local: String },
  /// `import * as local`
  Namespace { local: String },
  /// `export { name as exported } from`
  IndirectExport { name: String, exported: String },
  /// `export * as name from`
  IndirectStarExport { name: String },
  /// `export * from`
  StarExport,
}

#[derive(Clone)]
/// Edge target of the module graph. Reloadable dependencies point at a
/// controller, everything else is an immutable adapter view.
pub enum ModuleRef {
  Reloadable(ModuleControllerRc),
  Adapter(AdapterModuleRc),
}

impl ModuleRef {
  pub fn url(&self) -> &str {
    match self {
      ModuleRef::Reloadable(controller) => controller.url(),
      ModuleRef::Adapter(adapter) => adapter.url(),
    }
  }

  pub fn reloadable(&self) -> Option<&ModuleControllerRc> {
    match self {
      ModuleRef::Reloadable(controller) => Some(controller),
      ModuleRef::Adapter(_) => None,
    }
  }
}

impl std::fmt::Debug for ModuleRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ModuleRef::Reloadable(c) => write!(f, "Reloadable({:?})", c.url()),
      ModuleRef::Adapter(a) => write!(f, "Adapter({:?})", a.url()),
    }
  }
}

/// Lazy module resolution, the host hands these to [`load`] so that
/// construction order does not matter for cyclic graphs.
///
/// [`load`]: crate::module::controller::ModuleController::load
pub type ModuleResolver = Box<dyn Fn() -> AnyResult<ModuleRef>>;

/// One dependency of a declaration: the raw specifier, the bindings it
/// contributes, and a lazy resolver memoized by the importer.
pub struct ModuleRequest {
  specifier: String,
  bindings: Vec<ImportBinding>,
  resolver: ModuleResolver,
  resolved: RefCell<Option<ModuleRef>>,
}

impl ModuleRequest {
  pub fn new(
    specifier: String,
    bindings: Vec<ImportBinding>,
    resolver: ModuleResolver,
  ) -> Self {
    Self {
      specifier,
      bindings,
      resolver,
      resolved: RefCell::new(None),
    }
  }

  pub fn specifier(&self) -> &str {
    &self.specifier
  }

  pub fn bindings(&self) -> &Vec<ImportBinding> {
    &self.bindings
  }

  /// Resolve the request, memoized.
  pub fn module(&self) -> AnyResult<ModuleRef> {
    if let Some(module) = &*self.resolved.borrow() {
      return Ok(module.clone());
    }
    let module = (self.resolver)()?;
    self.resolved.borrow_mut().replace(module.clone());
    Ok(module)
  }
}

impl std::fmt::Debug for ModuleRequest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModuleRequest")
      .field("specifier", &self.specifier)
      .field("bindings", &self.bindings)
      .field("resolved", &self.resolved.borrow().is_some())
      .finish()
  }
}
