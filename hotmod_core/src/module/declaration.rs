//! Module declarations.

use crate::module::binding::{ImportBinding, ModuleRequest, Value};
use crate::module::body::ModuleBody;
use crate::prelude::*;
use crate::rc_ptr;

use std::rc::Rc;

/// The raw payload a transformed module's top level hands to
/// [`load`](crate::module::controller::ModuleController::load).
pub struct ModuleSource {
  pub body: Rc<dyn ModuleBody>,
  pub meta: Option<Value>,
  pub uses_dynamic_import: bool,
  pub attributes: Vec<(String, String)>,
  pub requests: Vec<ModuleRequest>,
}

/// How an indirect export reaches its source module.
pub enum IndirectExport {
  /// `export { name as exported } from`, resolve `name` in the
  /// requested module.
  Named { request: Rc<ModuleRequest>, name: String },
  /// `export * as exported from`, the export is the requested
  /// module's namespace.
  Star { request: Rc<ModuleRequest> },
}

/// Immutable description of one source version.
///
/// Local export names are not part of the declaration, they are
/// published by the body when an instance starts.
pub struct ModuleDeclaration {
  body: Rc<dyn ModuleBody>,
  meta: Option<Value>,
  uses_dynamic_import: bool,
  attributes: Vec<(String, String)>,
  requests: Vec<Rc<ModuleRequest>>,
  /// Indirect re-exports keyed by exported name.
  indirect_exports: HashMap<String, IndirectExport>,
  /// `export * from` sources.
  star_exports: Vec<Rc<ModuleRequest>>,
}

impl ModuleDeclaration {
  pub fn new(source: ModuleSource) -> Self {
    let requests: Vec<Rc<ModuleRequest>> =
      source.requests.into_iter().map(Rc::new).collect();

    let mut indirect_exports = HashMap::new();
    let mut star_exports = vec![];
    for request in &requests {
      for binding in request.bindings() {
        match binding {
          ImportBinding::IndirectExport { name, exported } => {
            indirect_exports.insert(
              exported.clone(),
              IndirectExport::Named {
                request: request.clone(),
                name: name.clone(),
              },
            );
          }
          ImportBinding::IndirectStarExport { name } => {
            indirect_exports.insert(
              name.clone(),
              IndirectExport::Star {
                request: request.clone(),
              },
            );
          }
          ImportBinding::StarExport => {
            star_exports.push(request.clone());
          }
          ImportBinding::Named { .. } | ImportBinding::Namespace { .. } => {}
        }
      }
    }

    Self {
      body: source.body,
      meta: source.meta,
      uses_dynamic_import: source.uses_dynamic_import,
      attributes: source.attributes,
      requests,
      indirect_exports,
      star_exports,
    }
  }

  pub fn body(&self) -> &Rc<dyn ModuleBody> {
    &self.body
  }

  pub fn meta(&self) -> &Option<Value> {
    &self.meta
  }

  pub fn uses_dynamic_import(&self) -> bool {
    self.uses_dynamic_import
  }

  pub fn attributes(&self) -> &Vec<(String, String)> {
    &self.attributes
  }

  pub fn requests(&self) -> &Vec<Rc<ModuleRequest>> {
    &self.requests
  }

  pub fn indirect_export(&self, name: &str) -> Option<&IndirectExport> {
    self.indirect_exports.get(name)
  }

  pub fn indirect_export_names(&self) -> impl Iterator<Item = &String> {
    self.indirect_exports.keys()
  }

  pub fn star_exports(&self) -> &Vec<Rc<ModuleRequest>> {
    &self.star_exports
  }
}

rc_ptr!(ModuleDeclaration);
