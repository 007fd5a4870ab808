//! Adapter modules.
//!
//! An adapter wraps the namespace of a dependency the engine cannot
//! reload (a host built-in, an opaque foreign format). It answers
//! export resolution so reloadable modules may re-export through it,
//! but it never enters the dispatch graph: it is permanently
//! evaluated and its bindings never change.

use crate::module::ModuleUrl;
use crate::module::binding::{Getter, Value};
use crate::module::namespace::{ModuleNamespace, ResolvedExport};
use crate::prelude::*;
use crate::rc_ptr;

use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::rc::Rc;

pub struct AdapterModule {
  url: ModuleUrl,
  namespace: Rc<ModuleNamespace>,
  /// Memoized per-name getters so repeated resolutions hand out the
  /// same binding identity.
  getters: RefCell<HashMap<String, Getter>>,
  ns_getter: OnceCell<Getter>,
}

rc_ptr!(AdapterModule);

impl AdapterModule {
  /// Wrap a host namespace. `entries` are the exported names with
  /// their current values.
  pub fn new(url: ModuleUrl, entries: Vec<(String, Value)>) -> Self {
    let entries = entries
      .into_iter()
      .map(|(name, value)| {
        let getter: Getter = Rc::new(move || value.clone());
        (name, getter)
      })
      .collect();
    Self {
      url,
      namespace: Rc::new(ModuleNamespace::new(entries)),
      getters: RefCell::new(HashMap::new()),
      ns_getter: OnceCell::new(),
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn resolve_export(&self, name: &str) -> ResolvedExport {
    if let Some(getter) = self.getters.borrow().get(name) {
      return ResolvedExport::Found(getter.clone());
    }
    match self.namespace.getter(name) {
      Some(getter) => {
        self
          .getters
          .borrow_mut()
          .insert(name.to_string(), getter.clone());
        ResolvedExport::Found(getter)
      }
      None => ResolvedExport::Unresolved,
    }
  }

  pub fn exported_names(&self) -> Vec<String> {
    self.namespace.names().map(|n| n.to_string()).collect()
  }

  /// Thunk to the wrapped namespace object.
  pub fn namespace(&self) -> Rc<ModuleNamespace> {
    self.namespace.clone()
  }

  /// Memoized getter handing out the namespace object, one identity
  /// per adapter.
  pub fn namespace_getter(&self) -> Getter {
    self
      .ns_getter
      .get_or_init(|| {
        let namespace = self.namespace.clone();
        Rc::new(move || {
          let value: Value = namespace.clone();
          value
        })
      })
      .clone()
  }
}

impl std::fmt::Debug for AdapterModule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AdapterModule").field("url", &self.url).finish()
  }
}
