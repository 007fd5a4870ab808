//! Host loader hooks.
//!
//! The engine never fetches or parses source itself. The host resolves
//! specifiers and executes transformed module top levels; executing a
//! transformed module calls back into
//! [`load`](crate::module::controller::ModuleController::load), which
//! is how declarations reach the engine.

use crate::module::ModuleUrl;
use crate::module::adapter::AdapterModuleRc;
use crate::module::controller::ModuleControllerRc;
use crate::prelude::*;
use crate::runtime::Runtime;

use futures::future::LocalBoxFuture;

/// One fetch of one module version.
#[derive(Debug, Clone)]
pub struct LoadRequest {
  pub url: ModuleUrl,
  /// Monotonically increasing reload counter. The host must treat two
  /// distinct versions as distinct cache entries so changed source is
  /// re-parsed.
  pub version: u64,
  pub attributes: Vec<(String, String)>,
}

impl LoadRequest {
  /// The cache-busting form of the URL handed to the host importer.
  pub fn cache_busting_url(&self) -> ModuleUrl {
    if self.version == 0 {
      return self.url.clone();
    }
    let sep = if self.url.contains('?') { '&' } else { '?' };
    format!("{}{}version={}", self.url, sep, self.version)
  }
}

/// What a fetch produced: a reloadable controller whose `load` ran, or
/// an immutable adapter view of a foreign module.
pub enum LoadedModule {
  Reloadable(ModuleControllerRc),
  Adapter(AdapterModuleRc),
}

/// Defines the interface of a module loader.
pub trait ModuleLoader {
  /// Resolve a specifier against an importing module's URL.
  fn resolve(&self, base: Option<&str>, specifier: &str)
  -> AnyResult<ModuleUrl>;

  /// Fetch, transform and execute the module for `request`. The
  /// transformed top level is expected to call `acquire(url).load(..)`
  /// before this future settles.
  fn fetch(
    &self,
    runtime: &Runtime,
    request: &LoadRequest,
  ) -> LocalBoxFuture<'static, AnyResult<LoadedModule>>;
}
