//! Module body protocol.
//!
//! The host's source transform rewrites every module into a body the
//! engine can pause and resume. Languages with generators express this
//! as a generator that first yields `[replaceImports, exports]` and is
//! then resumed to run the original module code. Here the same
//! contract is a builder: [`ModuleBody::start`] publishes the export
//! getters and the import rewiring hook, and hands back a one-shot
//! resume closure that runs the body to completion, synchronously or
//! as a future for top-level await.

use crate::future::Step;
use crate::hot::HotRc;
use crate::module::binding::{Getter, Imports, Value};
use crate::prelude::*;

use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// Rewire the imported-binding holders. Called once at link and again
/// whenever an update relinks live bindings, the body re-reads values
/// through the holders without re-executing.
pub type ReplaceImports = Rc<dyn Fn(&Imports)>;

/// Run the original module code to completion.
pub type BodyResume = Box<dyn FnOnce() -> Step<AnyResult<()>>>;

/// Cleanup entry point, invoked when an instance unlinks before its
/// body ever ran (the generator's `return`).
pub type BodyCleanup = Box<dyn FnOnce()>;

/// Host dynamic import, installed into the body context so `import()`
/// expressions inside the body route through the engine.
pub type DynamicImport =
  Rc<dyn Fn(String) -> LocalBoxFuture<'static, AnyResult<Value>>>;

/// What a started body publishes before evaluation.
pub struct BodyStart {
  /// Local export name to live getter.
  pub exports: Vec<(String, Getter)>,
  pub replace_imports: ReplaceImports,
  pub resume: BodyResume,
  pub cleanup: Option<BodyCleanup>,
}

/// Everything a body can reach besides its own scope: the import-meta
/// payload, the HMR surface, and dynamic import.
pub struct BodyContext {
  pub meta: Option<Value>,
  pub hot: HotRc,
  pub dynamic_import: DynamicImport,
}

/// One source version's executable form.
pub trait ModuleBody {
  /// Start the body: publish exports and pause before evaluation.
  fn start(&self, ctx: &BodyContext) -> AnyResult<BodyStart>;
}
