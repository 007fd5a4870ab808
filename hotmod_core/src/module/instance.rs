//! Module instances.

use crate::future::Step;
use crate::hot::HotRc;
use crate::module::ModuleUrl;
use crate::module::binding::{Getter, ImportBinding, Imports, ModuleRef};
use crate::module::body::{
  BodyCleanup, BodyContext, BodyResume, BodyStart, ReplaceImports,
};
use crate::module::controller::SlotSelector;
use crate::module::declaration::ModuleDeclarationRc;
use crate::module::namespace::{ModuleNamespace, ResolvedExport};
use crate::prelude::*;
use crate::rc_ptr;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use futures::future::Shared;
use log::trace;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Instance lifecycle.
///
/// ```text
/// new -> linking -> linked -> evaluating -> evaluated
///                       \-> evaluating-async -^
/// ```
///
/// `evaluated` is terminal; the only way back to `new` is an explicit
/// unlink, which also runs the body's cleanup entry point.
pub enum ModuleState {
  New,
  Linking,
  Linked,
  Evaluating,
  EvaluatingAsync,
  Evaluated,
}

/// Completion of an `evaluating-async` instance, shared between every
/// dispatch awaiting it.
pub type EvaluateFuture = Shared<LocalBoxFuture<'static, SharedResult<()>>>;

/// The live environment of a started body: export getters on one side,
/// the import rewiring hook on the other.
pub struct Environment {
  exports: HashMap<String, Getter>,
  export_order: Vec<String>,
  replace_imports: ReplaceImports,
  resume: RefCell<Option<BodyResume>>,
  cleanup: RefCell<Option<BodyCleanup>>,
}

impl Environment {
  fn new(start: BodyStart) -> Self {
    let mut exports = HashMap::new();
    let mut export_order = vec![];
    for (name, getter) in start.exports {
      if !exports.contains_key(&name) {
        export_order.push(name.clone());
      }
      exports.insert(name, getter);
    }
    Self {
      exports,
      export_order,
      replace_imports: start.replace_imports,
      resume: RefCell::new(Some(start.resume)),
      cleanup: RefCell::new(start.cleanup),
    }
  }

  pub fn has_export(&self, name: &str) -> bool {
    self.exports.contains_key(name)
  }

  pub fn export_names(&self) -> Vec<String> {
    self.export_order.clone()
  }

  pub fn export_getter(&self, name: &str) -> Option<Getter> {
    self.exports.get(name).cloned()
  }

  pub fn replace_imports(&self, imports: &Imports) {
    (self.replace_imports)(imports);
  }
}

/// A dynamic import observed while the body evaluated.
#[derive(Debug, Clone)]
pub struct DynamicImportRecord {
  pub specifier: String,
  pub module: ModuleRef,
}

/// One evaluation of one declaration.
pub struct ModuleInstance {
  url: ModuleUrl,
  me: ModuleInstanceWk,
  declaration: ModuleDeclarationRc,
  state: Cell<ModuleState>,
  environment: RefCell<Option<Rc<Environment>>>,
  namespace: RefCell<Option<Rc<ModuleNamespace>>>,
  hot: RefCell<Option<HotRc>>,
  dynamic_imports: RefCell<Vec<DynamicImportRecord>>,
  error: RefCell<Option<SharedErr>>,
  completion: RefCell<Option<EvaluateFuture>>,
}

rc_ptr!(ModuleInstance);

impl ModuleInstance {
  pub fn new(url: ModuleUrl, declaration: ModuleDeclarationRc) -> ModuleInstanceRc {
    Rc::new_cyclic(|me| Self {
      url,
      me: me.clone(),
      declaration,
      state: Cell::new(ModuleState::New),
      environment: RefCell::new(None),
      namespace: RefCell::new(None),
      hot: RefCell::new(None),
      dynamic_imports: RefCell::new(vec![]),
      error: RefCell::new(None),
      completion: RefCell::new(None),
    })
  }

  /// A fresh, not-yet-started instance of the same declaration, used
  /// for re-evaluation and for link testing.
  pub fn clone_fresh(&self) -> ModuleInstanceRc {
    ModuleInstance::new(self.url.clone(), self.declaration.clone())
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn state(&self) -> ModuleState {
    self.state.get()
  }

  pub fn declaration(&self) -> &ModuleDeclarationRc {
    &self.declaration
  }

  pub fn environment(&self) -> Option<Rc<Environment>> {
    self.environment.borrow().clone()
  }

  pub fn hot(&self) -> Option<HotRc> {
    self.hot.borrow().clone()
  }

  pub fn cached_namespace(&self) -> Option<Rc<ModuleNamespace>> {
    self.namespace.borrow().clone()
  }

  pub fn cache_namespace(&self, namespace: Rc<ModuleNamespace>) {
    self.namespace.borrow_mut().replace(namespace);
  }

  pub fn dynamic_imports(&self) -> Vec<DynamicImportRecord> {
    self.dynamic_imports.borrow().clone()
  }

  pub fn record_dynamic_import(&self, specifier: String, module: ModuleRef) {
    self
      .dynamic_imports
      .borrow_mut()
      .push(DynamicImportRecord { specifier, module });
  }

  pub fn error(&self) -> Option<SharedErr> {
    self.error.borrow().clone()
  }

  pub fn is_evaluated(&self) -> bool {
    self.state.get() == ModuleState::Evaluated
  }

  pub fn evaluation_result(&self) -> SharedResult<()> {
    match self.error() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  /// Start the body: publish exports, install the HMR surface. The
  /// instance moves `new -> linking` and pauses before imports are
  /// delivered.
  pub fn instantiate(&self, ctx: BodyContext) -> AnyResult<()> {
    debug_assert_eq!(self.state.get(), ModuleState::New);
    let start = self.declaration.body().start(&ctx)?;
    self.hot.borrow_mut().replace(ctx.hot.clone());
    self
      .environment
      .borrow_mut()
      .replace(Rc::new(Environment::new(start)));
    self.state.set(ModuleState::Linking);
    trace!("|instance| {:?} instantiated", self.url);
    Ok(())
  }

  /// Deliver imports: resolve every requested binding against the
  /// neighbors chosen by `sel` and hand the getters to the body.
  ///
  /// First link moves `linking -> linked`. Relinking an evaluated
  /// instance rewires its live bindings without re-executing the body.
  /// A failed link leaves the instance unlinkable back to `new` so a
  /// later update can retry.
  pub fn link(&self, sel: SlotSelector) -> AnyResult<()> {
    let environment = match self.environment() {
      Some(environment) => environment,
      None => anyhow::bail!(TheErr::NotLoaded(self.url.clone())),
    };

    let mut imports: Imports = HashMap::new();
    for request in self.declaration.requests() {
      let module = request.module()?;
      for binding in request.bindings() {
        match binding {
          ImportBinding::Named { name, local } => {
            match module.resolve_export(name, &mut vec![], sel)? {
              ResolvedExport::Found(getter) => {
                imports.insert(local.clone(), getter);
              }
              ResolvedExport::Unresolved => {
                anyhow::bail!(TheErr::MissingExport(
                  request.specifier().to_string(),
                  name.clone(),
                ));
              }
              ResolvedExport::Ambiguous => {
                anyhow::bail!(TheErr::AmbiguousExport(
                  request.specifier().to_string(),
                  name.clone(),
                ));
              }
            }
          }
          ImportBinding::Namespace { local } => {
            imports.insert(local.clone(), module.namespace_getter(sel)?);
          }
          // Re-export bindings never bind locally, they only steer
          // `resolve_export`.
          ImportBinding::IndirectExport { .. }
          | ImportBinding::IndirectStarExport { .. }
          | ImportBinding::StarExport => {}
        }
      }
    }

    // A module whose star chain only ever points back at itself can
    // never settle its exported names.
    for request in self.declaration.star_exports() {
      if request.module()?.url() == self.url {
        anyhow::bail!(TheErr::CyclicStarExport(self.url.clone()));
      }
    }

    environment.replace_imports(&imports);
    if self.state.get() == ModuleState::Linking {
      self.state.set(ModuleState::Linked);
    }
    trace!("|instance| {:?} linked ({:?})", self.url, sel);
    Ok(())
  }

  /// Run the body to completion. Idempotent: an evaluated instance
  /// reports its recorded outcome, an `evaluating-async` instance
  /// hands back its in-flight completion.
  pub fn evaluate(&self) -> Step<SharedResult<()>> {
    match self.state.get() {
      ModuleState::Evaluated => Step::Ready(self.evaluation_result()),
      ModuleState::EvaluatingAsync => {
        let completion = self.completion.borrow().clone().unwrap();
        Step::pending(completion)
      }
      ModuleState::Linked => {
        let environment = self.environment().unwrap();
        let resume = environment.resume.borrow_mut().take().unwrap();
        self.state.set(ModuleState::Evaluating);
        match resume() {
          Step::Ready(Ok(())) => {
            self.state.set(ModuleState::Evaluated);
            trace!("|instance| {:?} evaluated", self.url);
            Step::Ready(Ok(()))
          }
          Step::Ready(Err(e)) => {
            let e = share_err(e);
            self.state.set(ModuleState::Evaluated);
            self.error.borrow_mut().replace(e.clone());
            Step::Ready(Err(e))
          }
          Step::Pending(fut) => {
            self.state.set(ModuleState::EvaluatingAsync);
            let this = self.me.upgrade().unwrap();
            let completion: EvaluateFuture = async move {
              let result = fut.await;
              this.state.set(ModuleState::Evaluated);
              match result {
                Ok(()) => {
                  trace!("|instance| {:?} evaluated (async)", this.url);
                  Ok(())
                }
                Err(e) => {
                  let e = share_err(e);
                  this.error.borrow_mut().replace(e.clone());
                  Err(e)
                }
              }
            }
            .boxed_local()
            .shared();
            self.completion.borrow_mut().replace(completion.clone());
            Step::pending(completion)
          }
        }
      }
      state => unreachable!("evaluate in state {state:?}"),
    }
  }

  /// Tear the instance back down to `new`. A body that never ran gets
  /// its cleanup entry point invoked (the generator's `return`).
  pub fn unlink(&self) {
    if let Some(environment) = self.environment.borrow_mut().take() {
      // A paused body never ran; give it its cleanup call.
      if environment.resume.borrow_mut().take().is_some() {
        if let Some(cleanup) = environment.cleanup.borrow_mut().take() {
          cleanup();
        }
      }
    }
    self.state.set(ModuleState::New);
    self.namespace.borrow_mut().take();
    self.hot.borrow_mut().take();
    self.error.borrow_mut().take();
    self.completion.borrow_mut().take();
    self.dynamic_imports.borrow_mut().clear();
    trace!("|instance| {:?} unlinked", self.url);
  }
}

impl std::fmt::Debug for ModuleInstance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModuleInstance")
      .field("url", &self.url)
      .field("state", &self.state.get())
      .finish()
  }
}

/// Evaluate `instances` strictly in order, each awaited before the
/// next begins. Stays synchronous while every body completes inline.
pub(crate) fn evaluate_in_order(
  instances: Vec<ModuleInstanceRc>,
) -> Step<SharedResult<()>> {
  let mut queue = instances.into_iter();
  while let Some(instance) = queue.next() {
    match instance.evaluate() {
      Step::Ready(Ok(())) => continue,
      Step::Ready(Err(e)) => return Step::Ready(Err(e)),
      Step::Pending(fut) => {
        // The first pending body flips the rest of the component onto
        // the asynchronous path, order preserved.
        let rest: Vec<ModuleInstanceRc> = queue.collect();
        return Step::pending(async move {
          fut.await?;
          for instance in rest {
            instance.evaluate().wait().await?;
          }
          Ok(())
        });
      }
    }
  }
  Step::Ready(Ok(()))
}
