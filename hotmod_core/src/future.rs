//! Sync/async unified completions.
//!
//! Module bodies come in two flavors: plain ones that finish
//! synchronously, and ones using top-level await whose evaluation is a
//! future. [`Step`] carries either outcome through the same code
//! paths, so a fully synchronous subgraph completes without touching
//! the executor at all.

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::future::Future;

/// A completion that is either already available or still pending.
///
/// All pending futures are `!Send`, the engine is pinned to one
/// logical executor.
pub enum Step<T> {
  Ready(T),
  Pending(LocalBoxFuture<'static, T>),
}

impl<T: 'static> Step<T> {
  pub fn ready(value: T) -> Self {
    Step::Ready(value)
  }

  pub fn pending<F>(fut: F) -> Self
  where
    F: Future<Output = T> + 'static,
  {
    Step::Pending(fut.boxed_local())
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, Step::Ready(_))
  }

  /// Drive the step to completion, awaiting only if it is pending.
  pub async fn wait(self) -> T {
    match self {
      Step::Ready(value) => value,
      Step::Pending(fut) => fut.await,
    }
  }

  /// Apply `f` to the eventual value, without forcing a ready step
  /// into a future.
  pub fn map<U, F>(self, f: F) -> Step<U>
  where
    U: 'static,
    F: FnOnce(T) -> U + 'static,
  {
    match self {
      Step::Ready(value) => Step::Ready(f(value)),
      Step::Pending(fut) => Step::Pending(fut.map(f).boxed_local()),
    }
  }

  pub fn boxed(self) -> LocalBoxFuture<'static, T> {
    match self {
      Step::Ready(value) => async move { value }.boxed_local(),
      Step::Pending(fut) => fut,
    }
  }
}

impl<T: 'static> From<T> for Step<T> {
  fn from(value: T) -> Self {
    Step::Ready(value)
  }
}
