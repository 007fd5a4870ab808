//! Errors and results.

use std::rc::Rc;

// anyhow {

/// [`anyhow::Error`]
pub type AnyErr = anyhow::Error;

/// [`anyhow::Result`] with `T` if ok, [`AnyErr`]([`anyhow::Error`]) if error.
pub type AnyResult<T> = anyhow::Result<T>;

/// Shared [`AnyErr`], for errors observed from more than one place (an
/// evaluation error is reported to every waiter of the same instance).
pub type SharedErr = Rc<AnyErr>;

/// [`Result`] with `T` if ok, [`SharedErr`] if error.
pub type SharedResult<T> = Result<T, SharedErr>;

pub fn share_err(e: AnyErr) -> SharedErr {
  Rc::new(e)
}

/// Recover an owned error from a shared one. Falls back to a message
/// clone when other holders are still alive.
pub fn unshare_err(e: SharedErr) -> AnyErr {
  Rc::try_unwrap(e).unwrap_or_else(|e| anyhow::anyhow!("{e:#}"))
}

// anyhow }

// std::io {

/// [`std::io::Error`]
pub type IoErr = std::io::Error;

/// [`std::io::Result`] with `T` if ok.
pub type IoResult<T> = std::io::Result<T>;

// std::io }

// thiserror {

/// All error codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TheErr {
  #[error("module {0:?} does not provide an export named {1:?}")]
  MissingExport(String, String),
  #[error("conflicting star exports for {1:?} in {0:?}")]
  AmbiguousExport(String, String),
  #[error("module {0:?} star re-exports itself")]
  CyclicStarExport(String),
  #[error("module {0:?} has not been loaded")]
  NotLoaded(String),
  #[error("module specifier not found: {0:?}")]
  UnresolvedSpecifier(String),
  #[error("Error: {0}")]
  Message(String),
}

/// [`Result`] with `T` if ok, [`TheErr`] if error.
pub type TheResult<T> = Result<T, TheErr>;

// thiserror }
