//! Reloadable ES modules.
//!
//! Every reloadable module lives behind a [`ModuleController`], the
//! per-URL identity that survives source changes. One evaluation of
//! one source version is a [`ModuleInstance`] built from an immutable
//! [`ModuleDeclaration`]. Swapping a module in place means installing
//! a fresh instance into the controller while dependents keep their
//! controller references, live bindings are rewired through getters
//! instead of re-executing dependent bodies.

// Re-export
pub use adapter::*;
pub use binding::*;
pub use body::*;
pub use controller::*;
pub use declaration::*;
pub use instance::*;
pub use namespace::*;

pub mod adapter;
pub mod binding;
pub mod body;
pub mod controller;
pub mod declaration;
pub mod instance;
pub mod namespace;

#[cfg(test)]
mod controller_tests;

/// Stable module URL, the identity key of a controller.
pub type ModuleUrl = String;
