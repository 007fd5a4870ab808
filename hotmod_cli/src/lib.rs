//! Command line host for the hotmod module engine.
//!
//! Runs a directory of declarative TOML module manifests as a live,
//! reloadable module graph: edit a manifest on disk and watch the
//! engine swap it in place.

pub mod host;
pub mod manifest;

#[cfg(test)]
mod host_tests;
#[cfg(test)]
mod manifest_tests;
