//! Module manifests.
//!
//! A manifest is the declarative stand-in for a transformed source
//! file: constant exports, imports, re-exports and HMR registrations.
//!
//! ```toml
//! [[import]]
//! from = "./counter.toml"
//! names = ["count"]
//!
//! [exports]
//! label = "display"
//!
//! [copies]
//! shown = "count"
//!
//! [hot]
//! accept = ["./counter.toml"]
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ModuleManifest {
  /// Static imports, in order.
  #[serde(default)]
  pub import: Vec<ImportManifest>,
  /// Constant exports: name to TOML value.
  #[serde(default)]
  pub exports: BTreeMap<String, toml::Value>,
  /// Exports copied from imported bindings at evaluation time:
  /// exported name to imported local name.
  #[serde(default)]
  pub copies: BTreeMap<String, String>,
  #[serde(default)]
  pub hot: HotManifest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportManifest {
  /// Specifier relative to the importing manifest.
  pub from: String,
  /// `import { name }` bindings.
  #[serde(default)]
  pub names: Vec<String>,
  /// `import * as <local>`.
  #[serde(default)]
  pub namespace: Option<String>,
  /// `export { name } from`.
  #[serde(default)]
  pub reexport: Vec<String>,
  /// `export * from`.
  #[serde(default)]
  pub star: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HotManifest {
  /// One accept group covering these imports.
  #[serde(default)]
  pub accept: Vec<String>,
  #[serde(default)]
  pub accept_self: bool,
  #[serde(default)]
  pub decline: bool,
}

impl ModuleManifest {
  pub fn parse(source: &str) -> Result<Self, toml::de::Error> {
    toml::from_str(source)
  }
}
