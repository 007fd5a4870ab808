//! Loggings for testing.
//!
//! NOTE: This module should only be used in unit tests, not some where
//! else.

use std::sync::Once;

/// Initialize stderr logging once across the whole test binary.
pub fn init() {
  static INITIALIZED: Once = Once::new();
  INITIALIZED.call_once(|| {
    crate::log::init().unwrap();
  });
}
