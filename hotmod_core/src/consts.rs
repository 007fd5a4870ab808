//! Constants.

use std::time::Duration;

/// Environment variable that controls the logging level.
pub const HOTMOD_LOG: &str = "HOTMOD_LOG";

/// Trailing-edge coalescing window for file-change driven updates.
///
/// All watch events arriving within this window produce a single
/// update run.
pub const UPDATE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Window inside which the filesystem watcher suppresses duplicate
/// change events for the same path (editors fire several mtime
/// events per save).
pub const WATCH_DEDUPE: Duration = Duration::from_millis(20);

/// The export name that star re-exports never provide.
pub const DEFAULT_EXPORT: &str = "default";
