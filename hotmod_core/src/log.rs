//! Logging utils.

use crate::consts::HOTMOD_LOG;
use crate::prelude::*;

use anyhow::Context;
use std::path::Path;

/// Initialize logging to stderr.
///
/// The level comes from the `HOTMOD_LOG` environment variable (an
/// `env_filter` spec, defaults to `error`). Records go to stderr so
/// module output and update reports stay separable on stdout.
pub fn init() -> AnyResult<()> {
  dispatch().chain(std::io::stderr()).apply()?;
  Ok(())
}

/// Initialize logging into an append-only file, for long-running
/// watch sessions whose terminal should stay quiet.
pub fn init_file(path: &Path) -> AnyResult<()> {
  let sink = fern::log_file(path)
    .with_context(|| format!("cannot open log file {path:?}"))?;
  dispatch().chain(sink).apply()?;
  Ok(())
}

fn dispatch() -> fern::Dispatch {
  let filter = env_filter::Builder::from_env(HOTMOD_LOG).build();
  fern::Dispatch::new()
    .filter(move |metadata| filter.enabled(metadata))
    .format(|out, message, record| {
      out.finish(format_args!(
        "{} {:<5} {} | {}",
        jiff::Zoned::now().strftime("%H:%M:%S%.3f"),
        record.level(),
        record.target(),
        message
      ))
    })
}
