//! Reloadable module graph runner.

use hotmod_cli::host::{self, ManifestLoader};
use hotmod_core::cli::CliOptions;
use hotmod_core::prelude::*;
use hotmod_core::runtime::{Runtime, RuntimeOptions};
use hotmod_core::watch::{FsWatcher, ModuleWatcher};

use log::debug;
use std::path::Path;
use std::rc::Rc;

const USAGE: &str = "\
hotmod - run a directory of module manifests as a live module graph

USAGE:
  hotmod [OPTIONS] <entry.toml>

OPTIONS:
  --headless     Boot once and exit instead of watching for changes
  -V, --version  Print version
  -h, --help     Print help
";

fn main() -> AnyResult<()> {
  let opts = match CliOptions::from_env() {
    Ok(opts) => opts,
    Err(e) => {
      eprintln!("{e}");
      eprintln!("{USAGE}");
      std::process::exit(2);
    }
  };

  if opts.version() {
    println!("hotmod {}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }
  if opts.help() {
    println!("{USAGE}");
    return Ok(());
  }
  let Some(entry) = opts.entry().map(Path::to_path_buf) else {
    eprintln!("{USAGE}");
    std::process::exit(2);
  };

  hotmod_core::log::init()?;
  debug!("opts: {:?}", opts);

  let tokio_runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;
  let local = tokio::task::LocalSet::new();
  local.block_on(&tokio_runtime, async move {
    let watcher: Option<Rc<dyn ModuleWatcher>> = if opts.headless() {
      None
    } else {
      Some(FsWatcher::create()?)
    };
    let runtime = Runtime::new(
      ManifestLoader::create(),
      watcher,
      RuntimeOptions::default(),
    );

    let controller = host::boot(&runtime, &entry).await?;
    if opts.headless() {
      controller.dispatch().wait().await.map_err(unshare_err)?;
      return Ok(());
    }

    controller.main().await?;
    println!("watching module graph rooted at {:?}", controller.url());
    tokio::signal::ctrl_c().await?;
    Ok(())
  })
}
