//! Command line options.

use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
/// Options for the `hotmod` binary: one entry manifest and a few
/// switches.
pub struct CliOptions {
  version: bool,
  help: bool,
  headless: bool,
  entry: Option<PathBuf>,
}

fn parse(mut parser: lexopt::Parser) -> Result<CliOptions, lexopt::Error> {
  use lexopt::prelude::*;

  let mut opts = CliOptions::default();
  while let Some(arg) = parser.next()? {
    match arg {
      Short('V') | Long("version") => {
        opts.version = true;
      }
      Short('h') | Long("help") => {
        opts.help = true;
      }
      Long("headless") => {
        opts.headless = true;
      }
      Value(path) if opts.entry.is_none() => {
        opts.entry = Some(PathBuf::from(path));
      }
      // A graph has exactly one entry.
      Value(extra) => {
        return Err(lexopt::Error::UnexpectedArgument(extra));
      }
      _ => return Err(arg.unexpected()),
    }
  }
  Ok(opts)
}

impl CliOptions {
  pub fn from_env() -> Result<Self, lexopt::Error> {
    parse(lexopt::Parser::from_env())
  }

  pub fn from_args<I>(args: I) -> Result<Self, lexopt::Error>
  where
    I: IntoIterator,
    I::Item: Into<OsString>,
  {
    parse(lexopt::Parser::from_args(args))
  }

  pub fn version(&self) -> bool {
    self.version
  }

  pub fn help(&self) -> bool {
    self.help
  }

  /// Headless mode: boot the graph once and exit instead of watching.
  pub fn headless(&self) -> bool {
    self.headless
  }

  /// The entry module manifest.
  pub fn entry(&self) -> Option<&Path> {
    self.entry.as_deref()
  }
}
