use crate::cli::CliOptions;
use crate::tests::log::init as test_log_init;

use std::path::Path;

#[cfg(test)]
mod test_parse {
  use super::*;

  #[test]
  fn defaults1() {
    test_log_init();
    let opts = CliOptions::from_args(Vec::<String>::new()).unwrap();
    assert!(!opts.headless());
    assert!(!opts.version());
    assert!(!opts.help());
    assert!(opts.entry().is_none());
  }

  #[test]
  fn entry_and_flags1() {
    test_log_init();
    let opts =
      CliOptions::from_args(vec!["--headless", "graph/main.toml"]).unwrap();
    assert!(opts.headless());
    assert_eq!(opts.entry(), Some(Path::new("graph/main.toml")));
  }

  #[test]
  fn special1() {
    test_log_init();
    let opts = CliOptions::from_args(vec!["-V"]).unwrap();
    assert!(opts.version());
    let opts = CliOptions::from_args(vec!["--help"]).unwrap();
    assert!(opts.help());
    let opts = CliOptions::from_args(vec!["-h"]).unwrap();
    assert!(opts.help());
  }

  #[test]
  fn one_entry_only1() {
    test_log_init();
    assert!(
      CliOptions::from_args(vec!["main.toml", "other.toml"]).is_err()
    );
  }

  #[test]
  fn unknown_flag1() {
    test_log_init();
    assert!(CliOptions::from_args(vec!["--frobnicate"]).is_err());
  }
}
