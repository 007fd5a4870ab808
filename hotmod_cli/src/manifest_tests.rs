use crate::manifest::ModuleManifest;

#[cfg(test)]
mod test_parse {
  use super::*;

  #[test]
  fn full_manifest1() {
    let manifest = ModuleManifest::parse(
      r#"
[[import]]
from = "./counter.toml"
names = ["count"]

[[import]]
from = "./style.toml"
namespace = "style"
reexport = ["theme"]
star = true

[exports]
label = "display"
width = 80

[copies]
shown = "count"

[hot]
accept = ["./counter.toml"]
accept-self = true
"#,
    )
    .unwrap();

    assert_eq!(manifest.import.len(), 2);
    assert_eq!(manifest.import[0].from, "./counter.toml");
    assert_eq!(manifest.import[0].names, vec!["count"]);
    assert_eq!(manifest.import[1].namespace.as_deref(), Some("style"));
    assert_eq!(manifest.import[1].reexport, vec!["theme"]);
    assert!(manifest.import[1].star);
    assert_eq!(manifest.exports.len(), 2);
    assert_eq!(manifest.copies.get("shown").map(String::as_str), Some("count"));
    assert_eq!(manifest.hot.accept, vec!["./counter.toml"]);
    assert!(manifest.hot.accept_self);
    assert!(!manifest.hot.decline);
  }

  #[test]
  fn empty_manifest1() {
    let manifest = ModuleManifest::parse("").unwrap();
    assert!(manifest.import.is_empty());
    assert!(manifest.exports.is_empty());
    assert!(!manifest.hot.accept_self);
  }

  #[test]
  fn unknown_keys_rejected1() {
    assert!(ModuleManifest::parse("[wat]\nx = 1\n").is_err());
  }
}
