use crate::host::{self, ManifestLoader};

use assert_fs::fixture::{FileWriteStr, PathChild};
use hotmod_core::module::controller::SlotSelector;
use hotmod_core::prelude::*;
use hotmod_core::runtime::{Runtime, RuntimeOptions};

#[cfg(test)]
mod test_boot {
  use super::*;

  async fn boot_graph(
    dir: &assert_fs::TempDir,
  ) -> (Runtime, hotmod_core::module::ModuleControllerRc) {
    let runtime = Runtime::new(
      ManifestLoader::create(),
      None,
      RuntimeOptions::default(),
    );
    let controller = host::boot(&runtime, dir.child("main.toml").path())
      .await
      .unwrap();
    controller.dispatch().wait().await.map_err(unshare_err).unwrap();
    (runtime, controller)
  }

  #[tokio::test]
  async fn manifest_graph_boots1() {
    let dir = assert_fs::TempDir::new().unwrap();
    dir
      .child("counter.toml")
      .write_str("[exports]\ncount = 41\n")
      .unwrap();
    dir
      .child("main.toml")
      .write_str(
        r#"
[[import]]
from = "./counter.toml"
names = ["count"]

[exports]
label = "display"

[copies]
shown = "count"

[hot]
accept = ["./counter.toml"]
"#,
      )
      .unwrap();

    let (_runtime, controller) = boot_graph(&dir).await;
    let namespace =
      controller.module_namespace(SlotSelector::Current).unwrap();
    let shown = namespace.get("shown").unwrap();
    let shown = shown.downcast_ref::<toml::Value>().unwrap();
    assert_eq!(shown.as_integer(), Some(41));
  }

  #[tokio::test]
  async fn manifest_update_roundtrip1() {
    let dir = assert_fs::TempDir::new().unwrap();
    dir
      .child("counter.toml")
      .write_str("[exports]\ncount = 1\n")
      .unwrap();
    dir
      .child("main.toml")
      .write_str(
        r#"
[[import]]
from = "./counter.toml"
names = ["count"]

[hot]
accept = ["./counter.toml"]
"#,
      )
      .unwrap();

    let (runtime, controller) = boot_graph(&dir).await;

    dir
      .child("counter.toml")
      .write_str("[exports]\ncount = 2\n")
      .unwrap();
    let counter_url = runtime
      .loader()
      .resolve(Some(controller.url()), "./counter.toml")
      .unwrap();
    runtime.reload(&counter_url).await.unwrap();
    let result = controller.request_update_result().await;
    assert!(matches!(
      result,
      hotmod_core::update::UpdateResult::Success { .. }
    ));

    let counter = runtime.lookup(&counter_url).unwrap();
    let namespace = counter.module_namespace(SlotSelector::Current).unwrap();
    let count = namespace.get("count").unwrap();
    let count = count.downcast_ref::<toml::Value>().unwrap();
    assert_eq!(count.as_integer(), Some(2));
  }
}
