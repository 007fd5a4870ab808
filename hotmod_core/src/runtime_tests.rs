use crate::tests::log::init as test_log_init;
use crate::tests::script::{ScriptHost, module};
use crate::tests::watch::MockWatcher;
use crate::update::UpdateResult;

use std::time::Duration;

#[cfg(test)]
mod test_reload {
  use super::*;

  #[tokio::test]
  async fn reload_installs_staging1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///m.js", module().export_const("x", 1));
    let controller = host.boot("app:///m.js").await.unwrap();
    assert!(controller.staging().is_none());

    host.set("app:///m.js", module().export_const("x", 2));
    host.runtime().reload("app:///m.js").await.unwrap();
    assert!(controller.staging().is_some());
    assert_eq!(controller.version(), 1);
  }

  #[tokio::test]
  async fn reload_missing_source_fails1() {
    test_log_init();
    let host = ScriptHost::new();
    let e = host.runtime().reload("app:///nope.js").await.unwrap_err();
    assert!(e.to_string().contains("not found"));
  }
}

#[cfg(test)]
mod test_scheduler {
  use super::*;

  /// Wait until the journal settles on `predicate` or give up.
  async fn wait_for<F>(host: &ScriptHost, predicate: F)
  where
    F: Fn(&ScriptHost) -> bool,
  {
    for _ in 0..200 {
      if predicate(host) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached, journal: {:?}", host.journal());
  }

  #[tokio::test(start_paused = true)]
  async fn coalesced_watch_events_run_one_update1() {
    test_log_init();
    let local = tokio::task::LocalSet::new();
    local
      .run_until(async {
        let watcher = MockWatcher::create();
        let host = ScriptHost::with_watcher(Some(watcher.clone()));
        host.set("app:///child.js", module().export_const("c", 1));
        host.set(
          "app:///main.js",
          module()
            .import("./child.js", &["c"])
            .accept(&["./child.js"]),
        );
        let main = host.load("app:///main.js").await.unwrap();
        main.main().await.unwrap();
        host.take_journal();

        // One save burst: several watch events inside the window.
        host.set("app:///child.js", module().export_const("c", 2));
        watcher.fire("app:///child.js");
        watcher.fire("app:///child.js");
        watcher.fire("app:///child.js");

        wait_for(&host, |host| host.eval_count("app:///child.js") > 0)
          .await;
        // Coalesced: the burst produced exactly one refetch and one
        // dispatch.
        assert_eq!(host.eval_count("app:///child.js"), 1);
        assert_eq!(host.import_value("app:///main.js", "c"), Some(2));
      })
      .await;
  }

  #[tokio::test(start_paused = true)]
  async fn separate_bursts_run_separate_updates1() {
    test_log_init();
    let local = tokio::task::LocalSet::new();
    local
      .run_until(async {
        let watcher = MockWatcher::create();
        let host = ScriptHost::with_watcher(Some(watcher.clone()));
        host.set("app:///child.js", module().export_const("c", 1));
        host.set(
          "app:///main.js",
          module()
            .import("./child.js", &["c"])
            .accept(&["./child.js"]),
        );
        let main = host.load("app:///main.js").await.unwrap();
        main.main().await.unwrap();
        host.take_journal();

        host.set("app:///child.js", module().export_const("c", 2));
        watcher.fire("app:///child.js");
        wait_for(&host, |host| host.eval_count("app:///child.js") == 1)
          .await;

        host.set("app:///child.js", module().export_const("c", 3));
        watcher.fire("app:///child.js");
        wait_for(&host, |host| host.eval_count("app:///child.js") == 2)
          .await;
        assert_eq!(host.import_value("app:///main.js", "c"), Some(3));
      })
      .await;
  }

  #[tokio::test]
  async fn overlapping_requests_serialize1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set(
      "app:///m.js",
      module().async_body().export_const("x", 1).accept_self(),
    );
    let main = host.boot("app:///m.js").await.unwrap();

    host
      .update(
        "app:///m.js",
        module().async_body().export_const("x", 2).accept_self(),
      )
      .await
      .unwrap();
    // Two concurrent requests: the second waits for the first and then
    // finds nothing left to do.
    let (first, second) = futures::join!(
      main.request_update_result(),
      main.request_update_result()
    );
    let outcomes = [
      matches!(first, UpdateResult::Success { .. }),
      matches!(second, UpdateResult::Success { .. }),
    ];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(host.eval_count("app:///m.js"), 2);
  }
}
