use crate::module::instance::ModuleState;
use crate::tests::log::init as test_log_init;
use crate::tests::script::{ScriptHost, export_i64, module};
use crate::tests::watch::MockWatcher;

use std::rc::Rc;

#[cfg(test)]
mod test_identity {
  use super::*;

  #[tokio::test]
  async fn acquire_memoized1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///m.js", module().export_const("x", 1));
    let first = host.runtime().acquire("app:///m.js");
    let second = host.runtime().acquire("app:///m.js");
    assert!(Rc::ptr_eq(&first, &second));
  }

  #[tokio::test]
  async fn request_resolvers_share_controller1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///shared.js", module().export_const("x", 1));
    host.set("app:///a.js", module().import("./shared.js", &["x"]));
    host.set("app:///b.js", module().import("./shared.js", &["x"]));
    host.set(
      "app:///main.js",
      module().import("./a.js", &[]).import("./b.js", &[]),
    );
    host.boot("app:///main.js").await.unwrap();

    let a = host.runtime().lookup("app:///a.js").unwrap();
    let b = host.runtime().lookup("app:///b.js").unwrap();
    let via_a = a.current().unwrap().declaration().requests()[0]
      .module()
      .unwrap();
    let via_b = b.current().unwrap().declaration().requests()[0]
      .module()
      .unwrap();
    let (Some(via_a), Some(via_b)) =
      (via_a.reloadable().cloned(), via_b.reloadable().cloned())
    else {
      unreachable!()
    };
    assert!(Rc::ptr_eq(&via_a, &via_b));
    // One evaluation, no matter how many importers.
    assert_eq!(host.eval_count("app:///shared.js"), 1);
  }

  #[tokio::test]
  async fn watch_registered_on_first_acquire1() {
    test_log_init();
    let watcher = MockWatcher::create();
    let host = ScriptHost::with_watcher(Some(watcher.clone()));
    host.set("app:///m.js", module().export_const("x", 1));
    host.boot("app:///m.js").await.unwrap();
    assert_eq!(watcher.watched(), vec!["app:///m.js".to_string()]);
  }
}

#[cfg(test)]
mod test_load {
  use super::*;

  #[tokio::test]
  async fn idempotent_same_version1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///m.js", module().export_const("x", 1));
    let controller = host.load("app:///m.js").await.unwrap();
    let staged = controller.staging().unwrap();

    // Re-executing the same version must not replace the staging
    // instance.
    host.load("app:///m.js").await.unwrap();
    assert!(Rc::ptr_eq(&staged, &controller.staging().unwrap()));

    // A bumped version replaces it.
    controller.bump_version();
    host.load("app:///m.js").await.unwrap();
    assert!(!Rc::ptr_eq(&staged, &controller.staging().unwrap()));
  }
}

#[cfg(test)]
mod test_dispatch {
  use super::*;

  #[tokio::test]
  async fn chain_evaluates_post_order1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///b.js", module().export_const("b", 1));
    host.set(
      "app:///a.js",
      module().import("./b.js", &["b"]).export_computed("a", "b"),
    );
    host.set(
      "app:///main.js",
      module().import("./a.js", &["a"]).export_computed("m", "a"),
    );
    let main = host.boot("app:///main.js").await.unwrap();
    assert_eq!(
      host.journal(),
      vec!["eval:app:///b.js", "eval:app:///a.js", "eval:app:///main.js"]
    );
    assert_eq!(export_i64(&main, "m"), 1);
  }

  #[tokio::test]
  async fn cycle_evaluates_in_discovery_order1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set(
      "app:///a.js",
      module().export_const("a", 1).import("./b.js", &[]),
    );
    host.set(
      "app:///b.js",
      module()
        .import("./a.js", &["a"])
        .export_computed("b", "a"),
    );
    host.set("app:///main.js", module().import("./a.js", &[]));
    host.boot("app:///main.js").await.unwrap();
    assert_eq!(
      host.journal(),
      vec!["eval:app:///a.js", "eval:app:///b.js", "eval:app:///main.js"]
    );
    let b = host.runtime().lookup("app:///b.js").unwrap();
    assert_eq!(export_i64(&b, "b"), 1);
  }

  #[tokio::test]
  async fn concurrent_dispatch_shares_completion1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///slow.js", module().async_body().export_const("x", 1));
    let controller = host.load("app:///slow.js").await.unwrap();

    let first = controller.dispatch();
    // The first dispatch already started the async evaluation; the
    // second must piggyback on its completion.
    assert_eq!(
      controller.current().unwrap().state(),
      ModuleState::EvaluatingAsync
    );
    let second = controller.dispatch();
    let (a, b) = futures::join!(first.wait(), second.wait());
    a.unwrap();
    b.unwrap();
    assert_eq!(host.eval_count("app:///slow.js"), 1);
  }

  #[tokio::test]
  async fn dynamic_import_boots_subgraph1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///dyn.js", module().export_const("d", 4));
    host.set("app:///main.js", module().dynamic("app:///dyn.js"));
    let main = host.boot("app:///main.js").await.unwrap();

    assert!(
      host
        .journal()
        .contains(&"dyn:app:///main.js:app:///dyn.js".to_string())
    );
    assert_eq!(host.eval_count("app:///dyn.js"), 1);
    // The observed import is recorded on the instance.
    let records = main.current().unwrap().dynamic_imports();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].specifier, "app:///dyn.js");
  }
}
