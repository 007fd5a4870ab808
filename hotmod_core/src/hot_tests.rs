use crate::tests::log::init as test_log_init;
use crate::tests::script::{ScriptHost, module};
use crate::update::UpdateResult;

#[cfg(test)]
mod test_accept_groups {
  use super::*;

  #[tokio::test]
  async fn unknown_specifier_group_dropped1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///child.js", module().export_const("c", 1));
    host.set(
      "app:///main.js",
      module()
        .import("./child.js", &["c"])
        // The specifier matches nothing, the group must not count.
        .accept(&["./elsewhere.js"]),
    );
    let main = host.boot("app:///main.js").await.unwrap();

    host
      .update("app:///child.js", module().export_const("c", 2))
      .await
      .unwrap();
    let result = main.request_update_result().await;
    assert!(matches!(result, UpdateResult::Unaccepted { .. }));
  }

  #[tokio::test]
  async fn accept_callbacks_run_in_registration_order1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///a.js", module().export_const("a", 1));
    host.set("app:///b.js", module().export_const("b", 1));
    host.set(
      "app:///main.js",
      module()
        .import("./a.js", &["a"])
        .import("./b.js", &["b"])
        .accept(&["./a.js"])
        .accept(&["./b.js"]),
    );
    let main = host.boot("app:///main.js").await.unwrap();
    host.take_journal();

    host
      .update("app:///a.js", module().export_const("a", 2))
      .await
      .unwrap();
    host
      .update("app:///b.js", module().export_const("b", 2))
      .await
      .unwrap();
    let result = main.request_update_result().await;
    assert!(matches!(result, UpdateResult::Success { .. }));
    // Both groups matched one updated module each; callbacks observed
    // in registration order after the two reloads.
    let accepts: Vec<String> = host
      .journal()
      .into_iter()
      .filter(|entry| entry.starts_with("accept:"))
      .collect();
    assert_eq!(
      accepts,
      vec!["accept:app:///main.js", "accept:app:///main.js"]
    );
  }

  #[tokio::test]
  async fn failing_accept_callback_falls_through1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set("app:///child.js", module().export_const("c", 1));
    host.set(
      "app:///main.js",
      module()
        .import("./child.js", &["c"])
        .accept_with(
          &["./child.js"],
          crate::tests::script::AcceptBehavior::Fail,
        )
        .accept_self(),
    );
    let main = host.boot("app:///main.js").await.unwrap();
    host.take_journal();

    host
      .update("app:///child.js", module().export_const("c", 2))
      .await
      .unwrap();
    let result = main.request_update_result().await;
    // The throwing callback counts as "not accepted": main re-runs and
    // absorbs via its self-accept.
    assert!(matches!(result, UpdateResult::Success { .. }));
    assert_eq!(host.eval_count("app:///main.js"), 1);
  }
}

#[cfg(test)]
mod test_teardown {
  use super::*;

  #[tokio::test]
  async fn dispose_data_reaches_successor1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set(
      "app:///m.js",
      module().export_const("x", 1).accept_self().dispose_data("kept", 42),
    );
    let controller = host.boot("app:///m.js").await.unwrap();
    host.take_journal();

    host
      .update(
        "app:///m.js",
        module().export_const("x", 2).accept_self().dispose_data("kept", 43),
      )
      .await
      .unwrap();
    let result = controller.request_update_result().await;
    assert!(matches!(result, UpdateResult::Success { .. }));
    // The successor read the exact data the dispose callback wrote.
    assert_eq!(
      host.journal(),
      vec!["data:app:///m.js:kept=42", "eval:app:///m.js"]
    );
  }

  #[tokio::test]
  async fn dispose_runs_in_reverse_order1() {
    test_log_init();
    let host = ScriptHost::new();
    host.set(
      "app:///m.js",
      module()
        .export_const("x", 1)
        .accept_self()
        .dispose_mark(1)
        .dispose_mark(2),
    );
    let controller = host.boot("app:///m.js").await.unwrap();
    host.take_journal();

    host
      .update(
        "app:///m.js",
        module().export_const("x", 2).accept_self(),
      )
      .await
      .unwrap();
    let result = controller.request_update_result().await;
    assert!(matches!(result, UpdateResult::Success { .. }));
    assert_eq!(
      host.journal(),
      vec!["teardown:2", "teardown:1", "eval:app:///m.js"]
    );
  }
}
