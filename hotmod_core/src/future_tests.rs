use crate::future::Step;
use crate::tests::log::init as test_log_init;

#[cfg(test)]
mod test_step {
  use super::*;

  #[test]
  fn ready1() {
    test_log_init();
    let step = Step::ready(7);
    assert!(step.is_ready());
    let step = step.map(|v| v * 2);
    match step {
      Step::Ready(v) => assert_eq!(v, 14),
      Step::Pending(_) => unreachable!(),
    }
  }

  #[tokio::test]
  async fn pending1() {
    test_log_init();
    let step = Step::pending(async {
      tokio::task::yield_now().await;
      3
    });
    assert!(!step.is_ready());
    assert_eq!(step.map(|v| v + 1).wait().await, 4);
  }

  #[tokio::test]
  async fn wait_ready1() {
    test_log_init();
    assert_eq!(Step::ready("x").wait().await, "x");
  }
}
