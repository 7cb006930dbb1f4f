use super::*;

#[tokio::test]
async fn latch_resolves_pending_waiters_on_settle() {
  let latch = Latch::new();
  let a = async { latch.wait().await };
  let b = async { latch.wait().await };

  tokio::join!(
    async {
      tokio::task::yield_now().await;
      latch.settle(Ok(()));
    },
    async {
      assert!(a.await.is_ok());
    },
    async {
      assert!(b.await.is_ok());
    },
  );
}

#[tokio::test]
async fn latch_already_ready_resolves_immediately() {
  let latch = Latch::new();
  latch.settle(Ok(()));
  assert!(latch.wait().await.is_ok());
}

#[tokio::test]
async fn latch_settle_is_idempotent() {
  let latch = Latch::new();
  latch.settle(Ok(()));
  latch.settle(Err(AnyErrShared::new(anyhow::anyhow!("too late"))));
  assert!(latch.wait().await.is_ok());
}

#[tokio::test]
async fn latch_propagates_failure_to_waiters() {
  let latch = Latch::new();
  let waiting = latch.wait();
  tokio::pin!(waiting);

  latch.settle(Err(AnyErrShared::new(anyhow::anyhow!("fetch failed"))));
  let result = waiting.await;
  assert!(result.is_err());
}

#[test]
fn new_wrapper_is_not_prepared() {
  let wrapper = ModuleWrapper::new("m".to_string(), Body::Preload, VersionRanges::default());
  assert!(!wrapper.is_prepared());
  assert!(wrapper.required_by().is_empty());
}
