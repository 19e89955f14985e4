mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockPlatform, fast_config, message_to, wait_until};
use notify_hub::dispatcher::Envelope;
use notify_hub::queue::{DispatchQueue, MemoryQueue};
use notify_hub::{
    CircuitState, DispatchStatus, Dispatcher, Error, ErrorCode, NotifyError, OverflowPolicy,
    TargetState,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn reject_policy_fails_fast_when_full() {
    let mut config = fast_config();
    config.queue.capacity = 1;
    config.queue.overflow_policy = OverflowPolicy::Reject;

    // Workers are not started, so nothing drains the queue.
    let dispatcher = Dispatcher::new(config).unwrap();
    let cancel = CancellationToken::new();

    let first = dispatcher
        .send_async(message_to("email", "a"), &cancel)
        .await
        .unwrap();
    let err = dispatcher
        .send_async(message_to("email", "b"), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::QueueFull);
    assert_eq!(first.status(), DispatchStatus::Pending);
    assert_eq!(dispatcher.queue_len(), 1);

    let counters = dispatcher.snapshot().dispatch;
    assert_eq!(counters.enqueued, 1);
    assert_eq!(counters.rejected, 1);
}

#[tokio::test]
async fn block_policy_waits_and_honors_cancellation() {
    let mut config = fast_config();
    config.queue.capacity = 1;
    config.queue.overflow_policy = OverflowPolicy::Block;

    let dispatcher = Dispatcher::new(config).unwrap();
    dispatcher
        .send_async(message_to("email", "a"), &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let started = tokio::time::Instant::now();
    let err = dispatcher
        .send_async(message_to("email", "b"), &cancel)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(dispatcher.queue_len(), 1);
}

#[tokio::test]
async fn block_policy_resumes_when_space_frees() {
    let mut config = fast_config();
    config.queue.capacity = 1;
    config.queue.overflow_policy = OverflowPolicy::Block;
    config.worker.concurrency = 1;

    let dispatcher = Arc::new(Dispatcher::new(config).unwrap());
    dispatcher.register_platform(Arc::new(
        MockPlatform::succeeding("email").with_delay(Duration::from_millis(20)),
    ));
    dispatcher.start();

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for i in 0..4 {
        handles.push(
            dispatcher
                .send_async(message_to("email", &format!("user-{i}")), &cancel)
                .await
                .unwrap(),
        );
    }

    for handle in handles {
        let report = handle.wait_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(report.is_success());
    }
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn drop_oldest_settles_evicted_handle() {
    let mut config = fast_config();
    config.queue.capacity = 2;
    config.queue.overflow_policy = OverflowPolicy::DropOldest;

    let dispatcher = Dispatcher::new(config).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));
    let cancel = CancellationToken::new();

    let oldest = dispatcher
        .send_async(message_to("email", "a"), &cancel)
        .await
        .unwrap();
    let second = dispatcher
        .send_async(message_to("email", "b"), &cancel)
        .await
        .unwrap();
    let newest = dispatcher
        .send_async(message_to("email", "c"), &cancel)
        .await
        .unwrap();

    let evicted = oldest.wait_timeout(Duration::from_millis(100)).await.unwrap();
    assert_eq!(evicted.status, DispatchStatus::Failed);
    assert_eq!(evicted.results[0].attempts, 0);
    assert_eq!(
        evicted.results[0].error.as_ref().map(|e| e.code()),
        Some(ErrorCode::QueueFull)
    );
    assert_eq!(dispatcher.snapshot().dispatch.evicted, 1);
    assert_eq!(dispatcher.queue_len(), 2);

    dispatcher.start();
    for handle in [second, newest] {
        let report = handle.wait_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(report.is_success());
    }
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn handle_status_only_moves_forward() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    dispatcher.register_platform(Arc::new(
        MockPlatform::succeeding("email").with_delay(Duration::from_millis(30)),
    ));

    let handle = dispatcher
        .send_async(message_to("email", "a"), &CancellationToken::new())
        .await
        .unwrap();
    let mut statuses = handle.subscribe();
    let mut seen = vec![*statuses.borrow()];

    dispatcher.start();
    while statuses.changed().await.is_ok() {
        seen.push(*statuses.borrow_and_update());
        if seen.last().is_some_and(|s| s.is_terminal()) {
            break;
        }
    }

    assert_eq!(seen.first(), Some(&DispatchStatus::Pending));
    assert_eq!(seen.last(), Some(&DispatchStatus::Success));
    let order = |s: &DispatchStatus| match s {
        DispatchStatus::Pending => 0,
        DispatchStatus::Running => 1,
        _ => 2,
    };
    assert!(seen.windows(2).all(|w| order(&w[0]) < order(&w[1])));

    // Settling is final; a late cancel changes nothing.
    handle.cancel();
    assert_eq!(handle.status(), DispatchStatus::Success);
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancelled_before_pickup_never_reaches_platform() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    let platform = Arc::new(MockPlatform::succeeding("email"));
    dispatcher.register_platform(platform.clone());

    let handle = dispatcher
        .send_async(message_to("email", "a"), &CancellationToken::new())
        .await
        .unwrap();
    handle.cancel();
    dispatcher.start();

    let report = handle.wait_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.status, DispatchStatus::Cancelled);
    assert_eq!(platform.calls(), 0);
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_cancels_queued_messages_and_refuses_new_ones() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    let platform = Arc::new(MockPlatform::succeeding("email"));
    dispatcher.register_platform(platform.clone());
    let cancel = CancellationToken::new();

    let queued = dispatcher
        .send_async(message_to("email", "a"), &cancel)
        .await
        .unwrap();

    dispatcher.shutdown(Duration::from_millis(100)).await;

    let report = queued.wait_timeout(Duration::from_millis(100)).await.unwrap();
    assert_eq!(report.status, DispatchStatus::Cancelled);
    assert_eq!(report.results[0].state, TargetState::Cancelled);
    assert_eq!(platform.calls(), 0);

    let err = dispatcher
        .send(message_to("email", "b"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ShuttingDown);
    let err = dispatcher
        .send_async(message_to("email", "c"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ShuttingDown);
    assert!(!dispatcher.is_accepting());
}

#[tokio::test]
async fn shutdown_timeout_force_cancels_in_flight_work() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    let platform =
        Arc::new(MockPlatform::succeeding("slow").with_delay(Duration::from_secs(30)));
    dispatcher.register_platform(platform.clone());
    dispatcher.start();

    let handle = dispatcher
        .send_async(message_to("slow", "a"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || platform.calls() == 1).await);

    let started = tokio::time::Instant::now();
    dispatcher.shutdown(Duration::from_millis(50)).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let report = handle.wait_timeout(Duration::from_millis(100)).await.unwrap();
    assert_eq!(report.status, DispatchStatus::Cancelled);
    assert!(!dispatcher.worker_pool().is_running());
}

#[tokio::test]
async fn worker_survives_panicking_platform() {
    let mut config = fast_config();
    config.worker.concurrency = 1;

    let dispatcher = Dispatcher::new(config).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::new("broken", |_, _| {
        panic!("driver bug");
    })));
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));
    dispatcher.start();

    let cancel = CancellationToken::new();
    let broken = dispatcher
        .send_async(message_to("broken", "a"), &cancel)
        .await
        .unwrap();
    let healthy = dispatcher
        .send_async(message_to("email", "b"), &cancel)
        .await
        .unwrap();

    let report = broken.wait_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(report.status, DispatchStatus::Failed);
    assert_eq!(
        report.results[0].error.as_ref().map(|e| e.code()),
        Some(ErrorCode::Internal)
    );

    let report = healthy.wait_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(report.status, DispatchStatus::Success);
    assert!(dispatcher.worker_pool().is_running());
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn custom_queue_constructor_validates_config() {
    let queue = || -> Arc<dyn DispatchQueue<Envelope>> {
        Arc::new(MemoryQueue::new(8, OverflowPolicy::Reject))
    };

    let mut config = fast_config();
    config.circuit_breaker.default.half_open_probes = 0;
    let err = Dispatcher::with_queue(config, queue()).err().unwrap();
    assert!(matches!(err, Error::Configuration(_)));

    let mut config = fast_config();
    config.circuit_breaker.default.failure_threshold = 0;
    assert!(Dispatcher::with_queue(config, queue()).is_err());

    let dispatcher = Dispatcher::with_queue(fast_config(), queue()).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));
    dispatcher.start();
    let handle = dispatcher
        .send_async(message_to("email", "a"), &CancellationToken::new())
        .await
        .unwrap();
    let report = handle.wait_timeout(Duration::from_secs(2)).await.unwrap();
    assert!(report.is_success());
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn dispatchers_do_not_share_state() {
    let mut config = fast_config();
    config.retry.default.max_attempts = 1;
    config.circuit_breaker.default.failure_threshold = 1;

    let first = Dispatcher::new(config.clone()).unwrap();
    let second = Dispatcher::new(config).unwrap();
    first.register_platform(Arc::new(MockPlatform::always_failing(
        "shared",
        NotifyError::platform_unavailable("shared", "down"),
    )));
    second.register_platform(Arc::new(MockPlatform::succeeding("shared")));

    let cancel = CancellationToken::new();
    let failed = first.send(message_to("shared", "a"), &cancel).await.unwrap();
    assert_eq!(failed.status, DispatchStatus::Failed);
    assert_eq!(first.circuit_breakers().state("shared"), Some(CircuitState::Open));

    let delivered = second.send(message_to("shared", "a"), &cancel).await.unwrap();
    assert!(delivered.is_success());
    assert_eq!(second.circuit_breakers().state("shared"), Some(CircuitState::Closed));
    assert_eq!(first.snapshot().dispatch.failed, 1);
    assert_eq!(second.snapshot().dispatch.failed, 0);
}

#[tokio::test]
async fn snapshot_serializes_to_json() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));
    dispatcher
        .send(message_to("email", "a"), &CancellationToken::new())
        .await
        .unwrap();

    let json = dispatcher.snapshot().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["dispatch"]["succeeded"], 1);
    assert_eq!(value["queue"]["status"], "normal");
    assert_eq!(value["platforms"][0]["platform"], "email");
    assert_eq!(value["circuit_breakers"][0]["state"], "closed");
}
