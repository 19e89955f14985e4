mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{MockPlatform, fast_config, message_to, wait_until};
use notify_hub::callback::{CallbackRetryPolicy, CallbackStatus, Progress};
use notify_hub::{
    Callback, CallbackKind, Dispatcher, ErrorCode, Message, NotifyError, SendResult, Target,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

fn quick_retries(max_retries: u32) -> CallbackRetryPolicy {
    CallbackRetryPolicy {
        max_retries,
        initial_interval_ms: 1,
        max_interval_ms: 5,
        multiplier: 2.0,
        jitter: false,
    }
}

#[tokio::test]
async fn slow_callbacks_do_not_delay_dispatch() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));

    let finished = Arc::new(AtomicU32::new(0));
    {
        let finished = finished.clone();
        dispatcher.callback_registry().register_global([Callback::on_result(
            move |_: SendResult| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .with_timeout(Duration::from_secs(2))]);
    }
    dispatcher.start();

    let started = tokio::time::Instant::now();
    let report = dispatcher
        .send(message_to("email", "a"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    assert!(wait_until(Duration::from_secs(2), || finished.load(Ordering::SeqCst) == 1).await);
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn message_callbacks_see_results_errors_and_progress() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));
    dispatcher.register_platform(Arc::new(MockPlatform::always_failing(
        "sms",
        NotifyError::permission_denied("sms", "sender not approved"),
    )));
    dispatcher.start();

    let message = Message::builder()
        .id("order-42")
        .body("Your order shipped")
        .target(Target::user("email", "a@example.com"))
        .target(Target::user("sms", "+15550100"))
        .build()
        .unwrap();

    let results = Arc::new(Mutex::new(Vec::<(String, bool)>::new()));
    let errors = Arc::new(Mutex::new(Vec::<ErrorCode>::new()));
    let progress = Arc::new(Mutex::new(Vec::<Progress>::new()));
    {
        let results = results.clone();
        let errors = errors.clone();
        let progress = progress.clone();
        dispatcher.callback_registry().register_for_message(
            "order-42",
            [
                Callback::on_result(move |result: SendResult| {
                    let results = results.clone();
                    async move {
                        results.lock().push((result.platform.clone(), result.success));
                        Ok(())
                    }
                }),
                Callback::on_error(move |_: Arc<Message>, error: NotifyError| {
                    let errors = errors.clone();
                    async move {
                        errors.lock().push(error.code());
                        Ok(())
                    }
                }),
                Callback::on_progress(move |_: String, p: Progress| {
                    let progress = progress.clone();
                    async move {
                        progress.lock().push(p);
                        Ok(())
                    }
                }),
            ],
        );
    }

    let handle = dispatcher
        .send_async(message, &CancellationToken::new())
        .await
        .unwrap();
    handle.wait_timeout(Duration::from_secs(2)).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        results.lock().len() == 2 && errors.lock().len() == 1 && progress.lock().len() == 2
    })
    .await);

    let mut seen = results.lock().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![("email".to_string(), true), ("sms".to_string(), false)]
    );
    assert_eq!(errors.lock().as_slice(), &[ErrorCode::PermissionDenied]);
    assert!(progress.lock().iter().any(|p| p.completed == 2 && p.total == 2));

    // Per-message registrations are released once the message settles.
    assert_eq!(dispatcher.callback_registry().message_count(), 0);

    let registry = dispatcher.callback_registry();
    assert!(wait_until(Duration::from_secs(1), || {
        let records = registry.records_for_message("order-42");
        records.len() == 5 && records.iter().all(|r| r.status == CallbackStatus::Succeeded)
    })
    .await);
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn panicking_callback_is_dead_lettered_without_affecting_dispatch() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));

    let invocations = Arc::new(AtomicU32::new(0));
    {
        let invocations = invocations.clone();
        dispatcher.callback_registry().register_global([Callback::on_result(
            move |_: SendResult| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    let fail = true;
                    if fail {
                        panic!("callback exploded");
                    }
                    Ok(())
                }
            },
        )
        .with_retry_policy(quick_retries(2))]);
    }
    dispatcher.start();

    let report = dispatcher
        .send(message_to("email", "a"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());

    let executor = dispatcher.callbacks();
    assert!(wait_until(Duration::from_secs(2), || executor.dead_letter_count() == 1).await);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let letter = &executor.dead_letters()[0];
    assert_eq!(letter.kind, CallbackKind::Result);
    assert_eq!(letter.attempts, 3);
    assert!(letter.reason.contains("callback exploded"));

    let stats = executor.stats().kind_stats(CallbackKind::Result);
    assert_eq!(stats.panics, 3);
    assert_eq!(dispatcher.snapshot().callbacks.dead_letters, 1);
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn conditional_callback_only_runs_on_failures() {
    let dispatcher = Dispatcher::new(fast_config()).unwrap();
    dispatcher.register_platform(Arc::new(MockPlatform::succeeding("email")));
    dispatcher.register_platform(Arc::new(MockPlatform::always_failing(
        "sms",
        NotifyError::invalid_target("+0", "unroutable"),
    )));

    let failures = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let failures = failures.clone();
        dispatcher.callback_registry().register_global([Callback::on_result(
            move |result: SendResult| {
                let failures = failures.clone();
                async move {
                    failures.lock().push(result.platform);
                    Ok(())
                }
            },
        )
        .when(|event| match event {
            notify_hub::CallbackEvent::Result(result) => !result.success,
            _ => false,
        })]);
    }
    dispatcher.start();

    let cancel = CancellationToken::new();
    dispatcher.send(message_to("email", "a"), &cancel).await.unwrap();
    dispatcher.send(message_to("sms", "+0"), &cancel).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || failures.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(failures.lock().as_slice(), &["sms".to_string()]);
    dispatcher.shutdown(Duration::from_secs(1)).await;
}
