//! Connection manager integration tests
//!
//! Retry accounting, supervision, cancellation and close semantics against
//! the in-memory broker.

mod common;

use common::{eventually, Call, MockBroker, Op};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warren_client::{Config, ConnectionManager, ConnectionState, RetryPolicy};
use warren_core::{Error, Qos};

fn recorded_errors() -> (Arc<Mutex<Vec<Error>>>, impl Fn(&Error) + Send + Sync + 'static) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    (errors, move |err: &Error| sink.lock().unwrap().push(err.clone()))
}

#[tokio::test]
async fn test_connect_installs_connection() {
    let broker = MockBroker::new();
    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn())
            .with_qos(Qos::new(16))
            .with_publisher_confirms(true),
    );

    assert_eq!(manager.state(), ConnectionState::Idle);
    assert!(matches!(manager.current_connection(), Err(Error::NotConnected)));

    manager.connect(&CancellationToken::new()).await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.current_connection().is_ok());
    assert!(manager.current_channel().is_ok());
    assert_eq!(
        broker.calls(),
        vec![Call::OpenChannel, Call::Qos(Qos::new(16)), Call::ConfirmSelect]
    );
}

#[tokio::test]
async fn test_connect_with_fired_token() {
    let broker = MockBroker::new();
    let manager = ConnectionManager::new(Config::new(broker.dial_fn()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = manager.connect(&cancel).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(broker.dials(), 0);
}

#[tokio::test]
async fn test_connect_does_not_retry() {
    let broker = MockBroker::new();
    broker.fail_next_dials(1);
    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn()).with_retry_policy(RetryPolicy::new(5, Duration::ZERO)),
    );

    let result = manager.connect(&CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::Connect(_))));
    assert_eq!(broker.dials(), 1);
    assert_eq!(manager.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_channel_failure_fails_connect() {
    let broker = MockBroker::new();
    broker.fail_on(Op::OpenChannel, "CHANNEL_ERROR");
    let manager = ConnectionManager::new(Config::new(broker.dial_fn()));

    let result = manager.connect(&CancellationToken::new()).await;

    assert_eq!(result.err(), Some(Error::Broker("CHANNEL_ERROR".to_string())));
    assert_eq!(broker.count(|call| *call == Call::CloseConnection), 1);
    assert!(matches!(manager.current_connection(), Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_max_attempts_exhausted() {
    let broker = MockBroker::new();
    broker.refuse_all_dials(true);
    let (errors, listener) = recorded_errors();
    let hook_calls = Arc::new(AtomicU32::new(0));
    let hook_counter = hook_calls.clone();

    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn())
            .with_retry_policy(
                RetryPolicy::new(2, Duration::from_millis(10)).with_error_listener(listener),
            )
            .with_on_connect(move |_manager| {
                let hook_counter = hook_counter.clone();
                async move {
                    hook_counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );

    // Nothing may ever observe a connection while the dials fail.
    let watcher_manager = manager.clone();
    let watcher_stop = CancellationToken::new();
    let stop = watcher_stop.clone();
    let watcher = tokio::spawn(async move {
        let mut seen_connection = false;
        while !stop.is_cancelled() {
            seen_connection |= watcher_manager.current_connection().is_ok();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        seen_connection
    });

    let err = manager.run(CancellationToken::new()).await;
    watcher_stop.cancel();

    assert_eq!(err, Error::MaxAttempts { attempts: 2 });
    assert_eq!(broker.dials(), 2);
    assert_eq!(manager.attempts(), 2);
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(matches!(manager.current_connection(), Err(Error::NotConnected)));
    assert!(!watcher.await.unwrap());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 3);
    assert!(matches!(errors[0], Error::Connect(_)));
    assert!(matches!(errors[1], Error::Connect(_)));
    assert_eq!(errors[2], Error::MaxAttempts { attempts: 2 });
}

#[tokio::test]
async fn test_recovers_after_two_failures() {
    let broker = MockBroker::new();
    broker.fail_next_dials(2);
    broker.set_dial_delay(Duration::from_millis(2));
    let hook_calls = Arc::new(AtomicU32::new(0));
    let hook_counter = hook_calls.clone();

    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn())
            .with_retry_policy(RetryPolicy::new(5, Duration::from_millis(10)))
            .with_on_connect(move |_manager| {
                let hook_counter = hook_counter.clone();
                async move {
                    hook_counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );

    let mut states = manager.subscribe_state();
    states.borrow_and_update();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if matches!(state, ConnectionState::Connected | ConnectionState::Closed) {
                break;
            }
        }
        seen
    });

    let cancel = CancellationToken::new();
    let supervisor = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    let seen = recorder.await.unwrap();
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(manager.attempts(), 3);
    assert_eq!(broker.dials(), 3);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

    cancel.cancel();
    assert_eq!(supervisor.await.unwrap(), Error::Cancelled);
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(broker.count(|call| *call == Call::CloseConnection), 1);
}

#[tokio::test]
async fn test_unbounded_retries_until_cancelled() {
    let broker = MockBroker::new();
    broker.refuse_all_dials(true);
    let (errors, listener) = recorded_errors();

    let manager = ConnectionManager::new(Config::new(broker.dial_fn()).with_retry_policy(
        RetryPolicy::unbounded(Duration::from_millis(2)).with_error_listener(listener),
    ));

    let cancel = CancellationToken::new();
    let supervisor = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    eventually("several dial attempts", || broker.dials() >= 5).await;
    cancel.cancel();

    assert_eq!(supervisor.await.unwrap(), Error::Cancelled);
    assert!(errors
        .lock()
        .unwrap()
        .iter()
        .all(|err| !matches!(err, Error::MaxAttempts { .. })));
}

#[tokio::test]
async fn test_cancel_while_dialing() {
    let broker = MockBroker::new();
    broker.set_dial_delay(Duration::from_secs(30));
    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn()).with_retry_policy(RetryPolicy::unbounded(Duration::ZERO)),
    );

    let cancel = CancellationToken::new();
    let supervisor = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    eventually("the first dial", || broker.dials() == 1).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), supervisor)
        .await
        .expect("run did not observe cancellation")
        .unwrap();
    assert_eq!(result, Error::Cancelled);
    assert_eq!(broker.dials(), 1);
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = MockBroker::new();
    let manager = ConnectionManager::new(Config::new(broker.dial_fn()));
    manager.connect(&CancellationToken::new()).await.unwrap();

    assert!(manager.close().await.is_ok());
    assert!(manager.close().await.is_ok());

    assert_eq!(broker.count(|call| *call == Call::CloseConnection), 1);
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(matches!(manager.current_connection(), Err(Error::NotConnected)));

    let reconnect = manager.connect(&CancellationToken::new()).await;
    assert!(matches!(reconnect, Err(Error::Closed)));
}

#[tokio::test]
async fn test_close_from_another_task_stops_supervision() {
    let broker = MockBroker::new();
    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn()).with_retry_policy(RetryPolicy::unbounded(Duration::ZERO)),
    );
    manager.start(CancellationToken::new()).await.unwrap();

    let closer = manager.clone();
    tokio::spawn(async move { closer.close().await }).await.unwrap().unwrap();

    assert_eq!(manager.wait().await, Error::Closed);
    assert!(!manager.is_running());
    assert_eq!(broker.dials(), 1);
}

#[tokio::test]
async fn test_reconnects_after_connection_drop() {
    let broker = MockBroker::new();
    let hook_calls = Arc::new(AtomicU32::new(0));
    let hook_counter = hook_calls.clone();

    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn())
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(5)))
            .with_on_connect(move |_manager| {
                let hook_counter = hook_counter.clone();
                async move {
                    hook_counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );

    manager.start(CancellationToken::new()).await.unwrap();
    assert_eq!(manager.attempts(), 1);
    assert!(manager.is_running());

    broker.drop_connection();
    eventually("the second connection", || {
        broker.dials() == 2 && manager.state() == ConnectionState::Connected
    })
    .await;

    assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    // The counter restarts for the new reconnect cycle.
    assert_eq!(manager.attempts(), 1);
    assert!(manager.current_connection().is_ok());

    manager.close().await.unwrap();
    assert_eq!(manager.wait().await, Error::Closed);
}

#[tokio::test]
async fn test_attempt_budget_spans_connections_without_reset() {
    let broker = MockBroker::new();
    let manager = ConnectionManager::new(Config::new(broker.dial_fn()).with_retry_policy(
        RetryPolicy::new(2, Duration::from_millis(1)).with_reset_on_connect(false),
    ));

    manager.start(CancellationToken::new()).await.unwrap();
    broker.refuse_all_dials(true);
    broker.drop_connection();

    assert_eq!(manager.wait().await, Error::MaxAttempts { attempts: 2 });
    assert_eq!(broker.dials(), 2);
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_no_retry_policy_returns_dial_error() {
    let broker = MockBroker::new();
    broker.refuse_all_dials(true);
    let manager = ConnectionManager::new(Config::new(broker.dial_fn()));

    let err = manager.run(CancellationToken::new()).await;

    assert!(matches!(err, Error::Connect(_)));
    assert_eq!(broker.dials(), 1);
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_start_returns_first_connect_error() {
    let broker = MockBroker::new();
    broker.fail_next_dials(1);
    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn()).with_retry_policy(RetryPolicy::new(3, Duration::ZERO)),
    );

    let result = manager.start(CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::Connect(_))));
    assert!(!manager.is_running());

    // A failed start leaves the manager usable.
    manager.start(CancellationToken::new()).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_second_supervisor_rejected() {
    let broker = MockBroker::new();
    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn()).with_retry_policy(RetryPolicy::unbounded(Duration::ZERO)),
    );
    manager.start(CancellationToken::new()).await.unwrap();

    assert_eq!(manager.run(CancellationToken::new()).await, Error::AlreadyRunning);
    assert!(matches!(
        manager.start(CancellationToken::new()).await,
        Err(Error::AlreadyRunning)
    ));
    assert!(matches!(
        manager.connect(&CancellationToken::new()).await,
        Err(Error::AlreadyRunning)
    ));
    assert_eq!(broker.dials(), 1);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_hook_sees_connected_manager() {
    let broker = MockBroker::new();
    let observed = Arc::new(Mutex::new(None));
    let slot = observed.clone();

    let manager = ConnectionManager::new(Config::new(broker.dial_fn()).with_on_connect(
        move |manager| {
            let slot = slot.clone();
            async move {
                *slot.lock().unwrap() =
                    Some((manager.state(), manager.current_connection().is_ok()));
            }
        },
    ));

    manager.connect(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        *observed.lock().unwrap(),
        Some((ConnectionState::Connected, true))
    );
}

#[tokio::test]
async fn test_metrics_do_not_change_behavior() {
    let broker = MockBroker::new();
    broker.fail_next_dials(1);
    let manager = ConnectionManager::new(
        Config::new(broker.dial_fn())
            .with_retry_policy(RetryPolicy::new(3, Duration::ZERO))
            .with_metrics(Arc::new(warren_client::ClientMetrics::new())),
    );

    manager.start(CancellationToken::new()).await.unwrap_err();
    manager.start(CancellationToken::new()).await.unwrap();
    broker.drop_connection();
    eventually("the reconnect", || {
        broker.dials() == 3 && manager.state() == ConnectionState::Connected
    })
    .await;

    manager.close().await.unwrap();
    assert_eq!(manager.wait().await, Error::Closed);
}

#[tokio::test]
async fn test_connection_hidden_until_hook_returns() {
    let broker = MockBroker::new();
    let in_hook = Arc::new(AtomicBool::new(false));
    let hook_flag = in_hook.clone();

    let manager = ConnectionManager::new(Config::new(broker.dial_fn()).with_on_connect(
        move |manager| {
            let hook_flag = hook_flag.clone();
            async move {
                hook_flag.store(true, Ordering::SeqCst);
                assert!(manager.current_connection().is_ok());
                tokio::time::sleep(Duration::from_millis(100)).await;
                hook_flag.store(false, Ordering::SeqCst);
            }
        },
    ));

    let stop = CancellationToken::new();
    let watcher = {
        let manager = manager.clone();
        let in_hook = in_hook.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut hook_ran = false;
            let mut leaked = false;
            while !stop.is_cancelled() {
                if in_hook.load(Ordering::SeqCst) {
                    hook_ran = true;
                    leaked |= manager.current_connection().is_ok()
                        || manager.current_channel().is_ok();
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            (hook_ran, leaked)
        })
    };

    manager.connect(&CancellationToken::new()).await.unwrap();
    assert!(manager.current_connection().is_ok());
    stop.cancel();

    let (hook_ran, leaked) = watcher.await.unwrap();
    assert!(hook_ran);
    assert!(!leaked);
}

#[tokio::test]
async fn test_wait_after_close_without_supervisor() {
    let broker = MockBroker::new();
    let manager = ConnectionManager::new(Config::new(broker.dial_fn()));
    manager.connect(&CancellationToken::new()).await.unwrap();

    manager.close().await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(1), manager.wait())
        .await
        .expect("wait did not return after close");
    assert_eq!(reason, Error::Closed);
}
