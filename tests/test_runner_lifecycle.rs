//! Device runner lifecycle tests
//!
//! Tests the runner against the mock transport:
//! - Reconnection with exponential backoff and the fatal ceiling
//! - Backoff reset after a successful connection
//! - FIFO delivery and tail re-enqueue on send failure
//! - Stop while a send is in flight
//! - Teardown of the transport

mod test_helpers;

use fieldlink::error::{EnqueueError, RunnerError};
use fieldlink::signal::LinkState;
use serde_json::json;
use std::time::Duration;
use test_helpers::{tag_of, tagged_reading, test_runner, test_runner_with_capacity, PROMPTLY};

fn gaps(times: &[tokio::time::Instant]) -> Vec<Duration> {
    times.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

#[tokio::test]
async fn test_readings_sent_in_submission_order() {
    let (runner, transport) = test_runner(10, 1000);
    for tag in 0..5 {
        runner.enqueue(tagged_reading(tag)).await.unwrap();
    }

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.sent_messages().len() == 5)
            .await
    );
    let tags: Vec<_> = transport.sent_payloads().iter().filter_map(tag_of).collect();
    assert_eq!(tags, vec![0, 1, 2, 3, 4]);
    assert_eq!(runner.pending_len(), 0);

    runner.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_send_requeued_once_at_tail() {
    let (runner, transport) = test_runner(10, 1000);
    transport.fail_next_sends(1);
    runner.enqueue(tagged_reading(1)).await.unwrap();
    runner.enqueue(tagged_reading(2)).await.unwrap();

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.sent_messages().len() == 2)
            .await
    );
    let tags: Vec<_> = transport.sent_payloads().iter().filter_map(tag_of).collect();
    assert_eq!(tags, vec![2, 1], "failed reading goes behind the others");
    assert_eq!(transport.send_attempts(), 3);
    assert_eq!(runner.pending_len(), 0);

    runner.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_reading_is_dropped() {
    let (runner, transport) = test_runner(10, 1000);
    runner.enqueue(json!({"Bomba": {}})).await.unwrap();
    runner.enqueue(tagged_reading(7)).await.unwrap();

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.sent_messages().len() == 1)
            .await
    );
    assert_eq!(tag_of(&transport.sent_payloads()[0]), Some(7));
    assert!(runner.pending_snapshot().is_empty());

    runner.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_backoff_delay_doubles_per_failure() {
    let (runner, transport) = test_runner(20, 10_000);
    transport.script_connects([false, false, false, true]);

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| {
                t.connect_attempts() == 4 && runner.signals().is_connected()
            })
            .await
    );
    let gaps = gaps(&transport.connect_times());
    assert_eq!(gaps.len(), 3);
    for (gap, expected_ms) in gaps.iter().zip([20, 40, 80]) {
        assert!(
            *gap >= Duration::from_millis(expected_ms),
            "gap {gap:?} shorter than {expected_ms}ms"
        );
    }
    assert_eq!(runner.backoff_state().attempt(), 1);

    runner.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_backoff_resets_after_successful_connect() {
    let (runner, transport) = test_runner(100, 100_000);
    transport.script_connects([false, false, true, false, true]);

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| {
                t.connect_attempts() == 3 && runner.signals().is_connected()
            })
            .await
    );
    assert_eq!(runner.backoff_state().retry_factor(), 0);

    transport.drop_link();
    assert!(
        transport
            .wait_until(PROMPTLY, |t| {
                t.connect_attempts() == 5 && runner.signals().is_connected()
            })
            .await
    );

    let gaps = gaps(&transport.connect_times());
    // Without the reset the delay after the fourth attempt would be 400ms
    assert!(gaps[3] >= Duration::from_millis(100));
    assert!(gaps[3] < Duration::from_millis(300), "gap was {:?}", gaps[3]);
    assert_eq!(runner.backoff_state().retry_factor(), 0);

    runner.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_retry_budget_exhaustion_is_fatal() {
    let (runner, transport) = test_runner(10, 80);
    transport.refuse_connections(true);

    let result = tokio::time::timeout(PROMPTLY, runner.run(None, None))
        .await
        .expect("runner should give up");

    match result {
        Err(RunnerError::RetryBudgetExhausted {
            device_id,
            attempts,
            max_delay,
        }) => {
            assert_eq!(device_id, "pump-01");
            // Delays 10, 20, 40 then 80 hits the ceiling
            assert_eq!(attempts, 4);
            assert_eq!(max_delay, Duration::from_millis(80));
        }
        other => panic!("expected retry budget exhaustion, got {other:?}"),
    }
    assert!(runner.signals().is_exiting());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connect_attempts(), 4, "no connects after giving up");
    assert_eq!(transport.shutdown_count(), 1);
}

async fn assert_exhaustion_always_reported(runs: usize) {
    for run in 0..runs {
        let (runner, transport) = test_runner(1, 8);
        transport.refuse_connections(true);

        let result = tokio::time::timeout(PROMPTLY, runner.run(None, None))
            .await
            .expect("runner should give up");
        assert!(
            matches!(result, Err(RunnerError::RetryBudgetExhausted { .. })),
            "run {run} returned {result:?}"
        );
    }
}

#[tokio::test]
async fn test_exhaustion_reported_even_when_send_loop_ends_first() {
    assert_exhaustion_always_reported(40).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhaustion_reported_on_multi_thread_runtime() {
    assert_exhaustion_always_reported(40).await;
}

#[tokio::test]
async fn test_dropped_run_future_still_tears_down() {
    let (runner, transport) = test_runner(10, 1000);

    let abandoned = tokio::time::timeout(Duration::from_millis(50), runner.run(None, None)).await;
    assert!(abandoned.is_err(), "run should still be going when dropped");

    assert!(runner.signals().is_exiting());
    assert!(!transport.has_event_handler());
    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.shutdown_count() == 1)
            .await
    );
}

#[tokio::test]
async fn test_stop_during_hung_send_keeps_item() {
    let (runner, transport) = test_runner(10, 1000);
    transport.hang_send(true);
    runner.enqueue(tagged_reading(42)).await.unwrap();

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.send_attempts() == 1)
            .await
    );
    runner.stop();

    let result = tokio::time::timeout(PROMPTLY, task)
        .await
        .expect("run should return promptly after stop")
        .unwrap();
    assert!(result.is_ok());

    let pending = runner.pending_snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["Bomba"]["tag"], json!(42));
}

#[tokio::test]
async fn test_stop_during_hung_connect() {
    let (runner, transport) = test_runner(10, 1000);
    transport.hang_connect(true);

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.connect_attempts() == 1)
            .await
    );
    runner.stop();

    let result = tokio::time::timeout(PROMPTLY, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_link_drop_triggers_reconnect_and_resumes_sending() {
    let (runner, transport) = test_runner(10, 1000);

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.is_connected())
            .await
    );
    transport.drop_link();

    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.connect_attempts() == 2 && t.is_connected())
            .await
    );
    runner.enqueue(tagged_reading(3)).await.unwrap();
    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.sent_messages().len() == 1)
            .await
    );

    runner.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_link_reports_never_leave_both_flags_set() {
    let (runner, transport) = test_runner(10, 1000);

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });
    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.has_event_handler())
            .await
    );

    for connected in [true, true, false, true, false, false, true] {
        transport.report_link(connected);
        let state = runner.signals().state();
        assert_ne!(runner.signals().is_connected(), runner.signals().is_disconnected());
        let expected = if connected {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        // The reconnect loop may already be bringing the link back up
        assert!(state.link == expected || !connected);
    }

    runner.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_teardown_clears_handler_and_shuts_down() {
    let (runner, transport) = test_runner(10, 1000);

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });
    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.is_connected() && t.has_event_handler())
            .await
    );

    runner.stop();
    task.await.unwrap().unwrap();

    assert!(!transport.has_event_handler());
    assert_eq!(transport.shutdown_count(), 1);
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_enqueue_after_stop_is_rejected() {
    let (runner, _transport) = test_runner(10, 1000);
    runner.stop();

    let reading = tagged_reading(1);
    assert_eq!(
        runner.enqueue(reading.clone()).await,
        Err(EnqueueError::Stopped(reading.clone()))
    );
    assert_eq!(
        runner.try_enqueue(reading.clone()),
        Err(EnqueueError::Stopped(reading))
    );
    assert_eq!(runner.pending_len(), 0);
}

#[tokio::test]
async fn test_full_queue_blocks_until_drained() {
    let (runner, transport) = test_runner_with_capacity(10, 1000, 2);
    runner.enqueue(tagged_reading(1)).await.unwrap();
    runner.enqueue(tagged_reading(2)).await.unwrap();
    assert!(matches!(
        runner.try_enqueue(tagged_reading(3)),
        Err(EnqueueError::Full(_))
    ));

    let blocked = tokio::spawn({
        let runner = runner.clone();
        async move { runner.enqueue(tagged_reading(3)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(None, None).await }
    });

    tokio::time::timeout(PROMPTLY, blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(
        transport
            .wait_until(PROMPTLY, |t| t.sent_messages().len() == 3)
            .await
    );

    runner.stop();
    task.await.unwrap().unwrap();
}
