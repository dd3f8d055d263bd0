// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use test_log::test;
use tokio_util::sync::CancellationToken;

use crate::harness::TestHarness;
use crate::logger::Logger;
use crate::ticker_func::TickerFuncError;
use crate::{Clock, Mock, Op};

const SEC: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// A context that expires well after any non-stuck test step.
fn test_ctx() -> CancellationToken {
    expiring_ctx(Duration::from_secs(10))
}

fn expiring_ctx(after: Duration) -> CancellationToken {
    let ctx = CancellationToken::new();
    let timer = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        timer.cancel();
    });
    ctx
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test step timed out")
}

/// Records failures instead of panicking, for exercising the clock's own
/// failure paths.
#[derive(Default)]
struct FailCapture {
    any_failure: AtomicBool,
    messages: parking_lot::Mutex<Vec<String>>,
}

impl TestHarness for FailCapture {
    fn error(&self, message: String) {
        self.any_failure.store(true, Ordering::Relaxed);
        self.messages.lock().push(message);
    }

    fn fatal(&self, message: String) {
        self.any_failure.store(true, Ordering::Relaxed);
        self.messages.lock().push(message);
    }

    fn failed(&self) -> bool {
        self.any_failure.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct CaptureLogger {
    lines: parking_lot::Mutex<Vec<String>>,
}

impl Logger for CaptureLogger {
    fn log(&self, line: fmt::Arguments<'_>) {
        self.lines.lock().push(line.to_string());
    }
}

#[test(tokio::test)]
async fn zero_duration_timer_fires_at_creation() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let start = clock.now(&[]).await;
    let mut trap = clock.trap().new_timer(&[]);

    let producer = clock.clone();
    let task = tokio::spawn(async move { producer.new_timer(Duration::ZERO, &[]).await });

    let call = trap.must_wait(&ctx).await;
    assert_eq!(call.op(), Op::NewTimer);
    assert_eq!(call.duration, Some(Duration::ZERO));
    call.must_release(&ctx).await;

    let mut timer = within(task).await.unwrap();
    // the delivery is the creation instant, with no advance in between
    assert_eq!(within(timer.recv()).await, start);
    assert!(!timer.stop(&[]).await);
}

#[test(tokio::test)]
async fn zero_duration_after_func_runs_without_advance() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let mut trap = clock.trap().after_func(&[]);

    let ran = CancellationToken::new();
    let observed = ran.clone();
    let producer = clock.clone();
    let task = tokio::spawn(async move {
        producer
            .after_func(
                Duration::ZERO,
                move || {
                    let ran = ran.clone();
                    async move { ran.cancel() }
                },
                &[],
            )
            .await
    });

    let call = trap.must_wait(&ctx).await;
    assert_eq!(call.duration, Some(Duration::ZERO));
    call.must_release(&ctx).await;

    let timer = within(task).await.unwrap();
    within(observed.cancelled()).await;
    assert!(!timer.stop(&[]).await);
}

#[test(tokio::test)]
async fn timers_fire_at_their_own_deadlines() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let start = clock.now(&[]).await;

    let mut early = clock.new_timer(SEC, &[]).await;
    let mut late = clock.new_timer(3 * SEC, &[]).await;

    // one jump past both deadlines: each delivery is the firing instant,
    // and the clock lands exactly at start + 5s
    clock.advance(5 * SEC).must_wait(&ctx).await;
    assert_eq!(within(early.recv()).await, start + SEC);
    assert_eq!(within(late.recv()).await, start + 3 * SEC);
    assert_eq!(clock.now(&[]).await, start + 5 * SEC);
}

#[test(tokio::test)]
async fn stop_then_reset_fires_once_at_the_new_deadline() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let start = clock.now(&[]).await;

    let mut timer = clock.new_timer(5 * SEC, &[]).await;
    assert!(timer.stop(&[]).await);
    assert!(!timer.stop(&[]).await);
    assert!(!timer.reset(2 * SEC, &[]).await);

    clock.advance(2 * SEC).must_wait(&ctx).await;
    assert_eq!(within(timer.recv()).await, start + 2 * SEC);

    clock.advance(10 * SEC).must_wait(&ctx).await;
    assert!(timer.try_recv().is_none());
}

#[test(tokio::test)]
async fn timer_stop_is_trappable() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let mut trap = clock.trap().timer_stop(&[]);

    let timer = clock.new_timer(HOUR, &[]).await;
    let (stopped, ()) = tokio::join!(timer.stop(&[]), async {
        trap.must_wait(&ctx).await.must_release(&ctx).await;
    });
    assert!(stopped);
}

#[test(tokio::test)]
async fn ticker_coalesces_to_the_oldest_unread_firing() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let start = clock.now(&[]).await;
    let mut trap_new = clock.trap().new_ticker(&["new"]);
    let mut trap_stop = clock.trap().ticker_stop(&["stop"]);
    let mut trap_reset = clock.trap().ticker_reset(&["reset"]);

    let producer = clock.clone();
    let task = tokio::spawn(async move { producer.new_ticker(HOUR, &["new"]).await });
    let call = trap_new.must_wait(&ctx).await;
    assert_eq!(call.duration, Some(HOUR));
    call.must_release(&ctx).await;
    let mut ticker = within(task).await.unwrap();

    for _ in 0..3 {
        clock.advance(HOUR).must_wait(&ctx).await;
    }
    // first firing buffered, the two later ones dropped
    assert_eq!(within(ticker.recv()).await, start + HOUR);

    // reset while the call is trapped; time moves under it before release
    let ((), duration) = tokio::join!(ticker.reset(MINUTE, &["reset"]), async {
        let call = trap_reset.must_wait(&ctx).await;
        clock.advance(SEC).must_wait(&ctx).await;
        let duration = call.duration;
        call.must_release(&ctx).await;
        duration
    });
    assert_eq!(duration, Some(MINUTE));

    clock.advance(MINUTE).must_wait(&ctx).await;
    let now = clock.now(&[]).await;
    assert_eq!(now, start + 3 * HOUR + SEC + MINUTE);
    // present-time tick: the dropped hourly firings left no residue
    assert_eq!(within(ticker.recv()).await, now);

    tokio::join!(ticker.stop(&["stop"]), async {
        trap_stop.must_wait(&ctx).await.must_release(&ctx).await;
    });
    clock.advance(HOUR).must_wait(&ctx).await;
    assert!(ticker.try_recv().is_none());

    // resetting after stop re-arms the same ticker
    tokio::join!(ticker.reset(MINUTE, &["reset"]), async {
        trap_reset.must_wait(&ctx).await.must_release(&ctx).await;
    });
    clock.advance(MINUTE).must_wait(&ctx).await;
    assert_eq!(within(ticker.recv()).await, clock.now(&[]).await);
}

#[test(tokio::test)]
async fn peek_tracks_the_next_deadline() {
    let ctx = test_ctx();
    let clock = Mock::new();

    assert_eq!(clock.peek(), (Duration::ZERO, false));

    let timer = clock.new_timer(SEC, &[]).await;
    assert_eq!(clock.peek(), (SEC, true));

    clock.advance(Duration::from_millis(999)).must_wait(&ctx).await;
    assert_eq!(clock.peek(), (Duration::from_millis(1), true));

    assert!(timer.stop(&[]).await);
    assert_eq!(clock.peek(), (Duration::ZERO, false));
}

#[test(tokio::test)]
async fn since_and_until_saturate_at_zero() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let start = clock.now(&[]).await;

    clock.advance(5 * SEC).must_wait(&ctx).await;
    assert_eq!(clock.since(start, &[]).await, 5 * SEC);
    assert_eq!(clock.until(start, &[]).await, Duration::ZERO);
    assert_eq!(clock.until(start + 8 * SEC, &[]).await, 3 * SEC);
    assert_eq!(clock.since(start + 10 * SEC, &[]).await, Duration::ZERO);
}

#[test(tokio::test)]
async fn since_records_the_queried_instant() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let start = clock.now(&[]).await;
    let mut trap = clock.trap().since(&[]);

    let (elapsed, time) = tokio::join!(clock.since(start, &[]), async {
        let call = trap.must_wait(&ctx).await;
        let time = call.time;
        // the elapsed time is read after release, not at the call
        clock.advance(SEC).must_wait(&ctx).await;
        call.must_release(&ctx).await;
        time
    });
    assert_eq!(time, Some(start));
    assert_eq!(elapsed, SEC);
}

#[test(tokio::test)]
async fn ticker_func_wait_blocks_while_callback_runs() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let cancel = CancellationToken::new();

    let tick_started = CancellationToken::new();
    let tick_done = CancellationToken::new();
    let started = tick_started.clone();
    let done = tick_done.clone();
    let handle = clock
        .ticker_func(
            cancel.clone(),
            SEC,
            move || {
                let started = started.clone();
                let done = done.clone();
                async move {
                    started.cancel();
                    done.cancelled().await;
                    anyhow::Ok(())
                }
            },
            &[],
        )
        .await;

    let waiter = clock.advance(SEC);
    within(tick_started.cancelled()).await;

    let mut wait_fut = pin!(handle.wait());
    cancel.cancel();
    // wait cannot resolve while the callback is still running
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut wait_fut)
            .await
            .is_err()
    );

    tick_done.cancel();
    let err = within(&mut wait_fut).await.unwrap_err();
    assert!(err.is_cancelled());
    waiter.must_wait(&ctx).await;
}

#[test(tokio::test)]
async fn ticker_func_drops_firings_that_overlap_a_run() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let cancel = CancellationToken::new();

    let tick_started = CancellationToken::new();
    let tick_done = CancellationToken::new();
    let started = tick_started.clone();
    let done = tick_done.clone();
    let handle = clock
        .ticker_func(
            cancel.clone(),
            SEC,
            move || {
                let started = started.clone();
                let done = done.clone();
                async move {
                    started.cancel();
                    done.cancelled().await;
                    Err(anyhow::anyhow!("callback error"))
                }
            },
            &[],
        )
        .await;

    let waiter = clock.advance(SEC);
    within(tick_started.cancelled()).await;

    // further firings while the callback is blocked complete immediately
    // and do not re-invoke it
    let mut elapsed = Duration::ZERO;
    while elapsed < 5 * SEC {
        let (step, step_waiter) = clock.advance_next();
        elapsed += step;
        step_waiter.must_wait(&ctx).await;
    }

    cancel.cancel();
    tick_done.cancel();
    // the callback's own error wins over the overlapping cancellation
    let err = within(handle.wait()).await.unwrap_err();
    assert!(
        matches!(&err, TickerFuncError::Callback(cause) if cause.to_string() == "callback error"),
        "wrong error: {err}"
    );
    waiter.must_wait(&ctx).await;
}

#[test(tokio::test)]
async fn multiple_traps_release_on_separate_tasks() {
    let ctx = test_ctx();
    let clock = Mock::new();

    let mut trap0 = clock.trap().now(&["0"]);
    let mut trap1 = clock.trap().now(&["1"]);

    let producer = clock.clone();
    let now_task = tokio::spawn(async move { producer.now(&["0", "1"]).await });

    let call0 = trap0.must_wait(&ctx).await;
    clock.advance(SEC).must_wait(&ctx).await;
    // each release blocks until the call returns, which needs the other
    // release; they must run on separate tasks
    let release_ctx = ctx.clone();
    let release0 = tokio::spawn(async move { call0.must_release(&release_ctx).await });
    let call1 = trap1.must_wait(&ctx).await;
    clock.advance(SEC).must_wait(&ctx).await;
    call1.must_release(&ctx).await;
    within(release0).await.unwrap();

    let got = within(now_task).await.unwrap();
    let end = clock.now(&["end"]).await;
    assert_eq!(got, end);
}

#[test(tokio::test)]
async fn serial_release_of_multiple_matches_deadlocks() {
    let harness = Arc::new(FailCapture::default());
    let clock = Mock::with_harness(harness.clone());
    let ctx = expiring_ctx(Duration::from_millis(500));

    let mut trap0 = clock.trap().now(&["0"]);
    let _trap1 = clock.trap().now(&["1"]);

    let producer = clock.clone();
    let _stuck = tokio::spawn(async move {
        let _ = producer.now(&["0", "1"]).await;
    });

    let call0 = trap0.must_wait(&ctx).await;
    // releasing on this task: the release blocks on the call returning,
    // the call blocks on the second release, the context expires
    call0.must_release(&ctx).await;
    assert!(harness.failed());
}

#[test(tokio::test)]
async fn unreleased_trapped_call_fails_the_test() {
    let harness = Arc::new(FailCapture::default());
    let clock = Mock::with_harness(harness.clone());
    let ctx = test_ctx();

    {
        let mut trap = clock.trap().now(&[]);
        let producer = clock.clone();
        tokio::spawn(async move {
            let _ = producer.now(&[]).await;
        });
        let _call = trap.must_wait(&ctx).await;
        // dropped without release
    }

    assert!(harness.failed());
    assert!(
        harness
            .messages
            .lock()
            .iter()
            .any(|m| m.contains("unreleased")),
        "missing unreleased-call report: {:?}",
        harness.messages.lock()
    );
}

#[test(tokio::test)]
async fn traps_only_match_their_tags() {
    let ctx = test_ctx();
    let clock = Mock::new();
    let mut trap = clock.trap().now(&["a"]);

    // no matching tag: passes straight through
    clock.now(&["b"]).await;

    let (_, ()) = tokio::join!(clock.now(&["b", "a"]), async {
        trap.must_wait(&ctx).await.must_release(&ctx).await;
    });
}

#[test(tokio::test)]
async fn logger_emits_one_line_per_operation() {
    let ctx = test_ctx();
    let logger = Arc::new(CaptureLogger::default());
    let clock = Mock::new().with_logger(logger.clone());

    clock.now(&["test", "Test_WithLogger"]).await;
    clock.new_timer(SEC, &["timer"]).await;
    clock.advance(Duration::from_millis(500)).must_wait(&ctx).await;

    let lines = logger.lines.lock().clone();
    assert_eq!(
        lines,
        vec![
            "Mock Clock - Now([test Test_WithLogger]) call, matched 0 traps",
            "Mock Clock - NewTimer(1s, [timer]) call, matched 0 traps",
            "Mock Clock - Advance(500ms)",
        ]
    );
}

#[test(tokio::test)]
async fn advance_next_requires_a_scheduled_event() {
    let harness = Arc::new(FailCapture::default());
    let clock = Mock::with_harness(harness.clone());
    let ctx = test_ctx();

    let (step, waiter) = clock.advance_next();
    waiter.must_wait(&ctx).await;
    assert_eq!(step, Duration::ZERO);
    assert!(harness.failed());
}

#[test(tokio::test)]
async fn zero_ticker_period_is_a_contract_violation() {
    let harness = Arc::new(FailCapture::default());
    let clock = Mock::with_harness(harness.clone());

    let _ticker = clock.new_ticker(Duration::ZERO, &[]).await;
    assert!(harness.failed());

    let handle = clock
        .ticker_func(
            CancellationToken::new(),
            Duration::ZERO,
            || async { anyhow::Ok(()) },
            &[],
        )
        .await;
    // the dud handle is already terminated
    assert!(within(handle.wait()).await.unwrap_err().is_cancelled());
}

#[test(tokio::test)]
async fn live_ticker_func_at_teardown_fails_the_test() {
    let harness = Arc::new(FailCapture::default());
    let clock = Mock::with_harness(harness.clone());

    let handle = clock
        .ticker_func(
            CancellationToken::new(),
            SEC,
            || async { anyhow::Ok(()) },
            &[],
        )
        .await;
    drop(handle);
    drop(clock);

    assert!(harness.failed());
}

#[test(tokio::test)]
async fn generic_code_can_run_against_the_mock() {
    async fn deadline_in<C: Clock>(clock: &C, d: Duration) -> std::time::SystemTime {
        clock.now(&[]).await + d
    }

    let ctx = test_ctx();
    let clock = Mock::new();
    let start = clock.now(&[]).await;
    assert_eq!(deadline_in(&clock, SEC).await, start + SEC);
    clock.advance(SEC).must_wait(&ctx).await;
    assert_eq!(deadline_in(&clock, SEC).await, start + 2 * SEC);
}
