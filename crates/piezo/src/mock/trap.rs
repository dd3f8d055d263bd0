// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Traps suspend clock calls at a rendezvous with the test.
//!
//! A trap is registered for one operation, optionally narrowed by tags. When
//! a matching call enters the clock it parks before touching any state, the
//! test picks it up with [`Trap::must_wait`], inspects its arguments, drives
//! the clock however it likes, and finally releases it. Releasing blocks
//! until the call has finished its mutation and returned, which gives tests
//! a happens-before edge on the exact interleaving they staged.
//!
//! There is no central scheduler: each trapped call carries its own release
//! signal (a oneshot) and completion latch (a cancellation token). A call
//! matched by several traps waits for the join of all release signals, so
//! releasing two instances from the same task deadlocks by design — the
//! first release cannot observe completion until the second is sent. Fan
//! releases out onto separate tasks.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::harness::TestHarness;
use crate::WaitCancelled;

use super::Mock;

/// The trappable clock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Now,
    Since,
    Until,
    NewTimer,
    AfterFunc,
    TimerStop,
    TimerReset,
    NewTicker,
    TickerStop,
    TickerReset,
    TickerFunc,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Now => "Now",
            Op::Since => "Since",
            Op::Until => "Until",
            Op::NewTimer => "NewTimer",
            Op::AfterFunc => "AfterFunc",
            Op::TimerStop => "TimerStop",
            Op::TimerReset => "TimerReset",
            Op::NewTicker => "NewTicker",
            Op::TickerStop => "TickerStop",
            Op::TickerReset => "TickerReset",
            Op::TickerFunc => "TickerFunc",
        };
        f.write_str(name)
    }
}

/// A call matches a trap when every trap tag appears in the call's tags.
/// A trap with no tags matches every call on its operation.
pub(crate) fn tags_match(trap_tags: &[String], call_tags: &[&str]) -> bool {
    trap_tags.iter().all(|t| call_tags.contains(&t.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrapId(u64);

impl TrapId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Registry-side record of a live trap.
pub(crate) struct TrapEntry {
    pub(crate) id: TrapId,
    op: Op,
    tags: Vec<String>,
    calls: mpsc::UnboundedSender<TrappedCall>,
    unreleased: Arc<AtomicUsize>,
}

/// Registers traps, one factory method per trappable operation.
///
/// Obtained from [`Mock::trap`].
pub struct TrapFactory {
    clock: Mock,
}

macro_rules! trap_constructor {
    ($(#[$doc:meta])* $name:ident, $op:expr) => {
        $(#[$doc])*
        pub fn $name(&self, tags: &[&str]) -> Trap {
            self.register($op, tags)
        }
    };
}

impl TrapFactory {
    pub(crate) fn new(clock: Mock) -> Self {
        Self { clock }
    }

    trap_constructor!(
        /// Traps [`Mock::now`] calls.
        now, Op::Now);
    trap_constructor!(
        /// Traps [`Mock::since`] calls.
        since, Op::Since);
    trap_constructor!(
        /// Traps [`Mock::until`] calls.
        until, Op::Until);
    trap_constructor!(
        /// Traps [`Mock::new_timer`] calls.
        new_timer, Op::NewTimer);
    trap_constructor!(
        /// Traps [`Mock::after_func`] calls.
        after_func, Op::AfterFunc);
    trap_constructor!(
        /// Traps [`Timer::stop`](crate::Timer::stop) calls.
        timer_stop, Op::TimerStop);
    trap_constructor!(
        /// Traps [`Timer::reset`](crate::Timer::reset) calls.
        timer_reset, Op::TimerReset);
    trap_constructor!(
        /// Traps [`Mock::new_ticker`] calls.
        new_ticker, Op::NewTicker);
    trap_constructor!(
        /// Traps [`Ticker::stop`](crate::Ticker::stop) calls.
        ticker_stop, Op::TickerStop);
    trap_constructor!(
        /// Traps [`Ticker::reset`](crate::Ticker::reset) calls.
        ticker_reset, Op::TickerReset);
    trap_constructor!(
        /// Traps [`Mock::ticker_func`] calls.
        ticker_func, Op::TickerFunc);

    fn register(&self, op: Op, tags: &[&str]) -> Trap {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let unreleased = Arc::new(AtomicUsize::new(0));
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();

        let id = {
            let mut core = self.clock.inner.core.lock();
            let id = core.alloc_trap_id();
            core.traps.push(TrapEntry {
                id,
                op,
                tags: tags.clone(),
                calls: calls_tx,
                unreleased: unreleased.clone(),
            });
            id
        };
        trace!(%op, ?tags, "trap registered");

        Trap {
            clock: self.clock.clone(),
            id,
            op,
            calls: calls_rx,
            unreleased,
        }
    }
}

/// A live interceptor for one clock operation.
///
/// Dropping the trap deregisters it; any call it trapped that was never
/// released is reported fatally at that point.
pub struct Trap {
    clock: Mock,
    id: TrapId,
    op: Op,
    calls: mpsc::UnboundedReceiver<TrappedCall>,
    unreleased: Arc<AtomicUsize>,
}

impl Trap {
    /// Waits for the next trapped call, in FIFO order.
    pub async fn wait(&mut self, ctx: &CancellationToken) -> Result<TrappedCall, WaitCancelled> {
        tokio::select! {
            call = self.calls.recv() => {
                Ok(call.expect("registry holds the sender while the trap is live"))
            }
            _ = ctx.cancelled() => Err(WaitCancelled),
        }
    }

    /// Like [`wait`](Self::wait), but fatal on context expiry.
    pub async fn must_wait(&mut self, ctx: &CancellationToken) -> TrappedCall {
        match self.wait(ctx).await {
            Ok(call) => call,
            Err(WaitCancelled) => {
                let message =
                    format!("context cancelled waiting for a call trapped on {}", self.op);
                self.clock.inner.harness.fatal(message.clone());
                // reached only with a non-stopping harness
                panic!("{message}");
            }
        }
    }
}

impl Drop for Trap {
    fn drop(&mut self) {
        self.clock
            .inner
            .core
            .lock()
            .traps
            .retain(|entry| entry.id != self.id);

        let unreleased = self.unreleased.load(Ordering::Relaxed);
        if unreleased > 0 {
            let message = format!(
                "trap on {} closed with {unreleased} unreleased call(s)",
                self.op
            );
            if std::thread::panicking() {
                self.clock.inner.harness.error(message);
            } else {
                self.clock.inner.harness.fatal(message);
            }
        }
    }
}

/// One suspension instance produced by a match between a call and a trap.
///
/// The producing call does not proceed until every instance it produced has
/// been released.
pub struct TrappedCall {
    op: Op,
    /// The duration argument of the trapped call, for the operations that
    /// take one.
    pub duration: Option<Duration>,
    /// The instant argument of the trapped call (`since`/`until`).
    pub time: Option<SystemTime>,
    /// The tags the call was made with.
    pub tags: Vec<String>,
    release: Option<oneshot::Sender<()>>,
    completed: CancellationToken,
    unreleased: Arc<AtomicUsize>,
    harness: Arc<dyn TestHarness>,
}

impl TrappedCall {
    /// The operation this call entered the clock through.
    pub fn op(&self) -> Op {
        self.op
    }

    /// Releases the call and waits until it has returned.
    ///
    /// When several traps matched the same call, the call returns only once
    /// all of them released it — release each instance from its own task.
    pub async fn release(mut self, ctx: &CancellationToken) -> Result<(), WaitCancelled> {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
        self.unreleased.fetch_sub(1, Ordering::Relaxed);
        tokio::select! {
            _ = self.completed.cancelled() => Ok(()),
            _ = ctx.cancelled() => Err(WaitCancelled),
        }
    }

    /// Like [`release`](Self::release), but fatal on context expiry.
    pub async fn must_release(self, ctx: &CancellationToken) {
        let op = self.op;
        let harness = self.harness.clone();
        if self.release(ctx).await.is_err() {
            harness.fatal(format!(
                "context cancelled while releasing a trapped {op} call; \
                 are all matching traps being released on separate tasks?"
            ));
        }
    }
}

/// Call-side state of the rendezvous: the release signals still owed to the
/// call, and the completion latch fired once the call has returned.
///
/// Dropping the rendezvous fires the latch, so releasers observe completion
/// even if the call future is dropped mid-flight.
pub(crate) struct CallRendezvous {
    releases: Vec<oneshot::Receiver<()>>,
    completed: CancellationToken,
}

impl CallRendezvous {
    /// Suspends until every matching trap has released this call. A dropped
    /// trap counts as released so the call is not wedged forever.
    pub(crate) async fn released(&mut self) {
        for release in self.releases.drain(..) {
            let _ = release.await;
        }
    }
}

impl Drop for CallRendezvous {
    fn drop(&mut self) {
        self.completed.cancel();
    }
}

/// Matches `(op, tags)` against the live traps, enqueueing one trapped call
/// per match. Returns the rendezvous and the number of matched traps.
pub(crate) fn match_traps(
    traps: &[TrapEntry],
    harness: &Arc<dyn TestHarness>,
    op: Op,
    duration: Option<Duration>,
    time: Option<SystemTime>,
    call_tags: &[&str],
) -> (CallRendezvous, usize) {
    let completed = CancellationToken::new();
    let mut releases = Vec::new();

    for entry in traps {
        if entry.op != op || !tags_match(&entry.tags, call_tags) {
            continue;
        }
        let (release_tx, release_rx) = oneshot::channel();
        entry.unreleased.fetch_add(1, Ordering::Relaxed);
        let call = TrappedCall {
            op,
            duration,
            time,
            tags: call_tags.iter().map(|t| t.to_string()).collect(),
            release: Some(release_tx),
            completed: completed.clone(),
            unreleased: entry.unreleased.clone(),
            harness: harness.clone(),
        };
        if entry.calls.send(call).is_ok() {
            releases.push(release_rx);
        } else {
            // trap dropped between deregistration and now; not a match
            entry.unreleased.fetch_sub(1, Ordering::Relaxed);
        }
    }

    let matched = releases.len();
    (CallRendezvous { releases, completed }, matched)
}
