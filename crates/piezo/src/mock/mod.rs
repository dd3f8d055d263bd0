// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The mock clock.
//!
//! [`Mock`] owns the current instant, the scheduled-event set, and the trap
//! registry behind one mutex. Production code drives it through the same
//! [`Clock`](crate::Clock) operations as the real clock; tests move time
//! with [`advance`](Mock::advance) and pin interleavings with traps.
//!
//! The mutex is held only across state mutations. Trapped calls park
//! *before* taking it, and an advance returns before its service callbacks
//! finish — synchronizing with those is what the returned
//! [`AdvanceWaiter`] is for.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::harness::{PanicHarness, TestHarness};
use crate::logger::Logger;
use crate::ticker::Ticker;
use crate::ticker_func::{BoxTickFn, RunState, TickShared, TickerFuncError, TickerFuncHandle};
use crate::timer::{BoxCallback, MockTimerFire, SharedCallback, Timer};

mod event_queue;
mod trap;
mod waiter;

#[cfg(test)]
mod tests;

pub use trap::{Op, Trap, TrapFactory, TrappedCall};
pub use waiter::AdvanceWaiter;

pub(crate) use event_queue::{EventId, EventQueue};
use trap::{CallRendezvous, TrapEntry, TrapId};

/// The default epoch, 2024-01-01T00:00:00Z. An arbitrary but fixed date so
/// that assertion failures print stable, readable timestamps.
const DEFAULT_EPOCH_SECS: u64 = 1_704_067_200;

/// A deterministic virtual clock.
///
/// Cloning is cheap and clones share the same timeline; handles and traps
/// hold clones internally. Time never moves on its own: it only jumps when
/// a test calls [`advance`](Mock::advance) or
/// [`advance_next`](Mock::advance_next), which service due firings in
/// deadline order and pin the new instant exactly `d` later.
#[derive(Clone)]
pub struct Mock {
    pub(crate) inner: Arc<MockInner>,
}

pub(crate) struct MockInner {
    pub(crate) harness: Arc<dyn TestHarness>,
    pub(crate) core: parking_lot::Mutex<Core>,
}

pub(crate) struct Core {
    now: SystemTime,
    events: EventQueue<EventKind>,
    pub(crate) traps: Vec<TrapEntry>,
    next_trap_id: u64,
    logger: Option<Arc<dyn Logger>>,
    live_ticker_funcs: usize,
}

pub(crate) enum EventKind {
    Timer {
        tx: mpsc::Sender<SystemTime>,
    },
    AfterFunc {
        callback: SharedCallback,
    },
    Ticker {
        tx: mpsc::Sender<SystemTime>,
        period: Duration,
    },
    TickerFunc {
        shared: Arc<TickShared>,
        period: Duration,
    },
}

impl Core {
    pub(crate) fn alloc_trap_id(&mut self) -> TrapId {
        let id = TrapId::new(self.next_trap_id);
        self.next_trap_id += 1;
        id
    }

    fn log_line(&self, line: fmt::Arguments<'_>) {
        if let Some(logger) = &self.logger {
            logger.log(line);
        }
    }
}

impl Default for Mock {
    fn default() -> Self {
        Self::new()
    }
}

impl Mock {
    /// A mock clock starting at the default epoch, failing through panics.
    pub fn new() -> Self {
        Self::at(SystemTime::UNIX_EPOCH + Duration::from_secs(DEFAULT_EPOCH_SECS))
    }

    /// A mock clock starting at `epoch`.
    pub fn at(epoch: SystemTime) -> Self {
        Self::build(epoch, Arc::new(PanicHarness::default()))
    }

    /// A mock clock reporting failures through the given harness instead of
    /// panicking.
    pub fn with_harness(harness: Arc<dyn TestHarness>) -> Self {
        Self::build(
            SystemTime::UNIX_EPOCH + Duration::from_secs(DEFAULT_EPOCH_SECS),
            harness,
        )
    }

    fn build(epoch: SystemTime, harness: Arc<dyn TestHarness>) -> Self {
        Self {
            inner: Arc::new(MockInner {
                harness,
                core: parking_lot::Mutex::new(Core {
                    now: epoch,
                    events: EventQueue::default(),
                    traps: Vec::new(),
                    next_trap_id: 0,
                    logger: None,
                    live_ticker_funcs: 0,
                }),
            }),
        }
    }

    /// Installs a logger that receives one line per trappable operation and
    /// per advance.
    pub fn with_logger(self, logger: impl Logger + 'static) -> Self {
        self.inner.core.lock().logger = Some(Arc::new(logger));
        self
    }

    /// The trap factory for this clock.
    pub fn trap(&self) -> TrapFactory {
        TrapFactory::new(self.clone())
    }

    /// The current instant. Suspends while trapped.
    pub async fn now(&self, tags: &[&str]) -> SystemTime {
        let mut rendezvous = self.begin_call(Op::Now, None, None, tags);
        rendezvous.released().await;
        self.inner.core.lock().now
    }

    /// Time elapsed since `earlier`, saturating at zero.
    pub async fn since(&self, earlier: SystemTime, tags: &[&str]) -> Duration {
        let mut rendezvous = self.begin_call(Op::Since, None, Some(earlier), tags);
        rendezvous.released().await;
        let now = self.inner.core.lock().now;
        now.duration_since(earlier).unwrap_or_default()
    }

    /// Time remaining until `later`, saturating at zero.
    pub async fn until(&self, later: SystemTime, tags: &[&str]) -> Duration {
        let mut rendezvous = self.begin_call(Op::Until, None, Some(later), tags);
        rendezvous.released().await;
        let now = self.inner.core.lock().now;
        later.duration_since(now).unwrap_or_default()
    }

    /// Schedules a one-shot timer `duration` from now.
    ///
    /// A zero duration delivers the current instant into the timer's slot
    /// before this returns; no advance is needed to observe it.
    pub async fn new_timer(&self, duration: Duration, tags: &[&str]) -> Timer {
        let mut rendezvous = self.begin_call(Op::NewTimer, Some(duration), None, tags);
        rendezvous.released().await;
        let (tx, rx) = mpsc::channel(1);
        let id = {
            let mut core = self.inner.core.lock();
            let id = core.events.alloc();
            if duration.is_zero() {
                let _ = tx.try_send(core.now);
            } else {
                let deadline = core.now + duration;
                core.events
                    .insert(id, deadline, EventKind::Timer { tx: tx.clone() });
            }
            id
        };
        Timer::mock(self.clone(), id, MockTimerFire::Send(tx.clone()), rx, tx)
    }

    /// Schedules `callback` to run on a fresh service task `duration` from
    /// now. With a zero duration the task is dispatched before this returns.
    pub async fn after_func<F, Fut>(
        &self,
        duration: Duration,
        mut callback: F,
        tags: &[&str],
    ) -> Timer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut rendezvous = self.begin_call(Op::AfterFunc, Some(duration), None, tags);
        rendezvous.released().await;
        let callback: SharedCallback = Arc::new(tokio::sync::Mutex::new(
            Box::new(move || callback().boxed()) as BoxCallback,
        ));
        let (tx, rx) = mpsc::channel(1);
        let id = {
            let mut core = self.inner.core.lock();
            let id = core.events.alloc();
            if duration.is_zero() {
                let _ = spawn_callback(callback.clone());
            } else {
                let deadline = core.now + duration;
                core.events.insert(
                    id,
                    deadline,
                    EventKind::AfterFunc {
                        callback: callback.clone(),
                    },
                );
            }
            id
        };
        Timer::mock(self.clone(), id, MockTimerFire::Call(callback), rx, tx)
    }

    /// Schedules a repeating ticker, first firing one `period` from now.
    /// The period must be positive.
    pub async fn new_ticker(&self, period: Duration, tags: &[&str]) -> Ticker {
        let mut rendezvous = self.begin_call(Op::NewTicker, Some(period), None, tags);
        rendezvous.released().await;
        let (tx, rx) = mpsc::channel(1);
        let id = {
            let mut core = self.inner.core.lock();
            let id = core.events.alloc();
            if period.is_zero() {
                drop(core);
                self.inner
                    .harness
                    .fatal("ticker period must be positive".to_string());
            } else {
                let deadline = core.now + period;
                core.events.insert(
                    id,
                    deadline,
                    EventKind::Ticker {
                        tx: tx.clone(),
                        period,
                    },
                );
            }
            id
        };
        Ticker::mock(self.clone(), id, tx, rx)
    }

    /// Schedules a callback ticker bound to `cancel`. The period must be
    /// positive. See [`TickerFuncHandle`] for the termination rules; a
    /// handle still live when the clock is dropped fails the test.
    pub async fn ticker_func<F, Fut>(
        &self,
        cancel: CancellationToken,
        period: Duration,
        mut callback: F,
        tags: &[&str],
    ) -> TickerFuncHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut rendezvous = self.begin_call(Op::TickerFunc, Some(period), None, tags);
        rendezvous.released().await;
        let callback: BoxTickFn = Box::new(move || callback().boxed());
        if period.is_zero() {
            self.inner
                .harness
                .fatal("callback ticker period must be positive".to_string());
            // non-stopping harness: hand back an already-terminated handle
            let done = CancellationToken::new();
            done.cancel();
            return TickerFuncHandle::new(
                done,
                Arc::new(parking_lot::Mutex::new(Some(TickerFuncError::Cancelled))),
            );
        }
        let shared = {
            let mut core = self.inner.core.lock();
            let id = core.events.alloc();
            let shared = TickShared::new(id, cancel, callback);
            let deadline = core.now + period;
            core.events.insert(
                id,
                deadline,
                EventKind::TickerFunc {
                    shared: shared.clone(),
                    period,
                },
            );
            core.live_ticker_funcs += 1;
            shared
        };
        self.spawn_cancel_watcher(shared.clone());
        shared.handle()
    }

    /// The interval to the next scheduled firing, and whether one exists.
    /// Never trapped, never logged.
    pub fn peek(&self) -> (Duration, bool) {
        let core = self.inner.core.lock();
        if core.events.is_empty() {
            return (Duration::ZERO, false);
        }
        let deadline = core
            .events
            .next_deadline()
            .expect("a non-empty event set has an earliest deadline");
        (
            deadline
                .duration_since(core.now)
                .expect("scheduled deadlines never precede the current instant"),
            true,
        )
    }

    /// Moves the clock forward by exactly `duration`, servicing every due
    /// firing in deadline order along the way.
    ///
    /// Must be called from within a tokio runtime. Concurrent advances are
    /// not supported; tests serialize them.
    pub fn advance(&self, duration: Duration) -> AdvanceWaiter {
        let mut service_tasks = Vec::new();
        {
            let mut core = self.inner.core.lock();
            core.log_line(format_args!(
                "Mock Clock - Advance({})",
                humantime::format_duration(duration)
            ));
            trace!(duration = %humantime::format_duration(duration), "advance");
            let target = core.now + duration;
            self.advance_locked(&mut core, target, &mut service_tasks);
        }
        AdvanceWaiter::new(self.inner.harness.clone(), service_tasks)
    }

    /// Advances exactly to the next scheduled firing, returning how far the
    /// clock moved. Fatal when nothing is scheduled.
    pub fn advance_next(&self) -> (Duration, AdvanceWaiter) {
        let mut service_tasks = Vec::new();
        let step = {
            let mut core = self.inner.core.lock();
            core.log_line(format_args!("Mock Clock - AdvanceNext()"));
            match core.events.next_deadline() {
                Some(deadline) => {
                    let step = deadline
                        .duration_since(core.now)
                        .expect("scheduled deadlines never precede the current instant");
                    trace!(step = %humantime::format_duration(step), "advance to next firing");
                    self.advance_locked(&mut core, deadline, &mut service_tasks);
                    step
                }
                None => {
                    drop(core);
                    self.inner
                        .harness
                        .fatal("advance_next requires a scheduled event".to_string());
                    Duration::ZERO
                }
            }
        };
        (
            step,
            AdvanceWaiter::new(self.inner.harness.clone(), service_tasks),
        )
    }

    fn advance_locked(
        &self,
        core: &mut Core,
        target: SystemTime,
        service_tasks: &mut Vec<JoinHandle<()>>,
    ) {
        while let Some((id, deadline, kind)) = core.events.pop_due(target) {
            core.now = deadline;
            self.fire_event(core, id, deadline, kind, service_tasks);
        }
        core.now = target;
    }

    fn fire_event(
        &self,
        core: &mut Core,
        id: EventId,
        deadline: SystemTime,
        kind: EventKind,
        service_tasks: &mut Vec<JoinHandle<()>>,
    ) {
        match kind {
            EventKind::Timer { tx } => {
                // coalescing send: a full slot keeps its unread value
                let _ = tx.try_send(deadline);
            }
            EventKind::AfterFunc { callback } => {
                service_tasks.push(spawn_callback(callback));
            }
            EventKind::Ticker { tx, period } => {
                let _ = tx.try_send(deadline);
                core.events
                    .insert(id, deadline + period, EventKind::Ticker { tx, period });
            }
            EventKind::TickerFunc { shared, period } => {
                core.events.insert(
                    id,
                    deadline + period,
                    EventKind::TickerFunc {
                        shared: shared.clone(),
                        period,
                    },
                );
                let starts_run = {
                    let mut run = shared.run.lock();
                    if run.running || run.terminated {
                        // drop the firing; the scheduled event above keeps
                        // the cadence
                        false
                    } else {
                        run.running = true;
                        true
                    }
                };
                if starts_run {
                    service_tasks.push(self.spawn_tick(shared));
                }
            }
        }
    }

    /// Runs one callback-ticker invocation and applies the termination
    /// rules when it returns.
    fn spawn_tick(&self, shared: Arc<TickShared>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let result = {
                let mut callback = shared.callback.lock().await;
                (*callback)().await
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut core = inner.core.lock();
            let mut run = shared.run.lock();
            run.running = false;
            if run.terminated {
                return;
            }
            match result {
                Err(err) => finish_ticker_func(
                    &mut core,
                    &shared,
                    &mut run,
                    TickerFuncError::Callback(Arc::new(err)),
                ),
                // a run that overlapped cancellation terminates the handle,
                // but its own error takes precedence above
                Ok(()) if shared.cancel.is_cancelled() => {
                    finish_ticker_func(&mut core, &shared, &mut run, TickerFuncError::Cancelled)
                }
                Ok(()) => {}
            }
        })
    }

    /// Terminates an idle callback ticker as soon as its token fires. A
    /// running invocation owns the termination decision instead.
    fn spawn_cancel_watcher(&self, shared: Arc<TickShared>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.cancel.cancelled() => {}
                _ = shared.done.cancelled() => return,
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut core = inner.core.lock();
            let mut run = shared.run.lock();
            if run.terminated || run.running {
                return;
            }
            finish_ticker_func(&mut core, &shared, &mut run, TickerFuncError::Cancelled);
        });
    }

    pub(crate) async fn timer_stop(&self, id: EventId, tags: &[&str]) -> bool {
        let mut rendezvous = self.begin_call(Op::TimerStop, None, None, tags);
        rendezvous.released().await;
        self.inner.core.lock().events.remove(id).is_some()
    }

    pub(crate) async fn timer_reset(
        &self,
        id: EventId,
        fire: &MockTimerFire,
        duration: Duration,
        tags: &[&str],
    ) -> bool {
        let mut rendezvous = self.begin_call(Op::TimerReset, Some(duration), None, tags);
        rendezvous.released().await;
        let mut core = self.inner.core.lock();
        let was_pending = core.events.remove(id).is_some();
        if duration.is_zero() {
            match fire {
                MockTimerFire::Send(tx) => {
                    let _ = tx.try_send(core.now);
                }
                MockTimerFire::Call(callback) => {
                    let _ = spawn_callback(callback.clone());
                }
            }
        } else {
            let deadline = core.now + duration;
            let kind = match fire {
                MockTimerFire::Send(tx) => EventKind::Timer { tx: tx.clone() },
                MockTimerFire::Call(callback) => EventKind::AfterFunc {
                    callback: callback.clone(),
                },
            };
            core.events.insert(id, deadline, kind);
        }
        was_pending
    }

    pub(crate) async fn ticker_stop(&self, id: EventId, tags: &[&str]) {
        let mut rendezvous = self.begin_call(Op::TickerStop, None, None, tags);
        rendezvous.released().await;
        self.inner.core.lock().events.remove(id);
    }

    pub(crate) async fn ticker_reset(
        &self,
        id: EventId,
        tx: &mpsc::Sender<SystemTime>,
        period: Duration,
        tags: &[&str],
    ) {
        let mut rendezvous = self.begin_call(Op::TickerReset, Some(period), None, tags);
        rendezvous.released().await;
        if period.is_zero() {
            self.inner
                .harness
                .fatal("ticker period must be positive".to_string());
            return;
        }
        let mut core = self.inner.core.lock();
        core.events.remove(id);
        let deadline = core.now + period;
        core.events.insert(
            id,
            deadline,
            EventKind::Ticker {
                tx: tx.clone(),
                period,
            },
        );
    }

    /// Matches the call against the live traps and emits its log line. The
    /// caller parks on the returned rendezvous before touching any state.
    fn begin_call(
        &self,
        op: Op,
        duration: Option<Duration>,
        time: Option<SystemTime>,
        tags: &[&str],
    ) -> CallRendezvous {
        let core = self.inner.core.lock();
        let (rendezvous, matched) =
            trap::match_traps(&core.traps, &self.inner.harness, op, duration, time, tags);
        match duration {
            Some(duration) => core.log_line(format_args!(
                "Mock Clock - {op}({}, [{}]) call, matched {matched} traps",
                humantime::format_duration(duration),
                tags.join(" ")
            )),
            None => core.log_line(format_args!(
                "Mock Clock - {op}([{}]) call, matched {matched} traps",
                tags.join(" ")
            )),
        }
        trace!(%op, ?tags, matched, "clock call");
        rendezvous
    }
}

fn spawn_callback(callback: SharedCallback) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut callback = callback.lock().await;
        (*callback)().await;
    })
}

fn finish_ticker_func(
    core: &mut Core,
    shared: &TickShared,
    run: &mut RunState,
    error: TickerFuncError,
) {
    run.terminated = true;
    core.events.remove(shared.id);
    core.live_ticker_funcs -= 1;
    *shared.terminal.lock() = Some(error);
    shared.done.cancel();
}

impl Drop for MockInner {
    fn drop(&mut self) {
        let live = self.core.get_mut().live_ticker_funcs;
        if live > 0 {
            let message = format!(
                "{live} callback ticker(s) still live at clock teardown; \
                 cancel them and wait() before the test ends"
            );
            if std::thread::panicking() {
                self.harness.error(message);
            } else {
                self.harness.fatal(message);
            }
        }
    }
}
