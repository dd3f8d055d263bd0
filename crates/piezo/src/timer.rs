// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mock::EventId;
use crate::Mock;

pub(crate) type BoxCallback = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;
pub(crate) type SharedCallback = Arc<tokio::sync::Mutex<BoxCallback>>;

/// A one-shot timer handle.
///
/// The firing instant is delivered through [`recv`](Self::recv) via a
/// capacity-1 slot: the send never blocks the clock, and an unread value
/// stays in the slot. Timers created with [`after_func`](crate::Clock::after_func)
/// run their callback instead and never deliver on the channel.
pub struct Timer {
    rx: mpsc::Receiver<SystemTime>,
    /// Keeps the channel open after stop/firing so a receive parks instead
    /// of observing a closed channel.
    _keepalive: mpsc::Sender<SystemTime>,
    backend: TimerBackend,
}

enum TimerBackend {
    Mock {
        clock: Mock,
        id: EventId,
        fire: MockTimerFire,
    },
    Real(RealTimer),
}

/// How a mock timer event fires; kept on the handle so `reset` can re-arm
/// an already-fired timer.
#[derive(Clone)]
pub(crate) enum MockTimerFire {
    Send(mpsc::Sender<SystemTime>),
    Call(SharedCallback),
}

impl Timer {
    pub(crate) fn mock(
        clock: Mock,
        id: EventId,
        fire: MockTimerFire,
        rx: mpsc::Receiver<SystemTime>,
        keepalive: mpsc::Sender<SystemTime>,
    ) -> Self {
        Self {
            rx,
            _keepalive: keepalive,
            backend: TimerBackend::Mock { clock, id, fire },
        }
    }

    pub(crate) fn real(duration: Duration, fire: RealFire) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let armed = Arc::new(AtomicBool::new(true));
        let task = spawn_fire(duration, armed.clone(), tx.clone(), fire.clone());
        Self {
            rx,
            _keepalive: tx.clone(),
            backend: TimerBackend::Real(RealTimer {
                tx,
                armed,
                fire,
                task: parking_lot::Mutex::new(Some(task)),
            }),
        }
    }

    /// Receives the firing instant. Parks forever if the timer was stopped
    /// before it fired.
    pub async fn recv(&mut self) -> SystemTime {
        self.rx
            .recv()
            .await
            .expect("timer channel stays open while the handle lives")
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<SystemTime> {
        self.rx.try_recv().ok()
    }

    /// Cancels the timer. Returns whether it was still pending.
    pub async fn stop(&self, tags: &[&str]) -> bool {
        match &self.backend {
            TimerBackend::Mock { clock, id, .. } => clock.timer_stop(*id, tags).await,
            TimerBackend::Real(real) => real.stop(),
        }
    }

    /// Re-arms the timer to fire after `duration`. Returns whether it was
    /// still pending beforehand.
    pub async fn reset(&self, duration: Duration, tags: &[&str]) -> bool {
        match &self.backend {
            TimerBackend::Mock { clock, id, fire } => {
                clock.timer_reset(*id, fire, duration, tags).await
            }
            TimerBackend::Real(real) => real.reset(duration),
        }
    }
}

struct RealTimer {
    tx: mpsc::Sender<SystemTime>,
    /// Cleared by whichever of {firing task, stop, reset} gets there first;
    /// the winner is the one that observed the timer as still pending.
    armed: Arc<AtomicBool>,
    fire: RealFire,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub(crate) enum RealFire {
    Send,
    Call(SharedCallback),
}

impl RealTimer {
    fn stop(&self) -> bool {
        let was_pending = self.armed.swap(false, Ordering::AcqRel);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        was_pending
    }

    fn reset(&self, duration: Duration) -> bool {
        let mut slot = self.task.lock();
        let was_pending = self.armed.swap(false, Ordering::AcqRel);
        if let Some(task) = slot.take() {
            task.abort();
        }
        self.armed.store(true, Ordering::Release);
        *slot = Some(spawn_fire(
            duration,
            self.armed.clone(),
            self.tx.clone(),
            self.fire.clone(),
        ));
        was_pending
    }
}

fn spawn_fire(
    duration: Duration,
    armed: Arc<AtomicBool>,
    tx: mpsc::Sender<SystemTime>,
    fire: RealFire,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        if !armed.swap(false, Ordering::AcqRel) {
            return;
        }
        match fire {
            RealFire::Send => {
                let _ = tx.try_send(SystemTime::now());
            }
            RealFire::Call(callback) => {
                let mut callback = callback.lock().await;
                (*callback)().await;
            }
        }
    })
}
