// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mock::EventId;
use crate::Mock;

/// A repeating ticker handle.
///
/// Firing instants are delivered through a capacity-1 coalescing slot: when
/// nobody reads between firings, the slot keeps the *oldest* unread firing
/// and newer ones are dropped, so the next read observes the first firing
/// that was missed.
pub struct Ticker {
    rx: mpsc::Receiver<SystemTime>,
    /// Keeps the channel open across stop/reset cycles.
    _keepalive: mpsc::Sender<SystemTime>,
    backend: TickerBackend,
}

enum TickerBackend {
    Mock {
        clock: Mock,
        id: EventId,
        tx: mpsc::Sender<SystemTime>,
    },
    Real(RealTicker),
}

impl Ticker {
    pub(crate) fn mock(
        clock: Mock,
        id: EventId,
        tx: mpsc::Sender<SystemTime>,
        rx: mpsc::Receiver<SystemTime>,
    ) -> Self {
        Self {
            rx,
            _keepalive: tx.clone(),
            backend: TickerBackend::Mock { clock, id, tx },
        }
    }

    pub(crate) fn real(period: Duration) -> Self {
        assert!(!period.is_zero(), "ticker period must be positive");
        let (tx, rx) = mpsc::channel(1);
        let task = spawn_ticks(period, tx.clone());
        Self {
            rx,
            _keepalive: tx.clone(),
            backend: TickerBackend::Real(RealTicker {
                tx,
                task: parking_lot::Mutex::new(Some(task)),
            }),
        }
    }

    /// Receives the next (oldest unread) firing instant.
    pub async fn recv(&mut self) -> SystemTime {
        self.rx
            .recv()
            .await
            .expect("ticker channel stays open while the handle lives")
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<SystemTime> {
        self.rx.try_recv().ok()
    }

    /// Stops the ticker. The channel is left open; an unread firing stays
    /// readable. The ticker can be re-armed with [`reset`](Self::reset).
    pub async fn stop(&self, tags: &[&str]) {
        match &self.backend {
            TickerBackend::Mock { clock, id, .. } => clock.ticker_stop(*id, tags).await,
            TickerBackend::Real(real) => real.stop(),
        }
    }

    /// Replaces the period and schedules the next firing one full period
    /// from now. Valid after [`stop`](Self::stop). The period must be
    /// positive.
    pub async fn reset(&self, period: Duration, tags: &[&str]) {
        match &self.backend {
            TickerBackend::Mock { clock, id, tx } => {
                clock.ticker_reset(*id, tx, period, tags).await
            }
            TickerBackend::Real(real) => real.reset(period),
        }
    }
}

struct RealTicker {
    tx: mpsc::Sender<SystemTime>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RealTicker {
    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn reset(&self, period: Duration) {
        assert!(!period.is_zero(), "ticker period must be positive");
        let mut slot = self.task.lock();
        if let Some(task) = slot.take() {
            task.abort();
        }
        *slot = Some(spawn_ticks(period, self.tx.clone()));
    }
}

fn spawn_ticks(period: Duration, tx: mpsc::Sender<SystemTime>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            // coalescing send: a full slot keeps its unread value
            let _ = tx.try_send(SystemTime::now());
        }
    })
}
