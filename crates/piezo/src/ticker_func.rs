// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Callback tickers: a periodic callback with re-entrancy protection and
//! graceful shutdown.
//!
//! A callback ticker is bound to a cancellation token and a fallible
//! callback. At most one invocation is in flight at any instant; firings
//! that come due while the callback runs are dropped. The handle terminates
//! when the callback returns an error, or when the token is cancelled — but
//! never while an invocation is still running. A run that overlaps
//! cancellation finishes first, and if it returns an error, that error wins
//! over the cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::mock::EventId;

pub(crate) type BoxTickFn = Box<dyn FnMut() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Why a callback ticker terminated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TickerFuncError {
    /// The cancellation token fired and no callback run was in flight (or
    /// the overlapping run finished cleanly).
    #[error("callback ticker cancelled")]
    Cancelled,
    /// A callback invocation returned an error.
    #[error("tick callback failed: {0}")]
    Callback(Arc<anyhow::Error>),
}

impl TickerFuncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TickerFuncError::Cancelled)
    }
}

/// Handle to a running callback ticker.
///
/// On the mock clock, a callback ticker still live when the clock is
/// dropped is reported as a test failure: cancel its token and [`wait`]
/// before the test ends.
///
/// [`wait`]: TickerFuncHandle::wait
pub struct TickerFuncHandle {
    done: CancellationToken,
    terminal: Arc<parking_lot::Mutex<Option<TickerFuncError>>>,
}

impl TickerFuncHandle {
    pub(crate) fn new(
        done: CancellationToken,
        terminal: Arc<parking_lot::Mutex<Option<TickerFuncError>>>,
    ) -> Self {
        Self { done, terminal }
    }

    /// Blocks until the ticker has terminated and returns the terminal
    /// error: the callback's own error, or [`TickerFuncError::Cancelled`].
    ///
    /// Ordered after the return of any in-flight callback.
    pub async fn wait(&self) -> Result<(), TickerFuncError> {
        self.done.cancelled().await;
        Err(self
            .terminal
            .lock()
            .clone()
            .expect("terminal error is recorded before the done latch fires"))
    }
}

/// Mock-side state shared between the handle, the scheduled event, and the
/// service tasks. All transitions happen under the clock core lock, then the
/// run flag's own lock, in that order.
pub(crate) struct TickShared {
    pub(crate) id: EventId,
    pub(crate) cancel: CancellationToken,
    pub(crate) done: CancellationToken,
    pub(crate) terminal: Arc<parking_lot::Mutex<Option<TickerFuncError>>>,
    pub(crate) run: parking_lot::Mutex<RunState>,
    pub(crate) callback: tokio::sync::Mutex<BoxTickFn>,
}

#[derive(Default)]
pub(crate) struct RunState {
    pub(crate) running: bool,
    pub(crate) terminated: bool,
}

impl TickShared {
    pub(crate) fn new(id: EventId, cancel: CancellationToken, callback: BoxTickFn) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancel,
            done: CancellationToken::new(),
            terminal: Arc::new(parking_lot::Mutex::new(None)),
            run: parking_lot::Mutex::new(RunState::default()),
            callback: tokio::sync::Mutex::new(callback),
        })
    }

    pub(crate) fn handle(&self) -> TickerFuncHandle {
        TickerFuncHandle::new(self.done.clone(), self.terminal.clone())
    }
}

/// Real-clock callback ticker: a plain service loop on tokio time.
///
/// Cancellation is only observed between invocations, which is exactly the
/// run-to-completion rule the mock enforces.
pub(crate) fn spawn_real(
    cancel: CancellationToken,
    period: Duration,
    mut callback: BoxTickFn,
) -> TickerFuncHandle {
    assert!(!period.is_zero(), "callback ticker period must be positive");

    let done = CancellationToken::new();
    let terminal = Arc::new(parking_lot::Mutex::new(None));
    let handle = TickerFuncHandle::new(done.clone(), terminal.clone());

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let error = loop {
            tokio::select! {
                _ = cancel.cancelled() => break TickerFuncError::Cancelled,
                _ = interval.tick() => {
                    if let Err(err) = callback().await {
                        break TickerFuncError::Callback(Arc::new(err));
                    }
                    if cancel.is_cancelled() {
                        break TickerFuncError::Cancelled;
                    }
                }
            }
        };
        *terminal.lock() = Some(error);
        done.cancel();
    });

    handle
}
