// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::mock::Mock;
use crate::ticker::Ticker;
use crate::ticker_func::{self, BoxTickFn, TickerFuncHandle};
use crate::timer::{BoxCallback, RealFire, SharedCallback, Timer};

/// Clock operations shared by the real clock and the mock.
///
/// Production code takes a `C: Clock` and calls these; in tests a
/// [`Mock`] is injected and the same calls become trappable and
/// advanceable. The tag list on every operation exists for the mock's
/// traps — the real clock ignores it, and untagged code simply passes
/// `&[]`.
///
/// The operations are futures because a mock call parks at a trap
/// rendezvous until the test releases it; on the real clock they complete
/// immediately.
pub trait Clock: Clone + Send + Sync + 'static {
    /// The current instant.
    fn now(&self, tags: &[&str]) -> impl Future<Output = SystemTime> + Send;

    /// Time elapsed since `earlier`, saturating at zero.
    fn since(&self, earlier: SystemTime, tags: &[&str]) -> impl Future<Output = Duration> + Send;

    /// Time remaining until `later`, saturating at zero.
    fn until(&self, later: SystemTime, tags: &[&str]) -> impl Future<Output = Duration> + Send;

    /// A one-shot timer firing `duration` from now. Zero fires immediately.
    fn new_timer(&self, duration: Duration, tags: &[&str])
        -> impl Future<Output = Timer> + Send;

    /// Runs `callback` on a fresh service task `duration` from now. The
    /// returned handle's `stop`/`reset` control the underlying timer.
    fn after_func<F, Fut>(
        &self,
        duration: Duration,
        callback: F,
        tags: &[&str],
    ) -> impl Future<Output = Timer> + Send
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static;

    /// A repeating ticker with a positive period.
    fn new_ticker(&self, period: Duration, tags: &[&str])
        -> impl Future<Output = Ticker> + Send;

    /// A repeating callback bound to `cancel`, with non-overlap and
    /// run-to-completion shutdown. See [`TickerFuncHandle`].
    fn ticker_func<F, Fut>(
        &self,
        cancel: CancellationToken,
        period: Duration,
        callback: F,
        tags: &[&str],
    ) -> impl Future<Output = TickerFuncHandle> + Send
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static;
}

/// The host clock: trivial delegation to `SystemTime` and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self, _tags: &[&str]) -> impl Future<Output = SystemTime> + Send {
        std::future::ready(SystemTime::now())
    }

    fn since(&self, earlier: SystemTime, _tags: &[&str]) -> impl Future<Output = Duration> + Send {
        std::future::ready(
            SystemTime::now()
                .duration_since(earlier)
                .unwrap_or_default(),
        )
    }

    fn until(&self, later: SystemTime, _tags: &[&str]) -> impl Future<Output = Duration> + Send {
        std::future::ready(later.duration_since(SystemTime::now()).unwrap_or_default())
    }

    fn new_timer(
        &self,
        duration: Duration,
        _tags: &[&str],
    ) -> impl Future<Output = Timer> + Send {
        std::future::ready(Timer::real(duration, RealFire::Send))
    }

    fn after_func<F, Fut>(
        &self,
        duration: Duration,
        mut callback: F,
        _tags: &[&str],
    ) -> impl Future<Output = Timer> + Send
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: SharedCallback = Arc::new(tokio::sync::Mutex::new(
            Box::new(move || callback().boxed()) as BoxCallback,
        ));
        std::future::ready(Timer::real(duration, RealFire::Call(callback)))
    }

    fn new_ticker(&self, period: Duration, _tags: &[&str]) -> impl Future<Output = Ticker> + Send {
        std::future::ready(Ticker::real(period))
    }

    fn ticker_func<F, Fut>(
        &self,
        cancel: CancellationToken,
        period: Duration,
        mut callback: F,
        _tags: &[&str],
    ) -> impl Future<Output = TickerFuncHandle> + Send
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: BoxTickFn = Box::new(move || callback().boxed());
        std::future::ready(ticker_func::spawn_real(cancel, period, callback))
    }
}

impl Clock for Mock {
    fn now(&self, tags: &[&str]) -> impl Future<Output = SystemTime> + Send {
        Mock::now(self, tags)
    }

    fn since(&self, earlier: SystemTime, tags: &[&str]) -> impl Future<Output = Duration> + Send {
        Mock::since(self, earlier, tags)
    }

    fn until(&self, later: SystemTime, tags: &[&str]) -> impl Future<Output = Duration> + Send {
        Mock::until(self, later, tags)
    }

    fn new_timer(&self, duration: Duration, tags: &[&str]) -> impl Future<Output = Timer> + Send {
        Mock::new_timer(self, duration, tags)
    }

    fn after_func<F, Fut>(
        &self,
        duration: Duration,
        callback: F,
        tags: &[&str],
    ) -> impl Future<Output = Timer> + Send
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Mock::after_func(self, duration, callback, tags)
    }

    fn new_ticker(&self, period: Duration, tags: &[&str]) -> impl Future<Output = Ticker> + Send {
        Mock::new_ticker(self, period, tags)
    }

    fn ticker_func<F, Fut>(
        &self,
        cancel: CancellationToken,
        period: Duration,
        callback: F,
        tags: &[&str],
    ) -> impl Future<Output = TickerFuncHandle> + Send
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Mock::ticker_func(self, cancel, period, callback, tags)
    }
}
