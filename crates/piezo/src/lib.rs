// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A deterministic virtual clock for testing time-dependent concurrent code.
//!
//! Code that schedules work against wall-clock time is miserable to test:
//! either the test sleeps (slow and flaky) or it fakes time with ad-hoc
//! atomics (racy). This crate provides a [`Clock`] trait with two
//! implementations: [`RealClock`], a trivial passthrough to the host clock,
//! and [`Mock`], a virtual clock whose time only moves when the test says
//! so.
//!
//! The mock gives tests two levers:
//!
//! - [`Mock::advance`] jumps time forward, servicing due timers and tickers
//!   in deadline order and returning an [`AdvanceWaiter`] that resolves
//!   once every callback the jump kicked off has finished.
//! - [`Mock::trap`] intercepts clock calls made by the code under test:
//!   the call parks until the test has inspected it and released it, which
//!   pins down otherwise racy interleavings exactly.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::time::Duration;
//!
//! use piezo::Mock;
//! use tokio_util::sync::CancellationToken;
//!
//! let ctx = CancellationToken::new();
//! let clock = Mock::new();
//! let start = clock.now(&[]).await;
//!
//! let mut timer = clock.new_timer(Duration::from_secs(30), &[]).await;
//! clock.advance(Duration::from_secs(30)).must_wait(&ctx).await;
//!
//! assert_eq!(timer.recv().await, start + Duration::from_secs(30));
//! # }
//! ```

mod clock;
mod harness;
mod logger;
mod mock;
mod ticker;
mod ticker_func;
mod timer;

pub use clock::{Clock, RealClock};
pub use harness::{PanicHarness, TestHarness};
pub use logger::Logger;
pub use mock::{AdvanceWaiter, Mock, Op, Trap, TrapFactory, TrappedCall};
pub use ticker::Ticker;
pub use ticker_func::{TickerFuncError, TickerFuncHandle};
pub use timer::Timer;

/// The context governing a wait or release expired before the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("context cancelled while waiting")]
pub struct WaitCancelled;
