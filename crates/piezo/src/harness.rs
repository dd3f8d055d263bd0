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

/// Receives failure reports from the mock clock.
///
/// The clock reports contract violations (non-positive ticker periods,
/// advancing past an empty schedule), expired wait contexts, and lifecycle
/// leaks (unreleased trapped calls, callback tickers that never terminated)
/// through this trait instead of returning errors, because every one of them
/// is a bug in the test rather than a runtime condition.
///
/// The default harness is [`PanicHarness`]. Tests that exercise failure
/// paths of the clock itself can install a recording implementation via
/// [`Mock::with_harness`](crate::Mock::with_harness).
pub trait TestHarness: Send + Sync {
    /// Reports a non-fatal failure. The test keeps running.
    fn error(&self, message: String);

    /// Reports a fatal failure. Implementations are expected to stop the
    /// test; the default harness panics.
    fn fatal(&self, message: String);

    /// Whether any failure has been reported.
    fn failed(&self) -> bool;
}

/// The default harness: fatal reports panic, matching how Rust tests fail.
#[derive(Debug, Default)]
pub struct PanicHarness {
    any_failure: AtomicBool,
}

impl TestHarness for PanicHarness {
    fn error(&self, message: String) {
        self.any_failure.store(true, Ordering::Relaxed);
        eprintln!("mock clock failure: {message}");
    }

    fn fatal(&self, message: String) {
        self.any_failure.store(true, Ordering::Relaxed);
        panic!("{message}");
    }

    fn failed(&self) -> bool {
        self.any_failure.load(Ordering::Relaxed)
    }
}
