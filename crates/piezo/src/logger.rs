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
use std::sync::Arc;

/// Sink for the mock clock's per-call log lines.
///
/// When installed via [`Mock::with_logger`](crate::Mock::with_logger), the
/// clock emits exactly one line per trappable operation and one per advance,
/// e.g. `Mock Clock - NewTimer(1s, [timer]) call, matched 0 traps`. This is
/// aimed at debugging tests that deadlock on an unexpected trap match;
/// ambient diagnostics go through `tracing` regardless.
pub trait Logger: Send + Sync {
    fn log(&self, line: fmt::Arguments<'_>);
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, line: fmt::Arguments<'_>) {
        (**self).log(line)
    }
}
