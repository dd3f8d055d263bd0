// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::harness::TestHarness;
use crate::WaitCancelled;

/// Resolves once every service task spawned by one advance has quiesced.
///
/// Channel deliveries complete during the advance itself; what the waiter
/// tracks are the callback invocations ([`Mock::after_func`](crate::Mock::after_func)
/// and [`Mock::ticker_func`](crate::Mock::ticker_func)) the advance kicked
/// off. Sequencing `advance(d)` then `must_wait(ctx)` therefore gives the
/// test a happens-before edge over all side effects of the jump.
#[must_use = "await the waiter to synchronize with the service tasks the advance spawned"]
pub struct AdvanceWaiter {
    harness: Arc<dyn TestHarness>,
    service_tasks: Vec<JoinHandle<()>>,
}

impl AdvanceWaiter {
    pub(crate) fn new(harness: Arc<dyn TestHarness>, service_tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            harness,
            service_tasks,
        }
    }

    /// Waits for quiescence. A panicking callback resurfaces here.
    pub async fn wait(self, ctx: &CancellationToken) -> Result<(), WaitCancelled> {
        for task in self.service_tasks {
            tokio::select! {
                result = task => {
                    if let Err(join_error) = result {
                        if join_error.is_panic() {
                            std::panic::resume_unwind(join_error.into_panic());
                        }
                    }
                }
                _ = ctx.cancelled() => return Err(WaitCancelled),
            }
        }
        Ok(())
    }

    /// Like [`wait`](Self::wait), but fatal on context expiry.
    pub async fn must_wait(self, ctx: &CancellationToken) {
        let harness = self.harness.clone();
        if self.wait(ctx).await.is_err() {
            harness.fatal(
                "context cancelled waiting for an advance to quiesce; \
                 is a service callback stuck?"
                    .to_string(),
            );
        }
    }
}
