// SPDX-License-Identifier: Apache-2.0

//! Debounce window for rotation confirmation.

use std::future::pending;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// A cancel-and-reschedule deadline. `schedule` arms (or re-arms) a single
/// deadline measured from now; `fired` resolves once when it elapses and
/// pends forever while disarmed. Rescheduling before the deadline fully
/// replaces it, so a burst of filesystem events collapses into one firing
/// measured from the most recent event.
#[derive(Debug, Default)]
pub struct RotationCoordinator {
    deadline: Option<Instant>,
}

impl RotationCoordinator {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    pub fn schedule(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Wait for the armed deadline. Disarms itself on firing, so each arm
    /// fires at most once. Safe to drop and re-poll from a `select!` loop:
    /// the deadline lives here, not in the future.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => pending::<()>().await,
        }
    }
}
