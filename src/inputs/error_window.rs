// SPDX-License-Identifier: Apache-2.0

//! Rate-limited error reporting for chattering backends.

use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Logs a fault at ERROR at most once per window; repeats within the
/// window are demoted to DEBUG. Keeps a flapping queue connection from
/// flooding the logs while it retries.
pub struct ErrorWindow {
    window: Duration,
    last_reported: Option<Instant>,
    context: String,
}

impl ErrorWindow {
    pub fn new(context: impl Into<String>, window: Duration) -> Self {
        Self {
            window,
            last_reported: None,
            context: context.into(),
        }
    }

    pub fn report(&mut self, err: &dyn std::fmt::Display) {
        let due = self
            .last_reported
            .map_or(true, |last| last.elapsed() >= self.window);
        if due {
            error!(context = %self.context, error = %err, "backend error");
            self.last_reported = Some(Instant::now());
        } else {
            debug!(context = %self.context, error = %err, "backend error (repeated)");
        }
    }

    /// Back to quiet; the next fault is reported at ERROR again.
    pub fn clear(&mut self) {
        self.last_reported = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_report_is_due() {
        let mut window = ErrorWindow::new("test", Duration::from_secs(10));
        assert!(window.last_reported.is_none());
        window.report(&"boom");
        assert!(window.last_reported.is_some());
    }

    #[test]
    fn repeat_within_window_keeps_timestamp() {
        let mut window = ErrorWindow::new("test", Duration::from_secs(10));
        window.report(&"boom");
        let first = window.last_reported;
        window.report(&"boom again");
        assert_eq!(first, window.last_reported);
    }

    #[test]
    fn clear_rearms_reporting() {
        let mut window = ErrorWindow::new("test", Duration::from_secs(10));
        window.report(&"boom");
        window.clear();
        assert!(window.last_reported.is_none());
    }
}
