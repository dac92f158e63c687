// SPDX-License-Identifier: Apache-2.0

//! Redis queue output: RPUSH of each envelope onto a list key, with
//! `#{field}` interpolation in the key pattern.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::event::LogEvent;
use crate::inputs::error_window::ErrorWindow;

const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RedisQueueOutputConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// List key pattern; `#{field}` references resolve per event, so
    /// `logs:#{@type}` shards the queue by event type.
    pub key: String,
    /// Minimum spacing between repeated connection error logs.
    pub error_window: Duration,
}

impl RedisQueueOutputConfig {
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
            error_window: DEFAULT_ERROR_WINDOW,
        }
    }
}

pub struct RedisQueueOutput {
    config: RedisQueueOutputConfig,
    rx: BoundedReceiver<LogEvent>,
}

impl RedisQueueOutput {
    pub fn new(config: RedisQueueOutputConfig, rx: BoundedReceiver<LogEvent>) -> Self {
        Self { config, rx }
    }

    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), BoxError> {
        let client = redis::Client::open(self.config.url.as_str())
            .map_err(|e| -> BoxError { format!("redis url {}: {}", self.config.url, e).into() })?;
        let mut conn = ConnectionManager::new(client).await.map_err(|e| -> BoxError {
            format!("redis connect {}: {}", self.config.url, e).into()
        })?;

        info!(url = %self.config.url, key = %self.config.key, "Redis queue output ready");
        let mut errors = ErrorWindow::new(
            format!("redis output {}", self.config.url),
            self.config.error_window,
        );

        loop {
            let event = select! {
                event = self.rx.next() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            let key = event.interpolate(&self.config.key);
            let payload = match event.to_json() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "unable to serialize event");
                    continue;
                }
            };

            let pushed: redis::RedisResult<()> = redis::cmd("RPUSH")
                .arg(&key)
                .arg(&payload)
                .query_async(&mut conn)
                .await;
            match pushed {
                Ok(()) => errors.clear(),
                Err(err) => errors.report(&err),
            }
        }

        debug!("exiting Redis queue output");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_pattern_interpolation() {
        let mut event = LogEvent::from_line("m", "src", Some("nginx"));
        event
            .fields
            .insert("dc".to_string(), serde_json::Value::from("eu-1"));

        let config = RedisQueueOutputConfig::new("redis://localhost", "logs:#{@type}:#{dc}");
        assert_eq!(event.interpolate(&config.key), "logs:nginx:eu-1");
    }
}
