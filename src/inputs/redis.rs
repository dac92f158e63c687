// SPDX-License-Identifier: Apache-2.0

//! Redis queue input: BLPOP on a list key, one JSON envelope per element.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{info, warn};

use crate::bounded_channel::BoundedSender;
use crate::event::LogEvent;
use crate::inputs::error_window::ErrorWindow;

/// Short BLPOP timeout so shutdown is prompt.
const BLPOP_TIMEOUT_SECS: u64 = 2;

/// Pause after a failed pop while the connection manager reconnects.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RedisQueueInputConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// List key to pop from.
    pub key: String,
    /// Override for the event `@type`.
    pub kind: Option<String>,
    /// Minimum spacing between repeated connection error logs.
    pub error_window: Duration,
}

impl RedisQueueInputConfig {
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
            kind: None,
            error_window: DEFAULT_ERROR_WINDOW,
        }
    }
}

pub struct RedisQueueInput {
    config: RedisQueueInputConfig,
}

impl RedisQueueInput {
    pub fn new(config: RedisQueueInputConfig) -> Self {
        Self { config }
    }

    pub async fn start(
        self,
        output: BoundedSender<LogEvent>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let client = redis::Client::open(self.config.url.as_str())
            .map_err(|e| -> BoxError { format!("redis url {}: {}", self.config.url, e).into() })?;
        let mut conn = ConnectionManager::new(client).await.map_err(|e| -> BoxError {
            format!("redis connect {}: {}", self.config.url, e).into()
        })?;

        info!(url = %self.config.url, key = %self.config.key, "listening on Redis queue");
        let mut errors = ErrorWindow::new(
            format!("redis input {}", self.config.url),
            self.config.error_window,
        );

        loop {
            let popped = select! {
                biased;
                _ = cancel.cancelled() => break,
                popped = blpop(&mut conn, &self.config.key) => popped,
            };

            match popped {
                Ok(Some((_key, payload))) => {
                    errors.clear();
                    let Some(event) = self.decode(&payload) else {
                        continue;
                    };
                    if output.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    // pop timed out with an empty queue
                    errors.clear();
                }
                Err(err) => {
                    errors.report(&err);
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_PAUSE) => {}
                    }
                }
            }
        }

        info!(key = %self.config.key, "Redis queue input stopped");
        Ok(())
    }

    fn decode(&self, payload: &str) -> Option<LogEvent> {
        match LogEvent::decode(payload) {
            Ok(mut event) => {
                if let Some(kind) = &self.config.kind {
                    event.kind = Some(kind.clone());
                }
                Some(event)
            }
            Err(err) => {
                warn!(error = %err, "unable to parse queue payload");
                None
            }
        }
    }
}

async fn blpop(
    conn: &mut ConnectionManager,
    key: &str,
) -> redis::RedisResult<Option<(String, String)>> {
    redis::cmd("BLPOP")
        .arg(key)
        .arg(BLPOP_TIMEOUT_SECS)
        .query_async(conn)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: Option<&str>) -> RedisQueueInput {
        let mut config = RedisQueueInputConfig::new("redis://127.0.0.1:6379", "logs");
        config.kind = kind.map(|k| k.to_string());
        RedisQueueInput::new(config)
    }

    #[test]
    fn decode_overrides_type() {
        let event = input(Some("queued"))
            .decode(r#"{"@message":"m","@type":"original"}"#)
            .unwrap();
        assert_eq!(event.kind.as_deref(), Some("queued"));
    }

    #[test]
    fn decode_keeps_type_when_unconfigured() {
        let event = input(None)
            .decode(r#"{"@message":"m","@type":"original"}"#)
            .unwrap();
        assert_eq!(event.kind.as_deref(), Some("original"));
    }

    #[test]
    fn undecodable_payload_is_dropped() {
        assert!(input(None).decode("not json").is_none());
        assert!(input(None).decode(r#"{"no_message":true}"#).is_none());
    }
}
