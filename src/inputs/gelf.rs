// SPDX-License-Identifier: Apache-2.0

//! GELF input: UDP datagrams carrying zlib-, gzip- or uncompressed JSON
//! payloads, normalized into the envelope.

use std::io::Read;
use std::net::SocketAddr;

use chrono::{SecondsFormat, TimeZone, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{info, warn};

use crate::bounded_channel::BoundedSender;
use crate::event::{LogEvent, now_timestamp};

const ZLIB_MAGIC: [u8; 2] = [0x78, 0x9c];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const CHUNKED_MAGIC: [u8; 2] = [0x1e, 0x0f];

/// GELF over UDP caps datagrams well under this.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum GelfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunked datagrams are not reassembled")]
    Chunked,

    #[error("payload has no short_message")]
    MissingMessage,
}

#[derive(Debug, Clone)]
pub struct GelfInputConfig {
    pub address: SocketAddr,
    /// `@type` tag stamped on every event.
    pub kind: Option<String>,
}

pub struct GelfInput {
    config: GelfInputConfig,
}

impl GelfInput {
    pub fn new(config: GelfInputConfig) -> Self {
        Self { config }
    }

    pub async fn start(
        self,
        output: BoundedSender<LogEvent>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let socket = UdpSocket::bind(self.config.address).await.map_err(|e| -> BoxError {
            format!("GELF bind {} failed: {}", self.config.address, e).into()
        })?;
        info!(address = %self.config.address, "listening for GELF datagrams");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = select! {
                biased;
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            let (len, remote) = match received {
                Ok(r) => r,
                Err(err) => {
                    warn!(error = %err, "GELF receive error");
                    continue;
                }
            };

            match decode_datagram(&buf[..len], self.config.kind.as_deref()) {
                Ok(event) => {
                    if output.send(event).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(remote = %remote, error = %err, "dropping GELF datagram");
                }
            }
        }

        info!(address = %self.config.address, "GELF input stopped");
        Ok(())
    }
}

/// Route a datagram by its magic bytes and decode the JSON inside.
pub fn decode_datagram(data: &[u8], kind: Option<&str>) -> Result<LogEvent, GelfError> {
    let payload = if data.starts_with(&ZLIB_MAGIC) {
        let mut decoded = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut decoded)?;
        decoded
    } else if data.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(data).read_to_end(&mut decoded)?;
        decoded
    } else if data.starts_with(&CHUNKED_MAGIC) {
        return Err(GelfError::Chunked);
    } else {
        data.to_vec()
    };

    parse_gelf(&payload, kind)
}

/// Map decoded GELF JSON onto the envelope: `short_message` (or
/// `full_message`) becomes `@message`, `host` the source host, `timestamp`
/// (Unix seconds, defaulted to now when absent) the `@timestamp`;
/// everything else lands in `@fields`.
fn parse_gelf(payload: &[u8], kind: Option<&str>) -> Result<LogEvent, GelfError> {
    let mut decoded: Map<String, Value> = serde_json::from_slice(payload)?;

    let message = decoded
        .remove("short_message")
        .or_else(|| decoded.remove("full_message"))
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .ok_or(GelfError::MissingMessage)?;

    let source_host = decoded
        .remove("host")
        .and_then(|v| v.as_str().map(|s| s.to_string()));

    let timestamp = decoded
        .remove("timestamp")
        .and_then(|v| v.as_f64())
        .and_then(format_unix_seconds)
        .unwrap_or_else(now_timestamp);

    Ok(LogEvent {
        message,
        timestamp: Some(timestamp),
        source: None,
        source_host,
        kind: kind.map(|k| k.to_string()),
        fields: decoded,
        extra: Map::new(),
    })
}

fn format_unix_seconds(seconds: f64) -> Option<String> {
    let nanos = (seconds * 1e9) as i64;
    Utc.timestamp_nanos(nanos)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .into()
}
