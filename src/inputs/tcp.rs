// SPDX-License-Identifier: Apache-2.0

//! Pull-style message socket input over TCP: peers connect and push
//! newline-framed JSON envelopes.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::event::LogEvent;

/// Frames longer than this are a protocol violation, not a log line.
const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TcpInputConfig {
    pub address: SocketAddr,
}

pub struct TcpInput {
    config: TcpInputConfig,
}

impl TcpInput {
    pub fn new(config: TcpInputConfig) -> Self {
        Self { config }
    }

    pub async fn start(
        self,
        output: BoundedSender<LogEvent>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let listener = TcpListener::bind(self.config.address).await.map_err(|e| -> BoxError {
            format!("tcp bind {} failed: {}", self.config.address, e).into()
        })?;
        info!(address = %self.config.address, "pull socket listening");

        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "pull socket connection accepted");
                        connections.spawn(handle_connection(
                            stream,
                            output.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // connection tasks observe the same cancellation; wait them out
        while connections.join_next().await.is_some() {}
        info!(address = %self.config.address, "pull socket stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    output: BoundedSender<LogEvent>,
    cancel: CancellationToken,
) {
    let codec = LinesCodec::new_with_max_length(MAX_FRAME_LENGTH);
    let mut framed = FramedRead::new(stream, codec);

    loop {
        let frame = select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        match frame {
            Some(Ok(line)) => match LogEvent::decode(&line) {
                Ok(event) => {
                    if output.send(event).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "unable to parse message"),
            },
            Some(Err(err)) => {
                warn!(error = %err, "pull socket framing error");
                break;
            }
            None => break,
        }
    }
    debug!("pull socket connection closed");
}
