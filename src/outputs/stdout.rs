// SPDX-License-Identifier: Apache-2.0

//! Stdout sink: one JSON envelope per line.

use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::event::LogEvent;

pub struct StdoutOutput {
    rx: BoundedReceiver<LogEvent>,
}

impl StdoutOutput {
    pub fn new(rx: BoundedReceiver<LogEvent>) -> Self {
        Self { rx }
    }

    pub async fn start(&mut self, cancel: CancellationToken) {
        let mut stdout = tokio::io::stdout();
        loop {
            select! {
                event = self.rx.next() => match event {
                    Some(event) => write_event(&mut stdout, &event).await,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        debug!("exiting stdout output");
    }
}

async fn write_event(stdout: &mut tokio::io::Stdout, event: &LogEvent) {
    let line = match event.to_json() {
        Ok(line) => line,
        Err(err) => {
            warn!(error = %err, "unable to serialize event");
            return;
        }
    };
    if let Err(err) = async {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await
    }
    .await
    {
        warn!(error = %err, "stdout write failed");
    }
}
