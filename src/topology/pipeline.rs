// SPDX-License-Identifier: Apache-2.0

//! Envelope pipeline: one merged stream from all inputs, fanned out to
//! every output.

use std::error::Error;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, SendError};
use crate::event::LogEvent;

pub struct Pipeline {
    receiver: BoundedReceiver<LogEvent>,
    outputs: Vec<BoundedSender<LogEvent>>,
}

impl Pipeline {
    pub fn new(receiver: BoundedReceiver<LogEvent>, outputs: Vec<BoundedSender<LogEvent>>) -> Self {
        Self { receiver, outputs }
    }

    pub async fn start(
        &mut self,
        pipeline_token: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
        if self.outputs.is_empty() {
            warn!("pipeline has no outputs; events will be discarded");
        }

        let res = self.run(pipeline_token).await;
        match res {
            Ok(()) => {
                event!(Level::INFO, "Pipeline returned from run loop successfully");
            }
            Err(ref e) => {
                event!(
                    Level::ERROR,
                    error = %e,
                    "Pipeline returned from run loop with error."
                );
            }
        }
        Ok(())
    }

    async fn run(
        &mut self,
        pipeline_token: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
        loop {
            select! {
                item = self.receiver.next() => {
                    let Some(event) = item else {
                        warn!("Pipeline receiver found None on call to .next(), exiting main loop.");
                        return Ok(());
                    };
                    match self.fan_out(event, &pipeline_token).await {
                        Ok(()) => {}
                        Err(SendItemError::Cancelled) => {
                            event!(Level::INFO, "Pipeline received shutdown signal, exiting main pipeline loop.");
                            return Ok(());
                        }
                        Err(SendItemError::Disconnected) => {
                            event!(Level::ERROR, "output channel closed, exiting main pipeline loop");
                            return Ok(());
                        }
                    }
                },

                _ = pipeline_token.cancelled() => {
                    event!(Level::INFO, "Pipeline received shutdown signal, exiting main pipeline loop.");
                    return Ok(())
                }
            }
        }
    }

    /// Deliver one event to every output in order, cloning for all
    /// consumers except the last.
    async fn fan_out(
        &self,
        event: LogEvent,
        cancel: &CancellationToken,
    ) -> Result<(), SendItemError> {
        let last = self.outputs.len().saturating_sub(1);
        let mut event = Some(event);
        for (index, output) in self.outputs.iter().enumerate() {
            let item = if index == last {
                match event.take() {
                    Some(item) => item,
                    None => return Ok(()),
                }
            } else {
                match event.as_ref() {
                    Some(item) => item.clone(),
                    None => return Ok(()),
                }
            };
            self.send_item(output, item, cancel).await?;
        }
        Ok(())
    }

    // send item to one output channel, bailing on shutdown
    async fn send_item(
        &self,
        output: &BoundedSender<LogEvent>,
        item: LogEvent,
        cancel: &CancellationToken,
    ) -> Result<(), SendItemError> {
        select! {
            res = output.send(item) => {
                match res {
                    Ok(_) => Ok(()),
                    Err(SendError::Disconnected) => Err(SendItemError::Disconnected),
                }
            },
            _ = cancel.cancelled() => {
                Err(SendItemError::Cancelled)
            }
        }
    }
}

enum SendItemError {
    Cancelled,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use tokio::spawn;

    fn sample(message: &str) -> LogEvent {
        LogEvent::from_line(message, "test", None)
    }

    #[tokio::test]
    async fn fan_out_preserves_order_per_output() {
        let (in_tx, in_rx) = bounded(16);
        let (out1_tx, mut out1_rx) = bounded(16);
        let (out2_tx, mut out2_rx) = bounded(16);

        let mut pipeline = Pipeline::new(in_rx, vec![out1_tx, out2_tx]);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let handle = spawn(async move { pipeline.start(stop).await });

        for message in ["one", "two", "three"] {
            in_tx.send(sample(message)).await.unwrap();
        }

        for rx in [&mut out1_rx, &mut out2_rx] {
            for expected in ["one", "two", "three"] {
                let event = rx.next().await.unwrap();
                assert_eq!(event.message, expected);
            }
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exits_when_inputs_hang_up() {
        let (in_tx, in_rx) = bounded::<LogEvent>(4);
        let (out_tx, _out_rx) = bounded(4);

        let mut pipeline = Pipeline::new(in_rx, vec![out_tx]);
        let handle = spawn(async move { pipeline.start(CancellationToken::new()).await });

        drop(in_tx);
        handle.await.unwrap().unwrap();
    }
}
