// SPDX-License-Identifier: Apache-2.0

//! File input: tails one file through the rotation-aware monitor (or the
//! poll-based follower) and decodes each line into the envelope.

use std::path::PathBuf;
use std::time::Duration;

use encoding_rs::Encoding;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::event::LogEvent;
use crate::monitor::{FileMonitor, MonitorConfig, MonitorEvent, TailFollower};

#[derive(Debug, Clone)]
pub struct FileInputConfig {
    pub path: PathBuf,
    /// `@type` tag for fallback envelopes.
    pub kind: Option<String>,
    /// Explicit starting byte; absent means tail from the current end.
    pub start_offset: Option<u64>,
    /// Select the poll-based follower instead of the notification engine.
    pub use_tail: bool,
    pub buffer_size: Option<usize>,
    /// Text encoding label, e.g. "utf-8".
    pub buffer_encoding: Option<String>,
    pub wait_delay_after_renaming: Option<Duration>,
}

impl FileInputConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: None,
            start_offset: None,
            use_tail: false,
            buffer_size: None,
            buffer_encoding: None,
            wait_delay_after_renaming: None,
        }
    }

    fn monitor_config(&self) -> Result<MonitorConfig, BoxError> {
        let mut config = MonitorConfig {
            wait_delay_after_renaming: self.wait_delay_after_renaming,
            ..MonitorConfig::default()
        };
        if let Some(size) = self.buffer_size {
            config.read_buffer_size = size;
        }
        if let Some(label) = &self.buffer_encoding {
            config.buffer_encoding = Encoding::for_label(label.as_bytes())
                .ok_or_else(|| -> BoxError { format!("unknown encoding: {}", label).into() })?;
        }
        Ok(config)
    }
}

pub struct FileInput {
    config: FileInputConfig,
}

impl FileInput {
    pub fn new(config: FileInputConfig) -> Self {
        Self { config }
    }

    pub async fn start(
        self,
        output: BoundedSender<LogEvent>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let monitor_config = self.config.monitor_config()?;
        info!(path = ?self.config.path, use_tail = self.config.use_tail, "starting file input");

        if self.config.use_tail {
            let mut follower = TailFollower::new(&self.config.path, monitor_config);
            let mut events = follower
                .events()
                .ok_or_else(|| -> BoxError { "event stream already taken".into() })?;
            follower.start(self.config.start_offset);
            let result = self.consume(&mut events, &output, &cancel).await;
            self.drain_during(follower.close(), &mut events, &output).await;
            result
        } else {
            let mut monitor = FileMonitor::new(&self.config.path, monitor_config);
            let mut events = monitor
                .events()
                .ok_or_else(|| -> BoxError { "event stream already taken".into() })?;
            monitor.start(self.config.start_offset);
            let result = self.consume(&mut events, &output, &cancel).await;
            self.drain_during(monitor.close(), &mut events, &output).await;
            result
        }
    }

    async fn consume(
        &self,
        events: &mut BoundedReceiver<MonitorEvent>,
        output: &BoundedSender<LogEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        loop {
            let event = select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !self.handle(event, output).await? {
                break;
            }
        }
        Ok(())
    }

    /// Keep the event stream moving while the engine tears down, then
    /// forward whatever records it had already read.
    async fn drain_during(
        &self,
        close: impl std::future::Future<Output = ()>,
        events: &mut BoundedReceiver<MonitorEvent>,
        output: &BoundedSender<LogEvent>,
    ) {
        tokio::pin!(close);
        loop {
            select! {
                biased;
                _ = &mut close => break,
                event = events.next() => {
                    if let Some(MonitorEvent::Data(line)) = event {
                        let _ = output.send(self.decode(&line)).await;
                    }
                }
            }
        }
        while let Some(event) = events.try_recv() {
            if let MonitorEvent::Data(line) = event {
                let _ = output.send(self.decode(&line)).await;
            }
        }
    }

    /// Returns Ok(false) when the pipeline hung up, Err on fatal init.
    async fn handle(
        &self,
        event: MonitorEvent,
        output: &BoundedSender<LogEvent>,
    ) -> Result<bool, BoxError> {
        match event {
            MonitorEvent::Data(line) => {
                Ok(output.send(self.decode(&line)).await.is_ok())
            }
            MonitorEvent::InitError(err) => {
                Err(format!("file input {:?}: {}", self.config.path, err).into())
            }
            MonitorEvent::Error(err) => {
                warn!(path = ?self.config.path, error = %err, "file monitor error");
                Ok(true)
            }
            MonitorEvent::Changed => {
                debug!(path = ?self.config.path, "file changed");
                Ok(true)
            }
            MonitorEvent::Renamed => {
                debug!(path = ?self.config.path, "file renamed, awaiting rotation");
                Ok(true)
            }
            MonitorEvent::Closed => {
                debug!(path = ?self.config.path, "file handle closed");
                Ok(true)
            }
        }
    }

    /// Decode a line as a full envelope; anything else rides in the
    /// raw-line fallback.
    fn decode(&self, line: &str) -> LogEvent {
        let source = self.config.path.to_string_lossy();
        match LogEvent::decode(line) {
            Ok(event) => event,
            Err(_) => LogEvent::from_line(line, &source, self.config.kind.as_deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[test]
    fn monitor_config_honors_options() {
        let mut config = FileInputConfig::new("/var/log/app.log");
        config.buffer_size = Some(4096);
        config.buffer_encoding = Some("windows-1252".to_string());
        config.wait_delay_after_renaming = Some(Duration::from_millis(500));

        let mc = config.monitor_config().unwrap();
        assert_eq!(mc.read_buffer_size, 4096);
        assert_eq!(mc.buffer_encoding, encoding_rs::WINDOWS_1252);
        assert_eq!(
            mc.wait_delay_after_renaming,
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let mut config = FileInputConfig::new("/var/log/app.log");
        config.buffer_encoding = Some("no-such-encoding".to_string());
        assert!(config.monitor_config().is_err());
    }

    #[test]
    fn decode_falls_back_to_raw_line() {
        let input = FileInput::new({
            let mut c = FileInputConfig::new("/var/log/app.log");
            c.kind = Some("nginx".to_string());
            c
        });

        let event = input.decode("plain line");
        assert_eq!(event.message, "plain line");
        assert_eq!(event.source.as_deref(), Some("/var/log/app.log"));
        assert_eq!(event.kind.as_deref(), Some("nginx"));

        let event = input.decode(r#"{"@message":"already enveloped","@type":"app"}"#);
        assert_eq!(event.message, "already enveloped");
        assert_eq!(event.kind.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn missing_parent_aborts_startup() {
        let input = FileInput::new(FileInputConfig::new("/tailpipe_no_such_dir/app.log"));
        let (tx, _rx) = bounded(8);

        let result = input.start(tx, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn lines_become_envelopes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();

        let mut config = FileInputConfig::new(&path);
        config.kind = Some("test".to_string());
        config.start_offset = Some(0);
        let input = FileInput::new(config);

        let (tx, mut rx) = bounded(8);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let task = tokio::spawn(input.start(tx, cancel));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"hello\n").unwrap();
        drop(f);

        let event = timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("input hung up");
        assert_eq!(event.message, "hello");
        assert_eq!(event.kind.as_deref(), Some("test"));

        stop.cancel();
        task.await.unwrap().unwrap();
    }
}
