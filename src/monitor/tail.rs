// SPDX-License-Identifier: Apache-2.0

//! Alternate "continuously follow" strategy.
//!
//! Instead of filesystem notifications, the follower stats the path on an
//! interval and reads whatever appeared since the last poll, reopening when
//! the path points at a different file. Selected per input with `use_tail`;
//! same event contract and lifecycle as [`FileMonitor`].
//!
//! [`FileMonitor`]: crate::monitor::file::FileMonitor

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::monitor::assembler::LineAssembler;
use crate::monitor::error::MonitorError;
use crate::monitor::file::{MonitorConfig, MonitorEvent};
use crate::monitor::tracker::{FileIdent, OffsetTracker};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const EVENT_QUEUE_SIZE: usize = 1024;

pub struct TailFollower {
    path: PathBuf,
    config: MonitorConfig,
    poll_interval: Duration,
    events_tx: BoundedSender<MonitorEvent>,
    events_rx: Option<BoundedReceiver<MonitorEvent>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TailFollower {
    pub fn new(path: impl Into<PathBuf>, config: MonitorConfig) -> Self {
        let (events_tx, events_rx) = bounded_channel::bounded(EVENT_QUEUE_SIZE);
        Self {
            path: path.into(),
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn events(&mut self) -> Option<BoundedReceiver<MonitorEvent>> {
        self.events_rx.take()
    }

    pub fn start(&mut self, offset: Option<u64>) {
        if self.task.is_some() {
            return;
        }
        let follower = Follower {
            path: self.path.clone(),
            events: self.events_tx.clone(),
            cancel: self.cancel.clone(),
            tracker: OffsetTracker::new(),
            assembler: LineAssembler::new(self.config.buffer_encoding),
            read_buffer_size: self.config.read_buffer_size,
            poll_interval: self.poll_interval,
            file: None,
            initial_offset: offset,
            first_probe: true,
        };
        self.task = Some(tokio::spawn(follower.run()));
    }

    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct Follower {
    path: PathBuf,
    events: BoundedSender<MonitorEvent>,
    cancel: CancellationToken,
    tracker: OffsetTracker,
    assembler: LineAssembler,
    read_buffer_size: usize,
    poll_interval: Duration,
    file: Option<File>,
    initial_offset: Option<u64>,
    first_probe: bool,
}

impl Follower {
    async fn run(mut self) {
        let parent_exists = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false)
            }
            _ => false,
        };
        if !parent_exists {
            let dir = self
                .path
                .parent()
                .unwrap_or(self.path.as_path())
                .to_path_buf();
            let _ = self
                .emit(MonitorEvent::InitError(MonitorError::ParentDirMissing(dir)))
                .await;
            return;
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        debug!(path = ?self.path, "tail follower started");

        loop {
            select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.poll().await {
                        break;
                    }
                }
            }
        }

        if self.file.take().is_some() {
            let _ = self.emit(MonitorEvent::Closed).await;
        }
        debug!(path = ?self.path, "tail follower closed");
    }

    async fn emit(&self, event: MonitorEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn poll(&mut self) -> bool {
        let probe = tokio::fs::metadata(&self.path).await;
        let first_probe = std::mem::replace(&mut self.first_probe, false);
        let has_file = self.file.is_some();

        match probe {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if has_file {
                    // path is gone; finish the old file and wait for a new one
                    return self.release().await;
                }
                true
            }
            Err(err) => self.emit(MonitorEvent::Error(err.into())).await,
            Ok(metadata) if !has_file => {
                let fallback = if first_probe { metadata.len() } else { 0 };
                let target = self.initial_offset.take().unwrap_or(fallback);
                self.open(target).await
            }
            Ok(metadata) => {
                if Some(FileIdent::of(&metadata)) != self.tracker.ident() {
                    // replaced under the same name
                    if !self.release().await {
                        return false;
                    }
                    return self.open(0).await;
                }
                if metadata.len() < self.tracker.offset() {
                    self.tracker.reset_offset();
                    self.assembler.clear();
                }
                if metadata.len() > self.tracker.offset() {
                    if !self.emit(MonitorEvent::Changed).await {
                        return false;
                    }
                    return self.read_appended().await;
                }
                true
            }
        }
    }

    async fn open(&mut self, offset: u64) -> bool {
        match File::open(&self.path).await {
            Ok(file) => {
                let metadata = match file.metadata().await {
                    Ok(m) => m,
                    Err(err) => return self.emit(MonitorEvent::Error(err.into())).await,
                };
                self.tracker.begin(offset, FileIdent::of(&metadata));
                self.file = Some(file);
                if !self.emit(MonitorEvent::Changed).await {
                    return false;
                }
                self.read_appended().await
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => self.emit(MonitorEvent::Error(err.into())).await,
        }
    }

    /// Drain and release the open handle.
    async fn release(&mut self) -> bool {
        if !self.read_appended().await {
            return false;
        }
        self.file = None;
        self.assembler.clear();
        self.tracker.clear();
        self.emit(MonitorEvent::Closed).await
    }

    async fn read_appended(&mut self) -> bool {
        let Some(file) = self.file.as_mut() else {
            return true;
        };

        if let Err(err) = file.seek(SeekFrom::Start(self.tracker.offset())).await {
            return self.emit(MonitorEvent::Error(err.into())).await;
        }

        let mut buf = vec![0u8; self.read_buffer_size];
        loop {
            let read = match self.file.as_mut() {
                Some(file) => file.read(&mut buf).await,
                None => return true,
            };
            let n = match read {
                Ok(0) => return true,
                Ok(n) => n,
                Err(err) => return self.emit(MonitorEvent::Error(err.into())).await,
            };

            self.tracker.advance(n as u64);
            for record in self.assembler.push(&buf[..n]) {
                if !self.emit(MonitorEvent::Data(record)).await {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn drain_lines(events: &mut BoundedReceiver<MonitorEvent>, wait: Duration) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            match timeout(wait, events.next()).await {
                Ok(Some(MonitorEvent::Data(line))) => lines.push(line),
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        lines
    }

    #[tokio::test]
    async fn follows_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "old\n").unwrap();

        let mut follower = TailFollower::new(&path, MonitorConfig::default())
            .with_poll_interval(Duration::from_millis(20));
        let mut events = follower.events().unwrap();
        follower.start(None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"line1\nline2\n").unwrap();
        drop(f);

        tokio::time::sleep(Duration::from_millis(200)).await;
        follower.close().await;

        // backlog skipped, appended lines delivered
        let lines = drain_lines(&mut events, Duration::from_millis(100)).await;
        assert_eq!(lines, vec!["line1", "line2"]);
    }

    #[tokio::test]
    async fn explicit_offset_replays_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "line1\nline2\n").unwrap();

        let mut follower = TailFollower::new(&path, MonitorConfig::default())
            .with_poll_interval(Duration::from_millis(20));
        let mut events = follower.events().unwrap();
        follower.start(Some(0));

        tokio::time::sleep(Duration::from_millis(150)).await;
        follower.close().await;

        let lines = drain_lines(&mut events, Duration::from_millis(100)).await;
        assert_eq!(lines, vec!["line1", "line2"]);
    }

    #[tokio::test]
    async fn recreation_is_followed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "line1\n").unwrap();

        let mut follower = TailFollower::new(&path, MonitorConfig::default())
            .with_poll_interval(Duration::from_millis(20));
        let mut events = follower.events().unwrap();
        follower.start(Some(0));

        tokio::time::sleep(Duration::from_millis(150)).await;
        fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&path, "line2\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        follower.close().await;

        let lines = drain_lines(&mut events, Duration::from_millis(100)).await;
        assert_eq!(lines, vec!["line1", "line2"]);
    }

    #[tokio::test]
    async fn missing_parent_is_fatal() {
        let mut follower = TailFollower::new(
            "/tailpipe_no_such_dir/app.log",
            MonitorConfig::default(),
        );
        let mut events = follower.events().unwrap();
        follower.start(None);

        match timeout(Duration::from_secs(1), events.next()).await {
            Ok(Some(MonitorEvent::InitError(MonitorError::ParentDirMissing(_)))) => {}
            other => panic!("expected init error, got {:?}", other),
        }
        follower.close().await;
    }
}
