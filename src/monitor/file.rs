// SPDX-License-Identifier: Apache-2.0

//! Rotation-aware file monitor.
//!
//! One monitor tracks one path through appends, truncation, rename, delete
//! and recreation, delivering each newline-terminated record exactly once
//! for the lifetime of the monitor. All state for a path is owned by a
//! single tokio task; filesystem notices, the rotation deadline and
//! cancellation are serialized through one `select!` loop, so no transition
//! for a given file can race another.
//!
//! States: a started monitor is either waiting for the file to appear
//! (`WatchingForCreation`), reading appended bytes (`Tailing`), or sitting
//! out a rotation quiescence window (`AwaitingRotation`). `close()` is
//! terminal from any of them. A burst of rename/delete/change notices
//! during the window collapses into a single rotation resolution, measured
//! from the most recent notice.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use encoding_rs::{Encoding, UTF_8};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::monitor::assembler::LineAssembler;
use crate::monitor::coordinator::RotationCoordinator;
use crate::monitor::error::MonitorError;
use crate::monitor::tracker::{FileIdent, OffsetTracker};
use crate::monitor::watcher::{PathNotice, WatchRegistry};

const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Capacity of the event stream; producers block (backpressure) when the
/// consumer falls this far behind.
const EVENT_QUEUE_SIZE: usize = 1024;

/// Unterminated fragments larger than this are dropped and surfaced as an
/// `Error` event rather than buffered forever.
const MAX_FRAGMENT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Max bytes requested per incremental read; larger appended regions
    /// are consumed in multiple bounded reads.
    pub read_buffer_size: usize,
    /// How file bytes decode to text before line splitting.
    pub buffer_encoding: &'static Encoding,
    /// Quiescence delay before a rename/delete is treated as a completed
    /// rotation. `None` or zero resolves immediately.
    pub wait_delay_after_renaming: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            buffer_encoding: UTF_8,
            wait_delay_after_renaming: None,
        }
    }
}

/// Events observed by the monitor's single consumer, in per-file order.
#[derive(Debug)]
pub enum MonitorEvent {
    /// One complete, non-empty record.
    Data(String),
    /// Non-fatal fault; monitoring continues.
    Error(MonitorError),
    /// Fatal startup fault; emitted at most once, the monitor is dead.
    InitError(MonitorError),
    /// A change notification was processed.
    Changed,
    /// A rotation window opened.
    Renamed,
    /// An open handle was released.
    Closed,
}

/// Handle to a monitor instance. `start` spawns the engine task; `close`
/// cancels it and waits for the in-flight read, if any, to finish.
pub struct FileMonitor {
    path: PathBuf,
    config: MonitorConfig,
    events_tx: BoundedSender<MonitorEvent>,
    events_rx: Option<BoundedReceiver<MonitorEvent>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FileMonitor {
    pub fn new(path: impl Into<PathBuf>, config: MonitorConfig) -> Self {
        let (events_tx, events_rx) = bounded_channel::bounded(EVENT_QUEUE_SIZE);
        Self {
            path: path.into(),
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn events(&mut self) -> Option<BoundedReceiver<MonitorEvent>> {
        self.events_rx.take()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Begin monitoring. With an explicit offset the file is consumed from
    /// that byte (0 on a non-empty file replays everything); without one,
    /// tailing starts at the file's current end. A second call is a no-op.
    pub fn start(&mut self, offset: Option<u64>) {
        if self.task.is_some() {
            return;
        }
        let engine = Engine {
            path: self.path.clone(),
            config: self.config.clone(),
            events: self.events_tx.clone(),
            cancel: self.cancel.clone(),
            registry: WatchRegistry::global(),
            tracker: OffsetTracker::new(),
            assembler: LineAssembler::new(self.config.buffer_encoding),
            window: RotationCoordinator::new(),
            file: None,
            initial_offset: offset,
            state: State::WatchingForCreation,
        };
        self.task = Some(tokio::spawn(engine.run()));
    }

    /// Stop monitoring. Idempotent; resolves once the engine task has torn
    /// down. Any open handle is released (with a final `Closed` event) and
    /// a pending rotation window is canceled without firing.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WatchingForCreation,
    Tailing,
    AwaitingRotation,
}

enum Wake {
    Cancelled,
    Deadline,
    Notice(Option<PathNotice>),
}

struct Engine {
    path: PathBuf,
    config: MonitorConfig,
    events: BoundedSender<MonitorEvent>,
    cancel: CancellationToken,
    registry: &'static WatchRegistry,
    tracker: OffsetTracker,
    assembler: LineAssembler,
    window: RotationCoordinator,
    file: Option<File>,
    initial_offset: Option<u64>,
    state: State,
}

impl Engine {
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
            let _ = self.emit(MonitorEvent::InitError(MonitorError::ParentDirMissing(dir))).await;
            return;
        }

        let mut notices = match self.registry.subscribe(&self.path) {
            Ok(sub) => sub,
            Err(err) => {
                let _ = self.emit(MonitorEvent::InitError(err)).await;
                return;
            }
        };

        if !self.open_at_start().await {
            return;
        }
        debug!(path = ?self.path, state = ?self.state, "monitor started");

        loop {
            let wake = select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = self.window.fired() => Wake::Deadline,
                notice = notices.recv() => Wake::Notice(notice),
            };

            let keep_going = match wake {
                Wake::Cancelled => false,
                Wake::Deadline => self.resolve_rotation().await,
                // the registry outlives every subscription, so a closed
                // notice channel means teardown
                Wake::Notice(None) => false,
                Wake::Notice(Some(notice)) => self.handle_notice(notice).await,
            };
            if !keep_going {
                break;
            }
        }

        self.shutdown().await;
    }

    /// Send one event; false means the consumer hung up and the engine
    /// should tear down.
    async fn emit(&self, event: MonitorEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Initial probe of the path. Computes the target offset: an explicit
    /// start offset is used literally, otherwise the file's current size
    /// (skip backlog). A missing file routes to creation watching, where
    /// the remembered explicit offset (or zero) applies once it appears.
    async fn open_at_start(&mut self) -> bool {
        match File::open(&self.path).await {
            Ok(file) => {
                let metadata = match file.metadata().await {
                    Ok(m) => m,
                    Err(err) => {
                        self.state = State::WatchingForCreation;
                        return self.emit(MonitorEvent::Error(err.into())).await;
                    }
                };
                let target = match self.initial_offset.take() {
                    Some(explicit) => explicit,
                    None => metadata.len(),
                };
                self.tracker.begin(target, FileIdent::of(&metadata));
                self.file = Some(file);
                self.state = State::Tailing;
                self.read_appended().await
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.state = State::WatchingForCreation;
                true
            }
            Err(err) => {
                self.state = State::WatchingForCreation;
                self.emit(MonitorEvent::Error(err.into())).await
            }
        }
    }

    async fn handle_notice(&mut self, notice: PathNotice) -> bool {
        match self.state {
            State::WatchingForCreation => match notice {
                PathNotice::Created | PathNotice::Changed => self.open_created().await,
                PathNotice::Removed => true,
            },
            State::Tailing => match notice {
                PathNotice::Changed => {
                    if !self.emit(MonitorEvent::Changed).await {
                        return false;
                    }
                    self.read_appended().await
                }
                PathNotice::Removed => self.begin_rotation().await,
                PathNotice::Created => self.handle_replacement().await,
            },
            State::AwaitingRotation => {
                // debounce: any further notice pushes the deadline forward
                if let Some(delay) = self.rotation_delay() {
                    self.window.schedule(delay);
                }
                if notice == PathNotice::Changed {
                    // the renamed file is still growing; keep draining it
                    // through the handle we already hold
                    return self.read_appended().await;
                }
                true
            }
        }
    }

    /// A creation notice while tailing: something new sits under our path.
    /// Same identity as the open handle means an ordinary change; a
    /// different one means the path was replaced behind us.
    async fn handle_replacement(&mut self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) if Some(FileIdent::of(&metadata)) == self.tracker.ident() => {
                if !self.emit(MonitorEvent::Changed).await {
                    return false;
                }
                self.read_appended().await
            }
            _ => self.begin_rotation().await,
        }
    }

    fn rotation_delay(&self) -> Option<Duration> {
        self.config
            .wait_delay_after_renaming
            .filter(|delay| !delay.is_zero())
    }

    async fn begin_rotation(&mut self) -> bool {
        match self.rotation_delay() {
            Some(delay) => {
                if !self.emit(MonitorEvent::Renamed).await {
                    return false;
                }
                self.window.schedule(delay);
                self.state = State::AwaitingRotation;
                true
            }
            None => self.resolve_rotation().await,
        }
    }

    /// Confirmed rotation: drain and release the old handle, then re-probe
    /// the path. A file there is the rotated-in replacement, consumed from
    /// byte zero; nothing there routes back to creation watching.
    async fn resolve_rotation(&mut self) -> bool {
        self.window.cancel();

        if self.file.is_some() {
            if !self.read_appended().await {
                return false;
            }
            self.file = None;
            self.assembler.clear();
            self.tracker.clear();
            if !self.emit(MonitorEvent::Closed).await {
                return false;
            }
        }

        match File::open(&self.path).await {
            Ok(file) => {
                let metadata = match file.metadata().await {
                    Ok(m) => m,
                    Err(err) => {
                        self.state = State::WatchingForCreation;
                        return self.emit(MonitorEvent::Error(err.into())).await;
                    }
                };
                self.tracker.begin(0, FileIdent::of(&metadata));
                self.file = Some(file);
                self.state = State::Tailing;
                self.read_appended().await
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.state = State::WatchingForCreation;
                true
            }
            Err(err) => {
                self.state = State::WatchingForCreation;
                self.emit(MonitorEvent::Error(err.into())).await
            }
        }
    }

    async fn open_created(&mut self) -> bool {
        match File::open(&self.path).await {
            Ok(file) => {
                let metadata = match file.metadata().await {
                    Ok(m) => m,
                    Err(err) => return self.emit(MonitorEvent::Error(err.into())).await,
                };
                let target = self.initial_offset.take().unwrap_or(0);
                self.tracker.begin(target, FileIdent::of(&metadata));
                self.file = Some(file);
                self.state = State::Tailing;
                if !self.emit(MonitorEvent::Changed).await {
                    return false;
                }
                self.read_appended().await
            }
            // raced away again before we could open it
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => self.emit(MonitorEvent::Error(err.into())).await,
        }
    }

    /// Read from the consumed offset to the file's current end in bounded
    /// chunks, feeding the assembler and emitting completed records.
    async fn read_appended(&mut self) -> bool {
        let Some(file) = self.file.as_mut() else {
            return true;
        };

        let metadata = match file.metadata().await {
            Ok(m) => m,
            Err(err) => return self.emit(MonitorEvent::Error(err.into())).await,
        };
        if metadata.len() < self.tracker.offset() {
            // truncated under us; restart from the top
            self.tracker.reset_offset();
            self.assembler.clear();
        }

        if let Err(err) = file.seek(SeekFrom::Start(self.tracker.offset())).await {
            return self.emit(MonitorEvent::Error(err.into())).await;
        }

        let mut buf = vec![0u8; self.config.read_buffer_size];
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

            if self.assembler.pending_len() > MAX_FRAGMENT_BYTES {
                let dropped = self.assembler.pending_len();
                self.assembler.clear();
                let overflow = MonitorError::FragmentOverflow(dropped);
                if !self.emit(MonitorEvent::Error(overflow)).await {
                    return false;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.window.cancel();
        if self.file.take().is_some() {
            let _ = self.emit(MonitorEvent::Closed).await;
        }
        debug!(path = ?self.path, "monitor closed");
    }
}
