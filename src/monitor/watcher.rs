// SPDX-License-Identifier: Apache-2.0

//! Shared filesystem notification plumbing.
//!
//! One OS-level directory watch is held per directory, no matter how many
//! files inside it are monitored. Subscribers register a filename; raw
//! `notify` events are demultiplexed by filename on the watcher's callback
//! thread and forwarded to the owning monitor task. The directory watch is
//! torn down when its last subscriber goes away.

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::monitor::error::MonitorError;

/// What happened to a watched filename, reduced from raw notify events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathNotice {
    /// A file appeared under the watched name (creation or rename-onto).
    Created,
    /// Content changed under the watched name.
    Changed,
    /// The watched name went away (deletion or rename-away).
    Removed,
}

struct Subscriber {
    name: OsString,
    tx: UnboundedSender<PathNotice>,
}

type SubscriberMap = Arc<Mutex<HashMap<u64, Subscriber>>>;

struct DirWatch {
    // Held to keep the OS watch alive; dropped on last unsubscribe.
    _watcher: RecommendedWatcher,
    subscribers: SubscriberMap,
}

/// Registry of directory watches keyed by directory path.
pub struct WatchRegistry {
    dirs: Arc<Mutex<HashMap<PathBuf, DirWatch>>>,
    next_id: AtomicU64,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            dirs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Process-wide registry shared by all monitors.
    pub fn global() -> &'static WatchRegistry {
        static GLOBAL: OnceLock<WatchRegistry> = OnceLock::new();
        GLOBAL.get_or_init(WatchRegistry::new)
    }

    /// Subscribe to notices for one path. The path's parent directory must
    /// exist; the file itself need not.
    pub fn subscribe(&self, path: &Path) -> Result<PathWatcher, MonitorError> {
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or_else(|| MonitorError::Watch(format!("path has no parent: {:?}", path)))?
            .to_path_buf();
        let name = path
            .file_name()
            .ok_or_else(|| MonitorError::Watch(format!("path has no file name: {:?}", path)))?
            .to_os_string();

        let (tx, rx) = unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut dirs = self
            .dirs
            .lock()
            .map_err(|_| MonitorError::Watch("watch registry lock poisoned".into()))?;

        if !dirs.contains_key(&dir) {
            let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
            let watcher = spawn_dir_watcher(&dir, subscribers.clone())?;
            dirs.insert(
                dir.clone(),
                DirWatch {
                    _watcher: watcher,
                    subscribers,
                },
            );
        }

        if let Some(watch) = dirs.get(&dir) {
            if let Ok(mut subs) = watch.subscribers.lock() {
                subs.insert(id, Subscriber { name, tx });
            }
        }

        Ok(PathWatcher {
            dirs: self.dirs.clone(),
            dir,
            id,
            rx,
        })
    }

    #[cfg(test)]
    fn watched_dir_count(&self) -> usize {
        self.dirs.lock().map(|d| d.len()).unwrap_or(0)
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_dir_watcher(
    dir: &Path,
    subscribers: SubscriberMap,
) -> Result<RecommendedWatcher, MonitorError> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "filesystem watcher error");
                    return;
                }
            };
            dispatch(&event, &subscribers);
        },
        Config::default(),
    )
    .map_err(|e| MonitorError::Watch(e.to_string()))?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| MonitorError::Watch(e.to_string()))?;

    Ok(watcher)
}

/// Route one raw event to the subscribers whose filename it touches.
fn dispatch(event: &notify::Event, subscribers: &SubscriberMap) {
    for (index, path) in event.paths.iter().enumerate() {
        let Some(name) = path.file_name() else {
            continue;
        };
        let Some(notice) = classify(&event.kind, index) else {
            continue;
        };

        let Ok(subs) = subscribers.lock() else {
            return;
        };
        for sub in subs.values().filter(|s| s.name.as_os_str() == name) {
            // a closed receiver only means the monitor is shutting down
            let _ = sub.tx.send(notice);
        }
    }
}

/// Map a notify event kind onto a notice for the path at `index` in the
/// event's path list. Rename events carry the old name first and, for
/// `Both`, the new name second.
fn classify(kind: &EventKind, index: usize) -> Option<PathNotice> {
    match kind {
        EventKind::Create(_) => Some(PathNotice::Created),
        EventKind::Remove(_) => Some(PathNotice::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if index == 0 {
                Some(PathNotice::Removed)
            } else {
                Some(PathNotice::Created)
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(PathNotice::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(PathNotice::Removed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(PathNotice::Changed),
        EventKind::Any => Some(PathNotice::Changed),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

/// A filename-scoped subscription. Dropping it releases the shared
/// directory watch once no other subscriber remains.
pub struct PathWatcher {
    dirs: Arc<Mutex<HashMap<PathBuf, DirWatch>>>,
    dir: PathBuf,
    id: u64,
    rx: UnboundedReceiver<PathNotice>,
}

impl PathWatcher {
    pub async fn recv(&mut self) -> Option<PathNotice> {
        self.rx.recv().await
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        let Ok(mut dirs) = self.dirs.lock() else {
            return;
        };
        let remove_dir = match dirs.get(&self.dir) {
            Some(watch) => match watch.subscribers.lock() {
                Ok(mut subs) => {
                    subs.remove(&self.id);
                    subs.is_empty()
                }
                Err(_) => false,
            },
            None => false,
        };
        if remove_dir {
            dirs.remove(&self.dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn next_notice(watcher: &mut PathWatcher) -> Option<PathNotice> {
        timeout(Duration::from_secs(2), watcher.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn creation_is_noticed() {
        let dir = TempDir::new().unwrap();
        let registry = WatchRegistry::new();

        let mut sub = registry.subscribe(&dir.path().join("a.log")).unwrap();
        fs::write(dir.path().join("a.log"), "x\n").unwrap();

        let notice = next_notice(&mut sub).await.expect("expected a notice");
        assert!(matches!(
            notice,
            PathNotice::Created | PathNotice::Changed
        ));
    }

    #[tokio::test]
    async fn subscribers_in_one_directory_are_isolated() {
        let dir = TempDir::new().unwrap();
        let registry = WatchRegistry::new();

        let mut sub_a = registry.subscribe(&dir.path().join("a.log")).unwrap();
        let mut sub_b = registry.subscribe(&dir.path().join("b.log")).unwrap();
        assert_eq!(registry.watched_dir_count(), 1);

        fs::write(dir.path().join("a.log"), "only a\n").unwrap();

        assert!(next_notice(&mut sub_a).await.is_some());
        // b must see nothing from a's file
        assert!(
            timeout(Duration::from_millis(300), sub_b.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn removal_is_noticed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "x\n").unwrap();

        let registry = WatchRegistry::new();
        let mut sub = registry.subscribe(&path).unwrap();

        fs::remove_file(&path).unwrap();

        let mut saw_removed = false;
        while let Some(notice) = next_notice(&mut sub).await {
            if notice == PathNotice::Removed {
                saw_removed = true;
                break;
            }
        }
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn last_unsubscribe_tears_down_directory_watch() {
        let dir = TempDir::new().unwrap();
        let registry = WatchRegistry::new();

        let sub_a = registry.subscribe(&dir.path().join("a.log")).unwrap();
        let sub_b = registry.subscribe(&dir.path().join("b.log")).unwrap();
        assert_eq!(registry.watched_dir_count(), 1);

        drop(sub_a);
        assert_eq!(registry.watched_dir_count(), 1);

        drop(sub_b);
        assert_eq!(registry.watched_dir_count(), 0);
    }

    #[tokio::test]
    async fn rename_away_is_noticed_as_removal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "x\n").unwrap();

        let registry = WatchRegistry::new();
        let mut sub = registry.subscribe(&path).unwrap();

        fs::rename(&path, dir.path().join("a.log.1")).unwrap();

        let mut saw_removed = false;
        while let Some(notice) = next_notice(&mut sub).await {
            if notice == PathNotice::Removed {
                saw_removed = true;
                break;
            }
        }
        assert!(saw_removed);
    }
}
