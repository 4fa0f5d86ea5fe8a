// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! File system watcher for the image directory
//!
//! Polling stays the source of truth; change events only trigger an
//! earlier reconciliation pass so the index catches up sooner.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;
use crate::store::ImageStore;
use crate::Result;

/// Events emitted by the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A new file was created
    FileCreated(PathBuf),
    /// A file was deleted or moved away
    FileDeleted(PathBuf),
    /// Watcher error
    Error(String),
}

/// Watches a single directory, non-recursively
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    event_rx: Receiver<notify::Result<Event>>,
}

impl FileWatcher {
    pub fn new(path: &Path) -> Result<Self> {
        let (tx, rx) = channel();

        let config = Config::default()
            .with_poll_interval(Duration::from_secs(2));

        let mut watcher = RecommendedWatcher::new(tx, config)?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        info!("Watching: {:?}", path);

        Ok(Self {
            _watcher: watcher,
            event_rx: rx,
        })
    }

    /// Get the next event (blocking with timeout)
    pub fn next_event(&self, timeout: Duration) -> Option<WatchEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(Ok(event)) => Self::convert_event(event),
            Ok(Err(e)) => Some(WatchEvent::Error(e.to_string())),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => None,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Some(WatchEvent::Error("Watcher disconnected".to_string()))
            }
        }
    }

    /// Convert notify event to our event type
    fn convert_event(event: Event) -> Option<WatchEvent> {
        match event.kind {
            EventKind::Create(_) => {
                event.paths.first().map(|p| WatchEvent::FileCreated(p.clone()))
            }
            EventKind::Remove(_) => {
                event.paths.first().map(|p| WatchEvent::FileDeleted(p.clone()))
            }
            // Renames show up as modify events carrying both paths
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                event.paths.last().map(|p| {
                    if p.exists() {
                        WatchEvent::FileCreated(p.clone())
                    } else {
                        WatchEvent::FileDeleted(p.clone())
                    }
                })
            }
            _ => None,
        }
    }
}

/// Wait for file to be stable (not being written)
pub async fn wait_for_stable(path: &Path, max_wait: Duration) -> bool {
    let check_interval = Duration::from_millis(500);
    let start = std::time::Instant::now();

    let mut last_size = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return false,
    };

    loop {
        tokio::time::sleep(check_interval).await;

        if start.elapsed() > max_wait {
            warn!("File stability check timed out for {:?}", path);
            return true;
        }

        let current_size = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => return false,
        };

        if current_size == last_size {
            return true;
        }

        last_size = current_size;
        debug!("File {:?} still being written, size: {}", path, current_size);
    }
}

/// Forward watcher events into the async world and reconcile on
/// candidate changes until shutdown
pub async fn run_watcher(
    store: ImageStore,
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let watcher = FileWatcher::new(store.dir())?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut stop = shutdown.clone();
    tokio::task::spawn_blocking(move || loop {
        if *stop.borrow_and_update() {
            break;
        }
        if let Some(event) = watcher.next_event(Duration::from_millis(250)) {
            if tx.send(event).is_err() {
                break;
            }
        }
    });

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let path = match event {
            WatchEvent::FileCreated(path) => {
                if !store.matches(&path) || !wait_for_stable(&path, Duration::from_secs(10)).await {
                    continue;
                }
                path
            }
            WatchEvent::FileDeleted(path) if store.matches(&path) => path,
            WatchEvent::FileDeleted(_) => continue,
            WatchEvent::Error(e) => {
                warn!("Watch error: {}", e);
                continue;
            }
        };

        debug!("Directory changed at {:?}, reconciling", path);
        if let Err(e) = scheduler.reconcile().await {
            warn!("Reconciliation after change failed: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    #[test]
    fn test_convert_event() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/img/a.png"));
        assert_eq!(
            FileWatcher::convert_event(created),
            Some(WatchEvent::FileCreated(PathBuf::from("/img/a.png")))
        );

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/img/a.png"));
        assert_eq!(
            FileWatcher::convert_event(removed),
            Some(WatchEvent::FileDeleted(PathBuf::from("/img/a.png")))
        );

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any));
        assert_eq!(FileWatcher::convert_event(access), None);
    }

    #[tokio::test]
    async fn test_wait_for_stable_missing_file() {
        assert!(!wait_for_stable(Path::new("/definitely/not/here.png"), Duration::from_secs(1)).await);
    }
}
