// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Cooldown-gated publishing
//!
//! Each cycle walks Idle → Selecting → Grouping → Sending → Committing.
//! The periodic tick and the interactive "publish now" share everything
//! after selection. A failed send leaves the timer, the handoff and the
//! index untouched, so the next tick simply tries again.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ConfigHandle};
use crate::db::Database;
use crate::handoff::HandoffRecord;
use crate::index::{GroupIndex, ReconcileReport};
use crate::transport::Transport;
use crate::{CycleLock, PromptpostError, Result};

/// How a scheduling cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Cooldown still running
    CoolingDown { remaining: Duration },
    /// Configured cooldown unusable; nothing is published
    Misconfigured { error: String },
    /// Previous batch not yet archived
    HandoffPending,
    NoCandidate,
    /// The oldest candidate could not be grouped
    Skipped { filename: String },
    /// Transport failed; nothing was recorded
    SendFailed { filename: String, error: String },
    Published { filenames: Vec<String> },
}

/// Snapshot for `/status` and the CLI
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub candidates: usize,
    pub indexed: usize,
    pub oldest: Option<String>,
    pub last_publish: Option<DateTime<Utc>>,
    pub cooldown: Duration,
    pub cooldown_remaining: Option<Duration>,
    pub handoff: Option<HandoffRecord>,
}

impl SchedulerStatus {
    /// Read the current state without taking the cycle lock
    pub fn collect(config: &AppConfig, db: &Database, index: &GroupIndex, now: DateTime<Utc>) -> Result<Self> {
        let store = index.store();
        let cooldown = config.schedule.cooldown()?;

        Ok(Self {
            candidates: store.list_candidates()?.len(),
            indexed: db.get_stats()?.image_count as usize,
            oldest: store.oldest()?,
            last_publish: db.last_publish()?,
            cooldown,
            cooldown_remaining: cooldown_remaining(db, now, cooldown),
            handoff: db.load_handoff()?,
        })
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Candidates: {} ({} indexed)", self.candidates, self.indexed),
            format!("Next: {}", self.oldest.as_deref().unwrap_or("-")),
            format!(
                "Last publish: {}",
                self.last_publish
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string())
            ),
            format!("Cooldown: {} min", self.cooldown.num_minutes()),
        ];
        match self.cooldown_remaining {
            Some(left) => lines.push(format!("Cooldown remaining: {} min", minutes_rounded_up(left))),
            None => lines.push("Cooldown remaining: none".to_string()),
        }
        match &self.handoff {
            Some(h) => lines.push(format!(
                "Awaiting archival since {}: {}",
                h.created_at.format("%Y-%m-%d %H:%M"),
                h.filenames.join(", ")
            )),
            None => lines.push("Awaiting archival: nothing".to_string()),
        }
        lines.join("\n")
    }
}

fn minutes_rounded_up(d: Duration) -> i64 {
    let whole = d.num_minutes();
    if d > Duration::minutes(whole) {
        whole + 1
    } else {
        whole
    }
}

/// Remaining cooldown, or `None` when a publish is allowed.
/// A missing or unreadable timer counts as elapsed.
pub fn cooldown_remaining(db: &Database, now: DateTime<Utc>, cooldown: Duration) -> Option<Duration> {
    let last = match db.last_publish() {
        Ok(last) => last?,
        Err(e) => {
            error!("Error reading publish timer: {}", e);
            return None;
        }
    };
    let elapsed = now - last;
    (elapsed < cooldown).then(|| cooldown - elapsed)
}

/// Publish scheduler
pub struct Scheduler {
    config: ConfigHandle,
    db: Database,
    index: GroupIndex,
    transport: Arc<dyn Transport>,
    lock: CycleLock,
}

impl Scheduler {
    pub fn new(
        config: ConfigHandle,
        db: Database,
        index: GroupIndex,
        transport: Arc<dyn Transport>,
        lock: CycleLock,
    ) -> Self {
        Self { config, db, index, transport, lock }
    }

    /// One periodic cycle at the current time
    pub async fn tick(&self) -> CycleOutcome {
        self.tick_at(Utc::now()).await
    }

    /// One periodic cycle as of `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        let _guard = self.lock.lock().await;
        let config = self.config.current();

        let cooldown = match config.schedule.cooldown() {
            Ok(cooldown) => cooldown,
            Err(e) => return CycleOutcome::Misconfigured { error: e.to_string() },
        };
        if let Some(remaining) = cooldown_remaining(&self.db, now, cooldown) {
            return CycleOutcome::CoolingDown { remaining };
        }
        if self.handoff_pending() {
            return CycleOutcome::HandoffPending;
        }

        let filename = match self.index.store().oldest() {
            Ok(Some(name)) => name,
            Ok(None) => return CycleOutcome::NoCandidate,
            Err(e) => {
                warn!("Cannot list candidates: {}", e);
                return CycleOutcome::NoCandidate;
            }
        };

        match self.publish_group(&config, &filename, now).await {
            Ok(filenames) => CycleOutcome::Published { filenames },
            Err(PromptpostError::FileNotCandidate(_)) => CycleOutcome::Skipped { filename },
            Err(e) => CycleOutcome::SendFailed { filename, error: e.to_string() },
        }
    }

    /// Publish immediately, ignoring the cooldown. Without a file name
    /// the oldest candidate is used, as on the periodic path.
    pub async fn publish_now(&self, filename: Option<&str>) -> Result<Vec<String>> {
        self.publish_now_at(filename, Utc::now()).await
    }

    pub async fn publish_now_at(&self, filename: Option<&str>, now: DateTime<Utc>) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let config = self.config.current();

        if self.handoff_pending() {
            return Err(PromptpostError::HandoffPending);
        }

        let filename = match filename {
            Some(name) => name.to_string(),
            None => self
                .index
                .store()
                .oldest()?
                .ok_or_else(|| PromptpostError::FileNotCandidate("no images".to_string()))?,
        };
        info!("Instant sending: {}", filename);

        self.publish_group(&config, &filename, now).await
    }

    /// Grouping, Sending and Committing. Caller holds the cycle lock.
    async fn publish_group(&self, config: &AppConfig, filename: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let group = self.index.group_of(filename)?;
        info!("Images group based on '{}': '{}'", filename, group.join(", "));

        let paths: Vec<_> = group.iter().map(|name| self.index.store().path_of(name)).collect();
        if let Err(e) = self.transport.send_batch(&config.telegram.channel, &paths).await {
            error!("Error sending images: {}", e);
            return Err(e);
        }

        if let Err(e) = self.db.insert_handoff(&HandoffRecord::at(group.clone(), now)) {
            error!("Error saving sent images: {}", e);
        }
        if let Err(e) = self.db.set_last_publish(now) {
            error!("Error updating publish timer: {}", e);
        }

        info!("Published {} image(s)", group.len());
        Ok(group)
    }

    // Unreadable state counts as pending.
    fn handoff_pending(&self) -> bool {
        match self.db.has_handoff() {
            Ok(pending) => pending,
            Err(e) => {
                error!("Error reading handoff state: {}", e);
                true
            }
        }
    }

    /// Reconcile the index under the cycle lock
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lock.lock().await;
        self.index.reconcile()
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> Result<SchedulerStatus> {
        let _guard = self.lock.lock().await;
        SchedulerStatus::collect(&self.config.current(), &self.db, &self.index, now)
    }

    /// Tick on the configured poll interval until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                CycleOutcome::Published { filenames } => {
                    info!("Cycle: published '{}'", filenames.join(", "))
                }
                CycleOutcome::SendFailed { error, .. } => {
                    warn!("Cycle: send failed, retrying next tick: {}", error)
                }
                CycleOutcome::Skipped { filename } => {
                    warn!("Cycle: cannot group {}, fix or remove it", filename)
                }
                CycleOutcome::HandoffPending => info!("Cycle: waiting for the channel echo"),
                CycleOutcome::CoolingDown { remaining } => {
                    debug!("Cycle: cooldown, {}s left", remaining.num_seconds())
                }
                CycleOutcome::NoCandidate => debug!("Cycle: no images"),
                CycleOutcome::Misconfigured { error } => error!("Cycle: not publishing: {}", error),
            }

            let interval = self.config.snapshot().schedule.poll_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Scheduler stopped");
    }
}
