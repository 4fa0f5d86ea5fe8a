// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Handoff between a published batch and its archival
//!
//! After a batch is posted, the scheduler stores a [`HandoffRecord`].
//! When the channel's own post shows up again (the automatic forward
//! into the linked discussion group), the [`Archiver`] replies to it
//! with the original files and metadata, then moves the batch to the
//! archive directory. The record is consumed exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ConfigHandle;
use crate::db::Database;
use crate::index::GroupIndex;
use crate::transport::{MessageRef, Transport};
use crate::{CycleLock, Result};

/// Schema version of the stored record
pub const HANDOFF_VERSION: i64 = 1;

/// The most recently published batch, awaiting archival
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub batch_id: String,
    /// In the order they were sent
    pub filenames: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl HandoffRecord {
    pub fn new(filenames: Vec<String>) -> Self {
        Self::at(filenames, Utc::now())
    }

    pub fn at(filenames: Vec<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            filenames,
            created_at,
        }
    }
}

/// Result of consuming a handoff
///
/// Attachments are not retried: the batch is archived either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub batch_id: String,
    pub archived: Vec<String>,
    /// Still in the image directory
    pub failed: Vec<String>,
    /// Originals that could not be attached to the echo
    pub unattached: Vec<String>,
    /// The metadata reply was attempted and failed
    pub metadata_failed: bool,
}

impl ArchiveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.unattached.is_empty() && !self.metadata_failed
    }

    /// One-line description of what went wrong
    pub fn problems(&self) -> String {
        let mut parts = Vec::new();
        if !self.failed.is_empty() {
            parts.push(format!("not archived: {}", self.failed.join(", ")));
        }
        if !self.unattached.is_empty() {
            parts.push(format!("not attached: {}", self.unattached.join(", ")));
        }
        if self.metadata_failed {
            parts.push("metadata not posted".to_string());
        }
        parts.join("; ")
    }
}

/// Consumes the pending handoff when the channel echo arrives
pub struct Archiver {
    config: ConfigHandle,
    db: Database,
    index: GroupIndex,
    transport: Arc<dyn Transport>,
    lock: CycleLock,
}

impl Archiver {
    pub fn new(
        config: ConfigHandle,
        db: Database,
        index: GroupIndex,
        transport: Arc<dyn Transport>,
        lock: CycleLock,
    ) -> Self {
        Self { config, db, index, transport, lock }
    }

    /// Attach originals and metadata to `echo`, archive the batch and
    /// clear the handoff. `Ok(None)` when nothing is pending.
    pub async fn consume(&self, echo: &MessageRef) -> Result<Option<ArchiveReport>> {
        let _guard = self.lock.lock().await;

        let record = match self.db.load_handoff() {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                // An unreadable record is dropped so publishing can resume.
                error!("Dropping unreadable handoff: {}", e);
                self.db.clear_handoff()?;
                return Err(e);
            }
        };
        let config = self.config.current();
        let store = self.index.store();
        info!("Archiving batch {}: '{}'", record.batch_id, record.filenames.join(", "));

        let mut report = ArchiveReport {
            batch_id: record.batch_id.clone(),
            ..ArchiveReport::default()
        };

        for name in &record.filenames {
            let path = store.path_of(name);
            if let Err(e) = self.transport.reply_with_document(echo, &path).await {
                warn!("Failed to attach original {}: {}", name, e);
                report.unattached.push(name.clone());
            }
        }

        if let Some(text) = self.caption_for(&record, &config.metadata.caption_field) {
            if let Err(e) = self.transport.reply_with_text(echo, &text).await {
                warn!("Failed to post metadata for batch {}: {}", record.batch_id, e);
                report.metadata_failed = true;
            }
        }

        let archive_dir = config.archive_dir();
        for name in &record.filenames {
            match store.archive(name, &archive_dir) {
                Ok(_) => report.archived.push(name.clone()),
                Err(e) => {
                    error!("Failed to archive {}: {}", name, e);
                    report.failed.push(name.clone());
                }
            }
        }

        // Rows left behind are dropped by the next reconcile.
        if let Err(e) = self.index.remove(&record.filenames) {
            error!("Failed to drop batch {} from the index: {}", record.batch_id, e);
        }
        self.db.clear_handoff()?;

        if report.is_complete() {
            info!("Batch {} archived ({} file(s))", report.batch_id, report.archived.len());
        } else {
            error!("Batch {} handled with problems: {}", report.batch_id, report.problems());
        }
        Ok(Some(report))
    }

    /// Raw metadata of the first file: the caption field, else the
    /// group key field
    fn caption_for(&self, record: &HandoffRecord, caption_field: &str) -> Option<String> {
        let first: PathBuf = self.index.store().path_of(record.filenames.first()?);
        let extractor = self.index.extractor();
        extractor
            .field(&first, caption_field)
            .or_else(|_| extractor.field(&first, extractor.group_key_field()))
            .map_err(|e| warn!("No metadata to post for batch {}: {}", record.batch_id, e))
            .ok()
    }
}
