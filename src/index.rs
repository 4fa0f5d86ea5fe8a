// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Persistent filename → group key index, reconciled against the directory

use std::path::Path;
use tracing::{info, warn};

use crate::db::Database;
use crate::metadata::GroupKeyExtractor;
use crate::store::ImageStore;
use crate::{PromptpostError, Result};

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// New files whose key could not be read; retried next pass
    pub failed: Vec<String>,
}

impl ReconcileReport {
    /// True when the index already matched the directory
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Group index over the image directory
#[derive(Clone)]
pub struct GroupIndex {
    db: Database,
    store: ImageStore,
    extractor: GroupKeyExtractor,
}

impl GroupIndex {
    pub fn new(db: Database, store: ImageStore, extractor: GroupKeyExtractor) -> Self {
        Self { db, store, extractor }
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn extractor(&self) -> &GroupKeyExtractor {
        &self.extractor
    }

    /// Bring the index in line with the directory: index new files,
    /// drop records of files that are gone. Existing records are never
    /// rewritten.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let on_disk = self.store.list_candidates()?;
        let indexed = self.db.indexed_filenames()?;
        let mut report = ReconcileReport::default();

        for name in on_disk.difference(&indexed) {
            match self.extractor.key_for(&self.store.path_of(name)) {
                Ok(key) => {
                    if self.db.insert_image(name, &key)? {
                        report.added.push(name.clone());
                    }
                }
                Err(e) => {
                    warn!("SYNC: Skipping {}: {}", name, e);
                    report.failed.push(name.clone());
                }
            }
        }

        let missing: Vec<String> = indexed.difference(&on_disk).cloned().collect();
        if !missing.is_empty() {
            self.db.remove_images(&missing)?;
            report.removed = missing;
        }

        if !report.added.is_empty() {
            info!("SYNC: Added to index: '{}'", report.added.join(", "));
        }
        if !report.removed.is_empty() {
            info!("SYNC: Removed from index: '{}'", report.removed.join(", "));
        }
        Ok(report)
    }

    /// Every indexed file sharing `filename`'s group key, itself included
    pub fn group_of(&self, filename: &str) -> Result<Vec<String>> {
        if let Err(e) = self.reconcile() {
            warn!("SYNC: Reconciliation before grouping failed: {}", e);
        }

        if !is_plain_name(filename) || !self.store.contains(filename)? {
            return Err(PromptpostError::FileNotCandidate(filename.to_string()));
        }
        let key = self
            .extractor
            .key_for(&self.store.path_of(filename))
            .map_err(|e| {
                warn!("Cannot group {}: {}", filename, e);
                PromptpostError::FileNotCandidate(filename.to_string())
            })?;

        self.db.filenames_with_key(&key)
    }

    /// Drop records by name; unknown names are ignored
    pub fn remove(&self, filenames: &[String]) -> Result<usize> {
        let removed = self.db.remove_images(filenames)?;
        info!("Removed {} record(s) from index: '{}'", removed, filenames.join(", "));
        Ok(removed)
    }
}

// A bare file name, never a path into another directory
fn is_plain_name(filename: &str) -> bool {
    let path = Path::new(filename);
    path.file_name().map_or(false, |n| n == path.as_os_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetadataConfig;
    use crate::metadata::PngTextCodec;
    use crate::testing::{write_png, write_prompt_png, Chunk};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GroupIndex, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        let store = ImageStore::new(dir.path(), "png");
        let extractor = GroupKeyExtractor::new(Arc::new(PngTextCodec), &MetadataConfig::default());
        let index = GroupIndex::new(db.clone(), store, extractor);
        (dir, index, db)
    }

    fn as_set(names: Vec<String>) -> BTreeSet<String> {
        names.into_iter().collect()
    }

    #[test]
    fn test_reconcile_matches_directory() {
        let (dir, index, db) = setup();
        write_prompt_png(dir.path(), "a.png", "castle");
        write_prompt_png(dir.path(), "b.png", "castle");
        write_prompt_png(dir.path(), "c.png", "forest");

        let report = index.reconcile().unwrap();
        assert_eq!(report.added, vec!["a.png", "b.png", "c.png"]);
        assert_eq!(db.indexed_filenames().unwrap(), index.store().list_candidates().unwrap());

        std::fs::remove_file(dir.path().join("b.png")).unwrap();
        write_prompt_png(dir.path(), "d.png", "lake");

        let report = index.reconcile().unwrap();
        assert_eq!(report.added, vec!["d.png"]);
        assert_eq!(report.removed, vec!["b.png"]);
        assert_eq!(db.indexed_filenames().unwrap(), index.store().list_candidates().unwrap());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (dir, index, db) = setup();
        write_prompt_png(dir.path(), "a.png", "castle");
        db.insert_image("gone.png", "x").unwrap();

        let first = index.reconcile().unwrap();
        assert!(!first.is_noop());

        let before = db.indexed_filenames().unwrap();
        let second = index.reconcile().unwrap();
        assert!(second.is_noop());
        assert_eq!(db.indexed_filenames().unwrap(), before);
    }

    #[test]
    fn test_bad_metadata_is_isolated_and_retried() {
        let (dir, index, db) = setup();
        write_prompt_png(dir.path(), "good.png", "castle");
        write_png(dir.path(), "bare.png", &[Chunk::Text("Software", "x")]);
        std::fs::write(dir.path().join("junk.png"), b"not an image").unwrap();

        let report = index.reconcile().unwrap();
        assert_eq!(report.added, vec!["good.png"]);
        assert_eq!(report.failed, vec!["bare.png", "junk.png"]);

        // Fixed on disk, picked up on the next pass
        write_prompt_png(dir.path(), "bare.png", "castle");
        let report = index.reconcile().unwrap();
        assert_eq!(report.added, vec!["bare.png"]);
        assert_eq!(report.failed, vec!["junk.png"]);
        assert_eq!(db.filenames_with_key("castle").unwrap(), vec!["bare.png", "good.png"]);
    }

    #[test]
    fn test_reconcile_keeps_existing_records() {
        let (dir, index, db) = setup();
        write_prompt_png(dir.path(), "a.png", "castle");
        index.reconcile().unwrap();

        // Metadata edits do not rewrite an indexed record
        write_prompt_png(dir.path(), "a.png", "forest");
        index.reconcile().unwrap();
        assert_eq!(db.group_key_of("a.png").unwrap().as_deref(), Some("castle"));
    }

    #[test]
    fn test_group_of_shared_prompt() {
        let (dir, index, _db) = setup();
        write_prompt_png(dir.path(), "a.png", "castle");
        write_prompt_png(dir.path(), "b.png", "cas tle");
        write_prompt_png(dir.path(), "c.png", "forest");
        index.reconcile().unwrap();

        let expected: BTreeSet<String> = ["a.png", "b.png"].iter().map(|s| s.to_string()).collect();
        assert_eq!(as_set(index.group_of("a.png").unwrap()), expected);
        assert_eq!(as_set(index.group_of("b.png").unwrap()), expected);
        assert_eq!(index.group_of("c.png").unwrap(), vec!["c.png"]);
    }

    #[test]
    fn test_group_of_absorbs_manual_edits() {
        let (dir, index, _db) = setup();
        write_prompt_png(dir.path(), "a.png", "castle");
        index.reconcile().unwrap();

        // Dropped in after the last pass
        write_prompt_png(dir.path(), "b.png", "castle");
        assert_eq!(index.group_of("a.png").unwrap(), vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_group_of_rejects_non_candidates() {
        let (dir, index, _db) = setup();
        write_png(dir.path(), "bare.png", &[]);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_prompt_png(&dir.path().join("sub"), "x.png", "castle");

        for name in ["bare.png", "missing.png", "sub/x.png", "../x.png"] {
            assert!(
                matches!(index.group_of(name), Err(PromptpostError::FileNotCandidate(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (dir, index, db) = setup();
        write_prompt_png(dir.path(), "a.png", "castle");
        index.reconcile().unwrap();

        let batch = vec!["a.png".to_string()];
        assert_eq!(index.remove(&batch).unwrap(), 1);
        assert_eq!(index.remove(&batch).unwrap(), 0);
        assert!(db.indexed_filenames().unwrap().is_empty());
    }
}
