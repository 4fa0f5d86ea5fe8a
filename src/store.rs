// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! The watched image directory and the archive it drains into

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::{PromptpostError, Result};

/// Candidate images in a single, non-recursive directory
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
    extension: String,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Create the directory if it doesn't exist
    pub fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            info!("Created image directory: {:?}", self.dir);
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Whether a path looks like one of our candidates (by name only)
    pub fn matches(&self, path: &Path) -> bool {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => return false,
        };
        !name.starts_with('.')
            && path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
    }

    /// File names of all regular files with the candidate suffix
    pub fn list_candidates(&self) -> Result<BTreeSet<String>> {
        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            glob::Pattern::escape(&self.extension)
        );
        let options = glob::MatchOptions {
            require_literal_leading_dot: true,
            ..glob::MatchOptions::new()
        };
        let entries = glob::glob_with(&pattern, options)
            .map_err(|e| PromptpostError::Config(format!("Bad image pattern {}: {}", pattern, e)))?;

        let mut names = BTreeSet::new();
        for entry in entries {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("Unreadable entry in {:?}: {}", self.dir, e);
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => {
                    names.insert(name.to_string());
                }
                None => debug!("Skipping non UTF-8 file name: {:?}", path),
            }
        }
        Ok(names)
    }

    /// Whether `filename` is currently a candidate
    pub fn contains(&self, filename: &str) -> Result<bool> {
        Ok(self.list_candidates()?.contains(filename))
    }

    /// Candidate with the smallest modification time; ties go to the
    /// lexicographically smaller name
    pub fn oldest(&self) -> Result<Option<String>> {
        let mut oldest: Option<(SystemTime, String)> = None;
        for name in self.list_candidates()? {
            let modified = match std::fs::metadata(self.path_of(&name)).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Cannot read modification time of {}: {}", name, e);
                    continue;
                }
            };
            // Names arrive sorted, so strict less-than keeps the first on ties.
            if oldest.as_ref().map_or(true, |(t, _)| modified < *t) {
                oldest = Some((modified, name));
            }
        }
        Ok(oldest.map(|(_, name)| name))
    }

    /// Move a candidate into `archive_dir`, returning its new path
    pub fn archive(&self, filename: &str, archive_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(archive_dir)?;
        let from = self.path_of(filename);
        let to = archive_dir.join(filename);
        move_file(&from, &to)?;
        Ok(to)
    }
}

/// Rename, falling back to copy and delete across filesystems
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if from.is_file() => {
            debug!("Rename {:?} -> {:?} failed ({}), copying instead", from, to, e);
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
