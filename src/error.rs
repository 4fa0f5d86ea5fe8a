// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for Promptpost

use thiserror::Error;

/// Result type alias for Promptpost operations
pub type Result<T> = std::result::Result<T, PromptpostError>;

/// Promptpost error types
#[derive(Error, Debug)]
pub enum PromptpostError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Telegram API error: {0}")]
    Telegram(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Metadata unavailable for {file}: {reason}")]
    MetadataUnavailable { file: String, reason: String },

    #[error("Not a publishable image: {0}")]
    FileNotCandidate(String),

    #[error("Previous batch is still awaiting archival")]
    HandoffPending,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PromptpostError {
    /// Shorthand for a metadata failure on a given file
    pub fn metadata(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MetadataUnavailable {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Transport failures that a later cycle may succeed at
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Telegram(_))
    }
}
