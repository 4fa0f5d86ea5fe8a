// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Promptpost: cooldown-gated image publishing for Telegram
//!
//! Watches a directory of generated images, posts them to a channel in
//! groups that share a generation prompt, then attaches the originals to
//! the channel's echo of the post and archives them.

pub mod access;
pub mod bot;
pub mod config;
pub mod db;
pub mod error;
pub mod handoff;
pub mod index;
pub mod metadata;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use error::{PromptpostError, Result};

/// Serializes every mutation of the index, timer, handoff and image
/// directory between the poll loop and inbound events
pub type CycleLock = std::sync::Arc<tokio::sync::Mutex<()>>;
