// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Chat transport seam
//!
//! The publisher talks to the chat service only through [`Transport`];
//! inbound traffic arrives as [`InboundEvent`]s.

pub mod telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Result;

/// Identifies a message to reply to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// A `/command arg1 arg2` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Parse `/name[@bot] args...`; `None` for plain text
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_lowercase(),
            args: parts.map(String::from).collect(),
        })
    }
}

/// An inbound message relevant to the publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub sender_id: Option<i64>,
    pub message: MessageRef,
    pub command: Option<Command>,
    /// Username of the channel this message was forwarded from
    pub forwarded_from_channel: Option<String>,
}

/// Outbound side of the chat service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post all files to the channel as one album
    async fn send_batch(&self, channel: &str, files: &[PathBuf]) -> Result<()>;

    /// Reply to a message with a file sent as a document
    async fn reply_with_document(&self, reply_to: &MessageRef, file: &Path) -> Result<()>;

    /// Reply to a message with text
    async fn reply_with_text(&self, reply_to: &MessageRef, text: &str) -> Result<()>;
}
