// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Telegram Bot API client

use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::{Command, InboundEvent, MessageRef, Transport};
use crate::config::TelegramConfig;
use crate::{PromptpostError, Result};

/// Albums hold at most this many photos
pub const MAX_ALBUM_SIZE: usize = 10;
/// Longest text message Telegram accepts
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram Bot API client
pub struct TelegramClient {
    client: Client,
    base_url: String,
    long_poll_secs: u64,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Serialize)]
struct InputMediaPhoto {
    #[serde(rename = "type")]
    kind: &'static str,
    media: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    reply_to_message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<BotUser>,
    pub text: Option<String>,
    pub forward_from_chat: Option<Chat>,
    pub forward_origin: Option<ForwardOrigin>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForwardOrigin {
    pub chat: Option<Chat>,
}

impl Message {
    /// Convert to the transport-neutral event
    pub fn into_event(self) -> InboundEvent {
        let forwarded_from_channel = self
            .forward_from_chat
            .and_then(|c| c.username)
            .or_else(|| self.forward_origin.and_then(|o| o.chat).and_then(|c| c.username));

        InboundEvent {
            sender_id: self.from.map(|u| u.id),
            message: MessageRef {
                chat_id: self.chat.id,
                message_id: self.message_id,
            },
            command: self.text.as_deref().and_then(Command::parse),
            forwarded_from_channel,
        }
    }
}

impl TelegramClient {
    /// Create a new Telegram client
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(PromptpostError::Config("Telegram token is not set".to_string()));
        }

        // Long polls must finish before the request timeout fires.
        let timeout = config.request_timeout_secs.max(config.long_poll_secs + 10);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        let base_url = format!("{}/bot{}", config.api_url.trim_end_matches('/'), config.token);

        Ok(Self {
            client,
            base_url,
            long_poll_secs: config.long_poll_secs,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn decode<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body: ApiResponse<T> = response.json().await?;
        if !body.ok {
            return Err(PromptpostError::Telegram(format!(
                "{} failed ({}): {}",
                method,
                status,
                body.description.unwrap_or_else(|| "no description".to_string())
            )));
        }
        body.result
            .ok_or_else(|| PromptpostError::Telegram(format!("{} returned no result", method)))
    }

    async fn post_form<T: DeserializeOwned>(&self, method: &str, form: multipart::Form) -> Result<T> {
        debug!("Telegram request: {}", method);
        let response = self.client.post(self.url(method)).multipart(form).send().await?;
        Self::decode(method, response).await
    }

    /// Check the token and return the bot identity
    pub async fn health_check(&self) -> Result<BotUser> {
        let response = self
            .client
            .get(self.url("getMe"))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        Self::decode("getMe", response).await
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let response = self
            .client
            .get(self.url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.long_poll_secs.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .send()
            .await?;
        Self::decode("getUpdates", response).await
    }

    async fn file_part(path: &Path) -> Result<multipart::Part> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        Ok(multipart::Part::bytes(data).file_name(name))
    }

    async fn send_album(&self, channel: &str, files: &[PathBuf]) -> Result<()> {
        if let [single] = files {
            let form = multipart::Form::new()
                .text("chat_id", channel.to_string())
                .part("photo", Self::file_part(single).await?);
            let _: serde_json::Value = self.post_form("sendPhoto", form).await?;
            return Ok(());
        }

        let mut media = Vec::with_capacity(files.len());
        let mut form = multipart::Form::new().text("chat_id", channel.to_string());
        for (i, path) in files.iter().enumerate() {
            let field = format!("file{}", i);
            media.push(InputMediaPhoto {
                kind: "photo",
                media: format!("attach://{}", field),
            });
            form = form.part(field, Self::file_part(path).await?);
        }
        let form = form.text("media", serde_json::to_string(&media)?);

        let _: serde_json::Value = self.post_form("sendMediaGroup", form).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_batch(&self, channel: &str, files: &[PathBuf]) -> Result<()> {
        for album in files.chunks(MAX_ALBUM_SIZE) {
            self.send_album(channel, album).await?;
        }
        Ok(())
    }

    async fn reply_with_document(&self, reply_to: &MessageRef, file: &Path) -> Result<()> {
        let form = multipart::Form::new()
            .text("chat_id", reply_to.chat_id.to_string())
            .text("reply_to_message_id", reply_to.message_id.to_string())
            .part("document", Self::file_part(file).await?);
        let _: serde_json::Value = self.post_form("sendDocument", form).await?;
        Ok(())
    }

    async fn reply_with_text(&self, reply_to: &MessageRef, text: &str) -> Result<()> {
        let text = truncate_message(text);
        let request = SendMessageRequest {
            chat_id: reply_to.chat_id,
            text: &text,
            reply_to_message_id: reply_to.message_id,
        };
        let response = self.client.post(self.url("sendMessage")).json(&request).send().await?;
        let _: serde_json::Value = Self::decode("sendMessage", response).await?;
        Ok(())
    }
}

/// Cut text to the message limit on a char boundary
pub fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    cut.push('…');
    cut
}
