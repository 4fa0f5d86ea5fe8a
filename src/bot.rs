// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Inbound event dispatch: commands and channel echoes

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::access::AccessGate;
use crate::config::ConfigHandle;
use crate::handoff::Archiver;
use crate::scheduler::Scheduler;
use crate::transport::telegram::TelegramClient;
use crate::transport::{Command, InboundEvent, MessageRef, Transport};
use crate::{PromptpostError, Result};

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Routes inbound events to the scheduler and the archiver
pub struct Bot {
    config: ConfigHandle,
    gate: AccessGate,
    scheduler: Arc<Scheduler>,
    archiver: Arc<Archiver>,
    transport: Arc<dyn Transport>,
}

impl Bot {
    pub fn new(
        config: ConfigHandle,
        gate: AccessGate,
        scheduler: Arc<Scheduler>,
        archiver: Arc<Archiver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self { config, gate, scheduler, archiver, transport }
    }

    pub async fn handle_event(&self, event: InboundEvent) -> Result<()> {
        if let Some(command) = &event.command {
            return self.handle_command(&event, command).await;
        }

        if self.is_channel_echo(&event) {
            match self.archiver.consume(&event.message).await? {
                Some(report) if !report.is_complete() => {
                    warn!("Archived with problems: {}", report.problems())
                }
                Some(_) => {}
                None => debug!("Channel echo without a pending handoff"),
            }
        }
        Ok(())
    }

    fn is_channel_echo(&self, event: &InboundEvent) -> bool {
        let config = self.config.snapshot();
        let channel = config.telegram.channel_username();
        match &event.forwarded_from_channel {
            Some(from) => !channel.is_empty() && from.eq_ignore_ascii_case(channel),
            None => false,
        }
    }

    async fn handle_command(&self, event: &InboundEvent, command: &Command) -> Result<()> {
        match command.name.as_str() {
            "instant" | "status" => {}
            other => {
                debug!("Ignoring unknown command /{}", other);
                return Ok(());
            }
        }
        if !self.gate.is_authorized(event.sender_id) {
            return Ok(());
        }
        info!("Command '/{}' received", command.name);

        if command.name == "status" {
            let text = match self.scheduler.status().await {
                Ok(status) => status.summary(),
                Err(e) => format!("Status unavailable: {}", e),
            };
            return self.reply(&event.message, &text).await;
        }

        let filename = command.args.first().map(String::as_str);
        let text = match self.scheduler.publish_now(filename).await {
            Ok(sent) => format!("Sent: {}", sent.join(", ")),
            Err(PromptpostError::FileNotCandidate(_)) => "No image available.".to_string(),
            Err(PromptpostError::HandoffPending) => {
                "Previous batch is still awaiting archival.".to_string()
            }
            Err(e) if e.is_transient() => "Sending failed, will retry on schedule.".to_string(),
            Err(e) => {
                error!("Instant publish failed: {}", e);
                "Sending failed.".to_string()
            }
        };
        self.reply(&event.message, &text).await
    }

    async fn reply(&self, to: &MessageRef, text: &str) -> Result<()> {
        self.transport.reply_with_text(to, text).await
    }
}

/// Long-poll Telegram and feed every message to `bot` until shutdown
pub async fn poll_updates(client: Arc<TelegramClient>, bot: Arc<Bot>, mut shutdown: watch::Receiver<bool>) {
    let mut offset = 0;
    info!("Listening for Telegram updates");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let updates = tokio::select! {
            result = client.get_updates(offset) => result,
            _ = shutdown.changed() => break,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(message) = update.message else { continue };
                    if let Err(e) = bot.handle_event(message.into_event()).await {
                        error!("Failed to handle update {}: {}", update.update_id, e);
                    }
                }
            }
            Err(e) => {
                warn!("Polling updates failed: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    info!("Update polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessConfig, AppConfig, MetadataConfig};
    use crate::db::Database;
    use crate::index::GroupIndex;
    use crate::metadata::{GroupKeyExtractor, PngTextCodec};
    use crate::store::ImageStore;
    use crate::testing::{set_mtime, write_prompt_png, FakeTransport, Sent};
    use crate::CycleLock;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Database,
        transport: Arc<FakeTransport>,
        bot: Bot,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();

        let mut app = AppConfig::default();
        app.image_dir = images.to_string_lossy().to_string();
        app.archive_dir = dir.path().join("done").to_string_lossy().to_string();
        app.telegram.channel = "@Gallery".to_string();
        let config = ConfigHandle::fixed(app);

        let db = Database::in_memory().unwrap();
        let store = ImageStore::new(&images, "png");
        let extractor = GroupKeyExtractor::new(Arc::new(PngTextCodec), &MetadataConfig::default());
        let index = GroupIndex::new(db.clone(), store, extractor);
        let transport = Arc::new(FakeTransport::default());
        let lock = CycleLock::default();

        let scheduler = Arc::new(Scheduler::new(
            config.clone(), db.clone(), index.clone(), transport.clone(), lock.clone(),
        ));
        let archiver = Arc::new(Archiver::new(
            config.clone(), db.clone(), index, transport.clone(), lock,
        ));
        let gate = AccessGate::new(&AccessConfig { user_whitelist: vec!["42".into()] });
        let bot = Bot::new(config, gate, scheduler, archiver, transport.clone());

        Fixture { dir, db, transport, bot }
    }

    fn command(sender: i64, text: &str) -> InboundEvent {
        InboundEvent {
            sender_id: Some(sender),
            message: MessageRef { chat_id: sender, message_id: 1 },
            command: Command::parse(text),
            forwarded_from_channel: None,
        }
    }

    fn echo(channel: &str) -> InboundEvent {
        InboundEvent {
            sender_id: Some(777000),
            message: MessageRef { chat_id: -100, message_id: 50 },
            command: None,
            forwarded_from_channel: Some(channel.to_string()),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_command_is_silent() {
        let f = fixture();
        write_prompt_png(&f.dir.path().join("images"), "a.png", "castle");

        f.bot.handle_event(command(13, "/instant")).await.unwrap();
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_instant_without_images() {
        let f = fixture();
        f.bot.handle_event(command(42, "/instant")).await.unwrap();
        assert_eq!(f.transport.texts(), vec!["No image available."]);
    }

    #[tokio::test]
    async fn test_instant_then_echo_archives() {
        let f = fixture();
        let images = f.dir.path().join("images");
        set_mtime(&write_prompt_png(&images, "a.png", "castle"), 1_000);
        set_mtime(&write_prompt_png(&images, "b.png", "castle"), 2_000);

        f.bot.handle_event(command(42, "/instant")).await.unwrap();
        assert_eq!(f.transport.batches(), vec![vec!["a.png".to_string(), "b.png".to_string()]]);
        assert!(f.db.has_handoff().unwrap());

        // Echo from some other channel is ignored
        f.bot.handle_event(echo("elsewhere")).await.unwrap();
        assert!(f.db.has_handoff().unwrap());

        f.bot.handle_event(echo("gallery")).await.unwrap();
        assert!(!f.db.has_handoff().unwrap());
        assert!(f.dir.path().join("done/a.png").is_file());
        assert!(f.dir.path().join("done/b.png").is_file());

        let documents = f
            .transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Sent::Document { reply_to: 50, .. }))
            .count();
        assert_eq!(documents, 2);
    }

    #[tokio::test]
    async fn test_instant_while_handoff_pending() {
        let f = fixture();
        let images = f.dir.path().join("images");
        write_prompt_png(&images, "a.png", "castle");
        write_prompt_png(&images, "c.png", "forest");

        f.bot.handle_event(command(42, "/instant a.png")).await.unwrap();
        f.bot.handle_event(command(42, "/instant c.png")).await.unwrap();

        assert_eq!(f.transport.batches().len(), 1);
        assert_eq!(
            f.transport.texts(),
            vec!["Sent: a.png", "Previous batch is still awaiting archival."]
        );
    }

    #[tokio::test]
    async fn test_status_command() {
        let f = fixture();
        f.bot.handle_event(command(42, "/status")).await.unwrap();
        let texts = f.transport.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("Candidates: 0"));
    }
}
