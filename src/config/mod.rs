// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for Promptpost
//!
//! Settings come from a JSON file, then `PROMPTPOST_*` variables override
//! individual values: first from a `.env` beside the file, then from the
//! process environment. [`ConfigHandle`] re-reads the file and the `.env`
//! on demand so the cooldown can be changed while the daemon runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

use crate::{PromptpostError, Result};

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "PROMPTPOST_";

/// Dotenv file read next to the config file on every reload
pub const DOTENV_FILE: &str = ".env";

/// One year
pub const MAX_COOLDOWN_MINUTES: u64 = 60 * 24 * 365;

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Directory holding images waiting to be published
    #[serde(default = "default_image_dir")]
    pub image_dir: String,

    /// Directory that published images are moved into
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,

    /// File suffix (without dot) of publishable images
    #[serde(default = "default_image_extension")]
    pub image_extension: String,

    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Telegram settings
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Which embedded fields drive grouping and captions
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Poll interval and cooldown
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Who may issue commands
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TelegramConfig {
    /// Bot token
    #[serde(default)]
    pub token: String,
    /// Channel the batches are posted to, e.g. `@my_channel`
    #[serde(default)]
    pub channel: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_long_poll")]
    pub long_poll_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetadataConfig {
    /// Text chunk holding the generation parameters
    #[serde(default = "default_group_key_field")]
    pub group_key_field: String,
    /// JSON pointer to the prompt inside `group_key_field`; empty means
    /// the whole field is the prompt
    #[serde(default = "default_group_key_pointer")]
    pub group_key_pointer: String,
    /// Text chunk posted as the metadata reply
    #[serde(default = "default_caption_field")]
    pub caption_field: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct AccessConfig {
    #[serde(default)]
    pub user_whitelist: Vec<String>,
}

// Default value functions
fn default_image_dir() -> String { "images".to_string() }
fn default_archive_dir() -> String { "done".to_string() }
fn default_image_extension() -> String { "png".to_string() }
fn default_db_path() -> String { "tmp/promptpost.db".to_string() }
fn default_api_url() -> String { "https://api.telegram.org".to_string() }
fn default_request_timeout() -> u64 { 120 }
fn default_long_poll() -> u64 { 30 }
fn default_group_key_field() -> String { "sd-metadata".to_string() }
fn default_group_key_pointer() -> String { "/image/prompt".to_string() }
fn default_caption_field() -> String { "Dream".to_string() }
fn default_poll_interval() -> u64 { 60 }
fn default_cooldown() -> u64 { 120 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            image_dir: default_image_dir(),
            archive_dir: default_archive_dir(),
            image_extension: default_image_extension(),
            database: DatabaseConfig::default(),
            telegram: TelegramConfig::default(),
            metadata: MetadataConfig::default(),
            schedule: ScheduleConfig::default(),
            access: AccessConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            channel: String::new(),
            api_url: default_api_url(),
            request_timeout_secs: default_request_timeout(),
            long_poll_secs: default_long_poll(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            group_key_field: default_group_key_field(),
            group_key_pointer: default_group_key_pointer(),
            caption_field: default_caption_field(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            cooldown_minutes: default_cooldown(),
        }
    }
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cooldown(&self) -> Result<chrono::Duration> {
        i64::try_from(self.cooldown_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .ok_or_else(|| {
                PromptpostError::Config(format!("cooldown of {} minutes is out of range", self.cooldown_minutes))
            })
    }
}

impl TelegramConfig {
    /// Channel username without the leading `@`
    pub fn channel_username(&self) -> &str {
        self.channel.trim().trim_start_matches('@')
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| PromptpostError::Config(format!("Failed to parse config: {}", e)))?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Load from file, then apply `.env` and process environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self> {
        Self::load_layered(path, |name| std::env::var(name).ok())
    }

    /// Load from file and apply overrides. Entries of the `.env` next to
    /// `path` win over `process_env`, and the file is re-read on every call.
    pub fn load_layered<F>(path: &Path, process_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load(path)?;
        let dotenv = read_dotenv(&dotenv_path(path))?;
        config.apply_overrides(|key| {
            let name = format!("{}{}", ENV_PREFIX, key);
            dotenv.get(&name).cloned().or_else(|| process_env(&name))
        })?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply overrides from a key lookup (keys are given without prefix)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IMG_DIR") { self.image_dir = v; }
        if let Some(v) = lookup("DONE_DIR") { self.archive_dir = v; }
        if let Some(v) = lookup("DB_FILENAME") { self.database.path = v; }
        if let Some(v) = lookup("TOKEN") { self.telegram.token = v; }
        if let Some(v) = lookup("CHANNEL_NAME") { self.telegram.channel = v; }
        if let Some(v) = lookup("META_TAG") { self.metadata.caption_field = v; }
        if let Some(v) = lookup("USER_WHITELIST") {
            self.access.user_whitelist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("SLEEP_INTERVAL_SECONDS") {
            self.schedule.poll_interval_secs = parse_number("SLEEP_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("COOLDOWN_MINUTES") {
            self.schedule.cooldown_minutes = parse_number("COOLDOWN_MINUTES", &v)?;
        }
        Ok(())
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.schedule.poll_interval_secs == 0 {
            return Err(PromptpostError::Config("poll interval must be positive".to_string()));
        }
        if self.schedule.cooldown_minutes > MAX_COOLDOWN_MINUTES {
            return Err(PromptpostError::Config(format!(
                "cooldown must be at most {} minutes",
                MAX_COOLDOWN_MINUTES
            )));
        }
        if self.image_extension.trim_start_matches('.').is_empty() {
            return Err(PromptpostError::Config("image extension is empty".to_string()));
        }
        if Path::new(&self.image_dir) == Path::new(&self.archive_dir) {
            return Err(PromptpostError::Config(
                "image and archive directories must differ".to_string(),
            ));
        }
        if self.metadata.group_key_field.is_empty() {
            return Err(PromptpostError::Config("group key field is empty".to_string()));
        }
        Ok(())
    }

    pub fn image_dir(&self) -> PathBuf {
        PathBuf::from(&self.image_dir)
    }

    pub fn archive_dir(&self) -> PathBuf {
        PathBuf::from(&self.archive_dir)
    }
}

/// `.env` beside the config file
pub fn dotenv_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(DOTENV_FILE)
}

fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let entries = dotenvy::from_path_iter(path)
        .map_err(|e| PromptpostError::Config(format!("Failed to read {:?}: {}", path, e)))?;
    entries
        .map(|entry| entry.map_err(|e| PromptpostError::Config(format!("Bad line in {:?}: {}", path, e))))
        .collect()
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        PromptpostError::Config(format!("{}{} is not a number: {:?}", ENV_PREFIX, key, value))
    })
}

/// Reloadable configuration snapshot
///
/// Cloning shares the snapshot. `current()` reloads on every call.
#[derive(Clone)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    snapshot: Arc<RwLock<AppConfig>>,
}

impl ConfigHandle {
    /// Handle backed by a config file plus environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = AppConfig::load_with_env(path)?;
        config.validate()?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            snapshot: Arc::new(RwLock::new(config)),
        })
    }

    /// Handle over a fixed configuration (CLI overrides, tests)
    pub fn fixed(config: AppConfig) -> Self {
        Self {
            path: None,
            snapshot: Arc::new(RwLock::new(config)),
        }
    }

    /// Re-read the backing configuration and return a fresh snapshot.
    /// A failed reload keeps the last good values.
    pub fn current(&self) -> AppConfig {
        if let Some(path) = &self.path {
            match AppConfig::load_with_env(path).and_then(|c| c.validate().map(|_| c)) {
                Ok(fresh) => {
                    if let Ok(mut guard) = self.snapshot.write() {
                        *guard = fresh.clone();
                    }
                    return fresh;
                }
                Err(e) => warn!("Config reload failed, keeping previous values: {}", e),
            }
        }
        self.snapshot()
    }

    /// Last loaded snapshot without touching the file
    pub fn snapshot(&self) -> AppConfig {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the snapshot of a fixed handle
    pub fn set(&self, config: AppConfig) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}
