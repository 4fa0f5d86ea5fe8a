// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Shared fixtures for unit tests

use async_trait::async_trait;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::transport::{MessageRef, Transport};
use crate::{PromptpostError, Result};

/// Text chunk to embed in a fixture PNG
pub enum Chunk<'a> {
    Text(&'a str, &'a str),
    Compressed(&'a str, &'a str),
    /// keyword, text, compressed
    International(&'a str, &'a str, bool),
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn push_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut crc = Crc::new();
    crc.update(kind);
    crc.update(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
}

/// A 1x1 grayscale PNG header followed by the given text chunks
pub fn png_bytes(chunks: &[Chunk<'_>]) -> Vec<u8> {
    let mut out = vec![137, 80, 78, 71, 13, 10, 26, 10];
    push_chunk(&mut out, b"IHDR", &[0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0]);

    for chunk in chunks {
        let (kind, data) = match chunk {
            Chunk::Text(key, text) => {
                let mut data = key.as_bytes().to_vec();
                data.push(0);
                data.extend_from_slice(text.as_bytes());
                (b"tEXt", data)
            }
            Chunk::Compressed(key, text) => {
                let mut data = key.as_bytes().to_vec();
                data.extend_from_slice(&[0, 0]);
                data.extend_from_slice(&zlib(text.as_bytes()));
                (b"zTXt", data)
            }
            Chunk::International(key, text, compressed) => {
                let mut data = key.as_bytes().to_vec();
                data.extend_from_slice(&[0, *compressed as u8, 0]);
                data.extend_from_slice(b"en\0\0");
                if *compressed {
                    data.extend_from_slice(&zlib(text.as_bytes()));
                } else {
                    data.extend_from_slice(text.as_bytes());
                }
                (b"iTXt", data)
            }
        };
        push_chunk(&mut out, kind, &data);
    }

    push_chunk(&mut out, b"IEND", &[]);
    out
}

/// Write a fixture PNG into `dir`
pub fn write_png(dir: &Path, name: &str, chunks: &[Chunk<'_>]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, png_bytes(chunks)).unwrap();
    path
}

/// Fixture PNG carrying an InvokeAI style `sd-metadata` prompt
pub fn write_prompt_png(dir: &Path, name: &str, prompt: &str) -> PathBuf {
    let meta = serde_json::json!({ "image": { "prompt": prompt } }).to_string();
    let dream = format!("\"{}\" -s 30", prompt);
    write_png(
        dir,
        name,
        &[Chunk::Text("sd-metadata", &meta), Chunk::Text("Dream", &dream)],
    )
}

/// Set a file's modification time to `secs` after the epoch
pub fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

/// What the fake transport was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Batch { channel: String, files: Vec<String> },
    Document { reply_to: i64, file: String },
    Text { reply_to: i64, text: String },
}

/// Records every successful call. `fail_sends` makes `send_batch` fail,
/// `fail_replies` makes both reply methods fail.
#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<Sent>>,
    pub fail_sends: AtomicBool,
    pub fail_replies: AtomicBool,
}

impl FakeTransport {
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_replies(&self, failing: bool) {
        self.fail_replies.store(failing, Ordering::SeqCst);
    }

    fn check_replies(&self) -> Result<()> {
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(PromptpostError::Telegram("simulated outage".to_string()));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Batch { files, .. } => Some(files),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().to_string()
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_batch(&self, channel: &str, files: &[PathBuf]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(PromptpostError::Telegram("simulated outage".to_string()));
        }
        self.sent.lock().unwrap().push(Sent::Batch {
            channel: channel.to_string(),
            files: files.iter().map(|p| file_name(p)).collect(),
        });
        Ok(())
    }

    async fn reply_with_document(&self, reply_to: &MessageRef, file: &Path) -> Result<()> {
        self.check_replies()?;
        self.sent.lock().unwrap().push(Sent::Document {
            reply_to: reply_to.message_id,
            file: file_name(file),
        });
        Ok(())
    }

    async fn reply_with_text(&self, reply_to: &MessageRef, text: &str) -> Result<()> {
        self.check_replies()?;
        self.sent.lock().unwrap().push(Sent::Text {
            reply_to: reply_to.message_id,
            text: text.to_string(),
        });
        Ok(())
    }
}
