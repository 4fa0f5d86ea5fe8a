// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Embedded image metadata and group keys
//!
//! Generation tools store their parameters in PNG text chunks. The
//! [`PngTextCodec`] reads those chunks; [`GroupKeyExtractor`] turns the
//! prompt into the key that decides which images are posted together.

use flate2::read::ZlibDecoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::MetadataConfig;
use crate::{PromptpostError, Result};

const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
const MAX_INFLATED_SIZE: u64 = 16 * 1024 * 1024;

/// Reads named text fields embedded in an image file
pub trait MetadataCodec: Send + Sync {
    fn extract_field(&self, path: &Path, field: &str) -> Result<String>;
}

/// A decoded PNG text chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub keyword: String,
    pub text: String,
}

/// Codec for `tEXt`, `zTXt` and `iTXt` chunks
#[derive(Debug, Clone, Copy, Default)]
pub struct PngTextCodec;

impl MetadataCodec for PngTextCodec {
    fn extract_field(&self, path: &Path, field: &str) -> Result<String> {
        let name = path.display().to_string();
        let file = File::open(path).map_err(|e| PromptpostError::metadata(&name, e.to_string()))?;
        let chunks = parse_text_chunks(BufReader::new(file))
            .map_err(|e| PromptpostError::metadata(&name, e.to_string()))?;

        chunks
            .into_iter()
            .find(|c| c.keyword == field)
            .map(|c| c.text)
            .ok_or_else(|| PromptpostError::metadata(&name, format!("no '{}' text chunk", field)))
    }
}

/// Collect every decodable text chunk of a PNG stream.
///
/// CRCs are not verified. Chunks that fail to decode are skipped.
pub fn parse_text_chunks<R: Read + Seek>(mut reader: R) -> std::io::Result<Vec<TextChunk>> {
    let mut signature = [0u8; 8];
    reader.read_exact(&mut signature)?;
    if signature != PNG_SIGNATURE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not a PNG file",
        ));
    }

    let mut chunks = Vec::new();
    loop {
        let mut header = [0u8; 8];
        if reader.read_exact(&mut header).is_err() {
            break;
        }
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = [header[4], header[5], header[6], header[7]];

        if &kind == b"IEND" {
            break;
        }

        let is_text = matches!(&kind, b"tEXt" | b"zTXt" | b"iTXt");
        if !is_text || length > MAX_CHUNK_SIZE {
            reader.seek(SeekFrom::Current(length as i64 + 4))?;
            continue;
        }

        let mut data = vec![0u8; length];
        reader.read_exact(&mut data)?;
        reader.seek(SeekFrom::Current(4))?;

        let decoded = match &kind {
            b"tEXt" => decode_text(&data),
            b"zTXt" => decode_compressed_text(&data),
            _ => decode_international_text(&data),
        };
        match decoded {
            Some(chunk) => chunks.push(chunk),
            None => debug!("Skipping undecodable {} chunk", String::from_utf8_lossy(&kind)),
        }
    }

    Ok(chunks)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn split_keyword(data: &[u8]) -> Option<(String, &[u8])> {
    let nul = data.iter().position(|&b| b == 0)?;
    if nul == 0 || nul > 79 {
        return None;
    }
    Some((latin1(&data[..nul]), &data[nul + 1..]))
}

fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_INFLATED_SIZE)
        .read_to_end(&mut out)
        .ok()?;
    Some(out)
}

// keyword NUL text
fn decode_text(data: &[u8]) -> Option<TextChunk> {
    let (keyword, rest) = split_keyword(data)?;
    // Generators commonly write UTF-8 here despite the Latin-1 rule.
    let text = match std::str::from_utf8(rest) {
        Ok(s) => s.to_string(),
        Err(_) => latin1(rest),
    };
    Some(TextChunk { keyword, text })
}

// keyword NUL method zlib-data
fn decode_compressed_text(data: &[u8]) -> Option<TextChunk> {
    let (keyword, rest) = split_keyword(data)?;
    let (&method, compressed) = rest.split_first()?;
    if method != 0 {
        return None;
    }
    let raw = inflate(compressed)?;
    Some(TextChunk { keyword, text: latin1(&raw) })
}

// keyword NUL flag method language NUL translated NUL text
fn decode_international_text(data: &[u8]) -> Option<TextChunk> {
    let (keyword, rest) = split_keyword(data)?;
    if rest.len() < 2 {
        return None;
    }
    let (flag, method, rest) = (rest[0], rest[1], &rest[2..]);

    let lang_end = rest.iter().position(|&b| b == 0)?;
    let rest = &rest[lang_end + 1..];
    let translated_end = rest.iter().position(|&b| b == 0)?;
    let body = &rest[translated_end + 1..];

    let bytes = match (flag, method) {
        (0, _) => body.to_vec(),
        (1, 0) => inflate(body)?,
        _ => return None,
    };
    String::from_utf8(bytes).ok().map(|text| TextChunk { keyword, text })
}

/// Derives the grouping key of an image from its generation prompt
#[derive(Clone)]
pub struct GroupKeyExtractor {
    codec: Arc<dyn MetadataCodec>,
    field: String,
    pointer: String,
}

impl GroupKeyExtractor {
    pub fn new(codec: Arc<dyn MetadataCodec>, config: &MetadataConfig) -> Self {
        Self {
            codec,
            field: config.group_key_field.clone(),
            pointer: config.group_key_pointer.clone(),
        }
    }

    /// Normalized key: the prompt with all whitespace removed
    pub fn key_for(&self, path: &Path) -> Result<String> {
        let raw = self.codec.extract_field(path, &self.field)?;
        let prompt = if self.pointer.is_empty() {
            raw
        } else {
            let name = path.display().to_string();
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| PromptpostError::metadata(&name, format!("'{}' is not JSON: {}", self.field, e)))?;
            value
                .pointer(&self.pointer)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| PromptpostError::metadata(&name, format!("no string at {}", self.pointer)))?
        };
        Ok(normalize_key(&prompt))
    }

    /// Raw text of any field, for the metadata reply
    pub fn field(&self, path: &Path, field: &str) -> Result<String> {
        self.codec.extract_field(path, field)
    }

    pub fn group_key_field(&self) -> &str {
        &self.field
    }
}

pub fn normalize_key(prompt: &str) -> String {
    prompt.chars().filter(|c| !c.is_whitespace()).collect()
}
