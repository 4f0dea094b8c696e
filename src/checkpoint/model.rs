//! Checkpoint record shapes and content encoding.
//!
//! On disk every checkpoint is one JSON document named
//! `<hash(path)>-<timestamp>.json` inside the session directory. Full
//! content over 1 KiB is gzip-compressed and stored as base64 with
//! `compressed: true`; smaller content is stored raw. Readers tolerate
//! either encoding regardless of size.

use std::io::{Read, Write};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CheckpointError;

/// Full content above this byte length is gzip-compressed on disk.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// First 16 hex chars of the SHA-256 of `content`.
pub fn hash_content(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Stable 16-hex-char identifier for a file path, used in checkpoint file
/// names.
pub fn hash_path(path: &str) -> String {
    hash_content(path)
}

/// One element of a per-file checkpoint chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCheckpoint {
    pub file_path: String,
    /// Unix milliseconds; strictly increasing within a chain.
    pub timestamp: i64,
    /// Hash of the reconstructed content at this position.
    pub hash: String,
    /// Full content: raw text, or base64-of-gzip when `compressed` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Line diff relative to the previous position, as a JSON string of the
    /// diff-entry array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Git commit observed when the checkpoint was taken, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
}

impl FileCheckpoint {
    /// Does this element carry full content (a base or re-base)?
    pub fn is_full(&self) -> bool {
        self.content.is_some()
    }

    /// Decode this element's full content. Errors on diff-only elements and
    /// on undecodable compressed payloads.
    pub fn decoded_content(&self) -> Result<String, CheckpointError> {
        let stored = self.content.as_ref().ok_or_else(|| {
            CheckpointError::InternalCorruption("diff-only element has no content".to_string())
        })?;
        decode_content(stored, self.compressed)
    }
}

/// Encode content for storage: `(stored, compressed)`.
pub fn encode_content(content: &str) -> (String, bool) {
    if content.len() <= COMPRESS_THRESHOLD {
        return (content.to_string(), false);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    encoder.write_all(content.as_bytes()).expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");
    (
        base64::engine::general_purpose::STANDARD.encode(compressed),
        true,
    )
}

/// Decode stored content, tolerating both encodings.
pub fn decode_content(stored: &str, compressed: bool) -> Result<String, CheckpointError> {
    if !compressed {
        return Ok(stored.to_string());
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(stored)
        .map_err(|e| CheckpointError::InternalCorruption(format!("bad base64 content: {e}")))?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| CheckpointError::InternalCorruption(format!("bad gzip content: {e}")))?;
    Ok(out)
}

// ─── Session metadata ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

/// `session.json` at the root of each session directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub working_directory: String,
    pub auto_checkpoint_interval: u32,
    #[serde(default)]
    pub metadata: SessionGitInfo,
    #[serde(default)]
    pub files: Vec<String>,
}
