use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use taskhive_core::{HiveError, HiveResult, Priority};
use uuid::Uuid;

/// Default delivery retry budget for a message.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unit of traffic for the message router.
///
/// Once enqueued a message only changes by its retry counter being bumped.
/// Large payloads may be stored gzip-compressed and base64-encoded; use
/// [`Message::text`] to read the content either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub content: String,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub compressed: bool,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Message {
    pub fn new(
        content: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
            compressed: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the priority from its numeric level, `1` (Low) to `4` (Critical).
    pub fn with_priority_level(self, level: u8) -> HiveResult<Self> {
        let priority = Priority::from_level(level).ok_or_else(|| {
            HiveError::Config(format!("message priority must be 1-4, got {level}"))
        })?;
        Ok(self.with_priority(priority))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// SHA-256 over sender, recipient and content, hex-encoded.
    ///
    /// Two messages with the same fingerprint are duplicates regardless of
    /// id, priority or metadata.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.recipient.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Gzip and base64-encode the content in place. No-op when already
    /// compressed.
    pub fn compress(&mut self) -> HiveResult<()> {
        if self.compressed {
            return Ok(());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.content.as_bytes())?;
        let bytes = encoder.finish()?;
        self.content = BASE64.encode(bytes);
        self.compressed = true;
        Ok(())
    }

    /// The original content, decompressing if needed.
    pub fn text(&self) -> HiveResult<String> {
        if !self.compressed {
            return Ok(self.content.clone());
        }
        let bytes = BASE64
            .decode(self.content.as_bytes())
            .map_err(|e| HiveError::Execution(format!("corrupt compressed message: {e}")))?;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Whether another delivery attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
