//! Domain types shared between the engine and protocol client implementations.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Zero-based index of a bot within the client pool.
///
/// Indices are assigned once at startup and never reused, since the pool
/// never shrinks at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BotIndex(pub usize);

impl BotIndex {
    /// Creates BotIndex from zero-based index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the underlying index.
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Human-facing bot label, numbered from one.
    pub fn display_name(self) -> String {
        format!("Bot {}", self.0 + 1)
    }
}

impl fmt::Display for BotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a regional datacenter of the remote network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DcId(pub i32);

impl fmt::Display for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DC{}", self.0)
    }
}

/// Chat (channel) identifier as used by the remote network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Message identifier, unique within one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i32);

/// Reference to a stored message carrying a media payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl MessageRef {
    pub fn new(chat_id: i64, message_id: i32) -> Self {
        Self {
            chat_id: ChatId(chat_id),
            message_id: MessageId(message_id),
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id.0, self.message_id.0)
    }
}

/// Kind of remote object a locator points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Generic document payload (videos are stored this way).
    Document,
    /// Photo with a specific thumbnail size.
    Photo,
    /// Profile photo of a chat; `big` selects the large variant.
    ChatPhoto { big: bool },
}

/// Immutable, session-bound descriptor of a remote object.
///
/// The `file_reference` token is only valid for the bot session that
/// resolved it, so locators must never be shared across bots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocator {
    pub kind: FileKind,
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: Bytes,
    pub thumb_size: String,
    pub dc_id: DcId,
    pub file_size: u64,
}

/// Authorization key material for one datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKey(pub Bytes);

/// Token exported from the home session to authorize a foreign datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedAuthorization {
    pub id: i64,
    pub bytes: Bytes,
}

/// Per-session settings applied when a media session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Suppress unrelated protocol push notifications.
    pub no_updates: bool,
    /// Upper bound for a single call on the session.
    pub call_timeout: Duration,
    /// Idle threshold after which the session may sleep.
    pub sleep_threshold: Duration,
}
