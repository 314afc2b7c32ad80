//! Capability boundary to the remote chat-protocol network.
//!
//! The engine never speaks the wire protocol itself. Everything it needs from
//! a connected bot is expressed by [`ProtocolClient`] (per-bot operations) and
//! [`MediaSession`] (per-datacenter authenticated channel). Production builds
//! plug a real client library in here; tests use the simulated backend.

pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use types::{
    AuthKey, BotIndex, ChatId, DcId, ExportedAuthorization, FileKind, FileLocator, MessageId,
    MessageRef, SessionOptions,
};

/// Operations a single authenticated bot exposes.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Datacenter the bot is registered with.
    ///
    /// # Errors
    /// - `ProtocolError::Transport` - Local storage or connection unavailable
    async fn home_dc(&self) -> Result<DcId, ProtocolError>;

    /// Resolves a stored message to the locator of its media payload.
    ///
    /// Returns `Ok(None)` when the message does not exist or carries no media.
    ///
    /// # Errors
    /// - `ProtocolError::Timeout` / `ProtocolError::Transport` - Call failed in transit
    /// - `ProtocolError::Rpc` - Server rejected the request
    async fn resolve_message(
        &self,
        message: MessageRef,
    ) -> Result<Option<FileLocator>, ProtocolError>;

    /// Authorization key of the bot's home datacenter.
    ///
    /// # Errors
    /// - `ProtocolError::Transport` - Key material unavailable
    async fn home_auth_key(&self) -> Result<AuthKey, ProtocolError>;

    /// Derives a fresh authorization key for a foreign datacenter.
    ///
    /// # Errors
    /// - `ProtocolError::Transport` - Key exchange failed
    async fn create_auth_key(&self, dc: DcId) -> Result<AuthKey, ProtocolError>;

    /// Requests an authorization export token for `dc` from the home session.
    ///
    /// # Errors
    /// - `ProtocolError::Transport` - Home session unreachable
    /// - `ProtocolError::Rpc` - Export refused
    async fn export_authorization(&self, dc: DcId)
    -> Result<ExportedAuthorization, ProtocolError>;

    /// Opens and starts a media session to `dc` with the given key material.
    ///
    /// # Errors
    /// - `ProtocolError::Transport` - Connection could not be established
    async fn start_session(
        &self,
        dc: DcId,
        auth_key: AuthKey,
        options: SessionOptions,
    ) -> Result<Arc<dyn MediaSession>, ProtocolError>;
}

/// Authenticated channel to one datacenter, owned by one bot.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Datacenter this session is connected to.
    fn dc_id(&self) -> DcId;

    /// Imports an authorization token exported by the home session.
    ///
    /// # Errors
    /// - `ProtocolError::AuthBytesInvalid` - Token rejected, usually transient
    /// - `ProtocolError::Transport` - Connection dropped mid-exchange
    async fn import_authorization(
        &self,
        exported: ExportedAuthorization,
    ) -> Result<(), ProtocolError>;

    /// Fetches the byte range `[offset, offset + limit)` of a remote object.
    ///
    /// A short or empty result means the end of the object was reached.
    ///
    /// # Errors
    /// - `ProtocolError::Timeout` / `ProtocolError::Transport` - Transient failures
    /// - `ProtocolError::Rpc` - Server rejected the request (expired reference, etc.)
    async fn fetch_range(
        &self,
        locator: &FileLocator,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes, ProtocolError>;
}

/// Errors surfaced by protocol client implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Call timed out")]
    Timeout,

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Authorization bytes rejected")]
    AuthBytesInvalid,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Session closed")]
    SessionClosed,
}

impl ProtocolError {
    /// Whether the failure is attributable to the bot's connectivity.
    ///
    /// Transient failures count against the bot's health score.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Timeout | ProtocolError::Transport { .. })
    }
}
