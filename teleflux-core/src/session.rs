//! Per-bot media sessions keyed by datacenter.
//!
//! A bot reaches files stored on foreign datacenters through dedicated media
//! sessions. Sessions are created lazily, reused for the bot's lifetime, and
//! never shared with other bots. Creation is serialized per bot with a
//! double-checked lock so concurrent streams never open duplicate sessions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::protocol::{
    BotIndex, DcId, MediaSession, ProtocolClient, ProtocolError, SessionOptions,
};

/// Errors that can occur while establishing a media session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Bot {bot} could not open a session to {dc}: {source}")]
    Establish {
        bot: BotIndex,
        dc: DcId,
        #[source]
        source: ProtocolError,
    },

    #[error("Bot {bot} authorization handshake with {dc} failed: {source}")]
    Handshake {
        bot: BotIndex,
        dc: DcId,
        #[source]
        source: ProtocolError,
    },
}

impl SessionError {
    /// Underlying protocol failure.
    pub fn protocol_error(&self) -> &ProtocolError {
        match self {
            SessionError::Establish { source, .. } | SessionError::Handshake { source, .. } => {
                source
            }
        }
    }
}

/// Outcome of the cross-datacenter authorization exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Authorized,
    GaveUp,
}

/// Lazily populated map of datacenter sessions belonging to one bot.
pub struct MediaSessionManager {
    bot: BotIndex,
    client: Arc<dyn ProtocolClient>,
    config: SessionConfig,
    sessions: RwLock<HashMap<DcId, Arc<dyn MediaSession>>>,
    creation_lock: Mutex<()>,
}

impl MediaSessionManager {
    pub fn new(bot: BotIndex, client: Arc<dyn ProtocolClient>, config: SessionConfig) -> Self {
        Self {
            bot,
            client,
            config,
            sessions: RwLock::new(HashMap::new()),
            creation_lock: Mutex::new(()),
        }
    }

    /// Existing session for `dc`, if one was established.
    pub fn session(&self, dc: DcId) -> Option<Arc<dyn MediaSession>> {
        self.sessions.read().get(&dc).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns the session for `dc`, creating and authorizing it if absent.
    ///
    /// If the authorization handshake with a foreign datacenter keeps failing
    /// transiently, the session is still registered; fetches through it will
    /// then fail explicitly.
    ///
    /// # Errors
    /// - `SessionError::Establish` - Key derivation or session start failed
    /// - `SessionError::Handshake` - Authorization import rejected permanently
    pub async fn session_for(&self, dc: DcId) -> Result<Arc<dyn MediaSession>, SessionError> {
        if let Some(session) = self.session(dc) {
            return Ok(session);
        }

        let _guard = self.creation_lock.lock().await;
        if let Some(session) = self.session(dc) {
            return Ok(session);
        }

        let session = self.create_session(dc).await?;
        self.sessions.write().insert(dc, Arc::clone(&session));
        debug!(bot = %self.bot, %dc, "Created media session");
        Ok(session)
    }

    /// Opportunistically opens sessions for the configured datacenters.
    ///
    /// Skips the home datacenter and any datacenter that already has a
    /// session. Failures are logged and swallowed. Returns how many sessions
    /// were newly established.
    pub async fn prewarm(&self) -> usize {
        let home_dc = match self.client.home_dc().await {
            Ok(dc) => dc,
            Err(e) => {
                debug!(bot = %self.bot, error = %e, "Skipping pre-warm, home DC unknown");
                return 0;
            }
        };

        let mut established = 0;
        for &dc in &self.config.prewarm_dcs {
            if dc == home_dc || self.session(dc).is_some() {
                continue;
            }
            match self.session_for(dc).await {
                Ok(_) => {
                    established += 1;
                    debug!(bot = %self.bot, %dc, "Pre-warmed media session");
                }
                Err(e) => debug!(bot = %self.bot, %dc, error = %e, "Could not pre-warm"),
            }
        }
        established
    }

    async fn create_session(&self, dc: DcId) -> Result<Arc<dyn MediaSession>, SessionError> {
        let establish = |source| SessionError::Establish {
            bot: self.bot,
            dc,
            source,
        };

        let home_dc = self.client.home_dc().await.map_err(establish)?;
        let foreign = dc != home_dc;

        let auth_key = if foreign {
            self.client.create_auth_key(dc).await.map_err(establish)?
        } else {
            self.client.home_auth_key().await.map_err(establish)?
        };

        let options = SessionOptions {
            no_updates: true,
            call_timeout: self.config.call_timeout,
            sleep_threshold: self.config.sleep_threshold,
        };
        let session = self
            .client
            .start_session(dc, auth_key, options)
            .await
            .map_err(establish)?;

        if foreign && self.authorize(session.as_ref(), dc).await? == Handshake::GaveUp {
            warn!(
                bot = %self.bot,
                %dc,
                attempts = self.config.handshake_attempts,
                "Proceeding without cross-DC authorization"
            );
        }

        Ok(session)
    }

    /// Exports authorization from the home session and imports it into `session`.
    async fn authorize(
        &self,
        session: &dyn MediaSession,
        dc: DcId,
    ) -> Result<Handshake, SessionError> {
        for attempt in 1..=self.config.handshake_attempts {
            let result = match self.client.export_authorization(dc).await {
                Ok(exported) => session.import_authorization(exported).await,
                Err(e) => Err(e),
            };

            let delay = match result {
                Ok(()) => return Ok(Handshake::Authorized),
                Err(ProtocolError::AuthBytesInvalid) => self.config.auth_bytes_retry,
                Err(e) if e.is_transient() => self.config.transport_retry,
                Err(source) => {
                    return Err(SessionError::Handshake {
                        bot: self.bot,
                        dc,
                        source,
                    });
                }
            };

            debug!(bot = %self.bot, %dc, attempt, "Authorization import failed; retrying");
            tokio::time::sleep(delay).await;
        }
        Ok(Handshake::GaveUp)
    }
}
