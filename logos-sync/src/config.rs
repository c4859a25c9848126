//! Per-session provider configuration.

use std::time::Duration;
use uuid::Uuid;

/// Delay before a catchup request is (re)issued.
pub const DEFAULT_CATCHUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Participants silent for longer than this are evicted from presence.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Provider configuration. Fixed once the provider is built.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// This editing session.
    pub session_id: String,
    /// The local user; never shown in presence.
    pub user_id: String,
    /// Version to resume from. Overrides both the document's own version
    /// and the version the server reports on connect.
    pub initial_version: Option<u64>,
    /// Fixed interval between catchup attempts.
    pub catchup_retry_delay: Duration,
    /// Presence staleness threshold.
    pub presence_timeout: Duration,
    /// Frames buffered by the WebSocket writer before sends fail.
    pub outgoing_capacity: usize,
}

impl ProviderConfig {
    /// Create a configuration for `user_id` with a fresh session id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            initial_version: None,
            catchup_retry_delay: DEFAULT_CATCHUP_RETRY_DELAY,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            outgoing_capacity: 256,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_initial_version(mut self, version: u64) -> Self {
        self.initial_version = Some(version);
        self
    }

    pub fn with_catchup_retry_delay(mut self, delay: Duration) -> Self {
        self.catchup_retry_delay = delay;
        self
    }

    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }
}
