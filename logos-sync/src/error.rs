//! Error taxonomy for the synchronization engine.
//!
//! Most of these never reach the editing layer: the provider absorbs gaps,
//! resync failures and malformed batches internally and degrades to
//! "stale until resynced". They surface from the capability traits
//! (channel, document model) and from the connect handshake.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection closed")]
    ConnectionClosed,

    /// The outgoing frame buffer is full.
    #[error("Outgoing buffer full")]
    Backpressure,

    #[error("Malformed step batch: {0}")]
    MalformedBatch(String),

    #[error("Document model error: {0}")]
    Document(String),

    #[error("Catchup request failed: {0}")]
    Catchup(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::Document(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(SyncError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            SyncError::MalformedBatch("no steps".into()).to_string(),
            "Malformed step batch: no steps"
        );
        assert_eq!(
            SyncError::Catchup("timeout".into()).to_string(),
            "Catchup request failed: timeout"
        );
    }
}
