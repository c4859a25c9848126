//! Step, batch and presence types plus the binary frame envelope.
//!
//! A step is an opaque edit record produced by the document model; the
//! engine only cares about how many steps a batch carries and which
//! session produced each one. Versions count steps: a batch's `version` is
//! the document version *after* its steps, so its start version is
//! `version - steps.len()`.
//!
//! Wire format (bincode-encoded `Frame`):
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ variant    │ fields                                       │
//! │ 1 byte     │ varint versions, length-prefixed byte arrays │
//! └────────────┴──────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One opaque edit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Session that produced the step, when the server stamped it.
    pub session_id: Option<String>,
    /// Encoded step (for `YrsDocument`, a v1 update).
    pub payload: Vec<u8>,
}

impl Step {
    pub fn new(session_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            payload,
        }
    }

    /// A step with no originating session.
    pub fn anonymous(payload: Vec<u8>) -> Self {
        Self {
            session_id: None,
            payload,
        }
    }
}

/// A versioned group of steps as received from the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBatch {
    /// Document version after applying `steps`.
    pub version: u64,
    pub steps: Vec<Step>,
    /// Session the whole batch came from, if the channel knows it.
    pub origin_session_id: Option<String>,
}

impl StepBatch {
    pub fn new(version: u64, steps: Vec<Step>) -> Self {
        Self {
            version,
            steps,
            origin_session_id: None,
        }
    }

    pub fn with_origin(mut self, session_id: impl Into<String>) -> Self {
        self.origin_session_id = Some(session_id.into());
        self
    }

    /// Number of steps in the batch.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Version the batch applies on top of. `None` when the batch claims
    /// more steps than its end version allows.
    pub fn start_version(&self) -> Option<u64> {
        self.version.checked_sub(self.steps.len() as u64)
    }

    /// Reject batches the queue cannot reason about.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.steps.is_empty() {
            return Err(SyncError::MalformedBatch(format!(
                "batch at version {} carries no steps",
                self.version
            )));
        }
        if self.start_version().is_none() {
            return Err(SyncError::MalformedBatch(format!(
                "batch at version {} carries {} steps",
                self.version,
                self.steps.len()
            )));
        }
        Ok(())
    }

    /// Session responsible for the step at `index`: the step's own stamp,
    /// falling back to the batch origin.
    pub fn step_session(&self, index: usize) -> Option<&str> {
        self.steps
            .get(index)
            .and_then(|s| s.session_id.as_deref())
            .or(self.origin_session_id.as_deref())
    }
}

/// Local steps not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendableSteps {
    /// Version the steps were made on top of.
    pub version: u64,
    pub steps: Vec<Step>,
}

/// Encoded document together with its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub doc: Vec<u8>,
    pub version: u64,
}

/// Answer to a `request_steps` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchupResponse {
    /// The gap was too large; the server sent the whole document.
    Snapshot { doc: Vec<u8>, version: u64 },
    /// The missing steps, ending at `version`.
    Steps { version: u64, steps: Vec<Step> },
}

/// Cursor location inside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: u64,
    pub head: u64,
}

impl Selection {
    pub fn caret(pos: u64) -> Self {
        Self { anchor: pos, head: pos }
    }
}

/// Location broadcast used only for presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telepointer {
    pub session_id: String,
    /// Send time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub selection: Selection,
}

/// Messages the editing layer can ask the provider to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Telepointer { selection: Selection },
    /// Kinds this engine does not understand yet; dropped.
    Other { kind: String },
}

impl OutgoingMessage {
    pub fn kind(&self) -> &str {
        match self {
            OutgoingMessage::Telepointer { .. } => "telepointer",
            OutgoingMessage::Other { kind } => kind,
        }
    }
}

/// Envelope exchanged with the collaboration server over a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client handshake.
    Connect {
        session_id: String,
        version: u64,
        doc: Vec<u8>,
    },
    /// Server handshake reply with the authoritative document.
    Connected { doc: Vec<u8>, version: u64 },
    /// Local steps sent by the client.
    SendSteps(SendableSteps),
    /// Steps broadcast by the server.
    Data(StepBatch),
    Telepointer(Telepointer),
    /// Catchup request carrying the last known-good version.
    GetSteps { since: u64 },
    CatchupSteps { version: u64, steps: Vec<Step> },
    CatchupSnapshot { doc: Vec<u8>, version: u64 },
    CatchupFailed { reason: String },
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}
