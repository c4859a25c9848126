//! Document-model capability and a yrs-backed reference model.
//!
//! The provider never touches the version counter itself: it forwards
//! accepted batches into the model and reads the version back.
//!
//! `YrsDocument` follows the usual collab bookkeeping on top of a yrs text:
//!
//! ```text
//! local edit ──► unconfirmed [s1, s2] ──► sendable_steps() ──► channel
//!                     ▲
//!                     │ pop as our own steps come back
//! remote batch ───────┴──► apply updates, version = batch.version
//! ```

use std::collections::VecDeque;

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::error::SyncError;
use crate::protocol::{DocumentState, SendableSteps, Step, StepBatch};

/// Name of the shared text root in `YrsDocument`.
pub const TEXT_ROOT: &str = "content";

/// Outcome of a local edit: the steps it produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    steps: Vec<Step>,
}

impl Transaction {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// A transaction with no steps (selection or metadata change).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }
}

/// What the provider needs from the document model.
pub trait DocumentModel {
    /// Current version: number of confirmed steps applied.
    fn version(&self) -> u64;

    /// Wire representation of the whole document.
    fn encode_document(&self) -> Vec<u8>;

    /// Local steps not yet confirmed, if any.
    fn sendable_steps(&self) -> Option<SendableSteps>;

    /// Apply a batch that starts exactly at `version()`.
    fn apply_remote(
        &mut self,
        batch: &StepBatch,
        user_ids: &[Option<String>],
    ) -> Result<(), SyncError>;

    /// Replace the document with an authoritative snapshot. Unconfirmed
    /// local steps are dropped.
    fn reset(&mut self, doc: &[u8], version: u64) -> Result<(), SyncError>;

    fn state(&self) -> DocumentState {
        DocumentState {
            doc: self.encode_document(),
            version: self.version(),
        }
    }
}

/// Text document over a `yrs::Doc`. Each local edit is one step carrying
/// the v1 update of its transaction.
pub struct YrsDocument {
    doc: Doc,
    session_id: String,
    version: u64,
    unconfirmed: VecDeque<Step>,
}

impl YrsDocument {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            doc: Doc::new(),
            session_id: session_id.into(),
            version: 0,
            unconfirmed: VecDeque::new(),
        }
    }

    /// Build from an encoded full-state update.
    pub fn from_state(
        session_id: impl Into<String>,
        doc: &[u8],
        version: u64,
    ) -> Result<Self, SyncError> {
        let mut document = Self::new(session_id);
        document.reset(doc, version)?;
        Ok(document)
    }

    /// Insert `chunk` at character `index`.
    pub fn insert_text(&mut self, index: u32, chunk: &str) -> Transaction {
        if chunk.is_empty() {
            return Transaction::empty();
        }
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.record_local(update)
    }

    /// Remove `len` characters starting at `index`.
    pub fn remove_text(&mut self, index: u32, len: u32) -> Transaction {
        if len == 0 {
            return Transaction::empty();
        }
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.remove_range(&mut txn, index, len);
            txn.encode_update_v1()
        };
        self.record_local(update)
    }

    /// Current text content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(TEXT_ROOT) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    /// Re-apply local steps captured before a reset, marking them
    /// unconfirmed again. The returned transaction can be handed to
    /// `SyncProvider::send`.
    pub fn replay_local_steps(&mut self, steps: &[Step]) -> Result<Transaction, SyncError> {
        let mut replayed = Vec::with_capacity(steps.len());
        for step in steps {
            self.apply_update(&step.payload)?;
            let step = Step::new(self.session_id.clone(), step.payload.clone());
            self.unconfirmed.push_back(step.clone());
            replayed.push(step);
        }
        Ok(Transaction::new(replayed))
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn record_local(&mut self, update: Vec<u8>) -> Transaction {
        let step = Step::new(self.session_id.clone(), update);
        self.unconfirmed.push_back(step.clone());
        Transaction::new(vec![step])
    }

    fn apply_update(&self, payload: &[u8]) -> Result<(), SyncError> {
        let update = Update::decode_v1(payload)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SyncError::Document(e.to_string()))
    }
}

impl DocumentModel for YrsDocument {
    fn version(&self) -> u64 {
        self.version
    }

    fn encode_document(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn sendable_steps(&self) -> Option<SendableSteps> {
        if self.unconfirmed.is_empty() {
            return None;
        }
        Some(SendableSteps {
            version: self.version,
            steps: self.unconfirmed.iter().cloned().collect(),
        })
    }

    fn apply_remote(
        &mut self,
        batch: &StepBatch,
        _user_ids: &[Option<String>],
    ) -> Result<(), SyncError> {
        if batch.start_version() != Some(self.version) {
            return Err(SyncError::Document(format!(
                "batch ending at {} with {} steps does not start at version {}",
                batch.version,
                batch.len(),
                self.version
            )));
        }

        for (index, step) in batch.steps.iter().enumerate() {
            if batch.step_session(index) == Some(self.session_id.as_str()) {
                // Our own step came back: already applied locally.
                self.unconfirmed.pop_front();
            }
            self.apply_update(&step.payload)?;
        }
        self.version = batch.version;
        Ok(())
    }

    fn reset(&mut self, doc: &[u8], version: u64) -> Result<(), SyncError> {
        let fresh = Doc::new();
        if !doc.is_empty() {
            let update = Update::decode_v1(doc)?;
            let mut txn = fresh.transact_mut();
            txn.apply_update(update)
                .map_err(|e| SyncError::Document(e.to_string()))?;
        }
        self.doc = fresh;
        self.version = version;
        self.unconfirmed.clear();
        Ok(())
    }
}

/// Model that keeps steps opaque: versions advance by step count and
/// payloads are never interpreted. Useful for driving the provider without
/// a real editor.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocument {
    session_id: String,
    version: u64,
    doc: Vec<u8>,
    applied: Vec<StepBatch>,
    pending: Vec<Step>,
    fail_next_apply: bool,
}

impl MemoryDocument {
    pub fn new(session_id: impl Into<String>, version: u64) -> Self {
        Self {
            session_id: session_id.into(),
            version,
            ..Self::default()
        }
    }

    /// Record a local edit carrying `payload`.
    pub fn edit(&mut self, payload: Vec<u8>) -> Transaction {
        let step = Step::new(self.session_id.clone(), payload);
        self.pending.push(step.clone());
        Transaction::new(vec![step])
    }

    /// Batches applied so far, in order.
    pub fn applied(&self) -> &[StepBatch] {
        &self.applied
    }

    /// Make the next `apply_remote` call fail.
    pub fn fail_next_apply(&mut self) {
        self.fail_next_apply = true;
    }
}

impl DocumentModel for MemoryDocument {
    fn version(&self) -> u64 {
        self.version
    }

    fn encode_document(&self) -> Vec<u8> {
        self.doc.clone()
    }

    fn sendable_steps(&self) -> Option<SendableSteps> {
        if self.pending.is_empty() {
            return None;
        }
        Some(SendableSteps {
            version: self.version,
            steps: self.pending.clone(),
        })
    }

    fn apply_remote(
        &mut self,
        batch: &StepBatch,
        _user_ids: &[Option<String>],
    ) -> Result<(), SyncError> {
        if std::mem::take(&mut self.fail_next_apply) {
            return Err(SyncError::Document("rejected".into()));
        }
        if batch.start_version() != Some(self.version) {
            return Err(SyncError::Document(format!(
                "batch ending at {} does not start at version {}",
                batch.version, self.version
            )));
        }
        let own = (0..batch.len())
            .filter(|i| batch.step_session(*i) == Some(self.session_id.as_str()))
            .count();
        self.pending.drain(..own.min(self.pending.len()));
        self.version = batch.version;
        self.applied.push(batch.clone());
        Ok(())
    }

    fn reset(&mut self, doc: &[u8], version: u64) -> Result<(), SyncError> {
        self.doc = doc.to_vec();
        self.version = version;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// What the server would broadcast for `doc`'s pending steps.
    fn confirm(doc: &YrsDocument) -> StepBatch {
        let sendable = doc.sendable_steps().unwrap();
        let version = sendable.version + sendable.steps.len() as u64;
        StepBatch::new(version, sendable.steps)
    }

    #[test]
    fn test_local_edit_is_unconfirmed() {
        let mut doc = YrsDocument::new("a");
        let tr = doc.insert_text(0, "hello");

        assert!(tr.has_steps());
        assert_eq!(doc.text(), "hello");
        assert_eq!(doc.unconfirmed_len(), 1);
        let sendable = doc.sendable_steps().unwrap();
        assert_eq!(sendable.version, 0);
        assert_eq!(sendable.steps.len(), 1);
        assert_eq!(sendable.steps[0].session_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_empty_edits_produce_no_steps() {
        let mut doc = YrsDocument::new("a");
        assert!(!doc.insert_text(0, "").has_steps());
        assert!(!doc.remove_text(0, 0).has_steps());
        assert!(doc.sendable_steps().is_none());
    }

    #[test]
    fn test_own_steps_confirmed_on_echo() {
        let mut doc = YrsDocument::new("a");
        doc.insert_text(0, "hi");
        let batch = confirm(&doc);

        doc.apply_remote(&batch, &[Some("alice".into())]).unwrap();
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.unconfirmed_len(), 0);
        assert!(doc.sendable_steps().is_none());
        assert_eq!(doc.text(), "hi");
    }

    #[test]
    fn test_remote_steps_converge() {
        let mut a = YrsDocument::new("a");
        let mut b = YrsDocument::new("b");

        a.insert_text(0, "hello");
        let batch = confirm(&a);
        a.apply_remote(&batch, &[]).unwrap();
        b.apply_remote(&batch, &[]).unwrap();

        assert_eq!(b.text(), "hello");
        assert_eq!(b.version(), 1);

        b.insert_text(5, " world");
        let batch = confirm(&b);
        a.apply_remote(&batch, &[]).unwrap();
        b.apply_remote(&batch, &[]).unwrap();

        assert_eq!(a.text(), "hello world");
        assert_eq!(a.text(), b.text());
        assert_eq!(a.version(), 2);
    }

    #[test]
    fn test_apply_rejects_misaligned_batch() {
        let mut doc = YrsDocument::new("a");
        let batch = StepBatch::new(3, vec![Step::anonymous(Vec::new())]);
        assert!(matches!(
            doc.apply_remote(&batch, &[]),
            Err(SyncError::Document(_))
        ));
        assert_eq!(doc.version(), 0);
    }

    #[test]
    fn test_reset_and_encode() {
        let mut source = YrsDocument::new("a");
        source.insert_text(0, "snapshot");
        let encoded = source.encode_document();

        let mut doc = YrsDocument::new("b");
        doc.insert_text(0, "local");
        doc.reset(&encoded, 40).unwrap();

        assert_eq!(doc.text(), "snapshot");
        assert_eq!(doc.version(), 40);
        assert_eq!(doc.unconfirmed_len(), 0);
        assert_eq!(doc.state().version, 40);
    }

    #[test]
    fn test_reset_with_empty_document() {
        let mut doc = YrsDocument::new("a");
        doc.insert_text(0, "x");
        doc.reset(&[], 3).unwrap();
        assert_eq!(doc.text(), "");
        assert_eq!(doc.version(), 3);
    }

    #[test]
    fn test_replay_local_steps_after_reset() {
        let mut doc = YrsDocument::new("a");
        doc.insert_text(0, "abc");
        let captured = doc.sendable_steps().unwrap().steps;

        doc.reset(&[], 10).unwrap();
        let tr = doc.replay_local_steps(&captured).unwrap();

        assert_eq!(tr.steps().len(), 1);
        assert_eq!(doc.text(), "abc");
        assert_eq!(doc.sendable_steps().unwrap().version, 10);
    }

    #[test]
    fn test_remove_text() {
        let mut doc = YrsDocument::new("a");
        doc.insert_text(0, "hello");
        doc.remove_text(1, 3);
        assert_eq!(doc.text(), "ho");
        assert_eq!(doc.unconfirmed_len(), 2);
    }

    #[test]
    fn test_from_state() {
        let mut source = YrsDocument::new("a");
        source.insert_text(0, "seed");
        let doc = YrsDocument::from_state("b", &source.encode_document(), 7).unwrap();
        assert_eq!(doc.text(), "seed");
        assert_eq!(doc.version(), 7);
        assert_eq!(doc.session_id(), "b");
    }

    #[test]
    fn test_memory_document_tracks_versions() {
        let mut doc = MemoryDocument::new("a", 5);
        doc.edit(vec![1]);
        assert_eq!(doc.sendable_steps().unwrap().version, 5);

        let echo = StepBatch::new(6, vec![Step::new("a", vec![1])]);
        doc.apply_remote(&echo, &[]).unwrap();
        assert_eq!(doc.version(), 6);
        assert!(doc.sendable_steps().is_none());
        assert_eq!(doc.applied().len(), 1);

        doc.fail_next_apply();
        let next = StepBatch::new(7, vec![Step::anonymous(vec![2])]);
        assert!(doc.apply_remote(&next, &[]).is_err());
        assert!(doc.apply_remote(&next, &[]).is_ok());
    }
}
