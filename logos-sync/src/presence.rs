//! Presence tracking from telepointer broadcasts.
//!
//! ## Architecture
//!
//! ```text
//! Telepointer { session_id, timestamp }
//!       │
//!       ▼
//! ParticipantDirectory::resolve_user_id()
//!       │  (local user → ignored)
//!       ▼
//! PresenceTracker::on_telepointer()
//!       │  upsert by user_id, then sweep
//!       ▼
//! PresenceChange { joined: [updated], left: [evicted] }
//! ```
//!
//! There is no background timer: a stale participant is only evicted when
//! some telepointer arrives and triggers the sweep.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::DEFAULT_PRESENCE_TIMEOUT;
use crate::directory::ParticipantDirectory;
use crate::protocol::Telepointer;

/// An active participant. One entry per user, whatever the number of
/// sessions; the session that reported last is the one shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub session_id: String,
    pub name: String,
    pub email: String,
    pub avatar: String,
    /// Timestamp (ms) of the latest accepted telepointer.
    pub last_active: u64,
}

/// Result of one accepted telepointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub joined: Vec<Participant>,
    pub left: Vec<Participant>,
}

/// Table of active participants keyed by user id.
pub struct PresenceTracker {
    local_user_id: String,
    participants: HashMap<String, Participant>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self::with_timeout(local_user_id, DEFAULT_PRESENCE_TIMEOUT)
    }

    pub fn with_timeout(local_user_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            participants: HashMap::new(),
            timeout,
        }
    }

    /// Handle a telepointer received at wall time `now_ms`.
    ///
    /// Returns `None` when the event is ignored: it came from the local
    /// user, or it is older than what we already know for that user.
    pub fn on_telepointer<R: ParticipantDirectory + ?Sized>(
        &mut self,
        telepointer: &Telepointer,
        directory: &R,
        now_ms: u64,
    ) -> Option<PresenceChange> {
        let user_id = directory.resolve_user_id(&telepointer.session_id);
        if user_id == self.local_user_id {
            return None;
        }

        if let Some(existing) = self.participants.get(&user_id) {
            if existing.last_active > telepointer.timestamp {
                log::debug!(
                    "Dropping stale telepointer from {} ({} < {})",
                    user_id,
                    telepointer.timestamp,
                    existing.last_active
                );
                return None;
            }
        }

        let profile = directory.lookup_participant(&user_id, &telepointer.session_id);
        let participant = Participant {
            user_id: user_id.clone(),
            session_id: telepointer.session_id.clone(),
            name: profile.name,
            email: profile.email,
            avatar: profile.avatar,
            last_active: telepointer.timestamp,
        };
        self.participants.insert(user_id, participant.clone());

        let left = self.sweep(now_ms);
        Some(PresenceChange {
            joined: vec![participant],
            left,
        })
    }

    /// Evict every participant inactive for longer than the timeout.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<Participant> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let stale: Vec<String> = self
            .participants
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_active) > timeout_ms)
            .map(|p| p.user_id.clone())
            .collect();

        let mut left: Vec<Participant> = stale
            .iter()
            .filter_map(|id| self.participants.remove(id))
            .collect();
        left.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        left
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    /// Active participants ordered by user id.
    pub fn participants(&self) -> Vec<&Participant> {
        let mut all: Vec<&Participant> = self.participants.values().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ParticipantProfile, StaticDirectory};
    use crate::protocol::Selection;

    const MINUTE: u64 = 60_000;

    fn telepointer(session: &str, timestamp: u64) -> Telepointer {
        Telepointer {
            session_id: session.into(),
            timestamp,
            selection: Selection::caret(0),
        }
    }

    fn directory() -> StaticDirectory {
        StaticDirectory::new()
            .with_session("me-1", "me")
            .with_session("alice-1", "alice")
            .with_session("alice-2", "alice")
            .with_session("bob-1", "bob")
    }

    #[test]
    fn test_ignores_local_user() {
        let mut tracker = PresenceTracker::new("me");
        let change = tracker.on_telepointer(&telepointer("me-1", 1_000), &directory(), 1_000);
        assert!(change.is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_upsert_reports_joined() {
        let mut tracker = PresenceTracker::new("me");
        let change = tracker
            .on_telepointer(&telepointer("alice-1", 1_000), &directory(), 1_000)
            .unwrap();
        assert_eq!(change.joined.len(), 1);
        assert_eq!(change.joined[0].user_id, "alice");
        assert_eq!(change.joined[0].session_id, "alice-1");
        assert_eq!(change.joined[0].last_active, 1_000);
        assert!(change.left.is_empty());
    }

    #[test]
    fn test_sessions_collapse_to_user_last_wins() {
        let mut tracker = PresenceTracker::new("me");
        let dir = directory();
        tracker.on_telepointer(&telepointer("alice-1", 1_000), &dir, 1_000);
        tracker.on_telepointer(&telepointer("alice-2", 2_000), &dir, 2_000);

        assert_eq!(tracker.len(), 1);
        let alice = tracker.participant("alice").unwrap();
        assert_eq!(alice.session_id, "alice-2");
        assert_eq!(alice.last_active, 2_000);
    }

    #[test]
    fn test_rejects_reordered_telepointer() {
        let mut tracker = PresenceTracker::new("me");
        let dir = directory();
        tracker.on_telepointer(&telepointer("alice-2", 5_000), &dir, 5_000);
        let change = tracker.on_telepointer(&telepointer("alice-1", 4_000), &dir, 5_100);

        assert!(change.is_none());
        assert_eq!(tracker.participant("alice").unwrap().session_id, "alice-2");
    }

    #[test]
    fn test_equal_timestamp_is_accepted() {
        let mut tracker = PresenceTracker::new("me");
        let dir = directory();
        tracker.on_telepointer(&telepointer("alice-1", 5_000), &dir, 5_000);
        assert!(tracker
            .on_telepointer(&telepointer("alice-2", 5_000), &dir, 5_000)
            .is_some());
    }

    #[test]
    fn test_sweep_evicts_unrelated_stale_participant() {
        let mut tracker = PresenceTracker::new("me");
        let dir = directory();
        tracker.on_telepointer(&telepointer("bob-1", 0), &dir, 0);

        let now = 5 * MINUTE + 1;
        let change = tracker
            .on_telepointer(&telepointer("alice-1", now), &dir, now)
            .unwrap();

        assert_eq!(change.joined[0].user_id, "alice");
        assert_eq!(change.left.len(), 1);
        assert_eq!(change.left[0].user_id, "bob");
        assert!(tracker.participant("bob").is_none());
    }

    #[test]
    fn test_exactly_at_threshold_is_kept() {
        let mut tracker = PresenceTracker::new("me");
        let dir = directory();
        tracker.on_telepointer(&telepointer("bob-1", 0), &dir, 0);

        let now = 5 * MINUTE;
        let change = tracker
            .on_telepointer(&telepointer("alice-1", now), &dir, now)
            .unwrap();
        assert!(change.left.is_empty());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_merges_directory_profile() {
        let dir = directory().with_profile(
            "alice",
            ParticipantProfile {
                name: "Alice".into(),
                email: "alice@example.org".into(),
                avatar: "https://example.org/a.png".into(),
            },
        );
        let mut tracker = PresenceTracker::new("me");
        let change = tracker
            .on_telepointer(&telepointer("alice-1", 10), &dir, 10)
            .unwrap();
        let alice = &change.joined[0];
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.email, "alice@example.org");
        assert_eq!(alice.avatar, "https://example.org/a.png");

        let bob = tracker
            .on_telepointer(&telepointer("bob-1", 10), &dir, 10)
            .unwrap();
        assert_eq!(bob.joined[0].name, "");
    }

    #[test]
    fn test_custom_timeout() {
        let mut tracker = PresenceTracker::with_timeout("me", Duration::from_secs(1));
        let dir = directory();
        tracker.on_telepointer(&telepointer("bob-1", 0), &dir, 0);
        let change = tracker
            .on_telepointer(&telepointer("alice-1", 1_001), &dir, 1_001)
            .unwrap();
        assert_eq!(change.left.len(), 1);
    }

    #[test]
    fn test_participants_sorted() {
        let mut tracker = PresenceTracker::new("me");
        let dir = directory();
        tracker.on_telepointer(&telepointer("bob-1", 1), &dir, 1);
        tracker.on_telepointer(&telepointer("alice-1", 2), &dir, 2);
        let ids: Vec<&str> = tracker
            .participants()
            .iter()
            .map(|p| p.user_id.as_str())
            .collect();
        assert_eq!(ids, vec!["alice", "bob"]);
    }
}
