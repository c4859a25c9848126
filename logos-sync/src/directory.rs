//! Participant directory: session → user resolution and profile lookup.

use std::collections::HashMap;

/// Display metadata for a participant. Empty strings mean unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantProfile {
    pub name: String,
    pub email: String,
    pub avatar: String,
}

/// Maps connection sessions to stable user identities.
pub trait ParticipantDirectory {
    /// Resolve the user behind a session.
    fn resolve_user_id(&self, session_id: &str) -> String;

    /// Whatever profile data is known for the user.
    fn lookup_participant(&self, _user_id: &str, _session_id: &str) -> ParticipantProfile {
        ParticipantProfile::default()
    }
}

/// In-memory directory. Sessions that were never registered resolve to
/// their own id.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    sessions: HashMap<String, String>,
    profiles: HashMap<String, ParticipantProfile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a user.
    pub fn with_session(
        mut self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        self.sessions.insert(session_id.into(), user_id.into());
        self
    }

    pub fn with_profile(mut self, user_id: impl Into<String>, profile: ParticipantProfile) -> Self {
        self.profiles.insert(user_id.into(), profile);
        self
    }

    pub fn insert_session(&mut self, session_id: impl Into<String>, user_id: impl Into<String>) {
        self.sessions.insert(session_id.into(), user_id.into());
    }
}

impl ParticipantDirectory for StaticDirectory {
    fn resolve_user_id(&self, session_id: &str) -> String {
        self.sessions
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| session_id.to_string())
    }

    fn lookup_participant(&self, user_id: &str, _session_id: &str) -> ParticipantProfile {
        self.profiles.get(user_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registered_session() {
        let dir = StaticDirectory::new()
            .with_session("s-1", "alice")
            .with_session("s-2", "alice");
        assert_eq!(dir.resolve_user_id("s-1"), "alice");
        assert_eq!(dir.resolve_user_id("s-2"), "alice");
    }

    #[test]
    fn test_resolve_unknown_session() {
        let dir = StaticDirectory::new();
        assert_eq!(dir.resolve_user_id("s-9"), "s-9");
    }

    #[test]
    fn test_lookup_profile() {
        let profile = ParticipantProfile {
            name: "Alice".into(),
            email: "alice@example.org".into(),
            avatar: String::new(),
        };
        let dir = StaticDirectory::new().with_profile("alice", profile.clone());
        assert_eq!(dir.lookup_participant("alice", "s-1"), profile);
        assert_eq!(dir.lookup_participant("bob", "s-2"), ParticipantProfile::default());
    }
}
