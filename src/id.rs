//! Identifier generation
//!
//! Session ids must be infeasible to guess by enumeration; player ids only
//! need to be unique per connection. Both ride on `uuid` v4.

use serde::{Deserialize, Serialize};

/// Opaque, unguessable session identifier (122 bits of randomness from a
/// UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new, unguessable session id.
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        SessionId(value)
    }
}

/// Per-connection ephemeral identifier, generated on connect (§3.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Generate a new player id.
    pub fn generate() -> Self {
        PlayerId(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed palette of player avatars, assigned round-robin at connect time
/// so the assignment is deterministic given connection order (and tests
/// are reproducible without faking randomness).
pub const AVATAR_PALETTE: &[&str] = &[
    "red-fox", "blue-jay", "green-newt", "amber-owl", "violet-hare",
    "teal-otter", "coral-crab", "gold-finch", "slate-wolf", "lime-gecko",
];

/// Pick the avatar for the `nth` connection accepted by a coordinator.
pub fn avatar_for_connection_index(nth: usize) -> &'static str {
    AVATAR_PALETTE[nth % AVATAR_PALETTE.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn avatar_assignment_wraps_round_robin() {
        assert_eq!(
            avatar_for_connection_index(0),
            avatar_for_connection_index(AVATAR_PALETTE.len())
        );
    }
}
