//! ID types minted by the orchestrator.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::define_id;

define_id!(TaskId, "task");
define_id!(BroadcastId, "bcast");

// =============================================================================
// Events
// =============================================================================

/// Event ID is a process-local monotonic integer, not ULID-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    /// Creates a new EventId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Self)
    }
}

/// Hands out strictly increasing [`EventId`]s starting at 1.
#[derive(Debug, Default)]
pub struct EventIdSequence(AtomicI64);

impl EventIdSequence {
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Returns the next ID in the sequence.
    pub fn next_id(&self) -> EventId {
        EventId(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
