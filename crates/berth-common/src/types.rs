//! Domain primitive types used across the berth workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::WILDCARD_SUBJECT;

/// Identifier of a container known to the daemon (full ID or name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a subscription is keyed on: one subject, or every subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKey {
    /// Matches every event regardless of its subject.
    All,
    /// Matches events whose normalized subject equals this identifier.
    Subject(String),
}

impl SubjectKey {
    /// Creates a key for a concrete subject.
    ///
    /// The wildcard sentinel `"*"` and the empty string both map to
    /// [`SubjectKey::All`].
    #[must_use]
    pub fn subject(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.is_empty() || id == WILDCARD_SUBJECT {
            Self::All
        } else {
            Self::Subject(id)
        }
    }

    /// Returns whether this is the wildcard key.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl From<&ContainerId> for SubjectKey {
    fn from(id: &ContainerId) -> Self {
        Self::subject(id.as_str())
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "{WILDCARD_SUBJECT}"),
            Self::Subject(id) => write!(f, "{id}"),
        }
    }
}

/// Identity of one live subscription, used for deregistration.
///
/// Two subscriptions on the same subject are distinct registry entries,
/// so removal goes by this identity rather than by subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    /// Generates a fresh random subscription ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_sentinel_maps_to_all() {
        assert_eq!(SubjectKey::subject("*"), SubjectKey::All);
        assert_eq!(SubjectKey::subject(""), SubjectKey::All);
        assert!(SubjectKey::subject("*").is_wildcard());
    }

    #[test]
    fn concrete_subject_is_kept() {
        let key = SubjectKey::subject("abc");
        assert_eq!(key, SubjectKey::Subject("abc".into()));
        assert_eq!(key.to_string(), "abc");
    }

    #[test]
    fn container_id_converts_to_subject_key() {
        let id = ContainerId::new("abc");
        assert_eq!(SubjectKey::from(&id), SubjectKey::Subject("abc".into()));
    }

    #[test]
    fn subscription_ids_are_unique() {
        assert_ne!(SubscriptionId::generate(), SubscriptionId::generate());
    }
}
