//! Core identifier types shared across the coordination core
//!
//! Agents and topics are identified by unique names; messages, reviews,
//! issues and pending operations by UUIDs. Each identifier is a newtype so
//! they cannot be mixed up at call sites.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of a message within a topic log. Offsets start at 1; 0 means
/// "nothing consumed yet".
pub type LogOffset = u64;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a published message
    MessageId
);
uuid_id!(
    /// Unique identifier for a review
    ReviewId
);
uuid_id!(
    /// Unique identifier for an issue raised during a review iteration
    IssueId
);
uuid_id!(
    /// Unique identifier for a pending operation
    OperationId
);
uuid_id!(
    /// Identifies one live subscriber session
    SessionId
);

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

name_id!(
    /// Unique agent name
    AgentId
);
name_id!(
    /// Unique topic name
    TopicId
);

impl TopicId {
    const INBOX_PREFIX: &'static str = "inbox:";

    /// Direct topic holding an agent's 1:1 mail
    pub fn inbox(agent: &AgentId) -> Self {
        Self(format!("{}{}", Self::INBOX_PREFIX, agent))
    }

    /// Owner of an inbox topic, if this is one
    pub fn inbox_owner(&self) -> Option<AgentId> {
        self.0
            .strip_prefix(Self::INBOX_PREFIX)
            .map(|name| AgentId::new(name))
    }
}

/// Message and review priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_topic_round_trip() {
        let agent = AgentId::new("builder");
        let topic = TopicId::inbox(&agent);
        assert_eq!(topic.as_str(), "inbox:builder");
        assert_eq!(topic.inbox_owner(), Some(agent));
        assert_eq!(TopicId::new("builds").inbox_owner(), None);
    }

    #[test]
    fn test_uuid_ids_are_distinct() {
        let a = ReviewId::new();
        let b = ReviewId::new();
        assert_ne!(a, b);
        assert_eq!(ReviewId::from_string(&a.to_string()).unwrap(), a);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low < Priority::Normal);
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(Priority::parse("bogus"), None);
    }
}
