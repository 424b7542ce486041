//! Conversation types and state management

mod ledger;

pub use ledger::MessageLedger;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier assigned to a message when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Model,
    System,
}

/// Performance figures attached to a model message once it finalizes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub execution_time_ms: u64,
    /// Live runtime workers when the turn finished
    pub worker_count: usize,
    /// Negative when the estimator could not produce a value
    pub estimated_energy: f64,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: Author,
    pub raw_text: String,
    pub is_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

impl Message {
    /// An empty model message still waiting for its first fragment
    pub fn pending_model() -> Self {
        Self {
            id: MessageId::new(),
            author: Author::Model,
            raw_text: String::new(),
            is_pending: true,
            metrics: None,
        }
    }

    pub fn complete(text: impl Into<String>, author: Author) -> Self {
        Self {
            id: MessageId::new(),
            author,
            raw_text: text.into(),
            is_pending: false,
            metrics: None,
        }
    }

    /// Display text (trimmed)
    pub fn text(&self) -> &str {
        self.raw_text.trim()
    }

    pub fn is_from_user(&self) -> bool {
        self.author == Author::User
    }
}
