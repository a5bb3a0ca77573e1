//! Metadata recorded with every written event.

use crate::types::Timestamp;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Links all events written by one command execution.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new correlation id with the current timestamp.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() always yields a v7 UUID")
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Contextual information about who wrote an event and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// When the event was assembled for writing.
    pub timestamp: Timestamp,
    /// Shared by every event of the same command execution.
    pub correlation_id: CorrelationId,
    /// Type name of the command that produced the event.
    pub command_type: Option<String>,
    /// Name of the executor that wrote the event.
    pub executed_by: Option<String>,
    /// Identifies the user on whose behalf the command ran.
    pub user_id: Option<String>,
    /// Additional custom metadata.
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl EventMetadata {
    /// Creates metadata with the current timestamp and a new correlation id.
    pub fn new() -> Self {
        Self {
            timestamp: Timestamp::now(),
            correlation_id: CorrelationId::new(),
            command_type: None,
            executed_by: None,
            user_id: None,
            custom: HashMap::new(),
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Sets the producing command type.
    #[must_use]
    pub fn with_command_type(mut self, command_type: impl Into<String>) -> Self {
        self.command_type = Some(command_type.into());
        self
    }

    /// Sets the writing executor.
    #[must_use]
    pub fn with_executed_by(mut self, executor: impl Into<String>) -> Self {
        self.executed_by = Some(executor.into());
        self
    }

    /// Sets the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Adds custom metadata.
    #[must_use]
    pub fn with_custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}
