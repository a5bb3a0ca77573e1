//! Error types for the consistency core.
//!
//! Every public operation returns a typed error instead of panicking on an
//! expected outcome. A tag that is already reserved is a normal
//! [`ReservationError::Conflict`], not a fault.
//!
//! # Error Categories
//!
//! - **CommandError**: what a caller of the command executor sees
//! - **ReservationError**: per-tag reservation outcomes
//! - **EventStoreError**: persistence failures reported by the store
//! - **TagStateError**: tag state computation and cache update failures
//! - **ProjectionError**: multi-projection ingestion and snapshot failures
//! - **ActorAccessError**: failures resolving an actor instance
//!
//! Lower layers convert into [`CommandError`] with `?`:
//!
//! ```rust,ignore
//! async fn current_state(executor: &CommandExecutor, id: &TagStateId) -> CommandResult<TagState> {
//!     Ok(executor.tag_state(id).await?)
//! }
//! ```

use crate::tag::TagValidationError;
use crate::types::{EventId, SortableUniqueId};
use thiserror::Error;

/// Errors returned by the command executor.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The command's own constraints were violated. Nothing was touched.
    #[error("Validation failed: {0}")]
    ValidationFailed(ValidationErrors),

    /// One or more tags in the produced events are malformed.
    #[error("Invalid tags: {} error(s): {}", .0.len(), join(.0))]
    InvalidTag(Vec<TagValidationError>),

    /// At least one consistency tag could not be reserved. No event was
    /// written and every granted reservation was cancelled.
    #[error("Reservation failed: {}", join(.0))]
    ReservationFailed(Vec<TagReservationFailure>),

    /// A business rule was violated by the handler.
    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),

    /// The event store rejected the batch.
    #[error("Event store write failed: {0}")]
    StoreWrite(EventStoreError),

    /// A tag state could not be computed.
    #[error("Tag state error: {0}")]
    StateComputation(TagStateError),

    /// An actor could not be resolved.
    #[error("Actor error: {0}")]
    Actor(ActorAccessError),

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A multi-projection failed while answering a query.
    #[error("Projection error: {0}")]
    Projection(ProjectionError),
}

/// One tag's reason for refusing a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Tag {tag}: {error}")]
pub struct TagReservationFailure {
    /// The tag in `group:content` form.
    pub tag: String,
    /// Why the reservation failed.
    pub error: ReservationError,
}

/// Outcomes of a refused reservation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    /// Another writer holds an unexpired reservation on the tag.
    #[error("tag '{tag}' is already reserved")]
    Conflict {
        /// The reserved tag.
        tag: String,
    },

    /// The writer expected the tag at a different position.
    #[error("optimistic concurrency violation on '{tag}': expected {expected}, current {current}")]
    OptimisticConcurrencyViolation {
        /// The tag.
        tag: String,
        /// Position the writer expected.
        expected: SortableUniqueId,
        /// Position the tag is actually at.
        current: SortableUniqueId,
    },

    /// The reservation actor could not be reached.
    #[error("reservation actor for '{tag}' unavailable: {reason}")]
    Unavailable {
        /// The tag.
        tag: String,
        /// What went wrong.
        reason: String,
    },
}

/// Errors reported by an event store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventStoreError {
    /// The batch was rejected; nothing was written.
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Events could not be read.
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// The store is temporarily unavailable.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Errors from tag state actors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagStateError {
    /// Events could not be read or folded. Never masked by a stale cache.
    #[error("failed to compute state for '{tag_state_id}': {reason}")]
    StateComputation {
        /// `group:content:projector`.
        tag_state_id: String,
        /// What went wrong.
        reason: String,
    },

    /// A state update was addressed to the wrong actor.
    #[error("state for '{actual}' cannot be stored by actor '{expected}'")]
    IdentityMismatch {
        /// This actor's identity.
        expected: String,
        /// The identity carried by the offered state.
        actual: String,
    },

    /// No tag projector is registered under the name.
    #[error("tag projector '{0}' is not registered")]
    ProjectorNotRegistered(String),
}

/// Failure of a projector's fold function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FoldError(String);

impl FoldError {
    /// Creates a fold failure with a description.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The description.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<serde_json::Error> for FoldError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Errors from multi-projection actors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// A fold failed; events earlier in the batch stay applied.
    #[error("Failed to process event {event_id} ({event_type}) in projector {projector}: {source}")]
    EventProcessing {
        /// The event that failed.
        event_id: EventId,
        /// Its payload type.
        event_type: String,
        /// The projector that failed.
        projector: String,
        /// The fold failure.
        source: FoldError,
    },

    /// Promoting buffered events into the safe state failed.
    #[error("Failed to promote buffered events in projector {projector}: {source}")]
    Promotion {
        /// The projector that failed.
        projector: String,
        /// The fold failure.
        source: FoldError,
    },

    /// A snapshot was taken with a different projector version.
    #[error("Snapshot projector version mismatch for '{projector}': current '{current}', snapshot '{snapshot}'")]
    VersionMismatch {
        /// The projector.
        projector: String,
        /// The registered version.
        current: String,
        /// The version recorded in the snapshot.
        snapshot: String,
    },

    /// The snapshot belongs to another projector.
    #[error("Snapshot for projector '{snapshot}' cannot be restored into '{projector}'")]
    ProjectorMismatch {
        /// This actor's projector.
        projector: String,
        /// The projector recorded in the snapshot.
        snapshot: String,
    },

    /// The serialized snapshot exceeds the configured cap.
    #[error("Snapshot size {size_bytes} exceeds limit {limit_bytes}")]
    SnapshotTooLarge {
        /// Serialized size.
        size_bytes: usize,
        /// Configured cap.
        limit_bytes: usize,
    },

    /// The envelope points at external storage that must be resolved first.
    #[error("Snapshot '{key}' is offloaded; load it from blob storage before restoring")]
    OffloadedSnapshot {
        /// The blob key.
        key: String,
    },

    /// State could not be (de)serialized.
    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),

    /// Payload bytes could not be (de)compressed.
    #[error("Snapshot compression failed: {0}")]
    Compression(String),

    /// Events could not be read for catch-up.
    #[error("Catch-up read failed: {0}")]
    Store(#[from] EventStoreError),
}

/// Errors resolving an actor instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorAccessError {
    /// Nothing is registered for the capability and id.
    #[error("no {capability} actor registered for '{id}'")]
    NotRegistered {
        /// The requested capability.
        capability: &'static str,
        /// The requested id.
        id: String,
    },

    /// A registered actor has a different type than requested.
    #[error("{capability} actor '{id}' has an unexpected type")]
    TypeMismatch {
        /// The requested capability.
        capability: &'static str,
        /// The requested id.
        id: String,
    },

    /// The hosting runtime could not provide the actor.
    #[error("actor '{id}' unavailable: {reason}")]
    Unavailable {
        /// The requested id.
        id: String,
        /// What went wrong.
        reason: String,
    },
}

/// One violated command constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct FieldViolation {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

/// Every constraint a command violates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{}", join(.violations.as_slice()))]
pub struct ValidationErrors {
    violations: Vec<FieldViolation>,
}

impl ValidationErrors {
    /// An empty set of violations.
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    /// Records a violation.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(FieldViolation {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Records a violation when `condition` does not hold.
    pub fn require(&mut self, condition: bool, field: &str, message: &str) {
        if !condition {
            self.add(field, message);
        }
    }

    /// The recorded violations.
    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<EventStoreError> for CommandError {
    fn from(err: EventStoreError) -> Self {
        Self::StoreWrite(err)
    }
}

impl From<TagStateError> for CommandError {
    fn from(err: TagStateError) -> Self {
        Self::StateComputation(err)
    }
}

impl From<ActorAccessError> for CommandError {
    fn from(err: ActorAccessError) -> Self {
        Self::Actor(err)
    }
}

impl From<ValidationErrors> for CommandError {
    fn from(err: ValidationErrors) -> Self {
        Self::ValidationFailed(err)
    }
}

impl From<ProjectionError> for CommandError {
    fn from(err: ProjectionError) -> Self {
        Self::Projection(err)
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for command execution.
pub type CommandResult<T> = Result<T, CommandError>;
/// Result type for reservation actor operations.
pub type ReservationResult<T> = Result<T, ReservationError>;
/// Result type for event store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;
/// Result type for tag state operations.
pub type TagStateResult<T> = Result<T, TagStateError>;
/// Result type for multi-projection operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;
/// Result type for actor resolution.
pub type ActorResult<T> = Result<T, ActorAccessError>;
/// Result type for fold functions.
pub type FoldResult<T> = Result<T, FoldError>;
