//! `dcbcore` - the consistency core of a dynamic consistency boundary (DCB)
//! event-sourcing runtime.
//!
//! There are no aggregates and no streams. Every event carries tags, and the
//! consistency boundary of a write is the set of consistency tags on the
//! events it produces:
//!
//! - [`actors::TagReservationActor`] grants one short-lived write
//!   reservation per tag, with optional optimistic position checks
//! - [`actors::TagStateActor`] folds the events of one tag through a
//!   [`TagProjector`] and caches the result
//! - [`actors::MultiProjectionActor`] folds every event through a
//!   [`MultiProjector`] into a safe state, which only contains events older
//!   than the safe window, and an unsafe state, which contains everything
//! - [`CommandExecutor`] runs a command handler, reserves the tags of the
//!   events it produced, writes them and releases the reservations
//!
//! Storage, publication and actor hosting are behind the [`EventStore`],
//! [`EventPublisher`] and [`ActorAccessor`] traits. The `dcbcore-memory`
//! crate provides in-process implementations of all three.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accessor;
pub mod actors;
pub mod config;
pub mod errors;
pub mod event;
pub mod executor;
pub mod logging;
pub mod metadata;
pub mod projection;
pub mod publisher;
pub mod store;
pub mod tag;
pub mod tag_projector;
pub mod types;

#[cfg(test)]
mod test_support;

pub use accessor::{resolve_multi_projection, ActorAccessor};
pub use actors::{
    EventSource, InMemoryTagStateCache, MultiProjectionActor, MultiProjectionState,
    TagConsistency, TagReservationActor, TagStateAccess, TagStateActor, TagStateCache,
    TagWriteReservation,
};
pub use config::{
    CancellationWindowMs, ExecutorOptions, MultiProjectionActorOptions, TagConsistentActorOptions,
};
pub use errors::{
    ActorAccessError, ActorResult, CommandError, CommandResult, EventStoreError,
    EventStoreResult, FoldError, FoldResult, ProjectionError, ProjectionResult, ReservationError,
    ReservationResult, TagReservationFailure, TagStateError, TagStateResult, ValidationErrors,
};
pub use event::{Event, EventPayload, EventPayloadWithTags};
pub use executor::{
    Command, CommandContext, CommandExecutor, CommandHandler, ExecutionContext, ExecutionResult,
};
pub use logging::{init_tracing, LogFormat};
pub use metadata::{CorrelationId, EventMetadata};
pub use projection::{
    DualStateAccessor, MultiProjectionQuery, MultiProjector, ProjectionPosition,
    SerializableMultiProjectionState, SnapshotEnvelope, SnapshotPersistenceData,
};
pub use publisher::{EventPublisher, PublishError};
pub use store::{EventStore, TagLatest, TagWriteResult};
pub use tag::{validate_tags, Tag, TagKey, TagStateId, TagValidationError};
pub use tag_projector::{TagProjector, TagProjectorRegistry, TagState, TagStatePayload, TypedTagState};
pub use types::{EventId, ReservationCode, SortableUniqueId, Timestamp};

/// Everything a command handler or projector usually needs.
pub mod prelude {
    pub use crate::{
        Command, CommandContext, CommandError, CommandExecutor, CommandHandler, CommandResult,
        Event, EventPayload, EventPayloadWithTags, FoldError, FoldResult, MultiProjectionQuery,
        MultiProjector, SortableUniqueId, Tag, TagKey, TagProjector, ValidationErrors,
    };
    pub use async_trait::async_trait;
}
