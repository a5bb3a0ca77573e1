//! The event store contract.
//!
//! The store is the single source of truth. Nothing in the core locks it;
//! writers coordinate through tag reservations layered on top. A store only
//! needs four operations: an atomic batch write, a per-tag read, a global
//! read and a per-tag position lookup.

use crate::errors::EventStoreResult;
use crate::event::Event;
use crate::tag::TagKey;
use crate::types::{SortableUniqueId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a batch write for one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWriteResult {
    /// The tag in `group:content` form.
    pub tag: String,
    /// Number of events stored under the tag after the write.
    pub version: u64,
    /// When the write committed.
    pub written_at: Timestamp,
}

/// The latest known position of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagLatest {
    /// The tag.
    pub tag: TagKey,
    /// Sortable id of the newest event carrying the tag.
    pub last_sortable_unique_id: SortableUniqueId,
    /// Number of events carrying the tag.
    pub version: u64,
}

/// Append-only event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Writes every event of the batch or none of them.
    async fn write_events(
        &self,
        events: Vec<Event>,
    ) -> EventStoreResult<(Vec<Event>, Vec<TagWriteResult>)>;

    /// Events carrying `tag` in sortable id order, optionally only those
    /// strictly after `since`.
    async fn read_events_by_tag(
        &self,
        tag: &TagKey,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>>;

    /// All events in sortable id order, optionally only those strictly after
    /// `since`.
    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>>;

    /// The newest position of `tag`, or `None` if no event carries it.
    async fn latest_tag(&self, tag: &TagKey) -> EventStoreResult<Option<TagLatest>>;
}
