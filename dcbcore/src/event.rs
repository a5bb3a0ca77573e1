//! Events and the drafts commands produce before they are written.
//!
//! Payloads are carried as JSON values next to their type name, so stored
//! events can be inspected without knowing every domain type. Typed access
//! goes through [`Event::payload_as`].

use crate::metadata::EventMetadata;
use crate::tag::{Tag, TagKey};
use crate::types::{EventId, SortableUniqueId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A domain event payload.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The registered type name of this payload.
    fn event_type(&self) -> &'static str;
}

/// An immutable, written event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique id.
    pub id: EventId,
    /// Position in the global order.
    pub sortable_unique_id: SortableUniqueId,
    /// Registered payload type name.
    pub event_type: String,
    /// Serialized payload.
    pub payload: serde_json::Value,
    /// Write-time metadata.
    pub metadata: EventMetadata,
    /// Tags in `group:content` form.
    pub tags: Vec<String>,
}

impl Event {
    /// Materializes a draft with its assigned identity.
    pub fn from_draft(
        draft: &EventPayloadWithTags,
        id: EventId,
        sortable_unique_id: SortableUniqueId,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            id,
            sortable_unique_id,
            event_type: draft.event_type.clone(),
            payload: draft.payload.clone(),
            metadata,
            tags: draft.tags.iter().map(Tag::tag_id).collect(),
        }
    }

    /// Deserializes the payload into `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Whether the event carries the given tag.
    pub fn has_tag(&self, tag: &TagKey) -> bool {
        let wanted = tag.tag_id();
        self.tags.iter().any(|t| *t == wanted)
    }

    /// The event's tags parsed back into keys.
    pub fn tag_keys(&self) -> Vec<TagKey> {
        self.tags.iter().map(|t| TagKey::parse(t)).collect()
    }
}

/// An event a command wants written, with the tags it should be written
/// under.
///
/// Each draft has a private identity; clones share it, so the executor can
/// recognise the same draft whether it was appended to the context, returned
/// from the handler, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayloadWithTags {
    draft_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    tags: Vec<Tag>,
}

impl EventPayloadWithTags {
    /// Serializes a typed payload into a draft.
    pub fn new<P: EventPayload>(payload: &P, tags: Vec<Tag>) -> Result<Self, serde_json::Error> {
        Ok(Self::from_parts(
            payload.event_type(),
            serde_json::to_value(payload)?,
            tags,
        ))
    }

    /// Builds a draft from an already serialized payload.
    pub fn from_parts(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        tags: Vec<Tag>,
    ) -> Self {
        Self {
            draft_id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            tags,
        }
    }

    /// The payload type name.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The serialized payload.
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// The tags the event will be written under.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Whether `other` is this draft or a clone of it.
    pub fn is_same_draft(&self, other: &Self) -> bool {
        self.draft_id == other.draft_id
    }
}
