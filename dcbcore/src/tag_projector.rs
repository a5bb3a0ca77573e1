//! Tag projectors and the state they fold.
//!
//! A [`TagProjector`] folds the events of one tag into a typed state. The
//! tag state actor works with projectors by name through a
//! [`TagProjectorRegistry`], which erases the state type: folded states are
//! carried as [`TagStatePayload`] (JSON or the empty sentinel) and turned
//! back into typed values with [`TagState::payload_as`] or
//! [`TypedTagState`].

use crate::errors::{FoldError, FoldResult};
use crate::event::Event;
use crate::tag::{TagKey, TagStateId};
use crate::types::SortableUniqueId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Folds the events of a single tag.
pub trait TagProjector: Send + Sync + 'static {
    /// The folded state.
    type State: Serialize + DeserializeOwned + Send + Sync;

    /// Registered projector name.
    const NAME: &'static str;
    /// Projector version; a change invalidates cached states.
    const VERSION: &'static str;

    /// Applies one event. `None` is the empty state before any relevant
    /// event; returning `None` keeps the tag empty.
    fn project(state: Option<Self::State>, event: &Event) -> FoldResult<Option<Self::State>>;
}

/// A folded tag state payload with its type erased.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum TagStatePayload {
    /// Nothing folded yet.
    #[default]
    Empty,
    /// A folded state.
    Value(serde_json::Value),
}

impl TagStatePayload {
    /// Whether this is the empty sentinel.
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// The folded state of one tag under one projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagState {
    /// Folded payload.
    pub payload: TagStatePayload,
    /// Number of events folded.
    pub version: u64,
    /// Sortable id of the last folded event.
    pub last_sorted_unique_id: Option<SortableUniqueId>,
    /// Tag group.
    pub tag_group: String,
    /// Tag content.
    pub tag_content: String,
    /// Projector name.
    pub projector: String,
    /// Projector version that produced the payload.
    pub projector_version: String,
}

impl TagState {
    /// The empty state of `id` under the given projector version.
    pub fn empty(id: &TagStateId, projector_version: impl Into<String>) -> Self {
        Self {
            payload: TagStatePayload::Empty,
            version: 0,
            last_sorted_unique_id: None,
            tag_group: id.tag().group().to_string(),
            tag_content: id.tag().content().to_string(),
            projector: id.projector().to_string(),
            projector_version: projector_version.into(),
        }
    }

    /// The identity this state belongs to.
    pub fn tag_state_id(&self) -> TagStateId {
        TagStateId::new(
            TagKey::new(self.tag_group.clone(), self.tag_content.clone()),
            self.projector.clone(),
        )
    }

    /// Deserializes the payload; `None` for the empty sentinel.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            TagStatePayload::Empty => Ok(None),
            TagStatePayload::Value(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }
}

/// A tag state with its payload deserialized.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedTagState<S> {
    /// The tag.
    pub tag: TagKey,
    /// Folded payload, `None` while empty.
    pub payload: Option<S>,
    /// Number of events folded.
    pub version: u64,
    /// Sortable id of the last folded event.
    pub last_sorted_unique_id: Option<SortableUniqueId>,
}

impl<S: DeserializeOwned> TypedTagState<S> {
    /// Deserializes an erased state.
    pub fn from_state(state: &TagState) -> Result<Self, serde_json::Error> {
        Ok(Self {
            tag: TagKey::new(state.tag_group.clone(), state.tag_content.clone()),
            payload: state.payload_as()?,
            version: state.version,
            last_sorted_unique_id: state.last_sorted_unique_id.clone(),
        })
    }
}

/// A tag projector with its state type erased.
pub trait DynTagProjector: Send + Sync {
    /// Registered name.
    fn name(&self) -> &'static str;

    /// Registered version.
    fn version(&self) -> &'static str;

    /// Folds `events` in order onto `payload`.
    fn fold(&self, payload: TagStatePayload, events: &[Event]) -> FoldResult<TagStatePayload>;
}

struct Registered<P>(PhantomData<fn() -> P>);

impl<P: TagProjector> DynTagProjector for Registered<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn version(&self) -> &'static str {
        P::VERSION
    }

    fn fold(&self, payload: TagStatePayload, events: &[Event]) -> FoldResult<TagStatePayload> {
        if events.is_empty() {
            return Ok(payload);
        }
        let mut state: Option<P::State> = match payload {
            TagStatePayload::Empty => None,
            TagStatePayload::Value(value) => Some(serde_json::from_value(value)?),
        };
        for event in events {
            state = P::project(state, event).map_err(|err| {
                FoldError::new(format!(
                    "event {} ({}) in projector {}: {err}",
                    event.id,
                    event.event_type,
                    P::NAME
                ))
            })?;
        }
        Ok(match state {
            Some(state) => TagStatePayload::Value(serde_json::to_value(state)?),
            None => TagStatePayload::Empty,
        })
    }
}

/// Tag projectors by name.
#[derive(Clone, Default)]
pub struct TagProjectorRegistry {
    projectors: HashMap<&'static str, Arc<dyn DynTagProjector>>,
}

impl TagProjectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `P` under its name, replacing any earlier registration.
    #[must_use]
    pub fn with<P: TagProjector>(mut self) -> Self {
        self.register::<P>();
        self
    }

    /// Registers `P` under its name, replacing any earlier registration.
    pub fn register<P: TagProjector>(&mut self) {
        self.projectors
            .insert(P::NAME, Arc::new(Registered::<P>(PhantomData)));
    }

    /// The projector registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DynTagProjector>> {
        self.projectors.get(name).cloned()
    }

    /// Registered names.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.projectors.keys().copied()
    }
}

impl std::fmt::Debug for TagProjectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagProjectorRegistry")
            .field("projectors", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
