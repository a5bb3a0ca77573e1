//! Per-tag folded state with a write-through cache.

use crate::accessor::ActorAccessor;
use crate::errors::{TagStateError, TagStateResult};
use crate::event::Event;
use crate::store::EventStore;
use crate::tag::TagStateId;
use crate::tag_projector::{DynTagProjector, TagProjectorRegistry, TagState};
use crate::types::SortableUniqueId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, instrument, warn};

/// The state capability of a tag actor.
#[async_trait]
pub trait TagStateAccess: Send + Sync {
    /// The actor's identity.
    fn tag_state_id(&self) -> &TagStateId;

    /// The tag's state folded up to the tag's latest known position.
    async fn state(&self) -> TagStateResult<TagState>;

    /// Overwrites the cached state. The state must belong to this actor.
    async fn update_state(&self, state: TagState) -> TagStateResult<()>;

    /// Drops the cached state.
    async fn clear_cache(&self);
}

/// Where tag state actors keep their last computed state.
pub trait TagStateCache: Send + Sync {
    /// The cached state of `id`.
    fn load(&self, id: &TagStateId) -> Option<TagState>;

    /// Caches `state` under its own identity.
    fn save(&self, state: TagState);

    /// Forgets the state of `id`.
    fn clear(&self, id: &TagStateId);
}

/// A process-local [`TagStateCache`].
#[derive(Debug, Default)]
pub struct InMemoryTagStateCache {
    states: RwLock<HashMap<TagStateId, TagState>>,
}

impl InMemoryTagStateCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagStateCache for InMemoryTagStateCache {
    fn load(&self, id: &TagStateId) -> Option<TagState> {
        self.states.read().get(id).cloned()
    }

    fn save(&self, state: TagState) {
        self.states.write().insert(state.tag_state_id(), state);
    }

    fn clear(&self, id: &TagStateId) {
        self.states.write().remove(id);
    }
}

/// Computes the state of one tag under one projector.
///
/// The tag's reservation actor decides how far to fold: a cached state at
/// exactly that position is returned as is, a cached state behind it is
/// advanced with only the missing events, anything else is rebuilt from the
/// first event.
pub struct TagStateActor {
    id: TagStateId,
    accessor: Weak<dyn ActorAccessor>,
    store: Arc<dyn EventStore>,
    projectors: Arc<TagProjectorRegistry>,
    cache: Arc<dyn TagStateCache>,
}

impl TagStateActor {
    /// Creates the actor.
    pub fn new(
        id: TagStateId,
        accessor: Weak<dyn ActorAccessor>,
        store: Arc<dyn EventStore>,
        projectors: Arc<TagProjectorRegistry>,
        cache: Arc<dyn TagStateCache>,
    ) -> Self {
        Self {
            id,
            accessor,
            store,
            projectors,
            cache,
        }
    }

    async fn latest_position(&self) -> Option<SortableUniqueId> {
        let Some(accessor) = self.accessor.upgrade() else {
            warn!(tag_state = %self.id, "actor accessor dropped, reading without a position");
            return None;
        };
        let actor = match accessor.tag_consistent_actor(self.id.tag()).await {
            Ok(actor) => actor,
            Err(err) => {
                warn!(tag_state = %self.id, error = %err, "reservation actor unavailable");
                return None;
            }
        };
        match actor.latest_sortable_unique_id().await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(tag_state = %self.id, error = %err, "latest position unavailable");
                None
            }
        }
    }

    fn computation_error(&self, reason: &impl std::fmt::Display) -> TagStateError {
        TagStateError::StateComputation {
            tag_state_id: self.id.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn compute(
        &self,
        projector: &dyn DynTagProjector,
        latest: Option<&SortableUniqueId>,
        cached: Option<TagState>,
    ) -> TagStateResult<TagState> {
        let mut state = TagState::empty(&self.id, projector.version());
        let Some(latest) = latest else {
            return Ok(state);
        };

        let incremental = cached.filter(|c| {
            c.projector_version == projector.version()
                && c.last_sorted_unique_id.as_ref().is_some_and(|last| latest > last)
        });
        let since = match incremental {
            Some(cached) => {
                debug!(tag_state = %self.id, from = cached.version, "incremental fold");
                let since = cached.last_sorted_unique_id.clone();
                state = cached;
                since
            }
            None => {
                debug!(tag_state = %self.id, "full rebuild");
                None
            }
        };

        let events: Vec<Event> = self
            .store
            .read_events_by_tag(self.id.tag(), since.as_ref())
            .await
            .map_err(|err| self.computation_error(&err))?
            .into_iter()
            .filter(|e| e.sortable_unique_id <= *latest)
            .collect();

        let payload = std::mem::take(&mut state.payload);
        state.payload = projector
            .fold(payload, &events)
            .map_err(|err| self.computation_error(&err))?;
        state.version += events.len() as u64;
        if let Some(last) = events.last() {
            state.last_sorted_unique_id = Some(last.sortable_unique_id.clone());
        }
        Ok(state)
    }
}

#[async_trait]
impl TagStateAccess for TagStateActor {
    fn tag_state_id(&self) -> &TagStateId {
        &self.id
    }

    #[instrument(skip(self), fields(tag_state = %self.id))]
    async fn state(&self) -> TagStateResult<TagState> {
        let projector = self
            .projectors
            .get(self.id.projector())
            .ok_or_else(|| TagStateError::ProjectorNotRegistered(self.id.projector().to_string()))?;

        let latest = self.latest_position().await;
        let cached = self.cache.load(&self.id);
        if let Some(cached) = cached.as_ref().filter(|c| c.last_sorted_unique_id == latest) {
            return Ok(cached.clone());
        }

        let state = self.compute(projector.as_ref(), latest.as_ref(), cached).await?;
        self.cache.save(state.clone());
        Ok(state)
    }

    async fn update_state(&self, state: TagState) -> TagStateResult<()> {
        let actual = state.tag_state_id();
        if actual != self.id {
            return Err(TagStateError::IdentityMismatch {
                expected: self.id.to_string(),
                actual: actual.to_string(),
            });
        }
        self.cache.save(state);
        Ok(())
    }

    async fn clear_cache(&self) {
        self.cache.clear(&self.id);
    }
}

impl std::fmt::Debug for TagStateActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagStateActor")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
