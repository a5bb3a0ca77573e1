//! What a command handler sees while it decides.

use crate::accessor::ActorAccessor;
use crate::errors::{CommandError, CommandResult, TagReservationFailure};
use crate::event::EventPayloadWithTags;
use crate::tag::{validate_tags, TagKey, TagStateId};
use crate::tag_projector::{TagProjector, TagState, TypedTagState};
use crate::types::SortableUniqueId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Read access to tag states plus a buffer of events to append.
///
/// Every tag state read through the context is remembered. When the
/// executor later reserves a consistency tag without an explicit expected
/// position, the position of the state the handler actually saw is used.
pub struct CommandContext {
    accessor: Arc<dyn ActorAccessor>,
    accessed: Mutex<HashMap<TagKey, TagState>>,
    appended: Mutex<Vec<EventPayloadWithTags>>,
}

impl CommandContext {
    pub(crate) fn new(accessor: Arc<dyn ActorAccessor>) -> Self {
        Self {
            accessor,
            accessed: Mutex::new(HashMap::new()),
            appended: Mutex::new(Vec::new()),
        }
    }

    /// The state of `tag` under projector `P`, deserialized.
    pub async fn tag_state<P: TagProjector>(
        &self,
        tag: &TagKey,
    ) -> CommandResult<TypedTagState<P::State>> {
        let state = self.raw_tag_state(tag, P::NAME).await?;
        Ok(TypedTagState::from_state(&state)?)
    }

    /// The state of `tag` under the projector registered as `projector`.
    pub async fn raw_tag_state(&self, tag: &TagKey, projector: &str) -> CommandResult<TagState> {
        let errors = tag.validate();
        if !errors.is_empty() {
            return Err(CommandError::InvalidTag(errors));
        }

        let id = TagStateId::new(tag.clone(), projector);
        let actor = self.accessor.tag_state_actor(&id).await?;
        let state = actor.state().await?;
        self.accessed.lock().insert(tag.clone(), state.clone());
        Ok(state)
    }

    /// Whether any event has been written with `tag`.
    pub async fn tag_exists(&self, tag: &TagKey) -> CommandResult<bool> {
        Ok(self.tag_latest_sortable_unique_id(tag).await?.is_some())
    }

    /// The position of the newest event carrying `tag`.
    pub async fn tag_latest_sortable_unique_id(
        &self,
        tag: &TagKey,
    ) -> CommandResult<Option<SortableUniqueId>> {
        let actor = self.accessor.tag_consistent_actor(tag).await?;
        actor.latest_sortable_unique_id().await.map_err(|error| {
            CommandError::ReservationFailed(vec![TagReservationFailure {
                tag: tag.tag_id(),
                error,
            }])
        })
    }

    /// Buffers an event for writing once the handler returns.
    pub fn append_event(&self, event: EventPayloadWithTags) -> CommandResult<()> {
        let errors = validate_tags(event.tags());
        if !errors.is_empty() {
            return Err(CommandError::InvalidTag(errors));
        }
        self.appended.lock().push(event);
        Ok(())
    }

    /// Events buffered so far.
    pub fn appended_events(&self) -> Vec<EventPayloadWithTags> {
        self.appended.lock().clone()
    }

    /// Tag states read so far, by tag.
    pub fn accessed_tag_states(&self) -> HashMap<TagKey, TagState> {
        self.accessed.lock().clone()
    }

    pub(crate) fn take_appended_events(&self) -> Vec<EventPayloadWithTags> {
        std::mem::take(&mut *self.appended.lock())
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("accessed", &self.accessed.lock().len())
            .field("appended", &self.appended.lock().len())
            .finish_non_exhaustive()
    }
}
