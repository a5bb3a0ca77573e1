//! Buffer-then-promote adapter over a plain fold function.

use super::{DualStateAccessor, MultiProjector, ProjectionPosition};
use crate::errors::FoldResult;
use crate::event::Event;
use crate::types::{EventId, SortableUniqueId};
use std::collections::HashSet;
use std::marker::PhantomData;

/// Dual-state wrapper for any [`MultiProjector`].
///
/// Keeps a safe state, the events received after the safe window threshold
/// (sorted by sortable id), and an unsafe state equal to the safe state with
/// the buffered events folded on top. An event that arrives out of order
/// only rebuilds the unsafe side from the safe side and the buffer, so the
/// final state does not depend on delivery order within the window.
///
/// Redelivered events are recognised by id. The id set grows with every
/// event folded over the life of the projection; it is not part of a
/// snapshot. A projection started from a non-empty position instead ignores
/// every event at or below that position.
pub struct DualStateProjection<P: MultiProjector> {
    safe: P::State,
    unsafe_state: P::State,
    safe_position: ProjectionPosition,
    unsafe_position: ProjectionPosition,
    buffered: Vec<Event>,
    seen: HashSet<EventId>,
    folded_through: Option<SortableUniqueId>,
    _projector: PhantomData<fn() -> P>,
}

impl<P: MultiProjector> DualStateProjection<P> {
    /// Starts both sides from `state` at `position`. Events at or below
    /// `position` are treated as already folded.
    pub fn new(state: P::State, position: ProjectionPosition) -> Self {
        Self {
            unsafe_state: state.clone(),
            safe: state,
            folded_through: position.last_sortable_unique_id.clone(),
            unsafe_position: position.clone(),
            safe_position: position,
            buffered: Vec::new(),
            seen: HashSet::new(),
            _projector: PhantomData,
        }
    }

    fn is_already_folded(&self, event: &Event) -> bool {
        self.seen.contains(&event.id)
            || self
                .folded_through
                .as_ref()
                .is_some_and(|through| event.sortable_unique_id <= *through)
    }

    fn is_in_order(&self, event: &Event) -> bool {
        self.unsafe_position
            .last_sortable_unique_id
            .as_ref()
            .is_none_or(|last| event.sortable_unique_id > *last)
    }

    fn rebuild_unsafe(&mut self, threshold: &SortableUniqueId) -> FoldResult<()> {
        let mut state = self.safe.clone();
        let mut position = self.safe_position.clone();
        for event in &self.buffered {
            P::project(&mut state, event, threshold)?;
            position.advance(event);
        }
        self.unsafe_state = state;
        self.unsafe_position = position;
        Ok(())
    }

    fn insert_buffered(&mut self, event: Event) {
        let at = self
            .buffered
            .partition_point(|e| e.sortable_unique_id <= event.sortable_unique_id);
        self.buffered.insert(at, event);
    }
}

impl<P: MultiProjector> DualStateAccessor<P::State> for DualStateProjection<P> {
    fn process_event(&mut self, event: &Event, threshold: &SortableUniqueId) -> FoldResult<()> {
        if self.is_already_folded(event) {
            return Ok(());
        }
        self.promote_buffered_events(threshold)?;

        let is_safe = event.sortable_unique_id <= *threshold;
        if self.is_in_order(event) {
            // The safe side or the buffer takes the event first; the unsafe
            // side is rebuilt from them if its own fold fails.
            if is_safe {
                P::project(&mut self.safe, event, threshold)?;
                self.safe_position.advance(event);
                self.seen.insert(event.id);
            } else {
                self.buffered.push(event.clone());
            }
            if let Err(err) = P::project(&mut self.unsafe_state, event, threshold) {
                if !is_safe {
                    self.buffered.pop();
                }
                self.rebuild_unsafe(threshold)?;
                return Err(err);
            }
            self.unsafe_position.advance(event);
        } else {
            if is_safe {
                P::project(&mut self.safe, event, threshold)?;
                self.safe_position.advance(event);
            } else {
                self.insert_buffered(event.clone());
            }
            self.rebuild_unsafe(threshold)?;
        }
        self.seen.insert(event.id);
        Ok(())
    }

    fn promote_buffered_events(&mut self, threshold: &SortableUniqueId) -> FoldResult<usize> {
        let ready = self
            .buffered
            .partition_point(|e| e.sortable_unique_id <= *threshold);
        for index in 0..ready {
            let event = &self.buffered[index];
            if let Err(err) = P::project(&mut self.safe, event, threshold) {
                self.buffered = self.buffered.split_off(index);
                return Err(err);
            }
            self.safe_position.advance(event);
        }
        self.buffered = self.buffered.split_off(ready);
        Ok(ready)
    }

    fn safe_payload(&self) -> &P::State {
        &self.safe
    }

    fn unsafe_payload(&self) -> &P::State {
        &self.unsafe_state
    }

    fn safe_position(&self) -> &ProjectionPosition {
        &self.safe_position
    }

    fn unsafe_position(&self) -> &ProjectionPosition {
        &self.unsafe_position
    }

    fn buffered_count(&self) -> usize {
        self.buffered.len()
    }
}
