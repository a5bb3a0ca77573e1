//! Multi-stream projections.
//!
//! A [`MultiProjector`] folds the whole event sequence into one state. The
//! multi-projection actor never holds that state directly: it holds a
//! [`DualStateAccessor`], which keeps a *safe* state (only events older than
//! the safe window threshold) and an *unsafe* state (everything received).
//! Projectors get the accessor for free through [`DualStateProjection`];
//! a projector with a smarter representation can override
//! [`MultiProjector::dual_state`].
//!
//! # Example
//!
//! ```ignore
//! struct EnrollmentCounts;
//!
//! impl MultiProjector for EnrollmentCounts {
//!     type State = HashMap<String, u32>;
//!     const NAME: &'static str = "EnrollmentCounts";
//!     const VERSION: &'static str = "1";
//!
//!     fn initial_state() -> Self::State { HashMap::new() }
//!
//!     fn project(state: &mut Self::State, event: &Event, _: &SortableUniqueId) -> FoldResult<()> {
//!         if event.event_type == "StudentEnrolled" {
//!             let enrolled: StudentEnrolled = event.payload_as()?;
//!             *state.entry(enrolled.course_id).or_default() += 1;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

mod dual_state;
pub mod snapshot;

pub use dual_state::DualStateProjection;
pub use snapshot::{SerializableMultiProjectionState, SnapshotEnvelope, SnapshotPersistenceData};

use crate::errors::{CommandResult, FoldResult};
use crate::event::Event;
use crate::types::{EventId, SortableUniqueId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Folds the full event sequence into one state.
pub trait MultiProjector: Send + Sync + 'static {
    /// The folded state.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Registered projector name; one actor exists per name.
    const NAME: &'static str;
    /// Projector version; snapshots from another version are refused.
    const VERSION: &'static str;

    /// The state before any event.
    fn initial_state() -> Self::State;

    /// Applies one event. `threshold` is the current safe window threshold,
    /// for projectors that want to treat recent events differently.
    fn project(
        state: &mut Self::State,
        event: &Event,
        threshold: &SortableUniqueId,
    ) -> FoldResult<()>;

    /// Wraps `state` at `position` in a dual-state accessor. Both the safe
    /// and unsafe sides start from `state`.
    fn dual_state(
        state: Self::State,
        position: ProjectionPosition,
    ) -> Box<dyn DualStateAccessor<Self::State>>
    where
        Self: Sized,
    {
        Box::new(DualStateProjection::<Self>::new(state, position))
    }
}

/// How far a projection has folded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionPosition {
    /// Number of events folded.
    pub version: u64,
    /// Id of the last folded event.
    pub last_event_id: Option<EventId>,
    /// Highest sortable id folded.
    pub last_sortable_unique_id: Option<SortableUniqueId>,
}

impl ProjectionPosition {
    /// Records that `event` was folded. The sortable id only moves forward.
    pub fn advance(&mut self, event: &Event) {
        self.version += 1;
        self.last_event_id = Some(event.id);
        if self
            .last_sortable_unique_id
            .as_ref()
            .is_none_or(|last| event.sortable_unique_id > *last)
        {
            self.last_sortable_unique_id = Some(event.sortable_unique_id.clone());
        }
    }
}

/// Safe and unsafe views over one projection.
///
/// The safe side is always a prefix, in sortable id order, of the unsafe
/// side.
pub trait DualStateAccessor<S>: Send + Sync {
    /// Folds an event into the unsafe side, and into the safe side too when
    /// its sortable id is at or below `threshold`. Later events are buffered
    /// until promoted. Events already folded are ignored.
    fn process_event(&mut self, event: &Event, threshold: &SortableUniqueId) -> FoldResult<()>;

    /// Folds every buffered event at or below `threshold` into the safe
    /// side, in sortable id order. Returns how many were promoted.
    fn promote_buffered_events(&mut self, threshold: &SortableUniqueId) -> FoldResult<usize>;

    /// The safe state.
    fn safe_payload(&self) -> &S;

    /// The unsafe state.
    fn unsafe_payload(&self) -> &S;

    /// Position of the safe state.
    fn safe_position(&self) -> &ProjectionPosition;

    /// Position of the unsafe state.
    fn unsafe_position(&self) -> &ProjectionPosition;

    /// Events waiting for promotion.
    fn buffered_count(&self) -> usize;
}

/// A read against a multi-projection state.
pub trait MultiProjectionQuery: Send + Sync {
    /// The projector whose state is read.
    type Projector: MultiProjector;
    /// What the query returns.
    type Output;

    /// Runs the query.
    fn execute(
        &self,
        state: &<Self::Projector as MultiProjector>::State,
    ) -> CommandResult<Self::Output>;

    /// Whether the query may read the unsafe state.
    fn can_use_unsafe_state(&self) -> bool {
        true
    }
}
