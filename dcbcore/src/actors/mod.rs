//! The three actor kinds of the consistency core.
//!
//! - [`tag_reservation`]: one per tag, grants write reservations
//! - [`tag_state`]: one per tag and tag projector, folds the tag's events
//! - [`multi_projection`]: one per multi projector, folds every event into
//!   dual safe/unsafe states

pub mod multi_projection;
pub mod tag_reservation;
pub mod tag_state;

pub use multi_projection::{EventSource, MultiProjectionActor, MultiProjectionState};
pub use tag_reservation::{TagConsistency, TagReservationActor, TagWriteReservation};
pub use tag_state::{InMemoryTagStateCache, TagStateAccess, TagStateActor, TagStateCache};
