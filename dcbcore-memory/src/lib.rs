//! In-memory adapters for `dcbcore`.
//!
//! This crate provides process-local implementations of the three seams of
//! the consistency core, useful for tests, examples and single-process
//! deployments where persistence is not required:
//!
//! - [`InMemoryEventStore`]: a sorted event log with a tag index
//! - [`InMemoryActorAccessor`]: creates one actor per id on first use and
//!   feeds published events to registered multi-projections
//! - [`InMemoryEventPublisher`]: records every published batch

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod accessor;
mod publisher;
mod store;

pub use accessor::{InMemoryActorAccessor, InMemoryActorAccessorBuilder};
pub use publisher::InMemoryEventPublisher;
pub use store::InMemoryEventStore;
