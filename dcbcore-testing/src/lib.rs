//! Testing utilities for `dcbcore`.
//!
//! [`ChaosEventStore`] wraps any [`dcbcore::EventStore`] and injects
//! latency or failures according to policies; [`FailingEventPublisher`]
//! fails every publish. Both exist to check that the executor and the
//! actors degrade the way they promise to.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaos;
pub mod publisher;

pub use chaos::{
    ChaosEventStore, ChaosStats, FailurePolicy, FailureProbability, FailureType, LatencyMs,
    Operation, TargetOperations,
};
pub use publisher::FailingEventPublisher;
