//! Optional delivery of committed events to the outside world.

use crate::event::Event;
use async_trait::async_trait;

/// Receives committed events at least once.
///
/// The executor calls this from a detached task: an implementation may take
/// its time, and a failure is logged but never reaches the command caller.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes a committed batch.
    async fn publish(&self, events: &[Event]) -> Result<(), PublishError>;
}

/// A publish attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);
