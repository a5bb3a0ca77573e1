//! Publishers that misbehave on purpose.

use async_trait::async_trait;
use dcbcore::{Event, EventPublisher, PublishError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fails every publish and counts the attempts.
#[derive(Debug, Default)]
pub struct FailingEventPublisher {
    attempts: AtomicUsize,
}

impl FailingEventPublisher {
    /// Creates the publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of publish calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for FailingEventPublisher {
    async fn publish(&self, events: &[Event]) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PublishError(format!(
            "chaos: dropped batch of {} events",
            events.len()
        )))
    }
}
