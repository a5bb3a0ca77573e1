use async_trait::async_trait;
use dcbcore::{Event, EventPublisher, PublishError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Records every published batch.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventPublisher {
    batches: Arc<Mutex<Vec<Vec<Event>>>>,
}

impl InMemoryEventPublisher {
    /// Creates a publisher with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// The published batches in publish order.
    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.batches.lock().clone()
    }

    /// Every published event, flattened.
    pub fn events(&self) -> Vec<Event> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, events: &[Event]) -> Result<(), PublishError> {
        self.batches.lock().push(events.to_vec());
        Ok(())
    }
}
