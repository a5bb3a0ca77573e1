use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use dcbcore::errors::{EventStoreError, EventStoreResult};
use dcbcore::store::{EventStore, TagLatest, TagWriteResult};
use dcbcore::{Event, EventId, SortableUniqueId, TagKey, Timestamp};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Default)]
struct Log {
    // Events keyed by global position
    events: BTreeMap<SortableUniqueId, Event>,
    // Positions of each tag, keyed by `group:content`
    tags: HashMap<String, BTreeSet<SortableUniqueId>>,
    ids: HashSet<EventId>,
}

impl Log {
    fn check(&self, batch: &[Event]) -> EventStoreResult<()> {
        let mut ids = HashSet::new();
        let mut positions = HashSet::new();
        for event in batch {
            if self.ids.contains(&event.id) || !ids.insert(event.id) {
                return Err(EventStoreError::WriteRejected(format!(
                    "duplicate event id {}",
                    event.id
                )));
            }
            if self.events.contains_key(&event.sortable_unique_id)
                || !positions.insert(&event.sortable_unique_id)
            {
                return Err(EventStoreError::WriteRejected(format!(
                    "duplicate sortable id {}",
                    event.sortable_unique_id
                )));
            }
        }
        Ok(())
    }

    fn after(
        &self,
        since: Option<&SortableUniqueId>,
    ) -> impl Iterator<Item = (&SortableUniqueId, &Event)> {
        let lower = since.map_or(Bound::Unbounded, |s| Bound::Excluded(s.clone()));
        self.events.range((lower, Bound::Unbounded))
    }
}

/// Thread-safe in-memory event store.
///
/// Events are kept in sortable id order regardless of write order. A batch
/// is checked in full before anything is inserted, so it is written
/// completely or not at all. Clones share the same log.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    /// Whether no event has been written.
    pub fn is_empty(&self) -> bool {
        self.log.read().events.is_empty()
    }

    /// A copy of every stored event in sortable id order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.log.read().events.values().cloned().collect()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("events", &self.len())
            .finish()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn write_events(
        &self,
        events: Vec<Event>,
    ) -> EventStoreResult<(Vec<Event>, Vec<TagWriteResult>)> {
        let mut log = self.log.write();
        log.check(&events)?;

        let mut touched = BTreeSet::new();
        for event in &events {
            for tag in &event.tags {
                log.tags
                    .entry(tag.clone())
                    .or_default()
                    .insert(event.sortable_unique_id.clone());
                touched.insert(tag.clone());
            }
            log.ids.insert(event.id);
            log.events
                .insert(event.sortable_unique_id.clone(), event.clone());
        }

        let written_at = Timestamp::now();
        let results = touched
            .into_iter()
            .map(|tag| {
                let version = log.tags.get(&tag).map_or(0, BTreeSet::len) as u64;
                TagWriteResult {
                    tag,
                    version,
                    written_at,
                }
            })
            .collect();

        debug!(count = events.len(), total = log.events.len(), "events written");
        Ok((events, results))
    }

    async fn read_events_by_tag(
        &self,
        tag: &TagKey,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>> {
        let log = self.log.read();
        let Some(positions) = log.tags.get(&tag.tag_id()) else {
            return Ok(Vec::new());
        };
        let lower = since.map_or(Bound::Unbounded, |s| Bound::Excluded(s.clone()));
        Ok(positions
            .range((lower, Bound::Unbounded))
            .filter_map(|position| log.events.get(position).cloned())
            .collect())
    }

    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>> {
        let log = self.log.read();
        Ok(log.after(since).map(|(_, event)| event.clone()).collect())
    }

    async fn latest_tag(&self, tag: &TagKey) -> EventStoreResult<Option<TagLatest>> {
        let log = self.log.read();
        Ok(log.tags.get(&tag.tag_id()).and_then(|positions| {
            positions.last().map(|last| TagLatest {
                tag: tag.clone(),
                last_sortable_unique_id: last.clone(),
                version: positions.len() as u64,
            })
        }))
    }
}
