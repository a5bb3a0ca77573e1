//! Fixtures shared by unit tests: a vector-backed store, an accessor that
//! creates actors on demand, and a small enrollment domain.

use crate::accessor::{ActorAccessor, MULTI_PROJECTION};
use crate::actors::multi_projection::MultiProjectionActor;
use crate::actors::tag_reservation::{TagConsistency, TagReservationActor};
use crate::actors::tag_state::{InMemoryTagStateCache, TagStateAccess, TagStateActor};
use crate::config::TagConsistentActorOptions;
use crate::errors::{ActorAccessError, ActorResult, EventStoreError, EventStoreResult, FoldResult};
use crate::event::{Event, EventPayload, EventPayloadWithTags};
use crate::metadata::EventMetadata;
use crate::projection::MultiProjector;
use crate::store::{EventStore, TagLatest, TagWriteResult};
use crate::tag::{Tag, TagKey, TagStateId};
use crate::tag_projector::{TagProjector, TagProjectorRegistry};
use crate::types::{EventId, SortableUniqueId, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrolled {
    pub course: String,
    pub student: String,
}

impl EventPayload for Enrolled {
    fn event_type(&self) -> &'static str {
        "Enrolled"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollments {
    pub students: Vec<String>,
}

pub struct EnrollmentsProjector;

impl TagProjector for EnrollmentsProjector {
    type State = Enrollments;
    const NAME: &'static str = "Enrollments";
    const VERSION: &'static str = "1";

    fn project(state: Option<Enrollments>, event: &Event) -> FoldResult<Option<Enrollments>> {
        let enrolled: Enrolled = event.payload_as()?;
        let mut state = state.unwrap_or_default();
        state.students.push(enrolled.student);
        Ok(Some(state))
    }
}

/// Enrollments per course across all tags.
pub struct CourseRoster;

impl MultiProjector for CourseRoster {
    type State = BTreeMap<String, Vec<String>>;
    const NAME: &'static str = "CourseRoster";
    const VERSION: &'static str = "1";

    fn initial_state() -> Self::State {
        BTreeMap::new()
    }

    fn project(
        state: &mut Self::State,
        event: &Event,
        _threshold: &SortableUniqueId,
    ) -> FoldResult<()> {
        let enrolled: Enrolled = event.payload_as()?;
        state.entry(enrolled.course).or_default().push(enrolled.student);
        Ok(())
    }
}

pub fn enrolled(course: &str, student: &str) -> EventPayloadWithTags {
    EventPayloadWithTags::new(
        &Enrolled {
            course: course.to_string(),
            student: student.to_string(),
        },
        vec![
            Tag::consistency("Course", course),
            Tag::plain("Student", student),
        ],
    )
    .unwrap()
}

pub fn course(id: &str) -> TagKey {
    TagKey::new("Course", id)
}

#[derive(Default)]
pub struct VecStore {
    events: Mutex<Vec<Event>>,
    tag_reads: Mutex<Vec<Option<SortableUniqueId>>>,
    fail_writes: AtomicBool,
}

impl VecStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends drafts directly, bypassing reservations.
    pub fn append(&self, drafts: &[EventPayloadWithTags]) -> Vec<Event> {
        let mut events = self.events.lock();
        let mut previous = events.last().map(|e| e.sortable_unique_id.clone());
        let written: Vec<Event> = drafts
            .iter()
            .map(|draft| {
                let sid = SortableUniqueId::generate_after(previous.as_ref());
                previous = Some(sid.clone());
                Event::from_draft(draft, EventId::new(), sid, EventMetadata::new())
            })
            .collect();
        events.extend(written.iter().cloned());
        written
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// The `since` argument of every per-tag read so far.
    pub fn tag_reads(&self) -> Vec<Option<SortableUniqueId>> {
        self.tag_reads.lock().clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for VecStore {
    async fn write_events(
        &self,
        events: Vec<Event>,
    ) -> EventStoreResult<(Vec<Event>, Vec<TagWriteResult>)> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EventStoreError::WriteRejected("disk full".to_string()));
        }
        let mut stored = self.events.lock();
        stored.extend(events.iter().cloned());
        let mut tags: Vec<&String> = events.iter().flat_map(|e| &e.tags).collect();
        tags.sort();
        tags.dedup();
        let results = tags
            .into_iter()
            .map(|tag| TagWriteResult {
                tag: tag.clone(),
                version: stored.iter().filter(|e| e.tags.contains(tag)).count() as u64,
                written_at: Timestamp::now(),
            })
            .collect();
        Ok((events, results))
    }

    async fn read_events_by_tag(
        &self,
        tag: &TagKey,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>> {
        self.tag_reads.lock().push(since.cloned());
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.has_tag(tag) && since.is_none_or(|s| e.sortable_unique_id > *s))
            .cloned()
            .collect())
    }

    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| since.is_none_or(|s| e.sortable_unique_id > *s))
            .cloned()
            .collect())
    }

    async fn latest_tag(&self, tag: &TagKey) -> EventStoreResult<Option<TagLatest>> {
        let events = self.events.lock();
        let tagged: Vec<&Event> = events.iter().filter(|e| e.has_tag(tag)).collect();
        Ok(tagged.last().map(|last| TagLatest {
            tag: tag.clone(),
            last_sortable_unique_id: last.sortable_unique_id.clone(),
            version: tagged.len() as u64,
        }))
    }
}

pub struct StubAccessor {
    me: Weak<Self>,
    store: Arc<VecStore>,
    projectors: Arc<TagProjectorRegistry>,
    cache: Arc<InMemoryTagStateCache>,
    options: TagConsistentActorOptions,
    consistency: Mutex<HashMap<TagKey, Arc<TagReservationActor>>>,
    states: Mutex<HashMap<TagStateId, Arc<TagStateActor>>>,
    multi: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl StubAccessor {
    pub fn new(store: Arc<VecStore>) -> Arc<Self> {
        Self::with_options(store, TagConsistentActorOptions::default())
    }

    pub fn with_options(store: Arc<VecStore>, options: TagConsistentActorOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            projectors: Arc::new(TagProjectorRegistry::new().with::<EnrollmentsProjector>()),
            cache: Arc::new(InMemoryTagStateCache::new()),
            options,
            consistency: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            multi: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> Arc<InMemoryTagStateCache> {
        Arc::clone(&self.cache)
    }

    pub fn register<P: MultiProjector>(&self, actor: Arc<MultiProjectionActor<P>>) {
        self.multi.lock().insert(P::NAME.to_string(), actor);
    }

    pub fn reservation_actor(&self, tag: &TagKey) -> Arc<TagReservationActor> {
        let store: Arc<dyn EventStore> = self.store.clone();
        Arc::clone(self.consistency.lock().entry(tag.clone()).or_insert_with(|| {
            Arc::new(TagReservationActor::new(tag.clone(), store, self.options))
        }))
    }
}

#[async_trait]
impl ActorAccessor for StubAccessor {
    async fn tag_consistent_actor(&self, tag: &TagKey) -> ActorResult<Arc<dyn TagConsistency>> {
        Ok(self.reservation_actor(tag))
    }

    async fn tag_state_actor(&self, id: &TagStateId) -> ActorResult<Arc<dyn TagStateAccess>> {
        let me: Weak<dyn ActorAccessor> = self.me.clone();
        let store: Arc<dyn EventStore> = self.store.clone();
        let projectors = Arc::clone(&self.projectors);
        let cache = self.cache.clone();
        let actor = Arc::clone(
            self.states
                .lock()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(TagStateActor::new(id.clone(), me, store, projectors, cache))),
        );
        Ok(actor)
    }

    async fn multi_projection_actor(
        &self,
        projector: &str,
    ) -> ActorResult<Arc<dyn Any + Send + Sync>> {
        self.multi
            .lock()
            .get(projector)
            .cloned()
            .ok_or_else(|| ActorAccessError::NotRegistered {
                capability: MULTI_PROJECTION,
                id: projector.to_string(),
            })
    }
}
