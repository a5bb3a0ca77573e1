use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dcbcore::accessor::{ActorAccessor, MULTI_PROJECTION};
use dcbcore::errors::{ActorAccessError, ActorResult, ProjectionResult};
use dcbcore::store::EventStore;
use dcbcore::{
    Event, EventPublisher, EventSource, InMemoryTagStateCache, MultiProjectionActor,
    MultiProjectionActorOptions, MultiProjector, PublishError, TagConsistency,
    TagConsistentActorOptions, TagKey, TagProjector, TagProjectorRegistry, TagReservationActor,
    TagStateAccess, TagStateActor, TagStateCache, TagStateId,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Type-erased handle used to push events into a multi-projection.
#[async_trait]
trait ProjectionFeed: Send + Sync {
    fn feed(&self, events: Vec<Event>) -> ProjectionResult<()>;

    async fn catch_up(&self, store: &dyn EventStore) -> ProjectionResult<usize>;
}

#[async_trait]
impl<P: MultiProjector> ProjectionFeed for MultiProjectionActor<P> {
    fn feed(&self, events: Vec<Event>) -> ProjectionResult<()> {
        self.add_events(events, true, EventSource::Stream)
    }

    async fn catch_up(&self, store: &dyn EventStore) -> ProjectionResult<usize> {
        self.catch_up_from_store(store).await
    }
}

#[derive(Clone)]
struct RegisteredProjection {
    actor: Arc<dyn Any + Send + Sync>,
    feed: Arc<dyn ProjectionFeed>,
}

/// Builder for [`InMemoryActorAccessor`].
pub struct InMemoryActorAccessorBuilder {
    store: Arc<dyn EventStore>,
    projectors: TagProjectorRegistry,
    cache: Option<Arc<dyn TagStateCache>>,
    tag_options: TagConsistentActorOptions,
    projection_options: MultiProjectionActorOptions,
}

impl InMemoryActorAccessorBuilder {
    /// Registers tag projector `P`.
    #[must_use]
    pub fn with_tag_projector<P: TagProjector>(mut self) -> Self {
        self.projectors.register::<P>();
        self
    }

    /// Replaces the default process-local tag state cache.
    #[must_use]
    pub fn with_tag_state_cache(mut self, cache: Arc<dyn TagStateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Options for every tag reservation actor.
    #[must_use]
    pub const fn with_tag_options(mut self, options: TagConsistentActorOptions) -> Self {
        self.tag_options = options;
        self
    }

    /// Options for every multi-projection actor.
    #[must_use]
    pub const fn with_projection_options(mut self, options: MultiProjectionActorOptions) -> Self {
        self.projection_options = options;
        self
    }

    /// Builds the accessor.
    pub fn build(self) -> Arc<InMemoryActorAccessor> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryTagStateCache::new()));
        Arc::new_cyclic(|me| InMemoryActorAccessor {
            me: me.clone(),
            store: self.store,
            projectors: Arc::new(self.projectors),
            cache,
            tag_options: self.tag_options,
            projection_options: self.projection_options,
            reservations: Mutex::new(HashMap::new()),
            tag_states: Mutex::new(HashMap::new()),
            projections: RwLock::new(HashMap::new()),
        })
    }
}

/// Hosts every actor in the current process.
///
/// Tag actors are created on first request and live as long as the
/// accessor. Multi-projection actors must be registered up front with
/// [`register_multi_projector`](Self::register_multi_projector).
///
/// The accessor is also an [`EventPublisher`]: handing it to the executor
/// streams every written batch into the registered multi-projections.
pub struct InMemoryActorAccessor {
    me: Weak<Self>,
    store: Arc<dyn EventStore>,
    projectors: Arc<TagProjectorRegistry>,
    cache: Arc<dyn TagStateCache>,
    tag_options: TagConsistentActorOptions,
    projection_options: MultiProjectionActorOptions,
    reservations: Mutex<HashMap<TagKey, Arc<TagReservationActor>>>,
    tag_states: Mutex<HashMap<TagStateId, Arc<TagStateActor>>>,
    projections: RwLock<HashMap<String, RegisteredProjection>>,
}

impl InMemoryActorAccessor {
    /// Starts building an accessor over `store`.
    pub fn builder(store: Arc<dyn EventStore>) -> InMemoryActorAccessorBuilder {
        InMemoryActorAccessorBuilder {
            store,
            projectors: TagProjectorRegistry::new(),
            cache: None,
            tag_options: TagConsistentActorOptions::default(),
            projection_options: MultiProjectionActorOptions::default(),
        }
    }

    /// The registered tag projectors.
    pub fn tag_projectors(&self) -> &TagProjectorRegistry {
        &self.projectors
    }

    /// The reservation actor of `tag`, created on first use.
    pub fn reservation_actor(&self, tag: &TagKey) -> Arc<TagReservationActor> {
        let mut reservations = self.reservations.lock();
        let actor = reservations.entry(tag.clone()).or_insert_with(|| {
            debug!(tag = %tag, "creating reservation actor");
            Arc::new(TagReservationActor::new(
                tag.clone(),
                Arc::clone(&self.store),
                self.tag_options,
            ))
        });
        Arc::clone(actor)
    }

    /// Creates the multi-projection actor of `P`, or returns the existing
    /// one.
    pub fn register_multi_projector<P: MultiProjector>(
        &self,
    ) -> ActorResult<Arc<MultiProjectionActor<P>>> {
        let mut projections = self.projections.write();
        let registered = projections.entry(P::NAME.to_string()).or_insert_with(|| {
            info!(projector = P::NAME, "registering multi-projection");
            let actor = Arc::new(MultiProjectionActor::<P>::new(self.projection_options));
            RegisteredProjection {
                actor: actor.clone(),
                feed: actor,
            }
        });
        Arc::clone(&registered.actor)
            .downcast::<MultiProjectionActor<P>>()
            .map_err(|_| ActorAccessError::TypeMismatch {
                capability: MULTI_PROJECTION,
                id: P::NAME.to_string(),
            })
    }

    /// Brings every registered multi-projection up to date with the store.
    /// Returns the number of events folded.
    pub async fn catch_up_multi_projections(&self) -> ProjectionResult<usize> {
        let feeds: Vec<Arc<dyn ProjectionFeed>> = self
            .projections
            .read()
            .values()
            .map(|registered| Arc::clone(&registered.feed))
            .collect();

        let mut folded = 0;
        for feed in feeds {
            folded += feed.catch_up(self.store.as_ref()).await?;
        }
        Ok(folded)
    }
}

impl std::fmt::Debug for InMemoryActorAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryActorAccessor")
            .field("projectors", &self.projectors)
            .field("reservation_actors", &self.reservations.lock().len())
            .field("tag_state_actors", &self.tag_states.lock().len())
            .field("multi_projections", &self.projections.read().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ActorAccessor for InMemoryActorAccessor {
    async fn tag_consistent_actor(&self, tag: &TagKey) -> ActorResult<Arc<dyn TagConsistency>> {
        Ok(self.reservation_actor(tag))
    }

    async fn tag_state_actor(&self, id: &TagStateId) -> ActorResult<Arc<dyn TagStateAccess>> {
        let me: Weak<dyn ActorAccessor> = self.me.clone();
        let mut tag_states = self.tag_states.lock();
        let actor = tag_states.entry(id.clone()).or_insert_with(|| {
            debug!(tag_state = %id, "creating tag state actor");
            Arc::new(TagStateActor::new(
                id.clone(),
                me,
                Arc::clone(&self.store),
                Arc::clone(&self.projectors),
                Arc::clone(&self.cache),
            ))
        });
        let actor: Arc<TagStateActor> = Arc::clone(actor);
        Ok(actor)
    }

    async fn multi_projection_actor(
        &self,
        projector: &str,
    ) -> ActorResult<Arc<dyn Any + Send + Sync>> {
        self.projections
            .read()
            .get(projector)
            .map(|registered| Arc::clone(&registered.actor))
            .ok_or_else(|| ActorAccessError::NotRegistered {
                capability: MULTI_PROJECTION,
                id: projector.to_string(),
            })
    }
}

#[async_trait]
impl EventPublisher for InMemoryActorAccessor {
    async fn publish(&self, events: &[Event]) -> Result<(), PublishError> {
        let projections: Vec<(String, Arc<dyn ProjectionFeed>)> = self
            .projections
            .read()
            .iter()
            .map(|(name, registered)| (name.clone(), Arc::clone(&registered.feed)))
            .collect();

        let mut failures = Vec::new();
        for (name, feed) in projections {
            if let Err(err) = feed.feed(events.to_vec()) {
                warn!(projector = %name, error = %err, "multi-projection rejected events");
                failures.push(format!("{name}: {err}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError(failures.join("; ")))
        }
    }
}
