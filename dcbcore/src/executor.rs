//! Command execution across dynamic consistency boundaries.
//!
//! A command does not own a stream. It reads whatever tag states it needs
//! through a [`CommandContext`], then emits events that carry tags. Before
//! anything is written, the executor reserves every consistency tag among
//! those events at its tag actor. Reservations are all-or-nothing: if any
//! tag refuses, the ones already granted are cancelled and nothing is
//! written.
//!
//! The flow of [`CommandExecutor::execute`]:
//!
//! 1. validate the command
//! 2. run the handler, which reads tag states and appends events
//! 3. merge the tags of all appended events and validate them
//! 4. reserve every consistency tag concurrently
//! 5. assign ids and metadata, write through the [`EventStore`]
//! 6. confirm the reservations and notify actors of plain tags
//! 7. hand the written events to the [`EventPublisher`] in the background
//!
//! Handler failures, validation failures and refused reservations all
//! leave the store untouched.
//!
//! # Example
//!
//! ```rust,ignore
//! struct EnrollStudent { student_id: String, course_id: String }
//!
//! impl Command for EnrollStudent {}
//!
//! struct EnrollStudentHandler;
//!
//! #[async_trait]
//! impl CommandHandler<EnrollStudent> for EnrollStudentHandler {
//!     async fn handle(
//!         &self,
//!         command: &EnrollStudent,
//!         context: &CommandContext,
//!     ) -> CommandResult<Option<EventPayloadWithTags>> {
//!         let course = TagKey::new("Course", &command.course_id);
//!         let state = context.tag_state::<CourseProjector>(&course).await?;
//!         if state.payload.is_some_and(|c| c.is_full()) {
//!             return Err(CommandError::BusinessRuleViolation("course is full".into()));
//!         }
//!         Ok(Some(EventPayloadWithTags::new(
//!             &StudentEnrolled { student_id: command.student_id.clone() },
//!             vec![
//!                 Tag::consistency("Student", &command.student_id),
//!                 Tag::Consistency(course),
//!             ],
//!         )?))
//!     }
//! }
//!
//! let result = executor.execute(&command, &EnrollStudentHandler).await?;
//! ```

mod context;

pub use context::CommandContext;

use crate::accessor::{resolve_multi_projection, ActorAccessor};
use crate::actors::multi_projection::MultiProjectionState;
use crate::actors::tag_reservation::{TagConsistency, TagWriteReservation};
use crate::config::ExecutorOptions;
use crate::errors::{
    CommandError, CommandResult, ReservationError, TagReservationFailure, ValidationErrors,
};
use crate::event::{Event, EventPayloadWithTags};
use crate::metadata::{CorrelationId, EventMetadata};
use crate::projection::{MultiProjectionQuery, MultiProjector};
use crate::publisher::EventPublisher;
use crate::store::{EventStore, TagWriteResult};
use crate::tag::{validate_tags, Tag, TagKey, TagStateId};
use crate::tag_projector::{TagProjector, TagState, TypedTagState};
use crate::types::{EventId, SortableUniqueId};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// A request to change the system.
pub trait Command: Send + Sync {
    /// Recorded as `command_type` in the metadata of written events.
    fn command_type(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Checks the command's own fields before any state is read.
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

/// Decides which events a command produces.
///
/// The returned event, if any, is written together with the events the
/// handler appended to the context.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Handles `command`.
    async fn handle(
        &self,
        command: &C,
        context: &CommandContext,
    ) -> CommandResult<Option<EventPayloadWithTags>>;
}

/// Per-call information recorded in event metadata.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Shared by every event of the execution; generated when absent.
    pub correlation_id: Option<CorrelationId>,
    /// The user on whose behalf the command runs.
    pub user_id: Option<String>,
}

impl ExecutionContext {
    /// Sets the correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// The outcome of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Id of the first written event; `None` when nothing was written.
    pub event_id: Option<EventId>,
    /// Number of written events.
    pub event_count: usize,
    /// Per-tag outcome reported by the store.
    pub tag_writes: Vec<TagWriteResult>,
    /// Wall time of the whole execution.
    pub elapsed: Duration,
    /// The written events in write order.
    pub events: Vec<Event>,
    /// Sortable id of the last written event.
    pub sortable_unique_id: Option<SortableUniqueId>,
}

impl ExecutionResult {
    fn nothing_written(elapsed: Duration) -> Self {
        Self {
            event_id: None,
            event_count: 0,
            tag_writes: Vec::new(),
            elapsed,
            events: Vec::new(),
            sortable_unique_id: None,
        }
    }

    /// Whether the execution wrote any event.
    pub fn has_events(&self) -> bool {
        self.event_count > 0
    }
}

struct Granted {
    actor: Arc<dyn TagConsistency>,
    reservation: TagWriteReservation,
}

/// Runs commands and serves reads of tag states and multi-projections.
pub struct CommandExecutor {
    store: Arc<dyn EventStore>,
    accessor: Arc<dyn ActorAccessor>,
    publisher: Option<Arc<dyn EventPublisher>>,
    options: ExecutorOptions,
}

impl CommandExecutor {
    /// Creates an executor without a publisher.
    pub fn new(store: Arc<dyn EventStore>, accessor: Arc<dyn ActorAccessor>) -> Self {
        Self {
            store,
            accessor,
            publisher: None,
            options: ExecutorOptions::default(),
        }
    }

    /// Publishes written events through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// The executor's options.
    pub const fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Executes `command` with a fresh execution context.
    pub async fn execute<C, H>(&self, command: &C, handler: &H) -> CommandResult<ExecutionResult>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.execute_with_context(command, handler, ExecutionContext::default())
            .await
    }

    /// Executes `command`, recording `execution` in event metadata.
    #[instrument(skip_all, fields(command = command.command_type()))]
    pub async fn execute_with_context<C, H>(
        &self,
        command: &C,
        handler: &H,
        execution: ExecutionContext,
    ) -> CommandResult<ExecutionResult>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let started = Instant::now();
        command.validate()?;

        let context = CommandContext::new(Arc::clone(&self.accessor));
        let returned = handler.handle(command, &context).await?;
        let drafts = collect_drafts(context.take_appended_events(), returned);
        if drafts.is_empty() {
            debug!("handler produced no events");
            return Ok(ExecutionResult::nothing_written(started.elapsed()));
        }

        let tags = merge_tags(&drafts);
        let errors = validate_tags(tags.values());
        if !errors.is_empty() {
            return Err(CommandError::InvalidTag(errors));
        }

        let granted = self.reserve(&tags, &context.accessed_tag_states()).await?;

        let metadata = EventMetadata::new()
            .with_correlation_id(execution.correlation_id.unwrap_or_default())
            .with_command_type(command.command_type())
            .with_executed_by(&self.options.executor_name)
            .with_user_id(execution.user_id);
        let events = materialize(&drafts, &metadata);

        let (written, tag_writes) = match self.store.write_events(events).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "event write failed, cancelling reservations");
                cancel_all(&granted).await;
                return Err(CommandError::StoreWrite(err));
            }
        };

        confirm_all(&granted).await;
        self.notify_unreserved(&tags).await;
        self.publish(&written);

        info!(count = written.len(), "command executed");
        Ok(ExecutionResult {
            event_id: written.first().map(|e| e.id),
            event_count: written.len(),
            tag_writes,
            elapsed: started.elapsed(),
            sortable_unique_id: written.last().map(|e| e.sortable_unique_id.clone()),
            events: written,
        })
    }

    async fn reserve(
        &self,
        tags: &BTreeMap<TagKey, Tag>,
        accessed: &HashMap<TagKey, TagState>,
    ) -> CommandResult<Vec<Granted>> {
        let requests = tags
            .values()
            .filter(|tag| tag.is_consistency_tag())
            .map(|tag| {
                let expected = tag.expected_sortable_unique_id().cloned().or_else(|| {
                    accessed
                        .get(tag.key())
                        .and_then(|state| state.last_sorted_unique_id.clone())
                });
                async move {
                    let outcome = self.reserve_one(tag.key(), expected.as_ref()).await;
                    (tag, outcome)
                }
            });

        let mut granted = Vec::new();
        let mut failures = Vec::new();
        for (tag, outcome) in join_all(requests).await {
            match outcome {
                Ok(grant) => granted.push(grant),
                Err(error) => failures.push(TagReservationFailure {
                    tag: tag.tag_id(),
                    error,
                }),
            }
        }

        if failures.is_empty() {
            return Ok(granted);
        }
        warn!(
            refused = failures.len(),
            granted = granted.len(),
            "reservation refused, cancelling granted reservations"
        );
        cancel_all(&granted).await;
        Err(CommandError::ReservationFailed(failures))
    }

    async fn reserve_one(
        &self,
        tag: &TagKey,
        expected: Option<&SortableUniqueId>,
    ) -> Result<Granted, ReservationError> {
        let actor = self
            .accessor
            .tag_consistent_actor(tag)
            .await
            .map_err(|err| ReservationError::Unavailable {
                tag: tag.tag_id(),
                reason: err.to_string(),
            })?;
        let reservation = actor.make_reservation(expected).await?;
        Ok(Granted { actor, reservation })
    }

    async fn notify_unreserved(&self, tags: &BTreeMap<TagKey, Tag>) {
        let notifications = tags
            .values()
            .filter(|tag| !tag.is_consistency_tag())
            .map(|tag| async move {
                let outcome = match self.accessor.tag_consistent_actor(tag.key()).await {
                    Ok(actor) => actor.notify_event_written().await.map_err(|e| e.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                if let Err(error) = outcome {
                    warn!(tag = %tag, %error, "could not notify tag actor of written event");
                }
            });
        join_all(notifications).await;
    }

    fn publish(&self, events: &[Event]) {
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        let events = events.to_vec();
        tokio::spawn(async move {
            if let Err(err) = publisher.publish(&events).await {
                warn!(error = %err, count = events.len(), "publishing written events failed");
            }
        });
    }

    /// The state of one tag under one projector.
    pub async fn tag_state(&self, id: &TagStateId) -> CommandResult<TagState> {
        let errors = id.tag().validate();
        if !errors.is_empty() {
            return Err(CommandError::InvalidTag(errors));
        }
        let actor = self.accessor.tag_state_actor(id).await?;
        Ok(actor.state().await?)
    }

    /// The state of `tag` under projector `P`, deserialized.
    pub async fn tag_state_typed<P: TagProjector>(
        &self,
        tag: &TagKey,
    ) -> CommandResult<TypedTagState<P::State>> {
        let state = self.tag_state(&TagStateId::new(tag.clone(), P::NAME)).await?;
        Ok(TypedTagState::from_state(&state)?)
    }

    /// The current state of multi-projector `P`.
    pub async fn multi_projection_state<P: MultiProjector>(
        &self,
        can_get_unsafe_state: bool,
    ) -> CommandResult<MultiProjectionState<P::State>> {
        let actor = resolve_multi_projection::<P>(self.accessor.as_ref()).await?;
        Ok(actor.get_state(can_get_unsafe_state))
    }

    /// Runs `query` against the state of its projector.
    pub async fn query<Q: MultiProjectionQuery>(&self, query: &Q) -> CommandResult<Q::Output> {
        let state = self
            .multi_projection_state::<Q::Projector>(query.can_use_unsafe_state())
            .await?;
        query.execute(&state.payload)
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("options", &self.options)
            .field("has_publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

/// The appended events followed by the returned one, unless the handler
/// both appended and returned the same draft.
fn collect_drafts(
    mut appended: Vec<EventPayloadWithTags>,
    returned: Option<EventPayloadWithTags>,
) -> Vec<EventPayloadWithTags> {
    if let Some(returned) = returned {
        if !appended.iter().any(|draft| draft.is_same_draft(&returned)) {
            appended.push(returned);
        }
    }
    appended
}

/// One tag per identity; the most demanding form wins.
fn merge_tags(drafts: &[EventPayloadWithTags]) -> BTreeMap<TagKey, Tag> {
    let mut merged: BTreeMap<TagKey, Tag> = BTreeMap::new();
    for tag in drafts.iter().flat_map(EventPayloadWithTags::tags) {
        match merged.get(tag.key()) {
            Some(existing) if existing.precedence() >= tag.precedence() => {}
            _ => {
                merged.insert(tag.key().clone(), tag.clone());
            }
        }
    }
    merged
}

fn materialize(drafts: &[EventPayloadWithTags], metadata: &EventMetadata) -> Vec<Event> {
    let mut previous: Option<SortableUniqueId> = None;
    drafts
        .iter()
        .map(|draft| {
            let sortable_unique_id = SortableUniqueId::generate_after(previous.as_ref());
            previous = Some(sortable_unique_id.clone());
            Event::from_draft(draft, EventId::new(), sortable_unique_id, metadata.clone())
        })
        .collect()
}

async fn cancel_all(granted: &[Granted]) {
    let cancellations = granted.iter().map(|grant| async move {
        if let Err(err) = grant.actor.cancel_reservation(&grant.reservation).await {
            warn!(tag = %grant.reservation.tag, error = %err, "reservation cancel failed");
        }
    });
    join_all(cancellations).await;
}

async fn confirm_all(granted: &[Granted]) {
    let confirmations = granted.iter().map(|grant| async move {
        match grant.actor.confirm_reservation(&grant.reservation).await {
            Ok(true) => {}
            Ok(false) => warn!(
                tag = %grant.reservation.tag,
                "reservation expired before confirmation"
            ),
            Err(err) => {
                warn!(tag = %grant.reservation.tag, error = %err, "reservation confirm failed");
            }
        }
    });
    join_all(confirmations).await;
}
