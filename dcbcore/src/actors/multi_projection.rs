//! The multi-projection actor: one long-lived projection per projector name.
//!
//! Events may arrive late and out of order. The actor therefore folds every
//! event into an *unsafe* state immediately, while the *safe* state only
//! receives events older than the safe window threshold. The window is a
//! fixed base, optionally widened by the delivery lag observed on live
//! stream batches.
//!
//! Ingestion must be serialized by the host; reads may interleave with it at
//! any time.

use crate::config::MultiProjectionActorOptions;
use crate::errors::{ProjectionError, ProjectionResult};
use crate::event::Event;
use crate::projection::{
    DualStateAccessor, MultiProjector, ProjectionPosition, SerializableMultiProjectionState,
    SnapshotEnvelope, SnapshotPersistenceData,
};
use crate::store::EventStore;
use crate::types::{EventId, SortableUniqueId};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

/// Where an ingested batch came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Live delivery; feeds the lag tracker.
    Stream,
    /// Replay of stored events.
    CatchUp,
    /// Not specified.
    #[default]
    Unknown,
}

/// A snapshot of the projection as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiProjectionState<S> {
    /// The folded state.
    pub payload: S,
    /// Projector name.
    pub projector: String,
    /// Projector version.
    pub projector_version: String,
    /// Highest sortable id reflected in `payload`.
    pub last_sortable_unique_id: Option<SortableUniqueId>,
    /// Last event folded.
    pub last_event_id: Option<EventId>,
    /// Number of events folded.
    pub version: u64,
    /// Whether the feeding side reported catch-up as finished.
    pub is_caught_up: bool,
    /// Whether every event in `payload` is older than the safe window.
    pub is_safe: bool,
}

#[derive(Debug, Default)]
struct LagTracker {
    ema_ms: f64,
    ema_updated: Option<DateTime<Utc>>,
    max_ms: f64,
    max_updated: Option<DateTime<Utc>>,
}

fn decayed(value: f64, updated: Option<DateTime<Utc>>, now: DateTime<Utc>, decay: f64) -> f64 {
    match updated {
        Some(at) => {
            let seconds = (now - at).num_milliseconds().max(0) as f64 / 1000.0;
            value * decay.powf(seconds)
        }
        None => value,
    }
}

impl LagTracker {
    fn observe(&mut self, batch_max_ms: f64, now: DateTime<Utc>, alpha: f64, decay: f64) {
        let ema = decayed(self.ema_ms, self.ema_updated, now, decay);
        self.ema_ms = alpha.mul_add(batch_max_ms, (1.0 - alpha) * ema);
        self.ema_updated = Some(now);

        let max = decayed(self.max_ms, self.max_updated, now, decay);
        self.max_ms = max.max(batch_max_ms);
        self.max_updated = Some(now);
    }

    fn current_ms(&self, now: DateTime<Utc>, decay: f64) -> f64 {
        decayed(self.ema_ms, self.ema_updated, now, decay)
            .max(decayed(self.max_ms, self.max_updated, now, decay))
    }
}

struct Inner<P: MultiProjector> {
    payload: Option<Box<dyn DualStateAccessor<P::State>>>,
    is_caught_up: bool,
    last_event_id: Option<EventId>,
    last_sortable_unique_id: Option<SortableUniqueId>,
    lag: LagTracker,
}

impl<P: MultiProjector> Inner<P> {
    fn payload_mut(&mut self) -> &mut Box<dyn DualStateAccessor<P::State>> {
        self.payload
            .get_or_insert_with(|| P::dual_state(P::initial_state(), ProjectionPosition::default()))
    }

    fn track(&mut self, event: &Event) {
        self.last_event_id = Some(event.id);
        if self
            .last_sortable_unique_id
            .as_ref()
            .is_none_or(|last| event.sortable_unique_id > *last)
        {
            self.last_sortable_unique_id = Some(event.sortable_unique_id.clone());
        }
    }
}

/// Maintains the dual safe/unsafe projection of one [`MultiProjector`].
pub struct MultiProjectionActor<P: MultiProjector> {
    options: MultiProjectionActorOptions,
    inner: Mutex<Inner<P>>,
}

impl<P: MultiProjector> MultiProjectionActor<P> {
    /// Creates an actor; the projector state is created on first use.
    pub fn new(options: MultiProjectionActorOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner {
                payload: None,
                is_caught_up: true,
                last_event_id: None,
                last_sortable_unique_id: None,
                lag: LagTracker::default(),
            }),
        }
    }

    /// The actor's options.
    pub const fn options(&self) -> &MultiProjectionActorOptions {
        &self.options
    }

    /// Folds a batch of events.
    ///
    /// Duplicate ids are dropped and the rest sorted by sortable id, so the
    /// result does not depend on arrival order within the batch. A fold
    /// failure aborts the batch; events before it stay applied.
    #[instrument(skip(self, events), fields(projector = P::NAME, count = events.len()))]
    pub fn add_events(
        &self,
        events: Vec<Event>,
        finished_catch_up: bool,
        source: EventSource,
    ) -> ProjectionResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.payload_mut();
        inner.is_caught_up = finished_catch_up;

        if self.options.enable_dynamic_safe_window
            && source == EventSource::Stream
            && !events.is_empty()
        {
            let batch_max_ms = self.batch_lag_ms(&events, now);
            inner.lag.observe(
                batch_max_ms,
                now,
                self.options.lag_ema_alpha.into_inner(),
                self.options.lag_decay_per_second.into_inner(),
            );
        }
        let threshold = self.threshold(&inner.lag, now);

        let mut seen = HashSet::with_capacity(events.len());
        let mut batch: Vec<Event> = events.into_iter().filter(|e| seen.insert(e.id)).collect();
        batch.sort_by(|a, b| a.sortable_unique_id.cmp(&b.sortable_unique_id));

        for event in &batch {
            inner
                .payload_mut()
                .process_event(event, &threshold)
                .map_err(|source| ProjectionError::EventProcessing {
                    event_id: event.id,
                    event_type: event.event_type.clone(),
                    projector: P::NAME.to_string(),
                    source,
                })?;
            inner.track(event);
        }
        debug!(buffered = inner.payload_mut().buffered_count(), "batch folded");
        Ok(())
    }

    /// Reads every stored event after the tracked position and folds it as
    /// a finished catch-up batch. Returns the number of events read.
    pub async fn catch_up_from_store(&self, store: &dyn EventStore) -> ProjectionResult<usize> {
        let since = self.inner.lock().last_sortable_unique_id.clone();
        let events = store.read_all_events(since.as_ref()).await?;
        let count = events.len();
        self.add_events(events, true, EventSource::CatchUp)?;
        Ok(count)
    }

    /// The current state. The unsafe state reflects every event received;
    /// the safe state only events older than the safe window.
    pub fn get_state(&self, can_get_unsafe_state: bool) -> MultiProjectionState<P::State> {
        let mut inner = self.inner.lock();
        let threshold = self.threshold(&inner.lag, Utc::now());
        if let Err(err) = inner.payload_mut().promote_buffered_events(&threshold) {
            warn!(projector = P::NAME, error = %err, "promotion of buffered events failed");
        }

        let is_caught_up = inner.is_caught_up;
        let tracked_sortable_id = inner.last_sortable_unique_id.clone();
        let tracked_event_id = inner.last_event_id;
        let payload = inner.payload_mut();

        if can_get_unsafe_state {
            let is_safe = tracked_sortable_id
                .as_ref()
                .is_none_or(|last| last.datetime() <= threshold.datetime());
            MultiProjectionState {
                payload: payload.unsafe_payload().clone(),
                projector: P::NAME.to_string(),
                projector_version: P::VERSION.to_string(),
                last_sortable_unique_id: tracked_sortable_id,
                last_event_id: tracked_event_id,
                version: payload.unsafe_position().version,
                is_caught_up,
                is_safe,
            }
        } else {
            let position = payload.safe_position();
            MultiProjectionState {
                payload: payload.safe_payload().clone(),
                projector: P::NAME.to_string(),
                projector_version: P::VERSION.to_string(),
                last_sortable_unique_id: position
                    .last_sortable_unique_id
                    .clone()
                    .or(tracked_sortable_id),
                last_event_id: position.last_event_id,
                version: position.version,
                is_caught_up,
                is_safe: true,
            }
        }
    }

    /// Promotes buffered events older than the current threshold.
    pub fn force_promote_buffered_events(&self) -> ProjectionResult<usize> {
        let mut inner = self.inner.lock();
        let threshold = self.threshold(&inner.lag, Utc::now());
        Self::promote(&mut inner, &threshold)
    }

    /// Promotes every buffered event regardless of age.
    pub fn force_promote_all_buffered_events(&self) -> ProjectionResult<usize> {
        Self::promote(&mut self.inner.lock(), &SortableUniqueId::max())
    }

    /// The threshold the next read would use.
    pub fn peek_current_safe_window_threshold(&self) -> SortableUniqueId {
        let inner = self.inner.lock();
        self.threshold(&inner.lag, Utc::now())
    }

    /// The highest sortable id reflected in the safe state.
    pub fn safe_last_sortable_unique_id(&self) -> Option<SortableUniqueId> {
        self.get_state(false).last_sortable_unique_id
    }

    /// Whether an event at `id` has been received, safe or not.
    pub fn is_sortable_unique_id_received(&self, id: &SortableUniqueId) -> bool {
        self.inner
            .lock()
            .last_sortable_unique_id
            .as_ref()
            .is_some_and(|last| id.is_earlier_than_or_equal(last))
    }

    /// Whether the feeding side reported catch-up as finished.
    pub fn is_caught_up(&self) -> bool {
        self.inner.lock().is_caught_up
    }

    /// Serializes the state after promoting every buffered event.
    #[instrument(skip(self), fields(projector = P::NAME))]
    pub fn build_snapshot(&self, can_get_unsafe_state: bool) -> ProjectionResult<SnapshotEnvelope> {
        self.force_promote_all_buffered_events()?;
        let state = self.get_state(can_get_unsafe_state);
        let (payload, original_size_bytes) = SerializableMultiProjectionState::encode_payload(
            &state.payload,
            self.options.compress_snapshots,
        )?;
        debug!(
            original = original_size_bytes,
            stored = payload.len(),
            "snapshot built"
        );
        Ok(SnapshotEnvelope::Inline(SerializableMultiProjectionState {
            compressed_size_bytes: payload.len(),
            payload,
            payload_type: std::any::type_name::<P::State>().to_string(),
            projector: state.projector,
            projector_version: state.projector_version,
            last_sortable_unique_id: state.last_sortable_unique_id,
            last_event_id: state.last_event_id,
            version: state.version,
            is_caught_up: state.is_caught_up,
            is_safe: state.is_safe,
            compressed: self.options.compress_snapshots,
            original_size_bytes,
        }))
    }

    /// Builds a snapshot and serializes its envelope for a durable store,
    /// refusing snapshots over the configured size cap.
    pub fn build_snapshot_for_persistence(
        &self,
        can_get_unsafe_state: bool,
    ) -> ProjectionResult<SnapshotPersistenceData> {
        let envelope = self.build_snapshot(can_get_unsafe_state)?;
        let json = serde_json::to_string(&envelope)
            .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
        let size_bytes = json.len();
        let limit_bytes = self.options.max_snapshot_serialized_size_bytes;
        if limit_bytes > 0 && size_bytes > limit_bytes {
            return Err(ProjectionError::SnapshotTooLarge {
                size_bytes,
                limit_bytes,
            });
        }

        let safe = self.get_state(false);
        Ok(SnapshotPersistenceData {
            json,
            size_bytes,
            safe_position: ProjectionPosition {
                version: safe.version,
                last_event_id: safe.last_event_id,
                last_sortable_unique_id: safe.last_sortable_unique_id,
            },
        })
    }

    /// Replaces the state with a snapshot taken by the same projector
    /// version.
    pub fn restore_snapshot(&self, envelope: SnapshotEnvelope) -> ProjectionResult<()> {
        let state = Self::inline_state_for_this_projector(envelope)?;
        if state.projector_version != P::VERSION {
            return Err(ProjectionError::VersionMismatch {
                projector: P::NAME.to_string(),
                current: P::VERSION.to_string(),
                snapshot: state.projector_version,
            });
        }
        self.restore(&state)
    }

    /// Replaces the state with a snapshot from any projector version. Meant
    /// for migration tooling.
    pub fn restore_snapshot_ignoring_version(
        &self,
        envelope: SnapshotEnvelope,
    ) -> ProjectionResult<()> {
        let state = Self::inline_state_for_this_projector(envelope)?;
        if state.projector_version != P::VERSION {
            warn!(
                projector = P::NAME,
                snapshot_version = %state.projector_version,
                "restoring snapshot from another projector version"
            );
        }
        self.restore(&state)
    }

    fn inline_state_for_this_projector(
        envelope: SnapshotEnvelope,
    ) -> ProjectionResult<SerializableMultiProjectionState> {
        let state = envelope.into_inline()?;
        if state.projector != P::NAME {
            return Err(ProjectionError::ProjectorMismatch {
                projector: P::NAME.to_string(),
                snapshot: state.projector,
            });
        }
        Ok(state)
    }

    fn restore(&self, state: &SerializableMultiProjectionState) -> ProjectionResult<()> {
        let payload: P::State = state.decode_payload()?;
        let position = ProjectionPosition {
            version: state.version,
            last_event_id: state.last_event_id,
            last_sortable_unique_id: state.last_sortable_unique_id.clone(),
        };

        let mut inner = self.inner.lock();
        inner.payload = Some(P::dual_state(payload, position));
        inner.last_event_id = state.last_event_id;
        inner.last_sortable_unique_id = state.last_sortable_unique_id.clone();
        inner.is_caught_up = state.is_caught_up;
        debug!(projector = P::NAME, version = state.version, "snapshot restored");
        Ok(())
    }

    fn promote(inner: &mut Inner<P>, threshold: &SortableUniqueId) -> ProjectionResult<usize> {
        inner
            .payload_mut()
            .promote_buffered_events(threshold)
            .map_err(|source| ProjectionError::Promotion {
                projector: P::NAME.to_string(),
                source,
            })
    }

    fn batch_lag_ms(&self, events: &[Event], now: DateTime<Utc>) -> f64 {
        let max_extra = self.options.max_extra_safe_window_ms as f64;
        events
            .iter()
            .map(|e| (now - e.sortable_unique_id.datetime()).num_milliseconds() as f64)
            .fold(0.0, f64::max)
            .clamp(0.0, max_extra)
    }

    fn threshold(&self, lag: &LagTracker, now: DateTime<Utc>) -> SortableUniqueId {
        let mut window_ms = self.options.safe_window_ms as f64;
        if self.options.enable_dynamic_safe_window {
            let extra = lag
                .current_ms(now, self.options.lag_decay_per_second.into_inner())
                .min(self.options.max_extra_safe_window_ms as f64);
            window_ms += extra;
        }
        let window = TimeDelta::milliseconds(window_ms.max(0.0) as i64);
        SortableUniqueId::threshold_at(
            now.checked_sub_signed(window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }
}

impl<P: MultiProjector> std::fmt::Debug for MultiProjectionActor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiProjectionActor")
            .field("projector", &P::NAME)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FoldError, FoldResult};
    use crate::event::EventPayloadWithTags;
    use crate::metadata::EventMetadata;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Counts events per type and records the fold order.
    struct Tally;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct TallyState {
        by_type: BTreeMap<String, u64>,
        order: Vec<u64>,
    }

    impl MultiProjector for Tally {
        type State = TallyState;
        const NAME: &'static str = "Tally";
        const VERSION: &'static str = "1";

        fn initial_state() -> TallyState {
            TallyState::default()
        }

        fn project(state: &mut TallyState, event: &Event, _: &SortableUniqueId) -> FoldResult<()> {
            if event.event_type == "Poison" {
                return Err(FoldError::new("cannot fold poison"));
            }
            *state.by_type.entry(event.event_type.clone()).or_default() += 1;
            state.order.push(event.payload_as()?);
            Ok(())
        }
    }

    fn event(kind: &str, n: u64, seconds_ago: i64) -> Event {
        let draft = EventPayloadWithTags::from_parts(kind, serde_json::json!(n), vec![]);
        Event::from_draft(
            &draft,
            EventId::new(),
            SortableUniqueId::from_datetime(Utc::now() - TimeDelta::seconds(seconds_ago), n),
            EventMetadata::new(),
        )
    }

    fn actor(safe_window_ms: u64) -> MultiProjectionActor<Tally> {
        MultiProjectionActor::new(
            MultiProjectionActorOptions::default().with_safe_window_ms(safe_window_ms),
        )
    }

    #[test]
    fn batch_order_does_not_change_the_result() {
        let e1 = event("Created", 1, 90);
        let e2 = event("Created", 2, 80);
        let e3 = event("Renamed", 3, 70);

        let ordered = actor(20_000);
        ordered
            .add_events(vec![e1.clone(), e2.clone(), e3.clone()], true, EventSource::Stream)
            .unwrap();
        let shuffled = actor(20_000);
        shuffled
            .add_events(vec![e3.clone(), e1, e2], true, EventSource::Stream)
            .unwrap();

        let a = ordered.get_state(true);
        let b = shuffled.get_state(true);
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.version, 3);
        assert_eq!(b.version, 3);
        assert_eq!(b.last_sortable_unique_id, Some(e3.sortable_unique_id));
    }

    #[test]
    fn duplicate_ids_in_a_batch_fold_once() {
        let e1 = event("Created", 1, 90);
        let actor = actor(20_000);
        actor
            .add_events(vec![e1.clone(), e1.clone()], true, EventSource::Unknown)
            .unwrap();
        actor.add_events(vec![e1], true, EventSource::Unknown).unwrap();
        assert_eq!(actor.get_state(true).version, 1);
    }

    #[test]
    fn recent_events_are_unsafe_only() {
        let actor = actor(20_000);
        let old = event("Created", 1, 60);
        let recent = event("Created", 2, 1);
        actor
            .add_events(vec![old.clone(), recent.clone()], true, EventSource::Stream)
            .unwrap();

        let safe = actor.get_state(false);
        let unsafe_state = actor.get_state(true);
        assert_eq!(safe.payload.order, vec![1]);
        assert!(safe.is_safe);
        assert_eq!(safe.last_sortable_unique_id, Some(old.sortable_unique_id));
        assert_eq!(unsafe_state.payload.order, vec![1, 2]);
        assert!(!unsafe_state.is_safe);
        assert!(actor.is_sortable_unique_id_received(&recent.sortable_unique_id));
        assert_eq!(
            actor.safe_last_sortable_unique_id(),
            safe.last_sortable_unique_id
        );
    }

    #[test]
    fn force_promote_all_makes_everything_safe() {
        let actor = actor(20_000);
        actor
            .add_events(vec![event("Created", 1, 1)], true, EventSource::Stream)
            .unwrap();
        assert_eq!(actor.force_promote_all_buffered_events().unwrap(), 1);
        assert_eq!(actor.get_state(false).version, 1);
    }

    #[test]
    fn fold_failure_names_event_and_keeps_earlier_events() {
        let actor = actor(0);
        let good = event("Created", 1, 10);
        let poison = event("Poison", 2, 5);
        let err = actor
            .add_events(vec![good, poison.clone()], true, EventSource::Stream)
            .unwrap_err();

        assert!(matches!(
            &err,
            ProjectionError::EventProcessing { event_id, projector, .. }
                if *event_id == poison.id && projector == "Tally"
        ));
        assert_eq!(actor.get_state(true).version, 1);
    }

    #[test]
    fn unseen_id_is_not_received() {
        let actor = actor(20_000);
        assert!(!actor.is_sortable_unique_id_received(&SortableUniqueId::min()));
        actor
            .add_events(vec![event("Created", 1, 30)], false, EventSource::CatchUp)
            .unwrap();
        assert!(!actor.is_caught_up());
        assert!(!actor.is_sortable_unique_id_received(&SortableUniqueId::generate()));
    }

    #[test]
    fn observed_lag_widens_the_window() {
        let options = MultiProjectionActorOptions::default()
            .with_safe_window_ms(1_000)
            .with_dynamic_safe_window(30_000);
        let actor = MultiProjectionActor::<Tally>::new(options);
        let before = Utc::now();
        actor
            .add_events(vec![event("Created", 1, 10)], true, EventSource::Stream)
            .unwrap();

        let threshold = actor.peek_current_safe_window_threshold().datetime();
        assert!(threshold < before - TimeDelta::milliseconds(10_500));
        assert!(threshold > before - TimeDelta::seconds(12));
    }

    #[test]
    fn catch_up_batches_do_not_feed_the_lag_tracker() {
        let options = MultiProjectionActorOptions::default()
            .with_safe_window_ms(1_000)
            .with_dynamic_safe_window(30_000);
        let actor = MultiProjectionActor::<Tally>::new(options);
        actor
            .add_events(vec![event("Created", 1, 600)], true, EventSource::CatchUp)
            .unwrap();

        let threshold = actor.peek_current_safe_window_threshold().datetime();
        assert!(threshold > Utc::now() - TimeDelta::seconds(2));
    }

    #[test]
    fn snapshot_round_trip_restores_state() {
        let source = actor(20_000);
        source
            .add_events(
                vec![event("Created", 1, 60), event("Renamed", 2, 1)],
                true,
                EventSource::Stream,
            )
            .unwrap();
        let expected = source.get_state(true);
        let snapshot = source.build_snapshot(true).unwrap();

        let target = actor(20_000);
        target.restore_snapshot(snapshot).unwrap();
        let restored = target.get_state(true);
        assert_eq!(restored.payload, expected.payload);
        assert_eq!(restored.version, expected.version);
        assert_eq!(restored.last_sortable_unique_id, expected.last_sortable_unique_id);
        assert_eq!(restored.last_event_id, expected.last_event_id);
    }

    #[test]
    fn redelivery_after_restore_folds_nothing() {
        let e1 = event("Created", 1, 60);
        let e2 = event("Created", 2, 50);
        let source = actor(20_000);
        source
            .add_events(vec![e1.clone(), e2.clone()], true, EventSource::Stream)
            .unwrap();
        source.add_events(vec![e1.clone()], true, EventSource::Stream).unwrap();
        assert_eq!(source.get_state(true).version, 2);

        let target = actor(20_000);
        target.restore_snapshot(source.build_snapshot(true).unwrap()).unwrap();
        target
            .add_events(vec![e1, e2.clone()], true, EventSource::Stream)
            .unwrap();

        let state = target.get_state(true);
        assert_eq!(state.version, 2);
        assert_eq!(state.payload.order, vec![1, 2]);
        assert_eq!(state.last_sortable_unique_id, Some(e2.sortable_unique_id));

        target
            .add_events(vec![event("Renamed", 3, 40)], true, EventSource::Stream)
            .unwrap();
        assert_eq!(target.get_state(true).payload.order, vec![1, 2, 3]);
    }

    #[test]
    fn lag_average_blends_each_batch_with_alpha() {
        let now = Utc::now();
        let mut lag = LagTracker::default();
        lag.observe(1_000.0, now, 0.5, 1.0);
        assert!((lag.ema_ms - 500.0).abs() < 1e-9);
        lag.observe(3_000.0, now, 0.5, 1.0);
        assert!((lag.ema_ms - 1_750.0).abs() < 1e-9);
        assert!((lag.max_ms - 3_000.0).abs() < 1e-9);
        assert!((lag.current_ms(now, 1.0) - 3_000.0).abs() < 1e-9);
    }

    #[test]
    fn tracked_lag_decays_per_elapsed_second() {
        let now = Utc::now();
        let mut lag = LagTracker::default();
        lag.observe(1_000.0, now, 0.3, 0.5);
        assert!((lag.ema_ms - 300.0).abs() < 1e-9);

        let later = now + TimeDelta::seconds(2);
        let ema = decayed(lag.ema_ms, lag.ema_updated, later, 0.5);
        assert!((ema - 75.0).abs() < 1e-9);
        assert!((lag.current_ms(later, 0.5) - 250.0).abs() < 1e-9);

        lag.observe(0.0, later, 0.3, 0.5);
        assert!((lag.max_ms - 250.0).abs() < 1e-9);
        assert!((lag.ema_ms - 52.5).abs() < 1e-9);
    }

    #[test]
    fn extra_window_is_capped() {
        let options = MultiProjectionActorOptions::default()
            .with_safe_window_ms(1_000)
            .with_dynamic_safe_window(30_000);
        let actor = MultiProjectionActor::<Tally>::new(options);
        let now = Utc::now();
        let lag = LagTracker {
            ema_ms: 600_000.0,
            ema_updated: Some(now),
            max_ms: 600_000.0,
            max_updated: Some(now),
        };
        assert_eq!(
            actor.threshold(&lag, now),
            SortableUniqueId::threshold_at(now - TimeDelta::seconds(31))
        );

        let before = Utc::now();
        actor
            .add_events(vec![event("Created", 1, 600)], true, EventSource::Stream)
            .unwrap();
        let threshold = actor.peek_current_safe_window_threshold().datetime();
        assert!(threshold >= before - TimeDelta::milliseconds(31_001));
        assert!(threshold < Utc::now() - TimeDelta::seconds(30));
    }

    #[test]
    fn snapshot_from_another_version_is_refused() {
        let source = actor(0);
        source
            .add_events(vec![event("Created", 1, 5)], true, EventSource::Stream)
            .unwrap();
        let SnapshotEnvelope::Inline(mut state) = source.build_snapshot(false).unwrap() else {
            panic!("expected an inline snapshot");
        };
        state.projector_version = "2".to_string();

        let target = actor(0);
        let err = target
            .restore_snapshot(SnapshotEnvelope::Inline(state.clone()))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::VersionMismatch { .. }));

        target
            .restore_snapshot_ignoring_version(SnapshotEnvelope::Inline(state))
            .unwrap();
        assert_eq!(target.get_state(true).version, 1);
    }

    #[test]
    fn oversized_snapshot_is_refused() {
        let actor = MultiProjectionActor::<Tally>::new(
            MultiProjectionActorOptions::default().with_max_snapshot_size(16),
        );
        actor
            .add_events(vec![event("Created", 1, 60)], true, EventSource::Stream)
            .unwrap();
        assert!(matches!(
            actor.build_snapshot_for_persistence(false),
            Err(ProjectionError::SnapshotTooLarge { limit_bytes: 16, .. })
        ));
    }

    #[test]
    fn persistence_data_reports_safe_position() {
        let actor = actor(20_000);
        let old = event("Created", 1, 60);
        actor
            .add_events(vec![old.clone()], true, EventSource::Stream)
            .unwrap();
        let data = actor.build_snapshot_for_persistence(false).unwrap();
        assert_eq!(data.size_bytes, data.json.len());
        assert_eq!(data.safe_position.version, 1);
        assert_eq!(data.safe_position.last_sortable_unique_id, Some(old.sortable_unique_id));
    }

    proptest! {
        #[test]
        fn safe_never_runs_ahead_of_unsafe(
            batches in prop::collection::vec(prop::collection::vec(0i64..60, 1..6), 1..6)
        ) {
            let actor = actor(20_000);
            let mut n = 0;
            for ages in batches {
                let batch = ages
                    .into_iter()
                    .map(|age| {
                        n += 1;
                        event("Created", n, age)
                    })
                    .collect();
                actor.add_events(batch, true, EventSource::Stream).unwrap();

                let safe = actor.get_state(false);
                let unsafe_state = actor.get_state(true);
                prop_assert!(safe.version <= unsafe_state.version);
                prop_assert!(safe.last_sortable_unique_id <= unsafe_state.last_sortable_unique_id);
            }
        }
    }
}
