//! Multi-projection ordering, safety and snapshot behaviour.

#![allow(clippy::doc_markdown)]

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use dcbcore::{
    Event, EventId, EventMetadata, EventPayloadWithTags, EventSource, FoldResult,
    MultiProjectionActor, MultiProjectionActorOptions, MultiProjector, ProjectionError,
    SortableUniqueId,
};
use dcbcore_integration_tests::university::{CourseRoster, RosterOf};
use dcbcore_integration_tests::University;
use proptest::prelude::*;

/// Records payloads in fold order, so any reordering shows up.
struct Ledger;

impl MultiProjector for Ledger {
    type State = Vec<u64>;
    const NAME: &'static str = "Ledger";
    const VERSION: &'static str = "1";

    fn initial_state() -> Vec<u64> {
        Vec::new()
    }

    fn project(state: &mut Vec<u64>, event: &Event, _: &SortableUniqueId) -> FoldResult<()> {
        state.push(event.payload_as()?);
        Ok(())
    }
}

/// Same name, newer version.
struct LedgerV2;

impl MultiProjector for LedgerV2 {
    type State = Vec<u64>;
    const NAME: &'static str = "Ledger";
    const VERSION: &'static str = "2";

    fn initial_state() -> Vec<u64> {
        Vec::new()
    }

    fn project(state: &mut Vec<u64>, event: &Event, _: &SortableUniqueId) -> FoldResult<()> {
        state.push(event.payload_as::<u64>()? * 2);
        Ok(())
    }
}

/// `n` at `millis_ago`, with `n` as tiebreak so equal instants still order
/// by `n`.
fn entry(n: u64, millis_ago: i64) -> Event {
    let draft = EventPayloadWithTags::from_parts("Entry", serde_json::json!(n), vec![]);
    Event::from_draft(
        &draft,
        EventId::new(),
        SortableUniqueId::from_datetime(Utc::now() - TimeDelta::milliseconds(millis_ago), n),
        EventMetadata::new(),
    )
}

/// Events `0..count`, oldest first, spread over the last `span_ms`.
fn timeline(count: u64, oldest_ms: i64, span_ms: i64) -> Vec<Event> {
    let step = span_ms / count.max(1) as i64;
    (0..count)
        .map(|n| entry(n, oldest_ms - step * n as i64))
        .collect()
}

fn ledger(safe_window: Duration) -> MultiProjectionActor<Ledger> {
    MultiProjectionActor::new(
        MultiProjectionActorOptions::default().with_safe_window_ms(safe_window.as_millis() as u64),
    )
}

fn deliver(actor: &MultiProjectionActor<Ledger>, events: Vec<Event>, cuts: &[usize]) {
    let mut rest = events;
    for &cut in cuts {
        let cut = cut.min(rest.len());
        let tail = rest.split_off(cut);
        actor.add_events(rest, false, EventSource::Stream).unwrap();
        rest = tail;
    }
    actor.add_events(rest, true, EventSource::Stream).unwrap();
}

fn shuffled_recent_events() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    (1usize..24).prop_flat_map(|count| {
        (
            Just((0..count).collect::<Vec<_>>()).prop_shuffle(),
            prop::collection::vec(0..count, 0..4),
        )
    })
}

proptest! {
    #[test]
    fn delivery_order_inside_the_window_does_not_matter(
        (order, cuts) in shuffled_recent_events()
    ) {
        let events = timeline(order.len() as u64, 5_000, 4_000);
        let expected: Vec<u64> = (0..order.len() as u64).collect();
        let arrival: Vec<Event> = order.iter().map(|&i| events[i].clone()).collect();

        let actor = ledger(Duration::from_secs(60));
        deliver(&actor, arrival, &cuts);

        let unsafe_state = actor.get_state(true);
        prop_assert_eq!(&unsafe_state.payload, &expected);
        prop_assert!(!unsafe_state.is_safe);
        prop_assert!(actor.get_state(false).payload.is_empty());

        actor.force_promote_all_buffered_events().unwrap();
        prop_assert_eq!(actor.get_state(false).payload, expected);
    }

    #[test]
    fn safe_state_is_a_prefix_of_the_unsafe_state(
        old in 0u64..12,
        recent_order in Just((0..10usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut events = timeline(old, 120_000, 60_000);
        let recent: Vec<Event> = (0..10).map(|i| entry(old + i, 3_000 - 200 * i as i64)).collect();
        events.extend(recent_order.iter().map(|&i| recent[i].clone()));

        let actor = ledger(Duration::from_secs(20));
        actor.add_events(events, true, EventSource::Stream).unwrap();

        let safe = actor.get_state(false);
        let unsafe_state = actor.get_state(true);
        prop_assert!(safe.version <= unsafe_state.version);
        prop_assert!(unsafe_state.payload.starts_with(&safe.payload));
        prop_assert_eq!(safe.payload.len() as u64, old);
        prop_assert_eq!(unsafe_state.payload.len() as u64, old + 10);
        prop_assert!(safe.last_sortable_unique_id <= unsafe_state.last_sortable_unique_id);
    }
}

#[test]
fn redelivered_events_fold_once() {
    let actor = ledger(Duration::from_secs(1));
    let events = timeline(5, 10_000, 5_000);

    actor.add_events(events[..3].to_vec(), false, EventSource::Stream).unwrap();
    actor.add_events(events.clone(), false, EventSource::Stream).unwrap();
    actor.add_events(events[2..].to_vec(), true, EventSource::Stream).unwrap();

    let state = actor.get_state(true);
    assert_eq!(state.payload, vec![0, 1, 2, 3, 4]);
    assert_eq!(state.version, 5);
    assert!(state.is_caught_up);
}

#[test]
fn snapshot_restores_into_a_fresh_actor() {
    let actor = ledger(Duration::from_secs(20));
    let mut events = timeline(4, 60_000, 30_000);
    events.extend((0..3).map(|i| entry(4 + i, 2_000 - 300 * i as i64)));
    actor.add_events(events, true, EventSource::CatchUp).unwrap();

    let snapshot = actor.build_snapshot(true).unwrap();
    let restored = ledger(Duration::from_secs(20));
    restored.restore_snapshot(snapshot).unwrap();

    let original = actor.get_state(true);
    let copy = restored.get_state(true);
    assert_eq!(copy.payload, original.payload);
    assert_eq!(copy.version, original.version);
    assert_eq!(copy.last_sortable_unique_id, original.last_sortable_unique_id);
    assert_eq!(restored.get_state(false).payload, original.payload);
}

#[test]
fn snapshot_of_another_projector_version_is_refused() {
    let old = ledger(Duration::from_secs(1));
    old.add_events(timeline(3, 10_000, 3_000), true, EventSource::CatchUp)
        .unwrap();
    let snapshot = old.build_snapshot(false).unwrap();

    let newer = MultiProjectionActor::<LedgerV2>::new(MultiProjectionActorOptions::default());
    let err = newer.restore_snapshot(snapshot.clone()).unwrap_err();
    assert_eq!(
        err,
        ProjectionError::VersionMismatch {
            projector: "Ledger".to_string(),
            current: "2".to_string(),
            snapshot: "1".to_string(),
        }
    );
    assert!(newer.get_state(true).payload.is_empty());

    newer.restore_snapshot_ignoring_version(snapshot).unwrap();
    assert_eq!(newer.get_state(true).payload, vec![0, 1, 2]);
}

#[test]
fn uncompressed_snapshots_restore_too() {
    let options = MultiProjectionActorOptions::default()
        .with_safe_window_ms(0)
        .with_compression(false);
    let actor = MultiProjectionActor::<Ledger>::new(options);
    actor
        .add_events(timeline(6, 5_000, 5_000), true, EventSource::CatchUp)
        .unwrap();

    let restored = MultiProjectionActor::<Ledger>::new(options);
    restored
        .restore_snapshot(actor.build_snapshot(false).unwrap())
        .unwrap();
    assert_eq!(restored.get_state(false).payload, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn catch_up_from_store_matches_the_streamed_projection() {
    let university = University::new();
    university.open_course("c1", 5).await.unwrap();
    university.open_course("c2", 5).await.unwrap();
    for (s, c) in [("s1", "c1"), ("s2", "c1"), ("s3", "c2")] {
        university.register(s, 2).await.unwrap();
        university.enroll(s, c).await.unwrap();
    }
    university.enroll("s1", "c2").await.unwrap();

    let rebuilt = MultiProjectionActor::<CourseRoster>::new(
        MultiProjectionActorOptions::default().with_safe_window_ms(0),
    );
    let folded = rebuilt
        .catch_up_from_store(university.store.as_ref())
        .await
        .unwrap();
    assert_eq!(folded, 9);
    assert_eq!(
        rebuilt.catch_up_from_store(university.store.as_ref()).await.unwrap(),
        0
    );

    let expected = rebuilt.get_state(true).payload;
    let mut streamed = None;
    for _ in 0..100 {
        let state = university
            .executor
            .multi_projection_state::<CourseRoster>(true)
            .await
            .unwrap();
        if state.version == 9 {
            streamed = Some(state);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(streamed.map(|s| s.payload), Some(expected));
    assert_eq!(
        university.executor.query(&RosterOf("c2".into())).await.unwrap(),
        vec!["s1".to_string(), "s3".to_string()]
    );
}
