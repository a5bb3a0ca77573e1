//! Tag reservation guarantees observed through the in-memory actor host.

#![allow(clippy::doc_markdown)]

use std::sync::Arc;
use std::time::Duration;

use dcbcore::{
    ReservationError, SortableUniqueId, TagConsistency, TagConsistentActorOptions,
};
use dcbcore_integration_tests::university::student;
use dcbcore_integration_tests::University;
use dcbcore_memory::InMemoryEventStore;
use futures::future::join_all;

fn university_with_window(window: Duration) -> University {
    University::over(
        Arc::new(InMemoryEventStore::new()),
        TagConsistentActorOptions::default().with_cancellation_duration(window),
    )
}

#[tokio::test]
async fn one_of_many_concurrent_reservations_is_granted() {
    let university = University::new();
    let actor = university.accessor.reservation_actor(&student("7"));

    let attempts = join_all((0..16).map(|_| {
        let actor = Arc::clone(&actor);
        async move { actor.make_reservation(None).await }
    }))
    .await;

    let granted: Vec<_> = attempts.iter().filter_map(|a| a.as_ref().ok()).collect();
    assert_eq!(granted.len(), 1);
    assert!(attempts.iter().filter_map(|a| a.as_ref().err()).all(|err| matches!(
        err,
        ReservationError::Conflict { tag } if tag == "Student:7"
    )));
    assert_eq!(actor.active_reservations().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_across_threads_grant_one() {
    let university = University::new();
    let actor = university.accessor.reservation_actor(&student("8"));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let actor = Arc::clone(&actor);
            tokio::spawn(async move { actor.make_reservation(None).await.is_ok() })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn reservation_is_free_again_after_confirm_or_cancel() {
    let university = University::new();
    let actor = university.accessor.reservation_actor(&student("9"));

    let first = actor.make_reservation(None).await.unwrap();
    actor.cancel_reservation(&first).await.unwrap();

    let second = actor.make_reservation(None).await.unwrap();
    assert_ne!(first.code, second.code);
    assert!(actor.confirm_reservation(&second).await.unwrap());

    actor.make_reservation(None).await.unwrap();
}

#[tokio::test]
async fn stale_expected_position_is_refused() {
    let university = University::new();
    university.register("1", 3).await.unwrap();
    let actor = university.accessor.reservation_actor(&student("1"));
    let current = actor.latest_sortable_unique_id().await.unwrap().unwrap();
    let stale = SortableUniqueId::min();

    let err = actor.make_reservation(Some(&stale)).await.unwrap_err();
    assert_eq!(
        err,
        ReservationError::OptimisticConcurrencyViolation {
            tag: "Student:1".to_string(),
            expected: stale,
            current: current.clone(),
        }
    );
    assert!(actor.active_reservations().await.is_empty());

    let granted = actor.make_reservation(Some(&current)).await.unwrap();
    assert_eq!(granted.tag, "Student:1");
}

#[tokio::test]
async fn position_follows_writes_made_by_commands() {
    let university = University::new();
    let actor = university.accessor.reservation_actor(&student("2"));
    assert_eq!(actor.latest_sortable_unique_id().await.unwrap(), None);

    let written = university.register("2", 1).await.unwrap();

    assert_eq!(
        actor.latest_sortable_unique_id().await.unwrap(),
        written.sortable_unique_id
    );
}

#[tokio::test]
async fn expired_reservation_does_not_block_and_cannot_confirm() {
    let university = university_with_window(Duration::from_millis(100));
    let actor = university.accessor.reservation_actor(&student("3"));

    let abandoned = actor.make_reservation(None).await.unwrap();
    assert!(matches!(
        actor.make_reservation(None).await,
        Err(ReservationError::Conflict { .. })
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let fresh = actor.make_reservation(None).await.unwrap();
    assert!(!actor.confirm_reservation(&abandoned).await.unwrap());
    assert!(actor.confirm_reservation(&fresh).await.unwrap());
}

#[tokio::test]
async fn student_123_reservation_outlives_its_window() {
    let university = university_with_window(Duration::from_secs(2));
    let actor = university.accessor.reservation_actor(&student("123"));

    let r1 = actor.make_reservation(None).await.unwrap();
    assert!(matches!(
        actor.make_reservation(None).await,
        Err(ReservationError::Conflict { .. })
    ));
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let r2 = actor.make_reservation(None).await.unwrap();

    assert!(!actor.confirm_reservation(&r1).await.unwrap());
    assert!(actor.confirm_reservation(&r2).await.unwrap());
    assert_eq!(actor.latest_sortable_unique_id().await.unwrap(), None);
    assert_eq!(actor.tag_actor_id(), "Student:123");
}
