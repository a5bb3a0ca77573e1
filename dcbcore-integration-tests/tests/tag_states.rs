//! Cached, incremental tag states agree with a rebuild from the first event.

use std::sync::Arc;

use dcbcore::{
    ActorAccessor, InMemoryTagStateCache, TagProjector, TagState, TagStateAccess, TagStateId,
};
use dcbcore_integration_tests::university::{course, student, CourseProjector, StudentProjector};
use dcbcore_integration_tests::University;
use dcbcore_memory::InMemoryActorAccessor;

async fn rebuilt<P: TagProjector>(university: &University, id: &TagStateId) -> TagState {
    let fresh = InMemoryActorAccessor::builder(Arc::clone(&university.store))
        .with_tag_projector::<P>()
        .with_tag_state_cache(Arc::new(InMemoryTagStateCache::new()))
        .build();
    fresh.tag_state_actor(id).await.unwrap().state().await.unwrap()
}

#[tokio::test]
async fn incremental_state_matches_full_rebuild_after_every_write() {
    let university = University::new();
    let id = TagStateId::new(student("s1"), StudentProjector::NAME);
    university.register("s1", 8).await.unwrap();

    for k in 0..8 {
        let course_id = format!("c{k}");
        university.open_course(&course_id, 2).await.unwrap();
        university.enroll("s1", &course_id).await.unwrap();

        let incremental = university.executor.tag_state(&id).await.unwrap();
        assert_eq!(incremental, rebuilt::<StudentProjector>(&university, &id).await);
        assert_eq!(incremental.version, k + 2);
    }
}

#[tokio::test]
async fn cleared_cache_rebuilds_the_same_state() {
    let university = University::new();
    university.open_course("c1", 3).await.unwrap();
    for s in ["s1", "s2", "s3"] {
        university.register(s, 1).await.unwrap();
        university.enroll(s, "c1").await.unwrap();
    }
    let id = TagStateId::new(course("c1"), CourseProjector::NAME);
    let actor = university.accessor.tag_state_actor(&id).await.unwrap();
    let before = actor.state().await.unwrap();

    actor.clear_cache().await;

    assert_eq!(actor.state().await.unwrap(), before);
    let typed = university
        .executor
        .tag_state_typed::<CourseProjector>(&course("c1"))
        .await
        .unwrap();
    assert_eq!(typed.payload.unwrap().students, vec!["s1", "s2", "s3"]);
    assert_eq!(typed.version, 4);
}

#[tokio::test]
async fn tag_without_events_is_empty() {
    let university = University::new();

    let state = university
        .executor
        .tag_state(&TagStateId::new(student("nobody"), StudentProjector::NAME))
        .await
        .unwrap();

    assert!(state.payload.is_empty());
    assert_eq!(state.version, 0);
    assert_eq!(state.last_sorted_unique_id, None);
}
