//! Integration tests for the unit of work commit pipeline.

use std::sync::{Arc, Mutex};

use furrow::{
    EventSourced, EventStoreUnitOfWork, ProducerId, SharedProducer, UnitOfWork,
    store::{EventStore, Filter},
    uow::CommitError,
};
use furrow_core::test::{Outcome, ScriptedFailure, ScriptedStore, StubProducer};
use futures::TryStreamExt;

fn producer(events: usize) -> (ProducerId, Arc<Mutex<StubProducer>>) {
    let mut producer = StubProducer::versioned();
    producer.record(events);
    let id = producer.producer_id().clone();
    (id, Arc::new(Mutex::new(producer)))
}

fn id_of(producer: &SharedProducer) -> ProducerId {
    producer.lock().unwrap().producer_id().clone()
}

/// Drive a commit until it fails, returning the producers emitted before the
/// failure.
async fn commit_until_failure<U: UnitOfWork>(uow: &U) -> (Vec<ProducerId>, U::Error) {
    let mut commit = uow.commit();
    let mut emitted = Vec::new();
    loop {
        match commit.try_next().await {
            Ok(Some(producer)) => emitted.push(id_of(&producer)),
            Ok(None) => panic!("commit finished without the scripted failure"),
            Err(err) => return (emitted, err),
        }
    }
}

#[tokio::test]
async fn commit_order_equals_add_order() {
    let store = ScriptedStore::new();
    let uow = EventStoreUnitOfWork::new(store.clone());
    let (a, first) = producer(1);
    let (b, second) = producer(2);
    let (c, third) = producer(1);
    uow.add(&second).unwrap();
    uow.add(&first).unwrap();
    uow.add(&third).unwrap();

    let committed: Vec<ProducerId> = uow
        .commit()
        .map_ok(|producer| id_of(&producer))
        .try_collect()
        .await
        .unwrap();

    assert_eq!(committed, vec![b.clone(), a.clone(), c.clone()]);
    assert_eq!(store.calls(), vec![b, a, c]);
    assert_eq!(store.inner().len(), 4);
    assert_eq!(uow.count(), 0);
}

#[tokio::test]
async fn store_failure_keeps_only_the_failing_producer_for_retry() {
    let store = ScriptedStore::new()
        .then(Outcome::Append)
        .then(Outcome::Append)
        .then(Outcome::Fail);
    let uow = EventStoreUnitOfWork::new(store.clone());
    let (a, first) = producer(1);
    let (b, second) = producer(1);
    let (c, third) = producer(1);
    for producer in [&first, &second, &third] {
        uow.add(producer).unwrap();
    }

    let (emitted, err) = commit_until_failure(&uow).await;

    assert_eq!(emitted, vec![a.clone(), b.clone()]);
    assert!(matches!(err, CommitError::Store(ScriptedFailure(ref id)) if id == &c));
    assert!(!uow.has(&first));
    assert!(!uow.has(&second));
    assert!(uow.has(&third));
    assert_eq!(third.lock().unwrap().events().len(), 1);

    let retried: Vec<_> = uow.commit().try_collect().await.unwrap();

    assert_eq!(retried.len(), 1);
    assert_eq!(store.calls(), vec![a, b, c.clone(), c]);
    assert_eq!(store.inner().len(), 3);
    assert_eq!(uow.count(), 0);
}

#[tokio::test]
async fn conflicting_producer_is_evicted() {
    let store = ScriptedStore::new()
        .then(Outcome::Append)
        .then(Outcome::Conflict);
    let uow = EventStoreUnitOfWork::new(store.clone());
    let (a, first) = producer(1);
    let (b, second) = producer(2);
    uow.add(&first).unwrap();
    uow.add(&second).unwrap();

    let (emitted, err) = commit_until_failure(&uow).await;

    assert_eq!(emitted, vec![a]);
    let CommitError::ConcurrentWrite(conflict) = err else {
        panic!("expected a conflict, got {err:?}");
    };
    assert_eq!(conflict.id(), &b);
    assert_eq!(conflict.expected, Some(0));
    assert!(!uow.has(&second));
    assert_eq!(uow.count(), 0);
    assert!(uow.commit().try_collect::<Vec<_>>().await.unwrap().is_empty());
}

#[tokio::test]
async fn removed_producers_never_reach_the_store() {
    let store = ScriptedStore::new();
    let uow = EventStoreUnitOfWork::new(store.clone());
    let (kept_id, kept) = producer(1);
    let (_, removed) = producer(3);
    uow.add(&removed).unwrap();
    uow.add(&kept).unwrap();
    uow.remove(&removed);

    uow.commit().try_collect::<Vec<_>>().await.unwrap();

    assert_eq!(store.calls(), vec![kept_id]);
    assert_eq!(removed.lock().unwrap().events().len(), 3);
}

#[tokio::test]
async fn cleared_unit_of_work_commits_nothing() {
    let store = ScriptedStore::new();
    let uow = EventStoreUnitOfWork::new(store.clone());
    let (_, first) = producer(1);
    uow.add(&first).unwrap();
    uow.clear();

    let committed: Vec<_> = uow.commit().try_collect().await.unwrap();

    assert!(committed.is_empty());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn expected_version_accounts_for_pending_events() {
    let store = ScriptedStore::new();
    let uow = EventStoreUnitOfWork::new(store.clone());
    let (id, first) = producer(2);
    uow.add(&first).unwrap();
    uow.commit().try_collect::<Vec<_>>().await.unwrap();

    first.lock().unwrap().record(3);
    uow.add(&first).unwrap();
    uow.commit().try_collect::<Vec<_>>().await.unwrap();

    assert_eq!(store.inner().version(&id), 5);
    let stream = store
        .stream(&Filter::new().filter_producer_ids([id]).after_version(2))
        .await
        .unwrap();
    assert_eq!(stream.len(), 3);
}

#[tokio::test]
async fn unversioned_producers_skip_the_version_check() {
    let store = ScriptedStore::new();
    let uow = EventStoreUnitOfWork::new(store.clone());
    let mut unversioned = StubProducer::unversioned();
    unversioned.record(2);
    let id = unversioned.producer_id().clone();
    uow.add(&Arc::new(Mutex::new(unversioned))).unwrap();

    uow.commit().try_collect::<Vec<_>>().await.unwrap();

    let stream = store
        .stream(&Filter::new().filter_producer_ids([id]))
        .await
        .unwrap();
    assert_eq!(stream.len(), 2);
    assert!(stream.iter().all(|envelope| envelope.version().is_none()));
}
