//! Integration tests for interval-based snapshot capture.

use std::sync::{Arc, Mutex};

use furrow::{
    EventSourced, EventStoreUnitOfWork, ProducerId, Repository, SharedProducer, UnitOfWork,
    snapshot::{SnapshotError, Snapshotter, SnapshottingUnitOfWork},
    store::{EventStore, Filter, inmemory},
};
use furrow_core::test::{RecordingSnapshotter, StubProducer};
use futures::TryStreamExt;

type Uow<N> = SnapshottingUnitOfWork<EventStoreUnitOfWork<inmemory::Store>, N>;

fn unit_of_work<N: Snapshotter>(store: &inmemory::Store, snapshotter: N) -> Uow<N> {
    SnapshottingUnitOfWork::new(EventStoreUnitOfWork::new(store.clone()), snapshotter, 5).unwrap()
}

/// Store `version` events for a fresh producer and return it replayed.
async fn loaded(store: &inmemory::Store, version: usize) -> Arc<Mutex<StubProducer>> {
    let id = ProducerId::new("stub", uuid::Uuid::new_v4().to_string());
    if version > 0 {
        let seeding = EventStoreUnitOfWork::new(store.clone());
        let mut history = StubProducer::with_id(id.clone());
        history.record(version);
        seeding.add(&Arc::new(Mutex::new(history))).unwrap();
        seeding.commit().try_collect::<Vec<_>>().await.unwrap();
    }

    let stream = store
        .stream(&Filter::new().filter_producer_ids([id.clone()]))
        .await
        .unwrap();
    let mut producer = StubProducer::with_id(id).snapshottable();
    producer.replay(&stream).unwrap();
    Arc::new(Mutex::new(producer))
}

async fn commit_from(from: usize, new_events: usize) -> Vec<(ProducerId, Option<u64>)> {
    let store = inmemory::Store::new();
    let snapshotter = RecordingSnapshotter::new();
    let uow = unit_of_work(&store, snapshotter.clone());
    let producer = loaded(&store, from).await;

    uow.add(&producer).unwrap();
    producer.lock().unwrap().record(new_events);
    uow.commit().try_collect::<Vec<_>>().await.unwrap();

    snapshotter.taken()
}

#[tokio::test]
async fn crossing_an_interval_takes_one_snapshot() {
    let taken = commit_from(4, 2).await;
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].1, Some(6));

    let taken = commit_from(9, 2).await;
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].1, Some(11));
}

#[tokio::test]
async fn staying_within_an_interval_takes_none() {
    assert!(commit_from(4, 0).await.is_empty());
    assert!(commit_from(5, 4).await.is_empty());
}

#[tokio::test]
async fn non_versionable_producers_are_never_snapshotted() {
    let store = inmemory::Store::new();
    let snapshotter = RecordingSnapshotter::new();
    let uow = unit_of_work(&store, snapshotter.clone());
    let mut producer = StubProducer::unversioned();
    producer.record(12);
    uow.add(&Arc::new(Mutex::new(producer))).unwrap();

    let committed: Vec<_> = uow.commit().try_collect().await.unwrap();

    assert_eq!(committed.len(), 1);
    assert!(snapshotter.taken().is_empty());
}

#[tokio::test]
async fn producers_added_after_raising_use_their_add_time_version() {
    let store = inmemory::Store::new();
    let snapshotter = RecordingSnapshotter::new();
    let uow = unit_of_work(&store, snapshotter.clone());
    let producer = loaded(&store, 4).await;
    producer.lock().unwrap().record(2);

    uow.add(&producer).unwrap();
    uow.commit().try_collect::<Vec<_>>().await.unwrap();

    assert!(snapshotter.taken().is_empty());
}

struct BrokenSnapshotter;

impl Snapshotter for BrokenSnapshotter {
    type Error = SnapshotError;

    fn take_snapshot<'a>(
        &'a self,
        producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let id = producer.lock().unwrap().producer_id().clone();
        std::future::ready(Err(SnapshotError::Unsupported(id)))
    }

    fn restore_to_snapshot<'a>(
        &'a self,
        _producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        std::future::ready(Ok(None))
    }
}

#[tokio::test]
async fn snapshot_failures_do_not_fail_the_commit() {
    let store = inmemory::Store::new();
    let uow = unit_of_work(&store, BrokenSnapshotter);
    let producer = loaded(&store, 4).await;
    uow.add(&producer).unwrap();
    producer.lock().unwrap().record(3);

    let committed: Vec<_> = uow.commit().try_collect().await.unwrap();

    assert_eq!(committed.len(), 1);
    assert_eq!(store.len(), 7);
    assert_eq!(uow.count(), 0);
}

#[tokio::test]
async fn repository_restores_snapshots_taken_on_commit() {
    let store = inmemory::Store::new();
    let snapshotter = RecordingSnapshotter::new();
    let id = loaded(&store, 4).await.lock().unwrap().producer_id().clone();
    let factory = |id: &ProducerId| StubProducer::with_id(id.clone()).snapshottable();

    let uow = Arc::new(unit_of_work(&store, snapshotter.clone()));
    let repository =
        Repository::new(store.clone(), uow, factory).with_snapshots(snapshotter.clone());
    let producer = repository.find(&id).await.unwrap().unwrap();
    producer.lock().unwrap().record(2);
    repository
        .unit_of_work()
        .commit()
        .try_collect::<Vec<_>>()
        .await
        .unwrap();

    assert_eq!(snapshotter.inner().get(&id).map(|s| s.version), Some(6));

    let fresh = Repository::new(
        store.clone(),
        Arc::new(EventStoreUnitOfWork::new(store)),
        factory,
    )
    .with_snapshots(snapshotter);
    let reloaded = fresh.find(&id).await.unwrap().unwrap();
    let reloaded = reloaded.lock().unwrap();
    assert_eq!(reloaded.tally(), 6);
    assert_eq!(reloaded.version(), Some(6));
}
