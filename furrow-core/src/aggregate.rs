//! Loading aggregates and registering them for commit.
//!
//! An aggregate is any [`EventSourced`] producer addressed by a
//! [`ProducerId`]. The [`Repository`] builds an empty instance through a
//! factory, restores the latest snapshot if one exists, replays the events
//! recorded after it and hands the aggregate to a [`UnitOfWork`]. Nothing is
//! written until the unit of work commits.
//!
//! Snapshot support is opt-in via [`Repository::with_snapshots`]. Without it,
//! [`NullSnapshotter`] is used and every load replays the full stream.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use thiserror::Error;

use crate::{
    id::ProducerId,
    snapshot::{NullSnapshotter, Snapshotter},
    sourced::{EventSourced, ReplayError, SharedProducer},
    store::{EventStore, Filter},
    uow::{ObjectNotSupported, UnitOfWork},
};

/// Error returned by [`Repository::find`].
#[derive(Debug, Error)]
pub enum LoadError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("failed to load events: {0}")]
    Store(#[source] StoreError),
    #[error("failed to rebuild aggregate state: {0}")]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    ObjectNotSupported(#[from] ObjectNotSupported),
}

type Factory<P> = Box<dyn Fn(&ProducerId) -> P + Send + Sync>;

/// Repository of aggregates of type `P`.
pub struct Repository<P, S, U, N = NullSnapshotter> {
    store: S,
    uow: Arc<U>,
    snapshotter: N,
    factory: Factory<P>,
}

impl<P, S, U> Repository<P, S, U>
where
    P: EventSourced + 'static,
    S: EventStore,
    U: UnitOfWork,
{
    /// `factory` builds an empty aggregate carrying the given id.
    pub fn new<F>(store: S, uow: Arc<U>, factory: F) -> Self
    where
        F: Fn(&ProducerId) -> P + Send + Sync + 'static,
    {
        Self {
            store,
            uow,
            snapshotter: NullSnapshotter,
            factory: Box::new(factory),
        }
    }
}

impl<P, S, U, N> Repository<P, S, U, N>
where
    P: EventSourced + 'static,
    S: EventStore,
    U: UnitOfWork,
    N: Snapshotter,
{
    /// Restore aggregates from `snapshotter` before replaying.
    #[must_use]
    pub fn with_snapshots<M: Snapshotter>(self, snapshotter: M) -> Repository<P, S, U, M> {
        Repository {
            store: self.store,
            uow: self.uow,
            snapshotter,
            factory: self.factory,
        }
    }

    #[must_use]
    pub const fn event_store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub const fn unit_of_work(&self) -> &Arc<U> {
        &self.uow
    }

    /// Load the aggregate `id` and register it with the unit of work.
    ///
    /// Returns `None` if neither a snapshot nor any event exists. A snapshot
    /// that cannot be restored is logged and ignored; the aggregate is then
    /// rebuilt from its full stream.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the store cannot be read or the stream does
    /// not belong to the aggregate.
    #[tracing::instrument(skip(self, id), fields(producer_id = %id))]
    pub async fn find(
        &self,
        id: &ProducerId,
    ) -> Result<Option<Arc<Mutex<P>>>, LoadError<S::Error>> {
        let producer = Arc::new(Mutex::new((self.factory)(id)));
        let shared: SharedProducer = producer.clone();

        let restored = match self.snapshotter.restore_to_snapshot(&shared).await {
            Ok(restored) => restored,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "failed to restore snapshot, falling back to full replay"
                );
                *producer.lock().expect("producer lock poisoned") = (self.factory)(id);
                None
            }
        };

        let mut filter = Filter::new().filter_producer_ids([id.clone()]);
        if let Some(version) = restored {
            filter = filter.after_version(version);
        }
        let stream = self.store.stream(&filter).await.map_err(LoadError::Store)?;
        if restored.is_none() && stream.is_empty() {
            tracing::trace!("aggregate not found");
            return Ok(None);
        }

        producer
            .lock()
            .expect("producer lock poisoned")
            .replay(&stream)?;
        self.uow.add(&producer)?;
        tracing::debug!(snapshot = ?restored, replayed = stream.len(), "aggregate loaded");
        Ok(Some(producer))
    }

    /// Whether any event was ever stored for `id`.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the stream cannot be read.
    pub async fn has(&self, id: &ProducerId) -> Result<bool, S::Error> {
        let filter = Filter::new().filter_producer_ids([id.clone()]);
        Ok(!self.store.stream(&filter).await?.is_empty())
    }

    /// Register a new aggregate with the unit of work.
    ///
    /// # Errors
    ///
    /// Propagates [`ObjectNotSupported`] from the unit of work.
    pub fn add(&self, producer: &Arc<Mutex<P>>) -> Result<(), ObjectNotSupported> {
        self.uow.add(producer)
    }
}

impl<P, S: fmt::Debug, U, N: fmt::Debug> fmt::Debug for Repository<P, S, U, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("store", &self.store)
            .field("snapshotter", &self.snapshotter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::{snapshot::inmemory, store, test::StubProducer, uow::EventStoreUnitOfWork};

    type Store = store::inmemory::Store;
    type Uow = EventStoreUnitOfWork<Store>;

    fn repository(store: &Store) -> Repository<StubProducer, Store, Uow> {
        let uow = Arc::new(EventStoreUnitOfWork::new(store.clone()));
        Repository::new(store.clone(), uow, |id: &ProducerId| {
            StubProducer::with_id(id.clone()).snapshottable()
        })
    }

    async fn seed(store: &Store, id: &ProducerId, events: usize) {
        let uow = EventStoreUnitOfWork::new(store.clone());
        let mut producer = StubProducer::with_id(id.clone());
        producer.record(events);
        uow.add(&Arc::new(Mutex::new(producer))).unwrap();
        uow.commit().try_collect::<Vec<_>>().await.unwrap();
    }

    #[tokio::test]
    async fn find_returns_none_for_unknown_aggregate() {
        let store = Store::new();
        let repository = repository(&store);
        let id = ProducerId::new("stub", "missing");

        assert!(repository.find(&id).await.unwrap().is_none());
        assert!(!repository.has(&id).await.unwrap());
        assert_eq!(repository.unit_of_work().count(), 0);
    }

    #[tokio::test]
    async fn find_replays_and_tracks_the_aggregate() {
        let store = Store::new();
        let repository = repository(&store);
        let id = ProducerId::new("stub", "1");
        seed(&store, &id, 3).await;

        let found = repository.find(&id).await.unwrap().unwrap();

        assert!(repository.has(&id).await.unwrap());
        assert!(repository.unit_of_work().has(&found));
        let found = found.lock().unwrap();
        assert_eq!(found.tally(), 3);
        assert_eq!(found.version(), Some(3));
        assert!(found.events().is_empty());
    }

    #[tokio::test]
    async fn snapshot_alone_is_enough_to_find() {
        let store = Store::new();
        let snapshotter = inmemory::Snapshotter::new();
        let id = ProducerId::new("stub", "1");
        let mut original = StubProducer::with_id(id.clone()).snapshottable();
        original.record(2);
        let original: SharedProducer = Arc::new(Mutex::new(original));
        snapshotter.take_snapshot(&original).await.unwrap();

        let repository = repository(&store).with_snapshots(snapshotter);
        let found = repository.find(&id).await.unwrap().unwrap();

        let found = found.lock().unwrap();
        assert_eq!(found.tally(), 2);
        assert_eq!(found.version(), Some(2));
    }

    #[tokio::test]
    async fn only_events_after_the_snapshot_are_replayed() {
        let store = Store::new();
        let snapshotter = inmemory::Snapshotter::new();
        let id = ProducerId::new("stub", "1");
        seed(&store, &id, 3).await;

        let repository = repository(&store).with_snapshots(snapshotter.clone());
        let loaded = repository.find(&id).await.unwrap().unwrap();
        let shared: SharedProducer = loaded.clone();
        snapshotter.take_snapshot(&shared).await.unwrap();
        loaded.lock().unwrap().record(2);
        repository
            .unit_of_work()
            .commit()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();

        let reloaded = repository.find(&id).await.unwrap().unwrap();

        let reloaded = reloaded.lock().unwrap();
        assert_eq!(reloaded.tally(), 5);
        assert_eq!(reloaded.version(), Some(5));
        assert_eq!(reloaded.last_replayed().and_then(|e| e.version()), Some(5));
    }

    #[tokio::test]
    async fn add_registers_new_aggregates() {
        let store = Store::new();
        let repository = repository(&store);
        let mut fresh = StubProducer::with_id(ProducerId::new("stub", "new"));
        fresh.record(1);
        let fresh = Arc::new(Mutex::new(fresh));

        repository.add(&fresh).unwrap();
        repository
            .unit_of_work()
            .commit()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
    }
}
