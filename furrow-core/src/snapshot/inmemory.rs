//! In-memory snapshot store implementation.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use super::{Snapshot, SnapshotError, Snapshotter as SnapshotterTrait};
use crate::{id::ProducerId, sourced::SharedProducer};

type SharedSnapshots = Arc<RwLock<HashMap<ProducerId, Snapshot>>>;

/// In-memory snapshotter keyed by producer id.
///
/// This is a reference implementation suitable for testing and development.
/// Only the newest snapshot of each producer is kept; a capture at an older
/// or equal version than the stored one is ignored. Cloning shares the
/// underlying map.
///
/// # Example
///
/// ```
/// use furrow_core::snapshot::inmemory;
///
/// let snapshotter = inmemory::Snapshotter::new();
/// assert!(snapshotter.is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct Snapshotter {
    snapshots: SharedSnapshots,
}

impl Snapshotter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, producer_id: &ProducerId) -> Option<Snapshot> {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(producer_id)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capture(&self, producer: &SharedProducer) -> Result<(), SnapshotError> {
        let (producer_id, snapshot) = {
            let producer = producer.lock().expect("producer lock poisoned");
            let Some(snapshottable) = producer.as_snapshottable() else {
                tracing::trace!(
                    producer_id = %producer.producer_id(),
                    "producer is not snapshottable"
                );
                return Ok(());
            };
            (producer.producer_id().clone(), snapshottable.to_snapshot()?)
        };

        let version = snapshot.version;
        let stored = {
            let mut snapshots = self
                .snapshots
                .write()
                .expect("snapshot store lock poisoned");
            match snapshots.get(&producer_id) {
                Some(existing) if existing.version >= version => false,
                _ => {
                    snapshots.insert(producer_id.clone(), snapshot);
                    true
                }
            }
        };
        tracing::debug!(%producer_id, version, stored, "snapshot captured");
        Ok(())
    }

    fn restore(&self, producer: &SharedProducer) -> Result<Option<u64>, SnapshotError> {
        let mut producer = producer.lock().expect("producer lock poisoned");
        let Some(snapshot) = self.get(producer.producer_id()) else {
            return Ok(None);
        };
        let Some(snapshottable) = producer.as_snapshottable_mut() else {
            return Ok(None);
        };
        let version = snapshot.version;
        snapshottable.restore(snapshot)?;
        tracing::trace!(version, "snapshot restored");
        Ok(Some(version))
    }
}

impl SnapshotterTrait for Snapshotter {
    type Error = SnapshotError;

    #[tracing::instrument(skip_all)]
    fn take_snapshot<'a>(
        &'a self,
        producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        std::future::ready(self.capture(producer))
    }

    #[tracing::instrument(skip_all)]
    fn restore_to_snapshot<'a>(
        &'a self,
        producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        std::future::ready(self.restore(producer))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        event::{DomainEvent, Handlers},
        sourced::{EventSourced, Sourced, State},
        test::StubProducer,
    };

    #[derive(Debug)]
    struct Visited;

    impl DomainEvent for Visited {
        const KIND: &'static str = "visited";
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Visits(u32);

    impl State for Visits {
        fn handlers() -> Handlers<Self> {
            Handlers::new().on(|visits: &mut Self, _: &Visited| visits.0 += 1)
        }
    }

    fn page(id: &ProducerId, visits: u32) -> Arc<Mutex<Sourced<Visits>>> {
        let mut page = Sourced::<Visits>::versioned(id.clone()).with_snapshots();
        for _ in 0..visits {
            page.raise(Visited);
        }
        Arc::new(Mutex::new(page))
    }

    #[tokio::test]
    async fn restore_returns_none_for_missing() {
        let snapshotter = Snapshotter::new();
        let producer: SharedProducer = page(&ProducerId::random(), 0);
        assert_eq!(snapshotter.restore_to_snapshot(&producer).await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_then_restore_round_trips_state() {
        let snapshotter = Snapshotter::new();
        let id = ProducerId::random();
        let original: SharedProducer = page(&id, 3);
        snapshotter.take_snapshot(&original).await.unwrap();

        let fresh = page(&id, 0);
        let shared: SharedProducer = fresh.clone();
        let restored = snapshotter.restore_to_snapshot(&shared).await.unwrap();

        assert_eq!(restored, Some(3));
        let fresh = fresh.lock().unwrap();
        assert_eq!(fresh.state().0, 3);
        assert_eq!(fresh.version(), Some(3));
    }

    #[tokio::test]
    async fn older_snapshots_do_not_replace_newer_ones() {
        let snapshotter = Snapshotter::new();
        let id = ProducerId::random();

        let newer: SharedProducer = page(&id, 5);
        let older: SharedProducer = page(&id, 2);
        snapshotter.take_snapshot(&newer).await.unwrap();
        snapshotter.take_snapshot(&older).await.unwrap();

        assert_eq!(snapshotter.get(&id).map(|s| s.version), Some(5));
    }

    #[tokio::test]
    async fn non_snapshottable_producers_are_skipped() {
        let snapshotter = Snapshotter::new();
        let producer: SharedProducer = Arc::new(Mutex::new(StubProducer::unversioned()));

        snapshotter.take_snapshot(&producer).await.unwrap();

        assert!(snapshotter.is_empty());
        assert_eq!(snapshotter.restore_to_snapshot(&producer).await.unwrap(), None);
    }
}
