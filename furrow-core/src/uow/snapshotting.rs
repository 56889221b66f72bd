//! Unit of work decorator capturing snapshots at version intervals.
//!
//! The version of every versionable producer is recorded when it is added.
//! Once the producer is committed, a snapshot is taken if the old and the new
//! version fall into different interval buckets, i.e. the producer crossed a
//! multiple of the interval.

use std::{
    collections::HashMap,
    num::NonZeroU64,
    sync::{Mutex, atomic::AtomicBool},
};

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use thiserror::Error;

use super::{CommitGuard, ObjectNotSupported, UnitOfWork, unwrap_producer};
use crate::{
    id::ProducerId,
    snapshot::Snapshotter,
    sourced::{SharedProducer, Trackable},
};

/// Returned when constructing a [`SnapshottingUnitOfWork`] with interval 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("snapshot interval must be positive, got {0}")]
pub struct InvalidInterval(pub u64);

/// Decorates a [`UnitOfWork`] with periodic snapshot capture.
pub struct SnapshottingUnitOfWork<U, N> {
    inner: U,
    snapshotter: N,
    interval: NonZeroU64,
    versions: Mutex<HashMap<ProducerId, u64>>,
    committing: AtomicBool,
}

impl<U, N> SnapshottingUnitOfWork<U, N> {
    /// # Errors
    ///
    /// Returns [`InvalidInterval`] if `interval` is 0.
    pub fn new(inner: U, snapshotter: N, interval: u64) -> Result<Self, InvalidInterval> {
        let interval = NonZeroU64::new(interval).ok_or(InvalidInterval(interval))?;
        Ok(Self {
            inner,
            snapshotter,
            interval,
            versions: Mutex::new(HashMap::new()),
            committing: AtomicBool::new(false),
        })
    }

    pub const fn inner(&self) -> &U {
        &self.inner
    }

    pub const fn snapshotter(&self) -> &N {
        &self.snapshotter
    }

    #[must_use]
    pub const fn interval(&self) -> u64 {
        self.interval.get()
    }

    const fn is_due(&self, before: u64, after: u64) -> bool {
        let interval = self.interval.get();
        before / interval != after / interval
    }

    fn versions(&self) -> std::sync::MutexGuard<'_, HashMap<ProducerId, u64>> {
        self.versions
            .lock()
            .expect("snapshot versions lock poisoned")
    }
}

impl<U, N> SnapshottingUnitOfWork<U, N>
where
    U: UnitOfWork,
    N: Snapshotter,
{
    async fn snapshot_if_due(&self, producer: &SharedProducer) {
        let (id, after) = {
            let producer = producer.lock().expect("producer lock poisoned");
            (producer.producer_id().clone(), producer.version())
        };
        let Some(after) = after else {
            return;
        };
        let before = self.versions().remove(&id);
        let Some(before) = before else {
            return;
        };
        if !self.is_due(before, after) {
            tracing::trace!(producer_id = %id, before, after, "snapshot not due");
            return;
        }

        match self.snapshotter.take_snapshot(producer).await {
            Ok(()) => tracing::debug!(producer_id = %id, before, after, "snapshot taken"),
            Err(err) => tracing::warn!(
                producer_id = %id,
                error = %err,
                "failed to take snapshot after commit"
            ),
        }
    }

    fn forget_untracked(&self) {
        let tracked: Vec<ProducerId> = self
            .inner
            .uncommitted()
            .iter()
            .map(|producer| {
                producer
                    .lock()
                    .expect("producer lock poisoned")
                    .producer_id()
                    .clone()
            })
            .collect();
        self.versions().retain(|id, _| tracked.contains(id));
    }
}

impl<U, N> UnitOfWork for SnapshottingUnitOfWork<U, N>
where
    U: UnitOfWork,
    N: Snapshotter,
{
    type Error = U::Error;

    fn add(&self, object: &dyn Trackable) -> Result<(), ObjectNotSupported> {
        let newly_tracked = !self.inner.has(object);
        self.inner.add(object)?;
        if newly_tracked
            && let Some((id, producer)) = unwrap_producer(object)
            && let Some(version) = producer.lock().expect("producer lock poisoned").version()
        {
            self.versions().insert(id, version);
        }
        Ok(())
    }

    fn remove(&self, object: &dyn Trackable) {
        if let Some((id, _)) = unwrap_producer(object) {
            self.versions().remove(&id);
        }
        self.inner.remove(object);
    }

    fn has(&self, object: &dyn Trackable) -> bool {
        self.inner.has(object)
    }

    fn uncommitted(&self) -> Vec<SharedProducer> {
        self.inner.uncommitted()
    }

    fn count(&self) -> usize {
        self.inner.count()
    }

    fn commit(&self) -> BoxStream<'_, Result<SharedProducer, Self::Error>> {
        let Some(guard) = CommitGuard::acquire(&self.committing) else {
            return stream::empty().boxed();
        };

        stream::try_unfold(
            (guard, self.inner.commit()),
            move |(guard, mut committed)| async move {
                match committed.next().await {
                    Some(Ok(producer)) => {
                        self.snapshot_if_due(&producer).await;
                        Ok(Some((producer, (guard, committed))))
                    }
                    Some(Err(err)) => {
                        self.forget_untracked();
                        Err(err)
                    }
                    None => {
                        self.forget_untracked();
                        Ok(None)
                    }
                }
            },
        )
        .boxed()
    }

    fn clear(&self) {
        self.versions().clear();
        self.inner.clear();
    }
}
