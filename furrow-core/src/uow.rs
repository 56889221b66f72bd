//! Unit of work: staged commits of event-sourced producers.
//!
//! A unit of work tracks producers with pending events and flushes them to an
//! [`EventStore`] one producer at a time, in the order they were added. The
//! commit is a lazy stream: each producer is emitted as soon as its batch is
//! durable, so callers observe partial progress before a later failure.
//!
//! Failure handling:
//!
//! - A store error stops the commit; the failing producer stays tracked for a
//!   caller-driven retry. Producers already emitted are not retried.
//! - A [`ConcurrentWriteDetected`] conflict also stops the commit, but evicts
//!   the failing producer: its state is stale and must be reloaded.
//!
//! Calling [`UnitOfWork::commit`] while a commit of the same unit is still
//! running yields an empty stream.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    concurrency::ConcurrentWriteDetected,
    id::ProducerId,
    sourced::{SharedProducer, Trackable},
    store::{AppendError, EventStore},
};

pub mod snapshotting;

/// Returned by [`UnitOfWork::add`] for objects without the event-sourced
/// capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("object of type `{type_name}` is not supported by the unit of work")]
pub struct ObjectNotSupported {
    pub type_name: &'static str,
}

impl ObjectNotSupported {
    #[must_use]
    pub fn of(object: &dyn Trackable) -> Self {
        Self {
            type_name: object.type_name(),
        }
    }
}

/// Error surfaced by [`EventStoreUnitOfWork::commit`].
#[derive(Debug, Error)]
pub enum CommitError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// The store rejected the batch; the producer was evicted.
    #[error(transparent)]
    ConcurrentWrite(ConcurrentWriteDetected),
    /// The store failed; the producer is still tracked.
    #[error(transparent)]
    Store(StoreError),
}

/// Transactional staging area for event-sourced producers.
pub trait UnitOfWork: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start tracking `object`. Adding a tracked producer again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectNotSupported`] if `object` is not event-sourced.
    fn add(&self, object: &dyn Trackable) -> Result<(), ObjectNotSupported>;

    /// Stop tracking `object`. Unknown and unsupported objects are ignored.
    fn remove(&self, object: &dyn Trackable);

    fn has(&self, object: &dyn Trackable) -> bool;

    /// Tracked producers in insertion order.
    fn uncommitted(&self) -> Vec<SharedProducer>;

    fn count(&self) -> usize;

    /// Flush tracked producers, emitting each one once its events are stored.
    fn commit(&self) -> BoxStream<'_, Result<SharedProducer, Self::Error>>;

    /// Stop tracking everything without committing.
    fn clear(&self);
}

/// Extract the producer behind `object` together with its id.
pub(crate) fn unwrap_producer(object: &dyn Trackable) -> Option<(ProducerId, SharedProducer)> {
    let producer = object.event_sourced()?;
    let id = producer
        .lock()
        .expect("producer lock poisoned")
        .producer_id()
        .clone();
    Some((id, producer))
}

/// Resets the committing flag when the commit stream finishes or is dropped.
pub(crate) struct CommitGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CommitGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct Tracked {
    id: ProducerId,
    producer: SharedProducer,
}

/// Unit of work appending directly to an [`EventStore`].
pub struct EventStoreUnitOfWork<S> {
    store: S,
    tracked: Mutex<Vec<Tracked>>,
    committing: AtomicBool,
}

impl<S> EventStoreUnitOfWork<S> {
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self {
            store,
            tracked: Mutex::new(Vec::new()),
            committing: AtomicBool::new(false),
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    fn is_tracked(&self, id: &ProducerId) -> bool {
        self.tracked
            .lock()
            .expect("unit of work lock poisoned")
            .iter()
            .any(|entry| &entry.id == id)
    }

    fn untrack(&self, id: &ProducerId) {
        self.tracked
            .lock()
            .expect("unit of work lock poisoned")
            .retain(|entry| &entry.id != id);
    }
}

impl<S> fmt::Debug for EventStoreUnitOfWork<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked: Vec<_> = self
            .tracked
            .lock()
            .expect("unit of work lock poisoned")
            .iter()
            .map(|entry| entry.id.clone())
            .collect();
        f.debug_struct("EventStoreUnitOfWork")
            .field("tracked", &tracked)
            .field("committing", &self.committing.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> UnitOfWork for EventStoreUnitOfWork<S> {
    type Error = CommitError<S::Error>;

    fn add(&self, object: &dyn Trackable) -> Result<(), ObjectNotSupported> {
        let (id, producer) =
            unwrap_producer(object).ok_or_else(|| ObjectNotSupported::of(object))?;
        let mut tracked = self.tracked.lock().expect("unit of work lock poisoned");
        if !tracked.iter().any(|entry| entry.id == id) {
            tracing::trace!(producer_id = %id, "tracking producer");
            tracked.push(Tracked { id, producer });
        }
        Ok(())
    }

    fn remove(&self, object: &dyn Trackable) {
        if let Some((id, _)) = unwrap_producer(object) {
            self.untrack(&id);
        }
    }

    fn has(&self, object: &dyn Trackable) -> bool {
        unwrap_producer(object).is_some_and(|(id, _)| self.is_tracked(&id))
    }

    fn uncommitted(&self) -> Vec<SharedProducer> {
        self.tracked
            .lock()
            .expect("unit of work lock poisoned")
            .iter()
            .map(|entry| entry.producer.clone())
            .collect()
    }

    fn count(&self) -> usize {
        self.tracked.lock().expect("unit of work lock poisoned").len()
    }

    fn commit(&self) -> BoxStream<'_, Result<SharedProducer, Self::Error>> {
        let Some(guard) = CommitGuard::acquire(&self.committing) else {
            tracing::debug!("commit already in progress, ignoring nested commit");
            return stream::empty().boxed();
        };
        let pending: VecDeque<Tracked> = self
            .tracked
            .lock()
            .expect("unit of work lock poisoned")
            .iter()
            .cloned()
            .collect();
        tracing::debug!(producers = pending.len(), "committing unit of work");

        stream::try_unfold((guard, pending), move |(guard, mut pending)| async move {
            while let Some(Tracked { id, producer }) = pending.pop_front() {
                if !self.is_tracked(&id) {
                    continue;
                }

                let (events, expected_version) = {
                    let producer = producer.lock().expect("producer lock poisoned");
                    let events = producer.events();
                    let expected = producer
                        .version()
                        .map(|version| version.saturating_sub(events.len() as u64));
                    (events, expected)
                };
                let Some(batch) = NonEmpty::from_vec(events) else {
                    tracing::trace!(producer_id = %id, "nothing to commit");
                    self.untrack(&id);
                    continue;
                };
                let event_count = batch.len();

                match self.store.add(&id, expected_version, batch).await {
                    Ok(()) => {
                        producer.lock().expect("producer lock poisoned").commit();
                        self.untrack(&id);
                        tracing::debug!(producer_id = %id, event_count, "producer committed");
                        return Ok(Some((producer, (guard, pending))));
                    }
                    Err(AppendError::Conflict(conflict)) => {
                        self.untrack(&id);
                        tracing::warn!(
                            producer_id = %id,
                            ?expected_version,
                            actual = conflict.actual,
                            "concurrent write detected, producer evicted"
                        );
                        return Err(CommitError::ConcurrentWrite(conflict));
                    }
                    Err(AppendError::Store(err)) => {
                        tracing::warn!(
                            producer_id = %id,
                            error = %err,
                            "append failed, producer kept for retry"
                        );
                        return Err(CommitError::Store(err));
                    }
                }
            }
            Ok(None)
        })
        .boxed()
    }

    fn clear(&self) {
        self.tracked.lock().expect("unit of work lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::TryStreamExt;

    use super::*;
    use crate::{
        sourced::EventSourced,
        store::{Filter, inmemory},
        test::StubProducer,
    };

    struct Plain;

    impl Trackable for Plain {}

    fn producer(events: usize) -> Arc<Mutex<StubProducer>> {
        let mut producer = StubProducer::versioned();
        producer.record(events);
        Arc::new(Mutex::new(producer))
    }

    #[test]
    fn add_is_idempotent_and_preserves_order() {
        let uow = EventStoreUnitOfWork::new(inmemory::Store::new());
        let first = producer(1);
        let second = producer(1);

        uow.add(&first).unwrap();
        uow.add(&second).unwrap();
        uow.add(&first).unwrap();

        assert_eq!(uow.count(), 2);
        let ids: Vec<_> = uow
            .uncommitted()
            .iter()
            .map(|p| p.lock().unwrap().producer_id().clone())
            .collect();
        assert_eq!(
            ids,
            vec![
                first.lock().unwrap().producer_id().clone(),
                second.lock().unwrap().producer_id().clone()
            ]
        );
    }

    #[test]
    fn unsupported_objects_are_rejected_only_by_add() {
        let uow = EventStoreUnitOfWork::new(inmemory::Store::new());

        let err = uow.add(&Plain).unwrap_err();
        assert!(err.type_name.ends_with("Plain"));

        uow.remove(&Plain);
        assert!(!uow.has(&Plain));
        assert_eq!(uow.count(), 0);
    }

    #[test]
    fn remove_and_clear_untrack() {
        let uow = EventStoreUnitOfWork::new(inmemory::Store::new());
        let first = producer(1);
        let second = producer(1);
        uow.add(&first).unwrap();
        uow.add(&second).unwrap();

        uow.remove(&first);
        assert!(!uow.has(&first));
        assert!(uow.has(&second));

        uow.clear();
        assert_eq!(uow.count(), 0);
    }

    #[tokio::test]
    async fn commit_appends_and_clears_pending_events() {
        let store = inmemory::Store::new();
        let uow = EventStoreUnitOfWork::new(store.clone());
        let first = producer(2);
        uow.add(&first).unwrap();

        let committed: Vec<_> = uow.commit().try_collect().await.unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(store.len(), 2);
        assert!(first.lock().unwrap().events().is_empty());
        assert!(!uow.has(&first));
        let stream = store.stream(&Filter::new()).await.unwrap();
        assert_eq!(stream.last().and_then(|e| e.version()), Some(2));
    }

    #[tokio::test]
    async fn producers_without_events_are_untracked_but_not_emitted() {
        let store = inmemory::Store::new();
        let uow = EventStoreUnitOfWork::new(store.clone());
        let idle = producer(0);
        uow.add(&idle).unwrap();

        let committed: Vec<_> = uow.commit().try_collect().await.unwrap();

        assert!(committed.is_empty());
        assert!(!uow.has(&idle));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn nested_commit_is_a_no_op() {
        let uow = EventStoreUnitOfWork::new(inmemory::Store::new());
        let first = producer(1);
        let second = producer(1);
        uow.add(&first).unwrap();
        uow.add(&second).unwrap();

        let mut outer = uow.commit();
        outer.try_next().await.unwrap().unwrap();

        let nested: Vec<_> = uow.commit().try_collect().await.unwrap();
        assert!(nested.is_empty());
        assert!(uow.has(&second));

        assert!(outer.try_next().await.unwrap().is_some());
        assert!(outer.try_next().await.unwrap().is_none());
        drop(outer);

        let third = producer(1);
        uow.add(&third).unwrap();
        let after: Vec<_> = uow.commit().try_collect().await.unwrap();
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn stale_producer_conflicts_and_is_evicted() {
        let store = inmemory::Store::new();
        let uow = EventStoreUnitOfWork::new(store.clone());
        let original = producer(1);
        let id = original.lock().unwrap().producer_id().clone();
        uow.add(&original).unwrap();
        uow.commit().try_collect::<Vec<_>>().await.unwrap();

        let mut stale = StubProducer::with_id(id.clone());
        stale.record(1);
        let stale = Arc::new(Mutex::new(stale));
        uow.add(&stale).unwrap();

        let Err(CommitError::ConcurrentWrite(conflict)) =
            uow.commit().try_collect::<Vec<_>>().await
        else {
            panic!("expected the stale producer to conflict");
        };
        assert_eq!(conflict.id(), &id);
        assert!(!uow.has(&stale));
        assert_eq!(store.len(), 1);
    }
}
