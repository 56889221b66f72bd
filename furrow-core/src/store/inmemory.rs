//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) suitable for unit tests and examples.
//!
//! # Example
//!
//! ```
//! use furrow_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! assert_eq!(store.len(), 0);
//! ```

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;

use crate::{
    concurrency::ConcurrentWriteDetected,
    envelope::Envelope,
    id::ProducerId,
    store::{AppendError, EventStore, EventStream, Filter},
};

/// In-memory event store keeping every envelope in global append order.
///
/// A per-producer counter tracks the stream length, which is the version the
/// expected-version check compares against. Cloning the store shares the
/// underlying data.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    envelopes: Vec<Envelope>,
    versions: HashMap<ProducerId, u64>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("in-memory store lock poisoned")
            .envelopes
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of envelopes stored for `producer_id`.
    #[must_use]
    pub fn version(&self, producer_id: &ProducerId) -> u64 {
        self.inner
            .read()
            .expect("in-memory store lock poisoned")
            .versions
            .get(producer_id)
            .copied()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("len", &self.len()).finish()
    }
}

impl EventStore for Store {
    type Error = Infallible;

    #[tracing::instrument(
        skip(self, producer_id, envelopes),
        fields(%producer_id, event_count = envelopes.len())
    )]
    fn add<'a>(
        &'a self,
        producer_id: &'a ProducerId,
        expected_version: Option<u64>,
        envelopes: NonEmpty<Envelope>,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a {
        let result = (|| {
            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let current = inner.versions.get(producer_id).copied().unwrap_or_default();

            if let Some(expected) = expected_version
                && expected != current
            {
                tracing::debug!(expected, current, "version mismatch, rejecting append");
                return Err(ConcurrentWriteDetected::new(
                    producer_id.clone(),
                    Some(expected),
                    current,
                )
                .into());
            }

            let appended = envelopes.len() as u64;
            inner.envelopes.extend(envelopes);
            inner.versions.insert(producer_id.clone(), current + appended);
            drop(inner);
            tracing::debug!(events_appended = appended, "events appended to stream");
            Ok(())
        })();

        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, filter))]
    fn stream<'a>(
        &'a self,
        filter: &'a Filter,
    ) -> impl Future<Output = Result<EventStream, Self::Error>> + Send + 'a {
        let stream: EventStream = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .envelopes
                .iter()
                .filter(|envelope| filter.matches(envelope))
                .cloned()
                .collect()
        };
        tracing::trace!(events_loaded = stream.len(), "loaded events from store");
        std::future::ready(Ok(stream))
    }
}
