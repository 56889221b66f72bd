//! Persistence layer abstractions.
//!
//! This module describes the storage contract ([`EventStore`]), the filter
//! used to select streams ([`Filter`]), the materialised result of a query
//! ([`EventStream`]) and a reference in-memory implementation. The store is
//! the sole authority on optimistic concurrency: it compares the expected
//! version of each per-producer batch and raises
//! [`ConcurrentWriteDetected`] on mismatch.

pub use nonempty::NonEmpty;
use thiserror::Error;

pub use crate::concurrency::ConcurrentWriteDetected;
use crate::{envelope::Envelope, id::ProducerId};

pub mod inmemory;

/// Error from append operations with version checking.
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// Concurrency conflict - another writer modified the stream.
    #[error(transparent)]
    Conflict(#[from] ConcurrentWriteDetected),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error + 'static> AppendError<StoreError> {
    /// Create a store error variant.
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Filter describing which envelopes should be streamed from the store.
///
/// An empty filter matches everything. Restrictions on producer ids and
/// producer types combine with AND; values within one restriction combine
/// with OR.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub producer_ids: Vec<ProducerId>,
    pub producer_types: Vec<String>,
    /// Only stream envelopes with a version strictly greater than this value.
    /// Used for snapshot-based loading to skip already-applied events.
    pub after_version: Option<u64>,
}

impl Filter {
    /// A filter matching every envelope in the store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter_producer_ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = ProducerId>,
    {
        for id in ids {
            if !self.producer_ids.contains(&id) {
                self.producer_ids.push(id);
            }
        }
        self
    }

    #[must_use]
    pub fn filter_producer_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for producer_type in types {
            let producer_type = producer_type.into();
            if !self.producer_types.contains(&producer_type) {
                self.producer_types.push(producer_type);
            }
        }
        self
    }

    /// Only stream envelopes with a version strictly greater than `version`.
    #[must_use]
    pub const fn after_version(mut self, version: u64) -> Self {
        self.after_version = Some(version);
        self
    }

    #[must_use]
    pub fn matches(&self, envelope: &Envelope) -> bool {
        let id_matches =
            self.producer_ids.is_empty() || self.producer_ids.contains(envelope.producer_id());
        let type_matches = self.producer_types.is_empty()
            || self
                .producer_types
                .iter()
                .any(|producer_type| producer_type == envelope.producer_type());
        let version_matches = self
            .after_version
            .is_none_or(|after| envelope.version().is_some_and(|version| version > after));
        id_matches && type_matches && version_matches
    }
}

/// Ordered sequence of envelopes returned by [`EventStore::stream`].
///
/// Envelopes of one producer appear in append order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventStream {
    envelopes: Vec<Envelope>,
}

impl EventStream {
    #[must_use]
    pub const fn new(envelopes: Vec<Envelope>) -> Self {
        Self { envelopes }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    #[must_use]
    pub fn first(&self) -> Option<&Envelope> {
        self.envelopes.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Envelope> {
        self.envelopes.last()
    }

    /// Keep only envelopes whose name is one of `kinds`.
    #[must_use]
    pub fn only(self, kinds: &[&str]) -> Self {
        Self {
            envelopes: self
                .envelopes
                .into_iter()
                .filter(|envelope| kinds.contains(&envelope.name()))
                .collect(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Envelope> {
        self.envelopes.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Envelope] {
        &self.envelopes
    }
}

impl From<Vec<Envelope>> for EventStream {
    fn from(envelopes: Vec<Envelope>) -> Self {
        Self::new(envelopes)
    }
}

impl FromIterator<Envelope> for EventStream {
    fn from_iter<T: IntoIterator<Item = Envelope>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for EventStream {
    type IntoIter = std::vec::IntoIter<Envelope>;
    type Item = Envelope;

    fn into_iter(self) -> Self::IntoIter {
        self.envelopes.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventStream {
    type IntoIter = std::slice::Iter<'a, Envelope>;
    type Item = &'a Envelope;

    fn into_iter(self) -> Self::IntoIter {
        self.envelopes.iter()
    }
}

/// Abstraction over the persistence layer for event streams.
///
/// Backends are interchangeable: SQL, file-based and in-memory stores all
/// implement this contract. Within one producer's stream, envelopes are
/// returned in append order.
// ANCHOR: event_store_trait
pub trait EventStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append a batch of envelopes for one producer atomically.
    ///
    /// If `expected_version` is `Some`, the append fails with a
    /// [`ConcurrentWriteDetected`] conflict unless the producer's stream is
    /// currently at exactly that version (`Some(0)` expects a new stream).
    /// If it is `None`, no version checking is performed.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if the version doesn't match, or
    /// [`AppendError::Store`] if persistence fails.
    fn add<'a>(
        &'a self,
        producer_id: &'a ProducerId,
        expected_version: Option<u64>,
        envelopes: NonEmpty<Envelope>,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a;

    /// Load the envelopes matching `filter`, in store order.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn stream<'a>(
        &'a self,
        filter: &'a Filter,
    ) -> impl Future<Output = Result<EventStream, Self::Error>> + Send + 'a;
}
// ANCHOR_END: event_store_trait
