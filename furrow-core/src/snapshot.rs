//! Snapshot support for optimised producer loading.
//!
//! Snapshots persist producer state at a version, reducing the number of
//! events that need to be replayed when loading it. This module provides:
//!
//! - [`Snapshot`] - Point-in-time producer state
//! - [`Snapshottable`] - Capability of producers that can be captured
//! - [`Snapshotter`] - Trait for taking and restoring snapshots
//! - [`NullSnapshotter`] - No-op implementation; this is the default when
//!   [`Repository::with_snapshots`](crate::aggregate::Repository::with_snapshots)
//!   is not called
//! - [`inmemory`] - In-memory reference implementation

use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{id::ProducerId, sourced::SharedProducer};

pub mod inmemory;

/// Point-in-time snapshot of producer state.
///
/// The `version` field is the producer version when this snapshot was taken.
/// When loading a producer, only events after this version need to be
/// replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Producer version when this snapshot was taken.
    pub version: u64,
    /// Serialised state.
    pub state: Value,
}

/// Error raised while capturing or restoring a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("producer {0} does not support snapshots")]
    Unsupported(ProducerId),
    #[error("failed to encode snapshot state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode snapshot state: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Producers whose state can be captured and restored.
///
/// Only versionable producers expose this capability.
pub trait Snapshottable {
    /// # Errors
    ///
    /// Returns [`SnapshotError::Encode`] if the state cannot be serialised.
    fn to_snapshot(&self) -> Result<Snapshot, SnapshotError>;

    /// Replace the current state and version with the snapshot's.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Decode`] if the stored state does not match
    /// the producer's state type.
    fn restore(&mut self, snapshot: Snapshot) -> Result<(), SnapshotError>;
}

/// Takes and restores producer snapshots.
///
/// Producers that are not snapshottable are skipped silently by both
/// operations.
// ANCHOR: snapshotter_trait
pub trait Snapshotter: Send + Sync {
    /// Error type for snapshot operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Capture the producer's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if capturing or persisting the snapshot fails.
    fn take_snapshot<'a>(
        &'a self,
        producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Restore the latest snapshot into the producer in place.
    ///
    /// Returns the restored version, or `None` if there was nothing to
    /// restore.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or decoding the snapshot fails.
    fn restore_to_snapshot<'a>(
        &'a self,
        producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;
}
// ANCHOR_END: snapshotter_trait

/// No-op snapshotter.
///
/// This implementation:
/// - Never restores anything
/// - Silently discards every capture request
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSnapshotter;

impl Snapshotter for NullSnapshotter {
    type Error = Infallible;

    fn take_snapshot<'a>(
        &'a self,
        _producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        std::future::ready(Ok(()))
    }

    fn restore_to_snapshot<'a>(
        &'a self,
        _producer: &'a SharedProducer,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        std::future::ready(Ok(None))
    }
}
