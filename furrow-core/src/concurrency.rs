//! Optimistic concurrency failures.
//!
//! Event stores own the expected-version check. When another writer appended
//! to a producer's stream after it was loaded, the store rejects the batch
//! with [`ConcurrentWriteDetected`]. Units of work evict the producer instead
//! of keeping it for a retry: the caller has to reload fresh state.

use std::fmt;

use crate::id::ProducerId;

/// Error indicating a concurrency conflict during append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrentWriteDetected {
    /// Producer whose stream was modified concurrently.
    pub producer_id: ProducerId,
    /// The version the writer expected. `None` means no check was requested.
    pub expected: Option<u64>,
    /// The version found in the store.
    pub actual: u64,
}

impl ConcurrentWriteDetected {
    #[must_use]
    pub const fn new(producer_id: ProducerId, expected: Option<u64>, actual: u64) -> Self {
        Self {
            producer_id,
            expected,
            actual,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ProducerId {
        &self.producer_id
    }
}

impl fmt::Display for ConcurrentWriteDetected {
    /// Human-readable message including an actionable hint for the caller.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            producer_id,
            expected,
            actual,
        } = self;
        match expected {
            Some(0) => write!(
                f,
                "concurrent write detected for {producer_id}: expected new stream, found \
                 version {actual} (hint: another process created this producer; reload and \
                 retry)"
            ),
            Some(expected) => write!(
                f,
                "concurrent write detected for {producer_id}: expected version {expected}, \
                 found {actual} (hint: stream was modified; reload and retry)"
            ),
            None => write!(f, "concurrent write detected for {producer_id} at version {actual}"),
        }
    }
}

impl std::error::Error for ConcurrentWriteDetected {}
