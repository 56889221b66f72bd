//! Event-sourced producers.
//!
//! A producer rebuilds its state by folding historical envelopes through a
//! [`Handlers`] table and records new envelopes in an uncommitted buffer
//! until a unit of work persists them. [`Sourced`] is the reusable core that
//! implements this bookkeeping; aggregates either use it directly or embed it
//! and delegate.
//!
//! ```
//! use furrow_core::{
//!     event::{DomainEvent, Handlers},
//!     id::ProducerId,
//!     sourced::{EventSourced, Sourced, State},
//! };
//!
//! #[derive(Debug)]
//! struct Deposited(i64);
//!
//! impl DomainEvent for Deposited {
//!     const KIND: &'static str = "deposited";
//! }
//!
//! #[derive(Default)]
//! struct Balance(i64);
//!
//! impl State for Balance {
//!     fn handlers() -> Handlers<Self> {
//!         Handlers::new().on(|balance: &mut Self, event: &Deposited| balance.0 += event.0)
//!     }
//! }
//!
//! let mut account = Sourced::<Balance>::versioned(ProducerId::random());
//! account.raise(Deposited(10));
//! account.raise(Deposited(5));
//!
//! assert_eq!(account.state().0, 15);
//! assert_eq!(account.version(), Some(2));
//! assert_eq!(account.events().len(), 2);
//! ```

use std::sync::{Arc, Mutex};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    envelope::Envelope,
    event::{DomainEvent, Handlers},
    id::ProducerId,
    snapshot::{Snapshot, SnapshotError, Snapshottable},
    store::EventStream,
};

/// Error returned when a stream cannot be replayed into a producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("envelope {uuid} belongs to producer {found}, not {expected}")]
    ForeignEvent {
        expected: ProducerId,
        found: ProducerId,
        uuid: Uuid,
    },
}

/// Capability shared by aggregates and subscriptions.
pub trait EventSourced: Send {
    fn producer_id(&self) -> &ProducerId;

    /// Envelopes raised since the last commit, oldest first.
    fn events(&self) -> Vec<Envelope>;

    /// Fold historical envelopes into the producer's state.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::ForeignEvent`] if the stream contains an
    /// envelope recorded by a different producer. No envelope is applied in
    /// that case.
    fn replay(&mut self, stream: &EventStream) -> Result<(), ReplayError>;

    fn last_replayed(&self) -> Option<&Envelope>;

    /// Clear the uncommitted buffer after the envelopes were persisted.
    fn commit(&mut self);

    /// Current version, or `None` for non-versionable producers.
    fn version(&self) -> Option<u64>;

    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        None
    }

    fn as_snapshottable_mut(&mut self) -> Option<&mut dyn Snapshottable> {
        None
    }
}

/// Shared handle to a producer tracked by a unit of work.
pub type SharedProducer = Arc<Mutex<dyn EventSourced>>;

/// Capability query used by units of work and repositories.
///
/// Objects that are not event-sourced keep the default and report `None`.
pub trait Trackable {
    fn event_sourced(&self) -> Option<SharedProducer> {
        None
    }

    /// Type name used in error messages.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<P: EventSourced + 'static> Trackable for Arc<Mutex<P>> {
    fn event_sourced(&self) -> Option<SharedProducer> {
        let producer: SharedProducer = self.clone();
        Some(producer)
    }
}

impl Trackable for SharedProducer {
    fn event_sourced(&self) -> Option<SharedProducer> {
        Some(Arc::clone(self))
    }
}

/// Wrap a producer so it can be handed to a unit of work.
pub fn shared<P: EventSourced + 'static>(producer: P) -> Arc<Mutex<P>> {
    Arc::new(Mutex::new(producer))
}

/// State folded by a [`Sourced`] producer.
pub trait State: Default + Send + 'static {
    /// Handler table, built once per producer instance.
    fn handlers() -> Handlers<Self>;
}

struct Memento<S> {
    save: fn(&S) -> Result<Value, serde_json::Error>,
    load: fn(Value) -> Result<S, serde_json::Error>,
}

/// Reusable event-sourced producer core.
pub struct Sourced<S: State> {
    producer_id: ProducerId,
    state: S,
    handlers: Handlers<S>,
    version: Option<u64>,
    uncommitted: Vec<Envelope>,
    last_replayed: Option<Envelope>,
    memento: Option<Memento<S>>,
}

impl<S: State> Sourced<S> {
    /// A versionable producer starting at version 0.
    #[must_use]
    pub fn versioned(producer_id: ProducerId) -> Self {
        Self::with_version(producer_id, Some(0))
    }

    /// A producer without a version. It can never be snapshotted.
    #[must_use]
    pub fn unversioned(producer_id: ProducerId) -> Self {
        Self::with_version(producer_id, None)
    }

    fn with_version(producer_id: ProducerId, version: Option<u64>) -> Self {
        Self {
            producer_id,
            state: S::default(),
            handlers: S::handlers(),
            version,
            uncommitted: Vec::new(),
            last_replayed: None,
            memento: None,
        }
    }

    /// Enable snapshot capture by serialising the state with `serde_json`.
    #[must_use]
    pub fn with_snapshots(mut self) -> Self
    where
        S: Serialize + DeserializeOwned,
    {
        self.memento = Some(Memento {
            save: |state| serde_json::to_value(state),
            load: serde_json::from_value::<S>,
        });
        self
    }

    #[must_use]
    pub const fn state(&self) -> &S {
        &self.state
    }

    /// Record a new event and apply it to the state immediately.
    pub fn raise<E: DomainEvent>(&mut self, event: E) -> &Envelope {
        if let Some(version) = self.version.as_mut() {
            *version += 1;
        }
        let envelope = Envelope::new(event, self.producer_id.clone(), self.version);
        let handled = self.handlers.dispatch(&mut self.state, &envelope);
        tracing::trace!(kind = envelope.name(), handled, "event raised");
        self.uncommitted.push(envelope);
        &self.uncommitted[self.uncommitted.len() - 1]
    }
}

impl<S: State> EventSourced for Sourced<S> {
    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn events(&self) -> Vec<Envelope> {
        self.uncommitted.clone()
    }

    fn replay(&mut self, stream: &EventStream) -> Result<(), ReplayError> {
        if let Some(foreign) = stream
            .iter()
            .find(|envelope| envelope.producer_id() != &self.producer_id)
        {
            return Err(ReplayError::ForeignEvent {
                expected: self.producer_id.clone(),
                found: foreign.producer_id().clone(),
                uuid: foreign.uuid(),
            });
        }

        for envelope in stream {
            self.handlers.dispatch(&mut self.state, envelope);
            if let Some(version) = self.version.as_mut() {
                *version += 1;
            }
            self.last_replayed = Some(envelope.clone());
        }
        tracing::trace!(
            producer_id = %self.producer_id,
            replayed = stream.len(),
            version = ?self.version,
            "stream replayed"
        );
        Ok(())
    }

    fn last_replayed(&self) -> Option<&Envelope> {
        self.last_replayed.as_ref()
    }

    fn commit(&mut self) {
        self.uncommitted.clear();
    }

    fn version(&self) -> Option<u64> {
        self.version
    }

    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        (self.memento.is_some() && self.version.is_some()).then_some(self as &dyn Snapshottable)
    }

    fn as_snapshottable_mut(&mut self) -> Option<&mut dyn Snapshottable> {
        if self.memento.is_some() && self.version.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl<S: State> Snapshottable for Sourced<S> {
    fn to_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        let (Some(memento), Some(version)) = (&self.memento, self.version) else {
            return Err(SnapshotError::Unsupported(self.producer_id.clone()));
        };
        let state = (memento.save)(&self.state).map_err(SnapshotError::Encode)?;
        Ok(Snapshot { version, state })
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let Some(memento) = &self.memento else {
            return Err(SnapshotError::Unsupported(self.producer_id.clone()));
        };
        self.state = (memento.load)(snapshot.state).map_err(SnapshotError::Decode)?;
        self.version = Some(snapshot.version);
        Ok(())
    }
}

impl<S: State + std::fmt::Debug> std::fmt::Debug for Sourced<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sourced")
            .field("producer_id", &self.producer_id)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("uncommitted", &self.uncommitted.len())
            .finish_non_exhaustive()
    }
}
