#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use furrow_core::test;
pub use furrow_core::{
    aggregate,
    aggregate::Repository,
    clock,
    clock::{Clock, SystemClock},
    concurrency::ConcurrentWriteDetected,
    envelope,
    envelope::Envelope,
    event,
    event::{DomainEvent, Handlers},
    id,
    id::{DomainId, IdRegistry, ProducerId},
    sourced,
    sourced::{EventSourced, SharedProducer, Sourced, State, shared},
    subscription,
    subscription::{Listener, Subscription},
    uow,
    uow::{CommitError, EventStoreUnitOfWork, UnitOfWork},
};

pub mod store {

    pub use furrow_core::store::{EventStore, EventStream, Filter, NonEmpty, inmemory};

    // Re-export low-level append types for EventStore implementors only.
    // Most users should interact with a unit of work instead.
    #[doc(hidden)]
    pub use furrow_core::store::AppendError;
}

pub mod snapshot {

    pub use furrow_core::snapshot::{
        NullSnapshotter, Snapshot, SnapshotError, Snapshottable, Snapshotter, inmemory,
    };

    pub use furrow_core::uow::snapshotting::{InvalidInterval, SnapshottingUnitOfWork};
}
