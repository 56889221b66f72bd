//! Core traits and types for the furrow event-sourcing library.
//!
//! This crate provides the foundational abstractions:
//!
//! - [`envelope`] - Immutable event envelopes with scalar metadata
//! - [`event`] - Event marker traits and handler tables (`DomainEvent`, `Handlers`)
//! - [`sourced`] - Event-sourced producers (`EventSourced`, `Sourced`)
//! - [`store`] - Event persistence abstraction (`EventStore`)
//! - [`uow`] - Unit of work commit pipeline, with periodic snapshots in
//!   [`uow::snapshotting`]
//! - [`snapshot`] - Snapshot capture and restore (`Snapshotter`)
//! - [`aggregate`] - Loading aggregates (`Repository`)
//! - [`subscription`] - Event-sourced subscriptions and their repository
//! - [`id`] - Typed producer identities
//!
//! # Example
//!
//! ```
//! use furrow_core::{store::inmemory, uow::{EventStoreUnitOfWork, UnitOfWork}};
//!
//! let uow = EventStoreUnitOfWork::new(inmemory::Store::new());
//! assert_eq!(uow.count(), 0);
//! ```
//!
//! Most users should depend on the `furrow` crate, which re-exports these
//! types with a flatter API surface.

pub mod aggregate;
pub mod clock;
pub mod concurrency;
pub mod envelope;
pub mod event;
pub mod id;
pub mod snapshot;
pub mod sourced;
pub mod store;
pub mod subscription;
pub mod uow;
