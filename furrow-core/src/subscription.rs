//! Event-sourced subscriptions.
//!
//! A subscription feeds envelopes to a [`Listener`] and records its own
//! progress as lifecycle events in a stream keyed by the listener id. Because
//! progress is event-sourced, a subscription is loaded like any other
//! producer: replay its stream, and it resumes after the last envelope it
//! processed.
//!
//! Subscriptions can be decorated (see [`committing`]); [`unwrap`] walks the
//! decorator chain to find the event-sourced core.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    envelope::Envelope,
    event::Handlers,
    id::ProducerId,
    snapshot::Snapshottable,
    sourced::{EventSourced, ReplayError, SharedProducer, Sourced, State, Trackable},
    store::EventStream,
};

pub mod committing;
pub mod event;
pub mod repository;

use event::{
    SubscriptionCompleted, SubscriptionIgnoredEvent, SubscriptionListenedToEvent,
    SubscriptionPaused, SubscriptionRestarted, SubscriptionStarted, SubscriptionUnPaused,
};

/// Boxed error returned by listeners and factories.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Consumer of envelopes driven by a subscription.
pub trait Listener: Send {
    /// Identity of the listener, which is also the subscription's producer id.
    fn listener_id(&self) -> ProducerId;

    /// Handle one envelope. Returns `false` if the envelope was ignored.
    ///
    /// # Errors
    ///
    /// Any error stops the subscription's current run.
    fn on(&mut self, envelope: &Envelope) -> Result<bool, ListenerError>;

    /// Whether the listener is done. Checked after every envelope.
    fn completed(&self) -> bool {
        false
    }
}

/// Creates empty listeners from their identity.
pub trait ListenerFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if no listener can be built for `id`.
    fn create(&self, id: &ProducerId) -> Result<Box<dyn Listener>, ListenerError>;
}

impl<F> ListenerFactory for F
where
    F: Fn(&ProducerId) -> Result<Box<dyn Listener>, ListenerError> + Send + Sync,
{
    fn create(&self, id: &ProducerId) -> Result<Box<dyn Listener>, ListenerError> {
        self(id)
    }
}

/// Wraps listeners into (not yet replayed) subscriptions.
pub trait SubscriptionFactory: Send + Sync {
    fn create(&self, listener: Box<dyn Listener>) -> Arc<dyn Subscription>;
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription {0} is not started")]
    NotStarted(ProducerId),
    #[error("subscription {0} is already started")]
    AlreadyStarted(ProducerId),
    #[error("subscription {0} is already completed")]
    AlreadyCompleted(ProducerId),
    #[error("listener {id} failed: {source}")]
    Listener {
        id: ProducerId,
        #[source]
        source: ListenerError,
    },
    #[error("failed to commit subscription progress: {0}")]
    Commit(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A listener's position over the event store, with lifecycle controls.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn subscription_id(&self) -> ProducerId;

    /// # Errors
    ///
    /// Returns [`SubscriptionError::AlreadyStarted`] if already started.
    fn start(&self) -> Result<(), SubscriptionError>;

    /// Reset the position so the listener receives the whole stream again.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::NotStarted`] if never started.
    fn restart(&self) -> Result<(), SubscriptionError>;

    /// # Errors
    ///
    /// Returns an error if not started or already completed.
    fn complete(&self) -> Result<(), SubscriptionError>;

    /// Pausing a paused subscription is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if not started or already completed.
    fn pause(&self) -> Result<(), SubscriptionError>;

    /// Unpausing a running subscription is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::NotStarted`] if never started.
    fn unpause(&self) -> Result<(), SubscriptionError>;

    fn started(&self) -> bool;

    fn completed(&self) -> bool;

    fn paused(&self) -> bool;

    /// Uuid of the last envelope handed to the listener.
    fn position(&self) -> Option<Uuid>;

    fn version(&self) -> Option<u64>;

    /// Feed the listener every envelope after the current position.
    ///
    /// Envelopes recorded by the subscription itself are skipped. Paused and
    /// completed subscriptions process nothing. Returns the number of
    /// envelopes handed to the listener.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::NotStarted`] if never started, or
    /// [`SubscriptionError::Listener`] if the listener fails; progress made
    /// before the failure is kept.
    async fn subscribe_to(&self, stream: &EventStream) -> Result<usize, SubscriptionError>;

    /// The wrapped subscription, for decorators.
    fn decorated(&self) -> Option<&dyn Subscription> {
        None
    }

    /// The event-sourced producer behind this layer, if this layer is one.
    fn event_sourced(&self) -> Option<SharedProducer> {
        None
    }
}

/// Walk the decorator chain until a layer exposes its event-sourced producer.
#[must_use]
pub fn unwrap(subscription: &dyn Subscription) -> Option<SharedProducer> {
    let mut layer = Some(subscription);
    while let Some(current) = layer {
        if let Some(producer) = current.event_sourced() {
            return Some(producer);
        }
        layer = current.decorated();
    }
    None
}

impl Trackable for Arc<dyn Subscription> {
    fn event_sourced(&self) -> Option<SharedProducer> {
        unwrap(self.as_ref())
    }
}

/// Progress folded from the lifecycle events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub started_at: Option<SystemTime>,
    pub completed: bool,
    pub paused: bool,
    pub position: Option<Uuid>,
    pub processed: u64,
}

impl Progress {
    #[must_use]
    pub const fn started(&self) -> bool {
        self.started_at.is_some()
    }
}

impl State for Progress {
    fn handlers() -> Handlers<Self> {
        Handlers::new()
            .on(|progress: &mut Self, event: &SubscriptionStarted| {
                progress.started_at = Some(event.timestamp);
            })
            .on(|progress: &mut Self, _: &SubscriptionRestarted| {
                progress.completed = false;
                progress.paused = false;
                progress.position = None;
                progress.processed = 0;
            })
            .on(|progress: &mut Self, _: &SubscriptionCompleted| progress.completed = true)
            .on(|progress: &mut Self, _: &SubscriptionPaused| progress.paused = true)
            .on(|progress: &mut Self, _: &SubscriptionUnPaused| progress.paused = false)
            .on(|progress: &mut Self, event: &SubscriptionListenedToEvent| {
                progress.position = Some(event.event);
                progress.processed += 1;
            })
            .on(|progress: &mut Self, event: &SubscriptionIgnoredEvent| {
                progress.position = Some(event.event);
                progress.processed += 1;
            })
    }
}

/// Listener plus its event-sourced progress.
pub struct SubscriptionProducer {
    listener: Box<dyn Listener>,
    sourced: Sourced<Progress>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionProducer {
    fn new(listener: Box<dyn Listener>, clock: Arc<dyn Clock>) -> Self {
        let sourced = Sourced::versioned(listener.listener_id()).with_snapshots();
        Self {
            listener,
            sourced,
            clock,
        }
    }

    #[must_use]
    pub const fn progress(&self) -> &Progress {
        self.sourced.state()
    }

    #[must_use]
    pub fn listener(&self) -> &dyn Listener {
        &*self.listener
    }

    fn guard_running(&self) -> Result<(), SubscriptionError> {
        let progress = self.progress();
        if !progress.started() {
            return Err(SubscriptionError::NotStarted(self.producer_id().clone()));
        }
        if progress.completed {
            return Err(SubscriptionError::AlreadyCompleted(
                self.producer_id().clone(),
            ));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), SubscriptionError> {
        if self.progress().started() {
            return Err(SubscriptionError::AlreadyStarted(self.producer_id().clone()));
        }
        let now = self.clock.now();
        self.sourced.raise(SubscriptionStarted::new(now));
        Ok(())
    }

    fn restart(&mut self) -> Result<(), SubscriptionError> {
        if !self.progress().started() {
            return Err(SubscriptionError::NotStarted(self.producer_id().clone()));
        }
        let now = self.clock.now();
        self.sourced.raise(SubscriptionRestarted::new(now));
        Ok(())
    }

    fn complete(&mut self) -> Result<(), SubscriptionError> {
        self.guard_running()?;
        let now = self.clock.now();
        self.sourced.raise(SubscriptionCompleted::new(now));
        Ok(())
    }

    fn pause(&mut self) -> Result<(), SubscriptionError> {
        self.guard_running()?;
        if !self.progress().paused {
            let now = self.clock.now();
            self.sourced.raise(SubscriptionPaused::new(now));
        }
        Ok(())
    }

    fn unpause(&mut self) -> Result<(), SubscriptionError> {
        if !self.progress().started() {
            return Err(SubscriptionError::NotStarted(self.producer_id().clone()));
        }
        if self.progress().paused {
            let now = self.clock.now();
            self.sourced.raise(SubscriptionUnPaused::new(now));
        }
        Ok(())
    }

    fn subscribe_to(&mut self, stream: &EventStream) -> Result<usize, SubscriptionError> {
        let progress = self.progress();
        if !progress.started() {
            return Err(SubscriptionError::NotStarted(self.producer_id().clone()));
        }
        if progress.completed || progress.paused {
            tracing::trace!(
                producer_id = %self.producer_id(),
                "subscription idle, skipping stream"
            );
            return Ok(0);
        }

        let own_id = self.producer_id().clone();
        let pending: Vec<&Envelope> = match progress.position {
            None => stream.iter().collect(),
            Some(position) => stream
                .iter()
                .skip_while(|envelope| envelope.uuid() != position)
                .skip(1)
                .collect(),
        };

        let mut processed = 0;
        for envelope in pending {
            if envelope.producer_id() == &own_id {
                continue;
            }
            let handled = self
                .listener
                .on(envelope)
                .map_err(|source| SubscriptionError::Listener {
                    id: own_id.clone(),
                    source,
                })?;
            let now = self.clock.now();
            if handled {
                self.sourced.raise(SubscriptionListenedToEvent {
                    event: envelope.uuid(),
                    timestamp: now,
                });
            } else {
                self.sourced.raise(SubscriptionIgnoredEvent {
                    event: envelope.uuid(),
                    timestamp: now,
                });
            }
            processed += 1;

            if self.listener.completed() {
                self.sourced.raise(SubscriptionCompleted::new(now));
                break;
            }
        }
        tracing::debug!(producer_id = %own_id, processed, "subscription caught up");
        Ok(processed)
    }
}

impl EventSourced for SubscriptionProducer {
    fn producer_id(&self) -> &ProducerId {
        self.sourced.producer_id()
    }

    fn events(&self) -> Vec<Envelope> {
        self.sourced.events()
    }

    fn replay(&mut self, stream: &EventStream) -> Result<(), ReplayError> {
        self.sourced.replay(stream)
    }

    fn last_replayed(&self) -> Option<&Envelope> {
        self.sourced.last_replayed()
    }

    fn commit(&mut self) {
        self.sourced.commit();
    }

    fn version(&self) -> Option<u64> {
        self.sourced.version()
    }

    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        self.sourced.as_snapshottable()
    }

    fn as_snapshottable_mut(&mut self) -> Option<&mut dyn Snapshottable> {
        self.sourced.as_snapshottable_mut()
    }
}

impl fmt::Debug for SubscriptionProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionProducer")
            .field("sourced", &self.sourced)
            .finish_non_exhaustive()
    }
}

/// Subscription whose progress is recorded as events.
#[derive(Clone, Debug)]
pub struct EventSourcedSubscription {
    producer: Arc<Mutex<SubscriptionProducer>>,
}

impl EventSourcedSubscription {
    #[must_use]
    pub fn new(listener: Box<dyn Listener>) -> Self {
        Self::with_clock(listener, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(listener: Box<dyn Listener>, clock: Arc<dyn Clock>) -> Self {
        Self {
            producer: Arc::new(Mutex::new(SubscriptionProducer::new(listener, clock))),
        }
    }

    /// The underlying producer, shared with units of work.
    #[must_use]
    pub fn producer(&self) -> &Arc<Mutex<SubscriptionProducer>> {
        &self.producer
    }

    fn with_producer<T>(&self, f: impl FnOnce(&mut SubscriptionProducer) -> T) -> T {
        let mut producer = self.producer.lock().expect("subscription lock poisoned");
        f(&mut producer)
    }
}

#[async_trait]
impl Subscription for EventSourcedSubscription {
    fn subscription_id(&self) -> ProducerId {
        self.with_producer(|producer| producer.producer_id().clone())
    }

    fn start(&self) -> Result<(), SubscriptionError> {
        self.with_producer(SubscriptionProducer::start)
    }

    fn restart(&self) -> Result<(), SubscriptionError> {
        self.with_producer(SubscriptionProducer::restart)
    }

    fn complete(&self) -> Result<(), SubscriptionError> {
        self.with_producer(SubscriptionProducer::complete)
    }

    fn pause(&self) -> Result<(), SubscriptionError> {
        self.with_producer(SubscriptionProducer::pause)
    }

    fn unpause(&self) -> Result<(), SubscriptionError> {
        self.with_producer(SubscriptionProducer::unpause)
    }

    fn started(&self) -> bool {
        self.with_producer(|producer| producer.progress().started())
    }

    fn completed(&self) -> bool {
        self.with_producer(|producer| producer.progress().completed)
    }

    fn paused(&self) -> bool {
        self.with_producer(|producer| producer.progress().paused)
    }

    fn position(&self) -> Option<Uuid> {
        self.with_producer(|producer| producer.progress().position)
    }

    fn version(&self) -> Option<u64> {
        self.with_producer(|producer| producer.version())
    }

    async fn subscribe_to(&self, stream: &EventStream) -> Result<usize, SubscriptionError> {
        self.with_producer(|producer| producer.subscribe_to(stream))
    }

    fn event_sourced(&self) -> Option<SharedProducer> {
        let producer: SharedProducer = self.producer.clone();
        Some(producer)
    }
}

/// Builds [`EventSourcedSubscription`]s sharing one clock.
#[derive(Clone)]
pub struct Factory {
    clock: Arc<dyn Clock>,
}

impl Factory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionFactory for Factory {
    fn create(&self, listener: Box<dyn Listener>) -> Arc<dyn Subscription> {
        Arc::new(EventSourcedSubscription::with_clock(
            listener,
            Arc::clone(&self.clock),
        ))
    }
}
