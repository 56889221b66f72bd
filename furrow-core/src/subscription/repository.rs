//! Loading and enumerating event-sourced subscriptions.

use std::{fmt, sync::Arc};

use thiserror::Error;

use super::{
    ListenerError, ListenerFactory, Subscription, SubscriptionFactory,
    event::{ENUMERATION_KINDS, SubscriptionCompleted, SubscriptionRestarted, SubscriptionStarted},
    unwrap,
};
use crate::{
    event::DomainEvent,
    id::ProducerId,
    sourced::{ReplayError, SharedProducer},
    store::{self, EventStore},
    uow::{ObjectNotSupported, UnitOfWork},
};

#[derive(Debug, Error)]
pub enum Error<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("failed to read subscription stream: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    ObjectNotSupported(#[from] ObjectNotSupported),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("failed to create listener {id}: {source}")]
    Listener {
        id: ProducerId,
        #[source]
        source: ListenerError,
    },
}

/// Restricts [`Repository::all`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    /// Listener id types to enumerate. Empty means every type.
    pub subscription_types: Vec<String>,
    pub ignore_completed: bool,
}

impl Filter {
    /// Every subscription, completed ones included.
    #[must_use]
    pub fn nothing() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter_subscription_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.subscription_types.extend(types.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn ignore_completed(mut self) -> Self {
        self.ignore_completed = true;
        self
    }
}

/// Repository of subscriptions backed by their lifecycle streams.
pub struct Repository<S, U> {
    subscriptions: Arc<dyn SubscriptionFactory>,
    listeners: Arc<dyn ListenerFactory>,
    store: S,
    uow: Arc<U>,
}

impl<S, U> Repository<S, U>
where
    S: EventStore,
    U: UnitOfWork,
{
    #[must_use]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionFactory>,
        listeners: Arc<dyn ListenerFactory>,
        store: S,
        uow: Arc<U>,
    ) -> Self {
        Self {
            subscriptions,
            listeners,
            store,
            uow,
        }
    }

    fn event_sourced(
        subscription: &dyn Subscription,
    ) -> Result<SharedProducer, ObjectNotSupported> {
        unwrap(subscription).ok_or(ObjectNotSupported {
            type_name: std::any::type_name::<dyn Subscription>(),
        })
    }

    async fn stream_of(
        &self,
        producer: &SharedProducer,
    ) -> Result<store::EventStream, Error<S::Error>> {
        let id = producer
            .lock()
            .expect("producer lock poisoned")
            .producer_id()
            .clone();
        let filter = store::Filter::new().filter_producer_ids([id]);
        self.store.stream(&filter).await.map_err(Error::Store)
    }

    /// Load the subscription of `listener_id` and register it with the unit
    /// of work. Returns `None` if it has never been stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be created, the subscription
    /// is not event-sourced, or loading its stream fails.
    #[tracing::instrument(skip(self, listener_id), fields(%listener_id))]
    pub async fn find(
        &self,
        listener_id: &ProducerId,
    ) -> Result<Option<Arc<dyn Subscription>>, Error<S::Error>> {
        let listener = self
            .listeners
            .create(listener_id)
            .map_err(|source| Error::Listener {
                id: listener_id.clone(),
                source,
            })?;
        let subscription = self.subscriptions.create(listener);
        let producer = Self::event_sourced(subscription.as_ref())?;

        let stream = self.stream_of(&producer).await?;
        if stream.is_empty() {
            tracing::trace!("subscription not found");
            return Ok(None);
        }
        producer
            .lock()
            .expect("producer lock poisoned")
            .replay(&stream)?;
        self.uow.add(&producer)?;
        tracing::debug!(replayed = stream.len(), "subscription loaded");
        Ok(Some(subscription))
    }

    /// Whether any event was ever stored for `subscription`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotSupported`] if no layer of `subscription` is
    /// event-sourced.
    pub async fn has(&self, subscription: &dyn Subscription) -> Result<bool, Error<S::Error>> {
        let producer = Self::event_sourced(subscription)?;
        Ok(!self.stream_of(&producer).await?.is_empty())
    }

    /// Register `subscription` with the unit of work. Nothing is stored until
    /// the unit of work commits.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectNotSupported`] if no layer of `subscription` is
    /// event-sourced.
    pub fn add(&self, subscription: &dyn Subscription) -> Result<(), ObjectNotSupported> {
        let producer = Self::event_sourced(subscription)?;
        self.uow.add(&producer)
    }

    /// Enumerate subscriptions without loading them.
    ///
    /// Only the started, restarted and completed markers are read. A restart
    /// moves the subscription to the end of the enumeration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the store cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn all(
        &self,
        filter: Option<Filter>,
    ) -> Result<Vec<LazySubscription<'_, S, U>>, Error<S::Error>> {
        let filter = filter.unwrap_or_else(Filter::nothing);
        let stream_filter =
            store::Filter::new().filter_producer_types(filter.subscription_types.iter().cloned());
        let stream = self
            .store
            .stream(&stream_filter)
            .await
            .map_err(Error::Store)?
            .only(&ENUMERATION_KINDS);

        let mut ids: Vec<ProducerId> = Vec::new();
        for envelope in &stream {
            let id = envelope.producer_id();
            let kind = envelope.name();
            if kind == SubscriptionStarted::KIND {
                ids.push(id.clone());
            } else if kind == SubscriptionCompleted::KIND && filter.ignore_completed {
                ids.retain(|tracked| tracked != id);
            } else if kind == SubscriptionRestarted::KIND {
                ids.retain(|tracked| tracked != id);
                ids.push(id.clone());
            }
        }
        tracing::debug!(subscriptions = ids.len(), "subscriptions enumerated");

        Ok(ids
            .into_iter()
            .map(|id| LazySubscription {
                id,
                repository: self,
            })
            .collect())
    }
}

impl<S, U> fmt::Debug for Repository<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

/// Placeholder for a subscription that is replayed only when loaded.
pub struct LazySubscription<'r, S, U> {
    id: ProducerId,
    repository: &'r Repository<S, U>,
}

impl<S, U> LazySubscription<'_, S, U>
where
    S: EventStore,
    U: UnitOfWork,
{
    #[must_use]
    pub const fn id(&self) -> &ProducerId {
        &self.id
    }

    /// Replay the subscription and register it with the unit of work.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::find`].
    pub async fn load(&self) -> Result<Option<Arc<dyn Subscription>>, Error<S::Error>> {
        self.repository.find(&self.id).await
    }
}

impl<S, U> fmt::Debug for LazySubscription<'_, S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
