//! Subscription decorator that persists progress after every run.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use uuid::Uuid;

use super::{Listener, Subscription, SubscriptionError, SubscriptionFactory, unwrap};
use crate::{
    id::ProducerId,
    sourced::{SharedProducer, Trackable},
    store::EventStream,
    uow::UnitOfWork,
};

/// Registers the wrapped subscription with a unit of work and commits the
/// unit of work after each [`Subscription::subscribe_to`].
pub struct CommittingSubscription<U> {
    subscription: Arc<dyn Subscription>,
    uow: Arc<U>,
}

impl<U: UnitOfWork> CommittingSubscription<U> {
    #[must_use]
    pub fn new(subscription: Arc<dyn Subscription>, uow: Arc<U>) -> Self {
        Self { subscription, uow }
    }

    fn track(&self) -> Result<(), SubscriptionError> {
        self.uow
            .add(&self.subscription)
            .map_err(|err| SubscriptionError::Commit(Box::new(err)))
    }
}

#[async_trait]
impl<U: UnitOfWork + 'static> Subscription for CommittingSubscription<U> {
    fn subscription_id(&self) -> ProducerId {
        self.subscription.subscription_id()
    }

    fn start(&self) -> Result<(), SubscriptionError> {
        self.subscription.start()?;
        self.track()
    }

    fn restart(&self) -> Result<(), SubscriptionError> {
        self.subscription.restart()?;
        self.track()
    }

    fn complete(&self) -> Result<(), SubscriptionError> {
        self.subscription.complete()?;
        self.track()
    }

    fn pause(&self) -> Result<(), SubscriptionError> {
        self.subscription.pause()?;
        self.track()
    }

    fn unpause(&self) -> Result<(), SubscriptionError> {
        self.subscription.unpause()?;
        self.track()
    }

    fn started(&self) -> bool {
        self.subscription.started()
    }

    fn completed(&self) -> bool {
        self.subscription.completed()
    }

    fn paused(&self) -> bool {
        self.subscription.paused()
    }

    fn position(&self) -> Option<Uuid> {
        self.subscription.position()
    }

    fn version(&self) -> Option<u64> {
        self.subscription.version()
    }

    async fn subscribe_to(&self, stream: &EventStream) -> Result<usize, SubscriptionError> {
        self.track()?;
        // Progress made before a listener failure is committed as well.
        let listened = self.subscription.subscribe_to(stream).await;
        let committed: Result<Vec<SharedProducer>, _> = self.uow.commit().try_collect().await;
        match (listened, committed) {
            (Ok(processed), Ok(committed)) => {
                tracing::debug!(
                    subscription_id = %self.subscription_id(),
                    processed,
                    committed = committed.len(),
                    "subscription progress committed"
                );
                Ok(processed)
            }
            (Ok(_), Err(err)) => Err(SubscriptionError::Commit(Box::new(err))),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(commit)) => {
                tracing::warn!(
                    subscription_id = %self.subscription_id(),
                    error = %commit,
                    "failed to commit progress after listener failure"
                );
                Err(err)
            }
        }
    }

    fn decorated(&self) -> Option<&dyn Subscription> {
        Some(self.subscription.as_ref())
    }
}

impl<U: UnitOfWork + 'static> Trackable for CommittingSubscription<U> {
    fn event_sourced(&self) -> Option<SharedProducer> {
        unwrap(self)
    }
}

/// Wraps every subscription built by the inner factory in a
/// [`CommittingSubscription`].
pub struct Factory<U> {
    factory: Arc<dyn SubscriptionFactory>,
    uow: Arc<U>,
}

impl<U> Factory<U> {
    #[must_use]
    pub fn new(factory: Arc<dyn SubscriptionFactory>, uow: Arc<U>) -> Self {
        Self { factory, uow }
    }
}

impl<U: UnitOfWork + 'static> SubscriptionFactory for Factory<U> {
    fn create(&self, listener: Box<dyn Listener>) -> Arc<dyn Subscription> {
        let subscription = self.factory.create(listener);
        Arc::new(CommittingSubscription::new(subscription, Arc::clone(&self.uow)))
    }
}
