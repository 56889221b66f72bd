//! Lifecycle events recorded in a subscription's own stream.
//!
//! Every event belongs to the [`SUBSCRIPTION_EVENT`] family. The repository
//! scans the stream for [`SubscriptionStarted`], [`SubscriptionRestarted`]
//! and [`SubscriptionCompleted`] to enumerate subscriptions without loading
//! them.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::DomainEvent;

/// Kind shared by every subscription lifecycle event.
pub const SUBSCRIPTION_EVENT: &str = "subscription-event";

macro_rules! lifecycle_event {
    ($(#[$meta:meta])* $name:ident => $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            pub timestamp: SystemTime,
        }

        impl $name {
            #[must_use]
            pub const fn new(timestamp: SystemTime) -> Self {
                Self { timestamp }
            }
        }

        impl DomainEvent for $name {
            const KIND: &'static str = $kind;
            const LINEAGE: &'static [&'static str] = &[SUBSCRIPTION_EVENT];
        }
    };
}

lifecycle_event!(
    /// The subscription started listening.
    SubscriptionStarted => "subscription-started"
);
lifecycle_event!(
    /// The subscription was reset and listens from the beginning again.
    SubscriptionRestarted => "subscription-restarted"
);
lifecycle_event!(
    /// The listener reported completion or the subscription was completed
    /// explicitly.
    SubscriptionCompleted => "subscription-completed"
);
lifecycle_event!(SubscriptionPaused => "subscription-paused");
lifecycle_event!(SubscriptionUnPaused => "subscription-unpaused");

/// The listener handled the envelope `event`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionListenedToEvent {
    pub event: Uuid,
    pub timestamp: SystemTime,
}

impl DomainEvent for SubscriptionListenedToEvent {
    const KIND: &'static str = "subscription-listened-to-event";
    const LINEAGE: &'static [&'static str] = &[SUBSCRIPTION_EVENT];
}

/// The listener received the envelope `event` but did not handle it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIgnoredEvent {
    pub event: Uuid,
    pub timestamp: SystemTime,
}

impl DomainEvent for SubscriptionIgnoredEvent {
    const KIND: &'static str = "subscription-ignored-event";
    const LINEAGE: &'static [&'static str] = &[SUBSCRIPTION_EVENT];
}

/// Kinds the repository folds to enumerate subscriptions.
pub const ENUMERATION_KINDS: [&str; 3] = [
    SubscriptionStarted::KIND,
    SubscriptionRestarted::KIND,
    SubscriptionCompleted::KIND,
];
