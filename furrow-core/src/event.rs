//! Domain event markers and handler dispatch.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Instead of walking a type hierarchy at runtime, events declare
//! their more general kinds up front through [`DomainEvent::LINEAGE`], and
//! consumers register handlers in a [`Handlers`] table keyed by kind.

use std::{any::Any, collections::HashMap, fmt};

use crate::envelope::Envelope;

/// Marker trait for events that can be recorded by a producer.
///
/// Each event carries a unique [`Self::KIND`] identifier used for routing and
/// stored as the envelope name. `LINEAGE` lists the kinds of the event
/// families this event belongs to, nearest first; a handler registered for
/// one of those kinds receives the event when no more specific handler
/// exists.
pub trait DomainEvent: fmt::Debug + Send + Sync + 'static {
    const KIND: &'static str;
    const LINEAGE: &'static [&'static str] = &[];
}

/// Object-safe view of a [`DomainEvent`].
///
/// Blanket-implemented for every `DomainEvent`; you never implement it
/// yourself.
pub trait Event: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn lineage(&self) -> &'static [&'static str];

    fn as_any(&self) -> &dyn Any;
}

impl<T: DomainEvent> Event for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn lineage(&self) -> &'static [&'static str] {
        T::LINEAGE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Event {
    #[must_use]
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    #[must_use]
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.as_any().is::<E>()
    }
}

type Handler<T> = Box<dyn Fn(&mut T, &Envelope) -> bool + Send + Sync>;

/// Registration table mapping event kinds to handlers for a target `T`.
///
/// Built once at construction time. When several handlers could accept an
/// event, the one registered for the most specific kind wins, and for a
/// given kind the first registration wins. Events without a matching handler
/// are ignored.
///
/// ```
/// use furrow_core::event::{DomainEvent, Handlers};
///
/// #[derive(Debug)]
/// struct Deposited {
///     amount: i64,
/// }
///
/// impl DomainEvent for Deposited {
///     const KIND: &'static str = "deposited";
/// }
///
/// #[derive(Default)]
/// struct Balance(i64);
///
/// let handlers = Handlers::<Balance>::new().on(|balance, event: &Deposited| {
///     balance.0 += event.amount;
/// });
/// assert!(handlers.handles("deposited"));
/// ```
pub struct Handlers<T> {
    table: HashMap<&'static str, Handler<T>>,
}

impl<T> Handlers<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Register a typed handler for events of kind `E::KIND`.
    #[must_use]
    pub fn on<E, F>(mut self, handler: F) -> Self
    where
        T: 'static,
        E: DomainEvent,
        F: Fn(&mut T, &E) + Send + Sync + 'static,
    {
        let handler: Handler<T> = Box::new(move |target: &mut T, envelope: &Envelope| {
            match envelope.message().downcast_ref::<E>() {
                Some(event) => {
                    handler(target, event);
                    true
                }
                None => false,
            }
        });
        self.table.entry(E::KIND).or_insert(handler);
        self
    }

    /// Register a handler for a whole event family. The handler receives the
    /// envelope of any event whose kind or lineage includes `kind`.
    #[must_use]
    pub fn on_kind<F>(mut self, kind: &'static str, handler: F) -> Self
    where
        T: 'static,
        F: Fn(&mut T, &Envelope) + Send + Sync + 'static,
    {
        let handler: Handler<T> = Box::new(move |target: &mut T, envelope: &Envelope| {
            handler(target, envelope);
            true
        });
        self.table.entry(kind).or_insert(handler);
        self
    }

    #[must_use]
    pub fn handles(&self, kind: &str) -> bool {
        self.table.contains_key(kind)
    }

    /// Apply `envelope` to `target` through the most specific matching
    /// handler. Returns `false` when no handler accepted the event.
    pub fn dispatch(&self, target: &mut T, envelope: &Envelope) -> bool {
        let message = envelope.message();
        std::iter::once(message.kind())
            .chain(message.lineage().iter().copied())
            .filter_map(|kind| self.table.get(kind))
            .any(|handler| handler(target, envelope))
    }
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Handlers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.table.keys().collect();
        kinds.sort();
        f.debug_struct("Handlers").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ProducerId;

    #[derive(Debug)]
    struct PaymentReceived {
        amount: i64,
    }

    impl DomainEvent for PaymentReceived {
        const KIND: &'static str = "payment-received";
        const LINEAGE: &'static [&'static str] = &["payment"];
    }

    #[derive(Debug)]
    struct RefundIssued;

    impl DomainEvent for RefundIssued {
        const KIND: &'static str = "refund-issued";
        const LINEAGE: &'static [&'static str] = &["payment"];
    }

    #[derive(Debug)]
    struct Unrelated;

    impl DomainEvent for Unrelated {
        const KIND: &'static str = "unrelated";
    }

    #[derive(Default)]
    struct Ledger {
        received: i64,
        family: Vec<&'static str>,
    }

    fn envelope<E: DomainEvent>(event: E) -> Envelope {
        Envelope::new(event, ProducerId::random(), None)
    }

    fn handlers() -> Handlers<Ledger> {
        Handlers::new()
            .on_kind("payment", |ledger: &mut Ledger, envelope| {
                ledger.family.push(envelope.name());
            })
            .on(|ledger: &mut Ledger, event: &PaymentReceived| {
                ledger.received += event.amount;
            })
    }

    #[test]
    fn most_specific_handler_wins() {
        let mut ledger = Ledger::default();
        assert!(handlers().dispatch(&mut ledger, &envelope(PaymentReceived { amount: 5 })));
        assert_eq!(ledger.received, 5);
        assert!(ledger.family.is_empty());
    }

    #[test]
    fn family_handler_receives_events_without_specific_handler() {
        let mut ledger = Ledger::default();
        assert!(handlers().dispatch(&mut ledger, &envelope(RefundIssued)));
        assert_eq!(ledger.family, vec!["refund-issued"]);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let mut ledger = Ledger::default();
        assert!(!handlers().dispatch(&mut ledger, &envelope(Unrelated)));
        assert_eq!(ledger.received, 0);
        assert!(ledger.family.is_empty());
    }

    #[test]
    fn first_registration_for_a_kind_wins() {
        let handlers = Handlers::<Ledger>::new()
            .on(|ledger: &mut Ledger, event: &PaymentReceived| ledger.received += event.amount)
            .on(|ledger: &mut Ledger, _: &PaymentReceived| ledger.received = -1);

        let mut ledger = Ledger::default();
        handlers.dispatch(&mut ledger, &envelope(PaymentReceived { amount: 3 }));
        assert_eq!(ledger.received, 3);
    }

    #[test]
    fn dyn_event_downcasts_to_concrete_type() {
        let envelope = envelope(PaymentReceived { amount: 9 });
        assert!(envelope.message().is::<PaymentReceived>());
        assert!(envelope.message().downcast_ref::<RefundIssued>().is_none());
    }
}
