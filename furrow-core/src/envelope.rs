//! Immutable event envelopes.
//!
//! An [`Envelope`] binds an event payload to its identity (a random UUID), the
//! producer that recorded it, an optional producer version and a map of
//! scalar metadata. Envelopes are never mutated: [`Envelope::set`] returns a
//! copy, so the same envelope can be shared safely across commit retries.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    event::{DomainEvent, Event},
    id::ProducerId,
};

pub const METADATA_UUID: &str = "uuid";
pub const METADATA_NAME: &str = "name";
pub const METADATA_VERSION: &str = "version";
pub const METADATA_PRODUCER_TYPE: &str = "producer_type";
pub const METADATA_PRODUCER_ID: &str = "producer_id";

const RESERVED: [&str; 5] = [
    METADATA_UUID,
    METADATA_NAME,
    METADATA_VERSION,
    METADATA_PRODUCER_TYPE,
    METADATA_PRODUCER_ID,
];

/// Error returned when metadata cannot be attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("name of the attribute can not be empty")]
    EmptyName,
    #[error("value for attribute `{name}` is not scalar")]
    NotScalar { name: String },
    #[error("attribute `{name}` is reserved")]
    Reserved { name: String },
}

/// Event payload plus identity and metadata.
///
/// Equality is by envelope UUID only: two envelopes carrying equal payloads
/// are still distinct unless they share the same identity.
#[derive(Clone, Debug)]
pub struct Envelope {
    uuid: Uuid,
    message: Arc<dyn Event>,
    producer_id: ProducerId,
    version: Option<u64>,
    metadata: BTreeMap<String, Value>,
}

impl Envelope {
    /// Wrap `event` in a new envelope with a fresh random UUID.
    #[must_use]
    pub fn new<E: DomainEvent>(event: E, producer_id: ProducerId, version: Option<u64>) -> Self {
        Self::from_parts(Uuid::new_v4(), Arc::new(event), producer_id, version)
    }

    /// Rebuild an envelope from stored parts. Intended for event store
    /// backends rehydrating persisted envelopes.
    #[must_use]
    pub fn from_parts(
        uuid: Uuid,
        message: Arc<dyn Event>,
        producer_id: ProducerId,
        version: Option<u64>,
    ) -> Self {
        Self {
            uuid,
            message,
            producer_id,
            version,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Event kind of the payload.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.message.kind()
    }

    #[must_use]
    pub fn message(&self) -> &dyn Event {
        &*self.message
    }

    #[must_use]
    pub fn downcast<E: DomainEvent>(&self) -> Option<&E> {
        self.message().downcast_ref::<E>()
    }

    #[must_use]
    pub const fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    #[must_use]
    pub fn producer_type(&self) -> &str {
        self.producer_id.id_type()
    }

    #[must_use]
    pub const fn version(&self) -> Option<u64> {
        self.version
    }

    /// Return a copy of this envelope with `name` set to `value`.
    ///
    /// The original envelope is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::EmptyName`] for an empty name,
    /// [`EnvelopeError::Reserved`] for one of the identity attributes and
    /// [`EnvelopeError::NotScalar`] for arrays, objects and `null`.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<Self, EnvelopeError> {
        if name.is_empty() {
            return Err(EnvelopeError::EmptyName);
        }
        if RESERVED.contains(&name) {
            return Err(EnvelopeError::Reserved {
                name: name.to_string(),
            });
        }
        let value = value.into();
        if !is_scalar(&value) {
            return Err(EnvelopeError::NotScalar {
                name: name.to_string(),
            });
        }

        let mut envelope = self.clone();
        envelope.metadata.insert(name.to_string(), value);
        Ok(envelope)
    }

    /// Look up an attribute, including the identity attributes.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        match name {
            METADATA_UUID => Some(Value::from(self.uuid.to_string())),
            METADATA_NAME => Some(Value::from(self.name())),
            METADATA_VERSION => self.version.map(Value::from),
            METADATA_PRODUCER_TYPE => Some(Value::from(self.producer_id.id_type())),
            METADATA_PRODUCER_ID => Some(Value::from(self.producer_id.value())),
            _ => self.metadata.get(name).cloned(),
        }
    }

    /// All attributes, identity attributes included.
    #[must_use]
    pub fn metadata(&self) -> BTreeMap<String, Value> {
        let mut metadata = self.metadata.clone();
        for name in RESERVED {
            if let Some(value) = self.get(name) {
                metadata.insert(name.to_string(), value);
            }
        }
        metadata
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Envelope {}

const fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}
