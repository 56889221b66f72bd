//! Producer identities.
//!
//! Every event stream is keyed by a [`ProducerId`]: an opaque `(type, value)`
//! pair. The type discriminator travels with each envelope so that a typed id
//! can be rebuilt later through an [`IdRegistry`], without the envelope
//! knowing anything about concrete id types.

use std::{any::Any, collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when an identity cannot be parsed or reconstructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The value is not a valid representation for the requested id type.
    #[error("invalid {id_type} id `{value}`")]
    Malformed { id_type: String, value: String },
    /// The id was produced by a different id type than the one requested.
    #[error("expected id of type `{expected}`, found `{found}`")]
    TypeMismatch { expected: &'static str, found: String },
    /// No constructor is registered for the stored type discriminator.
    #[error("no id type registered for `{0}`")]
    UnknownType(String),
}

/// A typed identity that can be converted to and from its string form.
///
/// `TYPE` is the discriminator stored next to the string value; it must be
/// unique among the id types registered in one [`IdRegistry`].
pub trait DomainId: Sized + Send + Sync + 'static {
    const TYPE: &'static str;

    fn to_id_string(&self) -> String;

    /// # Errors
    ///
    /// Returns [`IdError::Malformed`] if `value` is not a valid id.
    fn from_id_string(value: &str) -> Result<Self, IdError>;
}

impl DomainId for Uuid {
    const TYPE: &'static str = "uuid";

    fn to_id_string(&self) -> String {
        self.to_string()
    }

    fn from_id_string(value: &str) -> Result<Self, IdError> {
        Uuid::parse_str(value).map_err(|_| IdError::Malformed {
            id_type: Self::TYPE.to_string(),
            value: value.to_string(),
        })
    }
}

/// Type-erased identity of an event producer.
///
/// Equality is by value: two ids are equal when both the type discriminator
/// and the string value match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    id_type: String,
    value: String,
}

impl ProducerId {
    #[must_use]
    pub fn new(id_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id_type: id_type.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn from_domain<I: DomainId>(id: &I) -> Self {
        Self::new(I::TYPE, id.to_id_string())
    }

    /// A fresh random UUID-backed id.
    #[must_use]
    pub fn random() -> Self {
        Self::from_domain(&Uuid::new_v4())
    }

    #[must_use]
    pub fn id_type(&self) -> &str {
        &self.id_type
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Rebuild the typed id this value was created from.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::TypeMismatch`] if the stored discriminator is not
    /// `I::TYPE`, or [`IdError::Malformed`] if the value does not parse.
    pub fn parse<I: DomainId>(&self) -> Result<I, IdError> {
        if self.id_type != I::TYPE {
            return Err(IdError::TypeMismatch {
                expected: I::TYPE,
                found: self.id_type.clone(),
            });
        }
        I::from_id_string(&self.value)
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id_type, self.value)
    }
}

impl<I: DomainId> From<&I> for ProducerId {
    fn from(id: &I) -> Self {
        Self::from_domain(id)
    }
}

/// Object-safe view of a reconstructed [`DomainId`].
pub trait AnyId: fmt::Debug + Send + Sync {
    fn id_type(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

impl<I: DomainId + fmt::Debug> AnyId for I {
    fn id_type(&self) -> &'static str {
        I::TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyId {
    #[must_use]
    pub fn downcast_ref<I: DomainId>(&self) -> Option<&I> {
        self.as_any().downcast_ref::<I>()
    }
}

type Constructor = fn(&str) -> Result<Box<dyn AnyId>, IdError>;

/// Lookup table from type discriminator to id constructor.
#[derive(Clone, Default)]
pub struct IdRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl IdRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `I` under its [`DomainId::TYPE`]. Re-registering a type keeps
    /// the first constructor.
    #[must_use]
    pub fn register<I: DomainId + fmt::Debug>(mut self) -> Self {
        self.constructors.entry(I::TYPE).or_insert(|value| {
            I::from_id_string(value).map(|id| Box::new(id) as Box<dyn AnyId>)
        });
        self
    }

    #[must_use]
    pub fn contains(&self, id_type: &str) -> bool {
        self.constructors.contains_key(id_type)
    }

    /// Reconstruct the typed id behind `id`.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::UnknownType`] if no constructor is registered for
    /// the id's type, or [`IdError::Malformed`] if the value does not parse.
    pub fn resolve(&self, id: &ProducerId) -> Result<Box<dyn AnyId>, IdError> {
        let constructor = self
            .constructors
            .get(id.id_type())
            .ok_or_else(|| IdError::UnknownType(id.id_type().to_string()))?;
        constructor(id.value())
    }
}

impl fmt::Debug for IdRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("IdRegistry").field("types", &types).finish()
    }
}
