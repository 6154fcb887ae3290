//! In-memory aggregate graph exchanged with the flattener.

use crate::descriptor::{AggregateDescriptor, ContainerKind, ScalarType};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single non-null scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::Text(_) => ScalarType::Text,
            Scalar::Integer(_) => ScalarType::Integer,
            Scalar::Real(_) => ScalarType::Real,
            Scalar::Boolean(_) => ScalarType::Boolean,
            Scalar::Timestamp(_) => ScalarType::Timestamp,
            Scalar::Uuid(_) => ScalarType::Uuid,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Scalar::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Scalar::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Scalar::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Scalar::Uuid(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Real(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Scalar {
    fn from(value: DateTime<Utc>) -> Self {
        Scalar::Timestamp(value)
    }
}

impl From<Uuid> for Scalar {
    fn from(value: Uuid) -> Self {
        Scalar::Uuid(value)
    }
}

/// Named nullable scalars, shared by value objects, entities and roots.
pub type Fields = BTreeMap<String, Option<Scalar>>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueObject {
    pub fields: Fields,
}

impl ValueObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        self.fields.insert(name.to_string(), Some(value.into()));
        self
    }

    pub fn with_null(mut self, name: &str) -> Self {
        self.fields.insert(name.to_string(), None);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name).and_then(Option::as_ref)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: Uuid,
    pub fields: Fields,
    pub embedded: BTreeMap<String, Option<ValueObject>>,
}

impl Entity {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            fields: Fields::new(),
            embedded: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        self.fields.insert(name.to_string(), Some(value.into()));
        self
    }

    pub fn with_null(mut self, name: &str) -> Self {
        self.fields.insert(name.to_string(), None);
        self
    }

    pub fn with_embedded(mut self, name: &str, value: Option<ValueObject>) -> Self {
        self.embedded.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name).and_then(Option::as_ref)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Primitive(Scalar),
    ValueObject(ValueObject),
    Entity(Entity),
}

impl Element {
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Element::Primitive(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_value_object(&self) -> Option<&ValueObject> {
        match self {
            Element::ValueObject(vo) => Some(vo),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Element::Entity(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Scalar> for Element {
    fn from(value: Scalar) -> Self {
        Element::Primitive(value)
    }
}

impl From<ValueObject> for Element {
    fn from(value: ValueObject) -> Self {
        Element::ValueObject(value)
    }
}

impl From<Entity> for Element {
    fn from(value: Entity) -> Self {
        Element::Entity(value)
    }
}

/// Contents of one collection field.
///
/// Equality follows the container: lists compare in order, sets and
/// maps compare as unordered collections.
#[derive(Debug, Clone)]
pub enum CollectionValue {
    List(Vec<Element>),
    Set(Vec<Element>),
    Map(Vec<(Scalar, Element)>),
}

impl CollectionValue {
    pub fn list<I, E>(items: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Element>,
    {
        CollectionValue::List(items.into_iter().map(Into::into).collect())
    }

    /// Build a set, dropping elements equal to one already present.
    pub fn set<I, E>(items: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Element>,
    {
        let mut unique: Vec<Element> = Vec::new();
        for item in items {
            let item = item.into();
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        CollectionValue::Set(unique)
    }

    /// Build a map; a later entry replaces an earlier one with the same key.
    pub fn map<I, K, E>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, E)>,
        K: Into<Scalar>,
        E: Into<Element>,
    {
        let mut unique: Vec<(Scalar, Element)> = Vec::new();
        for (key, value) in entries {
            let key = key.into();
            let value = value.into();
            match unique.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => unique.push((key, value)),
            }
        }
        CollectionValue::Map(unique)
    }

    pub fn empty(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::List => CollectionValue::List(Vec::new()),
            ContainerKind::Set => CollectionValue::Set(Vec::new()),
            ContainerKind::Map => CollectionValue::Map(Vec::new()),
        }
    }

    pub fn container(&self) -> ContainerKind {
        match self {
            CollectionValue::List(_) => ContainerKind::List,
            CollectionValue::Set(_) => ContainerKind::Set,
            CollectionValue::Map(_) => ContainerKind::Map,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CollectionValue::List(items) | CollectionValue::Set(items) => items.len(),
            CollectionValue::Map(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements of a list or set, in stored order.
    pub fn elements(&self) -> &[Element] {
        match self {
            CollectionValue::List(items) | CollectionValue::Set(items) => items,
            CollectionValue::Map(_) => &[],
        }
    }

    /// Entries of a map; empty for lists and sets.
    pub fn entries(&self) -> &[(Scalar, Element)] {
        match self {
            CollectionValue::Map(entries) => entries,
            _ => &[],
        }
    }

    pub fn get(&self, key: &Scalar) -> Option<&Element> {
        match self {
            CollectionValue::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl PartialEq for CollectionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CollectionValue::List(a), CollectionValue::List(b)) => a == b,
            (CollectionValue::Set(a), CollectionValue::Set(b)) => {
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            }
            (CollectionValue::Map(a), CollectionValue::Map(b)) => {
                a.len() == b.len() && a.iter().all(|entry| b.contains(entry))
            }
            _ => false,
        }
    }
}

/// Dynamic form of an aggregate instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub id: Uuid,
    pub scalars: Fields,
    pub embedded: BTreeMap<String, Option<ValueObject>>,
    pub entities: BTreeMap<String, Option<Entity>>,
    pub collections: BTreeMap<String, Option<CollectionValue>>,
}

impl Aggregate {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            scalars: Fields::new(),
            embedded: BTreeMap::new(),
            entities: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        self.scalars.insert(name.to_string(), Some(value.into()));
        self
    }

    pub fn with_null(mut self, name: &str) -> Self {
        self.scalars.insert(name.to_string(), None);
        self
    }

    pub fn with_embedded(mut self, name: &str, value: Option<ValueObject>) -> Self {
        self.embedded.insert(name.to_string(), value);
        self
    }

    pub fn with_entity(mut self, name: &str, value: Option<Entity>) -> Self {
        self.entities.insert(name.to_string(), value);
        self
    }

    pub fn with_collection(mut self, name: &str, value: Option<CollectionValue>) -> Self {
        self.collections.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.scalars.get(name).and_then(Option::as_ref)
    }

    pub fn embedded(&self, name: &str) -> Option<&ValueObject> {
        self.embedded.get(name).and_then(Option::as_ref)
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name).and_then(Option::as_ref)
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionValue> {
        self.collections.get(name).and_then(Option::as_ref)
    }
}

/// Typed domain root that converts to and from the dynamic graph.
pub trait AggregateRoot: Sized + Send + Sync {
    /// Shape of the aggregate. Called once per repository.
    fn descriptor() -> Result<AggregateDescriptor>;

    fn id(&self) -> Uuid;

    fn to_aggregate(&self) -> Aggregate;

    fn from_aggregate(aggregate: Aggregate) -> Result<Self>;
}
