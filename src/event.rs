//! Graph change data model.
//!
//! A committed transaction is captured as a [`ChangeSet`]: the ordered
//! [`ChangeEvent`]s of that transaction plus the [`TxOrigin`] it was opened
//! with. The origin marker is the sole loop-prevention mechanism: change
//! sets produced by remote-origin transactions are dropped by the capture
//! listener before encoding.
//!
//! # Stable Identifiers
//!
//! Internal database ids are not comparable across peers, so every entity
//! participating in replication must carry a stable identifier: the value
//! of its [`STABLE_ID_PROPERTY`] (`uuid`) property. Capture extracts it
//! into the event; the encoder rejects entities where it is absent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Property name holding the peer-independent stable identifier.
pub const STABLE_ID_PROPERTY: &str = "uuid";

/// A peer-independent entity key (the `uuid` property value).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(pub String);

impl StableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StableId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A scalar graph property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Property snapshot, ordered for deterministic comparison and encoding.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Extract the stable identifier from a property snapshot, if present.
pub fn stable_id_of(properties: &PropertyMap) -> Option<StableId> {
    match properties.get(STABLE_ID_PROPERTY) {
        Some(PropertyValue::String(s)) if !s.is_empty() => Some(StableId::new(s.clone())),
        _ => None,
    }
}

/// Origin marker attached to every transaction at creation time.
///
/// The remote applier opens its transactions as [`TxOrigin::Remote`]; the
/// capture listener inspects the marker and suppresses remote-origin
/// change sets. Passed explicitly as a typed context value, never via
/// thread-locals or globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOrigin {
    /// Transaction initiated by a local writer.
    Local,
    /// Transaction created by applying a remote replication operation.
    Remote,
}

impl fmt::Display for TxOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxOrigin::Local => f.write_str("local"),
            TxOrigin::Remote => f.write_str("remote"),
        }
    }
}

/// A captured node mutation.
///
/// `id` is the stable identifier extracted at capture time; `None` means
/// the node carried no `uuid` property and the encoder will reject it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChange {
    pub id: Option<StableId>,
    pub labels: Vec<String>,
    pub properties: PropertyMap,
}

/// A captured relationship mutation, keyed by endpoint stable ids and type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub start: Option<StableId>,
    pub end: Option<StableId>,
    pub rel_type: String,
    pub properties: PropertyMap,
}

/// One committed graph mutation, in the order the transaction recorded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChangeEvent {
    NodeCreated(NodeChange),
    NodeUpdated(NodeChange),
    NodeDeleted(NodeChange),
    RelationshipCreated(RelationshipChange),
    RelationshipDeleted(RelationshipChange),
}

impl ChangeEvent {
    /// Short description of the entity, for logging rejected events.
    pub fn entity_description(&self) -> String {
        match self {
            ChangeEvent::NodeCreated(n)
            | ChangeEvent::NodeUpdated(n)
            | ChangeEvent::NodeDeleted(n) => format!("node [{}]", n.labels.join(":")),
            ChangeEvent::RelationshipCreated(r) | ChangeEvent::RelationshipDeleted(r) => {
                format!("relationship [:{}]", r.rel_type)
            }
        }
    }
}

/// All events of one committed transaction, plus its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub origin: TxOrigin,
    pub events: Vec<ChangeEvent>,
}

impl ChangeSet {
    pub fn new(origin: TxOrigin, events: Vec<ChangeEvent>) -> Self {
        Self { origin, events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
