// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication operations and the change encoder.
//!
//! A [`ReplicationOperation`] is the wire/queue representation of one
//! captured [`ChangeEvent`]: an idempotent merge/delete descriptor keyed
//! by stable identifiers, plus an origin marker and a per-source
//! monotonic sequence number.
//!
//! Sequence numbers order operations within one source peer's stream and
//! feed diagnostics; they are never compared across peers.
//!
//! # Encoding Rules
//!
//! - `NodeCreated` / `NodeUpdated` → [`OpKind::MergeNode`] (merge by stable
//!   id, overwrite the property snapshot — apply succeeds whether or not
//!   the node already exists remotely).
//! - `NodeDeleted` → [`OpKind::DeleteNode`] (match by id, detach-delete).
//! - `RelationshipCreated` → [`OpKind::MergeRelationship`].
//! - `RelationshipDeleted` → [`OpKind::DeleteRelationship`] (the exact
//!   (start, end, type) triple only, never a cascade).
//!
//! Any entity without a stable identifier is rejected with
//! [`ReplicationError::MissingStableIdentifier`]: internal ids cannot be
//! trusted across peers.
//!
//! Non-finite float properties (NaN, ±inf) are dropped from the encoded
//! snapshot: JSON cannot carry them, and a frame the peer cannot parse
//! loses the whole operation.

use crate::error::{ReplicationError, Result};
use crate::event::{ChangeEvent, PropertyMap, PropertyValue, StableId, TxOrigin};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Idempotent apply descriptor, keyed by stable identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OpKind {
    /// Merge a node by stable id, then overwrite its properties with the
    /// snapshot (last-writer-wins).
    MergeNode {
        id: StableId,
        labels: Vec<String>,
        properties: PropertyMap,
    },
    /// Match a node by stable id and detach-delete it. Absent target is a
    /// no-op on apply.
    DeleteNode { id: StableId },
    /// Merge both endpoint nodes minimally if absent, then merge the
    /// relationship by (start, end, type) and overwrite its properties.
    MergeRelationship {
        start: StableId,
        end: StableId,
        rel_type: String,
        properties: PropertyMap,
    },
    /// Delete exactly the relationship matching (start, end, type).
    DeleteRelationship {
        start: StableId,
        end: StableId,
        rel_type: String,
    },
}

impl OpKind {
    /// Short name for logging and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::MergeNode { .. } => "merge_node",
            OpKind::DeleteNode { .. } => "delete_node",
            OpKind::MergeRelationship { .. } => "merge_relationship",
            OpKind::DeleteRelationship { .. } => "delete_relationship",
        }
    }
}

/// The wire/queue representation of one captured change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOperation {
    /// Node id of the peer that captured the change.
    pub source: String,
    /// Per-source monotonic sequence number (diagnostics / intra-peer
    /// ordering only).
    pub sequence: u64,
    /// Origin of the transaction that produced the change. Always
    /// `Local` when an operation leaves the capturing peer.
    pub origin: TxOrigin,
    /// The idempotent apply descriptor.
    pub op: OpKind,
}

fn require_id(id: &Option<StableId>, event: &ChangeEvent) -> Result<StableId> {
    id.clone()
        .ok_or_else(|| ReplicationError::MissingStableIdentifier {
            entity: event.entity_description(),
        })
}

/// Drop properties JSON cannot represent. Serializing a non-finite
/// float with serde_json yields `null`, which fails to parse back into
/// a [`PropertyValue`] and would cost the peer the whole frame.
fn finite_properties(properties: &PropertyMap, entity: &str) -> PropertyMap {
    properties
        .iter()
        .filter(|(key, value)| match value {
            PropertyValue::Float(f) if !f.is_finite() => {
                warn!(entity, key = %key, value = %f, "dropping non-finite float property");
                false
            }
            _ => true,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Encode one captured change event into a replication operation.
///
/// Deterministic for a given `(source, sequence, event)` triple; never
/// touches the graph or the network.
pub fn encode_event(
    source: &str,
    sequence: u64,
    event: &ChangeEvent,
) -> Result<ReplicationOperation> {
    let op = match event {
        ChangeEvent::NodeCreated(n) | ChangeEvent::NodeUpdated(n) => OpKind::MergeNode {
            id: require_id(&n.id, event)?,
            labels: n.labels.clone(),
            properties: finite_properties(&n.properties, &event.entity_description()),
        },
        ChangeEvent::NodeDeleted(n) => OpKind::DeleteNode {
            id: require_id(&n.id, event)?,
        },
        ChangeEvent::RelationshipCreated(r) => OpKind::MergeRelationship {
            start: require_id(&r.start, event)?,
            end: require_id(&r.end, event)?,
            rel_type: r.rel_type.clone(),
            properties: finite_properties(&r.properties, &event.entity_description()),
        },
        ChangeEvent::RelationshipDeleted(r) => OpKind::DeleteRelationship {
            start: require_id(&r.start, event)?,
            end: require_id(&r.end, event)?,
            rel_type: r.rel_type.clone(),
        },
    };

    Ok(ReplicationOperation {
        source: source.to_string(),
        sequence,
        origin: TxOrigin::Local,
        op,
    })
}
