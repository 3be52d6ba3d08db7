// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host database integration traits and the in-memory reference graph.
//!
//! The engine never depends on a concrete database. It needs exactly two
//! capabilities from its host, expressed by [`GraphHost`]:
//!
//! 1. Observe committed mutations without modifying the writer's code
//!    path ([`GraphHost::register_listener`] + [`CommitListener`]).
//! 2. Run a write transaction tagged with a [`TxOrigin`] context value
//!    ([`GraphHost::execute`]), which is how the remote applier marks its
//!    commits as remote-origin.
//!
//! [`MemoryGraph`] is the reference implementation used by tests and
//! standalone operation. Its merge/delete semantics mirror the remote
//! apply contract: merge is keyed by the stable identifier, node deletion
//! can detach incident relationships, and relationship deletion is scoped
//! to the exact (start, end, type) triple.

use crate::error::{ReplicationError, Result};
use crate::event::{
    stable_id_of, ChangeEvent, ChangeSet, NodeChange, PropertyMap, PropertyValue,
    RelationshipChange, StableId, TxOrigin, STABLE_ID_PROPERTY,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

/// Handle for a registered commit listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observer of committed transactions.
///
/// Called synchronously in the commit path, after the transaction's
/// mutations are applied. Implementations must be fast and must never
/// block; heavy work is handed off through a bounded queue.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, change_set: &ChangeSet);
}

/// The narrow capability interface the host database must provide.
pub trait GraphHost: Send + Sync + 'static {
    /// Attach a commit listener. It observes every transaction committed
    /// after registration, in commit order.
    fn register_listener(&self, listener: Arc<dyn CommitListener>) -> ListenerId;

    /// Detach a previously registered listener. Unknown ids are ignored.
    fn unregister_listener(&self, id: ListenerId);

    /// Atomically apply a write transaction tagged with `origin` and
    /// return the resulting change set (also delivered to listeners).
    fn execute(&self, origin: TxOrigin, tx: Transaction) -> Result<ChangeSet>;
}

// =============================================================================
// Transaction: a recorded batch of mutations
// =============================================================================

#[derive(Debug, Clone)]
enum Mutation {
    CreateNode {
        labels: Vec<String>,
        properties: PropertyMap,
    },
    MergeNode {
        labels: Vec<String>,
        properties: PropertyMap,
    },
    DeleteNode {
        id: StableId,
        detach: bool,
    },
    MergeRelationship {
        start: StableId,
        end: StableId,
        rel_type: String,
        properties: PropertyMap,
    },
    DeleteRelationship {
        start: StableId,
        end: StableId,
        rel_type: String,
    },
}

/// A write transaction: mutations recorded in order, applied atomically
/// by [`GraphHost::execute`].
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    mutations: Vec<Mutation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Create a node unconditionally.
    pub fn create_node(
        &mut self,
        labels: impl IntoIterator<Item = impl Into<String>>,
        properties: PropertyMap,
    ) -> &mut Self {
        self.mutations.push(Mutation::CreateNode {
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
        });
        self
    }

    /// Merge a node keyed by its `uuid` property: update in place if a
    /// node with that identifier exists, create it otherwise.
    pub fn merge_node(
        &mut self,
        labels: impl IntoIterator<Item = impl Into<String>>,
        properties: PropertyMap,
    ) -> &mut Self {
        self.mutations.push(Mutation::MergeNode {
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
        });
        self
    }

    /// Delete the node with the given stable identifier. With `detach`,
    /// incident relationships are removed first; without it, the
    /// transaction fails if any remain.
    pub fn delete_node(&mut self, id: impl Into<StableId>, detach: bool) -> &mut Self {
        self.mutations.push(Mutation::DeleteNode {
            id: id.into(),
            detach,
        });
        self
    }

    /// Merge a relationship keyed by (start, end, type), creating absent
    /// endpoint nodes minimally.
    pub fn merge_relationship(
        &mut self,
        start: impl Into<StableId>,
        end: impl Into<StableId>,
        rel_type: impl Into<String>,
        properties: PropertyMap,
    ) -> &mut Self {
        self.mutations.push(Mutation::MergeRelationship {
            start: start.into(),
            end: end.into(),
            rel_type: rel_type.into(),
            properties,
        });
        self
    }

    /// Delete exactly the relationship matching (start, end, type).
    pub fn delete_relationship(
        &mut self,
        start: impl Into<StableId>,
        end: impl Into<StableId>,
        rel_type: impl Into<String>,
    ) -> &mut Self {
        self.mutations.push(Mutation::DeleteRelationship {
            start: start.into(),
            end: end.into(),
            rel_type: rel_type.into(),
        });
        self
    }
}

// =============================================================================
// MemoryGraph
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct NodeRecord {
    labels: Vec<String>,
    properties: PropertyMap,
}

type RelKey = (u64, u64, String);

#[derive(Default)]
struct GraphInner {
    next_internal_id: u64,
    nodes: HashMap<u64, NodeRecord>,
    by_stable_id: HashMap<StableId, u64>,
    relationships: HashMap<RelKey, PropertyMap>,
}

impl GraphInner {
    fn alloc_id(&mut self) -> u64 {
        self.next_internal_id += 1;
        self.next_internal_id
    }

    fn incident_relationships(&self, node: u64) -> Vec<RelKey> {
        self.relationships
            .keys()
            .filter(|(s, e, _)| *s == node || *e == node)
            .cloned()
            .collect()
    }

    /// Minimal merge of an endpoint node: existing node by stable id, or
    /// a fresh unlabeled node carrying only the identifier property.
    fn merge_endpoint(&mut self, id: &StableId, events: &mut Vec<ChangeEvent>) -> u64 {
        if let Some(&internal) = self.by_stable_id.get(id) {
            return internal;
        }
        let mut properties = PropertyMap::new();
        properties.insert(
            STABLE_ID_PROPERTY.to_string(),
            PropertyValue::String(id.0.clone()),
        );
        let internal = self.alloc_id();
        self.nodes.insert(
            internal,
            NodeRecord {
                labels: Vec::new(),
                properties: properties.clone(),
            },
        );
        self.by_stable_id.insert(id.clone(), internal);
        events.push(ChangeEvent::NodeCreated(NodeChange {
            id: Some(id.clone()),
            labels: Vec::new(),
            properties,
        }));
        internal
    }

    fn rel_change(&self, key: &RelKey, properties: PropertyMap) -> RelationshipChange {
        let node_id = |internal: &u64| {
            self.nodes
                .get(internal)
                .and_then(|n| stable_id_of(&n.properties))
        };
        RelationshipChange {
            start: node_id(&key.0),
            end: node_id(&key.1),
            rel_type: key.2.clone(),
            properties,
        }
    }
}

/// Comparable view of all uuid-keyed state, for convergence checks.
///
/// Nodes without a stable identifier never replicate, so they are
/// excluded from the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<StableId, (Vec<String>, PropertyMap)>,
    pub relationships: BTreeMap<(StableId, StableId, String), PropertyMap>,
}

/// In-memory graph host.
///
/// Thread-safe: the commit lock serializes apply plus listener fan-out,
/// so listeners observe change sets in commit order. The data lock is
/// released before fan-out, so listeners may read the graph.
pub struct MemoryGraph {
    inner: Mutex<GraphInner>,
    commit: Mutex<()>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CommitListener>)>>,
    next_listener_id: AtomicU64,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GraphInner::default()),
            commit: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Number of nodes, including those without a stable identifier.
    pub fn node_count(&self) -> usize {
        self.inner.lock().expect("graph lock poisoned").nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.inner
            .lock()
            .expect("graph lock poisoned")
            .relationships
            .len()
    }

    /// Fetch a node's labels and properties by stable identifier.
    pub fn get_node(&self, id: &StableId) -> Option<(Vec<String>, PropertyMap)> {
        let inner = self.inner.lock().expect("graph lock poisoned");
        let internal = inner.by_stable_id.get(id)?;
        inner
            .nodes
            .get(internal)
            .map(|n| (n.labels.clone(), n.properties.clone()))
    }

    pub fn has_node(&self, id: &StableId) -> bool {
        self.get_node(id).is_some()
    }

    /// Count nodes carrying the given stable identifier (duplicates are
    /// possible via unconditional `create_node`).
    pub fn count_nodes_with_id(&self, id: &StableId) -> usize {
        let inner = self.inner.lock().expect("graph lock poisoned");
        inner
            .nodes
            .values()
            .filter(|n| stable_id_of(&n.properties).as_ref() == Some(id))
            .count()
    }

    pub fn has_relationship(&self, start: &StableId, end: &StableId, rel_type: &str) -> bool {
        let inner = self.inner.lock().expect("graph lock poisoned");
        let (Some(&s), Some(&e)) = (inner.by_stable_id.get(start), inner.by_stable_id.get(end))
        else {
            return false;
        };
        inner
            .relationships
            .contains_key(&(s, e, rel_type.to_string()))
    }

    /// Comparable view of replicated state, for convergence assertions.
    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.lock().expect("graph lock poisoned");
        let mut nodes = BTreeMap::new();
        for record in inner.nodes.values() {
            if let Some(id) = stable_id_of(&record.properties) {
                nodes.insert(id, (record.labels.clone(), record.properties.clone()));
            }
        }
        let mut relationships = BTreeMap::new();
        for (key, properties) in &inner.relationships {
            let change = inner.rel_change(key, properties.clone());
            if let (Some(start), Some(end)) = (change.start, change.end) {
                relationships.insert((start, end, key.2.clone()), properties.clone());
            }
        }
        GraphSnapshot {
            nodes,
            relationships,
        }
    }

    fn apply(&self, tx: Transaction) -> Result<Vec<ChangeEvent>> {
        let mut inner = self.inner.lock().expect("graph lock poisoned");
        let mut events = Vec::new();

        for mutation in tx.mutations {
            match mutation {
                Mutation::CreateNode { labels, properties } => {
                    let internal = inner.alloc_id();
                    inner.nodes.insert(
                        internal,
                        NodeRecord {
                            labels: labels.clone(),
                            properties: properties.clone(),
                        },
                    );
                    let id = stable_id_of(&properties);
                    if let Some(ref id) = id {
                        inner.by_stable_id.insert(id.clone(), internal);
                    }
                    events.push(ChangeEvent::NodeCreated(NodeChange {
                        id,
                        labels,
                        properties,
                    }));
                }
                Mutation::MergeNode { labels, properties } => {
                    let id = stable_id_of(&properties);
                    let existing = id
                        .as_ref()
                        .and_then(|id| inner.by_stable_id.get(id).copied());
                    match existing {
                        Some(internal) => {
                            // Last-writer-wins: overwrite the snapshot wholesale
                            let record = inner
                                .nodes
                                .get_mut(&internal)
                                .ok_or_else(|| {
                                    ReplicationError::Internal(
                                        "stable id index out of sync".to_string(),
                                    )
                                })?;
                            record.properties = properties.clone();
                            for label in &labels {
                                if !record.labels.contains(label) {
                                    record.labels.push(label.clone());
                                }
                            }
                            let labels = record.labels.clone();
                            events.push(ChangeEvent::NodeUpdated(NodeChange {
                                id,
                                labels,
                                properties,
                            }));
                        }
                        None => {
                            let internal = inner.alloc_id();
                            inner.nodes.insert(
                                internal,
                                NodeRecord {
                                    labels: labels.clone(),
                                    properties: properties.clone(),
                                },
                            );
                            if let Some(ref id) = id {
                                inner.by_stable_id.insert(id.clone(), internal);
                            }
                            events.push(ChangeEvent::NodeCreated(NodeChange {
                                id,
                                labels,
                                properties,
                            }));
                        }
                    }
                }
                Mutation::DeleteNode { id, detach } => {
                    let Some(&internal) = inner.by_stable_id.get(&id) else {
                        trace!(id = %id, "delete target absent, skipping");
                        continue;
                    };
                    let incident = inner.incident_relationships(internal);
                    if !incident.is_empty() && !detach {
                        return Err(ReplicationError::Internal(format!(
                            "cannot delete node {} with {} relationships (detach required)",
                            id,
                            incident.len()
                        )));
                    }
                    for key in incident {
                        let properties = inner.relationships.remove(&key).unwrap_or_default();
                        let change = inner.rel_change(&key, properties);
                        events.push(ChangeEvent::RelationshipDeleted(change));
                    }
                    let record = inner.nodes.remove(&internal);
                    inner.by_stable_id.remove(&id);
                    let (labels, properties) = record
                        .map(|r| (r.labels, r.properties))
                        .unwrap_or_default();
                    events.push(ChangeEvent::NodeDeleted(NodeChange {
                        id: Some(id),
                        labels,
                        properties,
                    }));
                }
                Mutation::MergeRelationship {
                    start,
                    end,
                    rel_type,
                    properties,
                } => {
                    let s = inner.merge_endpoint(&start, &mut events);
                    let e = inner.merge_endpoint(&end, &mut events);
                    let key = (s, e, rel_type.clone());
                    let unchanged = inner.relationships.get(&key) == Some(&properties);
                    inner.relationships.insert(key, properties.clone());
                    if !unchanged {
                        events.push(ChangeEvent::RelationshipCreated(RelationshipChange {
                            start: Some(start),
                            end: Some(end),
                            rel_type,
                            properties,
                        }));
                    }
                }
                Mutation::DeleteRelationship {
                    start,
                    end,
                    rel_type,
                } => {
                    let key = {
                        let (Some(&s), Some(&e)) = (
                            inner.by_stable_id.get(&start),
                            inner.by_stable_id.get(&end),
                        ) else {
                            trace!(%start, %end, rel_type, "relationship endpoints absent, skipping");
                            continue;
                        };
                        (s, e, rel_type.clone())
                    };
                    if inner.relationships.remove(&key).is_none() {
                        trace!(%start, %end, rel_type, "relationship absent, skipping");
                        continue;
                    }
                    events.push(ChangeEvent::RelationshipDeleted(RelationshipChange {
                        start: Some(start),
                        end: Some(end),
                        rel_type,
                        properties: PropertyMap::new(),
                    }));
                }
            }
        }

        Ok(events)
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphHost for MemoryGraph {
    fn register_listener(&self, listener: Arc<dyn CommitListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push((id, listener));
        id
    }

    fn unregister_listener(&self, id: ListenerId) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .retain(|(lid, _)| *lid != id);
    }

    fn execute(&self, origin: TxOrigin, tx: Transaction) -> Result<ChangeSet> {
        // Apply and fan-out run under one lock: a later commit must not
        // reach listeners before an earlier one, or the peer can replay
        // a create after its delete.
        let _commit = self.commit.lock().expect("commit lock poisoned");

        let events = self.apply(tx)?;
        let change_set = ChangeSet::new(origin, events);

        if !change_set.is_empty() {
            let listeners = self.listeners.read().expect("listener lock poisoned");
            for (_, listener) in listeners.iter() {
                listener.on_commit(&change_set);
            }
        }
        Ok(change_set)
    }
}
