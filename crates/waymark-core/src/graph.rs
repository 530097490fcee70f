//! Graph and open-edge model.
//!
//! The [`Graph`] is the container for all nodes and edges in a session. It
//! provides:
//! - Node and edge storage with deterministic iteration order (`BTreeMap`)
//! - Monotonic id allocation for nodes, edges, and requirements
//! - Instrumented mutators that journal every write as a [`ChangeEvent`]
//! - Content hashing for replay verification
//! - Frontier and distance queries for the planning pass
//!
//! # Open edges
//!
//! Two edge kinds carry an unresolved endpoint:
//! - [`EdgeKind::Dependency`]: the source is known (the owner), the
//!   destination is open — "I need X" (pull).
//! - [`EdgeKind::Affordance`]: the destination is known (the provider), the
//!   source is open — "X is available to whoever qualifies" (push).
//!
//! An open endpoint may be rebound freely while the owning node is unvisited.
//! Once the owner has been visited (left the frontier), the binding is frozen
//! and rebind attempts fail with [`EngineError::RebindAfterVisit`].
//!
//! # Write instrumentation
//!
//! Every mutator appends a [`ChangeEvent`] to an internal journal. The frame
//! drains the journal at FINALIZE and hands it to the ledger; replay goes the
//! other way through [`Graph::apply_event`], which writes directly without
//! journaling.
//!
//! # Determinism
//!
//! All storage is `BTreeMap`-backed so iteration order is stable across
//! platforms, and [`Graph::content_hash`] hashes entities in sorted order
//! with `DefaultHasher` (fixed-key SipHash), so two graphs with identical
//! content always produce identical hashes.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::EngineError;
use crate::requirement::{Requirement, RequirementSpec};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a node within one graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a node id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Unique identifier for an edge within one graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EdgeId(u64);

impl EdgeId {
    /// Creates an edge id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge:{}", self.0)
    }
}

/// Unique identifier for a requirement within one graph.
///
/// Requirement ids are allocated in creation order, which the resolver uses
/// as the stable acceptance order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RequirementId(u64);

impl RequirementId {
    /// Creates a requirement id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequirementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

// =============================================================================
// Field values
// =============================================================================

/// A field value stored on a node.
///
/// Kept to hashable scalar types so content hashing is platform-stable;
/// floats are deliberately excluded.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Value {
    /// A text value.
    Text(String),
    /// A signed integer value.
    Int(i64),
    /// A boolean value.
    Bool(bool),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

// =============================================================================
// Nodes
// =============================================================================

bitflags! {
    /// Status flags for a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct NodeFlags: u8 {
        /// The node has been visited: it has left the frontier and its bound
        /// open edges are frozen.
        const VISITED = 0b0000_0001;
    }
}

/// A graph entity with a stable identifier, a label, and typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    label: String,
    fields: BTreeMap<String, Value>,
    flags: NodeFlags,
}

impl Node {
    /// Returns the node's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the node's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns a field value by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns all fields in sorted order.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Returns true if the node has been visited.
    #[must_use]
    pub fn visited(&self) -> bool {
        self.flags.contains(NodeFlags::VISITED)
    }

    /// Returns the node's status flags.
    #[must_use]
    pub const fn flags(&self) -> NodeFlags {
        self.flags
    }
}

// =============================================================================
// Edges
// =============================================================================

/// The kind of a directed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// An explicit step transition; the frontier is the set of transition
    /// successors of the cursor.
    Transition,
    /// Pull-pattern open edge: known source, destination to resolve.
    Dependency,
    /// Push-pattern open edge: known destination, source to resolve.
    Affordance,
}

/// Which endpoint of an edge a bind targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// The edge's source.
    Source,
    /// The edge's destination.
    Dest,
}

/// A directed edge. Open-edge kinds carry a [`Requirement`] describing what
/// the unresolved endpoint needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    id: EdgeId,
    kind: EdgeKind,
    source: Option<NodeId>,
    dest: Option<NodeId>,
    requirement: Option<Requirement>,
}

impl Edge {
    /// Returns the edge's id.
    #[must_use]
    pub const fn id(&self) -> EdgeId {
        self.id
    }

    /// Returns the edge's kind.
    #[must_use]
    pub const fn kind(&self) -> EdgeKind {
        self.kind
    }

    /// Returns the source endpoint, if bound.
    #[must_use]
    pub const fn source(&self) -> Option<NodeId> {
        self.source
    }

    /// Returns the destination endpoint, if bound.
    #[must_use]
    pub const fn dest(&self) -> Option<NodeId> {
        self.dest
    }

    /// Returns the requirement attached to this open edge, if any.
    #[must_use]
    pub fn requirement(&self) -> Option<&Requirement> {
        self.requirement.as_ref()
    }

    /// Returns the node that owns this edge: the known endpoint of an open
    /// edge, or the source of a transition.
    #[must_use]
    pub fn owner(&self) -> Option<NodeId> {
        match self.kind {
            EdgeKind::Transition | EdgeKind::Dependency => self.source,
            EdgeKind::Affordance => self.dest,
        }
    }

    /// Returns which endpoint is the one to resolve, for open-edge kinds.
    #[must_use]
    pub fn open_endpoint(&self) -> Option<Endpoint> {
        match self.kind {
            EdgeKind::Dependency => Some(Endpoint::Dest),
            EdgeKind::Affordance => Some(Endpoint::Source),
            EdgeKind::Transition => None,
        }
    }

    /// Returns the current binding of the open endpoint, if any.
    #[must_use]
    pub fn bound_to(&self) -> Option<NodeId> {
        match self.open_endpoint()? {
            Endpoint::Source => self.source,
            Endpoint::Dest => self.dest,
        }
    }

    /// Returns true if this is an open-edge kind whose endpoint is unbound.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open_endpoint().is_some() && self.bound_to().is_none()
    }
}

// =============================================================================
// Change events
// =============================================================================

/// One atomic graph mutation, journaled by the instrumented mutators and
/// replayed by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// A node was created.
    NodeCreated {
        /// Assigned id.
        id: NodeId,
        /// Node label.
        label: String,
        /// Initial fields.
        fields: BTreeMap<String, Value>,
    },
    /// A node and its incident edges were removed.
    NodeRemoved {
        /// Removed node id.
        id: NodeId,
    },
    /// An edge was created.
    EdgeCreated {
        /// Assigned id.
        id: EdgeId,
        /// Edge kind.
        kind: EdgeKind,
        /// Source endpoint, if known at creation.
        source: Option<NodeId>,
        /// Destination endpoint, if known at creation.
        dest: Option<NodeId>,
        /// Requirement attached to an open edge.
        requirement: Option<Requirement>,
    },
    /// An edge was removed (as part of node removal).
    EdgeRemoved {
        /// Removed edge id.
        id: EdgeId,
    },
    /// A field was set, changed, or cleared.
    FieldSet {
        /// Node holding the field.
        target: NodeId,
        /// Field name.
        field: String,
        /// Previous value, if any.
        old: Option<Value>,
        /// New value; `None` clears the field.
        new: Option<Value>,
    },
    /// An open edge endpoint was bound or rebound.
    EdgeBound {
        /// The edge.
        edge: EdgeId,
        /// Which endpoint was bound.
        endpoint: Endpoint,
        /// Previous binding, if any (rebind before visitation).
        old: Option<NodeId>,
        /// New binding.
        new: NodeId,
    },
    /// A node's status flags changed.
    FlagsSet {
        /// The node.
        node: NodeId,
        /// Previous flags.
        old: NodeFlags,
        /// New flags.
        new: NodeFlags,
    },
}

// =============================================================================
// Graph
// =============================================================================

/// The mutable dependency graph for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// Monotonically increasing node id counter.
    next_node_id: u64,
    /// Monotonically increasing edge id counter.
    next_edge_id: u64,
    /// Monotonically increasing requirement id counter.
    next_requirement_id: u64,
    /// Node storage with deterministic iteration order.
    nodes: BTreeMap<NodeId, Node>,
    /// Edge storage with deterministic iteration order.
    edges: BTreeMap<EdgeId, Edge>,
    /// Journal of uncommitted mutations, drained at FINALIZE.
    ///
    /// Not persisted: snapshots capture settled state only.
    #[serde(skip)]
    journal: Vec<ChangeEvent>,
}

impl Graph {
    /// Creates a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_node_id: 0,
            next_edge_id: 0,
            next_requirement_id: 0,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            journal: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Instrumented mutators
    // -------------------------------------------------------------------------

    /// Creates a node with the given label and fields.
    pub fn create_node(
        &mut self,
        label: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) -> NodeId {
        let id = NodeId::new(self.next_node_id);
        self.next_node_id += 1;
        let label = label.into();
        trace!(%id, %label, "create node");
        self.journal.push(ChangeEvent::NodeCreated {
            id,
            label: label.clone(),
            fields: fields.clone(),
        });
        self.nodes.insert(
            id,
            Node {
                id,
                label,
                fields,
                flags: NodeFlags::empty(),
            },
        );
        id
    }

    /// Removes a node and all its incident edges. Requirements attached to
    /// the removed edges die with them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownNode`] if the node does not exist.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), EngineError> {
        if !self.nodes.contains_key(&id) {
            return Err(EngineError::UnknownNode(id));
        }
        let incident: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|e| e.source == Some(id) || e.dest == Some(id))
            .map(Edge::id)
            .collect();
        for edge in incident {
            self.edges.remove(&edge);
            self.journal.push(ChangeEvent::EdgeRemoved { id: edge });
        }
        self.nodes.remove(&id);
        self.journal.push(ChangeEvent::NodeRemoved { id });
        Ok(())
    }

    /// Creates a transition edge between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownNode`] if either endpoint is missing.
    pub fn add_transition(&mut self, from: NodeId, to: NodeId) -> Result<EdgeId, EngineError> {
        self.require_node(from)?;
        self.require_node(to)?;
        Ok(self.insert_edge(EdgeKind::Transition, Some(from), Some(to), None))
    }

    /// Creates an open dependency edge owned by `owner`, with a freshly
    /// allocated requirement built from `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownNode`] if the owner is missing.
    pub fn add_dependency(
        &mut self,
        owner: NodeId,
        spec: RequirementSpec,
    ) -> Result<EdgeId, EngineError> {
        self.require_node(owner)?;
        let requirement = self.alloc_requirement(spec);
        Ok(self.insert_edge(EdgeKind::Dependency, Some(owner), None, Some(requirement)))
    }

    /// Creates an open affordance edge whose provider is `provider`, with a
    /// freshly allocated requirement describing qualifying recipients.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownNode`] if the provider is missing.
    pub fn add_affordance(
        &mut self,
        provider: NodeId,
        spec: RequirementSpec,
    ) -> Result<EdgeId, EngineError> {
        self.require_node(provider)?;
        let requirement = self.alloc_requirement(spec);
        Ok(self.insert_edge(EdgeKind::Affordance, None, Some(provider), Some(requirement)))
    }

    /// Sets, changes, or clears (`value == None`) a field on a node,
    /// returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownNode`] if the node does not exist.
    pub fn set_field(
        &mut self,
        target: NodeId,
        field: &str,
        value: Option<Value>,
    ) -> Result<Option<Value>, EngineError> {
        let node = self
            .nodes
            .get_mut(&target)
            .ok_or(EngineError::UnknownNode(target))?;
        let old = match &value {
            Some(v) => node.fields.insert(field.to_string(), v.clone()),
            None => node.fields.remove(field),
        };
        self.journal.push(ChangeEvent::FieldSet {
            target,
            field: field.to_string(),
            old: old.clone(),
            new: value,
        });
        Ok(old)
    }

    /// Binds (or rebinds) the open endpoint of a dependency or affordance
    /// edge to `provider`.
    ///
    /// Rebinding is permitted only while the owning node is unvisited; once
    /// the owner has been visited the binding is frozen.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnknownEdge`] / [`EngineError::UnknownNode`] for
    ///   missing entities.
    /// - [`EngineError::InvalidBind`] when the edge has no open endpoint.
    /// - [`EngineError::RebindAfterVisit`] when the binding is frozen.
    pub fn bind_edge(&mut self, edge: EdgeId, provider: NodeId) -> Result<(), EngineError> {
        self.require_node(provider)?;
        let owner_visited = {
            let e = self.edges.get(&edge).ok_or(EngineError::UnknownEdge(edge))?;
            e.owner()
                .and_then(|o| self.nodes.get(&o))
                .is_some_and(Node::visited)
        };
        let e = self.edges.get_mut(&edge).ok_or(EngineError::UnknownEdge(edge))?;
        let endpoint = e.open_endpoint().ok_or_else(|| EngineError::InvalidBind {
            edge,
            reason: format!("{:?} edges have no open endpoint", e.kind),
        })?;
        let old = e.bound_to();
        if old.is_some() && owner_visited {
            return Err(EngineError::RebindAfterVisit { edge });
        }
        match endpoint {
            Endpoint::Source => e.source = Some(provider),
            Endpoint::Dest => e.dest = Some(provider),
        }
        trace!(%edge, %provider, rebind = old.is_some(), "bind edge");
        self.journal.push(ChangeEvent::EdgeBound {
            edge,
            endpoint,
            old,
            new: provider,
        });
        Ok(())
    }

    /// Marks a node as visited, freezing the bindings of its open edges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownNode`] if the node does not exist.
    pub fn mark_visited(&mut self, id: NodeId) -> Result<(), EngineError> {
        let node = self.nodes.get_mut(&id).ok_or(EngineError::UnknownNode(id))?;
        let old = node.flags;
        let new = old | NodeFlags::VISITED;
        if new == old {
            return Ok(());
        }
        node.flags = new;
        self.journal.push(ChangeEvent::FlagsSet { node: id, old, new });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Journal
    // -------------------------------------------------------------------------

    /// Drains and returns all journaled mutations since the last drain.
    pub fn drain_journal(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.journal)
    }

    /// Discards all journaled mutations without returning them.
    pub fn discard_journal(&mut self) {
        self.journal.clear();
    }

    /// Returns the number of uncommitted journaled mutations.
    #[must_use]
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Applies one change event directly, without journaling. This is the
    /// replay entry point used by the ledger.
    ///
    /// Id counters are bumped past replayed ids so that allocation stays
    /// monotonic after a rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownNode`] / [`EngineError::UnknownEdge`]
    /// when the event references entities the graph does not contain.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<(), EngineError> {
        match event {
            ChangeEvent::NodeCreated { id, label, fields } => {
                self.next_node_id = self.next_node_id.max(id.as_u64() + 1);
                self.nodes.insert(
                    *id,
                    Node {
                        id: *id,
                        label: label.clone(),
                        fields: fields.clone(),
                        flags: NodeFlags::empty(),
                    },
                );
            }
            ChangeEvent::NodeRemoved { id } => {
                self.nodes.remove(id).ok_or(EngineError::UnknownNode(*id))?;
            }
            ChangeEvent::EdgeCreated {
                id,
                kind,
                source,
                dest,
                requirement,
            } => {
                self.next_edge_id = self.next_edge_id.max(id.as_u64() + 1);
                if let Some(req) = requirement {
                    self.next_requirement_id =
                        self.next_requirement_id.max(req.id().as_u64() + 1);
                }
                self.edges.insert(
                    *id,
                    Edge {
                        id: *id,
                        kind: *kind,
                        source: *source,
                        dest: *dest,
                        requirement: requirement.clone(),
                    },
                );
            }
            ChangeEvent::EdgeRemoved { id } => {
                self.edges.remove(id).ok_or(EngineError::UnknownEdge(*id))?;
            }
            ChangeEvent::FieldSet {
                target, field, new, ..
            } => {
                let node = self
                    .nodes
                    .get_mut(target)
                    .ok_or(EngineError::UnknownNode(*target))?;
                match new {
                    Some(v) => {
                        node.fields.insert(field.clone(), v.clone());
                    }
                    None => {
                        node.fields.remove(field);
                    }
                }
            }
            ChangeEvent::EdgeBound {
                edge,
                endpoint,
                new,
                ..
            } => {
                let e = self
                    .edges
                    .get_mut(edge)
                    .ok_or(EngineError::UnknownEdge(*edge))?;
                match endpoint {
                    Endpoint::Source => e.source = Some(*new),
                    Endpoint::Dest => e.dest = Some(*new),
                }
            }
            ChangeEvent::FlagsSet { node, new, .. } => {
                let n = self
                    .nodes
                    .get_mut(node)
                    .ok_or(EngineError::UnknownNode(*node))?;
                n.flags = *new;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Returns an edge by id.
    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Returns an iterator over nodes in deterministic (sorted by id) order.
    pub fn nodes_sorted(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.values()
    }

    /// Returns an iterator over edges in deterministic (sorted by id) order.
    pub fn edges_sorted(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.values()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns the outgoing transition edges of a node as `(edge, target)`
    /// pairs in edge-id order.
    #[must_use]
    pub fn transitions_from(&self, node: NodeId) -> Vec<(EdgeId, NodeId)> {
        self.edges
            .values()
            .filter(|e| e.kind == EdgeKind::Transition && e.source == Some(node))
            .filter_map(|e| e.dest.map(|d| (e.id, d)))
            .collect()
    }

    /// Returns the frontier for a cursor: the transition successors, or the
    /// cursor itself when no transitions exist (terminal case).
    #[must_use]
    pub fn frontier(&self, cursor: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .transitions_from(cursor)
            .into_iter()
            .map(|(_, to)| to)
            .collect();
        out.sort_unstable();
        out.dedup();
        if out.is_empty() {
            out.push(cursor);
        }
        out
    }

    /// Returns the open (unbound) dependency edges owned by a node, in
    /// edge-id order.
    #[must_use]
    pub fn open_dependencies_of(&self, owner: NodeId) -> Vec<EdgeId> {
        self.edges
            .values()
            .filter(|e| e.kind == EdgeKind::Dependency && e.source == Some(owner) && e.is_open())
            .map(Edge::id)
            .collect()
    }

    /// Returns all open (unbound) affordance edges, in edge-id order.
    #[must_use]
    pub fn open_affordances(&self) -> Vec<EdgeId> {
        self.edges
            .values()
            .filter(|e| e.kind == EdgeKind::Affordance && e.is_open())
            .map(Edge::id)
            .collect()
    }

    /// Computes graph distances from `start` by breadth-first search over all
    /// fully-bound edges, treated as undirected.
    ///
    /// The result is a finite, owned map; callers needing multiple passes
    /// reuse it rather than re-scanning.
    #[must_use]
    pub fn distances_from(&self, start: NodeId) -> BTreeMap<NodeId, u32> {
        let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for edge in self.edges.values() {
            if let (Some(a), Some(b)) = (edge.source, edge.dest) {
                adjacency.entry(a).or_default().push(b);
                adjacency.entry(b).or_default().push(a);
            }
        }
        let mut distances = BTreeMap::new();
        if !self.nodes.contains_key(&start) {
            return distances;
        }
        distances.insert(start, 0);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let d = distances[&current];
            if let Some(neighbors) = adjacency.get(&current) {
                for &next in neighbors {
                    if let std::collections::btree_map::Entry::Vacant(entry) =
                        distances.entry(next)
                    {
                        entry.insert(d + 1);
                        queue.push_back(next);
                    }
                }
            }
        }
        distances
    }

    /// Computes a deterministic content hash of the graph.
    ///
    /// Covers id counters, nodes, and edges in sorted order; the uncommitted
    /// journal is excluded. Two graphs with identical content always hash
    /// identically, which replay verification depends on.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.next_node_id.hash(&mut hasher);
        self.next_edge_id.hash(&mut hasher);
        self.next_requirement_id.hash(&mut hasher);
        for node in self.nodes.values() {
            node.hash(&mut hasher);
        }
        for edge in self.edges.values() {
            edge.hash(&mut hasher);
        }
        hasher.finish()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn require_node(&self, id: NodeId) -> Result<(), EngineError> {
        if self.nodes.contains_key(&id) {
            Ok(())
        } else {
            Err(EngineError::UnknownNode(id))
        }
    }

    fn alloc_requirement(&mut self, spec: RequirementSpec) -> Requirement {
        let id = RequirementId::new(self.next_requirement_id);
        self.next_requirement_id += 1;
        spec.into_requirement(id)
    }

    fn insert_edge(
        &mut self,
        kind: EdgeKind,
        source: Option<NodeId>,
        dest: Option<NodeId>,
        requirement: Option<Requirement>,
    ) -> EdgeId {
        let id = EdgeId::new(self.next_edge_id);
        self.next_edge_id += 1;
        self.journal.push(ChangeEvent::EdgeCreated {
            id,
            kind,
            source,
            dest,
            requirement: requirement.clone(),
        });
        self.edges.insert(
            id,
            Edge {
                id,
                kind,
                source,
                dest,
                requirement,
            },
        );
        id
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirement::{MatchCriteria, ProvisionPolicy};

    fn spec() -> RequirementSpec {
        RequirementSpec {
            ident: Some("key".to_string()),
            criteria: MatchCriteria::default(),
            template: None,
            policy: ProvisionPolicy::Any,
            hard: true,
        }
    }

    #[test]
    fn create_node_assigns_sequential_ids() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let b = g.create_node("b", BTreeMap::new());
        assert_eq!(a, NodeId::new(0));
        assert_eq!(b, NodeId::new(1));
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn mutators_journal_events() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        g.set_field(a, "hp", Some(Value::Int(3))).unwrap();
        let events = g.drain_journal();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChangeEvent::NodeCreated { .. }));
        assert!(matches!(events[1], ChangeEvent::FieldSet { .. }));
        assert_eq!(g.journal_len(), 0);
    }

    #[test]
    fn set_field_returns_previous_value() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        assert_eq!(g.set_field(a, "hp", Some(Value::Int(3))).unwrap(), None);
        assert_eq!(
            g.set_field(a, "hp", Some(Value::Int(5))).unwrap(),
            Some(Value::Int(3))
        );
        assert_eq!(g.set_field(a, "hp", None).unwrap(), Some(Value::Int(5)));
        assert!(g.node(a).unwrap().field("hp").is_none());
    }

    #[test]
    fn dependency_edge_is_open_until_bound() {
        let mut g = Graph::new();
        let door = g.create_node("door", BTreeMap::new());
        let edge = g.add_dependency(door, spec()).unwrap();
        assert!(g.edge(edge).unwrap().is_open());
        assert_eq!(g.open_dependencies_of(door), vec![edge]);

        let key = g.create_node("key", BTreeMap::new());
        g.bind_edge(edge, key).unwrap();
        assert!(!g.edge(edge).unwrap().is_open());
        assert_eq!(g.edge(edge).unwrap().bound_to(), Some(key));
        assert!(g.open_dependencies_of(door).is_empty());
    }

    #[test]
    fn affordance_open_endpoint_is_source() {
        let mut g = Graph::new();
        let chest = g.create_node("chest", BTreeMap::new());
        let edge = g.add_affordance(chest, spec()).unwrap();
        let e = g.edge(edge).unwrap();
        assert_eq!(e.open_endpoint(), Some(Endpoint::Source));
        assert_eq!(e.owner(), Some(chest));
        assert_eq!(g.open_affordances(), vec![edge]);
    }

    #[test]
    fn rebind_allowed_before_visit() {
        let mut g = Graph::new();
        let door = g.create_node("door", BTreeMap::new());
        let k1 = g.create_node("key", BTreeMap::new());
        let k2 = g.create_node("key", BTreeMap::new());
        let edge = g.add_dependency(door, spec()).unwrap();

        g.bind_edge(edge, k1).unwrap();
        g.bind_edge(edge, k2).unwrap();
        assert_eq!(g.edge(edge).unwrap().bound_to(), Some(k2));
    }

    #[test]
    fn rebind_after_visit_fails() {
        let mut g = Graph::new();
        let door = g.create_node("door", BTreeMap::new());
        let k1 = g.create_node("key", BTreeMap::new());
        let k2 = g.create_node("key", BTreeMap::new());
        let edge = g.add_dependency(door, spec()).unwrap();

        g.bind_edge(edge, k1).unwrap();
        g.mark_visited(door).unwrap();
        let err = g.bind_edge(edge, k2).unwrap_err();
        assert!(matches!(err, EngineError::RebindAfterVisit { .. }));
        // The original binding survives.
        assert_eq!(g.edge(edge).unwrap().bound_to(), Some(k1));
    }

    #[test]
    fn binding_a_transition_is_rejected() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let b = g.create_node("b", BTreeMap::new());
        let t = g.add_transition(a, b).unwrap();
        let err = g.bind_edge(t, b).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBind { .. }));
    }

    #[test]
    fn frontier_is_transition_successors() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let b = g.create_node("b", BTreeMap::new());
        let c = g.create_node("c", BTreeMap::new());
        g.add_transition(a, b).unwrap();
        g.add_transition(a, c).unwrap();
        assert_eq!(g.frontier(a), vec![b, c]);
    }

    #[test]
    fn terminal_frontier_is_cursor_itself() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        assert_eq!(g.frontier(a), vec![a]);
    }

    #[test]
    fn distances_follow_bound_edges_undirected() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let b = g.create_node("b", BTreeMap::new());
        let c = g.create_node("c", BTreeMap::new());
        let lonely = g.create_node("lonely", BTreeMap::new());
        g.add_transition(a, b).unwrap();
        g.add_transition(c, b).unwrap();

        let d = g.distances_from(a);
        assert_eq!(d.get(&a), Some(&0));
        assert_eq!(d.get(&b), Some(&1));
        assert_eq!(d.get(&c), Some(&2));
        assert_eq!(d.get(&lonely), None);
    }

    #[test]
    fn open_edges_do_not_link_distances() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let b = g.create_node("b", BTreeMap::new());
        g.add_transition(a, b).unwrap();
        let far = g.create_node("far", BTreeMap::new());
        // Open dependency from b: unbound, so `far` stays unreachable.
        g.add_dependency(b, spec()).unwrap();

        let d = g.distances_from(a);
        assert_eq!(d.get(&far), None);
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let b = g.create_node("b", BTreeMap::new());
        let t = g.add_transition(a, b).unwrap();
        let dep = g.add_dependency(b, spec()).unwrap();

        g.remove_node(b).unwrap();
        assert!(g.node(b).is_none());
        assert!(g.edge(t).is_none());
        assert!(g.edge(dep).is_none());
        assert!(g.node(a).is_some());
    }

    #[test]
    fn content_hash_detects_field_change() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let before = g.content_hash();
        g.set_field(a, "hp", Some(Value::Int(1))).unwrap();
        assert_ne!(before, g.content_hash());
    }

    #[test]
    fn content_hash_ignores_journal() {
        let mut g = Graph::new();
        g.create_node("a", BTreeMap::new());
        let with_journal = g.content_hash();
        g.discard_journal();
        assert_eq!(with_journal, g.content_hash());
    }

    #[test]
    fn replay_reproduces_content_hash() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::new());
        let b = g.create_node("b", BTreeMap::new());
        g.add_transition(a, b).unwrap();
        let dep = g.add_dependency(a, spec()).unwrap();
        g.set_field(b, "locked", Some(Value::Bool(true))).unwrap();
        g.bind_edge(dep, b).unwrap();
        g.mark_visited(a).unwrap();

        let events = g.drain_journal();
        let mut replayed = Graph::new();
        for event in &events {
            replayed.apply_event(event).unwrap();
        }
        assert_eq!(replayed.content_hash(), g.content_hash());
    }

    #[test]
    fn replay_bumps_id_counters() {
        let mut g = Graph::new();
        g.create_node("a", BTreeMap::new());
        let events = g.drain_journal();

        let mut replayed = Graph::new();
        for event in &events {
            replayed.apply_event(event).unwrap();
        }
        let next = replayed.create_node("b", BTreeMap::new());
        assert_eq!(next, NodeId::new(1));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut g = Graph::new();
        let a = g.create_node("a", BTreeMap::from([("hp".to_string(), Value::Int(3))]));
        let b = g.create_node("b", BTreeMap::new());
        g.add_transition(a, b).unwrap();
        g.add_dependency(b, spec()).unwrap();
        g.drain_journal();

        let json = serde_json::to_string(&g).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content_hash(), g.content_hash());
        assert_eq!(back.node_count(), 2);
        assert_eq!(back.edge_count(), 2);
    }
}
