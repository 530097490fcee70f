//! Requirements, provisioning policy, cost tiers, and templates.
//!
//! A [`Requirement`] is attached to exactly one open edge and specifies what
//! the unresolved endpoint needs and how it may be satisfied: an optional
//! exact identifier, a [`MatchCriteria`] predicate, an optional creation
//! template, a [`ProvisionPolicy`], and a hardness flag. Hard requirements
//! block forward progress when unmet; soft requirements may be silently
//! waived.
//!
//! [`CostTier`] ranks how cheap a way of satisfying a requirement is; the
//! ordering is total and lower wins.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::{Graph, Node, NodeId, RequirementId, Value};

// =============================================================================
// Cost tiers
// =============================================================================

/// Ordinal cost of an offer, lower is cheaper.
///
/// Reusing an existing node always beats mutating one, which beats cloning,
/// which beats creating from scratch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CostTier {
    /// An existing node satisfies the requirement as-is.
    FoundExisting,
    /// An existing node satisfies it after a field update.
    UpdatedExisting,
    /// A duplicate of an existing node satisfies it.
    ClonedExisting,
    /// A new node is built from a template.
    CreatedNew,
}

impl fmt::Display for CostTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CostTier::FoundExisting => "found-existing",
            CostTier::UpdatedExisting => "updated-existing",
            CostTier::ClonedExisting => "cloned-existing",
            CostTier::CreatedNew => "created-new",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Provisioning policy
// =============================================================================

/// How a requirement may be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisionPolicy {
    /// Only an existing match will do.
    FindExisting,
    /// Always build a new node from the template.
    Create,
    /// Find a match and update its fields from the override payload.
    UpdateExisting,
    /// Find a match and duplicate it with the override payload.
    CloneExisting,
    /// Try to find an existing match, fall back to creating one.
    Any,
}

impl ProvisionPolicy {
    /// Returns true if the policy permits offers of the given cost tier.
    #[must_use]
    pub fn permits(self, tier: CostTier) -> bool {
        match self {
            ProvisionPolicy::FindExisting => tier == CostTier::FoundExisting,
            ProvisionPolicy::Create => tier == CostTier::CreatedNew,
            ProvisionPolicy::UpdateExisting => tier == CostTier::UpdatedExisting,
            ProvisionPolicy::CloneExisting => tier == CostTier::ClonedExisting,
            ProvisionPolicy::Any => {
                matches!(tier, CostTier::FoundExisting | CostTier::CreatedNew)
            }
        }
    }
}

// =============================================================================
// Match criteria
// =============================================================================

/// Predicate over candidate nodes: an optional label and exact field values,
/// all of which must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchCriteria {
    /// Required node label, if any.
    pub label: Option<String>,
    /// Field values the candidate must carry exactly.
    pub fields: BTreeMap<String, Value>,
}

impl MatchCriteria {
    /// Criteria matching nodes with the given label.
    #[must_use]
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Returns true when the node satisfies every constraint.
    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(label) = &self.label {
            if node.label() != label {
                return false;
            }
        }
        self.fields
            .iter()
            .all(|(name, value)| node.field(name) == Some(value))
    }

    /// Returns true when no constraints are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.fields.is_empty()
    }
}

// =============================================================================
// Templates
// =============================================================================

/// Restricts which requirement owners may use a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemplateScope {
    /// Only this exact node.
    Owner(NodeId),
    /// Any node with this label.
    OwnerLabel(String),
    /// Any node with a transition ancestor carrying this label.
    AncestorLabel(String),
}

impl TemplateScope {
    /// Returns true when the requirement owner is permitted to use the
    /// template.
    #[must_use]
    pub fn permits(&self, owner: NodeId, graph: &Graph) -> bool {
        match self {
            TemplateScope::Owner(id) => *id == owner,
            TemplateScope::OwnerLabel(label) => {
                graph.node(owner).is_some_and(|n| n.label() == label)
            }
            TemplateScope::AncestorLabel(label) => {
                // Walk transition predecessors breadth-first.
                let mut seen = vec![owner];
                let mut queue = vec![owner];
                while let Some(current) = queue.pop() {
                    for edge in graph.edges_sorted() {
                        if edge.kind() == crate::graph::EdgeKind::Transition
                            && edge.dest() == Some(current)
                        {
                            if let Some(pred) = edge.source() {
                                if seen.contains(&pred) {
                                    continue;
                                }
                                if graph.node(pred).is_some_and(|n| n.label() == label) {
                                    return true;
                                }
                                seen.push(pred);
                                queue.push(pred);
                            }
                        }
                    }
                }
                false
            }
        }
    }
}

/// An immutable payload for building (or overriding) a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Template {
    /// Label of the node to build.
    pub label: String,
    /// Initial field values, also used as the override payload for update
    /// and clone proposals.
    pub fields: BTreeMap<String, Value>,
    /// Optional restriction on which owners may use this template.
    pub scope: Option<TemplateScope>,
}

impl Template {
    /// A template with just a label.
    #[must_use]
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            fields: BTreeMap::new(),
            scope: None,
        }
    }
}

/// Reference to a template: carried inline on the requirement or looked up
/// in the session's registry by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemplateRef {
    /// The template is embedded in the requirement.
    Inline(Template),
    /// The template is fetched from the registry under this key.
    Registry(String),
}

/// Session-scoped template lookup. The engine only consults this from the
/// template-create strategy; scope filtering happens at the call site.
pub trait TemplateRegistry: Send + Sync {
    /// Returns the template registered under `key`, if any.
    fn find(&self, key: &str) -> Option<&Template>;
}

/// Simple map-backed registry, constructor-injected per session.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplates {
    templates: BTreeMap<String, Template>,
}

impl InMemoryTemplates {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template under a key, replacing any previous entry.
    pub fn insert(&mut self, key: impl Into<String>, template: Template) {
        self.templates.insert(key.into(), template);
    }
}

impl TemplateRegistry for InMemoryTemplates {
    fn find(&self, key: &str) -> Option<&Template> {
        self.templates.get(key)
    }
}

// =============================================================================
// Requirements
// =============================================================================

/// Describes what an open edge needs, before an id is allocated.
///
/// Passed to [`Graph::add_dependency`](crate::graph::Graph::add_dependency)
/// and [`Graph::add_affordance`](crate::graph::Graph::add_affordance), which
/// allocate the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequirementSpec {
    /// Exact identifier of the target node (matched against labels), if any.
    pub ident: Option<String>,
    /// Additional predicate over candidates.
    pub criteria: MatchCriteria,
    /// Creation/override template.
    pub template: Option<TemplateRef>,
    /// How the requirement may be satisfied.
    pub policy: ProvisionPolicy,
    /// Hard requirements block forward progress when unmet; soft ones are
    /// waived.
    pub hard: bool,
}

impl RequirementSpec {
    pub(crate) fn into_requirement(self, id: RequirementId) -> Requirement {
        Requirement {
            id,
            ident: self.ident,
            criteria: self.criteria,
            template: self.template,
            policy: self.policy,
            hard: self.hard,
        }
    }
}

/// A requirement attached to one open edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    id: RequirementId,
    ident: Option<String>,
    criteria: MatchCriteria,
    template: Option<TemplateRef>,
    policy: ProvisionPolicy,
    hard: bool,
}

impl Requirement {
    /// Returns the requirement's id.
    #[must_use]
    pub const fn id(&self) -> RequirementId {
        self.id
    }

    /// Returns the exact identifier, if any.
    #[must_use]
    pub fn ident(&self) -> Option<&str> {
        self.ident.as_deref()
    }

    /// Returns the match criteria.
    #[must_use]
    pub fn criteria(&self) -> &MatchCriteria {
        &self.criteria
    }

    /// Returns the creation/override template reference, if any.
    #[must_use]
    pub fn template(&self) -> Option<&TemplateRef> {
        self.template.as_ref()
    }

    /// Returns the provisioning policy.
    #[must_use]
    pub const fn policy(&self) -> ProvisionPolicy {
        self.policy
    }

    /// Returns true for hard requirements.
    #[must_use]
    pub const fn is_hard(&self) -> bool {
        self.hard
    }

    /// Returns true when the candidate node satisfies this requirement: the
    /// exact identifier (if present) must equal the candidate's label, and
    /// the criteria must hold.
    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(ident) = &self.ident {
            if node.label() != ident {
                return false;
            }
        }
        self.criteria.matches(node)
    }
}

// =============================================================================
// Tests
// =============================================================================
