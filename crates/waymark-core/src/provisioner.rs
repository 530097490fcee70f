//! Provisioners: the supply strategies that compete to satisfy requirements.
//!
//! A [`Provisioner`] inspects a requirement (or an affordance candidate) and
//! emits [`Offer`]s. Provisioners are pure with respect to the graph: all
//! mutation is deferred into an offer's accept action, and any I/O a custom
//! provisioner needs must complete before its offers are returned, never
//! during acceptance.
//!
//! Four canonical strategies are provided:
//! - [`ExistingSearch`]: reuse a reachable node that already matches
//! - [`TemplateCreate`]: build a new node from the requirement's template
//! - [`UpdateExisting`]: mutate a match's fields from the override payload
//! - [`CloneExisting`]: duplicate a match and apply the override payload
//!
//! Each strategy only emits offers compatible with the requirement's
//! provisioning policy.
//!
//! # Discovery
//!
//! The [`ProvisionerRegistry`] organizes provisioners by scope, narrowest
//! first: anchor-local provisioners are discovered before session-wide ones.
//! The resolver assigns each discovered provisioner a stable rank, which is
//! the final tiebreak among equally-costed offers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::EngineError;
use crate::graph::{Edge, EdgeId, Graph, Node, NodeId, Value};
use crate::offer::Offer;
use crate::requirement::{CostTier, Requirement, Template, TemplateRef, TemplateRegistry};

// =============================================================================
// Resolve view
// =============================================================================

/// Read-only bundle handed to provisioners during offer generation.
///
/// Carries the graph, the cursor, a materialized distance map (for proximity
/// scores), and the session's template registry. Provisioners must not hold
/// on to it; offers capture plain ids instead.
pub struct ResolveView<'a> {
    graph: &'a Graph,
    cursor: NodeId,
    step: u64,
    distances: &'a BTreeMap<NodeId, u32>,
    templates: &'a dyn TemplateRegistry,
}

impl<'a> ResolveView<'a> {
    /// Creates a view for one planning pass.
    #[must_use]
    pub fn new(
        graph: &'a Graph,
        cursor: NodeId,
        step: u64,
        distances: &'a BTreeMap<NodeId, u32>,
        templates: &'a dyn TemplateRegistry,
    ) -> Self {
        Self {
            graph,
            cursor,
            step,
            distances,
            templates,
        }
    }

    /// Returns the graph under resolution.
    #[must_use]
    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    /// Returns the current cursor node.
    #[must_use]
    pub const fn cursor(&self) -> NodeId {
        self.cursor
    }

    /// Returns the step counter of this pass.
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Returns the proximity score of a node: its graph distance from the
    /// cursor, or `u32::MAX` when unreachable.
    #[must_use]
    pub fn proximity(&self, node: NodeId) -> u32 {
        self.distances.get(&node).copied().unwrap_or(u32::MAX)
    }

    /// Looks up a registry template by key.
    #[must_use]
    pub fn template(&self, key: &str) -> Option<&Template> {
        self.templates.find(key)
    }

    /// Returns true when the cursor can reach `node` through fully bound
    /// edges.
    #[must_use]
    pub fn reachable(&self, node: NodeId) -> bool {
        self.distances.contains_key(&node)
    }
}

// =============================================================================
// Provisioner contract
// =============================================================================

/// A strategy object that generates offers against open requirements.
///
/// Implementations must not mutate the graph during offer generation; all
/// mutation belongs in the offers' accept actions.
pub trait Provisioner: Send + Sync {
    /// A short stable name, used in fault reports and traces.
    fn name(&self) -> &str;

    /// Generates offers for an open dependency edge.
    ///
    /// # Errors
    ///
    /// Failures are treated as provisioner faults and abort the step.
    fn offers_for_dependency(
        &self,
        requirement: &Requirement,
        edge: &Edge,
        view: &ResolveView<'_>,
    ) -> Result<Vec<Offer>, EngineError>;

    /// Generates offers for an open affordance edge whose requirement
    /// matches `candidate` (a frontier node).
    ///
    /// The default implementation emits nothing; creation-tier strategies
    /// never invent a recipient.
    ///
    /// # Errors
    ///
    /// Failures are treated as provisioner faults and abort the step.
    fn offers_for_affordance(
        &self,
        candidate: &Node,
        requirement: &Requirement,
        edge: &Edge,
        view: &ResolveView<'_>,
    ) -> Result<Vec<Offer>, EngineError> {
        let _ = (candidate, requirement, edge, view);
        Ok(Vec::new())
    }
}

// =============================================================================
// Canonical strategies
// =============================================================================

/// Scans reachable nodes for matches to the requirement's identifier and
/// criteria. Cost tier [`CostTier::FoundExisting`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExistingSearch;

impl ExistingSearch {
    fn matching_nodes<'g>(
        requirement: &Requirement,
        owner: Option<NodeId>,
        view: &ResolveView<'g>,
    ) -> Vec<&'g Node> {
        view.graph()
            .nodes_sorted()
            .filter(|n| Some(n.id()) != owner)
            .filter(|n| view.reachable(n.id()))
            .filter(|n| requirement.matches(n))
            .collect()
    }
}

impl Provisioner for ExistingSearch {
    fn name(&self) -> &str {
        "existing-search"
    }

    fn offers_for_dependency(
        &self,
        requirement: &Requirement,
        edge: &Edge,
        view: &ResolveView<'_>,
    ) -> Result<Vec<Offer>, EngineError> {
        if !requirement.policy().permits(CostTier::FoundExisting) {
            return Ok(Vec::new());
        }
        let edge_id = edge.id();
        let offers = Self::matching_nodes(requirement, edge.owner(), view)
            .into_iter()
            .map(|node| {
                let provider = node.id();
                Offer::new(
                    requirement.id(),
                    CostTier::FoundExisting,
                    view.proximity(provider),
                    Some(provider),
                    Box::new(move |g| {
                        g.bind_edge(edge_id, provider)?;
                        Ok(provider)
                    }),
                )
            })
            .collect();
        Ok(offers)
    }

    fn offers_for_affordance(
        &self,
        candidate: &Node,
        requirement: &Requirement,
        edge: &Edge,
        view: &ResolveView<'_>,
    ) -> Result<Vec<Offer>, EngineError> {
        if !requirement.policy().permits(CostTier::FoundExisting) {
            return Ok(Vec::new());
        }
        let edge_id = edge.id();
        let recipient = candidate.id();
        Ok(vec![Offer::new(
            requirement.id(),
            CostTier::FoundExisting,
            view.proximity(recipient),
            Some(recipient),
            Box::new(move |g| {
                g.bind_edge(edge_id, recipient)?;
                Ok(recipient)
            }),
        )])
    }
}

/// Builds a new node from the requirement's creation template, inline or by
/// registry lookup, honoring the template's scope restriction. Cost tier
/// [`CostTier::CreatedNew`], always proximity 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateCreate;

/// Resolves a requirement's template reference through the view, applying
/// the scope filter. Returns `None` when the requirement carries no
/// template or the scope excludes this owner.
///
/// # Errors
///
/// [`EngineError::MissingTemplate`] when a registry reference names a key
/// no template is registered under; a dangling reference is a
/// configuration fault, not a quiet non-offer.
fn usable_template(
    requirement: &Requirement,
    owner: Option<NodeId>,
    view: &ResolveView<'_>,
) -> Result<Option<Template>, EngineError> {
    let Some(reference) = requirement.template() else {
        return Ok(None);
    };
    let template = match reference {
        TemplateRef::Inline(t) => t.clone(),
        TemplateRef::Registry(key) => view
            .template(key)
            .ok_or_else(|| EngineError::MissingTemplate(key.clone()))?
            .clone(),
    };
    if let (Some(scope), Some(owner)) = (&template.scope, owner) {
        if !scope.permits(owner, view.graph()) {
            return Ok(None);
        }
    }
    Ok(Some(template))
}

impl Provisioner for TemplateCreate {
    fn name(&self) -> &str {
        "template-create"
    }

    fn offers_for_dependency(
        &self,
        requirement: &Requirement,
        edge: &Edge,
        view: &ResolveView<'_>,
    ) -> Result<Vec<Offer>, EngineError> {
        if !requirement.policy().permits(CostTier::CreatedNew) {
            return Ok(Vec::new());
        }
        let Some(template) = usable_template(requirement, edge.owner(), view)? else {
            return Ok(Vec::new());
        };
        let edge_id = edge.id();
        Ok(vec![Offer::new(
            requirement.id(),
            CostTier::CreatedNew,
            0,
            None,
            Box::new(move |g| {
                let built = g.create_node(template.label, template.fields);
                g.bind_edge(edge_id, built)?;
                Ok(built)
            }),
        )])
    }
}

/// Finds a match and proposes mutating its fields from the requirement's
/// override payload. Cost tier [`CostTier::UpdatedExisting`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateExisting;

impl Provisioner for UpdateExisting {
    fn name(&self) -> &str {
        "update-existing"
    }

    fn offers_for_dependency(
        &self,
        requirement: &Requirement,
        edge: &Edge,
        view: &ResolveView<'_>,
    ) -> Result<Vec<Offer>, EngineError> {
        if !requirement.policy().permits(CostTier::UpdatedExisting) {
            return Ok(Vec::new());
        }
        let Some(template) = usable_template(requirement, edge.owner(), view)? else {
            return Ok(Vec::new());
        };
        let edge_id = edge.id();
        let offers = ExistingSearch::matching_nodes(requirement, edge.owner(), view)
            .into_iter()
            .map(|node| {
                let provider = node.id();
                let overrides = template.fields.clone();
                Offer::new(
                    requirement.id(),
                    CostTier::UpdatedExisting,
                    view.proximity(provider),
                    None,
                    Box::new(move |g| {
                        apply_overrides(g, provider, &overrides)?;
                        g.bind_edge(edge_id, provider)?;
                        Ok(provider)
                    }),
                )
            })
            .collect();
        Ok(offers)
    }
}

/// Finds a match and proposes duplicating it with the override payload
/// applied to the copy. Cost tier [`CostTier::ClonedExisting`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneExisting;

impl Provisioner for CloneExisting {
    fn name(&self) -> &str {
        "clone-existing"
    }

    fn offers_for_dependency(
        &self,
        requirement: &Requirement,
        edge: &Edge,
        view: &ResolveView<'_>,
    ) -> Result<Vec<Offer>, EngineError> {
        if !requirement.policy().permits(CostTier::ClonedExisting) {
            return Ok(Vec::new());
        }
        let overrides = usable_template(requirement, edge.owner(), view)?
            .map(|t| t.fields)
            .unwrap_or_default();
        let edge_id = edge.id();
        let offers = ExistingSearch::matching_nodes(requirement, edge.owner(), view)
            .into_iter()
            .map(|node| {
                let source = node.id();
                let label = node.label().to_string();
                let mut fields = node.fields().clone();
                fields.extend(overrides.clone());
                Offer::new(
                    requirement.id(),
                    CostTier::ClonedExisting,
                    view.proximity(source),
                    None,
                    Box::new(move |g| {
                        let copy = g.create_node(label, fields);
                        g.bind_edge(edge_id, copy)?;
                        Ok(copy)
                    }),
                )
            })
            .collect();
        Ok(offers)
    }
}

fn apply_overrides(
    graph: &mut Graph,
    target: NodeId,
    overrides: &BTreeMap<String, Value>,
) -> Result<(), EngineError> {
    for (field, value) in overrides {
        graph.set_field(target, field, Some(value.clone()))?;
    }
    Ok(())
}

// =============================================================================
// Registry and discovery
// =============================================================================

/// Session-scoped provisioner registry, organized by discovery scope.
///
/// Discovery walks scopes from narrowest (anchor-local) to broadest
/// (session-wide); within a scope, registration order is preserved. The
/// resulting index is the stable rank used to break selection ties.
#[derive(Default)]
pub struct ProvisionerRegistry {
    anchored: BTreeMap<NodeId, Vec<Arc<dyn Provisioner>>>,
    session: Vec<Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry preloaded with the four canonical strategies at
    /// session scope, in cheapest-tier-first registration order.
    #[must_use]
    pub fn with_default_strategies() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExistingSearch));
        registry.register(Arc::new(UpdateExisting));
        registry.register(Arc::new(CloneExisting));
        registry.register(Arc::new(TemplateCreate));
        registry
    }

    /// Registers a session-wide provisioner.
    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        trace!(name = provisioner.name(), scope = "session", "register provisioner");
        self.session.push(provisioner);
    }

    /// Registers a provisioner discovered only when `anchor` is the
    /// requirement owner.
    pub fn register_at(&mut self, anchor: NodeId, provisioner: Arc<dyn Provisioner>) {
        trace!(name = provisioner.name(), %anchor, "register provisioner");
        self.anchored.entry(anchor).or_default().push(provisioner);
    }

    /// Returns provisioners applicable to `anchor`, nearest scope first,
    /// registration order within a scope.
    #[must_use]
    pub fn discover(&self, anchor: NodeId) -> Vec<Arc<dyn Provisioner>> {
        let mut out = Vec::new();
        if let Some(local) = self.anchored.get(&anchor) {
            out.extend(local.iter().map(Arc::clone));
        }
        out.extend(self.session.iter().map(Arc::clone));
        out
    }

    /// Returns the number of registered provisioners across all scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.session.len() + self.anchored.values().map(Vec::len).sum::<usize>()
    }

    /// Returns true when no provisioners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("session", &self.session.len())
            .field("anchored", &self.anchored.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
