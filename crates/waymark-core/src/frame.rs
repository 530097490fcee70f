//! The frame: per-step phase state machine and handler dispatch.
//!
//! A resolution step drives the phases in strict order:
//!
//! `INIT → VALIDATE → PLANNING → PREREQS → UPDATE → JOURNAL → FINALIZE →
//! POSTREQS → (advance)`
//!
//! Phases are an ordered pipeline of registered handlers. Each handler is
//! selected by matching the cursor node against its criteria and its results
//! are aggregated by a phase-specific reduction:
//!
//! - VALIDATE: first veto wins and aborts the step before any mutation
//! - PREREQS / POSTREQS: first satisfied guard redirects the cursor
//! - UPDATE: field maps are merged, later handlers winning per field
//! - JOURNAL: all fragments are collected, in handler order
//! - INIT / PLANNING / FINALIZE: the phase's work is built in (setup, the
//!   resolver, the ledger commit); handlers registered at these phases run
//!   as observers at the phase's position, their outcomes discarded
//!
//! PLANNING is built in: it runs the resolver against the frontier, and its
//! outputs (bindings, [`PlanningReceipt`]) are visible to every later phase.
//! The [`Context`]'s cached namespace view is invalidated and rebuilt after
//! PLANNING and UPDATE, since both mutate state the cache reflects.
//!
//! # Aborted steps
//!
//! A step may fail before FINALIZE (validation veto, provisioner fault). No
//! patch is appended and the ledger's observable state is unchanged. Graph
//! mutations already performed by accepted offers remain in the live graph
//! and stay journaled, so they are attributed to the next committed step and
//! replay stays exact.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::graph::{Graph, NodeId, Value};
use crate::ledger::Ledger;
use crate::offer::PlanningReceipt;
use crate::provisioner::ProvisionerRegistry;
use crate::requirement::{MatchCriteria, TemplateRegistry};
use crate::resolver;
use crate::rng;

// =============================================================================
// Phases
// =============================================================================

/// The strictly ordered phases of one resolution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Step setup.
    Init,
    /// Precondition checks; a veto aborts the step before any mutation.
    Validate,
    /// The resolver runs against the frontier.
    Planning,
    /// Pre-transition guards; a satisfied guard redirects the cursor.
    Prereqs,
    /// Effects applied to the current (pre-transition) node.
    Update,
    /// Read-only output fragments describing the step.
    Journal,
    /// The step is committed to the ledger and becomes immutable history.
    Finalize,
    /// Post-transition guards, evaluated after commit.
    Postreqs,
}

impl Phase {
    /// All phases in execution order.
    pub const ORDER: [Phase; 8] = [
        Phase::Init,
        Phase::Validate,
        Phase::Planning,
        Phase::Prereqs,
        Phase::Update,
        Phase::Journal,
        Phase::Finalize,
        Phase::Postreqs,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Validate => "validate",
            Phase::Planning => "planning",
            Phase::Prereqs => "prereqs",
            Phase::Update => "update",
            Phase::Journal => "journal",
            Phase::Finalize => "finalize",
            Phase::Postreqs => "postreqs",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Identifier returned at handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// What a handler contributed to its phase.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Nothing to contribute.
    Pass,
    /// VALIDATE: abort the step with this reason.
    Veto(String),
    /// PREREQS / POSTREQS: the guard is satisfied, follow this transition.
    Redirect(NodeId),
    /// UPDATE: set these fields on the current node.
    Fields(BTreeMap<String, Value>),
    /// JOURNAL: one read-only output fragment.
    Fragment(String),
}

/// Read-only view a handler runs against.
///
/// Handlers never mutate the graph directly; mutation flows through the
/// outcomes they return and is applied by the frame's reduction.
pub struct HandlerContext<'a> {
    /// The graph, read-only.
    pub graph: &'a Graph,
    /// The cursor node this step runs at.
    pub cursor: NodeId,
    /// The step counter.
    pub step: u64,
    /// The session seed, for deriving step-scoped randomness.
    pub session_seed: u64,
    /// The planning receipt, for phases after PLANNING.
    pub planning: Option<&'a PlanningReceipt>,
    /// Cached read-only view of the cursor node's fields.
    pub namespace: &'a BTreeMap<String, Value>,
}

impl HandlerContext<'_> {
    /// Returns the deterministic RNG stream for this step. Every call
    /// returns the same sequence.
    #[must_use]
    pub fn rng(&self) -> ChaCha8Rng {
        rng::step_rng(self.session_seed, self.cursor, self.step)
    }
}

/// A phase handler.
pub trait PhaseHandler: Send + Sync {
    /// Runs the handler against the current step.
    ///
    /// # Errors
    ///
    /// Propagated errors abort the step.
    fn call(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, EngineError>;
}

impl<F> PhaseHandler for F
where
    F: Fn(&HandlerContext<'_>) -> Result<HandlerOutcome, EngineError> + Send + Sync,
{
    fn call(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, EngineError> {
        self(ctx)
    }
}

struct HandlerEntry {
    id: HandlerId,
    phase: Phase,
    criteria: MatchCriteria,
    priority: i32,
    handler: Arc<dyn PhaseHandler>,
}

/// Session-scoped handler registry, dispatched by phase.
///
/// Within a phase, handlers run in ascending `(priority, registration)`
/// order.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    next_id: u64,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a phase. `criteria` selects which cursor
    /// nodes the handler applies to; empty criteria match every node.
    pub fn register(
        &mut self,
        phase: Phase,
        criteria: MatchCriteria,
        priority: i32,
        handler: Arc<dyn PhaseHandler>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.entries.push(HandlerEntry {
            id,
            phase,
            criteria,
            priority,
            handler,
        });
        self.entries
            .sort_by_key(|e| (e.phase, e.priority, e.id));
        id
    }

    /// Removes a handler by id, returning true if it existed.
    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before != self.entries.len()
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn matching(&self, phase: Phase, node: &crate::graph::Node) -> Vec<&HandlerEntry> {
        self.entries
            .iter()
            .filter(|e| e.phase == phase && e.criteria.matches(node))
            .collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.entries.len())
            .finish()
    }
}

// =============================================================================
// Context
// =============================================================================

/// Per-session mutable state the frame drives: cursor, step counter, and the
/// cached namespace view of the cursor node's fields.
#[derive(Debug, Clone)]
pub struct Context {
    session_seed: u64,
    cursor: NodeId,
    step: u64,
    namespace: Option<BTreeMap<String, Value>>,
}

impl Context {
    /// Creates a context positioned at `cursor` with step counter 0.
    #[must_use]
    pub fn new(session_seed: u64, cursor: NodeId) -> Self {
        Self {
            session_seed,
            cursor,
            step: 0,
            namespace: None,
        }
    }

    /// Returns the session seed.
    #[must_use]
    pub const fn session_seed(&self) -> u64 {
        self.session_seed
    }

    /// Returns the current cursor.
    #[must_use]
    pub const fn cursor(&self) -> NodeId {
        self.cursor
    }

    /// Returns the step counter (number of completed steps).
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Returns the deterministic RNG stream for the current step.
    #[must_use]
    pub fn rng(&self) -> ChaCha8Rng {
        rng::step_rng(self.session_seed, self.cursor, self.step)
    }

    /// Returns the cached read-only view of the cursor node's fields,
    /// building it on first access.
    pub fn namespace(&mut self, graph: &Graph) -> &BTreeMap<String, Value> {
        let cursor = self.cursor;
        self.namespace.get_or_insert_with(|| {
            graph
                .node(cursor)
                .map(|n| n.fields().clone())
                .unwrap_or_default()
        })
    }

    /// Drops the cached namespace view; the next access rebuilds it.
    ///
    /// Called by the frame after PLANNING and UPDATE, and whenever the
    /// cursor moves.
    pub fn invalidate_namespace(&mut self) {
        self.namespace = None;
    }

    pub(crate) fn set_cursor(&mut self, cursor: NodeId) {
        self.cursor = cursor;
        self.invalidate_namespace();
    }

    pub(crate) fn set_step(&mut self, step: u64) {
        self.step = step;
    }
}

// =============================================================================
// Frame
// =============================================================================

/// Report for one completed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// The step counter the step ran at.
    pub step: u64,
    /// The planning pass receipt.
    pub planning: PlanningReceipt,
    /// Output fragments collected in the JOURNAL phase, in handler order.
    pub journal: Vec<String>,
    /// The transition auto-followed by a PREREQS/POSTREQS guard, if any.
    pub redirected: Option<NodeId>,
    /// The cursor after the step.
    pub cursor_after: NodeId,
}

/// Drives the phases of one resolution step over borrowed session state.
pub struct Frame<'a> {
    graph: &'a mut Graph,
    ctx: &'a mut Context,
    handlers: &'a HandlerRegistry,
    provisioners: &'a ProvisionerRegistry,
    templates: &'a dyn TemplateRegistry,
    ledger: &'a mut Ledger,
}

impl<'a> Frame<'a> {
    /// Assembles a frame over one session's parts.
    #[must_use]
    pub fn new(
        graph: &'a mut Graph,
        ctx: &'a mut Context,
        handlers: &'a HandlerRegistry,
        provisioners: &'a ProvisionerRegistry,
        templates: &'a dyn TemplateRegistry,
        ledger: &'a mut Ledger,
    ) -> Self {
        Self {
            graph,
            ctx,
            handlers,
            provisioners,
            templates,
            ledger,
        }
    }

    /// Runs one full step at the current cursor.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] when a VALIDATE handler vetoes; the
    ///   step aborts before any mutation.
    /// - [`EngineError::ProvisionerFault`] when planning fails; mutations
    ///   already performed remain journaled for the next committed step.
    /// - Ledger errors from the FINALIZE commit.
    pub fn run_step(&mut self) -> Result<StepReport, EngineError> {
        let cursor = self.ctx.cursor();
        let step = self.ctx.step();
        debug!(step, %cursor, "step begin");

        // INIT: start from a fresh namespace view, then run registered
        // setup observers.
        self.ctx.invalidate_namespace();
        self.run_phase(Phase::Init, None)?;

        // VALIDATE: first veto aborts, before any mutation.
        for outcome in self.run_phase(Phase::Validate, None)? {
            if let HandlerOutcome::Veto(reason) = outcome {
                debug!(step, %cursor, reason, "step vetoed");
                return Err(EngineError::Validation { cursor, reason });
            }
        }

        // PLANNING: resolve the frontier; bindings and the receipt are
        // visible to every later phase.
        let planning = resolver::plan(
            self.graph,
            cursor,
            step,
            self.provisioners,
            self.templates,
        )?;
        self.ctx.invalidate_namespace();
        self.run_phase(Phase::Planning, Some(&planning))?;

        // PREREQS: first satisfied guard picks the transition to follow.
        let mut redirected = self.reduce_redirect(Phase::Prereqs, &planning)?;

        // UPDATE: merge field maps, later handlers winning, then apply to
        // the current (pre-transition) node.
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        for outcome in self.run_phase(Phase::Update, Some(&planning))? {
            if let HandlerOutcome::Fields(fields) = outcome {
                merged.extend(fields);
            }
        }
        for (field, value) in merged {
            self.graph.set_field(cursor, &field, Some(value))?;
        }
        self.ctx.invalidate_namespace();

        // JOURNAL: read-only output fragments.
        let mut journal = Vec::new();
        for outcome in self.run_phase(Phase::Journal, Some(&planning))? {
            if let HandlerOutcome::Fragment(text) = outcome {
                journal.push(text);
            }
        }

        // FINALIZE: the cursor leaves the frontier and the step becomes
        // immutable history.
        self.graph.mark_visited(cursor)?;
        let events = self.graph.drain_journal();
        self.ledger.commit_step(step, events, self.graph)?;
        self.run_phase(Phase::Finalize, Some(&planning))?;

        // POSTREQS: guards evaluated after commit, unless PREREQS already
        // chose a transition.
        if redirected.is_none() {
            redirected = self.reduce_redirect(Phase::Postreqs, &planning)?;
        }

        // Advance.
        if let Some(target) = redirected {
            self.ctx.set_cursor(target);
        }
        self.ctx.set_step(step + 1);
        let cursor_after = self.ctx.cursor();
        debug!(step, %cursor_after, "step committed");

        Ok(StepReport {
            step,
            planning,
            journal,
            redirected,
            cursor_after,
        })
    }

    /// Dispatches one phase's matching handlers and collects their raw
    /// outcomes in order.
    fn run_phase(
        &mut self,
        phase: Phase,
        planning: Option<&PlanningReceipt>,
    ) -> Result<Vec<HandlerOutcome>, EngineError> {
        let cursor = self.ctx.cursor();
        let step = self.ctx.step();
        let session_seed = self.ctx.session_seed();
        let namespace = self.ctx.namespace(self.graph).clone();
        let node = self
            .graph
            .node(cursor)
            .ok_or(EngineError::UnknownNode(cursor))?;
        let hctx = HandlerContext {
            graph: self.graph,
            cursor,
            step,
            session_seed,
            planning,
            namespace: &namespace,
        };
        let mut outcomes = Vec::new();
        for entry in self.handlers.matching(phase, node) {
            outcomes.push(entry.handler.call(&hctx)?);
        }
        Ok(outcomes)
    }

    /// First-satisfied-guard reduction for PREREQS/POSTREQS: the redirect
    /// target must be an actual transition successor and must not be
    /// blocked by unresolved hard requirements.
    fn reduce_redirect(
        &mut self,
        phase: Phase,
        planning: &PlanningReceipt,
    ) -> Result<Option<NodeId>, EngineError> {
        let cursor = self.ctx.cursor();
        let successors: Vec<NodeId> = self
            .graph
            .transitions_from(cursor)
            .into_iter()
            .map(|(_, to)| to)
            .collect();
        for outcome in self.run_phase(phase, Some(planning))? {
            if let HandlerOutcome::Redirect(target) = outcome {
                if !successors.contains(&target) {
                    warn!(%phase, %target, "redirect ignored: not a transition successor");
                    continue;
                }
                if planning.blocked.contains_key(&target) {
                    debug!(%phase, %target, "redirect ignored: target is blocked");
                    continue;
                }
                return Ok(Some(target));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("cursor", &self.ctx.cursor())
            .field("step", &self.ctx.step())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Value;

    #[test]
    fn phase_order_is_stable() {
        let mut sorted = Phase::ORDER;
        sorted.sort();
        assert_eq!(sorted, Phase::ORDER);
        assert_eq!(Phase::ORDER[0], Phase::Init);
        assert_eq!(Phase::ORDER[7], Phase::Postreqs);
    }

    #[test]
    fn registry_orders_by_priority_then_registration() {
        let mut graph = Graph::new();
        let node_id = graph.create_node("n", BTreeMap::new());
        let mut registry = HandlerRegistry::new();

        fn mk(tag: &'static str) -> Arc<dyn PhaseHandler> {
            Arc::new(move |_ctx: &HandlerContext<'_>| {
                Ok(HandlerOutcome::Fragment(tag.to_string()))
            })
        }
        let late = registry.register(Phase::Journal, MatchCriteria::default(), 10, mk("late"));
        let early = registry.register(Phase::Journal, MatchCriteria::default(), 0, mk("early"));
        let mid = registry.register(Phase::Journal, MatchCriteria::default(), 5, mk("mid"));

        let node = graph.node(node_id).unwrap();
        let order: Vec<HandlerId> = registry
            .matching(Phase::Journal, node)
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![early, mid, late]);
    }

    #[test]
    fn registry_filters_by_criteria_and_phase() {
        let mut graph = Graph::new();
        let hall = graph.create_node("hall", BTreeMap::new());
        let cell = graph.create_node("cell", BTreeMap::new());
        let mut registry = HandlerRegistry::new();
        let handler: Arc<dyn PhaseHandler> =
            Arc::new(|_ctx: &HandlerContext<'_>| Ok(HandlerOutcome::Pass));

        registry.register(
            Phase::Validate,
            MatchCriteria::label("hall"),
            0,
            handler.clone(),
        );
        registry.register(Phase::Update, MatchCriteria::default(), 0, handler);

        assert_eq!(
            registry
                .matching(Phase::Validate, graph.node(hall).unwrap())
                .len(),
            1
        );
        assert!(registry
            .matching(Phase::Validate, graph.node(cell).unwrap())
            .is_empty());
        assert_eq!(
            registry
                .matching(Phase::Update, graph.node(cell).unwrap())
                .len(),
            1
        );
    }

    #[test]
    fn unregister_removes_handler() {
        let mut registry = HandlerRegistry::new();
        let handler: Arc<dyn PhaseHandler> =
            Arc::new(|_ctx: &HandlerContext<'_>| Ok(HandlerOutcome::Pass));
        let id = registry.register(Phase::Validate, MatchCriteria::default(), 0, handler);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn every_registered_phase_is_dispatched() {
        use std::sync::Mutex;

        use crate::requirement::InMemoryTemplates;

        struct Record(Arc<Mutex<Vec<Phase>>>, Phase);
        impl PhaseHandler for Record {
            fn call(&self, _: &HandlerContext<'_>) -> Result<HandlerOutcome, EngineError> {
                self.0.lock().unwrap().push(self.1);
                Ok(HandlerOutcome::Pass)
            }
        }

        let mut graph = Graph::new();
        let cursor = graph.create_node("hall", BTreeMap::new());
        graph.discard_journal();
        let mut ctx = Context::new(1, cursor);
        let mut ledger = Ledger::new("t", 0, &graph);
        let provisioners = ProvisionerRegistry::new();
        let templates = InMemoryTemplates::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::new();
        for phase in Phase::ORDER {
            handlers.register(
                phase,
                MatchCriteria::default(),
                0,
                Arc::new(Record(Arc::clone(&seen), phase)),
            );
        }

        Frame::new(
            &mut graph,
            &mut ctx,
            &handlers,
            &provisioners,
            &templates,
            &mut ledger,
        )
        .run_step()
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), Phase::ORDER.to_vec());
    }

    #[test]
    fn namespace_is_cached_until_invalidated() {
        let mut graph = Graph::new();
        let cursor = graph.create_node(
            "hall",
            BTreeMap::from([("light".to_string(), Value::from("dim"))]),
        );
        let mut ctx = Context::new(1, cursor);

        assert_eq!(
            ctx.namespace(&graph).get("light"),
            Some(&Value::from("dim"))
        );

        graph
            .set_field(cursor, "light", Some(Value::from("bright")))
            .unwrap();
        // Stale until invalidated.
        assert_eq!(
            ctx.namespace(&graph).get("light"),
            Some(&Value::from("dim"))
        );
        ctx.invalidate_namespace();
        assert_eq!(
            ctx.namespace(&graph).get("light"),
            Some(&Value::from("bright"))
        );
    }

    #[test]
    fn context_rng_is_step_stable() {
        use rand::Rng;
        let mut graph = Graph::new();
        let cursor = graph.create_node("hall", BTreeMap::new());
        let ctx = Context::new(9, cursor);
        let a: u64 = ctx.rng().gen();
        let b: u64 = ctx.rng().gen();
        assert_eq!(a, b);
    }
}
