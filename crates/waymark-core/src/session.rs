//! The session: one long-lived resolution run over one graph.
//!
//! A [`Session`] owns the graph, the frame context, the handler and
//! provisioner registries, the template registry, and the ledger, and ties
//! them together: [`Session::advance`] runs one step at the cursor,
//! [`Session::choose`] follows an explicit transition between steps, and
//! [`Session::rewind`] rolls history back through the ledger.
//!
//! Sessions are independent: nothing is shared between two sessions, and two
//! sessions built from the same configuration and inputs take identical
//! steps. A session is driven from one thread at a time; cross-session
//! parallelism needs no coordination.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::frame::{Context, Frame, HandlerRegistry, StepReport};
use crate::graph::{Graph, NodeId, RequirementId};
use crate::ledger::Ledger;
use crate::offer::PlanningReceipt;
use crate::provisioner::ProvisionerRegistry;
use crate::requirement::InMemoryTemplates;
use crate::store::Store;

/// Session construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identifier the ledger persists under.
    pub session_id: String,
    /// Seed every step-scoped RNG stream derives from.
    pub seed: u64,
    /// Completed steps between periodic ledger snapshots; 0 keeps only the
    /// baseline.
    pub snapshot_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: "session".to_string(),
            seed: 0,
            snapshot_interval: 8,
        }
    }
}

/// One outgoing transition from the cursor, with the hard requirements that
/// currently block it (empty means it can be followed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    /// The transition's destination.
    pub target: NodeId,
    /// Unresolved hard requirements on the destination.
    pub blocked_by: Vec<RequirementId>,
}

/// One resolution run: graph, registries, context, and ledger.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    graph: Graph,
    ctx: Context,
    handlers: HandlerRegistry,
    provisioners: ProvisionerRegistry,
    templates: InMemoryTemplates,
    ledger: Ledger,
    /// `trail[k]` is the cursor immediately after `k` completed steps;
    /// rewinding restores it. Cursor moves made by [`Session::choose`] are
    /// not recorded, they are re-made after a rewind if still wanted.
    trail: Vec<NodeId>,
    last_receipt: Option<PlanningReceipt>,
}

impl Session {
    /// Creates a session positioned at `start`. The graph's current state
    /// becomes the ledger's step-0 baseline; any journaled authoring
    /// mutations are discarded as already settled.
    #[must_use]
    pub fn new(config: SessionConfig, mut graph: Graph, start: NodeId) -> Self {
        graph.discard_journal();
        let ledger = Ledger::new(config.session_id.clone(), config.snapshot_interval, &graph);
        let ctx = Context::new(config.seed, start);
        info!(session = %config.session_id, %start, "session created");
        Self {
            config,
            graph,
            ctx,
            handlers: HandlerRegistry::new(),
            provisioners: ProvisionerRegistry::with_default_strategies(),
            templates: InMemoryTemplates::new(),
            ledger,
            trail: vec![start],
            last_receipt: None,
        }
    }

    /// Attaches a persistence backend to the ledger.
    #[must_use]
    pub fn with_store(mut self, store: Box<dyn Store>) -> Self {
        self.ledger = self.ledger.with_store(store);
        self
    }

    /// Runs one full step at the cursor.
    ///
    /// # Errors
    ///
    /// Step-aborting errors ([`EngineError::Validation`],
    /// [`EngineError::ProvisionerFault`]) leave the session usable at its
    /// prior cursor; ledger errors are session-fatal.
    pub fn advance(&mut self) -> Result<StepReport, EngineError> {
        let report = Frame::new(
            &mut self.graph,
            &mut self.ctx,
            &self.handlers,
            &self.provisioners,
            &self.templates,
            &mut self.ledger,
        )
        .run_step()?;
        self.trail.push(report.cursor_after);
        self.last_receipt = Some(report.planning.clone());
        Ok(report)
    }

    /// Moves the cursor along an explicit transition, between steps.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] when `target` is not a transition
    ///   successor of the cursor.
    /// - [`EngineError::TransitionBlocked`] when `target` still carries
    ///   unresolved hard requirements; the blocking ids are reported so the
    ///   caller can present the transition as unavailable-with-reason.
    pub fn choose(&mut self, target: NodeId) -> Result<(), EngineError> {
        let cursor = self.ctx.cursor();
        let is_successor = self
            .graph
            .transitions_from(cursor)
            .iter()
            .any(|(_, to)| *to == target);
        if !is_successor {
            return Err(EngineError::Validation {
                cursor,
                reason: format!("{target} is not a transition successor"),
            });
        }
        let blocking = self.open_hard_requirements(target);
        if !blocking.is_empty() {
            return Err(EngineError::TransitionBlocked {
                node: target,
                requirements: blocking,
            });
        }
        debug!(%cursor, %target, "cursor moved");
        self.ctx.set_cursor(target);
        Ok(())
    }

    /// Rewinds the session to the state after `target` completed steps.
    /// History beyond that point is discarded; stepping forward again
    /// diverges from the abandoned future.
    ///
    /// # Errors
    ///
    /// Ledger replay errors; [`EngineError::StepOutOfRange`] when `target`
    /// exceeds recorded history.
    pub fn rewind(&mut self, target: u64) -> Result<(), EngineError> {
        let graph = self.ledger.undo_to_step(target)?;
        let cursor = *self
            .trail
            .get(target as usize)
            .ok_or(EngineError::StepOutOfRange {
                target,
                recorded: self.ledger.recorded_steps(),
            })?;
        self.graph = graph;
        self.trail.truncate(target as usize + 1);
        self.ctx.set_cursor(cursor);
        self.ctx.set_step(target);
        self.last_receipt = None;
        info!(session = %self.config.session_id, target, %cursor, "session rewound");
        Ok(())
    }

    /// Rebuilds the graph as it stood after `target` completed steps
    /// without disturbing the live state or recorded history. Every
    /// replayed patch hash is verified along the way.
    ///
    /// # Errors
    ///
    /// - [`EngineError::StepOutOfRange`] when `target` exceeds recorded
    ///   history.
    /// - [`EngineError::LedgerCorruption`] when replay diverges from a
    ///   recorded hash; the ledger halts.
    pub fn rebuild(&mut self, target: u64) -> Result<Graph, EngineError> {
        self.ledger.rebuild(target)
    }

    /// Lists the outgoing transitions from the cursor, including blocked
    /// ones with the requirements that block them.
    #[must_use]
    pub fn choices(&self) -> Vec<Choice> {
        self.graph
            .transitions_from(self.ctx.cursor())
            .into_iter()
            .map(|(_, target)| Choice {
                target,
                blocked_by: self.open_hard_requirements(target),
            })
            .collect()
    }

    fn open_hard_requirements(&self, node: NodeId) -> Vec<RequirementId> {
        self.graph
            .open_dependencies_of(node)
            .into_iter()
            .filter_map(|edge| self.graph.edge(edge))
            .filter_map(|edge| edge.requirement())
            .filter(|req| req.is_hard())
            .map(|req| req.id())
            .collect()
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the current cursor.
    #[must_use]
    pub fn cursor(&self) -> NodeId {
        self.ctx.cursor()
    }

    /// Returns the number of completed steps.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.ctx.step()
    }

    /// Returns the graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Returns the graph mutably. Mutations made between steps stay
    /// journaled and fold into the next committed step's patch.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Returns the handler registry mutably.
    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Returns the provisioner registry mutably.
    pub fn provisioners_mut(&mut self) -> &mut ProvisionerRegistry {
        &mut self.provisioners
    }

    /// Returns the template registry mutably.
    pub fn templates_mut(&mut self) -> &mut InMemoryTemplates {
        &mut self.templates
    }

    /// Returns the ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Returns the receipt from the most recent completed step, if any.
    #[must_use]
    pub fn last_receipt(&self) -> Option<&PlanningReceipt> {
        self.last_receipt.as_ref()
    }

    /// Convenience: the cursor node's fields, empty if the cursor node is
    /// gone.
    #[must_use]
    pub fn cursor_fields(&self) -> BTreeMap<String, crate::graph::Value> {
        self.graph
            .node(self.ctx.cursor())
            .map(|n| n.fields().clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Value;
    use crate::requirement::{MatchCriteria, ProvisionPolicy, RequirementSpec};

    fn hard_dep(ident: &str) -> RequirementSpec {
        RequirementSpec {
            ident: Some(ident.to_string()),
            criteria: MatchCriteria::default(),
            template: None,
            policy: ProvisionPolicy::FindExisting,
            hard: true,
        }
    }

    fn two_room_graph() -> (Graph, NodeId, NodeId) {
        let mut graph = Graph::new();
        let hall = graph.create_node("hall", BTreeMap::new());
        let cell = graph.create_node("cell", BTreeMap::new());
        graph.add_transition(hall, cell).unwrap();
        (graph, hall, cell)
    }

    #[test]
    fn choose_follows_an_unblocked_transition() {
        let (graph, hall, cell) = two_room_graph();
        let mut session = Session::new(SessionConfig::default(), graph, hall);
        session.choose(cell).unwrap();
        assert_eq!(session.cursor(), cell);
    }

    #[test]
    fn choose_rejects_non_successors() {
        let (mut graph, hall, _cell) = two_room_graph();
        let elsewhere = graph.create_node("elsewhere", BTreeMap::new());
        let mut session = Session::new(SessionConfig::default(), graph, hall);
        assert!(matches!(
            session.choose(elsewhere),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn choose_refuses_blocked_transitions_with_reason() {
        let (mut graph, hall, cell) = two_room_graph();
        let req = graph.add_dependency(cell, hard_dep("missing-key")).unwrap();
        let req_id = graph
            .edge(req)
            .and_then(|e| e.requirement())
            .map(|r| r.id())
            .unwrap();
        let mut session = Session::new(SessionConfig::default(), graph, hall);

        let err = session.choose(cell).unwrap_err();
        match err {
            EngineError::TransitionBlocked { node, requirements } => {
                assert_eq!(node, cell);
                assert_eq!(requirements, vec![req_id]);
            }
            other => panic!("expected TransitionBlocked, got {other}"),
        }
        assert_eq!(session.cursor(), hall);
    }

    #[test]
    fn choices_report_blocked_transitions() {
        let (mut graph, hall, cell) = two_room_graph();
        let open = graph.create_node("yard", BTreeMap::new());
        graph.add_transition(hall, open).unwrap();
        graph.add_dependency(cell, hard_dep("missing-key")).unwrap();
        let session = Session::new(SessionConfig::default(), graph, hall);

        let choices = session.choices();
        assert_eq!(choices.len(), 2);
        let cell_choice = choices.iter().find(|c| c.target == cell).unwrap();
        assert_eq!(cell_choice.blocked_by.len(), 1);
        let open_choice = choices.iter().find(|c| c.target == open).unwrap();
        assert!(open_choice.blocked_by.is_empty());
    }

    #[test]
    fn advance_commits_and_moves_nothing_without_guards() {
        let (graph, hall, _cell) = two_room_graph();
        let mut session = Session::new(SessionConfig::default(), graph, hall);

        let report = session.advance().unwrap();
        assert_eq!(report.step, 0);
        assert_eq!(report.cursor_after, hall);
        assert_eq!(session.step(), 1);
        assert_eq!(session.ledger().recorded_steps(), 1);
        assert!(session.last_receipt().is_some());
    }

    #[test]
    fn rewind_restores_cursor_and_state() {
        let (graph, hall, cell) = two_room_graph();
        let mut session = Session::new(SessionConfig::default(), graph, hall);

        session.advance().unwrap();
        session.choose(cell).unwrap();
        session.advance().unwrap();
        assert_eq!(session.step(), 2);
        assert_eq!(session.cursor(), cell);

        session.rewind(1).unwrap();
        assert_eq!(session.step(), 1);
        assert_eq!(session.cursor(), hall);
        assert_eq!(session.ledger().recorded_steps(), 1);
        assert!(session.last_receipt().is_none());

        // Divergence: the graph can change differently this time.
        session
            .graph_mut()
            .set_field(hall, "mood", Some(Value::from("tense")))
            .unwrap();
        session.advance().unwrap();
        assert_eq!(session.step(), 2);
    }
}
