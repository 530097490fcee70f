//! End-to-end planning and replay scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::frame::{HandlerContext, HandlerOutcome, Phase, PhaseHandler};
use crate::graph::{NodeId, Value};
use crate::provisioner::ProvisionerRegistry;
use crate::requirement::{CostTier, InMemoryTemplates, MatchCriteria};
use crate::resolver;

use super::helpers::{any_with_template, find_existing, init_tracing, lone_node, session};

/// A locked door whose key does not exist yet: planning must fall back to
/// template creation, bind the new node, and report one creation.
#[test]
fn missing_key_is_created_from_template() {
    init_tracing();
    let (mut graph, door) = lone_node("door");
    let edge = graph.add_dependency(door, any_with_template("key")).unwrap();

    let provisioners = ProvisionerRegistry::with_default_strategies();
    let templates = InMemoryTemplates::new();
    let receipt = resolver::plan(&mut graph, door, 0, &provisioners, &templates).unwrap();

    assert_eq!(receipt.created, 1);
    assert_eq!(receipt.accepted_total(), 1);
    assert_eq!(receipt.receipts.len(), 1);
    assert_eq!(receipt.receipts[0].operation, Some(CostTier::CreatedNew));
    assert!(!receipt.softlock_detected);

    let bound = graph.edge(edge).unwrap().bound_to().unwrap();
    assert_eq!(graph.node(bound).unwrap().label(), "key");
    assert_eq!(graph.node_count(), 2);
}

/// Two keys exist at different distances from the cursor: selection must
/// prefer the nearer one, at find-existing cost.
#[test]
fn nearer_provider_wins() {
    let (mut graph, door) = lone_node("door");
    let near = graph.create_node("key", BTreeMap::new());
    let far = graph.create_node("key", BTreeMap::new());
    // Connectivity for proximity without giving the door outgoing
    // transitions (which would move the frontier off it).
    graph.add_transition(near, door).unwrap();
    graph.add_transition(far, near).unwrap();
    let edge = graph.add_dependency(door, find_existing("key", true)).unwrap();

    let provisioners = ProvisionerRegistry::with_default_strategies();
    let templates = InMemoryTemplates::new();
    let receipt = resolver::plan(&mut graph, door, 0, &provisioners, &templates).unwrap();

    assert_eq!(receipt.found, 1);
    assert_eq!(receipt.receipts[0].operation, Some(CostTier::FoundExisting));
    assert_eq!(receipt.receipts[0].provider, Some(near));
    assert_eq!(graph.edge(edge).unwrap().bound_to(), Some(near));
    assert_ne!(graph.edge(edge).unwrap().bound_to(), Some(far));
}

/// Find-existing-only with nothing to find and no fallback: the hard
/// requirement stays unresolved and, with a single frontier node, the step
/// is softlocked.
#[test]
fn unresolvable_hard_requirement_softlocks() {
    let (mut graph, door) = lone_node("door");
    let edge = graph.add_dependency(door, find_existing("grail", true)).unwrap();
    let req_id = graph
        .edge(edge)
        .and_then(|e| e.requirement())
        .map(|r| r.id())
        .unwrap();

    let provisioners = ProvisionerRegistry::with_default_strategies();
    let templates = InMemoryTemplates::new();
    let receipt = resolver::plan(&mut graph, door, 0, &provisioners, &templates).unwrap();

    assert_eq!(receipt.unresolved_hard, vec![req_id]);
    assert!(receipt.softlock_detected);
    assert_eq!(receipt.blocked.get(&door), Some(&vec![req_id]));
    assert!(graph.edge(edge).unwrap().is_open());
}

/// Soft requirements with no offer are waived rather than blocking.
#[test]
fn soft_requirement_is_waived() {
    let (mut graph, door) = lone_node("door");
    graph.add_dependency(door, find_existing("grail", false)).unwrap();

    let provisioners = ProvisionerRegistry::with_default_strategies();
    let templates = InMemoryTemplates::new();
    let receipt = resolver::plan(&mut graph, door, 0, &provisioners, &templates).unwrap();

    assert_eq!(receipt.waived_soft.len(), 1);
    assert!(receipt.unresolved_hard.is_empty());
    assert!(!receipt.softlock_detected);
    assert!(receipt.blocked.is_empty());
}

/// An open affordance elsewhere in the graph whose recipient criteria
/// match the frontier node: planning binds its source endpoint to that
/// node at find-existing cost.
#[test]
fn affordance_binds_to_matching_frontier_node() {
    let (mut graph, hero) = lone_node("hero");
    let chest = graph.create_node("chest", BTreeMap::new());
    let edge = graph
        .add_affordance(chest, find_existing("hero", true))
        .unwrap();

    let provisioners = ProvisionerRegistry::with_default_strategies();
    let templates = InMemoryTemplates::new();
    let receipt = resolver::plan(&mut graph, hero, 0, &provisioners, &templates).unwrap();

    assert_eq!(receipt.found, 1);
    assert_eq!(receipt.receipts[0].operation, Some(CostTier::FoundExisting));
    assert_eq!(receipt.receipts[0].provider, Some(hero));
    let bound = graph.edge(edge).unwrap();
    assert_eq!(bound.bound_to(), Some(hero));
    assert!(!bound.is_open());
}

fn seal(_: &HandlerContext<'_>) -> Result<HandlerOutcome, EngineError> {
    Ok(HandlerOutcome::Veto("sealed".to_string()))
}

/// A validation veto aborts the step before any mutation: nothing is
/// committed, the cursor stays put, and the session remains usable.
#[test]
fn validation_veto_aborts_before_commit() {
    let (graph, room) = lone_node("room");
    let mut session = session(graph, room, 8);
    let guard = session
        .handlers_mut()
        .register(Phase::Validate, MatchCriteria::default(), 0, Arc::new(seal));

    let err = session.advance().unwrap_err();
    assert!(matches!(err, EngineError::Validation { reason, .. } if reason == "sealed"));
    assert_eq!(session.step(), 0);
    assert_eq!(session.cursor(), room);
    assert_eq!(session.ledger().recorded_steps(), 0);
    // Not even the visited flag was touched.
    assert!(session.graph().node(room).unwrap().flags().is_empty());

    session.handlers_mut().unregister(guard);
    session.advance().unwrap();
    assert_eq!(session.step(), 1);
    assert_eq!(session.ledger().recorded_steps(), 1);
}

struct Steer(NodeId);

impl PhaseHandler for Steer {
    fn call(&self, _: &HandlerContext<'_>) -> Result<HandlerOutcome, EngineError> {
        Ok(HandlerOutcome::Redirect(self.0))
    }
}

/// PREREQS guards steer the cursor; redirects to non-successor or blocked
/// targets are skipped and the next satisfied guard wins.
#[test]
fn prereq_redirect_skips_blocked_and_foreign_targets() {
    let (mut graph, hall) = lone_node("hall");
    let vault = graph.create_node("vault", BTreeMap::new());
    let garden = graph.create_node("garden", BTreeMap::new());
    let island = graph.create_node("island", BTreeMap::new());
    graph.add_transition(hall, vault).unwrap();
    graph.add_transition(hall, garden).unwrap();
    graph
        .add_dependency(vault, find_existing("grail", true))
        .unwrap();

    let mut session = session(graph, hall, 8);
    for (priority, target) in [(0, island), (1, vault), (2, garden)] {
        session.handlers_mut().register(
            Phase::Prereqs,
            MatchCriteria::default(),
            priority,
            Arc::new(Steer(target)),
        );
    }

    let report = session.advance().unwrap();
    assert!(report.planning.blocked.contains_key(&vault));
    assert_eq!(report.redirected, Some(garden));
    assert_eq!(session.cursor(), garden);
}

/// With no PREREQS guard satisfied, a POSTREQS guard moves the cursor
/// after the step commits.
#[test]
fn postreq_redirect_moves_cursor_after_commit() {
    let (mut graph, hall) = lone_node("hall");
    let garden = graph.create_node("garden", BTreeMap::new());
    graph.add_transition(hall, garden).unwrap();

    let mut session = session(graph, hall, 8);
    session.handlers_mut().register(
        Phase::Postreqs,
        MatchCriteria::default(),
        0,
        Arc::new(Steer(garden)),
    );

    let report = session.advance().unwrap();
    assert_eq!(report.redirected, Some(garden));
    assert_eq!(session.cursor(), garden);
    assert_eq!(session.ledger().recorded_steps(), 1);
}

struct StampStep;

impl PhaseHandler for StampStep {
    fn call(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, crate::EngineError> {
        #[allow(clippy::cast_possible_wrap)]
        let stamp = Value::Int(ctx.step as i64);
        Ok(HandlerOutcome::Fields(BTreeMap::from([(
            "stamp".to_string(),
            stamp,
        )])))
    }
}

/// Ten committed steps with a snapshot every five: rebuilding from the
/// mid-history snapshot plus patches reproduces the live state exactly.
#[test]
fn replay_from_snapshot_matches_live_state() {
    init_tracing();
    let (graph, room) = lone_node("room");
    let mut session = session(graph, room, 5);
    session.handlers_mut().register(
        Phase::Update,
        MatchCriteria::default(),
        0,
        Arc::new(StampStep),
    );

    for _ in 0..10 {
        session.advance().unwrap();
    }
    assert_eq!(session.step(), 10);
    assert_eq!(session.ledger().recorded_steps(), 10);
    // Baseline plus snapshots at 5 and 10.
    let snapshot_steps: Vec<u64> = session.ledger().snapshots().iter().map(|s| s.step).collect();
    assert_eq!(snapshot_steps, vec![0, 5, 10]);

    let live_hash = session.graph().content_hash();
    assert_eq!(
        session.graph().node(room).unwrap().fields().get("stamp"),
        Some(&Value::Int(9))
    );

    assert_eq!(session.ledger().last_hash(), live_hash);

    // Rewind-free rebuilds at the tip and mid-history.
    let rebuilt = session.rebuild(10).unwrap();
    assert_eq!(rebuilt.content_hash(), live_hash);
    let mid = session.rebuild(7).unwrap();
    assert_eq!(
        mid.node(room).unwrap().fields().get("stamp"),
        Some(&Value::Int(6))
    );

    // Rebuilding leaves history and the live session untouched.
    assert_eq!(session.ledger().recorded_steps(), 10);
    assert_eq!(session.step(), 10);
    assert_eq!(session.graph().content_hash(), live_hash);
}
