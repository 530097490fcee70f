//! Shared builders for integration tests.

use std::collections::BTreeMap;

use crate::graph::{Graph, NodeId};
use crate::requirement::{
    MatchCriteria, ProvisionPolicy, RequirementSpec, Template, TemplateRef,
};
use crate::session::{Session, SessionConfig};

/// Installs a per-test tracing subscriber; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A requirement for a node labeled `ident`, with no template fallback.
pub fn find_existing(ident: &str, hard: bool) -> RequirementSpec {
    RequirementSpec {
        ident: Some(ident.to_string()),
        criteria: MatchCriteria::default(),
        template: None,
        policy: ProvisionPolicy::FindExisting,
        hard,
    }
}

/// A hard requirement for `ident` that may be satisfied any way, falling
/// back to creating from an inline template.
pub fn any_with_template(ident: &str) -> RequirementSpec {
    RequirementSpec {
        ident: Some(ident.to_string()),
        criteria: MatchCriteria::default(),
        template: Some(TemplateRef::Inline(Template::labeled(ident))),
        policy: ProvisionPolicy::Any,
        hard: true,
    }
}

/// A lone node with no outgoing transitions; the frontier is the node
/// itself.
pub fn lone_node(label: &str) -> (Graph, NodeId) {
    let mut graph = Graph::new();
    let node = graph.create_node(label, BTreeMap::new());
    (graph, node)
}

/// A session over `graph` with a fixed seed and the given snapshot
/// interval.
pub fn session(graph: Graph, start: NodeId, snapshot_interval: u64) -> Session {
    Session::new(
        SessionConfig {
            session_id: "test".to_string(),
            seed: 42,
            snapshot_interval,
        },
        graph,
        start,
    )
}
