//! # Waymark Core
//!
//! Deterministic, phase-driven resolution engine over a mutable dependency
//! graph.
//!
//! A session advances one step at a time. Each step runs a fixed phase
//! pipeline at the cursor node: validation, constraint planning, guard
//! evaluation, field updates, and commit. Planning gathers offers from
//! registered provisioners for every open requirement on the frontier and
//! accepts the cheapest viable one per requirement, binding open edges to
//! concrete nodes. Every committed step appends a verified patch to an
//! event-sourced ledger, so any earlier state can be rebuilt or rewound to.
//!
//! ## Architecture
//!
//! - **Graph**: nodes, transitions, and open dependency/affordance edges
//! - **Provisioners**: pluggable strategies that offer ways to satisfy
//!   requirements (find, update, clone, create)
//! - **Resolver**: per-step planning pass with deterministic offer selection
//! - **Frame**: the phase state machine driving one step
//! - **Ledger**: snapshots plus hash-verified patches, with rewind
//!
//! ## Usage
//!
//! ```rust,ignore
//! use waymark_core::{Session, SessionConfig};
//!
//! let mut session = Session::new(SessionConfig::default(), graph, start);
//! let report = session.advance()?;
//! println!("{} requirement(s) resolved", report.planning.accepted_total());
//! ```
//!
//! Every run with the same inputs takes identical steps: iteration orders
//! are fixed, tie-breaks are total, and randomness is derived from the
//! session seed per step.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod frame;
pub mod graph;
pub mod ledger;
pub mod offer;
pub mod provisioner;
pub mod requirement;
pub mod resolver;
pub mod rng;
pub mod session;
pub mod store;

pub use error::EngineError;
pub use frame::{
    Context, Frame, HandlerContext, HandlerId, HandlerOutcome, HandlerRegistry, Phase,
    PhaseHandler, StepReport,
};
pub use graph::{
    ChangeEvent, Edge, EdgeId, EdgeKind, Endpoint, Graph, Node, NodeFlags, NodeId, RequirementId,
    Value,
};
pub use ledger::{Ledger, Patch, Snapshot};
pub use offer::{BuildReceipt, Offer, PlanningReceipt};
pub use provisioner::{
    CloneExisting, ExistingSearch, Provisioner, ProvisionerRegistry, ResolveView, TemplateCreate,
    UpdateExisting,
};
pub use requirement::{
    CostTier, InMemoryTemplates, MatchCriteria, ProvisionPolicy, Requirement, RequirementSpec,
    Template, TemplateRef, TemplateRegistry, TemplateScope,
};
pub use resolver::plan;
pub use session::{Choice, Session, SessionConfig};
pub use store::{MemoryStore, Store};

#[cfg(test)]
mod tests;
