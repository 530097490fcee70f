//! Error taxonomy for the resolution engine.
//!
//! The engine distinguishes recoverable, reportable conditions from step-level
//! and session-level failures:
//!
//! - Unresolved hard requirements and softlocks are *data*, surfaced through
//!   the [`PlanningReceipt`](crate::offer::PlanningReceipt), never through this
//!   enum. Callers inspect the receipt and decide what to do.
//! - [`EngineError::Validation`] and [`EngineError::ProvisionerFault`] abort a
//!   single step; the session remains usable at its prior cursor.
//! - [`EngineError::LedgerCorruption`] is session-fatal: the ledger refuses
//!   further writes once replay has produced a state mismatch.

use thiserror::Error;

use crate::graph::{EdgeId, NodeId, RequirementId};

/// All failure conditions the engine can report.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A VALIDATE-phase precondition was unmet. The step aborted before any
    /// mutation; the session remains usable at the prior cursor.
    #[error("validation failed at {cursor}: {reason}")]
    Validation {
        /// Cursor node at which validation ran.
        cursor: NodeId,
        /// Human-readable reason from the vetoing handler.
        reason: String,
    },

    /// A provisioner's offer generation or accept action failed. Treated as a
    /// programming or configuration error, not a resolution outcome; aborts
    /// the step.
    #[error("provisioner '{provisioner}' faulted: {message}")]
    ProvisionerFault {
        /// Name of the faulting provisioner.
        provisioner: String,
        /// What went wrong.
        message: String,
    },

    /// An open edge endpoint was already bound and its owning node has been
    /// visited; rebinding is only permitted before visitation.
    #[error("edge {edge} is bound and its owner has been visited; rebinding is frozen")]
    RebindAfterVisit {
        /// The edge whose endpoint was frozen.
        edge: EdgeId,
    },

    /// An edge was used in a way its kind does not support (for example,
    /// binding a plain transition edge).
    #[error("edge {edge} cannot be bound: {reason}")]
    InvalidBind {
        /// The offending edge.
        edge: EdgeId,
        /// Why the bind was rejected.
        reason: String,
    },

    /// A transition exists but is blocked by unresolved hard requirements.
    /// The blocking requirement ids are reported so callers can present the
    /// transition as unavailable-with-reason.
    #[error("transition to {node} is blocked by {} unresolved hard requirement(s)", requirements.len())]
    TransitionBlocked {
        /// The frontier node that cannot be entered.
        node: NodeId,
        /// Requirements still unresolved on that node.
        requirements: Vec<RequirementId>,
    },

    /// A node id that does not exist in the graph.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// An edge id that does not exist in the graph.
    #[error("unknown edge {0}")]
    UnknownEdge(EdgeId),

    /// A registry-referenced template could not be found.
    #[error("template '{0}' not found in registry")]
    MissingTemplate(String),

    /// Replay produced a state whose content hash does not match the hash
    /// recorded at commit time. Fatal for the session's history.
    #[error(
        "ledger corruption at step {step}: expected hash {expected:016x}, got {actual:016x}"
    )]
    LedgerCorruption {
        /// Step at which the mismatch was detected.
        step: u64,
        /// Hash recorded when the patch was committed.
        expected: u64,
        /// Hash produced by replay.
        actual: u64,
    },

    /// The ledger has halted writes after detecting corruption.
    #[error("ledger for session '{0}' is halted after corruption")]
    LedgerHalted(String),

    /// A requested rewind target lies beyond the recorded history.
    #[error("cannot rebuild step {target}: only {recorded} step(s) recorded")]
    StepOutOfRange {
        /// Requested step.
        target: u64,
        /// Number of committed steps.
        recorded: u64,
    },

    /// A persistence backend failure.
    #[error("persistence store error: {0}")]
    Store(String),
}
