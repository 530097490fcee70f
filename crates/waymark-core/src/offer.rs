//! Offers and resolution receipts.
//!
//! An [`Offer`] is a lazy, side-effect-free proposal for satisfying one
//! requirement. Provisioners emit offers during the planning pass; the
//! resolver deduplicates them, selects at most one per requirement, and
//! invokes the winner's accept action, which performs the actual graph
//! mutation and yields the concrete provider.
//!
//! Offers are ephemeral: created and consumed within one planning pass,
//! never persisted. The audit trail is carried by [`BuildReceipt`] (one per
//! requirement outcome) and [`PlanningReceipt`] (one per step), both of
//! which are immutable and serializable.
//!
//! # Selection ordering
//!
//! The full comparison key is `(cost_tier, proximity, source_rank,
//! sequence)`. The trailing pair is the stable tiebreak: `source_rank` is
//! the emitting provisioner's discovery-order index and `sequence` the
//! offer's index within that provisioner's emission, so selection is a pure
//! function of registration order and never of provider identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::graph::{Graph, NodeId, RequirementId};
use crate::requirement::CostTier;

/// The deferred mutation an offer performs when accepted. Returns the
/// concrete provider node.
pub type AcceptFn = Box<dyn FnOnce(&mut Graph) -> Result<NodeId, EngineError> + Send>;

// =============================================================================
// Offer
// =============================================================================

/// A lazy proposal for satisfying one requirement.
pub struct Offer {
    requirement: RequirementId,
    tier: CostTier,
    proximity: u32,
    provider: Option<NodeId>,
    source_rank: u32,
    sequence: u32,
    origin: Option<String>,
    accept: AcceptFn,
}

impl Offer {
    /// Creates an offer. `provider` must be `Some` only for find-existing
    /// proposals; it is the dedup identity, not the selection key.
    ///
    /// The ordering fields (`source_rank`, `sequence`) are assigned by the
    /// resolver during collection.
    #[must_use]
    pub fn new(
        requirement: RequirementId,
        tier: CostTier,
        proximity: u32,
        provider: Option<NodeId>,
        accept: AcceptFn,
    ) -> Self {
        Self {
            requirement,
            tier,
            proximity,
            provider,
            source_rank: 0,
            sequence: 0,
            origin: None,
            accept,
        }
    }

    /// Returns the id of the requirement this offer targets.
    #[must_use]
    pub const fn requirement(&self) -> RequirementId {
        self.requirement
    }

    /// Returns the resolved cost tier.
    #[must_use]
    pub const fn tier(&self) -> CostTier {
        self.tier
    }

    /// Returns the proximity score: graph distance from the current cursor,
    /// 0 for the cursor itself.
    #[must_use]
    pub const fn proximity(&self) -> u32 {
        self.proximity
    }

    /// Returns the existing provider this offer references, if any.
    #[must_use]
    pub const fn provider(&self) -> Option<NodeId> {
        self.provider
    }

    /// Assigns the stable ordering fields. Called once by the resolver when
    /// the offer is collected.
    pub(crate) fn assign_order(&mut self, source_rank: u32, sequence: u32) {
        self.source_rank = source_rank;
        self.sequence = sequence;
    }

    /// Records which provisioner emitted this offer, for fault reports.
    pub(crate) fn set_origin(&mut self, name: &str) {
        self.origin = Some(name.to_string());
    }

    /// Returns the name of the emitting provisioner, once collected.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The full comparison key: `(cost_tier, proximity, source_rank,
    /// sequence)`.
    #[must_use]
    pub const fn selection_key(&self) -> (CostTier, u32, u32, u32) {
        (self.tier, self.proximity, self.source_rank, self.sequence)
    }

    /// The dedup identity: present only for offers that reference an
    /// existing provider.
    #[must_use]
    pub fn dedup_key(&self) -> Option<(RequirementId, NodeId)> {
        self.provider.map(|p| (self.requirement, p))
    }

    /// Consumes the offer and performs its graph mutation, returning the
    /// concrete provider.
    ///
    /// # Errors
    ///
    /// Propagates whatever the accept action reports; the resolver treats
    /// such failures as provisioner faults.
    pub fn accept(self, graph: &mut Graph) -> Result<NodeId, EngineError> {
        (self.accept)(graph)
    }
}

impl fmt::Debug for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offer")
            .field("requirement", &self.requirement)
            .field("tier", &self.tier)
            .field("proximity", &self.proximity)
            .field("provider", &self.provider)
            .field("source_rank", &self.source_rank)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Receipts
// =============================================================================

/// Immutable audit record of one accepted or rejected requirement
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReceipt {
    /// The requirement this receipt describes.
    pub requirement: RequirementId,
    /// The chosen operation, if an offer was accepted.
    pub operation: Option<CostTier>,
    /// The concrete provider the edge was bound to, if any.
    pub provider: Option<NodeId>,
    /// Whether an offer was accepted.
    pub accepted: bool,
    /// Whether the requirement was hard.
    pub hard: bool,
    /// Failure reason when rejected.
    pub reason: Option<String>,
}

/// Aggregate audit record for one step's planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningReceipt {
    /// Step counter the pass ran at.
    pub step: u64,
    /// Accepted offers that reused an existing node as-is.
    pub found: u32,
    /// Accepted offers that updated an existing node.
    pub updated: u32,
    /// Accepted offers that cloned an existing node.
    pub cloned: u32,
    /// Accepted offers that created a new node.
    pub created: u32,
    /// Hard requirements left unresolved, in id order.
    pub unresolved_hard: Vec<RequirementId>,
    /// Soft requirements silently waived, in id order.
    pub waived_soft: Vec<RequirementId>,
    /// Frontier nodes still blocked after acceptance, mapped to the hard
    /// requirement ids blocking them. Blocked transitions stay visible;
    /// this is their unavailable-with-reason metadata.
    pub blocked: BTreeMap<NodeId, Vec<RequirementId>>,
    /// True iff every frontier node retains at least one unresolved hard
    /// requirement after acceptance.
    pub softlock_detected: bool,
    /// Per-requirement audit records, in acceptance order.
    pub receipts: Vec<BuildReceipt>,
}

impl PlanningReceipt {
    /// Total number of accepted offers.
    #[must_use]
    pub fn accepted_total(&self) -> u32 {
        self.found + self.updated + self.cloned + self.created
    }
}

// =============================================================================
// Tests
// =============================================================================
