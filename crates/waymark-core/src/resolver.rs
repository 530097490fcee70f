//! The planning pass: frontier scan, offer collection, dedup, selection,
//! acceptance, and softlock detection.
//!
//! One call to [`plan`] resolves every open requirement reachable in the
//! current step:
//!
//! 1. **Frontier identification**: transition successors of the cursor, or
//!    the cursor itself when none exist.
//! 2. **Offer collection**: every open dependency on every frontier node,
//!    and every open affordance whose recipient criteria match a frontier
//!    node, is put to every discovered provisioner (nearest scope first).
//! 3. **Deduplication**: offers for the same requirement referencing the
//!    same existing provider keep only the cheapest; creation offers are
//!    never deduplicated.
//! 4. **Selection**: per requirement, the offer minimizing `(cost_tier,
//!    proximity, source_rank, sequence)` wins. No offer: hard requirements
//!    are recorded as unresolved, soft ones as waived.
//! 5. **Acceptance**: winning offers run in ascending requirement id order,
//!    binding endpoints and appending build receipts.
//! 6. **Softlock check**: softlock iff every frontier node still carries at
//!    least one unresolved hard requirement.
//!
//! # Determinism
//!
//! Collection iterates frontier nodes, edges, and provisioners in sorted /
//! registration order and stamps every offer with a globally increasing
//! invocation rank, so the selection order is a pure function of graph
//! content and registry contents. Two passes over the same state produce
//! identical receipts.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::error::EngineError;
use crate::graph::{Graph, NodeId, RequirementId};
use crate::offer::{BuildReceipt, Offer, PlanningReceipt};
use crate::provisioner::{ProvisionerRegistry, ResolveView};
use crate::requirement::{CostTier, TemplateRegistry};

/// Runs one planning pass against the frontier, mutating the graph as
/// winning offers are accepted.
///
/// # Errors
///
/// Returns [`EngineError::ProvisionerFault`] when offer generation or an
/// accept action fails; the step must then be aborted by the caller.
/// Unresolved requirements and softlocks are not errors; they are reported
/// in the returned [`PlanningReceipt`].
pub fn plan(
    graph: &mut Graph,
    cursor: NodeId,
    step: u64,
    provisioners: &ProvisionerRegistry,
    templates: &dyn TemplateRegistry,
) -> Result<PlanningReceipt, EngineError> {
    let frontier = graph.frontier(cursor);
    let distances = graph.distances_from(cursor);
    debug!(%cursor, step, frontier = frontier.len(), "planning pass");

    // ---- Offer collection (graph is read-only in this block) ----
    let mut collected: BTreeMap<RequirementId, Vec<Offer>> = BTreeMap::new();
    let mut hardness: BTreeMap<RequirementId, bool> = BTreeMap::new();
    {
        let view = ResolveView::new(&*graph, cursor, step, &distances, templates);
        let mut invocation: u32 = 0;

        for &node in &frontier {
            for edge_id in graph.open_dependencies_of(node) {
                let edge = graph
                    .edge(edge_id)
                    .ok_or(EngineError::UnknownEdge(edge_id))?;
                let Some(requirement) = edge.requirement() else {
                    continue;
                };
                hardness.insert(requirement.id(), requirement.is_hard());
                for provisioner in provisioners.discover(node) {
                    let emitted = provisioner
                        .offers_for_dependency(requirement, edge, &view)
                        .map_err(|e| fault(provisioner.name(), &e))?;
                    stash(&mut collected, emitted, invocation, provisioner.name());
                    invocation += 1;
                }
            }
        }

        for edge_id in graph.open_affordances() {
            let edge = graph
                .edge(edge_id)
                .ok_or(EngineError::UnknownEdge(edge_id))?;
            let Some(requirement) = edge.requirement() else {
                continue;
            };
            for &candidate_id in &frontier {
                let Some(candidate) = graph.node(candidate_id) else {
                    continue;
                };
                if !requirement.matches(candidate) {
                    continue;
                }
                hardness.insert(requirement.id(), requirement.is_hard());
                for provisioner in provisioners.discover(candidate_id) {
                    let emitted = provisioner
                        .offers_for_affordance(candidate, requirement, edge, &view)
                        .map_err(|e| fault(provisioner.name(), &e))?;
                    stash(&mut collected, emitted, invocation, provisioner.name());
                    invocation += 1;
                }
            }
        }
    }

    // ---- Dedup, selection, acceptance ----
    let mut receipt = PlanningReceipt {
        step,
        ..PlanningReceipt::default()
    };
    for (&requirement, &hard) in &hardness {
        let offers = collected.remove(&requirement).unwrap_or_default();
        let candidates = dedup_offers(offers);
        match select_offer(candidates) {
            Some(winner) => {
                let tier = winner.tier();
                let origin = winner.origin().unwrap_or("unknown").to_string();
                trace!(%requirement, %tier, origin = %origin, "accepting offer");
                let provider = winner
                    .accept(graph)
                    .map_err(|e| fault(&origin, &e))?;
                match tier {
                    CostTier::FoundExisting => receipt.found += 1,
                    CostTier::UpdatedExisting => receipt.updated += 1,
                    CostTier::ClonedExisting => receipt.cloned += 1,
                    CostTier::CreatedNew => receipt.created += 1,
                }
                receipt.receipts.push(BuildReceipt {
                    requirement,
                    operation: Some(tier),
                    provider: Some(provider),
                    accepted: true,
                    hard,
                    reason: None,
                });
            }
            None if hard => {
                receipt.unresolved_hard.push(requirement);
                receipt.receipts.push(BuildReceipt {
                    requirement,
                    operation: None,
                    provider: None,
                    accepted: false,
                    hard,
                    reason: Some("no offer compatible with policy".to_string()),
                });
            }
            None => {
                receipt.waived_soft.push(requirement);
                receipt.receipts.push(BuildReceipt {
                    requirement,
                    operation: None,
                    provider: None,
                    accepted: false,
                    hard,
                    reason: Some("waived: soft requirement with no offer".to_string()),
                });
            }
        }
    }

    // ---- Softlock check ----
    for &node in &frontier {
        let blocking: Vec<RequirementId> = graph
            .open_dependencies_of(node)
            .into_iter()
            .filter_map(|edge_id| {
                graph
                    .edge(edge_id)
                    .and_then(|e| e.requirement())
                    .filter(|r| r.is_hard())
                    .map(|r| r.id())
            })
            .collect();
        if !blocking.is_empty() {
            receipt.blocked.insert(node, blocking);
        }
    }
    receipt.softlock_detected = frontier.iter().all(|n| receipt.blocked.contains_key(n));

    debug!(
        accepted = receipt.accepted_total(),
        unresolved = receipt.unresolved_hard.len(),
        waived = receipt.waived_soft.len(),
        softlock = receipt.softlock_detected,
        "planning complete"
    );
    Ok(receipt)
}

fn fault(provisioner: &str, err: &EngineError) -> EngineError {
    EngineError::ProvisionerFault {
        provisioner: provisioner.to_string(),
        message: err.to_string(),
    }
}

fn stash(
    collected: &mut BTreeMap<RequirementId, Vec<Offer>>,
    emitted: Vec<Offer>,
    invocation: u32,
    origin: &str,
) {
    for (sequence, mut offer) in emitted.into_iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        offer.assign_order(invocation, sequence as u32);
        offer.set_origin(origin);
        collected.entry(offer.requirement()).or_default().push(offer);
    }
}

/// Collapses offers for the same requirement that reference the same
/// existing provider, keeping the cheapest. Offers with no provider
/// identity (creation-tier proposals) always survive.
pub(crate) fn dedup_offers(offers: Vec<Offer>) -> Vec<Offer> {
    let mut out: Vec<Offer> = Vec::with_capacity(offers.len());
    let mut index: BTreeMap<(RequirementId, NodeId), usize> = BTreeMap::new();
    for offer in offers {
        match offer.dedup_key() {
            None => out.push(offer),
            Some(key) => {
                if let Some(&slot) = index.get(&key) {
                    if offer.selection_key() < out[slot].selection_key() {
                        out[slot] = offer;
                    }
                } else {
                    index.insert(key, out.len());
                    out.push(offer);
                }
            }
        }
    }
    out
}

/// Picks the offer minimizing the full selection key, consuming the rest.
pub(crate) fn select_offer(offers: Vec<Offer>) -> Option<Offer> {
    offers.into_iter().min_by_key(Offer::selection_key)
}

// =============================================================================
// Tests
// =============================================================================
