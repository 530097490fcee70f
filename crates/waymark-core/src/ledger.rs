//! Event-sourced ledger: snapshots, patches, replay, and rewind.
//!
//! Every committed step appends a [`Patch`]: the step's canonicalized change
//! events plus the graph's content hash after they applied. State at step `k`
//! (the graph after `k` completed steps) is rebuilt by cloning the nearest
//! earlier [`Snapshot`] and replaying patches forward, verifying each patch's
//! recorded hash along the way. A mismatch is corruption: the ledger poisons
//! itself and refuses all further reads and writes for the session.
//!
//! A baseline snapshot at step 0 is taken at construction, and a further
//! snapshot every `snapshot_interval` committed steps, bounding replay cost.
//!
//! # Canonicalization
//!
//! Within one step's events, repeated writes to the same field, the same
//! edge endpoint, or the same node's flags are collapsed to a single event
//! carrying the first `old` and the last `new`, placed at the position of
//! the first write. Writes that net out to no change are dropped. Creations
//! and removals are never collapsed. Ids are never reused, so a collapsed
//! event replays against the same entity the originals did.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::EngineError;
use crate::graph::{ChangeEvent, EdgeId, Endpoint, Graph, NodeId};
use crate::store::Store;

// =============================================================================
// Records
// =============================================================================

/// One committed step's mutations. Patch `k` transforms state `k` into
/// state `k + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// The step counter the patch was committed at.
    pub step: u64,
    /// Canonicalized change events, in application order.
    pub events: Vec<ChangeEvent>,
    /// Graph content hash after the patch applied.
    pub hash_after: u64,
}

/// A full copy of the graph at a step boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Number of completed steps the snapshot reflects.
    pub step: u64,
    /// The settled graph state.
    pub graph: Graph,
    /// Content hash of `graph` at capture time.
    pub hash: u64,
}

/// The durable form handed to a [`Store`], keyed by session id.
#[derive(Serialize, Deserialize)]
struct PersistEnvelope {
    session_id: String,
    snapshot_interval: u64,
    snapshots: Vec<Snapshot>,
    patches: Vec<Patch>,
}

// =============================================================================
// Ledger
// =============================================================================

/// Append-only history for one session.
pub struct Ledger {
    session_id: String,
    /// Completed steps between periodic snapshots; 0 disables them, leaving
    /// only the baseline.
    snapshot_interval: u64,
    /// Snapshots in ascending step order; the first is the step-0 baseline.
    snapshots: Vec<Snapshot>,
    /// Patch at index `k` carries step `k`.
    patches: Vec<Patch>,
    poisoned: bool,
    store: Option<Box<dyn Store>>,
}

impl Ledger {
    /// Creates a ledger for a session, capturing `graph` as the step-0
    /// baseline snapshot.
    #[must_use]
    pub fn new(session_id: impl Into<String>, snapshot_interval: u64, graph: &Graph) -> Self {
        let baseline = Snapshot {
            step: 0,
            graph: graph.clone(),
            hash: graph.content_hash(),
        };
        Self {
            session_id: session_id.into(),
            snapshot_interval,
            snapshots: vec![baseline],
            patches: Vec::new(),
            poisoned: false,
            store: None,
        }
    }

    /// Attaches a persistence backend. Every commit and rewind writes the
    /// full envelope through it.
    #[must_use]
    pub fn with_store(mut self, store: Box<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Loads a previously persisted ledger from `store`, if one exists
    /// under `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the backend fails or the stored
    /// envelope cannot be decoded.
    pub fn load(session_id: &str, store: Box<dyn Store>) -> Result<Option<Self>, EngineError> {
        let Some(value) = store.get(session_id)? else {
            return Ok(None);
        };
        let envelope: PersistEnvelope =
            serde_json::from_value(value).map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(Some(Self {
            session_id: envelope.session_id,
            snapshot_interval: envelope.snapshot_interval,
            snapshots: envelope.snapshots,
            patches: envelope.patches,
            poisoned: false,
            store: Some(store),
        }))
    }

    /// The session this ledger records.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Number of committed steps.
    #[must_use]
    pub fn recorded_steps(&self) -> u64 {
        self.patches.len() as u64
    }

    /// Committed patches, in step order.
    #[must_use]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Snapshots, in ascending step order.
    #[must_use]
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Content hash of the latest committed state.
    #[must_use]
    pub fn last_hash(&self) -> u64 {
        match self.patches.last() {
            Some(patch) => patch.hash_after,
            None => self.snapshots.first().map_or(0, |s| s.hash),
        }
    }

    /// Returns true once corruption has been detected.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn guard(&self) -> Result<(), EngineError> {
        if self.poisoned {
            return Err(EngineError::LedgerHalted(self.session_id.clone()));
        }
        Ok(())
    }

    /// Appends the patch for one completed step. `graph` must be the live
    /// state after the step's mutations, with its journal already drained
    /// into `events`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::LedgerHalted`] once the ledger is poisoned.
    /// - [`EngineError::StepOutOfRange`] when `step` is not the next
    ///   uncommitted step.
    /// - [`EngineError::Store`] when persistence fails.
    pub fn commit_step(
        &mut self,
        step: u64,
        events: Vec<ChangeEvent>,
        graph: &Graph,
    ) -> Result<(), EngineError> {
        self.guard()?;
        let recorded = self.recorded_steps();
        if step != recorded {
            return Err(EngineError::StepOutOfRange {
                target: step,
                recorded,
            });
        }

        let events = canonicalize(events);
        let hash_after = graph.content_hash();
        debug!(
            session = %self.session_id,
            step,
            events = events.len(),
            hash = hash_after,
            "patch committed"
        );
        self.patches.push(Patch {
            step,
            events,
            hash_after,
        });

        let completed = step + 1;
        if self.snapshot_interval > 0 && completed % self.snapshot_interval == 0 {
            self.snapshots.push(Snapshot {
                step: completed,
                graph: graph.clone(),
                hash: hash_after,
            });
        }
        self.persist()
    }

    /// Rebuilds the graph as it stood after `target` completed steps, by
    /// replaying patches from the nearest earlier snapshot and verifying
    /// each patch's recorded hash.
    ///
    /// # Errors
    ///
    /// - [`EngineError::StepOutOfRange`] when `target` exceeds the recorded
    ///   history.
    /// - [`EngineError::LedgerCorruption`] when replay produces a state
    ///   whose hash differs from the one recorded at commit; the ledger is
    ///   poisoned and refuses all further use.
    /// - [`EngineError::LedgerHalted`] once poisoned.
    pub fn rebuild(&mut self, target: u64) -> Result<Graph, EngineError> {
        self.guard()?;
        let recorded = self.recorded_steps();
        if target > recorded {
            return Err(EngineError::StepOutOfRange { target, recorded });
        }

        let (mut graph, start) = match self.snapshots.iter().rev().find(|s| s.step <= target) {
            Some(snap) => (snap.graph.clone(), snap.step),
            None => (Graph::new(), 0),
        };

        let mut failure: Option<EngineError> = None;
        for patch in &self.patches[start as usize..target as usize] {
            for event in &patch.events {
                if let Err(err) = graph.apply_event(event) {
                    failure = Some(err);
                    break;
                }
            }
            if failure.is_some() {
                break;
            }
            let actual = graph.content_hash();
            if actual != patch.hash_after {
                failure = Some(EngineError::LedgerCorruption {
                    step: patch.step,
                    expected: patch.hash_after,
                    actual,
                });
                break;
            }
        }
        if let Some(err) = failure {
            error!(session = %self.session_id, %err, "replay mismatch; ledger halted");
            self.poisoned = true;
            return Err(err);
        }
        Ok(graph)
    }

    /// Rewinds history to `target` completed steps: rebuilds that state,
    /// then discards every later patch and snapshot. The returned graph is
    /// the new live state; stepping forward from it diverges from the
    /// discarded future.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Ledger::rebuild`], plus [`EngineError::Store`]
    /// when persisting the truncated history fails.
    pub fn undo_to_step(&mut self, target: u64) -> Result<Graph, EngineError> {
        let graph = self.rebuild(target)?;
        self.patches.truncate(target as usize);
        self.snapshots.retain(|s| s.step <= target);
        debug!(session = %self.session_id, target, "history truncated");
        self.persist()?;
        Ok(graph)
    }

    fn persist(&self) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let envelope = PersistEnvelope {
            session_id: self.session_id.clone(),
            snapshot_interval: self.snapshot_interval,
            snapshots: self.snapshots.clone(),
            patches: self.patches.clone(),
        };
        let value =
            serde_json::to_value(&envelope).map_err(|e| EngineError::Store(e.to_string()))?;
        store.put(&self.session_id, value)
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("session_id", &self.session_id)
            .field("patches", &self.patches.len())
            .field("snapshots", &self.snapshots.len())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Canonicalization
// =============================================================================

#[derive(PartialEq, Eq, Hash)]
enum WriteKey {
    Field(NodeId, String),
    Bind(EdgeId, Endpoint),
    Flags(NodeId),
}

fn write_key(event: &ChangeEvent) -> Option<WriteKey> {
    match event {
        ChangeEvent::FieldSet { target, field, .. } => {
            Some(WriteKey::Field(*target, field.clone()))
        }
        ChangeEvent::EdgeBound { edge, endpoint, .. } => Some(WriteKey::Bind(*edge, *endpoint)),
        ChangeEvent::FlagsSet { node, .. } => Some(WriteKey::Flags(*node)),
        _ => None,
    }
}

fn fold_latest(slot: &mut ChangeEvent, event: ChangeEvent) {
    match (slot, event) {
        (ChangeEvent::FieldSet { new, .. }, ChangeEvent::FieldSet { new: latest, .. }) => {
            *new = latest;
        }
        (ChangeEvent::EdgeBound { new, .. }, ChangeEvent::EdgeBound { new: latest, .. }) => {
            *new = latest;
        }
        (ChangeEvent::FlagsSet { new, .. }, ChangeEvent::FlagsSet { new: latest, .. }) => {
            *new = latest;
        }
        _ => {}
    }
}

fn is_net_noop(event: &ChangeEvent) -> bool {
    match event {
        ChangeEvent::FieldSet { old, new, .. } => old == new,
        ChangeEvent::EdgeBound { old, new, .. } => *old == Some(*new),
        ChangeEvent::FlagsSet { old, new, .. } => old == new,
        _ => false,
    }
}

/// Collapses repeated writes per key to first-old/last-new at the position
/// of the first write, then drops writes that net out to no change.
pub fn canonicalize(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut out: Vec<ChangeEvent> = Vec::with_capacity(events.len());
    let mut slots: HashMap<WriteKey, usize> = HashMap::new();
    for event in events {
        match write_key(&event) {
            None => out.push(event),
            Some(key) => {
                if let Some(&idx) = slots.get(&key) {
                    fold_latest(&mut out[idx], event);
                } else {
                    slots.insert(key, out.len());
                    out.push(event);
                }
            }
        }
    }
    out.retain(|e| !is_net_noop(e));
    out
}

// =============================================================================
// Tests
// =============================================================================
