//! `pbrain-types` – shared data model for the observation pipeline.
//!
//! - [`state`] – raw snapshots, canonical states and their diffs.
//! - [`action`] – the closed [`ActionKind`] variant set, inferred and
//!   commanded actions.
//! - [`observation`] – the immutable [`Observation`] envelope and its
//!   [`Fingerprint`].
//! - [`graph`] – long-term nodes, edges and the [`FactSet`] fed to conflict
//!   resolution.
//! - [`hash`] – the [`StableHasher`] behind every persisted or compared id.

pub mod action;
pub mod graph;
pub mod hash;
pub mod observation;
pub mod state;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use action::{ActionKind, CommandedAction, InferredAction, ObservedAction};
pub use hash::StableHasher;
pub use graph::{
    AttributeState, AttributeValue, EntityType, FactSet, LongTermEdge, LongTermNode, NodeId,
};
pub use observation::{
    Fingerprint, MARKER_KEY, MarkerKind, Observation, ObservationId, STRONG_SIGNAL_KEY,
};
pub use state::{
    Bounds, CanonicalElement, CanonicalState, ChangeKind, FocusChange, RawElement, RawSnapshot,
    StateChangeDiff, TextChange, UNKNOWN_APP,
};

/// Pipeline-wide error taxonomy.
///
/// None of these terminate the pipeline: each is recovered where it occurs
/// and turned into a sentinel state, a flag, a marker observation or a
/// dead-letter record.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineError {
    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Device unreachable after {attempts} attempt(s): {reason}")]
    DeviceUnreachable { attempts: u32, reason: String },

    #[error("Observation queue saturated; {dropped} observation(s) dropped")]
    QueueSaturated { dropped: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),
}
