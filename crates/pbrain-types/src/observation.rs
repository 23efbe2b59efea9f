//! The [`Observation`] envelope: the unit stored in short-term memory and
//! later consolidated.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionKind, ObservedAction};
use crate::hash::StableHasher;
use crate::state::StateChangeDiff;

/// Metadata key naming a synthetic marker observation.
pub const MARKER_KEY: &str = "marker";
/// Metadata key flagging an observation as high-signal.
pub const STRONG_SIGNAL_KEY: &str = "strong_signal";

/// Synthetic observations that record a loss or degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    ObservationDropped,
    DeviceUnreachable,
    MalformedSnapshot,
}

impl MarkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerKind::ObservationDropped => "observation_dropped",
            MarkerKind::DeviceUnreachable => "device_unreachable",
            MarkerKind::MalformedSnapshot => "malformed_snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "observation_dropped" => Some(MarkerKind::ObservationDropped),
            "device_unreachable" => Some(MarkerKind::DeviceUnreachable),
            "malformed_snapshot" => Some(MarkerKind::MalformedSnapshot),
            _ => None,
        }
    }
}

/// Monotonically increasing observation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(pub u64);

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

/// Key identifying "the same kind of observation" across occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Derive the fingerprint of `(app_id, action kind, targets)`.
    pub fn of(app_id: &str, kind: &ActionKind) -> Self {
        let mut hasher = StableHasher::new();
        hasher.write_str(app_id).write_str(kind.label());
        let targets = kind.targets();
        hasher.write_u64(targets.len() as u64);
        for target in &targets {
            hasher.write_str(target);
        }
        Fingerprint(hasher.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable record of one thing that happened on the device.
///
/// Fields are private: an observation is built once (see the perception
/// crate's `ObservationBuilder`) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    id: ObservationId,
    timestamp: DateTime<Utc>,
    action: ObservedAction,
    diff: StateChangeDiff,
    app_context: String,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Observation {
    /// Assemble an observation. Identifier assignment is the builder's job;
    /// callers outside the pipeline should go through it.
    pub fn from_parts(
        id: ObservationId,
        timestamp: DateTime<Utc>,
        action: ObservedAction,
        diff: StateChangeDiff,
        app_context: String,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id,
            timestamp,
            action,
            diff,
            app_context,
            metadata,
        }
    }

    pub fn id(&self) -> ObservationId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn action(&self) -> &ObservedAction {
        &self.action
    }

    pub fn diff(&self) -> &StateChangeDiff {
        &self.diff
    }

    pub fn app_context(&self) -> &str {
        &self.app_context
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.app_context, self.action.kind())
    }

    /// The marker kind, if this is a synthetic loss/degradation record.
    pub fn marker(&self) -> Option<MarkerKind> {
        self.metadata
            .get(MARKER_KEY)
            .and_then(|v| v.as_str())
            .and_then(MarkerKind::parse)
    }

    pub fn is_strong_signal(&self) -> bool {
        self.metadata
            .get(STRONG_SIGNAL_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
