//! Observation Builder.
//!
//! Wraps an inferred or commanded action together with its diff and context
//! into an immutable [`Observation`], assigning ids from a shared atomic
//! counter. Marker observations for losses and degradations are built here
//! too so every observation id comes from the same sequence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use pbrain_types::{
    InferredAction, MARKER_KEY, MarkerKind, Observation, ObservationId, ObservedAction,
    StateChangeDiff,
};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Observation context has no timestamp")]
    MissingTimestamp,
}

/// Everything about an observation that does not come from the diff.
#[derive(Debug, Clone, Default)]
pub struct ObservationContext {
    pub app_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, Value>,
}

impl ObservationContext {
    pub fn new(app_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            app_id: app_id.into(),
            timestamp: Some(timestamp),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach one metadata entry (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Assigns monotonically increasing ids. Share it behind an `Arc` when more
/// than one task builds observations.
#[derive(Debug)]
pub struct ObservationBuilder {
    next_id: AtomicU64,
}

impl Default for ObservationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationBuilder {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Resume numbering at `first_id`.
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
        }
    }

    /// Build an observation from `action`, `diff` and `ctx`.
    ///
    /// Inputs are cloned; nothing passed in is mutated.
    pub fn build(
        &self,
        action: impl Into<ObservedAction>,
        diff: &StateChangeDiff,
        ctx: &ObservationContext,
    ) -> Result<Observation, BuildError> {
        let timestamp = ctx.timestamp.ok_or(BuildError::MissingTimestamp)?;
        Ok(Observation::from_parts(
            self.next(),
            timestamp,
            action.into(),
            diff.clone(),
            ctx.app_id.clone(),
            ctx.metadata.clone(),
        ))
    }

    /// Build a synthetic marker observation: `Unknown` action, confidence 0,
    /// the marker kind under the `marker` metadata key plus `extra`.
    pub fn marker(
        &self,
        kind: MarkerKind,
        app_id: &str,
        timestamp: DateTime<Utc>,
        extra: BTreeMap<String, Value>,
    ) -> Observation {
        let mut metadata = extra;
        metadata.insert(MARKER_KEY.to_string(), Value::from(kind.as_str()));
        Observation::from_parts(
            self.next(),
            timestamp,
            InferredAction::unknown().into(),
            StateChangeDiff::empty(app_id),
            app_id.to_string(),
            metadata,
        )
    }

    /// The id the next observation will receive.
    pub fn peek(&self) -> ObservationId {
        ObservationId(self.next_id.load(Ordering::Relaxed))
    }

    fn next(&self) -> ObservationId {
        ObservationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}
