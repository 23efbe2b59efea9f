//! Conflict Resolver.
//!
//! Merges an observation-derived [`FactSet`] into the existing
//! [`LongTermNode`] for that entity without discarding anything:
//!
//! | incoming attribute | result |
//! |---|---|
//! | not on the node | added with the observation as provenance |
//! | equal to current | observation appended to the current value's provenance |
//! | different, wins | incumbent moved to history, incoming becomes current |
//! | different, loses | incoming appended to history |
//!
//! The winner is picked by confidence, then by observation time. A full tie
//! keeps the incumbent. Merging the same fact set twice changes nothing the
//! second time.

use chrono::{DateTime, Utc};
use pbrain_types::{AttributeState, AttributeValue, FactSet, LongTermNode, NodeId, ObservationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-attribute outcome of one merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub node_id: NodeId,
    /// `true` when no node existed before the merge.
    pub created: bool,
    pub added: Vec<String>,
    pub confirmed: Vec<String>,
    pub replaced: Vec<String>,
    pub rejected: Vec<String>,
}

impl MergeReport {
    /// `true` if the merge changed any current value.
    pub fn changed_beliefs(&self) -> bool {
        !self.added.is_empty() || !self.replaced.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Merge `facts` into `existing` (or a fresh node).
    pub fn merge(&self, existing: Option<LongTermNode>, facts: &FactSet) -> (LongTermNode, MergeReport) {
        let created = existing.is_none();
        let mut node = existing.unwrap_or_else(|| LongTermNode {
            id: facts.node_id(),
            entity_type: facts.entity_type,
            key: facts.key.trim().to_string(),
            attributes: BTreeMap::new(),
            provenance: Vec::new(),
            confidence: 0.0,
            last_updated_at: facts.observed_at,
        });
        let mut report = MergeReport {
            node_id: node.id.clone(),
            created,
            added: Vec::new(),
            confirmed: Vec::new(),
            replaced: Vec::new(),
            rejected: Vec::new(),
        };

        let obs = facts.observation_id;
        for (name, value) in &facts.attributes {
            let incoming = AttributeValue {
                value: value.clone(),
                confidence: facts.confidence.clamp(0.0, 1.0),
                observed_at: facts.observed_at,
                provenance: vec![obs],
            };
            let Some(state) = node.attributes.get_mut(name) else {
                node.attributes.insert(
                    name.clone(),
                    AttributeState {
                        current: incoming,
                        history: Vec::new(),
                    },
                );
                report.added.push(name.clone());
                continue;
            };

            if state.current.value == incoming.value {
                push_unique(&mut state.current.provenance, obs);
                report.confirmed.push(name.clone());
            } else if already_in_history(&state.history, &incoming.value, obs) {
                report.rejected.push(name.clone());
            } else if wins(&incoming, &state.current) {
                let displaced = std::mem::replace(&mut state.current, incoming);
                state.history.push(displaced);
                report.replaced.push(name.clone());
            } else {
                state.history.push(incoming);
                report.rejected.push(name.clone());
            }
        }

        push_unique(&mut node.provenance, obs);
        node.confidence = mean_confidence(&node);
        node.last_updated_at = latest(node.last_updated_at, facts.observed_at);
        (node, report)
    }
}

/// Higher confidence wins, then the later observation. Ties keep the incumbent.
fn wins(incoming: &AttributeValue, incumbent: &AttributeValue) -> bool {
    match incoming.confidence.total_cmp(&incumbent.confidence) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => incoming.observed_at > incumbent.observed_at,
    }
}

fn already_in_history(history: &[AttributeValue], value: &serde_json::Value, obs: ObservationId) -> bool {
    history
        .iter()
        .any(|h| &h.value == value && h.provenance.contains(&obs))
}

fn push_unique(ids: &mut Vec<ObservationId>, id: ObservationId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn mean_confidence(node: &LongTermNode) -> f32 {
    if node.attributes.is_empty() {
        return 0.0;
    }
    let sum: f32 = node.attributes.values().map(|a| a.current.confidence).sum();
    sum / node.attributes.len() as f32
}

fn latest(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    a.max(b)
}
