//! Long-term memory graph: nodes with auditable attributes, and the edges
//! between them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::observation::ObservationId;

/// Kind of entity a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Place,
    App,
    Habit,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Place => "place",
            EntityType::App => "app",
            EntityType::Habit => "habit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(EntityType::Person),
            "place" => Some(EntityType::Place),
            "app" => Some(EntityType::App),
            "habit" => Some(EntityType::Habit),
            _ => None,
        }
    }
}

/// Deterministic node identifier: `"<entity type>:<normalized key>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Keys are trimmed and lowercased so `"Kevin"` and `"kevin "` meet.
    pub fn new(entity_type: EntityType, key: &str) -> Self {
        NodeId(format!("{}:{}", entity_type.as_str(), key.trim().to_lowercase()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One believed value of an attribute, with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub value: serde_json::Value,
    pub confidence: f32,
    pub observed_at: DateTime<Utc>,
    pub provenance: Vec<ObservationId>,
}

/// Current belief for an attribute plus every value it displaced or that
/// lost against it. History is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeState {
    pub current: AttributeValue,
    #[serde(default)]
    pub history: Vec<AttributeValue>,
}

/// A durable fact about a person, place, app or habit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermNode {
    pub id: NodeId,
    pub entity_type: EntityType,
    pub key: String,
    pub attributes: BTreeMap<String, AttributeState>,
    pub provenance: Vec<ObservationId>,
    pub confidence: f32,
    pub last_updated_at: DateTime<Utc>,
}

impl LongTermNode {
    /// Current value of `attribute`, if known.
    pub fn current(&self, attribute: &str) -> Option<&serde_json::Value> {
        self.attributes.get(attribute).map(|a| &a.current.value)
    }

    /// Number of historical (non-current) values across all attributes.
    pub fn history_len(&self) -> usize {
        self.attributes.values().map(|a| a.history.len()).sum()
    }
}

/// Directed, weighted relation between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermEdge {
    pub relation_type: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub weight: f32,
    pub provenance: Vec<ObservationId>,
}

/// Observation-derived attributes for one entity, input to conflict
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSet {
    pub entity_type: EntityType,
    pub key: String,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub confidence: f32,
    pub observed_at: DateTime<Utc>,
    pub observation_id: ObservationId,
}

impl FactSet {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.entity_type, &self.key)
    }
}
