//! A unit of long-term write work: the facts and edges one short-term entry
//! contributes to the graph.

use pbrain_types::{FactSet, Fingerprint, LongTermEdge, StableHasher};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conflict::{ConflictResolver, MergeReport};
use crate::long_term::{LongTermStore, PersistenceError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    /// Short-term entry this promotion came from.
    pub fingerprint: Fingerprint,
    pub generation: u64,
    /// Facts that define the promotion (habit, person, place...).
    pub primary: Vec<FactSet>,
    /// Supporting facts such as the app node.
    #[serde(default)]
    pub context: Vec<FactSet>,
    #[serde(default)]
    pub edges: Vec<LongTermEdge>,
}

impl Promotion {
    /// Hash of the primary facts' identities and attribute values.
    ///
    /// Confidence, timestamps and provenance are left out so the same fact
    /// observed again yields the same digest.
    pub fn digest(&self) -> u64 {
        let mut hasher = StableHasher::new();
        for fact in &self.primary {
            hasher.write_str(&fact.node_id().0);
            hasher.write_u64(fact.attributes.len() as u64);
            for (name, value) in &fact.attributes {
                hasher.write_str(name).write_str(&value.to_string());
            }
        }
        hasher.finish()
    }

    /// Merge every fact into its stored node and upsert the edges.
    ///
    /// Safe to call again after a partial failure: merging a fact set that
    /// was already applied only confirms it.
    pub async fn apply(
        &self,
        store: &dyn LongTermStore,
        resolver: &ConflictResolver,
    ) -> Result<Vec<MergeReport>, PersistenceError> {
        let mut reports = Vec::with_capacity(self.primary.len() + self.context.len());
        for facts in self.primary.iter().chain(&self.context) {
            let existing = store.load_node(&facts.node_id()).await?;
            let (node, report) = resolver.merge(existing, facts);
            store.upsert_node(&node).await?;
            debug!(node = %node.id, created = report.created, "merged facts into node");
            reports.push(report);
        }
        for edge in &self.edges {
            store.upsert_edge(edge).await?;
        }
        Ok(reports)
    }
}
