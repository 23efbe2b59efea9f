//! Long-term memory graph persistence.
//!
//! [`LongTermStore`] is the seam the consolidation engine writes through.
//! [`SqliteGraphStore`] is the bundled implementation.
//!
//! # Storage layout
//!
//! | table | key | columns |
//! |---|---|---|
//! | `graph_nodes` | `id` | `entity_type`, `key`, `confidence`, `last_updated_at`, `body` (JSON node) |
//! | `graph_edges` | `(source_id, target_id, relation_type)` | `weight`, `body` (JSON edge) |
//!
//! Re-upserting an edge keeps the higher weight and the union of both
//! provenance lists, so a replayed promotion never erases evidence.
//!
//! # Example
//!
//! ```rust
//! use pbrain_memory::long_term::SqliteGraphStore;
//!
//! let store = SqliteGraphStore::open_in_memory().unwrap();
//! assert_eq!(store.node_count().unwrap(), 0);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use pbrain_types::{EntityType, LongTermEdge, LongTermNode, NodeId};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error types
// ─────────────────────────────────────────────────────────────────────────────

/// Failure reported by any [`LongTermStore`]. Always retryable from the
/// caller's point of view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Long-term store unavailable: {0}")]
    Unavailable(String),
    #[error("Long-term store rejected the write: {0}")]
    Backend(String),
}

/// Errors from the SQLite graph store itself.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<GraphError> for PersistenceError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Sqlite(rusqlite::Error::SqliteFailure(code, msg))
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                PersistenceError::Unavailable(msg.unwrap_or_else(|| code.to_string()))
            }
            other => PersistenceError::Backend(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LongTermStore trait
// ─────────────────────────────────────────────────────────────────────────────

/// Durable graph of nodes and edges.
///
/// Implementations may suspend on I/O; the pipeline only calls them from the
/// consolidation task.
#[async_trait]
pub trait LongTermStore: Send + Sync {
    async fn load_node(&self, id: &NodeId) -> Result<Option<LongTermNode>, PersistenceError>;

    /// Insert or fully replace the node with `node.id`.
    async fn upsert_node(&self, node: &LongTermNode) -> Result<(), PersistenceError>;

    async fn upsert_edge(&self, edge: &LongTermEdge) -> Result<(), PersistenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteGraphStore
// ─────────────────────────────────────────────────────────────────────────────

pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    /// Open (or create) a persistent graph database at `path`.
    pub fn open(path: &str) -> Result<Self, GraphError> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, GraphError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), GraphError> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS graph_nodes (
                id              TEXT NOT NULL PRIMARY KEY,
                entity_type     TEXT NOT NULL,
                key             TEXT NOT NULL,
                confidence      REAL NOT NULL,
                last_updated_at TEXT NOT NULL,
                body            TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS graph_nodes_by_type ON graph_nodes (entity_type);
            CREATE TABLE IF NOT EXISTS graph_edges (
                source_id     TEXT NOT NULL,
                target_id     TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                weight        REAL NOT NULL,
                body          TEXT NOT NULL,
                PRIMARY KEY (source_id, target_id, relation_type)
            );",
        )?;
        Ok(())
    }

    pub fn get_node(&self, id: &NodeId) -> Result<Option<LongTermNode>, GraphError> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM graph_nodes WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match body {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub fn put_node(&self, node: &LongTermNode) -> Result<(), GraphError> {
        let body = serde_json::to_string(node)?;
        self.conn.lock().execute(
            "INSERT INTO graph_nodes (id, entity_type, key, confidence, last_updated_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 entity_type = excluded.entity_type,
                 key = excluded.key,
                 confidence = excluded.confidence,
                 last_updated_at = excluded.last_updated_at,
                 body = excluded.body",
            params![
                node.id.0,
                node.entity_type.as_str(),
                node.key,
                f64::from(node.confidence),
                node.last_updated_at.to_rfc3339(),
                body,
            ],
        )?;
        Ok(())
    }

    pub fn put_edge(&self, edge: &LongTermEdge) -> Result<(), GraphError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT body FROM graph_edges
                 WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3",
                params![edge.source_node_id.0, edge.target_node_id.0, edge.relation_type],
                |row| row.get(0),
            )
            .optional()?;

        let mut merged = edge.clone();
        if let Some(json) = existing {
            let prior: LongTermEdge = serde_json::from_str(&json)?;
            merged.weight = merged.weight.max(prior.weight);
            let mut provenance = prior.provenance;
            for id in &edge.provenance {
                if !provenance.contains(id) {
                    provenance.push(*id);
                }
            }
            merged.provenance = provenance;
        }

        tx.execute(
            "INSERT OR REPLACE INTO graph_edges (source_id, target_id, relation_type, weight, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                merged.source_node_id.0,
                merged.target_node_id.0,
                merged.relation_type,
                f64::from(merged.weight),
                serde_json::to_string(&merged)?,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All nodes, optionally restricted to one entity type, ordered by id.
    pub fn nodes(&self, entity_type: Option<EntityType>) -> Result<Vec<LongTermNode>, GraphError> {
        let conn = self.conn.lock();
        let bodies: Vec<String> = match entity_type {
            Some(t) => {
                let mut stmt =
                    conn.prepare("SELECT body FROM graph_nodes WHERE entity_type = ?1 ORDER BY id ASC")?;
                let rows = stmt.query_map(params![t.as_str()], |row| row.get(0))?;
                rows.collect::<Result<Vec<String>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT body FROM graph_nodes ORDER BY id ASC")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<Vec<String>, _>>()?
            }
        };
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(GraphError::from))
            .collect()
    }

    /// Edges leaving `source`.
    pub fn edges_from(&self, source: &NodeId) -> Result<Vec<LongTermEdge>, GraphError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT body FROM graph_edges WHERE source_id = ?1
             ORDER BY target_id ASC, relation_type ASC",
        )?;
        let bodies: Vec<String> = stmt
            .query_map(params![source.0], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(GraphError::from))
            .collect()
    }

    pub fn node_count(&self) -> Result<usize, GraphError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM graph_nodes", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn edge_count(&self) -> Result<usize, GraphError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM graph_edges", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[async_trait]
impl LongTermStore for SqliteGraphStore {
    async fn load_node(&self, id: &NodeId) -> Result<Option<LongTermNode>, PersistenceError> {
        Ok(self.get_node(id)?)
    }

    async fn upsert_node(&self, node: &LongTermNode) -> Result<(), PersistenceError> {
        Ok(self.put_node(node)?)
    }

    async fn upsert_edge(&self, edge: &LongTermEdge) -> Result<(), PersistenceError> {
        Ok(self.put_edge(edge)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
