//! Overflow log for promotions that could not be persisted.
//!
//! When the long-term store keeps failing, the consolidation engine parks the
//! whole [`Promotion`] here instead of losing it. `replay_overflow` later
//! drains the log.
//!
//! # Storage layout
//!
//! | column       | type    | description                              |
//! |--------------|---------|------------------------------------------|
//! | id           | TEXT    | UUID v4 primary key                      |
//! | recorded_at  | TEXT    | RFC-3339 time the promotion was parked   |
//! | fingerprint  | TEXT    | Source short-term entry fingerprint      |
//! | attempts     | INTEGER | Persistence attempts made so far         |
//! | last_error   | TEXT    | Most recent persistence error            |
//! | body         | TEXT    | JSON-encoded promotion                   |
//!
//! Rows that no longer decode (bad id, timestamp or body) are moved to
//! `overflow_quarantine`, with the same columns plus a `reason`, the first
//! time [`OverflowLog::pending`] reads them. Healthy records keep draining.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::promotion::Promotion;

#[derive(Error, Debug)]
pub enum OverflowError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Corrupt overflow record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// A parked promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct OverflowRecord {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
    pub promotion: Promotion,
}

pub struct OverflowLog {
    conn: Mutex<Connection>,
}

impl OverflowLog {
    pub fn open(path: &str) -> Result<Self, OverflowError> {
        let log = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        log.init_schema()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self, OverflowError> {
        let log = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), OverflowError> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS overflow_promotions (
                id          TEXT NOT NULL PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                attempts    INTEGER NOT NULL,
                last_error  TEXT NOT NULL,
                body        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS overflow_quarantine (
                id          TEXT NOT NULL PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                attempts    INTEGER NOT NULL,
                last_error  TEXT NOT NULL,
                body        TEXT NOT NULL,
                reason      TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Park `promotion` after `attempts` failed attempts.
    pub fn push(&self, promotion: &Promotion, attempts: u32, last_error: &str) -> Result<Uuid, OverflowError> {
        let id = Uuid::new_v4();
        self.conn.lock().execute(
            "INSERT INTO overflow_promotions (id, recorded_at, fingerprint, attempts, last_error, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                Utc::now().to_rfc3339(),
                promotion.fingerprint.to_string(),
                attempts,
                last_error,
                serde_json::to_string(promotion)?,
            ],
        )?;
        Ok(id)
    }

    /// All parked promotions, oldest first. Undecodable rows are
    /// quarantined and left out.
    pub fn pending(&self) -> Result<Vec<OverflowRecord>, OverflowError> {
        let mut conn = self.conn.lock();
        let rows: Vec<(String, String, u32, String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, recorded_at, attempts, last_error, body
                 FROM overflow_promotions
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut records = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for (id, recorded_at, attempts, last_error, body) in rows {
            match decode(&id, &recorded_at, &body) {
                Ok((uuid, recorded_at, promotion)) => records.push(OverflowRecord {
                    id: uuid,
                    recorded_at,
                    attempts,
                    last_error,
                    promotion,
                }),
                Err(err) => {
                    warn!(error = %err, "quarantining corrupt overflow record");
                    corrupt.push((id, err.to_string()));
                }
            }
        }

        if !corrupt.is_empty() {
            let tx = conn.transaction()?;
            for (id, reason) in &corrupt {
                tx.execute(
                    "INSERT OR REPLACE INTO overflow_quarantine
                         (id, recorded_at, fingerprint, attempts, last_error, body, reason)
                     SELECT id, recorded_at, fingerprint, attempts, last_error, body, ?2
                     FROM overflow_promotions WHERE id = ?1",
                    params![id, reason],
                )?;
                tx.execute("DELETE FROM overflow_promotions WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
        }
        Ok(records)
    }

    /// Drop a record after it was replayed successfully.
    pub fn remove(&self, id: Uuid) -> Result<bool, OverflowError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM overflow_promotions WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    /// Note one more failed replay of `id`.
    pub fn record_failure(&self, id: Uuid, error: &str) -> Result<(), OverflowError> {
        self.conn.lock().execute(
            "UPDATE overflow_promotions SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id.to_string(), error],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, OverflowError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM overflow_promotions", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, OverflowError> {
        Ok(self.len()? == 0)
    }

    /// Rows moved aside because they could not be decoded.
    pub fn quarantined_len(&self) -> Result<usize, OverflowError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM overflow_quarantine", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn decode(id: &str, recorded_at: &str, body: &str) -> Result<(Uuid, DateTime<Utc>, Promotion), OverflowError> {
    let corrupt = |reason: String| OverflowError::Corrupt {
        id: id.to_string(),
        reason,
    };
    let uuid = Uuid::parse_str(id).map_err(|e| corrupt(e.to_string()))?;
    let recorded_at = recorded_at
        .parse::<DateTime<Utc>>()
        .map_err(|e| corrupt(e.to_string()))?;
    let promotion = serde_json::from_str(body).map_err(|e| corrupt(e.to_string()))?;
    Ok((uuid, recorded_at, promotion))
}
