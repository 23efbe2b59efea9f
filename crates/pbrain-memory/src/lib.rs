//! `pbrain-memory` – short-term and long-term memory.
//!
//! Recent observations live in an in-process, TTL-bounded store; facts that
//! recur or arrive with a strong signal are merged into a durable graph kept
//! in a local SQLite substrate.
//!
//! # Modules
//!
//! - [`short_term`] – [`ShortTermStore`][short_term::ShortTermStore]:
//!   fingerprint-keyed recency buffer with recurrence counting.
//! - [`conflict`] – [`ConflictResolver`][conflict::ConflictResolver]: merges
//!   new facts into existing nodes, keeping every displaced value in history.
//! - [`long_term`] – the [`LongTermStore`][long_term::LongTermStore] trait and
//!   its SQLite implementation.
//! - [`promotion`] – [`Promotion`][promotion::Promotion]: the facts and edges
//!   one short-term entry contributes, and how they are applied.
//! - [`overflow`] – [`OverflowLog`][overflow::OverflowLog]: dead letters for
//!   promotions that could not be persisted.

pub mod conflict;
pub mod long_term;
pub mod overflow;
pub mod promotion;
pub mod short_term;

pub use conflict::{ConflictResolver, MergeReport};
pub use long_term::{GraphError, LongTermStore, PersistenceError, SqliteGraphStore};
pub use overflow::{OverflowError, OverflowLog, OverflowRecord};
pub use promotion::Promotion;
pub use short_term::{RecordOutcome, ShortTermConfig, ShortTermEntry, ShortTermStore};
