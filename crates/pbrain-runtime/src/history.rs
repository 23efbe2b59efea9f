//! Recent diff and action history for monitoring queries.
//!
//! Two rolling windows sit beside the pipeline: the last
//! [`DIFF_HISTORY_LEN`] non-empty diffs and the last [`ACTION_HISTORY_LEN`]
//! actions (inferred or commanded). Neither feeds back into diffing, which
//! only ever looks at the latest two canonical states.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use pbrain_runtime::history::RecentHistory;
//! use pbrain_types::{ChangeKind, StateChangeDiff};
//!
//! let history = RecentHistory::new();
//! history.push_diff(Utc::now(), StateChangeDiff::empty("com.slack"));
//! assert_eq!(history.recent_diffs(10, None).len(), 1);
//! assert!(history.recent_diffs(10, Some(ChangeKind::AppSwitch)).is_empty());
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pbrain_types::{ChangeKind, ObservationId, ObservedAction, StateChangeDiff};
use serde::Serialize;

use crate::consolidation::ConsolidationStats;
use crate::driver::{DriverStats, DriverStatus};

pub const DIFF_HISTORY_LEN: usize = 10;
pub const ACTION_HISTORY_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffRecord {
    pub observed_at: DateTime<Utc>,
    pub diff: StateChangeDiff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub observation_id: ObservationId,
    pub observed_at: DateTime<Utc>,
    pub app_id: String,
    pub action: ObservedAction,
}

#[derive(Debug, Default)]
struct Windows {
    diffs: VecDeque<DiffRecord>,
    actions: VecDeque<ActionRecord>,
}

/// Bounded, internally synchronized history of recent diffs and actions.
#[derive(Debug, Default)]
pub struct RecentHistory {
    inner: Mutex<Windows>,
}

impl RecentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_diff(&self, observed_at: DateTime<Utc>, diff: StateChangeDiff) {
        let mut w = self.inner.lock();
        w.diffs.push_back(DiffRecord { observed_at, diff });
        while w.diffs.len() > DIFF_HISTORY_LEN {
            w.diffs.pop_front();
        }
    }

    pub fn push_action(&self, record: ActionRecord) {
        let mut w = self.inner.lock();
        w.actions.push_back(record);
        while w.actions.len() > ACTION_HISTORY_LEN {
            w.actions.pop_front();
        }
    }

    /// Up to `limit` diffs, newest first, optionally of one change kind.
    pub fn recent_diffs(&self, limit: usize, kind: Option<ChangeKind>) -> Vec<DiffRecord> {
        self.inner
            .lock()
            .diffs
            .iter()
            .rev()
            .filter(|r| kind.is_none_or(|k| r.diff.change_kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Diffs whose change kind is notable (app switch, screen change, major
    /// layout change), newest first.
    pub fn notable_diffs(&self, limit: usize) -> Vec<DiffRecord> {
        self.inner
            .lock()
            .diffs
            .iter()
            .rev()
            .filter(|r| r.diff.change_kind.is_notable())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Up to `limit` actions, newest first.
    pub fn recent_actions(&self, limit: usize) -> Vec<ActionRecord> {
        self.inner
            .lock()
            .actions
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Commanded actions only, newest first.
    pub fn commanded_actions(&self, limit: usize) -> Vec<ActionRecord> {
        self.inner
            .lock()
            .actions
            .iter()
            .rev()
            .filter(|r| r.action.is_commanded())
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> (usize, usize) {
        let w = self.inner.lock();
        (w.diffs.len(), w.actions.len())
    }

    pub fn clear(&self) {
        let mut w = self.inner.lock();
        w.diffs.clear();
        w.actions.clear();
    }
}

/// One-shot view of the pipeline's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringOverview {
    pub driver_status: DriverStatus,
    pub driver: DriverStats,
    pub diff_history_len: usize,
    pub action_history_len: usize,
    pub short_term_entries: usize,
    pub consumed_entries: usize,
    pub overflow_backlog: usize,
    pub consolidation: ConsolidationStats,
}
