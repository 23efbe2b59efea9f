//! Short-Term Store.
//!
//! A bounded, TTL-governed map of [`ShortTermEntry`] keyed by observation
//! [`Fingerprint`]. Repeated observations with the same fingerprint fold into
//! one entry whose `recurrence_count` climbs until the entry expires.
//!
//! The store is internally synchronized. The recorder task is the single
//! writer; consolidation and monitoring read through [`ShortTermStore::snapshot`],
//! which clones entries under the read lock so no reader ever sees a
//! half-updated entry.
//!
//! # Lifecycle of an entry
//!
//! | event | effect |
//! |---|---|
//! | first `record` | inserted with count 1 and a fresh generation |
//! | `record` within TTL | count + 1, expiry pushed to `last_seen_at + ttl` |
//! | `record` of a strong signal | kept in `strong_signal` until the entry expires |
//! | `mark_consumed` | promotion digest stored, entry stays |
//! | `expires_at <= now` | removed by the next sweep |
//! | store full | entry with the earliest `expires_at` evicted |
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use pbrain_memory::short_term::{ShortTermConfig, ShortTermStore};
//!
//! let store = ShortTermStore::new(ShortTermConfig {
//!     capacity: 128,
//!     ttl: Duration::minutes(30),
//!     recurrence_threshold: 3,
//! });
//! assert!(store.is_empty());
//! assert_eq!(store.sweep_expired(Utc::now()), 0);
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use pbrain_types::{ActionKind, Fingerprint, Observation, ObservationId};
use serde::Serialize;
use tracing::debug;

/// Occurrence ids kept per entry; older ones are dropped first.
const MAX_OCCURRENCES: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Config / entry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortTermConfig {
    pub capacity: usize,
    pub ttl: Duration,
    pub recurrence_threshold: u32,
}

impl Default for ShortTermConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            ttl: Duration::minutes(30),
            recurrence_threshold: 3,
        }
    }
}

/// One fingerprint's worth of recent activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShortTermEntry {
    /// The most recent observation with this fingerprint.
    pub observation: Observation,
    pub fingerprint: Fingerprint,
    /// Distinguishes this entry from earlier, expired entries with the
    /// same fingerprint.
    pub generation: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub recurrence_count: u32,
    /// Ids of the observations folded into this entry, oldest first.
    pub occurrences: Vec<ObservationId>,
    /// Digest of the facts last promoted from this entry.
    pub consumed_digest: Option<u64>,
    /// Latest strong-signal observation folded into this entry. Kept when
    /// plain observations with the same fingerprint arrive later.
    pub strong_signal: Option<Observation>,
}

impl ShortTermEntry {
    /// Strong signals qualify immediately. Recurrence alone never qualifies
    /// marker or `Unknown` observations.
    pub fn qualifies(&self, recurrence_threshold: u32) -> bool {
        if self.strong_signal.is_some() {
            return true;
        }
        let promotable = self.observation.marker().is_none()
            && *self.observation.action().kind() != ActionKind::Unknown;
        promotable && self.recurrence_count >= recurrence_threshold
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_digest.is_some()
    }
}

/// What a single [`ShortTermStore::record`] call did.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub fingerprint: Fingerprint,
    pub generation: u64,
    pub recurrence_count: u32,
    /// `true` when a new entry was created.
    pub inserted: bool,
    /// Fingerprint of the entry evicted to make room, if any.
    pub evicted: Option<Fingerprint>,
    /// Entries removed by the sweep that ran first.
    pub expired: usize,
    pub qualifies: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// ShortTermStore
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Fingerprint, ShortTermEntry>,
    next_generation: u64,
}

#[derive(Debug)]
pub struct ShortTermStore {
    config: ShortTermConfig,
    inner: RwLock<Inner>,
}

impl ShortTermStore {
    pub fn new(config: ShortTermConfig) -> Self {
        Self {
            config: ShortTermConfig {
                capacity: config.capacity.max(1),
                ..config
            },
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn config(&self) -> ShortTermConfig {
        self.config
    }

    /// Fold `observation` into the store, using its timestamp as "now".
    pub fn record(&self, observation: Observation) -> RecordOutcome {
        let now = observation.timestamp();
        let fingerprint = observation.fingerprint();
        let mut inner = self.inner.write();
        let expired = sweep(&mut inner.entries, now);

        if let Some(entry) = inner.entries.get_mut(&fingerprint) {
            entry.recurrence_count = entry.recurrence_count.saturating_add(1);
            entry.occurrences.push(observation.id());
            if entry.occurrences.len() > MAX_OCCURRENCES {
                let excess = entry.occurrences.len() - MAX_OCCURRENCES;
                entry.occurrences.drain(..excess);
            }
            entry.last_seen_at = entry.last_seen_at.max(now);
            entry.expires_at = entry.last_seen_at + self.config.ttl;
            if observation.is_strong_signal() {
                entry.strong_signal = Some(observation.clone());
            }
            entry.observation = observation;
            return RecordOutcome {
                fingerprint,
                generation: entry.generation,
                recurrence_count: entry.recurrence_count,
                inserted: false,
                evicted: None,
                expired,
                qualifies: entry.qualifies(self.config.recurrence_threshold),
            };
        }

        let evicted = if inner.entries.len() >= self.config.capacity {
            evict_earliest_expiry(&mut inner.entries)
        } else {
            None
        };
        if let Some(fp) = evicted {
            debug!(fingerprint = %fp, "short-term store full; evicted earliest-expiring entry");
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let entry = ShortTermEntry {
            fingerprint,
            generation,
            first_seen_at: now,
            last_seen_at: now,
            expires_at: now + self.config.ttl,
            recurrence_count: 1,
            occurrences: vec![observation.id()],
            consumed_digest: None,
            strong_signal: observation.is_strong_signal().then(|| observation.clone()),
            observation,
        };
        let qualifies = entry.qualifies(self.config.recurrence_threshold);
        inner.entries.insert(fingerprint, entry);

        RecordOutcome {
            fingerprint,
            generation,
            recurrence_count: 1,
            inserted: true,
            evicted,
            expired,
            qualifies,
        }
    }

    /// Remove every entry with `expires_at <= now`; returns how many.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        sweep(&mut self.inner.write().entries, now)
    }

    /// Point-in-time copy of all entries, most recently seen first.
    pub fn snapshot(&self) -> Vec<ShortTermEntry> {
        let mut entries: Vec<ShortTermEntry> = self.inner.read().entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then(b.generation.cmp(&a.generation))
        });
        entries
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<ShortTermEntry> {
        self.inner.read().entries.get(&fingerprint).cloned()
    }

    /// Record that the entry `(fingerprint, generation)` was promoted with
    /// `digest`. Returns `false` when that generation is no longer live.
    pub fn mark_consumed(&self, fingerprint: Fingerprint, generation: u64, digest: u64) -> bool {
        match self.inner.write().entries.get_mut(&fingerprint) {
            Some(entry) if entry.generation == generation => {
                entry.consumed_digest = Some(digest);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consumed_count(&self) -> usize {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| e.is_consumed())
            .count()
    }
}

fn sweep(entries: &mut HashMap<Fingerprint, ShortTermEntry>, now: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|_, e| e.expires_at > now);
    before - entries.len()
}

fn evict_earliest_expiry(entries: &mut HashMap<Fingerprint, ShortTermEntry>) -> Option<Fingerprint> {
    let victim = entries
        .values()
        .min_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then(a.generation.cmp(&b.generation))
        })
        .map(|e| e.fingerprint)?;
    entries.remove(&victim);
    Some(victim)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pbrain_types::{InferredAction, MARKER_KEY, STRONG_SIGNAL_KEY, StateChangeDiff};
    use std::collections::BTreeMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
    }

    fn switch_into(app: &str, id: u64, at: DateTime<Utc>) -> Observation {
        let kind = ActionKind::AppSwitch {
            from_app: "home".into(),
            to_app: app.into(),
        };
        Observation::from_parts(
            ObservationId(id),
            at,
            InferredAction::new(kind, 1.0).into(),
            StateChangeDiff::empty(app),
            app.to_string(),
            BTreeMap::new(),
        )
    }

    fn with_metadata(app: &str, id: u64, at: DateTime<Utc>, key: &str, value: serde_json::Value) -> Observation {
        let mut md = BTreeMap::new();
        md.insert(key.to_string(), value);
        Observation::from_parts(
            ObservationId(id),
            at,
            InferredAction::unknown().into(),
            StateChangeDiff::empty(app),
            app.to_string(),
            md,
        )
    }

    fn store(capacity: usize) -> ShortTermStore {
        ShortTermStore::new(ShortTermConfig {
            capacity,
            ttl: Duration::minutes(10),
            recurrence_threshold: 3,
        })
    }

    #[test]
    fn third_recurrence_qualifies() {
        let s = store(16);
        let a = s.record(switch_into("messaging", 1, t0()));
        let b = s.record(switch_into("messaging", 2, t0() + Duration::minutes(1)));
        let c = s.record(switch_into("messaging", 3, t0() + Duration::minutes(2)));
        assert!(a.inserted && !b.inserted && !c.inserted);
        assert_eq!((a.recurrence_count, b.recurrence_count, c.recurrence_count), (1, 2, 3));
        assert!(!b.qualifies);
        assert!(c.qualifies);
        let entry = s.get(c.fingerprint).unwrap();
        assert_eq!(entry.occurrences, vec![ObservationId(1), ObservationId(2), ObservationId(3)]);
        assert_eq!(entry.observation.id(), ObservationId(3));
    }

    #[test]
    fn count_is_non_decreasing_within_ttl_and_resets_after_expiry() {
        let s = store(16);
        let mut last = 0;
        for i in 0..5 {
            let out = s.record(switch_into("a", i, t0() + Duration::minutes(i as i64)));
            assert!(out.recurrence_count >= last);
            last = out.recurrence_count;
        }
        assert_eq!(last, 5);

        let late = t0() + Duration::hours(2);
        let out = s.record(switch_into("a", 99, late));
        assert_eq!(out.recurrence_count, 1);
        assert!(out.inserted);
        assert_eq!(out.expired, 1);
    }

    #[test]
    fn new_generation_after_expiry() {
        let s = store(16);
        let first = s.record(switch_into("a", 1, t0()));
        let second = s.record(switch_into("a", 2, t0() + Duration::hours(1)));
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_ne!(first.generation, second.generation);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let s = store(16);
        s.record(switch_into("a", 1, t0()));
        s.record(switch_into("b", 2, t0() + Duration::minutes(8)));
        assert_eq!(s.sweep_expired(t0() + Duration::minutes(10)), 1);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn full_store_evicts_earliest_expiry() {
        let s = store(2);
        let a = s.record(switch_into("a", 1, t0()));
        s.record(switch_into("b", 2, t0() + Duration::minutes(1)));
        // Refresh "a" so "b" now expires first.
        s.record(switch_into("a", 3, t0() + Duration::minutes(2)));
        let c = s.record(switch_into("c", 4, t0() + Duration::minutes(3)));
        assert_eq!(s.len(), 2);
        assert!(c.evicted.is_some());
        assert_ne!(c.evicted, Some(a.fingerprint));
        assert!(s.get(a.fingerprint).is_some());
    }

    #[test]
    fn snapshot_is_newest_first() {
        let s = store(16);
        s.record(switch_into("a", 1, t0()));
        s.record(switch_into("b", 2, t0() + Duration::minutes(1)));
        s.record(switch_into("c", 3, t0() + Duration::minutes(2)));
        let apps: Vec<String> = s
            .snapshot()
            .iter()
            .map(|e| e.observation.app_context().to_string())
            .collect();
        assert_eq!(apps, vec!["c", "b", "a"]);
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let s = store(16);
        let out = s.record(switch_into("a", 1, t0()));
        let snap = s.snapshot();
        s.record(switch_into("a", 2, t0() + Duration::minutes(1)));
        assert_eq!(snap[0].recurrence_count, 1);
        assert_eq!(s.get(out.fingerprint).unwrap().recurrence_count, 2);
    }

    #[test]
    fn mark_consumed_requires_live_generation() {
        let s = store(16);
        let out = s.record(switch_into("a", 1, t0()));
        assert!(!s.mark_consumed(out.fingerprint, out.generation + 1, 7));
        assert!(s.mark_consumed(out.fingerprint, out.generation, 7));
        assert_eq!(s.get(out.fingerprint).unwrap().consumed_digest, Some(7));
        assert_eq!(s.len(), 1, "consumed entries stay until they expire");
        assert_eq!(s.consumed_count(), 1);
    }

    #[test]
    fn markers_never_qualify_by_recurrence() {
        let s = store(16);
        let mut last = None;
        for i in 0..5 {
            last = Some(s.record(with_metadata(
                "unknown",
                i,
                t0() + Duration::seconds(i as i64),
                MARKER_KEY,
                serde_json::json!("device_unreachable"),
            )));
        }
        let out = last.unwrap();
        assert_eq!(out.recurrence_count, 5);
        assert!(!out.qualifies);
    }

    #[test]
    fn strong_signal_qualifies_immediately() {
        let s = store(16);
        let out = s.record(with_metadata(
            "com.whatsapp",
            1,
            t0(),
            STRONG_SIGNAL_KEY,
            serde_json::json!(true),
        ));
        assert_eq!(out.recurrence_count, 1);
        assert!(out.qualifies);
    }

    #[test]
    fn strong_signal_survives_later_plain_observation() {
        let s = store(16);
        s.record(with_metadata(
            "com.whatsapp",
            1,
            t0(),
            STRONG_SIGNAL_KEY,
            serde_json::json!(true),
        ));
        let out = s.record(with_metadata(
            "com.whatsapp",
            2,
            t0() + Duration::seconds(1),
            "change_kind",
            serde_json::json!("minor_layout_change"),
        ));
        assert!(!out.inserted);
        assert!(out.qualifies);
        let entry = s.get(out.fingerprint).unwrap();
        assert_eq!(entry.observation.id(), ObservationId(2));
        assert_eq!(entry.strong_signal.map(|o| o.id()), Some(ObservationId(1)));
    }
}
