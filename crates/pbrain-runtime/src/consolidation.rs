//! [`ConsolidationEngine`] – graduates short-term entries into long-term
//! memory.
//!
//! A pass takes a [`ShortTermStore::snapshot`] and, for every entry that
//! qualifies (recurrence threshold reached, or a strong signal), derives a
//! [`Promotion`]:
//!
//! | trigger | primary fact | edge to the app node |
//! |---|---|---|
//! | recurrence | habit `{app, pattern}` keyed `"<app>/<pattern>"` | `habit_in` |
//! | strong signal, `entity: person` | the named person | `contacted_via` |
//! | strong signal, `entity: place` | the named place | `visited_via` |
//!
//! The app the observation happened in is always added as a context fact.
//!
//! Each entry remembers the digest of the facts it last promoted, so an
//! entry that has not learned anything new is skipped. Persistence failures
//! are retried with exponential backoff; a promotion that still fails is
//! parked in the [`OverflowLog`] and the entry is marked consumed anyway.
//! [`ConsolidationEngine::replay_overflow`] drains the log later.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pbrain_memory::{
    ConflictResolver, LongTermStore, MergeReport, OverflowError, OverflowLog, PersistenceError,
    Promotion, ShortTermEntry, ShortTermStore,
};
use pbrain_types::{ActionKind, EntityType, FactSet, LongTermEdge, NodeId, Observation, UNKNOWN_APP};
use serde::Serialize;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::backoff_delay;

/// Confidence given to strong-signal facts that do not state their own.
const DEFAULT_STRONG_SIGNAL_CONFIDENCE: f32 = 0.9;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration / reports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidationConfig {
    pub interval: Duration,
    /// Retries after the first failed persistence attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

/// What one [`ConsolidationEngine::run_once`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub examined: usize,
    pub qualified: usize,
    pub promoted: usize,
    pub skipped_unchanged: usize,
    pub dead_lettered: usize,
    pub reports: Vec<MergeReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub still_pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    promoted: AtomicU64,
    skipped_unchanged: AtomicU64,
    dead_lettered: AtomicU64,
    replayed: AtomicU64,
}

/// Running totals across all passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStats {
    pub passes: u64,
    pub promoted: u64,
    pub skipped_unchanged: u64,
    pub dead_lettered: u64,
    pub replayed: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Promotion derivation
// ─────────────────────────────────────────────────────────────────────────────

/// Habit pattern name for a recurring action.
fn habit_pattern(entry: &ShortTermEntry) -> Option<&'static str> {
    let action = entry.observation.action();
    if action.is_commanded() {
        return Some("frequent_command");
    }
    match action.kind() {
        ActionKind::AppSwitch { .. } => Some("frequent_switch"),
        ActionKind::TypeText { .. } => Some("frequent_typing"),
        ActionKind::Tap { .. } => Some("frequent_tap"),
        ActionKind::Swipe { .. } => Some("frequent_scroll"),
        ActionKind::Unknown => None,
    }
}

/// The entity a strong-signal observation names through its `entity`,
/// `entity_key`, `attributes` and optional `confidence` metadata.
fn strong_signal_facts(obs: &Observation) -> Option<FactSet> {
    let meta = obs.metadata();
    let entity_type = meta.get("entity").and_then(Value::as_str).and_then(EntityType::parse)?;
    let key = meta
        .get("entity_key")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())?;
    let attributes: BTreeMap<String, Value> = match meta.get("attributes") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    };
    let confidence = meta
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|c| (c as f32).clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_STRONG_SIGNAL_CONFIDENCE);
    Some(FactSet {
        entity_type,
        key: key.to_string(),
        attributes,
        confidence,
        observed_at: obs.timestamp(),
        observation_id: obs.id(),
    })
}

fn relation_to_app(entity_type: EntityType) -> Option<&'static str> {
    match entity_type {
        EntityType::Habit => Some("habit_in"),
        EntityType::Person => Some("contacted_via"),
        EntityType::Place => Some("visited_via"),
        EntityType::App => None,
    }
}

/// Turn a qualifying entry into the facts and edges it implies.
///
/// Returns `None` when the entry implies nothing storable (for example a
/// strong signal without a recognizable entity).
pub fn derive_promotion(entry: &ShortTermEntry, recurrence_threshold: u32) -> Option<Promotion> {
    let obs = &entry.observation;
    let app = obs.app_context().trim();
    let mut primary = Vec::new();

    if let Some(signal) = &entry.strong_signal {
        match strong_signal_facts(signal) {
            Some(facts) => primary.push(facts),
            None => warn!(
                fingerprint = %entry.fingerprint,
                "strong signal without a usable entity; ignoring signal"
            ),
        }
    }

    let recurring = obs.marker().is_none() && entry.recurrence_count >= recurrence_threshold;
    if recurring && let Some(pattern) = habit_pattern(entry) {
        let mut attributes = BTreeMap::new();
        attributes.insert("app".to_string(), Value::from(app));
        attributes.insert("pattern".to_string(), Value::from(pattern));
        primary.push(FactSet {
            entity_type: EntityType::Habit,
            key: format!("{app}/{pattern}"),
            attributes,
            confidence: obs.action().confidence(),
            observed_at: entry.last_seen_at,
            observation_id: obs.id(),
        });
    }

    if primary.is_empty() {
        return None;
    }

    let mut context = Vec::new();
    let mut edges = Vec::new();
    if !app.is_empty() && app != UNKNOWN_APP {
        let mut attributes = BTreeMap::new();
        attributes.insert("app_id".to_string(), Value::from(app));
        let app_facts = FactSet {
            entity_type: EntityType::App,
            key: app.to_string(),
            attributes,
            confidence: 1.0,
            observed_at: entry.last_seen_at,
            observation_id: obs.id(),
        };
        let app_node = app_facts.node_id();
        for facts in &primary {
            let Some(relation) = relation_to_app(facts.entity_type) else {
                continue;
            };
            edges.push(LongTermEdge {
                relation_type: relation.to_string(),
                source_node_id: facts.node_id(),
                target_node_id: app_node.clone(),
                weight: facts.confidence,
                provenance: entry.occurrences.clone(),
            });
        }
        if primary.iter().all(|f| f.node_id() != app_node) {
            context.push(app_facts);
        }
    }

    Some(Promotion {
        fingerprint: entry.fingerprint,
        generation: entry.generation,
        primary,
        context,
        edges,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// ConsolidationEngine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ConsolidationEngine {
    short_term: Arc<ShortTermStore>,
    store: Arc<dyn LongTermStore>,
    overflow: Arc<OverflowLog>,
    resolver: ConflictResolver,
    config: ConsolidationConfig,
    counters: Counters,
}

impl ConsolidationEngine {
    pub fn new(
        short_term: Arc<ShortTermStore>,
        store: Arc<dyn LongTermStore>,
        overflow: Arc<OverflowLog>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            short_term,
            store,
            overflow,
            resolver: ConflictResolver::new(),
            config,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ConsolidationStats {
        let c = &self.counters;
        ConsolidationStats {
            passes: c.passes.load(Ordering::Relaxed),
            promoted: c.promoted.load(Ordering::Relaxed),
            skipped_unchanged: c.skipped_unchanged.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            replayed: c.replayed.load(Ordering::Relaxed),
        }
    }

    /// One consolidation pass over the current short-term snapshot.
    pub async fn run_once(&self) -> PassReport {
        let threshold = self.short_term.config().recurrence_threshold;
        let mut pass = PassReport::default();

        for entry in self.short_term.snapshot() {
            pass.examined += 1;
            if !entry.qualifies(threshold) {
                continue;
            }
            pass.qualified += 1;
            let Some(promotion) = derive_promotion(&entry, threshold) else {
                continue;
            };
            let digest = promotion.digest();
            if entry.consumed_digest == Some(digest) {
                pass.skipped_unchanged += 1;
                continue;
            }

            match self.persist_with_retry(&promotion).await {
                Ok(reports) => {
                    info!(
                        fingerprint = %entry.fingerprint,
                        facts = reports.len(),
                        recurrence = entry.recurrence_count,
                        "promoted short-term entry"
                    );
                    pass.promoted += 1;
                    pass.reports.extend(reports);
                }
                Err((attempts, err)) => match self.overflow.push(&promotion, attempts, &err.to_string()) {
                    Ok(id) => {
                        warn!(
                            fingerprint = %entry.fingerprint,
                            overflow_id = %id,
                            attempts,
                            error = %err,
                            "promotion dead-lettered"
                        );
                        pass.dead_lettered += 1;
                    }
                    Err(log_err) => {
                        // Leave the entry unconsumed so the next pass retries it.
                        error!(error = %log_err, "overflow log write failed");
                        continue;
                    }
                },
            }
            self.short_term
                .mark_consumed(entry.fingerprint, entry.generation, digest);
        }

        let c = &self.counters;
        c.passes.fetch_add(1, Ordering::Relaxed);
        c.promoted.fetch_add(pass.promoted as u64, Ordering::Relaxed);
        c.skipped_unchanged
            .fetch_add(pass.skipped_unchanged as u64, Ordering::Relaxed);
        c.dead_lettered
            .fetch_add(pass.dead_lettered as u64, Ordering::Relaxed);
        debug!(
            examined = pass.examined,
            qualified = pass.qualified,
            promoted = pass.promoted,
            "consolidation pass complete"
        );
        pass
    }

    /// Apply `promotion`, retrying with backoff. On failure returns the
    /// number of attempts made and the last error.
    async fn persist_with_retry(
        &self,
        promotion: &Promotion,
    ) -> Result<Vec<MergeReport>, (u32, PersistenceError)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match promotion.apply(self.store.as_ref(), &self.resolver).await {
                Ok(reports) => return Ok(reports),
                Err(err) if attempt > self.config.max_retries => return Err((attempt, err)),
                Err(err) => {
                    let delay =
                        backoff_delay(self.config.retry_base_delay, self.config.retry_max_delay, attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "persistence failed; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Re-apply every dead-lettered promotion once, oldest first. Successful
    /// ones leave the log.
    pub async fn replay_overflow(&self) -> Result<ReplayReport, OverflowError> {
        let mut report = ReplayReport::default();
        for record in self.overflow.pending()? {
            match record.promotion.apply(self.store.as_ref(), &self.resolver).await {
                Ok(_) => {
                    self.overflow.remove(record.id)?;
                    report.replayed += 1;
                }
                Err(err) => {
                    self.overflow.record_failure(record.id, &err.to_string())?;
                    report.still_pending += 1;
                }
            }
        }
        self.counters
            .replayed
            .fetch_add(report.replayed as u64, Ordering::Relaxed);
        if report.replayed > 0 {
            info!(replayed = report.replayed, pending = report.still_pending, "overflow replayed");
        }
        Ok(report)
    }

    /// Run passes every `interval` until `cancel` fires. The overflow log is
    /// replayed before each pass.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.config.interval.as_millis() as u64, "consolidation engine started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if matches!(self.overflow.is_empty(), Ok(false))
                        && let Err(err) = self.replay_overflow().await
                    {
                        error!(error = %err, "overflow replay failed");
                    }
                    self.run_once().await;
                }
            }
        }
        info!(stats = ?self.stats(), "consolidation engine stopped");
    }

    pub fn overflow_backlog(&self) -> usize {
        self.overflow.len().unwrap_or_else(|err| {
            warn!(error = %err, "overflow backlog unavailable");
            0
        })
    }

    /// Node id the habit for `app` and `pattern` is stored under.
    pub fn habit_node_id(app: &str, pattern: &str) -> NodeId {
        NodeId::new(EntityType::Habit, &format!("{app}/{pattern}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use pbrain_memory::{ShortTermConfig, SqliteGraphStore};
    use pbrain_perception::{ObservationBuilder, ObservationContext};
    use pbrain_types::{InferredAction, LongTermNode, MarkerKind, STRONG_SIGNAL_KEY, StateChangeDiff};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Fails the next `failures` calls, then delegates to SQLite.
    struct FlakyStore {
        inner: SqliteGraphStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: SqliteGraphStore::open_in_memory().unwrap(),
                failures: AtomicU32::new(failures),
            }
        }

        fn check(&self) -> Result<(), PersistenceError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(PersistenceError::Unavailable("database is locked".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LongTermStore for FlakyStore {
        async fn load_node(&self, id: &NodeId) -> Result<Option<LongTermNode>, PersistenceError> {
            self.check()?;
            self.inner.load_node(id).await
        }

        async fn upsert_node(&self, node: &LongTermNode) -> Result<(), PersistenceError> {
            self.check()?;
            self.inner.upsert_node(node).await
        }

        async fn upsert_edge(&self, edge: &LongTermEdge) -> Result<(), PersistenceError> {
            self.check()?;
            self.inner.upsert_edge(edge).await
        }
    }

    struct Fixture {
        builder: ObservationBuilder,
        short_term: Arc<ShortTermStore>,
        overflow: Arc<OverflowLog>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                builder: ObservationBuilder::new(),
                short_term: Arc::new(ShortTermStore::new(ShortTermConfig::default())),
                overflow: Arc::new(OverflowLog::open_in_memory().unwrap()),
            }
        }

        fn engine(&self, store: Arc<dyn LongTermStore>, max_retries: u32) -> ConsolidationEngine {
            ConsolidationEngine::new(
                Arc::clone(&self.short_term),
                store,
                Arc::clone(&self.overflow),
                ConsolidationConfig {
                    interval: Duration::from_millis(10),
                    max_retries,
                    retry_base_delay: Duration::from_millis(1),
                    retry_max_delay: Duration::from_millis(2),
                },
            )
        }

        fn switch_to(&self, app: &str, at: DateTime<Utc>) -> Observation {
            let action = InferredAction::new(
                ActionKind::AppSwitch {
                    from_app: "launcher".into(),
                    to_app: app.into(),
                },
                1.0,
            );
            self.builder
                .build(action, &StateChangeDiff::empty(app), &ObservationContext::new(app, at))
                .unwrap()
        }

        fn mention(&self, app: &str, person: &str, relationship: &str, confidence: f64, at: DateTime<Utc>) -> Observation {
            let ctx = ObservationContext::new(app, at)
                .with(STRONG_SIGNAL_KEY, true)
                .with("entity", "person")
                .with("entity_key", person)
                .with("attributes", json!({ "relationship": relationship }))
                .with("confidence", confidence);
            self.builder
                .build(InferredAction::unknown(), &StateChangeDiff::empty(app), &ctx)
                .unwrap()
        }
    }

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, min, 0).unwrap()
    }

    #[tokio::test]
    async fn recurring_app_switch_becomes_habit() {
        let f = Fixture::new();
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let engine = f.engine(graph.clone(), 0);

        for min in 0..3 {
            f.short_term.record(f.switch_to("messaging", at(min)));
        }
        let pass = engine.run_once().await;
        assert_eq!(pass.qualified, 1);
        assert_eq!(pass.promoted, 1);

        let habit = graph
            .get_node(&ConsolidationEngine::habit_node_id("messaging", "frequent_switch"))
            .unwrap()
            .expect("habit node");
        assert_eq!(habit.current("app"), Some(&json!("messaging")));
        assert_eq!(habit.current("pattern"), Some(&json!("frequent_switch")));

        let app_node = NodeId::new(EntityType::App, "messaging");
        assert!(graph.get_node(&app_node).unwrap().is_some());
        let edges = graph.edges_from(&habit.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation_type, "habit_in");
        assert_eq!(edges[0].target_node_id, app_node);
        assert_eq!(edges[0].provenance.len(), 3);
    }

    #[tokio::test]
    async fn two_occurrences_do_not_qualify() {
        let f = Fixture::new();
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let engine = f.engine(graph.clone(), 0);
        f.short_term.record(f.switch_to("messaging", at(0)));
        f.short_term.record(f.switch_to("messaging", at(1)));
        assert_eq!(engine.run_once().await.qualified, 0);
        assert_eq!(graph.node_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn unchanged_entry_is_promoted_once() {
        let f = Fixture::new();
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let engine = f.engine(graph.clone(), 0);
        for min in 0..3 {
            f.short_term.record(f.switch_to("messaging", at(min)));
        }
        assert_eq!(engine.run_once().await.promoted, 1);
        let before = graph.nodes(None).unwrap();

        f.short_term.record(f.switch_to("messaging", at(4)));
        let second = engine.run_once().await;
        assert_eq!(second.promoted, 0);
        assert_eq!(second.skipped_unchanged, 1);
        assert_eq!(graph.nodes(None).unwrap(), before);
        assert_eq!(engine.stats().promoted, 1);
    }

    #[tokio::test]
    async fn markers_never_promote_by_recurrence() {
        let f = Fixture::new();
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let engine = f.engine(graph.clone(), 0);
        for min in 0..5 {
            let marker = f
                .builder
                .marker(MarkerKind::ObservationDropped, "messaging", at(min), BTreeMap::new());
            f.short_term.record(marker);
        }
        let pass = engine.run_once().await;
        assert_eq!(pass.examined, 1);
        assert_eq!(pass.qualified, 0);
        assert_eq!(graph.node_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn strong_signal_promotes_immediately_and_resolves_conflict() {
        let f = Fixture::new();
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let engine = f.engine(graph.clone(), 0);

        f.short_term.record(f.mention("messaging", "Kevin", "friend", 0.6, at(0)));
        assert_eq!(engine.run_once().await.promoted, 1);
        let kevin = NodeId::new(EntityType::Person, "kevin");
        let node = graph.get_node(&kevin).unwrap().unwrap();
        assert_eq!(node.current("relationship"), Some(&json!("friend")));
        assert_eq!(graph.edges_from(&kevin).unwrap()[0].relation_type, "contacted_via");

        f.short_term.record(f.mention("messaging", "Kevin", "coworker", 0.9, at(1)));
        let pass = engine.run_once().await;
        assert_eq!(pass.promoted, 1);
        assert!(pass.reports.iter().any(|r| r.replaced.contains(&"relationship".to_string())));

        let node = graph.get_node(&kevin).unwrap().unwrap();
        assert_eq!(node.current("relationship"), Some(&json!("coworker")));
        let history = &node.attributes["relationship"].history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, json!("friend"));
    }

    #[tokio::test]
    async fn strong_signal_outlives_ambiguous_follow_up() {
        let f = Fixture::new();
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let engine = f.engine(graph.clone(), 0);

        f.short_term.record(f.mention("messaging", "Kevin", "friend", 0.9, at(0)));
        let plain = f
            .builder
            .build(
                InferredAction::unknown(),
                &StateChangeDiff::empty("messaging"),
                &ObservationContext::new("messaging", at(0) + chrono::Duration::seconds(1)),
            )
            .unwrap();
        f.short_term.record(plain);

        let pass = engine.run_once().await;
        assert_eq!(pass.examined, 1);
        assert_eq!(pass.qualified, 1);
        assert_eq!(pass.promoted, 1);
        let kevin = graph.get_node(&NodeId::new(EntityType::Person, "kevin")).unwrap().unwrap();
        assert_eq!(kevin.current("relationship"), Some(&json!("friend")));
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let f = Fixture::new();
        let store = Arc::new(FlakyStore::new(1));
        let engine = f.engine(store.clone(), 2);
        for min in 0..3 {
            f.short_term.record(f.switch_to("messaging", at(min)));
        }
        let pass = engine.run_once().await;
        assert_eq!(pass.promoted, 1);
        assert_eq!(pass.dead_lettered, 0);
        assert!(f.overflow.is_empty().unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_then_replay() {
        let f = Fixture::new();
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let engine = f.engine(store.clone(), 2);
        for min in 0..3 {
            f.short_term.record(f.switch_to("messaging", at(min)));
        }

        let pass = engine.run_once().await;
        assert_eq!(pass.dead_lettered, 1);
        assert_eq!(pass.promoted, 0);
        let pending = f.overflow.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 3);
        assert_eq!(f.short_term.consumed_count(), 1);
        // Consumed entries are not retried by later passes.
        assert_eq!(engine.run_once().await.skipped_unchanged, 1);

        store.failures.store(0, Ordering::SeqCst);
        let replay = engine.replay_overflow().await.unwrap();
        assert_eq!(replay, ReplayReport { replayed: 1, still_pending: 0 });
        assert!(f.overflow.is_empty().unwrap());
        let habit = ConsolidationEngine::habit_node_id("messaging", "frequent_switch");
        assert!(store.inner.get_node(&habit).unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_replay_stays_pending() {
        let f = Fixture::new();
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let engine = f.engine(store.clone(), 0);
        for min in 0..3 {
            f.short_term.record(f.switch_to("messaging", at(min)));
        }
        engine.run_once().await;
        let replay = engine.replay_overflow().await.unwrap();
        assert_eq!(replay.still_pending, 1);
        assert_eq!(f.overflow.pending().unwrap()[0].attempts, 2);
    }

    #[test]
    fn unknown_app_gets_no_app_node() {
        let f = Fixture::new();
        for min in 0..3 {
            f.short_term.record(f.switch_to(UNKNOWN_APP, at(min)));
        }
        let entry = f.short_term.snapshot().remove(0);
        let promotion = derive_promotion(&entry, 3).unwrap();
        assert_eq!(promotion.primary.len(), 1);
        assert!(promotion.context.is_empty());
        assert!(promotion.edges.is_empty());
    }

    #[test]
    fn strong_signal_without_entity_derives_nothing() {
        let f = Fixture::new();
        let ctx = ObservationContext::new("messaging", at(0)).with(STRONG_SIGNAL_KEY, true);
        let obs = f
            .builder
            .build(InferredAction::unknown(), &StateChangeDiff::empty("messaging"), &ctx)
            .unwrap();
        f.short_term.record(obs);
        let entry = f.short_term.snapshot().remove(0);
        assert!(entry.observation.is_strong_signal());
        assert!(derive_promotion(&entry, 3).is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let f = Fixture::new();
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let engine = Arc::new(f.engine(graph, 0));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&engine).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(engine.stats().passes >= 1);
    }
}
