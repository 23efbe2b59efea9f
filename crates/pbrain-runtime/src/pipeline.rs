//! Pipeline wiring: one driver task, one recorder task, one consolidation
//! task.
//!
//! ```text
//!  DeviceSource ──► PollingDriver ──mpsc(queue_depth)──► recorder ──► ShortTermStore
//!                        ▲                                                │
//!                 CommandSender                          ConsolidationEngine (own interval)
//!                                                                         │
//!                                                              LongTermStore / OverflowLog
//! ```
//!
//! The recorder is the only writer of the [`ShortTermStore`]. Stopping is
//! cooperative: [`PipelineHandle::shutdown`] cancels the shared token, lets
//! the in-flight tick finish, drains the queue into the store and runs one
//! last consolidation pass.

use std::sync::Arc;
use std::time::Duration;

use pbrain_memory::{LongTermStore, OverflowLog, ShortTermConfig, ShortTermStore};
use pbrain_perception::ObservationBuilder;
use pbrain_types::Observation;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::consolidation::{ConsolidationConfig, ConsolidationEngine, PassReport};
use crate::driver::{
    CommandSender, DeviceSource, DriverConfig, DriverCounters, DriverStatus, PollingDriver,
    command_channel,
};
use crate::history::{MonitoringOverview, RecentHistory};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub poll_interval: Duration,
    pub ttl: Duration,
    pub capacity: usize,
    pub recurrence_threshold: u32,
    pub queue_depth: usize,
    pub max_retries: u32,
    pub enqueue_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub consolidation_interval: Duration,
    pub command_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let driver = DriverConfig::default();
        let short_term = ShortTermConfig::default();
        Self {
            poll_interval: driver.poll_interval,
            ttl: Duration::from_secs(30 * 60),
            capacity: short_term.capacity,
            recurrence_threshold: short_term.recurrence_threshold,
            queue_depth: 256,
            max_retries: driver.max_retries,
            enqueue_timeout: driver.enqueue_timeout,
            retry_base_delay: driver.retry_base_delay,
            retry_max_delay: driver.retry_max_delay,
            consolidation_interval: ConsolidationConfig::default().interval,
            command_buffer: 32,
        }
    }
}

impl PipelineConfig {
    pub fn driver(&self) -> DriverConfig {
        DriverConfig {
            poll_interval: self.poll_interval,
            enqueue_timeout: self.enqueue_timeout,
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            retry_max_delay: self.retry_max_delay,
        }
    }

    pub fn short_term(&self) -> ShortTermConfig {
        ShortTermConfig {
            capacity: self.capacity,
            ttl: chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
            recurrence_threshold: self.recurrence_threshold,
        }
    }

    pub fn consolidation(&self) -> ConsolidationConfig {
        ConsolidationConfig {
            interval: self.consolidation_interval,
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            retry_max_delay: self.retry_max_delay,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Shared pipeline state for one device. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    builder: Arc<ObservationBuilder>,
    short_term: Arc<ShortTermStore>,
    history: Arc<RecentHistory>,
    consolidation: Arc<ConsolidationEngine>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, long_term: Arc<dyn LongTermStore>, overflow: Arc<OverflowLog>) -> Self {
        let short_term = Arc::new(ShortTermStore::new(config.short_term()));
        let consolidation = Arc::new(ConsolidationEngine::new(
            Arc::clone(&short_term),
            long_term,
            overflow,
            config.consolidation(),
        ));
        Self {
            config,
            builder: Arc::new(ObservationBuilder::new()),
            short_term,
            history: Arc::new(RecentHistory::new()),
            consolidation,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn short_term(&self) -> &Arc<ShortTermStore> {
        &self.short_term
    }

    pub fn history(&self) -> &Arc<RecentHistory> {
        &self.history
    }

    pub fn consolidation(&self) -> &Arc<ConsolidationEngine> {
        &self.consolidation
    }

    /// Start the driver, recorder and consolidation tasks on the current
    /// tokio runtime.
    pub fn spawn(&self, source: Box<dyn DeviceSource>) -> PipelineHandle {
        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_depth.max(1));
        let (commands, commands_rx) = command_channel(self.config.command_buffer);
        let (status_tx, status_rx) = watch::channel(DriverStatus::Starting);
        let counters = Arc::new(DriverCounters::default());

        let driver = PollingDriver::new(
            source,
            self.config.driver(),
            Arc::clone(&self.builder),
            Arc::clone(&self.history),
            queue_tx,
            commands_rx,
            status_tx,
            Arc::clone(&counters),
        );
        let driver = tokio::spawn(driver.run(cancel.clone()));
        let recorder = tokio::spawn(record_loop(queue_rx, Arc::clone(&self.short_term)));
        let consolidation = tokio::spawn(Arc::clone(&self.consolidation).run(cancel.clone()));
        info!(
            queue_depth = self.config.queue_depth,
            recurrence_threshold = self.config.recurrence_threshold,
            "pipeline started"
        );

        PipelineHandle {
            pipeline: self.clone(),
            stop_on_drop: cancel.clone().drop_guard(),
            cancel,
            commands,
            status: status_rx,
            counters,
            driver,
            recorder,
            consolidation,
        }
    }

    fn overview(&self, status: DriverStatus, counters: &DriverCounters) -> MonitoringOverview {
        let (diff_history_len, action_history_len) = self.history.len();
        MonitoringOverview {
            driver_status: status,
            driver: counters.snapshot(),
            diff_history_len,
            action_history_len,
            short_term_entries: self.short_term.len(),
            consumed_entries: self.short_term.consumed_count(),
            overflow_backlog: self.consolidation.overflow_backlog(),
            consolidation: self.consolidation.stats(),
        }
    }
}

/// Single writer of the short-term store. Returns once the queue is closed
/// and drained.
async fn record_loop(mut queue: mpsc::Receiver<Observation>, short_term: Arc<ShortTermStore>) -> u64 {
    let mut recorded = 0u64;
    while let Some(observation) = queue.recv().await {
        let outcome = short_term.record(observation);
        recorded += 1;
        debug!(
            fingerprint = %outcome.fingerprint,
            count = outcome.recurrence_count,
            qualifies = outcome.qualifies,
            "recorded observation"
        );
    }
    debug!(recorded, "observation queue closed");
    recorded
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("Pipeline task failed: {0}")]
    Join(#[from] JoinError),
}

/// Summary returned once every pipeline task has finished.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    pub recorded: u64,
    pub final_pass: PassReport,
    pub overview: MonitoringOverview,
}

/// Dropping the handle stops every pipeline task.
pub struct PipelineHandle {
    pipeline: Pipeline,
    cancel: CancellationToken,
    stop_on_drop: DropGuard,
    commands: CommandSender,
    status: watch::Receiver<DriverStatus>,
    counters: Arc<DriverCounters>,
    driver: JoinHandle<()>,
    recorder: JoinHandle<u64>,
    consolidation: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    pub fn status(&self) -> watch::Receiver<DriverStatus> {
        self.status.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn overview(&self) -> MonitoringOverview {
        self.pipeline
            .overview(self.status.borrow().clone(), &self.counters)
    }

    /// Signal every task to stop, then wait for them.
    pub async fn shutdown(self) -> Result<ShutdownReport, ShutdownError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the driver to stop on its own (source closed or the token
    /// cancelled), then drain and consolidate.
    ///
    /// A failed task still stops the others; every task has finished by the
    /// time this returns.
    pub async fn join(self) -> Result<ShutdownReport, ShutdownError> {
        let driver = self.driver.await;
        let recorder = self.recorder.await;
        self.cancel.cancel();
        let consolidation = self.consolidation.await;
        drop(self.stop_on_drop);

        if let Err(err) = &driver {
            error!(error = %err, "driver task failed");
        }
        driver?;
        let recorded = recorder?;
        consolidation?;

        let engine = self.pipeline.consolidation();
        if let Err(err) = engine.replay_overflow().await {
            warn!(error = %err, "final overflow replay failed");
        }
        let final_pass = engine.run_once().await;
        let overview = self
            .pipeline
            .overview(self.status.borrow().clone(), &self.counters);
        info!(recorded, promoted = final_pass.promoted, "pipeline stopped");
        Ok(ShutdownReport {
            recorded,
            final_pass,
            overview,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ReplayEvent, ReplaySource};
    use chrono::{TimeZone, Utc};
    use pbrain_memory::SqliteGraphStore;
    use pbrain_types::{ActionKind, CommandedAction, EntityType, NodeId, RawElement, RawSnapshot};
    use serde_json::json;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_millis(1),
            enqueue_timeout: Duration::from_millis(50),
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(2),
            consolidation_interval: Duration::from_millis(5),
            ..PipelineConfig::default()
        }
    }

    fn screen(app: &str, sec: u32) -> ReplayEvent {
        ReplayEvent::Snapshot(RawSnapshot {
            app_id: Some(app.to_string()),
            activity: None,
            root: Some(RawElement {
                role: "FrameLayout".into(),
                ..Default::default()
            }),
            captured_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, sec).unwrap(),
        })
    }

    fn pipeline() -> (Pipeline, Arc<SqliteGraphStore>) {
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let overflow = Arc::new(OverflowLog::open_in_memory().unwrap());
        let store: Arc<dyn LongTermStore> = graph.clone();
        (Pipeline::new(fast_config(), store, overflow), graph)
    }

    #[test]
    fn config_splits_into_component_configs() {
        let config = PipelineConfig {
            ttl: Duration::from_secs(90),
            max_retries: 7,
            ..PipelineConfig::default()
        };
        assert_eq!(config.short_term().ttl, chrono::Duration::seconds(90));
        assert_eq!(config.driver().max_retries, 7);
        assert_eq!(config.consolidation().max_retries, 7);
    }

    #[tokio::test]
    async fn replayed_session_consolidates_app_switch_habit() {
        let (pipeline, graph) = pipeline();
        let events = (0..6).map(|i| screen(if i % 2 == 0 { "launcher" } else { "messaging" }, i));
        let handle = pipeline.spawn(Box::new(ReplaySource::new(events)));
        let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();

        // Five switches: three into messaging, two back to the launcher.
        assert_eq!(report.recorded, 5);
        assert_eq!(report.overview.driver_status, DriverStatus::Stopped);
        assert_eq!(report.overview.short_term_entries, 2);

        let habit = graph
            .get_node(&NodeId::new(EntityType::Habit, "messaging/frequent_switch"))
            .unwrap()
            .expect("habit promoted");
        assert_eq!(habit.current("app"), Some(&json!("messaging")));
        assert!(
            graph
                .get_node(&NodeId::new(EntityType::Habit, "launcher/frequent_switch"))
                .unwrap()
                .is_none()
        );
        assert_eq!(pipeline.history().recent_actions(10).len(), 5);
    }

    #[tokio::test]
    async fn outage_marker_keeps_replayed_entries_alive() {
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let overflow = Arc::new(OverflowLog::open_in_memory().unwrap());
        let store: Arc<dyn LongTermStore> = graph.clone();
        let config = PipelineConfig {
            max_retries: 3,
            consolidation_interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let pipeline = Pipeline::new(config, store, overflow);

        let mut events: Vec<ReplayEvent> = (0..6)
            .map(|i| screen(if i % 2 == 0 { "launcher" } else { "messaging" }, i))
            .collect();
        events.extend((0..4).map(|_| ReplayEvent::Unreachable {
            unreachable: "adb: device offline".into(),
        }));
        let handle = pipeline.spawn(Box::new(ReplaySource::new(events)));
        let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.recorded, 6);
        assert_eq!(report.overview.driver.markers, 1);
        // Both switch entries survive next to the outage marker.
        assert_eq!(report.overview.short_term_entries, 3);
        assert!(
            graph
                .get_node(&NodeId::new(EntityType::Habit, "messaging/frequent_switch"))
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn shutdown_records_pending_commands() {
        let (pipeline, _graph) = pipeline();
        let events: Vec<ReplayEvent> = (0..10_000).map(|_| screen("launcher", 0)).collect();
        let handle = pipeline.spawn(Box::new(ReplaySource::new(events)));
        handle
            .commands()
            .submit(CommandedAction {
                command: "Open Slack".into(),
                kind: ActionKind::AppSwitch {
                    from_app: "launcher".into(),
                    to_app: "com.slack".into(),
                },
                success: true,
                steps: 3,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = handle.shutdown().await.unwrap();
        assert_eq!(report.recorded, 1);
        assert_eq!(report.overview.driver.commands, 1);
        assert_eq!(report.overview.driver_status, DriverStatus::Stopped);
        assert_eq!(pipeline.history().commanded_actions(10).len(), 1);
    }

    struct BrokenSource;

    #[async_trait::async_trait]
    impl DeviceSource for BrokenSource {
        async fn pull(&mut self) -> Result<RawSnapshot, crate::driver::DeviceError> {
            panic!("device bridge crashed")
        }
    }

    #[tokio::test]
    async fn failed_driver_still_stops_consolidation() {
        let (pipeline, _graph) = pipeline();
        let handle = pipeline.spawn(Box::new(BrokenSource));
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert!(matches!(result, Err(ShutdownError::Join(_))));

        let passes = pipeline.consolidation().stats().passes;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pipeline.consolidation().stats().passes, passes);
    }

    #[tokio::test]
    async fn dropping_handle_stops_pipeline() {
        let (pipeline, _graph) = pipeline();
        let events: Vec<ReplayEvent> = (0..10_000).map(|_| screen("launcher", 0)).collect();
        let handle = pipeline.spawn(Box::new(ReplaySource::new(events)));
        let cancel = handle.cancel_token();
        drop(handle);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn overview_reflects_running_pipeline() {
        let (pipeline, _graph) = pipeline();
        let events: Vec<ReplayEvent> = (0..10_000).map(|_| screen("launcher", 0)).collect();
        let handle = pipeline.spawn(Box::new(ReplaySource::new(events)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let overview = handle.overview();
        assert_eq!(overview.driver_status, DriverStatus::Running);
        assert!(overview.driver.ticks >= 1);
        assert_eq!(overview.overflow_backlog, 0);
        handle.shutdown().await.unwrap();
    }
}
