//! [`PollingDriver`] – the single task that owns snapshot acquisition.
//!
//! Each tick runs to completion before the stop signal is looked at again:
//!
//! 1. **Commands** – drain commanded actions submitted through
//!    [`CommandSender`] and turn each into an observation.
//! 2. **Pull** – ask the [`DeviceSource`] for a snapshot, retrying
//!    [`DeviceError::Unreachable`] with exponential backoff.
//! 3. **Canonicalize** – malformed snapshots become the sentinel state and a
//!    `malformed_snapshot` marker.
//! 4. **Diff / classify / build** – against the previous state in the
//!    [`StateWindow`]; empty diffs produce nothing.
//! 5. **Enqueue** – onto the bounded observation queue, waiting at most
//!    `enqueue_timeout`. A timed-out observation is counted as dropped and an
//!    `observation_dropped` marker carrying `dropped_count` goes out as soon
//!    as the queue has room.
//!
//! # Status
//!
//! The driver publishes a [`DriverStatus`] on a `watch` channel. After
//! `max_retries` failed retries in one tick it records a `device_unreachable`
//! marker and publishes [`DriverStatus::DeviceUnreachable`]; the next
//! successful pull flips it back to [`DriverStatus::Running`].
//!
//! # Time base
//!
//! Snapshot observations carry the device's `captured_at`. Markers and
//! commanded actions are stamped with the `captured_at` of the latest
//! snapshot so the short-term store sees a single clock; the host clock is
//! used only before the first snapshot arrives.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pbrain_perception::{
    ObservationBuilder, ObservationContext, StateWindow, canonicalize_or_sentinel, classify,
};
use pbrain_types::{
    ActionKind, CommandedAction, MarkerKind, Observation, PipelineError, RawSnapshot,
    StateChangeDiff, UNKNOWN_APP,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::history::{ActionRecord, RecentHistory};

// ─────────────────────────────────────────────────────────────────────────────
// Device source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Transient; the driver retries.
    #[error("Device unreachable: {0}")]
    Unreachable(String),
    /// The source has no more snapshots; the driver stops.
    #[error("Device source closed")]
    Closed,
}

/// Supplies raw UI snapshots, one per pull.
#[async_trait]
pub trait DeviceSource: Send {
    async fn pull(&mut self) -> Result<RawSnapshot, DeviceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Pipeline driver has stopped")]
pub struct DriverStopped;

/// Hands commanded actions to the driver, which records them at its next tick.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<CommandedAction>,
}

impl CommandSender {
    pub async fn submit(&self, action: CommandedAction) -> Result<(), DriverStopped> {
        self.tx.send(action).await.map_err(|_| DriverStopped)
    }

    pub fn try_submit(&self, action: CommandedAction) -> Result<(), DriverStopped> {
        self.tx.try_send(action).map_err(|_| DriverStopped)
    }
}

/// Create a command channel holding up to `capacity` pending actions.
pub fn command_channel(capacity: usize) -> (CommandSender, mpsc::Receiver<CommandedAction>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandSender { tx }, rx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Status / stats
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriverStatus {
    Starting,
    Running,
    DeviceUnreachable { attempts: u32, reason: String },
    Stopped,
}

/// Counters shared between the driver and monitoring readers.
#[derive(Debug, Default)]
pub struct DriverCounters {
    ticks: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    markers: AtomicU64,
    commands: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub ticks: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub markers: u64,
    pub commands: u64,
}

impl DriverCounters {
    pub fn snapshot(&self) -> DriverStats {
        DriverStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            markers: self.markers.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    pub poll_interval: Duration,
    pub enqueue_timeout: Duration,
    /// Retries after the first failed pull, per tick.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            enqueue_timeout: Duration::from_millis(500),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

/// Backoff before retry number `retry` (1-based): `base` doubling, capped at
/// `max`.
pub fn backoff_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

// ─────────────────────────────────────────────────────────────────────────────
// PollingDriver
// ─────────────────────────────────────────────────────────────────────────────

enum Pulled {
    Snapshot(RawSnapshot),
    Unreachable { attempts: u32, reason: String },
    Closed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    /// Source closed, queue closed, or cancelled mid-backoff.
    Stop,
}

pub struct PollingDriver {
    source: Box<dyn DeviceSource>,
    config: DriverConfig,
    window: StateWindow,
    builder: Arc<ObservationBuilder>,
    history: Arc<RecentHistory>,
    queue: mpsc::Sender<Observation>,
    commands: mpsc::Receiver<CommandedAction>,
    status: watch::Sender<DriverStatus>,
    counters: Arc<DriverCounters>,
    pending_dropped: u64,
    unreachable: bool,
    /// `captured_at` of the latest snapshot; survives window resets.
    device_clock: Option<DateTime<Utc>>,
}

impl PollingDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn DeviceSource>,
        config: DriverConfig,
        builder: Arc<ObservationBuilder>,
        history: Arc<RecentHistory>,
        queue: mpsc::Sender<Observation>,
        commands: mpsc::Receiver<CommandedAction>,
        status: watch::Sender<DriverStatus>,
        counters: Arc<DriverCounters>,
    ) -> Self {
        Self {
            source,
            config,
            window: StateWindow::new(),
            builder,
            history,
            queue,
            commands,
            status,
            counters,
            pending_dropped: 0,
            unreachable: false,
            device_clock: None,
        }
    }

    /// Poll until `cancel` fires or the source closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.status.send_replace(DriverStatus::Running);
        info!(poll_ms = self.config.poll_interval.as_millis() as u64, "polling driver started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("polling driver received stop signal");
                    break;
                }
                _ = ticker.tick() => {
                    if self.tick(&cancel).await == TickOutcome::Stop {
                        break;
                    }
                }
            }
        }

        // Commands submitted during the last tick still count.
        self.drain_commands().await;
        self.flush_drop_marker();
        self.status.send_replace(DriverStatus::Stopped);
        info!(stats = ?self.counters.snapshot(), "polling driver stopped");
    }

    pub(crate) async fn tick(&mut self, cancel: &CancellationToken) -> TickOutcome {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        self.flush_drop_marker();
        if !self.drain_commands().await {
            return TickOutcome::Stop;
        }

        let snapshot = match self.pull_with_retry(cancel).await {
            Pulled::Snapshot(s) => s,
            Pulled::Unreachable { attempts, reason } => {
                return self.mark_unreachable(attempts, reason).await;
            }
            Pulled::Closed => {
                info!("device source closed");
                return TickOutcome::Stop;
            }
            Pulled::Cancelled => return TickOutcome::Stop,
        };

        if self.unreachable {
            self.unreachable = false;
            self.status.send_replace(DriverStatus::Running);
            info!("device reachable again");
        }

        let (state, malformed) = canonicalize_or_sentinel(&snapshot);
        let captured_at = state.captured_at;
        self.device_clock = Some(captured_at);
        let diff = self.window.advance(state);

        if let Some(err) = malformed {
            let app = snapshot.app_id.as_deref().unwrap_or(UNKNOWN_APP);
            let mut extra = BTreeMap::new();
            extra.insert("error".to_string(), Value::from(err.to_string()));
            let marker = self.builder.marker(MarkerKind::MalformedSnapshot, app, captured_at, extra);
            self.counters.markers.fetch_add(1, Ordering::Relaxed);
            return self.enqueue(marker).await;
        }

        let Some(diff) = diff else {
            debug!("first canonical state captured");
            return TickOutcome::Continue;
        };
        if diff.is_empty() && !diff.degraded {
            return TickOutcome::Continue;
        }

        let action = classify(&diff);
        debug!(
            action = action.kind.label(),
            confidence = action.confidence(),
            change_kind = diff.change_kind.as_str(),
            "classified diff"
        );
        let mut ctx = ObservationContext::new(diff.to_app.clone(), captured_at)
            .with("change_kind", diff.change_kind.as_str());
        if diff.degraded {
            ctx = ctx.with("degraded", true);
        }
        self.history.push_diff(captured_at, diff.clone());
        match self.builder.build(action, &diff, &ctx) {
            Ok(obs) => self.enqueue(obs).await,
            Err(err) => {
                warn!(error = %err, "observation not built");
                TickOutcome::Continue
            }
        }
    }

    fn device_now(&self) -> DateTime<Utc> {
        self.device_clock.unwrap_or_else(Utc::now)
    }

    async fn pull_with_retry(&mut self, cancel: &CancellationToken) -> Pulled {
        let mut retries = 0u32;
        loop {
            match self.source.pull().await {
                Ok(snapshot) => return Pulled::Snapshot(snapshot),
                Err(DeviceError::Closed) => return Pulled::Closed,
                Err(DeviceError::Unreachable(reason)) => {
                    if retries >= self.config.max_retries {
                        return Pulled::Unreachable {
                            attempts: retries + 1,
                            reason,
                        };
                    }
                    retries += 1;
                    let delay = backoff_delay(self.config.retry_base_delay, self.config.retry_max_delay, retries);
                    warn!(retry = retries, delay_ms = delay.as_millis() as u64, %reason, "device unreachable; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Pulled::Cancelled,
                    }
                }
            }
        }
    }

    async fn mark_unreachable(&mut self, attempts: u32, reason: String) -> TickOutcome {
        let err = PipelineError::DeviceUnreachable {
            attempts,
            reason: reason.clone(),
        };
        warn!(error = %err, "giving up on this tick");
        self.status.send_replace(DriverStatus::DeviceUnreachable {
            attempts,
            reason: reason.clone(),
        });
        // A gap in observation makes the previous state stale.
        self.window.reset();
        if self.unreachable {
            return TickOutcome::Continue;
        }
        self.unreachable = true;

        let mut extra = BTreeMap::new();
        extra.insert("attempts".to_string(), Value::from(attempts));
        extra.insert("reason".to_string(), Value::from(reason));
        extra.insert("error".to_string(), Value::from(err.to_string()));
        let marker = self
            .builder
            .marker(MarkerKind::DeviceUnreachable, UNKNOWN_APP, self.device_now(), extra);
        self.counters.markers.fetch_add(1, Ordering::Relaxed);
        self.enqueue(marker).await
    }

    /// Record every pending commanded action. Returns `false` if the queue
    /// has closed.
    async fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.commands.try_recv() {
            let app = match &cmd.kind {
                ActionKind::AppSwitch { to_app, .. } => to_app.clone(),
                _ => self
                    .window
                    .latest()
                    .filter(|s| !s.is_sentinel())
                    .map(|s| s.app_id.clone())
                    .unwrap_or_else(|| UNKNOWN_APP.to_string()),
            };
            let ctx = ObservationContext::new(app.clone(), self.device_now())
                .with("command", cmd.command.clone())
                .with("success", cmd.success)
                .with("steps", cmd.steps);
            let obs = match self.builder.build(cmd, &StateChangeDiff::empty(&app), &ctx) {
                Ok(obs) => obs,
                Err(err) => {
                    warn!(error = %err, "commanded observation not built");
                    continue;
                }
            };
            self.counters.commands.fetch_add(1, Ordering::Relaxed);
            if self.enqueue(obs).await == TickOutcome::Stop {
                return false;
            }
        }
        true
    }

    async fn enqueue(&mut self, obs: Observation) -> TickOutcome {
        self.flush_drop_marker();
        self.history.push_action(ActionRecord {
            observation_id: obs.id(),
            observed_at: obs.timestamp(),
            app_id: obs.app_context().to_string(),
            action: obs.action().clone(),
        });
        match self.queue.send_timeout(obs, self.config.enqueue_timeout).await {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Continue
            }
            Err(SendTimeoutError::Timeout(dropped)) => {
                self.pending_dropped += 1;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                let err = PipelineError::QueueSaturated {
                    dropped: self.pending_dropped,
                };
                warn!(observation = %dropped.id(), error = %err, "observation dropped");
                TickOutcome::Continue
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!("observation queue closed; stopping driver");
                TickOutcome::Stop
            }
        }
    }

    /// Send the `observation_dropped` marker if drops are pending and the
    /// queue has room right now.
    fn flush_drop_marker(&mut self) {
        if self.pending_dropped == 0 {
            return;
        }
        let Ok(permit) = self.queue.try_reserve() else {
            return;
        };
        let mut extra = BTreeMap::new();
        extra.insert("dropped_count".to_string(), Value::from(self.pending_dropped));
        let app = self
            .window
            .latest()
            .map(|s| s.app_id.clone())
            .unwrap_or_else(|| UNKNOWN_APP.to_string());
        let marker = self
            .builder
            .marker(MarkerKind::ObservationDropped, &app, self.device_now(), extra);
        permit.send(marker);
        self.counters.markers.fetch_add(1, Ordering::Relaxed);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        info!(dropped = self.pending_dropped, "recorded observation_dropped marker");
        self.pending_dropped = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ReplayEvent, ReplaySource};
    use chrono::TimeZone;
    use pbrain_types::RawElement;

    struct Harness {
        driver: PollingDriver,
        queue_rx: mpsc::Receiver<Observation>,
        status_rx: watch::Receiver<DriverStatus>,
        commands: CommandSender,
        counters: Arc<DriverCounters>,
        history: Arc<RecentHistory>,
    }

    fn config(max_retries: u32) -> DriverConfig {
        DriverConfig {
            poll_interval: Duration::from_millis(5),
            enqueue_timeout: Duration::from_millis(20),
            max_retries,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
        }
    }

    fn harness(events: Vec<ReplayEvent>, max_retries: u32, queue_depth: usize) -> Harness {
        let (queue_tx, queue_rx) = mpsc::channel(queue_depth);
        let (commands, commands_rx) = command_channel(8);
        let (status_tx, status_rx) = watch::channel(DriverStatus::Starting);
        let counters = Arc::new(DriverCounters::default());
        let history = Arc::new(RecentHistory::new());
        let driver = PollingDriver::new(
            Box::new(ReplaySource::new(events)),
            config(max_retries),
            Arc::new(ObservationBuilder::new()),
            Arc::clone(&history),
            queue_tx,
            commands_rx,
            status_tx,
            Arc::clone(&counters),
        );
        Harness {
            driver,
            queue_rx,
            status_rx,
            commands,
            counters,
            history,
        }
    }

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, sec).unwrap()
    }

    fn snapshot(app: &str, field_text: &str, sec: u32) -> ReplayEvent {
        ReplayEvent::Snapshot(RawSnapshot {
            app_id: Some(app.to_string()),
            activity: None,
            root: Some(RawElement {
                role: "FrameLayout".into(),
                children: vec![RawElement {
                    role: "EditText".into(),
                    text: Some(field_text.to_string()),
                    editable: true,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            captured_at: at(sec),
        })
    }

    fn unreachable() -> ReplayEvent {
        ReplayEvent::Unreachable {
            unreachable: "adb: device offline".into(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let (base, max) = (Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(350));
        assert_eq!(backoff_delay(base, max, 40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn three_failures_with_two_retries_marks_device_unreachable() {
        let mut h = harness(vec![unreachable(), unreachable(), unreachable()], 2, 8);
        let cancel = CancellationToken::new();
        assert_eq!(h.driver.tick(&cancel).await, TickOutcome::Continue);

        assert_eq!(
            *h.status_rx.borrow(),
            DriverStatus::DeviceUnreachable {
                attempts: 3,
                reason: "adb: device offline".into()
            }
        );
        let marker = h.queue_rx.try_recv().unwrap();
        assert_eq!(marker.marker(), Some(MarkerKind::DeviceUnreachable));
        assert_eq!(marker.metadata()["attempts"], Value::from(3));
        assert_eq!(marker.action().confidence(), 0.0);
        // All three recorded failures were consumed by this tick.
        assert_eq!(h.driver.tick(&cancel).await, TickOutcome::Stop);
    }

    #[tokio::test]
    async fn markers_and_commands_use_device_clock() {
        let mut h = harness(vec![snapshot("a", "x", 7), unreachable()], 0, 8);
        let cancel = CancellationToken::new();
        h.driver.tick(&cancel).await;
        h.commands
            .submit(CommandedAction {
                command: "Send message".into(),
                kind: ActionKind::Tap { element_id: "send".into() },
                success: true,
                steps: 1,
            })
            .await
            .unwrap();
        h.driver.tick(&cancel).await;

        let command = h.queue_rx.try_recv().unwrap();
        assert!(command.action().is_commanded());
        assert_eq!(command.timestamp(), at(7));
        let marker = h.queue_rx.try_recv().unwrap();
        assert_eq!(marker.marker(), Some(MarkerKind::DeviceUnreachable));
        assert_eq!(marker.timestamp(), at(7));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let mut h = harness(vec![unreachable(), snapshot("a", "", 0)], 2, 8);
        let cancel = CancellationToken::new();
        assert_eq!(h.driver.tick(&cancel).await, TickOutcome::Continue);
        assert_eq!(*h.status_rx.borrow(), DriverStatus::Starting);
        assert!(h.queue_rx.try_recv().is_err(), "first state yields no observation");
    }

    #[tokio::test]
    async fn typing_produces_type_text_observation() {
        let mut h = harness(vec![snapshot("a", "He", 0), snapshot("a", "Hello", 1)], 0, 8);
        let cancel = CancellationToken::new();
        h.driver.tick(&cancel).await;
        h.driver.tick(&cancel).await;
        let obs = h.queue_rx.try_recv().unwrap();
        match obs.action().kind() {
            ActionKind::TypeText { text, .. } => assert_eq!(text, "Hello"),
            other => panic!("expected TypeText, got {other:?}"),
        }
        assert_eq!(obs.timestamp(), at(1));
        assert_eq!(obs.metadata()["change_kind"], Value::from("text_input"));
        assert_eq!(h.history.recent_diffs(10, None).len(), 1);
    }

    #[tokio::test]
    async fn unchanged_state_is_silent() {
        let mut h = harness(vec![snapshot("a", "x", 0), snapshot("a", "x", 1)], 0, 8);
        let cancel = CancellationToken::new();
        h.driver.tick(&cancel).await;
        h.driver.tick(&cancel).await;
        assert!(h.queue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_snapshot_becomes_marker_then_degraded_diff() {
        let malformed = ReplayEvent::Snapshot(RawSnapshot {
            app_id: None,
            activity: None,
            root: None,
            captured_at: at(1),
        });
        let mut h = harness(vec![snapshot("a", "x", 0), malformed, snapshot("a", "x", 2)], 0, 8);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            h.driver.tick(&cancel).await;
        }
        let marker = h.queue_rx.try_recv().unwrap();
        assert_eq!(marker.marker(), Some(MarkerKind::MalformedSnapshot));
        let degraded = h.queue_rx.try_recv().unwrap();
        assert!(degraded.diff().degraded);
        assert_eq!(degraded.metadata()["degraded"], Value::from(true));
        assert_eq!(degraded.action().kind(), &ActionKind::Unknown);
    }

    #[tokio::test]
    async fn full_queue_drops_then_emits_marker() {
        let events = vec![
            snapshot("a", "H", 0),
            snapshot("a", "He", 1),
            snapshot("a", "Hel", 2),
            snapshot("a", "Hell", 3),
        ];
        let mut h = harness(events, 0, 1);
        let cancel = CancellationToken::new();
        h.driver.tick(&cancel).await; // first state
        h.driver.tick(&cancel).await; // fills the queue
        h.driver.tick(&cancel).await; // times out, dropped
        assert_eq!(h.counters.snapshot().dropped, 1);

        let first = h.queue_rx.recv().await.unwrap();
        assert!(first.marker().is_none());
        h.driver.tick(&cancel).await; // marker goes out first, then "Hell" is dropped
        let marker = h.queue_rx.recv().await.unwrap();
        assert_eq!(marker.marker(), Some(MarkerKind::ObservationDropped));
        assert_eq!(marker.metadata()["dropped_count"], Value::from(1));
        assert_eq!(h.counters.snapshot().dropped, 2);
    }

    #[tokio::test]
    async fn commanded_actions_are_recorded_at_next_tick() {
        let mut h = harness(vec![snapshot("a", "x", 0)], 0, 8);
        h.commands
            .submit(CommandedAction {
                command: "Open Slack".into(),
                kind: ActionKind::AppSwitch {
                    from_app: "a".into(),
                    to_app: "com.slack".into(),
                },
                success: true,
                steps: 2,
            })
            .await
            .unwrap();
        h.driver.tick(&CancellationToken::new()).await;
        let obs = h.queue_rx.try_recv().unwrap();
        assert!(obs.action().is_commanded());
        assert_eq!(obs.app_context(), "com.slack");
        assert_eq!(obs.action().confidence(), 1.0);
        assert_eq!(h.history.commanded_actions(10).len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_publishes_stopped() {
        let events: Vec<ReplayEvent> = (0..1000).map(|i| snapshot("a", &"x".repeat(i % 7), 0)).collect();
        let Harness {
            driver,
            queue_rx: _queue_rx,
            status_rx,
            counters,
            ..
        } = harness(events, 0, 4096);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*status_rx.borrow(), DriverStatus::Stopped);
        assert!(counters.snapshot().ticks >= 1);
    }

    #[tokio::test]
    async fn run_ends_when_source_closes() {
        let h = harness(vec![snapshot("a", "x", 0)], 0, 8);
        let status_rx = h.status_rx.clone();
        tokio::time::timeout(Duration::from_secs(5), h.driver.run(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(*status_rx.borrow(), DriverStatus::Stopped);
    }
}
