//! `pbrain-runtime` – the running observation pipeline.
//!
//! # Modules
//!
//! - [`driver`] – [`PollingDriver`][driver::PollingDriver]: the single task
//!   that pulls snapshots from a [`DeviceSource`][driver::DeviceSource],
//!   runs canonicalize → diff → classify → build and enqueues observations,
//!   with retry/backoff on unreachable devices and drop markers on a
//!   saturated queue.
//! - [`consolidation`] – [`ConsolidationEngine`][consolidation::ConsolidationEngine]:
//!   periodic, exactly-once promotion of qualifying short-term entries into
//!   the long-term graph, with an overflow log for failed writes.
//! - [`pipeline`] – [`Pipeline`][pipeline::Pipeline] wires the driver, the
//!   recorder (sole writer of the short-term store) and the consolidation
//!   engine together and hands out a [`PipelineHandle`][pipeline::PipelineHandle].
//! - [`history`] – bounded recent diffs/actions and the
//!   [`MonitoringOverview`][history::MonitoringOverview].
//! - [`sources`] – [`ReplaySource`][sources::ReplaySource] for recorded
//!   JSON-lines sessions.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing] with an
//!   optional OTLP exporter.

pub mod consolidation;
pub mod driver;
pub mod history;
pub mod pipeline;
pub mod sources;
pub mod telemetry;

pub use consolidation::{
    ConsolidationConfig, ConsolidationEngine, ConsolidationStats, PassReport, ReplayReport,
    derive_promotion,
};
pub use driver::{
    CommandSender, DeviceError, DeviceSource, DriverConfig, DriverStats, DriverStatus,
    DriverStopped, PollingDriver,
};
pub use history::{ActionRecord, DiffRecord, MonitoringOverview, RecentHistory};
pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle, ShutdownError, ShutdownReport};
pub use sources::{ReplayError, ReplayEvent, ReplaySource};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
