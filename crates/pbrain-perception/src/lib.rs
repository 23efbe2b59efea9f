//! `pbrain-perception` – turns device snapshots into observations.
//!
//! Every stage here is a pure function of its inputs, except the two-state
//! [`StateWindow`] and the id counter inside [`ObservationBuilder`].
//!
//! # Modules
//!
//! - [`canonicalize`] – [`canonicalize`][canonicalize::canonicalize]: raw UI
//!   tree → [`CanonicalState`][pbrain_types::CanonicalState] with stable ids
//!   and a structural screen signature.
//! - [`diff`] – [`diff`][diff::diff] between two canonical states, and the
//!   [`StateWindow`] that keeps only the latest two.
//! - [`classify`] – [`classify`][classify::classify]: rule-based action
//!   inference with a noise-penalised confidence.
//! - [`builder`] – [`ObservationBuilder`]: assembles immutable
//!   [`Observation`][pbrain_types::Observation]s and marker observations.

pub mod builder;
pub mod canonicalize;
pub mod classify;
pub mod diff;

pub use builder::{BuildError, ObservationBuilder, ObservationContext};
pub use canonicalize::{canonicalize, canonicalize_or_sentinel};
pub use classify::classify;
pub use diff::{StateWindow, diff};
