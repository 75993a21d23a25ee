//! `sonarlink-runtime` – The Control Loop
//!
//! Drives the sensor array: brings the bridge and the broker link up, keeps
//! publishing readings on a fixed cadence, and decides what a failure means.
//!
//! # Modules
//!
//! - [`poll_loop`] – [`PollLoop`]: one tick publishes every channel's
//!   reading in registration order, then sleeps; stops on interrupt or a
//!   dead link and closes every channel exactly once.
//! - [`supervisor`] – [`Supervisor`]: INIT / RUNNING / RETRYING / TERMINATED
//!   lifecycle.  Retries forever while the device is not ready, terminates
//!   on anything else.
//! - [`shutdown`] – [`Shutdown`] / [`ShutdownSignal`]: cooperative,
//!   sticky interrupt shared by every task of a run.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.
//!   Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod poll_loop;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;

pub use poll_loop::{LoopReport, PollLoop, StopReason};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use supervisor::{RunOutcome, Supervisor, SupervisorState};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
