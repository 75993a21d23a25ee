//! `sonarlink-hal` – The Sensor Side
//!
//! Everything between the sonar modules and the poll loop.
//!
//! # Modules
//!
//! - [`bridge`] – the [`BridgeConnection`] trait every microcontroller link
//!   implements, and the [`BridgeConnector`] factory the supervisor retries.
//! - [`channel`] – [`SensorChannel`]: one trigger/echo pair bound to the
//!   bridge, caching the latest reading delivered by its callback.
//! - [`registry`] – [`SensorRegistry`]: the ordered, fixed set of channels of
//!   one run, with best-effort bulk close.
//! - [`reading_cell`] – lock-free single-writer / single-reader cell holding
//!   a sensor's last reading.
//! - [`pin_table`] – pin bookkeeping shared by bridge implementations;
//!   rejects double bindings.
//! - [`firmata`] – FirmataExpress sysex codec (sonar config / sonar data /
//!   firmware report).
//! - [`firmata_bridge`] – [`FirmataBridge`]: the bridge over a USB serial
//!   port, with a dedicated reader thread delivering callbacks.
//! - [`sim`] – [`SimBridge`] / [`SimConnector`]: an in-process bridge for
//!   headless runs and tests.

pub mod bridge;
pub mod channel;
pub mod firmata;
pub mod firmata_bridge;
pub mod pin_table;
pub mod reading_cell;
pub mod registry;
pub mod sim;

pub use bridge::{BridgeConnection, BridgeConnector, ReadingCallback};
pub use channel::{ChannelStatus, SensorChannel};
pub use firmata_bridge::{FirmataBridge, FirmataConnector, PortSummary, list_ports};
pub use pin_table::PinTable;
pub use reading_cell::ReadingCell;
pub use registry::SensorRegistry;
pub use sim::{SimBridge, SimConnector};
