//! `sonarlink-middleware` – The Publish Side
//!
//! Moves readings from the poll loop to the outside world without caring
//! about what they mean.
//!
//! # Modules
//!
//! - [`link`] – the [`PublishLink`] / [`LinkConnector`] seam the runtime
//!   publishes through.
//! - [`mqtt`] – [`MqttLink`]: fire-and-forget QoS 0 publishing to an MQTT
//!   broker via `rumqttc`, with a supervised event-loop task.
//! - [`bus`] – [`ReadingBus`]: in-process broadcast link for simulation and
//!   tests.

pub mod bus;
pub mod link;
pub mod mqtt;

pub use bus::{BusConnector, PublishedMessage, ReadingBus, TopicSubscriber};
pub use link::{LinkConnector, PublishLink};
pub use mqtt::{MqttConnector, MqttLink};
