//! The publish-side seam.
//!
//! The poll loop never speaks MQTT directly.  It hands `(topic, payload)`
//! pairs to a [`PublishLink`]; the supervisor obtains a fresh link from a
//! [`LinkConnector`] on every initialisation attempt.
//!
//! - [`MqttLink`][crate::mqtt::MqttLink] – the real broker connection.
//! - [`ReadingBus`][crate::bus::ReadingBus] – in-process broadcast used by
//!   `--simulate` runs and tests.

use std::sync::Arc;

use async_trait::async_trait;
use sonarlink_types::{BrokerConfig, SonarError};

/// A connected, fire-and-forget publish transport.
///
/// # Contract
///
/// * `publish` never waits for an acknowledgement and never fails because a
///   single message could not be delivered.  It fails only with
///   [`SonarError::BrokerConnection`] once the link is known to be dead.
/// * `disconnect` is best-effort and idempotent.
#[async_trait]
pub trait PublishLink: Send + Sync {
    /// Queue `payload` for delivery on `topic` (QoS 0, retain off).
    fn publish(&self, topic: &str, payload: String) -> Result<(), SonarError>;

    /// Close the link, flushing what can be flushed.
    async fn disconnect(&self);
}

/// Factory for [`PublishLink`]s.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// # Errors
    ///
    /// [`SonarError::BrokerConnection`] when the broker is unreachable or
    /// rejects the session.
    async fn connect(&self, broker: &BrokerConfig) -> Result<Arc<dyn PublishLink>, SonarError>;
}
