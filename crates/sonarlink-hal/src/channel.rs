//! [`SensorChannel`] – one sonar bound to the bridge.
//!
//! A channel owns its [`SensorConfig`], its derived [`PublishTopic`] and a
//! [`ReadingCell`] that the bridge callback writes into.  Registration
//! failures do not abort construction: the channel comes up
//! [`ChannelStatus::Degraded`] and reports the sentinel distance forever, so
//! one miswired sensor never takes the others down.
//!
//! # Staleness
//!
//! [`SensorChannel::reading`] fires an asynchronous measurement request and
//! returns the value cached by the *previous* delivery immediately.  The poll
//! loop's cadence gives the callback time to land before the next tick, so a
//! published value is at most one tick old.

use std::sync::Arc;

use sonarlink_types::{
    PublishTopic, Reading, SENTINEL_DISTANCE_CM, SensorConfig, SonarError, SonarPayload,
};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeConnection, ReadingCallback};
use crate::reading_cell::ReadingCell;

/// Outcome of binding a channel's pins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Pins registered; readings flow through the callback.
    Ready,
    /// Registration failed; the channel only ever reports the sentinel.
    Degraded(SonarError),
}

pub struct SensorChannel {
    config: SensorConfig,
    topic: PublishTopic,
    bridge: Arc<dyn BridgeConnection>,
    cell: Arc<ReadingCell>,
    status: ChannelStatus,
    closed: bool,
}

impl SensorChannel {
    /// Register `config`'s pins with `bridge` and build the channel.
    ///
    /// Never fails; inspect [`status`][Self::status] for the outcome.
    pub fn attach(
        bridge: Arc<dyn BridgeConnection>,
        config: SensorConfig,
        base_topic: &str,
    ) -> Self {
        let cell = Arc::new(ReadingCell::new());
        let sink = Arc::clone(&cell);
        let on_reading: ReadingCallback = Arc::new(move |payload| sink.store(&payload));

        let status = match bridge.register_sonar(config.trigger_pin, config.echo_pin, on_reading) {
            Ok(()) => {
                info!(
                    sensor_id = config.id,
                    trigger_pin = config.trigger_pin,
                    echo_pin = config.echo_pin,
                    "sonar channel ready"
                );
                ChannelStatus::Ready
            }
            Err(e) => {
                warn!(
                    sensor_id = config.id,
                    trigger_pin = config.trigger_pin,
                    echo_pin = config.echo_pin,
                    error = %e,
                    "sonar registration failed; channel degraded to sentinel readings"
                );
                ChannelStatus::Degraded(e)
            }
        };

        Self {
            topic: PublishTopic::new(base_topic, config.id),
            config,
            bridge,
            cell,
            status,
            closed: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.config.id
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Topic this channel publishes to; fixed for the channel's lifetime.
    pub fn topic(&self) -> &PublishTopic {
        &self.topic
    }

    pub fn status(&self) -> &ChannelStatus {
        &self.status
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, ChannelStatus::Degraded(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Store a bridge payload as the channel's latest reading.
    ///
    /// This is what the registered callback does; exposed for bridges that
    /// deliver on the poll task itself.
    pub fn on_reading(&self, payload: SonarPayload) {
        self.cell.store(&payload);
    }

    /// Request a fresh measurement and return the previously cached distance.
    ///
    /// Never blocks and never fails: request errors are logged and the cached
    /// value is still returned.  Degraded or closed channels return the
    /// sentinel without touching the bridge.
    pub fn reading(&self) -> u32 {
        if self.is_degraded() || self.closed {
            return SENTINEL_DISTANCE_CM;
        }
        if let Err(e) = self.bridge.request_reading(self.config.trigger_pin) {
            debug!(sensor_id = self.config.id, error = %e, "reading request failed");
        }
        self.cell.distance_cm()
    }

    /// Full cached record, including when it was observed.  Does not issue a
    /// measurement request.
    pub fn snapshot(&self) -> Reading {
        if self.is_degraded() {
            return Reading::default();
        }
        self.cell.load()
    }

    /// Release this channel's pin binding.
    ///
    /// Idempotent: only the first call touches the bridge.  Returns `false`
    /// if the bridge reported a failure while releasing; never panics.
    /// A degraded channel owns no binding and closes trivially.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return true;
        }
        self.closed = true;
        if self.is_degraded() {
            return true;
        }
        match self.bridge.release_sonar(self.config.trigger_pin) {
            Ok(()) => {
                info!(sensor_id = self.config.id, "sonar channel closed");
                true
            }
            Err(e) => {
                warn!(sensor_id = self.config.id, error = %e, "sonar channel close failed");
                false
            }
        }
    }
}

impl Drop for SensorChannel {
    fn drop(&mut self) {
        if !self.closed {
            debug!(sensor_id = self.config.id, "sonar channel dropped without close; releasing");
            self.close();
        }
    }
}

impl std::fmt::Debug for SensorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorChannel")
            .field("config", &self.config)
            .field("topic", &self.topic)
            .field("status", &self.status)
            .field("closed", &self.closed)
            .finish()
    }
}
