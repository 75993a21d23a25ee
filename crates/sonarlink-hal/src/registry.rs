//! [`SensorRegistry`] – the fixed, ordered set of sensor channels of one run.
//!
//! The registry attaches every configured sensor to the bridge in
//! configuration order and owns the resulting [`SensorChannel`]s until the
//! poll loop stops.  Membership never changes after construction.
//!
//! # Bulk close
//!
//! [`SensorRegistry::close_all`] closes every channel exactly once and keeps
//! going past failures, so one stuck binding never leaks the others.

use std::sync::Arc;

use sonarlink_types::SensorConfig;
use tracing::{info, warn};

use crate::bridge::BridgeConnection;
use crate::channel::SensorChannel;

#[derive(Debug, Default)]
pub struct SensorRegistry {
    channels: Vec<SensorChannel>,
}

impl SensorRegistry {
    /// Attach one channel per entry of `sensors`, in order.
    ///
    /// Never fails: a sensor whose pins cannot be registered becomes a
    /// degraded channel and the remaining sensors are still attached.
    pub fn attach_all(
        bridge: Arc<dyn BridgeConnection>,
        sensors: &[SensorConfig],
        base_topic: &str,
    ) -> Self {
        let channels: Vec<SensorChannel> = sensors
            .iter()
            .map(|config| SensorChannel::attach(Arc::clone(&bridge), *config, base_topic))
            .collect();

        let registry = Self { channels };
        info!(
            sensors = registry.len(),
            degraded = registry.degraded().count(),
            "sensor channels attached"
        );
        registry
    }

    /// Wrap channels that were attached elsewhere.
    pub fn from_channels(channels: Vec<SensorChannel>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &[SensorChannel] {
        &self.channels
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SensorChannel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channels whose registration failed.
    pub fn degraded(&self) -> impl Iterator<Item = &SensorChannel> {
        self.channels.iter().filter(|ch| ch.is_degraded())
    }

    /// Close every channel, best-effort.  Returns the number of channels whose
    /// release failed.
    pub fn close_all(&mut self) -> usize {
        let mut failures = 0;
        for channel in &mut self.channels {
            if !channel.close() {
                failures += 1;
            }
        }
        if failures > 0 {
            warn!(failures, "some sensor channels failed to close cleanly");
        }
        failures
    }
}

impl<'a> IntoIterator for &'a SensorRegistry {
    type Item = &'a SensorChannel;
    type IntoIter = std::slice::Iter<'a, SensorChannel>;

    fn into_iter(self) -> Self::IntoIter {
        self.channels.iter()
    }
}
