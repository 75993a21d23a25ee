//! [`PollLoop`] – the publish cadence.
//!
//! Each tick walks the registry in registration order, asks every channel
//! for its reading and hands the distance to the [`PublishLink`] as a
//! decimal string on the channel's topic.  Then it sleeps the poll interval.
//!
//! ```text
//!   RUNNING ──(interrupt | fatal link error)──▶ STOPPED
//! ```
//!
//! Interrupts are observed at the top of every tick and during the sleep.
//! On the way to STOPPED every channel is closed exactly once; closing is
//! best-effort and failures are only counted.  STOPPED is terminal:
//! [`PollLoop::run`] consumes the loop.

use std::sync::Arc;
use std::time::Duration;

use sonarlink_hal::{BridgeConnection, SensorRegistry};
use sonarlink_middleware::PublishLink;
use sonarlink_types::SonarError;
use tracing::{debug, info, trace, warn};

use crate::shutdown::ShutdownSignal;

/// Why the loop left RUNNING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Operator interrupt.  Not an error.
    Interrupted,
    /// The publish link reported itself dead.
    TransportLost(SonarError),
    /// The microcontroller link died underneath the channels.
    BridgeLost(SonarError),
}

impl StopReason {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, StopReason::Interrupted)
    }

    /// The fatal error behind the stop, if any.
    pub fn error(&self) -> Option<&SonarError> {
        match self {
            StopReason::Interrupted => None,
            StopReason::TransportLost(e) | StopReason::BridgeLost(e) => Some(e),
        }
    }
}

/// Summary of one RUNNING period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub reason: StopReason,
    /// Completed ticks (every channel published).
    pub ticks: u64,
    /// Channels whose close reported a failure.
    pub close_failures: usize,
}

pub struct PollLoop {
    registry: SensorRegistry,
    bridge: Arc<dyn BridgeConnection>,
    link: Arc<dyn PublishLink>,
    interval: Duration,
    ticks: u64,
}

impl PollLoop {
    pub fn new(
        registry: SensorRegistry,
        bridge: Arc<dyn BridgeConnection>,
        link: Arc<dyn PublishLink>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            bridge,
            link,
            interval,
            ticks: 0,
        }
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Publish one reading per channel, in registration order.
    ///
    /// # Errors
    ///
    /// The [`StopReason`] to stop with when the bridge or the publish link is
    /// dead.  Channels published before the failure stay published.
    pub fn tick(&mut self) -> Result<(), StopReason> {
        self.bridge.link_status().map_err(StopReason::BridgeLost)?;

        for channel in &self.registry {
            let distance_cm = channel.reading();
            trace!(sensor_id = channel.id(), topic = %channel.topic(), distance_cm, "publish");
            self.link
                .publish(channel.topic().as_str(), distance_cm.to_string())
                .map_err(StopReason::TransportLost)?;
        }

        self.ticks += 1;
        Ok(())
    }

    /// Drive ticks until interrupted or a fatal link error, then close every
    /// channel.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> LoopReport {
        info!(
            sensors = self.registry.len(),
            interval_ms = self.interval.as_millis() as u64,
            "poll loop running"
        );

        let reason = loop {
            if shutdown.is_triggered() {
                break StopReason::Interrupted;
            }
            if let Err(reason) = self.tick() {
                break reason;
            }
            tokio::select! {
                _ = shutdown.triggered() => break StopReason::Interrupted,
                _ = tokio::time::sleep(self.interval) => {}
            }
        };

        match reason.error() {
            None => info!(ticks = self.ticks, "poll loop interrupted"),
            Some(e) => warn!(ticks = self.ticks, error = %e, "poll loop stopped by link failure"),
        }

        let close_failures = self.registry.close_all();
        debug!(close_failures, "sensor channels closed");

        LoopReport {
            reason,
            ticks: self.ticks,
            close_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use sonarlink_hal::SimBridge;
    use sonarlink_middleware::{PublishedMessage, ReadingBus};
    use sonarlink_types::SensorConfig;
    use tokio::sync::broadcast;

    const BASE: &str = "arduino/distance";

    fn sensors() -> Vec<SensorConfig> {
        vec![
            SensorConfig::new(0, 2, 8),
            SensorConfig::new(1, 3, 9),
            SensorConfig::new(2, 4, 10),
            SensorConfig::new(3, 5, 11),
        ]
    }

    fn build(sim: &Arc<SimBridge>, bus: &ReadingBus, interval_ms: u64) -> PollLoop {
        let registry = SensorRegistry::attach_all(sim.clone(), &sensors(), BASE);
        PollLoop::new(
            registry,
            sim.clone(),
            Arc::new(bus.clone()),
            Duration::from_millis(interval_ms),
        )
    }

    async fn take(
        rx: &mut broadcast::Receiver<PublishedMessage>,
        n: usize,
    ) -> Vec<PublishedMessage> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("message within timeout")
                .expect("bus open");
            out.push(msg);
        }
        out
    }

    #[test]
    fn tick_publishes_every_channel_in_order() {
        let sim = Arc::new(SimBridge::new());
        let bus = ReadingBus::default();
        let mut rx = bus.subscribe();
        let mut poll = build(&sim, &bus, 10);

        sim.deliver(3, 57);
        poll.tick().unwrap();

        let got: Vec<(String, String)> = (0..4)
            .map(|_| {
                let m = rx.try_recv().unwrap();
                (m.topic, m.payload)
            })
            .collect();
        assert_eq!(
            got,
            [
                ("arduino/distance0".to_string(), "0".to_string()),
                ("arduino/distance1".to_string(), "57".to_string()),
                ("arduino/distance2".to_string(), "0".to_string()),
                ("arduino/distance3".to_string(), "0".to_string()),
            ]
        );
        assert_eq!(poll.ticks(), 1);
        for pin in [2, 3, 4, 5] {
            assert_eq!(sim.request_count(pin), 1);
        }
    }

    #[tokio::test]
    async fn silent_sensors_publish_zero_until_interrupted() {
        let sim = Arc::new(SimBridge::new());
        let bus = ReadingBus::default();
        let mut rx = bus.subscribe();
        let shutdown = Shutdown::new();

        let task = tokio::spawn(build(&sim, &bus, 10).run(shutdown.signal()));

        let msgs = take(&mut rx, 12).await;
        shutdown.trigger();
        let report = task.await.unwrap();

        for (i, msg) in msgs.iter().enumerate() {
            assert_eq!(msg.topic, format!("{BASE}{}", i % 4));
            assert_eq!(msg.payload, "0");
        }
        assert_eq!(report.reason, StopReason::Interrupted);
        assert!(report.ticks >= 3);
        assert_eq!(report.close_failures, 0);
        assert_eq!(sim.bound_count(), 0);
    }

    #[tokio::test]
    async fn delivered_reading_is_visible_on_next_tick() {
        let sim = Arc::new(SimBridge::new());
        let bus = ReadingBus::default();
        let mut rx = bus.subscribe();
        let mut poll = build(&sim, &bus, 10);

        poll.tick().unwrap();
        assert_eq!(take(&mut rx, 4).await[0].payload, "0");

        sim.deliver(2, 88);
        poll.tick().unwrap();
        assert_eq!(take(&mut rx, 4).await[0].payload, "88");
    }

    #[tokio::test]
    async fn dead_link_stops_loop_and_closes_channels() {
        let sim = Arc::new(SimBridge::new().with_failing_release(5));
        let bus = ReadingBus::default();
        bus.sever(SonarError::BrokerConnection("gone".into()));

        let report = build(&sim, &bus, 10).run(Shutdown::new().signal()).await;

        assert_eq!(
            report.reason,
            StopReason::TransportLost(SonarError::BrokerConnection("gone".into()))
        );
        assert_eq!(report.ticks, 0);
        assert_eq!(report.close_failures, 1);
        for pin in [2, 3, 4, 5] {
            assert_eq!(sim.release_calls(pin), 1);
        }
    }

    #[tokio::test]
    async fn bridge_failure_stops_loop() {
        let sim = Arc::new(SimBridge::new());
        let bus = ReadingBus::default();
        sim.fail_link(SonarError::BridgeConnection("unplugged".into()));

        let report = build(&sim, &bus, 10).run(Shutdown::new().signal()).await;
        assert!(matches!(report.reason, StopReason::BridgeLost(_)));
        assert!(!report.reason.is_interrupt());
    }

    #[tokio::test]
    async fn interrupt_before_first_tick_publishes_nothing() {
        let sim = Arc::new(SimBridge::new());
        let bus = ReadingBus::default();
        let mut rx = bus.subscribe();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let report = build(&sim, &bus, 10).run(shutdown.signal()).await;
        assert_eq!(report.reason, StopReason::Interrupted);
        assert_eq!(report.ticks, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(sim.bound_count(), 0);
    }

    #[tokio::test]
    async fn interrupt_during_sleep_is_prompt() {
        let sim = Arc::new(SimBridge::new());
        let bus = ReadingBus::default();
        let mut rx = bus.subscribe();
        let shutdown = Shutdown::new();

        let task = tokio::spawn(build(&sim, &bus, 60_000).run(shutdown.signal()));
        take(&mut rx, 4).await;
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop must stop without finishing the sleep")
            .unwrap();
        assert_eq!(report.ticks, 1);
    }
}
