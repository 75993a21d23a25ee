//! In-process simulation bridge for CI/CD and `--simulate` runs without an
//! Arduino attached.
//!
//! [`SimBridge`] honours the full [`BridgeConnection`] contract (pin table,
//! conflict detection, idempotent shutdown) and records every call so tests
//! can assert on it.  Readings are delivered either manually via
//! [`SimBridge::deliver`] or, in auto-echo mode, in answer to each
//! [`request_reading`][BridgeConnection::request_reading].
//!
//! [`SimConnector`] wraps it in a [`BridgeConnector`] that can pretend the
//! device is missing for the first few attempts.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sonarlink_hal::{SensorChannel, SimBridge};
//! use sonarlink_types::SensorConfig;
//!
//! let bridge = Arc::new(SimBridge::new());
//! let channel = SensorChannel::attach(bridge.clone(), SensorConfig::new(0, 2, 8), "garage/");
//!
//! assert_eq!(channel.reading(), 0);
//! bridge.deliver(2, 57);
//! assert_eq!(channel.reading(), 57);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sonarlink_types::{SonarError, SonarPayload};
use tracing::debug;

use crate::bridge::{BridgeConnection, BridgeConnector, ReadingCallback};
use crate::pin_table::PinTable;

// ────────────────────────────────────────────────────────────────────────────
// SimBridge
// ────────────────────────────────────────────────────────────────────────────

/// A simulated microcontroller bridge.  Always reachable unless told
/// otherwise.
#[derive(Default)]
pub struct SimBridge {
    pins: Mutex<PinTable>,
    auto_echo: bool,
    failing_releases: HashSet<u8>,
    requests: Mutex<HashMap<u8, usize>>,
    releases: Mutex<HashMap<u8, usize>>,
    shutdown_calls: AtomicUsize,
    is_shut_down: AtomicBool,
    link_failure: Mutex<Option<SonarError>>,
}

impl SimBridge {
    /// Create a bridge with no bound pins that never answers on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every measurement request with a synthetic distance.
    pub fn with_auto_echo(mut self) -> Self {
        self.auto_echo = true;
        self
    }

    /// Pre-bind a pin pair to a foreign owner, as if another process or an
    /// earlier registration already held it.
    pub fn with_reserved_pins(self, trigger_pin: u8, echo_pin: u8) -> Self {
        let noop: ReadingCallback = Arc::new(|_| {});
        if let Err(e) = lock(&self.pins).bind(trigger_pin, echo_pin, noop) {
            debug!(error = %e, "reserved pins overlap an existing reservation");
        }
        self
    }

    /// Make [`release_sonar`][BridgeConnection::release_sonar] fail for
    /// `trigger_pin`.
    pub fn with_failing_release(mut self, trigger_pin: u8) -> Self {
        self.failing_releases.insert(trigger_pin);
        self
    }

    /// Deliver a distance report for `trigger_pin` through its registered
    /// callback.  Returns `false` if nothing is bound on that pin.
    pub fn deliver(&self, trigger_pin: u8, distance_cm: u32) -> bool {
        // Clone the callback out so it runs without the table locked.
        let callback = lock(&self.pins).callback(trigger_pin);
        match callback {
            Some(cb) => {
                cb(SonarPayload::sonar(trigger_pin, distance_cm));
                true
            }
            None => false,
        }
    }

    /// Mark the link as dead; subsequent [`link_status`] calls return `err`.
    ///
    /// [`link_status`]: BridgeConnection::link_status
    pub fn fail_link(&self, err: SonarError) {
        *lock(&self.link_failure) = Some(err);
    }

    pub fn is_bound(&self, trigger_pin: u8) -> bool {
        lock(&self.pins).is_bound(trigger_pin)
    }

    pub fn bound_count(&self) -> usize {
        lock(&self.pins).len()
    }

    /// Number of measurement requests received for `trigger_pin`.
    pub fn request_count(&self, trigger_pin: u8) -> usize {
        lock(&self.requests).get(&trigger_pin).copied().unwrap_or(0)
    }

    /// Number of release calls received for `trigger_pin`.
    pub fn release_calls(&self, trigger_pin: u8) -> usize {
        lock(&self.releases).get(&trigger_pin).copied().unwrap_or(0)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::SeqCst)
    }

    // Deterministic distance in a plausible 20–60 cm band that differs per
    // pin and moves a little with every request.
    fn synthetic_distance(trigger_pin: u8, request_no: usize) -> u32 {
        let step = (request_no % 40) as u32;
        20 + (u32::from(trigger_pin) * 7 + step * 3) % 40
    }
}

impl BridgeConnection for SimBridge {
    fn register_sonar(
        &self,
        trigger_pin: u8,
        echo_pin: u8,
        on_reading: ReadingCallback,
    ) -> Result<(), SonarError> {
        if self.is_shut_down() {
            return Err(SonarError::BridgeConnection("simulated bridge is shut down".to_string()));
        }
        lock(&self.pins).bind(trigger_pin, echo_pin, on_reading)
    }

    fn request_reading(&self, trigger_pin: u8) -> Result<(), SonarError> {
        let request_no = {
            let mut requests = lock(&self.requests);
            let count = requests.entry(trigger_pin).or_insert(0);
            *count += 1;
            *count
        };
        if self.auto_echo {
            self.deliver(trigger_pin, Self::synthetic_distance(trigger_pin, request_no));
        }
        Ok(())
    }

    fn release_sonar(&self, trigger_pin: u8) -> Result<(), SonarError> {
        *lock(&self.releases).entry(trigger_pin).or_insert(0) += 1;
        if self.failing_releases.contains(&trigger_pin) {
            return Err(SonarError::HardwareFault {
                component: format!("sim/pin{trigger_pin}"),
                details: "simulated release failure".to_string(),
            });
        }
        lock(&self.pins).release(trigger_pin);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), SonarError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_shut_down.swap(true, Ordering::SeqCst) {
            lock(&self.pins).clear();
        }
        Ok(())
    }

    fn link_status(&self) -> Result<(), SonarError> {
        match &*lock(&self.link_failure) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimConnector
// ────────────────────────────────────────────────────────────────────────────

type BridgeFactory = Box<dyn Fn() -> SimBridge + Send + Sync>;

/// [`BridgeConnector`] producing [`SimBridge`]s, with scripted failures.
pub struct SimConnector {
    factory: BridgeFactory,
    not_ready_remaining: AtomicUsize,
    fatal: Option<SonarError>,
    attempts: AtomicUsize,
    last: Mutex<Option<Arc<SimBridge>>>,
}

impl SimConnector {
    /// Connector whose every successful attempt builds a bridge with
    /// `factory`.
    pub fn new(factory: impl Fn() -> SimBridge + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            not_ready_remaining: AtomicUsize::new(0),
            fatal: None,
            attempts: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    /// Fail the first `attempts` connects with [`SonarError::DeviceNotReady`].
    pub fn not_ready_for(self, attempts: usize) -> Self {
        self.not_ready_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    /// Fail every connect (after any not-ready attempts) with `err`.
    pub fn failing_with(mut self, err: SonarError) -> Self {
        self.fatal = Some(err);
        self
    }

    /// Total number of connect attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The bridge handed out by the most recent successful connect.
    pub fn last_bridge(&self) -> Option<Arc<SimBridge>> {
        lock(&self.last).clone()
    }
}

impl BridgeConnector for SimConnector {
    fn connect(&self) -> Result<Arc<dyn BridgeConnection>, SonarError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let not_ready = self
            .not_ready_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if not_ready {
            return Err(SonarError::DeviceNotReady(format!(
                "simulated device absent (attempt {attempt})"
            )));
        }
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }

        let bridge = Arc::new((self.factory)());
        *lock(&self.last) = Some(Arc::clone(&bridge));
        Ok(bridge)
    }
}

// A poisoned lock only means a test callback panicked; the data is still
// consistent for bookkeeping purposes.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn recording_callback() -> (ReadingCallback, Arc<AtomicU32>) {
        let seen = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&seen);
        let cb: ReadingCallback = Arc::new(move |p: SonarPayload| {
            sink.store(p.distance_cm, Ordering::SeqCst);
        });
        (cb, seen)
    }

    #[test]
    fn deliver_routes_to_registered_callback() {
        let bridge = SimBridge::new();
        let (cb, seen) = recording_callback();
        bridge.register_sonar(2, 8, cb).unwrap();

        assert!(bridge.deliver(2, 33));
        assert_eq!(seen.load(Ordering::SeqCst), 33);
        assert!(!bridge.deliver(3, 33));
    }

    #[test]
    fn auto_echo_answers_requests() {
        let bridge = SimBridge::new().with_auto_echo();
        let (cb, seen) = recording_callback();
        bridge.register_sonar(4, 10, cb).unwrap();

        bridge.request_reading(4).unwrap();
        let first = seen.load(Ordering::SeqCst);
        assert!((20..60).contains(&first));
        assert_eq!(bridge.request_count(4), 1);
    }

    #[test]
    fn synthetic_distance_stays_in_band_for_any_request_count() {
        for request_no in [0, 1, 39, 40, usize::MAX / 2, usize::MAX] {
            let d = SimBridge::synthetic_distance(13, request_no);
            assert!((20..60).contains(&d), "{d} out of band");
        }
        assert_eq!(
            SimBridge::synthetic_distance(2, 5),
            SimBridge::synthetic_distance(2, 45)
        );
    }

    #[test]
    fn double_registration_conflicts() {
        let bridge = SimBridge::new();
        bridge.register_sonar(2, 8, Arc::new(|_| {})).unwrap();
        let err = bridge.register_sonar(8, 9, Arc::new(|_| {})).unwrap_err();
        assert!(matches!(err, SonarError::PinConflict { .. }));
    }

    #[test]
    fn shutdown_is_idempotent_and_clears_pins() {
        let bridge = SimBridge::new();
        bridge.register_sonar(2, 8, Arc::new(|_| {})).unwrap();
        bridge.shutdown().unwrap();
        bridge.shutdown().unwrap();
        assert_eq!(bridge.shutdown_calls(), 2);
        assert_eq!(bridge.bound_count(), 0);
        assert!(bridge.register_sonar(2, 8, Arc::new(|_| {})).is_err());
    }

    #[test]
    fn failing_release_keeps_binding() {
        let bridge = SimBridge::new().with_failing_release(2);
        bridge.register_sonar(2, 8, Arc::new(|_| {})).unwrap();
        assert!(bridge.release_sonar(2).is_err());
        assert!(bridge.is_bound(2));
        assert_eq!(bridge.release_calls(2), 1);
    }

    #[test]
    fn link_failure_is_reported() {
        let bridge = SimBridge::new();
        assert!(bridge.link_status().is_ok());
        bridge.fail_link(SonarError::BridgeConnection("unplugged".into()));
        assert!(matches!(
            bridge.link_status(),
            Err(SonarError::BridgeConnection(_))
        ));
    }

    #[test]
    fn connector_reports_not_ready_then_connects() {
        let connector = SimConnector::new(SimBridge::new).not_ready_for(2);
        assert!(matches!(connector.connect(), Err(SonarError::DeviceNotReady(_))));
        assert!(matches!(connector.connect(), Err(SonarError::DeviceNotReady(_))));
        assert!(connector.connect().is_ok());
        assert_eq!(connector.attempts(), 3);
        assert!(connector.last_bridge().is_some());
    }

    #[test]
    fn connector_fatal_error_is_returned() {
        let connector = SimConnector::new(SimBridge::new)
            .failing_with(SonarError::BridgeConnection("permission denied".into()));
        let err = connector.connect().err().expect("must fail");
        assert!(!err.is_recoverable());
        assert!(connector.last_bridge().is_none());
    }
}
