//! Microcontroller bridge abstraction.
//!
//! The rest of the system never talks to a serial port directly: it talks to
//! a [`BridgeConnection`], which can register a sonar on a pin pair, be asked
//! for a measurement, and delivers results asynchronously through the
//! callback supplied at registration.  Pin numbers are the only addressing
//! scheme across this boundary; the sensor-id ↔ pin mapping is kept on the
//! caller's side.

use std::sync::Arc;

use sonarlink_types::{SonarError, SonarPayload};

/// Callback invoked by the bridge's own delivery mechanism whenever a new
/// report for the registered trigger pin arrives.
///
/// Deliveries for the same pin are FIFO; ordering across pins is unspecified.
/// Implementations may call it from any thread.
pub type ReadingCallback = Arc<dyn Fn(SonarPayload) + Send + Sync>;

/// A live link to the microcontroller.
///
/// All methods take `&self`: one connection is shared (via `Arc`) between
/// every sensor channel and the poll loop of a run.
pub trait BridgeConnection: Send + Sync {
    /// Configure `trigger_pin`/`echo_pin` as a distance sensor and route its
    /// reports to `on_reading`.
    ///
    /// # Errors
    ///
    /// - [`SonarError::PinConflict`] if either pin is already bound.
    /// - [`SonarError::HardwareFault`] if the firmware cannot accept another
    ///   sensor.
    /// - [`SonarError::BridgeConnection`] if the link is down.
    fn register_sonar(
        &self,
        trigger_pin: u8,
        echo_pin: u8,
        on_reading: ReadingCallback,
    ) -> Result<(), SonarError>;

    /// Trigger an asynchronous measurement on `trigger_pin`.  Returns as soon
    /// as the request is issued; the result arrives through the callback.
    fn request_reading(&self, trigger_pin: u8) -> Result<(), SonarError>;

    /// Release the binding registered on `trigger_pin`.  Releasing a pin that
    /// is not bound is not an error.
    fn release_sonar(&self, trigger_pin: u8) -> Result<(), SonarError>;

    /// Release every bound pin and close the underlying link.  Idempotent.
    fn shutdown(&self) -> Result<(), SonarError>;

    /// `Ok` while the link is usable; the error that killed it otherwise.
    fn link_status(&self) -> Result<(), SonarError> {
        Ok(())
    }
}

/// Factory that establishes a fresh [`BridgeConnection`].
///
/// The supervisor calls [`connect`][Self::connect] on every initialisation
/// attempt, so implementations must be reusable after a failed attempt.
pub trait BridgeConnector: Send + Sync {
    /// # Errors
    ///
    /// [`SonarError::DeviceNotReady`] when the expected hardware is absent
    /// (the supervisor retries), any other variant when the failure is fatal.
    fn connect(&self) -> Result<Arc<dyn BridgeConnection>, SonarError>;
}
