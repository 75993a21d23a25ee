//! [`FirmataBridge`] – the microcontroller bridge over a USB serial port.
//!
//! Talks to an Arduino running the FirmataExpress sketch.  The sketch pings
//! every configured sonar on its own and streams `SONAR_DATA` reports, so a
//! dedicated reader thread decodes the serial stream and hands each report
//! to the callback bound on its trigger pin.  Host → board traffic (firmware
//! query, sonar config, reset) goes through a separate cloned handle guarded
//! by a mutex.
//!
//! # Connect sequence
//!
//! 1. Resolve the port: the configured path, or the first USB port whose
//!    vendor id is known.
//! 2. Open it at the configured baud rate.  Most boards reboot on open.
//! 3. Repeat the firmware query until a firmware report arrives or the
//!    handshake timeout expires.
//!
//! Absent hardware at any of these steps is [`SonarError::DeviceNotReady`];
//! anything else is [`SonarError::BridgeConnection`].

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serialport::{SerialPort, SerialPortType};
use sonarlink_types::{BridgeConfig, SonarError, SonarPayload};
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BridgeConnection, BridgeConnector, ReadingCallback};
use crate::firmata::{self, FirmataDecoder, FirmataMessage, MAX_SONARS};
use crate::pin_table::PinTable;

/// Serial read timeout; bounds how long the reader thread takes to notice a
/// stop request.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Interval between repeated firmware queries during the handshake.
const QUERY_INTERVAL: Duration = Duration::from_millis(500);

// ────────────────────────────────────────────────────────────────────────────
// Firmware identity
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub major: u8,
    pub minor: u8,
    pub name: String,
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.name, self.major, self.minor)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bridge
// ────────────────────────────────────────────────────────────────────────────

// State shared with the reader thread.
struct Shared {
    pins: Mutex<PinTable>,
    stop: AtomicBool,
    link_failure: Mutex<Option<SonarError>>,
}

pub struct FirmataBridge {
    port_name: String,
    firmware: FirmwareInfo,
    writer: Mutex<Box<dyn SerialPort>>,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl FirmataBridge {
    /// Open the serial link described by `config` and complete the firmware
    /// handshake.  Blocks for up to `config.handshake_timeout_ms`; call it
    /// from a blocking context.
    ///
    /// # Errors
    ///
    /// - [`SonarError::DeviceNotReady`] if no matching port exists, the port
    ///   vanished, or the board never answered the firmware query.
    /// - [`SonarError::BridgeConnection`] for any other serial failure.
    pub fn connect(config: &BridgeConfig) -> Result<Self, SonarError> {
        let port_name = match &config.serial_port {
            Some(path) => path.clone(),
            None => {
                let ports = list_ports()?;
                select_port(&ports, &config.usb_vendor_ids).ok_or_else(|| {
                    SonarError::DeviceNotReady(
                        "no USB serial port with a known microcontroller vendor id".to_string(),
                    )
                })?
            }
        };

        debug!(port = %port_name, baud = config.baud_rate, "opening serial port");
        let mut port = serialport::new(&port_name, config.baud_rate)
            .timeout(READ_TIMEOUT)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| classify_open_error(&port_name, e))?;

        if let Err(e) = port.write_data_terminal_ready(true) {
            debug!(port = %port_name, error = %e, "could not assert DTR");
        }

        let mut decoder = FirmataDecoder::new();
        let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms);
        let firmware = handshake(&mut port, &mut decoder, handshake_timeout, &port_name)?;
        info!(port = %port_name, firmware = %firmware, "microcontroller bridge connected");

        let reader_port = port.try_clone().map_err(|e| {
            SonarError::BridgeConnection(format!("cannot clone serial handle for {port_name}: {e}"))
        })?;

        let shared = Arc::new(Shared {
            pins: Mutex::new(PinTable::new()),
            stop: AtomicBool::new(false),
            link_failure: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_port_name = port_name.clone();
        let reader = thread::Builder::new()
            .name("firmata-reader".to_string())
            .spawn(move || pump(reader_port, decoder, &thread_shared, &thread_port_name))
            .map_err(|e| SonarError::BridgeConnection(format!("cannot spawn reader thread: {e}")))?;

        Ok(Self {
            port_name,
            firmware,
            writer: Mutex::new(port),
            shared,
            reader: Mutex::new(Some(reader)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Firmware identity reported during the handshake.
    pub fn firmware(&self) -> &FirmwareInfo {
        &self.firmware
    }

    fn send(&self, bytes: &[u8]) -> Result<(), SonarError> {
        let mut port = lock(&self.writer);
        let sent = port.write_all(bytes).and_then(|()| port.flush());
        sent.map_err(|e| {
            let port_name = &self.port_name;
            SonarError::BridgeConnection(format!("serial write on {port_name} failed: {e}"))
        })
    }

    fn ensure_open(&self) -> Result<(), SonarError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SonarError::BridgeConnection(format!(
                "bridge on {} is shut down",
                self.port_name
            )));
        }
        self.link_status()
    }
}

impl BridgeConnection for FirmataBridge {
    fn register_sonar(
        &self,
        trigger_pin: u8,
        echo_pin: u8,
        on_reading: ReadingCallback,
    ) -> Result<(), SonarError> {
        self.ensure_open()?;
        if trigger_pin > firmata::MAX_PIN || echo_pin > firmata::MAX_PIN {
            return Err(SonarError::PinConflict {
                trigger_pin,
                echo_pin,
                details: format!("pins above {} cannot be addressed", firmata::MAX_PIN),
            });
        }
        {
            let mut pins = lock(&self.shared.pins);
            if pins.len() >= MAX_SONARS {
                return Err(SonarError::HardwareFault {
                    component: format!("firmata/{}", self.port_name),
                    details: format!("firmware supports at most {MAX_SONARS} sonars"),
                });
            }
            pins.bind(trigger_pin, echo_pin, on_reading)?;
        }

        if let Err(e) = self.send(&firmata::sonar_config(trigger_pin, echo_pin)) {
            lock(&self.shared.pins).release(trigger_pin);
            return Err(e);
        }
        debug!(trigger_pin, echo_pin, "sonar configured on board");
        Ok(())
    }

    fn request_reading(&self, trigger_pin: u8) -> Result<(), SonarError> {
        // The sketch pings configured sonars continuously; the next report
        // satisfies the request.
        self.ensure_open()?;
        trace!(trigger_pin, "reading requested");
        Ok(())
    }

    fn release_sonar(&self, trigger_pin: u8) -> Result<(), SonarError> {
        // FirmataExpress has no "unconfigure sonar" message.  Dropping the
        // binding stops delivery; later reports for the pin are discarded.
        if lock(&self.shared.pins).release(trigger_pin) {
            debug!(trigger_pin, "sonar binding released");
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), SonarError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.stop.store(true, Ordering::Release);
        lock(&self.shared.pins).clear();

        if let Err(e) = self.send(&firmata::system_reset()) {
            debug!(error = %e, "system reset not delivered");
        }

        if let Some(handle) = lock(&self.reader).take() {
            if handle.join().is_err() {
                warn!(port = %self.port_name, "firmata reader thread panicked");
            }
        }
        info!(port = %self.port_name, "microcontroller bridge shut down");
        Ok(())
    }

    fn link_status(&self) -> Result<(), SonarError> {
        match &*lock(&self.shared.link_failure) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Drop for FirmataBridge {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl fmt::Debug for FirmataBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmataBridge")
            .field("port_name", &self.port_name)
            .field("firmware", &self.firmware)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// [`BridgeConnector`] that opens a fresh [`FirmataBridge`] per attempt.
#[derive(Debug, Clone)]
pub struct FirmataConnector {
    config: BridgeConfig,
}

impl FirmataConnector {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl BridgeConnector for FirmataConnector {
    fn connect(&self) -> Result<Arc<dyn BridgeConnection>, SonarError> {
        let bridge = FirmataBridge::connect(&self.config)?;
        Ok(Arc::new(bridge))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handshake and reader loop
// ────────────────────────────────────────────────────────────────────────────

fn handshake<P: Read + Write + ?Sized>(
    port: &mut P,
    decoder: &mut FirmataDecoder,
    timeout: Duration,
    port_name: &str,
) -> Result<FirmwareInfo, SonarError> {
    let deadline = Instant::now() + timeout;
    let mut next_query = Instant::now();
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        if Instant::now() >= next_query {
            let sent = port.write_all(&firmata::firmware_query()).and_then(|()| port.flush());
            sent.map_err(|e| {
                SonarError::BridgeConnection(format!("firmware query on {port_name} failed: {e}"))
            })?;
            next_query = Instant::now() + QUERY_INTERVAL;
        }

        match port.read(&mut buf) {
            Ok(n) => {
                for msg in decoder.feed(&buf[..n]) {
                    if let FirmataMessage::FirmwareReport { major, minor, name } = msg {
                        return Ok(FirmwareInfo { major, minor, name });
                    }
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                return Err(SonarError::BridgeConnection(format!(
                    "serial read on {port_name} failed during handshake: {e}"
                )));
            }
        }
    }

    Err(SonarError::DeviceNotReady(format!(
        "no firmware report from {port_name} within {} ms",
        timeout.as_millis()
    )))
}

// Reader thread body: decode until stopped or the link fails.
fn pump<R: Read>(mut port: R, mut decoder: FirmataDecoder, shared: &Shared, port_name: &str) {
    let mut buf = [0u8; 256];
    while !shared.stop.load(Ordering::Acquire) {
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                error!(port = %port_name, error = %e, "serial link lost");
                *lock(&shared.link_failure) = Some(SonarError::BridgeConnection(format!(
                    "serial read on {port_name} failed: {e}"
                )));
                break;
            }
        };

        for msg in decoder.feed(&buf[..n]) {
            match msg {
                FirmataMessage::SonarData {
                    trigger_pin,
                    distance_cm,
                } => {
                    // Clone the callback out so it runs without the table locked.
                    let callback = lock(&shared.pins).callback(trigger_pin);
                    match callback {
                        Some(cb) => cb(SonarPayload::sonar(trigger_pin, distance_cm)),
                        None => trace!(trigger_pin, "report for unbound pin discarded"),
                    }
                }
                other => trace!(message = ?other, "ignored firmata message"),
            }
        }
    }
    debug!(port = %port_name, "firmata reader stopped");
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

fn classify_open_error(port_name: &str, e: serialport::Error) -> SonarError {
    match e.kind() {
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            SonarError::DeviceNotReady(format!("{port_name} is not available: {e}"))
        }
        _ => SonarError::BridgeConnection(format!("cannot open {port_name}: {e}")),
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Port discovery
// ────────────────────────────────────────────────────────────────────────────

/// A serial port as seen by the host, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSummary {
    pub port_name: String,
    pub kind: &'static str,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl fmt::Display for PortSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.port_name, self.kind)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " (VID: 0x{vid:04x}, PID: 0x{pid:04x})")?;
        }
        if let Some(product) = &self.product {
            write!(f, " {product}")?;
        }
        Ok(())
    }
}

/// Enumerate the serial ports visible to the host.
///
/// # Errors
///
/// [`SonarError::BridgeConnection`] if the platform enumeration fails.
pub fn list_ports() -> Result<Vec<PortSummary>, SonarError> {
    let ports = serialport::available_ports()
        .map_err(|e| SonarError::BridgeConnection(format!("cannot enumerate serial ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(info) => PortSummary {
                port_name: port.port_name,
                kind: "USB",
                vid: Some(info.vid),
                pid: Some(info.pid),
                manufacturer: info.manufacturer,
                product: info.product,
                serial_number: info.serial_number,
            },
            other => PortSummary {
                port_name: port.port_name,
                kind: match other {
                    SerialPortType::BluetoothPort => "Bluetooth",
                    SerialPortType::PciPort => "PCI",
                    _ => "Unknown",
                },
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            },
        })
        .collect())
}

/// First USB port whose vendor id is in `vendor_ids`.
pub fn select_port(ports: &[PortSummary], vendor_ids: &[u16]) -> Option<String> {
    ports
        .iter()
        .find(|p| p.vid.is_some_and(|vid| vendor_ids.contains(&vid)))
        .map(|p| p.port_name.clone())
}
