//! FirmataExpress wire codec.
//!
//! Only the subset of the protocol the sonar bridge needs is modelled:
//!
//! | Message | Direction | Bytes |
//! |---|---|---|
//! | firmware query | host → board | `F0 79 F7` |
//! | firmware report | board → host | `F0 79 major minor name… F7` |
//! | sonar config | host → board | `F0 62 trigger echo F7` |
//! | sonar data | board → host | `F0 63 trigger cm_lsb cm_msb F7` |
//! | system reset | host → board | `FF` |
//!
//! Layouts follow the FirmataExpress sketch (`FirmataExpress.ino`, the
//! firmware pymata4 drives): the sonar distance is a 14-bit value split into
//! the usual Firmata 7-bit LSB/MSB pair.
//!
//! Every other message the board may emit (protocol version, analog and
//! digital reports, unknown sysex) is framed correctly and surfaced as
//! [`FirmataMessage::Other`] / [`FirmataMessage::ProtocolVersion`] so the
//! decoder never loses sync.

pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;
pub const REPORT_FIRMWARE: u8 = 0x79;
pub const SONAR_CONFIG: u8 = 0x62;
pub const SONAR_DATA: u8 = 0x63;
pub const PROTOCOL_VERSION: u8 = 0xF9;
pub const SYSTEM_RESET: u8 = 0xFF;

const DIGITAL_MESSAGE: u8 = 0x90;
const ANALOG_MESSAGE: u8 = 0xE0;

/// Longest sysex body accepted before the frame is discarded.
const MAX_SYSEX_LEN: usize = 512;

/// Highest pin number a 7-bit data byte can carry.
pub const MAX_PIN: u8 = sonarlink_types::MAX_PIN;

/// Maximum number of sonars the FirmataExpress sketch can drive.
pub const MAX_SONARS: usize = 6;

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

pub fn firmware_query() -> [u8; 3] {
    [START_SYSEX, REPORT_FIRMWARE, END_SYSEX]
}

/// Configure `trigger_pin`/`echo_pin` as a sonar.  Pins are 7-bit on the
/// wire; callers reject anything above [`MAX_PIN`] first.
pub fn sonar_config(trigger_pin: u8, echo_pin: u8) -> [u8; 5] {
    [START_SYSEX, SONAR_CONFIG, trigger_pin, echo_pin, END_SYSEX]
}

pub fn system_reset() -> [u8; 1] {
    [SYSTEM_RESET]
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// A complete message received from the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmataMessage {
    SonarData { trigger_pin: u8, distance_cm: u32 },
    FirmwareReport { major: u8, minor: u8, name: String },
    ProtocolVersion { major: u8, minor: u8 },
    /// Well-framed message of a kind the bridge ignores.
    Other { command: u8 },
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Idle,
    Sysex,
    Channel { command: u8, remaining: usize },
}

/// Incremental byte-stream decoder.  Feed it whatever the serial port
/// returns; frames may be split across reads arbitrarily.
#[derive(Debug, Default)]
pub struct FirmataDecoder {
    state: DecodeState,
    buf: Vec<u8>,
}

impl FirmataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every complete message contained in `bytes`.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FirmataMessage> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Advance the decoder by one byte.
    pub fn push(&mut self, byte: u8) -> Option<FirmataMessage> {
        match self.state {
            DecodeState::Idle => {
                self.start(byte);
                None
            }
            DecodeState::Sysex => match byte {
                END_SYSEX => {
                    self.state = DecodeState::Idle;
                    Some(parse_sysex(&self.buf))
                }
                b if b & 0x80 != 0 => {
                    // Status byte inside a sysex: the frame was truncated.
                    self.start(b);
                    None
                }
                b => {
                    if self.buf.len() >= MAX_SYSEX_LEN {
                        self.state = DecodeState::Idle;
                        self.buf.clear();
                    } else {
                        self.buf.push(b);
                    }
                    None
                }
            },
            DecodeState::Channel { command, remaining } => {
                if byte & 0x80 != 0 {
                    self.start(byte);
                    return None;
                }
                self.buf.push(byte);
                if remaining > 1 {
                    self.state = DecodeState::Channel {
                        command,
                        remaining: remaining - 1,
                    };
                    return None;
                }
                self.state = DecodeState::Idle;
                Some(match command {
                    PROTOCOL_VERSION => FirmataMessage::ProtocolVersion {
                        major: self.buf[0],
                        minor: self.buf[1],
                    },
                    other => FirmataMessage::Other { command: other },
                })
            }
        }
    }

    fn start(&mut self, byte: u8) {
        self.buf.clear();
        self.state = match byte {
            START_SYSEX => DecodeState::Sysex,
            PROTOCOL_VERSION => DecodeState::Channel {
                command: PROTOCOL_VERSION,
                remaining: 2,
            },
            b if b & 0xF0 == DIGITAL_MESSAGE || b & 0xF0 == ANALOG_MESSAGE => DecodeState::Channel {
                command: b & 0xF0,
                remaining: 2,
            },
            // Stray data bytes and single-byte commands carry nothing for us.
            _ => DecodeState::Idle,
        };
    }
}

fn parse_sysex(body: &[u8]) -> FirmataMessage {
    match body {
        [SONAR_DATA, trigger_pin, lsb, msb, ..] => FirmataMessage::SonarData {
            trigger_pin: *trigger_pin,
            distance_cm: u32::from(*lsb & 0x7F) | (u32::from(*msb & 0x7F) << 7),
        },
        [REPORT_FIRMWARE, major, minor, name @ ..] => FirmataMessage::FirmwareReport {
            major: *major,
            minor: *minor,
            name: decode_7bit_string(name),
        },
        [command, ..] => FirmataMessage::Other { command: *command },
        [] => FirmataMessage::Other { command: 0 },
    }
}

// Firmata strings are sent as LSB/MSB 7-bit pairs per character.
fn decode_7bit_string(bytes: &[u8]) -> String {
    bytes
        .chunks_exact(2)
        .map(|pair| char::from((pair[0] & 0x7F) | ((pair[1] & 0x01) << 7)))
        .collect()
}
