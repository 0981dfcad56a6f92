//! Typed payloads for the internal GIP commands.
//!
//! Fixed-layout payloads built by the host (acknowledgements, rumble,
//! LED) are zerocopy structs with compile-time size guards; payloads
//! parsed off the wire use explicit byte cursors, since devices routinely
//! append vendor padding that a reinterpret-cast would trip over.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Power ─────────────────────────────────────────────────────────────────────

/// Power mode carried by the one-byte Power payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerMode {
    On = 0x00,
    Sleep = 0x01,
    Off = 0x04,
    Reset = 0x07,
}

impl PowerMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::On),
            0x01 => Some(Self::Sleep),
            0x04 => Some(Self::Off),
            0x07 => Some(Self::Reset),
            _ => None,
        }
    }
}

// ── Announce ──────────────────────────────────────────────────────────────────

/// Four-part version number used for firmware and hardware revisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

/// Parsed Announce payload — the first packet a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub address: [u8; 6],
    pub vendor: u16,
    pub product: u16,
    pub firmware: Version,
    pub hardware: Version,
}

impl Announce {
    pub const WIRE_LEN: usize = 28;

    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(payload, "announce");
        let mut address = [0u8; 6];
        r.bytes(&mut address)?;
        r.skip(2)?; // reserved
        let vendor = r.u16_le()?;
        let product = r.u16_le()?;
        let firmware = r.version()?;
        let hardware = r.version()?;
        Ok(Self {
            address,
            vendor,
            product,
            firmware,
            hardware,
        })
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

const STATUS_CONNECTED: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryType {
    None,
    Standard,
    Rechargeable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    Low,
    Normal,
    High,
    Full,
}

/// Power-supply status derived from the battery type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    NotCharging,
    Discharging,
}

/// Decoded battery fields of a Status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    pub kind: BatteryType,
    pub level: BatteryLevel,
}

impl BatteryStatus {
    /// Battery type in bits 2..3, level in bits 0..1.
    pub fn from_status_byte(status: u8) -> Self {
        let kind = match (status >> 2) & 3 {
            0 => BatteryType::None,
            1 => BatteryType::Standard,
            2 => BatteryType::Rechargeable,
            _ => BatteryType::Unknown,
        };
        let level = match status & 3 {
            0 => BatteryLevel::Low,
            1 => BatteryLevel::Normal,
            2 => BatteryLevel::High,
            _ => BatteryLevel::Full,
        };
        Self { kind, level }
    }

    pub fn charge_status(&self) -> ChargeStatus {
        match self.kind {
            BatteryType::None => ChargeStatus::NotCharging,
            _ => ChargeStatus::Discharging,
        }
    }
}

/// Parsed Status payload. Devices pad this with vendor bytes; only the
/// first byte carries meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub connected: bool,
    pub battery: BatteryStatus,
}

impl Status {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let status = *payload.first().ok_or(MessageError::Truncated {
            what: "status",
            need: 1,
            have: 0,
        })?;
        Ok(Self {
            connected: status & STATUS_CONNECTED != 0,
            battery: BatteryStatus::from_status_byte(status),
        })
    }

    /// Status byte for the given fields. Used by hosts emulating a device
    /// in tests and by the dongle's synthesized disconnect beacons.
    pub fn to_status_byte(connected: bool, battery: BatteryStatus) -> u8 {
        let kind = match battery.kind {
            BatteryType::None => 0,
            BatteryType::Standard => 1,
            BatteryType::Rechargeable => 2,
            BatteryType::Unknown => 3,
        };
        let level = match battery.level {
            BatteryLevel::Low => 0,
            BatteryLevel::Normal => 1,
            BatteryLevel::High => 2,
            BatteryLevel::Full => 3,
        };
        (if connected { STATUS_CONNECTED } else { 0 }) | (kind << 2) | level
    }
}

// ── Virtual keys ──────────────────────────────────────────────────────────────

/// The guide (Xbox) button arrives as a virtual key.
pub const VIRTUAL_KEY_GUIDE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualKey {
    pub key: u8,
    pub pressed: bool,
}

impl VirtualKey {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() < 2 {
            return Err(MessageError::Truncated {
                what: "virtual key",
                need: 2,
                have: payload.len(),
            });
        }
        Ok(Self {
            key: payload[0],
            pressed: payload[1] != 0,
        })
    }
}

// ── Audio control ─────────────────────────────────────────────────────────────

/// AudioControl subcommand bytes.
pub mod audio_ctl {
    /// Format proposal / counter-proposal.
    pub const FORMAT: u8 = 0x01;
    /// Format proposal for chat headsets.
    pub const FORMAT_CHAT: u8 = 0x02;
    /// Volume report; doubles as format acceptance.
    pub const VOLUME: u8 = 0x05;
}

/// Parsed AudioControl payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioControl {
    Format { inbound: u8, outbound: u8 },
    FormatChat { inbound: u8, outbound: u8 },
    Volume { inbound: u8, outbound: u8 },
    Unknown { subcommand: u8 },
}

impl AudioControl {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let sub = *payload.first().ok_or(MessageError::Truncated {
            what: "audio control",
            need: 1,
            have: 0,
        })?;
        let pair = |what| -> Result<(u8, u8), MessageError> {
            if payload.len() < 3 {
                return Err(MessageError::Truncated {
                    what,
                    need: 3,
                    have: payload.len(),
                });
            }
            Ok((payload[1], payload[2]))
        };
        Ok(match sub {
            audio_ctl::FORMAT => {
                let (inbound, outbound) = pair("audio format")?;
                Self::Format { inbound, outbound }
            }
            audio_ctl::FORMAT_CHAT => {
                let (inbound, outbound) = pair("audio chat format")?;
                Self::FormatChat { inbound, outbound }
            }
            audio_ctl::VOLUME => {
                let (inbound, outbound) = pair("audio volume")?;
                Self::Volume { inbound, outbound }
            }
            subcommand => Self::Unknown { subcommand },
        })
    }

    pub fn build(&self) -> Vec<u8> {
        match *self {
            Self::Format { inbound, outbound } => vec![audio_ctl::FORMAT, inbound, outbound],
            Self::FormatChat { inbound, outbound } => {
                vec![audio_ctl::FORMAT_CHAT, inbound, outbound]
            }
            Self::Volume { inbound, outbound } => {
                // Trailing pair is the mute flags, always clear from the host.
                vec![audio_ctl::VOLUME, inbound, outbound, 0x00, 0x00]
            }
            Self::Unknown { subcommand } => vec![subcommand],
        }
    }
}

// ── Host-built fixed payloads ─────────────────────────────────────────────────

/// Acknowledgement payload. Echoes the acknowledged command and reports
/// running byte totals for chunked transfers.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AckPayload {
    pub reserved: u8,
    /// Command byte of the packet being acknowledged.
    pub command: u8,
    /// Options byte of the acknowledgement context (internal flag plus
    /// the client id nibble).
    pub options: u8,
    /// Bytes received so far, this packet included.
    pub received: U16<LittleEndian>,
    pub padding: [u8; 2],
    /// Bytes still outstanding in the declared chunk total.
    pub remaining: U16<LittleEndian>,
}

assert_eq_size!(AckPayload, [u8; 9]);

/// LED payload: reserved byte, mode (0..9), brightness.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LedPayload {
    pub reserved: u8,
    pub mode: u8,
    pub brightness: u8,
}

assert_eq_size!(LedPayload, [u8; 3]);

/// Rumble payload: motor select plus four magnitudes and a pulse pattern.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RumblePayload {
    pub motors: u8,
    pub trigger_left: u8,
    pub trigger_right: u8,
    pub left: u8,
    pub right: u8,
    pub duration: u8,
    pub delay: u8,
    pub repeat: u8,
}

assert_eq_size!(RumblePayload, [u8; 8]);

/// All rumble motors selected.
pub const RUMBLE_MOTORS_ALL: u8 = 0x0f;

// ── Cursor ────────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(MessageError::Truncated {
                what: self.what,
                need: end,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn bytes(&mut self, out: &mut [u8]) -> Result<(), MessageError> {
        let slice = self.take(out.len())?;
        out.copy_from_slice(slice);
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<(), MessageError> {
        self.take(n).map(|_| ())
    }

    fn u16_le(&mut self) -> Result<u16, MessageError> {
        let slice = self.take(2)?;
        Ok(u16::from_le_bytes([slice[0], slice[1]]))
    }

    fn version(&mut self) -> Result<Version, MessageError> {
        Ok(Version {
            major: self.u16_le()?,
            minor: self.u16_le()?,
            build: self.u16_le()?,
            revision: self.u16_le()?,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("{what} payload too short ({have} of {need} bytes)")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
