//! GIP wire format — the variable-length packet header every GIP frame
//! carries on the transport.
//!
//! These definitions ARE the protocol. Every command code, flag bit, and
//! varint rule here is part of the wire format shared with the devices;
//! nothing in this module may change without breaking real hardware.
//!
//! The header is variable-layout (varint length fields, conditional
//! chunk-offset, even-length padding), so it is parsed and built with an
//! explicit byte cursor rather than a reinterpreted struct. There is no
//! unsafe code in this module.

// ── Command codes ─────────────────────────────────────────────────────────────

/// Internal protocol commands. All of these are sent and received with the
/// [`FLAG_INTERNAL`] bit set in the options byte.
pub mod cmd {
    /// Acknowledgement of a packet that requested one.
    pub const ACKNOWLEDGE: u8 = 0x01;
    /// Device announcement — hardware identity, first packet of a client.
    pub const ANNOUNCE: u8 = 0x02;
    /// Periodic status beacon — connection bit plus battery fields.
    pub const STATUS: u8 = 0x03;
    /// Capability blob request/response.
    pub const IDENTIFY: u8 = 0x04;
    /// Power mode change, host to device.
    pub const POWER: u8 = 0x05;
    /// Authentication handshake carrier.
    pub const AUTHENTICATE: u8 = 0x06;
    /// Guide button and friends.
    pub const VIRTUAL_KEY: u8 = 0x07;
    /// Audio format negotiation and volume.
    pub const AUDIO_CONTROL: u8 = 0x08;
    /// Rumble, host to device. External command.
    pub const RUMBLE: u8 = 0x09;
    /// LED mode and brightness, host to device.
    pub const LED: u8 = 0x0a;
    /// Raw HID report passthrough.
    pub const HID_REPORT: u8 = 0x0b;
    /// Gamepad input report. External command.
    pub const INPUT: u8 = 0x20;
    /// PCM audio fragment.
    pub const AUDIO_SAMPLES: u8 = 0x60;
}

// ── Options byte ──────────────────────────────────────────────────────────────

/// The peer wants this packet acknowledged (or this packet is an ACK body
/// chunk carrying the flag as part of the chunk protocol).
pub const FLAG_ACK: u8 = 0x10;
/// Internal protocol command (as opposed to device-class commands).
pub const FLAG_INTERNAL: u8 = 0x20;
/// First chunk of a chunked transfer; chunk-offset holds the declared total.
pub const FLAG_CHUNK_START: u8 = 0x40;
/// Packet belongs to a chunked transfer; a chunk-offset varint follows the
/// length varint in the header.
pub const FLAG_CHUNK: u8 = 0x80;

const CLIENT_MASK: u8 = 0x0f;
const FLAG_MASK: u8 = 0xf0;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Largest payload sent as a single coherent packet. Anything bigger is
/// split into a chunked transfer.
pub const MAX_COHERENT_PAYLOAD: usize = 58;

/// Largest declared total of a chunked transfer.
pub const MAX_CHUNK_TOTAL: usize = 65535;

/// Highest client id carried in the options nibble.
pub const MAX_CLIENTS: usize = 16;

// ── Varints ───────────────────────────────────────────────────────────────────

/// Encode a length field: low seven bits per byte, high bit = more.
pub fn encode_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Number of bytes [`encode_varint`] emits for `value`.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        _ => 4,
    }
}

/// Decode a varint. Returns the value and the bytes consumed.
///
/// A fifth byte is accepted only as the zero pad the even-length rule
/// appends after a continued fourth byte; anything else is an overflow.
pub fn decode_varint(buf: &[u8]) -> Result<(u32, usize), WireError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = *buf.get(i).ok_or(WireError::MalformedHeader)?;
        if i == 4 && byte != 0 {
            return Err(WireError::MalformedHeader);
        }
        value |= u32::from(byte & 0x7f) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(WireError::MalformedHeader)
}

// ── Header ────────────────────────────────────────────────────────────────────

/// A decoded GIP packet header.
///
/// On the wire: command, options (client id low nibble, flags high
/// nibble), sequence, varint packet-length, then a varint chunk-offset
/// when [`FLAG_CHUNK`] is set. The encoded header always has even length;
/// an odd natural length is fixed up by marking the final varint byte
/// continued and appending a zero byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub command: u8,
    pub client_id: u8,
    pub flags: u8,
    pub sequence: u8,
    /// Payload length in bytes, excluding the header.
    pub length: u32,
    /// Present iff [`FLAG_CHUNK`] is set. The start chunk reports the
    /// declared total here; later chunks report their write offset.
    pub chunk_offset: Option<u32>,
}

impl Header {
    /// Header for a coherent (non-chunked) packet.
    pub fn coherent(command: u8, client_id: u8, flags: u8, sequence: u8, length: u32) -> Self {
        Self {
            command,
            client_id,
            flags: flags & FLAG_MASK & !FLAG_CHUNK & !FLAG_CHUNK_START,
            sequence,
            length,
            chunk_offset: None,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_internal(&self) -> bool {
        self.flags & FLAG_INTERNAL != 0
    }

    pub fn is_chunk_start(&self) -> bool {
        self.flags & FLAG_CHUNK_START != 0
    }

    pub fn is_chunk(&self) -> bool {
        self.flags & FLAG_CHUNK != 0
    }

    /// The options byte as it appears on the wire.
    pub fn options(&self) -> u8 {
        (self.flags & FLAG_MASK) | (self.client_id & CLIENT_MASK)
    }

    /// Encoded size of this header, padding included.
    pub fn encoded_len(&self) -> usize {
        let natural = 3
            + varint_len(self.length)
            + self.chunk_offset.map(varint_len).unwrap_or(0);
        natural + natural % 2
    }

    /// Append the encoded header to `out`. The encoding is exactly what
    /// [`Header::decode`] accepts, even-length padding included.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.push(self.command);
        out.push(self.options());
        out.push(self.sequence);
        encode_varint(self.length, out);
        if let Some(offset) = self.chunk_offset {
            encode_varint(offset, out);
        }
        if (out.len() - start) % 2 != 0 {
            if let Some(last) = out.last_mut() {
                *last |= 0x80;
            }
            out.push(0);
        }
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns the header and the number of bytes it occupied. Fails with
    /// [`WireError::MalformedHeader`] when the buffer ends inside the
    /// header or a varint overflows, and with [`WireError::ShortBody`]
    /// when the buffer is shorter than header plus declared length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < 3 {
            return Err(WireError::MalformedHeader);
        }
        let command = buf[0];
        let options = buf[1];
        let sequence = buf[2];

        let mut pos = 3;
        let (length, used) = decode_varint(&buf[pos..])?;
        pos += used;

        let flags = options & FLAG_MASK;
        let chunk_offset = if flags & FLAG_CHUNK != 0 {
            let (offset, used) = decode_varint(&buf[pos..])?;
            pos += used;
            Some(offset)
        } else {
            None
        };

        let need = pos + length as usize;
        if buf.len() < need {
            return Err(WireError::ShortBody {
                need,
                have: buf.len(),
            });
        }

        Ok((
            Self {
                command,
                client_id: options & CLIENT_MASK,
                flags,
                sequence,
                length,
                chunk_offset,
            },
            pos,
        ))
    }
}

/// Encoded header size for a coherent packet of `payload_len` bytes.
/// Used by the audio layer to derive on-wire packet sizes.
pub fn coherent_header_len(payload_len: u32) -> usize {
    let natural = 3 + varint_len(payload_len);
    natural + natural % 2
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors arising while interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed packet header")]
    MalformedHeader,

    #[error("packet body shorter than declared length ({have} of {need} bytes)")]
    ShortBody { need: usize, have: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
