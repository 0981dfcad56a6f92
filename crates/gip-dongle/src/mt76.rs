//! Radio DMA framing — the contract between this core and the external
//! MT76-family radio MAC.
//!
//! Bulk RX hands us a 4-byte little-endian info word (payload length in
//! the low bits, message kind in the top two) followed by the payload:
//! an 802.11 frame, a command response, or an event. Bulk TX takes the
//! same info word wrapping a per-client transmit descriptor.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::DongleError;
use crate::mac::{self, MacAddr};

// ── Info word ─────────────────────────────────────────────────────────────────

const LEN_MASK: u32 = 0x3fff;
const KIND_SHIFT: u32 = 30;

const KIND_FRAME: u32 = 0;
const KIND_CMD_RESPONSE: u32 = 1;
const KIND_EVENT: u32 = 2;

// ── Events ────────────────────────────────────────────────────────────────────

/// Pairing button pressed on the dongle.
pub const EVT_BUTTON: u8 = 0x04;
/// Wrapped 802.11 frame delivered as an event.
pub const EVT_PACKET_RX: u8 = 0x0c;
/// The radio gave up on a client; body carries the WCID.
pub const EVT_CLIENT_LOST: u8 = 0x0e;

/// One demultiplexed bulk RX message.
#[derive(Debug, PartialEq, Eq)]
pub enum RxMessage<'a> {
    Frame(&'a [u8]),
    CommandResponse(&'a [u8]),
    Event { kind: u8, body: &'a [u8] },
}

/// Split a bulk RX transfer into its message.
pub fn parse_rx(bytes: &[u8]) -> Result<RxMessage<'_>, DongleError> {
    if bytes.len() < 4 {
        return Err(DongleError::MalformedFrame);
    }
    let info = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let len = (info & LEN_MASK) as usize;
    let payload = bytes.get(4..4 + len).ok_or(DongleError::MalformedFrame)?;

    match info >> KIND_SHIFT {
        KIND_FRAME => Ok(RxMessage::Frame(payload)),
        KIND_CMD_RESPONSE => Ok(RxMessage::CommandResponse(payload)),
        KIND_EVENT => {
            let (kind, body) = payload.split_first().ok_or(DongleError::MalformedFrame)?;
            Ok(RxMessage::Event { kind: *kind, body })
        }
        _ => Err(DongleError::MalformedFrame),
    }
}

fn info_word(kind: u32, len: usize) -> [u8; 4] {
    ((kind << KIND_SHIFT) | (len as u32 & LEN_MASK)).to_le_bytes()
}

// ── Transmit descriptors ──────────────────────────────────────────────────────

/// Data queue in the WCID descriptor.
pub const QUEUE_DATA: u8 = 0x00;
/// Audio queue — kept apart so audio never queues behind bulk data.
pub const QUEUE_AUDIO: u8 = 0x02;

/// Per-client routing descriptor preceding every TX frame.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct WcidDescriptor {
    pub wcid: u8,
    pub queue: u8,
    pub reserved: [u8; 6],
}

assert_eq_size!(WcidDescriptor, [u8; 8]);

/// MT76 transmit wireless info.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Txwi {
    pub flags: U16<LittleEndian>,
    pub rate: U16<LittleEndian>,
    pub ack_ctl: u8,
    pub wcid: u8,
    pub len: U16<LittleEndian>,
}

assert_eq_size!(Txwi, [u8; 8]);

/// Assemble a complete bulk TX transfer carrying GIP bytes to one
/// client: info word, WCID descriptor, TXWI, QoS header, a 2-byte pad,
/// and the payload, padded out to a 4-byte boundary.
pub fn build_client_frame(
    wcid: u8,
    queue: u8,
    destination: MacAddr,
    source: MacAddr,
    protected: bool,
    payload: &[u8],
) -> Vec<u8> {
    let descriptor = WcidDescriptor {
        wcid,
        queue,
        reserved: [0; 6],
    };
    let wire_len = mac::QOS_HEADER_LEN + 2 + payload.len();
    let txwi = Txwi {
        flags: U16::new(0),
        rate: U16::new(0),
        ack_ctl: 0,
        wcid,
        len: U16::new(wire_len as u16),
    };
    let header = mac::build_qos_data_header(destination, source, protected);

    let body_len = 8 + 8 + wire_len;
    let mut frame = Vec::with_capacity(4 + body_len + 3);
    frame.extend_from_slice(&info_word(KIND_FRAME, body_len));
    frame.extend_from_slice(descriptor.as_bytes());
    frame.extend_from_slice(txwi.as_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&[0u8; 2]);
    frame.extend_from_slice(payload);
    while frame.len() % 4 != 0 {
        frame.push(0);
    }
    frame
}

/// Wrap an event payload the way the radio does. Test infrastructure for
/// the dispatch engine.
pub fn build_event(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 1 + body.len());
    bytes.extend_from_slice(&info_word(KIND_EVENT, 1 + body.len()));
    bytes.push(kind);
    bytes.extend_from_slice(body);
    bytes
}

/// Wrap an 802.11 frame the way the radio does on RX.
pub fn build_rx_frame(frame: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + frame.len());
    bytes.extend_from_slice(&info_word(KIND_FRAME, frame.len()));
    bytes.extend_from_slice(frame);
    bytes
}
