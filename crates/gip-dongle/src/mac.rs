//! 802.11 framing, limited to what the dongle link actually uses:
//! association management frames, the reserved pairing subtype, and
//! QoS data frames carrying GIP bytes.

/// A 6-byte 802.11 address.
pub type MacAddr = [u8; 6];

pub const BCAST_ADDR: MacAddr = [0xff; 6];

// IEEE Std 802.11-2016, 9.2.4.1.3
pub const FRAME_TYPE_MGMT: u16 = 0;
pub const FRAME_TYPE_DATA: u16 = 2;

pub const MGMT_SUBTYPE_ASSOC_REQ: u16 = 0x00;
pub const MGMT_SUBTYPE_DISASSOC: u16 = 0x0a;
/// Reserved management subtype the accessories use for pair requests.
pub const MGMT_SUBTYPE_PAIR: u16 = 0x07;

pub const DATA_SUBTYPE_QOS_DATA: u16 = 0x08;

/// Payload byte identifying a pair request inside the reserved subtype.
pub const PAIR_REQUEST_BYTE: u8 = 0x01;

const FC_FROM_DS: u16 = 1 << 9;
const FC_PROTECTED: u16 = 1 << 14;

/// The leading 16-bit frame control field (little-endian on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl(pub u16);

impl FrameControl {
    pub fn new(frame_type: u16, subtype: u16) -> Self {
        Self(((frame_type & 3) << 2) | ((subtype & 0xf) << 4))
    }

    pub fn frame_type(&self) -> u16 {
        (self.0 >> 2) & 3
    }

    pub fn subtype(&self) -> u16 {
        (self.0 >> 4) & 0xf
    }

    pub fn from_ds(&self) -> bool {
        self.0 & FC_FROM_DS != 0
    }

    pub fn protected(&self) -> bool {
        self.0 & FC_PROTECTED != 0
    }

    pub fn with_from_ds(mut self) -> Self {
        self.0 |= FC_FROM_DS;
        self
    }

    pub fn with_protected(mut self, protected: bool) -> Self {
        if protected {
            self.0 |= FC_PROTECTED;
        }
        self
    }
}

/// Length of the basic management/data header.
pub const HEADER_LEN: usize = 24;
/// Data header plus the QoS control field.
pub const QOS_HEADER_LEN: usize = 26;

/// A parsed inbound frame. `body` starts after the (QoS-aware) header.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub frame_control: FrameControl,
    /// Receiver address.
    pub addr1: MacAddr,
    /// Transmitter address — the accessory's MAC on inbound frames.
    pub addr2: MacAddr,
    /// BSSID.
    pub addr3: MacAddr,
    pub body: &'a [u8],
}

pub fn parse_frame(bytes: &[u8]) -> Option<Frame<'_>> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let frame_control = FrameControl(u16::from_le_bytes([bytes[0], bytes[1]]));

    let mut addr = [[0u8; 6]; 3];
    for (index, slot) in addr.iter_mut().enumerate() {
        slot.copy_from_slice(&bytes[4 + index * 6..10 + index * 6]);
    }

    let qos = frame_control.frame_type() == FRAME_TYPE_DATA
        && frame_control.subtype() == DATA_SUBTYPE_QOS_DATA;
    let body_start = if qos { QOS_HEADER_LEN } else { HEADER_LEN };
    if bytes.len() < body_start {
        return None;
    }

    Some(Frame {
        frame_control,
        addr1: addr[0],
        addr2: addr[1],
        addr3: addr[2],
        body: &bytes[body_start..],
    })
}

/// Build the QoS data header for a host-to-client frame: From-DS, the
/// client as destination, the dongle as source and BSSID, Protected when
/// the link key is installed. Sequence and QoS control are left for the
/// radio MAC to fill.
pub fn build_qos_data_header(
    destination: MacAddr,
    source: MacAddr,
    protected: bool,
) -> [u8; QOS_HEADER_LEN] {
    let frame_control = FrameControl::new(FRAME_TYPE_DATA, DATA_SUBTYPE_QOS_DATA)
        .with_from_ds()
        .with_protected(protected);

    let mut header = [0u8; QOS_HEADER_LEN];
    header[..2].copy_from_slice(&frame_control.0.to_le_bytes());
    header[4..10].copy_from_slice(&destination);
    header[10..16].copy_from_slice(&source);
    header[16..22].copy_from_slice(&source);
    header
}
