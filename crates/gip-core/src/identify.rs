//! Identify blob parser.
//!
//! The Identify response is a self-describing capability blob: a 16-byte
//! prefix, an offset table, then the sub-tables the offsets point at.
//! Devices in the wild ship blobs with absent tables (offset zero) and
//! with offsets pointing anywhere, so every region is bounds-checked
//! against the full blob before a byte of it is read.

// Offset-table slots, in wire order.
const SLOT_EXTERNAL_COMMANDS: usize = 0;
const SLOT_FIRMWARE_VERSIONS: usize = 1;
const SLOT_AUDIO_FORMATS: usize = 2;
const SLOT_CAPABILITIES_OUT: usize = 3;
const SLOT_CAPABILITIES_IN: usize = 4;
const SLOT_CLASSES: usize = 5;
const SLOT_INTERFACES: usize = 6;
const SLOT_HID_DESCRIPTOR: usize = 7;

const PREFIX_LEN: usize = 16;
const OFFSET_TABLE_LEN: usize = 16;

/// Descriptor of one external command the device understands.
/// The layout beyond the leading command byte is vendor-defined; the raw
/// bytes are kept for drivers that know more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub raw: [u8; 24],
}

impl CommandDescriptor {
    pub const WIRE_LEN: usize = 24;

    pub fn command(&self) -> u8 {
        self.raw[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
}

/// One advertised audio format pair: device input (microphone) code and
/// device output (speaker) code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormatPair {
    pub inbound: u8,
    pub outbound: u8,
}

/// Everything a client told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyData {
    pub external_commands: Option<Vec<CommandDescriptor>>,
    pub firmware_versions: Option<Vec<FirmwareVersion>>,
    pub audio_formats: Option<Vec<AudioFormatPair>>,
    pub capabilities_out: Option<Vec<u8>>,
    pub capabilities_in: Option<Vec<u8>>,
    pub classes: Option<Vec<String>>,
    pub interfaces: Option<Vec<[u8; 16]>>,
    pub hid_descriptor: Option<Vec<u8>>,
}

impl IdentifyData {
    pub fn parse(blob: &[u8]) -> Result<Self, IdentifyError> {
        if blob.len() < PREFIX_LEN + OFFSET_TABLE_LEN {
            return Err(IdentifyError::TooShort(blob.len()));
        }

        let mut offsets = [0usize; 8];
        for (slot, offset) in offsets.iter_mut().enumerate() {
            let at = PREFIX_LEN + slot * 2;
            *offset = u16::from_le_bytes([blob[at], blob[at + 1]]) as usize;
        }

        Ok(Self {
            external_commands: fixed_table(
                blob,
                offsets[SLOT_EXTERNAL_COMMANDS],
                CommandDescriptor::WIRE_LEN,
                "external commands",
            )?
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        let mut raw = [0u8; 24];
                        raw.copy_from_slice(item);
                        CommandDescriptor { raw }
                    })
                    .collect()
            }),
            firmware_versions: fixed_table(
                blob,
                offsets[SLOT_FIRMWARE_VERSIONS],
                4,
                "firmware versions",
            )?
            .map(|items| {
                items
                    .iter()
                    .map(|item| FirmwareVersion {
                        major: u16::from_le_bytes([item[0], item[1]]),
                        minor: u16::from_le_bytes([item[2], item[3]]),
                    })
                    .collect()
            }),
            audio_formats: fixed_table(blob, offsets[SLOT_AUDIO_FORMATS], 2, "audio formats")?
                .map(|items| {
                    items
                        .iter()
                        .map(|item| AudioFormatPair {
                            inbound: item[0],
                            outbound: item[1],
                        })
                        .collect()
                }),
            capabilities_out: fixed_table(
                blob,
                offsets[SLOT_CAPABILITIES_OUT],
                1,
                "output capabilities",
            )?
            .map(|items| items.iter().map(|item| item[0]).collect()),
            capabilities_in: fixed_table(
                blob,
                offsets[SLOT_CAPABILITIES_IN],
                1,
                "input capabilities",
            )?
            .map(|items| items.iter().map(|item| item[0]).collect()),
            classes: class_table(blob, offsets[SLOT_CLASSES])?,
            interfaces: fixed_table(blob, offsets[SLOT_INTERFACES], 16, "interfaces")?.map(
                |items| {
                    items
                        .iter()
                        .map(|item| {
                            let mut guid = [0u8; 16];
                            guid.copy_from_slice(item);
                            guid
                        })
                        .collect()
                },
            ),
            hid_descriptor: fixed_table(blob, offsets[SLOT_HID_DESCRIPTOR], 1, "hid descriptor")?
                .map(|items| items.iter().map(|item| item[0]).collect()),
        })
    }

    /// Class list, empty when the table was absent.
    pub fn class_names(&self) -> &[String] {
        self.classes.as_deref().unwrap_or(&[])
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.class_names().iter().any(|class| class == name)
    }

    /// First advertised audio format pair, if the device does audio.
    pub fn preferred_audio_format(&self) -> Option<AudioFormatPair> {
        self.audio_formats.as_ref().and_then(|fmts| fmts.first().copied())
    }
}

/// Read a `count` byte plus `count` fixed-size items at `offset`.
/// A zero offset means the table is absent.
fn fixed_table<'a>(
    blob: &'a [u8],
    offset: usize,
    item_len: usize,
    table: &'static str,
) -> Result<Option<Vec<&'a [u8]>>, IdentifyError> {
    if offset == 0 {
        return Ok(None);
    }
    let count = *blob.get(offset).ok_or(IdentifyError::OutOfBounds {
        table,
        offset,
        len: blob.len(),
    })? as usize;

    let start = offset + 1;
    let end = start + count * item_len;
    if end > blob.len() {
        return Err(IdentifyError::OutOfBounds {
            table,
            offset,
            len: blob.len(),
        });
    }

    Ok(Some(
        (0..count)
            .map(|i| &blob[start + i * item_len..start + (i + 1) * item_len])
            .collect(),
    ))
}

/// Classes are a count byte followed by length-prefixed UTF-8 strings.
fn class_table(blob: &[u8], offset: usize) -> Result<Option<Vec<String>>, IdentifyError> {
    if offset == 0 {
        return Ok(None);
    }
    let oob = || IdentifyError::OutOfBounds {
        table: "classes",
        offset,
        len: blob.len(),
    };

    let count = *blob.get(offset).ok_or_else(oob)? as usize;
    let mut classes = Vec::with_capacity(count);
    let mut pos = offset + 1;
    for _ in 0..count {
        let strlen = *blob.get(pos).ok_or_else(oob)? as usize;
        let start = pos + 1;
        let end = start + strlen;
        let bytes = blob.get(start..end).ok_or_else(oob)?;
        let class = std::str::from_utf8(bytes)
            .map_err(|_| IdentifyError::BadClassString)?
            .to_owned();
        classes.push(class);
        pos = end;
    }
    Ok(Some(classes))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifyError {
    #[error("identify blob too short for offset table ({0} bytes)")]
    TooShort(usize),

    #[error("identify {table} table at offset {offset} overruns blob of {len} bytes")]
    OutOfBounds {
        table: &'static str,
        offset: usize,
        len: usize,
    },

    #[error("identify class string is not valid UTF-8")]
    BadClassString,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
