//! Audio format codes and buffer geometry.
//!
//! GIP audio runs in fixed 8 ms fragments; everything here derives from
//! the format code and the transport's packets-per-interval count.

use crate::wire::coherent_header_len;

/// Chat headset audio, 16 kHz mono.
pub const FORMAT_CHAT_16KHZ: u8 = 0x04;
/// 24 kHz mono.
pub const FORMAT_MONO_24KHZ: u8 = 0x09;
/// 48 kHz stereo.
pub const FORMAT_STEREO_48KHZ: u8 = 0x10;

/// Length of one audio interval in milliseconds.
pub const INTERVAL_MS: u32 = 8;

/// Samples are signed 16-bit PCM.
const BYTES_PER_SAMPLE: u32 = 2;

/// Channel count and sample rate for a format code.
pub fn format_params(format: u8) -> Result<(u32, u32), AudioError> {
    match format {
        FORMAT_CHAT_16KHZ => Ok((1, 16_000)),
        FORMAT_MONO_24KHZ => Ok((1, 24_000)),
        FORMAT_STEREO_48KHZ => Ok((2, 48_000)),
        other => Err(AudioError::UnsupportedFormat(other)),
    }
}

/// A negotiated audio direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    pub format: u8,
    pub channels: u32,
    pub sample_rate: u32,
    /// PCM bytes per 8 ms interval.
    pub buffer_size: usize,
    /// PCM bytes per packet within the interval.
    pub fragment_size: usize,
    /// On-wire packet size: encoded header plus fragment.
    pub packet_size: usize,
    /// Set once both sides have accepted the format.
    pub valid: bool,
}

impl AudioConfig {
    /// Derive the buffer geometry for a format code, splitting each 8 ms
    /// interval across `packet_count` packets.
    pub fn derive(format: u8, packet_count: usize) -> Result<Self, AudioError> {
        let (channels, sample_rate) = format_params(format)?;
        let buffer_size = (sample_rate * channels * BYTES_PER_SAMPLE * INTERVAL_MS / 1000) as usize;
        let fragment_size = buffer_size / packet_count.max(1);
        let packet_size = coherent_header_len(fragment_size as u32) + fragment_size;
        Ok(Self {
            format,
            channels,
            sample_rate,
            buffer_size,
            fragment_size,
            packet_size,
            valid: false,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("unsupported audio format code 0x{0:02x}")]
    UnsupportedFormat(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
