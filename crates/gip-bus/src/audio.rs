//! Audio plumbing — negotiation, the outbound PCM ring, and the 8 ms
//! transmit timer.
//!
//! Negotiation is proposal-based: the host proposes a format pair, the
//! device either accepts by reporting volume or counters with its own
//! pair, which the host re-accepts. Only after acceptance are the audio
//! paths initialised and the timer started.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use gip_core::audio::{AudioConfig, INTERVAL_MS};
use gip_core::message::AudioControl;
use gip_core::wire::cmd;

use crate::adapter::Adapter;
use crate::client::Client;
use crate::error::BusError;
use crate::transport::TransportError;

// ── Ring buffer ───────────────────────────────────────────────────────────────

const DEFAULT_RING_CAPACITY: usize = 16384;

/// Outbound PCM shuttle between a driver's sound interface and the
/// transmit timer. Oldest data is dropped on overflow; audio prefers
/// freshness over completeness.
pub struct AudioRing {
    inner: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl AudioRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub(crate) fn with_default_capacity() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }

    /// Append PCM bytes, discarding the oldest data beyond capacity.
    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.extend(bytes.iter().copied());
        while inner.len() > self.capacity {
            inner.pop_front();
        }
    }

    /// Move up to `out.len()` bytes into `out`, returning how many were
    /// available. The remainder of `out` is untouched.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = out.len().min(inner.len());
        for slot in out.iter_mut().take(count) {
            // The ring was checked non-empty for `count` elements.
            if let Some(byte) = inner.pop_front() {
                *slot = byte;
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Inbound framing ───────────────────────────────────────────────────────────

/// Strip the length prefix off an inbound audio samples payload: two
/// bytes normally, four on extended wireless packets.
pub(crate) fn strip_sample_prefix(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() < 2 {
        return None;
    }
    let declared = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    if payload.len() == declared + 2 {
        Some(&payload[2..])
    } else if payload.len() == declared + 4 {
        Some(&payload[4..])
    } else {
        None
    }
}

// ── Negotiation ───────────────────────────────────────────────────────────────

pub(crate) async fn handle_control(
    adapter: &Adapter,
    client: &Arc<Client>,
    payload: &[u8],
) -> Result<(), BusError> {
    let control = AudioControl::parse(payload)?;
    match control {
        AudioControl::Volume { .. } => {
            let pending = client.state.lock().unwrap().pending_audio;
            let Some((inbound, outbound)) = pending else {
                tracing::trace!(client = client.id(), "volume report outside negotiation");
                return Ok(());
            };
            if client.audio_configs().is_some() {
                return Ok(());
            }
            accept(adapter, client, inbound, outbound).await
        }
        AudioControl::Format { inbound, outbound }
        | AudioControl::FormatChat { inbound, outbound } => {
            // Counter-proposal: adopt the device's pair and echo it back.
            tracing::debug!(client = client.id(),
                inbound = format_args!("0x{inbound:02x}"),
                outbound = format_args!("0x{outbound:02x}"),
                "device countered audio format, re-accepting");
            client.state.lock().unwrap().pending_audio = Some((inbound, outbound));
            let echo = match control {
                AudioControl::FormatChat { .. } => AudioControl::FormatChat { inbound, outbound },
                _ => AudioControl::Format { inbound, outbound },
            };
            adapter.send_internal(client.id(), cmd::AUDIO_CONTROL, &echo.build())
        }
        AudioControl::Unknown { subcommand } => {
            tracing::trace!(client = client.id(),
                subcommand = format_args!("0x{subcommand:02x}"),
                "unhandled audio control");
            Ok(())
        }
    }
}

/// Both sides agree on the format pair: derive the buffer geometry, bring
/// the transport's audio paths up, and start the transmit timer.
async fn accept(
    adapter: &Adapter,
    client: &Arc<Client>,
    inbound: u8,
    outbound: u8,
) -> Result<(), BusError> {
    let packet_count = adapter.audio_packet_count();
    let mut config_in = AudioConfig::derive(inbound, packet_count)?;
    let mut config_out = AudioConfig::derive(outbound, packet_count)?;
    config_in.valid = true;
    config_out.valid = true;

    {
        let mut state = client.state.lock().unwrap();
        state.audio_in = Some(config_in);
        state.audio_out = Some(config_out);
        state.pending_audio = None;
    }
    tracing::info!(client = client.id(),
        inbound = format_args!("0x{inbound:02x}"),
        outbound = format_args!("0x{outbound:02x}"),
        fragment = config_out.fragment_size,
        "audio formats accepted");

    match adapter.transport().enable_audio() {
        Ok(()) => {}
        Err(TransportError::Unsupported) => {
            tracing::debug!(client = client.id(), "transport has no audio channel");
            return Ok(());
        }
        Err(error) => return Err(BusError::Transport(error)),
    }
    if let Err(error) = adapter.transport().init_audio_in() {
        tracing::warn!(client = client.id(), %error, "audio input init failed");
    }
    if let Err(error) = adapter.transport().init_audio_out(config_out.packet_size) {
        tracing::warn!(client = client.id(), %error, "audio output init failed");
    }

    let task = spawn_transmit(
        adapter.adapter_weak(),
        Arc::downgrade(client),
        config_out,
        packet_count,
    );
    *client.audio_task.lock().unwrap() = Some(task);

    adapter
        .driver_op(client, |driver, client_ref| driver.audio_ready(client_ref))
        .await;
    Ok(())
}

// ── Transmit timer ────────────────────────────────────────────────────────────

/// Monotonic 8 ms timer draining the client's ring into audio bursts.
/// Buffer starvation is transient (retried next tick); anything else
/// stops the timer.
fn spawn_transmit(
    adapter: Weak<Adapter>,
    client: Weak<Client>,
    config: AudioConfig,
    packet_count: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(INTERVAL_MS as u64));
        let mut scratch = vec![0u8; config.fragment_size * packet_count];
        loop {
            interval.tick().await;
            let Some(adapter) = adapter.upgrade() else {
                break;
            };
            let Some(client) = client.upgrade() else {
                break;
            };
            scratch.fill(0);
            client.audio_ring().read_into(&mut scratch);
            match adapter.send_audio_burst(client.id(), &scratch, &config) {
                Ok(()) => {}
                Err(BusError::NoTxBuffer) => {
                    tracing::trace!(client = client.id(), "audio tx starved, retrying next tick");
                }
                Err(error) => {
                    tracing::warn!(client = client.id(), %error,
                        "audio transmit failed, stopping timer");
                    break;
                }
            }
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
