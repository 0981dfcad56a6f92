//! Driver registry and the driver-facing client surface.
//!
//! Drivers declare the device class they handle; the bus matches the
//! class against each Identified client's class list and binds the first
//! driver that matches. Everything a driver may do to its device goes
//! through [`ClientRef`], which is only valid for the duration of the
//! call that handed it over.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use gip_core::audio::FORMAT_CHAT_16KHZ;
use gip_core::identify::AudioFormatPair;
use gip_core::message::{
    audio_ctl, AudioControl, Announce, BatteryStatus, LedPayload, PowerMode, RumblePayload,
};
use gip_core::wire::cmd;
use zerocopy::AsBytes;

use crate::adapter::Adapter;
use crate::audio::AudioRing;
use crate::client::Client;
use crate::error::BusError;

/// Operations a device driver implements. All callbacks run under the
/// client's driver semaphore and must not block.
pub trait Driver: Send + Sync {
    /// Class string this driver binds to, e.g. "Windows.Xbox.Input.Gamepad".
    fn class_name(&self) -> &str;

    /// Called once when the driver is bound to a client. Failing the
    /// probe leaves the client unbound.
    fn probe(&self, _client: &ClientRef<'_>) -> Result<(), BusError> {
        Ok(())
    }

    /// Called once when the client goes away or the adapter shuts down.
    fn remove(&self, _client: &ClientRef<'_>) {}

    /// Gamepad input report (external command 0x20).
    fn input(&self, _client: &ClientRef<'_>, _data: &[u8]) {}

    /// Raw HID report passthrough.
    fn hid_report(&self, _client: &ClientRef<'_>, _data: &[u8]) {}

    /// Guide button state change.
    fn guide_button(&self, _client: &ClientRef<'_>, _pressed: bool) {}

    /// Battery fields from a status beacon.
    fn battery(&self, _client: &ClientRef<'_>, _status: BatteryStatus) {}

    /// Audio negotiation finished; the ring is live from here on.
    fn audio_ready(&self, _client: &ClientRef<'_>) {}

    /// Decoded PCM from the device.
    fn audio_samples(&self, _client: &ClientRef<'_>, _samples: &[u8]) {}
}

/// The driver registry shared by every adapter (wired adapters and each
/// dongle child alike). Also hands out adapter ids for device naming.
pub struct Bus {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
    next_adapter_id: AtomicUsize,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            drivers: RwLock::new(Vec::new()),
            next_adapter_id: AtomicUsize::new(0),
        })
    }

    pub fn register_driver(&self, driver: Arc<dyn Driver>) {
        tracing::debug!(class = driver.class_name(), "driver registered");
        self.drivers.write().unwrap().push(driver);
    }

    /// First registered driver whose class appears in `classes`.
    pub(crate) fn match_driver(&self, classes: &[String]) -> Option<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap()
            .iter()
            .find(|driver| classes.iter().any(|class| class == driver.class_name()))
            .cloned()
    }

    pub(crate) fn allocate_adapter_id(&self) -> usize {
        self.next_adapter_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Borrowed view of a client, valid for the duration of one driver call.
pub struct ClientRef<'a> {
    pub(crate) adapter: &'a Adapter,
    pub(crate) client: &'a Arc<Client>,
}

impl ClientRef<'_> {
    pub fn id(&self) -> u8 {
        self.client.id()
    }

    pub fn adapter_id(&self) -> usize {
        self.adapter.id()
    }

    pub fn announce(&self) -> Option<Announce> {
        self.client.announce()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.client.class_names()
    }

    pub fn audio_formats(&self) -> Vec<AudioFormatPair> {
        self.client.audio_formats()
    }

    /// The outbound PCM ring for this client.
    pub fn audio_ring(&self) -> Arc<AudioRing> {
        self.client.audio_ring()
    }

    pub fn send_rumble(&self, rumble: &RumblePayload) -> Result<(), BusError> {
        self.adapter
            .send_external(self.client.id(), cmd::RUMBLE, rumble.as_bytes())
    }

    pub fn send_led(&self, mode: u8, brightness: u8) -> Result<(), BusError> {
        let led = LedPayload {
            reserved: 0,
            mode,
            brightness,
        };
        self.adapter
            .send_internal(self.client.id(), cmd::LED, led.as_bytes())
    }

    pub fn send_power(&self, mode: PowerMode) -> Result<(), BusError> {
        self.adapter
            .send_internal(self.client.id(), cmd::POWER, &[mode as u8])
    }

    /// Set device-side gain after negotiation.
    pub fn send_audio_volume(&self, inbound: u8, outbound: u8) -> Result<(), BusError> {
        let ctl = AudioControl::Volume { inbound, outbound };
        self.adapter
            .send_internal(self.client.id(), cmd::AUDIO_CONTROL, &ctl.build())
    }

    /// Propose an audio format pair. Chat headsets (the chat format on
    /// both directions) get the chat subcommand; everything else the
    /// regular one. The device answers with a volume subcommand to
    /// accept, or a counter-proposal the bus re-accepts.
    pub fn suggest_audio_format(&self, inbound: u8, outbound: u8) -> Result<(), BusError> {
        self.client.state.lock().unwrap().pending_audio = Some((inbound, outbound));
        let ctl = if inbound == FORMAT_CHAT_16KHZ && outbound == FORMAT_CHAT_16KHZ {
            AudioControl::FormatChat { inbound, outbound }
        } else {
            AudioControl::Format { inbound, outbound }
        };
        tracing::debug!(
            client = self.client.id(),
            subcommand = if matches!(ctl, AudioControl::FormatChat { .. }) {
                audio_ctl::FORMAT_CHAT
            } else {
                audio_ctl::FORMAT
            },
            inbound = format_args!("0x{inbound:02x}"),
            outbound = format_args!("0x{outbound:02x}"),
            "proposing audio format"
        );
        self.adapter
            .send_internal(self.client.id(), cmd::AUDIO_CONTROL, &ctl.build())
    }

    /// Kick off the per-client authentication handshake. Typically called
    /// from a driver's probe. A second call is a no-op.
    pub fn start_authentication(&self) {
        self.adapter.start_authentication(self.client);
    }
}
