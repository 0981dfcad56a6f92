//! The dongle multiplexer.
//!
//! Association events create a GIP adapter child per wireless client;
//! disassociation tears it down. Everything that mutates the client
//! table or the radio state — associations, disassociations, pairing,
//! key installs — funnels through one ordered event queue so the WCID
//! table and the radio MAC never drift apart. The receive path only
//! parses and enqueues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use gip_bus::{Adapter, BufferKind, Bus, Transport, TransportError, TxBuffer};
use gip_core::audio::{AudioConfig, FORMAT_STEREO_48KHZ};
use gip_core::config::GipConfig;
use gip_core::wire::MAX_CLIENTS;

use crate::error::DongleError;
use crate::mac::{self, MacAddr};
use crate::mt76;
use crate::radio::{led, RadioMac};

/// Frame capacity on the wireless link for GIP data packets.
const WIRELESS_MTU: usize = 1536;

/// Capacity of one audio transmit buffer: a full 8 ms burst of the
/// widest supported format, per-fragment headers included. The bare PCM
/// interval is not enough — stereo 48 kHz is 1536 PCM bytes plus eight
/// packet headers.
fn audio_burst_capacity(packet_count: usize) -> usize {
    AudioConfig::derive(FORMAT_STEREO_48KHZ, packet_count)
        .map(|config| config.packet_size * packet_count)
        .unwrap_or(WIRELESS_MTU)
}

struct DongleClient {
    wcid: u8,
    address: MacAddr,
    encrypted: Arc<AtomicBool>,
    adapter: Arc<Adapter>,
}

struct PairingState {
    enabled: bool,
    watchdog: Option<JoinHandle<()>>,
}

enum DongleEvent {
    Associate(MacAddr),
    DisassociateAddr(MacAddr),
    DisassociateWcid(u8),
    Pair(MacAddr),
    SetPairing(bool),
    TogglePairing,
    InstallKey { wcid: u8, key: [u8; 16] },
}

pub struct Dongle {
    weak: Weak<Dongle>,
    bus: Arc<Bus>,
    radio: Arc<dyn RadioMac>,
    config: GipConfig,
    slots: Mutex<[Option<DongleClient>; MAX_CLIENTS]>,
    pairing: Mutex<PairingState>,
    events: mpsc::UnboundedSender<DongleEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    all_gone: Notify,
}

impl Dongle {
    /// Build the multiplexer over `radio` and start its event queue.
    /// Must be called from within a tokio runtime.
    pub fn new(bus: Arc<Bus>, radio: Arc<dyn RadioMac>, config: GipConfig) -> Arc<Self> {
        let (events, mut rx) = mpsc::unbounded_channel();

        let dongle = Arc::new_cyclic(|weak: &Weak<Dongle>| {
            let worker_weak = weak.clone();
            let worker = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let Some(dongle) = worker_weak.upgrade() else {
                        break;
                    };
                    dongle.handle_event(event).await;
                }
            });

            Self {
                weak: weak.clone(),
                bus,
                radio,
                config,
                slots: Mutex::new(std::array::from_fn(|_| None)),
                pairing: Mutex::new(PairingState {
                    enabled: false,
                    watchdog: None,
                }),
                events,
                worker: Mutex::new(Some(worker)),
                all_gone: Notify::new(),
            }
        });

        tracing::debug!(mac = hex::encode(dongle.radio.address()), "dongle ready");
        dongle
    }

    // ── Public surface ────────────────────────────────────────────────────────

    pub fn pairing_enabled(&self) -> bool {
        self.pairing.lock().unwrap().enabled
    }

    /// Toggle pairing mode. Backs the external pairing control surface.
    pub fn set_pairing(&self, enabled: bool) {
        self.enqueue(DongleEvent::SetPairing(enabled));
    }

    pub fn client_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// (WCID, address) of every associated client.
    pub fn clients(&self) -> Vec<(u8, MacAddr)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|client| (client.wcid, client.address))
            .collect()
    }

    /// The GIP adapter child serving a WCID.
    pub fn client_adapter(&self, wcid: u8) -> Option<Arc<Adapter>> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .find(|client| client.wcid == wcid)
            .map(|client| client.adapter.clone())
    }

    /// Install a handshake-derived link key for a WCID. Called by the
    /// per-client transport; serialised with associations.
    pub fn install_client_key(&self, wcid: u8, key: [u8; 16]) {
        self.enqueue(DongleEvent::InstallKey { wcid, key });
    }

    /// Power every wireless client down and wait for the departures.
    /// A timeout surfaces as an error; teardown may proceed regardless.
    pub async fn power_off(&self) -> Result<(), DongleError> {
        self.enqueue(DongleEvent::SetPairing(false));
        let adapters: Vec<Arc<Adapter>> = {
            let slots = self.slots.lock().unwrap();
            slots.iter().flatten().map(|c| c.adapter.clone()).collect()
        };
        for adapter in adapters {
            adapter.power_off_clients();
        }

        let wait = Duration::from_secs(self.config.power.off_wait_secs);
        tokio::time::timeout(wait, async {
            loop {
                let notified = self.all_gone.notified();
                if self.client_count() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| DongleError::PowerOffTimeout)
    }

    /// Tear the dongle down: pairing off, all clients destroyed.
    pub async fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
        let was_enabled = {
            let mut pairing = self.pairing.lock().unwrap();
            if let Some(watchdog) = pairing.watchdog.take() {
                watchdog.abort();
            }
            std::mem::replace(&mut pairing.enabled, false)
        };
        if was_enabled {
            if let Err(error) = self.radio.set_pairing(false) {
                tracing::trace!(%error, "pairing off during teardown failed");
            }
            self.radio.wake_release();
        }
        for index in 0..MAX_CLIENTS {
            self.disassociate_index(index).await;
        }
        tracing::debug!("dongle shut down");
    }

    // ── Receive path ──────────────────────────────────────────────────────────

    /// Demultiplex one bulk RX transfer from the radio.
    pub async fn handle_bulk_rx(&self, bytes: &[u8]) -> Result<(), DongleError> {
        match mt76::parse_rx(bytes)? {
            mt76::RxMessage::CommandResponse(_) => {
                tracing::trace!("radio command response ignored");
                Ok(())
            }
            mt76::RxMessage::Event { kind: mt76::EVT_BUTTON, .. } => {
                self.enqueue(DongleEvent::TogglePairing);
                Ok(())
            }
            mt76::RxMessage::Event { kind: mt76::EVT_CLIENT_LOST, body } => {
                let wcid = *body.first().ok_or(DongleError::MalformedFrame)?;
                tracing::debug!(wcid, "radio reports client lost");
                self.enqueue(DongleEvent::DisassociateWcid(wcid));
                Ok(())
            }
            // The inner payload is an ordinary 802.11 frame.
            mt76::RxMessage::Event { kind: mt76::EVT_PACKET_RX, body } => {
                self.handle_frame(body).await
            }
            mt76::RxMessage::Event { kind, .. } => {
                tracing::trace!(event = kind, "unhandled radio event");
                Ok(())
            }
            mt76::RxMessage::Frame(frame) => self.handle_frame(frame).await,
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) -> Result<(), DongleError> {
        let Some(frame) = mac::parse_frame(bytes) else {
            tracing::warn!(len = bytes.len(), "unparseable 802.11 frame");
            return Err(DongleError::MalformedFrame);
        };
        let fc = frame.frame_control;
        match (fc.frame_type(), fc.subtype()) {
            (mac::FRAME_TYPE_MGMT, mac::MGMT_SUBTYPE_ASSOC_REQ) => {
                self.enqueue(DongleEvent::Associate(frame.addr2));
            }
            (mac::FRAME_TYPE_MGMT, mac::MGMT_SUBTYPE_DISASSOC) => {
                self.enqueue(DongleEvent::DisassociateAddr(frame.addr2));
            }
            (mac::FRAME_TYPE_MGMT, mac::MGMT_SUBTYPE_PAIR) => {
                if frame.body.first() == Some(&mac::PAIR_REQUEST_BYTE) {
                    self.enqueue(DongleEvent::Pair(frame.addr2));
                }
            }
            (mac::FRAME_TYPE_DATA, mac::DATA_SUBTYPE_QOS_DATA) => {
                let adapter = self.adapter_by_address(frame.addr2);
                match adapter {
                    Some(adapter) => {
                        // Receive-path errors are already logged by the bus.
                        let _ = adapter.process_packet(frame.body).await;
                    }
                    None => {
                        tracing::debug!(mac = hex::encode(frame.addr2),
                            "data frame from unassociated client");
                    }
                }
            }
            (frame_type, subtype) => {
                tracing::trace!(frame_type, subtype, "unhandled 802.11 frame");
            }
        }
        Ok(())
    }

    fn adapter_by_address(&self, address: MacAddr) -> Option<Arc<Adapter>> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .find(|client| client.address == address)
            .map(|client| client.adapter.clone())
    }

    fn enqueue(&self, event: DongleEvent) {
        let _ = self.events.send(event);
    }

    // ── Event queue ───────────────────────────────────────────────────────────

    async fn handle_event(&self, event: DongleEvent) {
        match event {
            DongleEvent::Associate(address) => self.associate(address).await,
            DongleEvent::DisassociateAddr(address) => {
                let index = {
                    let slots = self.slots.lock().unwrap();
                    slots.iter().position(|slot| {
                        slot.as_ref().is_some_and(|client| client.address == address)
                    })
                };
                match index {
                    Some(index) => self.disassociate_index(index).await,
                    // Repeated disassociations are a no-op.
                    None => tracing::debug!(mac = hex::encode(address),
                        "disassociation for unknown client"),
                }
            }
            DongleEvent::DisassociateWcid(wcid) => {
                if (1..=MAX_CLIENTS as u8).contains(&wcid) {
                    self.disassociate_index(wcid as usize - 1).await;
                }
            }
            DongleEvent::Pair(address) => {
                tracing::info!(mac = hex::encode(address), "pair request");
                if let Err(error) = self.radio.pair_client(address) {
                    tracing::warn!(%error, "pair install failed");
                }
                self.apply_pairing(false);
            }
            DongleEvent::SetPairing(enabled) => self.apply_pairing(enabled),
            DongleEvent::TogglePairing => {
                let enabled = self.pairing_enabled();
                self.apply_pairing(!enabled);
            }
            DongleEvent::InstallKey { wcid, key } => {
                let encrypted = {
                    let slots = self.slots.lock().unwrap();
                    slots
                        .iter()
                        .flatten()
                        .find(|client| client.wcid == wcid)
                        .map(|client| client.encrypted.clone())
                };
                let Some(encrypted) = encrypted else {
                    tracing::debug!(wcid, "key install for departed client");
                    return;
                };
                match self.radio.install_key(wcid, key) {
                    Ok(()) => {
                        encrypted.store(true, Ordering::Relaxed);
                        tracing::info!(wcid, "link encryption enabled");
                    }
                    Err(error) => {
                        tracing::warn!(wcid, %error, "key install failed");
                    }
                }
            }
        }
    }

    async fn associate(&self, address: MacAddr) {
        let wcid = {
            let mut slots = self.slots.lock().unwrap();
            if slots
                .iter()
                .flatten()
                .any(|client| client.address == address)
            {
                tracing::debug!(mac = hex::encode(address), "client already associated");
                return;
            }
            let Some(index) = slots.iter().position(Option::is_none) else {
                tracing::warn!(mac = hex::encode(address), error = %DongleError::NoWcid,
                    "association rejected");
                return;
            };
            let wcid = index as u8 + 1;
            let encrypted = Arc::new(AtomicBool::new(false));
            let transport = Arc::new(WirelessTransport {
                radio: self.radio.clone(),
                dongle: self.weak.clone(),
                wcid,
                address,
                encrypted: encrypted.clone(),
                audio_capacity: audio_burst_capacity(self.config.audio.packet_count.max(1)),
            });
            let adapter = Adapter::new(self.bus.clone(), transport, &self.config);
            slots[index] = Some(DongleClient {
                wcid,
                address,
                encrypted,
                adapter,
            });
            wcid
        };

        if let Err(error) = self.radio.associate(wcid, address) {
            tracing::warn!(wcid, %error, "radio association failed");
            self.disassociate_index(wcid as usize - 1).await;
            return;
        }
        if !self.pairing_enabled() {
            self.radio.set_led(led::ON);
        }
        self.radio.wake_acquire();
        tracing::info!(wcid, mac = hex::encode(address), "wireless client associated");
    }

    async fn disassociate_index(&self, index: usize) {
        let client = self.slots.lock().unwrap()[index].take();
        let Some(client) = client else {
            return;
        };
        client.adapter.shutdown().await;
        if let Err(error) = self.radio.disassociate(client.wcid) {
            tracing::warn!(wcid = client.wcid, %error, "radio disassociation failed");
        }
        if self.client_count() == 0 {
            if !self.pairing_enabled() {
                self.radio.set_led(led::OFF);
            }
            self.all_gone.notify_waiters();
        }
        self.radio.wake_release();
        tracing::info!(wcid = client.wcid, mac = hex::encode(client.address),
            "wireless client departed");
    }

    fn apply_pairing(&self, enabled: bool) {
        let mut pairing = self.pairing.lock().unwrap();
        if pairing.enabled == enabled {
            return;
        }

        if enabled {
            if let Err(error) = self.radio.set_pairing(true) {
                tracing::warn!(%error, "failed to enter pairing mode");
                return;
            }
            pairing.enabled = true;
            self.radio.set_led(led::BLINK);
            self.radio.wake_acquire();

            let weak = self.weak.clone();
            let timeout = Duration::from_secs(self.config.pairing.timeout_secs);
            pairing.watchdog = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(dongle) = weak.upgrade() {
                    tracing::info!("pairing watchdog expired");
                    dongle.enqueue(DongleEvent::SetPairing(false));
                }
            }));
            tracing::info!("pairing enabled");
        } else {
            if let Err(error) = self.radio.set_pairing(false) {
                tracing::warn!(%error, "failed to leave pairing mode");
            }
            pairing.enabled = false;
            if let Some(watchdog) = pairing.watchdog.take() {
                watchdog.abort();
            }
            let mode = if self.client_count() > 0 {
                led::ON
            } else {
                led::OFF
            };
            self.radio.set_led(mode);
            self.radio.wake_release();
            tracing::info!("pairing disabled");
        }
    }
}

// ── Wireless transport ────────────────────────────────────────────────────────

/// The per-client transport handed to each GIP adapter child. Outbound
/// GIP bytes pick up the WCID descriptor, TXWI, and QoS header on their
/// way to the TX bulk endpoint.
struct WirelessTransport {
    radio: Arc<dyn RadioMac>,
    dongle: Weak<Dongle>,
    wcid: u8,
    address: MacAddr,
    encrypted: Arc<AtomicBool>,
    /// Audio buffers must fit a whole burst; see [`audio_burst_capacity`].
    audio_capacity: usize,
}

impl Transport for WirelessTransport {
    fn get_buffer(&self, kind: BufferKind) -> Result<TxBuffer, TransportError> {
        let capacity = match kind {
            BufferKind::Data => WIRELESS_MTU,
            BufferKind::Audio => self.audio_capacity,
        };
        Ok(TxBuffer::new(kind, capacity))
    }

    fn submit_buffer(&self, buffer: TxBuffer) -> Result<(), TransportError> {
        let queue = match buffer.kind {
            BufferKind::Data => mt76::QUEUE_DATA,
            BufferKind::Audio => mt76::QUEUE_AUDIO,
        };
        let frame = mt76::build_client_frame(
            self.wcid,
            queue,
            self.address,
            self.radio.address(),
            self.encrypted.load(Ordering::Relaxed),
            &buffer.data,
        );
        self.radio
            .send(&frame)
            .map_err(|error| TransportError::Io(error.to_string()))
    }

    fn enable_audio(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn init_audio_in(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn init_audio_out(&self, _packet_size: usize) -> Result<(), TransportError> {
        Ok(())
    }

    fn disable_audio(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_encryption_key(&self, key: [u8; 16]) -> Result<(), TransportError> {
        match self.dongle.upgrade() {
            Some(dongle) => {
                dongle.install_client_key(self.wcid, key);
                Ok(())
            }
            None => Err(TransportError::Io("dongle gone".into())),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
