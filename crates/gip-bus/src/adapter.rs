//! The adapter — one per transport instance.
//!
//! Owns the sixteen client slots, allocates sequence numbers, frames and
//! chunks outbound packets, reassembles and dispatches inbound ones, and
//! runs the ordered work queue that serialises driver registration and
//! client removal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zerocopy::byteorder::U16;
use zerocopy::AsBytes;

use gip_core::audio::AudioConfig;
use gip_core::config::GipConfig;
use gip_core::identify::IdentifyData;
use gip_core::message::{
    AckPayload, Announce, PowerMode, Status, VirtualKey, VIRTUAL_KEY_GUIDE,
};
use gip_core::wire::{
    cmd, Header, FLAG_ACK, FLAG_CHUNK, FLAG_CHUNK_START, FLAG_INTERNAL, MAX_CHUNK_TOTAL,
    MAX_CLIENTS, MAX_COHERENT_PAYLOAD,
};

use crate::audio;
use crate::auth;
use crate::chunk::ChunkBuffer;
use crate::client::{Client, Lifecycle};
use crate::driver::{Bus, ClientRef, Driver};
use crate::error::BusError;
use crate::transport::{BufferKind, Transport, TransportError};

struct Counters {
    data: u8,
    audio: u8,
}

enum Event {
    Register(u8),
    Unregister(u8),
}

pub struct Adapter {
    id: usize,
    weak: Weak<Adapter>,
    bus: Arc<Bus>,
    transport: Arc<dyn Transport>,
    audio_packet_count: usize,
    seq: Mutex<Counters>,
    clients: Mutex<[Option<Arc<Client>>; MAX_CLIENTS]>,
    events: mpsc::UnboundedSender<Event>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Adapter {
    /// Build an adapter over `transport` and start its work queue.
    /// Must be called from within a tokio runtime.
    pub fn new(bus: Arc<Bus>, transport: Arc<dyn Transport>, config: &GipConfig) -> Arc<Self> {
        let (events, mut rx) = mpsc::unbounded_channel();
        let id = bus.allocate_adapter_id();

        let adapter = Arc::new_cyclic(|weak: &Weak<Adapter>| {
            let worker_weak = weak.clone();
            let worker = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let Some(adapter) = worker_weak.upgrade() else {
                        break;
                    };
                    adapter.handle_event(event).await;
                }
            });

            Self {
                id,
                weak: weak.clone(),
                bus,
                transport,
                audio_packet_count: config.audio.packet_count.max(1),
                seq: Mutex::new(Counters { data: 0, audio: 0 }),
                clients: Mutex::new(std::array::from_fn(|_| None)),
                events,
                worker: Mutex::new(Some(worker)),
                shutting_down: AtomicBool::new(false),
            }
        });

        tracing::debug!(adapter = adapter.id, "adapter created");
        adapter
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn audio_packet_count(&self) -> usize {
        self.audio_packet_count
    }

    // ── Clients ───────────────────────────────────────────────────────────────

    pub fn client(&self, id: u8) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .unwrap()
            .get(id as usize)
            .and_then(Clone::clone)
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    fn get_or_create_client(&self, id: u8) -> Arc<Client> {
        let mut clients = self.clients.lock().unwrap();
        let slot = &mut clients[id as usize & (MAX_CLIENTS - 1)];
        match slot {
            Some(client) => client.clone(),
            None => {
                tracing::debug!(adapter = self.id, client = id, "client connected");
                let client = Client::new(id);
                *slot = Some(client.clone());
                client
            }
        }
    }

    fn take_client(&self, id: u8) -> Option<Arc<Client>> {
        self.clients.lock().unwrap()[id as usize & (MAX_CLIENTS - 1)].take()
    }

    fn clients_snapshot(&self) -> Vec<Arc<Client>> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    // ── Sequence numbers ──────────────────────────────────────────────────────

    fn next_data_sequence(&self) -> u8 {
        let mut counters = self.seq.lock().unwrap();
        counters.data = counters.data.wrapping_add(1);
        if counters.data == 0 {
            counters.data = 1;
        }
        counters.data
    }

    pub(crate) fn next_audio_sequence(&self) -> u8 {
        let mut counters = self.seq.lock().unwrap();
        counters.audio = counters.audio.wrapping_add(1);
        if counters.audio == 0 {
            counters.audio = 1;
        }
        counters.audio
    }

    // ── Transmit ──────────────────────────────────────────────────────────────

    pub(crate) fn send_internal(
        &self,
        client_id: u8,
        command: u8,
        payload: &[u8],
    ) -> Result<(), BusError> {
        self.send_packet(client_id, command, FLAG_INTERNAL, payload)
    }

    pub(crate) fn send_external(
        &self,
        client_id: u8,
        command: u8,
        payload: &[u8],
    ) -> Result<(), BusError> {
        self.send_packet(client_id, command, 0, payload)
    }

    fn send_packet(
        &self,
        client_id: u8,
        command: u8,
        flags: u8,
        payload: &[u8],
    ) -> Result<(), BusError> {
        if payload.len() > MAX_COHERENT_PAYLOAD {
            return self.send_chunked(client_id, command, flags, payload);
        }
        let header = Header::coherent(
            command,
            client_id,
            flags,
            self.next_data_sequence(),
            payload.len() as u32,
        );
        self.transmit(BufferKind::Data, &header, payload)
    }

    /// Split a large payload into a chunked transfer: the start chunk
    /// carries the declared total in its offset field, middle chunks their
    /// write offset, the last payload chunk additionally requests an ACK,
    /// and an empty terminator repeats the total.
    fn send_chunked(
        &self,
        client_id: u8,
        command: u8,
        flags: u8,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let total = payload.len();
        if total > MAX_CHUNK_TOTAL {
            return Err(BusError::PayloadTooLarge(total));
        }

        let mut offset = 0usize;
        while offset < total {
            let len = MAX_COHERENT_PAYLOAD.min(total - offset);
            let last = offset + len == total;

            let mut chunk_flags = flags | FLAG_CHUNK;
            let field = if offset == 0 {
                chunk_flags |= FLAG_CHUNK_START | FLAG_ACK;
                total
            } else {
                offset
            };
            if last {
                chunk_flags |= FLAG_ACK;
            }

            let header = Header {
                command,
                client_id,
                flags: chunk_flags,
                sequence: self.next_data_sequence(),
                length: len as u32,
                chunk_offset: Some(field as u32),
            };
            self.transmit(BufferKind::Data, &header, &payload[offset..offset + len])?;
            offset += len;
        }

        let terminator = Header {
            command,
            client_id,
            flags: flags | FLAG_CHUNK,
            sequence: self.next_data_sequence(),
            length: 0,
            chunk_offset: Some(total as u32),
        };
        self.transmit(BufferKind::Data, &terminator, &[])
    }

    fn transmit(
        &self,
        kind: BufferKind,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let mut buffer = self.get_buffer(kind)?;
        let total = header.encoded_len() + payload.len();
        if total > buffer.capacity {
            return Err(BusError::PayloadTooLarge(payload.len()));
        }
        let mut bytes = Vec::with_capacity(total);
        header.write_to(&mut bytes);
        bytes.extend_from_slice(payload);
        buffer.data.extend_from_slice(&bytes);
        self.submit(buffer)
    }

    /// Transmit one 8 ms audio interval: `packet_count` fragments, each
    /// with its own header and a fresh audio sequence number, in a single
    /// audio buffer.
    pub(crate) fn send_audio_burst(
        &self,
        client_id: u8,
        pcm: &[u8],
        config: &AudioConfig,
    ) -> Result<(), BusError> {
        let mut buffer = self.get_buffer(BufferKind::Audio)?;
        let total = self.audio_packet_count * config.packet_size;
        if total > buffer.capacity {
            return Err(BusError::PayloadTooLarge(total));
        }

        let mut bytes = Vec::with_capacity(total);
        for index in 0..self.audio_packet_count {
            let fragment =
                &pcm[index * config.fragment_size..(index + 1) * config.fragment_size];
            let header = Header::coherent(
                cmd::AUDIO_SAMPLES,
                client_id,
                FLAG_INTERNAL,
                self.next_audio_sequence(),
                fragment.len() as u32,
            );
            header.write_to(&mut bytes);
            bytes.extend_from_slice(fragment);
        }
        buffer.data.extend_from_slice(&bytes);
        self.submit(buffer)
    }

    fn get_buffer(&self, kind: BufferKind) -> Result<crate::transport::TxBuffer, BusError> {
        self.transport.get_buffer(kind).map_err(|error| match error {
            TransportError::NoSpace => BusError::NoTxBuffer,
            other => BusError::Transport(other),
        })
    }

    fn submit(&self, buffer: crate::transport::TxBuffer) -> Result<(), BusError> {
        match self.transport.submit_buffer(buffer) {
            Ok(()) => Ok(()),
            // Submit failures while tearing down are expected: the
            // transport is already going away underneath us.
            Err(error) if self.shutting_down.load(Ordering::Relaxed) => {
                tracing::trace!(adapter = self.id, %error, "submit failed during teardown");
                Ok(())
            }
            Err(error) => Err(BusError::Transport(error)),
        }
    }

    pub(crate) fn install_session_key(&self, key: [u8; 16]) -> Result<(), TransportError> {
        self.transport.set_encryption_key(key)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn adapter_weak(&self) -> Weak<Adapter> {
        self.weak.clone()
    }

    // ── Receive ───────────────────────────────────────────────────────────────

    /// Process one GIP packet delivered by the transport. The transport's
    /// receive path calls this serially.
    pub async fn process_packet(&self, raw: &[u8]) -> Result<(), BusError> {
        let (header, consumed) = match Header::decode(raw) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(adapter = self.id, %error, "discarding undecodable packet");
                return Err(error.into());
            }
        };
        let payload = &raw[consumed..consumed + header.length as usize];
        let client = self.get_or_create_client(header.client_id);

        if header.is_chunk_start() {
            let total = header.chunk_offset.unwrap_or(0) as usize;
            let buffer = match ChunkBuffer::new(total) {
                Ok(buffer) => buffer,
                Err(error) => {
                    tracing::warn!(adapter = self.id, client = client.id(), %error,
                        "rejecting chunked transfer");
                    return Err(error);
                }
            };
            let mut chunk = client.chunk.lock().unwrap();
            if chunk.is_some() {
                tracing::warn!(adapter = self.id, client = client.id(),
                    "replacing abandoned chunk buffer");
            }
            *chunk = Some(buffer);
        }

        if header.is_ack() {
            let (received, remaining) = self.ack_totals(&client, &header);
            if let Err(error) = self.send_ack(&header, received, remaining) {
                tracing::warn!(adapter = self.id, client = client.id(), %error,
                    "failed to acknowledge packet");
            }
        }

        let result = if header.is_chunk() {
            self.process_chunk(&client, &header, payload).await
        } else {
            self.dispatch(&client, &header, payload).await
        };
        if let Err(error) = &result {
            tracing::warn!(adapter = self.id, client = client.id(),
                command = format_args!("0x{:02x}", header.command), %error,
                "packet discarded");
        }
        result
    }

    async fn process_chunk(
        &self,
        client: &Arc<Client>,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let offset = header.chunk_offset.unwrap_or(0) as usize;

        if header.is_chunk_start() {
            // The start chunk's offset field is the declared total; its
            // payload lands at the front of the buffer.
            let mut guard = client.chunk.lock().unwrap();
            if let Some(buffer) = guard.as_mut() {
                buffer.write(0, payload)?;
            }
            return Ok(());
        }

        if header.length == 0 {
            // End of transfer.
            let buffer = client.chunk.lock().unwrap().take();
            let Some(buffer) = buffer else {
                // Some devices terminate transfers they never started.
                tracing::debug!(adapter = self.id, client = client.id(),
                    "spurious chunk completion ignored");
                return Ok(());
            };
            if offset < buffer.total() {
                tracing::warn!(adapter = self.id, client = client.id(),
                    declared = buffer.total(), observed = offset,
                    "chunked transfer ended early");
            }
            let payload = buffer.into_payload(offset);
            let mut coherent = header.clone();
            coherent.flags &= !(FLAG_CHUNK | FLAG_CHUNK_START);
            coherent.chunk_offset = None;
            coherent.length = payload.len() as u32;
            return self.dispatch(client, &coherent, &payload).await;
        }

        let mut guard = client.chunk.lock().unwrap();
        match guard.as_mut() {
            Some(buffer) => buffer.write(offset, payload),
            None => {
                tracing::debug!(adapter = self.id, client = client.id(),
                    "chunk without an open transfer, discarding");
                Ok(())
            }
        }
    }

    fn ack_totals(&self, client: &Arc<Client>, header: &Header) -> (u16, u16) {
        if !header.is_chunk() {
            return (header.length as u16, 0);
        }
        let field = header.chunk_offset.unwrap_or(0);
        if header.is_chunk_start() {
            (header.length as u16, field.saturating_sub(header.length) as u16)
        } else {
            let received = field + header.length;
            let declared = client
                .chunk
                .lock()
                .unwrap()
                .as_ref()
                .map(|buffer| buffer.total() as u32)
                .unwrap_or(received);
            (received as u16, declared.saturating_sub(received) as u16)
        }
    }

    fn send_ack(&self, header: &Header, received: u16, remaining: u16) -> Result<(), BusError> {
        let ack = AckPayload {
            reserved: 0,
            command: header.command,
            options: FLAG_INTERNAL | header.client_id,
            received: U16::new(received),
            padding: [0; 2],
            remaining: U16::new(remaining),
        };
        self.send_internal(header.client_id, cmd::ACKNOWLEDGE, ack.as_bytes())
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    async fn dispatch(
        &self,
        client: &Arc<Client>,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), BusError> {
        if !header.is_internal() {
            // Device-class traffic is only meaningful once the client is
            // fully identified.
            if !client.is_identified() {
                tracing::warn!(adapter = self.id, client = client.id(),
                    command = format_args!("0x{:02x}", header.command),
                    "dropping external command before identification");
                return Ok(());
            }
            match header.command {
                cmd::INPUT => {
                    self.driver_op(client, |driver, client_ref| {
                        driver.input(client_ref, payload);
                    })
                    .await;
                }
                other => {
                    tracing::trace!(adapter = self.id, client = client.id(),
                        command = format_args!("0x{other:02x}"),
                        "unhandled external command");
                }
            }
            return Ok(());
        }

        match header.command {
            cmd::ACKNOWLEDGE => {
                tracing::trace!(adapter = self.id, client = client.id(), "acknowledge");
                Ok(())
            }
            cmd::ANNOUNCE => self.handle_announce(client, payload),
            cmd::STATUS => self.handle_status(client, payload).await,
            cmd::IDENTIFY => self.handle_identify(client, payload),
            cmd::AUTHENTICATE => {
                let guard = client.auth.lock().unwrap();
                match guard.as_ref() {
                    Some(handle) if handle.tx.send(payload.to_vec()).is_ok() => {}
                    _ => {
                        tracing::trace!(adapter = self.id, client = client.id(),
                            "authenticate packet with no handshake in progress");
                    }
                }
                Ok(())
            }
            cmd::VIRTUAL_KEY => self.handle_virtual_key(client, payload).await,
            cmd::AUDIO_CONTROL => audio::handle_control(self, client, payload).await,
            cmd::HID_REPORT => {
                if !client.is_identified() {
                    tracing::warn!(adapter = self.id, client = client.id(),
                        "dropping hid report before identification");
                    return Ok(());
                }
                self.driver_op(client, |driver, client_ref| {
                    driver.hid_report(client_ref, payload);
                })
                .await;
                Ok(())
            }
            cmd::AUDIO_SAMPLES => {
                if !client.is_identified() {
                    return Ok(());
                }
                match audio::strip_sample_prefix(payload) {
                    Some(pcm) => {
                        self.driver_op(client, |driver, client_ref| {
                            driver.audio_samples(client_ref, pcm);
                        })
                        .await;
                    }
                    None => {
                        tracing::warn!(adapter = self.id, client = client.id(),
                            len = payload.len(), "audio samples with bad framing");
                    }
                }
                Ok(())
            }
            other => {
                tracing::debug!(adapter = self.id, client = client.id(),
                    command = format_args!("0x{other:02x}"),
                    "unhandled internal command");
                Ok(())
            }
        }
    }

    fn handle_announce(&self, client: &Arc<Client>, payload: &[u8]) -> Result<(), BusError> {
        if client.lifecycle() != Lifecycle::Connected {
            tracing::warn!(adapter = self.id, client = client.id(),
                state = ?client.lifecycle(), "announce out of order, ignoring");
            return Ok(());
        }
        let announce = match Announce::parse(payload) {
            Ok(announce) => announce,
            Err(error) => {
                // The device re-announces on its next status beacon.
                tracing::debug!(adapter = self.id, client = client.id(), %error,
                    "malformed announce, aborting client setup");
                return Ok(());
            }
        };
        tracing::info!(adapter = self.id, client = client.id(),
            vendor = format_args!("0x{:04x}", announce.vendor),
            product = format_args!("0x{:04x}", announce.product),
            mac = hex::encode(announce.address),
            "client announced");
        client.state.lock().unwrap().announce = Some(announce);
        client.set_lifecycle(Lifecycle::Announced);
        // Ask for the capability blob.
        self.send_internal(client.id(), cmd::IDENTIFY, &[])
    }

    async fn handle_status(&self, client: &Arc<Client>, payload: &[u8]) -> Result<(), BusError> {
        let status = Status::parse(payload)?;
        if client.is_identified() {
            self.driver_op(client, |driver, client_ref| {
                driver.battery(client_ref, status.battery);
            })
            .await;
        }
        if !status.connected && client.lifecycle() != Lifecycle::Disconnected {
            tracing::info!(adapter = self.id, client = client.id(), "client disconnecting");
            client.set_lifecycle(Lifecycle::Disconnected);
            let _ = self.events.send(Event::Unregister(client.id()));
        }
        Ok(())
    }

    fn handle_identify(&self, client: &Arc<Client>, payload: &[u8]) -> Result<(), BusError> {
        if client.lifecycle() != Lifecycle::Announced {
            tracing::warn!(adapter = self.id, client = client.id(),
                state = ?client.lifecycle(), "identify out of order, ignoring");
            return Ok(());
        }
        let identify = IdentifyData::parse(payload)?;
        tracing::info!(adapter = self.id, client = client.id(),
            classes = ?identify.class_names(), "client identified");
        client.state.lock().unwrap().identify = Some(identify);
        client.set_lifecycle(Lifecycle::Identified);
        let _ = self.events.send(Event::Register(client.id()));
        Ok(())
    }

    async fn handle_virtual_key(
        &self,
        client: &Arc<Client>,
        payload: &[u8],
    ) -> Result<(), BusError> {
        if !client.is_identified() {
            return Ok(());
        }
        let key = VirtualKey::parse(payload)?;
        if key.key == VIRTUAL_KEY_GUIDE {
            self.driver_op(client, |driver, client_ref| {
                driver.guide_button(client_ref, key.pressed);
            })
            .await;
        } else {
            tracing::trace!(adapter = self.id, client = client.id(),
                key = key.key, "unhandled virtual key");
        }
        Ok(())
    }

    /// Run a driver callback under the client's driver semaphore.
    pub(crate) async fn driver_op<F>(&self, client: &Arc<Client>, op: F)
    where
        F: FnOnce(&Arc<dyn Driver>, &ClientRef<'_>),
    {
        let guard = client.driver.lock().await;
        if let Some(driver) = guard.as_ref() {
            let client_ref = ClientRef {
                adapter: self,
                client,
            };
            op(driver, &client_ref);
        }
    }

    pub(crate) fn start_authentication(&self, client: &Arc<Client>) {
        let mut guard = client.auth.lock().unwrap();
        if guard.is_some() {
            return;
        }
        *guard = Some(auth::spawn(self.weak.clone(), client));
    }

    // ── Work queue ────────────────────────────────────────────────────────────

    async fn handle_event(&self, event: Event) {
        match event {
            Event::Register(id) => {
                let Some(client) = self.client(id) else {
                    return;
                };
                let classes = client.class_names();
                let Some(driver) = self.bus.match_driver(&classes) else {
                    tracing::debug!(adapter = self.id, client = id,
                        "no driver for client, leaving unbound");
                    return;
                };
                let mut slot = client.driver.lock().await;
                if slot.is_some() {
                    return;
                }
                let client_ref = ClientRef {
                    adapter: self,
                    client: &client,
                };
                match driver.probe(&client_ref) {
                    Ok(()) => {
                        tracing::info!(adapter = self.id, client = id,
                            class = driver.class_name(), "driver bound");
                        *slot = Some(driver);
                    }
                    Err(error) => {
                        tracing::warn!(adapter = self.id, client = id, %error,
                            "driver probe failed");
                    }
                }
            }
            Event::Unregister(id) => {
                let Some(client) = self.take_client(id) else {
                    return;
                };
                client.cancel_tasks();
                let mut slot = client.driver.lock().await;
                if let Some(driver) = slot.take() {
                    let client_ref = ClientRef {
                        adapter: self,
                        client: &client,
                    };
                    driver.remove(&client_ref);
                }
                tracing::info!(adapter = self.id, client = id, "client removed");
            }
        }
    }

    // ── Power & teardown ──────────────────────────────────────────────────────

    /// Tell every client to power down. Used by the dongle's power-off
    /// path before it waits for the departures.
    pub fn power_off_clients(&self) {
        for client in self.clients_snapshot() {
            if let Err(error) =
                self.send_internal(client.id(), cmd::POWER, &[PowerMode::Off as u8])
            {
                tracing::warn!(adapter = self.id, client = client.id(), %error,
                    "failed to send power off");
            }
        }
    }

    /// Cancel timers and handshakes, unbind drivers, drop all clients.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
        let clients: Vec<Arc<Client>> = {
            let mut slots = self.clients.lock().unwrap();
            slots.iter_mut().filter_map(Option::take).collect()
        };
        let mut audio_was_live = false;
        for client in clients {
            audio_was_live |= client.audio_task.lock().unwrap().is_some();
            client.cancel_tasks();
            let mut slot = client.driver.lock().await;
            if let Some(driver) = slot.take() {
                let client_ref = ClientRef {
                    adapter: self,
                    client: &client,
                };
                driver.remove(&client_ref);
            }
        }
        if audio_was_live {
            if let Err(error) = self.transport.disable_audio() {
                tracing::trace!(adapter = self.id, %error, "audio teardown skipped");
            }
        }
        tracing::debug!(adapter = self.id, "adapter shut down");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
