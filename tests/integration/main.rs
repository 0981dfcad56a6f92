//! GIP host stack integration harness.
//!
//! Everything runs in-process: a loopback transport stands in for the
//! USB/radio driver, a scripted mock device speaks the device side of
//! the protocol (both handshake versions included, with an independent
//! P_SHA256 implementation), and a mock radio MAC backs the dongle
//! scenarios.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use gip_bus::auth::{
    authcmd, build_control, build_data_packet, build_message, parse_packet, AuthMessage,
};
use gip_bus::{
    Adapter, BufferKind, Bus, BusError, ClientRef, Driver, Transport, TransportError, TxBuffer,
};
use gip_core::audio::FORMAT_STEREO_48KHZ;
use gip_core::config::GipConfig;
use gip_core::message::{audio_ctl, AudioControl};
use gip_core::wire::{cmd, Header, FLAG_INTERNAL};
use gip_dongle::{led, mac, mt76, Dongle, DongleError, RadioMac};

// ── Constants ─────────────────────────────────────────────────────────────────

const GAMEPAD_CLASS: &str = "Windows.Xbox.Input.Gamepad";
const CLIENT_MAC: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
const DONGLE_MAC: [u8; 6] = [0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f];

// ── Loopback transport ────────────────────────────────────────────────────────

#[derive(Default)]
struct LoopbackTransport {
    sent: Mutex<Vec<(BufferKind, Vec<u8>)>>,
    starve: AtomicBool,
    audio_enabled: AtomicBool,
    encryption_key: Mutex<Option<[u8; 16]>>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn data_packets(&self) -> Vec<(Header, Vec<u8>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == BufferKind::Data)
            .map(|(_, bytes)| {
                let (header, consumed) = Header::decode(bytes).unwrap();
                (header.clone(), bytes[consumed..].to_vec())
            })
            .collect()
    }

    fn audio_bursts(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == BufferKind::Audio)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }
}

impl Transport for LoopbackTransport {
    fn get_buffer(&self, kind: BufferKind) -> Result<TxBuffer, TransportError> {
        if self.starve.load(Ordering::Relaxed) {
            return Err(TransportError::NoSpace);
        }
        Ok(TxBuffer::new(kind, 4096))
    }

    fn submit_buffer(&self, buffer: TxBuffer) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((buffer.kind, buffer.data.to_vec()));
        Ok(())
    }

    fn enable_audio(&self) -> Result<(), TransportError> {
        self.audio_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn init_audio_in(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn init_audio_out(&self, _packet_size: usize) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_encryption_key(&self, key: [u8; 16]) -> Result<(), TransportError> {
        *self.encryption_key.lock().unwrap() = Some(key);
        Ok(())
    }
}

// ── Recording driver ──────────────────────────────────────────────────────────

#[derive(Default)]
struct GamepadDriver {
    events: Mutex<Vec<String>>,
    authenticate: bool,
    propose_audio: Option<(u8, u8)>,
}

impl GamepadDriver {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl Driver for GamepadDriver {
    fn class_name(&self) -> &str {
        GAMEPAD_CLASS
    }

    fn probe(&self, client: &ClientRef<'_>) -> Result<(), BusError> {
        self.record("probe");
        if let Some((inbound, outbound)) = self.propose_audio {
            client.suggest_audio_format(inbound, outbound)?;
        }
        if self.authenticate {
            client.start_authentication();
        }
        Ok(())
    }

    fn remove(&self, _client: &ClientRef<'_>) {
        self.record("remove");
    }

    fn input(&self, _client: &ClientRef<'_>, data: &[u8]) {
        self.record(format!("input:{}", data.len()));
    }

    fn guide_button(&self, _client: &ClientRef<'_>, pressed: bool) {
        self.record(format!("guide:{pressed}"));
    }

    fn audio_ready(&self, _client: &ClientRef<'_>) {
        self.record("audio_ready");
    }

    fn audio_samples(&self, _client: &ClientRef<'_>, samples: &[u8]) {
        self.record(format!("audio:{}", samples.len()));
    }
}

// ── Packet builders ───────────────────────────────────────────────────────────

fn device_packet(command: u8, client_id: u8, flags: u8, sequence: u8, payload: &[u8]) -> Vec<u8> {
    let header = Header::coherent(command, client_id, flags, sequence, payload.len() as u32);
    let mut bytes = Vec::new();
    header.write_to(&mut bytes);
    bytes.extend_from_slice(payload);
    bytes
}

fn announce_payload() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&CLIENT_MAC);
    bytes.extend_from_slice(&[0x00, 0x00]);
    bytes.extend_from_slice(&0x045eu16.to_le_bytes());
    bytes.extend_from_slice(&0x02eau16.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 16]);
    bytes
}

fn identify_blob(classes: &[&str], audio_formats: &[(u8, u8)]) -> Vec<u8> {
    let mut blob = vec![0u8; 32];
    if !audio_formats.is_empty() {
        let offset = blob.len() as u16;
        blob[20..22].copy_from_slice(&offset.to_le_bytes());
        blob.push(audio_formats.len() as u8);
        for (inbound, outbound) in audio_formats {
            blob.push(*inbound);
            blob.push(*outbound);
        }
    }
    if !classes.is_empty() {
        let offset = blob.len() as u16;
        blob[26..28].copy_from_slice(&offset.to_le_bytes());
        blob.push(classes.len() as u8);
        for class in classes {
            blob.push(class.len() as u8);
            blob.extend_from_slice(class.as_bytes());
        }
    }
    blob
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Announce + identify client 0 on an adapter.
async fn bring_up(adapter: &Arc<Adapter>, classes: &[&str], formats: &[(u8, u8)]) {
    adapter
        .process_packet(&device_packet(
            cmd::ANNOUNCE,
            0,
            FLAG_INTERNAL,
            1,
            &announce_payload(),
        ))
        .await
        .unwrap();
    adapter
        .process_packet(&device_packet(
            cmd::IDENTIFY,
            0,
            FLAG_INTERNAL,
            2,
            &identify_blob(classes, formats),
        ))
        .await
        .unwrap();
    settle().await;
}

// ── Independent P_SHA256 ──────────────────────────────────────────────────────

/// Reference TLS 1.2 P_SHA256, written against the RFC rather than the
/// production code, so the two sides of the handshake tests derive their
/// secrets independently.
fn prf_ref(key: &[u8], label: &str, seed: &[u8], out_len: usize) -> Vec<u8> {
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    let mut label_seed = label.as_bytes().to_vec();
    label_seed.extend_from_slice(seed);

    let mut out = Vec::new();
    let mut a = hmac(key, &label_seed);
    while out.len() < out_len {
        let mut input = a.clone();
        input.extend_from_slice(&label_seed);
        out.extend_from_slice(&hmac(key, &input));
        a = hmac(key, &a);
    }
    out.truncate(out_len);
    out
}

fn randoms_seed(host_random: &[u8; 32], device_random: &[u8; 32]) -> Vec<u8> {
    let mut seed = host_random.to_vec();
    seed.extend_from_slice(device_random);
    seed
}

const SESSION_KEY_LABEL: &str = "EXPORTER DAWN data channel session key for controller";

// ── Auth pump ─────────────────────────────────────────────────────────────────

/// Collects the host's Authenticate payloads off the loopback transport,
/// reassembling chunked transfers the way a real device would.
struct AuthPump {
    consumed: usize,
    reassembly: Option<Vec<u8>>,
}

impl AuthPump {
    fn new() -> Self {
        Self {
            consumed: 0,
            reassembly: None,
        }
    }

    fn drain(&mut self, transport: &LoopbackTransport) -> Vec<Vec<u8>> {
        let packets = transport.data_packets();
        let mut payloads = Vec::new();
        for (header, payload) in &packets[self.consumed.min(packets.len())..] {
            if header.command != cmd::AUTHENTICATE {
                continue;
            }
            if header.is_chunk_start() {
                let total = header.chunk_offset.unwrap() as usize;
                let mut buffer = vec![0u8; total];
                buffer[..payload.len()].copy_from_slice(payload);
                self.reassembly = Some(buffer);
            } else if header.is_chunk() {
                if header.length == 0 {
                    if let Some(buffer) = self.reassembly.take() {
                        payloads.push(buffer);
                    }
                } else if let Some(buffer) = self.reassembly.as_mut() {
                    let offset = header.chunk_offset.unwrap() as usize;
                    buffer[offset..offset + payload.len()].copy_from_slice(payload);
                }
            } else {
                payloads.push(payload.clone());
            }
        }
        self.consumed = packets.len();
        payloads
    }
}

// ── Mock devices ──────────────────────────────────────────────────────────────

/// Device side of handshake version 1 (RSA).
struct DeviceV1 {
    private: rsa::RsaPrivateKey,
    certificate: Vec<u8>,
    random: [u8; 32],
    host_random: [u8; 32],
    transcript: Sha256,
    master: Option<Vec<u8>>,
    done: bool,
}

impl DeviceV1 {
    fn new() -> Self {
        use rsa::pkcs1::EncodeRsaPublicKey;

        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let der = private.to_public_key().to_pkcs1_der().unwrap();
        // Bury the key inside certificate wrapping the way the real
        // accessories do.
        let mut certificate = vec![0x30u8, 0x82, 0x03, 0x11, 0xa5, 0x00];
        certificate.extend_from_slice(&[0x17; 41]);
        certificate.extend_from_slice(der.as_bytes());
        certificate.extend_from_slice(&[0x2e; 65]);

        let mut random = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut random);

        Self {
            private,
            certificate,
            random,
            host_random: [0u8; 32],
            transcript: Sha256::new(),
            master: None,
            done: false,
        }
    }

    fn digest(&self) -> [u8; 32] {
        self.transcript.clone().finalize().into()
    }

    fn hash_region(&mut self, packet: &[u8]) {
        self.transcript.update(&packet[4..]);
    }

    fn reply_message(&mut self, command: u8, payload: &[u8]) -> Vec<u8> {
        let packet = build_message(command, payload);
        self.hash_region(&packet);
        packet
    }

    fn expected_session_key(&self) -> [u8; 16] {
        let master = self.master.as_ref().expect("master derived");
        let seed = randoms_seed(&self.host_random, &self.random);
        let block = prf_ref(master, SESSION_KEY_LABEL, &seed, 32);
        block[..16].try_into().unwrap()
    }

    fn handle(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        let message = parse_packet(packet).unwrap();
        match message {
            AuthMessage::Data {
                command: authcmd::HOST_HELLO,
                payload,
                ..
            } => {
                self.host_random.copy_from_slice(&payload[..32]);
                self.hash_region(packet);
                vec![build_control(authcmd::HOST_HELLO)]
            }
            AuthMessage::Request {
                command: authcmd::CLIENT_HELLO,
                ..
            } => {
                let mut hello = self.random.to_vec();
                hello.extend_from_slice(&[0x5a; 48]);
                vec![self.reply_message(authcmd::CLIENT_HELLO, &hello)]
            }
            AuthMessage::Request {
                command: authcmd::CLIENT_CERTIFICATE,
                ..
            } => {
                let certificate = self.certificate.clone();
                vec![self.reply_message(authcmd::CLIENT_CERTIFICATE, &certificate)]
            }
            AuthMessage::Data {
                command: authcmd::HOST_SECRET,
                payload,
                ..
            } => {
                let premaster = self
                    .private
                    .decrypt(rsa::Pkcs1v15Encrypt, payload)
                    .expect("premaster decrypts");
                assert_eq!(premaster.len(), 48, "premaster is 48 explicit bytes");
                self.hash_region(packet);
                let seed = randoms_seed(&self.host_random, &self.random);
                self.master = Some(prf_ref(&premaster, "Master Secret", &seed, 48));
                Vec::new()
            }
            AuthMessage::Data {
                command: authcmd::HOST_FINISH,
                payload,
                ..
            } => {
                let master = self.master.clone().expect("secret before finish");
                let expected = prf_ref(&master, "Host Finished", &self.digest(), 32);
                assert_eq!(payload, &expected[..], "host Finished verifies");
                self.hash_region(packet);
                let verify = prf_ref(&master, "Device Finished", &self.digest(), 32);
                vec![self.reply_message(authcmd::CLIENT_FINISH, &verify)]
            }
            AuthMessage::Empty {
                command: authcmd::COMPLETE,
            } => {
                self.done = true;
                Vec::new()
            }
            other => panic!("device got unexpected message: {other:?}"),
        }
    }
}

/// Device side of handshake version 2 (ECDH).
struct DeviceV2 {
    secret: Option<p256::ecdh::EphemeralSecret>,
    public: [u8; 64],
    random: [u8; 32],
    host_random: [u8; 32],
    transcript: Sha256,
    master: Option<Vec<u8>>,
    done: bool,
}

impl DeviceV2 {
    fn new() -> Self {
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        let secret = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; 64];
        public.copy_from_slice(&point.as_bytes()[1..]);

        let mut random = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut random);

        Self {
            secret: Some(secret),
            public,
            random,
            host_random: [0u8; 32],
            transcript: Sha256::new(),
            master: None,
            done: false,
        }
    }

    fn digest(&self) -> [u8; 32] {
        self.transcript.clone().finalize().into()
    }

    fn hash_region(&mut self, packet: &[u8]) {
        self.transcript.update(&packet[4..]);
    }

    fn reply_message(&mut self, command: u8, payload: &[u8]) -> Vec<u8> {
        let packet = build_message(command, payload);
        self.hash_region(&packet);
        packet
    }

    fn expected_session_key(&self) -> [u8; 16] {
        let master = self.master.as_ref().expect("master derived");
        let seed = randoms_seed(&self.host_random, &self.random);
        let block = prf_ref(master, SESSION_KEY_LABEL, &seed, 32);
        block[..16].try_into().unwrap()
    }

    fn handle(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        let message = parse_packet(packet).unwrap();
        match message {
            AuthMessage::Data {
                command: authcmd::HOST_HELLO,
                ..
            } => {
                // Answer the version-1 hello with a mismatched inner
                // command; the host restarts in version 2.
                vec![build_data_packet(
                    authcmd::HOST_HELLO,
                    authcmd::CLIENT_HELLO2,
                    &[],
                )]
            }
            AuthMessage::Data {
                command: authcmd::HOST_HELLO2,
                payload,
                ..
            } => {
                self.host_random.copy_from_slice(&payload[..32]);
                self.transcript = Sha256::new();
                self.hash_region(packet);
                let random = self.random;
                vec![self.reply_message(authcmd::CLIENT_HELLO2, &random)]
            }
            AuthMessage::Request {
                command: authcmd::CLIENT_CERTIFICATE2,
                ..
            } => vec![self.reply_message(authcmd::CLIENT_CERTIFICATE2, b"wireless controller")],
            AuthMessage::Request {
                command: authcmd::CLIENT_PUBKEY2,
                ..
            } => {
                let public = self.public;
                vec![self.reply_message(authcmd::CLIENT_PUBKEY2, &public)]
            }
            AuthMessage::Data {
                command: authcmd::HOST_PUBKEY2,
                payload,
                ..
            } => {
                let mut sec1 = [0u8; 65];
                sec1[0] = 0x04;
                sec1[1..].copy_from_slice(payload);
                let host_key = p256::PublicKey::from_sec1_bytes(&sec1).unwrap();
                let shared = self
                    .secret
                    .take()
                    .expect("single exchange")
                    .diffie_hellman(&host_key);
                let kdf: [u8; 32] = Sha256::digest(shared.raw_secret_bytes()).into();
                self.hash_region(packet);
                let seed = randoms_seed(&self.host_random, &self.random);
                self.master = Some(prf_ref(&kdf, "Master Secret", &seed, 48));
                Vec::new()
            }
            AuthMessage::Data {
                command: authcmd::HOST_FINISH2,
                payload,
                ..
            } => {
                let master = self.master.clone().expect("secret before finish");
                let expected = prf_ref(&master, "Host Finished", &self.digest(), 32);
                assert_eq!(payload, &expected[..], "host Finished verifies");
                self.hash_region(packet);
                let verify = prf_ref(&master, "Device Finished", &self.digest(), 32);
                vec![self.reply_message(authcmd::CLIENT_FINISH2, &verify)]
            }
            AuthMessage::Empty {
                command: authcmd::COMPLETE,
            } => {
                self.done = true;
                Vec::new()
            }
            other => panic!("device got unexpected message: {other:?}"),
        }
    }
}

/// Drive the host and a mock device until the device sees Complete.
async fn pump_handshake<F>(
    adapter: &Arc<Adapter>,
    transport: &LoopbackTransport,
    mut handle: F,
) -> bool
where
    F: FnMut(&[u8]) -> (Vec<Vec<u8>>, bool),
{
    let mut pump = AuthPump::new();
    let mut sequence = 0x10u8;
    for _ in 0..12 {
        let payloads = pump.drain(transport);
        let mut done = false;
        for payload in payloads {
            let (replies, finished) = handle(&payload);
            done |= finished;
            for reply in replies {
                sequence = sequence.wrapping_add(1);
                adapter
                    .process_packet(&device_packet(
                        cmd::AUTHENTICATE,
                        0,
                        FLAG_INTERNAL,
                        sequence,
                        &reply,
                    ))
                    .await
                    .unwrap();
            }
        }
        settle().await;
        if done {
            return true;
        }
    }
    false
}

// ══════════════════════════════════════════════════════════════════════════════
//  Authentication
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn handshake_v1_derives_matching_session_key() {
    let bus = Bus::new();
    let transport = LoopbackTransport::new();
    bus.register_driver(Arc::new(GamepadDriver {
        authenticate: true,
        ..GamepadDriver::default()
    }));
    let adapter = Adapter::new(bus, transport.clone(), &GipConfig::default());
    bring_up(&adapter, &[GAMEPAD_CLASS], &[]).await;

    let device = Arc::new(Mutex::new(DeviceV1::new()));
    let finished = {
        let device = device.clone();
        pump_handshake(&adapter, &transport, move |payload| {
            let mut device = device.lock().unwrap();
            let replies = device.handle(payload);
            (replies, device.done)
        })
        .await
    };
    assert!(finished, "device saw the completion notice");

    let installed = transport
        .encryption_key
        .lock()
        .unwrap()
        .expect("session key installed on the transport");
    assert_eq!(installed, device.lock().unwrap().expected_session_key());
}

#[tokio::test]
async fn handshake_v2_derives_matching_session_key() {
    let bus = Bus::new();
    let transport = LoopbackTransport::new();
    bus.register_driver(Arc::new(GamepadDriver {
        authenticate: true,
        ..GamepadDriver::default()
    }));
    let adapter = Adapter::new(bus, transport.clone(), &GipConfig::default());
    bring_up(&adapter, &[GAMEPAD_CLASS], &[]).await;

    let device = Arc::new(Mutex::new(DeviceV2::new()));
    let finished = {
        let device = device.clone();
        pump_handshake(&adapter, &transport, move |payload| {
            let mut device = device.lock().unwrap();
            let replies = device.handle(payload);
            (replies, device.done)
        })
        .await
    };
    assert!(finished, "device saw the completion notice");

    let installed = transport
        .encryption_key
        .lock()
        .unwrap()
        .expect("session key installed on the transport");
    assert_eq!(installed, device.lock().unwrap().expected_session_key());
}

#[tokio::test]
async fn handshake_aborts_on_tampered_finish() {
    let bus = Bus::new();
    let transport = LoopbackTransport::new();
    bus.register_driver(Arc::new(GamepadDriver {
        authenticate: true,
        ..GamepadDriver::default()
    }));
    let adapter = Adapter::new(bus, transport.clone(), &GipConfig::default());
    bring_up(&adapter, &[GAMEPAD_CLASS], &[]).await;

    let device = Arc::new(Mutex::new(DeviceV1::new()));
    let finished = {
        let device = device.clone();
        pump_handshake(&adapter, &transport, move |payload| {
            let mut device = device.lock().unwrap();
            let mut replies = device.handle(payload);
            // Corrupt the device Finished value on its way out.
            for reply in &mut replies {
                if reply[0] == authcmd::CLIENT_FINISH {
                    let last = reply.len() - 1;
                    reply[last] ^= 0xff;
                }
            }
            (replies, device.done)
        })
        .await
    };

    assert!(!finished, "no completion after a bad Finished");
    assert!(
        transport.encryption_key.lock().unwrap().is_none(),
        "no key installed"
    );
}

#[tokio::test]
async fn handshake_aborts_when_certificate_has_no_key() {
    let bus = Bus::new();
    let transport = LoopbackTransport::new();
    bus.register_driver(Arc::new(GamepadDriver {
        authenticate: true,
        ..GamepadDriver::default()
    }));
    let adapter = Adapter::new(bus, transport.clone(), &GipConfig::default());
    bring_up(&adapter, &[GAMEPAD_CLASS], &[]).await;

    let device = Arc::new(Mutex::new(DeviceV1::new()));
    device.lock().unwrap().certificate = vec![0xee; 512];

    let finished = {
        let device = device.clone();
        pump_handshake(&adapter, &transport, move |payload| {
            let mut device = device.lock().unwrap();
            let replies = device.handle(payload);
            (replies, device.done)
        })
        .await
    };

    assert!(!finished);
    assert!(transport.encryption_key.lock().unwrap().is_none());
}

#[tokio::test]
async fn handshake_aborts_on_peer_error_byte() {
    let bus = Bus::new();
    let transport = LoopbackTransport::new();
    bus.register_driver(Arc::new(GamepadDriver {
        authenticate: true,
        ..GamepadDriver::default()
    }));
    let adapter = Adapter::new(bus, transport.clone(), &GipConfig::default());
    bring_up(&adapter, &[GAMEPAD_CLASS], &[]).await;
    settle().await;

    // Respond to the hello with a non-zero error byte.
    let mut response = build_control(authcmd::HOST_HELLO);
    response[1] = 0x2a;
    adapter
        .process_packet(&device_packet(
            cmd::AUTHENTICATE,
            0,
            FLAG_INTERNAL,
            9,
            &response,
        ))
        .await
        .unwrap();
    settle().await;

    // The handshake stopped: nothing further goes out and no key lands,
    // but the client keeps delivering input.
    let auth_count = transport
        .data_packets()
        .iter()
        .filter(|(header, _)| header.command == cmd::AUTHENTICATE)
        .count();
    assert_eq!(auth_count, 1, "only the host hello went out");
    assert!(transport.encryption_key.lock().unwrap().is_none());

    adapter
        .process_packet(&device_packet(cmd::INPUT, 0, 0, 10, &[0u8; 12]))
        .await
        .unwrap();
}

// ══════════════════════════════════════════════════════════════════════════════
//  Wireless end-to-end
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MockRadio {
    calls: Mutex<Vec<String>>,
    leds: Mutex<Vec<u8>>,
    wake: AtomicI32,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockRadio {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn last_led(&self) -> Option<u8> {
        self.leds.lock().unwrap().last().copied()
    }
}

impl RadioMac for MockRadio {
    fn associate(&self, wcid: u8, address: [u8; 6]) -> Result<(), DongleError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("associate:{wcid}:{}", hex::encode(address)));
        Ok(())
    }

    fn disassociate(&self, wcid: u8) -> Result<(), DongleError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("disassociate:{wcid}"));
        Ok(())
    }

    fn pair_client(&self, address: [u8; 6]) -> Result<(), DongleError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("pair_client:{}", hex::encode(address)));
        Ok(())
    }

    fn set_pairing(&self, enabled: bool) -> Result<(), DongleError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("set_pairing:{enabled}"));
        Ok(())
    }

    fn install_key(&self, wcid: u8, _key: [u8; 16]) -> Result<(), DongleError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("install_key:{wcid}"));
        Ok(())
    }

    fn set_led(&self, mode: u8) {
        self.leds.lock().unwrap().push(mode);
    }

    fn wake_acquire(&self) {
        self.wake.fetch_add(1, Ordering::Relaxed);
    }

    fn wake_release(&self) {
        self.wake.fetch_sub(1, Ordering::Relaxed);
    }

    fn address(&self) -> [u8; 6] {
        DONGLE_MAC
    }

    fn send(&self, frame: &[u8]) -> Result<(), DongleError> {
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

fn mgmt_frame(subtype: u16, source: [u8; 6], body: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; mac::HEADER_LEN];
    let fc = mac::FrameControl::new(mac::FRAME_TYPE_MGMT, subtype);
    bytes[..2].copy_from_slice(&fc.0.to_le_bytes());
    bytes[4..10].copy_from_slice(&mac::BCAST_ADDR);
    bytes[10..16].copy_from_slice(&source);
    bytes[16..22].copy_from_slice(&DONGLE_MAC);
    bytes.extend_from_slice(body);
    bytes
}

fn qos_data_frame(source: [u8; 6], gip: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; mac::QOS_HEADER_LEN];
    let fc = mac::FrameControl::new(mac::FRAME_TYPE_DATA, mac::DATA_SUBTYPE_QOS_DATA);
    bytes[..2].copy_from_slice(&fc.0.to_le_bytes());
    bytes[4..10].copy_from_slice(&DONGLE_MAC);
    bytes[10..16].copy_from_slice(&source);
    bytes[16..22].copy_from_slice(&DONGLE_MAC);
    bytes.extend_from_slice(gip);
    bytes
}

#[tokio::test]
async fn wireless_client_reaches_its_driver() {
    let bus = Bus::new();
    let driver = Arc::new(GamepadDriver::default());
    bus.register_driver(driver.clone());
    let radio = MockRadio::new();
    let dongle = Dongle::new(bus, radio.clone(), GipConfig::default());

    // Associate.
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&mgmt_frame(
            mac::MGMT_SUBTYPE_ASSOC_REQ,
            CLIENT_MAC,
            &[],
        )))
        .await
        .unwrap();
    settle().await;
    assert_eq!(dongle.clients(), vec![(1, CLIENT_MAC)]);
    assert_eq!(radio.last_led(), Some(led::ON));

    // Announce and identify over the air.
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&qos_data_frame(
            CLIENT_MAC,
            &device_packet(cmd::ANNOUNCE, 0, FLAG_INTERNAL, 1, &announce_payload()),
        )))
        .await
        .unwrap();
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&qos_data_frame(
            CLIENT_MAC,
            &device_packet(
                cmd::IDENTIFY,
                0,
                FLAG_INTERNAL,
                2,
                &identify_blob(&[GAMEPAD_CLASS], &[]),
            ),
        )))
        .await
        .unwrap();
    settle().await;
    assert!(driver.events().contains(&"probe".to_string()));

    // Input flows through the dongle to the driver.
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&qos_data_frame(
            CLIENT_MAC,
            &device_packet(cmd::INPUT, 0, 0, 3, &[0xaa; 18]),
        )))
        .await
        .unwrap();
    settle().await;
    assert!(driver.events().contains(&"input:18".to_string()));

    // Disassociation unbinds the driver and turns the LED off.
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&mgmt_frame(
            mac::MGMT_SUBTYPE_DISASSOC,
            CLIENT_MAC,
            &[],
        )))
        .await
        .unwrap();
    settle().await;
    assert!(dongle.clients().is_empty());
    assert!(driver.events().contains(&"remove".to_string()));
    assert_eq!(radio.last_led(), Some(led::OFF));
}

#[tokio::test]
async fn wireless_power_off_completes_when_clients_leave() {
    let bus = Bus::new();
    let radio = MockRadio::new();
    let dongle = Dongle::new(bus, radio.clone(), GipConfig::default());

    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&mgmt_frame(
            mac::MGMT_SUBTYPE_ASSOC_REQ,
            CLIENT_MAC,
            &[],
        )))
        .await
        .unwrap();
    settle().await;
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&qos_data_frame(
            CLIENT_MAC,
            &device_packet(cmd::ANNOUNCE, 0, FLAG_INTERNAL, 1, &announce_payload()),
        )))
        .await
        .unwrap();
    settle().await;

    let waiter = {
        let dongle = dongle.clone();
        tokio::spawn(async move { dongle.power_off().await })
    };
    settle().await;

    // The power-off command reached the client.
    let sent = radio.sent.lock().unwrap().clone();
    let saw_power_off = sent.iter().any(|frame| {
        let gip = &frame[4 + 16 + mac::QOS_HEADER_LEN + 2..];
        Header::decode(gip)
            .map(|(header, consumed)| header.command == cmd::POWER && gip[consumed] == 0x04)
            .unwrap_or(false)
    });
    assert!(saw_power_off, "power off packet on the air");

    // The device departs; the waiter resolves.
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&mgmt_frame(
            mac::MGMT_SUBTYPE_DISASSOC,
            CLIENT_MAC,
            &[],
        )))
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn wireless_audio_keeps_flowing_at_stereo_48khz() {
    let bus = Bus::new();
    bus.register_driver(Arc::new(GamepadDriver {
        propose_audio: Some((FORMAT_STEREO_48KHZ, FORMAT_STEREO_48KHZ)),
        ..GamepadDriver::default()
    }));
    let radio = MockRadio::new();
    let dongle = Dongle::new(bus, radio.clone(), GipConfig::default());

    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&mgmt_frame(
            mac::MGMT_SUBTYPE_ASSOC_REQ,
            CLIENT_MAC,
            &[],
        )))
        .await
        .unwrap();
    settle().await;
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&qos_data_frame(
            CLIENT_MAC,
            &device_packet(cmd::ANNOUNCE, 0, FLAG_INTERNAL, 1, &announce_payload()),
        )))
        .await
        .unwrap();
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&qos_data_frame(
            CLIENT_MAC,
            &device_packet(
                cmd::IDENTIFY,
                0,
                FLAG_INTERNAL,
                2,
                &identify_blob(
                    &[GAMEPAD_CLASS],
                    &[(FORMAT_STEREO_48KHZ, FORMAT_STEREO_48KHZ)],
                ),
            ),
        )))
        .await
        .unwrap();
    settle().await;

    // The device accepts the proposed pair with a volume report.
    let accept = AudioControl::Volume {
        inbound: 0x64,
        outbound: 0x64,
    };
    dongle
        .handle_bulk_rx(&mt76::build_rx_frame(&qos_data_frame(
            CLIENT_MAC,
            &device_packet(cmd::AUDIO_CONTROL, 0, FLAG_INTERNAL, 3, &accept.build()),
        )))
        .await
        .unwrap();
    settle().await;

    // Bursts keep flowing past the first 8 ms interval — the widest
    // format's burst (PCM plus per-fragment headers) must fit the
    // wireless audio buffer.
    let audio_frames = |radio: &MockRadio| {
        radio
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame[5] == mt76::QUEUE_AUDIO)
            .count()
    };
    let before = audio_frames(&radio);
    tokio::time::advance(Duration::from_millis(80)).await;
    settle().await;
    let after = audio_frames(&radio);
    assert!(
        after >= before + 9,
        "audio stopped after the first interval: {before} -> {after}"
    );

    let sent = radio.sent.lock().unwrap().clone();
    let burst = sent
        .iter()
        .rev()
        .find(|frame| frame[5] == mt76::QUEUE_AUDIO)
        .expect("audio frame on the air");
    let gip = &burst[4 + 16 + mac::QOS_HEADER_LEN + 2..];
    let mut cursor = 0;
    let mut pcm_bytes = 0;
    for _ in 0..8 {
        let (header, consumed) = Header::decode(&gip[cursor..]).unwrap();
        assert_eq!(header.command, cmd::AUDIO_SAMPLES);
        assert_ne!(header.sequence, 0);
        pcm_bytes += header.length as usize;
        cursor += consumed + header.length as usize;
    }
    assert_eq!(pcm_bytes, 1536);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Audio timing
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn audio_transmits_125_bursts_per_second() {
    let bus = Bus::new();
    let transport = LoopbackTransport::new();
    bus.register_driver(Arc::new(GamepadDriver {
        propose_audio: Some((FORMAT_STEREO_48KHZ, FORMAT_STEREO_48KHZ)),
        ..GamepadDriver::default()
    }));
    let adapter = Adapter::new(bus, transport.clone(), &GipConfig::default());
    bring_up(
        &adapter,
        &[GAMEPAD_CLASS],
        &[(FORMAT_STEREO_48KHZ, FORMAT_STEREO_48KHZ)],
    )
    .await;

    // The host proposed; accept with a volume report.
    let proposal = transport
        .data_packets()
        .into_iter()
        .find(|(header, _)| header.command == cmd::AUDIO_CONTROL)
        .expect("format proposal sent");
    assert_eq!(proposal.1[0], audio_ctl::FORMAT);

    let accept = AudioControl::Volume {
        inbound: 0x64,
        outbound: 0x64,
    };
    adapter
        .process_packet(&device_packet(
            cmd::AUDIO_CONTROL,
            0,
            FLAG_INTERNAL,
            9,
            &accept.build(),
        ))
        .await
        .unwrap();
    settle().await;
    assert!(transport.audio_enabled.load(Ordering::Relaxed));

    let before = transport.audio_bursts().len();
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    let delta = transport.audio_bursts().len() - before;
    assert!(
        (124..=127).contains(&delta),
        "expected ~125 bursts in one second, got {delta}"
    );

    // Every burst carries eight stamped packets totalling one 8 ms
    // interval of 48 kHz stereo PCM.
    let burst = transport.audio_bursts().pop().unwrap();
    let mut cursor = 0;
    let mut packets = 0;
    let mut pcm_bytes = 0;
    while cursor < burst.len() {
        let (header, consumed) = Header::decode(&burst[cursor..]).unwrap();
        assert_eq!(header.command, cmd::AUDIO_SAMPLES);
        assert_ne!(header.sequence, 0);
        packets += 1;
        pcm_bytes += header.length as usize;
        cursor += consumed + header.length as usize;
    }
    assert_eq!(packets, 8);
    assert_eq!(pcm_bytes, 1536);
}

#[tokio::test]
async fn inbound_audio_reaches_driver_without_prefix() {
    let bus = Bus::new();
    let transport = LoopbackTransport::new();
    let driver = Arc::new(GamepadDriver::default());
    bus.register_driver(driver.clone());
    let adapter = Adapter::new(bus, transport, &GipConfig::default());
    bring_up(&adapter, &[GAMEPAD_CLASS], &[]).await;

    let mut payload = (192u16).to_le_bytes().to_vec();
    payload.extend_from_slice(&[0x11; 192]);
    adapter
        .process_packet(&device_packet(
            cmd::AUDIO_SAMPLES,
            0,
            FLAG_INTERNAL,
            5,
            &payload,
        ))
        .await
        .unwrap();
    settle().await;
    assert!(driver.events().contains(&"audio:192".to_string()));
}
