//! Per-client authentication.
//!
//! A TLS-derived handshake carried inside Authenticate packets. Every
//! payload opens with a 4-byte handshake header `{command, error,
//! length}`; payload-bearing messages nest a data header of the same
//! shape. Host requests advertise the maximum size they will accept in
//! the data header and carry no payload.
//!
//! Version 1 moves a 48-byte pre-master secret under RSA PKCS#1 v1.5;
//! version 2 derives it from an ECDH exchange over P-256. A device
//! declares version 2 by answering the version-1 hello with a data
//! packet whose inner command differs from its outer one.
//!
//! The engine runs as one task per client: inbound dispatch enqueues the
//! raw payloads and returns; crypto runs on the blocking pool. Failure at
//! any point stops the task and leaves the client unauthenticated — the
//! device keeps working, just without a session key.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use zeroize::Zeroizing;

use gip_core::crypto::{
    derive_master_secret, derive_session_key, find_rsa_pubkey, finished_verify, random_bytes,
    rsa_encrypt_premaster, CryptoError, EcdhExchange, MasterSecret, Transcript,
    DEVICE_FINISHED_LABEL, ECDH_POINT_LEN, FINISHED_LEN, HOST_FINISHED_LABEL, PREMASTER_LEN,
};
use gip_core::wire::cmd;

use crate::adapter::Adapter;
use crate::client::{AuthHandle, Client};
use crate::error::BusError;

/// Handshake commands. Version-2 commands occupy a separate range.
pub mod authcmd {
    pub const HOST_HELLO: u8 = 0x01;
    pub const CLIENT_HELLO: u8 = 0x02;
    pub const CLIENT_CERTIFICATE: u8 = 0x03;
    pub const HOST_SECRET: u8 = 0x04;
    pub const HOST_FINISH: u8 = 0x05;
    pub const CLIENT_FINISH: u8 = 0x06;
    /// Control-context completion notice, sent after verification.
    pub const COMPLETE: u8 = 0x07;

    pub const HOST_HELLO2: u8 = 0x11;
    pub const CLIENT_HELLO2: u8 = 0x12;
    pub const CLIENT_CERTIFICATE2: u8 = 0x13;
    pub const CLIENT_PUBKEY2: u8 = 0x14;
    pub const HOST_PUBKEY2: u8 = 0x15;
    pub const HOST_FINISH2: u8 = 0x16;
    pub const CLIENT_FINISH2: u8 = 0x17;
}

/// Wire size of the handshake and data headers.
pub const AUTH_HEADER_LEN: usize = 4;

/// ClientHello payload: 32 random bytes plus 48 opaque bytes.
pub const CLIENT_HELLO_LEN: usize = 80;

/// Largest certificate blob the host will request.
pub const CERTIFICATE_MAX_LEN: usize = 1024;

// ── Packet codec ──────────────────────────────────────────────────────────────

fn write_header(out: &mut Vec<u8>, command: u8, length: u16) {
    out.push(command);
    out.push(0); // error
    out.extend_from_slice(&length.to_be_bytes());
}

/// A payload-bearing handshake message whose inner and outer commands
/// agree (every version-1 message, and version-2 messages after
/// detection).
pub fn build_message(command: u8, payload: &[u8]) -> Vec<u8> {
    build_data_packet(command, command, payload)
}

/// A payload-bearing handshake message with an explicit inner command.
/// Mock devices use a differing inner command to trigger version-2
/// detection.
pub fn build_data_packet(command: u8, data_command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * AUTH_HEADER_LEN + payload.len());
    write_header(&mut out, command, (AUTH_HEADER_LEN + payload.len()) as u16);
    write_header(&mut out, data_command, payload.len() as u16);
    out.extend_from_slice(payload);
    out
}

/// A host request: the data header advertises the maximum accepted
/// payload size and carries nothing.
pub fn build_request(command: u8, max_len: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * AUTH_HEADER_LEN);
    write_header(&mut out, command, AUTH_HEADER_LEN as u16);
    write_header(&mut out, command, max_len);
    out
}

/// A bare handshake header: acknowledgements and the completion notice.
pub fn build_control(command: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(AUTH_HEADER_LEN);
    write_header(&mut out, command, 0);
    out
}

/// A parsed handshake packet.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthMessage<'a> {
    /// Bare handshake header.
    Empty { command: u8 },
    /// Data header with an advertised maximum and no payload.
    Request {
        command: u8,
        data_command: u8,
        max_len: u16,
    },
    /// Payload-bearing message.
    Data {
        command: u8,
        data_command: u8,
        payload: &'a [u8],
    },
}

/// Parse a handshake packet, surfacing peer-signalled errors from either
/// header before anything else.
pub fn parse_packet(bytes: &[u8]) -> Result<AuthMessage<'_>, AuthError> {
    if bytes.len() < AUTH_HEADER_LEN {
        return Err(AuthError::Malformed);
    }
    let command = bytes[0];
    if bytes[1] != 0 {
        return Err(AuthError::Peer(bytes[1]));
    }
    let region_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let region = bytes
        .get(AUTH_HEADER_LEN..AUTH_HEADER_LEN + region_len)
        .ok_or(AuthError::Malformed)?;

    if region.is_empty() {
        return Ok(AuthMessage::Empty { command });
    }
    if region.len() < AUTH_HEADER_LEN {
        return Err(AuthError::Malformed);
    }
    let data_command = region[0];
    if region[1] != 0 {
        return Err(AuthError::Peer(region[1]));
    }
    let payload_len = u16::from_be_bytes([region[2], region[3]]) as usize;
    let payload = &region[AUTH_HEADER_LEN..];

    if payload.is_empty() && payload_len > 0 {
        return Ok(AuthMessage::Request {
            command,
            data_command,
            max_len: payload_len as u16,
        });
    }
    if payload.len() != payload_len {
        return Err(AuthError::Malformed);
    }
    Ok(AuthMessage::Data {
        command,
        data_command,
        payload,
    })
}

/// The transcript-covered region of a packet: everything after the
/// handshake header.
pub fn data_region(packet: &[u8]) -> &[u8] {
    packet.get(AUTH_HEADER_LEN..).unwrap_or(&[])
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitHelloAck,
    WaitClientHello,
    WaitCertificate,
    WaitClientFinish,
    WaitClientHello2,
    WaitCertificate2,
    WaitClientPubkey2,
    WaitClientFinish2,
}

struct Engine {
    adapter: Weak<Adapter>,
    client_id: u8,
    transcript: Transcript,
    host_random: [u8; 32],
    device_random: [u8; 32],
    master: Option<MasterSecret>,
    state: State,
    /// Last handshake command we put on the wire, for diagnostics.
    last_sent: u8,
}

/// Spawn the handshake task for a client and hand back its mailbox.
pub(crate) fn spawn(adapter: Weak<Adapter>, client: &Arc<Client>) -> AuthHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let client_id = client.id();
    let task = tokio::spawn(async move {
        let mut engine = Engine {
            adapter,
            client_id,
            transcript: Transcript::new(),
            host_random: [0u8; 32],
            device_random: [0u8; 32],
            master: None,
            state: State::WaitHelloAck,
            last_sent: 0,
        };
        if let Err(error) = engine.begin() {
            tracing::warn!(client = client_id, %error, "handshake failed to start");
            return;
        }
        while let Some(packet) = rx.recv().await {
            match engine.step(&packet).await {
                Ok(false) => {}
                Ok(true) => break,
                Err(error) => {
                    tracing::warn!(client = client_id,
                        last_sent = format_args!("0x{:02x}", engine.last_sent),
                        %error, "authentication failed");
                    break;
                }
            }
        }
    });
    AuthHandle { tx, task }
}

impl Engine {
    fn begin(&mut self) -> Result<(), AuthError> {
        self.host_random = random_bytes();
        let mut payload = [0u8; 40];
        payload[..32].copy_from_slice(&self.host_random);
        // Trailing eight bytes are opaque on real hardware; zeros work.
        self.send_message(authcmd::HOST_HELLO, &payload)?;
        self.state = State::WaitHelloAck;
        Ok(())
    }

    async fn step(&mut self, packet: &[u8]) -> Result<bool, AuthError> {
        let message = parse_packet(packet)?;
        match self.state {
            State::WaitHelloAck => self.on_hello_response(message),
            State::WaitClientHello => self.on_client_hello(packet, message),
            State::WaitCertificate => self.on_certificate(packet, message).await,
            State::WaitClientFinish => {
                self.on_client_finish(message, authcmd::CLIENT_FINISH)
            }
            State::WaitClientHello2 => self.on_client_hello2(packet, message),
            State::WaitCertificate2 => self.on_certificate2(packet, message),
            State::WaitClientPubkey2 => self.on_client_pubkey2(packet, message).await,
            State::WaitClientFinish2 => {
                self.on_client_finish(message, authcmd::CLIENT_FINISH2)
            }
        }
    }

    // ── Version 1 ─────────────────────────────────────────────────────────────

    fn on_hello_response(&mut self, message: AuthMessage<'_>) -> Result<bool, AuthError> {
        match message {
            AuthMessage::Empty { command } if command == authcmd::HOST_HELLO => {
                self.send_request(authcmd::CLIENT_HELLO, CLIENT_HELLO_LEN as u16)?;
                self.state = State::WaitClientHello;
                Ok(false)
            }
            AuthMessage::Data {
                command,
                data_command,
                ..
            } if data_command != command => {
                // Version-2 device: forget the version-1 hello and start
                // over with the ECDH flavour.
                tracing::debug!(client = self.client_id, "device selected handshake v2");
                self.transcript.reset();
                self.host_random = random_bytes();
                let hello = self.host_random;
                self.send_message(authcmd::HOST_HELLO2, &hello)?;
                self.state = State::WaitClientHello2;
                Ok(false)
            }
            _ => Err(AuthError::Protocol("unexpected response to hello")),
        }
    }

    fn on_client_hello(
        &mut self,
        packet: &[u8],
        message: AuthMessage<'_>,
    ) -> Result<bool, AuthError> {
        let payload = expect_payload(&message, authcmd::CLIENT_HELLO)?;
        if payload.len() != CLIENT_HELLO_LEN {
            return Err(AuthError::Protocol("client hello has wrong size"));
        }
        self.device_random.copy_from_slice(&payload[..32]);
        self.transcript.update(data_region(packet));
        self.send_request(authcmd::CLIENT_CERTIFICATE, CERTIFICATE_MAX_LEN as u16)?;
        self.state = State::WaitCertificate;
        Ok(false)
    }

    async fn on_certificate(
        &mut self,
        packet: &[u8],
        message: AuthMessage<'_>,
    ) -> Result<bool, AuthError> {
        let payload = expect_payload(&message, authcmd::CLIENT_CERTIFICATE)?;
        self.transcript.update(data_region(packet));

        let pubkey = find_rsa_pubkey(payload).ok_or(AuthError::NoKey)?.to_vec();
        // All 48 bytes drawn explicitly; the secret is wiped on drop.
        let premaster = Zeroizing::new(random_bytes::<PREMASTER_LEN>());
        let for_task = premaster.clone();
        let encrypted = tokio::task::spawn_blocking(move || {
            rsa_encrypt_premaster(&pubkey, for_task.as_slice())
        })
        .await
        .map_err(|_| AuthError::Protocol("crypto task aborted"))??;

        let master =
            derive_master_secret(premaster.as_slice(), &self.host_random, &self.device_random);
        self.send_message(authcmd::HOST_SECRET, &encrypted)?;

        let digest = self.transcript.digest();
        let verify = finished_verify(HOST_FINISHED_LABEL, &master, &digest);
        self.master = Some(master);
        self.send_message(authcmd::HOST_FINISH, &verify)?;
        self.state = State::WaitClientFinish;
        Ok(false)
    }

    // ── Version 2 ─────────────────────────────────────────────────────────────

    fn on_client_hello2(
        &mut self,
        packet: &[u8],
        message: AuthMessage<'_>,
    ) -> Result<bool, AuthError> {
        let payload = expect_payload(&message, authcmd::CLIENT_HELLO2)?;
        if payload.len() < 32 {
            return Err(AuthError::Protocol("client hello2 has wrong size"));
        }
        self.device_random.copy_from_slice(&payload[..32]);
        self.transcript.update(data_region(packet));
        self.send_request(authcmd::CLIENT_CERTIFICATE2, CERTIFICATE_MAX_LEN as u16)?;
        self.state = State::WaitCertificate2;
        Ok(false)
    }

    fn on_certificate2(
        &mut self,
        packet: &[u8],
        message: AuthMessage<'_>,
    ) -> Result<bool, AuthError> {
        // Descriptive only; hashed but otherwise ignored.
        expect_payload(&message, authcmd::CLIENT_CERTIFICATE2)?;
        self.transcript.update(data_region(packet));
        self.send_request(authcmd::CLIENT_PUBKEY2, ECDH_POINT_LEN as u16)?;
        self.state = State::WaitClientPubkey2;
        Ok(false)
    }

    async fn on_client_pubkey2(
        &mut self,
        packet: &[u8],
        message: AuthMessage<'_>,
    ) -> Result<bool, AuthError> {
        let payload = expect_payload(&message, authcmd::CLIENT_PUBKEY2)?;
        if payload.len() != ECDH_POINT_LEN {
            return Err(AuthError::Protocol("client pubkey has wrong size"));
        }
        self.transcript.update(data_region(packet));

        let mut peer = [0u8; ECDH_POINT_LEN];
        peer.copy_from_slice(payload);
        let (public, shared) = tokio::task::spawn_blocking(move || {
            let exchange = EcdhExchange::generate();
            let public = exchange.public_point();
            exchange
                .agree(&peer)
                .map(|shared| (public, Zeroizing::new(shared)))
        })
        .await
        .map_err(|_| AuthError::Protocol("crypto task aborted"))??;

        let master =
            derive_master_secret(shared.as_slice(), &self.host_random, &self.device_random);
        self.send_message(authcmd::HOST_PUBKEY2, &public)?;

        let digest = self.transcript.digest();
        let verify = finished_verify(HOST_FINISHED_LABEL, &master, &digest);
        self.master = Some(master);
        self.send_message(authcmd::HOST_FINISH2, &verify)?;
        self.state = State::WaitClientFinish2;
        Ok(false)
    }

    // ── Completion ────────────────────────────────────────────────────────────

    fn on_client_finish(
        &mut self,
        message: AuthMessage<'_>,
        command: u8,
    ) -> Result<bool, AuthError> {
        let payload = expect_payload(&message, command)?;
        if payload.len() != FINISHED_LEN {
            return Err(AuthError::Protocol("client finished has wrong size"));
        }
        let master = self
            .master
            .as_ref()
            .ok_or(AuthError::Protocol("finished before key exchange"))?;
        let expected =
            finished_verify(DEVICE_FINISHED_LABEL, master, &self.transcript.digest());
        if payload != expected.as_slice() {
            return Err(AuthError::TranscriptMismatch);
        }

        let key = derive_session_key(master, &self.host_random, &self.device_random);
        self.send_control(authcmd::COMPLETE)?;

        let Some(adapter) = self.adapter.upgrade() else {
            return Err(AuthError::Protocol("adapter gone"));
        };
        match adapter.install_session_key(key) {
            Ok(()) => {
                tracing::info!(client = self.client_id, "session key installed");
            }
            Err(crate::transport::TransportError::Unsupported) => {
                tracing::debug!(client = self.client_id,
                    "transport does not take an encryption key");
            }
            Err(error) => {
                tracing::warn!(client = self.client_id, %error,
                    "failed to install session key");
            }
        }
        tracing::info!(client = self.client_id, "authentication complete");
        Ok(true)
    }

    // ── Send helpers ──────────────────────────────────────────────────────────

    fn send_raw(&mut self, command: u8, bytes: &[u8]) -> Result<(), AuthError> {
        let Some(adapter) = self.adapter.upgrade() else {
            return Err(AuthError::Protocol("adapter gone"));
        };
        adapter.send_internal(self.client_id, cmd::AUTHENTICATE, bytes)?;
        self.last_sent = command;
        Ok(())
    }

    fn send_message(&mut self, command: u8, payload: &[u8]) -> Result<(), AuthError> {
        let packet = build_message(command, payload);
        self.transcript.update(data_region(&packet));
        self.send_raw(command, &packet)
    }

    fn send_request(&mut self, command: u8, max_len: u16) -> Result<(), AuthError> {
        let packet = build_request(command, max_len);
        self.send_raw(command, &packet)
    }

    fn send_control(&mut self, command: u8) -> Result<(), AuthError> {
        let packet = build_control(command);
        self.send_raw(command, &packet)
    }
}

fn expect_payload<'a>(
    message: &AuthMessage<'a>,
    command: u8,
) -> Result<&'a [u8], AuthError> {
    match message {
        AuthMessage::Data {
            command: outer,
            data_command,
            payload,
        } if *outer == command && *data_command == command => Ok(*payload),
        _ => Err(AuthError::Protocol("unexpected handshake message")),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("certificate contains no usable public key")]
    NoKey,

    #[error("device Finished verification failed")]
    TranscriptMismatch,

    #[error("handshake protocol violation: {0}")]
    Protocol(&'static str),

    #[error("peer signalled handshake error 0x{0:02x}")]
    Peer(u8),

    #[error("malformed handshake packet")]
    Malformed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
