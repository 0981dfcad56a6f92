//! Handshake cryptography.
//!
//! GIP authentication is a TLS-1.2-derived handshake: a SHA-256 transcript
//! over the exchanged messages, a P_SHA256 PRF for every derivation, and a
//! pre-master secret moved either by RSA PKCS#1 v1.5 (version 1) or ECDH
//! over P-256 (version 2).
//!
//! Secret material (master secret, pre-master) is wiped from memory when
//! dropped. There is no unsafe code in this module.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

// ── PRF ───────────────────────────────────────────────────────────────────────

/// TLS 1.2 P_SHA256.
///
/// `A(1) = HMAC(key, label || seed)`, `A(i+1) = HMAC(key, A(i))`, output is
/// `HMAC(key, A(1) || label || seed) || HMAC(key, A(2) || label || seed) || …`
/// truncated to `out_len` bytes.
pub fn prf(key: &[u8], label: &str, seed: &[u8], out_len: usize) -> Vec<u8> {
    let mac = |parts: &[&[u8]]| -> [u8; 32] {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    };

    let mut a = mac(&[label.as_bytes(), seed]);
    let mut out = Vec::with_capacity(out_len);
    while out.len() < out_len {
        let block = mac(&[&a, label.as_bytes(), seed]);
        let take = (out_len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        a = mac(&[&a]);
    }
    out
}

// ── Transcript ────────────────────────────────────────────────────────────────

/// Running SHA-256 over the handshake message data regions.
///
/// Finished verification needs intermediate digests without disturbing the
/// running state, so [`Transcript::digest`] finalizes a clone.
#[derive(Clone)]
pub struct Transcript(Sha256);

impl Transcript {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Digest of everything hashed so far; the running state lives on.
    pub fn digest(&self) -> [u8; 32] {
        self.0.clone().finalize().into()
    }

    /// Restart the transcript. Used when a version-2 device is detected
    /// and the version-1 hello must be forgotten.
    pub fn reset(&mut self) {
        self.0 = Sha256::new();
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

// ── Randoms ───────────────────────────────────────────────────────────────────

/// Cryptographically random bytes. The version-1 pre-master secret MUST be
/// drawn through this with `N = 48` — all 48 bytes, explicitly.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

// ── RSA (handshake version 1) ─────────────────────────────────────────────────

/// ASN.1 prefix of the PKCS#1 RSAPublicKey sequence the device embeds in
/// its certificate blob. The certificate's X.509 wrapping violates path
/// validation, so the key is located by this prefix instead.
pub const RSA_PUBKEY_PREFIX: [u8; 4] = [0x30, 0x82, 0x01, 0x0a];

/// Size of the PKCS#1 DER public key, prefix included.
pub const RSA_PUBKEY_LEN: usize = 270;

/// Pre-master secret length for both handshake versions.
pub const PREMASTER_LEN: usize = 48;

/// RSA PKCS#1 v1.5 output length for the 2048-bit device keys.
pub const RSA_ENCRYPTED_LEN: usize = 256;

/// Locate the device RSA public key inside a certificate blob.
pub fn find_rsa_pubkey(certificate: &[u8]) -> Option<&[u8]> {
    let start = certificate
        .windows(RSA_PUBKEY_PREFIX.len())
        .position(|window| window == RSA_PUBKEY_PREFIX)?;
    certificate.get(start..start + RSA_PUBKEY_LEN)
}

/// Encrypt the pre-master secret to the device key (PKCS#1 v1.5).
pub fn rsa_encrypt_premaster(
    pubkey_der: &[u8],
    premaster: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key =
        RsaPublicKey::from_pkcs1_der(pubkey_der).map_err(|_| CryptoError::BadPublicKey)?;
    key.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, premaster)
        .map_err(CryptoError::Rsa)
}

// ── ECDH (handshake version 2) ────────────────────────────────────────────────

/// Raw point size on the wire: X and Y coordinates, no SEC1 tag byte.
pub const ECDH_POINT_LEN: usize = 64;

/// One host-side P-256 exchange.
pub struct EcdhExchange {
    secret: p256::ecdh::EphemeralSecret,
    public: [u8; ECDH_POINT_LEN],
}

impl EcdhExchange {
    pub fn generate() -> Self {
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        let secret = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; ECDH_POINT_LEN];
        public.copy_from_slice(&point.as_bytes()[1..]);
        Self { secret, public }
    }

    /// The host's public point as it goes on the wire (X || Y).
    pub fn public_point(&self) -> [u8; ECDH_POINT_LEN] {
        self.public
    }

    /// Complete the exchange against the device's raw point. The wire KDF
    /// is SHA-256 over the shared X coordinate.
    pub fn agree(self, peer: &[u8; ECDH_POINT_LEN]) -> Result<[u8; 32], CryptoError> {
        let mut sec1 = [0u8; ECDH_POINT_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(peer);
        let peer_key =
            p256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::BadPeerPoint)?;
        let shared = self.secret.diffie_hellman(&peer_key);
        Ok(Sha256::digest(shared.raw_secret_bytes()).into())
    }
}

// ── Derivations ───────────────────────────────────────────────────────────────

pub const MASTER_SECRET_LABEL: &str = "Master Secret";
pub const HOST_FINISHED_LABEL: &str = "Host Finished";
pub const DEVICE_FINISHED_LABEL: &str = "Device Finished";
pub const SESSION_KEY_LABEL: &str = "EXPORTER DAWN data channel session key for controller";

/// Finished verify-data length for both directions.
pub const FINISHED_LEN: usize = 32;

/// The 48-byte master secret. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret {
    bytes: [u8; 48],
}

impl MasterSecret {
    pub fn as_bytes(&self) -> &[u8; 48] {
        &self.bytes
    }
}

fn randoms_seed(host_random: &[u8; 32], device_random: &[u8; 32]) -> [u8; 64] {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(host_random);
    seed[32..].copy_from_slice(device_random);
    seed
}

/// master = PRF(pre, "Master Secret", host_random || device_random)[0..48]
pub fn derive_master_secret(
    premaster: &[u8],
    host_random: &[u8; 32],
    device_random: &[u8; 32],
) -> MasterSecret {
    let seed = randoms_seed(host_random, device_random);
    let out = prf(premaster, MASTER_SECRET_LABEL, &seed, 48);
    let mut bytes = [0u8; 48];
    bytes.copy_from_slice(&out);
    MasterSecret { bytes }
}

/// Finished verify-data over a transcript digest.
pub fn finished_verify(
    label: &str,
    master: &MasterSecret,
    transcript_digest: &[u8; 32],
) -> [u8; 32] {
    let out = prf(master.as_bytes(), label, transcript_digest, FINISHED_LEN);
    let mut verify = [0u8; 32];
    verify.copy_from_slice(&out);
    verify
}

/// The 16-byte link encryption key: one PRF iteration (32 bytes),
/// truncated explicitly.
pub fn derive_session_key(
    master: &MasterSecret,
    host_random: &[u8; 32],
    device_random: &[u8; 32],
) -> [u8; 16] {
    let seed = randoms_seed(host_random, device_random);
    let block = prf(master.as_bytes(), SESSION_KEY_LABEL, &seed, 32);
    let mut key = [0u8; 16];
    key.copy_from_slice(&block[..16]);
    key
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("client RSA public key failed to parse")]
    BadPublicKey,

    #[error("RSA encryption failed: {0}")]
    Rsa(rsa::Error),

    #[error("peer ECDH point is not on the curve")]
    BadPeerPoint,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
