//! Transport seam between the bus and the I/O driver underneath it.
//!
//! The bus never touches USB or radio endpoints directly; it asks the
//! transport for transmit buffers and hands back filled ones. Intentionally
//! minimal — completion handling, endpoint management, and buffer pooling
//! are transport concerns.

use bytes::BytesMut;

/// Which sub-channel a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Data,
    Audio,
}

/// A transmit buffer on loan from the transport.
///
/// The bus writes at most `capacity` bytes into `data` and returns the
/// buffer through [`Transport::submit_buffer`]; the transport owns it
/// again from that point.
#[derive(Debug)]
pub struct TxBuffer {
    pub kind: BufferKind,
    pub capacity: usize,
    pub data: BytesMut,
}

impl TxBuffer {
    pub fn new(kind: BufferKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            data: BytesMut::with_capacity(capacity),
        }
    }
}

/// The contract a transport presents to the bus.
pub trait Transport: Send + Sync + 'static {
    /// Borrow a transmit buffer. [`TransportError::NoSpace`] when the
    /// pool is exhausted.
    fn get_buffer(&self, kind: BufferKind) -> Result<TxBuffer, TransportError>;

    /// Queue a filled buffer for transmission.
    fn submit_buffer(&self, buffer: TxBuffer) -> Result<(), TransportError>;

    /// Bring up the audio sub-channel.
    fn enable_audio(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Prepare the device-to-host audio path.
    fn init_audio_in(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Prepare the host-to-device audio path for packets of `packet_size`
    /// bytes.
    fn init_audio_out(&self, _packet_size: usize) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Tear the audio sub-channel down.
    fn disable_audio(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Install the link encryption key derived by the handshake.
    fn set_encryption_key(&self, _key: [u8; 16]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no transmit buffer available")]
    NoSpace,

    #[error("transport i/o error: {0}")]
    Io(String),

    #[error("operation not supported by this transport")]
    Unsupported,
}
