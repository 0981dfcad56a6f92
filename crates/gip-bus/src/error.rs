//! Bus-level error type.

use gip_core::audio::AudioError;
use gip_core::identify::IdentifyError;
use gip_core::message::MessageError;
use gip_core::wire::WireError;

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Identify(#[from] IdentifyError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("no transmit buffer available")]
    NoTxBuffer,

    #[error("chunk write of {len} bytes at offset {offset} overflows declared total {total}")]
    ChunkOverflow {
        offset: usize,
        len: usize,
        total: usize,
    },

    #[error("payload of {0} bytes exceeds what the wire can carry")]
    PayloadTooLarge(usize),

    #[error("transport error: {0}")]
    Transport(TransportError),
}
