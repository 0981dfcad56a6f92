//! Chunk reassembly — the one-slot buffer a chunked transfer fills.

use gip_core::wire::MAX_CHUNK_TOTAL;

use crate::error::BusError;

/// Reassembly state for one in-flight chunked transfer.
///
/// Created when a start chunk declares its total, written to by every
/// chunk packet, consumed when the zero-length terminator arrives.
#[derive(Debug)]
pub struct ChunkBuffer {
    data: Vec<u8>,
    /// Highest byte offset written so far.
    received: usize,
    full: bool,
}

impl ChunkBuffer {
    pub fn new(total: usize) -> Result<Self, BusError> {
        if total > MAX_CHUNK_TOTAL {
            return Err(BusError::PayloadTooLarge(total));
        }
        Ok(Self {
            data: vec![0u8; total],
            received: 0,
            full: total == 0,
        })
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Copy `bytes` in at `offset`. Anything past the declared total is a
    /// hostile or corrupted transfer and is rejected whole.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), BusError> {
        let end = offset.checked_add(bytes.len()).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(BusError::ChunkOverflow {
                offset,
                len: bytes.len(),
                total: self.data.len(),
            });
        };
        self.data[offset..end].copy_from_slice(bytes);
        self.received = self.received.max(end);
        self.full = self.received == self.data.len();
        Ok(())
    }

    /// Consume the buffer at end-of-transfer. `observed_end` is the
    /// terminator's offset field; transfers that end short of the declared
    /// total yield only the observed prefix.
    pub fn into_payload(self, observed_end: usize) -> Vec<u8> {
        let end = observed_end.min(self.data.len());
        let mut data = self.data;
        data.truncate(end);
        data
    }
}
