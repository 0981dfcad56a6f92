//! gip-bus — the GIP client bus: framing engine, client lifecycle,
//! driver matching, authentication, and audio plumbing behind a single
//! transport seam.

mod adapter;
mod audio;
pub mod auth;
mod chunk;
mod client;
mod driver;
mod error;
mod transport;

pub use adapter::Adapter;
pub use audio::AudioRing;
pub use chunk::ChunkBuffer;
pub use client::{Client, Lifecycle};
pub use driver::{Bus, ClientRef, Driver};
pub use error::BusError;
pub use transport::{BufferKind, Transport, TransportError, TxBuffer};
