//! gip-dongle — the wireless dongle multiplexer: turns 802.11 frames
//! from the radio into per-client GIP byte streams and back.

mod dongle;
mod error;
pub mod mac;
pub mod mt76;
mod radio;

pub use dongle::Dongle;
pub use error::DongleError;
pub use radio::{led, RadioMac};
