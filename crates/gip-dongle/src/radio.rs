//! Radio MAC seam.
//!
//! The actual MediaTek radio (channel scan, register pokes, firmware
//! upload) lives outside this core; the dongle engine only needs the
//! operations below.

use crate::error::DongleError;
use crate::mac::MacAddr;

/// Dongle LED modes exposed through the external LED surface.
pub mod led {
    pub const OFF: u8 = 0;
    pub const ON: u8 = 1;
    pub const BLINK: u8 = 2;
}

/// Everything the dongle engine asks of the radio.
pub trait RadioMac: Send + Sync + 'static {
    /// Bind a WCID to an associated client address.
    fn associate(&self, wcid: u8, address: MacAddr) -> Result<(), DongleError>;

    /// Release a WCID binding.
    fn disassociate(&self, wcid: u8) -> Result<(), DongleError>;

    /// Install a pairing client address after a pair request.
    fn pair_client(&self, address: MacAddr) -> Result<(), DongleError>;

    /// Start or stop accepting pairing beacons.
    fn set_pairing(&self, enabled: bool) -> Result<(), DongleError>;

    /// Install the per-client link encryption key.
    fn install_key(&self, wcid: u8, key: [u8; 16]) -> Result<(), DongleError>;

    /// Drive the dongle LED.
    fn set_led(&self, mode: u8);

    /// Hold a runtime-wake reference while clients are active.
    fn wake_acquire(&self);
    fn wake_release(&self);

    /// The dongle's own MAC address (source/BSSID on outbound frames).
    fn address(&self) -> MacAddr;

    /// Queue a prepared transfer on the TX bulk endpoint.
    fn send(&self, frame: &[u8]) -> Result<(), DongleError>;
}
