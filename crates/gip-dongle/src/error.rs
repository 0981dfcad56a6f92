//! Dongle-level error type.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DongleError {
    #[error("no free wireless client id")]
    NoWcid,

    #[error("malformed radio frame")]
    MalformedFrame,

    #[error("radio i/o error: {0}")]
    Io(String),

    #[error("timed out waiting for wireless clients to power off")]
    PowerOffTimeout,
}
