use thiserror::Error;

/// Failure while reading wire data. Any decode error fails the whole packet:
/// the caller logs it, discards the payload, and keeps running.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bit buffer underrun: wanted {wanted} bits, {available} left")]
    Underrun { wanted: usize, available: usize },
    #[error("unknown entity factory type {0}")]
    UnknownFactoryType(u32),
    #[error("unknown event type {0}")]
    UnknownEventType(u32),
    #[error("wire string of {0} characters exceeds the limit")]
    StringTooLong(usize),
    #[error("non-ascii character in wire string")]
    InvalidCharacter,
    #[error("quantized value out of range")]
    ValueOutOfRange,
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}
