use thiserror::Error;

/// Failures raised while encoding or decoding the wire format.
///
/// Transport failures ([`WireError::UnexpectedEof`], [`WireError::Io`]) and
/// decode failures ([`WireError::InsufficientData`] and friends) are both
/// fatal for the call that triggered them. Nothing at this layer retries.
#[derive(Debug, Error)]
pub enum WireError {
    /// A fixed-width or length-prefixed value needed more bytes than the
    /// buffer holds.
    #[error("insufficient data: needed {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },

    /// The underlying stream closed before the expected bytes arrived.
    #[error("premature end of stream: expected {expected} bytes, received {received}")]
    UnexpectedEof { expected: usize, received: usize },

    /// A length prefix was negative where a payload length was expected.
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    /// A payload is too large to be described by a 4-byte length prefix.
    #[error("payload of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    /// A boolean byte other than `0` or `1`.
    #[error("invalid boolean byte: {0:#04x}")]
    InvalidBool(u8),

    #[error("invalid utf-8 string payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
