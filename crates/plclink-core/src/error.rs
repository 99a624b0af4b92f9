use crate::pdu::ExceptionResponse;
use core::fmt;

/// Errors raised while writing into a caller-owned output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    BufferTooSmall,
    ValueOutOfRange,
    PayloadTooLarge { len: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => f.write_str("buffer too small"),
            Self::ValueOutOfRange => f.write_str("value out of range"),
            Self::PayloadTooLarge { len } => write!(f, "payload of {len} bytes exceeds frame limit"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}

/// Errors raised by the low-level [`Reader`](crate::encoding::Reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    InvalidFunctionCode,
    InvalidValue,
    TrailingBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => f.write_str("unexpected end of input"),
            Self::InvalidFunctionCode => f.write_str("invalid function code"),
            Self::InvalidValue => f.write_str("invalid value"),
            Self::TrailingBytes => f.write_str("trailing bytes after message"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// Header-level violations of the MBAP wire contract.
///
/// A frame failing with one of these cannot be attributed to any transaction,
/// so receivers drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameError {
    /// Fewer than 8 bytes: not even a function code follows the header.
    TooShort { len: usize },
    BadProtocolId(u16),
    /// The MBAP length field disagrees with the bytes actually received.
    LengthMismatch { declared: u16, actual: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "frame too short ({len} bytes)"),
            Self::BadProtocolId(id) => write!(f, "non-zero protocol id {id:#06x}"),
            Self::LengthMismatch { declared, actual } => write!(
                f,
                "mbap length mismatch (declared {declared}, actual {actual})"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FrameError {}

/// PDU-level failures: bad caller input, device exceptions and responses
/// that do not fit the request they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidArgument(&'static str),
    DeviceException(ExceptionResponse),
    UnexpectedFunctionCode { expected: u8, actual: u8 },
    Malformed(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::DeviceException(ex) => write!(f, "device exception: {ex}"),
            Self::UnexpectedFunctionCode { expected, actual } => write!(
                f,
                "unexpected function code {actual:#04x} (expected {expected:#04x})"
            ),
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnexpectedEof => Self::Malformed("truncated pdu"),
            DecodeError::InvalidFunctionCode => Self::Malformed("invalid function code"),
            DecodeError::InvalidValue => Self::Malformed("invalid value"),
            DecodeError::TrailingBytes => Self::Malformed("trailing bytes"),
        }
    }
}
