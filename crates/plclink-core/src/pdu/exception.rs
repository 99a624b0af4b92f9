use crate::encoding::{Reader, Writer};
use crate::pdu::FunctionCode;
use crate::{DecodeError, EncodeError};
use core::fmt;

/// Exception byte carried by a `function | 0x80` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

/// Coarse grouping of exception codes that callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionKind {
    IllegalFunction,
    IllegalAddress,
    IllegalValue,
    DeviceFailure,
    Busy,
    Other,
}

impl ExceptionCode {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Unknown(raw) => raw,
        }
    }

    pub const fn kind(self) -> ExceptionKind {
        match self {
            Self::IllegalFunction => ExceptionKind::IllegalFunction,
            Self::IllegalDataAddress => ExceptionKind::IllegalAddress,
            Self::IllegalDataValue => ExceptionKind::IllegalValue,
            Self::ServerDeviceFailure => ExceptionKind::DeviceFailure,
            Self::ServerDeviceBusy => ExceptionKind::Busy,
            Self::Acknowledge
            | Self::MemoryParityError
            | Self::GatewayPathUnavailable
            | Self::GatewayTargetFailedToRespond
            | Self::Unknown(_) => ExceptionKind::Other,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => f.write_str("illegal function"),
            Self::IllegalDataAddress => f.write_str("illegal data address"),
            Self::IllegalDataValue => f.write_str("illegal data value"),
            Self::ServerDeviceFailure => f.write_str("server device failure"),
            Self::Acknowledge => f.write_str("acknowledge"),
            Self::ServerDeviceBusy => f.write_str("server device busy"),
            Self::MemoryParityError => f.write_str("memory parity error"),
            Self::GatewayPathUnavailable => f.write_str("gateway path unavailable"),
            Self::GatewayTargetFailedToRespond => f.write_str("gateway target failed to respond"),
            Self::Unknown(raw) => write!(f, "unknown exception {raw:#04x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExceptionResponse {
    /// Function code without the exception bit.
    pub function_code: u8,
    pub exception_code: ExceptionCode,
}

impl ExceptionResponse {
    pub fn kind(&self) -> ExceptionKind {
        self.exception_code.kind()
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(self.function_code | FunctionCode::EXCEPTION_FLAG)?;
        w.write_u8(self.exception_code.as_u8())
    }

    /// Decode an exception PDU from its first two bytes. Anything after the
    /// exception code is ignored; some devices pad these replies.
    pub fn decode(pdu: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(pdu);
        let function_byte = r.read_u8()?;
        if !FunctionCode::is_exception(function_byte) {
            return Err(DecodeError::InvalidFunctionCode);
        }
        let code = r.read_u8()?;
        Ok(Self {
            function_code: function_byte & !FunctionCode::EXCEPTION_FLAG,
            exception_code: ExceptionCode::from_u8(code),
        })
    }
}

impl fmt::Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (function {:#04x}, code {:#04x})",
            self.exception_code,
            self.function_code,
            self.exception_code.as_u8()
        )
    }
}
