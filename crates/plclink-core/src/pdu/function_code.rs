use crate::DecodeError;

/// Function codes the engine speaks. Anything else is carried verbatim in
/// [`FunctionCode::Other`] so servers can answer it with an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionCode {
    ReadHoldingRegisters,
    WriteSingleRegister,
    Other(u8),
}

impl FunctionCode {
    /// Bit 7 marks an exception response.
    pub const EXCEPTION_FLAG: u8 = 0x80;

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::ReadHoldingRegisters => 0x03,
            Self::WriteSingleRegister => 0x06,
            Self::Other(code) => code,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        if Self::is_exception(value) {
            return Err(DecodeError::InvalidFunctionCode);
        }
        Ok(match value {
            0x03 => Self::ReadHoldingRegisters,
            0x06 => Self::WriteSingleRegister,
            other => Self::Other(other),
        })
    }

    pub const fn is_exception(value: u8) -> bool {
        (value & Self::EXCEPTION_FLAG) != 0
    }
}
