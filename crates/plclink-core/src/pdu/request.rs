use crate::encoding::{Reader, Writer};
use crate::pdu::FunctionCode;
use crate::{DecodeError, EncodeError, ProtocolError};

/// Largest FC03 quantity that fits one response PDU.
pub const MAX_READ_REGISTERS: u16 = 125;

fn validate_quantity(quantity: u16) -> Result<(), ProtocolError> {
    if quantity == 0 || quantity > MAX_READ_REGISTERS {
        return Err(ProtocolError::InvalidArgument(
            "register quantity must be within 1..=125",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHoldingRegistersRequest {
    pub start_address: u16,
    pub quantity: u16,
}

impl ReadHoldingRegistersRequest {
    pub fn new(start_address: u16, quantity: u16) -> Result<Self, ProtocolError> {
        validate_quantity(quantity)?;
        if u32::from(start_address) + u32::from(quantity) > 0x1_0000 {
            return Err(ProtocolError::InvalidArgument(
                "register range runs past address 0xFFFF",
            ));
        }
        Ok(Self {
            start_address,
            quantity,
        })
    }

    pub fn payload(&self) -> [u8; 4] {
        let [a_hi, a_lo] = self.start_address.to_be_bytes();
        let [q_hi, q_lo] = self.quantity.to_be_bytes();
        [a_hi, a_lo, q_hi, q_lo]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSingleRegisterRequest {
    pub address: u16,
    pub value: u16,
}

impl WriteSingleRegisterRequest {
    pub fn payload(&self) -> [u8; 4] {
        let [a_hi, a_lo] = self.address.to_be_bytes();
        let [v_hi, v_lo] = self.value.to_be_bytes();
        [a_hi, a_lo, v_hi, v_lo]
    }
}

/// A register request as seen on the wire, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters(ReadHoldingRegistersRequest),
    WriteSingleRegister(WriteSingleRegisterRequest),
}

impl Request {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Self::WriteSingleRegister(_) => FunctionCode::WriteSingleRegister,
        }
    }

    pub fn payload(&self) -> [u8; 4] {
        match self {
            Self::ReadHoldingRegisters(req) => req.payload(),
            Self::WriteSingleRegister(req) => req.payload(),
        }
    }

    /// Write function code and payload as a bare PDU.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(self.function_code().as_u8())?;
        w.write_all(&self.payload())
    }

    /// Parse a request PDU; used by the simulated device.
    ///
    /// Function codes other than 03/06 yield `InvalidFunctionCode`, an
    /// out-of-range read quantity yields `InvalidValue`.
    pub fn decode(pdu: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(pdu);
        let function = FunctionCode::from_u8(r.read_u8()?)?;
        let request = match function {
            FunctionCode::ReadHoldingRegisters => {
                let start_address = r.read_be_u16()?;
                let quantity = r.read_be_u16()?;
                validate_quantity(quantity).map_err(|_| DecodeError::InvalidValue)?;
                Self::ReadHoldingRegisters(ReadHoldingRegistersRequest {
                    start_address,
                    quantity,
                })
            }
            FunctionCode::WriteSingleRegister => {
                Self::WriteSingleRegister(WriteSingleRegisterRequest {
                    address: r.read_be_u16()?,
                    value: r.read_be_u16()?,
                })
            }
            FunctionCode::Other(_) => return Err(DecodeError::InvalidFunctionCode),
        };
        r.finish()?;
        Ok(request)
    }
}
