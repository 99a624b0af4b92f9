use crate::ProtocolError;
use crate::encoding::Reader;
use crate::pdu::{ExceptionResponse, FunctionCode, MAX_READ_REGISTERS};

/// Register payload of a validated FC03 response, still borrowed from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterData<'a> {
    data: &'a [u8],
}

impl<'a> RegisterData<'a> {
    pub fn len(&self) -> usize {
        self.data.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u16> {
        let offset = index.checked_mul(2)?;
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + 'a {
        self.data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }
}

/// Outcome of comparing a write response against the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteEcho {
    Matched,
    /// The device acknowledged but echoed something else.
    Mismatched { address: u16, value: u16 },
}

/// Strip and check the function byte, turning exception PDUs into errors.
fn expect_function(pdu: &[u8], expected: u8) -> Result<Reader<'_>, ProtocolError> {
    let Some(&function) = pdu.first() else {
        return Err(ProtocolError::Malformed("empty pdu"));
    };
    if function == expected | FunctionCode::EXCEPTION_FLAG {
        return Err(match ExceptionResponse::decode(pdu) {
            Ok(ex) => ProtocolError::DeviceException(ex),
            Err(_) => ProtocolError::Malformed("exception response without a code byte"),
        });
    }
    if function != expected {
        return Err(ProtocolError::UnexpectedFunctionCode {
            expected,
            actual: function,
        });
    }
    let mut r = Reader::new(pdu);
    r.read_u8()?;
    Ok(r)
}

/// Validate an FC03-style response and borrow its register values.
pub fn decode_read_registers(
    pdu: &[u8],
    expected_function: u8,
    expected_count: u16,
) -> Result<RegisterData<'_>, ProtocolError> {
    if expected_count == 0 || expected_count > MAX_READ_REGISTERS {
        return Err(ProtocolError::InvalidArgument(
            "register quantity must be within 1..=125",
        ));
    }
    let mut r = expect_function(pdu, expected_function)?;
    let byte_count = usize::from(r.read_u8()?);
    if byte_count != usize::from(expected_count) * 2 {
        return Err(ProtocolError::Malformed("byte count does not match requested quantity"));
    }
    if pdu.len() != 2 + byte_count {
        return Err(ProtocolError::Malformed("pdu length does not match byte count"));
    }
    Ok(RegisterData { data: r.rest() })
}

/// Owned variant of [`decode_read_registers`].
#[cfg(feature = "alloc")]
pub fn decode_read_registers_response(
    pdu: &[u8],
    expected_function: u8,
    expected_count: u16,
) -> Result<alloc::vec::Vec<u16>, ProtocolError> {
    Ok(decode_read_registers(pdu, expected_function, expected_count)?
        .iter()
        .collect())
}

/// Validate an FC06 response and compare its echo with the request.
pub fn decode_write_register_response(
    pdu: &[u8],
    address: u16,
    value: u16,
) -> Result<WriteEcho, ProtocolError> {
    let mut r = expect_function(pdu, FunctionCode::WriteSingleRegister.as_u8())?;
    let echoed_address = r.read_be_u16()?;
    let echoed_value = r.read_be_u16()?;
    r.finish()?;
    if echoed_address == address && echoed_value == value {
        Ok(WriteEcho::Matched)
    } else {
        Ok(WriteEcho::Mismatched {
            address: echoed_address,
            value: echoed_value,
        })
    }
}
