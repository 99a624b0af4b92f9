use crate::encoding::{Reader, Writer};
use crate::{DecodeError, EncodeError, FrameError};

pub const MBAP_HEADER_LEN: usize = 7;
/// Header plus function code.
pub const MIN_FRAME_LEN: usize = MBAP_HEADER_LEN + 1;
pub const MAX_PDU_LEN: usize = 253;
pub const MAX_FRAME_LEN: usize = MBAP_HEADER_LEN + MAX_PDU_LEN;

/// Offset of the length field; it counts every byte after itself.
const LENGTH_OFFSET: usize = 4;
const LENGTH_FIELD_END: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit-id byte plus PDU length.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.transaction_id)?;
        w.write_be_u16(self.protocol_id)?;
        w.write_be_u16(self.length)?;
        w.write_u8(self.unit_id)
    }

    /// Reads the seven header bytes without judging them.
    pub fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            transaction_id: r.read_be_u16()?,
            protocol_id: r.read_be_u16()?,
            length: r.read_be_u16()?,
            unit_id: r.read_u8()?,
        })
    }

    /// Total ADU size announced by this header, or `None` when the length
    /// field cannot describe a valid PDU.
    pub fn frame_len(&self) -> Option<usize> {
        let body = usize::from(self.length);
        if body < 2 || body - 1 > MAX_PDU_LEN {
            return None;
        }
        Some(LENGTH_FIELD_END + body)
    }
}

/// A received ADU that passed header validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Function code followed by payload.
    pub pdu: &'a [u8],
}

impl DecodedFrame<'_> {
    pub fn function_code(&self) -> u8 {
        self.pdu[0]
    }
}

/// Write a complete ADU for an already-built PDU.
pub fn encode_frame(
    w: &mut Writer<'_>,
    transaction_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> Result<(), EncodeError> {
    let Some((&function_code, payload)) = pdu.split_first() else {
        return Err(EncodeError::PayloadTooLarge { len: 0 });
    };
    if pdu.len() > MAX_PDU_LEN {
        return Err(EncodeError::PayloadTooLarge { len: pdu.len() });
    }
    write_adu(w, transaction_id, unit_id, function_code, payload)
}

/// Header with a placeholder length, then the PDU, then the length back-filled.
/// Callers have already bounded the PDU to `MAX_PDU_LEN`.
fn write_adu(
    w: &mut Writer<'_>,
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
    payload: &[u8],
) -> Result<(), EncodeError> {
    let start = w.position();
    MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: 0,
        unit_id,
    }
    .encode(w)?;
    w.write_u8(function_code)?;
    w.write_all(payload)?;

    let body = (w.position() - start - LENGTH_FIELD_END) as u16;
    w.patch_be_u16(start + LENGTH_OFFSET, body)
}

/// Build the wire bytes for one request:
/// `length = 1 (unit id) + 1 (function code) + payload.len()`.
#[cfg(feature = "alloc")]
pub fn encode_request(
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
    payload: &[u8],
) -> Result<alloc::vec::Vec<u8>, EncodeError> {
    if payload.len() >= MAX_PDU_LEN {
        return Err(EncodeError::PayloadTooLarge { len: payload.len() });
    }
    let mut out = alloc::vec![0u8; MIN_FRAME_LEN + payload.len()];
    write_adu(
        &mut Writer::new(&mut out),
        transaction_id,
        unit_id,
        function_code,
        payload,
    )?;
    Ok(out)
}

/// Validate an inbound ADU and split it into correlation fields and PDU.
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame<'_>, FrameError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: bytes.len() });
    }
    let mut r = Reader::new(bytes);
    let header =
        MbapHeader::read(&mut r).map_err(|_| FrameError::TooShort { len: bytes.len() })?;
    if header.protocol_id != 0 {
        return Err(FrameError::BadProtocolId(header.protocol_id));
    }
    let actual = bytes.len() - LENGTH_FIELD_END;
    if usize::from(header.length) != actual {
        return Err(FrameError::LengthMismatch {
            declared: header.length,
            actual,
        });
    }
    Ok(DecodedFrame {
        transaction_id: header.transaction_id,
        unit_id: header.unit_id,
        pdu: r.rest(),
    })
}
