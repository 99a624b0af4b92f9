use crate::DecodeError;

/// Forward-only cursor over a borrowed frame or PDU.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_be_u16(&mut self) -> Result<u16, DecodeError> {
        let [hi, lo] = self.read_array::<2>()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_exact(N)?);
        Ok(out)
    }

    /// Everything not consumed yet; the cursor moves to the end.
    pub fn rest(&mut self) -> &'a [u8] {
        let start = self.pos.min(self.buf.len());
        self.pos = self.buf.len();
        &self.buf[start..]
    }

    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Reader;
    use crate::DecodeError;

    #[test]
    fn reads_big_endian_words() {
        let mut r = Reader::new(&[0x00, 0x10, 0xAB, 0xCD, 0x7F]);
        assert_eq!(r.read_be_u16().unwrap(), 0x0010);
        assert_eq!(r.read_be_u16().unwrap(), 0xABCD);
        assert_eq!(r.position(), 4);
        assert_eq!(r.read_be_u16().unwrap_err(), DecodeError::UnexpectedEof);
        assert_eq!(r.read_u8().unwrap(), 0x7F);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn rest_consumes_remaining_bytes() {
        let mut r = Reader::new(&[0x03, 0x02, 0x00, 0x2A]);
        assert_eq!(r.read_u8().unwrap(), 0x03);
        assert_eq!(r.rest(), &[0x02, 0x00, 0x2A]);
        assert!(r.is_empty());
        assert!(r.rest().is_empty());
    }

    #[test]
    fn finish_reports_trailing_bytes() {
        let mut r = Reader::new(&[1, 2, 3]);
        r.read_exact(2).unwrap();
        assert_eq!(r.finish().unwrap_err(), DecodeError::TrailingBytes);
    }
}
