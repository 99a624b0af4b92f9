use crate::EncodeError;

/// Cursor over a caller-owned output buffer.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn as_written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), EncodeError> {
        self.write_all(&[value])
    }

    pub fn write_be_u16(&mut self, value: u16) -> Result<(), EncodeError> {
        self.write_all(&value.to_be_bytes())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        if self.remaining() < data.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        let end = self.pos + data.len();
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    /// Overwrite a big-endian word that was already written at `offset`.
    ///
    /// Used to back-fill length fields once the body size is known.
    pub fn patch_be_u16(&mut self, offset: usize, value: u16) -> Result<(), EncodeError> {
        let end = offset.checked_add(2).ok_or(EncodeError::ValueOutOfRange)?;
        if end > self.pos {
            return Err(EncodeError::ValueOutOfRange);
        }
        self.buf[offset..end].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Writer;
    use crate::EncodeError;

    #[test]
    fn writes_and_patches_words() {
        let mut buf = [0u8; 5];
        let mut w = Writer::new(&mut buf);
        w.write_be_u16(0).unwrap();
        w.write_u8(0x06).unwrap();
        w.write_be_u16(0x00FF).unwrap();
        w.patch_be_u16(0, 0x1234).unwrap();
        assert_eq!(w.as_written(), &[0x12, 0x34, 0x06, 0x00, 0xFF]);
        assert_eq!(w.remaining(), 0);
    }

    #[test]
    fn rejects_overflow_and_unwritten_patch() {
        let mut buf = [0u8; 2];
        let mut w = Writer::new(&mut buf);
        w.write_u8(1).unwrap();
        assert_eq!(w.patch_be_u16(0, 7).unwrap_err(), EncodeError::ValueOutOfRange);
        assert_eq!(w.write_be_u16(7).unwrap_err(), EncodeError::BufferTooSmall);
        assert_eq!(w.position(), 1);
    }
}
