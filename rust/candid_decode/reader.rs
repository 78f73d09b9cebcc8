use num_bigint::{BigInt, BigUint};

use super::CandidError;

/// Sequential reader over a byte buffer. All multi-byte integers are
/// little-endian; every read past the end fails with the current offset.
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn has_more(&self) -> bool {
        self.offset < self.buffer.len()
    }

    pub fn read_byte(&mut self) -> Result<u8, CandidError> {
        if !self.has_more() {
            return Err(CandidError::new(
                "Unexpected end of buffer when reading a single byte",
                self.offset,
            ));
        }
        let byte = self.buffer[self.offset];
        self.offset += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8], CandidError> {
        if self.offset + length > self.buffer.len() {
            return Err(CandidError::new(
                format!(
                    "Not enough bytes to read: expected {length}, but only {} available",
                    self.buffer.len() - self.offset
                ),
                self.offset,
            ));
        }
        let bytes = &self.buffer[self.offset..self.offset + length];
        self.offset += length;
        Ok(bytes)
    }

    /// LEB128 unsigned integer, used for `nat` values and lengths.
    pub fn read_uleb128(&mut self) -> Result<BigUint, CandidError> {
        let mut result = BigUint::default();
        let mut shift = 0u64;
        loop {
            let byte = self.read_byte()?;
            result |= BigUint::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// LEB128 length field, converted to usize.
    pub fn read_len(&mut self) -> Result<usize, CandidError> {
        let at = self.offset;
        let value = self.read_uleb128()?;
        usize::try_from(&value)
            .map_err(|_| CandidError::new(format!("Length {value} out of range"), at))
    }

    /// LEB128 signed integer with sign extension on the final 7-bit group,
    /// used for `int` values and type codes.
    pub fn read_sleb128(&mut self) -> Result<BigInt, CandidError> {
        let mut result = BigInt::default();
        let mut shift = 0u64;
        loop {
            let byte = self.read_byte()?;
            result |= BigInt::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if byte & 0x40 != 0 {
                    result -= BigInt::from(1u8) << shift;
                }
                return Ok(result);
            }
        }
    }

    /// SLEB128 type reference (primitive tag or type-table index).
    pub fn read_type_ref(&mut self) -> Result<i64, CandidError> {
        let at = self.offset;
        let value = self.read_sleb128()?;
        i64::try_from(&value)
            .map_err(|_| CandidError::new(format!("Type reference {value} out of range"), at))
    }

    pub fn read_utf8(&mut self, length: usize) -> Result<String, CandidError> {
        let at = self.offset;
        let bytes = self.read_bytes(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CandidError::new("Invalid UTF-8 in text value", at))
    }

    /// Fixed-width little-endian integer, sign-extended when `signed`.
    pub fn read_fixed(&mut self, width: usize, signed: bool) -> Result<i128, CandidError> {
        if self.offset + width > self.buffer.len() {
            return Err(CandidError::new(
                format!("Not enough bytes for {width}-byte number"),
                self.offset,
            ));
        }
        let mut value: i128 = 0;
        for i in 0..width {
            value |= (self.buffer[self.offset + i] as i128) << (8 * i);
        }
        self.offset += width;
        if signed {
            let msb = 1i128 << (width * 8 - 1);
            if value & msb != 0 {
                value -= 1i128 << (width * 8);
            }
        }
        Ok(value)
    }

    pub fn read_f32(&mut self) -> Result<f32, CandidError> {
        if self.offset + 4 > self.buffer.len() {
            return Err(CandidError::new("Not enough bytes for Float32", self.offset));
        }
        let bytes: [u8; 4] = self.buffer[self.offset..self.offset + 4].try_into().unwrap();
        self.offset += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    pub fn read_f64(&mut self) -> Result<f64, CandidError> {
        if self.offset + 8 > self.buffer.len() {
            return Err(CandidError::new("Not enough bytes for Float64", self.offset));
        }
        let bytes: [u8; 8] = self.buffer[self.offset..self.offset + 8].try_into().unwrap();
        self.offset += 8;
        Ok(f64::from_le_bytes(bytes))
    }
}
