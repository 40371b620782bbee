//! XDR encoding/decoding (RFC 4506) for the layout and device wire formats

use bytes::{Bytes, BytesMut};

use crate::error::{PnfsError, Result};

/// XDR encoder.
pub struct XdrEncoder {
    buf: BytesMut,
}

impl Default for XdrEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl XdrEncoder {
    /// Creates a new XdrEncoder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Encodes a 32-bit unsigned integer.
    pub fn encode_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Encodes a 64-bit unsigned integer.
    pub fn encode_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Encodes a boolean as a 32-bit integer (0 or 1).
    pub fn encode_bool(&mut self, v: bool) {
        self.encode_u32(if v { 1 } else { 0 });
    }

    /// Encodes fixed-length opaque data (padded to 4-byte boundary).
    pub fn encode_opaque_fixed(&mut self, data: &[u8]) {
        let padding = (4 - (data.len() % 4)) % 4;
        self.buf.extend_from_slice(data);
        self.buf.extend(std::iter::repeat(0u8).take(padding));
    }

    /// Encodes variable-length opaque data (length prefix + padded data).
    pub fn encode_opaque_variable(&mut self, data: &[u8]) {
        self.encode_u32(data.len() as u32);
        self.encode_opaque_fixed(data);
    }

    /// Bytes encoded so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been encoded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the encoder and returns the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// XDR decoder.
pub struct XdrDecoder {
    buf: Bytes,
    pos: usize,
}

impl XdrDecoder {
    /// Creates a new XdrDecoder over encoded bytes.
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn ensure_available(&self, len: usize) -> Result<()> {
        if self.pos + len > self.buf.len() {
            return Err(PnfsError::XdrDecode {
                reason: "truncated data".to_string(),
            });
        }
        Ok(())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure_available(len)?;
        let result = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(result)
    }

    /// Decodes a 32-bit unsigned integer.
    pub fn decode_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decodes a 64-bit unsigned integer.
    pub fn decode_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Decodes a boolean.
    pub fn decode_bool(&mut self) -> Result<bool> {
        Ok(self.decode_u32()? != 0)
    }

    /// Decodes fixed-length opaque data (consuming the padding).
    pub fn decode_opaque_fixed(&mut self, len: usize) -> Result<Vec<u8>> {
        let padding = (4 - (len % 4)) % 4;
        let total = len + padding;
        let result = self.read_bytes(total)?;
        Ok(result[..len].to_vec())
    }

    /// Decodes variable-length opaque data.
    pub fn decode_opaque_variable(&mut self) -> Result<Vec<u8>> {
        let len = self.decode_u32()? as usize;
        if len > self.buf.len() {
            return Err(PnfsError::XdrDecode {
                reason: format!("opaque length {} exceeds buffer", len),
            });
        }
        self.decode_opaque_fixed(len)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
