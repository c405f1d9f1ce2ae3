//! Wire message framing and argument primitives.
//!
//! Every message starts with an 8 byte header in host byte order:
//! word 0 is the object id, word 1 packs the total message size (header
//! included) in the upper 16 bits and the opcode in the lower 16 bits.
//! Arguments follow as 32-bit aligned words.

use crate::core::errors::{CoreError, Result};

pub const HEADER_SIZE: usize = 8;

/// Largest size the 16-bit size field can describe with 4-byte alignment.
pub const MAX_MESSAGE_SIZE: usize = 0xfffc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub object_id: u32,
    /// Total message size in bytes, header included
    pub size: u16,
    pub opcode: u16,
}

impl MessageHeader {
    pub fn new(object_id: u32, opcode: u16, size: u16) -> Self {
        Self { object_id, size, opcode }
    }

    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let object_id = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let size_opcode = u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            object_id,
            size: (size_opcode >> 16) as u16,
            opcode: (size_opcode & 0xffff) as u16,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let size_opcode = (u32::from(self.size) << 16) | u32::from(self.opcode);
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.object_id.to_ne_bytes());
        out[4..].copy_from_slice(&size_opcode.to_ne_bytes());
        out
    }

    /// Reject sizes that cannot frame a message.
    pub fn validate(&self) -> Result<()> {
        let size = usize::from(self.size);
        if size < HEADER_SIZE {
            return Err(CoreError::malformed(format!(
                "message size {size} smaller than header (object {}, opcode {})",
                self.object_id, self.opcode
            )));
        }
        if size % 4 != 0 {
            return Err(CoreError::malformed(format!(
                "message size {size} not a multiple of 4 (object {}, opcode {})",
                self.object_id, self.opcode
            )));
        }
        Ok(())
    }
}

/// One decoded message, borrowed from the connection's scratch buffer.
#[derive(Debug, Clone, Copy)]
pub struct WireMessage<'a> {
    pub header: MessageHeader,
    bytes: &'a [u8],
}

impl<'a> WireMessage<'a> {
    /// Wrap the raw bytes of a complete message.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let header_bytes: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| CoreError::malformed(format!("{} bytes cannot hold a header", bytes.len())))?;
        let header = MessageHeader::parse(header_bytes);
        header.validate()?;
        if usize::from(header.size) != bytes.len() {
            return Err(CoreError::malformed(format!(
                "header says {} bytes, got {}",
                header.size,
                bytes.len()
            )));
        }
        Ok(Self { header, bytes })
    }

    pub fn object_id(&self) -> u32 {
        self.header.object_id
    }

    pub fn opcode(&self) -> u16 {
        self.header.opcode
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Header plus payload
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }

    pub fn args(&self) -> ArgReader<'a> {
        ArgReader::new(self.payload())
    }
}

/// Signed 24.8 fixed point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i32);

impl Fixed {
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn from_f64(value: f64) -> Self {
        Self((value * 256.0) as i32)
    }

    pub fn from_int(value: i32) -> Self {
        Self(value << 8)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }

    pub fn to_int(self) -> i32 {
        self.0 / 256
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Sequential reader over a message payload.
#[derive(Debug, Clone)]
pub struct ArgReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(CoreError::malformed(format!(
                "argument needs {len} bytes at offset {}, {} left",
                self.offset,
                self.remaining()
            )));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    pub fn uint(&mut self) -> Result<u32> {
        let word = self.take(4)?;
        Ok(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
    }

    pub fn int(&mut self) -> Result<i32> {
        Ok(self.uint()? as i32)
    }

    pub fn fixed(&mut self) -> Result<Fixed> {
        Ok(Fixed(self.int()?))
    }

    /// Object reference, 0 meaning null.
    pub fn object(&mut self) -> Result<Option<u32>> {
        Ok(Some(self.uint()?).filter(|id| *id != 0))
    }

    pub fn new_id(&mut self) -> Result<u32> {
        match self.uint()? {
            0 => Err(CoreError::malformed("new_id argument is null")),
            id => Ok(id),
        }
    }

    /// Length-prefixed, NUL terminated string. A zero length means null.
    pub fn string(&mut self) -> Result<Option<&'a str>> {
        let len = self.uint()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.take(padded(len))?;
        let (text, nul) = raw[..len].split_at(len - 1);
        if nul[0] != 0 {
            return Err(CoreError::malformed("string argument is not NUL terminated"));
        }
        std::str::from_utf8(text)
            .map(Some)
            .map_err(|e| CoreError::malformed(format!("string argument is not UTF-8: {e}")))
    }

    pub fn array(&mut self) -> Result<&'a [u8]> {
        let len = self.uint()? as usize;
        let raw = self.take(padded(len))?;
        Ok(&raw[..len])
    }
}

/// Builder for outgoing messages.
#[derive(Debug, Clone)]
pub struct MessageWriter {
    object_id: u32,
    opcode: u16,
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new(object_id: u32, opcode: u16) -> Self {
        Self {
            object_id,
            opcode,
            buf: vec![0u8; HEADER_SIZE],
        }
    }

    pub fn uint(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_ne_bytes());
        self
    }

    pub fn int(self, value: i32) -> Self {
        self.uint(value as u32)
    }

    pub fn fixed(self, value: Fixed) -> Self {
        self.int(value.raw())
    }

    pub fn object(self, id: Option<u32>) -> Self {
        self.uint(id.unwrap_or(0))
    }

    pub fn string(self, value: Option<&str>) -> Self {
        match value {
            None => self.uint(0),
            Some(text) => {
                let mut bytes = Vec::with_capacity(text.len() + 1);
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(0);
                self.blob(&bytes)
            }
        }
    }

    pub fn array(self, value: &[u8]) -> Self {
        self.blob(value)
    }

    fn blob(mut self, bytes: &[u8]) -> Self {
        self = self.uint(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self.buf.resize(self.buf.len() + padded(bytes.len()) - bytes.len(), 0);
        self
    }

    /// Patch the header and return the encoded message.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if self.buf.len() > MAX_MESSAGE_SIZE {
            return Err(CoreError::MessageTooLarge {
                size: self.buf.len(),
                capacity: MAX_MESSAGE_SIZE,
            });
        }
        let header = MessageHeader::new(self.object_id, self.opcode, self.buf.len() as u16);
        self.buf[..HEADER_SIZE].copy_from_slice(&header.encode());
        Ok(self.buf)
    }
}
