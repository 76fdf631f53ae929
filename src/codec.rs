//! Little-endian primitives shared by the container format and the card
//! wire protocol.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::CodecError;

/// Cursor over a borrowed byte slice.
///
/// Every read states how many bytes it wants; asking for more than what is
/// left fails with [`CodecError::TruncatedInput`] and leaves the cursor where
/// it was.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything after the cursor, without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let available = self.remaining();
        if n > available {
            return Err(CodecError::TruncatedInput {
                needed: n,
                available,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(LittleEndian::read_i16(self.read_bytes(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(LittleEndian::read_i32(self.read_bytes(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(LittleEndian::read_i64(self.read_bytes(8)?))
    }
}

/// Writer over any [`Write`] sink. A short or failed write on the sink is
/// reported as [`CodecError::SinkError`].
pub struct ByteWriter<W: Write> {
    sink: W,
}

impl<W: Write> ByteWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.sink.write_all(bytes).map_err(CodecError::SinkError)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.sink.write_u8(v).map_err(CodecError::SinkError)
    }

    pub fn write_i8(&mut self, v: i8) -> Result<(), CodecError> {
        self.sink.write_i8(v).map_err(CodecError::SinkError)
    }

    pub fn write_bool(&mut self, v: bool) -> Result<(), CodecError> {
        self.write_u8(u8::from(v))
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), CodecError> {
        self.sink
            .write_u16::<LittleEndian>(v)
            .map_err(CodecError::SinkError)
    }

    pub fn write_i16(&mut self, v: i16) -> Result<(), CodecError> {
        self.sink
            .write_i16::<LittleEndian>(v)
            .map_err(CodecError::SinkError)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), CodecError> {
        self.sink
            .write_u32::<LittleEndian>(v)
            .map_err(CodecError::SinkError)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.sink
            .write_i32::<LittleEndian>(v)
            .map_err(CodecError::SinkError)
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), CodecError> {
        self.sink
            .write_u64::<LittleEndian>(v)
            .map_err(CodecError::SinkError)
    }

    pub fn write_i64(&mut self, v: i64) -> Result<(), CodecError> {
        self.sink
            .write_i64::<LittleEndian>(v)
            .map_err(CodecError::SinkError)
    }
}
