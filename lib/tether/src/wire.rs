//! Bounded little-endian cursor helpers for building and parsing frame
//! payloads. All multi-byte integers on the wire are little-endian and
//! strings are NUL terminated.

use crate::error::{LinkError, LinkResult};
use byteorder::{ByteOrder, LittleEndian};

/// Writer over a fixed destination slice.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    #[inline]
    pub fn new(buf: &'a mut [u8]) -> Writer<'a> {
        Writer { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    fn ensure(&self, count: usize) -> LinkResult<()> {
        if self.buf.len() < self.pos + count {
            Err(LinkError::BufferFull)
        } else {
            Ok(())
        }
    }

    pub fn put_u8(&mut self, value: u8) -> LinkResult<()> {
        self.ensure(1)?;
        self.buf[self.pos] = value;
        self.pos += 1;
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> LinkResult<()> {
        self.ensure(2)?;
        LittleEndian::write_u16(&mut self.buf[self.pos..], value);
        self.pos += 2;
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) -> LinkResult<()> {
        self.ensure(4)?;
        LittleEndian::write_u32(&mut self.buf[self.pos..], value);
        self.pos += 4;
        Ok(())
    }

    /// Append a NUL terminated string.
    pub fn put_str(&mut self, value: &str) -> LinkResult<()> {
        let bytes = value.as_bytes();
        self.ensure(bytes.len() + 1)?;
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.buf[self.pos] = 0;
        self.pos += 1;
        Ok(())
    }
}

/// Reader over a received payload slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    fn ensure(&self, count: usize) -> LinkResult<()> {
        if self.remaining() < count {
            Err(LinkError::BufferEnd)
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> LinkResult<u8> {
        self.ensure(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn get_u16(&mut self) -> LinkResult<u16> {
        self.ensure(2)?;
        let value = LittleEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(value)
    }

    pub fn get_u32(&mut self) -> LinkResult<u32> {
        self.ensure(4)?;
        let value = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(value)
    }

    /// Read up to the next NUL terminator. The terminator is consumed but
    /// not included in the result; a missing terminator ends the string at
    /// the end of the buffer.
    pub fn get_str(&mut self) -> LinkResult<&'a str> {
        let start = self.pos;
        let mut end = self.pos;
        while end < self.buf.len() && self.buf[end] != 0 {
            end += 1;
        }
        self.pos = if end < self.buf.len() { end + 1 } else { end };
        std::str::from_utf8(&self.buf[start..end]).map_err(|_| LinkError::BadParms)
    }
}
