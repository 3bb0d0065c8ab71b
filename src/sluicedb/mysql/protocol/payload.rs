use std::cell::Cell;
use std::convert::TryInto;

use crate::sluicedb::{Error, Result};

/// Length-encoded integer prefix meaning NULL (in result rows)
pub const LENENC_NULL: u8 = 0xfb;

/// PayloadReader is a cursor over a packet payload.
/// Like MessageReader in the postgres days, the read_* methods for fixed width
/// values don't fail, they return 0 and set a sticky error flag instead.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: Cell<usize>, // track position for read_xxx methods
    read_past_end: Cell<bool>, // true if we tried to read past the end of the payload
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PayloadReader {
            data,
            pos: Cell::new(0),
            read_past_end: Cell::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns the number of unread bytes
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos.get()
    }

    pub fn tell(&self) -> usize {
        self.pos.get()
    }

    /// error returns an Error if has_error() is true
    pub fn error(&self) -> Result<()> {
        if self.has_error() {
            Err(self.past_end())
        } else {
            Ok(())
        }
    }

    fn past_end(&self) -> Error {
        Error::protocol_error(format!("attempted to read past end of {} byte payload", self.data.len()))
    }

    /// has_error returns true if any of the read_* methods attempted to read beyond the end of the payload
    pub fn has_error(&self) -> bool {
        self.read_past_end.get()
    }

    fn take(&self, n: usize) -> Option<&'a [u8]> {
        let pos = self.pos.get();
        let new_pos = pos + n;
        if new_pos > self.data.len() {
            self.read_past_end.set(true);
            return None;
        }
        self.pos.set(new_pos);
        Some(&self.data[pos..new_pos])
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos.get()).cloned()
    }

    pub fn skip(&self, n: usize) {
        self.take(n);
    }

    /// read_u8 reads a single byte and returns it.
    /// Returns 0 if no bytes left, use error() or has_error() to distinguish between that and an actual 0.
    pub fn read_u8(&self) -> u8 {
        self.take(1).map(|b| b[0]).unwrap_or(0)
    }

    pub fn read_u16(&self) -> u16 {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]])).unwrap_or(0)
    }

    pub fn read_u24(&self) -> u32 {
        self.take(3).map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0])).unwrap_or(0)
    }

    pub fn read_u32(&self) -> u32 {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap_or([0; 4]))).unwrap_or(0)
    }

    pub fn read_u64(&self) -> u64 {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8]))).unwrap_or(0)
    }

    /// Reads a length-encoded integer. Returns None for the NULL marker (0xfb).
    pub fn read_lenenc_int_opt(&self) -> Option<u64> {
        match self.read_u8() {
            LENENC_NULL => None,
            0xfc => Some(self.read_u16() as u64),
            0xfd => Some(self.read_u24() as u64),
            0xfe => Some(self.read_u64()),
            b => Some(b as u64),
        }
    }

    /// Reads a length-encoded integer, NULL reads as 0.
    pub fn read_lenenc_int(&self) -> u64 {
        self.read_lenenc_int_opt().unwrap_or(0)
    }

    /// Reads a length-encoded byte string. Returns None for NULL.
    pub fn read_lenenc_bytes_opt(&self) -> Result<Option<&'a [u8]>> {
        match self.read_lenenc_int_opt() {
            None => Ok(None),
            Some(len) => self.read_bytes(len as usize).map(Some),
        }
    }

    pub fn read_lenenc_bytes(&self) -> Result<&'a [u8]> {
        self.read_lenenc_bytes_opt().map(|b| b.unwrap_or(&[]))
    }

    pub fn read_lenenc_str(&self) -> Result<&'a str> {
        std::str::from_utf8(self.read_lenenc_bytes()?).map_err(Error::from)
    }

    /// read_str reads and returns a null-terminated utf-8 string
    pub fn read_str(&self) -> Result<&'a str> {
        let bytes = self.read_null_terminated_bytes()?;
        std::str::from_utf8(bytes).map_err(Error::from)
    }

    /// read_null_terminated_bytes reads and returns a null-terminated slice of bytes, the null is consumed.
    pub fn read_null_terminated_bytes(&self) -> Result<&'a [u8]> {
        let pos = self.pos.get();
        let bytes = &self.data[pos..];
        if let Some(i) = memchr::memchr(0, bytes) {
            self.pos.set(pos + i + 1);
            Ok(&bytes[..i])
        } else {
            self.read_past_end.set(true);
            Err(self.past_end())
        }
    }

    /// Like read_str, but a missing null terminator just reads to the end of the payload.
    pub fn read_str_or_eof(&self) -> Result<&'a str> {
        let pos = self.pos.get();
        let bytes = &self.data[pos..];
        let (s, consumed) = match memchr::memchr(0, bytes) {
            Some(i) => (&bytes[..i], i + 1),
            None => (bytes, bytes.len()),
        };
        self.pos.set(pos + consumed);
        std::str::from_utf8(s).map_err(Error::from)
    }

    /// read_bytes reads and returns a slice of bytes of the specified length
    pub fn read_bytes(&self, len: usize) -> Result<&'a [u8]> {
        match self.take(len) {
            Some(b) => Ok(b),
            None => Err(self.past_end()),
        }
    }

    /// read_to_end returns the rest of the payload
    pub fn read_to_end(&self) -> &'a [u8] {
        let pos = self.pos.get();
        self.pos.set(self.data.len());
        &self.data[pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fixed_width() {
        let data = [1, 2, 0, 3, 0, 0, 4, 0, 0, 0];
        let r = PayloadReader::new(&data);
        assert_eq!(r.read_u8(), 1);
        assert_eq!(r.read_u16(), 2);
        assert_eq!(r.read_u24(), 3);
        assert_eq!(r.read_u32(), 4);
        assert!(!r.has_error());
        assert_eq!(r.read_u8(), 0);
        assert!(r.has_error());
        assert!(r.error().is_err());
    }

    #[test]
    fn test_read_lenenc() {
        let data = [0xfa, 0xfb, 0xfc, 0x01, 0x02, 0xfd, 1, 2, 3, 3, b'a', b'b', b'c'];
        let r = PayloadReader::new(&data);
        assert_eq!(r.read_lenenc_int(), 250);
        assert_eq!(r.read_lenenc_int_opt(), None);
        assert_eq!(r.read_lenenc_int(), 0x0201);
        assert_eq!(r.read_lenenc_int(), 0x030201);
        assert_eq!(r.read_lenenc_str().unwrap(), "abc");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_read_null_terminated() {
        let data = b"root\0rest";
        let r = PayloadReader::new(data);
        assert_eq!(r.read_str().unwrap(), "root");
        assert!(r.read_str().is_err());
        let r = PayloadReader::new(b"abc");
        assert_eq!(r.read_str_or_eof().unwrap(), "abc");
    }
}
