//! Decoder for the variable-length records returned by `read(2)` on an
//! inotify descriptor.
//!
//! Each record is a fixed 16 byte header (`wd: i32`, `mask: u32`,
//! `cookie: u32`, `len: u32`, native endian) followed by `len` bytes of
//! NUL-padded file name.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use super::mask::Mask;

/// Size of the fixed record header.
pub const HEADER_SIZE: usize = 16;

/// Largest single record the kernel can produce (header + `NAME_MAX` + NUL).
pub const MAX_RECORD_SIZE: usize = HEADER_SIZE + 255 + 1;

/// One decoded record borrowing its name from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent<'a> {
    /// Watch descriptor the event belongs to (`-1` for queue overflow).
    pub wd: i32,
    /// Kernel event bits.
    pub mask: Mask,
    /// Links the two halves of a rename.
    pub cookie: u32,
    /// Name inside the watched directory, empty for events on the directory.
    pub name: &'a OsStr,
}

/// A record that does not fit in the remaining bytes of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("truncated inotify record at offset {offset}: need {needed} bytes, have {available}")]
pub struct DecodeError {
    /// Offset of the record header within the buffer.
    pub offset: usize,
    /// Bytes the record claims to need.
    pub needed: usize,
    /// Bytes left in the buffer from `offset`.
    pub available: usize,
}

/// Iterator over the records in one read buffer.
///
/// Yields `Err` once for a truncated record and then stops.
#[derive(Debug, Clone)]
pub struct RecordIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> RecordIter<'a> {
    /// Iterate over the records in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<RawEvent<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }

        let rest = &self.buf[self.offset..];
        let Some(header) = rest.get(..HEADER_SIZE) else {
            self.done = true;
            return Some(Err(DecodeError {
                offset: self.offset,
                needed: HEADER_SIZE,
                available: rest.len(),
            }));
        };

        let wd = i32::from_ne_bytes(word(header, 0));
        let mask = Mask::from_bits_retain(u32::from_ne_bytes(word(header, 4)));
        let cookie = u32::from_ne_bytes(word(header, 8));
        let len = u32::from_ne_bytes(word(header, 12)) as usize;

        let needed = HEADER_SIZE.saturating_add(len);
        let Some(name_bytes) = rest.get(HEADER_SIZE..needed) else {
            self.done = true;
            return Some(Err(DecodeError {
                offset: self.offset,
                needed,
                available: rest.len(),
            }));
        };

        let name_end = name_bytes
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(name_bytes.len());
        let name = OsStr::from_bytes(&name_bytes[..name_end]);

        self.offset += needed;
        Some(Ok(RawEvent {
            wd,
            mask,
            cookie,
            name,
        }))
    }
}

fn word(header: &[u8], at: usize) -> [u8; 4] {
    [header[at], header[at + 1], header[at + 2], header[at + 3]]
}

/// Encode a record the way the kernel lays it out. Test helper.
#[cfg(test)]
pub(crate) fn encode_record(
    wd: i32,
    mask: Mask,
    cookie: u32,
    name: &str,
    padded_len: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + padded_len);
    out.extend_from_slice(&wd.to_ne_bytes());
    out.extend_from_slice(&mask.bits().to_ne_bytes());
    out.extend_from_slice(&cookie.to_ne_bytes());
    out.extend_from_slice(&(padded_len as u32).to_ne_bytes());
    let mut name_buf = name.as_bytes().to_vec();
    name_buf.resize(padded_len, 0);
    out.extend_from_slice(&name_buf);
    out
}
