// Byte-level primitives for the wire protocol. All integers are big-endian.
//
// Parsers walk a slice with an explicit index and return the advanced index
// together with the value. Writers come in two flavors: the fixed writers
// assume the caller pre-sized the buffer from message-length arithmetic and
// panic on overflow, the safe writers append to a growable BytesMut.

// External crate imports
use bytes::{BufMut, BytesMut};

// Internal crate imports
use crate::errors::Error;

/// Read a big-endian i16 at `idx`.
pub fn parse_i16(data: &[u8], idx: usize) -> Result<(usize, i16), Error> {
    if idx + 2 > data.len() {
        return Err(Error::ParseBytesError(format!(
            "need 2 bytes at offset {idx}, have {}",
            data.len()
        )));
    }
    let value = i16::from_be_bytes([data[idx], data[idx + 1]]);
    Ok((idx + 2, value))
}

/// Read a big-endian i32 at `idx`.
pub fn parse_i32(data: &[u8], idx: usize) -> Result<(usize, i32), Error> {
    if idx + 4 > data.len() {
        return Err(Error::ParseBytesError(format!(
            "need 4 bytes at offset {idx}, have {}",
            data.len()
        )));
    }
    let value = i32::from_be_bytes([data[idx], data[idx + 1], data[idx + 2], data[idx + 3]]);
    Ok((idx + 4, value))
}

/// Read `len` raw bytes at `idx`.
pub fn parse_bytes(data: &[u8], idx: usize, len: usize) -> Result<(usize, Vec<u8>), Error> {
    if idx + len > data.len() {
        return Err(Error::ParseBytesError(format!(
            "need {len} bytes at offset {idx}, have {}",
            data.len()
        )));
    }
    Ok((idx + len, data[idx..idx + len].to_vec()))
}

/// Read a NUL-terminated string at `idx`. Fails when no NUL is found.
pub fn parse_cstring(data: &[u8], idx: usize) -> Result<(usize, String), Error> {
    match data[idx..].iter().position(|&byte| byte == 0) {
        Some(nul) => {
            let value = String::from_utf8_lossy(&data[idx..idx + nul]).to_string();
            Ok((idx + nul + 1, value))
        }
        None => Err(Error::ParseBytesError(format!(
            "unterminated string at offset {idx}"
        ))),
    }
}

// Fixed writers. The buffer is pre-sized, overflow is a programming error.

pub fn write_u8(data: &mut [u8], idx: usize, value: u8) -> usize {
    data[idx] = value;
    idx + 1
}

pub fn write_i16(data: &mut [u8], idx: usize, value: i16) -> usize {
    data[idx..idx + 2].copy_from_slice(&value.to_be_bytes());
    idx + 2
}

pub fn write_i32(data: &mut [u8], idx: usize, value: i32) -> usize {
    data[idx..idx + 4].copy_from_slice(&value.to_be_bytes());
    idx + 4
}

pub fn write_bytes(data: &mut [u8], idx: usize, value: &[u8]) -> usize {
    data[idx..idx + value.len()].copy_from_slice(value);
    idx + value.len()
}

pub fn write_cstring(data: &mut [u8], idx: usize, value: &str) -> usize {
    let idx = write_bytes(data, idx, value.as_bytes());
    write_u8(data, idx, 0)
}

// Safe writers. The buffer grows as needed.

pub fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Backfill a big-endian i32 at `offset`, used to patch a message length
/// after a variable-length body has been written.
pub fn backfill_i32(buf: &mut BytesMut, offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
