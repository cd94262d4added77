//! On-disk layouts of firmware volumes, firmware files and sections.

pub mod constants;
pub mod file;
pub mod section;
pub mod volume;

pub use file::{FfsFileHeader, RecordState};
pub use section::{CompressionHeader, GuidDefinedHeader, SectionHeader};
pub use volume::{BlockMapEntry, FvExtHeader, FvHeader};

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid signature: expected 0x{expected:08X}, got 0x{actual:08X}")]
    InvalidSignature { expected: u32, actual: u32 },
    #[error("Invalid header: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn ensure_len(data: &[u8], expected: usize) -> Result<(), HeaderError> {
    if data.len() < expected {
        return Err(HeaderError::BufferTooSmall {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

pub(crate) fn read_u24(bytes: &[u8]) -> usize {
    bytes[0] as usize | (bytes[1] as usize) << 8 | (bytes[2] as usize) << 16
}

pub(crate) fn write_u24(value: usize) -> [u8; 3] {
    [value as u8, (value >> 8) as u8, (value >> 16) as u8]
}

pub fn guid_from_bytes(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    Uuid::from_bytes_le(raw)
}

/// Decode a NUL-terminated UCS-2 string as stored in user-interface and
/// version sections.
pub fn decode_ucs2(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

pub fn encode_ucs2(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    out.extend_from_slice(&[0, 0]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(24, 16), 32);
        assert_eq!(align_up(4096, 4096), 4096);
    }

    #[test]
    fn test_u24() {
        assert_eq!(read_u24(&write_u24(0x123456)), 0x123456);
        assert_eq!(write_u24(0x40), [0x40, 0, 0]);
    }

    #[test]
    fn test_ucs2() {
        let raw = encode_ucs2("Shell");
        assert_eq!(raw.len(), 12);
        assert_eq!(decode_ucs2(&raw), "Shell");
        // trailing garbage after the terminator is ignored
        let mut padded = raw.clone();
        padded.extend_from_slice(&[0x41, 0x00]);
        assert_eq!(decode_ucs2(&padded), "Shell");
    }
}
