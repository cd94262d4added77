//! Section header codecs (EFI_COMMON_SECTION_HEADER and friends).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use uuid::Uuid;

use super::constants::*;
use super::{HeaderError, ensure_len, guid_from_bytes, read_u24, write_u24};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub section_type: u8,
    /// Total section size, header included.
    pub size: usize,
    /// Whether the 32-bit extended size field is in use.
    pub extended: bool,
}

impl SectionHeader {
    /// Header for a section carrying `body_len` bytes after the common header.
    pub fn new(section_type: u8, body_len: usize) -> Self {
        let compact = SECTION_HEADER_SIZE + body_len;
        if compact >= MAX_SECTION_SIZE {
            Self {
                section_type,
                size: SECTION_HEADER2_SIZE + body_len,
                extended: true,
            }
        } else {
            Self {
                section_type,
                size: compact,
                extended: false,
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, SECTION_HEADER_SIZE)?;
        let compact = read_u24(&data[..3]);
        let section_type = data[3];
        let (size, extended) = if compact == MAX_SECTION_SIZE {
            ensure_len(data, SECTION_HEADER2_SIZE)?;
            let mut cursor = Cursor::new(&data[SECTION_HEADER_SIZE..]);
            (cursor.read_u32::<LittleEndian>()? as usize, true)
        } else {
            (compact, false)
        };
        let header = Self {
            section_type,
            size,
            extended,
        };
        if size < header.header_len() {
            return Err(HeaderError::Invalid(format!(
                "section type 0x{:02X} declares size 0x{:X} smaller than its header",
                section_type, size
            )));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len());
        if self.extended {
            buf.extend_from_slice(&write_u24(MAX_SECTION_SIZE));
            buf.write_u8(self.section_type).unwrap();
            buf.write_u32::<LittleEndian>(self.size as u32).unwrap();
        } else {
            buf.extend_from_slice(&write_u24(self.size));
            buf.write_u8(self.section_type).unwrap();
        }
        buf
    }

    pub fn header_len(&self) -> usize {
        if self.extended {
            SECTION_HEADER2_SIZE
        } else {
            SECTION_HEADER_SIZE
        }
    }

    pub fn body_len(&self) -> usize {
        self.size - self.header_len()
    }
}

/// Type-specific header of a compression section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionHeader {
    pub uncompressed_length: u32,
    pub compression_type: u8,
}

impl CompressionHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, COMPRESSION_HEADER_SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            uncompressed_length: cursor.read_u32::<LittleEndian>()?,
            compression_type: cursor.read_u8()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMPRESSION_HEADER_SIZE);
        buf.write_u32::<LittleEndian>(self.uncompressed_length).unwrap();
        buf.write_u8(self.compression_type).unwrap();
        buf
    }
}

/// Type-specific header of a GUID-defined section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidDefinedHeader {
    pub section_definition_guid: Uuid,
    /// Offset of the encoded data from the start of the whole section.
    pub data_offset: u16,
    pub attributes: u16,
}

impl GuidDefinedHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, GUID_DEFINED_HEADER_SIZE)?;
        let mut cursor = Cursor::new(&data[16..]);
        Ok(Self {
            section_definition_guid: guid_from_bytes(data),
            data_offset: cursor.read_u16::<LittleEndian>()?,
            attributes: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(GUID_DEFINED_HEADER_SIZE);
        buf.extend_from_slice(&self.section_definition_guid.to_bytes_le());
        buf.write_u16::<LittleEndian>(self.data_offset).unwrap();
        buf.write_u16::<LittleEndian>(self.attributes).unwrap();
        buf
    }

    pub fn processing_required(&self) -> bool {
        self.attributes & guided::PROCESSING_REQUIRED != 0
    }
}

/// Wrap `body` in a common section header.
pub fn build_section(section_type: u8, body: &[u8]) -> Vec<u8> {
    let header = SectionHeader::new(section_type, body.len());
    let mut out = header.to_bytes();
    out.extend_from_slice(body);
    out
}

pub fn build_compression_section(compression_type: u8, uncompressed_length: usize, data: &[u8]) -> Vec<u8> {
    let mut body = CompressionHeader {
        uncompressed_length: uncompressed_length as u32,
        compression_type,
    }
    .to_bytes();
    body.extend_from_slice(data);
    build_section(section_type::COMPRESSION, &body)
}

/// Build a GUID-defined section; `extra_header` holds the definition-specific
/// header bytes that sit between the common GUID header and the data.
pub fn build_guided_section(guid: Uuid, attributes: u16, extra_header: &[u8], data: &[u8]) -> Vec<u8> {
    let body_len = GUID_DEFINED_HEADER_SIZE + extra_header.len() + data.len();
    let header = SectionHeader::new(section_type::GUID_DEFINED, body_len);
    let data_offset = header.header_len() + GUID_DEFINED_HEADER_SIZE + extra_header.len();

    let mut out = header.to_bytes();
    out.extend_from_slice(
        &GuidDefinedHeader {
            section_definition_guid: guid,
            data_offset: data_offset as u16,
            attributes,
        }
        .to_bytes(),
    );
    out.extend_from_slice(extra_header);
    out.extend_from_slice(data);
    out
}
