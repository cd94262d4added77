//! Firmware volume header (EFI_FIRMWARE_VOLUME_HEADER) codec.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use uuid::Uuid;

use super::constants::*;
use super::{HeaderError, align_up, ensure_len, guid_from_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockMapEntry {
    pub num_blocks: u32,
    pub length: u32,
}

/// Parsed volume header including its block map (terminator excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FvHeader {
    pub zero_vector: [u8; 16],
    pub file_system_guid: Uuid,
    pub fv_length: u64,
    pub signature: u32,
    pub attributes: u32,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub reserved: u8,
    pub revision: u8,
    pub block_map: Vec<BlockMapEntry>,
}

impl FvHeader {
    pub const SIZE: usize = FV_HEADER_SIZE;

    /// Build a fresh header for a volume of `num_blocks * block_size` bytes.
    pub fn new(file_system_guid: Uuid, attributes: u32, block_size: u32, num_blocks: u32) -> Self {
        let mut header = Self {
            zero_vector: [0; 16],
            file_system_guid,
            fv_length: block_size as u64 * num_blocks as u64,
            signature: FVH_SIGNATURE,
            attributes,
            header_length: (FV_HEADER_SIZE + 2 * FV_BLOCK_MAP_ENTRY_SIZE) as u16,
            checksum: 0,
            ext_header_offset: 0,
            reserved: 0,
            revision: FFS_REVISION,
            block_map: vec![BlockMapEntry {
                num_blocks,
                length: block_size,
            }],
        };
        header.update_checksum();
        header
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, FV_HEADER_SIZE)?;
        let mut cursor = Cursor::new(data);

        let mut zero_vector = [0u8; 16];
        cursor.read_exact(&mut zero_vector)?;
        let mut guid = [0u8; 16];
        cursor.read_exact(&mut guid)?;
        let fv_length = cursor.read_u64::<LittleEndian>()?;
        let signature = cursor.read_u32::<LittleEndian>()?;
        if signature != FVH_SIGNATURE {
            return Err(HeaderError::InvalidSignature {
                expected: FVH_SIGNATURE,
                actual: signature,
            });
        }
        let attributes = cursor.read_u32::<LittleEndian>()?;
        let header_length = cursor.read_u16::<LittleEndian>()?;
        let checksum = cursor.read_u16::<LittleEndian>()?;
        let ext_header_offset = cursor.read_u16::<LittleEndian>()?;
        let reserved = cursor.read_u8()?;
        let revision = cursor.read_u8()?;

        let header_length_usize = header_length as usize;
        if header_length_usize < FV_HEADER_SIZE + FV_BLOCK_MAP_ENTRY_SIZE {
            return Err(HeaderError::Invalid(format!(
                "header length 0x{:X} too small",
                header_length
            )));
        }
        ensure_len(data, header_length_usize)?;

        let mut block_map = Vec::new();
        let mut terminated = false;
        while (cursor.position() as usize) + FV_BLOCK_MAP_ENTRY_SIZE <= header_length_usize {
            let num_blocks = cursor.read_u32::<LittleEndian>()?;
            let length = cursor.read_u32::<LittleEndian>()?;
            if num_blocks == 0 && length == 0 {
                terminated = true;
                break;
            }
            block_map.push(BlockMapEntry { num_blocks, length });
        }
        if !terminated || block_map.is_empty() {
            return Err(HeaderError::Invalid("malformed block map".into()));
        }

        Ok(Self {
            zero_vector,
            file_system_guid: Uuid::from_bytes_le(guid),
            fv_length,
            signature,
            attributes,
            header_length,
            checksum,
            ext_header_offset,
            reserved,
            revision,
            block_map,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_length as usize);
        buf.extend_from_slice(&self.zero_vector);
        buf.extend_from_slice(&self.file_system_guid.to_bytes_le());
        buf.write_u64::<LittleEndian>(self.fv_length).unwrap();
        buf.write_u32::<LittleEndian>(self.signature).unwrap();
        buf.write_u32::<LittleEndian>(self.attributes).unwrap();
        buf.write_u16::<LittleEndian>(self.header_length).unwrap();
        buf.write_u16::<LittleEndian>(self.checksum).unwrap();
        buf.write_u16::<LittleEndian>(self.ext_header_offset).unwrap();
        buf.write_u8(self.reserved).unwrap();
        buf.write_u8(self.revision).unwrap();
        for entry in &self.block_map {
            buf.write_u32::<LittleEndian>(entry.num_blocks).unwrap();
            buf.write_u32::<LittleEndian>(entry.length).unwrap();
        }
        buf.extend_from_slice(&[0u8; FV_BLOCK_MAP_ENTRY_SIZE]);
        // Vendor headers may declare a longer header than the block map needs.
        if buf.len() < self.header_length as usize {
            buf.resize(self.header_length as usize, 0);
        }
        buf
    }

    pub fn erase_polarity(&self) -> bool {
        self.attributes & FVB2_ERASE_POLARITY != 0
    }

    pub fn erase_byte(&self) -> u8 {
        if self.erase_polarity() { 0xFF } else { 0x00 }
    }

    pub fn is_recognized_file_system(&self) -> bool {
        self.file_system_guid == guid::FIRMWARE_FILE_SYSTEM2
            || self.file_system_guid == guid::FIRMWARE_FILE_SYSTEM3
    }

    pub fn supports_large_files(&self) -> bool {
        self.file_system_guid == guid::FIRMWARE_FILE_SYSTEM3
    }

    /// Size of the first (usually only) block-map entry.
    pub fn block_size(&self) -> u32 {
        self.block_map.first().map(|e| e.length).unwrap_or(0)
    }

    /// Recompute the 16-bit header checksum.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        let sum = checksum16(&self.to_bytes());
        self.checksum = 0u16.wrapping_sub(sum);
    }

    /// Resize the volume, rewriting a single-entry block map to match.
    pub fn set_length(&mut self, length: u64) -> Result<(), HeaderError> {
        let block_size = self.block_size() as u64;
        if block_size == 0 || length % block_size != 0 || self.block_map.len() != 1 {
            return Err(HeaderError::Invalid(format!(
                "cannot resize volume to 0x{:X} with this block map",
                length
            )));
        }
        self.fv_length = length;
        self.block_map[0].num_blocks = (length / block_size) as u32;
        self.update_checksum();
        Ok(())
    }
}

/// Rewrite the length fields of a raw header in place (single-entry block map)
/// and refresh its checksum. Bytes past the block map are left untouched.
pub fn patch_length(raw: &mut [u8], length: u64) -> Result<(), HeaderError> {
    let mut header = FvHeader::from_bytes(raw)?;
    header.set_length(length)?;
    let header_length = header.header_length as usize;
    raw[0x20..0x28].copy_from_slice(&length.to_le_bytes());
    raw[FV_HEADER_SIZE..FV_HEADER_SIZE + 4]
        .copy_from_slice(&header.block_map[0].num_blocks.to_le_bytes());
    raw[0x32..0x34].copy_from_slice(&[0, 0]);
    let sum = checksum16(&raw[..header_length]);
    raw[0x32..0x34].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());
    Ok(())
}

/// Sum of little-endian 16-bit words, used by the volume header checksum.
pub fn checksum16(data: &[u8]) -> u16 {
    data.chunks(2).fold(0u16, |sum, c| {
        let word = if c.len() == 2 {
            u16::from_le_bytes([c[0], c[1]])
        } else {
            c[0] as u16
        };
        sum.wrapping_add(word)
    })
}

/// Returns true when the raw header bytes checksum to zero.
pub fn verify_header_checksum(raw: &[u8], header_length: usize) -> bool {
    raw.len() >= header_length && checksum16(&raw[..header_length]) == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FvExtHeader {
    pub fv_name: Uuid,
    pub ext_header_size: u32,
}

impl FvExtHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, FV_EXT_HEADER_SIZE)?;
        let mut cursor = Cursor::new(&data[16..]);
        Ok(Self {
            fv_name: guid_from_bytes(data),
            ext_header_size: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Offset of the first file record: after the extended header when present,
/// rounded to the file alignment.
pub fn content_offset(header: &FvHeader, data: &[u8]) -> Result<usize, HeaderError> {
    let raw_end = if header.ext_header_offset != 0 {
        let ext_offset = header.ext_header_offset as usize;
        ensure_len(data, ext_offset + FV_EXT_HEADER_SIZE)?;
        let ext = FvExtHeader::from_bytes(&data[ext_offset..])?;
        ext_offset + ext.ext_header_size as usize
    } else {
        header.header_length as usize
    };
    Ok(align_up(raw_end, FFS_FILE_ALIGNMENT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_checksums_to_zero() {
        let header = FvHeader::new(guid::FIRMWARE_FILE_SYSTEM2, FVB2_ERASE_POLARITY, 0x1000, 4);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 0x48);
        assert!(verify_header_checksum(&bytes, header.header_length as usize));
        assert_eq!(&bytes[FV_SIGNATURE_OFFSET..FV_SIGNATURE_OFFSET + 4], b"_FVH");
    }

    #[test]
    fn test_parse_back() {
        let header = FvHeader::new(guid::FIRMWARE_FILE_SYSTEM3, 0, 0x200, 8);
        let parsed = FvHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.fv_length, 0x1000);
        assert!(!parsed.erase_polarity());
        assert!(parsed.supports_large_files());
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = FvHeader::new(guid::FIRMWARE_FILE_SYSTEM2, 0, 0x200, 8).to_bytes();
        bytes[FV_SIGNATURE_OFFSET] = b'X';
        assert!(matches!(
            FvHeader::from_bytes(&bytes),
            Err(HeaderError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_set_length_updates_block_map() {
        let mut header = FvHeader::new(guid::FIRMWARE_FILE_SYSTEM2, 0, 0x1000, 2);
        header.set_length(0x4000).unwrap();
        assert_eq!(header.block_map[0].num_blocks, 4);
        assert!(verify_header_checksum(&header.to_bytes(), 0x48));
        assert!(header.set_length(0x4100).is_err());
    }

    #[test]
    fn test_patch_length_in_place() {
        let mut raw = FvHeader::new(guid::FIRMWARE_FILE_SYSTEM2, FVB2_ERASE_POLARITY, 0x1000, 2).to_bytes();
        let before = raw.clone();
        patch_length(&mut raw, 0x2000).unwrap();
        assert_eq!(raw, before);

        patch_length(&mut raw, 0x3000).unwrap();
        let parsed = FvHeader::from_bytes(&raw).unwrap();
        assert_eq!(parsed.fv_length, 0x3000);
        assert_eq!(parsed.block_map[0].num_blocks, 3);
        assert!(verify_header_checksum(&raw, 0x48));
    }
}
