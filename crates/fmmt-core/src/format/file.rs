//! Firmware file header (EFI_FFS_FILE_HEADER / EFI_FFS_FILE_HEADER2) codec.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use uuid::Uuid;

use super::constants::*;
use super::{HeaderError, ensure_len, guid_from_bytes, read_u24, write_u24};

const HEADER_CHECKSUM_OFFSET: usize = 16;
const FILE_CHECKSUM_OFFSET: usize = 17;
const STATE_OFFSET: usize = 23;

/// Data alignment exponents selected by the three DATA_ALIGNMENT bits.
const ALIGNMENT_EXPONENTS: [u32; 8] = [0, 4, 7, 9, 10, 12, 15, 16];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfsFileHeader {
    pub name: Uuid,
    pub header_checksum: u8,
    pub file_checksum: u8,
    pub file_type: u8,
    pub attributes: u8,
    /// Total file size, header included.
    pub size: usize,
    pub state: u8,
}

/// Directory-walk classification of a record's state byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Header was never completed.
    Construction,
    /// Header complete but data never committed.
    HeaderOnly,
    Valid,
    MarkedForUpdate,
    Deleted,
    Invalid,
}

impl RecordState {
    /// Whether the directory walk should treat the record as a live file.
    pub fn is_live(&self) -> bool {
        matches!(self, RecordState::Valid)
    }
}

impl FfsFileHeader {
    /// Build a header for `content_len` bytes of content. The large encoding is
    /// used when `attributes` asks for it or the compact size field cannot hold
    /// the file.
    pub fn new(name: Uuid, file_type: u8, attributes: u8, content_len: usize) -> Self {
        let mut attributes = attributes;
        let mut size = FFS_FILE_HEADER_SIZE + content_len;
        if attributes & attributes::LARGE_FILE != 0 || size > MAX_FFS_SIZE {
            attributes |= attributes::LARGE_FILE;
            size = FFS_FILE_HEADER2_SIZE + content_len;
        }
        Self {
            name,
            header_checksum: 0,
            file_checksum: FFS_FIXED_CHECKSUM,
            file_type,
            attributes,
            size,
            state: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, FFS_FILE_HEADER_SIZE)?;
        let attributes = data[19];
        let size = if attributes & attributes::LARGE_FILE != 0 {
            ensure_len(data, FFS_FILE_HEADER2_SIZE)?;
            let mut cursor = Cursor::new(&data[FFS_FILE_HEADER_SIZE..]);
            cursor.read_u64::<LittleEndian>()? as usize
        } else {
            read_u24(&data[20..23])
        };
        let header = Self {
            name: guid_from_bytes(data),
            header_checksum: data[HEADER_CHECKSUM_OFFSET],
            file_checksum: data[FILE_CHECKSUM_OFFSET],
            file_type: data[18],
            attributes,
            size,
            state: data[STATE_OFFSET],
        };
        if size < header.header_len() {
            return Err(HeaderError::Invalid(format!(
                "file {} declares size 0x{:X} smaller than its header",
                header.name, size
            )));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len());
        buf.extend_from_slice(&self.name.to_bytes_le());
        buf.write_u8(self.header_checksum).unwrap();
        buf.write_u8(self.file_checksum).unwrap();
        buf.write_u8(self.file_type).unwrap();
        buf.write_u8(self.attributes).unwrap();
        if self.is_large() {
            buf.extend_from_slice(&[0, 0, 0]);
            buf.write_u8(self.state).unwrap();
            buf.write_u64::<LittleEndian>(self.size as u64).unwrap();
        } else {
            buf.extend_from_slice(&write_u24(self.size));
            buf.write_u8(self.state).unwrap();
        }
        buf
    }

    pub fn is_large(&self) -> bool {
        self.attributes & attributes::LARGE_FILE != 0
    }

    pub fn header_len(&self) -> usize {
        if self.is_large() {
            FFS_FILE_HEADER2_SIZE
        } else {
            FFS_FILE_HEADER_SIZE
        }
    }

    pub fn content_len(&self) -> usize {
        self.size - self.header_len()
    }

    pub fn is_pad(&self) -> bool {
        self.file_type == file_type::FFS_PAD
    }

    pub fn has_data_checksum(&self) -> bool {
        self.attributes & attributes::CHECKSUM != 0
    }

    /// Required alignment of the file content in bytes.
    pub fn alignment(&self) -> usize {
        let index = ((self.attributes & attributes::DATA_ALIGNMENT) >> 3) as u32;
        let exponent = if self.attributes & attributes::DATA_ALIGNMENT_2 != 0 {
            17 + index
        } else {
            ALIGNMENT_EXPONENTS[index as usize]
        };
        1usize << exponent
    }

    pub fn record_state(&self, erase_polarity: bool) -> RecordState {
        classify_state(self.state, erase_polarity)
    }
}

/// Encode a content alignment (bytes, power of two) into attribute bits,
/// rounding up to the next representable value.
pub fn alignment_attributes(alignment: usize) -> u8 {
    let exponent = alignment.max(1).next_power_of_two().trailing_zeros();
    if exponent > 16 {
        let index = (exponent - 17).min(7) as u8;
        return attributes::DATA_ALIGNMENT_2 | (index << 3);
    }
    let index = ALIGNMENT_EXPONENTS
        .iter()
        .position(|&e| e >= exponent)
        .unwrap_or(7) as u8;
    index << 3
}

/// The state byte a committed file carries under the given polarity.
pub fn valid_state(erase_polarity: bool) -> u8 {
    let state = state::HEADER_CONSTRUCTION | state::HEADER_VALID | state::DATA_VALID;
    if erase_polarity { !state } else { state }
}

/// Classify a raw state byte by its highest committed bit.
pub fn classify_state(raw: u8, erase_polarity: bool) -> RecordState {
    let bits = if erase_polarity { !raw } else { raw };
    if bits & state::HEADER_INVALID != 0 {
        RecordState::Invalid
    } else if bits & state::DELETED != 0 {
        RecordState::Deleted
    } else if bits & state::MARKED_FOR_UPDATE != 0 {
        RecordState::MarkedForUpdate
    } else if bits & state::DATA_VALID != 0 {
        RecordState::Valid
    } else if bits & state::HEADER_VALID != 0 {
        RecordState::HeaderOnly
    } else {
        RecordState::Construction
    }
}

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// True when the header bytes (state and file checksum excluded) sum to zero.
pub fn verify_header_checksum(header_bytes: &[u8]) -> bool {
    let sum = sum8(header_bytes)
        .wrapping_sub(header_bytes[STATE_OFFSET])
        .wrapping_sub(header_bytes[FILE_CHECKSUM_OFFSET]);
    sum == 0
}

/// Verify the data checksum of a complete file: content plus the stored
/// checksum byte sum to zero.
pub fn verify_data_checksum(header: &FfsFileHeader, file: &[u8]) -> bool {
    if header.has_data_checksum() {
        sum8(&file[header.header_len()..header.size]).wrapping_add(header.file_checksum) == 0
    } else {
        header.file_checksum == FFS_FIXED_CHECKSUM
    }
}

/// Recompute both checksums of a complete file and stamp the committed state
/// for `erase_polarity`.
pub fn seal_file(file: &mut [u8], erase_polarity: bool) -> Result<(), HeaderError> {
    let header = FfsFileHeader::from_bytes(file)?;
    ensure_len(file, header.size)?;
    let header_len = header.header_len();

    file[FILE_CHECKSUM_OFFSET] = if header.has_data_checksum() {
        0u8.wrapping_sub(sum8(&file[header_len..header.size]))
    } else {
        FFS_FIXED_CHECKSUM
    };
    file[HEADER_CHECKSUM_OFFSET] = 0;
    file[STATE_OFFSET] = 0;
    let sum = sum8(&file[..header_len]).wrapping_sub(file[FILE_CHECKSUM_OFFSET]);
    file[HEADER_CHECKSUM_OFFSET] = 0u8.wrapping_sub(sum);
    file[STATE_OFFSET] = valid_state(erase_polarity);
    Ok(())
}

/// Rewrite only the state byte of a file record in place.
pub fn set_state(file: &mut [u8], erase_polarity: bool) {
    file[STATE_OFFSET] = valid_state(erase_polarity);
}

/// Mark a record deleted by committing the DELETED bit under the polarity.
pub fn mark_deleted(file: &mut [u8], erase_polarity: bool) {
    if erase_polarity {
        file[STATE_OFFSET] &= !state::DELETED;
    } else {
        file[STATE_OFFSET] |= state::DELETED;
    }
}

/// Serialize a complete file from a header template and its content.
pub fn build_file(name: Uuid, file_type: u8, attributes: u8, content: &[u8], erase_polarity: bool) -> Vec<u8> {
    let header = FfsFileHeader::new(name, file_type, attributes, content.len());
    let mut file = header.to_bytes();
    file.extend_from_slice(content);
    // Header and content were produced together, so the size is consistent.
    seal_file(&mut file, erase_polarity).expect("freshly built file header");
    file
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse() {
        let name = Uuid::from_u128(0x11111111_2222_3333_4444_555555555555);
        let file = build_file(name, file_type::RAW, attributes::CHECKSUM, &[1, 2, 3, 4], true);
        assert_eq!(file.len(), 28);
        let header = FfsFileHeader::from_bytes(&file).unwrap();
        assert_eq!(header.name, name);
        assert_eq!(header.size, 28);
        assert_eq!(header.state, 0xF8);
        assert!(verify_header_checksum(&file[..24]));
        assert!(verify_data_checksum(&header, &file));
        assert_eq!(header.record_state(true), RecordState::Valid);
    }

    #[test]
    fn test_data_checksum_detects_corruption() {
        let mut file = build_file(Uuid::nil(), file_type::DRIVER, attributes::CHECKSUM, &[9, 8, 7, 6, 5], false);
        let header = FfsFileHeader::from_bytes(&file).unwrap();
        assert_ne!(header.file_checksum, 0);
        assert!(verify_data_checksum(&header, &file));
        file[26] ^= 0x10;
        assert!(!verify_data_checksum(&header, &file));

        let plain = build_file(Uuid::nil(), file_type::DRIVER, 0, &[9, 8, 7, 6, 5], false);
        let header = FfsFileHeader::from_bytes(&plain).unwrap();
        assert_eq!(header.file_checksum, FFS_FIXED_CHECKSUM);
        assert!(verify_data_checksum(&header, &plain));
    }

    #[test]
    fn test_large_header_selected() {
        let header = FfsFileHeader::new(Uuid::nil(), file_type::RAW, 0, MAX_FFS_SIZE);
        assert!(header.is_large());
        assert_eq!(header.header_len(), FFS_FILE_HEADER2_SIZE);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(FfsFileHeader::from_bytes(&bytes).unwrap().size, header.size);

        let forced = FfsFileHeader::new(Uuid::nil(), file_type::RAW, attributes::LARGE_FILE, 16);
        assert_eq!(forced.size, 48);
        assert_eq!(&forced.to_bytes()[20..23], &[0, 0, 0]);
    }

    #[test]
    fn test_alignment_roundtrip() {
        for exponent in [0u32, 4, 7, 9, 10, 12, 15, 16, 17, 20, 24] {
            let align = 1usize << exponent;
            let mut header = FfsFileHeader::new(Uuid::nil(), file_type::RAW, 0, 0);
            header.attributes = alignment_attributes(align);
            assert_eq!(header.alignment(), align, "exponent {}", exponent);
        }
        // 8-byte alignment is not representable; rounds up to 16.
        assert_eq!(alignment_attributes(8), 1 << 3);
    }

    #[test]
    fn test_state_classification() {
        assert_eq!(classify_state(0x07, false), RecordState::Valid);
        assert_eq!(classify_state(0xF8, true), RecordState::Valid);
        assert_eq!(classify_state(0x0F, false), RecordState::MarkedForUpdate);
        assert_eq!(classify_state(0xE8, true), RecordState::Deleted);
        assert_eq!(classify_state(0x03, false), RecordState::HeaderOnly);

        let mut file = build_file(Uuid::nil(), file_type::RAW, 0, &[0; 8], false);
        mark_deleted(&mut file, false);
        let header = FfsFileHeader::from_bytes(&file).unwrap();
        assert_eq!(header.record_state(false), RecordState::Deleted);
    }
}
