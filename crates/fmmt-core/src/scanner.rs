//! Locates firmware volumes inside a flat device image.

use tracing::{debug, trace};

use crate::error::{FmmtError, Result};
use crate::format::FvHeader;
use crate::format::constants::{FV_HEADER_SIZE, FV_SIGNATURE_OFFSET, FVH_SIGNATURE};

/// Position of one top-level volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLocation {
    pub offset: usize,
    pub length: usize,
}

/// Candidate volume at `offset`, if its header names a recognized file
/// system and the declared length fits in `data`.
fn volume_at(data: &[u8], offset: usize) -> Option<VolumeLocation> {
    let header = FvHeader::from_bytes(&data[offset..]).ok()?;
    if !header.is_recognized_file_system() {
        trace!(offset = %format!("0x{:X}", offset), fs = %header.file_system_guid, "Unknown file system");
        return None;
    }
    let length = usize::try_from(header.fv_length).ok()?;
    if length < header.header_length as usize || offset.checked_add(length)? > data.len() {
        trace!(offset = %format!("0x{:X}", offset), "Declared length out of range");
        return None;
    }
    Some(VolumeLocation { offset, length })
}

/// Slide over `data`, recording every volume and skipping over its whole
/// length once confirmed. Fails with `NotFound` when nothing is found.
pub fn scan_volumes(data: &[u8]) -> Result<Vec<VolumeLocation>> {
    let signature = FVH_SIGNATURE.to_le_bytes();
    let mut found = Vec::new();
    let mut offset = 0usize;
    while offset + FV_HEADER_SIZE <= data.len() {
        let sig_at = offset + FV_SIGNATURE_OFFSET;
        if data[sig_at..sig_at + 4] == signature
            && let Some(location) = volume_at(data, offset)
        {
            debug!(
                offset = %format!("0x{:X}", location.offset),
                length = %format!("0x{:X}", location.length),
                "Found firmware volume"
            );
            found.push(location);
            offset += location.length;
            continue;
        }
        offset += 1;
    }
    if found.is_empty() {
        return Err(FmmtError::not_found("no firmware volume in image"));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testutil::{VolumeBuilder, file_guid, raw_file};

    #[test]
    fn test_finds_volumes_between_filler() {
        let first = VolumeBuilder::new().file(raw_file(file_guid(1), &[1; 8])).build();
        let second = VolumeBuilder::new().blocks(0x800, 1).build();
        let mut image = vec![0xFF; 0x13];
        image.extend_from_slice(&first);
        image.extend_from_slice(&[0u8; 0x20]);
        image.extend_from_slice(&second);

        let found = scan_volumes(&image).unwrap();
        assert_eq!(
            found,
            vec![
                VolumeLocation { offset: 0x13, length: 0x1000 },
                VolumeLocation { offset: 0x1033, length: 0x800 },
            ]
        );
    }

    #[test]
    fn test_truncated_volume_is_skipped() {
        let volume = VolumeBuilder::new().build();
        let err = scan_volumes(&volume[..0x800]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_unknown_file_system_is_skipped() {
        let mut volume = VolumeBuilder::new().build();
        volume[0x10] ^= 0xFF;
        assert_eq!(scan_volumes(&volume).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(scan_volumes(&[]).is_err());
    }
}
