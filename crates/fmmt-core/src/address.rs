//! Load address of a top-level volume, needed to rebase code placed into it.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::error::{FmmtError, Result};
use crate::format::SectionHeader;
use crate::format::constants::*;
use crate::model::{DeviceImage, Volume, VolumeId};

/// Image base and size declared by an FSP information header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FspInfo {
    pub image_size: u32,
    pub image_base: u32,
}

impl FspInfo {
    /// Parse the header from a file body: either the header itself or a RAW
    /// section wrapping it.
    pub fn from_content(content: &[u8]) -> Option<Self> {
        let body = match SectionHeader::from_bytes(content) {
            Ok(section) if section.section_type == section_type::RAW && !content.starts_with(FSP_INFO_SIGNATURE) => {
                content.get(section.header_len()..section.size)?
            }
            _ => content,
        };
        if body.len() < FSP_INFO_MIN_SIZE || !body.starts_with(FSP_INFO_SIGNATURE) {
            return None;
        }
        Some(Self {
            image_size: LittleEndian::read_u32(&body[FSP_INFO_IMAGE_SIZE_OFFSET..]),
            image_base: LittleEndian::read_u32(&body[FSP_INFO_IMAGE_BASE_OFFSET..]),
        })
    }
}

fn top_of_memory(image: &DeviceImage, target: &Volume) -> Option<u64> {
    let last = image
        .roots
        .iter()
        .map(|&id| &image.volumes[id])
        .filter(|v| !v.deleted)
        .max_by_key(|v| v.offset)?;
    let top = image.live_files(last.id).last()?;
    if top.name != guid::VOLUME_TOP_FILE {
        return None;
    }
    Some(FOUR_GIB - (image.len() - target.offset) as u64)
}

fn fsp_base(image: &DeviceImage, target: &Volume) -> Option<u64> {
    let mut best = None;
    for &id in &image.roots {
        let volume = &image.volumes[id];
        if volume.deleted || volume.offset > target.offset {
            continue;
        }
        for file in image.live_files(id).filter(|f| f.name == guid::FSP_INFO_FILE) {
            let content = &image.file_bytes(file.id)[file.header.header_len()..];
            let Some(info) = FspInfo::from_content(content) else {
                continue;
            };
            let fsp_end = volume.offset + info.image_size as usize;
            if target.offset + target.len() <= fsp_end {
                debug!(
                    fsp = %volume.name,
                    base = %format!("0x{:X}", info.image_base),
                    "Using FSP information header"
                );
                best = Some(info.image_base as u64 + (target.offset - volume.offset) as u64);
            }
        }
    }
    best
}

/// Base address `volume` is loaded at. Tries the volume top file of the last
/// volume in the image, then an FSP information header at or before the
/// volume. Nested volumes have no fixed address.
pub fn resolve_base_address(image: &DeviceImage, volume: VolumeId) -> Result<u64> {
    let target = image.volume(volume);
    if target.is_child() {
        return Err(FmmtError::not_found(format!(
            "{} is nested and has no load address",
            target.name
        )));
    }
    top_of_memory(image, target)
        .or_else(|| fsp_base(image, target))
        .ok_or_else(|| FmmtError::not_found(format!("no base address marker for {}", target.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testutil::*;

    fn fsp_header(size: u32, base: u32) -> Vec<u8> {
        let mut header = vec![0u8; FSP_INFO_MIN_SIZE + 0x30];
        header[..4].copy_from_slice(FSP_INFO_SIGNATURE);
        let len = header.len() as u32;
        LittleEndian::write_u32(&mut header[4..], len);
        LittleEndian::write_u32(&mut header[FSP_INFO_IMAGE_SIZE_OFFSET..], size);
        LittleEndian::write_u32(&mut header[FSP_INFO_IMAGE_BASE_OFFSET..], base);
        header
    }

    #[test]
    fn test_top_file_address() {
        let env = TestEnv::new();
        let mut data = vec![0xFF; 0x3000];
        data.extend_from_slice(&VolumeBuilder::new().file(raw_file(file_guid(1), &[1; 8])).build());
        data.extend_from_slice(
            &VolumeBuilder::new()
                .top_file(raw_file(guid::VOLUME_TOP_FILE, &[0x90; 16]))
                .build(),
        );
        let image = env.parse(data);
        assert_eq!(image.volumes.len(), 2);
        assert_eq!(resolve_base_address(&image, 0).unwrap(), 0xFFFF_E000);
        assert_eq!(resolve_base_address(&image, 1).unwrap(), 0xFFFF_F000);
    }

    #[test]
    fn test_fsp_header_address() {
        let env = TestEnv::new();
        let fsp = VolumeBuilder::new()
            .file(raw_file(guid::FSP_INFO_FILE, &raw_section(&fsp_header(0x2000, 0xFFE0_0000))))
            .build();
        let mut data = fsp;
        data.extend_from_slice(&VolumeBuilder::new().file(raw_file(file_guid(2), &[2; 8])).build());
        data.extend_from_slice(&VolumeBuilder::new().file(raw_file(file_guid(3), &[3; 8])).build());
        let image = env.parse(data);
        assert_eq!(resolve_base_address(&image, 0).unwrap(), 0xFFE0_0000);
        assert_eq!(resolve_base_address(&image, 1).unwrap(), 0xFFE0_1000);
        // Third volume lies past the declared FSP size.
        let err = resolve_base_address(&image, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_bare_fsp_header_parses() {
        let info = FspInfo::from_content(&fsp_header(0x1000, 0x1234_5000)).unwrap();
        assert_eq!(
            info,
            FspInfo {
                image_size: 0x1000,
                image_base: 0x1234_5000
            }
        );
        assert!(FspInfo::from_content(&[0u8; 8]).is_none());
        assert!(FspInfo::from_content(&raw_section(b"FSPH")).is_none());
    }

    #[test]
    fn test_nested_volume_is_not_found() {
        let env = TestEnv::new();
        let inner = VolumeBuilder::new().blocks(0x200, 1).build();
        let outer = VolumeBuilder::new()
            .file(ffs_file(file_guid(1), file_type::FIRMWARE_VOLUME_IMAGE, &[fv_section(&inner)]))
            .top_file(raw_file(guid::VOLUME_TOP_FILE, &[0x90; 16]))
            .build();
        let image = env.parse(outer);
        assert!(resolve_base_address(&image, 0).is_ok());
        assert_eq!(resolve_base_address(&image, 1).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
