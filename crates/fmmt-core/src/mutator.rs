//! Single-file add, replace and delete against one volume's bytes.
//!
//! These functions only rewrite the volume buffer. Keeping the model in step
//! (state transitions, directory refresh, re-encapsulation) is up to the
//! caller.

use tracing::{debug, info};

use crate::error::{FmmtError, Result};
use crate::format::constants::{FFS_FILE_ALIGNMENT, FFS_FILE_HEADER_SIZE};
use crate::format::file::{set_state, verify_data_checksum, verify_header_checksum};
use crate::format::{FfsFileHeader, FvHeader, align_up};
use crate::parser::directory::{self, Record};
use crate::space::{Fit, aligned_start, find_free_or_pad_region, merge_adjacent_pad, synthesize_pad};

/// A validated file ready to be placed into one particular volume.
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub bytes: Vec<u8>,
    pub header: FfsFileHeader,
}

impl PreparedFile {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Validate a file image and stamp its state byte for `volume`'s polarity.
/// Trailing bytes past the declared size are dropped.
pub fn prepare_file(bytes: &[u8], volume: &FvHeader) -> Result<PreparedFile> {
    let header = FfsFileHeader::from_bytes(bytes)
        .map_err(|e| FmmtError::InvalidParameter(format!("not a firmware file: {}", e)))?;
    if bytes.len() < header.size {
        return Err(FmmtError::InvalidParameter(format!(
            "file {} declares 0x{:X} bytes but only 0x{:X} were given",
            header.name,
            header.size,
            bytes.len()
        )));
    }
    let mut bytes = bytes[..header.size].to_vec();
    if !verify_header_checksum(&bytes[..header.header_len()]) || !verify_data_checksum(&header, &bytes) {
        return Err(FmmtError::InvalidParameter(format!(
            "file {} fails its checksums",
            header.name
        )));
    }
    if header.is_large() && !volume.supports_large_files() {
        return Err(FmmtError::InvalidParameter(format!(
            "file {} needs a large header, which this volume's file system does not support",
            header.name
        )));
    }
    set_state(&mut bytes, volume.erase_polarity());
    Ok(PreparedFile { bytes, header })
}

fn erase_byte(polarity: bool) -> u8 {
    if polarity { 0xFF } else { 0x00 }
}

/// Write `file` into the region chosen by `fit`.
fn place(data: &mut [u8], fit: &Fit, file: &[u8], volume: &FvHeader) -> Result<()> {
    let (polarity, large_files) = (volume.erase_polarity(), volume.supports_large_files());
    let region = fit.region;
    let file_end = fit.start + file.len();
    let fill_end = if fit.tail_pad > 0 || region.end() - file_end < FFS_FILE_ALIGNMENT {
        region.end()
    } else {
        // Free space: only the bytes we use.
        file_end
    };
    data[region.offset..fill_end].fill(erase_byte(polarity));
    if fit.lead_pad() > 0 {
        synthesize_pad(&mut data[region.offset..fit.start], polarity, large_files)?;
    }
    data[fit.start..file_end].copy_from_slice(file);
    if fit.tail_pad > 0 {
        synthesize_pad(&mut data[region.end() - fit.tail_pad..region.end()], polarity, large_files)?;
    }
    Ok(())
}

/// Insert a file into the first pad large enough, else into free space.
/// Returns the offset the file landed at.
pub fn add(data: &mut [u8], file: &PreparedFile) -> Result<usize> {
    let dir = directory::walk(data)?;
    let fit = find_free_or_pad_region(data, file.len(), file.header.header_len(), file.header.alignment())?
        .ok_or_else(|| {
            FmmtError::aborted(format!(
                "no room for file {} (0x{:X} bytes, 0x{:X} free)",
                file.header.name,
                file.len(),
                dir.end - dir.free_offset
            ))
        })?;
    debug!(
        file = %file.header.name,
        region = ?fit.region.kind,
        offset = %format!("0x{:X}", fit.start),
        "Placing file"
    );
    place(data, &fit, &file.bytes, &dir.header)?;
    Ok(fit.start)
}

fn live_record(data: &[u8], offset: usize) -> Result<(directory::Directory, Record)> {
    let dir = directory::walk(data)?;
    let record = dir
        .record_at(offset)
        .filter(|r| r.state.is_live())
        .cloned()
        .ok_or_else(|| FmmtError::not_found(format!("no live file at 0x{:X}", offset)))?;
    Ok((dir, record))
}

/// Overwrite the file at `old_offset` with `file` if it fits in the old span,
/// optionally extended over an immediately following pad. Returns the new
/// offset, or `None` when the file does not fit.
pub fn replace_in_place(data: &mut [u8], old_offset: usize, file: &PreparedFile) -> Result<Option<usize>> {
    let (dir, old) = live_record(data, old_offset)?;
    let polarity = dir.erase_polarity();
    let large_files = dir.header.supports_large_files();

    let own_end = old.aligned_end().min(dir.end);
    let mut span_ends = vec![own_end];
    if let Some(next) = dir.next_after(&old).filter(|r| r.is_live_pad()) {
        span_ends.push(next.aligned_end().min(dir.end));
    }

    let start = aligned_start(old.offset, file.header.header_len(), file.header.alignment());
    let end = start + file.len();
    for span_end in span_ends {
        if end > span_end {
            continue;
        }
        let aligned_end = align_up(end, FFS_FILE_ALIGNMENT);
        let tail_pad = if span_end - end < FFS_FILE_ALIGNMENT {
            0
        } else if span_end - aligned_end >= FFS_FILE_HEADER_SIZE {
            span_end - aligned_end
        } else {
            continue;
        };

        data[old.offset..span_end].fill(erase_byte(polarity));
        if start > old.offset {
            synthesize_pad(&mut data[old.offset..start], polarity, large_files)?;
        }
        data[start..end].copy_from_slice(&file.bytes);
        if tail_pad > 0 {
            data[end..aligned_end].fill(0);
            synthesize_pad(&mut data[aligned_end..span_end], polarity, large_files)?;
        } else {
            data[end..span_end].fill(0);
        }
        debug!(
            file = %file.header.name,
            offset = %format!("0x{:X}", start),
            tail_pad = tail_pad,
            "Replaced in place"
        );
        return Ok(Some(start));
    }
    Ok(None)
}

/// Where a replacement ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    InPlace { offset: usize },
    /// The new file went elsewhere and the old span became a pad.
    Relocated { offset: usize },
}

impl ReplaceOutcome {
    pub fn is_in_place(&self) -> bool {
        matches!(self, ReplaceOutcome::InPlace { .. })
    }

    pub fn offset(&self) -> usize {
        match *self {
            ReplaceOutcome::InPlace { offset } | ReplaceOutcome::Relocated { offset } => offset,
        }
    }
}

/// Replace in place when possible; otherwise add the new file elsewhere and
/// turn the old one into a pad.
pub fn replace(data: &mut [u8], old_offset: usize, file: &PreparedFile) -> Result<ReplaceOutcome> {
    if let Some(offset) = replace_in_place(data, old_offset, file)? {
        return Ok(ReplaceOutcome::InPlace { offset });
    }
    info!(
        file = %file.header.name,
        old = %format!("0x{:X}", old_offset),
        "Replacement does not fit in place; relocating"
    );
    let offset = add(data, file)?;
    delete(data, old_offset)?;
    Ok(ReplaceOutcome::Relocated { offset })
}

/// Convert the file at `offset` into a pad, merged with a following pad.
pub fn delete(data: &mut [u8], offset: usize) -> Result<()> {
    let (dir, record) = live_record(data, offset)?;
    let end = record.aligned_end().min(dir.end);
    synthesize_pad(&mut data[offset..end], dir.erase_polarity(), dir.header.supports_large_files())?;
    merge_adjacent_pad(data, offset)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::format::constants::{attributes, file_type, guid, section_type};
    use crate::format::file::{alignment_attributes, build_file};
    use crate::format::section::build_section;
    use crate::space::free_space;
    use crate::testutil::*;

    fn header_of(volume: &[u8]) -> FvHeader {
        FvHeader::from_bytes(volume).unwrap()
    }

    fn prepared(volume: &[u8], file: Vec<u8>) -> PreparedFile {
        prepare_file(&file, &header_of(volume)).unwrap()
    }

    fn raw_of(name: u128, total: usize) -> Vec<u8> {
        raw_file(file_guid(name), &vec![name as u8; total - FFS_FILE_HEADER_SIZE])
    }

    fn live_names(volume: &[u8]) -> Vec<(uuid::Uuid, usize)> {
        directory::walk(volume)
            .unwrap()
            .live()
            .map(|r| (r.header.name, r.offset))
            .collect()
    }

    #[test]
    fn test_prepare_validates() {
        let volume = VolumeBuilder::new().erase_polarity(false).build();
        let header = header_of(&volume);
        let mut file = raw_of(1, 40);
        file.extend_from_slice(&[0xEE; 7]);
        let prepared = prepare_file(&file, &header).unwrap();
        assert_eq!(prepared.len(), 40);
        assert_eq!(prepared.bytes[23], 0x07);

        let mut broken = raw_of(1, 40);
        broken[18] ^= 1;
        assert_eq!(
            prepare_file(&broken, &header).unwrap_err().kind(),
            ErrorKind::InvalidParameter
        );
        assert!(prepare_file(&raw_of(1, 40)[..30], &header).is_err());

        let large = build_file(file_guid(2), file_type::RAW, attributes::LARGE_FILE, &[0; 8], true);
        assert!(prepare_file(&large, &header).is_err());
        let ffs3 = VolumeBuilder::new().ffs3().build();
        assert!(prepare_file(&large, &header_of(&ffs3)).is_ok());
    }

    #[test]
    fn test_add_into_free_space() {
        let mut volume = VolumeBuilder::new().file(raw_of(1, 64)).build();
        let file = prepared(&volume, raw_of(2, 40));
        let offset = add(&mut volume, &file).unwrap();
        assert_eq!(offset, 0x48 + 64);
        assert_eq!(&volume[offset..offset + 40], &file.bytes[..]);
        assert_eq!(free_space(&volume).unwrap(), 0x1000 - 0x48 - 64 - 40);
    }

    #[test]
    fn test_add_keeps_clear_of_trailing_data() {
        let mut volume = VolumeBuilder::new().file(raw_of(1, 40)).build();
        let stray = volume.len() - 0x20;
        volume[stray..stray + 4].copy_from_slice(&[0x5A; 4]);

        // Fits the erased span only if it runs over the stray bytes.
        let file = prepared(&volume, raw_of(2, stray - (0x48 + 40) + 0x10));
        assert_eq!(add(&mut volume, &file).unwrap_err().kind(), ErrorKind::Aborted);

        let file = prepared(&volume, raw_of(3, stray - (0x48 + 40)));
        let offset = add(&mut volume, &file).unwrap();
        assert_eq!(offset + file.len(), stray);
        assert_eq!(&volume[stray..stray + 4], &[0x5A; 4]);
    }

    #[test]
    fn test_add_prefers_pad_and_leaves_smaller_pad() {
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 64))
            .pad(0x100)
            .file(raw_of(3, 32))
            .build();
        let free_before = free_space(&volume).unwrap();
        let file = prepared(&volume, raw_of(2, 0x80));
        let offset = add(&mut volume, &file).unwrap();
        assert_eq!(offset, 0x48 + 64);
        assert_eq!(free_space(&volume).unwrap(), free_before);

        let dir = directory::walk(&volume).unwrap();
        assert_eq!(dir.records.len(), 4);
        assert!(dir.records[2].header.is_pad());
        assert_eq!(dir.records[2].header.size, 0x80);
        assert_eq!(dir.records[3].offset, 0x48 + 64 + 0x100);
    }

    #[test]
    fn test_small_slack_in_pad_is_absorbed() {
        let mut volume = VolumeBuilder::new().pad(0x100).file(raw_of(3, 32)).build();
        let file = prepared(&volume, raw_of(2, 0xFD));
        add(&mut volume, &file).unwrap();
        let dir = directory::walk(&volume).unwrap();
        assert_eq!(dir.records.len(), 2);
        assert_eq!(dir.records[1].offset, 0x48 + 0x100);
    }

    #[test]
    fn test_add_that_does_not_fit_is_aborted() {
        // One 3000-byte pad, no other room: a 4000-byte file cannot go in.
        let mut volume = VolumeBuilder::new().blocks(0x400, 3).pad(3000).build();
        let tail = free_space(&volume).unwrap();
        assert!(tail < 4000);
        let file = prepared(&volume, raw_of(2, 4000));
        let before = volume.clone();
        let err = add(&mut volume, &file).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert_eq!(volume, before);

        // The same file fits once a larger free region exists.
        let mut roomy = VolumeBuilder::new().blocks(0x1000, 2).pad(3000).build();
        let file = prepared(&roomy, raw_of(2, 4000));
        assert_eq!(add(&mut roomy, &file).unwrap(), 0x48 + 3000);
    }

    #[test]
    fn test_delete_makes_pad_and_keeps_neighbours() {
        let mut volume = VolumeBuilder::new()
            .file(named_file(file_guid(1), "A", &[0xA; 64]))
            .file(named_file(file_guid(2), "B", &[0xB; 64]))
            .build();
        let before = live_names(&volume);
        let b_offset = before[1].1;
        let b_bytes = volume[b_offset..b_offset + 100].to_vec();

        delete(&mut volume, 0x48).unwrap();
        let dir = directory::walk(&volume).unwrap();
        assert!(dir.records[0].is_live_pad());
        assert_eq!(dir.records[1].offset, b_offset);
        assert_eq!(&volume[b_offset..b_offset + 100], &b_bytes[..]);
        assert_eq!(delete(&mut volume, 0x49).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_delete_merges_following_pad() {
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 64))
            .pad(0x40)
            .file(raw_of(3, 32))
            .build();
        delete(&mut volume, 0x48).unwrap();
        let dir = directory::walk(&volume).unwrap();
        assert_eq!(dir.records.len(), 2);
        assert_eq!(dir.records[0].header.size, 64 + 0x40);
    }

    #[test]
    fn test_add_then_delete_restores_room() {
        let mut volume = VolumeBuilder::new().file(raw_of(1, 64)).build();
        let free_before = directory::walk(&volume).unwrap().free_offset;
        let file = prepared(&volume, named_file(file_guid(9), "Added", &[9; 100]));
        let offset = add(&mut volume, &file).unwrap();
        assert_eq!(offset, free_before);
        delete(&mut volume, offset).unwrap();

        // The freed span is a pad starting where free space used to begin,
        // and the same file lands there again.
        let dir = directory::walk(&volume).unwrap();
        let pad = dir.record_at(free_before).unwrap();
        assert!(pad.is_live_pad());
        assert_eq!(add(&mut volume, &file).unwrap(), free_before);
    }

    #[test]
    fn test_replace_in_place_exact_and_slack() {
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 64))
            .file(raw_of(2, 64))
            .build();
        let smaller = prepared(&volume, raw_of(7, 59));
        let outcome = replace(&mut volume, 0x48, &smaller).unwrap();
        assert_eq!(outcome, ReplaceOutcome::InPlace { offset: 0x48 });
        assert!(outcome.is_in_place());
        assert_eq!(&volume[0x48 + 59..0x48 + 64], &[0; 5]);
        let names = live_names(&volume);
        assert_eq!(names[0].0, file_guid(7));
        assert_eq!(names[1], (file_guid(2), 0x48 + 64));
    }

    #[test]
    fn test_replace_with_trailing_pad() {
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 0x80))
            .file(raw_of(2, 64))
            .build();
        let smaller = prepared(&volume, raw_of(7, 0x40));
        replace(&mut volume, 0x48, &smaller).unwrap();
        let dir = directory::walk(&volume).unwrap();
        assert_eq!(dir.records.len(), 3);
        assert!(dir.records[1].is_live_pad());
        assert_eq!(dir.records[1].header.size, 0x40);
        assert_eq!(dir.records[2].offset, 0x48 + 0x80);
    }

    #[test]
    fn test_replace_absorbs_following_pad() {
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 64))
            .pad(0x40)
            .file(raw_of(2, 64))
            .build();
        let bigger = prepared(&volume, raw_of(7, 64 + 0x40));
        let outcome = replace(&mut volume, 0x48, &bigger).unwrap();
        assert!(outcome.is_in_place());
        let names = live_names(&volume);
        assert_eq!(names, vec![(file_guid(7), 0x48), (file_guid(2), 0x48 + 64 + 0x40)]);
    }

    #[test]
    fn test_replace_falls_back_to_relocation() {
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 64))
            .file(raw_of(2, 64))
            .build();
        let neighbour = volume[0x48 + 64..0x48 + 128].to_vec();
        let bigger = prepared(&volume, raw_of(7, 200));
        let outcome = replace(&mut volume, 0x48, &bigger).unwrap();
        assert_eq!(outcome, ReplaceOutcome::Relocated { offset: 0x48 + 128 });

        let dir = directory::walk(&volume).unwrap();
        assert!(dir.records[0].is_live_pad());
        assert_eq!(&volume[0x48 + 64..0x48 + 128], &neighbour[..]);
        // The old span is reusable.
        let fit = find_free_or_pad_region(&volume, 64, 24, 1).unwrap().unwrap();
        assert_eq!(fit.start, 0x48);
    }

    #[test]
    fn test_replace_with_awkward_slack_relocates() {
        // 8 or 16 spare bytes cannot hold a pad, so the in-place attempt fails.
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 64))
            .file(raw_of(2, 64))
            .build();
        let file = prepared(&volume, raw_of(7, 48));
        assert_eq!(replace_in_place(&mut volume, 0x48, &file).unwrap(), None);
        assert!(!replace(&mut volume, 0x48, &file).unwrap().is_in_place());
    }

    #[test]
    fn test_aligned_files_land_aligned() {
        for n in 0..=16u32 {
            let mut volume = VolumeBuilder::new()
                .blocks(0x1000, 0x40)
                .file(raw_of(1, 40))
                .build();
            let alignment = 1usize << n;
            let content = build_section(section_type::RAW, &[n as u8; 20]);
            let file = build_file(file_guid(2), file_type::FREEFORM, alignment_attributes(alignment), &content, true);
            let file = prepared(&volume, file);
            let offset = add(&mut volume, &file).unwrap();
            assert_eq!(offset % FFS_FILE_ALIGNMENT, 0, "n = {}", n);
            assert_eq!((offset + FFS_FILE_HEADER_SIZE) % alignment, 0, "n = {}", n);
            // The gap in front of it is a walkable pad.
            let names = live_names(&volume);
            assert_eq!(names.last().unwrap(), &(file_guid(2), offset));
        }
    }

    #[test]
    fn test_replace_keeps_top_file_in_place() {
        let mut volume = VolumeBuilder::new()
            .file(raw_of(1, 64))
            .top_file(raw_file(guid::VOLUME_TOP_FILE, &[0x90; 40]))
            .build();
        let bigger = prepared(&volume, raw_of(7, 200));
        replace(&mut volume, 0x48, &bigger).unwrap();
        let names = live_names(&volume);
        assert_eq!(names.last().unwrap(), &(guid::VOLUME_TOP_FILE, 0x1000 - 64));
    }
}
