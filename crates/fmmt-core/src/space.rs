//! Free space and pad file management inside a volume's bytes.
//!
//! Every placement keeps two rules: a record starts on an 8-byte boundary,
//! and any gap left in front of or behind it is either empty or large enough
//! to hold a pad file header, so the directory stays walkable.

use tracing::debug;

use crate::error::{FmmtError, Result};
use crate::format::constants::*;
use crate::format::file::seal_file;
use crate::format::{FfsFileHeader, align_up, guid_from_bytes};
use crate::parser::directory::{self, Directory, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// A live pad file.
    Pad,
    /// Trailing erased space.
    Free,
}

/// Span of a volume that can receive a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
    pub kind: RegionKind,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Where a file lands inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fit {
    pub region: Region,
    /// Start of the file record.
    pub start: usize,
    /// Size of the trailing pad to synthesize (0 for none).
    pub tail_pad: usize,
}

impl Fit {
    /// Size of the alignment pad in front of the file (0 for none).
    pub fn lead_pad(&self) -> usize {
        self.start - self.region.offset
    }
}

/// Smallest 8-aligned start at or after `min_start` whose content (the first
/// byte after a `header_len` header) is `alignment`-aligned, leaving either no
/// gap or one that fits a pad file.
///
/// The alignment applies to the content, not to the header: an aligned
/// record starts `header_len` bytes before the boundary, so for 16-byte or
/// coarser alignment the record offset itself is not a multiple of it.
pub fn aligned_start(min_start: usize, header_len: usize, alignment: usize) -> usize {
    let align = alignment.max(FFS_FILE_ALIGNMENT);
    let first_from = |from: usize| align_up(from + header_len, align) - header_len;
    let start = first_from(min_start);
    if start == min_start || start - min_start >= FFS_FILE_HEADER_SIZE {
        start
    } else {
        first_from(min_start + FFS_FILE_HEADER_SIZE)
    }
}

/// Try to place a `file_len` byte file in `region`.
pub fn fit_in(region: &Region, file_len: usize, header_len: usize, alignment: usize) -> Option<Fit> {
    let start = aligned_start(region.offset, header_len, alignment);
    let end = start + file_len;
    if end > region.end() {
        return None;
    }
    let tail_pad = match region.kind {
        // Leftover erased space just stays free.
        RegionKind::Free => 0,
        RegionKind::Pad => {
            let rest = region.end().saturating_sub(align_up(end, FFS_FILE_ALIGNMENT));
            if region.end() - end < FFS_FILE_ALIGNMENT {
                0
            } else if rest >= FFS_FILE_HEADER_SIZE {
                rest
            } else {
                return None;
            }
        }
    };
    Some(Fit {
        region: *region,
        start,
        tail_pad,
    })
}

/// Region a pad record spans, up to where the next record may start.
pub fn pad_region(record: &Record, dir: &Directory) -> Region {
    Region {
        offset: record.offset,
        len: record.aligned_end().min(dir.end) - record.offset,
        kind: RegionKind::Pad,
    }
}

/// Live pads in directory order, then the trailing free space.
pub fn regions(dir: &Directory) -> Vec<Region> {
    let mut out: Vec<Region> = dir
        .records
        .iter()
        .filter(|r| r.is_live_pad())
        .map(|r| pad_region(r, dir))
        .collect();
    if dir.end - dir.free_offset >= FFS_FILE_HEADER_SIZE {
        out.push(Region {
            offset: dir.free_offset,
            len: dir.end - dir.free_offset,
            kind: RegionKind::Free,
        });
    }
    out
}

/// First pad or free region able to hold the file, with its placement.
pub fn find_free_or_pad_region(
    data: &[u8],
    file_len: usize,
    header_len: usize,
    alignment: usize,
) -> Result<Option<Fit>> {
    let dir = directory::walk(data)?;
    Ok(regions(&dir)
        .iter()
        .find_map(|region| fit_in(region, file_len, header_len, alignment)))
}

/// Bytes of trailing free space.
pub fn free_space(data: &[u8]) -> Result<usize> {
    let dir = directory::walk(data)?;
    Ok(dir.end - dir.free_offset)
}

/// Turn `region` into pad files spanning all of it. One pad is written
/// when possible, with the extended header only when the size needs it and
/// the volume allows large files; otherwise compact pads are chained.
pub fn synthesize_pad(region: &mut [u8], erase_polarity: bool, large_files: bool) -> Result<()> {
    let size = region.len();
    if size < FFS_FILE_HEADER_SIZE {
        return Err(FmmtError::aborted(format!(
            "0x{:X} bytes cannot hold a pad file",
            size
        )));
    }
    if size > MAX_FFS_SIZE && !large_files {
        let (head, tail) = region.split_at_mut(compact_pad_piece(size));
        write_pad(head, erase_polarity)?;
        return synthesize_pad(tail, erase_polarity, false);
    }
    write_pad(region, erase_polarity)
}

/// Size of the leading piece when a span is too large for one compact pad.
/// Pieces are 8-byte sized and never leave a remainder below a header.
fn compact_pad_piece(size: usize) -> usize {
    let piece = MAX_FFS_SIZE & !(FFS_FILE_ALIGNMENT - 1);
    if size - piece < FFS_FILE_HEADER_SIZE {
        piece - 4 * FFS_FILE_ALIGNMENT
    } else {
        piece
    }
}

fn write_pad(region: &mut [u8], erase_polarity: bool) -> Result<()> {
    let size = region.len();
    let erase = if erase_polarity { 0xFF } else { 0x00 };
    let (attributes, header_len) = if size > MAX_FFS_SIZE {
        (attributes::LARGE_FILE, FFS_FILE_HEADER2_SIZE)
    } else {
        (0, FFS_FILE_HEADER_SIZE)
    };
    // Pad names are left erased.
    let header = FfsFileHeader::new(
        guid_from_bytes(&[erase; 16]),
        file_type::FFS_PAD,
        attributes,
        size - header_len,
    );
    region.fill(erase);
    region[..header_len].copy_from_slice(&header.to_bytes());
    seal_file(region, erase_polarity)?;
    Ok(())
}

/// Extend the pad at `offset` over an immediately following pad. Returns
/// whether a merge happened.
pub fn merge_adjacent_pad(data: &mut [u8], offset: usize) -> Result<bool> {
    let dir = directory::walk(data)?;
    let pad = dir
        .record_at(offset)
        .filter(|r| r.is_live_pad())
        .ok_or_else(|| FmmtError::not_found(format!("no pad file at 0x{:X}", offset)))?;
    let next = match dir.next_after(pad) {
        Some(next) if next.is_live_pad() => next,
        _ => return Ok(false),
    };
    let end = next.end();
    debug!(
        offset = %format!("0x{:X}", offset),
        absorbed = %format!("0x{:X}", next.offset),
        "Merging adjacent pad files"
    );
    synthesize_pad(&mut data[offset..end], dir.erase_polarity(), dir.header.supports_large_files())?;
    Ok(true)
}
