//! In-process packager producing the same layout the generation tools use.

use tracing::debug;

use super::{FileRequest, Packager, SectionKind, VolumeRequest};
use crate::codec::Decompressor;
use crate::error::{FmmtError, Result};
use crate::format::constants::*;
use crate::format::file::seal_file;
use crate::format::section::{build_compression_section, build_guided_section, build_section};
use crate::format::volume::patch_length;
use crate::format::{FfsFileHeader, FvHeader, align_up};
use crate::space::{aligned_start, synthesize_pad};
use crate::tools::Scratch;

pub struct NativePackager {
    decompressor: Decompressor,
}

impl NativePackager {
    pub fn new(decompressor: Decompressor) -> Self {
        Self { decompressor }
    }
}

impl Packager for NativePackager {
    fn section(&self, kind: &SectionKind, payload: &[u8], scratch: &Scratch) -> Result<Vec<u8>> {
        Ok(match kind {
            SectionKind::FirmwareVolume => build_section(section_type::FIRMWARE_VOLUME_IMAGE, payload),
            SectionKind::Compression { compression_type } => {
                let data = self.decompressor.compress(*compression_type, payload, scratch)?;
                build_compression_section(*compression_type, payload.len(), &data)
            }
            SectionKind::GuidDefined {
                guid,
                attributes,
                extra_header,
            } => build_guided_section(*guid, *attributes, extra_header, payload),
            SectionKind::Leaf(kind) => build_section(*kind, payload),
        })
    }

    fn file(&self, request: &FileRequest, content: &[u8], _scratch: &Scratch) -> Result<Vec<u8>> {
        let header = FfsFileHeader::new(request.name, request.file_type, request.attributes, content.len());
        let mut file = header.to_bytes();
        file.extend_from_slice(content);
        seal_file(&mut file, request.erase_polarity)?;
        Ok(file)
    }

    fn volume(&self, request: &VolumeRequest, files: &[Vec<u8>], _scratch: &Scratch) -> Result<Vec<u8>> {
        layout_volume(request, files)
    }
}

fn round_to_block(value: usize, block_size: usize) -> usize {
    value.div_ceil(block_size) * block_size
}

/// Place files back to back on 8-byte boundaries after the header, inserting
/// pad files where content alignment demands a gap. A trailing volume top
/// file is moved to the very end of the volume.
pub fn layout_volume(request: &VolumeRequest, files: &[Vec<u8>]) -> Result<Vec<u8>> {
    let polarity = request.erase_polarity;
    let erase = if polarity { 0xFF } else { 0x00 };
    if request.block_size == 0 {
        return Err(FmmtError::aborted("volume has a zero block size"));
    }
    let large_files = FvHeader::from_bytes(&request.header)?.supports_large_files();

    let mut headers = files
        .iter()
        .map(|f| FfsFileHeader::from_bytes(f))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut body: Vec<&Vec<u8>> = files.iter().collect();
    let top = match headers.last() {
        Some(h) if h.name == guid::VOLUME_TOP_FILE => {
            headers.pop();
            body.pop()
        }
        _ => None,
    };
    if top.is_some() {
        // Filler in front of the top file is regenerated below.
        while headers.last().is_some_and(|h| h.is_pad()) {
            headers.pop();
            body.pop();
        }
    }

    let mut out = request.header.clone();
    for (file, header) in body.iter().zip(&headers) {
        let cursor = align_up(out.len(), FFS_FILE_ALIGNMENT);
        out.resize(cursor, erase);
        let start = aligned_start(cursor, header.header_len(), header.alignment());
        if start > cursor {
            debug!(
                file = %header.name,
                gap = start - cursor,
                "Inserting alignment pad"
            );
            let mut pad = vec![erase; start - cursor];
            synthesize_pad(&mut pad, polarity, large_files)?;
            out.extend_from_slice(&pad);
        }
        out.extend_from_slice(file);
    }
    let cursor = align_up(out.len(), FFS_FILE_ALIGNMENT);

    let top_len = top.map(|t| t.len()).unwrap_or(0);
    let mut length = request
        .min_length
        .max(round_to_block(cursor + top_len, request.block_size));
    out.try_reserve_exact(length.saturating_sub(out.len()))
        .map_err(|e| FmmtError::OutOfResources(format!("volume of 0x{:X} bytes: {}", length, e)))?;

    match top {
        Some(top) => {
            let gap = loop {
                let gap = length - top_len - cursor;
                if gap == 0 || gap >= FFS_FILE_HEADER_SIZE {
                    break gap;
                }
                length += request.block_size;
            };
            if (length - top_len) % FFS_FILE_ALIGNMENT != 0 {
                return Err(FmmtError::aborted(format!(
                    "volume top file of 0x{:X} bytes cannot end on the volume boundary",
                    top_len
                )));
            }
            out.resize(cursor, erase);
            if gap > 0 {
                let mut pad = vec![erase; gap];
                synthesize_pad(&mut pad, polarity, large_files)?;
                out.extend_from_slice(&pad);
            }
            out.extend_from_slice(top);
        }
        None => out.resize(length, erase),
    }

    let declared = FvHeader::from_bytes(&out)?.fv_length as usize;
    if declared != length {
        debug!(from = declared, to = length, "Resizing volume");
        patch_length(&mut out, length as u64)?;
    }
    Ok(out)
}
