//! File directory walk over a single volume's bytes.

use tracing::warn;

use crate::error::{FmmtError, Result};
use crate::format::constants::{FFS_FILE_ALIGNMENT, FFS_FILE_HEADER_SIZE};
use crate::format::volume::content_offset;
use crate::format::{FfsFileHeader, FvHeader, RecordState, align_up};

/// One file record, whatever its state.
#[derive(Debug, Clone)]
pub struct Record {
    pub offset: usize,
    pub header: FfsFileHeader,
    pub state: RecordState,
}

impl Record {
    pub fn end(&self) -> usize {
        self.offset + self.header.size
    }

    /// Offset where the next record may start.
    pub fn aligned_end(&self) -> usize {
        align_up(self.end(), FFS_FILE_ALIGNMENT)
    }

    pub fn is_live_pad(&self) -> bool {
        self.state.is_live() && self.header.is_pad()
    }
}

#[derive(Debug, Clone)]
pub struct Directory {
    pub header: FvHeader,
    pub content_start: usize,
    /// Start of the trailing free space; equals `end` when the volume is full.
    pub free_offset: usize,
    /// Usable end of the volume. Stops short of any data found past the
    /// start of free space.
    pub end: usize,
    /// First non-erased byte behind the start of free space.
    pub trailing_data: Option<usize>,
    pub records: Vec<Record>,
}

impl Directory {
    pub fn erase_polarity(&self) -> bool {
        self.header.erase_polarity()
    }

    pub fn live(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| r.state.is_live())
    }

    pub fn record_at(&self, offset: usize) -> Option<&Record> {
        self.records.iter().find(|r| r.offset == offset)
    }

    /// Record starting exactly where `record` ends (after alignment).
    pub fn next_after(&self, record: &Record) -> Option<&Record> {
        self.record_at(record.aligned_end())
    }
}

/// Walk every record of a volume. Free space ends the walk.
pub fn walk(data: &[u8]) -> Result<Directory> {
    let header = FvHeader::from_bytes(data)?;
    let content_start = content_offset(&header, data)?;
    let end = data.len().min(header.fv_length as usize);
    let erase = header.erase_byte();
    let polarity = header.erase_polarity();

    let mut records = Vec::new();
    let mut offset = content_start;
    let mut trailing_data = None;
    while offset + FFS_FILE_HEADER_SIZE <= end {
        if data[offset..offset + FFS_FILE_HEADER_SIZE].iter().all(|&b| b == erase) {
            trailing_data = data[offset..end].iter().position(|&b| b != erase).map(|p| offset + p);
            if let Some(at) = trailing_data {
                warn!(
                    free = %format!("0x{:X}", offset),
                    data = %format!("0x{:X}", at),
                    "Data found after the start of free space; free space ends before it"
                );
            }
            break;
        }
        let file_header = FfsFileHeader::from_bytes(&data[offset..end]).map_err(|e| {
            FmmtError::aborted(format!("bad file header at 0x{:X}: {}", offset, e))
        })?;
        if offset + file_header.size > end {
            return Err(FmmtError::aborted(format!(
                "file {} at 0x{:X} overruns the volume",
                file_header.name, offset
            )));
        }
        let state = file_header.record_state(polarity);
        let record = Record {
            offset,
            header: file_header,
            state,
        };
        offset = record.aligned_end();
        records.push(record);
    }

    let free_offset = offset.min(end);
    let end = match trailing_data {
        Some(at) => (at & !(FFS_FILE_ALIGNMENT - 1)).max(free_offset),
        None => end,
    };
    Ok(Directory {
        header,
        content_start,
        free_offset,
        end,
        trailing_data,
        records,
    })
}
