//! Packaging capability: turns manifests into section, file and volume bytes.
//!
//! The rebuilder only talks to the [`Packager`] trait. [`NativePackager`]
//! lays everything out in process; [`ToolPackager`] drives the EDK II style
//! generation tools through a [`ToolRunner`](crate::tools::ToolRunner).

pub mod native;
pub mod tool;

pub use native::NativePackager;
pub use tool::ToolPackager;

use uuid::Uuid;

use crate::error::Result;
use crate::format::constants::SECTION_ALIGNMENT;
use crate::format::volume::content_offset;
use crate::format::FvHeader;
use crate::model::Volume;
use crate::tools::Scratch;

/// Section to wrap around a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionKind {
    /// Payload is a complete volume.
    FirmwareVolume,
    /// Payload is the uncompressed section stream; the packager compresses it.
    Compression { compression_type: u8 },
    /// Payload is already encoded; `extra_header` goes between the GUID
    /// header and the data.
    GuidDefined {
        guid: Uuid,
        attributes: u16,
        extra_header: Vec<u8>,
    },
    /// Plain leaf section of the given type.
    Leaf(u8),
}

/// Manifest for one firmware file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub name: Uuid,
    pub file_type: u8,
    /// Header attributes to keep; `LARGE_FILE` forces the large encoding.
    pub attributes: u8,
    pub erase_polarity: bool,
}

/// Manifest for one firmware volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    /// Header bytes up to the first file record (block map and extended
    /// header included), reused as is.
    pub header: Vec<u8>,
    /// The volume never shrinks below this.
    pub min_length: usize,
    pub block_size: usize,
    pub erase_polarity: bool,
    pub fv_name: Option<Uuid>,
    pub base_address: Option<u64>,
}

impl VolumeRequest {
    /// Manifest that regenerates `volume` with its current header.
    pub fn from_volume(volume: &Volume) -> Result<Self> {
        let header = FvHeader::from_bytes(&volume.data)?;
        let start = content_offset(&header, &volume.data)?;
        Ok(Self {
            header: volume.data[..start].to_vec(),
            min_length: header.fv_length as usize,
            block_size: header.block_size() as usize,
            erase_polarity: header.erase_polarity(),
            fv_name: volume.fv_name,
            base_address: None,
        })
    }
}

pub trait Packager {
    /// Wrap `payload` in one section.
    fn section(&self, kind: &SectionKind, payload: &[u8], scratch: &Scratch) -> Result<Vec<u8>>;

    /// Build a sealed firmware file around a section stream (or raw content
    /// for files without sections).
    fn file(&self, request: &FileRequest, content: &[u8], scratch: &Scratch) -> Result<Vec<u8>>;

    /// Lay out complete files, in order, into a volume.
    fn volume(&self, request: &VolumeRequest, files: &[Vec<u8>], scratch: &Scratch) -> Result<Vec<u8>>;
}

/// Concatenate sections, zero-padding each start to the section alignment.
pub fn join_sections<S: AsRef<[u8]>>(sections: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for section in sections {
        while out.len() % SECTION_ALIGNMENT != 0 {
            out.push(0);
        }
        out.extend_from_slice(section.as_ref());
    }
    out
}
