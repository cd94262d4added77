//! In-memory model of a device image: volumes, the file attribute table and
//! the encapsulation tree that ties them together.
//!
//! Volumes and files live in append-only arenas. A deleted entry keeps its
//! index and only changes state, so ids handed out earlier in a batch stay
//! valid for the rest of it.

use std::path::PathBuf;

use uuid::Uuid;

use crate::encap::{EncapsulationTree, NodeId};
use crate::error::{FmmtError, Result};
use crate::format::FfsFileHeader;
use crate::format::FvHeader;
use crate::format::volume::content_offset;
use crate::state::{FileState, Transition};

pub type VolumeId = usize;
pub type FileId = usize;

/// One firmware volume, top level or nested inside a file.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: VolumeId,
    /// Sequential display name (`FV0`, `FV1`, ...), assigned depth first.
    pub name: String,
    /// Offset in the device image for top-level volumes, 0 for nested ones.
    pub offset: usize,
    /// Bytes the volume may occupy where it is spliced back.
    pub slot: usize,
    pub header: FvHeader,
    /// Name from the extended header, if any.
    pub fv_name: Option<Uuid>,
    /// Display name of the file this volume is nested in.
    pub display_name: Option<String>,
    pub level: usize,
    pub parent_file: Option<FileId>,
    /// Live files in directory order.
    pub files: Vec<FileId>,
    pub node: NodeId,
    pub data: Vec<u8>,
    pub deleted: bool,
}

impl Volume {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_child(&self) -> bool {
        self.parent_file.is_some()
    }

    pub fn erase_polarity(&self) -> bool {
        self.header.erase_polarity()
    }

    pub fn erase_byte(&self) -> u8 {
        self.header.erase_byte()
    }

    /// Offset of the first file record.
    pub fn content_offset(&self) -> Result<usize> {
        Ok(content_offset(&self.header, &self.data)?)
    }
}

/// Captured dependency expression section, reinjected verbatim on rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Depex {
    pub section_type: u8,
    pub section: Vec<u8>,
}

/// One firmware file discovered while parsing a volume.
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub id: FileId,
    pub volume: VolumeId,
    /// File whose nested volume contains this file.
    pub parent: Option<FileId>,
    pub name: Uuid,
    pub file_type: u8,
    /// Offset within the owning volume.
    pub offset: usize,
    pub size: usize,
    pub header: FfsFileHeader,
    /// Raw header bytes as found on disk.
    pub raw_header: Vec<u8>,
    pub ui_name: Option<String>,
    pub depex: Option<Depex>,
    /// Extracted leaf content on the host filesystem.
    pub leaf_path: Option<PathBuf>,
    pub child_volumes: Vec<VolumeId>,
    pub node: NodeId,
    pub state: FileState,
    /// Set while a rebuild pass has already emitted this file.
    pub handled: bool,
}

impl FileAttributes {
    /// Display name when present, GUID otherwise.
    pub fn label(&self) -> String {
        self.ui_name.clone().unwrap_or_else(|| self.name.to_string())
    }

    pub fn is_pad(&self) -> bool {
        self.header.is_pad()
    }

    pub fn has_child_volumes(&self) -> bool {
        !self.child_volumes.is_empty()
    }

    pub(crate) fn transition(&mut self, transition: Transition) -> Result<()> {
        self.state = self.state.apply(transition)?;
        Ok(())
    }
}

/// One row of the flattened level view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatEntry {
    pub file: FileId,
    /// Encapsulation depth of the file node.
    pub level: usize,
    /// Nesting level of the enclosing volume.
    pub fv_level: usize,
    pub is_fv_start: bool,
    pub is_fv_end: bool,
}

/// A parsed device image.
#[derive(Debug, Clone, Default)]
pub struct DeviceImage {
    pub data: Vec<u8>,
    pub volumes: Vec<Volume>,
    pub files: Vec<FileAttributes>,
    pub tree: EncapsulationTree,
    /// Top-level volumes in offset order.
    pub roots: Vec<VolumeId>,
}

impl DeviceImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn volume(&self, id: VolumeId) -> &Volume {
        &self.volumes[id]
    }

    pub fn file(&self, id: FileId) -> &FileAttributes {
        &self.files[id]
    }

    /// Live files of a volume in directory order.
    pub fn live_files(&self, volume: VolumeId) -> impl Iterator<Item = &FileAttributes> {
        self.volumes[volume]
            .files
            .iter()
            .map(|&id| &self.files[id])
            .filter(|f| f.state.is_live())
    }

    /// Current on-disk bytes of a file.
    pub fn file_bytes(&self, id: FileId) -> &[u8] {
        let file = &self.files[id];
        &self.volumes[file.volume].data[file.offset..file.offset + file.size]
    }

    /// Resolve `FV3`, `fv3` or `3` to a volume.
    pub fn find_volume(&self, key: &str) -> Result<VolumeId> {
        let trimmed = key.trim();
        let digits = trimmed
            .strip_prefix("FV")
            .or_else(|| trimmed.strip_prefix("fv"))
            .unwrap_or(trimmed);
        let id: usize = digits
            .parse()
            .map_err(|_| FmmtError::InvalidParameter(format!("bad volume id '{}'", key)))?;
        match self.volumes.get(id) {
            Some(v) if !v.deleted => Ok(id),
            _ => Err(FmmtError::not_found(format!("volume {} not found", key))),
        }
    }

    /// Find a live file in `volume` by display name or GUID string.
    pub fn find_file(&self, volume: VolumeId, key: &str) -> Result<FileId> {
        let guid = Uuid::parse_str(key).ok();
        self.live_files(volume)
            .find(|f| f.ui_name.as_deref() == Some(key) || Some(f.name) == guid)
            .map(|f| f.id)
            .ok_or_else(|| {
                FmmtError::not_found(format!(
                    "file '{}' not found in {}",
                    key, self.volumes[volume].name
                ))
            })
    }

    /// Volume ids from `volume` up to its top-level ancestor.
    pub fn volume_chain(&self, volume: VolumeId) -> Vec<VolumeId> {
        let mut chain = vec![volume];
        let mut current = volume;
        while let Some(file) = self.volumes[current].parent_file {
            current = self.files[file].volume;
            chain.push(current);
        }
        chain
    }

    /// Logically delete everything nested below `file`. Indices are kept.
    pub fn remove_descendants(&mut self, file: FileId) -> Result<()> {
        let children = self.files[file].child_volumes.clone();
        for volume in children {
            self.volumes[volume].deleted = true;
            let files = std::mem::take(&mut self.volumes[volume].files);
            for id in files {
                self.remove_descendants(id)?;
                if !self.files[id].state.is_terminal() {
                    self.files[id].transition(Transition::Remove)?;
                }
            }
        }
        Ok(())
    }

    /// Derived flattened view: every live file in depth-first order with its
    /// level and the start/end markers of each nested volume's run.
    pub fn flattened(&self) -> Vec<FlatEntry> {
        let mut out = Vec::new();
        for &root in &self.roots {
            if !self.volumes[root].deleted {
                self.flatten_volume(root, &mut out);
            }
        }
        out
    }

    fn flatten_volume(&self, volume: VolumeId, out: &mut Vec<FlatEntry>) {
        let fv_level = self.volumes[volume].level;
        for file in self.live_files(volume) {
            out.push(FlatEntry {
                file: file.id,
                level: self.tree.node(file.node).depth,
                fv_level,
                is_fv_start: false,
                is_fv_end: false,
            });
            for &child in &file.child_volumes {
                if self.volumes[child].deleted {
                    continue;
                }
                let first = out.len();
                self.flatten_volume(child, out);
                if out.len() > first {
                    out[first].is_fv_start = true;
                    let last = out.len() - 1;
                    out[last].is_fv_end = true;
                }
            }
        }
    }
}
