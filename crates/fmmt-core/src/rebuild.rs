//! Bottom-up re-encapsulation and splicing into the device image.
//!
//! A file is regenerated from its node's section stream: verbatim sections are
//! copied, captured display names and dependency expressions are reinjected,
//! and encapsulating sections are rebuilt from their own streams, innermost
//! first. Volumes are laid out again by the packager.

use tracing::{debug, info};

use crate::codec::CodecKind;
use crate::encap::{NodeId, NodeKind, SectionSlot};
use crate::error::{FmmtError, Result};
use crate::format::constants::{attributes, guided, section_type};
use crate::format::encode_ucs2;
use crate::model::{DeviceImage, FileId, VolumeId};
use crate::packager::{FileRequest, Packager, SectionKind, VolumeRequest, join_sections};
use crate::parser::ContainerParser;
use crate::parser::directory;

pub struct Rebuilder<'a, 'p> {
    parser: &'a ContainerParser<'p>,
    packager: &'a dyn Packager,
    large_file_threshold: usize,
}

impl<'a, 'p> Rebuilder<'a, 'p> {
    pub fn new(parser: &'a ContainerParser<'p>, packager: &'a dyn Packager, large_file_threshold: usize) -> Self {
        Self {
            parser,
            packager,
            large_file_threshold,
        }
    }

    /// Section stream of an encapsulation node.
    fn stream(&self, image: &DeviceImage, file: FileId, node: NodeId) -> Result<Vec<u8>> {
        let attrs = &image.files[file];
        let mut sections = Vec::new();
        for slot in &image.tree.node(node).sections {
            let bytes = match slot {
                SectionSlot::Raw(raw) => raw.clone(),
                SectionSlot::UserInterface => {
                    let name = attrs.ui_name.as_deref().unwrap_or_default();
                    self.packager.section(
                        &SectionKind::Leaf(section_type::USER_INTERFACE),
                        &encode_ucs2(name),
                        self.parser.scratch(),
                    )?
                }
                SectionSlot::Depex => attrs
                    .depex
                    .as_ref()
                    .map(|d| d.section.clone())
                    .ok_or_else(|| FmmtError::aborted(format!("file {} lost its dependency expression", attrs.name)))?,
                SectionSlot::Node(child) => self.section_bytes(image, file, *child)?,
            };
            sections.push(bytes);
        }
        Ok(join_sections(&sections))
    }

    fn section_bytes(&self, image: &DeviceImage, file: FileId, node: NodeId) -> Result<Vec<u8>> {
        let scratch = self.parser.scratch();
        match &image.tree.node(node).kind {
            NodeKind::NestedVolumeSection { .. } => {
                let volume = image
                    .tree
                    .node(node)
                    .children
                    .iter()
                    .find_map(|&c| match image.tree.node(c).kind {
                        NodeKind::Volume { volume } => Some(volume),
                        _ => None,
                    })
                    .ok_or_else(|| FmmtError::aborted("volume section without a volume"))?;
                self.packager
                    .section(&SectionKind::FirmwareVolume, &image.volumes[volume].data, scratch)
            }
            NodeKind::CompressedSection { compression_type, .. } => {
                let stream = self.stream(image, file, node)?;
                self.packager.section(
                    &SectionKind::Compression {
                        compression_type: *compression_type,
                    },
                    &stream,
                    scratch,
                )
            }
            NodeKind::VendorEncodedSection {
                guid,
                attributes,
                extra_header,
                ..
            } => {
                let stream = self.stream(image, file, node)?;
                let codecs = self.parser.codecs();
                let required = attributes & guided::PROCESSING_REQUIRED != 0;
                let (extra_header, data) = match codecs.lookup(guid) {
                    Some(entry) if required || entry.kind == CodecKind::Crc32 => {
                        codecs.encode(entry, extra_header, &stream, scratch)?
                    }
                    _ => (extra_header.clone(), stream),
                };
                self.packager.section(
                    &SectionKind::GuidDefined {
                        guid: *guid,
                        attributes: *attributes,
                        extra_header,
                    },
                    &data,
                    scratch,
                )
            }
            other => Err(FmmtError::aborted(format!(
                "node {} ({:?}) is not a section",
                node, other
            ))),
        }
    }

    /// Regenerate one file from its encapsulation node.
    pub fn regenerate_file(&self, image: &DeviceImage, file: FileId) -> Result<Vec<u8>> {
        let attrs = &image.files[file];
        let content = self.stream(image, file, attrs.node)?;
        let mut file_attributes = attrs.header.attributes;
        let oversized = attrs
            .child_volumes
            .iter()
            .any(|&v| !image.volumes[v].deleted && image.volumes[v].len() > self.large_file_threshold);
        if oversized {
            debug!(file = %attrs.label(), "Nested volume over threshold; using large file header");
            file_attributes |= attributes::LARGE_FILE;
        }
        let request = FileRequest {
            name: attrs.name,
            file_type: attrs.file_type,
            attributes: file_attributes,
            erase_polarity: image.volumes[attrs.volume].erase_polarity(),
        };
        self.packager.file(&request, &content, self.parser.scratch())
    }

    /// Lay out a volume again. Files not yet handled in this pass are
    /// regenerated from their nodes; handled ones are copied as they are.
    pub fn regenerate_volume(&self, image: &mut DeviceImage, volume: VolumeId) -> Result<Vec<u8>> {
        if let Some(at) = directory::walk(&image.volumes[volume].data)?.trailing_data {
            return Err(FmmtError::aborted(format!(
                "{} holds data at 0x{:X} behind its free space that a new layout would drop",
                image.volumes[volume].name, at
            )));
        }
        let ids: Vec<FileId> = image.live_files(volume).map(|f| f.id).collect();
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            let bytes = if image.files[id].handled {
                image.file_bytes(id).to_vec()
            } else {
                self.regenerate_file(image, id)?
            };
            image.files[id].handled = true;
            files.push(bytes);
        }
        let request = VolumeRequest::from_volume(&image.volumes[volume])?;
        self.packager.volume(&request, &files, self.parser.scratch())
    }

    fn store(&self, image: &mut DeviceImage, volume: VolumeId, data: Vec<u8>) -> Result<()> {
        info!(
            volume = %image.volumes[volume].name,
            size = %format!("0x{:X}", data.len()),
            "Volume rebuilt"
        );
        image.volumes[volume].data = data;
        self.parser.refresh_volume(image, volume)
    }

    fn set_handled(image: &mut DeviceImage, volume: VolumeId, handled: bool) {
        for id in image.volumes[volume].files.clone() {
            image.files[id].handled = handled;
        }
    }

    /// Regenerate `volume` and everything nested in it, innermost first.
    /// Returns the new volume bytes, which are also stored in the model.
    pub fn rebuild(&self, image: &mut DeviceImage, volume: VolumeId) -> Result<Vec<u8>> {
        let order = image.tree.volumes_bottom_up(image.volumes[volume].node);
        for &v in &order {
            Self::set_handled(image, v, false);
        }
        for v in order {
            if image.volumes[v].deleted {
                continue;
            }
            let data = self.regenerate_volume(image, v)?;
            self.store(image, v, data)?;
        }
        Ok(image.volumes[volume].data.clone())
    }

    /// Carry a change to `volume`'s bytes up through every enclosing file and
    /// volume, then splice the top-level volume into the image.
    pub fn propagate(&self, image: &mut DeviceImage, volume: VolumeId) -> Result<()> {
        let mut current = volume;
        while let Some(parent_file) = image.volumes[current].parent_file {
            let parent = image.files[parent_file].volume;
            // Only the file holding the changed volume is regenerated.
            Self::set_handled(image, parent, true);
            image.files[parent_file].handled = false;
            let data = self.regenerate_volume(image, parent)?;
            self.store(image, parent, data)?;
            current = parent;
        }
        self.splice(image, current)
    }

    /// Write a top-level volume back at its offset. Fails when it outgrew its
    /// slot; a smaller volume leaves the rest of the slot erased.
    pub fn splice(&self, image: &mut DeviceImage, volume: VolumeId) -> Result<()> {
        let v = &image.volumes[volume];
        if v.is_child() {
            return Err(FmmtError::InvalidParameter(format!(
                "{} is nested and cannot be spliced into the image",
                v.name
            )));
        }
        if v.data.len() > v.slot {
            return Err(FmmtError::aborted(format!(
                "rebuilt {} is 0x{:X} bytes but only 0x{:X} are available",
                v.name,
                v.data.len(),
                v.slot
            )));
        }
        let (offset, slot, erase) = (v.offset, v.slot, v.erase_byte());
        let len = v.data.len();
        image.data[offset..offset + len].copy_from_slice(&image.volumes[volume].data);
        image.data[offset + len..offset + slot].fill(erase);
        debug!(volume = volume, offset = %format!("0x{:X}", offset), "Spliced volume");
        Ok(())
    }
}
