//! Recursive container parser.
//!
//! Walks each volume's file directory and each file's section stream,
//! descending into nested volumes, compressed sections and vendor-encoded
//! sections. Produces the file attribute table and the encapsulation tree the
//! rebuilder later replays.

pub mod directory;

use tracing::{debug, warn};

use crate::codec::{CodecKind, CodecRegistry, Decompressor};
use crate::encap::{NodeId, NodeKind, SectionSlot};
use crate::error::{FmmtError, Result};
use crate::format::constants::*;
use crate::format::file::{verify_data_checksum, verify_header_checksum};
use crate::format::volume::verify_header_checksum as verify_volume_checksum;
use crate::format::{
    CompressionHeader, FfsFileHeader, FvExtHeader, FvHeader, GuidDefinedHeader, SectionHeader, align_up,
    decode_ucs2, encode_ucs2,
};
use crate::model::{Depex, DeviceImage, FileAttributes, FileId, Volume, VolumeId};
use crate::scanner::scan_volumes;
use crate::state::{FileState, Transition};
use crate::tools::Scratch;

/// Whether files of this type carry a section stream. Raw and pad files, and
/// the OEM/debug ranges, hold opaque content.
pub fn has_sections(kind: u8) -> bool {
    matches!(kind, file_type::FREEFORM..=file_type::MM_CORE_STANDALONE)
}

fn is_leaf_section(kind: u8) -> bool {
    matches!(
        kind,
        section_type::PE32
            | section_type::PIC
            | section_type::TE
            | section_type::COMPATIBILITY16
            | section_type::FREEFORM_SUBTYPE_GUID
            | section_type::RAW
    )
}

fn is_depex_section(kind: u8) -> bool {
    matches!(
        kind,
        section_type::DXE_DEPEX | section_type::PEI_DEPEX | section_type::MM_DEPEX
    )
}

pub struct ContainerParser<'a> {
    codecs: &'a CodecRegistry,
    decompressor: &'a Decompressor,
    scratch: &'a Scratch,
    view_only: bool,
}

impl<'a> ContainerParser<'a> {
    pub fn new(codecs: &'a CodecRegistry, decompressor: &'a Decompressor, scratch: &'a Scratch) -> Self {
        Self {
            codecs,
            decompressor,
            scratch,
            view_only: false,
        }
    }

    /// Skip leaf extraction.
    pub fn view_only(mut self, view_only: bool) -> Self {
        self.view_only = view_only;
        self
    }

    pub fn codecs(&self) -> &'a CodecRegistry {
        self.codecs
    }

    pub fn scratch(&self) -> &'a Scratch {
        self.scratch
    }

    /// Scan a device image and parse every volume found in it.
    pub fn parse_image(&self, data: Vec<u8>) -> Result<DeviceImage> {
        let locations = scan_volumes(&data)?;
        let mut image = DeviceImage::new(data);
        for location in locations {
            let bytes = image.data[location.offset..location.offset + location.length].to_vec();
            let id = self.parse_volume(&mut image, bytes, None, location.offset)?;
            image.roots.push(id);
        }
        Ok(image)
    }

    /// Parse one volume. `parent` is the containing file and the section node
    /// the volume hangs off when it is nested.
    pub fn parse_volume(
        &self,
        image: &mut DeviceImage,
        data: Vec<u8>,
        parent: Option<(FileId, NodeId)>,
        offset: usize,
    ) -> Result<VolumeId> {
        let header = FvHeader::from_bytes(&data)?;
        if !verify_volume_checksum(&data, header.header_length as usize) {
            return Err(FmmtError::aborted(format!(
                "volume header checksum mismatch at 0x{:X}",
                offset
            )));
        }
        let fv_name = match header.ext_header_offset as usize {
            0 => None,
            ext => data
                .get(ext..)
                .and_then(|raw| FvExtHeader::from_bytes(raw).ok())
                .map(|e| e.fv_name),
        };

        let id = image.volumes.len();
        let (level, parent_file, parent_node) = match parent {
            Some((file, node)) => (image.volumes[image.files[file].volume].level + 1, Some(file), Some(node)),
            None => (0, None, None),
        };
        let node = image.tree.add(NodeKind::Volume { volume: id }, parent_node);
        debug!(
            volume = id,
            offset = %format!("0x{:X}", offset),
            size = %format!("0x{:X}", data.len()),
            level = level,
            "Parsing volume"
        );
        image.volumes.push(Volume {
            id,
            name: format!("FV{}", id),
            offset,
            slot: data.len(),
            header,
            fv_name,
            display_name: None,
            level,
            parent_file,
            files: Vec::new(),
            node,
            data,
            deleted: false,
        });
        if let Some(file) = parent_file {
            image.files[file].child_volumes.push(id);
        }

        let dir = directory::walk(&image.volumes[id].data)?;
        for record in dir.live() {
            let bytes = image.volumes[id].data[record.offset..record.end()].to_vec();
            let file = self.parse_file(image, id, record.offset, &bytes)?;
            image.volumes[id].files.push(file);
        }
        Ok(id)
    }

    /// Parse one file record and everything nested in it.
    pub fn parse_file(&self, image: &mut DeviceImage, volume: VolumeId, offset: usize, bytes: &[u8]) -> Result<FileId> {
        let header = FfsFileHeader::from_bytes(bytes)?;
        let header_len = header.header_len();
        if !verify_header_checksum(&bytes[..header_len]) {
            return Err(FmmtError::aborted(format!(
                "header checksum mismatch for file {} at 0x{:X}",
                header.name, offset
            )));
        }
        if !verify_data_checksum(&header, bytes) {
            return Err(FmmtError::aborted(format!(
                "data checksum mismatch for file {} at 0x{:X}",
                header.name, offset
            )));
        }

        let id = image.files.len();
        let node = image.tree.add(NodeKind::File { file: id }, Some(image.volumes[volume].node));
        image.files.push(FileAttributes {
            id,
            volume,
            parent: image.volumes[volume].parent_file,
            name: header.name,
            file_type: header.file_type,
            offset,
            size: header.size,
            raw_header: bytes[..header_len].to_vec(),
            header: header.clone(),
            ui_name: None,
            depex: None,
            leaf_path: None,
            child_volumes: Vec::new(),
            node,
            state: FileState::Live,
            handled: false,
        });

        let content = &bytes[header_len..header.size];
        let slots = if has_sections(header.file_type) {
            self.parse_sections(image, id, node, content)?
        } else {
            if !header.is_pad() {
                self.extract_leaf(image, id, content)?;
            }
            vec![SectionSlot::Raw(content.to_vec())]
        };
        image.tree.node_mut(node).sections = slots;

        let ui_name = image.files[id].ui_name.clone();
        for child in image.files[id].child_volumes.clone() {
            image.volumes[child].display_name = ui_name.clone();
        }
        debug!(
            file = %image.files[id].label(),
            offset = %format!("0x{:X}", offset),
            size = header.size,
            "Parsed file"
        );
        Ok(id)
    }

    /// Walk a section stream owned by `owner`. The sections must cover the
    /// stream exactly.
    fn parse_sections(&self, image: &mut DeviceImage, file: FileId, owner: NodeId, stream: &[u8]) -> Result<Vec<SectionSlot>> {
        let mut slots = Vec::new();
        let mut offset = 0;
        while offset < stream.len() {
            let start = align_up(offset, SECTION_ALIGNMENT);
            if start >= stream.len() {
                return Err(FmmtError::section(format!(
                    "{} trailing bytes after the last section of file {}",
                    stream.len() - offset,
                    image.files[file].name
                )));
            }
            let header = SectionHeader::from_bytes(&stream[start..])
                .map_err(|e| FmmtError::section(format!("bad section at 0x{:X}: {}", start, e)))?;
            let end = start + header.size;
            if end > stream.len() {
                return Err(FmmtError::section(format!(
                    "section at 0x{:X} overruns the body of file {}",
                    start, image.files[file].name
                )));
            }
            slots.push(self.parse_section(image, file, owner, &header, &stream[start..end])?);
            offset = end;
        }
        Ok(slots)
    }

    fn parse_section(
        &self,
        image: &mut DeviceImage,
        file: FileId,
        owner: NodeId,
        header: &SectionHeader,
        raw: &[u8],
    ) -> Result<SectionSlot> {
        let header_len = header.header_len();
        let body = &raw[header_len..];
        match header.section_type {
            section_type::FIRMWARE_VOLUME_IMAGE => {
                if FvHeader::from_bytes(body).is_err() {
                    warn!(file = %image.files[file].name, "Volume image section without a volume header");
                    return Ok(SectionSlot::Raw(raw.to_vec()));
                }
                let node = image.tree.add(
                    NodeKind::NestedVolumeSection {
                        header: raw[..header_len].to_vec(),
                    },
                    Some(owner),
                );
                self.parse_volume(image, body.to_vec(), Some((file, node)), 0)?;
                Ok(SectionSlot::Node(node))
            }
            section_type::COMPRESSION => {
                let compression = CompressionHeader::from_bytes(body)
                    .map_err(|e| FmmtError::section(format!("bad compression header: {}", e)))?;
                let stream = self.decompressor.decompress(
                    compression.compression_type,
                    &body[COMPRESSION_HEADER_SIZE..],
                    self.scratch,
                )?;
                if stream.len() != compression.uncompressed_length as usize {
                    return Err(FmmtError::section(format!(
                        "decompressed 0x{:X} bytes, header declares 0x{:X}",
                        stream.len(),
                        compression.uncompressed_length
                    )));
                }
                let node = image.tree.add(
                    NodeKind::CompressedSection {
                        compression_type: compression.compression_type,
                        header: raw[..header_len + COMPRESSION_HEADER_SIZE].to_vec(),
                    },
                    Some(owner),
                );
                let slots = self.parse_sections(image, file, node, &stream)?;
                image.tree.node_mut(node).sections = slots;
                Ok(SectionSlot::Node(node))
            }
            section_type::GUID_DEFINED => self.parse_guided(image, file, owner, header_len, raw),
            section_type::USER_INTERFACE => {
                if image.files[file].ui_name.is_some() {
                    return Ok(SectionSlot::Raw(raw.to_vec()));
                }
                let name = decode_ucs2(body);
                let exact = encode_ucs2(&name) == body;
                image.files[file].ui_name = Some(name);
                Ok(if exact {
                    SectionSlot::UserInterface
                } else {
                    SectionSlot::Raw(raw.to_vec())
                })
            }
            kind if is_depex_section(kind) && image.files[file].depex.is_none() => {
                image.files[file].depex = Some(Depex {
                    section_type: kind,
                    section: raw.to_vec(),
                });
                Ok(SectionSlot::Depex)
            }
            kind => {
                if is_leaf_section(kind) {
                    self.extract_leaf(image, file, body)?;
                }
                Ok(SectionSlot::Raw(raw.to_vec()))
            }
        }
    }

    fn parse_guided(
        &self,
        image: &mut DeviceImage,
        file: FileId,
        owner: NodeId,
        header_len: usize,
        raw: &[u8],
    ) -> Result<SectionSlot> {
        let guided = GuidDefinedHeader::from_bytes(&raw[header_len..])
            .map_err(|e| FmmtError::section(format!("bad GUID-defined header: {}", e)))?;
        let guid = guided.section_definition_guid;
        let data_offset = guided.data_offset as usize;
        let fixed_end = header_len + GUID_DEFINED_HEADER_SIZE;
        if data_offset < fixed_end || data_offset > raw.len() {
            return Err(FmmtError::section(format!(
                "GUID-defined section {} has data offset 0x{:X} outside 0x{:X}..=0x{:X}",
                guid,
                data_offset,
                fixed_end,
                raw.len()
            )));
        }
        let extra_header = raw[fixed_end..data_offset].to_vec();
        let data = &raw[data_offset..];

        let stream = match self.codecs.lookup(&guid) {
            None if guided.processing_required() => {
                return Err(FmmtError::section(format!(
                    "no codec registered for GUID-defined section {}",
                    guid
                )));
            }
            None => data.to_vec(),
            Some(entry) if guided.processing_required() || entry.kind == CodecKind::Crc32 => {
                self.codecs.decode(entry, &extra_header, data, self.scratch)?
            }
            Some(_) => data.to_vec(),
        };

        let node = image.tree.add(
            NodeKind::VendorEncodedSection {
                guid,
                attributes: guided.attributes,
                extra_header,
                header: raw[..data_offset].to_vec(),
            },
            Some(owner),
        );
        let slots = self.parse_sections(image, file, node, &stream)?;
        image.tree.node_mut(node).sections = slots;
        Ok(SectionSlot::Node(node))
    }

    /// Save the first leaf of a file to the scratch directory.
    fn extract_leaf(&self, image: &mut DeviceImage, file: FileId, content: &[u8]) -> Result<()> {
        if self.view_only || image.files[file].leaf_path.is_some() {
            return Ok(());
        }
        let path = self
            .scratch
            .write(&format!("{}.leaf", image.files[file].name), content)?;
        image.files[file].leaf_path = Some(path);
        Ok(())
    }

    /// Re-read a volume's directory after its bytes changed.
    ///
    /// Live entries are matched in order against the records now present;
    /// unmatched entries are removed (their ids stay valid) and new records
    /// are parsed as new files.
    pub fn refresh_volume(&self, image: &mut DeviceImage, volume: VolumeId) -> Result<()> {
        let dir = directory::walk(&image.volumes[volume].data)?;
        let old: Vec<FileId> = image.live_files(volume).map(|f| f.id).collect();

        let mut cursor = 0;
        let mut files = Vec::new();
        for record in dir.live() {
            let matched = old[cursor..].iter().position(|&id| {
                let f = &image.files[id];
                f.name == record.header.name
                    && f.file_type == record.header.file_type
                    && (!f.is_pad() || (f.offset == record.offset && f.size == record.header.size))
            });
            match matched {
                Some(skip) => {
                    for &gone in &old[cursor..cursor + skip] {
                        image.files[gone].transition(Transition::Remove)?;
                    }
                    let id = old[cursor + skip];
                    cursor += skip + 1;
                    let bytes = &image.volumes[volume].data[record.offset..record.end()];
                    let f = &mut image.files[id];
                    f.offset = record.offset;
                    f.size = record.header.size;
                    f.raw_header = bytes[..record.header.header_len()].to_vec();
                    f.header = record.header.clone();
                    files.push(id);
                }
                None => {
                    let bytes = image.volumes[volume].data[record.offset..record.end()].to_vec();
                    files.push(self.parse_file(image, volume, record.offset, &bytes)?);
                }
            }
        }
        for &gone in &old[cursor..] {
            image.files[gone].transition(Transition::Remove)?;
        }

        let nodes = files.iter().map(|&id| image.files[id].node).collect();
        let node = image.volumes[volume].node;
        image.tree.set_children(node, nodes);
        image.volumes[volume].header = dir.header;
        image.volumes[volume].files = files;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::format::file::{build_file, mark_deleted};
    use crate::format::section::{build_compression_section, build_guided_section, build_section};
    use crate::packager::join_sections;
    use crate::testutil::*;

    fn nested_image() -> Vec<u8> {
        let inner = VolumeBuilder::new()
            .blocks(0x200, 1)
            .file(named_file(file_guid(3), "Inner", &[0x33; 40]))
            .build();
        let stream = join_sections(&[fv_section(&inner)]);
        let wrapped = build_compression_section(compression::NOT_COMPRESSED, stream.len(), &stream);
        VolumeBuilder::new()
            .file(ffs_file(
                file_guid(1),
                file_type::FIRMWARE_VOLUME_IMAGE,
                &[ui_section("Container"), wrapped],
            ))
            .file(named_file(file_guid(2), "Outer", &[0x22; 20]))
            .build()
    }

    #[test]
    fn test_parse_flat_volume() {
        let env = TestEnv::new();
        let volume = VolumeBuilder::new()
            .fv_name(file_guid(77))
            .file(named_file(file_guid(1), "Alpha", &[0xA1; 64]))
            .file(raw_file(file_guid(2), &[0xB2; 64]))
            .build();
        let image = env.parse(volume);

        assert_eq!(image.volumes.len(), 1);
        let fv = image.volume(0);
        assert_eq!(fv.name, "FV0");
        assert_eq!(fv.fv_name, Some(file_guid(77)));
        assert_eq!(fv.files.len(), 2);

        let alpha = image.file(image.find_file(0, "Alpha").unwrap());
        assert_eq!(alpha.offset, 0x78);
        let leaf = std::fs::read(alpha.leaf_path.as_ref().unwrap()).unwrap();
        assert_eq!(leaf, vec![0xA1; 64]);

        let raw = image.find_file(0, &file_guid(2).to_string()).unwrap();
        assert_eq!(image.file(raw).ui_name, None);
        assert_eq!(std::fs::read(image.file(raw).leaf_path.as_ref().unwrap()).unwrap(), vec![0xB2; 64]);
        assert_eq!(image.find_file(0, "Nope").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_view_only_extracts_nothing() {
        let env = TestEnv::new();
        let volume = VolumeBuilder::new()
            .file(named_file(file_guid(1), "Alpha", &[1; 8]))
            .build();
        let image = env.parser().view_only(true).parse_image(volume).unwrap();
        assert!(image.files[0].leaf_path.is_none());
        assert_eq!(image.files[0].ui_name.as_deref(), Some("Alpha"));
    }

    #[test]
    fn test_nested_volume_behind_compression() {
        let env = TestEnv::new();
        let image = env.parse(nested_image());

        assert_eq!(image.volumes.len(), 2);
        let inner = image.volume(1);
        assert_eq!(inner.level, 1);
        assert_eq!(inner.parent_file, Some(0));
        assert_eq!(inner.display_name.as_deref(), Some("Container"));
        assert_eq!(image.file(0).child_volumes, vec![1]);

        let inner_file = image.find_file(1, "Inner").unwrap();
        assert_eq!(image.file(inner_file).parent, Some(0));
        assert!(image.find_file(0, "Inner").is_err());

        // Volume -> file -> compression -> volume section -> volume -> file
        let node = image.tree.node(image.file(inner_file).node);
        assert_eq!(node.depth, 5);
        assert!(matches!(
            image.tree.node(image.file(0).node).sections[..],
            [SectionSlot::UserInterface, SectionSlot::Node(_)]
        ));

        let flat = image.flattened();
        let order: Vec<_> = flat.iter().map(|e| image.file(e.file).label()).collect();
        assert_eq!(order, vec!["Container", "Inner", "Outer"]);
        assert!(flat[1].is_fv_start && flat[1].is_fv_end);
        assert_eq!(flat[1].fv_level, 1);
        assert!(!flat[0].is_fv_start && !flat[2].is_fv_end);
    }

    #[test]
    fn test_standard_compression_goes_through_tool() {
        let env = TestEnv::new();
        env.runner.on_transform("TianoCompress", |_, data| data.iter().map(|b| b ^ 0xFF).collect());
        let stream = join_sections(&[ui_section("Packed"), raw_section(&[4; 12])]);
        let packed: Vec<u8> = stream.iter().map(|b| b ^ 0xFF).collect();
        let section = build_compression_section(compression::STANDARD_COMPRESSION, stream.len(), &packed);
        let volume = VolumeBuilder::new()
            .file(ffs_file(file_guid(1), file_type::FREEFORM, &[section]))
            .build();
        let image = env.parse(volume);
        assert_eq!(image.files[0].ui_name.as_deref(), Some("Packed"));
        assert_eq!(env.runner.calls("TianoCompress"), 1);
    }

    #[test]
    fn test_guided_sections() {
        let env = TestEnv::new();
        let payload = join_sections(&[ui_section("Signed"), pe32_section(&[5; 10])]);
        let crc = crc32fast::hash(&payload).to_le_bytes();
        let guarded = build_guided_section(guid::CRC32_GUIDED_SECTION, guided::AUTH_STATUS_VALID, &crc, &payload);
        let volume = VolumeBuilder::new()
            .file(ffs_file(file_guid(1), file_type::DRIVER, &[guarded]))
            .build();
        let image = env.parse(volume);
        assert_eq!(image.files[0].ui_name.as_deref(), Some("Signed"));
        let node = image.tree.node(image.files[0].node).children[0];
        match &image.tree.node(node).kind {
            NodeKind::VendorEncodedSection { guid: g, extra_header, .. } => {
                assert_eq!(*g, guid::CRC32_GUIDED_SECTION);
                assert_eq!(extra_header, &crc.to_vec());
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_unknown_required_codec_is_section_error() {
        let env = TestEnv::new();
        let section = build_guided_section(file_guid(50), guided::PROCESSING_REQUIRED, &[], &[1, 2, 3, 4]);
        let volume = VolumeBuilder::new()
            .file(ffs_file(file_guid(1), file_type::DRIVER, &[section]))
            .build();
        let err = env.parser().parse_image(volume).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SectionError);
    }

    #[test]
    fn test_uncovered_body_is_section_error() {
        let env = TestEnv::new();
        let mut content = raw_section(&[1; 8]);
        content.extend_from_slice(&[0, 0, 0, 0, 0]);
        let volume = VolumeBuilder::new()
            .file(build_file(file_guid(1), file_type::FREEFORM, 0, &content, true))
            .build();
        let err = env.parser().parse_image(volume).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SectionError);
    }

    #[test]
    fn test_compression_length_mismatch_is_section_error() {
        let env = TestEnv::new();
        let stream = raw_section(&[1; 8]);
        let section = build_compression_section(compression::NOT_COMPRESSED, stream.len() + 4, &stream);
        let volume = VolumeBuilder::new()
            .file(ffs_file(file_guid(1), file_type::FREEFORM, &[section]))
            .build();
        let err = env.parser().parse_image(volume).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SectionError);
    }

    #[test]
    fn test_checksummed_file_parses() {
        let env = TestEnv::new();
        let volume = VolumeBuilder::new()
            .file(ffs_file_with(
                file_guid(1),
                file_type::DRIVER,
                attributes::CHECKSUM,
                &[ui_section("Summed"), pe32_section(&[1, 2, 3, 4, 5, 6, 7, 8])],
            ))
            .build();
        let image = env.parse(volume);
        let summed = image.file(image.find_file(0, "Summed").unwrap());
        assert!(summed.header.has_data_checksum());
        let leaf = std::fs::read(summed.leaf_path.as_ref().unwrap()).unwrap();
        assert_eq!(leaf, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_checksum_mismatch_is_aborted() {
        let env = TestEnv::new();
        let mut volume = VolumeBuilder::new()
            .file(build_file(file_guid(1), file_type::RAW, attributes::CHECKSUM, &[1; 16], true))
            .build();
        volume[0x48 + 24] ^= 0x01;
        let err = env.parser().parse_image(volume.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);

        volume[0x48 + 24] ^= 0x01;
        volume[0x48 + 18] = file_type::FREEFORM;
        let err = env.parser().parse_image(volume).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }

    #[test]
    fn test_bad_volume_checksum_is_aborted() {
        let env = TestEnv::new();
        let mut volume = VolumeBuilder::new().build();
        volume[0x32] ^= 0x01;
        let err = env.parser().parse_image(volume).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }

    #[test]
    fn test_depex_and_extra_ui_captured() {
        let env = TestEnv::new();
        let depex = build_section(section_type::DXE_DEPEX, &[0x06, 0x08]);
        let volume = VolumeBuilder::new()
            .file(ffs_file(
                file_guid(1),
                file_type::DRIVER,
                &[depex.clone(), ui_section("First"), ui_section("Second"), pe32_section(&[1; 4])],
            ))
            .build();
        let image = env.parse(volume);
        let file = &image.files[0];
        assert_eq!(file.ui_name.as_deref(), Some("First"));
        assert_eq!(file.depex.as_ref().unwrap().section, depex);
        let slots = &image.tree.node(file.node).sections;
        assert_eq!(slots[0], SectionSlot::Depex);
        assert_eq!(slots[1], SectionSlot::UserInterface);
        assert!(matches!(slots[2], SectionSlot::Raw(_)));
    }

    #[test]
    fn test_refresh_volume_tracks_changes() {
        let env = TestEnv::new();
        let parser = env.parser();
        let volume = VolumeBuilder::new()
            .file(named_file(file_guid(1), "A", &[1; 8]))
            .file(named_file(file_guid(2), "B", &[2; 8]))
            .build();
        let mut image = env.parse(volume);
        let a = image.find_file(0, "A").unwrap();
        let b = image.find_file(0, "B").unwrap();

        let offset = image.file(a).offset;
        mark_deleted(&mut image.volumes[0].data[offset..], true);
        let dir = directory::walk(&image.volumes[0].data).unwrap();
        let fresh = named_file(file_guid(3), "C", &[3; 8]);
        let at = dir.free_offset;
        image.volumes[0].data[at..at + fresh.len()].copy_from_slice(&fresh);

        parser.refresh_volume(&mut image, 0).unwrap();
        assert_eq!(image.file(a).state, FileState::Deleted);
        assert!(image.file(b).state.is_live());
        let c = image.find_file(0, "C").unwrap();
        assert_eq!(image.file(c).offset, at);
        assert_eq!(image.volume(0).files, vec![b, c]);
        assert_eq!(image.tree.node(image.volume(0).node).children.len(), 2);
    }
}
