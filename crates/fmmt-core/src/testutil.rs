//! Fixture builders shared by the unit tests.

use std::sync::Arc;

use uuid::Uuid;

use crate::codec::{CodecRegistry, Decompressor};
use crate::format::constants::*;
use crate::format::file::{build_file, seal_file, set_state};
use crate::format::section::build_section;
use crate::format::{FfsFileHeader, FvHeader, encode_ucs2, guid_from_bytes};
use crate::model::DeviceImage;
use crate::packager::{NativePackager, join_sections};
use crate::parser::ContainerParser;
use crate::tools::{MockRunner, Scratch, ToolRunner};

pub(crate) fn file_guid(n: u128) -> Uuid {
    Uuid::from_u128(0x6d3b_0000_0000_4000_8000_0000_0000_0000 | n)
}

/// RAW file (no sections) with the given content.
pub(crate) fn raw_file(name: Uuid, content: &[u8]) -> Vec<u8> {
    build_file(name, file_type::RAW, 0, content, true)
}

/// File built from a section list, 4-byte aligned the usual way.
pub(crate) fn ffs_file(name: Uuid, kind: u8, sections: &[Vec<u8>]) -> Vec<u8> {
    ffs_file_with(name, kind, 0, sections)
}

pub(crate) fn ffs_file_with(name: Uuid, kind: u8, attributes: u8, sections: &[Vec<u8>]) -> Vec<u8> {
    build_file(name, kind, attributes, &join_sections(sections), true)
}

pub(crate) fn ui_section(name: &str) -> Vec<u8> {
    build_section(section_type::USER_INTERFACE, &encode_ucs2(name))
}

pub(crate) fn raw_section(body: &[u8]) -> Vec<u8> {
    build_section(section_type::RAW, body)
}

pub(crate) fn pe32_section(body: &[u8]) -> Vec<u8> {
    build_section(section_type::PE32, body)
}

pub(crate) fn fv_section(volume: &[u8]) -> Vec<u8> {
    build_section(section_type::FIRMWARE_VOLUME_IMAGE, volume)
}

/// Driver-style file: UI section followed by a PE32 leaf.
pub(crate) fn named_file(name: Uuid, ui: &str, body: &[u8]) -> Vec<u8> {
    ffs_file(name, file_type::DRIVER, &[ui_section(ui), pe32_section(body)])
}

/// Pad file of exactly `size` bytes.
pub(crate) fn pad_file(size: usize, erase_polarity: bool) -> Vec<u8> {
    let erase = if erase_polarity { 0xFF } else { 0x00 };
    let header = FfsFileHeader::new(
        guid_from_bytes(&[erase; 16]),
        file_type::FFS_PAD,
        0,
        size - FFS_FILE_HEADER_SIZE,
    );
    let mut pad = vec![erase; size];
    pad[..FFS_FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    seal_file(&mut pad, erase_polarity).unwrap();
    pad
}

/// Assembles a volume the way the generation tools lay one out: files back to
/// back at 8-byte boundaries, erase-filled tail, optional top file at the end.
pub(crate) struct VolumeBuilder {
    erase_polarity: bool,
    file_system: Uuid,
    block_size: u32,
    num_blocks: u32,
    fv_name: Option<Uuid>,
    files: Vec<Vec<u8>>,
    top_file: Option<Vec<u8>>,
}

impl VolumeBuilder {
    pub(crate) fn new() -> Self {
        Self {
            erase_polarity: true,
            file_system: guid::FIRMWARE_FILE_SYSTEM2,
            block_size: 0x1000,
            num_blocks: 1,
            fv_name: None,
            files: Vec::new(),
            top_file: None,
        }
    }

    pub(crate) fn erase_polarity(mut self, polarity: bool) -> Self {
        self.erase_polarity = polarity;
        self
    }

    pub(crate) fn ffs3(mut self) -> Self {
        self.file_system = guid::FIRMWARE_FILE_SYSTEM3;
        self
    }

    pub(crate) fn blocks(mut self, block_size: u32, num_blocks: u32) -> Self {
        self.block_size = block_size;
        self.num_blocks = num_blocks;
        self
    }

    pub(crate) fn fv_name(mut self, name: Uuid) -> Self {
        self.fv_name = Some(name);
        self
    }

    pub(crate) fn file(mut self, file: Vec<u8>) -> Self {
        self.files.push(file);
        self
    }

    pub(crate) fn pad(mut self, size: usize) -> Self {
        let polarity = self.erase_polarity;
        self.files.push(pad_file(size, polarity));
        self
    }

    pub(crate) fn top_file(mut self, file: Vec<u8>) -> Self {
        self.top_file = Some(file);
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let erase = if self.erase_polarity { 0xFF } else { 0x00 };
        let attributes = if self.erase_polarity { FVB2_ERASE_POLARITY } else { 0 };
        let mut header = FvHeader::new(self.file_system, attributes, self.block_size, self.num_blocks);
        let length = header.fv_length as usize;

        let mut out = Vec::new();
        if let Some(name) = self.fv_name {
            // Extended header lives inside a pad file right after the block map.
            header.ext_header_offset = (header.header_length as usize + FFS_FILE_HEADER_SIZE) as u16;
            header.update_checksum();
            out = header.to_bytes();
            let mut ext = name.to_bytes_le().to_vec();
            ext.extend_from_slice(&(FV_EXT_HEADER_SIZE as u32).to_le_bytes());
            let pad_header = FfsFileHeader::new(
                guid_from_bytes(&[erase; 16]),
                file_type::FFS_PAD,
                0,
                ext.len(),
            );
            let mut pad = pad_header.to_bytes();
            pad.extend_from_slice(&ext);
            seal_file(&mut pad, self.erase_polarity).unwrap();
            out.extend_from_slice(&pad);
        } else {
            out.extend_from_slice(&header.to_bytes());
        }

        for mut file in self.files {
            set_state(&mut file, self.erase_polarity);
            while out.len() % FFS_FILE_ALIGNMENT != 0 {
                out.push(erase);
            }
            out.extend_from_slice(&file);
        }
        if let Some(mut top) = self.top_file {
            set_state(&mut top, self.erase_polarity);
            while out.len() % FFS_FILE_ALIGNMENT != 0 {
                out.push(erase);
            }
            let start = length - top.len();
            let gap = start - out.len();
            if gap > 0 {
                out.extend_from_slice(&pad_file(gap, self.erase_polarity));
            }
            out.extend_from_slice(&top);
        }
        assert!(out.len() <= length, "fixture volume overflows");
        out.resize(length, erase);
        out
    }
}

/// Capabilities wired to a mock runner and a private scratch directory.
pub(crate) struct TestEnv {
    pub(crate) runner: Arc<MockRunner>,
    pub(crate) codecs: CodecRegistry,
    pub(crate) decompressor: Decompressor,
    pub(crate) scratch: Scratch,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        let runner = Arc::new(MockRunner::new());
        let dyn_runner: Arc<dyn ToolRunner> = runner.clone();
        Self {
            codecs: CodecRegistry::with_defaults(dyn_runner.clone()),
            decompressor: Decompressor::new(dyn_runner, "TianoCompress"),
            runner,
            scratch: Scratch::new(None).unwrap(),
        }
    }

    pub(crate) fn parser(&self) -> ContainerParser<'_> {
        ContainerParser::new(&self.codecs, &self.decompressor, &self.scratch)
    }

    pub(crate) fn packager(&self) -> NativePackager {
        NativePackager::new(self.decompressor.clone())
    }

    pub(crate) fn parse(&self, data: Vec<u8>) -> DeviceImage {
        self.parser().parse_image(data).unwrap()
    }
}
