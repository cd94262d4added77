//! Packager backed by the GenSec / GenFfs / GenFv generation tools.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::{FileRequest, Packager, SectionKind, VolumeRequest};
use crate::error::{FmmtError, Result};
use crate::format::constants::*;
use crate::format::file::seal_file;
use crate::format::{FvHeader, decode_ucs2};
use crate::session::ToolPaths;
use crate::tools::{Scratch, ToolRunner};

pub struct ToolPackager {
    runner: Arc<dyn ToolRunner>,
    tools: ToolPaths,
}

fn section_token(kind: u8) -> Result<&'static str> {
    Ok(match kind {
        section_type::COMPRESSION => "EFI_SECTION_COMPRESSION",
        section_type::GUID_DEFINED => "EFI_SECTION_GUID_DEFINED",
        section_type::PE32 => "EFI_SECTION_PE32",
        section_type::PIC => "EFI_SECTION_PIC",
        section_type::TE => "EFI_SECTION_TE",
        section_type::DXE_DEPEX => "EFI_SECTION_DXE_DEPEX",
        section_type::VERSION => "EFI_SECTION_VERSION",
        section_type::USER_INTERFACE => "EFI_SECTION_USER_INTERFACE",
        section_type::COMPATIBILITY16 => "EFI_SECTION_COMPATIBILITY16",
        section_type::FIRMWARE_VOLUME_IMAGE => "EFI_SECTION_FIRMWARE_VOLUME_IMAGE",
        section_type::FREEFORM_SUBTYPE_GUID => "EFI_SECTION_FREEFORM_SUBTYPE_GUID",
        section_type::RAW => "EFI_SECTION_RAW",
        section_type::PEI_DEPEX => "EFI_SECTION_PEI_DEPEX",
        section_type::MM_DEPEX => "EFI_SECTION_SMM_DEPEX",
        other => {
            return Err(FmmtError::section(format!(
                "no generation token for section type 0x{:02X}",
                other
            )));
        }
    })
}

fn file_token(kind: u8) -> Result<&'static str> {
    Ok(match kind {
        file_type::RAW => "EFI_FV_FILETYPE_RAW",
        file_type::FREEFORM => "EFI_FV_FILETYPE_FREEFORM",
        file_type::SECURITY_CORE => "EFI_FV_FILETYPE_SECURITY_CORE",
        file_type::PEI_CORE => "EFI_FV_FILETYPE_PEI_CORE",
        file_type::DXE_CORE => "EFI_FV_FILETYPE_DXE_CORE",
        file_type::PEIM => "EFI_FV_FILETYPE_PEIM",
        file_type::DRIVER => "EFI_FV_FILETYPE_DRIVER",
        file_type::COMBINED_PEIM_DRIVER => "EFI_FV_FILETYPE_COMBINED_PEIM_DRIVER",
        file_type::APPLICATION => "EFI_FV_FILETYPE_APPLICATION",
        file_type::MM => "EFI_FV_FILETYPE_SMM",
        file_type::FIRMWARE_VOLUME_IMAGE => "EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE",
        file_type::COMBINED_MM_DXE => "EFI_FV_FILETYPE_COMBINED_SMM_DXE",
        file_type::MM_CORE => "EFI_FV_FILETYPE_SMM_CORE",
        file_type::MM_STANDALONE => "EFI_FV_FILETYPE_MM_STANDALONE",
        file_type::MM_CORE_STANDALONE => "EFI_FV_FILETYPE_MM_CORE_STANDALONE",
        file_type::FFS_PAD => "EFI_FV_FILETYPE_FFS_PAD",
        other => {
            return Err(FmmtError::InvalidParameter(format!(
                "no generation token for file type 0x{:02X}",
                other
            )));
        }
    })
}

/// GenFfs spelling of a content alignment.
fn alignment_token(alignment: usize) -> String {
    match alignment {
        a if a >= 1 << 20 => format!("{}M", a >> 20),
        a if a >= 1 << 10 => format!("{}K", a >> 10),
        a => a.to_string(),
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

impl ToolPackager {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    fn run(&self, program: &str, args: Vec<String>, output: &Path) -> Result<Vec<u8>> {
        debug!(program = %program, args = ?args, "Running generation tool");
        self.runner.run(program, &args)?;
        std::fs::read(output).map_err(|e| FmmtError::ToolFailure {
            tool: program.to_string(),
            message: format!("no output produced: {}", e),
        })
    }

    /// Volume description file in the format GenFv reads.
    fn volume_inf(&self, request: &VolumeRequest, file_paths: &[String]) -> String {
        let block_size = request.block_size.max(1);
        let mut inf = String::new();
        let _ = writeln!(inf, "[options]");
        let _ = writeln!(inf, "EFI_BLOCK_SIZE = 0x{:X}", block_size);
        let _ = writeln!(inf, "EFI_NUM_BLOCKS = 0x{:X}", request.min_length.div_ceil(block_size));
        if let Some(base) = request.base_address {
            let _ = writeln!(inf, "EFI_BASE_ADDRESS = 0x{:X}", base);
        }
        let _ = writeln!(inf, "[attributes]");
        let _ = writeln!(
            inf,
            "EFI_ERASE_POLARITY = {}",
            if request.erase_polarity { 1 } else { 0 }
        );
        let _ = writeln!(inf, "[files]");
        for path in file_paths {
            let _ = writeln!(inf, "EFI_FILE_NAME = {}", path);
        }
        inf
    }
}

impl Packager for ToolPackager {
    fn section(&self, kind: &SectionKind, payload: &[u8], scratch: &Scratch) -> Result<Vec<u8>> {
        let output = scratch.unique_path("section.sec");
        let mut args: Vec<String> = Vec::new();
        match kind {
            SectionKind::FirmwareVolume => {
                args.extend(["-s".into(), section_token(section_type::FIRMWARE_VOLUME_IMAGE)?.into()]);
            }
            SectionKind::Compression { compression_type } => {
                let method = match *compression_type {
                    compression::NOT_COMPRESSED => "PI_NONE",
                    _ => "PI_STD",
                };
                args.extend([
                    "-s".into(),
                    section_token(section_type::COMPRESSION)?.into(),
                    "-c".into(),
                    method.into(),
                ]);
            }
            SectionKind::GuidDefined {
                guid,
                attributes,
                extra_header,
            } => {
                args.extend([
                    "-s".into(),
                    section_token(section_type::GUID_DEFINED)?.into(),
                    "-g".into(),
                    guid.to_string(),
                ]);
                if attributes & guided::PROCESSING_REQUIRED != 0 {
                    args.extend(["-r".into(), "PROCESSING_REQUIRED".into()]);
                }
                if attributes & guided::AUTH_STATUS_VALID != 0 {
                    args.extend(["-r".into(), "AUTH_STATUS_VALID".into()]);
                }
                if *attributes == 0 {
                    args.extend(["-r".into(), "NONE".into()]);
                }
                // GenSec computes the CRC32 header itself from the payload.
                let input = if *guid == guid::CRC32_GUIDED_SECTION {
                    payload.to_vec()
                } else {
                    let header_len = SECTION_HEADER_SIZE + GUID_DEFINED_HEADER_SIZE + extra_header.len();
                    args.extend(["-l".into(), header_len.to_string()]);
                    let mut input = extra_header.clone();
                    input.extend_from_slice(payload);
                    input
                };
                let input_path = scratch.write("guided.bin", &input)?;
                args.extend(["-o".into(), path_arg(&output), path_arg(&input_path)]);
                return self.run(&self.tools.gen_sec, args, &output);
            }
            SectionKind::Leaf(section_type::USER_INTERFACE) => {
                args.extend([
                    "-s".into(),
                    section_token(section_type::USER_INTERFACE)?.into(),
                    "-n".into(),
                    decode_ucs2(payload),
                    "-o".into(),
                    path_arg(&output),
                ]);
                return self.run(&self.tools.gen_sec, args, &output);
            }
            SectionKind::Leaf(kind) => {
                args.extend(["-s".into(), section_token(*kind)?.into()]);
            }
        }
        let input_path = scratch.write("payload.bin", payload)?;
        args.extend(["-o".into(), path_arg(&output), path_arg(&input_path)]);
        self.run(&self.tools.gen_sec, args, &output)
    }

    fn file(&self, request: &FileRequest, content: &[u8], scratch: &Scratch) -> Result<Vec<u8>> {
        let input_path = scratch.write("sections.sec", content)?;
        let output = scratch.unique_path("file.ffs");
        let mut args: Vec<String> = vec![
            "-t".into(),
            file_token(request.file_type)?.into(),
            "-g".into(),
            request.name.to_string(),
        ];
        if request.attributes & attributes::FIXED != 0 {
            args.push("-x".into());
        }
        if request.attributes & attributes::CHECKSUM != 0 {
            args.push("-s".into());
        }
        let shape = crate::format::FfsFileHeader::new(request.name, request.file_type, request.attributes, 0);
        if shape.alignment() > 1 {
            args.extend(["-a".into(), alignment_token(shape.alignment())]);
        }
        args.extend(["-i".into(), path_arg(&input_path), "-o".into(), path_arg(&output)]);
        let mut file = self.run(&self.tools.gen_ffs, args, &output)?;
        // GenFfs stamps the state for polarity 0.
        seal_file(&mut file, request.erase_polarity)?;
        Ok(file)
    }

    fn volume(&self, request: &VolumeRequest, files: &[Vec<u8>], scratch: &Scratch) -> Result<Vec<u8>> {
        let paths = files
            .iter()
            .map(|f| scratch.write("member.ffs", f).map(|p| path_arg(&p)))
            .collect::<Result<Vec<_>>>()?;
        let inf_path = scratch.write("volume.inf", self.volume_inf(request, &paths).as_bytes())?;
        let output = scratch.unique_path("volume.fv");
        let mut args: Vec<String> = vec!["-i".into(), path_arg(&inf_path), "-o".into(), path_arg(&output)];
        let header = FvHeader::from_bytes(&request.header)?;
        if header.supports_large_files() {
            args.extend(["-g".into(), guid::FIRMWARE_FILE_SYSTEM3.to_string()]);
        }
        if let Some(name) = request.fv_name {
            args.extend(["--FvNameGuid".into(), name.to_string()]);
        }
        self.run(&self.tools.gen_fv, args, &output)
    }
}
