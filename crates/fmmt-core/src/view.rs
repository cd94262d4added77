//! Human-readable report of a parsed device image.

use std::fmt;

use uuid::Uuid;

use crate::format::constants::file_type;
use crate::model::{DeviceImage, VolumeId};
use crate::space::free_space;

/// Short name of a file type.
pub fn file_type_name(kind: u8) -> &'static str {
    match kind {
        file_type::RAW => "RAW",
        file_type::FREEFORM => "FREEFORM",
        file_type::SECURITY_CORE => "SEC_CORE",
        file_type::PEI_CORE => "PEI_CORE",
        file_type::DXE_CORE => "DXE_CORE",
        file_type::PEIM => "PEIM",
        file_type::DRIVER => "DRIVER",
        file_type::COMBINED_PEIM_DRIVER => "PEIM_DRIVER",
        file_type::APPLICATION => "APPLICATION",
        file_type::MM => "MM",
        file_type::FIRMWARE_VOLUME_IMAGE => "FV_IMAGE",
        file_type::COMBINED_MM_DXE => "MM_DXE",
        file_type::MM_CORE => "MM_CORE",
        file_type::MM_STANDALONE => "MM_STANDALONE",
        file_type::MM_CORE_STANDALONE => "MM_CORE_STANDALONE",
        file_type::FFS_PAD => "PAD",
        0xC0..=0xDF => "OEM",
        0xE0..=0xEF => "DEBUG",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub guid: Uuid,
    pub type_name: &'static str,
    pub offset: usize,
    pub size: usize,
    pub ui_name: Option<String>,
    /// Nesting depth of the enclosing volume.
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeReport {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub erase_polarity: bool,
    pub fv_name: Option<Uuid>,
    pub display_name: Option<String>,
    pub level: usize,
    pub free_space: usize,
    pub files: Vec<FileReport>,
}

/// Volumes in depth-first order; a nested volume follows the volume holding
/// its file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageReport {
    pub size: usize,
    pub volumes: Vec<VolumeReport>,
}

impl ImageReport {
    pub fn from_image(image: &DeviceImage) -> Self {
        let volumes = image
            .volumes
            .iter()
            .filter(|v| !v.deleted)
            .map(|v| volume_report(image, v.id))
            .collect();
        Self {
            size: image.len(),
            volumes,
        }
    }

    /// Format as markdown tables, one per volume.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for volume in &self.volumes {
            out.push_str(&format!(
                "### {}{}\n\n",
                volume.name,
                volume
                    .display_name
                    .as_ref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default()
            ));
            out.push_str("| Offset | Size | Level | Erase | Free | GUID |\n");
            out.push_str("|--------|------|-------|-------|------|------|\n");
            out.push_str(&format!(
                "| 0x{:X} | 0x{:X} | {} | {} | 0x{:X} | {} |\n\n",
                volume.offset,
                volume.size,
                volume.level,
                u8::from(volume.erase_polarity),
                volume.free_space,
                volume.fv_name.map(|g| g.to_string()).unwrap_or_else(|| "-".into())
            ));
            out.push_str("| GUID | Type | Offset | Size | Name |\n");
            out.push_str("|------|------|--------|------|------|\n");
            for file in &volume.files {
                out.push_str(&format!(
                    "| {} | {} | 0x{:X} | 0x{:X} | {} |\n",
                    file.guid,
                    file.type_name,
                    file.offset,
                    file.size,
                    file.ui_name.as_deref().unwrap_or("")
                ));
            }
            out.push('\n');
        }
        out
    }
}

fn volume_report(image: &DeviceImage, id: VolumeId) -> VolumeReport {
    let volume = image.volume(id);
    let files = image
        .live_files(id)
        .map(|f| FileReport {
            guid: f.name,
            type_name: file_type_name(f.file_type),
            offset: f.offset,
            size: f.size,
            ui_name: f.ui_name.clone(),
            level: volume.level,
        })
        .collect();
    VolumeReport {
        name: volume.name.clone(),
        offset: volume.offset,
        size: volume.len(),
        erase_polarity: volume.erase_polarity(),
        fv_name: volume.fv_name,
        display_name: volume.display_name.clone(),
        level: volume.level,
        free_space: free_space(&volume.data).unwrap_or(0),
        files,
    }
}

impl fmt::Display for ImageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image size: 0x{:X}", self.size)?;
        for volume in &self.volumes {
            let indent = "  ".repeat(volume.level);
            write!(
                f,
                "{}{}: offset 0x{:X}, size 0x{:X}, free 0x{:X}, erase polarity {}",
                indent,
                volume.name,
                volume.offset,
                volume.size,
                volume.free_space,
                u8::from(volume.erase_polarity)
            )?;
            if let Some(guid) = volume.fv_name {
                write!(f, ", {}", guid)?;
            }
            if let Some(name) = &volume.display_name {
                write!(f, " \"{}\"", name)?;
            }
            writeln!(f)?;
            for file in &volume.files {
                write!(
                    f,
                    "{}  {} {:<12} 0x{:08X} 0x{:X}",
                    indent, file.guid, file.type_name, file.offset, file.size
                )?;
                match &file.ui_name {
                    Some(name) => writeln!(f, " {}", name)?,
                    None => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn sample() -> ImageReport {
        let env = TestEnv::new();
        let inner = VolumeBuilder::new()
            .blocks(0x400, 1)
            .file(named_file(file_guid(2), "Inner", &[2; 16]))
            .build();
        let outer = VolumeBuilder::new()
            .fv_name(file_guid(9))
            .file(named_file(file_guid(1), "Alpha", &[1; 16]))
            .file(ffs_file(
                file_guid(3),
                file_type::FIRMWARE_VOLUME_IMAGE,
                &[fv_section(&inner), ui_section("Nested")],
            ))
            .build();
        ImageReport::from_image(&env.parse(outer))
    }

    #[test]
    fn test_report_contents() {
        let report = sample();
        assert_eq!(report.volumes.len(), 2);
        let outer = &report.volumes[0];
        assert_eq!(outer.fv_name, Some(file_guid(9)));
        // The pad holding the extended header is part of the volume header.
        assert_eq!(outer.files.len(), 2);
        assert_eq!(outer.files[0].ui_name.as_deref(), Some("Alpha"));
        assert_eq!(outer.files[1].type_name, "FV_IMAGE");
        let inner = &report.volumes[1];
        assert_eq!(inner.level, 1);
        assert_eq!(inner.display_name.as_deref(), Some("Nested"));
        assert!(inner.free_space > 0);
    }

    #[test]
    fn test_text_and_markdown() {
        let report = sample();
        let text = report.to_string();
        assert!(text.contains("FV0: offset 0x0, size 0x1000"));
        assert!(text.contains("  FV1: offset"));
        assert!(text.contains("DRIVER"));
        assert!(text.contains(" Alpha\n"));

        let md = report.to_markdown();
        assert!(md.contains("### FV1 (Nested)"));
        assert!(md.contains("| FV_IMAGE |"));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(file_type_name(file_type::PEIM), "PEIM");
        assert_eq!(file_type_name(0xC5), "OEM");
        assert_eq!(file_type_name(0x42), "UNKNOWN");
    }
}
