//! Vendor codec registry and the compression-section decompressor.
//!
//! GUID-defined sections name their encoding by GUID; the registry maps that
//! GUID to a tool (run on a temp-file round trip) or to an in-process codec.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{FmmtError, Result};
use crate::format::constants::{compression, guid};
use crate::tools::{Scratch, ToolRunner, run_with_files};

/// How a registered encoding is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecKind {
    /// External tool taking `-d`/`-e`, `-o <out>` and the input path.
    External(String),
    /// CRC32 guided section, checked and generated in process.
    Crc32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecEntry {
    pub guid: Uuid,
    pub name: String,
    pub kind: CodecKind,
}

/// Codec table entry as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub guid: String,
    pub name: String,
    /// Tool name or path; `crc32` selects the in-process CRC32 codec.
    pub tool: String,
}

pub struct CodecRegistry {
    entries: Vec<CodecEntry>,
    runner: Arc<dyn ToolRunner>,
}

impl CodecRegistry {
    /// Empty registry.
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            entries: Vec::new(),
            runner,
        }
    }

    /// Registry with the usual EDK II tool names.
    pub fn with_defaults(runner: Arc<dyn ToolRunner>) -> Self {
        let mut registry = Self::new(runner);
        for (guid, name, tool) in [
            (guid::LZMA_CUSTOM_DECOMPRESS, "LZMA", "LzmaCompress"),
            (guid::LZMA_F86_CUSTOM_DECOMPRESS, "LZMAF86", "LzmaF86Compress"),
            (guid::TIANO_CUSTOM_DECOMPRESS, "TIANO", "TianoCompress"),
            (guid::BROTLI_CUSTOM_DECOMPRESS, "BROTLI", "BrotliCompress"),
        ] {
            registry.register(CodecEntry {
                guid,
                name: name.into(),
                kind: CodecKind::External(tool.into()),
            });
        }
        registry.register(CodecEntry {
            guid: guid::CRC32_GUIDED_SECTION,
            name: "CRC32".into(),
            kind: CodecKind::Crc32,
        });
        registry
    }

    /// Registry from configuration; an empty table falls back to the defaults.
    pub fn from_config(table: &[CodecConfig], runner: Arc<dyn ToolRunner>) -> Result<Self> {
        if table.is_empty() {
            return Ok(Self::with_defaults(runner));
        }
        let mut registry = Self::new(runner);
        for entry in table {
            let guid = Uuid::parse_str(&entry.guid).map_err(|e| {
                FmmtError::Config(format!("codec '{}' has bad GUID '{}': {}", entry.name, entry.guid, e))
            })?;
            let kind = if entry.tool.eq_ignore_ascii_case("crc32") {
                CodecKind::Crc32
            } else {
                CodecKind::External(entry.tool.clone())
            };
            registry.register(CodecEntry {
                guid,
                name: entry.name.clone(),
                kind,
            });
        }
        Ok(registry)
    }

    /// Add an entry; a later entry for the same GUID wins.
    pub fn register(&mut self, entry: CodecEntry) {
        self.entries.retain(|e| e.guid != entry.guid);
        self.entries.push(entry);
    }

    pub fn lookup(&self, guid: &Uuid) -> Option<&CodecEntry> {
        self.entries.iter().find(|e| e.guid == *guid)
    }

    pub fn entries(&self) -> &[CodecEntry] {
        &self.entries
    }

    /// Decode the data of a GUID-defined section into a section stream.
    pub fn decode(&self, entry: &CodecEntry, extra_header: &[u8], data: &[u8], scratch: &Scratch) -> Result<Vec<u8>> {
        debug!(codec = %entry.name, len = data.len(), "Decoding guided section");
        match &entry.kind {
            CodecKind::External(tool) => run_with_files(self.runner.as_ref(), scratch, tool, &["-d".into()], data),
            CodecKind::Crc32 => {
                let stored = crc_from_header(extra_header)?;
                let actual = crc32fast::hash(data);
                if stored != actual {
                    return Err(FmmtError::section(format!(
                        "CRC32 mismatch: header 0x{:08X}, data 0x{:08X}",
                        stored, actual
                    )));
                }
                Ok(data.to_vec())
            }
        }
    }

    /// Encode a section stream. Returns the definition-specific header bytes
    /// and the encoded data.
    pub fn encode(
        &self,
        entry: &CodecEntry,
        extra_header: &[u8],
        payload: &[u8],
        scratch: &Scratch,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        debug!(codec = %entry.name, len = payload.len(), "Encoding guided section");
        match &entry.kind {
            CodecKind::External(tool) => {
                let data = run_with_files(self.runner.as_ref(), scratch, tool, &["-e".into()], payload)?;
                Ok((extra_header.to_vec(), data))
            }
            CodecKind::Crc32 => Ok((
                crc32fast::hash(payload).to_le_bytes().to_vec(),
                payload.to_vec(),
            )),
        }
    }
}

fn crc_from_header(extra_header: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = extra_header
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FmmtError::section("CRC32 section header too short"))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Handles compression sections: `NOT_COMPRESSED` in process, standard
/// compression through the configured tool.
#[derive(Clone)]
pub struct Decompressor {
    runner: Arc<dyn ToolRunner>,
    standard_tool: String,
}

impl Decompressor {
    pub fn new(runner: Arc<dyn ToolRunner>, standard_tool: impl Into<String>) -> Self {
        Self {
            runner,
            standard_tool: standard_tool.into(),
        }
    }

    pub fn decompress(&self, compression_type: u8, data: &[u8], scratch: &Scratch) -> Result<Vec<u8>> {
        match compression_type {
            compression::NOT_COMPRESSED => Ok(data.to_vec()),
            compression::STANDARD_COMPRESSION => run_with_files(
                self.runner.as_ref(),
                scratch,
                &self.standard_tool,
                &["--uefi".into(), "-d".into()],
                data,
            ),
            other => Err(FmmtError::section(format!(
                "unsupported compression type 0x{:02X}",
                other
            ))),
        }
    }

    pub fn compress(&self, compression_type: u8, data: &[u8], scratch: &Scratch) -> Result<Vec<u8>> {
        match compression_type {
            compression::NOT_COMPRESSED => Ok(data.to_vec()),
            compression::STANDARD_COMPRESSION => run_with_files(
                self.runner.as_ref(),
                scratch,
                &self.standard_tool,
                &["--uefi".into(), "-e".into()],
                data,
            ),
            other => Err(FmmtError::section(format!(
                "unsupported compression type 0x{:02X}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tools::MockRunner;

    fn setup() -> (Arc<MockRunner>, CodecRegistry, Scratch) {
        let mock = Arc::new(MockRunner::new());
        let registry = CodecRegistry::with_defaults(mock.clone());
        (mock, registry, Scratch::new(None).unwrap())
    }

    #[test]
    fn test_default_table() {
        let (_, registry, _) = setup();
        assert_eq!(registry.entries().len(), 5);
        let lzma = registry.lookup(&guid::LZMA_CUSTOM_DECOMPRESS).unwrap();
        assert_eq!(lzma.kind, CodecKind::External("LzmaCompress".into()));
        assert!(registry.lookup(&Uuid::nil()).is_none());
    }

    #[test]
    fn test_external_decode_round_trip() {
        let (mock, registry, scratch) = setup();
        // XOR stands in for the real codec; it is its own inverse.
        mock.on_transform("LzmaCompress", |_, data| data.iter().map(|b| b ^ 0x5A).collect());
        let entry = registry.lookup(&guid::LZMA_CUSTOM_DECOMPRESS).unwrap().clone();
        let (extra, encoded) = registry.encode(&entry, &[], b"payload", &scratch).unwrap();
        assert!(extra.is_empty());
        assert_ne!(encoded, b"payload");
        let decoded = registry.decode(&entry, &[], &encoded, &scratch).unwrap();
        assert_eq!(decoded, b"payload");
        assert_eq!(mock.calls("LzmaCompress"), 2);
    }

    #[test]
    fn test_crc32_in_process() {
        let (mock, registry, scratch) = setup();
        let entry = registry.lookup(&guid::CRC32_GUIDED_SECTION).unwrap().clone();
        let (extra, data) = registry.encode(&entry, &[], b"sections", &scratch).unwrap();
        assert_eq!(extra, crc32fast::hash(b"sections").to_le_bytes());
        assert_eq!(registry.decode(&entry, &extra, &data, &scratch).unwrap(), b"sections");

        let err = registry.decode(&entry, &[0, 0, 0, 0], &data, &scratch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SectionError);
        assert!(mock.invocations().is_empty());
    }

    #[test]
    fn test_from_config() {
        let mock: Arc<dyn ToolRunner> = Arc::new(MockRunner::new());
        let table = vec![CodecConfig {
            guid: "ee4e5898-3914-4259-9d6e-dc7bd79403cf".into(),
            name: "LZMA".into(),
            tool: "/opt/edk2/LzmaCompress".into(),
        }];
        let registry = CodecRegistry::from_config(&table, mock.clone()).unwrap();
        assert_eq!(registry.entries().len(), 1);
        assert_eq!(
            registry.lookup(&guid::LZMA_CUSTOM_DECOMPRESS).unwrap().kind,
            CodecKind::External("/opt/edk2/LzmaCompress".into())
        );

        let bad = vec![CodecConfig {
            guid: "nope".into(),
            name: "X".into(),
            tool: "x".into(),
        }];
        assert!(matches!(
            CodecRegistry::from_config(&bad, mock),
            Err(FmmtError::Config(_))
        ));
    }

    #[test]
    fn test_decompressor_kinds() {
        let mock = Arc::new(MockRunner::new());
        mock.on_transform("TianoCompress", |_, data| [data, data].concat());
        let decompressor = Decompressor::new(mock.clone(), "TianoCompress");
        let scratch = Scratch::new(None).unwrap();

        assert_eq!(
            decompressor.decompress(compression::NOT_COMPRESSED, b"ab", &scratch).unwrap(),
            b"ab"
        );
        assert_eq!(
            decompressor.decompress(compression::STANDARD_COMPRESSION, b"ab", &scratch).unwrap(),
            b"abab"
        );
        assert_eq!(mock.invocations()[0].args[..2], ["--uefi".to_string(), "-d".to_string()]);
        assert!(decompressor.decompress(7, b"ab", &scratch).is_err());
    }
}
