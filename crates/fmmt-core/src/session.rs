//! FMMT session: high-level orchestrator for view, extract and mutation runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::address::resolve_base_address;
use crate::codec::{CodecConfig, CodecRegistry, Decompressor};
use crate::error::{ErrorKind, FmmtError, Result};
use crate::events::{FmmtEvent, FmmtObserver, LogLevel, MutationKind, TracingObserver};
use crate::format::file::seal_file;
use crate::model::{DeviceImage, FileId, VolumeId};
use crate::mutator::{self, PreparedFile, ReplaceOutcome, prepare_file};
use crate::packager::{NativePackager, Packager, ToolPackager};
use crate::parser::ContainerParser;
use crate::rebase::{CodeRebaser, ToolRebaser};
use crate::rebuild::Rebuilder;
use crate::request::{Mutation, MutationGroup, MutationRequest};
use crate::state::{ReplaceMode, Transition};
use crate::tools::{ProcessRunner, Scratch, ToolRunner};
use crate::view::ImageReport;

/// How files, sections and volumes are regenerated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagerKind {
    #[default]
    Native,
    Tools,
}

/// Names or paths of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub gen_sec: String,
    pub gen_ffs: String,
    pub gen_fv: String,
    /// Standard (EFI) compression.
    pub compress: String,
    /// Code rebaser; rebasing is skipped when unset.
    pub rebase: Option<String>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            gen_sec: "GenSec".into(),
            gen_ffs: "GenFfs".into(),
            gen_fv: "GenFv".into(),
            compress: "TianoCompress".into(),
            rebase: None,
        }
    }
}

pub const DEFAULT_LARGE_FILE_THRESHOLD: usize = 0xFF_FFFF;

/// Configuration for an FMMT session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FmmtConfig {
    pub packager: PackagerKind,
    /// Nested volumes above this size force a large header on their file.
    pub large_file_threshold: usize,
    /// Parent directory for the scratch directory.
    pub scratch_dir: Option<PathBuf>,
    pub tools: ToolPaths,
    /// Vendor codec table; the built-in table is used when empty.
    pub codecs: Vec<CodecConfig>,
}

impl Default for FmmtConfig {
    fn default() -> Self {
        Self {
            packager: PackagerKind::default(),
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            scratch_dir: None,
            tools: ToolPaths::default(),
            codecs: Vec::new(),
        }
    }
}

impl FmmtConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| FmmtError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| FmmtError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Outcome of a mutation batch.
#[derive(Debug)]
pub struct BatchResult {
    /// Image bytes after every group that completed.
    pub data: Vec<u8>,
    /// Number of volume groups applied.
    pub applied: usize,
    /// Lookup failure that stopped the batch early.
    pub not_found: Option<FmmtError>,
}

/// Capabilities for one run. The scratch directory lives as long as this.
struct Workbench {
    scratch: Scratch,
    codecs: CodecRegistry,
    decompressor: Decompressor,
    packager: Box<dyn Packager>,
    rebaser: Option<Box<dyn CodeRebaser>>,
}

impl Workbench {
    fn parser(&self) -> ContainerParser<'_> {
        ContainerParser::new(&self.codecs, &self.decompressor, &self.scratch)
    }
}

/// A resolved mutation: targets are file ids, new files are read from disk.
enum Op {
    Delete { file: FileId },
    Replace { old: FileId, bytes: Vec<u8> },
    Add { bytes: Vec<u8> },
}

/// FMMT session - orchestrates parsing, mutation and rebuild of one image.
pub struct FmmtSession<O: FmmtObserver> {
    config: FmmtConfig,
    observer: Arc<O>,
    runner: Arc<dyn ToolRunner>,
}

impl FmmtSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: FmmtConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: FmmtObserver + 'static> FmmtSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: FmmtConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            runner: Arc::new(ProcessRunner),
        }
    }

    /// Substitute the external tool runner.
    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &FmmtConfig {
        &self.config
    }

    fn workbench(&self) -> Result<Workbench> {
        let runner: Arc<dyn ToolRunner> = Arc::new(ObservableRunner {
            inner: self.runner.clone(),
            observer: self.observer.clone(),
        });
        let scratch = Scratch::new(self.config.scratch_dir.as_deref())?;
        let codecs = CodecRegistry::from_config(&self.config.codecs, runner.clone())?;
        let decompressor = Decompressor::new(runner.clone(), self.config.tools.compress.clone());
        let packager: Box<dyn Packager> = match self.config.packager {
            PackagerKind::Native => Box::new(NativePackager::new(decompressor.clone())),
            PackagerKind::Tools => Box::new(ToolPackager::new(runner.clone(), self.config.tools.clone())),
        };
        let rebaser = self
            .config
            .tools
            .rebase
            .as_ref()
            .map(|tool| Box::new(ToolRebaser::new(runner.clone(), tool.clone())) as Box<dyn CodeRebaser>);
        debug!(scratch = %scratch.path().display(), "Scratch directory ready");
        Ok(Workbench {
            scratch,
            codecs,
            decompressor,
            packager,
            rebaser,
        })
    }

    fn parse(&self, parser: &ContainerParser<'_>, data: Vec<u8>) -> Result<DeviceImage> {
        let image = parser.parse_image(data)?;
        for volume in &image.volumes {
            self.observer.on_event(&FmmtEvent::VolumeFound {
                name: volume.name.clone(),
                offset: volume.offset,
                size: volume.len(),
                level: volume.level,
            });
        }
        info!(
            volumes = image.volumes.len(),
            files = image.files.len(),
            "Image parsed"
        );
        Ok(image)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&FmmtEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn write_output(&self, output: &Path, data: &[u8]) -> Result<()> {
        std::fs::write(output, data)?;
        self.observer.on_event(&FmmtEvent::Complete {
            output: output.display().to_string(),
            size: data.len(),
        });
        Ok(())
    }

    /// Parse an image without extracting anything and describe it.
    #[instrument(skip(self))]
    pub fn view(&self, input: &Path) -> Result<ImageReport> {
        let data = std::fs::read(input)?;
        self.view_bytes(data)
    }

    pub fn view_bytes(&self, data: Vec<u8>) -> Result<ImageReport> {
        let bench = self.workbench()?;
        let parser = bench.parser().view_only(true);
        let image = self.parse(&parser, data)?;
        Ok(ImageReport::from_image(&image))
    }

    /// Write the leaf content of one file to `output`.
    #[instrument(skip(self))]
    pub fn extract(&self, input: &Path, volume: &str, file: &str, output: &Path) -> Result<()> {
        let data = std::fs::read(input)?;
        let content = self.extract_bytes(data, volume, file)?;
        self.write_output(output, &content)
    }

    pub fn extract_bytes(&self, data: Vec<u8>, volume: &str, file: &str) -> Result<Vec<u8>> {
        let bench = self.workbench()?;
        let image = self.parse(&bench.parser(), data)?;
        let volume = image.find_volume(volume)?;
        let id = image.find_file(volume, file)?;
        let path = image
            .file(id)
            .leaf_path
            .as_ref()
            .ok_or_else(|| FmmtError::not_found(format!("file {} has no leaf content", image.file(id).label())))?;
        Ok(std::fs::read(path)?)
    }

    /// Apply a mutation batch to `input` and write the result to `output`.
    ///
    /// When a target is not found, the groups completed before it are still
    /// written and the lookup error is returned. Any other failure leaves
    /// `output` untouched.
    #[instrument(skip(self, request), fields(entries = request.entries.len()))]
    pub fn apply(&self, input: &Path, request: &MutationRequest, output: &Path) -> Result<()> {
        let data = std::fs::read(input)?;
        let result = self.apply_bytes(data, request)?;
        self.write_output(output, &result.data)?;
        match result.not_found {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn apply_bytes(&self, data: Vec<u8>, request: &MutationRequest) -> Result<BatchResult> {
        if request.is_empty() {
            return Err(FmmtError::InvalidParameter("empty mutation batch".into()));
        }
        let bench = self.workbench()?;
        let parser = bench.parser();
        let mut image = self.parse(&parser, data)?;
        let groups = request.groups(&image)?;
        let rebuilder = Rebuilder::new(&parser, bench.packager.as_ref(), self.config.large_file_threshold);

        let mut applied = 0;
        for group in &groups {
            match self.apply_group(&bench, &parser, &rebuilder, &mut image, group) {
                Ok(()) => applied += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.log(
                        LogLevel::Warn,
                        format!(
                            "{}: {}; stopping batch, volumes already processed are kept",
                            image.volume(group.volume).name,
                            e
                        ),
                    );
                    return Ok(BatchResult {
                        data: image.data,
                        applied,
                        not_found: Some(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        info!(groups = applied, "Batch applied");
        Ok(BatchResult {
            data: image.data,
            applied,
            not_found: None,
        })
    }

    fn resolve(&self, image: &DeviceImage, group: &MutationGroup) -> Result<Vec<Op>> {
        let volume = group.volume;
        let mut deletes = Vec::new();
        let mut replaces = Vec::new();
        let mut adds = Vec::new();
        for mutation in &group.mutations {
            match mutation {
                Mutation::Delete { name } => deletes.push(Op::Delete {
                    file: image.find_file(volume, name)?,
                }),
                Mutation::Replace { old, file } => replaces.push(Op::Replace {
                    old: image.find_file(volume, old)?,
                    bytes: read_input(file)?,
                }),
                Mutation::Add { file } => adds.push(Op::Add { bytes: read_input(file)? }),
            }
        }
        let offset_of = |op: &Op| match op {
            Op::Delete { file } | Op::Replace { old: file, .. } => image.file(*file).offset,
            Op::Add { .. } => 0,
        };
        deletes.sort_by_key(|op| std::cmp::Reverse(offset_of(op)));
        replaces.sort_by_key(|op| std::cmp::Reverse(offset_of(op)));
        Ok(deletes.into_iter().chain(replaces).chain(adds).collect())
    }

    fn apply_group(
        &self,
        bench: &Workbench,
        parser: &ContainerParser<'_>,
        rebuilder: &Rebuilder<'_, '_>,
        image: &mut DeviceImage,
        group: &MutationGroup,
    ) -> Result<()> {
        let volume = group.volume;
        let ops = self.resolve(image, group)?;
        info!(volume = %image.volume(volume).name, operations = ops.len(), "Applying volume group");

        for op in ops {
            match op {
                Op::Delete { file } => self.delete_file(parser, image, file)?,
                Op::Replace { old, bytes } => {
                    let prepared = prepare_file(&bytes, &image.volume(volume).header)?;
                    let offset = image.file(old).offset;
                    let outcome = mutator::replace(&mut image.volumes[volume].data, offset, &prepared)?;
                    let mode = if outcome.is_in_place() {
                        ReplaceMode::InPlace
                    } else {
                        ReplaceMode::Relocated
                    };
                    image.remove_descendants(old)?;
                    image.files[old].transition(Transition::Replace(mode))?;
                    parser.refresh_volume(image, volume)?;
                    self.observer.on_event(&FmmtEvent::Mutation {
                        kind: MutationKind::Replace,
                        volume: image.volume(volume).name.clone(),
                        target: image.file(old).label(),
                        offset: outcome.offset(),
                    });
                    self.after_placement(bench, parser, image, volume, &prepared, outcome)?;
                }
                Op::Add { bytes } => {
                    let prepared = prepare_file(&bytes, &image.volume(volume).header)?;
                    let offset = mutator::add(&mut image.volumes[volume].data, &prepared)?;
                    parser.refresh_volume(image, volume)?;
                    self.observer.on_event(&FmmtEvent::Mutation {
                        kind: MutationKind::Add,
                        volume: image.volume(volume).name.clone(),
                        target: prepared.header.name.to_string(),
                        offset,
                    });
                    self.after_placement(bench, parser, image, volume, &prepared, ReplaceOutcome::InPlace { offset })?;
                }
            }
        }
        self.commit(rebuilder, image, volume)
    }

    fn delete_file(&self, parser: &ContainerParser<'_>, image: &mut DeviceImage, file: FileId) -> Result<()> {
        let volume = image.file(file).volume;
        let offset = image.file(file).offset;
        mutator::delete(&mut image.volumes[volume].data, offset)?;
        image.files[file].transition(Transition::MarkDelete)?;
        image.remove_descendants(file)?;
        image.files[file].transition(Transition::Padded)?;
        parser.refresh_volume(image, volume)?;
        self.observer.on_event(&FmmtEvent::Mutation {
            kind: MutationKind::Delete,
            volume: image.volume(volume).name.clone(),
            target: image.file(file).label(),
            offset,
        });
        Ok(())
    }

    /// Name check and rebasing of a file that just landed at `outcome`.
    fn after_placement(
        &self,
        bench: &Workbench,
        parser: &ContainerParser<'_>,
        image: &mut DeviceImage,
        volume: VolumeId,
        prepared: &PreparedFile,
        outcome: ReplaceOutcome,
    ) -> Result<()> {
        let offset = outcome.offset();
        let placed = image
            .live_files(volume)
            .find(|f| f.offset == offset)
            .map(|f| f.id)
            .ok_or_else(|| FmmtError::aborted(format!("placed file missing at 0x{:X}", offset)))?;
        if image.file(placed).ui_name.is_none() {
            self.log(
                LogLevel::Warn,
                format!(
                    "File {} has no user interface section; it can only be addressed by GUID",
                    prepared.header.name
                ),
            );
        }

        let base = match resolve_base_address(image, volume) {
            Ok(base) => base,
            Err(e) => {
                debug!(reason = %e, "Skipping rebase");
                return Ok(());
            }
        };
        let Some(rebaser) = &bench.rebaser else {
            self.log(
                LogLevel::Warn,
                format!(
                    "No rebase tool configured; file {} placed at base 0x{:X} without rebasing",
                    prepared.header.name, base
                ),
            );
            return Ok(());
        };
        let polarity = image.volume(volume).erase_polarity();
        let end = offset + prepared.len();
        let mut bytes = image.volume(volume).data[offset..end].to_vec();
        rebaser.rebase(base, &mut bytes, offset, &bench.scratch)?;
        seal_file(&mut bytes, polarity)?;
        image.volumes[volume].data[offset..end].copy_from_slice(&bytes);
        parser.refresh_volume(image, volume)
    }

    /// Carry a changed volume up to the device image.
    fn commit(&self, rebuilder: &Rebuilder<'_, '_>, image: &mut DeviceImage, volume: VolumeId) -> Result<()> {
        rebuilder.propagate(image, volume)?;
        for id in image.volume_chain(volume) {
            self.observer.on_event(&FmmtEvent::VolumeRebuilt {
                name: image.volume(id).name.clone(),
                size: image.volume(id).len(),
            });
        }
        Ok(())
    }

    /// Regenerate a volume and everything nested in it, then carry the result
    /// up to the image. Picks up a changed large file threshold or packager.
    #[instrument(skip(self))]
    pub fn rebuild(&self, input: &Path, volume: &str, output: &Path) -> Result<()> {
        let data = std::fs::read(input)?;
        let data = self.rebuild_bytes(data, volume)?;
        self.write_output(output, &data)
    }

    pub fn rebuild_bytes(&self, data: Vec<u8>, volume: &str) -> Result<Vec<u8>> {
        let bench = self.workbench()?;
        let parser = bench.parser();
        let mut image = self.parse(&parser, data)?;
        let id = image.find_volume(volume)?;
        let rebuilder = Rebuilder::new(&parser, bench.packager.as_ref(), self.config.large_file_threshold);
        rebuilder.rebuild(&mut image, id)?;
        self.commit(&rebuilder, &mut image, id)?;
        Ok(image.data)
    }

    /// Remove a whole volume. A nested volume goes away with the file that
    /// holds it; a top-level volume is erased in place.
    #[instrument(skip(self))]
    pub fn delete_volume(&self, input: &Path, volume: &str, output: &Path) -> Result<()> {
        let data = std::fs::read(input)?;
        let data = self.delete_volume_bytes(data, volume)?;
        self.write_output(output, &data)
    }

    pub fn delete_volume_bytes(&self, data: Vec<u8>, volume: &str) -> Result<Vec<u8>> {
        let bench = self.workbench()?;
        let parser = bench.parser();
        let mut image = self.parse(&parser, data)?;
        let id = image.find_volume(volume)?;
        let name = image.volume(id).name.clone();

        let holder = image.volume(id).parent_file;
        match holder {
            Some(holder) => {
                let parent = image.file(holder).volume;
                info!(volume = %name, file = %image.file(holder).label(), "Deleting nested volume with its file");
                self.delete_file(&parser, &mut image, holder)?;
                let rebuilder = Rebuilder::new(&parser, bench.packager.as_ref(), self.config.large_file_threshold);
                self.commit(&rebuilder, &mut image, parent)?;
            }
            None => {
                let (offset, slot, erase) = {
                    let v = image.volume(id);
                    (v.offset, v.slot, v.erase_byte())
                };
                info!(volume = %name, offset = %format!("0x{:X}", offset), "Erasing top-level volume");
                for file in image.volume(id).files.clone() {
                    image.remove_descendants(file)?;
                    if image.file(file).state.is_live() {
                        image.files[file].transition(Transition::Remove)?;
                    }
                }
                image.volumes[id].deleted = true;
                image.data[offset..offset + slot].fill(erase);
            }
        }
        self.observer.on_event(&FmmtEvent::Mutation {
            kind: MutationKind::DeleteVolume,
            volume: name.clone(),
            target: name,
            offset: image.volume(id).offset,
        });
        Ok(image.data)
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| FmmtError::InvalidParameter(format!("cannot read {}: {}", path.display(), e)))
}

/// Runner wrapper that reports every invocation to the observer.
struct ObservableRunner<O: FmmtObserver> {
    inner: Arc<dyn ToolRunner>,
    observer: Arc<O>,
}

impl<O: FmmtObserver> ToolRunner for ObservableRunner<O> {
    fn run(&self, program: &str, args: &[String]) -> Result<()> {
        self.observer.on_event(&FmmtEvent::ToolInvoked {
            program: program.to_string(),
            args: args.to_vec(),
        });
        self.inner.run(program, args)
    }
}
