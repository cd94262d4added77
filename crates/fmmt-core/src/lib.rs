//! FMMT-Core: firmware volume and firmware file system manipulation.
//!
//! This crate parses PI firmware volumes out of a flat device image, edits the
//! files inside them (add, replace, delete), re-encapsulates every enclosing
//! section, file and volume, and splices the result back into the image.
//!
//! # Architecture
//!
//! - **Format**: volume, file and section header codecs
//! - **Scanner / Parser**: volume discovery and the recursive container walk
//!   producing the file table and the encapsulation tree
//! - **Space / Mutator**: pad and free-space management, single-file edits
//! - **Packager / Rebuilder**: bottom-up regeneration and splicing
//! - **Address / Rebase**: load address of a volume and code rebasing
//! - **Tools**: external process capability (real, mock) and scratch space
//! - **Events**: observer pattern for front-end decoupling
//! - **Session**: high-level orchestrator driven by a [`MutationRequest`]
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use fmmt_core::{FmmtConfig, FmmtSession, MutationRequest};
//!
//! let session = FmmtSession::new(FmmtConfig::default());
//! let request = MutationRequest::new().delete("FV0", "Shell");
//! session
//!     .apply(Path::new("bios.bin"), &request, Path::new("bios.new.bin"))
//!     .expect("mutation failed");
//! ```

pub mod address;
pub mod codec;
pub mod encap;
pub mod error;
pub mod events;
pub mod format;
pub mod model;
pub mod mutator;
pub mod packager;
pub mod parser;
pub mod rebase;
pub mod rebuild;
pub mod request;
pub mod scanner;
pub mod session;
pub mod space;
pub mod state;
pub mod tools;
pub mod view;

#[cfg(test)]
mod testutil;

// Re-exports for convenience
pub use address::resolve_base_address;
pub use codec::{CodecConfig, CodecRegistry, Decompressor};
pub use encap::{EncapsulationTree, NodeKind};
pub use error::{ErrorKind, FmmtError, Result};
pub use events::{FmmtEvent, FmmtObserver, LogLevel, MutationKind, NullObserver, TracingObserver};
pub use model::{DeviceImage, FileAttributes, FileId, FlatEntry, Volume, VolumeId};
pub use packager::{NativePackager, Packager, ToolPackager};
pub use parser::ContainerParser;
pub use rebuild::Rebuilder;
pub use request::{BatchKind, Mutation, MutationRequest};
pub use session::{BatchResult, FmmtConfig, FmmtSession, PackagerKind, ToolPaths};
pub use state::{FileState, ReplaceMode};
pub use tools::{MockRunner, ProcessRunner, ToolRunner};
pub use view::ImageReport;
