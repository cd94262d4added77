//! Rebasing of relocatable code inside files placed at a known address.

use std::sync::Arc;

use tracing::debug;

use crate::error::{FmmtError, Result};
use crate::tools::{Scratch, ToolRunner, run_with_files};

/// Rewrites the code images of a firmware file for the address it now sits
/// at. The file keeps its size.
pub trait CodeRebaser {
    /// `base_address` is the load address of the volume and `offset` the
    /// file's position inside it.
    fn rebase(&self, base_address: u64, file: &mut Vec<u8>, offset: usize, scratch: &Scratch) -> Result<()>;
}

/// Rebaser backed by an external tool run as `<tool> --rebase <addr> -o <out> <in>`.
pub struct ToolRebaser {
    runner: Arc<dyn ToolRunner>,
    tool: String,
}

impl ToolRebaser {
    pub fn new(runner: Arc<dyn ToolRunner>, tool: impl Into<String>) -> Self {
        Self {
            runner,
            tool: tool.into(),
        }
    }
}

impl CodeRebaser for ToolRebaser {
    fn rebase(&self, base_address: u64, file: &mut Vec<u8>, offset: usize, scratch: &Scratch) -> Result<()> {
        let address = base_address + offset as u64;
        debug!(tool = %self.tool, address = %format!("0x{:X}", address), "Rebasing file");
        let flags = vec!["--rebase".to_string(), format!("0x{:X}", address)];
        let out = run_with_files(self.runner.as_ref(), scratch, &self.tool, &flags, file)?;
        if out.len() != file.len() {
            return Err(FmmtError::aborted(format!(
                "rebase changed the file size from 0x{:X} to 0x{:X}",
                file.len(),
                out.len()
            )));
        }
        *file = out;
        Ok(())
    }
}
