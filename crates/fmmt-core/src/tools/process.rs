//! Tool runner backed by `std::process::Command`.

use std::process::Command;

use tracing::{debug, trace};

use super::traits::ToolRunner;
use crate::error::{FmmtError, Result};

/// Runs tools as child processes, resolving bare names through `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<()> {
        debug!(program = %program, args = ?args, "Spawning tool");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| FmmtError::ToolFailure {
                tool: program.to_string(),
                message: format!("cannot start: {}", e),
            })?;

        if !output.stdout.is_empty() {
            trace!(program = %program, "{}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FmmtError::ToolFailure {
                tool: program.to_string(),
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}
