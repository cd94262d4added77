//! External tool invocation abstraction.
//!
//! Defines the `ToolRunner` trait so codec, packaging and rebasing tools can
//! be run as real processes or substituted in tests.

use crate::error::Result;

/// Abstract process runner.
///
/// Implementations block until the tool exits. A tool that cannot be started
/// or exits unsuccessfully is reported as `FmmtError::ToolFailure`.
pub trait ToolRunner: Send + Sync {
    /// Run `program` with `args`.
    fn run(&self, program: &str, args: &[String]) -> Result<()>;
}
