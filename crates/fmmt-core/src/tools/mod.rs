//! External tool layer: runners and the scratch directory they work in.

pub mod mock;
pub mod process;
pub mod traits;

pub use mock::{Invocation, MockRunner};
pub use process::ProcessRunner;
pub use traits::ToolRunner;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

use crate::error::{FmmtError, Result};

/// Session-private temp directory. Removed when dropped, on success and
/// failure paths alike.
pub struct Scratch {
    dir: TempDir,
    counter: AtomicUsize,
}

impl Scratch {
    pub fn new(parent: Option<&Path>) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("fmmt-");
            b
        };
        let dir = match parent {
            Some(p) => builder.tempdir_in(p)?,
            None => builder.tempdir()?,
        };
        Ok(Self {
            dir,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A fresh, not yet existing path inside the scratch directory.
    pub fn unique_path(&self, stem: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("{:04}_{}", n, stem))
    }

    pub fn write(&self, stem: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.unique_path(stem);
        std::fs::write(&path, data)?;
        Ok(path)
    }
}

/// Run a tool following the `<flags> -o <out> <in>` convention on a temp-file
/// round trip and return what it wrote.
pub fn run_with_files(
    runner: &dyn ToolRunner,
    scratch: &Scratch,
    program: &str,
    flags: &[String],
    input: &[u8],
) -> Result<Vec<u8>> {
    let input_path = scratch.write("in.bin", input)?;
    let output_path = scratch.unique_path("out.bin");
    let mut args = flags.to_vec();
    args.push("-o".into());
    args.push(output_path.display().to_string());
    args.push(input_path.display().to_string());

    runner.run(program, &args)?;
    std::fs::read(&output_path).map_err(|e| FmmtError::ToolFailure {
        tool: program.to_string(),
        message: format!("no output produced: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_is_removed_on_drop() {
        let scratch = Scratch::new(None).unwrap();
        let path = scratch.write("x.bin", b"abc").unwrap();
        let root = scratch.path().to_path_buf();
        assert!(path.starts_with(&root));
        assert_ne!(scratch.unique_path("x.bin"), path);
        drop(scratch);
        assert!(!root.exists());
    }

    #[test]
    fn test_run_with_files() {
        let scratch = Scratch::new(None).unwrap();
        let mock = MockRunner::new();
        mock.on_transform("Upper", |_, data| data.to_ascii_uppercase());
        let out = run_with_files(&mock, &scratch, "Upper", &["-e".into()], b"abc").unwrap();
        assert_eq!(out, b"ABC");
        let call = &mock.invocations()[0];
        assert_eq!(call.args[0], "-e");
        assert_eq!(call.args[1], "-o");
    }

    #[test]
    fn test_missing_output_is_tool_failure() {
        let scratch = Scratch::new(None).unwrap();
        let mock = MockRunner::new();
        mock.on("Silent", |_| Ok(()));
        let err = run_with_files(&mock, &scratch, "Silent", &[], b"abc").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ToolFailure);
    }
}
