//! Mock tool runner for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::ToolRunner;
use crate::error::{FmmtError, Result};

type Handler = Box<dyn Fn(&[String]) -> Result<()> + Send + Sync>;

/// One recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Mock runner: records every call and dispatches to per-program handlers.
pub struct MockRunner {
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    /// Captured invocations.
    log: Arc<Mutex<Vec<Invocation>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Install a raw handler for `program`.
    pub fn on<F>(&self, program: &str, handler: F)
    where
        F: Fn(&[String]) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(program.to_string(), Box::new(handler));
    }

    /// Install a handler for tools following the `<flags> -o <out> <in>`
    /// convention: `f` maps the input bytes to the output bytes.
    pub fn on_transform<F>(&self, program: &str, f: F)
    where
        F: Fn(&[String], &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let name = program.to_string();
        self.on(program, move |args| {
            let output = output_arg(args).ok_or_else(|| FmmtError::ToolFailure {
                tool: name.clone(),
                message: "missing -o".into(),
            })?;
            let input = args.last().ok_or_else(|| FmmtError::ToolFailure {
                tool: name.clone(),
                message: "missing input".into(),
            })?;
            let data = std::fs::read(input)?;
            std::fs::write(output, f(args, &data))?;
            Ok(())
        });
    }

    /// Make `program` exit unsuccessfully.
    pub fn fail(&self, program: &str) {
        let name = program.to_string();
        self.on(program, move |_| {
            Err(FmmtError::ToolFailure {
                tool: name.clone(),
                message: "exit status: 1".into(),
            })
        });
    }

    /// Get all captured invocations.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().unwrap().clone()
    }

    /// Captured invocations of one program.
    pub fn calls(&self, program: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.program == program)
            .count()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRunner for MockRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<()> {
        self.log.lock().unwrap().push(Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        });
        let handlers = self.handlers.lock().unwrap();
        match handlers.get(program) {
            Some(handler) => handler(args),
            None => Err(FmmtError::ToolFailure {
                tool: program.to_string(),
                message: "no mock behaviour installed".into(),
            }),
        }
    }
}

/// Value following `-o` in an argument list.
pub fn output_arg(args: &[String]) -> Option<&String> {
    args.iter()
        .position(|a| a == "-o")
        .and_then(|i| args.get(i + 1))
}
