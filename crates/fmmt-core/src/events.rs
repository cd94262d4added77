//! Event system for front-end decoupling.
//!
//! Lets the CLI (or any other front end) follow volume discovery, mutations
//! and rebuilds without coupling to the engine internals.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Mutation kinds reported through [`FmmtEvent::Mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Replace,
    Delete,
    DeleteVolume,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Add => write!(f, "Add"),
            MutationKind::Replace => write!(f, "Replace"),
            MutationKind::Delete => write!(f, "Delete"),
            MutationKind::DeleteVolume => write!(f, "Delete Volume"),
        }
    }
}

/// Events emitted by a session.
#[derive(Debug, Clone)]
pub enum FmmtEvent {
    /// A volume was discovered while scanning or parsing.
    VolumeFound {
        name: String,
        offset: usize,
        size: usize,
        level: usize,
    },
    /// A mutation was applied to a volume's bytes.
    Mutation {
        kind: MutationKind,
        volume: String,
        target: String,
        offset: usize,
    },
    /// A volume was regenerated from its manifest.
    VolumeRebuilt { name: String, size: usize },
    /// An external tool is about to run.
    ToolInvoked { program: String, args: Vec<String> },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Output image written.
    Complete { output: String, size: usize },
}

/// Observer trait for receiving session events.
pub trait FmmtObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FmmtEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FmmtObserver for NullObserver {
    fn on_event(&self, _event: &FmmtEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FmmtObserver for TracingObserver {
    fn on_event(&self, event: &FmmtEvent) {
        match event {
            FmmtEvent::VolumeFound {
                name,
                offset,
                size,
                level,
            } => {
                tracing::debug!(
                    volume = %name,
                    offset = %format!("0x{:X}", offset),
                    size = %format!("0x{:X}", size),
                    level = level,
                    "Volume found"
                );
            }
            FmmtEvent::Mutation {
                kind,
                volume,
                target,
                offset,
            } => {
                tracing::info!(
                    kind = %kind,
                    volume = %volume,
                    target = %target,
                    offset = %format!("0x{:X}", offset),
                    "Mutation applied"
                );
            }
            FmmtEvent::VolumeRebuilt { name, size } => {
                tracing::info!(volume = %name, size = %format!("0x{:X}", size), "Volume rebuilt");
            }
            FmmtEvent::ToolInvoked { program, args } => {
                tracing::debug!(program = %program, args = ?args, "Running tool");
            }
            FmmtEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FmmtEvent::Complete { output, size } => {
                tracing::info!(output = %output, size = size, "Image written");
            }
        }
    }
}
