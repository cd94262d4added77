//! Per-file lifecycle tracking for entries of the file attribute table.

use std::fmt;

use crate::error::{FmmtError, Result};

/// How a replacement landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// New file overwrote the old span.
    InPlace,
    /// New file went elsewhere; the old span became a pad.
    Relocated,
}

/// Lifecycle state of one file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileState {
    #[default]
    Live,
    /// Marked for deletion, bytes not rewritten yet.
    PendingDelete,
    /// Span converted into a pad file.
    Pad,
    Replaced(ReplaceMode),
    /// Logically removed without a pad of its own: descendants of a deleted
    /// child volume, or records that vanished from the directory.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkDelete,
    Padded,
    Replace(ReplaceMode),
    Remove,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileState::Live => write!(f, "LIVE"),
            FileState::PendingDelete => write!(f, "PENDING_DELETE"),
            FileState::Pad => write!(f, "PAD"),
            FileState::Replaced(ReplaceMode::InPlace) => write!(f, "REPLACED_IN_PLACE"),
            FileState::Replaced(ReplaceMode::Relocated) => write!(f, "REPLACED_RELOCATED"),
            FileState::Deleted => write!(f, "DELETED"),
        }
    }
}

impl FileState {
    pub fn is_live(&self) -> bool {
        matches!(self, FileState::Live)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Pad | FileState::Replaced(_) | FileState::Deleted
        )
    }

    /// Apply a transition, rejecting moves out of terminal states.
    pub fn apply(self, transition: Transition) -> Result<FileState> {
        let next = match (self, transition) {
            (FileState::Live, Transition::MarkDelete) => FileState::PendingDelete,
            (FileState::PendingDelete, Transition::Padded) => FileState::Pad,
            (FileState::Live, Transition::Replace(mode)) => FileState::Replaced(mode),
            (FileState::Live | FileState::PendingDelete, Transition::Remove) => FileState::Deleted,
            (from, t) => {
                return Err(FmmtError::aborted(format!(
                    "illegal file state transition {:?} from {}",
                    t, from
                )));
            }
        };
        Ok(next)
    }
}
