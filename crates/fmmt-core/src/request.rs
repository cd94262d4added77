//! Mutation batches as handed over by a front end.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{FmmtError, Result};
use crate::model::{DeviceImage, VolumeId};

/// One change to one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Delete { name: String },
    Replace { old: String, file: PathBuf },
    Add { file: PathBuf },
}

impl Mutation {
    /// Application order inside a volume group.
    fn rank(&self) -> u8 {
        match self {
            Mutation::Delete { .. } => 0,
            Mutation::Replace { .. } => 1,
            Mutation::Add { .. } => 2,
        }
    }
}

/// Batch operation selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Delete,
    Add,
    Replace,
}

impl BatchKind {
    fn arity(self) -> usize {
        match self {
            BatchKind::Delete | BatchKind::Add => 2,
            BatchKind::Replace => 3,
        }
    }
}

/// Ordered list of `(volume key, mutation)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationRequest {
    pub entries: Vec<(String, Mutation)>,
}

/// Mutations of one volume, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationGroup {
    pub volume: VolumeId,
    pub mutations: Vec<Mutation>,
}

impl MutationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(mut self, volume: impl Into<String>, name: impl Into<String>) -> Self {
        self.entries.push((volume.into(), Mutation::Delete { name: name.into() }));
        self
    }

    pub fn add(mut self, volume: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        self.entries.push((volume.into(), Mutation::Add { file: file.into() }));
        self
    }

    pub fn replace(mut self, volume: impl Into<String>, old: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        self.entries.push((
            volume.into(),
            Mutation::Replace {
                old: old.into(),
                file: file.into(),
            },
        ));
        self
    }

    /// Build a batch from flat command-line operands: `(volume name)+` for
    /// deletes, `(volume path)+` for adds, `(volume old path)+` for replaces.
    pub fn from_operands(kind: BatchKind, operands: &[String]) -> Result<Self> {
        let arity = kind.arity();
        if operands.is_empty() || operands.len() % arity != 0 {
            return Err(FmmtError::InvalidParameter(format!(
                "expected groups of {} operands, got {}",
                arity,
                operands.len()
            )));
        }
        Ok(operands.chunks(arity).fold(Self::new(), |req, chunk| match kind {
            BatchKind::Delete => req.delete(&chunk[0], &chunk[1]),
            BatchKind::Add => req.add(&chunk[0], &chunk[1]),
            BatchKind::Replace => req.replace(&chunk[0], &chunk[1], &chunk[2]),
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve volume keys and coalesce the batch per volume, highest volume
    /// id first. Inside a group, deletes come before replaces and adds, each
    /// kind keeping request order.
    pub fn groups(&self, image: &DeviceImage) -> Result<Vec<MutationGroup>> {
        let mut by_volume: BTreeMap<VolumeId, Vec<Mutation>> = BTreeMap::new();
        for (key, mutation) in &self.entries {
            let volume = image.find_volume(key)?;
            by_volume.entry(volume).or_default().push(mutation.clone());
        }
        Ok(by_volume
            .into_iter()
            .rev()
            .map(|(volume, mut mutations)| {
                mutations.sort_by_key(Mutation::rank);
                MutationGroup { volume, mutations }
            })
            .collect())
    }
}
