//! Encapsulation tree: how volumes, files and wrapping sections nest.
//!
//! Nodes live in an arena and refer to each other by index. The tree is built
//! once per parse; nodes are never freed individually. A node's `children`
//! are its direct encapsulations in on-disk order, and [`EncapsulationTree::bottom_up`]
//! yields the order in which the rebuilder has to regenerate them.

use uuid::Uuid;

use crate::model::{FileId, VolumeId};

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Volume {
        volume: VolumeId,
    },
    File {
        file: FileId,
    },
    VendorEncodedSection {
        guid: Uuid,
        attributes: u16,
        /// Definition-specific header bytes between the GUID header and the data.
        extra_header: Vec<u8>,
        header: Vec<u8>,
    },
    CompressedSection {
        compression_type: u8,
        header: Vec<u8>,
    },
    NestedVolumeSection {
        header: Vec<u8>,
    },
}

/// One entry of a section stream owned by a file or an encapsulation section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionSlot {
    /// Section copied verbatim.
    Raw(Vec<u8>),
    /// Regenerated from the owning file's captured display name.
    UserInterface,
    /// Regenerated from the owning file's captured dependency expression.
    Depex,
    /// Encapsulating section, regenerated from the referenced node.
    Node(NodeId),
}

#[derive(Debug, Clone)]
pub struct EncapNode {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub depth: usize,
    /// Section stream for file, compressed and vendor-encoded nodes.
    pub sections: Vec<SectionSlot>,
}

#[derive(Debug, Clone, Default)]
pub struct EncapsulationTree {
    nodes: Vec<EncapNode>,
}

impl EncapsulationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node under `parent` (or as a root).
    pub fn add(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        let depth = parent.map(|p| self.nodes[p].depth + 1).unwrap_or(0);
        self.nodes.push(EncapNode {
            kind,
            parent,
            children: Vec::new(),
            depth,
            sections: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }
        id
    }

    pub fn node(&self, id: NodeId) -> &EncapNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut EncapNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replace the child list of `id`, reparenting the given nodes.
    pub fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        for &child in &children {
            self.nodes[child].parent = Some(id);
        }
        self.nodes[id].children = children;
    }

    /// Post-order walk from `root`: every node appears after all of its
    /// descendants, siblings in on-disk order.
    pub fn bottom_up(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            for &child in self.nodes[id].children.iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Volumes under `root` (inclusive), innermost first.
    pub fn volumes_bottom_up(&self, root: NodeId) -> Vec<VolumeId> {
        self.bottom_up(root)
            .into_iter()
            .filter_map(|id| match self.nodes[id].kind {
                NodeKind::Volume { volume } => Some(volume),
                _ => None,
            })
            .collect()
    }
}
