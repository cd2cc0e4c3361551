//! Storage tree
//!
//! In-memory tree of snapshot nodes for one root, built from persisted
//! storages plus unconsumed create-kind journal entries layered on top.
//! Callers therefore observe the *prospective* tree, including nodes that
//! are currently being created.
//!
//! Nodes live in an arena: parents and children are index fields, traversal
//! helpers return indices. The tree is immutable after construction and
//! holds owned record copies, never references into the catalog.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use snaptree_core::{Error, JournalPayload, JournalRecord, Result, StorageIdent, StorageRecord};

/// Index of a node within the tree arena.
pub type NodeIndex = usize;

/// Node payload: a persisted storage row, or a pending node that exists
/// only as an unconsumed journal entry (not yet openable on disk).
#[derive(Debug, Clone)]
enum TreeEntry {
    Persisted(StorageRecord),
    Pending { ident: StorageIdent },
}

#[derive(Debug, Clone)]
struct TreeNode {
    entry: TreeEntry,
    parent: Option<NodeIndex>,
    children: SmallVec<[NodeIndex; 4]>,
}

/// Prospective storage tree for one root.
#[derive(Debug, Clone, Default)]
pub struct StorageTree {
    nodes: Vec<TreeNode>,
    index: FxHashMap<StorageIdent, NodeIndex>,
    root: Option<NodeIndex>,
}

impl StorageTree {
    /// Build the tree from persisted rows plus unconsumed create journals.
    ///
    /// Rows link through `parent_ident`; exactly one parentless row may
    /// exist. Journals are applied in append order with one layout rule per
    /// kind:
    /// - `NormalCreate` attaches a pending node under its declared parent
    ///   (or as the root of an empty tree);
    /// - `CreateFromQcow` inserts the pending node *between* the source and
    ///   its former children;
    /// - `CreateFromCdp` does the same under the last source of the run.
    pub fn build(storages: Vec<StorageRecord>, journals: &[JournalRecord]) -> Result<Self> {
        let mut tree = StorageTree::default();
        for record in storages {
            tree.push(TreeEntry::Persisted(record))?;
        }

        // second pass: resolve parent links now that every row has an index
        for idx in 0..tree.nodes.len() {
            let parent_ident = match &tree.nodes[idx].entry {
                TreeEntry::Persisted(record) => record.parent_ident,
                TreeEntry::Pending { .. } => unreachable!("journals not applied yet"),
            };
            match parent_ident {
                Some(parent) => {
                    let parent_idx = *tree.index.get(&parent).ok_or_else(|| {
                        Error::internal(format!(
                            "storage {} links to unknown parent {parent}",
                            tree.ident(idx)
                        ))
                    })?;
                    tree.link(parent_idx, idx);
                }
                None => tree.set_root(idx)?,
            }
        }

        for journal in journals.iter().filter(|j| j.payload.is_create_kind()) {
            tree.apply_journal(journal)?;
        }
        Ok(tree)
    }

    fn push(&mut self, entry: TreeEntry) -> Result<NodeIndex> {
        let ident = match &entry {
            TreeEntry::Persisted(record) => record.ident,
            TreeEntry::Pending { ident } => *ident,
        };
        if self.index.contains_key(&ident) {
            return Err(Error::internal(format!("tree already contains {ident}")));
        }
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            entry,
            parent: None,
            children: SmallVec::new(),
        });
        self.index.insert(ident, idx);
        Ok(idx)
    }

    fn link(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    fn set_root(&mut self, idx: NodeIndex) -> Result<()> {
        if self.root.is_some() {
            return Err(Error::internal(format!(
                "tree has more than one parentless node ({})",
                self.ident(idx)
            )));
        }
        self.root = Some(idx);
        Ok(())
    }

    fn apply_journal(&mut self, journal: &JournalRecord) -> Result<()> {
        match &journal.payload {
            JournalPayload::NormalCreate {
                new_ident,
                parent_ident,
                ..
            } => {
                let idx = self.push(TreeEntry::Pending { ident: *new_ident })?;
                match parent_ident {
                    Some(parent) => {
                        let parent_idx = *self.index.get(parent).ok_or_else(|| {
                            Error::internal(format!(
                                "journal {} declares unknown parent {parent}",
                                journal.token
                            ))
                        })?;
                        self.link(parent_idx, idx);
                    }
                    None => self.set_root(idx)?,
                }
            }
            JournalPayload::CreateFromQcow {
                new_ident,
                source_ident,
            } => self.insert_below(journal, *new_ident, *source_ident)?,
            JournalPayload::CreateFromCdp {
                new_ident,
                source_idents,
            } => {
                let last = source_idents.last().ok_or_else(|| {
                    Error::internal(format!("journal {} has no sources", journal.token))
                })?;
                self.insert_below(journal, *new_ident, *last)?;
            }
            JournalPayload::Destroy { .. } => {}
        }
        Ok(())
    }

    /// Insert a pending node between `source` and its former children.
    fn insert_below(
        &mut self,
        journal: &JournalRecord,
        new_ident: StorageIdent,
        source_ident: StorageIdent,
    ) -> Result<()> {
        let source = *self.index.get(&source_ident).ok_or_else(|| {
            Error::internal(format!(
                "journal {} sources unknown storage {source_ident}",
                journal.token
            ))
        })?;
        let idx = self.push(TreeEntry::Pending { ident: new_ident })?;
        let orphans = std::mem::take(&mut self.nodes[source].children);
        for child in &orphans {
            self.nodes[*child].parent = Some(idx);
        }
        self.nodes[idx].children = orphans;
        self.link(source, idx);
        Ok(())
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Index of the root node, if any.
    pub fn root(&self) -> Option<NodeIndex> {
        self.root
    }

    /// Number of nodes, pending included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Index of the node carrying the ident.
    pub fn get(&self, ident: StorageIdent) -> Option<NodeIndex> {
        self.index.get(&ident).copied()
    }

    /// The node's ident.
    pub fn ident(&self, idx: NodeIndex) -> StorageIdent {
        match &self.nodes[idx].entry {
            TreeEntry::Persisted(record) => record.ident,
            TreeEntry::Pending { ident } => *ident,
        }
    }

    /// The node's persisted record; `None` for pending nodes.
    pub fn storage(&self, idx: NodeIndex) -> Option<&StorageRecord> {
        match &self.nodes[idx].entry {
            TreeEntry::Persisted(record) => Some(record),
            TreeEntry::Pending { .. } => None,
        }
    }

    /// Whether the node exists only as a journal entry.
    pub fn is_pending(&self, idx: NodeIndex) -> bool {
        matches!(self.nodes[idx].entry, TreeEntry::Pending { .. })
    }

    /// The node's parent index.
    pub fn parent(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.nodes[idx].parent
    }

    /// The node's children, in attach order.
    pub fn children(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.nodes[idx].children
    }

    /// Whether the node has no children.
    pub fn is_leaf(&self, idx: NodeIndex) -> bool {
        self.nodes[idx].children.is_empty()
    }

    /// Whether the node is the tree root.
    pub fn is_root(&self, idx: NodeIndex) -> bool {
        self.root == Some(idx)
    }

    /// Persisted records of the node's children (pending children omitted).
    pub fn children_storages(&self, idx: NodeIndex) -> Vec<StorageRecord> {
        self.nodes[idx]
            .children
            .iter()
            .filter_map(|c| self.storage(*c).cloned())
            .collect()
    }

    /// Whether any child of the node is pending.
    pub fn has_pending_child(&self, idx: NodeIndex) -> bool {
        self.nodes[idx].children.iter().any(|c| self.is_pending(*c))
    }

    /// All leaves, in depth-first (insertion) order.
    pub fn leaves(&self) -> Vec<NodeIndex> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        let mut leaves = Vec::new();
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            if self.nodes[idx].children.is_empty() {
                leaves.push(idx);
            } else {
                // reversed push keeps insertion order on pop
                stack.extend(self.nodes[idx].children.iter().rev());
            }
        }
        leaves
    }

    /// All nodes, root to leaves, in level order.
    pub fn bfs(&self) -> Vec<NodeIndex> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = std::collections::VecDeque::from([root]);
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            queue.extend(self.nodes[idx].children.iter());
        }
        order
    }

    /// Iterate the node, then its ancestors up to the root.
    pub fn dfs_to_root(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        let mut current = Some(idx);
        std::iter::from_fn(move || {
            let idx = current?;
            current = self.nodes[idx].parent;
            Some(idx)
        })
    }

    /// Persisted records from the root down to the node, pending nodes
    /// skipped. This is the full storage list a chain is built from.
    pub fn real_chain_to_root(&self, idx: NodeIndex) -> Vec<StorageRecord> {
        let mut chain: Vec<StorageRecord> = self
            .dfs_to_root(idx)
            .filter_map(|n| self.storage(n).cloned())
            .collect();
        chain.reverse();
        chain
    }
}
