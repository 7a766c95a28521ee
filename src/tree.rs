//! The two trees grown during a session: the execution prefix tree over
//! interpreted locations, and the physical ancestry tree of engine forks.
//!
//! Both are arena-stored and addressed by ids; parent links are plain ids, so
//! no ownership cycles exist. Both live for exactly one session.

use core::fmt;

use hashbrown::HashMap;

use crate::cfg::{HighLevelCfg, InstrId};

/// Index of a [`HighLevelTreeNode`] inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TreeNodeId(pub usize);

impl fmt::Display for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of a [`ForkPoint`] inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ForkPointId(pub usize);

impl fmt::Display for ForkPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// One node of the execution prefix tree: a distinct (parent, next location)
/// pair some instance actually traversed.
#[derive(Debug)]
pub struct HighLevelTreeNode {
    instruction: InstrId,
    parent: Option<TreeNodeId>,
    children: HashMap<InstrId, TreeNodeId>,
    path_counter: u64,
    fork_counter: u64,
}

impl HighLevelTreeNode {
    /// The CFG instruction this node sits at.
    #[must_use]
    pub fn instruction(&self) -> InstrId {
        self.instruction
    }

    /// The parent node, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<TreeNodeId> {
        self.parent
    }

    /// Children keyed by the CFG instruction they descend to.
    #[must_use]
    pub fn children(&self) -> &HashMap<InstrId, TreeNodeId> {
        &self.children
    }

    /// How many instance arrivals landed on this node.
    #[must_use]
    pub fn path_counter(&self) -> u64 {
        self.path_counter
    }

    /// How many fork events happened while an instance sat on this node.
    #[must_use]
    pub fn fork_counter(&self) -> u64 {
        self.fork_counter
    }
}

/// Prefix tree of every interpreted path taken by any instance during one
/// session.
#[derive(Debug)]
pub struct ExecutionTree {
    nodes: Vec<HighLevelTreeNode>,
    root: TreeNodeId,
}

impl ExecutionTree {
    /// A tree holding only a root at the given instruction.
    #[must_use]
    pub fn new(root_instruction: InstrId) -> Self {
        Self {
            nodes: vec![HighLevelTreeNode {
                instruction: root_instruction,
                parent: None,
                children: HashMap::new(),
                path_counter: 0,
                fork_counter: 0,
            }],
            root: TreeNodeId(0),
        }
    }

    /// The root node id.
    #[must_use]
    pub fn root(&self) -> TreeNodeId {
        self.root
    }

    /// Number of nodes in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds only the root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// The node stored under `id`.
    #[must_use]
    pub fn node(&self, id: TreeNodeId) -> &HighLevelTreeNode {
        &self.nodes[id.0]
    }

    /// Every node with its id.
    pub fn iter(&self) -> impl Iterator<Item = (TreeNodeId, &HighLevelTreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (TreeNodeId(i), node))
    }

    /// Resolve the child of `parent` at `instruction`, creating it if this is
    /// the first traversal. The instruction's high-level path count moves
    /// only on creation. Returns the child and whether it was created.
    pub fn get_or_create_successor(
        &mut self,
        parent: TreeNodeId,
        instruction: InstrId,
        cfg: &mut HighLevelCfg,
    ) -> (TreeNodeId, bool) {
        if let Some(child) = self.nodes[parent.0].children.get(&instruction) {
            return (*child, false);
        }
        let child = TreeNodeId(self.nodes.len());
        self.nodes.push(HighLevelTreeNode {
            instruction,
            parent: Some(parent),
            children: HashMap::new(),
            path_counter: 0,
            fork_counter: 0,
        });
        self.nodes[parent.0].children.insert(instruction, child);
        cfg.bump_high_level_paths(instruction);
        (child, true)
    }

    /// Count one instance arrival on the node and on its CFG instruction.
    pub fn bump_path_counter(&mut self, id: TreeNodeId, cfg: &mut HighLevelCfg) {
        let node = &mut self.nodes[id.0];
        node.path_counter += 1;
        cfg.bump_low_level_paths(node.instruction);
    }

    /// Count one fork event on the node and on its CFG instruction.
    pub fn bump_fork_counter(&mut self, id: TreeNodeId, cfg: &mut HighLevelCfg) {
        let node = &mut self.nodes[id.0];
        node.fork_counter += 1;
        cfg.bump_forks(node.instruction);
    }

    /// Steps from `id` up to `ancestor`, `None` if `ancestor` is not on the
    /// parent chain.
    #[must_use]
    pub fn distance_to_ancestor(&self, id: TreeNodeId, ancestor: TreeNodeId) -> Option<usize> {
        let mut steps = 0;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return Some(steps);
            }
            steps += 1;
            cursor = self.nodes[current.0].parent;
        }
        None
    }
}

/// One physical fork event: where the engine split an instance, independent
/// of the interpreted location.
#[derive(Debug)]
pub struct ForkPoint {
    parent: Option<ForkPointId>,
    children: HashMap<u32, ForkPointId>,
    branches: u32,
    program_counter: u64,
    tree_node: Option<TreeNodeId>,
}

impl ForkPoint {
    /// The fork point this one descended from, `None` for the session root.
    #[must_use]
    pub fn parent(&self) -> Option<ForkPointId> {
        self.parent
    }

    /// Child fork points, keyed by the branch ordinal that led to them
    /// (0 is the continuing instance, 1.. the forked children).
    #[must_use]
    pub fn children(&self) -> &HashMap<u32, ForkPointId> {
        &self.children
    }

    /// Number of branches the fork produced, the continuing instance
    /// included.
    #[must_use]
    pub fn branches(&self) -> u32 {
        self.branches
    }

    /// Low-level program counter at fork time.
    #[must_use]
    pub fn program_counter(&self) -> u64 {
        self.program_counter
    }

    /// Execution-tree node the forking instance sat on, if tracing had
    /// already positioned it.
    #[must_use]
    pub fn tree_node(&self) -> Option<TreeNodeId> {
        self.tree_node
    }
}

/// Ancestry tree of all fork events of one session.
#[derive(Debug)]
pub struct ForkTree {
    nodes: Vec<ForkPoint>,
    root: ForkPointId,
}

impl ForkTree {
    /// A tree holding only the session-start root.
    #[must_use]
    pub fn new(program_counter: u64, tree_node: Option<TreeNodeId>) -> Self {
        Self {
            nodes: vec![ForkPoint {
                parent: None,
                children: HashMap::new(),
                branches: 1,
                program_counter,
                tree_node,
            }],
            root: ForkPointId(0),
        }
    }

    /// The root fork point id.
    #[must_use]
    pub fn root(&self) -> ForkPointId {
        self.root
    }

    /// Number of fork points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds only the root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// The fork point stored under `id`.
    #[must_use]
    pub fn node(&self, id: ForkPointId) -> &ForkPoint {
        &self.nodes[id.0]
    }

    /// Record a fork event under `parent`, reached through its `branch`
    /// ordinal, splitting into `branches` ways at `program_counter`.
    pub fn add_child(
        &mut self,
        parent: ForkPointId,
        branch: u32,
        branches: u32,
        program_counter: u64,
        tree_node: Option<TreeNodeId>,
    ) -> ForkPointId {
        let id = ForkPointId(self.nodes.len());
        self.nodes.push(ForkPoint {
            parent: Some(parent),
            children: HashMap::new(),
            branches,
            program_counter,
            tree_node,
        });
        self.nodes[parent.0].children.insert(branch, id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionTree;
    use crate::cfg::{HighLevelCfg, HighLevelPc};

    #[test]
    fn successor_creation_counts_high_level_paths_once() {
        let mut cfg = HighLevelCfg::new();
        let a = cfg.record_edge(cfg.entry(), &HighLevelPc::new(&[1]), 3);
        let mut tree = ExecutionTree::new(cfg.entry());

        let (child, created) = tree.get_or_create_successor(tree.root(), a, &mut cfg);
        assert!(created);
        assert_eq!(cfg.instruction(a).high_level_paths(), 1);

        let (again, created) = tree.get_or_create_successor(tree.root(), a, &mut cfg);
        assert!(!created);
        assert_eq!(again, child);
        assert_eq!(cfg.instruction(a).high_level_paths(), 1);
    }

    #[test]
    fn counters_move_in_lockstep_with_the_cfg() {
        let mut cfg = HighLevelCfg::new();
        let a = cfg.record_edge(cfg.entry(), &HighLevelPc::new(&[1]), 3);
        let mut tree = ExecutionTree::new(cfg.entry());
        let (child, _) = tree.get_or_create_successor(tree.root(), a, &mut cfg);

        tree.bump_path_counter(child, &mut cfg);
        tree.bump_path_counter(child, &mut cfg);
        tree.bump_fork_counter(child, &mut cfg);

        assert_eq!(tree.node(child).path_counter(), 2);
        assert_eq!(tree.node(child).fork_counter(), 1);
        assert_eq!(cfg.instruction(a).low_level_paths(), 2);
        assert_eq!(cfg.instruction(a).forks(), 1);
    }

    #[test]
    fn ancestor_distance_follows_parent_links() {
        let mut cfg = HighLevelCfg::new();
        let a = cfg.record_edge(cfg.entry(), &HighLevelPc::new(&[1]), 3);
        let b = cfg.record_edge(a, &HighLevelPc::new(&[1, 2]), 3);
        let mut tree = ExecutionTree::new(cfg.entry());
        let (n1, _) = tree.get_or_create_successor(tree.root(), a, &mut cfg);
        let (n2, _) = tree.get_or_create_successor(n1, b, &mut cfg);

        assert_eq!(tree.distance_to_ancestor(n2, tree.root()), Some(2));
        assert_eq!(tree.distance_to_ancestor(n2, n1), Some(1));
        assert_eq!(tree.distance_to_ancestor(n2, n2), Some(0));
        assert_eq!(tree.distance_to_ancestor(tree.root(), n2), None);
    }
}
