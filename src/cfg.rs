//! Control flow graph over interpreted-program locations, grown one observed
//! edge at a time.
//!
//! Locations are keyed structurally by the interpreted call stack, so engine
//! instances that reach the same interpreted state collapse onto one node no
//! matter which low-level path brought them there. Analysis (basic blocks,
//! dominators, branch-opcode classification, distance to uncovered branches)
//! reruns only when the graph actually changed since the last run.

use core::fmt;
use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

/// Share of branch occurrences the ranked opcode subset must cover.
/// Filters incidental opcodes that only rarely terminate a multi-way block.
const BRANCH_COVERAGE_NUM: u64 = 4;
const BRANCH_COVERAGE_DEN: u64 = 5;

/// A location in the interpreted program: the interpreted call stack topped by
/// the current instruction pointer, compared structurally.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HighLevelPc(Vec<u64>);

impl HighLevelPc {
    /// A real location, built from at least one frame.
    #[must_use]
    pub fn new(frames: &[u64]) -> Self {
        debug_assert!(!frames.is_empty(), "a real location carries frames");
        Self(frames.to_vec())
    }

    /// The graph entry sentinel. Real locations always carry at least one
    /// frame (the wire codec enforces this), so the empty stack can never
    /// collide with one.
    #[must_use]
    pub fn entry() -> Self {
        Self(Vec::new())
    }

    /// Whether this is the entry sentinel.
    #[must_use]
    pub fn is_entry(&self) -> bool {
        self.0.is_empty()
    }

    /// The innermost frame, the current instruction pointer.
    #[must_use]
    pub fn ip(&self) -> Option<u64> {
        self.0.last().copied()
    }

    /// All frames, outermost first.
    #[must_use]
    pub fn frames(&self) -> &[u64] {
        &self.0
    }
}

impl fmt::Display for HighLevelPc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<entry>");
        }
        for (i, frame) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{frame:x}")?;
        }
        Ok(())
    }
}

/// Index of a [`HighLevelInstruction`] inside its graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct InstrId(pub usize);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// One distinct interpreted-program location.
///
/// Created on first observation and kept until the owning graph is dropped at
/// the end of the session.
#[derive(Debug, Clone)]
pub struct HighLevelInstruction {
    pc: HighLevelPc,
    opcode: u32,
    successors: HashSet<InstrId>,
    predecessors: HashSet<InstrId>,
    low_level_paths: u64,
    high_level_paths: u64,
    forks: u64,
    distance_to_uncovered: u32,
}

impl HighLevelInstruction {
    fn new(pc: HighLevelPc, opcode: u32) -> Self {
        Self {
            pc,
            opcode,
            successors: HashSet::new(),
            predecessors: HashSet::new(),
            low_level_paths: 0,
            high_level_paths: 0,
            forks: 0,
            distance_to_uncovered: 0,
        }
    }

    /// The location this instruction sits at.
    #[must_use]
    pub fn pc(&self) -> &HighLevelPc {
        &self.pc
    }

    /// Opcode recorded when the location was first reached.
    #[must_use]
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Successor instructions observed so far.
    #[must_use]
    pub fn successors(&self) -> &HashSet<InstrId> {
        &self.successors
    }

    /// Predecessor instructions observed so far.
    #[must_use]
    pub fn predecessors(&self) -> &HashSet<InstrId> {
        &self.predecessors
    }

    /// How many instance arrivals stepped onto this location.
    #[must_use]
    pub fn low_level_paths(&self) -> u64 {
        self.low_level_paths
    }

    /// How many distinct execution-tree nodes sit at this location.
    #[must_use]
    pub fn high_level_paths(&self) -> u64 {
        self.high_level_paths
    }

    /// How many fork events happened while an instance was positioned here.
    #[must_use]
    pub fn forks(&self) -> u64 {
        self.forks
    }

    /// Steps to the nearest branch with an unexplored outcome, as of the last
    /// analysis run. Zero means no such branch is known to be reachable.
    #[must_use]
    pub fn distance_to_uncovered(&self) -> u32 {
        self.distance_to_uncovered
    }
}

/// A maximal straight-line chain of instructions, rebuilt on every analysis
/// run.
#[derive(Debug, Clone)]
pub struct HighLevelBasicBlock {
    instructions: Vec<InstrId>,
    successors: HashSet<usize>,
    predecessors: HashSet<usize>,
    dominators: HashSet<usize>,
}

impl HighLevelBasicBlock {
    /// The chained instructions, in execution order.
    #[must_use]
    pub fn instructions(&self) -> &[InstrId] {
        &self.instructions
    }

    /// The block's first instruction.
    #[must_use]
    pub fn head(&self) -> InstrId {
        self.instructions[0]
    }

    /// The block's last instruction.
    #[must_use]
    pub fn terminator(&self) -> InstrId {
        self.instructions[self.instructions.len() - 1]
    }

    /// Indices of successor blocks.
    #[must_use]
    pub fn successors(&self) -> &HashSet<usize> {
        &self.successors
    }

    /// Indices of predecessor blocks.
    #[must_use]
    pub fn predecessors(&self) -> &HashSet<usize> {
        &self.predecessors
    }

    /// Indices of the blocks dominating this one, itself included.
    #[must_use]
    pub fn dominators(&self) -> &HashSet<usize> {
        &self.dominators
    }
}

/// The control flow graph of the interpreted program as observed so far.
///
/// Nodes and edges only grow within a session; the whole graph is dropped
/// when tracing stops.
#[derive(Debug)]
pub struct HighLevelCfg {
    instructions: Vec<HighLevelInstruction>,
    by_pc: HashMap<HighLevelPc, InstrId>,
    blocks: Vec<HighLevelBasicBlock>,
    block_of: HashMap<InstrId, usize>,
    branch_opcodes: HashSet<u32>,
    entry: InstrId,
    changed: bool,
    version: u64,
}

impl HighLevelCfg {
    /// An empty graph holding only the entry sentinel.
    #[must_use]
    pub fn new() -> Self {
        let entry_pc = HighLevelPc::entry();
        let mut by_pc = HashMap::new();
        by_pc.insert(entry_pc.clone(), InstrId(0));
        Self {
            instructions: vec![HighLevelInstruction::new(entry_pc, 0)],
            by_pc,
            blocks: Vec::new(),
            block_of: HashMap::new(),
            branch_opcodes: HashSet::new(),
            entry: InstrId(0),
            changed: true,
            version: 0,
        }
    }

    /// The entry sentinel node.
    #[must_use]
    pub fn entry(&self) -> InstrId {
        self.entry
    }

    /// Number of distinct locations observed, entry sentinel included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.instructions.len()
    }

    /// Number of distinct edges observed.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.instructions
            .iter()
            .map(|inst| inst.successors.len())
            .sum()
    }

    /// Monotone counter bumped on every structural addition. Callers compare
    /// snapshots of it to detect growth across a window of updates.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The instruction stored under `id`.
    #[must_use]
    pub fn instruction(&self, id: InstrId) -> &HighLevelInstruction {
        &self.instructions[id.0]
    }

    /// Resolve a location to its node, if observed before.
    #[must_use]
    pub fn id_of(&self, pc: &HighLevelPc) -> Option<InstrId> {
        self.by_pc.get(pc).copied()
    }

    /// Every instruction with its id.
    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &HighLevelInstruction)> {
        self.instructions
            .iter()
            .enumerate()
            .map(|(i, inst)| (InstrId(i), inst))
    }

    /// The basic blocks of the last analysis run.
    #[must_use]
    pub fn blocks(&self) -> &[HighLevelBasicBlock] {
        &self.blocks
    }

    /// Block index of an instruction, as of the last analysis run.
    #[must_use]
    pub fn block_of(&self, id: InstrId) -> Option<usize> {
        self.block_of.get(&id).copied()
    }

    /// Opcodes classified as branches by the last analysis run.
    #[must_use]
    pub fn branch_opcodes(&self) -> &HashSet<u32> {
        &self.branch_opcodes
    }

    /// Record a location, creating its node on first observation.
    pub fn record_node(&mut self, pc: &HighLevelPc, opcode: u32) -> InstrId {
        if let Some(id) = self.by_pc.get(pc) {
            return *id;
        }
        let id = InstrId(self.instructions.len());
        self.instructions
            .push(HighLevelInstruction::new(pc.clone(), opcode));
        self.by_pc.insert(pc.clone(), id);
        self.changed = true;
        self.version += 1;
        id
    }

    /// Record a control transfer from `src` to the location `dst`, creating
    /// the destination node if needed. Idempotent on repeats: the changed
    /// flag moves only on actual novelty.
    pub fn record_edge(&mut self, src: InstrId, dst: &HighLevelPc, opcode: u32) -> InstrId {
        let dst_id = self.record_node(dst, opcode);
        if self.instructions[src.0].successors.insert(dst_id) {
            self.instructions[dst_id.0].predecessors.insert(src);
            self.changed = true;
            self.version += 1;
        }
        dst_id
    }

    /// Bump the arrival counter of an instruction.
    pub fn bump_low_level_paths(&mut self, id: InstrId) {
        self.instructions[id.0].low_level_paths += 1;
    }

    /// Bump the distinct-tree-node counter of an instruction.
    pub fn bump_high_level_paths(&mut self, id: InstrId) {
        self.instructions[id.0].high_level_paths += 1;
    }

    /// Bump the fork counter of an instruction.
    pub fn bump_forks(&mut self, id: InstrId) {
        self.instructions[id.0].forks += 1;
    }

    /// Whether the instruction's opcode ranks as a branch.
    #[must_use]
    pub fn is_branch_instruction(&self, id: InstrId) -> bool {
        self.branch_opcodes
            .contains(&self.instructions[id.0].opcode)
    }

    /// Rerun the whole analysis pipeline if the graph changed since the last
    /// run. Returns whether anything was recomputed.
    pub fn analyze(&mut self) -> bool {
        if !self.changed {
            return false;
        }
        self.changed = false;
        self.rebuild_blocks();
        self.compute_dominators();
        self.classify_branch_opcodes();
        self.compute_uncovered_distances();
        true
    }

    /// Length of the shortest successor walk from `src` to `dst`, or `None`
    /// if `dst` is unreachable from `src`.
    #[must_use]
    pub fn min_distance(&self, src: InstrId, dst: InstrId) -> Option<usize> {
        if src == dst {
            return Some(0);
        }
        let mut distance: HashMap<InstrId, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        distance.insert(src, 0);
        queue.push_back(src);
        while let Some(id) = queue.pop_front() {
            let next = distance[&id] + 1;
            for succ in &self.instructions[id.0].successors {
                if distance.contains_key(succ) {
                    continue;
                }
                if *succ == dst {
                    return Some(next);
                }
                distance.insert(*succ, next);
                queue.push_back(*succ);
            }
        }
        None
    }

    fn rebuild_blocks(&mut self) {
        self.blocks.clear();
        self.block_of.clear();

        let mut placed: HashSet<InstrId> = HashSet::new();
        let mut queued: HashSet<InstrId> = HashSet::new();
        let mut worklist = vec![self.entry];
        queued.insert(self.entry);

        while let Some(head) = worklist.pop() {
            if placed.contains(&head) {
                continue;
            }
            let mut chain = vec![head];
            placed.insert(head);
            let mut cursor = head;
            // extend while the chain stays single-entry/single-exit
            loop {
                let successors = &self.instructions[cursor.0].successors;
                if successors.len() != 1 {
                    break;
                }
                let next = *successors.iter().next().unwrap();
                if self.instructions[next.0].predecessors.len() != 1 || placed.contains(&next) {
                    break;
                }
                placed.insert(next);
                chain.push(next);
                cursor = next;
            }
            for succ in &self.instructions[cursor.0].successors {
                if queued.insert(*succ) {
                    worklist.push(*succ);
                }
            }
            let index = self.blocks.len();
            for id in &chain {
                self.block_of.insert(*id, index);
            }
            self.blocks.push(HighLevelBasicBlock {
                instructions: chain,
                successors: HashSet::new(),
                predecessors: HashSet::new(),
                dominators: HashSet::new(),
            });
        }

        for index in 0..self.blocks.len() {
            let terminator = self.blocks[index].terminator();
            let targets: Vec<usize> = self.instructions[terminator.0]
                .successors
                .iter()
                .filter_map(|succ| self.block_of.get(succ).copied())
                .collect();
            for target in targets {
                self.blocks[index].successors.insert(target);
                self.blocks[target].predecessors.insert(index);
            }
        }
    }

    fn compute_dominators(&mut self) {
        let count = self.blocks.len();
        if count == 0 {
            return;
        }
        let entry = self.block_of[&self.entry];
        let full: HashSet<usize> = (0..count).collect();
        let mut dominators: Vec<HashSet<usize>> = vec![full; count];
        dominators[entry] = core::iter::once(entry).collect();

        // classic iterative fixpoint: every non-entry block is dominated by
        // itself plus the intersection of its predecessors' dominators
        let mut stable = false;
        while !stable {
            stable = true;
            for index in 0..count {
                if index == entry {
                    continue;
                }
                let mut next: Option<HashSet<usize>> = None;
                for pred in &self.blocks[index].predecessors {
                    next = Some(match next {
                        None => dominators[*pred].clone(),
                        Some(acc) => acc
                            .intersection(&dominators[*pred])
                            .copied()
                            .collect(),
                    });
                }
                let mut next = next.unwrap_or_default();
                next.insert(index);
                if next != dominators[index] {
                    dominators[index] = next;
                    stable = false;
                }
            }
        }
        for (index, dom) in dominators.into_iter().enumerate() {
            self.blocks[index].dominators = dom;
        }
    }

    fn classify_branch_opcodes(&mut self) {
        self.branch_opcodes.clear();
        let mut counts: HashMap<u32, u64> = HashMap::new();
        let mut total = 0_u64;
        for block in &self.blocks {
            if block.successors.len() > 1 {
                let opcode = self.instructions[block.terminator().0].opcode;
                *counts.entry(opcode).or_insert(0) += 1;
                total += 1;
            }
        }
        if total == 0 {
            return;
        }
        let mut ranked: Vec<(u32, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut covered = 0_u64;
        for (opcode, occurrences) in ranked {
            if covered * BRANCH_COVERAGE_DEN >= total * BRANCH_COVERAGE_NUM {
                break;
            }
            self.branch_opcodes.insert(opcode);
            covered += occurrences;
        }
    }

    fn compute_uncovered_distances(&mut self) {
        // base case: a branch instruction with an unexplored outcome is one
        // step away from uncovered code; everything else starts unknown
        let mut distance: Vec<u32> = self
            .instructions
            .iter()
            .map(|inst| {
                u32::from(
                    self.branch_opcodes.contains(&inst.opcode) && inst.successors.len() < 2,
                )
            })
            .collect();

        let mut tightened = true;
        while tightened {
            tightened = false;
            for (index, inst) in self.instructions.iter().enumerate() {
                let nearest = inst
                    .successors
                    .iter()
                    .map(|succ| distance[succ.0])
                    .filter(|d| *d > 0)
                    .min();
                if let Some(nearest) = nearest {
                    let candidate = nearest + 1;
                    if distance[index] == 0 || candidate < distance[index] {
                        distance[index] = candidate;
                        tightened = true;
                    }
                }
            }
        }
        for (inst, d) in self.instructions.iter_mut().zip(distance) {
            inst.distance_to_uncovered = d;
        }
    }
}

impl Default for HighLevelCfg {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{HighLevelCfg, HighLevelPc, InstrId};

    const OP_BRANCH: u32 = 7;
    const OP_PLAIN: u32 = 1;

    fn pc(frame: u64) -> HighLevelPc {
        HighLevelPc::new(&[frame])
    }

    /// entry -> a, a -> {b, c}, b -> d, c -> d, with `a` terminating on a
    /// branch opcode and `b` carrying the same opcode but only one successor.
    fn diamond() -> (HighLevelCfg, [InstrId; 4]) {
        let mut cfg = HighLevelCfg::new();
        let a = cfg.record_edge(cfg.entry(), &pc(0xa), OP_BRANCH);
        let b = cfg.record_edge(a, &pc(0xb), OP_BRANCH);
        let c = cfg.record_edge(a, &pc(0xc), OP_PLAIN);
        let d = cfg.record_edge(b, &pc(0xd), OP_PLAIN);
        cfg.record_edge(c, &pc(0xd), OP_PLAIN);
        (cfg, [a, b, c, d])
    }

    #[test]
    fn recording_is_idempotent() {
        let mut cfg = HighLevelCfg::new();
        let a = cfg.record_edge(cfg.entry(), &pc(0xa), OP_PLAIN);
        let version = cfg.version();
        let again = cfg.record_edge(cfg.entry(), &pc(0xa), OP_PLAIN);
        assert_eq!(a, again);
        assert_eq!(cfg.version(), version);
        assert_eq!(cfg.node_count(), 2);
        assert_eq!(cfg.edge_count(), 1);
    }

    #[test]
    fn analysis_runs_only_on_change() {
        let (mut cfg, _) = diamond();
        assert!(cfg.analyze());
        assert!(!cfg.analyze());

        cfg.record_edge(cfg.entry(), &pc(0xe), OP_PLAIN);
        assert!(cfg.analyze());
        assert!(!cfg.analyze());
    }

    #[test]
    fn blocks_and_dominators_on_diamond() {
        let (mut cfg, [a, b, c, d]) = diamond();
        cfg.analyze();

        // entry+a chain into one block; b, c and the join d stand alone
        assert_eq!(cfg.blocks().len(), 4);
        let entry_block = cfg.block_of(cfg.entry()).unwrap();
        assert_eq!(cfg.block_of(a).unwrap(), entry_block);
        let (b_block, c_block, d_block) = (
            cfg.block_of(b).unwrap(),
            cfg.block_of(c).unwrap(),
            cfg.block_of(d).unwrap(),
        );

        let blocks = cfg.blocks();
        assert_eq!(
            blocks[entry_block].dominators().clone(),
            [entry_block].into_iter().collect()
        );
        assert_eq!(
            blocks[b_block].dominators().clone(),
            [entry_block, b_block].into_iter().collect()
        );
        assert_eq!(
            blocks[c_block].dominators().clone(),
            [entry_block, c_block].into_iter().collect()
        );
        // the join is dominated by the branch block, not by either arm
        assert_eq!(
            blocks[d_block].dominators().clone(),
            [entry_block, d_block].into_iter().collect()
        );
    }

    #[test]
    fn branch_opcode_ranking() {
        let (mut cfg, [a, b, _, _]) = diamond();
        cfg.analyze();

        assert!(cfg.branch_opcodes().contains(&OP_BRANCH));
        assert!(!cfg.branch_opcodes().contains(&OP_PLAIN));
        assert!(cfg.is_branch_instruction(a));
        assert!(cfg.is_branch_instruction(b));
    }

    #[test]
    fn distance_to_uncovered_on_diamond() {
        let (mut cfg, [a, b, c, d]) = diamond();
        cfg.analyze();

        // b is a branch with a single explored successor: the base case
        assert_eq!(cfg.instruction(b).distance_to_uncovered(), 1);
        // a reaches it in one step, entry in two
        assert_eq!(cfg.instruction(a).distance_to_uncovered(), 2);
        assert_eq!(cfg.instruction(cfg.entry()).distance_to_uncovered(), 3);
        // nothing uncovered is reachable from the join or the plain arm
        assert_eq!(cfg.instruction(c).distance_to_uncovered(), 0);
        assert_eq!(cfg.instruction(d).distance_to_uncovered(), 0);
    }

    #[test]
    fn min_distance_walks_successors() {
        let (cfg, [a, _, _, d]) = diamond();
        assert_eq!(cfg.min_distance(cfg.entry(), d), Some(3));
        assert_eq!(cfg.min_distance(a, d), Some(2));
        assert_eq!(cfg.min_distance(a, a), Some(0));
        assert_eq!(cfg.min_distance(d, cfg.entry()), None);
    }
}
