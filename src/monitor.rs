//! Turns engine notifications and guest location updates into execution-tree
//! and CFG growth.

use hashbrown::HashMap;
use libafl_bolts::Error;

use crate::{
    cfg::{HighLevelCfg, HighLevelPc},
    engine::InstanceId,
    tree::{ExecutionTree, TreeNodeId},
};

/// What a single location update did to the tree and the graph.
#[derive(Debug, Clone, Copy)]
pub struct LocationChange {
    /// Tree node the active instance now occupies.
    pub node: TreeNodeId,
    /// The node's path counter after the arrival was counted. A value of 1
    /// means no earlier run ever reached this node.
    pub path_counter: u64,
    /// Whether the update added a node or edge to the CFG.
    pub cfg_grew: bool,
}

#[derive(Debug)]
struct TraceState {
    cfg: HighLevelCfg,
    tree: ExecutionTree,
    active: InstanceId,
    active_node: TreeNodeId,
    recorded: HashMap<InstanceId, TreeNodeId>,
}

/// Owns the CFG and execution tree while location tracing runs.
///
/// Idle ⇄ Tracing. Starting a trace while one runs, or feeding updates for a
/// non-active instance, is a caller bug and is rejected through the explicit
/// state guard rather than silently absorbed.
#[derive(Debug, Default)]
pub struct InterpreterMonitor {
    trace: Option<TraceState>,
}

impl InterpreterMonitor {
    /// A monitor in the Idle state.
    #[must_use]
    pub fn new() -> Self {
        Self { trace: None }
    }

    /// Whether a trace is running.
    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.trace.is_some()
    }

    /// Begin tracing with `instance` active. Creates the root CFG node and
    /// tree node and counts the instance's arrival on the root.
    pub fn start_trace(&mut self, instance: InstanceId) -> Result<(), Error> {
        if self.trace.is_some() {
            return Err(Error::illegal_state("location tracing already running"));
        }
        let mut cfg = HighLevelCfg::new();
        let mut tree = ExecutionTree::new(cfg.entry());
        let root = tree.root();
        tree.bump_path_counter(root, &mut cfg);
        self.trace = Some(TraceState {
            cfg,
            tree,
            active: instance,
            active_node: root,
            recorded: HashMap::new(),
        });
        log::debug!("location tracing started on {instance}");
        Ok(())
    }

    /// Stop tracing, dropping the tree and the CFG.
    pub fn stop_trace(&mut self, instance: InstanceId) -> Result<(), Error> {
        match &self.trace {
            None => Err(Error::illegal_state("location tracing is not running")),
            Some(trace) if trace.active != instance => Err(Error::illegal_argument(format!(
                "{instance} asked to stop a trace owned by {}",
                trace.active
            ))),
            Some(_) => {
                self.trace = None;
                log::debug!("location tracing stopped");
                Ok(())
            }
        }
    }

    /// Associate every genuinely new fork child with the parent's current
    /// tree node. Counts one fork event on that node if anything new arrived.
    pub fn on_fork(&mut self, parent: InstanceId, children: &[InstanceId]) {
        let Some(trace) = &mut self.trace else {
            return;
        };
        let node = if parent == trace.active {
            trace.active_node
        } else if let Some(node) = trace.recorded.get(&parent) {
            *node
        } else {
            return;
        };
        let mut any_new = false;
        for child in children {
            if *child == parent || *child == trace.active || trace.recorded.contains_key(child) {
                continue;
            }
            trace.recorded.insert(*child, node);
            any_new = true;
        }
        if any_new {
            trace.tree.bump_fork_counter(node, &mut trace.cfg);
        }
    }

    /// Make `new` the active instance: remember `old`'s position, adopt
    /// `new`'s recorded node and count its arrival there.
    pub fn on_switch(&mut self, old: InstanceId, new: InstanceId) -> Result<(), Error> {
        let Some(trace) = &mut self.trace else {
            return Err(Error::illegal_state("location tracing is not running"));
        };
        if old == trace.active {
            trace.recorded.insert(old, trace.active_node);
        }
        let node = trace
            .recorded
            .remove(&new)
            .ok_or_else(|| Error::key_not_found(format!("{new} has no recorded tree node")))?;
        trace.active = new;
        trace.active_node = node;
        trace.tree.bump_path_counter(node, &mut trace.cfg);
        Ok(())
    }

    /// Drop a dead instance's tree association.
    pub fn on_kill(&mut self, instance: InstanceId) {
        if let Some(trace) = &mut self.trace {
            trace.recorded.remove(&instance);
        }
    }

    /// The interpreted program moved: record the CFG edge from the current
    /// location, descend into (or create) the matching tree child and count
    /// the arrival. Only the active instance may report locations.
    pub fn location_update(
        &mut self,
        instance: InstanceId,
        pc: &HighLevelPc,
        opcode: u32,
    ) -> Result<LocationChange, Error> {
        let Some(trace) = &mut self.trace else {
            return Err(Error::illegal_state("location tracing is not running"));
        };
        if instance != trace.active {
            return Err(Error::illegal_argument(format!(
                "location update from {instance}, but {} is active",
                trace.active
            )));
        }
        let version_before = trace.cfg.version();
        let src = trace.tree.node(trace.active_node).instruction();
        let dst = trace.cfg.record_edge(src, pc, opcode);
        let (child, _) = trace
            .tree
            .get_or_create_successor(trace.active_node, dst, &mut trace.cfg);
        trace.tree.bump_path_counter(child, &mut trace.cfg);
        trace.active_node = child;
        Ok(LocationChange {
            node: child,
            path_counter: trace.tree.node(child).path_counter(),
            cfg_grew: trace.cfg.version() > version_before,
        })
    }

    /// The tree node an instance sits on: the active node for the active
    /// instance, the recorded association otherwise.
    #[must_use]
    pub fn hl_tree_node(&self, instance: InstanceId) -> Option<TreeNodeId> {
        let trace = self.trace.as_ref()?;
        if instance == trace.active {
            Some(trace.active_node)
        } else {
            trace.recorded.get(&instance).copied()
        }
    }

    /// The instance currently driving the trace.
    #[must_use]
    pub fn active_instance(&self) -> Option<InstanceId> {
        self.trace.as_ref().map(|trace| trace.active)
    }

    /// The graph grown so far, while tracing.
    #[must_use]
    pub fn cfg(&self) -> Option<&HighLevelCfg> {
        self.trace.as_ref().map(|trace| &trace.cfg)
    }

    /// Mutable access to the graph, while tracing.
    pub fn cfg_mut(&mut self) -> Option<&mut HighLevelCfg> {
        self.trace.as_mut().map(|trace| &mut trace.cfg)
    }

    /// The execution tree grown so far, while tracing.
    #[must_use]
    pub fn tree(&self) -> Option<&ExecutionTree> {
        self.trace.as_ref().map(|trace| &trace.tree)
    }
}

#[cfg(test)]
mod tests {
    use super::InterpreterMonitor;
    use crate::{cfg::HighLevelPc, engine::InstanceId};

    const I1: InstanceId = InstanceId(1);
    const I2: InstanceId = InstanceId(2);

    fn updates() -> Vec<(u32, Vec<u64>)> {
        vec![
            (1, vec![0x10]),
            (7, vec![0x10, 0x20]),
            (1, vec![0x10, 0x21]),
            (7, vec![0x10, 0x20]),
            (1, vec![0x10]),
        ]
    }

    fn replay(updates: &[(u32, Vec<u64>)]) -> (Vec<Vec<u64>>, Vec<(Vec<u64>, Vec<u64>)>) {
        let mut monitor = InterpreterMonitor::new();
        monitor.start_trace(I1).unwrap();
        for (opcode, frames) in updates {
            monitor
                .location_update(I1, &HighLevelPc::new(frames), *opcode)
                .unwrap();
        }
        let cfg = monitor.cfg().unwrap();
        let mut nodes: Vec<Vec<u64>> = cfg.iter().map(|(_, i)| i.pc().frames().to_vec()).collect();
        nodes.sort();
        let mut edges = Vec::new();
        for (_, inst) in cfg.iter() {
            for succ in inst.successors() {
                edges.push((
                    inst.pc().frames().to_vec(),
                    cfg.instruction(*succ).pc().frames().to_vec(),
                ));
            }
        }
        edges.sort();
        (nodes, edges)
    }

    #[test]
    fn trace_state_machine_guards() {
        let mut monitor = InterpreterMonitor::new();
        assert!(monitor.stop_trace(I1).is_err());

        monitor.start_trace(I1).unwrap();
        assert!(monitor.start_trace(I2).is_err());
        assert!(monitor.stop_trace(I2).is_err());

        // only the active instance may report locations
        assert!(monitor
            .location_update(I2, &HighLevelPc::new(&[1]), 0)
            .is_err());

        monitor.stop_trace(I1).unwrap();
        assert!(!monitor.is_tracing());
        assert!(monitor.cfg().is_none());
    }

    #[test]
    fn replay_is_deterministic() {
        let updates = updates();
        assert_eq!(replay(&updates), replay(&updates));
    }

    #[test]
    fn fork_and_switch_associations() {
        let mut monitor = InterpreterMonitor::new();
        monitor.start_trace(I1).unwrap();
        let change = monitor
            .location_update(I1, &HighLevelPc::new(&[0x10]), 1)
            .unwrap();
        assert_eq!(change.path_counter, 1);
        assert!(change.cfg_grew);

        monitor.on_fork(I1, &[I2]);
        assert_eq!(monitor.hl_tree_node(I2), Some(change.node));
        let tree = monitor.tree().unwrap();
        assert_eq!(tree.node(change.node).fork_counter(), 1);

        monitor.on_switch(I1, I2).unwrap();
        assert_eq!(monitor.active_instance(), Some(I2));
        // arrival of the adopted instance is counted again on the same node
        assert_eq!(monitor.tree().unwrap().node(change.node).path_counter(), 2);

        monitor.on_kill(I1);
        assert_eq!(monitor.hl_tree_node(I1), None);
    }

    #[test]
    fn switch_to_unknown_instance_is_an_error() {
        let mut monitor = InterpreterMonitor::new();
        monitor.start_trace(I1).unwrap();
        assert!(monitor.on_switch(I1, I2).is_err());
    }
}
