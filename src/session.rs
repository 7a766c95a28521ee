//! The concolic session: one bounded campaign of runs driven to maximize
//! coverage of the interpreted program.
//!
//! While a session is active the scheduler holds full authority over which
//! engine instance runs: exactly one is active, every fork child goes into a
//! weighted pending pool, and a finished path always ends with either the
//! pool's next pick being installed or the whole session being torn down.
//! Everything happens synchronously inside engine notifications and guest
//! messages; there is no thread and no suspension in here.

use core::marker::PhantomData;
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use libafl_bolts::{current_time, Error};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    cfg::HighLevelPc,
    engine::{ExecutionEngine, InstanceId, TracerHooks},
    monitor::InterpreterMonitor,
    protocol::{LocationMessage, SessionMessage, MAX_RESULT_SIZE},
    report::{ReportStream, RunReports},
    selectors::{RandSelector, Selector, WeightedSelector},
    tree::{ForkPointId, ForkTree, TreeNodeId},
};

/// Weight multiplier applied to the pending members of a fork streak each
/// time the same program counter forks again.
const FORK_STREAK_DISCOUNT: f64 = 0.75;

/// Tunables of one exploration campaign.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct SessionConfig {
    /// Directory receiving the per-run reports and graph dumps.
    pub output_dir: std::path::PathBuf,
    /// Tear the session down when a run ends on an error path.
    #[builder(default = true)]
    pub stop_on_error: bool,
    /// Wall-clock budget for a single path before it is cut short.
    #[builder(default = Duration::from_secs(60))]
    pub path_time_limit: Duration,
    /// Interval between periodic graph dumps, `None` to disable them.
    #[builder(default = Some(Duration::from_secs(60)))]
    pub dump_interval: Option<Duration>,
}

/// Computes the selection score of a pending instance from its fork-streak
/// weight and its tree position's distance to uncovered code.
pub trait PendingScore {
    /// The score; must be finite and non-negative.
    fn compute(weight: f64, distance_to_uncovered: u32) -> f64;
}

/// Scores purely by the fork-streak weight.
#[derive(Debug, Clone, Copy)]
pub struct ForkWeightScore;

impl PendingScore for ForkWeightScore {
    fn compute(weight: f64, _distance_to_uncovered: u32) -> f64 {
        weight
    }
}

/// Prefers instances parked close to a branch with an unexplored outcome.
/// Instances with no known way to uncovered code keep a small residual score
/// so exhaustion still drains them.
#[derive(Debug, Clone, Copy)]
pub struct UncoveredDistanceScore;

impl PendingScore for UncoveredDistanceScore {
    fn compute(weight: f64, distance_to_uncovered: u32) -> f64 {
        if distance_to_uncovered == 0 {
            weight / 1024.0
        } else {
            weight / f64::from(distance_to_uncovered)
        }
    }
}

/// Bookkeeping of one forked-but-not-yet-scheduled instance.
#[derive(Debug, Clone, Copy)]
struct PendingInstance {
    fork_point: ForkPointId,
    branch: u32,
    weight: f64,
}

#[derive(Debug)]
struct ActiveSession {
    active: InstanceId,
    start_time: Duration,
    session_deadline: Option<Duration>,
    path_deadline: Option<Duration>,
    dump_deadline: Option<Duration>,
    fork_tree: ForkTree,
    start_fork: ForkPointId,
    current_fork: ForkPointId,
    current_branch: u32,
    pending: WeightedSelector<InstanceId>,
    pending_info: HashMap<InstanceId, PendingInstance>,
    last_fork_pc: Option<u64>,
    streak: Vec<InstanceId>,
    tree_divergence: Option<TreeNodeId>,
    cfg_divergence: Option<TreeNodeId>,
    cfg_version_at_path_start: u64,
    path_start_pc: u64,
    reports: RunReports,
}

#[derive(Debug)]
enum SessionState {
    Idle,
    Active(Box<ActiveSession>),
}

/// Orchestrates one concolic exploration campaign.
///
/// Owns the engine and tracer capability handles, the interpreter monitor and
/// the pending-instance pool. Engine notifications (`on_fork`, `on_switch`,
/// `on_kill`, `on_timer`) and guest messages are fed in synchronously; the
/// engine's "which instance runs next" question is answered by
/// [`ConcolicSession::next_instance`].
#[derive(Debug)]
pub struct ConcolicSession<E, T, SC = ForkWeightScore> {
    engine: E,
    tracer: T,
    config: SessionConfig,
    monitor: InterpreterMonitor,
    state: SessionState,
    fallback: RandSelector<InstanceId>,
    killing: HashSet<InstanceId>,
    phantom: PhantomData<SC>,
}

impl<E, T, SC> ConcolicSession<E, T, SC>
where
    E: ExecutionEngine,
    T: TracerHooks,
    SC: PendingScore,
{
    /// Create an idle session around the injected engine and tracer handles.
    pub fn new(engine: E, tracer: T, config: SessionConfig) -> Self {
        Self {
            engine,
            tracer,
            config,
            monitor: InterpreterMonitor::new(),
            state: SessionState::Idle,
            fallback: RandSelector::new(),
            killing: HashSet::new(),
            phantom: PhantomData,
        }
    }

    /// The injected engine handle.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mutable access to the injected engine handle.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// The interpreter monitor.
    #[must_use]
    pub fn monitor(&self) -> &InterpreterMonitor {
        &self.monitor
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a session is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    /// Number of forked instances waiting to be scheduled.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        match &self.state {
            SessionState::Active(active) => active.pending.len(),
            SessionState::Idle => 0,
        }
    }

    /// The fork-streak weight of a pending instance.
    #[must_use]
    pub fn pending_weight(&self, instance: InstanceId) -> Option<f64> {
        match &self.state {
            SessionState::Active(active) => {
                active.pending_info.get(&instance).map(|info| info.weight)
            }
            SessionState::Idle => None,
        }
    }

    /// First node of the current path that no earlier run had reached.
    #[must_use]
    pub fn tree_divergence(&self) -> Option<TreeNodeId> {
        match &self.state {
            SessionState::Active(active) => active.tree_divergence,
            SessionState::Idle => None,
        }
    }

    /// First node of the current path at which the CFG gained structure.
    #[must_use]
    pub fn cfg_divergence(&self) -> Option<TreeNodeId> {
        match &self.state {
            SessionState::Active(active) => active.cfg_divergence,
            SessionState::Idle => None,
        }
    }

    /// Make an instance eligible for the out-of-session fallback policy.
    pub fn register_instance(&mut self, instance: InstanceId) {
        self.fallback.insert(instance);
    }

    /// The engine's "pick next instance" contract. An active session always
    /// answers with its active instance; outside a session the uniform
    /// fallback pool decides, so behavior there is unaffected.
    pub fn next_instance(&mut self) -> Result<InstanceId, Error> {
        match &self.state {
            SessionState::Active(active) => Ok(active.active),
            SessionState::Idle => self.fallback.select(),
        }
    }

    /// Open a session on `instance`, bounded by `max_time` (zero for
    /// unbounded). Legal only while idle.
    pub fn start_session(&mut self, instance: InstanceId, max_time: Duration) -> Result<(), Error> {
        if self.is_active() {
            return Err(Error::illegal_state(
                "a concolic session is already active",
            ));
        }
        // stale constraints from unrelated earlier runs must not leak in
        self.engine.reset_symbolic_state(instance);
        self.monitor.start_trace(instance)?;

        let now = current_time();
        let start_pc = self.engine.program_counter(instance);
        let fork_tree = ForkTree::new(start_pc, self.monitor.hl_tree_node(instance));
        let reports = match RunReports::create(&self.config.output_dir) {
            Ok(reports) => reports,
            Err(err) => {
                log::warn!("failed to open run reports: {err}");
                RunReports::disabled()
            }
        };
        let cfg_version = self.monitor.cfg().map_or(0, crate::cfg::HighLevelCfg::version);
        self.state = SessionState::Active(Box::new(ActiveSession {
            active: instance,
            start_time: now,
            session_deadline: (!max_time.is_zero()).then(|| now + max_time),
            path_deadline: Some(now + self.config.path_time_limit),
            dump_deadline: self.config.dump_interval.map(|interval| now + interval),
            start_fork: fork_tree.root(),
            current_fork: fork_tree.root(),
            current_branch: 0,
            fork_tree,
            pending: WeightedSelector::new(),
            pending_info: HashMap::new(),
            last_fork_pc: None,
            streak: Vec::new(),
            tree_divergence: None,
            cfg_divergence: None,
            cfg_version_at_path_start: cfg_version,
            path_start_pc: start_pc,
            reports,
        }));
        self.tracer.enable();
        log::info!(
            "concolic session started on {instance} (pid {}), budget {}",
            self.engine.instance_pid(instance),
            if max_time.is_zero() {
                "unbounded".to_string()
            } else {
                format!("{max_time:?}")
            }
        );
        Ok(())
    }

    /// Close the active instance's path. Legal only while active, and only
    /// for the active instance. Either installs the next pending instance or
    /// tears the whole session down.
    pub fn end_session(&mut self, instance: InstanceId, is_error_path: bool) -> Result<(), Error> {
        self.finish_path(instance, is_error_path, true)
    }

    /// Tear the active session down: disable tracers, write final dumps,
    /// dispose every pending instance through the engine, stop tracing.
    pub fn terminate_session(&mut self) -> Result<(), Error> {
        if !self.is_active() {
            return Err(Error::illegal_state("no concolic session is active"));
        }
        self.teardown()
    }

    /// Engine notification: `parent` forked into `children`.
    ///
    /// Ignored unless the session is active and the fork came from the active
    /// instance. Each genuinely new child is registered pending at weight 1.0
    /// under a fresh fork point; repeated forks at one program counter
    /// progressively de-prioritize the whole streak.
    pub fn on_fork(&mut self, parent: InstanceId, children: &[InstanceId]) -> Result<(), Error> {
        for child in children {
            if *child != parent {
                self.fallback.insert(*child);
            }
        }
        if !matches!(&self.state, SessionState::Active(active) if active.active == parent) {
            return Ok(());
        }
        self.monitor.on_fork(parent, children);
        let pc = self.engine.program_counter(parent);
        let tree_node = self.monitor.hl_tree_node(parent);

        let SessionState::Active(active) = &mut self.state else {
            unreachable!("guarded above");
        };
        let mut fresh = Vec::new();
        for child in children {
            if *child == parent || active.pending_info.contains_key(child) {
                continue;
            }
            fresh.push(*child);
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let branches = 1 + fresh.len() as u32;
        let fork_point = active.fork_tree.add_child(
            active.current_fork,
            active.current_branch,
            branches,
            pc,
            tree_node,
        );
        active.current_fork = fork_point;
        active.current_branch = 0;
        for (ordinal, child) in fresh.iter().enumerate() {
            active.pending_info.insert(
                *child,
                PendingInstance {
                    fork_point,
                    branch: ordinal as u32 + 1,
                    weight: 1.0,
                },
            );
            active.pending.insert(*child);
        }

        if active.last_fork_pc == Some(pc) {
            // the same location forked again: the whole streak, newcomers
            // included, loses priority
            let ActiveSession {
                streak,
                pending_info,
                ..
            } = &mut **active;
            streak.extend(fresh.iter().copied());
            streak.retain(|member| pending_info.contains_key(member));
            for member in streak.iter() {
                if let Some(info) = pending_info.get_mut(member) {
                    info.weight *= FORK_STREAK_DISCOUNT;
                }
            }
        } else {
            active.last_fork_pc = Some(pc);
            active.streak = fresh;
        }
        Ok(())
    }

    /// Engine notification: the engine switched from `old` to `new`.
    ///
    /// Switches while a session is active originate from this scheduler's own
    /// end-of-path decision, which already installed the new instance; the
    /// notification merely confirms it. Anything else is logged and ignored.
    pub fn on_switch(&mut self, old: InstanceId, new: InstanceId) -> Result<(), Error> {
        if let SessionState::Active(active) = &self.state {
            if active.active != new {
                log::warn!("engine switched {old} -> {new} behind the scheduler's back");
            }
        }
        Ok(())
    }

    /// Engine notification: `instance` is gone.
    ///
    /// A kill of the active instance that this scheduler did not request
    /// still has to advance scheduling, so it behaves exactly like
    /// [`ConcolicSession::end_session`] with a non-error path. Self-initiated
    /// kills and kills of non-active instances are bookkeeping only.
    pub fn on_kill(&mut self, instance: InstanceId) -> Result<(), Error> {
        self.fallback.remove(&instance);
        if self.killing.remove(&instance) {
            self.monitor.on_kill(instance);
            return Ok(());
        }
        if matches!(&self.state, SessionState::Active(active) if active.active == instance) {
            log::info!("{instance} was killed by the engine; advancing to the next path");
            let result = self.finish_path(instance, false, false);
            self.monitor.on_kill(instance);
            return result;
        }
        if let SessionState::Active(active) = &mut self.state {
            if active.pending.remove(&instance) {
                active.pending_info.remove(&instance);
                active.streak.retain(|member| *member != instance);
                log::warn!("pending {instance} was killed by the engine");
            }
        }
        self.monitor.on_kill(instance);
        Ok(())
    }

    /// Engine notification: periodic timer tick. Checks, in order, the
    /// per-path deadline, the session deadline and the dump deadline.
    pub fn on_timer(&mut self) -> Result<(), Error> {
        let now = current_time();
        let (instance, path_over, session_over, dump_due) = match &self.state {
            SessionState::Idle => return Ok(()),
            SessionState::Active(active) => (
                active.active,
                active.path_deadline.is_some_and(|deadline| now >= deadline),
                active
                    .session_deadline
                    .is_some_and(|deadline| now >= deadline),
                active.dump_deadline.is_some_and(|deadline| now >= deadline),
            ),
        };
        if path_over {
            log::info!("path deadline passed for {instance}");
            return self.finish_path(instance, true, true);
        }
        if session_over {
            log::info!("session deadline passed");
            self.teardown()?;
            self.dispose_instance(instance, "session deadline passed");
            return Ok(());
        }
        if dump_due {
            let SessionState::Active(active) = &mut self.state else {
                unreachable!("checked above");
            };
            if let (Some(cfg), Some(tree)) = (self.monitor.cfg(), self.monitor.tree()) {
                if let Err(err) = active.reports.dump_graphs(cfg, tree) {
                    log::warn!("failed to write periodic graph dumps: {err}");
                }
            }
            active.dump_deadline = self.config.dump_interval.map(|interval| now + interval);
        }
        Ok(())
    }

    /// Guest message on the session channel (START/END). Malformed messages
    /// and unreadable result memory fail without touching session state.
    pub fn handle_session_message(
        &mut self,
        instance: InstanceId,
        message: &[u8],
    ) -> Result<(), Error> {
        match SessionMessage::parse(message)? {
            SessionMessage::Start { max_time_secs } => {
                self.start_session(instance, Duration::from_secs(u64::from(max_time_secs)))
            }
            SessionMessage::End {
                is_error_path,
                result_ptr,
                result_size,
            } => {
                if result_size as usize > MAX_RESULT_SIZE {
                    return Err(Error::illegal_argument(format!(
                        "result buffer of {result_size} bytes exceeds the {MAX_RESULT_SIZE} limit"
                    )));
                }
                if result_size > 0 {
                    let mut result = vec![0_u8; result_size as usize];
                    self.engine.read_memory(instance, result_ptr, &mut result)?;
                    log::info!("{instance} reported a result of {result_size} bytes");
                }
                self.end_session(instance, is_error_path)
            }
        }
    }

    /// Guest message on the location channel. Valid only for the active
    /// instance of an active session; malformed messages fail without
    /// touching state.
    pub fn handle_location_message(
        &mut self,
        instance: InstanceId,
        message: &[u8],
    ) -> Result<(), Error> {
        let parsed = LocationMessage::parse(message)?;
        if !self.is_active() {
            return Err(Error::illegal_state("no concolic session is active"));
        }
        let pc = HighLevelPc::new(&parsed.frames);
        let change = self.monitor.location_update(instance, &pc, parsed.opcode)?;

        let cfg_version = self.monitor.cfg().map_or(0, crate::cfg::HighLevelCfg::version);
        let SessionState::Active(active) = &mut self.state else {
            unreachable!("checked above");
        };
        if active.tree_divergence.is_none() && change.path_counter == 1 {
            active.tree_divergence = Some(change.node);
        }
        if active.cfg_divergence.is_none() && cfg_version > active.cfg_version_at_path_start {
            active.cfg_divergence = Some(change.node);
        }
        Ok(())
    }

    /// Distance-to-uncovered at the tree position of an instance, zero when
    /// unknown.
    fn distance_of(monitor: &InterpreterMonitor, instance: InstanceId) -> u32 {
        let Some(node) = monitor.hl_tree_node(instance) else {
            return 0;
        };
        match (monitor.tree(), monitor.cfg()) {
            (Some(tree), Some(cfg)) => cfg
                .instruction(tree.node(node).instruction())
                .distance_to_uncovered(),
            _ => 0,
        }
    }

    /// The end-of-path pipeline shared by END messages, per-path timeouts and
    /// external kills of the active instance. `dispose` is false when the
    /// engine already disposed the instance on its own.
    fn finish_path(
        &mut self,
        instance: InstanceId,
        is_error_path: bool,
        dispose: bool,
    ) -> Result<(), Error> {
        let mut tear_down = is_error_path && self.config.stop_on_error;
        {
            let SessionState::Active(active) = &mut self.state else {
                return Err(Error::illegal_state("no concolic session is active"));
            };
            if active.active != instance {
                return Err(Error::illegal_state(format!(
                    "{instance} ended a path, but {} is active",
                    active.active
                )));
            }
            // the path is over; its deadline must not fire while it winds down
            active.path_deadline = None;

            let now = current_time();
            let relative = now.saturating_sub(active.start_time);
            let node = self.monitor.hl_tree_node(instance);
            let new_path = match (node, self.monitor.tree()) {
                (Some(node), Some(tree)) => tree.node(node).path_counter() == 1,
                _ => false,
            };
            let cfg_grew = self
                .monitor
                .cfg()
                .is_some_and(|cfg| cfg.version() > active.cfg_version_at_path_start);

            match self.engine.input_assignment(instance) {
                Ok(assignment) => {
                    active.reports.log_run(
                        ReportStream::AllRuns,
                        relative,
                        active.path_start_pc,
                        &assignment,
                    );
                    if new_path {
                        log::info!(
                            "{instance} finished a new high-level path{}",
                            if is_error_path { " (error)" } else { "" }
                        );
                        active.reports.log_run(
                            ReportStream::NewPaths,
                            relative,
                            active.path_start_pc,
                            &assignment,
                        );
                        if cfg_grew {
                            active.reports.log_run(
                                ReportStream::CfgFragments,
                                relative,
                                active.path_start_pc,
                                &assignment,
                            );
                        }
                    }
                }
                Err(err) => log::warn!("no input assignment for {instance}: {err}"),
            }

            // refresh coverage estimates, then the pool's selection weights
            if let Some(cfg) = self.monitor.cfg_mut() {
                cfg.analyze();
            }
            {
                let ActiveSession {
                    pending,
                    pending_info,
                    ..
                } = &mut **active;
                let monitor = &self.monitor;
                pending.update_weights(|pending_instance| {
                    pending_info.get(pending_instance).map_or(0.0, |info| {
                        SC::compute(info.weight, Self::distance_of(monitor, *pending_instance))
                    })
                });
            }

            if active.pending.is_empty() {
                log::info!("no pending instances remain; the search is exhausted");
                tear_down = true;
            } else if tear_down {
                log::info!("error path ends the session");
            }

            if !tear_down {
                // install the pool's next pick as the new active instance
                let next = active.pending.select()?;
                active.pending.remove(&next);
                let info = active
                    .pending_info
                    .remove(&next)
                    .ok_or_else(|| Error::key_not_found(format!("{next} is not pending")))?;
                active.streak.retain(|member| *member != next);
                self.monitor.on_switch(instance, next)?;
                active.active = next;
                active.current_fork = info.fork_point;
                active.current_branch = info.branch;
                active.path_deadline = Some(current_time() + self.config.path_time_limit);
                active.tree_divergence = None;
                active.cfg_divergence = None;
                active.cfg_version_at_path_start =
                    self.monitor.cfg().map_or(0, crate::cfg::HighLevelCfg::version);
                active.path_start_pc = active.fork_tree.node(info.fork_point).program_counter();
                log::debug!("scheduled {next}");
            }
        }
        if tear_down {
            self.teardown()?;
        }
        if dispose {
            self.dispose_instance(instance, "path finished");
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), Error> {
        let SessionState::Active(active) = core::mem::replace(&mut self.state, SessionState::Idle)
        else {
            return Err(Error::illegal_state("no concolic session is active"));
        };
        let active = *active;
        self.tracer.disable();
        if let (Some(cfg), Some(tree)) = (self.monitor.cfg(), self.monitor.tree()) {
            if let Err(err) = active.reports.dump_graphs(cfg, tree) {
                log::warn!("failed to write final graph dumps: {err}");
            }
        }
        let mut pending = Vec::new();
        active.pending.copy_into(&mut pending);
        for instance in pending {
            self.dispose_instance(instance, "session torn down");
        }
        self.monitor.stop_trace(active.active)?;
        log::info!(
            "concolic session started at {:#x} finished after {:?}, {} fork points",
            active.fork_tree.node(active.start_fork).program_counter(),
            current_time().saturating_sub(active.start_time),
            active.fork_tree.len()
        );
        Ok(())
    }

    /// Route an instance into the engine's termination call. Every instance
    /// this scheduler drops goes through here, never silently.
    fn dispose_instance(&mut self, instance: InstanceId, reason: &str) {
        self.killing.insert(instance);
        self.fallback.remove(&instance);
        if let Err(err) = self.engine.terminate_instance(instance, reason) {
            log::warn!("engine refused to terminate {instance}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use hashbrown::HashMap;
    use libafl_bolts::Error;

    use super::{ConcolicSession, ForkWeightScore, SessionConfig};
    use crate::{
        engine::{ExecutionEngine, InputAssignment, InstanceId, TracerHooks, VmAddr},
        protocol::SessionMessage,
    };

    #[derive(Debug, Default)]
    struct MockEngine {
        pcs: HashMap<InstanceId, u64>,
        memory: HashMap<VmAddr, Vec<u8>>,
        terminated: Vec<InstanceId>,
        reset: Vec<InstanceId>,
    }

    impl ExecutionEngine for MockEngine {
        fn read_memory(
            &mut self,
            _instance: InstanceId,
            addr: VmAddr,
            buf: &mut [u8],
        ) -> Result<(), Error> {
            let data = self
                .memory
                .get(&addr)
                .ok_or_else(|| Error::key_not_found(format!("no mapping at {addr:#x}")))?;
            if data.len() < buf.len() {
                return Err(Error::illegal_argument("short read"));
            }
            buf.copy_from_slice(&data[..buf.len()]);
            Ok(())
        }

        fn write_memory(
            &mut self,
            _instance: InstanceId,
            addr: VmAddr,
            buf: &[u8],
        ) -> Result<(), Error> {
            self.memory.insert(addr, buf.to_vec());
            Ok(())
        }

        fn program_counter(&mut self, instance: InstanceId) -> u64 {
            self.pcs.get(&instance).copied().unwrap_or_default()
        }

        fn instance_pid(&mut self, instance: InstanceId) -> u32 {
            instance.0
        }

        fn terminate_instance(&mut self, instance: InstanceId, _reason: &str) -> Result<(), Error> {
            self.terminated.push(instance);
            Ok(())
        }

        fn reset_symbolic_state(&mut self, instance: InstanceId) {
            self.reset.push(instance);
        }

        fn input_assignment(&mut self, _instance: InstanceId) -> Result<InputAssignment, Error> {
            Ok(vec![("arg0".to_string(), vec![0x41])])
        }
    }

    #[derive(Debug, Default)]
    struct MockTracer {
        enabled: bool,
        toggles: usize,
    }

    impl TracerHooks for MockTracer {
        fn enable(&mut self) {
            self.enabled = true;
            self.toggles += 1;
        }

        fn disable(&mut self) {
            self.enabled = false;
            self.toggles += 1;
        }
    }

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    type TestSession = ConcolicSession<MockEngine, MockTracer, ForkWeightScore>;

    fn fresh_session(stop_on_error: bool) -> TestSession {
        let dir = std::env::temp_dir().join(format!(
            "interp_concolic_session_{}_{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        let config = SessionConfig::builder()
            .output_dir(dir)
            .stop_on_error(stop_on_error)
            .build();
        ConcolicSession::new(MockEngine::default(), MockTracer::default(), config)
    }

    const A: InstanceId = InstanceId(1);
    const C1: InstanceId = InstanceId(2);
    const C2: InstanceId = InstanceId(3);
    const C3: InstanceId = InstanceId(4);

    #[test]
    fn session_state_machine_guards() {
        let mut session = fresh_session(true);
        assert!(session.end_session(A, false).is_err());
        assert!(session.terminate_session().is_err());

        session.start_session(A, Duration::ZERO).unwrap();
        assert!(session.start_session(C1, Duration::ZERO).is_err());
        assert!(session.is_active());
        assert!(session.engine().reset.contains(&A));
        assert!(session.monitor().is_tracing());

        // ending from a non-active instance is a caller bug
        assert!(session.end_session(C1, false).is_err());
    }

    #[test]
    fn non_error_end_schedules_a_pending_child() {
        let mut session = fresh_session(true);
        session.register_instance(A);
        session.start_session(A, Duration::ZERO).unwrap();
        session.engine_mut().pcs.insert(A, 0x1000);
        session.on_fork(A, &[C1, C2]).unwrap();
        assert_eq!(session.pending_count(), 2);

        session.end_session(A, false).unwrap();
        assert!(session.is_active());
        assert_eq!(session.pending_count(), 1);
        let next = session.next_instance().unwrap();
        assert!(next == C1 || next == C2);
        // the finished instance went to the engine for disposal
        assert_eq!(session.engine().terminated, vec![A]);
    }

    #[test]
    fn error_end_with_stop_on_error_tears_down() {
        let mut session = fresh_session(true);
        session.start_session(A, Duration::ZERO).unwrap();
        session.engine_mut().pcs.insert(A, 0x1000);
        session.on_fork(A, &[C1, C2]).unwrap();

        session.end_session(A, true).unwrap();
        assert!(!session.is_active());
        assert!(!session.monitor().is_tracing());
        // both pending children were disposed, then the finished instance
        let terminated = &session.engine().terminated;
        assert_eq!(terminated.len(), 3);
        assert!(terminated.contains(&C1));
        assert!(terminated.contains(&C2));
        assert_eq!(terminated[2], A);
        assert!(!session.tracer.enabled);
        assert_eq!(session.tracer.toggles, 2);
    }

    #[test]
    fn error_end_without_stop_on_error_keeps_going() {
        let mut session = fresh_session(false);
        session.start_session(A, Duration::ZERO).unwrap();
        session.engine_mut().pcs.insert(A, 0x1000);
        session.on_fork(A, &[C1]).unwrap();

        session.end_session(A, true).unwrap();
        assert!(session.is_active());
        assert_eq!(session.next_instance().unwrap(), C1);
    }

    #[test]
    fn exhausted_pool_tears_down() {
        let mut session = fresh_session(false);
        session.start_session(A, Duration::ZERO).unwrap();
        session.end_session(A, false).unwrap();
        assert!(!session.is_active());
        assert_eq!(session.engine().terminated, vec![A]);
    }

    #[test]
    fn fork_streak_discounts_repeated_forks() {
        let mut session = fresh_session(true);
        session.start_session(A, Duration::ZERO).unwrap();

        session.engine_mut().pcs.insert(A, 0xbeef);
        session.on_fork(A, &[C1]).unwrap();
        assert!((session.pending_weight(C1).unwrap() - 1.0).abs() < f64::EPSILON);

        // the same counter forks again: the whole streak is discounted
        session.on_fork(A, &[C2]).unwrap();
        assert!((session.pending_weight(C1).unwrap() - 0.75).abs() < f64::EPSILON);
        assert!((session.pending_weight(C2).unwrap() - 0.75).abs() < f64::EPSILON);

        // a different counter starts a fresh streak at full weight
        session.engine_mut().pcs.insert(A, 0xcafe);
        session.on_fork(A, &[C3]).unwrap();
        assert!((session.pending_weight(C3).unwrap() - 1.0).abs() < f64::EPSILON);
        assert!((session.pending_weight(C1).unwrap() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn unplanned_kill_of_the_active_instance_advances_scheduling() {
        let mut session = fresh_session(true);
        session.start_session(A, Duration::ZERO).unwrap();
        session.engine_mut().pcs.insert(A, 0x1000);
        session.on_fork(A, &[C1]).unwrap();

        session.on_kill(A).unwrap();
        assert!(session.is_active());
        assert_eq!(session.next_instance().unwrap(), C1);
        // the engine killed it on its own; no termination request went back
        assert!(!session.engine().terminated.contains(&A));
    }

    #[test]
    fn self_initiated_kills_are_not_rescheduled() {
        let mut session = fresh_session(true);
        session.start_session(A, Duration::ZERO).unwrap();
        session.engine_mut().pcs.insert(A, 0x1000);
        session.on_fork(A, &[C1]).unwrap();
        session.end_session(A, false).unwrap();

        // the engine acknowledges the termination of the finished instance
        session.on_kill(A).unwrap();
        assert!(session.is_active());
        assert_eq!(session.next_instance().unwrap(), C1);
    }

    #[test]
    fn malformed_messages_leave_state_alone() {
        let mut session = fresh_session(true);
        assert!(session.handle_session_message(A, &[0_u8; 3]).is_err());
        assert!(!session.is_active());

        let start = SessionMessage::Start { max_time_secs: 0 }.to_bytes();
        session.handle_session_message(A, &start).unwrap();
        assert!(session.is_active());

        // an END pointing at unreadable result memory must not end the path
        let end = SessionMessage::End {
            is_error_path: false,
            result_ptr: 0x5000,
            result_size: 8,
        }
        .to_bytes();
        assert!(session.handle_session_message(A, &end).is_err());
        assert!(session.is_active());

        // short location updates are rejected as well
        assert!(session.handle_location_message(A, &[0_u8; 4]).is_err());
    }

    #[test]
    fn guest_messages_drive_a_whole_path() {
        let mut session = fresh_session(true);
        let start = SessionMessage::Start { max_time_secs: 100 }.to_bytes();
        session.handle_session_message(A, &start).unwrap();

        let msg = crate::protocol::LocationMessage {
            opcode: 7,
            frames: vec![0x10, 0x20],
        };
        session.handle_location_message(A, &msg.to_bytes()).unwrap();
        assert!(session.tree_divergence().is_some());
        assert!(session.cfg_divergence().is_some());

        // the guest leaves a result buffer behind and ends the path
        session
            .engine_mut()
            .write_memory(A, 0x5000, &[0x13, 0x37, 0, 0, 0, 0, 0, 0])
            .unwrap();
        let end = SessionMessage::End {
            is_error_path: false,
            result_ptr: 0x5000,
            result_size: 8,
        }
        .to_bytes();
        session.handle_session_message(A, &end).unwrap();
        // no pending instances: the search is exhausted
        assert!(!session.is_active());
    }

    #[test]
    fn path_timeout_counts_as_an_error_path() {
        let mut session = fresh_session(true);
        session.config.path_time_limit = Duration::ZERO;
        session.start_session(A, Duration::ZERO).unwrap();
        session.engine_mut().pcs.insert(A, 0x1000);
        session.on_fork(A, &[C1]).unwrap();

        // the per-path deadline has already passed; stop_on_error tears down
        session.on_timer().unwrap();
        assert!(!session.is_active());
        assert!(session.engine().terminated.contains(&C1));
    }

    #[test]
    fn session_deadline_disposes_the_active_instance() {
        let mut session = fresh_session(true);
        session.config.path_time_limit = Duration::from_secs(3600);
        session
            .start_session(A, Duration::from_nanos(1))
            .unwrap();
        session.on_timer().unwrap();
        assert!(!session.is_active());
        assert_eq!(session.engine().terminated, vec![A]);
    }

    #[test]
    fn next_instance_falls_back_outside_sessions() {
        let mut session = fresh_session(true);
        assert!(session.next_instance().is_err());
        session.register_instance(A);
        assert_eq!(session.next_instance().unwrap(), A);

        session.start_session(A, Duration::ZERO).unwrap();
        assert_eq!(session.next_instance().unwrap(), A);
    }
}
