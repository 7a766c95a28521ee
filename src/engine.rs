//! Capability interfaces consumed from the low-level execution engine.
//!
//! The engine and its constraint machinery stay outside this crate. Everything
//! the scheduler needs from them is expressed as a trait here and injected at
//! construction, so a session never reaches for ambient global state to find
//! its collaborators.

use core::fmt;

use libafl_bolts::Error;
use serde::{Deserialize, Serialize};

/// Identifier of one engine-level execution instance.
///
/// The engine may fork an instance into many at any point; each fork product
/// gets its own id. Ids are engine-assigned and opaque to the scheduler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance #{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A virtual address inside an engine instance's guest memory.
pub type VmAddr = u64;

/// Concrete bytes assigned to every symbolic variable of a finished run.
pub type InputAssignment = Vec<(String, Vec<u8>)>;

/// What the scheduler consumes from the engine, per instance.
///
/// Implementations are expected to be handles into the engine rather than the
/// engine itself; all calls are synchronous and are only made from within an
/// engine notification or a guest message, so no reentrancy occurs.
pub trait ExecutionEngine {
    /// Read guest memory at a virtual address.
    fn read_memory(
        &mut self,
        instance: InstanceId,
        addr: VmAddr,
        buf: &mut [u8],
    ) -> Result<(), Error>;

    /// Write guest memory at a virtual address.
    fn write_memory(&mut self, instance: InstanceId, addr: VmAddr, buf: &[u8])
        -> Result<(), Error>;

    /// The instance's current low-level program counter.
    fn program_counter(&mut self, instance: InstanceId) -> u64;

    /// The guest pid backing the instance.
    fn instance_pid(&mut self, instance: InstanceId) -> u32;

    /// Request immediate disposal of an instance. The engine acknowledges by
    /// delivering a kill notification once the instance is gone.
    fn terminate_instance(&mut self, instance: InstanceId, reason: &str) -> Result<(), Error>;

    /// Drop path constraints and symbolic bookkeeping the instance may have
    /// accumulated in earlier, unrelated runs.
    fn reset_symbolic_state(&mut self, instance: InstanceId);

    /// Concretize the instance's symbolic variables into the assignment that
    /// drove the finished run.
    fn input_assignment(&mut self, instance: InstanceId) -> Result<InputAssignment, Error>;
}

/// Low-level tracing aids that accompany a session (instruction tracers,
/// branch log writers and the like). Toggled as a unit when a session starts
/// and ends.
pub trait TracerHooks {
    /// Enable the attached tracers.
    fn enable(&mut self);
    /// Disable the attached tracers.
    fn disable(&mut self);
}

/// Hooks for embeddings that carry no low-level tracers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopTracerHooks;

impl TracerHooks for NopTracerHooks {
    fn enable(&mut self) {}
    fn disable(&mut self) {}
}
