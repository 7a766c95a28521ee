/*!
Coverage-guided scheduling of concolic executions for interpreted programs.

A program running inside an interpreter, which itself runs inside a low-level
symbolic execution engine, exposes two layers of control flow. This crate
reconstructs the *interpreted* program's control flow from a stream of
low-level location updates, keeps a prefix tree of every interpreted path any
engine instance has taken, estimates how far each frontier is from uncovered
branch outcomes, and decides which forked instance the engine should resume
next, all under session and per-path time budgets.

The pieces, from the bottom up:

- [`selectors`]: pluggable strategies to pick one element from a dynamic pool
  (uniform, weighted roulette, two-level class selection).
- [`cfg`]: the incrementally grown control flow graph over interpreted-program
  locations, with basic block extraction, dominators, branch-opcode
  classification and distance-to-uncovered estimation.
- [`tree`]: the execution prefix tree and the physical fork ancestry tree.
- [`monitor`]: the [`monitor::InterpreterMonitor`] that turns engine
  fork/switch/kill notifications and guest location updates into tree and CFG
  growth.
- [`session`]: the [`session::ConcolicSession`] orchestrator that owns the
  pending-instance pool, deadlines and reports, and answers the engine's
  "which instance runs next" question.

The low-level engine itself stays behind the capability traits in [`engine`];
the guest communicates over the fixed-layout messages in [`protocol`].
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]
#![cfg_attr(
    debug_assertions,
    warn(
        missing_debug_implementations,
        missing_docs,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications
    )
)]
#![cfg_attr(
    not(debug_assertions),
    deny(
        missing_debug_implementations,
        missing_docs,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
        unused_must_use
    )
)]

pub mod cfg;
pub mod engine;
pub mod monitor;
pub mod protocol;
pub mod report;
pub mod selectors;
pub mod session;
pub mod tree;

pub use cfg::{HighLevelCfg, HighLevelPc, InstrId};
pub use engine::{ExecutionEngine, InstanceId, TracerHooks};
/// Re-export of the error type used throughout this crate.
pub use libafl_bolts::Error;
pub use monitor::InterpreterMonitor;
pub use session::{ConcolicSession, SessionConfig};
