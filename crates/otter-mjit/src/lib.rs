//! # Otter method JIT
//!
//! Compiles stack bytecode one function at a time into code for the Otter
//! abstract machine: inline fast paths behind type guards in one stream,
//! out-of-line syncs and generic stub calls in another, and patchable inline
//! caches for element access.
//!
//! ```text
//! Function ──analyze──► Compiler ──link──► CompiledCode ──publish──► PublishedCode
//!                         │  ▲                                         │
//!               FrameState│  │TypeOracle / LoopHoister                 ▼
//!              (slot types,  (type facts,                       Machine::run
//!               registers)    hoisted checks)                  (IC patching,
//!                                                               bailouts)
//! ```
//!
//! Environment overrides are read once, see [`JitConfig::from_env`].

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod analysis;
pub mod assembler;
pub mod bailout;
pub mod code;
pub mod compiler;
pub mod config;
mod elements;
mod fast_arith;
mod fastops;
pub mod frame;
pub mod ic;
pub mod machine;
pub mod oracle;
pub mod regs;
pub mod stubcc;
pub mod stubs;
mod type_guards;

pub use bailout::{BailoutAction, BailoutReason, BailoutState, BailoutTracker, DEOPT_THRESHOLD};
pub use code::{CompiledCode, PublishedCode, RejoinSite};
pub use compiler::{CompileEnv, JitCompiler, JitError, JitResult, OpLifecycle};
pub use config::JitConfig;
pub use ic::{ElementStub, IcId, IcKind, IcState};
pub use machine::{ExecError, ExecOutcome, ExecResult, ExecStats, Machine};
pub use oracle::{
    Container, HoistTable, LoopHoister, NoHoisting, NoTypeInfo, ObjectKind, OracleTable, TypeFlags, TypeOracle,
    TypeSet,
};
pub use stubs::StubKind;
