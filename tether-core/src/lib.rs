//! Tether Core - target debug engine.
//!
//! Drives a target core controller over a line-oriented wire protocol,
//! tracks the target's execution state, and runs or steps the core as if
//! software and hardware breakpoints were transparent.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::significant_drop_tightening)]

/// Target architecture families.
pub mod arch;
/// Engine configuration.
pub mod config;
/// The Core Control operations.
pub mod control;
/// Controller side of the wire protocol.
pub mod controller;
/// Breakpoint management and step-over.
pub mod debug;
/// Instruction decoding.
pub mod disasm;
/// Errors and wire status codes.
pub mod error;
/// Chunked memory transfers.
pub mod memory;
/// Native debug monitor thread.
pub mod monitor;
/// probe-rs hardware backend.
#[cfg(feature = "hardware")]
pub mod probe;
/// Engine side of the wire protocol.
pub mod session;
/// Simulated target core.
pub mod sim;
/// Target state and observers.
pub mod state;
/// Wire protocol grammar.
pub mod wire;

// Re-export commonly used types
pub use arch::TargetArch;
pub use config::{EngineConfig, SessionConfig};
pub use control::{CoreControl, RegisterMask};
pub use controller::Controller;
pub use debug::{strategy_for, BreakpointTable, HaltReason, StepCoordinator, StepOverStrategy};
pub use disasm::DisassemblyManager;
pub use error::{Error, Result, StatusCode};
pub use memory::MemoryManager;
pub use monitor::{DebugEventSource, MonitorThread};
#[cfg(feature = "hardware")]
pub use probe::{ProbeCore, ProbeInfo, ProbeManager, ProbeType};
pub use session::{attach, Session, Transport};
pub use sim::SimCore;
pub use state::{Observer, ObserverHandle, TargetState};
