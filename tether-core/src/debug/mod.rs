//! Debug control module.
//!
//! The [`StepCoordinator`] wraps any [`CoreControl`] backend and keeps
//! breakpoints invisible to the program being debugged: table breakpoints
//! are written to the target right before it resumes and removed as soon as
//! it halts. Resuming from an address that carries a breakpoint is delegated
//! to a per-architecture [`StepOverStrategy`].

/// ARM7 EmbeddedICE step-over.
pub mod arm7;
/// The software breakpoint table.
pub mod breakpoint;
/// x86 step-over by instruction relocation.
pub mod x86;

pub use arm7::Arm7Eice;
pub use breakpoint::{Breakpoint, BreakpointTable};
pub use x86::X86Relocation;

use crate::arch::TargetArch;
use crate::control::{CoreControl, RegisterMask};
use crate::error::{Error, Result, StatusCode};
use crate::memory::MemoryManager;
use crate::state::{Observer, ObserverHandle, ObserverStack, TargetState};
use crossbeam_channel::Receiver;
use std::fmt;

/// Why the target stopped, as far as the engine can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Stopped at a breakpoint in the table.
    Breakpoint,
    /// A watchpoint unit matched a data access.
    Watchpoint,
    /// Stopped because a halt was requested.
    DebugRequest,
    /// A single step finished.
    StepComplete,
    /// None of the above could be established.
    Unknown,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HaltReason::Breakpoint => "breakpoint",
            HaltReason::Watchpoint => "watchpoint",
            HaltReason::DebugRequest => "debug request",
            HaltReason::StepComplete => "step complete",
            HaltReason::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// How a strategy prepared the core to leave a breakpointed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOverPlan {
    /// The pc now points at a relocated copy of the instruction that jumps
    /// back into normal flow. Install breakpoints and run.
    Relocated,
    /// Execute one instruction with breakpoints removed, then resume.
    SingleStep,
    /// The core will halt by itself after one instruction; run it with
    /// breakpoints removed, then resume.
    RunArmed,
}

/// Architecture-specific part of the step-over algorithm.
pub trait StepOverStrategy {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Prepares the core, halted at the breakpointed address `pc`, to
    /// execute the original instruction there exactly once.
    fn step_over(&mut self, core: &mut dyn CoreControl, pc: u64) -> Result<StepOverPlan>;

    /// Releases whatever [`step_over`](Self::step_over) claimed.
    fn finish_step_over(&mut self, _core: &mut dyn CoreControl) -> Result<()> {
        Ok(())
    }

    /// Called right before a halt request is sent to the core.
    fn note_halt_request(&mut self) {}

    /// Classifies a halt at `pc`. Breakpoints win over halt requests.
    fn classify_halt(&mut self, pc: u64, table: &BreakpointTable, halt_requested: bool) -> HaltReason {
        if table.find(pc).is_some() {
            HaltReason::Breakpoint
        } else if halt_requested {
            HaltReason::DebugRequest
        } else {
            HaltReason::Unknown
        }
    }
}

/// The strategy for an architecture family.
pub fn strategy_for(arch: TargetArch, scratch_address: u64) -> Box<dyn StepOverStrategy + Send> {
    match arch {
        TargetArch::X86 => Box::new(X86Relocation::new(scratch_address)),
        TargetArch::Arm7 => Box::new(Arm7Eice::new()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Running,
    Stepping,
    SteppingOver { from: u64 },
}

/// Runs and steps a core as if breakpoints did not perturb execution.
pub struct StepCoordinator<C: CoreControl> {
    core: C,
    arch: TargetArch,
    strategy: Box<dyn StepOverStrategy + Send>,
    table: BreakpointTable,
    /// Breakpoints currently written to the target, in install order.
    installed: Vec<u64>,
    mode: Mode,
    transitions: Receiver<TargetState>,
    inner_handle: ObserverHandle,
    observers: ObserverStack,
    reported: TargetState,
    last_halt: Option<HaltReason>,
    halt_requested: bool,
    poisoned: bool,
}

impl<C: CoreControl> StepCoordinator<C> {
    /// Wraps `core`, which must not be shared with other callers.
    pub fn new(mut core: C, arch: TargetArch, strategy: Box<dyn StepOverStrategy + Send>) -> Self {
        let (tx, transitions) = crossbeam_channel::unbounded();
        // Everything the core reports goes through the coordinator first.
        let inner_handle = core.register_state_change_callback(Box::new(move |state| {
            let _ = tx.send(state);
            false
        }));
        log::debug!("step coordinator for {arch} using {}", strategy.name());
        Self {
            core,
            arch,
            strategy,
            table: BreakpointTable::new(),
            installed: Vec::new(),
            mode: Mode::Idle,
            transitions,
            inner_handle,
            observers: ObserverStack::new(),
            reported: TargetState::Dead,
            last_halt: None,
            halt_requested: false,
            poisoned: false,
        }
    }

    /// Detaches from the core and hands it back.
    pub fn into_inner(mut self) -> C {
        self.core.unregister_state_change_callback(self.inner_handle);
        self.core
    }

    /// The wrapped core.
    pub fn core(&self) -> &C {
        &self.core
    }

    /// The wrapped core, bypassing breakpoint management.
    pub fn core_mut(&mut self) -> &mut C {
        &mut self.core
    }

    /// Architecture family of the wrapped core.
    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    /// Breakpoints the program is debugged with.
    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.table
    }

    /// Addresses that currently carry a physical breakpoint.
    pub fn installed(&self) -> &[u64] {
        &self.installed
    }

    /// Reason for the most recent halt reported to observers.
    pub fn last_halt_reason(&self) -> Option<HaltReason> {
        self.last_halt
    }

    /// Whether a failed install or removal left the target in an unknown
    /// breakpoint state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// The target state as observers last saw it.
    pub fn reported_state(&self) -> TargetState {
        self.reported
    }

    fn ensure_usable(&self, operation: &'static str) -> Result<()> {
        if self.poisoned {
            return Err(Error::Core {
                operation,
                address: None,
                status: StatusCode::TargetAccessError,
                hint: Some("breakpoint state of the target is indeterminate".into()),
            });
        }
        Ok(())
    }

    fn ensure_halted(&self, operation: &'static str, address: Option<u64>) -> Result<()> {
        if self.mode == Mode::Idle {
            Ok(())
        } else {
            Err(Error::core(operation, address, StatusCode::ResourceUnavailableWhileTargetRunning))
        }
    }

    fn poison(&mut self, operation: &'static str, address: u64, source: Error) -> Error {
        log::warn!("breakpoint {operation} at {address:#010x} failed, giving up on the target: {source}");
        self.poisoned = true;
        Error::Core {
            operation,
            address: Some(address),
            status: StatusCode::TargetAccessError,
            hint: Some(source.to_string()),
        }
    }

    fn install_all(&mut self) -> Result<()> {
        for address in self.table.list() {
            if self.installed.contains(&address) {
                continue;
            }
            match self.core.set_break(address) {
                Ok(()) => {
                    log::debug!("installed breakpoint at {address:#010x}");
                    self.installed.push(address);
                }
                Err(e) if e.status() == StatusCode::BkptAlreadySetAtAddr => {
                    log::warn!("{address:#010x} already carries a breakpoint the engine did not set");
                    self.uninstall_all()?;
                    return Err(Error::BreakpointAlreadySet(address));
                }
                Err(e) => return Err(self.poison("install breakpoint", address, e)),
            }
        }
        Ok(())
    }

    fn uninstall_all(&mut self) -> Result<()> {
        while let Some(address) = self.installed.pop() {
            if let Err(e) = self.core.clear_break(address) {
                return Err(self.poison("remove breakpoint", address, e));
            }
            log::debug!("removed breakpoint at {address:#010x}");
        }
        Ok(())
    }

    fn read_pc(&mut self) -> Result<u64> {
        MemoryManager::read_pc(&mut self.core, self.arch)
    }

    /// Forwards a state to outer observers if it differs from the last one
    /// they saw.
    fn report(&mut self, state: TargetState) {
        if state != self.reported {
            self.reported = state;
            self.observers.dispatch(state);
        }
    }

    fn finish(&mut self, reason: HaltReason) {
        log::debug!("target halted: {reason}");
        self.last_halt = Some(reason);
        self.halt_requested = false;
        self.report(TargetState::Halted);
    }

    /// Handles every transition the core reported since the last call.
    fn process(&mut self) -> Result<()> {
        while let Ok(state) = self.transitions.try_recv() {
            match state {
                TargetState::Running => self.report(TargetState::Running),
                TargetState::Halted => self.on_halt()?,
                TargetState::Dead => {
                    self.abandon_step_over();
                    self.mode = Mode::Idle;
                    self.installed.clear();
                    self.report(TargetState::Dead);
                }
            }
        }
        Ok(())
    }

    fn on_halt(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Idle => self.report(TargetState::Halted),
            Mode::Stepping => self.finish(HaltReason::StepComplete),
            Mode::Running => {
                self.uninstall_all()?;
                let pc = self.read_pc()?;
                let reason = self.strategy.classify_halt(pc, &self.table, self.halt_requested);
                self.finish(reason);
            }
            Mode::SteppingOver { from } => {
                if let Err(e) = self.strategy.finish_step_over(&mut self.core) {
                    return Err(self.poison("finish step over", from, e));
                }
                let pc = self.read_pc()?;
                if self.halt_requested || self.table.find(pc).is_some() {
                    let reason = self.strategy.classify_halt(pc, &self.table, self.halt_requested);
                    self.finish(reason);
                } else {
                    log::debug!("stepped over breakpoint at {from:#010x}, resuming at {pc:#010x}");
                    self.resume()?;
                }
            }
        }
        Ok(())
    }

    /// Releases a step-over that will never see its halt. The core may
    /// already be gone, so failures are only logged.
    fn abandon_step_over(&mut self) {
        if let Mode::SteppingOver { from } = self.mode {
            if let Err(e) = self.strategy.finish_step_over(&mut self.core) {
                log::warn!("abandoned step over at {from:#010x}: {e}");
            }
        }
    }

    /// Installs breakpoints and lets the core run freely.
    fn resume(&mut self) -> Result<()> {
        self.install_all()?;
        self.mode = Mode::Running;
        if let Err(e) = self.core.run() {
            self.mode = Mode::Idle;
            return Err(e);
        }
        Ok(())
    }

    fn step_over(&mut self, pc: u64) -> Result<()> {
        let plan = self.strategy.step_over(&mut self.core, pc)?;
        log::debug!("stepping over breakpoint at {pc:#010x}: {plan:?}");
        let started = match plan {
            StepOverPlan::Relocated => {
                return self.resume().map_err(|e| {
                    // Never leave the pc inside the scratch area.
                    if let Err(restore) = MemoryManager::write_pc(&mut self.core, self.arch, pc) {
                        log::warn!("could not move the pc back to {pc:#010x}: {restore}");
                    }
                    e
                });
            }
            StepOverPlan::SingleStep => {
                self.mode = Mode::SteppingOver { from: pc };
                self.core.insn_step()
            }
            StepOverPlan::RunArmed => {
                self.mode = Mode::SteppingOver { from: pc };
                self.core.run()
            }
        };
        if let Err(e) = started {
            self.mode = Mode::Idle;
            // Best effort: the core may already be gone.
            let _ = self.strategy.finish_step_over(&mut self.core);
            return Err(e);
        }
        Ok(())
    }
}

impl<C: CoreControl> CoreControl for StepCoordinator<C> {
    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn open(&mut self) -> Result<()> {
        self.core.open()?;
        self.process()
    }

    fn close(&mut self) -> Result<()> {
        if self.core.is_connected() && self.mode == Mode::Idle {
            self.uninstall_all()?;
        }
        self.abandon_step_over();
        self.installed.clear();
        self.mode = Mode::Idle;
        self.reported = TargetState::Dead;
        // Stale transitions from before the close are meaningless now.
        while self.transitions.try_recv().is_ok() {}
        self.core.close()
    }

    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_usable("mem_read")?;
        self.core.mem_read(address, buf)
    }

    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.ensure_usable("mem_write")?;
        self.core.mem_write(address, data)
    }

    fn reg_read(&mut self, mask: RegisterMask) -> Result<Vec<u64>> {
        self.ensure_usable("reg_read")?;
        self.core.reg_read(mask)
    }

    fn reg_write(&mut self, mask: RegisterMask, values: &[u64]) -> Result<()> {
        self.ensure_usable("reg_write")?;
        self.core.reg_write(mask, values)
    }

    fn cop_read(&mut self, coprocessor: u32, register: u32) -> Result<u64> {
        self.ensure_usable("cop_read")?;
        self.core.cop_read(coprocessor, register)
    }

    fn cop_write(&mut self, coprocessor: u32, register: u32, value: u64) -> Result<()> {
        self.ensure_usable("cop_write")?;
        self.core.cop_write(coprocessor, register, value)
    }

    fn set_break(&mut self, address: u64) -> Result<()> {
        self.ensure_usable("set_break")?;
        self.ensure_halted("set_break", Some(address))?;
        self.table.insert(address)?;
        Ok(())
    }

    fn clear_break(&mut self, address: u64) -> Result<()> {
        self.ensure_usable("clear_break")?;
        self.ensure_halted("clear_break", Some(address))?;
        self.table.remove(address)?;
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        self.ensure_usable("run")?;
        if self.mode != Mode::Idle {
            return Ok(());
        }
        self.halt_requested = false;
        self.last_halt = None;
        let pc = self.read_pc()?;
        if self.table.find(pc).is_some() {
            self.step_over(pc)?;
        } else {
            self.resume()?;
        }
        self.process()
    }

    fn halt(&mut self) -> Result<()> {
        self.ensure_usable("halt")?;
        self.halt_requested = true;
        self.strategy.note_halt_request();
        self.core.halt()?;
        self.process()
    }

    fn insn_step(&mut self) -> Result<()> {
        self.ensure_usable("insn_step")?;
        self.ensure_halted("insn_step", None)?;
        self.last_halt = None;
        self.mode = Mode::Stepping;
        if let Err(e) = self.core.insn_step() {
            self.mode = Mode::Idle;
            return Err(e);
        }
        self.process()
    }

    fn io_ctl(&mut self, request: &[u64]) -> Result<Vec<u64>> {
        self.ensure_usable("io_ctl")?;
        self.core.io_ctl(request)
    }

    fn get_status(&mut self) -> Result<TargetState> {
        self.ensure_usable("get_status")?;
        self.core.get_status()?;
        self.process()?;
        Ok(self.reported)
    }

    fn register_state_change_callback(&mut self, observer: Observer) -> ObserverHandle {
        self.observers.register(observer)
    }

    fn unregister_state_change_callback(&mut self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }
}
