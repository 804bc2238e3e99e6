//! Breakpoint transparency on both architecture families.

#![allow(missing_docs)]
#![allow(clippy::unreadable_literal)]

use std::sync::{Arc, Mutex};
use tether_core::sim::StopCause;
use tether_core::{
    strategy_for, CoreControl, HaltReason, MemoryManager, SimCore, StepCoordinator, TargetArch, TargetState,
};

const SCRATCH: u64 = 0xf000;

type Seen = Arc<Mutex<Vec<TargetState>>>;

fn coordinator(arch: TargetArch, load: u64, program: &[u8], pc: u64) -> (StepCoordinator<SimCore>, Seen) {
    let mut core = SimCore::new(arch);
    core.load(load, program);
    core.set_pc(pc);
    let mut coordinator = StepCoordinator::new(core, arch, strategy_for(arch, SCRATCH));
    coordinator.open().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    coordinator.register_state_change_callback(Box::new(move |state| {
        sink.lock().unwrap().push(state);
        true
    }));
    (coordinator, seen)
}

fn arm_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

const ARM_NOP: u32 = 0xe1a0_0000; // mov r0, r0
const ARM_SPIN: u32 = 0xeaff_fffe; // b .

#[test]
fn test_x86_step_over_lands_on_next_breakpoint() {
    // 0x100: jmp short 0x104; 0x104: nop; 0x105: spin
    let (mut engine, seen) =
        coordinator(TargetArch::X86, 0x100, &[0xeb, 0x02, 0x90, 0x90, 0x90, 0xeb, 0xfe], 0x100);
    engine.set_break(0x100).unwrap();
    engine.set_break(0x104).unwrap();

    engine.run().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Halted);
    assert_eq!(engine.core().pc(), 0x104);
    assert_eq!(engine.last_halt_reason(), Some(HaltReason::Breakpoint));
    // One run, one halt: the step over 0x100 is invisible.
    assert_eq!(*seen.lock().unwrap(), vec![TargetState::Running, TargetState::Halted]);
    assert_eq!(engine.core().memory(0x100, 1), &[0xeb]);
}

#[test]
fn test_x86_step_over_then_free_run_never_halts_at_origin() {
    // 0x100: jmp short 0x104; 0x104: spin
    let (mut engine, seen) = coordinator(TargetArch::X86, 0x100, &[0xeb, 0x02, 0x90, 0x90, 0xeb, 0xfe], 0x100);
    engine.set_break(0x100).unwrap();

    engine.run().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Running);
    assert_eq!(engine.get_status().unwrap(), TargetState::Running);
    assert_eq!(engine.installed(), &[0x100]);

    engine.halt().unwrap();
    assert_eq!(engine.reported_state(), TargetState::Halted);
    assert_eq!(engine.last_halt_reason(), Some(HaltReason::DebugRequest));
    assert_eq!(MemoryManager::read_pc(&mut engine, TargetArch::X86).unwrap(), 0x104);
    assert_eq!(*seen.lock().unwrap(), vec![TargetState::Running, TargetState::Halted]);
    assert!(engine.installed().is_empty());
}

#[test]
fn test_x86_call_is_relocated_with_its_return_address() {
    // 0x100: call 0x200; 0x105: spin; 0x200: ret
    let mut program = vec![0u8; 0x101];
    program[..5].copy_from_slice(&[0xe8, 0xfb, 0x00, 0x00, 0x00]);
    program[5..7].copy_from_slice(&[0xeb, 0xfe]);
    program[0x100] = 0xc3;
    let (mut engine, _) = coordinator(TargetArch::X86, 0x100, &program, 0x100);
    engine.set_break(0x100).unwrap();
    engine.set_break(0x105).unwrap();

    engine.run().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Halted);
    assert_eq!(engine.core().pc(), 0x105);
    assert_eq!(engine.last_halt_reason(), Some(HaltReason::Breakpoint));
}

#[test]
fn test_arm7_mismatch_step_is_hidden() {
    // 0x0: nop; 0x4: nop; 0x8: nop (breakpoint); 0xc: spin
    let program = arm_words(&[ARM_NOP, ARM_NOP, ARM_NOP, ARM_SPIN]);
    let (mut engine, seen) = coordinator(TargetArch::Arm7, 0, &program, 0);
    engine.set_break(0x0).unwrap();
    engine.set_break(0x8).unwrap();

    engine.run().unwrap();
    // First poll: the mismatch unit stops the core at 0x4, the engine resumes.
    // Second poll: the genuine breakpoint at 0x8.
    let mut state = engine.get_status().unwrap();
    if state == TargetState::Running {
        state = engine.get_status().unwrap();
    }
    assert_eq!(state, TargetState::Halted);
    assert_eq!(engine.core().pc(), 0x8);
    assert_eq!(engine.core().last_stop(), Some(StopCause::Breakpoint));
    assert_eq!(engine.last_halt_reason(), Some(HaltReason::Breakpoint));
    assert_eq!(*seen.lock().unwrap(), vec![TargetState::Running, TargetState::Halted]);
    // The mismatch unit was handed back.
    assert_eq!(engine.core().eice_unit(0), tether_core::sim::SimEiceUnit::default());
}

#[test]
fn test_arm7_step_onto_adjacent_breakpoint_reports_it() {
    let program = arm_words(&[ARM_NOP, ARM_NOP, ARM_SPIN]);
    let (mut engine, seen) = coordinator(TargetArch::Arm7, 0, &program, 0);
    engine.set_break(0x0).unwrap();
    engine.set_break(0x4).unwrap();

    engine.run().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Halted);
    assert_eq!(engine.core().pc(), 0x4);
    assert!(matches!(engine.core().last_stop(), Some(StopCause::EiceUnit(_))));
    assert_eq!(engine.last_halt_reason(), Some(HaltReason::Breakpoint));
    assert_eq!(*seen.lock().unwrap(), vec![TargetState::Running, TargetState::Halted]);
}

#[test]
fn test_arm7_halt_request_is_a_debug_request() {
    let program = arm_words(&[ARM_NOP, ARM_SPIN]);
    let (mut engine, _) = coordinator(TargetArch::Arm7, 0, &program, 0);
    engine.set_break(0x40).unwrap();

    engine.run().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Running);
    engine.halt().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Halted);
    assert_eq!(engine.core().pc(), 0x4);
    assert_eq!(engine.last_halt_reason(), Some(HaltReason::DebugRequest));
}

#[test]
fn test_single_step_from_breakpoint_executes_original_instruction() {
    // mov eax, 0x12345678 under a breakpoint
    let (mut engine, _) = coordinator(TargetArch::X86, 0x100, &[0xb8, 0x78, 0x56, 0x34, 0x12, 0x90], 0x100);
    engine.set_break(0x100).unwrap();

    engine.insn_step().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Halted);
    assert_eq!(engine.last_halt_reason(), Some(HaltReason::StepComplete));
    assert_eq!(engine.core().pc(), 0x105);
    assert_eq!(engine.core().register(0), 0x1234_5678);
}

#[test]
fn test_close_then_reopen_starts_from_a_clean_slate() {
    let (mut engine, seen) = coordinator(TargetArch::X86, 0, &[0xeb, 0xfe], 0);
    engine.set_break(0x0).unwrap();
    engine.run().unwrap();
    engine.close().unwrap();
    assert!(!engine.is_connected());
    assert!(engine.installed().is_empty());
    // Closing is silent.
    assert_eq!(*seen.lock().unwrap(), vec![TargetState::Running]);

    engine.open().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Halted);
}

#[test]
fn test_arm7_close_during_step_over_releases_the_mismatch_unit() {
    let program = arm_words(&[ARM_NOP, ARM_NOP, ARM_NOP, ARM_SPIN]);
    let (mut engine, seen) = coordinator(TargetArch::Arm7, 0, &program, 0);
    engine.set_break(0x0).unwrap();

    // The core has not executed yet, so the step over is still pending.
    engine.run().unwrap();
    engine.close().unwrap();
    assert_eq!(engine.core().eice_unit(0), tether_core::sim::SimEiceUnit::default());

    engine.open().unwrap();
    engine.run().unwrap();
    assert_eq!(engine.get_status().unwrap(), TargetState::Running);
    assert_eq!(engine.last_halt_reason(), None);
    assert_eq!(engine.installed(), &[0x0]);
    for unit in 0..2 {
        assert_eq!(engine.core().eice_unit(unit), tether_core::sim::SimEiceUnit::default());
    }
    assert_eq!(
        *seen.lock().unwrap(),
        vec![TargetState::Running, TargetState::Halted, TargetState::Running]
    );
}
