mod common;

use common::*;
use ember_cpu_core::state::{gpr, CR0_PE, DR6_BS, FLAG_IF, FLAG_OF, FLAG_TF, FLAG_ZF};
use ember_cpu_core::StepOutcome;
use ember_mmu::MemoryBus;
use ember_x86::SegReg;

#[test]
fn divide_by_zero_reports_faulting_instruction() {
    // xor ecx, ecx; div ecx
    let mut cpu = protected_mode(&[0x31, 0xc9, 0xf7, 0xf1]);
    set_gate(&mut cpu, 0, HANDLER_BASE);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(0));

    assert_eq!(cpu.state.eip, HANDLER_BASE);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(esp, KERNEL_STACK_TOP - 12);
    assert_eq!(read_u32(&mut cpu, esp), CODE_BASE + 2);
    assert_eq!(read_u32(&mut cpu, esp + 4), u32::from(KERNEL_CS));
    assert_ne!(read_u32(&mut cpu, esp + 8) & FLAG_ZF, 0);
}

#[test]
fn data_segment_limit_raises_gp_zero() {
    // mov eax, [0x100]
    let mut cpu = protected_mode(&[0xa1, 0x00, 0x01, 0x00, 0x00]);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    limit_segment(&mut cpu, SegReg::Ds, 0xff);
    cpu.state.gpr[gpr::EAX] = 0x1234_5678;

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    assert_eq!(cpu.state.gpr[gpr::EAX], 0x1234_5678);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(esp, KERNEL_STACK_TOP - 16);
    assert_eq!(read_u32(&mut cpu, esp), 0);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
}

#[test]
fn access_within_limit_succeeds() {
    // mov eax, [0xfc]
    let mut cpu = protected_mode(&[0xa1, 0xfc, 0x00, 0x00, 0x00]);
    limit_segment(&mut cpu, SegReg::Ds, 0xff);
    cpu.bus.write_u32(0xfc, 0xcafe_f00d);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.state.gpr[gpr::EAX], 0xcafe_f00d);
}

#[test]
fn stack_segment_limit_raises_ss_zero() {
    // mov eax, [ebp+0]
    let mut cpu = protected_mode(&[0x8b, 0x45, 0x00]);
    set_gate(&mut cpu, 12, HANDLER_BASE);
    limit_segment(&mut cpu, SegReg::Ss, 0xffff);
    cpu.state.gpr[gpr::EBP] = 0x2_0000;

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(12));
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), 0);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
}

#[test]
fn cli_at_user_privilege_faults_onto_kernel_stack() {
    let mut cpu = protected_mode(&[0xfa]);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    enter_user_mode(&mut cpu, 0x7000);
    cpu.state.eflags |= FLAG_IF;

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    assert_eq!(cpu.state.cpl(), 0);
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, KERNEL_CS);
    assert_eq!(cpu.state.seg(SegReg::Ss).selector, KERNEL_DS);
    assert!(!cpu.state.flag(FLAG_IF));

    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(esp, KERNEL_STACK_TOP - 24);
    assert_eq!(read_u32(&mut cpu, esp), 0);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
    assert_eq!(read_u32(&mut cpu, esp + 8), u32::from(USER_CS));
    assert_ne!(read_u32(&mut cpu, esp + 12) & FLAG_IF, 0);
    assert_eq!(read_u32(&mut cpu, esp + 16), 0x7000);
    assert_eq!(read_u32(&mut cpu, esp + 20), u32::from(USER_DS));
}

#[test]
fn hlt_outside_ring_zero_faults() {
    let mut cpu = protected_mode(&[0xf4]);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    enter_user_mode(&mut cpu, 0x7000);

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    assert!(!cpu.state.halted);
}

#[test]
fn software_interrupt_through_privileged_gate_faults() {
    // int 0x80
    let mut cpu = protected_mode(&[0xcd, 0x80]);
    set_gate(&mut cpu, 0x80, HANDLER_BASE + 0x100);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    enter_user_mode(&mut cpu, 0x7000);

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), 0x80 * 8 + 2);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
}

#[test]
fn int3_through_privileged_gate_raises_gp_not_double_fault() {
    let mut cpu = protected_mode(&[0xcc]);
    set_gate(&mut cpu, 3, HANDLER_BASE + 0x100);
    set_gate(&mut cpu, 8, HANDLER_BASE + 0x200);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    enter_user_mode(&mut cpu, 0x7000);

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    assert_eq!(cpu.state.eip, HANDLER_BASE);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), 3 * 8 + 2);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
}

#[test]
fn into_through_privileged_gate_raises_gp_not_double_fault() {
    let mut cpu = protected_mode(&[0xce]);
    set_gate(&mut cpu, 4, HANDLER_BASE + 0x100);
    set_gate(&mut cpu, 8, HANDLER_BASE + 0x200);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    enter_user_mode(&mut cpu, 0x7000);
    cpu.state.eflags |= FLAG_OF;

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), 4 * 8 + 2);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
}

#[test]
fn int3_through_user_gate_reports_next_instruction() {
    let mut cpu = protected_mode(&[0xcc]);
    write_u64(
        &mut cpu,
        IDT_BASE + 3 * 8,
        interrupt_gate(KERNEL_CS, HANDLER_BASE, 3),
    );
    enter_user_mode(&mut cpu, 0x7000);

    assert_eq!(cpu.step().unwrap(), StepOutcome::SoftwareInterrupt(3));
    assert_eq!(cpu.state.cpl(), 0);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), CODE_BASE + 1);
}

#[test]
fn user_load_of_kernel_data_selector_faults() {
    let code = [
        0x66, 0xb8, 0x10, 0x00, // mov ax, 0x10
        0x8e, 0xd8, // mov ds, ax
    ];
    let mut cpu = protected_mode(&code);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    enter_user_mode(&mut cpu, 0x7000);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    assert_eq!(cpu.state.seg(SegReg::Ds).selector, USER_DS);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), u32::from(KERNEL_DS));
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE + 4);
}

#[test]
fn raising_rpl_does_not_open_a_kernel_data_segment() {
    let code = [
        0x66, 0xb8, 0x13, 0x00, // mov ax, 0x13
        0x8e, 0xc0, // mov es, ax
    ];
    let mut cpu = protected_mode(&code);
    set_gate(&mut cpu, 13, HANDLER_BASE);
    enter_user_mode(&mut cpu, 0x7000);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(13));
    assert_eq!(cpu.state.seg(SegReg::Es).selector, USER_DS);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), u32::from(KERNEL_DS));
}

#[test]
fn software_interrupt_pushes_next_instruction() {
    // int 0x21
    let mut cpu = protected_mode(&[0xcd, 0x21]);
    set_gate(&mut cpu, 0x21, HANDLER_BASE);

    assert_eq!(cpu.step().unwrap(), StepOutcome::SoftwareInterrupt(0x21));
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(esp, KERNEL_STACK_TOP - 12);
    assert_eq!(read_u32(&mut cpu, esp), CODE_BASE + 2);
}

#[test]
fn fault_while_delivering_escalates_to_double_fault() {
    // ud2, with no #UD gate installed
    let mut cpu = protected_mode(&[0x0f, 0x0b]);
    set_gate(&mut cpu, 8, HANDLER_BASE);

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(8));
    assert_eq!(cpu.state.eip, HANDLER_BASE);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), 0);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
}

#[test]
fn triple_fault_resets_but_keeps_time() {
    let mut cpu = protected_mode(&[0x0f, 0x0b]);
    cpu.state.idtr.limit = 0;
    cpu.advance_ticks(100);
    cpu.time.schedule_interrupt(500, 0x30);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Reset);
    assert_eq!(cpu.state.eip, 0xfff0);
    assert_eq!(cpu.state.seg(SegReg::Cs).base, 0xffff_0000);
    assert_eq!(cpu.state.cr0 & CR0_PE, 0);
    assert_eq!(cpu.mmu.cr0(), cpu.state.cr0);
    assert_eq!(cpu.time.ticks(), 101);
    assert_eq!(cpu.time.pending_deadlines(), 1);
}

#[test]
fn invalid_opcode_in_real_mode_uses_ivt() {
    let mut cpu = real_mode(&[0x0f, 0x0b]);
    set_ivt(&mut cpu, 6, 0x600);

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(6));
    assert_eq!(cpu.state.eip, 0x600);
    let sp = cpu.state.gpr[gpr::ESP];
    assert_eq!(sp, REAL_STACK_TOP - 6);
    assert_eq!(read_u16(&mut cpu, sp), REAL_CODE as u16);
}

#[test]
fn single_step_traps_after_instruction() {
    let mut cpu = real_mode(&[0x90]);
    set_ivt(&mut cpu, 1, 0x500);
    cpu.state.eflags |= FLAG_TF;

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(1));
    assert_ne!(cpu.state.dr[6] & DR6_BS, 0);
    assert_eq!(cpu.state.eip, 0x500);
    assert!(!cpu.state.flag(FLAG_TF));
    let sp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u16(&mut cpu, sp), REAL_CODE as u16 + 1);
}
