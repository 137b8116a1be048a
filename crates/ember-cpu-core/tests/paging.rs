mod common;

use common::*;
use ember_cpu_core::state::{gpr, CR0_ET, CR0_PE, CR0_PG, CR0_WP};
use ember_cpu_core::{StepOutcome, Vcpu};
use ember_mem::PhysicalMemory;
use ember_mmu::MemoryBus;

const PAGE_DIR: u32 = 0x2_0000;
const PAGE_TABLE: u32 = 0x2_1000;
const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;

/// Identity-map the low 4 MiB with a single page table and turn paging on.
fn paged(code: &[u8]) -> Vcpu<PhysicalMemory> {
    let mut cpu = protected_mode(code);
    cpu.bus
        .write_u32(u64::from(PAGE_DIR), PAGE_TABLE | PTE_P | PTE_RW | PTE_US);
    for i in 0..1024u32 {
        set_pte(&mut cpu, i << 12, (i << 12) | PTE_P | PTE_RW | PTE_US);
    }
    cpu.set_cr3(PAGE_DIR);
    cpu.set_cr0(CR0_PE | CR0_PG | CR0_ET);
    cpu
}

fn set_pte(cpu: &mut Vcpu<PhysicalMemory>, linear: u32, pte: u32) {
    let slot = PAGE_TABLE + ((linear >> 12) & 0x3ff) * 4;
    cpu.bus.write_u32(u64::from(slot), pte);
}

#[test]
fn stale_translation_survives_until_cr3_reload() {
    let code = [
        0xa1, 0x00, 0x00, 0x30, 0x00, // mov eax, [0x300000]
        0x8b, 0x1d, 0x00, 0x00, 0x30, 0x00, // mov ebx, [0x300000]
        0x0f, 0x20, 0xd9, // mov ecx, cr3
        0x0f, 0x22, 0xd9, // mov cr3, ecx
        0x8b, 0x15, 0x00, 0x00, 0x30, 0x00, // mov edx, [0x300000]
    ];
    let mut cpu = paged(&code);
    cpu.bus.write_u32(0x4_0000, 0x1111_1111);
    cpu.bus.write_u32(0x4_1000, 0x2222_2222);
    set_pte(&mut cpu, 0x30_0000, 0x4_0000 | PTE_P | PTE_RW);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.state.gpr[gpr::EAX], 0x1111_1111);

    set_pte(&mut cpu, 0x30_0000, 0x4_1000 | PTE_P | PTE_RW);
    let hits = cpu.mmu.stats().tlb_hits;
    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.state.gpr[gpr::EBX], 0x1111_1111);
    assert!(cpu.mmu.stats().tlb_hits > hits);

    for _ in 0..3 {
        assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    }
    assert_eq!(cpu.state.gpr[gpr::EDX], 0x2222_2222);
}

#[test]
fn invlpg_drops_a_single_translation() {
    let code = [
        0xa1, 0x00, 0x00, 0x30, 0x00, // mov eax, [0x300000]
        0x0f, 0x01, 0x3d, 0x00, 0x00, 0x30, 0x00, // invlpg [0x300000]
        0x8b, 0x1d, 0x00, 0x00, 0x30, 0x00, // mov ebx, [0x300000]
    ];
    let mut cpu = paged(&code);
    cpu.bus.write_u32(0x4_0000, 0xaaaa_aaaa);
    cpu.bus.write_u32(0x4_1000, 0xbbbb_bbbb);
    set_pte(&mut cpu, 0x30_0000, 0x4_0000 | PTE_P | PTE_RW);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    set_pte(&mut cpu, 0x30_0000, 0x4_1000 | PTE_P | PTE_RW);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.state.gpr[gpr::EAX], 0xaaaa_aaaa);
    assert_eq!(cpu.state.gpr[gpr::EBX], 0xbbbb_bbbb);
}

#[test]
fn not_present_read_reports_cr2_and_error_code() {
    // mov eax, [0x50000]
    let mut cpu = paged(&[0xa1, 0x00, 0x00, 0x05, 0x00]);
    set_gate(&mut cpu, 14, HANDLER_BASE);
    set_pte(&mut cpu, 0x5_0000, 0);

    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(14));
    assert_eq!(cpu.state.cr2, 0x5_0000);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp), 0);
    assert_eq!(read_u32(&mut cpu, esp + 4), CODE_BASE);
}

#[test]
fn supervisor_write_to_read_only_page_depends_on_wp() {
    // mov [0x51000], eax
    let code = [0xa3, 0x00, 0x10, 0x05, 0x00];

    let mut cpu = paged(&code);
    set_pte(&mut cpu, 0x5_1000, 0x5_1000 | PTE_P | PTE_US);
    cpu.state.gpr[gpr::EAX] = 0x7777_7777;
    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.bus.read_u32(0x5_1000), 0x7777_7777);

    let mut cpu = paged(&code);
    set_gate(&mut cpu, 14, HANDLER_BASE);
    set_pte(&mut cpu, 0x5_1000, 0x5_1000 | PTE_P | PTE_US);
    cpu.set_cr0(CR0_PE | CR0_PG | CR0_ET | CR0_WP);
    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(14));
    assert_eq!(cpu.state.cr2, 0x5_1000);
    let esp = cpu.state.gpr[gpr::ESP];
    // P | W
    assert_eq!(read_u32(&mut cpu, esp), 0b011);
}

#[test]
fn instruction_fetch_from_unmapped_page_faults() {
    // jmp 0x60000
    let mut cpu = paged(&[0xe9, 0xfb, 0xff, 0x04, 0x00]);
    set_gate(&mut cpu, 14, HANDLER_BASE);
    set_pte(&mut cpu, 0x6_0000, 0);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    assert_eq!(cpu.state.eip, 0x6_0000);
    assert_eq!(cpu.step().unwrap(), StepOutcome::FaultRaised(14));
    assert_eq!(cpu.state.cr2, 0x6_0000);
    let esp = cpu.state.gpr[gpr::ESP];
    assert_eq!(read_u32(&mut cpu, esp + 4), 0x6_0000);
}
