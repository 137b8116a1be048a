#![allow(dead_code)]

use ember_cpu_core::state::{
    gpr, ACCESS_ACCESSED, ACCESS_CODE, ACCESS_PRESENT, ACCESS_RW, ACCESS_S, CR0_ET, CR0_PE,
    FLAG_RESERVED1, SEG_FLAG_DB, SEG_FLAG_G,
};
use ember_cpu_core::{CpuConfig, NullPorts, Segment, TableRegister, Vcpu};
use ember_mem::PhysicalMemory;
use ember_mmu::MemoryBus;
use ember_x86::SegReg;

pub const RAM_SIZE: u64 = 0x20_0000;

pub const GDT_BASE: u32 = 0x1000;
pub const IDT_BASE: u32 = 0x2000;
pub const TSS_BASE: u32 = 0x3000;
pub const CODE_BASE: u32 = 0x1_0000;
pub const HANDLER_BASE: u32 = 0x1_1000;
pub const KERNEL_STACK_TOP: u32 = 0x9000;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1b;
pub const USER_DS: u16 = 0x23;
pub const TSS_SEL: u16 = 0x28;

pub const REAL_CODE: u32 = 0x100;
pub const REAL_STACK_TOP: u32 = 0x8000;

pub fn segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let base = u64::from(base);
    let limit = u64::from(limit);
    (limit & 0xffff)
        | ((base & 0x00ff_ffff) << 16)
        | (u64::from(access) << 40)
        | (((limit >> 16) & 0xf) << 48)
        | (u64::from(flags & 0xf) << 52)
        | (((base >> 24) & 0xff) << 56)
}

/// 32-bit interrupt gate (type 0xE).
pub fn interrupt_gate(selector: u16, offset: u32, dpl: u8) -> u64 {
    let offset = u64::from(offset);
    (offset & 0xffff)
        | (u64::from(selector) << 16)
        | (u64::from(ACCESS_PRESENT | (dpl << 5) | 0xe) << 40)
        | ((offset >> 16) << 48)
}

pub fn write_u64(cpu: &mut Vcpu<PhysicalMemory>, paddr: u32, value: u64) {
    cpu.bus.write_u64(u64::from(paddr), value);
}

pub fn read_u32(cpu: &mut Vcpu<PhysicalMemory>, paddr: u32) -> u32 {
    cpu.bus.read_u32(u64::from(paddr))
}

pub fn read_u16(cpu: &mut Vcpu<PhysicalMemory>, paddr: u32) -> u16 {
    cpu.bus.read_u16(u64::from(paddr))
}

fn cache(selector: u16, base: u32, limit: u32, access: u8, flags: u8) -> Segment {
    Segment {
        selector,
        base,
        limit,
        access,
        flags,
        valid: true,
    }
}

/// Real mode, CS=DS=SS=0, code loaded at 0:0100 and SP at 0x8000.
pub fn real_mode(code: &[u8]) -> Vcpu<PhysicalMemory> {
    let ram = PhysicalMemory::new(RAM_SIZE).unwrap();
    let mut cpu = Vcpu::new(CpuConfig::default(), ram, NullPorts);
    for seg in SegReg::ALL {
        cpu.state.load_real_segment(seg, 0);
    }
    cpu.state.eip = REAL_CODE;
    cpu.state.gpr[gpr::ESP] = REAL_STACK_TOP;
    cpu.bus.write_bytes(u64::from(REAL_CODE), code);
    cpu
}

/// Point real-mode IVT entry `vector` at 0000:`ip`.
pub fn set_ivt(cpu: &mut Vcpu<PhysicalMemory>, vector: u8, ip: u16) {
    let entry = u64::from(vector) * 4;
    cpu.bus.write_u16(entry, ip);
    cpu.bus.write_u16(entry + 2, 0);
}

const CODE_ACCESS: u8 = ACCESS_PRESENT | ACCESS_S | ACCESS_CODE | ACCESS_RW | ACCESS_ACCESSED;
const DATA_ACCESS: u8 = ACCESS_PRESENT | ACCESS_S | ACCESS_RW | ACCESS_ACCESSED;
const FLAT: u8 = SEG_FLAG_G | SEG_FLAG_DB;

/// Flat 32-bit protected mode at CPL 0 with a GDT, an empty IDT, and a
/// 32-bit TSS whose ring-0 stack is `KERNEL_DS:KERNEL_STACK_TOP`.
///
/// Code is loaded at `CODE_BASE`; every IDT entry is absent until
/// [`set_gate`] installs one.
pub fn protected_mode(code: &[u8]) -> Vcpu<PhysicalMemory> {
    let ram = PhysicalMemory::new(RAM_SIZE).unwrap();
    let mut cpu = Vcpu::new(CpuConfig::default(), ram, NullPorts);

    let gdt = [
        0,
        segment_descriptor(0, 0xfffff, CODE_ACCESS, FLAT),
        segment_descriptor(0, 0xfffff, DATA_ACCESS, FLAT),
        segment_descriptor(0, 0xfffff, CODE_ACCESS | (3 << 5), FLAT),
        segment_descriptor(0, 0xfffff, DATA_ACCESS | (3 << 5), FLAT),
        segment_descriptor(TSS_BASE, 0x67, ACCESS_PRESENT | 0xb, 0),
    ];
    for (i, desc) in gdt.iter().enumerate() {
        write_u64(&mut cpu, GDT_BASE + i as u32 * 8, *desc);
    }
    cpu.bus.write_u32(u64::from(TSS_BASE + 4), KERNEL_STACK_TOP);
    cpu.bus.write_u16(u64::from(TSS_BASE + 8), KERNEL_DS);

    cpu.state.gdtr = TableRegister {
        base: GDT_BASE,
        limit: (gdt.len() * 8 - 1) as u16,
    };
    cpu.state.idtr = TableRegister {
        base: IDT_BASE,
        limit: 256 * 8 - 1,
    };
    cpu.state.tr = cache(TSS_SEL, TSS_BASE, 0x67, ACCESS_PRESENT | 0xb, 0);

    cpu.state.segments[SegReg::Cs.index()] = cache(KERNEL_CS, 0, 0xffff_ffff, CODE_ACCESS, FLAT);
    for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs, SegReg::Ss] {
        cpu.state.segments[seg.index()] = cache(KERNEL_DS, 0, 0xffff_ffff, DATA_ACCESS, FLAT);
    }
    cpu.state.cpl = 0;
    cpu.state.eflags = FLAG_RESERVED1;
    cpu.state.gpr = [0; 8];
    cpu.state.gpr[gpr::ESP] = KERNEL_STACK_TOP;
    cpu.state.eip = CODE_BASE;
    cpu.set_cr0(CR0_PE | CR0_ET);

    cpu.bus.write_bytes(u64::from(CODE_BASE), code);
    cpu
}

/// Drop the current protected-mode context to ring 3 (flat user segments)
/// with the user stack at `esp`.
pub fn enter_user_mode(cpu: &mut Vcpu<PhysicalMemory>, esp: u32) {
    cpu.state.segments[SegReg::Cs.index()] =
        cache(USER_CS, 0, 0xffff_ffff, CODE_ACCESS | (3 << 5), FLAT);
    for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs, SegReg::Ss] {
        cpu.state.segments[seg.index()] =
            cache(USER_DS, 0, 0xffff_ffff, DATA_ACCESS | (3 << 5), FLAT);
    }
    cpu.state.cpl = 3;
    cpu.state.gpr[gpr::ESP] = esp;
}

/// Install a ring-0 interrupt gate for `vector` whose handler is a single HLT.
pub fn set_gate(cpu: &mut Vcpu<PhysicalMemory>, vector: u8, handler: u32) {
    write_u64(
        cpu,
        IDT_BASE + u32::from(vector) * 8,
        interrupt_gate(KERNEL_CS, handler, 0),
    );
    cpu.bus.write_u8(u64::from(handler), 0xf4);
}

/// Replace the live data segment cache for `seg` with a ring-0 expand-up
/// data segment of the given byte limit.
pub fn limit_segment(cpu: &mut Vcpu<PhysicalMemory>, seg: SegReg, limit: u32) {
    cpu.state.segments[seg.index()] = cache(KERNEL_DS, 0, limit, DATA_ACCESS, SEG_FLAG_DB);
}
