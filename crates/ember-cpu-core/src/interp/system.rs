//! Privileged and system instructions: control/debug registers, descriptor
//! tables, MSRs, CPUID, the interrupt flag and port I/O.

use ember_mmu::MemoryBus;
use ember_x86::{Instruction, Op, PortSrc, RmOperand, Width};
use tracing::debug;

use crate::exception::{CpuResult, Exception, InternalError};
use crate::io::PortIo;
use crate::segmentation::{is_null, selector_index, system_type, Descriptor};
use crate::state::{
    gpr, CpuMode, Segment, ACCESS_DC, ACCESS_RW, CR0_CD, CR0_ET, CR0_NW, CR0_PE, CR0_PG, CR0_TS,
    CR4_DE, CR4_SUPPORTED, CR4_TSD, DR6_RESET, DR7_RESET, FLAG_IF, FLAG_IOPL_MASK, FLAG_RF,
    FLAG_VM, FLAG_ZF,
};
use crate::Vcpu;

use super::{mem_operand, Flow};

const MSR_TSC: u32 = 0x10;
const MSR_SYSENTER_CS: u32 = 0x174;
const MSR_SYSENTER_ESP: u32 = 0x175;
const MSR_SYSENTER_EIP: u32 = 0x176;

/// CPUID leaf 1 EDX: DE, PSE, TSC, MSR, PAE, CX8, PGE, CMOV.
const CPUID_FEATURES: u32 =
    (1 << 2) | (1 << 3) | (1 << 4) | (1 << 5) | (1 << 6) | (1 << 8) | (1 << 13) | (1 << 15);

/// Offset of the I/O map base field in a 32-bit TSS.
const TSS_IOMAP_BASE: u32 = 0x66;

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    fn require_cpl0(&self) -> CpuResult<()> {
        if self.state.cpl() != 0 {
            return Err(Exception::GeneralProtection(0).into());
        }
        Ok(())
    }

    fn require_protected(&self) -> CpuResult<()> {
        if !self.state.mode().is_protected() {
            return Err(Exception::InvalidOpcode.into());
        }
        Ok(())
    }

    pub(crate) fn exec_mov_special(&mut self, inst: &Instruction) -> CpuResult<()> {
        self.require_cpl0()?;
        let Some(RmOperand::Reg(rm)) = inst.rm else {
            return Err(InternalError::OperandShape("mov cr/dr").into());
        };
        match inst.op {
            Op::MovFromCr => {
                let v = match inst.reg {
                    0 => self.state.cr0,
                    2 => self.state.cr2,
                    3 => self.state.cr3,
                    4 => self.state.cr4,
                    _ => return Err(Exception::InvalidOpcode.into()),
                };
                self.state.write_reg(rm, Width::Dword, v);
            }
            Op::MovToCr => {
                let v = self.state.read_reg(rm, Width::Dword);
                match inst.reg {
                    0 => self.write_cr0(v)?,
                    2 => self.state.cr2 = v,
                    3 => self.set_cr3(v),
                    4 => {
                        if v & !CR4_SUPPORTED != 0 {
                            return Err(Exception::GeneralProtection(0).into());
                        }
                        self.set_cr4(v);
                    }
                    _ => return Err(Exception::InvalidOpcode.into()),
                }
            }
            Op::MovFromDr | Op::MovToDr => {
                let index = match inst.reg {
                    4 | 5 if self.state.cr4 & CR4_DE != 0 => {
                        return Err(Exception::InvalidOpcode.into())
                    }
                    4 | 5 => usize::from(inst.reg) + 2,
                    n => usize::from(n),
                };
                if inst.op == Op::MovFromDr {
                    let v = self.state.dr[index];
                    self.state.write_reg(rm, Width::Dword, v);
                } else {
                    let v = self.state.read_reg(rm, Width::Dword);
                    self.state.dr[index] = match index {
                        6 => (v & 0x0000_e00f) | DR6_RESET,
                        7 => (v & 0xffff_2bff) | DR7_RESET,
                        _ => v,
                    };
                }
            }
            _ => return Err(InternalError::OperandShape("mov cr/dr").into()),
        }
        Ok(())
    }

    /// MOV CR0 / LMSW validation: PG needs PE, NW needs CD. ET is hardwired.
    fn write_cr0(&mut self, value: u32) -> CpuResult<()> {
        if (value & CR0_PG != 0 && value & CR0_PE == 0) || (value & CR0_NW != 0 && value & CR0_CD == 0) {
            return Err(Exception::GeneralProtection(0).into());
        }
        self.set_cr0(value | CR0_ET);
        Ok(())
    }

    pub(crate) fn exec_pushf(&mut self, opsize: Width) -> CpuResult<()> {
        self.check_vm86_iopl()?;
        let image = self.state.eflags & !(FLAG_VM | FLAG_RF);
        self.push(opsize, image)
    }

    pub(crate) fn exec_popf(&mut self, opsize: Width) -> CpuResult<()> {
        self.check_vm86_iopl()?;
        let value = self.pop(opsize)?;
        let cpl = self.state.cpl();
        let mut keep = FLAG_VM | FLAG_RF;
        if cpl > 0 {
            keep |= FLAG_IOPL_MASK;
        }
        if cpl > self.state.iopl() {
            keep |= FLAG_IF;
        }
        self.write_flags(value, opsize, keep);
        Ok(())
    }

    pub(crate) fn exec_cli(&mut self) -> CpuResult<()> {
        if self.state.cpl() > self.state.iopl() {
            return Err(Exception::GeneralProtection(0).into());
        }
        self.state.set_flag(FLAG_IF, false);
        Ok(())
    }

    /// STI opens the interrupt window only after the next instruction.
    pub(crate) fn exec_sti(&mut self) -> CpuResult<Flow> {
        if self.state.cpl() > self.state.iopl() {
            return Err(Exception::GeneralProtection(0).into());
        }
        let was_enabled = self.state.flag(FLAG_IF);
        self.state.set_flag(FLAG_IF, true);
        Ok(if was_enabled {
            Flow::Next
        } else {
            Flow::InhibitInterrupts
        })
    }

    /// Protected-mode I/O permission: CPL <= IOPL, or every bit for the
    /// accessed ports clear in the TSS I/O bitmap. VM86 always consults the
    /// bitmap.
    pub(crate) fn check_io_permission(&mut self, port: u16, width: Width) -> CpuResult<()> {
        let mode = self.state.mode();
        if mode == CpuMode::Real {
            return Ok(());
        }
        if mode != CpuMode::Vm86 && self.state.cpl() <= self.state.iopl() {
            return Ok(());
        }
        let deny = Exception::GeneralProtection(0);
        let tr = self.state.tr;
        let is_tss32 = matches!(
            tr.system_type(),
            system_type::TSS32_AVAILABLE | system_type::TSS32_BUSY
        );
        if !tr.valid || !is_tss32 || tr.limit < TSS_IOMAP_BASE + 1 {
            return Err(deny.into());
        }
        let map_base = self.read_system(tr.base.wrapping_add(TSS_IOMAP_BASE), 2)? as u32;
        let byte = map_base + u32::from(port >> 3);
        if byte + 1 > tr.limit {
            return Err(deny.into());
        }
        let bits = self.read_system(tr.base.wrapping_add(byte), 2)? as u32;
        let mask = ((1u32 << width.bytes()) - 1) << (port & 7);
        if bits & mask != 0 {
            return Err(deny.into());
        }
        Ok(())
    }

    pub(crate) fn exec_port_io(&mut self, inst: &Instruction, src: PortSrc) -> CpuResult<()> {
        let w = inst.width;
        let port = match src {
            PortSrc::Imm => inst.imm as u16,
            PortSrc::Dx => self.state.gpr[gpr::EDX] as u16,
        };
        self.check_io_permission(port, w)?;
        if matches!(inst.op, Op::In(_)) {
            let v = self.ports.io_read(port, w);
            self.state.write_reg(gpr::EAX as u8, w, v);
        } else {
            let v = self.state.read_reg(gpr::EAX as u8, w);
            self.ports.io_write(port, w, v);
        }
        Ok(())
    }

    pub(crate) fn exec_system(&mut self, inst: &Instruction) -> CpuResult<()> {
        let w = inst.width;
        match inst.op {
            Op::Lgdt | Op::Lidt => {
                self.require_cpl0()?;
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                let limit = self.read_mem(m.seg, ea, Width::Word)? as u16;
                let mut base = self.read_mem(m.seg, ea.wrapping_add(2), Width::Dword)?;
                if inst.operand_size == Width::Word {
                    base &= 0x00ff_ffff;
                }
                let table = crate::state::TableRegister { base, limit };
                if inst.op == Op::Lgdt {
                    self.state.gdtr = table;
                } else {
                    self.state.idtr = table;
                }
            }
            Op::Sgdt | Op::Sidt => {
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                let table = if inst.op == Op::Sgdt {
                    self.state.gdtr
                } else {
                    self.state.idtr
                };
                let base = if inst.operand_size == Width::Word {
                    table.base & 0x00ff_ffff
                } else {
                    table.base
                };
                // Probe the far end first so a fault leaves memory untouched.
                self.read_mem_rmw(m.seg, ea.wrapping_add(2), Width::Dword)?;
                self.write_mem(m.seg, ea, Width::Word, u32::from(table.limit))?;
                self.write_mem(m.seg, ea.wrapping_add(2), Width::Dword, base)?;
            }
            Op::Sldt | Op::Str => {
                self.require_protected()?;
                let sel = if inst.op == Op::Sldt {
                    self.state.ldtr.selector
                } else {
                    self.state.tr.selector
                };
                let dst = self.rm_loc(inst)?;
                self.write_loc(dst, w, u32::from(sel))?;
            }
            Op::Lldt => {
                self.require_protected()?;
                self.require_cpl0()?;
                let src = self.rm_loc(inst)?;
                let sel = self.read_loc(src, Width::Word)? as u16;
                self.load_ldtr(sel)?;
            }
            Op::Ltr => {
                self.require_protected()?;
                self.require_cpl0()?;
                let src = self.rm_loc(inst)?;
                let sel = self.read_loc(src, Width::Word)? as u16;
                self.load_task_register(sel)?;
            }
            Op::Lmsw => {
                self.require_cpl0()?;
                let src = self.rm_loc(inst)?;
                let v = self.read_loc(src, Width::Word)?;
                // LMSW can set PE but never clear it.
                let pe = (self.state.cr0 | v) & CR0_PE;
                let cr0 = (self.state.cr0 & !0xf) | (v & 0xe) | pe;
                self.write_cr0(cr0)?;
            }
            Op::Smsw => {
                let dst = self.rm_loc(inst)?;
                self.write_loc(dst, w, self.state.cr0)?;
            }
            Op::Clts => {
                self.require_cpl0()?;
                self.set_cr0(self.state.cr0 & !CR0_TS);
            }
            Op::Invlpg => {
                self.require_cpl0()?;
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                let linear = self.state.seg(m.seg).base.wrapping_add(ea);
                self.mmu.invlpg(linear);
            }
            Op::Lar | Op::Lsl => {
                self.require_protected()?;
                let src = self.rm_loc(inst)?;
                let sel = self.read_loc(src, Width::Word)? as u16;
                let result = match self.visible_descriptor(sel)? {
                    Some(desc) if inst.op == Op::Lar && lar_type_ok(desc) => {
                        Some(((desc.0 >> 32) as u32) & 0x00f0_ff00)
                    }
                    Some(desc) if inst.op == Op::Lsl && lsl_type_ok(desc) => Some(desc.limit()),
                    _ => None,
                };
                self.state.set_flag(FLAG_ZF, result.is_some());
                if let Some(v) = result {
                    self.state.write_reg(inst.reg, w, v);
                }
            }
            Op::Verr | Op::Verw => {
                self.require_protected()?;
                let src = self.rm_loc(inst)?;
                let sel = self.read_loc(src, Width::Word)? as u16;
                let ok = match self.visible_descriptor(sel)? {
                    Some(desc) if inst.op == Op::Verr => {
                        desc.is_data() || (desc.is_code() && desc.access() & ACCESS_RW != 0)
                    }
                    Some(desc) => desc.is_data() && desc.access() & ACCESS_RW != 0,
                    None => false,
                };
                self.state.set_flag(FLAG_ZF, ok);
            }
            Op::Arpl => {
                self.require_protected()?;
                let dst = self.rm_loc(inst)?;
                let d = self.read_loc_rmw(dst, Width::Word)?;
                let s = self.state.read_reg(inst.reg, Width::Word);
                if d & 3 < s & 3 {
                    self.write_loc(dst, Width::Word, (d & !3) | (s & 3))?;
                    self.state.set_flag(FLAG_ZF, true);
                } else {
                    self.state.set_flag(FLAG_ZF, false);
                }
            }
            Op::Cpuid => self.exec_cpuid(),
            Op::Rdtsc => {
                if self.state.cr4 & CR4_TSD != 0 && self.state.cpl() != 0 {
                    return Err(Exception::GeneralProtection(0).into());
                }
                let ticks = self.time.ticks();
                self.state.gpr[gpr::EAX] = ticks as u32;
                self.state.gpr[gpr::EDX] = (ticks >> 32) as u32;
            }
            Op::Rdmsr => {
                self.require_cpl0()?;
                let v = self.read_msr(self.state.gpr[gpr::ECX])?;
                self.state.gpr[gpr::EAX] = v as u32;
                self.state.gpr[gpr::EDX] = (v >> 32) as u32;
            }
            Op::Wrmsr => {
                self.require_cpl0()?;
                let v = u64::from(self.state.gpr[gpr::EAX]) | (u64::from(self.state.gpr[gpr::EDX]) << 32);
                self.write_msr(self.state.gpr[gpr::ECX], v)?;
            }
            Op::Wbinvd => self.require_cpl0()?,
            _ => return Err(InternalError::OperandShape("system").into()),
        }
        Ok(())
    }

    fn load_ldtr(&mut self, selector: u16) -> CpuResult<()> {
        if is_null(selector) {
            self.state.ldtr = Segment::null(selector);
            return Ok(());
        }
        let code = selector_index(selector);
        if selector & 4 != 0 {
            return Err(Exception::GeneralProtection(code).into());
        }
        let desc = self
            .fetch_descriptor(selector)?
            .ok_or(Exception::GeneralProtection(code))?;
        if !desc.is_system() || desc.system_type() != system_type::LDT {
            return Err(Exception::GeneralProtection(code).into());
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(code).into());
        }
        self.state.ldtr = desc.to_segment(selector);
        Ok(())
    }

    fn load_task_register(&mut self, selector: u16) -> CpuResult<()> {
        if is_null(selector) {
            return Err(Exception::GeneralProtection(0).into());
        }
        let code = selector_index(selector);
        if selector & 4 != 0 {
            return Err(Exception::GeneralProtection(code).into());
        }
        let desc = self
            .fetch_descriptor(selector)?
            .ok_or(Exception::GeneralProtection(code))?;
        let available = matches!(
            desc.system_type(),
            system_type::TSS16_AVAILABLE | system_type::TSS32_AVAILABLE
        );
        if !desc.is_system() || !available {
            return Err(Exception::GeneralProtection(code).into());
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(code).into());
        }
        // Mark the descriptor busy (type bit 1).
        let busy = desc.access() | 0x2;
        let addr = self
            .state
            .gdtr
            .base
            .wrapping_add(u32::from(selector & !7))
            .wrapping_add(5);
        self.write_system(addr, 1, u64::from(busy))?;
        let mut tr = desc.to_segment(selector);
        tr.access = busy;
        self.state.tr = tr;
        debug!(selector, base = tr.base, limit = tr.limit, "task register loaded");
        Ok(())
    }

    /// Descriptor for LAR/LSL/VERR/VERW if it exists and is visible at the
    /// current privilege level. Conforming code segments skip the DPL check.
    fn visible_descriptor(&mut self, selector: u16) -> CpuResult<Option<Descriptor>> {
        if is_null(selector) {
            return Ok(None);
        }
        let Some(desc) = self.fetch_descriptor(selector)? else {
            return Ok(None);
        };
        let conforming = desc.is_code() && desc.access() & ACCESS_DC != 0;
        let rpl = (selector & 3) as u8;
        if !conforming && desc.dpl() < self.state.cpl().max(rpl) {
            return Ok(None);
        }
        Ok(Some(desc))
    }

    fn exec_cpuid(&mut self) {
        let leaf = self.state.gpr[gpr::EAX];
        let chunk = |i: usize| {
            let v = &self.config.vendor[i * 4..i * 4 + 4];
            u32::from_le_bytes([v[0], v[1], v[2], v[3]])
        };
        let (a, b, c, d) = match leaf {
            0 => (1, chunk(0), chunk(2), chunk(1)),
            1 => (self.config.signature, 0, 0, CPUID_FEATURES),
            _ => (0, 0, 0, 0),
        };
        self.state.gpr[gpr::EAX] = a;
        self.state.gpr[gpr::EBX] = b;
        self.state.gpr[gpr::ECX] = c;
        self.state.gpr[gpr::EDX] = d;
    }

    fn read_msr(&self, index: u32) -> CpuResult<u64> {
        let msr = &self.state.msr;
        Ok(match index {
            MSR_TSC => self.time.ticks(),
            MSR_SYSENTER_CS => u64::from(msr.sysenter_cs),
            MSR_SYSENTER_ESP => u64::from(msr.sysenter_esp),
            MSR_SYSENTER_EIP => u64::from(msr.sysenter_eip),
            _ => return Err(Exception::GeneralProtection(0).into()),
        })
    }

    fn write_msr(&mut self, index: u32, value: u64) -> CpuResult<()> {
        let msr = &mut self.state.msr;
        match index {
            MSR_TSC => self.time.set_ticks(value),
            MSR_SYSENTER_CS => msr.sysenter_cs = value as u32,
            MSR_SYSENTER_ESP => msr.sysenter_esp = value as u32,
            MSR_SYSENTER_EIP => msr.sysenter_eip = value as u32,
            _ => return Err(Exception::GeneralProtection(0).into()),
        }
        Ok(())
    }
}

fn lar_type_ok(desc: Descriptor) -> bool {
    !desc.is_system()
        || matches!(
            desc.system_type(),
            system_type::TSS16_AVAILABLE
                | system_type::LDT
                | system_type::TSS16_BUSY
                | system_type::CALL_GATE16
                | system_type::TASK_GATE
                | system_type::TSS32_AVAILABLE
                | system_type::TSS32_BUSY
                | system_type::CALL_GATE32
        )
}

fn lsl_type_ok(desc: Descriptor) -> bool {
    !desc.is_system()
        || matches!(
            desc.system_type(),
            system_type::TSS16_AVAILABLE
                | system_type::LDT
                | system_type::TSS16_BUSY
                | system_type::TSS32_AVAILABLE
                | system_type::TSS32_BUSY
        )
}
