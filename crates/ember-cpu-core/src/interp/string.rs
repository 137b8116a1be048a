//! String instructions and their REP forms.
//!
//! A REP instruction runs at most [`REP_BATCH`] iterations per step and then
//! leaves EIP on itself, so interrupts are recognised between batches. A fault
//! after some iterations have completed keeps that progress and re-executes
//! the instruction, which then faults on its first iteration.

use ember_mmu::MemoryBus;
use ember_x86::{Instruction, Prefixes, SegReg, StringOp, Width};

use crate::exception::{CpuResult, Fault};
use crate::io::PortIo;
use crate::state::{gpr, FLAG_DF, FLAG_ZF};
use crate::Vcpu;

use super::alu::sub_with_flags;

pub(crate) const REP_BATCH: u32 = 4096;

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    pub(crate) fn exec_string(&mut self, inst: &Instruction, op: StringOp) -> CpuResult<()> {
        if matches!(op, StringOp::Ins | StringOp::Outs) {
            let port = self.state.gpr[gpr::EDX] as u16;
            self.check_io_permission(port, inst.width)?;
        }

        if !inst.has_rep() {
            return self.string_iteration(inst, op);
        }

        let asz = inst.address_size;
        let compares = matches!(op, StringOp::Cmps | StringOp::Scas);
        let until_equal = inst.prefixes.contains(Prefixes::REPNE);
        for done in 0..REP_BATCH {
            let count = self.state.read_reg(gpr::ECX as u8, asz);
            if count == 0 {
                return Ok(());
            }
            match self.string_iteration(inst, op) {
                Ok(()) => {}
                Err(Fault::Guest(_)) if done > 0 => {
                    self.state.eip = self.inst_eip;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            self.state.write_reg(gpr::ECX as u8, asz, count.wrapping_sub(1));
            if compares && self.state.flag(FLAG_ZF) == until_equal {
                return Ok(());
            }
        }
        if self.state.read_reg(gpr::ECX as u8, asz) != 0 {
            self.state.eip = self.inst_eip;
        }
        Ok(())
    }

    /// One element. Index registers are only updated once every access of
    /// the iteration has succeeded.
    fn string_iteration(&mut self, inst: &Instruction, op: StringOp) -> CpuResult<()> {
        let w = inst.width;
        let asz = inst.address_size;
        let src = inst.data_segment();
        let si = self.state.read_reg(gpr::ESI as u8, asz);
        let di = self.state.read_reg(gpr::EDI as u8, asz);
        let port = self.state.gpr[gpr::EDX] as u16;

        let (uses_si, uses_di) = match op {
            StringOp::Movs => {
                let v = self.read_mem(src, si, w)?;
                self.write_mem(SegReg::Es, di, w, v)?;
                (true, true)
            }
            StringOp::Cmps => {
                let a = self.read_mem(src, si, w)?;
                let b = self.read_mem(SegReg::Es, di, w)?;
                sub_with_flags(&mut self.state.eflags, a, b, false, w);
                (true, true)
            }
            StringOp::Stos => {
                let v = self.state.read_reg(gpr::EAX as u8, w);
                self.write_mem(SegReg::Es, di, w, v)?;
                (false, true)
            }
            StringOp::Lods => {
                let v = self.read_mem(src, si, w)?;
                self.state.write_reg(gpr::EAX as u8, w, v);
                (true, false)
            }
            StringOp::Scas => {
                let a = self.state.read_reg(gpr::EAX as u8, w);
                let b = self.read_mem(SegReg::Es, di, w)?;
                sub_with_flags(&mut self.state.eflags, a, b, false, w);
                (false, true)
            }
            StringOp::Ins => {
                // Probe the destination first so a fault does not consume port data.
                self.read_mem_rmw(SegReg::Es, di, w)?;
                let v = self.ports.io_read(port, w);
                self.write_mem(SegReg::Es, di, w, v)?;
                (false, true)
            }
            StringOp::Outs => {
                let v = self.read_mem(src, si, w)?;
                self.ports.io_write(port, w, v);
                (true, false)
            }
        };

        let delta = if self.state.flag(FLAG_DF) {
            w.bytes().wrapping_neg()
        } else {
            w.bytes()
        };
        if uses_si {
            self.state.write_reg(gpr::ESI as u8, asz, si.wrapping_add(delta));
        }
        if uses_di {
            self.state.write_reg(gpr::EDI as u8, asz, di.wrapping_add(delta));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ember_mem::PhysicalMemory;
    use ember_mmu::MemoryBus;
    use ember_x86::{decode_bytes, DecodeMode, SegReg};

    use crate::state::{gpr, FLAG_ZF};
    use crate::{CpuConfig, NullPorts, Vcpu};

    fn real_mode_cpu() -> Vcpu<PhysicalMemory> {
        let ram = PhysicalMemory::new(0x2_0000).unwrap();
        let mut cpu = Vcpu::new(CpuConfig::default(), ram, NullPorts);
        cpu.state.load_real_segment(SegReg::Cs, 0);
        cpu.state.eip = 0x100;
        cpu
    }

    #[test]
    fn rep_movsb_copies_and_exhausts_count() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_bytes(0x1000, b"hello");
        cpu.state.gpr[gpr::ESI] = 0x1000;
        cpu.state.gpr[gpr::EDI] = 0x2000;
        cpu.state.gpr[gpr::ECX] = 5;
        let inst = decode_bytes(&[0xf3, 0xa4], DecodeMode::Bits16).unwrap();
        cpu.inst_eip = cpu.state.eip;
        cpu.exec(&inst).unwrap();

        let mut out = [0u8; 5];
        cpu.bus.read_bytes(0x2000, &mut out);
        assert_eq!(&out, b"hello");
        assert_eq!(cpu.state.gpr[gpr::ECX], 0);
        assert_eq!(cpu.state.gpr[gpr::ESI], 0x1005);
        assert_eq!(cpu.state.eip, 0x102);
    }

    #[test]
    fn repne_scasb_stops_on_match() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_bytes(0x3000, b"abc\0def");
        cpu.state.gpr[gpr::EDI] = 0x3000;
        cpu.state.gpr[gpr::ECX] = 0xffff;
        cpu.state.gpr[gpr::EAX] = 0;
        let inst = decode_bytes(&[0xf2, 0xae], DecodeMode::Bits16).unwrap();
        cpu.inst_eip = cpu.state.eip;
        cpu.exec(&inst).unwrap();

        assert!(cpu.state.flag(FLAG_ZF));
        assert_eq!(cpu.state.gpr[gpr::EDI], 0x3004);
        assert_eq!(cpu.state.gpr[gpr::ECX], 0xffff - 4);
    }

    #[test]
    fn long_rep_yields_between_batches() {
        let mut cpu = real_mode_cpu();
        cpu.state.gpr[gpr::EDI] = 0;
        cpu.state.gpr[gpr::ECX] = super::REP_BATCH + 10;
        let inst = decode_bytes(&[0xf3, 0xaa], DecodeMode::Bits16).unwrap();
        cpu.inst_eip = cpu.state.eip;
        cpu.exec(&inst).unwrap();
        assert_eq!(cpu.state.eip, 0x100);
        assert_eq!(cpu.state.gpr[gpr::ECX], 10);

        cpu.exec(&inst).unwrap();
        assert_eq!(cpu.state.eip, 0x102);
        assert_eq!(cpu.state.gpr[gpr::ECX], 0);
    }
}
