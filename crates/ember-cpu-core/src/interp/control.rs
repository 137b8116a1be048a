//! Near and far control transfers, ENTER/LEAVE and LOOP.

use ember_mmu::MemoryBus;
use ember_x86::{Instruction, LoopKind, SegReg, Width};
use tracing::trace;

use crate::exception::{CpuResult, Exception};
use crate::io::PortIo;
use crate::segmentation::{is_null, selector_index, system_type, Descriptor, StackCheck};
use crate::state::{gpr, Segment, FLAG_ZF};
use crate::Vcpu;

/// Validated far-transfer target.
struct FarTarget {
    cs: Segment,
    eip: u32,
    /// Frame width for a transfer through a call gate.
    gate_width: Option<Width>,
    /// Set for a transfer through a gate into a more privileged segment.
    inner: Option<InnerCall>,
}

struct InnerCall {
    dpl: u8,
    params: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FarKind {
    Jump,
    Call,
}

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    /// Jump to `target` within the current code segment.
    pub(crate) fn near_branch(&mut self, target: u32, opsize: Width) -> CpuResult<()> {
        let target = target & opsize.mask();
        if target > self.state.seg(SegReg::Cs).limit {
            return Err(Exception::GeneralProtection(0).into());
        }
        self.state.eip = target;
        Ok(())
    }

    pub(crate) fn near_call(&mut self, target: u32, opsize: Width) -> CpuResult<()> {
        let target = target & opsize.mask();
        if target > self.state.seg(SegReg::Cs).limit {
            return Err(Exception::GeneralProtection(0).into());
        }
        let ret = self.state.eip;
        self.push(opsize, ret)?;
        self.state.eip = target;
        Ok(())
    }

    pub(crate) fn near_return(&mut self, opsize: Width, release: u32) -> CpuResult<()> {
        let target = self.peek(opsize, 0)? & opsize.mask();
        if target > self.state.seg(SegReg::Cs).limit {
            return Err(Exception::GeneralProtection(0).into());
        }
        let sp = self
            .state
            .sp()
            .wrapping_add(opsize.bytes())
            .wrapping_add(release)
            & self.stack_mask();
        self.state.set_sp(sp);
        self.state.eip = target;
        Ok(())
    }

    pub(crate) fn exec_loop(&mut self, inst: &Instruction, kind: LoopKind) -> CpuResult<()> {
        let asz = inst.address_size;
        let count = self.state.read_reg(gpr::ECX as u8, asz).wrapping_sub(1) & asz.mask();
        self.state.write_reg(gpr::ECX as u8, asz, count);
        let zf = self.state.flag(FLAG_ZF);
        let taken = count != 0
            && match kind {
                LoopKind::Loop => true,
                LoopKind::Loope => zf,
                LoopKind::Loopne => !zf,
            };
        if taken {
            let target = self.state.eip.wrapping_add(inst.imm);
            self.near_branch(target, inst.operand_size)?;
        }
        Ok(())
    }

    pub(crate) fn exec_enter(&mut self, inst: &Instruction) -> CpuResult<()> {
        let opsize = inst.operand_size;
        let size = inst.imm & 0xffff;
        let level = inst.imm2 & 0x1f;
        let stack_width = if self.state.stack_is_32() {
            Width::Dword
        } else {
            Width::Word
        };
        let mask = self.stack_mask();

        let bp = self.state.read_reg(gpr::EBP as u8, stack_width);
        self.push(opsize, self.state.read_reg(gpr::EBP as u8, opsize))?;
        let frame = self.state.sp();
        if level > 0 {
            let mut bp = bp;
            for _ in 1..level {
                bp = bp.wrapping_sub(opsize.bytes()) & mask;
                let v = self.read_mem(SegReg::Ss, bp, opsize)?;
                self.push(opsize, v)?;
            }
            self.push(opsize, frame)?;
        }
        self.state.write_reg(gpr::EBP as u8, stack_width, frame);
        let sp = self.state.sp().wrapping_sub(size) & mask;
        self.state.set_sp(sp);
        Ok(())
    }

    pub(crate) fn exec_leave(&mut self, opsize: Width) -> CpuResult<()> {
        let bp = self.state.gpr[gpr::EBP] & self.stack_mask();
        self.state.set_sp(bp);
        let v = self.pop(opsize)?;
        self.state.write_reg(gpr::EBP as u8, opsize, v);
        Ok(())
    }

    /// INT n, PUSHF, POPF and IRET in virtual-8086 mode need IOPL 3.
    pub(crate) fn check_vm86_iopl(&self) -> CpuResult<()> {
        if self.state.mode() == crate::state::CpuMode::Vm86 && self.state.iopl() < 3 {
            return Err(Exception::GeneralProtection(0).into());
        }
        Ok(())
    }

    pub(crate) fn far_jump(&mut self, selector: u16, offset: u32, opsize: Width) -> CpuResult<()> {
        if !self.state.mode().is_protected() {
            let offset = offset & opsize.mask();
            self.check_real_target(offset)?;
            self.state.load_real_segment(SegReg::Cs, selector);
            self.state.eip = offset;
            return Ok(());
        }
        let target = self.far_target(selector, offset, opsize, FarKind::Jump)?;
        *self.state.seg_mut(SegReg::Cs) = target.cs;
        self.state.eip = target.eip;
        Ok(())
    }

    pub(crate) fn far_call(&mut self, selector: u16, offset: u32, opsize: Width) -> CpuResult<()> {
        let old_cs = u32::from(self.state.seg(SegReg::Cs).selector);
        let old_eip = self.state.eip;

        if !self.state.mode().is_protected() {
            let offset = offset & opsize.mask();
            self.check_real_target(offset)?;
            self.push(opsize, old_cs)?;
            self.push(opsize, old_eip)?;
            self.state.load_real_segment(SegReg::Cs, selector);
            self.state.eip = offset;
            return Ok(());
        }

        let cpl = self.state.cpl();
        let target = self.far_target(selector, offset, opsize, FarKind::Call)?;
        let Some(inner) = target.inner else {
            let ss = *self.state.seg(SegReg::Ss);
            let sp = self.state.sp();
            let width = target.gate_width.unwrap_or(opsize);
            let new_sp = self.push_frame(
                &ss,
                sp,
                width,
                &[old_cs, old_eip],
                cpl,
                Exception::StackFault(0),
            )?;
            self.state.set_sp(new_sp);
            *self.state.seg_mut(SegReg::Cs) = target.cs;
            self.state.eip = target.eip;
            return Ok(());
        };

        // Privilege-raising call gate: switch to the inner stack from the TSS
        // and copy the caller's parameters across.
        let width = target.gate_width.unwrap_or(opsize);
        let (ss_sel, esp) = self.tss_stack(inner.dpl, 0)?;
        let ss_cache = self.validate_stack_segment(ss_sel, inner.dpl, StackCheck::Tss { ext: 0 })?;
        let old_ss = *self.state.seg(SegReg::Ss);
        let old_sp = self.state.sp();
        let mut values = vec![
            u32::from(old_ss.selector),
            self.state.gpr[gpr::ESP],
        ];
        for i in (0..u32::from(inner.params)).rev() {
            let v = self.read_stack_slot(
                &old_ss,
                old_sp,
                width,
                i,
                cpl,
                Exception::StackFault(0),
            )?;
            values.push(v);
        }
        values.extend([old_cs, old_eip]);
        let sp = if ss_cache.is_big() { esp } else { esp & 0xffff };
        let fault = Exception::StackFault(selector_index(ss_sel));
        let new_sp = self.push_frame(&ss_cache, sp, width, &values, inner.dpl, fault)?;

        *self.state.seg_mut(SegReg::Ss) = ss_cache;
        self.state.set_sp(new_sp);
        *self.state.seg_mut(SegReg::Cs) = target.cs;
        self.state.cpl = inner.dpl;
        self.state.eip = target.eip;
        trace!(dpl = inner.dpl, params = inner.params, "call gate to inner privilege level");
        Ok(())
    }

    pub(crate) fn far_return(&mut self, opsize: Width, release: u32) -> CpuResult<()> {
        let eip = self.peek(opsize, 0)? & opsize.mask();
        let cs_sel = self.peek(opsize, 1)? as u16;
        let frame = 2 * opsize.bytes() + release;

        if !self.state.mode().is_protected() {
            self.check_real_target(eip)?;
            let sp = self.state.sp().wrapping_add(frame) & self.stack_mask();
            self.state.set_sp(sp);
            self.state.load_real_segment(SegReg::Cs, cs_sel);
            self.state.eip = eip;
            return Ok(());
        }

        let cpl = self.state.cpl();
        if is_null(cs_sel) {
            return Err(Exception::GeneralProtection(0).into());
        }
        let code = selector_index(cs_sel);
        let rpl = (cs_sel & 3) as u8;
        if rpl < cpl {
            return Err(Exception::GeneralProtection(code).into());
        }
        let desc = self
            .fetch_descriptor(cs_sel)?
            .ok_or(Exception::GeneralProtection(code))?;
        let conforming = desc.is_code() && desc.access() & crate::state::ACCESS_DC != 0;
        let privilege_ok = if conforming {
            desc.dpl() <= rpl
        } else {
            desc.dpl() == rpl
        };
        if !desc.is_code() || !privilege_ok {
            return Err(Exception::GeneralProtection(code).into());
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(code).into());
        }
        let cs_cache = desc.to_segment(cs_sel);
        if eip > cs_cache.limit {
            return Err(Exception::GeneralProtection(0).into());
        }

        if rpl == cpl {
            self.mark_accessed(cs_sel, desc)?;
            let sp = self.state.sp().wrapping_add(frame) & self.stack_mask();
            self.state.set_sp(sp);
            *self.state.seg_mut(SegReg::Cs) = cs_cache;
            self.state.eip = eip;
            return Ok(());
        }

        // Outer level: the caller's SS:ESP sit above the released parameters.
        let outer = self.state.sp().wrapping_add(frame) & self.stack_mask();
        let new_esp = self.read_mem(SegReg::Ss, outer, opsize)?;
        let ss_sel = self.read_mem(
            SegReg::Ss,
            outer.wrapping_add(opsize.bytes()) & self.stack_mask(),
            opsize,
        )? as u16;
        let ss_cache = self.validate_stack_segment(ss_sel, rpl, StackCheck::Load)?;
        self.mark_accessed(cs_sel, desc)?;

        *self.state.seg_mut(SegReg::Cs) = cs_cache;
        self.state.cpl = rpl;
        self.state.eip = eip;
        *self.state.seg_mut(SegReg::Ss) = ss_cache;
        // The popped ESP is sized by the new SS, not by the operand size.
        let sp = new_esp.wrapping_add(release) & self.stack_mask();
        self.state.set_sp(sp);
        self.invalidate_inaccessible_data_segments();
        Ok(())
    }

    fn check_real_target(&self, offset: u32) -> CpuResult<()> {
        if offset > self.state.seg(SegReg::Cs).limit {
            return Err(Exception::GeneralProtection(0).into());
        }
        Ok(())
    }

    /// Resolve a protected-mode far JMP/CALL target: a code segment or a
    /// call gate. TSS and task-gate targets would need a task switch and
    /// raise #GP.
    fn far_target(
        &mut self,
        selector: u16,
        offset: u32,
        opsize: Width,
        kind: FarKind,
    ) -> CpuResult<FarTarget> {
        let cpl = self.state.cpl();
        if is_null(selector) {
            return Err(Exception::GeneralProtection(0).into());
        }
        let code = selector_index(selector);
        let desc = self
            .fetch_descriptor(selector)?
            .ok_or(Exception::GeneralProtection(code))?;
        let rpl = (selector & 3) as u8;

        if desc.is_code() {
            let conforming = desc.access() & crate::state::ACCESS_DC != 0;
            let allowed = if conforming {
                desc.dpl() <= cpl
            } else {
                rpl <= cpl && desc.dpl() == cpl
            };
            if !allowed {
                return Err(Exception::GeneralProtection(code).into());
            }
            if !desc.present() {
                return Err(Exception::SegmentNotPresent(code).into());
            }
            let cs = desc.to_segment(code | u16::from(cpl));
            let eip = offset & opsize.mask();
            if eip > cs.limit {
                return Err(Exception::GeneralProtection(0).into());
            }
            self.mark_accessed(selector, desc)?;
            return Ok(FarTarget {
                cs,
                eip,
                gate_width: None,
                inner: None,
            });
        }

        if !desc.is_system() {
            return Err(Exception::GeneralProtection(code).into());
        }
        let gate_width = match desc.system_type() {
            system_type::CALL_GATE16 => Width::Word,
            system_type::CALL_GATE32 => Width::Dword,
            _ => return Err(Exception::GeneralProtection(code).into()),
        };
        if desc.dpl() < cpl || desc.dpl() < rpl {
            return Err(Exception::GeneralProtection(code).into());
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(code).into());
        }
        self.call_gate_target(desc, gate_width, kind)
    }

    fn call_gate_target(&mut self, gate: Descriptor, width: Width, kind: FarKind) -> CpuResult<FarTarget> {
        let cpl = self.state.cpl();
        let selector = gate.gate_selector();
        if is_null(selector) {
            return Err(Exception::GeneralProtection(0).into());
        }
        let code = selector_index(selector);
        let desc = self
            .fetch_descriptor(selector)?
            .ok_or(Exception::GeneralProtection(code))?;
        if !desc.is_code() || desc.dpl() > cpl {
            return Err(Exception::GeneralProtection(code).into());
        }
        let conforming = desc.access() & crate::state::ACCESS_DC != 0;
        if kind == FarKind::Jump && !conforming && desc.dpl() != cpl {
            return Err(Exception::GeneralProtection(code).into());
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(code).into());
        }
        let target_cpl = if conforming { cpl } else { desc.dpl() };
        let cs = desc.to_segment(code | u16::from(target_cpl));
        let eip = match width {
            Width::Word => gate.gate_offset() & 0xffff,
            _ => gate.gate_offset(),
        };
        if eip > cs.limit {
            return Err(Exception::GeneralProtection(0).into());
        }
        self.mark_accessed(selector, desc)?;
        let inner = (target_cpl < cpl).then_some(InnerCall {
            dpl: target_cpl,
            params: gate.gate_param_count(),
        });
        Ok(FarTarget {
            cs,
            eip,
            gate_width: Some(width),
            inner,
        })
    }
}
