//! Interrupt/exception delivery (IVT/IDT), privilege transitions, and IRET.
//!
//! Delivery is all-or-nothing: every descriptor, stack-limit and page check
//! runs before the frame is written, and architectural state is committed
//! only after the frame is in memory. A fault raised here therefore leaves
//! the CPU exactly as it was, which lets the step loop redirect it to
//! #DF (or reset on a triple fault).

use std::collections::VecDeque;

use ember_mmu::MemoryBus;
use ember_x86::{SegReg, Width};
use tracing::debug;

use crate::exception::{CpuResult, Exception};
use crate::io::PortIo;
use crate::segmentation::{is_null, selector_index, system_type, StackCheck};
use crate::state::{
    CpuMode, Segment, FLAGS_IMPLEMENTED, FLAG_AC, FLAG_IF, FLAG_IOPL_MASK, FLAG_NT, FLAG_RF,
    FLAG_TF, FLAG_VM,
};
use crate::Vcpu;

/// What caused an event; controls gate DPL checks and the EXT bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// Hardware interrupt or NMI.
    External,
    /// Processor-detected exception.
    Exception,
    /// INT n, INT3, INTO.
    Software,
}

impl InterruptSource {
    #[inline]
    fn ext_bit(self) -> u16 {
        match self {
            InterruptSource::Software => 0,
            InterruptSource::External | InterruptSource::Exception => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateKind {
    Interrupt,
    Trap,
    Task,
}

/// Event bookkeeping that is not architecturally visible register state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingEventState {
    /// FIFO of externally injected maskable interrupts.
    pub external_interrupts: VecDeque<u8>,
    /// Interrupt shadow (STI / MOV SS / POP SS).
    interrupt_inhibit: u8,
    nmi_pending: bool,
    /// Set while an NMI handler runs; cleared by IRET.
    nmi_blocked: bool,
}

impl PendingEventState {
    /// Inject an external interrupt vector (e.g. from PIC/APIC).
    pub fn inject_external_interrupt(&mut self, vector: u8) {
        self.external_interrupts.push_back(vector);
    }

    pub fn raise_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn nmi_pending(&self) -> bool {
        self.nmi_pending
    }

    pub fn nmi_blocked(&self) -> bool {
        self.nmi_blocked
    }

    pub fn set_nmi_state(&mut self, pending: bool, blocked: bool) {
        self.nmi_pending = pending;
        self.nmi_blocked = blocked;
    }

    /// Inhibit maskable interrupts for exactly one instruction.
    ///
    /// This models the interrupt shadow after `STI` as well as `MOV SS`/`POP SS`.
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_inhibit = 1;
    }

    pub fn interrupt_inhibit(&self) -> u8 {
        self.interrupt_inhibit
    }

    /// Restore the shadow counter; any non-zero value is clamped to 1.
    pub fn set_interrupt_inhibit(&mut self, v: u8) {
        self.interrupt_inhibit = u8::from(v != 0);
    }

    /// Call after each successfully executed instruction.
    pub fn retire_instruction(&mut self) {
        self.interrupt_inhibit = self.interrupt_inhibit.saturating_sub(1);
    }

    pub(crate) fn take_nmi(&mut self) -> bool {
        if self.nmi_pending && !self.nmi_blocked {
            self.nmi_pending = false;
            self.nmi_blocked = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn unblock_nmi(&mut self) {
        self.nmi_blocked = false;
    }
}

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    /// Deliver `vector` through the IVT (real mode) or IDT (protected/VM86).
    ///
    /// `return_eip` is the EIP saved in the frame. On error nothing has been
    /// committed.
    pub fn deliver(
        &mut self,
        vector: u8,
        error_code: Option<u32>,
        source: InterruptSource,
        return_eip: u32,
    ) -> CpuResult<()> {
        match self.state.mode() {
            CpuMode::Real => self.deliver_real(vector, return_eip),
            _ => self.deliver_protected(vector, error_code, source, return_eip),
        }
    }

    fn deliver_real(&mut self, vector: u8, return_eip: u32) -> CpuResult<()> {
        let entry = u32::from(vector) * 4;
        if entry + 3 > u32::from(self.state.idtr.limit) {
            return Err(Exception::GeneralProtection(0).into());
        }
        let ivt = self.state.idtr.base.wrapping_add(entry);
        let ip = self.read_system(ivt, 2)? as u32;
        let cs = self.read_system(ivt.wrapping_add(2), 2)? as u16;

        let ss = *self.state.seg(SegReg::Ss);
        let values = [
            self.state.eflags & 0xffff,
            u32::from(self.state.seg(SegReg::Cs).selector),
            return_eip & 0xffff,
        ];
        let sp = self.state.sp();
        let new_sp = self.push_frame(&ss, sp, Width::Word, &values, 0, Exception::StackFault(0))?;

        self.state.set_sp(new_sp);
        self.state.load_real_segment(SegReg::Cs, cs);
        self.state.eip = ip;
        self.state.eflags &= !(FLAG_IF | FLAG_TF | FLAG_AC | FLAG_RF);
        Ok(())
    }

    fn deliver_protected(
        &mut self,
        vector: u8,
        error_code: Option<u32>,
        source: InterruptSource,
        return_eip: u32,
    ) -> CpuResult<()> {
        let ext = source.ext_bit();
        let idt_code = u16::from(vector) * 8 + 2 + ext;
        let cpl = self.state.cpl();
        let from_vm86 = self.state.mode() == CpuMode::Vm86;

        let entry = u32::from(vector) * 8;
        if entry + 7 > u32::from(self.state.idtr.limit) {
            return Err(Exception::GeneralProtection(idt_code).into());
        }
        let gate = crate::segmentation::Descriptor(
            self.read_system(self.state.idtr.base.wrapping_add(entry), 8)?,
        );
        let (kind, width) = match (gate.is_system(), gate.system_type()) {
            (true, system_type::TASK_GATE) => (GateKind::Task, Width::Dword),
            (true, system_type::INTERRUPT_GATE16) => (GateKind::Interrupt, Width::Word),
            (true, system_type::TRAP_GATE16) => (GateKind::Trap, Width::Word),
            (true, system_type::INTERRUPT_GATE32) => (GateKind::Interrupt, Width::Dword),
            (true, system_type::TRAP_GATE32) => (GateKind::Trap, Width::Dword),
            _ => return Err(Exception::GeneralProtection(idt_code).into()),
        };
        if source == InterruptSource::Software && gate.dpl() < cpl {
            return Err(Exception::GeneralProtection(idt_code).into());
        }
        if !gate.present() {
            return Err(Exception::SegmentNotPresent(idt_code).into());
        }
        if kind == GateKind::Task {
            // Hardware task switching is not modelled.
            return Err(Exception::GeneralProtection(idt_code).into());
        }

        let selector = gate.gate_selector();
        if is_null(selector) {
            return Err(Exception::GeneralProtection(ext).into());
        }
        let sel_code = selector_index(selector) | ext;
        let code = self
            .fetch_descriptor(selector)?
            .ok_or(Exception::GeneralProtection(sel_code))?;
        if !code.is_code() || code.dpl() > cpl {
            return Err(Exception::GeneralProtection(sel_code).into());
        }
        if !code.present() {
            return Err(Exception::SegmentNotPresent(sel_code).into());
        }
        let conforming = code.access() & crate::state::ACCESS_DC != 0;
        let target_cpl = if conforming { cpl } else { code.dpl() };
        if from_vm86 && (target_cpl != 0 || width == Width::Word) {
            return Err(Exception::GeneralProtection(sel_code).into());
        }

        let offset = match width {
            Width::Word => gate.gate_offset() & 0xffff,
            _ => gate.gate_offset(),
        };
        let cs_cache = code.to_segment(selector_index(selector) | u16::from(target_cpl));
        if offset > cs_cache.limit {
            return Err(Exception::GeneralProtection(ext).into());
        }

        let old_cs = u32::from(self.state.seg(SegReg::Cs).selector);
        let eflags = self.state.eflags;
        let mut values: Vec<u32> = Vec::with_capacity(10);

        let (new_ss, new_sp) = if target_cpl < cpl {
            let (ss_sel, esp) = self.tss_stack(target_cpl, ext)?;
            let ss_cache =
                self.validate_stack_segment(ss_sel, target_cpl, StackCheck::Tss { ext })?;
            if from_vm86 {
                for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    values.push(u32::from(self.state.seg(seg).selector));
                }
            }
            values.push(u32::from(self.state.seg(SegReg::Ss).selector));
            values.push(self.state.gpr[crate::state::gpr::ESP]);
            values.extend([eflags, old_cs, return_eip]);
            values.extend(error_code);
            let stack_fault = Exception::StackFault(selector_index(ss_sel) | ext);
            let sp = if ss_cache.is_big() { esp } else { esp & 0xffff };
            let new_sp =
                self.push_frame(&ss_cache, sp, width, &values, target_cpl, stack_fault)?;
            (Some(ss_cache), new_sp)
        } else {
            values.extend([eflags, old_cs, return_eip]);
            values.extend(error_code);
            let ss = *self.state.seg(SegReg::Ss);
            let sp = self.state.sp();
            let new_sp = self.push_frame(&ss, sp, width, &values, cpl, Exception::StackFault(ext))?;
            (None, new_sp)
        };
        self.mark_accessed(selector, code)?;

        // Commit.
        if let Some(ss_cache) = new_ss {
            *self.state.seg_mut(SegReg::Ss) = ss_cache;
            if from_vm86 {
                for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                    *self.state.seg_mut(seg) = Segment::null(0);
                }
            }
        }
        self.state.set_sp(new_sp);
        self.state.eflags &= !(FLAG_TF | FLAG_NT | FLAG_RF | FLAG_VM);
        if kind == GateKind::Interrupt {
            self.state.eflags &= !FLAG_IF;
        }
        *self.state.seg_mut(SegReg::Cs) = cs_cache;
        self.state.cpl = target_cpl;
        self.state.eip = offset;
        if from_vm86 {
            debug!(vector, "leaving virtual-8086 mode for interrupt handler");
        }
        Ok(())
    }

    /// SS:ESP for privilege level `dpl` from the current TSS.
    pub(crate) fn tss_stack(&mut self, dpl: u8, ext: u16) -> CpuResult<(u16, u32)> {
        let tr = self.state.tr;
        let fault = Exception::InvalidTss(selector_index(tr.selector) | ext);
        if !tr.valid {
            return Err(fault.into());
        }
        let dpl = u32::from(dpl);
        match tr.system_type() {
            system_type::TSS32_AVAILABLE | system_type::TSS32_BUSY => {
                let off = 4 + dpl * 8;
                if off + 5 > tr.limit {
                    return Err(fault.into());
                }
                let esp = self.read_system(tr.base.wrapping_add(off), 4)? as u32;
                let ss = self.read_system(tr.base.wrapping_add(off + 4), 2)? as u16;
                Ok((ss, esp))
            }
            system_type::TSS16_AVAILABLE | system_type::TSS16_BUSY => {
                let off = 2 + dpl * 4;
                if off + 3 > tr.limit {
                    return Err(fault.into());
                }
                let sp = self.read_system(tr.base.wrapping_add(off), 2)? as u32;
                let ss = self.read_system(tr.base.wrapping_add(off + 2), 2)? as u16;
                Ok((ss, sp))
            }
            _ => Err(fault.into()),
        }
    }

    /// IRET / IRETD.
    pub(crate) fn iret(&mut self, width: Width) -> CpuResult<()> {
        match self.state.mode() {
            CpuMode::Real => self.iret_real(width),
            CpuMode::Vm86 => {
                if self.state.iopl() < 3 {
                    return Err(Exception::GeneralProtection(0).into());
                }
                self.iret_real(width)
            }
            CpuMode::Protected | CpuMode::ProtectedPaged => self.iret_protected(width),
        }?;
        self.pending.unblock_nmi();
        Ok(())
    }

    fn iret_real(&mut self, width: Width) -> CpuResult<()> {
        let eip = self.peek(width, 0)?;
        let cs = self.peek(width, 1)? as u16;
        let flags = self.peek(width, 2)?;
        if eip > self.state.seg(SegReg::Cs).limit && width == Width::Dword {
            return Err(Exception::GeneralProtection(0).into());
        }
        let sp = self.state.sp().wrapping_add(3 * width.bytes()) & self.stack_mask();
        self.state.set_sp(sp);
        self.state.load_real_segment(SegReg::Cs, cs);
        self.state.eip = eip;

        let vm86 = self.state.mode() == CpuMode::Vm86;
        // VM86 IRET cannot change IOPL; neither mode changes VM or RF.
        let mut keep = FLAG_VM | FLAG_RF;
        if vm86 {
            keep |= FLAG_IOPL_MASK;
        }
        self.write_flags(flags, width, keep);
        Ok(())
    }

    fn iret_protected(&mut self, width: Width) -> CpuResult<()> {
        if self.state.flag(FLAG_NT) {
            // Nested-task return needs a task switch, which is not modelled.
            return Err(Exception::GeneralProtection(0).into());
        }
        let cpl = self.state.cpl();
        let eip = self.peek(width, 0)?;
        let cs_sel = self.peek(width, 1)? as u16;
        let flags = self.peek(width, 2)?;

        if width == Width::Dword && flags & FLAG_VM != 0 && cpl == 0 {
            return self.iret_to_vm86(eip, cs_sel, flags);
        }

        if is_null(cs_sel) {
            return Err(Exception::GeneralProtection(0).into());
        }
        let code = selector_index(cs_sel);
        let desc = self
            .fetch_descriptor(cs_sel)?
            .ok_or(Exception::GeneralProtection(code))?;
        let rpl = (cs_sel & 3) as u8;
        if !desc.is_code() || rpl < cpl {
            return Err(Exception::GeneralProtection(code).into());
        }
        let conforming = desc.access() & crate::state::ACCESS_DC != 0;
        if (conforming && desc.dpl() > rpl) || (!conforming && desc.dpl() != rpl) {
            return Err(Exception::GeneralProtection(code).into());
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(code).into());
        }
        let cs_cache = desc.to_segment(cs_sel);
        if eip > cs_cache.limit {
            return Err(Exception::GeneralProtection(0).into());
        }

        let old_iopl = self.state.iopl();
        let mut keep = FLAG_VM;
        if cpl > 0 {
            keep |= FLAG_IOPL_MASK;
        }
        if cpl > old_iopl {
            keep |= FLAG_IF;
        }

        if rpl == cpl {
            self.mark_accessed(cs_sel, desc)?;
            let sp = self.state.sp().wrapping_add(3 * width.bytes()) & self.stack_mask();
            self.state.set_sp(sp);
            *self.state.seg_mut(SegReg::Cs) = cs_cache;
            self.state.eip = eip;
            self.write_flags(flags, width, keep);
            return Ok(());
        }

        // Return to an outer privilege level: SS:ESP follow the basic frame.
        let new_esp = self.peek(width, 3)?;
        let ss_sel = self.peek(width, 4)? as u16;
        let ss_cache = self.validate_stack_segment(ss_sel, rpl, StackCheck::Load)?;
        self.mark_accessed(cs_sel, desc)?;

        *self.state.seg_mut(SegReg::Cs) = cs_cache;
        self.state.eip = eip;
        self.write_flags(flags, width, keep);
        *self.state.seg_mut(SegReg::Ss) = ss_cache;
        self.state.cpl = rpl;
        let new_sp = if width == Width::Word {
            new_esp & 0xffff
        } else {
            new_esp
        };
        self.state.set_sp(new_sp);
        self.invalidate_inaccessible_data_segments();
        Ok(())
    }

    fn iret_to_vm86(&mut self, eip: u32, cs: u16, flags: u32) -> CpuResult<()> {
        let esp = self.peek(Width::Dword, 3)?;
        let ss = self.peek(Width::Dword, 4)? as u16;
        let es = self.peek(Width::Dword, 5)? as u16;
        let ds = self.peek(Width::Dword, 6)? as u16;
        let fs = self.peek(Width::Dword, 7)? as u16;
        let gs = self.peek(Width::Dword, 8)? as u16;

        self.state.set_eflags(flags);
        self.state.cpl = 3;
        for (seg, sel) in [
            (SegReg::Cs, cs),
            (SegReg::Ss, ss),
            (SegReg::Es, es),
            (SegReg::Ds, ds),
            (SegReg::Fs, fs),
            (SegReg::Gs, gs),
        ] {
            self.state.load_real_segment(seg, sel);
        }
        self.state.gpr[crate::state::gpr::ESP] = esp;
        self.state.eip = eip & 0xffff;
        debug!(cs, eip, "entering virtual-8086 mode");
        Ok(())
    }

    /// Merge a popped flags image into EFLAGS, keeping the bits in `keep`.
    /// A 16-bit image only replaces the low word.
    pub(crate) fn write_flags(&mut self, value: u32, width: Width, keep: u32) {
        let mut writable = FLAGS_IMPLEMENTED & !keep;
        if width == Width::Word {
            writable &= 0xffff;
        }
        let merged = (self.state.eflags & !writable) | (value & writable);
        self.state.set_eflags(merged);
    }
}

#[cfg(test)]
mod tests {
    use super::PendingEventState;

    #[test]
    fn interrupt_inhibit_defaults_to_zero() {
        let pending = PendingEventState::default();
        assert_eq!(pending.interrupt_inhibit(), 0);
    }

    #[test]
    fn retire_instruction_ages_the_shadow() {
        let mut pending = PendingEventState::default();
        pending.inhibit_interrupts_for_one_instruction();
        assert_eq!(pending.interrupt_inhibit(), 1);
        pending.retire_instruction();
        assert_eq!(pending.interrupt_inhibit(), 0);
        pending.retire_instruction();
        assert_eq!(pending.interrupt_inhibit(), 0);
    }

    #[test]
    fn set_interrupt_inhibit_clamps() {
        let mut pending = PendingEventState::default();
        pending.set_interrupt_inhibit(u8::MAX);
        assert_eq!(pending.interrupt_inhibit(), 1);
    }

    #[test]
    fn nmi_is_blocked_until_unblocked() {
        let mut pending = PendingEventState::default();
        pending.raise_nmi();
        assert!(pending.take_nmi());
        pending.raise_nmi();
        assert!(!pending.take_nmi());
        pending.unblock_nmi();
        assert!(pending.take_nmi());
    }
}
