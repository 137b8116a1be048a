//! Segmentation unit: descriptor lookup, selector loads and limit checks.

use ember_mmu::{AccessType, MemoryBus};
use ember_x86::SegReg;
use tracing::trace;

use crate::exception::{CpuResult, Exception};
use crate::io::PortIo;
use crate::state::{
    CpuState, Segment, ACCESS_ACCESSED, ACCESS_CODE, ACCESS_DC, ACCESS_PRESENT, ACCESS_RW,
    ACCESS_S, SEG_FLAG_G,
};
use crate::Vcpu;

/// A raw 8-byte segment or gate descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub u64);

impl Descriptor {
    pub fn base(self) -> u32 {
        let lo = (self.0 >> 16) & 0x00ff_ffff;
        let hi = (self.0 >> 56) & 0xff;
        (lo | (hi << 24)) as u32
    }

    /// Limit in bytes, granularity applied.
    pub fn limit(self) -> u32 {
        let raw = ((self.0 & 0xffff) | ((self.0 >> 32) & 0x000f_0000)) as u32;
        if self.flags() & SEG_FLAG_G != 0 {
            (raw << 12) | 0xfff
        } else {
            raw
        }
    }

    pub fn access(self) -> u8 {
        (self.0 >> 40) as u8
    }

    pub fn flags(self) -> u8 {
        ((self.0 >> 52) & 0xf) as u8
    }

    pub fn dpl(self) -> u8 {
        (self.access() >> 5) & 3
    }

    pub fn present(self) -> bool {
        self.access() & ACCESS_PRESENT != 0
    }

    /// S bit clear: TSS, LDT or gate.
    pub fn is_system(self) -> bool {
        self.access() & ACCESS_S == 0
    }

    pub fn is_code(self) -> bool {
        !self.is_system() && self.access() & ACCESS_CODE != 0
    }

    pub fn is_data(self) -> bool {
        !self.is_system() && self.access() & ACCESS_CODE == 0
    }

    pub fn system_type(self) -> u8 {
        self.access() & 0xf
    }

    pub fn gate_offset(self) -> u32 {
        ((self.0 & 0xffff) | ((self.0 >> 32) & 0xffff_0000)) as u32
    }

    pub fn gate_selector(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn gate_param_count(self) -> u8 {
        ((self.0 >> 32) & 0x1f) as u8
    }

    pub fn to_segment(self, selector: u16) -> Segment {
        Segment {
            selector,
            base: self.base(),
            limit: self.limit(),
            access: self.access(),
            flags: self.flags(),
            valid: true,
        }
    }
}

/// System descriptor types (S = 0).
pub mod system_type {
    pub const TSS16_AVAILABLE: u8 = 0x1;
    pub const LDT: u8 = 0x2;
    pub const TSS16_BUSY: u8 = 0x3;
    pub const CALL_GATE16: u8 = 0x4;
    pub const TASK_GATE: u8 = 0x5;
    pub const INTERRUPT_GATE16: u8 = 0x6;
    pub const TRAP_GATE16: u8 = 0x7;
    pub const TSS32_AVAILABLE: u8 = 0x9;
    pub const TSS32_BUSY: u8 = 0xb;
    pub const CALL_GATE32: u8 = 0xc;
    pub const INTERRUPT_GATE32: u8 = 0xe;
    pub const TRAP_GATE32: u8 = 0xf;
}

/// Which exception a failed stack-segment validation raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackCheck {
    /// MOV/POP SS, LSS, IRET and RETF to an outer level: #GP(sel).
    Load,
    /// Stack fetched from the TSS during a privilege switch: #TS(sel).
    Tss { ext: u16 },
}

/// Selector with the RPL bits cleared, as used in error codes.
#[inline]
pub(crate) fn selector_index(selector: u16) -> u16 {
    selector & !3
}

/// GDT index 0 with any RPL.
#[inline]
pub(crate) fn is_null(selector: u16) -> bool {
    selector & !3 == 0
}

/// Check `len` bytes at `offset` against a segment's limit and return the
/// linear address. Violations raise `fault`.
pub fn check_limit(cache: &Segment, offset: u32, len: u32, fault: Exception) -> Result<u32, Exception> {
    let first = u64::from(offset);
    let last = first + u64::from(len.max(1)) - 1;
    if cache.is_expand_down() {
        let upper = if cache.is_big() { 0xffff_ffff } else { 0xffff };
        if first <= u64::from(cache.limit) || last > upper {
            return Err(fault);
        }
    } else if last > u64::from(cache.limit) {
        return Err(fault);
    }
    Ok(cache.base.wrapping_add(offset))
}

/// Resolve `seg:offset` for an access of `len` bytes.
///
/// Raises #SS(0) for stack-segment violations and #GP(0) otherwise. Type
/// checks (null, read-only, execute-only) apply in protected mode only.
pub fn linear_address(
    state: &CpuState,
    seg: SegReg,
    offset: u32,
    len: u32,
    access: AccessType,
) -> Result<u32, Exception> {
    let cache = state.seg(seg);
    let fault = if seg == SegReg::Ss {
        Exception::StackFault(0)
    } else {
        Exception::GeneralProtection(0)
    };
    if state.mode().is_protected() {
        let allowed = cache.valid
            && match access {
                AccessType::Read => cache.readable(),
                AccessType::Write => cache.writable(),
                AccessType::Execute => cache.is_code(),
            };
        if !allowed {
            return Err(fault);
        }
    }
    check_limit(cache, offset, len, fault)
}

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    /// Read the descriptor a selector points at, or `None` if the selector
    /// lies outside its table (or names the LDT while none is loaded).
    pub(crate) fn fetch_descriptor(&mut self, selector: u16) -> CpuResult<Option<Descriptor>> {
        let (base, limit) = if selector & 4 != 0 {
            let ldtr = self.state.ldtr;
            if !ldtr.valid {
                return Ok(None);
            }
            (ldtr.base, ldtr.limit)
        } else {
            (self.state.gdtr.base, u32::from(self.state.gdtr.limit))
        };
        let offset = u32::from(selector_index(selector) & !7);
        if offset + 7 > limit {
            return Ok(None);
        }
        let raw = self.read_system(base.wrapping_add(offset), 8)?;
        Ok(Some(Descriptor(raw)))
    }

    /// Set the accessed bit in the in-memory descriptor.
    pub(crate) fn mark_accessed(&mut self, selector: u16, desc: Descriptor) -> CpuResult<()> {
        if desc.access() & ACCESS_ACCESSED != 0 {
            return Ok(());
        }
        let table_base = if selector & 4 != 0 {
            self.state.ldtr.base
        } else {
            self.state.gdtr.base
        };
        let addr = table_base.wrapping_add(u32::from(selector & !7)).wrapping_add(5);
        self.write_system(addr, 1, u64::from(desc.access() | ACCESS_ACCESSED))
    }

    /// Validate a stack segment for privilege level `cpl` and return its cache.
    pub(crate) fn validate_stack_segment(
        &mut self,
        selector: u16,
        cpl: u8,
        check: StackCheck,
    ) -> CpuResult<Segment> {
        let (null_code, ext) = match check {
            StackCheck::Load => (0, 0),
            StackCheck::Tss { ext } => (ext, ext),
        };
        let fail = |code: u16| -> Exception {
            match check {
                StackCheck::Load => Exception::GeneralProtection(code),
                StackCheck::Tss { .. } => Exception::InvalidTss(code),
            }
        };
        let sel_code = selector_index(selector) | ext;
        if is_null(selector) {
            return Err(fail(null_code).into());
        }
        if (selector & 3) as u8 != cpl {
            return Err(fail(sel_code).into());
        }
        let desc = self
            .fetch_descriptor(selector)?
            .ok_or_else(|| fail(sel_code))?;
        if !desc.is_data() || desc.access() & ACCESS_RW == 0 || desc.dpl() != cpl {
            return Err(fail(sel_code).into());
        }
        if !desc.present() {
            return Err(Exception::StackFault(sel_code).into());
        }
        self.mark_accessed(selector, desc)?;
        Ok(desc.to_segment(selector))
    }

    /// Load a data or stack segment register (not CS).
    pub fn load_segment(&mut self, seg: SegReg, selector: u16) -> CpuResult<()> {
        if !self.state.mode().is_protected() {
            self.state.load_real_segment(seg, selector);
            return Ok(());
        }

        let cpl = self.state.cpl();
        if seg == SegReg::Ss {
            let cache = self.validate_stack_segment(selector, cpl, StackCheck::Load)?;
            *self.state.seg_mut(SegReg::Ss) = cache;
            return Ok(());
        }

        if is_null(selector) {
            *self.state.seg_mut(seg) = Segment::null(selector);
            return Ok(());
        }

        let code = selector_index(selector);
        let desc = self
            .fetch_descriptor(selector)?
            .ok_or(Exception::GeneralProtection(code))?;
        let readable_code = desc.is_code() && desc.access() & ACCESS_RW != 0;
        if !(desc.is_data() || readable_code) {
            return Err(Exception::GeneralProtection(code).into());
        }
        let conforming = desc.is_code() && desc.access() & ACCESS_DC != 0;
        let rpl = (selector & 3) as u8;
        if !conforming && rpl.max(cpl) > desc.dpl() {
            return Err(Exception::GeneralProtection(code).into());
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(code).into());
        }
        self.mark_accessed(selector, desc)?;
        *self.state.seg_mut(seg) = desc.to_segment(selector);
        trace!(?seg, selector, base = desc.base(), limit = desc.limit(), "segment loaded");
        Ok(())
    }

    /// After a return to an outer privilege level, null any data segment the
    /// new CPL may not use.
    pub(crate) fn invalidate_inaccessible_data_segments(&mut self) {
        let cpl = self.state.cpl();
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let cache = *self.state.seg(seg);
            if !cache.valid {
                continue;
            }
            let exempt = cache.is_conforming();
            if !exempt && cache.dpl() < cpl {
                *self.state.seg_mut(seg) = Segment::null(0);
            }
        }
    }
}
