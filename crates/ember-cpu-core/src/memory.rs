//! Guest memory access through segmentation and paging.
//!
//! Accesses that straddle a page boundary translate both pages before
//! touching memory, so a #PF on the second page leaves the first untouched.

use ember_mmu::{AccessType, MemoryBus};
use ember_x86::{SegReg, Width};

use crate::exception::{CpuResult, Exception};
use crate::io::PortIo;
use crate::segmentation::{check_limit, linear_address};
use crate::state::Segment;
use crate::Vcpu;

const PAGE_SIZE: u32 = 0x1000;

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    #[inline]
    fn translate(&mut self, linear: u32, access: AccessType, cpl: u8) -> CpuResult<u64> {
        Ok(self.mmu.translate(&mut self.bus, linear, access, cpl)?)
    }

    /// Translate every page covered by `len` bytes at `linear`.
    /// Returns the physical address of the first byte and, for a split
    /// access, the byte count on the first page and the second page's address.
    fn translate_span(
        &mut self,
        linear: u32,
        len: u32,
        access: AccessType,
        cpl: u8,
    ) -> CpuResult<(u64, Option<(usize, u64)>)> {
        let first = self.translate(linear, access, cpl)?;
        let room = PAGE_SIZE - (linear & (PAGE_SIZE - 1));
        if len <= room {
            return Ok((first, None));
        }
        let second = self.translate(linear.wrapping_add(room), access, cpl)?;
        Ok((first, Some((room as usize, second))))
    }

    /// Read 1..=8 bytes at a linear address, little-endian.
    pub(crate) fn read_linear(
        &mut self,
        linear: u32,
        len: u32,
        access: AccessType,
        cpl: u8,
    ) -> CpuResult<u64> {
        debug_assert!((1..=8).contains(&len));
        let (paddr, split) = self.translate_span(linear, len, access, cpl)?;
        let value = match (split, len) {
            (None, 1) => u64::from(self.bus.read_u8(paddr)),
            (None, 2) => u64::from(self.bus.read_u16(paddr)),
            (None, 4) => u64::from(self.bus.read_u32(paddr)),
            (None, 8) => self.bus.read_u64(paddr),
            (split, _) => {
                let len = len as usize;
                let mut buf = [0u8; 8];
                match split {
                    None => self.bus.read_bytes(paddr, &mut buf[..len]),
                    Some((head, second)) => {
                        self.bus.read_bytes(paddr, &mut buf[..head]);
                        self.bus.read_bytes(second, &mut buf[head..len]);
                    }
                }
                u64::from_le_bytes(buf)
            }
        };
        Ok(value)
    }

    /// Write 1..=8 bytes at a linear address, little-endian.
    pub(crate) fn write_linear(&mut self, linear: u32, len: u32, value: u64, cpl: u8) -> CpuResult<()> {
        debug_assert!((1..=8).contains(&len));
        let (paddr, split) = self.translate_span(linear, len, AccessType::Write, cpl)?;
        match (split, len) {
            (None, 1) => self.bus.write_u8(paddr, value as u8),
            (None, 2) => self.bus.write_u16(paddr, value as u16),
            (None, 4) => self.bus.write_u32(paddr, value as u32),
            (None, 8) => self.bus.write_u64(paddr, value),
            (split, _) => {
                let len = len as usize;
                let buf = value.to_le_bytes();
                match split {
                    None => self.bus.write_bytes(paddr, &buf[..len]),
                    Some((head, second)) => {
                        self.bus.write_bytes(paddr, &buf[..head]);
                        self.bus.write_bytes(second, &buf[head..len]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Supervisor read of a system structure (GDT, LDT, IDT, TSS).
    pub(crate) fn read_system(&mut self, linear: u32, len: u32) -> CpuResult<u64> {
        self.read_linear(linear, len, AccessType::Read, 0)
    }

    pub(crate) fn write_system(&mut self, linear: u32, len: u32, value: u64) -> CpuResult<()> {
        self.write_linear(linear, len, value, 0)
    }

    /// Read `width` bytes at `seg:offset` with the current privilege level.
    pub fn read_mem(&mut self, seg: SegReg, offset: u32, width: Width) -> CpuResult<u32> {
        self.read_mem_as(seg, offset, width, AccessType::Read)
    }

    /// Read the destination of a read-modify-write instruction. Segment and
    /// page checks use write intent so the fault, if any, is the write fault.
    pub(crate) fn read_mem_rmw(&mut self, seg: SegReg, offset: u32, width: Width) -> CpuResult<u32> {
        self.read_mem_as(seg, offset, width, AccessType::Write)
    }

    fn read_mem_as(
        &mut self,
        seg: SegReg,
        offset: u32,
        width: Width,
        access: AccessType,
    ) -> CpuResult<u32> {
        let linear = linear_address(&self.state, seg, offset, width.bytes(), access)?;
        let cpl = self.state.cpl();
        Ok(self.read_linear(linear, width.bytes(), access, cpl)? as u32)
    }

    pub fn write_mem(&mut self, seg: SegReg, offset: u32, width: Width, value: u32) -> CpuResult<()> {
        let linear = linear_address(&self.state, seg, offset, width.bytes(), AccessType::Write)?;
        let cpl = self.state.cpl();
        self.write_linear(linear, width.bytes(), u64::from(value), cpl)
    }

    pub(crate) fn read_mem_u64(&mut self, seg: SegReg, offset: u32, access: AccessType) -> CpuResult<u64> {
        let linear = linear_address(&self.state, seg, offset, 8, access)?;
        let cpl = self.state.cpl();
        self.read_linear(linear, 8, access, cpl)
    }

    pub(crate) fn write_mem_u64(&mut self, seg: SegReg, offset: u32, value: u64) -> CpuResult<()> {
        let linear = linear_address(&self.state, seg, offset, 8, AccessType::Write)?;
        let cpl = self.state.cpl();
        self.write_linear(linear, 8, value, cpl)
    }

    /// Fetch one code byte at `CS:offset`.
    pub(crate) fn fetch_code_byte(&mut self, offset: u32) -> CpuResult<u8> {
        let linear = linear_address(&self.state, SegReg::Cs, offset, 1, AccessType::Execute)?;
        let cpl = self.state.cpl();
        Ok(self.read_linear(linear, 1, AccessType::Execute, cpl)? as u8)
    }

    /// Push `values` (first element pushed first) onto the stack described by
    /// `ss` starting below `sp`, checking the whole frame before writing any
    /// of it. Returns the new stack pointer.
    pub(crate) fn push_frame(
        &mut self,
        ss: &Segment,
        sp: u32,
        width: Width,
        values: &[u32],
        cpl: u8,
        limit_fault: Exception,
    ) -> CpuResult<u32> {
        let size = width.bytes();
        let mask = if ss.is_big() { u32::MAX } else { 0xffff };
        let slot = |k: usize| sp.wrapping_sub(size * (k as u32 + 1)) & mask;

        for k in 0..values.len() {
            let linear = check_limit(ss, slot(k), size, limit_fault)?;
            self.translate_span(linear, size, AccessType::Write, cpl)?;
        }
        for (k, &value) in values.iter().enumerate() {
            let linear = ss.base.wrapping_add(slot(k));
            self.write_linear(linear, size, u64::from(value), cpl)?;
        }
        Ok(slot(values.len().saturating_sub(1)))
    }

    /// Read the stack slot `index` entries above `sp` on the stack described by `ss`.
    pub(crate) fn read_stack_slot(
        &mut self,
        ss: &Segment,
        sp: u32,
        width: Width,
        index: u32,
        cpl: u8,
        limit_fault: Exception,
    ) -> CpuResult<u32> {
        let mask = if ss.is_big() { u32::MAX } else { 0xffff };
        let offset = sp.wrapping_add(index * width.bytes()) & mask;
        let linear = check_limit(ss, offset, width.bytes(), limit_fault)?;
        Ok(self.read_linear(linear, width.bytes(), AccessType::Read, cpl)? as u32)
    }

    #[inline]
    pub(crate) fn stack_mask(&self) -> u32 {
        if self.state.stack_is_32() {
            u32::MAX
        } else {
            0xffff
        }
    }

    pub fn push(&mut self, width: Width, value: u32) -> CpuResult<()> {
        let sp = self.state.sp().wrapping_sub(width.bytes()) & self.stack_mask();
        self.write_mem(SegReg::Ss, sp, width, value)?;
        self.state.set_sp(sp);
        Ok(())
    }

    pub fn pop(&mut self, width: Width) -> CpuResult<u32> {
        let sp = self.state.sp();
        let value = self.read_mem(SegReg::Ss, sp, width)?;
        self.state
            .set_sp(sp.wrapping_add(width.bytes()) & self.stack_mask());
        Ok(value)
    }

    /// Read the stack `index` slots above the current stack pointer without popping.
    pub(crate) fn peek(&mut self, width: Width, index: u32) -> CpuResult<u32> {
        let offset = self.state.sp().wrapping_add(index * width.bytes()) & self.stack_mask();
        self.read_mem(SegReg::Ss, offset, width)
    }
}
