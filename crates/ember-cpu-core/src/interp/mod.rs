//! Instruction execution.
//!
//! [`Vcpu::exec`] runs one decoded instruction against the current state.
//! EIP is advanced to the next instruction before the handler runs, so
//! control transfers simply overwrite it. A returned fault leaves partial
//! updates behind; the caller restores its pre-instruction snapshot.

pub(crate) mod alu;
mod control;
mod string;
mod system;

use ember_mmu::{AccessType, MemoryBus};
use ember_x86::{
    AluOp, BitOp, BitSrc, Cond, Form, Instruction, MemOperand, Op, RmOperand, SegReg, ShiftCount,
    Width,
};

use crate::exception::{CpuResult, Exception, InternalError};
use crate::io::PortIo;
use crate::state::{
    gpr, CR0_EM, CR0_MP, CR0_TS, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF,
};
use crate::Vcpu;

use alu::{
    add_with_flags, double_shift_with_flags, imul_with_flags, inc_dec_with_flags,
    logic_with_flags, mul_with_flags, shift_with_flags, sub_with_flags,
};

/// What the step loop should do after an instruction completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    /// STI, MOV SS, POP SS: block maskable interrupts for one instruction.
    InhibitInterrupts,
    Halt,
    /// INT n, INT3 and INTO; delivered through the IDT as software
    /// interrupts with the next instruction's address.
    Interrupt(u8),
}

/// A resolved operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    Reg(u8),
    Mem(SegReg, u32),
}

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    pub(crate) fn exec(&mut self, inst: &Instruction) -> CpuResult<Flow> {
        let ip_mask = if self.state.code_is_32() { u32::MAX } else { 0xffff };
        self.state.eip = self.state.eip.wrapping_add(u32::from(inst.len)) & ip_mask;
        let w = inst.width;
        let opsize = inst.operand_size;

        match inst.op {
            Op::Alu(op, form) => self.exec_alu(inst, op, form)?,
            Op::Test(form) => {
                let dst = self.rm_loc(inst)?;
                let a = self.read_loc(dst, w)?;
                let b = match form {
                    Form::RmImm => inst.imm,
                    _ => self.state.read_reg(inst.reg, w),
                };
                logic_with_flags(&mut self.state.eflags, a & b, w);
            }
            Op::Inc | Op::Dec => {
                let dst = self.rm_loc(inst)?;
                let v = self.read_loc_rmw(dst, w)?;
                let r = inc_dec_with_flags(&mut self.state.eflags, v, inst.op == Op::Inc, w);
                self.write_loc(dst, w, r)?;
            }
            Op::Not => {
                let dst = self.rm_loc(inst)?;
                let v = self.read_loc_rmw(dst, w)?;
                self.write_loc(dst, w, !v)?;
            }
            Op::Neg => {
                let dst = self.rm_loc(inst)?;
                let v = self.read_loc_rmw(dst, w)?;
                let r = sub_with_flags(&mut self.state.eflags, 0, v, false, w);
                self.write_loc(dst, w, r)?;
            }
            Op::Mul | Op::Imul => self.exec_mul(inst)?,
            Op::ImulRegRm | Op::ImulImm => {
                let src = self.rm_loc(inst)?;
                let a = self.read_loc(src, w)?;
                let b = if inst.op == Op::ImulImm {
                    inst.imm
                } else {
                    self.state.read_reg(inst.reg, w)
                };
                let (lo, _) = imul_with_flags(&mut self.state.eflags, a, b, w);
                self.state.write_reg(inst.reg, w, lo);
            }
            Op::Div | Op::Idiv => self.exec_div(inst)?,
            Op::Shift(op, count) => {
                let count = self.shift_count(inst, count);
                let dst = self.rm_loc(inst)?;
                let v = self.read_loc_rmw(dst, w)?;
                let r = shift_with_flags(&mut self.state.eflags, op, v, count, w);
                self.write_loc(dst, w, r)?;
            }
            Op::Shld(count) | Op::Shrd(count) => {
                let count = self.shift_count(inst, count);
                let dst = self.rm_loc(inst)?;
                let v = self.read_loc_rmw(dst, w)?;
                let src = self.state.read_reg(inst.reg, w);
                let left = matches!(inst.op, Op::Shld(_));
                let r = double_shift_with_flags(&mut self.state.eflags, left, v, src, count, w);
                self.write_loc(dst, w, r)?;
            }

            Op::Mov(form) => {
                let dst = self.rm_loc(inst)?;
                match form {
                    Form::RmReg => {
                        let v = self.state.read_reg(inst.reg, w);
                        self.write_loc(dst, w, v)?;
                    }
                    Form::RegRm => {
                        let v = self.read_loc(dst, w)?;
                        self.state.write_reg(inst.reg, w, v);
                    }
                    Form::RmImm => self.write_loc(dst, w, inst.imm)?,
                }
            }
            Op::MovFromSeg => {
                let seg = segment_operand(inst)?;
                let dst = self.rm_loc(inst)?;
                let sel = u32::from(self.state.seg(seg).selector);
                self.write_loc(dst, w, sel)?;
            }
            Op::MovToSeg => {
                let seg = segment_operand(inst)?;
                let src = self.rm_loc(inst)?;
                let sel = self.read_loc(src, Width::Word)? as u16;
                self.load_segment(seg, sel)?;
                if seg == SegReg::Ss {
                    return Ok(Flow::InhibitInterrupts);
                }
            }
            Op::MovFromCr | Op::MovToCr | Op::MovFromDr | Op::MovToDr => {
                self.exec_mov_special(inst)?
            }
            Op::Movzx(src_w) | Op::Movsx(src_w) => {
                let src = self.rm_loc(inst)?;
                let v = self.read_loc(src, src_w)?;
                let v = if matches!(inst.op, Op::Movsx(_)) {
                    src_w.sign_extend(v)
                } else {
                    v
                };
                self.state.write_reg(inst.reg, w, v);
            }
            Op::Lea => {
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                self.state.write_reg(inst.reg, w, ea);
            }
            Op::Xchg => {
                let dst = self.rm_loc(inst)?;
                let a = self.read_loc_rmw(dst, w)?;
                let b = self.state.read_reg(inst.reg, w);
                self.write_loc(dst, w, b)?;
                self.state.write_reg(inst.reg, w, a);
            }
            Op::Xadd => {
                let dst = self.rm_loc(inst)?;
                let d = self.read_loc_rmw(dst, w)?;
                let s = self.state.read_reg(inst.reg, w);
                let sum = add_with_flags(&mut self.state.eflags, d, s, false, w);
                self.state.write_reg(inst.reg, w, d);
                self.write_loc(dst, w, sum)?;
            }
            Op::Cmpxchg => {
                let dst = self.rm_loc(inst)?;
                let d = self.read_loc_rmw(dst, w)?;
                let acc = self.state.read_reg(gpr::EAX as u8, w);
                sub_with_flags(&mut self.state.eflags, acc, d, false, w);
                if acc == d {
                    let s = self.state.read_reg(inst.reg, w);
                    self.write_loc(dst, w, s)?;
                } else {
                    // The destination is written back either way.
                    self.write_loc(dst, w, d)?;
                    self.state.write_reg(gpr::EAX as u8, w, d);
                }
            }
            Op::Cmpxchg8b => {
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                let current = self.read_mem_u64(m.seg, ea, AccessType::Write)?;
                let expected = u64::from(self.state.gpr[gpr::EAX])
                    | (u64::from(self.state.gpr[gpr::EDX]) << 32);
                if current == expected {
                    let new = u64::from(self.state.gpr[gpr::EBX])
                        | (u64::from(self.state.gpr[gpr::ECX]) << 32);
                    self.write_mem_u64(m.seg, ea, new)?;
                    self.state.set_flag(FLAG_ZF, true);
                } else {
                    self.write_mem_u64(m.seg, ea, current)?;
                    self.state.gpr[gpr::EAX] = current as u32;
                    self.state.gpr[gpr::EDX] = (current >> 32) as u32;
                    self.state.set_flag(FLAG_ZF, false);
                }
            }
            Op::Cmovcc(cond) => {
                let src = self.rm_loc(inst)?;
                let v = self.read_loc(src, w)?;
                if self.condition(cond) {
                    self.state.write_reg(inst.reg, w, v);
                }
            }
            Op::Setcc(cond) => {
                let dst = self.rm_loc(inst)?;
                let v = u32::from(self.condition(cond));
                self.write_loc(dst, Width::Byte, v)?;
            }
            Op::Bswap => {
                let dst = self.rm_loc(inst)?;
                let v = self.read_loc(dst, Width::Dword)?;
                match w {
                    Width::Dword => self.write_loc(dst, w, v.swap_bytes())?,
                    // 16-bit BSWAP is undefined; hardware clears the register.
                    _ => self.write_loc(dst, w, 0)?,
                }
            }
            Op::Cbw => {
                let v = match opsize {
                    Width::Dword => Width::Word.sign_extend(self.state.gpr[gpr::EAX]),
                    _ => Width::Byte.sign_extend(self.state.gpr[gpr::EAX]),
                };
                self.state.write_reg(gpr::EAX as u8, opsize, v);
            }
            Op::Cwd => {
                let acc = self.state.read_reg(gpr::EAX as u8, opsize);
                let fill = if acc & opsize.sign_bit() != 0 { u32::MAX } else { 0 };
                self.state.write_reg(gpr::EDX as u8, opsize, fill);
            }
            Op::Lahf => {
                let image = self.state.eflags & 0xff;
                self.state.write_reg(4, Width::Byte, image);
            }
            Op::Sahf => {
                let ah = self.state.read_reg(4, Width::Byte);
                let mask = FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;
                self.state.eflags = (self.state.eflags & !mask) | (ah & mask);
            }
            Op::Xlat => {
                let al = self.state.gpr[gpr::EAX] & 0xff;
                let base = self.state.read_reg(gpr::EBX as u8, inst.address_size);
                let offset = base.wrapping_add(al) & inst.address_size.mask();
                let v = self.read_mem(inst.data_segment(), offset, Width::Byte)?;
                self.state.write_reg(gpr::EAX as u8, Width::Byte, v);
            }
            Op::LoadFarPtr(seg) => {
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                let offset = self.read_mem(m.seg, ea, opsize)?;
                let sel = self.read_mem(m.seg, ea.wrapping_add(opsize.bytes()), Width::Word)?;
                self.load_segment(seg, sel as u16)?;
                self.state.write_reg(inst.reg, opsize, offset);
            }
            Op::Bound => {
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                let lower = self.read_mem(m.seg, ea, opsize)?;
                let upper = self.read_mem(m.seg, ea.wrapping_add(opsize.bytes()), opsize)?;
                let index = opsize.sign_extend(self.state.read_reg(inst.reg, opsize)) as i32;
                let lower = opsize.sign_extend(lower) as i32;
                let upper = opsize.sign_extend(upper) as i32;
                if index < lower || index > upper {
                    return Err(Exception::BoundRange.into());
                }
            }

            Op::Push => {
                let src = self.rm_loc(inst)?;
                let v = self.read_loc(src, opsize)?;
                self.push(opsize, v)?;
            }
            Op::PushImm => self.push(opsize, inst.imm)?,
            Op::PushSeg(seg) => {
                let sel = u32::from(self.state.seg(seg).selector);
                self.push(opsize, sel)?;
            }
            Op::Pop => {
                let v = self.pop(opsize)?;
                // A memory destination is addressed with the incremented ESP.
                let dst = self.rm_loc(inst)?;
                self.write_loc(dst, opsize, v)?;
            }
            Op::PopSeg(seg) => {
                let sel = self.peek(opsize, 0)? as u16;
                self.load_segment(seg, sel)?;
                let sp = self.state.sp().wrapping_add(opsize.bytes()) & self.stack_mask();
                self.state.set_sp(sp);
                if seg == SegReg::Ss {
                    return Ok(Flow::InhibitInterrupts);
                }
            }
            Op::Pusha => {
                let sp = self.state.read_reg(gpr::ESP as u8, opsize);
                for r in 0..8u8 {
                    let v = if usize::from(r) == gpr::ESP {
                        sp
                    } else {
                        self.state.read_reg(r, opsize)
                    };
                    self.push(opsize, v)?;
                }
            }
            Op::Popa => {
                for r in (0..8u8).rev() {
                    let v = self.pop(opsize)?;
                    if usize::from(r) != gpr::ESP {
                        self.state.write_reg(r, opsize, v);
                    }
                }
            }
            Op::Pushf => self.exec_pushf(opsize)?,
            Op::Popf => self.exec_popf(opsize)?,
            Op::Enter => self.exec_enter(inst)?,
            Op::Leave => self.exec_leave(opsize)?,

            Op::JmpRel => {
                let target = self.state.eip.wrapping_add(inst.imm);
                self.near_branch(target, opsize)?;
            }
            Op::JmpIndirect => {
                let src = self.rm_loc(inst)?;
                let target = self.read_loc(src, opsize)?;
                self.near_branch(target, opsize)?;
            }
            Op::CallRel => {
                let target = self.state.eip.wrapping_add(inst.imm);
                self.near_call(target, opsize)?;
            }
            Op::CallIndirect => {
                let src = self.rm_loc(inst)?;
                let target = self.read_loc(src, opsize)?;
                self.near_call(target, opsize)?;
            }
            Op::JmpFar => self.far_jump(inst.imm2 as u16, inst.imm, opsize)?,
            Op::CallFar => self.far_call(inst.imm2 as u16, inst.imm, opsize)?,
            Op::JmpFarIndirect | Op::CallFarIndirect => {
                let m = mem_operand(inst)?;
                let ea = self.effective_address(&m);
                let offset = self.read_mem(m.seg, ea, opsize)?;
                let sel = self.read_mem(m.seg, ea.wrapping_add(opsize.bytes()), Width::Word)? as u16;
                if inst.op == Op::JmpFarIndirect {
                    self.far_jump(sel, offset, opsize)?;
                } else {
                    self.far_call(sel, offset, opsize)?;
                }
            }
            Op::Jcc(cond) => {
                if self.condition(cond) {
                    let target = self.state.eip.wrapping_add(inst.imm);
                    self.near_branch(target, opsize)?;
                }
            }
            Op::Jcxz => {
                if self.state.read_reg(gpr::ECX as u8, inst.address_size) == 0 {
                    let target = self.state.eip.wrapping_add(inst.imm);
                    self.near_branch(target, opsize)?;
                }
            }
            Op::Loop(kind) => self.exec_loop(inst, kind)?,
            Op::Ret => self.near_return(opsize, inst.imm)?,
            Op::RetFar => self.far_return(opsize, inst.imm)?,
            Op::Int => {
                self.check_vm86_iopl()?;
                return Ok(Flow::Interrupt(inst.imm as u8));
            }
            Op::Int3 => return Ok(Flow::Interrupt(Exception::Breakpoint.vector())),
            Op::Into => {
                if self.state.flag(FLAG_OF) {
                    return Ok(Flow::Interrupt(Exception::Overflow.vector()));
                }
            }
            Op::Iret => self.iret(opsize)?,
            Op::Hlt => {
                if self.state.cpl() != 0 {
                    return Err(Exception::GeneralProtection(0).into());
                }
                return Ok(Flow::Halt);
            }

            Op::Nop => {}
            Op::Wait => {
                if self.state.cr0 & (CR0_MP | CR0_TS) == CR0_MP | CR0_TS {
                    return Err(Exception::DeviceNotAvailable.into());
                }
            }
            Op::Clc => self.state.set_flag(FLAG_CF, false),
            Op::Stc => self.state.set_flag(FLAG_CF, true),
            Op::Cmc => self.state.eflags ^= FLAG_CF,
            Op::Cld => self.state.set_flag(FLAG_DF, false),
            Op::Std => self.state.set_flag(FLAG_DF, true),
            Op::Cli => self.exec_cli()?,
            Op::Sti => return self.exec_sti(),

            Op::String(op) => self.exec_string(inst, op)?,
            Op::In(src) | Op::Out(src) => self.exec_port_io(inst, src)?,

            Op::Lgdt
            | Op::Lidt
            | Op::Sgdt
            | Op::Sidt
            | Op::Lldt
            | Op::Sldt
            | Op::Ltr
            | Op::Str
            | Op::Lmsw
            | Op::Smsw
            | Op::Clts
            | Op::Invlpg
            | Op::Lar
            | Op::Lsl
            | Op::Verr
            | Op::Verw
            | Op::Arpl
            | Op::Cpuid
            | Op::Rdtsc
            | Op::Rdmsr
            | Op::Wrmsr
            | Op::Wbinvd => self.exec_system(inst)?,

            Op::Bt(op, src) => self.exec_bit_test(inst, op, src)?,
            Op::Bsf | Op::Bsr => {
                let src = self.rm_loc(inst)?;
                let v = self.read_loc(src, w)?;
                if v == 0 {
                    self.state.set_flag(FLAG_ZF, true);
                } else {
                    let index = if inst.op == Op::Bsf {
                        v.trailing_zeros()
                    } else {
                        31 - v.leading_zeros()
                    };
                    self.state.set_flag(FLAG_ZF, false);
                    self.state.write_reg(inst.reg, w, index);
                }
            }

            Op::Daa | Op::Das => {
                let al = self.state.gpr[gpr::EAX] as u8;
                let r = alu::decimal_adjust(&mut self.state.eflags, al, inst.op == Op::Das);
                self.state.write_reg(gpr::EAX as u8, Width::Byte, u32::from(r));
            }
            Op::Aaa | Op::Aas => {
                let ax = self.state.gpr[gpr::EAX] as u16;
                let r = alu::ascii_adjust(&mut self.state.eflags, ax, inst.op == Op::Aas);
                self.state.write_reg(gpr::EAX as u8, Width::Word, u32::from(r));
            }
            Op::Aam => {
                let al = self.state.gpr[gpr::EAX] as u8;
                let r = alu::aam(&mut self.state.eflags, al, inst.imm as u8)
                    .ok_or(Exception::DivideError)?;
                self.state.write_reg(gpr::EAX as u8, Width::Word, u32::from(r));
            }
            Op::Aad => {
                let ax = self.state.gpr[gpr::EAX] as u16;
                let r = alu::aad(&mut self.state.eflags, ax, inst.imm as u8);
                self.state.write_reg(gpr::EAX as u8, Width::Word, u32::from(r));
            }

            Op::Fpu => {
                // No x87 unit: the OS is expected to emulate it via #NM.
                if self.state.cr0 & (CR0_EM | CR0_TS) != 0 {
                    return Err(Exception::DeviceNotAvailable.into());
                }
                return Err(Exception::InvalidOpcode.into());
            }
        }
        Ok(Flow::Next)
    }

    fn exec_alu(&mut self, inst: &Instruction, op: AluOp, form: Form) -> CpuResult<()> {
        let w = inst.width;
        let rm = self.rm_loc(inst)?;
        let (dst, src) = match form {
            Form::RmReg => (rm, self.state.read_reg(inst.reg, w)),
            Form::RmImm => (rm, inst.imm),
            Form::RegRm => {
                let src = self.read_loc(rm, w)?;
                (Loc::Reg(inst.reg), src)
            }
        };
        if op == AluOp::Cmp {
            let d = self.read_loc(dst, w)?;
            sub_with_flags(&mut self.state.eflags, d, src, false, w);
            return Ok(());
        }
        let d = self.read_loc_rmw(dst, w)?;
        let flags = &mut self.state.eflags;
        let carry = *flags & FLAG_CF != 0;
        let result = match op {
            AluOp::Add => add_with_flags(flags, d, src, false, w),
            AluOp::Adc => add_with_flags(flags, d, src, carry, w),
            AluOp::Sub => sub_with_flags(flags, d, src, false, w),
            AluOp::Sbb => sub_with_flags(flags, d, src, carry, w),
            AluOp::And => logic_with_flags(flags, d & src, w),
            AluOp::Or => logic_with_flags(flags, d | src, w),
            AluOp::Xor => logic_with_flags(flags, d ^ src, w),
            AluOp::Cmp => d,
        };
        self.write_loc(dst, w, result)
    }

    fn exec_mul(&mut self, inst: &Instruction) -> CpuResult<()> {
        let w = inst.width;
        let src = self.rm_loc(inst)?;
        let b = self.read_loc(src, w)?;
        let a = self.state.read_reg(gpr::EAX as u8, w);
        let (lo, hi) = if inst.op == Op::Mul {
            mul_with_flags(&mut self.state.eflags, a, b, w)
        } else {
            imul_with_flags(&mut self.state.eflags, a, b, w)
        };
        match w {
            Width::Byte => self.state.write_reg(gpr::EAX as u8, Width::Word, lo | (hi << 8)),
            _ => {
                self.state.write_reg(gpr::EAX as u8, w, lo);
                self.state.write_reg(gpr::EDX as u8, w, hi);
            }
        }
        Ok(())
    }

    fn exec_div(&mut self, inst: &Instruction) -> CpuResult<()> {
        let w = inst.width;
        let src = self.rm_loc(inst)?;
        let divisor = self.read_loc(src, w)?;
        let (lo, hi) = match w {
            Width::Byte => {
                let ax = self.state.read_reg(gpr::EAX as u8, Width::Word);
                (ax & 0xff, ax >> 8)
            }
            _ => (
                self.state.read_reg(gpr::EAX as u8, w),
                self.state.read_reg(gpr::EDX as u8, w),
            ),
        };
        let result = if inst.op == Op::Div {
            alu::div(lo, hi, divisor, w)
        } else {
            alu::idiv(lo, hi, divisor, w)
        };
        let (quotient, remainder) = result.ok_or(Exception::DivideError)?;
        match w {
            Width::Byte => {
                self.state
                    .write_reg(gpr::EAX as u8, Width::Word, quotient | (remainder << 8));
            }
            _ => {
                self.state.write_reg(gpr::EAX as u8, w, quotient);
                self.state.write_reg(gpr::EDX as u8, w, remainder);
            }
        }
        Ok(())
    }

    fn shift_count(&self, inst: &Instruction, count: ShiftCount) -> u32 {
        match count {
            ShiftCount::One => 1,
            ShiftCount::Cl => self.state.gpr[gpr::ECX] & 0xff,
            ShiftCount::Imm => inst.imm,
        }
    }

    fn exec_bit_test(&mut self, inst: &Instruction, op: BitOp, src: BitSrc) -> CpuResult<()> {
        let w = inst.width;
        let bits = w.bits();
        let rm = self.rm_loc(inst)?;
        let raw = match src {
            BitSrc::Imm => inst.imm,
            BitSrc::Reg => self.state.read_reg(inst.reg, w),
        };
        // A register bit offset may reach outside a memory operand.
        let (loc, bit) = match (rm, src) {
            (Loc::Mem(seg, ea), BitSrc::Reg) => {
                let offset = w.sign_extend(raw) as i32;
                let unit = offset.div_euclid(bits as i32);
                let displacement = unit.wrapping_mul(w.bytes() as i32) as u32;
                let ea = ea.wrapping_add(displacement) & inst.address_size.mask();
                (Loc::Mem(seg, ea), offset.rem_euclid(bits as i32) as u32)
            }
            _ => (rm, raw % bits),
        };
        let v = if op == BitOp::Bt {
            self.read_loc(loc, w)?
        } else {
            self.read_loc_rmw(loc, w)?
        };
        let mask = 1u32 << bit;
        self.state.set_flag(FLAG_CF, v & mask != 0);
        let new = match op {
            BitOp::Bt => return Ok(()),
            BitOp::Bts => v | mask,
            BitOp::Btr => v & !mask,
            BitOp::Btc => v ^ mask,
        };
        self.write_loc(loc, w, new)
    }

    pub(crate) fn condition(&self, cond: Cond) -> bool {
        let f = |m| self.state.flag(m);
        match cond {
            Cond::O => f(FLAG_OF),
            Cond::No => !f(FLAG_OF),
            Cond::B => f(FLAG_CF),
            Cond::Ae => !f(FLAG_CF),
            Cond::E => f(FLAG_ZF),
            Cond::Ne => !f(FLAG_ZF),
            Cond::Be => f(FLAG_CF) || f(FLAG_ZF),
            Cond::A => !f(FLAG_CF) && !f(FLAG_ZF),
            Cond::S => f(FLAG_SF),
            Cond::Ns => !f(FLAG_SF),
            Cond::P => f(FLAG_PF),
            Cond::Np => !f(FLAG_PF),
            Cond::L => f(FLAG_SF) != f(FLAG_OF),
            Cond::Ge => f(FLAG_SF) == f(FLAG_OF),
            Cond::Le => f(FLAG_ZF) || f(FLAG_SF) != f(FLAG_OF),
            Cond::G => !f(FLAG_ZF) && f(FLAG_SF) == f(FLAG_OF),
        }
    }

    /// Offset of a memory operand within its segment.
    pub(crate) fn effective_address(&self, m: &MemOperand) -> u32 {
        let a = m.addr_size;
        let base = m.base.map_or(0, |r| self.state.read_reg(r, a));
        let index = m
            .index
            .map_or(0, |r| self.state.read_reg(r, a).wrapping_mul(u32::from(m.scale)));
        base.wrapping_add(index).wrapping_add(m.disp) & a.mask()
    }

    pub(crate) fn rm_loc(&self, inst: &Instruction) -> CpuResult<Loc> {
        match inst.rm {
            Some(RmOperand::Reg(r)) => Ok(Loc::Reg(r)),
            Some(RmOperand::Mem(m)) => Ok(Loc::Mem(m.seg, self.effective_address(&m))),
            None => Err(InternalError::OperandShape("r/m").into()),
        }
    }

    pub(crate) fn read_loc(&mut self, loc: Loc, width: Width) -> CpuResult<u32> {
        match loc {
            Loc::Reg(r) => Ok(self.state.read_reg(r, width)),
            Loc::Mem(seg, offset) => self.read_mem(seg, offset, width),
        }
    }

    pub(crate) fn read_loc_rmw(&mut self, loc: Loc, width: Width) -> CpuResult<u32> {
        match loc {
            Loc::Reg(r) => Ok(self.state.read_reg(r, width)),
            Loc::Mem(seg, offset) => self.read_mem_rmw(seg, offset, width),
        }
    }

    pub(crate) fn write_loc(&mut self, loc: Loc, width: Width, value: u32) -> CpuResult<()> {
        match loc {
            Loc::Reg(r) => {
                self.state.write_reg(r, width, value);
                Ok(())
            }
            Loc::Mem(seg, offset) => self.write_mem(seg, offset, width, value),
        }
    }
}

pub(crate) fn mem_operand(inst: &Instruction) -> CpuResult<MemOperand> {
    match inst.rm {
        Some(RmOperand::Mem(m)) => Ok(m),
        _ => Err(InternalError::OperandShape("memory").into()),
    }
}

fn segment_operand(inst: &Instruction) -> CpuResult<SegReg> {
    SegReg::from_index(inst.reg).ok_or_else(|| InternalError::OperandShape("segment register").into())
}
