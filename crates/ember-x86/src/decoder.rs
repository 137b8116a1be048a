use thiserror::Error;

use crate::{
    AluOp, BitOp, BitSrc, Cond, DecodeMode, Form, Instruction, LoopKind, MemOperand, Op, PortSrc,
    Prefixes, RmOperand, SegReg, ShiftCount, ShiftOp, StringOp, Width, MAX_INST_LEN,
};

/// Supplies instruction bytes by offset from the start of the instruction.
///
/// The decoder requests offsets in strictly increasing order and never asks
/// for a byte it does not need, so a source backed by paged memory only
/// faults on pages the instruction really occupies.
pub trait ByteSource {
    type Error;

    fn fetch(&mut self, offset: usize) -> Result<u8, Self::Error>;
}

/// The byte slice ended before the instruction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("byte stream ended mid-instruction")]
pub struct Truncated;

impl ByteSource for &[u8] {
    type Error = Truncated;

    fn fetch(&mut self, offset: usize) -> Result<u8, Truncated> {
        self.get(offset).copied().ok_or(Truncated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError<E> {
    /// Undefined or unsupported encoding; raises #UD.
    #[error("invalid instruction")]
    Invalid,
    /// More than 15 bytes were consumed; raises #GP(0).
    #[error("instruction exceeds 15-byte length limit")]
    TooLong,
    /// The byte source failed (e.g. a page fault on fetch).
    #[error("instruction fetch failed")]
    Fetch(E),
}

/// Decode a single instruction from the start of `bytes`.
pub fn decode_bytes(bytes: &[u8], mode: DecodeMode) -> Result<Instruction, DecodeError<Truncated>> {
    let mut src = bytes;
    decode(&mut src, mode)
}

/// Decode a single instruction, pulling bytes from `src` on demand.
pub fn decode<S: ByteSource>(
    src: &mut S,
    mode: DecodeMode,
) -> Result<Instruction, DecodeError<S::Error>> {
    let mut d = Decoder {
        src,
        pos: 0,
        prefixes: Prefixes::empty(),
        segment_override: None,
        operand_size: Width::Dword,
        address_size: Width::Dword,
        rm: None,
        reg: 0,
        imm: 0,
        imm2: 0,
    };

    let opcode = d.scan_prefixes()?;
    let opsize_flip = d.prefixes.contains(Prefixes::OPSIZE);
    let addrsize_flip = d.prefixes.contains(Prefixes::ADDRSIZE);
    d.operand_size = match (mode, opsize_flip) {
        (DecodeMode::Bits16, false) | (DecodeMode::Bits32, true) => Width::Word,
        _ => Width::Dword,
    };
    d.address_size = match (mode, addrsize_flip) {
        (DecodeMode::Bits16, false) | (DecodeMode::Bits32, true) => Width::Word,
        _ => Width::Dword,
    };

    let (op, width) = if opcode == 0x0f {
        let opcode = d.next_u8()?;
        d.two_byte(opcode)?
    } else {
        d.one_byte(opcode)?
    };

    if d.prefixes.contains(Prefixes::LOCK) {
        let mem_dest = d.rm.map_or(false, |rm| rm.is_mem());
        if !op.lockable() || !mem_dest {
            return Err(DecodeError::Invalid);
        }
    }

    Ok(Instruction {
        op,
        prefixes: d.prefixes,
        segment_override: d.segment_override,
        operand_size: d.operand_size,
        address_size: d.address_size,
        width,
        rm: d.rm,
        reg: d.reg,
        imm: d.imm,
        imm2: d.imm2,
        // Bounded by MAX_INST_LEN.
        len: d.pos as u8,
    })
}

struct Decoder<'a, S: ByteSource> {
    src: &'a mut S,
    pos: usize,
    prefixes: Prefixes,
    segment_override: Option<SegReg>,
    operand_size: Width,
    address_size: Width,
    rm: Option<RmOperand>,
    reg: u8,
    imm: u32,
    imm2: u32,
}

type DResult<T, S> = Result<T, DecodeError<<S as ByteSource>::Error>>;

impl<S: ByteSource> Decoder<'_, S> {
    fn next_u8(&mut self) -> DResult<u8, S> {
        if self.pos >= MAX_INST_LEN {
            return Err(DecodeError::TooLong);
        }
        let b = self.src.fetch(self.pos).map_err(DecodeError::Fetch)?;
        self.pos += 1;
        Ok(b)
    }

    fn next_u16(&mut self) -> DResult<u16, S> {
        let lo = self.next_u8()?;
        let hi = self.next_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn next_u32(&mut self) -> DResult<u32, S> {
        let lo = self.next_u16()?;
        let hi = self.next_u16()?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    /// Reads an immediate of `width`, zero-extended.
    fn next_imm(&mut self, width: Width) -> DResult<u32, S> {
        Ok(match width {
            Width::Byte => u32::from(self.next_u8()?),
            Width::Word => u32::from(self.next_u16()?),
            Width::Dword => self.next_u32()?,
        })
    }

    /// Reads an immediate of `width`, sign-extended to 32 bits.
    fn next_simm(&mut self, width: Width) -> DResult<u32, S> {
        let raw = self.next_imm(width)?;
        Ok(width.sign_extend(raw))
    }

    fn scan_prefixes(&mut self) -> DResult<u8, S> {
        loop {
            let b = self.next_u8()?;
            match b {
                0xf0 => self.prefixes.insert(Prefixes::LOCK),
                0xf2 => {
                    self.prefixes.remove(Prefixes::REP);
                    self.prefixes.insert(Prefixes::REPNE);
                }
                0xf3 => {
                    self.prefixes.remove(Prefixes::REPNE);
                    self.prefixes.insert(Prefixes::REP);
                }
                0x26 => self.segment_override = Some(SegReg::Es),
                0x2e => self.segment_override = Some(SegReg::Cs),
                0x36 => self.segment_override = Some(SegReg::Ss),
                0x3e => self.segment_override = Some(SegReg::Ds),
                0x64 => self.segment_override = Some(SegReg::Fs),
                0x65 => self.segment_override = Some(SegReg::Gs),
                0x66 => self.prefixes.insert(Prefixes::OPSIZE),
                0x67 => self.prefixes.insert(Prefixes::ADDRSIZE),
                _ => return Ok(b),
            }
        }
    }

    /// Reads a ModRM byte (and any SIB/displacement), filling `reg` and `rm`.
    /// Returns the raw `mod` field.
    fn modrm(&mut self) -> DResult<u8, S> {
        let modrm = self.next_u8()?;
        let md = modrm >> 6;
        let rm = modrm & 7;
        self.reg = (modrm >> 3) & 7;
        self.rm = Some(if md == 3 {
            RmOperand::Reg(rm)
        } else if self.address_size == Width::Word {
            RmOperand::Mem(self.mem16(md, rm)?)
        } else {
            RmOperand::Mem(self.mem32(md, rm)?)
        });
        Ok(md)
    }

    fn modrm_mem_only(&mut self) -> DResult<(), S> {
        if self.modrm()? == 3 {
            return Err(DecodeError::Invalid);
        }
        Ok(())
    }

    fn disp(&mut self, md: u8) -> DResult<u32, S> {
        match md {
            0 => Ok(0),
            1 => self.next_simm(Width::Byte),
            _ => self.next_simm(self.address_size),
        }
    }

    fn mem16(&mut self, md: u8, rm: u8) -> DResult<MemOperand, S> {
        const BX: u8 = 3;
        const BP: u8 = 5;
        const SI: u8 = 6;
        const DI: u8 = 7;
        let (base, index) = match rm {
            0 => (Some(BX), Some(SI)),
            1 => (Some(BX), Some(DI)),
            2 => (Some(BP), Some(SI)),
            3 => (Some(BP), Some(DI)),
            4 => (Some(SI), None),
            5 => (Some(DI), None),
            6 if md == 0 => (None, None),
            6 => (Some(BP), None),
            _ => (Some(BX), None),
        };
        let disp = if md == 0 && rm == 6 {
            u32::from(self.next_u16()?)
        } else {
            self.disp(md)?
        };
        let default = if base == Some(BP) { SegReg::Ss } else { SegReg::Ds };
        Ok(MemOperand {
            seg: self.segment_override.unwrap_or(default),
            base,
            index,
            scale: 1,
            disp,
            addr_size: Width::Word,
        })
    }

    fn mem32(&mut self, md: u8, rm: u8) -> DResult<MemOperand, S> {
        const ESP: u8 = 4;
        const EBP: u8 = 5;
        let (base, index, scale, disp) = if rm == ESP {
            let sib = self.next_u8()?;
            let scale = 1u8 << (sib >> 6);
            let index = (sib >> 3) & 7;
            let index = (index != ESP).then_some(index);
            let sib_base = sib & 7;
            if sib_base == EBP && md == 0 {
                (None, index, scale, self.next_u32()?)
            } else {
                (Some(sib_base), index, scale, self.disp(md)?)
            }
        } else if rm == EBP && md == 0 {
            (None, None, 1, self.next_u32()?)
        } else {
            (Some(rm), None, 1, self.disp(md)?)
        };
        let default = match base {
            Some(ESP) | Some(EBP) => SegReg::Ss,
            _ => SegReg::Ds,
        };
        Ok(MemOperand {
            seg: self.segment_override.unwrap_or(default),
            base,
            index,
            scale,
            disp,
            addr_size: Width::Dword,
        })
    }

    /// `moffs` operand of the A0-A3 MOV forms.
    fn moffs(&mut self) -> DResult<(), S> {
        let disp = self.next_imm(self.address_size)?;
        self.rm = Some(RmOperand::Mem(MemOperand {
            seg: self.segment_override.unwrap_or(SegReg::Ds),
            base: None,
            index: None,
            scale: 1,
            disp,
            addr_size: self.address_size,
        }));
        Ok(())
    }

    fn reg_in_opcode(&mut self, opcode: u8) {
        self.rm = Some(RmOperand::Reg(opcode & 7));
    }

    /// Width selected by bit 0 of the opcode (byte form vs operand-size form).
    fn w_bit(&self, opcode: u8) -> Width {
        if opcode & 1 == 0 {
            Width::Byte
        } else {
            self.operand_size
        }
    }

    /// Immediate for a full-size operand (`Iz`): 16 or 32 bits, never 64.
    fn imm_z(&mut self, width: Width) -> DResult<u32, S> {
        self.next_imm(width)
    }

    fn one_byte(&mut self, opcode: u8) -> DResult<(Op, Width), S> {
        let opsize = self.operand_size;
        let op = match opcode {
            0x00..=0x3f if opcode & 7 < 6 => {
                let alu = AluOp::from_index(opcode >> 3);
                let width = self.w_bit(opcode);
                let form = match opcode & 7 {
                    0 | 1 => {
                        self.modrm()?;
                        Form::RmReg
                    }
                    2 | 3 => {
                        self.modrm()?;
                        Form::RegRm
                    }
                    _ => {
                        self.rm = Some(RmOperand::Reg(0));
                        self.imm = self.imm_z(width)?;
                        Form::RmImm
                    }
                };
                return Ok((Op::Alu(alu, form), width));
            }
            0x06 => Op::PushSeg(SegReg::Es),
            0x07 => Op::PopSeg(SegReg::Es),
            0x0e => Op::PushSeg(SegReg::Cs),
            0x16 => Op::PushSeg(SegReg::Ss),
            0x17 => Op::PopSeg(SegReg::Ss),
            0x1e => Op::PushSeg(SegReg::Ds),
            0x1f => Op::PopSeg(SegReg::Ds),
            0x27 => Op::Daa,
            0x2f => Op::Das,
            0x37 => Op::Aaa,
            0x3f => Op::Aas,
            // Prefix bytes are consumed by scan_prefixes.
            0x26 | 0x2e | 0x36 | 0x3e => return Err(DecodeError::Invalid),
            0x40..=0x47 => {
                self.reg_in_opcode(opcode);
                Op::Inc
            }
            0x48..=0x4f => {
                self.reg_in_opcode(opcode);
                Op::Dec
            }
            0x50..=0x57 => {
                self.reg_in_opcode(opcode);
                Op::Push
            }
            0x58..=0x5f => {
                self.reg_in_opcode(opcode);
                Op::Pop
            }
            0x60 => Op::Pusha,
            0x61 => Op::Popa,
            0x62 => {
                self.modrm_mem_only()?;
                Op::Bound
            }
            0x63 => {
                self.modrm()?;
                return Ok((Op::Arpl, Width::Word));
            }
            0x68 => {
                self.imm = self.next_simm(opsize)?;
                Op::PushImm
            }
            0x69 => {
                self.modrm()?;
                self.imm = self.next_simm(opsize)?;
                Op::ImulImm
            }
            0x6a => {
                self.imm = self.next_simm(Width::Byte)?;
                Op::PushImm
            }
            0x6b => {
                self.modrm()?;
                self.imm = self.next_simm(Width::Byte)?;
                Op::ImulImm
            }
            0x6c | 0x6d => return Ok((Op::String(StringOp::Ins), self.w_bit(opcode))),
            0x6e | 0x6f => return Ok((Op::String(StringOp::Outs), self.w_bit(opcode))),
            0x70..=0x7f => {
                self.imm = self.next_simm(Width::Byte)?;
                Op::Jcc(Cond::from_nibble(opcode))
            }
            0x80..=0x83 => {
                self.modrm()?;
                let width = self.w_bit(opcode);
                self.imm = match opcode {
                    0x81 => self.imm_z(width)?,
                    0x83 => self.next_simm(Width::Byte)? & width.mask(),
                    _ => self.next_imm(Width::Byte)?,
                };
                return Ok((Op::Alu(AluOp::from_index(self.reg), Form::RmImm), width));
            }
            0x84 | 0x85 => {
                self.modrm()?;
                return Ok((Op::Test(Form::RmReg), self.w_bit(opcode)));
            }
            0x86 | 0x87 => {
                self.modrm()?;
                return Ok((Op::Xchg, self.w_bit(opcode)));
            }
            0x88 | 0x89 => {
                self.modrm()?;
                return Ok((Op::Mov(Form::RmReg), self.w_bit(opcode)));
            }
            0x8a | 0x8b => {
                self.modrm()?;
                return Ok((Op::Mov(Form::RegRm), self.w_bit(opcode)));
            }
            0x8c => {
                let md = self.modrm()?;
                if self.reg > 5 {
                    return Err(DecodeError::Invalid);
                }
                // Register destinations take the operand size; memory is always 16 bits.
                let width = if md == 3 { opsize } else { Width::Word };
                return Ok((Op::MovFromSeg, width));
            }
            0x8d => {
                self.modrm_mem_only()?;
                Op::Lea
            }
            0x8e => {
                self.modrm()?;
                if self.reg > 5 || self.reg == SegReg::Cs as u8 {
                    return Err(DecodeError::Invalid);
                }
                return Ok((Op::MovToSeg, Width::Word));
            }
            0x8f => {
                self.modrm()?;
                if self.reg != 0 {
                    return Err(DecodeError::Invalid);
                }
                Op::Pop
            }
            0x90 => Op::Nop,
            0x91..=0x97 => {
                self.reg_in_opcode(opcode);
                self.reg = 0;
                Op::Xchg
            }
            0x98 => Op::Cbw,
            0x99 => Op::Cwd,
            0x9a => {
                self.imm = self.imm_z(opsize)?;
                self.imm2 = u32::from(self.next_u16()?);
                Op::CallFar
            }
            0x9b => Op::Wait,
            0x9c => Op::Pushf,
            0x9d => Op::Popf,
            0x9e => Op::Sahf,
            0x9f => Op::Lahf,
            0xa0..=0xa3 => {
                self.moffs()?;
                self.reg = 0;
                let form = if opcode < 0xa2 { Form::RegRm } else { Form::RmReg };
                return Ok((Op::Mov(form), self.w_bit(opcode)));
            }
            0xa4 | 0xa5 => return Ok((Op::String(StringOp::Movs), self.w_bit(opcode))),
            0xa6 | 0xa7 => return Ok((Op::String(StringOp::Cmps), self.w_bit(opcode))),
            0xa8 | 0xa9 => {
                let width = self.w_bit(opcode);
                self.rm = Some(RmOperand::Reg(0));
                self.imm = self.imm_z(width)?;
                return Ok((Op::Test(Form::RmImm), width));
            }
            0xaa | 0xab => return Ok((Op::String(StringOp::Stos), self.w_bit(opcode))),
            0xac | 0xad => return Ok((Op::String(StringOp::Lods), self.w_bit(opcode))),
            0xae | 0xaf => return Ok((Op::String(StringOp::Scas), self.w_bit(opcode))),
            0xb0..=0xb7 => {
                self.reg_in_opcode(opcode);
                self.imm = self.next_imm(Width::Byte)?;
                return Ok((Op::Mov(Form::RmImm), Width::Byte));
            }
            0xb8..=0xbf => {
                self.reg_in_opcode(opcode);
                self.imm = self.imm_z(opsize)?;
                Op::Mov(Form::RmImm)
            }
            0xc0 | 0xc1 | 0xd0..=0xd3 => {
                self.modrm()?;
                let shift = match self.reg {
                    0 => ShiftOp::Rol,
                    1 => ShiftOp::Ror,
                    2 => ShiftOp::Rcl,
                    3 => ShiftOp::Rcr,
                    4 | 6 => ShiftOp::Shl,
                    5 => ShiftOp::Shr,
                    _ => ShiftOp::Sar,
                };
                let count = match opcode {
                    0xc0 | 0xc1 => {
                        self.imm = self.next_imm(Width::Byte)?;
                        ShiftCount::Imm
                    }
                    0xd0 | 0xd1 => ShiftCount::One,
                    _ => ShiftCount::Cl,
                };
                return Ok((Op::Shift(shift, count), self.w_bit(opcode)));
            }
            0xc2 => {
                self.imm = u32::from(self.next_u16()?);
                Op::Ret
            }
            0xc3 => Op::Ret,
            0xc4 => {
                self.modrm_mem_only()?;
                Op::LoadFarPtr(SegReg::Es)
            }
            0xc5 => {
                self.modrm_mem_only()?;
                Op::LoadFarPtr(SegReg::Ds)
            }
            0xc6 | 0xc7 => {
                self.modrm()?;
                if self.reg != 0 {
                    return Err(DecodeError::Invalid);
                }
                let width = self.w_bit(opcode);
                self.imm = self.imm_z(width)?;
                return Ok((Op::Mov(Form::RmImm), width));
            }
            0xc8 => {
                self.imm = u32::from(self.next_u16()?);
                self.imm2 = u32::from(self.next_u8()?);
                Op::Enter
            }
            0xc9 => Op::Leave,
            0xca => {
                self.imm = u32::from(self.next_u16()?);
                Op::RetFar
            }
            0xcb => Op::RetFar,
            0xcc => Op::Int3,
            0xcd => {
                self.imm = self.next_imm(Width::Byte)?;
                Op::Int
            }
            0xce => Op::Into,
            0xcf => Op::Iret,
            0xd4 => {
                self.imm = self.next_imm(Width::Byte)?;
                Op::Aam
            }
            0xd5 => {
                self.imm = self.next_imm(Width::Byte)?;
                Op::Aad
            }
            0xd7 => return Ok((Op::Xlat, Width::Byte)),
            0xd8..=0xdf => {
                self.modrm()?;
                Op::Fpu
            }
            0xe0..=0xe3 => {
                self.imm = self.next_simm(Width::Byte)?;
                match opcode {
                    0xe0 => Op::Loop(LoopKind::Loopne),
                    0xe1 => Op::Loop(LoopKind::Loope),
                    0xe2 => Op::Loop(LoopKind::Loop),
                    _ => Op::Jcxz,
                }
            }
            0xe4..=0xe7 => {
                self.imm = self.next_imm(Width::Byte)?;
                let op = if opcode < 0xe6 {
                    Op::In(PortSrc::Imm)
                } else {
                    Op::Out(PortSrc::Imm)
                };
                return Ok((op, self.w_bit(opcode)));
            }
            0xe8 => {
                self.imm = self.next_simm(opsize)?;
                Op::CallRel
            }
            0xe9 => {
                self.imm = self.next_simm(opsize)?;
                Op::JmpRel
            }
            0xea => {
                self.imm = self.imm_z(opsize)?;
                self.imm2 = u32::from(self.next_u16()?);
                Op::JmpFar
            }
            0xeb => {
                self.imm = self.next_simm(Width::Byte)?;
                Op::JmpRel
            }
            0xec..=0xef => {
                let op = if opcode < 0xee {
                    Op::In(PortSrc::Dx)
                } else {
                    Op::Out(PortSrc::Dx)
                };
                return Ok((op, self.w_bit(opcode)));
            }
            0xf4 => Op::Hlt,
            0xf5 => Op::Cmc,
            0xf6 | 0xf7 => {
                self.modrm()?;
                let width = self.w_bit(opcode);
                let op = match self.reg {
                    0 | 1 => {
                        self.imm = self.imm_z(width)?;
                        Op::Test(Form::RmImm)
                    }
                    2 => Op::Not,
                    3 => Op::Neg,
                    4 => Op::Mul,
                    5 => Op::Imul,
                    6 => Op::Div,
                    _ => Op::Idiv,
                };
                return Ok((op, width));
            }
            0xf8 => Op::Clc,
            0xf9 => Op::Stc,
            0xfa => Op::Cli,
            0xfb => Op::Sti,
            0xfc => Op::Cld,
            0xfd => Op::Std,
            0xfe => {
                self.modrm()?;
                let op = match self.reg {
                    0 => Op::Inc,
                    1 => Op::Dec,
                    _ => return Err(DecodeError::Invalid),
                };
                return Ok((op, Width::Byte));
            }
            0xff => {
                let md = self.modrm()?;
                match self.reg {
                    0 => Op::Inc,
                    1 => Op::Dec,
                    2 => Op::CallIndirect,
                    3 if md != 3 => Op::CallFarIndirect,
                    4 => Op::JmpIndirect,
                    5 if md != 3 => Op::JmpFarIndirect,
                    6 => Op::Push,
                    _ => return Err(DecodeError::Invalid),
                }
            }
            // D6 (SALC), F1 (ICEBP) and anything left over.
            _ => return Err(DecodeError::Invalid),
        };
        Ok((op, opsize))
    }

    fn two_byte(&mut self, opcode: u8) -> DResult<(Op, Width), S> {
        let opsize = self.operand_size;
        let op = match opcode {
            0x00 => {
                let md = self.modrm()?;
                let op = match self.reg {
                    0 => Op::Sldt,
                    1 => Op::Str,
                    2 => Op::Lldt,
                    3 => Op::Ltr,
                    4 => Op::Verr,
                    5 => Op::Verw,
                    _ => return Err(DecodeError::Invalid),
                };
                // SLDT/STR to a register store the full operand size.
                let width = if md == 3 && matches!(op, Op::Sldt | Op::Str) {
                    opsize
                } else {
                    Width::Word
                };
                return Ok((op, width));
            }
            0x01 => {
                let md = self.modrm()?;
                let op = match (self.reg, md) {
                    (0, 0..=2) => Op::Sgdt,
                    (1, 0..=2) => Op::Sidt,
                    (2, 0..=2) => Op::Lgdt,
                    (3, 0..=2) => Op::Lidt,
                    (4, _) => Op::Smsw,
                    (6, _) => Op::Lmsw,
                    (7, 0..=2) => Op::Invlpg,
                    _ => return Err(DecodeError::Invalid),
                };
                let width = match op {
                    Op::Smsw if md == 3 => opsize,
                    Op::Smsw | Op::Lmsw => Width::Word,
                    _ => opsize,
                };
                return Ok((op, width));
            }
            0x02 => {
                self.modrm()?;
                Op::Lar
            }
            0x03 => {
                self.modrm()?;
                Op::Lsl
            }
            0x06 => Op::Clts,
            0x08 | 0x09 => Op::Wbinvd,
            0x18..=0x1f => {
                self.modrm()?;
                Op::Nop
            }
            0x20..=0x23 => {
                // The mod field is ignored; the r/m operand is always a register.
                let modrm = self.next_u8()?;
                self.reg = (modrm >> 3) & 7;
                self.rm = Some(RmOperand::Reg(modrm & 7));
                let op = match opcode {
                    0x20 => Op::MovFromCr,
                    0x21 => Op::MovFromDr,
                    0x22 => Op::MovToCr,
                    _ => Op::MovToDr,
                };
                return Ok((op, Width::Dword));
            }
            0x30 => Op::Wrmsr,
            0x31 => Op::Rdtsc,
            0x32 => Op::Rdmsr,
            0x40..=0x4f => {
                self.modrm()?;
                Op::Cmovcc(Cond::from_nibble(opcode))
            }
            0x80..=0x8f => {
                self.imm = self.next_simm(opsize)?;
                Op::Jcc(Cond::from_nibble(opcode))
            }
            0x90..=0x9f => {
                self.modrm()?;
                return Ok((Op::Setcc(Cond::from_nibble(opcode)), Width::Byte));
            }
            0xa0 => Op::PushSeg(SegReg::Fs),
            0xa1 => Op::PopSeg(SegReg::Fs),
            0xa2 => Op::Cpuid,
            0xa3 => {
                self.modrm()?;
                Op::Bt(BitOp::Bt, BitSrc::Reg)
            }
            0xa4 | 0xac => {
                self.modrm()?;
                self.imm = self.next_imm(Width::Byte)?;
                if opcode == 0xa4 {
                    Op::Shld(ShiftCount::Imm)
                } else {
                    Op::Shrd(ShiftCount::Imm)
                }
            }
            0xa5 => {
                self.modrm()?;
                Op::Shld(ShiftCount::Cl)
            }
            0xad => {
                self.modrm()?;
                Op::Shrd(ShiftCount::Cl)
            }
            0xa8 => Op::PushSeg(SegReg::Gs),
            0xa9 => Op::PopSeg(SegReg::Gs),
            0xab => {
                self.modrm()?;
                Op::Bt(BitOp::Bts, BitSrc::Reg)
            }
            0xaf => {
                self.modrm()?;
                Op::ImulRegRm
            }
            0xb0 | 0xb1 => {
                self.modrm()?;
                return Ok((Op::Cmpxchg, self.w_bit(opcode)));
            }
            0xb2 => {
                self.modrm_mem_only()?;
                Op::LoadFarPtr(SegReg::Ss)
            }
            0xb3 => {
                self.modrm()?;
                Op::Bt(BitOp::Btr, BitSrc::Reg)
            }
            0xb4 => {
                self.modrm_mem_only()?;
                Op::LoadFarPtr(SegReg::Fs)
            }
            0xb5 => {
                self.modrm_mem_only()?;
                Op::LoadFarPtr(SegReg::Gs)
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                self.modrm()?;
                let src = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
                if opcode < 0xb8 {
                    Op::Movzx(src)
                } else {
                    Op::Movsx(src)
                }
            }
            0xba => {
                self.modrm()?;
                let bit = match self.reg {
                    4 => BitOp::Bt,
                    5 => BitOp::Bts,
                    6 => BitOp::Btr,
                    7 => BitOp::Btc,
                    _ => return Err(DecodeError::Invalid),
                };
                self.imm = self.next_imm(Width::Byte)?;
                Op::Bt(bit, BitSrc::Imm)
            }
            0xbb => {
                self.modrm()?;
                Op::Bt(BitOp::Btc, BitSrc::Reg)
            }
            0xbc => {
                self.modrm()?;
                Op::Bsf
            }
            0xbd => {
                self.modrm()?;
                Op::Bsr
            }
            0xc0 | 0xc1 => {
                self.modrm()?;
                return Ok((Op::Xadd, self.w_bit(opcode)));
            }
            0xc7 => {
                self.modrm_mem_only()?;
                if self.reg != 1 {
                    return Err(DecodeError::Invalid);
                }
                Op::Cmpxchg8b
            }
            0xc8..=0xcf => {
                self.reg_in_opcode(opcode);
                Op::Bswap
            }
            _ => return Err(DecodeError::Invalid),
        };
        Ok((op, opsize))
    }
}
