//! IA-32 instruction decoding.
//!
//! The decoder pulls bytes one at a time through a [`ByteSource`], so an
//! instruction that straddles a page boundary only faults on the second page
//! if the decoder actually needs a byte from it. Decoded instructions are a
//! flat [`Instruction`] record whose [`Op`] names the operation and whose
//! operand fields are interpreted per-op by the executor.

#![forbid(unsafe_code)]

mod decoder;

pub use decoder::{decode, decode_bytes, ByteSource, DecodeError, Truncated};

use bitflags::bitflags;

/// Architectural upper bound on instruction length, prefixes included.
pub const MAX_INST_LEN: usize = 15;

/// Default operand/address size the decoder starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeMode {
    Bits16,
    Bits32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Word => 0xffff,
            Width::Dword => 0xffff_ffff,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extends the low `self.bits()` of `value` to 32 bits.
    #[inline]
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            Width::Byte => value as u8 as i8 as i32 as u32,
            Width::Word => value as u16 as i16 as i32 as u32,
            Width::Dword => value,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Prefixes: u8 {
        const LOCK = 1 << 0;
        /// F3. Mutually exclusive with `REPNE`; the last one seen wins.
        const REP = 1 << 1;
        /// F2.
        const REPNE = 1 << 2;
        const OPSIZE = 1 << 3;
        const ADDRSIZE = 1 << 4;
    }
}

/// Condition codes in their encoding order (the low nibble of Jcc/SETcc/CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub fn from_nibble(n: u8) -> Self {
        match n & 0xf {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xa => Cond::P,
            0xb => Cond::Np,
            0xc => Cond::L,
            0xd => Cond::Ge,
            0xe => Cond::Le,
            _ => Cond::G,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_index(n: u8) -> Self {
        match n & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftCount {
    One,
    Cl,
    /// Count is in `Instruction::imm`.
    Imm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitSrc {
    /// Bit offset in the `reg` field register; may address outside a memory operand.
    Reg,
    /// Bit offset in `imm`, taken modulo the operand width.
    Imm,
}

/// Operand direction for two-operand forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Form {
    /// Destination is r/m, source is the `reg` field.
    RmReg,
    /// Destination is the `reg` field, source is r/m.
    RegRm,
    /// Destination is r/m, source is `imm`.
    RmImm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSrc {
    Imm,
    Dx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Loop,
    Loope,
    Loopne,
}

/// Decoded operation. Operands live in the surrounding [`Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Alu(AluOp, Form),
    Test(Form),
    Inc,
    Dec,
    Not,
    Neg,
    Mul,
    Imul,
    /// `IMUL reg, r/m`
    ImulRegRm,
    /// `IMUL reg, r/m, imm`
    ImulImm,
    Div,
    Idiv,
    Shift(ShiftOp, ShiftCount),
    Shld(ShiftCount),
    Shrd(ShiftCount),

    Mov(Form),
    MovFromSeg,
    MovToSeg,
    MovFromCr,
    MovToCr,
    MovFromDr,
    MovToDr,
    /// Zero-extending move; the payload is the source width.
    Movzx(Width),
    Movsx(Width),
    Lea,
    Xchg,
    Xadd,
    Cmpxchg,
    Cmpxchg8b,
    Cmovcc(Cond),
    Setcc(Cond),
    Bswap,
    Cbw,
    Cwd,
    Lahf,
    Sahf,
    Xlat,
    LoadFarPtr(SegReg),
    Bound,

    Push,
    PushImm,
    PushSeg(SegReg),
    Pop,
    PopSeg(SegReg),
    Pusha,
    Popa,
    Pushf,
    Popf,
    Enter,
    Leave,

    JmpRel,
    JmpIndirect,
    /// `JMP ptr16:16/32`; offset in `imm`, selector in `imm2`.
    JmpFar,
    JmpFarIndirect,
    CallRel,
    CallIndirect,
    CallFar,
    CallFarIndirect,
    Jcc(Cond),
    Jcxz,
    Loop(LoopKind),
    Ret,
    RetFar,
    Int,
    Int3,
    Into,
    Iret,
    Hlt,

    Nop,
    Wait,
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,

    String(StringOp),
    In(PortSrc),
    Out(PortSrc),

    Lgdt,
    Lidt,
    Sgdt,
    Sidt,
    Lldt,
    Sldt,
    Ltr,
    Str,
    Lmsw,
    Smsw,
    Clts,
    Invlpg,
    Lar,
    Lsl,
    Verr,
    Verw,
    Arpl,
    Cpuid,
    Rdtsc,
    Rdmsr,
    Wrmsr,
    Wbinvd,

    Bt(BitOp, BitSrc),
    Bsf,
    Bsr,

    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,

    /// Any x87 escape (D8-DF). The ModRM operand is decoded for length only.
    Fpu,
}

impl Op {
    /// Whether a LOCK prefix is architecturally permitted on this operation
    /// (the destination must additionally be memory).
    pub fn lockable(self) -> bool {
        match self {
            Op::Alu(op, form) => op != AluOp::Cmp && form != Form::RegRm,
            Op::Bt(op, _) => op != BitOp::Bt,
            Op::Inc
            | Op::Dec
            | Op::Not
            | Op::Neg
            | Op::Xchg
            | Op::Xadd
            | Op::Cmpxchg
            | Op::Cmpxchg8b => true,
            _ => false,
        }
    }
}

/// A memory operand prior to segmentation: `seg:[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    /// Effective segment, with any override already applied.
    pub seg: SegReg,
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u32,
    /// `Word` for 16-bit addressing (result wraps at 64 KiB), `Dword` otherwise.
    pub addr_size: Width,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmOperand {
    /// Register number; for byte operands 4..=7 name AH/CH/DH/BH.
    Reg(u8),
    Mem(MemOperand),
}

impl RmOperand {
    pub fn is_mem(&self) -> bool {
        matches!(self, RmOperand::Mem(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub op: Op,
    pub prefixes: Prefixes,
    pub segment_override: Option<SegReg>,
    pub operand_size: Width,
    pub address_size: Width,
    /// Width of the primary operand; `Byte` for the 8-bit opcode forms.
    pub width: Width,
    pub rm: Option<RmOperand>,
    /// ModRM `reg` field (register, segment, control or debug register number).
    pub reg: u8,
    /// Immediate, relative displacement or far offset; sign-extended where the
    /// encoding sign-extends.
    pub imm: u32,
    /// Second immediate: far selector or `ENTER` nesting level.
    pub imm2: u32,
    pub len: u8,
}

impl Instruction {
    /// Segment for string-source and `XLAT` accesses (DS unless overridden).
    pub fn data_segment(&self) -> SegReg {
        self.segment_override.unwrap_or(SegReg::Ds)
    }

    pub fn has_rep(&self) -> bool {
        self.prefixes.intersects(Prefixes::REP | Prefixes::REPNE)
    }
}
