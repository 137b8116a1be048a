//! Architectural register state.

use ember_x86::{SegReg, Width};

/// General-purpose register numbers, in ModRM encoding order.
pub mod gpr {
    pub const EAX: usize = 0;
    pub const ECX: usize = 1;
    pub const EDX: usize = 2;
    pub const EBX: usize = 3;
    pub const ESP: usize = 4;
    pub const EBP: usize = 5;
    pub const ESI: usize = 6;
    pub const EDI: usize = 7;
}

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL_MASK: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_ID: u32 = 1 << 21;

/// Status flags written by arithmetic instructions.
pub const FLAGS_STATUS: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;
/// Every EFLAGS bit this core implements.
pub const FLAGS_IMPLEMENTED: u32 = FLAGS_STATUS
    | FLAG_TF
    | FLAG_IF
    | FLAG_DF
    | FLAG_IOPL_MASK
    | FLAG_NT
    | FLAG_RF
    | FLAG_VM
    | FLAG_AC
    | FLAG_ID;

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = ember_mmu::CR0_WP;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = ember_mmu::CR0_PG;

pub const CR4_VME: u32 = 1 << 0;
pub const CR4_PVI: u32 = 1 << 1;
pub const CR4_TSD: u32 = 1 << 2;
pub const CR4_DE: u32 = 1 << 3;
pub const CR4_PSE: u32 = ember_mmu::CR4_PSE;
pub const CR4_PAE: u32 = ember_mmu::CR4_PAE;
pub const CR4_MCE: u32 = 1 << 6;
pub const CR4_PGE: u32 = ember_mmu::CR4_PGE;
pub const CR4_PCE: u32 = 1 << 8;

/// CR4 bits MOV CR4 accepts. VME and PVI are treated as reserved.
pub const CR4_SUPPORTED: u32 = CR4_TSD | CR4_DE | CR4_PSE | CR4_PAE | CR4_MCE | CR4_PGE | CR4_PCE;

pub const DR6_RESET: u32 = 0xffff_0ff0;
pub const DR6_BS: u32 = 1 << 14;
pub const DR7_RESET: u32 = 0x0000_0400;

// Descriptor access byte.
pub const ACCESS_ACCESSED: u8 = 1 << 0;
/// Writable (data) / readable (code).
pub const ACCESS_RW: u8 = 1 << 1;
/// Expand-down (data) / conforming (code).
pub const ACCESS_DC: u8 = 1 << 2;
pub const ACCESS_CODE: u8 = 1 << 3;
pub const ACCESS_S: u8 = 1 << 4;
pub const ACCESS_PRESENT: u8 = 1 << 7;

// Descriptor flags nibble (byte 6 bits 4..7).
pub const SEG_FLAG_AVL: u8 = 1 << 0;
/// Default operand size (code) / big stack and expand-down upper bound (data).
pub const SEG_FLAG_DB: u8 = 1 << 2;
pub const SEG_FLAG_G: u8 = 1 << 3;

/// Paging/protection mode derived from CR0 and EFLAGS.VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Protected,
    ProtectedPaged,
    Vm86,
}

impl CpuMode {
    pub fn is_protected(self) -> bool {
        matches!(self, CpuMode::Protected | CpuMode::ProtectedPaged)
    }
}

/// A segment register: visible selector plus the descriptor cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u32,
    /// Byte-granular limit (granularity already applied).
    pub limit: u32,
    /// Descriptor access byte (P, DPL, S, type).
    pub access: u8,
    /// Descriptor flags nibble (G, D/B, AVL).
    pub flags: u8,
    /// False after a null selector is loaded into a data segment register.
    pub valid: bool,
}

impl Segment {
    /// Real-mode data segment with the power-on cache.
    pub const fn real(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xffff,
            access: ACCESS_PRESENT | ACCESS_S | ACCESS_RW | ACCESS_ACCESSED,
            flags: 0,
            valid: true,
        }
    }

    /// A null (unusable) data segment.
    pub const fn null(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0,
            access: 0,
            flags: 0,
            valid: false,
        }
    }

    #[inline]
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.access & ACCESS_CODE != 0
    }

    #[inline]
    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & ACCESS_DC != 0
    }

    #[inline]
    pub fn is_expand_down(&self) -> bool {
        !self.is_code() && self.access & ACCESS_DC != 0
    }

    #[inline]
    pub fn readable(&self) -> bool {
        !self.is_code() || self.access & ACCESS_RW != 0
    }

    #[inline]
    pub fn writable(&self) -> bool {
        !self.is_code() && self.access & ACCESS_RW != 0
    }

    /// D/B bit: 32-bit default operand size for code, 32-bit stack pointer for SS.
    #[inline]
    pub fn is_big(&self) -> bool {
        self.flags & SEG_FLAG_DB != 0
    }

    /// Low 4 bits of the access byte, for system descriptors.
    #[inline]
    pub fn system_type(&self) -> u8 {
        self.access & 0xf
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableRegister {
    pub base: u32,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsrState {
    pub sysenter_cs: u32,
    pub sysenter_esp: u32,
    pub sysenter_eip: u32,
}

/// All architecturally visible state of one logical processor.
///
/// Control registers are mirrored into the [`ember_mmu::Mmu`] whenever they
/// are written; this struct is the source of truth for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub segments: [Segment; 6],
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub gdtr: TableRegister,
    pub idtr: TableRegister,
    pub ldtr: Segment,
    pub tr: Segment,
    /// Privilege level in protected mode. Real mode reports 0 and VM86
    /// reports 3 regardless of this field.
    pub cpl: u8,
    pub halted: bool,
    pub msr: MsrState,
}

pub type CpuContext = CpuState;

impl CpuState {
    /// Power-on/RESET state. `signature` is the processor signature left in EDX.
    pub fn reset(signature: u32) -> Self {
        let mut segments = [Segment::real(0); 6];
        segments[SegReg::Cs.index()] = Segment {
            selector: 0xf000,
            base: 0xffff_0000,
            limit: 0xffff,
            access: ACCESS_PRESENT | ACCESS_S | ACCESS_CODE | ACCESS_RW | ACCESS_ACCESSED,
            flags: 0,
            valid: true,
        };
        let mut regs = [0; 8];
        regs[gpr::EDX] = signature;
        let mut dr = [0; 8];
        dr[6] = DR6_RESET;
        dr[7] = DR7_RESET;
        Self {
            gpr: regs,
            eip: 0xfff0,
            eflags: FLAG_RESERVED1,
            segments,
            cr0: CR0_ET | CR0_NW | CR0_CD,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr,
            gdtr: TableRegister {
                base: 0,
                limit: 0xffff,
            },
            idtr: TableRegister {
                base: 0,
                limit: 0xffff,
            },
            ldtr: Segment {
                access: ACCESS_PRESENT | 0x2,
                ..Segment::real(0)
            },
            tr: Segment {
                access: ACCESS_PRESENT | 0xb,
                ..Segment::real(0)
            },
            cpl: 0,
            halted: false,
            msr: MsrState::default(),
        }
    }

    pub fn mode(&self) -> CpuMode {
        if self.cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if self.eflags & FLAG_VM != 0 {
            CpuMode::Vm86
        } else if self.cr0 & CR0_PG != 0 {
            CpuMode::ProtectedPaged
        } else {
            CpuMode::Protected
        }
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        match self.mode() {
            CpuMode::Real => 0,
            CpuMode::Vm86 => 3,
            CpuMode::Protected | CpuMode::ProtectedPaged => self.cpl,
        }
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.eflags & FLAG_IOPL_MASK) >> 12) as u8
    }

    #[inline]
    pub fn flag(&self, mask: u32) -> bool {
        self.eflags & mask != 0
    }

    #[inline]
    pub fn set_flag(&mut self, mask: u32, value: bool) {
        if value {
            self.eflags |= mask;
        } else {
            self.eflags &= !mask;
        }
    }

    /// Replace EFLAGS, keeping the always-one bit set and unimplemented bits clear.
    #[inline]
    pub fn set_eflags(&mut self, value: u32) {
        self.eflags = (value & FLAGS_IMPLEMENTED) | FLAG_RESERVED1;
    }

    #[inline]
    pub fn seg(&self, seg: SegReg) -> &Segment {
        &self.segments[seg.index()]
    }

    #[inline]
    pub fn seg_mut(&mut self, seg: SegReg) -> &mut Segment {
        &mut self.segments[seg.index()]
    }

    /// Default operand/address size of the code segment.
    pub fn code_is_32(&self) -> bool {
        match self.mode() {
            CpuMode::Real | CpuMode::Vm86 => false,
            CpuMode::Protected | CpuMode::ProtectedPaged => self.seg(SegReg::Cs).is_big(),
        }
    }

    /// Whether the stack uses ESP (true) or SP (false).
    pub fn stack_is_32(&self) -> bool {
        self.seg(SegReg::Ss).is_big()
    }

    pub fn read_reg(&self, reg: u8, width: Width) -> u32 {
        let reg = usize::from(reg & 7);
        match width {
            Width::Byte if reg < 4 => self.gpr[reg] & 0xff,
            Width::Byte => (self.gpr[reg - 4] >> 8) & 0xff,
            Width::Word => self.gpr[reg] & 0xffff,
            Width::Dword => self.gpr[reg],
        }
    }

    pub fn write_reg(&mut self, reg: u8, width: Width, value: u32) {
        let reg = usize::from(reg & 7);
        match width {
            Width::Byte if reg < 4 => {
                self.gpr[reg] = (self.gpr[reg] & !0xff) | (value & 0xff);
            }
            Width::Byte => {
                let r = reg - 4;
                self.gpr[r] = (self.gpr[r] & !0xff00) | ((value & 0xff) << 8);
            }
            Width::Word => self.gpr[reg] = (self.gpr[reg] & !0xffff) | (value & 0xffff),
            Width::Dword => self.gpr[reg] = value,
        }
    }

    /// Current stack pointer, honoring the SS size.
    #[inline]
    pub fn sp(&self) -> u32 {
        if self.stack_is_32() {
            self.gpr[gpr::ESP]
        } else {
            self.gpr[gpr::ESP] & 0xffff
        }
    }

    /// Write the stack pointer, preserving ESP[31:16] for 16-bit stacks.
    #[inline]
    pub fn set_sp(&mut self, value: u32) {
        if self.stack_is_32() {
            self.gpr[gpr::ESP] = value;
        } else {
            self.write_reg(gpr::ESP as u8, Width::Word, value);
        }
    }

    /// Load a segment register the real-mode way (base = selector << 4).
    ///
    /// Real mode keeps the cached limit and attributes; VM86 resets them to a
    /// 64 KiB ring-3 data segment.
    pub fn load_real_segment(&mut self, seg: SegReg, selector: u16) {
        let vm86 = self.mode() == CpuMode::Vm86;
        let cache = self.seg_mut(seg);
        cache.selector = selector;
        cache.base = u32::from(selector) << 4;
        cache.valid = true;
        if vm86 {
            cache.limit = 0xffff;
            cache.access = ACCESS_PRESENT | (3 << 5) | ACCESS_S | ACCESS_RW | ACCESS_ACCESSED;
            if seg == SegReg::Cs {
                cache.access |= ACCESS_CODE;
            }
            cache.flags = 0;
        }
    }
}
