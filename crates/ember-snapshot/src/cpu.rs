//! Encoders for the processor-side sections.

use std::collections::VecDeque;
use std::io::{Read, Write};

use ember_cpu_core::{CpuState, Deadline, MsrState, PendingEventState, Segment, TableRegister, TimeSource};
use ember_mmu::{TlbImage, TlbSlot};

use crate::error::{Result, SnapshotError};
use crate::io::SnapshotField;

const MAX_PENDING_VECTORS: u32 = 64 * 1024;
const MAX_DEADLINES: u32 = 64 * 1024;
const MAX_TLB_SLOTS: u32 = 1 << 20;

fn encode_segment<W: Write>(w: &mut W, seg: &Segment) -> Result<()> {
    w.write_u16_le(seg.selector)?;
    w.write_u32_le(seg.base)?;
    w.write_u32_le(seg.limit)?;
    w.write_u8(seg.access)?;
    w.write_u8(seg.flags)?;
    w.write_bool(seg.valid)
}

fn decode_segment<R: Read>(r: &mut R) -> Result<Segment> {
    Ok(Segment {
        selector: r.read_u16_le()?,
        base: r.read_u32_le()?,
        limit: r.read_u32_le()?,
        access: r.read_u8()?,
        flags: r.read_u8()?,
        valid: r.read_bool("segment valid bit")?,
    })
}

fn encode_table<W: Write>(w: &mut W, table: &TableRegister) -> Result<()> {
    w.write_u32_le(table.base)?;
    w.write_u16_le(table.limit)
}

fn decode_table<R: Read>(r: &mut R) -> Result<TableRegister> {
    Ok(TableRegister {
        base: r.read_u32_le()?,
        limit: r.read_u16_le()?,
    })
}

pub fn encode_cpu_state<W: Write>(w: &mut W, s: &CpuState) -> Result<()> {
    for reg in s.gpr {
        w.write_u32_le(reg)?;
    }
    w.write_u32_le(s.eip)?;
    w.write_u32_le(s.eflags)?;
    for seg in &s.segments {
        encode_segment(w, seg)?;
    }
    for cr in [s.cr0, s.cr2, s.cr3, s.cr4] {
        w.write_u32_le(cr)?;
    }
    for dr in s.dr {
        w.write_u32_le(dr)?;
    }
    encode_table(w, &s.gdtr)?;
    encode_table(w, &s.idtr)?;
    encode_segment(w, &s.ldtr)?;
    encode_segment(w, &s.tr)?;
    w.write_u8(s.cpl)?;
    w.write_bool(s.halted)?;
    w.write_u32_le(s.msr.sysenter_cs)?;
    w.write_u32_le(s.msr.sysenter_esp)?;
    w.write_u32_le(s.msr.sysenter_eip)
}

pub fn decode_cpu_state<R: Read>(r: &mut R) -> Result<CpuState> {
    let mut gpr = [0u32; 8];
    for reg in &mut gpr {
        *reg = r.read_u32_le()?;
    }
    let eip = r.read_u32_le()?;
    let eflags = r.read_u32_le()?;
    let mut segments = [Segment::null(0); 6];
    for seg in &mut segments {
        *seg = decode_segment(r)?;
    }
    let cr0 = r.read_u32_le()?;
    let cr2 = r.read_u32_le()?;
    let cr3 = r.read_u32_le()?;
    let cr4 = r.read_u32_le()?;
    let mut dr = [0u32; 8];
    for reg in &mut dr {
        *reg = r.read_u32_le()?;
    }
    let gdtr = decode_table(r)?;
    let idtr = decode_table(r)?;
    let ldtr = decode_segment(r)?;
    let tr = decode_segment(r)?;
    let cpl = r.read_u8()?;
    if cpl > 3 {
        return Err(SnapshotError::InvalidField("CPL"));
    }
    let halted = r.read_bool("halted")?;
    let msr = MsrState {
        sysenter_cs: r.read_u32_le()?,
        sysenter_esp: r.read_u32_le()?,
        sysenter_eip: r.read_u32_le()?,
    };
    Ok(CpuState {
        gpr,
        eip,
        eflags,
        segments,
        cr0,
        cr2,
        cr3,
        cr4,
        dr,
        gdtr,
        idtr,
        ldtr,
        tr,
        cpl,
        halted,
        msr,
    })
}

pub fn encode_pending<W: Write>(w: &mut W, p: &PendingEventState) -> Result<()> {
    w.write_u8(p.interrupt_inhibit())?;
    w.write_bool(p.nmi_pending())?;
    w.write_bool(p.nmi_blocked())?;
    w.write_count(p.external_interrupts.len(), "pending interrupt queue")?;
    for &vector in &p.external_interrupts {
        w.write_u8(vector)?;
    }
    Ok(())
}

pub fn decode_pending<R: Read>(r: &mut R) -> Result<PendingEventState> {
    let inhibit = r.read_u8()?;
    let nmi_pending = r.read_bool("NMI pending")?;
    let nmi_blocked = r.read_bool("NMI blocked")?;
    let count = r.read_count(MAX_PENDING_VECTORS, "pending interrupt queue")?;
    let vectors = r.read_exact_vec(count)?;

    let mut p = PendingEventState::default();
    p.external_interrupts = VecDeque::from(vectors);
    p.set_interrupt_inhibit(inhibit);
    p.set_nmi_state(nmi_pending, nmi_blocked);
    Ok(p)
}

pub fn encode_time<W: Write>(w: &mut W, t: &TimeSource) -> Result<()> {
    w.write_u64_le(t.ticks())?;
    w.write_u64_le(t.next_seq())?;
    let deadlines = t.deadlines();
    w.write_count(deadlines.len(), "deadline list")?;
    for d in deadlines {
        w.write_u64_le(d.at_tick)?;
        w.write_u64_le(d.seq)?;
        w.write_u8(d.vector)?;
    }
    Ok(())
}

pub fn decode_time<R: Read>(r: &mut R) -> Result<TimeSource> {
    let ticks = r.read_u64_le()?;
    let next_seq = r.read_u64_le()?;
    let count = r.read_count(MAX_DEADLINES, "deadline list")?;
    let mut deadlines = Vec::with_capacity(count);
    for _ in 0..count {
        let d = Deadline {
            at_tick: r.read_u64_le()?,
            seq: r.read_u64_le()?,
            vector: r.read_u8()?,
        };
        if d.seq >= next_seq {
            return Err(SnapshotError::InvalidField("deadline sequence"));
        }
        deadlines.push(d);
    }
    Ok(TimeSource::restore(ticks, next_seq, deadlines))
}

/// MMU control registers plus the TLB arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmuImage {
    pub cr0: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub tlb: TlbImage,
}

pub fn encode_mmu<W: Write>(w: &mut W, m: &MmuImage) -> Result<()> {
    w.write_u32_le(m.cr0)?;
    w.write_u32_le(m.cr3)?;
    w.write_u32_le(m.cr4)?;
    w.write_count(m.tlb.slots.len(), "TLB slot array")?;
    for slot in &m.tlb.slots {
        w.write_u32_le(slot.vbase)?;
        w.write_u64_le(slot.pbase)?;
        w.write_u64_le(slot.leaf_addr)?;
        w.write_u8(slot.flags)?;
        w.write_u8(slot.page_size)?;
    }
    w.write_count(m.tlb.next_way.len(), "TLB replacement cursors")?;
    w.write_bytes(&m.tlb.next_way)
}

pub fn decode_mmu<R: Read>(r: &mut R) -> Result<MmuImage> {
    let cr0 = r.read_u32_le()?;
    let cr3 = r.read_u32_le()?;
    let cr4 = r.read_u32_le()?;
    let slot_count = r.read_count(MAX_TLB_SLOTS, "TLB slot array")?;
    let mut slots = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        slots.push(TlbSlot {
            vbase: r.read_u32_le()?,
            pbase: r.read_u64_le()?,
            leaf_addr: r.read_u64_le()?,
            flags: r.read_u8()?,
            page_size: r.read_u8()?,
        });
    }
    let way_count = r.read_count(MAX_TLB_SLOTS, "TLB replacement cursors")?;
    let next_way = r.read_exact_vec(way_count)?;
    Ok(MmuImage {
        cr0,
        cr3,
        cr4,
        tlb: TlbImage { slots, next_way },
    })
}
