//! Save-state for a single [`Vcpu`] over flat guest RAM.
//!
//! A snapshot is a little-endian file header (magic, version) followed by
//! tagged sections `(id: u32, len: u64, payload)`. Restoring a snapshot and
//! running the same instruction stream reproduces the original execution
//! exactly, TLB hits and misses included. Unknown sections are skipped so
//! newer writers can add state without breaking older readers.

mod cpu;
mod error;
mod format;
mod io;
mod ram;

pub use crate::cpu::MmuImage;
pub use crate::error::{Result, SnapshotError};
pub use crate::format::{SectionId, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use crate::ram::{Compression, RamWriteOptions};

use std::io::{Read, Seek, SeekFrom, Write};

use ember_cpu_core::{CpuState, PendingEventState, PortIo, TimeSource, Vcpu};
use ember_mem::PhysicalMemory;
use ember_mmu::Mmu;

use crate::io::SnapshotField;

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    pub ram: RamWriteOptions,
}

pub fn save_snapshot<W: Write + Seek, P: PortIo>(
    w: &mut W,
    vcpu: &Vcpu<PhysicalMemory, P>,
    options: SaveOptions,
) -> Result<()> {
    write_file_header(w)?;
    write_section(w, SectionId::CPU, |w| cpu::encode_cpu_state(w, &vcpu.state))?;
    write_section(w, SectionId::PENDING, |w| cpu::encode_pending(w, &vcpu.pending))?;
    write_section(w, SectionId::TIME, |w| cpu::encode_time(w, &vcpu.time))?;
    write_section(w, SectionId::MMU, |w| {
        let image = MmuImage {
            cr0: vcpu.mmu.cr0(),
            cr3: vcpu.mmu.cr3(),
            cr4: vcpu.mmu.cr4(),
            tlb: vcpu.mmu.export_tlb(),
        };
        cpu::encode_mmu(w, &image)
    })?;
    write_section(w, SectionId::RAM, |w| {
        ram::encode_ram_section(w, vcpu.bus.as_slice(), options.ram)
    })?;
    Ok(())
}

/// Replace the state of `vcpu` with the snapshot read from `r`.
///
/// Every section is decoded and validated before anything is committed, so
/// on error `vcpu` is left untouched. Guest RAM must already have the size
/// recorded in the snapshot.
pub fn restore_snapshot<R: Read, P: PortIo>(r: &mut R, vcpu: &mut Vcpu<PhysicalMemory, P>) -> Result<()> {
    read_file_header(r)?;

    let mut decoded = Decoded::default();
    let ram_len = vcpu.bus.as_slice().len();
    while let Some(header) = read_section_header(r)? {
        let mut section = r.take(header.len);
        decoded
            .section(header.id, &mut section, ram_len)
            .and_then(|()| {
                // Fields appended by newer writers.
                std::io::copy(&mut section, &mut std::io::sink())?;
                Ok(())
            })
            .map_err(|e| e.in_section(header.id))?;
        if section.limit() != 0 {
            return Err(SnapshotError::TruncatedSection(header.id));
        }
    }

    let state = decoded.state.ok_or(SnapshotError::MissingSection(SectionId::CPU))?;
    let ram = decoded.ram.ok_or(SnapshotError::MissingSection(SectionId::RAM))?;

    let mut mmu = Mmu::new();
    mmu.restore_control_registers(state.cr0, state.cr3, state.cr4);
    if let Some(image) = decoded.mmu {
        if (image.cr0, image.cr3, image.cr4) != (state.cr0, state.cr3, state.cr4) {
            return Err(SnapshotError::Inconsistent {
                section: SectionId::MMU,
                reason: "control registers",
            });
        }
        mmu.import_tlb(&image.tlb)?;
    }

    vcpu.state = state;
    vcpu.pending = decoded.pending.unwrap_or_else(PendingEventState::default);
    vcpu.time = decoded.time.unwrap_or_else(TimeSource::new);
    vcpu.mmu = mmu;
    vcpu.bus.as_mut_slice().copy_from_slice(&ram);
    Ok(())
}

/// Sections decoded so far, held back until the whole file validates.
#[derive(Default)]
struct Decoded {
    state: Option<CpuState>,
    pending: Option<PendingEventState>,
    time: Option<TimeSource>,
    mmu: Option<MmuImage>,
    ram: Option<Vec<u8>>,
}

impl Decoded {
    fn section<R: Read>(&mut self, id: SectionId, r: &mut R, ram_len: usize) -> Result<()> {
        match id {
            SectionId::CPU => set_once(&mut self.state, id, cpu::decode_cpu_state(r)?),
            SectionId::PENDING => set_once(&mut self.pending, id, cpu::decode_pending(r)?),
            SectionId::TIME => set_once(&mut self.time, id, cpu::decode_time(r)?),
            SectionId::MMU => set_once(&mut self.mmu, id, cpu::decode_mmu(r)?),
            SectionId::RAM => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(ram_len)
                    .map_err(|_| SnapshotError::OutOfMemory { len: ram_len })?;
                buf.resize(ram_len, 0);
                ram::decode_ram_section_into(r, &mut buf)?;
                set_once(&mut self.ram, id, buf)
            }
            // Unknown section; the caller drains it.
            _ => Ok(()),
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, id: SectionId, value: T) -> Result<()> {
    if slot.is_some() {
        return Err(SnapshotError::DuplicateSection(id));
    }
    *slot = Some(value);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    id: SectionId,
    len: u64,
}

fn write_file_header<W: Write>(w: &mut W) -> Result<()> {
    w.write_u32_le(SNAPSHOT_MAGIC)?;
    w.write_u32_le(SNAPSHOT_VERSION)?;
    Ok(())
}

fn read_file_header<R: Read>(r: &mut R) -> Result<()> {
    let magic = r.read_u32_le()?;
    if magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic(magic));
    }
    let version = r.read_u32_le()?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    Ok(())
}

fn write_section<W: Write + Seek>(
    w: &mut W,
    id: SectionId,
    f: impl FnOnce(&mut W) -> Result<()>,
) -> Result<()> {
    let header_pos = w.stream_position()?;
    w.write_u32_le(id.0)?;
    w.write_u64_le(0)?; // placeholder len

    let payload_start = w.stream_position()?;
    f(w)?;
    let payload_end = w.stream_position()?;

    let len = payload_end.checked_sub(payload_start).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "writer seeked back past the section header")
    })?;

    w.seek(SeekFrom::Start(header_pos + 4))?;
    w.write_u64_le(len)?;
    w.seek(SeekFrom::Start(payload_end))?;
    Ok(())
}

fn read_section_header<R: Read>(r: &mut R) -> Result<Option<SectionHeader>> {
    let mut first = [0u8; 1];
    if r.read(&mut first)? == 0 {
        return Ok(None);
    }
    let mut tag = [0u8; 4];
    tag[0] = first[0];
    r.read_exact(&mut tag[1..])?;
    let id = SectionId(u32::from_le_bytes(tag));
    let len = r.read_u64_le()?;
    Ok(Some(SectionHeader { id, len }))
}
