//! x86 MMU: linear → physical translation with a software TLB.
//!
//! Supported paging modes:
//! - No paging (identity mapping of the 32-bit linear space)
//! - 32-bit paging (4KB pages, 4MB pages when CR4.PSE is set)
//! - PAE paging (4KB / 2MB pages, 36-bit physical addresses)
//!
//! Every CR3 write flushes the whole TLB, global entries included. INVLPG
//! drops every cached translation covering the given linear address.

mod tlb;

use bitflags::bitflags;
use ember_mem::PhysicalMemory;
use tlb::{LargePages, PageSize, Tlb, TlbEntry, TlbEntryAttributes};

pub use tlb::{TlbImage, TlbImageError, TlbSlot};

#[cfg(test)]
mod tests;

/// Physical memory access used for page-table walking and guest data accesses.
///
/// Accesses are infallible at this layer: what lives behind a physical
/// address the guest can name (RAM, open bus) is the backend's business.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    /// Read a byte slice from physical memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`MemoryBus::read_u8`].
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to physical memory.
    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }
}

/// Guest RAM as a page-walk and data backend.
///
/// Addresses beyond the end of RAM behave as an open bus: reads return all
/// ones and writes are dropped.
impl MemoryBus for PhysicalMemory {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.try_read_u8(paddr).unwrap_or_else(|_| {
            tracing::trace!(paddr, "open-bus read");
            0xFF
        })
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        let mut buf = [0u8; 2];
        <Self as MemoryBus>::read_bytes(self, paddr, &mut buf);
        u16::from_le_bytes(buf)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        <Self as MemoryBus>::read_bytes(self, paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        <Self as MemoryBus>::read_bytes(self, paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <Self as MemoryBus>::write_bytes(self, paddr, &[value]);
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <Self as MemoryBus>::write_bytes(self, paddr, &value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <Self as MemoryBus>::write_bytes(self, paddr, &value.to_le_bytes());
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <Self as MemoryBus>::write_bytes(self, paddr, &value.to_le_bytes());
    }

    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        if self.try_read_bytes(paddr, dst).is_ok() {
            return;
        }
        // Straddles the end of RAM: keep the in-range prefix.
        for (i, slot) in dst.iter_mut().enumerate() {
            let addr = paddr.wrapping_add(i as u64);
            *slot = self.try_read_u8(addr).unwrap_or(0xFF);
        }
        tracing::trace!(paddr, len = dst.len(), "open-bus read");
    }

    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        if self.try_write_bytes(paddr, src).is_ok() {
            return;
        }
        for (i, byte) in src.iter().copied().enumerate() {
            let _ = self.try_write_u8(paddr.wrapping_add(i as u64), byte);
        }
        tracing::trace!(paddr, len = src.len(), "open-bus write dropped");
    }
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

bitflags! {
    /// #PF error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PfErrorCode: u32 {
        /// 0 = the page was not present, 1 = protection violation.
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        /// A reserved bit was set in a paging-structure entry.
        const RSVD = 1 << 3;
    }
}

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (becomes CR2).
    pub addr: u32,
    pub error_code: PfErrorCode,
}

impl PageFault {
    #[inline]
    fn new(addr: u32, present: bool, access: AccessType, is_user: bool, rsvd: bool) -> Self {
        let mut code = PfErrorCode::empty();
        code.set(PfErrorCode::PRESENT, present);
        code.set(PfErrorCode::WRITE, access.is_write());
        code.set(PfErrorCode::USER, is_user);
        code.set(PfErrorCode::RSVD, rsvd);
        Self {
            addr,
            error_code: code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagingMode {
    Disabled,
    Legacy32,
    Pae,
}

/// MMU/TLB counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    /// TLB lookups (paging enabled only).
    pub tlb_lookups: u64,
    /// Lookups satisfied by a cached entry whose permissions allowed the access.
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    /// Full page-table walks.
    pub page_walks: u64,
    /// Whole-TLB invalidations (CR3 writes, paging mode changes).
    pub tlb_flush_all: u64,
    /// INVLPG operations.
    pub tlb_invlpg: u64,
}

/// x86 MMU with a software TLB.
#[derive(Debug, Clone)]
pub struct Mmu {
    cr0: u32,
    cr3: u32,
    cr4: u32,
    mode: PagingMode,
    large_pages: LargePages,
    tlb: Tlb,
    stats: MmuStats,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        let mut mmu = Self {
            cr0: 0,
            cr3: 0,
            cr4: 0,
            mode: PagingMode::Disabled,
            large_pages: LargePages::None,
            tlb: Tlb::new(),
            stats: MmuStats::default(),
        };
        mmu.update_cached_state();
        mmu
    }

    #[inline]
    fn update_cached_state(&mut self) {
        self.mode = if self.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if self.cr4 & CR4_PAE == 0 {
            PagingMode::Legacy32
        } else {
            PagingMode::Pae
        };

        self.large_pages = match self.mode {
            PagingMode::Disabled => LargePages::None,
            PagingMode::Legacy32 if self.cr4 & CR4_PSE != 0 => LargePages::Size4M,
            PagingMode::Legacy32 => LargePages::None,
            PagingMode::Pae => LargePages::Size2M,
        };
    }

    #[inline]
    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    #[inline]
    pub fn reset_stats(&mut self) {
        self.stats = MmuStats::default();
    }

    #[inline]
    pub fn cr0(&self) -> u32 {
        self.cr0
    }

    #[inline]
    pub fn cr3(&self) -> u32 {
        self.cr3
    }

    #[inline]
    pub fn cr4(&self) -> u32 {
        self.cr4
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.mode != PagingMode::Disabled
    }

    /// Number of valid entries cached across both TLB banks.
    pub fn tlb_valid_entries(&self) -> usize {
        self.tlb.valid_entries()
    }

    pub fn set_cr0(&mut self, value: u32) {
        let old = self.cr0;
        self.cr0 = value;
        if (old ^ value) & (CR0_PG | CR0_WP) != 0 {
            self.flush_all();
        }
        self.update_cached_state();
    }

    /// Load a new page-table root. Always invalidates every TLB entry.
    pub fn set_cr3(&mut self, value: u32) {
        self.cr3 = value;
        self.update_cached_state();
        self.flush_all();
    }

    pub fn set_cr4(&mut self, value: u32) {
        let old = self.cr4;
        self.cr4 = value;
        if (old ^ value) & (CR4_PAE | CR4_PSE | CR4_PGE) != 0 {
            self.flush_all();
        }
        self.update_cached_state();
    }

    /// Reinstate control registers without touching the TLB (snapshot restore).
    pub fn restore_control_registers(&mut self, cr0: u32, cr3: u32, cr4: u32) {
        self.cr0 = cr0;
        self.cr3 = cr3;
        self.cr4 = cr4;
        self.update_cached_state();
    }

    pub fn flush_all(&mut self) {
        self.stats.tlb_flush_all = self.stats.tlb_flush_all.wrapping_add(1);
        tracing::trace!(cr3 = self.cr3, "TLB flush");
        self.tlb.flush_all();
    }

    /// INVLPG.
    pub fn invlpg(&mut self, vaddr: u32) {
        self.stats.tlb_invlpg = self.stats.tlb_invlpg.wrapping_add(1);
        tracing::trace!(vaddr, "INVLPG");
        self.tlb.invalidate_address(vaddr);
    }

    pub fn export_tlb(&self) -> TlbImage {
        self.tlb.export()
    }

    pub fn import_tlb(&mut self, image: &TlbImage) -> Result<(), TlbImageError> {
        self.tlb.import(image)
    }

    /// Translate a linear address to a physical address.
    ///
    /// `cpl` is the privilege level the access is checked against. Only CPL 3
    /// is "user"; callers pass 0 for implicit supervisor accesses to system
    /// tables.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        cpl: u8,
    ) -> Result<u64, PageFault> {
        if self.mode == PagingMode::Disabled {
            return Ok(u64::from(vaddr));
        }

        let is_user = cpl == 3;
        let is_exec = access.is_execute();
        self.stats.tlb_lookups = self.stats.tlb_lookups.wrapping_add(1);

        if let Some(hit) = self.tlb.lookup(vaddr, is_exec, self.large_pages) {
            let entry = hit.entry;
            if self.entry_allows(&entry, access, is_user) {
                self.stats.tlb_hits = self.stats.tlb_hits.wrapping_add(1);
                let paddr = entry.translate(vaddr);
                if access.is_write() && !entry.dirty() {
                    // First write through this entry: set D in the leaf.
                    if entry.leaf_is_64() {
                        let val = bus.read_u64(entry.leaf_addr);
                        bus.write_u64(entry.leaf_addr, val | PTE_D);
                    } else {
                        let val = bus.read_u32(entry.leaf_addr);
                        bus.write_u32(entry.leaf_addr, val | PTE_D as u32);
                    }
                    self.tlb.set_dirty_slot(hit.set, hit.way);
                }
                return Ok(paddr);
            }
            // The cached rights are insufficient; the tables may have been
            // upgraded since, so drop the entry and walk.
            self.tlb.invalidate_slot(is_exec, hit.set, hit.way);
        }

        self.stats.tlb_misses = self.stats.tlb_misses.wrapping_add(1);
        self.stats.page_walks = self.stats.page_walks.wrapping_add(1);

        let (entry, paddr) = match self.mode {
            PagingMode::Disabled => return Ok(u64::from(vaddr)),
            PagingMode::Legacy32 => self.walk_legacy32(bus, vaddr, access, is_user)?,
            PagingMode::Pae => self.walk_pae(bus, vaddr, access, is_user)?,
        };
        self.tlb.insert(is_exec, entry);
        Ok(paddr)
    }

    #[inline]
    fn wp_enabled(&self) -> bool {
        self.cr0 & CR0_WP != 0
    }

    #[inline]
    fn entry_allows(&self, entry: &TlbEntry, access: AccessType, is_user: bool) -> bool {
        if is_user && !entry.user() {
            return false;
        }
        !(access.is_write() && !entry.writable() && (is_user || self.wp_enabled()))
    }

    fn check_perms(
        &self,
        vaddr: u32,
        user_ok: bool,
        writable_ok: bool,
        access: AccessType,
        is_user: bool,
    ) -> Result<(), PageFault> {
        if is_user && !user_ok {
            return Err(PageFault::new(vaddr, true, access, is_user, false));
        }
        if access.is_write() && !writable_ok && (is_user || self.wp_enabled()) {
            return Err(PageFault::new(vaddr, true, access, is_user, false));
        }
        Ok(())
    }

    fn not_present(vaddr: u32, access: AccessType, is_user: bool) -> PageFault {
        PageFault::new(vaddr, false, access, is_user, false)
    }

    fn reserved(vaddr: u32, access: AccessType, is_user: bool) -> PageFault {
        PageFault::new(vaddr, true, access, is_user, true)
    }

    fn walk_legacy32(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        is_user: bool,
    ) -> Result<(TlbEntry, u64), PageFault> {
        let pd_base = u64::from(self.cr3 & 0xffff_f000);
        let pde_addr = pd_base + u64::from(vaddr >> 22) * 4;
        let mut pde = bus.read_u32(pde_addr);
        if pde & PTE_P as u32 == 0 {
            return Err(Self::not_present(vaddr, access, is_user));
        }

        // Without CR4.PSE the PS bit is ignored and the PDE maps a page table.
        let large = pde & PTE_PS as u32 != 0 && self.cr4 & CR4_PSE != 0;
        if large && u64::from(pde) & LEGACY32_4MB_RESERVED_MASK != 0 {
            return Err(Self::reserved(vaddr, access, is_user));
        }

        if pde & PTE_A as u32 == 0 {
            pde |= PTE_A as u32;
            bus.write_u32(pde_addr, pde);
        }

        if large {
            let user_ok = pde & PTE_US as u32 != 0;
            let writable_ok = pde & PTE_RW as u32 != 0;
            self.check_perms(vaddr, user_ok, writable_ok, access, is_user)?;

            if access.is_write() && pde & PTE_D as u32 == 0 {
                pde |= PTE_D as u32;
                bus.write_u32(pde_addr, pde);
            }

            let page_size = PageSize::Size4M;
            let vbase = vaddr & 0xffc0_0000;
            let pbase = u64::from(pde & 0xffc0_0000);
            let entry = TlbEntry::new(
                vbase,
                pbase,
                page_size,
                TlbEntryAttributes {
                    user: user_ok,
                    writable: writable_ok,
                    global: self.cr4 & CR4_PGE != 0 && pde & PTE_G as u32 != 0,
                    leaf_addr: pde_addr,
                    leaf_is_64: false,
                    dirty: pde & PTE_D as u32 != 0,
                },
            );
            return Ok((entry, pbase + u64::from(vaddr - vbase)));
        }

        let pt_base = u64::from(pde & 0xffff_f000);
        let pte_addr = pt_base + u64::from((vaddr >> 12) & 0x3ff) * 4;
        let mut pte = bus.read_u32(pte_addr);
        if pte & PTE_P as u32 == 0 {
            return Err(Self::not_present(vaddr, access, is_user));
        }
        if pte & PTE_A as u32 == 0 {
            pte |= PTE_A as u32;
            bus.write_u32(pte_addr, pte);
        }

        let user_ok = pde & pte & PTE_US as u32 != 0;
        let writable_ok = pde & pte & PTE_RW as u32 != 0;
        self.check_perms(vaddr, user_ok, writable_ok, access, is_user)?;

        if access.is_write() && pte & PTE_D as u32 == 0 {
            pte |= PTE_D as u32;
            bus.write_u32(pte_addr, pte);
        }

        let vbase = vaddr & !0xfff;
        let pbase = u64::from(pte & 0xffff_f000);
        let entry = TlbEntry::new(
            vbase,
            pbase,
            PageSize::Size4K,
            TlbEntryAttributes {
                user: user_ok,
                writable: writable_ok,
                global: self.cr4 & CR4_PGE != 0 && pte & PTE_G as u32 != 0,
                leaf_addr: pte_addr,
                leaf_is_64: false,
                dirty: pte & PTE_D as u32 != 0,
            },
        );
        Ok((entry, pbase + u64::from(vaddr & 0xfff)))
    }

    fn walk_pae(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        is_user: bool,
    ) -> Result<(TlbEntry, u64), PageFault> {
        let pdpt_base = u64::from(self.cr3 & 0xffff_ffe0);
        let pdpte_addr = pdpt_base + u64::from(vaddr >> 30) * 8;
        let pdpte = bus.read_u64(pdpte_addr);
        if pdpte & PTE_P == 0 {
            return Err(Self::not_present(vaddr, access, is_user));
        }
        if pdpte & PAE_PDPTE_RESERVED != 0 {
            return Err(Self::reserved(vaddr, access, is_user));
        }

        let pd_base = pdpte & PAE_ADDR_MASK;
        let pde_addr = pd_base + u64::from((vaddr >> 21) & 0x1ff) * 8;
        let mut pde = bus.read_u64(pde_addr);
        if pde & PTE_P == 0 {
            return Err(Self::not_present(vaddr, access, is_user));
        }
        let large = pde & PTE_PS != 0;
        let reserved = if large {
            PAE_ENTRY_RESERVED | PAE_2MB_RESERVED
        } else {
            PAE_ENTRY_RESERVED
        };
        if pde & reserved != 0 {
            return Err(Self::reserved(vaddr, access, is_user));
        }
        if pde & PTE_A == 0 {
            pde |= PTE_A;
            bus.write_u64(pde_addr, pde);
        }

        if large {
            let user_ok = pde & PTE_US != 0;
            let writable_ok = pde & PTE_RW != 0;
            self.check_perms(vaddr, user_ok, writable_ok, access, is_user)?;

            if access.is_write() && pde & PTE_D == 0 {
                pde |= PTE_D;
                bus.write_u64(pde_addr, pde);
            }

            let vbase = vaddr & 0xffe0_0000;
            let pbase = pde & PAE_ADDR_MASK & !0x1f_ffff;
            let entry = TlbEntry::new(
                vbase,
                pbase,
                PageSize::Size2M,
                TlbEntryAttributes {
                    user: user_ok,
                    writable: writable_ok,
                    global: self.cr4 & CR4_PGE != 0 && pde & PTE_G != 0,
                    leaf_addr: pde_addr,
                    leaf_is_64: true,
                    dirty: pde & PTE_D != 0,
                },
            );
            return Ok((entry, pbase + u64::from(vaddr - vbase)));
        }

        let pt_base = pde & PAE_ADDR_MASK;
        let pte_addr = pt_base + u64::from((vaddr >> 12) & 0x1ff) * 8;
        let mut pte = bus.read_u64(pte_addr);
        if pte & PTE_P == 0 {
            return Err(Self::not_present(vaddr, access, is_user));
        }
        if pte & PAE_ENTRY_RESERVED != 0 {
            return Err(Self::reserved(vaddr, access, is_user));
        }
        if pte & PTE_A == 0 {
            pte |= PTE_A;
            bus.write_u64(pte_addr, pte);
        }

        let user_ok = pde & pte & PTE_US != 0;
        let writable_ok = pde & pte & PTE_RW != 0;
        self.check_perms(vaddr, user_ok, writable_ok, access, is_user)?;

        if access.is_write() && pte & PTE_D == 0 {
            pte |= PTE_D;
            bus.write_u64(pte_addr, pte);
        }

        let vbase = vaddr & !0xfff;
        let pbase = pte & PAE_ADDR_MASK;
        let entry = TlbEntry::new(
            vbase,
            pbase,
            PageSize::Size4K,
            TlbEntryAttributes {
                user: user_ok,
                writable: writable_ok,
                global: self.cr4 & CR4_PGE != 0 && pte & PTE_G != 0,
                leaf_addr: pte_addr,
                leaf_is_64: true,
                dirty: pte & PTE_D != 0,
            },
        );
        Ok((entry, pbase + u64::from(vaddr & 0xfff)))
    }
}

pub const CR0_WP: u32 = 1 << 16;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PAE: u32 = 1 << 5;
pub const CR4_PGE: u32 = 1 << 7;

pub const PTE_P: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_US: u64 = 1 << 2;
pub const PTE_A: u64 = 1 << 5;
pub const PTE_D: u64 = 1 << 6;
pub const PTE_PS: u64 = 1 << 7;
pub const PTE_G: u64 = 1 << 8;

/// Bits 13..=21 of a 4MB PDE (no PSE-36 support).
const LEGACY32_4MB_RESERVED_MASK: u64 = 0x003f_e000;

/// PAE physical addresses are limited to 36 bits.
const PAE_ADDR_MASK: u64 = 0x0000_000f_ffff_f000;
/// Bits 36..=63 (NX is reserved without EFER.NXE).
const PAE_ENTRY_RESERVED: u64 = 0xffff_fff0_0000_0000;
/// Bits 13..=20 of a 2MB PDE.
const PAE_2MB_RESERVED: u64 = 0x001f_e000;
/// PDPTE bits 1, 2 and 5..=8 plus everything above the physical address width.
const PAE_PDPTE_RESERVED: u64 = PAE_ENTRY_RESERVED | 0x1e6;
