use super::*;

use core::convert::TryInto;

#[derive(Clone)]
struct TestMemory {
    data: Vec<u8>,
    writes: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            writes: 0,
        }
    }

    fn write_u32_raw(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64_raw(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u32_raw(&self, paddr: u64) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn read_u64_raw(&self, paddr: u64) -> u64 {
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }
}

impl MemoryBus for TestMemory {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.data[paddr as usize]
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        let off = paddr as usize;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.read_u32_raw(paddr)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        self.read_u64_raw(paddr)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.writes += 1;
        self.data[paddr as usize] = value;
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.writes += 1;
        let off = paddr as usize;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.writes += 1;
        self.write_u32_raw(paddr, value);
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.writes += 1;
        self.write_u64_raw(paddr, value);
    }
}

const PD: u64 = 0x1000;
const PT: u64 = 0x2000;

/// 32-bit paging with one page table covering linear 0..4MB.
fn legacy_setup(mem: &mut TestMemory, pde_flags: u64) -> Mmu {
    mem.write_u32_raw(PD, (PT | pde_flags) as u32);
    let mut mmu = Mmu::new();
    mmu.set_cr3(PD as u32);
    mmu.set_cr0(CR0_PG | 1);
    mmu
}

fn map4k(mem: &mut TestMemory, vaddr: u32, paddr: u64, flags: u64) {
    let idx = u64::from((vaddr >> 12) & 0x3ff);
    mem.write_u32_raw(PT + idx * 4, (paddr | flags) as u32);
}

#[test]
fn no_paging_is_identity() {
    let mut mmu = Mmu::new();
    let mut mem = TestMemory::new(0x10);
    assert_eq!(mmu.translate(&mut mem, 0x1234, AccessType::Read, 0), Ok(0x1234));
    assert_eq!(
        mmu.translate(&mut mem, 0xdead_beef, AccessType::Write, 3),
        Ok(0xdead_beef)
    );
    assert_eq!(mmu.stats().tlb_lookups, 0);
}

#[test]
fn second_translation_hits_the_tlb() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW | PTE_US);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_RW | PTE_US);

    let first = mmu.translate(&mut mem, 0x3456, AccessType::Read, 0);
    let second = mmu.translate(&mut mem, 0x3456, AccessType::Read, 0);
    assert_eq!(first, Ok(0x8456));
    assert_eq!(second, first);

    let stats = mmu.stats();
    assert_eq!(stats.page_walks, 1);
    assert_eq!(stats.tlb_hits, 1);
    assert_eq!(stats.tlb_misses, 1);
}

#[test]
fn reset_stats_keeps_cached_translations() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW | PTE_US);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_RW | PTE_US);

    mmu.translate(&mut mem, 0x3000, AccessType::Read, 0).unwrap();
    mmu.reset_stats();
    assert_eq!(mmu.stats(), MmuStats::default());

    assert_eq!(mmu.translate(&mut mem, 0x3010, AccessType::Read, 0), Ok(0x8010));
    let stats = mmu.stats();
    assert_eq!(stats.tlb_hits, 1);
    assert_eq!(stats.page_walks, 0);
}

#[test]
fn cr3_write_invalidates_every_entry() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_RW | PTE_G);
    map4k(&mut mem, 0x4000, 0x9000, PTE_P | PTE_RW);
    mmu.set_cr4(CR4_PGE);

    mmu.translate(&mut mem, 0x3000, AccessType::Read, 0).unwrap();
    mmu.translate(&mut mem, 0x4000, AccessType::Execute, 0).unwrap();
    assert_eq!(mmu.tlb_valid_entries(), 2);

    mmu.set_cr3(PD as u32);
    assert_eq!(mmu.tlb_valid_entries(), 0, "global pages are flushed too");

    let walks = mmu.stats().page_walks;
    mmu.translate(&mut mem, 0x3000, AccessType::Read, 0).unwrap();
    assert_eq!(mmu.stats().page_walks, walks + 1);
}

#[test]
fn stale_entry_survives_until_invlpg() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_RW);
    assert_eq!(mmu.translate(&mut mem, 0x3000, AccessType::Read, 0), Ok(0x8000));

    map4k(&mut mem, 0x3000, 0xa000, PTE_P | PTE_RW);
    assert_eq!(mmu.translate(&mut mem, 0x3000, AccessType::Read, 0), Ok(0x8000));

    mmu.invlpg(0x3abc);
    assert_eq!(mmu.translate(&mut mem, 0x3000, AccessType::Read, 0), Ok(0xa000));
    assert_eq!(mmu.stats().tlb_invlpg, 1);
}

#[test]
fn not_present_page_faults_with_p_clear() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW | PTE_US);

    let pf = mmu
        .translate(&mut mem, 0x5123, AccessType::Write, 3)
        .unwrap_err();
    assert_eq!(pf.addr, 0x5123);
    assert_eq!(pf.error_code, PfErrorCode::WRITE | PfErrorCode::USER);
    assert!(!pf.error_code.contains(PfErrorCode::PRESENT));

    // Missing page directory entry.
    let pf = mmu
        .translate(&mut mem, 0x0080_0000, AccessType::Read, 0)
        .unwrap_err();
    assert_eq!(pf.error_code, PfErrorCode::empty());
}

#[test]
fn user_write_to_read_only_or_supervisor_page_faults() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW | PTE_US);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_US);
    map4k(&mut mem, 0x4000, 0x9000, PTE_P | PTE_RW);

    let expected = PfErrorCode::PRESENT | PfErrorCode::WRITE | PfErrorCode::USER;
    let pf = mmu.translate(&mut mem, 0x3000, AccessType::Write, 3).unwrap_err();
    assert_eq!(pf.error_code, expected);
    let pf = mmu.translate(&mut mem, 0x4000, AccessType::Write, 3).unwrap_err();
    assert_eq!(pf.error_code, expected);

    let pf = mmu.translate(&mut mem, 0x4000, AccessType::Read, 3).unwrap_err();
    assert_eq!(pf.error_code, PfErrorCode::PRESENT | PfErrorCode::USER);

    // User reads of a user read-only page are fine.
    assert_eq!(mmu.translate(&mut mem, 0x3010, AccessType::Read, 3), Ok(0x8010));
}

#[test]
fn supervisor_writes_honor_cr0_wp() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P);

    assert_eq!(mmu.translate(&mut mem, 0x3000, AccessType::Write, 0), Ok(0x8000));

    mmu.set_cr0(CR0_PG | CR0_WP | 1);
    let pf = mmu.translate(&mut mem, 0x3000, AccessType::Write, 0).unwrap_err();
    assert_eq!(pf.error_code, PfErrorCode::PRESENT | PfErrorCode::WRITE);
}

#[test]
fn walk_sets_accessed_and_dirty_bits() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_RW);

    mmu.translate(&mut mem, 0x3000, AccessType::Read, 0).unwrap();
    assert_ne!(u64::from(mem.read_u32_raw(PD)) & PTE_A, 0);
    let pte = u64::from(mem.read_u32_raw(PT + 3 * 4));
    assert_ne!(pte & PTE_A, 0);
    assert_eq!(pte & PTE_D, 0);

    // Write hit on a clean cached entry sets D without another walk.
    let walks = mmu.stats().page_walks;
    mmu.translate(&mut mem, 0x3004, AccessType::Write, 0).unwrap();
    assert_eq!(mmu.stats().page_walks, walks);
    assert_ne!(u64::from(mem.read_u32_raw(PT + 3 * 4)) & PTE_D, 0);

    // Already dirty: no further page-table writes.
    let writes = mem.writes;
    mmu.translate(&mut mem, 0x3008, AccessType::Write, 0).unwrap();
    assert_eq!(mem.writes, writes);
}

#[test]
fn insufficient_cached_rights_fall_back_to_a_walk() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW | PTE_US);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_US);
    mmu.translate(&mut mem, 0x3000, AccessType::Read, 3).unwrap();

    // Upgrade to writable without INVLPG; the cached read-only entry must not fault.
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_RW | PTE_US);
    assert_eq!(mmu.translate(&mut mem, 0x3000, AccessType::Write, 3), Ok(0x8000));
    assert_eq!(mmu.stats().page_walks, 2);
}

#[test]
fn pse_4mb_pages() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = Mmu::new();
    mem.write_u32_raw(PD + 4, (0x0080_0000 | PTE_P | PTE_RW | PTE_PS) as u32);
    mmu.set_cr3(PD as u32);
    mmu.set_cr4(CR4_PSE);
    mmu.set_cr0(CR0_PG | 1);

    assert_eq!(
        mmu.translate(&mut mem, 0x0045_6789, AccessType::Write, 0),
        Ok(0x0085_6789)
    );
    assert_ne!(u64::from(mem.read_u32_raw(PD + 4)) & PTE_D, 0);

    // Reserved bits in a 4MB PDE.
    mem.write_u32_raw(PD + 8, (0x00c0_2000 | PTE_P | PTE_PS) as u32);
    let pf = mmu
        .translate(&mut mem, 0x0080_0000, AccessType::Read, 0)
        .unwrap_err();
    assert!(pf.error_code.contains(PfErrorCode::RSVD | PfErrorCode::PRESENT));
}

#[test]
fn ps_bit_is_ignored_without_pse() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW | PTE_PS);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P);
    assert_eq!(mmu.translate(&mut mem, 0x3000, AccessType::Read, 0), Ok(0x8000));
}

#[test]
fn pae_4k_and_2m_pages() {
    let mut mem = TestMemory::new(0x10000);
    let pdpt = 0x3000u64;
    let pd = 0x4000u64;
    let pt = 0x5000u64;
    mem.write_u64_raw(pdpt, pd | PTE_P);
    mem.write_u64_raw(pd, pt | PTE_P | PTE_RW | PTE_US);
    mem.write_u64_raw(pt + 8, 0x1_2345_6000 | PTE_P | PTE_RW | PTE_US);
    mem.write_u64_raw(pd + 8, 0x2_0020_0000 | PTE_P | PTE_RW | PTE_PS);

    let mut mmu = Mmu::new();
    mmu.set_cr4(CR4_PAE);
    mmu.set_cr3(pdpt as u32);
    mmu.set_cr0(CR0_PG | 1);

    assert_eq!(
        mmu.translate(&mut mem, 0x1abc, AccessType::Read, 3),
        Ok(0x1_2345_6abc)
    );
    assert_eq!(
        mmu.translate(&mut mem, 0x0021_0000, AccessType::Write, 0),
        Ok(0x2_0021_0000)
    );
    assert_ne!(mem.read_u64_raw(pd + 8) & PTE_D, 0);

    let pf = mmu
        .translate(&mut mem, 0x0021_0000, AccessType::Read, 3)
        .unwrap_err();
    assert_eq!(pf.error_code, PfErrorCode::PRESENT | PfErrorCode::USER);
}

#[test]
fn pae_reserved_bits_fault() {
    let mut mem = TestMemory::new(0x10000);
    let pdpt = 0x3000u64;
    mem.write_u64_raw(pdpt, 0x4000 | PTE_P | PTE_RW);

    let mut mmu = Mmu::new();
    mmu.set_cr4(CR4_PAE);
    mmu.set_cr3(pdpt as u32);
    mmu.set_cr0(CR0_PG | 1);

    let pf = mmu.translate(&mut mem, 0x1000, AccessType::Read, 0).unwrap_err();
    assert_eq!(pf.error_code, PfErrorCode::PRESENT | PfErrorCode::RSVD);
}

#[test]
fn tlb_export_import_round_trips() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW);
    map4k(&mut mem, 0x3000, 0x8000, PTE_P | PTE_RW);
    mmu.translate(&mut mem, 0x3000, AccessType::Read, 0).unwrap();

    let image = mmu.export_tlb();
    let mut other = Mmu::new();
    other.restore_control_registers(mmu.cr0(), mmu.cr3(), mmu.cr4());
    other.import_tlb(&image).unwrap();
    assert_eq!(other.tlb_valid_entries(), 1);

    // Served from the imported entry even though the table changed.
    map4k(&mut mem, 0x3000, 0xa000, PTE_P | PTE_RW);
    assert_eq!(other.translate(&mut mem, 0x3000, AccessType::Read, 0), Ok(0x8000));
    assert_eq!(other.stats().page_walks, 0);
}

proptest::proptest! {
    #[test]
    fn cached_translation_matches_the_walk(page in 0u32..1024, offset in 0u32..4096) {
        let mut mem = TestMemory::new(0x10000);
        let mut mmu = legacy_setup(&mut mem, PTE_P | PTE_RW | PTE_US);
        let frame = u64::from((page ^ 0x155) + 0x100);
        map4k(&mut mem, page << 12, frame << 12, PTE_P | PTE_RW | PTE_US);

        let vaddr = (page << 12) | offset;
        let expected = (frame << 12) | u64::from(offset);
        proptest::prop_assert_eq!(mmu.translate(&mut mem, vaddr, AccessType::Read, 3), Ok(expected));
        proptest::prop_assert_eq!(mmu.translate(&mut mem, vaddr, AccessType::Read, 0), Ok(expected));
        proptest::prop_assert_eq!(mmu.stats().page_walks, 1);
    }
}

#[test]
fn physical_memory_beyond_ram_is_open_bus() {
    let mut ram = PhysicalMemory::new(0x1000).unwrap();
    MemoryBus::write_u32(&mut ram, 0x2000, 0x1234_5678);
    assert_eq!(MemoryBus::read_u32(&mut ram, 0x2000), 0xffff_ffff);
    assert_eq!(MemoryBus::read_u8(&mut ram, 0x1000), 0xff);

    MemoryBus::write_u16(&mut ram, 0xffe, 0xbeef);
    assert_eq!(MemoryBus::read_u16(&mut ram, 0xffe), 0xbeef);
}
