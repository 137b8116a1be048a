//! Set-associative software TLB.
//!
//! Entries live in a fixed arena of `SETS * WAYS` slots per bank and are
//! addressed by `(set, way)` integer handles. Invalidation clears the valid
//! flag in place; nothing is ever freed or re-linked.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PageSize {
    Size4K = 0,
    Size2M = 1,
    Size4M = 2,
}

impl PageSize {
    #[inline]
    pub(crate) const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 4 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4M => 4 * 1024 * 1024,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PageSize::Size4K),
            1 => Some(PageSize::Size2M),
            2 => Some(PageSize::Size4M),
            _ => None,
        }
    }
}

/// Which large page size can be cached under the current paging mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LargePages {
    None,
    Size2M,
    Size4M,
}

const FLAG_USER: u8 = 1 << 0;
const FLAG_WRITABLE: u8 = 1 << 1;
const FLAG_GLOBAL: u8 = 1 << 2;
const FLAG_LEAF_64: u8 = 1 << 3;
const FLAG_DIRTY: u8 = 1 << 4;
const FLAG_VALID: u8 = 1 << 5;
const FLAG_MASK: u8 = 0x3f;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntry {
    /// Linear base of the page (aligned to `page_size`).
    vbase: u32,
    /// Physical base of the page.
    pbase: u64,
    /// Physical address of the leaf paging-structure entry, used to set D lazily.
    pub(crate) leaf_addr: u64,
    flags: u8,
    page_size: PageSize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntryAttributes {
    pub(crate) user: bool,
    pub(crate) writable: bool,
    pub(crate) global: bool,
    pub(crate) leaf_addr: u64,
    /// `true` for PAE entries (64-bit), `false` for 32-bit paging entries.
    pub(crate) leaf_is_64: bool,
    pub(crate) dirty: bool,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            vbase: 0,
            pbase: 0,
            leaf_addr: 0,
            flags: 0,
            page_size: PageSize::Size4K,
        }
    }
}

impl TlbEntry {
    pub(crate) fn new(vbase: u32, pbase: u64, page_size: PageSize, attrs: TlbEntryAttributes) -> Self {
        let mut flags = FLAG_VALID;
        if attrs.user {
            flags |= FLAG_USER;
        }
        if attrs.writable {
            flags |= FLAG_WRITABLE;
        }
        if attrs.global {
            flags |= FLAG_GLOBAL;
        }
        if attrs.leaf_is_64 {
            flags |= FLAG_LEAF_64;
        }
        if attrs.dirty {
            flags |= FLAG_DIRTY;
        }
        Self {
            vbase,
            pbase,
            leaf_addr: attrs.leaf_addr,
            flags,
            page_size,
        }
    }

    #[inline]
    pub(crate) fn translate(&self, vaddr: u32) -> u64 {
        debug_assert!(vaddr >= self.vbase);
        self.pbase + u64::from(vaddr - self.vbase)
    }

    #[inline]
    pub(crate) fn user(&self) -> bool {
        self.flags & FLAG_USER != 0
    }

    #[inline]
    pub(crate) fn writable(&self) -> bool {
        self.flags & FLAG_WRITABLE != 0
    }

    #[inline]
    pub(crate) fn leaf_is_64(&self) -> bool {
        self.flags & FLAG_LEAF_64 != 0
    }

    #[inline]
    pub(crate) fn dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    #[inline]
    fn valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }
}

pub(crate) const WAYS: usize = 4;
pub(crate) const SETS: usize = 64;

/// A handle to one arena slot returned by a lookup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbHit {
    pub(crate) entry: TlbEntry,
    pub(crate) set: u8,
    pub(crate) way: u8,
}

#[derive(Debug, Clone)]
struct TlbBank {
    entries: [[TlbEntry; WAYS]; SETS],
    next_way: [u8; SETS],
    // Valid large-page entries currently cached; lets lookups skip the
    // large-page probe entirely when none exist.
    large: u16,
}

impl TlbBank {
    fn new() -> Self {
        Self {
            entries: [[TlbEntry::default(); WAYS]; SETS],
            next_way: [0; SETS],
            large: 0,
        }
    }

    fn probe(&self, vaddr: u32, page_size: PageSize) -> Option<TlbHit> {
        let vbase = vaddr & !((page_size.bytes() - 1) as u32);
        let set = set_index(vbase);
        for way in 0..WAYS {
            let entry = &self.entries[set][way];
            if entry.valid() && entry.page_size == page_size && entry.vbase == vbase {
                return Some(TlbHit {
                    entry: *entry,
                    set: set as u8,
                    way: way as u8,
                });
            }
        }
        None
    }

    fn lookup(&self, vaddr: u32, large: LargePages) -> Option<TlbHit> {
        if self.large != 0 {
            let hit = match large {
                LargePages::None => None,
                LargePages::Size2M => self.probe(vaddr, PageSize::Size2M),
                LargePages::Size4M => self.probe(vaddr, PageSize::Size4M),
            };
            if hit.is_some() {
                return hit;
            }
        }
        self.probe(vaddr, PageSize::Size4K)
    }

    fn insert(&mut self, entry: TlbEntry) {
        let set = set_index(entry.vbase);

        for way in 0..WAYS {
            let cur = &mut self.entries[set][way];
            if cur.valid() && cur.vbase == entry.vbase && cur.page_size == entry.page_size {
                *cur = entry;
                return;
            }
        }

        let way = self.next_way[set] as usize % WAYS;
        self.next_way[set] = self.next_way[set].wrapping_add(1);

        let old = self.entries[set][way];
        if old.valid() && old.page_size != PageSize::Size4K {
            self.large -= 1;
        }
        self.entries[set][way] = entry;
        if entry.page_size != PageSize::Size4K {
            self.large += 1;
        }
    }

    fn invalidate_slot(&mut self, set: usize, way: usize) {
        let entry = &mut self.entries[set][way];
        if entry.valid() {
            if entry.page_size != PageSize::Size4K {
                self.large -= 1;
            }
            entry.flags &= !FLAG_VALID;
        }
    }

    fn invalidate_address(&mut self, vaddr: u32) {
        for page_size in [PageSize::Size4M, PageSize::Size2M, PageSize::Size4K] {
            while let Some(hit) = self.probe(vaddr, page_size) {
                self.invalidate_slot(hit.set as usize, hit.way as usize);
            }
        }
    }

    fn flush_all(&mut self) {
        self.large = 0;
        for set in self.entries.iter_mut() {
            for entry in set.iter_mut() {
                entry.flags &= !FLAG_VALID;
            }
        }
    }

    fn valid_entries(&self) -> usize {
        self.entries
            .iter()
            .flat_map(|set| set.iter())
            .filter(|e| e.valid())
            .count()
    }
}

#[inline]
fn set_index(vbase: u32) -> usize {
    let tag = vbase >> 12;
    ((tag ^ (tag >> 6) ^ (tag >> 12)) as usize) & (SETS - 1)
}

/// Split instruction/data TLB.
#[derive(Debug, Clone)]
pub(crate) struct Tlb {
    itlb: TlbBank,
    dtlb: TlbBank,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            itlb: TlbBank::new(),
            dtlb: TlbBank::new(),
        }
    }

    #[inline]
    fn bank(&self, is_exec: bool) -> &TlbBank {
        if is_exec {
            &self.itlb
        } else {
            &self.dtlb
        }
    }

    #[inline]
    fn bank_mut(&mut self, is_exec: bool) -> &mut TlbBank {
        if is_exec {
            &mut self.itlb
        } else {
            &mut self.dtlb
        }
    }

    #[inline]
    pub(crate) fn lookup(&self, vaddr: u32, is_exec: bool, large: LargePages) -> Option<TlbHit> {
        self.bank(is_exec).lookup(vaddr, large)
    }

    pub(crate) fn insert(&mut self, is_exec: bool, entry: TlbEntry) {
        self.bank_mut(is_exec).insert(entry);
    }

    pub(crate) fn invalidate_slot(&mut self, is_exec: bool, set: u8, way: u8) {
        self.bank_mut(is_exec)
            .invalidate_slot(set as usize, way as usize);
    }

    pub(crate) fn set_dirty_slot(&mut self, set: u8, way: u8) {
        let entry = &mut self.dtlb.entries[set as usize][way as usize];
        debug_assert!(entry.valid());
        entry.flags |= FLAG_DIRTY;
    }

    pub(crate) fn invalidate_address(&mut self, vaddr: u32) {
        self.itlb.invalidate_address(vaddr);
        self.dtlb.invalidate_address(vaddr);
    }

    pub(crate) fn flush_all(&mut self) {
        self.itlb.flush_all();
        self.dtlb.flush_all();
    }

    pub(crate) fn valid_entries(&self) -> usize {
        self.itlb.valid_entries() + self.dtlb.valid_entries()
    }

    pub(crate) fn export(&self) -> TlbImage {
        let mut slots = Vec::with_capacity(2 * SETS * WAYS);
        let mut next_way = Vec::with_capacity(2 * SETS);
        for bank in [&self.itlb, &self.dtlb] {
            next_way.extend_from_slice(&bank.next_way);
            for set in bank.entries.iter() {
                for e in set.iter() {
                    slots.push(TlbSlot {
                        vbase: e.vbase,
                        pbase: e.pbase,
                        leaf_addr: e.leaf_addr,
                        flags: e.flags,
                        page_size: e.page_size as u8,
                    });
                }
            }
        }
        TlbImage { slots, next_way }
    }

    pub(crate) fn import(&mut self, image: &TlbImage) -> Result<(), TlbImageError> {
        if image.slots.len() != 2 * SETS * WAYS || image.next_way.len() != 2 * SETS {
            return Err(TlbImageError::Geometry);
        }
        let mut fresh = Tlb::new();
        for (bank_idx, bank) in [&mut fresh.itlb, &mut fresh.dtlb].into_iter().enumerate() {
            bank.next_way
                .copy_from_slice(&image.next_way[bank_idx * SETS..(bank_idx + 1) * SETS]);
            for set in 0..SETS {
                for way in 0..WAYS {
                    let slot = image.slots[(bank_idx * SETS + set) * WAYS + way];
                    let page_size =
                        PageSize::from_u8(slot.page_size).ok_or(TlbImageError::PageSize)?;
                    if slot.flags & !FLAG_MASK != 0 {
                        return Err(TlbImageError::Flags);
                    }
                    let entry = TlbEntry {
                        vbase: slot.vbase,
                        pbase: slot.pbase,
                        leaf_addr: slot.leaf_addr,
                        flags: slot.flags,
                        page_size,
                    };
                    if entry.valid() && page_size != PageSize::Size4K {
                        bank.large += 1;
                    }
                    bank.entries[set][way] = entry;
                }
            }
        }
        *self = fresh;
        Ok(())
    }
}

/// Raw TLB arena contents, in bank/set/way order (ITLB first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlbImage {
    pub slots: Vec<TlbSlot>,
    /// Round-robin replacement cursor for every set (ITLB first).
    pub next_way: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlbSlot {
    pub vbase: u32,
    pub pbase: u64,
    pub leaf_addr: u64,
    pub flags: u8,
    pub page_size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbImageError {
    Geometry,
    PageSize,
    Flags,
}

impl std::fmt::Display for TlbImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlbImageError::Geometry => f.write_str("TLB image has the wrong number of slots"),
            TlbImageError::PageSize => f.write_str("TLB image contains an invalid page size"),
            TlbImageError::Flags => f.write_str("TLB image contains unknown flag bits"),
        }
    }
}

impl std::error::Error for TlbImageError {}
