#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PageSize {
    Size4K,
    Size4M,
}

impl PageSize {
    #[inline]
    pub(crate) const fn bytes(self) -> u32 {
        match self {
            PageSize::Size4K => 4 * 1024,
            PageSize::Size4M => 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntry {
    vbase: u32,
    /// Cached `pbase - vbase` (wrapping) so translation is a single add.
    paddr_delta: u32,
    /// Physical address of the leaf paging-structure entry (PTE or 4M PDE).
    pub(crate) leaf_addr: u64,
    flags: u8,
    page_size: PageSize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbHit {
    pub(crate) entry: TlbEntry,
    set: u8,
    way: u8,
}

const FLAG_USER: u8 = 1 << 0;
const FLAG_WRITABLE: u8 = 1 << 1;
const FLAG_GLOBAL: u8 = 1 << 2;
const FLAG_DIRTY: u8 = 1 << 3;
const FLAG_VALID: u8 = 1 << 4;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntryAttributes {
    pub(crate) user: bool,
    pub(crate) writable: bool,
    pub(crate) global: bool,
    pub(crate) leaf_addr: u64,
    /// Cached state of the leaf dirty bit. Used to lazily set D on write hits.
    pub(crate) dirty: bool,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            vbase: 0,
            paddr_delta: 0,
            leaf_addr: 0,
            flags: 0,
            page_size: PageSize::Size4K,
        }
    }
}

impl TlbEntry {
    pub(crate) fn new(
        vbase: u32,
        pbase: u32,
        page_size: PageSize,
        attrs: TlbEntryAttributes,
    ) -> Self {
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
        if attrs.dirty {
            flags |= FLAG_DIRTY;
        }
        Self {
            vbase,
            paddr_delta: pbase.wrapping_sub(vbase),
            leaf_addr: attrs.leaf_addr,
            flags,
            page_size,
        }
    }

    #[inline]
    pub(crate) fn translate(&self, vaddr: u32) -> u32 {
        debug_assert!(vaddr >= self.vbase);
        vaddr.wrapping_add(self.paddr_delta)
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
    pub(crate) fn dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    #[inline]
    fn global(&self) -> bool {
        self.flags & FLAG_GLOBAL != 0
    }

    #[inline]
    fn valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    #[inline]
    fn covers(&self, vaddr: u32) -> bool {
        self.valid() && vaddr & !(self.page_size.bytes() - 1) == self.vbase
    }
}

const WAYS: usize = 4;
const SETS: usize = 64;

#[inline]
fn set_index(tag: u32) -> usize {
    (tag as usize) & (SETS - 1)
}

/// One bank (instruction or data) of a 4-way set associative TLB.
#[derive(Debug, Clone)]
struct TlbBank {
    entries: [[TlbEntry; WAYS]; SETS],
    next_way: [u8; SETS],
    /// Valid 4 MiB entries currently resident. While zero, lookups skip the
    /// large-page probe.
    count_4m: u16,
}

impl TlbBank {
    fn new() -> Self {
        Self {
            entries: [[TlbEntry::default(); WAYS]; SETS],
            next_way: [0; SETS],
            count_4m: 0,
        }
    }

    fn lookup(&self, vaddr: u32) -> Option<TlbHit> {
        let set = set_index(vaddr >> 12);
        for way in 0..WAYS {
            let entry = &self.entries[set][way];
            if entry.page_size == PageSize::Size4K && entry.covers(vaddr) {
                return Some(TlbHit {
                    entry: *entry,
                    set: set as u8,
                    way: way as u8,
                });
            }
        }

        if self.count_4m == 0 {
            return None;
        }
        let set = set_index(vaddr >> 22);
        for way in 0..WAYS {
            let entry = &self.entries[set][way];
            if entry.page_size == PageSize::Size4M && entry.covers(vaddr) {
                return Some(TlbHit {
                    entry: *entry,
                    set: set as u8,
                    way: way as u8,
                });
            }
        }
        None
    }

    fn insert(&mut self, entry: TlbEntry) {
        let tag = match entry.page_size {
            PageSize::Size4K => entry.vbase >> 12,
            PageSize::Size4M => entry.vbase >> 22,
        };
        let set = set_index(tag);

        // Replace an existing mapping for the same page first so a stale copy
        // can never shadow the new one.
        let mut way = None;
        for w in 0..WAYS {
            let cur = &self.entries[set][w];
            if cur.valid() && cur.vbase == entry.vbase && cur.page_size == entry.page_size {
                way = Some(w);
                break;
            }
        }
        let way = way.unwrap_or_else(|| {
            let w = self.next_way[set] as usize;
            self.next_way[set] = ((w + 1) % WAYS) as u8;
            w
        });

        self.evict_slot(set, way);
        if entry.page_size == PageSize::Size4M {
            self.count_4m += 1;
        }
        self.entries[set][way] = entry;
    }

    fn evict_slot(&mut self, set: usize, way: usize) {
        let old = &mut self.entries[set][way];
        if old.valid() && old.page_size == PageSize::Size4M {
            self.count_4m -= 1;
        }
        old.flags &= !FLAG_VALID;
    }

    fn invalidate_address(&mut self, vaddr: u32) {
        for set in 0..SETS {
            for way in 0..WAYS {
                if self.entries[set][way].covers(vaddr) {
                    self.evict_slot(set, way);
                }
            }
        }
    }

    fn flush(&mut self, keep_global: bool) {
        for set in 0..SETS {
            for way in 0..WAYS {
                let entry = self.entries[set][way];
                if entry.valid() && !(keep_global && entry.global()) {
                    self.evict_slot(set, way);
                }
            }
        }
    }
}

/// Split instruction/data software TLB.
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
    pub(crate) fn lookup(&self, vaddr: u32, is_exec: bool) -> Option<TlbHit> {
        self.bank(is_exec).lookup(vaddr)
    }

    pub(crate) fn insert(&mut self, is_exec: bool, entry: TlbEntry) {
        if is_exec {
            self.itlb.insert(entry);
        } else {
            self.dtlb.insert(entry);
        }
    }

    pub(crate) fn set_dirty_slot(&mut self, hit: &TlbHit) {
        self.dtlb.entries[hit.set as usize][hit.way as usize].flags |= FLAG_DIRTY;
    }

    pub(crate) fn invalidate_address(&mut self, vaddr: u32) {
        self.itlb.invalidate_address(vaddr);
        self.dtlb.invalidate_address(vaddr);
    }

    pub(crate) fn flush_all(&mut self) {
        self.itlb.flush(false);
        self.dtlb.flush(false);
    }

    pub(crate) fn flush_non_global(&mut self) {
        self.itlb.flush(true);
        self.dtlb.flush(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> TlbEntryAttributes {
        TlbEntryAttributes {
            user: true,
            writable: true,
            global: false,
            leaf_addr: 0,
            dirty: false,
        }
    }

    #[test]
    fn large_page_lookup_is_skipped_until_one_is_inserted() {
        let mut bank = TlbBank::new();
        assert!(bank.lookup(0x0040_1234).is_none());
        bank.insert(TlbEntry::new(0x0040_0000, 0x0080_0000, PageSize::Size4M, attrs()));
        assert_eq!(bank.count_4m, 1);
        let hit = bank.lookup(0x0040_1234).expect("4M entry should hit");
        assert_eq!(hit.entry.translate(0x0040_1234), 0x0080_1234);

        bank.invalidate_address(0x007f_ffff);
        assert_eq!(bank.count_4m, 0);
        assert!(bank.lookup(0x0040_1234).is_none());
    }

    #[test]
    fn reinsert_same_page_replaces_in_place() {
        let mut bank = TlbBank::new();
        bank.insert(TlbEntry::new(0x1000, 0x5000, PageSize::Size4K, attrs()));
        bank.insert(TlbEntry::new(0x1000, 0x9000, PageSize::Size4K, attrs()));
        let hit = bank.lookup(0x1004).unwrap();
        assert_eq!(hit.entry.translate(0x1004), 0x9004);
        let valid = bank.entries[1].iter().filter(|e| e.valid()).count();
        assert_eq!(valid, 1);
    }

    #[test]
    fn flush_non_global_keeps_global_entries() {
        let mut tlb = Tlb::new();
        let mut global = attrs();
        global.global = true;
        tlb.insert(false, TlbEntry::new(0x1000, 0x1000, PageSize::Size4K, global));
        tlb.insert(false, TlbEntry::new(0x2000, 0x2000, PageSize::Size4K, attrs()));
        tlb.flush_non_global();
        assert!(tlb.lookup(0x1000, false).is_some());
        assert!(tlb.lookup(0x2000, false).is_none());
        tlb.flush_all();
        assert!(tlb.lookup(0x1000, false).is_none());
    }
}
