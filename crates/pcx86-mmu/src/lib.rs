//! x86 MMU for 386/486/Pentium-class guests: linear → physical translation
//! with a software TLB.
//!
//! Supported paging modes:
//! - No paging (identity mapping, 32-bit linear space)
//! - 32-bit paging (4KB pages, and 4MB pages when CR4.PSE is set)

mod tlb;

use tlb::{PageSize, Tlb, TlbEntry, TlbEntryAttributes};
use tracing::trace;

#[cfg(test)]
mod tests;

/// Physical memory access used for page-table walking and guest data access.
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

/// Flat RAM backing store. Reads beyond the end return open-bus `0xFF`,
/// writes beyond the end are dropped.
#[derive(Debug, Clone)]
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn load(&mut self, paddr: u64, bytes: &[u8]) {
        self.write_bytes(paddr, bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn read_le<const N: usize>(&self, paddr: u64) -> [u8; N] {
        let mut buf = [0xFFu8; N];
        let start = paddr as usize;
        if let Some(src) = start
            .checked_add(N)
            .and_then(|end| self.data.get(start..end))
        {
            buf.copy_from_slice(src);
        } else {
            for (i, slot) in buf.iter_mut().enumerate() {
                if let Some(b) = self.data.get(start.wrapping_add(i)) {
                    *slot = *b;
                }
            }
        }
        buf
    }

    #[inline]
    fn write_le(&mut self, paddr: u64, bytes: &[u8]) {
        let start = paddr as usize;
        if let Some(dst) = start
            .checked_add(bytes.len())
            .and_then(|end| self.data.get_mut(start..end))
        {
            dst.copy_from_slice(bytes);
        } else {
            for (i, b) in bytes.iter().enumerate() {
                if let Some(slot) = self.data.get_mut(start.wrapping_add(i)) {
                    *slot = *b;
                }
            }
        }
    }
}

impl MemoryBus for Ram {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.read_le::<1>(paddr)[0]
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        u16::from_le_bytes(self.read_le(paddr))
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        u32::from_le_bytes(self.read_le(paddr))
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        u64::from_le_bytes(self.read_le(paddr))
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.write_le(paddr, &[value]);
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_le(paddr, &value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_le(paddr, &value.to_le_bytes());
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_le(paddr, &value.to_le_bytes());
    }

    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_le::<1>(paddr.wrapping_add(i as u64))[0];
        }
    }

    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        self.write_le(paddr, src);
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

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u32,
    /// Error code as per Intel SDM.
    pub error_code: u32,
}

impl PageFault {
    #[inline]
    fn new(addr: u32, error_code: u32) -> Self {
        Self { addr, error_code }
    }
}

/// TLB/page-walk counters, populated when the `stats` feature is enabled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub page_walks: u64,
    pub tlb_flushes: u64,
    pub invlpg: u64,
}

/// x86 MMU with a software TLB.
#[derive(Debug, Clone)]
pub struct Mmu {
    cr0: u32,
    cr2: u32,
    cr3: u32,
    cr4: u32,
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
        Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            tlb: Tlb::new(),
            stats: MmuStats::default(),
        }
    }

    /// Returns current MMU/TLB statistics when the `stats` feature is enabled.
    #[inline]
    pub fn stats(&self) -> Option<MmuStats> {
        if cfg!(feature = "stats") {
            Some(self.stats)
        } else {
            None
        }
    }

    #[inline]
    fn count(&mut self, f: impl FnOnce(&mut MmuStats)) {
        if cfg!(feature = "stats") {
            f(&mut self.stats);
        }
    }

    /// CR2 as last written by a failed translation.
    #[inline]
    pub fn cr2(&self) -> u32 {
        self.cr2
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
        self.cr0 & CR0_PG != 0
    }

    pub fn set_cr0(&mut self, value: u32) {
        let old = self.cr0 & (CR0_PG | CR0_WP);
        self.cr0 = value;
        if old != value & (CR0_PG | CR0_WP) {
            self.flush_all();
        }
    }

    pub fn set_cr3(&mut self, value: u32) {
        self.cr3 = value;
        self.count(|s| s.tlb_flushes += 1);
        if self.cr4 & CR4_PGE != 0 {
            self.tlb.flush_non_global();
        } else {
            self.tlb.flush_all();
        }
    }

    pub fn set_cr4(&mut self, value: u32) {
        let old_relevant = self.cr4 & (CR4_PSE | CR4_PGE);
        self.cr4 = value;
        if old_relevant != value & (CR4_PSE | CR4_PGE) {
            self.flush_all();
        }
    }

    /// Flush every TLB entry, including global ones.
    pub fn flush_all(&mut self) {
        self.count(|s| s.tlb_flushes += 1);
        self.tlb.flush_all();
    }

    /// INVLPG.
    pub fn invlpg(&mut self, vaddr: u32) {
        self.count(|s| s.invlpg += 1);
        self.tlb.invalidate_address(vaddr);
    }

    /// Translate a linear address to a physical address.
    ///
    /// `cpl` is the current privilege level (0..=3). Only CPL==3 is treated as
    /// "user"; all others are "supervisor".
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        cpl: u8,
    ) -> Result<u32, PageFault> {
        if !self.paging_enabled() {
            return Ok(vaddr);
        }
        let is_user = cpl == 3;
        let is_exec = access.is_execute();

        if let Some(hit) = self.tlb.lookup(vaddr, is_exec) {
            self.count(|s| s.tlb_hits += 1);
            let entry = hit.entry;
            if let Err(pf) =
                self.check_perms(vaddr, entry.user(), entry.writable(), access, is_user)
            {
                self.cr2 = pf.addr;
                return Err(pf);
            }

            // Lazily set D on the first write hit.
            if access.is_write() && !entry.dirty() {
                let val = bus.read_u32(entry.leaf_addr);
                bus.write_u32(entry.leaf_addr, val | PTE_D);
                self.tlb.set_dirty_slot(&hit);
            }
            return Ok(entry.translate(vaddr));
        }

        self.count(|s| {
            s.tlb_misses += 1;
            s.page_walks += 1;
        });

        match self.walk_legacy32(bus, vaddr, access, is_user) {
            Ok((entry, paddr)) => {
                self.tlb.insert(is_exec, entry);
                Ok(paddr)
            }
            Err(pf) => {
                trace!(addr = pf.addr, error_code = pf.error_code, "page walk fault");
                self.cr2 = pf.addr;
                Err(pf)
            }
        }
    }

    /// Translate a linear address without guest-visible side effects: no
    /// accessed/dirty updates, no TLB fill and no CR2 update.
    pub fn translate_probe(
        &self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        cpl: u8,
    ) -> Result<u32, PageFault> {
        if !self.paging_enabled() {
            return Ok(vaddr);
        }
        let is_user = cpl == 3;

        let pde_addr = self.pde_addr(vaddr);
        let pde = bus.read_u32(pde_addr);
        if pde & PTE_P == 0 {
            return Err(self.page_fault_not_present(vaddr, access, is_user));
        }
        if pde & PTE_PS != 0 && self.cr4 & CR4_PSE != 0 {
            if pde & LEGACY32_4MB_RESERVED_MASK != 0 {
                return Err(self.page_fault_rsvd(vaddr, access, is_user));
            }
            self.check_perms(vaddr, pde & PTE_US != 0, pde & PTE_RW != 0, access, is_user)?;
            return Ok((pde & 0xffc0_0000) | (vaddr & 0x003f_ffff));
        }

        let pte_addr = u64::from(pde & 0xffff_f000) + u64::from((vaddr >> 12) & 0x3ff) * 4;
        let pte = bus.read_u32(pte_addr);
        if pte & PTE_P == 0 {
            return Err(self.page_fault_not_present(vaddr, access, is_user));
        }
        let user_ok = pde & PTE_US != 0 && pte & PTE_US != 0;
        let writable_ok = pde & PTE_RW != 0 && pte & PTE_RW != 0;
        self.check_perms(vaddr, user_ok, writable_ok, access, is_user)?;
        Ok((pte & 0xffff_f000) | (vaddr & 0xfff))
    }

    #[inline]
    fn pde_addr(&self, vaddr: u32) -> u64 {
        u64::from(self.cr3 & 0xffff_f000) + u64::from(vaddr >> 22) * 4
    }

    #[inline]
    fn check_perms(
        &self,
        vaddr: u32,
        user_ok: bool,
        writable_ok: bool,
        access: AccessType,
        is_user: bool,
    ) -> Result<(), PageFault> {
        if is_user && !user_ok {
            return Err(PageFault::new(
                vaddr,
                pf_error_code(true, access, is_user, false),
            ));
        }

        // Supervisor writes to read-only pages only fault with CR0.WP (486+).
        if access.is_write() && !writable_ok && (is_user || self.cr0 & CR0_WP != 0) {
            return Err(PageFault::new(
                vaddr,
                pf_error_code(true, access, is_user, false),
            ));
        }

        Ok(())
    }

    fn walk_legacy32(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        is_user: bool,
    ) -> Result<(TlbEntry, u32), PageFault> {
        let pde_addr = self.pde_addr(vaddr);
        let pde_raw = bus.read_u32(pde_addr);
        if pde_raw & PTE_P == 0 {
            return Err(self.page_fault_not_present(vaddr, access, is_user));
        }

        // Without CR4.PSE the PS bit is ignored and the PDE points at a table.
        let pde_ps = pde_raw & PTE_PS != 0 && self.cr4 & CR4_PSE != 0;
        if pde_ps && pde_raw & LEGACY32_4MB_RESERVED_MASK != 0 {
            return Err(self.page_fault_rsvd(vaddr, access, is_user));
        }

        let pde = mark_accessed(bus, pde_addr, pde_raw);

        if pde_ps {
            let user_ok = pde & PTE_US != 0;
            let writable_ok = pde & PTE_RW != 0;
            self.check_perms(vaddr, user_ok, writable_ok, access, is_user)?;

            // Dirty only on successful write.
            let mut new_pde = pde;
            if access.is_write() {
                new_pde |= PTE_D;
            }
            if new_pde != pde {
                bus.write_u32(pde_addr, new_pde);
            }

            let page_size = PageSize::Size4M;
            let vbase = vaddr & !(page_size.bytes() - 1);
            let pbase = pde & 0xffc0_0000;
            let entry = TlbEntry::new(
                vbase,
                pbase,
                page_size,
                TlbEntryAttributes {
                    user: user_ok,
                    writable: writable_ok,
                    global: self.cr4 & CR4_PGE != 0 && pde & PTE_G != 0,
                    leaf_addr: pde_addr,
                    dirty: new_pde & PTE_D != 0,
                },
            );
            return Ok((entry, pbase + (vaddr - vbase)));
        }

        // 4KB pages via PT.
        let pte_addr = u64::from(pde & 0xffff_f000) + u64::from((vaddr >> 12) & 0x3ff) * 4;
        let pte_raw = bus.read_u32(pte_addr);
        if pte_raw & PTE_P == 0 {
            return Err(self.page_fault_not_present(vaddr, access, is_user));
        }
        let pte = mark_accessed(bus, pte_addr, pte_raw);

        let user_ok = pde & PTE_US != 0 && pte & PTE_US != 0;
        let writable_ok = pde & PTE_RW != 0 && pte & PTE_RW != 0;
        self.check_perms(vaddr, user_ok, writable_ok, access, is_user)?;

        let mut new_pte = pte;
        if access.is_write() {
            new_pte |= PTE_D;
        }
        if new_pte != pte {
            bus.write_u32(pte_addr, new_pte);
        }

        let page_size = PageSize::Size4K;
        let vbase = vaddr & !(page_size.bytes() - 1);
        let pbase = pte & 0xffff_f000;
        let entry = TlbEntry::new(
            vbase,
            pbase,
            page_size,
            TlbEntryAttributes {
                user: user_ok,
                writable: writable_ok,
                global: self.cr4 & CR4_PGE != 0 && pte & PTE_G != 0,
                leaf_addr: pte_addr,
                dirty: new_pte & PTE_D != 0,
            },
        );
        Ok((entry, pbase + (vaddr - vbase)))
    }

    fn page_fault_not_present(&self, vaddr: u32, access: AccessType, is_user: bool) -> PageFault {
        PageFault::new(vaddr, pf_error_code(false, access, is_user, false))
    }

    fn page_fault_rsvd(&self, vaddr: u32, access: AccessType, is_user: bool) -> PageFault {
        PageFault::new(vaddr, pf_error_code(true, access, is_user, true))
    }
}

#[inline]
fn mark_accessed(bus: &mut impl MemoryBus, entry_addr: u64, entry: u32) -> u32 {
    if entry & PTE_A == 0 {
        let entry = entry | PTE_A;
        bus.write_u32(entry_addr, entry);
        entry
    } else {
        entry
    }
}

fn pf_error_code(present: bool, access: AccessType, is_user: bool, rsvd: bool) -> u32 {
    let mut code = 0u32;
    if present {
        code |= 1 << 0;
    }
    if access.is_write() {
        code |= 1 << 1;
    }
    if is_user {
        code |= 1 << 2;
    }
    if rsvd {
        code |= 1 << 3;
    }
    code
}

const CR0_WP: u32 = 1 << 16;
const CR0_PG: u32 = 1 << 31;

const CR4_PSE: u32 = 1 << 4;
const CR4_PGE: u32 = 1 << 7;

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_A: u32 = 1 << 5;
const PTE_D: u32 = 1 << 6;
const PTE_PS: u32 = 1 << 7;
const PTE_G: u32 = 1 << 8;

const LEGACY32_4MB_RESERVED_MASK: u32 = 0x003f_e000;
