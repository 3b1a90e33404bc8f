use pcx86_mmu::{AccessType, MemoryBus, Mmu, PageFault};

use crate::code_pages::CodePageTracker;
use crate::exceptions::Fault;
use crate::mem::{CpuBus, IoBus, NoIo};
use crate::types::Width;

/// A paging-aware [`CpuBus`] backed by [`pcx86_mmu::Mmu`] and a physical
/// [`MemoryBus`].
///
/// The CPU hands this adapter *linear* addresses; it translates them through
/// the MMU (when CR0.PG is set) before touching physical memory. Port I/O is
/// forwarded to `IO`.
pub struct PagingBus<B, IO = NoIo> {
    mmu: Mmu,
    phys: B,
    io: IO,
    code_pages: CodePageTracker,
    a20_mask: u32,
}

impl<B> PagingBus<B, NoIo> {
    pub fn new(phys: B) -> PagingBus<B, NoIo> {
        PagingBus::new_with_io(phys, NoIo)
    }
}

impl<B, IO> PagingBus<B, IO> {
    pub fn new_with_io(phys: B, io: IO) -> PagingBus<B, IO> {
        Self {
            mmu: Mmu::new(),
            phys,
            io,
            code_pages: CodePageTracker::new(),
            a20_mask: u32::MAX,
        }
    }

    #[inline]
    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    #[inline]
    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    #[inline]
    pub fn into_inner(self) -> B {
        self.phys
    }

    #[inline]
    pub fn inner(&self) -> &B {
        &self.phys
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.phys
    }

    #[inline]
    pub fn io(&self) -> &IO {
        &self.io
    }

    #[inline]
    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    /// Gate address line 20 (keyboard controller / port 92h on a PC).
    ///
    /// Every physical address this bus hands out is masked, so a toggle
    /// moves code under existing translations: all tracked code pages get
    /// new versions. The vCPU's fetch cache must be dropped as well
    /// ([`crate::Vcpu::sync_control`]).
    pub fn set_a20(&mut self, enabled: bool) {
        let mask = if enabled { u32::MAX } else { !(1 << 20) };
        if mask != self.a20_mask {
            self.a20_mask = mask;
            self.code_pages.bump_all();
        }
    }

    #[inline]
    pub fn a20_enabled(&self) -> bool {
        self.a20_mask == u32::MAX
    }

    #[inline]
    fn a20(&self, paddr: u32) -> u64 {
        u64::from(paddr & self.a20_mask)
    }
}

/// Physical memory as the page walker sees it: behind the A20 gate, with
/// accessed/dirty updates reported to the code-page tracker like any other
/// store.
struct WalkBus<'a, B> {
    phys: &'a mut B,
    code_pages: &'a mut CodePageTracker,
    a20_mask: u64,
}

impl<B: MemoryBus> WalkBus<'_, B> {
    #[inline]
    fn mask(&self, paddr: u64) -> u64 {
        paddr & self.a20_mask
    }

    #[inline]
    fn note(&mut self, paddr: u64, len: usize) {
        self.code_pages.on_write(paddr as u32, len);
    }
}

impl<B: MemoryBus> MemoryBus for WalkBus<'_, B> {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        let a = self.mask(paddr);
        self.phys.read_u8(a)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        let a = self.mask(paddr);
        self.phys.read_u16(a)
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        let a = self.mask(paddr);
        self.phys.read_u32(a)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let a = self.mask(paddr);
        self.phys.read_u64(a)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        let a = self.mask(paddr);
        self.note(a, 1);
        self.phys.write_u8(a, value);
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        let a = self.mask(paddr);
        self.note(a, 2);
        self.phys.write_u16(a, value);
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        let a = self.mask(paddr);
        self.note(a, 4);
        self.phys.write_u32(a, value);
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        let a = self.mask(paddr);
        self.note(a, 8);
        self.phys.write_u64(a, value);
    }
}

fn page_fault(pf: PageFault) -> Fault {
    Fault::page_fault(pf.addr, pf.error_code)
}

impl<B: MemoryBus, IO: IoBus> CpuBus for PagingBus<B, IO> {
    fn translate(&mut self, linear: u32, access: AccessType, cpl: u8) -> Result<u32, Fault> {
        let mask = self.a20_mask;
        let mut walk = WalkBus {
            phys: &mut self.phys,
            code_pages: &mut self.code_pages,
            a20_mask: u64::from(mask),
        };
        self.mmu
            .translate(&mut walk, linear, access, cpl)
            .map(|paddr| paddr & mask)
            .map_err(page_fault)
    }

    fn probe(&mut self, linear: u32, access: AccessType, cpl: u8) -> Option<u32> {
        let mask = self.a20_mask;
        let mut walk = WalkBus {
            phys: &mut self.phys,
            code_pages: &mut self.code_pages,
            a20_mask: u64::from(mask),
        };
        self.mmu
            .translate_probe(&mut walk, linear, access, cpl)
            .ok()
            .map(|paddr| paddr & mask)
    }

    fn read_phys(&mut self, paddr: u32, buf: &mut [u8]) {
        match buf.len() {
            1 => buf[0] = self.phys.read_u8(self.a20(paddr)),
            2 => buf.copy_from_slice(&self.phys.read_u16(self.a20(paddr)).to_le_bytes()),
            4 => buf.copy_from_slice(&self.phys.read_u32(self.a20(paddr)).to_le_bytes()),
            _ => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self.phys.read_u8(self.a20(paddr.wrapping_add(i as u32)));
                }
            }
        }
    }

    fn write_phys_raw(&mut self, paddr: u32, data: &[u8]) {
        match *data {
            [b] => self.phys.write_u8(self.a20(paddr), b),
            [a, b] => self.phys.write_u16(self.a20(paddr), u16::from_le_bytes([a, b])),
            [a, b, c, d] => self
                .phys
                .write_u32(self.a20(paddr), u32::from_le_bytes([a, b, c, d])),
            _ => {
                for (i, &b) in data.iter().enumerate() {
                    self.phys.write_u8(self.a20(paddr.wrapping_add(i as u32)), b);
                }
            }
        }
    }

    #[inline]
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        self.io.io_read(port, width)
    }

    #[inline]
    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        self.io.io_write(port, width, value)
    }

    #[inline]
    fn code_pages(&mut self) -> &mut CodePageTracker {
        &mut self.code_pages
    }

    fn sync_control(&mut self, cr0: u32, cr3: u32, cr4: u32) {
        self.mmu.set_cr4(cr4);
        if self.mmu.cr3() != cr3 {
            self.mmu.set_cr3(cr3);
        }
        self.mmu.set_cr0(cr0);
    }

    #[inline]
    fn invlpg(&mut self, linear: u32) {
        self.mmu.invlpg(linear);
    }

    #[inline]
    fn flush_tlb(&mut self) {
        self.mmu.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcx86_mmu::Ram;

    const PG: u32 = 1 << 31;
    const PE: u32 = 1;

    fn paged_bus() -> PagingBus<Ram> {
        let mut ram = Ram::new(0x40_0000);
        // PD at 0x1000, PT at 0x2000. Linear 0x0040_0000.. unmapped; linear
        // 0x0000_5000 -> physical 0x0000_9000 (user, read-only).
        ram.write_u32(0x1000, 0x2000 | 0b111);
        ram.write_u32(0x2000 + 5 * 4, 0x9000 | 0b101);
        let mut bus = PagingBus::new(ram);
        bus.sync_control(PE | PG, 0x1000, 0);
        bus
    }

    #[test]
    fn translated_write_lands_in_mapped_frame() {
        let mut bus = paged_bus();
        let paddr = bus.translate(0x5010, AccessType::Read, 0).unwrap();
        assert_eq!(paddr, 0x9010);
        bus.write_phys(paddr, &0xdead_beefu32.to_le_bytes());
        assert_eq!(bus.inner_mut().read_u32(0x9010), 0xdead_beef);
    }

    #[test]
    fn user_write_to_read_only_page_faults() {
        let mut bus = paged_bus();
        let fault = bus.translate(0x5000, AccessType::Write, 3).unwrap_err();
        assert_eq!(fault, Fault::page_fault(0x5000, 0b111));
        assert_eq!(bus.probe(0x40_0000, AccessType::Read, 0), None);
    }

    #[test]
    fn translations_come_back_behind_the_a20_gate() {
        let mut bus = PagingBus::new(Ram::new(0x20_0000));
        assert_eq!(bus.translate(0x10_1003, AccessType::Write, 0).unwrap(), 0x10_1003);
        bus.set_a20(false);
        assert!(!bus.a20_enabled());
        assert_eq!(bus.translate(0x10_1003, AccessType::Write, 0).unwrap(), 0x1003);
        assert_eq!(bus.probe(0x10_1003, AccessType::Execute, 0), Some(0x1003));
    }

    #[test]
    fn toggling_a20_retires_code_pages() {
        let mut bus = PagingBus::new(Ram::new(0x20_0000));
        let before = bus.code_pages().watch(1);
        bus.code_pages().add_block(1);
        bus.set_a20(false);
        assert_ne!(bus.code_pages().version(1), before);
        assert_eq!(bus.code_pages().take_dirty(), vec![1]);
        // Setting the same state again changes nothing.
        let now = bus.code_pages().version(1);
        bus.set_a20(false);
        assert_eq!(bus.code_pages().version(1), now);
    }

    #[test]
    fn accessed_and_dirty_updates_count_as_code_writes() {
        let mut bus = paged_bus();
        // Code translated out of the page-table page itself.
        bus.code_pages().add_block(2);
        bus.translate(0x5010, AccessType::Read, 0).unwrap();
        assert_eq!(bus.code_pages().take_dirty(), vec![2]);
        assert_ne!(bus.inner_mut().read_u32(0x2000 + 5 * 4) & (1 << 5), 0);
    }

    #[test]
    fn a20_gate_wraps_at_one_megabyte() {
        let mut bus = PagingBus::new(Ram::new(0x20_0000));
        bus.set_a20(false);
        bus.write_phys(0x10_0010, &[0x5a]);
        let mut b = [0u8];
        bus.read_phys(0x10, &mut b);
        assert_eq!(b[0], 0x5a);
    }
}
