use super::*;

use proptest::prelude::*;

#[derive(Clone)]
struct TestMemory {
    ram: Ram,
    writes: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            ram: Ram::new(size),
            writes: 0,
        }
    }

    fn write_u32_raw(&mut self, paddr: u64, value: u32) {
        self.ram.write_u32(paddr, value);
    }

    fn read_u32_raw(&mut self, paddr: u64) -> u32 {
        self.ram.read_u32(paddr)
    }
}

impl MemoryBus for TestMemory {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.ram.read_u8(paddr)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        self.ram.read_u16(paddr)
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.ram.read_u32(paddr)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        self.ram.read_u64(paddr)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.writes += 1;
        self.ram.write_u8(paddr, value)
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.writes += 1;
        self.ram.write_u16(paddr, value)
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.writes += 1;
        self.ram.write_u32(paddr, value)
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.writes += 1;
        self.ram.write_u64(paddr, value)
    }
}

const PD: u64 = 0x1000;
const PT: u64 = 0x2000;

fn paged_mmu(mem: &mut TestMemory) -> Mmu {
    // PDE 0 -> PT at 0x2000 (user, writable).
    mem.write_u32_raw(PD, (PT as u32) | PTE_P | PTE_RW | PTE_US);
    let mut mmu = Mmu::new();
    mmu.set_cr3(PD as u32);
    mmu.set_cr0(CR0_PG);
    mmu
}

#[test]
fn paging_disabled_is_identity() {
    let mut mem = TestMemory::new(0x1000);
    let mut mmu = Mmu::new();
    assert_eq!(
        mmu.translate(&mut mem, 0xdead_beef, AccessType::Write, 3),
        Ok(0xdead_beef)
    );
}

#[test]
fn walk_sets_accessed_then_dirty_on_write() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem);
    mem.write_u32_raw(PT + 5 * 4, 0x8000 | PTE_P | PTE_RW);

    assert_eq!(
        mmu.translate(&mut mem, 0x5123, AccessType::Read, 0),
        Ok(0x8123)
    );
    let pte = mem.read_u32_raw(PT + 5 * 4);
    assert_ne!(pte & PTE_A, 0);
    assert_eq!(pte & PTE_D, 0);
    assert_ne!(mem.read_u32_raw(PD) & PTE_A, 0);

    // A write hit in the TLB still has to set D lazily.
    assert_eq!(
        mmu.translate(&mut mem, 0x5000, AccessType::Write, 0),
        Ok(0x8000)
    );
    assert_ne!(mem.read_u32_raw(PT + 5 * 4) & PTE_D, 0);
}

#[test]
fn not_present_fault_sets_cr2_and_error_code() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem);

    let err = mmu
        .translate(&mut mem, 0x7004, AccessType::Write, 3)
        .unwrap_err();
    assert_eq!(err.addr, 0x7004);
    // P=0, W=1, U=1.
    assert_eq!(err.error_code, 0b110);
    assert_eq!(mmu.cr2(), 0x7004);
}

#[test]
fn user_cannot_touch_supervisor_page() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem);
    mem.write_u32_raw(PT + 3 * 4, 0x9000 | PTE_P | PTE_RW);

    assert!(mmu.translate(&mut mem, 0x3000, AccessType::Read, 0).is_ok());
    let err = mmu
        .translate(&mut mem, 0x3000, AccessType::Read, 3)
        .unwrap_err();
    assert_eq!(err.error_code, 0b101);
}

#[test]
fn supervisor_write_to_readonly_page_obeys_wp() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem);
    mem.write_u32_raw(PT + 4 * 4, 0xa000 | PTE_P | PTE_US);

    assert!(mmu.translate(&mut mem, 0x4000, AccessType::Write, 0).is_ok());

    mmu.set_cr0(CR0_PG | CR0_WP);
    let err = mmu
        .translate(&mut mem, 0x4000, AccessType::Write, 0)
        .unwrap_err();
    assert_eq!(err.error_code, 0b011);
}

#[test]
fn pse_large_page_requires_cr4_pse() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = Mmu::new();
    // PDE 1 maps 4MB page at 0x00c0_0000.
    mem.write_u32_raw(PD + 4, 0x00c0_0000 | PTE_P | PTE_RW | PTE_PS);
    mmu.set_cr3(PD as u32);
    mmu.set_cr4(CR4_PSE);
    mmu.set_cr0(CR0_PG);

    assert_eq!(
        mmu.translate(&mut mem, 0x0041_2345, AccessType::Read, 0),
        Ok(0x00c1_2345)
    );
}

#[test]
fn invlpg_drops_stale_translation() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem);
    mem.write_u32_raw(PT + 6 * 4, 0x8000 | PTE_P | PTE_RW);
    assert_eq!(mmu.translate(&mut mem, 0x6000, AccessType::Read, 0), Ok(0x8000));

    mem.write_u32_raw(PT + 6 * 4, 0x9000 | PTE_P | PTE_RW);
    assert_eq!(mmu.translate(&mut mem, 0x6000, AccessType::Read, 0), Ok(0x8000));

    mmu.invlpg(0x6000);
    assert_eq!(mmu.translate(&mut mem, 0x6000, AccessType::Read, 0), Ok(0x9000));
}

#[test]
fn probe_has_no_side_effects() {
    let mut mem = TestMemory::new(0x10000);
    let mmu = paged_mmu(&mut mem);
    mem.write_u32_raw(PT + 2 * 4, 0x8000 | PTE_P | PTE_RW);
    mem.writes = 0;

    assert_eq!(
        mmu.translate_probe(&mut mem, 0x2010, AccessType::Write, 0),
        Ok(0x8010)
    );
    assert_eq!(mem.writes, 0);
    assert_eq!(mem.read_u32_raw(PT + 2 * 4) & (PTE_A | PTE_D), 0);
}

#[test]
fn ram_reads_past_end_are_open_bus() {
    let mut ram = Ram::new(4);
    ram.write_u32(0, 0x4433_2211);
    assert_eq!(ram.read_u32(2), 0xffff_4433);
    ram.write_u16(3, 0xaabb);
    assert_eq!(ram.read_u8(3), 0xbb);
}

proptest! {
    #[test]
    fn probe_agrees_with_translate(
        page in 0u32..1024,
        offset in 0u32..4096,
        user in any::<bool>()
    ) {
        let mut mem = TestMemory::new(0x10000);
        let mut mmu = paged_mmu(&mut mem);
        let flags = if page % 3 == 0 { PTE_P | PTE_RW | PTE_US } else { PTE_P };
        mem.write_u32_raw(PT + u64::from(page) * 4, ((page % 8) << 12) | flags);

        let vaddr = (page << 12) | offset;
        let cpl = if user { 3 } else { 0 };
        let probed = mmu.translate_probe(&mut mem, vaddr, AccessType::Read, cpl);
        let walked = mmu.translate(&mut mem, vaddr, AccessType::Read, cpl);
        prop_assert_eq!(probed, walked);
    }
}
