//! The bus interfaces the CPU core consumes.
//!
//! [`CpuBus`] deals in *linear* and *physical* addresses only; segmentation is
//! applied by the CPU before anything reaches the bus. Physical writes funnel
//! through [`CpuBus::write_phys`], which reports them to the code-page tracker
//! so self-modifying code invalidates stale translations.

use std::collections::HashMap;

pub use pcx86_mmu::AccessType;

use crate::code_pages::CodePageTracker;
use crate::exceptions::Fault;
use crate::types::Width;

/// Port I/O backend.
pub trait IoBus {
    fn io_read(&mut self, port: u16, width: Width) -> u32;
    fn io_write(&mut self, port: u16, width: Width, value: u32);
}

impl<T: IoBus + ?Sized> IoBus for &mut T {
    #[inline]
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        <T as IoBus>::io_read(&mut **self, port, width)
    }

    #[inline]
    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        <T as IoBus>::io_write(&mut **self, port, width, value)
    }
}

impl<T: IoBus + ?Sized> IoBus for Box<T> {
    #[inline]
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        <T as IoBus>::io_read(&mut **self, port, width)
    }

    #[inline]
    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        <T as IoBus>::io_write(&mut **self, port, width, value)
    }
}

/// Floating bus: reads return all ones and writes are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIo;

impl IoBus for NoIo {
    #[inline]
    fn io_read(&mut self, _port: u16, width: Width) -> u32 {
        width.mask()
    }

    #[inline]
    fn io_write(&mut self, _port: u16, _width: Width, _value: u32) {}
}

/// Memory, I/O and address translation as seen by the CPU.
pub trait CpuBus {
    /// Translate a linear address, with paging side effects (TLB fill,
    /// accessed/dirty bits). Failures carry the #PF error code and CR2 value.
    fn translate(&mut self, linear: u32, access: AccessType, cpl: u8) -> Result<u32, Fault>;

    /// Translate without guest-visible side effects.
    fn probe(&mut self, linear: u32, access: AccessType, cpl: u8) -> Option<u32>;

    fn read_phys(&mut self, paddr: u32, buf: &mut [u8]);

    /// Store bytes without notifying the code-page tracker. Only
    /// [`CpuBus::write_phys`] should call this.
    fn write_phys_raw(&mut self, paddr: u32, data: &[u8]);

    fn io_read(&mut self, port: u16, width: Width) -> u32;
    fn io_write(&mut self, port: u16, width: Width, value: u32);

    fn code_pages(&mut self) -> &mut CodePageTracker;

    /// Control registers changed (CR0/CR3/CR4 writes, task switch, reset).
    fn sync_control(&mut self, _cr0: u32, _cr3: u32, _cr4: u32) {}

    fn invlpg(&mut self, _linear: u32) {}

    fn flush_tlb(&mut self) {}

    #[inline]
    fn write_phys(&mut self, paddr: u32, data: &[u8]) {
        self.code_pages().on_write(paddr, data.len());
        self.write_phys_raw(paddr, data);
    }
}

impl<T: CpuBus + ?Sized> CpuBus for &mut T {
    #[inline]
    fn translate(&mut self, linear: u32, access: AccessType, cpl: u8) -> Result<u32, Fault> {
        (**self).translate(linear, access, cpl)
    }

    #[inline]
    fn probe(&mut self, linear: u32, access: AccessType, cpl: u8) -> Option<u32> {
        (**self).probe(linear, access, cpl)
    }

    #[inline]
    fn read_phys(&mut self, paddr: u32, buf: &mut [u8]) {
        (**self).read_phys(paddr, buf)
    }

    #[inline]
    fn write_phys_raw(&mut self, paddr: u32, data: &[u8]) {
        (**self).write_phys_raw(paddr, data)
    }

    #[inline]
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        (**self).io_read(port, width)
    }

    #[inline]
    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        (**self).io_write(port, width, value)
    }

    #[inline]
    fn code_pages(&mut self) -> &mut CodePageTracker {
        (**self).code_pages()
    }

    #[inline]
    fn sync_control(&mut self, cr0: u32, cr3: u32, cr4: u32) {
        (**self).sync_control(cr0, cr3, cr4)
    }

    #[inline]
    fn invlpg(&mut self, linear: u32) {
        (**self).invlpg(linear)
    }

    #[inline]
    fn flush_tlb(&mut self) {
        (**self).flush_tlb()
    }

    #[inline]
    fn write_phys(&mut self, paddr: u32, data: &[u8]) {
        (**self).write_phys(paddr, data)
    }
}

/// Flat, unpaged RAM with a scriptable port space. Used by unit tests,
/// benches and simple embeddings.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    code_pages: CodePageTracker,
    /// Values returned by port reads; unknown ports read as all ones.
    pub ports: HashMap<u16, u32>,
    /// Every port write, in order.
    pub io_writes: Vec<(u16, Width, u32)>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            code_pages: CodePageTracker::new(),
            ports: HashMap::new(),
            io_writes: Vec::new(),
        }
    }

    /// Copy bytes into memory without going through the CPU.
    pub fn load(&mut self, paddr: u32, bytes: &[u8]) {
        let start = paddr as usize;
        let end = (start + bytes.len()).min(self.mem.len());
        if start < end {
            self.mem[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }

    #[inline]
    pub fn mem(&self) -> &[u8] {
        &self.mem
    }

    pub fn read_u8(&self, paddr: u32) -> u8 {
        self.mem.get(paddr as usize).copied().unwrap_or(0xff)
    }

    pub fn read_u16(&self, paddr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr.wrapping_add(1))])
    }

    pub fn read_u32(&self, paddr: u32) -> u32 {
        u32::from(self.read_u16(paddr)) | (u32::from(self.read_u16(paddr.wrapping_add(2))) << 16)
    }
}

impl CpuBus for FlatTestBus {
    #[inline]
    fn translate(&mut self, linear: u32, _access: AccessType, _cpl: u8) -> Result<u32, Fault> {
        Ok(linear)
    }

    #[inline]
    fn probe(&mut self, linear: u32, _access: AccessType, _cpl: u8) -> Option<u32> {
        Some(linear)
    }

    fn read_phys(&mut self, paddr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(paddr.wrapping_add(i as u32));
        }
    }

    fn write_phys_raw(&mut self, paddr: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            if let Some(slot) = self.mem.get_mut(paddr.wrapping_add(i as u32) as usize) {
                *slot = b;
            }
        }
    }

    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        self.ports.get(&port).copied().unwrap_or(u32::MAX) & width.mask()
    }

    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        self.io_writes.push((port, width, value & width.mask()));
    }

    #[inline]
    fn code_pages(&mut self) -> &mut CodePageTracker {
        &mut self.code_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_bus_writes_are_tracked() {
        let mut bus = FlatTestBus::new(0x4000);
        bus.code_pages().add_block(1);
        bus.write_phys(0x1004, &[0x90]);
        assert_eq!(bus.read_u8(0x1004), 0x90);
        assert_eq!(bus.code_pages().take_dirty(), vec![1]);
        // Raw writes bypass the tracker.
        bus.write_phys_raw(0x1005, &[0x90]);
        assert!(!bus.code_pages().has_dirty());
    }

    #[test]
    fn flat_bus_open_bus() {
        let mut bus = FlatTestBus::new(16);
        let mut buf = [0u8; 4];
        bus.read_phys(14, &mut buf);
        assert_eq!(buf, [0, 0, 0xff, 0xff]);
        assert_eq!(bus.io_read(0x60, Width::W8), 0xff);
    }
}
