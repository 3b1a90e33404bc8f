//! The memory access chokepoint: segmentation, paging and abort signalling.
//!
//! Two forms exist for guest data accesses:
//!
//! * The full form (`read_*`/`write_*`, [`Vcpu::read_mem`], [`Vcpu::write_mem`])
//!   applies segment limit/rights checks and paging, and on failure latches
//!   the fault into [`CpuState::abort`](crate::state::CpuState::abort) (and CR2
//!   for page faults) before returning it.
//! * The no-abort form ([`Vcpu::read_validated`], [`Vcpu::write_validated`])
//!   cannot fail. It consumes a [`Validated`] access produced earlier by
//!   [`Vcpu::validate`], which performs every check the full form would.

use crate::exceptions::{Exception, Fault};
use crate::mem::{AccessType, CpuBus};
use crate::model::CpuModel;
use crate::types::{SegReg, Width};
use crate::vcpu::Vcpu;

const PAGE_MASK: u32 = 0xfff;

/// A checked and translated access of up to 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validated {
    pub linear: u32,
    pub paddr: u32,
    /// Physical address of the second page for page-crossing accesses.
    pub paddr2: u32,
    /// Bytes that live in the first page.
    pub split: u8,
    pub len: u8,
}

#[inline]
fn seg_fault(seg: SegReg) -> Fault {
    if seg == SegReg::Ss {
        Fault::ss(0)
    } else {
        Fault::gp0()
    }
}

impl<B: CpuBus> Vcpu<B> {
    /// Linear address for `len` bytes at `seg:off`, after segment checks.
    pub fn linear_address(
        &self,
        seg: SegReg,
        off: u32,
        len: u32,
        access: AccessType,
    ) -> Result<u32, Fault> {
        let s = self.state.seg(seg);
        match self.state.model() {
            CpuModel::I8088 => return Ok(s.base.wrapping_add(off & 0xffff) & 0xf_ffff),
            CpuModel::I286 => {
                self.check_segment(seg, off, len, access)?;
                return Ok(s.base.wrapping_add(off) & 0xff_ffff);
            }
            _ => {}
        }
        self.check_segment(seg, off, len, access)?;
        Ok(s.base.wrapping_add(off))
    }

    fn check_segment(
        &self,
        seg: SegReg,
        off: u32,
        len: u32,
        access: AccessType,
    ) -> Result<(), Fault> {
        let s = self.state.seg(seg);
        if self.state.protected_mode() && !self.state.vm86() {
            if !s.checked {
                return Err(seg_fault(seg));
            }
            let ok = match access {
                AccessType::Write => s.writable(),
                AccessType::Read => s.readable(),
                AccessType::Execute => true,
            };
            if !ok {
                return Err(seg_fault(seg));
            }
        }
        let last = u64::from(off) + u64::from(len.max(1)) - 1;
        let in_limit = if s.expand_down() {
            let upper = if s.big() { 0xffff_ffffu64 } else { 0xffff };
            off > s.limit && last <= upper
        } else {
            last <= u64::from(s.limit)
        };
        if in_limit {
            Ok(())
        } else {
            Err(seg_fault(seg))
        }
    }

    /// Record a fault from a full-form access.
    #[inline]
    pub fn latch<T>(&mut self, r: Result<T, Fault>) -> Result<T, Fault> {
        if let Err(fault) = &r {
            if let Some(addr) = fault.cr2 {
                self.state.cr2 = addr;
            }
            self.state.abort = Some(*fault);
        }
        r
    }

    /// Translate a linear range (at most two pages). Both pages are translated
    /// before the caller touches either, so a fault leaves memory untouched.
    fn translate_range(
        &mut self,
        linear: u32,
        len: u32,
        access: AccessType,
        cpl: u8,
    ) -> Result<Validated, Fault> {
        let paddr = self.bus.translate(linear, access, cpl)?;
        let first = (0x1000 - (linear & PAGE_MASK)).min(len);
        let paddr2 = if first < len {
            self.bus
                .translate(linear.wrapping_add(first), access, cpl)?
        } else {
            paddr
        };
        Ok(Validated {
            linear,
            paddr,
            paddr2,
            split: first as u8,
            len: len as u8,
        })
    }

    fn read_translated(&mut self, v: &Validated, buf: &mut [u8]) {
        let split = usize::from(v.split);
        let (a, b) = buf.split_at_mut(split);
        self.bus.read_phys(v.paddr, a);
        if !b.is_empty() {
            self.bus.read_phys(v.paddr2, b);
        }
    }

    fn write_translated(&mut self, v: &Validated, data: &[u8]) {
        let split = usize::from(v.split);
        let (a, b) = data.split_at(split);
        self.bus.write_phys(v.paddr, a);
        if !b.is_empty() {
            self.bus.write_phys(v.paddr2, b);
        }
    }

    /// Read linear memory with the given paging privilege.
    pub fn read_linear(
        &mut self,
        linear: u32,
        buf: &mut [u8],
        access: AccessType,
        cpl: u8,
    ) -> Result<(), Fault> {
        let v = self.translate_range(linear, buf.len() as u32, access, cpl)?;
        self.read_translated(&v, buf);
        Ok(())
    }

    pub fn write_linear(&mut self, linear: u32, data: &[u8], cpl: u8) -> Result<(), Fault> {
        let v = self.translate_range(linear, data.len() as u32, AccessType::Write, cpl)?;
        self.write_translated(&v, data);
        Ok(())
    }

    /// `seg:off` accesses that wrap past offset 0xFFFF on the 8088 are split
    /// into byte accesses that wrap inside the segment.
    #[inline]
    fn wraps_8088(&self, off: u32, len: u32) -> bool {
        self.state.model() == CpuModel::I8088 && (off & 0xffff) + len > 0x1_0000
    }

    fn read_bytes(&mut self, seg: SegReg, off: u32, buf: &mut [u8]) -> Result<(), Fault> {
        let len = buf.len() as u32;
        if self.wraps_8088(off, len) {
            for (i, b) in buf.iter_mut().enumerate() {
                let at = off.wrapping_add(i as u32);
                let lin = self.linear_address(seg, at, 1, AccessType::Read)?;
                let mut one = [0u8];
                self.read_linear(lin, &mut one, AccessType::Read, self.state.cpl)?;
                *b = one[0];
            }
            return Ok(());
        }
        let lin = self.linear_address(seg, off, len, AccessType::Read)?;
        self.read_linear(lin, buf, AccessType::Read, self.state.cpl)
    }

    fn write_bytes(&mut self, seg: SegReg, off: u32, data: &[u8]) -> Result<(), Fault> {
        let len = data.len() as u32;
        if self.wraps_8088(off, len) {
            for (i, &b) in data.iter().enumerate() {
                let lin =
                    self.linear_address(seg, off.wrapping_add(i as u32), 1, AccessType::Write)?;
                self.write_linear(lin, &[b], self.state.cpl)?;
            }
            return Ok(());
        }
        let lin = self.linear_address(seg, off, len, AccessType::Write)?;
        self.write_linear(lin, data, self.state.cpl)
    }

    /// Full-form read of 1, 2 or 4 bytes.
    pub fn read_mem(&mut self, seg: SegReg, off: u32, width: Width) -> Result<u32, Fault> {
        let mut buf = [0u8; 4];
        let n = width.bytes() as usize;
        let r = self.read_bytes(seg, off, &mut buf[..n]);
        self.latch(r)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Full-form write of 1, 2 or 4 bytes.
    pub fn write_mem(
        &mut self,
        seg: SegReg,
        off: u32,
        width: Width,
        value: u32,
    ) -> Result<(), Fault> {
        let n = width.bytes() as usize;
        let r = self.write_bytes(seg, off, &value.to_le_bytes()[..n]);
        self.latch(r)
    }

    #[inline]
    pub fn read_u8(&mut self, seg: SegReg, off: u32) -> Result<u8, Fault> {
        Ok(self.read_mem(seg, off, Width::W8)? as u8)
    }

    #[inline]
    pub fn read_u16(&mut self, seg: SegReg, off: u32) -> Result<u16, Fault> {
        Ok(self.read_mem(seg, off, Width::W16)? as u16)
    }

    #[inline]
    pub fn read_u32(&mut self, seg: SegReg, off: u32) -> Result<u32, Fault> {
        self.read_mem(seg, off, Width::W32)
    }

    pub fn read_u64(&mut self, seg: SegReg, off: u32) -> Result<u64, Fault> {
        let mut buf = [0u8; 8];
        let r = self.read_bytes(seg, off, &mut buf);
        self.latch(r)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// 80-bit read (x87 extended / BCD).
    pub fn read_u80(&mut self, seg: SegReg, off: u32) -> Result<[u8; 10], Fault> {
        let mut buf = [0u8; 10];
        let r = self.read_bytes(seg, off, &mut buf);
        self.latch(r)?;
        Ok(buf)
    }

    #[inline]
    pub fn write_u8(&mut self, seg: SegReg, off: u32, v: u8) -> Result<(), Fault> {
        self.write_mem(seg, off, Width::W8, u32::from(v))
    }

    #[inline]
    pub fn write_u16(&mut self, seg: SegReg, off: u32, v: u16) -> Result<(), Fault> {
        self.write_mem(seg, off, Width::W16, u32::from(v))
    }

    #[inline]
    pub fn write_u32(&mut self, seg: SegReg, off: u32, v: u32) -> Result<(), Fault> {
        self.write_mem(seg, off, Width::W32, v)
    }

    pub fn write_u64(&mut self, seg: SegReg, off: u32, v: u64) -> Result<(), Fault> {
        let r = self.write_bytes(seg, off, &v.to_le_bytes());
        self.latch(r)
    }

    pub fn write_u80(&mut self, seg: SegReg, off: u32, v: [u8; 10]) -> Result<(), Fault> {
        let r = self.write_bytes(seg, off, &v);
        self.latch(r)
    }

    /// Perform every check of a `len`-byte access (at most 8) and return the
    /// translation for use with the no-abort accessors. Failures latch like
    /// the full form.
    pub fn validate(
        &mut self,
        seg: SegReg,
        off: u32,
        len: u32,
        access: AccessType,
    ) -> Result<Validated, Fault> {
        let r = if self.wraps_8088(off, len) {
            // Segment-wrapping 8088 accesses have no contiguous translation.
            Err(Fault::new(Exception::GeneralProtection))
        } else {
            self.linear_address(seg, off, len, access)
                .and_then(|lin| self.translate_range(lin, len, access, self.state.cpl))
        };
        self.latch(r)
    }

    /// No-abort read of an access already checked by [`Vcpu::validate`].
    pub fn read_validated(&mut self, v: &Validated) -> u64 {
        let mut buf = [0u8; 8];
        let n = usize::from(v.len).min(8);
        self.read_translated(v, &mut buf[..n]);
        u64::from_le_bytes(buf)
    }

    /// No-abort write of an access already checked by [`Vcpu::validate`].
    pub fn write_validated(&mut self, v: &Validated, value: u64) {
        let n = usize::from(v.len).min(8);
        self.write_translated(v, &value.to_le_bytes()[..n]);
    }

    // ---- supervisor-privilege system accesses (GDT/LDT/IDT/TSS) -------------

    pub fn read_sys(&mut self, linear: u32, width: Width) -> Result<u32, Fault> {
        let mut buf = [0u8; 4];
        let n = width.bytes() as usize;
        self.read_linear(linear, &mut buf[..n], AccessType::Read, 0)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_sys(&mut self, linear: u32, width: Width, value: u32) -> Result<(), Fault> {
        let n = width.bytes() as usize;
        self.write_linear(linear, &value.to_le_bytes()[..n], 0)
    }

    // ---- stack -------------------------------------------------------------

    /// Push; SP is only updated after the store succeeded.
    pub fn push(&mut self, width: Width, value: u32) -> Result<(), Fault> {
        let sp = self.state.sp().wrapping_sub(width.bytes()) & self.state.sp_mask();
        self.write_mem(SegReg::Ss, sp, width, value)?;
        self.state.set_sp(sp);
        Ok(())
    }

    /// Pop; SP is only updated after the load succeeded.
    pub fn pop(&mut self, width: Width) -> Result<u32, Fault> {
        let sp = self.state.sp();
        let v = self.read_mem(SegReg::Ss, sp, width)?;
        self.state.set_sp(sp.wrapping_add(width.bytes()));
        Ok(v)
    }

    /// Read the stack `depth` bytes above SP without popping.
    pub fn stack_peek(&mut self, depth: u32, width: Width) -> Result<u32, Fault> {
        let off = self.state.sp().wrapping_add(depth) & self.state.sp_mask();
        self.read_mem(SegReg::Ss, off, width)
    }

    // ---- instruction fetch -------------------------------------------------

    /// Fetch the code byte at CS:`eip`.
    pub fn fetch_code_u8(&mut self, eip: u32) -> Result<u8, Fault> {
        let lin = self.linear_address(SegReg::Cs, eip, 1, AccessType::Execute)?;
        let cpl = self.state.cpl;
        let page = lin >> 12;
        let c = self.fetch_cache;
        let phys_page = if c.valid && c.cpl == cpl && c.linear_page == page {
            c.phys_page
        } else {
            let paddr = self.bus.translate(lin, AccessType::Execute, cpl)?;
            self.fetch_cache = crate::vcpu::FetchCache {
                valid: true,
                cpl,
                linear_page: page,
                phys_page: paddr >> 12,
            };
            paddr >> 12
        };
        self.insn_pages.record(page, phys_page);
        let mut b = [0u8];
        self.bus.read_phys((phys_page << 12) | (lin & PAGE_MASK), &mut b);
        Ok(b[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::model::CpuConfig;
    use crate::state::descriptor::{ACC_DC, ACC_P, ACC_RW, ACC_S};
    use crate::state::{Cr0, Segment};

    fn vcpu(model: CpuModel) -> Vcpu<FlatTestBus> {
        Vcpu::new(CpuConfig::new(model), FlatTestBus::new(0x20_0000))
    }

    #[test]
    fn word_at_ffff_wraps_inside_segment_on_8088() {
        let mut v = vcpu(CpuModel::I8088);
        v.state.load_seg_real(SegReg::Ds, 0x1000);
        v.bus.load(0x1ffff, &[0x34]);
        v.bus.load(0x10000, &[0x12]);
        assert_eq!(v.read_u16(SegReg::Ds, 0xffff).unwrap(), 0x1234);
    }

    #[test]
    fn word_at_ffff_faults_on_386_real_mode() {
        let mut v = vcpu(CpuModel::I386);
        let err = v.read_u16(SegReg::Ds, 0xffff).unwrap_err();
        assert_eq!(err, Fault::gp0());
        assert_eq!(v.state.abort, Some(Fault::gp0()));
        let err = v.read_u16(SegReg::Ss, 0xffff).unwrap_err();
        assert_eq!(err.exception, Exception::StackFault);
    }

    #[test]
    fn expand_down_segment_limits() {
        let mut v = vcpu(CpuModel::I386);
        v.state.cr0 |= Cr0::PE;
        *v.state.seg_mut(SegReg::Es) = Segment {
            selector: 0x10,
            base: 0,
            limit: 0x0fff,
            access: ACC_P | ACC_S | ACC_RW | ACC_DC,
            flags: 0,
            checked: true,
        };
        assert!(v.read_u8(SegReg::Es, 0x0fff).is_err());
        assert!(v.read_u8(SegReg::Es, 0x1000).is_ok());
        assert!(v.read_u16(SegReg::Es, 0xffff).is_err());
    }

    #[test]
    fn null_segment_faults_in_protected_mode() {
        let mut v = vcpu(CpuModel::I386);
        v.state.cr0 |= Cr0::PE;
        *v.state.seg_mut(SegReg::Fs) = Segment::null(0);
        assert_eq!(v.read_u8(SegReg::Fs, 0).unwrap_err(), Fault::gp0());
    }

    #[test]
    fn validated_access_matches_full_form() {
        let mut v = vcpu(CpuModel::I386);
        let checked = v.validate(SegReg::Ds, 0x0ffe, 4, AccessType::Write).unwrap();
        assert_eq!(checked.split, 2);
        v.write_validated(&checked, 0xaabb_ccdd);
        assert_eq!(v.read_u32(SegReg::Ds, 0x0ffe).unwrap(), 0xaabb_ccdd);
        assert_eq!(v.read_validated(&checked) as u32, 0xaabb_ccdd);
    }

    #[test]
    fn failed_push_leaves_sp() {
        let mut v = vcpu(CpuModel::I386);
        v.state.set_sp(0x0001);
        assert!(v.push(Width::W16, 0x1234).is_err());
        assert_eq!(v.state.sp(), 0x0001);
        v.state.set_sp(0x0100);
        v.push(Width::W16, 0x1234).unwrap();
        assert_eq!(v.state.sp(), 0x00fe);
        assert_eq!(v.pop(Width::W16).unwrap(), 0x1234);
    }
}
