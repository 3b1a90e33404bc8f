//! Segment register loads and descriptor-table access.

use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::state::descriptor::{Descriptor, ACC_ACCESSED, ACC_DC, ACC_RW};
use crate::state::Segment;
use crate::types::{SegReg, Width};
use crate::vcpu::Vcpu;

/// How a failed stack-segment check is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackCheck {
    /// MOV/POP/LSS and IRET/RET to an outer level.
    Load,
    /// SS taken from the TSS during a privilege change.
    Tss,
}

impl<B: CpuBus> Vcpu<B> {
    fn descriptor_table(&self, selector: u16) -> Result<(u32, u32), Fault> {
        if selector & 4 != 0 {
            let ldt = self.state.ldtr;
            if !ldt.checked {
                return Err(Fault::gp(selector));
            }
            Ok((ldt.base, ldt.limit))
        } else {
            Ok((self.state.gdtr.base, u32::from(self.state.gdtr.limit)))
        }
    }

    /// Read the GDT/LDT descriptor a selector names. Selectors past the table
    /// limit raise #GP(selector).
    pub fn read_descriptor(&mut self, selector: u16) -> Result<Descriptor, Fault> {
        let (base, limit) = self.descriptor_table(selector)?;
        let index = u32::from(selector & !7);
        if index + 7 > limit {
            return Err(Fault::gp(selector));
        }
        let low = self.read_sys(base.wrapping_add(index), Width::W32)?;
        let high = self.read_sys(base.wrapping_add(index + 4), Width::W32)?;
        Ok(Descriptor::new(low, high))
    }

    /// Write back the access byte of a descriptor (accessed/busy bits).
    pub(crate) fn write_descriptor_access(
        &mut self,
        selector: u16,
        access: u8,
    ) -> Result<(), Fault> {
        let (base, _) = self.descriptor_table(selector)?;
        let index = u32::from(selector & !7);
        self.write_sys(base.wrapping_add(index + 5), Width::W8, u32::from(access))
    }

    pub(crate) fn mark_accessed(
        &mut self,
        selector: u16,
        desc: &Descriptor,
    ) -> Result<Descriptor, Fault> {
        if desc.access() & ACC_ACCESSED == 0 {
            self.write_descriptor_access(selector, desc.access() | ACC_ACCESSED)?;
        }
        Ok(desc.with_accessed())
    }

    /// Load a data or stack segment register (MOV, POP, LxS) under the rules of
    /// the current mode.
    pub fn load_segment(&mut self, seg: SegReg, selector: u16) -> Result<(), Fault> {
        if !self.state.protected_mode() {
            self.state.load_seg_real(seg, selector);
        } else if self.state.vm86() {
            self.state.load_seg_vm86(seg, selector);
        } else if seg == SegReg::Ss {
            let cpl = self.state.cpl;
            let s = self.check_stack_segment(selector, cpl, StackCheck::Load)?;
            *self.state.seg_mut(SegReg::Ss) = s;
        } else if seg == SegReg::Cs {
            return Err(Fault::ud());
        } else {
            let s = self.check_data_segment(selector)?;
            *self.state.seg_mut(seg) = s;
        }
        if seg == SegReg::Cs {
            self.invalidate_fetch();
        }
        Ok(())
    }

    /// Validate a protected-mode data segment load and return the new cache.
    pub(crate) fn check_data_segment(&mut self, selector: u16) -> Result<Segment, Fault> {
        if selector & !3 == 0 {
            return Ok(Segment::null(selector));
        }
        let desc = self.read_descriptor(selector)?;
        let readable_code = desc.is_code() && desc.access() & ACC_RW != 0;
        if !(desc.is_data() || readable_code) {
            return Err(Fault::gp(selector));
        }
        let conforming = desc.is_code() && desc.access() & ACC_DC != 0;
        let rpl = (selector & 3) as u8;
        if !conforming && desc.dpl() < self.state.cpl.max(rpl) {
            return Err(Fault::gp(selector));
        }
        if !desc.present() {
            return Err(Fault::np(selector));
        }
        let desc = self.mark_accessed(selector, &desc)?;
        Ok(Segment::from_descriptor(selector, &desc))
    }

    /// Validate a stack segment for privilege level `cpl`.
    pub(crate) fn check_stack_segment(
        &mut self,
        selector: u16,
        cpl: u8,
        check: StackCheck,
    ) -> Result<Segment, Fault> {
        let fail = |sel: u16| match check {
            StackCheck::Load => Fault::gp(sel),
            StackCheck::Tss => Fault::ts(sel),
        };
        if selector & !3 == 0 {
            return Err(fail(0));
        }
        let desc = self
            .read_descriptor(selector)
            .map_err(|_| fail(selector))?;
        let writable = desc.is_data() && desc.access() & ACC_RW != 0;
        if (selector & 3) as u8 != cpl || desc.dpl() != cpl || !writable {
            return Err(fail(selector));
        }
        if !desc.present() {
            return Err(Fault::ss(selector));
        }
        let desc = self.mark_accessed(selector, &desc)?;
        Ok(Segment::from_descriptor(selector, &desc))
    }

    /// Validate a code segment as a far JMP/CALL/interrupt target. Returns the
    /// descriptor; privilege rules beyond "is a present code segment" are the
    /// caller's.
    pub(crate) fn read_code_descriptor(&mut self, selector: u16) -> Result<Descriptor, Fault> {
        if selector & !3 == 0 {
            return Err(Fault::gp0());
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_code() {
            return Err(Fault::gp(selector));
        }
        Ok(desc)
    }

    /// Commit a validated code segment as CS at privilege `cpl`.
    pub(crate) fn commit_cs(
        &mut self,
        selector: u16,
        desc: &Descriptor,
        cpl: u8,
    ) -> Result<(), Fault> {
        let desc = self.mark_accessed(selector, desc)?;
        let selector = (selector & !3) | u16::from(cpl);
        *self.state.seg_mut(SegReg::Cs) = Segment::from_descriptor(selector, &desc);
        self.state.cpl = cpl;
        self.invalidate_fetch();
        Ok(())
    }

    /// After a return to an outer privilege level, data segment registers the
    /// new level may not use are nulled.
    pub(crate) fn null_inaccessible_segments(&mut self) {
        let cpl = self.state.cpl;
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let s = self.state.seg(seg);
            let keep = s.checked && (s.conforming() || s.dpl() >= cpl);
            if !keep {
                *self.state.seg_mut(seg) = Segment::null(0);
            }
        }
    }

    /// Inner-level stack pointer from the current TSS.
    pub(crate) fn tss_stack(&mut self, dpl: u8) -> Result<(u16, u32), Fault> {
        let tr = self.state.tr;
        if !tr.checked {
            return Err(Fault::ts(tr.selector));
        }
        let tss32 = tr.access & 0x8 != 0;
        let (esp_off, ss_off, esp_width) = if tss32 {
            (4 + u32::from(dpl) * 8, 8 + u32::from(dpl) * 8, Width::W32)
        } else {
            (2 + u32::from(dpl) * 4, 4 + u32::from(dpl) * 4, Width::W16)
        };
        if ss_off + 1 > tr.limit {
            return Err(Fault::ts(tr.selector));
        }
        let esp = self.read_sys(tr.base.wrapping_add(esp_off), esp_width)?;
        let ss = self.read_sys(tr.base.wrapping_add(ss_off), Width::W16)? as u16;
        Ok((ss, esp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::Exception;
    use crate::mem::FlatTestBus;
    use crate::model::{CpuConfig, CpuModel};
    use crate::state::{Cr0, TableReg};

    const GDT: u32 = 0x1000;

    fn pm_vcpu() -> Vcpu<FlatTestBus> {
        let mut bus = FlatTestBus::new(0x10000);
        let entries: [u64; 5] = [
            0,
            0x00cf_9a00_0000_ffff, // 0x08 code, DPL0
            0x00cf_9200_0000_ffff, // 0x10 data, DPL0
            0x00cf_f200_0000_ffff, // 0x18 data, DPL3
            0x00cf_1200_0000_ffff, // 0x20 data, not present
        ];
        for (i, e) in entries.iter().enumerate() {
            bus.load(GDT + i as u32 * 8, &e.to_le_bytes());
        }
        let mut vcpu = Vcpu::new(CpuConfig::new(CpuModel::I386), bus);
        vcpu.state.gdtr = TableReg {
            base: GDT,
            limit: 5 * 8 - 1,
        };
        vcpu.state.cr0 |= Cr0::PE;
        vcpu
    }

    #[test]
    fn data_load_sets_accessed_and_checked() {
        let mut vcpu = pm_vcpu();
        vcpu.load_segment(SegReg::Ds, 0x10).unwrap();
        let ds = *vcpu.state.seg(SegReg::Ds);
        assert!(ds.checked);
        assert_eq!(ds.limit, 0xffff_ffff);
        assert_ne!(vcpu.bus.read_u8(GDT + 0x10 + 5) & ACC_ACCESSED, 0);
    }

    #[test]
    fn null_data_selector_loads_unchecked() {
        let mut vcpu = pm_vcpu();
        vcpu.load_segment(SegReg::Es, 0).unwrap();
        assert!(!vcpu.state.seg(SegReg::Es).checked);
        let err = vcpu.load_segment(SegReg::Ss, 0).unwrap_err();
        assert_eq!(err, Fault::gp0());
    }

    #[test]
    fn protection_errors_carry_selector() {
        let mut vcpu = pm_vcpu();
        vcpu.state.cpl = 3;
        assert_eq!(vcpu.load_segment(SegReg::Ds, 0x13).unwrap_err(), Fault::gp(0x10));
        assert_eq!(
            vcpu.load_segment(SegReg::Ds, 0x23).unwrap_err().exception,
            Exception::GeneralProtection
        );
        vcpu.state.cpl = 0;
        assert_eq!(vcpu.load_segment(SegReg::Ds, 0x20).unwrap_err(), Fault::np(0x20));
        assert_eq!(vcpu.load_segment(SegReg::Ds, 0x30).unwrap_err(), Fault::gp(0x30));
        // Stack must match CPL.
        assert_eq!(vcpu.load_segment(SegReg::Ss, 0x1b).unwrap_err(), Fault::gp(0x18));
        // Code segments are never stacks.
        assert_eq!(vcpu.load_segment(SegReg::Ss, 0x08).unwrap_err(), Fault::gp(0x08));
    }

    #[test]
    fn real_mode_load_follows_selector() {
        let mut vcpu = Vcpu::new(CpuConfig::new(CpuModel::I386), FlatTestBus::new(0x1000));
        vcpu.load_segment(SegReg::Es, 0x1234).unwrap();
        assert_eq!(vcpu.state.seg(SegReg::Es).base, 0x12340);
    }
}
