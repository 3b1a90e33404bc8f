//! System instructions: descriptor tables, control/debug registers, MSRs,
//! CPUID, SYSCALL/SYSRET and HLT.

use tracing::{debug, trace};

use crate::cpuid;
use crate::decode::{Insn, Op};
use crate::exceptions::{Exception, Fault};
use crate::mem::CpuBus;
use crate::model::CpuModel;
use crate::state::descriptor::{
    Descriptor, SystemKind, ACC_ACCESSED, ACC_CODE, ACC_DC, ACC_P, ACC_RW, ACC_S, FLAG_DB, FLAG_G,
};
use crate::state::flags::Eflags;
use crate::state::{Cr0, Cr4, Segment};
use crate::types::{Gpr, SegReg, Width};
use crate::vcpu::Vcpu;

use super::Flow;

/// 4G flat segment used by SYSCALL/SYSRET.
fn flat_segment(selector: u16, code: bool, dpl: u8) -> Segment {
    let kind = if code { ACC_CODE } else { 0 };
    Segment {
        selector,
        base: 0,
        limit: 0xffff_ffff,
        access: ACC_P | ACC_S | ACC_RW | ACC_ACCESSED | kind | (dpl << 5),
        flags: FLAG_DB | FLAG_G,
        checked: true,
    }
}

impl<B: CpuBus> Vcpu<B> {
    /// Write a selector-sized result. Register destinations with a 32-bit
    /// operand size take the zero-extended value.
    fn write_selector_result(&mut self, insn: &Insn, value: u32) -> Result<(), Fault> {
        match insn.modrm {
            Some(m) if m.is_reg() && insn.op32 => {
                self.state.write_gpr(m.rm, Width::W32, value);
                Ok(())
            }
            _ => self.write_arg(insn, insn.dst, value),
        }
    }

    fn set_zf(&mut self, zf: bool) {
        let bits = if zf { Eflags::ZF.bits() } else { 0 };
        self.state.flags.set_status(Eflags::ZF.bits(), bits);
    }

    /// Descriptor lookup for the probing instructions (VERR/VERW/LAR/LSL):
    /// a null or out-of-table selector yields `None` instead of a fault.
    fn probe_descriptor(&mut self, selector: u16) -> Result<Option<Descriptor>, Fault> {
        if selector & !3 == 0 {
            return Ok(None);
        }
        match self.read_descriptor(selector) {
            Ok(d) => Ok(Some(d)),
            Err(f) if f.exception == Exception::GeneralProtection => Ok(None),
            Err(f) => Err(f),
        }
    }

    /// Privilege test shared by the probing instructions.
    fn probe_visible(&self, selector: u16, desc: &Descriptor) -> bool {
        let conforming_code = desc.is_code() && desc.access() & ACC_DC != 0;
        let rpl = (selector & 3) as u8;
        conforming_code || desc.dpl() >= self.state.cpl.max(rpl)
    }

    /// SLDT/STR.
    pub(super) fn exec_store_system_selector(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_protected()?;
        let sel = if insn.op == Op::Sldt {
            self.state.ldtr.selector
        } else {
            self.state.tr.selector
        };
        self.write_selector_result(insn, u32::from(sel))?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_lldt(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_protected()?;
        self.require_cpl0()?;
        let selector = self.read_arg(insn, insn.dst)? as u16;
        if selector & !3 == 0 {
            self.state.ldtr = Segment::null(selector);
            return Ok(Flow::Next);
        }
        if selector & 4 != 0 {
            return Err(Fault::gp(selector));
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_system() || desc.system_kind() != SystemKind::Ldt {
            return Err(Fault::gp(selector));
        }
        if !desc.present() {
            return Err(Fault::np(selector));
        }
        self.state.ldtr = Segment::from_descriptor(selector, &desc);
        Ok(Flow::Next)
    }

    pub(super) fn exec_ltr(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_protected()?;
        self.require_cpl0()?;
        let selector = self.read_arg(insn, insn.dst)? as u16;
        if selector & !3 == 0 {
            return Err(Fault::gp0());
        }
        if selector & 4 != 0 {
            return Err(Fault::gp(selector));
        }
        let desc = self.read_descriptor(selector)?;
        let available = matches!(
            desc.system_kind(),
            SystemKind::Tss16Available | SystemKind::Tss32Available
        );
        if !desc.is_system() || !available {
            return Err(Fault::gp(selector));
        }
        if !desc.present() {
            return Err(Fault::np(selector));
        }
        let busy = desc.with_busy();
        self.write_descriptor_access(selector, busy.access())?;
        self.state.tr = Segment::from_descriptor(selector, &busy);
        Ok(Flow::Next)
    }

    /// VERR/VERW.
    pub(super) fn exec_verify(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_protected()?;
        let selector = self.read_arg(insn, insn.dst)? as u16;
        let ok = match self.probe_descriptor(selector)? {
            Some(d) if !d.is_system() && d.present() && self.probe_visible(selector, &d) => {
                if insn.op == Op::Verr {
                    d.is_data() || d.access() & ACC_RW != 0
                } else {
                    d.is_data() && d.access() & ACC_RW != 0
                }
            }
            _ => false,
        };
        self.set_zf(ok);
        Ok(Flow::Next)
    }

    pub(super) fn exec_lar_lsl(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_protected()?;
        let selector = self.read_arg(insn, insn.src)? as u16;
        let lar = insn.op == Op::Lar;
        let desc = match self.probe_descriptor(selector)? {
            Some(d) if self.probe_visible(selector, &d) => d,
            _ => {
                self.set_zf(false);
                return Ok(Flow::Next);
            }
        };
        let valid_type = !desc.is_system()
            || match desc.system_kind() {
                SystemKind::Tss16Available
                | SystemKind::Tss16Busy
                | SystemKind::Tss32Available
                | SystemKind::Tss32Busy
                | SystemKind::Ldt => true,
                SystemKind::CallGate16 | SystemKind::CallGate32 | SystemKind::TaskGate => lar,
                _ => false,
            };
        if !valid_type {
            self.set_zf(false);
            return Ok(Flow::Next);
        }
        let high = (desc.raw >> 32) as u32;
        let value = if lar {
            high & 0x00ff_ff00
        } else {
            desc.limit()
        };
        self.write_arg(insn, insn.dst, value)?;
        self.set_zf(true);
        Ok(Flow::Next)
    }

    /// SGDT/SIDT.
    pub(super) fn exec_store_table(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let (seg, off) = self.mem_operand(insn, insn.dst).ok_or_else(Fault::ud)?;
        let table = if insn.op == Op::Sgdt {
            self.state.gdtr
        } else {
            self.state.idtr
        };
        let base = if insn.op32 {
            table.base
        } else if self.state.model() == CpuModel::I286 {
            // The 286 stores an all-ones high byte.
            (table.base & 0x00ff_ffff) | 0xff00_0000
        } else {
            table.base & 0x00ff_ffff
        };
        self.write_u16(seg, off, table.limit)?;
        self.write_u32(seg, Self::ea_add(insn, off, 2), base)?;
        Ok(Flow::Next)
    }

    /// LGDT/LIDT.
    pub(super) fn exec_load_table(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let (seg, off) = self.mem_operand(insn, insn.dst).ok_or_else(Fault::ud)?;
        let limit = self.read_u16(seg, off)?;
        let base = self.read_u32(seg, Self::ea_add(insn, off, 2))?;
        let base = if insn.op32 { base } else { base & 0x00ff_ffff };
        let table = if insn.op == Op::Lgdt {
            &mut self.state.gdtr
        } else {
            &mut self.state.idtr
        };
        table.base = base;
        table.limit = limit;
        trace!(op = ?insn.op, base, limit, "descriptor table loaded");
        Ok(Flow::Next)
    }

    pub(super) fn exec_smsw(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let cr0 = self.state.cr0.bits();
        let value = match insn.modrm {
            Some(m) if m.is_reg() && insn.op32 => cr0,
            _ => cr0 & 0xffff,
        };
        self.write_selector_result(insn, value)?;
        Ok(Flow::Next)
    }

    /// LMSW: loads PE/MP/EM/TS; PE can be set but not cleared.
    pub(super) fn exec_lmsw(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let v = self.read_arg(insn, insn.dst)? & 0xf;
        let old = self.state.cr0.bits();
        let new = (old & !0xe) | (v & 0xe) | (old & 1) | (v & 1);
        self.state.cr0 = Cr0::from_bits_retain(new);
        self.sync_control();
        Ok(Flow::Next)
    }

    pub(super) fn exec_invlpg(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let (seg, off) = self.mem_operand(insn, insn.dst).ok_or_else(Fault::ud)?;
        let linear = self.state.seg(seg).base.wrapping_add(off);
        self.bus.invlpg(linear);
        self.invalidate_fetch();
        Ok(Flow::Next)
    }

    pub(super) fn exec_clts(&mut self) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        self.state.cr0.remove(Cr0::TS);
        Ok(Flow::Next)
    }

    /// General register named by the ModRM r/m field of MOV CRn/DRn; the mod
    /// bits are ignored.
    fn ctl_gpr(insn: &Insn) -> u8 {
        insn.modrm.map_or(0, |m| m.rm)
    }

    pub(super) fn exec_mov_from_cr(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let v = match insn.reg_field() {
            0 => self.state.cr0.bits(),
            2 => self.state.cr2,
            3 => self.state.cr3,
            4 if self.state.model() >= CpuModel::Pentium => self.state.cr4.bits(),
            _ => return Err(Fault::ud()),
        };
        self.state.write_gpr(Self::ctl_gpr(insn), Width::W32, v);
        Ok(Flow::Next)
    }

    pub(super) fn exec_mov_to_cr(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let v = self.state.read_gpr(Self::ctl_gpr(insn), Width::W32);
        match insn.reg_field() {
            0 => {
                let mut cr0 = Cr0::from_bits_truncate(v);
                if cr0.contains(Cr0::PG) && !cr0.contains(Cr0::PE) {
                    return Err(Fault::gp0());
                }
                if cr0.contains(Cr0::NW) && !cr0.contains(Cr0::CD) {
                    return Err(Fault::gp0());
                }
                if self.state.model().is_486_class() {
                    cr0 |= Cr0::ET;
                }
                let paging_changed = (cr0 ^ self.state.cr0).intersects(Cr0::PG | Cr0::PE | Cr0::WP);
                if !cr0.contains(Cr0::PE) {
                    self.state.cpl = 0;
                }
                debug!(cr0 = format_args!("{:#x}", cr0.bits()), "cr0 write");
                self.state.cr0 = cr0;
                if paging_changed {
                    self.bus.flush_tlb();
                }
            }
            2 => self.state.cr2 = v,
            3 => {
                self.state.cr3 = v & 0xffff_f018;
                self.bus.flush_tlb();
            }
            4 if self.state.model() >= CpuModel::Pentium => {
                let cr4 = Cr4::from_bits(v).ok_or_else(Fault::gp0)?;
                if (cr4 ^ self.state.cr4).intersects(Cr4::PSE | Cr4::PGE) {
                    self.bus.flush_tlb();
                }
                self.state.cr4 = cr4;
            }
            _ => return Err(Fault::ud()),
        }
        self.sync_control();
        Ok(Flow::Taken)
    }

    /// DR4/DR5 alias DR6/DR7 unless CR4.DE is set.
    fn debug_index(&self, reg: u8) -> Result<usize, Fault> {
        match reg {
            4 | 5 if self.state.cr4.contains(Cr4::DE) => Err(Fault::ud()),
            4 | 5 => Ok(usize::from(reg) + 2),
            r => Ok(usize::from(r)),
        }
    }

    pub(super) fn exec_mov_from_dr(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let i = self.debug_index(insn.reg_field())?;
        let v = self.state.dr[i];
        self.state.write_gpr(Self::ctl_gpr(insn), Width::W32, v);
        Ok(Flow::Next)
    }

    pub(super) fn exec_mov_to_dr(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let i = self.debug_index(insn.reg_field())?;
        let v = self.state.read_gpr(Self::ctl_gpr(insn), Width::W32);
        self.state.dr[i] = match i {
            6 => (v & 0x0000_e00f) | 0xffff_0ff0,
            7 => v | 0x400,
            _ => v,
        };
        Ok(Flow::Next)
    }

    /// INVD/WBINVD. There are no caches to flush.
    pub(super) fn exec_cache_flush(&mut self) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        Ok(Flow::Next)
    }

    fn k6(&self) -> bool {
        self.state.model() == CpuModel::K6
    }

    pub(super) fn exec_wrmsr(&mut self) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let index = self.state.reg(Gpr::Ecx);
        let value =
            (u64::from(self.state.reg(Gpr::Edx)) << 32) | u64::from(self.state.reg(Gpr::Eax));
        let k6 = self.k6();
        if let Some(tsc) = self.state.msr.write(index, value, k6)? {
            self.state.tsc = tsc;
        }
        Ok(Flow::Next)
    }

    pub(super) fn exec_rdmsr(&mut self) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        let index = self.state.reg(Gpr::Ecx);
        let v = self.state.msr.read(index, self.state.tsc, self.k6())?;
        self.state.set_reg(Gpr::Eax, v as u32);
        self.state.set_reg(Gpr::Edx, (v >> 32) as u32);
        Ok(Flow::Next)
    }

    pub(super) fn exec_rdtsc(&mut self) -> Result<Flow, Fault> {
        if self.state.cr4.contains(Cr4::TSD) && self.state.protected_mode() && self.state.cpl != 0 {
            return Err(Fault::gp0());
        }
        let tsc = self.state.tsc;
        self.state.set_reg(Gpr::Eax, tsc as u32);
        self.state.set_reg(Gpr::Edx, (tsc >> 32) as u32);
        Ok(Flow::Next)
    }

    pub(super) fn exec_cpuid(&mut self) -> Result<Flow, Fault> {
        let r = cpuid::cpuid(&self.state.config, self.state.reg(Gpr::Eax));
        self.state.set_reg(Gpr::Eax, r.eax);
        self.state.set_reg(Gpr::Ebx, r.ebx);
        self.state.set_reg(Gpr::Ecx, r.ecx);
        self.state.set_reg(Gpr::Edx, r.edx);
        Ok(Flow::Next)
    }

    /// SYSCALL (K6 legacy mode): flat CPL0 code at STAR[31:0], return EIP in
    /// ECX.
    pub(super) fn exec_syscall(&mut self) -> Result<Flow, Fault> {
        if !self.k6() || !self.state.msr.syscall_enabled() || !self.state.protected_mode() {
            return Err(Fault::ud());
        }
        let star = self.state.msr.star;
        let cs = ((star >> 32) as u16) & !3;
        self.state.set_reg(Gpr::Ecx, self.state.eip);
        self.state.flags.set(Eflags::VM, false);
        self.state.flags.set(Eflags::IF, false);
        self.state.flags.set(Eflags::RF, false);
        *self.state.seg_mut(SegReg::Cs) = flat_segment(cs, true, 0);
        *self.state.seg_mut(SegReg::Ss) = flat_segment(cs.wrapping_add(8), false, 0);
        self.state.cpl = 0;
        self.state.eip = star as u32;
        self.invalidate_fetch();
        Ok(Flow::Taken)
    }

    /// SYSRET: back to flat CPL3 code at ECX with interrupts enabled.
    pub(super) fn exec_sysret(&mut self) -> Result<Flow, Fault> {
        if !self.k6() || !self.state.msr.syscall_enabled() {
            return Err(Fault::ud());
        }
        if !self.state.protected_mode() || self.state.cpl != 0 {
            return Err(Fault::gp0());
        }
        let cs = ((self.state.msr.star >> 48) as u16) | 3;
        *self.state.seg_mut(SegReg::Cs) = flat_segment(cs, true, 3);
        *self.state.seg_mut(SegReg::Ss) = flat_segment(cs.wrapping_add(8), false, 3);
        self.state.cpl = 3;
        self.state.flags.set(Eflags::IF, true);
        self.state.eip = self.state.reg(Gpr::Ecx);
        self.invalidate_fetch();
        Ok(Flow::Taken)
    }

    pub(super) fn exec_arpl(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.require_protected()?;
        let loc = self.locate(insn, insn.dst)?;
        let dest = self.load(loc)?;
        let src = self.read_arg(insn, insn.src)?;
        let adjust = dest & 3 < src & 3;
        if adjust {
            self.store(loc, (dest & !3) | (src & 3))?;
        }
        self.set_zf(adjust);
        Ok(Flow::Next)
    }

    pub(super) fn exec_hlt(&mut self) -> Result<Flow, Fault> {
        self.require_cpl0()?;
        self.state.halted = true;
        Ok(Flow::Next)
    }
}

