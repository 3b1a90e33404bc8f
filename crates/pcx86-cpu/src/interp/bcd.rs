//! Decimal adjust instructions.

use crate::decode::Insn;
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::model::{CpuModel, CpuVendor};
use crate::state::flags::{Eflags, STATUS_MASK};
use crate::types::{Gpr, Width};
use crate::vcpu::Vcpu;

use super::alu::szp;
use super::Flow;

impl<B: CpuBus> Vcpu<B> {
    fn al(&self) -> u32 {
        self.state.read_gpr(0, Width::W8)
    }

    fn ah(&self) -> u32 {
        self.state.read_gpr(4, Width::W8)
    }

    /// Commit the AL-derived status flags plus explicit CF/AF.
    fn set_bcd_flags(&mut self, al: u32, cf: bool, af: bool) {
        let mut bits = szp(Width::W8, al);
        if cf {
            bits |= Eflags::CF.bits();
        }
        if af {
            bits |= Eflags::AF.bits();
        }
        self.state.flags.set_status(STATUS_MASK, bits);
    }

    pub(super) fn exec_daa(&mut self) -> Result<Flow, Fault> {
        let old_al = self.al();
        let old_cf = self.state.flags.get(Eflags::CF);
        let mut al = old_al;
        let af = al & 0x0f > 9 || self.state.flags.get(Eflags::AF);
        if af {
            al = (al + 6) & 0xff;
        }
        // The high-nibble test uses the original AL and CF.
        let cf = old_al > 0x99 || old_cf;
        if cf {
            al = (al + 0x60) & 0xff;
        }
        self.state.write_gpr(0, Width::W8, al);
        self.set_bcd_flags(al, cf, af);
        Ok(Flow::Next)
    }

    pub(super) fn exec_das(&mut self) -> Result<Flow, Fault> {
        let old_al = self.al();
        let old_cf = self.state.flags.get(Eflags::CF);
        let mut al = old_al;
        let mut cf = false;
        let af = if al & 0x0f > 9 || self.state.flags.get(Eflags::AF) {
            cf = old_cf || al < 6;
            al = al.wrapping_sub(6) & 0xff;
            true
        } else {
            false
        };
        // Like DAA, this tests the original AL and CF, so a low-nibble borrow
        // never triggers the high adjustment on its own.
        if old_al > 0x99 || old_cf {
            al = al.wrapping_sub(0x60) & 0xff;
            cf = true;
        }
        self.state.write_gpr(0, Width::W8, al);
        self.set_bcd_flags(al, cf, af);
        Ok(Flow::Next)
    }

    /// AAA/AAS. The 386 and later adjust AX as a whole; earlier parts adjust
    /// AL and AH separately.
    fn ascii_adjust(&mut self, add: bool) -> Result<Flow, Fault> {
        let adjust = self.al() & 0x0f > 9 || self.state.flags.get(Eflags::AF);
        if adjust {
            let ax = self.state.read_gpr(Gpr::Eax as u8, Width::W16);
            let ax = if self.state.model() >= CpuModel::I386 {
                if add {
                    ax.wrapping_add(0x106)
                } else {
                    ax.wrapping_sub(0x106)
                }
            } else {
                let (al, ah) = if add {
                    ((ax & 0xff).wrapping_add(6), (ax >> 8).wrapping_add(1))
                } else {
                    ((ax & 0xff).wrapping_sub(6), (ax >> 8).wrapping_sub(1))
                };
                ((ah & 0xff) << 8) | (al & 0xff)
            };
            self.state.write_gpr(Gpr::Eax as u8, Width::W16, ax);
        }
        let al = self.al() & 0x0f;
        self.state.write_gpr(0, Width::W8, al);
        self.set_bcd_flags(al, adjust, adjust);
        Ok(Flow::Next)
    }

    pub(super) fn exec_aaa(&mut self) -> Result<Flow, Fault> {
        self.ascii_adjust(true)
    }

    pub(super) fn exec_aas(&mut self) -> Result<Flow, Fault> {
        self.ascii_adjust(false)
    }

    /// Base for AAM/AAD: only non-Intel parts honour the immediate.
    fn bcd_base(&self, insn: &Insn) -> u32 {
        let imm = insn.imm & 0xff;
        if self.state.config.vendor != CpuVendor::Intel && imm != 0 {
            imm
        } else {
            10
        }
    }

    pub(super) fn exec_aam(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let base = self.bcd_base(insn);
        let al = self.al();
        let (q, r) = (al / base, al % base);
        self.state
            .write_gpr(Gpr::Eax as u8, Width::W16, ((q & 0xff) << 8) | r);
        let cf = self.state.flags.get(Eflags::CF);
        self.set_bcd_flags(r, cf, false);
        Ok(Flow::Next)
    }

    pub(super) fn exec_aad(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let base = self.bcd_base(insn);
        let al = (self.al() + self.ah() * base) & 0xff;
        self.state.write_gpr(Gpr::Eax as u8, Width::W16, al);
        let cf = self.state.flags.get(Eflags::CF);
        self.set_bcd_flags(al, cf, false);
        Ok(Flow::Next)
    }

    /// Undocumented `D6`: AL = CF ? FF : 00.
    pub(super) fn exec_salc(&mut self) -> Result<Flow, Fault> {
        let v = if self.state.flags.get(Eflags::CF) { 0xff } else { 0 };
        self.state.write_gpr(0, Width::W8, v);
        Ok(Flow::Next)
    }
}
