//! String instructions and their REP forms.
//!
//! A REP instruction runs at most [`REP_CHUNK`] iterations per step. When
//! work remains, EIP is left on the instruction so it resumes at the next
//! step, which lets pending interrupts in between. A fault mid-string leaves
//! the registers describing the iterations that completed.

use crate::decode::{AluOp, Insn, Rep, StrOp};
use crate::exceptions::Fault;
use crate::mem::{AccessType, CpuBus};
use crate::state::flags::Eflags;
use crate::types::{Gpr, SegReg, Width};
use crate::vcpu::Vcpu;

use super::alu::alu;
use super::{width_of, Flow};

pub(crate) const REP_CHUNK: u32 = 256;

/// Index registers and counter in the instruction's address size.
#[derive(Debug, Clone, Copy)]
struct StrRegs {
    width: Width,
    si: u32,
    di: u32,
    cx: u32,
}

impl<B: CpuBus> Vcpu<B> {
    fn load_str_regs(&self, insn: &Insn) -> StrRegs {
        let width = if insn.addr32 { Width::W32 } else { Width::W16 };
        StrRegs {
            width,
            si: self.state.read_gpr(Gpr::Esi as u8, width),
            di: self.state.read_gpr(Gpr::Edi as u8, width),
            cx: self.state.read_gpr(Gpr::Ecx as u8, width),
        }
    }

    fn store_str_regs(&mut self, r: &StrRegs) {
        self.state.write_gpr(Gpr::Esi as u8, r.width, r.si);
        self.state.write_gpr(Gpr::Edi as u8, r.width, r.di);
        self.state.write_gpr(Gpr::Ecx as u8, r.width, r.cx);
    }

    /// One iteration. Index registers in `r` advance only on success.
    fn string_iteration(&mut self, insn: &Insn, op: StrOp, r: &mut StrRegs) -> Result<(), Fault> {
        let w = width_of(insn.dst);
        let step = if self.state.flags.df() {
            w.bytes().wrapping_neg()
        } else {
            w.bytes()
        };
        let mask = r.width.mask();
        let src_seg = insn.seg_override.unwrap_or(SegReg::Ds);
        let (mut si, mut di) = (r.si, r.di);
        match op {
            StrOp::Movs => {
                let v = self.read_mem(src_seg, si, w)?;
                self.write_mem(SegReg::Es, di, w, v)?;
                si = si.wrapping_add(step);
                di = di.wrapping_add(step);
            }
            StrOp::Cmps => {
                let a = self.read_mem(src_seg, si, w)?;
                let b = self.read_mem(SegReg::Es, di, w)?;
                let (_, flags) = alu(AluOp::Cmp, w, a, b, false);
                self.state.flags.set_pending(flags);
                si = si.wrapping_add(step);
                di = di.wrapping_add(step);
            }
            StrOp::Stos => {
                let v = self.state.read_gpr(0, w);
                self.write_mem(SegReg::Es, di, w, v)?;
                di = di.wrapping_add(step);
            }
            StrOp::Lods => {
                let v = self.read_mem(src_seg, si, w)?;
                self.state.write_gpr(0, w, v);
                si = si.wrapping_add(step);
            }
            StrOp::Scas => {
                let a = self.state.read_gpr(0, w);
                let b = self.read_mem(SegReg::Es, di, w)?;
                let (_, flags) = alu(AluOp::Cmp, w, a, b, false);
                self.state.flags.set_pending(flags);
                di = di.wrapping_add(step);
            }
            StrOp::Ins => {
                let port = self.state.read_gpr(Gpr::Edx as u8, Width::W16) as u16;
                self.check_io(port, w)?;
                // The destination is checked before the port is read.
                let v = self.validate(SegReg::Es, di, w.bytes(), AccessType::Write)?;
                let data = self.bus.io_read(port, w);
                self.write_validated(&v, u64::from(data));
                di = di.wrapping_add(step);
            }
            StrOp::Outs => {
                let port = self.state.read_gpr(Gpr::Edx as u8, Width::W16) as u16;
                self.check_io(port, w)?;
                let v = self.read_mem(src_seg, si, w)?;
                self.bus.io_write(port, w, v);
                si = si.wrapping_add(step);
            }
        }
        r.si = si & mask;
        r.di = di & mask;
        Ok(())
    }

    pub(super) fn exec_string(&mut self, insn: &Insn, op: StrOp) -> Result<Flow, Fault> {
        let mut regs = self.load_str_regs(insn);
        if insn.rep == Rep::None {
            let r = self.string_iteration(insn, op, &mut regs);
            self.store_str_regs(&regs);
            r?;
            return Ok(Flow::Iterations(1));
        }

        let compares = matches!(op, StrOp::Cmps | StrOp::Scas);
        let mut done = 0;
        while regs.cx != 0 && done < REP_CHUNK {
            if let Err(fault) = self.string_iteration(insn, op, &mut regs) {
                self.store_str_regs(&regs);
                return Err(fault);
            }
            regs.cx = regs.cx.wrapping_sub(1) & regs.width.mask();
            done += 1;
            if compares {
                let zf = self.state.flags.get(Eflags::ZF);
                let stop = match insn.rep {
                    Rep::Repe => !zf,
                    _ => zf,
                };
                if stop {
                    self.store_str_regs(&regs);
                    return Ok(Flow::Iterations(done));
                }
            }
        }
        self.store_str_regs(&regs);
        if regs.cx != 0 {
            // Resume this instruction on the next step.
            self.state.eip = self.state.old_eip;
        }
        Ok(Flow::Iterations(done))
    }
}
