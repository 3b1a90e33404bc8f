//! Stack instructions.
//!
//! Multi-step stack operations snapshot ESP (and EBP for ENTER) and restore
//! it when any step faults, so a restarted instruction sees the original
//! stack.

use crate::decode::{Arg, Insn};
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::model::CpuModel;
use crate::types::{Gpr, SegReg, Width};
use crate::vcpu::Vcpu;

use super::{width_of, Flow};

impl<B: CpuBus> Vcpu<B> {
    /// Run `f`; on failure restore ESP and EBP.
    pub(super) fn with_stack_rollback<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Fault>,
    ) -> Result<T, Fault> {
        let esp = self.state.reg(Gpr::Esp);
        let ebp = self.state.reg(Gpr::Ebp);
        let r = f(self);
        if r.is_err() {
            self.state.set_reg(Gpr::Esp, esp);
            self.state.set_reg(Gpr::Ebp, ebp);
        }
        r
    }

    fn names_sp(insn: &Insn) -> bool {
        match insn.dst {
            Arg::OpReg(_) => insn.opcode & 7 == Gpr::Esp as u8,
            Arg::Rm(_) => insn.modrm.is_some_and(|m| m.is_reg() && m.rm == Gpr::Esp as u8),
            _ => false,
        }
    }

    pub(super) fn exec_push(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let mut v = self.read_arg(insn, insn.dst)?;
        if self.state.model() == CpuModel::I8088 && Self::names_sp(insn) {
            // The 8088 stores SP after decrementing it.
            v = self.state.sp().wrapping_sub(2) & 0xffff;
        }
        self.push(w, v)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_pop(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        if !matches!(insn.dst, Arg::Rm(_)) || insn.rm_is_reg() {
            let v = self.pop(w)?;
            self.write_arg(insn, insn.dst, v)?;
            return Ok(Flow::Next);
        }
        // POP m: the destination address is computed with the incremented
        // stack pointer.
        self.with_stack_rollback(|cpu| {
            let sp = cpu.state.sp();
            let v = cpu.read_mem(SegReg::Ss, sp, w)?;
            cpu.state.set_sp(sp.wrapping_add(w.bytes()));
            cpu.write_arg(insn, insn.dst, v)
        })?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_push_seg(&mut self, insn: &Insn, seg: SegReg) -> Result<Flow, Fault> {
        let v = u32::from(self.state.seg(seg).selector);
        self.push(insn.op_width(), v)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_pop_seg(&mut self, insn: &Insn, seg: SegReg) -> Result<Flow, Fault> {
        let w = insn.op_width();
        let selector = self.stack_peek(0, w)? as u16;
        self.load_segment(seg, selector)?;
        let sp = self.state.sp().wrapping_add(w.bytes());
        self.state.set_sp(sp);
        if seg == SegReg::Ss {
            self.pending.inhibit_interrupts_for_one_instruction();
        }
        Ok(Flow::Next)
    }

    /// 8088 `0F`.
    pub(super) fn exec_pop_cs(&mut self) -> Result<Flow, Fault> {
        let selector = self.pop(Width::W16)? as u16;
        self.state.load_seg_real(SegReg::Cs, selector);
        self.invalidate_fetch();
        Ok(Flow::Taken)
    }

    pub(super) fn exec_pusha(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        self.with_stack_rollback(|cpu| {
            let original_sp = cpu.state.read_gpr(Gpr::Esp as u8, w);
            for r in Gpr::ALL {
                let v = if r == Gpr::Esp {
                    original_sp
                } else {
                    cpu.state.read_gpr(r as u8, w)
                };
                cpu.push(w, v)?;
            }
            Ok(())
        })?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_popa(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        let mut values = [0u32; 8];
        self.with_stack_rollback(|cpu| {
            for r in Gpr::ALL.iter().rev() {
                values[r.index()] = cpu.pop(w)?;
            }
            Ok(())
        })?;
        for r in Gpr::ALL {
            if r != Gpr::Esp {
                self.state.write_gpr(r as u8, w, values[r.index()]);
            }
        }
        Ok(Flow::Next)
    }

    fn check_vm86_iopl(&self) -> Result<(), Fault> {
        if self.state.vm86() && self.state.flags.iopl() < 3 {
            Err(Fault::gp0())
        } else {
            Ok(())
        }
    }

    pub(super) fn exec_pushf(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.check_vm86_iopl()?;
        let image = self.state.flags_image();
        self.push(insn.op_width(), image)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_popf(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.check_vm86_iopl()?;
        let v = self.pop(insn.op_width())?;
        self.write_flags(v, insn.op32);
        Ok(Flow::Next)
    }

    pub(super) fn exec_enter(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        let size = insn.imm & 0xffff;
        let level = insn.imm2 & 31;
        let bp_width = if self.state.stack32() { Width::W32 } else { Width::W16 };
        self.with_stack_rollback(|cpu| {
            let ebp = cpu.state.read_gpr(Gpr::Ebp as u8, bp_width);
            cpu.push(w, ebp)?;
            let frame = cpu.state.sp();
            if level > 0 {
                let mask = cpu.state.sp_mask();
                for i in 1..level {
                    let off = ebp.wrapping_sub(i * w.bytes()) & mask;
                    let v = cpu.read_mem(SegReg::Ss, off, w)?;
                    cpu.push(w, v)?;
                }
                cpu.push(w, frame)?;
            }
            cpu.state.write_gpr(Gpr::Ebp as u8, bp_width, frame);
            let sp = cpu.state.sp().wrapping_sub(size);
            cpu.state.set_sp(sp);
            Ok(())
        })?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_leave(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        self.with_stack_rollback(|cpu| {
            let ebp = cpu.state.reg(Gpr::Ebp);
            cpu.state.set_sp(ebp);
            let v = cpu.pop(w)?;
            cpu.state.write_gpr(Gpr::Ebp as u8, w, v);
            Ok(())
        })?;
        Ok(Flow::Next)
    }
}
