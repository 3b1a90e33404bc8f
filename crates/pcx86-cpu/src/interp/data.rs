//! Data movement, conversions and flag instructions.

use crate::decode::{Insn, Op};
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::state::flags::Eflags;
use crate::types::{Cond, Gpr, SegReg, Width};
use crate::vcpu::Vcpu;

use super::{width_of, Flow};

impl<B: CpuBus> Vcpu<B> {
    pub(super) fn exec_mov(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let v = self.read_arg(insn, insn.src)?;
        self.write_arg(insn, insn.dst, v)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_mov_to_seg(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let seg = SegReg::from_index(insn.reg_field()).ok_or_else(Fault::ud)?;
        let selector = self.read_arg(insn, insn.src)? as u16;
        if seg == SegReg::Cs {
            // Only the 8088 decodes MOV CS; it behaves like a real-mode load.
            self.state.load_seg_real(SegReg::Cs, selector);
            self.invalidate_fetch();
            return Ok(Flow::Taken);
        }
        self.load_segment(seg, selector)?;
        if seg == SegReg::Ss {
            self.pending.inhibit_interrupts_for_one_instruction();
        }
        Ok(Flow::Next)
    }

    pub(super) fn exec_mov_from_seg(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let v = self.read_arg(insn, insn.src)?;
        match insn.modrm {
            // Register destinations take the zero-extended selector.
            Some(m) if m.is_reg() && insn.op32 => self.state.write_gpr(m.rm, Width::W32, v),
            _ => self.write_arg(insn, insn.dst, v)?,
        }
        Ok(Flow::Next)
    }

    /// MOVZX/MOVSX.
    pub(super) fn exec_movx(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let v = self.read_arg(insn, insn.src)?;
        let v = if insn.op == Op::Movsx {
            width_of(insn.src).sign_extend(v)
        } else {
            v
        };
        self.write_arg(insn, insn.dst, v)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_lea(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let off = self.ea_offset(insn);
        self.write_arg(insn, insn.dst, off)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_xlat(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let seg = insn.seg_override.unwrap_or(SegReg::Ds);
        let bx = if insn.addr32 {
            self.state.reg(Gpr::Ebx)
        } else {
            self.state.reg(Gpr::Ebx) & 0xffff
        };
        let off = Self::ea_add(insn, bx, self.state.read_gpr(0, Width::W8));
        let v = self.read_u8(seg, off)?;
        self.state.write_gpr(0, Width::W8, u32::from(v));
        Ok(Flow::Next)
    }

    /// CBW/CWDE.
    pub(super) fn exec_cbw(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        if insn.op32 {
            let ax = self.state.read_gpr(0, Width::W16);
            self.state.write_gpr(0, Width::W32, Width::W16.sign_extend(ax));
        } else {
            let al = self.state.read_gpr(0, Width::W8);
            self.state.write_gpr(0, Width::W16, Width::W8.sign_extend(al));
        }
        Ok(Flow::Next)
    }

    /// CWD/CDQ.
    pub(super) fn exec_cwd(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        let acc = self.state.read_gpr(0, w);
        let fill = if acc & w.sign_bit() != 0 { w.mask() } else { 0 };
        self.state.write_gpr(Gpr::Edx as u8, w, fill);
        Ok(Flow::Next)
    }

    pub(super) fn exec_lahf(&mut self) -> Result<Flow, Fault> {
        let low = self.state.flags.rebuild() & 0xff;
        self.state.write_gpr(4, Width::W8, low | Eflags::RESERVED1.bits());
        Ok(Flow::Next)
    }

    pub(super) fn exec_sahf(&mut self) -> Result<Flow, Fault> {
        let ah = self.state.read_gpr(4, Width::W8);
        let mask = (Eflags::SF | Eflags::ZF | Eflags::AF | Eflags::PF | Eflags::CF).bits();
        self.state.flags.set_status(mask, ah);
        Ok(Flow::Next)
    }

    pub(super) fn exec_setcc(&mut self, insn: &Insn, cond: Cond) -> Result<Flow, Fault> {
        let v = u32::from(self.state.flags.cond(cond));
        self.write_arg(insn, insn.dst, v)?;
        Ok(Flow::Next)
    }

    /// CMC/CLC/STC/CLD/STD.
    pub(super) fn exec_flag_op(&mut self, op: Op) -> Result<Flow, Fault> {
        let flags = &mut self.state.flags;
        match op {
            Op::Cmc => {
                let cf = flags.get(Eflags::CF);
                flags.set(Eflags::CF, !cf);
            }
            Op::Clc => flags.set(Eflags::CF, false),
            Op::Stc => flags.set(Eflags::CF, true),
            Op::Cld => flags.set(Eflags::DF, false),
            Op::Std => flags.set(Eflags::DF, true),
            _ => return Err(Fault::ud()),
        }
        Ok(Flow::Next)
    }

    pub(super) fn exec_cli_sti(&mut self, op: Op) -> Result<Flow, Fault> {
        if !self.state.iopl_ok() {
            return Err(Fault::gp0());
        }
        if op == Op::Sti {
            // Interrupts are recognised only after the instruction following STI.
            if !self.state.flags.interrupts_enabled() {
                self.pending.inhibit_interrupts_for_one_instruction();
            }
            self.state.flags.set(Eflags::IF, true);
        } else {
            self.state.flags.set(Eflags::IF, false);
        }
        Ok(Flow::Next)
    }

    /// LDS/LES/LSS/LFS/LGS. The segment register is loaded before the
    /// general register, so a failed segment load leaves both unchanged.
    pub(super) fn exec_load_far(&mut self, insn: &Insn, seg: SegReg) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let (mseg, off) = self.mem_operand(insn, insn.src).ok_or_else(Fault::ud)?;
        let offset = self.read_mem(mseg, off, w)?;
        let selector = self.read_u16(mseg, Self::ea_add(insn, off, w.bytes()))?;
        self.load_segment(seg, selector)?;
        self.write_arg(insn, insn.dst, offset)?;
        if seg == SegReg::Ss {
            self.pending.inhibit_interrupts_for_one_instruction();
        }
        Ok(Flow::Next)
    }
}
