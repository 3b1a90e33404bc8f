//! Bit test, bit scan and byte swap.

use crate::decode::{Arg, BitOp, Insn, Op};
use crate::exceptions::Fault;
use crate::mem::{AccessType, CpuBus};
use crate::state::flags::Eflags;
use crate::vcpu::Vcpu;

use super::{width_of, Flow, Loc};

impl<B: CpuBus> Vcpu<B> {
    pub(super) fn exec_bit(&mut self, insn: &Insn, op: BitOp) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let bits = w.bits();
        let src = self.read_arg(insn, insn.src)?;

        let (loc, bit) = match self.mem_operand(insn, insn.dst) {
            // A register bit offset addresses memory beyond the operand; the
            // offset is signed.
            Some((seg, off)) if matches!(insn.src, Arg::Reg(_)) => {
                let offset = w.signed(src);
                let disp = (offset >> bits.trailing_zeros()) * i64::from(w.bytes());
                let addr = (i64::from(off) + disp) as u32;
                let addr = if insn.addr32 { addr } else { addr & 0xffff };
                let access = if op == BitOp::Bt {
                    AccessType::Read
                } else {
                    AccessType::Write
                };
                let v = self.validate(seg, addr, w.bytes(), access)?;
                (Loc::Checked(v, w), (offset as u32) & (bits - 1))
            }
            _ => {
                let loc = if op == BitOp::Bt {
                    match self.mem_operand(insn, insn.dst) {
                        Some((seg, off)) => {
                            let v = self.validate(seg, off, w.bytes(), AccessType::Read)?;
                            Loc::Checked(v, w)
                        }
                        None => self.locate(insn, insn.dst)?,
                    }
                } else {
                    self.locate(insn, insn.dst)?
                };
                (loc, src & (bits - 1))
            }
        };

        let value = self.load(loc)?;
        let set = value >> bit & 1 != 0;
        let new = match op {
            BitOp::Bt => None,
            BitOp::Bts => Some(value | (1 << bit)),
            BitOp::Btr => Some(value & !(1 << bit)),
            BitOp::Btc => Some(value ^ (1 << bit)),
        };
        if let Some(new) = new {
            self.store(loc, new)?;
        }
        let cf = if set { Eflags::CF.bits() } else { 0 };
        self.state.flags.set_status(Eflags::CF.bits(), cf);
        Ok(Flow::Next)
    }

    /// BSF/BSR. A zero source sets ZF and leaves the destination alone.
    pub(super) fn exec_bit_scan(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let src = self.read_arg(insn, insn.src)? & w.mask();
        if src == 0 {
            self.state.flags.set_status(Eflags::ZF.bits(), Eflags::ZF.bits());
            return Ok(Flow::Next);
        }
        let index = if insn.op == Op::Bsf {
            src.trailing_zeros()
        } else {
            31 - src.leading_zeros()
        };
        self.write_arg(insn, insn.dst, index)?;
        self.state.flags.set_status(Eflags::ZF.bits(), 0);
        Ok(Flow::Next)
    }

    pub(super) fn exec_bswap(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let v = self.read_arg(insn, insn.dst)?;
        self.write_arg(insn, insn.dst, v.swap_bytes())?;
        Ok(Flow::Next)
    }
}
