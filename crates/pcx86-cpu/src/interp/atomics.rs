//! Exchange and compare-exchange. A single virtual CPU executes these
//! atomically by construction; LOCK only affects decoding.

use crate::decode::{AluOp, Insn};
use crate::exceptions::Fault;
use crate::mem::{AccessType, CpuBus};
use crate::state::flags::Eflags;
use crate::types::{Gpr, Width};
use crate::vcpu::Vcpu;

use super::alu::alu;
use super::{width_of, Flow};

impl<B: CpuBus> Vcpu<B> {
    /// XCHG. The memory operand is written before the register.
    pub(super) fn exec_xchg(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let loc = self.locate(insn, insn.dst)?;
        let a = self.load(loc)?;
        let b = self.read_arg(insn, insn.src)?;
        self.store(loc, b)?;
        self.write_arg(insn, insn.src, a)?;
        Ok(Flow::Next)
    }

    /// CMPXCHG. On mismatch the accumulator takes the destination and the
    /// destination is written back unchanged.
    pub(super) fn exec_cmpxchg(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let loc = self.locate(insn, insn.dst)?;
        let dest = self.load(loc)?;
        let acc = self.state.read_gpr(0, w);
        let (_, flags) = alu(AluOp::Cmp, w, acc, dest, false);
        self.state.flags.set_pending(flags);
        if acc == dest {
            let src = self.read_arg(insn, insn.src)?;
            self.store(loc, src)?;
        } else {
            self.state.write_gpr(0, w, dest);
            self.store(loc, dest)?;
        }
        Ok(Flow::Next)
    }

    pub(super) fn exec_cmpxchg8b(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let (seg, off) = self.mem_operand(insn, insn.dst).ok_or_else(Fault::ud)?;
        let v = self.validate(seg, off, 8, AccessType::Write)?;
        let current = self.read_validated(&v);
        let expected =
            (u64::from(self.state.reg(Gpr::Edx)) << 32) | u64::from(self.state.reg(Gpr::Eax));
        let zf = current == expected;
        if zf {
            let new =
                (u64::from(self.state.reg(Gpr::Ecx)) << 32) | u64::from(self.state.reg(Gpr::Ebx));
            self.write_validated(&v, new);
        } else {
            self.state.set_reg(Gpr::Eax, current as u32);
            self.state.set_reg(Gpr::Edx, (current >> 32) as u32);
            self.write_validated(&v, current);
        }
        let bits = if zf { Eflags::ZF.bits() } else { 0 };
        self.state.flags.set_status(Eflags::ZF.bits(), bits);
        Ok(Flow::Next)
    }

    /// XADD: the source register receives the old destination.
    pub(super) fn exec_xadd(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let loc = self.locate(insn, insn.dst)?;
        let dest = self.load(loc)?;
        let src = self.read_arg(insn, insn.src)?;
        let (sum, flags) = alu(AluOp::Add, w, dest, src, false);
        self.write_arg(insn, insn.src, dest)?;
        self.store(loc, sum)?;
        self.state.flags.set_pending(flags);
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use crate::mem::FlatTestBus;
    use crate::model::{CpuConfig, CpuModel};
    use crate::state::flags::Eflags;
    use crate::types::{Gpr, Width};
    use crate::vcpu::Vcpu;

    fn run(code: &[u8], setup: impl FnOnce(&mut Vcpu<FlatTestBus>)) -> Vcpu<FlatTestBus> {
        let mut bus = FlatTestBus::new(0x20000);
        bus.load(0x1000, code);
        let mut vcpu = Vcpu::new(CpuConfig::new(CpuModel::Pentium), bus);
        vcpu.state.load_seg_real(crate::types::SegReg::Cs, 0x100);
        vcpu.state.eip = 0;
        setup(&mut vcpu);
        let insn = vcpu.fetch_decode(0).unwrap();
        vcpu.state.eip = u32::from(insn.len);
        vcpu.execute(&insn).unwrap();
        vcpu
    }

    #[test]
    fn cmpxchg_match_stores_source() {
        // cmpxchg [0x200], ebx (32-bit operand via 66 prefix)
        let mut v = run(&[0x66, 0x0f, 0xb1, 0x1e, 0x00, 0x02], |v| {
            v.state.set_reg(Gpr::Eax, 0x10);
            v.state.set_reg(Gpr::Ebx, 0x20);
            v.bus.load(0x200, &0x10u32.to_le_bytes());
        });
        assert_eq!(v.bus.read_u32(0x200), 0x20);
        assert_eq!(v.state.reg(Gpr::Eax), 0x10);
        assert!(v.state.flags.get(Eflags::ZF));
    }

    #[test]
    fn cmpxchg_mismatch_loads_accumulator() {
        let mut v = run(&[0x66, 0x0f, 0xb1, 0x1e, 0x00, 0x02], |v| {
            v.state.set_reg(Gpr::Eax, 0x11);
            v.state.set_reg(Gpr::Ebx, 0x20);
            v.bus.load(0x200, &0x10u32.to_le_bytes());
        });
        assert_eq!(v.bus.read_u32(0x200), 0x10);
        assert_eq!(v.state.reg(Gpr::Eax), 0x10);
        assert!(!v.state.flags.get(Eflags::ZF));
    }

    #[test]
    fn xadd_swaps_then_adds() {
        // xadd al, bl
        let mut v = run(&[0x0f, 0xc0, 0xd8], |v| {
            v.state.write_gpr(0, Width::W8, 0xff);
            v.state.write_gpr(3, Width::W8, 0x01);
        });
        assert_eq!(v.state.read_gpr(0, Width::W8), 0x00);
        assert_eq!(v.state.read_gpr(3, Width::W8), 0xff);
        assert!(v.state.flags.get(Eflags::CF));
    }

    #[test]
    fn cmpxchg8b_compares_edx_eax() {
        // cmpxchg8b [0x300]
        let v = run(&[0x0f, 0xc7, 0x0e, 0x00, 0x03], |v| {
            v.state.set_reg(Gpr::Edx, 1);
            v.state.set_reg(Gpr::Eax, 2);
            v.state.set_reg(Gpr::Ecx, 3);
            v.state.set_reg(Gpr::Ebx, 4);
            v.bus.load(0x300, &0x0000_0001_0000_0002u64.to_le_bytes());
        });
        assert_eq!(v.bus.read_u32(0x300), 4);
        assert_eq!(v.bus.read_u32(0x304), 3);
    }
}
