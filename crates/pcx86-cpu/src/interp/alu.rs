//! Integer arithmetic.
//!
//! The pure functions at the top compute a result together with the deferred
//! flags record it leaves behind. The translator calls the same functions, so
//! both execution paths produce identical flag state.

use crate::decode::{AluOp, Insn, MulOp};
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::model::CpuModel;
use crate::state::flags::{parity_even, Eflags, FlagOp, PendingFlags};
use crate::types::{Gpr, Width};
use crate::vcpu::Vcpu;

use super::{width_of, Flow};

/// Two-operand ALU operation. `carry` is CF for ADC/SBB and ignored otherwise.
/// CMP returns the difference; callers discard it.
pub fn alu(op: AluOp, width: Width, a: u32, b: u32, carry: bool) -> (u32, PendingFlags) {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let (result, kind) = match op {
        AluOp::Add => (a.wrapping_add(b), FlagOp::Add),
        AluOp::Adc => (a.wrapping_add(b).wrapping_add(u32::from(carry)), FlagOp::Adc),
        AluOp::Sub | AluOp::Cmp => (a.wrapping_sub(b), FlagOp::Sub),
        AluOp::Sbb => (a.wrapping_sub(b).wrapping_sub(u32::from(carry)), FlagOp::Sbb),
        AluOp::And => (a & b, FlagOp::Logic),
        AluOp::Or => (a | b, FlagOp::Logic),
        AluOp::Xor => (a ^ b, FlagOp::Logic),
    };
    let result = result & mask;
    (result, PendingFlags::new(kind, width, a, b, result).with_carry(carry))
}

/// INC; `cf` is the carry flag to preserve.
pub fn inc(width: Width, a: u32, cf: bool) -> (u32, PendingFlags) {
    let r = a.wrapping_add(1) & width.mask();
    (r, PendingFlags::new(FlagOp::Inc, width, a, 1, r).with_carry(cf))
}

/// DEC; `cf` is the carry flag to preserve.
pub fn dec(width: Width, a: u32, cf: bool) -> (u32, PendingFlags) {
    let r = a.wrapping_sub(1) & width.mask();
    (r, PendingFlags::new(FlagOp::Dec, width, a, 1, r).with_carry(cf))
}

pub fn neg(width: Width, a: u32) -> (u32, PendingFlags) {
    let r = 0u32.wrapping_sub(a) & width.mask();
    (r, PendingFlags::new(FlagOp::Neg, width, a & width.mask(), 0, r))
}

/// SF/ZF/PF of a result, as status bits.
pub fn szp(width: Width, r: u32) -> u32 {
    let r = r & width.mask();
    let mut bits = 0;
    if r == 0 {
        bits |= Eflags::ZF.bits();
    }
    if r & width.sign_bit() != 0 {
        bits |= Eflags::SF.bits();
    }
    if parity_even(r as u8) {
        bits |= Eflags::PF.bits();
    }
    bits
}

impl<B: CpuBus> Vcpu<B> {
    pub(super) fn exec_alu(&mut self, insn: &Insn, op: AluOp) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let b = self.read_arg(insn, insn.src)?;
        let carry = matches!(op, AluOp::Adc | AluOp::Sbb) && self.state.flags.get(Eflags::CF);
        if op == AluOp::Cmp {
            let a = self.read_arg(insn, insn.dst)?;
            let (_, flags) = alu(op, w, a, b, carry);
            self.state.flags.set_pending(flags);
            return Ok(Flow::Next);
        }
        let loc = self.locate(insn, insn.dst)?;
        let a = self.load(loc)?;
        let (r, flags) = alu(op, w, a, b, carry);
        self.store(loc, r)?;
        self.state.flags.set_pending(flags);
        Ok(Flow::Next)
    }

    pub(super) fn exec_test(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let a = self.read_arg(insn, insn.dst)?;
        let b = self.read_arg(insn, insn.src)?;
        let (_, flags) = alu(AluOp::And, w, a, b, false);
        self.state.flags.set_pending(flags);
        Ok(Flow::Next)
    }

    pub(super) fn exec_inc_dec(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let loc = self.locate(insn, insn.dst)?;
        let a = self.load(loc)?;
        let cf = self.state.flags.get(Eflags::CF);
        let (r, flags) = if insn.op == crate::decode::Op::Inc {
            inc(w, a, cf)
        } else {
            dec(w, a, cf)
        };
        self.store(loc, r)?;
        self.state.flags.set_pending(flags);
        Ok(Flow::Next)
    }

    pub(super) fn exec_not(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let loc = self.locate(insn, insn.dst)?;
        let a = self.load(loc)?;
        self.store(loc, !a)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_neg(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let loc = self.locate(insn, insn.dst)?;
        let a = self.load(loc)?;
        let (r, flags) = neg(w, a);
        self.store(loc, r)?;
        self.state.flags.set_pending(flags);
        Ok(Flow::Next)
    }

    fn set_mul_flags(&mut self, overflow: bool, low: u32, w: Width) {
        let mut bits = szp(w, low);
        if overflow {
            bits |= (Eflags::CF | Eflags::OF).bits();
        }
        let mask =
            (Eflags::CF | Eflags::OF | Eflags::SF | Eflags::ZF | Eflags::PF | Eflags::AF).bits();
        self.state.flags.set_status(mask, bits);
    }

    /// One-operand MUL/IMUL/DIV/IDIV on the accumulator.
    pub(super) fn exec_mul_div(&mut self, insn: &Insn, op: MulOp) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let src = self.read_arg(insn, insn.dst)?;
        let bits = w.bits();
        let mask = u64::from(w.mask());

        // Accumulator pair: AX for bytes, DX:AX for words, EDX:EAX for dwords.
        let (lo, hi) = match w {
            Width::W8 => (self.state.read_gpr(0, Width::W8), self.state.read_gpr(4, Width::W8)),
            _ => (
                self.state.read_gpr(Gpr::Eax as u8, w),
                self.state.read_gpr(Gpr::Edx as u8, w),
            ),
        };
        let wide = (u64::from(hi) << bits) | u64::from(lo);
        let store_pair = |vcpu: &mut Self, lo: u64, hi: u64| match w {
            Width::W8 => {
                let ax = ((hi as u32 & 0xff) << 8) | (lo as u32 & 0xff);
                vcpu.state.write_gpr(0, Width::W16, ax)
            }
            _ => {
                vcpu.state.write_gpr(Gpr::Eax as u8, w, lo as u32);
                vcpu.state.write_gpr(Gpr::Edx as u8, w, hi as u32);
            }
        };

        match op {
            MulOp::Mul => {
                let product = u64::from(lo) * u64::from(src);
                store_pair(self, product & mask, product >> bits);
                self.set_mul_flags(product >> bits != 0, product as u32, w);
            }
            MulOp::Imul => {
                let product = w.signed(lo) * w.signed(src);
                let p = product as u64;
                store_pair(self, p & mask, (p >> bits) & mask);
                let fits = w.signed(product as u32) == product;
                self.set_mul_flags(!fits, product as u32, w);
            }
            MulOp::Div => {
                if src == 0 {
                    return Err(Fault::de());
                }
                let q = wide / u64::from(src);
                let r = wide % u64::from(src);
                if q > mask {
                    return Err(Fault::de());
                }
                store_pair(self, q, r);
            }
            MulOp::Idiv => {
                if src == 0 {
                    return Err(Fault::de());
                }
                let dividend = if bits == 32 {
                    wide as i64
                } else {
                    // Sign-extend the double-width dividend.
                    let shift = 64 - 2 * bits;
                    ((wide << shift) as i64) >> shift
                };
                let divisor = w.signed(src);
                let q = dividend.wrapping_div(divisor);
                let r = dividend.wrapping_rem(divisor);
                let min = -(1i64 << (bits - 1));
                let max = (1i64 << (bits - 1)) - 1;
                // The 8088 also rejects the most negative quotient.
                let low_bound = if self.state.model() == CpuModel::I8088 { min + 1 } else { min };
                if q < low_bound || q > max {
                    return Err(Fault::de());
                }
                store_pair(self, q as u64 & mask, r as u64 & mask);
            }
        }
        Ok(Flow::Next)
    }

    /// Two- and three-operand IMUL.
    pub(super) fn exec_imul(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let (a, b) = if insn.op == crate::decode::Op::Imul3 {
            (self.read_arg(insn, insn.src)?, self.read_arg(insn, insn.src2)?)
        } else {
            (self.read_arg(insn, insn.dst)?, self.read_arg(insn, insn.src)?)
        };
        let product = w.signed(a) * w.signed(b);
        let fits = w.signed(product as u32) == product;
        self.write_arg(insn, insn.dst, product as u32)?;
        self.set_mul_flags(!fits, product as u32, w);
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::flags::STATUS_MASK;

    fn flags(p: PendingFlags) -> u32 {
        p.status_bits() & STATUS_MASK
    }

    #[test]
    fn add_carry_and_overflow_per_width() {
        let (r, f) = alu(AluOp::Add, Width::W8, 0xff, 1, false);
        assert_eq!(r, 0);
        assert_eq!(
            flags(f) & (Eflags::CF | Eflags::ZF | Eflags::OF).bits(),
            (Eflags::CF | Eflags::ZF).bits()
        );

        let (r, f) = alu(AluOp::Add, Width::W16, 0x7fff, 1, false);
        assert_eq!(r, 0x8000);
        assert_ne!(flags(f) & Eflags::OF.bits(), 0);
        assert_eq!(flags(f) & Eflags::CF.bits(), 0);
    }

    #[test]
    fn sbb_borrows_through_carry() {
        let (r, f) = alu(AluOp::Sbb, Width::W32, 0, 0, true);
        assert_eq!(r, 0xffff_ffff);
        assert_ne!(flags(f) & Eflags::CF.bits(), 0);
        let (r, f) = alu(AluOp::Adc, Width::W8, 0x7f, 0, true);
        assert_eq!(r, 0x80);
        assert_ne!(flags(f) & Eflags::OF.bits(), 0);
    }

    #[test]
    fn logic_clears_cf_and_of() {
        let (r, f) = alu(AluOp::Xor, Width::W32, 0x8000_0000, 0, false);
        assert_eq!(r, 0x8000_0000);
        assert_eq!(flags(f) & (Eflags::CF | Eflags::OF).bits(), 0);
        assert_ne!(flags(f) & Eflags::SF.bits(), 0);
    }

    #[test]
    fn neg_of_zero_clears_carry() {
        let (r, f) = neg(Width::W16, 0);
        assert_eq!(r, 0);
        assert_eq!(flags(f) & Eflags::CF.bits(), 0);
        let (r, f) = neg(Width::W8, 0x80);
        assert_eq!(r, 0x80);
        assert_ne!(flags(f) & (Eflags::CF | Eflags::OF).bits(), 0);
    }
}
