//! x87 instructions.
//!
//! Values are computed in `f64`. Every x87 exception is treated as masked:
//! the status word records it and the masked response is produced, #MF is
//! never raised. Integer stores round according to the control word.

use crate::decode::{FpuArith, FpuMem, FpuOp, Insn};
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::model::CpuFeatures;
use crate::state::fpu::{
    Ext80, FpuState, SW_B, SW_C1, SW_C2, SW_IE, SW_SF, SW_TOP_SHIFT, SW_ZE, TAG_EMPTY,
};
use crate::state::Cr0;
use crate::types::{SegReg, Width};
use crate::vcpu::Vcpu;

use super::Flow;

/// Rounding control field of the control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rounding {
    Nearest,
    Down,
    Up,
    Zero,
}

impl Rounding {
    fn from_cw(cw: u16) -> Self {
        match (cw >> 10) & 3 {
            0 => Rounding::Nearest,
            1 => Rounding::Down,
            2 => Rounding::Up,
            _ => Rounding::Zero,
        }
    }

    fn apply(self, v: f64) -> f64 {
        match self {
            Rounding::Nearest => {
                let r = v.round();
                if (v - v.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
                    r - v.signum()
                } else {
                    r
                }
            }
            Rounding::Down => v.floor(),
            Rounding::Up => v.ceil(),
            Rounding::Zero => v.trunc(),
        }
    }
}

fn arith(op: FpuArith, a: f64, b: f64) -> f64 {
    match op {
        FpuArith::Add => a + b,
        FpuArith::Mul => a * b,
        FpuArith::Sub => a - b,
        FpuArith::Subr => b - a,
        FpuArith::Div => a / b,
        FpuArith::Divr => b / a,
    }
}

/// Exception bits a masked arithmetic result raises.
fn arith_status(op: FpuArith, a: f64, b: f64, r: f64) -> u16 {
    if r.is_nan() && !a.is_nan() && !b.is_nan() {
        return SW_IE;
    }
    let (num, den) = match op {
        FpuArith::Div => (a, b),
        FpuArith::Divr => (b, a),
        _ => return 0,
    };
    if den == 0.0 && num != 0.0 && num.is_finite() {
        SW_ZE
    } else {
        0
    }
}

/// Packed BCD: 18 digits in bytes 0..9, sign in bit 7 of byte 9.
fn bcd_to_f64(bytes: [u8; 10]) -> f64 {
    let mut v = 0f64;
    for b in bytes[..9].iter().rev() {
        v = v * 100.0 + f64::from(b >> 4) * 10.0 + f64::from(b & 0xf);
    }
    if bytes[9] & 0x80 != 0 {
        -v
    } else {
        v
    }
}

fn f64_to_bcd(v: f64) -> Option<[u8; 10]> {
    if !v.is_finite() || v.abs() >= 1e18 {
        return None;
    }
    let mut out = [0u8; 10];
    let mut n = v.abs() as u64;
    for b in out[..9].iter_mut() {
        let lo = (n % 10) as u8;
        n /= 10;
        let hi = (n % 10) as u8;
        n /= 10;
        *b = (hi << 4) | lo;
    }
    if v.is_sign_negative() {
        out[9] = 0x80;
    }
    Some(out)
}

/// Condition codes for a compare: (C0, C2, C3).
fn compare(a: f64, b: f64) -> (bool, bool, bool) {
    if a.is_nan() || b.is_nan() {
        (true, true, true)
    } else if a < b {
        (true, false, false)
    } else if a == b {
        (false, false, true)
    } else {
        (false, false, false)
    }
}

impl<B: CpuBus> Vcpu<B> {
    /// Whether the x87 executes this instruction; `false` means the ESC
    /// opcode is a no-op on a machine without a coprocessor.
    fn fpu_gate(&self) -> Result<bool, Fault> {
        let cr0 = self.state.cr0;
        if !self.state.config.has(CpuFeatures::FPU) {
            return if cr0.contains(Cr0::EM) {
                Err(Fault::nm())
            } else {
                Ok(false)
            };
        }
        if cr0.intersects(Cr0::EM | Cr0::TS) {
            return Err(Fault::nm());
        }
        Ok(true)
    }

    pub(super) fn exec_wait(&mut self) -> Result<Flow, Fault> {
        if self.state.cr0.contains(Cr0::TS | Cr0::MP) {
            return Err(Fault::nm());
        }
        Ok(Flow::Next)
    }

    fn fpu(&mut self) -> &mut FpuState {
        &mut self.state.fpu
    }

    /// ST(i), with the stack-underflow response for an empty register.
    fn st(&mut self, i: u8) -> f64 {
        let fpu = self.fpu();
        if fpu.is_empty(i) {
            fpu.sw = (fpu.sw | SW_IE | SW_SF) & !SW_C1;
            return f64::NAN;
        }
        fpu.st(i)
    }

    fn raise(&mut self, bits: u16) {
        self.fpu().sw |= bits;
    }

    fn rounding(&self) -> Rounding {
        Rounding::from_cw(self.state.fpu.cw)
    }

    fn fpu_mem(&self, insn: &Insn) -> Result<(SegReg, u32), Fault> {
        self.mem_operand(insn, insn.dst).ok_or_else(Fault::ud)
    }

    fn sti_index(insn: &Insn) -> u8 {
        insn.modrm.map_or(1, |m| m.rm)
    }

    fn load_fpu_mem(&mut self, insn: &Insn, fmt: FpuMem) -> Result<f64, Fault> {
        let (seg, off) = self.fpu_mem(insn)?;
        Ok(match fmt {
            FpuMem::F32 => f64::from(f32::from_bits(self.read_u32(seg, off)?)),
            FpuMem::F64 => f64::from_bits(self.read_u64(seg, off)?),
            FpuMem::F80 => Ext80::from_bytes(self.read_u80(seg, off)?).to_f64(),
            FpuMem::I16 => f64::from(self.read_u16(seg, off)? as i16),
            FpuMem::I32 => f64::from(self.read_u32(seg, off)? as i32),
            FpuMem::I64 => self.read_u64(seg, off)? as i64 as f64,
            FpuMem::Bcd => bcd_to_f64(self.read_u80(seg, off)?),
        })
    }

    fn store_int(&mut self, v: f64, min: f64, max: f64, indefinite: i64) -> i64 {
        let r = self.rounding().apply(v);
        if r.is_nan() || r < min || r > max {
            self.raise(SW_IE);
            indefinite
        } else {
            r as i64
        }
    }

    fn store_fpu_mem(&mut self, insn: &Insn, fmt: FpuMem) -> Result<(), Fault> {
        let (seg, off) = self.fpu_mem(insn)?;
        let v = self.st(0);
        match fmt {
            FpuMem::F32 => self.write_u32(seg, off, (v as f32).to_bits()),
            FpuMem::F64 => self.write_u64(seg, off, v.to_bits()),
            FpuMem::F80 => {
                let raw = if self.state.fpu.is_empty(0) {
                    Ext80::from_f64(f64::NAN)
                } else {
                    let p = self.state.fpu.phys(0);
                    self.state.fpu.regs[p]
                };
                self.write_u80(seg, off, raw.to_bytes())
            }
            FpuMem::I16 => {
                let i = self.store_int(v, f64::from(i16::MIN), f64::from(i16::MAX), -0x8000);
                self.write_u16(seg, off, i as u16)
            }
            FpuMem::I32 => {
                let (lo, hi) = (f64::from(i32::MIN), f64::from(i32::MAX));
                let i = self.store_int(v, lo, hi, i64::from(i32::MIN));
                self.write_u32(seg, off, i as u32)
            }
            FpuMem::I64 => {
                let (lo, hi) = (-9.223_372_036_854_775_808e18, 9.223_372_036_854_774e18);
                let i = self.store_int(v, lo, hi, i64::MIN);
                self.write_u64(seg, off, i as u64)
            }
            FpuMem::Bcd => {
                let r = self.rounding().apply(v);
                let bytes = match f64_to_bcd(r) {
                    Some(b) => b,
                    None => {
                        self.raise(SW_IE);
                        [0, 0, 0, 0, 0, 0, 0, 0xc0, 0xff, 0xff]
                    }
                };
                self.write_u80(seg, off, bytes)
            }
        }
    }

    fn push_value(&mut self, v: f64) {
        self.fpu().push(v);
    }

    fn push_raw(&mut self, v: Ext80) {
        let fpu = self.fpu();
        fpu.top = (fpu.top + 7) & 7;
        if !fpu.is_empty(0) {
            fpu.sw |= SW_IE | SW_SF | SW_C1;
            fpu.set_st(0, f64::NAN);
            return;
        }
        fpu.set_st_raw(0, v);
    }

    fn set_compare(&mut self, a: f64, b: f64, signal_nan: bool) {
        let (c0, c2, c3) = compare(a, b);
        if c2 && signal_nan {
            self.raise(SW_IE);
        }
        self.fpu().set_condition(c0, false, c2, c3);
    }

    fn fxam(&mut self) {
        let fpu = self.fpu();
        let p = fpu.phys(0);
        let raw = fpu.regs[p];
        let c1 = raw.sign_exp & 0x8000 != 0;
        let exp = raw.sign_exp & 0x7fff;
        let (c3, c2, c0) = if fpu.tag_of(p) == TAG_EMPTY {
            (true, false, true)
        } else if exp == 0x7fff {
            if raw.mantissa << 1 == 0 {
                (false, true, true)
            } else {
                (false, false, true)
            }
        } else if exp == 0 && raw.mantissa == 0 {
            (true, false, false)
        } else if exp == 0 || raw.mantissa & (1 << 63) == 0 {
            (true, true, false)
        } else {
            (false, true, false)
        };
        fpu.set_condition(c0, c1, c2, c3);
    }

    // ---- environment -------------------------------------------------------

    fn env_bytes(insn: &Insn) -> u32 {
        if insn.op32 {
            28
        } else {
            14
        }
    }

    /// FNSTENV layout: CW, SW, TW then zeroed instruction/operand pointers.
    fn store_env(&mut self, insn: &Insn, seg: SegReg, off: u32) -> Result<(), Fault> {
        let fw = if insn.op32 { Width::W32 } else { Width::W16 };
        let words = [
            u32::from(self.state.fpu.cw) | if insn.op32 { 0xffff_0000 } else { 0 },
            u32::from(self.state.fpu.status_word()) | if insn.op32 { 0xffff_0000 } else { 0 },
            u32::from(self.state.fpu.tag) | if insn.op32 { 0xffff_0000 } else { 0 },
            0,
            0,
            0,
            0,
        ];
        for (i, w) in words.iter().enumerate() {
            let at = Self::ea_add(insn, off, i as u32 * fw.bytes());
            self.write_mem(seg, at, fw, *w)?;
        }
        Ok(())
    }

    fn load_env(&mut self, insn: &Insn, seg: SegReg, off: u32) -> Result<(), Fault> {
        let step = if insn.op32 { 4 } else { 2 };
        let cw = self.read_u16(seg, off)?;
        let sw = self.read_u16(seg, Self::ea_add(insn, off, step))?;
        let tag = self.read_u16(seg, Self::ea_add(insn, off, 2 * step))?;
        let fpu = self.fpu();
        fpu.cw = cw;
        fpu.top = ((sw >> SW_TOP_SHIFT) & 7) as u8;
        fpu.sw = sw & !(7 << SW_TOP_SHIFT);
        fpu.tag = tag;
        Ok(())
    }

    pub(super) fn exec_fpu(&mut self, insn: &Insn, op: FpuOp) -> Result<Flow, Fault> {
        if !self.fpu_gate()? {
            return Ok(Flow::Next);
        }
        match op {
            FpuOp::Invalid => return Err(Fault::ud()),
            FpuOp::Fld(FpuMem::F80) => {
                let (seg, off) = self.fpu_mem(insn)?;
                let raw = Ext80::from_bytes(self.read_u80(seg, off)?);
                self.push_raw(raw);
            }
            FpuOp::Fld(fmt) => {
                let v = self.load_fpu_mem(insn, fmt)?;
                self.push_value(v);
            }
            FpuOp::Fst(fmt) => self.store_fpu_mem(insn, fmt)?,
            FpuOp::Fstp(fmt) => {
                self.store_fpu_mem(insn, fmt)?;
                self.fpu().pop();
            }
            FpuOp::ArithMem(a, fmt) => {
                let b = self.load_fpu_mem(insn, fmt)?;
                let x = self.st(0);
                let r = arith(a, x, b);
                self.raise(arith_status(a, x, b, r));
                self.fpu().set_st(0, r);
            }
            FpuOp::ComMem(fmt) | FpuOp::ComPMem(fmt) => {
                let b = self.load_fpu_mem(insn, fmt)?;
                let x = self.st(0);
                self.set_compare(x, b, true);
                if matches!(op, FpuOp::ComPMem(_)) {
                    self.fpu().pop();
                }
            }
            FpuOp::Fldcw => {
                let (seg, off) = self.fpu_mem(insn)?;
                let cw = self.read_u16(seg, off)?;
                self.fpu().cw = cw;
            }
            FpuOp::Fnstcw => {
                let (seg, off) = self.fpu_mem(insn)?;
                let cw = self.state.fpu.cw;
                self.write_u16(seg, off, cw)?;
            }
            FpuOp::Fnstsw => {
                let (seg, off) = self.fpu_mem(insn)?;
                let sw = self.state.fpu.status_word();
                self.write_u16(seg, off, sw)?;
            }
            FpuOp::FnstswAx => {
                let sw = self.state.fpu.status_word();
                self.state.write_gpr(0, Width::W16, u32::from(sw));
            }
            FpuOp::Fldenv => {
                let (seg, off) = self.fpu_mem(insn)?;
                self.load_env(insn, seg, off)?;
            }
            FpuOp::Fnstenv => {
                let (seg, off) = self.fpu_mem(insn)?;
                self.store_env(insn, seg, off)?;
                self.fpu().cw |= 0x3f;
            }
            FpuOp::Fnsave => {
                let (seg, off) = self.fpu_mem(insn)?;
                // Check the whole area first so a fault leaves it untouched.
                let env = Self::env_bytes(insn);
                self.linear_address(seg, off, env + 80, crate::mem::AccessType::Write)?;
                self.store_env(insn, seg, off)?;
                for i in 0..8u8 {
                    let p = self.state.fpu.phys(i);
                    let raw = self.state.fpu.regs[p];
                    let at = Self::ea_add(insn, off, env + u32::from(i) * 10);
                    self.write_u80(seg, at, raw.to_bytes())?;
                }
                self.fpu().init();
            }
            FpuOp::Frstor => {
                let (seg, off) = self.fpu_mem(insn)?;
                let env = Self::env_bytes(insn);
                let mut regs = [Ext80::ZERO; 8];
                for (i, r) in regs.iter_mut().enumerate() {
                    let at = Self::ea_add(insn, off, env + i as u32 * 10);
                    *r = Ext80::from_bytes(self.read_u80(seg, at)?);
                }
                self.load_env(insn, seg, off)?;
                let fpu = self.fpu();
                for (i, r) in regs.into_iter().enumerate() {
                    let p = fpu.phys(i as u8);
                    fpu.regs[p] = r;
                }
            }
            FpuOp::ArithSt0(a) => {
                let i = Self::sti_index(insn);
                let (x, y) = (self.st(0), self.st(i));
                let r = arith(a, x, y);
                self.raise(arith_status(a, x, y, r));
                self.fpu().set_st(0, r);
            }
            FpuOp::ArithSti(a) | FpuOp::ArithStiPop(a) => {
                let i = Self::sti_index(insn);
                let (x, y) = (self.st(i), self.st(0));
                let r = arith(a, x, y);
                self.raise(arith_status(a, x, y, r));
                self.fpu().set_st(i, r);
                if matches!(op, FpuOp::ArithStiPop(_)) {
                    self.fpu().pop();
                }
            }
            FpuOp::FldSti => {
                let i = Self::sti_index(insn);
                let v = self.st(i);
                self.push_value(v);
            }
            FpuOp::FstSti | FpuOp::FstpSti => {
                let i = Self::sti_index(insn);
                let v = self.st(0);
                self.fpu().set_st(i, v);
                if op == FpuOp::FstpSti {
                    self.fpu().pop();
                }
            }
            FpuOp::Fxch => {
                let i = Self::sti_index(insn);
                let fpu = self.fpu();
                let (a, b) = (fpu.phys(0), fpu.phys(i));
                fpu.regs.swap(a, b);
                let (ta, tb) = (fpu.tag_of(a), fpu.tag_of(b));
                fpu.set_tag(a, tb);
                fpu.set_tag(b, ta);
            }
            FpuOp::FcomSti | FpuOp::FcompSti | FpuOp::FucomSti | FpuOp::FucompSti => {
                let i = Self::sti_index(insn);
                let (x, y) = (self.st(0), self.st(i));
                self.set_compare(x, y, matches!(op, FpuOp::FcomSti | FpuOp::FcompSti));
                if matches!(op, FpuOp::FcompSti | FpuOp::FucompSti) {
                    self.fpu().pop();
                }
            }
            FpuOp::Fcompp | FpuOp::Fucompp => {
                let (x, y) = (self.st(0), self.st(1));
                self.set_compare(x, y, op == FpuOp::Fcompp);
                self.fpu().pop();
                self.fpu().pop();
            }
            FpuOp::Ffree => {
                let i = Self::sti_index(insn);
                let fpu = self.fpu();
                let p = fpu.phys(i);
                fpu.set_tag(p, TAG_EMPTY);
            }
            FpuOp::Fchs => {
                let v = self.st(0);
                self.fpu().set_st(0, -v);
            }
            FpuOp::Fabs => {
                let v = self.st(0);
                self.fpu().set_st(0, v.abs());
            }
            FpuOp::Ftst => {
                let v = self.st(0);
                self.set_compare(v, 0.0, true);
            }
            FpuOp::Fxam => self.fxam(),
            FpuOp::Fld1 => self.push_value(1.0),
            FpuOp::Fldl2t => self.push_value(core::f64::consts::LOG2_10),
            FpuOp::Fldl2e => self.push_value(core::f64::consts::LOG2_E),
            FpuOp::Fldpi => self.push_value(core::f64::consts::PI),
            FpuOp::Fldlg2 => self.push_value(core::f64::consts::LOG10_2),
            FpuOp::Fldln2 => self.push_value(core::f64::consts::LN_2),
            FpuOp::Fldz => self.push_value(0.0),
            FpuOp::F2xm1 => {
                let v = self.st(0);
                self.fpu().set_st(0, v.exp2() - 1.0);
            }
            FpuOp::Fyl2x | FpuOp::Fyl2xp1 => {
                let (x, y) = (self.st(0), self.st(1));
                let x = if op == FpuOp::Fyl2xp1 { x + 1.0 } else { x };
                if x < 0.0 {
                    self.raise(SW_IE);
                } else if x == 0.0 {
                    self.raise(SW_ZE);
                }
                self.fpu().set_st(1, y * x.log2());
                self.fpu().pop();
            }
            FpuOp::Fptan => {
                let v = self.st(0);
                self.fpu().set_st(0, v.tan());
                self.push_value(1.0);
                self.fpu().sw &= !SW_C2;
            }
            FpuOp::Fpatan => {
                let (x, y) = (self.st(0), self.st(1));
                self.fpu().set_st(1, y.atan2(x));
                self.fpu().pop();
            }
            FpuOp::Fxtract => {
                let v = self.st(0);
                if v == 0.0 {
                    self.raise(SW_ZE);
                    self.fpu().set_st(0, f64::NEG_INFINITY);
                    self.push_value(v);
                } else {
                    let e = v.abs().log2().floor();
                    let sig = v / e.exp2();
                    self.fpu().set_st(0, e);
                    self.push_value(sig);
                }
            }
            FpuOp::Fprem | FpuOp::Fprem1 => {
                let (x, y) = (self.st(0), self.st(1));
                let q = if op == FpuOp::Fprem {
                    (x / y).trunc()
                } else {
                    Rounding::Nearest.apply(x / y)
                };
                let r = x - q * y;
                if r.is_nan() && !x.is_nan() && !y.is_nan() {
                    self.raise(SW_IE);
                }
                let qi = q.abs() as u64;
                self.fpu().set_st(0, r);
                self.fpu()
                    .set_condition(qi & 4 != 0, qi & 1 != 0, false, qi & 2 != 0);
            }
            FpuOp::Fdecstp => {
                let fpu = self.fpu();
                fpu.top = (fpu.top + 7) & 7;
            }
            FpuOp::Fincstp => {
                let fpu = self.fpu();
                fpu.top = (fpu.top + 1) & 7;
            }
            FpuOp::Fsqrt => {
                let v = self.st(0);
                if v < 0.0 {
                    self.raise(SW_IE);
                }
                self.fpu().set_st(0, v.sqrt());
            }
            FpuOp::Fsincos => {
                let v = self.st(0);
                self.fpu().set_st(0, v.sin());
                self.push_value(v.cos());
                self.fpu().sw &= !SW_C2;
            }
            FpuOp::Frndint => {
                let v = self.st(0);
                let r = self.rounding().apply(v);
                self.fpu().set_st(0, r);
            }
            FpuOp::Fscale => {
                let (x, y) = (self.st(0), self.st(1));
                let scaled = x * y.trunc().exp2();
                self.fpu().set_st(0, scaled);
            }
            FpuOp::Fsin | FpuOp::Fcos => {
                let v = self.st(0);
                let r = if op == FpuOp::Fsin { v.sin() } else { v.cos() };
                self.fpu().set_st(0, r);
                self.fpu().sw &= !SW_C2;
            }
            FpuOp::Fnop | FpuOp::Fignored => {}
            FpuOp::Fnclex => self.fpu().sw &= !(0xff | SW_B),
            FpuOp::Fninit => self.fpu().init(),
        }
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rounds_half_to_even() {
        assert_eq!(Rounding::Nearest.apply(2.5), 2.0);
        assert_eq!(Rounding::Nearest.apply(3.5), 4.0);
        assert_eq!(Rounding::Nearest.apply(-2.5), -2.0);
        assert_eq!(Rounding::Nearest.apply(2.4), 2.0);
        assert_eq!(Rounding::Down.apply(-1.5), -2.0);
        assert_eq!(Rounding::Up.apply(1.1), 2.0);
        assert_eq!(Rounding::Zero.apply(-1.9), -1.0);
    }

    #[test]
    fn packed_bcd_conversion() {
        let bytes = f64_to_bcd(-1234.0).unwrap();
        assert_eq!(&bytes[..3], &[0x34, 0x12, 0x00]);
        assert_eq!(bytes[9], 0x80);
        assert_eq!(bcd_to_f64(bytes), -1234.0);
        assert!(f64_to_bcd(1e18).is_none());
    }

    #[test]
    fn compare_sets_unordered_for_nan() {
        assert_eq!(compare(1.0, 2.0), (true, false, false));
        assert_eq!(compare(2.0, 2.0), (false, false, true));
        assert_eq!(compare(f64::NAN, 2.0), (true, true, true));
    }

    #[test]
    fn division_by_zero_reports_ze() {
        let r = arith(FpuArith::Div, 1.0, 0.0);
        assert!(r.is_infinite());
        assert_eq!(arith_status(FpuArith::Div, 1.0, 0.0, r), SW_ZE);
        let r = arith(FpuArith::Div, 0.0, 0.0);
        assert_eq!(arith_status(FpuArith::Div, 0.0, 0.0, r), SW_IE);
    }
}
