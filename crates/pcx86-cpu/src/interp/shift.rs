//! Shifts and rotates.

use crate::decode::{Insn, ShiftOp};
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::model::CpuModel;
use crate::state::flags::{Eflags, FlagOp, PendingFlags};
use crate::types::Width;
use crate::vcpu::Vcpu;

use super::alu::szp;
use super::{width_of, Flow};

/// Flag effect of a shift or rotate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftFlags {
    /// SHL/SHR/SAR: the full status set, deferred.
    Pending(PendingFlags),
    /// Rotates only touch CF and OF.
    Rotate { cf: bool, of: bool },
}

/// Shift count as the CPU sees it. The 8088 uses all eight bits of CL;
/// later parts mask to five.
#[inline]
pub fn mask_count(model: CpuModel, raw: u32) -> u32 {
    if model == CpuModel::I8088 {
        raw & 0xff
    } else {
        raw & 31
    }
}

#[inline]
fn msb(w: Width, v: u32) -> bool {
    v & w.sign_bit() != 0
}

/// Apply a shift or rotate. `count` is already masked; `None` means the
/// operation is a no-op that leaves flags and destination untouched.
pub fn shift(op: ShiftOp, w: Width, value: u32, count: u32, cf: bool) -> Option<(u32, ShiftFlags)> {
    if count == 0 {
        return None;
    }
    let bits = w.bits();
    let mask = w.mask();
    let v = value & mask;
    let out = match op {
        ShiftOp::Rol => {
            let n = count % bits;
            let r = if n == 0 {
                v
            } else {
                ((v << n) | (v >> (bits - n))) & mask
            };
            let cf = r & 1 != 0;
            (r, ShiftFlags::Rotate { cf, of: msb(w, r) ^ cf })
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let r = if n == 0 {
                v
            } else {
                ((v >> n) | (v << (bits - n))) & mask
            };
            let of = msb(w, r) ^ (r & (w.sign_bit() >> 1) != 0);
            (r, ShiftFlags::Rotate { cf: msb(w, r), of })
        }
        ShiftOp::Rcl => {
            // Rotate the (bits + 1)-wide value CF:dest.
            let width = bits + 1;
            let n = count % width;
            let wide = (u64::from(cf) << bits) | u64::from(v);
            let all = (1u64 << width) - 1;
            let rotated = if n == 0 {
                wide
            } else {
                ((wide << n) | (wide >> (width - n))) & all
            };
            let r = rotated as u32 & mask;
            let cf = rotated >> bits & 1 != 0;
            (r, ShiftFlags::Rotate { cf, of: msb(w, r) ^ cf })
        }
        ShiftOp::Rcr => {
            let width = bits + 1;
            let n = count % width;
            let wide = (u64::from(cf) << bits) | u64::from(v);
            let all = (1u64 << width) - 1;
            let rotated = if n == 0 {
                wide
            } else {
                ((wide >> n) | (wide << (width - n))) & all
            };
            let r = rotated as u32 & mask;
            let cf = rotated >> bits & 1 != 0;
            let of = msb(w, r) ^ (r & (w.sign_bit() >> 1) != 0);
            (r, ShiftFlags::Rotate { cf, of })
        }
        ShiftOp::Shl | ShiftOp::Sal => {
            let r = if count >= bits { 0 } else { (v << count) & mask };
            let f = PendingFlags::new(FlagOp::Shl, w, v, count, r);
            (r, ShiftFlags::Pending(f))
        }
        ShiftOp::Shr => {
            let r = if count >= bits { 0 } else { v >> count };
            let f = PendingFlags::new(FlagOp::Shr, w, v, count, r);
            (r, ShiftFlags::Pending(f))
        }
        ShiftOp::Sar => {
            let signed = w.sign_extend(v) as i32;
            let r = (signed >> count.min(31)) as u32 & mask;
            let f = PendingFlags::new(FlagOp::Sar, w, v, count, r);
            (r, ShiftFlags::Pending(f))
        }
    };
    Some(out)
}

/// SHLD/SHRD. `count` is already masked to five bits. Returns the result and
/// the complete status bits.
pub fn double_shift(left: bool, w: Width, dst: u32, src: u32, count: u32) -> Option<(u32, u32)> {
    if count == 0 {
        return None;
    }
    let bits = w.bits();
    let mask = u64::from(w.mask());
    let (dst, src) = (u64::from(dst) & mask, u64::from(src) & mask);
    let (r, cf) = if left {
        let wide = (dst << bits) | src;
        let r = ((wide << count) >> bits) & mask;
        let cf = (wide >> (2 * bits - count)) & 1 != 0;
        (r as u32, cf)
    } else {
        let wide = (src << bits) | dst;
        let r = (wide >> count) & mask;
        let cf = (wide >> (count - 1)) & 1 != 0;
        (r as u32, cf)
    };
    let mut status = szp(w, r);
    if cf {
        status |= Eflags::CF.bits();
    }
    if msb(w, r) != msb(w, dst as u32) {
        status |= Eflags::OF.bits();
    }
    Some((r, status))
}

impl<B: CpuBus> Vcpu<B> {
    pub(super) fn exec_shift(&mut self, insn: &Insn, op: ShiftOp) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let raw = self.read_arg(insn, insn.src)?;
        let count = mask_count(self.state.model(), raw);
        let loc = self.locate(insn, insn.dst)?;
        let value = self.load(loc)?;
        let cf = matches!(op, ShiftOp::Rcl | ShiftOp::Rcr) && self.state.flags.get(Eflags::CF);
        let Some((r, flags)) = shift(op, w, value, count, cf) else {
            return Ok(Flow::Next);
        };
        self.store(loc, r)?;
        match flags {
            ShiftFlags::Pending(p) => self.state.flags.set_pending(p),
            ShiftFlags::Rotate { cf, of } => {
                let mut bits = 0;
                if cf {
                    bits |= Eflags::CF.bits();
                }
                if of {
                    bits |= Eflags::OF.bits();
                }
                self.state
                    .flags
                    .set_status((Eflags::CF | Eflags::OF).bits(), bits);
            }
        }
        Ok(Flow::Next)
    }

    pub(super) fn exec_double_shift(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let count = self.read_arg(insn, insn.src2)? & 31;
        let src = self.read_arg(insn, insn.src)?;
        let loc = self.locate(insn, insn.dst)?;
        let dst = self.load(loc)?;
        let left = insn.op == crate::decode::Op::Shld;
        if let Some((r, status)) = double_shift(left, w, dst, src, count) {
            self.store(loc, r)?;
            let mask = crate::state::flags::STATUS_MASK;
            self.state.flags.set_status(mask, status);
        }
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(f: ShiftFlags) -> (bool, bool) {
        match f {
            ShiftFlags::Pending(p) => {
                let b = p.status_bits();
                (b & Eflags::CF.bits() != 0, b & Eflags::OF.bits() != 0)
            }
            ShiftFlags::Rotate { cf, of } => (cf, of),
        }
    }

    #[test]
    fn zero_count_is_a_no_op() {
        assert_eq!(shift(ShiftOp::Shl, Width::W32, 5, 0, true), None);
        assert_eq!(mask_count(CpuModel::I386, 32), 0);
        assert_eq!(mask_count(CpuModel::I8088, 32), 32);
    }

    #[test]
    fn count_33_is_one_on_386() {
        let count = mask_count(CpuModel::I386, 33);
        let (r, f) = shift(ShiftOp::Shl, Width::W32, 0x8000_0001, count, false).unwrap();
        assert_eq!(r, 2);
        assert_eq!(status(f), (true, true));
    }

    #[test]
    fn unmasked_8088_count_clears_a_byte() {
        let count = mask_count(CpuModel::I8088, 9);
        let (r, f) = shift(ShiftOp::Shl, Width::W8, 0xff, count, false).unwrap();
        assert_eq!(r, 0);
        assert!(!status(f).0);
        let (r, _) = shift(ShiftOp::Shr, Width::W16, 0xffff, 40, false).unwrap();
        assert_eq!(r, 0);
    }

    #[test]
    fn rotates_through_carry() {
        let (r, f) = shift(ShiftOp::Rcl, Width::W8, 0x80, 1, false).unwrap();
        assert_eq!(r, 0);
        assert_eq!(status(f), (true, true));
        let (r, f) = shift(ShiftOp::Rcr, Width::W8, 0x01, 1, true).unwrap();
        assert_eq!(r, 0x80);
        assert!(status(f).0);
        // Nine-bit rotate by nine restores the operand.
        let (r, f) = shift(ShiftOp::Rcl, Width::W8, 0x5a, 9, true).unwrap();
        assert_eq!(r, 0x5a);
        assert!(status(f).0);
    }

    #[test]
    fn plain_rotates() {
        assert_eq!(shift(ShiftOp::Rol, Width::W16, 0x8001, 1, false).unwrap().0, 0x0003);
        assert_eq!(shift(ShiftOp::Ror, Width::W32, 1, 1, false).unwrap().0, 0x8000_0000);
        let (r, f) = shift(ShiftOp::Sar, Width::W8, 0x80, 7, false).unwrap();
        assert_eq!(r, 0xff);
        assert_eq!(status(f), (false, false));
    }

    #[test]
    fn double_shifts() {
        let (r, st) = double_shift(true, Width::W32, 0x0000_0001, 0x8000_0000, 1).unwrap();
        assert_eq!(r, 3);
        assert_eq!(st & Eflags::CF.bits(), 0);
        let (r, st) = double_shift(false, Width::W16, 0x0001, 0xffff, 4).unwrap();
        assert_eq!(r, 0xf000);
        assert_eq!(st & Eflags::CF.bits(), 0);
        assert_ne!(st & Eflags::SF.bits(), 0);
        assert_eq!(double_shift(true, Width::W32, 1, 2, 0), None);
    }
}
