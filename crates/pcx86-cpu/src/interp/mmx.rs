//! MMX instructions. The eight 64-bit MMX registers alias the x87 mantissas.

use crate::decode::{Arg, Insn, Lane, MmxOp, Sat};
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::state::Cr0;
use crate::types::Width;
use crate::vcpu::Vcpu;

use super::Flow;

impl Lane {
    fn bits(self) -> u32 {
        match self {
            Lane::B => 8,
            Lane::W => 16,
            Lane::D => 32,
            Lane::Q => 64,
        }
    }
}

#[inline]
fn lane_mask(bits: u32) -> u64 {
    if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[inline]
fn sext(v: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

/// Apply `f` lane by lane.
fn lanewise(a: u64, b: u64, lane: Lane, f: impl Fn(u64, u64) -> u64) -> u64 {
    let bits = lane.bits();
    let mask = lane_mask(bits);
    let mut out = 0u64;
    let mut shift = 0;
    while shift < 64 {
        let r = f((a >> shift) & mask, (b >> shift) & mask) & mask;
        out |= r << shift;
        shift += bits;
    }
    out
}

fn saturating(lane: Lane, sat: Sat, a: u64, b: u64, sub: bool) -> u64 {
    let bits = lane.bits();
    let mask = lane_mask(bits);
    lanewise(a, b, lane, |x, y| match sat {
        Sat::Wrap => {
            if sub {
                x.wrapping_sub(y)
            } else {
                x.wrapping_add(y)
            }
        }
        Sat::Signed => {
            let (x, y) = (sext(x, bits), sext(y, bits));
            let r = if sub { x - y } else { x + y };
            let max = (1i64 << (bits - 1)) - 1;
            let min = -(1i64 << (bits - 1));
            r.clamp(min, max) as u64
        }
        Sat::Unsigned => {
            let r = if sub { x as i64 - y as i64 } else { (x + y) as i64 };
            r.clamp(0, mask as i64) as u64
        }
    })
}

fn shift_lanes(lane: Lane, v: u64, count: u64, kind: MmxOp) -> u64 {
    let bits = lane.bits();
    lanewise(v, 0, lane, |x, _| match kind {
        MmxOp::Psll(_) if count >= u64::from(bits) => 0,
        MmxOp::Psll(_) => x << count,
        MmxOp::Psrl(_) if count >= u64::from(bits) => 0,
        MmxOp::Psrl(_) => x >> count,
        _ => {
            let c = count.min(u64::from(bits) - 1);
            (sext(x, bits) >> c) as u64
        }
    })
}

fn words(v: u64) -> [i64; 4] {
    [0, 1, 2, 3].map(|i| sext(v >> (i * 16), 16))
}

fn pack(a: u64, b: u64, from_bits: u32, to_bits: u32, unsigned: bool) -> u64 {
    let n = 64 / from_bits;
    let (min, max) = if unsigned {
        (0, (1i64 << to_bits) - 1)
    } else {
        (-(1i64 << (to_bits - 1)), (1i64 << (to_bits - 1)) - 1)
    };
    let mut out = 0u64;
    for (k, src) in [a, b].into_iter().enumerate() {
        for i in 0..n {
            let lane = sext(src >> (i * from_bits), from_bits).clamp(min, max);
            let v = lane as u64 & lane_mask(to_bits);
            out |= v << ((k as u32 * n + i) * to_bits);
        }
    }
    out
}

fn unpack(a: u64, b: u64, lane: Lane, high: bool) -> u64 {
    let bits = lane.bits();
    let mask = lane_mask(bits);
    let n = 32 / bits;
    let base = if high { 32 } else { 0 };
    let mut out = 0u64;
    for i in 0..n {
        let x = (a >> (base + i * bits)) & mask;
        let y = (b >> (base + i * bits)) & mask;
        out |= x << (2 * i * bits);
        out |= y << ((2 * i + 1) * bits);
    }
    out
}

/// Pure MMX data operation on `(dest, src)`.
pub fn mmx_op(op: MmxOp, a: u64, b: u64) -> u64 {
    match op {
        MmxOp::MovdLoad | MmxOp::MovdStore | MmxOp::MovqLoad | MmxOp::MovqStore => b,
        MmxOp::Padd(l, s) => saturating(l, s, a, b, false),
        MmxOp::Psub(l, s) => saturating(l, s, a, b, true),
        MmxOp::Pcmpeq(l) => lanewise(a, b, l, |x, y| if x == y { u64::MAX } else { 0 }),
        MmxOp::Pcmpgt(l) => {
            let bits = l.bits();
            lanewise(a, b, l, |x, y| {
                if sext(x, bits) > sext(y, bits) {
                    u64::MAX
                } else {
                    0
                }
            })
        }
        MmxOp::Pand => a & b,
        MmxOp::Pandn => !a & b,
        MmxOp::Por => a | b,
        MmxOp::Pxor => a ^ b,
        MmxOp::Psll(l) | MmxOp::Psrl(l) | MmxOp::Psra(l) => shift_lanes(l, a, b, op),
        MmxOp::Pmullw => lanewise(a, b, Lane::W, |x, y| (sext(x, 16) * sext(y, 16)) as u64),
        MmxOp::Pmulhw => lanewise(a, b, Lane::W, |x, y| ((sext(x, 16) * sext(y, 16)) >> 16) as u64),
        MmxOp::Pmaddwd => {
            let (x, y) = (words(a), words(b));
            let lo = (x[0] * y[0] + x[1] * y[1]) as u64 & 0xffff_ffff;
            let hi = (x[2] * y[2] + x[3] * y[3]) as u64 & 0xffff_ffff;
            lo | (hi << 32)
        }
        MmxOp::Packsswb => pack(a, b, 16, 8, false),
        MmxOp::Packssdw => pack(a, b, 32, 16, false),
        MmxOp::Packuswb => pack(a, b, 16, 8, true),
        MmxOp::Punpckl(l) => unpack(a, b, l, false),
        MmxOp::Punpckh(l) => unpack(a, b, l, true),
    }
}

impl<B: CpuBus> Vcpu<B> {
    fn mmx_gate(&self) -> Result<(), Fault> {
        if self.state.cr0.contains(Cr0::EM) {
            return Err(Fault::ud());
        }
        if self.state.cr0.contains(Cr0::TS) {
            return Err(Fault::nm());
        }
        Ok(())
    }

    fn read_mm_arg(&mut self, insn: &Insn, arg: Arg) -> Result<u64, Fault> {
        match arg {
            Arg::MmReg => Ok(self.state.fpu.mm(insn.reg_field())),
            Arg::MmRm => match insn.modrm {
                Some(m) if m.is_reg() => Ok(self.state.fpu.mm(m.rm)),
                _ => {
                    let off = self.ea_offset(insn);
                    self.read_u64(insn.mem_seg(), off)
                }
            },
            Arg::Imm8 => Ok(u64::from(insn.imm & 0xff)),
            _ => Ok(u64::from(self.read_arg(insn, arg)?)),
        }
    }

    fn write_mm_arg(&mut self, insn: &Insn, arg: Arg, v: u64) -> Result<(), Fault> {
        match arg {
            Arg::MmReg => self.state.fpu.set_mm(insn.reg_field(), v),
            Arg::MmRm => match insn.modrm {
                Some(m) if m.is_reg() => self.state.fpu.set_mm(m.rm, v),
                _ => {
                    let off = self.ea_offset(insn);
                    self.write_u64(insn.mem_seg(), off, v)?;
                    self.state.fpu.enter_mmx();
                }
            },
            _ => {
                self.write_arg(insn, arg, v as u32)?;
                self.state.fpu.enter_mmx();
            }
        }
        Ok(())
    }

    pub(super) fn exec_mmx(&mut self, insn: &Insn, op: MmxOp) -> Result<Flow, Fault> {
        self.mmx_gate()?;
        let src = self.read_mm_arg(insn, insn.src)?;
        let v = match op {
            MmxOp::MovdLoad => src & 0xffff_ffff,
            MmxOp::MovdStore => src & u64::from(Width::W32.mask()),
            MmxOp::MovqLoad | MmxOp::MovqStore => src,
            _ => {
                let dst = self.read_mm_arg(insn, insn.dst)?;
                mmx_op(op, dst, src)
            }
        };
        self.write_mm_arg(insn, insn.dst, v)?;
        Ok(Flow::Next)
    }

    pub(super) fn exec_emms(&mut self) -> Result<Flow, Fault> {
        self.mmx_gate()?;
        self.state.fpu.emms();
        Ok(Flow::Next)
    }
}
