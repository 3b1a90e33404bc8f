//! ModRM/SIB effective-address decoding.

use crate::exceptions::Fault;
use crate::types::SegReg;

use super::ModRm;

/// Effective address: `base + index * 2^scale + disp`, truncated to the
/// address size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffAddr {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u32,
    /// SS for BP/ESP/EBP-based forms, DS otherwise.
    pub default_seg: SegReg,
    pub addr32: bool,
}

impl EffAddr {
    /// Offset from register values (indexed by GPR encoding).
    #[inline]
    pub fn offset(&self, regs: &[u32; 8]) -> u32 {
        let mut off = self.disp;
        if let Some(b) = self.base {
            off = off.wrapping_add(regs[usize::from(b)]);
        }
        if let Some(i) = self.index {
            off = off.wrapping_add(regs[usize::from(i)] << self.scale);
        }
        if self.addr32 {
            off
        } else {
            off & 0xffff
        }
    }
}

pub(super) fn decode_ea<N>(m: ModRm, addr32: bool, next: &mut N) -> Result<EffAddr, Fault>
where
    N: FnMut() -> Result<u8, Fault>,
{
    if addr32 {
        decode_ea32(m, next)
    } else {
        decode_ea16(m, next)
    }
}

fn disp<N>(next: &mut N, bytes: u32) -> Result<u32, Fault>
where
    N: FnMut() -> Result<u8, Fault>,
{
    match bytes {
        1 => Ok(next()? as i8 as i32 as u32),
        2 => {
            let lo = u32::from(next()?);
            let hi = u32::from(next()?);
            Ok((lo | (hi << 8)) as u16 as i16 as i32 as u32)
        }
        _ => {
            let mut v = 0u32;
            for i in 0..4 {
                v |= u32::from(next()?) << (8 * i);
            }
            Ok(v)
        }
    }
}

const BX: u8 = 3;
const SP: u8 = 4;
const BP: u8 = 5;
const SI: u8 = 6;
const DI: u8 = 7;

fn decode_ea16<N>(m: ModRm, next: &mut N) -> Result<EffAddr, Fault>
where
    N: FnMut() -> Result<u8, Fault>,
{
    let (base, index) = match m.rm {
        0 => (Some(BX), Some(SI)),
        1 => (Some(BX), Some(DI)),
        2 => (Some(BP), Some(SI)),
        3 => (Some(BP), Some(DI)),
        4 => (Some(SI), None),
        5 => (Some(DI), None),
        6 if m.md == 0 => (None, None),
        6 => (Some(BP), None),
        _ => (Some(BX), None),
    };
    let d = match m.md {
        0 if m.rm == 6 => disp(next, 2)?,
        0 => 0,
        1 => disp(next, 1)?,
        _ => disp(next, 2)?,
    };
    Ok(EffAddr {
        base,
        index,
        scale: 0,
        disp: d,
        default_seg: if base == Some(BP) { SegReg::Ss } else { SegReg::Ds },
        addr32: false,
    })
}

fn decode_ea32<N>(m: ModRm, next: &mut N) -> Result<EffAddr, Fault>
where
    N: FnMut() -> Result<u8, Fault>,
{
    let base;
    let mut index = None;
    let mut scale = 0;
    let mut force_disp32 = false;

    if m.rm == SP {
        let sib = next()?;
        scale = sib >> 6;
        let idx = (sib >> 3) & 7;
        if idx != SP {
            index = Some(idx);
        }
        let b = sib & 7;
        if b == BP && m.md == 0 {
            base = None;
            force_disp32 = true;
        } else {
            base = Some(b);
        }
    } else if m.rm == BP && m.md == 0 {
        base = None;
        force_disp32 = true;
    } else {
        base = Some(m.rm);
    }

    let d = match m.md {
        0 if force_disp32 => disp(next, 4)?,
        0 => 0,
        1 => disp(next, 1)?,
        _ => disp(next, 4)?,
    };
    let default_seg = match base {
        Some(SP) | Some(BP) => SegReg::Ss,
        _ => SegReg::Ds,
    };
    Ok(EffAddr {
        base,
        index,
        scale,
        disp: d,
        default_seg,
        addr32: true,
    })
}
