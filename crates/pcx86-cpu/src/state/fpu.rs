//! x87 register file.
//!
//! Physical registers are stored as 80-bit extended values so that MMX (which
//! aliases the 64-bit mantissas) and FSTP m80 see the architectural bits.
//! Arithmetic is carried out in `f64`.

/// 80-bit extended precision value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ext80 {
    pub mantissa: u64,
    /// Sign in bit 15, biased exponent in bits 0..14.
    pub sign_exp: u16,
}

const EXT_BIAS: i32 = 16383;

impl Ext80 {
    pub const ZERO: Ext80 = Ext80 {
        mantissa: 0,
        sign_exp: 0,
    };

    pub fn from_f64(v: f64) -> Self {
        let bits = v.to_bits();
        let sign = ((bits >> 63) as u16) << 15;
        let exp = ((bits >> 52) & 0x7ff) as i32;
        let frac = bits & ((1u64 << 52) - 1);

        if exp == 0 && frac == 0 {
            return Ext80 {
                mantissa: 0,
                sign_exp: sign,
            };
        }
        if exp == 0x7ff {
            return Ext80 {
                mantissa: (1 << 63) | (frac << 11),
                sign_exp: sign | 0x7fff,
            };
        }
        if exp == 0 {
            // Double denormal: normalize into the wider exponent range.
            let mut mantissa = frac << 11;
            let mut e = EXT_BIAS - 1022;
            while mantissa & (1 << 63) == 0 {
                mantissa <<= 1;
                e -= 1;
            }
            return Ext80 {
                mantissa,
                sign_exp: sign | e as u16,
            };
        }
        Ext80 {
            mantissa: (1 << 63) | (frac << 11),
            sign_exp: sign | (exp - 1023 + EXT_BIAS) as u16,
        }
    }

    pub fn to_f64(self) -> f64 {
        let negative = self.sign_exp & 0x8000 != 0;
        let exp = i32::from(self.sign_exp & 0x7fff);
        let magnitude = if exp == 0 && self.mantissa == 0 {
            0.0
        } else if exp == 0x7fff {
            if self.mantissa << 1 == 0 {
                f64::INFINITY
            } else {
                f64::from_bits(0x7ff8_0000_0000_0000 | ((self.mantissa << 1) >> 12))
            }
        } else {
            ldexp(self.mantissa as f64, exp - EXT_BIAS - 63)
        };
        if negative {
            -magnitude
        } else {
            magnitude
        }
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&self.mantissa.to_le_bytes());
        out[8..].copy_from_slice(&self.sign_exp.to_le_bytes());
        out
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 10]) -> Self {
        let mut m = [0u8; 8];
        m.copy_from_slice(&bytes[..8]);
        Ext80 {
            mantissa: u64::from_le_bytes(m),
            sign_exp: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }
}

/// `x * 2^exp` without intermediate overflow/underflow of the scale factor.
pub fn ldexp(mut x: f64, mut exp: i32) -> f64 {
    while exp > 1000 {
        x *= 2f64.powi(1000);
        exp -= 1000;
    }
    while exp < -1000 {
        x *= 2f64.powi(-1000);
        exp += 1000;
    }
    x * 2f64.powi(exp)
}

/// Tag word encodings.
pub const TAG_VALID: u8 = 0;
pub const TAG_ZERO: u8 = 1;
pub const TAG_SPECIAL: u8 = 2;
pub const TAG_EMPTY: u8 = 3;

/// Status word bits.
pub const SW_IE: u16 = 1 << 0;
pub const SW_ZE: u16 = 1 << 2;
pub const SW_SF: u16 = 1 << 6;
pub const SW_ES: u16 = 1 << 7;
pub const SW_C0: u16 = 1 << 8;
pub const SW_C1: u16 = 1 << 9;
pub const SW_C2: u16 = 1 << 10;
pub const SW_C3: u16 = 1 << 14;
pub const SW_B: u16 = 1 << 15;
pub const SW_TOP_SHIFT: u16 = 11;

/// Power-on / FNINIT control word.
pub const DEFAULT_CW: u16 = 0x037f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FpuState {
    /// Physical registers R0..R7.
    pub regs: [Ext80; 8],
    pub top: u8,
    /// Two bits per physical register.
    pub tag: u16,
    pub cw: u16,
    /// Status word without TOP (TOP lives in `top`).
    pub sw: u16,
}

impl Default for FpuState {
    fn default() -> Self {
        Self {
            regs: [Ext80::ZERO; 8],
            top: 0,
            tag: 0xffff,
            cw: DEFAULT_CW,
            sw: 0,
        }
    }
}

impl FpuState {
    /// FNINIT.
    pub fn init(&mut self) {
        *self = FpuState {
            regs: self.regs,
            ..FpuState::default()
        };
    }

    #[inline]
    pub fn phys(&self, i: u8) -> usize {
        usize::from((self.top + i) & 7)
    }

    #[inline]
    pub fn tag_of(&self, phys: usize) -> u8 {
        ((self.tag >> (phys * 2)) & 3) as u8
    }

    #[inline]
    pub fn set_tag(&mut self, phys: usize, tag: u8) {
        self.tag = (self.tag & !(3 << (phys * 2))) | (u16::from(tag & 3) << (phys * 2));
    }

    #[inline]
    pub fn is_empty(&self, i: u8) -> bool {
        self.tag_of(self.phys(i)) == TAG_EMPTY
    }

    /// ST(i) as a double.
    #[inline]
    pub fn st(&self, i: u8) -> f64 {
        self.regs[self.phys(i)].to_f64()
    }

    pub fn set_st(&mut self, i: u8, v: f64) {
        let p = self.phys(i);
        self.regs[p] = Ext80::from_f64(v);
        self.set_tag(p, tag_for(v));
    }

    pub fn set_st_raw(&mut self, i: u8, v: Ext80) {
        let p = self.phys(i);
        self.regs[p] = v;
        let tag = if v.sign_exp & 0x7fff == 0 && v.mantissa == 0 {
            TAG_ZERO
        } else if v.sign_exp & 0x7fff == 0x7fff || v.mantissa & (1 << 63) == 0 {
            TAG_SPECIAL
        } else {
            TAG_VALID
        };
        self.set_tag(p, tag);
    }

    /// Push a value; sets stack-fault bits on overflow.
    pub fn push(&mut self, v: f64) {
        self.top = (self.top + 7) & 7;
        if !self.is_empty(0) {
            self.sw |= SW_IE | SW_SF | SW_C1;
            self.set_st(0, f64::NAN);
            return;
        }
        self.set_st(0, v);
    }

    pub fn pop(&mut self) {
        let p = self.phys(0);
        self.set_tag(p, TAG_EMPTY);
        self.top = (self.top + 1) & 7;
    }

    /// Status word as FNSTSW stores it.
    #[inline]
    pub fn status_word(&self) -> u16 {
        (self.sw & !(7 << SW_TOP_SHIFT)) | (u16::from(self.top) << SW_TOP_SHIFT)
    }

    #[inline]
    pub fn set_condition(&mut self, c0: bool, c1: bool, c2: bool, c3: bool) {
        self.sw &= !(SW_C0 | SW_C1 | SW_C2 | SW_C3);
        if c0 {
            self.sw |= SW_C0;
        }
        if c1 {
            self.sw |= SW_C1;
        }
        if c2 {
            self.sw |= SW_C2;
        }
        if c3 {
            self.sw |= SW_C3;
        }
    }

    /// MMX register view (aliases the low 64 bits of the physical register).
    #[inline]
    pub fn mm(&self, i: u8) -> u64 {
        self.regs[usize::from(i & 7)].mantissa
    }

    /// MMX write: sets the exponent to all-ones, TOP to 0 and every tag valid.
    pub fn set_mm(&mut self, i: u8, v: u64) {
        let r = &mut self.regs[usize::from(i & 7)];
        r.mantissa = v;
        r.sign_exp = 0xffff;
        self.enter_mmx();
    }

    /// Any MMX instruction other than EMMS: TOP=0 and all tags valid.
    pub fn enter_mmx(&mut self) {
        self.top = 0;
        self.tag = 0;
    }

    /// EMMS.
    pub fn emms(&mut self) {
        self.tag = 0xffff;
    }
}

fn tag_for(v: f64) -> u8 {
    if v == 0.0 {
        TAG_ZERO
    } else if v.is_finite() && v.is_normal() {
        TAG_VALID
    } else {
        TAG_SPECIAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext80_of_one() {
        let one = Ext80::from_f64(1.0);
        assert_eq!(one.mantissa, 1 << 63);
        assert_eq!(one.sign_exp, 0x3fff);
        assert_eq!(one.to_f64(), 1.0);
    }

    #[test]
    fn ext80_preserves_denormals_and_specials() {
        for v in [
            f64::MIN_POSITIVE / 8.0,
            -2.5,
            1e300,
            f64::INFINITY,
            f64::NEG_INFINITY,
            -0.0,
        ] {
            let back = Ext80::from_f64(v).to_f64();
            assert_eq!(back.to_bits(), v.to_bits(), "{v}");
        }
        assert!(Ext80::from_f64(f64::NAN).to_f64().is_nan());
    }

    #[test]
    fn push_pop_rotates_top() {
        let mut fpu = FpuState::default();
        fpu.push(1.0);
        fpu.push(2.0);
        assert_eq!(fpu.top, 6);
        assert_eq!(fpu.st(0), 2.0);
        assert_eq!(fpu.st(1), 1.0);
        fpu.pop();
        assert_eq!(fpu.st(0), 1.0);
        assert_eq!(fpu.status_word() >> SW_TOP_SHIFT & 7, 7);
    }

    #[test]
    fn mmx_write_aliases_mantissa() {
        let mut fpu = FpuState::default();
        fpu.push(3.0);
        fpu.set_mm(2, 0x0123_4567_89ab_cdef);
        assert_eq!(fpu.top, 0);
        assert_eq!(fpu.tag, 0);
        assert_eq!(fpu.regs[2].mantissa, 0x0123_4567_89ab_cdef);
        fpu.emms();
        assert!(fpu.is_empty(0));
    }
}
