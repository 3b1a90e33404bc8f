//! Lazy condition-flag engine.
//!
//! Arithmetic instructions record the operation that produced their result
//! instead of computing CF/PF/AF/ZF/SF/OF eagerly. The record is turned into
//! flag bits only when something consumes them ([`Flags::rebuild`]). Control
//! flags (TF, IF, DF, IOPL, NT, RF, VM, AC, ID) are never deferred.

use bitflags::bitflags;

use crate::types::{Cond, Width};

bitflags! {
    /// EFLAGS bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const VIF = 1 << 19;
        const VIP = 1 << 20;
        const ID = 1 << 21;
    }
}

/// The arithmetic status flags: the only bits that can be deferred.
pub const STATUS_MASK: u32 = Eflags::CF.bits()
    | Eflags::PF.bits()
    | Eflags::AF.bits()
    | Eflags::ZF.bits()
    | Eflags::SF.bits()
    | Eflags::OF.bits();

/// Kind of the last flag-producing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagOp {
    Add,
    Adc,
    Sub,
    Sbb,
    /// CF is preserved; `carry` holds the CF value from before the INC.
    Inc,
    /// CF is preserved; `carry` holds the CF value from before the DEC.
    Dec,
    /// `op1` is the source; the result is `0 - op1`.
    Neg,
    /// AND/OR/XOR/TEST: CF=OF=AF=0.
    Logic,
    /// `op2` is the (non-zero, already masked) shift count.
    Shl,
    Shr,
    Sar,
}

/// Deferred flags record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingFlags {
    pub op: FlagOp,
    pub width: Width,
    pub op1: u32,
    pub op2: u32,
    pub result: u32,
    /// Carry-in for ADC/SBB, preserved CF for INC/DEC, unused otherwise.
    pub carry: bool,
}

impl PendingFlags {
    #[inline]
    pub fn new(op: FlagOp, width: Width, op1: u32, op2: u32, result: u32) -> Self {
        Self {
            op,
            width,
            op1,
            op2,
            result,
            carry: false,
        }
    }

    #[inline]
    pub fn with_carry(mut self, carry: bool) -> Self {
        self.carry = carry;
        self
    }

    /// Compute the six status flags this record stands for.
    pub fn status_bits(&self) -> u32 {
        let mask = self.width.mask();
        let sign = self.width.sign_bit();
        let a = self.op1 & mask;
        let b = self.op2 & mask;
        let r = self.result & mask;

        let mut cf = false;
        let mut of = false;
        let mut af = false;
        match self.op {
            FlagOp::Add | FlagOp::Adc | FlagOp::Inc => {
                let cin = u64::from(self.op == FlagOp::Adc && self.carry);
                cf = if self.op == FlagOp::Inc {
                    self.carry
                } else {
                    u64::from(a) + u64::from(b) + cin > u64::from(mask)
                };
                of = (a ^ r) & (b ^ r) & sign != 0;
                af = (a ^ b ^ r) & 0x10 != 0;
            }
            FlagOp::Sub | FlagOp::Sbb | FlagOp::Dec => {
                let bin = u64::from(self.op == FlagOp::Sbb && self.carry);
                cf = if self.op == FlagOp::Dec {
                    self.carry
                } else {
                    u64::from(a) < u64::from(b) + bin
                };
                of = (a ^ b) & (a ^ r) & sign != 0;
                af = (a ^ b ^ r) & 0x10 != 0;
            }
            FlagOp::Neg => {
                cf = a != 0;
                of = a & r & sign != 0;
                af = (a ^ r) & 0x10 != 0;
            }
            FlagOp::Logic => {}
            FlagOp::Shl => {
                let count = self.op2;
                let bits = self.width.bits();
                cf = count <= bits && (u64::from(a) >> (bits - count)) & 1 != 0;
                of = ((r & sign) != 0) ^ cf;
            }
            FlagOp::Shr => {
                let count = self.op2;
                cf = count <= 32 && (u64::from(a) >> (count - 1)) & 1 != 0;
                of = a & sign != 0;
            }
            FlagOp::Sar => {
                let count = self.op2.min(32);
                let sa = i64::from(self.width.sign_extend(a) as i32);
                cf = (sa >> (count - 1)) & 1 != 0;
            }
        }

        let mut bits = 0;
        if cf {
            bits |= Eflags::CF.bits();
        }
        if parity_even(r as u8) {
            bits |= Eflags::PF.bits();
        }
        if af {
            bits |= Eflags::AF.bits();
        }
        if r == 0 {
            bits |= Eflags::ZF.bits();
        }
        if r & sign != 0 {
            bits |= Eflags::SF.bits();
        }
        if of {
            bits |= Eflags::OF.bits();
        }
        bits
    }
}

#[inline]
pub fn parity_even(v: u8) -> bool {
    v.count_ones() % 2 == 0
}

/// Status-flag half of EFLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFlags {
    /// Deferred: the flags are a function of this record.
    Pending(PendingFlags),
    /// Materialized status bits (only [`STATUS_MASK`] bits are meaningful).
    Materialized(u32),
}

/// EFLAGS with lazily evaluated status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags {
    control: u32,
    status: StatusFlags,
}

impl Default for Flags {
    fn default() -> Self {
        Self::from_word(Eflags::RESERVED1.bits())
    }
}

impl Flags {
    pub fn from_word(word: u32) -> Self {
        Self {
            control: (word & !STATUS_MASK) | Eflags::RESERVED1.bits(),
            status: StatusFlags::Materialized(word & STATUS_MASK),
        }
    }

    /// Materialize pending status flags and return the full EFLAGS word.
    ///
    /// This is the only transition from `Pending` to `Materialized`.
    pub fn rebuild(&mut self) -> u32 {
        if let StatusFlags::Pending(p) = self.status {
            self.status = StatusFlags::Materialized(p.status_bits());
        }
        self.peek()
    }

    /// EFLAGS as they would materialize, without changing state.
    pub fn peek(&self) -> u32 {
        let status = match self.status {
            StatusFlags::Pending(p) => p.status_bits(),
            StatusFlags::Materialized(bits) => bits,
        };
        self.control | status
    }

    #[inline]
    pub fn status(&self) -> &StatusFlags {
        &self.status
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self.status, StatusFlags::Pending(_))
    }

    /// Replace the whole word (POPF, IRET, task switch, reset).
    pub fn set_word(&mut self, word: u32) {
        *self = Self::from_word(word);
    }

    /// Re-enter the deferred state after an arithmetic/logical result.
    #[inline]
    pub fn set_pending(&mut self, pending: PendingFlags) {
        self.status = StatusFlags::Pending(pending);
    }

    /// Read one flag. Status flags force materialization.
    pub fn get(&mut self, flag: Eflags) -> bool {
        if flag.bits() & STATUS_MASK != 0 {
            self.rebuild() & flag.bits() != 0
        } else {
            self.control & flag.bits() != 0
        }
    }

    /// Set or clear flags. Status flags are materialized first so the
    /// untouched ones keep their values.
    pub fn set(&mut self, flag: Eflags, on: bool) {
        let bits = flag.bits();
        if bits & STATUS_MASK != 0 {
            self.rebuild();
            if let StatusFlags::Materialized(ref mut status) = self.status {
                if on {
                    *status |= bits & STATUS_MASK;
                } else {
                    *status &= !(bits & STATUS_MASK);
                }
            }
        }
        let control = bits & !STATUS_MASK;
        if on {
            self.control |= control;
        } else {
            self.control &= !control;
        }
        self.control |= Eflags::RESERVED1.bits();
    }

    /// Overwrite the status flags selected by `mask` with `value`.
    pub fn set_status(&mut self, mask: u32, value: u32) {
        self.rebuild();
        if let StatusFlags::Materialized(ref mut status) = self.status {
            *status = (*status & !mask) | (value & mask & STATUS_MASK);
        }
    }

    /// Control flags. Never deferred, so this does not materialize.
    #[inline]
    pub fn control(&self) -> Eflags {
        Eflags::from_bits_retain(self.control)
    }

    #[inline]
    pub fn df(&self) -> bool {
        self.control & Eflags::DF.bits() != 0
    }

    #[inline]
    pub fn interrupts_enabled(&self) -> bool {
        self.control & Eflags::IF.bits() != 0
    }

    #[inline]
    pub fn tf(&self) -> bool {
        self.control & Eflags::TF.bits() != 0
    }

    #[inline]
    pub fn vm(&self) -> bool {
        self.control & Eflags::VM.bits() != 0
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.control >> 12) & 3) as u8
    }

    /// Evaluate a condition code.
    pub fn cond(&mut self, cond: Cond) -> bool {
        let f = self.rebuild();
        let cf = f & Eflags::CF.bits() != 0;
        let zf = f & Eflags::ZF.bits() != 0;
        let sf = f & Eflags::SF.bits() != 0;
        let of = f & Eflags::OF.bits() != 0;
        let pf = f & Eflags::PF.bits() != 0;
        match cond {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Ae => !cf,
            Cond::E => zf,
            Cond::Ne => !zf,
            Cond::Be => cf || zf,
            Cond::A => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Ge => sf == of,
            Cond::Le => zf || sf != of,
            Cond::G => !zf && sf == of,
        }
    }
}
