//! Small architectural enums shared by the decoder, interpreter and translator.

/// Operand width of an integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Width::W8 => 0xff,
            Width::W16 => 0xffff,
            Width::W32 => 0xffff_ffff,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// `v` (truncated to this width) sign-extended to 32 bits.
    #[inline]
    pub const fn sign_extend(self, v: u32) -> u32 {
        match self {
            Width::W8 => v as u8 as i8 as i32 as u32,
            Width::W16 => v as u16 as i16 as i32 as u32,
            Width::W32 => v,
        }
    }

    /// `v` truncated to this width and sign-extended into an `i64`.
    #[inline]
    pub const fn signed(self, v: u32) -> i64 {
        self.sign_extend(v) as i32 as i64
    }

    #[inline]
    pub const fn from_op32(op32: bool) -> Width {
        if op32 {
            Width::W32
        } else {
            Width::W16
        }
    }
}

/// General-purpose register in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    #[inline]
    pub const fn from_index(index: u8) -> Gpr {
        match index & 7 {
            0 => Gpr::Eax,
            1 => Gpr::Ecx,
            2 => Gpr::Edx,
            3 => Gpr::Ebx,
            4 => Gpr::Esp,
            5 => Gpr::Ebp,
            6 => Gpr::Esi,
            _ => Gpr::Edi,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Segment register in encoding order (the `reg` field of `8C`/`8E`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    #[inline]
    pub const fn from_index(index: u8) -> Option<SegReg> {
        match index {
            0 => Some(SegReg::Es),
            1 => Some(SegReg::Cs),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Ds),
            4 => Some(SegReg::Fs),
            5 => Some(SegReg::Gs),
            _ => None,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Condition code in `Jcc`/`SETcc` encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    #[inline]
    pub const fn from_index(index: u8) -> Cond {
        match index & 0xf {
            0 => Cond::O,
            1 => Cond::No,
            2 => Cond::B,
            3 => Cond::Ae,
            4 => Cond::E,
            5 => Cond::Ne,
            6 => Cond::Be,
            7 => Cond::A,
            8 => Cond::S,
            9 => Cond::Ns,
            10 => Cond::P,
            11 => Cond::Np,
            12 => Cond::L,
            13 => Cond::Ge,
            14 => Cond::Le,
            _ => Cond::G,
        }
    }
}
