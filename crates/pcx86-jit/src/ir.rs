//! Host operations: the code a translated block is made of.
//!
//! A block is a flat list of [`HostOp`]s over a small file of host registers
//! ([`HReg`]). Guest registers are loaded into host registers on first use and
//! written back explicitly; everything that can fault is a helper op that
//! talks to the vCPU through the same accessors the interpreter uses.

use pcx86_cpu::decode::{AluOp, ShiftOp};
use pcx86_cpu::jit::ExitReason;
use pcx86_cpu::mem::AccessType;
use pcx86_cpu::types::{Cond, SegReg, Width};

/// Number of host registers available to the allocator.
pub const HOST_REGS: usize = 8;

/// Validated-access slots (one read-modify-write per instruction needs one).
pub const ACCESS_SLOTS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HReg(pub u8);

impl HReg {
    #[inline]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Src {
    Imm(u32),
    Host(HReg),
}

/// Plain 32-bit arithmetic with no flag effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Sar,
    /// 1 if equal, else 0.
    Eq,
    /// 1 if not equal, else 0.
    Ne,
}

impl BinOp {
    pub fn eval(self, a: u32, b: u32) -> u32 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b & 31),
            BinOp::Sar => ((a as i32) >> (b & 31)) as u32,
            BinOp::Eq => u32::from(a == b),
            BinOp::Ne => u32::from(a != b),
        }
    }
}

/// One-operand guest arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Inc,
    Dec,
    Neg,
    /// NOT leaves the flags alone.
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagEdit {
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StubId(pub u16);

/// Where a block goes when it leaves through a stub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStub {
    /// The current instruction completed; continue at `target`.
    Retire {
        target: Src,
        /// Charge the taken-branch cost of the current instruction.
        taken: bool,
        reason: ExitReason,
    },
    /// The current instruction did not complete. Guest state is exactly as
    /// it was at its start; the interpreter takes it from there.
    Rollback { reason: ExitReason },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostOp {
    /// Start of guest instruction `index`; everything before it retired.
    Boundary(u16),

    LoadGuest { dst: HReg, reg: u8 },
    StoreGuest { reg: u8, src: HReg },
    Mov { dst: HReg, src: Src },
    Bin { op: BinOp, dst: HReg, lhs: HReg, rhs: Src },
    /// `dst = (src >> (high ? 8 : 0)) & width.mask()`, sign-extended when
    /// `sign` is set.
    Extract { dst: HReg, src: HReg, width: Width, high: bool, sign: bool },
    /// Merge the low `width` bits of `src` into `dst` (at bit 8 when `high`).
    Insert { dst: HReg, src: Src, width: Width, high: bool },

    /// Two-operand ALU op with deferred flags. CMP writes only the flags.
    Alu { op: AluOp, width: Width, dst: HReg, lhs: HReg, rhs: Src },
    /// AND for flags only.
    Test { width: Width, lhs: HReg, rhs: Src },
    Unary { op: UnaryOp, width: Width, dst: HReg, src: HReg },
    /// Shift or rotate `dst` in place. `done` is set to 1 when the masked
    /// count is non-zero (the operation happened), else 0.
    Shift { op: ShiftOp, width: Width, dst: HReg, count: Src, done: HReg },
    Cond { dst: HReg, cond: Cond },
    Flag(FlagEdit),

    /// Check an access and remember its translation in `slot`. Faults roll
    /// back the current instruction.
    Validate { slot: u8, seg: SegReg, off: Src, width: Width, access: AccessType },
    LoadChecked { dst: HReg, slot: u8 },
    /// Store through a validated slot; skipped when `when` holds zero.
    StoreChecked { slot: u8, value: Src, when: Option<HReg> },
    Load { dst: HReg, seg: SegReg, off: Src, width: Width },
    Store { seg: SegReg, off: Src, value: Src, width: Width },

    Push { width: Width, value: Src },
    Pop { dst: HReg, width: Width },
    /// Read the stack top without moving SP.
    StackPeek { dst: HReg, width: Width },
    /// SP += bytes, within the stack size.
    ReleaseStack { bytes: u32 },

    /// Roll back the current instruction if the branch would be taken
    /// (`cond` is `None` or non-zero) and `target` lies past the CS limit.
    GuardBranch { cond: Option<HReg>, target: Src },
    ExitIf { cond: HReg, stub: StubId },
    Exit(StubId),
    /// Leave through `stub` if a store of this block hit a page with
    /// translated code.
    CheckCode(StubId),
}

impl HostOp {
    /// Ops that call into the vCPU and may fault.
    pub fn is_helper(&self) -> bool {
        matches!(
            self,
            HostOp::Validate { .. }
                | HostOp::Load { .. }
                | HostOp::Store { .. }
                | HostOp::Push { .. }
                | HostOp::Pop { .. }
                | HostOp::StackPeek { .. }
        )
    }
}
