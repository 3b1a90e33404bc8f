//! Wasm block ABI shared by [`codegen`] and the wasmtime backend.
//!
//! A block is one module exporting `block(resume: i32) -> i32` and
//! importing a single linear memory from `env`. The memory holds a small
//! frame:
//!
//! | offset | contents                                  |
//! |--------|-------------------------------------------|
//! | 0x00   | host registers, 8 x u32                   |
//! | 0x20   | guest general registers, 8 x u32          |
//! | 0x40   | index of the current guest instruction    |
//! | 0x44   | CS limit                                  |
//!
//! Flag arithmetic is imported from `env` and runs on the backend's copy of
//! EFLAGS. Ops that touch guest memory cannot run inside the module: the
//! block returns the yield index `k >= 0`, the host performs op `k` and calls
//! the block again with `resume = k + 1`. Negative returns are exits.

pub mod codegen;

use pcx86_cpu::types::Width;

use crate::ir::{FlagEdit, StubId, UnaryOp};

pub const IMPORT_MODULE: &str = "env";
pub const IMPORT_MEMORY: &str = "memory";
/// `alu(op, bits, a, b) -> result`
pub const IMPORT_ALU: &str = "alu";
/// `unary(op, bits, a) -> result`
pub const IMPORT_UNARY: &str = "unary";
/// `shift(op, bits, value, count) -> i64`: the result in the low word,
/// bit 32 set when the masked count was non-zero.
pub const IMPORT_SHIFT: &str = "shift";
/// `cond(cc) -> 0 | 1`
pub const IMPORT_COND: &str = "cond";
/// `flag(edit)`
pub const IMPORT_FLAG: &str = "flag";
pub const EXPORT_BLOCK_FN: &str = "block";

pub const HOST_REGS_OFF: u32 = 0x00;
pub const GUEST_REGS_OFF: u32 = 0x20;
pub const CUR_INSN_OFF: u32 = 0x40;
pub const CS_LIMIT_OFF: u32 = 0x44;
/// Size of the imported memory in 64 KiB pages.
pub const MEMORY_PAGES: u32 = 1;

/// Returned when a branch target fails the CS limit check.
pub const EXIT_FAULT: i32 = -0x2_0000;
/// Returned when control runs off the end of the op list.
pub const EXIT_FELL_OFF: i32 = -0x3_0000;

#[inline]
pub fn stub_exit(id: StubId) -> i32 {
    -1 - i32::from(id.0)
}

/// Decoded return value of a block call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReturn {
    Yield(usize),
    Stub(StubId),
    Fault,
    FellOff,
}

impl BlockReturn {
    pub fn decode(ret: i32) -> BlockReturn {
        match ret {
            k if k >= 0 => BlockReturn::Yield(k as usize),
            EXIT_FAULT => BlockReturn::Fault,
            r if r >= -0x1_0000 => BlockReturn::Stub(StubId((-1 - r) as u16)),
            _ => BlockReturn::FellOff,
        }
    }
}

pub(crate) fn width_bits(width: Width) -> i32 {
    width.bits() as i32
}

pub(crate) fn width_from_bits(bits: i32) -> Width {
    match bits {
        8 => Width::W8,
        16 => Width::W16,
        _ => Width::W32,
    }
}

pub(crate) fn unary_code(op: UnaryOp) -> i32 {
    match op {
        UnaryOp::Inc => 0,
        UnaryOp::Dec => 1,
        UnaryOp::Neg => 2,
        UnaryOp::Not => 3,
    }
}

pub(crate) fn unary_from_code(code: i32) -> UnaryOp {
    match code {
        0 => UnaryOp::Inc,
        1 => UnaryOp::Dec,
        2 => UnaryOp::Neg,
        _ => UnaryOp::Not,
    }
}

pub(crate) fn flag_code(edit: FlagEdit) -> i32 {
    match edit {
        FlagEdit::Clc => 0,
        FlagEdit::Stc => 1,
        FlagEdit::Cmc => 2,
        FlagEdit::Cld => 3,
        FlagEdit::Std => 4,
    }
}

pub(crate) fn flag_from_code(code: i32) -> FlagEdit {
    match code {
        0 => FlagEdit::Clc,
        1 => FlagEdit::Stc,
        2 => FlagEdit::Cmc,
        3 => FlagEdit::Cld,
        _ => FlagEdit::Std,
    }
}
