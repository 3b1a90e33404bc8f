//! Arithmetic, logic, shifts and flag instructions.

use pcx86_cpu::decode::{AluOp, Insn, Op};

use super::{Emitter, Lowered};
use crate::ir::{FlagEdit, HostOp, Src, UnaryOp};

pub(super) fn emit_alu(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let Op::Alu(op) = insn.op else {
        return None;
    };
    let width = insn.dst.width()?;
    let rhs = e.read_arg(insn, insn.src)?;
    if op == AluOp::Cmp {
        let lhs = e.read_arg(insn, insn.dst)?;
        let lhs = e.in_reg(lhs)?;
        e.emit(HostOp::Alu {
            op,
            width,
            dst: lhs,
            lhs,
            rhs,
        });
        return Some(Lowered::Next);
    }
    let place = e.locate(insn, insn.dst)?;
    let lhs = e.load_place(place)?;
    let dst = e.temp()?;
    e.emit(HostOp::Alu {
        op,
        width,
        dst,
        lhs,
        rhs,
    });
    e.store_place(place, Src::Host(dst), None)?;
    Some(Lowered::Next)
}

pub(super) fn emit_test(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let width = insn.dst.width()?;
    let lhs = e.read_arg(insn, insn.dst)?;
    let rhs = e.read_arg(insn, insn.src)?;
    let lhs = e.in_reg(lhs)?;
    e.emit(HostOp::Test { width, lhs, rhs });
    Some(Lowered::Next)
}

pub(super) fn emit_unary(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let op = match insn.op {
        Op::Inc => UnaryOp::Inc,
        Op::Dec => UnaryOp::Dec,
        Op::Neg => UnaryOp::Neg,
        Op::Not => UnaryOp::Not,
        _ => return None,
    };
    let width = insn.dst.width()?;
    let place = e.locate(insn, insn.dst)?;
    let src = e.load_place(place)?;
    let dst = e.temp()?;
    e.emit(HostOp::Unary { op, width, dst, src });
    e.store_place(place, Src::Host(dst), None)?;
    Some(Lowered::Next)
}

pub(super) fn emit_shift(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let Op::Shift(op) = insn.op else {
        return None;
    };
    let width = insn.dst.width()?;
    let count = e.read_arg(insn, insn.src)?;
    let place = e.locate(insn, insn.dst)?;
    let value = e.load_place(place)?;
    // Shift works in place; never on a cached guest register.
    let dst = e.copy(Src::Host(value))?;
    let done = e.temp()?;
    e.emit(HostOp::Shift {
        op,
        width,
        dst,
        count,
        done,
    });
    e.store_place(place, Src::Host(dst), Some(done))?;
    Some(Lowered::Next)
}

pub(super) fn emit_flag(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let edit = match insn.op {
        Op::Clc => FlagEdit::Clc,
        Op::Stc => FlagEdit::Stc,
        Op::Cmc => FlagEdit::Cmc,
        Op::Cld => FlagEdit::Cld,
        Op::Std => FlagEdit::Std,
        _ => return None,
    };
    e.emit(HostOp::Flag(edit));
    Some(Lowered::Next)
}

pub(super) fn emit_setcc(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let Op::Setcc(cond) = insn.op else {
        return None;
    };
    let dst = e.temp()?;
    e.emit(HostOp::Cond { dst, cond });
    e.write_arg(insn, insn.dst, Src::Host(dst))?;
    Some(Lowered::Next)
}
