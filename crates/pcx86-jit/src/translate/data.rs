//! Moves, exchanges, sign extension and the stack.

use pcx86_cpu::decode::{Arg, Insn, Op};
use pcx86_cpu::model::CpuModel;
use pcx86_cpu::types::{Gpr, Width};

use super::{Emitter, Lowered, Place};
use crate::ir::{BinOp, HostOp, Src};

const ESP: u8 = Gpr::Esp as u8;

pub(super) fn emit_mov(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let v = e.read_arg(insn, insn.src)?;
    e.write_arg(insn, insn.dst, v)?;
    Some(Lowered::Next)
}

pub(super) fn emit_movx(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let from = insn.src.width()?;
    let v = e.read_arg(insn, insn.src)?;
    let v = if insn.op == Op::Movsx {
        let src = e.in_reg(v)?;
        let dst = e.temp()?;
        e.emit(HostOp::Extract {
            dst,
            src,
            width: from,
            high: false,
            sign: true,
        });
        Src::Host(dst)
    } else {
        v
    };
    e.write_arg(insn, insn.dst, v)?;
    Some(Lowered::Next)
}

pub(super) fn emit_lea(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    // LEA with a register operand is #UD; the interpreter raises it.
    if insn.rm_is_reg() {
        return None;
    }
    let off = e.ea(insn)?;
    e.write_arg(insn, insn.dst, Src::Host(off))?;
    Some(Lowered::Next)
}

pub(super) fn emit_xchg(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let place = e.locate(insn, insn.dst)?;
    match place {
        Place::Mem(_) => {
            let old = e.load_place(place)?;
            let v = e.read_arg(insn, insn.src)?;
            e.store_place(place, v, None)?;
            e.write_arg(insn, insn.src, Src::Host(old))?;
        }
        Place::Reg(index, w) => {
            let a = e.gpr_read(index, w)?;
            let a = e.copy(Src::Host(a))?;
            let b = e.read_arg(insn, insn.src)?;
            let b = e.copy(b)?;
            e.gpr_write(index, w, Src::Host(b))?;
            e.write_arg(insn, insn.src, Src::Host(a))?;
        }
    }
    Some(Lowered::Next)
}

/// CBW/CWDE.
pub(super) fn emit_cbw(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let (from, to) = if insn.op32 {
        (Width::W16, Width::W32)
    } else {
        (Width::W8, Width::W16)
    };
    let src = e.gpr_read(0, from)?;
    let dst = e.temp()?;
    e.emit(HostOp::Extract {
        dst,
        src,
        width: from,
        high: false,
        sign: true,
    });
    e.gpr_write(0, to, Src::Host(dst))?;
    Some(Lowered::Next)
}

/// CWD/CDQ.
pub(super) fn emit_cwd(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let w = insn.op_width();
    let acc = e.gpr_read(0, w)?;
    let fill = e.temp()?;
    e.emit(HostOp::Extract {
        dst: fill,
        src: acc,
        width: w,
        high: false,
        sign: true,
    });
    e.emit(HostOp::Bin {
        op: BinOp::Sar,
        dst: fill,
        lhs: fill,
        rhs: Src::Imm(31),
    });
    e.gpr_write(Gpr::Edx as u8, w, Src::Host(fill))?;
    Some(Lowered::Next)
}

pub(super) fn emit_nop(_e: &mut Emitter, _insn: &Insn, _next: u32) -> Option<Lowered> {
    Some(Lowered::Next)
}

pub(super) fn emit_push(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let width = insn.dst.width()?;
    // The 8088 pushes the decremented SP; leave that to the interpreter.
    if e.model == CpuModel::I8088
        && Emitter::reg_index(insn, insn.dst) == Some(ESP)
        && width != Width::W8
    {
        return None;
    }
    let value = e.read_arg(insn, insn.dst)?;
    e.flush();
    e.emit(HostOp::Push { width, value });
    e.ra.forget(ESP);
    Some(Lowered::Next)
}

pub(super) fn emit_pop(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    // POP m addresses memory with the incremented SP.
    if matches!(insn.dst, Arg::Rm(_)) && !insn.rm_is_reg() {
        return None;
    }
    let width = insn.dst.width()?;
    let dst = e.temp()?;
    e.flush();
    e.emit(HostOp::Pop { dst, width });
    e.ra.forget(ESP);
    e.write_arg(insn, insn.dst, Src::Host(dst))?;
    Some(Lowered::Next)
}
