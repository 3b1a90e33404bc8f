//! Near branches. Every emitter here ends the block.

use pcx86_cpu::decode::{Arg, Insn, Op};
use pcx86_cpu::jit::ExitReason;
use pcx86_cpu::types::{Cond, Gpr, Width};

use super::{Emitter, Lowered};
use crate::ir::{BinOp, ExitStub, HReg, HostOp, Src};

const ECX: u8 = Gpr::Ecx as u8;
const ESP: u8 = Gpr::Esp as u8;

fn taken(target: Src) -> ExitStub {
    ExitStub::Retire {
        target,
        taken: true,
        reason: ExitReason::End,
    }
}

fn fallthrough(next: u32) -> ExitStub {
    ExitStub::Retire {
        target: Src::Imm(next),
        taken: false,
        reason: ExitReason::End,
    }
}

/// Relative target: the fallthrough EIP plus the displacement, within the
/// operand size.
fn rel_target(insn: &Insn, next: u32) -> u32 {
    next.wrapping_add(insn.imm) & insn.op_width().mask()
}

/// Count register width of LOOP/JCXZ.
fn count_width(insn: &Insn) -> Width {
    if insn.addr32 {
        Width::W32
    } else {
        Width::W16
    }
}

/// Leave through the taken stub when `cond` holds, else fall through.
fn branch_on(e: &mut Emitter, cond: HReg, target: u32, next: u32) -> Lowered {
    e.guard_branch(Some(cond), Src::Imm(target));
    e.exit_if(cond, taken(Src::Imm(target)));
    e.exit(fallthrough(next));
    Lowered::Ended
}

/// Indirect target in a scratch register, truncated to `w`.
fn indirect_target(e: &mut Emitter, insn: &Insn) -> Option<HReg> {
    let w = insn.dst.width()?;
    let v = e.read_arg(insn, insn.dst)?;
    let t = e.copy(v)?;
    if w != Width::W32 {
        e.emit(HostOp::Bin {
            op: BinOp::And,
            dst: t,
            lhs: t,
            rhs: Src::Imm(w.mask()),
        });
    }
    Some(t)
}

pub(super) fn emit_jcc(e: &mut Emitter, insn: &Insn, next: u32) -> Option<Lowered> {
    let Op::Jcc(cond) = insn.op else {
        return None;
    };
    let c = e.temp()?;
    e.emit(HostOp::Cond { dst: c, cond });
    Some(branch_on(e, c, rel_target(insn, next), next))
}

pub(super) fn emit_jmp(e: &mut Emitter, insn: &Insn, next: u32) -> Option<Lowered> {
    let target = Src::Imm(rel_target(insn, next));
    e.guard_branch(None, target);
    e.exit(taken(target));
    Some(Lowered::Ended)
}

pub(super) fn emit_jmp_indirect(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let t = indirect_target(e, insn)?;
    e.guard_branch(None, Src::Host(t));
    e.exit(taken(Src::Host(t)));
    Some(Lowered::Ended)
}

pub(super) fn emit_call(e: &mut Emitter, insn: &Insn, next: u32) -> Option<Lowered> {
    let width = insn.op_width();
    let target = Src::Imm(rel_target(insn, next));
    e.guard_branch(None, target);
    e.flush();
    e.emit(HostOp::Push {
        width,
        value: Src::Imm(next),
    });
    e.ra.forget(ESP);
    e.exit(taken(target));
    Some(Lowered::Ended)
}

pub(super) fn emit_call_indirect(e: &mut Emitter, insn: &Insn, next: u32) -> Option<Lowered> {
    let width = insn.dst.width()?;
    let t = indirect_target(e, insn)?;
    e.guard_branch(None, Src::Host(t));
    e.flush();
    e.emit(HostOp::Push {
        width,
        value: Src::Imm(next),
    });
    e.ra.forget(ESP);
    e.exit(taken(Src::Host(t)));
    Some(Lowered::Ended)
}

pub(super) fn emit_ret(e: &mut Emitter, insn: &Insn, _next: u32) -> Option<Lowered> {
    let width = insn.op_width();
    let release = if insn.dst == Arg::Imm16 { insn.imm & 0xffff } else { 0 };
    let t = e.temp()?;
    e.flush();
    e.emit(HostOp::StackPeek { dst: t, width });
    e.guard_branch(None, Src::Host(t));
    e.emit(HostOp::ReleaseStack {
        bytes: width.bytes() + release,
    });
    e.ra.forget(ESP);
    e.exit(taken(Src::Host(t)));
    Some(Lowered::Ended)
}

pub(super) fn emit_loop(e: &mut Emitter, insn: &Insn, next: u32) -> Option<Lowered> {
    let cw = count_width(insn);
    let ecx = e.gpr_read(ECX, cw)?;
    let count = e.temp()?;
    e.emit(HostOp::Bin {
        op: BinOp::Sub,
        dst: count,
        lhs: ecx,
        rhs: Src::Imm(1),
    });
    e.emit(HostOp::Bin {
        op: BinOp::And,
        dst: count,
        lhs: count,
        rhs: Src::Imm(cw.mask()),
    });
    let go = e.temp()?;
    e.emit(HostOp::Bin {
        op: BinOp::Ne,
        dst: go,
        lhs: count,
        rhs: Src::Imm(0),
    });
    let zf_cond = match insn.op {
        Op::Loope => Some(Cond::E),
        Op::Loopne => Some(Cond::Ne),
        _ => None,
    };
    if let Some(cond) = zf_cond {
        let z = e.temp()?;
        e.emit(HostOp::Cond { dst: z, cond });
        e.emit(HostOp::Bin {
            op: BinOp::And,
            dst: go,
            lhs: go,
            rhs: Src::Host(z),
        });
    }
    let target = rel_target(insn, next);
    // The guard runs before ECX is written so a rollback leaves it intact.
    e.guard_branch(Some(go), Src::Imm(target));
    e.gpr_write(ECX, cw, Src::Host(count))?;
    e.exit_if(go, taken(Src::Imm(target)));
    e.exit(fallthrough(next));
    Some(Lowered::Ended)
}

pub(super) fn emit_jcxz(e: &mut Emitter, insn: &Insn, next: u32) -> Option<Lowered> {
    let cw = count_width(insn);
    let ecx = e.gpr_read(ECX, cw)?;
    let zero = e.temp()?;
    e.emit(HostOp::Bin {
        op: BinOp::Eq,
        dst: zero,
        lhs: ecx,
        rhs: Src::Imm(0),
    });
    Some(branch_on(e, zero, rel_target(insn, next), next))
}
