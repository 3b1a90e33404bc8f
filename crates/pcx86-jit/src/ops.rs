//! Host-op semantics shared by every way of running a block.
//!
//! Flag-producing arithmetic works on a bare [`Flags`] so it can run inside
//! wasm host imports, which see a copy of the flags but not the vCPU. Ops
//! that reach guest memory or the code-page tracker need the whole vCPU and
//! go through [`host_call`].

use pcx86_cpu::decode::{AluOp, ShiftOp};
use pcx86_cpu::interp::alu::{alu, dec, inc, neg};
use pcx86_cpu::interp::shift::{mask_count, shift as shift_value, ShiftFlags};
use pcx86_cpu::jit::{BlockExit, ExitReason};
use pcx86_cpu::mem::CpuBus;
use pcx86_cpu::state::flags::{Eflags, Flags};
use pcx86_cpu::types::Width;
use pcx86_cpu::{CpuModel, Validated, Vcpu};
use tracing::trace;

use crate::emitter::{CodeBuffer, Executable};
use crate::ir::{ExitStub, FlagEdit, HostOp, Src, UnaryOp, ACCESS_SLOTS, HOST_REGS};

pub(crate) type HostRegs = [u32; HOST_REGS];
pub(crate) type Slots = [Option<Validated>; ACCESS_SLOTS];

pub(crate) const FAULT: ExitStub = ExitStub::Rollback {
    reason: ExitReason::Fault,
};

pub(crate) const FELL_OFF: ExitStub = ExitStub::Rollback {
    reason: ExitReason::Fallback,
};

#[inline]
pub(crate) fn val(regs: &HostRegs, src: Src) -> u32 {
    match src {
        Src::Imm(v) => v,
        Src::Host(h) => regs[h.index()],
    }
}

/// Two-operand ALU op. Returns the result; CMP callers discard it.
pub(crate) fn alu_op(flags: &mut Flags, op: AluOp, width: Width, a: u32, b: u32) -> u32 {
    let carry = matches!(op, AluOp::Adc | AluOp::Sbb) && flags.get(Eflags::CF);
    let (r, pending) = alu(op, width, a, b, carry);
    flags.set_pending(pending);
    r
}

pub(crate) fn test_op(flags: &mut Flags, width: Width, a: u32, b: u32) {
    let (_, pending) = alu(AluOp::And, width, a, b, false);
    flags.set_pending(pending);
}

pub(crate) fn unary_op(flags: &mut Flags, op: UnaryOp, width: Width, a: u32) -> u32 {
    let (r, pending) = match op {
        UnaryOp::Inc => inc(width, a, flags.get(Eflags::CF)),
        UnaryOp::Dec => dec(width, a, flags.get(Eflags::CF)),
        UnaryOp::Neg => neg(width, a),
        UnaryOp::Not => return !a & width.mask(),
    };
    flags.set_pending(pending);
    r
}

/// Shift or rotate with the model's count masking. `None` when the masked
/// count is zero and nothing changed.
pub(crate) fn shift_op(
    flags: &mut Flags,
    model: CpuModel,
    op: ShiftOp,
    width: Width,
    value: u32,
    count: u32,
) -> Option<u32> {
    let count = mask_count(model, count);
    let cf = matches!(op, ShiftOp::Rcl | ShiftOp::Rcr) && flags.get(Eflags::CF);
    let (r, out) = shift_value(op, width, value, count, cf)?;
    match out {
        ShiftFlags::Pending(p) => flags.set_pending(p),
        ShiftFlags::Rotate { cf, of } => {
            let mut bits = 0;
            if cf {
                bits |= Eflags::CF.bits();
            }
            if of {
                bits |= Eflags::OF.bits();
            }
            flags.set_status((Eflags::CF | Eflags::OF).bits(), bits);
        }
    }
    Some(r)
}

pub(crate) fn flag_edit(flags: &mut Flags, edit: FlagEdit) {
    match edit {
        FlagEdit::Clc => flags.set(Eflags::CF, false),
        FlagEdit::Stc => flags.set(Eflags::CF, true),
        FlagEdit::Cmc => {
            let cf = flags.get(Eflags::CF);
            flags.set(Eflags::CF, !cf);
        }
        FlagEdit::Cld => flags.set(Eflags::DF, false),
        FlagEdit::Std => flags.set(Eflags::DF, true),
    }
}

/// Ops that need the vCPU itself: memory, stack and code-page checks.
pub(crate) fn is_host_call(op: &HostOp) -> bool {
    op.is_helper()
        || matches!(
            op,
            HostOp::LoadChecked { .. }
                | HostOp::StoreChecked { .. }
                | HostOp::ReleaseStack { .. }
                | HostOp::CheckCode(_)
        )
}

/// Run one [`is_host_call`] op. `Some` leaves the block through that stub.
/// Any other op is ignored.
pub(crate) fn host_call<B: CpuBus>(
    vcpu: &mut Vcpu<B>,
    code: &CodeBuffer<Executable>,
    op: &HostOp,
    regs: &mut HostRegs,
    slots: &mut Slots,
) -> Option<ExitStub> {
    match *op {
        HostOp::Validate {
            slot,
            seg,
            off,
            width,
            access,
        } => match vcpu.validate(seg, val(regs, off), width.bytes(), access) {
            Ok(v) => slots[usize::from(slot)] = Some(v),
            Err(_) => return Some(FAULT),
        },
        HostOp::LoadChecked { dst, slot } => {
            let Some(v) = slots[usize::from(slot)] else {
                return Some(FAULT);
            };
            regs[dst.index()] = vcpu.read_validated(&v) as u32;
        }
        HostOp::StoreChecked { slot, value, when } => {
            if when.is_some_and(|h| regs[h.index()] == 0) {
                return None;
            }
            let Some(v) = slots[usize::from(slot)] else {
                return Some(FAULT);
            };
            vcpu.write_validated(&v, u64::from(val(regs, value)));
        }
        HostOp::Load {
            dst,
            seg,
            off,
            width,
        } => match vcpu.read_mem(seg, val(regs, off), width) {
            Ok(v) => regs[dst.index()] = v,
            Err(_) => return Some(FAULT),
        },
        HostOp::Store {
            seg,
            off,
            value,
            width,
        } => {
            if vcpu.write_mem(seg, val(regs, off), width, val(regs, value)).is_err() {
                return Some(FAULT);
            }
        }
        HostOp::Push { width, value } => {
            if vcpu.push(width, val(regs, value)).is_err() {
                return Some(FAULT);
            }
        }
        HostOp::Pop { dst, width } => match vcpu.pop(width) {
            Ok(v) => regs[dst.index()] = v,
            Err(_) => return Some(FAULT),
        },
        HostOp::StackPeek { dst, width } => match vcpu.stack_peek(0, width) {
            Ok(v) => regs[dst.index()] = v,
            Err(_) => return Some(FAULT),
        },
        HostOp::ReleaseStack { bytes } => {
            let sp = vcpu.state.sp().wrapping_add(bytes);
            vcpu.state.set_sp(sp);
        }
        HostOp::CheckCode(stub) => {
            if vcpu.bus.code_pages().has_dirty() {
                return Some(code.stub(stub));
            }
        }
        _ => {}
    }
    None
}

/// Settle EIP, TSC and the retired count for an exit taken inside
/// instruction `cur`.
pub(crate) fn finish<B: CpuBus>(
    vcpu: &mut Vcpu<B>,
    code: &CodeBuffer<Executable>,
    cur: usize,
    regs: &HostRegs,
    exit: ExitStub,
) -> BlockExit {
    let info = code.insn(cur);
    let done = code.retired_cycles(cur);
    let (next_eip, insns, cycles, reason) = match exit {
        ExitStub::Retire {
            target,
            taken,
            reason,
        } => {
            let cost = if taken { info.taken_cost } else { info.cost };
            (val(regs, target), cur + 1, done.saturating_add(cost), reason)
        }
        ExitStub::Rollback { reason } => {
            // The interpreter re-executes this instruction and raises the
            // fault itself.
            vcpu.state.abort = None;
            (info.eip, cur, done, reason)
        }
    };
    trace!(next_eip, insns, ?reason, "block exit");

    vcpu.state.eip = next_eip;
    vcpu.state.old_eip = info.eip;
    vcpu.state.tsc = vcpu.state.tsc.wrapping_add(u64::from(cycles));
    BlockExit {
        next_eip,
        insns: insns as u32,
        cycles,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_only_touch_carry_and_overflow() {
        let mut flags = Flags::default();
        alu_op(&mut flags, AluOp::Sub, Width::W8, 0, 1);
        assert!(!flags.get(Eflags::ZF) && flags.get(Eflags::SF));
        let r = shift_op(&mut flags, CpuModel::I386, ShiftOp::Rol, Width::W8, 0x81, 1);
        assert_eq!(r, Some(0x03));
        assert!(flags.get(Eflags::CF));
        assert!(flags.get(Eflags::SF));
    }

    #[test]
    fn zero_counts_change_nothing() {
        let mut flags = Flags::default();
        flag_edit(&mut flags, FlagEdit::Stc);
        let before = flags.rebuild();
        // 386 masks the count to five bits.
        let r = shift_op(&mut flags, CpuModel::I386, ShiftOp::Shl, Width::W16, 1, 32);
        assert_eq!(r, None);
        assert_eq!(flags.rebuild(), before);
    }

    #[test]
    fn not_leaves_the_flags_alone() {
        let mut flags = Flags::default();
        flag_edit(&mut flags, FlagEdit::Stc);
        assert_eq!(unary_op(&mut flags, UnaryOp::Not, Width::W16, 0x00ff), 0xff00);
        assert!(flags.get(Eflags::CF));
        assert_eq!(unary_op(&mut flags, UnaryOp::Inc, Width::W8, 0xff), 0);
        assert!(flags.get(Eflags::ZF) && flags.get(Eflags::CF));
    }
}
