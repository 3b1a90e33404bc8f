//! Trace-to-host-op translation.
//!
//! Each guest instruction is lowered by an emitter picked from its [`Op`].
//! Emitters follow one rule that makes faults precise: every access that can
//! fault is emitted before the instruction writes any guest register or
//! flag, and the register allocator is flushed before each such access. A
//! fault therefore leaves guest state exactly as it was at the start of the
//! instruction, and the executor only has to report where to resume.
//!
//! An emitter returns `None` when it cannot lower an instruction (unsupported
//! operand form, no free host register). The translator then discards the
//! partial output and ends the block in front of it.

mod alu;
mod control;
mod data;

use pcx86_cpu::decode::{Arg, Insn, Op};
use pcx86_cpu::jit::{ExitReason, Trace, TranslateError, Translation};
use pcx86_cpu::mem::AccessType;
use pcx86_cpu::model::CpuModel;
use pcx86_cpu::timing;
use pcx86_cpu::types::{Gpr, SegReg, Width};
use tracing::trace;

use crate::emitter::{CodeBuffer, Executable, InsnInfo, Writable};
use crate::ir::{BinOp, ExitStub, HReg, HostOp, Src, StubId};
use crate::regalloc::RegAlloc;

pub(crate) struct Emitter {
    pub(crate) buf: CodeBuffer<Writable>,
    pub(crate) ra: RegAlloc,
    pub(crate) model: CpuModel,
    /// EIP mask of the code segment.
    pub(crate) ip_mask: u32,
    /// The current instruction stored to memory.
    stored: bool,
    next_slot: u8,
}

/// What an emitter did with its instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lowered {
    /// Falls through to the next instruction.
    Next,
    /// Left the block through its own exits.
    Ended,
}

type EmitFn = fn(&mut Emitter, &Insn, u32) -> Option<Lowered>;

fn emitter_for(op: Op) -> Option<EmitFn> {
    Some(match op {
        Op::Alu(_) => alu::emit_alu,
        Op::Test => alu::emit_test,
        Op::Inc | Op::Dec | Op::Neg | Op::Not => alu::emit_unary,
        Op::Shift(_) => alu::emit_shift,
        Op::Clc | Op::Stc | Op::Cmc | Op::Cld | Op::Std => alu::emit_flag,
        Op::Setcc(_) => alu::emit_setcc,

        Op::Mov => data::emit_mov,
        Op::Movzx | Op::Movsx => data::emit_movx,
        Op::Lea => data::emit_lea,
        Op::Xchg => data::emit_xchg,
        Op::Cbw => data::emit_cbw,
        Op::Cwd => data::emit_cwd,
        Op::Nop => data::emit_nop,
        Op::Push => data::emit_push,
        Op::Pop => data::emit_pop,

        Op::Jcc(_) => control::emit_jcc,
        Op::Jmp => control::emit_jmp,
        Op::JmpIndirect => control::emit_jmp_indirect,
        Op::Call => control::emit_call,
        Op::CallIndirect => control::emit_call_indirect,
        Op::Ret => control::emit_ret,
        Op::Loop | Op::Loope | Op::Loopne => control::emit_loop,
        Op::Jcxz => control::emit_jcxz,
        _ => return None,
    })
}

/// Lower a trace. Only a prefix may be covered; the block then exits to the
/// interpreter in front of the first instruction it could not lower.
pub(crate) fn translate(
    trace: &Trace,
    max_ops: usize,
) -> Result<Translation<CodeBuffer<Executable>>, TranslateError> {
    let first = trace.insns.first().ok_or(TranslateError::EmptyTrace)?;
    let model = trace.config.model;
    let mut e = Emitter {
        buf: CodeBuffer::new(max_ops),
        ra: RegAlloc::new(),
        model,
        ip_mask: if trace.key.code32 { u32::MAX } else { 0xffff },
        stored: false,
        next_slot: 0,
    };

    let mut covered = 0usize;
    let mut bytes = 0u32;
    let mut open_end = None;
    for t in &trace.insns {
        let next = t.eip.wrapping_add(u32::from(t.insn.len)) & e.ip_mask;
        let mark = e.buf.mark();
        let saved = e.ra.clone();

        let lowered = emitter_for(t.insn.op).and_then(|emit| {
            e.begin(&t.insn, t.eip);
            let r = emit(&mut e, &t.insn, next)?;
            if r == Lowered::Next && e.stored {
                e.ra.flush(&mut e.buf);
                let stub = e.buf.stub(ExitStub::Retire {
                    target: Src::Imm(next),
                    taken: false,
                    reason: ExitReason::CodeModified,
                });
                e.buf.emit(HostOp::CheckCode(stub));
            }
            Some(r)
        });
        e.ra.end_insn();

        match lowered {
            Some(r) => {
                covered += 1;
                bytes += u32::from(t.insn.len);
                if r == Lowered::Ended {
                    open_end = None;
                    break;
                }
                open_end = Some(next);
            }
            None => {
                e.buf.truncate(mark);
                e.ra = saved;
                if covered == 0 {
                    return Err(TranslateError::Untranslatable {
                        eip: first.eip,
                        op: first.insn.op,
                    });
                }
                trace!(eip = t.eip, op = ?t.insn.op, "block ends at untranslatable instruction");
                // Open the instruction so the exit can name it, then leave
                // without running it.
                e.ra.flush(&mut e.buf);
                e.buf.begin_insn(InsnInfo {
                    eip: t.eip,
                    cost: 0,
                    taken_cost: 0,
                });
                let stub = e.buf.stub(ExitStub::Rollback {
                    reason: ExitReason::Fallback,
                });
                e.buf.emit(HostOp::Exit(stub));
                open_end = None;
                break;
            }
        }
    }

    if let Some(next) = open_end {
        e.ra.flush(&mut e.buf);
        let stub = e.buf.stub(ExitStub::Retire {
            target: Src::Imm(next),
            taken: false,
            reason: ExitReason::End,
        });
        e.buf.emit(HostOp::Exit(stub));
    }

    let code = e.buf.seal()?;
    Ok(Translation {
        code,
        insn_count: covered as u32,
        byte_len: bytes,
    })
}

impl Emitter {
    fn begin(&mut self, insn: &Insn, eip: u32) {
        self.stored = false;
        self.next_slot = 0;
        let cost = timing::cost(insn, self.model, false, 1);
        let taken_cost = timing::cost(insn, self.model, true, 1);
        self.buf.begin_insn(InsnInfo { eip, cost, taken_cost });
    }

    #[inline]
    pub(crate) fn emit(&mut self, op: HostOp) {
        self.buf.emit(op);
    }

    pub(crate) fn temp(&mut self) -> Option<HReg> {
        self.ra.temp(&mut self.buf)
    }

    pub(crate) fn flush(&mut self) {
        self.ra.flush(&mut self.buf);
    }

    pub(crate) fn exit_stub(&mut self, stub: ExitStub) -> StubId {
        self.buf.stub(stub)
    }

    /// `src` in a register.
    pub(crate) fn in_reg(&mut self, src: Src) -> Option<HReg> {
        match src {
            Src::Host(h) => Some(h),
            Src::Imm(_) => {
                let t = self.temp()?;
                self.emit(HostOp::Mov { dst: t, src });
                Some(t)
            }
        }
    }

    /// `src` copied into a fresh scratch register.
    pub(crate) fn copy(&mut self, src: Src) -> Option<HReg> {
        let t = self.temp()?;
        self.emit(HostOp::Mov { dst: t, src });
        Some(t)
    }

    // ---- general-purpose registers -------------------------------------

    /// Read a GPR by operand index (8-bit indexes 4..7 name AH..BH). Full
    /// registers come back as the cached host register and must not be
    /// modified.
    pub(crate) fn gpr_read(&mut self, index: u8, width: Width) -> Option<HReg> {
        let (reg, high) = split_index(index, width);
        let h = self.ra.read(&mut self.buf, reg)?;
        if width == Width::W32 {
            return Some(h);
        }
        let t = self.temp()?;
        self.emit(HostOp::Extract {
            dst: t,
            src: h,
            width,
            high,
            sign: false,
        });
        Some(t)
    }

    pub(crate) fn gpr_write(&mut self, index: u8, width: Width, value: Src) -> Option<()> {
        let (reg, high) = split_index(index, width);
        if width == Width::W32 {
            let h = self.ra.write(&mut self.buf, reg)?;
            if value != Src::Host(h) {
                self.emit(HostOp::Mov { dst: h, src: value });
            }
        } else {
            let h = self.ra.update(&mut self.buf, reg)?;
            self.emit(HostOp::Insert {
                dst: h,
                src: value,
                width,
                high,
            });
        }
        Some(())
    }

    // ---- operands -------------------------------------------------------

    /// Offset of the ModRM memory operand, truncated to the address size.
    pub(crate) fn ea(&mut self, insn: &Insn) -> Option<HReg> {
        let ea = insn.ea?;
        let t = self.temp()?;
        self.emit(HostOp::Mov {
            dst: t,
            src: Src::Imm(ea.disp),
        });
        if let Some(base) = ea.base {
            let b = self.ra.read(&mut self.buf, base)?;
            self.emit(HostOp::Bin {
                op: BinOp::Add,
                dst: t,
                lhs: t,
                rhs: Src::Host(b),
            });
        }
        if let Some(index) = ea.index {
            let i = self.ra.read(&mut self.buf, index)?;
            let scaled = self.temp()?;
            self.emit(HostOp::Bin {
                op: BinOp::Shl,
                dst: scaled,
                lhs: i,
                rhs: Src::Imm(u32::from(ea.scale)),
            });
            self.emit(HostOp::Bin {
                op: BinOp::Add,
                dst: t,
                lhs: t,
                rhs: Src::Host(scaled),
            });
        }
        if !ea.addr32 {
            self.emit(HostOp::Bin {
                op: BinOp::And,
                dst: t,
                lhs: t,
                rhs: Src::Imm(0xffff),
            });
        }
        Some(t)
    }

    /// `(segment, offset)` of a memory operand, if `arg` names memory.
    pub(crate) fn mem_operand(&mut self, insn: &Insn, arg: Arg) -> Option<Option<(SegReg, Src)>> {
        match arg {
            Arg::Rm(_) | Arg::Mem if !insn.rm_is_reg() => {
                let off = self.ea(insn)?;
                Some(Some((insn.mem_seg(), Src::Host(off))))
            }
            Arg::Moffs(_) => {
                let seg = insn.seg_override.unwrap_or(SegReg::Ds);
                Some(Some((seg, Src::Imm(insn.imm))))
            }
            _ => Some(None),
        }
    }

    /// Register index of a register operand.
    pub(crate) fn reg_index(insn: &Insn, arg: Arg) -> Option<u8> {
        match arg {
            Arg::Rm(_) if insn.rm_is_reg() => insn.modrm.map(|m| m.rm),
            Arg::Reg(_) => Some(insn.reg_field()),
            Arg::Acc(_) => Some(0),
            Arg::OpReg(_) => Some(insn.opcode & 7),
            _ => None,
        }
    }

    /// Read an integer operand. Memory reads flush the allocator first.
    pub(crate) fn read_arg(&mut self, insn: &Insn, arg: Arg) -> Option<Src> {
        let w = arg.width().unwrap_or(Width::W8);
        if let Some((seg, off)) = self.mem_operand(insn, arg)? {
            let dst = self.temp()?;
            self.flush();
            self.emit(HostOp::Load { dst, seg, off, width: w });
            return Some(Src::Host(dst));
        }
        if let Some(index) = Self::reg_index(insn, arg) {
            return self.gpr_read(index, w).map(Src::Host);
        }
        Some(Src::Imm(match arg {
            Arg::Imm(w) | Arg::ImmSx(w) => insn.imm & w.mask(),
            Arg::Imm8 => insn.imm & 0xff,
            Arg::Imm16 => insn.imm & 0xffff,
            Arg::One => 1,
            Arg::Cl => return self.gpr_read(Gpr::Ecx as u8, Width::W8).map(Src::Host),
            _ => return None,
        }))
    }

    /// Write an integer operand. Memory writes go through the full-form
    /// store, which is the instruction's last faulting access.
    pub(crate) fn write_arg(&mut self, insn: &Insn, arg: Arg, value: Src) -> Option<()> {
        let w = arg.width()?;
        if let Some((seg, off)) = self.mem_operand(insn, arg)? {
            self.flush();
            self.emit(HostOp::Store {
                seg,
                off,
                value,
                width: w,
            });
            self.stored = true;
            return Some(());
        }
        let index = Self::reg_index(insn, arg)?;
        self.gpr_write(index, w, value)
    }

    /// A read-modify-write destination: a register, or memory checked for
    /// writing up front so the final store cannot fault.
    pub(crate) fn locate(&mut self, insn: &Insn, arg: Arg) -> Option<Place> {
        let w = arg.width()?;
        if let Some((seg, off)) = self.mem_operand(insn, arg)? {
            if usize::from(self.next_slot) >= crate::ir::ACCESS_SLOTS {
                return None;
            }
            let slot = self.next_slot;
            self.next_slot += 1;
            self.flush();
            self.emit(HostOp::Validate {
                slot,
                seg,
                off,
                width: w,
                access: AccessType::Write,
            });
            return Some(Place::Mem(slot));
        }
        Some(Place::Reg(Self::reg_index(insn, arg)?, w))
    }

    pub(crate) fn load_place(&mut self, place: Place) -> Option<HReg> {
        match place {
            Place::Reg(index, w) => self.gpr_read(index, w),
            Place::Mem(slot) => {
                let dst = self.temp()?;
                self.emit(HostOp::LoadChecked { dst, slot });
                Some(dst)
            }
        }
    }

    pub(crate) fn store_place(
        &mut self,
        place: Place,
        value: Src,
        when: Option<HReg>,
    ) -> Option<()> {
        match place {
            // A skipped shift leaves its input in `value`, so writing a
            // register back unconditionally is harmless.
            Place::Reg(index, w) => self.gpr_write(index, w, value),
            Place::Mem(slot) => {
                self.emit(HostOp::StoreChecked { slot, value, when });
                self.stored = true;
                Some(())
            }
        }
    }

    /// Flush, then leave through `stub` if `cond` is non-zero.
    pub(crate) fn exit_if(&mut self, cond: HReg, stub: ExitStub) {
        self.flush();
        let id = self.exit_stub(stub);
        self.emit(HostOp::ExitIf { cond, stub: id });
    }

    pub(crate) fn exit(&mut self, stub: ExitStub) {
        self.flush();
        let id = self.exit_stub(stub);
        self.emit(HostOp::Exit(id));
    }

    /// Near-branch limit check. The 8088 has no limit to check.
    pub(crate) fn guard_branch(&mut self, cond: Option<HReg>, target: Src) {
        if self.model != CpuModel::I8088 {
            self.flush();
            self.emit(HostOp::GuardBranch { cond, target });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Place {
    Reg(u8, Width),
    Mem(u8),
}

/// Guest register and high-byte selector of an operand index.
#[inline]
pub(crate) fn split_index(index: u8, width: Width) -> (u8, bool) {
    if width == Width::W8 && index >= 4 {
        (index - 4, true)
    } else {
        (index & 7, false)
    }
}

#[cfg(test)]
mod tests;
