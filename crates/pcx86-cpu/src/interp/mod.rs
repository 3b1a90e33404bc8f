//! Instruction semantics.
//!
//! [`Vcpu::step`] fetches, decodes and executes one instruction. Handlers live
//! in the submodules, grouped by instruction family, and all return
//! `Result<Flow, Fault>`: a fault leaves EIP rewound to the instruction and is
//! delivered through the IDT/IVT by [`Vcpu::raise_fault`].

pub mod alu;
mod atomics;
mod bcd;
mod bits;
mod control;
mod data;
mod fpu;
mod io;
mod mmx;
pub(crate) mod segment;
pub mod shift;
mod stack;
mod string;
mod system;

use tracing::trace;

use crate::access::Validated;
use crate::decode::{decode, Arg, DecodeCtx, Insn, Op};
use crate::exceptions::{Exception, Fault};
use crate::mem::{AccessType, CpuBus};
use crate::model::CpuModel;
use crate::timing;
use crate::types::{Gpr, SegReg, Width};
use crate::vcpu::Vcpu;

/// How an instruction left the program counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Fell through to the next instruction.
    Next,
    /// A control transfer was taken.
    Taken,
    /// String instruction; the number of iterations executed.
    Iterations(u32),
}

impl Flow {
    #[inline]
    pub fn taken(self) -> bool {
        self == Flow::Taken
    }

    #[inline]
    pub fn iterations(self) -> u32 {
        match self {
            Flow::Iterations(n) => n,
            _ => 1,
        }
    }
}

/// Outcome of [`Vcpu::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Retired {
        /// EIP the instruction was fetched from.
        eip: u32,
        insn: Insn,
        flow: Flow,
        cycles: u32,
    },
    /// The instruction (or its fetch) faulted and the exception was
    /// delivered, or delivery failed and [`Vcpu::exit`] was set.
    Faulted { fault: Fault, cycles: u32 },
    /// The CPU is halted; nothing was executed.
    Halted,
}

/// A read-modify-write destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    Reg(u8, Width),
    /// Full-form access; used where no contiguous translation exists
    /// (segment-wrapping 8088 accesses).
    Mem(SegReg, u32, Width),
    Checked(Validated, Width),
}

impl<B: CpuBus> Vcpu<B> {
    #[inline]
    pub(crate) fn decode_ctx(&self) -> DecodeCtx {
        DecodeCtx {
            model: self.state.model(),
            features: self.state.config.features,
            code32: self.state.code32(),
        }
    }

    /// Fetch and decode the instruction at CS:`eip`.
    pub fn fetch_decode(&mut self, eip: u32) -> Result<Insn, Fault> {
        let ctx = self.decode_ctx();
        let mask = if ctx.code32 { u32::MAX } else { 0xffff };
        let r = decode(&ctx, |i| self.fetch_code_u8(eip.wrapping_add(i) & mask));
        self.latch(r)
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> Step {
        if self.state.halted {
            return Step::Halted;
        }
        self.pending.retire_instruction();
        self.state.abort = None;
        self.insn_pages.clear();

        let start = self.state.eip;
        self.state.old_eip = start;
        let trap = self.state.flags.tf();
        let model = self.state.model();

        let insn = match self.fetch_decode(start) {
            Ok(insn) => insn,
            Err(fault) => return self.faulted(fault),
        };
        let mask = if self.state.code32() { u32::MAX } else { 0xffff };
        self.state.eip = start.wrapping_add(u32::from(insn.len)) & mask;

        match self.execute(&insn) {
            Ok(flow) => {
                let cycles = timing::cost(&insn, model, flow.taken(), flow.iterations());
                self.state.tsc = self.state.tsc.wrapping_add(u64::from(cycles));
                if trap && !matches!(insn.op, Op::Int | Op::Int3 | Op::Into) {
                    self.single_step_trap();
                }
                Step::Retired {
                    eip: start,
                    insn,
                    flow,
                    cycles,
                }
            }
            Err(fault) => self.faulted(fault),
        }
    }

    fn faulted(&mut self, fault: Fault) -> Step {
        trace!(?fault, eip = self.state.old_eip, "instruction faulted");
        let cycles = timing::fault_cost(self.state.model());
        self.state.tsc = self.state.tsc.wrapping_add(u64::from(cycles));
        self.raise_fault(fault);
        Step::Faulted { fault, cycles }
    }

    /// #DB after an instruction executed with TF set. Returns to the next
    /// instruction.
    fn single_step_trap(&mut self) {
        self.state.dr[6] |= 1 << 14;
        self.state.old_eip = self.state.eip;
        self.raise_fault(Fault::new(Exception::Debug));
    }

    /// Execute a decoded instruction. EIP already points past it.
    pub fn execute(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        match insn.op {
            Op::Alu(op) => self.exec_alu(insn, op),
            Op::Test => self.exec_test(insn),
            Op::Inc | Op::Dec => self.exec_inc_dec(insn),
            Op::Not => self.exec_not(insn),
            Op::Neg => self.exec_neg(insn),
            Op::MulDiv(op) => self.exec_mul_div(insn, op),
            Op::Imul2 | Op::Imul3 => self.exec_imul(insn),
            Op::Shift(op) => self.exec_shift(insn, op),
            Op::Shld | Op::Shrd => self.exec_double_shift(insn),
            Op::Bit(op) => self.exec_bit(insn, op),
            Op::Bsf | Op::Bsr => self.exec_bit_scan(insn),
            Op::Bswap => self.exec_bswap(insn),
            Op::Daa => self.exec_daa(),
            Op::Das => self.exec_das(),
            Op::Aaa => self.exec_aaa(),
            Op::Aas => self.exec_aas(),
            Op::Aam => self.exec_aam(insn),
            Op::Aad => self.exec_aad(insn),
            Op::Salc => self.exec_salc(),

            Op::Mov => self.exec_mov(insn),
            Op::MovToSeg => self.exec_mov_to_seg(insn),
            Op::MovFromSeg => self.exec_mov_from_seg(insn),
            Op::Movzx | Op::Movsx => self.exec_movx(insn),
            Op::Lea => self.exec_lea(insn),
            Op::Xchg => self.exec_xchg(insn),
            Op::Xlat => self.exec_xlat(insn),
            Op::Cbw => self.exec_cbw(insn),
            Op::Cwd => self.exec_cwd(insn),
            Op::Lahf => self.exec_lahf(),
            Op::Sahf => self.exec_sahf(),
            Op::Setcc(cond) => self.exec_setcc(insn, cond),
            Op::Cmc | Op::Clc | Op::Stc | Op::Cld | Op::Std => self.exec_flag_op(insn.op),
            Op::Cli | Op::Sti => self.exec_cli_sti(insn.op),
            Op::Nop => Ok(Flow::Next),

            Op::Push => self.exec_push(insn),
            Op::Pop => self.exec_pop(insn),
            Op::PushSeg(seg) => self.exec_push_seg(insn, seg),
            Op::PopSeg(seg) => self.exec_pop_seg(insn, seg),
            Op::PopCs => self.exec_pop_cs(),
            Op::Pusha => self.exec_pusha(insn),
            Op::Popa => self.exec_popa(insn),
            Op::Pushf => self.exec_pushf(insn),
            Op::Popf => self.exec_popf(insn),
            Op::Enter => self.exec_enter(insn),
            Op::Leave => self.exec_leave(insn),
            Op::LoadFar(seg) => self.exec_load_far(insn, seg),

            Op::Str(op) => self.exec_string(insn, op),

            Op::Jcc(cond) => self.exec_jcc(insn, cond),
            Op::Jmp => self.exec_jmp(insn),
            Op::JmpIndirect => self.exec_jmp_indirect(insn),
            Op::Call => self.exec_call(insn),
            Op::CallIndirect => self.exec_call_indirect(insn),
            Op::Ret => self.exec_ret(insn),
            Op::JmpFar | Op::JmpFarIndirect => self.exec_jmp_far(insn),
            Op::CallFar | Op::CallFarIndirect => self.exec_call_far(insn),
            Op::RetFar => self.exec_ret_far(insn),
            Op::Iret => {
                self.iret(insn.op32)?;
                Ok(Flow::Taken)
            }
            Op::Int3 => {
                self.software_interrupt(Exception::Breakpoint.vector())?;
                Ok(Flow::Taken)
            }
            Op::Int => {
                self.software_interrupt(insn.imm as u8)?;
                Ok(Flow::Taken)
            }
            Op::Into => self.exec_into(),
            Op::Loop | Op::Loope | Op::Loopne => self.exec_loop(insn),
            Op::Jcxz => self.exec_jcxz(insn),
            Op::Bound => self.exec_bound(insn),

            Op::In => self.exec_in(insn),
            Op::Out => self.exec_out(insn),

            Op::Cmpxchg => self.exec_cmpxchg(insn),
            Op::Cmpxchg8b => self.exec_cmpxchg8b(insn),
            Op::Xadd => self.exec_xadd(insn),

            Op::Sldt | Op::StoreTr => self.exec_store_system_selector(insn),
            Op::Lldt => self.exec_lldt(insn),
            Op::Ltr => self.exec_ltr(insn),
            Op::Verr | Op::Verw => self.exec_verify(insn),
            Op::Sgdt | Op::Sidt => self.exec_store_table(insn),
            Op::Lgdt | Op::Lidt => self.exec_load_table(insn),
            Op::Smsw => self.exec_smsw(insn),
            Op::Lmsw => self.exec_lmsw(insn),
            Op::Invlpg => self.exec_invlpg(insn),
            Op::Lar | Op::Lsl => self.exec_lar_lsl(insn),
            Op::Clts => self.exec_clts(),
            Op::MovFromCr => self.exec_mov_from_cr(insn),
            Op::MovToCr => self.exec_mov_to_cr(insn),
            Op::MovFromDr => self.exec_mov_from_dr(insn),
            Op::MovToDr => self.exec_mov_to_dr(insn),
            Op::Invd | Op::Wbinvd => self.exec_cache_flush(),
            Op::Wrmsr => self.exec_wrmsr(),
            Op::Rdmsr => self.exec_rdmsr(),
            Op::Rdtsc => self.exec_rdtsc(),
            Op::Cpuid => self.exec_cpuid(),
            Op::Syscall => self.exec_syscall(),
            Op::Sysret => self.exec_sysret(),
            Op::Arpl => self.exec_arpl(insn),
            Op::Hlt => self.exec_hlt(),

            Op::Fpu(op) => self.exec_fpu(insn, op),
            Op::Wait => self.exec_wait(),
            Op::Mmx(op) => self.exec_mmx(insn, op),
            Op::Emms => self.exec_emms(),

            Op::Ud2
            | Op::Invalid
            | Op::PrefixSeg(_)
            | Op::PrefixOpSize
            | Op::PrefixAddrSize
            | Op::PrefixLock
            | Op::PrefixRep
            | Op::PrefixRepne
            | Op::Escape0F
            | Op::Group(_)
            | Op::Esc => Err(Fault::ud()),
        }
    }

    // ---- operand access -----------------------------------------------------

    /// Offset of the ModRM memory operand.
    #[inline]
    pub(crate) fn ea_offset(&self, insn: &Insn) -> u32 {
        insn.ea.map_or(0, |ea| ea.offset(&self.state.regs))
    }

    /// `off + delta` within the instruction's address size.
    #[inline]
    pub(crate) fn ea_add(insn: &Insn, off: u32, delta: u32) -> u32 {
        let v = off.wrapping_add(delta);
        if insn.addr32 {
            v
        } else {
            v & 0xffff
        }
    }

    #[inline]
    fn moffs_seg(insn: &Insn) -> SegReg {
        insn.seg_override.unwrap_or(SegReg::Ds)
    }

    /// `(segment, offset)` of a memory operand, if `arg` names memory.
    pub(crate) fn mem_operand(&self, insn: &Insn, arg: Arg) -> Option<(SegReg, u32)> {
        match arg {
            Arg::Rm(_) | Arg::Mem | Arg::MmRm if !insn.rm_is_reg() => {
                Some((insn.mem_seg(), self.ea_offset(insn)))
            }
            Arg::Moffs(_) => Some((Self::moffs_seg(insn), insn.imm)),
            _ => None,
        }
    }

    /// Read an integer operand.
    pub(crate) fn read_arg(&mut self, insn: &Insn, arg: Arg) -> Result<u32, Fault> {
        Ok(match arg {
            Arg::Rm(w) => match insn.modrm {
                Some(m) if m.is_reg() => self.state.read_gpr(m.rm, w),
                _ => {
                    let off = self.ea_offset(insn);
                    return self.read_mem(insn.mem_seg(), off, w);
                }
            },
            Arg::Reg(w) => self.state.read_gpr(insn.reg_field(), w),
            Arg::Acc(w) => self.state.read_gpr(0, w),
            Arg::OpReg(w) => self.state.read_gpr(insn.opcode & 7, w),
            Arg::Imm(w) | Arg::ImmSx(w) => insn.imm & w.mask(),
            Arg::Imm8 => insn.imm & 0xff,
            Arg::Imm16 => insn.imm & 0xffff,
            Arg::Moffs(w) => return self.read_mem(Self::moffs_seg(insn), insn.imm, w),
            Arg::One => 1,
            Arg::Cl => self.state.read_gpr(Gpr::Ecx as u8, Width::W8),
            Arg::Dx => self.state.read_gpr(Gpr::Edx as u8, Width::W16),
            Arg::Sreg => match SegReg::from_index(insn.reg_field()) {
                Some(seg) => u32::from(self.state.seg(seg).selector),
                None => return Err(Fault::ud()),
            },
            _ => return Err(Fault::ud()),
        })
    }

    /// Write an integer operand.
    pub(crate) fn write_arg(&mut self, insn: &Insn, arg: Arg, value: u32) -> Result<(), Fault> {
        match arg {
            Arg::Rm(w) => match insn.modrm {
                Some(m) if m.is_reg() => self.state.write_gpr(m.rm, w, value),
                _ => {
                    let off = self.ea_offset(insn);
                    return self.write_mem(insn.mem_seg(), off, w, value);
                }
            },
            Arg::Reg(w) => self.state.write_gpr(insn.reg_field(), w, value),
            Arg::Acc(w) => self.state.write_gpr(0, w, value),
            Arg::OpReg(w) => self.state.write_gpr(insn.opcode & 7, w, value),
            Arg::Moffs(w) => return self.write_mem(Self::moffs_seg(insn), insn.imm, w, value),
            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    /// Resolve a read-modify-write destination. Memory destinations are
    /// checked for writing up front so the later store cannot fault.
    pub(crate) fn locate(&mut self, insn: &Insn, arg: Arg) -> Result<Loc, Fault> {
        let w = width_of(arg);
        if let Some((seg, off)) = self.mem_operand(insn, arg) {
            if self.state.model() == CpuModel::I8088 {
                return Ok(Loc::Mem(seg, off, w));
            }
            let v = self.validate(seg, off, w.bytes(), AccessType::Write)?;
            return Ok(Loc::Checked(v, w));
        }
        let index = match arg {
            Arg::Rm(_) => insn.modrm.map_or(0, |m| m.rm),
            Arg::Reg(_) => insn.reg_field(),
            Arg::Acc(_) => 0,
            Arg::OpReg(_) => insn.opcode & 7,
            _ => return Err(Fault::ud()),
        };
        Ok(Loc::Reg(index, w))
    }

    pub(crate) fn load(&mut self, loc: Loc) -> Result<u32, Fault> {
        match loc {
            Loc::Reg(i, w) => Ok(self.state.read_gpr(i, w)),
            Loc::Mem(seg, off, w) => self.read_mem(seg, off, w),
            Loc::Checked(v, w) => Ok(self.read_validated(&v) as u32 & w.mask()),
        }
    }

    pub(crate) fn store(&mut self, loc: Loc, value: u32) -> Result<(), Fault> {
        match loc {
            Loc::Reg(i, w) => self.state.write_gpr(i, w, value),
            Loc::Mem(seg, off, w) => self.write_mem(seg, off, w, value)?,
            Loc::Checked(v, w) => self.write_validated(&v, u64::from(value & w.mask())),
        }
        Ok(())
    }

    /// Privileged instruction gate: CPL 0 in protected mode (V86 runs at CPL 3).
    pub(crate) fn require_cpl0(&self) -> Result<(), Fault> {
        if self.state.protected_mode() && self.state.cpl != 0 {
            Err(Fault::gp0())
        } else {
            Ok(())
        }
    }

    /// Instructions that only exist in protected mode proper.
    pub(crate) fn require_protected(&self) -> Result<(), Fault> {
        if !self.state.protected_mode() || self.state.vm86() {
            Err(Fault::ud())
        } else {
            Ok(())
        }
    }
}

/// Width of an operand descriptor; byte for descriptors without one.
#[inline]
pub(crate) fn width_of(arg: Arg) -> Width {
    arg.width().unwrap_or(Width::W8)
}

#[cfg(test)]
mod tests;
