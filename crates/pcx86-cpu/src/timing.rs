//! Instruction timing.
//!
//! Costs are approximations keyed by a coarse timing class. Two tables exist:
//! one for the 8088 through 386 (microcoded, memory operands cost extra
//! cycles for address generation) and one for 486-class parts (pipelined,
//! most simple instructions retire in a cycle).

use crate::decode::{Arg, Insn, MulOp, Op};
use crate::model::CpuModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimingClass {
    /// MOV, LEA, flag ops, NOP.
    Simple,
    Alu,
    Shift,
    Mul,
    Div,
    Push,
    Pop,
    /// Jcc/JMP/CALL/RET/LOOP.
    Branch,
    FarBranch,
    /// One string-instruction iteration.
    String,
    Io,
    Interrupt,
    SegLoad,
    System,
    Bcd,
    Fpu,
    Mmx,
}

impl TimingClass {
    pub fn of(op: Op) -> TimingClass {
        match op {
            Op::Alu(_)
            | Op::Test
            | Op::Inc
            | Op::Dec
            | Op::Not
            | Op::Neg
            | Op::Bit(_)
            | Op::Bsf
            | Op::Bsr
            | Op::Bswap
            | Op::Setcc(_)
            | Op::Cmpxchg
            | Op::Xadd
            | Op::Xchg
            | Op::Movzx
            | Op::Movsx => TimingClass::Alu,
            Op::Shift(_) | Op::Shld | Op::Shrd => TimingClass::Shift,
            Op::MulDiv(MulOp::Mul | MulOp::Imul) | Op::Imul2 | Op::Imul3 => TimingClass::Mul,
            Op::MulDiv(MulOp::Div | MulOp::Idiv) => TimingClass::Div,
            Op::Push | Op::PushSeg(_) | Op::Pushf | Op::Pusha | Op::Enter => TimingClass::Push,
            Op::Pop | Op::Popf | Op::Popa | Op::Leave => TimingClass::Pop,
            Op::Jcc(_)
            | Op::Jmp
            | Op::JmpIndirect
            | Op::Call
            | Op::CallIndirect
            | Op::Ret
            | Op::Loop
            | Op::Loope
            | Op::Loopne
            | Op::Jcxz => TimingClass::Branch,
            Op::JmpFar
            | Op::JmpFarIndirect
            | Op::CallFar
            | Op::CallFarIndirect
            | Op::RetFar
            | Op::Iret
            | Op::Syscall
            | Op::Sysret => TimingClass::FarBranch,
            Op::Str(_) => TimingClass::String,
            Op::In | Op::Out => TimingClass::Io,
            Op::Int | Op::Int3 | Op::Into | Op::Bound => TimingClass::Interrupt,
            Op::MovToSeg | Op::PopSeg(_) | Op::LoadFar(_) | Op::PopCs => TimingClass::SegLoad,
            Op::Daa | Op::Das | Op::Aaa | Op::Aas | Op::Aam | Op::Aad => TimingClass::Bcd,
            Op::Sldt
            | Op::StoreTr
            | Op::Lldt
            | Op::Ltr
            | Op::Verr
            | Op::Verw
            | Op::Sgdt
            | Op::Sidt
            | Op::Lgdt
            | Op::Lidt
            | Op::Smsw
            | Op::Lmsw
            | Op::Invlpg
            | Op::Lar
            | Op::Lsl
            | Op::Clts
            | Op::MovFromCr
            | Op::MovToCr
            | Op::MovFromDr
            | Op::MovToDr
            | Op::Invd
            | Op::Wbinvd
            | Op::Wrmsr
            | Op::Rdtsc
            | Op::Rdmsr
            | Op::Cpuid
            | Op::Arpl
            | Op::Hlt => TimingClass::System,
            Op::Fpu(_) | Op::Wait => TimingClass::Fpu,
            Op::Mmx(_) | Op::Emms => TimingClass::Mmx,
            _ => TimingClass::Simple,
        }
    }
}

/// (base, memory surcharge, taken-branch surcharge) for ≤386 parts.
const fn legacy(class: TimingClass) -> (u32, u32, u32) {
    match class {
        TimingClass::Simple => (2, 4, 0),
        TimingClass::Alu => (2, 5, 0),
        TimingClass::Shift => (3, 5, 0),
        TimingClass::Mul => (14, 4, 0),
        TimingClass::Div => (22, 4, 0),
        TimingClass::Push => (2, 3, 0),
        TimingClass::Pop => (4, 3, 0),
        TimingClass::Branch => (3, 4, 7),
        TimingClass::FarBranch => (17, 5, 0),
        TimingClass::String => (7, 0, 0),
        TimingClass::Io => (12, 0, 0),
        TimingClass::Interrupt => (37, 0, 0),
        TimingClass::SegLoad => (7, 4, 0),
        TimingClass::System => (10, 4, 0),
        TimingClass::Bcd => (4, 0, 0),
        TimingClass::Fpu => (20, 4, 0),
        TimingClass::Mmx => (2, 1, 0),
    }
}

/// (base, memory surcharge, taken-branch surcharge) for 486-class parts.
const fn i486(class: TimingClass) -> (u32, u32, u32) {
    match class {
        TimingClass::Simple => (1, 0, 0),
        TimingClass::Alu => (1, 1, 0),
        TimingClass::Shift => (2, 1, 0),
        TimingClass::Mul => (13, 0, 0),
        TimingClass::Div => (24, 0, 0),
        TimingClass::Push => (1, 2, 0),
        TimingClass::Pop => (1, 3, 0),
        TimingClass::Branch => (1, 0, 2),
        TimingClass::FarBranch => (13, 0, 0),
        TimingClass::String => (4, 0, 0),
        TimingClass::Io => (14, 0, 0),
        TimingClass::Interrupt => (26, 0, 0),
        TimingClass::SegLoad => (3, 2, 0),
        TimingClass::System => (8, 2, 0),
        TimingClass::Bcd => (3, 0, 0),
        TimingClass::Fpu => (8, 1, 0),
        TimingClass::Mmx => (1, 0, 0),
    }
}

fn has_memory_operand(insn: &Insn) -> bool {
    insn.ea.is_some()
        || matches!(insn.dst, Arg::Moffs(_))
        || matches!(insn.src, Arg::Moffs(_))
}

/// Cycles consumed by `insn`. `iterations` counts string-instruction
/// repetitions (1 for everything else).
pub fn cost(insn: &Insn, model: CpuModel, taken: bool, iterations: u32) -> u32 {
    let class = TimingClass::of(insn.op);
    let (base, mem, branch) = if model.is_486_class() {
        i486(class)
    } else {
        legacy(class)
    };
    let mut cycles = base;
    if has_memory_operand(insn) {
        cycles += mem;
    }
    if taken {
        cycles += branch;
    }
    if class == TimingClass::String {
        cycles = cycles.max(1) * iterations.max(1);
    }
    // The 8088's 8-bit bus roughly doubles the cost of everything.
    if model == CpuModel::I8088 {
        cycles *= 2;
    }
    cycles
}

/// Cost charged for an instruction that faulted, including exception entry.
pub fn fault_cost(model: CpuModel) -> u32 {
    if model.is_486_class() {
        i486(TimingClass::Interrupt).0
    } else {
        legacy(TimingClass::Interrupt).0
    }
}
