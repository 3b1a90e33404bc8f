//! Table-driven instruction decoder.
//!
//! Every opcode byte, prefixes included, has an [`Entry`] in a table indexed by
//! the byte and the current operand-size bit. Prefix entries update the decode
//! context and continue with the next byte; `0F` switches to the two-byte
//! table; a REP/REPNE prefix selects the REP tables, which only hold string
//! instructions and otherwise fall back to the unprefixed table. The
//! interpreter and the translator both dispatch on the resulting [`Op`], so they
//! agree on which opcodes exist by construction.

mod modrm;
pub mod tables;

pub use modrm::EffAddr;

use crate::exceptions::Fault;
use crate::model::{CpuFeatures, CpuModel};
use crate::types::{Cond, SegReg, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub const fn from_index(i: u8) -> AluOp {
        match i & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    /// `/6`: undocumented alias of SHL.
    Sal,
    Sar,
}

impl ShiftOp {
    pub const fn from_index(i: u8) -> ShiftOp {
        match i & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            6 => ShiftOp::Sal,
            _ => ShiftOp::Sar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulOp {
    Mul,
    Imul,
    Div,
    Idiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

/// x87 memory operand format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuMem {
    F32,
    F64,
    F80,
    I16,
    I32,
    I64,
    Bcd,
}

impl FpuMem {
    pub const fn bytes(self) -> u32 {
        match self {
            FpuMem::F32 | FpuMem::I32 => 4,
            FpuMem::F64 | FpuMem::I64 => 8,
            FpuMem::F80 | FpuMem::Bcd => 10,
            FpuMem::I16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuArith {
    Add,
    Mul,
    Sub,
    Subr,
    Div,
    Divr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuOp {
    Invalid,
    Fld(FpuMem),
    Fst(FpuMem),
    Fstp(FpuMem),
    /// ST(0) = ST(0) op mem.
    ArithMem(FpuArith, FpuMem),
    ComMem(FpuMem),
    ComPMem(FpuMem),
    Fldcw,
    Fnstcw,
    Fnstsw,
    Fldenv,
    Fnstenv,
    Frstor,
    Fnsave,
    /// ST(0) = ST(0) op ST(i).
    ArithSt0(FpuArith),
    /// ST(i) = ST(i) op ST(0).
    ArithSti(FpuArith),
    /// ST(i) = ST(i) op ST(0), then pop.
    ArithStiPop(FpuArith),
    FldSti,
    FstSti,
    FstpSti,
    Fxch,
    FcomSti,
    FcompSti,
    Fcompp,
    FucomSti,
    FucompSti,
    Fucompp,
    Ffree,
    Fchs,
    Fabs,
    Ftst,
    Fxam,
    Fld1,
    Fldl2t,
    Fldl2e,
    Fldpi,
    Fldlg2,
    Fldln2,
    Fldz,
    F2xm1,
    Fyl2x,
    Fptan,
    Fpatan,
    Fxtract,
    Fprem1,
    Fdecstp,
    Fincstp,
    Fprem,
    Fyl2xp1,
    Fsqrt,
    Fsincos,
    Frndint,
    Fscale,
    Fsin,
    Fcos,
    Fnop,
    Fnclex,
    Fninit,
    FnstswAx,
    /// FENI/FDISI/FSETPM: no-ops past the 8087.
    Fignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    B,
    W,
    D,
    Q,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sat {
    Wrap,
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmxOp {
    /// MOVD mm, r/m32.
    MovdLoad,
    /// MOVD r/m32, mm.
    MovdStore,
    MovqLoad,
    MovqStore,
    Padd(Lane, Sat),
    Psub(Lane, Sat),
    Pcmpeq(Lane),
    Pcmpgt(Lane),
    Pand,
    Pandn,
    Por,
    Pxor,
    Psll(Lane),
    Psrl(Lane),
    Psra(Lane),
    Pmullw,
    Pmulhw,
    Pmaddwd,
    Packsswb,
    Packssdw,
    Packuswb,
    Punpckl(Lane),
    Punpckh(Lane),
}

/// Group tables, resolved through the ModRM `reg` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    G1Eb,
    G1Ev,
    G1EvIb,
    G2EbIb,
    G2EvIb,
    G2Eb1,
    G2Ev1,
    G2EbCl,
    G2EvCl,
    G3Eb,
    G3Ev,
    G4,
    G5,
    G1a,
    G11Eb,
    G11Ev,
    G6,
    G7,
    G8,
    G9,
    G12,
    G13,
    G14,
}

pub const GROUP_COUNT: usize = 23;

/// Operation selected by the dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Invalid,
    PrefixSeg(SegReg),
    PrefixOpSize,
    PrefixAddrSize,
    PrefixLock,
    PrefixRep,
    PrefixRepne,
    Escape0F,
    Group(GroupId),
    /// D8..DF; resolved to [`Op::Fpu`].
    Esc,

    Alu(AluOp),
    Test,
    Inc,
    Dec,
    Not,
    Neg,
    MulDiv(MulOp),
    Imul2,
    Imul3,
    Shift(ShiftOp),
    Shld,
    Shrd,
    Bit(BitOp),
    Bsf,
    Bsr,
    Bswap,
    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,
    Salc,

    Mov,
    MovToSeg,
    MovFromSeg,
    Movzx,
    Movsx,
    Lea,
    Xchg,
    Xlat,
    Cbw,
    Cwd,
    Lahf,
    Sahf,
    Push,
    Pop,
    PushSeg(SegReg),
    PopSeg(SegReg),
    Pusha,
    Popa,
    Pushf,
    Popf,
    Enter,
    Leave,
    Bound,
    LoadFar(SegReg),

    Nop,
    Hlt,
    Cmc,
    Clc,
    Stc,
    Cli,
    Sti,
    Cld,
    Std,
    Wait,

    Str(StrOp),

    Jcc(Cond),
    Jmp,
    JmpFar,
    JmpIndirect,
    JmpFarIndirect,
    Call,
    CallFar,
    CallIndirect,
    CallFarIndirect,
    Ret,
    RetFar,
    Iret,
    Int3,
    Int,
    Into,
    Loop,
    Loope,
    Loopne,
    Jcxz,

    In,
    Out,
    Setcc(Cond),
    Cmpxchg,
    Cmpxchg8b,
    Xadd,

    Sldt,
    StoreTr,
    Lldt,
    Ltr,
    Verr,
    Verw,
    Sgdt,
    Sidt,
    Lgdt,
    Lidt,
    Smsw,
    Lmsw,
    Invlpg,
    Lar,
    Lsl,
    Clts,
    MovFromCr,
    MovToCr,
    MovFromDr,
    MovToDr,
    Invd,
    Wbinvd,
    Wrmsr,
    Rdtsc,
    Rdmsr,
    Cpuid,
    Syscall,
    Sysret,
    Arpl,
    Ud2,
    /// 8088 `0F`.
    PopCs,

    Fpu(FpuOp),
    Mmx(MmxOp),
    Emms,
}

impl Op {
    /// Instructions after which a translated block must end: control
    /// transfers and anything that changes mode, privilege or the code
    /// translation context.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            Op::Jcc(_)
                | Op::Jmp
                | Op::JmpFar
                | Op::JmpIndirect
                | Op::JmpFarIndirect
                | Op::Call
                | Op::CallFar
                | Op::CallIndirect
                | Op::CallFarIndirect
                | Op::Ret
                | Op::RetFar
                | Op::Iret
                | Op::Int3
                | Op::Int
                | Op::Into
                | Op::Loop
                | Op::Loope
                | Op::Loopne
                | Op::Jcxz
                | Op::Hlt
                | Op::Sti
                | Op::Cli
                | Op::Popf
                | Op::MovToSeg
                | Op::PopSeg(_)
                | Op::LoadFar(SegReg::Ss)
                | Op::PopCs
                | Op::Lldt
                | Op::Ltr
                | Op::Lgdt
                | Op::Lidt
                | Op::Lmsw
                | Op::Clts
                | Op::MovToCr
                | Op::MovToDr
                | Op::Invlpg
                | Op::Invd
                | Op::Wbinvd
                | Op::Wrmsr
                | Op::Syscall
                | Op::Sysret
                | Op::Bound
                | Op::Ud2
                | Op::Invalid
        )
    }
}

/// Operand descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arg {
    None,
    /// ModRM r/m.
    Rm(Width),
    /// ModRM reg.
    Reg(Width),
    /// ModRM memory operand; register forms are #UD.
    Mem,
    Imm(Width),
    /// 8-bit immediate sign-extended to the given width.
    ImmSx(Width),
    Imm8,
    Imm16,
    Acc(Width),
    /// Register encoded in the low three opcode bits.
    OpReg(Width),
    /// Segment register in ModRM reg.
    Sreg,
    /// Direct memory offset (A0..A3).
    Moffs(Width),
    Rel(Width),
    FarPtr,
    One,
    Cl,
    Dx,
    Creg,
    Dreg,
    MmReg,
    MmRm,
    /// String instruction element width.
    Str(Width),
}

impl Arg {
    const fn needs_modrm(self) -> bool {
        matches!(
            self,
            Arg::Rm(_)
                | Arg::Reg(_)
                | Arg::Mem
                | Arg::Sreg
                | Arg::Creg
                | Arg::Dreg
                | Arg::MmReg
                | Arg::MmRm
        )
    }

    /// Width of a general-purpose operand, if it has one.
    pub const fn width(self) -> Option<Width> {
        match self {
            Arg::Rm(w)
            | Arg::Reg(w)
            | Arg::Imm(w)
            | Arg::ImmSx(w)
            | Arg::Acc(w)
            | Arg::OpReg(w)
            | Arg::Moffs(w)
            | Arg::Str(w) => Some(w),
            Arg::Imm8 => Some(Width::W8),
            Arg::Imm16 | Arg::Sreg => Some(Width::W16),
            _ => None,
        }
    }
}

/// Minimum model or feature an entry requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Req {
    Any,
    /// 80186/80286 additions.
    I186,
    I286,
    I386,
    I486,
    Pentium,
    Cx8,
    Mmx,
    Syscall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rep {
    None,
    /// REP / REPE.
    Repe,
    Repne,
}

/// One dispatch table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub op: Op,
    pub dst: Arg,
    pub src: Arg,
    pub src2: Arg,
    pub req: Req,
    pub lockable: bool,
    pub rep: Rep,
}

impl Entry {
    pub const INVALID: Entry = Entry::new(Op::Invalid, Arg::None, Arg::None);

    pub const fn new(op: Op, dst: Arg, src: Arg) -> Entry {
        Entry {
            op,
            dst,
            src,
            src2: Arg::None,
            req: Req::Any,
            lockable: false,
            rep: Rep::None,
        }
    }

    pub const fn op(op: Op) -> Entry {
        Entry::new(op, Arg::None, Arg::None)
    }

    pub const fn src2(mut self, a: Arg) -> Entry {
        self.src2 = a;
        self
    }

    pub const fn req(mut self, r: Req) -> Entry {
        self.req = r;
        self
    }

    pub const fn lockable(mut self) -> Entry {
        self.lockable = true;
        self
    }

    pub const fn with_rep(mut self, rep: Rep) -> Entry {
        self.rep = rep;
        self
    }

    const fn needs_modrm(&self) -> bool {
        matches!(self.op, Op::Group(_) | Op::Esc)
            || self.dst.needs_modrm()
            || self.src.needs_modrm()
            || self.src2.needs_modrm()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    #[inline]
    pub const fn from_byte(b: u8) -> ModRm {
        ModRm {
            md: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        }
    }

    #[inline]
    pub const fn is_reg(&self) -> bool {
        self.md == 3
    }
}

/// A fully decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub op: Op,
    pub dst: Arg,
    pub src: Arg,
    pub src2: Arg,
    /// Final opcode byte (after `0F`, if any).
    pub opcode: u8,
    pub two_byte: bool,
    pub op32: bool,
    pub addr32: bool,
    pub seg_override: Option<SegReg>,
    pub lock: bool,
    pub rep: Rep,
    pub modrm: Option<ModRm>,
    pub ea: Option<EffAddr>,
    pub imm: u32,
    pub imm2: u32,
    pub len: u8,
}

impl Insn {
    #[inline]
    pub fn op_width(&self) -> Width {
        Width::from_op32(self.op32)
    }

    #[inline]
    pub fn reg_field(&self) -> u8 {
        self.modrm.map_or(0, |m| m.reg)
    }

    #[inline]
    pub fn rm_is_reg(&self) -> bool {
        self.modrm.is_some_and(|m| m.is_reg())
    }

    /// Segment used by the memory operand.
    #[inline]
    pub fn mem_seg(&self) -> SegReg {
        match (self.seg_override, self.ea) {
            (Some(s), _) => s,
            (None, Some(ea)) => ea.default_seg,
            (None, None) => SegReg::Ds,
        }
    }
}

/// Mode and model information the decoder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeCtx {
    pub model: CpuModel,
    pub features: CpuFeatures,
    /// Default operand and address size is 32-bit.
    pub code32: bool,
}

impl DecodeCtx {
    fn max_len(&self) -> u32 {
        match self.model {
            // No architectural limit; bounded by the 64K code segment.
            CpuModel::I8088 => 0x1_0000,
            CpuModel::I286 => 10,
            _ => 15,
        }
    }

    fn allows(&self, req: Req) -> bool {
        match req {
            Req::Any => true,
            Req::I186 => self.model >= CpuModel::I286,
            Req::I286 => self.model >= CpuModel::I286,
            Req::I386 => self.model >= CpuModel::I386,
            Req::I486 => self.model >= CpuModel::I486,
            Req::Pentium => self.model >= CpuModel::Pentium,
            Req::Cx8 => self.features.contains(CpuFeatures::CX8),
            Req::Mmx => self.features.contains(CpuFeatures::MMX),
            Req::Syscall => self.features.contains(CpuFeatures::SYSCALL),
        }
    }
}

/// Opcodes the 8088 decodes as aliases of other opcodes.
const fn alias_8088(b: u8) -> u8 {
    match b {
        0x60..=0x6f => b + 0x10,
        0xc0 => 0xc2,
        0xc1 => 0xc3,
        0xc8 => 0xca,
        0xc9 => 0xcb,
        0xf1 => 0xf0,
        _ => b,
    }
}

/// Decode one instruction. `fetch(i)` returns the `i`-th byte of the
/// instruction (relative to its first byte) and may fault.
pub fn decode<F>(ctx: &DecodeCtx, mut fetch: F) -> Result<Insn, Fault>
where
    F: FnMut(u32) -> Result<u8, Fault>,
{
    let mut len = 0u32;
    let mut next = |len: &mut u32| -> Result<u8, Fault> {
        if *len >= ctx.max_len() {
            return Err(Fault::gp0());
        }
        let b = fetch(*len)?;
        *len += 1;
        Ok(b)
    };

    let mut op32 = ctx.code32;
    let mut addr32 = ctx.code32;
    let mut seg_override = None;
    let mut lock = false;
    let mut rep = Rep::None;
    let mut two_byte = false;

    let (opcode, mut entry) = loop {
        let mut b = next(&mut len)?;
        let half = usize::from(op32);
        let entry = if two_byte {
            tables::TWO_BYTE[half][usize::from(b)]
        } else if ctx.model.is_8088() {
            if b == 0x0f {
                Entry::op(Op::PopCs)
            } else {
                b = alias_8088(b);
                tables::PRIMARY[half][usize::from(b)]
            }
        } else {
            tables::PRIMARY[half][usize::from(b)]
        };
        if !ctx.allows(entry.req) {
            return Err(Fault::ud());
        }
        match entry.op {
            Op::PrefixSeg(s) => seg_override = Some(s),
            Op::PrefixOpSize => op32 = !ctx.code32,
            Op::PrefixAddrSize => addr32 = !ctx.code32,
            Op::PrefixLock => lock = true,
            Op::PrefixRep => rep = Rep::Repe,
            Op::PrefixRepne => rep = Rep::Repne,
            Op::Escape0F => two_byte = true,
            _ => break (b, entry),
        }
    };

    // REP-prefixed context: string instructions have their own entries,
    // everything else falls back to the unprefixed table.
    let half = usize::from(op32);
    let mut insn_rep = Rep::None;
    if !two_byte && rep != Rep::None {
        let table = if rep == Rep::Repe {
            &tables::REPE
        } else {
            &tables::REPNE
        };
        let special = table[half][usize::from(opcode)];
        if special.op != Op::Invalid {
            entry = special;
            insn_rep = special.rep;
        }
    }

    let mut modrm = None;
    let mut ea = None;
    if entry.needs_modrm() {
        let m = ModRm::from_byte(next(&mut len)?);
        modrm = Some(m);
        match entry.op {
            Op::Group(g) => {
                let resolved = tables::group(g, m.reg, op32);
                if !ctx.allows(resolved.req) {
                    return Err(Fault::ud());
                }
                entry = resolved;
            }
            Op::Esc => {
                let esc = opcode - 0xd8;
                let op = if m.is_reg() {
                    let row = usize::from(esc) * 64 + usize::from(m.reg) * 8;
                    tables::FPU_REG[row + usize::from(m.rm)]
                } else {
                    tables::FPU_MEM[usize::from(esc) * 8 + usize::from(m.reg)]
                };
                if op == FpuOp::Invalid {
                    return Err(Fault::ud());
                }
                entry.op = Op::Fpu(op);
                if !m.is_reg() {
                    entry.dst = Arg::Mem;
                }
            }
            _ => {}
        }
        if entry.op == Op::Invalid {
            return Err(Fault::ud());
        }

        // MOV to/from CRn/DRn ignores `mod` and always names a register.
        let register_only = matches!(entry.dst, Arg::Creg | Arg::Dreg)
            || matches!(entry.src, Arg::Creg | Arg::Dreg);
        if !m.is_reg() && !register_only {
            ea = Some(modrm::decode_ea(m, addr32, &mut || next(&mut len))?);
        }
        let mem_only = matches!(entry.dst, Arg::Mem) || matches!(entry.src, Arg::Mem);
        if m.is_reg() && mem_only {
            return Err(Fault::ud());
        }
        if (entry.src == Arg::Sreg || entry.dst == Arg::Sreg) && !ctx.model.is_8088() {
            let valid = if ctx.model >= CpuModel::I386 { 6 } else { 4 };
            if m.reg >= valid || (entry.op == Op::MovToSeg && m.reg == 1) {
                return Err(Fault::ud());
            }
        }
    }

    if entry.op == Op::Invalid {
        return Err(Fault::ud());
    }
    if lock && !ctx.model.is_8088() && !(entry.lockable && ea.is_some()) {
        return Err(Fault::ud());
    }

    let mut imm = 0u32;
    let mut imm2 = 0u32;
    let mut have_imm = false;
    for arg in [entry.dst, entry.src, entry.src2] {
        let v = match arg {
            Arg::Imm(w) => read_le(&mut next, &mut len, w.bytes())?,
            Arg::ImmSx(w) => Width::W8.sign_extend(read_le(&mut next, &mut len, 1)?) & w.mask(),
            Arg::Imm8 => read_le(&mut next, &mut len, 1)?,
            Arg::Imm16 => read_le(&mut next, &mut len, 2)?,
            Arg::Moffs(_) => read_le(&mut next, &mut len, if addr32 { 4 } else { 2 })?,
            Arg::Rel(w) => w.sign_extend(read_le(&mut next, &mut len, w.bytes())?),
            Arg::FarPtr => {
                imm = read_le(&mut next, &mut len, if op32 { 4 } else { 2 })?;
                imm2 = read_le(&mut next, &mut len, 2)?;
                have_imm = true;
                continue;
            }
            _ => continue,
        };
        if have_imm {
            imm2 = v;
        } else {
            imm = v;
            have_imm = true;
        }
    }

    Ok(Insn {
        op: entry.op,
        dst: entry.dst,
        src: entry.src,
        src2: entry.src2,
        opcode,
        two_byte,
        op32,
        addr32,
        seg_override,
        lock,
        rep: insn_rep,
        modrm,
        ea,
        imm,
        imm2,
        len: len.min(255) as u8,
    })
}

fn read_le<N>(next: &mut N, len: &mut u32, bytes: u32) -> Result<u32, Fault>
where
    N: FnMut(&mut u32) -> Result<u8, Fault>,
{
    let mut v = 0u32;
    for i in 0..bytes {
        v |= u32::from(next(len)?) << (8 * i);
    }
    Ok(v)
}

#[cfg(test)]
mod tests;
