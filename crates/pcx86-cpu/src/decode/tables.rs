//! Opcode dispatch tables.
//!
//! Every table is built at compile time from a `const fn` so that the byte
//! layout is spelled out once. Tables are indexed `[operand-size bit][byte]`;
//! the two halves differ only in the width that `v`-sized operands resolve to.

use crate::types::{Cond, SegReg, Width};

use super::{
    AluOp, Arg, BitOp, Entry, FpuArith, FpuMem, FpuOp, GroupId, Lane, MmxOp, MulOp, Op, Rep, Req,
    Sat, ShiftOp, StrOp, GROUP_COUNT,
};

use Arg::{Acc, Imm, ImmSx, OpReg, Reg, Rm};
use Width::{W16, W32, W8};

const N: Arg = Arg::None;

const fn e(op: Op, dst: Arg, src: Arg) -> Entry {
    Entry::new(op, dst, src)
}

const fn o(op: Op) -> Entry {
    Entry::op(op)
}

const fn primary(b: u8, op32: bool) -> Entry {
    let v = Width::from_op32(op32);
    match b {
        // ALU block: 00..3F, eight ops x {Eb,Gb / Ev,Gv / Gb,Eb / Gv,Ev / AL,Ib / eAX,Iv}.
        0x00..=0x3f if b & 7 < 6 => {
            let op = Op::Alu(AluOp::from_index(b >> 3));
            let lock = !matches!(AluOp::from_index(b >> 3), AluOp::Cmp);
            match b & 7 {
                0 if lock => e(op, Rm(W8), Reg(W8)).lockable(),
                1 if lock => e(op, Rm(v), Reg(v)).lockable(),
                0 => e(op, Rm(W8), Reg(W8)),
                1 => e(op, Rm(v), Reg(v)),
                2 => e(op, Reg(W8), Rm(W8)),
                3 => e(op, Reg(v), Rm(v)),
                4 => e(op, Acc(W8), Imm(W8)),
                _ => e(op, Acc(v), Imm(v)),
            }
        }
        0x06 => o(Op::PushSeg(SegReg::Es)),
        0x07 => o(Op::PopSeg(SegReg::Es)),
        0x0e => o(Op::PushSeg(SegReg::Cs)),
        0x0f => o(Op::Escape0F),
        0x16 => o(Op::PushSeg(SegReg::Ss)),
        0x17 => o(Op::PopSeg(SegReg::Ss)),
        0x1e => o(Op::PushSeg(SegReg::Ds)),
        0x1f => o(Op::PopSeg(SegReg::Ds)),
        0x26 => o(Op::PrefixSeg(SegReg::Es)),
        0x27 => o(Op::Daa),
        0x2e => o(Op::PrefixSeg(SegReg::Cs)),
        0x2f => o(Op::Das),
        0x36 => o(Op::PrefixSeg(SegReg::Ss)),
        0x37 => o(Op::Aaa),
        0x3e => o(Op::PrefixSeg(SegReg::Ds)),
        0x3f => o(Op::Aas),
        0x40..=0x47 => e(Op::Inc, OpReg(v), N),
        0x48..=0x4f => e(Op::Dec, OpReg(v), N),
        0x50..=0x57 => e(Op::Push, OpReg(v), N),
        0x58..=0x5f => e(Op::Pop, OpReg(v), N),
        0x60 => o(Op::Pusha).req(Req::I186),
        0x61 => o(Op::Popa).req(Req::I186),
        0x62 => e(Op::Bound, Reg(v), Arg::Mem).req(Req::I186),
        0x63 => e(Op::Arpl, Rm(W16), Reg(W16)).req(Req::I286),
        0x64 => o(Op::PrefixSeg(SegReg::Fs)).req(Req::I386),
        0x65 => o(Op::PrefixSeg(SegReg::Gs)).req(Req::I386),
        0x66 => o(Op::PrefixOpSize).req(Req::I386),
        0x67 => o(Op::PrefixAddrSize).req(Req::I386),
        0x68 => e(Op::Push, Imm(v), N).req(Req::I186),
        0x69 => e(Op::Imul3, Reg(v), Rm(v)).src2(Imm(v)).req(Req::I186),
        0x6a => e(Op::Push, ImmSx(v), N).req(Req::I186),
        0x6b => e(Op::Imul3, Reg(v), Rm(v)).src2(ImmSx(v)).req(Req::I186),
        0x6c => e(Op::Str(StrOp::Ins), Arg::Str(W8), N).req(Req::I186),
        0x6d => e(Op::Str(StrOp::Ins), Arg::Str(v), N).req(Req::I186),
        0x6e => e(Op::Str(StrOp::Outs), Arg::Str(W8), N).req(Req::I186),
        0x6f => e(Op::Str(StrOp::Outs), Arg::Str(v), N).req(Req::I186),
        0x70..=0x7f => e(Op::Jcc(Cond::from_index(b)), Arg::Rel(W8), N),
        0x80 => e(Op::Group(GroupId::G1Eb), N, N),
        0x81 => e(Op::Group(GroupId::G1Ev), N, N),
        0x82 => e(Op::Group(GroupId::G1Eb), N, N),
        0x83 => e(Op::Group(GroupId::G1EvIb), N, N),
        0x84 => e(Op::Test, Rm(W8), Reg(W8)),
        0x85 => e(Op::Test, Rm(v), Reg(v)),
        0x86 => e(Op::Xchg, Rm(W8), Reg(W8)).lockable(),
        0x87 => e(Op::Xchg, Rm(v), Reg(v)).lockable(),
        0x88 => e(Op::Mov, Rm(W8), Reg(W8)),
        0x89 => e(Op::Mov, Rm(v), Reg(v)),
        0x8a => e(Op::Mov, Reg(W8), Rm(W8)),
        0x8b => e(Op::Mov, Reg(v), Rm(v)),
        0x8c => e(Op::MovFromSeg, Rm(W16), Arg::Sreg),
        0x8d => e(Op::Lea, Reg(v), Arg::Mem),
        0x8e => e(Op::MovToSeg, Arg::Sreg, Rm(W16)),
        0x8f => e(Op::Group(GroupId::G1a), N, N),
        0x90 => o(Op::Nop),
        0x91..=0x97 => e(Op::Xchg, OpReg(v), Acc(v)),
        0x98 => o(Op::Cbw),
        0x99 => o(Op::Cwd),
        0x9a => e(Op::CallFar, Arg::FarPtr, N),
        0x9b => o(Op::Wait),
        0x9c => o(Op::Pushf),
        0x9d => o(Op::Popf),
        0x9e => o(Op::Sahf),
        0x9f => o(Op::Lahf),
        0xa0 => e(Op::Mov, Acc(W8), Arg::Moffs(W8)),
        0xa1 => e(Op::Mov, Acc(v), Arg::Moffs(v)),
        0xa2 => e(Op::Mov, Arg::Moffs(W8), Acc(W8)),
        0xa3 => e(Op::Mov, Arg::Moffs(v), Acc(v)),
        0xa4 => e(Op::Str(StrOp::Movs), Arg::Str(W8), N),
        0xa5 => e(Op::Str(StrOp::Movs), Arg::Str(v), N),
        0xa6 => e(Op::Str(StrOp::Cmps), Arg::Str(W8), N),
        0xa7 => e(Op::Str(StrOp::Cmps), Arg::Str(v), N),
        0xa8 => e(Op::Test, Acc(W8), Imm(W8)),
        0xa9 => e(Op::Test, Acc(v), Imm(v)),
        0xaa => e(Op::Str(StrOp::Stos), Arg::Str(W8), N),
        0xab => e(Op::Str(StrOp::Stos), Arg::Str(v), N),
        0xac => e(Op::Str(StrOp::Lods), Arg::Str(W8), N),
        0xad => e(Op::Str(StrOp::Lods), Arg::Str(v), N),
        0xae => e(Op::Str(StrOp::Scas), Arg::Str(W8), N),
        0xaf => e(Op::Str(StrOp::Scas), Arg::Str(v), N),
        0xb0..=0xb7 => e(Op::Mov, OpReg(W8), Imm(W8)),
        0xb8..=0xbf => e(Op::Mov, OpReg(v), Imm(v)),
        0xc0 => e(Op::Group(GroupId::G2EbIb), N, N).req(Req::I186),
        0xc1 => e(Op::Group(GroupId::G2EvIb), N, N).req(Req::I186),
        0xc2 => e(Op::Ret, Arg::Imm16, N),
        0xc3 => o(Op::Ret),
        0xc4 => e(Op::LoadFar(SegReg::Es), Reg(v), Arg::Mem),
        0xc5 => e(Op::LoadFar(SegReg::Ds), Reg(v), Arg::Mem),
        0xc6 => e(Op::Group(GroupId::G11Eb), N, N),
        0xc7 => e(Op::Group(GroupId::G11Ev), N, N),
        0xc8 => e(Op::Enter, Arg::Imm16, Arg::Imm8).req(Req::I186),
        0xc9 => o(Op::Leave).req(Req::I186),
        0xca => e(Op::RetFar, Arg::Imm16, N),
        0xcb => o(Op::RetFar),
        0xcc => o(Op::Int3),
        0xcd => e(Op::Int, Arg::Imm8, N),
        0xce => o(Op::Into),
        0xcf => o(Op::Iret),
        0xd0 => e(Op::Group(GroupId::G2Eb1), N, N),
        0xd1 => e(Op::Group(GroupId::G2Ev1), N, N),
        0xd2 => e(Op::Group(GroupId::G2EbCl), N, N),
        0xd3 => e(Op::Group(GroupId::G2EvCl), N, N),
        0xd4 => e(Op::Aam, Arg::Imm8, N),
        0xd5 => e(Op::Aad, Arg::Imm8, N),
        0xd6 => o(Op::Salc),
        0xd7 => o(Op::Xlat),
        0xd8..=0xdf => o(Op::Esc),
        0xe0 => e(Op::Loopne, Arg::Rel(W8), N),
        0xe1 => e(Op::Loope, Arg::Rel(W8), N),
        0xe2 => e(Op::Loop, Arg::Rel(W8), N),
        0xe3 => e(Op::Jcxz, Arg::Rel(W8), N),
        0xe4 => e(Op::In, Acc(W8), Arg::Imm8),
        0xe5 => e(Op::In, Acc(v), Arg::Imm8),
        0xe6 => e(Op::Out, Arg::Imm8, Acc(W8)),
        0xe7 => e(Op::Out, Arg::Imm8, Acc(v)),
        0xe8 => e(Op::Call, Arg::Rel(v), N),
        0xe9 => e(Op::Jmp, Arg::Rel(v), N),
        0xea => e(Op::JmpFar, Arg::FarPtr, N),
        0xeb => e(Op::Jmp, Arg::Rel(W8), N),
        0xec => e(Op::In, Acc(W8), Arg::Dx),
        0xed => e(Op::In, Acc(v), Arg::Dx),
        0xee => e(Op::Out, Arg::Dx, Acc(W8)),
        0xef => e(Op::Out, Arg::Dx, Acc(v)),
        0xf0 => o(Op::PrefixLock),
        0xf1 => o(Op::Invalid),
        0xf2 => o(Op::PrefixRepne),
        0xf3 => o(Op::PrefixRep),
        0xf4 => o(Op::Hlt),
        0xf5 => o(Op::Cmc),
        0xf6 => e(Op::Group(GroupId::G3Eb), N, N),
        0xf7 => e(Op::Group(GroupId::G3Ev), N, N),
        0xf8 => o(Op::Clc),
        0xf9 => o(Op::Stc),
        0xfa => o(Op::Cli),
        0xfb => o(Op::Sti),
        0xfc => o(Op::Cld),
        0xfd => o(Op::Std),
        0xfe => e(Op::Group(GroupId::G4), N, N),
        0xff => e(Op::Group(GroupId::G5), N, N),
        _ => Entry::INVALID,
    }
}

const fn mmx(op: MmxOp) -> Entry {
    e(Op::Mmx(op), Arg::MmReg, Arg::MmRm).req(Req::Mmx)
}

const fn two_byte(b: u8, op32: bool) -> Entry {
    let v = Width::from_op32(op32);
    match b {
        0x00 => e(Op::Group(GroupId::G6), N, N).req(Req::I286),
        0x01 => e(Op::Group(GroupId::G7), N, N).req(Req::I286),
        0x02 => e(Op::Lar, Reg(v), Rm(W16)).req(Req::I286),
        0x03 => e(Op::Lsl, Reg(v), Rm(W16)).req(Req::I286),
        0x05 => o(Op::Syscall).req(Req::Syscall),
        0x06 => o(Op::Clts).req(Req::I286),
        0x07 => o(Op::Sysret).req(Req::Syscall),
        0x08 => o(Op::Invd).req(Req::I486),
        0x09 => o(Op::Wbinvd).req(Req::I486),
        0x0b => o(Op::Ud2).req(Req::I286),
        0x20 => e(Op::MovFromCr, Rm(W32), Arg::Creg).req(Req::I386),
        0x21 => e(Op::MovFromDr, Rm(W32), Arg::Dreg).req(Req::I386),
        0x22 => e(Op::MovToCr, Arg::Creg, Rm(W32)).req(Req::I386),
        0x23 => e(Op::MovToDr, Arg::Dreg, Rm(W32)).req(Req::I386),
        0x30 => o(Op::Wrmsr).req(Req::Pentium),
        0x31 => o(Op::Rdtsc).req(Req::Pentium),
        0x32 => o(Op::Rdmsr).req(Req::Pentium),
        0x60 => mmx(MmxOp::Punpckl(Lane::B)),
        0x61 => mmx(MmxOp::Punpckl(Lane::W)),
        0x62 => mmx(MmxOp::Punpckl(Lane::D)),
        0x63 => mmx(MmxOp::Packsswb),
        0x64 => mmx(MmxOp::Pcmpgt(Lane::B)),
        0x65 => mmx(MmxOp::Pcmpgt(Lane::W)),
        0x66 => mmx(MmxOp::Pcmpgt(Lane::D)),
        0x67 => mmx(MmxOp::Packuswb),
        0x68 => mmx(MmxOp::Punpckh(Lane::B)),
        0x69 => mmx(MmxOp::Punpckh(Lane::W)),
        0x6a => mmx(MmxOp::Punpckh(Lane::D)),
        0x6b => mmx(MmxOp::Packssdw),
        0x6e => e(Op::Mmx(MmxOp::MovdLoad), Arg::MmReg, Rm(W32)).req(Req::Mmx),
        0x6f => mmx(MmxOp::MovqLoad),
        0x71 => e(Op::Group(GroupId::G12), N, N).req(Req::Mmx),
        0x72 => e(Op::Group(GroupId::G13), N, N).req(Req::Mmx),
        0x73 => e(Op::Group(GroupId::G14), N, N).req(Req::Mmx),
        0x74 => mmx(MmxOp::Pcmpeq(Lane::B)),
        0x75 => mmx(MmxOp::Pcmpeq(Lane::W)),
        0x76 => mmx(MmxOp::Pcmpeq(Lane::D)),
        0x77 => o(Op::Emms).req(Req::Mmx),
        0x7e => e(Op::Mmx(MmxOp::MovdStore), Rm(W32), Arg::MmReg).req(Req::Mmx),
        0x7f => e(Op::Mmx(MmxOp::MovqStore), Arg::MmRm, Arg::MmReg).req(Req::Mmx),
        0x80..=0x8f => e(Op::Jcc(Cond::from_index(b)), Arg::Rel(v), N).req(Req::I386),
        0x90..=0x9f => e(Op::Setcc(Cond::from_index(b)), Rm(W8), N).req(Req::I386),
        0xa0 => o(Op::PushSeg(SegReg::Fs)).req(Req::I386),
        0xa1 => o(Op::PopSeg(SegReg::Fs)).req(Req::I386),
        0xa2 => o(Op::Cpuid).req(Req::Pentium),
        0xa3 => e(Op::Bit(BitOp::Bt), Rm(v), Reg(v)).req(Req::I386),
        0xa4 => e(Op::Shld, Rm(v), Reg(v)).src2(Arg::Imm8).req(Req::I386),
        0xa5 => e(Op::Shld, Rm(v), Reg(v)).src2(Arg::Cl).req(Req::I386),
        0xa8 => o(Op::PushSeg(SegReg::Gs)).req(Req::I386),
        0xa9 => o(Op::PopSeg(SegReg::Gs)).req(Req::I386),
        0xab => e(Op::Bit(BitOp::Bts), Rm(v), Reg(v)).req(Req::I386).lockable(),
        0xac => e(Op::Shrd, Rm(v), Reg(v)).src2(Arg::Imm8).req(Req::I386),
        0xad => e(Op::Shrd, Rm(v), Reg(v)).src2(Arg::Cl).req(Req::I386),
        0xaf => e(Op::Imul2, Reg(v), Rm(v)).req(Req::I386),
        0xb0 => e(Op::Cmpxchg, Rm(W8), Reg(W8)).req(Req::I486).lockable(),
        0xb1 => e(Op::Cmpxchg, Rm(v), Reg(v)).req(Req::I486).lockable(),
        0xb2 => e(Op::LoadFar(SegReg::Ss), Reg(v), Arg::Mem).req(Req::I386),
        0xb3 => e(Op::Bit(BitOp::Btr), Rm(v), Reg(v)).req(Req::I386).lockable(),
        0xb4 => e(Op::LoadFar(SegReg::Fs), Reg(v), Arg::Mem).req(Req::I386),
        0xb5 => e(Op::LoadFar(SegReg::Gs), Reg(v), Arg::Mem).req(Req::I386),
        0xb6 => e(Op::Movzx, Reg(v), Rm(W8)).req(Req::I386),
        0xb7 => e(Op::Movzx, Reg(v), Rm(W16)).req(Req::I386),
        0xba => e(Op::Group(GroupId::G8), N, N).req(Req::I386),
        0xbb => e(Op::Bit(BitOp::Btc), Rm(v), Reg(v)).req(Req::I386).lockable(),
        0xbc => e(Op::Bsf, Reg(v), Rm(v)).req(Req::I386),
        0xbd => e(Op::Bsr, Reg(v), Rm(v)).req(Req::I386),
        0xbe => e(Op::Movsx, Reg(v), Rm(W8)).req(Req::I386),
        0xbf => e(Op::Movsx, Reg(v), Rm(W16)).req(Req::I386),
        0xc0 => e(Op::Xadd, Rm(W8), Reg(W8)).req(Req::I486).lockable(),
        0xc1 => e(Op::Xadd, Rm(v), Reg(v)).req(Req::I486).lockable(),
        0xc7 => e(Op::Group(GroupId::G9), N, N).req(Req::Pentium),
        0xc8..=0xcf => e(Op::Bswap, OpReg(W32), N).req(Req::I486),
        0xd1 => mmx(MmxOp::Psrl(Lane::W)),
        0xd2 => mmx(MmxOp::Psrl(Lane::D)),
        0xd3 => mmx(MmxOp::Psrl(Lane::Q)),
        0xd5 => mmx(MmxOp::Pmullw),
        0xd8 => mmx(MmxOp::Psub(Lane::B, Sat::Unsigned)),
        0xd9 => mmx(MmxOp::Psub(Lane::W, Sat::Unsigned)),
        0xdb => mmx(MmxOp::Pand),
        0xdc => mmx(MmxOp::Padd(Lane::B, Sat::Unsigned)),
        0xdd => mmx(MmxOp::Padd(Lane::W, Sat::Unsigned)),
        0xdf => mmx(MmxOp::Pandn),
        0xe1 => mmx(MmxOp::Psra(Lane::W)),
        0xe2 => mmx(MmxOp::Psra(Lane::D)),
        0xe5 => mmx(MmxOp::Pmulhw),
        0xe8 => mmx(MmxOp::Psub(Lane::B, Sat::Signed)),
        0xe9 => mmx(MmxOp::Psub(Lane::W, Sat::Signed)),
        0xeb => mmx(MmxOp::Por),
        0xec => mmx(MmxOp::Padd(Lane::B, Sat::Signed)),
        0xed => mmx(MmxOp::Padd(Lane::W, Sat::Signed)),
        0xef => mmx(MmxOp::Pxor),
        0xf1 => mmx(MmxOp::Psll(Lane::W)),
        0xf2 => mmx(MmxOp::Psll(Lane::D)),
        0xf3 => mmx(MmxOp::Psll(Lane::Q)),
        0xf5 => mmx(MmxOp::Pmaddwd),
        0xf8 => mmx(MmxOp::Psub(Lane::B, Sat::Wrap)),
        0xf9 => mmx(MmxOp::Psub(Lane::W, Sat::Wrap)),
        0xfa => mmx(MmxOp::Psub(Lane::D, Sat::Wrap)),
        0xfc => mmx(MmxOp::Padd(Lane::B, Sat::Wrap)),
        0xfd => mmx(MmxOp::Padd(Lane::W, Sat::Wrap)),
        0xfe => mmx(MmxOp::Padd(Lane::D, Sat::Wrap)),
        _ => Entry::INVALID,
    }
}

/// REPE (F3) context: string instructions only.
const fn repe(b: u8, op32: bool) -> Entry {
    let base = primary(b, op32);
    match base.op {
        Op::Str(_) => base.with_rep(Rep::Repe),
        _ => Entry::INVALID,
    }
}

/// REPNE (F2) context. Only CMPS/SCAS test ZF; the others repeat like REP.
const fn repne(b: u8, op32: bool) -> Entry {
    let base = primary(b, op32);
    match base.op {
        Op::Str(StrOp::Cmps) | Op::Str(StrOp::Scas) => base.with_rep(Rep::Repne),
        Op::Str(_) => base.with_rep(Rep::Repe),
        _ => Entry::INVALID,
    }
}

macro_rules! byte_table {
    ($f:ident) => {{
        let mut t = [[Entry::INVALID; 256]; 2];
        let mut half = 0;
        while half < 2 {
            let mut i = 0;
            while i < 256 {
                t[half][i] = $f(i as u8, half == 1);
                i += 1;
            }
            half += 1;
        }
        t
    }};
}

pub static PRIMARY: [[Entry; 256]; 2] = byte_table!(primary);
pub static TWO_BYTE: [[Entry; 256]; 2] = byte_table!(two_byte);
pub static REPE: [[Entry; 256]; 2] = byte_table!(repe);
pub static REPNE: [[Entry; 256]; 2] = byte_table!(repne);

const fn group_entry(g: GroupId, reg: u8, op32: bool) -> Entry {
    let v = Width::from_op32(op32);
    match g {
        GroupId::G1Eb | GroupId::G1Ev | GroupId::G1EvIb => {
            let op = AluOp::from_index(reg);
            let ent = match g {
                GroupId::G1Eb => e(Op::Alu(op), Rm(W8), Imm(W8)),
                GroupId::G1Ev => e(Op::Alu(op), Rm(v), Imm(v)),
                _ => e(Op::Alu(op), Rm(v), ImmSx(v)),
            };
            if matches!(op, AluOp::Cmp) {
                ent
            } else {
                ent.lockable()
            }
        }
        GroupId::G2EbIb => e(Op::Shift(ShiftOp::from_index(reg)), Rm(W8), Arg::Imm8),
        GroupId::G2EvIb => e(Op::Shift(ShiftOp::from_index(reg)), Rm(v), Arg::Imm8),
        GroupId::G2Eb1 => e(Op::Shift(ShiftOp::from_index(reg)), Rm(W8), Arg::One),
        GroupId::G2Ev1 => e(Op::Shift(ShiftOp::from_index(reg)), Rm(v), Arg::One),
        GroupId::G2EbCl => e(Op::Shift(ShiftOp::from_index(reg)), Rm(W8), Arg::Cl),
        GroupId::G2EvCl => e(Op::Shift(ShiftOp::from_index(reg)), Rm(v), Arg::Cl),
        GroupId::G3Eb | GroupId::G3Ev => {
            let w = if matches!(g, GroupId::G3Eb) { W8 } else { v };
            match reg {
                0 | 1 => e(Op::Test, Rm(w), Imm(w)),
                2 => e(Op::Not, Rm(w), N).lockable(),
                3 => e(Op::Neg, Rm(w), N).lockable(),
                4 => e(Op::MulDiv(MulOp::Mul), Rm(w), N),
                5 => e(Op::MulDiv(MulOp::Imul), Rm(w), N),
                6 => e(Op::MulDiv(MulOp::Div), Rm(w), N),
                _ => e(Op::MulDiv(MulOp::Idiv), Rm(w), N),
            }
        }
        GroupId::G4 => match reg {
            0 => e(Op::Inc, Rm(W8), N).lockable(),
            1 => e(Op::Dec, Rm(W8), N).lockable(),
            _ => Entry::INVALID,
        },
        GroupId::G5 => match reg {
            0 => e(Op::Inc, Rm(v), N).lockable(),
            1 => e(Op::Dec, Rm(v), N).lockable(),
            2 => e(Op::CallIndirect, Rm(v), N),
            3 => e(Op::CallFarIndirect, Arg::Mem, N),
            4 => e(Op::JmpIndirect, Rm(v), N),
            5 => e(Op::JmpFarIndirect, Arg::Mem, N),
            6 => e(Op::Push, Rm(v), N),
            _ => Entry::INVALID,
        },
        GroupId::G1a => match reg {
            0 => e(Op::Pop, Rm(v), N),
            _ => Entry::INVALID,
        },
        GroupId::G11Eb => match reg {
            0 => e(Op::Mov, Rm(W8), Imm(W8)),
            _ => Entry::INVALID,
        },
        GroupId::G11Ev => match reg {
            0 => e(Op::Mov, Rm(v), Imm(v)),
            _ => Entry::INVALID,
        },
        GroupId::G6 => match reg {
            0 => e(Op::Sldt, Rm(W16), N).req(Req::I286),
            1 => e(Op::StoreTr, Rm(W16), N).req(Req::I286),
            2 => e(Op::Lldt, Rm(W16), N).req(Req::I286),
            3 => e(Op::Ltr, Rm(W16), N).req(Req::I286),
            4 => e(Op::Verr, Rm(W16), N).req(Req::I286),
            5 => e(Op::Verw, Rm(W16), N).req(Req::I286),
            _ => Entry::INVALID,
        },
        GroupId::G7 => match reg {
            0 => e(Op::Sgdt, Arg::Mem, N).req(Req::I286),
            1 => e(Op::Sidt, Arg::Mem, N).req(Req::I286),
            2 => e(Op::Lgdt, Arg::Mem, N).req(Req::I286),
            3 => e(Op::Lidt, Arg::Mem, N).req(Req::I286),
            4 => e(Op::Smsw, Rm(W16), N).req(Req::I286),
            6 => e(Op::Lmsw, Rm(W16), N).req(Req::I286),
            7 => e(Op::Invlpg, Arg::Mem, N).req(Req::I486),
            _ => Entry::INVALID,
        },
        GroupId::G8 => match reg {
            4 => e(Op::Bit(BitOp::Bt), Rm(v), Arg::Imm8).req(Req::I386),
            5 => e(Op::Bit(BitOp::Bts), Rm(v), Arg::Imm8).req(Req::I386).lockable(),
            6 => e(Op::Bit(BitOp::Btr), Rm(v), Arg::Imm8).req(Req::I386).lockable(),
            7 => e(Op::Bit(BitOp::Btc), Rm(v), Arg::Imm8).req(Req::I386).lockable(),
            _ => Entry::INVALID,
        },
        GroupId::G9 => match reg {
            1 => e(Op::Cmpxchg8b, Arg::Mem, N).req(Req::Cx8).lockable(),
            _ => Entry::INVALID,
        },
        GroupId::G12 | GroupId::G13 | GroupId::G14 => {
            let lane = match g {
                GroupId::G12 => Lane::W,
                GroupId::G13 => Lane::D,
                _ => Lane::Q,
            };
            let op = match (reg, lane) {
                (2, _) => MmxOp::Psrl(lane),
                (4, Lane::W) | (4, Lane::D) => MmxOp::Psra(lane),
                (6, _) => MmxOp::Psll(lane),
                _ => return Entry::INVALID,
            };
            e(Op::Mmx(op), Arg::MmRm, Arg::Imm8).req(Req::Mmx)
        }
    }
}

const ALL_GROUPS: [GroupId; GROUP_COUNT] = [
    GroupId::G1Eb,
    GroupId::G1Ev,
    GroupId::G1EvIb,
    GroupId::G2EbIb,
    GroupId::G2EvIb,
    GroupId::G2Eb1,
    GroupId::G2Ev1,
    GroupId::G2EbCl,
    GroupId::G2EvCl,
    GroupId::G3Eb,
    GroupId::G3Ev,
    GroupId::G4,
    GroupId::G5,
    GroupId::G1a,
    GroupId::G11Eb,
    GroupId::G11Ev,
    GroupId::G6,
    GroupId::G7,
    GroupId::G8,
    GroupId::G9,
    GroupId::G12,
    GroupId::G13,
    GroupId::G14,
];

const fn build_groups() -> [[[Entry; 8]; GROUP_COUNT]; 2] {
    let mut t = [[[Entry::INVALID; 8]; GROUP_COUNT]; 2];
    let mut half = 0;
    while half < 2 {
        let mut g = 0;
        while g < GROUP_COUNT {
            let mut reg = 0;
            while reg < 8 {
                t[half][g][reg] = group_entry(ALL_GROUPS[g], reg as u8, half == 1);
                reg += 1;
            }
            g += 1;
        }
        half += 1;
    }
    t
}

pub static GROUPS: [[[Entry; 8]; GROUP_COUNT]; 2] = build_groups();

#[inline]
pub fn group(g: GroupId, reg: u8, op32: bool) -> Entry {
    GROUPS[usize::from(op32)][g as usize][usize::from(reg & 7)]
}

// ---- x87 -------------------------------------------------------------------

const fn fpu_mem(esc: u8, reg: u8) -> FpuOp {
    use FpuMem::*;
    const ARITH: [FpuArith; 8] = [
        FpuArith::Add,
        FpuArith::Mul,
        FpuArith::Add,
        FpuArith::Add,
        FpuArith::Sub,
        FpuArith::Subr,
        FpuArith::Div,
        FpuArith::Divr,
    ];
    let arith_mem = match esc {
        0 => Some(F32),
        2 => Some(I32),
        4 => Some(F64),
        6 => Some(I16),
        _ => None,
    };
    if let Some(m) = arith_mem {
        return match reg {
            2 => FpuOp::ComMem(m),
            3 => FpuOp::ComPMem(m),
            _ => FpuOp::ArithMem(ARITH[reg as usize], m),
        };
    }
    match (esc, reg) {
        (1, 0) => FpuOp::Fld(F32),
        (1, 2) => FpuOp::Fst(F32),
        (1, 3) => FpuOp::Fstp(F32),
        (1, 4) => FpuOp::Fldenv,
        (1, 5) => FpuOp::Fldcw,
        (1, 6) => FpuOp::Fnstenv,
        (1, 7) => FpuOp::Fnstcw,
        (3, 0) => FpuOp::Fld(I32),
        (3, 2) => FpuOp::Fst(I32),
        (3, 3) => FpuOp::Fstp(I32),
        (3, 5) => FpuOp::Fld(F80),
        (3, 7) => FpuOp::Fstp(F80),
        (5, 0) => FpuOp::Fld(F64),
        (5, 2) => FpuOp::Fst(F64),
        (5, 3) => FpuOp::Fstp(F64),
        (5, 4) => FpuOp::Frstor,
        (5, 6) => FpuOp::Fnsave,
        (5, 7) => FpuOp::Fnstsw,
        (7, 0) => FpuOp::Fld(I16),
        (7, 2) => FpuOp::Fst(I16),
        (7, 3) => FpuOp::Fstp(I16),
        (7, 4) => FpuOp::Fld(Bcd),
        (7, 5) => FpuOp::Fld(I64),
        (7, 6) => FpuOp::Fstp(Bcd),
        (7, 7) => FpuOp::Fstp(I64),
        _ => FpuOp::Invalid,
    }
}

const fn fpu_reg(esc: u8, reg: u8, rm: u8) -> FpuOp {
    const ARITH: [FpuArith; 8] = [
        FpuArith::Add,
        FpuArith::Mul,
        FpuArith::Add,
        FpuArith::Add,
        FpuArith::Sub,
        FpuArith::Subr,
        FpuArith::Div,
        FpuArith::Divr,
    ];
    // DC/DE encode the reversed forms with Sub/Subr and Div/Divr swapped.
    const ARITH_REV: [FpuArith; 8] = [
        FpuArith::Add,
        FpuArith::Mul,
        FpuArith::Add,
        FpuArith::Add,
        FpuArith::Subr,
        FpuArith::Sub,
        FpuArith::Divr,
        FpuArith::Div,
    ];
    match (esc, reg) {
        (0, 2) => FpuOp::FcomSti,
        (0, 3) => FpuOp::FcompSti,
        (0, _) => FpuOp::ArithSt0(ARITH[reg as usize]),
        (1, 0) => FpuOp::FldSti,
        (1, 1) => FpuOp::Fxch,
        (1, 2) if rm == 0 => FpuOp::Fnop,
        (1, 4) => match rm {
            0 => FpuOp::Fchs,
            1 => FpuOp::Fabs,
            4 => FpuOp::Ftst,
            5 => FpuOp::Fxam,
            _ => FpuOp::Invalid,
        },
        (1, 5) => match rm {
            0 => FpuOp::Fld1,
            1 => FpuOp::Fldl2t,
            2 => FpuOp::Fldl2e,
            3 => FpuOp::Fldpi,
            4 => FpuOp::Fldlg2,
            5 => FpuOp::Fldln2,
            6 => FpuOp::Fldz,
            _ => FpuOp::Invalid,
        },
        (1, 6) => match rm {
            0 => FpuOp::F2xm1,
            1 => FpuOp::Fyl2x,
            2 => FpuOp::Fptan,
            3 => FpuOp::Fpatan,
            4 => FpuOp::Fxtract,
            5 => FpuOp::Fprem1,
            6 => FpuOp::Fdecstp,
            _ => FpuOp::Fincstp,
        },
        (1, 7) => match rm {
            0 => FpuOp::Fprem,
            1 => FpuOp::Fyl2xp1,
            2 => FpuOp::Fsqrt,
            3 => FpuOp::Fsincos,
            4 => FpuOp::Frndint,
            5 => FpuOp::Fscale,
            6 => FpuOp::Fsin,
            _ => FpuOp::Fcos,
        },
        (2, 5) if rm == 1 => FpuOp::Fucompp,
        (3, 4) => match rm {
            0 | 1 | 4 => FpuOp::Fignored,
            2 => FpuOp::Fnclex,
            3 => FpuOp::Fninit,
            _ => FpuOp::Invalid,
        },
        (4, 2) => FpuOp::FcomSti,
        (4, 3) => FpuOp::FcompSti,
        (4, _) => FpuOp::ArithSti(ARITH_REV[reg as usize]),
        (5, 0) => FpuOp::Ffree,
        (5, 2) => FpuOp::FstSti,
        (5, 3) => FpuOp::FstpSti,
        (5, 4) => FpuOp::FucomSti,
        (5, 5) => FpuOp::FucompSti,
        (6, 3) if rm == 1 => FpuOp::Fcompp,
        (6, 2) | (6, 3) => FpuOp::Invalid,
        (6, _) => FpuOp::ArithStiPop(ARITH_REV[reg as usize]),
        (7, 4) if rm == 0 => FpuOp::FnstswAx,
        _ => FpuOp::Invalid,
    }
}

const fn build_fpu_mem() -> [FpuOp; 64] {
    let mut t = [FpuOp::Invalid; 64];
    let mut i = 0;
    while i < 64 {
        t[i] = fpu_mem((i / 8) as u8, (i % 8) as u8);
        i += 1;
    }
    t
}

const fn build_fpu_reg() -> [FpuOp; 512] {
    let mut t = [FpuOp::Invalid; 512];
    let mut i = 0;
    while i < 512 {
        t[i] = fpu_reg((i / 64) as u8, ((i / 8) % 8) as u8, (i % 8) as u8);
        i += 1;
    }
    t
}

/// Memory forms, indexed `esc * 8 + reg`.
pub static FPU_MEM: [FpuOp; 64] = build_fpu_mem();
/// Register forms, indexed `esc * 64 + reg * 8 + rm`.
pub static FPU_REG: [FpuOp; 512] = build_fpu_reg();
