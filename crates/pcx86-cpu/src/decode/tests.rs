use iced_x86::{Decoder, DecoderOptions};

use super::*;
use crate::exceptions::Exception;

fn ctx(model: CpuModel, code32: bool) -> DecodeCtx {
    DecodeCtx {
        model,
        features: model.default_features(),
        code32,
    }
}

fn decode_bytes(ctx: &DecodeCtx, bytes: &[u8]) -> Result<Insn, Fault> {
    decode(ctx, |i| {
        Ok(bytes.get(i as usize).copied().unwrap_or(0x90))
    })
}

fn iced_len(bitness: u32, bytes: &[u8]) -> usize {
    let mut d = Decoder::new(bitness, bytes, DecoderOptions::NONE);
    d.decode().len()
}

#[test]
fn lengths_match_iced_in_both_code_sizes() {
    let cases: &[&[u8]] = &[
        &[0x90],
        &[0x01, 0xc0],
        &[0x03, 0x44, 0x24, 0x08],
        &[0x8b, 0x84, 0x88, 0x00, 0x10, 0x00, 0x00],
        &[0x81, 0x3d, 0x00, 0x20, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12],
        &[0x83, 0xc0, 0xff],
        &[0x66, 0xb8, 0x34, 0x12, 0x00, 0x00],
        &[0x67, 0x8b, 0x07],
        &[0xc7, 0x45, 0xfc, 0x01, 0x00, 0x00, 0x00],
        &[0xe8, 0x00, 0x00, 0x00, 0x00],
        &[0xeb, 0xfe],
        &[0x0f, 0x84, 0x10, 0x00, 0x00, 0x00],
        &[0xc8, 0x10, 0x00, 0x01],
        &[0xf3, 0xa5],
        &[0x0f, 0xb6, 0x06],
        &[0x0f, 0xa4, 0xd0, 0x04],
        &[0x0f, 0xba, 0xe0, 0x1f],
        &[0x0f, 0xc7, 0x0e],
        &[0xf0, 0x0f, 0xb1, 0x0b],
        &[0xd9, 0xe8],
        &[0xdd, 0x1c, 0x24],
        &[0x26, 0x8a, 0x00],
        &[0xf6, 0x05, 0x00, 0x10, 0x00, 0x00, 0x80],
        &[0xf7, 0xc1, 0x01, 0x00, 0x00, 0x00],
        &[0x6b, 0xc0, 0x07],
        &[0xa1, 0x44, 0x33, 0x22, 0x11],
        &[0xcd, 0x21],
        &[0x0f, 0x01, 0x15, 0x00, 0x00, 0x00, 0x00],
        &[0x0f, 0x22, 0xc0],
    ];
    for &bytes in cases {
        for (code32, bitness) in [(true, 32), (false, 16)] {
            let insn = decode_bytes(&ctx(CpuModel::Pentium, code32), bytes)
                .unwrap_or_else(|f| panic!("{bytes:02x?} ({bitness}): {f}"));
            assert_eq!(
                usize::from(insn.len),
                iced_len(bitness, bytes),
                "length mismatch for {bytes:02x?} in {bitness}-bit code"
            );
        }
    }
}

#[test]
fn mmx_lengths_match_iced() {
    let k6 = ctx(CpuModel::K6, true);
    for bytes in [
        &[0x0f, 0x6f, 0x00][..],
        &[0x0f, 0xfe, 0xc1],
        &[0x0f, 0x71, 0xd0, 0x04],
        &[0x0f, 0x7e, 0x44, 0x24, 0x04],
        &[0x0f, 0x77],
    ] {
        let insn = decode_bytes(&k6, bytes).unwrap();
        assert_eq!(usize::from(insn.len), iced_len(32, bytes), "{bytes:02x?}");
    }
}

#[test]
fn fifteen_byte_limit_raises_gp() {
    let c = ctx(CpuModel::I486, true);
    let mut ok = vec![0x26u8; 14];
    ok.push(0x90);
    assert_eq!(decode_bytes(&c, &ok).unwrap().len, 15);

    let mut long = vec![0x26u8; 15];
    long.push(0x90);
    let err = decode_bytes(&c, &long).unwrap_err();
    assert_eq!(err.exception, Exception::GeneralProtection);
    assert_eq!(err.error_code, 0);
}

#[test]
fn operand_size_prefix_flips_widths() {
    let insn = decode_bytes(&ctx(CpuModel::I386, false), &[0x66, 0xb8, 1, 2, 3, 4]).unwrap();
    assert!(insn.op32);
    assert_eq!(insn.imm, 0x0403_0201);
    assert_eq!(insn.len, 6);

    let insn = decode_bytes(&ctx(CpuModel::I386, true), &[0x66, 0xb8, 1, 2]).unwrap();
    assert!(!insn.op32);
    assert_eq!(insn.imm, 0x0201);
}

#[test]
fn lock_requires_lockable_memory_form() {
    let c = ctx(CpuModel::I486, true);
    let insn = decode_bytes(&c, &[0xf0, 0x83, 0x00, 0x01]).unwrap();
    assert!(insn.lock);

    let err = decode_bytes(&c, &[0xf0, 0x01, 0xc0]).unwrap_err();
    assert_eq!(err.exception, Exception::InvalidOpcode);
    let err = decode_bytes(&c, &[0xf0, 0x8b, 0x00]).unwrap_err();
    assert_eq!(err.exception, Exception::InvalidOpcode);
    // CMP is not a read-modify-write.
    let err = decode_bytes(&c, &[0xf0, 0x39, 0x00]).unwrap_err();
    assert_eq!(err.exception, Exception::InvalidOpcode);
}

#[test]
fn rep_prefix_only_changes_string_instructions() {
    let c = ctx(CpuModel::I386, true);
    let pause = decode_bytes(&c, &[0xf3, 0x90]).unwrap();
    assert_eq!(pause.op, Op::Nop);
    assert_eq!(pause.rep, Rep::None);

    let movs = decode_bytes(&c, &[0xf3, 0xa5]).unwrap();
    assert_eq!(movs.op, Op::Str(StrOp::Movs));
    assert_eq!(movs.rep, Rep::Repe);

    let scas = decode_bytes(&c, &[0xf2, 0xae]).unwrap();
    assert_eq!(scas.rep, Rep::Repne);

    // REPNE on a non-comparing string op repeats like REP.
    let stos = decode_bytes(&c, &[0xf2, 0xaa]).unwrap();
    assert_eq!(stos.rep, Rep::Repe);
}

#[test]
fn i8088_aliases() {
    let c = ctx(CpuModel::I8088, false);
    let insn = decode_bytes(&c, &[0x60, 0x05]).unwrap();
    assert_eq!(insn.op, Op::Jcc(Cond::O));
    assert_eq!(insn.imm, 5);

    let insn = decode_bytes(&c, &[0xc0, 0x04, 0x00]).unwrap();
    assert_eq!(insn.op, Op::Ret);
    assert_eq!(insn.imm, 4);

    let insn = decode_bytes(&c, &[0x0f]).unwrap();
    assert_eq!(insn.op, Op::PopCs);
    assert_eq!(insn.len, 1);

    // MOV CS, r/m is accepted on the 8088 only.
    assert_eq!(decode_bytes(&c, &[0x8e, 0xc8]).unwrap().op, Op::MovToSeg);
    let err = decode_bytes(&ctx(CpuModel::I386, false), &[0x8e, 0xc8]).unwrap_err();
    assert_eq!(err.exception, Exception::InvalidOpcode);
}

#[test]
fn newer_opcodes_are_gated_by_model() {
    let cpuid = [0x0f, 0xa2];
    assert!(decode_bytes(&ctx(CpuModel::I386, true), &cpuid).is_err());
    assert_eq!(decode_bytes(&ctx(CpuModel::Pentium, true), &cpuid).unwrap().op, Op::Cpuid);

    let pusha = [0x60];
    assert_eq!(decode_bytes(&ctx(CpuModel::I286, false), &pusha).unwrap().op, Op::Pusha);

    let bswap = [0x0f, 0xc8];
    assert!(decode_bytes(&ctx(CpuModel::I386, true), &bswap).is_err());
    assert_eq!(decode_bytes(&ctx(CpuModel::I486, true), &bswap).unwrap().op, Op::Bswap);

    let paddd = [0x0f, 0xfe, 0xc1];
    assert!(decode_bytes(&ctx(CpuModel::Pentium, true), &paddd).is_err());
    assert_eq!(
        decode_bytes(&ctx(CpuModel::K6, true), &paddd).unwrap().op,
        Op::Mmx(MmxOp::Padd(Lane::D, Sat::Wrap))
    );

    // FS override does not exist before the 386.
    assert!(decode_bytes(&ctx(CpuModel::I286, false), &[0x64, 0x90]).is_err());
}

#[test]
fn memory_only_operands_reject_register_form() {
    let c = ctx(CpuModel::I386, true);
    // LEA eax, eax
    assert!(decode_bytes(&c, &[0x8d, 0xc0]).is_err());
    // LGDT with a register operand.
    assert!(decode_bytes(&c, &[0x0f, 0x01, 0xd0]).is_err());
}

#[test]
fn x87_escapes_resolve_through_modrm() {
    let c = ctx(CpuModel::I486, true);
    assert_eq!(decode_bytes(&c, &[0xd9, 0xe8]).unwrap().op, Op::Fpu(FpuOp::Fld1));
    let fstp = decode_bytes(&c, &[0xdd, 0x1c, 0x24]).unwrap();
    assert_eq!(fstp.op, Op::Fpu(FpuOp::Fstp(FpuMem::F64)));
    assert_eq!(fstp.dst, Arg::Mem);
    assert_eq!(
        decode_bytes(&c, &[0xde, 0xe9]).unwrap().op,
        Op::Fpu(FpuOp::ArithStiPop(FpuArith::Sub))
    );
    assert_eq!(decode_bytes(&c, &[0xdf, 0xe0]).unwrap().op, Op::Fpu(FpuOp::FnstswAx));
    assert!(decode_bytes(&c, &[0xd9, 0xd1]).is_err());
}

#[test]
fn immediates_are_assigned_in_operand_order() {
    let c = ctx(CpuModel::I286, false);
    let enter = decode_bytes(&c, &[0xc8, 0x10, 0x00, 0x02]).unwrap();
    assert_eq!((enter.imm, enter.imm2), (0x10, 2));

    let jmpf = decode_bytes(&c, &[0xea, 0x78, 0x56, 0x34, 0x12]).unwrap();
    assert_eq!((jmpf.imm, jmpf.imm2), (0x5678, 0x1234));

    let add = decode_bytes(&c, &[0x83, 0xc0, 0xff]).unwrap();
    assert_eq!(add.imm, 0xffff);

    let imul = decode_bytes(&ctx(CpuModel::I386, true), &[0x69, 0xc1, 0x10, 0, 0, 0]).unwrap();
    assert_eq!(imul.op, Op::Imul3);
    assert_eq!(imul.imm, 0x10);
}

#[test]
fn relative_targets_are_sign_extended() {
    let c = ctx(CpuModel::I386, false);
    let jmp = decode_bytes(&c, &[0xeb, 0xfe]).unwrap();
    assert_eq!(jmp.imm, 0xffff_fffe);
    let call = decode_bytes(&c, &[0xe8, 0x00, 0x80]).unwrap();
    assert_eq!(call.imm, 0xffff_8000);
}

#[test]
fn fetch_faults_propagate() {
    let c = ctx(CpuModel::I386, true);
    let err = decode(&c, |i| {
        if i < 2 {
            Ok([0x8b, 0x80][i as usize])
        } else {
            Err(Fault::page_fault(0x1000, 0))
        }
    })
    .unwrap_err();
    assert_eq!(err.exception, Exception::PageFault);
}
