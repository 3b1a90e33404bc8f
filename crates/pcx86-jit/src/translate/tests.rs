use pcx86_cpu::decode::Op;
use pcx86_cpu::jit::{ExitReason, TranslateError};
use pcx86_cpu::CpuModel;

use super::translate;
use crate::emitter::{CodeBuffer, Executable};
use crate::ir::{ExitStub, HostOp};
use crate::test_util::{real_vcpu, record};

fn lower(
    model: CpuModel,
    code: &[u8],
) -> Result<(CodeBuffer<Executable>, u32, u32), TranslateError> {
    let mut v = real_vcpu(model, code);
    let trace = record(&mut v);
    translate(&trace, 4096).map(|t| (t.code, t.insn_count, t.byte_len))
}

fn position(code: &CodeBuffer<Executable>, pred: impl Fn(&HostOp) -> bool) -> Option<usize> {
    code.ops().iter().position(pred)
}

fn count(code: &CodeBuffer<Executable>, pred: impl Fn(&HostOp) -> bool) -> usize {
    code.ops().iter().filter(|op| pred(op)).count()
}

#[test]
fn untranslatable_first_instruction_is_refused() {
    // hlt
    let err = lower(CpuModel::I386, &[0xf4]).unwrap_err();
    assert_eq!(err, TranslateError::Untranslatable { eip: 0, op: Op::Hlt });
}

#[test]
fn block_stops_in_front_of_an_unsupported_instruction() {
    // inc ax; inc bx; lahf; jmp $
    let (code, covered, bytes) = lower(CpuModel::I386, &[0x40, 0x43, 0x9f, 0xeb, 0xfe]).unwrap();
    assert_eq!(covered, 2);
    assert_eq!(bytes, 2);
    // The fallback marker names LAHF without running it.
    assert_eq!(code.insn_count(), 3);
    assert_eq!(code.insn(2).eip, 2);
    let Some(HostOp::Exit(stub)) = code.ops().last().copied() else {
        panic!("block must end in an exit");
    };
    assert_eq!(
        code.stub(stub),
        ExitStub::Rollback {
            reason: ExitReason::Fallback
        }
    );
}

#[test]
fn guest_registers_stay_cached_across_instructions() {
    // inc ax; inc ax; inc ax; jmp $
    let (code, covered, _) = lower(CpuModel::I386, &[0x40, 0x40, 0x40, 0xeb, 0xfe]).unwrap();
    assert_eq!(covered, 4);
    assert_eq!(count(&code, |op| matches!(op, HostOp::LoadGuest { reg: 0, .. })), 1);
    assert_eq!(count(&code, |op| matches!(op, HostOp::StoreGuest { reg: 0, .. })), 1);
}

#[test]
fn dirty_registers_are_flushed_before_memory_accesses() {
    // inc bx; mov al, [bx]; jmp $
    let (code, _, _) = lower(CpuModel::I386, &[0x43, 0x8a, 0x07, 0xeb, 0xfe]).unwrap();
    let store_bx = position(&code, |op| matches!(op, HostOp::StoreGuest { reg: 3, .. })).unwrap();
    let load = position(&code, |op| matches!(op, HostOp::Load { .. })).unwrap();
    assert!(store_bx < load);
}

#[test]
fn stores_check_for_code_modification() {
    // mov [bx], al; jmp $
    let (code, _, _) = lower(CpuModel::I386, &[0x88, 0x07, 0xeb, 0xfe]).unwrap();
    let check = position(&code, |op| matches!(op, HostOp::CheckCode(_))).unwrap();
    let HostOp::CheckCode(stub) = code.ops()[check] else {
        unreachable!()
    };
    assert!(matches!(
        code.stub(stub),
        ExitStub::Retire {
            reason: ExitReason::CodeModified,
            ..
        }
    ));
}

#[test]
fn read_modify_write_validates_before_writing() {
    // add [bx], ax; jmp $
    let (code, _, _) = lower(CpuModel::I386, &[0x01, 0x07, 0xeb, 0xfe]).unwrap();
    let validate = position(&code, |op| matches!(op, HostOp::Validate { .. })).unwrap();
    let alu = position(&code, |op| matches!(op, HostOp::Alu { .. })).unwrap();
    let store = position(&code, |op| matches!(op, HostOp::StoreChecked { .. })).unwrap();
    assert!(validate < alu && alu < store);
    assert_eq!(count(&code, |op| matches!(op, HostOp::Store { .. })), 0);
}

#[test]
fn push_sp_on_the_8088_is_left_to_the_interpreter() {
    // push sp; jmp $
    let err = lower(CpuModel::I8088, &[0x54, 0xeb, 0xfe]).unwrap_err();
    assert!(matches!(err, TranslateError::Untranslatable { op: Op::Push, .. }));
    assert!(lower(CpuModel::I286, &[0x54, 0xeb, 0xfe]).is_ok());
}

#[test]
fn branch_limit_checks_are_skipped_on_the_8088() {
    let guards = |model| {
        let (code, _, _) = lower(model, &[0xeb, 0xfe]).unwrap();
        count(&code, |op| matches!(op, HostOp::GuardBranch { .. }))
    };
    assert_eq!(guards(CpuModel::I8088), 0);
    assert_eq!(guards(CpuModel::I386), 1);
}

#[test]
fn op_budget_is_enforced() {
    let mut v = real_vcpu(CpuModel::I386, &[0x40, 0x40, 0xeb, 0xfe]);
    let trace = record(&mut v);
    assert!(matches!(translate(&trace, 4), Err(TranslateError::TooLarge(_))));
}
