//! Lowers a sealed host-op block into a wasm module.
//!
//! The op list is cut at every host call into segments. Segment 0 runs on
//! the first call; each later call jumps straight to the segment after the
//! host call it resumes from through a `br_table` over nested blocks.

use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, MemArg, MemoryType, Module, TypeSection, ValType,
};

use super::{
    flag_code, stub_exit, unary_code, width_bits, CS_LIMIT_OFF, CUR_INSN_OFF, EXIT_FAULT,
    EXIT_FELL_OFF, EXPORT_BLOCK_FN, GUEST_REGS_OFF, HOST_REGS_OFF, IMPORT_ALU, IMPORT_COND,
    IMPORT_FLAG, IMPORT_MEMORY, IMPORT_MODULE, IMPORT_SHIFT, IMPORT_UNARY, MEMORY_PAGES,
};
use crate::emitter::{CodeBuffer, Executable};
use crate::ir::{BinOp, HReg, HostOp, Src, UnaryOp};
use crate::ops::is_host_call;
use pcx86_cpu::decode::AluOp;
use pcx86_cpu::types::Width;

const FN_ALU: u32 = 0;
const FN_UNARY: u32 = 1;
const FN_SHIFT: u32 = 2;
const FN_COND: u32 = 3;
const FN_FLAG: u32 = 4;
const IMPORTED_FUNCS: u32 = 5;

const LOCAL_RESUME: u32 = 0;
const LOCAL_SCRATCH: u32 = 1;

/// A lowered block.
#[derive(Debug, Clone)]
pub struct WasmBlock {
    pub bytes: Vec<u8>,
    /// Op index of each host call, in yield order.
    pub yields: Vec<u32>,
}

pub fn lower(code: &CodeBuffer<Executable>) -> WasmBlock {
    let ops = code.ops();
    let yields: Vec<u32> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| is_host_call(op))
        .map(|(i, _)| i as u32)
        .collect();

    let mut module = Module::new();

    let mut types = TypeSection::new();
    let ty_alu = types.len();
    types.ty().function(
        [ValType::I32, ValType::I32, ValType::I32, ValType::I32],
        [ValType::I32],
    );
    let ty_unary = types.len();
    types
        .ty()
        .function([ValType::I32, ValType::I32, ValType::I32], [ValType::I32]);
    let ty_shift = types.len();
    types.ty().function(
        [ValType::I32, ValType::I32, ValType::I32, ValType::I32],
        [ValType::I64],
    );
    let ty_cond = types.len();
    types.ty().function([ValType::I32], [ValType::I32]);
    let ty_flag = types.len();
    types.ty().function([ValType::I32], []);
    let ty_block = types.len();
    types.ty().function([ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import(
        IMPORT_MODULE,
        IMPORT_MEMORY,
        MemoryType {
            minimum: u64::from(MEMORY_PAGES),
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        },
    );
    imports.import(IMPORT_MODULE, IMPORT_ALU, EntityType::Function(ty_alu));
    imports.import(IMPORT_MODULE, IMPORT_UNARY, EntityType::Function(ty_unary));
    imports.import(IMPORT_MODULE, IMPORT_SHIFT, EntityType::Function(ty_shift));
    imports.import(IMPORT_MODULE, IMPORT_COND, EntityType::Function(ty_cond));
    imports.import(IMPORT_MODULE, IMPORT_FLAG, EntityType::Function(ty_flag));
    module.section(&imports);

    let mut funcs = FunctionSection::new();
    funcs.function(ty_block);
    module.section(&funcs);

    let mut exports = ExportSection::new();
    exports.export(EXPORT_BLOCK_FN, ExportKind::Func, IMPORTED_FUNCS);
    module.section(&exports);

    let mut func = Function::new(vec![(1, ValType::I64)]);
    let mut lower = Lower { func: &mut func };
    lower.dispatch(yields.len());
    let mut k = 0i32;
    for op in ops {
        if is_host_call(op) {
            // Close the segment and open the next one.
            lower.ins(Instruction::I32Const(k));
            lower.ins(Instruction::Return);
            lower.ins(Instruction::End);
            k += 1;
        } else {
            lower.op(op);
        }
    }
    lower.ins(Instruction::I32Const(EXIT_FELL_OFF));
    lower.ins(Instruction::End);

    let mut codes = CodeSection::new();
    codes.function(&func);
    module.section(&codes);

    WasmBlock {
        bytes: module.finish(),
        yields,
    }
}

fn memarg(offset: u32) -> MemArg {
    MemArg {
        offset: u64::from(offset),
        align: 2,
        memory_index: 0,
    }
}

#[inline]
fn reg_off(h: HReg) -> u32 {
    HOST_REGS_OFF + 4 * u32::from(h.0)
}

struct Lower<'a> {
    func: &'a mut Function,
}

impl Lower<'_> {
    #[inline]
    fn ins(&mut self, i: Instruction<'_>) {
        self.func.instruction(&i);
    }

    /// One block per segment, then a jump out of block `resume`.
    fn dispatch(&mut self, host_calls: usize) {
        let segments = host_calls as u32 + 1;
        for _ in 0..segments {
            self.ins(Instruction::Block(BlockType::Empty));
        }
        self.ins(Instruction::LocalGet(LOCAL_RESUME));
        let targets: Vec<u32> = (0..segments).collect();
        self.ins(Instruction::BrTable(targets.into(), segments - 1));
        self.ins(Instruction::End);
    }

    /// Push the base address for a frame access.
    fn base(&mut self) {
        self.ins(Instruction::I32Const(0));
    }

    fn get(&mut self, h: HReg) {
        self.base();
        self.ins(Instruction::I32Load(memarg(reg_off(h))));
    }

    /// Store the top of stack into `h`; the base was pushed first.
    fn set(&mut self, h: HReg) {
        self.ins(Instruction::I32Store(memarg(reg_off(h))));
    }

    fn src(&mut self, src: Src) {
        match src {
            Src::Imm(v) => self.ins(Instruction::I32Const(v as i32)),
            Src::Host(h) => self.get(h),
        }
    }

    fn exit(&mut self, code: i32) {
        self.ins(Instruction::I32Const(code));
        self.ins(Instruction::Return);
    }

    fn op(&mut self, op: &HostOp) {
        match *op {
            HostOp::Boundary(index) => {
                self.base();
                self.ins(Instruction::I32Const(i32::from(index)));
                self.ins(Instruction::I32Store(memarg(CUR_INSN_OFF)));
            }
            HostOp::LoadGuest { dst, reg } => {
                self.base();
                self.base();
                self.ins(Instruction::I32Load(memarg(GUEST_REGS_OFF + 4 * u32::from(reg))));
                self.set(dst);
            }
            HostOp::StoreGuest { reg, src } => {
                self.base();
                self.get(src);
                self.ins(Instruction::I32Store(memarg(GUEST_REGS_OFF + 4 * u32::from(reg))));
            }
            HostOp::Mov { dst, src } => {
                self.base();
                self.src(src);
                self.set(dst);
            }
            HostOp::Bin { op, dst, lhs, rhs } => {
                self.base();
                self.get(lhs);
                self.src(rhs);
                self.ins(match op {
                    BinOp::Add => Instruction::I32Add,
                    BinOp::Sub => Instruction::I32Sub,
                    BinOp::And => Instruction::I32And,
                    BinOp::Or => Instruction::I32Or,
                    BinOp::Xor => Instruction::I32Xor,
                    BinOp::Shl => Instruction::I32Shl,
                    BinOp::Sar => Instruction::I32ShrS,
                    BinOp::Eq => Instruction::I32Eq,
                    BinOp::Ne => Instruction::I32Ne,
                });
                self.set(dst);
            }
            HostOp::Extract {
                dst,
                src,
                width,
                high,
                sign,
            } => {
                self.base();
                self.get(src);
                if high {
                    self.ins(Instruction::I32Const(8));
                    self.ins(Instruction::I32ShrU);
                }
                self.ins(Instruction::I32Const(width.mask() as i32));
                self.ins(Instruction::I32And);
                if sign {
                    match width {
                        Width::W8 => self.ins(Instruction::I32Extend8S),
                        Width::W16 => self.ins(Instruction::I32Extend16S),
                        Width::W32 => {}
                    }
                }
                self.set(dst);
            }
            HostOp::Insert {
                dst,
                src,
                width,
                high,
            } => {
                let at = if high { 8 } else { 0 };
                let field = width.mask() << at;
                self.base();
                self.get(dst);
                self.ins(Instruction::I32Const(!field as i32));
                self.ins(Instruction::I32And);
                self.src(src);
                self.ins(Instruction::I32Const(width.mask() as i32));
                self.ins(Instruction::I32And);
                if high {
                    self.ins(Instruction::I32Const(8));
                    self.ins(Instruction::I32Shl);
                }
                self.ins(Instruction::I32Or);
                self.set(dst);
            }

            HostOp::Alu {
                op,
                width,
                dst,
                lhs,
                rhs,
            } => {
                let keep = op != AluOp::Cmp;
                if keep {
                    self.base();
                }
                self.ins(Instruction::I32Const(op as i32));
                self.ins(Instruction::I32Const(width_bits(width)));
                self.get(lhs);
                self.src(rhs);
                self.ins(Instruction::Call(FN_ALU));
                if keep {
                    self.set(dst);
                } else {
                    self.ins(Instruction::Drop);
                }
            }
            HostOp::Test { width, lhs, rhs } => {
                self.ins(Instruction::I32Const(AluOp::And as i32));
                self.ins(Instruction::I32Const(width_bits(width)));
                self.get(lhs);
                self.src(rhs);
                self.ins(Instruction::Call(FN_ALU));
                self.ins(Instruction::Drop);
            }
            HostOp::Unary {
                op: UnaryOp::Not,
                width,
                dst,
                src,
            } => {
                self.base();
                self.get(src);
                self.ins(Instruction::I32Const(-1));
                self.ins(Instruction::I32Xor);
                self.ins(Instruction::I32Const(width.mask() as i32));
                self.ins(Instruction::I32And);
                self.set(dst);
            }
            HostOp::Unary {
                op,
                width,
                dst,
                src,
            } => {
                self.base();
                self.ins(Instruction::I32Const(unary_code(op)));
                self.ins(Instruction::I32Const(width_bits(width)));
                self.get(src);
                self.ins(Instruction::Call(FN_UNARY));
                self.set(dst);
            }
            HostOp::Shift {
                op,
                width,
                dst,
                count,
                done,
            } => {
                self.base();
                self.ins(Instruction::I32Const(op as i32));
                self.ins(Instruction::I32Const(width_bits(width)));
                self.get(dst);
                self.src(count);
                self.ins(Instruction::Call(FN_SHIFT));
                self.ins(Instruction::LocalTee(LOCAL_SCRATCH));
                self.ins(Instruction::I32WrapI64);
                self.set(dst);
                self.base();
                self.ins(Instruction::LocalGet(LOCAL_SCRATCH));
                self.ins(Instruction::I64Const(32));
                self.ins(Instruction::I64ShrU);
                self.ins(Instruction::I32WrapI64);
                self.set(done);
            }
            HostOp::Cond { dst, cond } => {
                self.base();
                self.ins(Instruction::I32Const(cond as i32));
                self.ins(Instruction::Call(FN_COND));
                self.set(dst);
            }
            HostOp::Flag(edit) => {
                self.ins(Instruction::I32Const(flag_code(edit)));
                self.ins(Instruction::Call(FN_FLAG));
            }

            HostOp::GuardBranch { cond, target } => {
                if let Some(c) = cond {
                    self.get(c);
                    self.ins(Instruction::If(BlockType::Empty));
                }
                self.src(target);
                self.base();
                self.ins(Instruction::I32Load(memarg(CS_LIMIT_OFF)));
                self.ins(Instruction::I32GtU);
                self.ins(Instruction::If(BlockType::Empty));
                self.exit(EXIT_FAULT);
                self.ins(Instruction::End);
                if cond.is_some() {
                    self.ins(Instruction::End);
                }
            }
            HostOp::ExitIf { cond, stub } => {
                self.get(cond);
                self.ins(Instruction::If(BlockType::Empty));
                self.exit(stub_exit(stub));
                self.ins(Instruction::End);
            }
            HostOp::Exit(stub) => self.exit(stub_exit(stub)),

            // Host calls end a segment and never reach here.
            HostOp::Validate { .. }
            | HostOp::LoadChecked { .. }
            | HostOp::StoreChecked { .. }
            | HostOp::Load { .. }
            | HostOp::Store { .. }
            | HostOp::Push { .. }
            | HostOp::Pop { .. }
            | HostOp::StackPeek { .. }
            | HostOp::ReleaseStack { .. }
            | HostOp::CheckCode(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{InsnInfo, Writable};
    use crate::ir::{ExitStub, StubId};
    use pcx86_cpu::jit::ExitReason;
    use pcx86_cpu::mem::AccessType;
    use pcx86_cpu::types::{Cond, SegReg};
    use wasmparser::{Operator, Parser, Payload, Validator};

    fn block(build: impl FnOnce(&mut CodeBuffer<Writable>)) -> CodeBuffer<Executable> {
        let mut buf = CodeBuffer::<Writable>::new(256);
        buf.begin_insn(InsnInfo {
            eip: 0,
            cost: 2,
            taken_cost: 2,
        });
        build(&mut buf);
        let stub = buf.stub(ExitStub::Retire {
            target: Src::Imm(2),
            taken: false,
            reason: ExitReason::End,
        });
        buf.emit(HostOp::Exit(stub));
        buf.seal().unwrap()
    }

    fn count_ops(wasm: &[u8], pred: impl Fn(&Operator<'_>) -> bool) -> usize {
        let mut n = 0;
        for payload in Parser::new(0).parse_all(wasm) {
            if let Payload::CodeSectionEntry(body) = payload.unwrap() {
                let mut reader = body.get_operators_reader().unwrap();
                while !reader.eof() {
                    if pred(&reader.read().unwrap()) {
                        n += 1;
                    }
                }
            }
        }
        n
    }

    #[test]
    fn inline_only_blocks_have_a_single_segment() {
        let code = block(|b| {
            b.emit(HostOp::LoadGuest {
                dst: HReg(0),
                reg: 0,
            });
            b.emit(HostOp::Alu {
                op: AluOp::Add,
                width: Width::W16,
                dst: HReg(0),
                lhs: HReg(0),
                rhs: Src::Imm(1),
            });
            b.emit(HostOp::Cond {
                dst: HReg(1),
                cond: Cond::E,
            });
            b.emit(HostOp::StoreGuest { reg: 0, src: HReg(0) });
        });
        let wasm = lower(&code);
        assert!(wasm.yields.is_empty());
        Validator::new().validate_all(&wasm.bytes).unwrap();
        assert_eq!(count_ops(&wasm.bytes, |op| matches!(op, Operator::Call { .. })), 2);
    }

    #[test]
    fn host_calls_split_the_block() {
        let code = block(|b| {
            b.emit(HostOp::Validate {
                slot: 0,
                seg: SegReg::Ds,
                off: Src::Imm(0x10),
                width: Width::W16,
                access: AccessType::Read,
            });
            b.emit(HostOp::LoadChecked {
                dst: HReg(2),
                slot: 0,
            });
            b.emit(HostOp::Shift {
                op: pcx86_cpu::decode::ShiftOp::Shl,
                width: Width::W16,
                dst: HReg(2),
                count: Src::Imm(1),
                done: HReg(3),
            });
            b.emit(HostOp::CheckCode(StubId(0)));
        });
        let wasm = lower(&code);
        // Boundary, Validate, LoadChecked, Shift, CheckCode, Exit.
        assert_eq!(wasm.yields, vec![1, 2, 4]);
        Validator::new().validate_all(&wasm.bytes).unwrap();
        assert_eq!(count_ops(&wasm.bytes, |op| matches!(op, Operator::BrTable { .. })), 1);
    }
}
