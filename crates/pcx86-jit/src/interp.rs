//! Reference executor for host-op blocks.
//!
//! Walks a sealed [`CodeBuffer`] op by op. It shares every flag and memory
//! helper with the wasm backend, so the two differ only in how the inline
//! ops are carried out. Tests run both and compare.

use pcx86_cpu::decode::AluOp;
use pcx86_cpu::jit::{BlockExit, JitBackend, Trace, TranslateError, Translation};
use pcx86_cpu::mem::CpuBus;
use pcx86_cpu::types::SegReg;
use pcx86_cpu::Vcpu;

use crate::backend::{BackendConfig, BackendConfigError};
use crate::emitter::{CodeBuffer, Executable};
use crate::ir::{HostOp, ACCESS_SLOTS, HOST_REGS};
use crate::ops::{self, val, HostRegs, Slots, FAULT, FELL_OFF};
use crate::translate;

/// Run a block against the vCPU.
pub fn run<B: CpuBus>(vcpu: &mut Vcpu<B>, code: &CodeBuffer<Executable>) -> BlockExit {
    let model = vcpu.state.model();
    let mut regs: HostRegs = [0; HOST_REGS];
    let mut slots: Slots = [None; ACCESS_SLOTS];
    let mut cur = 0usize;
    vcpu.state.abort = None;

    let mut stream = code.ops().iter();
    let exit = loop {
        // Sealed buffers always end in an exit.
        let Some(op) = stream.next() else {
            break FELL_OFF;
        };
        let flags = &mut vcpu.state.flags;
        match *op {
            HostOp::Boundary(index) => cur = usize::from(index),

            HostOp::LoadGuest { dst, reg } => {
                regs[dst.index()] = vcpu.state.regs[usize::from(reg)];
            }
            HostOp::StoreGuest { reg, src } => {
                vcpu.state.regs[usize::from(reg)] = regs[src.index()];
            }
            HostOp::Mov { dst, src } => regs[dst.index()] = val(&regs, src),
            HostOp::Bin { op, dst, lhs, rhs } => {
                regs[dst.index()] = op.eval(regs[lhs.index()], val(&regs, rhs));
            }
            HostOp::Extract {
                dst,
                src,
                width,
                high,
                sign,
            } => {
                let v = (regs[src.index()] >> if high { 8 } else { 0 }) & width.mask();
                regs[dst.index()] = if sign { width.sign_extend(v) } else { v };
            }
            HostOp::Insert {
                dst,
                src,
                width,
                high,
            } => {
                let at = if high { 8 } else { 0 };
                let field = width.mask() << at;
                let v = (val(&regs, src) & width.mask()) << at;
                regs[dst.index()] = (regs[dst.index()] & !field) | v;
            }

            HostOp::Alu {
                op,
                width,
                dst,
                lhs,
                rhs,
            } => {
                let r = ops::alu_op(flags, op, width, regs[lhs.index()], val(&regs, rhs));
                if op != AluOp::Cmp {
                    regs[dst.index()] = r;
                }
            }
            HostOp::Test { width, lhs, rhs } => {
                ops::test_op(flags, width, regs[lhs.index()], val(&regs, rhs));
            }
            HostOp::Unary {
                op,
                width,
                dst,
                src,
            } => regs[dst.index()] = ops::unary_op(flags, op, width, regs[src.index()]),
            HostOp::Shift {
                op,
                width,
                dst,
                count,
                done,
            } => {
                let count = val(&regs, count);
                match ops::shift_op(flags, model, op, width, regs[dst.index()], count) {
                    Some(r) => {
                        regs[dst.index()] = r;
                        regs[done.index()] = 1;
                    }
                    None => regs[done.index()] = 0,
                }
            }
            HostOp::Cond { dst, cond } => regs[dst.index()] = u32::from(flags.cond(cond)),
            HostOp::Flag(edit) => ops::flag_edit(flags, edit),

            HostOp::GuardBranch { cond, target } => {
                let live = cond.map_or(true, |h| regs[h.index()] != 0);
                if live && val(&regs, target) > vcpu.state.seg(SegReg::Cs).limit {
                    break FAULT;
                }
            }
            HostOp::ExitIf { cond, stub } => {
                if regs[cond.index()] != 0 {
                    break code.stub(stub);
                }
            }
            HostOp::Exit(stub) => break code.stub(stub),

            _ => {
                if let Some(exit) = ops::host_call(vcpu, code, op, &mut regs, &mut slots) {
                    break exit;
                }
            }
        }
    };
    ops::finish(vcpu, code, cur, &regs, exit)
}

/// Backend that runs blocks through [`run`]. It carries no host code and
/// serves as the oracle for the wasm backend.
#[derive(Debug, Default)]
pub struct ReferenceBackend {
    config: BackendConfig,
}

impl ReferenceBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl JitBackend for ReferenceBackend {
    type Code = CodeBuffer<Executable>;

    fn compile(
        &mut self,
        trace: &Trace,
    ) -> Result<Translation<CodeBuffer<Executable>>, TranslateError> {
        translate::translate(trace, self.config.max_ops)
    }

    fn execute<B: CpuBus>(
        &mut self,
        vcpu: &mut Vcpu<B>,
        code: &CodeBuffer<Executable>,
    ) -> BlockExit {
        run(vcpu, code)
    }
}
