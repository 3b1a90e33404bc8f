//! The code buffer translated blocks are emitted into.
//!
//! A buffer starts out [`Writable`]: the translator appends ops, registers
//! exit stubs and may roll back to a [`Mark`] when an instruction turns out
//! to be untranslatable. [`CodeBuffer::seal`] consumes it and returns the
//! [`Executable`] form, which can only be read. Code is never patched after
//! it has been sealed.

use std::marker::PhantomData;

use pcx86_cpu::jit::TranslateError;

use crate::ir::{ExitStub, HostOp, StubId};

#[derive(Debug, Clone, Copy)]
pub struct Writable;

#[derive(Debug, Clone, Copy)]
pub struct Executable;

/// Per-instruction data the executor needs at exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnInfo {
    pub eip: u32,
    pub cost: u32,
    /// Cost when a branch is taken; equal to `cost` for everything else.
    pub taken_cost: u32,
}

/// A rollback point inside a writable buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    ops: usize,
    stubs: usize,
    insns: usize,
}

#[derive(Debug)]
pub struct CodeBuffer<S> {
    ops: Vec<HostOp>,
    stubs: Vec<ExitStub>,
    insns: Vec<InsnInfo>,
    /// `retired_cycles[i]`: cycles of instructions `0..i`. Filled by `seal`.
    retired_cycles: Vec<u32>,
    max_ops: usize,
    _state: PhantomData<S>,
}

impl CodeBuffer<Writable> {
    pub fn new(max_ops: usize) -> Self {
        Self {
            ops: Vec::new(),
            stubs: Vec::new(),
            insns: Vec::new(),
            retired_cycles: Vec::new(),
            max_ops,
            _state: PhantomData,
        }
    }

    #[inline]
    pub fn emit(&mut self, op: HostOp) {
        self.ops.push(op);
    }

    pub fn stub(&mut self, stub: ExitStub) -> StubId {
        let id = StubId(self.stubs.len() as u16);
        self.stubs.push(stub);
        id
    }

    /// Open guest instruction `info` and emit its boundary marker.
    pub fn begin_insn(&mut self, info: InsnInfo) -> u16 {
        let index = self.insns.len() as u16;
        self.insns.push(info);
        self.emit(HostOp::Boundary(index));
        index
    }

    #[inline]
    pub fn mark(&self) -> Mark {
        Mark {
            ops: self.ops.len(),
            stubs: self.stubs.len(),
            insns: self.insns.len(),
        }
    }

    pub fn truncate(&mut self, mark: Mark) {
        self.ops.truncate(mark.ops);
        self.stubs.truncate(mark.stubs);
        self.insns.truncate(mark.insns);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Instructions opened so far.
    #[inline]
    pub fn insn_count(&self) -> usize {
        self.insns.len()
    }

    /// Finish the buffer. The last op must leave the block.
    pub fn seal(self) -> Result<CodeBuffer<Executable>, TranslateError> {
        if self.ops.len() > self.max_ops {
            return Err(TranslateError::TooLarge(self.ops.len()));
        }
        if !matches!(self.ops.last(), Some(HostOp::Exit(_))) {
            return Err(TranslateError::EmptyTrace);
        }
        let mut retired_cycles = Vec::with_capacity(self.insns.len() + 1);
        let mut total = 0u32;
        retired_cycles.push(0);
        for info in &self.insns {
            total = total.saturating_add(info.cost);
            retired_cycles.push(total);
        }
        Ok(CodeBuffer {
            ops: self.ops,
            stubs: self.stubs,
            insns: self.insns,
            retired_cycles,
            max_ops: self.max_ops,
            _state: PhantomData,
        })
    }
}

impl CodeBuffer<Executable> {
    #[inline]
    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }

    #[inline]
    pub fn stub(&self, id: StubId) -> ExitStub {
        self.stubs[usize::from(id.0)]
    }

    #[inline]
    pub fn insn(&self, index: usize) -> InsnInfo {
        self.insns[index]
    }

    #[inline]
    pub fn insn_count(&self) -> usize {
        self.insns.len()
    }

    /// Cycles of the instructions before `index`.
    #[inline]
    pub fn retired_cycles(&self, index: usize) -> u32 {
        self.retired_cycles[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{HReg, Src};
    use pcx86_cpu::jit::ExitReason;

    fn info(eip: u32, cost: u32) -> InsnInfo {
        InsnInfo {
            eip,
            cost,
            taken_cost: cost,
        }
    }

    #[test]
    fn truncate_discards_a_partial_instruction() {
        let mut buf = CodeBuffer::<Writable>::new(64);
        buf.begin_insn(info(0, 2));
        buf.emit(HostOp::Mov {
            dst: HReg(0),
            src: Src::Imm(1),
        });
        let mark = buf.mark();
        buf.begin_insn(info(1, 3));
        buf.stub(ExitStub::Rollback {
            reason: ExitReason::Fault,
        });
        buf.emit(HostOp::Mov {
            dst: HReg(1),
            src: Src::Imm(2),
        });
        buf.truncate(mark);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.insn_count(), 1);

        let stub = buf.stub(ExitStub::Retire {
            target: Src::Imm(1),
            taken: false,
            reason: ExitReason::End,
        });
        assert_eq!(stub, StubId(0));
        buf.emit(HostOp::Exit(stub));
        let code = buf.seal().unwrap();
        assert_eq!(code.retired_cycles(0), 0);
        assert_eq!(code.retired_cycles(1), 2);
        assert_eq!(code.insn(0).eip, 0);
    }

    #[test]
    fn sealing_checks_size_and_termination() {
        let mut buf = CodeBuffer::<Writable>::new(1);
        buf.begin_insn(info(0, 1));
        assert_eq!(buf.seal().unwrap_err(), TranslateError::EmptyTrace);

        let mut buf = CodeBuffer::<Writable>::new(1);
        buf.begin_insn(info(0, 1));
        let stub = buf.stub(ExitStub::Rollback {
            reason: ExitReason::Fallback,
        });
        buf.emit(HostOp::Exit(stub));
        assert_eq!(buf.seal().unwrap_err(), TranslateError::TooLarge(2));
    }
}
