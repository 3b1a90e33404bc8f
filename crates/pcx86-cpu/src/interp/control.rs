//! Near and far control transfers.
//!
//! Far transfers in protected mode go through code segment descriptors or
//! call gates. Task switches (TSS descriptors and task gates) are not
//! modelled and raise #GP(selector).

use tracing::warn;

use crate::decode::{Arg, Insn, Op};
use crate::exceptions::{Exception, Fault};
use crate::mem::CpuBus;
use crate::model::CpuModel;
use crate::state::descriptor::{Descriptor, SystemKind, ACC_DC};
use crate::types::{Cond, Gpr, SegReg, Width};
use crate::vcpu::Vcpu;

use super::segment::StackCheck;
use super::{width_of, Flow};

impl<B: CpuBus> Vcpu<B> {
    /// Mask a branch target to the operand size and check it against CS.
    fn near_target(&self, target: u32, w: Width) -> Result<u32, Fault> {
        let target = target & w.mask();
        if self.state.model() != CpuModel::I8088 && target > self.state.seg(SegReg::Cs).limit {
            return Err(Fault::gp0());
        }
        Ok(target)
    }

    fn branch(&mut self, target: u32, w: Width) -> Result<Flow, Fault> {
        self.state.eip = self.near_target(target, w)?;
        Ok(Flow::Taken)
    }

    #[inline]
    fn rel_target(&self, insn: &Insn) -> u32 {
        self.state.eip.wrapping_add(insn.imm)
    }

    pub(super) fn exec_jcc(&mut self, insn: &Insn, cond: Cond) -> Result<Flow, Fault> {
        if !self.state.flags.cond(cond) {
            return Ok(Flow::Next);
        }
        self.branch(self.rel_target(insn), insn.op_width())
    }

    pub(super) fn exec_jmp(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        self.branch(self.rel_target(insn), insn.op_width())
    }

    pub(super) fn exec_jmp_indirect(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let target = self.read_arg(insn, insn.dst)?;
        self.branch(target, width_of(insn.dst))
    }

    pub(super) fn exec_call(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        let target = self.near_target(self.rel_target(insn), w)?;
        self.push(w, self.state.eip)?;
        self.state.eip = target;
        Ok(Flow::Taken)
    }

    pub(super) fn exec_call_indirect(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let target = self.read_arg(insn, insn.dst)?;
        let target = self.near_target(target, w)?;
        self.push(w, self.state.eip)?;
        self.state.eip = target;
        Ok(Flow::Taken)
    }

    /// Extra bytes RET/RETF release after the return address.
    fn ret_release(insn: &Insn) -> u32 {
        if insn.dst == Arg::Imm16 {
            insn.imm & 0xffff
        } else {
            0
        }
    }

    pub(super) fn exec_ret(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        let ip = self.stack_peek(0, w)?;
        let ip = self.near_target(ip, w)?;
        let sp = self
            .state
            .sp()
            .wrapping_add(w.bytes())
            .wrapping_add(Self::ret_release(insn));
        self.state.set_sp(sp);
        self.state.eip = ip;
        Ok(Flow::Taken)
    }

    pub(super) fn exec_loop(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let cw = if insn.addr32 { Width::W32 } else { Width::W16 };
        let count = self.state.read_gpr(Gpr::Ecx as u8, cw).wrapping_sub(1) & cw.mask();
        self.state.write_gpr(Gpr::Ecx as u8, cw, count);
        let zf = self.state.flags.cond(Cond::E);
        let taken = count != 0
            && match insn.op {
                Op::Loope => zf,
                Op::Loopne => !zf,
                _ => true,
            };
        if !taken {
            return Ok(Flow::Next);
        }
        self.branch(self.rel_target(insn), insn.op_width())
    }

    pub(super) fn exec_jcxz(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let cw = if insn.addr32 { Width::W32 } else { Width::W16 };
        if self.state.read_gpr(Gpr::Ecx as u8, cw) != 0 {
            return Ok(Flow::Next);
        }
        self.branch(self.rel_target(insn), insn.op_width())
    }

    pub(super) fn exec_into(&mut self) -> Result<Flow, Fault> {
        if !self.state.flags.cond(Cond::O) {
            return Ok(Flow::Next);
        }
        self.software_interrupt(Exception::Overflow.vector())?;
        Ok(Flow::Taken)
    }

    /// BOUND: signed index against a lower/upper pair in memory.
    pub(super) fn exec_bound(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let (seg, off) = self.mem_operand(insn, insn.src).ok_or_else(Fault::ud)?;
        let index = w.signed(self.read_arg(insn, insn.dst)?);
        let lower = w.signed(self.read_mem(seg, off, w)?);
        let upper = w.signed(self.read_mem(seg, Self::ea_add(insn, off, w.bytes()), w)?);
        if index < lower || index > upper {
            return Err(Fault::new(Exception::BoundRangeExceeded));
        }
        Ok(Flow::Next)
    }

    // ---- far transfers ------------------------------------------------------

    /// `(offset, selector)` of a direct or memory-indirect far pointer.
    fn far_pointer(&mut self, insn: &Insn) -> Result<(u32, u16), Fault> {
        if insn.dst == Arg::FarPtr {
            return Ok((insn.imm, insn.imm2 as u16));
        }
        let w = insn.op_width();
        let (seg, off) = self.mem_operand(insn, insn.dst).ok_or_else(Fault::ud)?;
        let offset = self.read_mem(seg, off, w)?;
        let selector = self.read_u16(seg, Self::ea_add(insn, off, w.bytes()))?;
        Ok((offset, selector))
    }

    /// Real-mode and V86 far jump target load.
    fn load_cs_unprotected(&mut self, selector: u16) {
        if self.state.vm86() {
            self.state.load_seg_vm86(SegReg::Cs, selector);
        } else {
            self.state.load_seg_real(SegReg::Cs, selector);
        }
        self.invalidate_fetch();
    }

    /// Privilege rules for a direct code segment target (no privilege change).
    fn check_direct_code(&self, selector: u16, desc: &Descriptor) -> Result<(), Fault> {
        let cpl = self.state.cpl;
        let rpl = (selector & 3) as u8;
        let ok = if desc.access() & ACC_DC != 0 {
            desc.dpl() <= cpl
        } else {
            rpl <= cpl && desc.dpl() == cpl
        };
        if !ok {
            return Err(Fault::gp(selector));
        }
        if !desc.present() {
            return Err(Fault::np(selector));
        }
        Ok(())
    }

    /// Gate DPL checks shared by far JMP and CALL through a call gate.
    fn check_call_gate(&self, selector: u16, gate: &Descriptor) -> Result<(), Fault> {
        let rpl = (selector & 3) as u8;
        if gate.dpl() < self.state.cpl || gate.dpl() < rpl {
            return Err(Fault::gp(selector));
        }
        if !gate.present() {
            return Err(Fault::np(selector));
        }
        Ok(())
    }

    fn task_switch_unsupported(selector: u16, kind: SystemKind) -> Fault {
        warn!(selector, ?kind, "task switch is unsupported");
        Fault::gp(selector)
    }

    pub(super) fn exec_jmp_far(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let (offset, selector) = self.far_pointer(insn)?;
        let w = insn.op_width();
        if !self.state.protected_mode() || self.state.vm86() {
            let offset = offset & w.mask();
            if self.state.model() != CpuModel::I8088 && offset > self.state.seg(SegReg::Cs).limit {
                return Err(Fault::gp0());
            }
            self.load_cs_unprotected(selector);
            self.state.eip = offset;
            return Ok(Flow::Taken);
        }

        if selector & !3 == 0 {
            return Err(Fault::gp0());
        }
        let desc = self.read_descriptor(selector)?;
        let cpl = self.state.cpl;
        let (target_sel, code, offset) = if desc.is_code() {
            self.check_direct_code(selector, &desc)?;
            (selector, desc, offset & w.mask())
        } else if desc.is_system() {
            match desc.system_kind() {
                SystemKind::CallGate16 | SystemKind::CallGate32 => {
                    self.check_call_gate(selector, &desc)?;
                    let target = desc.gate_selector();
                    let code = self.read_code_descriptor(target)?;
                    // JMP never changes privilege.
                    let conforming = code.access() & ACC_DC != 0;
                    let ok = if conforming {
                        code.dpl() <= cpl
                    } else {
                        code.dpl() == cpl
                    };
                    if !ok {
                        return Err(Fault::gp(target));
                    }
                    if !code.present() {
                        return Err(Fault::np(target));
                    }
                    (target, code, desc.gate_offset())
                }
                kind @ (SystemKind::TaskGate
                | SystemKind::Tss16Available
                | SystemKind::Tss32Available) => {
                    return Err(Self::task_switch_unsupported(selector, kind));
                }
                _ => return Err(Fault::gp(selector)),
            }
        } else {
            return Err(Fault::gp(selector));
        };

        if offset > code.limit() {
            return Err(Fault::gp0());
        }
        self.commit_cs(target_sel, &code, cpl)?;
        self.state.eip = offset;
        Ok(Flow::Taken)
    }

    pub(super) fn exec_call_far(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let (offset, selector) = self.far_pointer(insn)?;
        let w = insn.op_width();
        let old_cs = u32::from(self.state.seg(SegReg::Cs).selector);
        let ret = self.state.eip;

        if !self.state.protected_mode() || self.state.vm86() {
            let offset = offset & w.mask();
            if self.state.model() != CpuModel::I8088 && offset > self.state.seg(SegReg::Cs).limit {
                return Err(Fault::gp0());
            }
            self.with_stack_rollback(|cpu| {
                cpu.push(w, old_cs)?;
                cpu.push(w, ret)
            })?;
            self.load_cs_unprotected(selector);
            self.state.eip = offset;
            return Ok(Flow::Taken);
        }

        if selector & !3 == 0 {
            return Err(Fault::gp0());
        }
        let desc = self.read_descriptor(selector)?;
        if desc.is_code() {
            self.check_direct_code(selector, &desc)?;
            let offset = offset & w.mask();
            if offset > desc.limit() {
                return Err(Fault::gp0());
            }
            self.with_stack_rollback(|cpu| {
                cpu.push(w, old_cs)?;
                cpu.push(w, ret)
            })?;
            let cpl = self.state.cpl;
            self.commit_cs(selector, &desc, cpl)?;
            self.state.eip = offset;
            return Ok(Flow::Taken);
        }
        if !desc.is_system() {
            return Err(Fault::gp(selector));
        }
        match desc.system_kind() {
            SystemKind::CallGate16 | SystemKind::CallGate32 => {
                self.call_gate(selector, &desc, old_cs, ret)?;
                Ok(Flow::Taken)
            }
            kind @ (SystemKind::TaskGate
            | SystemKind::Tss16Available
            | SystemKind::Tss32Available) => {
                Err(Self::task_switch_unsupported(selector, kind))
            }
            _ => Err(Fault::gp(selector)),
        }
    }

    /// CALL through a call gate, switching to the inner stack from the TSS
    /// when the target is more privileged.
    fn call_gate(
        &mut self,
        selector: u16,
        gate: &Descriptor,
        old_cs: u32,
        ret: u32,
    ) -> Result<(), Fault> {
        self.check_call_gate(selector, gate)?;
        let target = gate.gate_selector();
        let code = self.read_code_descriptor(target)?;
        let cpl = self.state.cpl;
        if code.dpl() > cpl {
            return Err(Fault::gp(target));
        }
        if !code.present() {
            return Err(Fault::np(target));
        }
        let gw = if gate.system_kind().is_32bit_gate() {
            Width::W32
        } else {
            Width::W16
        };
        let offset = gate.gate_offset();
        if offset > code.limit() {
            return Err(Fault::gp0());
        }

        let conforming = code.access() & ACC_DC != 0;
        if conforming || code.dpl() == cpl {
            self.with_stack_rollback(|cpu| {
                cpu.push(gw, old_cs)?;
                cpu.push(gw, ret)
            })?;
            self.commit_cs(target, &code, cpl)?;
            self.state.eip = offset;
            return Ok(());
        }

        let new_cpl = code.dpl();
        let (ss_sel, esp) = self.tss_stack(new_cpl)?;
        let ss = self.check_stack_segment(ss_sel, new_cpl, StackCheck::Tss)?;

        let count = u32::from(gate.gate_param_count());
        let mut params = Vec::with_capacity(count as usize);
        for i in 0..count {
            params.push(self.stack_peek(i * gw.bytes(), gw)?);
        }

        let old_ss_seg = *self.state.seg(SegReg::Ss);
        let old_esp = self.state.reg(Gpr::Esp);
        let old_sp = self.state.sp();

        *self.state.seg_mut(SegReg::Ss) = ss;
        self.state.cpl = new_cpl;
        let esp = if ss.big() { esp } else { esp & 0xffff };
        self.state.set_reg(Gpr::Esp, esp);

        let pushed = (|| -> Result<(), Fault> {
            self.push(gw, u32::from(old_ss_seg.selector))?;
            self.push(gw, old_sp)?;
            for p in params.iter().rev() {
                self.push(gw, *p)?;
            }
            self.push(gw, old_cs)?;
            self.push(gw, ret)
        })();
        let committed = pushed.and_then(|()| self.commit_cs(target, &code, new_cpl));
        if let Err(fault) = committed {
            *self.state.seg_mut(SegReg::Ss) = old_ss_seg;
            self.state.set_reg(Gpr::Esp, old_esp);
            self.state.cpl = cpl;
            return Err(fault);
        }
        self.state.eip = offset;
        Ok(())
    }

    pub(super) fn exec_ret_far(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = insn.op_width();
        let n = w.bytes();
        let release = Self::ret_release(insn);
        let ip = self.stack_peek(0, w)?;
        let selector = self.stack_peek(n, w)? as u16;

        if !self.state.protected_mode() || self.state.vm86() {
            let ip = ip & w.mask();
            if self.state.model() != CpuModel::I8088 && ip > self.state.seg(SegReg::Cs).limit {
                return Err(Fault::gp0());
            }
            let sp = self.state.sp().wrapping_add(2 * n).wrapping_add(release);
            self.state.set_sp(sp);
            self.load_cs_unprotected(selector);
            self.state.eip = ip;
            return Ok(Flow::Taken);
        }

        let cpl = self.state.cpl;
        let rpl = (selector & 3) as u8;
        if rpl < cpl {
            return Err(Fault::gp(selector));
        }
        let code = self.read_code_descriptor(selector)?;
        let ok = if code.access() & ACC_DC != 0 {
            code.dpl() <= rpl
        } else {
            code.dpl() == rpl
        };
        if !ok {
            return Err(Fault::gp(selector));
        }
        if !code.present() {
            return Err(Fault::np(selector));
        }
        let ip = ip & w.mask();
        if ip > code.limit() {
            return Err(Fault::gp0());
        }

        if rpl == cpl {
            self.commit_cs(selector, &code, cpl)?;
            let sp = self.state.sp().wrapping_add(2 * n).wrapping_add(release);
            self.state.set_sp(sp);
            self.state.eip = ip;
            return Ok(Flow::Taken);
        }

        // Return to an outer level: the caller's SS:ESP sits above the
        // released parameters.
        let new_esp = self.stack_peek(2 * n + release, w)?;
        let ss_sel = self.stack_peek(3 * n + release, w)? as u16;
        let ss = self.check_stack_segment(ss_sel, rpl, StackCheck::Load)?;
        self.commit_cs(selector, &code, rpl)?;
        *self.state.seg_mut(SegReg::Ss) = ss;
        let esp = if w == Width::W32 { new_esp } else { new_esp & 0xffff };
        if ss.big() {
            self.state.set_reg(Gpr::Esp, esp.wrapping_add(release));
        } else {
            self.state.set_sp(esp.wrapping_add(release));
        }
        self.state.eip = ip;
        self.null_inaccessible_segments();
        Ok(Flow::Taken)
    }
}
