//! Interrupt/exception delivery (IVT/IDT), privilege transitions, and IRET.
//!
//! Architecturally visible state lives in [`CpuState`](crate::state::CpuState).
//! Event bookkeeping that is not part of it (the IRQ line, NMI latch, interrupt
//! shadow, reset request) lives in [`PendingEventState`].

use tracing::{debug, warn};

use crate::exceptions::{Exception, ExceptionClass, Fault};
use crate::interp::segment::StackCheck;
use crate::mem::CpuBus;
use crate::model::CpuModel;
use crate::state::descriptor::{Descriptor, SystemKind, ACC_DC};
use crate::state::flags::Eflags;
use crate::state::Segment;
use crate::types::{Gpr, SegReg, Width};
use crate::vcpu::Vcpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// Failure to deliver an exception (including #DF) that results in a reset.
    TripleFault,
}

/// External interrupt controller interface.
pub trait InterruptController {
    /// Acknowledge and return the highest-priority pending vector, if any.
    fn poll_interrupt(&mut self) -> Option<u8>;
}

/// Where an interrupt came from. Decides DPL checks and the EXT error-code bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    Exception,
    /// INT n, INT3, INTO.
    Software,
    External,
}

/// Extra CPU-core event state that is not part of the register file.
#[derive(Debug, Clone, Default)]
pub struct PendingEventState {
    /// Vector currently asserted on the maskable interrupt line.
    irq: Option<u8>,
    nmi: bool,
    /// NMIs are blocked from delivery until the next IRET.
    nmi_blocked: bool,
    reset: bool,
    /// Interrupt shadow counter (STI / MOV SS / POP SS).
    interrupt_inhibit: u8,
}

impl PendingEventState {
    /// Assert the INTR line with `vector`.
    pub fn raise_irq(&mut self, vector: u8) {
        self.irq = Some(vector);
    }

    pub fn lower_irq(&mut self) {
        self.irq = None;
    }

    pub fn irq(&self) -> Option<u8> {
        self.irq
    }

    pub fn raise_nmi(&mut self) {
        self.nmi = true;
    }

    /// Request a CPU reset at the next instruction boundary.
    pub fn request_reset(&mut self) {
        self.reset = true;
    }

    pub fn take_reset(&mut self) -> bool {
        core::mem::take(&mut self.reset)
    }

    /// Inhibit maskable interrupts until one more instruction has executed.
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_inhibit = 1;
    }

    /// Age the interrupt shadow. Called before each instruction executes.
    pub fn retire_instruction(&mut self) {
        self.interrupt_inhibit = self.interrupt_inhibit.saturating_sub(1);
    }

    pub fn interrupts_inhibited(&self) -> bool {
        self.interrupt_inhibit > 0
    }

    /// Whether anything may need delivery at the next boundary.
    pub fn has_pending_event(&self) -> bool {
        self.irq.is_some() || (self.nmi && !self.nmi_blocked) || self.reset
    }
}

fn should_double_fault(first: Exception, second: Exception) -> bool {
    use ExceptionClass as C;
    matches!(
        (first.class(), second.class()),
        (C::Contributory, C::Contributory) | (C::PageFault, C::Contributory | C::PageFault)
    )
}

#[inline]
fn idt_error(vector: u8, ext: bool) -> u32 {
    u32::from(vector) * 8 + 2 + u32::from(ext)
}

impl<B: CpuBus> Vcpu<B> {
    /// Deliver a fault raised by the current instruction. EIP is rewound to the
    /// faulting instruction; failures while delivering escalate to #DF and then
    /// to a triple fault.
    pub fn raise_fault(&mut self, fault: Fault) {
        // The 8088 reports #DE with the address of the next instruction.
        let trap_like =
            self.state.model() == CpuModel::I8088 && fault.exception == Exception::DivideError;
        if !trap_like {
            self.state.eip = self.state.old_eip;
        }
        if let Some(addr) = fault.cr2 {
            self.state.cr2 = addr;
        }
        self.state.abort = None;

        let mut current = fault;
        loop {
            debug!(
                exception = ?current.exception,
                error_code = current.error_code,
                eip = self.state.eip,
                "delivering exception"
            );
            let code = current
                .exception
                .pushes_error_code()
                .then_some(current.error_code);
            let ret = self.state.eip;
            let vector = current.exception.vector();
            match self.deliver_interrupt(vector, InterruptSource::Exception, code, ret) {
                Ok(()) => return,
                Err(next) => {
                    if current.exception == Exception::DoubleFault {
                        warn!(eip = self.state.eip, "triple fault");
                        self.exit = Some(CpuExit::TripleFault);
                        return;
                    }
                    if let Some(addr) = next.cr2 {
                        self.state.cr2 = addr;
                    }
                    current = if should_double_fault(current.exception, next.exception) {
                        warn!(first = ?current.exception, second = ?next.exception, "double fault");
                        Fault::with_code(Exception::DoubleFault, 0)
                    } else {
                        next
                    };
                }
            }
        }
    }

    /// Software interrupt from INT n / INT3 / INTO. Returns to the next
    /// instruction.
    pub fn software_interrupt(&mut self, vector: u8) -> Result<(), Fault> {
        if self.state.vm86() && self.state.flags.iopl() < 3 {
            return Err(Fault::gp0());
        }
        let ret = self.state.eip;
        self.deliver_interrupt(vector, InterruptSource::Software, None, ret)
    }

    /// Deliver NMI or a maskable interrupt if one is pending and allowed.
    /// Returns true when control was transferred.
    pub fn service_interrupts(&mut self) -> bool {
        if self.pending.nmi && !self.pending.nmi_blocked {
            self.pending.nmi = false;
            self.pending.nmi_blocked = true;
            return self.deliver_external(Exception::NonMaskableInterrupt.vector());
        }
        if !self.state.flags.interrupts_enabled() || self.pending.interrupts_inhibited() {
            return false;
        }
        match self.pending.irq.take() {
            Some(vector) => self.deliver_external(vector),
            None => false,
        }
    }

    /// Poll an interrupt controller and deliver its vector if interrupts are
    /// currently accepted.
    pub fn poll_and_deliver<C: InterruptController>(&mut self, ctrl: &mut C) -> bool {
        if !self.state.flags.interrupts_enabled() || self.pending.interrupts_inhibited() {
            return false;
        }
        match ctrl.poll_interrupt() {
            Some(vector) => self.deliver_external(vector),
            None => false,
        }
    }

    fn deliver_external(&mut self, vector: u8) -> bool {
        // Maskable interrupts and NMI wake the CPU from HLT.
        self.state.halted = false;
        let ret = self.state.eip;
        self.state.old_eip = ret;
        debug!(vector, eip = ret, "external interrupt");
        if let Err(fault) = self.deliver_interrupt(vector, InterruptSource::External, None, ret) {
            self.raise_fault(fault);
        }
        true
    }

    /// Transfer control through the IVT or IDT. On failure nothing of the
    /// interrupted context has been modified.
    pub(crate) fn deliver_interrupt(
        &mut self,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u32>,
        return_eip: u32,
    ) -> Result<(), Fault> {
        if self.state.protected_mode() {
            self.deliver_protected(vector, source, error_code, return_eip)
        } else {
            self.deliver_real(vector, return_eip)
        }
    }

    fn deliver_real(&mut self, vector: u8, return_eip: u32) -> Result<(), Fault> {
        let entry = u32::from(vector) * 4;
        if self.state.model() != CpuModel::I8088 && entry + 3 > u32::from(self.state.idtr.limit) {
            return Err(Fault::with_code(Exception::GeneralProtection, idt_error(vector, false)));
        }
        let base = self.state.idtr.base;
        let ip = self.read_sys(base.wrapping_add(entry), Width::W16)?;
        let cs = self.read_sys(base.wrapping_add(entry + 2), Width::W16)? as u16;

        let saved_sp = self.state.reg(Gpr::Esp);
        let flags = self.state.flags_image();
        let old_cs = self.state.seg(SegReg::Cs).selector;
        let frame = [flags, u32::from(old_cs), return_eip];
        for v in frame {
            if let Err(f) = self.push(Width::W16, v) {
                self.state.set_reg(Gpr::Esp, saved_sp);
                self.state.abort = None;
                return Err(f);
            }
        }
        self.state.flags.set(Eflags::IF | Eflags::TF, false);
        if self.state.model().is_486_class() {
            self.state.flags.set(Eflags::AC, false);
        }
        self.state.load_seg_real(SegReg::Cs, cs);
        self.invalidate_fetch();
        self.state.eip = ip;
        Ok(())
    }

    fn deliver_protected(
        &mut self,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u32>,
        return_eip: u32,
    ) -> Result<(), Fault> {
        let ext = source == InterruptSource::External;
        let idt_fault = || Fault::with_code(Exception::GeneralProtection, idt_error(vector, ext));
        let entry = u32::from(vector) * 8;
        if entry + 7 > u32::from(self.state.idtr.limit) {
            return Err(idt_fault());
        }
        let base = self.state.idtr.base;
        let low = self.read_sys(base.wrapping_add(entry), Width::W32)?;
        let high = self.read_sys(base.wrapping_add(entry + 4), Width::W32)?;
        let gate = Descriptor::new(low, high);

        if !gate.is_system() {
            return Err(idt_fault());
        }
        let kind = gate.system_kind();
        let interrupt_gate = match kind {
            SystemKind::InterruptGate16 | SystemKind::InterruptGate32 => true,
            SystemKind::TrapGate16 | SystemKind::TrapGate32 => false,
            // Hardware task switching is not modelled.
            SystemKind::TaskGate => {
                warn!(vector, "task gate in IDT is unsupported");
                return Err(idt_fault());
            }
            _ => return Err(idt_fault()),
        };
        if source == InterruptSource::Software && gate.dpl() < self.state.cpl {
            return Err(idt_fault());
        }
        if !gate.present() {
            return Err(Fault::with_code(Exception::SegmentNotPresent, idt_error(vector, ext)));
        }

        let selector = gate.gate_selector();
        if selector & !3 == 0 {
            return Err(Fault::with_code(Exception::GeneralProtection, u32::from(ext)));
        }
        let code = self.read_code_descriptor(selector)?;
        let cpl = self.state.cpl;
        if code.dpl() > cpl {
            return Err(Fault::gp(selector));
        }
        if !code.present() {
            return Err(Fault::np(selector));
        }
        let conforming = code.access() & ACC_DC != 0;
        let width = if kind.is_32bit_gate() { Width::W32 } else { Width::W16 };
        let from_vm86 = self.state.vm86();

        let snapshot = self.state.clone();
        let flags = self.state.flags_image() | if from_vm86 { Eflags::VM.bits() } else { 0 };
        let old_cs = self.state.seg(SegReg::Cs).selector;

        let result = (|| -> Result<u8, Fault> {
            let new_cpl = if !conforming && code.dpl() < cpl {
                let dpl = code.dpl();
                if from_vm86 && dpl != 0 {
                    return Err(Fault::gp(selector));
                }
                let (ss_sel, esp) = self.tss_stack(dpl)?;
                let ss = self.check_stack_segment(ss_sel, dpl, StackCheck::Tss)?;
                let old_ss = self.state.seg(SegReg::Ss).selector;
                let old_esp = self.state.reg(Gpr::Esp);
                let old_data: [u16; 4] = [
                    self.state.seg(SegReg::Gs).selector,
                    self.state.seg(SegReg::Fs).selector,
                    self.state.seg(SegReg::Ds).selector,
                    self.state.seg(SegReg::Es).selector,
                ];
                self.state.flags.set(Eflags::VM, false);
                *self.state.seg_mut(SegReg::Ss) = ss;
                self.state.cpl = dpl;
                self.state.set_reg(Gpr::Esp, esp);
                if !ss.big() {
                    self.state.set_reg(Gpr::Esp, esp & 0xffff);
                }
                if from_vm86 {
                    for sel in old_data {
                        self.push(width, u32::from(sel))?;
                    }
                }
                self.push(width, u32::from(old_ss))?;
                self.push(width, old_esp)?;
                dpl
            } else {
                if from_vm86 {
                    return Err(Fault::gp(selector));
                }
                cpl
            };
            self.push(width, flags)?;
            self.push(width, u32::from(old_cs))?;
            self.push(width, return_eip)?;
            if let Some(code) = error_code {
                self.push(width, code)?;
            }
            Ok(new_cpl)
        })();

        let new_cpl = match result {
            Ok(c) => c,
            Err(f) => {
                self.state = snapshot;
                return Err(f);
            }
        };

        let offset = gate.gate_offset();
        if let Err(f) = self.commit_cs(selector, &code, new_cpl) {
            self.state = snapshot;
            return Err(f);
        }
        if offset > self.state.seg(SegReg::Cs).limit {
            self.state = snapshot;
            return Err(Fault::gp0());
        }
        self.state.eip = offset;
        self.state.flags.set(Eflags::TF | Eflags::NT | Eflags::RF | Eflags::VM, false);
        if interrupt_gate {
            self.state.flags.set(Eflags::IF, false);
        }
        if from_vm86 {
            for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                *self.state.seg_mut(seg) = Segment::null(0);
            }
        }
        Ok(())
    }

    /// IRET / IRETD.
    pub fn iret(&mut self, op32: bool) -> Result<(), Fault> {
        self.pending.nmi_blocked = false;
        if !self.state.protected_mode() {
            return self.iret_real(op32);
        }
        if self.state.vm86() {
            if self.state.flags.iopl() < 3 {
                return Err(Fault::gp0());
            }
            return self.iret_real(op32);
        }
        if self.state.flags.control().contains(Eflags::NT) {
            // Nested task return requires hardware task switching.
            warn!("IRET with NT set is unsupported");
            return Err(Fault::gp0());
        }
        self.iret_protected(op32)
    }

    fn iret_real(&mut self, op32: bool) -> Result<(), Fault> {
        let w = Width::from_op32(op32);
        let n = w.bytes();
        let ip = self.stack_peek(0, w)?;
        let cs = self.stack_peek(n, w)? as u16;
        let flags = self.stack_peek(2 * n, w)?;
        if ip > self.state.seg(SegReg::Cs).limit && self.state.model() != CpuModel::I8088 {
            return Err(Fault::gp0());
        }
        let sp = self.state.sp().wrapping_add(3 * n);
        self.state.set_sp(sp);
        if self.state.vm86() {
            self.state.load_seg_vm86(SegReg::Cs, cs);
        } else {
            self.state.load_seg_real(SegReg::Cs, cs);
        }
        self.invalidate_fetch();
        self.state.eip = ip;
        self.write_flags(flags, op32);
        Ok(())
    }

    fn iret_protected(&mut self, op32: bool) -> Result<(), Fault> {
        let w = Width::from_op32(op32);
        let n = w.bytes();
        let eip = self.stack_peek(0, w)?;
        let cs_sel = self.stack_peek(n, w)? as u16;
        let flags = self.stack_peek(2 * n, w)?;
        let cpl = self.state.cpl;

        if op32 && flags & Eflags::VM.bits() != 0 && cpl == 0 {
            return self.iret_to_vm86(eip, cs_sel, flags);
        }

        let code = self.read_code_descriptor(cs_sel)?;
        let rpl = (cs_sel & 3) as u8;
        if rpl < cpl {
            return Err(Fault::gp(cs_sel));
        }
        let conforming = code.access() & ACC_DC != 0;
        if (conforming && code.dpl() > rpl) || (!conforming && code.dpl() != rpl) {
            return Err(Fault::gp(cs_sel));
        }
        if !code.present() {
            return Err(Fault::np(cs_sel));
        }
        if eip > code.limit() {
            return Err(Fault::gp0());
        }

        if rpl > cpl {
            // Return to an outer level: the old SS:ESP follows the flags.
            let esp = self.stack_peek(3 * n, w)?;
            let ss_sel = self.stack_peek(4 * n, w)? as u16;
            let ss = self.check_stack_segment(ss_sel, rpl, StackCheck::Load)?;
            let mask = self.state.writable_flags_mask(op32);
            self.commit_cs(cs_sel, &code, rpl)?;
            *self.state.seg_mut(SegReg::Ss) = ss;
            self.state.set_reg(Gpr::Esp, if ss.big() { esp } else { esp & 0xffff });
            self.state.eip = eip;
            self.merge_flags(flags, mask);
            self.null_inaccessible_segments();
        } else {
            let mask = self.state.writable_flags_mask(op32);
            self.commit_cs(cs_sel, &code, cpl)?;
            let sp = self.state.sp().wrapping_add(3 * n);
            self.state.set_sp(sp);
            self.state.eip = eip;
            self.merge_flags(flags, mask);
        }
        Ok(())
    }

    fn iret_to_vm86(&mut self, eip: u32, cs: u16, flags: u32) -> Result<(), Fault> {
        let mut frame = [0u32; 6];
        for (i, v) in frame.iter_mut().enumerate() {
            *v = self.stack_peek(12 + 4 * i as u32, Width::W32)?;
        }
        let [esp, ss, es, ds, fs, gs] = frame;
        debug!(cs, eip, "IRET to virtual-8086 mode");
        self.state.flags.set_word(flags);
        self.state.load_seg_vm86(SegReg::Cs, cs);
        for (seg, sel) in [
            (SegReg::Ss, ss),
            (SegReg::Es, es),
            (SegReg::Ds, ds),
            (SegReg::Fs, fs),
            (SegReg::Gs, gs),
        ] {
            self.state.load_seg_vm86(seg, sel as u16);
        }
        self.state.set_reg(Gpr::Esp, esp);
        self.state.eip = eip & 0xffff;
        self.invalidate_fetch();
        Ok(())
    }

    /// POPF/IRET flag update at the current privilege.
    pub(crate) fn write_flags(&mut self, value: u32, op32: bool) {
        let mask = self.state.writable_flags_mask(op32);
        self.merge_flags(value, mask);
    }

    fn merge_flags(&mut self, value: u32, mask: u32) {
        let old = self.state.flags.rebuild();
        self.state.flags.set_word((old & !mask) | (value & mask));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::model::CpuConfig;
    use crate::state::{Cr0, TableReg};

    #[test]
    fn irq_line_respects_if_and_shadow() {
        let mut vcpu = Vcpu::new(CpuConfig::new(CpuModel::I386), FlatTestBus::new(0x10000));
        vcpu.bus.load(0x20 * 4, &[0x00, 0x10, 0x00, 0x00]);
        vcpu.state.set_reg(Gpr::Esp, 0x8000);
        vcpu.pending.raise_irq(0x20);

        assert!(!vcpu.service_interrupts());
        vcpu.state.flags.set(Eflags::IF, true);
        vcpu.pending.inhibit_interrupts_for_one_instruction();
        assert!(!vcpu.service_interrupts());
        vcpu.pending.retire_instruction();
        assert!(vcpu.service_interrupts());
        assert_eq!(vcpu.state.eip, 0x1000);
        assert!(!vcpu.state.flags.interrupts_enabled());
        assert_eq!(vcpu.pending.irq(), None);
    }

    #[test]
    fn double_fault_classes() {
        assert!(should_double_fault(Exception::GeneralProtection, Exception::SegmentNotPresent));
        assert!(should_double_fault(Exception::PageFault, Exception::PageFault));
        assert!(!should_double_fault(Exception::Breakpoint, Exception::GeneralProtection));
        assert!(!should_double_fault(Exception::GeneralProtection, Exception::PageFault));
    }

    #[test]
    fn empty_idt_triple_faults() {
        let mut vcpu = Vcpu::new(CpuConfig::new(CpuModel::I386), FlatTestBus::new(0x10000));
        vcpu.state.cr0 |= Cr0::PE;
        vcpu.state.idtr = TableReg { base: 0, limit: 0 };
        vcpu.raise_fault(Fault::ud());
        assert_eq!(vcpu.exit, Some(CpuExit::TripleFault));
    }
}
