//! Port I/O and the TSS permission bitmap.

use crate::decode::{Arg, Insn};
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::types::Width;
use crate::vcpu::Vcpu;

use super::{width_of, Flow};

/// Offset of the I/O map base field in a 32-bit TSS.
const TSS_IOMAP_BASE: u32 = 0x66;

impl<B: CpuBus> Vcpu<B> {
    /// Permission check for an access of `w` at `port`. Protected mode with
    /// CPL > IOPL, and V86 mode always, consult the 32-bit TSS bitmap.
    pub(crate) fn check_io(&mut self, port: u16, w: Width) -> Result<(), Fault> {
        if !self.state.protected_mode() {
            return Ok(());
        }
        if !self.state.vm86() && self.state.cpl <= self.state.flags.iopl() {
            return Ok(());
        }
        let tr = self.state.tr;
        // 16-bit TSSes carry no bitmap.
        if !tr.checked || tr.access & 0x8 == 0 || tr.limit < TSS_IOMAP_BASE + 1 {
            return Err(Fault::gp0());
        }
        let map = self.read_sys(tr.base.wrapping_add(TSS_IOMAP_BASE), Width::W16)?;
        let offset = map + u32::from(port >> 3);
        if offset + 1 > tr.limit {
            return Err(Fault::gp0());
        }
        let bits = self.read_sys(tr.base.wrapping_add(offset), Width::W16)?;
        let want = ((1u32 << w.bytes()) - 1) << (port & 7);
        if bits & want != 0 {
            return Err(Fault::gp0());
        }
        Ok(())
    }

    fn io_port(&mut self, insn: &Insn, arg: Arg) -> Result<u16, Fault> {
        Ok(self.read_arg(insn, arg)? as u16)
    }

    pub(super) fn exec_in(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.dst);
        let port = self.io_port(insn, insn.src)?;
        self.check_io(port, w)?;
        let v = self.bus.io_read(port, w);
        self.state.write_gpr(0, w, v);
        Ok(Flow::Next)
    }

    pub(super) fn exec_out(&mut self, insn: &Insn) -> Result<Flow, Fault> {
        let w = width_of(insn.src);
        let port = self.io_port(insn, insn.dst)?;
        self.check_io(port, w)?;
        let v = self.state.read_gpr(0, w);
        self.bus.io_write(port, w, v);
        Ok(Flow::Next)
    }
}
