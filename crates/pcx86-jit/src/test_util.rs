//! Shared fixtures for the unit tests.

use pcx86_cpu::jit::{BlockKey, BlockMode, Trace, TraceRecorder};
use pcx86_cpu::{CpuConfig, CpuModel, FlatTestBus, Gpr, SegReg, Vcpu};

/// Real-mode vCPU with `code` at CS=0100h (linear 1000h), DS=0300h and the
/// stack at 0200h:1000h.
pub(crate) fn real_vcpu(model: CpuModel, code: &[u8]) -> Vcpu<FlatTestBus> {
    let mut bus = FlatTestBus::new(0x20000);
    bus.load(0x1000, code);
    let mut v = Vcpu::new(CpuConfig::new(model), bus);
    v.state.load_seg_real(SegReg::Cs, 0x100);
    v.state.load_seg_real(SegReg::Ds, 0x300);
    v.state.load_seg_real(SegReg::Es, 0x300);
    v.state.load_seg_real(SegReg::Ss, 0x200);
    v.state.set_reg(Gpr::Esp, 0x1000);
    v.state.eip = 0;
    v
}

/// Interpret from the current EIP until the recorder closes the trace.
pub(crate) fn record(v: &mut Vcpu<FlatTestBus>) -> Trace {
    let key = BlockKey {
        cs_base: v.state.seg(SegReg::Cs).base,
        eip: v.state.eip,
        code32: v.state.code32(),
        cpl: v.state.cpl,
        mode: BlockMode::Real,
    };
    let mut r = TraceRecorder::new(64);
    r.start(key, v.state.config);
    for _ in 0..64 {
        let step = v.step();
        if let Some(trace) = r.observe(&step, v) {
            return trace;
        }
    }
    panic!("trace did not finish");
}
