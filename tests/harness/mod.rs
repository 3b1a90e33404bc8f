#![allow(dead_code)]

use anyhow::{bail, Result};
use pcx86_cpu::jit::{JitBackend, JitConfig, JitStats, NullBackend};
use pcx86_cpu::mem::CpuBus;
use pcx86_cpu::{
    CpuConfig, CpuModel, FlatTestBus, Gpr, Scheduler, SchedulerConfig, SegReg, SliceExit, Vcpu,
};
use pcx86_jit::{BackendConfig, WasmtimeBackend};

/// Linear address of CS:0 for [`real_mode`] machines.
pub const CODE: u32 = 0x1000;
/// Linear address of DS:0.
pub const DATA: u32 = 0x3000;

pub const SLICE: u64 = 2_000;
pub const MAX_SLICES: usize = 1_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 128 KiB real-mode machine with `code` at 0100h:0000h, DS=ES=0300h and
/// the stack at 0200h:1000h. Interrupts are disabled.
pub fn real_mode(model: CpuModel, code: &[u8]) -> Vcpu<FlatTestBus> {
    let mut bus = FlatTestBus::new(0x20000);
    bus.load(CODE, code);
    let mut v = Vcpu::new(CpuConfig::new(model), bus);
    v.state.load_seg_real(SegReg::Cs, (CODE >> 4) as u16);
    v.state.load_seg_real(SegReg::Ds, (DATA >> 4) as u16);
    v.state.load_seg_real(SegReg::Es, (DATA >> 4) as u16);
    v.state.load_seg_real(SegReg::Ss, 0x200);
    v.state.set_reg(Gpr::Esp, 0x1000);
    v.state.eip = 0;
    v
}

/// Translator settings that compile blocks after two visits.
pub fn eager_jit() -> JitConfig {
    JitConfig {
        hot_threshold: 2,
        ..JitConfig::default()
    }
}

/// Run slices until the CPU halts with nothing left to wake it.
pub fn run_to_halt<K: JitBackend, B: CpuBus>(
    sched: &mut Scheduler<K>,
    v: &mut Vcpu<B>,
) -> Result<()> {
    for _ in 0..MAX_SLICES {
        match sched.run_slice(v) {
            SliceExit::Halted => return Ok(()),
            SliceExit::Reset => bail!("unexpected reset (eip {:#x})", v.state.eip),
            SliceExit::BudgetExhausted => {}
        }
    }
    bail!("cpu still running after {MAX_SLICES} slices (eip {:#x})", v.state.eip)
}

pub struct Outcome {
    pub vcpu: Vcpu<FlatTestBus>,
    pub stats: JitStats,
}

/// Run `v` to HLT with the translator off.
pub fn interpreted(mut v: Vcpu<FlatTestBus>) -> Result<Outcome> {
    let mut sched = Scheduler::new(
        SchedulerConfig { slice_cycles: SLICE },
        JitConfig::disabled(),
        NullBackend,
    );
    run_to_halt(&mut sched, &mut v)?;
    Ok(Outcome {
        stats: sched.jit().stats(),
        vcpu: v,
    })
}

pub fn wasm_backend() -> WasmtimeBackend {
    WasmtimeBackend::new(BackendConfig::default()).expect("wasmtime backend")
}

/// Run `v` to HLT with the wasm backend installed.
pub fn translated(mut v: Vcpu<FlatTestBus>, config: JitConfig) -> Result<Outcome> {
    let mut sched = Scheduler::new(SchedulerConfig { slice_cycles: SLICE }, config, wasm_backend());
    run_to_halt(&mut sched, &mut v)?;
    Ok(Outcome {
        stats: sched.jit().stats(),
        vcpu: v,
    })
}

/// Architectural state must agree. The TSC is left out: idling in HLT burns
/// whatever is left of the slice, and slices end on block boundaries.
pub fn assert_same_state(expected: &mut Vcpu<FlatTestBus>, actual: &mut Vcpu<FlatTestBus>) {
    assert_eq!(actual.state.regs, expected.state.regs, "registers");
    assert_eq!(actual.state.eip, expected.state.eip, "eip");
    assert_eq!(
        actual.state.flags.rebuild(),
        expected.state.flags.rebuild(),
        "eflags"
    );
    if let Some(at) = actual
        .bus
        .mem()
        .iter()
        .zip(expected.bus.mem())
        .position(|(a, b)| a != b)
    {
        panic!(
            "memory differs at {at:#x}: {:#04x} != {:#04x}",
            actual.bus.mem()[at],
            expected.bus.mem()[at]
        );
    }
}
