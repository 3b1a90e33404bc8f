//! The scheduler with the wasm backend installed: interrupts, resets and
//! page remapping around cached blocks.

mod harness;

use harness::real_mode;
use pcx86_cpu::jit::JitConfig;
use pcx86_cpu::state::descriptor::Descriptor;
use pcx86_cpu::state::{Cr0, Segment, TableReg};
use pcx86_cpu::{
    CpuConfig, CpuExit, CpuModel, Gpr, PagingBus, Scheduler, SchedulerConfig, SegReg, SliceExit,
    Vcpu,
};
use pcx86_jit::WasmtimeBackend;
use pcx86_mmu::{MemoryBus, Ram};

fn scheduler(slice_cycles: u64) -> Scheduler<WasmtimeBackend> {
    Scheduler::new(
        SchedulerConfig { slice_cycles },
        harness::eager_jit(),
        harness::wasm_backend(),
    )
}

#[test]
fn timer_interrupts_arrive_between_blocks() {
    harness::init_tracing();
    // 0: sti; 1: inc ax; 2: add dx, ax; 4: jmp 1
    let mut v = real_mode(CpuModel::I386, &[0xfb, 0x40, 0x01, 0xc2, 0xeb, 0xfb]);
    // Vector 8 handler at 0000:0500h: inc bx; iret
    v.bus.load(8 * 4, &[0x00, 0x05, 0x00, 0x00]);
    v.bus.load(0x500, &[0x43, 0xcf]);

    let mut s = scheduler(10_000);
    s.timers_mut().add_periodic(0, 1000, Box::new(|_: u64| Some(8)));
    for _ in 0..5 {
        assert_eq!(s.run_slice(&mut v), SliceExit::BudgetExhausted);
    }

    let ticks = v.state.reg(Gpr::Ebx);
    assert!((40..=51).contains(&ticks), "ticks = {ticks}");
    let stats = s.jit().stats();
    assert!(stats.hits > 0, "{stats:?}");
    assert!(stats.insns_retired > 1000, "{stats:?}");
    // Every handler run got back into the loop.
    assert!(v.state.reg(Gpr::Eax) > 1000);
}

#[test]
fn reset_and_triple_fault_flush_the_block_cache() {
    // l: inc ax; jmp l
    let mut v = real_mode(CpuModel::I486, &[0x40, 0xeb, 0xfd]);
    let mut s = scheduler(5_000);
    s.run_slice(&mut v);
    assert!(s.jit().resident_blocks() > 0);

    v.pending.request_reset();
    assert_eq!(s.run_slice(&mut v), SliceExit::Reset);
    assert_eq!(s.jit().resident_blocks(), 0);
    assert_eq!(v.state.eip, 0xfff0);

    // Back into the loop, warm the cache again, then triple fault.
    v = real_mode(CpuModel::I486, &[0x40, 0xeb, 0xfd]);
    s.run_slice(&mut v);
    assert!(s.jit().resident_blocks() > 0);
    v.exit = Some(CpuExit::TripleFault);
    assert_eq!(s.run_slice(&mut v), SliceExit::Reset);
    assert_eq!(s.jit().resident_blocks(), 0);
    assert_eq!(s.resets(), 2);
}

#[test]
fn disabled_translator_never_compiles() {
    let mut v = real_mode(CpuModel::I486, &[0x40, 0xeb, 0xfd]);
    let mut s = Scheduler::new(
        SchedulerConfig { slice_cycles: 5_000 },
        JitConfig::disabled(),
        harness::wasm_backend(),
    );
    s.run_slice(&mut v);
    assert_eq!(s.jit().stats().compiles, 0);
    assert_eq!(s.jit().stats().misses, 0);
    assert!(v.state.reg(Gpr::Eax) > 100);
}

const GDT: u32 = 0x800;
const PD: u32 = 0x10000;
const PT: u32 = 0x11000;

/// Flat CPL0 protected mode with the first 4 MiB identity-mapped.
fn paged(code: &[u8]) -> Vcpu<PagingBus<Ram>> {
    let code0 = 0x00cf_9a00_0000_ffffu64;
    let data0 = 0x00cf_9200_0000_ffffu64;
    let mut ram = Ram::new(0x20_0000);
    for (i, d) in [0, code0, data0].iter().enumerate() {
        ram.write_u64(u64::from(GDT) + i as u64 * 8, *d);
    }
    ram.write_u32(u64::from(PD), PT | 0b011);
    for page in 0..1024u32 {
        ram.write_u32(u64::from(PT + page * 4), (page << 12) | 0b011);
    }
    ram.load(0x1000, code);

    let mut v = Vcpu::new(CpuConfig::new(CpuModel::Pentium), PagingBus::new(ram));
    v.state.gdtr = TableReg {
        base: GDT,
        limit: 3 * 8 - 1,
    };
    let desc = |d: u64| Descriptor::new(d as u32, (d >> 32) as u32);
    *v.state.seg_mut(SegReg::Cs) = Segment::from_descriptor(0x08, &desc(code0));
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
        *v.state.seg_mut(seg) = Segment::from_descriptor(0x10, &desc(data0));
    }
    v.state.cpl = 0;
    v.state.cr0 |= Cr0::PE | Cr0::PG;
    v.state.cr3 = PD;
    v.sync_control();
    v.state.eip = 0x1000;
    v.state.set_reg(Gpr::Esp, 0x8000);
    v
}

#[test]
fn remapping_a_code_page_retires_its_blocks() {
    harness::init_tracing();
    // l: inc eax; jmp l
    let mut v = paged(&[0x40, 0xeb, 0xfd]);
    // The same loop with inc ebx, in the frame at 40000h.
    v.bus.inner_mut().load(0x40000, &[0x43, 0xeb, 0xfd]);

    let mut s = scheduler(5_000);
    s.run_slice(&mut v);
    let eax = v.state.reg(Gpr::Eax);
    assert!(eax > 100);
    assert_eq!(s.jit().stats().compiles, 1);

    // Point linear page 1 at the other frame, as a guest reloading CR3 would.
    v.bus.inner_mut().write_u32(u64::from(PT + 4), 0x40000 | 0b011);
    v.bus.mmu_mut().flush_all();
    v.sync_control();

    s.run_slice(&mut v);
    assert_eq!(v.state.reg(Gpr::Eax), eax);
    assert!(v.state.reg(Gpr::Ebx) > 100);
    let stats = s.jit().stats();
    assert!(stats.invalidations >= 1, "{stats:?}");
    assert_eq!(stats.compiles, 2);
}
