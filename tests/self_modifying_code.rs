//! Guest writes into translated code must never let stale blocks run.

mod harness;

use harness::{assert_same_state, eager_jit, interpreted, real_mode, run_to_halt, translated};
use pcx86_cpu::jit::{BlockKey, BlockMode, JitConfig, NullBackend};
use pcx86_cpu::{
    CpuConfig, CpuModel, FlatTestBus, Gpr, PagingBus, Scheduler, SchedulerConfig, SegReg, Vcpu,
    Width,
};
use pcx86_mmu::{MemoryBus, Ram};

/// 0:  mov cx, 10
/// 3:  l: inc ax             ; patched to inc bx
/// 4:  cmp cx, 5
/// 7:  jnz 14
/// 9:  mov byte [3], 43h     ; DS = CS
/// 14: loop l
/// 16: hlt
const PATCH_LOOP: [u8; 17] = [
    0xb9, 0x0a, 0x00, 0x40, 0x83, 0xf9, 0x05, 0x75, 0x05, 0xc6, 0x06, 0x03, 0x00, 0x43, 0xe2, 0xf3,
    0xf4,
];

fn patch_loop(model: CpuModel) -> Vcpu<FlatTestBus> {
    let mut v = real_mode(model, &PATCH_LOOP);
    v.state.load_seg_real(SegReg::Ds, 0x100);
    v
}

#[test]
fn patched_instruction_takes_effect_on_the_next_iteration() {
    harness::init_tracing();
    for model in [CpuModel::I8088, CpuModel::I386, CpuModel::Pentium] {
        let mut expected = interpreted(patch_loop(model)).unwrap();
        let mut actual = translated(patch_loop(model), eager_jit()).unwrap();
        assert_same_state(&mut expected.vcpu, &mut actual.vcpu);

        let v = &actual.vcpu;
        assert_eq!(v.state.reg(Gpr::Eax), 6, "{model:?}");
        assert_eq!(v.state.reg(Gpr::Ebx), 4, "{model:?}");
        assert_eq!(v.bus.read_u8(0x1003), 0x43);

        let stats = actual.stats;
        assert!(stats.invalidations >= 1, "{model:?}: {stats:?}");
        // The loop body was compiled again after the patch.
        assert!(stats.compiles >= 3, "{model:?}: {stats:?}");
    }
}

#[test]
fn block_that_rewrites_itself_stays_correct() {
    // 0:  mov cx, 8
    // 3:  l: mov byte [10], 43h
    // 8:  inc dx
    // 9:  nop
    // 10: inc ax                ; becomes inc bx before it first runs
    // 11: loop l
    // 13: hlt
    let code = [
        0xb9, 0x08, 0x00, 0xc6, 0x06, 0x0a, 0x00, 0x43, 0x42, 0x90, 0x40, 0xe2, 0xf6, 0xf4,
    ];
    let prep = || {
        let mut v = real_mode(CpuModel::I486, &code);
        v.state.load_seg_real(SegReg::Ds, 0x100);
        v
    };
    let mut expected = interpreted(prep()).unwrap();
    let mut actual = translated(prep(), eager_jit()).unwrap();
    assert_same_state(&mut expected.vcpu, &mut actual.vcpu);

    let v = &actual.vcpu;
    assert_eq!(v.state.reg(Gpr::Eax), 0);
    assert_eq!(v.state.reg(Gpr::Ebx), 8);
    assert_eq!(v.state.reg(Gpr::Edx), 8);
}

#[test]
fn code_written_through_another_segment_is_seen() {
    // The patch goes through ES, which aliases the code at a different
    // segment:offset pair.
    //
    // 0:  mov cx, 6
    // 3:  l: add ax, 1           ; immediate patched to 2
    // 6:  cmp cx, 4
    // 9:  jnz 17
    // 11: es: mov byte [15h], 2  ; ES = 00ffh, so ES:0015h is CS:0005h
    // 17: loop l
    // 19: hlt
    let code = [
        0xb9, 0x06, 0x00, // mov cx, 6
        0x83, 0xc0, 0x01, // l: add ax, 1
        0x83, 0xf9, 0x04, // cmp cx, 4
        0x75, 0x06, // jnz 17
        0x26, 0xc6, 0x06, 0x15, 0x00, 0x02, // mov byte es:[15h], 2
        0xe2, 0xf0, // loop l
        0xf4, // hlt
    ];
    let prep = || {
        let mut v = real_mode(CpuModel::I386, &code);
        v.state.load_seg_real(SegReg::Es, 0xff);
        v
    };
    let mut expected = interpreted(prep()).unwrap();
    let mut actual = translated(prep(), eager_jit()).unwrap();
    assert_same_state(&mut expected.vcpu, &mut actual.vcpu);
    // Three iterations add 1 (cx = 6, 5, 4), three add 2.
    assert_eq!(actual.vcpu.state.reg(Gpr::Eax), 9);
}

#[test]
fn interpreter_only_configuration_compiles_nothing() {
    let out = translated(patch_loop(CpuModel::I386), JitConfig::disabled()).unwrap();
    assert_eq!(out.stats.compiles, 0);
    assert_eq!(out.stats.hits, 0);
    assert_eq!(out.vcpu.state.reg(Gpr::Eax), 6);
}

/// 386 in real mode with the A20 gate closed. ES=FFFFh, so ES:1013h wraps
/// to physical 1003h, the `inc ax` at CS:0003h.
///
/// 0:  mov cx, 10
/// 3:  l: inc ax             ; patched to inc bx
/// 4:  cmp cx, 5
/// 7:  jnz 15
/// 9:  es: mov byte [1013h], 43h
/// 15: loop l
/// 17: hlt
fn wrapped_patch_loop() -> Vcpu<PagingBus<Ram>> {
    let code = [
        0xb9, 0x0a, 0x00, // mov cx, 10
        0x40, // l: inc ax
        0x83, 0xf9, 0x05, // cmp cx, 5
        0x75, 0x06, // jnz 15
        0x26, 0xc6, 0x06, 0x13, 0x10, 0x43, // mov byte es:[1013h], 43h
        0xe2, 0xf2, // loop l
        0xf4, // hlt
    ];
    let mut ram = Ram::new(0x20_0000);
    ram.load(0x1000, &code);
    let mut bus = PagingBus::new(ram);
    bus.set_a20(false);
    let mut v = Vcpu::new(CpuConfig::new(CpuModel::I386), bus);
    v.sync_control();
    v.state.load_seg_real(SegReg::Cs, 0x100);
    v.state.load_seg_real(SegReg::Ds, 0x300);
    v.state.load_seg_real(SegReg::Es, 0xffff);
    v.state.load_seg_real(SegReg::Ss, 0x200);
    v.state.set_reg(Gpr::Esp, 0x1000);
    v.state.eip = 0;
    v
}

#[test]
fn patch_through_the_a20_wrap_reaches_translated_code() {
    harness::init_tracing();
    let mut expected = wrapped_patch_loop();
    let mut s = Scheduler::new(
        SchedulerConfig {
            slice_cycles: harness::SLICE,
        },
        JitConfig::disabled(),
        NullBackend,
    );
    run_to_halt(&mut s, &mut expected).unwrap();

    let mut actual = wrapped_patch_loop();
    let mut s = Scheduler::new(
        SchedulerConfig {
            slice_cycles: harness::SLICE,
        },
        eager_jit(),
        harness::wasm_backend(),
    );
    run_to_halt(&mut s, &mut actual).unwrap();

    for v in [&mut expected, &mut actual] {
        assert_eq!(v.state.reg(Gpr::Eax), 6);
        assert_eq!(v.state.reg(Gpr::Ebx), 4);
        assert_eq!(v.bus.inner_mut().read_u8(0x1003), 0x43);
        assert_eq!(v.bus.inner_mut().read_u8(0x10_1003), 0);
    }
    assert_eq!(actual.state.regs, expected.state.regs);
    assert_eq!(actual.state.eip, expected.state.eip);
    assert_eq!(actual.state.flags.rebuild(), expected.state.flags.rebuild());
    let stats = s.jit().stats();
    assert!(stats.invalidations >= 1, "{stats:?}");
}

#[test]
fn rewriting_identical_bytes_retranslates_to_the_same_block() {
    // 0: l: inc ax; 1: add bx, ax; 3: loop l; 5: hlt
    let code = [0x40, 0x01, 0xc3, 0xe2, 0xfb, 0xf4];
    let prep = || {
        let mut v = real_mode(CpuModel::I386, &code);
        v.state.load_seg_real(SegReg::Ds, 0x100);
        v.state.set_reg(Gpr::Ecx, 200);
        v
    };
    let key = BlockKey {
        cs_base: 0x1000,
        eip: 0,
        code32: false,
        cpl: 0,
        mode: BlockMode::Real,
    };

    let mut actual = prep();
    let mut s = Scheduler::new(
        SchedulerConfig { slice_cycles: 1_000 },
        eager_jit(),
        harness::wasm_backend(),
    );
    s.run_slice(&mut actual);
    let warm = s.jit().block(&key).expect("loop body compiled").code().ops().to_vec();
    let compiles = s.jit().stats().compiles;

    // Same opcode, but still a store into a page with translated code.
    actual.write_mem(SegReg::Ds, 0, Width::W8, 0x40).unwrap();
    run_to_halt(&mut s, &mut actual).unwrap();

    let again = s.jit().block(&key).expect("loop body compiled again").code().ops().to_vec();
    assert_eq!(again, warm);
    let stats = s.jit().stats();
    assert_eq!(stats.compiles, compiles + 1, "{stats:?}");
    assert!(stats.invalidations >= 1, "{stats:?}");

    let mut expected = interpreted(prep()).unwrap();
    assert_same_state(&mut expected.vcpu, &mut actual);
    assert_eq!(actual.state.reg(Gpr::Eax), 200);
    assert_eq!(actual.state.reg(Gpr::Ebx), 20_100);
}
