//! Translated execution must leave the machine in the same state as the
//! interpreter, whatever mix of instructions a block contains.

mod harness;

use harness::{assert_same_state, eager_jit, interpreted, real_mode, translated, DATA};
use pcx86_cpu::{CpuModel, Gpr};
use proptest::prelude::*;

/// Loop-body fragments. None of them touch CX or leave SP unbalanced; the
/// memory forms address DS:0100h-010Fh.
const SNIPPETS: &[&[u8]] = &[
    &[0x01, 0xd8],                   // add ax, bx
    &[0x11, 0xc2],                   // adc dx, ax
    &[0x19, 0xee],                   // sbb si, bp
    &[0x31, 0xd7],                   // xor di, dx
    &[0x81, 0xe3, 0xf0, 0x0f],       // and bx, 0ff0h
    &[0x83, 0xcd, 0x03],             // or bp, 3
    &[0x46],                         // inc si
    &[0x4f],                         // dec di
    &[0xf7, 0xd8],                   // neg ax
    &[0xf7, 0xd3],                   // not bx
    &[0xd1, 0xe0],                   // shl ax, 1
    &[0xc1, 0xfa, 0x03],             // sar dx, 3
    &[0xd1, 0xd3],                   // rcl bx, 1
    &[0xc1, 0xce, 0x05],             // ror si, 5
    &[0xd3, 0xed],                   // shr bp, cl
    &[0xd3, 0xdf],                   // rcr di, cl
    &[0x89, 0xf0],                   // mov ax, si
    &[0x0f, 0xb6, 0xd8],             // movzx bx, al
    &[0x0f, 0xbe, 0xd3],             // movsx dx, bl
    &[0x8d, 0x71, 0x07],             // lea si, [bx+di+7]
    &[0x92],                         // xchg ax, dx
    &[0x98],                         // cbw
    &[0x99],                         // cwd
    &[0x0f, 0x95, 0xc3],             // setnz bl
    &[0xf9],                         // stc
    &[0xf5],                         // cmc
    &[0xf8],                         // clc
    &[0x00, 0xe0],                   // add al, ah
    &[0x28, 0xde],                   // sub dh, bl
    &[0xa9, 0x00, 0x80],             // test ax, 8000h
    &[0x39, 0xd3],                   // cmp bx, dx
    &[0x66, 0x01, 0xd8],             // add eax, ebx
    &[0x66, 0xc1, 0xe2, 0x07],       // shl edx, 7
    &[0x74, 0x01, 0x40],             // jz $+3; inc ax
    &[0x72, 0x02, 0xf7, 0xd7],       // jc $+4; not di
    &[0x50, 0x5b],                   // push ax; pop bx
    &[0x01, 0x06, 0x00, 0x01],       // add [0100h], ax
    &[0x8b, 0x16, 0x02, 0x01],       // mov dx, [0102h]
    &[0x86, 0x1e, 0x04, 0x01],       // xchg [0104h], bl
    &[0xff, 0x06, 0x06, 0x01],       // inc word [0106h]
    &[0xd1, 0x26, 0x08, 0x01],       // shl word [0108h], 1
    &[0x80, 0x2e, 0x0a, 0x01, 0x07], // sub byte [010ah], 7
    &[0x39, 0x36, 0x0c, 0x01],       // cmp [010ch], si
    &[0xd3, 0x3e, 0x0e, 0x01],       // sar word [010eh], cl
    &[0xff, 0x36, 0x00, 0x01, 0x5f], // push word [0100h]; pop di
    // The translator leaves the last three to the interpreter.
    &[0x9f],       // lahf
    &[0xf7, 0xe3], // mul bx
    &[0x27],       // daa
];

/// Index of the first fragment the translator refuses.
const INTERPRETED_ONLY: usize = SNIPPETS.len() - 3;

/// `mov cx, 12; l: <body>; loop l; hlt`
fn program(body: &[usize]) -> Vec<u8> {
    let mut code = vec![0xb9, 0x0c, 0x00];
    let start = code.len();
    for &i in body {
        code.extend_from_slice(SNIPPETS[i]);
    }
    let disp = start as i32 - (code.len() as i32 + 2);
    code.extend_from_slice(&[0xe2, disp as i8 as u8, 0xf4]);
    code
}

fn model() -> impl Strategy<Value = CpuModel> {
    prop_oneof![
        Just(CpuModel::I386),
        Just(CpuModel::I486),
        Just(CpuModel::Pentium),
        Just(CpuModel::K6),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn random_loops_match_the_interpreter(
        model in model(),
        body in prop::collection::vec(0..SNIPPETS.len(), 1..12),
        regs in prop::array::uniform6(any::<u16>()),
        data in prop::array::uniform16(any::<u8>()),
    ) {
        let code = program(&body);
        let prep = || {
            let mut v = real_mode(model, &code);
            v.bus.load(DATA + 0x100, &data);
            let gprs = [Gpr::Eax, Gpr::Ebx, Gpr::Edx, Gpr::Esi, Gpr::Edi, Gpr::Ebp];
            for (gpr, value) in gprs.into_iter().zip(regs) {
                v.state.set_reg(gpr, u32::from(value));
            }
            v
        };

        let mut expected = interpreted(prep()).unwrap();
        let mut actual = translated(prep(), eager_jit()).unwrap();
        assert_same_state(&mut expected.vcpu, &mut actual.vcpu);
        prop_assert_eq!(actual.vcpu.state.reg(Gpr::Ecx), 0);
        if body[0] < INTERPRETED_ONLY {
            prop_assert!(actual.stats.hits > 0, "no block ever ran: {:?}", actual.stats);
        }
    }
}

#[test]
fn hot_loop_runs_mostly_translated() {
    harness::init_tracing();
    // mov cx, 1000; l: add ax, cx; adc dx, 0; loop l; hlt
    let code = [0xb9, 0xe8, 0x03, 0x01, 0xc8, 0x83, 0xd2, 0x00, 0xe2, 0xf9, 0xf4];
    let mut expected = interpreted(real_mode(CpuModel::I486, &code)).unwrap();
    let mut actual = translated(real_mode(CpuModel::I486, &code), eager_jit()).unwrap();
    assert_same_state(&mut expected.vcpu, &mut actual.vcpu);

    // 1000 * 1001 / 2 = 500500 = 7a314h
    assert_eq!(actual.vcpu.state.reg(Gpr::Eax), 0xa314);
    assert_eq!(actual.vcpu.state.reg(Gpr::Edx), 7);
    let stats = actual.stats;
    tracing::info!(?stats, "hot loop finished");
    assert_eq!(stats.compiles, 1);
    assert!(stats.insns_retired >= 2900, "{stats:?}");
}

#[test]
fn fault_inside_a_block_is_delivered_like_the_interpreter() {
    harness::init_tracing();
    let code = [
        0xb9, 0x0c, 0x00, // mov cx, 12
        0xbe, 0xf1, 0xff, // mov si, 0fff1h
        0x8b, 0x14, // l: mov dx, [si]
        0x01, 0xd0, // add ax, dx
        0x46, // inc si
        0x46, // inc si
        0xe2, 0xf8, // loop l
        0xf4, // hlt
    ];
    let prep = || {
        let mut v = real_mode(CpuModel::I386, &code);
        // #GP handler at 0060h:0000h: mov dx, 0deadh; hlt
        v.bus.load(13 * 4, &[0x00, 0x00, 0x60, 0x00]);
        v.bus.load(0x600, &[0xba, 0xad, 0xde, 0xf4]);
        v.bus.load(DATA + 0xfff1, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        v
    };

    let mut expected = interpreted(prep()).unwrap();
    let mut actual = translated(prep(), eager_jit()).unwrap();
    assert_same_state(&mut expected.vcpu, &mut actual.vcpu);

    let v = &actual.vcpu;
    assert_eq!(v.state.reg(Gpr::Edx), 0xdead);
    assert_eq!(v.state.reg(Gpr::Esi), 0xffff);
    // Seven iterations retired before the eighth faulted.
    assert_eq!(v.state.reg(Gpr::Ecx), 5);
    assert!(actual.stats.rollbacks >= 1, "{:?}", actual.stats);
}

#[test]
fn real_mode_8088_wraps_instead_of_faulting() {
    // Same loop on the 8088: the word access at 0ffffh wraps to offset 0.
    let code = [
        0xb9, 0x0a, 0x00, // mov cx, 10
        0xbe, 0xf1, 0xff, // mov si, 0fff1h
        0x8b, 0x14, // l: mov dx, [si]
        0x01, 0xd0, // add ax, dx
        0x46, // inc si
        0x46, // inc si
        0xe2, 0xf8, // loop l
        0xf4, // hlt
    ];
    let prep = || {
        let mut v = real_mode(CpuModel::I8088, &code);
        v.bus.load(DATA, &[0xab]);
        v.bus.load(DATA + 0xffff, &[0xcd]);
        v
    };
    let mut expected = interpreted(prep()).unwrap();
    let mut actual = translated(prep(), eager_jit()).unwrap();
    assert_same_state(&mut expected.vcpu, &mut actual.vcpu);
    assert_eq!(actual.vcpu.state.reg(Gpr::Ecx), 0);
    assert_eq!(actual.vcpu.state.reg(Gpr::Eax), 0xabcd);
}
