use super::*;
use crate::mem::FlatTestBus;
use crate::model::{CpuConfig, CpuVendor};
use crate::state::descriptor::Descriptor;
use crate::state::flags::Eflags;
use crate::state::{Cr0, Segment, TableReg};

/// Real-mode machine: CS=0x0100 (code at 0x1000), SS=0x0200, SP=0x0100.
fn real(config: CpuConfig, code: &[u8]) -> Vcpu<FlatTestBus> {
    let mut bus = FlatTestBus::new(0x20000);
    bus.load(0x1000, code);
    let mut v = Vcpu::new(config, bus);
    v.state.load_seg_real(SegReg::Cs, 0x0100);
    v.state.load_seg_real(SegReg::Ss, 0x0200);
    v.state.eip = 0;
    v.state.set_reg(Gpr::Esp, 0x0100);
    v
}

fn retire(v: &mut Vcpu<FlatTestBus>) -> Flow {
    match v.step() {
        Step::Retired { flow, .. } => flow,
        other => panic!("expected retirement, got {other:?}"),
    }
}

fn set_ivt(v: &mut Vcpu<FlatTestBus>, vector: u8, cs: u16, ip: u16) {
    let entry = u32::from(vector) * 4;
    v.bus.load(entry, &ip.to_le_bytes());
    v.bus.load(entry + 2, &cs.to_le_bytes());
}

#[test]
fn daa_adjusts_low_nibble() {
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x27]);
    v.state.write_gpr(0, Width::W8, 0x0f);
    retire(&mut v);
    assert_eq!(v.state.read_gpr(0, Width::W8), 0x15);
    assert!(v.state.flags.get(Eflags::AF));
    assert!(!v.state.flags.get(Eflags::CF));
}

#[test]
fn das_tests_the_original_al_for_the_high_adjustment() {
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x2f]);
    v.state.write_gpr(0, Width::W8, 0x9a);
    retire(&mut v);
    assert_eq!(v.state.read_gpr(0, Width::W8), 0x34);
    assert!(v.state.flags.get(Eflags::AF));
    assert!(v.state.flags.get(Eflags::CF));

    // The low-nibble borrow wraps AL, but 05h is below 9Ah so no 60h.
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x2f]);
    v.state.write_gpr(0, Width::W8, 0x05);
    v.state.flags.set(Eflags::AF, true);
    retire(&mut v);
    assert_eq!(v.state.read_gpr(0, Width::W8), 0xff);
    assert!(v.state.flags.get(Eflags::AF));
    assert!(v.state.flags.get(Eflags::CF));
}

#[test]
fn aad_immediate_base_depends_on_vendor() {
    let amd = CpuConfig::new(CpuModel::K6).with_vendor(CpuVendor::Amd);
    let mut v = real(amd, &[0xd5, 0x10]);
    v.state.write_gpr(0, Width::W16, 0x0205);
    retire(&mut v);
    assert_eq!(v.state.read_gpr(0, Width::W16), 0x0025);

    let mut v = real(CpuConfig::new(CpuModel::Pentium), &[0xd5, 0x10]);
    v.state.write_gpr(0, Width::W16, 0x0205);
    retire(&mut v);
    assert_eq!(v.state.read_gpr(0, Width::W16), 0x0019);
}

#[test]
fn shift_by_zero_keeps_flags_and_count_is_masked() {
    // stc; shl ax, 0; shl ax, 33
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0xf9, 0xc1, 0xe0, 0x00, 0xc1, 0xe0, 0x21]);
    v.state.set_reg(Gpr::Eax, 1);
    retire(&mut v);
    retire(&mut v);
    assert!(v.state.flags.get(Eflags::CF));
    assert_eq!(v.state.reg(Gpr::Eax), 1);
    retire(&mut v);
    assert_eq!(v.state.reg(Gpr::Eax), 2);
    assert!(!v.state.flags.get(Eflags::CF));
}

#[test]
fn push_sp_differs_on_the_8088() {
    let mut v = real(CpuConfig::new(CpuModel::I8088), &[0x54]);
    retire(&mut v);
    assert_eq!(v.bus.read_u16(0x2000 + 0xfe), 0x00fe);

    let mut v = real(CpuConfig::new(CpuModel::I286), &[0x54]);
    retire(&mut v);
    assert_eq!(v.bus.read_u16(0x2000 + 0xfe), 0x0100);
}

#[test]
fn pop_to_memory_addresses_with_incremented_sp() {
    // pop word [esp]
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x67, 0x8f, 0x04, 0x24]);
    v.bus.load(0x2100, &0xbeefu16.to_le_bytes());
    retire(&mut v);
    assert_eq!(v.state.sp(), 0x0102);
    assert_eq!(v.bus.read_u16(0x2102), 0xbeef);
}

#[test]
fn rep_stosb_runs_in_chunks() {
    // rep stosb
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0xf3, 0xaa]);
    v.state.load_seg_real(SegReg::Es, 0x0800);
    v.state.set_reg(Gpr::Ecx, 300);
    v.state.write_gpr(0, Width::W8, 0x5a);

    let flow = retire(&mut v);
    assert_eq!(flow, Flow::Iterations(string::REP_CHUNK));
    assert_eq!(v.state.reg(Gpr::Ecx), 300 - string::REP_CHUNK);
    assert_eq!(v.state.eip, 0, "resumes at the REP prefix");

    let flow = retire(&mut v);
    assert_eq!(flow, Flow::Iterations(300 - string::REP_CHUNK));
    assert_eq!(v.state.reg(Gpr::Ecx), 0);
    assert_eq!(v.state.eip, 2);
    assert_eq!(v.bus.read_u8(0x8000 + 299), 0x5a);
    assert_eq!(v.bus.read_u8(0x8000 + 300), 0);
}

#[test]
fn rep_fault_keeps_completed_iterations() {
    // rep movsd crossing the DS limit on the second iteration.
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x66, 0xf3, 0xa5]);
    set_ivt(&mut v, 13, 0x0000, 0x0500);
    v.state.load_seg_real(SegReg::Es, 0x0800);
    v.state.set_reg(Gpr::Esi, 0xfffa);
    v.state.set_reg(Gpr::Ecx, 10);
    match v.step() {
        Step::Faulted { fault, .. } => assert_eq!(fault, Fault::gp0()),
        other => panic!("expected #GP, got {other:?}"),
    }
    assert_eq!(v.state.reg(Gpr::Ecx), 9);
    assert_eq!(v.state.reg(Gpr::Esi), 0xfffe);
    assert_eq!(v.state.reg(Gpr::Edi), 4);
    // Delivered with the REP instruction as the return address.
    assert_eq!(v.state.eip, 0x0500);
    assert_eq!(v.bus.read_u16(0x2000 + 0xfa), 0);
}

#[test]
fn int_and_iret_in_real_mode() {
    let mut v = real(CpuConfig::new(CpuModel::I286), &[0xcd, 0x21, 0x90]);
    set_ivt(&mut v, 0x21, 0x0000, 0x0600);
    v.bus.load(0x0600, &[0xcf]);
    v.state.flags.set(Eflags::IF, true);
    retire(&mut v);
    assert_eq!(v.state.seg(SegReg::Cs).selector, 0);
    assert_eq!(v.state.eip, 0x0600);
    assert!(!v.state.flags.interrupts_enabled());
    retire(&mut v);
    assert_eq!(v.state.seg(SegReg::Cs).selector, 0x0100);
    assert_eq!(v.state.eip, 2);
    assert!(v.state.flags.interrupts_enabled());
}

#[test]
fn divide_error_return_address_per_model() {
    // div bl with bl = 0
    for (model, ret) in [(CpuModel::I386, 0u16), (CpuModel::I8088, 2)] {
        let mut v = real(CpuConfig::new(model), &[0xf6, 0xf3]);
        set_ivt(&mut v, 0, 0x0000, 0x0700);
        v.state.set_reg(Gpr::Eax, 100);
        assert!(matches!(v.step(), Step::Faulted { .. }));
        assert_eq!(v.state.eip, 0x0700);
        assert_eq!(v.bus.read_u16(0x2000 + 0xfa), ret, "{model:?}");
    }
}

#[test]
fn loop_counts_down_cx() {
    // inc bx; loop -3
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x43, 0xe2, 0xfd]);
    v.state.set_reg(Gpr::Ecx, 3);
    for _ in 0..6 {
        retire(&mut v);
    }
    assert_eq!(v.state.reg(Gpr::Ebx), 3);
    assert_eq!(v.state.reg(Gpr::Ecx), 0);
    assert_eq!(v.state.eip, 3);
}

#[test]
fn bound_raises_br() {
    // bound ax, [0x300]
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x62, 0x06, 0x00, 0x03]);
    set_ivt(&mut v, 5, 0, 0x0800);
    v.bus.load(0x300, &[0x10, 0x00, 0x20, 0x00]);
    v.state.set_reg(Gpr::Eax, 0x21);
    match v.step() {
        Step::Faulted { fault, .. } => assert_eq!(fault.exception, Exception::BoundRangeExceeded),
        other => panic!("{other:?}"),
    }
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0x62, 0x06, 0x00, 0x03]);
    v.bus.load(0x300, &[0x10, 0x00, 0x20, 0x00]);
    v.state.set_reg(Gpr::Eax, 0x20);
    retire(&mut v);
}

#[test]
fn hlt_stops_the_cpu() {
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0xf4]);
    retire(&mut v);
    assert!(v.state.halted);
    assert_eq!(v.step(), Step::Halted);
}

#[test]
fn in_and_out_use_the_bus() {
    // in al, 0x60; out dx, ax
    let mut v = real(CpuConfig::new(CpuModel::I386), &[0xe4, 0x60, 0xef]);
    v.bus.ports.insert(0x60, 0xab);
    v.state.set_reg(Gpr::Edx, 0x3f8);
    v.state.set_reg(Gpr::Eax, 0x1234);
    retire(&mut v);
    assert_eq!(v.state.reg(Gpr::Eax), 0x12ab);
    retire(&mut v);
    assert_eq!(v.bus.io_writes, vec![(0x3f8, Width::W16, 0x12ab)]);
}

#[test]
fn x87_arithmetic_and_integer_store() {
    // fld1; fadd st0, st0; fistp word [0x300]
    let code = [0xd9, 0xe8, 0xd8, 0xc0, 0xdf, 0x1e, 0x00, 0x03];
    let mut v = real(CpuConfig::new(CpuModel::I486), &code);
    for _ in 0..3 {
        retire(&mut v);
    }
    assert_eq!(v.bus.read_u16(0x300), 2);
    assert!(v.state.fpu.is_empty(0));
}

#[test]
fn escape_without_coprocessor() {
    let cfg = CpuConfig::new(CpuModel::I386);
    let mut v = real(cfg, &[0xd9, 0xe8]);
    retire(&mut v);
    assert!(v.state.fpu.is_empty(0));

    let mut v = real(cfg, &[0xd9, 0xe8]);
    v.state.cr0 |= Cr0::EM;
    set_ivt(&mut v, 7, 0, 0x0900);
    match v.step() {
        Step::Faulted { fault, .. } => assert_eq!(fault, Fault::nm()),
        other => panic!("{other:?}"),
    }
}

#[test]
fn mmx_gating() {
    let mut v = real(CpuConfig::new(CpuModel::K6), &[0x0f, 0x77]);
    let insn = v.fetch_decode(0).unwrap();
    v.state.cr0 |= Cr0::EM;
    assert_eq!(v.execute(&insn), Err(Fault::ud()));
    v.state.cr0 = Cr0::TS;
    assert_eq!(v.execute(&insn), Err(Fault::nm()));
    v.state.cr0 = Cr0::empty();
    assert_eq!(v.execute(&insn), Ok(Flow::Next));
}

// ---- protected mode -----------------------------------------------------------

const GDT: u32 = 0x0800;
const TSS: u32 = 0x5000;

/// Flat 32-bit protected mode at CPL3 with a call gate (0x30) to CPL0 code
/// at 0x08:0x3000 that takes one parameter.
fn protected() -> Vcpu<FlatTestBus> {
    let mut bus = FlatTestBus::new(0x20000);
    let gdt: [u64; 7] = [
        0,
        0x00cf_9a00_0000_ffff, // 0x08 code DPL0
        0x00cf_9200_0000_ffff, // 0x10 data DPL0
        0x00cf_fa00_0000_ffff, // 0x18 code DPL3
        0x00cf_f200_0000_ffff, // 0x20 data DPL3
        0x0000_8900_5000_0067, // 0x28 TSS32
        0x0000_ec01_0008_3000, // 0x30 call gate DPL3, 1 param
    ];
    for (i, d) in gdt.iter().enumerate() {
        bus.load(GDT + i as u32 * 8, &d.to_le_bytes());
    }
    bus.load(TSS + 4, &0x9000u32.to_le_bytes());
    bus.load(TSS + 8, &0x10u16.to_le_bytes());

    let mut v = Vcpu::new(CpuConfig::new(CpuModel::I386), bus);
    v.state.cr0 |= Cr0::PE;
    v.state.gdtr = TableReg {
        base: GDT,
        limit: 7 * 8 - 1,
    };
    let desc = |i: usize| Descriptor::new(gdt[i] as u32, (gdt[i] >> 32) as u32);
    v.state.tr = Segment::from_descriptor(0x28, &desc(5));
    *v.state.seg_mut(SegReg::Cs) = Segment::from_descriptor(0x1b, &desc(3));
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
        *v.state.seg_mut(seg) = Segment::from_descriptor(0x23, &desc(4));
    }
    v.state.cpl = 3;
    v.state.eip = 0x1000;
    v.state.set_reg(Gpr::Esp, 0x7000);
    v
}

#[test]
fn call_gate_switches_to_inner_stack_and_back() {
    let mut v = protected();
    // call far 0x30:0 ; (at 0x3000) retf 4
    v.bus.load(0x1000, &[0x9a, 0, 0, 0, 0, 0x30, 0x00]);
    v.bus.load(0x3000, &[0xca, 0x04, 0x00]);
    v.push(Width::W32, 0xaaaa_5555).unwrap();

    retire(&mut v);
    assert_eq!(v.state.cpl, 0);
    assert_eq!(v.state.seg(SegReg::Cs).selector, 0x08);
    assert_eq!(v.state.seg(SegReg::Ss).selector, 0x10);
    assert_eq!(v.state.eip, 0x3000);
    assert_eq!(v.state.reg(Gpr::Esp), 0x9000 - 20);
    let frame: Vec<u32> = (0..5).map(|i| v.bus.read_u32(0x8fec + i * 4)).collect();
    assert_eq!(frame, vec![0x1007, 0x1b, 0xaaaa_5555, 0x6ffc, 0x23]);

    retire(&mut v);
    assert_eq!(v.state.cpl, 3);
    assert_eq!(v.state.seg(SegReg::Cs).selector, 0x1b);
    assert_eq!(v.state.seg(SegReg::Ss).selector, 0x23);
    assert_eq!(v.state.eip, 0x1007);
    assert_eq!(v.state.reg(Gpr::Esp), 0x7000);
}

#[test]
fn far_call_to_more_privileged_code_segment_faults() {
    let mut v = protected();
    // call far 0x08:0x3000 directly from CPL3
    v.bus.load(0x1000, &[0x9a, 0x00, 0x30, 0, 0, 0x08, 0x00]);
    let insn = v.fetch_decode(0x1000).unwrap();
    v.state.eip = 0x1007;
    assert_eq!(v.execute(&insn), Err(Fault::gp(0x08)));
    assert_eq!(v.state.reg(Gpr::Esp), 0x7000);
}

#[test]
fn privileged_instructions_fault_at_cpl3() {
    let mut v = protected();
    // hlt
    v.bus.load(0x1000, &[0xf4]);
    let insn = v.fetch_decode(0x1000).unwrap();
    assert_eq!(v.execute(&insn), Err(Fault::gp0()));
    assert!(!v.state.halted);
}

#[test]
fn io_permission_bitmap() {
    let mut v = protected();
    // Extend the TSS to cover a bitmap at offset 0x68.
    v.state.tr.limit = 0x68 + 0x20;
    v.bus.load(TSS + 0x66, &0x68u16.to_le_bytes());
    // Port 0x60 denied, 0x61 allowed.
    v.bus.load(TSS + 0x68 + 0x0c, &[0x01, 0x00]);
    assert_eq!(v.check_io(0x60, Width::W8), Err(Fault::gp0()));
    assert_eq!(v.check_io(0x61, Width::W8), Ok(()));
    // A word access at 0x5f touches 0x60.
    assert_eq!(v.check_io(0x5f, Width::W16), Err(Fault::gp0()));
    // IOPL 3 bypasses the bitmap.
    v.state.flags.set(Eflags::IOPL, true);
    assert_eq!(v.check_io(0x60, Width::W8), Ok(()));
}
