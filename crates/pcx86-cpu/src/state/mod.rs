//! The register file.

pub mod descriptor;
pub mod flags;
pub mod fpu;

use bitflags::bitflags;

use crate::exceptions::Fault;
use crate::model::{CpuConfig, CpuModel};
use crate::msr::MsrState;
use crate::types::{Gpr, SegReg, Width};

use descriptor::{Descriptor, ACC_CODE, ACC_DC, ACC_P, ACC_RW, ACC_S, FLAG_DB};
use flags::Flags;
use fpu::FpuState;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cr4: u32 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
    }
}

/// A segment register with its hidden descriptor cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub selector: u16,
    pub base: u32,
    /// Byte-granular limit.
    pub limit: u32,
    pub access: u8,
    /// Descriptor flags nibble (AVL/DB/G).
    pub flags: u8,
    /// Set when the cache was loaded from a validated selector; cleared for
    /// null selectors so that any use faults.
    pub checked: bool,
}

impl Segment {
    /// Power-on / real-mode style cache: 64K limit, present, writable.
    pub fn real_mode(selector: u16, code: bool) -> Self {
        Self {
            selector,
            base: u32::from(selector) << 4,
            limit: 0xffff,
            access: if code {
                ACC_P | ACC_S | ACC_CODE | ACC_RW | 1
            } else {
                ACC_P | ACC_S | ACC_RW | 1
            },
            flags: 0,
            checked: true,
        }
    }

    /// Virtual-8086 segment: DPL 3, 64K, writable.
    pub fn vm86(selector: u16) -> Self {
        Self {
            access: ACC_P | ACC_S | ACC_RW | 1 | (3 << 5),
            ..Self::real_mode(selector, false)
        }
    }

    pub fn from_descriptor(selector: u16, desc: &Descriptor) -> Self {
        Self {
            selector,
            base: desc.base(),
            limit: desc.limit(),
            access: desc.access(),
            flags: desc.flags(),
            checked: true,
        }
    }

    /// A null selector loaded into a data segment register.
    pub fn null(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0,
            access: 0,
            flags: 0,
            checked: false,
        }
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access & ACC_P != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[inline]
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.access & ACC_CODE != 0
    }

    #[inline]
    pub fn readable(&self) -> bool {
        !self.is_code() || self.access & ACC_RW != 0
    }

    #[inline]
    pub fn writable(&self) -> bool {
        !self.is_code() && self.access & ACC_RW != 0
    }

    #[inline]
    pub fn expand_down(&self) -> bool {
        !self.is_code() && self.access & ACC_DC != 0
    }

    #[inline]
    pub fn conforming(&self) -> bool {
        self.is_code() && self.access & ACC_DC != 0
    }

    /// D/B bit: 32-bit code segment or 32-bit stack.
    #[inline]
    pub fn big(&self) -> bool {
        self.flags & FLAG_DB != 0
    }
}

/// GDTR/IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TableReg {
    pub base: u32,
    pub limit: u16,
}

/// Complete architectural state of one CPU.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub config: CpuConfig,
    pub regs: [u32; 8],
    pub eip: u32,
    /// EIP of the instruction currently executing; faults rewind to it.
    pub old_eip: u32,
    pub flags: Flags,
    pub segs: [Segment; 6],
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub ldtr: Segment,
    pub tr: Segment,
    pub cr0: Cr0,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: Cr4,
    pub dr: [u32; 8],
    pub msr: MsrState,
    pub fpu: FpuState,
    pub cpl: u8,
    pub halted: bool,
    /// Fault latched by a full-form memory access.
    pub abort: Option<Fault>,
    /// Time-stamp counter (cycles retired).
    pub tsc: u64,
}

impl CpuState {
    pub fn new(config: CpuConfig) -> Self {
        let mut state = Self {
            config,
            regs: [0; 8],
            eip: 0,
            old_eip: 0,
            flags: Flags::default(),
            segs: [Segment::real_mode(0, false); 6],
            gdtr: TableReg::default(),
            idtr: TableReg::default(),
            ldtr: Segment::null(0),
            tr: Segment::null(0),
            cr0: Cr0::empty(),
            cr2: 0,
            cr3: 0,
            cr4: Cr4::empty(),
            dr: [0; 8],
            msr: MsrState::default(),
            fpu: FpuState::default(),
            cpl: 0,
            halted: false,
            abort: None,
            tsc: 0,
        };
        state.reset();
        state
    }

    /// Power-on reset for the configured model.
    pub fn reset(&mut self) {
        let model = self.config.model;
        self.regs = [0; 8];
        self.regs[Gpr::Edx.index()] = crate::cpuid::reset_signature(&self.config);
        self.flags = Flags::default();
        for seg in SegReg::ALL {
            self.segs[seg.index()] = Segment::real_mode(0, false);
        }

        let cs = match model {
            CpuModel::I8088 => {
                self.eip = 0;
                Segment::real_mode(0xffff, true)
            }
            CpuModel::I286 => {
                self.eip = 0xfff0;
                Segment {
                    base: 0x00ff_0000,
                    ..Segment::real_mode(0xf000, true)
                }
            }
            _ => {
                self.eip = 0xfff0;
                Segment {
                    base: 0xffff_0000,
                    ..Segment::real_mode(0xf000, true)
                }
            }
        };
        self.segs[SegReg::Cs.index()] = cs;
        self.old_eip = self.eip;

        self.gdtr = TableReg {
            base: 0,
            limit: 0xffff,
        };
        self.idtr = TableReg {
            base: 0,
            limit: 0x03ff,
        };
        self.ldtr = Segment::null(0);
        self.tr = Segment::null(0);
        self.cr0 = if model.is_486_class() {
            Cr0::ET | Cr0::NW | Cr0::CD
        } else if model.has_32bit() && self.config.has(crate::model::CpuFeatures::FPU) {
            Cr0::ET
        } else {
            Cr0::empty()
        };
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = Cr4::empty();
        self.dr = [0; 8];
        self.dr[6] = 0xffff_0ff0;
        self.dr[7] = 0x0000_0400;
        self.msr = MsrState::default();
        self.fpu = FpuState::default();
        self.cpl = 0;
        self.halted = false;
        self.abort = None;
        self.tsc = 0;
    }

    #[inline]
    pub fn model(&self) -> CpuModel {
        self.config.model
    }

    #[inline]
    pub fn reg(&self, r: Gpr) -> u32 {
        self.regs[r.index()]
    }

    #[inline]
    pub fn set_reg(&mut self, r: Gpr, v: u32) {
        self.regs[r.index()] = v;
    }

    /// Register by encoding index at a given width. Byte indices 4..7 name
    /// AH/CH/DH/BH.
    #[inline]
    pub fn read_gpr(&self, index: u8, width: Width) -> u32 {
        let i = usize::from(index & 7);
        match width {
            Width::W8 if i < 4 => self.regs[i] & 0xff,
            Width::W8 => (self.regs[i - 4] >> 8) & 0xff,
            Width::W16 => self.regs[i] & 0xffff,
            Width::W32 => self.regs[i],
        }
    }

    /// Write a register sub-view, leaving the other bits intact.
    #[inline]
    pub fn write_gpr(&mut self, index: u8, width: Width, v: u32) {
        let i = usize::from(index & 7);
        match width {
            Width::W8 if i < 4 => self.regs[i] = (self.regs[i] & !0xff) | (v & 0xff),
            Width::W8 => {
                self.regs[i - 4] = (self.regs[i - 4] & !0xff00) | ((v & 0xff) << 8);
            }
            Width::W16 => self.regs[i] = (self.regs[i] & !0xffff) | (v & 0xffff),
            Width::W32 => self.regs[i] = v,
        }
    }

    #[inline]
    pub fn seg(&self, seg: SegReg) -> &Segment {
        &self.segs[seg.index()]
    }

    #[inline]
    pub fn seg_mut(&mut self, seg: SegReg) -> &mut Segment {
        &mut self.segs[seg.index()]
    }

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.cr0.contains(Cr0::PE)
    }

    #[inline]
    pub fn real_mode(&self) -> bool {
        !self.protected_mode()
    }

    #[inline]
    pub fn vm86(&self) -> bool {
        self.protected_mode() && self.flags.vm()
    }

    /// Default operand/address size of the code segment.
    #[inline]
    pub fn code32(&self) -> bool {
        !self.vm86() && self.seg(SegReg::Cs).big()
    }

    #[inline]
    pub fn stack32(&self) -> bool {
        !self.vm86() && self.seg(SegReg::Ss).big()
    }

    #[inline]
    pub fn sp_mask(&self) -> u32 {
        if self.stack32() {
            0xffff_ffff
        } else {
            0xffff
        }
    }

    #[inline]
    pub fn sp(&self) -> u32 {
        self.reg(Gpr::Esp) & self.sp_mask()
    }

    /// Update SP (or ESP) preserving the untouched high half for 16-bit stacks.
    #[inline]
    pub fn set_sp(&mut self, v: u32) {
        let mask = self.sp_mask();
        let esp = self.reg(Gpr::Esp);
        self.set_reg(Gpr::Esp, (esp & !mask) | (v & mask));
    }

    /// Load a segment register the way real mode (and the 8088) does: base
    /// follows the selector; limit and attributes of the cache stay as they were.
    pub fn load_seg_real(&mut self, seg: SegReg, selector: u16) {
        let s = self.seg_mut(seg);
        s.selector = selector;
        s.base = u32::from(selector) << 4;
        s.checked = true;
        if seg == SegReg::Cs {
            s.access |= ACC_CODE;
            s.flags &= !FLAG_DB;
        }
    }

    /// Load a segment register in virtual-8086 mode.
    pub fn load_seg_vm86(&mut self, seg: SegReg, selector: u16) {
        *self.seg_mut(seg) = Segment::vm86(selector);
        if seg == SegReg::Cs {
            self.cpl = 3;
        }
    }

    /// IOPL check for CLI/STI/PUSHF/POPF/INT n/IRET in protected and V86 mode.
    #[inline]
    pub fn iopl_ok(&self) -> bool {
        self.real_mode() || self.flags.iopl() >= self.cpl
    }

    /// EFLAGS bits that POPF/IRET may change at the current privilege.
    pub fn writable_flags_mask(&self, op32: bool) -> u32 {
        use flags::Eflags;
        let mut mask = flags::STATUS_MASK | (Eflags::TF | Eflags::DF).bits();
        if self.model() >= CpuModel::I286 {
            mask |= Eflags::NT.bits();
            if self.real_mode() || self.cpl == 0 {
                mask |= Eflags::IOPL.bits();
            }
        }
        if self.real_mode() || self.cpl <= self.flags.iopl() {
            mask |= Eflags::IF.bits();
        }
        if op32 && self.model().has_32bit() {
            mask |= Eflags::RF.bits();
            if self.model().is_486_class() {
                mask |= Eflags::AC.bits();
            }
            if self.model() >= CpuModel::Pentium {
                mask |= Eflags::ID.bits();
            }
        } else {
            mask &= 0xffff;
        }
        mask
    }

    /// EFLAGS as PUSHF stores them (model-specific constant bits included).
    pub fn flags_image(&mut self) -> u32 {
        let mut word = self.flags.rebuild();
        match self.model() {
            CpuModel::I8088 => word |= 0xf000,
            CpuModel::I286 if self.real_mode() => word &= 0x0fff,
            _ => {}
        }
        word & !(flags::Eflags::RF | flags::Eflags::VM).bits()
    }
}
