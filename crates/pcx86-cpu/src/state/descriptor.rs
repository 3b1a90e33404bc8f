//! Segment and gate descriptor decoding.

/// Access-rights byte bits.
pub const ACC_ACCESSED: u8 = 1 << 0;
pub const ACC_RW: u8 = 1 << 1;
pub const ACC_DC: u8 = 1 << 2;
pub const ACC_CODE: u8 = 1 << 3;
pub const ACC_S: u8 = 1 << 4;
pub const ACC_P: u8 = 1 << 7;

/// Flags nibble (descriptor byte 6, high nibble) shifted down to bits 0..3.
pub const FLAG_AVL: u8 = 1 << 0;
pub const FLAG_DB: u8 = 1 << 2;
pub const FLAG_G: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    Tss16Available,
    Ldt,
    Tss16Busy,
    CallGate16,
    TaskGate,
    InterruptGate16,
    TrapGate16,
    Tss32Available,
    Tss32Busy,
    CallGate32,
    InterruptGate32,
    TrapGate32,
    Reserved,
}

impl SystemKind {
    fn from_type(ty: u8) -> Self {
        match ty & 0xf {
            0x1 => SystemKind::Tss16Available,
            0x2 => SystemKind::Ldt,
            0x3 => SystemKind::Tss16Busy,
            0x4 => SystemKind::CallGate16,
            0x5 => SystemKind::TaskGate,
            0x6 => SystemKind::InterruptGate16,
            0x7 => SystemKind::TrapGate16,
            0x9 => SystemKind::Tss32Available,
            0xb => SystemKind::Tss32Busy,
            0xc => SystemKind::CallGate32,
            0xe => SystemKind::InterruptGate32,
            0xf => SystemKind::TrapGate32,
            _ => SystemKind::Reserved,
        }
    }

    #[inline]
    pub fn is_32bit_gate(self) -> bool {
        matches!(
            self,
            SystemKind::CallGate32 | SystemKind::InterruptGate32 | SystemKind::TrapGate32
        )
    }
}

/// A raw 8-byte descriptor as read from the GDT/LDT/IDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub raw: u64,
}

impl Descriptor {
    #[inline]
    pub fn new(low: u32, high: u32) -> Self {
        Self {
            raw: u64::from(low) | (u64::from(high) << 32),
        }
    }

    #[inline]
    fn low(&self) -> u32 {
        self.raw as u32
    }

    #[inline]
    fn high(&self) -> u32 {
        (self.raw >> 32) as u32
    }

    #[inline]
    pub fn base(&self) -> u32 {
        (self.low() >> 16) | ((self.high() & 0xff) << 16) | (self.high() & 0xff00_0000)
    }

    /// Raw 20-bit limit field.
    #[inline]
    pub fn raw_limit(&self) -> u32 {
        (self.low() & 0xffff) | (self.high() & 0x000f_0000)
    }

    /// Byte-granular limit (G scales by 4K and fills the low 12 bits).
    #[inline]
    pub fn limit(&self) -> u32 {
        let raw = self.raw_limit();
        if self.flags() & FLAG_G != 0 {
            (raw << 12) | 0xfff
        } else {
            raw
        }
    }

    #[inline]
    pub fn access(&self) -> u8 {
        (self.high() >> 8) as u8
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        ((self.high() >> 20) & 0xf) as u8
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access() & ACC_P != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access() >> 5) & 3
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.access() & ACC_S == 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access() & ACC_CODE != 0
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        !self.is_system() && self.access() & ACC_CODE == 0
    }

    #[inline]
    pub fn system_kind(&self) -> SystemKind {
        SystemKind::from_type(self.access())
    }

    /// Gate target selector.
    #[inline]
    pub fn gate_selector(&self) -> u16 {
        (self.low() >> 16) as u16
    }

    /// Gate target offset (16-bit gates ignore the high word).
    #[inline]
    pub fn gate_offset(&self) -> u32 {
        let off = (self.low() & 0xffff) | (self.high() & 0xffff_0000);
        if self.system_kind().is_32bit_gate() {
            off
        } else {
            off & 0xffff
        }
    }

    /// Call gate parameter count.
    #[inline]
    pub fn gate_param_count(&self) -> u8 {
        (self.high() & 0x1f) as u8
    }

    /// Descriptor with the busy bit (type bit 1) set; TSS descriptors only.
    #[inline]
    pub fn with_busy(&self) -> Descriptor {
        Descriptor {
            raw: self.raw | (0x2u64 << 40),
        }
    }

    /// Descriptor with the accessed bit set.
    #[inline]
    pub fn with_accessed(&self) -> Descriptor {
        Descriptor {
            raw: self.raw | (u64::from(ACC_ACCESSED) << 40),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_code_descriptor() {
        // base 0, limit 0xfffff, G=1, D=1, P=1, DPL=0, code, readable.
        let d = Descriptor {
            raw: 0x00cf_9a00_0000_ffff,
        };
        assert_eq!(d.base(), 0);
        assert_eq!(d.limit(), 0xffff_ffff);
        assert!(d.is_code());
        assert!(d.present());
        assert_eq!(d.dpl(), 0);
        assert_ne!(d.flags() & FLAG_DB, 0);
    }

    #[test]
    fn scattered_base_bytes() {
        let d = Descriptor {
            raw: 0x12_40_92_34_5678_0fff,
        };
        assert_eq!(d.base(), 0x1234_5678);
        assert_eq!(d.limit(), 0x0_0fff);
        assert!(d.is_data());
    }

    #[test]
    fn interrupt_gate_fields() {
        // 32-bit interrupt gate, selector 0x08, offset 0x1234_5678, DPL 3.
        let d = Descriptor {
            raw: 0x1234_ee00_0008_5678,
        };
        assert_eq!(d.system_kind(), SystemKind::InterruptGate32);
        assert_eq!(d.gate_selector(), 0x08);
        assert_eq!(d.gate_offset(), 0x1234_5678);
        assert_eq!(d.dpl(), 3);
    }
}
