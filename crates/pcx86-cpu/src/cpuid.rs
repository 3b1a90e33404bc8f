//! CPUID leaves and the reset signature.

use crate::model::{CpuConfig, CpuFeatures, CpuModel};

/// CPUID.1:EDX bits.
const EDX_FPU: u32 = 1 << 0;
const EDX_PSE: u32 = 1 << 3;
const EDX_TSC: u32 = 1 << 4;
const EDX_MSR: u32 = 1 << 5;
const EDX_CX8: u32 = 1 << 8;
const EDX_MMX: u32 = 1 << 23;
/// CPUID.80000001:EDX SYSCALL/SYSRET.
const EXT_EDX_SYSCALL: u32 = 1 << 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Family/model/stepping as reported in EDX after reset and in CPUID.1:EAX.
pub fn reset_signature(config: &CpuConfig) -> u32 {
    match config.model {
        CpuModel::I8088 | CpuModel::I286 => 0,
        CpuModel::I386 => 0x0308,
        CpuModel::I486 => 0x0421,
        CpuModel::Pentium if config.has(CpuFeatures::MMX) => 0x0543,
        CpuModel::Pentium => 0x0525,
        CpuModel::K6 => 0x0562,
    }
}

fn feature_edx(config: &CpuConfig) -> u32 {
    let mut edx = 0;
    for (flag, bit) in [
        (CpuFeatures::FPU, EDX_FPU),
        (CpuFeatures::PSE, EDX_PSE),
        (CpuFeatures::TSC, EDX_TSC),
        (CpuFeatures::MSR, EDX_MSR),
        (CpuFeatures::CX8, EDX_CX8),
        (CpuFeatures::MMX, EDX_MMX),
    ] {
        if config.has(flag) {
            edx |= bit;
        }
    }
    edx
}

fn vendor_regs(config: &CpuConfig) -> (u32, u32, u32) {
    let s = config.vendor.cpuid_string();
    let word = |i: usize| u32::from_le_bytes([s[i], s[i + 1], s[i + 2], s[i + 3]]);
    (word(0), word(4), word(8))
}

/// Execute CPUID for `leaf`. Unknown leaves return zeros.
pub fn cpuid(config: &CpuConfig, leaf: u32) -> CpuidResult {
    let (b, d, c) = vendor_regs(config);
    let has_ext = config.model == CpuModel::K6;
    match leaf {
        0 => CpuidResult {
            eax: 1,
            ebx: b,
            ecx: c,
            edx: d,
        },
        1 => CpuidResult {
            eax: reset_signature(config),
            edx: feature_edx(config),
            ..CpuidResult::default()
        },
        0x8000_0000 if has_ext => CpuidResult {
            eax: 0x8000_0001,
            ebx: b,
            ecx: c,
            edx: d,
        },
        0x8000_0001 if has_ext => {
            let mut edx = feature_edx(config);
            if config.has(CpuFeatures::SYSCALL) {
                edx |= EXT_EDX_SYSCALL;
            }
            CpuidResult {
                eax: reset_signature(config) | 0x100,
                edx,
                ..CpuidResult::default()
            }
        }
        _ => CpuidResult::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CpuVendor;

    #[test]
    fn vendor_string_layout() {
        let r = cpuid(&CpuConfig::new(CpuModel::Pentium), 0);
        let mut s = Vec::new();
        for reg in [r.ebx, r.edx, r.ecx] {
            s.extend_from_slice(&reg.to_le_bytes());
        }
        assert_eq!(&s, b"GenuineIntel");

        let r = cpuid(
            &CpuConfig::new(CpuModel::Pentium).with_vendor(CpuVendor::Cyrix),
            0,
        );
        assert_eq!(&r.ebx.to_le_bytes(), b"Cyri");
    }

    #[test]
    fn k6_reports_syscall_and_mmx() {
        let cfg = CpuConfig::new(CpuModel::K6);
        assert_ne!(cpuid(&cfg, 1).edx & EDX_MMX, 0);
        assert_ne!(cpuid(&cfg, 0x8000_0001).edx & EXT_EDX_SYSCALL, 0);
        assert_eq!(cpuid(&CpuConfig::new(CpuModel::Pentium), 0x8000_0000).eax, 0);
    }
}
