//! CPU model, vendor and feature policy.

use bitflags::bitflags;
use thiserror::Error;

/// Emulated processor generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CpuModel {
    I8088,
    I286,
    I386,
    I486,
    Pentium,
    K6,
}

impl CpuModel {
    /// 486-class timing applies to the 486 and everything after it.
    #[inline]
    pub fn is_486_class(self) -> bool {
        self >= CpuModel::I486
    }

    #[inline]
    pub fn is_8088(self) -> bool {
        self == CpuModel::I8088
    }

    #[inline]
    pub fn has_32bit(self) -> bool {
        self >= CpuModel::I386
    }

    #[inline]
    pub fn has_protected_mode(self) -> bool {
        self >= CpuModel::I286
    }

    pub fn default_features(self) -> CpuFeatures {
        match self {
            CpuModel::I8088 | CpuModel::I286 | CpuModel::I386 => CpuFeatures::empty(),
            CpuModel::I486 => CpuFeatures::FPU,
            CpuModel::Pentium => {
                CpuFeatures::FPU
                    | CpuFeatures::TSC
                    | CpuFeatures::MSR
                    | CpuFeatures::CX8
                    | CpuFeatures::PSE
            }
            CpuModel::K6 => {
                CpuFeatures::FPU
                    | CpuFeatures::TSC
                    | CpuFeatures::MSR
                    | CpuFeatures::CX8
                    | CpuFeatures::PSE
                    | CpuFeatures::MMX
                    | CpuFeatures::SYSCALL
            }
        }
    }
}

/// CPU vendor. Affects CPUID strings and a few quirks (AAM/AAD immediate base).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuVendor {
    Intel,
    Amd,
    Cyrix,
    Idt,
}

impl CpuVendor {
    pub fn cpuid_string(self) -> &'static [u8; 12] {
        match self {
            CpuVendor::Intel => b"GenuineIntel",
            CpuVendor::Amd => b"AuthenticAMD",
            CpuVendor::Cyrix => b"CyrixInstead",
            CpuVendor::Idt => b"CentaurHauls",
        }
    }
}

bitflags! {
    /// Optional instruction-set features.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuFeatures: u32 {
        /// On-chip (or installed) x87.
        const FPU = 1 << 0;
        const TSC = 1 << 1;
        const MSR = 1 << 2;
        /// CMPXCHG8B.
        const CX8 = 1 << 3;
        /// 4MB pages.
        const PSE = 1 << 4;
        const MMX = 1 << 5;
        /// SYSCALL/SYSRET (AMD K6 style, enabled through EFER.SCE).
        const SYSCALL = 1 << 6;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{feature} requires at least a {minimum:?} (configured {model:?})")]
    FeatureNeedsNewerModel {
        feature: &'static str,
        model: CpuModel,
        minimum: CpuModel,
    },
    #[error("SYSCALL/SYSRET is only available on AMD parts (configured {0:?})")]
    SyscallNeedsAmd(CpuVendor),
}

/// Static CPU configuration chosen at machine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub vendor: CpuVendor,
    pub features: CpuFeatures,
}

impl CpuConfig {
    pub fn new(model: CpuModel) -> Self {
        let vendor = if model == CpuModel::K6 {
            CpuVendor::Amd
        } else {
            CpuVendor::Intel
        };
        Self {
            model,
            vendor,
            features: model.default_features(),
        }
    }

    pub fn with_vendor(mut self, vendor: CpuVendor) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn with_features(mut self, features: CpuFeatures) -> Self {
        self.features = features;
        self
    }

    /// Install or remove an external x87 (8087/287/387 socket).
    pub fn with_fpu(mut self, present: bool) -> Self {
        self.features.set(CpuFeatures::FPU, present);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let needs = |feature: &'static str, flag: CpuFeatures, minimum: CpuModel| {
            if self.features.contains(flag) && self.model < minimum {
                Err(ConfigError::FeatureNeedsNewerModel {
                    feature,
                    model: self.model,
                    minimum,
                })
            } else {
                Ok(())
            }
        };
        needs("TSC", CpuFeatures::TSC, CpuModel::Pentium)?;
        needs("MSR", CpuFeatures::MSR, CpuModel::Pentium)?;
        needs("CMPXCHG8B", CpuFeatures::CX8, CpuModel::Pentium)?;
        needs("PSE", CpuFeatures::PSE, CpuModel::Pentium)?;
        needs("MMX", CpuFeatures::MMX, CpuModel::Pentium)?;
        needs("SYSCALL", CpuFeatures::SYSCALL, CpuModel::K6)?;
        if self.features.contains(CpuFeatures::SYSCALL) && self.vendor != CpuVendor::Amd {
            return Err(ConfigError::SyscallNeedsAmd(self.vendor));
        }
        Ok(())
    }

    #[inline]
    pub fn has(&self, feature: CpuFeatures) -> bool {
        self.features.contains(feature)
    }
}
