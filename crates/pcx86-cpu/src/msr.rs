//! Model-specific registers.

use tracing::warn;

use crate::exceptions::Fault;

pub const MSR_TSC: u32 = 0x10;
pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;

/// EFER.SCE: SYSCALL/SYSRET enable.
pub const EFER_SCE: u64 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsrState {
    pub efer: u64,
    /// SYSRET CS in 63:48, SYSCALL CS in 47:32, SYSCALL EIP in 31:0.
    pub star: u64,
}

impl MsrState {
    /// RDMSR. `tsc` is the live time-stamp counter.
    pub fn read(&self, index: u32, tsc: u64, k6: bool) -> Result<u64, Fault> {
        match index {
            MSR_TSC => Ok(tsc),
            MSR_EFER if k6 => Ok(self.efer),
            MSR_STAR if k6 => Ok(self.star),
            _ => {
                warn!(msr = format_args!("{index:#x}"), "rdmsr of unknown MSR");
                Err(Fault::gp0())
            }
        }
    }

    /// WRMSR. Returns the new TSC value when the write targets the TSC.
    pub fn write(&mut self, index: u32, value: u64, k6: bool) -> Result<Option<u64>, Fault> {
        match index {
            MSR_TSC => Ok(Some(value)),
            MSR_EFER if k6 => {
                if value & !EFER_SCE != 0 {
                    return Err(Fault::gp0());
                }
                self.efer = value;
                Ok(None)
            }
            MSR_STAR if k6 => {
                self.star = value;
                Ok(None)
            }
            _ => {
                warn!(msr = format_args!("{index:#x}"), value, "wrmsr of unknown MSR");
                Err(Fault::gp0())
            }
        }
    }

    #[inline]
    pub fn syscall_enabled(&self) -> bool {
        self.efer & EFER_SCE != 0
    }
}
