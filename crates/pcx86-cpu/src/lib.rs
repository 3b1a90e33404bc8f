#![forbid(unsafe_code)]

//! x86 CPU core (8088 through Pentium/K6) for a PC emulator.
//!
//! The crate is centered around [`Vcpu`], which owns the register file
//! ([`state::CpuState`]), the pending-event latch and the bus the core talks
//! to. Two execution paths share it:
//! - the interpreter (`interp`), the always-correct baseline
//! - translated blocks, run through the [`jit::JitBackend`] seam by the
//!   [`exec::Scheduler`]
//!
//! All guest memory traffic from either path goes through the accessors in
//! `access`, which apply segmentation, paging and code-page tracking.

mod access;

pub mod code_pages;
pub mod cpuid;
pub mod decode;
pub mod exceptions;
pub mod exec;
pub mod interp;
pub mod interrupts;
pub mod jit;
pub mod mem;
pub mod model;
pub mod msr;
pub mod paging_bus;
pub mod state;
pub mod time;
pub mod timing;
pub mod types;
pub mod vcpu;

pub use access::Validated;
pub use exceptions::{Exception, Fault};
pub use exec::{ExecState, Scheduler, SchedulerConfig, SliceExit};
pub use interrupts::{CpuExit, InterruptController};
pub use mem::{CpuBus, FlatTestBus, IoBus};
pub use model::{ConfigError, CpuConfig, CpuFeatures, CpuModel, CpuVendor};
pub use paging_bus::PagingBus;
pub use state::CpuState;
pub use types::{Gpr, SegReg, Width};
pub use vcpu::Vcpu;
