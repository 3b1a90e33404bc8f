#![forbid(unsafe_code)]

//! Block translator for the pcx86 CPU core.
//!
//! Recorded traces are lowered into a flat list of host operations over a
//! small host register file ([`ir`]). Guest registers are cached in host
//! registers across a block ([`regalloc`]); anything that can fault is a
//! helper op that goes through the vCPU's memory accessors, so translated
//! code sees exactly the segmentation, paging and code-page tracking the
//! interpreter sees.
//!
//! [`WasmtimeBackend`] turns each block into a wasm module ([`wasm`]) and
//! plugs into [`pcx86_cpu::Scheduler`] through the
//! [`pcx86_cpu::jit::JitBackend`] trait:
//!
//! ```no_run
//! use pcx86_cpu::jit::JitConfig;
//! use pcx86_cpu::{CpuConfig, CpuModel, FlatTestBus, Scheduler, SchedulerConfig, Vcpu};
//! use pcx86_jit::{BackendConfig, WasmtimeBackend};
//!
//! let mut vcpu = Vcpu::new(CpuConfig::new(CpuModel::I486), FlatTestBus::new(1 << 20));
//! let backend = WasmtimeBackend::new(BackendConfig::default()).unwrap();
//! let mut sched = Scheduler::new(SchedulerConfig::default(), JitConfig::default(), backend);
//! sched.run_slice(&mut vcpu);
//! ```
//!
//! [`interp::ReferenceBackend`] runs the same host ops without generating
//! code and is the oracle the wasm backend is tested against.

pub mod backend;
pub mod emitter;
pub mod interp;
pub mod ir;
mod ops;
pub mod regalloc;
mod translate;
pub mod wasm;

pub use backend::{BackendConfig, BackendConfigError, BackendError};
#[cfg(not(target_arch = "wasm32"))]
pub use backend::{CompiledBlock, WasmtimeBackend};
pub use emitter::{CodeBuffer, Executable, Writable};
pub use interp::ReferenceBackend;

#[cfg(test)]
mod test_util;
