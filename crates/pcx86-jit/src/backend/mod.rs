//! Host-code backends.
//!
//! [`WasmtimeBackend`] lowers each block to a wasm module and runs it under
//! wasmtime. [`crate::interp::ReferenceBackend`] walks the same host ops
//! directly and is what the wasm backend is checked against.

use thiserror::Error;

#[cfg(not(target_arch = "wasm32"))]
mod wasmtime;

#[cfg(not(target_arch = "wasm32"))]
pub use self::wasmtime::{CompiledBlock, WasmtimeBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    /// Upper bound on host ops per block.
    pub max_ops: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { max_ops: 16 * 1024 }
    }
}

/// Smallest op budget that still fits one instruction and its exit.
pub const MIN_OPS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendConfigError {
    #[error("max_ops must be at least 16 (got {0})")]
    MaxOps(usize),
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), BackendConfigError> {
        if self.max_ops < MIN_OPS {
            return Err(BackendConfigError::MaxOps(self.max_ops));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] BackendConfigError),
    /// Engine, memory or import setup failed.
    #[error("wasm runtime setup: {0}")]
    Runtime(String),
}
