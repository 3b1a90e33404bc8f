//! Dynamic translation support: the block cache, trace recording, and the
//! [`JitBackend`] seam a host-code translator plugs into.
//!
//! The translator itself lives in the `pcx86-jit` crate. This module owns
//! everything the scheduler needs regardless of which backend is installed.

pub mod cache;
pub mod runtime;
pub mod trace;

pub use cache::{BlockCache, BlockKey, BlockMeta, BlockMode, CachedBlock, PageDep};
pub use runtime::{
    BlockExit, ExitReason, JitBackend, JitRuntime, NullBackend, TranslateError, Translation,
};
pub use trace::{Trace, TraceRecorder, TracedInsn};

use thiserror::Error;

/// Translator and block cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitConfig {
    pub enabled: bool,
    /// Interpreted visits to a block entry before it is recorded and compiled.
    pub hot_threshold: u32,
    /// Instruction cap for one block.
    pub max_block_insns: u32,
    /// Hash buckets; must be a power of two.
    pub cache_buckets: usize,
    /// Maximum blocks per hash bucket.
    pub chain_len: usize,
    /// Maximum resident blocks.
    pub cache_max_blocks: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_threshold: 16,
            max_block_insns: 64,
            cache_buckets: 1024,
            chain_len: 4,
            cache_max_blocks: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitConfigError {
    #[error("cache_buckets must be a non-zero power of two (got {0})")]
    Buckets(usize),
    #[error("chain_len must be non-zero")]
    ChainLen,
    #[error("max_block_insns must be between 1 and 4096 (got {0})")]
    BlockLen(u32),
    #[error("cache_max_blocks must be non-zero")]
    Capacity,
}

impl JitConfig {
    /// Interpreter only.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), JitConfigError> {
        if self.cache_buckets == 0 || !self.cache_buckets.is_power_of_two() {
            return Err(JitConfigError::Buckets(self.cache_buckets));
        }
        if self.chain_len == 0 {
            return Err(JitConfigError::ChainLen);
        }
        if self.max_block_insns == 0 || self.max_block_insns > 4096 {
            return Err(JitConfigError::BlockLen(self.max_block_insns));
        }
        if self.cache_max_blocks == 0 {
            return Err(JitConfigError::Capacity);
        }
        Ok(())
    }
}

/// Block cache and translator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
    /// Traces the backend refused (untranslatable first instruction).
    pub compile_failures: u64,
    pub evictions: u64,
    pub invalidations: u64,
    /// Block exits that handed the next instruction to the interpreter.
    pub fallbacks: u64,
    /// Block exits caused by a fault inside translated code.
    pub rollbacks: u64,
    /// Guest instructions retired by translated code.
    pub insns_retired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        JitConfig::default().validate().unwrap();
        JitConfig::disabled().validate().unwrap();
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let bad = JitConfig {
            cache_buckets: 1000,
            ..JitConfig::default()
        };
        assert_eq!(bad.validate(), Err(JitConfigError::Buckets(1000)));
        let bad = JitConfig {
            max_block_insns: 0,
            ..JitConfig::default()
        };
        assert_eq!(bad.validate(), Err(JitConfigError::BlockLen(0)));
    }
}
