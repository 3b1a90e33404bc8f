//! The translator seam and the runtime that drives it.
//!
//! [`JitRuntime`] decides when a block entry is hot, hands recorded traces to
//! the installed [`JitBackend`], keeps the resulting code in the
//! [`BlockCache`], and runs cached blocks after checking that the pages they
//! were translated from still hold the same bytes at the same addresses.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace};

use crate::decode::Op;
use crate::mem::{AccessType, CpuBus};
use crate::vcpu::Vcpu;

use super::cache::{BlockCache, BlockKey, BlockMeta, BlockMode, CachedBlock, PageDep};
use super::trace::Trace;
use super::{JitConfig, JitStats};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("no translator installed")]
    Disabled,
    #[error("trace is empty")]
    EmptyTrace,
    #[error("{op:?} at {eip:#x} cannot be translated")]
    Untranslatable { eip: u32, op: Op },
    #[error("block needs {0} host ops, over the buffer limit")]
    TooLarge(usize),
    /// The host code generator or loader rejected the block.
    #[error("host backend: {0}")]
    Backend(String),
}

/// Why a compiled block returned to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Ran to its last instruction.
    End,
    /// Stopped in front of an instruction it does not cover; the interpreter
    /// runs that one next.
    Fallback,
    /// An instruction faulted. Guest state was rolled back to the start of
    /// that instruction; the interpreter re-executes it and delivers the
    /// fault.
    Fault,
    /// A store hit a page with compiled code; the rest of the block may be
    /// stale.
    CodeModified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    pub next_eip: u32,
    /// Guest instructions retired.
    pub insns: u32,
    pub cycles: u32,
    pub reason: ExitReason,
}

/// Output of a successful translation. A backend may cover only a prefix of
/// the trace.
#[derive(Debug)]
pub struct Translation<C> {
    pub code: C,
    pub insn_count: u32,
    pub byte_len: u32,
}

/// A host-code translator.
pub trait JitBackend {
    type Code;

    fn compile(&mut self, trace: &Trace) -> Result<Translation<Self::Code>, TranslateError>;

    /// Run a block whose entry matches the current CS:EIP and decode
    /// context. On return the register file is consistent with the
    /// interpreter's view at `next_eip`.
    fn execute<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>, code: &Self::Code) -> BlockExit;
}

/// Interpreter-only configuration: every compile request is refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl JitBackend for NullBackend {
    type Code = ();

    fn compile(&mut self, _trace: &Trace) -> Result<Translation<()>, TranslateError> {
        Err(TranslateError::Disabled)
    }

    fn execute<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>, _code: &()) -> BlockExit {
        BlockExit {
            next_eip: vcpu.state.eip,
            insns: 0,
            cycles: 0,
            reason: ExitReason::Fallback,
        }
    }
}

pub struct JitRuntime<K: JitBackend> {
    config: JitConfig,
    backend: K,
    cache: BlockCache<K::Code>,
    hot: HashMap<BlockKey, u32>,
    /// Entries whose traces the backend refused, with the page versions at
    /// the time. A write to any of those pages makes the entry eligible again.
    rejected: HashMap<BlockKey, Vec<PageDep>>,
    stats: JitStats,
}

impl<K: JitBackend> std::fmt::Debug for JitRuntime<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitRuntime")
            .field("config", &self.config)
            .field("blocks", &self.cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<K: JitBackend> JitRuntime<K> {
    pub fn new(config: JitConfig, backend: K) -> Self {
        Self {
            cache: BlockCache::new(&config),
            config,
            backend,
            hot: HashMap::new(),
            rejected: HashMap::new(),
            stats: JitStats::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> JitStats {
        self.stats
    }

    #[inline]
    pub fn backend_mut(&mut self) -> &mut K {
        &mut self.backend
    }

    #[inline]
    pub fn resident_blocks(&self) -> usize {
        self.cache.len()
    }

    pub fn is_resident(&self, key: &BlockKey) -> bool {
        self.cache.contains(key)
    }

    /// Host code of the resident block for `key`.
    pub fn block(&self, key: &BlockKey) -> Option<&K::Code> {
        self.cache.peek(key).map(|b| &b.code)
    }

    /// Key for the current CS:EIP, or `None` when translated code must not
    /// run (translator disabled, single-stepping).
    pub fn block_key<B: CpuBus>(&self, vcpu: &Vcpu<B>) -> Option<BlockKey> {
        if !self.config.enabled || vcpu.state.flags.tf() {
            return None;
        }
        let s = &vcpu.state;
        let mode = if !s.protected_mode() {
            BlockMode::Real
        } else if s.vm86() {
            BlockMode::Vm86
        } else {
            BlockMode::Protected
        };
        Some(BlockKey {
            cs_base: s.seg(crate::types::SegReg::Cs).base,
            eip: s.eip,
            code32: s.code32(),
            cpl: s.cpl,
            mode,
        })
    }

    /// Drop blocks whose code pages were written since the last call.
    pub fn sync_invalidations<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>) -> usize {
        let tracker = vcpu.bus.code_pages();
        if !tracker.has_dirty() {
            return 0;
        }
        let mut removed = 0;
        for page in tracker.take_dirty() {
            let n = self.cache.invalidate_page(page, tracker);
            if n != 0 {
                trace!(page, blocks = n, "invalidated blocks on code write");
            }
            removed += n;
        }
        self.stats.invalidations += removed as u64;
        removed
    }

    /// Run the cached block for `key`, if there is a valid one.
    pub fn try_execute<B: CpuBus>(
        &mut self,
        vcpu: &mut Vcpu<B>,
        key: &BlockKey,
    ) -> Option<BlockExit> {
        self.sync_invalidations(vcpu);
        let valid = match self.cache.peek(key) {
            Some(block) => pages_current(vcpu, key, &block.meta.pages),
            None => {
                self.stats.misses += 1;
                return None;
            }
        };
        if !valid {
            let tracker = vcpu.bus.code_pages();
            self.cache.remove(key, tracker);
            self.stats.invalidations += 1;
            self.stats.misses += 1;
            return None;
        }
        self.cache.touch(key);
        self.stats.hits += 1;

        let CachedBlock { code, .. } = self.cache.peek(key)?;
        let exit = self.backend.execute(vcpu, code);
        self.stats.insns_retired += u64::from(exit.insns);
        match exit.reason {
            ExitReason::End => {}
            ExitReason::Fallback => self.stats.fallbacks += 1,
            ExitReason::Fault => self.stats.rollbacks += 1,
            ExitReason::CodeModified => {
                self.sync_invalidations(vcpu);
            }
        }
        Some(exit)
    }

    /// Count an interpreted visit to `key`. True when the entry just became
    /// hot and a trace should be recorded.
    pub fn note_miss<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>, key: &BlockKey) -> bool {
        if let Some(pages) = self.rejected.get(key) {
            if pages_current(vcpu, key, pages) {
                return false;
            }
            self.rejected.remove(key);
        }
        if self.hot.len() >= self.config.cache_max_blocks.saturating_mul(4) {
            self.hot.clear();
        }
        let count = self.hot.entry(*key).or_insert(0);
        *count += 1;
        if *count >= self.config.hot_threshold {
            self.hot.remove(key);
            return true;
        }
        false
    }

    /// Translate a finished trace and make it resident. Traces whose bytes
    /// changed while they were being recorded are dropped.
    pub fn install<B: CpuBus>(&mut self, trace: Trace, vcpu: &mut Vcpu<B>) -> bool {
        if !pages_current(vcpu, &trace.key, &trace.pages) || !trace.still_matches(vcpu) {
            debug!(eip = trace.key.eip, "dropping trace: code changed while recording");
            return false;
        }
        match self.backend.compile(&trace) {
            Ok(t) => {
                self.stats.compiles += 1;
                debug!(
                    eip = trace.key.eip,
                    cs_base = trace.key.cs_base,
                    insns = t.insn_count,
                    bytes = t.byte_len,
                    "compiled block"
                );
                let meta = BlockMeta {
                    key: trace.key,
                    pages: trace.pages,
                    insn_count: t.insn_count,
                    byte_len: t.byte_len,
                };
                let tracker = vcpu.bus.code_pages();
                let evicted = self.cache.insert(meta, t.code, tracker);
                self.stats.evictions += evicted as u64;
                true
            }
            Err(err) => {
                self.stats.compile_failures += 1;
                debug!(eip = trace.key.eip, %err, "translation refused");
                if self.rejected.len() >= self.config.cache_max_blocks {
                    self.rejected.clear();
                }
                self.rejected.insert(trace.key, trace.pages);
                false
            }
        }
    }

    /// Drop every block and all hotness state (reset, triple fault).
    pub fn flush<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>) {
        debug!(blocks = self.cache.len(), "flushing block cache");
        self.cache.flush(vcpu.bus.code_pages());
        self.hot.clear();
        self.rejected.clear();
    }
}

/// The pages still map to the same frames and hold the same versions.
fn pages_current<B: CpuBus>(vcpu: &mut Vcpu<B>, key: &BlockKey, pages: &[PageDep]) -> bool {
    pages.iter().all(|dep| {
        let mapped = vcpu
            .bus
            .probe(dep.linear_page << 12, AccessType::Execute, key.cpl)
            .map(|p| p >> 12);
        mapped == Some(dep.phys_page) && vcpu.bus.code_pages().version(dep.phys_page) == dep.version
    })
}
