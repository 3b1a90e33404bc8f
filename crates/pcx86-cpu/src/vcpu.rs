//! A CPU bound to its bus: the context object every handler and emitter runs on.

use crate::interrupts::{CpuExit, PendingEventState};
use crate::mem::CpuBus;
use crate::model::CpuConfig;
use crate::state::CpuState;

/// One-entry code translation cache for instruction fetch.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FetchCache {
    pub(crate) valid: bool,
    pub(crate) cpl: u8,
    pub(crate) linear_page: u32,
    pub(crate) phys_page: u32,
}

/// Linear/physical page pairs the current instruction was fetched from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsnPages {
    pages: [(u32, u32); 2],
    len: u8,
}

impl InsnPages {
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline]
    pub(crate) fn record(&mut self, linear_page: u32, phys_page: u32) {
        let n = usize::from(self.len);
        if self.pages[..n].iter().any(|&(l, _)| l == linear_page) {
            return;
        }
        if n < self.pages.len() {
            self.pages[n] = (linear_page, phys_page);
            self.len += 1;
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[(u32, u32)] {
        &self.pages[..usize::from(self.len)]
    }
}

/// A CPU together with the bus it executes against.
///
/// All guest memory traffic, from the interpreter and from translated code
/// alike, goes through the accessors on this type (see `access.rs`).
#[derive(Debug)]
pub struct Vcpu<B: CpuBus> {
    pub state: CpuState,
    pub pending: PendingEventState,
    pub bus: B,
    /// Sticky exit status (triple fault) observed during execution.
    pub exit: Option<CpuExit>,
    pub(crate) fetch_cache: FetchCache,
    pub(crate) insn_pages: InsnPages,
}

impl<B: CpuBus> Vcpu<B> {
    pub fn new(config: CpuConfig, bus: B) -> Self {
        let mut vcpu = Self {
            state: CpuState::new(config),
            pending: PendingEventState::default(),
            bus,
            exit: None,
            fetch_cache: FetchCache::default(),
            insn_pages: InsnPages::default(),
        };
        vcpu.sync_control();
        vcpu
    }

    /// Push CR0/CR3/CR4 to the bus's MMU and drop cached fetch translations.
    pub fn sync_control(&mut self) {
        self.fetch_cache.valid = false;
        self.bus.sync_control(
            self.state.cr0.bits(),
            self.state.cr3,
            self.state.cr4.bits(),
        );
    }

    /// Power-on reset: clears the register file and every pending event.
    pub fn reset(&mut self) {
        self.state.reset();
        self.pending = PendingEventState::default();
        self.exit = None;
        self.bus.flush_tlb();
        self.sync_control();
    }

    /// Pages the most recently fetched instruction came from.
    #[inline]
    pub fn insn_pages(&self) -> &InsnPages {
        &self.insn_pages
    }

    #[inline]
    pub(crate) fn invalidate_fetch(&mut self) {
        self.fetch_cache.valid = false;
    }
}
