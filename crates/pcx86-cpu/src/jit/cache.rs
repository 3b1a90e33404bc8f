//! Hash-indexed store of compiled blocks.
//!
//! Blocks are keyed by their entry point and the decode context they were
//! translated under. Each hash bucket holds a bounded collision chain and the
//! cache as a whole is capped; when either limit is hit the block that was
//! least recently validated is evicted. Every resident block is registered
//! with the [`CodePageTracker`] for the physical pages its bytes came from, so
//! a guest write to one of those pages can find and drop it.

use tracing::trace;

use crate::code_pages::CodePageTracker;

use super::JitConfig;

/// Execution mode a block was translated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockMode {
    Real,
    Protected,
    Vm86,
}

/// Identity of a translation: where it starts and the context that decides
/// how its bytes decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub cs_base: u32,
    pub eip: u32,
    pub code32: bool,
    pub cpl: u8,
    pub mode: BlockMode,
}

impl BlockKey {
    #[inline]
    pub fn linear(&self) -> u32 {
        self.cs_base.wrapping_add(self.eip)
    }

    #[inline]
    fn hash_index(&self, mask: usize) -> usize {
        let l = self.linear();
        let h = l ^ (l >> 11) ^ (u32::from(self.code32) << 5) ^ u32::from(self.cpl);
        (h as usize) & mask
    }
}

/// A code page a block was translated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageDep {
    pub linear_page: u32,
    pub phys_page: u32,
    /// Tracker version of the page when the bytes were read.
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub key: BlockKey,
    pub pages: Vec<PageDep>,
    /// Guest instructions the compiled code covers.
    pub insn_count: u32,
    pub byte_len: u32,
}

#[derive(Debug)]
pub struct CachedBlock<C> {
    pub meta: BlockMeta,
    pub code: C,
    last_used: u64,
}

#[derive(Debug)]
pub struct BlockCache<C> {
    buckets: Vec<Vec<CachedBlock<C>>>,
    mask: usize,
    chain_len: usize,
    max_blocks: usize,
    len: usize,
    clock: u64,
}

impl<C> BlockCache<C> {
    pub fn new(config: &JitConfig) -> Self {
        let buckets = config.cache_buckets.max(1).next_power_of_two();
        Self {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            mask: buckets - 1,
            chain_len: config.chain_len.max(1),
            max_blocks: config.cache_max_blocks.max(1),
            len: 0,
            clock: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.buckets[key.hash_index(self.mask)]
            .iter()
            .any(|b| b.meta.key == *key)
    }

    /// Find a block without touching its LRU stamp.
    pub fn peek(&self, key: &BlockKey) -> Option<&CachedBlock<C>> {
        self.buckets[key.hash_index(self.mask)]
            .iter()
            .find(|b| b.meta.key == *key)
    }

    /// Mark a block as just validated.
    pub fn touch(&mut self, key: &BlockKey) {
        self.clock += 1;
        let now = self.clock;
        if let Some(b) = self.buckets[key.hash_index(self.mask)]
            .iter_mut()
            .find(|b| b.meta.key == *key)
        {
            b.last_used = now;
        }
    }

    /// Insert or replace a block. Returns how many blocks were evicted to
    /// make room.
    pub fn insert(&mut self, meta: BlockMeta, code: C, tracker: &mut CodePageTracker) -> usize {
        let key = meta.key;
        self.remove(&key, tracker);

        let mut evicted = 0;
        let idx = key.hash_index(self.mask);
        if self.buckets[idx].len() >= self.chain_len {
            if let Some(pos) = lru_position(&self.buckets[idx]) {
                self.evict_at(idx, pos, tracker);
                evicted += 1;
            }
        }
        while self.len >= self.max_blocks {
            let victim = self
                .buckets
                .iter()
                .enumerate()
                .filter_map(|(i, chain)| lru_position(chain).map(|p| (i, p, chain[p].last_used)))
                .min_by_key(|&(_, _, stamp)| stamp);
            match victim {
                Some((i, p, _)) => {
                    self.evict_at(i, p, tracker);
                    evicted += 1;
                }
                None => break,
            }
        }

        for dep in &meta.pages {
            tracker.add_block(dep.phys_page);
        }
        self.clock += 1;
        self.buckets[idx].push(CachedBlock {
            meta,
            code,
            last_used: self.clock,
        });
        self.len += 1;
        evicted
    }

    fn evict_at(&mut self, bucket: usize, pos: usize, tracker: &mut CodePageTracker) {
        let block = self.buckets[bucket].swap_remove(pos);
        trace!(eip = block.meta.key.eip, cs_base = block.meta.key.cs_base, "evicting block");
        self.release(&block.meta, tracker);
    }

    fn release(&mut self, meta: &BlockMeta, tracker: &mut CodePageTracker) {
        for dep in &meta.pages {
            tracker.remove_block(dep.phys_page);
        }
        self.len -= 1;
    }

    pub fn remove(&mut self, key: &BlockKey, tracker: &mut CodePageTracker) -> bool {
        let idx = key.hash_index(self.mask);
        match self.buckets[idx].iter().position(|b| b.meta.key == *key) {
            Some(pos) => {
                let block = self.buckets[idx].swap_remove(pos);
                self.release(&block.meta, tracker);
                true
            }
            None => false,
        }
    }

    /// Drop every block translated from physical page `page`.
    pub fn invalidate_page(&mut self, page: u32, tracker: &mut CodePageTracker) -> usize {
        let mut removed = Vec::new();
        for chain in &mut self.buckets {
            let mut i = 0;
            while i < chain.len() {
                if chain[i].meta.pages.iter().any(|d| d.phys_page == page) {
                    removed.push(chain.swap_remove(i).meta);
                } else {
                    i += 1;
                }
            }
        }
        for meta in &removed {
            self.release(meta, tracker);
        }
        removed.len()
    }

    /// Drop everything.
    pub fn flush(&mut self, tracker: &mut CodePageTracker) {
        for chain in &mut self.buckets {
            chain.clear();
        }
        self.len = 0;
        tracker.clear();
    }
}

fn lru_position<C>(chain: &[CachedBlock<C>]) -> Option<usize> {
    chain
        .iter()
        .enumerate()
        .min_by_key(|(_, b)| b.last_used)
        .map(|(i, _)| i)
}
