//! Tracking of physical pages that back translated (or about to be translated)
//! guest code.
//!
//! Every guest memory write is reported to [`CodePageTracker::on_write`]. Writes
//! that land on a tracked page bump that page's version and queue the page so
//! the block cache can drop the translations that depend on it before the next
//! block is looked up.

use std::collections::HashMap;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PageState {
    version: u32,
    /// Number of resident compiled blocks covering this page.
    blocks: u32,
}

/// Page versions come from one tracker-wide counter, so a page that is
/// dropped and watched again never reuses a version a dependency recorded.
#[derive(Debug, Default, Clone)]
pub struct CodePageTracker {
    pages: HashMap<u32, PageState>,
    dirty: Vec<u32>,
    generation: u32,
    code_writes: u64,
}

impl CodePageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    fn entry(&mut self, page: u32) -> &mut PageState {
        let generation = &mut self.generation;
        self.pages.entry(page).or_insert_with(|| {
            *generation = generation.wrapping_add(1);
            PageState {
                version: *generation,
                blocks: 0,
            }
        })
    }

    /// Start watching a page (trace recording). Returns its current version.
    pub fn watch(&mut self, page: u32) -> u32 {
        self.entry(page).version
    }

    /// A compiled block now depends on `page`.
    pub fn add_block(&mut self, page: u32) {
        self.entry(page).blocks += 1;
    }

    /// A compiled block covering `page` was dropped. The page stops being
    /// tracked once nothing covers it and no invalidation is queued for it.
    pub fn remove_block(&mut self, page: u32) {
        let Some(p) = self.pages.get_mut(&page) else {
            return;
        };
        p.blocks = p.blocks.saturating_sub(1);
        if p.blocks == 0 && !self.dirty.contains(&page) {
            self.pages.remove(&page);
        }
    }

    /// Pages currently tracked.
    #[inline]
    pub fn tracked_pages(&self) -> usize {
        self.pages.len()
    }

    /// Current version of a page. Unwatched pages report 0.
    #[inline]
    pub fn version(&self, page: u32) -> u32 {
        self.pages.get(&page).map_or(0, |p| p.version)
    }

    /// Whether any resident compiled block covers `page`.
    #[inline]
    pub fn has_blocks(&self, page: u32) -> bool {
        self.pages.get(&page).is_some_and(|p| p.blocks != 0)
    }

    /// Record a guest write of `len` bytes at physical address `paddr`.
    pub fn on_write(&mut self, paddr: u32, len: usize) {
        if self.pages.is_empty() || len == 0 {
            return;
        }
        let first = paddr >> PAGE_SHIFT;
        let last = paddr.saturating_add(len as u32 - 1) >> PAGE_SHIFT;
        for page in first..=last {
            if !self.pages.contains_key(&page) {
                continue;
            }
            let version = self.next_version();
            if let Some(p) = self.pages.get_mut(&page) {
                p.version = version;
                self.code_writes += 1;
                if p.blocks != 0 && !self.dirty.contains(&page) {
                    self.dirty.push(page);
                }
            }
        }
    }

    /// Every tracked page changed at once (A20 toggle). Pages with compiled
    /// dependents are queued for invalidation.
    pub fn bump_all(&mut self) {
        for (&page, p) in self.pages.iter_mut() {
            self.generation = self.generation.wrapping_add(1);
            p.version = self.generation;
            if p.blocks != 0 && !self.dirty.contains(&page) {
                self.dirty.push(page);
            }
        }
    }

    /// Pages written since the last drain that still have compiled dependents.
    #[inline]
    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn take_dirty(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dirty)
    }

    /// Writes that hit a watched page since creation.
    #[inline]
    pub fn code_writes(&self) -> u64 {
        self.code_writes
    }

    /// Forget every page (block cache flush, A20 toggle).
    pub fn clear(&mut self) {
        self.pages.clear();
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_to_unwatched_pages_are_ignored() {
        let mut t = CodePageTracker::new();
        t.on_write(0x1000, 4);
        assert_eq!(t.version(1), 0);
        assert!(!t.has_dirty());
        assert_eq!(t.tracked_pages(), 0);
    }

    #[test]
    fn write_spanning_two_pages_bumps_both() {
        let mut t = CodePageTracker::new();
        let v1 = t.watch(1);
        let v2 = t.watch(2);
        t.add_block(2);
        t.on_write(0x1fff, 2);
        assert_ne!(t.version(1), v1);
        assert_ne!(t.version(2), v2);
        // Only pages with compiled dependents are queued.
        assert_eq!(t.take_dirty(), vec![2]);
        assert!(!t.has_dirty());
    }

    #[test]
    fn dirty_queue_is_deduplicated() {
        let mut t = CodePageTracker::new();
        t.add_block(5);
        t.on_write(5 << PAGE_SHIFT, 1);
        t.on_write((5 << PAGE_SHIFT) + 8, 4);
        assert_eq!(t.code_writes(), 2);
        assert_eq!(t.take_dirty(), vec![5]);
    }

    #[test]
    fn pages_are_dropped_when_their_last_block_goes() {
        let mut t = CodePageTracker::new();
        t.add_block(3);
        t.add_block(3);
        t.remove_block(3);
        assert!(t.has_blocks(3));
        t.remove_block(3);
        assert_eq!(t.tracked_pages(), 0);
        assert_eq!(t.version(3), 0);

        // A queued invalidation keeps the page until it is drained.
        t.add_block(4);
        t.on_write(4 << PAGE_SHIFT, 1);
        t.remove_block(4);
        assert_eq!(t.tracked_pages(), 1);
        t.clear();
        assert_eq!(t.tracked_pages(), 0);
    }

    #[test]
    fn rewatched_pages_never_reuse_a_version() {
        let mut t = CodePageTracker::new();
        let first = t.watch(7);
        t.add_block(7);
        t.remove_block(7);
        // Written while untracked, then watched again.
        t.on_write(7 << PAGE_SHIFT, 1);
        let second = t.watch(7);
        assert_ne!(first, second);
    }
}
