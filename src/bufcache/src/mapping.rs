//! Address spaces: the per-owner set of pages keyed by index, with the
//! `Dirty` and `Writeback` tag sets writeback walks instead of the whole
//! tree. One mutex (the tree lock) covers pages and tags together so a tag
//! can never name state the tree disagrees with. The separate `private_lock`
//! serializes ring attach/detach and associated-buffer list moves.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::CacheError;
use crate::inode::Inode;
use crate::page::Page;

const AS_EIO: u32 = 1 << 0;
const AS_ENOSPC: u32 = 1 << 1;

struct PageTree {
    pages: BTreeMap<u64, Arc<Page>>,
    dirty: BTreeSet<u64>,
    writeback: BTreeSet<u64>,
}

pub struct Mapping {
    page_size: usize,
    block_size: AtomicUsize,
    tree: Mutex<PageTree>,
    flags: AtomicU32,
    pub(crate) private_lock: Mutex<()>,
    nr_dirty: AtomicU64,
    pub(crate) writeback_index: AtomicU64,
    owner: OnceCell<Weak<Inode>>,
}

impl Mapping {
    pub(crate) fn new(page_size: usize, block_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            block_size: AtomicUsize::new(block_size),
            tree: Mutex::new(PageTree {
                pages: BTreeMap::new(),
                dirty: BTreeSet::new(),
                writeback: BTreeSet::new(),
            }),
            flags: AtomicU32::new(0),
            private_lock: Mutex::new(()),
            nr_dirty: AtomicU64::new(0),
            writeback_index: AtomicU64::new(0),
            owner: OnceCell::new(),
        }
    }

    pub(crate) fn set_owner(&self, inode: Weak<Inode>) {
        let _ = self.owner.set(inode);
    }

    pub fn owner(&self) -> Option<Arc<Inode>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_block_size(&self, size: usize) {
        self.block_size.store(size, Ordering::Release);
    }

    /// log2(blocks per page) for the given block size.
    pub(crate) fn size_bits(&self, block_size: usize) -> u32 {
        (self.page_size / block_size).trailing_zeros()
    }

    // --- pages ---

    pub fn page_at(&self, index: u64) -> Option<Arc<Page>> {
        self.tree.lock().pages.get(&index).cloned()
    }

    pub fn nr_pages(&self) -> usize {
        self.tree.lock().pages.len()
    }

    /// Returns the page at `index`, creating it if absent, locked either
    /// way.
    pub fn find_or_create_page(self: &Arc<Self>, index: u64) -> Arc<Page> {
        loop {
            let page = {
                let mut tree = self.tree.lock();
                tree.pages
                    .entry(index)
                    .or_insert_with(|| {
                        Arc::new(Page::new(Arc::downgrade(self), index, self.page_size))
                    })
                    .clone()
            };
            page.lock();
            // The page may have been dropped from the tree while we slept on
            // its lock; only a page still installed counts.
            match self.page_at(index) {
                Some(current) if Arc::ptr_eq(&current, &page) => return page,
                _ => page.unlock(),
            }
        }
    }

    /// Drops `page` from the tree if it is still the installed page.
    pub(crate) fn remove_page(&self, page: &Arc<Page>) {
        let mut tree = self.tree.lock();
        if tree
            .pages
            .get(&page.index())
            .is_some_and(|p| Arc::ptr_eq(p, page))
        {
            tree.pages.remove(&page.index());
            tree.dirty.remove(&page.index());
            tree.writeback.remove(&page.index());
        }
    }

    pub(crate) fn pages_snapshot(&self) -> Vec<Arc<Page>> {
        self.tree.lock().pages.values().cloned().collect()
    }

    // --- tags ---

    pub(crate) fn tag_dirty(&self, index: u64) {
        self.tree.lock().dirty.insert(index);
    }

    pub(crate) fn clear_dirty_tag(&self, index: u64) {
        self.tree.lock().dirty.remove(&index);
    }

    pub fn has_dirty_tags(&self) -> bool {
        !self.tree.lock().dirty.is_empty()
    }

    /// Up to `max` pages tagged dirty with index in `[start, end]`, in index
    /// order. Stale tags whose page vanished are dropped on the way.
    pub(crate) fn dirty_tagged(&self, start: u64, end: u64, max: usize) -> Vec<Arc<Page>> {
        if start > end {
            return Vec::new();
        }
        let mut tree = self.tree.lock();
        let indices: Vec<u64> = tree
            .dirty
            .range(start..=end)
            .take(max)
            .copied()
            .collect();
        let mut out = Vec::with_capacity(indices.len());
        for index in indices {
            match tree.pages.get(&index) {
                Some(page) => out.push(page.clone()),
                None => {
                    tree.dirty.remove(&index);
                }
            }
        }
        out
    }

    pub(crate) fn tag_writeback(&self, index: u64) {
        self.tree.lock().writeback.insert(index);
    }

    pub(crate) fn clear_writeback_tag(&self, index: u64) {
        self.tree.lock().writeback.remove(&index);
    }

    pub fn has_writeback_tags(&self) -> bool {
        !self.tree.lock().writeback.is_empty()
    }

    pub(crate) fn writeback_tagged(&self) -> Vec<Arc<Page>> {
        let tree = self.tree.lock();
        tree.writeback
            .iter()
            .filter_map(|index| tree.pages.get(index).cloned())
            .collect()
    }

    // --- dirty accounting ---

    pub fn nr_dirty(&self) -> u64 {
        self.nr_dirty.load(Ordering::Acquire)
    }

    pub(crate) fn add_dirty(&self) {
        self.nr_dirty.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_dirty(&self) {
        self.nr_dirty.fetch_sub(1, Ordering::AcqRel);
    }

    // --- error flags ---

    pub(crate) fn set_error(&self, err: CacheError) {
        let bit = match err {
            CacheError::NoSpace => AS_ENOSPC,
            _ => AS_EIO,
        };
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn has_error(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }

    /// Test-and-clear the recorded error, no-space first.
    pub fn take_error(&self) -> Result<(), CacheError> {
        if self.flags.fetch_and(!AS_ENOSPC, Ordering::AcqRel) & AS_ENOSPC != 0 {
            return Err(CacheError::NoSpace);
        }
        if self.flags.fetch_and(!AS_EIO, Ordering::AcqRel) & AS_EIO != 0 {
            return Err(CacheError::Io);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree.lock();
        f.debug_struct("Mapping")
            .field("pages", &tree.pages.len())
            .field("dirty_tags", &tree.dirty.len())
            .field("writeback_tags", &tree.writeback.len())
            .field("nr_dirty", &self.nr_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> Arc<Mapping> {
        Arc::new(Mapping::new(4096, 1024))
    }

    #[test]
    fn find_or_create_returns_locked_page() {
        let mapping = mapping();
        let page = mapping.find_or_create_page(3);
        assert!(page.is_locked());
        assert_eq!(page.index(), 3);
        page.unlock();

        let again = mapping.find_or_create_page(3);
        assert!(Arc::ptr_eq(&again, &page));
        again.unlock();
        assert_eq!(mapping.nr_pages(), 1);
    }

    #[test]
    fn removed_page_is_not_returned() {
        let mapping = mapping();
        let page = mapping.find_or_create_page(1);
        page.unlock();
        mapping.remove_page(&page);
        assert!(mapping.page_at(1).is_none());

        let fresh = mapping.find_or_create_page(1);
        assert!(!Arc::ptr_eq(&fresh, &page));
        fresh.unlock();
    }

    #[test]
    fn dirty_tags_track_range_and_staleness() {
        let mapping = mapping();
        for index in [1u64, 4, 9] {
            let page = mapping.find_or_create_page(index);
            page.unlock();
            mapping.tag_dirty(index);
        }
        // Stale tag with no page behind it.
        mapping.tag_dirty(7);

        let tagged = mapping.dirty_tagged(0, u64::MAX, 16);
        let indices: Vec<u64> = tagged.iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![1, 4, 9]);

        let bounded = mapping.dirty_tagged(2, 8, 16);
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].index(), 4);
    }

    #[test]
    fn error_flags_are_take_once() {
        let mapping = mapping();
        assert!(mapping.take_error().is_ok());
        mapping.set_error(CacheError::Io);
        assert_eq!(mapping.take_error(), Err(CacheError::Io));
        assert!(mapping.take_error().is_ok());

        mapping.set_error(CacheError::NoSpace);
        mapping.set_error(CacheError::Io);
        assert_eq!(mapping.take_error(), Err(CacheError::NoSpace));
        assert_eq!(mapping.take_error(), Err(CacheError::Io));
    }

    #[test]
    fn size_bits_match_block_ratio() {
        let mapping = mapping();
        assert_eq!(mapping.size_bits(1024), 2);
        assert_eq!(mapping.size_bits(4096), 0);
        assert_eq!(mapping.size_bits(512), 3);
    }
}
