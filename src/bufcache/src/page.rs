//! Page-cache pages: fixed power-of-two byte containers keyed by
//! `(mapping, index)`, carrying their state as bits of one atomic word.
//!
//! `LOCKED` and `WRITEBACK` double as sleep-waitable bits. The payload sits
//! behind a short-held mutex that is never held across device I/O: reads
//! copy in at completion, writes snapshot at submission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::bh::BufferHead;
use crate::mapping::Mapping;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const LOCKED = 1 << 0;
        const UPTODATE = 1 << 1;
        const DIRTY = 1 << 2;
        const WRITEBACK = 1 << 3;
        const ERROR = 1 << 4;
        const MAPPED_TO_DISK = 1 << 5;
        const PRIVATE = 1 << 6;
    }
}

/// A ring snapshot; at most page_size / 512 entries.
pub type RingSnapshot = SmallVec<[Arc<BufferHead>; 8]>;

pub struct Page {
    index: u64,
    size: usize,
    flags: AtomicU64,
    data: Mutex<Box<[u8]>>,
    buffers: Mutex<Option<Vec<Arc<BufferHead>>>>,
    mapping: Weak<Mapping>,
}

impl Page {
    pub(crate) fn new(mapping: Weak<Mapping>, index: u64, size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            index,
            size,
            flags: AtomicU64::new(0),
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
            buffers: Mutex::new(None),
            mapping,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mapping(&self) -> Option<Arc<Mapping>> {
        self.mapping.upgrade()
    }

    // --- flag word ---

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn is(&self, mask: PageFlags) -> bool {
        self.flags.load(Ordering::Acquire) & mask.bits() != 0
    }

    pub(crate) fn set(&self, mask: PageFlags) -> bool {
        self.flags.fetch_or(mask.bits(), Ordering::AcqRel) & mask.bits() != 0
    }

    pub(crate) fn clear(&self, mask: PageFlags) -> bool {
        self.flags.fetch_and(!mask.bits(), Ordering::AcqRel) & mask.bits() != 0
    }

    pub fn is_uptodate(&self) -> bool {
        self.is(PageFlags::UPTODATE)
    }

    pub fn is_dirty(&self) -> bool {
        self.is(PageFlags::DIRTY)
    }

    pub fn is_writeback(&self) -> bool {
        self.is(PageFlags::WRITEBACK)
    }

    pub fn is_locked(&self) -> bool {
        self.is(PageFlags::LOCKED)
    }

    pub fn is_error(&self) -> bool {
        self.is(PageFlags::ERROR)
    }

    pub(crate) fn set_uptodate(&self) {
        self.set(PageFlags::UPTODATE);
    }

    pub(crate) fn set_error(&self) {
        self.set(PageFlags::ERROR);
    }

    pub(crate) fn set_mapped_to_disk(&self) {
        self.set(PageFlags::MAPPED_TO_DISK);
    }

    // --- locking ---

    pub fn lock(&self) {
        bitwait::lock_bit(&self.flags, PageFlags::LOCKED.bits());
    }

    pub fn try_lock(&self) -> bool {
        bitwait::try_lock_bit(&self.flags, PageFlags::LOCKED.bits())
    }

    pub fn unlock(&self) {
        bitwait::unlock_bit(&self.flags, PageFlags::LOCKED.bits());
    }

    /// Sleeps until any write I/O on this page has completed. `relax` runs
    /// before each sleep; pass the backing disk's kick.
    pub fn wait_writeback_with(&self, relax: impl FnMut()) {
        bitwait::wait_on_bit_with(&self.flags, PageFlags::WRITEBACK.bits(), relax);
    }

    pub(crate) fn wake_writeback_waiters(&self) {
        bitwait::wake_bit(&self.flags, PageFlags::WRITEBACK.bits());
    }

    // --- payload ---

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }

    pub fn copy_out(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock()[offset..offset + len].to_vec()
    }

    pub fn copy_in(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn zero_range(&self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.size);
        self.data.lock()[start..end].fill(0);
    }

    // --- buffer ring ---

    pub fn has_buffers(&self) -> bool {
        self.is(PageFlags::PRIVATE)
    }

    /// Clones the ring out so callers can walk or sleep per buffer without
    /// holding the ring lock.
    pub fn ring_snapshot(&self) -> Option<RingSnapshot> {
        self.buffers
            .lock()
            .as_ref()
            .map(|ring| ring.iter().cloned().collect())
    }

    pub fn first_buffer(&self) -> Option<Arc<BufferHead>> {
        self.buffers.lock().as_ref().and_then(|r| r.first().cloned())
    }

    /// Direct ring access for attach/detach/scan. Never sleep while holding
    /// this guard: completions take it to snapshot.
    pub(crate) fn buffers_lock(&self) -> MutexGuard<'_, Option<Vec<Arc<BufferHead>>>> {
        self.buffers.lock()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("flags", &self.flags())
            .field("has_buffers", &self.has_buffers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use super::*;

    fn page() -> Arc<Page> {
        Arc::new(Page::new(Weak::new(), 0, 4096))
    }

    #[test]
    fn lock_excludes_and_wakes() {
        let page = page();
        let barrier = Barrier::new(2);

        page.lock();
        std::thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                page.lock();
                page.unlock();
            });
            barrier.wait();
            std::thread::sleep(Duration::from_millis(20));
            page.unlock();
        });
        assert!(!page.is_locked());
    }

    #[test]
    fn data_roundtrip_and_zero() {
        let page = page();
        page.copy_in(100, &[3u8; 50]);
        assert_eq!(page.copy_out(100, 50), vec![3u8; 50]);
        page.zero_range(110, 120);
        let data = page.copy_out(100, 50);
        assert!(data[..10].iter().all(|&b| b == 3));
        assert!(data[10..20].iter().all(|&b| b == 0));
        assert!(data[20..].iter().all(|&b| b == 3));
    }

    #[test]
    fn flag_transitions_report_previous() {
        let page = page();
        assert!(!page.set(PageFlags::DIRTY));
        assert!(page.set(PageFlags::DIRTY));
        assert!(page.clear(PageFlags::DIRTY));
        assert!(!page.clear(PageFlags::DIRTY));
    }
}
