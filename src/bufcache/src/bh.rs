//! Block handles: one per device block, attached to the page covering it.
//!
//! A handle's state is a word of atomic bits. `LOCKED` is a sleepable
//! bit-lock; `UPTODATE_LOCK` on a page's *first* handle is a bit-spin-lock
//! that serializes completion bookkeeping across the page's siblings. The
//! handles covering one page form the ring: stored here as an offset-ordered
//! vector inside the page, the arena form of the circular list. "Next in
//! ring" is the next vector slot, wrapping.
//!
//! Reference counting is explicit and protocol-level: the ring's own entry
//! is not counted, each LRU slot counts one, and each caller-visible
//! [`BufferRef`] counts one. A handle with zero references that is clean and
//! unlocked may be torn down with its page. Memory safety is `Arc`'s
//! business, not the refcount's.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use parking_lot::Mutex;

use crate::device::BlockDev;
use crate::error::CacheError;
use crate::mapping::Mapping;
use crate::page::{Page, PageFlags};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct BhState: u64 {
        const UPTODATE = 1 << 0;
        const DIRTY = 1 << 1;
        const LOCKED = 1 << 2;
        /// I/O has been submitted at least once.
        const REQ = 1 << 3;
        /// Bit-spin-lock taken on the first handle of a page while
        /// coalescing sibling completions.
        const UPTODATE_LOCK = 1 << 4;
        /// Has a disk address.
        const MAPPED = 1 << 5;
        /// Freshly allocated by the filesystem; caller must zero it.
        const NEW = 1 << 6;
        const ASYNC_READ = 1 << 7;
        const ASYNC_WRITE = 1 << 8;
        /// Delayed allocation: dirty data with no disk address yet.
        const DELAY = 1 << 9;
        /// Last block of an extent run; hint to flush the current request.
        const BOUNDARY = 1 << 10;
        const WRITE_IO_ERROR = 1 << 11;
        const UNWRITTEN = 1 << 12;
        /// Suppresses repeated I/O error logging for this handle.
        const QUIET = 1 << 13;
    }
}

/// Completion callback; `true` means the transfer succeeded.
pub type EndIo = Arc<dyn Fn(&Arc<BufferHead>, bool) + Send + Sync>;

pub struct BufferHead {
    pub(crate) state: AtomicU64,
    refs: AtomicUsize,
    size: usize,
    offset: usize,
    block: AtomicU64,
    last_access: AtomicU64,
    dev: ArcSwapOption<BlockDev>,
    page: Weak<Page>,
    end_io: Mutex<Option<EndIo>>,
    /// Set while the handle sits on an inode's associated list; names the
    /// backing (device) mapping that sourced it.
    assoc_map: ArcSwapOption<Mapping>,
    /// Opaque caller slot.
    private: Mutex<Option<Box<dyn Any + Send>>>,
}

impl BufferHead {
    pub(crate) fn new(page: &Arc<Page>, offset: usize, size: usize, state: BhState) -> Self {
        Self {
            state: AtomicU64::new(state.bits()),
            refs: AtomicUsize::new(0),
            size,
            offset,
            block: AtomicU64::new(0),
            last_access: AtomicU64::new(0),
            dev: ArcSwapOption::empty(),
            page: Arc::downgrade(page),
            end_io: Mutex::new(None),
            assoc_map: ArcSwapOption::empty(),
            private: Mutex::new(None),
        }
    }

    /// A handle not attached to any page, used to probe the block mapper.
    pub(crate) fn scratch(size: usize) -> Self {
        Self {
            state: AtomicU64::new(0),
            refs: AtomicUsize::new(0),
            size,
            offset: 0,
            block: AtomicU64::new(0),
            last_access: AtomicU64::new(0),
            dev: ArcSwapOption::empty(),
            page: Weak::new(),
            end_io: Mutex::new(None),
            assoc_map: ArcSwapOption::empty(),
            private: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset_in_page(&self) -> usize {
        self.offset
    }

    pub fn block(&self) -> u64 {
        self.block.load(Ordering::Acquire)
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::Release);
    }

    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.upgrade()
    }

    pub fn dev(&self) -> Option<Arc<BlockDev>> {
        self.dev.load_full()
    }

    pub fn set_dev(&self, dev: Option<Arc<BlockDev>>) {
        self.dev.store(dev);
    }

    pub(crate) fn assoc_mapping(&self) -> Option<Arc<Mapping>> {
        self.assoc_map.load_full()
    }

    pub(crate) fn set_assoc_mapping(&self, mapping: Option<Arc<Mapping>>) {
        self.assoc_map.store(mapping);
    }

    pub fn set_private(&self, value: Option<Box<dyn Any + Send>>) {
        *self.private.lock() = value;
    }

    pub fn take_private(&self) -> Option<Box<dyn Any + Send>> {
        self.private.lock().take()
    }

    pub(crate) fn touch(&self) {
        self.last_access.store(crate::clock::now_ms(), Ordering::Relaxed);
    }

    // --- state bits ---

    pub fn state(&self) -> BhState {
        BhState::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    pub fn is(&self, mask: BhState) -> bool {
        self.state.load(Ordering::Acquire) & mask.bits() != 0
    }

    /// Test-and-set; returns the previous value of the bits.
    pub(crate) fn set_bits(&self, mask: BhState) -> bool {
        self.state.fetch_or(mask.bits(), Ordering::AcqRel) & mask.bits() != 0
    }

    /// Test-and-clear; returns the previous value of the bits.
    pub(crate) fn clear_bits(&self, mask: BhState) -> bool {
        self.state.fetch_and(!mask.bits(), Ordering::AcqRel) & mask.bits() != 0
    }

    pub fn is_uptodate(&self) -> bool {
        self.is(BhState::UPTODATE)
    }

    pub fn is_dirty(&self) -> bool {
        self.is(BhState::DIRTY)
    }

    pub fn is_locked(&self) -> bool {
        self.is(BhState::LOCKED)
    }

    pub fn is_mapped(&self) -> bool {
        self.is(BhState::MAPPED)
    }

    pub fn is_new(&self) -> bool {
        self.is(BhState::NEW)
    }

    pub fn set_uptodate(&self) {
        self.set_bits(BhState::UPTODATE);
    }

    pub(crate) fn clear_uptodate(&self) {
        self.clear_bits(BhState::UPTODATE);
    }

    /// Mapper-facing: the handle now has a disk address.
    pub fn set_mapped(&self) {
        self.set_bits(BhState::MAPPED);
    }

    /// Mapper-facing: freshly allocated block; the caller must zero it.
    pub fn set_new(&self) {
        self.set_bits(BhState::NEW);
    }

    /// Mapper-facing: last block of an extent run.
    pub fn set_boundary(&self) {
        self.set_bits(BhState::BOUNDARY);
    }

    /// Mapper-facing: delayed allocation, no disk address yet.
    pub fn set_delay(&self) {
        self.set_bits(BhState::DELAY);
    }

    /// Mapper-facing: allocated but unwritten extent.
    pub fn set_unwritten(&self) {
        self.set_bits(BhState::UNWRITTEN);
    }

    pub(crate) fn test_clear_dirty(&self) -> bool {
        self.clear_bits(BhState::DIRTY)
    }

    // --- the sleepable bit-lock ---

    pub fn lock(&self) {
        let dev = self.dev();
        bitwait::lock_bit_with(&self.state, BhState::LOCKED.bits(), || {
            // Kick the queue so whatever holds the lock can complete.
            if let Some(dev) = &dev {
                dev.disk().kick();
            }
        });
    }

    pub fn try_lock(&self) -> bool {
        bitwait::try_lock_bit(&self.state, BhState::LOCKED.bits())
    }

    pub fn unlock(&self) {
        debug_assert!(self.is_locked());
        bitwait::unlock_bit(&self.state, BhState::LOCKED.bits());
    }

    /// Sleeps until the handle is unlocked (I/O finished).
    pub fn wait_on(&self) {
        let dev = self.dev();
        bitwait::wait_on_bit_with(&self.state, BhState::LOCKED.bits(), || {
            if let Some(dev) = &dev {
                dev.disk().kick();
            }
        });
    }

    // --- references ---

    pub fn refcount(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn get_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dropping a reference that was never taken");
    }

    // --- completion slot ---

    pub(crate) fn set_end_io(&self, end_io: EndIo) {
        *self.end_io.lock() = Some(end_io);
    }

    pub(crate) fn take_end_io(&self) -> Option<EndIo> {
        self.end_io.lock().take()
    }
}

impl std::fmt::Debug for BufferHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHead")
            .field("block", &self.block())
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("state", &self.state())
            .field("refs", &self.refcount())
            .finish()
    }
}

/// Counted handle to a [`BufferHead`]. Cloning takes another reference;
/// dropping releases it.
pub struct BufferRef {
    bh: Arc<BufferHead>,
}

impl BufferRef {
    /// Wraps a handle whose reference was already taken by the caller.
    pub(crate) fn adopt(bh: Arc<BufferHead>) -> Self {
        Self { bh }
    }

    pub(crate) fn acquire(bh: &Arc<BufferHead>) -> Self {
        bh.get_ref();
        Self { bh: bh.clone() }
    }

    pub fn inner(&self) -> &Arc<BufferHead> {
        &self.bh
    }
}

impl std::ops::Deref for BufferRef {
    type Target = BufferHead;

    fn deref(&self) -> &BufferHead {
        &self.bh
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        Self::acquire(&self.bh)
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        self.bh.put_ref();
    }
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.bh.fmt(f)
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bh, &other.bh)
    }
}

impl Eq for BufferRef {}

/// Allocates one handle per block and attaches the ring to the page. Page
/// `Uptodate`/`Dirty` propagate into the fresh handles on top of `seed`.
///
/// The caller holds the page lock (or is attaching during grow under the
/// mapping's private lock); if a ring appeared concurrently the new one is
/// discarded.
pub(crate) fn attach_ring(page: &Arc<Page>, block_size: usize, seed: BhState) {
    debug_assert!(page.size() % block_size == 0 && block_size <= page.size());

    let mut state = seed;
    if page.is_uptodate() {
        state |= BhState::UPTODATE;
    }
    if page.is_dirty() {
        state |= BhState::DIRTY;
    }

    let count = page.size() / block_size;
    let ring: Vec<Arc<BufferHead>> = (0..count)
        .map(|i| Arc::new(BufferHead::new(page, i * block_size, block_size, state)))
        .collect();

    let mut guard = page.buffers_lock();
    if guard.is_some() {
        return;
    }
    debug_assert!(ring_tiles_page(&ring, page.size()));
    *guard = Some(ring);
    page.set(PageFlags::PRIVATE);
}

/// Detaches the ring if every handle is clean, unlocked, and unreferenced.
/// Returns the ring for the caller to drop. The caller holds the mapping's
/// private lock.
pub(crate) fn try_release(page: &Page) -> Result<Vec<Arc<BufferHead>>, CacheError> {
    let mut guard = page.buffers_lock();
    let Some(ring) = guard.as_ref() else {
        return Ok(Vec::new());
    };
    for bh in ring {
        if bh.refcount() != 0 || bh.is(BhState::DIRTY | BhState::LOCKED) {
            return Err(CacheError::Busy);
        }
    }
    let ring = guard.take().expect("ring vanished under its own lock");
    page.clear(PageFlags::PRIVATE);
    Ok(ring)
}

/// Public form of ring attachment, for filesystems that manage pages
/// directly. The caller holds the page lock.
pub fn attach_buffers_to_page(page: &Arc<Page>, block_size: usize, state: BhState) {
    assert!(page.is_locked(), "attaching buffers to an unlocked page");
    attach_ring(page, block_size, state);
}

/// Tears the page's ring down if every handle is clean, unlocked, and
/// unreferenced. This is the reclaim hook: a page for which this succeeds
/// carries no cache state and may be dropped.
pub fn try_release_page(page: &Arc<Page>) -> Result<(), CacheError> {
    match page.mapping() {
        Some(mapping) => {
            let _private = mapping.private_lock.lock();
            try_release(page).map(drop)
        }
        None => try_release(page).map(drop),
    }
}

fn ring_tiles_page(ring: &[Arc<BufferHead>], page_size: usize) -> bool {
    let mut expected = 0;
    for bh in ring {
        if bh.offset_in_page() != expected {
            return false;
        }
        expected += bh.size();
    }
    expected == page_size
}
