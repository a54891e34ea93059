//! Per-device writeback: the backing-device state, its worker thread, and
//! the sync entry points.
//!
//! Each backing device queues work items and owns three ordered inode
//! lists: `b_dirty` (newest first), `b_io` (selected for output), and
//! `b_more_io` (requeued for the next pass). The worker thread is spawned
//! on demand, drains the work queue, runs the periodic old-data pass on a
//! timer, and exits after a long idle stretch; the next enqueue respawns
//! it.
//!
//! Livelock bound: a writeback pass records its start time and skips any
//! inode dirtied after it, so a continuously redirtying writer cannot keep
//! one sync invocation running forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::clock::now_ms;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::inode::{Inode, InodeState, WbList};
use crate::superblock::SuperBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Opportunistic: never wait for I/O completion; enqueuers are
    /// acknowledged when the worker dequeues the item.
    None,
    /// Data integrity: wait for submitted I/O before signaling completion.
    All,
}

/// Parameters steering one writeback invocation.
#[derive(Debug)]
pub struct WritebackControl {
    pub sync_mode: SyncMode,
    /// Budget; decremented per page written.
    pub nr_to_write: i64,
    pub pages_skipped: u64,
    pub range_start: u64,
    pub range_end: u64,
    pub range_cyclic: bool,
    pub for_kupdate: bool,
    pub for_background: bool,
    pub for_reclaim: bool,
}

impl WritebackControl {
    pub fn new(sync_mode: SyncMode) -> Self {
        Self {
            sync_mode,
            nr_to_write: i64::MAX,
            pages_skipped: 0,
            range_start: 0,
            range_end: u64::MAX,
            range_cyclic: false,
            for_kupdate: false,
            for_background: false,
            for_reclaim: false,
        }
    }

    pub fn sync_all(&self) -> bool {
        self.sync_mode == SyncMode::All
    }
}

// === Work items === //

const WORK_USED: u64 = 1 << 0;

pub(crate) struct WorkSpec {
    pub sb: Option<Arc<SuperBlock>>,
    pub sync_mode: SyncMode,
    pub nr_pages: i64,
    pub for_kupdate: bool,
    pub for_background: bool,
    pub range_cyclic: bool,
}

pub(crate) struct WorkItem {
    spec: WorkSpec,
    state: AtomicU64,
}

impl WorkItem {
    fn new(spec: WorkSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            state: AtomicU64::new(WORK_USED),
        })
    }

    fn complete(&self) {
        self.state.fetch_and(!WORK_USED, Ordering::Release);
        bitwait::wake_bit(&self.state, WORK_USED);
    }

    fn wait_clear(&self) {
        bitwait::wait_on_bit(&self.state, WORK_USED);
    }
}

// === Backing device === //

struct WorkState {
    queue: VecDeque<Arc<WorkItem>>,
    worker_running: bool,
    background_queued: bool,
}

pub(crate) struct WbLists {
    pub b_dirty: VecDeque<Arc<Inode>>,
    pub b_io: VecDeque<Arc<Inode>>,
    pub b_more_io: VecDeque<Arc<Inode>>,
}

pub struct BackingDev {
    name: String,
    config: Arc<CacheConfig>,
    work: Mutex<WorkState>,
    work_cv: Condvar,
    pub(crate) lists: Mutex<WbLists>,
    nr_dirty_pages: AtomicU64,
    nr_writeback: AtomicU64,
    last_old_flush: AtomicU64,
}

impl BackingDev {
    pub(crate) fn new(name: String, config: Arc<CacheConfig>) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            work: Mutex::new(WorkState {
                queue: VecDeque::new(),
                worker_running: false,
                background_queued: false,
            }),
            work_cv: Condvar::new(),
            lists: Mutex::new(WbLists {
                b_dirty: VecDeque::new(),
                b_io: VecDeque::new(),
                b_more_io: VecDeque::new(),
            }),
            nr_dirty_pages: AtomicU64::new(0),
            nr_writeback: AtomicU64::new(0),
            last_old_flush: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nr_dirty_pages(&self) -> u64 {
        self.nr_dirty_pages.load(Ordering::Acquire)
    }

    pub fn nr_writeback_pages(&self) -> u64 {
        self.nr_writeback.load(Ordering::Acquire)
    }

    /// Writeback queued or in flight right now.
    pub fn writeback_in_progress(&self) -> bool {
        self.nr_writeback.load(Ordering::Acquire) > 0 || !self.work.lock().queue.is_empty()
    }

    pub(crate) fn add_dirty_page(self: &Arc<Self>) {
        let n = self.nr_dirty_pages.fetch_add(1, Ordering::AcqRel) + 1;
        if n >= self.config.writeback.background_dirty_pages {
            self.start_background();
        }
    }

    pub(crate) fn sub_dirty_page(&self) {
        self.nr_dirty_pages.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn add_writeback(&self) {
        self.nr_writeback.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_writeback(&self) {
        self.nr_writeback.fetch_sub(1, Ordering::AcqRel);
    }

    /// Queues background pressure work, at most one outstanding at a time.
    fn start_background(self: &Arc<Self>) {
        let item = WorkItem::new(WorkSpec {
            sb: None,
            sync_mode: SyncMode::None,
            nr_pages: i64::MAX,
            for_kupdate: false,
            for_background: true,
            range_cyclic: true,
        });
        let mut work = self.work.lock();
        if work.background_queued {
            return;
        }
        work.background_queued = true;
        work.queue.push_back(item);
        self.spawn_worker_locked(&mut work);
        drop(work);
        self.work_cv.notify_all();
    }

    pub(crate) fn queue_work(self: &Arc<Self>, spec: WorkSpec, wait: bool) {
        let item = WorkItem::new(spec);
        {
            let mut work = self.work.lock();
            work.queue.push_back(item.clone());
            self.spawn_worker_locked(&mut work);
        }
        self.work_cv.notify_all();
        if wait {
            item.wait_clear();
        }
    }

    /// Makes sure a worker exists and is awake, e.g. after an inode got
    /// dirtied and will need the periodic pass.
    pub(crate) fn ensure_worker(self: &Arc<Self>) {
        let mut work = self.work.lock();
        self.spawn_worker_locked(&mut work);
        drop(work);
        self.work_cv.notify_all();
    }

    fn spawn_worker_locked(self: &Arc<Self>, work: &mut WorkState) {
        if work.worker_running {
            return;
        }
        work.worker_running = true;
        WbWorker {
            bdi: self.clone(),
            last_activity: Instant::now(),
        }
        .run();
    }

    fn next_work(&self) -> Option<Arc<WorkItem>> {
        self.work.lock().queue.pop_front()
    }

    fn has_queued_inodes(&self) -> bool {
        let lists = self.lists.lock();
        !(lists.b_dirty.is_empty() && lists.b_io.is_empty() && lists.b_more_io.is_empty())
    }
}

impl std::fmt::Debug for BackingDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingDev")
            .field("name", &self.name)
            .field("nr_dirty_pages", &self.nr_dirty_pages())
            .finish_non_exhaustive()
    }
}

// === Global registry (for wakeup_flushers) === //

static BDI_REGISTRY: Lazy<Mutex<Vec<Weak<BackingDev>>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub(crate) fn register_bdi(bdi: &Arc<BackingDev>) {
    let mut registry = BDI_REGISTRY.lock();
    registry.retain(|w| w.strong_count() > 0);
    registry.push(Arc::downgrade(bdi));
}

/// Starts background writeback on every registered device that has dirty
/// pages.
pub fn wakeup_flushers(nr_pages: u64) {
    let targets: Vec<Arc<BackingDev>> = {
        let registry = BDI_REGISTRY.lock();
        registry.iter().filter_map(Weak::upgrade).collect()
    };
    for bdi in targets {
        if bdi.nr_dirty_pages() > 0 {
            start_writeback(&bdi, None, nr_pages.max(1));
        }
    }
}

// === The worker === //

struct WbWorker {
    bdi: Arc<BackingDev>,
    last_activity: Instant,
}

impl WbWorker {
    fn run(self) {
        let name = format!("wb-{}", self.bdi.name);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.work())
            .expect("spawning writeback worker");
    }

    fn work(mut self) {
        debug!(bdi = %self.bdi.name, "writeback worker started");
        loop {
            while let Some(item) = self.bdi.next_work() {
                self.process_item(&item);
                self.last_activity = Instant::now();
            }

            if self.maybe_kupdate() > 0 {
                self.last_activity = Instant::now();
            }

            let mut work = self.bdi.work.lock();
            if !work.queue.is_empty() {
                continue;
            }
            let timed_out = self
                .bdi
                .work_cv
                .wait_for(&mut work, self.bdi.config.writeback.dirty_writeback_interval)
                .timed_out();
            if timed_out
                && work.queue.is_empty()
                && !self.bdi.has_queued_inodes()
                && self.last_activity.elapsed() >= self.bdi.config.writeback.idle_exit
            {
                work.worker_running = false;
                break;
            }
        }
        debug!(bdi = %self.bdi.name, "writeback worker exiting");
    }

    fn process_item(&mut self, item: &Arc<WorkItem>) {
        // Opportunistic enqueuers only wait to know the item was seen, so
        // acknowledge before doing any I/O; integrity enqueuers wait for
        // the I/O itself.
        if item.spec.sync_mode == SyncMode::None {
            item.complete();
        }
        let pages = self.wb_writeback(&item.spec);
        if item.spec.sync_mode == SyncMode::All {
            item.complete();
        }
        if item.spec.for_background {
            self.bdi.work.lock().background_queued = false;
        }
        trace!(bdi = %self.bdi.name, pages, "work item processed");
    }

    /// The periodic pass: flush inodes whose dirtying is older than the
    /// expiry interval, at most once per writeback interval.
    fn maybe_kupdate(&mut self) -> u64 {
        let now = now_ms();
        let interval = self.bdi.config.writeback.dirty_writeback_interval.as_millis() as u64;
        if now < self.bdi.last_old_flush.load(Ordering::Acquire) + interval {
            return 0;
        }
        self.bdi.last_old_flush.store(now, Ordering::Release);
        self.wb_writeback(&WorkSpec {
            sb: None,
            sync_mode: SyncMode::None,
            nr_pages: i64::MAX,
            for_kupdate: true,
            for_background: false,
            range_cyclic: true,
        })
    }

    /// The writeback primitive: repeatedly select expired inodes into
    /// `b_io` and write them until the page budget is spent, the
    /// background threshold is reached, or there is nothing left to do.
    fn wb_writeback(&mut self, spec: &WorkSpec) -> u64 {
        let start = now_ms();
        let expire_ms = self.bdi.config.writeback.dirty_expire_interval.as_millis() as u64;
        let mut nr = spec.nr_pages;
        let mut total = 0u64;

        loop {
            if nr <= 0 {
                break;
            }
            if spec.for_background
                && self.bdi.nr_dirty_pages() < self.bdi.config.writeback.background_dirty_pages
            {
                break;
            }

            {
                let mut lists = self.bdi.lists.lock();
                if lists.b_io.is_empty() || !spec.for_kupdate {
                    let older_than = spec
                        .for_kupdate
                        .then(|| start.saturating_sub(expire_ms));
                    queue_io(&mut lists, older_than);
                }
                if lists.b_io.is_empty() {
                    break;
                }
            }

            let wrote = self.write_io_inodes(spec, start, &mut nr);
            total += wrote;
            if wrote == 0 {
                break;
            }
        }
        total
    }

    /// Writes inodes selected into `b_io`, oldest first. Stops at the
    /// livelock bound, when the budget is gone, or when the list empties.
    fn write_io_inodes(&mut self, spec: &WorkSpec, start: u64, nr: &mut i64) -> u64 {
        let mut wrote = 0u64;
        loop {
            let inode = {
                let mut lists = self.bdi.lists.lock();
                let inode = lists.b_io.pop_front();
                if let Some(inode) = &inode {
                    inode.set_wb_list(WbList::None);
                }
                inode
            };
            let Some(inode) = inode else { break };

            // Dirtied after this pass began: every older inode is done, so
            // stop rather than chase a moving target.
            if inode.dirtied_when.load(Ordering::Acquire) > start {
                redirty_tail_keep_when(&inode);
                break;
            }

            // A scoped work item only writes its own superblock.
            if let Some(target) = &spec.sb {
                match inode.sb() {
                    Some(sb) if Arc::ptr_eq(&sb, target) => {}
                    _ => {
                        redirty_tail(&inode);
                        continue;
                    }
                }
            }

            let Some(sb) = inode.sb() else {
                // Superblock is gone; the inode has nowhere to go.
                continue;
            };
            // Pin the superblock so unmount cannot free it mid-write. Data
            // integrity callers already hold the read side themselves.
            let _pin = if spec.sync_mode == SyncMode::None {
                match sb.pin() {
                    Some(guard) => Some(guard),
                    None => {
                        redirty_tail(&inode);
                        continue;
                    }
                }
            } else {
                None
            };

            let mut wbc = WritebackControl {
                sync_mode: spec.sync_mode,
                nr_to_write: self
                    .bdi
                    .config
                    .writeback
                    .max_writeback_pages
                    .min(i64::MAX as u64) as i64,
                pages_skipped: 0,
                range_start: 0,
                range_end: u64::MAX,
                range_cyclic: spec.range_cyclic,
                for_kupdate: spec.for_kupdate,
                for_background: spec.for_background,
                for_reclaim: false,
            };
            let budget = wbc.nr_to_write;
            let _ = writeback_single_inode(&inode, &mut wbc);
            let written = (budget - wbc.nr_to_write).max(0) as u64;
            wrote += written;
            *nr -= written as i64;
            if *nr <= 0 {
                break;
            }
        }
        wrote
    }
}

/// Moves expired inodes from `b_dirty` to `b_io` for processing, after
/// splicing in everything previously requeued to `b_more_io`. When the
/// selection spans several superblocks it is clustered so one pass works
/// through a single superblock at a time.
fn queue_io(lists: &mut WbLists, older_than: Option<u64>) {
    while let Some(inode) = lists.b_more_io.pop_front() {
        inode.set_wb_list(WbList::Io);
        lists.b_io.push_back(inode);
    }

    // b_dirty is newest-first, so the expired tail comes off the back.
    let mut expired: Vec<Arc<Inode>> = Vec::new();
    while let Some(candidate) = lists.b_dirty.back() {
        if let Some(threshold) = older_than {
            if candidate.dirtied_when.load(Ordering::Acquire) > threshold {
                break;
            }
        }
        expired.push(lists.b_dirty.pop_back().expect("back observed above"));
    }

    // Cluster by superblock, preserving relative age inside each cluster.
    while !expired.is_empty() {
        let key = expired[0].sb().map(|sb| Arc::as_ptr(&sb) as usize);
        let mut rest = Vec::new();
        for inode in expired {
            if inode.sb().map(|sb| Arc::as_ptr(&sb) as usize) == key {
                inode.set_wb_list(WbList::Io);
                lists.b_io.push_back(inode);
            } else {
                rest.push(inode);
            }
        }
        expired = rest;
    }
}

/// Livelock-safe redirty: stamp the inode as freshly dirtied and put it at
/// the newest end of `b_dirty`.
fn redirty_tail(inode: &Arc<Inode>) {
    inode.dirtied_when.store(now_ms(), Ordering::Release);
    redirty_tail_keep_when(inode);
}

fn redirty_tail_keep_when(inode: &Arc<Inode>) {
    let Some(bdi) = inode.bdi() else { return };
    let mut lists = bdi.lists.lock();
    remove_from_lists_locked(&mut lists, inode);
    inode.set_wb_list(WbList::Dirty);
    lists.b_dirty.push_front(inode.clone());
}

/// Requeue for another pass of the current invocation.
fn requeue_io(inode: &Arc<Inode>) {
    let Some(bdi) = inode.bdi() else { return };
    let mut lists = bdi.lists.lock();
    remove_from_lists_locked(&mut lists, inode);
    inode.set_wb_list(WbList::MoreIo);
    lists.b_more_io.push_back(inode.clone());
}

fn remove_from_lists_locked(lists: &mut WbLists, inode: &Arc<Inode>) {
    lists.b_dirty.retain(|i| !Arc::ptr_eq(i, inode));
    lists.b_io.retain(|i| !Arc::ptr_eq(i, inode));
    lists.b_more_io.retain(|i| !Arc::ptr_eq(i, inode));
}

// === Dirty inode queueing === //

/// Records dirtiness on the inode; on the clean-to-dirty transition the
/// inode is stamped and queued newest-first on its device's `b_dirty`, and
/// a worker is made sure to exist for the periodic pass.
pub fn mark_inode_dirty(inode: &Arc<Inode>, flags: InodeState) {
    let was = inode.set_state(flags & InodeState::DIRTY_ALL);
    if was.intersects(InodeState::DIRTY_ALL) {
        return;
    }
    if inode.is(InodeState::FREEING | InodeState::CLEAR) {
        return;
    }
    let Some(bdi) = inode.bdi() else { return };
    {
        let mut lists = bdi.lists.lock();
        if inode.wb_list() == WbList::None {
            inode.dirtied_when.store(now_ms(), Ordering::Release);
            inode.set_wb_list(WbList::Dirty);
            lists.b_dirty.push_front(inode.clone());
        }
    }
    bdi.ensure_worker();
}

// === Single-inode writeback === //

/// Writes one inode: its dirty pages, then (if the inode itself was dirty)
/// the inode through the filesystem's `write_inode`. `SYNC` excludes
/// concurrent writebacks of the same inode; integrity callers wait for it,
/// opportunistic callers requeue instead.
pub(crate) fn writeback_single_inode(
    inode: &Arc<Inode>,
    wbc: &mut WritebackControl,
) -> Result<(), CacheError> {
    let mut guard = inode.state_lock.lock();
    while inode.is(InodeState::SYNC) {
        if !wbc.sync_all() {
            drop(guard);
            requeue_io(inode);
            return Ok(());
        }
        drop(guard);
        inode.wait_sync();
        guard = inode.state_lock.lock();
    }
    let dirty = inode.state() & InodeState::DIRTY_ALL;
    inode.set_state(InodeState::SYNC);
    inode.clear_state(InodeState::DIRTY_ALL);
    drop(guard);

    let mut err = do_writepages(inode, wbc).err();

    if wbc.sync_all() {
        if let Err(e) = wait_on_writeback_pages(inode) {
            err.get_or_insert(e);
        }
    }

    if dirty.intersects(InodeState::DIRTY_SYNC | InodeState::DIRTY_DATASYNC) {
        if let Some(sb) = inode.sb() {
            if let Err(e) = sb.ops().write_inode(inode, wbc) {
                err.get_or_insert(e);
            }
        }
    }

    let guard = inode.state_lock.lock();
    inode.clear_state(InodeState::SYNC);
    if !inode.is(InodeState::FREEING | InodeState::CLEAR | InodeState::WILL_FREE) {
        if inode.mapping().has_dirty_tags() {
            if wbc.nr_to_write <= 0 {
                // Budget exhausted mid-inode: revisit in this invocation.
                inode.set_state(InodeState::DIRTY_PAGES);
                drop(guard);
                requeue_io(inode);
                finish_sync(inode);
                return pack(err);
            }
            // Pages were skipped or redirtied; treat as freshly dirty so
            // one sync cannot spin on this inode.
            inode.set_state(InodeState::DIRTY_PAGES);
            drop(guard);
            redirty_tail(inode);
            finish_sync(inode);
            return pack(err);
        }
        if inode.is_dirty() {
            // Redirtied while we wrote.
            drop(guard);
            redirty_tail(inode);
            finish_sync(inode);
            return pack(err);
        }
    }
    drop(guard);
    finish_sync(inode);
    pack(err)
}

fn finish_sync(inode: &Arc<Inode>) {
    inode.wake_sync_waiters();
}

fn pack(err: Option<CacheError>) -> Result<(), CacheError> {
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Public form of single-inode writeback: flush the inode's pages and, in
/// integrity mode, wait for them.
pub fn sync_inode(inode: &Arc<Inode>, wbc: &mut WritebackControl) -> Result<(), CacheError> {
    writeback_single_inode(inode, wbc)
}

// === Page iteration === //

/// Writes the mapping's dirty-tagged pages in index order through the
/// inode's `writepage`, honoring the budget and the cyclic cursor.
pub(crate) fn do_writepages(
    inode: &Arc<Inode>,
    wbc: &mut WritebackControl,
) -> Result<(), CacheError> {
    let mapping = inode.mapping();
    let page_bits = mapping.page_size().trailing_zeros();
    let (start, end) = if wbc.range_cyclic {
        (mapping.writeback_index.load(Ordering::Acquire), u64::MAX)
    } else {
        (wbc.range_start >> page_bits, wbc.range_end >> page_bits)
    };

    let mut err = None;
    let mut cursor = start;
    let mut wrapped = !wbc.range_cyclic || start == 0;

    loop {
        let batch = mapping.dirty_tagged(cursor, end, 16);
        if batch.is_empty() {
            if !wrapped {
                wrapped = true;
                cursor = 0;
                continue;
            }
            break;
        }
        for page in batch {
            cursor = page.index() + 1;
            page.lock();

            let still_ours = page
                .mapping()
                .is_some_and(|m| Arc::ptr_eq(&m, mapping));
            if !still_ours {
                page.unlock();
                continue;
            }
            if page.is_writeback() {
                if wbc.sync_all() {
                    let dev = inode.dev();
                    page.wait_writeback_with(|| {
                        if let Some(dev) = &dev {
                            dev.disk().kick();
                        }
                    });
                } else {
                    page.unlock();
                    continue;
                }
            }
            if !crate::dirty::clear_page_dirty_for_io(&page) {
                page.unlock();
                continue;
            }

            if let Err(e) = inode.ops().writepage(inode, &page, wbc) {
                err.get_or_insert(e);
            }
            wbc.nr_to_write -= 1;
            if wbc.nr_to_write <= 0 && !wbc.sync_all() {
                if wbc.range_cyclic {
                    mapping.writeback_index.store(cursor, Ordering::Release);
                }
                return pack(err);
            }
        }
    }

    if wbc.range_cyclic {
        mapping.writeback_index.store(cursor, Ordering::Release);
    }
    pack(err)
}

/// Waits until no page of the inode's mapping is under write I/O, then
/// reports any error the mapping recorded.
pub(crate) fn wait_on_writeback_pages(inode: &Arc<Inode>) -> Result<(), CacheError> {
    let mapping = inode.mapping();
    let dev = inode.dev();
    loop {
        let pages = mapping.writeback_tagged();
        if pages.is_empty() {
            break;
        }
        for page in pages {
            page.wait_writeback_with(|| {
                if let Some(dev) = &dev {
                    dev.disk().kick();
                }
            });
        }
    }
    mapping.take_error()
}

// === Entry points === //

/// Enqueues opportunistic writeback of up to `nr_pages` pages, optionally
/// scoped to one superblock. Returns without waiting.
pub fn start_writeback(bdi: &Arc<BackingDev>, sb: Option<Arc<SuperBlock>>, nr_pages: u64) {
    bdi.queue_work(
        WorkSpec {
            sb,
            sync_mode: SyncMode::None,
            nr_pages: nr_pages.min(i64::MAX as u64) as i64,
            for_kupdate: false,
            for_background: false,
            range_cyclic: true,
        },
        false,
    );
}

/// Data-integrity sync of a superblock: enqueues an unbounded `All`-mode
/// item and blocks until the worker has finished the I/O and its waits.
pub fn sync_writeback(bdi: &Arc<BackingDev>, sb: &Arc<SuperBlock>) {
    // Hold the unmount read side across the whole sync; the worker skips
    // pinning for All-mode items because of exactly this.
    let _umount = sb.umount.read();
    bdi.queue_work(
        WorkSpec {
            sb: Some(sb.clone()),
            sync_mode: SyncMode::All,
            nr_pages: i64::MAX,
            for_kupdate: false,
            for_background: false,
            range_cyclic: false,
        },
        true,
    );
}

/// Opportunistic flush of one superblock. Blocks only until the worker has
/// picked the work up, not for the I/O.
pub fn writeback_inodes_sb(sb: &Arc<SuperBlock>) {
    let Some(bdi) = sb.bdi() else { return };
    bdi.queue_work(
        WorkSpec {
            sb: Some(sb.clone()),
            sync_mode: SyncMode::None,
            nr_pages: i64::MAX,
            for_kupdate: false,
            for_background: false,
            range_cyclic: true,
        },
        true,
    );
}

/// As [`writeback_inodes_sb`], but only if this device has no writeback
/// queued or in flight. Returns whether work was started.
pub fn writeback_inodes_sb_if_idle(sb: &Arc<SuperBlock>) -> bool {
    let Some(bdi) = sb.bdi() else { return false };
    if bdi.writeback_in_progress() {
        return false;
    }
    writeback_inodes_sb(sb);
    true
}

/// Full data-integrity sync of a superblock: inode pages through the
/// worker, every inode's associated buffers, and finally the device's
/// volatile write cache. First error wins; later phases still run.
pub fn sync_superblock(sb: &Arc<SuperBlock>) -> Result<(), CacheError> {
    let mut err = None;

    if let Some(bdi) = sb.bdi() {
        sync_writeback(bdi, sb);
    }
    for inode in sb.inodes() {
        if let Err(e) = crate::fsync::fsync_associated(&inode) {
            err.get_or_insert(e);
        }
    }
    if let Some(dev) = sb.dev() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        dev.disk().submit(blockio::IoRequest::Flush {
            done: Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        });
        dev.disk().kick();
        if rx.recv() != Ok(true) {
            err.get_or_insert(CacheError::Io);
        }
    }
    pack(err)
}
