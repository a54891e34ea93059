//! Engine tunables.

use std::sync::Arc;
use std::time::Duration;

/// Writeback worker timing and batching.
#[derive(Debug, Clone)]
pub struct WritebackConfig {
    /// How often the periodic pass looks for old dirty data.
    pub dirty_writeback_interval: Duration,
    /// Age at which dirty inodes become eligible for the periodic pass.
    pub dirty_expire_interval: Duration,
    /// Pages written per inner iteration before the worker lets go of an
    /// inode, bounding how long a single inode stays under sync.
    pub max_writeback_pages: u64,
    /// Continuous idleness after which a worker thread exits. It is respawned
    /// on the next enqueue.
    pub idle_exit: Duration,
    /// Per-device dirty page count above which background writeback starts.
    pub background_dirty_pages: u64,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            dirty_writeback_interval: Duration::from_secs(5),
            dirty_expire_interval: Duration::from_secs(30),
            max_writeback_pages: 1024,
            idle_exit: Duration::from_secs(300),
            background_dirty_pages: 1024,
        }
    }
}

/// What to do when a handle cannot be created because the target page's
/// existing buffers are pinned.
#[derive(Debug, Clone, Default)]
pub struct GrowPolicy {
    /// `None` retries forever (creation cannot fail, only block). A bound
    /// turns exhaustion into `CacheError::OutOfMemory`.
    pub max_retries: Option<u32>,
}

/// Invoked between grow retries to nudge memory free. The default wakes
/// every flusher and yields.
pub trait ReclaimHook: Send + Sync {
    fn free_more_memory(&self);
}

pub(crate) struct DefaultReclaim;

impl ReclaimHook for DefaultReclaim {
    fn free_more_memory(&self) {
        crate::writeback::wakeup_flushers(1024);
        std::thread::yield_now();
    }
}

#[derive(Clone)]
pub struct CacheConfig {
    /// Power-of-two page size; block sizes divide it.
    pub page_size: usize,
    /// LRU shard count; defaults to available parallelism.
    pub lru_shards: usize,
    pub writeback: WritebackConfig,
    pub grow: GrowPolicy,
    pub reclaim: Arc<dyn ReclaimHook>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            lru_shards: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2),
            writeback: WritebackConfig::default(),
            grow: GrowPolicy::default(),
            reclaim: Arc::new(DefaultReclaim),
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("page_size", &self.page_size)
            .field("lru_shards", &self.lru_shards)
            .field("writeback", &self.writeback)
            .field("grow", &self.grow)
            .finish_non_exhaustive()
    }
}
