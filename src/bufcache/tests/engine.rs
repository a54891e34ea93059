//! End-to-end runs through the public surface: a toy filesystem maps file
//! blocks through a table, writes land via prepare/commit, and sync pushes
//! them down to the backing store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use blockio::{Disk, DiskOptions, MemBackend};
use bufcache::{
    fsync_associated, mark_buffer_dirty_inode, prepare_partial_write, commit_partial_write,
    sync_writeback, truncate_page, BlockDev, BlockMapper, BufferCache, BufferHead, CacheConfig,
    CacheError, Inode, NoopSuperOps,
};

const BLOCK: usize = 1024;

/// A filesystem in a table: file block N lives wherever allocation put it.
struct TableFs {
    dev: Weak<BlockDev>,
    table: Mutex<HashMap<u64, u64>>,
    next_free: AtomicU64,
}

impl TableFs {
    fn new(dev: &Arc<BlockDev>, first_free: u64) -> Arc<Self> {
        Arc::new(Self {
            dev: Arc::downgrade(dev),
            table: Mutex::new(HashMap::new()),
            next_free: AtomicU64::new(first_free),
        })
    }

    fn device_block_of(&self, file_block: u64) -> Option<u64> {
        self.table.lock().unwrap().get(&file_block).copied()
    }
}

impl BlockMapper for TableFs {
    fn map_block(
        &self,
        _inode: &Arc<Inode>,
        block: u64,
        bh: &Arc<BufferHead>,
        create: bool,
    ) -> Result<(), CacheError> {
        let dev = self.dev.upgrade().ok_or(CacheError::Stale)?;
        let mut table = self.table.lock().unwrap();
        match table.get(&block) {
            Some(&phys) => {
                bh.set_dev(Some(dev));
                bh.set_block(phys);
                bh.set_mapped();
            }
            None if create => {
                let phys = self.next_free.fetch_add(1, Ordering::Relaxed);
                table.insert(block, phys);
                bh.set_dev(Some(dev));
                bh.set_block(phys);
                bh.set_mapped();
                bh.set_new();
            }
            None => {}
        }
        Ok(())
    }
}

struct World {
    backend: Arc<MemBackend>,
    cache: Arc<BufferCache>,
    dev: Arc<BlockDev>,
}

fn world() -> World {
    let backend = Arc::new(MemBackend::new(1024 * 1024));
    let disk = Disk::new(
        "it",
        backend.clone(),
        DiskOptions {
            sector_size: 512,
            workers: 2,
        },
    )
    .unwrap();
    let cache = BufferCache::new(CacheConfig::default());
    let dev = cache.add_device(disk, BLOCK).unwrap();
    World {
        backend,
        cache,
        dev,
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn write_file_range(inode: &Arc<Inode>, offset: usize, bytes: &[u8]) {
    let page_size = inode.mapping().page_size();
    let mut written = 0;
    while written < bytes.len() {
        let pos = offset + written;
        let index = (pos / page_size) as u64;
        let from = pos % page_size;
        let to = (from + bytes.len() - written).min(page_size);

        let page = inode.mapping().find_or_create_page(index);
        prepare_partial_write(inode, &page, from, to).unwrap();
        page.with_data_mut(|d| {
            d[from..to].copy_from_slice(&bytes[written..written + (to - from)])
        });
        commit_partial_write(&page, from, to);
        page.unlock();
        written += to - from;
    }
}

#[test]
fn file_data_survives_a_sync_and_reads_back_elsewhere() {
    let w = world();
    let sb = w.cache.mount("it-fs", &w.dev, Arc::new(NoopSuperOps));
    let fs = TableFs::new(&w.dev, 128);
    let inode = sb.create_inode(2, 3 * 4096, BLOCK, fs.clone());

    let mut payload = Vec::new();
    for i in 0..3 * 4096usize {
        payload.push((i % 251) as u8);
    }
    write_file_range(&inode, 0, &payload);
    assert!(inode.is_dirty());

    sync_writeback(w.dev.bdi(), &sb);

    // Every file block must be readable through a second, cold cache over
    // the same backing store.
    let disk2 = Disk::new("it2", w.backend.clone(), DiskOptions::default()).unwrap();
    let cache2 = BufferCache::new(CacheConfig::default());
    let dev2 = cache2.add_device(disk2, BLOCK).unwrap();
    for file_block in 0..(payload.len() / BLOCK) as u64 {
        let phys = fs
            .device_block_of(file_block)
            .expect("block allocated during write");
        let bh = cache2.read(&dev2, phys, BLOCK).unwrap();
        let data = bh.page().unwrap().copy_out(bh.offset_in_page(), BLOCK);
        assert_eq!(
            data,
            payload[file_block as usize * BLOCK..][..BLOCK].to_vec(),
            "file block {file_block} corrupt on disk"
        );
    }
}

#[test]
fn partial_overwrite_preserves_surrounding_bytes() {
    let w = world();
    let sb = w.cache.mount("it-fs", &w.dev, Arc::new(NoopSuperOps));
    let fs = TableFs::new(&w.dev, 128);
    let inode = sb.create_inode(2, 4096, BLOCK, fs.clone());

    write_file_range(&inode, 0, &[0x11u8; 4096]);
    sync_writeback(w.dev.bdi(), &sb);
    // Overwrite the middle of block 1 only.
    write_file_range(&inode, 1500, &[0x22u8; 100]);
    sync_writeback(w.dev.bdi(), &sb);

    let phys = fs.device_block_of(1).unwrap() as usize;
    let image = w.backend.snapshot();
    let block = &image[phys * BLOCK..][..BLOCK];
    assert!(block[..476].iter().all(|&b| b == 0x11));
    assert!(block[476..576].iter().all(|&b| b == 0x22));
    assert!(block[576..].iter().all(|&b| b == 0x11));
}

#[test]
fn metadata_flushes_with_the_file_that_owns_it() {
    let w = world();
    let sb = w.cache.mount("it-fs", &w.dev, Arc::new(NoopSuperOps));
    let fs = TableFs::new(&w.dev, 128);
    let inode = sb.create_inode(2, 4096, BLOCK, fs);

    // A "bitmap block" of the device, tied to the file.
    let bitmap = w.cache.read(&w.dev, 9, BLOCK).unwrap();
    bitmap
        .page()
        .unwrap()
        .with_data_mut(|d| d[bitmap.offset_in_page()..][..BLOCK].fill(0xb1));
    mark_buffer_dirty_inode(bitmap.inner(), &inode);

    fsync_associated(&inode).unwrap();

    let image = w.backend.snapshot();
    assert!(image[9 * BLOCK..][..BLOCK].iter().all(|&b| b == 0xb1));
    assert!(!bitmap.is_dirty());
}

#[test]
fn truncate_tail_is_zeroed_on_disk() {
    let w = world();
    let sb = w.cache.mount("it-fs", &w.dev, Arc::new(NoopSuperOps));
    let fs = TableFs::new(&w.dev, 128);
    let inode = sb.create_inode(2, 4096, BLOCK, fs.clone());

    write_file_range(&inode, 0, &[0x33u8; 4096]);
    // Shrink to 2.5 KiB: the tail of block 2 must be zeroed.
    truncate_page(&inode, 2560).unwrap();
    inode.set_size(2560);
    sync_writeback(w.dev.bdi(), &sb);

    let phys = fs.device_block_of(2).unwrap() as usize;
    let image = w.backend.snapshot();
    let block = &image[phys * BLOCK..][..BLOCK];
    assert!(block[..512].iter().all(|&b| b == 0x33));
    assert!(block[512..].iter().all(|&b| b == 0));
}

#[test]
fn handles_are_stable_across_lookups() {
    let w = world();
    let first = w.cache.get_or_create(&w.dev, 7, BLOCK).unwrap();
    let refs_created = first.refcount();

    let second = w.cache.find(&w.dev, 7, BLOCK).expect("cached");
    assert!(Arc::ptr_eq(first.inner(), second.inner()));
    assert!(second.refcount() > refs_created);

    drop(second);
    drop(first);

    w.cache.invalidate_device(&w.dev);
    assert!(
        w.cache.find(&w.dev, 7, BLOCK).is_none(),
        "clean block must be gone after invalidation"
    );
}

#[test]
fn dirty_data_survives_device_invalidation() {
    let w = world();
    let bh = w.cache.read(&w.dev, 3, BLOCK).unwrap();
    bh.page()
        .unwrap()
        .with_data_mut(|d| d[bh.offset_in_page()..][..BLOCK].fill(0x44));
    bufcache::mark_buffer_dirty(bh.inner());
    drop(bh);

    w.cache.invalidate_device(&w.dev);

    let bh = w.cache.find(&w.dev, 3, BLOCK).expect("dirty block kept");
    assert!(bh.is_dirty());
    let data = bh.page().unwrap().copy_out(bh.offset_in_page(), BLOCK);
    assert!(data.iter().all(|&b| b == 0x44));
}

#[test]
fn background_writeback_eventually_persists_without_sync() {
    let mut config = CacheConfig::default();
    config.writeback.dirty_writeback_interval = Duration::from_millis(20);
    config.writeback.dirty_expire_interval = Duration::from_millis(20);

    let backend = Arc::new(MemBackend::new(1024 * 1024));
    let disk = Disk::new("bg", backend.clone(), DiskOptions::default()).unwrap();
    let cache = BufferCache::new(config);
    let dev = cache.add_device(disk, BLOCK).unwrap();
    let sb = cache.mount("bg-fs", &dev, Arc::new(NoopSuperOps));
    let fs = TableFs::new(&dev, 128);
    let inode = sb.create_inode(2, 4096, BLOCK, fs.clone());

    write_file_range(&inode, 0, &[0x55u8; 4096]);

    assert!(wait_until(Duration::from_secs(10), || {
        (0..4u64).all(|b| match fs.device_block_of(b) {
            Some(phys) => backend.snapshot()[phys as usize * BLOCK..][..BLOCK]
                .iter()
                .all(|&x| x == 0x55),
            None => false,
        })
    }));
    assert!(wait_until(Duration::from_secs(10), || !inode.is_dirty()));
}
