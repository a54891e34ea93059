//! Bulk I/O across contiguous runs of blocks spanning whole pages, for
//! readahead and large sequential transfers. Pages that cannot join a run
//! (existing buffers, holes, discontiguous or delayed mappings) fall back
//! to the per-page drivers.

use std::sync::Arc;

use blockio::IoRequest;
use tracing::trace;

use crate::bh::BufferHead;
use crate::device::BlockDev;
use crate::dirty;
use crate::error::CacheError;
use crate::inode::Inode;
use crate::page::Page;
use crate::writeback::WritebackControl;

/// Longest single request, in pages.
const MAX_RUN_PAGES: usize = 32;

struct Run {
    dev: Arc<BlockDev>,
    /// First device block of the run.
    first_block: u64,
    /// Device block the next appended page must start at.
    next_block: u64,
    block_size: usize,
    pages: Vec<Arc<Page>>,
}

/// What probing one page's block mappings concluded.
enum Probe {
    /// Fully mapped, contiguous on one device.
    Contiguous {
        dev: Arc<BlockDev>,
        first_block: u64,
        boundary: bool,
    },
    /// Needs the per-page path.
    Fallback,
}

fn probe_page(inode: &Arc<Inode>, index: u64) -> Result<Probe, CacheError> {
    let mapping = inode.mapping();
    let block_size = mapping.block_size();
    let per_page = mapping.page_size() / block_size;
    let first_file_block = index << mapping.size_bits(block_size);

    let mut dev: Option<Arc<BlockDev>> = None;
    let mut first_block = 0u64;
    let mut boundary = false;

    for i in 0..per_page {
        let probe = Arc::new(BufferHead::scratch(block_size));
        inode
            .mapper()
            .map_block(inode, first_file_block + i as u64, &probe, false)?;

        if !probe.is_mapped()
            || probe.is(crate::bh::BhState::DELAY | crate::bh::BhState::UNWRITTEN)
        {
            return Ok(Probe::Fallback);
        }
        let Some(probe_dev) = probe.dev() else {
            return Ok(Probe::Fallback);
        };
        match &dev {
            None => {
                dev = Some(probe_dev);
                first_block = probe.block();
            }
            Some(run_dev) => {
                if !Arc::ptr_eq(run_dev, &probe_dev)
                    || probe.block() != first_block + i as u64
                {
                    return Ok(Probe::Fallback);
                }
            }
        }
        boundary = probe.is(crate::bh::BhState::BOUNDARY);
    }

    Ok(Probe::Contiguous {
        dev: dev.expect("page has at least one block"),
        first_block,
        boundary,
    })
}

// === Read side === //

/// Reads the given page indices, batching contiguous fully-mapped pages
/// into single requests. A boundary block (end of an extent run) flushes
/// the current request so the next extent lookup is not starved behind it.
pub fn read_pages(inode: &Arc<Inode>, indices: &[u64]) -> Result<(), CacheError> {
    let mapping = inode.mapping();
    let block_size = mapping.block_size();
    let blocks_per_page = (mapping.page_size() / block_size) as u64;
    let mut run: Option<Run> = None;
    let mut err = None;

    for &index in indices {
        let page = mapping.find_or_create_page(index);
        if page.is_uptodate() {
            page.unlock();
            continue;
        }
        if page.has_buffers() {
            submit_read_run(run.take());
            fall_back_read(inode, &page, &mut err);
            continue;
        }

        match probe_page(inode, index) {
            Ok(Probe::Contiguous {
                dev,
                first_block,
                boundary,
            }) => {
                let extends = run.as_ref().is_some_and(|r| {
                    Arc::ptr_eq(&r.dev, &dev)
                        && r.next_block == first_block
                        && r.pages.len() < MAX_RUN_PAGES
                });
                if !extends {
                    submit_read_run(run.take());
                    run = Some(Run {
                        dev,
                        first_block,
                        next_block: first_block,
                        block_size,
                        pages: Vec::new(),
                    });
                }
                let run_ref = run.as_mut().expect("run just ensured");
                page.set_mapped_to_disk();
                run_ref.pages.push(page);
                run_ref.next_block += blocks_per_page;
                if boundary {
                    submit_read_run(run.take());
                }
            }
            Ok(Probe::Fallback) => {
                submit_read_run(run.take());
                fall_back_read(inode, &page, &mut err);
            }
            Err(e) => {
                err.get_or_insert(e);
                page.unlock();
            }
        }
    }
    submit_read_run(run.take());

    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn fall_back_read(inode: &Arc<Inode>, page: &Arc<Page>, err: &mut Option<CacheError>) {
    if let Err(e) = inode.ops().readpage(inode, page) {
        err.get_or_insert(e);
    }
}

fn submit_read_run(run: Option<Run>) {
    let Some(run) = run else { return };
    if run.pages.is_empty() {
        return;
    }
    let page_size = run.pages[0].size();
    let len = run.pages.len() * page_size;
    let sector = run.first_block * (run.block_size as u64 >> run.dev.sector_size().trailing_zeros());
    trace!(
        dev = run.dev.id(),
        sector,
        pages = run.pages.len(),
        "bulk read"
    );

    let pages = run.pages;
    run.dev.disk().submit(IoRequest::Read {
        sector,
        len,
        done: Box::new(move |result| match result {
            Ok(data) => {
                for (i, page) in pages.iter().enumerate() {
                    page.copy_in(0, &data[i * page_size..(i + 1) * page_size]);
                    page.set_uptodate();
                    page.unlock();
                }
            }
            Err(_) => {
                for page in &pages {
                    page.set_error();
                    page.unlock();
                }
            }
        }),
    });
    // A fresh run follows, if anything; do not let it queue behind us.
    // (Submission order is already preserved by the disk queue.)
}

// === Write side === //

/// Writes the mapping's dirty pages, batching fully-dirty, fully-mapped,
/// contiguous, valid pages into single requests; everything else goes
/// through the per-page writer. Pages straddling EOF are zeroed past the
/// end before submission, since they may be mapped into user space.
pub fn write_pages(inode: &Arc<Inode>, wbc: &mut WritebackControl) -> Result<(), CacheError> {
    let mapping = inode.mapping();
    let block_size = mapping.block_size();
    let page_size = mapping.page_size();
    let blocks_per_page = (page_size / block_size) as u64;
    let size = inode.size();

    let mut run: Option<WriteRun> = None;
    let mut err = None;
    let mut cursor = 0u64;

    loop {
        let batch = mapping.dirty_tagged(cursor, u64::MAX, 16);
        if batch.is_empty() {
            break;
        }
        for page in batch {
            cursor = page.index() + 1;
            page.lock();

            let still_ours = page.mapping().is_some_and(|m| Arc::ptr_eq(&m, mapping));
            if !still_ours || !page.is_dirty() {
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

            let page_start = page.index() * page_size as u64;
            if page_start >= size {
                // Entirely past EOF: nothing to persist.
                dirty::clear_page_dirty_for_io(&page);
                page.unlock();
                continue;
            }

            // Only a fully valid page without buffer state can be streamed
            // wholesale; anything else goes through the block-aware writer.
            let probe = if page.is_uptodate() && !page.has_buffers() {
                probe_page(inode, page.index())
            } else {
                Ok(Probe::Fallback)
            };

            match probe {
                Ok(Probe::Contiguous {
                    dev, first_block, ..
                }) => {
                    if !dirty::clear_page_dirty_for_io(&page) {
                        page.unlock();
                        continue;
                    }
                    dirty::set_page_writeback(&page);
                    // Zero the tail a mmap writer may have scribbled past
                    // EOF.
                    if page_start + page_size as u64 > size {
                        page.zero_range((size - page_start) as usize, page_size);
                    }
                    let data = page.copy_out(0, page_size);
                    page.unlock();

                    let extends = run.as_ref().is_some_and(|r| {
                        Arc::ptr_eq(&r.dev, &dev)
                            && r.next_block == first_block
                            && r.pages.len() < MAX_RUN_PAGES
                    });
                    if !extends {
                        submit_write_run(run.take());
                        run = Some(WriteRun {
                            dev,
                            first_block,
                            next_block: first_block,
                            block_size,
                            pages: Vec::new(),
                            data: Vec::new(),
                        });
                    }
                    let run_ref = run.as_mut().expect("run just ensured");
                    run_ref.pages.push(page);
                    run_ref.data.extend_from_slice(&data);
                    run_ref.next_block += blocks_per_page;

                    wbc.nr_to_write -= 1;
                }
                Ok(Probe::Fallback) => {
                    submit_write_run(run.take());
                    if !dirty::clear_page_dirty_for_io(&page) {
                        page.unlock();
                        continue;
                    }
                    if let Err(e) = inode.ops().writepage(inode, &page, wbc) {
                        err.get_or_insert(e);
                    }
                    wbc.nr_to_write -= 1;
                }
                Err(e) => {
                    err.get_or_insert(e);
                    page.unlock();
                }
            }
        }
    }
    submit_write_run(run.take());

    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct WriteRun {
    dev: Arc<BlockDev>,
    first_block: u64,
    next_block: u64,
    block_size: usize,
    pages: Vec<Arc<Page>>,
    data: Vec<u8>,
}

fn submit_write_run(run: Option<WriteRun>) {
    let Some(run) = run else { return };
    if run.pages.is_empty() {
        return;
    }
    let sector = run.first_block * (run.block_size as u64 >> run.dev.sector_size().trailing_zeros());
    trace!(
        dev = run.dev.id(),
        sector,
        pages = run.pages.len(),
        "bulk write"
    );

    let pages = run.pages;
    run.dev.disk().submit(IoRequest::Write {
        sector,
        data: run.data,
        done: Box::new(move |result| {
            for page in &pages {
                if result.is_err() {
                    page.set_error();
                    if let Some(mapping) = page.mapping() {
                        mapping.set_error(CacheError::Io);
                    }
                }
                dirty::end_page_writeback(page);
            }
        }),
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::testutil::{file_rig, wait_until, FileRig};
    use crate::writeback::SyncMode;
    use crate::CacheConfig;

    fn contiguous_rig(pages: u64) -> FileRig {
        let f = file_rig(CacheConfig::default(), 4096, 1024, 256 * 1024, 64);
        // Map file blocks 0.. onto a contiguous device run at block 64.
        for block in 0..pages * 4 {
            f.mapper.map_direct(block, 64 + block);
            f.rig
                .backend
                .fill((64 + block) * 1024, &[block as u8; 1024]);
        }
        f
    }

    fn assert_pages_valid(f: &FileRig, indices: &[u64]) {
        for &index in indices {
            let page = f.inode.mapping().page_at(index).unwrap();
            assert!(
                wait_until(Duration::from_secs(5), || page.is_uptodate()
                    && !page.is_locked()),
                "page {index} never became valid"
            );
            page.with_data(|d| {
                for block_in_page in 0..4usize {
                    let expected = index as u8 * 4 + block_in_page as u8;
                    assert!(d[block_in_page * 1024..(block_in_page + 1) * 1024]
                        .iter()
                        .all(|&b| b == expected));
                }
            });
        }
    }

    #[test]
    fn contiguous_pages_read_as_one_request() {
        let f = contiguous_rig(3);
        read_pages(&f.inode, &[0, 1, 2]).unwrap();
        assert_pages_valid(&f, &[0, 1, 2]);
        assert_eq!(
            f.rig.disk.stats().reads.load(Ordering::Relaxed),
            1,
            "one contiguous run must be one request"
        );
    }

    #[test]
    fn boundary_block_splits_the_request() {
        let f = contiguous_rig(3);
        // Last block of page 0 ends an extent run.
        f.mapper.set_boundary(3);
        read_pages(&f.inode, &[0, 1, 2]).unwrap();
        assert_pages_valid(&f, &[0, 1, 2]);
        assert_eq!(f.rig.disk.stats().reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn holes_fall_back_to_the_per_page_path() {
        let f = contiguous_rig(1);
        // Page 1 entirely unmapped: served as zeroes without I/O.
        read_pages(&f.inode, &[0, 1]).unwrap();
        assert_pages_valid(&f, &[0]);

        let hole_page = f.inode.mapping().page_at(1).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            hole_page.is_uptodate() && !hole_page.is_locked()
        }));
        assert!(hole_page.with_data(|d| d.iter().all(|&b| b == 0)));
        assert_eq!(f.rig.disk.stats().reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn discontiguity_starts_a_new_request() {
        let f = contiguous_rig(2);
        // Break contiguity between pages 0 and 1.
        for block in 4..8u64 {
            f.mapper.map_direct(block, 200 + block);
            f.rig
                .backend
                .fill((200 + block) * 1024, &[block as u8; 1024]);
        }
        read_pages(&f.inode, &[0, 1]).unwrap();
        assert_pages_valid(&f, &[0, 1]);
        assert_eq!(f.rig.disk.stats().reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn bulk_write_batches_contiguous_valid_pages() {
        let f = contiguous_rig(3);
        read_pages(&f.inode, &[0, 1, 2]).unwrap();
        assert_pages_valid(&f, &[0, 1, 2]);

        for index in 0..3u64 {
            let page = f.inode.mapping().page_at(index).unwrap();
            page.with_data_mut(|d| d.fill(0x90 + index as u8));
            crate::dirty::mark_page_dirty(&page);
        }

        let writes_before = f.rig.disk.stats().writes.load(Ordering::Relaxed);
        let mut wbc = WritebackControl::new(SyncMode::All);
        write_pages(&f.inode, &mut wbc).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            f.rig.dev.bdi().nr_writeback_pages() == 0
        }));

        assert_eq!(
            f.rig.disk.stats().writes.load(Ordering::Relaxed),
            writes_before + 1,
            "three contiguous pages must be one write"
        );
        let image = f.rig.backend.snapshot();
        for index in 0..3usize {
            assert!(image[(64 + index * 4) * 1024..][..4096]
                .iter()
                .all(|&b| b == 0x90 + index as u8));
        }
        assert_eq!(f.inode.mapping().nr_dirty(), 0);
    }

    #[test]
    fn bulk_write_zeroes_past_eof() {
        // 7 KiB file whose last page is fully mapped: the batch path must
        // zero the EOF straddle before the data leaves memory.
        let f = file_rig(CacheConfig::default(), 4096, 1024, 7 * 1024, 64);
        for block in 0..8u64 {
            f.mapper.map_direct(block, 64 + block);
        }
        read_pages(&f.inode, &[0, 1]).unwrap();
        let page = f.inode.mapping().page_at(1).unwrap();
        assert!(wait_until(Duration::from_secs(5), || page.is_uptodate()
            && !page.is_locked()));

        // Scribble across the whole page, including past EOF, as a mapped
        // writer could.
        page.with_data_mut(|d| d.fill(0xee));
        crate::dirty::mark_page_dirty(&page);

        let mut wbc = WritebackControl::new(SyncMode::All);
        write_pages(&f.inode, &mut wbc).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            f.rig.dev.bdi().nr_writeback_pages() == 0
        }));

        let image = f.rig.backend.snapshot();
        // Bytes within the file carry the payload, the EOF straddle is
        // zero.
        assert!(image[(64 + 4) * 1024..][..3072].iter().all(|&b| b == 0xee));
        assert!(image[(64 + 7) * 1024..][..1024].iter().all(|&b| b == 0));
    }
}
