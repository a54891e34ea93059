//! Handle-level I/O: submission to the block layer and the synchronous
//! completion callbacks.
//!
//! A read completion copies the transferred bytes into the page before the
//! handle's end-io runs, so `Uptodate` is never visible ahead of the data.
//! A write snapshots the page bytes at submission time. In-flight requests
//! hold one handle reference, taken at submit and dropped after end-io.

use std::sync::Arc;

use blockio::IoRequest;
use tracing::{error, warn};

use crate::bh::{BhState, BufferHead, EndIo};
use crate::error::CacheError;

/// Logs a per-handle I/O error once; repeats are suppressed by `QUIET`
/// until a transfer succeeds again.
pub(crate) fn buffer_io_error(bh: &Arc<BufferHead>) {
    if !bh.set_bits(BhState::QUIET) {
        error!(
            dev = bh.dev().map(|d| d.id()).unwrap_or(0),
            block = bh.block(),
            size = bh.size(),
            "buffer I/O error"
        );
    }
}

fn complete(bh: &Arc<BufferHead>, ok: bool) {
    if ok {
        bh.clear_bits(BhState::QUIET);
    }
    match bh.take_end_io() {
        Some(end_io) => end_io(bh, ok),
        None => warn!(block = bh.block(), "I/O completion with no end-io set"),
    }
}

/// Invokes the handle's end-io without device I/O, for submitters that
/// discover the transfer is unnecessary after staging it.
pub(crate) fn complete_local(bh: &Arc<BufferHead>, ok: bool) {
    complete(bh, ok);
}

fn sector_of(bh: &BufferHead, sector_size: u32) -> u64 {
    bh.block() * (bh.size() as u64 >> sector_size.trailing_zeros())
}

/// Submits a read of a locked, mapped handle. The stored end-io runs when
/// the device is done.
pub(crate) fn submit_read(bh: &Arc<BufferHead>) {
    debug_assert!(bh.is_locked() && bh.is_mapped());
    let dev = bh.dev().expect("read of a handle with no device");
    bh.set_bits(BhState::REQ);
    bh.get_ref();

    let sector = sector_of(bh, dev.sector_size());
    let len = bh.size();
    let bh = bh.clone();
    dev.disk().submit(IoRequest::Read {
        sector,
        len,
        done: Box::new(move |result| {
            let ok = match result {
                Ok(data) => {
                    if let Some(page) = bh.page() {
                        page.copy_in(bh.offset_in_page(), &data);
                    }
                    true
                }
                Err(_) => false,
            };
            complete(&bh, ok);
            bh.put_ref();
        }),
    });
}

/// Submits a write of a locked, mapped handle, snapshotting the page bytes
/// now.
pub(crate) fn submit_write(bh: &Arc<BufferHead>) {
    debug_assert!(bh.is_locked() && bh.is_mapped());
    let dev = bh.dev().expect("write of a handle with no device");
    let Some(page) = bh.page() else {
        // Detached ring; nothing to write from.
        complete(bh, false);
        return;
    };
    bh.set_bits(BhState::REQ);
    bh.get_ref();

    let data = page.copy_out(bh.offset_in_page(), bh.size());
    let sector = sector_of(bh, dev.sector_size());
    let bh = bh.clone();
    dev.disk().submit(IoRequest::Write {
        sector,
        data,
        done: Box::new(move |result| {
            complete(&bh, result.is_ok());
            bh.put_ref();
        }),
    });
}

/// End-io for synchronous reads: record the outcome and wake the waiter.
pub(crate) fn end_buffer_read_sync(bh: &Arc<BufferHead>, ok: bool) {
    if ok {
        bh.set_uptodate();
    } else {
        buffer_io_error(bh);
        bh.clear_uptodate();
    }
    bh.unlock();
}

/// End-io for synchronous writes. A failure marks the handle, the page, and
/// the owning mapping so fsync observes it.
pub(crate) fn end_buffer_write_sync(bh: &Arc<BufferHead>, ok: bool) {
    if ok {
        bh.set_uptodate();
    } else {
        buffer_io_error(bh);
        bh.set_bits(BhState::WRITE_IO_ERROR);
        bh.clear_uptodate();
        if let Some(page) = bh.page() {
            page.set_error();
            if let Some(mapping) = page.mapping() {
                mapping.set_error(CacheError::Io);
            }
        }
    }
    bh.unlock();
}

fn end_io(f: fn(&Arc<BufferHead>, bool)) -> EndIo {
    Arc::new(f)
}

/// Reads the handle's block from disk and waits, returning whether the
/// handle ended up uptodate.
pub(crate) fn read_buffer_sync(bh: &Arc<BufferHead>) -> Result<(), CacheError> {
    bh.lock();
    if bh.is_uptodate() {
        bh.unlock();
        return Ok(());
    }
    bh.set_end_io(end_io(end_buffer_read_sync));
    submit_read(bh);
    if let Some(dev) = bh.dev() {
        dev.disk().kick();
    }
    bh.wait_on();
    if bh.is_uptodate() {
        Ok(())
    } else {
        Err(CacheError::Io)
    }
}

/// Submits the handle for write if dirty, then waits and reports the I/O
/// outcome. Clean handles return immediately.
pub fn sync_buffer(bh: &Arc<BufferHead>) -> Result<(), CacheError> {
    bh.lock();
    if bh.test_clear_dirty() {
        bh.set_end_io(end_io(end_buffer_write_sync));
        submit_write(bh);
        if let Some(dev) = bh.dev() {
            dev.disk().kick();
        }
        bh.wait_on();
        if !bh.is_uptodate() {
            return Err(CacheError::Io);
        }
    } else {
        bh.unlock();
    }
    Ok(())
}

/// Starts an asynchronous write of the handle if it is dirty. Used by the
/// associated-buffer flush, typically under a plugged queue.
pub(crate) fn write_dirty_buffer(bh: &Arc<BufferHead>) {
    bh.lock();
    if !bh.test_clear_dirty() {
        bh.unlock();
        return;
    }
    bh.set_end_io(end_io(end_buffer_write_sync));
    submit_write(bh);
}

/// Throws away a handle the caller knows is garbage: cancels dirtiness and
/// any associated-list membership, then drops the reference.
pub fn forget_buffer(bh: crate::bh::BufferRef) {
    bh.clear_bits(BhState::DIRTY);
    crate::dirty::remove_from_assoc_list(bh.inner());
}
