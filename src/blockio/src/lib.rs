//! Block-device request layer.
//!
//! A [`Disk`] owns a storage backend and a small pool of submission worker
//! threads draining a request queue. Callers hand in sector-addressed
//! [`IoRequest`]s carrying a completion callback; the callback runs on a
//! worker thread once the backend has serviced the transfer. The layer above
//! builds its page and buffer state machines on top of these completions and
//! never blocks in here.
//!
//! Requests can be plugged: [`Disk::plug`] makes submissions accumulate so a
//! batch lands on the queue back-to-back when [`Disk::kick`] releases it.
//! Waiters elsewhere call `kick` unconditionally before sleeping, so a
//! plugged batch cannot be stranded behind a sleeping submitter.

mod file;
mod mem;

pub use file::FileBackend;
pub use mem::{FaultKind, MemBackend};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, warn};

/// Smallest sector size any disk may report.
pub const MIN_SECTOR_SIZE: u32 = 512;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("sector {sector} + {len} bytes out of range")]
    OutOfRange { sector: u64, len: usize },
    #[error("transfer of {len} bytes is not sector aligned")]
    Misaligned { len: usize },
    #[error("disk is shutting down")]
    Stopped,
}

pub type ReadDone = Box<dyn FnOnce(Result<Vec<u8>, DiskError>) + Send + 'static>;
pub type WriteDone = Box<dyn FnOnce(Result<(), DiskError>) + Send + 'static>;

pub enum IoRequest {
    Read {
        sector: u64,
        len: usize,
        done: ReadDone,
    },
    Write {
        sector: u64,
        data: Vec<u8>,
        done: WriteDone,
    },
    Flush {
        done: WriteDone,
    },
}

/// Storage a [`Disk`] reads and writes. Byte-addressed; the disk does all
/// sector arithmetic and bounds checking before calling in.
pub trait Backend: Send + Sync + 'static {
    fn size(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DiskOptions {
    pub sector_size: u32,
    /// Submission workers. More than one allows requests to complete out of
    /// their submission order, which real queue depths do too.
    pub workers: usize,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            sector_size: MIN_SECTOR_SIZE,
            workers: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct IoStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub errors: AtomicU64,
}

struct PlugQueue {
    plugged: bool,
    held: Vec<IoRequest>,
}

pub struct Disk {
    name: String,
    sector_size: u32,
    nsectors: u64,
    tx: Mutex<Option<Sender<IoRequest>>>,
    plug: Mutex<PlugQueue>,
    stats: Arc<IoStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Disk {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        opts: DiskOptions,
    ) -> Result<Arc<Self>, DiskError> {
        let name = name.into();
        if !opts.sector_size.is_power_of_two() || opts.sector_size < MIN_SECTOR_SIZE {
            return Err(DiskError::Misaligned {
                len: opts.sector_size as usize,
            });
        }
        let size = backend.size();
        if size % u64::from(opts.sector_size) != 0 {
            warn!(
                disk = %name,
                size,
                sector_size = opts.sector_size,
                "backend size is not a sector multiple; trailing bytes are not addressable"
            );
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let stats = Arc::new(IoStats::default());
        let nworkers = opts.workers.max(1);

        let mut workers = Vec::with_capacity(nworkers);
        for index in 0..nworkers {
            let worker = IoWorker {
                rx: rx.clone(),
                backend: backend.clone(),
                stats: stats.clone(),
                sector_size: opts.sector_size,
                disk_name: name.clone(),
            };
            workers.push(worker.run(index));
        }

        Ok(Arc::new(Self {
            name,
            sector_size: opts.sector_size,
            nsectors: size / u64::from(opts.sector_size),
            tx: Mutex::new(Some(tx)),
            plug: Mutex::new(PlugQueue {
                plugged: false,
                held: Vec::new(),
            }),
            stats,
            workers: Mutex::new(workers),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn nsectors(&self) -> u64 {
        self.nsectors
    }

    pub fn size(&self) -> u64 {
        self.nsectors * u64::from(self.sector_size)
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Queues a request, or fails it synchronously if it does not fit the
    /// disk. Completion runs on a worker thread.
    pub fn submit(&self, req: IoRequest) {
        if let Some(err) = self.validate(&req) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return fail(req, err);
        }
        self.enqueue(req);
    }

    /// Starts holding submissions back; pair with [`Disk::kick`].
    pub fn plug(&self) {
        self.plug.lock().plugged = true;
    }

    /// Releases any plugged requests to the workers. Safe to call at any
    /// time, plugged or not.
    pub fn kick(&self) {
        let held = {
            let mut plug = self.plug.lock();
            plug.plugged = false;
            std::mem::take(&mut plug.held)
        };
        for req in held {
            self.send(req);
        }
    }

    fn validate(&self, req: &IoRequest) -> Option<DiskError> {
        let (sector, len) = match req {
            IoRequest::Read { sector, len, .. } => (*sector, *len),
            IoRequest::Write { sector, data, .. } => (*sector, data.len()),
            IoRequest::Flush { .. } => return None,
        };
        if len == 0 || len % self.sector_size as usize != 0 {
            Some(DiskError::Misaligned { len })
        } else if sector + (len as u64 >> self.sector_size.trailing_zeros()) > self.nsectors {
            Some(DiskError::OutOfRange { sector, len })
        } else {
            None
        }
    }

    fn enqueue(&self, req: IoRequest) {
        {
            let mut plug = self.plug.lock();
            if plug.plugged {
                plug.held.push(req);
                return;
            }
        }
        self.send(req);
    }

    fn send(&self, req: IoRequest) {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(req) {
                    fail(e.into_inner(), DiskError::Stopped);
                }
            }
            None => fail(req, DiskError::Stopped),
        }
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        // Disconnect the queue, fail anything still plugged, then let the
        // workers drain what was already queued and exit.
        self.tx.lock().take();
        let held = std::mem::take(&mut self.plug.lock().held);
        for req in held {
            fail(req, DiskError::Stopped);
        }
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn fail(req: IoRequest, err: DiskError) {
    match req {
        IoRequest::Read { done, .. } => done(Err(err)),
        IoRequest::Write { done, .. } | IoRequest::Flush { done } => done(Err(err)),
    }
}

struct IoWorker {
    rx: Receiver<IoRequest>,
    backend: Arc<dyn Backend>,
    stats: Arc<IoStats>,
    sector_size: u32,
    disk_name: String,
}

impl IoWorker {
    fn run(self, index: usize) -> JoinHandle<()> {
        thread::Builder::new()
            .name(format!("blockio-{}-{}", self.disk_name, index))
            .spawn(|| self.work())
            .expect("spawning disk worker")
    }

    fn work(self) {
        while let Ok(req) = self.rx.recv() {
            self.process(req);
        }
    }

    fn process(&self, req: IoRequest) {
        match req {
            IoRequest::Read { sector, len, done } => {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
                let mut buf = vec![0u8; len];
                match self.backend.read_at(sector * u64::from(self.sector_size), &mut buf) {
                    Ok(()) => done(Ok(buf)),
                    Err(e) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        error!(disk = %self.disk_name, sector, len, error = %e, "read failed");
                        done(Err(e.into()));
                    }
                }
            }
            IoRequest::Write { sector, data, done } => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                match self.backend.write_at(sector * u64::from(self.sector_size), &data) {
                    Ok(()) => done(Ok(())),
                    Err(e) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        error!(disk = %self.disk_name, sector, len = data.len(), error = %e, "write failed");
                        done(Err(e.into()));
                    }
                }
            }
            IoRequest::Flush { done } => match self.backend.flush() {
                Ok(()) => done(Ok(())),
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!(disk = %self.disk_name, error = %e, "flush failed");
                    done(Err(e.into()));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::bounded;

    use super::*;

    fn disk_with(nsectors: u64, workers: usize) -> (Arc<Disk>, Arc<MemBackend>) {
        let backend = Arc::new(MemBackend::new(nsectors * 512));
        let disk = Disk::new(
            "t",
            backend.clone(),
            DiskOptions {
                sector_size: 512,
                workers,
            },
        )
        .unwrap();
        (disk, backend)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (disk, _backend) = disk_with(8, 1);
        let (tx, rx) = bounded(1);

        disk.submit(IoRequest::Write {
            sector: 2,
            data: vec![0xabu8; 1024],
            done: Box::new(move |r| tx.send(r.is_ok()).unwrap()),
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        let (tx, rx) = bounded(1);
        disk.submit(IoRequest::Read {
            sector: 2,
            len: 1024,
            done: Box::new(move |r| tx.send(r.unwrap()).unwrap()),
        });
        let data = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(data.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn out_of_range_fails_synchronously() {
        let (disk, _backend) = disk_with(4, 1);
        let (tx, rx) = bounded(1);
        disk.submit(IoRequest::Read {
            sector: 4,
            len: 512,
            done: Box::new(move |r| tx.send(r.is_err()).unwrap()),
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn misaligned_transfer_rejected() {
        let (disk, _backend) = disk_with(4, 1);
        let (tx, rx) = bounded(1);
        disk.submit(IoRequest::Write {
            sector: 0,
            data: vec![0u8; 100],
            done: Box::new(move |r| {
                tx.send(matches!(r, Err(DiskError::Misaligned { .. }))).unwrap()
            }),
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn injected_read_fault_surfaces() {
        let (disk, backend) = disk_with(8, 1);
        backend.fail_reads(1, 1, 1);

        let (tx, rx) = bounded(1);
        disk.submit(IoRequest::Read {
            sector: 1,
            len: 512,
            done: Box::new(move |r| tx.send(r.is_err()).unwrap()),
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        // The fault was one-shot.
        let (tx, rx) = bounded(1);
        disk.submit(IoRequest::Read {
            sector: 1,
            len: 512,
            done: Box::new(move |r| tx.send(r.is_ok()).unwrap()),
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn plug_holds_until_kick() {
        let (disk, _backend) = disk_with(8, 1);
        let completions = Arc::new(AtomicUsize::new(0));

        disk.plug();
        for sector in 0..4 {
            let completions = completions.clone();
            disk.submit(IoRequest::Write {
                sector,
                data: vec![1u8; 512],
                done: Box::new(move |_| {
                    completions.fetch_add(1, Ordering::SeqCst);
                }),
            });
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(completions.load(Ordering::SeqCst), 0);

        disk.kick();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while completions.load(Ordering::SeqCst) != 4 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn gated_reads_complete_out_of_order() {
        let (disk, backend) = disk_with(8, 4);
        backend.hold_reads();

        let (tx, rx) = bounded(4);
        for sector in 0..4u64 {
            let tx = tx.clone();
            disk.submit(IoRequest::Read {
                sector,
                len: 512,
                done: Box::new(move |_| tx.send(sector).unwrap()),
            });
        }

        // Let all four park inside the backend before releasing.
        std::thread::sleep(Duration::from_millis(50));
        for &sector in &[2u64, 0, 3, 1] {
            backend.release_read(sector * 512);
            let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(got, sector);
        }
    }
}
