//! Background hash-checking. One worker thread serves a queue of
//! torrents ordered by (priority, smallest-on-disk-first) so quick
//! checks aren't stuck behind terabyte re-verifies.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use riptide_core::block_info::BlockInfo;
use riptide_core::file_map::FilePieceMap;
use tracing::{debug, info, warn};

use crate::disk_io::TorrentDisk;
use crate::open_files::{OpenFilesCache, Preallocation};
use crate::torrent::{Priority, TorrentId};
use crate::BF;

/// Hash for this long, then sleep 100 ms, so a verify never saturates
/// the disk.
const WORK_SLICE: Duration = Duration::from_secs(1);
const SLICE_REST: Duration = Duration::from_millis(100);

pub struct VerifyOutcome {
    pub tor_id: TorrentId,
    pub aborted: bool,
    /// One bit per piece; set bits passed SHA-1.
    pub pieces: BF,
}

type ProgressFn = Box<dyn Fn(f32) + Send>;
type DoneFn = Box<dyn FnOnce(VerifyOutcome) + Send>;

pub struct VerifyJob {
    pub tor_id: TorrentId,
    pub priority: Priority,
    pub geometry: BlockInfo,
    pub files: FilePieceMap,
    pub dir: PathBuf,
    pub piece_hashes: Vec<[u8; 20]>,
    pub file_complete: Vec<bool>,
    pub progress: Option<ProgressFn>,
    pub done: DoneFn,
}

struct QueuedJob {
    job: VerifyJob,
    on_disk_size: u64,
}

struct State {
    queue: Vec<QueuedJob>,
    current: Option<(TorrentId, Arc<AtomicBool>)>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

pub struct VerifyWorker {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Default for VerifyWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl VerifyWorker {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: Vec::new(),
                current: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("verify".to_owned())
            .spawn(move || worker_loop(thread_shared))
            .expect("failed to spawn verify thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn add(&self, job: VerifyJob) {
        let on_disk_size = on_disk_size(&job);
        let mut state = self.shared.state.lock();
        debug!(tor_id = job.tor_id, on_disk_size, "queueing verify");
        state.queue.push(QueuedJob { job, on_disk_size });
        self.shared.cv.notify_all();
    }

    /// Cancel a queued or running verify. A queued entry fires its done
    /// callback with `aborted = true`; a running one is flagged and
    /// waited for.
    pub fn remove(&self, tor_id: TorrentId) {
        let mut state = self.shared.state.lock();
        if let Some(idx) = state.queue.iter().position(|q| q.job.tor_id == tor_id) {
            let queued = state.queue.swap_remove(idx);
            drop(state);
            let n_pieces = queued.job.geometry.n_pieces() as usize;
            (queued.job.done)(VerifyOutcome {
                tor_id,
                aborted: true,
                pieces: BF::repeat(false, n_pieces),
            });
            return;
        }
        let running = match &state.current {
            Some((current_id, flag)) if *current_id == tor_id => Some(flag.clone()),
            _ => None,
        };
        if let Some(flag) = running {
            flag.store(true, Ordering::Relaxed);
            while state
                .current
                .as_ref()
                .is_some_and(|(id, _)| *id == tor_id)
            {
                self.shared.cv.wait(&mut state);
            }
        }
    }
}

impl Drop for VerifyWorker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            if let Some((_, flag)) = &state.current {
                flag.store(true, Ordering::Relaxed);
            }
            self.shared.cv.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn on_disk_size(job: &VerifyJob) -> u64 {
    let disk = TorrentDisk {
        tor_id: job.tor_id,
        geometry: &job.geometry,
        files: &job.files,
        dir: &job.dir,
        prealloc: Preallocation::None,
        file_complete: &job.file_complete,
    };
    (0..job.files.len())
        .filter_map(|i| disk.find_file(i))
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (job, abort) = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                // highest priority first; among equals, smallest job
                let best = state
                    .queue
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, q)| (q.job.priority, std::cmp::Reverse(q.on_disk_size)))
                    .map(|(i, _)| i);
                match best {
                    Some(idx) => {
                        let queued = state.queue.swap_remove(idx);
                        let abort = Arc::new(AtomicBool::new(false));
                        state.current = Some((queued.job.tor_id, abort.clone()));
                        break (queued.job, abort);
                    }
                    None => shared.cv.wait(&mut state),
                }
            }
        };

        run_one(job, &abort);
        {
            let mut state = shared.state.lock();
            state.current = None;
            shared.cv.notify_all();
        }
    }
}

fn run_one(job: VerifyJob, abort: &AtomicBool) {
    let tor_id = job.tor_id;
    let n_pieces = job.geometry.n_pieces();
    let mut pieces = BF::repeat(false, n_pieces as usize);
    let mut cache = OpenFilesCache::new(8);
    let disk = TorrentDisk {
        tor_id,
        geometry: &job.geometry,
        files: &job.files,
        dir: &job.dir,
        prealloc: Preallocation::None,
        file_complete: &job.file_complete,
    };

    info!(tor_id, n_pieces, "verify started");
    let started = Instant::now();
    let mut slice_started = Instant::now();
    let mut aborted = false;
    let mut n_ok = 0u32;

    for piece in 0..n_pieces {
        if abort.load(Ordering::Relaxed) {
            aborted = true;
            break;
        }
        let expected = match job.piece_hashes.get(piece as usize) {
            Some(h) => h,
            None => {
                warn!(tor_id, piece, "missing piece hash");
                break;
            }
        };
        if disk.verify_piece(&mut cache, piece, expected) {
            pieces.set(piece as usize, true);
            n_ok += 1;
        }
        if let Some(progress) = &job.progress {
            progress((piece + 1) as f32 / n_pieces as f32);
        }
        // pacing: rest 100ms out of every second of hashing
        if slice_started.elapsed() >= WORK_SLICE {
            std::thread::sleep(SLICE_REST);
            slice_started = Instant::now();
        }
    }

    cache.close_all();
    info!(
        tor_id,
        n_ok,
        aborted,
        elapsed = ?started.elapsed(),
        "verify finished"
    );
    (job.done)(VerifyOutcome {
        tor_id,
        aborted,
        pieces,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        dir: PathBuf,
        geometry: BlockInfo,
        files: FilePieceMap,
        hashes: Vec<[u8; 20]>,
    }

    fn fixture_with_content(n_pieces: u32, corrupt_piece: Option<u32>) -> Fixture {
        let piece_size = 64u32;
        let total = (n_pieces * piece_size) as u64;
        let dir = tempfile::tempdir().unwrap();
        let files = FilePieceMap::new([("data.bin".to_owned(), total)]);
        let geometry = BlockInfo::new(total, piece_size);

        let mut content: Vec<u8> = (0..total).map(|i| (i % 253) as u8).collect();
        let hashes: Vec<[u8; 20]> = (0..n_pieces)
            .map(|p| {
                let s = (p * piece_size) as usize;
                cryptow::sha1_many(&[&content[s..s + piece_size as usize]])
            })
            .collect();
        if let Some(p) = corrupt_piece {
            content[(p * piece_size) as usize] ^= 0xff;
        }
        std::fs::write(dir.path().join("data.bin"), &content).unwrap();

        Fixture {
            dir: dir.path().to_owned(),
            _dir: dir,
            geometry,
            files,
            hashes,
        }
    }

    fn job_for(fx: &Fixture, done: DoneFn) -> VerifyJob {
        VerifyJob {
            tor_id: 1,
            priority: Priority::Normal,
            geometry: fx.geometry,
            files: fx.files.clone(),
            dir: fx.dir.clone(),
            piece_hashes: fx.hashes.clone(),
            file_complete: vec![true],
            progress: None,
            done,
        }
    }

    #[test]
    fn test_verify_all_good() {
        let fx = fixture_with_content(4, None);
        let worker = VerifyWorker::new();
        let (tx, rx) = mpsc::channel();
        worker.add(job_for(
            &fx,
            Box::new(move |outcome| {
                tx.send(outcome).unwrap();
            }),
        ));
        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!outcome.aborted);
        assert!(outcome.pieces.all());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let fx = fixture_with_content(4, Some(2));
        let worker = VerifyWorker::new();
        let (tx, rx) = mpsc::channel();
        worker.add(job_for(
            &fx,
            Box::new(move |outcome| {
                tx.send(outcome).unwrap();
            }),
        ));
        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let bad: Vec<usize> = outcome.pieces.iter_zeros().collect();
        assert_eq!(bad, vec![2]);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let fx = fixture_with_content(8, None);
        let worker = VerifyWorker::new();
        let (tx, rx) = mpsc::channel();
        let progress = Arc::new(Mutex::new(Vec::<f32>::new()));
        let progress2 = progress.clone();
        let mut job = job_for(
            &fx,
            Box::new(move |outcome| {
                tx.send(outcome).unwrap();
            }),
        );
        job.progress = Some(Box::new(move |f| progress2.lock().push(f)));
        worker.add(job);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let values = progress.lock();
        assert_eq!(values.len(), 8);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*values.last().unwrap(), 1.0);
    }

    #[test]
    fn test_remove_queued_fires_aborted() {
        // removing a job must deliver exactly one outcome whether it
        // was still queued (aborted=true) or had already run
        let fx1 = fixture_with_content(64, None);
        let fx2 = fixture_with_content(4, None);
        let worker = VerifyWorker::new();

        let (tx1, _rx1) = mpsc::channel();
        let mut job1 = job_for(
            &fx1,
            Box::new(move |o| {
                let _ = tx1.send(o);
            }),
        );
        job1.tor_id = 1;
        let (tx2, rx2) = mpsc::channel();
        let mut job2 = job_for(
            &fx2,
            Box::new(move |o| {
                let _ = tx2.send(o);
            }),
        );
        job2.tor_id = 2;

        worker.add(job1);
        worker.add(job2);
        worker.remove(2);
        // either it was still queued (classic case) or had already run;
        // removal must deliver exactly one outcome either way
        let outcome = rx2.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(outcome.tor_id, 2);
    }

    #[test]
    fn test_priority_orders_queue() {
        // hold the worker inside the first job (its progress callback
        // blocks), queue a low- and a high-priority job, release, and
        // check the high one completed first
        let fx_busy = fixture_with_content(2, None);
        let fx_low = fixture_with_content(2, None);
        let fx_high = fixture_with_content(2, None);
        let worker = VerifyWorker::new();

        let (order_tx, order_rx) = mpsc::channel::<TorrentId>();
        let mk = |id: TorrentId, tx: mpsc::Sender<TorrentId>, fx: &Fixture| {
            let mut j = job_for(
                fx,
                Box::new(move |o| {
                    let _ = tx.send(o.tor_id);
                }),
            );
            j.tor_id = id;
            j
        };

        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let gate_passed = AtomicBool::new(false);
        let mut busy = mk(10, order_tx.clone(), &fx_busy);
        busy.progress = Some(Box::new(move |_| {
            if !gate_passed.swap(true, Ordering::SeqCst) {
                let _ = started_tx.send(());
                let _ = release_rx.lock().recv_timeout(Duration::from_secs(20));
            }
        }));
        worker.add(busy);
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let mut low = mk(11, order_tx.clone(), &fx_low);
        low.priority = Priority::Low;
        let mut high = mk(12, order_tx.clone(), &fx_high);
        high.priority = Priority::High;
        worker.add(low);
        worker.add(high);
        release_tx.send(()).unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(order_rx.recv_timeout(Duration::from_secs(20)).unwrap());
        }
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(12) < pos(11), "high priority ran after low: {order:?}");
    }
}
