//! Off-thread relocation of a torrent's on-disk files, with per-torrent
//! cancellation. Jobs run one at a time, lowest torrent id first.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use riptide_core::sanitize::is_junk_file;
use tracing::{debug, info, warn};

use crate::torrent::TorrentId;

pub trait RelocateEvents: Send + Sync {
    fn on_started(&self, _tor_id: TorrentId) {}
    fn on_done(&self, _tor_id: TorrentId, _aborted: bool, _error: Option<String>) {}
}

impl RelocateEvents for () {}

pub struct RelocateJob {
    pub tor_id: TorrentId,
    pub old_dir: PathBuf,
    pub new_dir: PathBuf,
    /// Subpaths relative to both roots; files absent at the old
    /// location are skipped (they may simply not exist yet).
    pub subpaths: Vec<String>,
}

struct State {
    queue: BTreeMap<TorrentId, RelocateJob>,
    current: Option<(TorrentId, Arc<AtomicBool>)>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
    events: Box<dyn RelocateEvents>,
}

pub struct RelocateWorker {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RelocateWorker {
    pub fn new(events: Box<dyn RelocateEvents>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: BTreeMap::new(),
                current: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
            events,
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("relocate".to_owned())
            .spawn(move || worker_loop(thread_shared))
            .expect("failed to spawn relocate thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn add(&self, job: RelocateJob) {
        let mut state = self.shared.state.lock();
        state.queue.insert(job.tor_id, job);
        self.shared.cv.notify_all();
    }

    /// Drop a queued job or flag the running one; the worker checks the
    /// flag between files.
    pub fn remove(&self, tor_id: TorrentId) {
        let mut state = self.shared.state.lock();
        if state.queue.remove(&tor_id).is_some() {
            return;
        }
        if let Some((current_id, flag)) = &state.current {
            if *current_id == tor_id {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for RelocateWorker {
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

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (job, abort) = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                // lowest torrent id first
                if let Some(tor_id) = state.queue.keys().next().copied() {
                    let job = state.queue.remove(&tor_id).unwrap();
                    let abort = Arc::new(AtomicBool::new(false));
                    state.current = Some((tor_id, abort.clone()));
                    break (job, abort);
                }
                shared.cv.wait(&mut state);
            }
        };

        let tor_id = job.tor_id;
        shared.events.on_started(tor_id);
        let result = run_one(&job, &abort);
        let aborted = abort.load(Ordering::Relaxed);
        {
            let mut state = shared.state.lock();
            state.current = None;
            shared.cv.notify_all();
        }
        shared
            .events
            .on_done(tor_id, aborted, result.err().map(|e| format!("{e:#}")));
    }
}

/// Atomic rename when the filesystems allow it, copy + unlink when they
/// don't.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(?from, ?to, "rename failed ({e}), copying");
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
    }
}

fn run_one(job: &RelocateJob, abort: &AtomicBool) -> io::Result<()> {
    info!(
        tor_id = job.tor_id,
        from = ?job.old_dir,
        to = ?job.new_dir,
        "relocating"
    );
    std::fs::create_dir_all(&job.new_dir)?;

    for subpath in &job.subpaths {
        if abort.load(Ordering::Relaxed) {
            debug!(tor_id = job.tor_id, "relocate cancelled");
            return Ok(());
        }
        // both the final and the partial name may exist at the source
        for candidate in [subpath.clone(), format!("{subpath}.part")] {
            let from = job.old_dir.join(&candidate);
            if !from.is_file() {
                continue;
            }
            let to = job.new_dir.join(&candidate);
            move_file(&from, &to)?;
        }
    }

    cleanup_empty_dirs(&job.old_dir);
    Ok(())
}

// Remove junk files, then empty directories, deepest first. The old
// root itself goes too if nothing is left.
fn cleanup_empty_dirs(root: &Path) {
    if !root.is_dir() {
        return;
    }
    for entry in walkdir::WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            if is_junk_file(&name) {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(?path, "couldn't remove junk file: {e}");
                }
            }
        } else if entry.file_type().is_dir() {
            // fails (and is left alone) unless actually empty
            let _ = std::fs::remove_dir(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct ChannelEvents {
        tx: Mutex<mpsc::Sender<(TorrentId, bool, Option<String>)>>,
    }

    impl RelocateEvents for ChannelEvents {
        fn on_done(&self, tor_id: TorrentId, aborted: bool, error: Option<String>) {
            let _ = self.tx.lock().send((tor_id, aborted, error));
        }
    }

    fn worker_with_events() -> (
        RelocateWorker,
        mpsc::Receiver<(TorrentId, bool, Option<String>)>,
    ) {
        let (tx, rx) = mpsc::channel();
        let worker = RelocateWorker::new(Box::new(ChannelEvents { tx: Mutex::new(tx) }));
        (worker, rx)
    }

    #[test]
    fn test_files_move_and_old_tree_gets_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old");
        let new = tmp.path().join("new");
        std::fs::create_dir_all(old.join("t/sub")).unwrap();
        std::fs::write(old.join("t/a.bin"), b"aaa").unwrap();
        std::fs::write(old.join("t/sub/b.bin"), b"bbb").unwrap();
        std::fs::write(old.join("t/sub/.DS_Store"), b"junk").unwrap();

        let (worker, rx) = worker_with_events();
        worker.add(RelocateJob {
            tor_id: 1,
            old_dir: old.clone(),
            new_dir: new.clone(),
            subpaths: vec!["t/a.bin".into(), "t/sub/b.bin".into()],
        });

        let (id, aborted, error) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(id, 1);
        assert!(!aborted);
        assert_eq!(error, None);

        assert_eq!(std::fs::read(new.join("t/a.bin")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(new.join("t/sub/b.bin")).unwrap(), b"bbb");
        // junk removed, empty tree removed
        assert!(!old.exists());
    }

    #[test]
    fn test_partial_files_move_too() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old");
        let new = tmp.path().join("new");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::write(old.join("a.bin.part"), b"partial").unwrap();

        let (worker, rx) = worker_with_events();
        worker.add(RelocateJob {
            tor_id: 2,
            old_dir: old,
            new_dir: new.clone(),
            subpaths: vec!["a.bin".into()],
        });
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(std::fs::read(new.join("a.bin.part")).unwrap(), b"partial");
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old");
        std::fs::create_dir_all(&old).unwrap();
        let (worker, rx) = worker_with_events();
        worker.add(RelocateJob {
            tor_id: 3,
            old_dir: old,
            new_dir: tmp.path().join("new"),
            subpaths: vec!["never-downloaded.bin".into()],
        });
        let (_, aborted, error) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!aborted);
        assert_eq!(error, None);
    }

    #[test]
    fn test_jobs_run_in_torrent_id_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mk = |name: &str| {
            let d = tmp.path().join(name);
            std::fs::create_dir_all(&d).unwrap();
            d
        };
        let (worker, rx) = worker_with_events();
        // add out of order; the queue is keyed by torrent id
        for id in [5u32, 2, 9] {
            worker.add(RelocateJob {
                tor_id: id,
                old_dir: mk(&format!("old{id}")),
                new_dir: tmp.path().join(format!("new{id}")),
                subpaths: vec![],
            });
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv_timeout(Duration::from_secs(10)).unwrap().0);
        }
        // the first pop can race the later adds, but everything after
        // it must come out in torrent-id order
        assert!(seen[1..].windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        let mut all = seen.clone();
        all.sort_unstable();
        assert_eq!(all, vec![2, 5, 9]);
    }
}
