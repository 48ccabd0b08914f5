//! Watch a directory for newly-appearing files. Candidates go through a
//! user predicate; `Retry` reschedules the file after a debounce pause
//! so half-written files get a second look.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::Watcher;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Accept,
    Reject,
    /// The file looked incomplete; test it again after the debounce
    /// interval.
    Retry,
}

const MAX_RETRIES: u32 = 3;

pub type WatchCallback = Arc<dyn Fn(&Path) -> WatchAction + Send + Sync>;

struct Pending {
    path: PathBuf,
    attempt: u32,
    due: Instant,
}

enum Message {
    Candidate(PathBuf),
    Shutdown,
}

pub struct Watchdir {
    tx: mpsc::Sender<Message>,
    thread: Option<std::thread::JoinHandle<()>>,
    // keeps filesystem notifications alive
    _watcher: notify::RecommendedWatcher,
}

impl Watchdir {
    /// Watch `dir`, feeding every appearing file to `callback`.
    /// Pre-existing files are scanned once at startup.
    pub fn start(
        dir: &Path,
        callback: WatchCallback,
        retry_interval: Duration,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();

        let watch_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |ev: notify::Result<notify::Event>| {
            let ev = match ev {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("watch event error: {e:#}");
                    return;
                }
            };
            match ev.kind {
                notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {}
                other => {
                    trace!(kind = ?other, "ignoring event");
                    return;
                }
            }
            for path in ev.paths {
                let _ = watch_tx.send(Message::Candidate(path));
            }
        })?;
        watcher.watch(dir, notify::RecursiveMode::NonRecursive)?;

        // catch files that appeared before the watch was set up
        for entry in walkdir::WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let _ = tx.send(Message::Candidate(entry.path().to_owned()));
        }

        let thread = std::thread::Builder::new()
            .name("watchdir".to_owned())
            .spawn(move || worker_loop(rx, callback, retry_interval))
            .expect("failed to spawn watchdir thread");

        Ok(Self {
            tx,
            thread: Some(thread),
            _watcher: watcher,
        })
    }
}

impl Drop for Watchdir {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn worker_loop(rx: mpsc::Receiver<Message>, callback: WatchCallback, retry_interval: Duration) {
    let mut pending: Vec<Pending> = Vec::new();

    loop {
        // wake up for the next retry even if the watcher is quiet
        let timeout = pending
            .iter()
            .map(|p| p.due.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(Duration::from_secs(60));

        match rx.recv_timeout(timeout) {
            Ok(Message::Candidate(path)) => {
                // a burst of Modify events for one file collapses into
                // the already-pending entry
                if !pending.iter().any(|p| p.path == path) {
                    process(&callback, &mut pending, path, 0, retry_interval);
                }
            }
            Ok(Message::Shutdown) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        let due: Vec<Pending> = {
            let (due, rest) = pending.drain(..).partition(|p| p.due <= now);
            pending = rest;
            due
        };
        for p in due {
            process(&callback, &mut pending, p.path, p.attempt, retry_interval);
        }
    }
}

fn process(
    callback: &WatchCallback,
    pending: &mut Vec<Pending>,
    path: PathBuf,
    attempt: u32,
    retry_interval: Duration,
) {
    match callback(&path) {
        WatchAction::Accept => {
            debug!(?path, "accepted");
        }
        WatchAction::Reject => {
            trace!(?path, "rejected");
        }
        WatchAction::Retry => {
            if attempt + 1 > MAX_RETRIES {
                debug!(?path, "giving up after {MAX_RETRIES} retries");
                return;
            }
            trace!(?path, attempt, "retrying later");
            pending.push(Pending {
                path,
                attempt: attempt + 1,
                due: Instant::now() + retry_interval,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_preexisting_files_are_scanned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pre.torrent"), b"x").unwrap();

        let seen = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
        let seen2 = seen.clone();
        let _w = Watchdir::start(
            dir.path(),
            Arc::new(move |p: &Path| {
                seen2.lock().push(p.to_owned());
                WatchAction::Accept
            }),
            Duration::from_millis(50),
        )
        .unwrap();

        assert!(wait_for(
            || seen.lock().iter().any(|p| p.ends_with("pre.torrent")),
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn test_new_files_are_noticed() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(0usize));
        let seen2 = seen.clone();
        let _w = Watchdir::start(
            dir.path(),
            Arc::new(move |_: &Path| {
                *seen2.lock() += 1;
                WatchAction::Accept
            }),
            Duration::from_millis(50),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        std::fs::write(dir.path().join("new.torrent"), b"x").unwrap();
        assert!(wait_for(|| *seen.lock() > 0, Duration::from_secs(5)));
    }

    #[test]
    fn test_retry_reinvokes_until_accept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("growing.torrent"), b"x").unwrap();

        let calls = Arc::new(Mutex::new(0u32));
        let calls2 = calls.clone();
        let _w = Watchdir::start(
            dir.path(),
            Arc::new(move |_: &Path| {
                let mut n = calls2.lock();
                *n += 1;
                if *n < 3 {
                    WatchAction::Retry
                } else {
                    WatchAction::Accept
                }
            }),
            Duration::from_millis(30),
        )
        .unwrap();

        assert!(wait_for(|| *calls.lock() >= 3, Duration::from_secs(5)));
    }

    #[test]
    fn test_retry_gives_up_eventually() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("never.torrent"), b"x").unwrap();

        let calls = Arc::new(Mutex::new(0u32));
        let calls2 = calls.clone();
        let _w = Watchdir::start(
            dir.path(),
            Arc::new(move |_: &Path| {
                *calls2.lock() += 1;
                WatchAction::Retry
            }),
            Duration::from_millis(10),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(500));
        let n = *calls.lock();
        // initial test + bounded retries
        assert!(n >= 1 && n <= 1 + MAX_RETRIES, "called {n} times");
    }
}
