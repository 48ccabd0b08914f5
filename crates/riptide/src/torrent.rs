use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use riptide_core::metainfo::Metainfo;
use tracing::debug;

use crate::BF;

pub type TorrentId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Activity {
    #[default]
    Stopped,
    CheckWait,
    Check,
    DownloadWait,
    Download,
    SeedWait,
    Seed,
}

impl Activity {
    pub fn is_active(&self) -> bool {
        !matches!(self, Activity::Stopped)
    }

    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            Activity::CheckWait | Activity::DownloadWait | Activity::SeedWait
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    #[default]
    None,
    TrackerWarning,
    TrackerError,
    LocalError,
}

#[derive(Debug, Clone, Default)]
pub struct TorrentError {
    pub kind: ErrorKind,
    pub announce_url: Option<String>,
    pub message: String,
}

/// An all-time and a this-session count, kept together so both update
/// in one place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounter {
    pub ever: u64,
    pub this_session: u64,
}

impl TransferCounter {
    pub fn add(&mut self, bytes: u64) {
        self.ever += bytes;
        self.this_session += bytes;
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The mutable aggregate state of one torrent. The session exclusively
/// owns these; everything else holds a [`TorrentId`] and asks the
/// session to resolve it.
#[derive(Debug)]
pub struct Torrent {
    pub id: TorrentId,
    pub metainfo: Metainfo,

    pub completion: BF,
    pub have_blocks: BF,
    pub checked: BF,
    pub file_mtimes: Vec<Option<u64>>,

    pub activity: Activity,
    pub queue_position: usize,
    pub priority: Priority,
    /// Set when the user asked to start while a check was pending.
    pub start_when_verified: bool,
    /// Seed limits were reached (as opposed to a manual stop).
    pub is_finished: bool,

    pub download_dir: PathBuf,
    pub incomplete_dir: Option<PathBuf>,

    pub uploaded: TransferCounter,
    pub downloaded: TransferCounter,
    pub corrupt: TransferCounter,

    pub error: TorrentError,
    pub labels: Vec<Arc<str>>,
    pub bandwidth_group: Option<Arc<str>>,

    /// Needs its resume file rewritten.
    pub dirty: bool,

    pub date_added: u64,
    pub date_started: u64,
    pub date_active: u64,
    pub date_done: u64,
    pub date_edited: u64,
    pub date_changed: u64,

    pub seconds_seeding_before_current_start: Duration,
    pub seconds_downloading_before_current_start: Duration,
    /// When the current activity span began, for the duration counters.
    pub current_span_started: u64,

    pub seed_ratio_limit: Option<f64>,
    pub idle_seconds_limit: Option<u64>,
    /// Peers discovered by the announcer, awaiting pickup by the
    /// peer-wire machinery.
    pub peer_candidates: Vec<std::net::SocketAddr>,
    pub seconds_idle: u64,
}

impl Torrent {
    pub fn new(id: TorrentId, metainfo: Metainfo, download_dir: PathBuf) -> Self {
        let n_pieces = metainfo.block_info.n_pieces() as usize;
        let n_blocks = metainfo.block_info.n_blocks() as usize;
        let now = now_unix();
        Self {
            id,
            completion: BF::repeat(false, n_pieces),
            have_blocks: BF::repeat(false, n_blocks),
            checked: BF::repeat(false, n_pieces),
            file_mtimes: vec![None; metainfo.files.len()],
            metainfo,
            activity: Activity::Stopped,
            queue_position: 0,
            priority: Priority::Normal,
            start_when_verified: false,
            is_finished: false,
            download_dir,
            incomplete_dir: None,
            uploaded: Default::default(),
            downloaded: Default::default(),
            corrupt: Default::default(),
            error: Default::default(),
            labels: Vec::new(),
            bandwidth_group: None,
            dirty: true,
            date_added: now,
            date_started: 0,
            date_active: 0,
            date_done: 0,
            date_edited: 0,
            date_changed: now,
            seconds_seeding_before_current_start: Duration::ZERO,
            seconds_downloading_before_current_start: Duration::ZERO,
            current_span_started: 0,
            seed_ratio_limit: None,
            idle_seconds_limit: None,
            peer_candidates: Vec::new(),
            seconds_idle: 0,
        }
    }

    pub fn info_hash_str(&self) -> String {
        self.metainfo.info_hash_str()
    }

    pub fn n_pieces(&self) -> u32 {
        self.metainfo.block_info.n_pieces()
    }

    pub fn have_piece_count(&self) -> u32 {
        self.completion.count_ones() as u32
    }

    pub fn have_bytes(&self) -> u64 {
        let geometry = &self.metainfo.block_info;
        self.completion
            .iter_ones()
            .map(|p| geometry.piece_size_of(p as u32) as u64)
            .sum()
    }

    pub fn is_done(&self) -> bool {
        self.n_pieces() > 0 && self.completion.all()
    }

    /// Whether every piece of the file has been downloaded.
    pub fn file_is_complete(&self, file_index: usize) -> bool {
        match self
            .metainfo
            .files
            .pieces_for_file(file_index, &self.metainfo.block_info)
        {
            Some(range) => range.into_iter().all(|p| self.completion[p as usize]),
            None => false,
        }
    }

    pub fn file_complete_flags(&self) -> Vec<bool> {
        (0..self.metainfo.files.len())
            .map(|i| self.file_is_complete(i))
            .collect()
    }

    /// Where this torrent's content currently lives: incomplete
    /// torrents use the incomplete dir when one is configured.
    pub fn current_dir(&self) -> &Path {
        match (&self.incomplete_dir, self.is_done()) {
            (Some(dir), false) => dir,
            _ => &self.download_dir,
        }
    }

    fn set_activity(&mut self, activity: Activity) {
        if self.activity == activity {
            return;
        }
        debug!(
            id = self.id,
            from = ?self.activity,
            to = ?activity,
            "activity change"
        );
        let now = now_unix();
        // bank the finished span's duration
        match self.activity {
            Activity::Seed if self.current_span_started > 0 => {
                self.seconds_seeding_before_current_start +=
                    Duration::from_secs(now.saturating_sub(self.current_span_started));
            }
            Activity::Download if self.current_span_started > 0 => {
                self.seconds_downloading_before_current_start +=
                    Duration::from_secs(now.saturating_sub(self.current_span_started));
            }
            _ => {}
        }
        self.activity = activity;
        self.current_span_started = now;
        self.date_changed = now;
        self.dirty = true;
        match activity {
            Activity::Download | Activity::Seed => {
                self.date_started = now;
                self.date_active = now;
            }
            _ => {}
        }
    }

    /// User-requested start. `queue_full` states whether the relevant
    /// direction's queue has a free slot.
    pub fn start(&mut self, queue_full: bool) {
        if self.activity != Activity::Stopped {
            return;
        }
        self.is_finished = false;
        self.error = Default::default();
        let target = match (self.is_done(), queue_full) {
            (true, true) => Activity::SeedWait,
            (true, false) => Activity::Seed,
            (false, true) => Activity::DownloadWait,
            (false, false) => Activity::Download,
        };
        self.set_activity(target);
    }

    /// A queue slot freed up; promote out of the wait state.
    pub fn promote_from_wait(&mut self) {
        match self.activity {
            Activity::DownloadWait => self.set_activity(Activity::Download),
            Activity::SeedWait => self.set_activity(Activity::Seed),
            _ => {}
        }
    }

    pub fn stop(&mut self) {
        self.start_when_verified = false;
        self.set_activity(Activity::Stopped);
    }

    /// A local IO failure: record it and stop.
    pub fn set_local_error(&mut self, message: impl Into<String>) {
        self.error = TorrentError {
            kind: ErrorKind::LocalError,
            announce_url: None,
            message: message.into(),
        };
        self.set_activity(Activity::Stopped);
    }

    pub fn set_tracker_error(&mut self, announce_url: &str, message: &str) {
        // a tracker problem never stops the torrent
        self.error = TorrentError {
            kind: ErrorKind::TrackerError,
            announce_url: Some(announce_url.to_owned()),
            message: message.to_owned(),
        };
    }

    pub fn set_tracker_warning(&mut self, announce_url: &str, message: &str) {
        self.error = TorrentError {
            kind: ErrorKind::TrackerWarning,
            announce_url: Some(announce_url.to_owned()),
            message: message.to_owned(),
        };
    }

    pub fn clear_error(&mut self) {
        self.error = Default::default();
    }

    /// Move into the verify pipeline.
    pub fn begin_check_wait(&mut self) {
        self.start_when_verified = self.activity.is_active() || self.start_when_verified;
        self.set_activity(Activity::CheckWait);
    }

    pub fn begin_check(&mut self) {
        self.set_activity(Activity::Check);
    }

    /// Verify finished: settle into the state the new completion
    /// implies.
    pub fn finish_check(&mut self, queue_full: bool) {
        self.set_activity(Activity::Stopped);
        if self.start_when_verified {
            self.start_when_verified = false;
            self.start(queue_full);
        }
    }

    /// A piece finished downloading and hashed correctly.
    pub fn on_piece_completed(&mut self, piece: u32) {
        let idx = piece as usize;
        if idx >= self.completion.len() || self.completion[idx] {
            return;
        }
        self.completion.set(idx, true);
        self.checked.set(idx, true);
        for b in self.metainfo.block_info.blocks_spanning_piece(piece) {
            self.have_blocks.set(b as usize, true);
        }
        self.date_active = now_unix();
        self.dirty = true;
        if self.is_done() {
            self.date_done = now_unix();
            if self.activity == Activity::Download {
                self.set_activity(Activity::Seed);
            }
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        if self.downloaded.ever == 0 {
            return None;
        }
        Some(self.uploaded.ever as f64 / self.downloaded.ever as f64)
    }

    /// Check seed-ratio and idle limits; stopping for either sets the
    /// finished flag.
    pub fn maybe_finish_seeding(&mut self) -> bool {
        if self.activity != Activity::Seed {
            return false;
        }
        let ratio_reached = match (self.seed_ratio_limit, self.ratio()) {
            (Some(limit), Some(ratio)) => ratio >= limit,
            _ => false,
        };
        let idle_reached = match self.idle_seconds_limit {
            Some(limit) => self.seconds_idle >= limit,
            None => false,
        };
        if ratio_reached || idle_reached {
            debug!(id = self.id, ratio_reached, idle_reached, "seeding finished");
            self.set_activity(Activity::Stopped);
            self.is_finished = true;
            return true;
        }
        false
    }
}
