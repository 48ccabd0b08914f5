use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::{bail, Context};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use riptide_core::magnet::Magnet;
use riptide_core::metainfo::Metainfo;
use riptide_core::peer_id::generate_peer_id;
use riptide_core::Id20;
use tracing::{debug, error_span, info, warn, Instrument};
use tracker_comms::{
    AnnounceStats, Announcer, AnnouncerConfig, TorrentState, TorrentStatsProvider,
    TrackerClients, TrackerEventSink,
};

use crate::blocklist::Blocklist;
use crate::disk_io::PARTIAL_SUFFIX;
use crate::limits::BandwidthLimiter;
use crate::open_files::{OpenFilesCache, Preallocation};
use crate::relocate::{RelocateEvents, RelocateJob, RelocateWorker};
use crate::resume;
use crate::torrent::{Activity, ErrorKind, Torrent, TorrentId};
use crate::verify::{VerifyJob, VerifyOutcome, VerifyWorker};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub download_dir: PathBuf,
    pub incomplete_dir: Option<PathBuf>,
    pub resume_dir: PathBuf,
    pub peer_port: u16,
    pub prealloc: Preallocation,
    pub announce_ip: Option<IpAddr>,
    pub queue_enabled: bool,
    pub download_queue_size: usize,
    pub seed_queue_size: usize,
    pub seed_ratio_limit: Option<f64>,
    pub idle_seconds_limit: Option<u64>,
}

impl SessionConfig {
    pub fn new(download_dir: PathBuf) -> Self {
        let resume_dir = download_dir.join(".resume");
        Self {
            download_dir,
            incomplete_dir: None,
            resume_dir,
            peer_port: 51413,
            prealloc: Preallocation::Sparse,
            announce_ip: None,
            queue_enabled: false,
            download_queue_size: 5,
            seed_queue_size: 10,
            seed_ratio_limit: None,
            idle_seconds_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionStats {
    pub torrent_count: usize,
    pub active_torrent_count: usize,
    pub paused_torrent_count: usize,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub seconds_active: u64,
}

pub enum AddTorrent {
    TorrentBytes(Vec<u8>),
    TorrentPath(PathBuf),
    Magnet(String),
}

#[derive(Default)]
pub struct AddTorrentOptions {
    pub paused: bool,
    pub download_dir: Option<PathBuf>,
    pub labels: Vec<String>,
}

/// The session: owns every torrent and all the shared machinery around
/// them. External holders keep [`TorrentId`]s and resolve on demand.
pub struct Session {
    config: RwLock<SessionConfig>,
    torrents: DashMap<TorrentId, Arc<RwLock<Torrent>>>,
    next_id: AtomicU32,

    pub(crate) open_files: Mutex<OpenFilesCache>,
    verify: VerifyWorker,
    relocate: RelocateWorker,
    tracker_clients: Arc<TrackerClients>,
    blocklist: RwLock<Blocklist>,
    pub limiter: BandwidthLimiter,
    peer_id: Id20,
    started_at: Instant,
    announcers: DashMap<TorrentId, tokio::task::JoinHandle<()>>,
    weak_self: Weak<Session>,
}

struct StatsAdapter {
    torrent: Arc<RwLock<Torrent>>,
}

impl TorrentStatsProvider for StatsAdapter {
    fn get(&self) -> AnnounceStats {
        let t = self.torrent.read();
        AnnounceStats {
            uploaded_bytes: t.uploaded.this_session,
            downloaded_bytes: t.downloaded.this_session,
            corrupt_bytes: t.corrupt.this_session,
            total_bytes: t.metainfo.block_info.total_size(),
            torrent_state: match t.activity {
                Activity::Stopped => TorrentState::Paused,
                Activity::Check | Activity::CheckWait => TorrentState::Initializing,
                _ => TorrentState::Live,
            },
            is_partial_seed: false,
        }
    }
}

struct TrackerEventsAdapter {
    torrent: Arc<RwLock<Torrent>>,
}

impl TrackerEventSink for TrackerEventsAdapter {
    fn on_success(&self, _announce_url: &str) {
        let mut t = self.torrent.write();
        if matches!(
            t.error.kind,
            ErrorKind::TrackerError | ErrorKind::TrackerWarning
        ) {
            t.clear_error();
        }
    }

    fn on_warning(&self, announce_url: &str, message: &str) {
        self.torrent.write().set_tracker_warning(announce_url, message);
    }

    fn on_error(&self, announce_url: &str, message: &str) {
        self.torrent.write().set_tracker_error(announce_url, message);
    }
}

struct RelocateEventsAdapter {
    session: Weak<Session>,
}

impl RelocateEvents for RelocateEventsAdapter {
    fn on_done(&self, tor_id: TorrentId, aborted: bool, error: Option<String>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.on_relocate_done(tor_id, aborted, error);
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> anyhow::Result<Arc<Session>> {
        std::fs::create_dir_all(&config.download_dir)
            .with_context(|| format!("creating {:?}", config.download_dir))?;
        std::fs::create_dir_all(&config.resume_dir)
            .with_context(|| format!("creating {:?}", config.resume_dir))?;

        let session = Arc::new_cyclic(|weak: &Weak<Session>| Session {
            config: RwLock::new(config),
            torrents: DashMap::new(),
            next_id: AtomicU32::new(1),
            open_files: Mutex::new(OpenFilesCache::default()),
            verify: VerifyWorker::new(),
            relocate: RelocateWorker::new(Box::new(RelocateEventsAdapter {
                session: weak.clone(),
            })),
            tracker_clients: Arc::new(TrackerClients::new()),
            blocklist: RwLock::new(Blocklist::empty()),
            limiter: BandwidthLimiter::new(),
            peer_id: generate_peer_id(),
            started_at: Instant::now(),
            announcers: DashMap::new(),
            weak_self: weak.clone(),
        });
        info!(peer_id = ?session.peer_id, "session created");
        Ok(session)
    }

    pub fn config(&self) -> SessionConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut SessionConfig)) {
        f(&mut self.config.write());
    }

    pub fn peer_id(&self) -> Id20 {
        self.peer_id
    }

    pub fn resolve(&self, id: TorrentId) -> Option<Arc<RwLock<Torrent>>> {
        self.torrents.get(&id).map(|t| t.value().clone())
    }

    pub fn find_by_info_hash(&self, hash: &Id20) -> Option<TorrentId> {
        self.torrents
            .iter()
            .find(|e| e.value().read().metainfo.info_hash == *hash)
            .map(|e| *e.key())
    }

    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        let mut ids: Vec<TorrentId> = self.torrents.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    // --- add / remove ---

    pub fn add_torrent(
        &self,
        source: AddTorrent,
        options: AddTorrentOptions,
    ) -> anyhow::Result<TorrentId> {
        let metainfo = match source {
            AddTorrent::TorrentBytes(buf) => Metainfo::from_torrent_bytes(&buf)?,
            AddTorrent::TorrentPath(path) => {
                let buf = std::fs::read(&path).with_context(|| format!("reading {path:?}"))?;
                Metainfo::from_torrent_bytes(&buf)?
            }
            AddTorrent::Magnet(text) => {
                let magnet = Magnet::parse(&text)?;
                Metainfo::from_magnet(&magnet)
            }
        };

        if let Some(existing) = self.find_by_info_hash(&metainfo.info_hash) {
            bail!("torrent already in session with id {existing}");
        }

        let config = self.config();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let download_dir = options.download_dir.unwrap_or(config.download_dir);
        let mut torrent = Torrent::new(id, metainfo, download_dir);
        torrent.incomplete_dir = config.incomplete_dir;
        torrent.seed_ratio_limit = config.seed_ratio_limit;
        torrent.idle_seconds_limit = config.idle_seconds_limit;
        torrent.labels = options.labels.iter().map(|l| Arc::from(l.as_str())).collect();
        torrent.queue_position = self.torrents.len();

        let resumed = resume::load(&config.resume_dir, &mut torrent);
        debug!(id, name = %torrent.metainfo.name, resumed, "torrent added");

        self.torrents.insert(id, Arc::new(RwLock::new(torrent)));
        self.renumber_queue();

        if !options.paused {
            self.start_torrent(id)?;
        }
        Ok(id)
    }

    pub fn remove_torrent(&self, id: TorrentId, delete_data: bool) -> anyhow::Result<()> {
        let torrent = self.resolve(id).context("no such torrent")?;
        self.verify.remove(id);
        self.relocate.remove(id);
        self.stop_announcer(id);
        self.open_files.lock().close_torrent(id);

        let (hash_str, paths): (String, Vec<PathBuf>) = {
            let t = torrent.read();
            let dir = t.current_dir().to_owned();
            (
                t.info_hash_str(),
                t.metainfo
                    .files
                    .iter()
                    .flat_map(|f| {
                        [
                            dir.join(&f.subpath),
                            dir.join(format!("{}{PARTIAL_SUFFIX}", f.subpath)),
                        ]
                    })
                    .collect(),
            )
        };
        resume::remove(&self.config().resume_dir, &hash_str);
        self.torrents.remove(&id);
        self.renumber_queue();
        self.promote_queue();

        if delete_data {
            for p in paths {
                if p.is_file() {
                    if let Err(e) = std::fs::remove_file(&p) {
                        warn!(?p, "couldn't delete: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    // --- start / stop ---

    pub fn start_torrent(&self, id: TorrentId) -> anyhow::Result<()> {
        let torrent = self.resolve(id).context("no such torrent")?;
        // queue occupancy is computed before taking the write lock;
        // counting read-locks every torrent, this one included
        let is_done = torrent.read().is_done();
        let queue_full = self.queue_full_for(is_done);
        {
            let mut t = torrent.write();
            if t.activity != Activity::Stopped {
                return Ok(());
            }
            t.start(queue_full);
        }
        if torrent.read().activity.is_active() && !torrent.read().activity.is_queued() {
            self.spawn_announcer(id, &torrent);
        }
        self.save_resume(id);
        Ok(())
    }

    pub fn stop_torrent(&self, id: TorrentId) -> anyhow::Result<()> {
        let torrent = self.resolve(id).context("no such torrent")?;
        torrent.write().stop();
        self.stop_announcer(id);
        self.open_files.lock().close_torrent(id);
        self.save_resume(id);
        self.promote_queue();
        Ok(())
    }

    fn count_active(&self, seeding: bool) -> usize {
        self.torrents
            .iter()
            .filter(|e| {
                let t = e.value().read();
                match t.activity {
                    Activity::Download => !seeding,
                    Activity::Seed => seeding,
                    _ => false,
                }
            })
            .count()
    }

    fn queue_full_for(&self, seeding: bool) -> bool {
        let config = self.config();
        if !config.queue_enabled {
            return false;
        }
        let limit = if seeding {
            config.seed_queue_size
        } else {
            config.download_queue_size
        };
        self.count_active(seeding) >= limit
    }

    /// Freed slots pull waiting torrents in, lowest queue position
    /// first.
    fn promote_queue(&self) {
        loop {
            let candidate = self
                .torrents
                .iter()
                .filter(|e| e.value().read().activity.is_queued())
                .filter(|e| {
                    matches!(
                        e.value().read().activity,
                        Activity::DownloadWait | Activity::SeedWait
                    )
                })
                .min_by_key(|e| e.value().read().queue_position)
                .map(|e| *e.key());
            let Some(id) = candidate else { return };
            let Some(torrent) = self.resolve(id) else { return };
            {
                let t = torrent.read();
                let seeding = t.activity == Activity::SeedWait;
                if self.queue_full_for(seeding) {
                    return;
                }
            }
            torrent.write().promote_from_wait();
            self.spawn_announcer(id, &torrent);
            self.save_resume(id);
        }
    }

    // --- queue discipline ---

    fn ids_in_queue_order(&self) -> Vec<TorrentId> {
        let mut with_pos: Vec<(usize, TorrentId)> = self
            .torrents
            .iter()
            .map(|e| (e.value().read().queue_position, *e.key()))
            .collect();
        with_pos.sort_unstable();
        with_pos.into_iter().map(|(_, id)| id).collect()
    }

    // Re-derive dense positions [0..N) in current order, dirtying
    // whoever moved.
    fn renumber_queue(&self) {
        for (pos, id) in self.ids_in_queue_order().into_iter().enumerate() {
            if let Some(t) = self.resolve(id) {
                let mut t = t.write();
                if t.queue_position != pos {
                    t.queue_position = pos;
                    t.dirty = true;
                }
            }
        }
    }

    pub fn set_queue_position(&self, id: TorrentId, new_pos: usize) -> anyhow::Result<()> {
        let mut order = self.ids_in_queue_order();
        let old_idx = order
            .iter()
            .position(|x| *x == id)
            .context("no such torrent")?;
        let moved = order.remove(old_idx);
        order.insert(new_pos.min(order.len()), moved);
        for (pos, id) in order.into_iter().enumerate() {
            if let Some(t) = self.resolve(id) {
                let mut t = t.write();
                if t.queue_position != pos {
                    t.queue_position = pos;
                    t.dirty = true;
                }
            }
        }
        Ok(())
    }

    pub fn queue_move_top(&self, id: TorrentId) -> anyhow::Result<()> {
        self.set_queue_position(id, 0)
    }

    pub fn queue_move_bottom(&self, id: TorrentId) -> anyhow::Result<()> {
        self.set_queue_position(id, self.torrents.len().saturating_sub(1))
    }

    pub fn queue_move_up(&self, id: TorrentId) -> anyhow::Result<()> {
        let pos = self.resolve(id).context("no such torrent")?.read().queue_position;
        self.set_queue_position(id, pos.saturating_sub(1))
    }

    pub fn queue_move_down(&self, id: TorrentId) -> anyhow::Result<()> {
        let pos = self.resolve(id).context("no such torrent")?.read().queue_position;
        self.set_queue_position(id, pos + 1)
    }

    // --- verify ---

    pub fn verify_torrent(&self, id: TorrentId) -> anyhow::Result<()> {
        let torrent = self.resolve(id).context("no such torrent")?;
        let job = {
            let mut t = torrent.write();
            t.begin_check_wait();
            let weak = self.weak_self.clone();
            let progress_weak = self.weak_self.clone();
            let dir = t.current_dir().to_owned();
            VerifyJob {
                tor_id: id,
                priority: t.priority,
                geometry: t.metainfo.block_info,
                files: t.metainfo.files.clone(),
                dir,
                piece_hashes: t.metainfo.piece_hashes.clone(),
                file_complete: t.file_complete_flags(),
                // first progress tick means the worker picked us up
                progress: Some(Box::new(move |_fraction| {
                    let Some(session) = progress_weak.upgrade() else {
                        return;
                    };
                    if let Some(t) = session.resolve(id) {
                        let mut t = t.write();
                        if t.activity == Activity::CheckWait {
                            t.begin_check();
                        }
                    }
                })),
                done: Box::new(move |outcome| {
                    if let Some(session) = weak.upgrade() {
                        session.on_verify_done(outcome);
                    }
                }),
            }
        };
        self.open_files.lock().close_torrent(id);
        self.verify.add(job);
        Ok(())
    }

    fn on_verify_done(&self, outcome: VerifyOutcome) {
        let Some(torrent) = self.resolve(outcome.tor_id) else {
            return;
        };
        if !outcome.aborted {
            let mut t = torrent.write();
            let old_flags = t.file_complete_flags();
            t.completion = outcome.pieces.clone();
            t.checked = crate::BF::repeat(true, t.n_pieces() as usize);
            let n_blocks = t.metainfo.block_info.n_blocks() as usize;
            let mut blocks = crate::BF::repeat(false, n_blocks);
            for piece in outcome.pieces.iter_ones() {
                for b in t.metainfo.block_info.blocks_spanning_piece(piece as u32) {
                    blocks.set(b as usize, true);
                }
            }
            t.have_blocks = blocks;
            let new_flags = t.file_complete_flags();
            fixup_partial_suffixes(&t, &old_flags, &new_flags);
        }
        let queue_full = {
            let is_done = torrent.read().is_done();
            self.queue_full_for(is_done)
        };
        torrent.write().finish_check(queue_full);
        let t = torrent.read();
        if t.activity.is_active() && !t.activity.is_queued() {
            drop(t);
            self.spawn_announcer(outcome.tor_id, &torrent);
        }
        self.save_resume(outcome.tor_id);
    }

    // --- relocate ---

    pub fn set_torrent_location(
        &self,
        id: TorrentId,
        new_dir: PathBuf,
        move_data: bool,
    ) -> anyhow::Result<()> {
        let torrent = self.resolve(id).context("no such torrent")?;
        if !move_data {
            let mut t = torrent.write();
            t.download_dir = new_dir;
            t.dirty = true;
            drop(t);
            self.save_resume(id);
            return Ok(());
        }
        let job = {
            let t = torrent.read();
            RelocateJob {
                tor_id: id,
                old_dir: t.current_dir().to_owned(),
                new_dir: new_dir.clone(),
                subpaths: t.metainfo.files.iter().map(|f| f.subpath.clone()).collect(),
            }
        };
        self.open_files.lock().close_torrent(id);
        // the new location only sticks if the move succeeds; stash it
        torrent.write().incomplete_dir = None;
        torrent.write().download_dir = new_dir;
        self.relocate.add(job);
        Ok(())
    }

    fn on_relocate_done(&self, tor_id: TorrentId, aborted: bool, error: Option<String>) {
        let Some(torrent) = self.resolve(tor_id) else {
            return;
        };
        match error {
            Some(message) => {
                warn!(tor_id, "relocate failed: {message}");
                torrent.write().set_local_error(message);
            }
            None => {
                debug!(tor_id, aborted, "relocate finished");
            }
        }
        self.save_resume(tor_id);
    }

    pub fn cancel_relocate(&self, id: TorrentId) {
        self.relocate.remove(id);
    }

    // --- announcer ---

    fn spawn_announcer(&self, id: TorrentId, torrent: &Arc<RwLock<Torrent>>) {
        self.stop_announcer(id);
        let (announce_list, info_hash) = {
            let t = torrent.read();
            (t.metainfo.announce_list.clone(), t.metainfo.info_hash)
        };
        let config = self.config();
        let announcer_config = AnnouncerConfig {
            peer_id: self.peer_id,
            port: config.peer_port,
            numwant: 80,
            announce_ip: config.announce_ip,
            require_crypto: false,
            force_interval: None,
        };
        let stream = Announcer::start(
            info_hash,
            announce_list,
            announcer_config,
            Box::new(StatsAdapter {
                torrent: torrent.clone(),
            }),
            Box::new(TrackerEventsAdapter {
                torrent: torrent.clone(),
            }),
            self.tracker_clients.clone(),
        );
        let Some(mut stream) = stream else {
            return;
        };
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(
            async move {
                while let Some(addr) = stream.next().await {
                    let Some(session) = weak.upgrade() else { return };
                    if session.blocklist_contains(addr.ip()) {
                        debug!(?addr, "peer dropped by blocklist");
                        continue;
                    }
                    if let Some(t) = session.resolve(id) {
                        let mut t = t.write();
                        if t.peer_candidates.len() < 512 {
                            t.peer_candidates.push(addr);
                        }
                    }
                }
            }
            .instrument(error_span!("peer_drain", tor_id = id)),
        );
        self.announcers.insert(id, handle);
    }

    fn stop_announcer(&self, id: TorrentId) {
        if let Some((_, handle)) = self.announcers.remove(&id) {
            // dropping the receiver tells the announcer to send its
            // stopped event
            handle.abort();
        }
    }

    /// Peers the announcer found, for the peer-wire layer to consume.
    pub fn take_peer_candidates(&self, id: TorrentId) -> Vec<std::net::SocketAddr> {
        self.resolve(id)
            .map(|t| std::mem::take(&mut t.write().peer_candidates))
            .unwrap_or_default()
    }

    // --- disk I/O for the peer layer ---

    fn with_disk<R>(
        &self,
        id: TorrentId,
        f: impl FnOnce(&crate::disk_io::TorrentDisk<'_>, &mut OpenFilesCache) -> std::io::Result<R>,
    ) -> anyhow::Result<R> {
        let torrent = self.resolve(id).context("no such torrent")?;
        let t = torrent.read();
        let disk = crate::disk_io::TorrentDisk {
            tor_id: id,
            geometry: &t.metainfo.block_info,
            files: &t.metainfo.files,
            dir: t.current_dir(),
            prealloc: self.config.read().prealloc,
            file_complete: &t.file_complete_flags(),
        };
        let mut cache = self.open_files.lock();
        f(&disk, &mut cache).map_err(|e| e.into())
    }

    pub fn read_at(&self, id: TorrentId, byte: u64, out: &mut [u8]) -> anyhow::Result<()> {
        self.with_disk(id, |disk, cache| {
            disk.read(cache, disk.geometry.byte_loc(byte), out)
        })
    }

    pub fn prefetch(&self, id: TorrentId, byte: u64, len: u64) -> anyhow::Result<()> {
        self.with_disk(id, |disk, cache| {
            disk.prefetch(cache, disk.geometry.byte_loc(byte), len)
        })
    }

    /// Write incoming block data. A failed write is a local error: the
    /// torrent records it and stops.
    pub fn write_at(&self, id: TorrentId, byte: u64, data: &[u8]) -> anyhow::Result<()> {
        let result = self.with_disk(id, |disk, cache| {
            disk.write(cache, disk.geometry.byte_loc(byte), data)
        });
        if let Err(e) = &result {
            warn!(id, "write failed: {e:#}");
            if let Some(torrent) = self.resolve(id) {
                torrent.write().set_local_error(format!("{e:#}"));
            }
            self.stop_announcer(id);
            self.open_files.lock().close_torrent(id);
        }
        result
    }

    // --- blocklist ---

    pub fn set_blocklist(&self, blocklist: Blocklist) {
        *self.blocklist.write() = blocklist;
    }

    pub fn blocklist_len(&self) -> usize {
        self.blocklist.read().len()
    }

    pub fn blocklist_contains(&self, addr: IpAddr) -> bool {
        self.blocklist.read().contains(addr)
    }

    // --- stats / persistence ---

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            torrent_count: self.torrents.len(),
            seconds_active: self.started_at.elapsed().as_secs(),
            ..Default::default()
        };
        for e in self.torrents.iter() {
            let t = e.value().read();
            if t.activity.is_active() {
                stats.active_torrent_count += 1;
            } else {
                stats.paused_torrent_count += 1;
            }
            stats.uploaded_bytes += t.uploaded.this_session;
            stats.downloaded_bytes += t.downloaded.this_session;
        }
        stats
    }

    pub fn save_resume(&self, id: TorrentId) {
        let Some(torrent) = self.resolve(id) else { return };
        let resume_dir = self.config().resume_dir;
        let mut t = torrent.write();
        if let Err(e) = resume::save(&resume_dir, &t) {
            warn!(id, "couldn't write resume file: {e:#}");
            return;
        }
        t.dirty = false;
    }

    /// Write out every dirty torrent's resume file.
    pub fn save_all_dirty(&self) {
        let ids: Vec<TorrentId> = self
            .torrents
            .iter()
            .filter(|e| e.value().read().dirty)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            self.save_resume(id);
        }
    }
}

// Rename files whose completeness changed during verify so complete
// files shed the partial suffix and freshly-incomplete ones regain it.
fn fixup_partial_suffixes(t: &Torrent, old_flags: &[bool], new_flags: &[bool]) {
    let dir = t.current_dir();
    for (i, f) in t.metainfo.files.iter().enumerate() {
        let (old_complete, new_complete) = match (old_flags.get(i), new_flags.get(i)) {
            (Some(o), Some(n)) => (*o, *n),
            _ => continue,
        };
        if old_complete == new_complete {
            continue;
        }
        let plain = dir.join(&f.subpath);
        let partial = dir.join(format!("{}{PARTIAL_SUFFIX}", f.subpath));
        let (from, to) = if new_complete {
            (partial, plain)
        } else {
            (plain, partial)
        };
        if from.is_file() && !to.is_file() {
            if let Err(e) = std::fs::rename(&from, &to) {
                warn!(?from, ?to, "couldn't fix up suffix: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencode::Value;
    use std::collections::BTreeMap;

    fn torrent_bytes(name: &str, content: &[u8], piece_size: u32) -> Vec<u8> {
        let hashes: Vec<u8> = content
            .chunks(piece_size as usize)
            .flat_map(|c| cryptow::sha1_many(&[c]))
            .collect();
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(name.as_bytes().to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_size as i64));
        info.insert(b"length".to_vec(), Value::Int(content.len() as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(hashes));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        Value::Dict(root).encode()
    }

    fn session_in(dir: &Path) -> Arc<Session> {
        Session::new(SessionConfig::new(dir.to_owned())).unwrap()
    }

    use std::path::Path;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_starts_and_dedupes() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path());
        let buf = torrent_bytes("a.bin", &[1u8; 100], 64);

        let id = session
            .add_torrent(AddTorrent::TorrentBytes(buf.clone()), Default::default())
            .unwrap();
        assert_eq!(
            session.resolve(id).unwrap().read().activity,
            Activity::Download
        );
        // identical info-hash is rejected
        assert!(session
            .add_torrent(AddTorrent::TorrentBytes(buf), Default::default())
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_magnet_add() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path());
        let id = session
            .add_torrent(
                AddTorrent::Magnet(
                    "magnet:?xt=urn:btih:d2354010a3ca4ade5b7427bb093a62a3899ff381&dn=x".into(),
                ),
                AddTorrentOptions {
                    paused: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let t = session.resolve(id).unwrap();
        assert_eq!(t.read().metainfo.name, "x");
        assert!(!t.read().metainfo.block_info.is_known());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queue_positions_stay_dense() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path());
        let mut ids = Vec::new();
        for i in 0..4u8 {
            let buf = torrent_bytes(&format!("t{i}"), &vec![i; 100], 64);
            ids.push(
                session
                    .add_torrent(
                        AddTorrent::TorrentBytes(buf),
                        AddTorrentOptions {
                            paused: true,
                            ..Default::default()
                        },
                    )
                    .unwrap(),
            );
        }
        let positions = |s: &Session| -> Vec<usize> {
            let mut v: Vec<usize> = s
                .torrent_ids()
                .iter()
                .map(|id| s.resolve(*id).unwrap().read().queue_position)
                .collect();
            v.sort_unstable();
            v
        };
        assert_eq!(positions(&session), vec![0, 1, 2, 3]);

        session.queue_move_top(ids[3]).unwrap();
        assert_eq!(
            session.resolve(ids[3]).unwrap().read().queue_position,
            0
        );
        assert_eq!(positions(&session), vec![0, 1, 2, 3]);

        session.queue_move_down(ids[3]).unwrap();
        assert_eq!(positions(&session), vec![0, 1, 2, 3]);

        session.remove_torrent(ids[0], false).unwrap();
        assert_eq!(positions(&session), vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queue_limits_and_promotion() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::new(tmp.path().to_owned());
        config.queue_enabled = true;
        config.download_queue_size = 1;
        let session = Session::new(config).unwrap();

        let id1 = session
            .add_torrent(
                AddTorrent::TorrentBytes(torrent_bytes("one", &[1u8; 100], 64)),
                Default::default(),
            )
            .unwrap();
        let id2 = session
            .add_torrent(
                AddTorrent::TorrentBytes(torrent_bytes("two", &[2u8; 100], 64)),
                Default::default(),
            )
            .unwrap();

        assert_eq!(
            session.resolve(id1).unwrap().read().activity,
            Activity::Download
        );
        assert_eq!(
            session.resolve(id2).unwrap().read().activity,
            Activity::DownloadWait
        );

        // stopping the active one frees the slot
        session.stop_torrent(id1).unwrap();
        assert_eq!(
            session.resolve(id2).unwrap().read().activity,
            Activity::Download
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_verify_updates_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path());

        let content: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let buf = torrent_bytes("data.bin", &content, 64);
        std::fs::write(tmp.path().join("data.bin"), &content).unwrap();

        let id = session
            .add_torrent(
                AddTorrent::TorrentBytes(buf),
                AddTorrentOptions {
                    paused: true,
                    ..Default::default()
                },
            )
            .unwrap();
        session.verify_torrent(id).unwrap();

        let torrent = session.resolve(id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if torrent.read().is_done() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let t = torrent.read();
        assert!(t.is_done(), "verify did not complete the torrent");
        assert!(t.checked.all());
        assert!(t.have_blocks.all());
        assert_eq!(t.activity, Activity::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resume_survives_readd() {
        let tmp = tempfile::tempdir().unwrap();
        let buf = torrent_bytes("persist.bin", &[7u8; 100], 64);
        let id = {
            let session = session_in(tmp.path());
            let id = session
                .add_torrent(
                    AddTorrent::TorrentBytes(buf.clone()),
                    AddTorrentOptions {
                        paused: true,
                        ..Default::default()
                    },
                )
                .unwrap();
            {
                let t = session.resolve(id).unwrap();
                let mut t = t.write();
                t.uploaded.add(4242);
                t.on_piece_completed(0);
            }
            session.save_resume(id);
            id
        };
        let _ = id;

        let session = session_in(tmp.path());
        let id2 = session
            .add_torrent(
                AddTorrent::TorrentBytes(buf),
                AddTorrentOptions {
                    paused: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let t = session.resolve(id2).unwrap();
        let t = t.read();
        assert_eq!(t.uploaded.ever, 4242);
        assert!(t.completion[0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_read_through_session() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path());
        let content: Vec<u8> = (0..100u8).collect();
        let id = session
            .add_torrent(
                AddTorrent::TorrentBytes(torrent_bytes("io.bin", &content, 64)),
                AddTorrentOptions {
                    paused: true,
                    ..Default::default()
                },
            )
            .unwrap();

        session.write_at(id, 0, &content).unwrap();
        let mut out = vec![0u8; 100];
        session.read_at(id, 0, &mut out).unwrap();
        assert_eq!(out, content);
        session.prefetch(id, 0, 100).unwrap();
        // incomplete file carries the partial suffix on disk
        assert!(tmp.path().join("io.bin.part").is_file());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path());
        session
            .add_torrent(
                AddTorrent::TorrentBytes(torrent_bytes("s", &[1u8; 100], 64)),
                AddTorrentOptions {
                    paused: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let stats = session.stats();
        assert_eq!(stats.torrent_count, 1);
        assert_eq!(stats.paused_torrent_count, 1);
    }
}
