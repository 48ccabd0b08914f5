//! Per-torrent resume files: one bencoded dict per torrent, keyed by
//! info-hash, holding everything that must survive a restart.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bencode::Value;
use tracing::debug;

use crate::torrent::{Priority, Torrent};
use crate::BF;

pub fn resume_file_path(resume_dir: &Path, info_hash_str: &str) -> PathBuf {
    resume_dir.join(format!("{info_hash_str}.resume"))
}

fn bytes(b: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(b.into())
}

fn bitfield_bytes(bf: &BF) -> Vec<u8> {
    bf.as_raw_slice().to_vec()
}

fn bitfield_from(bytes: &[u8], n_bits: usize) -> BF {
    let mut bf = BF::from_vec(bytes.to_vec());
    bf.resize(n_bits, false);
    bf
}

pub fn save(resume_dir: &Path, t: &Torrent) -> io::Result<()> {
    let mut d = BTreeMap::new();
    d.insert(b"destination".to_vec(), bytes(t.download_dir.to_string_lossy().into_owned()));
    if let Some(dir) = &t.incomplete_dir {
        d.insert(
            b"incomplete-dir".to_vec(),
            bytes(dir.to_string_lossy().into_owned()),
        );
    }
    d.insert(b"paused".to_vec(), Value::Int(i64::from(!t.activity.is_active())));
    d.insert(b"queue-position".to_vec(), Value::Int(t.queue_position as i64));
    d.insert(
        b"priority".to_vec(),
        Value::Int(match t.priority {
            Priority::Low => -1,
            Priority::Normal => 0,
            Priority::High => 1,
        }),
    );
    d.insert(
        b"labels".to_vec(),
        Value::List(t.labels.iter().map(|l| bytes(l.as_bytes().to_vec())).collect()),
    );
    if let Some(group) = &t.bandwidth_group {
        d.insert(b"group".to_vec(), bytes(group.as_bytes().to_vec()));
    }

    d.insert(b"uploaded".to_vec(), Value::Int(t.uploaded.ever as i64));
    d.insert(b"downloaded".to_vec(), Value::Int(t.downloaded.ever as i64));
    d.insert(b"corrupt".to_vec(), Value::Int(t.corrupt.ever as i64));

    d.insert(b"added-date".to_vec(), Value::Int(t.date_added as i64));
    d.insert(b"done-date".to_vec(), Value::Int(t.date_done as i64));
    d.insert(b"changed-date".to_vec(), Value::Int(t.date_changed as i64));
    d.insert(b"started-date".to_vec(), Value::Int(t.date_started as i64));
    d.insert(b"edited-date".to_vec(), Value::Int(t.date_edited as i64));
    d.insert(b"activity-date".to_vec(), Value::Int(t.date_active as i64));

    d.insert(
        b"seeding-time-seconds".to_vec(),
        Value::Int(t.seconds_seeding_before_current_start.as_secs() as i64),
    );
    d.insert(
        b"downloading-time-seconds".to_vec(),
        Value::Int(t.seconds_downloading_before_current_start.as_secs() as i64),
    );
    if let Some(ratio) = t.seed_ratio_limit {
        // bencode has no float; keep the decimal text
        d.insert(b"ratio-limit".to_vec(), bytes(format!("{ratio}")));
    }
    if let Some(idle) = t.idle_seconds_limit {
        d.insert(b"idle-limit".to_vec(), Value::Int(idle as i64));
    }

    d.insert(b"pieces".to_vec(), bytes(bitfield_bytes(&t.completion)));
    d.insert(b"blocks".to_vec(), bytes(bitfield_bytes(&t.have_blocks)));
    d.insert(b"checked".to_vec(), bytes(bitfield_bytes(&t.checked)));
    d.insert(
        b"mtimes".to_vec(),
        Value::List(
            t.file_mtimes
                .iter()
                .map(|m| Value::Int(m.unwrap_or(0) as i64))
                .collect(),
        ),
    );

    std::fs::create_dir_all(resume_dir)?;
    let path = resume_file_path(resume_dir, &t.info_hash_str());
    std::fs::write(&path, Value::Dict(d).encode())?;
    debug!(?path, "resume file written");
    Ok(())
}

/// Apply a resume file to a freshly-constructed torrent. Returns false
/// when there is nothing to load.
pub fn load(resume_dir: &Path, t: &mut Torrent) -> bool {
    let path = resume_file_path(resume_dir, &t.info_hash_str());
    let Ok(buf) = std::fs::read(&path) else {
        return false;
    };
    let Ok(root) = Value::parse(&buf) else {
        debug!(?path, "unreadable resume file ignored");
        return false;
    };

    let get_u64 = |key: &[u8]| root.get(key).and_then(Value::as_int).map(|v| v.max(0) as u64);

    if let Some(dest) = root.get(b"destination").and_then(Value::as_str) {
        t.download_dir = PathBuf::from(dest);
    }
    t.incomplete_dir = root
        .get(b"incomplete-dir")
        .and_then(Value::as_str)
        .map(PathBuf::from);
    if let Some(pos) = get_u64(b"queue-position") {
        t.queue_position = pos as usize;
    }
    t.priority = match root.get(b"priority").and_then(Value::as_int) {
        Some(v) if v < 0 => Priority::Low,
        Some(v) if v > 0 => Priority::High,
        _ => Priority::Normal,
    };
    if let Some(labels) = root.get(b"labels").and_then(Value::as_list) {
        t.labels = labels
            .iter()
            .filter_map(Value::as_str)
            .map(Arc::from)
            .collect();
    }
    t.bandwidth_group = root.get(b"group").and_then(Value::as_str).map(Arc::from);

    t.uploaded.ever = get_u64(b"uploaded").unwrap_or(0);
    t.downloaded.ever = get_u64(b"downloaded").unwrap_or(0);
    t.corrupt.ever = get_u64(b"corrupt").unwrap_or(0);

    t.date_added = get_u64(b"added-date").unwrap_or(t.date_added);
    t.date_done = get_u64(b"done-date").unwrap_or(0);
    t.date_changed = get_u64(b"changed-date").unwrap_or(0);
    t.date_started = get_u64(b"started-date").unwrap_or(0);
    t.date_edited = get_u64(b"edited-date").unwrap_or(0);
    t.date_active = get_u64(b"activity-date").unwrap_or(0);

    t.seconds_seeding_before_current_start =
        Duration::from_secs(get_u64(b"seeding-time-seconds").unwrap_or(0));
    t.seconds_downloading_before_current_start =
        Duration::from_secs(get_u64(b"downloading-time-seconds").unwrap_or(0));
    t.seed_ratio_limit = root
        .get(b"ratio-limit")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok());
    t.idle_seconds_limit = get_u64(b"idle-limit");

    let n_pieces = t.metainfo.block_info.n_pieces() as usize;
    let n_blocks = t.metainfo.block_info.n_blocks() as usize;
    if let Some(b) = root.get(b"pieces").and_then(Value::as_bytes) {
        t.completion = bitfield_from(b, n_pieces);
    }
    if let Some(b) = root.get(b"blocks").and_then(Value::as_bytes) {
        t.have_blocks = bitfield_from(b, n_blocks);
    }
    if let Some(b) = root.get(b"checked").and_then(Value::as_bytes) {
        t.checked = bitfield_from(b, n_pieces);
    }
    if let Some(mtimes) = root.get(b"mtimes").and_then(Value::as_list) {
        t.file_mtimes = mtimes
            .iter()
            .map(|v| v.as_int().filter(|m| *m > 0).map(|m| m as u64))
            .collect();
        t.file_mtimes.resize(t.metainfo.files.len(), None);
    }

    t.dirty = false;
    true
}

pub fn remove(resume_dir: &Path, info_hash_str: &str) {
    let _ = std::fs::remove_file(resume_file_path(resume_dir, info_hash_str));
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::block_info::BlockInfo;
    use riptide_core::file_map::FilePieceMap;
    use riptide_core::metainfo::Metainfo;

    fn test_torrent() -> Torrent {
        let files = FilePieceMap::new([("t/a".to_owned(), 100), ("t/b".to_owned(), 100)]);
        let metainfo = Metainfo {
            name: "t".into(),
            info_hash: riptide_core::Id20::new([3u8; 20]),
            block_info: BlockInfo::new(200, 64),
            piece_hashes: vec![[0u8; 20]; 4],
            files,
            ..Default::default()
        };
        Torrent::new(1, metainfo, PathBuf::from("/downloads"))
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = test_torrent();
        t.on_piece_completed(1);
        t.on_piece_completed(3);
        t.queue_position = 5;
        t.priority = Priority::High;
        t.labels = vec![Arc::from("linux"), Arc::from("iso")];
        t.bandwidth_group = Some(Arc::from("slow"));
        t.uploaded.add(1234);
        t.downloaded.add(5678);
        t.corrupt.add(16384);
        t.seed_ratio_limit = Some(2.5);
        t.idle_seconds_limit = Some(1800);
        t.incomplete_dir = Some(PathBuf::from("/incomplete"));
        t.file_mtimes = vec![Some(1700000000), None];

        save(dir.path(), &t).unwrap();

        let mut loaded = test_torrent();
        assert!(load(dir.path(), &mut loaded));

        assert_eq!(loaded.completion, t.completion);
        assert_eq!(loaded.have_blocks, t.have_blocks);
        assert_eq!(loaded.checked, t.checked);
        assert_eq!(loaded.queue_position, 5);
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.labels, t.labels);
        assert_eq!(loaded.bandwidth_group, t.bandwidth_group);
        assert_eq!(loaded.uploaded.ever, 1234);
        assert_eq!(loaded.downloaded.ever, 5678);
        assert_eq!(loaded.corrupt.ever, 16384);
        assert_eq!(loaded.seed_ratio_limit, Some(2.5));
        assert_eq!(loaded.idle_seconds_limit, Some(1800));
        assert_eq!(loaded.download_dir, PathBuf::from("/downloads"));
        assert_eq!(loaded.incomplete_dir, Some(PathBuf::from("/incomplete")));
        assert_eq!(loaded.file_mtimes, vec![Some(1700000000), None]);
        // session counters start fresh
        assert_eq!(loaded.uploaded.this_session, 0);
        assert!(!loaded.dirty);
    }

    #[test]
    fn test_missing_file_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = test_torrent();
        assert!(!load(dir.path(), &mut t));
    }

    #[test]
    fn test_corrupt_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_torrent();
        let path = resume_file_path(dir.path(), &t.info_hash_str());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&path, b"not bencode").unwrap();
        let mut t2 = test_torrent();
        assert!(!load(dir.path(), &mut t2));
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_torrent();
        save(dir.path(), &t).unwrap();
        remove(dir.path(), &t.info_hash_str());
        let mut t2 = test_torrent();
        assert!(!load(dir.path(), &mut t2));
    }
}
