use std::fs::File;
use std::io;
use std::path::Path;

use tracing::{debug, trace, warn};

use crate::torrent::TorrentId;

pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preallocation {
    None,
    #[default]
    Sparse,
    Full,
}

struct Entry {
    tor_id: TorrentId,
    file_index: usize,
    file: File,
    writable: bool,
    seq: u64,
}

/// Fixed-capacity LRU of open descriptors keyed by
/// `(torrent_id, file_index)`. Callers serialise access behind the
/// session lock; there is no interior locking here.
pub struct OpenFilesCache {
    entries: Vec<Entry>,
    capacity: usize,
    next_seq: u64,
}

impl Default for OpenFilesCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OpenFilesCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    fn bump(&mut self, idx: usize) -> &mut Entry {
        self.next_seq += 1;
        let seq = self.next_seq;
        let e = &mut self.entries[idx];
        e.seq = seq;
        e
    }

    /// Get an open descriptor, opening (and possibly evicting) as
    /// needed. A cached read-only descriptor is not good enough for a
    /// writable request and gets reopened.
    pub fn get(
        &mut self,
        tor_id: TorrentId,
        file_index: usize,
        writable: bool,
        path: &Path,
        prealloc: Preallocation,
        expected_size: u64,
    ) -> io::Result<&mut File> {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.tor_id == tor_id && e.file_index == file_index)
        {
            if self.entries[idx].writable || !writable {
                return Ok(&mut self.bump(idx).file);
            }
            // insufficiently writable: close and reopen below
            self.entries.swap_remove(idx);
        }

        let file = open_file(path, writable, prealloc, expected_size)?;

        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.next_seq += 1;
        self.entries.push(Entry {
            tor_id,
            file_index,
            file,
            writable,
            seq: self.next_seq,
        });
        Ok(&mut self.entries.last_mut().unwrap().file)
    }

    fn evict_lru(&mut self) {
        if let Some(idx) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.seq)
            .map(|(i, _)| i)
        {
            let e = self.entries.swap_remove(idx);
            trace!(tor_id = e.tor_id, file_index = e.file_index, "evicting fd");
            close_entry(e);
        }
    }

    /// Close every descriptor belonging to the torrent, flushing
    /// writable ones so mtimes are current.
    pub fn close_torrent(&mut self, tor_id: TorrentId) {
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].tor_id == tor_id {
                let e = self.entries.swap_remove(i);
                close_entry(e);
            } else {
                i += 1;
            }
        }
    }

    pub fn close_all(&mut self) {
        for e in self.entries.drain(..) {
            close_entry(e);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn close_entry(e: Entry) {
    if e.writable {
        if let Err(err) = e.file.sync_all() {
            warn!(
                tor_id = e.tor_id,
                file_index = e.file_index,
                "error flushing file: {err:#}"
            );
        }
    }
}

fn open_file(
    path: &Path,
    writable: bool,
    prealloc: Preallocation,
    expected_size: u64,
) -> io::Result<File> {
    if writable {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(writable)
        .create(writable)
        .open(path)?;
    advise_sequential(&file);

    if writable {
        let len = file.metadata()?.len();
        if len > expected_size {
            debug!(?path, len, expected_size, "truncating oversized file");
            file.set_len(expected_size)?;
        } else if len == 0 && expected_size > 0 {
            preallocate(&file, prealloc, expected_size)?;
        }
    }
    Ok(file)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn advise_sequential(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn advise_sequential(_file: &File) {}

fn preallocate(file: &File, prealloc: Preallocation, size: u64) -> io::Result<()> {
    match prealloc {
        Preallocation::None => Ok(()),
        Preallocation::Sparse => preallocate_sparse(file, size),
        Preallocation::Full => preallocate_full(file, size),
    }
}

fn preallocate_sparse(file: &File, size: u64) -> io::Result<()> {
    if file.set_len(size).is_ok() {
        return Ok(());
    }
    // fallback: a single byte at the end stretches the file too
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(size - 1))?;
    f.write_all(&[0])?;
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn preallocate_full(file: &File, size: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let err = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    match err {
        0 => Ok(()),
        // out of space is the one error the caller must see verbatim
        libc::ENOSPC => Err(io::Error::from_raw_os_error(libc::ENOSPC)),
        other => {
            debug!("posix_fallocate failed ({other}), falling back to chunked writes");
            preallocate_full_fallback(file, size)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn preallocate_full(file: &File, size: u64) -> io::Result<()> {
    preallocate_full_fallback(file, size)
}

// Reserve by writing zeroes in small chunks so a slow disk still makes
// steady progress and ENOSPC shows up before the download starts.
fn preallocate_full_fallback(file: &File, size: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    const CHUNK: usize = 4096;
    let zeroes = [0u8; CHUNK];
    let mut f = file;
    f.seek(SeekFrom::Start(0))?;
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        f.write_all(&zeroes[..n])?;
        remaining -= n as u64;
    }
    f.seek(SeekFrom::Start(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_of(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_open_creates_parents_and_preallocates() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = OpenFilesCache::new(4);
        let p = dir.path().join("a/b/c.bin");
        cache
            .get(1, 0, true, &p, Preallocation::Sparse, 4096)
            .unwrap();
        assert_eq!(std::fs::metadata(&p).unwrap().len(), 4096);
    }

    #[test]
    fn test_full_preallocation_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = OpenFilesCache::new(4);
        let p = path_of(&dir, "full.bin");
        cache
            .get(1, 0, true, &p, Preallocation::Full, 10000)
            .unwrap();
        assert_eq!(std::fs::metadata(&p).unwrap().len(), 10000);
    }

    #[test]
    fn test_oversized_file_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let p = path_of(&dir, "big.bin");
        std::fs::write(&p, vec![1u8; 1000]).unwrap();
        let mut cache = OpenFilesCache::new(4);
        cache
            .get(1, 0, true, &p, Preallocation::None, 100)
            .unwrap();
        assert_eq!(std::fs::metadata(&p).unwrap().len(), 100);
    }

    #[test]
    fn test_readonly_hit_upgraded_for_write() {
        let dir = tempfile::tempdir().unwrap();
        let p = path_of(&dir, "up.bin");
        std::fs::write(&p, b"data").unwrap();
        let mut cache = OpenFilesCache::new(4);
        cache
            .get(1, 0, false, &p, Preallocation::None, 4)
            .unwrap();
        assert_eq!(cache.len(), 1);
        // same key, now writable: must reopen rather than hand back the
        // read-only descriptor
        use std::io::Write;
        let f = cache.get(1, 0, true, &p, Preallocation::None, 4).unwrap();
        f.write_all(b"x").unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = OpenFilesCache::new(2);
        for i in 0..3usize {
            let p = path_of(&dir, &format!("f{i}"));
            cache
                .get(1, i, true, &p, Preallocation::None, 10)
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        // file 0 was least recently used and must be gone; touching it
        // again reopens rather than hits
        let indexes: Vec<usize> = cache.entries.iter().map(|e| e.file_index).collect();
        assert!(!indexes.contains(&0));
    }

    #[test]
    fn test_close_torrent_selective() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = OpenFilesCache::new(8);
        for (tor, idx, name) in [(1, 0, "a"), (1, 1, "b"), (2, 0, "c")] {
            let p = path_of(&dir, name);
            cache
                .get(tor, idx, true, &p, Preallocation::None, 1)
                .unwrap();
        }
        cache.close_torrent(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries[0].tor_id, 2);
    }
}
