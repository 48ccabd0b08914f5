use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use riptide_core::block_info::{BlockInfo, Location, BLOCK_SIZE};
use riptide_core::file_map::{FilePieceMap, FileRange};
use cryptow::{ISha1, Sha1};
use tracing::trace;

use crate::open_files::{OpenFilesCache, Preallocation};
use crate::torrent::TorrentId;

/// Incomplete files carry this suffix until their last piece checks out.
pub const PARTIAL_SUFFIX: &str = ".part";

#[cfg(unix)]
fn pread_exact(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn pread_exact(file: &File, offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    while !buf.is_empty() {
        let n = f.read(buf)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn pwrite_all(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn pwrite_all(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buf)
}

/// A torrent's view of the disk: geometry + file map + where the files
/// live. Reads and writes walk the file map and go through the shared
/// descriptor cache.
pub struct TorrentDisk<'a> {
    pub tor_id: TorrentId,
    pub geometry: &'a BlockInfo,
    pub files: &'a FilePieceMap,
    pub dir: &'a Path,
    pub prealloc: Preallocation,
    /// Per-file "is fully downloaded" flags; incomplete files live
    /// under their partial name.
    pub file_complete: &'a [bool],
}

impl TorrentDisk<'_> {
    pub fn file_path(&self, file_index: usize) -> PathBuf {
        let entry = self.files.get(file_index).expect("file index in range");
        let complete = self.file_complete.get(file_index).copied().unwrap_or(true);
        if complete {
            self.dir.join(&entry.subpath)
        } else {
            self.dir.join(format!("{}{PARTIAL_SUFFIX}", entry.subpath))
        }
    }

    /// Locate a file on disk, probing the partial name too. Returns the
    /// path that actually exists.
    pub fn find_file(&self, file_index: usize) -> Option<PathBuf> {
        let entry = self.files.get(file_index)?;
        let plain = self.dir.join(&entry.subpath);
        if plain.is_file() {
            return Some(plain);
        }
        let partial = self.dir.join(format!("{}{PARTIAL_SUFFIX}", entry.subpath));
        partial.is_file().then_some(partial)
    }

    fn for_each_range<F>(
        &self,
        cache: &mut OpenFilesCache,
        loc: Location,
        len: u64,
        writable: bool,
        mut f: F,
    ) -> io::Result<()>
    where
        F: FnMut(&mut File, FileRange) -> io::Result<()>,
    {
        for range in self.files.iter_ranges(loc.byte, len) {
            // prefer whichever name is actually on disk; fall back to
            // the completeness-preferred name for file creation
            let path = self
                .find_file(range.file_index)
                .unwrap_or_else(|| self.file_path(range.file_index));
            let size = self.files.get(range.file_index).map(|e| e.size).unwrap_or(0);
            let file = cache.get(
                self.tor_id,
                range.file_index,
                writable,
                &path,
                self.prealloc,
                size,
            )?;
            f(file, range)?;
        }
        Ok(())
    }

    pub fn read(
        &self,
        cache: &mut OpenFilesCache,
        loc: Location,
        out: &mut [u8],
    ) -> io::Result<()> {
        let mut filled = 0usize;
        let len = out.len() as u64;
        self.for_each_range(cache, loc, len, false, |file, range| {
            let chunk = &mut out[filled..filled + range.len as usize];
            pread_exact(file, range.offset_in_file, chunk)?;
            filled += range.len as usize;
            Ok(())
        })?;
        if filled != out.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    pub fn write(&self, cache: &mut OpenFilesCache, loc: Location, data: &[u8]) -> io::Result<()> {
        let mut written = 0usize;
        self.for_each_range(cache, loc, data.len() as u64, true, |file, range| {
            let chunk = &data[written..written + range.len as usize];
            pwrite_all(file, range.offset_in_file, chunk)?;
            written += range.len as usize;
            Ok(())
        })
    }

    /// Hint the kernel that the range will be read soon. No copying.
    pub fn prefetch(&self, cache: &mut OpenFilesCache, loc: Location, len: u64) -> io::Result<()> {
        self.for_each_range(cache, loc, len, false, |file, range| {
            fadvise_willneed(file, range.offset_in_file, range.len);
            Ok(())
        })
    }

    /// Stream the piece's exact byte range through a fresh SHA-1 and
    /// compare against the expected digest. IO errors (missing file,
    /// short file) mean the piece isn't there: `false`, not an error.
    pub fn verify_piece(
        &self,
        cache: &mut OpenFilesCache,
        piece: u32,
        expected: &[u8; 20],
    ) -> bool {
        let piece_len = self.geometry.piece_size_of(piece) as u64;
        if piece_len == 0 {
            return false;
        }
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let mut remaining = piece_len;
        let mut loc = self.geometry.piece_loc(piece, 0);
        while remaining > 0 {
            let chunk = remaining.min(BLOCK_SIZE as u64) as usize;
            if let Err(e) = self.read(cache, loc, &mut buf[..chunk]) {
                trace!(piece, "read failed during verify: {e:#}");
                return false;
            }
            hasher.update(&buf[..chunk]);
            remaining -= chunk as u64;
            loc = self.geometry.byte_loc(loc.byte + chunk as u64);
        }
        hasher.finish() == *expected
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fadvise_willneed(file: &File, offset: u64, len: u64) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
            libc::POSIX_FADV_WILLNEED,
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fadvise_willneed(_file: &File, _offset: u64, _len: u64) {}
