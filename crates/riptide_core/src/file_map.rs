use crate::block_info::BlockInfo;

/// One file of the torrent's content, positioned in the linear byte
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub subpath: String,
    pub size: u64,
    pub begin_byte: u64,
}

impl FileEntry {
    pub fn end_byte(&self) -> u64 {
        self.begin_byte + self.size
    }
}

/// Ordered mapping from the torrent's byte stream onto its files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePieceMap {
    files: Vec<FileEntry>,
    total_size: u64,
}

/// A contiguous byte range within one file, produced by walking the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRange {
    pub file_index: usize,
    pub offset_in_file: u64,
    pub len: u64,
}

impl FilePieceMap {
    pub fn new(files: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut begin = 0u64;
        let files: Vec<FileEntry> = files
            .into_iter()
            .map(|(subpath, size)| {
                let e = FileEntry {
                    subpath,
                    size,
                    begin_byte: begin,
                };
                begin += size;
                e
            })
            .collect();
        Self {
            files,
            total_size: begin,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter()
    }

    pub fn get(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    /// Index of the file containing the given byte. Zero-length files
    /// never contain any byte.
    pub fn file_for_byte(&self, byte: u64) -> Option<usize> {
        if byte >= self.total_size {
            return None;
        }
        // last file whose begin_byte <= byte...
        let idx = self.files.partition_point(|f| f.begin_byte <= byte);
        // ...skipping back over zero-length files sitting at this offset
        self.files[..idx]
            .iter()
            .rposition(|f| f.begin_byte <= byte && byte < f.end_byte())
    }

    /// Inclusive range of file indices that hold bytes of the piece.
    pub fn files_for_piece(&self, piece: u32, geometry: &BlockInfo) -> Option<(usize, usize)> {
        if piece >= geometry.n_pieces() {
            return None;
        }
        let begin_byte = geometry.piece_loc(piece, 0).byte;
        let end_byte = geometry.piece_end_byte(piece);
        let first = self.file_for_byte(begin_byte)?;
        let last = self.file_for_byte(end_byte - 1)?;
        Some((first, last))
    }

    /// Pieces holding any byte of the file; empty for zero-length
    /// files.
    pub fn pieces_for_file(
        &self,
        file_index: usize,
        geometry: &BlockInfo,
    ) -> Option<std::ops::Range<u32>> {
        let f = self.get(file_index)?;
        if f.size == 0 || !geometry.is_known() {
            return Some(0..0);
        }
        let first = geometry.byte_loc(f.begin_byte).piece;
        let last = geometry.byte_loc(f.end_byte() - 1).piece;
        Some(first..last + 1)
    }

    /// Walk the map starting at `byte`, yielding per-file sub-ranges
    /// covering `len` bytes. The walk stops early at end of content.
    pub fn iter_ranges(&self, byte: u64, len: u64) -> impl Iterator<Item = FileRange> + '_ {
        let end = (byte + len).min(self.total_size);
        let start_idx = self.file_for_byte(byte).unwrap_or(self.files.len());
        self.files[start_idx..]
            .iter()
            .enumerate()
            .take_while(move |(_, f)| f.begin_byte < end)
            .filter_map(move |(i, f)| {
                // zero-length files hold no bytes of any range
                let range_begin = byte.max(f.begin_byte);
                let range_end = end.min(f.end_byte());
                if range_begin >= range_end {
                    return None;
                }
                Some(FileRange {
                    file_index: start_idx + i,
                    offset_in_file: range_begin - f.begin_byte,
                    len: range_end - range_begin,
                })
            })
    }
}
