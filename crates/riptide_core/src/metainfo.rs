use bencode::{Context, Handler, Value};
use cryptow::{sha1_many, sha256_many};

use crate::block_info::BlockInfo;
use crate::file_map::FilePieceMap;
use crate::hash_id::{Id20, Id32};
use crate::magnet::Magnet;
use crate::sanitize::sanitize_component;

#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
    #[error("parse error at offset {offset}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("missing required field {0:?}")]
    MissingField(&'static str),

    #[error("invalid info-hash")]
    InvalidInfoHash,

    #[error("invalid path in file list")]
    InvalidPath,

    #[error("unsupported metainfo version {0}")]
    UnsupportedVersion(i64),
}

impl From<bencode::Error> for MetainfoError {
    fn from(e: bencode::Error) -> Self {
        let offset = match e {
            bencode::Error::Malformed { offset } => offset,
            bencode::Error::TooDeep { offset, .. } => offset,
            bencode::Error::Cancelled { offset } => offset,
            bencode::Error::Truncated => 0,
        };
        MetainfoError::Parse {
            offset,
            reason: e.to_string(),
        }
    }
}

fn malformed(offset: usize, reason: &str) -> MetainfoError {
    MetainfoError::Parse {
        offset,
        reason: reason.to_owned(),
    }
}

/// An immutable description of a swarm, parsed from a `.torrent` file
/// or (partially) from a magnet link.
#[derive(Debug, Clone, Default)]
pub struct Metainfo {
    pub info_hash: Id20,
    pub info_hash_v2: Option<Id32>,
    pub name: String,
    pub comment: Option<String>,
    pub creator: Option<String>,
    pub source: Option<String>,
    pub created_at: Option<u64>,
    pub is_private: bool,
    pub is_v2: bool,

    pub block_info: BlockInfo,
    pub files: FilePieceMap,
    pub piece_hashes: Vec<[u8; 20]>,

    /// Tiers of announce URLs, outer order significant (BEP-12).
    pub announce_list: Vec<Vec<String>>,
    pub webseed_urls: Vec<String>,

    /// Byte span of the bencoded `info` dict within the source blob,
    /// kept for ut-metadata exchange.
    pub info_dict_offset: usize,
    pub info_dict_size: usize,
    /// Offset of the raw `pieces` string payload within the source blob.
    pub pieces_offset: usize,
}

// Captures the byte spans the field-level parse can't see: where the
// "info" dict and the "pieces" payload live in the original blob.
#[derive(Default)]
struct SpanScanner {
    info_start: Option<usize>,
    info_end: Option<usize>,
    pieces_offset: Option<usize>,
    awaiting_info_value: bool,
    awaiting_pieces_value: bool,
}

impl SpanScanner {
    fn inside_info(&self) -> bool {
        self.info_start.is_some() && self.info_end.is_none()
    }
}

impl Handler for SpanScanner {
    fn key(&mut self, key: &[u8], ctx: &Context) -> bool {
        if ctx.depth == 1 && key == b"info" && self.info_start.is_none() {
            self.awaiting_info_value = true;
        } else if self.inside_info() && ctx.depth == 2 && key == b"pieces" {
            self.awaiting_pieces_value = true;
        }
        true
    }

    fn dict_begin(&mut self, ctx: &Context) -> bool {
        if self.awaiting_info_value && ctx.depth == 1 {
            self.info_start = Some(ctx.token_start);
            self.awaiting_info_value = false;
        }
        true
    }

    fn dict_end(&mut self, ctx: &Context) -> bool {
        if self.inside_info() && ctx.depth == 1 {
            self.info_end = Some(ctx.token_end);
        }
        true
    }

    fn string(&mut self, value: &[u8], ctx: &Context) -> bool {
        if self.awaiting_pieces_value && ctx.depth == 2 {
            self.pieces_offset = Some(ctx.token_end - value.len());
            self.awaiting_pieces_value = false;
        } else if self.awaiting_info_value {
            // "info" must be a dict
            self.awaiting_info_value = false;
        }
        true
    }

    fn int(&mut self, _value: i64, _ctx: &Context) -> bool {
        self.awaiting_info_value = false;
        true
    }

    fn list_begin(&mut self, _ctx: &Context) -> bool {
        self.awaiting_info_value = false;
        true
    }
}

fn utf8_or<'a>(
    dict: &'a Value,
    key_utf8: &[u8],
    key: &[u8],
) -> Option<&'a str> {
    dict.get(key_utf8)
        .and_then(Value::as_str)
        .or_else(|| dict.get(key).and_then(Value::as_str))
}

impl Metainfo {
    /// Parse the bencoded contents of a `.torrent` file.
    pub fn from_torrent_bytes(buf: &[u8]) -> Result<Metainfo, MetainfoError> {
        let mut scanner = SpanScanner::default();
        bencode::parse(buf, &mut scanner)?;
        let root = Value::parse(buf)?;

        let info = root
            .get(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;
        if info.as_dict().is_none() {
            return Err(malformed(0, "\"info\" is not a dict"));
        }
        let info_start = scanner.info_start.ok_or(MetainfoError::MissingField("info"))?;
        let info_end = scanner.info_end.ok_or(MetainfoError::MissingField("info"))?;
        let info_bytes = &buf[info_start..info_end];

        let meta_version = info.get(b"meta version").and_then(Value::as_int);
        match meta_version {
            None | Some(1) | Some(2) => {}
            Some(v) => return Err(MetainfoError::UnsupportedVersion(v)),
        }
        let is_v2 = meta_version == Some(2);

        let raw_name = utf8_or(info, b"name.utf-8", b"name")
            .ok_or(MetainfoError::MissingField("name"))?;
        let name = sanitize_component(raw_name);
        if name.is_empty() {
            return Err(MetainfoError::InvalidPath);
        }

        let piece_size = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::MissingField("piece length"))?;
        if piece_size <= 0 || piece_size > u32::MAX as i64 {
            return Err(malformed(0, "bad piece length"));
        }

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| {
                if is_v2 {
                    // v2-only torrents carry merkle roots instead of a
                    // flat SHA-1 piece list; we require the hybrid form
                    MetainfoError::UnsupportedVersion(2)
                } else {
                    MetainfoError::MissingField("pieces")
                }
            })?;
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidInfoHash);
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let files = Self::parse_files(info, &name)?;
        let block_info = BlockInfo::new(files.total_size(), piece_size as u32);
        if block_info.n_pieces() as usize != piece_hashes.len() {
            return Err(malformed(0, "piece count does not match content size"));
        }

        let announce_list = Self::parse_announce_list(&root);
        let webseed_urls = Self::parse_webseeds(&root, files.len() > 1);

        let info_hash = Id20::new(sha1_many(&[info_bytes]));
        let info_hash_v2 = is_v2.then(|| Id32::new(sha256_many(&[info_bytes])));

        Ok(Metainfo {
            info_hash,
            info_hash_v2,
            name,
            comment: utf8_or(&root, b"comment.utf-8", b"comment").map(str::to_owned),
            creator: utf8_or(&root, b"created by.utf-8", b"created by").map(str::to_owned),
            source: info.get(b"source").and_then(Value::as_str).map(str::to_owned),
            created_at: root
                .get(b"creation date")
                .and_then(Value::as_int)
                .and_then(|v| u64::try_from(v).ok()),
            is_private: info.get(b"private").and_then(Value::as_int) == Some(1),
            is_v2,
            block_info,
            files,
            piece_hashes,
            announce_list,
            webseed_urls,
            info_dict_offset: info_start,
            info_dict_size: info_end - info_start,
            pieces_offset: scanner.pieces_offset.unwrap_or(0),
        })
    }

    fn parse_files(info: &Value, name: &str) -> Result<FilePieceMap, MetainfoError> {
        let length = info.get(b"length").and_then(Value::as_int);
        let files = info.get(b"files").and_then(Value::as_list);
        match (length, files) {
            (Some(len), None) => {
                if len < 0 {
                    return Err(malformed(0, "negative file length"));
                }
                Ok(FilePieceMap::new([(name.to_owned(), len as u64)]))
            }
            (None, Some(list)) => {
                if list.is_empty() {
                    return Err(MetainfoError::MissingField("files"));
                }
                let mut out = Vec::with_capacity(list.len());
                for file in list {
                    let len = file
                        .get(b"length")
                        .and_then(Value::as_int)
                        .ok_or(MetainfoError::MissingField("length"))?;
                    if len < 0 {
                        return Err(malformed(0, "negative file length"));
                    }
                    let path = file
                        .get(b"path.utf-8")
                        .or_else(|| file.get(b"path"))
                        .and_then(Value::as_list)
                        .ok_or(MetainfoError::MissingField("path"))?;
                    let mut subpath = String::from(name);
                    for component in path {
                        let raw = component.as_str().ok_or(MetainfoError::InvalidPath)?;
                        let clean = sanitize_component(raw);
                        if clean.is_empty() {
                            continue;
                        }
                        subpath.push('/');
                        subpath.push_str(&clean);
                    }
                    if subpath == name {
                        return Err(MetainfoError::InvalidPath);
                    }
                    out.push((subpath, len as u64));
                }
                Ok(FilePieceMap::new(out))
            }
            (Some(_), Some(_)) => Err(malformed(0, "torrent is both single and multi-file")),
            (None, None) => Err(MetainfoError::MissingField("length")),
        }
    }

    fn parse_announce_list(root: &Value) -> Vec<Vec<String>> {
        let mut tiers: Vec<Vec<String>> = Vec::new();
        if let Some(list) = root.get(b"announce-list").and_then(Value::as_list) {
            for tier in list {
                let Some(tier) = tier.as_list() else { continue };
                let urls: Vec<String> = tier
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|u| !u.is_empty())
                    .map(str::to_owned)
                    .collect();
                if !urls.is_empty() {
                    tiers.push(urls);
                }
            }
        }
        if tiers.is_empty() {
            if let Some(announce) = root.get(b"announce").and_then(Value::as_str) {
                if !announce.is_empty() {
                    tiers.push(vec![announce.to_owned()]);
                }
            }
        }
        tiers
    }

    fn parse_webseeds(root: &Value, multi_file: bool) -> Vec<String> {
        let fix = |url: &str| -> String {
            if multi_file && !url.ends_with('/') {
                format!("{url}/")
            } else {
                url.to_owned()
            }
        };
        match root.get(b"url-list") {
            Some(Value::Bytes(_)) => root
                .get(b"url-list")
                .and_then(Value::as_str)
                .filter(|u| !u.is_empty())
                .map(|u| vec![fix(u)])
                .unwrap_or_default(),
            Some(Value::List(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|u| !u.is_empty())
                .map(fix)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Build a partial metainfo from a magnet link; geometry stays
    /// unknown until the swarm supplies the info dict.
    pub fn from_magnet(magnet: &Magnet) -> Metainfo {
        let name = magnet
            .name
            .clone()
            .or_else(|| magnet.info_hash.map(|h| h.as_string()))
            .or_else(|| magnet.info_hash_v2.map(|h| h.as_string()))
            .unwrap_or_default();
        Metainfo {
            info_hash: magnet.info_hash.unwrap_or_default(),
            info_hash_v2: magnet.info_hash_v2,
            name,
            is_v2: magnet.info_hash_v2.is_some() && magnet.info_hash.is_none(),
            announce_list: magnet.trackers.iter().map(|t| vec![t.clone()]).collect(),
            webseed_urls: magnet.webseeds.clone(),
            ..Default::default()
        }
    }

    pub fn info_hash_str(&self) -> String {
        self.info_hash.as_string()
    }

    pub fn magnet(&self) -> Magnet {
        Magnet {
            info_hash: Some(self.info_hash),
            info_hash_v2: self.info_hash_v2,
            name: Some(self.name.clone()),
            trackers: self.announce_list.iter().flatten().cloned().collect(),
            webseeds: self.webseed_urls.clone(),
        }
    }
}
