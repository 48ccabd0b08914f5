//! IP blocklists: parse the common text formats, compile to sorted
//! binary ranges, answer membership queries in O(log n).

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use tracing::{debug, info, warn};

/// Sentinel at the start of the compiled binary form. A file without it
/// (or with a malformed payload) is rebuilt from its source text.
const BIN_PREFIX: &[u8] = b"-tr-blocklist-file-format-v3-";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Blocklist {
    // sorted, coalesced, inclusive ranges
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
}

// PeerGuardian text: "comment:1.2.3.4-5.6.7.8". The comment ends at
// the first colon so v6 range text keeps its own colons.
fn parse_peer_guardian(line: &str) -> Option<(IpAddr, IpAddr)> {
    let (_comment, range) = line.split_once(':')?;
    let (a, b) = range.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

// DAT / eMule: "000.000.000.000 - 000.255.255.255 , 000 , comment"
fn parse_emule(line: &str) -> Option<(IpAddr, IpAddr)> {
    let (range, _rest) = line.split_once(" , ")?;
    let (a, b) = range.split_once(" - ")?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

// CIDR, IPv4 only: "10.5.6.7/8" blocks [10.0.0.0 .. 10.255.255.255]
fn parse_cidr(line: &str) -> Option<(IpAddr, IpAddr)> {
    let (addr, prefix) = line.split_once('/')?;
    let addr: Ipv4Addr = addr.trim().parse().ok()?;
    let prefix: u32 = prefix.trim().parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask: u32 = if prefix == 0 {
        0
    } else {
        !(u32::MAX >> prefix)
    };
    let ip = u32::from_be_bytes(addr.octets());
    let low = Ipv4Addr::from(ip & mask);
    let high = Ipv4Addr::from(ip | !mask);
    Some((IpAddr::V4(low), IpAddr::V4(high)))
}

fn parse_line(line: &str) -> Option<(IpAddr, IpAddr)> {
    for parser in [parse_peer_guardian, parse_emule, parse_cidr] {
        if let Some(range) = parser(line) {
            return Some(range);
        }
    }
    None
}

fn coalesce<T: Ord + Copy>(mut ranges: Vec<(T, T)>) -> Vec<(T, T)>
where
    T: num_like::NumLike,
{
    ranges.sort_unstable();
    let mut out: Vec<(T, T)> = Vec::with_capacity(ranges.len());
    for (lo, hi) in ranges {
        match out.last_mut() {
            // merge overlapping and touching neighbours
            Some((_, prev_hi)) if lo <= prev_hi.saturating_inc() => {
                if hi > *prev_hi {
                    *prev_hi = hi;
                }
            }
            _ => out.push((lo, hi)),
        }
    }
    out
}

// The coalescer needs "x + 1 that doesn't wrap" for two integer widths.
mod num_like {
    pub trait NumLike: Copy {
        fn saturating_inc(self) -> Self;
    }
    impl NumLike for u32 {
        fn saturating_inc(self) -> Self {
            self.saturating_add(1)
        }
    }
    impl NumLike for u128 {
        fn saturating_inc(self) -> Self {
            self.saturating_add(1)
        }
    }
}

fn contains_sorted<T: Ord + Copy>(ranges: &[(T, T)], x: T) -> bool {
    let idx = ranges.partition_point(|(lo, _)| *lo <= x);
    match idx.checked_sub(1).and_then(|i| ranges.get(i)) {
        Some((_, hi)) => x <= *hi,
        None => false,
    }
}

impl Blocklist {
    pub fn empty() -> Self {
        Default::default()
    }

    /// Parse blocklist text: PeerGuardian, eMule/DAT and IPv4 CIDR
    /// lines, in any mix. Bad lines are skipped with a log message.
    pub fn parse_text(text: &str) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        let mut skipped = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((IpAddr::V4(a), IpAddr::V4(b))) => {
                    let (a, b) = (u32::from_be_bytes(a.octets()), u32::from_be_bytes(b.octets()));
                    v4.push((a.min(b), a.max(b)));
                }
                Some((IpAddr::V6(a), IpAddr::V6(b))) => {
                    let (a, b) = (
                        u128::from_be_bytes(a.octets()),
                        u128::from_be_bytes(b.octets()),
                    );
                    v6.push((a.min(b), a.max(b)));
                }
                // mixed-family endpoints are nonsense
                Some(_) | None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, "skipped unparseable blocklist lines");
        }
        let list = Self {
            v4: coalesce(v4),
            v6: coalesce(v6),
        };
        info!(
            v4_ranges = list.v4.len(),
            v6_ranges = list.v6.len(),
            "compiled blocklist"
        );
        list
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// O(log n), no side effects.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(a) => contains_sorted(&self.v4, u32::from_be_bytes(a.octets())),
            IpAddr::V6(a) => contains_sorted(&self.v6, u128::from_be_bytes(a.octets())),
        }
    }

    /// Serialise the compiled form: sentinel, counts, packed pairs.
    /// Host endianness; the file is a cache, not an interchange format.
    pub fn save_bin(&self, path: &Path) -> io::Result<()> {
        let mut out = Vec::with_capacity(
            BIN_PREFIX.len() + 16 + self.v4.len() * 8 + self.v6.len() * 32,
        );
        out.extend_from_slice(BIN_PREFIX);
        out.extend_from_slice(&(self.v4.len() as u64).to_ne_bytes());
        out.extend_from_slice(&(self.v6.len() as u64).to_ne_bytes());
        for (lo, hi) in &self.v4 {
            out.extend_from_slice(&lo.to_ne_bytes());
            out.extend_from_slice(&hi.to_ne_bytes());
        }
        for (lo, hi) in &self.v6 {
            out.extend_from_slice(&lo.to_ne_bytes());
            out.extend_from_slice(&hi.to_ne_bytes());
        }
        let mut f = std::fs::File::create(path)?;
        f.write_all(&out)?;
        Ok(())
    }

    pub fn load_bin(path: &Path) -> io::Result<Self> {
        let mut buf = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut buf)?;
        let malformed = || io::Error::new(io::ErrorKind::InvalidData, "corrupt blocklist cache");

        let rest = buf.strip_prefix(BIN_PREFIX).ok_or_else(malformed)?;
        if rest.len() < 16 {
            return Err(malformed());
        }
        let n_v4 = u64::from_ne_bytes(rest[..8].try_into().unwrap()) as usize;
        let n_v6 = u64::from_ne_bytes(rest[8..16].try_into().unwrap()) as usize;
        let payload = &rest[16..];
        let expected = n_v4
            .checked_mul(8)
            .and_then(|a| n_v6.checked_mul(32).map(|b| a + b))
            .ok_or_else(malformed)?;
        if payload.len() != expected {
            return Err(malformed());
        }
        let mut v4 = Vec::with_capacity(n_v4);
        let mut v6 = Vec::with_capacity(n_v6);
        let (v4_bytes, v6_bytes) = payload.split_at(n_v4 * 8);
        for pair in v4_bytes.chunks_exact(8) {
            v4.push((
                u32::from_ne_bytes(pair[..4].try_into().unwrap()),
                u32::from_ne_bytes(pair[4..].try_into().unwrap()),
            ));
        }
        for pair in v6_bytes.chunks_exact(32) {
            v6.push((
                u128::from_ne_bytes(pair[..16].try_into().unwrap()),
                u128::from_ne_bytes(pair[16..].try_into().unwrap()),
            ));
        }
        Ok(Self { v4, v6 })
    }

    /// Load the compiled cache, rebuilding it from the source text when
    /// the cache is missing or corrupt.
    pub fn load(bin_path: &Path, source_path: Option<&Path>) -> Self {
        match Self::load_bin(bin_path) {
            Ok(list) => return list,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(?bin_path, "blocklist cache unusable: {e:#}"),
        }
        let Some(source) = source_path else {
            return Self::empty();
        };
        let text = match std::fs::read_to_string(source) {
            Ok(t) => t,
            Err(e) => {
                warn!(?source, "couldn't read blocklist source: {e:#}");
                return Self::empty();
            }
        };
        let list = Self::parse_text(&text);
        if let Err(e) = list.save_bin(bin_path) {
            warn!(?bin_path, "couldn't save blocklist cache: {e:#}");
        }
        list
    }
}
