use std::collections::HashMap;
use std::fmt::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{bail, Context};
use bencode::Value;
use riptide_core::Id20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
        }
    }
}

pub struct AnnounceRequest<'a> {
    pub info_hash: &'a Id20,
    pub peer_id: &'a Id20,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub corrupt: u64,
    pub event: AnnounceEvent,
    pub numwant: usize,
    pub key: u32,
    pub require_crypto: bool,
    /// A partial seed has all the files it wants but not the whole
    /// torrent; BEP-21 spells that "paused".
    pub partial_seed: bool,
    pub tracker_id: Option<&'a str>,
    pub ip: Option<IpAddr>,
}

// Percent-encoding for raw hash bytes: uppercase %XX triplets,
// unreserved characters pass through.
fn encode_binary(out: &mut String, bytes: &[u8]) {
    for b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*b as char)
            }
            _ => {
                write!(out, "%{b:02X}").unwrap();
            }
        }
    }
}

impl AnnounceRequest<'_> {
    pub fn as_querystring(&self) -> String {
        let mut s = String::with_capacity(256);
        s.push_str("info_hash=");
        encode_binary(&mut s, &self.info_hash.0);
        s.push_str("&peer_id=");
        encode_binary(&mut s, &self.peer_id.0);
        write!(s, "&port={}", self.port).unwrap();
        write!(s, "&uploaded={}", self.uploaded).unwrap();
        write!(s, "&downloaded={}", self.downloaded).unwrap();
        write!(s, "&left={}", self.left).unwrap();
        write!(s, "&numwant={}", self.numwant).unwrap();
        write!(s, "&key={:08x}", self.key).unwrap();
        s.push_str("&compact=1&supportcrypto=1");
        if self.require_crypto {
            s.push_str("&requirecrypto=1");
        }
        if self.corrupt > 0 {
            write!(s, "&corrupt={}", self.corrupt).unwrap();
        }
        // a partial seed announces "paused" for every event except its
        // own departure
        if self.partial_seed && self.event != AnnounceEvent::Stopped {
            s.push_str("&event=paused");
        } else if let Some(event) = self.event.as_str() {
            write!(s, "&event={event}").unwrap();
        }
        if let Some(trackerid) = self.tracker_id {
            write!(s, "&trackerid={trackerid}").unwrap();
        }
        if let Some(ip) = self.ip {
            write!(s, "&ip={ip}").unwrap();
        }
        s
    }
}

#[derive(Debug, Default, Clone)]
pub struct AnnounceResponse {
    pub interval: Option<u64>,
    pub min_interval: Option<u64>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub downloaded: Option<u64>,
    pub tracker_id: Option<String>,
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    pub peers: Vec<SocketAddr>,
    pub external_ip: Option<Ipv4Addr>,
}

fn parse_compact_v4(buf: &[u8], out: &mut Vec<SocketAddr>) {
    for chunk in buf.chunks_exact(6) {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        out.push(SocketAddr::from((ip, port)));
    }
}

fn parse_compact_v6(buf: &[u8], out: &mut Vec<SocketAddr>) {
    for chunk in buf.chunks_exact(18) {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&chunk[..16]);
        let port = u16::from_be_bytes([chunk[16], chunk[17]]);
        out.push(SocketAddr::from((Ipv6Addr::from(octets), port)));
    }
}

fn parse_dict_peers(list: &[Value], out: &mut Vec<SocketAddr>) {
    for peer in list {
        let Some(ip) = peer
            .get(b"ip")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<IpAddr>().ok())
        else {
            continue;
        };
        let Some(port) = peer
            .get(b"port")
            .and_then(Value::as_int)
            .and_then(|p| u16::try_from(p).ok())
        else {
            continue;
        };
        out.push(SocketAddr::from((ip, port)));
    }
}

fn opt_u64(v: Option<&Value>) -> Option<u64> {
    v.and_then(Value::as_int).and_then(|i| u64::try_from(i).ok())
}

fn opt_string(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

impl AnnounceResponse {
    pub fn parse(buf: &[u8]) -> anyhow::Result<AnnounceResponse> {
        let root = Value::parse(buf).context("tracker response is not bencoded")?;
        if root.as_dict().is_none() {
            bail!("tracker response is not a dict");
        }

        let mut peers = Vec::new();
        match root.get(b"peers") {
            Some(Value::Bytes(b)) => parse_compact_v4(b, &mut peers),
            Some(Value::List(l)) => parse_dict_peers(l, &mut peers),
            _ => {}
        }
        if let Some(Value::Bytes(b)) = root.get(b"peers6") {
            parse_compact_v6(b, &mut peers);
        }

        let external_ip = root
            .get(b"external ip")
            .and_then(Value::as_bytes)
            .filter(|b| b.len() == 4)
            .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]));

        Ok(AnnounceResponse {
            interval: opt_u64(root.get(b"interval")),
            min_interval: opt_u64(root.get(b"min interval")),
            complete: opt_u64(root.get(b"complete")),
            incomplete: opt_u64(root.get(b"incomplete")),
            downloaded: opt_u64(root.get(b"downloaded")),
            tracker_id: opt_string(root.get(b"tracker id")),
            failure_reason: opt_string(root.get(b"failure reason")),
            warning_message: opt_string(root.get(b"warning message")),
            peers,
            external_ip,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeCounts {
    pub seeders: u64,
    pub leechers: u64,
    pub downloaded: u64,
}

#[derive(Debug, Default)]
pub struct ScrapeResponse {
    pub files: HashMap<Id20, ScrapeCounts>,
}

impl ScrapeResponse {
    pub fn parse(buf: &[u8]) -> anyhow::Result<ScrapeResponse> {
        let root = Value::parse(buf).context("scrape response is not bencoded")?;
        let mut files = HashMap::new();
        if let Some(dict) = root.get(b"files").and_then(Value::as_dict) {
            for (hash, counts) in dict {
                let Ok(id) = Id20::from_bytes(hash) else {
                    continue;
                };
                files.insert(
                    id,
                    ScrapeCounts {
                        seeders: opt_u64(counts.get(b"complete")).unwrap_or(0),
                        leechers: opt_u64(counts.get(b"incomplete")).unwrap_or(0),
                        downloaded: opt_u64(counts.get(b"downloaded")).unwrap_or(0),
                    },
                );
            }
        }
        Ok(ScrapeResponse { files })
    }
}

/// BEP-48: the scrape URL exists iff the announce URL's final path
/// segment begins with "announce"; that prefix becomes "scrape".
pub fn scrape_url_for(announce_url: &str) -> Option<String> {
    let (head, query) = match announce_url.split_once('?') {
        Some((h, q)) => (h, Some(q)),
        None => (announce_url, None),
    };
    let slash = head.rfind('/')?;
    let last = &head[slash + 1..];
    let rest = last.strip_prefix("announce")?;
    let mut out = format!("{}scrape{rest}", &head[..slash + 1]);
    if let Some(q) = query {
        out.push('?');
        out.push_str(q);
    }
    Some(out)
}

/// Build the full announce URL, preserving any query the tracker URL
/// already carries.
pub fn announce_url(tracker_url: &str, request: &AnnounceRequest<'_>) -> String {
    let qs = request.as_querystring();
    if tracker_url.contains('?') {
        format!("{tracker_url}&{qs}")
    } else {
        format!("{tracker_url}?{qs}")
    }
}

pub fn scrape_request_url(scrape_url: &str, info_hashes: &[Id20]) -> String {
    let mut s = String::with_capacity(scrape_url.len() + info_hashes.len() * 64);
    s.push_str(scrape_url);
    let mut sep = if scrape_url.contains('?') { '&' } else { '?' };
    for hash in info_hashes {
        s.push(sep);
        s.push_str("info_hash=");
        encode_binary(&mut s, &hash.0);
        sep = '&';
    }
    s
}

/// How far an attempt got before failing. When the v4 and v6 halves of
/// a dual-stack announce both fail, the one that got further is the one
/// worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureRank {
    Dns,
    Connect,
    Timeout,
    HttpStatus,
    BadPayload,
}

pub fn rank_reqwest_error(e: &reqwest::Error) -> FailureRank {
    if e.is_timeout() {
        FailureRank::Timeout
    } else if e.is_connect() {
        FailureRank::Connect
    } else if e.is_status() {
        FailureRank::HttpStatus
    } else {
        FailureRank::Dns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn request<'a>(info_hash: &'a Id20, peer_id: &'a Id20) -> AnnounceRequest<'a> {
        AnnounceRequest {
            info_hash,
            peer_id,
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            corrupt: 0,
            event: AnnounceEvent::Started,
            numwant: 80,
            key: 0xabcd1234,
            require_crypto: false,
            partial_seed: false,
            tracker_id: None,
            ip: None,
        }
    }

    #[test]
    fn test_querystring_escaping() {
        let info_hash = Id20::new([
            0x00, 0x01, 0x41, 0xff, 0x7e, 0x20, 0x25, 0x61, 0x09, 0x10, //
            0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a,
        ]);
        let peer_id = info_hash;
        let qs = request(&info_hash, &peer_id).as_querystring();
        assert!(qs.starts_with("info_hash=%00%01A%FF~%20%25a%09"));
        assert!(qs.contains("&compact=1&supportcrypto=1"));
        assert!(qs.contains("&event=started"));
        assert!(qs.contains("&key=abcd1234"));
    }

    #[test]
    fn test_partial_seed_announces_paused() {
        let h = Id20::default();
        let mut r = request(&h, &h);
        r.partial_seed = true;
        assert!(r.as_querystring().contains("&event=paused"));
        r.event = AnnounceEvent::Stopped;
        assert!(r.as_querystring().contains("&event=stopped"));
    }

    #[test]
    fn test_parse_compact_response() {
        let buf = b"d8:completei5e10:incompletei2e8:intervali1800e5:peers6:iiiipp6:peers618:iiiiiiiiiiiiiiiippe";
        let r = AnnounceResponse::parse(buf).unwrap();
        assert_eq!(r.interval, Some(1800));
        assert_eq!(r.complete, Some(5));
        assert_eq!(r.incomplete, Some(2));
        assert_eq!(
            r.peers,
            vec![
                "105.105.105.105:28784".parse().unwrap(),
                "[6969:6969:6969:6969:6969:6969:6969:6969]:28784"
                    .parse()
                    .unwrap()
            ]
        );
    }

    #[test]
    fn test_parse_dict_peers() {
        let buf =
            b"d8:intervali60e5:peersld2:ip9:127.0.0.14:porti100eed2:ip3:bad4:porti1eeee";
        let r = AnnounceResponse::parse(buf).unwrap();
        assert_eq!(r.peers, vec!["127.0.0.1:100".parse().unwrap()]);
    }

    #[test]
    fn test_parse_failure_and_warning() {
        let buf = b"d14:failure reason9:not found15:warning message4:slowe";
        let r = AnnounceResponse::parse(buf).unwrap();
        assert_eq!(r.failure_reason.as_deref(), Some("not found"));
        assert_eq!(r.warning_message.as_deref(), Some("slow"));
    }

    #[test]
    fn test_parse_external_ip() {
        let buf = b"d11:external ip4:\x01\x02\x03\x04e";
        let r = AnnounceResponse::parse(buf).unwrap();
        assert_eq!(r.external_ip, Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn test_scrape_url_derivation() {
        assert_eq!(
            scrape_url_for("http://t.example/announce").as_deref(),
            Some("http://t.example/scrape")
        );
        assert_eq!(
            scrape_url_for("http://t.example/announce.php?pass=1").as_deref(),
            Some("http://t.example/scrape.php?pass=1")
        );
        assert_eq!(scrape_url_for("http://t.example/a"), None);
    }

    #[test]
    fn test_scrape_response_parse() {
        let hash = Id20::from_str("d2354010a3ca4ade5b7427bb093a62a3899ff381").unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d5:filesd20:");
        buf.extend_from_slice(&hash.0);
        buf.extend_from_slice(b"d8:completei10e10:downloadedi99e10:incompletei3eeee");
        let r = ScrapeResponse::parse(&buf).unwrap();
        let counts = r.files.get(&hash).unwrap();
        assert_eq!(
            *counts,
            ScrapeCounts {
                seeders: 10,
                leechers: 3,
                downloaded: 99
            }
        );
    }

    #[test]
    fn test_failure_rank_ordering() {
        assert!(FailureRank::HttpStatus > FailureRank::Connect);
        assert!(FailureRank::Connect > FailureRank::Dns);
    }
}
