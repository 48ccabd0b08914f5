use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use parking_lot::Mutex;
use riptide_core::Id20;
use tracing::{debug, trace};

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_SCRAPE: u32 = 2;
pub const ACTION_ERROR: u32 = 3;

pub const EVENT_NONE: u32 = 0;
pub const EVENT_COMPLETED: u32 = 1;
pub const EVENT_STARTED: u32 = 2;
pub const EVENT_STOPPED: u32 = 3;

pub type ConnectionId = u64;
const CONNECTION_ID_MAGIC: ConnectionId = 0x41727101980;

/// BEP-15: a connection id may be reused for 45 seconds.
const CONNECTION_TTL: Duration = Duration::from_secs(45);

/// Successful DNS lookups are reused for an hour per address family.
pub const DNS_TTL: Duration = Duration::from_secs(60 * 60);

const RECV_TIMEOUT: Duration = Duration::from_secs(15);

pub type TransactionId = u32;

pub fn new_transaction_id() -> TransactionId {
    cryptow::random_u32()
}

#[derive(Debug, Clone)]
pub struct AnnounceFields {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: u32,
    /// Only meaningful for IPv4 announces, and only when the caller
    /// explicitly configured an announce address. 0 otherwise.
    pub ip: u32,
    pub key: u32,
    pub numwant: i32,
    pub port: u16,
}

#[derive(Debug)]
pub enum Request {
    Connect,
    Announce(ConnectionId, AnnounceFields),
    Scrape(ConnectionId, Vec<Id20>),
}

impl Request {
    pub fn serialize(&self, transaction_id: TransactionId, buf: &mut Vec<u8>) -> usize {
        let cur_len = buf.len();
        match self {
            Request::Connect => {
                buf.extend_from_slice(&CONNECTION_ID_MAGIC.to_be_bytes());
                buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
            }
            Request::Announce(connection_id, fields) => {
                buf.extend_from_slice(&connection_id.to_be_bytes());
                buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
                buf.extend_from_slice(&fields.info_hash.0);
                buf.extend_from_slice(&fields.peer_id.0);
                buf.extend_from_slice(&fields.downloaded.to_be_bytes());
                buf.extend_from_slice(&fields.left.to_be_bytes());
                buf.extend_from_slice(&fields.uploaded.to_be_bytes());
                buf.extend_from_slice(&fields.event.to_be_bytes());
                buf.extend_from_slice(&fields.ip.to_be_bytes());
                buf.extend_from_slice(&fields.key.to_be_bytes());
                buf.extend_from_slice(&fields.numwant.to_be_bytes());
                buf.extend_from_slice(&fields.port.to_be_bytes());
            }
            Request::Scrape(connection_id, hashes) => {
                buf.extend_from_slice(&connection_id.to_be_bytes());
                buf.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
                for hash in hashes {
                    buf.extend_from_slice(&hash.0);
                }
            }
        }
        buf.len() - cur_len
    }
}

#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub addrs: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeEntry {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

#[derive(Debug)]
pub enum Response {
    Connect(ConnectionId),
    Announce(AnnounceResponse),
    Scrape(Vec<ScrapeEntry>),
    Error(String),
}

fn split_slice(s: &[u8], first_len: usize) -> Option<(&[u8], &[u8])> {
    if s.len() < first_len {
        return None;
    }
    Some(s.split_at(first_len))
}

fn s_to_arr<const T: usize>(buf: &[u8]) -> [u8; T] {
    let mut arr = [0u8; T];
    arr.copy_from_slice(buf);
    arr
}

trait ParseNum: Sized {
    fn parse_num(buf: &[u8]) -> anyhow::Result<(Self, &[u8])>;
}

macro_rules! parse_impl {
    ($ty:tt, $size:expr) => {
        impl ParseNum for $ty {
            fn parse_num(buf: &[u8]) -> anyhow::Result<($ty, &[u8])> {
                let (bytes, rest) =
                    split_slice(buf, $size).with_context(|| format!("expected {} bytes", $size))?;
                let num = $ty::from_be_bytes(s_to_arr(bytes));
                Ok((num, rest))
            }
        }
    };
}

parse_impl!(u32, 4);
parse_impl!(u64, 8);
parse_impl!(u16, 2);

impl Response {
    /// Parse one datagram. `is_v6` states which address family the
    /// datagram arrived over and thus how the peer list is packed.
    ///
    /// Datagrams shorter than their action's minimum size are dropped
    /// silently by the caller; here they surface as errors.
    pub fn parse(buf: &[u8], is_v6: bool) -> anyhow::Result<(TransactionId, Self)> {
        if buf.len() < 8 {
            bail!("datagram shorter than 8 bytes");
        }
        let (action, buf) = u32::parse_num(buf).context("can't parse action")?;
        let (tid, buf) = u32::parse_num(buf).context("can't parse transaction id")?;
        let response = match action {
            ACTION_CONNECT => {
                let (connection_id, _) =
                    u64::parse_num(buf).context("connect reply shorter than 16 bytes")?;
                Response::Connect(connection_id)
            }
            ACTION_ANNOUNCE => {
                let (interval, b) = u32::parse_num(buf).context("can't parse interval")?;
                let (leechers, b) = u32::parse_num(b).context("can't parse leechers")?;
                let (seeders, mut b) = u32::parse_num(b).context("can't parse seeders")?;
                let mut addrs = Vec::new();
                let entry_len = if is_v6 { 18 } else { 6 };
                while b.len() >= entry_len {
                    if is_v6 {
                        let (ip_bytes, b2) = split_slice(b, 16).unwrap();
                        let ip = Ipv6Addr::from(s_to_arr::<16>(ip_bytes));
                        let (port, b2) = u16::parse_num(b2)?;
                        addrs.push(SocketAddr::from((ip, port)));
                        b = b2;
                    } else {
                        let (ip, b2) = u32::parse_num(b)?;
                        let (port, b2) = u16::parse_num(b2)?;
                        addrs.push(SocketAddr::from((Ipv4Addr::from(ip), port)));
                        b = b2;
                    }
                }
                Response::Announce(AnnounceResponse {
                    interval,
                    leechers,
                    seeders,
                    addrs,
                })
            }
            ACTION_SCRAPE => {
                let mut entries = Vec::new();
                let mut b = buf;
                while b.len() >= 12 {
                    let (seeders, b2) = u32::parse_num(b)?;
                    let (completed, b2) = u32::parse_num(b2)?;
                    let (leechers, b2) = u32::parse_num(b2)?;
                    entries.push(ScrapeEntry {
                        seeders,
                        completed,
                        leechers,
                    });
                    b = b2;
                }
                Response::Scrape(entries)
            }
            ACTION_ERROR => Response::Error(String::from_utf8_lossy(buf).into_owned()),
            _ => bail!("unsupported action {action}"),
        };
        Ok((tid, response))
    }
}

// Minimum valid datagram size per action; anything shorter is noise.
fn min_reply_size(action_hint: &[u8]) -> usize {
    match action_hint.first_chunk::<4>().map(|c| u32::from_be_bytes(*c)) {
        Some(ACTION_CONNECT) => 16,
        Some(ACTION_ANNOUNCE) => 20,
        Some(ACTION_SCRAPE) => 20,
        Some(ACTION_ERROR) => 8,
        _ => usize::MAX,
    }
}

struct CachedConnection {
    connection_id: ConnectionId,
    expires_at: Instant,
}

/// One UDP tracker client shared by every torrent in the session.
/// Connection ids are cached per (authority, family); transaction ids
/// are unique across in-flight requests to the same authority.
pub struct UdpTrackerClient {
    connections: Mutex<HashMap<SocketAddr, CachedConnection>>,
}

impl Default for UdpTrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTrackerClient {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn cached_connection(&self, addr: SocketAddr) -> Option<ConnectionId> {
        let mut g = self.connections.lock();
        match g.get(&addr) {
            Some(c) if c.expires_at > Instant::now() => Some(c.connection_id),
            Some(_) => {
                g.remove(&addr);
                None
            }
            None => None,
        }
    }

    fn store_connection(&self, addr: SocketAddr, connection_id: ConnectionId) {
        self.connections.lock().insert(
            addr,
            CachedConnection {
                connection_id,
                expires_at: Instant::now() + CONNECTION_TTL,
            },
        );
    }

    fn drop_connection(&self, addr: SocketAddr) {
        self.connections.lock().remove(&addr);
    }

    async fn bind_for(addr: SocketAddr) -> anyhow::Result<tokio::net::UdpSocket> {
        let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let sock = tokio::net::UdpSocket::bind(bind_addr)
            .await
            .context("error binding UDP socket")?;
        sock.connect(addr)
            .await
            .context("error connecting UDP socket")?;
        Ok(sock)
    }

    async fn exchange(
        sock: &tokio::net::UdpSocket,
        request: &Request,
        is_v6: bool,
    ) -> anyhow::Result<Response> {
        let tid = new_transaction_id();
        let mut write_buf = Vec::with_capacity(128);
        let size = request.serialize(tid, &mut write_buf);
        trace!(?request, tid, "sending");
        sock.send(&write_buf[..size]).await.context("error sending")?;

        let mut read_buf = vec![0u8; 4096];
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .context("timed out waiting for tracker reply")?;
            let size = tokio::time::timeout(remaining, sock.recv(&mut read_buf))
                .await
                .context("timed out waiting for tracker reply")?
                .context("error receiving")?;
            let datagram = &read_buf[..size];
            if size < min_reply_size(datagram) {
                trace!(size, "dropping undersized datagram");
                continue;
            }
            let (rtid, response) = match Response::parse(datagram, is_v6) {
                Ok(r) => r,
                Err(e) => {
                    trace!("dropping unparseable datagram: {e:#}");
                    continue;
                }
            };
            // a stale datagram from an earlier transaction; keep waiting
            if rtid != tid {
                trace!(expected = tid, got = rtid, "transaction id mismatch");
                continue;
            }
            return Ok(response);
        }
    }

    async fn connect(
        &self,
        sock: &tokio::net::UdpSocket,
        addr: SocketAddr,
    ) -> anyhow::Result<ConnectionId> {
        if let Some(id) = self.cached_connection(addr) {
            return Ok(id);
        }
        trace!(?addr, "sending connect request");
        let response = Self::exchange(sock, &Request::Connect, addr.is_ipv6()).await?;
        match response {
            Response::Connect(connection_id) => {
                self.store_connection(addr, connection_id);
                Ok(connection_id)
            }
            Response::Error(message) => bail!("tracker error: {message}"),
            other => bail!("unexpected response {other:?}, expected connect"),
        }
    }

    pub async fn announce(
        &self,
        addr: SocketAddr,
        fields: AnnounceFields,
    ) -> anyhow::Result<AnnounceResponse> {
        let sock = Self::bind_for(addr).await?;
        let connection_id = self.connect(&sock, addr).await?;
        let request = Request::Announce(connection_id, fields);
        match Self::exchange(&sock, &request, addr.is_ipv6()).await {
            Ok(Response::Announce(r)) => Ok(r),
            Ok(Response::Error(message)) => {
                self.drop_connection(addr);
                bail!("tracker error: {message}")
            }
            Ok(other) => bail!("unexpected response {other:?}, expected announce"),
            Err(e) => {
                // the connection id may be what the tracker disliked
                self.drop_connection(addr);
                Err(e)
            }
        }
    }

    pub async fn scrape(
        &self,
        addr: SocketAddr,
        info_hashes: Vec<Id20>,
    ) -> anyhow::Result<Vec<ScrapeEntry>> {
        let sock = Self::bind_for(addr).await?;
        let connection_id = self.connect(&sock, addr).await?;
        let request = Request::Scrape(connection_id, info_hashes);
        match Self::exchange(&sock, &request, addr.is_ipv6()).await {
            Ok(Response::Scrape(entries)) => Ok(entries),
            Ok(Response::Error(message)) => {
                self.drop_connection(addr);
                bail!("tracker error: {message}")
            }
            Ok(other) => bail!("unexpected response {other:?}, expected scrape"),
            Err(e) => {
                self.drop_connection(addr);
                Err(e)
            }
        }
    }
}

/// DNS results per (host, family), refreshed after [`DNS_TTL`].
pub struct ResolveCache {
    entries: Mutex<HashMap<(String, u16), CachedResolve>>,
}

struct CachedResolve {
    v4: Option<SocketAddr>,
    v6: Option<SocketAddr>,
    resolved_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddrs {
    pub v4: Option<SocketAddr>,
    pub v6: Option<SocketAddr>,
}

impl Default for ResolveCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolveCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<ResolvedAddrs> {
        {
            let g = self.entries.lock();
            if let Some(cached) = g.get(&(host.to_owned(), port)) {
                if cached.resolved_at.elapsed() < DNS_TTL {
                    return Ok(ResolvedAddrs {
                        v4: cached.v4,
                        v6: cached.v6,
                    });
                }
            }
        }

        // first v4 and first v6 address only
        let mut v4: Option<SocketAddr> = None;
        let mut v6: Option<SocketAddr> = None;
        for addr in tokio::net::lookup_host((host, port))
            .await
            .with_context(|| format!("error looking up hostname {host}"))?
        {
            match (&v4, &v6, addr) {
                (None, _, SocketAddr::V4(_)) => v4 = Some(addr),
                (_, None, SocketAddr::V6(_)) => v6 = Some(addr),
                _ => continue,
            }
        }
        if v4.is_none() && v6.is_none() {
            bail!("zero addresses returned looking up {host}");
        }
        debug!(host, ?v4, ?v6, "resolved tracker");
        self.entries.lock().insert(
            (host.to_owned(), port),
            CachedResolve {
                v4,
                v6,
                resolved_at: Instant::now(),
            },
        );
        Ok(ResolvedAddrs { v4, v6 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_connect_request_layout() {
        let mut buf = Vec::new();
        let n = Request::Connect.serialize(0x1234_5678, &mut buf);
        assert_eq!(n, 16);
        assert_eq!(&buf[..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_announce_request_layout() {
        let hash = Id20::from_str("d2354010a3ca4ade5b7427bb093a62a3899ff381").unwrap();
        let fields = AnnounceFields {
            info_hash: hash,
            peer_id: hash,
            downloaded: 1,
            left: 2,
            uploaded: 3,
            event: EVENT_STARTED,
            ip: 0,
            key: 0xdeadbeef,
            numwant: -1,
            port: 6881,
        };
        let mut buf = Vec::new();
        let n = Request::Announce(0x42, fields).serialize(7, &mut buf);
        assert_eq!(n, 98);
        assert_eq!(&buf[..8], &0x42u64.to_be_bytes());
        assert_eq!(&buf[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        assert_eq!(&buf[16..36], &hash.0);
        // event at offset 80, ip 84, key 88, numwant 92, port 96
        assert_eq!(&buf[80..84], &EVENT_STARTED.to_be_bytes());
        assert_eq!(&buf[84..88], &[0, 0, 0, 0]);
        assert_eq!(&buf[88..92], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&buf[92..96], &(-1i32).to_be_bytes());
        assert_eq!(&buf[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_parse_connect_reply() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        buf.extend_from_slice(&77u32.to_be_bytes());
        buf.extend_from_slice(&0xabcdef0102u64.to_be_bytes());
        let (tid, r) = Response::parse(&buf, false).unwrap();
        assert_eq!(tid, 77);
        assert!(matches!(r, Response::Connect(0xabcdef0102)));
    }

    #[test]
    fn test_parse_announce_reply_v4() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&9u32.to_be_bytes());
        buf.extend_from_slice(&[10, 0, 0, 1]);
        buf.extend_from_slice(&6881u16.to_be_bytes());
        let (tid, r) = Response::parse(&buf, false).unwrap();
        assert_eq!(tid, 5);
        match r {
            Response::Announce(a) => {
                assert_eq!(a.interval, 1800);
                assert_eq!(a.leechers, 3);
                assert_eq!(a.seeders, 9);
                assert_eq!(a.addrs, vec!["10.0.0.1:6881".parse().unwrap()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_announce_reply_v6() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        buf.extend_from_slice(&6881u16.to_be_bytes());
        let (_, r) = Response::parse(&buf, true).unwrap();
        match r {
            Response::Announce(a) => {
                assert_eq!(a.addrs, vec!["[::1]:6881".parse().unwrap()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_scrape_reply() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        for n in [10u32, 20, 30, 1, 2, 3] {
            buf.extend_from_slice(&n.to_be_bytes());
        }
        let (_, r) = Response::parse(&buf, false).unwrap();
        match r {
            Response::Scrape(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(
                    entries[0],
                    ScrapeEntry {
                        seeders: 10,
                        completed: 20,
                        leechers: 30
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_reply() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(b"boom");
        let (_, r) = Response::parse(&buf, false).unwrap();
        assert!(matches!(r, Response::Error(m) if m == "boom"));
    }

    #[test]
    fn test_undersized_datagrams_rejected() {
        assert!(Response::parse(&[0u8; 7], false).is_err());
        // connect reply must be 16 bytes
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        assert!(Response::parse(&buf, false).is_err());
    }

    #[test]
    fn test_min_reply_sizes() {
        assert_eq!(min_reply_size(&ACTION_CONNECT.to_be_bytes()), 16);
        assert_eq!(min_reply_size(&ACTION_ANNOUNCE.to_be_bytes()), 20);
        assert_eq!(min_reply_size(&ACTION_SCRAPE.to_be_bytes()), 20);
        assert_eq!(min_reply_size(&ACTION_ERROR.to_be_bytes()), 8);
        assert_eq!(min_reply_size(&[9, 9]), usize::MAX);
    }

    #[test]
    fn test_connection_id_expires_after_ttl() {
        let client = UdpTrackerClient::new();
        let addr: SocketAddr = "127.0.0.1:6969".parse().unwrap();
        client.store_connection(addr, 99);
        assert_eq!(client.cached_connection(addr), Some(99));
        // age the entry past the 45s window; the next user must
        // re-connect
        client
            .connections
            .lock()
            .get_mut(&addr)
            .unwrap()
            .expires_at = Instant::now() - Duration::from_secs(1);
        assert_eq!(client.cached_connection(addr), None);
    }

    #[tokio::test]
    async fn test_connection_id_cached_and_reused() {
        // local mock tracker: replies to connect, then expects the
        // cached id on announce
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut announces_seen = Vec::new();
            for _ in 0..2 {
                let (n, from) = server.recv_from(&mut buf).await.unwrap();
                let pkt = &buf[..n];
                let action = u32::from_be_bytes(pkt[8..12].try_into().unwrap());
                let tid = &pkt[12..16];
                match action {
                    ACTION_CONNECT => {
                        let mut reply = Vec::new();
                        reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                        reply.extend_from_slice(tid);
                        reply.extend_from_slice(&0xfeedfaceu64.to_be_bytes());
                        server.send_to(&reply, from).await.unwrap();
                    }
                    ACTION_ANNOUNCE => {
                        announces_seen
                            .push(u64::from_be_bytes(pkt[..8].try_into().unwrap()));
                        let mut reply = Vec::new();
                        reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                        reply.extend_from_slice(tid);
                        reply.extend_from_slice(&1800u32.to_be_bytes());
                        reply.extend_from_slice(&0u32.to_be_bytes());
                        reply.extend_from_slice(&1u32.to_be_bytes());
                        server.send_to(&reply, from).await.unwrap();
                    }
                    _ => panic!("unexpected action {action}"),
                }
            }
            announces_seen
        });

        let client = UdpTrackerClient::new();
        let fields = AnnounceFields {
            info_hash: Id20::default(),
            peer_id: Id20::default(),
            downloaded: 0,
            left: 0,
            uploaded: 0,
            event: EVENT_NONE,
            ip: 0,
            key: 1,
            numwant: -1,
            port: 6881,
        };
        let response = client.announce(server_addr, fields).await.unwrap();
        assert_eq!(response.interval, 1800);

        let announces = server_task.await.unwrap();
        assert_eq!(announces, vec![0xfeedface]);
        // the connection id is now cached for the authority
        assert_eq!(client.cached_connection(server_addr), Some(0xfeedface));
    }
}
