use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, debug_span, trace, warn, Instrument};
use url::Url;

use riptide_core::Id20;

use crate::http::{
    self, AnnounceEvent, AnnounceRequest, AnnounceResponse, FailureRank, ScrapeResponse,
};
use crate::udp::{self, ResolveCache, UdpTrackerClient};

/// Fallback when the tracker supplies no interval.
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60 * 22);
const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60 * 30);
/// Upkeep granularity; every due-time below is checked on this tick.
const UPKEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentState {
    #[default]
    None,
    Initializing,
    Paused,
    Live,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct AnnounceStats {
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub corrupt_bytes: u64,
    pub total_bytes: u64,
    pub torrent_state: TorrentState,
    pub is_partial_seed: bool,
}

impl AnnounceStats {
    pub fn left_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.downloaded_bytes)
    }

    pub fn is_completed(&self) -> bool {
        self.total_bytes > 0 && self.downloaded_bytes >= self.total_bytes
    }
}

/// Capability trait the torrent implements so the announcer can read
/// transfer counters without holding the torrent itself.
pub trait TorrentStatsProvider: Send + Sync {
    fn get(&self) -> AnnounceStats;
}

impl TorrentStatsProvider for () {
    fn get(&self) -> AnnounceStats {
        Default::default()
    }
}

/// Announce outcomes flow back to the torrent through this trait; every
/// method is optional.
pub trait TrackerEventSink: Send + Sync {
    fn on_success(&self, _announce_url: &str) {}
    fn on_warning(&self, _announce_url: &str, _message: &str) {}
    fn on_error(&self, _announce_url: &str, _message: &str) {}
    fn on_counts(&self, _announce_url: &str, _seeders: u64, _leechers: u64, _downloaded: u64) {}
}

impl TrackerEventSink for () {}

#[derive(Clone)]
pub struct AnnouncerConfig {
    pub peer_id: Id20,
    pub port: u16,
    pub numwant: usize,
    /// Explicitly configured announce address. When set, dual-stack
    /// announcing is off and the address rides along in the request.
    pub announce_ip: Option<IpAddr>,
    pub require_crypto: bool,
    pub force_interval: Option<Duration>,
}

impl AnnouncerConfig {
    pub fn new(peer_id: Id20, port: u16) -> Self {
        Self {
            peer_id,
            port,
            numwant: 80,
            announce_ip: None,
            require_crypto: false,
            force_interval: None,
        }
    }
}

/// Per-tracker announce state within a tier.
struct TrackerState {
    announce_url: String,
    scrape_url: Option<String>,
    tracker_id: Option<String>,
    consecutive_failures: u32,
}

struct Tier {
    trackers: Vec<TrackerState>,
    current: usize,
    next_announce_at: Instant,
    next_scrape_at: Instant,
    announce_interval: Duration,
    min_announce_interval: Option<Duration>,
}

impl Tier {
    fn new(urls: Vec<String>) -> Self {
        let trackers = urls
            .into_iter()
            .map(|announce_url| TrackerState {
                scrape_url: http::scrape_url_for(&announce_url),
                announce_url,
                tracker_id: None,
                consecutive_failures: 0,
            })
            .collect();
        let now = Instant::now();
        Self {
            trackers,
            current: 0,
            next_announce_at: now,
            next_scrape_at: now + Duration::from_secs(10),
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            min_announce_interval: None,
        }
    }

    fn current_tracker(&mut self) -> &mut TrackerState {
        let idx = self.current % self.trackers.len();
        &mut self.trackers[idx]
    }

    fn rotate(&mut self) {
        self.current = (self.current + 1) % self.trackers.len();
    }

    fn backoff_delay(failures: u32) -> Duration {
        let base = 60u64.saturating_mul(1 << failures.min(6));
        let jitter = (cryptow::random_u32() % 30) as u64;
        Duration::from_secs(base.min(3600) + jitter)
    }
}

enum TrackerProtocol {
    Http,
    Udp { host: String, port: u16 },
}

fn classify(url_text: &str) -> Option<TrackerProtocol> {
    let url = Url::parse(url_text).ok()?;
    match url.scheme() {
        "http" | "https" => Some(TrackerProtocol::Http),
        "udp" => {
            let host = url.host_str()?.to_owned();
            let port = url.port()?;
            Some(TrackerProtocol::Udp { host, port })
        }
        _ => {
            debug!("unsupported tracker URL: {url_text}");
            None
        }
    }
}

/// Shared clients: one pair of bound HTTP clients for dual-stack
/// announcing, one UDP client, one DNS cache. One per session.
pub struct TrackerClients {
    http_any: reqwest::Client,
    http_v4: Option<reqwest::Client>,
    http_v6: Option<reqwest::Client>,
    udp: UdpTrackerClient,
    resolver: ResolveCache,
}

impl TrackerClients {
    pub fn new() -> Self {
        // TR_CURL_VERBOSE historically turned on transfer-level debug
        // output; map it onto connection tracing
        let verbose = std::env::var_os("TR_CURL_VERBOSE").is_some();
        let builder = move || {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .connection_verbose(verbose)
        };
        Self {
            http_any: builder().build().unwrap_or_default(),
            http_v4: builder()
                .local_address(Some(IpAddr::from([0u8, 0, 0, 0])))
                .build()
                .ok(),
            http_v6: builder()
                .local_address(Some(IpAddr::from([0u16; 8])))
                .build()
                .ok(),
            udp: UdpTrackerClient::new(),
            resolver: ResolveCache::new(),
        }
    }
}

impl Default for TrackerClients {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Announcer {
    info_hash: Id20,
    config: AnnouncerConfig,
    stats: Box<dyn TorrentStatsProvider>,
    events: Box<dyn TrackerEventSink>,
    clients: Arc<TrackerClients>,
    key: u32,
}

impl Announcer {
    /// Start announcing; peers stream out of the returned stream until
    /// the stream is dropped.
    pub fn start(
        info_hash: Id20,
        announce_list: Vec<Vec<String>>,
        config: AnnouncerConfig,
        stats: Box<dyn TorrentStatsProvider>,
        events: Box<dyn TrackerEventSink>,
        clients: Arc<TrackerClients>,
    ) -> Option<BoxStream<'static, SocketAddr>> {
        let tiers: Vec<Tier> = announce_list
            .into_iter()
            .map(|mut urls| {
                // BEP-12: the order within a tier is randomized by the
                // client before use
                urls.shuffle(&mut rand::rng());
                Tier::new(urls)
            })
            .filter(|t| !t.trackers.is_empty())
            .collect();
        if tiers.is_empty() {
            debug!(?info_hash, "announce list is empty");
            return None;
        }

        let announcer = Arc::new(Self {
            info_hash,
            config,
            stats,
            events,
            clients,
            key: cryptow::random_u32(),
        });

        let (out_tx, out_rx) = mpsc::channel::<SocketAddr>(16);
        let span = debug_span!("announcer", info_hash = ?info_hash);
        tokio::spawn(
            async move {
                announcer.run(tiers, out_tx).await;
            }
            .instrument(span),
        );
        Some(tokio_stream::wrappers::ReceiverStream::new(out_rx).boxed())
    }

    async fn run(self: Arc<Self>, mut tiers: Vec<Tier>, out_tx: mpsc::Sender<SocketAddr>) {
        let mut pending_event = Some(AnnounceEvent::Started);
        let mut was_completed = self.stats.get().is_completed();
        let mut ticker = tokio::time::interval(UPKEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = out_tx.closed() => {
                    // consumer went away; tell trackers we stopped
                    self.announce_stopped(&mut tiers).await;
                    return;
                }
            }

            let stats = self.stats.get();
            if stats.is_completed() && !was_completed {
                pending_event = Some(AnnounceEvent::Completed);
            }
            was_completed = stats.is_completed();

            let now = Instant::now();
            for tier in tiers.iter_mut() {
                if now >= tier.next_announce_at {
                    let event = pending_event.take().unwrap_or(AnnounceEvent::None);
                    self.announce_tier(tier, event, &stats, &out_tx).await;
                }
                if now >= tier.next_scrape_at {
                    tier.next_scrape_at = now + DEFAULT_SCRAPE_INTERVAL;
                    self.scrape_tier(tier).await;
                }
            }
        }
    }

    async fn announce_stopped(&self, tiers: &mut [Tier]) {
        let stats = self.stats.get();
        for tier in tiers.iter_mut() {
            let result = self
                .announce_once(tier, AnnounceEvent::Stopped, &stats)
                .await;
            if let Err(e) = result {
                trace!("error sending stopped event: {e:#}");
            }
        }
    }

    async fn announce_tier(
        &self,
        tier: &mut Tier,
        event: AnnounceEvent,
        stats: &AnnounceStats,
        out_tx: &mpsc::Sender<SocketAddr>,
    ) {
        match self.announce_once(tier, event, stats).await {
            Ok(response) => {
                let tracker = tier.current_tracker();
                tracker.consecutive_failures = 0;
                if let Some(id) = &response.tracker_id {
                    tracker.tracker_id = Some(id.clone());
                }
                let url = tracker.announce_url.clone();
                if let Some(warning) = &response.warning_message {
                    warn!(%url, "tracker warning: {warning}");
                    self.events.on_warning(&url, warning);
                }
                self.events.on_success(&url);
                if let (Some(s), Some(l)) = (response.complete, response.incomplete) {
                    self.events
                        .on_counts(&url, s, l, response.downloaded.unwrap_or(0));
                }
                tier.announce_interval = self
                    .config
                    .force_interval
                    .or(response.interval.map(Duration::from_secs))
                    .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL);
                tier.min_announce_interval = response.min_interval.map(Duration::from_secs);
                if let Some(min) = tier.min_announce_interval {
                    tier.announce_interval = tier.announce_interval.max(min);
                }
                tier.next_announce_at = Instant::now() + tier.announce_interval;
                for addr in response.peers {
                    if out_tx.send(addr).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let tracker = tier.current_tracker();
                tracker.consecutive_failures += 1;
                let failures = tracker.consecutive_failures;
                let url = tracker.announce_url.clone();
                debug!(%url, failures, "announce failed: {e:#}");
                self.events.on_error(&url, &format!("{e:#}"));
                tier.rotate();
                tier.next_announce_at = Instant::now() + Tier::backoff_delay(failures);
            }
        }
    }

    async fn announce_once(
        &self,
        tier: &mut Tier,
        event: AnnounceEvent,
        stats: &AnnounceStats,
    ) -> anyhow::Result<AnnounceResponse> {
        let tracker = tier.current_tracker();
        let announce_url = tracker.announce_url.clone();
        let tracker_id = tracker.tracker_id.clone();
        match classify(&announce_url) {
            Some(TrackerProtocol::Http) => {
                self.announce_http(&announce_url, tracker_id.as_deref(), event, stats)
                    .instrument(debug_span!("http_announce", url = %announce_url))
                    .await
            }
            Some(TrackerProtocol::Udp { host, port }) => {
                self.announce_udp(&host, port, event, stats)
                    .instrument(debug_span!("udp_announce", %host, port))
                    .await
            }
            None => anyhow::bail!("unsupported tracker URL {announce_url}"),
        }
    }

    fn http_request<'a>(
        &'a self,
        tracker_id: Option<&'a str>,
        event: AnnounceEvent,
        stats: &AnnounceStats,
    ) -> AnnounceRequest<'a> {
        AnnounceRequest {
            info_hash: &self.info_hash,
            peer_id: &self.config.peer_id,
            port: self.config.port,
            uploaded: stats.uploaded_bytes,
            downloaded: stats.downloaded_bytes,
            left: stats.left_bytes(),
            corrupt: stats.corrupt_bytes,
            event,
            numwant: self.config.numwant,
            key: self.key,
            require_crypto: self.config.require_crypto,
            partial_seed: stats.is_partial_seed,
            tracker_id,
            ip: self.config.announce_ip,
        }
    }

    async fn announce_http(
        &self,
        tracker_url: &str,
        tracker_id: Option<&str>,
        event: AnnounceEvent,
        stats: &AnnounceStats,
    ) -> anyhow::Result<AnnounceResponse> {
        let request = self.http_request(tracker_id, event, stats);
        let url = http::announce_url(tracker_url, &request);

        // With an explicit announce address there is exactly one
        // request. Otherwise announce over both families and merge,
        // keeping at most two responses in flight.
        if self.config.announce_ip.is_some() {
            return http_fetch_announce(&self.clients.http_any, &url).await;
        }
        let v4 = self.clients.http_v4.as_ref().unwrap_or(&self.clients.http_any);
        let v6 = self.clients.http_v6.as_ref().unwrap_or(&self.clients.http_any);
        let (r4, r6) = tokio::join!(
            http_fetch_announce(v4, &url),
            http_fetch_announce(v6, &url)
        );
        merge_dual_stack(r4, r6)
    }

    async fn announce_udp(
        &self,
        host: &str,
        port: u16,
        event: AnnounceEvent,
        stats: &AnnounceStats,
    ) -> anyhow::Result<AnnounceResponse> {
        let fields = udp::AnnounceFields {
            info_hash: self.info_hash,
            peer_id: self.config.peer_id,
            downloaded: stats.downloaded_bytes,
            left: stats.left_bytes(),
            uploaded: stats.uploaded_bytes,
            event: match event {
                AnnounceEvent::None => udp::EVENT_NONE,
                AnnounceEvent::Started => udp::EVENT_STARTED,
                AnnounceEvent::Stopped => udp::EVENT_STOPPED,
                AnnounceEvent::Completed => udp::EVENT_COMPLETED,
            },
            ip: match self.config.announce_ip {
                Some(IpAddr::V4(v4)) => u32::from_be_bytes(v4.octets()),
                _ => 0,
            },
            key: self.key,
            numwant: self.config.numwant as i32,
            port: self.config.port,
        };

        let addrs = self.clients.resolver.resolve(host, port).await?;
        let mut merged: Option<AnnounceResponse> = None;
        let mut last_err: Option<anyhow::Error> = None;
        for addr in [addrs.v4, addrs.v6].into_iter().flatten() {
            match self.clients.udp.announce(addr, fields.clone()).await {
                Ok(r) => {
                    let out = merged.get_or_insert_with(|| AnnounceResponse {
                        interval: Some(r.interval as u64),
                        ..Default::default()
                    });
                    out.complete = Some(r.seeders as u64);
                    out.incomplete = Some(r.leechers as u64);
                    out.peers.extend(r.addrs);
                }
                Err(e) => {
                    debug!(?addr, "udp announce failed: {e:#}");
                    last_err = Some(e);
                }
            }
        }
        match merged {
            Some(r) => Ok(r),
            None => Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no addresses to announce"))),
        }
    }

    async fn scrape_tier(&self, tier: &mut Tier) {
        let tracker = tier.current_tracker();
        let announce_url = tracker.announce_url.clone();
        let Some(scrape_url) = tracker.scrape_url.clone() else {
            return;
        };
        let result = match classify(&announce_url) {
            Some(TrackerProtocol::Http) => {
                let url = http::scrape_request_url(&scrape_url, &[self.info_hash]);
                match self.clients.http_any.get(&url).send().await {
                    Ok(resp) => match resp.bytes().await {
                        Ok(bytes) => ScrapeResponse::parse(&bytes).map(|r| {
                            r.files.get(&self.info_hash).copied().unwrap_or_default()
                        }),
                        Err(e) => Err(e.into()),
                    },
                    Err(e) => Err(e.into()),
                }
            }
            Some(TrackerProtocol::Udp { host, port }) => {
                match self.clients.resolver.resolve(&host, port).await {
                    Ok(addrs) => match addrs.v4.or(addrs.v6) {
                        Some(addr) => self
                            .clients
                            .udp
                            .scrape(addr, vec![self.info_hash])
                            .await
                            .map(|entries| {
                                let e = entries.first().copied().unwrap_or(udp::ScrapeEntry {
                                    seeders: 0,
                                    completed: 0,
                                    leechers: 0,
                                });
                                http::ScrapeCounts {
                                    seeders: e.seeders as u64,
                                    leechers: e.leechers as u64,
                                    downloaded: e.completed as u64,
                                }
                            }),
                        None => Err(anyhow::anyhow!("no resolved address")),
                    },
                    Err(e) => Err(e),
                }
            }
            None => return,
        };
        match result {
            Ok(counts) => {
                trace!(url = %announce_url, ?counts, "scrape ok");
                self.events.on_counts(
                    &announce_url,
                    counts.seeders,
                    counts.leechers,
                    counts.downloaded,
                );
            }
            Err(e) => trace!(url = %announce_url, "scrape failed: {e:#}"),
        }
    }
}

async fn http_fetch_announce(
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<AnnounceResponse> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| RankedError::from_reqwest(e))?;
    if !response.status().is_success() {
        anyhow::bail!(RankedError {
            rank: FailureRank::HttpStatus,
            message: format!("tracker responded with {}", response.status()),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RankedError::from_reqwest(e))?;
    let parsed = AnnounceResponse::parse(&bytes)?;
    if let Some(failure) = &parsed.failure_reason {
        anyhow::bail!(RankedError {
            rank: FailureRank::BadPayload,
            message: format!("tracker returned failure: {failure}"),
        });
    }
    Ok(parsed)
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct RankedError {
    rank: FailureRank,
    message: String,
}

impl RankedError {
    fn from_reqwest(e: reqwest::Error) -> anyhow::Error {
        RankedError {
            rank: http::rank_reqwest_error(&e),
            message: format!("{e:#}"),
        }
        .into()
    }
}

// Merge the two family-specific results: one success wins outright,
// peers from two successes are concatenated, and of two failures the
// most-advanced one is surfaced.
fn merge_dual_stack(
    r4: anyhow::Result<AnnounceResponse>,
    r6: anyhow::Result<AnnounceResponse>,
) -> anyhow::Result<AnnounceResponse> {
    match (r4, r6) {
        (Ok(mut a), Ok(b)) => {
            a.peers.extend(b.peers);
            if a.interval.is_none() {
                a.interval = b.interval;
            }
            Ok(a)
        }
        (Ok(a), Err(e)) | (Err(e), Ok(a)) => {
            trace!("one announce family failed: {e:#}");
            Ok(a)
        }
        (Err(e4), Err(e6)) => {
            let rank = |e: &anyhow::Error| {
                e.downcast_ref::<RankedError>()
                    .map(|r| r.rank)
                    .unwrap_or(FailureRank::Dns)
            };
            if rank(&e6) > rank(&e4) {
                Err(e6)
            } else {
                Err(e4)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_response(peers: Vec<SocketAddr>) -> AnnounceResponse {
        AnnounceResponse {
            interval: Some(60),
            peers,
            ..Default::default()
        }
    }

    fn ranked(rank: FailureRank) -> anyhow::Error {
        RankedError {
            rank,
            message: "x".into(),
        }
        .into()
    }

    #[test]
    fn test_merge_two_successes_concatenates_peers() {
        let a = ok_response(vec!["1.2.3.4:1".parse().unwrap()]);
        let b = ok_response(vec!["[::1]:2".parse().unwrap()]);
        let merged = merge_dual_stack(Ok(a), Ok(b)).unwrap();
        assert_eq!(merged.peers.len(), 2);
    }

    #[test]
    fn test_merge_prefers_success() {
        let a = ok_response(vec![]);
        let merged = merge_dual_stack(Ok(a), Err(ranked(FailureRank::Connect))).unwrap();
        assert_eq!(merged.interval, Some(60));
    }

    #[test]
    fn test_merge_surfaces_most_advanced_failure() {
        let e = merge_dual_stack(
            Err(ranked(FailureRank::Dns)),
            Err(ranked(FailureRank::HttpStatus)),
        )
        .unwrap_err();
        assert_eq!(
            e.downcast_ref::<RankedError>().unwrap().rank,
            FailureRank::HttpStatus
        );
        // ties go to the v4 side
        let e = merge_dual_stack(
            Err(ranked(FailureRank::Timeout)),
            Err(ranked(FailureRank::Timeout)),
        )
        .unwrap_err();
        assert_eq!(
            e.downcast_ref::<RankedError>().unwrap().rank,
            FailureRank::Timeout
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let d0 = Tier::backoff_delay(0);
        assert!(d0 >= Duration::from_secs(60) && d0 < Duration::from_secs(95));
        let d3 = Tier::backoff_delay(3);
        assert!(d3 >= Duration::from_secs(480));
        let d20 = Tier::backoff_delay(20);
        assert!(d20 <= Duration::from_secs(3630));
    }

    #[test]
    fn test_tier_rotation() {
        let mut tier = Tier::new(vec!["http://a/announce".into(), "http://b/announce".into()]);
        let first = tier.current_tracker().announce_url.clone();
        tier.rotate();
        let second = tier.current_tracker().announce_url.clone();
        assert_ne!(first, second);
        tier.rotate();
        assert_eq!(tier.current_tracker().announce_url, first);
    }

    #[test]
    fn test_classify_urls() {
        assert!(matches!(
            classify("http://t.example/announce"),
            Some(TrackerProtocol::Http)
        ));
        assert!(matches!(
            classify("udp://t.example:6969/announce"),
            Some(TrackerProtocol::Udp { .. })
        ));
        assert!(classify("wss://t.example/").is_none());
        assert!(classify("not a url").is_none());
    }
}
