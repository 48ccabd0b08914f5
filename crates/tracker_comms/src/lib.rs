mod announcer;
pub mod http;
pub mod udp;

pub use announcer::{
    AnnounceStats, Announcer, AnnouncerConfig, TorrentState, TorrentStatsProvider,
    TrackerClients, TrackerEventSink,
};
pub use http::{scrape_url_for, AnnounceEvent, ScrapeCounts};
