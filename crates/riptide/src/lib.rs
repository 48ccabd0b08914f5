//!
//! The riptide BitTorrent engine core.
//!
//! The main type to start off with is [`Session`]: it owns the
//! torrents, the open-files cache, the background verify and relocate
//! workers, and the announce schedule. The RPC control plane in
//! [`rpc`] exposes the session over HTTP+JSON.

pub mod blocklist;
mod disk_io;
mod limits;
mod open_files;
mod relocate;
pub mod rpc;
mod resume;
mod session;
mod torrent;
mod verify;
mod watch;

pub use disk_io::{TorrentDisk, PARTIAL_SUFFIX};
pub use limits::{BandwidthLimiter, Direction, Tag, PAUSE_ON_CLAMP};
pub use open_files::{OpenFilesCache, Preallocation};
pub use relocate::{RelocateEvents, RelocateJob, RelocateWorker};
pub use session::{AddTorrent, AddTorrentOptions, Session, SessionConfig, SessionStats};
pub use torrent::{
    Activity, ErrorKind, Priority, Torrent, TorrentError, TorrentId, TransferCounter,
};
pub use verify::{VerifyJob, VerifyOutcome, VerifyWorker};
pub use watch::{WatchAction, WatchCallback, Watchdir};

pub use riptide_core::magnet::Magnet;
pub use riptide_core::metainfo::Metainfo;

/// One bit per piece (or per block), most significant bit first, the
/// same packing the peer-wire bitfield message uses.
pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
