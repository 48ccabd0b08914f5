pub mod block_info;
pub mod directories;
pub mod file_map;
pub mod hash_id;
pub mod magnet;
pub mod metainfo;
pub mod peer_id;
pub mod sanitize;

pub use hash_id::{Id20, Id32};
