//! Per-(direction, group) token buckets for bandwidth accounting.
//! Callers ask for a clamp before moving bytes; a short clamp means
//! "pause for [`PAUSE_ON_CLAMP`] and retry".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long a transfer pauses when the bucket came up short.
pub const PAUSE_ON_CLAMP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

/// A bandwidth tag: direction plus optional group name. Torrents in the
/// same group share one bucket per direction.
pub type Tag = (Direction, Option<Arc<str>>);

struct Bucket {
    rate_bps: u64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps,
            tokens: rate_bps as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        // cap at one second's burst
        self.tokens = (self.tokens + elapsed * self.rate_bps as f64).min(self.rate_bps as f64);
    }

    fn take(&mut self, requested: u64) -> u64 {
        self.refill();
        let allowed = (self.tokens as u64).min(requested);
        self.tokens -= allowed as f64;
        allowed
    }
}

#[derive(Default)]
pub struct BandwidthLimiter {
    buckets: Mutex<HashMap<Tag, Bucket>>,
}

impl BandwidthLimiter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set or clear the limit for a tag. Clearing removes the bucket;
    /// unlimited tags never clamp.
    pub fn set_limit(&self, tag: Tag, rate_bps: Option<u64>) {
        let mut buckets = self.buckets.lock();
        match rate_bps {
            Some(rate) => {
                buckets.insert(tag, Bucket::new(rate));
            }
            None => {
                buckets.remove(&tag);
            }
        }
    }

    pub fn limit(&self, tag: &Tag) -> Option<u64> {
        self.buckets.lock().get(tag).map(|b| b.rate_bps)
    }

    /// How many of `bytes_requested` may move right now. Anything less
    /// than the request means the caller should pause for
    /// [`PAUSE_ON_CLAMP`] before retrying.
    pub fn clamp(&self, tag: &Tag, bytes_requested: u64) -> u64 {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(tag) {
            Some(bucket) => bucket.take(bytes_requested),
            None => bytes_requested,
        }
    }
}
