use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;

/// Wall clock used to order index saves.
pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Source of the randomness that seeds the superblock nonce.
pub trait RandomSource: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);
}

pub struct OsRandomSource;

impl RandomSource for OsRandomSource {
    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

/// The layout engine's ambient collaborators, passed in explicitly so tests
/// can pin time and randomness.
#[derive(Clone)]
pub struct LayoutContext {
    pub time: Arc<dyn TimeSource>,
    pub random: Arc<dyn RandomSource>,
}

impl LayoutContext {
    pub fn new() -> Self {
        Self {
            time: Arc::new(SystemTimeSource),
            random: Arc::new(OsRandomSource),
        }
    }
}
