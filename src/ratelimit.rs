use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Per-key sliding-window admission control.
///
/// Each key owns a window of request timestamps. A caller over the limit
/// waits until the oldest timestamp leaves the window; the table mutex is
/// never held across a wait, so one saturated key cannot stall the others.
pub struct SlidingWindowLimiter {
    clients: Mutex<FxHashMap<String, Vec<Instant>>>,
    limit: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            clients: Mutex::new(FxHashMap::default()),
            limit,
            window,
        }
    }

    /// Wait until the key is allowed to proceed, then record the request.
    pub async fn acquire(&self, api_key: &str) {
        loop {
            let wait = {
                let mut clients = self.clients.lock();
                let now = Instant::now();
                let window = self.window;
                let timestamps = clients.entry(api_key.to_string()).or_default();
                timestamps.retain(|ts| now.duration_since(*ts) < window);

                if timestamps.len() < self.limit {
                    timestamps.push(now);
                    return;
                }

                // Full window: wait until the oldest entry expires, then
                // re-check, since another task may claim the freed slot first.
                (timestamps[0] + window).saturating_duration_since(now)
            };

            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
        }
    }
}
