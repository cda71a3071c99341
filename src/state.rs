use crate::config::Config;
use crate::ratelimit::SlidingWindowLimiter;
use crate::transport::UpstreamClient;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: Config,
    pub upstream: UpstreamClient,
    pub rate_limiter: SlidingWindowLimiter,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let rate_limiter =
            SlidingWindowLimiter::new(config.rate_limit_count, config.rate_limit_window);
        Self {
            config,
            upstream: UpstreamClient::new(),
            rate_limiter,
        }
    }
}
