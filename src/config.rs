//! Configuration for the sync and leaderboard pipeline

use serde::{Deserialize, Serialize};

use crate::freshness::FetchSpan;

/// Tunables for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bars needed for the longest window (52w)
    pub required_bars: usize,

    /// Most recent bars read back from the cache per instrument
    pub read_limit: usize,

    /// Span requested when history is missing or insufficient; covers
    /// `required_bars` sessions plus a buffer
    pub full_lookback: FetchSpan,

    /// Extra days added to a top-up fetch
    pub topup_buffer_days: u32,

    /// Upper bound on a top-up fetch once any history exists
    pub max_topup_days: u32,

    /// Cached history older than this many days is refreshed
    pub stale_after_days: i64,

    /// Calendar dates tried when building a board (execution date first)
    pub fallback_days: u32,

    /// Maximum entries kept on a board
    pub board_cap: usize,

    /// Instrument tasks allowed in flight at once
    pub max_concurrency: usize,

    /// Per-request timeout for market data fetches
    pub fetch_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            required_bars: 252,
            read_limit: 300,
            full_lookback: FetchSpan::TradingDays(272),
            topup_buffer_days: 5,
            max_topup_days: 30,
            stale_after_days: 1,
            fallback_days: 4,
            board_cap: 3600,
            max_concurrency: 16,
            fetch_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    /// Apply environment overrides on top of the defaults
    ///
    /// Reads:
    /// - `MAX_CONCURRENCY` - worker pool size
    /// - `FETCH_TIMEOUT_SECS` - HTTP timeout for market data
    /// - `BOARD_CAP` - maximum entries per leaderboard
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("MAX_CONCURRENCY") {
            config.max_concurrency = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("FETCH_TIMEOUT_SECS") {
            config.fetch_timeout_secs = secs;
        }
        if let Some(cap) = env_parse::<usize>("BOARD_CAP") {
            config.board_cap = cap;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
