//! Durable state for the pipeline
//!
//! One trait covers the four collections the pipeline touches:
//! instruments, daily bars, daily metrics and leaderboards. Every write is an
//! upsert keyed by the collection's natural key, so replaying any step
//! converges to the same stored state.

mod file;
mod memory;

use anyhow::Result;
use chrono::NaiveDate;

use crate::types::{DailyBar, DailyMetric, Instrument, LeaderboardBoard};

pub use file::FileStore;
pub use memory::MemoryStore;

pub trait Store: Send + Sync {
    /// Instruments flagged active, ordered by id
    fn active_instruments(&self) -> Result<Vec<Instrument>>;

    /// All instruments, ordered by id
    fn all_instruments(&self) -> Result<Vec<Instrument>>;

    /// Insert or replace instruments by id, returning how many were new
    fn upsert_instruments(&self, instruments: &[Instrument]) -> Result<usize>;

    /// Drop every instrument for which `keep` is false, returning how many were removed
    fn retain_instruments(&self, keep: &dyn Fn(&Instrument) -> bool) -> Result<usize>;

    /// Up to `limit` most recent bars, newest first
    fn read_recent_bars(&self, instrument_id: &str, limit: usize) -> Result<Vec<DailyBar>>;

    /// Insert or replace bars by (instrument_id, date)
    fn upsert_bars(&self, bars: &[DailyBar]) -> Result<()>;

    /// Bars within `[start, end]`, oldest first
    fn bars_between(&self, instrument_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyBar>>;

    /// Insert or replace a metric by (instrument_id, date)
    fn upsert_metric(&self, metric: &DailyMetric) -> Result<()>;

    /// Every metric recorded for `date`, ordered by instrument id
    fn metrics_on(&self, date: NaiveDate) -> Result<Vec<DailyMetric>>;

    /// Metrics for one instrument within `[start, end]`, oldest first
    fn metrics_between(&self, instrument_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyMetric>>;

    /// Most recent date carrying at least one metric
    fn latest_metric_date(&self) -> Result<Option<NaiveDate>>;

    /// Insert or replace a board by (date, period, type)
    fn upsert_board(&self, board: &LeaderboardBoard) -> Result<()>;

    /// Every stored board, ordered by (date, period, type)
    fn boards(&self) -> Result<Vec<LeaderboardBoard>>;
}

/// Bars sorted ascending by date, as the metrics engine expects
pub fn ascending(mut bars: Vec<DailyBar>) -> Vec<DailyBar> {
    bars.sort_by(|a, b| a.date.cmp(&b.date));
    bars
}
