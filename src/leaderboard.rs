//! Ranked leaderboards over persisted daily metrics
//!
//! Each board tries the execution date and then the preceding calendar days
//! until one of them has metrics carrying the board's sort key. Boards with
//! no usable date are not written.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::store::Store;
use crate::types::{BoardType, DailyMetric, LeaderboardBoard, LeaderboardItem, Window};

/// Period label of the volume board
pub const MARKET_MOVERS: &str = "market_movers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardKind {
    /// Ranked by change_pct_from_low, descending
    Gainers(Window),
    /// Ranked by change_pct_from_high, ascending
    Losers(Window),
    /// Ranked by volume, descending
    MarketMovers,
}

impl BoardKind {
    /// Every board built on a run: gainers and losers per window, then movers
    pub fn all() -> Vec<BoardKind> {
        let mut kinds: Vec<BoardKind> = Window::ALL
            .into_iter()
            .flat_map(|w| [BoardKind::Gainers(w), BoardKind::Losers(w)])
            .collect();
        kinds.push(BoardKind::MarketMovers);
        kinds
    }

    pub fn period(&self) -> &'static str {
        match self {
            BoardKind::Gainers(w) | BoardKind::Losers(w) => w.label(),
            BoardKind::MarketMovers => MARKET_MOVERS,
        }
    }

    pub fn board_type(&self) -> BoardType {
        match self {
            BoardKind::Gainers(_) => BoardType::High,
            BoardKind::Losers(_) => BoardType::Low,
            BoardKind::MarketMovers => BoardType::Volume,
        }
    }

    fn sort_value(&self, metric: &DailyMetric) -> Option<f64> {
        match self {
            BoardKind::Gainers(w) => metric.change_pct_from_low(*w),
            BoardKind::Losers(w) => metric.change_pct_from_high(*w),
            BoardKind::MarketMovers => Some(metric.volume as f64),
        }
    }

    fn descending(&self) -> bool {
        !matches!(self, BoardKind::Losers(_))
    }
}

impl std::fmt::Display for BoardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.period(), self.board_type())
    }
}

/// Result of building one board
#[derive(Debug, Clone, PartialEq)]
pub struct BoardOutcome {
    pub kind: BoardKind,
    /// Date the board was written for, `None` when no candidate date had data
    pub date: Option<NaiveDate>,
    pub items: usize,
}

/// The execution date followed by the `count - 1` preceding calendar days
pub fn candidate_dates(execution_date: NaiveDate, count: u32) -> Vec<NaiveDate> {
    (0..count)
        .filter_map(|back| execution_date.checked_sub_days(chrono::Days::new(u64::from(back))))
        .collect()
}

/// Rank metrics for one board, or `None` if none carry the sort key
pub fn rank(kind: BoardKind, metrics: &[DailyMetric], cap: usize) -> Option<Vec<LeaderboardItem>> {
    let mut keyed: Vec<(f64, &DailyMetric)> = metrics
        .iter()
        .filter_map(|m| kind.sort_value(m).map(|v| (v, m)))
        .collect();
    if keyed.is_empty() {
        return None;
    }

    // stable sort keeps store order for ties
    if kind.descending() {
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    } else {
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
    keyed.truncate(cap);

    let items = keyed
        .into_iter()
        .enumerate()
        .map(|(i, (value, m))| LeaderboardItem {
            instrument_id: m.instrument_id.clone(),
            symbol: m.symbol.clone(),
            change_pct: match kind {
                BoardKind::MarketMovers => None,
                _ => Some(value),
            },
            volume: m.volume,
            last_price: m.last_price,
            rank: i + 1,
        })
        .collect();
    Some(items)
}

/// Build and persist every board for `execution_date`
pub fn build_all(
    store: &dyn Store,
    execution_date: NaiveDate,
    generated_at: DateTime<Utc>,
    config: &PipelineConfig,
) -> Result<Vec<BoardOutcome>> {
    let dates = candidate_dates(execution_date, config.fallback_days);
    info!("Computing leaderboards for dates: {:?}", dates);

    // each candidate date is read once and shared by all boards
    let mut by_date: BTreeMap<NaiveDate, Vec<DailyMetric>> = BTreeMap::new();
    for date in &dates {
        by_date.insert(*date, store.metrics_on(*date)?);
    }

    BoardKind::all()
        .par_iter()
        .map(|kind| {
            for date in &dates {
                let metrics = by_date.get(date).map(Vec::as_slice).unwrap_or(&[]);
                debug!("Trying {} on {} ({} metrics)", kind, date, metrics.len());

                if let Some(items) = rank(*kind, metrics, config.board_cap) {
                    let count = items.len();
                    store.upsert_board(&LeaderboardBoard {
                        date: *date,
                        period: kind.period().to_string(),
                        board_type: kind.board_type(),
                        generated_at,
                        items,
                    })?;
                    info!("Board {} written for {} with {} entries", kind, date, count);
                    return Ok(BoardOutcome {
                        kind: *kind,
                        date: Some(*date),
                        items: count,
                    });
                }
            }
            info!("Board {} has no data on any candidate date, not written", kind);
            Ok(BoardOutcome {
                kind: *kind,
                date: None,
                items: 0,
            })
        })
        .collect()
}
