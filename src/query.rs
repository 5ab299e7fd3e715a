//! Read-side views over the stored collections

use anyhow::Result;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

use crate::store::Store;
use crate::types::{BoardType, DailyBar, DailyMetric, Instrument, LeaderboardBoard, LeaderboardItem, Window};

pub const DEFAULT_PAGE_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct LeaderboardQuery {
    pub period: Option<String>,
    pub board_type: Option<BoardType>,
    pub date: Option<NaiveDate>,
    pub start: usize,
    pub limit: usize,
}

impl Default for LeaderboardQuery {
    fn default() -> Self {
        Self {
            period: None,
            board_type: None,
            date: None,
            start: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// One page of the most recent matching board
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardPage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub board_type: Option<BoardType>,
    #[serde(rename = "generatedAt", skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub start: usize,
    pub limit: usize,
    pub items: Vec<LeaderboardItem>,
}

fn page<T: Clone>(items: &[T], start: usize, limit: usize) -> Vec<T> {
    items.iter().skip(start).take(limit).cloned().collect()
}

/// Most recent non-empty board matching the filters, paginated
pub fn leaderboard_page(store: &dyn Store, query: &LeaderboardQuery) -> Result<LeaderboardPage> {
    let boards = store.boards()?;
    let latest = boards
        .iter()
        .filter(|b| query.period.as_deref().map_or(true, |p| b.period == p))
        .filter(|b| query.board_type.map_or(true, |t| b.board_type == t))
        .filter(|b| query.date.map_or(true, |d| b.date == d))
        .filter(|b| !b.items.is_empty())
        .fold(None, |best: Option<&LeaderboardBoard>, b| match best {
            Some(current) if current.date >= b.date => Some(current),
            _ => Some(b),
        });

    let Some(board) = latest else {
        info!("No leaderboard with items found");
        return Ok(LeaderboardPage {
            date: None,
            period: None,
            board_type: None,
            generated_at: None,
            total: 0,
            start: query.start,
            limit: query.limit,
            items: vec![],
        });
    };

    let items = page(&board.items, query.start, query.limit);
    info!(
        "Returning {} items (from {}) out of {} total for {} {}/{}",
        items.len(),
        query.start,
        board.items.len(),
        board.date,
        board.period,
        board.board_type
    );
    Ok(LeaderboardPage {
        date: Some(board.date),
        period: Some(board.period.clone()),
        board_type: Some(board.board_type),
        generated_at: Some(board.generated_at),
        total: board.items.len(),
        start: query.start,
        limit: query.limit,
        items,
    })
}

/// Metric row of the stacked moving-average screen
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackedEntry {
    #[serde(rename = "instrumentId")]
    pub instrument_id: String,
    pub symbol: String,
    pub name: String,
    pub date: NaiveDate,
    pub last_price: f64,
    pub volume: u64,
    pub ma50: Option<f64>,
    pub ma100: Option<f64>,
    pub ma200: Option<f64>,
    pub ema20: Option<f64>,
    pub change_pct_from_low_5d: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackedPage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub total: usize,
    pub start: usize,
    pub limit: usize,
    pub items: Vec<StackedEntry>,
}

/// Instruments in a stacked uptrend on the latest metric date, best 5d first
///
/// Metrics whose instrument is no longer in the catalog are left out.
pub fn stacked_trend(store: &dyn Store, start: usize, limit: usize) -> Result<StackedPage> {
    let Some(date) = store.latest_metric_date()? else {
        return Ok(StackedPage {
            date: None,
            total: 0,
            start,
            limit,
            items: vec![],
        });
    };

    let names: HashMap<String, String> = store
        .all_instruments()?
        .into_iter()
        .map(|i| (i.id, i.name))
        .collect();

    let mut entries: Vec<StackedEntry> = store
        .metrics_on(date)?
        .into_iter()
        .filter(|m| m.stacked_ma_trend)
        .filter_map(|m| {
            let name = names.get(&m.instrument_id)?.clone();
            Some(StackedEntry {
                change_pct_from_low_5d: m.change_pct_from_low(Window::FiveDays),
                instrument_id: m.instrument_id,
                symbol: m.symbol,
                name,
                date: m.date,
                last_price: m.last_price,
                volume: m.volume,
                ma50: m.ma50,
                ma100: m.ma100,
                ma200: m.ma200,
                ema20: m.ema20,
            })
        })
        .collect();

    // descending, missing values last
    entries.sort_by(|a, b| match (a.change_pct_from_low_5d, b.change_pct_from_low_5d) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let total = entries.len();
    let items = page(&entries, start, limit);
    info!(
        "Found {} stocks with stacked MA trend on {}, returning {} (from {})",
        total,
        date,
        items.len(),
        start
    );
    Ok(StackedPage {
        date: Some(date),
        total,
        start,
        limit,
        items,
    })
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub symbol: Option<String>,
    /// Trailing window ending on `date` (or today)
    pub window: Option<Window>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentHistory {
    #[serde(flatten)]
    pub instrument: Instrument,
    pub daily_bars: Vec<DailyBar>,
    pub metrics: Vec<DailyMetric>,
}

/// Date range covered by a history query
pub fn history_range(query: &HistoryQuery, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    match (query.window, query.date) {
        (Some(window), date) => {
            let end = date.unwrap_or(today);
            let back = Days::new(window.bars() as u64 - 1);
            (end.checked_sub_days(back).unwrap_or(NaiveDate::MIN), end)
        }
        (None, Some(date)) => (date, date),
        (None, None) => (NaiveDate::MIN, NaiveDate::MAX),
    }
}

/// Bars and metrics per instrument, optionally for one symbol
pub fn instrument_history(store: &dyn Store, query: &HistoryQuery, today: NaiveDate) -> Result<Vec<InstrumentHistory>> {
    let (start, end) = history_range(query, today);

    store
        .all_instruments()?
        .into_iter()
        .filter(|i| query.symbol.as_deref().map_or(true, |s| i.symbol == s))
        .map(|instrument| {
            let daily_bars = store.bars_between(&instrument.id, start, end)?;
            let metrics = store.metrics_between(&instrument.id, start, end)?;
            Ok(InstrumentHistory {
                instrument,
                daily_bars,
                metrics,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::WindowStats;
    use std::collections::BTreeMap;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn at() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_750_000_000, 0).unwrap()
    }

    fn item(id: &str, rank: usize) -> LeaderboardItem {
        LeaderboardItem {
            instrument_id: id.to_string(),
            symbol: id.to_string(),
            change_pct: Some(10.0 / rank as f64),
            volume: 100,
            last_price: 5.0,
            rank,
        }
    }

    fn board(date: NaiveDate, period: &str, items: Vec<LeaderboardItem>) -> LeaderboardBoard {
        LeaderboardBoard {
            date,
            period: period.to_string(),
            board_type: BoardType::High,
            generated_at: at(),
            items,
        }
    }

    fn metric(id: &str, pct_5d: Option<f64>, stacked: bool) -> DailyMetric {
        let mut windows = BTreeMap::new();
        windows.insert(
            Window::FiveDays,
            WindowStats {
                high: 10.0,
                low: 8.0,
                change_from_low: 1.0,
                change_pct_from_low: pct_5d,
                change_from_high: -1.0,
                change_pct_from_high: Some(-10.0),
            },
        );
        DailyMetric {
            instrument_id: id.to_string(),
            symbol: id.to_string(),
            date: day(5),
            last_price: 9.0,
            volume: 1,
            computed_at: at(),
            windows,
            ma50: Some(3.0),
            ma100: Some(2.0),
            ma200: Some(1.0),
            ema20: Some(4.0),
            stacked_ma_trend: stacked,
        }
    }

    #[test]
    fn test_leaderboard_page_latest_non_empty() {
        let store = MemoryStore::new();
        store
            .upsert_board(&board(day(3), "5d", (1..=5).map(|r| item(&format!("I{}", r), r)).collect()))
            .unwrap();
        store.upsert_board(&board(day(4), "5d", vec![])).unwrap();
        store.upsert_board(&board(day(4), "1M", vec![item("X", 1)])).unwrap();

        let query = LeaderboardQuery {
            period: Some("5d".to_string()),
            board_type: Some(BoardType::High),
            start: 1,
            limit: 2,
            ..Default::default()
        };
        let page = leaderboard_page(&store, &query).unwrap();
        assert_eq!(page.date, Some(day(3)));
        assert_eq!(page.total, 5);
        let ranks: Vec<usize> = page.items.iter().map(|i| i.rank).collect();
        assert_eq!(ranks, vec![2, 3]);

        let empty = leaderboard_page(
            &store,
            &LeaderboardQuery {
                period: Some("52w".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.items.is_empty());
        assert_eq!(empty.limit, DEFAULT_PAGE_LIMIT);
    }

    #[test]
    fn test_stacked_trend_sorts_nulls_last() {
        let store = MemoryStore::new();
        store
            .upsert_instruments(&[
                Instrument::new("A", "A", "Alpha"),
                Instrument::new("B", "B", "Beta"),
                Instrument::new("C", "C", "Gamma"),
            ])
            .unwrap();
        store.upsert_metric(&metric("A", None, true)).unwrap();
        store.upsert_metric(&metric("B", Some(2.0), true)).unwrap();
        store.upsert_metric(&metric("C", Some(7.0), true)).unwrap();
        store.upsert_metric(&metric("D", Some(9.0), true)).unwrap(); // not in catalog
        store.upsert_metric(&metric("E", Some(99.0), false)).unwrap();

        let page = stacked_trend(&store, 0, 10).unwrap();
        assert_eq!(page.date, Some(day(5)));
        let ids: Vec<&str> = page.items.iter().map(|e| e.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["C", "B", "A"]);
        assert_eq!(page.items[0].name, "Gamma");
    }

    #[test]
    fn test_history_range() {
        let today = day(30);
        let by_window = HistoryQuery {
            window: Some(Window::FiveDays),
            ..Default::default()
        };
        assert_eq!(history_range(&by_window, today), (day(26), day(30)));

        let by_date = HistoryQuery {
            date: Some(day(10)),
            ..Default::default()
        };
        assert_eq!(history_range(&by_date, today), (day(10), day(10)));
    }

    #[test]
    fn test_instrument_history_filters_symbol() {
        let store = MemoryStore::new();
        store
            .upsert_instruments(&[Instrument::new("A", "A", "Alpha"), Instrument::new("B", "B", "Beta")])
            .unwrap();
        let bar = |d| DailyBar {
            instrument_id: "A".to_string(),
            date: day(d),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
        };
        store.upsert_bars(&[bar(1), bar(4), bar(5)]).unwrap();
        store.upsert_metric(&metric("A", Some(1.0), false)).unwrap();

        let query = HistoryQuery {
            symbol: Some("A".to_string()),
            window: Some(Window::FiveDays),
            date: Some(day(6)),
        };
        let history = instrument_history(&store, &query, day(30)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].daily_bars.len(), 2);
        assert_eq!(history[0].metrics.len(), 1);

        let everything = instrument_history(&store, &HistoryQuery::default(), day(30)).unwrap();
        assert_eq!(everything.len(), 2);
        assert_eq!(everything[0].daily_bars.len(), 3);
    }
}
