use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Listing kind of a tracked instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    #[default]
    Equity,
    Etf,
}

/// An instrument tracked by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Stable identifier, `"{exchange}:{symbol}"` for seeded listings
    pub id: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub kind: InstrumentKind,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Instrument {
    pub fn new(id: impl Into<String>, symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            name: name.into(),
            exchange: String::new(),
            kind: InstrumentKind::Equity,
            active: true,
        }
    }
}

/// One OHLCV row as returned by a market data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl OhlcvRow {
    pub fn into_bar(self, instrument_id: &str) -> DailyBar {
        DailyBar {
            instrument_id: instrument_id.to_string(),
            date: self.date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Daily bar, unique per (instrument_id, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    #[serde(rename = "instrumentId")]
    pub instrument_id: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Trailing window used for high/low statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "5d")]
    FiveDays,
    #[serde(rename = "1M")]
    OneMonth,
    #[serde(rename = "2M")]
    TwoMonths,
    #[serde(rename = "3M")]
    ThreeMonths,
    #[serde(rename = "6M")]
    SixMonths,
    #[serde(rename = "52w")]
    FiftyTwoWeeks,
}

impl Window {
    pub const ALL: [Window; 6] = [
        Window::FiveDays,
        Window::OneMonth,
        Window::TwoMonths,
        Window::ThreeMonths,
        Window::SixMonths,
        Window::FiftyTwoWeeks,
    ];

    /// Number of trailing bars in the window
    pub fn bars(self) -> usize {
        match self {
            Window::FiveDays => 5,
            Window::OneMonth => 21,
            Window::TwoMonths => 42,
            Window::ThreeMonths => 63,
            Window::SixMonths => 126,
            Window::FiftyTwoWeeks => 252,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Window::FiveDays => "5d",
            Window::OneMonth => "1M",
            Window::TwoMonths => "2M",
            Window::ThreeMonths => "3M",
            Window::SixMonths => "6M",
            Window::FiftyTwoWeeks => "52w",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Window::ALL.into_iter().find(|w| w.label() == label)
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// High/low statistics over one trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub high: f64,
    pub low: f64,
    /// Positive when price has risen off the window low
    pub change_from_low: f64,
    pub change_pct_from_low: Option<f64>,
    /// Negative when price has fallen from the window high
    pub change_from_high: f64,
    pub change_pct_from_high: Option<f64>,
}

/// Metrics record, one per (instrument_id, date), recomputed in full every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetric {
    #[serde(rename = "instrumentId")]
    pub instrument_id: String,
    pub symbol: String,
    pub date: NaiveDate,
    pub last_price: f64,
    pub volume: u64,
    #[serde(rename = "computedAt")]
    pub computed_at: DateTime<Utc>,
    /// Stored flat as `high_5d`, `change_pct_from_low_52w`, ...
    #[serde(flatten, with = "flat_windows")]
    pub windows: BTreeMap<Window, WindowStats>,
    pub ma50: Option<f64>,
    pub ma100: Option<f64>,
    pub ma200: Option<f64>,
    pub ema20: Option<f64>,
    pub stacked_ma_trend: bool,
}

impl DailyMetric {
    pub fn window(&self, window: Window) -> Option<&WindowStats> {
        self.windows.get(&window)
    }

    pub fn change_pct_from_low(&self, window: Window) -> Option<f64> {
        self.window(window).and_then(|w| w.change_pct_from_low)
    }

    pub fn change_pct_from_high(&self, window: Window) -> Option<f64> {
        self.window(window).and_then(|w| w.change_pct_from_high)
    }
}

mod flat_windows {
    use super::{Window, WindowStats};
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        windows: &BTreeMap<Window, WindowStats>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(windows.len() * 6))?;
        for (window, stats) in windows {
            let label = window.label();
            map.serialize_entry(&format!("high_{}", label), &stats.high)?;
            map.serialize_entry(&format!("low_{}", label), &stats.low)?;
            map.serialize_entry(&format!("change_from_low_{}", label), &stats.change_from_low)?;
            map.serialize_entry(&format!("change_pct_from_low_{}", label), &stats.change_pct_from_low)?;
            map.serialize_entry(&format!("change_from_high_{}", label), &stats.change_from_high)?;
            map.serialize_entry(&format!("change_pct_from_high_{}", label), &stats.change_pct_from_high)?;
        }
        map.end()
    }

    /// A window is rebuilt only when its high, low and both changes are present
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Window, WindowStats>, D::Error> {
        let fields = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
        let field = |name: &str, window: Window| {
            fields
                .get(&format!("{}_{}", name, window.label()))
                .copied()
                .flatten()
        };

        let mut windows = BTreeMap::new();
        for window in Window::ALL {
            let (Some(high), Some(low), Some(change_from_low), Some(change_from_high)) = (
                field("high", window),
                field("low", window),
                field("change_from_low", window),
                field("change_from_high", window),
            ) else {
                continue;
            };
            windows.insert(
                window,
                WindowStats {
                    high,
                    low,
                    change_from_low,
                    change_pct_from_low: field("change_pct_from_low", window),
                    change_from_high,
                    change_pct_from_high: field("change_pct_from_high", window),
                },
            );
        }
        Ok(windows)
    }
}

/// Board direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardType {
    /// Gainers, ranked by change off the window low
    High,
    /// Losers, ranked by change from the window high
    Low,
    /// Market movers, ranked by session volume
    Volume,
}

impl BoardType {
    pub fn as_str(self) -> &'static str {
        match self {
            BoardType::High => "high",
            BoardType::Low => "low",
            BoardType::Volume => "volume",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(BoardType::High),
            "low" => Some(BoardType::Low),
            "volume" => Some(BoardType::Volume),
            _ => None,
        }
    }
}

impl std::fmt::Display for BoardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardItem {
    #[serde(rename = "instrumentId")]
    pub instrument_id: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<f64>,
    pub volume: u64,
    pub last_price: f64,
    pub rank: usize,
}

/// Ranked board, unique per (date, period, type); items sorted by rank ascending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardBoard {
    pub date: NaiveDate,
    pub period: String,
    #[serde(rename = "type")]
    pub board_type: BoardType,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    pub items: Vec<LeaderboardItem>,
}
