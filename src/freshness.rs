//! Cache freshness policy
//!
//! Decides per instrument whether cached daily bars can be reused or must be
//! refreshed from the market data source, and how much history to request.
//! Staleness is checked before insufficiency: a stale but short history gets
//! a bounded top-up, a current but short history gets the full lookback.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::types::DailyBar;

/// Calendar days added per trading-session span for exchange holidays
const HOLIDAY_ALLOWANCE_DAYS: u32 = 14;

/// Amount of history requested from a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSpan {
    /// Trailing calendar days
    Days(u32),
    /// At least this many trailing weekday sessions, holidays allowed for
    TradingDays(u32),
}

impl FetchSpan {
    /// Calendar days the span reaches back from its end date
    pub fn calendar_days(&self) -> u32 {
        match self {
            FetchSpan::Days(n) => *n,
            FetchSpan::TradingDays(n) => n.saturating_mul(7).div_ceil(5) + HOLIDAY_ALLOWANCE_DAYS,
        }
    }

    /// First calendar day covered by the span when it ends on `end`
    pub fn start_date(&self, end: NaiveDate) -> NaiveDate {
        end.checked_sub_days(chrono::Days::new(u64::from(self.calendar_days())))
            .unwrap_or(NaiveDate::MIN)
    }
}

impl std::fmt::Display for FetchSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchSpan::Days(n) => write!(f, "{}d", n),
            FetchSpan::TradingDays(n) => write!(f, "{} sessions ({}d)", n, self.calendar_days()),
        }
    }
}

/// Why a fetch was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    NoHistory,
    Stale { days_old: i64 },
    Insufficient { bars: usize },
}

/// Outcome of the freshness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessDecision {
    UseCache,
    Fetch { span: FetchSpan, reason: FetchReason },
}

/// Decide whether `existing` bars are fresh enough as of `today`
pub fn decide(existing: &[DailyBar], today: NaiveDate, config: &PipelineConfig) -> FreshnessDecision {
    let Some(most_recent) = existing.iter().map(|b| b.date).max() else {
        return FreshnessDecision::Fetch {
            span: config.full_lookback,
            reason: FetchReason::NoHistory,
        };
    };

    let days_old = (today - most_recent).num_days();
    if days_old > config.stale_after_days {
        let wanted = days_old.saturating_add(i64::from(config.topup_buffer_days));
        let days = wanted.min(i64::from(config.max_topup_days)) as u32;
        return FreshnessDecision::Fetch {
            span: FetchSpan::Days(days),
            reason: FetchReason::Stale { days_old },
        };
    }

    if existing.len() < config.required_bars {
        return FreshnessDecision::Fetch {
            span: config.full_lookback,
            reason: FetchReason::Insufficient { bars: existing.len() },
        };
    }

    FreshnessDecision::UseCache
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_ending(last: NaiveDate, count: usize) -> Vec<DailyBar> {
        (0..count)
            .map(|i| DailyBar {
                instrument_id: "XNAS:ACME".to_string(),
                date: last - chrono::Duration::days((count - 1 - i) as i64),
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.5,
                volume: 100,
            })
            .collect()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_empty_cache_requests_full_lookback() {
        let config = PipelineConfig::default();
        let decision = decide(&[], day(2025, 6, 10), &config);
        assert_eq!(
            decision,
            FreshnessDecision::Fetch {
                span: config.full_lookback,
                reason: FetchReason::NoHistory
            }
        );
    }

    #[test]
    fn test_stale_cache_requests_capped_topup() {
        let config = PipelineConfig::default();
        let today = day(2025, 6, 10);
        let bars = bars_ending(today - chrono::Duration::days(3), 300);

        let decision = decide(&bars, today, &config);
        // 3 days + 5 buffer
        assert!(matches!(decision, FreshnessDecision::Fetch { span: FetchSpan::Days(8), .. }));

        let very_stale = bars_ending(today - chrono::Duration::days(90), 300);
        let decision = decide(&very_stale, today, &config);
        assert!(matches!(decision, FreshnessDecision::Fetch { span: FetchSpan::Days(30), .. }));
    }

    #[test]
    fn test_stale_short_history_gets_topup_not_full_refetch() {
        let config = PipelineConfig::default();
        let today = day(2025, 6, 10);
        let bars = bars_ending(today - chrono::Duration::days(4), 20);

        let decision = decide(&bars, today, &config);
        assert!(matches!(
            decision,
            FreshnessDecision::Fetch {
                span: FetchSpan::Days(9),
                reason: FetchReason::Stale { days_old: 4 }
            }
        ));
    }

    #[test]
    fn test_current_short_history_requests_full_lookback() {
        let config = PipelineConfig::default();
        let today = day(2025, 6, 10);
        let bars = bars_ending(today - chrono::Duration::days(1), 100);

        let decision = decide(&bars, today, &config);
        assert_eq!(
            decision,
            FreshnessDecision::Fetch {
                span: config.full_lookback,
                reason: FetchReason::Insufficient { bars: 100 }
            }
        );
    }

    #[test]
    fn test_current_full_history_uses_cache() {
        let config = PipelineConfig::default();
        let today = day(2025, 6, 10);
        let bars = bars_ending(today, 300);

        let decision = decide(&bars, today, &config);
        assert_eq!(decision, FreshnessDecision::UseCache);
    }

    #[test]
    fn test_span_start_dates() {
        let end = day(2025, 3, 31);
        assert_eq!(FetchSpan::Days(30).start_date(end), day(2025, 3, 1));
        // 252 sessions: 353 weekday-equivalent days plus holidays
        assert_eq!(FetchSpan::TradingDays(252).calendar_days(), 367);
        assert_eq!(FetchSpan::TradingDays(252).start_date(end), day(2024, 3, 29));
        assert_eq!(FetchSpan::Days(8).to_string(), "8d");
    }

    /// Weekdays minus the NYSE holidays of mid 2024 to mid 2025
    fn nyse_sessions(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        use chrono::Datelike;
        let holidays = [
            day(2024, 5, 27),
            day(2024, 6, 19),
            day(2024, 7, 4),
            day(2024, 9, 2),
            day(2024, 11, 28),
            day(2024, 12, 25),
            day(2025, 1, 1),
            day(2025, 1, 9),
            day(2025, 1, 20),
            day(2025, 2, 17),
            day(2025, 4, 18),
            day(2025, 5, 26),
            day(2025, 6, 19),
        ];
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| d.weekday().number_from_monday() <= 5 && !holidays.contains(d))
            .collect()
    }

    #[test]
    fn test_full_lookback_yields_enough_sessions() {
        let config = PipelineConfig::default();
        let today = day(2025, 6, 30);

        let start = config.full_lookback.start_date(today);
        let sessions = nyse_sessions(start, today);
        assert!(
            sessions.len() >= config.required_bars,
            "full lookback covers only {} sessions",
            sessions.len()
        );
        assert!(sessions.len() <= config.read_limit);

        // a cold fetch over that calendar is enough for the cache to be reused
        let bars: Vec<DailyBar> = sessions
            .into_iter()
            .map(|date| DailyBar {
                instrument_id: "XNAS:ACME".to_string(),
                date,
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.5,
                volume: 100,
            })
            .collect();
        assert_eq!(decide(&bars, today, &config), FreshnessDecision::UseCache);
    }
}
