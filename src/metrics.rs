//! Rolling-window metrics over a daily bar series
//!
//! All functions take bars sorted ascending by date and work over explicit
//! slices: trailing windows for high/low, simple moving averages that are
//! undefined on short history, and a recursive EMA seeded by the first close.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::types::{DailyBar, DailyMetric, Instrument, Window, WindowStats};

/// EMA span used for the trend stack
pub const EMA_SPAN: usize = 20;

/// Compute the metrics record for an instrument, `None` when there are no bars
pub fn compute(
    instrument: &Instrument,
    bars: &[DailyBar],
    computed_at: DateTime<Utc>,
) -> Option<DailyMetric> {
    let last = bars.last()?;
    let last_price = last.close;

    let windows: BTreeMap<Window, WindowStats> = Window::ALL
        .into_iter()
        .filter_map(|w| window_stats(bars, w.bars(), last_price).map(|s| (w, s)))
        .collect();

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let ma50 = sma(&closes, 50);
    let ma100 = sma(&closes, 100);
    let ma200 = sma(&closes, 200);
    let ema20 = ema(&closes, EMA_SPAN);

    Some(DailyMetric {
        instrument_id: instrument.id.clone(),
        symbol: instrument.symbol.clone(),
        date: last.date,
        last_price,
        volume: last.volume,
        computed_at,
        windows,
        ma50,
        ma100,
        ma200,
        ema20,
        stacked_ma_trend: is_stacked(ma200, ma100, ma50, ema20, last_price),
    })
}

/// High/low statistics over the trailing `n` bars (or all bars when fewer)
pub fn window_stats(bars: &[DailyBar], n: usize, last_price: f64) -> Option<WindowStats> {
    let slice = trailing(bars, n);
    if slice.is_empty() {
        return None;
    }

    let high = slice.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = slice.iter().map(|b| b.low).fold(f64::MAX, f64::min);

    Some(WindowStats {
        high,
        low,
        change_from_low: last_price - low,
        change_pct_from_low: pct_change(last_price, low),
        change_from_high: last_price - high,
        change_pct_from_high: pct_change(last_price, high),
    })
}

fn trailing<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

fn pct_change(price: f64, reference: f64) -> Option<f64> {
    if reference == 0.0 {
        None
    } else {
        Some((price - reference) / reference * 100.0)
    }
}

/// Simple mean of the trailing `period` values; `None` on short input
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = trailing(values, period);
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Recursive EMA with alpha = 2 / (span + 1), seeded by the first value
pub fn ema(values: &[f64], span: usize) -> Option<f64> {
    let (first, rest) = values.split_first()?;
    let alpha = 2.0 / (span as f64 + 1.0);
    Some(rest.iter().fold(*first, |prev, v| prev + alpha * (v - prev)))
}

/// Strict bullish stack: ma200 < ma100 < ma50 < ema20 < price
fn is_stacked(
    ma200: Option<f64>,
    ma100: Option<f64>,
    ma50: Option<f64>,
    ema20: Option<f64>,
    price: f64,
) -> bool {
    match (ma200, ma100, ma50, ema20) {
        (Some(a), Some(b), Some(c), Some(d)) => a < b && b < c && c < d && d < price,
        _ => false,
    }
}
