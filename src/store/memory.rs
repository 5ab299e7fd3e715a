use anyhow::Result;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::Store;
use crate::types::{BoardType, DailyBar, DailyMetric, Instrument, LeaderboardBoard};

/// In-process store backed by ordered maps
#[derive(Default)]
pub struct MemoryStore {
    instruments: RwLock<BTreeMap<String, Instrument>>,
    bars: RwLock<BTreeMap<(String, NaiveDate), DailyBar>>,
    metrics: RwLock<BTreeMap<(NaiveDate, String), DailyMetric>>,
    boards: RwLock<BTreeMap<(NaiveDate, String, BoardType), LeaderboardBoard>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bar_count(&self) -> usize {
        read(&self.bars).len()
    }

    pub fn metric_count(&self) -> usize {
        read(&self.metrics).len()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Store for MemoryStore {
    fn active_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(read(&self.instruments)
            .values()
            .filter(|i| i.active)
            .cloned()
            .collect())
    }

    fn all_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(read(&self.instruments).values().cloned().collect())
    }

    fn upsert_instruments(&self, instruments: &[Instrument]) -> Result<usize> {
        let mut map = write(&self.instruments);
        let mut inserted = 0;
        for instrument in instruments {
            if map.insert(instrument.id.clone(), instrument.clone()).is_none() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn retain_instruments(&self, keep: &dyn Fn(&Instrument) -> bool) -> Result<usize> {
        let mut map = write(&self.instruments);
        let before = map.len();
        map.retain(|_, i| keep(i));
        Ok(before - map.len())
    }

    fn read_recent_bars(&self, instrument_id: &str, limit: usize) -> Result<Vec<DailyBar>> {
        let bars = read(&self.bars);
        Ok(bars
            .range((instrument_id.to_string(), NaiveDate::MIN)..=(instrument_id.to_string(), NaiveDate::MAX))
            .rev()
            .take(limit)
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    fn upsert_bars(&self, new_bars: &[DailyBar]) -> Result<()> {
        let mut bars = write(&self.bars);
        for bar in new_bars {
            bars.insert((bar.instrument_id.clone(), bar.date), bar.clone());
        }
        Ok(())
    }

    fn bars_between(&self, instrument_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyBar>> {
        if start > end {
            return Ok(vec![]);
        }
        let bars = read(&self.bars);
        Ok(bars
            .range((instrument_id.to_string(), start)..=(instrument_id.to_string(), end))
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    fn upsert_metric(&self, metric: &DailyMetric) -> Result<()> {
        write(&self.metrics).insert((metric.date, metric.instrument_id.clone()), metric.clone());
        Ok(())
    }

    fn metrics_on(&self, date: NaiveDate) -> Result<Vec<DailyMetric>> {
        let metrics = read(&self.metrics);
        Ok(metrics
            .range((date, String::new())..)
            .take_while(|((d, _), _)| *d == date)
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn metrics_between(&self, instrument_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyMetric>> {
        if start > end {
            return Ok(vec![]);
        }
        let metrics = read(&self.metrics);
        Ok(metrics
            .range((start, String::new())..)
            .take_while(|((d, _), _)| *d <= end)
            .filter(|((_, id), _)| id == instrument_id)
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn latest_metric_date(&self) -> Result<Option<NaiveDate>> {
        Ok(read(&self.metrics).keys().next_back().map(|(d, _)| *d))
    }

    fn upsert_board(&self, board: &LeaderboardBoard) -> Result<()> {
        write(&self.boards).insert(
            (board.date, board.period.clone(), board.board_type),
            board.clone(),
        );
        Ok(())
    }

    fn boards(&self) -> Result<Vec<LeaderboardBoard>> {
        Ok(read(&self.boards).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(id: &str, day: u32, close: f64) -> DailyBar {
        DailyBar {
            instrument_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 5, day).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 10,
        }
    }

    #[test]
    fn test_upsert_bars_is_idempotent() {
        let store = MemoryStore::new();
        let bars = vec![bar("A", 1, 1.0), bar("A", 2, 2.0)];
        store.upsert_bars(&bars).unwrap();
        store.upsert_bars(&bars).unwrap();
        assert_eq!(store.bar_count(), 2);

        // last write wins
        store.upsert_bars(&[bar("A", 2, 3.0)]).unwrap();
        let recent = store.read_recent_bars("A", 10).unwrap();
        assert_eq!(recent[0].close, 3.0);
    }

    #[test]
    fn test_read_recent_is_newest_first_and_scoped() {
        let store = MemoryStore::new();
        store
            .upsert_bars(&[bar("A", 1, 1.0), bar("A", 3, 3.0), bar("A", 2, 2.0), bar("B", 4, 9.0)])
            .unwrap();

        let recent = store.read_recent_bars("A", 2).unwrap();
        let days: Vec<u32> = recent.iter().map(|b| chrono::Datelike::day(&b.date)).collect();
        assert_eq!(days, vec![3, 2]);
        assert!(store.read_recent_bars("C", 5).unwrap().is_empty());
    }

    #[test]
    fn test_retain_instruments() {
        let store = MemoryStore::new();
        let mut etf = Instrument::new("XNAS:QQQ", "QQQ", "Invesco QQQ");
        etf.kind = crate::types::InstrumentKind::Etf;
        let inserted = store
            .upsert_instruments(&[Instrument::new("XNAS:ACME", "ACME", "Acme"), etf])
            .unwrap();
        assert_eq!(inserted, 2);

        let removed = store
            .retain_instruments(&|i| i.kind != crate::types::InstrumentKind::Etf)
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.all_instruments().unwrap().len(), 1);
    }
}
