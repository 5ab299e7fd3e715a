//! Directory-backed store of zstd-compressed JSON records
//!
//! Layout under the root directory:
//! - `instruments.json.zst`
//! - `bars/<instrument>.json.zst`
//! - `metrics/<YYYY-MM-DD>/<instrument>.json.zst`
//! - `leaderboards/<YYYY-MM-DD>/<period>_<type>.json.zst`
//!
//! The path is the record key, so uniqueness holds by construction. Writes go
//! to a temporary sibling and are renamed into place.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::Store;
use crate::types::{DailyBar, DailyMetric, Instrument, LeaderboardBoard};

const EXT: &str = ".json.zst";
const ZSTD_LEVEL: i32 = 3;

pub struct FileStore {
    root: PathBuf,
    /// Serialises read-modify-write of the instrument file
    instruments_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["bars", "metrics", "leaderboards"] {
            std::fs::create_dir_all(root.join(sub))
                .with_context(|| format!("Failed to create {:?}", root.join(sub)))?;
        }
        Ok(Self {
            root,
            instruments_lock: Mutex::new(()),
        })
    }

    fn instruments_path(&self) -> PathBuf {
        self.root.join(format!("instruments{}", EXT))
    }

    fn bars_path(&self, instrument_id: &str) -> PathBuf {
        self.root.join("bars").join(format!("{}{}", file_key(instrument_id), EXT))
    }

    fn metrics_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join("metrics").join(date.to_string())
    }

    fn metric_path(&self, instrument_id: &str, date: NaiveDate) -> PathBuf {
        self.metrics_dir(date)
            .join(format!("{}{}", file_key(instrument_id), EXT))
    }

    fn board_path(&self, board: &LeaderboardBoard) -> PathBuf {
        self.root
            .join("leaderboards")
            .join(board.date.to_string())
            .join(format!("{}_{}{}", file_key(&board.period), board.board_type, EXT))
    }

    fn load_instruments(&self) -> Result<BTreeMap<String, Instrument>> {
        let list: Vec<Instrument> = read_record(&self.instruments_path())?.unwrap_or_default();
        Ok(list.into_iter().map(|i| (i.id.clone(), i)).collect())
    }

    fn save_instruments(&self, map: &BTreeMap<String, Instrument>) -> Result<()> {
        let list: Vec<&Instrument> = map.values().collect();
        write_record(&self.instruments_path(), &list)
    }

    fn load_bars(&self, instrument_id: &str) -> Result<Vec<DailyBar>> {
        Ok(read_record(&self.bars_path(instrument_id))?.unwrap_or_default())
    }

    /// Date directories under `metrics/`, ascending
    fn metric_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates: Vec<NaiveDate> = list_dir(&self.root.join("metrics"))?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
            })
            .collect();
        dates.sort();
        Ok(dates)
    }
}

impl Store for FileStore {
    fn active_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(self
            .load_instruments()?
            .into_values()
            .filter(|i| i.active)
            .collect())
    }

    fn all_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(self.load_instruments()?.into_values().collect())
    }

    fn upsert_instruments(&self, instruments: &[Instrument]) -> Result<usize> {
        let _guard = self
            .instruments_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut map = self.load_instruments()?;
        let mut inserted = 0;
        for instrument in instruments {
            if map.insert(instrument.id.clone(), instrument.clone()).is_none() {
                inserted += 1;
            }
        }
        self.save_instruments(&map)?;
        Ok(inserted)
    }

    fn retain_instruments(&self, keep: &dyn Fn(&Instrument) -> bool) -> Result<usize> {
        let _guard = self
            .instruments_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut map = self.load_instruments()?;
        let before = map.len();
        map.retain(|_, i| keep(i));
        let removed = before - map.len();
        if removed > 0 {
            self.save_instruments(&map)?;
        }
        Ok(removed)
    }

    fn read_recent_bars(&self, instrument_id: &str, limit: usize) -> Result<Vec<DailyBar>> {
        let mut bars = self.load_bars(instrument_id)?;
        bars.sort_by(|a, b| b.date.cmp(&a.date));
        bars.truncate(limit);
        Ok(bars)
    }

    fn upsert_bars(&self, new_bars: &[DailyBar]) -> Result<()> {
        // group so each instrument file is rewritten once
        let mut by_instrument: BTreeMap<&str, Vec<&DailyBar>> = BTreeMap::new();
        for bar in new_bars {
            by_instrument.entry(bar.instrument_id.as_str()).or_default().push(bar);
        }

        for (instrument_id, incoming) in by_instrument {
            let mut merged: BTreeMap<NaiveDate, DailyBar> = self
                .load_bars(instrument_id)?
                .into_iter()
                .map(|b| (b.date, b))
                .collect();
            for bar in incoming {
                merged.insert(bar.date, bar.clone());
            }
            let bars: Vec<DailyBar> = merged.into_values().collect();
            write_record(&self.bars_path(instrument_id), &bars)?;
            debug!("Stored {} bars for {}", bars.len(), instrument_id);
        }
        Ok(())
    }

    fn bars_between(&self, instrument_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyBar>> {
        let mut bars: Vec<DailyBar> = self
            .load_bars(instrument_id)?
            .into_iter()
            .filter(|b| b.date >= start && b.date <= end)
            .collect();
        bars.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(bars)
    }

    fn upsert_metric(&self, metric: &DailyMetric) -> Result<()> {
        write_record(&self.metric_path(&metric.instrument_id, metric.date), metric)
    }

    fn metrics_on(&self, date: NaiveDate) -> Result<Vec<DailyMetric>> {
        let mut metrics = Vec::new();
        for path in list_dir(&self.metrics_dir(date))? {
            if let Some(metric) = read_record::<DailyMetric>(&path)? {
                metrics.push(metric);
            }
        }
        metrics.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
        Ok(metrics)
    }

    fn metrics_between(&self, instrument_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyMetric>> {
        let mut metrics = Vec::new();
        for date in self.metric_dates()? {
            if date < start || date > end {
                continue;
            }
            if let Some(metric) = read_record(&self.metric_path(instrument_id, date))? {
                metrics.push(metric);
            }
        }
        Ok(metrics)
    }

    fn latest_metric_date(&self) -> Result<Option<NaiveDate>> {
        for date in self.metric_dates()?.into_iter().rev() {
            if !list_dir(&self.metrics_dir(date))?.is_empty() {
                return Ok(Some(date));
            }
        }
        Ok(None)
    }

    fn upsert_board(&self, board: &LeaderboardBoard) -> Result<()> {
        write_record(&self.board_path(board), board)
    }

    fn boards(&self) -> Result<Vec<LeaderboardBoard>> {
        let mut boards = Vec::new();
        for dir in list_dir(&self.root.join("leaderboards"))? {
            if !dir.is_dir() {
                continue;
            }
            for path in list_dir(&dir)? {
                if let Some(board) = read_record::<LeaderboardBoard>(&path)? {
                    boards.push(board);
                }
            }
        }
        boards.sort_by(|a, b| {
            (a.date, &a.period, a.board_type).cmp(&(b.date, &b.period, b.board_type))
        });
        Ok(boards)
    }
}

/// Filesystem-safe, collision-free encoding of a record key
///
/// ASCII alphanumerics, `-` and `.` pass through; anything else becomes `_xx`.
pub fn file_key(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("_{:02x}", byte)),
        }
    }
    out
}

/// Record files in `dir`, sorted by name; missing directory yields nothing
fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        let is_record = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(EXT))
            .unwrap_or(false);
        if is_record || path.is_dir() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let compressed = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let json = zstd::decode_all(&compressed[..])?;
    let record = serde_json::from_slice(&json).with_context(|| format!("Malformed record {:?}", path))?;
    Ok(Some(record))
}

fn write_record<T: Serialize + ?Sized>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(record)?;
    let compressed = zstd::encode_all(&json[..], ZSTD_LEVEL)?;

    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, compressed).with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", path))?;
    Ok(())
}
