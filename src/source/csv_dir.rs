//! Offline source reading one CSV file per symbol
//!
//! Files are `<dir>/<SYMBOL>.csv` with the header
//! `date,open,high,low,close,volume` and ISO dates.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::PathBuf;

use super::{MarketDataSource, SourceError};
use crate::freshness::FetchSpan;
use crate::types::OhlcvRow;

pub struct CsvDirSource {
    dir: PathBuf,
}

impl CsvDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn parse_rows(symbol: &str, data: &[u8]) -> Result<Vec<OhlcvRow>, SourceError> {
    let mut reader = csv::Reader::from_reader(data);
    let mut rows = Vec::new();
    for record in reader.deserialize::<OhlcvRow>() {
        let row = record.map_err(|e| SourceError::Malformed {
            symbol: symbol.to_string(),
            reason: e.to_string(),
        })?;
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl MarketDataSource for CsvDirSource {
    async fn fetch(&self, symbol: &str, span: FetchSpan, end: NaiveDate) -> Result<Vec<OhlcvRow>, SourceError> {
        let path = self.dir.join(format!("{}.csv", symbol));
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::UnknownSymbol(symbol.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let start = span.start_date(end);
        let mut rows: Vec<OhlcvRow> = parse_rows(symbol, &data)?
            .into_iter()
            .filter(|r| r.date >= start && r.date <= end)
            .collect();
        rows.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(rows)
    }

    fn name(&self) -> &str {
        "csv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACME: &str = "date,open,high,low,close,volume\n\
        2025-05-28,10,11,9,10.5,100\n\
        2025-06-02,10.5,12,10,11.5,200\n\
        2025-06-03,11.5,12.5,11,12,300\n\
        2025-06-09,12,13,11.5,12.5,400\n";

    #[tokio::test]
    async fn test_fetch_filters_to_span() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ACME.csv"), ACME).unwrap();
        let source = CsvDirSource::new(dir.path());

        let end = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();
        let rows = source.fetch("ACME", FetchSpan::Days(5), end).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].volume, 300);

        let rows = source.fetch("ACME", FetchSpan::TradingDays(252), end).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_unknown_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvDirSource::new(dir.path());
        let end = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();

        let err = source.fetch("NOPE", FetchSpan::TradingDays(252), end).await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownSymbol(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_malformed_row() {
        let err = parse_rows("BAD", b"date,open,high,low,close,volume\n2025-01-01,x,1,1,1,1\n").unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }
}
