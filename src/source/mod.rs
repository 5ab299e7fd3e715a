//! Market data sources
//!
//! A source turns a symbol and a requested span into daily OHLCV rows. It
//! either returns every row it has for the span or fails; there is no partial
//! result.

mod csv_dir;
mod yahoo;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::freshness::FetchSpan;
use crate::types::OhlcvRow;

pub use csv_dir::CsvDirSource;
pub use yahoo::{YahooChartSource, YAHOO_BASE_URL};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{symbol}: HTTP {status}: {body}")]
    Status { symbol: String, status: u16, body: String },
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("{symbol}: malformed payload: {reason}")]
    Malformed { symbol: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Worth retrying on a later run without operator action
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transport(_) | SourceError::Io(_) => true,
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            SourceError::UnknownSymbol(_) | SourceError::Malformed { .. } => false,
        }
    }
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Daily rows for `symbol` covering `span` and ending on `end`
    async fn fetch(&self, symbol: &str, span: FetchSpan, end: NaiveDate) -> Result<Vec<OhlcvRow>, SourceError>;

    fn name(&self) -> &str;
}
