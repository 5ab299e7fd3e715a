//! Instrument catalog seeding from NASDAQ Trader symbol directories
//!
//! Both directory files are pipe-delimited with a header row and a trailing
//! `File Creation Time` line. Only common stock listed on XNAS or XNYS is kept.

use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::store::Store;
use crate::types::{Instrument, InstrumentKind};

pub const NASDAQ_LISTED_URL: &str = "https://www.nasdaqtrader.com/dynamic/symdir/nasdaqlisted.txt";
pub const OTHER_LISTED_URL: &str = "https://www.nasdaqtrader.com/dynamic/symdir/otherlisted.txt";

/// Exchanges the catalog keeps
pub const ALLOWED_EXCHANGES: [&str; 2] = ["XNAS", "XNYS"];

const SPECIAL_WORDS: [&str; 6] = ["warrant", "warrants", "unit", "units", "right", "rights"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFile {
    /// `nasdaqlisted.txt`, every row is XNAS
    NasdaqListed,
    /// `otherlisted.txt`, exchange taken from the `Exchange` column
    OtherListed,
}

impl ListingFile {
    fn symbol_column(&self) -> &'static str {
        match self {
            ListingFile::NasdaqListed => "Symbol",
            ListingFile::OtherListed => "ACT Symbol",
        }
    }
}

type Row = HashMap<String, String>;

/// Split a directory file into header-keyed rows
///
/// Rows whose field count differs from the header (the footer included) are dropped.
pub fn parse_pipe_file(text: &str) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .quoting(false)
        .flexible(true)
        .from_reader(text.trim().as_bytes());

    let headers = reader.headers().context("Missing header row")?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Unreadable directory row")?;
        if record.get(0).is_some_and(|f| f.starts_with("File Creation Time")) {
            continue;
        }
        if record.len() != headers.len() {
            continue;
        }
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

/// Exchange MIC for an `otherlisted.txt` exchange code
pub fn other_listed_exchange(code: &str) -> Option<&'static str> {
    match code {
        "N" | "Z" => Some("XNAS"),
        "A" | "P" => Some("XASE"),
        "V" => Some("XNYS"),
        _ => None,
    }
}

/// Warrants, units and rights, matched on whole words of the security name
fn is_special_security_name(name: &str) -> bool {
    name.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| SPECIAL_WORDS.contains(&word))
}

fn field<'a>(row: &'a Row, key: &str) -> &'a str {
    row.get(key).map(String::as_str).unwrap_or("")
}

/// Instruments worth tracking from one directory file
pub fn select_instruments(file: ListingFile, rows: &[Row]) -> Vec<Instrument> {
    rows.iter()
        .filter_map(|row| {
            if field(row, "Test Issue") == "Y" || field(row, "ETF") == "Y" {
                return None;
            }
            // otherlisted.txt has no Financial Status column
            if let Some(status) = row.get("Financial Status") {
                if status != "N" {
                    return None;
                }
            }

            let symbol = field(row, file.symbol_column());
            let name = field(row, "Security Name");
            if symbol.is_empty() || is_special_security_name(name) {
                return None;
            }

            let exchange = match file {
                ListingFile::NasdaqListed => "XNAS",
                ListingFile::OtherListed => other_listed_exchange(field(row, "Exchange"))?,
            };
            if !ALLOWED_EXCHANGES.contains(&exchange) {
                return None;
            }

            Some(Instrument {
                id: format!("{}:{}", exchange, symbol),
                symbol: symbol.to_string(),
                name: name.to_string(),
                exchange: exchange.to_string(),
                kind: InstrumentKind::Equity,
                active: true,
            })
        })
        .collect()
}

/// HTTP client for the two directory files
pub struct CatalogClient {
    client: Client,
    nasdaq_url: String,
    other_url: String,
}

impl CatalogClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_urls(NASDAQ_LISTED_URL, OTHER_LISTED_URL, timeout)
    }

    pub fn with_urls(nasdaq_url: impl Into<String>, other_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0")
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            nasdaq_url: nasdaq_url.into(),
            other_url: other_url.into(),
        })
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .with_context(|| format!("Bad status from {}", url))?;
        response.text().await.context("Failed to read response body")
    }

    /// Fetch both directories and select instruments from each
    pub async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        info!("Fetching instruments from NASDAQ Trader...");
        let (nasdaq, other) = tokio::try_join!(
            self.fetch_text(&self.nasdaq_url),
            self.fetch_text(&self.other_url)
        )?;

        let mut instruments = select_instruments(ListingFile::NasdaqListed, &parse_pipe_file(&nasdaq)?);
        instruments.extend(select_instruments(ListingFile::OtherListed, &parse_pipe_file(&other)?));
        info!("Fetched {} instruments", instruments.len());
        Ok(instruments)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedReport {
    pub fetched: usize,
    pub inserted: usize,
    pub removed: usize,
    pub total: usize,
}

/// Upsert `instruments`, then drop anything outside the allowed exchanges or of ETF kind
///
/// With `simulate` nothing is written and only the fetched count is reported.
pub fn save_instruments(store: &dyn Store, instruments: &[Instrument], simulate: bool) -> Result<SeedReport> {
    let mut report = SeedReport {
        fetched: instruments.len(),
        ..Default::default()
    };

    if simulate {
        info!("[SIMU] would upsert {} instruments", instruments.len());
        info!("[SIMU] no store changes performed");
        return Ok(report);
    }

    report.inserted = store.upsert_instruments(instruments)?;
    report.removed = store.retain_instruments(&|i| {
        ALLOWED_EXCHANGES.contains(&i.exchange.as_str()) && i.kind != InstrumentKind::Etf
    })?;
    report.total = store.all_instruments()?.len();

    if report.removed > 0 {
        warn!("Removed {} instruments outside XNAS/XNYS or of ETF kind", report.removed);
    }
    info!(
        "Catalog saved: {} new, {} updated, {} total",
        report.inserted,
        report.fetched - report.inserted,
        report.total
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const NASDAQ: &str = "Symbol|Security Name|Market Category|Test Issue|Financial Status|Round Lot Size|ETF|NextShares\n\
        AAPL|Apple Inc. - Common Stock|Q|N|N|100|N|N\n\
        QQQ|Invesco QQQ Trust, Series 1|G|N|N|100|Y|N\n\
        ZXZZT|NASDAQ TEST STOCK|G|Y|N|100|N|N\n\
        BADF|Bad Finance Corp|S|N|D|100|N|N\n\
        ACMEW|Acme Corp Warrants|S|N|N|100|N|N\n\
        CMTY|Community Bankers Trust Common Stock|S|N|N|100|N|N\n\
        File Creation Time: 0605202521:31|||||||\n";

    const OTHER: &str = "ACT Symbol|Security Name|Exchange|CQS Symbol|ETF|Round Lot Size|Test Issue|NASDAQ Symbol\n\
        IBM|International Business Machines Corporation Common Stock|V|IBM|N|100|N|IBM\n\
        SPY|SPDR S&P 500 ETF Trust|P|SPY|Y|100|N|SPY\n\
        AMX|Amex Listed Corp|A|AMX|N|100|N|AMX\n\
        XYZ.U|XYZ Acquisition Corp Units|V|XYZ.U|N|100|N|XYZ=\n\
        File Creation Time: 0605202521:31|||||||\n";

    #[test]
    fn test_parse_pipe_file_skips_footer() {
        let rows = parse_pipe_file(NASDAQ).unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0]["Symbol"], "AAPL");
    }

    #[test]
    fn test_select_nasdaq_listed() {
        let rows = parse_pipe_file(NASDAQ).unwrap();
        let selected = select_instruments(ListingFile::NasdaqListed, &rows);
        let ids: Vec<&str> = selected.iter().map(|i| i.id.as_str()).collect();
        // "Community" must not be mistaken for "unit"
        assert_eq!(ids, vec!["XNAS:AAPL", "XNAS:CMTY"]);
        assert!(selected.iter().all(|i| i.active && i.kind == InstrumentKind::Equity));
    }

    #[test]
    fn test_select_other_listed() {
        let rows = parse_pipe_file(OTHER).unwrap();
        let selected = select_instruments(ListingFile::OtherListed, &rows);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "XNYS:IBM");
        assert_eq!(selected[0].exchange, "XNYS");
    }

    #[test]
    fn test_exchange_codes() {
        assert_eq!(other_listed_exchange("N"), Some("XNAS"));
        assert_eq!(other_listed_exchange("P"), Some("XASE"));
        assert_eq!(other_listed_exchange("V"), Some("XNYS"));
        assert_eq!(other_listed_exchange("Q"), None);
    }

    #[test]
    fn test_save_removes_disallowed() {
        let store = MemoryStore::new();
        let mut legacy = Instrument::new("XASE:OLD", "OLD", "Old Listing");
        legacy.exchange = "XASE".to_string();
        store.upsert_instruments(&[legacy]).unwrap();

        let mut aapl = Instrument::new("XNAS:AAPL", "AAPL", "Apple");
        aapl.exchange = "XNAS".to_string();

        let simulated = save_instruments(&store, &[aapl.clone()], true).unwrap();
        assert_eq!(simulated.fetched, 1);
        assert_eq!(store.all_instruments().unwrap().len(), 1);

        let report = save_instruments(&store, &[aapl], false).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.total, 1);
        assert_eq!(store.all_instruments().unwrap()[0].id, "XNAS:AAPL");
    }

    #[tokio::test]
    async fn test_fetch_instruments_from_mock() {
        use wiremock::matchers::path;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(path("/nasdaqlisted.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(NASDAQ))
            .mount(&server)
            .await;
        Mock::given(path("/otherlisted.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(OTHER))
            .mount(&server)
            .await;

        let client = CatalogClient::with_urls(
            format!("{}/nasdaqlisted.txt", server.uri()),
            format!("{}/otherlisted.txt", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let instruments = client.fetch_instruments().await.unwrap();
        assert_eq!(instruments.len(), 3);
    }
}
