//! Yahoo Finance chart API client

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{MarketDataSource, SourceError};
use crate::freshness::FetchSpan;
use crate::types::OhlcvRow;

pub const YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";

const USER_AGENT: &str = "Mozilla/5.0";

pub struct YahooChartSource {
    client: Client,
    base_url: String,
}

impl YahooChartSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

/// Convert a chart payload into rows; rows with any missing price are dropped
fn parse_chart(symbol: &str, body: &str) -> Result<Vec<OhlcvRow>, SourceError> {
    let malformed = |reason: String| SourceError::Malformed {
        symbol: symbol.to_string(),
        reason,
    };

    let envelope: ChartEnvelope = serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;

    if let Some(err) = envelope.chart.error {
        if err.code.eq_ignore_ascii_case("Not Found") {
            return Err(SourceError::UnknownSymbol(symbol.to_string()));
        }
        return Err(malformed(format!(
            "{}: {}",
            err.code,
            err.description.unwrap_or_default()
        )));
    }

    let Some(result) = envelope.chart.result.and_then(|mut r| r.pop()) else {
        return Err(SourceError::UnknownSymbol(symbol.to_string()));
    };

    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let offset = result.meta.gmtoffset;

    let mut rows = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let at = |v: &Vec<Option<f64>>| v.get(i).copied().flatten();
        let (Some(open), Some(high), Some(low), Some(close)) =
            (at(&quote.open), at(&quote.high), at(&quote.low), at(&quote.close))
        else {
            continue;
        };
        let Some(stamp) = DateTime::from_timestamp(ts + offset, 0) else {
            return Err(malformed(format!("timestamp out of range: {}", ts)));
        };
        rows.push(OhlcvRow {
            date: stamp.date_naive(),
            open,
            high,
            low,
            close,
            volume: quote.volume.get(i).copied().flatten().unwrap_or(0),
        });
    }

    rows.sort_by(|a, b| a.date.cmp(&b.date));
    rows.dedup_by(|later, earlier| later.date == earlier.date);
    Ok(rows)
}

fn day_start_ts(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

#[async_trait]
impl MarketDataSource for YahooChartSource {
    async fn fetch(&self, symbol: &str, span: FetchSpan, end: NaiveDate) -> Result<Vec<OhlcvRow>, SourceError> {
        let period1 = day_start_ts(span.start_date(end));
        let period2 = day_start_ts(end + chrono::Duration::days(1));
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol);

        debug!("Fetching {} ({}) from {}", symbol, span, url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
                ("events", "history".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        // unknown tickers come back as 404 with a chart error body
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::UnknownSymbol(symbol.to_string()));
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                symbol: symbol.to_string(),
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        parse_chart(symbol, &body)
    }

    fn name(&self) -> &str {
        "yahoo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHART: &str = r#"{
        "chart": {
            "result": [{
                "meta": {"symbol": "ACME", "gmtoffset": -14400},
                "timestamp": [1748871000, 1748957400, 1749043800],
                "indicators": {"quote": [{
                    "open":   [100.0, 101.0, null],
                    "high":   [102.0, 103.0, 104.0],
                    "low":    [99.0, 100.5, 101.0],
                    "close":  [101.5, 102.5, 103.0],
                    "volume": [1000, null, 3000]
                }]}
            }],
            "error": null
        }
    }"#;

    #[test]
    fn test_parse_chart_drops_incomplete_rows() {
        let rows = parse_chart("ACME", CHART).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
        assert_eq!(rows[0].close, 101.5);
        assert_eq!(rows[1].volume, 0);
    }

    #[test]
    fn test_parse_chart_error_maps_unknown_symbol() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        assert!(matches!(
            parse_chart("NOPE", body),
            Err(SourceError::UnknownSymbol(_))
        ));
        assert!(matches!(
            parse_chart("NOPE", "not json"),
            Err(SourceError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/ACME"))
            .and(query_param("interval", "1d"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CHART))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/BUSY"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;

        let source = YahooChartSource::new(server.uri(), Duration::from_secs(5)).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 6, 4).unwrap();

        let rows = source.fetch("ACME", FetchSpan::Days(8), end).await.unwrap();
        assert_eq!(rows.len(), 2);

        let err = source.fetch("BUSY", FetchSpan::TradingDays(252), end).await.unwrap_err();
        assert!(matches!(err, SourceError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }
}
