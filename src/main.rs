use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use market_leaderboards::catalog::{self, CatalogClient};
use market_leaderboards::query::{self, HistoryQuery, LeaderboardQuery};
use market_leaderboards::scheduler::{self, PipelineRun};
use market_leaderboards::source::{CsvDirSource, MarketDataSource, YahooChartSource, YAHOO_BASE_URL};
use market_leaderboards::types::{BoardType, Window};
use market_leaderboards::{FileStore, PipelineConfig, Store};

#[derive(Parser, Debug)]
#[command(name = "market-leaderboards")]
#[command(about = "Daily market data sync, metrics and leaderboards")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the persisted collections
    #[arg(long, global = true, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Execution date (YYYY-MM-DD), defaults to today in UTC
    #[arg(short = 'D', long, global = true)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceKind {
    Yahoo,
    Csv,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync bars, compute metrics and build leaderboards for every active instrument
    Run {
        /// Market data source
        #[arg(long, value_enum, env = "MARKET_SOURCE", default_value = "yahoo")]
        source: SourceKind,

        /// Base URL of the chart API
        #[arg(long, env = "YAHOO_BASE_URL", default_value = YAHOO_BASE_URL)]
        yahoo_base_url: String,

        /// Directory of <SYMBOL>.csv files for the csv source
        #[arg(long, env = "CSV_DIR")]
        csv_dir: Option<PathBuf>,

        /// Instrument tasks in flight at once
        #[arg(long, env = "MAX_CONCURRENCY")]
        max_concurrency: Option<usize>,
    },

    /// Rebuild leaderboards from stored metrics only
    Leaderboards,

    /// Seed the instrument catalog from NASDAQ Trader
    SeedInstruments {
        /// Fetch and filter, but write nothing
        #[arg(long, env = "SIMULATE")]
        simulate: bool,
    },

    /// Print a page of the most recent matching leaderboard
    Leaderboard {
        /// Period label (5d, 1M, 2M, 3M, 6M, 52w, market_movers)
        #[arg(short, long)]
        period: Option<String>,

        /// Board type (high, low, volume)
        #[arg(short = 't', long = "type")]
        board_type: Option<String>,

        #[arg(long, default_value = "0")]
        start: usize,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print instruments whose moving averages are stacked in trend order
    Stacked {
        #[arg(long, default_value = "0")]
        start: usize,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print stored bars and metrics for one or all instruments
    History {
        #[arg(short, long)]
        symbol: Option<String>,

        /// Trailing window label ending on --date
        #[arg(short, long)]
        window: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("market_leaderboards=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let today = Utc::now().date_naive();
    let execution_date = args.date.unwrap_or(today);

    let store: Arc<dyn Store> = Arc::new(
        FileStore::open(&args.data_dir)
            .with_context(|| format!("Failed to open data dir {:?}", args.data_dir))?,
    );
    let mut config = PipelineConfig::from_env();

    match args.command {
        Commands::Run {
            source,
            yahoo_base_url,
            csv_dir,
            max_concurrency,
        } => {
            if let Some(n) = max_concurrency {
                config.max_concurrency = n.max(1);
            }
            let source: Arc<dyn MarketDataSource> = match source {
                SourceKind::Yahoo => Arc::new(YahooChartSource::new(
                    yahoo_base_url,
                    Duration::from_secs(config.fetch_timeout_secs),
                )?),
                SourceKind::Csv => {
                    let Some(dir) = csv_dir else {
                        bail!("--csv-dir (or CSV_DIR) is required with the csv source");
                    };
                    Arc::new(CsvDirSource::new(dir))
                }
            };

            let run = PipelineRun::new(store, source, config, execution_date);
            info!("Starting run {} for {}", run.run_id(), execution_date);
            let summary = run.run().await?;
            println!(
                "{} instruments: {} updated, {} skipped, {} failed ({} retryable); {} boards written",
                summary.instruments,
                summary.updated,
                summary.skipped,
                summary.failed,
                summary.retryable,
                summary.boards_written()
            );
        }

        Commands::Leaderboards => {
            let boards =
                scheduler::run_leaderboards_only(store, config, execution_date, Utc::now()).await?;
            for board in boards {
                match board.date {
                    Some(date) => println!("{:<24} {} ({} entries)", board.kind.to_string(), date, board.items),
                    None => println!("{:<24} no data", board.kind.to_string()),
                }
            }
        }

        Commands::SeedInstruments { simulate } => {
            let client = CatalogClient::new(Duration::from_secs(20))?;
            let instruments = client.fetch_instruments().await?;
            let report = tokio::task::spawn_blocking(move || {
                catalog::save_instruments(store.as_ref(), &instruments, simulate)
            })
            .await??;
            println!(
                "fetched {}, inserted {}, removed {}, total {}",
                report.fetched, report.inserted, report.removed, report.total
            );
        }

        Commands::Leaderboard {
            period,
            board_type,
            start,
            limit,
        } => {
            let board_type = match board_type {
                Some(t) => Some(BoardType::parse(&t).with_context(|| format!("Unknown board type {}", t))?),
                None => None,
            };
            let page = query::leaderboard_page(
                store.as_ref(),
                &LeaderboardQuery {
                    period,
                    board_type,
                    date: args.date,
                    start,
                    limit,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }

        Commands::Stacked { start, limit } => {
            let page = query::stacked_trend(store.as_ref(), start, limit)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }

        Commands::History { symbol, window } => {
            let window = match window {
                Some(label) => Some(Window::from_label(&label).with_context(|| format!("Unknown window {}", label))?),
                None => None,
            };
            let history = query::instrument_history(
                store.as_ref(),
                &HistoryQuery {
                    symbol,
                    window,
                    date: args.date,
                },
                today,
            )?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
    }

    Ok(())
}
