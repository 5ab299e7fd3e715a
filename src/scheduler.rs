//! Fan-out/fan-in driver for one pipeline run
//!
//! Phases: Loading -> Fanning -> Draining -> Aggregating -> Done.
//!
//! One task per instrument runs read -> freshness -> (fetch -> upsert -> reread)
//! -> metrics -> upsert. Every task arrives at the [`RunBarrier`] exactly once,
//! whatever its outcome, and the task whose arrival brings the count to zero
//! builds the leaderboards. A run is consumed by [`PipelineRun::run`].

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{error, info, warn, Instrument as _};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::freshness::{self, FetchReason, FreshnessDecision};
use crate::leaderboard::{self, BoardOutcome};
use crate::metrics;
use crate::source::{MarketDataSource, SourceError};
use crate::store::{self, Store};
use crate::types::{DailyBar, Instrument};

/// Lifecycle of a run; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RunPhase {
    Loading,
    Fanning,
    Draining,
    Aggregating,
    Done,
}

#[derive(Debug)]
struct PhaseTracker {
    run_id: Uuid,
    phase: Mutex<RunPhase>,
}

impl PhaseTracker {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phase: Mutex::new(RunPhase::Loading),
        }
    }

    fn advance(&self, to: RunPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|p| p.into_inner());
        if to > *phase {
            info!(run_id = %self.run_id, "Run phase {:?} -> {:?}", *phase, to);
            *phase = to;
        }
    }

}

/// Countdown of outstanding instrument tasks
///
/// `arrive` returns true for exactly one caller: the one that moves the count
/// from one to zero. Arrivals past zero are refused rather than wrapping.
#[derive(Debug)]
pub struct RunBarrier {
    outstanding: AtomicUsize,
}

impl RunBarrier {
    pub fn new(count: usize) -> Self {
        Self {
            outstanding: AtomicUsize::new(count),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Record one completed task
    ///
    /// AcqRel: the releasing arrival that reaches zero observes every write
    /// made by tasks that arrived before it.
    pub fn arrive(&self) -> bool {
        match self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                error!("Barrier arrival after reaching zero ignored");
                false
            }
        }
    }
}

/// How one instrument task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Metrics written for `date`; `fetched` rows came from the source
    Updated { date: NaiveDate, fetched: usize },
    /// Nothing to compute (no bars even after fetching)
    Skipped,
    /// Fetch or persistence failed; prior state left untouched
    ///
    /// `retryable` is false when the source rejected the symbol or its payload,
    /// so a later run would fail the same way.
    Failed { reason: String, retryable: bool },
}

/// Totals for a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub execution_date: NaiveDate,
    pub instruments: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Failed tasks expected to succeed on a later run
    pub retryable: usize,
    /// Times leaderboard aggregation was triggered; one for every run
    pub aggregations: usize,
    pub boards: Vec<BoardOutcome>,
}

impl RunSummary {
    pub fn boards_written(&self) -> usize {
        self.boards.iter().filter(|b| b.date.is_some()).count()
    }
}

/// State shared by every task of a run
struct RunContext {
    run_id: Uuid,
    execution_date: NaiveDate,
    started_at: DateTime<Utc>,
    config: PipelineConfig,
    store: Arc<dyn Store>,
    source: Arc<dyn MarketDataSource>,
    phase: PhaseTracker,
}

/// Hands the aggregation result back to the run; fires at most once
struct AggregationTrigger {
    sender: Mutex<Option<oneshot::Sender<Result<Vec<BoardOutcome>>>>>,
    fired: AtomicUsize,
}

impl AggregationTrigger {
    async fn fire(&self, ctx: &RunContext) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        ctx.phase.advance(RunPhase::Aggregating);
        info!("All instrument metrics computed. Computing leaderboards...");

        let result = aggregate(
            ctx.store.clone(),
            ctx.config.clone(),
            ctx.execution_date,
            ctx.started_at,
        )
        .await;

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // receiver gone means the caller stopped waiting; boards are already stored
                let _ = tx.send(result);
            }
            None => error!("Leaderboard aggregation triggered more than once"),
        }
    }
}

pub struct PipelineRun {
    ctx: RunContext,
}

impl PipelineRun {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn MarketDataSource>,
        config: PipelineConfig,
        execution_date: NaiveDate,
    ) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            ctx: RunContext {
                run_id,
                execution_date,
                started_at: Utc::now(),
                config,
                store,
                source,
                phase: PhaseTracker::new(run_id),
            },
        }
    }

    /// Pin the timestamp stamped on metrics and boards
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.ctx.started_at = started_at;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    /// Execute the run to completion
    ///
    /// Tasks are spawned onto the runtime, so dropping this future stops the
    /// wait but not the tasks already scheduled.
    pub async fn run(self) -> Result<RunSummary> {
        let ctx = Arc::new(self.ctx);
        let span = tracing::info_span!("run", run_id = %ctx.run_id, date = %ctx.execution_date);
        execute(ctx).instrument(span).await
    }
}

async fn execute(ctx: Arc<RunContext>) -> Result<RunSummary> {
    let instruments = blocking(ctx.store.clone(), |s| s.active_instruments())
        .await
        .context("Failed to load instruments")?;
    let count = instruments.len();
    info!("Loaded {} active instruments", count);

    if count == 0 {
        ctx.phase.advance(RunPhase::Aggregating);
        let boards = aggregate(
            ctx.store.clone(),
            ctx.config.clone(),
            ctx.execution_date,
            ctx.started_at,
        )
        .await?;
        ctx.phase.advance(RunPhase::Done);
        return Ok(RunSummary {
            run_id: ctx.run_id,
            execution_date: ctx.execution_date,
            instruments: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            retryable: 0,
            aggregations: 1,
            boards,
        });
    }

    let barrier = Arc::new(RunBarrier::new(count));
    let (tx, rx) = oneshot::channel();
    let trigger = Arc::new(AggregationTrigger {
        sender: Mutex::new(Some(tx)),
        fired: AtomicUsize::new(0),
    });
    let permits = Arc::new(Semaphore::new(ctx.config.max_concurrency.max(1)));

    ctx.phase.advance(RunPhase::Fanning);
    let handles: Vec<_> = instruments
        .into_iter()
        .map(|instrument| {
            info!("Fan out for {}", instrument.symbol);
            let task = instrument_task(
                ctx.clone(),
                instrument,
                barrier.clone(),
                permits.clone(),
                trigger.clone(),
            );
            tokio::spawn(task.in_current_span())
        })
        .collect();
    ctx.phase.advance(RunPhase::Draining);

    let mut summary = RunSummary {
        run_id: ctx.run_id,
        execution_date: ctx.execution_date,
        instruments: count,
        updated: 0,
        skipped: 0,
        failed: 0,
        retryable: 0,
        aggregations: 0,
        boards: vec![],
    };
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(TaskOutcome::Updated { .. }) => summary.updated += 1,
            Ok(TaskOutcome::Skipped) => summary.skipped += 1,
            Ok(TaskOutcome::Failed { retryable, .. }) => {
                summary.failed += 1;
                summary.retryable += usize::from(retryable);
            }
            Err(e) => {
                error!("Instrument task aborted: {}", e);
                summary.failed += 1;
            }
        }
    }

    summary.boards = rx
        .await
        .map_err(|_| {
            anyhow!(
                "Leaderboard aggregation never ran ({} tasks outstanding)",
                barrier.outstanding()
            )
        })??;
    summary.aggregations = trigger.fired.load(Ordering::SeqCst);
    ctx.phase.advance(RunPhase::Done);

    info!(
        "Run complete: {} updated, {} skipped, {} failed ({} retryable), {} boards written",
        summary.updated,
        summary.skipped,
        summary.failed,
        summary.retryable,
        summary.boards_written()
    );
    Ok(summary)
}

/// Build leaderboards from what is already stored, without touching instruments
pub async fn run_leaderboards_only(
    store: Arc<dyn Store>,
    config: PipelineConfig,
    execution_date: NaiveDate,
    generated_at: DateTime<Utc>,
) -> Result<Vec<BoardOutcome>> {
    aggregate(store, config, execution_date, generated_at).await
}

async fn aggregate(
    store: Arc<dyn Store>,
    config: PipelineConfig,
    execution_date: NaiveDate,
    generated_at: DateTime<Utc>,
) -> Result<Vec<BoardOutcome>> {
    tokio::task::spawn_blocking(move || {
        leaderboard::build_all(store.as_ref(), execution_date, generated_at, &config)
    })
    .await
    .context("Leaderboard task panicked")?
}

async fn instrument_task(
    ctx: Arc<RunContext>,
    instrument: Instrument,
    barrier: Arc<RunBarrier>,
    permits: Arc<Semaphore>,
    trigger: Arc<AggregationTrigger>,
) -> TaskOutcome {
    let outcome = guarded(&ctx, &instrument, &permits).await;

    // every task arrives exactly once, success or not
    if barrier.arrive() {
        trigger.fire(&ctx).await;
    }
    outcome
}

/// Run one instrument, converting errors and panics into a task outcome
async fn guarded(ctx: &RunContext, instrument: &Instrument, permits: &Semaphore) -> TaskOutcome {
    let _permit = match permits.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            return TaskOutcome::Failed {
                reason: e.to_string(),
                retryable: true,
            }
        }
    };

    match AssertUnwindSafe(process_instrument(ctx, instrument))
        .catch_unwind()
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            // timeouts and store errors carry no SourceError and count as transient
            let retryable = e
                .downcast_ref::<SourceError>()
                .map_or(true, SourceError::is_transient);
            if retryable {
                warn!("Skipping {} this run: {:#}", instrument.symbol, e);
            } else {
                error!("Giving up on {}: {:#}", instrument.symbol, e);
            }
            TaskOutcome::Failed {
                reason: format!("{:#}", e),
                retryable,
            }
        }
        Err(_) => {
            error!("Task for {} panicked", instrument.symbol);
            TaskOutcome::Failed {
                reason: "panicked".to_string(),
                retryable: false,
            }
        }
    }
}

async fn process_instrument(ctx: &RunContext, instrument: &Instrument) -> Result<TaskOutcome> {
    let symbol = instrument.symbol.as_str();
    let existing = read_ascending(ctx, &instrument.id).await?;

    let decision = freshness::decide(&existing, ctx.execution_date, &ctx.config);
    let mut fetched = 0;

    let bars = match decision {
        FreshnessDecision::UseCache => {
            info!(
                "Using existing data for {} ({} bars, most recent: {})",
                symbol,
                existing.len(),
                existing.last().map(|b| b.date.to_string()).unwrap_or_default()
            );
            existing
        }
        FreshnessDecision::Fetch { span, reason } => {
            match reason {
                FetchReason::NoHistory => info!("No existing data for {}, fetching {}", symbol, span),
                FetchReason::Stale { days_old } => {
                    info!("Data for {} is {} days old, fetching {}", symbol, days_old, span)
                }
                FetchReason::Insufficient { bars } => {
                    info!("Insufficient data for {} ({} bars), fetching {}", symbol, bars, span)
                }
            }

            let timeout = Duration::from_secs(ctx.config.fetch_timeout_secs);
            let rows = tokio::time::timeout(timeout, ctx.source.fetch(symbol, span, ctx.execution_date))
                .await
                .map_err(|_| anyhow!("fetch from {} timed out after {:?}", ctx.source.name(), timeout))?
                .with_context(|| format!("fetch from {} failed", ctx.source.name()))?;

            fetched = rows.len();
            let new_bars: Vec<DailyBar> = rows.into_iter().map(|r| r.into_bar(&instrument.id)).collect();
            if !new_bars.is_empty() {
                blocking(ctx.store.clone(), move |s| s.upsert_bars(&new_bars)).await?;
                info!("Stored {} new/updated bars for {}", fetched, symbol);
            }

            // metrics always come from what is durably stored
            read_ascending(ctx, &instrument.id).await?
        }
    };

    let Some(metric) = metrics::compute(instrument, &bars, ctx.started_at) else {
        warn!("No data available for {}, skipping metrics computation", symbol);
        return Ok(TaskOutcome::Skipped);
    };

    info!("Computed metrics for {} at {}", symbol, metric.date);
    let date = metric.date;
    blocking(ctx.store.clone(), move |s| s.upsert_metric(&metric)).await?;

    Ok(TaskOutcome::Updated { date, fetched })
}

async fn read_ascending(ctx: &RunContext, instrument_id: &str) -> Result<Vec<DailyBar>> {
    let id = instrument_id.to_string();
    let limit = ctx.config.read_limit;
    let recent = blocking(ctx.store.clone(), move |s| s.read_recent_bars(&id, limit)).await?;
    Ok(store::ascending(recent))
}

/// Run a store call on the blocking pool
async fn blocking<T, F>(store: Arc<dyn Store>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .context("Store task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_barrier_single_release() {
        let barrier = RunBarrier::new(3);
        assert!(!barrier.arrive());
        assert!(!barrier.arrive());
        assert!(barrier.arrive());
        assert_eq!(barrier.outstanding(), 0);
        assert!(!barrier.arrive());
        assert_eq!(barrier.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_barrier_releases_once_under_contention() {
        for _ in 0..20 {
            let barrier = Arc::new(RunBarrier::new(50));
            let releases = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..50)
                .map(|_| {
                    let barrier = barrier.clone();
                    let releases = releases.clone();
                    let delay = rand::thread_rng().gen_range(0..5);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        if barrier.arrive() {
                            releases.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            futures::future::join_all(handles).await;

            assert_eq!(releases.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let tracker = PhaseTracker::new(Uuid::new_v4());
        tracker.advance(RunPhase::Aggregating);
        tracker.advance(RunPhase::Draining);
        assert_eq!(*tracker.phase.lock().unwrap(), RunPhase::Aggregating);
        tracker.advance(RunPhase::Done);
        assert_eq!(*tracker.phase.lock().unwrap(), RunPhase::Done);
    }
}
