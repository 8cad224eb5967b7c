//! End-to-end sampling runs: restore state, materialize work, drive the worker
//! pool, and write `reports/<run_id>/`.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hrs_adapters::{adapter_for_site, SiteAdapter};
use hrs_storage::{FileStore, HttpProbe, Persistence, ProbeReport, RateBudgetSnapshot, RateLimiter};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SamplerConfig;
use crate::pool::{PoolReport, WorkerPool, WorkerPoolConfig};
use crate::quota::{allocate, QuotaPlan};
use crate::scheduler::{CancelCounts, SchedulerConfig, SchedulerReport, TaskScheduler, TaskScope, TaskStats};

/// Decides what happens once a challenge closes the fetch gate.
///
/// Runs on a blocking thread, so implementations may wait on a human.
pub trait ChallengeResolver: Send + Sync {
    /// `true` resumes fetching; `false` cancels the rest of the run.
    fn resolve(&self, budget: RateBudgetSnapshot) -> bool;
}

/// Non-interactive default: a challenge ends the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnChallenge;

impl ChallengeResolver for AbortOnChallenge {
    fn resolve(&self, _budget: RateBudgetSnapshot) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotelSelection {
    One(String),
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub site: String,
    pub probe_url: String,
    pub reachable: bool,
    pub status: Option<u16>,
    pub elapsed_ms: u64,
    pub failure: Option<String>,
    pub plan: QuotaPlan,
}

impl CheckReport {
    fn new(site: &str, probe: ProbeReport, plan: QuotaPlan) -> Self {
        Self {
            site: site.to_string(),
            probe_url: probe.url.clone(),
            reachable: probe.is_ok(),
            status: probe.status,
            elapsed_ms: probe.elapsed.as_millis() as u64,
            failure: probe
                .failure
                .as_ref()
                .map(|(class, message)| format!("{}: {message}", class.as_str())),
            plan,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: String,
    pub hotels_only: bool,
    pub materialized: usize,
    pub pool: PoolReport,
    pub report: SchedulerReport,
    pub reports_dir: String,
    /// An unresolved challenge or an interrupt cancelled the rest of the run.
    pub aborted: bool,
}

impl RunSummary {
    pub fn has_terminal_failures(&self) -> bool {
        self.report.has_terminal_failures()
    }

    /// Every task in scope settled without a terminal failure or an abort.
    pub fn is_success(&self) -> bool {
        !self.aborted && !self.has_terminal_failures()
    }
}

enum RunRequest {
    Plan(QuotaPlan),
    Reviews(Vec<String>),
    RetryFailed,
}

pub struct SamplingPipeline {
    config: SamplerConfig,
    store: Arc<dyn Persistence>,
    adapter: Arc<dyn SiteAdapter>,
    resolver: Arc<dyn ChallengeResolver>,
    handle_interrupt: bool,
}

impl SamplingPipeline {
    /// File-backed store under `data_dir` and the configured site adapter.
    pub async fn open(config: SamplerConfig) -> Result<Self> {
        let store = FileStore::open(&config.data_dir)
            .await
            .with_context(|| format!("opening store at {}", config.data_dir.display()))?;
        let adapter = adapter_for_site(&config.site, &config.fixtures_dir)
            .with_context(|| format!("no adapter for site {}", config.site))?;
        Ok(Self::with_parts(config, Arc::new(store), Arc::from(adapter)))
    }

    pub fn with_parts(config: SamplerConfig, store: Arc<dyn Persistence>, adapter: Arc<dyn SiteAdapter>) -> Self {
        Self {
            config,
            store,
            adapter,
            resolver: Arc::new(AbortOnChallenge),
            handle_interrupt: true,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ChallengeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Tests run several pipelines per process; none of them should own Ctrl-C.
    pub fn without_interrupt_handler(mut self) -> Self {
        self.handle_interrupt = false;
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub async fn check(&self) -> Result<CheckReport> {
        let plan = self.plan_preview(None).await?;
        let probe = HttpProbe::new(self.config.probe_config())?;
        let report = probe.check(&self.config.probe_url).await;
        if report.is_ok() {
            info!(url = %report.url, status = ?report.status, "site reachable");
        } else {
            warn!(url = %report.url, failure = ?report.failure, "site check failed");
        }
        Ok(CheckReport::new(&self.config.site, report, plan))
    }

    /// The quota plan a run would materialize, without touching any state.
    pub async fn plan_preview(&self, region: Option<&str>) -> Result<QuotaPlan> {
        let taxonomy = self.config.load_taxonomy().await?;
        if let Some(region) = region {
            if taxonomy.region(region).is_none() {
                bail!("unknown region {region:?}");
            }
        }
        let plan = allocate(&taxonomy).context("building quota plan")?;
        Ok(plan.scoped(region))
    }

    /// Hotel lists for one region (or all) and, unless `hotels_only`, the
    /// review waterfall for every accepted hotel.
    pub async fn run_plan(&self, region: Option<&str>, hotels_only: bool) -> Result<RunSummary> {
        let plan = self.plan_preview(region).await?;
        let scope = match region {
            Some(region) => TaskScope::Region(region.to_string()),
            None => TaskScope::All,
        };
        self.execute(scope, RunRequest::Plan(plan), hotels_only).await
    }

    pub async fn run_reviews(&self, selection: HotelSelection) -> Result<RunSummary> {
        let known: BTreeSet<String> = self
            .store
            .load_hotels()
            .await?
            .into_iter()
            .map(|h| h.external_id)
            .collect();
        let hotel_ids: BTreeSet<String> = match selection {
            HotelSelection::One(id) if known.contains(&id) => BTreeSet::from([id]),
            HotelSelection::One(id) => bail!("hotel {id} is not in the catalog; run a plan first"),
            HotelSelection::All => known,
        };
        let request = RunRequest::Reviews(hotel_ids.iter().cloned().collect());
        self.execute(TaskScope::Hotels(hotel_ids), request, false).await
    }

    pub async fn retry_failed(&self) -> Result<RunSummary> {
        self.execute(TaskScope::All, RunRequest::RetryFailed, false).await
    }

    /// Counts over every persisted task record; read-only.
    pub async fn status(&self) -> Result<TaskStats> {
        let tasks = self.store.load_tasks().await?;
        Ok(TaskStats::from_records(&tasks))
    }

    /// Cancels the persisted pending work of a region.
    pub async fn cancel_region(&self, region: &str) -> Result<CancelCounts> {
        let scheduler = self.scheduler(false)?;
        scheduler.restore().await?;
        let counts = scheduler.cancel_scope(&TaskScope::Region(region.to_string())).await?;
        Ok(counts)
    }

    fn scheduler(&self, hotels_only: bool) -> Result<TaskScheduler> {
        let scheduler = TaskScheduler::new(
            Arc::clone(&self.store),
            SchedulerConfig {
                backoff: self.config.backoff,
                waterfall: self.config.waterfall,
                materialize_reviews: !hotels_only,
            },
        )?;
        Ok(scheduler)
    }

    async fn execute(&self, scope: TaskScope, request: RunRequest, hotels_only: bool) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sampling_run", %run_id, scope = %scope.describe());
        self.execute_inner(run_id, scope, request, hotels_only)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        run_id: Uuid,
        scope: TaskScope,
        request: RunRequest,
        hotels_only: bool,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let scheduler = Arc::new(self.scheduler(hotels_only)?);
        scheduler.restore().await.context("restoring task state")?;
        scheduler.set_scope(scope.clone()).await;

        let materialized = match request {
            RunRequest::Plan(plan) => scheduler.materialize_plan(&plan).await?,
            RunRequest::Reviews(hotel_ids) => {
                let before = scheduler.stats().await.total;
                for hotel_id in hotel_ids {
                    scheduler.submit_hotel_reviews(&hotel_id).await?;
                }
                scheduler.stats().await.total - before
            }
            RunRequest::RetryFailed => scheduler.retry_failed().await?,
        };
        info!(materialized, hotels_only, "run prepared");

        let limiter = Arc::new(RateLimiter::new(self.config.rate_limit));
        let aborted = Arc::new(AtomicBool::new(false));
        let mut watchers = vec![tokio::spawn(watch_challenges(
            Arc::clone(&limiter),
            Arc::clone(&scheduler),
            Arc::clone(&self.resolver),
            scope.clone(),
            Arc::clone(&aborted),
        ))];
        if self.handle_interrupt {
            watchers.push(tokio::spawn(cancel_on_interrupt(
                Arc::clone(&limiter),
                Arc::clone(&scheduler),
                scope.clone(),
                Arc::clone(&aborted),
            )));
        }

        let pool = WorkerPool::new(
            WorkerPoolConfig {
                workers: self.config.workers,
                attempt_timeout: self.config.attempt_timeout,
                max_pages_per_task: self.config.max_pages_per_task,
            },
            Arc::clone(&scheduler),
            Arc::clone(&self.adapter),
            Arc::clone(&self.store),
            Arc::clone(&limiter),
        );
        let pool_result = pool.run().await;
        for watcher in watchers {
            watcher.abort();
        }
        let pool_report = pool_result?;

        let report = scheduler.report().await?;
        let finished_at = Utc::now();
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            scope: scope.describe(),
            hotels_only,
            materialized,
            pool: pool_report,
            report,
            reports_dir: String::new(),
            aborted: aborted.load(AtomicOrdering::SeqCst),
        };
        let reports_dir = self.write_reports(&summary).await?;
        summary.reports_dir = reports_dir.display().to_string();

        if summary.aborted {
            warn!("run aborted before all work finished");
        } else if summary.has_terminal_failures() {
            warn!(
                failures = summary.report.terminal_failures.len(),
                "run finished with terminal failures"
            );
        } else {
            info!(reviews = summary.pool.reviews_stored, "run finished");
        }
        Ok(summary)
    }

    async fn write_reports(&self, summary: &RunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(reports_dir.join("summary.md"), render_markdown(summary))
            .await
            .context("writing summary.md")?;
        Ok(reports_dir)
    }
}

async fn watch_challenges(
    limiter: Arc<RateLimiter>,
    scheduler: Arc<TaskScheduler>,
    resolver: Arc<dyn ChallengeResolver>,
    scope: TaskScope,
    aborted: Arc<AtomicBool>,
) {
    let mut gate = limiter.subscribe();
    loop {
        let closed = gate.wait_for(|paused| *paused).await.is_err();
        if closed {
            return;
        }
        let budget = limiter.snapshot().await;
        let resolver = Arc::clone(&resolver);
        let resume = tokio::task::spawn_blocking(move || resolver.resolve(budget))
            .await
            .unwrap_or(false);
        if !resume {
            warn!("challenge not resolved; cancelling the rest of the run");
            aborted.store(true, AtomicOrdering::SeqCst);
            if let Err(err) = scheduler.cancel_scope(&scope).await {
                error!(error = %err, "cancelling after challenge failed");
            }
        }
        limiter.clear_challenge();
    }
}

async fn cancel_on_interrupt(
    limiter: Arc<RateLimiter>,
    scheduler: Arc<TaskScheduler>,
    scope: TaskScope,
    aborted: Arc<AtomicBool>,
) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("interrupt received; cancelling outstanding tasks");
    aborted.store(true, AtomicOrdering::SeqCst);
    if let Err(err) = scheduler.cancel_scope(&scope).await {
        error!(error = %err, "cancelling after interrupt failed");
    }
    limiter.clear_challenge();
}

pub fn render_markdown(summary: &RunSummary) -> String {
    let report = &summary.report;
    let mut out = String::new();
    let _ = writeln!(out, "# Hotel Review Sampler Run\n");
    let _ = writeln!(out, "- Run ID: `{}`", summary.run_id);
    let _ = writeln!(out, "- Scope: {}", summary.scope);
    let _ = writeln!(out, "- Started: {}", summary.started_at);
    let _ = writeln!(out, "- Finished: {}", summary.finished_at);
    let _ = writeln!(out, "- Tasks created: {}", summary.materialized);
    if summary.aborted {
        let _ = writeln!(out, "- Aborted: remaining work was cancelled");
    }
    let _ = writeln!(out, "- Hotels accepted: {}", report.hotels_accepted);
    let _ = writeln!(
        out,
        "- Reviews stored this run: {} ({} duplicates)",
        summary.pool.reviews_stored, summary.pool.duplicates
    );
    let _ = writeln!(
        out,
        "- Attempts: {} ({} failed, {} challenges)",
        summary.pool.attempts, summary.pool.failed, summary.pool.challenges
    );

    let _ = writeln!(out, "\n## Task Status\n");
    for (status, count) in &report.stats.by_status {
        let _ = writeln!(out, "- {status}: {count}");
    }

    if !report.cell_shortfalls.is_empty() {
        let _ = writeln!(out, "\n## Cells Under Quota\n");
        for shortfall in &report.cell_shortfalls {
            let _ = writeln!(
                out,
                "- {}: {}/{}",
                shortfall.cell, shortfall.accepted, shortfall.target
            );
        }
    }
    if !report.skipped_hotels.is_empty() {
        let _ = writeln!(out, "\n## Skipped (too few reviews)\n");
        for hotel in &report.skipped_hotels {
            let _ = writeln!(out, "- {} {} ({} reviews)", hotel.hotel_id, hotel.name, hotel.review_count);
        }
    }
    if !report.zero_yield_failures.is_empty() {
        let _ = writeln!(out, "\n## Hotels With No Reviews Because of Failures\n");
        for hotel_id in &report.zero_yield_failures {
            let _ = writeln!(out, "- {hotel_id}");
        }
    }
    if !report.terminal_failures.is_empty() {
        let _ = writeln!(out, "\n## Terminal Failures\n");
        for failed in &report.terminal_failures {
            let _ = writeln!(
                out,
                "- `{}` after {} retries: {}",
                failed.key,
                failed.retry_count,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{FailedTask, SkippedHotel};

    #[test]
    fn markdown_lists_failures_and_skips() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            scope: "region cbd".into(),
            hotels_only: false,
            materialized: 12,
            pool: PoolReport::default(),
            report: SchedulerReport {
                skipped_hotels: vec![SkippedHotel {
                    hotel_id: "50211877".into(),
                    name: "Lane Inn".into(),
                    review_count: 41,
                }],
                terminal_failures: vec![FailedTask {
                    task_id: Uuid::nil(),
                    key: "review:10019773:negative".into(),
                    retry_count: 3,
                    error: Some("http status 503".into()),
                }],
                ..Default::default()
            },
            reports_dir: String::new(),
            aborted: true,
        };
        let markdown = render_markdown(&summary);
        assert!(markdown.contains("- Scope: region cbd"));
        assert!(markdown.contains("50211877 Lane Inn (41 reviews)"));
        assert!(markdown.contains("`review:10019773:negative` after 3 retries: http status 503"));
        assert!(!markdown.contains("Cells Under Quota"));
        assert!(markdown.contains("- Aborted: remaining work was cancelled"));
        assert!(summary.has_terminal_failures());
        assert!(!summary.is_success());
    }
}
