//! Fixed-size pool of fetch workers.
//!
//! Workers claim one task at a time from the [`TaskScheduler`], fetch under the
//! shared [`RateLimiter`], store what they got and report back. They never
//! retry on their own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hrs_adapters::{FetchError, ReviewPage, SiteAdapter};
use hrs_core::{ErrorClass, HotelCandidate, ReviewPool, ReviewProgress, StratificationCell, TaskTarget};
use hrs_storage::{Persistence, RateLimiter};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::scheduler::{Claim, FailureReport, SchedulerError, TaskOutcome, TaskScheduler};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Upper bound on a single adapter call.
    pub attempt_timeout: Duration,
    pub max_pages_per_task: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            attempt_timeout: Duration::from_secs(30),
            max_pages_per_task: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub challenges: u64,
    pub pages_fetched: u64,
    pub reviews_stored: u64,
    pub duplicates: u64,
}

impl PoolReport {
    pub fn merge(&mut self, other: &PoolReport) {
        self.attempts += other.attempts;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.challenges += other.challenges;
        self.pages_fetched += other.pages_fetched;
        self.reviews_stored += other.reviews_stored;
        self.duplicates += other.duplicates;
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    scheduler: Arc<TaskScheduler>,
    adapter: Arc<dyn SiteAdapter>,
    store: Arc<dyn Persistence>,
    limiter: Arc<RateLimiter>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        scheduler: Arc<TaskScheduler>,
        adapter: Arc<dyn SiteAdapter>,
        store: Arc<dyn Persistence>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config: WorkerPoolConfig {
                workers: config.workers.max(1),
                max_pages_per_task: config.max_pages_per_task.max(1),
                ..config
            },
            scheduler,
            adapter,
            store,
            limiter,
        }
    }

    /// Runs until the scheduler has nothing left in scope.
    pub async fn run(&self) -> Result<PoolReport> {
        let mut join_set = JoinSet::new();
        for index in 0..self.config.workers {
            let worker = Worker {
                index,
                config: self.config,
                scheduler: Arc::clone(&self.scheduler),
                adapter: Arc::clone(&self.adapter),
                store: Arc::clone(&self.store),
                limiter: Arc::clone(&self.limiter),
            };
            join_set.spawn(async move { worker.run().await });
        }
        info!(workers = self.config.workers, site = self.adapter.site_id(), "worker pool started");

        let mut report = PoolReport::default();
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined
                .map_err(|err| anyhow!("worker task panicked: {err}"))
                .and_then(|result| result.context("worker stopped on a scheduler error"));
            match outcome {
                Ok(worker_report) => report.merge(&worker_report),
                Err(err) => {
                    // Survivors would wait forever on a task nobody reports.
                    join_set.abort_all();
                    return Err(err);
                }
            }
        }
        info!(
            attempts = report.attempts,
            failed = report.failed,
            reviews = report.reviews_stored,
            "worker pool drained"
        );
        Ok(report)
    }
}

struct Worker {
    index: usize,
    config: WorkerPoolConfig,
    scheduler: Arc<TaskScheduler>,
    adapter: Arc<dyn SiteAdapter>,
    store: Arc<dyn Persistence>,
    limiter: Arc<RateLimiter>,
}

impl Worker {
    async fn run(self) -> Result<PoolReport, SchedulerError> {
        let mut report = PoolReport::default();
        loop {
            self.limiter.wait_until_clear().await;
            let Some(claim) = self.scheduler.claim().await? else {
                break;
            };
            let span = info_span!(
                "fetch",
                worker = self.index,
                task_id = %claim.id,
                key = %claim.key,
                retry = claim.retry_count
            );
            self.process(claim, &mut report).instrument(span).await?;
        }
        debug!(worker = self.index, "no work left; worker exiting");
        Ok(report)
    }

    async fn process(&self, claim: Claim, report: &mut PoolReport) -> Result<(), SchedulerError> {
        report.attempts += 1;
        let result = match &claim.target {
            TaskTarget::Cell { cell } => self
                .fetch_candidates(cell)
                .await
                .map(TaskOutcome::HotelList)
                .map_err(|err| (err, None)),
            TaskTarget::Hotel { hotel_id, pool } => {
                let (progress, result) = self.collect_reviews(&claim, hotel_id, *pool, report).await;
                match result {
                    Ok(()) => Ok(TaskOutcome::Reviews(progress)),
                    Err(err) => Err((err, Some(progress))),
                }
            }
        };

        let (err, progress) = match result {
            Ok(outcome) => {
                report.succeeded += 1;
                return self.scheduler.report_success(claim.id, outcome).await;
            }
            Err(failure) => failure,
        };
        report.failed += 1;
        if err.class() == ErrorClass::Challenge {
            report.challenges += 1;
            self.limiter.raise_challenge().await;
        }
        warn!(class = err.class().as_str(), error = %err, "attempt failed");
        self.scheduler
            .report_failure(
                claim.id,
                FailureReport {
                    class: err.class(),
                    message: err.to_string(),
                    progress,
                },
            )
            .await
    }

    async fn fetch_candidates(&self, cell: &StratificationCell) -> Result<Vec<HotelCandidate>, FetchError> {
        self.limiter.acquire().await;
        let hotels = tokio::time::timeout(self.config.attempt_timeout, self.adapter.fetch_hotel_candidates(cell))
            .await
            .map_err(|_| FetchError::Transient(format!("hotel list {cell} timed out")))??;
        self.limiter.record_success().await;
        debug!(%cell, candidates = hotels.len(), "hotel list fetched");
        Ok(hotels)
    }

    async fn fetch_page(&self, hotel_id: &str, pool: ReviewPool, cursor: Option<&str>) -> Result<ReviewPage, FetchError> {
        self.limiter.acquire().await;
        let page = tokio::time::timeout(
            self.config.attempt_timeout,
            self.adapter.fetch_review_page(hotel_id, pool, cursor),
        )
        .await
        .map_err(|_| FetchError::Transient(format!("reviews {hotel_id}/{pool} timed out")))??;
        self.limiter.record_success().await;
        Ok(page)
    }

    /// Paginates until the pool's remaining quota is stored, the pool runs out
    /// of pages, or the page budget is spent. Progress survives a failure.
    async fn collect_reviews(
        &self,
        claim: &Claim,
        hotel_id: &str,
        pool: ReviewPool,
        report: &mut PoolReport,
    ) -> (ReviewProgress, Result<(), FetchError>) {
        let mut progress = ReviewProgress {
            cursor: claim.cursor.clone(),
            ..Default::default()
        };
        let mut pages = 0;
        while progress.fetched < claim.remaining && pages < self.config.max_pages_per_task {
            if pages > 0 && self.scheduler.is_cancel_requested(claim.id).await {
                debug!("cancellation requested; stopping pagination");
                break;
            }
            let page = match self.fetch_page(hotel_id, pool, progress.cursor.as_deref()).await {
                Ok(page) => page,
                Err(err) => return (progress, Err(err)),
            };
            pages += 1;
            report.pages_fetched += 1;

            // Store no more than the task still needs.
            let mut rest = page.reviews.as_slice();
            while !rest.is_empty() && progress.fetched < claim.remaining {
                let need = (claim.remaining - progress.fetched) as usize;
                let (chunk, tail) = rest.split_at(need.min(rest.len()));
                match self.store.upsert_reviews(chunk).await {
                    Ok(outcome) => {
                        progress.fetched += outcome.inserted as u32;
                        progress.duplicates += outcome.duplicates as u32;
                        report.reviews_stored += outcome.inserted as u64;
                        report.duplicates += outcome.duplicates as u64;
                    }
                    Err(err) => return (progress, Err(FetchError::Transient(format!("storing reviews: {err}")))),
                }
                rest = tail;
            }
            if !rest.is_empty() {
                // Quota met mid-page; a resume starts from this page again.
                break;
            }

            let next = page
                .next_cursor
                .filter(|next| page.has_more && Some(next.as_str()) != progress.cursor.as_deref());
            match next {
                Some(next) if !page.reviews.is_empty() => progress.cursor = Some(next),
                _ => {
                    progress.exhausted = true;
                    break;
                }
            }
        }
        if progress.fetched < claim.remaining && !progress.exhausted {
            debug!(
                fetched = progress.fetched,
                remaining = claim.remaining,
                pages,
                "page budget or cancellation ended pagination early"
            );
        }
        (progress, Ok(()))
    }
}
