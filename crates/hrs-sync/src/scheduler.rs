//! Single-writer task coordinator.
//!
//! Every task mutation goes through the one `Mutex<SchedulerState>`; workers
//! only receive [`Claim`]s and hand back outcomes. Each transition is saved and
//! recorded as a [`TaskEvent`] before the lock is released.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use hrs_core::{
    ErrorClass, EventLevel, HotelCandidate, PolicyError, ReviewPool, ReviewProgress, StratificationCell, TaskEvent,
    TaskKey, TaskRecord, TaskStatus, TaskTarget, TransitionError,
};
use hrs_storage::{BackoffPolicy, Persistence, RetryDecision, StorageError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::quota::QuotaPlan;
use crate::waterfall::{ReviewDecision, WaterfallPolicy};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown task {0}")]
    UnknownTask(Uuid),
    #[error("task {id} is {status}, expected running")]
    NotRunning { id: Uuid, status: TaskStatus },
    #[error("outcome does not match the target of task {0}")]
    OutcomeMismatch(Uuid),
    #[error("hotel {0} is not in the catalog")]
    UnknownHotel(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Which tasks a run claims, reports on, or cancels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskScope {
    #[default]
    All,
    Region(String),
    Hotels(BTreeSet<String>),
}

impl TaskScope {
    pub fn describe(&self) -> String {
        match self {
            TaskScope::All => "all".to_string(),
            TaskScope::Region(region) => format!("region {region}"),
            TaskScope::Hotels(ids) => format!("hotels {}", ids.iter().cloned().collect::<Vec<_>>().join(",")),
        }
    }

    fn covers_hotel(&self, hotel: &HotelCandidate) -> bool {
        match self {
            TaskScope::All => true,
            TaskScope::Region(region) => hotel.cell.region == *region,
            TaskScope::Hotels(ids) => ids.contains(&hotel.external_id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub backoff: BackoffPolicy,
    pub waterfall: WaterfallPolicy,
    /// Emit review tasks as soon as a cell's hotels are accepted.
    pub materialize_reviews: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            waterfall: WaterfallPolicy::default(),
            materialize_reviews: true,
        }
    }
}

/// A task handed to exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub id: Uuid,
    pub key: TaskKey,
    pub target: TaskTarget,
    /// Hotels still needed for the cell, or reviews still needed for the pool.
    pub remaining: u32,
    pub cursor: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    HotelList(Vec<HotelCandidate>),
    Reviews(ReviewProgress),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub class: ErrorClass,
    pub message: String,
    /// Pages committed before the failure, for review tasks.
    pub progress: Option<ReviewProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The task is running; it will be cancelled when its worker reports.
    Requested,
    AlreadyFinal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelCounts {
    pub cancelled: usize,
    pub requested: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub tasks: usize,
    pub interrupted: usize,
    pub hotels: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, BTreeMap<String, usize>>,
}

impl TaskStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut stats = Self::default();
        for task in records {
            stats.add(task);
        }
        stats
    }

    fn add(&mut self, task: &TaskRecord) {
        self.total += 1;
        *self.by_status.entry(task.status.to_string()).or_default() += 1;
        *self
            .by_type
            .entry(task.task_type.to_string())
            .or_default()
            .entry(task.status.to_string())
            .or_default() += 1;
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellShortfall {
    pub cell: String,
    pub target: u32,
    pub accepted: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedHotel {
    pub hotel_id: String,
    pub name: String,
    pub review_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub task_id: Uuid,
    pub key: String,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Outcome of the tasks in scope, counting only the current record per key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub stats: TaskStats,
    pub hotels_accepted: usize,
    pub reviews_fetched: u64,
    pub cell_shortfalls: Vec<CellShortfall>,
    /// Hotels the circuit breaker kept out of review collection.
    pub skipped_hotels: Vec<SkippedHotel>,
    /// Hotels with review work that ended with nothing because tasks failed.
    pub zero_yield_failures: Vec<String>,
    pub terminal_failures: Vec<FailedTask>,
}

impl SchedulerReport {
    pub fn has_terminal_failures(&self) -> bool {
        !self.terminal_failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    next_seq: u64,
    tasks: HashMap<Uuid, TaskRecord>,
    /// Records per key in creation order; the last one is current.
    by_key: HashMap<TaskKey, Vec<Uuid>>,
    /// Backoff deadlines for re-queued tasks.
    ready_at: HashMap<Uuid, Instant>,
    hotels: HashMap<String, HotelCandidate>,
    accepted_by_cell: HashMap<String, BTreeSet<String>>,
    scope: TaskScope,
}

impl SchedulerState {
    fn current(&self, key: &TaskKey) -> Option<&TaskRecord> {
        self.by_key
            .get(key)
            .and_then(|ids| ids.last())
            .and_then(|id| self.tasks.get(id))
    }

    /// A live or completed record makes a re-submission a no-op.
    fn blocks_resubmission(&self, key: &TaskKey) -> bool {
        self.by_key.get(key).is_some_and(|ids| {
            ids.iter().filter_map(|id| self.tasks.get(id)).any(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Running | TaskStatus::Completed
                )
            })
        })
    }

    fn in_scope(&self, scope: &TaskScope, task: &TaskRecord) -> bool {
        match (&task.target, scope) {
            (_, TaskScope::All) => true,
            (TaskTarget::Cell { cell }, TaskScope::Region(region)) => cell.region == *region,
            (TaskTarget::Cell { .. }, TaskScope::Hotels(_)) => false,
            (TaskTarget::Hotel { hotel_id, .. }, _) => self
                .hotels
                .get(hotel_id)
                .is_some_and(|hotel| scope.covers_hotel(hotel)),
        }
    }

    fn accepted_in(&self, cell: &StratificationCell) -> u32 {
        self.accepted_by_cell
            .get(&cell.key())
            .map_or(0, |ids| ids.len() as u32)
    }

    fn remaining_for(&self, task: &TaskRecord) -> u32 {
        match &task.target {
            TaskTarget::Cell { cell } => task.target_count.saturating_sub(self.accepted_in(cell)),
            TaskTarget::Hotel { .. } => task.remaining(),
        }
    }

    /// Reviews a hotel's other pools have stored or still hold a target for.
    fn committed_elsewhere(&self, hotel_id: &str, except: ReviewPool) -> u32 {
        ReviewPool::WATERFALL_ORDER
            .into_iter()
            .filter(|pool| *pool != except)
            .filter_map(|pool| {
                let key = TaskTarget::Hotel {
                    hotel_id: hotel_id.to_string(),
                    pool,
                }
                .key();
                self.current(&key)
            })
            .map(|task| match task.status {
                TaskStatus::Pending | TaskStatus::Running => task.target_count.max(task.items_fetched),
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => task.items_fetched,
            })
            .sum()
    }

    fn current_records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.by_key
            .values()
            .filter_map(|ids| ids.last())
            .filter_map(|id| self.tasks.get(id))
    }

    fn accept_hotel(&mut self, hotel: HotelCandidate) {
        self.accepted_by_cell
            .entry(hotel.cell.key())
            .or_default()
            .insert(hotel.external_id.clone());
        self.hotels.insert(hotel.external_id.clone(), hotel);
    }
}

fn claim_order(a: &TaskRecord, b: &TaskRecord) -> Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

fn rank_candidates(candidates: &mut [HotelCandidate]) {
    candidates.sort_by(|a, b| {
        b.ranking_score
            .partial_cmp(&a.ranking_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
}

pub struct TaskScheduler {
    store: Arc<dyn Persistence>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn Persistence>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.waterfall.validate()?;
        Ok(Self {
            store,
            config,
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    async fn commit(
        &self,
        record: &TaskRecord,
        level: EventLevel,
        message: &str,
        detail: serde_json::Value,
    ) -> Result<(), SchedulerError> {
        debug!(task_id = %record.id, key = %record.key(), status = %record.status, "{message}");
        self.store.save_task(record).await?;
        self.store
            .record_task_event(&TaskEvent {
                task_id: record.id,
                level,
                status: record.status,
                message: message.to_string(),
                detail,
                at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Load persisted tasks and hotels. Interrupted `running` tasks go back to
    /// `pending` through `failed` without charging a retry.
    pub async fn restore(&self) -> Result<RestoreReport, SchedulerError> {
        let mut tasks = self.store.load_tasks().await?;
        let hotels = self.store.load_hotels().await?;
        tasks.sort_by_key(|t| t.seq);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut report = RestoreReport {
            tasks: tasks.len(),
            hotels: hotels.len(),
            ..Default::default()
        };
        for hotel in hotels {
            state.accept_hotel(hotel);
        }
        let now = Utc::now();
        for task in tasks {
            state.next_seq = state.next_seq.max(task.seq + 1);
            if let Some(wait) = task
                .not_before
                .filter(|_| task.status == TaskStatus::Pending)
                .and_then(|at| (at - now).to_std().ok())
            {
                state.ready_at.insert(task.id, Instant::now() + wait);
            }
            state.by_key.entry(task.key()).or_default().push(task.id);
            state.tasks.insert(task.id, task);
        }

        let interrupted: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id)
            .collect();
        for id in interrupted {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            let now = Utc::now();
            task.transition_to(TaskStatus::Failed, now)?;
            task.error_message = Some("interrupted before completion".to_string());
            let failed = task.clone();
            task.transition_to(TaskStatus::Pending, now)?;
            task.cancel_requested = false;
            let requeued = task.clone();
            self.commit(&failed, EventLevel::Warning, "interrupted run", json!({})).await?;
            self.commit(&requeued, EventLevel::Info, "re-queued after restart", json!({}))
                .await?;
            report.interrupted += 1;
        }

        // A crash between a pool settling and `latest` being emitted.
        let hotel_ids: BTreeSet<String> = state
            .tasks
            .values()
            .filter_map(|t| match &t.target {
                TaskTarget::Hotel { hotel_id, .. } => Some(hotel_id.clone()),
                TaskTarget::Cell { .. } => None,
            })
            .collect();
        for hotel_id in hotel_ids {
            self.release_latest(state, &hotel_id).await?;
        }

        info!(
            tasks = report.tasks,
            interrupted = report.interrupted,
            hotels = report.hotels,
            "scheduler state restored"
        );
        Ok(report)
    }

    pub async fn set_scope(&self, scope: TaskScope) {
        self.state.lock().await.scope = scope;
        self.notify.notify_waiters();
    }

    async fn submit(
        &self,
        state: &mut SchedulerState,
        target: TaskTarget,
        priority: i32,
        target_count: u32,
        resume_from: Option<&TaskRecord>,
    ) -> Result<Option<Uuid>, SchedulerError> {
        let key = target.key();
        if state.blocks_resubmission(&key) {
            debug!(%key, "equivalent task exists; submission ignored");
            return Ok(None);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let mut record = TaskRecord::new(seq, target, priority, target_count, Utc::now());
        let mut detail = json!({
            "key": key.to_string(),
            "priority": priority,
            "target_count": target_count,
        });
        if let Some(previous) = resume_from {
            record.items_fetched = previous.items_fetched;
            record.cursor = previous.cursor.clone();
            detail["resubmitted_from"] = json!(previous.id);
        }
        self.commit(&record, EventLevel::Info, "task created", detail).await?;
        let id = record.id;
        state.by_key.entry(key).or_default().push(id);
        state.tasks.insert(id, record);
        self.notify.notify_waiters();
        Ok(Some(id))
    }

    /// One `hotel_list` task per non-empty cell. Safe to call repeatedly.
    pub async fn materialize_plan(&self, plan: &QuotaPlan) -> Result<usize, SchedulerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut created = 0;
        for quota in plan.cells.iter().filter(|q| q.target > 0) {
            let target = TaskTarget::Cell {
                cell: quota.cell.clone(),
            };
            if self
                .submit(state, target, quota.priority, quota.target, None)
                .await?
                .is_some()
            {
                created += 1;
            }
        }
        info!(cells = plan.cells.len(), created, "plan materialized");
        Ok(created)
    }

    /// Run the waterfall for a catalog hotel and emit its review tasks.
    pub async fn submit_hotel_reviews(&self, hotel_id: &str) -> Result<ReviewDecision, SchedulerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let hotel = state
            .hotels
            .get(hotel_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownHotel(hotel_id.to_string()))?;
        self.plan_reviews(state, &hotel).await
    }

    pub async fn known_hotels(&self) -> Vec<HotelCandidate> {
        let state = self.state.lock().await;
        let mut hotels: Vec<HotelCandidate> = state.hotels.values().cloned().collect();
        hotels.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        hotels
    }

    async fn plan_reviews(
        &self,
        state: &mut SchedulerState,
        hotel: &HotelCandidate,
    ) -> Result<ReviewDecision, SchedulerError> {
        let decision = self.config.waterfall.plan_hotel(hotel)?;
        match &decision {
            ReviewDecision::Skip {
                review_count,
                threshold,
            } => {
                info!(
                    hotel_id = %hotel.external_id,
                    review_count,
                    threshold,
                    "skipped by circuit breaker"
                );
            }
            ReviewDecision::Collect { sub_quotas } => {
                let base = WaterfallPolicy::hotel_priority(hotel);
                for quota in sub_quotas.iter().filter(|q| q.pool != ReviewPool::Latest) {
                    let target = TaskTarget::Hotel {
                        hotel_id: hotel.external_id.clone(),
                        pool: quota.pool,
                    };
                    let previous = state.current(&target.key()).cloned();
                    // Terminal failures are re-submitted only through `retry_failed`.
                    if previous.as_ref().is_some_and(|t| t.status == TaskStatus::Failed) {
                        continue;
                    }
                    let priority = base + quota.pool.priority_offset();
                    self.submit(state, target, priority, quota.target, previous.as_ref())
                        .await?;
                }
                self.release_latest(state, &hotel.external_id).await?;
            }
        }
        Ok(decision)
    }

    /// Review tasks for every hotel accepted into `cell`, best ranked first.
    /// Runs before the cell's `hotel_list` task is marked completed, so a
    /// crash in between replays it on restart.
    async fn plan_cell_reviews(
        &self,
        state: &mut SchedulerState,
        cell: &StratificationCell,
    ) -> Result<(), SchedulerError> {
        if !self.config.materialize_reviews {
            return Ok(());
        }
        let mut hotels: Vec<HotelCandidate> = state
            .accepted_by_cell
            .get(&cell.key())
            .into_iter()
            .flatten()
            .filter_map(|id| state.hotels.get(id))
            .cloned()
            .collect();
        rank_candidates(&mut hotels);
        for hotel in &hotels {
            self.plan_reviews(state, hotel).await?;
        }
        Ok(())
    }

    /// Emit the `latest` task once `negative` and `evidence` have settled.
    async fn release_latest(&self, state: &mut SchedulerState, hotel_id: &str) -> Result<(), SchedulerError> {
        let Some(hotel) = state.hotels.get(hotel_id).cloned() else {
            return Ok(());
        };
        let ReviewDecision::Collect { sub_quotas } = self.config.waterfall.plan_hotel(&hotel)? else {
            return Ok(());
        };
        let latest_target = TaskTarget::Hotel {
            hotel_id: hotel_id.to_string(),
            pool: ReviewPool::Latest,
        };
        if state.by_key.contains_key(&latest_target.key()) {
            return Ok(());
        }

        let mut fulfilled = [0u32; 2];
        for (slot, pool) in [ReviewPool::Negative, ReviewPool::Evidence].into_iter().enumerate() {
            if !sub_quotas.iter().any(|q| q.pool == pool) {
                continue;
            }
            let key = TaskTarget::Hotel {
                hotel_id: hotel_id.to_string(),
                pool,
            }
            .key();
            let Some(task) = state.current(&key) else {
                return Ok(());
            };
            match task.status {
                TaskStatus::Pending | TaskStatus::Running => return Ok(()),
                TaskStatus::Cancelled => {
                    debug!(hotel_id, %pool, "pool cancelled; waterfall stops");
                    return Ok(());
                }
                TaskStatus::Completed | TaskStatus::Failed => fulfilled[slot] = task.items_fetched,
            }
        }

        let target = self
            .config
            .waterfall
            .latest_target(fulfilled[0], fulfilled[1], hotel.review_count_hint);
        if target == 0 {
            debug!(hotel_id, "per-hotel budget used up before latest");
            return Ok(());
        }
        let priority = WaterfallPolicy::hotel_priority(&hotel) + ReviewPool::Latest.priority_offset();
        self.submit(state, latest_target, priority, target, None).await?;
        Ok(())
    }

    /// Next task by (priority desc, creation order). Waits while work is still
    /// pending or running; `None` once the scope is drained.
    pub async fn claim(&self) -> Result<Option<Claim>, SchedulerError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let now = Instant::now();
                let mut best: Option<&TaskRecord> = None;
                let mut earliest: Option<Instant> = None;
                let mut outstanding = false;
                for task in state.tasks.values() {
                    if !task.status.is_active() || !state.in_scope(&state.scope, task) {
                        continue;
                    }
                    outstanding = true;
                    if task.status != TaskStatus::Pending {
                        continue;
                    }
                    if let Some(at) = state.ready_at.get(&task.id).filter(|at| **at > now) {
                        earliest = Some(earliest.map_or(*at, |e| e.min(*at)));
                        continue;
                    }
                    if best.map_or(true, |b| claim_order(task, b) == Ordering::Less) {
                        best = Some(task);
                    }
                }

                if let Some(id) = best.map(|t| t.id) {
                    let remaining = state.tasks.get(&id).map_or(0, |t| state.remaining_for(t));
                    let Some(task) = state.tasks.get_mut(&id) else {
                        return Err(SchedulerError::UnknownTask(id));
                    };
                    task.transition_to(TaskStatus::Running, Utc::now())?;
                    state.ready_at.remove(&id);
                    let snapshot = task.clone();

                    if remaining == 0 {
                        // Quota already met, e.g. after a restart.
                        if let TaskTarget::Cell { cell } = &snapshot.target {
                            self.plan_cell_reviews(state, cell).await?;
                        }
                        let task = state.tasks.get_mut(&id).ok_or(SchedulerError::UnknownTask(id))?;
                        task.transition_to(TaskStatus::Completed, Utc::now())?;
                        let done = task.clone();
                        self.commit(&done, EventLevel::Info, "nothing left to fetch", json!({}))
                            .await?;
                        if let TaskTarget::Hotel { hotel_id, .. } = &done.target {
                            self.release_latest(state, hotel_id).await?;
                        }
                        continue;
                    }

                    self.commit(
                        &snapshot,
                        EventLevel::Info,
                        "claimed",
                        json!({ "retry_count": snapshot.retry_count, "remaining": remaining }),
                    )
                    .await?;
                    return Ok(Some(Claim {
                        id,
                        key: snapshot.key(),
                        target: snapshot.target.clone(),
                        remaining,
                        cursor: snapshot.cursor.clone(),
                        retry_count: snapshot.retry_count,
                    }));
                }

                if !outstanding {
                    return Ok(None);
                }
                earliest
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn running_task(state: &SchedulerState, id: Uuid) -> Result<TaskRecord, SchedulerError> {
        let task = state.tasks.get(&id).ok_or(SchedulerError::UnknownTask(id))?;
        if task.status != TaskStatus::Running {
            return Err(SchedulerError::NotRunning {
                id,
                status: task.status,
            });
        }
        Ok(task.clone())
    }

    fn apply_progress(task: &mut TaskRecord, progress: Option<&ReviewProgress>) {
        if let Some(progress) = progress {
            task.items_fetched += progress.fetched;
            if progress.cursor.is_some() {
                task.cursor = progress.cursor.clone();
            }
        }
    }

    async fn finish_cancelled(
        &self,
        state: &mut SchedulerState,
        mut task: TaskRecord,
        progress: Option<&ReviewProgress>,
    ) -> Result<(), SchedulerError> {
        // Reviews already stored stay stored; only follow-up work is dropped.
        Self::apply_progress(&mut task, progress);
        task.transition_to(TaskStatus::Cancelled, Utc::now())?;
        task.error_message = Some("cancelled while running".to_string());
        self.commit(
            &task,
            EventLevel::Warning,
            "cancelled; yield discarded",
            json!({ "items_fetched": task.items_fetched }),
        )
        .await?;
        state.tasks.insert(task.id, task);
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn report_success(&self, id: Uuid, outcome: TaskOutcome) -> Result<(), SchedulerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut task = Self::running_task(state, id)?;

        if task.cancel_requested {
            let progress = match &outcome {
                TaskOutcome::Reviews(progress) => Some(progress),
                TaskOutcome::HotelList(_) => None,
            };
            return self.finish_cancelled(state, task, progress).await;
        }

        match (outcome, task.target.clone()) {
            (TaskOutcome::HotelList(mut candidates), TaskTarget::Cell { cell }) => {
                let offered = candidates.len();
                rank_candidates(&mut candidates);
                let mut room = task.target_count.saturating_sub(state.accepted_in(&cell));
                let mut accepted = 0usize;
                for mut hotel in candidates {
                    if room == 0 {
                        break;
                    }
                    if state.hotels.contains_key(&hotel.external_id) {
                        debug!(hotel_id = %hotel.external_id, %cell, "hotel already accepted elsewhere");
                        continue;
                    }
                    hotel.cell = cell.clone();
                    self.store.upsert_hotel(&hotel).await?;
                    state.accept_hotel(hotel);
                    accepted += 1;
                    room -= 1;
                }

                // Hotels accepted by an interrupted earlier attempt are covered too.
                self.plan_cell_reviews(state, &cell).await?;
                task.items_fetched = state.accepted_in(&cell);
                task.transition_to(TaskStatus::Completed, Utc::now())?;
                let shortfall = task.target_count.saturating_sub(task.items_fetched);
                if shortfall > 0 {
                    warn!(%cell, target = task.target_count, accepted = task.items_fetched, "cell under quota");
                }
                self.commit(
                    &task,
                    EventLevel::Info,
                    "hotel list completed",
                    json!({ "offered": offered, "accepted": accepted, "shortfall": shortfall }),
                )
                .await?;
                state.tasks.insert(id, task);
            }
            (TaskOutcome::Reviews(progress), TaskTarget::Hotel { hotel_id, pool }) => {
                Self::apply_progress(&mut task, Some(&progress));
                task.transition_to(TaskStatus::Completed, Utc::now())?;
                let detail = json!({
                    "fetched": progress.fetched,
                    "duplicates": progress.duplicates,
                    "exhausted": progress.exhausted,
                    "shortfall": task.remaining(),
                });
                self.commit(&task, EventLevel::Info, "reviews completed", detail).await?;
                state.tasks.insert(id, task);
                if pool != ReviewPool::Latest {
                    self.release_latest(state, &hotel_id).await?;
                }
            }
            _ => return Err(SchedulerError::OutcomeMismatch(id)),
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// Apply the retry policy at the `failed -> pending` edge.
    pub async fn report_failure(&self, id: Uuid, report: FailureReport) -> Result<(), SchedulerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut task = Self::running_task(state, id)?;

        if task.cancel_requested {
            return self.finish_cancelled(state, task, report.progress.as_ref()).await;
        }

        let now = Utc::now();
        Self::apply_progress(&mut task, report.progress.as_ref());
        task.error_message = Some(report.message.clone());
        task.transition_to(TaskStatus::Failed, now)?;
        self.commit(
            &task,
            EventLevel::Warning,
            "attempt failed",
            json!({ "class": report.class.as_str(), "error": report.message, "retry_count": task.retry_count }),
        )
        .await?;

        match self.config.backoff.decide(report.class, task.retry_count) {
            RetryDecision::Retry { delay } => {
                task.retry_count += 1;
                task.transition_to(TaskStatus::Pending, now)?;
                task.not_before = TimeDelta::from_std(delay).ok().map(|d| now + d);
                state.ready_at.insert(id, Instant::now() + delay);
                self.commit(
                    &task,
                    EventLevel::Info,
                    "re-queued with backoff",
                    json!({ "retry_count": task.retry_count, "delay_ms": delay.as_millis() as u64 }),
                )
                .await?;
                state.tasks.insert(id, task);
            }
            RetryDecision::Requeue => {
                task.transition_to(TaskStatus::Pending, now)?;
                self.commit(
                    &task,
                    EventLevel::Warning,
                    "re-queued after challenge; retry not charged",
                    json!({ "retry_count": task.retry_count }),
                )
                .await?;
                state.tasks.insert(id, task);
            }
            RetryDecision::GiveUp => {
                warn!(task_id = %id, key = %task.key(), error = %report.message, "task failed terminally");
                self.commit(
                    &task,
                    EventLevel::Error,
                    "terminal failure",
                    json!({ "class": report.class.as_str(), "retry_count": task.retry_count }),
                )
                .await?;
                let target = task.target.clone();
                state.tasks.insert(id, task);
                if let TaskTarget::Hotel { hotel_id, pool } = target {
                    if pool != ReviewPool::Latest {
                        self.release_latest(state, &hotel_id).await?;
                    }
                }
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn cancel_locked(&self, state: &mut SchedulerState, id: Uuid) -> Result<CancelOutcome, SchedulerError> {
        let task = state.tasks.get_mut(&id).ok_or(SchedulerError::UnknownTask(id))?;
        match task.status {
            TaskStatus::Pending => {
                task.transition_to(TaskStatus::Cancelled, Utc::now())?;
                let snapshot = task.clone();
                state.ready_at.remove(&id);
                self.commit(&snapshot, EventLevel::Info, "cancelled", json!({})).await?;
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Running if !task.cancel_requested => {
                task.cancel_requested = true;
                let snapshot = task.clone();
                self.commit(&snapshot, EventLevel::Info, "cancellation requested", json!({}))
                    .await?;
                Ok(CancelOutcome::Requested)
            }
            TaskStatus::Running => Ok(CancelOutcome::Requested),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => Ok(CancelOutcome::AlreadyFinal),
        }
    }

    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, SchedulerError> {
        let mut guard = self.state.lock().await;
        let outcome = self.cancel_locked(&mut guard, id).await?;
        self.notify.notify_waiters();
        Ok(outcome)
    }

    /// Cancel every active task in `scope`.
    pub async fn cancel_scope(&self, scope: &TaskScope) -> Result<CancelCounts, SchedulerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let ids: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| t.status.is_active() && state.in_scope(scope, t))
            .map(|t| t.id)
            .collect();
        let mut counts = CancelCounts::default();
        for id in ids {
            match self.cancel_locked(state, id).await? {
                CancelOutcome::Cancelled => counts.cancelled += 1,
                CancelOutcome::Requested => counts.requested += 1,
                CancelOutcome::AlreadyFinal => {}
            }
        }
        self.notify.notify_waiters();
        info!(scope = %scope.describe(), cancelled = counts.cancelled, requested = counts.requested, "cancellation applied");
        Ok(counts)
    }

    /// Fresh task for every key in scope whose current record failed terminally.
    /// The failed record stays archived; progress and cursor carry over.
    pub async fn retry_failed(&self) -> Result<usize, SchedulerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let failed: Vec<TaskRecord> = state
            .current_records()
            .filter(|t| t.status == TaskStatus::Failed && state.in_scope(&state.scope, t))
            .cloned()
            .collect();
        let mut resubmitted = 0;
        for previous in failed {
            let mut target_count = previous.target_count;
            if let TaskTarget::Hotel { hotel_id, pool } = &previous.target {
                // `latest` may have been sized from what this pool had delivered.
                let budget = self
                    .config
                    .waterfall
                    .max_per_hotel
                    .saturating_sub(state.committed_elsewhere(hotel_id, *pool));
                target_count = target_count.min(budget);
                if target_count <= previous.items_fetched {
                    info!(key = %previous.key(), "per-hotel budget used up; not re-submitted");
                    continue;
                }
            }
            if self
                .submit(state, previous.target.clone(), previous.priority, target_count, Some(&previous))
                .await?
                .is_some()
            {
                resubmitted += 1;
            }
        }
        info!(resubmitted, "terminal failures re-submitted");
        Ok(resubmitted)
    }

    /// Counts over every record, archived ones included.
    pub async fn stats(&self) -> TaskStats {
        let state = self.state.lock().await;
        TaskStats::from_records(state.tasks.values())
    }

    pub async fn task(&self, id: Uuid) -> Option<TaskRecord> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    /// Lets a worker stop paginating early once its task was cancelled.
    pub async fn is_cancel_requested(&self, id: Uuid) -> bool {
        self.state
            .lock()
            .await
            .tasks
            .get(&id)
            .is_some_and(|t| t.cancel_requested)
    }

    pub async fn current_task(&self, key: &TaskKey) -> Option<TaskRecord> {
        self.state.lock().await.current(key).cloned()
    }

    pub async fn report(&self) -> Result<SchedulerReport, SchedulerError> {
        let state = self.state.lock().await;
        let scope = &state.scope;
        let mut report = SchedulerReport::default();

        let mut current: Vec<&TaskRecord> = state
            .current_records()
            .filter(|t| state.in_scope(scope, t))
            .collect();
        current.sort_by_key(|t| t.seq);

        let mut review_yield: BTreeMap<&str, (u32, bool)> = BTreeMap::new();
        for task in &current {
            report.stats.add(task);
            match &task.target {
                TaskTarget::Cell { cell } => {
                    let accepted = state.accepted_in(cell);
                    if task.status == TaskStatus::Completed && accepted < task.target_count {
                        report.cell_shortfalls.push(CellShortfall {
                            cell: cell.key(),
                            target: task.target_count,
                            accepted,
                        });
                    }
                }
                TaskTarget::Hotel { hotel_id, .. } => {
                    report.reviews_fetched += u64::from(task.items_fetched);
                    let entry = review_yield.entry(hotel_id.as_str()).or_default();
                    entry.0 += task.items_fetched;
                    entry.1 |= task.status == TaskStatus::Failed;
                }
            }
            if task.status == TaskStatus::Failed {
                report.terminal_failures.push(FailedTask {
                    task_id: task.id,
                    key: task.key().to_string(),
                    retry_count: task.retry_count,
                    error: task.error_message.clone(),
                });
            }
        }
        report.zero_yield_failures = review_yield
            .into_iter()
            .filter(|(_, (fetched, failed))| *fetched == 0 && *failed)
            .map(|(hotel_id, _)| hotel_id.to_string())
            .collect();

        let mut hotels: Vec<&HotelCandidate> = state.hotels.values().filter(|h| scope.covers_hotel(h)).collect();
        hotels.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        report.hotels_accepted = hotels.len();
        for hotel in hotels {
            if let ReviewDecision::Skip { review_count, .. } = self.config.waterfall.plan_hotel(hotel)? {
                report.skipped_hotels.push(SkippedHotel {
                    hotel_id: hotel.external_id.clone(),
                    name: hotel.name.clone(),
                    review_count,
                });
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hrs_core::{PoolCounts, PriceTier};
    use hrs_storage::MemoryStore;

    use crate::quota::{allocate, CellQuota, Taxonomy};

    fn config(max_retries: u32) -> SchedulerConfig {
        SchedulerConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_secs(1),
                multiplier: 2,
                max_delay: Duration::from_secs(8),
            },
            ..Default::default()
        }
    }

    fn scheduler(store: &Arc<MemoryStore>, config: SchedulerConfig) -> TaskScheduler {
        TaskScheduler::new(store.clone(), config).unwrap()
    }

    fn cell(tier: PriceTier) -> StratificationCell {
        StratificationCell::new("cbd", "39584", tier)
    }

    fn plan_of(cells: &[(StratificationCell, u32, i32)]) -> QuotaPlan {
        QuotaPlan {
            total: cells.iter().map(|c| c.1).sum(),
            cells: cells
                .iter()
                .map(|(cell, target, priority)| CellQuota {
                    cell: cell.clone(),
                    target: *target,
                    priority: *priority,
                })
                .collect(),
        }
    }

    fn hotel(id: &str, score: f64, hint: u32) -> HotelCandidate {
        HotelCandidate {
            external_id: id.to_string(),
            name: format!("Hotel {id}"),
            cell: cell(PriceTier::Comfort),
            ranking_score: score,
            review_count_hint: hint,
            rating: Some(4.2),
            pool_counts: PoolCounts::default(),
        }
    }

    fn transient() -> FailureReport {
        FailureReport {
            class: ErrorClass::Transient,
            message: "connection reset".into(),
            progress: None,
        }
    }

    async fn claim_now(scheduler: &TaskScheduler) -> Claim {
        tokio::time::timeout(Duration::from_secs(60), scheduler.claim())
            .await
            .expect("claim timed out")
            .unwrap()
            .expect("queue drained")
    }

    #[tokio::test]
    async fn materializing_twice_creates_no_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        let plan = allocate(&Taxonomy::builtin()).unwrap();
        let first = scheduler.materialize_plan(&plan).await.unwrap();
        let second = scheduler.materialize_plan(&plan).await.unwrap();
        assert_eq!(first, 72);
        assert_eq!(second, 0);
        assert_eq!(scheduler.stats().await.total, 72);
    }

    #[tokio::test]
    async fn claims_follow_priority_then_creation_order() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        let plan = plan_of(&[
            (cell(PriceTier::Luxury), 2, 11),
            (cell(PriceTier::Comfort), 6, 14),
            (cell(PriceTier::Economy), 4, 13),
            (cell(PriceTier::Premium), 3, 14),
        ]);
        scheduler.materialize_plan(&plan).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            let claim = claim_now(&scheduler).await;
            let TaskTarget::Cell { cell } = &claim.target else { panic!() };
            order.push(cell.price_tier);
        }
        assert_eq!(
            order,
            vec![PriceTier::Comfort, PriceTier::Premium, PriceTier::Economy, PriceTier::Luxury]
        );
    }

    #[tokio::test]
    async fn accepted_hotels_respect_quota_and_emit_waterfall() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 2, 14)]))
            .await
            .unwrap();
        let claim = claim_now(&scheduler).await;
        assert_eq!(claim.remaining, 2);

        let candidates = vec![hotel("b", 5.0, 30), hotel("a", 9.0, 600), hotel("c", 9.0, 500)];
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(candidates))
            .await
            .unwrap();

        let accepted: Vec<String> = scheduler.known_hotels().await.into_iter().map(|h| h.external_id).collect();
        assert_eq!(accepted, vec!["a", "c"]);

        let stats = scheduler.stats().await;
        // two hotels x (negative, evidence); latest waits for both
        assert_eq!(stats.by_type["review"]["pending"], 4);
        let latest = TaskTarget::Hotel {
            hotel_id: "a".into(),
            pool: ReviewPool::Latest,
        };
        assert!(scheduler.current_task(&latest.key()).await.is_none());
    }

    #[tokio::test]
    async fn latest_is_sized_from_fulfilled_pools() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();
        let claim = claim_now(&scheduler).await;
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(vec![hotel("a", 1.0, 2000)]))
            .await
            .unwrap();

        for (pool, fetched) in [(ReviewPool::Negative, 40), (ReviewPool::Evidence, 150)] {
            let claim = claim_now(&scheduler).await;
            assert_eq!(claim.key.pool_hint, Some(pool));
            scheduler
                .report_success(
                    claim.id,
                    TaskOutcome::Reviews(ReviewProgress {
                        fetched,
                        exhausted: pool == ReviewPool::Negative,
                        ..Default::default()
                    }),
                )
                .await
                .unwrap();
        }

        let claim = claim_now(&scheduler).await;
        assert_eq!(claim.key.pool_hint, Some(ReviewPool::Latest));
        assert_eq!(claim.remaining, 110);
    }

    #[tokio::test]
    async fn cancelled_pool_stops_the_waterfall() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();
        let claim = claim_now(&scheduler).await;
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(vec![hotel("a", 1.0, 2000)]))
            .await
            .unwrap();

        let negative = claim_now(&scheduler).await;
        assert_eq!(scheduler.cancel(negative.id).await.unwrap(), CancelOutcome::Requested);
        let evidence = claim_now(&scheduler).await;
        scheduler
            .report_success(evidence.id, TaskOutcome::Reviews(ReviewProgress { fetched: 10, ..Default::default() }))
            .await
            .unwrap();
        scheduler
            .report_success(negative.id, TaskOutcome::Reviews(ReviewProgress { fetched: 7, ..Default::default() }))
            .await
            .unwrap();

        let record = scheduler.task(negative.id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_eq!(record.items_fetched, 7);
        assert_eq!(scheduler.claim().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_budget_then_stop() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(2));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();

        let mut failures = 0;
        let start = Instant::now();
        while let Some(claim) = scheduler.claim().await.unwrap() {
            failures += 1;
            scheduler.report_failure(claim.id, transient()).await.unwrap();
        }
        assert_eq!(failures, 3);
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));

        let report = scheduler.report().await.unwrap();
        assert_eq!(report.terminal_failures.len(), 1);
        assert_eq!(report.terminal_failures[0].retry_count, 2);
        let events = store.events().await;
        assert_eq!(events.iter().filter(|e| e.status == TaskStatus::Failed).count(), 4);
    }

    #[tokio::test]
    async fn challenges_and_permanent_errors() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(1));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();

        for _ in 0..5 {
            let claim = claim_now(&scheduler).await;
            scheduler
                .report_failure(
                    claim.id,
                    FailureReport {
                        class: ErrorClass::Challenge,
                        message: "slider captcha".into(),
                        progress: None,
                    },
                )
                .await
                .unwrap();
        }
        let claim = claim_now(&scheduler).await;
        assert_eq!(claim.retry_count, 0);

        scheduler
            .report_failure(
                claim.id,
                FailureReport {
                    class: ErrorClass::Permanent,
                    message: "404".into(),
                    progress: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(scheduler.claim().await.unwrap(), None);
        assert_eq!(scheduler.task(claim.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn pending_cancel_is_immediate_and_final() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();
        let counts = scheduler
            .cancel_scope(&TaskScope::Region("cbd".into()))
            .await
            .unwrap();
        assert_eq!(counts.cancelled, 1);
        assert_eq!(scheduler.claim().await.unwrap(), None);
        assert_eq!(scheduler.stats().await.count(TaskStatus::Cancelled), 1);
    }

    #[tokio::test]
    async fn report_rejects_unknown_and_idle_tasks() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        let err = scheduler
            .report_success(Uuid::new_v4(), TaskOutcome::HotelList(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTask(_)));

        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();
        let claim = claim_now(&scheduler).await;
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(Vec::new()))
            .await
            .unwrap();
        let err = scheduler.report_failure(claim.id, transient()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn restore_requeues_interrupted_work_without_charge() {
        let store = Arc::new(MemoryStore::new());
        let first = scheduler(&store, config(3));
        first
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 2, 14), (cell(PriceTier::Economy), 1, 13)]))
            .await
            .unwrap();
        let claim = claim_now(&first).await;
        first
            .report_success(claim.id, TaskOutcome::HotelList(vec![hotel("a", 1.0, 20)]))
            .await
            .unwrap();
        let interrupted = claim_now(&first).await;
        drop(first);

        let second = scheduler(&store, config(3));
        let restored = second.restore().await.unwrap();
        assert_eq!(restored.interrupted, 1);
        assert_eq!(restored.hotels, 1);

        let task = second.task(interrupted.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);

        let plan = plan_of(&[(cell(PriceTier::Comfort), 2, 14), (cell(PriceTier::Economy), 1, 13)]);
        assert_eq!(second.materialize_plan(&plan).await.unwrap(), 0);

        let report = second.report().await.unwrap();
        assert_eq!(report.skipped_hotels.len(), 1);
        assert_eq!(report.cell_shortfalls[0].accepted, 1);
    }

    #[tokio::test]
    async fn retry_failed_resubmits_with_progress() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(0));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();
        let claim = claim_now(&scheduler).await;
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(vec![hotel("a", 1.0, 60)]))
            .await
            .unwrap();

        // negative: fails after 20 reviews and a cursor
        let negative = claim_now(&scheduler).await;
        scheduler
            .report_failure(
                negative.id,
                FailureReport {
                    class: ErrorClass::Transient,
                    message: "timeout".into(),
                    progress: Some(ReviewProgress {
                        fetched: 20,
                        cursor: Some("3".into()),
                        ..Default::default()
                    }),
                },
            )
            .await
            .unwrap();

        assert_eq!(scheduler.retry_failed().await.unwrap(), 1);
        let retried = claim_now(&scheduler).await;
        assert_ne!(retried.id, negative.id);
        assert_eq!(retried.cursor.as_deref(), Some("3"));
        assert_eq!(retried.remaining, 40);
        assert_eq!(scheduler.task(negative.id).await.unwrap().status, TaskStatus::Failed);
    }

    async fn finish_reviews(scheduler: &TaskScheduler, pool: ReviewPool, fetched: u32) {
        let claim = claim_now(scheduler).await;
        assert_eq!(claim.key.pool_hint, Some(pool));
        scheduler
            .report_success(
                claim.id,
                TaskOutcome::Reviews(ReviewProgress {
                    fetched,
                    exhausted: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retried_pool_stays_within_the_hotel_budget() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(0));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();
        let claim = claim_now(&scheduler).await;
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(vec![hotel("a", 1.0, 2000)]))
            .await
            .unwrap();

        let negative = claim_now(&scheduler).await;
        assert_eq!(negative.key.pool_hint, Some(ReviewPool::Negative));
        scheduler
            .report_failure(
                negative.id,
                FailureReport {
                    class: ErrorClass::Permanent,
                    message: "404".into(),
                    progress: None,
                },
            )
            .await
            .unwrap();
        finish_reviews(&scheduler, ReviewPool::Evidence, 150).await;
        // latest was sized as 300 - 0 - 150 but the pool ran dry at 120
        finish_reviews(&scheduler, ReviewPool::Latest, 120).await;

        assert_eq!(scheduler.retry_failed().await.unwrap(), 1);
        let retried = claim_now(&scheduler).await;
        assert_eq!(retried.key.pool_hint, Some(ReviewPool::Negative));
        assert_eq!(retried.remaining, 30);
        scheduler
            .report_success(
                retried.id,
                TaskOutcome::Reviews(ReviewProgress {
                    fetched: 30,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(scheduler.claim().await.unwrap(), None);
        assert_eq!(scheduler.report().await.unwrap().reviews_fetched, 300);
    }

    #[tokio::test]
    async fn retry_skips_pools_with_no_budget_left() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(0));
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14)]))
            .await
            .unwrap();
        let claim = claim_now(&scheduler).await;
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(vec![hotel("a", 1.0, 2000)]))
            .await
            .unwrap();
        let negative = claim_now(&scheduler).await;
        scheduler
            .report_failure(
                negative.id,
                FailureReport {
                    class: ErrorClass::Permanent,
                    message: "404".into(),
                    progress: None,
                },
            )
            .await
            .unwrap();
        finish_reviews(&scheduler, ReviewPool::Evidence, 150).await;
        finish_reviews(&scheduler, ReviewPool::Latest, 150).await;

        assert_eq!(scheduler.retry_failed().await.unwrap(), 0);
        assert_eq!(scheduler.claim().await.unwrap(), None);
        let negative_key = TaskTarget::Hotel {
            hotel_id: "a".into(),
            pool: ReviewPool::Negative,
        }
        .key();
        assert_eq!(scheduler.current_task(&negative_key).await.unwrap().id, negative.id);
    }

    #[tokio::test]
    async fn interrupted_hotel_list_still_emits_review_tasks() {
        let store = Arc::new(MemoryStore::new());
        let mut list = TaskRecord::new(0, TaskTarget::Cell { cell: cell(PriceTier::Comfort) }, 14, 1, Utc::now());
        list.transition_to(TaskStatus::Running, Utc::now()).unwrap();
        store.save_task(&list).await.unwrap();
        // accepted and stored, then the process died before the list completed
        store.upsert_hotel(&hotel("a", 1.0, 500)).await.unwrap();

        let scheduler = scheduler(&store, config(3));
        assert_eq!(scheduler.restore().await.unwrap().interrupted, 1);
        let plan = plan_of(&[(cell(PriceTier::Comfort), 1, 14)]);
        assert_eq!(scheduler.materialize_plan(&plan).await.unwrap(), 0);

        let claim = claim_now(&scheduler).await;
        assert_eq!(claim.key.pool_hint, Some(ReviewPool::Negative));
        assert_eq!(scheduler.task(list.id).await.unwrap().status, TaskStatus::Completed);
        let stats = scheduler.stats().await;
        assert_eq!(stats.by_type["review"]["running"], 1);
        assert_eq!(stats.by_type["review"]["pending"], 1);
    }

    #[tokio::test]
    async fn partial_hotel_list_retry_covers_earlier_hotels() {
        let store = Arc::new(MemoryStore::new());
        let mut list = TaskRecord::new(0, TaskTarget::Cell { cell: cell(PriceTier::Comfort) }, 14, 2, Utc::now());
        list.transition_to(TaskStatus::Running, Utc::now()).unwrap();
        store.save_task(&list).await.unwrap();
        store.upsert_hotel(&hotel("a", 9.0, 500)).await.unwrap();

        let scheduler = scheduler(&store, config(3));
        scheduler.restore().await.unwrap();
        let claim = claim_now(&scheduler).await;
        assert_eq!(claim.remaining, 1);
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(vec![hotel("b", 5.0, 500)]))
            .await
            .unwrap();

        let stats = scheduler.stats().await;
        assert_eq!(stats.by_type["review"]["pending"], 4);
    }

    #[tokio::test]
    async fn scope_limits_claims() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(&store, config(3));
        let other = StratificationCell::new("old-town", "39580", PriceTier::Economy);
        scheduler
            .materialize_plan(&plan_of(&[(cell(PriceTier::Comfort), 1, 14), (other.clone(), 1, 12)]))
            .await
            .unwrap();
        scheduler.set_scope(TaskScope::Region("old-town".into())).await;
        let claim = claim_now(&scheduler).await;
        assert_eq!(claim.target, TaskTarget::Cell { cell: other });
        scheduler
            .report_success(claim.id, TaskOutcome::HotelList(Vec::new()))
            .await
            .unwrap();
        assert_eq!(scheduler.claim().await.unwrap(), None);
    }
}
