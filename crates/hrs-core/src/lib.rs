//! Core domain model for the hotel review sampler: stratification cells,
//! review pools, candidates, and the task record state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hrs-core";

/// Fixed four-way price split used by every region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceTier {
    Economy,
    Comfort,
    Premium,
    Luxury,
}

impl PriceTier {
    /// Declared order; the allocator breaks rounding ties in this order.
    pub const ALL: [PriceTier; 4] = [
        PriceTier::Economy,
        PriceTier::Comfort,
        PriceTier::Premium,
        PriceTier::Luxury,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceTier::Economy => "economy",
            PriceTier::Comfort => "comfort",
            PriceTier::Premium => "premium",
            PriceTier::Luxury => "luxury",
        }
    }

    /// Nightly price band `[min, max)` used when searching the site; `None` is open-ended.
    pub fn price_band(&self) -> (u32, Option<u32>) {
        match self {
            PriceTier::Economy => (0, Some(300)),
            PriceTier::Comfort => (300, Some(600)),
            PriceTier::Premium => (600, Some(900)),
            PriceTier::Luxury => (900, None),
        }
    }

    /// Scheduling bonus added on top of the region priority.
    pub fn priority(&self) -> i32 {
        match self {
            PriceTier::Comfort => 4,
            PriceTier::Economy => 3,
            PriceTier::Premium => 2,
            PriceTier::Luxury => 1,
        }
    }
}

impl fmt::Display for PriceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (region, business zone, price tier) allocation bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StratificationCell {
    pub region: String,
    pub business_zone: String,
    pub price_tier: PriceTier,
}

impl StratificationCell {
    pub fn new(region: impl Into<String>, business_zone: impl Into<String>, price_tier: PriceTier) -> Self {
        Self {
            region: region.into(),
            business_zone: business_zone.into(),
            price_tier,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.region, self.business_zone, self.price_tier)
    }
}

impl fmt::Display for StratificationCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPool {
    Negative,
    Evidence,
    Latest,
}

impl ReviewPool {
    pub const WATERFALL_ORDER: [ReviewPool; 3] =
        [ReviewPool::Negative, ReviewPool::Evidence, ReviewPool::Latest];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewPool::Negative => "negative",
            ReviewPool::Evidence => "evidence",
            ReviewPool::Latest => "latest",
        }
    }

    /// Keeps waterfall order among the tasks of a single hotel.
    pub fn priority_offset(&self) -> i32 {
        match self {
            ReviewPool::Negative => 2,
            ReviewPool::Evidence => 1,
            ReviewPool::Latest => 0,
        }
    }
}

impl fmt::Display for ReviewPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-pool review counts shown by the site, when the list page exposes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolCounts {
    #[serde(default)]
    pub negative: Option<u32>,
    #[serde(default)]
    pub evidence: Option<u32>,
}

/// A hotel returned by a list fetch, before or after acceptance into the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotelCandidate {
    pub external_id: String,
    pub name: String,
    pub cell: StratificationCell,
    pub ranking_score: f64,
    pub review_count_hint: u32,
    #[serde(default)]
    pub rating: Option<f32>,
    #[serde(default)]
    pub pool_counts: PoolCounts,
}

/// Review as extracted by the fetch collaborator; `review_id` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReview {
    pub review_id: String,
    pub hotel_id: String,
    pub pool: ReviewPool,
    #[serde(default)]
    pub user_nick: Option<String>,
    pub content: String,
    #[serde(default)]
    pub overall_score: Option<f32>,
    #[serde(default)]
    pub room_type: Option<String>,
    #[serde(default)]
    pub review_date: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub reply: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    HotelList,
    Review,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::HotelList => "hotel_list",
            TaskType::Review => "review",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle.
///
/// ```text
/// pending ──claim──► running ──► completed
///    ▲                  │
///    └──── retry ─── failed
/// pending / running ──► cancelled
/// ```
///
/// `completed` and `cancelled` are terminal. A task that stays in `failed`
/// (not re-queued by the retry policy) is terminal as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(target, TaskStatus::Running | TaskStatus::Cancelled),
            TaskStatus::Running => matches!(
                target,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Failed => matches!(target, TaskStatus::Pending),
            TaskStatus::Completed | TaskStatus::Cancelled => false,
        }
    }

    /// Terminal regardless of retry policy.
    pub fn is_final(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTarget {
    Cell { cell: StratificationCell },
    Hotel { hotel_id: String, pool: ReviewPool },
}

impl TaskTarget {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskTarget::Cell { .. } => TaskType::HotelList,
            TaskTarget::Hotel { .. } => TaskType::Review,
        }
    }

    pub fn key(&self) -> TaskKey {
        match self {
            TaskTarget::Cell { cell } => TaskKey {
                task_type: TaskType::HotelList,
                target_key: cell.key(),
                pool_hint: None,
            },
            TaskTarget::Hotel { hotel_id, pool } => TaskKey {
                task_type: TaskType::Review,
                target_key: hotel_id.clone(),
                pool_hint: Some(*pool),
            },
        }
    }
}

/// Idempotency key: (type, target key, pool hint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub task_type: TaskType,
    pub target_key: String,
    pub pool_hint: Option<ReviewPool>,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pool_hint {
            Some(pool) => write!(f, "{}:{}:{}", self.task_type, self.target_key, pool),
            None => write!(f, "{}:{}", self.task_type, self.target_key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Persisted task record. Only the scheduler mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub seq: u64,
    pub task_type: TaskType,
    pub target: TaskTarget,
    pub status: TaskStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub error_message: Option<String>,
    /// Items requested: hotels for a cell, reviews for a pool.
    pub target_count: u32,
    pub items_fetched: u32,
    pub cursor: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a re-queued task may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(seq: u64, target: TaskTarget, priority: i32, target_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            task_type: target.task_type(),
            target,
            status: TaskStatus::Pending,
            priority,
            retry_count: 0,
            error_message: None,
            target_count,
            items_fetched: 0,
            cursor: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            not_before: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        self.target.key()
    }

    pub fn remaining(&self) -> u32 {
        self.target_count.saturating_sub(self.items_fetched)
    }

    pub fn transition_to(&mut self, target: TaskStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(target) {
            return Err(TransitionError {
                from: self.status,
                to: target,
            });
        }
        match target {
            TaskStatus::Running => {
                self.started_at = Some(now);
                self.not_before = None;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            TaskStatus::Pending => {
                self.completed_at = None;
            }
        }
        self.status = target;
        Ok(())
    }
}

/// How a worker classified a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Challenge,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Challenge => "challenge",
            ErrorClass::Permanent => "permanent",
        }
    }
}

/// Pagination progress reported for a review task attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewProgress {
    /// Newly stored reviews.
    pub fetched: u32,
    /// Reviews already known to persistence.
    pub duplicates: u32,
    pub cursor: Option<String>,
    /// The pool ran out of pages before the target was met.
    pub exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Audit log row written for every task transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub level: EventLevel,
    pub status: TaskStatus,
    pub message: String,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid review budget: per-hotel cap must be positive, got {max_per_hotel}")]
    InvalidBudget { max_per_hotel: u32 },
}
