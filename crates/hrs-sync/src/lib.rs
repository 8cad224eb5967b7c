//! Acquisition policy engine: quota allocation, the per-hotel review
//! waterfall, the task scheduler, and the worker pool that drains it.

pub mod config;
pub mod pipeline;
pub mod pool;
pub mod quota;
pub mod scheduler;
pub mod waterfall;

pub use config::{load_taxonomy_file, SamplerConfig, TAXONOMY_FILE};
pub use pipeline::{
    render_markdown, AbortOnChallenge, ChallengeResolver, CheckReport, HotelSelection, RunSummary, SamplingPipeline,
};
pub use pool::{PoolReport, WorkerPool, WorkerPoolConfig};
pub use quota::{allocate, CellQuota, QuotaPlan, RegionSpec, Taxonomy, TierWeights, ZoneSpec};
pub use scheduler::{
    CancelCounts, CancelOutcome, Claim, FailureReport, SchedulerConfig, SchedulerError, SchedulerReport, TaskOutcome,
    TaskScheduler, TaskScope, TaskStats,
};
pub use waterfall::{ReviewDecision, SubQuota, WaterfallPolicy};

pub const CRATE_NAME: &str = "hrs-sync";

/// Pipeline over the file store, configured from the environment.
pub async fn pipeline_from_env() -> anyhow::Result<SamplingPipeline> {
    SamplingPipeline::open(SamplerConfig::from_env()).await
}
