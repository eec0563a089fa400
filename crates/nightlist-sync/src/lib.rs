//! Run orchestration: render, extract, normalize, deduplicate and persist one listing page.

pub mod config;
pub mod dedup;
pub mod lock;
pub mod normalize;
pub mod pipeline;
pub mod summary;

use anyhow::Result;

pub use config::{DayPolicy, RenderMode, ScrapeConfig};
pub use dedup::{DedupEngine, DedupOutcome};
pub use lock::{LockError, RunLock, RunLockGuard};
pub use normalize::{Normalizer, SkipReason};
pub use pipeline::{
    Processed, RunController, RunError, RunOutcome, RunReport, RunSettings, RunStage,
};
pub use summary::{event_line, weekly_summary_markdown};

pub const CRATE_NAME: &str = "nightlist-sync";

pub async fn run_once_from_env() -> Result<RunOutcome> {
    let config = ScrapeConfig::from_env()?;
    let controller = RunController::from_config(&config)?;
    Ok(controller.run_once().await)
}
