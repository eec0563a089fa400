use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use nightlist_adapters::{ExtractError, Extractor, SelectorTable};
use nightlist_core::{DayOfWeek, Event, LatestDocument};
use nightlist_storage::{
    render_with_retry, ArtifactStore, BackoffPolicy, BrowserRenderConfig, BrowserRenderer,
    EventStore, HttpRenderer, PageRenderer, RenderError, RenderWait, SnapshotRenderer, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{DayPolicy, RenderMode, ScrapeConfig, DEFAULT_SOURCE_URL};
use crate::dedup::DedupEngine;
use crate::lock::{LockError, RunLock};
use crate::normalize::Normalizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStage {
    Idle,
    Fetching,
    Extracting,
    Normalizing,
    Deduplicating,
    Persisting,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] RenderError),
    #[error("fetch did not finish within {0:?}")]
    Timeout(Duration),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("writing day bucket failed: {0}")]
    Persistence(#[from] StoreError),
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Lock(LockError::Held { .. }) => "AlreadyRunning",
            RunError::Lock(LockError::Io { .. }) => "LockError",
            RunError::Fetch(_) | RunError::Timeout(_) => "FetchError",
            RunError::Extraction(_) => "ExtractionError",
            RunError::Persistence(_) => "PersistenceError",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub day: DayOfWeek,
    pub selector_version: u32,
    pub render_attempts: usize,
    pub rendered_bytes: usize,
    pub cards_seen: usize,
    pub cards_skipped: usize,
    pub drafts_skipped: usize,
    pub duplicates_dropped: usize,
    pub events_written: usize,
    pub day_bucket: PathBuf,
    pub latest: Option<PathBuf>,
    pub archived: Option<PathBuf>,
}

/// How a run ended. A day bucket is on disk for both success variants.
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded(RunReport),
    /// Day bucket written, latest pointer left as it was.
    PartialSuccess { report: RunReport, error: StoreError },
    Failed {
        run_id: Uuid,
        stage: RunStage,
        error: RunError,
    },
}

impl RunOutcome {
    pub fn stage(&self) -> RunStage {
        match self {
            RunOutcome::Succeeded(_) => RunStage::Succeeded,
            RunOutcome::PartialSuccess { .. } => RunStage::PartiallySucceeded,
            RunOutcome::Failed { .. } => RunStage::Failed,
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::Succeeded(report) | RunOutcome::PartialSuccess { report, .. } => Some(report),
            RunOutcome::Failed { .. } => None,
        }
    }

    /// Process exit status for the CLI: 0 success, 2 partial, 1 failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded(_) => 0,
            RunOutcome::PartialSuccess { .. } => 2,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

/// Events produced from one page of markup, before anything is written.
#[derive(Debug, Clone)]
pub struct Processed {
    pub day: DayOfWeek,
    pub events: Vec<Event>,
    pub cards_seen: usize,
    pub cards_skipped: usize,
    pub drafts_skipped: usize,
    pub duplicates_dropped: usize,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub source_url: String,
    pub timezone: Tz,
    pub day_policy: DayPolicy,
    pub backoff: BackoffPolicy,
    pub run_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            timezone: chrono_tz::America::New_York,
            day_policy: DayPolicy::ScrapeDay,
            backoff: BackoffPolicy::default(),
            run_timeout: Duration::from_secs(120),
        }
    }
}

impl RunSettings {
    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self {
            source_url: config.source_url.clone(),
            timezone: config.timezone,
            day_policy: config.day_policy,
            backoff: BackoffPolicy {
                max_attempts: config.max_attempts.max(1),
                ..Default::default()
            },
            run_timeout: config.run_timeout(),
        }
    }
}

/// Drives one scrape from render to persisted files and owns the run lock.
pub struct RunController {
    renderer: Box<dyn PageRenderer>,
    extractor: Extractor,
    source_id: String,
    dedup: DedupEngine,
    store: EventStore,
    archive: Option<ArtifactStore>,
    lock: RunLock,
    settings: RunSettings,
}

impl RunController {
    pub fn new(
        renderer: Box<dyn PageRenderer>,
        table: &SelectorTable,
        store: EventStore,
        settings: RunSettings,
    ) -> Result<Self, ExtractError> {
        let extractor = table.compile()?;
        let dedup = DedupEngine::new([table.base_url.as_str(), settings.source_url.as_str()]);
        let stale_after = settings
            .run_timeout
            .saturating_mul(2)
            .max(Duration::from_secs(60));
        let lock = RunLock::in_dir(store.data_dir(), stale_after);
        Ok(Self {
            renderer,
            extractor,
            source_id: table.source_id.clone(),
            dedup,
            store,
            archive: None,
            lock,
            settings,
        })
    }

    pub fn from_config(config: &ScrapeConfig) -> anyhow::Result<Self> {
        let table = match &config.selectors_file {
            Some(path) => SelectorTable::from_yaml_file(path)?,
            None => SelectorTable::builtin()?,
        };
        let renderer: Box<dyn PageRenderer> = match config.render_mode {
            RenderMode::Browser => Box::new(BrowserRenderer::new(BrowserRenderConfig {
                user_agent: config.user_agent.clone(),
                chrome_executable: config.chrome_path.clone(),
                wait: RenderWait {
                    card_selector: table.card_selector(),
                    timeout: config.render_wait(),
                    ..Default::default()
                },
                ..Default::default()
            })),
            RenderMode::Http => Box::new(
                HttpRenderer::new(&config.user_agent, config.render_wait())
                    .context("building http renderer")?,
            ),
            RenderMode::Snapshot => {
                let path = config
                    .snapshot_file
                    .clone()
                    .context("NIGHTLIST_SNAPSHOT_FILE must be set for snapshot render mode")?;
                Box::new(SnapshotRenderer::new(path))
            }
        };
        let store = EventStore::new(config.data_dir.clone()).with_latest_path(config.latest_path());
        let mut controller = Self::new(renderer, &table, store, RunSettings::from_config(config))
            .context("compiling selector table")?;
        if let Some(dir) = &config.archive_dir {
            controller = controller.with_archive(ArtifactStore::new(dir.clone()));
        }
        Ok(controller)
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub async fn run_once(&self) -> RunOutcome {
        self.run_once_at(Utc::now()).await
    }

    /// One full run with `now` as the scrape instant.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, source = %self.settings.source_url);
        async move {
            let mut stage = RunStage::Idle;
            let guard = match self.lock.acquire(run_id).await {
                Ok(guard) => guard,
                Err(err) => {
                    let error = RunError::from(err);
                    warn!(kind = error.kind(), error = %error, "run refused");
                    return RunOutcome::Failed {
                        run_id,
                        stage,
                        error,
                    };
                }
            };

            let result = self.execute(run_id, now, &mut stage).await;
            drop(guard);

            match result {
                Ok((report, None)) => {
                    advance(&mut stage, RunStage::Succeeded);
                    info!(
                        day = %report.day,
                        events = report.events_written,
                        duplicates = report.duplicates_dropped,
                        "run succeeded"
                    );
                    RunOutcome::Succeeded(report)
                }
                Ok((report, Some(error))) => {
                    advance(&mut stage, RunStage::PartiallySucceeded);
                    warn!(
                        day = %report.day,
                        events = report.events_written,
                        error = %error,
                        "day bucket written but latest pointer was not replaced"
                    );
                    RunOutcome::PartialSuccess { report, error }
                }
                Err(error) => {
                    let failed_at = stage;
                    advance(&mut stage, RunStage::Failed);
                    error!(stage = %failed_at, kind = error.kind(), error = %error, "run failed");
                    RunOutcome::Failed {
                        run_id,
                        stage: failed_at,
                        error,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Extract, normalize and deduplicate markup without touching storage.
    pub fn preview(&self, html: &str, now: DateTime<Utc>) -> Result<Processed, ExtractError> {
        let mut stage = RunStage::Idle;
        self.process(html, now, &mut stage)
    }

    async fn execute(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        stage: &mut RunStage,
    ) -> Result<(RunReport, Option<StoreError>), RunError> {
        advance(stage, RunStage::Fetching);
        let timeout = self.settings.run_timeout;
        let page = tokio::time::timeout(
            timeout,
            render_with_retry(
                self.renderer.as_ref(),
                &self.settings.source_url,
                &self.settings.backoff,
            ),
        )
        .await
        .map_err(|_| RunError::Timeout(timeout))??;

        let archived = match &self.archive {
            Some(archive) => match archive
                .store_markup(page.rendered_at, &self.source_id, &page.html)
                .await
            {
                Ok(stored) => {
                    debug!(path = %stored.absolute_path.display(), deduplicated = stored.deduplicated, "markup archived");
                    Some(stored.absolute_path)
                }
                Err(err) => {
                    warn!(error = %err, "failed to archive rendered markup");
                    None
                }
            },
            None => None,
        };

        let processed = self.process(&page.html, now, stage)?;

        advance(stage, RunStage::Persisting);
        let day_bucket = self
            .store
            .write_day_bucket(processed.day, &processed.events)
            .await?;
        let latest = self
            .store
            .write_latest(&LatestDocument::scraped(processed.events.clone(), now))
            .await;

        let mut report = RunReport {
            run_id,
            started_at: now,
            finished_at: Utc::now(),
            day: processed.day,
            selector_version: self.extractor.version(),
            render_attempts: page.attempts,
            rendered_bytes: page.html.len(),
            cards_seen: processed.cards_seen,
            cards_skipped: processed.cards_skipped,
            drafts_skipped: processed.drafts_skipped,
            duplicates_dropped: processed.duplicates_dropped,
            events_written: processed.events.len(),
            day_bucket,
            latest: None,
            archived,
        };
        match latest {
            Ok(path) => {
                report.latest = Some(path);
                Ok((report, None))
            }
            Err(err) => Ok((report, Some(err))),
        }
    }

    fn process(
        &self,
        html: &str,
        now: DateTime<Utc>,
        stage: &mut RunStage,
    ) -> Result<Processed, ExtractError> {
        advance(stage, RunStage::Extracting);
        let extraction = self.extractor.extract(html)?;
        for skip in &extraction.skipped {
            debug!(index = skip.index, layout = %skip.layout, reason = ?skip.reason, "card skipped");
        }

        advance(stage, RunStage::Normalizing);
        let normalizer = Normalizer::new(now, self.settings.timezone, self.settings.day_policy);
        let mut events = Vec::with_capacity(extraction.drafts.len());
        let mut drafts_skipped = 0usize;
        for draft in &extraction.drafts {
            match normalizer.normalize(draft) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    drafts_skipped += 1;
                    debug!(layout = %draft.layout, %reason, "draft skipped");
                }
            }
        }

        advance(stage, RunStage::Deduplicating);
        let deduped = self.dedup.apply(events);

        Ok(Processed {
            day: normalizer.scrape_day(),
            events: deduped.events,
            cards_seen: extraction.cards_seen,
            cards_skipped: extraction.skipped.len(),
            drafts_skipped,
            duplicates_dropped: deduped.dropped,
        })
    }
}

fn advance(stage: &mut RunStage, next: RunStage) {
    debug!(from = %stage, to = %next, "stage transition");
    *stage = next;
}
