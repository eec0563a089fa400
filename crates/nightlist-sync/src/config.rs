use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use nightlist_storage::render::DEFAULT_USER_AGENT;

pub const DEFAULT_SOURCE_URL: &str = "https://edmtrain.com/new-york-city-ny";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Browser,
    Http,
    Snapshot,
}

impl FromStr for RenderMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "browser" => Ok(RenderMode::Browser),
            "http" => Ok(RenderMode::Http),
            "snapshot" => Ok(RenderMode::Snapshot),
            other => bail!("unknown render mode `{other}` (expected browser, http or snapshot)"),
        }
    }
}

/// Which date decides an event's `day_of_week`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DayPolicy {
    /// The weekday the run executes on, in the source timezone.
    #[default]
    ScrapeDay,
    /// The weekday printed on the listing; events listed for another day are skipped.
    EventDate,
}

impl FromStr for DayPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrape-day" | "scrape_day" => Ok(DayPolicy::ScrapeDay),
            "event-date" | "event_date" => Ok(DayPolicy::EventDate),
            other => bail!("unknown day policy `{other}` (expected scrape-day or event-date)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub source_url: String,
    pub data_dir: PathBuf,
    pub latest_file: Option<PathBuf>,
    pub timezone: Tz,
    pub render_mode: RenderMode,
    pub snapshot_file: Option<PathBuf>,
    pub selectors_file: Option<PathBuf>,
    pub user_agent: String,
    pub render_wait_secs: u64,
    pub run_timeout_secs: u64,
    pub max_attempts: usize,
    pub day_policy: DayPolicy,
    pub archive_dir: Option<PathBuf>,
    pub chrome_path: Option<PathBuf>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            data_dir: PathBuf::from("./data"),
            latest_file: None,
            timezone: chrono_tz::America::New_York,
            render_mode: RenderMode::Browser,
            snapshot_file: None,
            selectors_file: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            render_wait_secs: 30,
            run_timeout_secs: 120,
            max_attempts: 3,
            day_policy: DayPolicy::ScrapeDay,
            archive_dir: None,
            chrome_path: None,
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            source_url: std::env::var("NIGHTLIST_SOURCE_URL").unwrap_or(defaults.source_url),
            data_dir: env_path("NIGHTLIST_DATA_DIR").unwrap_or(defaults.data_dir),
            latest_file: env_path("NIGHTLIST_LATEST_FILE"),
            timezone: match std::env::var("NIGHTLIST_TIMEZONE") {
                Ok(name) => parse_timezone(&name)?,
                Err(_) => defaults.timezone,
            },
            render_mode: match std::env::var("NIGHTLIST_RENDER_MODE") {
                Ok(mode) => mode.parse().context("NIGHTLIST_RENDER_MODE")?,
                Err(_) => defaults.render_mode,
            },
            snapshot_file: env_path("NIGHTLIST_SNAPSHOT_FILE"),
            selectors_file: env_path("NIGHTLIST_SELECTORS_FILE"),
            user_agent: std::env::var("NIGHTLIST_USER_AGENT").unwrap_or(defaults.user_agent),
            render_wait_secs: env_number("NIGHTLIST_RENDER_WAIT_SECS")?
                .unwrap_or(defaults.render_wait_secs),
            run_timeout_secs: env_number("NIGHTLIST_RUN_TIMEOUT_SECS")?
                .unwrap_or(defaults.run_timeout_secs),
            max_attempts: env_number("NIGHTLIST_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            day_policy: match std::env::var("NIGHTLIST_DAY_POLICY") {
                Ok(policy) => policy.parse().context("NIGHTLIST_DAY_POLICY")?,
                Err(_) => defaults.day_policy,
            },
            archive_dir: env_path("NIGHTLIST_ARCHIVE_DIR"),
            chrome_path: env_path("NIGHTLIST_CHROME_PATH"),
        })
    }

    pub fn latest_path(&self) -> PathBuf {
        self.latest_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(nightlist_storage::store::LATEST_FILE_NAME))
    }

    pub fn render_wait(&self) -> Duration {
        Duration::from_secs(self.render_wait_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow!("unknown timezone `{name}`: {e}"))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_number<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("parsing {key}={raw}")),
        Err(_) => Ok(None),
    }
}
