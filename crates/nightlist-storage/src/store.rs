//! Day-bucket and latest-pointer documents.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nightlist_core::{DayOfWeek, Event, LatestDocument};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::write_atomic;

pub const LATEST_FILE_NAME: &str = "latest_events.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("writing day bucket {path}: {source}")]
    DayBucket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing latest pointer {path}: {source}")]
    Latest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed event store: one JSON array per weekday plus the latest pointer.
///
/// Each document is replaced independently through [`write_atomic`]; the
/// store never merges with what was there before.
#[derive(Debug, Clone)]
pub struct EventStore {
    data_dir: PathBuf,
    latest_path: PathBuf,
}

impl EventStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let latest_path = data_dir.join(LATEST_FILE_NAME);
        Self {
            data_dir,
            latest_path,
        }
    }

    pub fn with_latest_path(mut self, latest_path: impl Into<PathBuf>) -> Self {
        self.latest_path = latest_path.into();
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn latest_path(&self) -> &Path {
        &self.latest_path
    }

    pub fn day_bucket_path(&self, day: DayOfWeek) -> PathBuf {
        self.data_dir.join(format!("{}_events.json", day.file_stem()))
    }

    pub async fn write_day_bucket(
        &self,
        day: DayOfWeek,
        events: &[Event],
    ) -> Result<PathBuf, StoreError> {
        let path = self.day_bucket_path(day);
        let bytes = serde_json::to_vec_pretty(events).map_err(|source| StoreError::Serialize {
            what: "day bucket",
            source,
        })?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| StoreError::DayBucket {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), events = events.len(), %day, "day bucket replaced");
        Ok(path)
    }

    pub async fn write_latest(&self, document: &LatestDocument) -> Result<PathBuf, StoreError> {
        let path = self.latest_path.clone();
        let bytes =
            serde_json::to_vec_pretty(document).map_err(|source| StoreError::Serialize {
                what: "latest pointer",
                source,
            })?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| StoreError::Latest {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), events = document.data.len(), "latest pointer replaced");
        Ok(path)
    }

    /// `None` when the bucket has never been written.
    pub async fn load_day(&self, day: DayOfWeek) -> Result<Option<Vec<Event>>, StoreError> {
        read_json_if_exists(&self.day_bucket_path(day)).await
    }

    /// Falls back to the `source: "none"` placeholder when nothing was ever scraped.
    pub async fn load_latest(&self, now: DateTime<Utc>) -> Result<LatestDocument, StoreError> {
        Ok(read_json_if_exists(&self.latest_path)
            .await?
            .unwrap_or_else(|| LatestDocument::empty(now)))
    }

    pub async fn load_week(&self) -> Result<BTreeMap<DayOfWeek, Vec<Event>>, StoreError> {
        let mut week = BTreeMap::new();
        for day in DayOfWeek::ALL {
            if let Some(events) = self.load_day(day).await? {
                week.insert(day, events);
            }
        }
        Ok(week)
    }
}

async fn read_json_if_exists<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}
