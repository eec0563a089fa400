//! Core event model shared by every nightlist stage.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "nightlist-core";

pub const DEFAULT_UNKNOWN: &str = "unknown";
pub const DEFAULT_TIME: &str = "Check venue";
pub const DEFAULT_PRICE: &str = "N/A";
pub const DEFAULT_AGE: &str = "N/A";

/// Raw field names produced by the extractor and consumed by the normalizer.
pub mod field {
    pub const ARTIST: &str = "artist";
    pub const VENUE: &str = "venue";
    pub const VENUE_LOCATION: &str = "venue_location";
    pub const CITY: &str = "city";
    pub const STATE: &str = "state";
    pub const EVENT_NAME: &str = "event_name";
    pub const DATE: &str = "date";
    pub const TIME: &str = "time";
    pub const PRICE: &str = "price";
    pub const AGE: &str = "age";
    pub const URL: &str = "url";
}

/// Calendar weekday used as the day-bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
        DayOfWeek::Sunday,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DayOfWeek::Monday => "Monday",
            DayOfWeek::Tuesday => "Tuesday",
            DayOfWeek::Wednesday => "Wednesday",
            DayOfWeek::Thursday => "Thursday",
            DayOfWeek::Friday => "Friday",
            DayOfWeek::Saturday => "Saturday",
            DayOfWeek::Sunday => "Sunday",
        }
    }

    /// Lower-case stem used in bucket file names (`monday_events.json`).
    pub fn file_stem(self) -> String {
        self.name().to_ascii_lowercase()
    }

    /// Matches full names and the short forms seen on listing pages
    /// (`Mon`, `Tues`, `Thurs`, ...), case-insensitively.
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.trim().trim_end_matches(['.', ',']).to_ascii_lowercase();
        let day = match lower.as_str() {
            "monday" | "mon" => DayOfWeek::Monday,
            "tuesday" | "tue" | "tues" => DayOfWeek::Tuesday,
            "wednesday" | "wed" => DayOfWeek::Wednesday,
            "thursday" | "thu" | "thur" | "thurs" => DayOfWeek::Thursday,
            "friday" | "fri" => DayOfWeek::Friday,
            "saturday" | "sat" => DayOfWeek::Saturday,
            "sunday" | "sun" => DayOfWeek::Sunday,
            _ => return None,
        };
        Some(day)
    }
}

impl From<chrono::Weekday> for DayOfWeek {
    fn from(value: chrono::Weekday) -> Self {
        match value {
            chrono::Weekday::Mon => DayOfWeek::Monday,
            chrono::Weekday::Tue => DayOfWeek::Tuesday,
            chrono::Weekday::Wed => DayOfWeek::Wednesday,
            chrono::Weekday::Thu => DayOfWeek::Thursday,
            chrono::Weekday::Fri => DayOfWeek::Friday,
            chrono::Weekday::Sat => DayOfWeek::Saturday,
            chrono::Weekday::Sun => DayOfWeek::Sunday,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDay(pub String);

impl fmt::Display for UnknownDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown weekday: {}", self.0)
    }
}

impl std::error::Error for UnknownDay {}

impl FromStr for DayOfWeek {
    type Err = UnknownDay;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DayOfWeek::from_label(s).ok_or_else(|| UnknownDay(s.to_string()))
    }
}

/// Extractor handoff: raw, whitespace-collapsed field strings for one event card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub layout: String,
    pub fields: BTreeMap<String, String>,
    pub card_text: String,
}

impl EventDraft {
    pub fn new(layout: impl Into<String>) -> Self {
        Self {
            layout: layout.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Trimmed, non-empty value of a raw field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Canonical persisted event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub artist: String,
    pub venue: String,
    pub venue_location: String,
    pub city: String,
    pub state: String,
    pub event_name: String,
    pub date: String,
    pub day_of_week: DayOfWeek,
    pub time: String,
    pub price: String,
    pub age: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatestSource {
    Scraped,
    None,
}

/// The `latest_events.json` pointer document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestDocument {
    pub data: Vec<Event>,
    pub source: LatestSource,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LatestDocument {
    pub fn scraped(data: Vec<Event>, last_updated: DateTime<Utc>) -> Self {
        Self {
            data,
            source: LatestSource::Scraped,
            last_updated,
            message: None,
        }
    }

    /// Placeholder served before any scrape has succeeded.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            data: Vec::new(),
            source: LatestSource::None,
            last_updated: now,
            message: Some("no scrape has completed yet".to_string()),
        }
    }

    pub fn has_data(&self) -> bool {
        self.source == LatestSource::Scraped
    }
}
