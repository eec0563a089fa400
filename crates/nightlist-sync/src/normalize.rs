use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use nightlist_core::{
    field, DayOfWeek, Event, EventDraft, DEFAULT_AGE, DEFAULT_PRICE, DEFAULT_TIME, DEFAULT_UNKNOWN,
};
use thiserror::Error;

use crate::config::DayPolicy;

const AGE_TOKENS: [&str; 4] = ["21+", "18+", "16+", "all ages"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("card has no artist")]
    MissingArtist,
    #[error("card has no venue")]
    MissingVenue,
    #[error("listed for {listed}, run is collecting {collecting}")]
    OtherDay {
        listed: DayOfWeek,
        collecting: DayOfWeek,
    },
}

/// Pieces recovered from a combined location line such as `Good Room - Brooklyn, NY 21+`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationParts {
    pub venue: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub age: Option<String>,
}

pub fn parse_location(line: &str) -> LocationParts {
    let mut parts = LocationParts::default();
    let mut rest = collapse(line);

    let lower = rest.to_lowercase();
    if let Some((start, token)) = AGE_TOKENS
        .iter()
        .filter_map(|t| lower.find(t).map(|i| (i, *t)))
        .min_by_key(|(i, _)| *i)
    {
        if lower.len() == rest.len() {
            parts.age = Some(canonical_age(token).to_string());
            rest.replace_range(start..start + token.len(), " ");
            rest = collapse(&rest);
        }
    }

    let (venue, place) = match rest.split_once(" - ") {
        Some((venue, place)) => (venue, Some(place)),
        None => (rest.as_str(), None),
    };
    parts.venue = non_empty(venue);

    if let Some(place) = place {
        match place.split_once(',') {
            Some((city, state)) => {
                parts.city = non_empty(city);
                parts.state = non_empty(state);
            }
            None => parts.city = non_empty(place),
        }
    }
    parts
}

fn canonical_age(token: &str) -> &'static str {
    match token {
        "21+" => "21+",
        "18+" => "18+",
        "16+" => "16+",
        _ => "All Ages",
    }
}

fn collapse(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(input: &str) -> Option<String> {
    let trimmed = input.trim().trim_matches(|c: char| c == '-' || c == ',').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Weekday named or encoded in a listing date (`Mon, Oct 19`, `Monday, October 19, 2026`,
/// `2026-10-19`).
pub fn weekday_from_listing(date: &str) -> Option<DayOfWeek> {
    let trimmed = date.trim();
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(parsed.weekday().into());
    }
    trimmed
        .split(|c: char| !c.is_alphabetic())
        .find(|word| !word.is_empty())
        .and_then(DayOfWeek::from_label)
}

/// Turns extractor drafts into canonical events for a single run.
///
/// The scrape instant is fixed at construction so every record of a run shares
/// `scraped_at` and the bucket weekday.
#[derive(Debug, Clone)]
pub struct Normalizer {
    scraped_at: DateTime<Utc>,
    scrape_day: DayOfWeek,
    display_date: String,
    policy: DayPolicy,
}

impl Normalizer {
    pub fn new(scraped_at: DateTime<Utc>, timezone: Tz, policy: DayPolicy) -> Self {
        let local = scraped_at.with_timezone(&timezone);
        Self {
            scraped_at,
            scrape_day: local.weekday().into(),
            display_date: local.format("%A, %B %-d, %Y").to_string(),
            policy,
        }
    }

    /// Weekday, in the source timezone, that this run fills.
    pub fn scrape_day(&self) -> DayOfWeek {
        self.scrape_day
    }

    pub fn scraped_at(&self) -> DateTime<Utc> {
        self.scraped_at
    }

    pub fn normalize(&self, draft: &EventDraft) -> Result<Event, SkipReason> {
        let artist = draft.get(field::ARTIST).ok_or(SkipReason::MissingArtist)?;
        let location_line = draft.get(field::VENUE_LOCATION);
        let location = location_line.map(parse_location).unwrap_or_default();

        let venue = draft
            .get(field::VENUE)
            .map(ToString::to_string)
            .or_else(|| location.venue.clone())
            .ok_or(SkipReason::MissingVenue)?;

        let date = draft
            .get(field::DATE)
            .map(ToString::to_string)
            .unwrap_or_else(|| self.display_date.clone());

        let day_of_week = match self.policy {
            DayPolicy::ScrapeDay => self.scrape_day,
            DayPolicy::EventDate => {
                let listed = weekday_from_listing(&date).unwrap_or(self.scrape_day);
                if listed != self.scrape_day {
                    return Err(SkipReason::OtherDay {
                        listed,
                        collecting: self.scrape_day,
                    });
                }
                listed
            }
        };

        let text = |name: &str, fallback: Option<String>, default: &str| {
            draft
                .get(name)
                .map(ToString::to_string)
                .or(fallback)
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Event {
            artist: artist.to_string(),
            event_name: draft
                .get(field::EVENT_NAME)
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("{artist} at {venue}")),
            venue_location: location_line.unwrap_or(DEFAULT_UNKNOWN).to_string(),
            city: text(field::CITY, location.city, DEFAULT_UNKNOWN),
            state: text(field::STATE, location.state, DEFAULT_UNKNOWN),
            age: text(field::AGE, location.age, DEFAULT_AGE),
            time: text(field::TIME, None, DEFAULT_TIME),
            price: text(field::PRICE, None, DEFAULT_PRICE),
            url: text(field::URL, None, ""),
            venue,
            date,
            day_of_week,
            scraped_at: self.scraped_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn monday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 16, 0, 0).single().unwrap()
    }

    fn normalizer(policy: DayPolicy) -> Normalizer {
        Normalizer::new(monday_noon(), chrono_tz::America::New_York, policy)
    }

    #[test]
    fn location_line_splits_into_venue_city_state_and_age() {
        let parts = parse_location("Good Room - Brooklyn, NY 21+");
        assert_eq!(parts.venue.as_deref(), Some("Good Room"));
        assert_eq!(parts.city.as_deref(), Some("Brooklyn"));
        assert_eq!(parts.state.as_deref(), Some("NY"));
        assert_eq!(parts.age.as_deref(), Some("21+"));

        let bare = parse_location("Knockdown Center");
        assert_eq!(bare.venue.as_deref(), Some("Knockdown Center"));
        assert_eq!(bare.city, None);
        assert_eq!(bare.age, None);

        let all_ages = parse_location("Webster Hall - New York, NY ALL AGES");
        assert_eq!(all_ages.age.as_deref(), Some("All Ages"));
        assert_eq!(all_ages.state.as_deref(), Some("NY"));
    }

    #[test]
    fn minimal_card_gets_documented_defaults() {
        let draft = EventDraft::new("card")
            .with_field(field::ARTIST, "Bruce Wayne")
            .with_field(field::VENUE, "Good Room");
        let event = normalizer(DayPolicy::ScrapeDay).normalize(&draft).unwrap();

        assert_eq!(event.event_name, "Bruce Wayne at Good Room");
        assert_eq!(event.venue_location, "unknown");
        assert_eq!(event.city, "unknown");
        assert_eq!(event.state, "unknown");
        assert_eq!(event.time, "Check venue");
        assert_eq!(event.price, "N/A");
        assert_eq!(event.age, "N/A");
        assert_eq!(event.url, "");
        assert_eq!(event.date, "Monday, October 19, 2026");
        assert_eq!(event.day_of_week, DayOfWeek::Monday);
        assert_eq!(event.scraped_at, monday_noon());
    }

    #[test]
    fn venue_falls_back_to_location_line() {
        let draft = EventDraft::new("card")
            .with_field(field::ARTIST, "Mochakk")
            .with_field(field::VENUE_LOCATION, "Elsewhere - Brooklyn, NY 18+");
        let event = normalizer(DayPolicy::ScrapeDay).normalize(&draft).unwrap();
        assert_eq!(event.venue, "Elsewhere");
        assert_eq!(event.city, "Brooklyn");
        assert_eq!(event.age, "18+");
    }

    #[test]
    fn explicit_age_wins_over_location_token() {
        let draft = EventDraft::new("card")
            .with_field(field::ARTIST, "Mochakk")
            .with_field(field::VENUE, "Elsewhere")
            .with_field(field::VENUE_LOCATION, "Elsewhere - Brooklyn, NY 18+")
            .with_field(field::AGE, "21+");
        let event = normalizer(DayPolicy::ScrapeDay).normalize(&draft).unwrap();
        assert_eq!(event.age, "21+");
    }

    #[test]
    fn cards_without_artist_or_venue_are_skipped() {
        let n = normalizer(DayPolicy::ScrapeDay);
        let no_artist = EventDraft::new("card").with_field(field::VENUE, "Good Room");
        assert_eq!(n.normalize(&no_artist), Err(SkipReason::MissingArtist));

        let blank_artist = EventDraft::new("card").with_field(field::ARTIST, "  ");
        assert_eq!(n.normalize(&blank_artist), Err(SkipReason::MissingArtist));

        let blank_venue = EventDraft::new("card")
            .with_field(field::ARTIST, "Bruce Wayne")
            .with_field(field::VENUE, " ");
        assert_eq!(n.normalize(&blank_venue), Err(SkipReason::MissingVenue));
    }

    #[test]
    fn scrape_day_is_taken_in_source_timezone() {
        // 02:30 UTC Tuesday is still Monday evening in New York.
        let late = Utc.with_ymd_and_hms(2026, 10, 20, 2, 30, 0).single().unwrap();
        let n = Normalizer::new(late, chrono_tz::America::New_York, DayPolicy::ScrapeDay);
        assert_eq!(n.scrape_day(), DayOfWeek::Monday);
    }

    #[test]
    fn event_date_policy_keeps_only_todays_listings() {
        let n = normalizer(DayPolicy::EventDate);
        let today = EventDraft::new("card")
            .with_field(field::ARTIST, "Bruce Wayne")
            .with_field(field::VENUE, "Good Room")
            .with_field(field::DATE, "Mon, Oct 19");
        assert_eq!(n.normalize(&today).unwrap().day_of_week, DayOfWeek::Monday);

        let tomorrow = today.clone().with_field(field::DATE, "Tue, Oct 20");
        assert_eq!(
            n.normalize(&tomorrow),
            Err(SkipReason::OtherDay {
                listed: DayOfWeek::Tuesday,
                collecting: DayOfWeek::Monday,
            })
        );

        let undated = today.with_field(field::DATE, "Tonight");
        assert_eq!(n.normalize(&undated).unwrap().day_of_week, DayOfWeek::Monday);
    }

    #[test]
    fn listing_weekday_parses_iso_and_labels() {
        assert_eq!(weekday_from_listing("2026-10-24"), Some(DayOfWeek::Saturday));
        assert_eq!(weekday_from_listing("Fri, Oct 23"), Some(DayOfWeek::Friday));
        assert_eq!(weekday_from_listing("October 23"), None);
    }
}
