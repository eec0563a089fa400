use std::collections::HashSet;

use nightlist_core::Event;

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub events: Vec<Event>,
    pub dropped: usize,
}

/// Collapses repeated listings of the same show, keeping the first occurrence.
///
/// A record with its own detail link is identified by that link. Records without one,
/// or whose link is just the listing page, fall back to `(artist, venue, date)`
/// compared case-insensitively with whitespace collapsed.
#[derive(Debug, Clone, Default)]
pub struct DedupEngine {
    generic_urls: Vec<String>,
}

impl DedupEngine {
    pub fn new<I, S>(generic_urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            generic_urls: generic_urls
                .into_iter()
                .map(|u| canonical_url(u.as_ref()))
                .filter(|u| !u.is_empty())
                .collect(),
        }
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn identity_key(&self, event: &Event) -> String {
        let url = canonical_url(&event.url);
        if url.is_empty() || self.generic_urls.contains(&url) {
            format!(
                "show:{}|{}|{}",
                Self::normalize_key_fragment(&event.artist),
                Self::normalize_key_fragment(&event.venue),
                Self::normalize_key_fragment(&event.date),
            )
        } else {
            format!("url:{url}")
        }
    }

    pub fn apply(&self, events: Vec<Event>) -> DedupOutcome {
        let mut seen = HashSet::new();
        let mut outcome = DedupOutcome::default();
        for event in events {
            if seen.insert(self.identity_key(&event)) {
                outcome.events.push(event);
            } else {
                outcome.dropped += 1;
            }
        }
        outcome
    }
}

fn canonical_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
