use std::collections::BTreeMap;

use nightlist_core::{DayOfWeek, Event};

/// Markdown digest of the stored week, one section per weekday.
pub fn weekly_summary_markdown(week: &BTreeMap<DayOfWeek, Vec<Event>>) -> String {
    let total = week.values().map(Vec::len).sum::<usize>();
    let mut lines = vec![
        "# Nightlist Week".to_string(),
        String::new(),
        format!("{total} events across {} stored days", week.len()),
        String::new(),
    ];

    for day in DayOfWeek::ALL {
        let Some(events) = week.get(&day) else {
            lines.push(format!("## {day}"));
            lines.push("- no scrape stored".to_string());
            lines.push(String::new());
            continue;
        };
        lines.push(format!("## {day} ({})", events.len()));
        if events.is_empty() {
            lines.push("- no events listed".to_string());
        }
        for event in events {
            lines.push(event_line(event));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

pub fn event_line(event: &Event) -> String {
    let mut line = format!(
        "- {} @ {} ({}, {}, {})",
        event.event_name, event.venue, event.time, event.price, event.age
    );
    if !event.url.is_empty() {
        line.push_str(&format!(" <{}>", event.url));
    }
    line
}
