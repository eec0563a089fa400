use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use nightlist_adapters::SelectorTable;
use nightlist_core::{DayOfWeek, Event, LatestDocument, LatestSource};
use nightlist_storage::{
    ArtifactStore, BackoffPolicy, EventStore, PageRenderer, RenderError, SnapshotRenderer,
};
use nightlist_sync::lock::LOCK_FILE_NAME;
use nightlist_sync::{DayPolicy, RunController, RunError, RunOutcome, RunSettings, RunStage};

struct StaticRenderer(String);

#[async_trait]
impl PageRenderer for StaticRenderer {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn render_once(&self, _url: &str) -> Result<String, RenderError> {
        Ok(self.0.clone())
    }
}

struct StalledRenderer {
    calls: AtomicUsize,
}

#[async_trait]
impl PageRenderer for StalledRenderer {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn render_once(&self, _url: &str) -> Result<String, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(String::new())
    }
}

fn listing_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/edmtrain/sample/listing.html")
}

fn monday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 16, 0, 0).single().unwrap()
}

fn settings() -> RunSettings {
    RunSettings {
        backoff: BackoffPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        run_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

fn controller(renderer: Box<dyn PageRenderer>, store: EventStore, settings: RunSettings) -> RunController {
    let table = SelectorTable::builtin().unwrap();
    RunController::new(renderer, &table, store, settings).unwrap()
}

fn single_card(artist: &str, venue: &str) -> String {
    format!(
        r#"<html><body><div id="eventsContainer">
             <div class="eventContainer">
               <div class="eventArtist">{artist}</div>
               <div class="eventVenue"><span class="venueName">{venue}</span></div>
             </div>
           </div></body></html>"#
    )
}

fn read_bucket(path: &Path) -> Vec<Event> {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn single_card_fills_monday_bucket_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::new(dir.path());
    let run = controller(
        Box::new(StaticRenderer(single_card("Bruce Wayne", "Good Room"))),
        store.clone(),
        settings(),
    );

    let outcome = run.run_once_at(monday_noon()).await;
    assert_eq!(outcome.exit_code(), 0);
    let report = outcome.report().unwrap();
    assert_eq!(report.day, DayOfWeek::Monday);
    assert_eq!(report.events_written, 1);

    let events = read_bucket(&dir.path().join("monday_events.json"));
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.artist, "Bruce Wayne");
    assert_eq!(event.venue, "Good Room");
    assert_eq!(event.venue_location, "unknown");
    assert_eq!(event.city, "unknown");
    assert_eq!(event.event_name, "Bruce Wayne at Good Room");
    assert_eq!(event.age, "N/A");
    assert_eq!(event.time, "Check venue");
    assert_eq!(event.day_of_week, DayOfWeek::Monday);
    assert_eq!(event.scraped_at, monday_noon());

    let latest = store.load_latest(Utc::now()).await.unwrap();
    assert_eq!(latest.source, LatestSource::Scraped);
    assert_eq!(latest.data, events);
    assert_eq!(latest.last_updated, monday_noon());
    assert!(!dir.path().join(LOCK_FILE_NAME).exists());
}

#[tokio::test]
async fn fixture_listing_collapses_duplicate_rows() {
    let dir = tempfile::tempdir().unwrap();
    let run = controller(
        Box::new(SnapshotRenderer::new(listing_fixture())),
        EventStore::new(dir.path()),
        settings(),
    );

    let outcome = run.run_once_at(monday_noon()).await;
    let report = outcome.report().unwrap();
    assert_eq!(report.cards_seen, 6);
    assert_eq!(report.cards_skipped, 2);
    assert_eq!(report.duplicates_dropped, 1);

    let events = read_bucket(&report.day_bucket);
    let artists = events.iter().map(|e| e.artist.as_str()).collect::<Vec<_>>();
    assert_eq!(artists, ["Bruce Wayne", "Above & Beyond", "Mochakk"]);

    let bruce = &events[0];
    assert_eq!(bruce.city, "Brooklyn");
    assert_eq!(bruce.state, "NY");
    assert_eq!(bruce.age, "21+");
    assert_eq!(bruce.price, "$25");
    assert_eq!(
        bruce.url,
        "https://edmtrain.com/new-york-city-ny/bruce-wayne-good-room-20261019"
    );
    assert_eq!(events[1].event_name, "Group Therapy 600");
    assert_eq!(events[2].venue_location, "Elsewhere - Brooklyn, NY");
    assert_eq!(events[2].url, "");
}

#[tokio::test]
async fn stalled_render_times_out_and_leaves_files_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::new(dir.path());
    let previous = LatestDocument::scraped(Vec::new(), monday_noon());
    store.write_latest(&previous).await.unwrap();
    let before = std::fs::read(store.latest_path()).unwrap();

    let run = controller(
        Box::new(StalledRenderer {
            calls: AtomicUsize::new(0),
        }),
        store.clone(),
        RunSettings {
            run_timeout: Duration::from_millis(100),
            ..settings()
        },
    );

    let outcome = run.run_once_at(monday_noon()).await;
    assert_eq!(outcome.exit_code(), 1);
    match outcome {
        RunOutcome::Failed { stage, error, .. } => {
            assert_eq!(stage, RunStage::Fetching);
            assert!(matches!(error, RunError::Timeout(_)));
            assert_eq!(error.kind(), "FetchError");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(std::fs::read(store.latest_path()).unwrap(), before);
    assert!(!store.day_bucket_path(DayOfWeek::Monday).exists());
    assert!(!dir.path().join(LOCK_FILE_NAME).exists());
}

#[tokio::test]
async fn unwritable_latest_pointer_is_partial_success() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, "sentinel").unwrap();
    let store = EventStore::new(dir.path()).with_latest_path(blocker.join("latest_events.json"));

    let run = controller(
        Box::new(StaticRenderer(single_card("Bruce Wayne", "Good Room"))),
        store,
        settings(),
    );

    let outcome = run.run_once_at(monday_noon()).await;
    assert_eq!(outcome.exit_code(), 2);
    let RunOutcome::PartialSuccess { report, .. } = outcome else {
        panic!("expected partial success");
    };
    assert!(report.latest.is_none());
    assert_eq!(read_bucket(&report.day_bucket).len(), 1);
    assert_eq!(std::fs::read_to_string(&blocker).unwrap(), "sentinel");
}

#[tokio::test]
async fn failed_pointer_replace_keeps_previous_pointer_bytes() {
    let dir = tempfile::tempdir().unwrap();
    // A non-empty directory at the pointer path makes the final rename fail.
    let latest = dir.path().join("latest_events.json");
    std::fs::create_dir(&latest).unwrap();
    let previous = serde_json::to_vec_pretty(&LatestDocument::scraped(
        Vec::new(),
        monday_noon() - chrono::Duration::days(1),
    ))
    .unwrap();
    std::fs::write(latest.join("previous.json"), &previous).unwrap();

    let store = EventStore::new(dir.path()).with_latest_path(&latest);
    let run = controller(
        Box::new(StaticRenderer(single_card("Bruce Wayne", "Good Room"))),
        store,
        settings(),
    );

    let outcome = run.run_once_at(monday_noon()).await;
    let RunOutcome::PartialSuccess { report, error } = outcome else {
        panic!("expected partial success");
    };
    assert!(error.to_string().contains("latest_events.json"));

    let bucket = read_bucket(&report.day_bucket);
    assert_eq!(bucket.len(), 1);
    assert_eq!(bucket[0].artist, "Bruce Wayne");
    assert_eq!(std::fs::read(latest.join("previous.json")).unwrap(), previous);
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn missing_root_container_fails_extraction_without_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::new(dir.path());
    let run = controller(
        Box::new(StaticRenderer("<html><body><p>maintenance</p></body></html>".to_string())),
        store.clone(),
        settings(),
    );

    let outcome = run.run_once_at(monday_noon()).await;
    match outcome {
        RunOutcome::Failed { stage, error, .. } => {
            assert_eq!(stage, RunStage::Extracting);
            assert_eq!(error.kind(), "ExtractionError");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!store.day_bucket_path(DayOfWeek::Monday).exists());
    assert!(!store.latest_path().exists());
}

#[tokio::test]
async fn late_evening_run_files_under_new_york_weekday() {
    let dir = tempfile::tempdir().unwrap();
    let run = controller(
        Box::new(StaticRenderer(single_card("Bruce Wayne", "Good Room"))),
        EventStore::new(dir.path()),
        settings(),
    );

    // Tuesday 02:30 UTC is Monday 22:30 in New York.
    let late = Utc.with_ymd_and_hms(2026, 10, 20, 2, 30, 0).single().unwrap();
    let outcome = run.run_once_at(late).await;
    assert_eq!(outcome.report().unwrap().day, DayOfWeek::Monday);
    assert!(dir.path().join("monday_events.json").exists());
    assert!(!dir.path().join("tuesday_events.json").exists());
}

#[tokio::test]
async fn repeated_runs_rewrite_identical_records() {
    let dir = tempfile::tempdir().unwrap();
    let run = controller(
        Box::new(SnapshotRenderer::new(listing_fixture())),
        EventStore::new(dir.path()),
        settings(),
    );

    let first = run.run_once_at(monday_noon()).await;
    let first_events = read_bucket(&first.report().unwrap().day_bucket);
    let later = monday_noon() + chrono::Duration::hours(2);
    let second = run.run_once_at(later).await;
    let second_events = read_bucket(&second.report().unwrap().day_bucket);

    assert_eq!(first_events.len(), second_events.len());
    for (a, b) in first_events.iter().zip(&second_events) {
        assert_eq!(b.scraped_at, later);
        let mut a = a.clone();
        a.scraped_at = later;
        assert_eq!(&a, b);
    }
}

#[tokio::test]
async fn lock_held_by_another_process_refuses_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(LOCK_FILE_NAME), "pid=4242 run_id=other").unwrap();
    let store = EventStore::new(dir.path());
    let run = controller(
        Box::new(StaticRenderer(single_card("Bruce Wayne", "Good Room"))),
        store.clone(),
        settings(),
    );

    let outcome = run.run_once_at(monday_noon()).await;
    match outcome {
        RunOutcome::Failed { stage, error, .. } => {
            assert_eq!(stage, RunStage::Idle);
            assert_eq!(error.kind(), "AlreadyRunning");
        }
        other => panic!("expected refusal, got {other:?}"),
    }
    assert!(!store.latest_path().exists());
    assert!(dir.path().join(LOCK_FILE_NAME).exists());
}

#[tokio::test]
async fn event_date_policy_drops_other_days() {
    let dir = tempfile::tempdir().unwrap();
    let html = r#"<html><body><div id="eventsContainer">
        <div class="eventContainer">
          <div class="eventDate">Mon, Oct 19</div>
          <div class="eventArtist">Bruce Wayne</div>
          <div class="eventVenue"><span class="venueName">Good Room</span></div>
        </div>
        <div class="eventContainer">
          <div class="eventDate">Tue, Oct 20</div>
          <div class="eventArtist">Mochakk</div>
          <div class="eventVenue"><span class="venueName">Elsewhere</span></div>
        </div>
      </div></body></html>"#;
    let run = controller(
        Box::new(StaticRenderer(html.to_string())),
        EventStore::new(dir.path()),
        RunSettings {
            day_policy: DayPolicy::EventDate,
            ..settings()
        },
    );

    let outcome = run.run_once_at(monday_noon()).await;
    let report = outcome.report().unwrap();
    assert_eq!(report.drafts_skipped, 1);
    let events = read_bucket(&report.day_bucket);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].artist, "Bruce Wayne");
}

#[tokio::test]
async fn archive_keeps_rendered_markup() {
    let dir = tempfile::tempdir().unwrap();
    let archive_dir = tempfile::tempdir().unwrap();
    let html = single_card("Bruce Wayne", "Good Room");
    let run = controller(
        Box::new(StaticRenderer(html.clone())),
        EventStore::new(dir.path()),
        settings(),
    )
    .with_archive(ArtifactStore::new(archive_dir.path()));

    let outcome = run.run_once_at(monday_noon()).await;
    let archived = outcome.report().unwrap().archived.clone().unwrap();
    assert!(archived.starts_with(archive_dir.path()));
    assert_eq!(std::fs::read_to_string(archived).unwrap(), html);
}

#[tokio::test]
async fn preview_does_not_touch_storage() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::new(dir.path());
    let run = controller(
        Box::new(StaticRenderer(String::new())),
        store.clone(),
        settings(),
    );

    let html = std::fs::read_to_string(listing_fixture()).unwrap();
    let processed = run.preview(&html, monday_noon()).unwrap();
    assert_eq!(processed.events.len(), 3);
    assert_eq!(processed.day, DayOfWeek::Monday);
    assert!(!store.day_bucket_path(DayOfWeek::Monday).exists());
}
