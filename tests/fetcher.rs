use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use btc_sync::catalog::Catalog;
use btc_sync::content::{ContentCache, ContentKey};
use btc_sync::domain::{DEFAULT_SERVER, Ingredient, ResourceMetadata, ResourcePointer};
use btc_sync::error::BtcError;
use btc_sync::fetcher::{
    ContentFetcher, FetcherEvent, FetcherOptions, FetcherState, StartPayload,
};
use btc_sync::remote::{CatalogClient, CatalogFilters, Enrichment};
use btc_sync::store::{KeyValueStore, MemoryStore};

const POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct MockContent {
    calls: Mutex<usize>,
    failing_path: Option<String>,
    delay: Option<Duration>,
}

impl CatalogClient for MockContent {
    fn search_catalog(&self, _filters: &CatalogFilters) -> Result<Vec<Value>, BtcError> {
        Ok(Vec::new())
    }

    fn fetch_text_content(
        &self,
        _owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<String, BtcError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.failing_path.as_deref() == Some(path) {
            return Err(BtcError::CatalogStatus {
                status: 404,
                message: format!("{path} not found"),
            });
        }
        Ok(format!("{repo}@{reference}:{path}"))
    }

    fn download_release_archive(
        &self,
        _owner: &str,
        _repo: &str,
        _reference: &str,
    ) -> Result<Vec<u8>, BtcError> {
        Err(BtcError::CatalogHttp("not used".to_string()))
    }

    fn enrich_metadata(&self, _raw: &Value) -> Result<Enrichment, BtcError> {
        Ok(Enrichment::default())
    }
}

struct Fixture {
    catalog_store: Arc<MemoryStore>,
    catalog: Catalog,
    content: ContentCache,
    metadata: ResourceMetadata,
}

fn fixture(books: usize) -> Fixture {
    let catalog_store = Arc::new(MemoryStore::new());
    let catalog = Catalog::new(catalog_store.clone());
    let content = ContentCache::new(Arc::new(MemoryStore::new()));
    let pointer = ResourcePointer::new(DEFAULT_SERVER, "unfoldingWord", "en", "ult");
    let mut metadata = ResourceMetadata::stub(&pointer);
    metadata.version = "v86".to_string();
    metadata.ingredients = (0..books)
        .map(|index| Ingredient {
            identifier: format!("book{index}"),
            title: String::new(),
            path: format!("book{index}.usfm"),
            categories: Vec::new(),
        })
        .collect();
    catalog.put(&metadata).unwrap();
    Fixture {
        catalog_store,
        catalog,
        content,
        metadata,
    }
}

fn spawn(fixture: &Fixture, client: Arc<MockContent>, concurrency: usize) -> ContentFetcher {
    ContentFetcher::spawn(
        client,
        fixture.catalog.clone(),
        fixture.content.clone(),
        FetcherOptions { concurrency },
    )
}

fn start_payload(keys: &[&str], skip_existing: bool) -> StartPayload {
    StartPayload {
        resource_keys: keys.iter().map(|key| key.to_string()).collect(),
        skip_existing,
        total_ingredients: None,
    }
}

fn content_key(fixture: &Fixture, index: usize) -> ContentKey {
    ContentKey::for_ingredient(&fixture.metadata, &fixture.metadata.ingredients[index]).unwrap()
}

#[test]
fn fully_cached_resource_needs_no_network() {
    let fixture = fixture(3);
    for index in 0..3 {
        fixture
            .content
            .put(&content_key(&fixture, index), "v86", "cached".to_string())
            .unwrap();
    }
    let client = Arc::new(MockContent::default());
    let fetcher = spawn(&fixture, client.clone(), 4);

    assert!(fetcher.start(start_payload(&["unfoldingWord/en/ult"], true)).unwrap());
    let progress = fetcher.wait_for_terminal(POLL, |_| {}).unwrap();

    assert_eq!(*client.calls.lock().unwrap(), 0);
    assert_eq!(progress.total_ingredients, 3);
    assert_eq!(progress.completed_ingredients, 3);
    assert_eq!(progress.overall_progress_percent, 100);
    assert_eq!(fetcher.state(), FetcherState::Complete);
}

#[test]
fn missing_ingredients_are_fetched_and_cached() {
    let fixture = fixture(5);
    fixture
        .content
        .put(&content_key(&fixture, 0), "v86", "cached".to_string())
        .unwrap();
    let client = Arc::new(MockContent::default());
    let fetcher = spawn(&fixture, client.clone(), 2);

    fetcher.start(start_payload(&["unfoldingWord/en/ult#2"], true)).unwrap();
    let mut completed = Vec::new();
    let progress = fetcher
        .wait_for_terminal(POLL, |event| {
            if let FetcherEvent::Progress(progress) = event {
                completed.push(progress.completed_ingredients);
            }
        })
        .unwrap();

    assert_eq!(*client.calls.lock().unwrap(), 4);
    assert_eq!(progress.completed_ingredients, 5);
    assert_eq!(progress.failed_ingredients, 0);
    assert!(completed.windows(2).all(|pair| pair[0] <= pair[1]));

    let entry = fixture.content.get(&content_key(&fixture, 3)).unwrap().unwrap();
    assert_eq!(entry.content, "en_ult@v86:book3.usfm");
    assert_eq!(entry.version, "v86");
}

#[test]
fn failures_are_counted_not_fatal() {
    let fixture = fixture(3);
    let client = Arc::new(MockContent {
        failing_path: Some("book1.usfm".to_string()),
        ..MockContent::default()
    });
    let fetcher = spawn(&fixture, client, 1);

    fetcher.start(start_payload(&["unfoldingWord/en/ult"], true)).unwrap();
    let progress = fetcher.wait_for_terminal(POLL, |_| {}).unwrap();

    assert_eq!(progress.completed_ingredients, 2);
    assert_eq!(progress.failed_ingredients, 1);
    assert_eq!(progress.processed(), progress.total_ingredients);
    assert_eq!(fetcher.state(), FetcherState::Complete);
    assert!(fixture.content.get(&content_key(&fixture, 1)).unwrap().is_none());
}

#[test]
fn skip_existing_false_refetches_everything() {
    let fixture = fixture(2);
    fixture
        .content
        .put(&content_key(&fixture, 0), "v80", "stale".to_string())
        .unwrap();
    let client = Arc::new(MockContent::default());
    let fetcher = spawn(&fixture, client.clone(), 2);

    fetcher.start(start_payload(&["unfoldingWord/en/ult"], false)).unwrap();
    fetcher.wait_for_terminal(POLL, |_| {}).unwrap();

    assert_eq!(*client.calls.lock().unwrap(), 2);
    let entry = fixture.content.get(&content_key(&fixture, 0)).unwrap().unwrap();
    assert_eq!(entry.version, "v86");
}

#[test]
fn stop_without_session_is_harmless() {
    let fixture = fixture(1);
    let fetcher = spawn(&fixture, Arc::new(MockContent::default()), 1);
    fetcher.stop();
    let event = fetcher.events().recv_timeout(Duration::from_secs(5)).unwrap();
    match event {
        FetcherEvent::QueueUpdated(snapshot) => {
            assert_eq!(snapshot.state, FetcherState::Idle);
            assert_eq!(snapshot.pending_ingredients, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(fetcher.state(), FetcherState::Idle);
}

#[test]
fn stop_cancels_and_suppresses_completion() {
    let fixture = fixture(20);
    let client = Arc::new(MockContent {
        delay: Some(Duration::from_millis(30)),
        ..MockContent::default()
    });
    let fetcher = spawn(&fixture, client.clone(), 1);

    fetcher.start(start_payload(&["unfoldingWord/en/ult"], true)).unwrap();
    loop {
        match fetcher.events().recv_timeout(Duration::from_secs(5)).unwrap() {
            FetcherEvent::Progress(progress) if progress.completed_ingredients > 0 => break,
            _ => continue,
        }
    }
    fetcher.stop();
    fetcher.wait_for_terminal(POLL, |_| {}).unwrap();
    assert_eq!(fetcher.state(), FetcherState::Idle);

    thread::sleep(Duration::from_millis(200));
    let late = fetcher.drain_events();
    assert!(
        late.iter()
            .all(|event| !matches!(event, FetcherEvent::Complete(_) | FetcherEvent::Progress(_))),
        "{late:?}"
    );
    assert!(*client.calls.lock().unwrap() < 20);

    // Entries written before the stop are kept.
    assert!(fixture.content.get(&content_key(&fixture, 0)).unwrap().is_some());
}

#[test]
fn start_while_downloading_is_ignored() {
    let fixture = fixture(4);
    let client = Arc::new(MockContent {
        delay: Some(Duration::from_millis(20)),
        ..MockContent::default()
    });
    let fetcher = spawn(&fixture, client.clone(), 1);

    assert!(fetcher.start(start_payload(&["unfoldingWord/en/ult"], true)).unwrap());
    assert!(!fetcher.start(start_payload(&["unfoldingWord/en/ult"], false)).unwrap());
    let progress = fetcher.wait_for_terminal(POLL, |_| {}).unwrap();

    assert_eq!(progress.total_ingredients, 4);
    assert_eq!(*client.calls.lock().unwrap(), 4);
}

#[test]
fn hint_seeds_the_first_snapshot() {
    let fixture = fixture(2);
    let fetcher = spawn(&fixture, Arc::new(MockContent::default()), 1);
    fetcher
        .start(StartPayload {
            total_ingredients: Some(66),
            ..start_payload(&["unfoldingWord/en/ult"], true)
        })
        .unwrap();

    let mut snapshots = Vec::new();
    let progress = fetcher
        .wait_for_terminal(POLL, |event| {
            if let FetcherEvent::Progress(progress) = event {
                snapshots.push(progress.clone());
            }
        })
        .unwrap();
    assert_eq!(snapshots.first().map(|p| p.total_ingredients), Some(66));
    assert_eq!(progress.total_ingredients, 2);
    assert!(snapshots.windows(2).all(|pair| {
        pair[0].completed_ingredients <= pair[1].completed_ingredients
            && pair[0].overall_progress_percent <= pair[1].overall_progress_percent
    }));
}

#[test]
fn zero_hint_never_reports_full_progress_early() {
    let fixture = fixture(2);
    let fetcher = spawn(&fixture, Arc::new(MockContent::default()), 1);
    fetcher
        .start(StartPayload {
            total_ingredients: Some(0),
            ..start_payload(&["unfoldingWord/en/ult"], true)
        })
        .unwrap();

    let mut percents = Vec::new();
    fetcher
        .wait_for_terminal(POLL, |event| {
            if let FetcherEvent::Progress(progress) = event {
                percents.push(progress.overall_progress_percent);
            }
        })
        .unwrap();
    assert_eq!(percents.first(), Some(&0));
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]), "{percents:?}");
}

#[test]
fn unusable_resources_are_reported_as_skipped() {
    let fixture = fixture(2);
    let client = Arc::new(MockContent::default());
    let fetcher = spawn(&fixture, client.clone(), 1);
    fetcher
        .start(start_payload(&["unfoldingWord/en/ult", "someone/fr/unknown", "not a key"], true))
        .unwrap();

    let mut queued = None;
    let progress = fetcher
        .wait_for_terminal(POLL, |event| {
            if let FetcherEvent::QueueUpdated(snapshot) = event {
                queued = Some(snapshot.clone());
            }
        })
        .unwrap();

    assert_eq!(progress.completed_ingredients, 2);
    assert_eq!(*client.calls.lock().unwrap(), 2);
    let skipped = progress
        .skipped_resources
        .iter()
        .map(|skipped| skipped.resource.as_str())
        .collect::<Vec<_>>();
    assert_eq!(skipped, vec!["someone/fr/unknown", "not a key"]);
    assert_eq!(queued.unwrap().skipped_resources, progress.skipped_resources);

    let json = serde_json::to_value(FetcherEvent::Complete(progress)).unwrap();
    assert_eq!(json["payload"]["skippedResources"][0]["resource"], "someone/fr/unknown");
}

#[test]
fn unreadable_record_does_not_abort_the_session() {
    let fixture = fixture(2);
    fixture
        .catalog_store
        .set("other/en/bad", &json!({ "title": 5, "ingredients": "none" }))
        .unwrap();
    let client = Arc::new(MockContent::default());
    let fetcher = spawn(&fixture, client.clone(), 1);
    fetcher
        .start(start_payload(&["other/en/bad", "unfoldingWord/en/ult"], true))
        .unwrap();

    let progress = fetcher.wait_for_terminal(POLL, |_| {}).unwrap();
    assert_eq!(fetcher.state(), FetcherState::Complete);
    assert_eq!(progress.completed_ingredients, 2);
    assert_eq!(*client.calls.lock().unwrap(), 2);
    assert_eq!(progress.skipped_resources.len(), 1);
    assert_eq!(progress.skipped_resources[0].resource, "other/en/bad");
    assert!(progress.skipped_resources[0].reason.contains("malformed"));
}
