use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use btc_sync::app::{App, Stores};
use btc_sync::config::{ResolvedConfig, SeedResource};
use btc_sync::content::ContentKey;
use btc_sync::domain::{BaseKey, DEFAULT_SERVER, InstanceKey, ResourcePointer};
use btc_sync::error::BtcError;
use btc_sync::fetcher::FetcherState;
use btc_sync::output::JsonOutput;
use btc_sync::package::ExportOptions;
use btc_sync::remote::{CatalogClient, CatalogFilters, Enrichment};
use btc_sync::store::StoreLayout;

#[derive(Default)]
struct MockDoor43 {
    searches: Mutex<usize>,
    fetches: Mutex<usize>,
}

impl CatalogClient for MockDoor43 {
    fn search_catalog(&self, _filters: &CatalogFilters) -> Result<Vec<Value>, BtcError> {
        *self.searches.lock().unwrap() += 1;
        Ok(vec![json!({
            "name": "en_ult",
            "owner": "unfoldingWord",
            "language": "en",
            "subject": "Aligned Bible",
            "title": "unfoldingWord Literal Text",
            "release": { "tag_name": "v86" },
            "ingredients": [
                { "identifier": "gen", "path": "./01-GEN.usfm" },
                { "identifier": "exo", "path": "./02-EXO.usfm" }
            ]
        })])
    }

    fn fetch_text_content(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        _reference: &str,
    ) -> Result<String, BtcError> {
        *self.fetches.lock().unwrap() += 1;
        Ok(format!("\\id {path}"))
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

fn ult() -> ResourcePointer {
    ResourcePointer::new(DEFAULT_SERVER, "unfoldingWord", "en", "ult")
}

fn app(config: ResolvedConfig, client: Arc<MockDoor43>) -> App<MockDoor43> {
    App::new(config, client, Stores::in_memory()).unwrap()
}

#[test]
fn add_resource_places_and_downloads() {
    let client = Arc::new(MockDoor43::default());
    let mut app = app(ResolvedConfig::default(), client.clone());

    let result = app.add_resource(&ult(), Some("panel-1"), &JsonOutput).unwrap();
    assert!(result.added_to_table);
    assert_eq!(result.ingredients, 2);
    assert_eq!(result.instance.as_ref().map(InstanceKey::as_str), Some("unfoldingWord/en/ult"));
    assert!(result.fetch_started);

    let progress = app.wait_for_downloads(&JsonOutput).unwrap();
    assert_eq!(progress.completed_ingredients, 2);
    assert_eq!(app.fetch_state(), FetcherState::Complete);
    assert_eq!(*client.fetches.lock().unwrap(), 2);

    let metadata = app.catalog().get(&result.resource).unwrap().unwrap();
    let key = ContentKey::for_ingredient(&metadata, &metadata.ingredients[0]).unwrap();
    assert_eq!(app.content().get(&key).unwrap().unwrap().content, "\\id 01-GEN.usfm");

    // A second placement derives a fresh instance key.
    let again = app.add_resource(&ult(), Some("panel-2"), &JsonOutput).unwrap();
    assert!(!again.added_to_table);
    assert_eq!(
        again.instance.as_ref().map(InstanceKey::as_str),
        Some("unfoldingWord/en/ult#2")
    );
    app.wait_for_downloads(&JsonOutput).unwrap();
    assert_eq!(*client.fetches.lock().unwrap(), 2);
}

#[test]
fn download_defaults_to_table_resources() {
    let client = Arc::new(MockDoor43::default());
    let config = ResolvedConfig {
        auto_fetch: false,
        ..ResolvedConfig::default()
    };
    let mut app = app(config, client.clone());
    let added = app.add_resource(&ult(), None, &JsonOutput).unwrap();
    assert!(!added.fetch_started);
    assert_eq!(*client.fetches.lock().unwrap(), 0);

    let result = app.download(Vec::new(), None, &JsonOutput).unwrap();
    assert_eq!(result.resources, vec!["unfoldingWord/en/ult".to_string()]);
    assert_eq!(result.state, FetcherState::Complete);
    assert_eq!(result.progress.completed_ingredients, 2);

    let again = app.download(Vec::new(), None, &JsonOutput).unwrap();
    assert_eq!(again.progress.completed_ingredients, 2);
    assert_eq!(*client.fetches.lock().unwrap(), 2);
}

#[test]
fn removed_resource_stays_on_its_panel() {
    let config = ResolvedConfig {
        auto_fetch: false,
        ..ResolvedConfig::default()
    };
    let mut app = app(config, Arc::new(MockDoor43::default()));
    let added = app.add_resource(&ult(), Some("panel-1"), &JsonOutput).unwrap();

    let removed = app.remove_resource(&added.resource).unwrap();
    assert!(removed.removal.removed);
    assert_eq!(removed.removal.remaining_instances, 1);
    let instance = added.instance.unwrap();
    assert!(app.workspace().resolve_instance(&instance).is_some());
    assert_eq!(app.workspace().table().count(), 0);

    let result = app.remove_from_panel(&instance, "panel-1").unwrap();
    assert!(result.changed);
    assert!(app.workspace().resources.is_empty());
}

#[test]
fn panel_operations_report_changes() {
    let config = ResolvedConfig {
        auto_fetch: false,
        ..ResolvedConfig::default()
    };
    let mut app = app(config, Arc::new(MockDoor43::default()));
    assert!(app.create_panel("panel-3", "Notes").unwrap().changed);
    assert!(!app.create_panel("panel-3", "Notes").unwrap().changed);

    let key: InstanceKey = "unfoldingWord/en/tn".parse().unwrap();
    assert!(app.assign_to_panel(&key, "panel-3", None).unwrap().changed);
    let moved = app.move_between_panels(&key, "panel-3", "panel-1", Some(0)).unwrap();
    assert!(moved.changed);
    assert_eq!(moved.panels[0].resource_keys, vec![key.clone()]);
    assert!(moved.panels[2].resource_keys.is_empty());
    assert!(!app.set_active("panel-1", 0).unwrap().changed);
    assert!(!app.reorder_in_panel(&key, "panel-1", 0).unwrap().changed);
}

#[test]
fn seed_collects_failures() {
    let config = ResolvedConfig {
        auto_fetch: false,
        resources: vec![
            SeedResource {
                pointer: ult(),
                panel: Some("panel-2".to_string()),
            },
            SeedResource {
                pointer: ResourcePointer::new(DEFAULT_SERVER, "unfoldingWord", "en", "tn"),
                panel: None,
            },
        ],
        ..ResolvedConfig::default()
    };
    let mut app = app(config, Arc::new(MockDoor43::default()));
    let result = app.seed_from_config(&JsonOutput).unwrap();
    assert_eq!(result.added.len(), 1);
    assert_eq!(result.failed.len(), 1);
    assert!(result.failed[0].resource.starts_with("unfoldingWord/en/tn"));
    assert_eq!(
        app.workspace().panel("panel-2").unwrap().resource_keys[0].as_str(),
        "unfoldingWord/en/ult"
    );
}

#[test]
fn export_and_import_between_installations() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let archive = root.join("out").join("collection.zip");

    let client = Arc::new(MockDoor43::default());
    let mut source = App::new(
        ResolvedConfig::default(),
        client.clone(),
        Stores::open(&StoreLayout::new_with_root(root.join("source"))).unwrap(),
    )
    .unwrap();
    source.add_resource(&ult(), Some("panel-1"), &JsonOutput).unwrap();
    source.add_resource(&ult(), Some("panel-2"), &JsonOutput).unwrap();
    source.wait_for_downloads(&JsonOutput).unwrap();

    let options = ExportOptions {
        include_content: true,
        ..ExportOptions::default()
    };
    let exported = source.export_collection(&archive, options, &JsonOutput).unwrap();
    assert!(archive.as_std_path().exists());
    assert_eq!(exported.summary.content_entries, 2);

    let target_client = Arc::new(MockDoor43::default());
    let mut target = App::new(
        ResolvedConfig::default(),
        target_client.clone(),
        Stores::open(&StoreLayout::new_with_root(root.join("target"))).unwrap(),
    )
    .unwrap();
    let imported = target.import_collection(&archive, &JsonOutput).unwrap();
    assert_eq!(imported.outcome.content_imported, 2);
    assert!(imported.fetch_started);
    let progress = target.wait_for_downloads(&JsonOutput).unwrap();

    // Everything arrived in the package, so nothing is downloaded again.
    assert_eq!(progress.completed_ingredients, 2);
    assert_eq!(*target_client.fetches.lock().unwrap(), 0);
    assert_eq!(*target_client.searches.lock().unwrap(), 0);

    let base: BaseKey = "unfoldingWord/en/ult".parse().unwrap();
    assert_eq!(target.workspace().usage_count(&base), 2);
    assert_eq!(
        target.workspace().panel("panel-2").unwrap().resource_keys[0].as_str(),
        "unfoldingWord/en/ult#2"
    );
}
