use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use serde_json::{Value, json};

use btc_sync::catalog::Catalog;
use btc_sync::domain::{DEFAULT_SERVER, Ingredient, ResourceMetadata, ResourcePointer};
use btc_sync::error::BtcError;
use btc_sync::fs_util::ZipBuilder;
use btc_sync::ingredients::GeneratorRegistry;
use btc_sync::remote::{CatalogClient, CatalogFilters, Enrichment};
use btc_sync::resolver::{MetadataResolver, ResolverOptions};
use btc_sync::store::MemoryStore;

#[derive(Default)]
struct MockCatalog {
    entries: Vec<Value>,
    archive: Option<Vec<u8>>,
    fail_search: bool,
    fail_enrichment: bool,
    searches: Mutex<usize>,
    archives: Mutex<usize>,
}

impl CatalogClient for MockCatalog {
    fn search_catalog(&self, _filters: &CatalogFilters) -> Result<Vec<Value>, BtcError> {
        *self.searches.lock().unwrap() += 1;
        if self.fail_search {
            return Err(BtcError::CatalogHttp("connection refused".to_string()));
        }
        Ok(self.entries.clone())
    }

    fn fetch_text_content(
        &self,
        _owner: &str,
        _repo: &str,
        _path: &str,
        _reference: &str,
    ) -> Result<String, BtcError> {
        Err(BtcError::CatalogHttp("not used".to_string()))
    }

    fn download_release_archive(
        &self,
        _owner: &str,
        _repo: &str,
        _reference: &str,
    ) -> Result<Vec<u8>, BtcError> {
        *self.archives.lock().unwrap() += 1;
        self.archive
            .clone()
            .ok_or_else(|| BtcError::CatalogStatus {
                status: 404,
                message: "no archive".to_string(),
            })
    }

    fn enrich_metadata(&self, _raw: &Value) -> Result<Enrichment, BtcError> {
        if self.fail_enrichment {
            return Err(BtcError::CatalogHttp("readme unavailable".to_string()));
        }
        Ok(Enrichment {
            readme: Some("# README".to_string()),
            license: Some("CC BY-SA 4.0".to_string()),
        })
    }
}

fn ult_entry() -> Value {
    json!({
        "name": "en_ult",
        "owner": "unfoldingWord",
        "language": "en",
        "subject": "Aligned Bible",
        "title": "unfoldingWord Literal Text",
        "release": { "tag_name": "v86" },
        "ingredients": [
            { "identifier": "gen", "title": "Genesis", "path": "./01-GEN.usfm" },
            { "identifier": "exo", "title": "Exodus", "path": "./02-EXO.usfm" }
        ]
    })
}

fn tw_entry() -> Value {
    json!({
        "name": "en_tw",
        "owner": "unfoldingWord",
        "language": "en",
        "subject": "Translation Words",
        "title": "unfoldingWord Translation Words",
        "release": { "tag_name": "v85" },
        "ingredients": [{ "identifier": "bible", "path": "./bible" }]
    })
}

fn pointer(id: &str) -> ResourcePointer {
    ResourcePointer::new(DEFAULT_SERVER, "unfoldingWord", "en", id)
}

fn resolver(client: MockCatalog) -> (MetadataResolver<MockCatalog>, Arc<MockCatalog>) {
    let client = Arc::new(client);
    let resolver = MetadataResolver::new(
        Catalog::new(Arc::new(MemoryStore::new())),
        client.clone(),
        GeneratorRegistry::with_defaults(),
        ResolverOptions::default(),
    );
    (resolver, client)
}

#[test]
fn remote_record_is_normalized_enriched_and_persisted() {
    let (resolver, client) = resolver(MockCatalog {
        entries: vec![ult_entry()],
        ..MockCatalog::default()
    });

    let metadata = resolver.resolve(&pointer("ult")).unwrap();
    assert_eq!(metadata.version, "v86");
    assert_eq!(metadata.resource_type, "scripture");
    assert_eq!(metadata.ingredients.len(), 2);
    assert_eq!(metadata.ingredients[0].path, "01-GEN.usfm");
    assert_eq!(metadata.license.as_deref(), Some("CC BY-SA 4.0"));

    let stored = resolver
        .catalog()
        .get(&"unfoldingWord/en/ult".parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stored, metadata);
    assert_eq!(*client.searches.lock().unwrap(), 1);
}

#[test]
fn complete_local_record_skips_the_network() {
    let (resolver, client) = resolver(MockCatalog {
        entries: vec![ult_entry()],
        ..MockCatalog::default()
    });
    let mut local = ResourceMetadata::stub(&pointer("ult"));
    local.version = "v80".to_string();
    local.ingredients = (0..11)
        .map(|index| Ingredient {
            identifier: format!("book-{index}"),
            title: String::new(),
            path: String::new(),
            categories: Vec::new(),
        })
        .collect();
    resolver.catalog().put(&local).unwrap();

    let metadata = resolver.resolve(&pointer("ult")).unwrap();
    assert_eq!(metadata.version, "v80");
    assert_eq!(*client.searches.lock().unwrap(), 0);
}

#[test]
fn sparse_local_record_is_refreshed_and_merged() {
    let (resolver, client) = resolver(MockCatalog {
        entries: vec![ult_entry()],
        ..MockCatalog::default()
    });
    let mut local = ResourceMetadata::stub(&pointer("ult"));
    local.version = "v80".to_string();
    local.language_title = Some("English".to_string());
    resolver.catalog().put(&local).unwrap();

    let metadata = resolver.resolve(&pointer("ult")).unwrap();
    assert_eq!(metadata.version, "v86");
    assert_eq!(metadata.language_title.as_deref(), Some("English"));
    assert_eq!(*client.searches.lock().unwrap(), 1);
}

#[test]
fn unreleased_resource_is_rejected() {
    let mut entry = ult_entry();
    entry.as_object_mut().unwrap().remove("release");
    let (resolver, _) = resolver(MockCatalog {
        entries: vec![entry],
        ..MockCatalog::default()
    });
    assert_matches!(
        resolver.resolve(&pointer("ult")),
        Err(BtcError::UnreleasedResource(_))
    );
}

#[test]
fn unknown_resource_is_not_found() {
    let (resolver, _) = resolver(MockCatalog {
        entries: vec![tw_entry()],
        ..MockCatalog::default()
    });
    assert_matches!(
        resolver.resolve(&pointer("ult")),
        Err(BtcError::ResourceNotFound(_))
    );
}

#[test]
fn network_failure_falls_back_to_released_local_record() {
    let (resolver, _) = resolver(MockCatalog {
        fail_search: true,
        ..MockCatalog::default()
    });
    assert_matches!(resolver.resolve(&pointer("ult")), Err(BtcError::CatalogHttp(_)));

    let mut local = ResourceMetadata::stub(&pointer("ult"));
    local.version = "v80".to_string();
    resolver.catalog().put(&local).unwrap();
    assert_eq!(resolver.resolve(&pointer("ult")).unwrap().version, "v80");
}

#[test]
fn enrichment_failure_is_swallowed() {
    let (resolver, _) = resolver(MockCatalog {
        entries: vec![ult_entry()],
        fail_enrichment: true,
        ..MockCatalog::default()
    });
    let metadata = resolver.resolve(&pointer("ult")).unwrap();
    assert_eq!(metadata.version, "v86");
    assert!(metadata.readme.is_none());
}

#[test]
fn words_ingredients_come_from_the_release_archive() {
    let mut builder = ZipBuilder::new();
    builder.add_file("en_tw/bible/kt/god.md", b"# God\n").unwrap();
    builder.add_file("en_tw/bible/names/paul.md", b"# Paul\n").unwrap();
    let (resolver, client) = resolver(MockCatalog {
        entries: vec![tw_entry()],
        archive: Some(builder.finish().unwrap()),
        ..MockCatalog::default()
    });

    let metadata = resolver.resolve(&pointer("tw")).unwrap();
    assert_eq!(metadata.resource_type, "words");
    assert_eq!(metadata.ingredients.len(), 2);
    assert!(metadata.ingredients.iter().any(|item| item.identifier == "bible/kt/god"));
    assert_eq!(*client.archives.lock().unwrap(), 1);
}

#[test]
fn generator_failure_keeps_catalog_ingredients() {
    let (resolver, client) = resolver(MockCatalog {
        entries: vec![tw_entry()],
        archive: None,
        ..MockCatalog::default()
    });
    let metadata = resolver.resolve(&pointer("tw")).unwrap();
    assert_eq!(metadata.ingredients.len(), 1);
    assert_eq!(metadata.ingredients[0].identifier, "bible");
    assert_eq!(*client.archives.lock().unwrap(), 1);
}

#[test]
fn resolve_all_collects_failures() {
    let (resolver, _) = resolver(MockCatalog {
        entries: vec![ult_entry()],
        ..MockCatalog::default()
    });
    let (resolved, failed) = resolver.resolve_all(&[pointer("ult"), pointer("missing")]);
    assert_eq!(resolved.len(), 1);
    assert_eq!(failed.len(), 1);
    assert_matches!(failed[0].1, BtcError::ResourceNotFound(_));
}
