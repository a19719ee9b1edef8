use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::json;

use btc_sync::store::{FsStore, KeyValueStore, MemoryStore, StoreLayout};

fn temp_root(temp: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join(name)).unwrap()
}

#[test]
fn layout_paths() {
    let temp = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new_with_root(temp_root(&temp, "cache"));
    assert!(layout.catalog_dir().ends_with("catalog"));
    assert!(layout.content_dir().ends_with("content"));
    assert!(layout.workspace_dir().ends_with("workspace"));
    assert!(layout.content_dir().starts_with(layout.root()));
}

#[test]
fn fs_store_round_trips_keys_with_separators() {
    let temp = tempfile::tempdir().unwrap();
    let store = FsStore::new(temp_root(&temp, "content"));

    let key = "book:unfoldingWord/en/ult:gen";
    store.set(key, &json!({ "content": "In the beginning" })).unwrap();
    store.set("workspace:current", &json!({ "id": "default" })).unwrap();

    assert!(store.entry_path(key).as_std_path().exists());
    assert_eq!(
        store.get(key).unwrap().unwrap()["content"],
        "In the beginning"
    );
    assert_eq!(
        store.keys().unwrap(),
        vec![key.to_string(), "workspace:current".to_string()]
    );

    store.delete(key).unwrap();
    assert!(store.get(key).unwrap().is_none());
    assert!(!store.contains(key).unwrap());
    store.delete(key).unwrap();
}

#[test]
fn fs_store_on_missing_root_is_empty() {
    let temp = tempfile::tempdir().unwrap();
    let store = FsStore::new(temp_root(&temp, "never-created"));
    assert!(store.keys().unwrap().is_empty());
    assert!(store.get("anything").unwrap().is_none());
}

#[test]
fn memory_store_behind_trait_object() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store.set("a", &json!(1)).unwrap();
    store.set("b", &json!(2)).unwrap();
    assert!(store.contains("a").unwrap());
    assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
    store.delete("a").unwrap();
    assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
}
