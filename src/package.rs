//! Collection package codec: a zip with `manifest.json`, per-resource
//! `metadata/` files, optional `content/` cache entries and a `README.md`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::{DEFAULT_SCAN_BATCH, DEFAULT_SHARD_BYTES};
use crate::content::ContentCache;
use crate::domain::{BaseKey, ResourceMetadata, ResourcePointer};
use crate::error::BtcError;
use crate::fs_util::{ZipBuilder, read_zip_entries};
use crate::keys::{base_key_of, derive_instance_key};
use crate::workspace::{Panel, ResourceEntry, Workspace};

pub const COLLECTION_FORMAT: &str = "bt-collection";
pub const FORMAT_VERSION: &str = "1.0";
pub const SUPPORTED_MAJOR_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const README_FILE: &str = "README.md";
pub const METADATA_DIR: &str = "metadata/";
pub const CONTENT_DIR: &str = "content/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionManifest {
    pub format: String,
    pub format_version: String,
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
    pub resources: Vec<ResourcePointer>,
    /// Resources removed from the table but still shown in a panel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detached_resources: Vec<BaseKey>,
    #[serde(default)]
    pub panel_layout: PanelLayout,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PanelLayout {
    #[serde(default)]
    pub panels: Vec<PanelDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelDescriptor {
    pub id: String,
    pub title: String,
    pub resource_ids: Vec<BaseKey>,
    #[serde(default)]
    pub default_resource_id: Option<BaseKey>,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub include_content: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub scan_batch_size: usize,
    pub shard_bytes: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_content: false,
            name: None,
            description: None,
            scan_batch_size: DEFAULT_SCAN_BATCH,
            shard_bytes: DEFAULT_SHARD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub resources: usize,
    pub metadata_files: usize,
    /// Resources exported as stubs because the catalog had no record.
    pub missing_metadata: Vec<String>,
    pub content_entries: usize,
    pub content_files: usize,
    pub skipped_content: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExportedArchive {
    pub bytes: Vec<u8>,
    pub manifest: CollectionManifest,
    pub summary: ExportSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub workspace: Workspace,
    pub metadata_imported: usize,
    pub content_imported: usize,
    pub warnings: Vec<String>,
}

/// Builds the manifest for `workspace`: every resource in the table or in a
/// panel, panels by base key. Detached rows are listed separately so import
/// keeps them out of the table.
pub fn build_manifest(workspace: &Workspace, options: &ExportOptions) -> CollectionManifest {
    let resources = exported_keys(workspace)
        .into_iter()
        .map(|key| match workspace.resources.get(&key) {
            Some(entry) => entry.pointer.clone(),
            None => ResourcePointer::from_base_key(default_server(workspace), &key),
        })
        .collect();
    let detached_resources = workspace
        .resources
        .iter()
        .filter(|(_, entry)| entry.detached)
        .map(|(key, _)| key.clone())
        .collect();

    let panels = workspace
        .panels
        .iter()
        .map(|panel| PanelDescriptor {
            id: panel.id.clone(),
            title: panel.name.clone(),
            resource_ids: panel.resource_keys.iter().map(base_key_of).collect(),
            default_resource_id: panel.active_key().map(base_key_of),
        })
        .collect();

    CollectionManifest {
        format: COLLECTION_FORMAT.to_string(),
        format_version: FORMAT_VERSION.to_string(),
        id: workspace.id.clone(),
        name: options.name.clone().unwrap_or_else(|| workspace.name.clone()),
        version: workspace.version.clone(),
        description: options.description.clone().unwrap_or_default(),
        created_at: chrono::Utc::now().to_rfc3339(),
        resources,
        detached_resources,
        panel_layout: PanelLayout { panels },
    }
}

pub fn export_collection(
    workspace: &Workspace,
    catalog: &Catalog,
    content: &ContentCache,
    options: &ExportOptions,
) -> Result<ExportedArchive, BtcError> {
    let manifest = build_manifest(workspace, options);
    let mut summary = ExportSummary {
        resources: manifest.resources.len(),
        ..ExportSummary::default()
    };
    let mut zip = ZipBuilder::new();

    zip.add_file(MANIFEST_FILE, &to_pretty_json(&manifest)?)?;

    for pointer in &manifest.resources {
        let key = pointer.base_key()?;
        let metadata = match catalog.get(&key) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                summary.missing_metadata.push(key.to_string());
                stub_from_workspace(workspace, pointer)
            }
            Err(err) => {
                warn!(resource = %key, error = %err, "unreadable catalog record; exporting stub");
                summary.missing_metadata.push(key.to_string());
                stub_from_workspace(workspace, pointer)
            }
        };
        zip.add_file(&metadata_file_name(&key), &to_pretty_json(&metadata)?)?;
        summary.metadata_files += 1;
    }

    if options.include_content {
        let base_keys = manifest
            .resources
            .iter()
            .filter_map(|pointer| pointer.base_key().ok())
            .collect::<Vec<_>>();
        export_content(&mut zip, content, &base_keys, options, &mut summary)?;
    }

    zip.add_file(README_FILE, render_readme(&manifest, &summary).as_bytes())?;

    let bytes = zip.finish()?;
    debug!(
        resources = summary.resources,
        content = summary.content_entries,
        "collection exported"
    );
    Ok(ExportedArchive {
        bytes,
        manifest,
        summary,
    })
}

/// Runs [`export_collection`] on its own thread; the result arrives on the
/// returned channel.
pub fn spawn_export(
    workspace: Workspace,
    catalog: Catalog,
    content: ContentCache,
    options: ExportOptions,
) -> mpsc::Receiver<Result<ExportedArchive, BtcError>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = export_collection(&workspace, &catalog, &content, &options);
        let _ = tx.send(result);
    });
    rx
}

fn export_content(
    zip: &mut ZipBuilder,
    content: &ContentCache,
    base_keys: &[BaseKey],
    options: &ExportOptions,
    summary: &mut ExportSummary,
) -> Result<(), BtcError> {
    let keys = content
        .store()
        .keys()
        .map_err(|err| BtcError::CacheUnavailable(err.to_string()))?;

    for batch in keys.chunks(options.scan_batch_size.max(1)) {
        for key in batch {
            if !base_keys.iter().any(|base| key.contains(base.as_str())) {
                continue;
            }
            let entry = match content.store().get(key) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable cache entry");
                    summary.skipped_content.push(key.clone());
                    continue;
                }
            };
            let serialized = to_compact_json(&entry)?;
            let shards = split_shards(&serialized, options.shard_bytes);
            let stem = format!("{CONTENT_DIR}{}", escape_file_stem(key));
            if shards.len() == 1 {
                zip.add_file(&format!("{stem}.json"), serialized.as_bytes())?;
            } else {
                for (index, shard) in shards.iter().enumerate() {
                    zip.add_file(&format!("{stem}_part{}.json", index + 1), shard.as_bytes())?;
                }
            }
            summary.content_entries += 1;
            summary.content_files += shards.len();
        }
        // Let the fetcher and foreground make progress between batches.
        thread::yield_now();
    }
    Ok(())
}

pub fn import_collection(
    bytes: &[u8],
    catalog: &Catalog,
    content: &ContentCache,
) -> Result<ImportOutcome, BtcError> {
    let entries = read_zip_entries(bytes)?;
    let manifest_bytes = entries.get(MANIFEST_FILE).ok_or(BtcError::MissingManifest)?;
    let manifest = parse_manifest(manifest_bytes)?;

    let mut warnings = Vec::new();
    let mut metadata_imported = 0;
    for (name, data) in entries.range::<str, _>((Bound::Included(METADATA_DIR), Bound::Unbounded)) {
        if !name.starts_with(METADATA_DIR) {
            break;
        }
        if !name.ends_with(".json") {
            continue;
        }
        let parsed = serde_json::from_slice::<ResourceMetadata>(data)
            .map_err(|err| BtcError::MalformedRecord(format!("{name}: {err}")))
            .and_then(|metadata| catalog.upsert(metadata));
        match parsed {
            Ok(_) => metadata_imported += 1,
            Err(err) => warnings.push(format!("metadata file {name} skipped: {err}")),
        }
    }

    let mut content_imported = 0;
    for (stem_key, payload) in collect_content(&entries, &mut warnings) {
        match serde_json::from_str::<Value>(&payload) {
            // Entries carry their own key; the file stem is only a fallback.
            Ok(value) => {
                let key = value
                    .get("key")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(stem_key);
                match content.store().set(&key, &value) {
                    Ok(()) => content_imported += 1,
                    Err(err) => warnings.push(format!("content {key} not stored: {err}")),
                }
            }
            Err(err) => warnings.push(format!("content {stem_key} is not valid JSON: {err}")),
        }
    }

    let workspace = rebuild_workspace(&manifest, catalog, &mut warnings);
    Ok(ImportOutcome {
        workspace,
        metadata_imported,
        content_imported,
        warnings,
    })
}

/// Parses and validates a manifest; nothing is written before this succeeds.
pub fn parse_manifest(bytes: &[u8]) -> Result<CollectionManifest, BtcError> {
    let raw: Value = serde_json::from_slice(bytes)
        .map_err(|err| BtcError::MalformedManifest(err.to_string()))?;
    let format = raw.get("format").and_then(Value::as_str).unwrap_or_default();
    if format != COLLECTION_FORMAT {
        return Err(BtcError::UnrecognizedFormat(format.to_string()));
    }
    let version = raw
        .get("formatVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let major = version
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok());
    if major != Some(SUPPORTED_MAJOR_VERSION) {
        return Err(BtcError::UnsupportedFormatVersion {
            found: version.to_string(),
            supported: format!("{SUPPORTED_MAJOR_VERSION}.x"),
        });
    }
    serde_json::from_value(raw).map_err(|err| BtcError::MalformedManifest(err.to_string()))
}

fn rebuild_workspace(
    manifest: &CollectionManifest,
    catalog: &Catalog,
    warnings: &mut Vec<String>,
) -> Workspace {
    let mut resources = BTreeMap::new();
    for pointer in &manifest.resources {
        let Ok(key) = pointer.base_key() else {
            warnings.push(format!("invalid resource pointer {pointer} skipped"));
            continue;
        };
        let entry = match catalog.get(&key) {
            Ok(Some(metadata)) => ResourceEntry::from(&metadata),
            Ok(None) => {
                warnings.push(format!("no metadata for {key}; kept as placeholder"));
                ResourceEntry::from(&ResourceMetadata::stub(pointer))
            }
            Err(err) => {
                warnings.push(format!("metadata for {key} unreadable ({err}); kept as placeholder"));
                ResourceEntry::from(&ResourceMetadata::stub(pointer))
            }
        };
        resources.insert(key, entry);
    }

    let mut workspace = Workspace {
        id: manifest.id.clone(),
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        resources,
        panels: Vec::new(),
    };

    for (position, descriptor) in manifest.panel_layout.panels.iter().enumerate() {
        let mut panel = Panel::new(&descriptor.id, &descriptor.title, position);
        for base in &descriptor.resource_ids {
            let key = derive_instance_key(base, workspace.instance_keys().chain(panel.resource_keys.iter()));
            panel.resource_keys.push(key);
            if !workspace.resources.contains_key(base) {
                let pointer = ResourcePointer::from_base_key(default_server(&workspace), base);
                warnings.push(format!("panel {} references {base} outside the resource list", descriptor.id));
                workspace
                    .resources
                    .insert(base.clone(), ResourceEntry::from(&ResourceMetadata::stub(&pointer)));
            }
        }
        panel.active_index = descriptor
            .default_resource_id
            .as_ref()
            .and_then(|default| {
                panel
                    .resource_keys
                    .iter()
                    .position(|key| &base_key_of(key) == default)
            })
            .unwrap_or(0);
        workspace.panels.push(panel);
    }

    for key in &manifest.detached_resources {
        if workspace.usage_count(key) == 0 {
            workspace.resources.remove(key);
        } else if let Some(entry) = workspace.resources.get_mut(key) {
            entry.detached = true;
        }
    }
    workspace
}

fn collect_content(
    entries: &BTreeMap<String, Vec<u8>>,
    warnings: &mut Vec<String>,
) -> Vec<(String, String)> {
    let mut whole = Vec::new();
    let mut sharded: BTreeMap<String, BTreeMap<usize, String>> = BTreeMap::new();
    for (name, data) in entries.range::<str, _>((Bound::Included(CONTENT_DIR), Bound::Unbounded)) {
        let Some(file) = name.strip_prefix(CONTENT_DIR) else {
            break;
        };
        let Some(stem) = file.strip_suffix(".json") else {
            continue;
        };
        let Ok(text) = String::from_utf8(data.clone()) else {
            warnings.push(format!("content file {name} is not UTF-8"));
            continue;
        };
        match split_part_suffix(stem) {
            Some((base, part)) => {
                sharded
                    .entry(base.to_string())
                    .or_default()
                    .insert(part, text);
            }
            None => whole.push((unescape_file_stem(stem), text)),
        }
    }
    for (stem, parts) in sharded {
        let expected = (1..=parts.len()).collect::<BTreeSet<_>>();
        if parts.keys().copied().collect::<BTreeSet<_>>() != expected {
            warnings.push(format!("content {stem} has missing shards; skipped"));
            continue;
        }
        whole.push((unescape_file_stem(&stem), parts.into_values().collect()));
    }
    whole
}

fn split_part_suffix(stem: &str) -> Option<(&str, usize)> {
    let (base, part) = stem.rsplit_once("_part")?;
    let part = part.parse::<usize>().ok()?;
    (part > 0).then_some((base, part))
}

fn split_shards(text: &str, shard_bytes: usize) -> Vec<&str> {
    let limit = shard_bytes.max(1);
    let mut shards = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(cut);
        shards.push(head);
        rest = tail;
    }
    shards.push(rest);
    shards
}

/// Cache key → archive file stem. Lossy when a key already contains `_`.
pub fn escape_file_stem(key: &str) -> String {
    key.replace('/', "_")
}

pub fn unescape_file_stem(stem: &str) -> String {
    stem.replace('_', "/")
}

pub fn metadata_file_name(key: &BaseKey) -> String {
    format!("{METADATA_DIR}{}.json", escape_file_stem(key.as_str()))
}

fn exported_keys(workspace: &Workspace) -> BTreeSet<BaseKey> {
    let mut keys = workspace.resources.keys().cloned().collect::<BTreeSet<_>>();
    keys.extend(workspace.instance_keys().map(base_key_of));
    keys
}

fn default_server(workspace: &Workspace) -> &str {
    workspace
        .resources
        .values()
        .next()
        .map(|entry| entry.pointer.server.as_str())
        .unwrap_or(crate::domain::DEFAULT_SERVER)
}

fn stub_from_workspace(workspace: &Workspace, pointer: &ResourcePointer) -> ResourceMetadata {
    let mut stub = ResourceMetadata::stub(pointer);
    if let Some(entry) = pointer
        .base_key()
        .ok()
        .and_then(|key| workspace.resources.get(&key))
    {
        stub.title = entry.title.clone();
        stub.subject = entry.subject.clone();
        stub.resource_type = entry.resource_type.clone();
        stub.version = entry.version.clone();
        stub.content_structure = entry.content_structure;
    }
    stub
}

fn render_readme(manifest: &CollectionManifest, summary: &ExportSummary) -> String {
    let mut out = format!("# {}\n\n", manifest.name);
    if !manifest.description.is_empty() {
        out.push_str(&format!("{}\n\n", manifest.description));
    }
    out.push_str(&format!(
        "Exported {} by btc-sync {}.\n\n## Resources\n\n",
        manifest.created_at,
        env!("CARGO_PKG_VERSION")
    ));
    for pointer in &manifest.resources {
        out.push_str(&format!(
            "- {}/{}/{} ({})\n",
            pointer.owner, pointer.language, pointer.resource_id, pointer.server
        ));
    }
    if !manifest.detached_resources.is_empty() {
        let ids = manifest
            .detached_resources
            .iter()
            .map(BaseKey::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("\nShown in panels only (not in the resource table): {ids}\n"));
    }
    out.push_str("\n## Panels\n\n");
    for panel in &manifest.panel_layout.panels {
        let ids = panel
            .resource_ids
            .iter()
            .map(BaseKey::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("- {}: {}\n", panel.title, if ids.is_empty() { "(empty)" } else { ids.as_str() }));
    }
    if summary.content_entries > 0 {
        out.push_str(&format!(
            "\nIncludes {} cached content entries.\n",
            summary.content_entries
        ));
    }
    out
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>, BtcError> {
    serde_json::to_vec_pretty(value).map_err(|err| BtcError::Serialization(err.to_string()))
}

fn to_compact_json(value: &Value) -> Result<String, BtcError> {
    serde_json::to_string(value).map_err(|err| BtcError::Serialization(err.to_string()))
}
