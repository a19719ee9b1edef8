use std::sync::Arc;

use serde_json::Value;

use crate::domain::{BaseKey, ContentStructure, Ingredient, ResourceMetadata, ResourcePointer};
use crate::error::BtcError;
use crate::store::KeyValueStore;

/// Local catalog of resource metadata, keyed by base key only.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn KeyValueStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &BaseKey) -> Result<Option<ResourceMetadata>, BtcError> {
        let Some(value) = self.store.get(key.as_str())? else {
            return Ok(None);
        };
        let metadata = serde_json::from_value(value)
            .map_err(|err| BtcError::MalformedRecord(format!("{key}: {err}")))?;
        Ok(Some(metadata))
    }

    pub fn put(&self, metadata: &ResourceMetadata) -> Result<BaseKey, BtcError> {
        let key = metadata.base_key()?;
        let value =
            serde_json::to_value(metadata).map_err(|err| BtcError::Serialization(err.to_string()))?;
        self.store.set(key.as_str(), &value)?;
        Ok(key)
    }

    /// Inserts or merges into the existing record.
    pub fn upsert(&self, metadata: ResourceMetadata) -> Result<ResourceMetadata, BtcError> {
        let key = metadata.base_key()?;
        let merged = match self.get(&key)? {
            Some(mut existing) => {
                existing.merge_from(metadata);
                existing
            }
            None => metadata,
        };
        self.put(&merged)?;
        Ok(merged)
    }

    pub fn keys(&self) -> Result<Vec<BaseKey>, BtcError> {
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter_map(|key| key.parse().ok())
            .collect())
    }
}

/// Maps a raw catalog payload of any known shape onto [`ResourceMetadata`].
///
/// This is the only place that inspects raw catalog JSON. Accepted shapes are
/// Door43 catalog search entries (`name`, `owner`, `release.tag_name`,
/// `ingredients`) and the flattened shape produced by [`ResourceMetadata`]
/// serialization itself.
pub fn normalize_raw_resource(raw: &Value, server: &str) -> Result<ResourceMetadata, BtcError> {
    if let Ok(metadata) = serde_json::from_value::<ResourceMetadata>(raw.clone()) {
        if metadata.base_key().is_ok() && !metadata.version.is_empty() {
            return Ok(metadata);
        }
    }

    let owner = str_field(raw, &["owner"])
        .or_else(|| str_at(raw, &["repo", "owner", "login"]))
        .or_else(|| str_at(raw, &["repo", "owner", "username"]))
        .ok_or_else(|| BtcError::MalformedRecord("missing owner".to_string()))?;
    let name = str_field(raw, &["name"]).or_else(|| str_at(raw, &["repo", "name"]));
    let language = str_field(raw, &["language"])
        .or_else(|| name.as_deref().and_then(|name| name.split_once('_')).map(|(lang, _)| lang.to_string()))
        .ok_or_else(|| BtcError::MalformedRecord(format!("{owner}: missing language")))?;
    let resource_id = str_field(raw, &["abbreviation", "resourceId"])
        .or_else(|| {
            name.as_deref()
                .map(|name| name.split_once('_').map(|(_, id)| id).unwrap_or(name).to_string())
        })
        .ok_or_else(|| BtcError::MalformedRecord(format!("{owner}/{language}: missing name")))?
        .to_lowercase();

    let pointer = ResourcePointer::new(server, &owner, &language, &resource_id);
    let base_key = pointer.base_key()?;

    let version = str_at(raw, &["release", "tag_name"])
        .or_else(|| {
            let is_tag = str_field(raw, &["ref_type"]).map(|kind| kind == "tag").unwrap_or(false);
            is_tag.then(|| str_field(raw, &["branch_or_tag_name"])).flatten()
        })
        .or_else(|| str_field(raw, &["version"]))
        .filter(|version| !version.is_empty())
        .ok_or_else(|| BtcError::UnreleasedResource(base_key.to_string()))?;

    let subject = str_field(raw, &["subject"]).unwrap_or_default();
    let (resource_type, content_structure) = classify_subject(&subject);
    let title = str_field(raw, &["title"]).unwrap_or_else(|| resource_id.clone());

    let ingredients = raw
        .get("ingredients")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(normalize_ingredient).collect())
        .unwrap_or_default();

    Ok(ResourceMetadata {
        pointer,
        title,
        subject,
        resource_type: resource_type.to_string(),
        format: str_field(raw, &["format", "metadata_type"]),
        content_structure,
        version,
        released_at: str_field(raw, &["released"]),
        language_title: str_field(raw, &["language_title"]),
        language_direction: str_field(raw, &["language_direction"]),
        license: None,
        readme: None,
        ingredients,
    })
}

/// Maps a catalog subject onto `(resource type, content structure)`.
pub fn classify_subject(subject: &str) -> (&'static str, ContentStructure) {
    let lowered = subject.to_lowercase();
    if lowered.contains("words links") {
        ("words-links", ContentStructure::Book)
    } else if lowered.contains("translation words") {
        ("words", ContentStructure::Entry)
    } else if lowered.contains("translation academy") {
        ("academy", ContentStructure::Entry)
    } else if lowered.contains("notes") {
        ("notes", ContentStructure::Book)
    } else if lowered.contains("questions") {
        ("questions", ContentStructure::Book)
    } else if lowered.contains("bible") || lowered.contains("testament") {
        ("scripture", ContentStructure::Book)
    } else {
        ("unknown", ContentStructure::Book)
    }
}

fn normalize_ingredient(raw: &Value) -> Option<Ingredient> {
    let identifier = str_field(raw, &["identifier"])?;
    let categories = raw
        .get("categories")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Some(Ingredient {
        title: str_field(raw, &["title"]).unwrap_or_else(|| identifier.clone()),
        path: str_field(raw, &["path"])
            .map(|path| path.trim_start_matches("./").to_string())
            .unwrap_or_default(),
        identifier,
        categories,
    })
}

fn str_field(raw: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| raw.get(*name).and_then(Value::as_str))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn str_at(raw: &Value, path: &[&str]) -> Option<String> {
    let mut current = raw;
    for segment in path {
        current = current.get(*segment)?;
    }
    current
        .as_str()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
