use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{BaseKey, Ingredient, ResourceMetadata};
use crate::error::BtcError;
use crate::store::KeyValueStore;

/// Key of one cached content unit: `<type>:<owner>/<language>/<resourceId>:<unit>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub kind: String,
    pub base_key: BaseKey,
    pub unit: String,
}

impl ContentKey {
    pub fn for_ingredient(metadata: &ResourceMetadata, ingredient: &Ingredient) -> Result<Self, BtcError> {
        Ok(Self {
            kind: metadata.content_structure.as_str().to_string(),
            base_key: metadata.base_key()?,
            unit: ingredient.identifier.clone(),
        })
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (kind, rest) = value.split_once(':')?;
        let (base, unit) = rest.rsplit_once(':')?;
        Some(Self {
            kind: kind.to_string(),
            base_key: base.parse().ok()?,
            unit: unit.to_string(),
        })
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.base_key, self.unit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEntry {
    pub key: String,
    pub resource_key: String,
    pub ingredient: String,
    pub version: String,
    pub content: String,
    pub cached_at: String,
}

/// Cached ingredient content shared by the fetcher and the package codec.
#[derive(Clone)]
pub struct ContentCache {
    store: Arc<dyn KeyValueStore>,
}

impl ContentCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn contains(&self, key: &ContentKey) -> Result<bool, BtcError> {
        self.store.contains(&key.to_string())
    }

    pub fn get(&self, key: &ContentKey) -> Result<Option<ContentEntry>, BtcError> {
        let Some(value) = self.store.get(&key.to_string())? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| BtcError::Store(format!("corrupt content entry {key}: {err}")))
    }

    pub fn put(
        &self,
        key: &ContentKey,
        version: &str,
        content: String,
    ) -> Result<ContentEntry, BtcError> {
        let entry = ContentEntry {
            key: key.to_string(),
            resource_key: key.base_key.to_string(),
            ingredient: key.unit.clone(),
            version: version.to_string(),
            content,
            cached_at: chrono::Utc::now().to_rfc3339(),
        };
        let value =
            serde_json::to_value(&entry).map_err(|err| BtcError::Serialization(err.to_string()))?;
        self.store.set(&entry.key, &value)?;
        Ok(entry)
    }

    /// Ingredient keys of `metadata` that are not cached yet.
    pub fn missing_ingredients<'a>(
        &self,
        metadata: &'a ResourceMetadata,
    ) -> Result<Vec<(ContentKey, &'a Ingredient)>, BtcError> {
        let mut missing = Vec::new();
        for ingredient in &metadata.ingredients {
            let key = ContentKey::for_ingredient(metadata, ingredient)?;
            if !self.contains(&key)? {
                missing.push((key, ingredient));
            }
        }
        Ok(missing)
    }
}
