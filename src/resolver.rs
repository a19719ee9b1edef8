use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::{Catalog, normalize_raw_resource};
use crate::config::DEFAULT_COMPLETENESS_THRESHOLD;
use crate::domain::{ResourceMetadata, ResourcePointer};
use crate::error::BtcError;
use crate::ingredients::GeneratorRegistry;
use crate::remote::{CatalogClient, CatalogFilters};

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Catalog records with more ingredients than this are returned as-is.
    pub completeness_threshold: usize,
    pub stage: String,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            stage: "prod".to_string(),
        }
    }
}

/// Local-first, remote-fallback metadata resolution.
pub struct MetadataResolver<C: CatalogClient> {
    catalog: Catalog,
    client: Arc<C>,
    generators: GeneratorRegistry,
    options: ResolverOptions,
}

impl<C: CatalogClient> MetadataResolver<C> {
    pub fn new(
        catalog: Catalog,
        client: Arc<C>,
        generators: GeneratorRegistry,
        options: ResolverOptions,
    ) -> Self {
        Self {
            catalog,
            client,
            generators,
            options,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn resolve(&self, pointer: &ResourcePointer) -> Result<ResourceMetadata, BtcError> {
        let key = pointer.base_key()?;
        let existing = self.catalog.get(&key)?;
        if let Some(existing) = &existing {
            if existing.ingredients.len() > self.options.completeness_threshold {
                debug!(resource = %key, "catalog record complete; skipping remote");
                return Ok(existing.clone());
            }
        }

        let raw = match self.search(pointer) {
            Ok(raw) => raw,
            Err(err) => match existing {
                Some(existing) if !existing.version.is_empty() => {
                    warn!(resource = %key, error = %err, "remote lookup failed; using local record");
                    return Ok(existing);
                }
                _ => return Err(err),
            },
        };

        let mut fresh = normalize_raw_resource(&raw, &pointer.server)?;
        // The catalog may report a differently-cased id; keep the caller's identity.
        fresh.pointer = pointer.clone();

        match self.client.enrich_metadata(&raw) {
            Ok(enrichment) => {
                fresh.readme = enrichment.readme;
                fresh.license = enrichment.license;
            }
            Err(err) => warn!(resource = %key, error = %err, "metadata enrichment failed"),
        }

        if let Some(generator) = self.generators.get(&fresh.resource_type) {
            match generator.generate(&fresh, self.client.as_ref()) {
                Ok(ingredients) => {
                    debug!(resource = %key, count = ingredients.len(), "generated ingredients");
                    fresh.ingredients = ingredients;
                }
                Err(err) => warn!(
                    resource = %key,
                    error = %err,
                    "ingredient generation failed; keeping catalog ingredients"
                ),
            }
        }

        let merged = match existing {
            Some(mut existing) => {
                existing.merge_from(fresh);
                existing
            }
            None => fresh,
        };
        if merged.version.is_empty() {
            return Err(BtcError::UnreleasedResource(key.to_string()));
        }
        self.catalog.put(&merged)?;
        Ok(merged)
    }

    /// Resolves every pointer, collecting failures instead of stopping at the first.
    pub fn resolve_all(
        &self,
        pointers: &[ResourcePointer],
    ) -> (Vec<ResourceMetadata>, Vec<(ResourcePointer, BtcError)>) {
        let mut resolved = Vec::new();
        let mut failed = Vec::new();
        for pointer in pointers {
            match self.resolve(pointer) {
                Ok(metadata) => resolved.push(metadata),
                Err(err) => failed.push((pointer.clone(), err)),
            }
        }
        (resolved, failed)
    }

    fn search(&self, pointer: &ResourcePointer) -> Result<Value, BtcError> {
        let filters = CatalogFilters::for_pointer(pointer, &self.options.stage);
        let results = self.client.search_catalog(&filters)?;
        let repo = pointer.repo_name().to_lowercase();
        results
            .into_iter()
            .find(|entry| {
                let owner_matches = entry
                    .get("owner")
                    .and_then(Value::as_str)
                    .map(|owner| owner.eq_ignore_ascii_case(&pointer.owner))
                    .unwrap_or(true);
                let name_matches = entry
                    .get("name")
                    .and_then(Value::as_str)
                    .map(|name| name.to_lowercase() == repo)
                    .unwrap_or(false);
                owner_matches && name_matches
            })
            .ok_or_else(|| BtcError::ResourceNotFound(pointer.to_string()))
    }
}
