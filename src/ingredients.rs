//! Ingredient generators: derive a resource's ingredient list from its
//! release archive when the catalog's own list is missing or too coarse.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::domain::{Ingredient, ResourceMetadata};
use crate::error::BtcError;
use crate::fs_util::read_zip_entries;
use crate::remote::CatalogClient;

pub trait IngredientsGenerator: Send + Sync {
    fn generate(
        &self,
        metadata: &ResourceMetadata,
        client: &dyn CatalogClient,
    ) -> Result<Vec<Ingredient>, BtcError>;
}

/// Generators by resource type, handed to the resolver at construction.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn IngredientsGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translation words (one markdown file per entry) and translation academy
    /// (one directory per entry with a `title.md`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("words", ReleaseArchiveGenerator::new(ArchiveLayout::FilePerEntry));
        registry.register(
            "academy",
            ReleaseArchiveGenerator::new(ArchiveLayout::DirectoryPerEntry),
        );
        registry
    }

    pub fn register<G>(&mut self, resource_type: &str, generator: G)
    where
        G: IngredientsGenerator + 'static,
    {
        self.generators
            .insert(resource_type.to_string(), Arc::new(generator));
    }

    pub fn get(&self, resource_type: &str) -> Option<&Arc<dyn IngredientsGenerator>> {
        self.generators.get(resource_type)
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveLayout {
    /// `bible/kt/god.md` is the entry `bible/kt/god`.
    FilePerEntry,
    /// `translate/figs-metaphor/title.md` names the entry `translate/figs-metaphor`.
    DirectoryPerEntry,
}

#[derive(Debug, Clone)]
pub struct ReleaseArchiveGenerator {
    layout: ArchiveLayout,
}

impl ReleaseArchiveGenerator {
    pub fn new(layout: ArchiveLayout) -> Self {
        Self { layout }
    }

    /// Builds ingredients from already-downloaded archive bytes.
    pub fn ingredients_from_archive(&self, bytes: &[u8]) -> Result<Vec<Ingredient>, BtcError> {
        let entries = read_zip_entries(bytes)?;
        let files = strip_archive_root(entries);
        let ingredients = match self.layout {
            ArchiveLayout::FilePerEntry => file_entries(&files),
            ArchiveLayout::DirectoryPerEntry => directory_entries(&files),
        };
        if ingredients.is_empty() {
            return Err(BtcError::Generation(
                "release archive contains no markdown entries".to_string(),
            ));
        }
        Ok(ingredients)
    }
}

impl IngredientsGenerator for ReleaseArchiveGenerator {
    fn generate(
        &self,
        metadata: &ResourceMetadata,
        client: &dyn CatalogClient,
    ) -> Result<Vec<Ingredient>, BtcError> {
        let bytes = client.download_release_archive(
            &metadata.pointer.owner,
            &metadata.pointer.repo_name(),
            &metadata.version,
        )?;
        self.ingredients_from_archive(&bytes)
    }
}

/// First heading line of a markdown document, without the `#` markers.
pub fn heading_title(text: &str) -> Option<String> {
    static HEADING: OnceLock<Option<Regex>> = OnceLock::new();
    let heading = HEADING
        .get_or_init(|| Regex::new(r"^\s*#{1,6}\s*(.+?)\s*#*\s*$").ok())
        .as_ref()?;
    let line = text.lines().find(|line| !line.trim().is_empty())?;
    heading
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|title| title.as_str().to_string())
}

// Release archives wrap everything in a single `<repo>/` directory.
fn strip_archive_root(entries: BTreeMap<String, Vec<u8>>) -> BTreeMap<String, Vec<u8>> {
    let mut roots = entries
        .keys()
        .filter_map(|name| name.split_once('/').map(|(root, _)| root));
    let first = roots.next().map(str::to_string);
    let single_root = match &first {
        Some(root) => entries.keys().all(|name| name.starts_with(&format!("{root}/"))),
        None => false,
    };
    if !single_root {
        return entries;
    }
    let prefix = format!("{}/", first.unwrap_or_default());
    entries
        .into_iter()
        .filter_map(|(name, data)| name.strip_prefix(&prefix).map(|rest| (rest.to_string(), data)))
        .collect()
}

fn is_entry_markdown(path: &str) -> bool {
    let is_markdown = path.ends_with(".md");
    let top_level = !path.contains('/');
    is_markdown && !top_level
}

fn file_entries(files: &BTreeMap<String, Vec<u8>>) -> Vec<Ingredient> {
    files
        .iter()
        .filter(|(path, _)| is_entry_markdown(path))
        .map(|(path, data)| {
            let identifier = path.trim_end_matches(".md").to_string();
            let text = String::from_utf8_lossy(data);
            let fallback = identifier.rsplit('/').next().unwrap_or(&identifier).to_string();
            let categories = identifier
                .rsplit_once('/')
                .map(|(dir, _)| dir.rsplit('/').next().unwrap_or(dir).to_string())
                .into_iter()
                .collect();
            Ingredient {
                title: heading_title(&text).unwrap_or(fallback),
                path: path.clone(),
                identifier,
                categories,
            }
        })
        .collect()
}

fn directory_entries(files: &BTreeMap<String, Vec<u8>>) -> Vec<Ingredient> {
    files
        .iter()
        .filter_map(|(path, data)| {
            let dir = path.strip_suffix("/title.md")?;
            let text = String::from_utf8_lossy(data);
            let title = heading_title(&text)
                .or_else(|| text.lines().find(|line| !line.trim().is_empty()).map(|line| line.trim().to_string()))
                .unwrap_or_else(|| dir.rsplit('/').next().unwrap_or(dir).to_string());
            let categories = dir
                .split_once('/')
                .map(|(top, _)| vec![top.to_string()])
                .unwrap_or_default();
            Some(Ingredient {
                identifier: dir.to_string(),
                title,
                path: dir.to_string(),
                categories,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_util::ZipBuilder;

    fn archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = ZipBuilder::new();
        for (name, content) in files {
            builder.add_file(name, content.as_bytes()).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn heading_title_strips_markers() {
        assert_eq!(heading_title("\n# God, gods #\n\n## Definition"), Some("God, gods".to_string()));
        assert_eq!(heading_title("plain text"), None);
    }

    #[test]
    fn file_per_entry_layout() {
        let bytes = archive(&[
            ("en_tw/README.md", "# Translation Words"),
            ("en_tw/bible/kt/god.md", "# God\n\nbody"),
            ("en_tw/bible/names/abraham.md", "# Abraham"),
        ]);
        let generator = ReleaseArchiveGenerator::new(ArchiveLayout::FilePerEntry);
        let ingredients = generator.ingredients_from_archive(&bytes).unwrap();
        assert_eq!(ingredients.len(), 2);
        let god = ingredients.iter().find(|item| item.identifier == "bible/kt/god").unwrap();
        assert_eq!(god.title, "God");
        assert_eq!(god.categories, vec!["kt".to_string()]);
    }

    #[test]
    fn directory_per_entry_layout() {
        let bytes = archive(&[
            ("en_ta/translate/figs-metaphor/title.md", "Metaphor\n"),
            ("en_ta/translate/figs-metaphor/01.md", "body"),
            ("en_ta/checking/intro/title.md", "# Introduction to Checking"),
        ]);
        let generator = ReleaseArchiveGenerator::new(ArchiveLayout::DirectoryPerEntry);
        let ingredients = generator.ingredients_from_archive(&bytes).unwrap();
        assert_eq!(ingredients.len(), 2);
        let metaphor = ingredients
            .iter()
            .find(|item| item.identifier == "translate/figs-metaphor")
            .unwrap();
        assert_eq!(metaphor.title, "Metaphor");
        assert_eq!(metaphor.categories, vec!["translate".to_string()]);
    }

    #[test]
    fn empty_archive_is_a_generation_error() {
        let bytes = archive(&[("en_tw/README.md", "# Readme")]);
        let generator = ReleaseArchiveGenerator::new(ArchiveLayout::FilePerEntry);
        assert!(matches!(
            generator.ingredients_from_archive(&bytes),
            Err(BtcError::Generation(_))
        ));
    }
}
