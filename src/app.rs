use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::ResolvedConfig;
use crate::content::ContentCache;
use crate::domain::{BaseKey, InstanceKey, ResourceMetadata, ResourcePointer};
use crate::error::BtcError;
use crate::fetcher::{
    ContentFetcher, DownloadProgress, FetcherEvent, FetcherOptions, FetcherState, StartPayload,
};
use crate::ingredients::GeneratorRegistry;
use crate::package::{
    ExportOptions, ExportSummary, ImportOutcome, import_collection, spawn_export,
};
use crate::remote::CatalogClient;
use crate::resolver::{MetadataResolver, ResolverOptions};
use crate::store::{FsStore, KeyValueStore, MemoryStore, StoreLayout, write_bytes_atomic};
use crate::workspace::{Panel, TableRemoval, Workspace, WorkspaceState};

const WAIT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    pub resource: BaseKey,
    pub title: String,
    pub version: String,
    pub ingredients: usize,
    pub added_to_table: bool,
    pub instance: Option<InstanceKey>,
    pub panel: Option<String>,
    pub fetch_started: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResult {
    pub resource: BaseKey,
    #[serde(flatten)]
    pub removal: TableRemoval,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelResult {
    pub action: String,
    pub changed: bool,
    pub panels: Vec<Panel>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub path: String,
    pub bytes: usize,
    pub summary: ExportSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub path: String,
    #[serde(flatten)]
    pub outcome: ImportOutcome,
    pub fetch_started: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub state: FetcherState,
    pub resources: Vec<String>,
    #[serde(flatten)]
    pub progress: DownloadProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedResult {
    pub added: Vec<AddResult>,
    pub failed: Vec<SeedFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedFailure {
    pub resource: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// The three key-value stores the engine works against.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn KeyValueStore>,
    pub content: Arc<dyn KeyValueStore>,
    pub workspace: Arc<dyn KeyValueStore>,
}

impl Stores {
    pub fn open(layout: &StoreLayout) -> Result<Self, BtcError> {
        let open = |root: Utf8PathBuf| -> Result<Arc<dyn KeyValueStore>, BtcError> {
            let store = FsStore::new(root);
            store.ensure_root()?;
            Ok(Arc::new(store))
        };
        Ok(Self {
            catalog: open(layout.catalog_dir())?,
            content: open(layout.content_dir())?,
            workspace: open(layout.workspace_dir())?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            catalog: Arc::new(MemoryStore::new()),
            content: Arc::new(MemoryStore::new()),
            workspace: Arc::new(MemoryStore::new()),
        }
    }
}

/// Ties the workspace, resolver, package codec and fetcher together for
/// foreground callers.
pub struct App<C: CatalogClient + 'static> {
    config: ResolvedConfig,
    state: WorkspaceState,
    resolver: MetadataResolver<C>,
    content: ContentCache,
    fetcher: Option<ContentFetcher>,
}

impl<C: CatalogClient + 'static> App<C> {
    pub fn new(config: ResolvedConfig, client: Arc<C>, stores: Stores) -> Result<Self, BtcError> {
        Self::with_generators(config, client, stores, GeneratorRegistry::with_defaults())
    }

    pub fn with_generators(
        config: ResolvedConfig,
        client: Arc<C>,
        stores: Stores,
        generators: GeneratorRegistry,
    ) -> Result<Self, BtcError> {
        let state = WorkspaceState::load_or_create(stores.workspace)?;
        let resolver = MetadataResolver::new(
            Catalog::new(stores.catalog),
            client,
            generators,
            ResolverOptions {
                completeness_threshold: config.completeness_threshold,
                stage: config.stage.clone(),
            },
        );
        Ok(Self {
            config,
            state,
            resolver,
            content: ContentCache::new(stores.content),
            fetcher: None,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        self.state.workspace()
    }

    pub fn catalog(&self) -> &Catalog {
        self.resolver.catalog()
    }

    pub fn content(&self) -> &ContentCache {
        &self.content
    }

    pub fn resolve_resource(
        &self,
        pointer: &ResourcePointer,
        sink: &dyn ProgressSink,
    ) -> Result<ResourceMetadata, BtcError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {pointer}"),
            elapsed: None,
        });
        let start = Instant::now();
        let metadata = self.resolver.resolve(pointer)?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} ingredients", metadata.ingredients.len()),
            elapsed: Some(start.elapsed()),
        });
        Ok(metadata)
    }

    /// Resolves `pointer`, adds it to the resource table and, when `panel` is
    /// given, places a new instance of it there.
    pub fn add_resource(
        &mut self,
        pointer: &ResourcePointer,
        panel: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> Result<AddResult, BtcError> {
        let metadata = self.resolve_resource(pointer, sink)?;
        let resource = metadata.base_key()?;
        let added_to_table = self.state.add_resource_to_table(&metadata)?;

        let instance = match panel {
            Some(panel_id) => {
                let placed = self.state.place_resource(&resource, panel_id, None)?;
                if placed.is_none() {
                    warn!(panel = panel_id, resource = %resource, "unknown panel; resource left unplaced");
                }
                placed
            }
            None => None,
        };

        let fetch_started = if self.config.auto_fetch && !metadata.ingredients.is_empty() {
            self.start_fetch(vec![resource.to_string()], Some(metadata.ingredients.len()))?
        } else {
            false
        };

        Ok(AddResult {
            title: metadata.title.clone(),
            version: metadata.version.clone(),
            ingredients: metadata.ingredients.len(),
            added_to_table,
            panel: instance.as_ref().and(panel.map(str::to_string)),
            instance,
            fetch_started,
            resource,
        })
    }

    pub fn remove_resource(&mut self, resource: &BaseKey) -> Result<RemoveResult, BtcError> {
        let removal = self.state.remove_resource_from_table(resource)?;
        Ok(RemoveResult {
            resource: resource.clone(),
            removal,
        })
    }

    pub fn create_panel(&mut self, id: &str, name: &str) -> Result<PanelResult, BtcError> {
        let changed = self.state.add_panel(id, name)?;
        Ok(self.panel_result("create", changed))
    }

    pub fn assign_to_panel(
        &mut self,
        key: &InstanceKey,
        panel_id: &str,
        index: Option<usize>,
    ) -> Result<PanelResult, BtcError> {
        let changed = self.state.assign_to_panel(key, panel_id, index)?;
        Ok(self.panel_result("assign", changed))
    }

    pub fn remove_from_panel(
        &mut self,
        key: &InstanceKey,
        panel_id: &str,
    ) -> Result<PanelResult, BtcError> {
        let changed = self.state.remove_from_panel(key, panel_id)?;
        Ok(self.panel_result("remove", changed))
    }

    pub fn move_between_panels(
        &mut self,
        key: &InstanceKey,
        from: &str,
        to: &str,
        index: Option<usize>,
    ) -> Result<PanelResult, BtcError> {
        let changed = self.state.move_between_panels(key, from, to, index)?;
        Ok(self.panel_result("move", changed))
    }

    pub fn reorder_in_panel(
        &mut self,
        key: &InstanceKey,
        panel_id: &str,
        index: usize,
    ) -> Result<PanelResult, BtcError> {
        let changed = self.state.reorder_in_panel(key, panel_id, index)?;
        Ok(self.panel_result("reorder", changed))
    }

    pub fn set_active(&mut self, panel_id: &str, index: usize) -> Result<PanelResult, BtcError> {
        let changed = self.state.set_active(panel_id, index)?;
        Ok(self.panel_result("activate", changed))
    }

    pub fn export_collection(
        &self,
        path: &Utf8Path,
        options: ExportOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ExportResult, BtcError> {
        sink.event(ProgressEvent {
            message: "phase=Export; packaging collection".to_string(),
            elapsed: None,
        });
        let start = Instant::now();
        let receiver = spawn_export(
            self.workspace().clone(),
            self.catalog().clone(),
            self.content.clone(),
            options,
        );
        let archive = receiver
            .recv()
            .map_err(|_| BtcError::Archive("export thread exited without a result".to_string()))??;

        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| BtcError::Filesystem(err.to_string()))?;
        }
        write_bytes_atomic(path, &archive.bytes)?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; wrote {path}"),
            elapsed: Some(start.elapsed()),
        });

        Ok(ExportResult {
            path: path.to_string(),
            bytes: archive.bytes.len(),
            summary: archive.summary,
        })
    }

    /// Imports a collection archive and makes its layout the current workspace.
    pub fn import_collection(
        &mut self,
        path: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<ImportResult, BtcError> {
        sink.event(ProgressEvent {
            message: format!("phase=Import; reading {path}"),
            elapsed: None,
        });
        let start = Instant::now();
        let bytes = fs::read(path).map_err(|err| BtcError::Filesystem(format!("{path}: {err}")))?;
        let outcome = import_collection(&bytes, self.catalog(), &self.content)?;
        for warning in &outcome.warnings {
            warn!("{warning}");
        }
        self.state.replace(outcome.workspace.clone())?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Import; {} metadata, {} content entries",
                outcome.metadata_imported, outcome.content_imported
            ),
            elapsed: Some(start.elapsed()),
        });

        let keys = self.table_keys();
        let fetch_started = if self.config.auto_fetch && !keys.is_empty() {
            self.start_fetch(keys, None)?
        } else {
            false
        };

        Ok(ImportResult {
            path: path.to_string(),
            outcome,
            fetch_started,
        })
    }

    /// Starts a background download session. Returns false when one is
    /// already running.
    pub fn start_fetch(
        &mut self,
        resource_keys: Vec<String>,
        total_ingredients: Option<usize>,
    ) -> Result<bool, BtcError> {
        let skip_existing = self.config.skip_existing;
        let fetcher = self.fetcher();
        if fetcher.state() == FetcherState::Downloading {
            debug!("download already in progress");
            return Ok(false);
        }
        fetcher.drain_events();
        fetcher.start(StartPayload {
            resource_keys,
            skip_existing,
            total_ingredients,
        })
    }

    pub fn stop_fetch(&self) {
        if let Some(fetcher) = &self.fetcher {
            fetcher.stop();
        }
    }

    pub fn fetch_state(&self) -> FetcherState {
        self.fetcher
            .as_ref()
            .map(ContentFetcher::state)
            .unwrap_or_default()
    }

    /// Downloads content for `resources` (every table resource when empty)
    /// and blocks until the session ends.
    pub fn download(
        &mut self,
        resources: Vec<String>,
        skip_existing: Option<bool>,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, BtcError> {
        let resources = if resources.is_empty() {
            self.table_keys()
        } else {
            resources
        };
        // Let any session started by an earlier add or import finish first.
        if self.fetch_state() == FetcherState::Downloading {
            self.wait_for_downloads(sink)?;
        }
        let skip_existing = skip_existing.unwrap_or(self.config.skip_existing);
        let fetcher = self.fetcher();
        fetcher.drain_events();
        fetcher.start(StartPayload {
            resource_keys: resources.clone(),
            skip_existing,
            total_ingredients: None,
        })?;
        let progress = self.wait_for_downloads(sink)?;
        Ok(DownloadResult {
            state: self.fetch_state(),
            resources,
            progress,
        })
    }

    /// Blocks until the running download session, if any, reaches a
    /// terminal state.
    pub fn wait_for_downloads(&self, sink: &dyn ProgressSink) -> Result<DownloadProgress, BtcError> {
        let Some(fetcher) = &self.fetcher else {
            return Ok(DownloadProgress::default());
        };
        let start = Instant::now();
        fetcher.wait_for_terminal(WAIT_POLL, |event| match event {
            FetcherEvent::Progress(progress) => sink.event(ProgressEvent {
                message: format!(
                    "phase=Download; {}/{} ({}%) {}",
                    progress.processed(),
                    progress.total_ingredients,
                    progress.overall_progress_percent,
                    progress.current_ingredient.as_deref().unwrap_or("")
                ),
                elapsed: Some(start.elapsed()),
            }),
            FetcherEvent::Complete(progress) => {
                for skipped in &progress.skipped_resources {
                    sink.event(ProgressEvent {
                        message: format!("phase=Download; skipped {}: {}", skipped.resource, skipped.reason),
                        elapsed: None,
                    });
                }
            }
            _ => {}
        })
    }

    /// Adds every resource named in the config, collecting failures.
    pub fn seed_from_config(&mut self, sink: &dyn ProgressSink) -> Result<SeedResult, BtcError> {
        let seeds = self.config.resources.clone();
        let mut added = Vec::new();
        let mut failed = Vec::new();
        for seed in seeds {
            match self.add_resource(&seed.pointer, seed.panel.as_deref(), sink) {
                Ok(result) => added.push(result),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(resource = %seed.pointer, error = %err, "failed to seed resource");
                    failed.push(SeedFailure {
                        resource: seed.pointer.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(SeedResult { added, failed })
    }

    fn fetcher(&mut self) -> &ContentFetcher {
        let client = self.resolver.client().clone();
        let catalog = self.resolver.catalog().clone();
        let content = self.content.clone();
        let concurrency = self.config.concurrency;
        self.fetcher.get_or_insert_with(|| {
            ContentFetcher::spawn(client, catalog, content, FetcherOptions { concurrency })
        })
    }

    fn table_keys(&self) -> Vec<String> {
        self.workspace()
            .table()
            .map(|(key, _)| key.to_string())
            .collect()
    }

    fn panel_result(&self, action: &str, changed: bool) -> PanelResult {
        PanelResult {
            action: action.to_string(),
            changed,
            panels: self.workspace().panels.clone(),
        }
    }
}
