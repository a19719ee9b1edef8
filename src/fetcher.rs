//! Background content fetcher.
//!
//! A controller thread owns the session state machine
//! (`idle -> downloading -> complete | error | idle`) and talks to callers only
//! through typed messages. Each session plans the missing ingredients, then
//! drains them with a bounded pool of scoped worker threads. Cancellation is
//! checked at every ingredient boundary.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::DEFAULT_CONCURRENCY;
use crate::content::{ContentCache, ContentKey};
use crate::domain::{BaseKey, InstanceKey};
use crate::error::BtcError;
use crate::keys::base_key_of;
use crate::remote::CatalogClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetcherState {
    #[default]
    Idle,
    Downloading,
    Complete,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub total_ingredients: usize,
    pub completed_ingredients: usize,
    pub failed_ingredients: usize,
    pub current_resource: Option<String>,
    pub current_ingredient: Option<String>,
    pub overall_progress_percent: u8,
    /// Requested resources that contributed no ingredients to the session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_resources: Vec<SkippedResource>,
}

impl DownloadProgress {
    pub fn processed(&self) -> usize {
        self.completed_ingredients + self.failed_ingredients
    }

    pub fn is_finished(&self) -> bool {
        self.processed() >= self.total_ingredients
    }

    fn refresh_percent(&mut self) {
        self.overall_progress_percent = if self.total_ingredients == 0 {
            100
        } else {
            ((self.processed().min(self.total_ingredients) * 100) / self.total_ingredients) as u8
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedResource {
    pub resource: String,
    pub reason: String,
}

/// `total_ingredients` is a display hint for the snapshot published before
/// planning. The planned total replaces it; completed counts and the
/// percentage never decrease within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub resource_keys: Vec<String>,
    #[serde(default = "default_skip_existing")]
    pub skip_existing: bool,
    #[serde(default)]
    pub total_ingredients: Option<usize>,
}

fn default_skip_existing() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub state: FetcherState,
    pub pending_resources: Vec<String>,
    pub pending_ingredients: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_resources: Vec<SkippedResource>,
}

/// Messages into the fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum FetcherCommand {
    Start(StartPayload),
    Stop,
}

/// Messages out of the fetcher. Progress payloads are full snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum FetcherEvent {
    Progress(DownloadProgress),
    Complete(DownloadProgress),
    Error(ErrorPayload),
    QueueUpdated(QueueSnapshot),
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub concurrency: usize,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FetcherStatus {
    state: FetcherState,
    progress: DownloadProgress,
}

enum Control {
    Command(FetcherCommand),
    Finished { session: u64, progress: DownloadProgress },
    Failed { session: u64, message: String },
    Shutdown,
}

/// Handle to the background fetcher. Dropping it shuts the controller down.
pub struct ContentFetcher {
    control: Sender<Control>,
    events: Receiver<FetcherEvent>,
    status: Arc<Mutex<FetcherStatus>>,
    controller: Option<JoinHandle<()>>,
}

impl ContentFetcher {
    pub fn spawn<C>(
        client: Arc<C>,
        catalog: Catalog,
        content: ContentCache,
        options: FetcherOptions,
    ) -> Self
    where
        C: CatalogClient + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let status = Arc::new(Mutex::new(FetcherStatus::default()));
        let controller = Controller {
            client,
            catalog,
            content,
            concurrency: options.concurrency.max(1),
            events: events_tx,
            control: control_tx.clone(),
            status: status.clone(),
            active: None,
            next_session: 0,
        };
        let handle = thread::Builder::new()
            .name("btc-fetcher".to_string())
            .spawn(move || controller.run(control_rx))
            .ok();
        if handle.is_none() {
            warn!("failed to spawn fetcher thread; fetcher unavailable");
        }
        Self {
            control: control_tx,
            events: events_rx,
            status,
            controller: handle,
        }
    }

    pub fn send(&self, command: FetcherCommand) -> Result<(), BtcError> {
        match command {
            FetcherCommand::Start(payload) => self.start(payload).map(|_| ()),
            FetcherCommand::Stop => self.control(Control::Command(FetcherCommand::Stop)),
        }
    }

    /// Starts a session. Returns false, and does nothing, while one is
    /// already downloading.
    pub fn start(&self, payload: StartPayload) -> Result<bool, BtcError> {
        if self.controller.is_none() {
            return Err(BtcError::FetcherUnavailable);
        }
        {
            let mut status = lock(&self.status);
            if status.state == FetcherState::Downloading {
                debug!("fetch session already running; start ignored");
                return Ok(false);
            }
            status.state = FetcherState::Downloading;
            status.progress = DownloadProgress {
                total_ingredients: payload.total_ingredients.unwrap_or(0),
                ..DownloadProgress::default()
            };
        }
        self.control(Control::Command(FetcherCommand::Start(payload)))?;
        Ok(true)
    }

    /// Cancels the running session, if any. Never fails.
    pub fn stop(&self) {
        let _ = self.send(FetcherCommand::Stop);
    }

    pub fn state(&self) -> FetcherState {
        lock(&self.status).state
    }

    pub fn progress(&self) -> DownloadProgress {
        lock(&self.status).progress.clone()
    }

    pub fn events(&self) -> &Receiver<FetcherEvent> {
        &self.events
    }

    /// Takes every event already queued without blocking.
    pub fn drain_events(&self) -> Vec<FetcherEvent> {
        self.events.try_iter().collect()
    }

    fn control(&self, message: Control) -> Result<(), BtcError> {
        if self.controller.is_none() {
            return Err(BtcError::FetcherUnavailable);
        }
        self.control
            .send(message)
            .map_err(|_| BtcError::FetcherUnavailable)
    }

    /// Blocks until the running session completes, fails or is stopped,
    /// handing every event to `on_event` along the way.
    pub fn wait_for_terminal<F>(&self, timeout: Duration, mut on_event: F) -> Result<DownloadProgress, BtcError>
    where
        F: FnMut(&FetcherEvent),
    {
        loop {
            let event = match self.events.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    if self.state() != FetcherState::Downloading {
                        return Ok(self.progress());
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return Err(BtcError::FetcherUnavailable),
            };
            on_event(&event);
            match event {
                FetcherEvent::Complete(progress) => return Ok(progress),
                FetcherEvent::Error(payload) => return Err(BtcError::FetchSession(payload.message)),
                FetcherEvent::QueueUpdated(snapshot) if snapshot.state == FetcherState::Idle => {
                    return Ok(self.progress());
                }
                _ => {}
            }
        }
    }
}

impl Drop for ContentFetcher {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.controller.take() {
            let _ = handle.join();
        }
    }
}

struct ActiveSession {
    id: u64,
    cancel: Arc<AtomicBool>,
    queue: Arc<Mutex<VecDeque<Job>>>,
    handle: Option<JoinHandle<()>>,
}

struct Controller<C: CatalogClient> {
    client: Arc<C>,
    catalog: Catalog,
    content: ContentCache,
    concurrency: usize,
    events: Sender<FetcherEvent>,
    control: Sender<Control>,
    status: Arc<Mutex<FetcherStatus>>,
    active: Option<ActiveSession>,
    next_session: u64,
}

impl<C: CatalogClient + 'static> Controller<C> {
    fn run(mut self, control: Receiver<Control>) {
        while let Ok(message) = control.recv() {
            match message {
                Control::Command(FetcherCommand::Start(payload)) => self.start(payload),
                Control::Command(FetcherCommand::Stop) => self.stop(),
                Control::Finished { session, progress } => self.finish(session, progress),
                Control::Failed { session, message } => self.fail(session, message),
                Control::Shutdown => {
                    self.stop();
                    break;
                }
            }
        }
        debug!("fetcher controller exited");
    }

    fn start(&mut self, payload: StartPayload) {
        if self.active.is_some() {
            debug!("fetch session already running; start ignored");
            return;
        }
        self.next_session += 1;
        let id = self.next_session;
        let cancel = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(Mutex::new(VecDeque::new()));

        lock(&self.status).state = FetcherState::Downloading;

        let session = Session {
            id,
            payload,
            client: self.client.clone(),
            catalog: self.catalog.clone(),
            content: self.content.clone(),
            concurrency: self.concurrency,
            cancel: cancel.clone(),
            queue: queue.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
        };
        let control = self.control.clone();
        let handle = thread::Builder::new()
            .name(format!("btc-fetch-{id}"))
            .spawn(move || {
                let message = match panic::catch_unwind(AssertUnwindSafe(|| session.run())) {
                    Ok(progress) => Control::Finished {
                        session: id,
                        progress,
                    },
                    Err(_) => Control::Failed {
                        session: id,
                        message: "fetch session panicked".to_string(),
                    },
                };
                let _ = control.send(message);
            });

        match handle {
            Ok(handle) => {
                debug!(session = id, "fetch session started");
                self.active = Some(ActiveSession {
                    id,
                    cancel,
                    queue,
                    handle: Some(handle),
                });
            }
            Err(err) => {
                lock(&self.status).state = FetcherState::Error;
                let _ = self.events.send(FetcherEvent::Error(ErrorPayload {
                    message: format!("failed to spawn fetch session: {err}"),
                    resource: None,
                }));
            }
        }
    }

    fn stop(&mut self) {
        {
            // Holding the status lock orders this after any in-flight progress report.
            let mut status = lock(&self.status);
            if let Some(active) = &self.active {
                active.cancel.store(true, Ordering::SeqCst);
                lock(&active.queue).clear();
            }
            status.state = FetcherState::Idle;
            status.progress.current_resource = None;
            status.progress.current_ingredient = None;
        }
        // The session thread is detached; its workers notice the flag at the
        // next ingredient boundary.
        if let Some(active) = self.active.take() {
            debug!(session = active.id, "fetch session stopped");
        }
        let _ = self.events.send(FetcherEvent::QueueUpdated(QueueSnapshot {
            state: FetcherState::Idle,
            pending_resources: Vec::new(),
            pending_ingredients: 0,
            skipped_resources: Vec::new(),
        }));
    }

    fn finish(&mut self, session: u64, progress: DownloadProgress) {
        if !self.is_current(session) {
            return;
        }
        {
            let mut status = lock(&self.status);
            status.state = FetcherState::Complete;
            status.progress = progress.clone();
        }
        self.join_active();
        info!(
            completed = progress.completed_ingredients,
            failed = progress.failed_ingredients,
            total = progress.total_ingredients,
            "fetch session complete"
        );
        let _ = self.events.send(FetcherEvent::Complete(progress));
    }

    fn fail(&mut self, session: u64, message: String) {
        if !self.is_current(session) {
            return;
        }
        lock(&self.status).state = FetcherState::Error;
        self.join_active();
        warn!(error = %message, "fetch session failed");
        let _ = self.events.send(FetcherEvent::Error(ErrorPayload {
            message,
            resource: None,
        }));
    }

    fn is_current(&self, session: u64) -> bool {
        self.active
            .as_ref()
            .map(|active| active.id == session)
            .unwrap_or(false)
    }

    fn join_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Some(handle) = active.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Job {
    resource: BaseKey,
    key: ContentKey,
    ingredient: String,
    owner: String,
    repo: String,
    path: String,
    version: String,
}

struct Session<C: CatalogClient> {
    id: u64,
    payload: StartPayload,
    client: Arc<C>,
    catalog: Catalog,
    content: ContentCache,
    concurrency: usize,
    cancel: Arc<AtomicBool>,
    queue: Arc<Mutex<VecDeque<Job>>>,
    status: Arc<Mutex<FetcherStatus>>,
    events: Sender<FetcherEvent>,
}

struct Plan {
    jobs: Vec<Job>,
    already_cached: usize,
    skipped: Vec<SkippedResource>,
}

impl<C: CatalogClient> Session<C> {
    fn run(&self) -> DownloadProgress {
        if self.payload.total_ingredients.is_some_and(|hint| hint > 0) {
            self.publish(|_| {});
        }

        let Plan {
            jobs,
            already_cached,
            skipped,
        } = self.plan();
        let pending_resources = unique_resources(&jobs);
        let pending_ingredients = jobs.len();
        lock(&self.queue).extend(jobs);

        self.publish(|progress| {
            progress.total_ingredients = already_cached + pending_ingredients;
            progress.completed_ingredients = already_cached;
            progress.skipped_resources = skipped.clone();
        });
        if self.cancelled() {
            return self.snapshot();
        }
        let _ = self.events.send(FetcherEvent::QueueUpdated(QueueSnapshot {
            state: FetcherState::Downloading,
            pending_resources,
            pending_ingredients,
            skipped_resources: skipped,
        }));

        let workers = self.concurrency.min(pending_ingredients);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.work());
            }
        });

        debug!(session = self.id, "fetch session drained");
        self.snapshot()
    }

    /// Resolves every requested resource to its ingredient jobs, counting the
    /// units already cached when `skip_existing` is set. A resource that
    /// cannot be planned is recorded as skipped and the rest carry on.
    fn plan(&self) -> Plan {
        let mut plan = Plan {
            jobs: Vec::new(),
            already_cached: 0,
            skipped: Vec::new(),
        };
        let mut seen = Vec::new();
        for raw in &self.payload.resource_keys {
            let Ok(instance) = raw.parse::<InstanceKey>() else {
                warn!(key = %raw, "skipping invalid resource key");
                plan.skip(raw, "invalid resource key".to_string());
                continue;
            };
            let base = base_key_of(&instance);
            if seen.contains(&base) {
                continue;
            }
            seen.push(base.clone());

            if let Err(err) = self.plan_resource(&base, &mut plan) {
                warn!(resource = %base, error = %err, "resource skipped");
                plan.skip(base.as_str(), err.to_string());
            }
        }
        plan
    }

    fn plan_resource(&self, base: &BaseKey, plan: &mut Plan) -> Result<(), BtcError> {
        let metadata = self
            .catalog
            .get(base)?
            .ok_or_else(|| BtcError::ResourceNotFound(base.to_string()))?;
        let pending = if self.payload.skip_existing {
            self.content.missing_ingredients(&metadata)?
        } else {
            metadata
                .ingredients
                .iter()
                .map(|ingredient| Ok((ContentKey::for_ingredient(&metadata, ingredient)?, ingredient)))
                .collect::<Result<Vec<_>, BtcError>>()?
        };
        plan.already_cached += metadata.ingredients.len() - pending.len();
        for (key, ingredient) in pending {
            let path = if ingredient.path.is_empty() {
                ingredient.identifier.clone()
            } else {
                ingredient.path.clone()
            };
            plan.jobs.push(Job {
                resource: base.clone(),
                key,
                ingredient: ingredient.identifier.clone(),
                owner: metadata.pointer.owner.clone(),
                repo: metadata.pointer.repo_name(),
                path,
                version: metadata.version.clone(),
            });
        }
        Ok(())
    }

    fn work(&self) {
        loop {
            if self.cancelled() {
                return;
            }
            let Some(job) = lock(&self.queue).pop_front() else {
                return;
            };
            let outcome = self
                .client
                .fetch_text_content(&job.owner, &job.repo, &job.path, &job.version)
                .and_then(|text| self.content.put(&job.key, &job.version, text));
            if let Err(err) = &outcome {
                warn!(key = %job.key, error = %err, "ingredient fetch failed");
            }
            let delivered = self.publish(|progress| {
                match outcome {
                    Ok(_) => progress.completed_ingredients += 1,
                    Err(_) => progress.failed_ingredients += 1,
                }
                progress.current_resource = Some(job.resource.to_string());
                progress.current_ingredient = Some(job.ingredient.clone());
            });
            if !delivered {
                return;
            }
        }
    }

    /// Applies `update` to the shared progress and emits the snapshot, unless
    /// the session was cancelled.
    fn publish<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut DownloadProgress),
    {
        let mut status = lock(&self.status);
        if self.cancelled() {
            return false;
        }
        update(&mut status.progress);
        status.progress.refresh_percent();
        let _ = self
            .events
            .send(FetcherEvent::Progress(status.progress.clone()));
        true
    }

    fn snapshot(&self) -> DownloadProgress {
        lock(&self.status).progress.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl Plan {
    fn skip(&mut self, resource: &str, reason: String) {
        self.skipped.push(SkippedResource {
            resource: resource.to_string(),
            reason,
        });
    }
}

fn unique_resources(jobs: &[Job]) -> Vec<String> {
    let mut resources: Vec<String> = Vec::new();
    for job in jobs {
        let key = job.resource.to_string();
        if !resources.contains(&key) {
            resources.push(key);
        }
    }
    resources
}

// A poisoned lock only means a worker panicked mid-update; the counters are
// still meaningful, so keep going with the inner value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
