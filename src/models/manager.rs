use crate::config::schema::Config;
use crate::error::{DockError, DownloadError, Result};
use crate::inference::InferenceEngine;
use crate::models::identifier::normalize;
use crate::models::integrity;
use crate::models::ledger::{ledger_path, DownloadRecord, Ledger};
use crate::models::provider::{HubProvider, ModelProvider, RemoteFile, RemoteVariant};
use crate::models::registry::{
    catalog_from_variants, fallback_catalog, DeviceProfile, ModelCatalogEntry,
};
use crate::models::roots::{StorageRoot, StorageRootResolver};
use crate::models::scanner::{directory_size, ArtifactScanner, DownloadedArtifactIndex};
use crate::models::validator;
use crate::transfer::{HttpTransport, RetryPolicy, TransferEngine, TransferEvent};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Free space required on top of the download itself
const DISK_HEADROOM_BYTES: u64 = 100 * 1024 * 1024;

/// Hidden directory under the managed root holding in-progress variants
const STAGING_DIR: &str = ".staging";

const EVENT_CAPACITY: usize = 256;

/// Lifecycle phase of the active model
#[derive(Debug, Clone, PartialEq)]
pub enum ModelState {
    NotDownloaded,
    /// Overall progress of the variant, 0.0 to 1.0
    Downloading(f64),
    Downloaded,
    Loading,
    Loaded,
    Error(String),
}

impl ModelState {
    /// Compare variants only, ignoring progress and messages
    #[must_use]
    pub fn same_phase(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Short label for display
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotDownloaded => "not downloaded",
            Self::Downloading(_) => "downloading",
            Self::Downloaded => "downloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Error(_) => "error",
        }
    }
}

/// Notifications for UI layers
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    State(ModelState),
    /// Raw per-file transfer event
    Transfer(TransferEvent),
}

/// Outcome of a best-effort delete across storage roots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub attempted_paths: Vec<PathBuf>,
    pub removed_count: usize,
    pub first_error: Option<String>,
}

impl DeleteReport {
    /// Nothing on disk matched
    #[must_use]
    pub fn nothing_found(&self) -> bool {
        self.attempted_paths.is_empty()
    }

    #[must_use]
    pub const fn removed_any(&self) -> bool {
        self.removed_count > 0
    }
}

/// Owns the active model's state and services download, switch and delete
/// requests one at a time.
pub struct ModelLifecycleManager {
    resolver: StorageRootResolver,
    scanner: ArtifactScanner,
    provider: Arc<dyn ModelProvider>,
    transfer: Arc<TransferEngine>,
    inference: Arc<dyn InferenceEngine>,
    device: DeviceProfile,
    verify_checksums: bool,
    ledger_path: PathBuf,
    ledger: Mutex<Ledger>,
    state: RwLock<ModelState>,
    catalog: RwLock<Vec<ModelCatalogEntry>>,
    candidate: RwLock<Option<String>>,
    /// Shared by every download or switch in flight or queued
    cancel: Mutex<CancellationToken>,
    pending: AtomicUsize,
    events: broadcast::Sender<ManagerEvent>,
    requests: tokio::sync::Mutex<()>,
}

/// A download or switch from the moment it is issued until it returns
struct PendingRequest<'a> {
    pending: &'a AtomicUsize,
    cancel: CancellationToken,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ModelLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLifecycleManager")
            .field("managed_root", &self.resolver.managed_root())
            .field("engine", &self.inference.engine_name())
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl ModelLifecycleManager {
    /// Create a manager and derive the initial state from one scan
    #[must_use]
    pub fn new(
        resolver: StorageRootResolver,
        provider: Arc<dyn ModelProvider>,
        transfer: Arc<TransferEngine>,
        inference: Arc<dyn InferenceEngine>,
        ledger_path: PathBuf,
    ) -> Self {
        Self::with_parts(
            resolver,
            ArtifactScanner::default(),
            provider,
            transfer,
            inference,
            ledger_path,
            DeviceProfile::default(),
        )
    }

    /// Manager wired to the Hub provider and HTTP transport from config.
    ///
    /// The initial scan runs on the blocking pool.
    pub async fn from_config(
        config: &Config,
        inference: Arc<dyn InferenceEngine>,
    ) -> Result<Self> {
        let resolver = StorageRootResolver::from_config(config)?;
        let provider = Arc::new(HubProvider::new(&config.download)?);
        let policy = RetryPolicy::new(config.download.max_attempts, config.download.base_delay());
        let transfer = Arc::new(TransferEngine::new(Arc::new(HttpTransport::new()), policy));

        let scanner = ArtifactScanner::new(config.storage.scan_depth);
        let ledger_path = ledger_path()?;
        let device = DeviceProfile::new(config.device.tier);
        let manager = tokio::task::spawn_blocking(move || {
            Self::with_parts(
                resolver,
                scanner,
                provider,
                transfer,
                inference,
                ledger_path,
                device,
            )
        })
        .await
        .map_err(|e| DockError::Other(format!("Model scan failed: {e}")))?;

        Ok(manager.with_verify_checksums(config.download.verify_checksums))
    }

    fn with_parts(
        resolver: StorageRootResolver,
        scanner: ArtifactScanner,
        provider: Arc<dyn ModelProvider>,
        transfer: Arc<TransferEngine>,
        inference: Arc<dyn InferenceEngine>,
        ledger_path: PathBuf,
        device: DeviceProfile,
    ) -> Self {
        let ledger = Ledger::load_or_reset(&ledger_path);
        let index = scanner.scan(&resolver.resolve_roots());
        let state = if index.is_empty() {
            ModelState::NotDownloaded
        } else {
            ModelState::Downloaded
        };
        tracing::info!(
            models = index.len(),
            state = state.label(),
            "Model manager initialized"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resolver,
            scanner,
            provider,
            transfer,
            inference,
            device,
            verify_checksums: true,
            ledger_path,
            ledger: Mutex::new(ledger),
            state: RwLock::new(state),
            catalog: RwLock::new(fallback_catalog(device)),
            candidate: RwLock::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            pending: AtomicUsize::new(0),
            events,
            requests: tokio::sync::Mutex::new(()),
        }
    }

    /// Override the device profile used for recommendations
    #[must_use]
    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = device;
        self.catalog = RwLock::new(fallback_catalog(device));
        self
    }

    #[must_use]
    pub const fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    #[must_use]
    pub fn current_state(&self) -> ModelState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recently fetched catalog (built-in catalog until the first fetch)
    #[must_use]
    pub fn catalog(&self) -> Vec<ModelCatalogEntry> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receive state changes and transfer progress
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Canonical id of the persisted active model
    #[must_use]
    pub fn active_model(&self) -> Option<String> {
        self.ledger().get_active().map(str::to_string)
    }

    #[must_use]
    pub fn storage_roots(&self) -> Vec<StorageRoot> {
        self.resolver.resolve_roots()
    }

    #[must_use]
    pub fn managed_root(&self) -> PathBuf {
        self.resolver.managed_root()
    }

    /// Refresh the catalog from the provider.
    ///
    /// Any provider failure, or an empty listing, falls back to the built-in
    /// catalog so the result is never empty.
    pub async fn fetch_models(&self) -> Vec<ModelCatalogEntry> {
        let entries = match self.provider.list_variants().await {
            Ok(variants) => {
                let entries = catalog_from_variants(&variants, self.device);
                if entries.is_empty() {
                    tracing::warn!("Provider listed no usable variants, using built-in catalog");
                    fallback_catalog(self.device)
                } else {
                    entries
                }
            }
            Err(e) => {
                tracing::warn!("Catalog fetch failed, using built-in catalog: {e}");
                fallback_catalog(self.device)
            }
        };

        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clone_from(&entries);
        entries
    }

    /// Scan every storage root off the async runtime
    pub async fn downloaded_models(&self) -> Result<DownloadedArtifactIndex> {
        let roots = self.resolver.resolve_roots();
        let scanner = self.scanner;
        tokio::task::spawn_blocking(move || scanner.scan(&roots))
            .await
            .map_err(|e| DockError::Other(format!("Model scan failed: {e}")))
    }

    /// Directory of the downloaded model `id`
    pub async fn resolve_active_model_directory(&self, id: &str) -> Result<PathBuf> {
        let index = self.downloaded_models().await?;
        index
            .get(id)
            .map(|artifact| artifact.directory.clone())
            .ok_or_else(|| {
                DockError::NotFound(format!(
                    "Model '{}' is not downloaded. Fetch it first:\n  whisperdock download {}",
                    normalize(id),
                    normalize(id)
                ))
            })
    }

    /// Download (or reuse) a model, then load it and make it active
    pub async fn download(&self, entry: &ModelCatalogEntry) -> Result<PathBuf> {
        let request = self.enter_request();
        let _serialized = self.requests.lock().await;
        self.download_and_load(&entry.id, &request.cancel).await
    }

    /// Unload the current model and make `entry` the active one
    pub async fn switch_model(&self, entry: &ModelCatalogEntry) -> Result<PathBuf> {
        let request = self.enter_request();
        let _serialized = self.requests.lock().await;
        let id = normalize(&entry.id);
        if request.cancel.is_cancelled() {
            tracing::info!(model = %id, "Switch cancelled before it started");
            return Err(DownloadError::Cancelled.into());
        }

        self.update_ledger(|ledger| ledger.set_active(None))?;
        self.inference.unload_model().await;
        *self.candidate.write().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        tracing::info!(model = %id, "Switching model");

        self.download_and_load(&id, &request.cancel).await
    }

    /// Remove every directory of `id` across all storage roots.
    ///
    /// The active model is never deleted. Removal continues past individual
    /// failures; the report tells what happened.
    pub async fn delete_model(&self, id: &str) -> Result<DeleteReport> {
        let _request = self.requests.lock().await;
        let id = normalize(id);

        if self.active_id().as_deref() == Some(id.as_str()) {
            tracing::warn!(model = %id, "Refusing to delete the active model");
            return Err(DockError::DeleteRefused(id));
        }

        let roots = self.resolver.resolve_roots();
        let scanner = self.scanner;
        let lookup = id.clone();
        let paths = tokio::task::spawn_blocking(move || scanner.find_all(&roots, &lookup))
            .await
            .map_err(|e| DockError::Other(format!("Model scan failed: {e}")))?;

        let mut report = DeleteReport {
            attempted_paths: paths.clone(),
            ..DeleteReport::default()
        };
        for path in paths {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    report.removed_count += 1;
                    tracing::info!(model = %id, path = %path.display(), "Deleted model directory");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to delete model directory: {e}");
                    report
                        .first_error
                        .get_or_insert_with(|| format!("{}: {e}", path.display()));
                }
            }
        }

        if self.ledger().find(&id).is_some() {
            self.update_ledger(|ledger| {
                ledger.forget(&id);
            })?;
        }

        let remaining = self.downloaded_models().await?;
        let state = self.current_state();
        if remaining.is_empty() && !matches!(state, ModelState::Loading | ModelState::Loaded) {
            self.set_state(ModelState::NotDownloaded);
        }

        Ok(report)
    }

    /// Cancel the running download and any queued behind it.
    ///
    /// Returns `false` when no download or switch is pending.
    pub fn cancel_download(&self) -> bool {
        {
            let cancel = self.lock_cancel();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return false;
            }
            cancel.cancel();
        }
        self.transfer.cancel();
        tracing::info!("Cancel requested");
        true
    }

    /// Register a download or switch, joining the current cancellation scope
    fn enter_request(&self) -> PendingRequest<'_> {
        let mut current = self.lock_cancel();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        PendingRequest {
            pending: &self.pending,
            cancel: current.clone(),
        }
    }

    /// Shared path of `download` and `switch_model`; caller holds the request lock
    async fn download_and_load(
        &self,
        raw_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let id = normalize(raw_id);
        if cancel.is_cancelled() {
            tracing::info!(model = %id, "Download cancelled before it started");
            return Err(DownloadError::Cancelled.into());
        }

        self.set_state(ModelState::Downloading(0.0));

        let existing = self.downloaded_models().await?.get(&id).cloned();
        let directory = match existing {
            Some(artifact) => {
                tracing::info!(model = %id, path = %artifact.directory.display(), "Using model already on disk");
                artifact.directory
            }
            None => match self.acquire(&id, cancel).await {
                Ok(directory) => directory,
                Err(DockError::Download(DownloadError::Cancelled)) => {
                    return self.settle_cancelled(&id).await;
                }
                Err(e) => {
                    tracing::error!(model = %id, "Download failed: {e}");
                    self.set_state(ModelState::Error(e.to_string()));
                    return Err(e);
                }
            },
        };

        if cancel.is_cancelled() {
            return self.settle_cancelled(&id).await;
        }

        self.set_state(ModelState::Loading);
        if let Err(e) = self.inference.load_model(&directory).await {
            tracing::error!(model = %id, path = %directory.display(), "Model load failed: {e}");
            self.set_state(ModelState::Error(e.to_string()));
            return Err(e.into());
        }

        *self.candidate.write().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        self.update_ledger(|ledger| ledger.set_active(Some(&id)))?;
        self.set_state(ModelState::Loaded);
        tracing::info!(model = %id, engine = self.inference.engine_name(), "Model loaded");

        Ok(directory)
    }

    /// Fall back to whatever phase the disk supports after a cancel
    async fn settle_cancelled(&self, id: &str) -> Result<PathBuf> {
        let index = self.downloaded_models().await?;
        self.set_state(if index.is_empty() {
            ModelState::NotDownloaded
        } else {
            ModelState::Downloaded
        });
        tracing::info!(model = %id, "Download cancelled");
        Err(DownloadError::Cancelled.into())
    }

    /// Fetch a variant into staging, verify it and promote it into the managed root
    async fn acquire(&self, id: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        let variant = self.provider.variant_files(id).await?;
        if variant.files.is_empty() {
            return Err(DockError::Provider(format!(
                "Variant '{}' has no files",
                variant.name
            )));
        }

        let managed_root = self.resolver.managed_root();
        let total = variant.total_size_bytes();
        check_disk_space(&managed_root, total)?;

        // Left in place between attempts so an interrupted file can resume
        let staging = managed_root.join(STAGING_DIR).join(&variant.name);
        tokio::fs::create_dir_all(&staging).await.map_err(|e| {
            DownloadError::FileSystem(format!("Failed to create {}: {e}", staging.display()))
        })?;

        tracing::info!(
            model = %id,
            variant = %variant.name,
            files = variant.files.len(),
            total_bytes = total,
            "Downloading model"
        );

        let mut done_bytes = 0;
        for file in &variant.files {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled.into());
            }
            self.fetch_verified(file, &staging, done_bytes, total)
                .await?;
            done_bytes += file.size_bytes.unwrap_or(0);
        }

        let missing = validator::missing_components(&staging);
        if !missing.is_empty() {
            return Err(DockError::Provider(format!(
                "Variant '{}' is missing {}",
                variant.name,
                missing.join(", ")
            )));
        }

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled.into());
        }
        let directory = promote(&staging, &managed_root.join(&variant.name)).await?;
        self.record(&variant, &directory).await?;
        Ok(directory)
    }

    /// Fetch one file; a digest mismatch is retried once
    async fn fetch_verified(
        &self,
        file: &RemoteFile,
        staging: &Path,
        done_bytes: u64,
        total: u64,
    ) -> Result<PathBuf> {
        let destination = match Path::new(file.relative_path()).parent() {
            Some(parent) => staging.join(parent),
            None => staging.to_path_buf(),
        };
        let url = self.provider.file_url(&file.path);
        let expected = file.sha256.as_deref().filter(|_| self.verify_checksums);

        let mut refetched = false;
        loop {
            let path = self.fetch_file(&url, &destination, done_bytes, total).await?;
            let Some(expected) = expected else {
                return Ok(path);
            };

            let (checked, digest) = (path.clone(), expected.to_string());
            let verified = tokio::task::spawn_blocking(move || integrity::verify(&checked, &digest))
                .await
                .map_err(|e| DockError::Other(format!("Checksum task failed: {e}")))?;
            if verified {
                return Ok(path);
            }

            let _ = tokio::fs::remove_file(&path).await;
            if refetched {
                return Err(DownloadError::IntegrityMismatch {
                    path,
                    expected: expected.to_string(),
                }
                .into());
            }
            tracing::warn!(path = %path.display(), "Checksum mismatch, downloading again");
            refetched = true;
        }
    }

    /// Run one transfer, relaying its events as variant-wide progress
    async fn fetch_file(
        &self,
        url: &str,
        destination: &Path,
        done_bytes: u64,
        total: u64,
    ) -> Result<PathBuf> {
        let mut rx = self.transfer.subscribe();
        let transfer = self.transfer.download(url, destination);
        tokio::pin!(transfer);

        loop {
            tokio::select! {
                result = &mut transfer => return Ok(result?),
                event = rx.recv() => match event {
                    Ok(event) => self.relay(event, done_bytes, total),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Progress events dropped");
                    }
                    Err(RecvError::Closed) => return Ok((&mut transfer).await?),
                },
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn relay(&self, event: TransferEvent, done_bytes: u64, total: u64) {
        if let TransferEvent::Progress(progress) = &event {
            let fraction = if total > 0 {
                (done_bytes + progress.bytes_written) as f64 / total as f64
            } else {
                progress.fraction
            };
            self.set_state(ModelState::Downloading(fraction.clamp(0.0, 1.0)));
        }
        let _ = self.events.send(ManagerEvent::Transfer(event));
    }

    async fn record(&self, variant: &RemoteVariant, directory: &Path) -> Result<()> {
        let measured = directory.to_path_buf();
        let size_bytes = tokio::task::spawn_blocking(move || directory_size(&measured))
            .await
            .map_err(|e| DockError::Other(format!("Size task failed: {e}")))?;

        let record = DownloadRecord {
            id: normalize(&variant.name),
            directory: directory.to_path_buf(),
            size_bytes,
            downloaded_at: chrono::Utc::now().to_rfc3339(),
        };
        self.update_ledger(|ledger| ledger.record_download(record))
    }

    /// The model that must not be deleted: persisted active, or the candidate
    /// while it is being brought up
    fn active_id(&self) -> Option<String> {
        if let Some(active) = self.active_model() {
            return Some(active);
        }
        let in_use = matches!(
            self.current_state(),
            ModelState::Downloading(_) | ModelState::Loading | ModelState::Loaded
        );
        if in_use {
            self.candidate
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        } else {
            None
        }
    }

    fn set_state(&self, next: ModelState) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == next {
                return;
            }
            if !state.same_phase(&next) {
                tracing::info!(from = state.label(), to = next.label(), "Model state changed");
            }
            *state = next.clone();
        }
        let _ = self.events.send(ManagerEvent::State(next));
    }

    fn update_ledger(&self, change: impl FnOnce(&mut Ledger)) -> Result<()> {
        let mut ledger = self.ledger();
        change(&mut ledger);
        ledger.save(&self.ledger_path)
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Move a finished staging directory to its final place
async fn promote(staging: &Path, target: &Path) -> Result<PathBuf> {
    // Whatever sits at the target failed validation, or the scan would have found it
    if target.exists() {
        tracing::warn!(path = %target.display(), "Replacing incomplete model directory");
        tokio::fs::remove_dir_all(target).await.map_err(|e| {
            DownloadError::FileSystem(format!("Failed to remove {}: {e}", target.display()))
        })?;
    }

    tokio::fs::rename(staging, target).await.map_err(|e| {
        DownloadError::FileSystem(format!(
            "Failed to move model into {}: {e}",
            target.display()
        ))
    })?;

    tracing::info!(path = %target.display(), "Model stored");
    Ok(target.to_path_buf())
}

/// Check if enough disk space is available under `dir`
fn check_disk_space(dir: &Path, required_bytes: u64) -> std::result::Result<(), DownloadError> {
    // statvfs needs an existing path; use the nearest existing ancestor
    let Some(probe) = dir.ancestors().find(|p| p.exists()) else {
        return Ok(());
    };

    let stats = match nix::sys::statvfs::statvfs(probe) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(path = %probe.display(), "Failed to check disk space: {e}");
            return Ok(());
        }
    };

    #[allow(clippy::useless_conversion)]
    let available_bytes = u64::from(stats.blocks_available()) * u64::from(stats.fragment_size());
    let required_with_buffer = required_bytes.saturating_add(DISK_HEADROOM_BYTES);

    if available_bytes < required_with_buffer {
        return Err(DownloadError::FileSystem(format!(
            "Not enough disk space: {} MB required, {} MB available",
            required_with_buffer / (1_024 * 1_024),
            available_bytes / (1_024 * 1_024)
        )));
    }

    Ok(())
}
