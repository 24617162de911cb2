use async_trait::async_trait;
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use whisperdock::config::Config;
use whisperdock::inference::LayoutCheckEngine;
use whisperdock::models::provider::{RemoteFile, RemoteVariant};
use whisperdock::models::registry::fallback_catalog;
use whisperdock::models::roots::{CACHE_ROOT_ENV, HOME_ROOT_ENV};
use whisperdock::models::{
    ArtifactScanner, DeviceProfile, ManagerEvent, ModelCatalogEntry, ModelLifecycleManager,
    ModelProvider, ModelState, StorageRoot, StorageRootResolver,
};
use whisperdock::transfer::{
    FetchRequest, ProgressFn, RetryPolicy, TransferEngine, Transport, TransportFailure,
};
use whisperdock::DockError;

const REPO: &str = "argmaxinc/whisperkit-coreml";
const COMPONENTS: [&str; 3] = ["MelSpectrogram", "AudioEncoder", "TextDecoder"];

/// Publishes every variant as the three compiled components, using
/// uncompiled packages for the encoder to exercise both layouts
struct StaticProvider;

#[async_trait]
impl ModelProvider for StaticProvider {
    async fn list_variants(&self) -> whisperdock::Result<Vec<String>> {
        Ok(vec!["openai_whisper-base".to_string()])
    }

    async fn variant_files(&self, id: &str) -> whisperdock::Result<RemoteVariant> {
        let files = COMPONENTS
            .iter()
            .map(|component| {
                let relative = if *component == "AudioEncoder" {
                    format!("{component}.mlpackage/Data/com.apple.CoreML/weights/weight.bin")
                } else {
                    format!("{component}.mlmodelc/coremldata.bin")
                };
                RemoteFile {
                    path: format!("{id}/{relative}"),
                    size_bytes: Some(4096),
                    sha256: None,
                }
            })
            .collect();

        Ok(RemoteVariant {
            name: id.to_string(),
            files,
        })
    }

    fn file_url(&self, path: &str) -> String {
        format!("https://models.test/{path}")
    }
}

/// Writes 4 KiB for every request, failing the first attempt of each file
struct FlakyTransport;

#[async_trait]
impl Transport for FlakyTransport {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressFn,
        _cancel: CancellationToken,
    ) -> Result<PathBuf, TransportFailure> {
        if request.resume.is_none() {
            tokio::fs::write(&request.staging_path, [0u8; 1024]).await.unwrap();
            progress(1024, Some(4096));
            return Err(TransportFailure::Failed {
                message: "connection reset by peer".to_string(),
                resume: Some(whisperdock::transfer::ResumeData {
                    url: request.url.clone(),
                    partial_path: request.staging_path.clone(),
                    bytes_received: 1024,
                    etag: None,
                }),
            });
        }

        let mut body = tokio::fs::read(&request.staging_path).await.unwrap();
        body.extend_from_slice(&[1u8; 3072]);
        tokio::fs::write(&request.staging_path, &body).await.unwrap();
        progress(4096, Some(4096));
        Ok(request.staging_path)
    }
}

/// Restores the overridden environment variables on drop
struct EnvGuard(Vec<(&'static str, Option<String>)>);

impl EnvGuard {
    fn set(vars: &[(&'static str, &str)]) -> Self {
        let saved = vars
            .iter()
            .map(|(var, _)| (*var, std::env::var(var).ok()))
            .collect();
        for (var, value) in vars {
            std::env::set_var(var, value);
        }
        Self(saved)
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (var, value) in &self.0 {
            match value {
                Some(value) => std::env::set_var(var, value),
                None => std::env::remove_var(var),
            }
        }
    }
}

fn manager_in(temp_dir: &TempDir) -> ModelLifecycleManager {
    let transfer = Arc::new(TransferEngine::new(
        Arc::new(FlakyTransport),
        RetryPolicy::new(4, Duration::from_millis(1)),
    ));
    ModelLifecycleManager::new(
        StorageRootResolver::new(REPO, temp_dir.path().join("models")),
        Arc::new(StaticProvider),
        transfer,
        Arc::new(LayoutCheckEngine::new()),
        temp_dir.path().join("ledger.json"),
    )
}

fn catalog_entry(id: &str) -> ModelCatalogEntry {
    fallback_catalog(DeviceProfile::default())
        .into_iter()
        .find(|entry| entry.id == id)
        .unwrap()
}

fn install(dir: &Path, weight_bytes: usize) {
    for component in COMPONENTS {
        let package = dir.join(format!("{component}.mlmodelc"));
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("weight.bin"), vec![0u8; weight_bytes]).unwrap();
    }
}

#[tokio::test]
async fn test_fresh_install_download_to_loaded() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager_in(&temp_dir);
    assert_eq!(manager.current_state(), ModelState::NotDownloaded);

    let mut events = manager.subscribe();
    let directory = manager
        .download(&catalog_entry("openai_whisper-base"))
        .await
        .unwrap();

    let mut phases: Vec<ModelState> = Vec::new();
    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ManagerEvent::State(state) => {
                if phases.last().map_or(true, |last| !last.same_phase(&state)) {
                    phases.push(state);
                }
            }
            ManagerEvent::Transfer(whisperdock::transfer::TransferEvent::RetryScheduled {
                ..
            }) => retries += 1,
            ManagerEvent::Transfer(_) => {}
        }
    }

    assert!(matches!(phases[0], ModelState::Downloading(_)));
    assert_eq!(&phases[1..], &[ModelState::Loading, ModelState::Loaded]);
    assert_eq!(retries, COMPONENTS.len());

    let index = manager.downloaded_models().await.unwrap();
    let artifact = index.get("openai_whisper-base").unwrap();
    assert_eq!(artifact.directory, directory);
    assert!(artifact.size_bytes > 0);

    // Resumed files hold the full body, not a restarted one
    let weights = directory.join("AudioEncoder.mlpackage/Data/com.apple.CoreML/weights/weight.bin");
    assert_eq!(std::fs::metadata(weights).unwrap().len(), 4096);
}

#[tokio::test]
async fn test_active_model_survives_delete_request() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager_in(&temp_dir);
    let directory = manager
        .download(&catalog_entry("openai_whisper-base"))
        .await
        .unwrap();

    let result = manager.delete_model(" openai_whisper-base_146MB ").await;

    assert!(matches!(result, Err(DockError::DeleteRefused(_))));
    assert!(directory.join("TextDecoder.mlmodelc").exists());
    assert_eq!(manager.current_state(), ModelState::Loaded);
}

#[tokio::test]
async fn test_active_model_persists_across_restart() {
    let temp_dir = TempDir::new().unwrap();
    manager_in(&temp_dir)
        .download(&catalog_entry("openai_whisper-base"))
        .await
        .unwrap();

    let restarted = manager_in(&temp_dir);
    assert_eq!(restarted.current_state(), ModelState::Downloaded);
    assert_eq!(restarted.active_model().as_deref(), Some("openai_whisper-base"));
}

#[test]
fn test_scan_across_roots_keeps_one_representative() {
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("first");
    let second = temp_dir.path().join("second");
    install(&first.join("openai_whisper-large-v3_turbo_954MB"), 50_000);
    install(&second.join("openai_whisper-large-v3_turbo"), 4_096);
    install(&second.join("distil-whisper_distil-large-v3"), 4_096);

    let roots = [StorageRoot::custom(&first), StorageRoot::custom(&second)];
    let index = ArtifactScanner::default().scan(&roots);

    assert_eq!(index.len(), 2);
    let turbo = index.get("openai_whisper-large-v3_turbo").unwrap();
    assert_eq!(turbo.directory, second.join("openai_whisper-large-v3_turbo"));

    let distil = index.get("distil-whisper_distil-large-v3").unwrap();
    assert_eq!(
        index.total_size_bytes(),
        turbo.size_bytes + distil.size_bytes
    );
}

#[test]
#[serial]
fn test_resolver_reads_hf_environment() {
    let temp_dir = TempDir::new().unwrap();
    let hf_home = temp_dir.path().join("hf-home");
    let _env = EnvGuard::set(&[
        (HOME_ROOT_ENV, hf_home.to_str().unwrap()),
        (CACHE_ROOT_ENV, ""),
    ]);

    let mut config = Config::default();
    config.storage.models_dir = Some(temp_dir.path().join("managed"));
    let roots = StorageRootResolver::from_config(&config)
        .unwrap()
        .resolve_roots();

    assert_eq!(roots[0].convention, "managed");
    assert_eq!(roots[0].path, temp_dir.path().join("managed").join(REPO));
    let hf_home: Vec<_> = roots.iter().filter(|r| r.convention == "hf-home").collect();
    assert_eq!(hf_home.len(), 1);
    assert_eq!(
        hf_home[0].path,
        temp_dir.path().join("hf-home").join("models").join(REPO)
    );
    assert!(roots.iter().all(|r| r.convention != "hf-hub-cache"));
}

#[tokio::test]
#[serial]
async fn test_manager_from_config_scans_configured_root() {
    let temp_dir = TempDir::new().unwrap();
    let data_home = temp_dir.path().join("data");
    let hf_home = temp_dir.path().join("hf-home");
    let _env = EnvGuard::set(&[
        ("XDG_DATA_HOME", data_home.to_str().unwrap()),
        (HOME_ROOT_ENV, hf_home.to_str().unwrap()),
        (CACHE_ROOT_ENV, ""),
    ]);

    let mut config = Config::default();
    config.storage.models_dir = Some(temp_dir.path().join("managed"));
    install(
        &temp_dir.path().join("managed").join(REPO).join("openai_whisper-tiny"),
        1_024,
    );

    let manager = ModelLifecycleManager::from_config(&config, Arc::new(LayoutCheckEngine::new()))
        .await
        .unwrap();

    assert_eq!(manager.current_state(), ModelState::Downloaded);
    assert!(manager.active_model().is_none());
    assert_eq!(manager.managed_root(), temp_dir.path().join("managed").join(REPO));
}
