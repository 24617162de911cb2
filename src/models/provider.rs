//! Remote source of model variants.
//!
//! A variant is one top-level folder of the model repository; its files are
//! fetched one by one by the transfer engine.

use crate::config::schema::DownloadConfig;
use crate::error::{DockError, Result};
use crate::models::identifier::normalize;
use async_trait::async_trait;
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::BTreeSet;

/// One file of a remote variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Path relative to the repository root, starting with the variant folder
    pub path: String,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
}

impl RemoteFile {
    /// Path relative to the variant folder
    #[must_use]
    pub fn relative_path(&self) -> &str {
        self.path
            .split_once('/')
            .map_or(self.path.as_str(), |(_, rest)| rest)
    }
}

/// A remote variant folder and its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVariant {
    pub name: String,
    pub files: Vec<RemoteFile>,
}

impl RemoteVariant {
    /// Sum of the sizes the provider reported
    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.files.iter().filter_map(|f| f.size_bytes).sum()
    }
}

/// Lists variants and their files
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Names of all published variant folders
    async fn list_variants(&self) -> Result<Vec<String>>;

    /// Files of the variant best matching `id` (aliases accepted)
    async fn variant_files(&self, id: &str) -> Result<RemoteVariant>;

    /// Download URL of a repository file
    fn file_url(&self, path: &str) -> String;
}

/// Pick the folder serving canonical `id`: an exact match, else the
/// canonically named folder, else the first alias.
#[must_use]
pub fn pick_variant_folder<'a>(
    folders: impl IntoIterator<Item = &'a str>,
    id: &str,
) -> Option<&'a str> {
    let canonical = normalize(id);
    let mut alias = None;

    for folder in folders {
        if folder == id || folder == canonical {
            return Some(folder);
        }
        if alias.is_none() && normalize(folder) == canonical {
            alias = Some(folder);
        }
    }

    alias
}

/// Hugging Face Hub backed provider
pub struct HubProvider {
    repo: ApiRepo,
    client: reqwest::Client,
    endpoint: String,
    repo_id: String,
    revision: String,
}

impl std::fmt::Debug for HubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubProvider")
            .field("endpoint", &self.endpoint)
            .field("repo_id", &self.repo_id)
            .field("revision", &self.revision)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    oid: String,
    size: u64,
}

impl HubProvider {
    /// Create provider from download config
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_endpoint(config.endpoint.trim_end_matches('/').to_string())
            .with_progress(false)
            .build()
            .map_err(|e| DockError::Provider(format!("Failed to initialize HuggingFace API: {e}")))?;

        let revision = "main".to_string();
        let repo = api.repo(Repo::with_revision(
            config.repo.clone(),
            RepoType::Model,
            revision.clone(),
        ));

        Ok(Self {
            repo,
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            repo_id: config.repo.clone(),
            revision,
        })
    }

    async fn folder_names(&self) -> Result<BTreeSet<String>> {
        let info = self
            .repo
            .info()
            .await
            .map_err(|e| DockError::Provider(format!("Failed to list {}: {e}", self.repo_id)))?;

        Ok(info
            .siblings
            .iter()
            .filter_map(|s| s.rfilename.split_once('/').map(|(folder, _)| folder.to_string()))
            .collect())
    }
}

#[async_trait]
impl ModelProvider for HubProvider {
    async fn list_variants(&self) -> Result<Vec<String>> {
        let folders = self.folder_names().await?;
        let variants: Vec<String> = folders
            .into_iter()
            .filter(|name| crate::models::roots::MODEL_PREFIXES.iter().any(|p| name.starts_with(p)))
            .collect();

        tracing::info!(repo = %self.repo_id, count = variants.len(), "Listed remote variants");
        Ok(variants)
    }

    async fn variant_files(&self, id: &str) -> Result<RemoteVariant> {
        let folders = self.folder_names().await?;
        let name = pick_variant_folder(folders.iter().map(String::as_str), id)
            .ok_or_else(|| DockError::NotFound(format!("No variant '{id}' in {}", self.repo_id)))?
            .to_string();

        let url = format!(
            "{}/api/models/{}/tree/{}/{name}?recursive=true",
            self.endpoint, self.repo_id, self.revision
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DockError::Provider(format!("Failed to list files of {name}: {e}")))?;

        if !response.status().is_success() {
            return Err(DockError::Provider(format!(
                "Listing files of {name} failed: HTTP {}",
                response.status()
            )));
        }

        let entries: Vec<TreeEntry> = response
            .json()
            .await
            .map_err(|e| DockError::Provider(format!("Invalid file listing for {name}: {e}")))?;

        let files = entries
            .into_iter()
            .filter(|entry| entry.kind == "file")
            .map(|entry| match entry.lfs {
                Some(lfs) => RemoteFile {
                    path: entry.path,
                    size_bytes: Some(lfs.size),
                    sha256: Some(lfs.oid),
                },
                None => RemoteFile {
                    path: entry.path,
                    size_bytes: entry.size,
                    sha256: None,
                },
            })
            .collect();

        Ok(RemoteVariant { name, files })
    }

    fn file_url(&self, path: &str) -> String {
        self.repo.url(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_exact_folder() {
        let folders = ["openai_whisper-base", "openai_whisper-large-v3_turbo_954MB"];
        assert_eq!(
            pick_variant_folder(folders, "openai_whisper-base"),
            Some("openai_whisper-base")
        );
        assert_eq!(
            pick_variant_folder(folders, "openai_whisper-large-v3_turbo_954MB"),
            Some("openai_whisper-large-v3_turbo_954MB")
        );
    }

    #[test]
    fn test_pick_prefers_canonical_over_alias() {
        let folders = [
            "openai_whisper-large-v3_turbo_954MB",
            "openai_whisper-large-v3_turbo",
        ];
        assert_eq!(
            pick_variant_folder(folders, "openai_whisper-large-v3_turbo_1GB"),
            Some("openai_whisper-large-v3_turbo")
        );
    }

    #[test]
    fn test_pick_alias_when_only_alias_published() {
        let folders = ["openai_whisper-large-v3_turbo_954MB"];
        assert_eq!(
            pick_variant_folder(folders, "openai_whisper-large-v3_turbo"),
            Some("openai_whisper-large-v3_turbo_954MB")
        );
        assert_eq!(pick_variant_folder(folders, "openai_whisper-base"), None);
    }

    #[test]
    fn test_relative_path() {
        let file = RemoteFile {
            path: "openai_whisper-base/AudioEncoder.mlmodelc/weights/weight.bin".to_string(),
            size_bytes: None,
            sha256: None,
        };
        assert_eq!(file.relative_path(), "AudioEncoder.mlmodelc/weights/weight.bin");
    }

    #[test]
    fn test_tree_entry_parsing() {
        let json = r#"[
            {"type":"directory","oid":"x","size":0,"path":"openai_whisper-base/AudioEncoder.mlmodelc"},
            {"type":"file","oid":"y","size":12,"path":"openai_whisper-base/config.json"},
            {"type":"file","oid":"z","size":134,"path":"openai_whisper-base/AudioEncoder.mlmodelc/weights/weight.bin",
             "lfs":{"oid":"abc123","size":40000000,"pointerSize":134}}
        ]"#;
        let entries: Vec<TreeEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, "directory");
        assert_eq!(entries[1].size, Some(12));
        let lfs = entries[2].lfs.as_ref().unwrap();
        assert_eq!(lfs.oid, "abc123");
        assert_eq!(lfs.size, 40_000_000);
    }

    #[tokio::test]
    async fn test_hub_provider_creation() {
        let provider = HubProvider::new(&DownloadConfig::default()).unwrap();
        assert_eq!(
            provider.file_url("openai_whisper-base/config.json"),
            "https://huggingface.co/argmaxinc/whisperkit-coreml/resolve/main/openai_whisper-base/config.json"
        );
    }
}
