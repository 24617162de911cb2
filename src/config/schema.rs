use crate::error::{DockError, Result};
use crate::models::registry::HardwareTier;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct StorageConfig {
    /// Overrides the app managed models directory
    pub models_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_roots: Vec<PathBuf>,
    #[serde(default = "default_scan_depth")]
    pub scan_depth: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DownloadConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    #[serde(default = "default_tier")]
    pub tier: HardwareTier,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub default: String,
}

// Default value functions
fn default_scan_depth() -> usize {
    4
}
fn default_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_repo() -> String {
    "argmaxinc/whisperkit-coreml".to_string()
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_secs() -> u64 {
    1
}
fn default_true() -> bool {
    true
}
fn default_tier() -> HardwareTier {
    HardwareTier::Mid
}
fn default_model() -> String {
    "openai_whisper-base".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            extra_roots: Vec::new(),
            scan_depth: default_scan_depth(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            repo: default_repo(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            verify_checksums: default_true(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tier: default_tier(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default: default_model(),
        }
    }
}

impl DownloadConfig {
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load config from an explicit path; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DockError::Config(format!("Failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| DockError::Config(format!("Failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, toml_str)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.download.max_attempts == 0 {
            return Err(DockError::Config(
                "download.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.storage.scan_depth == 0 {
            return Err(DockError::Config(
                "storage.scan_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        let home = std::env::var("HOME")
            .map_err(|_| DockError::Config("HOME env var not set".to_string()))?;
        PathBuf::from(home).join(".config")
    };

    Ok(config_dir.join("whisperdock").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.download.max_attempts, 4);
        assert_eq!(config.device.tier, HardwareTier::Mid);
    }

    #[test]
    fn test_partial_config_merges_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            "[device]\ntier = \"high\"\n\n[storage]\nextra_roots = [\"/srv/models\"]\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.device.tier, HardwareTier::High);
        assert_eq!(config.storage.extra_roots, vec![PathBuf::from("/srv/models")]);
        assert_eq!(config.storage.scan_depth, 4);
        assert_eq!(config.download.repo, "argmaxinc/whisperkit-coreml");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[download]\nmax_attempts = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.model.default = "openai_whisper-small".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
