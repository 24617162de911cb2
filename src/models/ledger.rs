use crate::error::{DockError, Result};
use crate::models::identifier::normalize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A completed download recorded by this app
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRecord {
    pub id: String,
    pub directory: PathBuf,
    pub size_bytes: u64,
    pub downloaded_at: String,
}

/// Persisted lifecycle facts: the active model and completed downloads.
///
/// Which models exist on disk is always answered by a scan; the ledger only
/// keeps what a scan cannot recover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub active: Option<String>,
    #[serde(default)]
    pub downloads: Vec<DownloadRecord>,
    pub last_updated: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            active: None,
            downloads: Vec::new(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Ledger {
    /// Load ledger from file, defaulting if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;

        serde_json::from_str(&content)
            .map_err(|e| DockError::Config(format!("Failed to parse ledger: {e}")))
    }

    /// Load, replacing an unreadable ledger with an empty one
    #[must_use]
    pub fn load_or_reset(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "Resetting ledger: {e}");
            Self::default()
        })
    }

    /// Save ledger to file atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DockError::Config(format!("Failed to serialize ledger: {e}")))?;

        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    /// Add or update the record for a download
    pub fn record_download(&mut self, record: DownloadRecord) {
        let id = normalize(&record.id);
        self.downloads.retain(|r| normalize(&r.id) != id);
        self.downloads.push(record);
        self.touch();
    }

    /// Drop the record for a model, returning whether one existed
    pub fn forget(&mut self, id: &str) -> bool {
        let id = normalize(id);
        let before_len = self.downloads.len();
        self.downloads.retain(|r| normalize(&r.id) != id);
        let removed = self.downloads.len() != before_len;
        if removed {
            self.touch();
        }
        removed
    }

    /// Set or clear the active model
    pub fn set_active(&mut self, id: Option<&str>) {
        self.active = id.map(normalize);
        self.touch();
    }

    /// Get active model
    #[must_use]
    pub fn get_active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Find a download record by (canonical) id
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&DownloadRecord> {
        let id = normalize(id);
        self.downloads.iter().find(|r| normalize(&r.id) == id)
    }

    fn touch(&mut self) {
        self.last_updated = chrono::Utc::now().to_rfc3339();
    }
}

/// Get ledger path
pub fn ledger_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("ledger.json"))
}

/// Get the app data directory
pub fn data_dir() -> Result<PathBuf> {
    let data_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data)
    } else {
        let home = std::env::var("HOME")
            .map_err(|_| DockError::Config("HOME env var not set".to_string()))?;
        PathBuf::from(home).join(".local/share")
    };

    Ok(data_dir.join("whisperdock"))
}
