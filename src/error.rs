use std::path::PathBuf;
use thiserror::Error;

/// Main error type for whisperdock
#[derive(Error, Debug)]
pub enum DockError {
    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/whisperdock/config.toml\n- Remove the file to fall back to built-in defaults\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Model load error: {0}")]
    Load(#[from] LoadError),

    #[error("Refusing to delete '{0}': it is the active model\n\nTroubleshooting:\n- Switch to another model first: whisperdock switch <id>\n- Then delete this one")]
    DeleteRefused(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model provider error: {0}\n\nTroubleshooting:\n- Check internet connection\n- Verify the repository in [download] config\n- The built-in catalog is used while the provider is unreachable")]
    Provider(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Terminal outcomes of a single artifact transfer
///
/// Transient transport failures never appear here on their own: they are
/// retried by the transfer engine and only surface folded into
/// [`DownloadError::DownloadFailed`] once the attempt budget is spent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("Download cancelled")]
    Cancelled,

    #[error("Download failed after {attempts} attempts: {last_error}\n\nTroubleshooting:\n- Check internet connection\n- Retry the download; it resumes where it stopped\n- Increase max_attempts in [download] config")]
    DownloadFailed { attempts: u32, last_error: String },

    #[error("Filesystem error: {0}\n\nTroubleshooting:\n- Check free disk space\n- Check write permissions on the models directory")]
    FileSystem(String),

    #[error("Checksum mismatch for {path}: expected {expected}")]
    IntegrityMismatch { path: PathBuf, expected: String },

    #[error("Another download is already in progress")]
    Busy,

    #[error("Invalid download URL: {0}")]
    InvalidUrl(String),
}

/// Raised by an inference engine that rejects a model directory
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LoadError(pub String);

pub type Result<T> = std::result::Result<T, DockError>;
