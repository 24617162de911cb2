pub mod engine;
pub mod http;
pub mod progress;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use engine::{RetryPolicy, TransferEngine};
pub use http::HttpTransport;
pub use progress::{format_bytes, DownloadProgress, TransferEvent};

/// State needed to continue an interrupted transfer instead of restarting it.
///
/// Lives in memory only; a restarted process always begins from byte zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    pub url: String,
    pub partial_path: PathBuf,
    pub bytes_received: u64,
    /// Entity tag of the partial content, sent back as `If-Range`
    pub etag: Option<String>,
}

/// One attempt at fetching a URL into a staging file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub staging_path: PathBuf,
    pub resume: Option<ResumeData>,
}

/// Why a single attempt ended without a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// Cancellation was observed; no resume data is kept
    Cancelled,
    /// Transient failure, retried by the engine
    Failed {
        message: String,
        resume: Option<ResumeData>,
    },
}

impl TransportFailure {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            resume: None,
        }
    }
}

/// Progress callback: bytes written so far, total bytes if known
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Moves bytes from a URL into a local staging file
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `request.url` into `request.staging_path`.
    ///
    /// Returns the path of the fully received file. Must stop promptly once
    /// `cancel` fires.
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TransportFailure>;
}
