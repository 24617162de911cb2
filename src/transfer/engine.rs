//! Single-session transfer engine.
//!
//! The transport reports through callbacks while callers want one awaitable
//! result. Each session owns a one-shot completion slot: the attempt loop
//! resolves it when it ends, `cancel()` resolves it early. Whichever comes
//! second is logged and dropped.

use crate::error::DownloadError;
use crate::transfer::progress::{DownloadProgress, TransferEvent};
use crate::transfer::{FetchRequest, ProgressFn, ResumeData, Transport, TransportFailure};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

type Outcome = Result<PathBuf, DownloadError>;

/// Resume data of interrupted transfers, keyed by URL
type ResumeStore = Arc<Mutex<HashMap<String, ResumeData>>>;

/// Attempt budget and backoff base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Resolves a session's pending result exactly once
struct Completion {
    url: String,
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Completion {
    fn resolve(&self, outcome: Outcome) {
        match lock(&self.tx).take() {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::warn!(
                url = %self.url,
                ignored = ?outcome,
                "Transfer already resolved, ignoring second completion"
            ),
        }
    }
}

/// Forwards events until closed; nothing passes once `close` returns
struct EventGate {
    open: Mutex<bool>,
    events: broadcast::Sender<TransferEvent>,
}

impl EventGate {
    fn emit(&self, event: TransferEvent) {
        let open = lock(&self.open);
        if *open {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn close(&self) {
        *lock(&self.open) = false;
    }
}

struct ActiveSession {
    cancel: CancellationToken,
    gate: Arc<EventGate>,
    completion: Arc<Completion>,
}

/// Clears the active session when `download` returns or is dropped
struct SessionGuard<'a> {
    slot: &'a Mutex<Option<ActiveSession>>,
    cancel: CancellationToken,
    gate: Arc<EventGate>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.gate.close();
        self.cancel.cancel();
        lock(self.slot).take();
    }
}

/// Downloads one file at a time with resume, retry and cancellation
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    events: broadcast::Sender<TransferEvent>,
    session: Mutex<Option<ActiveSession>>,
    resume: ResumeStore,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("transport", &"Transport { ... }")
            .field("policy", &self.policy)
            .field("active", &self.is_active())
            .finish()
    }
}

impl TransferEngine {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            policy,
            events,
            session: Mutex::new(None),
            resume: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Receive progress and retry notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Whether a download is in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// Resume data kept from an interrupted transfer of `url`, if any
    #[must_use]
    pub fn pending_resume(&self, url: &str) -> Option<ResumeData> {
        lock(&self.resume).get(url).cloned()
    }

    /// Download `url` into `destination_dir/<last URL segment>`.
    ///
    /// Only one download may be in flight; a second call gets
    /// [`DownloadError::Busy`].
    pub async fn download(&self, url: &str, destination_dir: &Path) -> Outcome {
        let file_name = file_name_from_url(url)?;
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let gate = Arc::new(EventGate {
            open: Mutex::new(true),
            events: self.events.clone(),
        });
        let completion = Arc::new(Completion {
            url: url.to_string(),
            tx: Mutex::new(Some(tx)),
        });

        {
            let mut session = lock(&self.session);
            if session.is_some() {
                return Err(DownloadError::Busy);
            }
            *session = Some(ActiveSession {
                cancel: cancel.clone(),
                gate: gate.clone(),
                completion: completion.clone(),
            });
        }
        let _guard = SessionGuard {
            slot: &self.session,
            cancel: cancel.clone(),
            gate: gate.clone(),
        };

        tracing::info!(url = %url, destination = %destination_dir.display(), "Starting download");

        let task = SessionTask {
            transport: self.transport.clone(),
            policy: self.policy,
            resume: self.resume.clone(),
            url: url.to_string(),
            destination_dir: destination_dir.to_path_buf(),
            file_name,
            cancel: cancel.clone(),
            gate,
            started: Instant::now(),
        };
        tokio::spawn(async move {
            let outcome = task.run().await;
            // A cancelled session was already resolved by `cancel()`
            if !(task.cancel.is_cancelled() && outcome == Err(DownloadError::Cancelled)) {
                completion.resolve(outcome);
            }
        });

        rx.await.unwrap_or_else(|_| {
            Err(DownloadError::DownloadFailed {
                attempts: 0,
                last_error: "transfer task ended without a result".to_string(),
            })
        })
    }

    /// Cancel the in-flight download, if any.
    ///
    /// The pending result resolves to [`DownloadError::Cancelled`] right away,
    /// resume data is discarded and no further progress is emitted.
    pub fn cancel(&self) -> bool {
        let session = lock(&self.session);
        let Some(active) = session.as_ref() else {
            return false;
        };

        active.gate.close();
        active.cancel.cancel();
        lock(&self.resume).remove(&active.completion.url);
        active.completion.resolve(Err(DownloadError::Cancelled));
        tracing::info!("Download cancelled");
        true
    }
}

/// Everything the spawned attempt loop needs
struct SessionTask {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    resume: ResumeStore,
    url: String,
    destination_dir: PathBuf,
    file_name: String,
    cancel: CancellationToken,
    gate: Arc<EventGate>,
    started: Instant,
}

impl SessionTask {
    async fn run(&self) -> Outcome {
        tokio::fs::create_dir_all(&self.destination_dir)
            .await
            .map_err(|e| {
                DownloadError::FileSystem(format!(
                    "Failed to create {}: {e}",
                    self.destination_dir.display()
                ))
            })?;

        let staging_path = self
            .destination_dir
            .join(format!(".{}.partial", self.file_name));
        let mut attempt = 1;

        loop {
            let request = FetchRequest {
                url: self.url.clone(),
                staging_path: staging_path.clone(),
                resume: self.take_resume(),
            };
            if let Some(resume) = &request.resume {
                tracing::info!(
                    url = %self.url,
                    offset = resume.bytes_received,
                    attempt,
                    "Resuming download"
                );
            }

            let gate = self.gate.clone();
            let started = self.started;
            let progress: ProgressFn = Arc::new(move |written, expected| {
                gate.emit(TransferEvent::Progress(DownloadProgress::compute(
                    written,
                    expected,
                    started.elapsed(),
                )));
            });

            match self
                .transport
                .fetch(request, progress, self.cancel.clone())
                .await
            {
                Ok(received) => {
                    if self.cancel.is_cancelled() {
                        let _ = tokio::fs::remove_file(&received).await;
                        return Err(DownloadError::Cancelled);
                    }
                    let final_path = self.destination_dir.join(&self.file_name);
                    move_into_place(&received, &final_path).await?;
                    tracing::info!(path = %final_path.display(), attempt, "Download complete");
                    return Ok(final_path);
                }
                Err(TransportFailure::Cancelled) => return Err(DownloadError::Cancelled),
                Err(TransportFailure::Failed { message, resume }) => {
                    if self.cancel.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    if let Some(data) = resume {
                        lock(&self.resume).insert(self.url.clone(), data);
                    }

                    if attempt >= self.policy.max_attempts {
                        tracing::warn!(url = %self.url, attempt, "Giving up: {message}");
                        return Err(DownloadError::DownloadFailed {
                            attempts: attempt,
                            last_error: message,
                        });
                    }

                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        url = %self.url,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transfer failed, retrying: {message}"
                    );
                    self.gate.emit(TransferEvent::RetryScheduled {
                        attempt,
                        delay,
                        reason: message,
                    });

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Take stored resume data for this URL, leaving other URLs' data alone
    fn take_resume(&self) -> Option<ResumeData> {
        lock(&self.resume).remove(&self.url)
    }
}

/// Replace `final_path` with the received file
async fn move_into_place(received: &Path, final_path: &Path) -> Result<(), DownloadError> {
    if tokio::fs::try_exists(final_path).await.unwrap_or(false) {
        tokio::fs::remove_file(final_path).await.map_err(|e| {
            DownloadError::FileSystem(format!(
                "Failed to remove existing {}: {e}",
                final_path.display()
            ))
        })?;
    }

    tokio::fs::rename(received, final_path).await.map_err(|e| {
        DownloadError::FileSystem(format!(
            "Failed to move download to {}: {e}",
            final_path.display()
        ))
    })
}

/// Last non-empty path segment of a URL
fn file_name_from_url(url: &str) -> Result<String, DownloadError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{url}: {e}")))?;

    parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .ok_or_else(|| DownloadError::InvalidUrl(format!("{url}: no file name")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
