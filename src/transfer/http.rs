use crate::transfer::{FetchRequest, ProgressFn, ResumeData, Transport, TransportFailure};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ETAG, IF_RANGE, RANGE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// HTTP(S) transport with `Range` based resume
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TransportFailure> {
        let FetchRequest {
            url,
            staging_path,
            resume,
        } = request;

        // Resume only if the partial file still holds what we think it does
        let mut offset = match &resume {
            Some(data) if data.partial_path == staging_path => {
                match tokio::fs::metadata(&staging_path).await {
                    Ok(meta) if meta.len() == data.bytes_received => data.bytes_received,
                    _ => 0,
                }
            }
            _ => 0,
        };

        let mut builder = self.client.get(&url);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
            if let Some(etag) = resume.as_ref().and_then(|r| r.etag.as_deref()) {
                builder = builder.header(IF_RANGE, etag);
            }
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportFailure::Cancelled),
            result = builder.send() => result.map_err(|e| TransportFailure::Failed {
                message: format!("Request to {url} failed: {e}"),
                resume: resume.clone(),
            })?,
        };

        let status = response.status();
        if offset > 0 && status == StatusCode::OK {
            tracing::warn!(url = %url, "Server ignored range request, restarting from zero");
            offset = 0;
        } else if !status.is_success() {
            return Err(TransportFailure::Failed {
                message: format!("HTTP {status} for {url}"),
                resume,
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let expected = response.content_length().map(|len| len + offset);

        let mut file = open_staging(&staging_path, offset > 0)
            .await
            .map_err(|message| TransportFailure::Failed {
                message,
                resume: resume.clone(),
            })?;
        let mut written = offset;
        let mut stream = response.bytes_stream();
        progress(written, expected);

        let resume_at = |written: u64| ResumeData {
            url: url.clone(),
            partial_path: staging_path.clone(),
            bytes_received: written,
            etag: etag.clone(),
        };

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&staging_path).await;
                    return Err(TransportFailure::Cancelled);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await.map_err(|e| TransportFailure::Failed {
                        message: format!("Failed to write {}: {e}", staging_path.display()),
                        resume: None,
                    })?;
                    written += chunk.len() as u64;
                    progress(written, expected);
                }
                Some(Err(e)) => {
                    let _ = file.flush().await;
                    return Err(TransportFailure::Failed {
                        message: format!("Transfer of {url} interrupted: {e}"),
                        resume: Some(resume_at(written)),
                    });
                }
                None => break,
            }
        }

        file.flush().await.map_err(|e| {
            TransportFailure::failed(format!("Failed to flush {}: {e}", staging_path.display()))
        })?;
        file.sync_all().await.map_err(|e| {
            TransportFailure::failed(format!("Failed to sync {}: {e}", staging_path.display()))
        })?;

        if let Some(total) = expected {
            if written < total {
                return Err(TransportFailure::Failed {
                    message: format!("Short body for {url}: {written} of {total} bytes"),
                    resume: Some(resume_at(written)),
                });
            }
        }

        Ok(staging_path)
    }
}

async fn open_staging(path: &Path, append: bool) -> Result<File, String> {
    let result = if append {
        OpenOptions::new().append(true).open(path).await
    } else {
        File::create(path).await
    };

    result.map_err(|e| format!("Failed to open {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers each connection with the next raw response, returning the
    /// lower-cased request heads it saw
    async fn serve(responses: Vec<&'static [u8]>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let mut heads = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                heads.push(String::from_utf8_lossy(&head).to_lowercase());
                socket.write_all(response).await.unwrap();
                let _ = socket.shutdown().await;
            }
            heads
        });

        (base, handle)
    }

    fn local_transport() -> HttpTransport {
        HttpTransport::with_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    fn partial(temp_dir: &TempDir, url: &str, body: &[u8], etag: Option<&str>) -> FetchRequest {
        let staging_path = temp_dir.path().join(".weight.bin.partial");
        std::fs::write(&staging_path, body).unwrap();
        FetchRequest {
            url: url.to_string(),
            staging_path: staging_path.clone(),
            resume: Some(ResumeData {
                url: url.to_string(),
                partial_path: staging_path,
                bytes_received: body.len() as u64,
                etag: etag.map(str::to_string),
            }),
        }
    }

    #[tokio::test]
    async fn test_partial_content_is_appended() {
        let temp_dir = TempDir::new().unwrap();
        let (base, server) = serve(vec![
            b"HTTP/1.1 206 Partial Content\r\nContent-Length: 5\r\nContent-Range: bytes 6-10/11\r\nConnection: close\r\n\r\nworld",
        ])
        .await;
        let url = format!("{base}/weight.bin");
        let request = partial(&temp_dir, &url, b"hello ", Some("\"abc\""));

        let path = local_transport()
            .fetch(request, Arc::new(|_, _| {}), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
        let heads = server.await.unwrap();
        assert!(heads[0].contains("range: bytes=6-"), "{}", heads[0]);
        assert!(heads[0].contains("if-range: \"abc\""), "{}", heads[0]);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let temp_dir = TempDir::new().unwrap();
        let (base, server) = serve(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        ])
        .await;
        let url = format!("{base}/weight.bin");
        let request = partial(&temp_dir, &url, b"stale!", None);

        let path = local_transport()
            .fetch(request, Arc::new(|_, _| {}), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
        let heads = server.await.unwrap();
        assert!(heads[0].contains("range: bytes=6-"));
        assert!(!heads[0].contains("if-range"));
    }

    #[tokio::test]
    async fn test_fresh_request_has_no_range() {
        let temp_dir = TempDir::new().unwrap();
        let (base, server) = serve(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody",
        ])
        .await;
        let request = FetchRequest {
            url: format!("{base}/weight.bin"),
            staging_path: temp_dir.path().join(".weight.bin.partial"),
            resume: None,
        };

        let path = local_transport()
            .fetch(request, Arc::new(|_, _| {}), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"body");
        assert!(!server.await.unwrap()[0].contains("range:"));
    }

    #[tokio::test]
    async fn test_short_body_reports_resume_point() {
        let temp_dir = TempDir::new().unwrap();
        let (base, server) = serve(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\nabcd",
        ])
        .await;
        let staging_path = temp_dir.path().join(".weight.bin.partial");
        let request = FetchRequest {
            url: format!("{base}/weight.bin"),
            staging_path: staging_path.clone(),
            resume: None,
        };

        let result = local_transport()
            .fetch(request, Arc::new(|_, _| {}), CancellationToken::new())
            .await;
        server.await.unwrap();

        let Err(TransportFailure::Failed {
            resume: Some(resume),
            ..
        }) = result
        else {
            panic!("expected a resumable failure");
        };
        assert!(resume.bytes_received < 10);
        assert_eq!(resume.partial_path, staging_path);
        assert_eq!(
            std::fs::metadata(&staging_path).unwrap().len(),
            resume.bytes_received
        );
    }

    #[tokio::test]
    async fn test_error_status_keeps_resume_data() {
        let temp_dir = TempDir::new().unwrap();
        let (base, server) = serve(vec![
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ])
        .await;
        let url = format!("{base}/weight.bin");
        let request = partial(&temp_dir, &url, b"hello ", None);
        let expected = request.resume.clone();

        let result = local_transport()
            .fetch(request, Arc::new(|_, _| {}), CancellationToken::new())
            .await;
        server.await.unwrap();

        assert!(matches!(result, Err(TransportFailure::Failed { resume, .. }) if resume == expected));
    }

    #[tokio::test]
    async fn test_connection_failure_keeps_resume_data() {
        let temp_dir = TempDir::new().unwrap();
        let request = partial(&temp_dir, "http://127.0.0.1:9/weight.bin", &[7u8; 512], None);
        let expected = request.resume.clone();
        let staging_path = request.staging_path.clone();

        let result = local_transport()
            .fetch(request, Arc::new(|_, _| {}), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(TransportFailure::Failed { resume, .. }) if resume == expected));
        assert_eq!(std::fs::metadata(staging_path).unwrap().len(), 512);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let temp_dir = TempDir::new().unwrap();
        let transport = HttpTransport::new();
        let request = FetchRequest {
            // Port 9 on loopback: nothing listens there
            url: "http://127.0.0.1:9/weight.bin".to_string(),
            staging_path: temp_dir.path().join(".weight.bin.partial"),
            resume: None,
        };

        let result = transport
            .fetch(request, Arc::new(|_, _| {}), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportFailure::Failed { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_response() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = FetchRequest {
            url: "http://10.255.255.1/weight.bin".to_string(),
            staging_path: temp_dir.path().join(".weight.bin.partial"),
            resume: None,
        };

        let result = HttpTransport::new()
            .fetch(request, Arc::new(|_, _| {}), cancel)
            .await;
        assert_eq!(result, Err(TransportFailure::Cancelled));
    }
}
