use std::io;
use std::path::Path;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::gate::{CapabilityGate, GateError};
use super::paths::temp_path_for;

const NOMEDIA: &str = ".nomedia";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("download failed for {url}: HTTP {status}")]
    Status { url: Url, status: StatusCode },
    #[error("download failed for {url}: empty body")]
    EmptyBody { url: Url },
    #[error("interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFetch {
    AlreadyPresent,
    Downloaded,
}

#[derive(Clone, Default)]
pub struct TransferClient {
    http: Client,
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_http(Client::new())
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    /// Downloads `url` to `target` unless a file is already there.
    ///
    /// The body is streamed into a sibling `.tmp` file which is renamed into
    /// place only after the whole body arrived, so `target` is either absent
    /// or complete.
    pub async fn fetch_image(
        &self,
        url: Url,
        target: &Path,
        gate: &CapabilityGate,
        cancel: &CancellationToken,
    ) -> Result<ImageFetch, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Interrupted);
        }
        gate.check_storage()?;
        if tokio::fs::try_exists(target).await? {
            return Ok(ImageFetch::AlreadyPresent);
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        gate.check_can_download()?;
        let response = self.http.get(url.clone()).send().await?;
        if response.status() != StatusCode::OK {
            return Err(TransferError::Status {
                url,
                status: response.status(),
            });
        }

        let partial = temp_path_for(target);
        remove_if_exists(&partial).await?;
        let written = match write_body(response, &partial, gate, cancel).await {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };
        if written == 0 {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::EmptyBody { url });
        }

        gate.check_storage()?;
        tokio::fs::rename(&partial, target).await?;
        Ok(ImageFetch::Downloaded)
    }
}

async fn write_body(
    response: reqwest::Response,
    partial: &Path,
    gate: &CapabilityGate,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(TransferError::Interrupted);
        }
        gate.check_storage()?;
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Creates the `.nomedia` marker that keeps media scanners out of the base
/// directory.
pub async fn ensure_nomedia(base_dir: &Path, gate: &CapabilityGate) -> Result<(), TransferError> {
    gate.check_storage()?;
    let marker = base_dir.join(NOMEDIA);
    if tokio::fs::try_exists(&marker).await? {
        return Ok(());
    }
    tokio::fs::create_dir_all(base_dir).await?;
    tokio::fs::File::create(&marker).await?;
    Ok(())
}

pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::gate::{NetworkInfo, NetworkMonitor, StorageSwitch};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn open_gate() -> CapabilityGate {
        CapabilityGate::new(
            Arc::new(NetworkMonitor::new(NetworkInfo {
                connected: true,
                on_wifi: true,
            })),
            Arc::new(StorageSwitch::new(true)),
            true,
        )
    }

    fn url(server: &MockServer, suffix: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), suffix)).unwrap()
    }

    #[tokio::test]
    async fn downloads_image_to_target_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/foo/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png-bytes"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("foo/a.png");
        let fetched = TransferClient::new()
            .fetch_image(
                url(&server, "/foo/a.png"),
                &target,
                &open_gate(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(fetched, ImageFetch::Downloaded);
        assert_eq!(std::fs::read(&target).unwrap(), b"png-bytes");
        assert!(!temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn existing_file_is_never_downloaded_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("a.png");
        std::fs::write(&target, b"old").unwrap();

        let fetched = TransferClient::new()
            .fetch_image(
                url(&server, "/a.png"),
                &target,
                &open_gate(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(fetched, ImageFetch::AlreadyPresent);
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }

    #[tokio::test]
    async fn stale_temp_file_is_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("a.png");
        std::fs::write(temp_path_for(&target), b"stale partial content from a crash").unwrap();

        TransferClient::new()
            .fetch_image(
                url(&server, "/a.png"),
                &target,
                &open_gate(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"fresh");
        assert!(!temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn non_200_and_empty_bodies_fail_without_creating_target() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty.png"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = TransferClient::new();
        let gate = open_gate();
        let cancel = CancellationToken::new();

        let missing = dir.path().join("missing.png");
        let err = client
            .fetch_image(url(&server, "/missing.png"), &missing, &gate, &cancel)
            .await
            .expect_err("expected status error");
        assert!(matches!(err, TransferError::Status { status, .. } if status == StatusCode::NOT_FOUND));
        assert!(!missing.exists());

        let empty = dir.path().join("empty.png");
        let err = client
            .fetch_image(url(&server, "/empty.png"), &empty, &gate, &cancel)
            .await
            .expect_err("expected empty body error");
        assert!(matches!(err, TransferError::EmptyBody { .. }));
        assert!(!empty.exists());
        assert!(!temp_path_for(&empty).exists());
    }

    #[tokio::test]
    async fn truncated_response_leaves_no_file_at_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let dir = tempdir().unwrap();
        let target = dir.path().join("a.png");
        let result = TransferClient::new()
            .fetch_image(
                Url::parse(&format!("http://{addr}/a.png")).unwrap(),
                &target,
                &open_gate(),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert!(!target.exists());
        assert!(!temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn closed_gates_fail_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("a.png");
        let offline = CapabilityGate::new(
            Arc::new(NetworkMonitor::default()),
            Arc::new(StorageSwitch::new(true)),
            false,
        );
        let err = TransferClient::new()
            .fetch_image(
                url(&server, "/a.png"),
                &target,
                &offline,
                &CancellationToken::new(),
            )
            .await
            .expect_err("expected gate error");
        assert!(matches!(
            err,
            TransferError::Gate(GateError::NetworkUnavailable(_))
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = TransferClient::new()
            .fetch_image(url(&server, "/a.png"), &target, &open_gate(), &cancel)
            .await
            .expect_err("expected interruption");
        assert!(matches!(err, TransferError::Interrupted));
    }

    #[tokio::test]
    async fn body_write_stops_on_cancel_or_lost_storage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png".to_vec()))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let partial = dir.path().join("a.png.tmp");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = reqwest::get(url(&server, "/a.png")).await.unwrap();
        let err = write_body(response, &partial, &open_gate(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Interrupted));

        let unmounted = CapabilityGate::new(
            Arc::new(NetworkMonitor::new(NetworkInfo {
                connected: true,
                on_wifi: true,
            })),
            Arc::new(StorageSwitch::new(false)),
            true,
        );
        let response = reqwest::get(url(&server, "/a.png")).await.unwrap();
        let err = write_body(response, &partial, &unmounted, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Gate(crate::sync::gate::GateError::StorageUnavailable)
        ));
    }

    #[tokio::test]
    async fn nomedia_marker_is_created_once() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("images");
        let gate = open_gate();

        ensure_nomedia(&base, &gate).await.unwrap();
        assert!(base.join(NOMEDIA).exists());
        ensure_nomedia(&base, &gate).await.unwrap();
    }
}
