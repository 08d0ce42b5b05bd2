use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Proxy};
use tokio::fs;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::UploadSection;

use super::error::{UploadError, UploadResult};
use super::route::UploadRoute;

/// Callback receiving `(bytes_sent, total_bytes)`.
pub type UploadProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareReference {
    pub share_code: String,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        local_path: &Path,
        file_name: &str,
        route: &UploadRoute,
        progress: UploadProgress,
    ) -> UploadResult<ShareReference>;
}

/// Last moment a transfer made headway, shared with the body stream.
#[derive(Debug, Clone)]
struct Activity {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Streams files with `PUT {base_url}/api/upload/{name}`; the response body
/// is the share code.
///
/// There is no overall deadline: a transfer only fails once nothing has moved
/// for `stall_timeout`.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    base_url: String,
    chunk_size: usize,
    connect_timeout: Duration,
    stall_timeout: Duration,
}

impl HttpUploader {
    pub fn new(config: &UploadSection) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chunk_size: config.chunk_size_bytes.max(1),
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            stall_timeout: Duration::from_secs(config.stall_timeout_seconds),
        }
    }

    pub fn upload_url(&self, file_name: &str) -> String {
        format!(
            "{}/api/upload/{}",
            self.base_url,
            urlencoding::encode(file_name)
        )
    }

    fn client_for(&self, route: &UploadRoute) -> UploadResult<Client> {
        let mut builder = Client::builder().connect_timeout(self.connect_timeout);
        builder = match route.proxy.as_deref() {
            Some(proxy) => builder
                .proxy(Proxy::all(proxy).map_err(|err| UploadError::Route(err.to_string()))?),
            None => builder.no_proxy(),
        };
        builder
            .build()
            .map_err(|err| UploadError::Network(err.to_string()))
    }

    /// Drives `work` until it finishes or `activity` has been idle for the
    /// stall timeout.
    async fn watch<F: Future>(&self, activity: &Activity, work: F) -> UploadResult<F::Output> {
        tokio::pin!(work);
        let period = (self.stall_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = ticker.tick() => {
                    if activity.idle() >= self.stall_timeout {
                        warn!(after = ?self.stall_timeout, "upload stalled");
                        return Err(UploadError::Stalled {
                            after: self.stall_timeout,
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        local_path: &Path,
        file_name: &str,
        route: &UploadRoute,
        progress: UploadProgress,
    ) -> UploadResult<ShareReference> {
        let io_err = |source: std::io::Error| UploadError::Io {
            path: local_path.to_path_buf(),
            source,
        };
        let file = fs::File::open(local_path).await.map_err(io_err)?;
        let total = file.metadata().await.map_err(io_err)?.len();
        let activity = Activity::new();
        let stream_activity = activity.clone();
        let mut sent: u64 = 0;
        let stream = ReaderStream::with_capacity(file, self.chunk_size).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                stream_activity.touch();
                sent += bytes.len() as u64;
                progress(sent, total);
            }
            chunk
        });

        let url = self.upload_url(file_name);
        debug!(url = %url, route = route.label(), bytes = total, "uploading file");
        let request = self
            .client_for(route)?
            .put(&url)
            .header(CONTENT_LENGTH, total)
            .body(Body::wrap_stream(stream))
            .send();
        let response = self.watch(&activity, request).await??;
        activity.touch();
        let status = response.status();
        let body = self.watch(&activity, response.text()).await??;
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let share_code = body.trim().to_string();
        if share_code.is_empty() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body: "empty share code".into(),
            });
        }
        Ok(ShareReference { share_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixture_config;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpSocket, TcpStream};

    /// Accepts one request, returns `(request_line, body)` and answers with
    /// `status` / `reply`.
    async fn serve_once(
        listener: TcpListener,
        status: &'static str,
        reply: &'static str,
    ) -> (String, Vec<u8>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (head, body) = read_request(&mut socket, None).await;
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
            reply.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let request_line = head.lines().next().unwrap_or_default().to_string();
        (request_line, body)
    }

    /// Reads one request; with `pace`, takes at most `bytes` of body per `delay`.
    async fn read_request(socket: &mut TcpStream, pace: Option<(usize, Duration)>) -> (String, Vec<u8>) {
        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        let header_end = loop {
            let read = socket.read(&mut chunk).await.unwrap();
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let length: usize = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())?
            })
            .unwrap_or(0);
        let mut budget = pace.map_or(usize::MAX, |(bytes, _)| bytes);
        while buffer.len() < header_end + length {
            if budget == 0 {
                if let Some((bytes, delay)) = pace {
                    tokio::time::sleep(delay).await;
                    budget = bytes;
                }
            }
            let want = chunk.len().min(budget);
            let read = socket.read(&mut chunk[..want]).await.unwrap();
            assert!(read > 0, "client closed the connection mid-body");
            budget -= read;
            buffer.extend_from_slice(&chunk[..read]);
        }
        (head, buffer[header_end..header_end + length].to_vec())
    }

    fn uploader_for(listener: &TcpListener, chunk: usize) -> HttpUploader {
        uploader_with_stall(listener, chunk, 600)
    }

    fn uploader_with_stall(listener: &TcpListener, chunk: usize, stall_seconds: u64) -> HttpUploader {
        let mut config = fixture_config().upload;
        config.base_url = format!("http://{}/", listener.local_addr().unwrap());
        config.chunk_size_bytes = chunk;
        config.stall_timeout_seconds = stall_seconds;
        HttpUploader::new(&config)
    }

    /// Listener with a small receive buffer so the client feels back-pressure.
    fn narrow_listener() -> TcpListener {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(16 * 1024).unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        socket.listen(8).unwrap()
    }

    #[test]
    fn upload_url_encodes_file_name() {
        let uploader = HttpUploader::new(&fixture_config().upload);
        assert_eq!(
            uploader.upload_url("My Clip.mp4"),
            "http://127.0.0.1:4719/api/upload/My%20Clip.mp4"
        );
    }

    #[tokio::test]
    async fn streams_file_and_returns_share_code() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![1u8; 10_000]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uploader = uploader_for(&listener, 4096);
        let server = tokio::spawn(serve_once(listener, "200 OK", "share-123\n"));

        let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: UploadProgress = Arc::new(move |sent: u64, total: u64| {
            sink.lock().unwrap().push((sent, total));
        });
        let share = uploader
            .upload(&path, "My Clip.mp4", &UploadRoute::direct(), progress)
            .await
            .unwrap();

        assert_eq!(share.share_code, "share-123");
        let (request_line, body) = server.await.unwrap();
        assert_eq!(request_line, "PUT /api/upload/My%20Clip.mp4 HTTP/1.1");
        assert_eq!(body.len(), 10_000);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied(), Some((10_000, 10_000)));
        assert!(seen.len() >= 3);
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.srt");
        std::fs::write(&path, b"1\n").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uploader = uploader_for(&listener, 1024);
        let server = tokio::spawn(serve_once(listener, "507 Insufficient Storage", "full"));

        let err = uploader
            .upload(&path, "clip.srt", &UploadRoute::direct(), Arc::new(|_: u64, _: u64| {}))
            .await
            .unwrap_err();
        server.await.unwrap();
        match err {
            UploadError::Rejected { status, body } => {
                assert_eq!(status, 507);
                assert_eq!(body, "full");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let uploader = HttpUploader::new(&fixture_config().upload);
        let err = uploader
            .upload(
                &dir.path().join("gone.mp4"),
                "gone.mp4",
                &UploadRoute::direct(),
                Arc::new(|_: u64, _: u64| {}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
    }

    #[tokio::test]
    async fn slow_but_steady_upload_outlives_stall_timeout() {
        const SIZE: usize = 16 * 1024 * 1024;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.mp4");
        std::fs::write(&path, vec![3u8; SIZE]).unwrap();
        let listener = narrow_listener();
        let uploader = uploader_with_stall(&listener, 64 * 1024, 2);
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (_, body) =
                read_request(&mut socket, Some((512 * 1024, Duration::from_millis(100)))).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 9\r\nconnection: close\r\n\r\nshare-big")
                .await
                .unwrap();
            body.len()
        });

        let started = std::time::Instant::now();
        let share = uploader
            .upload(&path, "big.mp4", &UploadRoute::direct(), Arc::new(|_: u64, _: u64| {}))
            .await
            .unwrap();
        assert_eq!(share.share_code, "share-big");
        assert_eq!(server.await.unwrap(), SIZE);
        assert!(started.elapsed() > Duration::from_secs(2));
    }

    #[tokio::test]
    async fn silent_server_is_reported_as_stalled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.srt");
        std::fs::write(&path, vec![b'x'; 1024]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uploader = uploader_with_stall(&listener, 256, 1);
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket, None).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let started = std::time::Instant::now();
        let err = uploader
            .upload(&path, "clip.srt", &UploadRoute::direct(), Arc::new(|_: u64, _: u64| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Stalled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
