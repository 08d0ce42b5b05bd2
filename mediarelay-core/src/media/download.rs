use std::path::Path;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloadSection;
use crate::events::EventSender;
use crate::progress::Stage;
use crate::task::Component;

use super::error::{MediaError, MediaResult};
use super::types::SourceFile;

/// Granularity of byte-count reports when the source length is unknown.
const UNKNOWN_LENGTH_STEP: u64 = 1024 * 1024;
/// Bytes at which an unknown-length download reports half of its stage.
const UNKNOWN_LENGTH_HALF: f64 = 64.0 * 1024.0 * 1024.0;
/// Ceiling for the estimated fraction of an unknown-length download.
const UNKNOWN_LENGTH_CEILING: f64 = 0.95;

/// Streams a source URL into the task namespace, reporting `download` progress.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    read_timeout: Duration,
}

impl Downloader {
    pub fn new(config: &DownloadSection) -> MediaResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()
            .map_err(|err| MediaError::Network(err.to_string()))?;
        Ok(Self {
            client,
            read_timeout: Duration::from_secs(config.read_timeout_seconds),
        })
    }

    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        file_name: &str,
        tracked: Component,
        events: &EventSender,
    ) -> MediaResult<SourceFile> {
        let parsed = Url::parse(url).map_err(|err| MediaError::Download(err.to_string()))?;
        let (content_type, bytes) = if parsed.scheme() == "file" {
            let source_path = parsed
                .to_file_path()
                .map_err(|_| MediaError::Download("invalid file url".into()))?;
            let file = fs::File::open(&source_path)
                .await
                .map_err(|source| MediaError::Io {
                    path: source_path.clone(),
                    source,
                })?;
            let total = file.metadata().await.ok().map(|meta| meta.len());
            let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(MediaError::from));
            let sink = StreamSink::new(dest, self.read_timeout, tracked, events);
            (None, sink.drain(stream, total).await?)
        } else {
            let response = timeout(self.read_timeout, self.client.get(parsed).send())
                .await
                .map_err(|_| {
                    MediaError::Download(format!(
                        "no response within {}s",
                        self.read_timeout.as_secs()
                    ))
                })??
                .error_for_status()
                .map_err(|err| MediaError::Download(err.to_string()))?;
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let total = response.content_length();
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(MediaError::from));
            let sink = StreamSink::new(dest, self.read_timeout, tracked, events);
            (content_type, sink.drain(stream, total).await?)
        };

        events.progress(Stage::Download, 1.0);
        events.send_status(events.update(tracked).details("download complete"));
        info!(task_id = %events.task_id(), bytes, path = %dest.display(), "download finished");
        Ok(SourceFile {
            path: dest.to_path_buf(),
            file_name: file_name.to_string(),
            content_type,
            bytes,
        })
    }
}

/// Writes a byte stream to `dest`, reporting progress as it goes.
struct StreamSink<'a> {
    dest: &'a Path,
    read_timeout: Duration,
    tracked: Component,
    events: &'a EventSender,
}

impl<'a> StreamSink<'a> {
    fn new(dest: &'a Path, read_timeout: Duration, tracked: Component, events: &'a EventSender) -> Self {
        Self {
            dest,
            read_timeout,
            tracked,
            events,
        }
    }

    async fn drain<S, B>(&self, mut stream: S, total: Option<u64>) -> MediaResult<u64>
    where
        S: Stream<Item = MediaResult<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let io_err = |source: std::io::Error| MediaError::Io {
            path: self.dest.to_path_buf(),
            source,
        };
        let mut file = fs::File::create(self.dest).await.map_err(io_err)?;
        let total = total.filter(|total| *total > 0);
        let mut received: u64 = 0;
        let mut last_report = 0;
        loop {
            let next = timeout(self.read_timeout, stream.next()).await.map_err(|_| {
                warn!(task_id = %self.events.task_id(), received, "source stream stalled");
                MediaError::Download(format!(
                    "no data received for {}s after {received} bytes",
                    self.read_timeout.as_secs()
                ))
            })?;
            let Some(chunk) = next else {
                break;
            };
            let data = chunk?;
            let data = data.as_ref();
            file.write_all(data).await.map_err(io_err)?;
            received += data.len() as u64;
            match total {
                Some(total) => {
                    let fraction = (received as f64 / total as f64).min(1.0);
                    let percent = (fraction * 100.0) as u64;
                    if percent > last_report {
                        last_report = percent;
                        self.report(fraction, format!("downloading ({percent}%)"));
                    }
                }
                None => {
                    let steps = received / UNKNOWN_LENGTH_STEP;
                    if steps > last_report {
                        last_report = steps;
                        self.report(
                            unknown_length_fraction(received),
                            format!("downloading ({steps} MiB)"),
                        );
                    }
                }
            }
        }
        file.flush().await.map_err(io_err)?;
        debug!(task_id = %self.events.task_id(), received, "source stream drained");
        Ok(received)
    }

    fn report(&self, fraction: f64, details: String) {
        self.events.progress(Stage::Download, fraction);
        self.events
            .send_status(self.events.update(self.tracked).details(details));
    }
}

/// Grows towards the ceiling without reaching it; the final 1.0 is only
/// reported once the stream ends.
fn unknown_length_fraction(received: u64) -> f64 {
    let received = received as f64;
    UNKNOWN_LENGTH_CEILING * received / (received + UNKNOWN_LENGTH_HALF)
}
