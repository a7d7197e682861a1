//! HTTP protocol client for the card's CGI endpoints
//!
//! Every endpoint is a plain GET. Command endpoints (`command.cgi?op=N`)
//! answer with a short text body; files are served from their path under the
//! card's root. All of them go through one download primitive that handles
//! status classification, the size check, the request timeout, the wireless
//! liveness monitor and cancellation.

use crate::core::error::{Result, SyncError};
use crate::core::progress::ProgressReporter;
use crate::device::entry::normalize_directory;
use crate::device::identity::Capacity;
use crate::device::link::{watch_link, LinkProbe, DEFAULT_MONITOR_INTERVAL};
use crate::device::retry::RetryPolicy;
use crate::device::traits::{CardApi, ProgressSink};
use log::{debug, trace};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default address of the card's web server in access-point mode
pub const DEFAULT_REMOTE_ROOT: &str = "http://flashair/";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the up-front buffer reservation for a download
const MAX_PREALLOCATE: u64 = 64 * 1024 * 1024;

/// Escapes everything but unreserved characters and the path separator
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const OP_LIST: u32 = 100;
const OP_COUNT: u32 = 101;
const OP_UPDATED: u32 = 102;
const OP_SSID: u32 = 104;
const OP_FIRMWARE: u32 = 108;
const OP_UPLOAD: u32 = 118;
const OP_CID: u32 = 120;
const OP_WRITE_TIMESTAMP: u32 = 121;
const OP_CAPACITY: u32 = 140;

/// Settings for [`CardClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the card, e.g. `http://flashair/`
    pub remote_root: String,
    /// Timeout for headers, a whole small body, or one streamed chunk
    pub timeout: Duration,
    /// Time between two liveness probes
    pub monitor_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// `CardApi` over HTTP
pub struct CardClient {
    http: reqwest::Client,
    config: ClientConfig,
    link: Option<Arc<dyn LinkProbe>>,
}

impl CardClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .no_proxy()
            .build()
            .map_err(|e| SyncError::unexpected("building HTTP client", e))?;

        let mut config = config;
        if !config.remote_root.ends_with('/') {
            config.remote_root.push('/');
        }

        Ok(Self {
            http,
            config,
            link: None,
        })
    }

    /// Abort transfers when `probe` reports the link as down
    pub fn with_link_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.link = Some(probe);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn command_url(&self, op: u32) -> String {
        format!("{}command.cgi?op={}", self.config.remote_root, op)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}{}",
            self.config.remote_root,
            encode_path(file_path.trim_start_matches('/'))
        )
    }

    /// `command.cgi?op=N&DIR=<dir>` with the root spelled `/`
    fn directory_url(&self, op: u32, directory: &str) -> String {
        let dir = match normalize_directory(directory) {
            "" => "/",
            d => d,
        };
        format!("{}&DIR={}", self.command_url(op), encode_path(dir))
    }

    async fn get_text(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let body = self.download(url, url, 0, None, cancel).await?;
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }

    async fn get_number<T: std::str::FromStr>(
        &self,
        op: u32,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let text = self.get_text(&self.command_url(op), cancel).await?;
        text.parse()
            .map_err(|_| SyncError::Protocol(format!("op={} answered '{}'", op, text)))
    }

    // =========================================================================
    // Download primitive
    // =========================================================================

    /// GET `url` and return its body
    ///
    /// `label` names the resource in errors (the remote path for files).
    pub async fn download(
        &self,
        url: &str,
        label: &str,
        expected_size: u64,
        progress: Option<ProgressSink<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = self
            .config
            .retry
            .run(cancel, move |attempt| {
                if attempt > 0 {
                    debug!("Retrying '{}' (attempt {})", label, attempt + 1);
                }
                self.fetch_headers(url, label, expected_size, cancel)
            })
            .await?;

        let monitor = watch_link(self.link.clone(), self.config.monitor_interval);
        tokio::pin!(monitor);

        match progress {
            Some(sink) if expected_size > 0 => {
                self.read_streamed(response, label, expected_size, sink, monitor, cancel)
                    .await
            }
            _ => {
                self.read_whole(response, label, expected_size, monitor, cancel)
                    .await
            }
        }
    }

    async fn fetch_headers(
        &self,
        url: &str,
        label: &str,
        expected_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        trace!("GET {}", url);
        let monitor = watch_link(self.link.clone(), self.config.monitor_interval);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            err = monitor => return Err(err),
            result = tokio::time::timeout(self.config.timeout, self.http.get(url).send()) => {
                match result {
                    Err(_) => return Err(SyncError::Timeout),
                    Ok(Err(e)) => return Err(classify_request_error(e)),
                    Ok(Ok(response)) => response,
                }
            }
        };

        classify_status(response.status(), label)?;

        if expected_size > 0 {
            if let Some(declared) = response.content_length() {
                if declared != expected_size {
                    return Err(SyncError::RemoteFileInvalid(format!(
                        "{}: card declares {} bytes, listing says {}",
                        label, declared, expected_size
                    )));
                }
            }
        }

        Ok(response)
    }

    async fn read_whole<M>(
        &self,
        response: Response,
        label: &str,
        expected_size: u64,
        monitor: Pin<&mut M>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>
    where
        M: Future<Output = SyncError>,
    {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            err = monitor => return Err(err),
            result = tokio::time::timeout(self.config.timeout, response.bytes()) => {
                match result {
                    Err(_) => return Err(SyncError::Timeout),
                    Ok(Err(e)) => return Err(classify_body_error(e)),
                    Ok(Ok(body)) => body,
                }
            }
        };

        if expected_size > 0 && body.len() as u64 != expected_size {
            return Err(SyncError::RemoteFileInvalid(format!(
                "{}: received {} bytes, expected {}",
                label,
                body.len(),
                expected_size
            )));
        }
        Ok(body.to_vec())
    }

    async fn read_streamed<M>(
        &self,
        mut response: Response,
        label: &str,
        expected_size: u64,
        sink: ProgressSink<'_>,
        mut monitor: Pin<&mut M>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>
    where
        M: Future<Output = SyncError>,
    {
        let mut reporter = ProgressReporter::start(sink, expected_size);
        let mut body = Vec::with_capacity(expected_size.min(MAX_PREALLOCATE) as usize);

        loop {
            let read = read_chunk(
                &mut response,
                &mut body,
                self.config.timeout,
                monitor.as_mut(),
                cancel,
            )
            .await;

            match read {
                Ok(Some(_)) => {
                    let received = body.len() as u64;
                    if received > expected_size {
                        reporter.fail(received);
                        return Err(SyncError::RemoteFileInvalid(format!(
                            "{}: more than the expected {} bytes",
                            label, expected_size
                        )));
                    }
                    reporter.advance(received);
                }
                Ok(None) => break,
                Err(e) => {
                    reporter.fail(body.len() as u64);
                    return Err(e);
                }
            }
        }

        let received = body.len() as u64;
        if received < expected_size {
            reporter.fail(received);
            return Err(SyncError::RemoteFileInvalid(format!(
                "{}: stream ended after {} of {} bytes",
                label, received, expected_size
            )));
        }
        Ok(body)
    }
}

/// Read the next chunk of `response` into `buffer`
///
/// Races the read against `timeout`, the liveness `monitor` and `cancel`.
/// Returns the number of bytes appended, or `None` at the end of the body.
/// When a race other than the read wins, the in-flight read is dropped.
pub async fn read_chunk<M>(
    response: &mut Response,
    buffer: &mut Vec<u8>,
    timeout: Duration,
    monitor: Pin<&mut M>,
    cancel: &CancellationToken,
) -> Result<Option<usize>>
where
    M: Future<Output = SyncError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Canceled),
        err = monitor => Err(err),
        result = tokio::time::timeout(timeout, response.chunk()) => match result {
            Err(_) => Err(SyncError::Timeout),
            Ok(Err(e)) => Err(classify_body_error(e)),
            Ok(Ok(None)) => Ok(None),
            Ok(Ok(Some(chunk))) => {
                buffer.extend_from_slice(&chunk);
                Ok(Some(chunk.len()))
            }
        },
    }
}

/// Map an HTTP status to the error the orchestrator understands
fn classify_status(status: StatusCode, label: &str) -> Result<()> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::INTERNAL_SERVER_ERROR => {
            Err(SyncError::ConnectionUnable(format!("HTTP {} for {}", status.as_u16(), label)))
        }
        StatusCode::NOT_FOUND => Err(SyncError::RemoteFileNotFound(label.to_string())),
        other => Err(SyncError::Protocol(format!(
            "unexpected HTTP {} for {}",
            other.as_u16(),
            label
        ))),
    }
}

fn classify_request_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else if e.is_connect() {
        SyncError::ConnectionUnable(e.to_string())
    } else if e.is_request() {
        SyncError::ConnectionLost
    } else {
        SyncError::unexpected("sending request to the card", e)
    }
}

fn classify_body_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else if e.is_body() || e.is_decode() || e.is_request() {
        SyncError::ConnectionLost
    } else {
        SyncError::unexpected("reading response from the card", e)
    }
}

impl CardApi for CardClient {
    async fn list_raw(&self, directory: &str, cancel: &CancellationToken) -> Result<String> {
        let url = self.directory_url(OP_LIST, directory);
        let body = self.download(&url, directory, 0, None, cancel).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn file_count(&self, directory: &str, cancel: &CancellationToken) -> Result<u32> {
        let url = self.directory_url(OP_COUNT, directory);
        let text = self.get_text(&url, cancel).await?;
        text.parse()
            .map_err(|_| SyncError::Protocol(format!("file count answered '{}'", text)))
    }

    async fn thumbnail(&self, file_path: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let url = format!(
            "{}thumbnail.cgi?{}",
            self.config.remote_root,
            encode_path(file_path)
        );
        self.download(&url, file_path, 0, None, cancel).await
    }

    async fn download_file(
        &self,
        file_path: &str,
        expected_size: u64,
        progress: Option<ProgressSink<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let url = self.file_url(file_path);
        self.download(&url, file_path, expected_size, progress, cancel)
            .await
    }

    async fn delete_file(&self, file_path: &str, cancel: &CancellationToken) -> Result<()> {
        let url = format!(
            "{}upload.cgi?DEL={}",
            self.config.remote_root,
            encode_path(file_path)
        );
        let answer = match self.get_text(&url, cancel).await {
            Ok(answer) => answer,
            Err(e) if e.is_canceled() || e.is_connection_class() => return Err(e),
            Err(e) => {
                debug!("Delete of '{}' failed: {}", file_path, e);
                return Err(SyncError::RemoteFileDeletionFailed(file_path.to_string()));
            }
        };

        if answer.eq_ignore_ascii_case("SUCCESS") {
            Ok(())
        } else {
            debug!("Delete of '{}' answered '{}'", file_path, answer);
            Err(SyncError::RemoteFileDeletionFailed(file_path.to_string()))
        }
    }

    async fn firmware_version(&self, cancel: &CancellationToken) -> Result<String> {
        self.get_text(&self.command_url(OP_FIRMWARE), cancel).await
    }

    async fn cid(&self, cancel: &CancellationToken) -> Result<String> {
        self.get_text(&self.command_url(OP_CID), cancel).await
    }

    async fn ssid(&self, cancel: &CancellationToken) -> Result<String> {
        self.get_text(&self.command_url(OP_SSID), cancel).await
    }

    async fn capacity(&self, cancel: &CancellationToken) -> Result<Capacity> {
        let text = self.get_text(&self.command_url(OP_CAPACITY), cancel).await?;
        Capacity::parse(&text)
            .ok_or_else(|| SyncError::Protocol(format!("capacity answered '{}'", text)))
    }

    async fn write_timestamp(&self, cancel: &CancellationToken) -> Result<i64> {
        self.get_number(OP_WRITE_TIMESTAMP, cancel).await
    }

    async fn upload_enabled(&self, cancel: &CancellationToken) -> Result<bool> {
        let flag: u32 = self.get_number(OP_UPLOAD, cancel).await?;
        Ok(flag == 1)
    }

    async fn is_updated(&self, cancel: &CancellationToken) -> Result<bool> {
        let flag: u32 = self.get_number(OP_UPDATED, cancel).await?;
        Ok(flag == 1)
    }
}

/// Percent-encode a card path for use in a URL path or query argument
fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::ProgressSample;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Canned answer of the fake card
    #[derive(Clone)]
    struct Reply {
        status: u16,
        body: Vec<u8>,
        /// `None` omits the header and closes the connection to end the body
        content_length: Option<usize>,
        /// Send headers, then never send the body
        stall: bool,
    }

    impl Reply {
        fn ok(body: impl Into<Vec<u8>>) -> Self {
            let body = body.into();
            Self {
                status: 200,
                content_length: Some(body.len()),
                body,
                stall: false,
            }
        }

        fn status(status: u16) -> Self {
            Self {
                status,
                ..Self::ok("")
            }
        }
    }

    /// Start a throwaway HTTP responder; returns its root URL
    async fn serve<F>(handler: F) -> String
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let text = String::from_utf8_lossy(&request);
                    let target = text.split_whitespace().nth(1).unwrap_or("").to_string();
                    let reply = handler(&target);

                    let mut head = format!("HTTP/1.1 {} Card\r\n", reply.status);
                    if let Some(len) = reply.content_length {
                        head.push_str(&format!("Content-Length: {}\r\n", len));
                    }
                    head.push_str("Connection: close\r\n\r\n");
                    let _ = socket.write_all(head.as_bytes()).await;

                    if reply.stall {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }
                    let _ = socket.write_all(&reply.body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}/", address)
    }

    fn client(root: String) -> CardClient {
        CardClient::new(ClientConfig {
            remote_root: root,
            timeout: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(2),
            retry: RetryPolicy {
                max_retries: 3,
                backoff: Duration::from_millis(10),
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_directory_parses_listing() {
        let root = serve(|target| {
            if target == "/command.cgi?op=100&DIR=/DCIM" {
                Reply::ok(
                    "WLANSD_FILELIST\r\n/DCIM,100__TSB,0,16,18765,24601\r\n/DCIM,IMG_0001.JPG,2048576,32,18765,24601\r\n",
                )
            } else {
                Reply::status(404)
            }
        })
        .await;

        let cancel = CancellationToken::new();
        let entries = client(root).list_directory("/DCIM/", &cancel).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory());
        assert_eq!(entries[1].size(), 2048576);
    }

    #[tokio::test]
    async fn test_root_is_listed_as_slash() {
        let root = serve(|target| {
            if target == "/command.cgi?op=100&DIR=/" {
                Reply::ok(",DCIM,0,16,18765,24601\r\n")
            } else {
                Reply::status(404)
            }
        })
        .await;

        let cancel = CancellationToken::new();
        let entries = client(root).list_directory("/", &cancel).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_path(), "/DCIM");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let root = serve(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Reply::status(500)
            } else {
                Reply::ok("F24A6W3AW3.00.01")
            }
        })
        .await;

        let cancel = CancellationToken::new();
        let firmware = client(root).firmware_version(&cancel).await.unwrap();
        assert_eq!(firmware, "F24A6W3AW3.00.01");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_run_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let root = serve(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Reply::status(401)
        })
        .await;

        let cancel = CancellationToken::new();
        let err = client(root).ssid(&cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionUnable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let root = serve(|target| match target {
            "/DCIM/GONE.JPG" => Reply::status(404),
            _ => Reply::status(503),
        })
        .await;
        let client = client(root);
        let cancel = CancellationToken::new();

        let err = client
            .download_file("/DCIM/GONE.JPG", 10, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteFileNotFound(ref p) if p == "/DCIM/GONE.JPG"));

        let err = client.cid(&cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_content_length_mismatch_is_invalid() {
        let root = serve(|_| Reply::ok(vec![7u8; 100])).await;
        let cancel = CancellationToken::new();

        let err = client(root)
            .download_file("/DCIM/A.JPG", 120, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteFileInvalid(_)));
    }

    #[tokio::test]
    async fn test_streamed_download_reports_progress() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let served = payload.clone();
        let root = serve(move |_| Reply::ok(served.clone())).await;
        let cancel = CancellationToken::new();

        let mut samples: Vec<ProgressSample> = Vec::new();
        let mut sink = |s: ProgressSample| samples.push(s);
        let body = client(root)
            .download_file("/DCIM/A.JPG", payload.len() as u64, Some(&mut sink), &cancel)
            .await
            .unwrap();

        assert_eq!(body, payload);
        assert!(samples[0].is_first);
        assert_eq!(samples[0].current, 0);
        let last = samples.last().unwrap();
        assert_eq!(last.current, payload.len() as u64);
        assert!(!last.is_error);
        assert!(samples.windows(2).all(|w| w[0].current <= w[1].current));
    }

    #[tokio::test]
    async fn test_premature_end_is_invalid() {
        let root = serve(|_| Reply {
            content_length: None,
            ..Reply::ok(vec![1u8; 50])
        })
        .await;
        let cancel = CancellationToken::new();

        let mut errors = 0;
        let mut sink = |s: ProgressSample| {
            if s.is_error {
                errors += 1;
            }
        };
        let err = client(root)
            .download_file("/DCIM/A.JPG", 100, Some(&mut sink), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteFileInvalid(_)));
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let root = serve(|_| Reply {
            stall: true,
            ..Reply::ok(vec![1u8; 10])
        })
        .await;
        let cancel = CancellationToken::new();

        let err = client(root)
            .download_file("/DCIM/A.JPG", 10, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_abandons_download() {
        let root = serve(|_| Reply {
            stall: true,
            ..Reply::ok(vec![1u8; 10])
        })
        .await;
        let mut config = client(root).config().clone();
        config.timeout = Duration::from_secs(20);
        let client = CardClient::new(config).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client
            .download_file("/DCIM/A.JPG", 10, None, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_delete_and_flags() {
        let root = serve(|target| match target {
            "/upload.cgi?DEL=/DCIM/A.JPG" => Reply::ok("SUCCESS"),
            "/upload.cgi?DEL=/DCIM/B.JPG" => Reply::ok("ERROR"),
            "/command.cgi?op=118" => Reply::ok("1"),
            "/command.cgi?op=102" => Reply::ok("0"),
            "/command.cgi?op=140" => Reply::ok("1000/2000,512"),
            "/command.cgi?op=101&DIR=/DCIM" => Reply::ok("42"),
            _ => Reply::status(404),
        })
        .await;
        let client = client(root);
        let cancel = CancellationToken::new();

        client.delete_file("/DCIM/A.JPG", &cancel).await.unwrap();
        let err = client.delete_file("/DCIM/B.JPG", &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteFileDeletionFailed(_)));

        assert!(client.upload_enabled(&cancel).await.unwrap());
        assert!(!client.is_updated(&cancel).await.unwrap());
        assert_eq!(client.capacity(&cancel).await.unwrap().total_bytes, 1_024_000);
        assert_eq!(client.file_count("/DCIM/", &cancel).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_paths_are_percent_encoded() {
        let root = serve(|target| match target {
            "/DCIM/A%231%20B.JPG" => Reply::ok("photo"),
            "/thumbnail.cgi?/DCIM/A%231%20B.JPG" => Reply::ok("thumb"),
            "/upload.cgi?DEL=/DCIM/C%26D%25.JPG" => Reply::ok("SUCCESS"),
            "/command.cgi?op=100&DIR=/DCIM/X%23Y" => Reply::ok(""),
            _ => Reply::status(404),
        })
        .await;
        let client = client(root);
        let cancel = CancellationToken::new();

        let body = client
            .download_file("/DCIM/A#1 B.JPG", 5, None, &cancel)
            .await
            .unwrap();
        assert_eq!(body, b"photo");
        assert_eq!(client.thumbnail("/DCIM/A#1 B.JPG", &cancel).await.unwrap(), b"thumb");
        client.delete_file("/DCIM/C&D%.JPG", &cancel).await.unwrap();
        assert!(client.list_directory("/DCIM/X#Y", &cancel).await.unwrap().is_empty());
    }

    struct LinkDown;

    impl LinkProbe for LinkDown {
        fn is_link_up(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_link_drop_mid_transfer_is_connection_lost() {
        let root = serve(|_| Reply {
            stall: true,
            ..Reply::ok(vec![1u8; 10])
        })
        .await;
        let mut config = client(root).config().clone();
        config.timeout = Duration::from_secs(20);
        config.monitor_interval = Duration::from_millis(300);
        let client = CardClient::new(config).unwrap().with_link_probe(Arc::new(LinkDown));
        let cancel = CancellationToken::new();

        let mut sink = |_: ProgressSample| {};
        let streamed = client
            .download_file("/DCIM/A.JPG", 10, Some(&mut sink), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(streamed, SyncError::ConnectionLost));

        let whole = client
            .download_file("/DCIM/A.JPG", 10, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(whole, SyncError::ConnectionLost));
    }
}
