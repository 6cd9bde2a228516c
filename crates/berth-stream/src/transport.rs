//! The upstream contract the stream consumers depend on.
//!
//! Consumers never build HTTP requests themselves: they ask a
//! [`StreamTransport`] to open a path and receive the status code plus a
//! blocking body reader. [`check_status`] turns error statuses into typed
//! errors before any bytes are interpreted.
//!
//! A body may come with a [`Closer`], which ends a read blocked on a quiet
//! connection from another thread.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use berth_common::constants::STREAM_POLL_INTERVAL_MS;
use berth_common::error::{BerthError, Result};

/// Cap on how much of an error body is read into the error message.
const MAX_ERROR_BODY: u64 = 64 * 1024;

/// HTTP verbs used by stream endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`: events, logs, stats.
    Get,
    /// `POST`: attach.
    Post,
}

impl Method {
    /// Returns the verb as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ends an open response body from another thread.
///
/// Closing is idempotent. Once closed, a read blocked on the body returns
/// end of stream, and the connection is released when the body is dropped.
#[derive(Clone)]
pub struct Closer(Arc<dyn Fn() + Send + Sync>);

impl Closer {
    /// Wraps the action that aborts one body.
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    /// Aborts the body.
    pub fn close(&self) {
        (self.0)();
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closer")
    }
}

/// An opened streaming response.
pub struct StreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, read incrementally as the daemon pushes data.
    pub body: Box<dyn Read + Send>,
    /// Aborts `body` from another thread, when the transport supports it.
    pub closer: Option<Closer>,
}

impl StreamResponse {
    /// Creates a response from a status and any blocking reader.
    pub fn new(status: u16, body: impl Read + Send + 'static) -> Self {
        Self {
            status,
            body: Box::new(body),
            closer: None,
        }
    }

    /// Attaches the closer for this response's body.
    #[must_use]
    pub fn with_closer(mut self, closer: Closer) -> Self {
        self.closer = Some(closer);
        self
    }
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("closer", &self.closer.is_some())
            .finish_non_exhaustive()
    }
}

/// Performs the HTTP exchange for a streaming endpoint.
///
/// Implementors own connection setup, headers, authentication, and TLS.
/// Transport failures are reported as [`BerthError::Transport`]; HTTP
/// error statuses are returned as ordinary responses for
/// [`check_status`] to map.
pub trait StreamTransport: Send + Sync {
    /// Opens `path` (including its query string) with the given verb.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or no response
    /// head is received.
    fn open_stream(&self, method: Method, path: &str, body: Option<&[u8]>) -> Result<StreamResponse>;

    /// Opens a long-lived `GET` stream that another thread may need to end.
    ///
    /// The response should carry a [`Closer`]. The default defers to
    /// [`open_stream`](Self::open_stream) and passes on whatever closer it
    /// provides.
    ///
    /// # Errors
    ///
    /// Same as [`open_stream`](Self::open_stream).
    fn open_abortable(&self, path: &str) -> Result<StreamResponse> {
        self.open_stream(Method::Get, path, None)
    }
}

/// Maps an error status to a typed error, passing successful bodies through.
///
/// 404 becomes [`BerthError::NotFound`] for `kind`/`id`; any other status
/// of 400 or above becomes [`BerthError::Api`] carrying the daemon's
/// message.
///
/// # Errors
///
/// Returns the mapped error for any status of 400 or above.
pub fn check_status(response: StreamResponse, kind: &'static str, id: &str) -> Result<Box<dyn Read + Send>> {
    match response.status {
        404 => Err(BerthError::NotFound {
            kind,
            id: id.to_string(),
        }),
        status if status >= 400 => Err(BerthError::Api {
            status,
            message: error_message(response.body),
        }),
        _ => Ok(response.body),
    }
}

/// Extracts the `message` field of a JSON error body, falling back to the
/// raw text.
fn error_message(body: Box<dyn Read + Send>) -> String {
    let mut raw = String::new();
    if let Err(e) = body.take(MAX_ERROR_BODY).read_to_string(&mut raw) {
        return format!("<unreadable error body: {e}>");
    }
    serde_json::from_str::<serde_json::Value>(&raw)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Blocking HTTP transport backed by `reqwest`.
///
/// Ordinary streams use a client with no timeout: bodies stay open for as
/// long as the daemon keeps pushing. Abortable streams use a second client
/// whose reads wake every poll interval, so a [`Closer`] can end them even
/// when the daemon sends nothing.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::blocking::Client,
    polling: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Creates a transport for the daemon at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_poll_interval(base_url, Duration::from_millis(STREAM_POLL_INTERVAL_MS))
    }

    /// Creates a transport whose abortable streams check for closing every
    /// `interval`. The response head of such a stream must also arrive
    /// within `interval`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP clients cannot be built.
    pub fn with_poll_interval(base_url: impl Into<String>, interval: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(None)?,
            polling: build_client(Some(interval))?,
        })
    }

    /// Returns the daemon base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(
        &self,
        client: &reqwest::blocking::Client,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<reqwest::blocking::Response> {
        let url = format!("{}{path}", self.base_url);
        let mut request = match method {
            Method::Get => client.get(&url),
            Method::Post => client.post(&url),
        };
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        tracing::debug!(%method, %url, "opening stream");
        request.send().map_err(|e| BerthError::Transport {
            message: format!("{method} {url}: {e}"),
        })
    }
}

impl StreamTransport for HttpTransport {
    fn open_stream(&self, method: Method, path: &str, body: Option<&[u8]>) -> Result<StreamResponse> {
        let response = self.send(&self.client, method, path, body)?;
        Ok(StreamResponse::new(response.status().as_u16(), response))
    }

    fn open_abortable(&self, path: &str) -> Result<StreamResponse> {
        let response = self.send(&self.polling, Method::Get, path, None)?;
        let status = response.status().as_u16();
        let (body, closer) = PollingBody::new(response);
        Ok(StreamResponse::new(status, body).with_closer(closer))
    }
}

fn build_client(timeout: Option<Duration>) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BerthError::Transport {
            message: format!("failed to build HTTP client: {e}"),
        })
}

/// Body whose reads give up every poll interval and retry unless closed.
struct PollingBody<R> {
    inner: R,
    closed: Arc<AtomicBool>,
}

impl<R: Read> PollingBody<R> {
    fn new(inner: R) -> (Self, Closer) {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let closer = Closer::new(move || flag.store(true, Ordering::Release));
        (Self { inner, closed }, closer)
    }
}

impl<R: Read> Read for PollingBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.inner.read(buf) {
                Err(e) if is_read_timeout(&e) => {}
                other => return other,
            }
        }
    }
}

/// Blocking `reqwest` reports an expired read wait as an `Other` I/O error
/// wrapping a timeout.
fn is_read_timeout(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TimedOut
        || e.get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}
