//! Replaying a captured request against a live endpoint.
//!
//! A replay happens in two steps. [`ReplayClient::prepare`] parses the
//! payload and resolves where and how it will be sent; any problem there is
//! returned immediately and never touches the statistics. Sending it
//! ([`ReplayClient::execute`]) always ends in exactly one [`ReplayOutcome`]:
//! transport failures are values, not errors.
//!
//! ```text
//! payload ──prepare──> PreparedReplay ──execute──> ReplayOutcome
//!                                          │
//!                        start/finish_request, record_success/record_error, tick
//!                                          ▼
//!                                StatsTree + RateWindow
//! ```

use std::{
    error::Error as StdError,
    fmt::Write as _,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use reqwest::{
    Client, Method, Response, StatusCode, Url, Version,
    header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING},
    redirect,
};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    options::{Protocol, ReplayOptions},
    parser::{ParseError, ParsedRequest, parse_request},
    rate::RateWindow,
    stats::{StatsTree, path_prefixes},
};

/// Log target for the request/response dumps enabled by
/// [`ReplayOptions::verbose`] and [`ReplayOptions::output_headers`].
pub const WIRE_TARGET: &str = "reprise::wire";

/// Problems detected before anything is sent.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unsupported protocol {0:?}, expected http or https")]
    UnsupportedScheme(String),
    #[error("request target {0:?} is relative and there is no Host header or override host")]
    MissingHost(String),
    #[error("invalid request target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("auth token cannot be used as a header value")]
    InvalidAuthToken,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Why a replay that was sent did not produce a response.
///
/// Every variant counts the same in the statistics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection idle for more than {0:?}, request aborted")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    fn from_reqwest(err: &reqwest::Error, idle_timeout: Duration) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(idle_timeout)
        } else if err.is_connect() {
            TransportError::Connect(error_chain(err))
        } else {
            TransportError::Request(error_chain(err))
        }
    }
}

/// Status line and headers of a replayed request. The body is drained, only
/// its size is kept.
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body_bytes: u64,
}

/// The single result of one replay.
#[derive(Debug)]
pub enum ReplayOutcome {
    Completed {
        url: String,
        response: ReplayResponse,
        elapsed: Duration,
    },
    Failed {
        url: String,
        elapsed: Duration,
        error: TransportError,
    },
}

impl ReplayOutcome {
    /// The captured URL the outcome was recorded under.
    pub fn url(&self) -> &str {
        match self {
            ReplayOutcome::Completed { url, .. } | ReplayOutcome::Failed { url, .. } => url,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            ReplayOutcome::Completed { elapsed, .. } | ReplayOutcome::Failed { elapsed, .. } => {
                *elapsed
            }
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        as_millis(self.elapsed())
    }

    pub fn response(&self) -> Option<&ReplayResponse> {
        match self {
            ReplayOutcome::Completed { response, .. } => Some(response),
            ReplayOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&TransportError> {
        match self {
            ReplayOutcome::Completed { .. } => None,
            ReplayOutcome::Failed { error, .. } => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReplayOutcome::Completed { .. })
    }
}

/// A parsed payload with every override applied, ready to be sent any
/// number of times.
#[derive(Debug, Clone)]
pub struct PreparedReplay {
    method: Method,
    url: String,
    target: Url,
    version: Option<Version>,
    headers: HeaderMap,
    body: Option<Bytes>,
    prefixes: Arc<[String]>,
}

impl PreparedReplay {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL as captured; statistics are keyed by it.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Where the request is actually sent, overrides included.
    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

/// Sends captured requests and reports every outcome to a shared
/// [`StatsTree`] and [`RateWindow`].
///
/// Cloning is cheap; clones share the connection pool and the statistics.
#[derive(Debug, Clone)]
pub struct ReplayClient {
    http: Client,
    options: Arc<ReplayOptions>,
    auth: Option<HeaderValue>,
    rate: Arc<RateWindow>,
    stats: Arc<StatsTree>,
}

impl ReplayClient {
    pub fn new(
        options: ReplayOptions,
        rate: Arc<RateWindow>,
        stats: Arc<StatsTree>,
    ) -> Result<Self, ReplayError> {
        let auth = options
            .override_auth_token
            .as_deref()
            .map(|token| {
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ReplayError::InvalidAuthToken)
            })
            .transpose()?;

        let http = Client::builder()
            .danger_accept_invalid_certs(options.insecure)
            .connect_timeout(options.idle_timeout)
            .read_timeout(options.idle_timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            options: Arc::new(options),
            auth,
            rate,
            stats,
        })
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.options
    }

    pub fn stats(&self) -> &Arc<StatsTree> {
        &self.stats
    }

    pub fn rate(&self) -> &Arc<RateWindow> {
        &self.rate
    }

    /// Parse `payload` and resolve its target.
    pub fn prepare(&self, payload: &[u8]) -> Result<PreparedReplay, ReplayError> {
        let request = parse_request(payload)?;
        self.prepare_parsed(&request)
    }

    /// Resolve an already parsed request.
    pub fn prepare_parsed(&self, request: &ParsedRequest) -> Result<PreparedReplay, ReplayError> {
        let opts = &self.options;
        let url = captured_url(request, opts)?;
        let invalid = |reason: String| ReplayError::InvalidTarget {
            target: url.clone(),
            reason,
        };

        let mut target = Url::parse(&url).map_err(|e| invalid(e.to_string()))?;
        let protocol = match opts.protocol_override {
            Some(protocol) => protocol,
            None => target
                .scheme()
                .parse::<Protocol>()
                .map_err(|_| ReplayError::UnsupportedScheme(target.scheme().to_string()))?,
        };
        target
            .set_scheme(protocol.as_str())
            .map_err(|_| invalid(format!("cannot switch scheme to {protocol}")))?;
        if let Some(host) = &opts.override_host {
            target
                .set_host(Some(host.as_str()))
                .map_err(|e| invalid(format!("override host {host:?}: {e}")))?;
        }
        if let Some(port) = opts.override_port {
            target
                .set_port(Some(port))
                .map_err(|_| invalid(format!("cannot set port {port}")))?;
        }

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ReplayError::InvalidMethod(request.method.clone()))?;

        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(header = %name, "dropping header that is not valid HTTP");
                continue;
            };
            // The transport frames the body itself.
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            // Case variants of one name collapse to a single header, the last one seen.
            headers.insert(name, value);
        }
        if let Some(auth) = &self.auth {
            headers.insert(AUTHORIZATION, auth.clone());
        }

        let version = (request.http_version == "1.0").then_some(Version::HTTP_10);
        let prefixes = path_prefixes(&url).into();

        Ok(PreparedReplay {
            method,
            url,
            target,
            version,
            headers,
            body: request.body.clone(),
            prefixes,
        })
    }

    /// Prepare `payload` and hand back the future that sends it.
    ///
    /// Preparation errors are returned right away. The future owns everything
    /// it needs, so it can be spawned.
    pub fn replay(
        &self,
        payload: &[u8],
    ) -> Result<impl Future<Output = ReplayOutcome> + Send + use<>, ReplayError> {
        let prepared = self.prepare(payload)?;
        let client = self.clone();
        Ok(async move { client.execute(&prepared).await })
    }

    /// Spawn the replay on the current runtime and call `callback` with its
    /// outcome once it is known.
    pub fn spawn_replay<F>(&self, payload: &[u8], callback: F) -> Result<JoinHandle<()>, ReplayError>
    where
        F: FnOnce(ReplayOutcome) + Send + 'static,
    {
        let replay = self.replay(payload)?;
        Ok(tokio::spawn(async move { callback(replay.await) }))
    }

    /// Send a prepared request once and record what happened.
    pub async fn execute(&self, prepared: &PreparedReplay) -> ReplayOutcome {
        self.log_request(prepared);

        let mut request = self
            .http
            .request(prepared.method.clone(), prepared.target.clone())
            .headers(prepared.headers.clone());
        if let Some(version) = prepared.version {
            request = request.version(version);
        }
        if let Some(body) = &prepared.body {
            request = request.body(body.clone());
        }

        let id = self.stats.start_request();
        let started = Instant::now();
        let sent = request.send().await;
        let elapsed = started.elapsed();
        self.stats.finish_request(id);

        match sent {
            Ok(response) => {
                let response = self.drain(response).await;
                self.rate.tick();
                self.stats.record_success_at(&prepared.prefixes, as_millis(elapsed));
                tracing::debug!(
                    url = %prepared.url,
                    status = response.status.as_u16(),
                    elapsed_ms = as_millis(elapsed),
                    "replay completed"
                );
                ReplayOutcome::Completed {
                    url: prepared.url.clone(),
                    response,
                    elapsed,
                }
            }
            Err(err) => {
                let error = TransportError::from_reqwest(&err, self.options.idle_timeout);
                tracing::warn!(url = %prepared.url, %error, "replay failed");
                self.stats.record_error_at(&prepared.prefixes);
                ReplayOutcome::Failed {
                    url: prepared.url.clone(),
                    elapsed,
                    error,
                }
            }
        }
    }

    /// Read the body to the end without keeping it.
    async fn drain(&self, mut response: Response) -> ReplayResponse {
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();

        if self.options.output_headers {
            tracing::info!(
                target: WIRE_TARGET,
                "{:?} {}\r\n{}",
                version,
                status,
                format_headers(&headers)
            );
        }

        let mut body_bytes = 0;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => body_bytes += chunk.len() as u64,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %error_chain(&err), "response body ended early");
                    break;
                }
            }
        }

        ReplayResponse {
            status,
            version,
            headers,
            body_bytes,
        }
    }

    fn log_request(&self, prepared: &PreparedReplay) {
        let opts = &self.options;
        if opts.verbose && opts.output_headers {
            tracing::info!(
                target: WIRE_TARGET,
                "{} {} {:?}\r\n{}",
                prepared.method,
                prepared.url,
                prepared.version.unwrap_or(Version::HTTP_11),
                format_headers(&prepared.headers)
            );
        }
        if opts.verbose {
            if let Some(body) = &prepared.body {
                tracing::info!(target: WIRE_TARGET, "\r\n{}\r\n", String::from_utf8_lossy(body));
            }
        }
    }
}

/// The absolute URL a request was captured for. Origin-form targets are
/// completed from the `Host` header, or the override host without one.
fn captured_url(request: &ParsedRequest, opts: &ReplayOptions) -> Result<String, ReplayError> {
    if is_absolute(&request.url) {
        return Ok(request.url.clone());
    }
    let host = request
        .header("host")
        .filter(|h| !h.is_empty())
        .or(opts.override_host.as_deref())
        .ok_or_else(|| ReplayError::MissingHost(request.url.clone()))?;
    let scheme = opts.protocol_override.unwrap_or(Protocol::Http);
    let slash = if request.url.starts_with('/') { "" } else { "/" };
    Ok(format!("{scheme}://{host}{slash}{}", request.url))
}

/// Absolute-form targets start with a scheme; anything starting with `/` is
/// origin-form even when its query carries a URL.
fn is_absolute(target: &str) -> bool {
    !target.starts_with('/')
        && target
            .split_once("://")
            .is_some_and(|(scheme, _)| {
                !scheme.is_empty()
                    && scheme
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
            })
}

fn format_headers(headers: &HeaderMap) -> String {
    headers.iter().fold(String::new(), |mut out, (name, value)| {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
        out
    })
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {cause}");
        source = cause.source();
    }
    message
}

fn as_millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(options: ReplayOptions) -> ReplayClient {
        ReplayClient::new(
            options,
            Arc::new(RateWindow::from_secs(10)),
            Arc::new(StatsTree::default()),
        )
        .unwrap()
    }

    #[test]
    fn origin_form_target_uses_host_header() {
        let prepared = client(ReplayOptions::default())
            .prepare(b"GET /a/b?c=d HTTP/1.1\r\nHost: x:8080\r\n\r\n")
            .unwrap();
        assert_eq!(prepared.url(), "http://x:8080/a/b?c=d");
        assert_eq!(prepared.target().as_str(), "http://x:8080/a/b?c=d");
        assert_eq!(prepared.prefixes(), &["x:8080", "x:8080/a", "x:8080/a/b?c=d"]);
    }

    #[test]
    fn url_in_query_does_not_make_target_absolute() {
        let prepared = client(ReplayOptions::default())
            .prepare(b"GET /redirect?to=http://y/z HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        assert_eq!(prepared.url(), "http://x/redirect?to=http://y/z");
        assert_eq!(prepared.prefixes()[0], "x");
        assert!(is_absolute("https://x/a"));
        assert!(!is_absolute("/a?b=c://d"));
        assert!(!is_absolute("a?b=c://d"));
    }

    #[test]
    fn case_variant_headers_go_out_once() {
        let prepared = client(ReplayOptions::default())
            .prepare(b"GET / HTTP/1.1\r\nX-Id: 1\r\nx-id: 2\r\nHost: a\r\nhost: b\r\n\r\n")
            .unwrap();
        let ids: Vec<_> = prepared.headers().get_all("x-id").iter().collect();
        assert_eq!(ids, vec!["2"]);
        let hosts: Vec<_> = prepared.headers().get_all("host").iter().collect();
        assert_eq!(hosts, vec!["b"]);
        assert_eq!(prepared.url(), "http://b/");
    }

    #[test]
    fn method_is_upper_cased() {
        let prepared = client(ReplayOptions::default())
            .prepare(b"get / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        assert_eq!(prepared.method(), &Method::GET);
    }

    #[test]
    fn overrides_change_target_but_not_stats_key() {
        let opts = ReplayOptions::builder()
            .override_host("127.0.0.1")
            .override_port(9000)
            .protocol_override(Protocol::Https)
            .build();
        let prepared = client(opts)
            .prepare(b"POST http://api.example.com/v1/items HTTP/1.1\r\nHost: api.example.com\r\n\r\n{}")
            .unwrap();
        assert_eq!(prepared.target().as_str(), "https://127.0.0.1:9000/v1/items");
        assert_eq!(prepared.url(), "http://api.example.com/v1/items");
        assert_eq!(prepared.method(), &Method::POST);
        assert_eq!(prepared.body().map(|b| &b[..]), Some(&b"{}"[..]));
    }

    #[test]
    fn auth_token_replaces_captured_authorization() {
        let opts = ReplayOptions::builder().override_auth_token("tok").build();
        let prepared = client(opts)
            .prepare(b"GET /me HTTP/1.1\r\nHost: x\r\nauthorization: Basic xyz\r\n\r\n")
            .unwrap();
        let values: Vec<_> = prepared.headers().get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values, vec!["Bearer tok"]);
    }

    #[test]
    fn auth_token_is_added_when_missing() {
        let opts = ReplayOptions::builder().override_auth_token("tok").build();
        let prepared = client(opts).prepare(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(prepared.headers()[AUTHORIZATION], "Bearer tok");
    }

    #[test]
    fn framing_headers_are_left_to_the_transport() {
        let prepared = client(ReplayOptions::default())
            .prepare(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 99\r\nTransfer-Encoding: chunked\r\nX-Keep: 1\r\n\r\nabc")
            .unwrap();
        assert!(prepared.headers().get(CONTENT_LENGTH).is_none());
        assert!(prepared.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(prepared.headers()["x-keep"], "1");
    }

    #[test]
    fn other_schemes_are_rejected() {
        let err = client(ReplayOptions::default())
            .prepare(b"GET ftp://files.example.com/a HTTP/1.1\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ReplayError::UnsupportedScheme(s) if s == "ftp"));
    }

    #[test]
    fn relative_target_without_host_is_rejected() {
        let err = client(ReplayOptions::default())
            .prepare(b"GET /a HTTP/1.1\r\nAccept: */*\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ReplayError::MissingHost(_)));

        let opts = ReplayOptions::builder().override_host("localhost").build();
        let prepared = client(opts).prepare(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(prepared.url(), "http://localhost/a");
    }

    #[test]
    fn parse_errors_surface_before_anything_is_recorded() {
        let c = client(ReplayOptions::default());
        assert!(matches!(
            c.replay(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            Err(ReplayError::Parse(ParseError::MalformedPayload))
        ));
        assert!(matches!(
            c.replay(b"nonsense\r\n\r\n"),
            Err(ReplayError::Parse(ParseError::MalformedHeaderLine(_)))
        ));
        assert!(c.stats().paths().is_empty());
        assert_eq!(c.stats().started_requests(), 0);
    }

    #[test]
    fn http_1_0_is_kept() {
        let c = client(ReplayOptions::default());
        let old = c.prepare(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").unwrap();
        let new = c.prepare(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(old.version, Some(Version::HTTP_10));
        assert_eq!(new.version, None);
    }

    #[test]
    fn invalid_token_is_rejected_up_front() {
        let opts = ReplayOptions::builder().override_auth_token("bad\ntoken").build();
        let err = ReplayClient::new(
            opts,
            Arc::new(RateWindow::from_secs(1)),
            Arc::new(StatsTree::default()),
        )
        .unwrap_err();
        assert!(matches!(err, ReplayError::InvalidAuthToken));
    }

    #[test]
    fn outcome_accessors() {
        let failed = ReplayOutcome::Failed {
            url: "http://x/".into(),
            elapsed: Duration::from_millis(3),
            error: TransportError::Timeout(Duration::from_secs(300)),
        };
        assert!(!failed.is_success());
        assert!(failed.response().is_none());
        assert_eq!(failed.elapsed_ms(), 3.0);
        assert_eq!(failed.url(), "http://x/");
    }
}
