//! HTTP Request Client shared by every outbound integration.
//!
//! All REST calls (Discord, Twitch Helix, speedrun.com, preview images) go
//! through [`RequestClient`] so that retry, backoff and error
//! classification live in one place. The backoff is shared by the whole
//! process rather than tracked per call: one flaky upstream slows every
//! caller down a little instead of each caller hammering it separately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const USER_AGENT: &str = concat!("speedrun-bot/", env!("CARGO_PKG_VERSION"));

/// Upper bound on a server-specified rate-limit sleep.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HttpError {
    /// DNS, TLS, connect or read failure.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success status from the remote service.
    #[error("HTTP {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// Still rate-limited after the single permitted retry.
    #[error("rate-limited by {url} (retry after {retry_after:?})")]
    RateLimited { url: String, retry_after: Duration },

    /// Body could not be decoded into the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

// ---------------------------------------------------------------------------
// Shared backoff
// ---------------------------------------------------------------------------

/// Process-wide exponential backoff.
///
/// Doubles on every failure and halves on every success, always staying
/// within `[floor, ceiling]`.
#[derive(Debug)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Mutex<Duration>,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: Mutex::new(floor),
        }
    }

    pub fn current(&self) -> Duration {
        *self.lock()
    }

    /// Record a failure and return the delay to wait before retrying.
    pub fn on_failure(&self) -> Duration {
        let mut current = self.lock();
        let delay = *current;
        *current = (*current * 2).clamp(self.floor, self.ceiling);
        delay
    }

    pub fn on_success(&self) {
        let mut current = self.lock();
        *current = (*current / 2).clamp(self.floor, self.ceiling);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Duration> {
        // A poisoned lock only means another thread panicked mid-update of a
        // plain Duration; the value is still usable.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    /// Attempts per call for transport errors and 5xx responses.
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
            max_attempts: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestClient
// ---------------------------------------------------------------------------

/// Retrying HTTP client. Cheap to clone (internals are behind `Arc`).
///
/// Redirects are never followed: preview-image probes need to see them,
/// and none of the JSON APIs we talk to redirect.
#[derive(Clone, Debug)]
pub struct RequestClient {
    inner: Client,
    backoff: Arc<Backoff>,
    max_attempts: u32,
}

impl RequestClient {
    pub fn new(config: &HttpConfig) -> Result<Self, HttpError> {
        let inner = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            inner,
            backoff: Arc::new(Backoff::new(config.backoff_floor, config.backoff_ceiling)),
            max_attempts: config.max_attempts.max(1),
        })
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Send a request built by `build`, retrying as needed.
    ///
    /// `build` is called once per attempt because a `RequestBuilder` cannot
    /// be reused after sending.
    ///
    /// Transport errors and 5xx responses are retried up to `max_attempts`
    /// times with the shared backoff. A 429 sleeps for the server-specified
    /// duration and is retried exactly once. Every other response,
    /// including 3xx and 4xx, is returned to the caller untouched.
    pub async fn execute<F>(&self, build: F) -> Result<Response, HttpError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 0u32;
        let mut rate_limit_retried = false;

        loop {
            attempt += 1;
            let result = build(&self.inner).send().await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    let delay = self.backoff.on_failure();
                    if attempt >= self.max_attempts {
                        return Err(HttpError::Transport(e));
                    }
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "HTTP transport error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after(resp.headers());
                let url = resp.url().to_string();
                if rate_limit_retried {
                    self.backoff.on_failure();
                    return Err(HttpError::RateLimited { url, retry_after });
                }
                rate_limit_retried = true;
                warn!(
                    url = %url,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate-limited, sleeping before single retry"
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status.is_server_error() {
                let delay = self.backoff.on_failure();
                if attempt >= self.max_attempts {
                    return Err(status_error(resp).await);
                }
                warn!(
                    status = status.as_u16(),
                    url = %resp.url(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "server error, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            self.backoff.on_success();
            debug!(status = status.as_u16(), url = %resp.url(), "HTTP request completed");
            return Ok(resp);
        }
    }

    /// Like [`execute`](Self::execute) but requires a 2xx status and
    /// deserialises the body as JSON.
    pub async fn json<T, F>(&self, build: F) -> Result<T, HttpError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let resp = self.success(build).await?;
        let bytes = resp.bytes().await?;
        decode_json(&bytes)
    }

    /// Like [`execute`](Self::execute) but maps non-2xx statuses to
    /// [`HttpError::Status`].
    pub async fn success<F>(&self, build: F) -> Result<Response, HttpError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let resp = self.execute(build).await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(status_error(resp).await)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Decode a JSON body, keeping a snippet of the raw text for diagnostics.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HttpError> {
    serde_json::from_slice(bytes).map_err(|e| {
        let raw = String::from_utf8_lossy(bytes);
        let end = raw
            .char_indices()
            .nth(200)
            .map(|(i, _)| i)
            .unwrap_or(raw.len());
        HttpError::Decode(format!("{}: {}", e, &raw[..end]))
    })
}

/// Consume a non-success response into [`HttpError::Status`].
pub async fn status_error(resp: Response) -> HttpError {
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    HttpError::Status { status, url, body }
}

/// Server-specified wait from `retry-after` (seconds, possibly fractional)
/// or Discord's `x-ratelimit-reset-after`, defaulting to one second.
fn retry_after(headers: &HeaderMap) -> Duration {
    ["retry-after", "x-ratelimit-reset-after"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .filter_map(|s| s.trim().parse::<f64>().ok())
        .find_map(|s| capped_secs(s, MAX_RETRY_AFTER))
        .unwrap_or(Duration::from_secs(1))
}

/// `secs` as a [`Duration`] no longer than `max`; `None` for negative or
/// non-finite input.
pub(crate) fn capped_secs(secs: f64, max: Duration) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(max.as_secs_f64()))
        .ok()
        .map(|d| d.min(max))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
