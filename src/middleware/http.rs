//! HTTP client middlewares.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::context::{Context, HTTP};
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient, SharedClient, StubbedEndpoints};
use crate::middleware::{BoxedMiddleware, Next, boxed};

/// Installs a network client as [`HTTP`].
pub fn add_http_client() -> BoxedMiddleware {
    add_client(Arc::new(ReqwestClient::new()))
}

/// Installs a client answering from `stubs`.
pub fn add_stub_http_client(stubs: StubbedEndpoints) -> BoxedMiddleware {
    add_client(stubs.into_client())
}

/// Installs `client` as [`HTTP`].
pub fn add_client(client: SharedClient) -> BoxedMiddleware {
    boxed(move |ctx: Context, next: Next| next.run(ctx.with(HTTP, Arc::clone(&client))))
}

// ── Retry ─────────────────────────────────────────────────────────────────────

/// Backoff settings for [`retry_requests`].
///
/// The delay before attempt `n + 1` is `base_delay * n^exponent`, scaled by a
/// random factor in `[0, 1)`.
///
/// ```rust
/// use std::time::Duration;
/// use weft::middleware::http::RetryConfig;
///
/// let config = RetryConfig::default()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub exponent: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(5), exponent: 2 }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_exponent(mut self, exponent: i32) -> Self {
        self.exponent = exponent;
        self
    }

    /// The pause after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let scale = f64::from(attempt).powi(self.exponent) * rand::random::<f64>();
        self.base_delay.mul_f64(scale)
    }
}

/// Wraps the context's client so that network failures and 5xx answers are
/// retried with exponential backoff. Other answers of 300 and above fail
/// straight away with [`Error::Status`].
pub fn retry_requests(config: RetryConfig) -> BoxedMiddleware {
    boxed(move |ctx: Context, next: Next| {
        let client = ctx.http();
        async move {
            let inner = client?;
            let retrying: SharedClient = Arc::new(Retrying { inner, config });
            next.run(ctx.with(HTTP, retrying)).await
        }
    })
}

struct Retrying {
    inner: SharedClient,
    config: RetryConfig,
}

impl HttpClient for Retrying {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        let inner = Arc::clone(&self.inner);
        let config = self.config;
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let mut attempt = 1;
            loop {
                let mut request = HttpRequest::new(body.clone());
                *request.method_mut() = parts.method.clone();
                *request.uri_mut() = parts.uri.clone();
                *request.headers_mut() = parts.headers.clone();
                *request.version_mut() = parts.version;
                let result = inner.send(request).await.and_then(|response| {
                    if response.status.as_u16() >= 300 {
                        Err(Error::Status {
                            status: response.status,
                            body: String::from_utf8_lossy(&response.body).into_owned(),
                        })
                    } else {
                        Ok(response)
                    }
                });
                match result {
                    Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                        let delay = config.delay(attempt);
                        debug!(uri = %parts.uri, attempt, error = %e, ?delay, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        trace!(uri = %parts.uri, attempt, error = %e, "giving up");
                        return Err(e);
                    }
                    ok => return ok,
                }
            }
        })
    }
}
