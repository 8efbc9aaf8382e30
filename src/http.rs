//! The HTTP client capability.
//!
//! Middlewares and resources never talk to the network directly: they ask
//! the request context for a [`SharedClient`] and send `http::Request`s
//! through it. What sits behind the trait is up to the chain:
//!
//! | Client | Installed by | Behavior |
//! |---|---|---|
//! | [`ReqwestClient`] | [`add_http_client`](crate::middleware::http::add_http_client) | real network |
//! | [`StubbedEndpoints`] | [`add_stub_http_client`](crate::middleware::http::add_stub_http_client) | canned answers, 404 otherwise |
//! | [`client_fn`] | application code | any async function |
//!
//! Decorators such as [`retry_requests`](crate::middleware::http::retry_requests)
//! and the auth extension wrap whatever client is already in the context.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ::http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use ::http::{Method, Request, StatusCode};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

pub type HttpRequest = Request<Bytes>;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// A 200 response carrying `value` as JSON.
    pub fn json_value(value: &Value) -> Self {
        let mut response = Self::ok(value.to_string());
        response.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(Error::other)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Rejects responses with a status of 300 or above, keeping the body text
/// as the error detail.
pub fn validate_status(response: HttpResponse) -> Result<HttpResponse> {
    if response.status.as_u16() < 300 {
        return Ok(response);
    }
    Err(Error::Status {
        status: response.status,
        body: String::from_utf8_lossy(&response.body).into_owned(),
    })
}

// ── Capability ────────────────────────────────────────────────────────────────

pub trait HttpClient: Send + Sync + 'static {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>>;
}

pub type SharedClient = Arc<dyn HttpClient>;

struct FnClient<F>(F);

impl<F, Fut> HttpClient for FnClient<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
{
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        Box::pin((self.0)(request))
    }
}

/// Any async function from request to response, as a client.
pub fn client_fn<F, Fut>(f: F) -> SharedClient
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
{
    Arc::new(FnClient(f))
}

impl dyn HttpClient {
    pub fn get(&self, url: &str) -> BoxFuture<'static, Result<HttpResponse>> {
        self.request(Method::GET, url, Bytes::new())
    }

    /// GETs `url`, failing on statuses of 300 and above, and parses the body.
    pub fn get_json(&self, url: &str) -> BoxFuture<'static, Result<Value>> {
        let response = self.get(url);
        Box::pin(async move { validate_status(response.await?)?.json() })
    }

    pub fn request(&self, method: Method, url: &str, body: Bytes) -> BoxFuture<'static, Result<HttpResponse>> {
        match Request::builder().method(method).uri(url).body(body) {
            Ok(request) => self.send(request),
            Err(e) => {
                let e = Error::other(e);
                Box::pin(async move { Err(e) })
            }
        }
    }
}

// ── Network client ────────────────────────────────────────────────────────────

/// Sends requests over the network with [`reqwest`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpClient for ReqwestClient {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        let client = self.client.clone();
        Box::pin(async move {
            let request = reqwest::Request::try_from(request).map_err(Error::other)?;
            trace!(method = %request.method(), url = %request.url(), "sending request");
            let response = client.execute(request).await.map_err(|e| Error::Network(e.to_string()))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| Error::Network(e.to_string()))?;
            Ok(HttpResponse { status, headers, body })
        })
    }
}

// ── Stubs ─────────────────────────────────────────────────────────────────────

type StubHandler = Arc<dyn Fn(Option<Value>) -> Stub + Send + Sync>;

/// A canned answer for one endpoint.
#[derive(Clone)]
pub enum Stub {
    /// 200 with the value as a JSON body.
    Json(Value),
    /// A full response.
    Response(HttpResponse),
    /// A transport failure.
    Fail(Error),
    /// Computes the answer from the request body, parsed as JSON when it is
    /// JSON and passed as a string otherwise.
    Handler(StubHandler),
}

impl Stub {
    pub fn handler(f: impl Fn(Option<Value>) -> Stub + Send + Sync + 'static) -> Self {
        Self::Handler(Arc::new(f))
    }

    pub fn status(status: StatusCode) -> Self {
        Self::Response(HttpResponse::new(status, Bytes::new()))
    }

    fn resolve(&self, body: &Bytes) -> Result<HttpResponse> {
        match self {
            Self::Json(value) => Ok(HttpResponse::json_value(value)),
            Self::Response(response) => Ok(response.clone()),
            Self::Fail(e) => Err(e.clone()),
            Self::Handler(f) => f(request_json(body)).resolve(body),
        }
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Response(r) => f.debug_tuple("Response").field(&r.status).finish(),
            Self::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

fn request_json(body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body)
        .ok()
        .or_else(|| Some(Value::String(String::from_utf8_lossy(body).into_owned())))
}

/// A client answering from a table of stubs keyed by URL and method.
/// Unknown endpoints answer 404.
///
/// ```rust
/// use http::Method;
/// use serde_json::json;
/// use weft::http::{Stub, StubbedEndpoints};
///
/// let stubs = StubbedEndpoints::new()
///     .on(Method::GET, "https://api.example.com/greeting", Stub::Json(json!({"salutation": "hi"})));
/// ```
#[derive(Debug, Clone, Default)]
pub struct StubbedEndpoints {
    stubs: HashMap<(String, Method), Stub>,
}

impl StubbedEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, method: Method, url: &str, stub: Stub) -> Self {
        self.stubs.insert((url.to_owned(), method), stub);
        self
    }

    pub fn into_client(self) -> SharedClient {
        Arc::new(self)
    }
}

impl HttpClient for StubbedEndpoints {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        let key = (request.uri().to_string(), request.method().clone());
        let response = match self.stubs.get(&key) {
            Some(stub) => stub.resolve(request.body()),
            None => {
                trace!(url = %key.0, method = %key.1, "no stub");
                Ok(HttpResponse::new(StatusCode::NOT_FOUND, Bytes::new()))
            }
        };
        Box::pin(async move { response })
    }
}
