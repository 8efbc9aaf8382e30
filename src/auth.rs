//! OAuth password-grant login.
//!
//! [`oauth`] installs an [`AuthService`] under [`AUTH`] and replaces the
//! context's HTTP client with one that signs requests to the private API:
//!
//! ```text
//!              log_in(user, pass)                     log_out()
//!  LoggedOut ─────────────────────▶ LoggedIn{token} ────────────▶ LoggedOut
//!      ▲   POST grant_type=password                 delete cookie, refresh
//!      │
//!  refresh_token cookie ── POST grant_type=refresh_token ──▶ LoggedIn{token}
//! ```
//!
//! Only requests to the configured host and path prefix carry the bearer
//! token, and only over https unless insecure credentials are allowed.
//! [`requires_login`] guards a route by redirecting anonymous visitors to
//! the login page, remembering where they were going in `?start=`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use ::http::{Method, Request, StatusCode};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, trace};
use url::{Url, form_urlencoded};

use crate::config::Config;
use crate::context::{Context, HTTP, Key};
use crate::cookies::{CookieOptions, SharedCookies};
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse, SharedClient, validate_status};
use crate::middleware::{BoxedMiddleware, Next, boxed};
use crate::response::{Redirect, Response};
use crate::stream::lock;
use crate::transition::{Transition, TransitionBus, stringify_transition};

pub const AUTH: Key<AuthService> = Key::new("auth");

pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Where a successful login lands when no `?start=` was given.
    pub start_page: Transition,
    pub login_page: Transition,
    /// The token endpoint.
    pub login_endpoint: String,
    /// Root URL of the private API, e.g. `https://api.example.com/v1`.
    pub authenticated_urls: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    LoggedIn { token: String },
    LoggedOut,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Login state for one request or client session.
#[derive(Clone)]
pub struct AuthService(Arc<Inner>);

struct Inner {
    state: Mutex<AuthState>,
    config: AuthConfig,
    private_root: Url,
    settings: Config,
    http: SharedClient,
    cookies: Option<SharedCookies>,
    transitions: Option<TransitionBus>,
    location: Transition,
}

impl AuthService {
    pub fn state(&self) -> AuthState {
        lock(&self.0.state).clone()
    }

    pub fn logged_in(&self) -> bool {
        matches!(self.state(), AuthState::LoggedIn { .. })
    }

    /// Exchanges credentials for a token, keeps the refresh token in a
    /// cookie and navigates to the start page.
    pub async fn log_in(&self, user: &str, pass: &str) -> Result<()> {
        let tokens = self.request_token(&[("grant_type", "password"), ("username", user), ("password", pass)]).await?;
        self.accept(tokens);
        trace!("login succeeded");
        if let Some(bus) = &self.0.transitions {
            bus.request_path(self.start_page());
        }
        Ok(())
    }

    /// Forgets the token and re-runs the current location.
    pub fn log_out(&self) {
        *lock(&self.0.state) = AuthState::LoggedOut;
        if let Some(cookies) = &self.0.cookies {
            cookies.delete(REFRESH_TOKEN_COOKIE);
        }
        if let Some(bus) = &self.0.transitions {
            bus.request(self.0.location.clone());
        }
    }

    /// Sends `request`, adding the bearer token when it targets the private
    /// API. Private requests fail with [`Error::Unauthenticated`] while
    /// logged out.
    pub fn authenticated_request(&self, mut request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        let address = request.uri().to_string();
        let Ok(target) = Url::parse(&address) else {
            return self.0.http.send(request);
        };
        if !is_under(&self.0.private_root, &target) {
            return self.0.http.send(request);
        }
        if target.scheme() != "https" && !self.0.settings.allow_insecure_http_credentials {
            let e = Error::Config("authenticated urls must be explicitly https".into());
            return Box::pin(async move { Err(e) });
        }

        let AuthState::LoggedIn { token } = self.state() else {
            return Box::pin(async move { Err(Error::Unauthenticated(address)) });
        };
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(value) => {
                trace!(%address, "authenticated request");
                request.headers_mut().insert(AUTHORIZATION, value);
                self.0.http.send(request)
            }
            Err(e) => {
                let e = Error::other(e);
                Box::pin(async move { Err(e) })
            }
        }
    }

    /// The `?start=` of the current location, or the configured start page.
    pub fn start_page(&self) -> String {
        match self.0.location.query_value("start") {
            Some(start) => start.to_owned(),
            None => stringify_transition(&self.0.config.start_page),
        }
    }

    /// The login page, with the current location as its `start`.
    pub fn login_page_path(&self) -> Transition {
        let mut page = self.0.config.login_page.clone();
        page.query.insert("start".into(), vec![stringify_transition(&self.0.location)]);
        page
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let body = form_urlencoded::Serializer::new(String::new()).extend_pairs(form).finish();
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.0.config.login_endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Bytes::from(body))
            .map_err(Error::other)?;
        validate_status(self.0.http.send(request).await?)?.json()
    }

    fn accept(&self, tokens: TokenResponse) {
        if let (Some(cookies), Some(refresh)) = (&self.0.cookies, &tokens.refresh_token) {
            let options = CookieOptions {
                path: Some("/".into()),
                max_age: Some(Duration::from_secs(60 * 60 * 24 * 30)),
                http_only: true,
                secure: !self.0.settings.allow_insecure_http_credentials,
            };
            cookies.set(REFRESH_TOKEN_COOKIE, refresh, options);
        }
        *lock(&self.0.state) = AuthState::LoggedIn { token: tokens.access_token };
    }

    /// Restores a session from the refresh token cookie, if there is one.
    async fn restore(&self) {
        let Some(cookies) = &self.0.cookies else { return };
        let Some(refresh) = cookies.get(REFRESH_TOKEN_COOKIE) else { return };
        match self.request_token(&[("grant_type", "refresh_token"), ("refresh_token", &refresh)]).await {
            Ok(tokens) => self.accept(tokens),
            Err(e) => {
                debug!(error = %e, "refresh token rejected");
                cookies.delete(REFRESH_TOKEN_COOKIE);
            }
        }
    }
}

impl HttpClient for AuthService {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        self.authenticated_request(request)
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService").field("logged_in", &self.logged_in()).finish()
    }
}

// ── Middlewares ───────────────────────────────────────────────────────────────

/// Adds [`AUTH`] and swaps [`HTTP`] for the authenticating client.
///
/// Needs an HTTP client and the location in the context. Cookies and the
/// transition bus are used when present.
pub fn oauth(config: AuthConfig) -> BoxedMiddleware {
    boxed(move |ctx: Context, next: Next| {
        let config = config.clone();
        async move {
            let settings = ctx.config();
            settings.validate()?;
            let private_root = Url::parse(&config.authenticated_urls)
                .map_err(|e| Error::Config(format!("authenticated urls: {e}")))?;

            let service = AuthService(Arc::new(Inner {
                state: Mutex::new(AuthState::LoggedOut),
                config,
                private_root,
                settings,
                http: ctx.http()?,
                cookies: ctx.cookies().ok(),
                transitions: ctx.transitions().ok(),
                location: ctx.location()?,
            }));
            service.restore().await;

            let client: SharedClient = Arc::new(service.clone());
            next.run(ctx.with(AUTH, service).with(HTTP, client)).await
        }
    })
}

/// Lets logged-in visitors through; redirects everyone else to the login
/// page with status 401.
pub fn requires_login() -> BoxedMiddleware {
    boxed(|ctx: Context, next: Next| async move {
        let auth = ctx.require(AUTH)?;
        if auth.logged_in() {
            return next.run(ctx).await;
        }
        trace!("redirecting to login page");
        Ok(Response::from(Redirect::to(auth.login_page_path()).with_status(StatusCode::UNAUTHORIZED)))
    })
}

/// Whether `target` is on `root`'s host and at or below its path, compared
/// segment by segment.
fn is_under(root: &Url, target: &Url) -> bool {
    if target.host_str() != root.host_str() {
        return false;
    }
    let mut inner = target.path().split('/').filter(|s| !s.is_empty());
    root.path().split('/').filter(|s| !s.is_empty()).all(|segment| inner.next() == Some(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{COOKIES, LOCATION};
    use crate::cookies::{CookieStore, MemoryCookies};
    use crate::http::client_fn;
    use crate::middleware::compose;
    use crate::route::app;
    use serde_json::json;

    const TOKEN_URL: &str = "https://auth.example.com/token";

    fn config() -> AuthConfig {
        let root = app("");
        AuthConfig {
            start_page: root.subroute("/home").transition(),
            login_page: root.subroute("/login").transition(),
            login_endpoint: TOKEN_URL.into(),
            authenticated_urls: "https://api.example.com/private".into(),
        }
    }

    /// Issues tokens for `ann` and echoes the Authorization header elsewhere.
    fn backend() -> SharedClient {
        client_fn(|req: HttpRequest| async move {
            if req.uri() == TOKEN_URL {
                let form: Vec<(String, String)> = form_urlencoded::parse(req.body()).into_owned().collect();
                let granted = form.contains(&("username".into(), "ann".into()))
                    || form.contains(&("refresh_token".into(), "r1".into()));
                return Ok(if granted {
                    HttpResponse::json_value(&json!({"access_token": "t1", "refresh_token": "r1"}))
                } else {
                    HttpResponse::new(StatusCode::BAD_REQUEST, "invalid_grant")
                });
            }
            let auth = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()).unwrap_or("none");
            Ok(HttpResponse::ok(auth.to_owned()))
        })
    }

    async fn run(ctx: Context, guard: BoxedMiddleware) -> (Option<AuthService>, Response) {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let next = Next::new(move |ctx: Context| {
            *record.lock().unwrap() = ctx.get(AUTH);
            async { Ok(Response::default()) }
        });
        let response = compose(oauth(config()), guard).call(ctx, next).await.unwrap();
        let service = seen.lock().unwrap().clone();
        (service, response)
    }

    fn base(cookies: Arc<MemoryCookies>) -> Context {
        let here = app("").subroute("/account").transition();
        let cookies: SharedCookies = cookies;
        Context::new().with(HTTP, backend()).with(LOCATION, here).with(COOKIES, cookies)
    }

    #[tokio::test]
    async fn anonymous_visitors_are_sent_to_login() {
        let (_, response) = run(base(Arc::new(MemoryCookies::new())), requires_login()).await;
        match response {
            Response::Redirect(r) => {
                assert_eq!(r.status, Some(StatusCode::UNAUTHORIZED));
                assert_eq!(stringify_transition(&r.location), "/login?start=%2Faccount");
            }
            Response::Render(_) => panic!("expected a redirect"),
        }
    }

    #[tokio::test]
    async fn login_signs_private_requests() {
        let cookies = Arc::new(MemoryCookies::new());
        let (auth, _) = run(base(Arc::clone(&cookies)), crate::middleware::noop()).await;
        let auth = auth.unwrap();
        let client: SharedClient = Arc::new(auth.clone());

        let err = client.get("https://api.example.com/private/me").await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));

        assert!(auth.log_in("bob", "pw").await.is_err());
        auth.log_in("ann", "pw").await.unwrap();
        assert_eq!(auth.state(), AuthState::LoggedIn { token: "t1".into() });
        assert_eq!(cookies.get(REFRESH_TOKEN_COOKIE).as_deref(), Some("r1"));

        let signed = client.get("https://api.example.com/private/me").await.unwrap();
        assert_eq!(signed.text().unwrap(), "Bearer t1");
        let public = client.get("https://api.example.com/public").await.unwrap();
        assert_eq!(public.text().unwrap(), "none");
        let sibling = client.get("https://api.example.com/private-ish/me").await.unwrap();
        assert_eq!(sibling.text().unwrap(), "none");
        assert!(matches!(client.get("http://api.example.com/private/me").await, Err(Error::Config(_))));

        auth.log_out();
        assert!(!auth.logged_in());
        assert_eq!(cookies.get(REFRESH_TOKEN_COOKIE), None);
    }

    #[tokio::test]
    async fn refresh_cookie_restores_session() {
        let cookies = Arc::new(MemoryCookies::from_header("refresh_token=r1"));
        let (auth, response) = run(base(cookies), requires_login()).await;
        assert!(auth.unwrap().logged_in());
        assert!(matches!(response, Response::Render(_)));
    }

    #[test]
    fn private_urls_match_whole_segments() {
        let root = Url::parse("https://api.example.com/v1").unwrap();
        let under = |url: &str| is_under(&root, &Url::parse(url).unwrap());
        assert!(under("https://api.example.com/v1"));
        assert!(under("https://api.example.com/v1/users?id=2"));
        assert!(!under("https://api.example.com/v10/users"));
        assert!(!under("https://other.example.com/v1/users"));
        assert!(is_under(&Url::parse("https://api.example.com/").unwrap(), &Url::parse("https://api.example.com/x").unwrap()));
    }

    #[tokio::test]
    async fn start_query_overrides_start_page() {
        let here = app("").subroute("/login").transition().with_query("start", "/deep/link");
        let ctx = base(Arc::new(MemoryCookies::new())).with(LOCATION, here);
        let (auth, _) = run(ctx, crate::middleware::noop()).await;
        assert_eq!(auth.unwrap().start_page(), "/deep/link");
    }
}
