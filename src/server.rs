//! HTTP server and graceful shutdown.
//!
//! Every request is rendered with [`render`](crate::render::render) and
//! answered with a full HTML document or a redirect:
//!
//! | Render outcome | Answer |
//! |---|---|
//! | page | status from the chain (200 by default), HTML document |
//! | redirect | status from the chain (301 by default), `Location` header |
//! | no route | 404 |
//! | any other error | 500, with the message as body outside production |
//!
//! Cookies set or deleted while rendering become `Set-Cookie` headers.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or Ctrl-C the server stops accepting connections, lets
//! every in-flight connection finish and only then returns from
//! [`Server::serve`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, LOCATION, SET_COOKIE};
use http::{StatusCode, Uri};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::context::{CONFIG, Context, ENVIRONMENT, Environment};
use crate::cookies::{MemoryCookies, SharedCookies};
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::render::{RenderOutput, RenderParams, render};
use crate::route::RouteRef;
use crate::view::escape;

type HttpResponse = http::Response<Full<Bytes>>;

// ── Document ──────────────────────────────────────────────────────────────────

/// The HTML shell around every rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub script: String,
    pub stylesheet: String,
    /// Extra markup appended to `<head>`, inserted verbatim.
    pub head: String,
}

impl Default for Document {
    fn default() -> Self {
        Self { script: "/bundle.js".into(), stylesheet: "/style.css".into(), head: String::new() }
    }
}

impl Document {
    pub fn with_head(mut self, markup: impl Into<String>) -> Self {
        self.head = markup.into();
        self
    }

    pub fn render(&self, output: &RenderOutput) -> String {
        let title = output.title.as_deref().map(|t| format!("<title>{}</title>", escape(t))).unwrap_or_default();
        let body = output.body.as_ref().map(|b| b.to_html()).unwrap_or_else(|| "<div></div>".into());
        format!(
            "<!doctype html><html><head><meta charset=\"utf8\">{title}\
             <script async defer src=\"{script}\"></script>\
             <link rel=\"stylesheet\" href=\"{stylesheet}\">{head}</head>\
             <body><div id=\"app\">{body}</div></body></html>",
            script = escape(&self.script),
            stylesheet = escape(&self.stylesheet),
            head = self.head,
        )
    }
}

// ── App ───────────────────────────────────────────────────────────────────────

/// The routes a server renders, and what every request starts from.
pub struct App {
    matcher: Matcher<RouteRef>,
    document: Document,
    context: Context,
}

impl App {
    /// Fails when two routes share a pattern or a pattern is malformed.
    pub fn new(routes: Vec<RouteRef>) -> Result<Self> {
        Ok(Self { matcher: Matcher::from_routes(&routes)?, document: Document::default(), context: Context::new() })
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.document = document;
        self
    }

    /// Values added to every request, such as [`HTTP`](crate::context::HTTP)
    /// or [`CONFIG`].
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Renders one request into a complete HTTP response.
    pub async fn respond(&self, uri: &Uri, headers: &HeaderMap) -> HttpResponse {
        let url = uri.path_and_query().map_or_else(|| uri.path().to_owned(), |pq| pq.as_str().to_owned());
        let cookies = Arc::new(
            headers
                .get(COOKIE)
                .and_then(|h| h.to_str().ok())
                .map(MemoryCookies::from_header)
                .unwrap_or_default(),
        );
        let shared: SharedCookies = Arc::clone(&cookies) as SharedCookies;

        let params = RenderParams {
            matcher: &self.matcher,
            url: &url,
            cookies: Some(shared),
            context: self.context.with(ENVIRONMENT, Environment::Server),
        };
        let mut response = match render(params).await {
            Ok(output) => self.answer(&output),
            Err(Error::NoMatch(_)) => plain(StatusCode::NOT_FOUND, "not found".into()),
            Err(e) => {
                error!(%url, error = %e, "render failed");
                let message = if self.context.config().is_production() { String::new() } else { e.to_string() };
                plain(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };

        for change in cookies.changes() {
            match HeaderValue::from_str(&change) {
                Ok(value) => {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                Err(e) => warn!(error = %e, "dropping malformed cookie"),
            }
        }
        response
    }

    fn answer(&self, output: &RenderOutput) -> HttpResponse {
        let mut response = HttpResponse::new(Full::new(Bytes::new()));
        *response.status_mut() = output.status;
        match &output.location {
            Some(location) => match HeaderValue::from_str(location) {
                Ok(value) => {
                    response.headers_mut().insert(LOCATION, value);
                }
                Err(e) => {
                    error!(%location, error = %e, "unencodable redirect");
                    return plain(StatusCode::INTERNAL_SERVER_ERROR, String::new());
                }
            },
            None => {
                *response.body_mut() = Full::new(Bytes::from(self.document.render(output)));
                response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
            }
        }
        response
    }
}

fn plain(status: StatusCode, message: String) -> HttpResponse {
    let mut response = HttpResponse::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// ```rust,no_run
    /// use weft::Server;
    /// let server = Server::bind("0.0.0.0:3000")?;
    /// # Ok::<(), weft::Error>(())
    /// ```
    pub fn bind(addr: &str) -> Result<Self> {
        let addr = addr.parse::<SocketAddr>().map_err(|e| Error::Config(format!("invalid socket address `{addr}`: {e}")))?;
        Ok(Self { addr })
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains in-flight
    /// connections.
    pub async fn serve(self, app: App) -> Result<()> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serves `app` until `shutdown` resolves.
    pub async fn serve_with_shutdown(self, app: App, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let addr = listener.local_addr()?;
        let mode = app.context.get(CONFIG).unwrap_or_default().mode;
        let app = Arc::new(app);

        info!(addr = %addr, ?mode, "weft listening");

        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                            let app = Arc::clone(&app);
                            async move {
                                Ok::<_, std::convert::Infallible>(app.respond(req.uri(), req.headers()).await)
                            }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("weft stopped");
        Ok(())
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C. A signal that cannot be
/// installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Context;
    use crate::cookies::{CookieOptions, CookieStore};
    use crate::middleware::{Next, boxed};
    use crate::route::app;
    use http_body_util::BodyExt;

    async fn body_text(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(app: &App, path: &str) -> impl Future<Output = HttpResponse> {
        let uri: Uri = path.parse().unwrap();
        async move { app.respond(&uri, &HeaderMap::new()).await }
    }

    #[tokio::test]
    async fn renders_documents() {
        let home = app("").subroute("/").title("Home & co").render("<hi>");
        let app = App::new(vec![home.into()]).unwrap();
        let response = get(&app, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        assert!(html.contains("<title>Home &amp; co</title>"));
        assert!(html.contains("<div id=\"app\">&lt;hi&gt;</div>"));
        assert!(html.contains("src=\"/bundle.js\""));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let app = App::new(vec![app("").subroute("/").render("x").into()]).unwrap();
        assert_eq!(get(&app, "/missing").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failures_hide_details_in_production() {
        let broken = app("").subroute("/").middleware(boxed(|_: Context, _: Next| async { Err(Error::msg("kaboom")) }));
        let dev = App::new(vec![broken.clone().into()]).unwrap();
        let response = get(&dev, "/").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "kaboom");

        let prod = App::new(vec![broken.into()]).unwrap().with_context(Context::new().with(CONFIG, Config::production()));
        assert_eq!(body_text(get(&prod, "/").await).await, "");
    }

    #[tokio::test]
    async fn cookie_changes_become_headers() {
        let route = app("").subroute("/").render("x").middleware(boxed(|ctx: Context, next: Next| async move {
            let jar = ctx.cookies()?;
            let seen = jar.get("visits").unwrap_or_default();
            jar.set("visits", &format!("{seen}1"), CookieOptions::default());
            next.run(ctx).await
        }));
        let app = App::new(vec![route.into()]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("visits=1"));
        let response = app.respond(&"/".parse().unwrap(), &headers).await;
        assert_eq!(response.headers().get(SET_COOKIE).unwrap(), "visits=11");
    }

    #[test]
    fn bind_rejects_bad_addresses() {
        assert!(matches!(Server::bind("nonsense"), Err(Error::Config(_))));
    }
}
