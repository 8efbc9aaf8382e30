//! The outcome of a middleware chain and the [`Renderable`] conversion.
//!
//! A chain resolves to exactly one of two things:
//!
//! ```rust,ignore
//! Response::Render(Render::new().with_title("Home").with_body(page))
//! Response::Redirect(Redirect::to(login.transition()))
//! ```
//!
//! A render response carries *streams*, not values: the page title and body
//! may keep changing after the chain has returned, and whoever mounted the
//! route keeps following them until the next transition.

use std::fmt;
use std::sync::Arc;

use http::StatusCode;

use crate::context::Context;
use crate::stream::{DataStream, Item};
use crate::transition::Transition;
use crate::view::{Element, ViewNode};

// ── Response ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Render(Render),
    Redirect(Redirect),
}

impl Response {
    pub fn redirect(location: Transition) -> Self {
        Self::Redirect(Redirect::to(location))
    }

    /// The effective status code: 200 for renders and 301 for redirects
    /// unless a middleware set one.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Render(r) => r.status.unwrap_or(StatusCode::OK),
            Self::Redirect(r) => r.status.unwrap_or(StatusCode::MOVED_PERMANENTLY),
        }
    }

    /// Applies `f` to a render response. Redirects pass through untouched.
    pub fn map_render(self, f: impl FnOnce(Render) -> Render) -> Self {
        match self {
            Self::Render(r) => Self::Render(f(r)),
            redirect => redirect,
        }
    }
}

/// An empty render: no title, no body, default status.
impl Default for Response {
    fn default() -> Self {
        Self::Render(Render::default())
    }
}

impl From<Render> for Response {
    fn from(r: Render) -> Self {
        Self::Render(r)
    }
}

impl From<Redirect> for Response {
    fn from(r: Redirect) -> Self {
        Self::Redirect(r)
    }
}

// ── Render ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Render {
    pub status: Option<StatusCode>,
    pub title: Option<DataStream<String>>,
    pub body: Option<DataStream<ViewNode>>,
}

impl Render {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_title(mut self, title: impl Into<DataStream<String>>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<DataStream<ViewNode>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The title stream, or a single empty title when none was set.
    pub fn title_stream(&self) -> DataStream<String> {
        self.title.clone().unwrap_or_else(|| DataStream::of(String::new()))
    }
}

// ── Redirect ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub status: Option<StatusCode>,
    pub location: Transition,
}

impl Redirect {
    pub fn to(location: Transition) -> Self {
        Self { status: None, location }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }
}

// ── Stream conversions ────────────────────────────────────────────────────────

impl From<&str> for DataStream<String> {
    fn from(s: &str) -> Self {
        DataStream::of(s.to_owned())
    }
}

impl From<String> for DataStream<String> {
    fn from(s: String) -> Self {
        DataStream::of(s)
    }
}

impl From<ViewNode> for DataStream<ViewNode> {
    fn from(node: ViewNode) -> Self {
        DataStream::of(node)
    }
}

impl From<Element> for DataStream<ViewNode> {
    fn from(e: Element) -> Self {
        DataStream::of(e.node())
    }
}

// ── Renderable ────────────────────────────────────────────────────────────────

/// Anything a route can render or use as a title.
///
/// A renderable is a constant, a stream, or a function of the accumulated
/// request context producing either. It is resolved each time the chain runs.
///
/// ```rust,ignore
/// route.title("Settings");
/// route.render(Renderable::from_fn(|ctx| greeting(ctx)));
/// route.render(Renderable::from_stream_fn(|ctx| live_feed(ctx)));
/// ```
pub struct Renderable<T>(Arc<dyn Fn(&Context) -> DataStream<T> + Send + Sync>);

impl<T: Item> Renderable<T> {
    pub fn from_fn(f: impl Fn(&Context) -> T + Send + Sync + 'static) -> Self {
        Self(Arc::new(move |ctx| DataStream::of(f(ctx))))
    }

    pub fn from_stream_fn(f: impl Fn(&Context) -> DataStream<T> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn resolve(&self, ctx: &Context) -> DataStream<T> {
        (self.0)(ctx)
    }
}

impl<T> Clone for Renderable<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Renderable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Renderable { .. }")
    }
}

impl<T: Item> From<DataStream<T>> for Renderable<T> {
    fn from(stream: DataStream<T>) -> Self {
        Self(Arc::new(move |_| stream.clone()))
    }
}

impl From<&str> for Renderable<String> {
    fn from(s: &str) -> Self {
        DataStream::of(s.to_owned()).into()
    }
}

impl From<String> for Renderable<String> {
    fn from(s: String) -> Self {
        DataStream::of(s).into()
    }
}

impl From<ViewNode> for Renderable<ViewNode> {
    fn from(node: ViewNode) -> Self {
        DataStream::of(node).into()
    }
}

impl From<Element> for Renderable<ViewNode> {
    fn from(e: Element) -> Self {
        DataStream::of(e.node()).into()
    }
}

impl From<&str> for Renderable<ViewNode> {
    fn from(s: &str) -> Self {
        DataStream::of(ViewNode::from(s)).into()
    }
}
