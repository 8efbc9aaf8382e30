//! Routes and route trees.
//!
//! A [`Route`] is an immutable value: a path pattern plus a middleware chain.
//! Every builder method returns a *new* route sharing the receiver's chain,
//! so a common base can be branched freely:
//!
//! ```rust,ignore
//! let root = app("").middleware(add_store()).render_container(layout());
//!
//! let home  = root.subroute("/").title("Home").render(home_page());
//! let greet = root
//!     .subroute_with_params("/greet/:name", &["name"])
//!     .title(Renderable::from_fn(|ctx| greeting(ctx)));
//! ```
//!
//! A subroute extends its parent's *path* and starts from an empty chain of
//! its own. When it runs, [`Route::apply`] runs the parent's chain first,
//! then the child's, threading the accumulated context from one to the next.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::{Context, Key};
use crate::middleware::request::request_prop;
use crate::middleware::rendering;
use crate::middleware::{BoxedMiddleware, MountResult, Next, compose, noop, terminate};
use crate::response::Renderable;
use crate::transition::Transition;
use crate::view::ViewNode;

/// A route together with the context its chain had built when it handed
/// over to the next route.
#[derive(Debug, Clone)]
pub struct BoundRoute {
    pub route: Route,
    pub context: Context,
}

/// Called once the innermost route has run, with the final context and the
/// trail of routes that produced it, outermost first.
pub type Leaf = Arc<dyn Fn(Context, Vec<BoundRoute>) -> BoxFuture<'static, MountResult> + Send + Sync>;

// ── Route ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Route(Arc<RouteInner>);

struct RouteInner {
    path: String,
    middleware: BoxedMiddleware,
    parent: Option<Route>,
    params: Vec<String>,
}

/// A root route at `base_path` with an empty chain.
pub fn app(base_path: &str) -> Route {
    Route(Arc::new(RouteInner {
        path: join_path("", base_path),
        middleware: noop(),
        parent: None,
        params: Vec::new(),
    }))
}

impl Route {
    pub fn path(&self) -> &str {
        &self.0.path
    }

    /// Parameter names declared by [`subroute_with_params`](Self::subroute_with_params).
    pub fn params(&self) -> &[String] {
        &self.0.params
    }

    pub fn parent(&self) -> Option<&Route> {
        self.0.parent.as_ref()
    }

    /// Appends `m` to the chain.
    pub fn middleware(&self, m: BoxedMiddleware) -> Route {
        Route(Arc::new(RouteInner {
            path: self.0.path.clone(),
            middleware: compose(Arc::clone(&self.0.middleware), m),
            parent: self.0.parent.clone(),
            params: self.0.params.clone(),
        }))
    }

    /// Stores the value built by `factory` from the accumulated context
    /// under `key`.
    pub fn add<T, F>(&self, key: Key<T>, factory: F) -> Route
    where
        T: Any + Send + Sync,
        F: Fn(&Context) -> T + Send + Sync + 'static,
    {
        self.middleware(request_prop(key, move |ctx: Context| {
            let value = factory(&ctx);
            async move { Ok(value) }
        }))
    }

    pub fn render(&self, content: impl Into<Renderable<ViewNode>>) -> Route {
        self.middleware(rendering::render(content))
    }

    pub fn render_container(&self, container: impl Into<Renderable<ViewNode>>) -> Route {
        self.middleware(rendering::render_container(container))
    }

    pub fn title(&self, title: impl Into<Renderable<String>>) -> Route {
        self.middleware(rendering::render_title(title))
    }

    /// A child route at `path` below this one.
    pub fn subroute(&self, path: &str) -> Route {
        self.subroute_with_params(path, &[])
    }

    /// A child route whose pattern declares the `:name` parameters listed in
    /// `params`.
    ///
    /// # Panics
    ///
    /// Panics if a listed parameter does not appear in the joined pattern.
    pub fn subroute_with_params(&self, path: &str, params: &[&str]) -> Route {
        let path = join_path(&self.0.path, path);
        for name in params {
            let declared = path.split('/').any(|segment| segment.strip_prefix(':') == Some(*name));
            if !declared {
                panic!("invalid route `{path}`: parameter `{name}` is not a path segment");
            }
        }
        Route(Arc::new(RouteInner {
            path,
            middleware: noop(),
            parent: Some(self.clone()),
            params: params.iter().map(|p| p.to_string()).collect(),
        }))
    }

    /// A transition to this route, with no parameters bound yet.
    pub fn transition(&self) -> Transition {
        Transition::new(self)
    }

    /// Runs every ancestor's chain and then this route's, calling `leaf`
    /// with the final context and the trail of bound routes.
    pub fn apply(&self, ctx: Context, leaf: Leaf) -> BoxFuture<'static, MountResult> {
        let this = self.clone();
        let own: Leaf = Arc::new(move |prev: Context, parents: Vec<BoundRoute>| {
            let route = this.clone();
            let leaf = Arc::clone(&leaf);
            let base = prev.clone();
            let next = Next::new(move |added: Context| {
                let ctx = base.merge(&added);
                let mut trail = parents.clone();
                trail.push(BoundRoute { route: route.clone(), context: ctx.clone() });
                leaf(ctx, trail)
            });
            this.0.middleware.call(prev, next)
        });
        match &self.0.parent {
            Some(parent) => parent.apply(ctx, own),
            None => own(ctx, Vec::new()),
        }
    }

    /// Runs the full chain down to an empty render.
    pub fn run(&self, ctx: Context) -> BoxFuture<'static, MountResult> {
        self.apply(ctx, Arc::new(|ctx: Context, _: Vec<BoundRoute>| terminate().run(ctx)))
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Route").field(&self.0.path).finish()
    }
}

/// Joins two path patterns into a normalized one with a leading `/`.
fn join_path(base: &str, path: &str) -> String {
    let segments: Vec<&str> =
        base.split('/').chain(path.split('/')).filter(|s| !s.is_empty() && *s != ".").collect();
    format!("/{}", segments.join("/"))
}

// ── RouteRef ──────────────────────────────────────────────────────────────────

/// A route, or a function producing one.
///
/// The lazy form breaks cycles between route definitions that link to each
/// other. Two refs are equal when they resolve to the same path.
#[derive(Clone)]
pub enum RouteRef {
    Route(Route),
    Lazy(Arc<dyn Fn() -> Route + Send + Sync>),
}

impl RouteRef {
    pub fn lazy(f: impl Fn() -> Route + Send + Sync + 'static) -> Self {
        Self::Lazy(Arc::new(f))
    }

    pub fn resolve(&self) -> Route {
        match self {
            Self::Route(r) => r.clone(),
            Self::Lazy(f) => f(),
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::Route(r) => r.path().to_owned(),
            Self::Lazy(f) => f().path().to_owned(),
        }
    }
}

impl PartialEq for RouteRef {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path()
    }
}

impl fmt::Debug for RouteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouteRef").field(&self.path()).finish()
    }
}

impl From<Route> for RouteRef {
    fn from(r: Route) -> Self {
        Self::Route(r)
    }
}

impl From<&Route> for RouteRef {
    fn from(r: &Route) -> Self {
        Self::Route(r.clone())
    }
}
