//! Middleware trait, continuations and composition.
//!
//! # The shape of a middleware
//!
//! A middleware receives the request [`Context`] built so far and a [`Next`]
//! continuation standing for "the rest of the chain". It may:
//!
//! - enrich the context and call `next.run(ctx)`,
//! - inspect or rewrite the response `next` resolves to,
//! - short-circuit without calling `next` at all (an auth guard redirecting).
//!
//! Any async closure with the right signature is a middleware:
//!
//! ```rust,ignore
//! let logged = |ctx: Context, next: Next| async move {
//!     let response = next.run(ctx).await?;
//!     tracing::debug!(status = %response.status(), "rendered");
//!     Ok(response)
//! };
//! ```
//!
//! # How composition threads the context
//!
//! ```text
//! compose(a, b)(ctx, next)
//!   = a(ctx, |ctx2| b(ctx ⊕ ctx2, next))
//! ```
//!
//! `⊕` is [`Context::merge`]: whatever `a` passed on is layered over what it
//! received, so context only ever grows along the chain. Composition is
//! associative, which lets routes rebuild their chains in any grouping.
//!
//! Middlewares are stored type-erased as [`BoxedMiddleware`] so a route can
//! hold a heterogeneous chain; invoking one costs an `Arc` clone and a
//! virtual call.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::Result;
use crate::response::Response;

pub mod http;
pub mod rendering;
pub mod request;
pub mod store;

/// What a chain resolves to.
pub type MountResult = Result<Response>;

/// A composable async request transformer.
///
/// Implemented for every `Fn(Context, Next) -> impl Future<Output = MountResult>`.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, ctx: Context, next: Next) -> BoxFuture<'static, MountResult>;
}

/// A heap-allocated, type-erased middleware shared by every chain it is
/// part of.
pub type BoxedMiddleware = Arc<dyn Middleware>;

impl<F, Fut> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MountResult> + Send + 'static,
{
    fn call(&self, ctx: Context, next: Next) -> BoxFuture<'static, MountResult> {
        Box::pin((self)(ctx, next))
    }
}

pub fn boxed(m: impl Middleware) -> BoxedMiddleware {
    Arc::new(m)
}

// ── Next ──────────────────────────────────────────────────────────────────────

type Continuation = dyn Fn(Context) -> BoxFuture<'static, MountResult> + Send + Sync;

/// The rest of the chain, as seen from inside a middleware.
#[derive(Clone)]
pub struct Next(Arc<Continuation>);

impl Next {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MountResult> + Send + 'static,
    {
        Self(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    pub fn run(&self, ctx: Context) -> BoxFuture<'static, MountResult> {
        (self.0)(ctx)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Next { .. }")
    }
}

/// The base continuation: resolves to an empty render.
pub fn terminate() -> Next {
    Next::new(|_| async { Ok(Response::default()) })
}

/// Passes the context through unchanged.
pub fn noop() -> BoxedMiddleware {
    boxed(|ctx: Context, next: Next| next.run(ctx))
}

// ── Composition ───────────────────────────────────────────────────────────────

struct Compose {
    outer: BoxedMiddleware,
    inner: BoxedMiddleware,
}

impl Middleware for Compose {
    fn call(&self, ctx: Context, next: Next) -> BoxFuture<'static, MountResult> {
        let inner = Arc::clone(&self.inner);
        let base = ctx.clone();
        let rest = Next(Arc::new(move |ctx2: Context| inner.call(base.merge(&ctx2), next.clone())));
        self.outer.call(ctx, rest)
    }
}

/// `outer` runs first and decides whether `inner` runs at all.
pub fn compose(outer: BoxedMiddleware, inner: BoxedMiddleware) -> BoxedMiddleware {
    Arc::new(Compose { outer, inner })
}

/// Composes every middleware in order, or [`noop`] for an empty chain.
pub fn chain(middleware: impl IntoIterator<Item = BoxedMiddleware>) -> BoxedMiddleware {
    middleware.into_iter().reduce(compose).unwrap_or_else(noop)
}
