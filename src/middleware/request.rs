//! Middlewares that add values to the request context.

use std::any::Any;
use std::future::Future;

use crate::context::{Context, Key};
use crate::error::Result;
use crate::middleware::{BoxedMiddleware, Next, boxed};

/// Computes a value from the context and stores it under `key` for the rest
/// of the chain. A failure aborts the chain.
///
/// ```rust,ignore
/// const USER: Key<User> = Key::new("user");
///
/// route.middleware(request_prop(USER, |ctx| async move {
///     load_user(&ctx).await
/// }));
/// ```
pub fn request_prop<T, F, Fut>(key: Key<T>, f: F) -> BoxedMiddleware
where
    T: Any + Send + Sync,
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    boxed(move |ctx: Context, next: Next| {
        let value = f(ctx.clone());
        async move {
            let value = value.await?;
            next.run(ctx.with(key, value)).await
        }
    })
}

/// Like [`request_prop`], for several values at once: `f` returns a context
/// whose values are merged over the current one.
pub fn request_props<F, Fut>(f: F) -> BoxedMiddleware
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Context>> + Send + 'static,
{
    boxed(move |ctx: Context, next: Next| {
        let added = f(ctx.clone());
        async move {
            let added = added.await?;
            next.run(ctx.merge(&added)).await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::middleware::compose;
    use crate::response::{Render, Response};

    const ANSWER: Key<u32> = Key::new("answer");
    const LABEL: Key<String> = Key::new("label");

    fn read_back() -> Next {
        Next::new(|ctx: Context| async move {
            let title = format!("{:?}/{:?}", ctx.get(ANSWER), ctx.get(LABEL));
            Ok(Render::new().with_title(title).into())
        })
    }

    async fn title(response: Response) -> String {
        match response {
            Response::Render(r) => r.title_stream().first().await.unwrap(),
            Response::Redirect(_) => panic!("unexpected redirect"),
        }
    }

    #[tokio::test]
    async fn props_accumulate() {
        let m = compose(
            request_prop(ANSWER, |_| async { Ok(42) }),
            request_props(|ctx: Context| async move {
                let n = ctx.require(ANSWER)?;
                Ok(Context::new().with(LABEL, format!("n={n}")))
            }),
        );
        let response = m.call(Context::new(), read_back()).await.unwrap();
        assert_eq!(title(response).await, r#"Some(42)/Some("n=42")"#);
    }

    #[tokio::test]
    async fn failing_prop_aborts() {
        let m = request_prop(ANSWER, |_| async { Err::<u32, _>(Error::msg("lookup failed")) });
        let err = m.call(Context::new(), read_back()).await.unwrap_err();
        assert_eq!(err.to_string(), "lookup failed");
    }
}
