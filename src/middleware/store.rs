//! Resource cache middleware.

use crate::context::{Context, STORE};
use crate::middleware::{BoxedMiddleware, Next, boxed};
use crate::resource::{ResourceStore, create_store};

/// Makes a resource store available as [`STORE`].
///
/// A store already in the context (the client keeps one for the whole
/// session) is left in place; otherwise a fresh one is created for this
/// request.
pub fn add_store() -> BoxedMiddleware {
    boxed(|ctx: Context, next: Next| {
        if ctx.contains(STORE) {
            return next.run(ctx);
        }
        next.run(ctx.with(STORE, create_store()))
    })
}

/// Always uses `store`, replacing any store already in the context.
pub fn add_store_with(store: ResourceStore) -> BoxedMiddleware {
    boxed(move |ctx: Context, next: Next| next.run(ctx.with(STORE, store.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::compose;
    use crate::response::{Render, Response};

    fn probe() -> Next {
        Next::new(|ctx: Context| async move {
            let found = ctx.store().is_ok().to_string();
            Ok(Render::new().with_title(found).into())
        })
    }

    #[tokio::test]
    async fn existing_store_is_kept() {
        let store = create_store();
        let expected = store.clone();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let record = std::sync::Arc::clone(&seen);
        let next = Next::new(move |ctx: Context| {
            *record.lock().unwrap() = ctx.store().ok();
            async { Ok(Response::default()) }
        });
        compose(add_store_with(store), add_store()).call(Context::new(), next).await.unwrap();
        assert_eq!(seen.lock().unwrap().clone(), Some(expected));
    }

    #[tokio::test]
    async fn store_is_created_when_missing() {
        match add_store().call(Context::new(), probe()).await.unwrap() {
            Response::Render(r) => assert_eq!(r.title_stream().first().await.unwrap(), "true"),
            Response::Redirect(_) => panic!("unexpected redirect"),
        }
    }
}
