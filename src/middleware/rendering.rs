//! Render and title middlewares.
//!
//! All three run the rest of the chain first and then fill in the response.
//! The innermost body wins, since [`render`] only fills a missing one. The
//! outermost title wins, since [`render_title`] always overwrites. A container
//! wraps whatever body the inner routes produced and adds none of its own.

use crate::context::Context;
use crate::middleware::{BoxedMiddleware, Next, boxed};
use crate::response::Renderable;
use crate::stream::DataStream;
use crate::view::ViewNode;

/// Sets the body unless an inner middleware already did.
pub fn render(content: impl Into<Renderable<ViewNode>>) -> BoxedMiddleware {
    let content = content.into();
    boxed(move |ctx: Context, next: Next| {
        let content = content.clone();
        async move {
            let response = next.run(ctx.clone()).await?;
            Ok(response.map_render(|mut r| {
                if r.body.is_none() {
                    r.body = Some(content.resolve(&ctx));
                }
                r
            }))
        }
    })
}

/// Wraps the inner body in `container` via [`ViewNode::with_child`]. A
/// response without a body is left without one.
pub fn render_container(container: impl Into<Renderable<ViewNode>>) -> BoxedMiddleware {
    let container = container.into();
    boxed(move |ctx: Context, next: Next| {
        let container = container.clone();
        async move {
            let response = next.run(ctx.clone()).await?;
            Ok(response.map_render(|mut r| {
                r.body = r.body.take().map(|body| {
                    DataStream::combine2(container.resolve(&ctx), body)
                        .map(|(frame, body)| frame.with_child(body))
                });
                r
            }))
        }
    })
}

/// Sets the title, replacing any set further in.
pub fn render_title(title: impl Into<Renderable<String>>) -> BoxedMiddleware {
    let title = title.into();
    boxed(move |ctx: Context, next: Next| {
        let title = title.clone();
        async move {
            let response = next.run(ctx.clone()).await?;
            Ok(response.map_render(|mut r| {
                r.title = Some(title.resolve(&ctx));
                r
            }))
        }
    })
}
