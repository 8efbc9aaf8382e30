//! Server-side rendering of a single request.

use http::StatusCode;
use tracing::trace;

use crate::context::{COOKIES, Context, ENVIRONMENT, Environment, LOCATION, STORE};
use crate::cookies::SharedCookies;
use crate::error::{Error, Result};
use crate::matcher::{Matcher, match_transition};
use crate::resource::create_store;
use crate::response::Response;
use crate::route::RouteRef;
use crate::stream::DataStream;
use crate::transition::stringify_transition;
use crate::view::ViewNode;

pub struct RenderParams<'a> {
    pub matcher: &'a Matcher<RouteRef>,
    /// Path plus optional query string.
    pub url: &'a str,
    pub cookies: Option<SharedCookies>,
    /// Values every request starts from, such as the HTTP client.
    pub context: Context,
}

/// What the server should answer: a document or a redirect.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutput {
    pub status: StatusCode,
    /// Set for redirects.
    pub location: Option<String>,
    pub title: Option<String>,
    pub body: Option<ViewNode>,
}

/// Runs the route matching `params.url` once, in a fresh store, and waits for
/// the first title and body of the page.
///
/// Renders answer 200 and redirects 301 unless a middleware chose a status.
/// A redirect to the URL being rendered fails with
/// [`Error::RecursiveRedirect`]; a render without a body fails with
/// [`Error::MissingBody`].
pub async fn render(params: RenderParams<'_>) -> Result<RenderOutput> {
    let location = match_transition(params.matcher, params.url)?;
    let mut ctx = params
        .context
        .with(STORE, create_store())
        .with(ENVIRONMENT, Environment::Server)
        .with(LOCATION, location.clone());
    if let Some(cookies) = params.cookies {
        ctx = ctx.with(COOKIES, cookies);
    }

    let response = location.route().run(ctx).await?;
    let status = response.status();
    match response {
        Response::Render(render) => {
            let title = render.title_stream().take(1);
            let body = render
                .body
                .clone()
                .unwrap_or_else(|| DataStream::error(Error::MissingBody(params.url.to_owned())))
                .take(1);
            let (title, body) = DataStream::combine2(title, body).first().await?;
            Ok(RenderOutput { status, location: None, title: Some(title), body: Some(body) })
        }
        Response::Redirect(redirect) => {
            let address = stringify_transition(&redirect.location);
            let requested = stringify_transition(&location);
            if address == requested {
                return Err(Error::RecursiveRedirect { from: requested, to: address });
            }
            trace!(from = %requested, to = %address, "redirect");
            Ok(RenderOutput { status, location: Some(address), title: None, body: None })
        }
    }
}
