//! Minimal weft example: a page tree served as HTML, with one page reading
//! from a (stubbed) remote API through the resource cache.
//!
//! Run with:
//!   RUST_LOG=trace cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/
//!   curl http://localhost:3000/greet/world
//!   curl http://localhost:3000/greet/nobody
//!   curl -i http://localhost:3000/hello

use http::Method;
use serde_json::json;
use weft::context::CONFIG;
use weft::http::{Stub, StubbedEndpoints};
use weft::middleware::http::{RetryConfig, add_stub_http_client, retry_requests};
use weft::middleware::request::request_prop;
use weft::middleware::store::add_store;
use weft::middleware::{BoxedMiddleware, Next, boxed};
use weft::view::{Element, text};
use weft::{App, AsyncValue, Config, Context, DataStream, Key, Redirect, Renderable, Resource, Server, ViewNode, app};

const API: &str = "https://api.example.com";

const GREETINGS: Key<Resource> = Key::new("greetings");

#[tokio::main]
async fn main() -> weft::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let stubs = StubbedEndpoints::new()
        .on(Method::GET, &format!("{API}/greetings/world"), Stub::Json(json!({"salutation": "Hello"})));

    let root = app("")
        .middleware(add_store())
        .middleware(add_stub_http_client(stubs))
        .middleware(retry_requests(RetryConfig::default()))
        .render_container(Element::new("main"));

    let home = root
        .subroute("/")
        .title("Home")
        .render(Element::new("a").attr("href", "/greet/world").child("Greet the world"));

    let greet = root
        .subroute_with_params("/greet/:name", &["name"])
        .middleware(greetings())
        .title(Renderable::from_fn(|ctx: &Context| format!("Greeting {}", name(ctx))))
        .render(Renderable::from_stream_fn(greeting));

    let target = home.clone();
    let hello = root.subroute("/hello").middleware(boxed(move |_: Context, _: Next| {
        let to = target.transition();
        async move { Ok(Redirect::to(to).into()) }
    }));

    let app = App::new(vec![home.into(), greet.into(), hello.into()])?
        .with_context(Context::new().with(CONFIG, config));

    Server::bind("0.0.0.0:3000")?.serve(app).await
}

fn name(ctx: &Context) -> String {
    ctx.location().ok().and_then(|l| l.param("name").map(str::to_owned)).unwrap_or_default()
}

/// Greetings by name, fetched from the API.
fn greetings() -> BoxedMiddleware {
    request_prop(GREETINGS, |ctx: Context| async move {
        let (store, http) = (ctx.store()?, ctx.http()?);
        Ok(Resource::new("greetings", store, move |name| {
            let http = http.clone();
            async move { http.get_json(&format!("{API}/greetings/{name}")).await }
        }))
    })
}

/// The greeting once it has loaded or failed.
fn greeting(ctx: &Context) -> DataStream<ViewNode> {
    let Some(greetings) = ctx.get(GREETINGS) else {
        return DataStream::of(text("greetings unavailable"));
    };
    let who = name(ctx);
    greetings
        .select(&who)
        .filter(|value| !value.is_loading())
        .map(move |value: AsyncValue<serde_json::Value>| match value {
            AsyncValue::Present(p) => {
                let salutation = p.value["salutation"].as_str().unwrap_or("Hi").to_owned();
                Element::new("h1").child(format!("{salutation}, {who}!")).node()
            }
            AsyncValue::Failed(e) => Element::new("p").attr("class", "error").child(e.to_string()).node(),
            AsyncValue::Loading | AsyncValue::Deleted => text(""),
        })
}
