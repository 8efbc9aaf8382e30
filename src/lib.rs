//! # weft
//!
//! An isomorphic web micro-framework: the same route tree renders pages on
//! the server and drives navigation in the client.
//!
//! ## The pieces
//!
//! | Piece | Module | Role |
//! |---|---|---|
//! | Route tree | [`route`] | path patterns bound to middleware chains |
//! | Middleware | [`middleware`] | async context transformers, composed associatively |
//! | Matcher | [`matcher`] | radix-tree URL → [`Transition`] via [`matchit`] |
//! | Streams | [`stream`] | push-based, memoized, duplicate-suppressing values |
//! | Resource cache | [`resource`] | fetch dedupe, optimistic mutation, rollback |
//! | Client runner | [`mount`] | race-safe transitions, atomic title + body commits |
//! | Server | [`server`] | hyper server rendering full documents, graceful shutdown |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft::middleware::store::add_store;
//! use weft::view::Element;
//! use weft::{App, RouteRef, Server, app};
//!
//! #[tokio::main]
//! async fn main() -> weft::Result<()> {
//!     let root = app("")
//!         .middleware(add_store())
//!         .render_container(Element::new("main"));
//!
//!     let home = root.subroute("/").title("Home").render("Hello");
//!     let greet = root
//!         .subroute_with_params("/greet/:name", &["name"])
//!         .title("Greeting")
//!         .render("Hi there");
//!
//!     let routes: Vec<RouteRef> = vec![home.into(), greet.into()];
//!     Server::bind("0.0.0.0:3000")?.serve(App::new(routes)?).await
//! }
//! ```
//!
//! ## Where things run
//!
//! Middlewares see [`Environment::Server`](context::Environment) during a
//! server render and [`Environment::Client`](context::Environment) inside a
//! mounted [`Client`](mount::Client). The server starts every request from a
//! fresh resource store; the client keeps one store for its whole session.

pub mod async_value;
pub mod auth;
pub mod config;
pub mod context;
pub mod cookies;
pub mod error;
pub mod http;
pub mod matcher;
pub mod middleware;
pub mod mount;
pub mod render;
pub mod resource;
pub mod response;
pub mod route;
pub mod server;
pub mod store;
pub mod stream;
pub mod transition;
pub mod view;

pub use async_value::AsyncValue;
pub use config::Config;
pub use context::{Context, Key};
pub use error::{Error, Result};
pub use matcher::{Matcher, match_transition};
pub use middleware::{Middleware, Next, compose};
pub use mount::{Client, Host, MountParams};
pub use resource::{Mutation, Resource};
pub use response::{Redirect, Render, Renderable, Response};
pub use route::{Route, RouteRef, app};
pub use server::{App, Document, Server};
pub use stream::DataStream;
pub use transition::{Transition, TransitionBus, stringify_transition};
pub use view::{View, ViewNode};
