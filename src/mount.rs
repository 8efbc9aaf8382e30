//! Client mount and transition runner.
//!
//! [`start`] performs the initial render of a path and hands back a
//! [`Client`] that follows navigation requests from then on. Everything
//! visible goes through a [`Host`] (the browser shell, a test recorder).
//!
//! # One transition
//!
//! ```text
//! requested ──▶ chain running ──┬─▶ render ──▶ first title AND body ──▶ commit
//!                               │                                        │
//!                               └─▶ redirect ──▶ requested (replace)     ▼
//!                                                        unsubscribe old streams,
//!                                                        subscribe new ones,
//!                                                        push / replace location
//! ```
//!
//! Every transition takes a new id when it is requested. A run whose id is no
//! longer current once its chain (or its first title and body) resolves is
//! dropped without touching the host; redirects followed on behalf of a run
//! keep its id. Transitions are never cancelled, only ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{error, trace};

use crate::context::{Context, ENVIRONMENT, Environment, LOCATION, STORE, TRANSITIONS};
use crate::error::{Error, Result};
use crate::matcher::{Matcher, match_transition};
use crate::resource::create_store;
use crate::response::{Render, Response};
use crate::route::RouteRef;
use crate::stream::{DataStream, Subscription, lock};
use crate::transition::{Transition, TransitionBus, stringify_transition};
use crate::view::{Element, ViewNode};

/// The surface a client renders into.
pub trait Host: Send + Sync + 'static {
    fn set_title(&self, title: &str);
    fn push_location(&self, title: &str, url: &str);
    fn replace_location(&self, title: &str, url: &str);
    fn render(&self, content: ViewNode);
}

pub struct MountParams {
    pub routes: Vec<RouteRef>,
    /// The path (with query) to render first.
    pub path: String,
    pub host: Arc<dyn Host>,
    /// In-page navigation requests.
    pub bus: TransitionBus,
    /// Navigation the host reports by itself, such as history pops.
    pub external: DataStream<String>,
    /// Values every request starts from: HTTP client, cookies, config.
    pub context: Context,
}

impl MountParams {
    pub fn new(routes: Vec<RouteRef>, path: impl Into<String>, host: Arc<dyn Host>) -> Self {
        Self {
            routes,
            path: path.into(),
            host,
            bus: TransitionBus::new(),
            external: DataStream::never(),
            context: Context::new(),
        }
    }
}

/// Mounts the application at `params.path`.
///
/// Fails if the path, or a path it redirects to, matches no route, if a
/// middleware fails, if the route declares no body, or on a redirect back to
/// the requested path.
pub async fn start(params: MountParams) -> Result<Client> {
    let matcher = Matcher::from_routes(&params.routes)?;
    let context = params
        .context
        .with(STORE, create_store())
        .with(TRANSITIONS, params.bus.clone())
        .with(ENVIRONMENT, Environment::Client);

    let mut path = params.path;
    let (render, content) = loop {
        let location = match_transition(&matcher, &path)?;
        trace!(%path, "matched initial route");
        match location.route().run(context.with(LOCATION, location)).await? {
            Response::Render(render) => {
                trace!(%path, "performing initial render");
                let body = render.body.clone().ok_or_else(|| Error::MissingBody(path.clone()))?;
                let content = body.first().await?;
                break (render, content);
            }
            Response::Redirect(redirect) => {
                let target = stringify_transition(&redirect.location);
                trace!(from = %path, to = %target, "redirecting initial page");
                if target == path {
                    return Err(Error::RecursiveRedirect { from: path, to: target });
                }
                path = target;
            }
        }
    };

    let client = Client(Arc::new(Inner {
        matcher,
        host: params.host,
        context,
        current: AtomicU64::new(0),
        commit: Mutex::new(()),
        mounted: Mutex::new(Mounted::default()),
        navigation: Mutex::new(None),
    }));
    client.show(content);
    client.follow(&render);

    let runner = client.clone();
    let requests = DataStream::merge(vec![params.bus.stream(), params.external]);
    *lock(&client.0.navigation) = Some(requests.for_each(move |path| runner.navigate(&path)));
    Ok(client)
}

/// [`start`], rendering the failure as the page outside production.
pub async fn client_main(params: MountParams) -> Result<Client> {
    let host = Arc::clone(&params.host);
    let production = params.context.config().is_production();
    let result = start(params).await;
    if let Err(e) = &result {
        error!(error = %e, "initial mount failed");
        if !production {
            host.render(Element::new("div").attr("class", "weft-error").child(e.to_string()).node());
        }
    }
    result
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Client(Arc<Inner>);

struct Inner {
    matcher: Matcher<RouteRef>,
    host: Arc<dyn Host>,
    context: Context,
    current: AtomicU64,
    /// Held while a transition checks that it is current and commits.
    commit: Mutex<()>,
    mounted: Mutex<Mounted>,
    navigation: Mutex<Option<Subscription>>,
}

/// What is on screen and the listeners keeping it up to date.
#[derive(Default)]
struct Mounted {
    content: Option<ViewNode>,
    title: Option<String>,
    listeners: Vec<Subscription>,
}

impl Client {
    /// Runs `target`'s chain and commits the result unless a newer transition
    /// was requested meanwhile.
    ///
    /// The transition takes its id when this is called, not when the future
    /// is first polled.
    pub fn perform_transition(&self, target: Transition, replace: bool) -> BoxFuture<'static, Result<()>> {
        let id = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.clone().run(target, replace, id)
    }

    /// Matches `path` and performs the transition in the background.
    pub fn navigate(&self, path: &str) {
        let target = match match_transition(&self.0.matcher, path) {
            Ok(target) => target,
            Err(e) => {
                error!(%path, error = %e, "navigation failed");
                return;
            }
        };
        let transition = self.perform_transition(target, false);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(%path, "navigation needs a tokio runtime");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = transition.await {
                error!(error = %e, "transition failed");
            }
        });
    }

    /// Stops following navigation and the current page's streams.
    pub fn unmount(&self) {
        if let Some(navigation) = lock(&self.0.navigation).take() {
            navigation.unsubscribe();
        }
        let listeners = std::mem::take(&mut lock(&self.0.mounted).listeners);
        listeners.into_iter().for_each(Subscription::unsubscribe);
    }

    /// The context every transition of this client starts from.
    pub fn context(&self) -> &Context {
        &self.0.context
    }

    fn is_current(&self, id: u64) -> bool {
        self.0.current.load(Ordering::SeqCst) == id
    }

    fn run(self, target: Transition, replace: bool, id: u64) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let address = stringify_transition(&target);
            trace!(%address, replace, "received transition request");

            let response = target.route().run(self.0.context.with(LOCATION, target.clone())).await;
            if !self.is_current(id) {
                trace!(%address, "superseded, ignoring result");
                return Ok(());
            }
            let render = match response? {
                Response::Render(render) => render,
                Response::Redirect(redirect) => {
                    let next = stringify_transition(&redirect.location);
                    trace!(from = %address, to = %next, "redirect");
                    if next == address {
                        return Err(Error::RecursiveRedirect { from: address, to: next });
                    }
                    return self.run(redirect.location, true, id).await;
                }
            };

            let body = render.body.clone().ok_or_else(|| Error::MissingBody(address.clone()))?;
            let title_stream = render.title_stream();
            // Keeps both streams running between the first values and the
            // listeners attached on commit.
            let hold = [body.for_each(|_| {}), title_stream.for_each(|_| {})];
            let first = DataStream::combine2(body.take(1), title_stream.take(1)).first().await;
            let (content, title) = match first {
                Ok(values) => values,
                Err(e) => {
                    hold.into_iter().for_each(Subscription::unsubscribe);
                    return Err(e);
                }
            };

            // Checking the id and committing are one step.
            let _commit = lock(&self.0.commit);
            if !self.is_current(id) {
                trace!(%address, "superseded after render, ignoring result");
                hold.into_iter().for_each(Subscription::unsubscribe);
                return Ok(());
            }

            trace!(%address, "transition complete");
            self.show(content);
            self.show_title(title.clone());
            self.follow(&render);
            hold.into_iter().for_each(Subscription::unsubscribe);

            if replace {
                self.0.host.replace_location(&title, &address);
            } else {
                self.0.host.push_location(&title, &address);
            }
            Ok(())
        })
    }

    fn show(&self, content: ViewNode) {
        {
            let mut mounted = lock(&self.0.mounted);
            if mounted.content.as_ref() == Some(&content) {
                return;
            }
            mounted.content = Some(content.clone());
        }
        self.0.host.render(content);
    }

    fn show_title(&self, title: String) {
        {
            let mut mounted = lock(&self.0.mounted);
            if mounted.title.as_deref() == Some(title.as_str()) {
                return;
            }
            mounted.title = Some(title.clone());
        }
        self.0.host.set_title(&title);
    }

    /// Moves the page listeners from the previous response to `render`.
    fn follow(&self, render: &Render) {
        let previous = std::mem::take(&mut lock(&self.0.mounted).listeners);
        previous.into_iter().for_each(Subscription::unsubscribe);

        let mut listeners = Vec::with_capacity(2);
        if let Some(body) = &render.body {
            let client = self.clone();
            listeners.push(body.for_each(move |content| client.show(content)));
        }
        let client = self.clone();
        listeners.push(render.title_stream().for_each(move |title| client.show_title(title)));
        lock(&self.0.mounted).listeners = listeners;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("transition", &self.0.current.load(Ordering::SeqCst)).finish()
    }
}
