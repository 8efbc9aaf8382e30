//! Transitions, their URL encoding, and the navigation bus.
//!
//! A [`Transition`] names a place in the application: a route plus the
//! values of its path parameters and an optional query. It converts to a URL
//! with [`stringify_transition`] and back with
//! [`match_transition`](crate::matcher::match_transition).
//!
//! ```text
//! Transition { handler: /greet/:name, params: {name: "ann"}, query: {lang: [en]} }
//!     ⇄  "/greet/ann?lang=en"
//! ```

use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;
use url::form_urlencoded;

use crate::route::{Route, RouteRef};
use crate::stream::{DataStream, Equality, Sink};

pub type Params = BTreeMap<String, String>;
pub type QueryParams = BTreeMap<String, Vec<String>>;

// ── Transition ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub handler: RouteRef,
    pub params: Params,
    pub query: QueryParams,
}

impl Transition {
    pub fn new(handler: impl Into<RouteRef>) -> Self {
        Self { handler: handler.into(), params: Params::new(), query: QueryParams::new() }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Appends a query value; repeated names keep every value.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// The first value of a query parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.get(name)?.first().map(String::as_str)
    }

    pub fn route(&self) -> Route {
        self.handler.resolve()
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&stringify_transition(self))
    }
}

/// Renders a transition as a URL path.
///
/// Every `:name` segment of the route pattern is replaced by the bound value
/// verbatim; a segment whose parameter is missing or empty is left as is. A
/// query string is appended only when there are query parameters.
pub fn stringify_transition(t: &Transition) -> String {
    let pattern = t.handler.path();
    let mut out = pattern
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => match t.params.get(name) {
                Some(value) if !value.is_empty() => value.as_str(),
                _ => segment,
            },
            None => segment,
        })
        .collect::<Vec<_>>()
        .join("/");

    if !t.query.is_empty() {
        let pairs = t.query.iter().flat_map(|(k, vs)| vs.iter().map(move |v| (k, v)));
        let query = form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish();
        out.push('?');
        out.push_str(&query);
    }
    out
}

// ── Navigation bus ────────────────────────────────────────────────────────────

/// The channel through which in-page navigation reaches the router.
///
/// One bus is owned per mounted client and handed to every request through
/// the context. Requests are carried as URL strings; repeated requests for
/// the same URL are all delivered.
#[derive(Clone)]
pub struct TransitionBus {
    sink: Sink<String>,
    stream: DataStream<String>,
}

impl TransitionBus {
    pub fn new() -> Self {
        let (sink, stream) = DataStream::channel_with(Equality::Never);
        Self { sink, stream }
    }

    /// Requests navigation to `target`. Dropped when nothing is listening.
    pub fn request(&self, target: Transition) {
        self.request_path(stringify_transition(&target));
    }

    pub fn request_path(&self, path: impl Into<String>) {
        let path = path.into();
        if !self.stream.is_observed() {
            trace!(%path, "no transition listener, request dropped");
            return;
        }
        trace!(%path, "transition requested");
        self.sink.next(path);
    }

    /// Requested URLs, in order.
    pub fn stream(&self) -> DataStream<String> {
        self.stream.clone()
    }

    pub fn link(&self, target: Transition) -> Link {
        Link { href: stringify_transition(&target), target, bus: self.clone() }
    }
}

impl Default for TransitionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransitionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransitionBus { .. }")
    }
}

// ── Links ─────────────────────────────────────────────────────────────────────

/// Modifier keys held while a link is activated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub meta: bool,
}

impl Modifiers {
    pub fn any(&self) -> bool {
        self.shift || self.ctrl || self.meta
    }
}

/// An anchor bound to a transition.
#[derive(Debug, Clone)]
pub struct Link {
    pub href: String,
    target: Transition,
    bus: TransitionBus,
}

impl Link {
    /// Requests the transition unless a modifier key is held, in which case
    /// the host should follow `href` itself. Returns whether it was handled.
    pub fn activate(&self, modifiers: Modifiers) -> bool {
        if modifiers.any() {
            return false;
        }
        self.bus.request(self.target.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::app;

    #[test]
    fn substitutes_params_and_appends_query() {
        let greet = app("").subroute_with_params("/greet/:name", &["name"]);
        let t = Transition::new(&greet).with_param("name", "ann").with_query("start", "/a b");
        assert_eq!(stringify_transition(&t), "/greet/ann?start=%2Fa+b");
    }

    #[test]
    fn missing_param_keeps_placeholder() {
        let greet = app("").subroute_with_params("/greet/:name", &["name"]);
        assert_eq!(Transition::new(&greet).to_string(), "/greet/:name");
    }

    #[test]
    fn requests_without_listener_are_dropped() {
        let bus = TransitionBus::new();
        bus.request_path("/ignored");
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = std::sync::Arc::clone(&seen);
        let _sub = bus.stream().for_each(move |p| log.lock().unwrap().push(p));
        bus.request_path("/a");
        bus.request_path("/a");
        assert_eq!(*seen.lock().unwrap(), vec!["/a", "/a"]);
    }

    #[test]
    fn link_respects_modifiers() {
        let bus = TransitionBus::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = std::sync::Arc::clone(&seen);
        let _sub = bus.stream().for_each(move |p| log.lock().unwrap().push(p));

        let link = bus.link(Transition::new(&app("").subroute("/about")));
        assert_eq!(link.href, "/about");
        assert!(!link.activate(Modifiers { ctrl: true, ..Modifiers::default() }));
        assert!(link.activate(Modifiers::default()));
        assert_eq!(*seen.lock().unwrap(), vec!["/about"]);
    }
}
