//! Radix-tree path recognition.
//!
//! Route patterns are written `/users/:id`; they are translated to
//! [`matchit`]'s `{id}` syntax on registration. matchit already ranks static
//! segments above parameters, so a path recognizes at most one route: the
//! most specific one.

use matchit::Router as MatchitRouter;
use tracing::trace;
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::route::RouteRef;
use crate::transition::{Params, QueryParams, Transition};

/// A recognized path.
#[derive(Debug, Clone)]
pub struct Match<H> {
    pub handler: H,
    pub params: Params,
}

/// Maps path patterns to handlers. Build it once; lookups are
/// O(path-length).
pub struct Matcher<H> {
    tree: MatchitRouter<H>,
}

impl<H: Clone> Matcher<H> {
    pub fn new() -> Self {
        Self { tree: MatchitRouter::new() }
    }

    /// Registers `handler` under `pattern`. Conflicting or malformed
    /// patterns are rejected.
    pub fn add(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.tree.insert(to_matchit(pattern), handler).map_err(|e| Error::InvalidRoute {
            path: pattern.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Every route recognizing `path`, most specific first.
    pub fn recognize(&self, path: &str) -> Vec<Match<H>> {
        let Ok(matched) = self.tree.at(path) else { return Vec::new() };
        let params = matched.params.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        vec![Match { handler: matched.value.clone(), params }]
    }
}

impl<H: Clone> Default for Matcher<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher<RouteRef> {
    /// A matcher over `routes`, keyed by each route's own pattern.
    pub fn from_routes(routes: &[RouteRef]) -> Result<Self> {
        let mut matcher = Self::new();
        for route in routes {
            matcher.add(&route.path(), route.clone())?;
        }
        Ok(matcher)
    }
}

/// Resolves a URL (path plus optional query string) to a transition.
pub fn match_transition(matcher: &Matcher<RouteRef>, url: &str) -> Result<Transition> {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let Some(matched) = matcher.recognize(path).into_iter().next() else {
        return Err(Error::NoMatch(url.to_owned()));
    };
    trace!(%url, route = %matched.handler.path(), "matched");

    let mut query_params = QueryParams::new();
    for (k, v) in form_urlencoded::parse(query.as_bytes()) {
        query_params.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    Ok(Transition { handler: matched.handler, params: matched.params, query: query_params })
}

fn to_matchit(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::app;
    use crate::transition::stringify_transition;

    fn routes() -> Vec<RouteRef> {
        let root = app("");
        vec![
            root.subroute("/").into(),
            root.subroute_with_params("/greet/:name", &["name"]).into(),
            root.subroute("/greet/everyone").into(),
        ]
    }

    #[test]
    fn static_segments_beat_parameters() {
        let matcher = Matcher::from_routes(&routes()).unwrap();
        let t = match_transition(&matcher, "/greet/everyone").unwrap();
        assert_eq!(t.handler.path(), "/greet/everyone");
        let t = match_transition(&matcher, "/greet/ann").unwrap();
        assert_eq!(t.param("name"), Some("ann"));
    }

    #[test]
    fn query_is_parsed() {
        let matcher = Matcher::from_routes(&routes()).unwrap();
        let t = match_transition(&matcher, "/?start=%2Fgreet%2Fann&tag=a&tag=b").unwrap();
        assert_eq!(t.query_value("start"), Some("/greet/ann"));
        assert_eq!(t.query["tag"], vec!["a", "b"]);
    }

    #[test]
    fn unknown_paths_fail() {
        let matcher = Matcher::from_routes(&routes()).unwrap();
        assert!(matches!(match_transition(&matcher, "/nope"), Err(Error::NoMatch(_))));
    }

    #[test]
    fn duplicate_patterns_are_rejected() {
        let mut matcher = Matcher::new();
        matcher.add("/a/:x", 1).unwrap();
        assert!(matches!(matcher.add("/a/:x", 2), Err(Error::InvalidRoute { .. })));
    }

    #[test]
    fn stringify_round_trips() {
        let matcher = Matcher::from_routes(&routes()).unwrap();
        for route in routes() {
            let t = Transition::new(route).with_param("name", "bob").with_query("q", "x y");
            let url = stringify_transition(&t);
            let back = match_transition(&matcher, &url).unwrap();
            assert_eq!(stringify_transition(&back), url);
            assert_eq!(back.handler, t.handler);
        }
    }
}
