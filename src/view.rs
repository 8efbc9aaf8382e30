//! Opaque render-tree values.
//!
//! The framework never inspects what a route renders. It only moves
//! [`ViewNode`]s through streams and, for container routes, asks a node to
//! wrap another one with [`View::with_child`]. Any view library can plug in
//! by implementing [`View`]; [`Element`] and [`text`] are a small built-in
//! HTML tree used by the server and the demos.

use std::fmt;
use std::sync::Arc;

/// A render-tree node supplied by the view layer.
pub trait View: fmt::Debug + Send + Sync + 'static {
    /// Serialized form, used for server rendering.
    fn to_html(&self) -> String;

    /// A copy of this node with `child` placed as its content.
    fn with_child(&self, child: ViewNode) -> ViewNode;
}

/// Shared handle to a [`View`]. Equal when both point at the same node.
#[derive(Clone)]
pub struct ViewNode(Arc<dyn View>);

impl ViewNode {
    pub fn new(view: impl View) -> Self {
        Self(Arc::new(view))
    }

    pub fn to_html(&self) -> String {
        self.0.to_html()
    }

    pub fn with_child(&self, child: ViewNode) -> ViewNode {
        self.0.with_child(child)
    }
}

impl PartialEq for ViewNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ViewNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ViewNode {
    fn from(s: &str) -> Self {
        text(s)
    }
}

impl From<String> for ViewNode {
    fn from(s: String) -> Self {
        text(s)
    }
}

// ── Built-in HTML nodes ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Text(String);

impl View for Text {
    fn to_html(&self) -> String {
        escape(&self.0)
    }

    fn with_child(&self, child: ViewNode) -> ViewNode {
        child
    }
}

pub fn text(s: impl Into<String>) -> ViewNode {
    ViewNode::new(Text(s.into()))
}

/// An HTML element. `with_child` replaces its children with the given node.
#[derive(Debug, Clone, Default)]
pub struct Element {
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<ViewNode>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), ..Self::default() }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    pub fn child(mut self, child: impl Into<ViewNode>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn node(self) -> ViewNode {
        ViewNode::new(self)
    }
}

impl From<Element> for ViewNode {
    fn from(e: Element) -> Self {
        e.node()
    }
}

impl View for Element {
    fn to_html(&self) -> String {
        let mut out = format!("<{}", self.tag);
        for (name, value) in &self.attrs {
            out.push_str(&format!(" {name}=\"{}\"", escape(value)));
        }
        out.push('>');
        for child in &self.children {
            out.push_str(&child.to_html());
        }
        out.push_str(&format!("</{}>", self.tag));
        out
    }

    fn with_child(&self, child: ViewNode) -> ViewNode {
        Self { children: vec![child], ..self.clone() }.node()
    }
}

pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
