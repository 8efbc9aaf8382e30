//! The cookie capability.
//!
//! Only the auth extension uses cookies, to keep a refresh token across
//! sessions. The server seeds a [`MemoryCookies`] from the request's
//! `Cookie` header and turns the changes recorded during rendering into
//! `Set-Cookie` headers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::stream::lock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub max_age: Option<Duration>,
    pub http_only: bool,
    pub secure: bool,
}

impl CookieOptions {
    fn attributes(&self) -> String {
        let mut out = String::new();
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age.as_secs()));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        out
    }
}

pub trait CookieStore: Send + Sync + 'static {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str, options: CookieOptions);
    fn delete(&self, name: &str);
}

pub type SharedCookies = Arc<dyn CookieStore>;

/// An in-memory jar that remembers every change as a `Set-Cookie` value.
#[derive(Debug, Default)]
pub struct MemoryCookies {
    jar: Mutex<BTreeMap<String, String>>,
    changes: Mutex<Vec<String>>,
}

impl MemoryCookies {
    pub fn new() -> Self {
        Self::default()
    }

    /// A jar holding the cookies of a `Cookie` request header.
    pub fn from_header(header: &str) -> Self {
        let jar = header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
            .collect();
        Self { jar: Mutex::new(jar), changes: Mutex::default() }
    }

    /// `Set-Cookie` values for every change since the jar was created.
    pub fn changes(&self) -> Vec<String> {
        lock(&self.changes).clone()
    }
}

impl CookieStore for MemoryCookies {
    fn get(&self, name: &str) -> Option<String> {
        lock(&self.jar).get(name).cloned()
    }

    fn set(&self, name: &str, value: &str, options: CookieOptions) {
        lock(&self.jar).insert(name.to_owned(), value.to_owned());
        lock(&self.changes).push(format!("{name}={value}{}", options.attributes()));
    }

    fn delete(&self, name: &str) {
        lock(&self.jar).remove(name);
        lock(&self.changes).push(format!("{name}=; Max-Age=0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_header() {
        let jar = MemoryCookies::from_header("a=1; refresh_token=xyz ;broken");
        assert_eq!(jar.get("a").as_deref(), Some("1"));
        assert_eq!(jar.get("refresh_token").as_deref(), Some("xyz"));
        assert_eq!(jar.get("broken"), None);
        assert!(jar.changes().is_empty());
    }

    #[test]
    fn records_changes() {
        let jar = MemoryCookies::new();
        let opts = CookieOptions { path: Some("/".into()), http_only: true, ..CookieOptions::default() };
        jar.set("t", "v", opts);
        jar.delete("t");
        assert_eq!(jar.get("t"), None);
        assert_eq!(jar.changes(), vec!["t=v; Path=/; HttpOnly", "t=; Max-Age=0"]);
    }
}
