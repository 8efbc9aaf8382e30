//! Typed, persistent request context.
//!
//! Every middleware receives a [`Context`] and may hand an enriched one to
//! the rest of the chain. Contexts are immutable: [`Context::with`] returns a
//! new context sharing nothing mutable with the old one, so a route can
//! branch from a shared base without its siblings seeing its additions.
//!
//! Values are addressed by typed [`Key`]s:
//!
//! ```rust
//! use weft::context::{Context, Key};
//!
//! const GREETING: Key<String> = Key::new("greeting");
//!
//! let ctx = Context::new().with(GREETING, "hello".to_string());
//! assert_eq!(ctx.get(GREETING).as_deref(), Some("hello"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::Config;
use crate::cookies::SharedCookies;
use crate::error::{Error, Result};
use crate::http::SharedClient;
use crate::resource::ResourceStore;
use crate::transition::{Transition, TransitionBus};

/// A typed slot in a [`Context`].
pub struct Key<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _type: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.name)
    }
}

/// Where the chain is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Client,
    Server,
}

// ── Well-known keys ───────────────────────────────────────────────────────────

/// The transition being handled.
pub const LOCATION: Key<Transition> = Key::new("location");
pub const ENVIRONMENT: Key<Environment> = Key::new("environment");
pub const STORE: Key<ResourceStore> = Key::new("store");
pub const HTTP: Key<SharedClient> = Key::new("http");
pub const COOKIES: Key<SharedCookies> = Key::new("cookies");
/// The navigation bus, present on the client.
pub const TRANSITIONS: Key<TransitionBus> = Key::new("transitions");
pub const CONFIG: Key<Config> = Key::new("config");

// ── Context ───────────────────────────────────────────────────────────────────

type Value = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct Context {
    values: Arc<HashMap<&'static str, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this context with `value` stored under `key`.
    pub fn with<T: Any + Send + Sync>(&self, key: Key<T>, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.name, Arc::new(value));
        Self { values: Arc::new(values) }
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self, key: Key<T>) -> Option<T> {
        self.values.get(key.name)?.downcast_ref::<T>().cloned()
    }

    /// Like [`get`](Self::get), failing with [`Error::MissingContext`].
    pub fn require<T: Any + Send + Sync + Clone>(&self, key: Key<T>) -> Result<T> {
        self.get(key).ok_or(Error::MissingContext(key.name))
    }

    pub fn contains<T>(&self, key: Key<T>) -> bool {
        self.values.contains_key(key.name)
    }

    /// Union of both contexts. Values in `other` win.
    pub fn merge(&self, other: &Context) -> Context {
        if other.values.is_empty() || Arc::ptr_eq(&self.values, &other.values) {
            return self.clone();
        }
        if self.values.is_empty() {
            return other.clone();
        }
        let mut values = (*self.values).clone();
        values.extend(other.values.iter().map(|(k, v)| (*k, Arc::clone(v))));
        Self { values: Arc::new(values) }
    }

    /// Names of every value, sorted.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.values.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn location(&self) -> Result<Transition> {
        self.require(LOCATION)
    }

    /// Defaults to [`Environment::Client`].
    pub fn environment(&self) -> Environment {
        self.get(ENVIRONMENT).unwrap_or(Environment::Client)
    }

    pub fn store(&self) -> Result<ResourceStore> {
        self.require(STORE)
    }

    pub fn http(&self) -> Result<SharedClient> {
        self.require(HTTP)
    }

    pub fn cookies(&self) -> Result<SharedCookies> {
        self.require(COOKIES)
    }

    pub fn transitions(&self) -> Result<TransitionBus> {
        self.require(TRANSITIONS)
    }

    pub fn config(&self) -> Config {
        self.get(CONFIG).unwrap_or_default()
    }

    /// Re-requests the current location, re-running its middleware.
    pub fn refresh(&self) -> Result<()> {
        let location = self.location()?;
        self.transitions()?.request(location);
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: Key<String> = Key::new("name");
    const COUNT: Key<u32> = Key::new("count");

    #[test]
    fn with_leaves_the_original_untouched() {
        let base = Context::new().with(COUNT, 1);
        let branch = base.with(NAME, "x".to_string());
        assert!(!base.contains(NAME));
        assert_eq!(branch.get(COUNT), Some(1));
    }

    #[test]
    fn merge_prefers_the_right_hand_side() {
        let left = Context::new().with(COUNT, 1).with(NAME, "left".to_string());
        let right = Context::new().with(COUNT, 2);
        let merged = left.merge(&right);
        assert_eq!(merged.get(COUNT), Some(2));
        assert_eq!(merged.get(NAME).as_deref(), Some("left"));
    }

    #[test]
    fn require_names_the_missing_key() {
        let err = Context::new().require(NAME).unwrap_err();
        assert!(matches!(err, Error::MissingContext("name")));
    }
}
