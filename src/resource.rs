//! Resource cache: keyed remote data with fetch dedupe and optimistic
//! mutation.
//!
//! All entries of all resources live in one [`ResourceStore`]. Each entry
//! (resource key + item key) moves through this state machine, driven only by
//! [`ResourceAction`]s:
//!
//! ```text
//!            fetch:start               fetch:complete
//!  (absent) ────────────▶ Loading ────────────────────▶ Loaded(v)
//!                            │                           │  ▲  │ fetch:start
//!               fetch:failed ▼      mutation:complete    │  │  ▼
//!                         Failed(e)   (put / patch) ◀────┘  │ Loaded(v, reloading)
//!                                                           │  │ fetch:complete / failed
//!  Loaded(v) ── mutation:start ──▶ Loaded(v, mutation m) ───┘  ▼
//!                                        │ mutation:failed ──▶ Loaded(v)    (rollback)
//!                                        │ mutation:complete(delete)
//!                                        ▼
//!                                     Deleted   (terminal)
//! ```
//!
//! A fetch failure is recorded in the entry and read back through
//! [`AsyncValue::error`]. A mutation failure is rolled back and logged.
//! Starting a mutation on an entry that is not loaded, already mutating, or
//! reloading is rejected with [`Error::Precondition`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{error, trace};

use crate::async_value::{AsyncValue, MutationType, Present};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::stream::{DataStream, Item};

pub type ResourceMap = BTreeMap<String, ResourceState>;

/// Every resource's entries, by resource key.
pub type CacheState = BTreeMap<String, Arc<ResourceMap>>;

pub type ResourceStore = Store<CacheState, ResourceAction>;

pub fn create_store() -> ResourceStore {
    Store::new(CacheState::new(), reduce)
}

// ── Entries ───────────────────────────────────────────────────────────────────

/// A local edit waiting for its remote effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Replaces the value.
    Put(Value),
    /// Shallow-merges the fields into an object value.
    Patch(Map<String, Value>),
    Delete,
}

impl Mutation {
    /// The value as it will be once the mutation is confirmed. Deleting
    /// leaves the value in place until the entry is removed.
    pub fn apply(&self, value: &Value) -> Value {
        match (self, value) {
            (Self::Put(v), _) => v.clone(),
            (Self::Patch(delta), Value::Object(fields)) => {
                let mut fields = fields.clone();
                fields.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(fields)
            }
            (Self::Patch(_), other) | (Self::Delete, other) => other.clone(),
        }
    }

    pub fn kind(&self) -> MutationType {
        match self {
            Self::Delete => MutationType::Deleting,
            Self::Put(_) | Self::Patch(_) => MutationType::Updating,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub value: Value,
    pub mutation: Option<Mutation>,
    pub reloading: bool,
    /// The error of the last failed reload.
    pub error: Option<Error>,
}

impl Loaded {
    fn new(value: Value) -> Self {
        Self { value, mutation: None, reloading: false, error: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceState {
    Loading,
    Loaded(Loaded),
    Failed(Error),
    Deleted,
}

impl ResourceState {
    pub fn to_async_value(&self) -> AsyncValue<Value> {
        match self {
            Self::Loading => AsyncValue::Loading,
            Self::Failed(e) => AsyncValue::Failed(e.clone()),
            Self::Deleted => AsyncValue::Deleted,
            Self::Loaded(l) => AsyncValue::Present(Present {
                value: l.value.clone(),
                optimistic: match &l.mutation {
                    Some(m) => m.apply(&l.value),
                    None => l.value.clone(),
                },
                mutation: l.mutation.as_ref().map(Mutation::kind),
                reloading: l.reloading,
                error: l.error.clone(),
            }),
        }
    }
}

/// The entry as an [`AsyncValue`]; an absent entry reads as loading.
fn entry_value(state: &CacheState, resource: &str, item: &str) -> AsyncValue<Value> {
    state
        .get(resource)
        .and_then(|entries| entries.get(item))
        .map_or(AsyncValue::Loading, ResourceState::to_async_value)
}

// ── Reducer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceAction {
    FetchStart { resource: String, keys: Vec<String> },
    FetchComplete { resource: String, payload: BTreeMap<String, Value> },
    FetchFailed { resource: String, keys: Vec<String>, error: Error },
    MutationStart { resource: String, payload: BTreeMap<String, Mutation> },
    MutationComplete { resource: String, payload: BTreeMap<String, Mutation> },
    MutationFailed { resource: String, keys: Vec<String>, error: Error },
}

impl ResourceAction {
    pub fn resource(&self) -> &str {
        match self {
            Self::FetchStart { resource, .. }
            | Self::FetchComplete { resource, .. }
            | Self::FetchFailed { resource, .. }
            | Self::MutationStart { resource, .. }
            | Self::MutationComplete { resource, .. }
            | Self::MutationFailed { resource, .. } => resource,
        }
    }
}

fn not_fetched(key: &str) -> Error {
    Error::Precondition(format!("Resource {key} must have been fetched before it is mutated"))
}

fn loaded<'a>(entries: &'a ResourceMap, key: &str) -> Result<&'a Loaded> {
    match entries.get(key) {
        Some(ResourceState::Loaded(l)) => Ok(l),
        _ => Err(not_fetched(key)),
    }
}

/// Applies one action to the cache. Only the addressed resource's entries
/// change; late fetch results for deleted entries are ignored.
pub fn reduce(state: &CacheState, action: &ResourceAction) -> Result<CacheState> {
    let resource = action.resource();
    let mut entries: ResourceMap = state.get(resource).map(|m| (**m).clone()).unwrap_or_default();

    match action {
        ResourceAction::FetchStart { keys, .. } => {
            for key in keys {
                let next = match entries.get(key) {
                    Some(ResourceState::Deleted) => continue,
                    Some(ResourceState::Loaded(l)) => {
                        ResourceState::Loaded(Loaded { reloading: true, ..l.clone() })
                    }
                    _ => ResourceState::Loading,
                };
                entries.insert(key.clone(), next);
            }
        }
        ResourceAction::FetchComplete { payload, .. } => {
            for (key, value) in payload {
                let next = match entries.get(key) {
                    Some(ResourceState::Deleted) => continue,
                    Some(ResourceState::Loaded(l)) => ResourceState::Loaded(Loaded {
                        value: value.clone(),
                        mutation: l.mutation.clone(),
                        reloading: false,
                        error: None,
                    }),
                    _ => ResourceState::Loaded(Loaded::new(value.clone())),
                };
                entries.insert(key.clone(), next);
            }
        }
        ResourceAction::FetchFailed { keys, error, .. } => {
            for key in keys {
                let next = match entries.get(key) {
                    Some(ResourceState::Deleted) => continue,
                    Some(ResourceState::Loaded(l)) => ResourceState::Loaded(Loaded {
                        reloading: false,
                        error: Some(error.clone()),
                        ..l.clone()
                    }),
                    _ => ResourceState::Failed(error.clone()),
                };
                entries.insert(key.clone(), next);
            }
        }
        ResourceAction::MutationStart { payload, .. } => {
            for (key, mutation) in payload {
                let current = loaded(&entries, key)?;
                if current.mutation.is_some() {
                    return Err(Error::Precondition(format!(
                        "Resource {key} already has a mutation pending"
                    )));
                }
                if current.reloading {
                    return Err(Error::Precondition(format!(
                        "Resource {key} cannot be mutated while it is being fetched"
                    )));
                }
                let next = Loaded { mutation: Some(mutation.clone()), ..current.clone() };
                entries.insert(key.clone(), ResourceState::Loaded(next));
            }
        }
        ResourceAction::MutationComplete { payload, .. } => {
            for (key, mutation) in payload {
                let current = loaded(&entries, key)?;
                if current.reloading {
                    return Err(Error::Precondition(format!(
                        "Resource {key} cannot be mutated while it is being fetched"
                    )));
                }
                let next = match mutation {
                    Mutation::Delete => ResourceState::Deleted,
                    m => ResourceState::Loaded(Loaded {
                        value: m.apply(&current.value),
                        mutation: None,
                        ..current.clone()
                    }),
                };
                entries.insert(key.clone(), next);
            }
        }
        ResourceAction::MutationFailed { keys, .. } => {
            for key in keys {
                if let Some(ResourceState::Loaded(l)) = entries.get(key) {
                    let next = Loaded { mutation: None, ..l.clone() };
                    entries.insert(key.clone(), ResourceState::Loaded(next));
                }
            }
        }
    }

    let mut next = state.clone();
    next.insert(resource.to_owned(), Arc::new(entries));
    Ok(next)
}

// ── Resource ──────────────────────────────────────────────────────────────────

type Fetcher = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A family of remote values sharing one fetch function, cached in a
/// [`ResourceStore`] under `key`.
///
/// ```rust,ignore
/// let users = Resource::new("users", store, move |id| {
///     let http = http.clone();
///     async move { http.get_json(&format!("https://api.example.com/users/{id}")).await }
/// });
///
/// let user = users.select("42");   // fetches on first subscribe
/// users.mutate("42", Mutation::Patch(delta), save(delta))?;
/// ```
#[derive(Clone)]
pub struct Resource {
    key: String,
    store: ResourceStore,
    fetcher: Fetcher,
}

impl Resource {
    pub fn new<F, Fut>(key: impl Into<String>, store: ResourceStore, fetch: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            key: key.into(),
            store,
            fetcher: Arc::new(move |item| Box::pin(fetch(item))),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entry(&self, item: &str) -> Option<ResourceState> {
        self.store.state().get(&self.key)?.get(item).cloned()
    }

    /// The item's value over time. The first subscriber triggers a fetch
    /// unless the item is already cached.
    pub fn select(&self, item: &str) -> DataStream<AsyncValue<Value>> {
        let (resource, key) = (self.key.clone(), item.to_owned());
        let (this, fetch_key) = (self.clone(), item.to_owned());
        self.store
            .select(move |state| entry_value(state, &resource, &key))
            .on_start(move || {
                let _ = this.fetch(&fetch_key, false);
            })
    }

    /// [`select`](Self::select), deserialized.
    pub fn select_as<T: Item + DeserializeOwned>(&self, item: &str) -> DataStream<AsyncValue<T>> {
        self.select(item).map(AsyncValue::decode)
    }

    pub fn select_many(&self, items: Vec<String>) -> DataStream<Vec<AsyncValue<Value>>> {
        let resource = self.key.clone();
        let (this, fetch_keys) = (self.clone(), items.clone());
        self.store
            .select(move |state| items.iter().map(|k| entry_value(state, &resource, k)).collect())
            .on_start(move || {
                for key in &fetch_keys {
                    let _ = this.fetch(key, false);
                }
            })
    }

    /// Fetches an item. Without `reload`, an item that already has an entry
    /// is left alone. Deleted items and items with a pending mutation are
    /// never refetched.
    ///
    /// The fetch starts immediately; the returned future resolves once its
    /// result is in the cache.
    pub fn fetch(&self, item: &str, reload: bool) -> BoxFuture<'static, ()> {
        match self.entry(item) {
            Some(ResourceState::Deleted) => {
                trace!(resource = %self.key, item, "deleted, fetch skipped");
                return Box::pin(async {});
            }
            Some(ResourceState::Loaded(l)) if l.mutation.is_some() => {
                trace!(resource = %self.key, item, "mutation pending, fetch skipped");
                return Box::pin(async {});
            }
            Some(_) if !reload => {
                trace!(resource = %self.key, item, "already fetched");
                return Box::pin(async {});
            }
            _ => {}
        }

        let runtime = match effect_runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(resource = %self.key, item, error = %e, "fetch skipped");
                return Box::pin(async {});
            }
        };
        let start = ResourceAction::FetchStart { resource: self.key.clone(), keys: vec![item.to_owned()] };
        if let Err(e) = self.store.dispatch(start) {
            error!(resource = %self.key, item, error = %e, "fetch rejected");
            return Box::pin(async {});
        }

        let (store, resource, key) = (self.store.clone(), self.key.clone(), item.to_owned());
        let fetched = (self.fetcher)(key.clone());
        spawn_effect(&runtime, async move {
            let action = match fetched.await {
                Ok(value) => ResourceAction::FetchComplete {
                    resource,
                    payload: BTreeMap::from([(key, value)]),
                },
                Err(error) => ResourceAction::FetchFailed { resource, keys: vec![key], error },
            };
            if let Err(e) = store.dispatch(action) {
                error!(error = %e, "could not record fetch result");
            }
        })
    }

    /// Applies `mutation` optimistically and runs `effect`. On success the
    /// mutation is confirmed; on failure it is rolled back and logged.
    ///
    /// Fails immediately if the item is not loaded, is reloading, or already
    /// has a mutation pending, and outside a tokio runtime.
    pub fn mutate<Fut, R>(&self, item: &str, mutation: Mutation, effect: Fut) -> Result<BoxFuture<'static, ()>>
    where
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.mutate_many(BTreeMap::from([(item.to_owned(), mutation)]), effect)
    }

    pub fn mutate_many<Fut, R>(
        &self,
        mutations: BTreeMap<String, Mutation>,
        effect: Fut,
    ) -> Result<BoxFuture<'static, ()>>
    where
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let runtime = effect_runtime()?;
        self.store.dispatch(ResourceAction::MutationStart {
            resource: self.key.clone(),
            payload: mutations.clone(),
        })?;

        let (store, resource) = (self.store.clone(), self.key.clone());
        Ok(spawn_effect(&runtime, async move {
            let action = match effect.await {
                Ok(_) => ResourceAction::MutationComplete { resource, payload: mutations },
                Err(error) => {
                    let keys: Vec<String> = mutations.into_keys().collect();
                    error!(%resource, ?keys, %error, "mutation failed, rolled back");
                    ResourceAction::MutationFailed { resource, keys, error }
                }
            };
            if let Err(e) = store.dispatch(action) {
                error!(error = %e, "could not settle mutation");
            }
        }))
    }

    /// A query over this resource, cached under `{key}:query:{name}`.
    ///
    /// `handler` resolves a query to the keys of matching items. It may put
    /// item values it already has into the cache with the [`QueryUpdate`].
    pub fn query<Q, F, Fut>(&self, name: &str, handler: F) -> ResourceQuery<Q>
    where
        Q: Send + 'static,
        F: Fn(Q, QueryUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<String>>> + Send + 'static,
    {
        let update = QueryUpdate { resource: self.clone() };
        ResourceQuery {
            key: format!("{}:query:{name}", self.key),
            resource: self.clone(),
            handler: Arc::new(move |q| Box::pin(handler(q, update.clone()))),
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource").field("key", &self.key).finish()
    }
}

/// Lets a query handler cache the items it loaded alongside their keys.
#[derive(Clone)]
pub struct QueryUpdate {
    resource: Resource,
}

impl QueryUpdate {
    pub fn update(&self, values: BTreeMap<String, Value>) -> Result<()> {
        self.resource.store.dispatch(ResourceAction::FetchComplete {
            resource: self.resource.key.clone(),
            payload: values,
        })
    }
}

// ── Queries ───────────────────────────────────────────────────────────────────

type QueryHandler<Q> = Arc<dyn Fn(Q) -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync>;

/// A cached list of item keys per query key.
pub struct ResourceQuery<Q> {
    key: String,
    resource: Resource,
    handler: QueryHandler<Q>,
}

impl<Q> Clone for ResourceQuery<Q> {
    fn clone(&self) -> Self {
        Self { key: self.key.clone(), resource: self.resource.clone(), handler: Arc::clone(&self.handler) }
    }
}

impl<Q: Send + 'static> ResourceQuery<Q> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Runs the query and stores its result under `key`.
    pub fn set_query(&self, key: &str, q: Q) -> BoxFuture<'static, ()> {
        let runtime = match effect_runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(query = %self.key, error = %e, "query skipped");
                return Box::pin(async {});
            }
        };
        let store = self.resource.store.clone();
        let start = ResourceAction::FetchStart { resource: self.key.clone(), keys: vec![key.to_owned()] };
        if let Err(e) = store.dispatch(start) {
            error!(query = %self.key, error = %e, "query rejected");
            return Box::pin(async {});
        }

        let (resource, item) = (self.key.clone(), key.to_owned());
        let results = (self.handler)(q);
        spawn_effect(&runtime, async move {
            let action = match results.await {
                Ok(keys) => ResourceAction::FetchComplete {
                    resource,
                    payload: BTreeMap::from([(item, Value::from(keys))]),
                },
                Err(error) => ResourceAction::FetchFailed { resource, keys: vec![item], error },
            };
            if let Err(e) = store.dispatch(action) {
                error!(error = %e, "could not record query result");
            }
        })
    }

    /// The query's items. Present once the query itself has resolved; each
    /// item then loads on its own.
    pub fn select(&self, key: &str) -> DataStream<AsyncValue<Vec<AsyncValue<Value>>>> {
        let (query, item) = (self.key.clone(), key.to_owned());
        let resource = self.resource.clone();
        self.resource
            .store
            .select(move |state| entry_value(state, &query, &item))
            .flat_map(move |result| match result.into_present() {
                Ok(p) => {
                    let keys = p
                        .value
                        .as_array()
                        .map(|keys| keys.iter().filter_map(|k| k.as_str().map(str::to_owned)).collect())
                        .unwrap_or_default();
                    resource.select_many(keys).map(AsyncValue::of)
                }
                Err(missing) => DataStream::of(missing),
            })
    }

    /// Present once the query and every item it names are present.
    pub fn select_all(&self, key: &str) -> DataStream<AsyncValue<Vec<Value>>> {
        self.select(key).map(|v| v.and_then(AsyncValue::all))
    }
}

/// The runtime cache effects run on. Checked before anything is dispatched,
/// so an entry is never left waiting for an effect that cannot run.
fn effect_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|_| Error::msg("resource effects need a tokio runtime"))
}

/// Spawns a cache effect. The returned future resolves when the effect is
/// done; dropping it does not cancel the effect.
fn spawn_effect(runtime: &Handle, effect: impl Future<Output = ()> + Send + 'static) -> BoxFuture<'static, ()> {
    let task = runtime.spawn(effect);
    Box::pin(async move {
        let _ = task.await;
    })
}
