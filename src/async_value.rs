//! Read-side view over a resource cache entry.
//!
//! An [`AsyncValue`] is derived from a cache entry on every read and never
//! stored. It answers the questions a view asks about remote data:
//!
//! | Variant | `value()` | `is_loading()` | `error()` |
//! |---|---|---|---|
//! | `Loading` | `None` | yes | `None` |
//! | `Present` | `Some` | while reloading | a failed reload |
//! | `Failed` | `None` | no | the fetch error |
//! | `Deleted` | `None` | no | `None` |

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;
use crate::stream::{DataStream, Item};

/// The kind of mutation pending on a present value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    Updating,
    Deleting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Present<T> {
    /// The confirmed value.
    pub value: T,
    /// The value with the pending mutation applied.
    pub optimistic: T,
    pub mutation: Option<MutationType>,
    pub reloading: bool,
    pub error: Option<Error>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AsyncValue<T> {
    Loading,
    Present(Present<T>),
    Failed(Error),
    Deleted,
}

impl<T: Clone> AsyncValue<T> {
    pub fn of(value: T) -> Self {
        Self::Present(Present {
            optimistic: value.clone(),
            value,
            mutation: None,
            reloading: false,
            error: None,
        })
    }

    pub fn loading() -> Self {
        Self::Loading
    }

    pub fn failed(error: Error) -> Self {
        Self::Failed(error)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Present(p) => Some(&p.value),
            _ => None,
        }
    }

    pub fn optimistic_value(&self) -> Option<&T> {
        match self {
            Self::Present(p) => Some(&p.optimistic),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        match self {
            Self::Loading => true,
            Self::Present(p) => p.reloading,
            _ => false,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Present(p) => p.error.as_ref(),
            _ => None,
        }
    }

    pub fn mutation_type(&self) -> Option<MutationType> {
        match self {
            Self::Present(p) => p.mutation,
            _ => None,
        }
    }

    /// Transforms the value, keeping mutation and reload state.
    pub fn map<U>(self, f: impl Fn(T) -> U) -> AsyncValue<U> {
        match self {
            Self::Present(p) => AsyncValue::Present(Present {
                value: f(p.value),
                optimistic: f(p.optimistic),
                mutation: p.mutation,
                reloading: p.reloading,
                error: p.error,
            }),
            Self::Loading => AsyncValue::Loading,
            Self::Failed(e) => AsyncValue::Failed(e),
            Self::Deleted => AsyncValue::Deleted,
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> AsyncValue<U>) -> AsyncValue<U> {
        match self.into_present() {
            Ok(p) => f(p.value),
            Err(missing) => missing,
        }
    }

    /// A present value, substituting `default` when there is none.
    pub fn with_default(self, default: T) -> Self {
        self.with_default_fn(|_| default)
    }

    pub fn with_default_fn(self, f: impl FnOnce(&Self) -> T) -> Self {
        match self {
            Self::Present(_) => self,
            missing => Self::of(f(&missing)),
        }
    }

    pub fn get_with_default(self, default: T) -> T {
        match self {
            Self::Present(p) => p.value,
            _ => default,
        }
    }

    /// Splits off the present value, or the same missing state retyped.
    pub fn into_present<U>(self) -> Result<Present<T>, AsyncValue<U>> {
        match self {
            Self::Present(p) => Ok(p),
            Self::Loading => Err(AsyncValue::Loading),
            Self::Failed(e) => Err(AsyncValue::Failed(e)),
            Self::Deleted => Err(AsyncValue::Deleted),
        }
    }
}

impl<T: Item> AsyncValue<T> {
    /// The value as a one-shot stream. Loading and deleted values never
    /// emit; a failure becomes a stream error.
    pub fn to_stream(&self) -> DataStream<T> {
        match self {
            Self::Present(p) => DataStream::of(p.value.clone()),
            Self::Failed(e) => DataStream::error(e.clone()),
            Self::Loading | Self::Deleted => DataStream::never(),
        }
    }

    /// Present iff every input is present. Otherwise the first failure, or
    /// loading when nothing failed.
    ///
    /// A present input whose last reload failed still counts as present: only
    /// [`Failed`](Self::Failed) inputs make the aggregate fail. The reload
    /// error stays readable on the input itself.
    pub fn all(values: Vec<AsyncValue<T>>) -> AsyncValue<Vec<T>> {
        let mut present = Vec::with_capacity(values.len());
        let mut missing = false;
        for value in values {
            match value {
                Self::Present(p) => present.push(p.value),
                Self::Failed(e) => return AsyncValue::Failed(e),
                Self::Loading | Self::Deleted => missing = true,
            }
        }
        if missing { AsyncValue::Loading } else { AsyncValue::of(present) }
    }

    /// The present values of a stream, skipping every other state.
    pub fn wait_for(stream: &DataStream<AsyncValue<T>>) -> DataStream<T> {
        stream.flat_map(|v| match v {
            Self::Present(p) => DataStream::of(p.value),
            _ => DataStream::empty(),
        })
    }

    /// Collapses a stream of async streams into one, following the inner
    /// stream while the outer value is present.
    pub fn flatten_stream(
        stream: &DataStream<AsyncValue<DataStream<AsyncValue<T>>>>,
    ) -> DataStream<AsyncValue<T>> {
        stream.flat_map(|v| match v.into_present() {
            Ok(p) => p.value,
            Err(missing) => DataStream::of(missing),
        })
    }

    /// Follows a relationship from a parent value to a stream of children.
    pub fn get_child<P: Item>(
        parent: &DataStream<AsyncValue<P>>,
        f: impl Fn(P) -> DataStream<AsyncValue<T>> + Send + Sync + 'static,
    ) -> DataStream<AsyncValue<T>> {
        parent.flat_map(move |v| match v.into_present() {
            Ok(p) => f(p.value),
            Err(missing) => DataStream::of(missing),
        })
    }
}

impl AsyncValue<Value> {
    /// Deserializes the JSON payload. A payload that does not fit `U` turns
    /// the value into a failure.
    pub fn decode<U: DeserializeOwned + Clone>(self) -> AsyncValue<U> {
        match self.into_present() {
            Ok(p) => {
                let decoded = serde_json::from_value(p.value)
                    .and_then(|value| Ok((value, serde_json::from_value(p.optimistic)?)));
                match decoded {
                    Ok((value, optimistic)) => AsyncValue::Present(Present {
                        value,
                        optimistic,
                        mutation: p.mutation,
                        reloading: p.reloading,
                        error: p.error,
                    }),
                    Err(e) => AsyncValue::Failed(e.into()),
                }
            }
            Err(missing) => missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn all_prefers_errors_then_loading() {
        let e1 = Error::msg("e1");
        assert_eq!(AsyncValue::all(vec![AsyncValue::of("a"), AsyncValue::failed(e1.clone())]), AsyncValue::Failed(e1.clone()));
        assert_eq!(AsyncValue::all(vec![AsyncValue::failed(e1.clone()), AsyncValue::of("a")]), AsyncValue::Failed(e1));
        assert_eq!(AsyncValue::all(vec![AsyncValue::of("a"), AsyncValue::loading()]), AsyncValue::Loading);
        assert_eq!(AsyncValue::all(vec![AsyncValue::of("a"), AsyncValue::of("b")]), AsyncValue::of(vec!["a", "b"]));
    }

    #[test]
    fn all_counts_stale_values_as_present() {
        let stale = AsyncValue::Present(Present {
            value: "a",
            optimistic: "a",
            mutation: None,
            reloading: false,
            error: Some(Error::msg("reload failed")),
        });
        assert_eq!(AsyncValue::all(vec![stale.clone(), AsyncValue::of("b")]), AsyncValue::of(vec!["a", "b"]));
        assert_eq!(AsyncValue::all(vec![stale, AsyncValue::loading()]), AsyncValue::Loading);
    }

    #[test]
    fn defaults_fill_missing_values() {
        assert_eq!(AsyncValue::<i32>::loading().get_with_default(7), 7);
        assert_eq!(AsyncValue::of(1).get_with_default(7), 1);
        assert_eq!(AsyncValue::<i32>::Deleted.with_default(0).value(), Some(&0));
    }

    #[test]
    fn map_keeps_metadata() {
        let v = AsyncValue::Present(Present {
            value: 1,
            optimistic: 2,
            mutation: Some(MutationType::Updating),
            reloading: false,
            error: None,
        });
        let mapped = v.map(|x| x * 10);
        assert_eq!(mapped.value(), Some(&10));
        assert_eq!(mapped.optimistic_value(), Some(&20));
        assert_eq!(mapped.mutation_type(), Some(MutationType::Updating));
    }

    #[tokio::test]
    async fn wait_for_skips_missing_states() {
        let values = DataStream::from_iter([AsyncValue::loading(), AsyncValue::of(3), AsyncValue::Deleted]);
        assert_eq!(AsyncValue::wait_for(&values).collect().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn get_child_follows_present_parents() {
        let parents = DataStream::from_iter([AsyncValue::loading(), AsyncValue::of(2)]);
        let children = AsyncValue::get_child(&parents, |n: i32| DataStream::of(AsyncValue::of(n * 100)));
        assert_eq!(children.collect().await.unwrap(), vec![AsyncValue::Loading, AsyncValue::of(200)]);
    }

    #[test]
    fn decode_reports_shape_mismatch() {
        #[derive(Debug, Clone, PartialEq, Deserialize)]
        struct Greeting {
            salutation: String,
        }
        let ok = AsyncValue::of(serde_json::json!({"salutation": "hi"})).decode::<Greeting>();
        assert_eq!(ok.value().map(|g| g.salutation.as_str()), Some("hi"));
        let bad = AsyncValue::of(serde_json::json!(3)).decode::<Greeting>();
        assert!(matches!(bad, AsyncValue::Failed(Error::Decode(_))));
    }
}
