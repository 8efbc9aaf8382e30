use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use weft::async_value::{MutationType, Present};
use weft::resource::{ResourceState, create_store};
use weft::{AsyncValue, Error, Mutation, Resource};

/// A resource whose items are `{"id": key}`, counting fetches.
fn counted() -> (Resource, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let resource = Resource::new("items", create_store(), move |key| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!({ "id": key })) }
    });
    (resource, calls)
}

fn failing() -> Resource {
    Resource::new("items", create_store(), |_| async { Err(Error::msg("backend down")) })
}

#[tokio::test]
async fn select_fetches_on_first_subscribe() {
    let (items, calls) = counted();
    let values = items.select("a").take(2).collect().await.unwrap();
    assert_eq!(values, vec![AsyncValue::Loading, AsyncValue::of(json!({"id": "a"}))]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetches_are_deduplicated_unless_reloading() {
    let (items, calls) = counted();
    items.fetch("a", false).await;
    items.fetch("a", false).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    items.fetch("a", true).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetches_in_flight_are_shared() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let items = Resource::new("items", create_store(), move |key| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!(key))
        }
    });

    let first = items.fetch("a", false);
    let second = items.fetch("a", false);
    assert_eq!(items.entry("a"), Some(ResourceState::Loading));
    tokio::join!(first, second);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(items.select("a").first().await.unwrap(), AsyncValue::of(json!("a")));
}

#[tokio::test]
async fn failed_fetch_is_visible() {
    let items = failing();
    let values = items.select("a").take(2).collect().await.unwrap();
    assert_eq!(values, vec![AsyncValue::Loading, AsyncValue::Failed(Error::msg("backend down"))]);
}

#[tokio::test]
async fn mutating_before_fetching_is_rejected() {
    let (items, _) = counted();
    let result = items.mutate("a", Mutation::Put(json!(1)), async { Ok::<_, Error>(()) });
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn second_pending_mutation_is_rejected() {
    let (items, _) = counted();
    items.fetch("a", false).await;
    let slow = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, Error>(())
    };
    let first = items.mutate("a", Mutation::Put(json!(1)), slow).unwrap();
    let second = items.mutate("a", Mutation::Put(json!(2)), async { Ok::<_, Error>(()) });
    assert!(matches!(second, Err(Error::Precondition(_))));
    first.await;
    assert_eq!(items.select("a").first().await.unwrap(), AsyncValue::of(json!(1)));
}

#[tokio::test]
async fn failed_mutation_rolls_back() {
    let (items, _) = counted();
    items.fetch("x", false).await;
    let original = json!({"id": "x"});

    let history = items.select("x").take(3).collect();
    let mut delta = serde_json::Map::new();
    delta.insert("a".into(), json!(2));
    let effect = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<(), _>(Error::msg("rejected"))
    };
    items.mutate("x", Mutation::Patch(delta), effect).unwrap().await;

    let pending = AsyncValue::Present(Present {
        value: original.clone(),
        optimistic: json!({"id": "x", "a": 2}),
        mutation: Some(MutationType::Updating),
        reloading: false,
        error: None,
    });
    assert_eq!(
        history.await.unwrap(),
        vec![AsyncValue::of(original.clone()), pending, AsyncValue::of(original)]
    );
}

#[tokio::test]
async fn confirmed_patch_updates_the_value() {
    let (items, _) = counted();
    items.fetch("x", false).await;
    let mut delta = serde_json::Map::new();
    delta.insert("name".into(), json!("ann"));
    items.mutate("x", Mutation::Patch(delta), async { Ok::<_, Error>(()) }).unwrap().await;
    assert_eq!(items.select("x").first().await.unwrap(), AsyncValue::of(json!({"id": "x", "name": "ann"})));
}

#[tokio::test]
async fn deleted_items_stay_deleted() {
    let (items, calls) = counted();
    items.fetch("a", false).await;
    items.mutate("a", Mutation::Delete, async { Ok::<_, Error>(()) }).unwrap().await;
    assert_eq!(items.entry("a"), Some(ResourceState::Deleted));

    items.fetch("a", true).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(items.select("a").first().await.unwrap(), AsyncValue::Deleted);
}

#[tokio::test]
async fn reload_errors_keep_the_value() {
    let healthy = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&healthy);
    let items = Resource::new("items", create_store(), move |_| {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 { Ok(json!("v1")) } else { Err(Error::msg("flaky")) }
        }
    });
    items.fetch("a", false).await;
    items.fetch("a", true).await;

    let value = items.select("a").first().await.unwrap();
    assert_eq!(value.value(), Some(&json!("v1")));
    assert_eq!(value.error(), Some(&Error::msg("flaky")));
}

#[tokio::test]
async fn query_resolves_to_its_items() {
    let (items, calls) = counted();
    let by_team = items.query("by_team", |team: String, update| async move {
        let keys = vec![format!("{team}-1"), format!("{team}-2")];
        let values: BTreeMap<String, Value> = keys.iter().map(|k| (k.clone(), json!({ "id": k }))).collect();
        update.update(values)?;
        Ok(keys)
    });
    assert_eq!(by_team.key(), "items:query:by_team");

    by_team.set_query("red", "red".to_owned()).await;
    let all = by_team.select_all("red").first().await.unwrap();
    assert_eq!(all, AsyncValue::of(vec![json!({"id": "red-1"}), json!({"id": "red-2"})]));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unresolved_query_is_loading() {
    let (items, _) = counted();
    let by_team = items.query("by_team", |_: String, _| async { Ok(Vec::new()) });
    let first = by_team.select("blue").first().await.unwrap();
    assert!(first.is_loading());
}
