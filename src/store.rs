//! Reducer-driven state container.
//!
//! A [`Store`] holds one state value and changes it only through
//! [`Store::dispatch`], which runs the reducer and publishes the new state.
//! A reducer returning `Err` rejects the action: the state is left as it
//! was and the error is returned to the dispatcher.
//!
//! Dispatches are serialized: reducing and publishing happen within one turn
//! per store, so listeners see states in the order they were reduced. A
//! dispatch made by a listener while its own thread holds the turn is queued
//! and runs right after the current one; its rejection is logged.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, error};

use crate::error::Result;
use crate::stream::{DataStream, Item, Producer, Sink, lock};

type Reducer<S, A> = dyn Fn(&S, &A) -> Result<S> + Send + Sync;

pub struct Store<S, A> {
    inner: Arc<Inner<S, A>>,
    stream: DataStream<S>,
}

struct Inner<S, A> {
    state: Mutex<S>,
    reducer: Box<Reducer<S, A>>,
    sink: Mutex<Option<Sink<S>>>,
    turn: Mutex<Turn<A>>,
    released: Condvar,
}

/// Who is dispatching, and what they were asked to dispatch meanwhile.
struct Turn<A> {
    owner: Option<ThreadId>,
    queued: VecDeque<A>,
}

impl<S, A> Clone for Store<S, A> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), stream: self.stream.clone() }
    }
}

impl<S: Item, A: fmt::Debug + Send + Sync + 'static> Store<S, A> {
    pub fn new(initial: S, reducer: impl Fn(&S, &A) -> Result<S> + Send + Sync + 'static) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(initial),
            reducer: Box::new(reducer),
            sink: Mutex::new(None),
            turn: Mutex::new(Turn { owner: None, queued: VecDeque::new() }),
            released: Condvar::new(),
        });
        let stream = DataStream::create(Publish(Arc::clone(&inner)));
        Self { inner, stream }
    }

    pub fn dispatch(&self, action: A) -> Result<()> {
        debug!(?action, "dispatch");
        let Some(_turn) = self.inner.take_turn(Some(action)) else {
            return Ok(());
        };
        let action = self.inner.pop_first();
        match action {
            Some(action) => self.inner.apply(&action),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> S {
        lock(&self.inner.state).clone()
    }

    /// The current state, then every change.
    pub fn stream(&self) -> DataStream<S> {
        self.stream.clone()
    }

    /// A projection of the state, emitted whenever it changes.
    pub fn select<C: Item>(&self, f: impl Fn(&S) -> C + Send + Sync + 'static) -> DataStream<C> {
        self.stream.map(move |s| f(&s))
    }
}

impl<S: Item, A: fmt::Debug + Send + Sync + 'static> Inner<S, A> {
    /// Waits until no other thread is dispatching and takes the turn.
    ///
    /// When this thread already holds it, `action` is queued and `None` is
    /// returned. Otherwise `action` is put first in line for the new turn.
    fn take_turn(&self, action: Option<A>) -> Option<TurnGuard<'_, S, A>> {
        let me = thread::current().id();
        let mut turn = lock(&self.turn);
        if turn.owner == Some(me) {
            turn.queued.extend(action);
            return None;
        }
        while turn.owner.is_some() {
            turn = self.released.wait(turn).unwrap_or_else(PoisonError::into_inner);
        }
        turn.owner = Some(me);
        if let Some(action) = action {
            turn.queued.push_front(action);
        }
        Some(TurnGuard(self))
    }

    fn pop_first(&self) -> Option<A> {
        lock(&self.turn).queued.pop_front()
    }

    fn apply(&self, action: &A) -> Result<()> {
        let next = {
            let mut state = lock(&self.state);
            let next = (self.reducer)(&state, action)?;
            *state = next.clone();
            next
        };
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink.next(next);
        }
        Ok(())
    }

    /// Runs the actions queued during this turn, then hands the turn over.
    fn finish_turn(&self) {
        loop {
            let next = {
                let mut turn = lock(&self.turn);
                match turn.queued.pop_front() {
                    Some(action) => action,
                    None => {
                        turn.owner = None;
                        self.released.notify_one();
                        return;
                    }
                }
            };
            if let Err(e) = self.apply(&next) {
                error!(action = ?next, error = %e, "queued action rejected");
            }
        }
    }
}

struct TurnGuard<'a, S: Item, A: fmt::Debug + Send + Sync + 'static>(&'a Inner<S, A>);

impl<S: Item, A: fmt::Debug + Send + Sync + 'static> Drop for TurnGuard<'_, S, A> {
    fn drop(&mut self) {
        self.0.finish_turn();
    }
}

impl<S, A> PartialEq for Store<S, A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<S, A> fmt::Debug for Store<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Store { .. }")
    }
}

/// Publishes the state: the current one on start, then each dispatch.
struct Publish<S, A>(Arc<Inner<S, A>>);

impl<S: Item, A: fmt::Debug + Send + Sync + 'static> Producer<S> for Publish<S, A> {
    fn start(&self, sink: Sink<S>) {
        // No dispatch may publish between the read and the emit.
        let _turn = self.0.take_turn(None);
        *lock(&self.0.sink) = Some(sink.clone());
        let current = lock(&self.0.state).clone();
        sink.next(current);
    }

    fn stop(&self) {
        *lock(&self.0.sink) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    enum Counter {
        Add(i32),
        Fail,
    }

    fn counter() -> Store<i32, Counter> {
        Store::new(0, |n, action| match action {
            Counter::Add(k) => Ok(n + k),
            Counter::Fail => Err(Error::Precondition("nope".into())),
        })
    }

    #[tokio::test]
    async fn select_follows_dispatches() {
        let store = counter();
        let doubled = store.select(|n| n * 2).take(3).collect();
        store.dispatch(Counter::Add(1)).unwrap();
        store.dispatch(Counter::Add(2)).unwrap();
        assert_eq!(doubled.await.unwrap(), vec![0, 2, 6]);
    }

    #[test]
    fn rejected_actions_leave_state_alone() {
        let store = counter();
        store.dispatch(Counter::Add(5)).unwrap();
        assert!(store.dispatch(Counter::Fail).is_err());
        assert_eq!(store.state(), 5);
    }

    #[test]
    fn concurrent_dispatches_publish_in_order() {
        let store = counter();
        let regressions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(0));
        let (counted, last) = (Arc::clone(&regressions), Arc::clone(&seen));
        let _sub = store.stream().for_each(move |n| {
            let mut last = lock(&last);
            if n < *last {
                counted.fetch_add(1, Ordering::SeqCst);
            }
            *last = n;
        });

        thread::scope(|scope| {
            for _ in 0..4 {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..5_000 {
                        store.dispatch(Counter::Add(1)).unwrap();
                    }
                });
            }
        });

        assert_eq!(regressions.load(Ordering::SeqCst), 0);
        assert_eq!(store.state(), 20_000);
        assert_eq!(*lock(&seen), 20_000);
    }

    #[test]
    fn listeners_may_dispatch() {
        let store = counter();
        let inner = store.clone();
        let _sub = store.stream().for_each(move |n| {
            if n == 1 {
                inner.dispatch(Counter::Add(10)).unwrap();
            }
        });
        store.dispatch(Counter::Add(1)).unwrap();
        assert_eq!(store.state(), 11);
    }

    #[tokio::test]
    async fn resubscribing_sees_current_state() {
        let store = counter();
        store.dispatch(Counter::Add(3)).unwrap();
        assert_eq!(store.stream().first().await.unwrap(), 3);
        store.dispatch(Counter::Add(1)).unwrap();
        assert_eq!(store.stream().first().await.unwrap(), 4);
    }
}
