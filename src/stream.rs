//! Push-based reactive streams.
//!
//! A [`DataStream`] is a minimal observable with three properties every
//! consumer in weft relies on:
//!
//! - **Memory.** The latest value is remembered. A listener that attaches
//!   late receives it immediately, before anything else.
//! - **Duplicate suppression.** A value equal to the previous one (under the
//!   stream's [`Equality`] policy) is not re-emitted.
//! - **Laziness.** The [`Producer`] starts when the first listener attaches
//!   and stops when the last one detaches. Stopping forgets the remembered
//!   value unless the producer cannot emit it again, as with
//!   [`channel`](DataStream::channel) streams.
//!
//! Dispatch is synchronous: `Sink::next` calls every listener in order before
//! returning. No lock is held while a listener runs, so listeners may freely
//! subscribe, unsubscribe or emit. An event emitted into a stream that is
//! already delivering one is queued and delivered, in order, right after it.
//!
//! ```text
//! producer ── Sink::next ──▶ [memo + equality] ──▶ listener 1, listener 2, …
//! ```
//!
//! Errors and completion are terminal. A terminated stream keeps its final
//! value: late listeners receive it followed by the terminal event.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Values that can flow through a [`DataStream`].
pub trait Item: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> Item for T {}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Public traits ─────────────────────────────────────────────────────────────

/// Receives the events of a stream.
pub trait Listener<T>: Send + Sync + 'static {
    fn next(&self, value: T);
    fn error(&self, _err: Error) {}
    fn complete(&self) {}
}

/// The source of a stream's values.
///
/// `start` is called when the first listener attaches, `stop` when the last
/// one detaches or the stream terminates. A producer may be started again
/// after being stopped.
pub trait Producer<T>: Send + Sync + 'static {
    fn start(&self, sink: Sink<T>);
    fn stop(&self) {}

    /// Whether a restart emits the current value again. A stream whose
    /// producer cannot replay keeps its remembered value while stopped.
    fn replays(&self) -> bool {
        true
    }
}

/// How a stream decides that a value repeats the previous one.
pub enum Equality<T> {
    /// `PartialEq`.
    Value,
    /// Every value is emitted.
    Never,
    By(Arc<dyn Fn(&T, &T) -> bool + Send + Sync>),
}

impl<T: PartialEq> Equality<T> {
    fn same(&self, a: &T, b: &T) -> bool {
        match self {
            Self::Value => a == b,
            Self::Never => false,
            Self::By(f) => f(a, b),
        }
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value => Self::Value,
            Self::Never => Self::Never,
            Self::By(f) => Self::By(Arc::clone(f)),
        }
    }
}

// ── Shared stream state ───────────────────────────────────────────────────────

struct Shared<T> {
    state: Mutex<State<T>>,
    producer: Box<dyn Producer<T>>,
    equality: Equality<T>,
}

struct State<T> {
    last: Option<T>,
    listeners: Vec<(u64, Arc<dyn Listener<T>>)>,
    next_id: u64,
    running: bool,
    generation: u64,
    ended: Option<End>,
    emitting: bool,
    pending: VecDeque<(Option<u64>, Event<T>)>,
}

impl<T> State<T> {
    /// Whether a sink of `generation` may still write into this stream.
    fn accepts(&self, generation: Option<u64>) -> bool {
        if self.ended.is_some() {
            return false;
        }
        match generation {
            Some(g) => self.running && self.generation == g,
            None => true,
        }
    }
}

#[derive(Clone)]
enum End {
    Complete,
    Error(Error),
}

enum Event<T> {
    Next(T),
    End(End),
}

impl<T: Item> Shared<T> {
    /// Delivers `event`, or queues it behind the emission in progress.
    fn emit(&self, generation: Option<u64>, event: Event<T>) {
        {
            let mut state = lock(&self.state);
            if !state.accepts(generation) {
                return;
            }
            if state.emitting {
                state.pending.push_back((generation, event));
                return;
            }
            state.emitting = true;
        }

        let mut current = Some((generation, event));
        while let Some((generation, event)) = current.take() {
            self.deliver(generation, event);
            let mut state = lock(&self.state);
            current = state.pending.pop_front();
            if current.is_none() {
                state.emitting = false;
            }
        }
    }

    fn deliver(&self, generation: Option<u64>, event: Event<T>) {
        match event {
            Event::Next(value) => {
                let listeners: Vec<_> = {
                    let mut state = lock(&self.state);
                    if !state.accepts(generation) {
                        return;
                    }
                    if let Some(last) = &state.last {
                        if self.equality.same(last, &value) {
                            return;
                        }
                    }
                    state.last = Some(value.clone());
                    state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
                };
                for listener in listeners {
                    listener.next(value.clone());
                }
            }
            Event::End(end) => {
                let (listeners, was_running) = {
                    let mut state = lock(&self.state);
                    if !state.accepts(generation) {
                        return;
                    }
                    state.ended = Some(end.clone());
                    let was_running = state.running;
                    state.running = false;
                    (std::mem::take(&mut state.listeners), was_running)
                };
                for (_, listener) in listeners {
                    match &end {
                        End::Complete => listener.complete(),
                        End::Error(e) => listener.error(e.clone()),
                    }
                }
                if was_running {
                    self.producer.stop();
                }
            }
        }
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: Item> Detach for Shared<T> {
    fn detach(&self, id: u64) {
        let stop = {
            let mut state = lock(&self.state);
            state.listeners.retain(|(i, _)| *i != id);
            if state.listeners.is_empty() && state.running && state.ended.is_none() {
                state.running = false;
                if self.producer.replays() {
                    state.last = None;
                }
                true
            } else {
                false
            }
        };
        if stop {
            self.producer.stop();
        }
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// The write side of a stream, handed to its [`Producer`].
///
/// A sink only holds a weak reference: emitting into a stream nobody holds
/// any more is a no-op. Sinks handed to a producer belong to one run of it
/// and go quiet once that run is stopped.
pub struct Sink<T> {
    shared: Weak<Shared<T>>,
    generation: Option<u64>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self { shared: Weak::clone(&self.shared), generation: self.generation }
    }
}

impl<T: Item> Sink<T> {
    pub fn next(&self, value: T) {
        if let Some(shared) = self.shared.upgrade() {
            shared.emit(self.generation, Event::Next(value));
        }
    }

    pub fn error(&self, err: Error) {
        if let Some(shared) = self.shared.upgrade() {
            shared.emit(self.generation, Event::End(End::Error(err)));
        }
    }

    pub fn complete(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.emit(self.generation, Event::End(End::Complete));
        }
    }

    /// Whether emitting into this sink can still reach anyone.
    pub fn is_closed(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => !lock(&shared.state).accepts(self.generation),
            None => true,
        }
    }
}

// ── Subscription ──────────────────────────────────────────────────────────────

/// Handle returned by [`DataStream::subscribe`].
///
/// Dropping it does not detach the listener; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    target: Option<Weak<dyn Detach>>,
    id: u64,
}

impl Subscription {
    fn closed() -> Self {
        Self { target: None, id: 0 }
    }

    pub fn unsubscribe(self) {
        if let Some(target) = self.target.and_then(|w| w.upgrade()) {
            target.detach(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ── DataStream ────────────────────────────────────────────────────────────────

/// A memoized, duplicate-suppressing, push-based stream of values.
///
/// Cloning is cheap and yields a handle to the same stream. Two handles are
/// equal when they point at the same stream.
pub struct DataStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DataStream<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> PartialEq for DataStream<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> fmt::Debug for DataStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataStream { .. }")
    }
}

impl<T: Item> DataStream<T> {
    /// A stream driven by `producer`, suppressing repeats by value.
    pub fn create(producer: impl Producer<T>) -> Self {
        Self::create_with(producer, Equality::Value)
    }

    pub fn create_with(producer: impl Producer<T>, equality: Equality<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    last: None,
                    listeners: Vec::new(),
                    next_id: 0,
                    running: false,
                    generation: 0,
                    ended: None,
                    emitting: false,
                    pending: VecDeque::new(),
                }),
                producer: Box::new(producer),
                equality,
            }),
        }
    }

    /// A stream written to from the outside through the returned [`Sink`].
    ///
    /// Values sent before anyone listens are remembered like any other.
    pub fn channel() -> (Sink<T>, Self) {
        Self::channel_with(Equality::Value)
    }

    pub fn channel_with(equality: Equality<T>) -> (Sink<T>, Self) {
        let stream = Self::create_with(Idle, equality);
        let sink = Sink { shared: Arc::downgrade(&stream.shared), generation: None };
        (sink, stream)
    }

    pub fn of(value: T) -> Self {
        Self::from_iter(vec![value])
    }

    /// Emits every value in order, then completes.
    pub fn from_iter(values: impl IntoIterator<Item = T>) -> Self {
        Self::create(Values(values.into_iter().collect()))
    }

    /// Never emits and never terminates.
    pub fn never() -> Self {
        Self::create(Idle)
    }

    /// Completes without emitting.
    pub fn empty() -> Self {
        Self::create(Terminal(None))
    }

    pub fn error(err: Error) -> Self {
        Self::create(Terminal(Some(err)))
    }

    /// Emits the latest value of any input.
    ///
    /// Completes once every input has completed.
    pub fn merge(streams: Vec<DataStream<T>>) -> Self {
        if streams.is_empty() {
            return Self::empty();
        }
        Self::create(Merge { inputs: streams, link: Link::default() })
    }

    /// Emits the latest value of every input, as soon as each has emitted
    /// once and again whenever any of them emits.
    pub fn combine(streams: Vec<DataStream<T>>) -> DataStream<Vec<T>> {
        if streams.is_empty() {
            return DataStream::of(Vec::new());
        }
        DataStream::create(Combine { inputs: streams, link: Link::default() })
    }

    /// [`combine`](Self::combine) for two streams of different types.
    pub fn combine2<U: Item>(a: DataStream<T>, b: DataStream<U>) -> DataStream<(T, U)> {
        DataStream::create(Combine2 { a, b, link: Link::default() })
    }

    pub fn subscribe(&self, listener: impl Listener<T>) -> Subscription {
        let listener: Arc<dyn Listener<T>> = Arc::new(listener);
        let (replay, end, start) = {
            let mut state = lock(&self.shared.state);
            let id = state.next_id;
            state.next_id += 1;
            let replay = state.last.clone();
            match state.ended.clone() {
                Some(end) => (replay, Err(end), None),
                None => {
                    state.listeners.push((id, Arc::clone(&listener)));
                    let start = if state.running {
                        None
                    } else {
                        state.running = true;
                        state.generation += 1;
                        Some(state.generation)
                    };
                    (replay, Ok(id), start)
                }
            }
        };

        if let Some(value) = replay {
            listener.next(value);
        }
        let id = match end {
            Ok(id) => id,
            Err(End::Complete) => {
                listener.complete();
                return Subscription::closed();
            }
            Err(End::Error(e)) => {
                listener.error(e);
                return Subscription::closed();
            }
        };
        if let Some(generation) = start {
            let sink = Sink { shared: Arc::downgrade(&self.shared), generation: Some(generation) };
            self.shared.producer.start(sink);
        }

        let target: Arc<dyn Detach> = Arc::clone(&self.shared) as Arc<dyn Detach>;
        Subscription { target: Some(Arc::downgrade(&target)), id }
    }

    /// Subscribes a closure to the values of the stream, ignoring terminal events.
    pub fn for_each(&self, f: impl Fn(T) + Send + Sync + 'static) -> Subscription {
        self.subscribe(Callbacks::new(f))
    }

    /// The remembered value, if there is one.
    pub fn latest(&self) -> Option<T> {
        lock(&self.shared.state).last.clone()
    }

    /// Whether any listener is attached.
    pub fn is_observed(&self) -> bool {
        !lock(&self.shared.state).listeners.is_empty()
    }

    // ── Operators ─────────────────────────────────────────────────────────────

    pub fn map<U: Item>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> DataStream<U> {
        let f = Arc::new(f);
        self.operate(Equality::Value, move |_| {
            let f = Arc::clone(&f);
            Box::new(move |sink, x| sink.next(f(x)))
        })
    }

    pub fn filter(&self, pred: impl Fn(&T) -> bool + Send + Sync + 'static) -> DataStream<T> {
        let pred = Arc::new(pred);
        self.operate(Equality::Value, move |_| {
            let pred = Arc::clone(&pred);
            Box::new(move |sink, x| {
                if pred(&x) {
                    sink.next(x);
                }
            })
        })
    }

    /// Emits `seed`, then every accumulation of `f` over the input.
    pub fn fold<U: Item>(
        &self,
        f: impl Fn(&U, T) -> U + Send + Sync + 'static,
        seed: U,
    ) -> DataStream<U> {
        let f = Arc::new(f);
        self.operate(Equality::Value, move |sink| {
            sink.next(seed.clone());
            let acc = Mutex::new(seed.clone());
            let f = Arc::clone(&f);
            Box::new(move |sink, x| {
                let value = {
                    let mut acc = lock(&acc);
                    *acc = f(&acc, x);
                    acc.clone()
                };
                sink.next(value);
            })
        })
    }

    /// The first `count` values, then completion.
    pub fn take(&self, count: usize) -> DataStream<T> {
        if count == 0 {
            return Self::empty();
        }
        self.operate(Equality::Never, move |_| {
            let seen = AtomicUsize::new(0);
            Box::new(move |sink, x| {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= count {
                    sink.next(x);
                    if n == count {
                        sink.complete();
                    }
                }
            })
        })
    }

    /// Maps every value to a stream and follows the most recent one.
    pub fn flat_map<U: Item>(
        &self,
        f: impl Fn(T) -> DataStream<U> + Send + Sync + 'static,
    ) -> DataStream<U> {
        DataStream::create(FlatMap {
            outer: self.clone(),
            f: Arc::new(f),
            link: Link::default(),
            run: Mutex::new(None),
        })
    }

    /// Runs `hook` each time the stream starts, after it is connected to
    /// its input.
    pub fn on_start(&self, hook: impl Fn() + Send + Sync + 'static) -> DataStream<T> {
        DataStream::create_with(
            Operator {
                upstream: self.clone(),
                init: Box::new(|_: &Sink<T>| -> Step<T, T> { Box::new(|sink, x| sink.next(x)) }),
                after_start: Some(Box::new(hook)),
                link: Link::default(),
            },
            Equality::Never,
        )
    }

    /// The same values under a different duplicate-suppression policy.
    pub fn with_equality(&self, equality: Equality<T>) -> DataStream<T> {
        self.operate(equality, |_| Box::new(|sink, x| sink.next(x)))
    }

    pub fn compose<U>(self, f: impl FnOnce(DataStream<T>) -> U) -> U {
        f(self)
    }

    // ── Consumers ─────────────────────────────────────────────────────────────

    /// Resolves with every value once the stream completes, or with its error.
    ///
    /// The stream is subscribed immediately, not on first poll.
    pub fn collect(&self) -> BoxFuture<'static, Result<Vec<T>>> {
        let (tx, rx) = oneshot::channel::<Result<Vec<T>>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let values = Arc::new(Mutex::new(Vec::new()));

        let (on_value, on_error, on_complete) = (Arc::clone(&values), Arc::clone(&tx), tx);
        let listener = Callbacks::new(move |x| lock(&on_value).push(x))
            .on_error(move |e| {
                if let Some(tx) = lock(&on_error).take() {
                    let _ = tx.send(Err(e));
                }
            })
            .on_complete(move || {
                if let Some(tx) = lock(&on_complete).take() {
                    let _ = tx.send(Ok(std::mem::take(&mut *lock(&values))));
                }
            });

        let keep = self.clone();
        let _subscription = self.subscribe(listener);
        Box::pin(async move {
            let out = rx.await.unwrap_or(Err(Error::EmptyStream));
            drop(keep);
            out
        })
    }

    /// Resolves with the first value, or [`Error::EmptyStream`] if the stream
    /// completes without one.
    pub fn first(&self) -> BoxFuture<'static, Result<T>> {
        let values = self.take(1).collect();
        Box::pin(async move { values.await?.into_iter().next().ok_or(Error::EmptyStream) })
    }

    fn operate<U: Item>(
        &self,
        equality: Equality<U>,
        init: impl Fn(&Sink<U>) -> Step<T, U> + Send + Sync + 'static,
    ) -> DataStream<U> {
        DataStream::create_with(
            Operator {
                upstream: self.clone(),
                init: Box::new(init),
                after_start: None,
                link: Link::default(),
            },
            equality,
        )
    }
}

impl DataStream<u64> {
    /// Emits `0, 1, 2, …` every `period`, starting one period after the
    /// first listener attaches. Requires a tokio runtime.
    pub fn periodic(period: Duration) -> Self {
        Self::create(Periodic { period, task: Mutex::new(None) })
    }
}

// ── Listener helpers ──────────────────────────────────────────────────────────

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;

/// A [`Listener`] assembled from closures.
pub struct Callbacks<T> {
    next: Handler<T>,
    error: Handler<Error>,
    complete: Box<dyn Fn() + Send + Sync>,
}

impl<T: 'static> Callbacks<T> {
    pub fn new(next: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self { next: Box::new(next), error: Box::new(|_| {}), complete: Box::new(|| {}) }
    }

    pub fn on_error(mut self, f: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.error = Box::new(f);
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Box::new(f);
        self
    }
}

impl<T: 'static> Listener<T> for Callbacks<T> {
    fn next(&self, value: T) {
        (self.next)(value)
    }

    fn error(&self, err: Error) {
        (self.error)(err)
    }

    fn complete(&self) {
        (self.complete)()
    }
}

// ── Upstream bookkeeping ──────────────────────────────────────────────────────

/// Subscriptions an operator holds on its inputs for the current run.
///
/// An input may terminate the operator synchronously while it is still being
/// subscribed; `attach` then releases the subscription straight away.
#[derive(Default)]
struct Link {
    state: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    subs: Vec<Subscription>,
    stopped: bool,
}

impl Link {
    fn reset(&self) {
        lock(&self.state).stopped = false;
    }

    fn attach(&self, sub: Subscription) {
        let stale = {
            let mut state = lock(&self.state);
            if state.stopped {
                Some(sub)
            } else {
                state.subs.push(sub);
                None
            }
        };
        if let Some(sub) = stale {
            sub.unsubscribe();
        }
    }

    fn detach(&self) {
        let subs = {
            let mut state = lock(&self.state);
            state.stopped = true;
            std::mem::take(&mut state.subs)
        };
        for sub in subs {
            sub.unsubscribe();
        }
    }
}

// ── Producers ─────────────────────────────────────────────────────────────────

struct Idle;

impl<T: Item> Producer<T> for Idle {
    fn start(&self, _sink: Sink<T>) {}

    fn replays(&self) -> bool {
        false
    }
}

struct Values<T>(Vec<T>);

impl<T: Item> Producer<T> for Values<T> {
    fn start(&self, sink: Sink<T>) {
        for value in &self.0 {
            sink.next(value.clone());
        }
        sink.complete();
    }
}

struct Terminal(Option<Error>);

impl<T: Item> Producer<T> for Terminal {
    fn start(&self, sink: Sink<T>) {
        match &self.0 {
            Some(e) => sink.error(e.clone()),
            None => sink.complete(),
        }
    }
}

type Step<A, B> = Box<dyn Fn(&Sink<B>, A) + Send + Sync>;
type Init<A, B> = Box<dyn Fn(&Sink<B>) -> Step<A, B> + Send + Sync>;

/// One-input operator. `init` builds the per-run step function, so that
/// state such as fold accumulators and take counters restarts with the stream.
struct Operator<A, B> {
    upstream: DataStream<A>,
    init: Init<A, B>,
    after_start: Option<Box<dyn Fn() + Send + Sync>>,
    link: Link,
}

struct Forward<A, B> {
    sink: Sink<B>,
    step: Step<A, B>,
    _input: PhantomData<fn(A)>,
}

impl<A: Item, B: Item> Listener<A> for Forward<A, B> {
    fn next(&self, value: A) {
        (self.step)(&self.sink, value)
    }

    fn error(&self, err: Error) {
        self.sink.error(err)
    }

    fn complete(&self) {
        self.sink.complete()
    }
}

impl<A: Item, B: Item> Producer<B> for Operator<A, B> {
    fn start(&self, sink: Sink<B>) {
        self.link.reset();
        let step = (self.init)(&sink);
        let sub = self.upstream.subscribe(Forward { sink, step, _input: PhantomData });
        self.link.attach(sub);
        if let Some(hook) = &self.after_start {
            hook();
        }
    }

    fn stop(&self) {
        self.link.detach();
    }
}

struct Merge<T> {
    inputs: Vec<DataStream<T>>,
    link: Link,
}

impl<T: Item> Producer<T> for Merge<T> {
    fn start(&self, sink: Sink<T>) {
        self.link.reset();
        let remaining = Arc::new(AtomicUsize::new(self.inputs.len()));
        for input in &self.inputs {
            let (on_next, on_error, on_complete) = (sink.clone(), sink.clone(), sink.clone());
            let remaining = Arc::clone(&remaining);
            let listener = Callbacks::new(move |x| on_next.next(x))
                .on_error(move |e| on_error.error(e))
                .on_complete(move || {
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        on_complete.complete();
                    }
                });
            self.link.attach(input.subscribe(listener));
        }
    }

    fn stop(&self) {
        self.link.detach();
    }
}

struct Combine<T> {
    inputs: Vec<DataStream<T>>,
    link: Link,
}

impl<T: Item> Producer<Vec<T>> for Combine<T> {
    fn start(&self, sink: Sink<Vec<T>>) {
        self.link.reset();
        let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; self.inputs.len()]));
        let remaining = Arc::new(AtomicUsize::new(self.inputs.len()));

        for (i, input) in self.inputs.iter().enumerate() {
            let (on_next, on_error, on_complete) = (sink.clone(), sink.clone(), sink.clone());
            let slots = Arc::clone(&slots);
            let remaining = Arc::clone(&remaining);
            let listener = Callbacks::new(move |x| {
                let ready = {
                    let mut slots = lock(&slots);
                    slots[i] = Some(x);
                    slots.iter().cloned().collect::<Option<Vec<T>>>()
                };
                if let Some(values) = ready {
                    on_next.next(values);
                }
            })
            .on_error(move |e| on_error.error(e))
            .on_complete(move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    on_complete.complete();
                }
            });
            self.link.attach(input.subscribe(listener));
        }
    }

    fn stop(&self) {
        self.link.detach();
    }
}

struct Combine2<A, B> {
    a: DataStream<A>,
    b: DataStream<B>,
    link: Link,
}

impl<A: Item, B: Item> Producer<(A, B)> for Combine2<A, B> {
    fn start(&self, sink: Sink<(A, B)>) {
        self.link.reset();
        let slots: Arc<Mutex<(Option<A>, Option<B>)>> = Arc::new(Mutex::new((None, None)));
        let remaining = Arc::new(AtomicUsize::new(2));

        let emit = {
            let sink = sink.clone();
            let slots = Arc::clone(&slots);
            Arc::new(move || {
                let ready = match &*lock(&slots) {
                    (Some(a), Some(b)) => Some((a.clone(), b.clone())),
                    _ => None,
                };
                if let Some(pair) = ready {
                    sink.next(pair);
                }
            })
        };
        let finish = {
            let sink = sink.clone();
            Arc::new(move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    sink.complete();
                }
            })
        };

        let (slots_a, emit_a, finish_a, error_a) =
            (Arc::clone(&slots), Arc::clone(&emit), Arc::clone(&finish), sink.clone());
        let listener_a = Callbacks::new(move |x| {
            lock(&slots_a).0 = Some(x);
            emit_a();
        })
        .on_error(move |e| error_a.error(e))
        .on_complete(move || finish_a());
        self.link.attach(self.a.subscribe(listener_a));

        let error_b = sink;
        let listener_b = Callbacks::new(move |x| {
            lock(&slots).1 = Some(x);
            emit();
        })
        .on_error(move |e| error_b.error(e))
        .on_complete(move || finish());
        self.link.attach(self.b.subscribe(listener_b));
    }

    fn stop(&self) {
        self.link.detach();
    }
}

struct FlatMap<T, U> {
    outer: DataStream<T>,
    f: Arc<dyn Fn(T) -> DataStream<U> + Send + Sync>,
    link: Link,
    run: Mutex<Option<Arc<Mutex<Switch>>>>,
}

/// Bookkeeping for the inner stream currently followed by a [`FlatMap`].
#[derive(Default)]
struct Switch {
    epoch: u64,
    inner: Option<Subscription>,
    inner_active: bool,
    outer_done: bool,
}

impl<T: Item, U: Item> Producer<U> for FlatMap<T, U> {
    fn start(&self, sink: Sink<U>) {
        self.link.reset();
        let switch = Arc::new(Mutex::new(Switch::default()));
        *lock(&self.run) = Some(Arc::clone(&switch));

        let f = Arc::clone(&self.f);
        let (on_next, on_error, on_complete) = (sink.clone(), sink.clone(), sink);
        let (switch_next, switch_complete) = (Arc::clone(&switch), switch);

        let listener = Callbacks::new(move |x| {
            let inner = f(x);
            let (epoch, previous) = {
                let mut s = lock(&switch_next);
                s.epoch += 1;
                s.inner_active = true;
                (s.epoch, s.inner.take())
            };
            if let Some(previous) = previous {
                previous.unsubscribe();
            }

            let (inner_next, inner_error, inner_complete) =
                (on_next.clone(), on_next.clone(), on_next.clone());
            let (guard_next, guard_complete) = (Arc::clone(&switch_next), Arc::clone(&switch_next));
            let inner_listener = Callbacks::new(move |y| {
                if lock(&guard_next).epoch == epoch {
                    inner_next.next(y);
                }
            })
            .on_error(move |e| inner_error.error(e))
            .on_complete(move || {
                let finished = {
                    let mut s = lock(&guard_complete);
                    if s.epoch != epoch {
                        return;
                    }
                    s.inner_active = false;
                    s.outer_done
                };
                if finished {
                    inner_complete.complete();
                }
            });

            let sub = inner.subscribe(inner_listener);
            let stale = {
                let mut s = lock(&switch_next);
                if s.epoch == epoch && s.inner_active {
                    s.inner = Some(sub);
                    None
                } else {
                    Some(sub)
                }
            };
            if let Some(sub) = stale {
                sub.unsubscribe();
            }
        })
        .on_error(move |e| on_error.error(e))
        .on_complete(move || {
            let finished = {
                let mut s = lock(&switch_complete);
                s.outer_done = true;
                !s.inner_active
            };
            if finished {
                on_complete.complete();
            }
        });

        let sub = self.outer.subscribe(listener);
        self.link.attach(sub);
    }

    fn stop(&self) {
        self.link.detach();
        let Some(switch) = lock(&self.run).take() else { return };
        let inner = {
            let mut s = lock(&switch);
            s.epoch += 1;
            s.inner.take()
        };
        if let Some(inner) = inner {
            inner.unsubscribe();
        }
    }
}

struct Periodic {
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Producer<u64> for Periodic {
    fn start(&self, sink: Sink<u64>) {
        let period = self.period;
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticks = tokio::time::interval_at(start, period);
            let mut n = 0;
            loop {
                ticks.tick().await;
                if sink.is_closed() {
                    break;
                }
                sink.next(n);
                n += 1;
            }
        });
        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_repeats() {
        let values = DataStream::from_iter([1, 2, 3, 4]).map(|x| x.max(2));
        assert_eq!(values.collect().await.unwrap(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn never_equality_keeps_repeats() {
        let (sink, stream) = DataStream::channel_with(Equality::Never);
        let seen = stream.take(3).collect();
        sink.next("a");
        sink.next("a");
        sink.next("b");
        assert_eq!(seen.await.unwrap(), vec!["a", "a", "b"]);
    }

    #[test]
    fn late_listener_receives_latest_value() {
        let (sink, stream) = DataStream::channel();
        let first = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&first);
        let _sub = stream.for_each(move |x| lock(&log).push(x));
        sink.next(1);
        sink.next(2);

        let late = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&late);
        let _late = stream.for_each(move |x| lock(&log).push(x));

        assert_eq!(*lock(&first), vec![1, 2]);
        assert_eq!(*lock(&late), vec![2]);
    }

    #[tokio::test]
    async fn terminated_stream_replays_final_value() {
        let stream = DataStream::from_iter(["x", "y"]);
        assert_eq!(stream.collect().await.unwrap(), vec!["x", "y"]);
        assert_eq!(stream.collect().await.unwrap(), vec!["y"]);
    }

    #[tokio::test]
    async fn combine_waits_for_every_input() {
        let (a_sink, a) = DataStream::channel();
        let (b_sink, b) = DataStream::channel();
        let combined = DataStream::combine(vec![a, b]).take(2).collect();
        a_sink.next(1);
        a_sink.next(2);
        b_sink.next(10);
        a_sink.next(3);
        assert_eq!(combined.await.unwrap(), vec![vec![2, 10], vec![3, 10]]);
    }

    #[tokio::test]
    async fn combine2_joins_different_types() {
        let joined = DataStream::combine2(DataStream::of("title"), DataStream::of(7)).first();
        assert_eq!(joined.await.unwrap(), ("title", 7));
    }

    #[tokio::test]
    async fn merge_completes_when_all_inputs_complete() {
        let merged = DataStream::merge(vec![DataStream::of(1), DataStream::of(2)]);
        assert_eq!(merged.collect().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn fold_emits_seed_and_accumulations() {
        let sums = DataStream::from_iter([1, 2, 3]).fold(|acc, x| acc + x, 0);
        assert_eq!(sums.collect().await.unwrap(), vec![0, 1, 3, 6]);
    }

    #[tokio::test]
    async fn filter_and_take() {
        let evens = DataStream::from_iter(1..=10).filter(|x| x % 2 == 0).take(2);
        assert_eq!(evens.collect().await.unwrap(), vec![2, 4]);
    }

    #[tokio::test]
    async fn errors_reject_collect() {
        let failing = DataStream::<i32>::error(Error::msg("boom")).map(|x| x + 1);
        let err = failing.collect().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn first_of_empty_stream_fails() {
        let err = DataStream::<i32>::empty().first().await.unwrap_err();
        assert!(matches!(err, Error::EmptyStream));
    }

    #[tokio::test]
    async fn on_start_runs_only_when_subscribed() {
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);
        let stream = DataStream::from_iter([1, 2]).on_start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(called.load(Ordering::SeqCst), 0);
        stream.collect().await.unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flat_map_follows_latest_inner_stream() {
        let (outer_sink, outer) = DataStream::channel();
        let (inner_a, a) = DataStream::channel();
        let (inner_b, b) = DataStream::channel();
        let streams = [a, b];
        let followed = outer.flat_map(move |i: usize| streams[i].clone()).take(2).collect();

        outer_sink.next(0);
        inner_a.next("a1");
        outer_sink.next(1);
        inner_a.next("a2");
        inner_b.next("b1");

        assert_eq!(followed.await.unwrap(), vec!["a1", "b1"]);
    }

    #[test]
    fn unsubscribe_stops_producer_and_forgets_value() {
        let (sink, stream) = DataStream::channel();
        let mapped = stream.map(|x: i32| x * 10);
        let sub = mapped.for_each(|_| {});
        sink.next(1);
        assert_eq!(mapped.latest(), Some(10));
        sub.unsubscribe();
        assert_eq!(mapped.latest(), None);
    }

    #[tokio::test]
    async fn channel_keeps_value_between_listeners() {
        let (sink, stream) = DataStream::channel();
        sink.next(7);
        assert_eq!(stream.first().await.unwrap(), 7);
        assert_eq!(stream.first().await.unwrap(), 7);

        sink.next(8);
        assert_eq!(stream.map(|x: i32| x + 1).first().await.unwrap(), 9);
    }
}
