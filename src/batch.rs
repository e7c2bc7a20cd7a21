use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, Weak},
    task::{Context, Poll},
};

use futures::FutureExt;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    data::{KeySet, Token as KeyToken, ValueSet},
    demux::{demultiplex_set, Loaded},
    error::UnknownTag,
    key::BatchKey,
    registry::{FetchFuture, KeyedRecord, TagEntry, TagRegistry},
    wakerset::{Token as WakerToken, WakerSet},
};

// A poisoned mutex means a fetch or a window panicked while being polled by
// another future. We build with panic=abort, so this shouldn't be reachable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("batch state mutex was poisoned")
}

/// The keys collected for one tag while a batch is accumulating.
struct PendingGroup<'f, Tag, Key, Record, Error> {
    tag: Tag,
    entry: TagEntry<'f, Key, Record, Error>,
    keys: KeySet<Key>,
}

impl<'f, Tag: Debug, Key: Clone, Record, Error> PendingGroup<'f, Tag, Key, Record, Error> {
    fn launch(self) -> FetchGroup<'f, Tag, Key, Record, Error> {
        debug!(tag = ?self.tag, keys = self.keys.len(), "starting fetch");
        let fut = self.entry.fetch(self.keys.keys().to_vec());

        FetchGroup {
            tag: self.tag,
            entry: self.entry,
            keys: self.keys,
            fetch: Fetch::Running(fut),
        }
    }
}

struct AccumulatingState<'f, Tag, Key, Record, Error, Delay> {
    // One group per tag, in the order the tags were first loaded
    groups: Vec<PendingGroup<'f, Tag, Key, Record, Error>>,
    key_count: usize,
    delay: Option<Delay>,
    wakers: WakerSet,
}

impl<'f, Tag, Key, Record, Error, Delay> AccumulatingState<'f, Tag, Key, Record, Error, Delay>
where
    Tag: Clone + Eq + Debug,
    Key: Clone + Eq + Hash,
{
    fn new() -> Self {
        Self {
            groups: Vec::new(),
            key_count: 0,
            delay: None,
            wakers: WakerSet::default(),
        }
    }

    /// Add a key to the group for its tag, creating the group if this is the
    /// first key for the tag. Returns the group index and the key's token
    /// within that group.
    fn add_key(
        &mut self,
        batch_key: &BatchKey<Tag, Key>,
        entry: &TagEntry<'f, Key, Record, Error>,
    ) -> (usize, KeyToken) {
        let group = match self
            .groups
            .iter()
            .position(|group| group.tag == batch_key.tag)
        {
            Some(group) => group,
            None => {
                self.groups.push(PendingGroup {
                    tag: batch_key.tag.clone(),
                    entry: entry.clone(),
                    keys: KeySet::new(),
                });
                self.groups.len() - 1
            }
        };

        let keys = &mut self.groups[group].keys;
        let before = keys.len();
        let token = keys.add_key(batch_key.key.clone());
        self.key_count += keys.len() - before;

        (group, token)
    }

    fn dispatch(&mut self) -> DispatchedState<'f, Tag, Key, Record, Error> {
        let groups = mem::take(&mut self.groups);
        debug!(
            tags = groups.len(),
            keys = self.key_count,
            waiting = self.wakers.len(),
            "dispatching batch"
        );

        DispatchedState {
            groups: groups.into_iter().map(PendingGroup::launch).collect(),
            wakers: mem::take(&mut self.wakers),
        }
    }
}

enum Fetch<'f, Record, Error> {
    Running(FetchFuture<'f, Record, Error>),
    Done(Result<ValueSet<Loaded<Record>>, Error>),
}

/// One tag's fetch, launched when the batch was dispatched. Groups settle
/// independently of each other.
struct FetchGroup<'f, Tag, Key, Record, Error> {
    tag: Tag,
    entry: TagEntry<'f, Key, Record, Error>,
    keys: KeySet<Key>,
    fetch: Fetch<'f, Record, Error>,
}

impl<'f, Tag, Key, Record, Error> FetchGroup<'f, Tag, Key, Record, Error> {
    fn is_done(&self) -> bool {
        matches!(self.fetch, Fetch::Done(..))
    }

    /// The result for one key of this group, or None if the fetch hasn't
    /// completed yet.
    fn result_for(&self, token: &KeyToken) -> Option<Result<Loaded<Record>, Error>>
    where
        Error: Clone,
    {
        match self.fetch {
            Fetch::Running(..) => None,
            Fetch::Done(Ok(ref values)) => Some(Ok(values
                .get(token)
                .cloned()
                .unwrap_or_else(|| Loaded::empty(self.entry.cardinality())))),
            Fetch::Done(Err(ref error)) => Some(Err(error.clone())),
        }
    }
}

impl<'f, Tag, Key, Record, Error> FetchGroup<'f, Tag, Key, Record, Error>
where
    Tag: Debug,
    Key: Clone + Eq + Hash + Debug,
    Record: KeyedRecord<Key>,
{
    /// Poll the fetch if it's still running. Returns true if it completed
    /// during this call.
    fn poll_fetch(&mut self, ctx: &mut Context<'_>) -> bool {
        let result = match self.fetch {
            Fetch::Running(ref mut fut) => match fut.poll_unpin(ctx) {
                Poll::Pending => return false,
                Poll::Ready(result) => result,
            },
            Fetch::Done(..) => return false,
        };

        let outcome = match result {
            Ok(records) => {
                debug!(tag = ?self.tag, records = records.len(), "fetch completed");
                let _span = debug_span!("demultiplex", tag = ?self.tag).entered();

                Ok(demultiplex_set(
                    &self.keys,
                    self.entry.cardinality(),
                    self.entry.attribute(),
                    records,
                ))
            }
            Err(error) => {
                warn!(
                    tag = ?self.tag,
                    keys = self.keys.len(),
                    "fetch failed; rejecting every lookup for this tag"
                );
                Err(error)
            }
        };

        self.fetch = Fetch::Done(outcome);
        true
    }
}

struct DispatchedState<'f, Tag, Key, Record, Error> {
    groups: Vec<FetchGroup<'f, Tag, Key, Record, Error>>,
    wakers: WakerSet,
}

impl<'f, Tag, Key, Record, Error> DispatchedState<'f, Tag, Key, Record, Error> {
    fn is_settled(&self) -> bool {
        self.groups.iter().all(FetchGroup::is_done)
    }
}

enum State<'f, Tag, Key, Record, Error, Delay> {
    Accum(AccumulatingState<'f, Tag, Key, Record, Error, Delay>),
    Dispatched(DispatchedState<'f, Tag, Key, Record, Error>),
}

type SharedState<'f, Tag, Key, Record, Error, Delay> =
    Arc<Mutex<State<'f, Tag, Key, Record, Error, Delay>>>;

type WeakState<'f, Tag, Key, Record, Error, Delay> =
    Weak<Mutex<State<'f, Tag, Key, Record, Error, Delay>>>;

/// Where one batch key lives: its batch, its tag group within that batch,
/// and its token within that group.
struct Handle<'f, Tag, Key, Record, Error, Delay> {
    state: SharedState<'f, Tag, Key, Record, Error, Delay>,
    group: usize,
    token: KeyToken,
}

impl<'f, Tag, Key, Record, Error, Delay> Handle<'f, Tag, Key, Record, Error, Delay> {
    fn duplicate(&self) -> Self {
        Self {
            state: self.state.clone(),
            group: self.group,
            token: self.token.duplicate(),
        }
    }
}

struct ControllerState<'f, Tag, Key, Record, Error, Delay> {
    // The batch currently accepting keys, if any
    current: WeakState<'f, Tag, Key, Record, Error, Delay>,

    // Every batch key loaded through this controller. Holding the handles
    // keeps finished batches (and their values) alive for as long as the
    // controller is.
    cache: HashMap<BatchKey<Tag, Key>, Handle<'f, Tag, Key, Record, Error, Delay>>,
}

type SharedControllerState<'f, Tag, Key, Record, Error, Delay> =
    Mutex<ControllerState<'f, Tag, Key, Record, Error, Delay>>;

/// The configuration of a [`BatchController`].
pub struct BatchRules<'f, Tag, Key, Record, Error, Delayer> {
    /// The tags that can be loaded, and how to fetch each of them.
    pub registry: TagRegistry<'f, Tag, Key, Record, Error>,

    /// Creates the batching window when a batch starts accumulating. See
    /// the [`window`](crate::window) module.
    pub window: Delayer,

    /// If set, a batch is dispatched as soon as it holds this many distinct
    /// `(tag, key)` pairs, regardless of the window.
    pub max_keys: Option<NonZeroUsize>,
}

impl<'f, Tag, Key, Record, Error, Delayer> Debug for BatchRules<'f, Tag, Key, Record, Error, Delayer>
where
    Tag: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRules")
            .field("registry", &self.registry)
            .field("window", &"<closure>")
            .field("max_keys", &self.max_keys)
            .finish()
    }
}

/// Coordinates the lookups of one logical request. Create one at the start
/// of the request, share it by reference with everything that resolves
/// fields, and drop it at the end.
pub struct BatchController<'f, Tag, Key, Record, Error, Delay, Delayer> {
    rules: BatchRules<'f, Tag, Key, Record, Error, Delayer>,
    state: SharedControllerState<'f, Tag, Key, Record, Error, Delay>,
}

impl<'f, Tag, Key, Record, Error, Delay, Delayer>
    BatchController<'f, Tag, Key, Record, Error, Delay, Delayer>
where
    Tag: Clone + Eq + Hash + Debug,
    Key: Clone + Eq + Hash + Debug,
    Delayer: Fn() -> Delay,
    Delay: Future<Output = ()> + Unpin,
{
    pub fn new(rules: BatchRules<'f, Tag, Key, Record, Error, Delayer>) -> Self {
        Self {
            rules,
            state: Mutex::new(ControllerState {
                current: Weak::new(),
                cache: HashMap::new(),
            }),
        }
    }

    pub fn rules(&self) -> &BatchRules<'f, Tag, Key, Record, Error, Delayer> {
        &self.rules
    }

    /// Load the value of `key` for `tag`. Fails immediately if `tag` isn't
    /// registered.
    ///
    /// If this `(tag, key)` pair was already loaded through this controller,
    /// the returned future shares the earlier lookup: pending or finished,
    /// the pair is never fetched twice. Otherwise the key is added to the
    /// batch that is currently accumulating, starting a new one if needed.
    pub fn load(
        &self,
        tag: Tag,
        key: Key,
    ) -> Result<BatchFuture<'f, Tag, Key, Record, Error, Delay>, UnknownTag<Tag>> {
        self.load_key(BatchKey::new(tag, key))
    }

    /// [`load`](Self::load), with a prebuilt [`BatchKey`].
    pub fn load_key(
        &self,
        batch_key: BatchKey<Tag, Key>,
    ) -> Result<BatchFuture<'f, Tag, Key, Record, Error, Delay>, UnknownTag<Tag>> {
        let entry = self.rules.registry.entry(&batch_key.tag)?;
        let mut controller = lock(&self.state);

        if let Some(handle) = controller.cache.get(&batch_key) {
            trace!(tag = ?batch_key.tag, key = ?batch_key.key, "reusing memoized lookup");
            return Ok(BatchFuture::new(handle.duplicate()));
        }

        let handle = self.enqueue(&mut controller, &batch_key, entry);
        controller.cache.insert(batch_key, handle.duplicate());

        Ok(BatchFuture::new(handle))
    }

    /// Load several keys of one tag. The futures are returned in the same
    /// order as `keys`.
    pub fn load_many(
        &self,
        tag: Tag,
        keys: impl IntoIterator<Item = Key>,
    ) -> Result<Vec<BatchFuture<'f, Tag, Key, Record, Error, Delay>>, UnknownTag<Tag>> {
        self.rules.registry.entry(&tag)?;

        keys.into_iter()
            .map(|key| self.load(tag.clone(), key))
            .collect()
    }

    /// Dispatch the accumulating batch now, without waiting for the rest of
    /// its window. Keys loaded after this call go into a new batch.
    pub fn flush(&self) {
        let mut controller = lock(&self.state);

        if let Some(state_handle) = controller.current.upgrade() {
            if let State::Accum(ref mut state) = *lock(&state_handle) {
                debug!(keys = state.key_count, "flushing batch");
                state.delay = None;
                state.wakers.wake_driver();
            }
        }

        controller.current = Weak::new();
    }

    /// The number of distinct `(tag, key)` pairs loaded through this
    /// controller so far.
    pub fn cached_keys(&self) -> usize {
        lock(&self.state).cache.len()
    }

    fn enqueue(
        &self,
        controller: &mut ControllerState<'f, Tag, Key, Record, Error, Delay>,
        batch_key: &BatchKey<Tag, Key>,
        entry: &TagEntry<'f, Key, Record, Error>,
    ) -> Handle<'f, Tag, Key, Record, Error, Delay> {
        // If there is an existing state, and it's still in the accum state,
        // add the key to it. Note that at no point do we check the timing;
        // we assume that if the window has closed, a future poll will
        // dispatch the batch.
        if let Some(state_handle) = controller.current.upgrade() {
            let mut state_guard = lock(&state_handle);
            if let State::Accum(ref mut state) = *state_guard {
                let (group, token) = state.add_key(batch_key, entry);

                // If we've hit the key limit:
                // - Clear the window
                // - Wake the driver so it dispatches
                // - Detach the shared state from the controller
                match self.rules.max_keys {
                    Some(max_keys) if state.key_count >= max_keys.get() => {
                        debug!(keys = state.key_count, "key limit reached");
                        state.delay = None;
                        state.wakers.wake_driver();
                        drop(state_guard);
                        controller.current = Weak::new();
                    }
                    _ => drop(state_guard),
                }

                return Handle {
                    state: state_handle,
                    group,
                    token,
                };
            }
        }

        let mut state = AccumulatingState::new();
        let (group, token) = state.add_key(batch_key, entry);

        let state = match self.rules.max_keys {
            // A batch of one never waits and is never shared
            Some(max_keys) if max_keys.get() <= 1 => Arc::new(Mutex::new(State::Accum(state))),
            _ => {
                state.delay = Some((self.rules.window)());
                let state = Arc::new(Mutex::new(State::Accum(state)));
                controller.current = Arc::downgrade(&state);
                state
            }
        };

        Handle {
            state,
            group,
            token,
        }
    }
}

/// The pending result of one [`BatchController::load`].
///
/// Awaiting it drives the whole batch it belongs to: first the batching
/// window, then the fetch of every tag in the batch. Only one of the
/// batch's futures is woken to do this at a time, but any of them can take
/// over if the driving one is dropped. The future resolves as soon as its
/// own tag's fetch completes, with that tag's [`Loaded`] value for its key,
/// or with the fetch's error.
pub struct BatchFuture<'f, Tag, Key, Record, Error, Delay> {
    waker_token: Option<WakerToken>,
    handle: Option<Handle<'f, Tag, Key, Record, Error, Delay>>,
}

impl<'f, Tag, Key, Record, Error, Delay> BatchFuture<'f, Tag, Key, Record, Error, Delay> {
    fn new(handle: Handle<'f, Tag, Key, Record, Error, Delay>) -> Self {
        Self {
            waker_token: None,
            handle: Some(handle),
        }
    }
}

impl<'f, Tag, Key, Record, Error, Delay> Future for BatchFuture<'f, Tag, Key, Record, Error, Delay>
where
    Tag: Clone + Eq + Debug,
    Key: Clone + Eq + Hash + Debug,
    Record: KeyedRecord<Key>,
    Error: Clone,
    Delay: Future<Output = ()> + Unpin,
{
    type Output = Result<Loaded<Record>, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        let handle = unpinned
            .handle
            .as_ref()
            .expect("Can't re-poll a completed BatchFuture");

        // Note about this mutex: it's safe to use in an async context,
        // because the lock is released when poll returns.
        let mut guard = lock(&handle.state);

        if let State::Accum(ref mut state) = *guard {
            if let Some(ref mut delay) = state.delay {
                if let Poll::Pending = delay.poll_unpin(ctx) {
                    // This waker is now the driving waker for the window.
                    state.wakers.upsert(&mut unpinned.waker_token, ctx.waker());
                    return Poll::Pending;
                }
            }

            // Window is complete. Launch every tag's fetch.
            let dispatched = state.dispatch();
            *guard = State::Dispatched(dispatched);
        }

        let state = match *guard {
            State::Dispatched(ref mut state) => state,
            State::Accum(..) => unreachable!("BatchFuture contained invalid state"),
        };

        let group = handle.group;
        let mut result = state.groups[group].result_for(&handle.token);

        if result.is_none() {
            // Drive every running fetch, not just our own, so that the one
            // driving task moves the whole batch forward.
            let mut settled = false;
            for fetch_group in state.groups.iter_mut() {
                settled |= fetch_group.poll_fetch(ctx);
            }

            // A group finished; its futures need to come get their values.
            if settled {
                state
                    .wakers
                    .wake_all_except(unpinned.waker_token.as_ref());
            }

            result = state.groups[group].result_for(&handle.token);
        }

        let result = match result {
            Some(result) => result,
            None => {
                // This is now the driving waker for the running fetches.
                state.wakers.upsert(&mut unpinned.waker_token, ctx.waker());
                return Poll::Pending;
            }
        };

        // Other groups may still be running; if we were driving them,
        // someone else has to take over.
        if let Some(token) = unpinned.waker_token.take() {
            if state.is_settled() {
                state.wakers.remove(token);
            } else {
                state.wakers.remove_and_hand_off(token);
            }
        }

        drop(guard);
        unpinned.handle = None;
        Poll::Ready(result)
    }
}

impl<'f, Tag, Key, Record, Error, Delay> Drop for BatchFuture<'f, Tag, Key, Record, Error, Delay> {
    fn drop(&mut self) {
        // The shared batch is only ever being driven by a single future, so
        // if this was the driver, another future has to be woken to take
        // over. Keys are left in the batch: the controller's cache still
        // refers to them.
        let (handle, token) = match (self.handle.as_ref(), self.waker_token.take()) {
            (Some(handle), Some(token)) => (handle, token),
            _ => return,
        };

        // We don't do any cleanup if the mutex is poisoned.
        if let Ok(mut guard) = handle.state.lock() {
            match *guard {
                State::Accum(ref mut state) => state.wakers.remove_and_hand_off(token),
                State::Dispatched(ref mut state) if state.is_settled() => {
                    state.wakers.remove(token)
                }
                State::Dispatched(ref mut state) => state.wakers.remove_and_hand_off(token),
            }
        }
    }
}
