//! Coalescing for async work on the tokio runtime.
//!
//! [`Flights`] runs at most one future per key at a time: callers that arrive
//! while a future for their key is running attach to it and receive a clone
//! of its output. [`Cached`] builds on it to hold a single value with an
//! optional lifetime.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

pub use tokio::sync::broadcast::error::RecvError;

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

type Table<K, T> = Mutex<HashMap<K, Slot<K, T>>>;

struct Slot<K, T>
where
    K: Hash + Eq,
{
    id: u64,
    flight: Weak<Flight<K, T>>,
}

/// One running future, shared by every attached [`Handle`].
///
/// When the last handle is dropped the future is aborted and the slot is
/// released, so an abandoned fetch does not keep running for nobody.
struct Flight<K, T>
where
    K: Hash + Eq,
{
    key: K,
    id: u64,
    tx: broadcast::Sender<T>,
    abort: AbortHandle,
    table: Weak<Table<K, T>>,
}

impl<K, T> Drop for Flight<K, T>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        self.abort.abort();
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock();
            if table.get(&self.key).is_some_and(|slot| slot.id == self.id) {
                tracing::trace!("Last waiter detached, releasing flight");
                table.remove(&self.key);
            }
        }
    }
}

/// A caller's attachment to a running future.
///
/// Dropping a handle detaches only this caller.
pub struct Handle<K, T>
where
    K: Hash + Eq,
{
    _flight: Arc<Flight<K, T>>,
    fut: BoxFut<'static, Result<T, RecvError>>,
}

impl<K, T> fmt::Debug for Handle<K, T>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("flight", &self._flight.id)
            .finish()
    }
}

impl<K, T> Future for Handle<K, T>
where
    K: Hash + Eq,
{
    type Output = Result<T, RecvError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<K, T> Handle<K, T>
where
    K: Hash + Eq,
    T: Clone + Send + 'static,
{
    fn new(flight: Arc<Flight<K, T>>) -> Self {
        let mut receiver = flight.tx.subscribe();
        Self {
            _flight: flight,
            fut: Box::pin(async move { receiver.recv().await }),
        }
    }
}

/// Keyed single-flight execution.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use echocache::Flights;
///
/// let flights: Flights<&'static str, u32> = Flights::default();
/// let value = flights.get("answer", || Box::pin(async { 42 })).await.unwrap();
/// assert_eq!(value, 42);
/// assert!(flights.is_empty());
/// # }
/// ```
pub struct Flights<K, T>
where
    K: Hash + Eq,
{
    table: Arc<Table<K, T>>,
    ids: Arc<AtomicU64>,
}

impl<K, T> fmt::Debug for Flights<K, T>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flights")
            .field("inflight", &self.table.lock().len())
            .finish()
    }
}

impl<K, T> Clone for Flights<K, T>
where
    K: Hash + Eq,
{
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            ids: Arc::clone(&self.ids),
        }
    }
}

impl<K, T> Default for Flights<K, T>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self {
            table: Default::default(),
            ids: Default::default(),
        }
    }
}

impl<K, T> Flights<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Attach to the running future for `key`, or start one with `f`.
    ///
    /// `f` is only called when nothing is in flight for `key`. The future runs
    /// on its own task, so it keeps going while at least one handle is alive
    /// even if the caller that started it goes away.
    pub fn handle<F>(&self, key: K, f: F) -> Handle<K, T>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        // Hold the table lock until the new flight is registered, so a second
        // caller for the same key cannot start a duplicate.
        let mut table = self.table.lock();

        if let Some(flight) = table.get(&key).and_then(|slot| slot.flight.upgrade()) {
            tracing::trace!(flight = flight.id, "Found inflight request");
            return Handle::new(flight);
        }

        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = broadcast::channel::<T>(1);
        let fut = (f)();

        let task = {
            let table = Arc::downgrade(&self.table);
            let key = key.clone();
            let tx = tx.clone();
            tracing::trace!(flight = id, "Launching new request");
            tokio::spawn(async move {
                let res = fut.await;
                if let Some(table) = table.upgrade() {
                    // Release the slot and publish while holding the lock, so
                    // nobody can subscribe in between and miss the value.
                    let mut table = table.lock();
                    if table.get(&key).is_some_and(|slot| slot.id == id) {
                        table.remove(&key);
                    }
                    let _ = tx.send(res);
                } else {
                    let _ = tx.send(res);
                }
            })
        };

        let flight = Arc::new(Flight {
            key: key.clone(),
            id,
            tx,
            abort: task.abort_handle(),
            table: Arc::downgrade(&self.table),
        });

        table.insert(
            key,
            Slot {
                id,
                flight: Arc::downgrade(&flight),
            },
        );

        Handle::new(flight)
    }

    /// Run `f` for `key` unless it is already running, and wait for the result.
    pub async fn get<F>(&self, key: K, f: F) -> Result<T, RecvError>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        self.handle(key, f).await
    }

    /// Whether a future for `key` is currently running.
    pub fn is_inflight(&self, key: &K) -> bool {
        self.table
            .lock()
            .get(key)
            .is_some_and(|slot| slot.flight.strong_count() > 0)
    }

    /// The number of keys with a running future.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|slot| slot.flight.strong_count() > 0)
            .count()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires: Option<Instant>,
}

impl<T> Entry<T> {
    fn fresh(&self) -> bool {
        self.expires.map(|e| e >= Instant::now()).unwrap_or(true)
    }
}

/// A single value fetched on demand by an async function and kept for an
/// optional lifetime. Concurrent misses share one fetch.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    entry: Arc<Mutex<Option<Entry<T>>>>,
    flights: Flights<(), T>,
    expiration: Option<Duration>,
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self {
            entry: Default::default(),
            flights: Default::default(),
            expiration: None,
        }
    }
}

impl<T> Cached<T> {
    /// An empty cache whose values live for `expiration` (forever if `None`).
    #[must_use]
    pub fn new(expiration: Option<Duration>) -> Self {
        Self {
            entry: Default::default(),
            flights: Default::default(),
            expiration,
        }
    }

    /// Forget the cached value.
    pub fn clear(&self) {
        *self.entry.lock() = None;
    }

    /// Apply `f` to the cached value if there is a fresh one.
    pub fn map_cached<F, U>(&self, f: F) -> Option<U>
    where
        F: FnOnce(&T) -> U,
    {
        let entry = self.entry.lock();
        entry.as_ref().filter(|e| e.fresh()).map(|e| f(&e.value))
    }
}

impl<T> Cached<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Return the cached value, or fetch it with `f`.
    pub async fn get<F>(&self, f: F) -> Result<T, RecvError>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        if let Some(value) = self.map_cached(T::clone) {
            return Ok(value);
        }

        let entry = Arc::clone(&self.entry);
        let expiration = self.expiration;
        self.flights
            .get((), move || {
                let fut = f();
                Box::pin(async move {
                    let value = fut.await;
                    *entry.lock() = Some(Entry {
                        value: value.clone(),
                        expires: expiration.map(|lifetime| Instant::now() + lifetime),
                    });
                    value
                })
            })
            .await
    }
}
