//! In-process keyed store with TTL expiry and named lists.
//!
//! Provides scalar `put`/`get`/`delete` with optional per-entry expiry, plus
//! named ordered lists with `push`/`delete`. Observers can subscribe to list
//! mutations and entry expiry.
//!
//! Every operation is atomic for a single key or a single list; there are no
//! multi-key transactions. Callbacks run synchronously on the task that
//! caused the mutation (or the expiry timer task) after the internal lock is
//! released, so a callback may call back into the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Store is closed")]
    Closed,
}

type ListCallback = Arc<dyn Fn(&str, &[String]) + Send + Sync>;
type ExpiryCallback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

/// Handle that unregisters a callback when dropped.
///
/// Hold this value to keep receiving notifications.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

struct Entry<V> {
    value: V,
    /// Bumped on every put so a stale timer can't remove a newer value
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

struct State<V> {
    items: HashMap<String, Entry<V>>,
    lists: HashMap<String, Vec<String>>,
    next_generation: u64,
    closed: bool,
}

struct Callbacks<V> {
    list_changed: Vec<(usize, ListCallback)>,
    item_expired: Vec<(usize, ExpiryCallback<V>)>,
}

struct Inner<V> {
    state: Mutex<State<V>>,
    callbacks: RwLock<Callbacks<V>>,
    next_callback_id: AtomicUsize,
}

impl<V> Inner<V> {
    fn lock_state(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_callbacks(&self) -> RwLockWriteGuard<'_, Callbacks<V>> {
        self.callbacks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn open_state(&self) -> Result<MutexGuard<'_, State<V>>, StoreError> {
        let state = self.lock_state();
        if state.closed {
            Err(StoreError::Closed)
        } else {
            Ok(state)
        }
    }

    /// Called by the timer task once an entry's TTL has elapsed.
    fn expire(&self, key: &str, generation: u64) {
        let expired = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            let current = state
                .items
                .get(key)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                state.items.remove(key).map(|entry| entry.value)
            } else {
                None
            }
        };

        if let Some(value) = expired {
            trace!("Store entry expired: {}", key);
            self.emit_expired(key, &value);
        }
    }

    fn emit_list_changed(&self, list: &str, values: &[String]) {
        // Clone the callback list so callbacks can subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .list_changed
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(list, values);
        }
    }

    fn emit_expired(&self, key: &str, value: &V) {
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .item_expired
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(key, value);
        }
    }
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in state.items.values_mut() {
            if let Some(handle) = entry.expiry.take() {
                handle.abort();
            }
        }
    }
}

/// Shared handle to the store. Clones refer to the same data.
pub struct MemStore<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for MemStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle, for callbacks that must not keep the store alive.
pub struct WeakStore<V> {
    inner: Weak<Inner<V>>,
}

impl<V> Clone for WeakStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<V> WeakStore<V> {
    pub fn upgrade(&self) -> Option<MemStore<V>> {
        self.inner.upgrade().map(|inner| MemStore { inner })
    }
}

impl<V> Default for MemStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: HashMap::new(),
                    lists: HashMap::new(),
                    next_generation: 0,
                    closed: false,
                }),
                callbacks: RwLock::new(Callbacks {
                    list_changed: Vec::new(),
                    item_expired: Vec::new(),
                }),
                next_callback_id: AtomicUsize::new(0),
            }),
        }
    }
}

impl<V> MemStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakStore<V> {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Insert or replace an entry.
    ///
    /// With a non-zero `ttl` the entry is removed after that long unless it
    /// is put again first, and every expiry callback fires. `None` or a zero
    /// duration means the entry never expires. Must be called from within a
    /// tokio runtime when a TTL is given.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> Result<(), StoreError> {
        let key = key.into();
        let ttl = ttl.filter(|ttl| !ttl.is_zero());

        let mut state = self.inner.open_state()?;
        state.next_generation += 1;
        let generation = state.next_generation;
        let expiry = ttl.map(|ttl| self.spawn_expiry(key.clone(), generation, ttl));

        let previous = state.items.insert(
            key,
            Entry {
                value,
                generation,
                expiry,
            },
        );
        if let Some(handle) = previous.and_then(|entry| entry.expiry) {
            handle.abort();
        }
        Ok(())
    }

    fn spawn_expiry(&self, key: String, generation: u64, ttl: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&key, generation);
            }
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        let state = self.inner.open_state()?;
        Ok(state.items.get(key).map(|entry| entry.value.clone()))
    }

    /// Remove an entry without firing expiry callbacks.
    ///
    /// Returns true if the key was present.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.open_state()?;
        match state.items.remove(key) {
            Some(entry) => {
                if let Some(handle) = entry.expiry {
                    handle.abort();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Append a value to a named list, creating the list if needed.
    pub fn list_push(&self, list: &str, value: impl Into<String>) -> Result<(), StoreError> {
        let snapshot = {
            let mut state = self.inner.open_state()?;
            let values = state.lists.entry(list.to_string()).or_default();
            values.push(value.into());
            values.clone()
        };

        self.inner.emit_list_changed(list, &snapshot);
        Ok(())
    }

    /// Remove every occurrence of `value` from a named list.
    ///
    /// Returns true if anything was removed. Change callbacks only fire when
    /// the list actually changed.
    pub fn list_delete(&self, list: &str, value: &str) -> Result<bool, StoreError> {
        let snapshot = {
            let mut state = self.inner.open_state()?;
            let Some(values) = state.lists.get_mut(list) else {
                return Ok(false);
            };
            let before = values.len();
            values.retain(|v| v != value);
            if values.len() == before {
                return Ok(false);
            }
            values.clone()
        };

        self.inner.emit_list_changed(list, &snapshot);
        Ok(true)
    }

    /// Current contents of a named list, or `None` if it was never created.
    pub fn list_get(&self, list: &str) -> Result<Option<Vec<String>>, StoreError> {
        let state = self.inner.open_state()?;
        Ok(state.lists.get(list).cloned())
    }

    /// Subscribe to mutations of any list.
    ///
    /// The callback receives the list name and its contents right after the
    /// mutation; it may already be stale by the time the callback reads it.
    pub fn on_list_changed(
        &self,
        callback: impl Fn(&str, &[String]) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write_callbacks()
            .list_changed
            .push((id, Arc::new(callback)));

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.write_callbacks().list_changed.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Subscribe to entry expiry. Fires once per lapsed entry.
    pub fn on_item_expired(
        &self,
        callback: impl Fn(&str, &V) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write_callbacks()
            .item_expired
            .push((id, Arc::new(callback)));

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.write_callbacks().item_expired.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Cancel all timers and drop all data. Later operations fail with
    /// [`StoreError::Closed`]. Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, entry) in state.items.drain() {
            if let Some(handle) = entry.expiry {
                handle.abort();
            }
        }
        state.lists.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }
}
