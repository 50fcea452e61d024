//! Typed observer lists.
//!
//! # Responsibilities
//! - `Emitter<T>`: listeners for one event, with once-semantics
//! - `EventMap<T>`: emitters keyed by event name
//!
//! # Design Decisions
//! - Listeners are snapshotted before a trigger, so callbacks may bind,
//!   unbind or trigger again without deadlocking
//! - Once-listeners are removed before their callback runs

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by `bind`/`once`, used to unbind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listener<T> {
    id: ListenerId,
    once: bool,
    callback: Callback<T>,
}

/// Observers of a single event.
pub struct Emitter<T> {
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, once: bool, callback: Callback<T>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener { id, once, callback });
        id
    }

    pub fn bind<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add(false, Arc::new(callback))
    }

    /// Fires at most once, then unbinds itself.
    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add(true, Arc::new(callback))
    }

    pub fn unbind(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener; returns how many ran.
    pub fn trigger(&self, event: &T) -> usize {
        let callbacks: Vec<Callback<T>> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            let callbacks = listeners.iter().map(|l| Arc::clone(&l.callback)).collect();
            listeners.retain(|listener| !listener.once);
            callbacks
        };
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("listeners", &self.len()).finish()
    }
}

/// Emitters keyed by event name.
pub struct EventMap<T> {
    emitters: Mutex<HashMap<String, Arc<Emitter<T>>>>,
}

impl<T> EventMap<T> {
    pub fn new() -> Self {
        Self {
            emitters: Mutex::new(HashMap::new()),
        }
    }

    fn emitter(&self, name: &str) -> Arc<Emitter<T>> {
        let mut emitters = self.emitters.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(emitters.entry(name.to_string()).or_default())
    }

    fn existing(&self, name: &str) -> Option<Arc<Emitter<T>>> {
        self.emitters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn bind<F>(&self, name: &str, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.emitter(name).bind(callback)
    }

    pub fn once<F>(&self, name: &str, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.emitter(name).once(callback)
    }

    pub fn unbind(&self, name: &str, id: ListenerId) -> bool {
        self.existing(name).is_some_and(|emitter| emitter.unbind(id))
    }

    pub fn trigger(&self, name: &str, event: &T) -> usize {
        match self.existing(name) {
            Some(emitter) => emitter.trigger(event),
            None => 0,
        }
    }

    pub fn has_listeners(&self, name: &str) -> bool {
        self.existing(name).is_some_and(|emitter| !emitter.is_empty())
    }
}

impl<T> Default for EventMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let emitters = self.emitters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = emitters.keys().collect();
        names.sort();
        f.debug_struct("EventMap").field("events", &names).finish()
    }
}
