// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event fan-out.
//!
//! An [`Emitter`] keeps an explicit list of listeners. Events are delivered
//! synchronously, in the order they are fired, to every listener registered at
//! the time of firing. Listeners may be plain callbacks or unbounded channels;
//! channel listeners are dropped once their receiver goes away.

use crate::helpers::lock;
use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Identifies a listener registered with an [`Emitter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Listener<T> {
    Callback(Callback<T>),
    Channel(UnboundedSender<T>),
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(callback) => Self::Callback(callback.clone()),
            Self::Channel(sender) => Self::Channel(sender.clone()),
        }
    }
}

/// A list of listeners for events of type `T`.
pub struct Emitter<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

impl<T> Emitter<T> {
    /// Creates an emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback invoked for every subsequent event.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        self.register(Listener::Callback(Arc::new(callback)))
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn register(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }
}

impl<T: Clone> Emitter<T> {
    /// Registers a channel that receives a clone of every subsequent event.
    pub fn subscribe_channel(&self) -> UnboundedReceiver<T> {
        let (sender, receiver) = unbounded_channel();
        self.register(Listener::Channel(sender));
        receiver
    }

    /// Delivers `event` to every registered listener.
    ///
    /// The listener list is snapshotted before delivery, so listeners may
    /// subscribe or unsubscribe (including themselves) while being called.
    pub fn fire(&self, event: &T) {
        let snapshot: Vec<_> = lock(&self.listeners).clone();
        let mut closed = Vec::new();
        for (id, listener) in snapshot {
            match listener {
                Listener::Callback(callback) => callback(event),
                Listener::Channel(sender) => {
                    if sender.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            lock(&self.listeners).retain(|(id, _)| !closed.contains(id));
        }
    }
}
