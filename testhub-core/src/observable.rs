// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    events::{Emitter, ListenerId},
    helpers::lock,
};
use std::sync::Mutex;

/// A value that notifies listeners when it changes.
///
/// Setting the value to one equal to the current value does not notify.
#[derive(Debug)]
pub struct ObservableValue<T> {
    value: Mutex<T>,
    on_change: Emitter<T>,
}

impl<T: Clone + PartialEq> ObservableValue<T> {
    /// Creates an observable with an initial value.
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            on_change: Emitter::new(),
        }
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    /// Replaces the value. Returns true and notifies listeners if it changed.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = lock(&self.value);
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        self.on_change.fire(&value);
        true
    }

    /// Registers a listener called with each new value.
    pub fn on_change(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        self.on_change.subscribe(callback)
    }

    /// Removes a listener registered with [`Self::on_change`].
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.on_change.unsubscribe(id)
    }
}

impl<T: Clone + PartialEq + Default> Default for ObservableValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
