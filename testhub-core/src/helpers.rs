// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use indexmap::IndexMap;
use std::{
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// State guarded this way is only mutated through short, non-panicking
/// critical sections, so the data is still consistent after a poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Groups `items` by `key`, keeping groups in first-seen order and items in
/// their original order within each group.
pub(crate) fn group_by_stable<T, K, F>(
    items: impl IntoIterator<Item = T>,
    key: F,
) -> IndexMap<K, Vec<T>>
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut groups: IndexMap<K, Vec<T>> = IndexMap::new();
    for item in items {
        groups.entry(key(&item)).or_default().push(item);
    }
    groups
}
