// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The persisted set of tests excluded from runs.

use crate::{
    errors::StateStoreError,
    events::{Emitter, ListenerId},
    helpers::lock,
    storage::StateStorage,
};
use debug_ignore::DebugIgnore;
use indexmap::IndexSet;
use std::sync::{Arc, Mutex};
use testhub_metadata::TestId;
use tracing::warn;

/// Tests excluded from runs that don't name an explicit exclude list.
///
/// The set is stored as a JSON array of IDs under [`Self::STORAGE_KEY`] and
/// written back on every change.
#[derive(Debug)]
pub struct TestExclusions {
    storage: DebugIgnore<Arc<dyn StateStorage>>,
    excluded: Mutex<IndexSet<TestId>>,
    changed: Emitter<()>,
}

impl TestExclusions {
    /// The key the exclusion set is stored under.
    pub const STORAGE_KEY: &'static str = "excludedTestItems";

    /// Loads the exclusion set from `storage`.
    pub fn load(storage: Arc<dyn StateStorage>) -> Result<Self, StateStoreError> {
        let excluded = match storage.get(Self::STORAGE_KEY)? {
            Some(json) => decode(&json)?,
            None => IndexSet::new(),
        };
        Ok(Self {
            storage: DebugIgnore(storage),
            excluded: Mutex::new(excluded),
            changed: Emitter::new(),
        })
    }

    /// Sets whether a test is excluded.
    ///
    /// With `exclude` unset, the current state is flipped. Returns true if the
    /// set changed. The in-memory set changes even if writing it back fails.
    pub fn toggle(&self, test_id: &TestId, exclude: Option<bool>) -> Result<bool, StateStoreError> {
        let snapshot = {
            let mut excluded = lock(&self.excluded);
            let is_excluded = excluded.contains(test_id);
            let changed = match exclude {
                Some(true) | None if !is_excluded => excluded.insert(test_id.clone()),
                Some(false) | None if is_excluded => excluded.shift_remove(test_id),
                _ => false,
            };
            if !changed {
                return Ok(false);
            }
            excluded.clone()
        };

        self.changed.fire(&());
        self.store(&snapshot)?;
        Ok(true)
    }

    /// Returns true if the test is excluded.
    pub fn contains(&self, test_id: &TestId) -> bool {
        lock(&self.excluded).contains(test_id)
    }

    /// Returns true if any test is excluded.
    pub fn has_any(&self) -> bool {
        !lock(&self.excluded).is_empty()
    }

    /// Returns every excluded test, in the order they were excluded.
    pub fn all(&self) -> Vec<TestId> {
        lock(&self.excluded).iter().cloned().collect()
    }

    /// Removes every exclusion.
    pub fn clear(&self) -> Result<(), StateStoreError> {
        {
            let mut excluded = lock(&self.excluded);
            if excluded.is_empty() {
                return Ok(());
            }
            excluded.clear();
        }
        self.changed.fire(&());
        self.store(&IndexSet::new())
    }

    /// Registers a listener called whenever the set changes.
    pub fn on_changed(&self, callback: impl Fn(&()) + Send + Sync + 'static) -> ListenerId {
        self.changed.subscribe(callback)
    }

    fn store(&self, excluded: &IndexSet<TestId>) -> Result<(), StateStoreError> {
        let json = encode(excluded).map_err(|error| StateStoreError::Encode {
            key: Self::STORAGE_KEY.to_owned(),
            error,
        })?;
        self.storage.set(Self::STORAGE_KEY, json).inspect_err(|error| {
            warn!(%error, "failed to store test exclusions");
        })
    }
}

fn decode(json: &str) -> Result<IndexSet<TestId>, StateStoreError> {
    serde_json::from_str(json).map_err(|error| StateStoreError::Decode {
        key: TestExclusions::STORAGE_KEY.to_owned(),
        error,
    })
}

fn encode(excluded: &IndexSet<TestId>) -> Result<String, serde_json::Error> {
    serde_json::to_string(excluded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStateStorage;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;
    use test_strategy::proptest;

    fn exclusions() -> (TestExclusions, Arc<MemoryStateStorage>) {
        let storage = Arc::new(MemoryStateStorage::new());
        let exclusions = TestExclusions::load(storage.clone()).unwrap();
        (exclusions, storage)
    }

    #[test]
    fn toggle_explicit_and_implicit() {
        let (exclusions, _) = exclusions();
        let t = TestId::from_parts(["c", "t"]);

        assert!(exclusions.toggle(&t, Some(true)).unwrap());
        assert!(exclusions.contains(&t));
        assert!(!exclusions.toggle(&t, Some(true)).unwrap(), "already excluded");

        assert!(exclusions.toggle(&t, Some(false)).unwrap());
        assert!(!exclusions.contains(&t));
        assert!(!exclusions.toggle(&t, Some(false)).unwrap(), "already included");

        assert!(exclusions.toggle(&t, None).unwrap());
        assert!(exclusions.contains(&t));
        assert!(exclusions.toggle(&t, None).unwrap());
        assert!(!exclusions.has_any());
    }

    #[test_case(Some(true), true ; "explicit exclude")]
    #[test_case(Some(false), false ; "explicit include is a no-op")]
    #[test_case(None, true ; "implicit toggle excludes")]
    fn toggle_from_empty(exclude: Option<bool>, changed: bool) {
        let (exclusions, _) = exclusions();
        let t = TestId::from_parts(["c", "t"]);
        assert_eq!(exclusions.toggle(&t, exclude).unwrap(), changed);
        assert_eq!(exclusions.contains(&t), changed);
    }

    #[test]
    fn changes_notify_and_persist() {
        let (exclusions, storage) = exclusions();
        let notified = Arc::new(AtomicUsize::new(0));
        let notified2 = notified.clone();
        exclusions.on_changed(move |()| {
            notified2.fetch_add(1, Ordering::SeqCst);
        });

        let a = TestId::from_parts(["c", "a"]);
        let b = TestId::from_parts(["c", "b"]);
        exclusions.toggle(&a, Some(true)).unwrap();
        exclusions.toggle(&b, Some(true)).unwrap();
        exclusions.toggle(&b, Some(true)).unwrap();

        assert_eq!(notified.load(Ordering::SeqCst), 2);
        let stored = storage.get(TestExclusions::STORAGE_KEY).unwrap().unwrap();
        assert_eq!(stored, "[\"c\\u0000a\",\"c\\u0000b\"]");

        let reloaded = TestExclusions::load(storage.clone()).unwrap();
        assert_eq!(reloaded.all(), vec![a, b]);

        exclusions.clear().unwrap();
        exclusions.clear().unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 3);
        assert_eq!(
            storage.get(TestExclusions::STORAGE_KEY).unwrap().as_deref(),
            Some("[]")
        );
    }

    #[test]
    fn malformed_stored_value_is_reported() {
        let storage = Arc::new(MemoryStateStorage::new());
        storage
            .set(TestExclusions::STORAGE_KEY, "{\"a\": 1}".to_owned())
            .unwrap();
        let error = TestExclusions::load(storage).unwrap_err();
        assert!(matches!(error, StateStoreError::Decode { .. }), "{error}");
    }

    #[proptest(cases = 64)]
    fn stored_set_round_trips(
        #[strategy(prop::collection::vec(any::<TestId>(), 0..16))] ids: Vec<TestId>,
    ) {
        let (exclusions, storage) = exclusions();
        for id in &ids {
            exclusions.toggle(id, Some(true)).unwrap();
        }

        let reloaded = TestExclusions::load(storage).unwrap();
        let expected: IndexSet<_> = ids.into_iter().collect();
        prop_assert_eq!(reloaded.all(), expected.into_iter().collect::<Vec<_>>());
    }
}
