// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run profiles registered by controllers.

use crate::{
    errors::StateStoreError,
    events::{Emitter, ListenerId},
    helpers::lock,
    storage::StateStorage,
};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use testhub_metadata::{
    ControllerId, InternalTestItem, ProfileGroup, ProfileGroups, ProfileId, TestRunProfile,
    TestRunProfilePatch, can_use_profile_with_test,
};
use tracing::{debug, warn};

/// Looks up and maintains the run profiles that controllers expose.
pub trait TestProfileService: Send + Sync {
    /// Adds a profile, replacing any existing profile with the same ID.
    fn add_profile(&self, profile: TestRunProfile);

    /// Merges `patch` into an existing profile.
    fn update_profile(
        &self,
        controller_id: &str,
        profile_id: ProfileId,
        patch: &TestRunProfilePatch,
    );

    /// Removes one profile, or every profile of the controller if
    /// `profile_id` is `None`.
    fn remove_profile(&self, controller_id: &str, profile_id: Option<ProfileId>);

    /// Returns a controller's profiles, in registration order.
    fn get_controller_profiles(&self, controller_id: &str) -> Vec<TestRunProfile>;

    /// Returns the profiles that run by default for `group`, across all
    /// controllers.
    fn get_group_default_profiles(&self, group: ProfileGroup) -> Vec<TestRunProfile>;

    /// Records the user's preferred defaults for `group`.
    fn set_group_default_profiles(&self, group: ProfileGroup, profiles: &[TestRunProfile]);

    /// Returns the groups a test can be run with.
    fn capabilities_for_test(&self, test: &InternalTestItem) -> ProfileGroups;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRef {
    controller_id: ControllerId,
    profile_id: ProfileId,
}

#[derive(Debug, Default)]
struct RegistryInner {
    controllers: IndexMap<ControllerId, Vec<TestRunProfile>>,
    preferred: BTreeMap<ProfileGroup, Vec<ProfileRef>>,
}

impl RegistryInner {
    fn all(&self) -> impl Iterator<Item = &TestRunProfile> + '_ {
        self.controllers.values().flatten()
    }

    fn find_mut(
        &mut self,
        controller_id: &str,
        profile_id: ProfileId,
    ) -> Option<&mut TestRunProfile> {
        self.controllers
            .get_mut(controller_id)?
            .iter_mut()
            .find(|profile| profile.profile_id == profile_id)
    }
}

/// The in-process [`TestProfileService`].
///
/// Preferred defaults may be kept in a [`StateStorage`] so they survive a
/// restart.
#[derive(Debug)]
pub struct TestProfileRegistry {
    inner: Mutex<RegistryInner>,
    storage: Option<DebugIgnore<Arc<dyn StateStorage>>>,
    changed: Emitter<()>,
}

impl Default for TestProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TestProfileRegistry {
    /// The key preferred defaults are stored under.
    pub const STORAGE_KEY: &'static str = "testingPreferredProfiles";

    /// Creates a registry whose preferred defaults are not persisted.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            storage: None,
            changed: Emitter::new(),
        }
    }

    /// Creates a registry that loads and stores preferred defaults in
    /// `storage`.
    pub fn with_storage(storage: Arc<dyn StateStorage>) -> Result<Self, StateStoreError> {
        let preferred = match storage.get(Self::STORAGE_KEY)? {
            Some(json) => serde_json::from_str(&json).map_err(|error| StateStoreError::Decode {
                key: Self::STORAGE_KEY.to_owned(),
                error,
            })?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            inner: Mutex::new(RegistryInner {
                controllers: IndexMap::new(),
                preferred,
            }),
            storage: Some(DebugIgnore(storage)),
            changed: Emitter::new(),
        })
    }

    /// Registers a listener called whenever profiles or defaults change.
    pub fn on_changed(&self, callback: impl Fn(&()) + Send + Sync + 'static) -> ListenerId {
        self.changed.subscribe(callback)
    }

    fn store_preferred(&self, preferred: &BTreeMap<ProfileGroup, Vec<ProfileRef>>) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = serde_json::to_string(preferred)
            .map_err(|error| StateStoreError::Encode {
                key: Self::STORAGE_KEY.to_owned(),
                error,
            })
            .and_then(|json| storage.set(Self::STORAGE_KEY, json));
        if let Err(error) = result {
            warn!(%error, "failed to store preferred run profiles");
        }
    }
}

impl TestProfileService for TestProfileRegistry {
    fn add_profile(&self, profile: TestRunProfile) {
        {
            let mut inner = lock(&self.inner);
            let profiles = inner
                .controllers
                .entry(profile.controller_id.clone())
                .or_default();
            match profiles
                .iter_mut()
                .find(|existing| existing.profile_id == profile.profile_id)
            {
                Some(existing) => *existing = profile,
                None => profiles.push(profile),
            }
        }
        self.changed.fire(&());
    }

    fn update_profile(
        &self,
        controller_id: &str,
        profile_id: ProfileId,
        patch: &TestRunProfilePatch,
    ) {
        {
            let mut inner = lock(&self.inner);
            let Some(profile) = inner.find_mut(controller_id, profile_id) else {
                debug!(controller_id, %profile_id, "ignoring update of unknown profile");
                return;
            };
            patch.apply_to(profile);
        }
        self.changed.fire(&());
    }

    fn remove_profile(&self, controller_id: &str, profile_id: Option<ProfileId>) {
        {
            let mut inner = lock(&self.inner);
            match profile_id {
                None => {
                    if inner.controllers.shift_remove(controller_id).is_none() {
                        return;
                    }
                }
                Some(profile_id) => {
                    let Some(profiles) = inner.controllers.get_mut(controller_id) else {
                        return;
                    };
                    let before = profiles.len();
                    profiles.retain(|profile| profile.profile_id != profile_id);
                    if profiles.len() == before {
                        return;
                    }
                    if profiles.is_empty() {
                        inner.controllers.shift_remove(controller_id);
                    }
                }
            }
        }
        self.changed.fire(&());
    }

    fn get_controller_profiles(&self, controller_id: &str) -> Vec<TestRunProfile> {
        lock(&self.inner)
            .controllers
            .get(controller_id)
            .cloned()
            .unwrap_or_default()
    }

    fn get_group_default_profiles(&self, group: ProfileGroup) -> Vec<TestRunProfile> {
        let inner = lock(&self.inner);

        // Preferred defaults that are still registered come first.
        if let Some(preferred) = inner.preferred.get(&group) {
            let profiles: Vec<_> = inner
                .all()
                .filter(|profile| {
                    profile.group == group
                        && preferred.iter().any(|r| {
                            r.controller_id == profile.controller_id
                                && r.profile_id == profile.profile_id
                        })
                })
                .cloned()
                .collect();
            if !profiles.is_empty() {
                return profiles;
            }
        }

        let defaults: Vec<_> = inner
            .all()
            .filter(|profile| profile.group == group && profile.is_default)
            .cloned()
            .collect();
        if !defaults.is_empty() {
            return defaults;
        }

        // Have *some* profile to run with if none are marked default.
        inner
            .all()
            .find(|profile| profile.group == group)
            .cloned()
            .into_iter()
            .collect()
    }

    fn set_group_default_profiles(&self, group: ProfileGroup, profiles: &[TestRunProfile]) {
        let snapshot = {
            let mut inner = lock(&self.inner);
            inner.preferred.insert(
                group,
                profiles
                    .iter()
                    .map(|profile| ProfileRef {
                        controller_id: profile.controller_id.clone(),
                        profile_id: profile.profile_id,
                    })
                    .collect(),
            );
            inner.preferred.clone()
        };
        self.store_preferred(&snapshot);
        self.changed.fire(&());
    }

    fn capabilities_for_test(&self, test: &InternalTestItem) -> ProfileGroups {
        let inner = lock(&self.inner);
        let Some(profiles) = inner.controllers.get(&test.controller_id) else {
            return ProfileGroups::empty();
        };

        let mut capabilities = ProfileGroups::empty();
        let mut seen = ProfileGroups::empty();
        for profile in profiles
            .iter()
            .filter(|profile| can_use_profile_with_test(profile, test))
        {
            let group = profile.group.as_set();
            if seen.contains(group) {
                capabilities |= ProfileGroups::HAS_NON_DEFAULT;
            }
            seen |= group;
            capabilities |= group;
            if profile.has_configuration_handler {
                capabilities |= ProfileGroups::HAS_CONFIGURABLE;
            }
        }
        capabilities
    }
}
