// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run profiles exposed by controllers.

use crate::{item::InternalTestItem, test_id::ControllerId};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of run a profile performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileGroup {
    /// Runs tests normally.
    Run,
    /// Runs tests under a debugger.
    Debug,
    /// Runs tests and collects coverage.
    Coverage,
}

impl ProfileGroup {
    /// All groups, in display order.
    pub const ALL: [ProfileGroup; 3] = [Self::Run, Self::Debug, Self::Coverage];

    /// Returns the group as a single-member [`ProfileGroups`] set.
    pub fn as_set(self) -> ProfileGroups {
        match self {
            Self::Run => ProfileGroups::RUN,
            Self::Debug => ProfileGroups::DEBUG,
            Self::Coverage => ProfileGroups::COVERAGE,
        }
    }
}

impl fmt::Display for ProfileGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Debug => write!(f, "debug"),
            Self::Coverage => write!(f, "coverage"),
        }
    }
}

bitflags! {
    /// A set of [`ProfileGroup`]s, used to describe what a test can be run with.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ProfileGroups: u8 {
        /// See [`ProfileGroup::Run`].
        const RUN = 1 << 1;
        /// See [`ProfileGroup::Debug`].
        const DEBUG = 1 << 2;
        /// See [`ProfileGroup::Coverage`].
        const COVERAGE = 1 << 3;
        /// Set when a profile has a configuration handler.
        const HAS_CONFIGURABLE = 1 << 4;
        /// Set when at least one group has more than one profile to pick from.
        const HAS_NON_DEFAULT = 1 << 5;
    }
}

/// A controller-local profile identifier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProfileId(pub u32);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named run configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunProfile {
    /// The controller exposing this profile.
    pub controller_id: ControllerId,
    /// The controller-local profile ID.
    pub profile_id: ProfileId,
    /// Human-readable label.
    pub label: String,
    /// What kind of run this profile performs.
    pub group: ProfileGroup,
    /// Whether this profile is one of its group's defaults.
    pub is_default: bool,
    /// If set, the profile can only run tests carrying this tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Whether the controller can show a configuration UI for this profile.
    #[serde(default)]
    pub has_configuration_handler: bool,
}

/// Partial profile fields carried by an update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunProfilePatch {
    /// New label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// New default flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
    /// New tag restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Option<String>>,
    /// New configuration handler flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_configuration_handler: Option<bool>,
}

impl TestRunProfilePatch {
    /// Merges the patch into `profile`.
    pub fn apply_to(&self, profile: &mut TestRunProfile) {
        if let Some(label) = &self.label {
            profile.label.clone_from(label);
        }
        if let Some(is_default) = self.is_default {
            profile.is_default = is_default;
        }
        if let Some(tag) = &self.tag {
            profile.tag.clone_from(tag);
        }
        if let Some(has_handler) = self.has_configuration_handler {
            profile.has_configuration_handler = has_handler;
        }
    }
}

/// Returns whether `profile` can be used to run `test`.
pub fn can_use_profile_with_test(profile: &TestRunProfile, test: &InternalTestItem) -> bool {
    profile.controller_id == test.controller_id
        && profile
            .tag
            .as_ref()
            .is_none_or(|tag| test.item.tags.iter().any(|t| t == tag))
}
