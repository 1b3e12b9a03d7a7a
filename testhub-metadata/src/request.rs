// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run requests exchanged with controllers.

use crate::{
    profile::{ProfileGroup, ProfileId},
    test_id::{ControllerId, TestId},
};
use serde::{Deserialize, Serialize};

/// One concrete (controller, profile, tests) target of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTestRunTarget {
    /// The controller that will run the tests.
    pub controller_id: ControllerId,
    /// The profile to run them with.
    pub profile_id: ProfileId,
    /// The group the profile belongs to.
    pub profile_group: ProfileGroup,
    /// The tests to run.
    pub test_ids: Vec<TestId>,
}

/// A run request whose targets have been fully resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTestRunRequest {
    /// The concrete targets to dispatch.
    pub targets: Vec<ResolvedTestRunTarget>,
    /// Tests to exclude. `None` means the current global exclusion set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<TestId>>,
    /// Whether the run was started automatically.
    #[serde(default)]
    pub is_auto_run: bool,
    /// Whether the run was started from the user interface.
    #[serde(default = "default_true")]
    pub is_ui_triggered: bool,
}

fn default_true() -> bool {
    true
}

/// A run that a controller started on its own, outside of a dispatched
/// request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRunTestsRequest {
    /// The run ID chosen by the controller.
    pub id: String,
    /// Tests included in the run.
    pub include: Vec<TestId>,
    /// Tests excluded from the run.
    #[serde(default)]
    pub exclude: Vec<TestId>,
    /// The controller that started the run.
    pub controller_id: ControllerId,
    /// The profile used for the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileId>,
    /// Whether the result should be persisted once complete.
    pub persist: bool,
}

/// The request a single controller receives when a run is dispatched to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTestForControllerRequest {
    /// The ID of the live result collecting this run.
    pub run_id: String,
    /// The controller the request is for.
    pub controller_id: ControllerId,
    /// The profile to run with.
    pub profile_id: ProfileId,
    /// The tests to exclude, never including any of `test_ids`.
    pub exclude_ext_ids: Vec<TestId>,
    /// The tests to run.
    pub test_ids: Vec<TestId>,
}

/// The outcome of a single [`RunTestForControllerRequest`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTestForControllerResult {
    /// An error message if the controller could not run the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunTestForControllerResult {
    /// A successful result.
    pub fn ok() -> Self {
        Self { error: None }
    }

    /// A failed result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}
