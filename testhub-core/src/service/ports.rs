// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capabilities the test service consumes from its host.

use crate::{cancel::CancellationToken, errors::ControllerError, observable::ObservableValue};
use futures::future::BoxFuture;
use testhub_metadata::{
    ProfileId, RunTestForControllerRequest, RunTestForControllerResult, TestId,
};

/// A registered producer of tests.
///
/// Controllers usually live in another process; implementations forward
/// these calls over whatever channel reaches them.
pub trait TestController: Send + Sync {
    /// The controller ID.
    fn id(&self) -> &str;

    /// The human-readable label.
    fn label(&self) -> &ObservableValue<String>;

    /// Whether the controller supports [`Self::refresh_tests`].
    fn can_refresh(&self) -> &ObservableValue<bool>;

    /// Runs tests. Each request is one profile's worth of tests; the result
    /// list carries one entry per request.
    fn run_tests(
        &self,
        requests: Vec<RunTestForControllerRequest>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Vec<RunTestForControllerResult>, ControllerError>>;

    /// Rediscovers the controller's tests.
    fn refresh_tests(&self, token: CancellationToken)
    -> BoxFuture<'static, Result<(), ControllerError>>;

    /// Discovers children of a test, `levels` deep.
    fn expand_test(&self, test_id: TestId, levels: u32)
    -> BoxFuture<'static, Result<(), ControllerError>>;

    /// Opens the configuration of a run profile.
    fn configure_run_profile(&self, profile_id: ProfileId);
}

/// Asks the user whether code in the workspace may be executed.
pub trait WorkspaceTrust: Send + Sync {
    /// Resolves to true if the workspace is trusted.
    fn request_workspace_trust(&self, message: &str) -> BoxFuture<'static, bool>;
}

/// Shows errors to the user.
pub trait NotificationSink: Send + Sync {
    /// Reports an error. Fire and forget.
    fn error(&self, message: &str);
}
