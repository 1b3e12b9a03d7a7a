// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures for unit tests.

use crate::{
    cancel::CancellationToken,
    config::ResultsConfig,
    errors::ControllerError,
    exclusions::TestExclusions,
    observable::ObservableValue,
    profiles::TestProfileRegistry,
    result_service::TestResultService,
    service::{NotificationSink, TestController, TestService, WorkspaceTrust},
    storage::{MemoryResultStorage, MemoryStateStorage},
};
use chrono::{TimeZone, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use testhub_metadata::{
    InternalTestItem, ProfileGroup, ProfileId, RunTestForControllerRequest,
    RunTestForControllerResult, SerializedTaskState, SerializedTestResult,
    SerializedTestResultItem, TestDiffOp, TestId, TestItem, TestItemExpandState, TestResultState,
    TestRunProfile, TestRunTask,
};

pub(crate) fn test_id(parts: &[&str]) -> TestId {
    TestId::from_parts(parts.iter().copied())
}

pub(crate) fn test_item(parts: &[&str]) -> TestItem {
    let id = test_id(parts);
    let label = id.local_id().to_owned();
    TestItem::new(id, label)
}

pub(crate) fn internal_item(parts: &[&str], expand: TestItemExpandState) -> InternalTestItem {
    InternalTestItem::new(test_item(parts), expand)
}

pub(crate) fn add_op(parts: &[&str], expand: TestItemExpandState) -> TestDiffOp {
    TestDiffOp::Add {
        item: internal_item(parts, expand),
    }
}

pub(crate) fn run_task(id: &str) -> TestRunTask {
    TestRunTask {
        id: id.to_owned(),
        name: None,
        running: false,
    }
}

pub(crate) fn profile(
    controller_id: &str,
    profile_id: u32,
    group: ProfileGroup,
    is_default: bool,
) -> TestRunProfile {
    TestRunProfile {
        controller_id: controller_id.into(),
        profile_id: ProfileId(profile_id),
        label: format!("{controller_id} {group:?} {profile_id}"),
        group,
        is_default,
        tag: None,
        has_configuration_handler: false,
    }
}

/// A completed result for controller `ctrl` with a passing test `a`,
/// completed `completed_secs` seconds after the epoch.
pub(crate) fn serialized_result(id: &str, completed_secs: i64) -> SerializedTestResult {
    let state = |parent: Option<TestId>, parts: &[&str], own| SerializedTestResultItem {
        controller_id: "ctrl".into(),
        parent,
        item: test_item(parts),
        tasks: vec![SerializedTaskState {
            state: own,
            duration: None,
            messages: Vec::new(),
        }],
        own_computed_state: own,
        computed_state: TestResultState::Passed,
        retired: false,
        own_duration: None,
    };

    SerializedTestResult {
        id: id.to_owned(),
        completed_at: Utc
            .timestamp_opt(completed_secs, 0)
            .single()
            .expect("valid timestamp"),
        name: format!("run {id}"),
        tasks: vec![run_task("t")],
        test_states: vec![
            state(None, &["ctrl"], TestResultState::Unset),
            state(Some(test_id(&["ctrl"])), &["ctrl", "a"], TestResultState::Passed),
        ],
    }
}

/// What a [`FakeController`] does when asked to run or refresh.
#[derive(Clone, Debug)]
pub(crate) enum FakeBehavior {
    /// Succeed immediately.
    Pass,
    /// Report `message` as the result of every run request.
    ReportError(String),
    /// Fail the call.
    Fail(ControllerError),
    /// Succeed once the token is cancelled.
    WaitForCancel,
}

/// A controller that records calls made to it.
#[derive(Debug)]
pub(crate) struct FakeController {
    id: String,
    label: ObservableValue<String>,
    can_refresh: ObservableValue<bool>,
    pub(crate) run_behavior: Mutex<FakeBehavior>,
    pub(crate) refresh_behavior: Mutex<FakeBehavior>,
    pub(crate) runs: Mutex<Vec<Vec<RunTestForControllerRequest>>>,
    pub(crate) refreshes: AtomicUsize,
    pub(crate) expands: Mutex<Vec<(TestId, u32)>>,
    pub(crate) configured: Mutex<Vec<ProfileId>>,
}

impl FakeController {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            label: ObservableValue::new(format!("{id} tests")),
            can_refresh: ObservableValue::new(false),
            run_behavior: Mutex::new(FakeBehavior::Pass),
            refresh_behavior: Mutex::new(FakeBehavior::Pass),
            runs: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
            expands: Mutex::new(Vec::new()),
            configured: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn with_run_behavior(self: Arc<Self>, behavior: FakeBehavior) -> Arc<Self> {
        *self.run_behavior.lock().unwrap() = behavior;
        self
    }

    pub(crate) fn runs(&self) -> Vec<Vec<RunTestForControllerRequest>> {
        self.runs.lock().unwrap().clone()
    }

    fn respond<T: Send + 'static>(
        behavior: FakeBehavior,
        token: CancellationToken,
        ok: T,
    ) -> BoxFuture<'static, Result<T, ControllerError>> {
        match behavior {
            FakeBehavior::Pass | FakeBehavior::ReportError(_) => future::ready(Ok(ok)).boxed(),
            FakeBehavior::Fail(error) => future::ready(Err(error)).boxed(),
            FakeBehavior::WaitForCancel => async move {
                token.cancelled().await;
                Ok(ok)
            }
            .boxed(),
        }
    }
}

impl TestController for FakeController {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &ObservableValue<String> {
        &self.label
    }

    fn can_refresh(&self) -> &ObservableValue<bool> {
        &self.can_refresh
    }

    fn run_tests(
        &self,
        requests: Vec<RunTestForControllerRequest>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Vec<RunTestForControllerResult>, ControllerError>> {
        let behavior = self.run_behavior.lock().unwrap().clone();
        let results = requests
            .iter()
            .map(|_| match &behavior {
                FakeBehavior::ReportError(message) => RunTestForControllerResult::error(message),
                _ => RunTestForControllerResult::ok(),
            })
            .collect();
        self.runs.lock().unwrap().push(requests);
        Self::respond(behavior, token, results)
    }

    fn refresh_tests(
        &self,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let behavior = self.refresh_behavior.lock().unwrap().clone();
        Self::respond(behavior, token, ())
    }

    fn expand_test(
        &self,
        test_id: TestId,
        levels: u32,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        self.expands.lock().unwrap().push((test_id, levels));
        future::ready(Ok(())).boxed()
    }

    fn configure_run_profile(&self, profile_id: ProfileId) {
        self.configured.lock().unwrap().push(profile_id);
    }
}

/// Answers every trust request with a fixed value.
#[derive(Debug)]
pub(crate) struct FixedTrust(pub(crate) bool);

impl WorkspaceTrust for FixedTrust {
    fn request_workspace_trust(&self, _message: &str) -> BoxFuture<'static, bool> {
        future::ready(self.0).boxed()
    }
}

/// Records reported errors.
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifications {
    pub(crate) errors: Mutex<Vec<String>>,
}

impl NotificationSink for RecordingNotifications {
    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_owned());
    }
}

/// A test service wired to in-memory collaborators.
pub(crate) struct ServiceFixture {
    pub(crate) service: TestService,
    pub(crate) profiles: Arc<TestProfileRegistry>,
    pub(crate) storage: Arc<MemoryResultStorage>,
    pub(crate) notifications: Arc<RecordingNotifications>,
}

impl ServiceFixture {
    pub(crate) fn new(trusted: bool) -> Self {
        let profiles = Arc::new(TestProfileRegistry::new());
        let storage = Arc::new(MemoryResultStorage::new());
        let notifications = Arc::new(RecordingNotifications::default());
        let results =
            TestResultService::new(ResultsConfig::default(), storage.clone(), profiles.clone());
        let excluded = TestExclusions::load(Arc::new(MemoryStateStorage::new()))
            .expect("empty state storage loads");
        let service = TestService::new(
            profiles.clone(),
            results,
            Arc::new(excluded),
            Arc::new(FixedTrust(trusted)),
            notifications.clone(),
        );
        Self {
            service,
            profiles,
            storage,
            notifications,
        }
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.notifications.errors.lock().unwrap().clone()
    }
}
