// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use futures::future::{self, BoxFuture, FutureExt};
use std::{
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use testhub_core::{
    cancel::CancellationToken,
    config::ResultsConfig,
    errors::ControllerError,
    exclusions::TestExclusions,
    observable::ObservableValue,
    profiles::TestProfileRegistry,
    result_service::TestResultService,
    service::{NotificationSink, TestController, TestService, WorkspaceTrust},
    storage::{MemoryStateStorage, StateStorage, TestResultStorage},
};
use testhub_metadata::{
    InternalTestItem, ProfileGroup, ProfileId, RunTestForControllerRequest,
    RunTestForControllerResult, TestDiffOp, TestId, TestItem, TestItemExpandState, TestRunProfile,
};

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Only one of the tests in this binary can install the hook.
        let _ = color_eyre::install();
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub(crate) fn test_id(parts: &[&str]) -> TestId {
    TestId::from_parts(parts.iter().copied())
}

pub(crate) fn internal_item(parts: &[&str], expand: TestItemExpandState) -> InternalTestItem {
    let id = test_id(parts);
    let label = id.local_id().to_owned();
    InternalTestItem::new(TestItem::new(id, label), expand)
}

pub(crate) fn add(parts: &[&str], expand: TestItemExpandState) -> TestDiffOp {
    TestDiffOp::Add {
        item: internal_item(parts, expand),
    }
}

pub(crate) fn run_profile(controller_id: &str, profile_id: u32) -> TestRunProfile {
    TestRunProfile {
        controller_id: controller_id.into(),
        profile_id: ProfileId(profile_id),
        label: "Run".to_owned(),
        group: ProfileGroup::Run,
        is_default: true,
        tag: None,
        has_configuration_handler: false,
    }
}

/// A controller that records what it's asked to do.
#[derive(Debug)]
pub(crate) struct RecordingController {
    id: String,
    label: ObservableValue<String>,
    can_refresh: ObservableValue<bool>,
    expand_delay: Duration,
    runs: Mutex<Vec<Vec<RunTestForControllerRequest>>>,
    expands: AtomicUsize,
}

impl RecordingController {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            label: ObservableValue::new(id.to_owned()),
            can_refresh: ObservableValue::new(false),
            expand_delay: Duration::from_millis(20),
            runs: Mutex::new(Vec::new()),
            expands: AtomicUsize::new(0),
        })
    }

    pub(crate) fn runs(&self) -> Vec<Vec<RunTestForControllerRequest>> {
        self.runs.lock().unwrap().clone()
    }

    pub(crate) fn expand_count(&self) -> usize {
        self.expands.load(Ordering::SeqCst)
    }
}

impl TestController for RecordingController {
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
        _token: CancellationToken,
    ) -> BoxFuture<'static, Result<Vec<RunTestForControllerResult>, ControllerError>> {
        let results = requests
            .iter()
            .map(|_| RunTestForControllerResult::ok())
            .collect();
        self.runs.lock().unwrap().push(requests);
        future::ready(Ok(results)).boxed()
    }

    fn refresh_tests(
        &self,
        _token: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        future::ready(Ok(())).boxed()
    }

    fn expand_test(
        &self,
        _test_id: TestId,
        _levels: u32,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        self.expands.fetch_add(1, Ordering::SeqCst);
        let delay = self.expand_delay;
        async move {
            tokio::time::sleep(delay).await;
            Ok(())
        }
        .boxed()
    }

    fn configure_run_profile(&self, _profile_id: ProfileId) {}
}

#[derive(Debug)]
pub(crate) struct FixedTrust(pub(crate) bool);

impl WorkspaceTrust for FixedTrust {
    fn request_workspace_trust(&self, _message: &str) -> BoxFuture<'static, bool> {
        future::ready(self.0).boxed()
    }
}

#[derive(Debug, Default)]
pub(crate) struct CollectedErrors(Mutex<Vec<String>>);

impl NotificationSink for CollectedErrors {
    fn error(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_owned());
    }
}

/// A service wired to in-memory state and the given result storage.
pub(crate) struct Harness {
    pub(crate) service: TestService,
    pub(crate) profiles: Arc<TestProfileRegistry>,
    pub(crate) state: Arc<MemoryStateStorage>,
}

impl Harness {
    pub(crate) fn new(
        trusted: bool,
        config: ResultsConfig,
        storage: Arc<dyn TestResultStorage>,
    ) -> color_eyre::Result<Self> {
        test_init();
        let state = Arc::new(MemoryStateStorage::new());
        let profiles = Arc::new(TestProfileRegistry::new());
        let results = TestResultService::new(config, storage, profiles.clone());
        let excluded = Arc::new(TestExclusions::load(
            state.clone() as Arc<dyn StateStorage>
        )?);
        let service = TestService::new(
            profiles.clone(),
            results,
            excluded,
            Arc::new(FixedTrust(trusted)),
            Arc::new(CollectedErrors::default()),
        );
        Ok(Self {
            service,
            profiles,
            state,
        })
    }
}
