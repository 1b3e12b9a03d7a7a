// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The process-side end of the controller protocol.
//!
//! A transport delivers calls from controllers to a [`ControllerHost`], and
//! implements [`ControllerProxy`] to carry calls the other way. The host
//! turns each registered controller into a [`TestController`] backed by the
//! proxy, and routes run updates into live results.

use crate::{
    cancel::CancellationToken,
    errors::ControllerError,
    events::ListenerId,
    helpers::lock,
    observable::ObservableValue,
    result::{CoverageProvider, LiveTestResult},
    result_service::ResultChangeEvent,
    service::{TestController, TestService},
};
use bytes::Bytes;
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use testhub_metadata::{
    ControllerId, ExtensionRunTestsRequest, FileCoverage, Location, ProfileId,
    ResolvedTestRunRequest, RunTestForControllerRequest, RunTestForControllerResult,
    SerializedTestResult, TestId, TestItem, TestMessage, TestResultState, TestRunProfile,
    TestRunProfilePatch, TestRunTask, TestsDiff,
};
use tracing::debug;

/// Calls from the host to the controllers' side of the transport.
pub trait ControllerProxy: Send + Sync {
    /// Runs tests on a controller.
    fn run_controller_tests(
        &self,
        requests: Vec<RunTestForControllerRequest>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Vec<RunTestForControllerResult>, ControllerError>>;

    /// Refreshes a controller's tests.
    fn refresh_tests(
        &self,
        controller_id: &str,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ControllerError>>;

    /// Expands a test.
    fn expand_test(
        &self,
        test_id: TestId,
        levels: u32,
    ) -> BoxFuture<'static, Result<(), ControllerError>>;

    /// Opens the configuration of a run profile.
    fn configure_run_profile(&self, controller_id: &str, profile_id: ProfileId);

    /// Fetches the coverage a task collected.
    fn provide_file_coverage(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> BoxFuture<'static, Vec<FileCoverage>>;

    /// Delivers a processed diff to a subscribed controller host.
    fn accept_diff(&self, diff: &TestsDiff);

    /// Delivers completed results.
    fn publish_test_results(&self, results: Vec<SerializedTestResult>);

    /// Cancels a controller-started run, or all of them.
    fn cancel_extension_test_run(&self, run_id: Option<&str>);
}

/// Fields of a registered controller that may change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerPatch {
    /// A new label.
    pub label: Option<String>,
    /// Whether the controller can now refresh.
    pub can_refresh: Option<bool>,
}

/// Adapts the controller protocol to a [`TestService`].
pub struct ControllerHost {
    service: TestService,
    proxy: Arc<dyn ControllerProxy>,
    controllers: Mutex<HashMap<ControllerId, Arc<ProxiedController>>>,
    diff_listener: Mutex<Option<ListenerId>>,
    cancel_listener: ListenerId,
    results_listener: ListenerId,
}

impl fmt::Debug for ControllerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHost")
            .field("service", &self.service)
            .field("controllers", &lock(&self.controllers).keys())
            .finish_non_exhaustive()
    }
}

impl ControllerHost {
    /// Creates a host. Cancellations and completed results are forwarded to
    /// `proxy` for as long as the host lives.
    pub fn new(service: TestService, proxy: Arc<dyn ControllerProxy>) -> Self {
        let cancel_proxy = proxy.clone();
        let cancel_listener = service.on_did_cancel_test_run(move |run_id| {
            cancel_proxy.cancel_extension_test_run(run_id.as_deref());
        });

        let results_proxy = proxy.clone();
        let results_listener = service.results().on_results_changed(move |event| {
            let serialized = match event {
                ResultChangeEvent::Completed(result) => result.to_serialized(),
                ResultChangeEvent::Inserted(result) => result.to_serialized(),
                ResultChangeEvent::Started(_) | ResultChangeEvent::Removed(_) => None,
            };
            if let Some(serialized) = serialized {
                results_proxy.publish_test_results(vec![serialized]);
            }
        });

        Self {
            service,
            proxy,
            controllers: Mutex::new(HashMap::new()),
            diff_listener: Mutex::new(None),
            cancel_listener,
            results_listener,
        }
    }

    /// Returns the wrapped service.
    pub fn service(&self) -> &TestService {
        &self.service
    }

    /// Registers a controller living behind the proxy.
    pub fn register_test_controller(&self, controller_id: &str, label: &str, can_refresh: bool) {
        let controller = Arc::new(ProxiedController {
            id: ControllerId::new(controller_id),
            label: ObservableValue::new(label.to_owned()),
            can_refresh: ObservableValue::new(can_refresh),
            proxy: DebugIgnore(self.proxy.clone()),
        });
        lock(&self.controllers).insert(controller.id.clone(), controller.clone());
        self.service.register_test_controller(controller);
    }

    /// Updates a registered controller.
    pub fn update_controller(&self, controller_id: &str, patch: ControllerPatch) {
        let Some(controller) = lock(&self.controllers).get(controller_id).cloned() else {
            debug!(controller_id, "ignoring update for unknown controller");
            return;
        };
        if let Some(label) = patch.label {
            controller.label.set(label);
        }
        if let Some(can_refresh) = patch.can_refresh {
            controller.can_refresh.set(can_refresh);
        }
    }

    /// Unregisters a controller, dropping its profiles and tests.
    pub fn unregister_test_controller(&self, controller_id: &str) {
        if lock(&self.controllers).remove(controller_id).is_none() {
            debug!(controller_id, "ignoring unregistration of unknown controller");
            return;
        }
        self.service.profiles().remove_profile(controller_id, None);
        self.service.unregister_test_controller(controller_id);
    }

    /// Sends the current tree to the proxy, then every processed diff.
    pub fn subscribe_to_diffs(&self) {
        let proxy = self.proxy.clone();
        let id = self
            .service
            .subscribe_to_diffs(move |diff| proxy.accept_diff(diff));
        if let Some(previous) = lock(&self.diff_listener).replace(id) {
            self.service.unsubscribe_from_diffs(previous);
        }
    }

    /// Stops sending diffs to the proxy.
    pub fn unsubscribe_from_diffs(&self) {
        if let Some(id) = lock(&self.diff_listener).take() {
            self.service.unsubscribe_from_diffs(id);
        }
    }

    /// Applies a diff published by a controller.
    pub fn publish_diff(&self, controller_id: &str, diff: TestsDiff) {
        self.service.publish_diff(controller_id, diff);
    }

    /// Adds a run profile. Profiles of unregistered controllers are ignored.
    pub fn publish_test_run_profile(&self, profile: TestRunProfile) {
        if !lock(&self.controllers).contains_key(&profile.controller_id) {
            debug!(
                controller_id = %profile.controller_id,
                "ignoring profile for unknown controller",
            );
            return;
        }
        self.service.profiles().add_profile(profile);
    }

    /// Updates a run profile.
    pub fn update_test_run_config(
        &self,
        controller_id: &str,
        profile_id: ProfileId,
        patch: &TestRunProfilePatch,
    ) {
        self.service
            .profiles()
            .update_profile(controller_id, profile_id, patch);
    }

    /// Removes a run profile.
    pub fn remove_test_profile(&self, controller_id: &str, profile_id: ProfileId) {
        self.service
            .profiles()
            .remove_profile(controller_id, Some(profile_id));
    }

    /// Records a run that a controller started on its own.
    pub fn started_extension_test_run(&self, request: ExtensionRunTestsRequest) {
        self.service.results().create_live_result(request);
    }

    /// Adds a task to a run.
    pub fn started_test_run_task(&self, run_id: &str, task: TestRunTask) {
        self.with_live_run(run_id, |run| run.add_task(task));
    }

    /// Completes a task.
    pub fn finished_test_run_task(&self, run_id: &str, task_id: &str) {
        self.with_live_run(run_id, |run| run.mark_task_complete(task_id));
    }

    /// Adds a chain of tests, outermost first, to a run.
    pub fn add_tests_to_run(&self, controller_id: &str, run_id: &str, tests: &[TestItem]) {
        self.with_live_run(run_id, |run| run.add_test_chain_to_run(controller_id, tests));
    }

    /// Updates the state of a test in a run.
    pub fn update_test_state_in_run(
        &self,
        run_id: &str,
        task_id: &str,
        test_id: &TestId,
        state: TestResultState,
        duration: Option<Duration>,
    ) {
        self.with_live_run(run_id, |run| {
            run.update_state(test_id, task_id, state, duration);
        });
    }

    /// Appends output to a run.
    pub fn append_output_to_run(
        &self,
        run_id: &str,
        task_id: &str,
        output: Bytes,
        location: Option<Location>,
        test_id: Option<&TestId>,
    ) {
        self.with_live_run(run_id, |run| {
            run.append_output(&output, Some(task_id), location, test_id);
        });
    }

    /// Records messages for a test in a run.
    pub fn append_test_messages_in_run(
        &self,
        run_id: &str,
        task_id: &str,
        test_id: &TestId,
        messages: Vec<TestMessage>,
    ) {
        self.with_live_run(run_id, |run| {
            for message in messages {
                run.append_message(test_id, task_id, message);
            }
        });
    }

    /// Completes a controller-started run.
    pub fn finished_extension_test_run(&self, run_id: &str) {
        self.with_live_run(run_id, |run| {
            run.mark_complete();
        });
    }

    /// Makes a task's coverage available, fetched from the proxy on first
    /// use.
    pub fn signal_coverage_available(&self, run_id: &str, task_id: &str) {
        self.with_live_run(run_id, |run| {
            let provider = Arc::new(ProxyCoverage {
                proxy: self.proxy.clone(),
                run_id: run_id.to_owned(),
                task_id: task_id.to_owned(),
            });
            run.signal_coverage_available(task_id, provider);
        });
    }

    /// Retires tests in every run in progress.
    pub fn mark_test_retired(&self, test_ids: &[TestId]) {
        self.service.results().mark_retired(test_ids);
    }

    /// Runs a resolved request and returns the run ID.
    pub async fn run_tests(
        &self,
        request: ResolvedTestRunRequest,
        token: CancellationToken,
    ) -> String {
        let result = self.service.run_resolved_tests(request, token).await;
        result.id().to_owned()
    }

    fn with_live_run(&self, run_id: &str, f: impl FnOnce(&LiveTestResult)) {
        let live = self
            .service
            .results()
            .get_result(run_id)
            .and_then(|result| result.as_live().cloned());
        match live {
            Some(run) if run.completed_at().is_none() => f(&*run),
            Some(_) => debug!(run_id, "ignoring update for finished run"),
            None => debug!(run_id, "ignoring update for unknown run"),
        }
    }
}

impl Drop for ControllerHost {
    fn drop(&mut self) {
        self.service.unsubscribe_from_cancellations(self.cancel_listener);
        self.service
            .results()
            .unsubscribe_results_changed(self.results_listener);
        self.unsubscribe_from_diffs();

        let controllers: Vec<_> = lock(&self.controllers).drain().map(|(id, _)| id).collect();
        for controller_id in controllers {
            self.service.profiles().remove_profile(&controller_id, None);
            self.service.unregister_test_controller(&controller_id);
        }
    }
}

#[derive(Debug)]
struct ProxiedController {
    id: ControllerId,
    label: ObservableValue<String>,
    can_refresh: ObservableValue<bool>,
    proxy: DebugIgnore<Arc<dyn ControllerProxy>>,
}

impl TestController for ProxiedController {
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
        self.proxy.run_controller_tests(requests, token)
    }

    fn refresh_tests(
        &self,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        self.proxy.refresh_tests(&self.id, token)
    }

    fn expand_test(
        &self,
        test_id: TestId,
        levels: u32,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        self.proxy.expand_test(test_id, levels)
    }

    fn configure_run_profile(&self, profile_id: ProfileId) {
        self.proxy.configure_run_profile(&self.id, profile_id);
    }
}

struct ProxyCoverage {
    proxy: Arc<dyn ControllerProxy>,
    run_id: String,
    task_id: String,
}

impl CoverageProvider for ProxyCoverage {
    fn resolve(&self) -> BoxFuture<'static, Vec<FileCoverage>> {
        self.proxy.provide_file_coverage(&self.run_id, &self.task_id)
    }
}
