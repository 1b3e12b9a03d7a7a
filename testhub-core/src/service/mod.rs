// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test service: controller registry and run orchestration.
//!
//! Controllers register with the service and publish diffs into its
//! [`MainTestCollection`]. Run requests are resolved into per-controller
//! targets, dispatched to every controller involved at once, and tracked in
//! a live result until all controllers have finished.

mod ports;

pub use ports::*;

use crate::{
    cancel::{CancellationSource, CancellationToken},
    collection::{ExpandFn, MainTestCollection},
    events::{Emitter, ListenerId},
    exclusions::TestExclusions,
    helpers::{group_by_stable, lock},
    observable::ObservableValue,
    profiles::TestProfileService,
    result::LiveTestResult,
    result_service::TestResultService,
};
use debug_ignore::DebugIgnore;
use futures::future::{FutureExt, join_all};
use indexmap::IndexMap;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use testhub_metadata::{
    ControllerId, InternalTestItem, ProfileGroup, ResolvedTestRunRequest, ResolvedTestRunTarget,
    RunTestForControllerRequest, TestDiffOp, TestId, TestsDiff, can_use_profile_with_test,
};
use tracing::{debug, instrument, warn};

/// The prompt shown when asking for workspace trust before a run.
pub const TRUST_PROMPT: &str = "Running tests may execute code in your workspace.";

/// A request to run tests whose profiles haven't been chosen yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmbiguousRunTestsRequest {
    /// The kind of run.
    pub group: ProfileGroup,
    /// The tests to run.
    pub tests: Vec<InternalTestItem>,
    /// Tests to exclude. `None` means the current global exclusion set.
    pub exclude: Option<Vec<InternalTestItem>>,
    /// Whether the run was started automatically.
    pub is_auto_run: bool,
}

/// Coordinates controllers, the test tree, and runs.
///
/// Cloning the service is cheap; clones share state.
#[derive(Clone)]
pub struct TestService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for TestService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestService")
            .field("controllers", &lock(&self.inner.controllers).keys())
            .field("collection", &self.inner.collection)
            .finish_non_exhaustive()
    }
}

struct RegisteredController {
    controller: Arc<dyn TestController>,
    can_refresh_listener: ListenerId,
}

struct ServiceInner {
    controllers: Mutex<IndexMap<ControllerId, RegisteredController>>,
    collection: MainTestCollection,
    excluded: Arc<TestExclusions>,
    profiles: DebugIgnore<Arc<dyn TestProfileService>>,
    results: TestResultService,
    trust: DebugIgnore<Arc<dyn WorkspaceTrust>>,
    notifications: DebugIgnore<Arc<dyn NotificationSink>>,
    // Runs started through `run_resolved_tests`, by run ID.
    ui_running: Mutex<HashMap<String, CancellationSource>>,
    refreshes: Mutex<IndexMap<u64, CancellationSource>>,
    next_refresh: AtomicU64,
    provider_count: ObservableValue<usize>,
    can_refresh: ObservableValue<bool>,
    is_refreshing: ObservableValue<bool>,
    will_process_diff: Emitter<TestsDiff>,
    did_process_diff: Emitter<TestsDiff>,
    did_cancel_test_run: Emitter<Option<String>>,
}

impl TestService {
    /// Creates a service with no registered controllers.
    pub fn new(
        profiles: Arc<dyn TestProfileService>,
        results: TestResultService,
        excluded: Arc<TestExclusions>,
        trust: Arc<dyn WorkspaceTrust>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let inner = Arc::new_cyclic(|service: &Weak<ServiceInner>| {
            let service = service.clone();
            let expand: ExpandFn = Arc::new(move |test_id: TestId, levels: u32| {
                let service = service.clone();
                async move {
                    if let Some(service) = service.upgrade() {
                        service.expand_test(&test_id, levels).await;
                    }
                }
                .boxed()
            });

            ServiceInner {
                controllers: Mutex::new(IndexMap::new()),
                collection: MainTestCollection::new(expand),
                excluded,
                profiles: DebugIgnore(profiles),
                results,
                trust: DebugIgnore(trust),
                notifications: DebugIgnore(notifications),
                ui_running: Mutex::new(HashMap::new()),
                refreshes: Mutex::new(IndexMap::new()),
                next_refresh: AtomicU64::new(0),
                provider_count: ObservableValue::new(0),
                can_refresh: ObservableValue::new(false),
                is_refreshing: ObservableValue::new(false),
                will_process_diff: Emitter::new(),
                did_process_diff: Emitter::new(),
                did_cancel_test_run: Emitter::new(),
            }
        });
        Self { inner }
    }

    /// Returns the test tree.
    pub fn collection(&self) -> &MainTestCollection {
        &self.inner.collection
    }

    /// Returns the global exclusion set.
    pub fn excluded(&self) -> &Arc<TestExclusions> {
        &self.inner.excluded
    }

    /// Returns the profile registry.
    pub fn profiles(&self) -> &Arc<dyn TestProfileService> {
        &self.inner.profiles
    }

    /// Returns the result service runs are recorded in.
    pub fn results(&self) -> &TestResultService {
        &self.inner.results
    }

    /// Returns the number of registered controllers.
    pub fn provider_count(&self) -> &ObservableValue<usize> {
        &self.inner.provider_count
    }

    /// Returns whether any registered controller can refresh.
    pub fn can_refresh(&self) -> &ObservableValue<bool> {
        &self.inner.can_refresh
    }

    /// Returns whether a refresh is in progress.
    pub fn is_refreshing(&self) -> &ObservableValue<bool> {
        &self.inner.is_refreshing
    }

    /// Returns a registered controller.
    pub fn get_test_controller(&self, controller_id: &str) -> Option<Arc<dyn TestController>> {
        self.inner.controller(controller_id)
    }

    /// Asks the owning controller to discover children of a test.
    pub async fn expand_test(&self, test_id: &TestId, levels: u32) {
        self.inner.expand_test(test_id, levels).await;
    }

    /// Cancels one run, or every run started through this service if
    /// `run_id` is `None`. Listeners of [`Self::on_did_cancel_test_run`] are
    /// told either way, so that controller-started runs can be cancelled too.
    pub fn cancel_test_run(&self, run_id: Option<&str>) {
        self.inner
            .did_cancel_test_run
            .fire(&run_id.map(str::to_owned));

        let running = lock(&self.inner.ui_running);
        match run_id {
            None => running.values().for_each(CancellationSource::cancel),
            Some(run_id) => {
                if let Some(source) = running.get(run_id) {
                    source.cancel();
                }
            }
        }
    }

    /// Resolves a run request against the registered profiles and runs it.
    ///
    /// Tests are first matched against the default profiles of the group. If
    /// that yields nothing, each test falls back to the first profile of its
    /// own controller that belongs to the group and can run it.
    pub async fn run_tests(
        &self,
        request: AmbiguousRunTestsRequest,
        token: CancellationToken,
    ) -> Arc<LiveTestResult> {
        let mut targets = Vec::new();
        for profile in self.inner.profiles.get_group_default_profiles(request.group) {
            let test_ids: Vec<_> = request
                .tests
                .iter()
                .filter(|test| can_use_profile_with_test(&profile, test))
                .map(|test| test.id().clone())
                .collect();
            if !test_ids.is_empty() {
                targets.push(ResolvedTestRunTarget {
                    controller_id: profile.controller_id.clone(),
                    profile_id: profile.profile_id,
                    profile_group: profile.group,
                    test_ids,
                });
            }
        }

        if targets.is_empty() {
            let by_controller = group_by_stable(&request.tests, |test| test.controller_id.clone());
            for (controller_id, tests) in by_controller {
                let profiles = self.inner.profiles.get_controller_profiles(&controller_id);
                let by_profile = group_by_stable(tests, |test| {
                    profiles
                        .iter()
                        .find(|profile| {
                            profile.group == request.group && can_use_profile_with_test(profile, test)
                        })
                        .map(|profile| profile.profile_id)
                });

                for (profile_id, tests) in by_profile {
                    let Some(profile_id) = profile_id else {
                        debug!(
                            %controller_id,
                            group = %request.group,
                            count = tests.len(),
                            "no profile can run tests",
                        );
                        continue;
                    };
                    targets.push(ResolvedTestRunTarget {
                        controller_id: controller_id.clone(),
                        profile_id,
                        profile_group: request.group,
                        test_ids: tests.iter().map(|test| test.id().clone()).collect(),
                    });
                }
            }
        }

        let resolved = ResolvedTestRunRequest {
            targets,
            exclude: request
                .exclude
                .map(|exclude| exclude.iter().map(|test| test.id().clone()).collect()),
            is_auto_run: request.is_auto_run,
            is_ui_triggered: true,
        };
        self.run_resolved_tests(resolved, token).await
    }

    /// Runs a resolved request.
    ///
    /// The returned result is always complete: it is marked complete once
    /// every controller has finished, if workspace trust is denied, or if
    /// this future is dropped early.
    #[instrument(level = "debug", skip_all, fields(targets = request.targets.len()))]
    pub async fn run_resolved_tests(
        &self,
        mut request: ResolvedTestRunRequest,
        token: CancellationToken,
    ) -> Arc<LiveTestResult> {
        let exclude = request
            .exclude
            .get_or_insert_with(|| self.inner.excluded.all())
            .clone();

        let result = self.inner.results.create_live_result(request.clone());
        if !self.inner.trust.request_workspace_trust(TRUST_PROMPT).await {
            debug!(run_id = result.id(), "workspace not trusted, not running tests");
            result.mark_complete();
            return result;
        }

        let source = CancellationSource::with_parent(&token);
        let run_token = source.token();
        lock(&self.inner.ui_running).insert(result.id().to_owned(), source);
        let _finalizer = RunFinalizer {
            service: &self.inner,
            result: result.clone(),
        };

        let by_controller = group_by_stable(request.targets, |target| target.controller_id.clone());
        let dispatches = by_controller.into_iter().filter_map(|(controller_id, targets)| {
            let Some(controller) = self.inner.controller(&controller_id) else {
                debug!(%controller_id, "no controller registered for run target");
                return None;
            };

            let requests = targets
                .into_iter()
                .map(|target| RunTestForControllerRequest {
                    run_id: result.id().to_owned(),
                    // A controller is never told to exclude one of its own targets.
                    exclude_ext_ids: exclude
                        .iter()
                        .filter(|id| !target.test_ids.contains(id))
                        .cloned()
                        .collect(),
                    controller_id: target.controller_id,
                    profile_id: target.profile_id,
                    test_ids: target.test_ids,
                })
                .collect();
            let run = controller.run_tests(requests, run_token.clone());
            let notifications = self.inner.notifications.clone();

            Some(async move {
                let errors: Vec<String> = match run.await {
                    Ok(results) => results.into_iter().filter_map(|result| result.error).collect(),
                    Err(error) => vec![error.to_string()],
                };
                if !errors.is_empty() {
                    warn!(%controller_id, ?errors, "controller failed to run tests");
                    notifications.error(&format!(
                        "An error occurred attempting to run tests: {}",
                        errors.join(" ")
                    ));
                }
            })
        });

        join_all(dispatches).await;
        debug!(run_id = result.id(), "all controllers finished");
        result
    }

    /// Applies a diff published by a controller to the test tree.
    ///
    /// Tests retired by the diff are also retired in runs in progress.
    pub fn publish_diff(&self, controller_id: &str, diff: TestsDiff) {
        self.inner.publish_diff(controller_id, diff);
    }

    /// Sends the current tree to `callback` as a single diff, then every
    /// subsequently processed diff.
    pub fn subscribe_to_diffs(
        &self,
        callback: impl Fn(&TestsDiff) + Send + Sync + 'static,
    ) -> ListenerId {
        callback(&self.inner.collection.get_reviver_diff());
        self.inner.did_process_diff.subscribe(callback)
    }

    /// Removes a subscription made with [`Self::subscribe_to_diffs`] or
    /// [`Self::on_did_process_diff`].
    pub fn unsubscribe_from_diffs(&self, id: ListenerId) -> bool {
        self.inner.did_process_diff.unsubscribe(id)
    }

    /// Registers a listener called before a diff is applied.
    pub fn on_will_process_diff(
        &self,
        callback: impl Fn(&TestsDiff) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.will_process_diff.subscribe(callback)
    }

    /// Registers a listener called after a diff is applied.
    pub fn on_did_process_diff(
        &self,
        callback: impl Fn(&TestsDiff) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.did_process_diff.subscribe(callback)
    }

    /// Registers a listener called with the run ID passed to
    /// [`Self::cancel_test_run`].
    pub fn on_did_cancel_test_run(
        &self,
        callback: impl Fn(&Option<String>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.did_cancel_test_run.subscribe(callback)
    }

    /// Removes a listener added with [`Self::on_did_cancel_test_run`].
    pub fn unsubscribe_from_cancellations(&self, id: ListenerId) -> bool {
        self.inner.did_cancel_test_run.unsubscribe(id)
    }

    /// Refreshes one controller, or every controller if `controller_id` is
    /// `None`. Failures are reported through the notification sink.
    pub async fn refresh_tests(&self, controller_id: Option<&str>) {
        let source = CancellationSource::new();
        let token = source.token();
        let key = self.inner.next_refresh.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.refreshes).insert(key, source);
        self.inner.is_refreshing.set(true);
        let _guard = RefreshGuard {
            service: &self.inner,
            key,
        };

        let controllers: Vec<_> = match controller_id {
            Some(controller_id) => self.inner.controller(controller_id).into_iter().collect(),
            None => self.inner.all_controllers(),
        };
        let outcomes = join_all(
            controllers
                .iter()
                .map(|controller| controller.refresh_tests(token.clone())),
        )
        .await;

        for (controller, outcome) in controllers.iter().zip(outcomes) {
            if let Err(error) = outcome {
                warn!(controller_id = controller.id(), %error, "failed to refresh tests");
                self.inner.notifications.error(&format!(
                    "An error occurred attempting to refresh tests: {error}"
                ));
            }
        }
    }

    /// Cancels every refresh in progress.
    pub fn cancel_refresh_tests(&self) {
        let cancelled: Vec<_> = lock(&self.inner.refreshes).drain(..).collect();
        debug!(count = cancelled.len(), "cancelling test refreshes");
        for (_, source) in cancelled {
            source.cancel();
        }
        self.inner.is_refreshing.set(false);
    }

    /// Registers a controller, replacing any controller with the same ID.
    pub fn register_test_controller(&self, controller: Arc<dyn TestController>) {
        let controller_id = ControllerId::new(controller.id());
        let service = Arc::downgrade(&self.inner);
        let can_refresh_listener = controller.can_refresh().on_change(move |_| {
            if let Some(service) = service.upgrade() {
                service.update_can_refresh();
            }
        });

        let previous = lock(&self.inner.controllers).insert(
            controller_id.clone(),
            RegisteredController {
                controller,
                can_refresh_listener,
            },
        );
        if let Some(previous) = previous {
            debug!(%controller_id, "replacing registered controller");
            previous
                .controller
                .can_refresh()
                .unsubscribe(previous.can_refresh_listener);
        }

        self.inner.update_provider_count();
        self.inner.update_can_refresh();
    }

    /// Unregisters a controller, removing its tests from the tree. Returns
    /// false if it wasn't registered.
    pub fn unregister_test_controller(&self, controller_id: &str) -> bool {
        let diff: TestsDiff = self
            .inner
            .collection
            .root_items()
            .into_iter()
            .filter(|root| root.item.controller_id == controller_id)
            .map(|root| TestDiffOp::Remove {
                item_id: root.item.id().clone(),
            })
            .collect();
        self.inner.publish_diff(controller_id, diff);

        let Some(removed) = lock(&self.inner.controllers).shift_remove(controller_id) else {
            return false;
        };
        removed
            .controller
            .can_refresh()
            .unsubscribe(removed.can_refresh_listener);
        self.inner.update_provider_count();
        self.inner.update_can_refresh();
        true
    }
}

impl ServiceInner {
    fn controller(&self, controller_id: &str) -> Option<Arc<dyn TestController>> {
        lock(&self.controllers)
            .get(controller_id)
            .map(|registered| registered.controller.clone())
    }

    fn all_controllers(&self) -> Vec<Arc<dyn TestController>> {
        lock(&self.controllers)
            .values()
            .map(|registered| registered.controller.clone())
            .collect()
    }

    async fn expand_test(&self, test_id: &TestId, levels: u32) {
        let Some(controller) = self.controller(test_id.controller_id()) else {
            debug!(test_id = %test_id.display_path(), "no controller to expand test");
            return;
        };
        if let Err(error) = controller.expand_test(test_id.clone(), levels).await {
            warn!(test_id = %test_id.display_path(), %error, "failed to expand test");
        }
    }

    fn publish_diff(&self, controller_id: &str, diff: TestsDiff) {
        debug!(controller_id, ops = diff.len(), "processing test diff");
        self.will_process_diff.fire(&diff);
        self.collection.apply(&diff);

        let retired: Vec<_> = diff
            .iter()
            .filter_map(|op| match op {
                TestDiffOp::RetireTest { test_id } => Some(test_id.clone()),
                _ => None,
            })
            .collect();
        if !retired.is_empty() {
            self.results.mark_retired(&retired);
        }

        self.did_process_diff.fire(&diff);
    }

    fn update_provider_count(&self) {
        let count = lock(&self.controllers).len();
        self.provider_count.set(count);
    }

    fn update_can_refresh(&self) {
        let can_refresh = self
            .all_controllers()
            .iter()
            .any(|controller| controller.can_refresh().get());
        self.can_refresh.set(can_refresh);
    }
}

/// Marks a run complete and forgets its cancellation source when the run
/// finishes, however it finishes.
struct RunFinalizer<'a> {
    service: &'a ServiceInner,
    result: Arc<LiveTestResult>,
}

impl Drop for RunFinalizer<'_> {
    fn drop(&mut self) {
        lock(&self.service.ui_running).remove(self.result.id());
        self.result.mark_complete();
    }
}

struct RefreshGuard<'a> {
    service: &'a ServiceInner,
    key: u64,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let any_left = {
            let mut refreshes = lock(&self.service.refreshes);
            refreshes.shift_remove(&self.key);
            !refreshes.is_empty()
        };
        self.service.is_refreshing.set(any_left);
    }
}

#[cfg(test)]
mod tests;
