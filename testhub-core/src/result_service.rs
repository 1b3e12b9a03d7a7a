// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ordered list of known results.
//!
//! Runs in progress sit at the front of the list. Completed runs follow,
//! most recently completed first. The list is capped at
//! [`ResultsConfig::retain_max`] and written back to storage a short while
//! after it changes.

use crate::{
    config::ResultsConfig,
    events::{Emitter, ListenerId},
    helpers::lock,
    observable::ObservableValue,
    profiles::TestProfileService,
    result::{
        HistoricalTestResult, LiveTestResult, ResultRef, ResultUuid, TestResultItem,
        TestResultItemChange, TestResultItemChangeReason,
    },
    storage::TestResultStorage,
};
use chrono::{DateTime, Utc};
use debug_ignore::DebugIgnore;
use std::{
    cmp::Reverse,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};
use testhub_metadata::{
    ExtensionRunTestsRequest, ResolvedTestRunRequest, ResolvedTestRunTarget, TestId,
    TestResultState,
};
use tokio::{sync::OnceCell, task::JoinHandle};
use tracing::{debug, warn};

/// A change to the list of results.
#[derive(Clone, Debug)]
pub enum ResultChangeEvent {
    /// A live result was added.
    Started(Arc<LiveTestResult>),
    /// A live result completed.
    Completed(Arc<LiveTestResult>),
    /// A completed result was added, usually from storage.
    Inserted(ResultRef),
    /// Results were removed by [`TestResultService::clear`].
    Removed(Vec<ResultRef>),
}

impl ResultChangeEvent {
    /// Returns every result the event is about.
    pub fn results(&self) -> Vec<ResultRef> {
        match self {
            Self::Started(result) | Self::Completed(result) => {
                vec![ResultRef::Live(result.clone())]
            }
            Self::Inserted(result) => vec![result.clone()],
            Self::Removed(results) => results.clone(),
        }
    }
}

/// The request a live result is created for.
#[derive(Clone, Debug)]
pub enum LiveResultRequest {
    /// A run started through the test service, with every target resolved.
    Resolved(ResolvedTestRunRequest),
    /// A run a controller started on its own.
    Extension(ExtensionRunTestsRequest),
}

impl From<ResolvedTestRunRequest> for LiveResultRequest {
    fn from(request: ResolvedTestRunRequest) -> Self {
        Self::Resolved(request)
    }
}

impl From<ExtensionRunTestsRequest> for LiveResultRequest {
    fn from(request: ExtensionRunTestsRequest) -> Self {
        Self::Extension(request)
    }
}

/// Keeps track of live and historical results.
///
/// Cloning the service is cheap; clones share the same list.
#[derive(Clone)]
pub struct TestResultService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for TestResultService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestResultService")
            .field("config", &self.inner.config)
            .field("results", &self.inner.results)
            .finish_non_exhaustive()
    }
}

struct ServiceInner {
    config: ResultsConfig,
    storage: DebugIgnore<Arc<dyn TestResultStorage>>,
    profiles: DebugIgnore<Arc<dyn TestProfileService>>,
    results: Mutex<Vec<ResultRef>>,
    loaded: OnceCell<()>,
    load_started: AtomicBool,
    pending_persist: Mutex<Option<JoinHandle<()>>>,
    is_running: ObservableValue<bool>,
    has_any_results: ObservableValue<bool>,
    results_changed: Emitter<ResultChangeEvent>,
    test_changed: Emitter<TestResultItemChange>,
}

impl TestResultService {
    /// Creates a service that stores results in `storage` and resolves
    /// controller-started runs against `profiles`.
    ///
    /// Persisted results start loading in the background right away if an
    /// async runtime is available, or otherwise on first access from within
    /// one.
    pub fn new(
        config: ResultsConfig,
        storage: Arc<dyn TestResultStorage>,
        profiles: Arc<dyn TestProfileService>,
    ) -> Self {
        let service = Self {
            inner: Arc::new(ServiceInner {
                config,
                storage: DebugIgnore(storage),
                profiles: DebugIgnore(profiles),
                results: Mutex::new(Vec::new()),
                loaded: OnceCell::new(),
                load_started: AtomicBool::new(false),
                pending_persist: Mutex::new(None),
                is_running: ObservableValue::new(false),
                has_any_results: ObservableValue::new(false),
                results_changed: Emitter::new(),
                test_changed: Emitter::new(),
            }),
        };
        service.inner.start_loading();
        service
    }

    /// Returns a snapshot of the results: runs in progress first, then
    /// completed runs, most recent first.
    ///
    /// History that is still loading shows up in later snapshots.
    pub fn results(&self) -> Vec<ResultRef> {
        self.inner.start_loading();
        lock(&self.inner.results).clone()
    }

    /// Loads persisted results into the list. Only the first load reads
    /// storage; later calls wait for it to finish.
    pub async fn load(&self) {
        self.inner.load().await;
    }

    /// Creates a live result for `request` and adds it to the list.
    ///
    /// Controller-started runs are resolved against the controller's
    /// profiles. If the named profile doesn't exist, the run has no targets.
    pub fn create_live_result(&self, request: impl Into<LiveResultRequest>) -> Arc<LiveTestResult> {
        let (id, persist, resolved) = match request.into() {
            LiveResultRequest::Resolved(resolved) => {
                (ResultUuid::new_v4().to_string(), true, resolved)
            }
            LiveResultRequest::Extension(request) => {
                let profile = request.profile.and_then(|profile_id| {
                    self.inner
                        .profiles
                        .get_controller_profiles(&request.controller_id)
                        .into_iter()
                        .find(|profile| profile.profile_id == profile_id)
                });
                if profile.is_none() {
                    debug!(
                        controller_id = %request.controller_id,
                        profile_id = ?request.profile,
                        "no matching profile for controller-started run",
                    );
                }

                let targets = profile
                    .map(|profile| ResolvedTestRunTarget {
                        controller_id: request.controller_id.clone(),
                        profile_id: profile.profile_id,
                        profile_group: profile.group,
                        test_ids: request.include.clone(),
                    })
                    .into_iter()
                    .collect();
                let resolved = ResolvedTestRunRequest {
                    targets,
                    exclude: Some(request.exclude),
                    is_auto_run: false,
                    is_ui_triggered: false,
                };
                (request.id, request.persist, resolved)
            }
        };

        let output = self.inner.storage.output_sink(&id);
        let result = Arc::new(LiveTestResult::new(id, output, persist, resolved));
        self.push(ResultRef::Live(result.clone()));
        result
    }

    /// Adds a result to the list and returns it.
    pub fn push(&self, result: ResultRef) -> ResultRef {
        self.inner.push(result, true)
    }

    /// Looks up a result by ID.
    pub fn get_result(&self, result_id: &str) -> Option<ResultRef> {
        self.inner.start_loading();
        lock(&self.inner.results)
            .iter()
            .find(|result| result.id() == result_id)
            .cloned()
    }

    /// Returns the most recent result with a known state for the test, along
    /// with that state.
    pub fn get_state_by_id(&self, test_id: &TestId) -> Option<(ResultRef, TestResultItem)> {
        let results = self.results();
        results.into_iter().find_map(|result| {
            let item = result
                .get_state_by_id(test_id)
                .filter(|item| item.computed_state != TestResultState::Unset)?;
            Some((result, item))
        })
    }

    /// Removes every completed result. Runs in progress are kept.
    pub fn clear(&self) {
        let (removed, any_left) = {
            let mut results = lock(&self.inner.results);
            let (keep, removed): (Vec<_>, Vec<_>) = results
                .drain(..)
                .partition(|result| result.completed_at().is_none());
            *results = keep;
            (removed, !results.is_empty())
        };

        debug!(removed = removed.len(), "cleared completed results");
        if !any_left {
            self.inner.has_any_results.set(false);
        }
        self.inner.schedule_persist();
        self.inner
            .results_changed
            .fire(&ResultChangeEvent::Removed(removed));
    }

    /// Marks tests as retired in every run still in progress.
    pub fn mark_retired(&self, test_ids: &[TestId]) {
        for result in self.results() {
            if let Some(live) = result.as_live()
                && live.completed_at().is_none()
            {
                live.mark_retired(Some(test_ids));
            }
        }
    }

    /// Writes the completed results to storage now, cancelling any pending
    /// delayed write.
    pub async fn persist_immediately(&self) {
        if let Some(pending) = lock(&self.inner.pending_persist).take() {
            pending.abort();
        }
        self.inner.persist_now().await;
    }

    /// Returns true while any result is in progress.
    pub fn is_running(&self) -> &ObservableValue<bool> {
        &self.inner.is_running
    }

    /// Returns true while the list is non-empty.
    pub fn has_any_results(&self) -> &ObservableValue<bool> {
        &self.inner.has_any_results
    }

    /// Registers a listener for changes to the list.
    pub fn on_results_changed(
        &self,
        callback: impl Fn(&ResultChangeEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.results_changed.subscribe(callback)
    }

    /// Unregisters a listener added with [`Self::on_results_changed`].
    pub fn unsubscribe_results_changed(&self, id: ListenerId) -> bool {
        self.inner.results_changed.unsubscribe(id)
    }

    /// Registers a listener for test changes in any result.
    pub fn on_test_changed(
        &self,
        callback: impl Fn(&TestResultItemChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.test_changed.subscribe(callback)
    }
}

impl ServiceInner {
    /// Starts loading persisted results in the background, once.
    fn start_loading(self: &Arc<Self>) {
        if self.loaded.initialized() || self.load_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime available, deferring load of persisted results");
            self.load_started.store(false, Ordering::Release);
            return;
        };

        let service = Arc::downgrade(self);
        runtime.spawn(async move {
            if let Some(service) = service.upgrade() {
                service.load().await;
            }
        });
    }

    async fn load(self: &Arc<Self>) {
        self.loaded
            .get_or_init(|| async {
                match self.storage.read().await {
                    Ok(loaded) => {
                        debug!(count = loaded.len(), "loaded persisted test results");
                        // Stored most recent first; push the oldest first.
                        for result in loaded.into_iter().rev() {
                            self.push(ResultRef::Historical(Arc::new(result)), false);
                        }
                    }
                    Err(error) => {
                        warn!(%error, "failed to read persisted test results");
                    }
                }
            })
            .await;
    }

    fn push(self: &Arc<Self>, result: ResultRef, schedule_persist: bool) -> ResultRef {
        {
            let mut results = lock(&self.results);
            match result.completed_at() {
                None => results.insert(0, result.clone()),
                Some(completed_at) => {
                    let index = results
                        .iter()
                        .position(|other| {
                            other.completed_at().is_some_and(|other| other <= completed_at)
                        })
                        .unwrap_or(results.len());
                    results.insert(index, result.clone());
                }
            }

            while results.len() > self.config.retain_max {
                // Evict the oldest completed result. Runs in progress stay.
                match results.iter().rposition(|r| r.completed_at().is_some()) {
                    Some(index) => {
                        let evicted = results.remove(index);
                        debug!(result_id = evicted.id(), "evicted oldest test result");
                    }
                    None => break,
                }
            }
        }

        self.has_any_results.set(true);
        if schedule_persist && result.completed_at().is_some() {
            self.schedule_persist();
        }

        match &result {
            ResultRef::Live(live) => {
                self.watch_live(live);
                self.is_running.set(true);
                self.results_changed
                    .fire(&ResultChangeEvent::Started(live.clone()));
            }
            ResultRef::Historical(historical) => {
                self.results_changed
                    .fire(&ResultChangeEvent::Inserted(result.clone()));
                self.notify_inserted(&result, historical);
            }
        }

        result
    }

    /// Fires a computed-state change for each test of an inserted result for
    /// which no newer result has a state.
    fn notify_inserted(&self, result: &ResultRef, historical: &HistoricalTestResult) {
        let results = lock(&self.results).clone();
        for item in historical.tests() {
            for other in &results {
                if other.ptr_eq(result) {
                    self.test_changed.fire(&TestResultItemChange {
                        item: item.clone(),
                        result_id: historical.id().to_owned(),
                        reason: TestResultItemChangeReason::ComputedStateChange,
                    });
                    break;
                } else if other.get_state_by_id(item.id()).is_some() {
                    break;
                }
            }
        }
    }

    fn watch_live(self: &Arc<Self>, live: &Arc<LiveTestResult>) {
        let service = Arc::downgrade(self);
        live.on_change(move |change| {
            if let Some(service) = service.upgrade() {
                service.test_changed.fire(change);
            }
        });

        let service = Arc::downgrade(self);
        let weak_live: Weak<LiveTestResult> = Arc::downgrade(live);
        live.on_complete(move |()| {
            if let (Some(service), Some(live)) = (service.upgrade(), weak_live.upgrade()) {
                service.on_complete(live);
            }
        });
    }

    fn on_complete(self: &Arc<Self>, live: Arc<LiveTestResult>) {
        let is_running = {
            let mut results = lock(&self.results);
            // Runs in progress sort as if they completed at the end of time.
            results.sort_by_key(|result| {
                Reverse(result.completed_at().unwrap_or(DateTime::<Utc>::MAX_UTC))
            });
            results.iter().any(|result| result.completed_at().is_none())
        };

        self.is_running.set(is_running);
        self.schedule_persist();
        self.results_changed
            .fire(&ResultChangeEvent::Completed(live));
    }

    fn schedule_persist(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime available, skipping result persistence");
            return;
        };

        let service = Arc::downgrade(self);
        let delay = self.config.persist_delay;
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(service) = service.upgrade() {
                service.persist_now().await;
            }
        });

        if let Some(previous) = lock(&self.pending_persist).replace(task) {
            previous.abort();
        }
    }

    async fn persist_now(self: &Arc<Self>) {
        // Merge history first so that results not yet loaded aren't dropped.
        self.load().await;

        let serialized: Vec<_> = lock(&self.results)
            .iter()
            .filter(|result| result.persist())
            .filter_map(|result| result.to_serialized())
            .collect();
        debug!(count = serialized.len(), "persisting test results");
        if let Err(error) = self.storage.persist(serialized).await {
            warn!(%error, "failed to persist test results");
        }
    }
}
