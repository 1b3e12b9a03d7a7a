// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::item::{TestResultItem, TestResultItemChange, TestResultItemChangeReason};
use crate::{
    events::{Emitter, ListenerId},
    helpers::lock,
    storage::OutputSink,
};
use chrono::{DateTime, Utc};
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use testhub_metadata::{
    FileCoverage, Location, ResolvedTestRunRequest, SerializedTestResult, TestId, TestItem,
    TestMessage, TestResultState, TestRunTask, max_priority,
};
use tokio::sync::OnceCell;
use tracing::debug;

/// Produces the coverage collected by a task. Resolved at most once.
pub trait CoverageProvider: Send + Sync {
    /// Fetches the coverage.
    fn resolve(&self) -> BoxFuture<'static, Vec<FileCoverage>>;
}

struct CoverageSlot {
    provider: Arc<dyn CoverageProvider>,
    resolved: OnceCell<Arc<Vec<FileCoverage>>>,
}

struct LiveTask {
    task: TestRunTask,
    coverage: Option<Arc<CoverageSlot>>,
}

impl fmt::Debug for LiveTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveTask")
            .field("task", &self.task)
            .field("has_coverage", &self.coverage.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct LiveState {
    tasks: Vec<LiveTask>,
    items: IndexMap<TestId, TestResultItem>,
    completed_at: Option<DateTime<Utc>>,
    output_len: u64,
}

/// A result that is still being produced by a run.
///
/// All mutation goes through the methods below. Change notifications are
/// delivered after the internal state has been updated and unlocked, so
/// listeners may read the result back.
pub struct LiveTestResult {
    id: String,
    persist: bool,
    request: ResolvedTestRunRequest,
    started_at: DateTime<Utc>,
    output: DebugIgnore<Arc<dyn OutputSink>>,
    state: Mutex<LiveState>,
    change: Emitter<TestResultItemChange>,
    complete: Emitter<()>,
}

impl fmt::Debug for LiveTestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveTestResult")
            .field("id", &self.id)
            .field("persist", &self.persist)
            .field("request", &self.request)
            .field("started_at", &self.started_at)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl LiveTestResult {
    /// Creates a live result writing its output to `output`.
    pub fn new(
        id: impl Into<String>,
        output: Arc<dyn OutputSink>,
        persist: bool,
        request: ResolvedTestRunRequest,
    ) -> Self {
        Self {
            id: id.into(),
            persist,
            request,
            started_at: Utc::now(),
            output: DebugIgnore(output),
            state: Mutex::new(LiveState::default()),
            change: Emitter::new(),
            complete: Emitter::new(),
        }
    }

    /// Returns the result ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns whether the result should be persisted once complete.
    pub fn persist(&self) -> bool {
        self.persist
    }

    /// Returns the request the run was started with.
    pub fn request(&self) -> &ResolvedTestRunRequest {
        &self.request
    }

    /// Returns when the run started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns when the run completed, or `None` while it is running.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).completed_at
    }

    /// Returns a human-readable name: the label of the first test added,
    /// with a count of the others.
    pub fn name(&self) -> String {
        let state = lock(&self.state);
        let mut leaves = state.items.values().filter(|item| item.children.is_empty());
        match leaves.next() {
            None => String::new(),
            Some(first) => match leaves.count() {
                0 => first.item.label.clone(),
                others => format!("{} and {others} more", first.item.label),
            },
        }
    }

    /// Returns the tasks that have been added to the run.
    pub fn tasks(&self) -> Vec<TestRunTask> {
        lock(&self.state)
            .tasks
            .iter()
            .map(|task| task.task.clone())
            .collect()
    }

    /// Returns every test in the run, in the order they were added.
    pub fn tests(&self) -> Vec<TestResultItem> {
        lock(&self.state).items.values().cloned().collect()
    }

    /// Returns the recorded state of a test.
    pub fn get_state_by_id(&self, test_id: &TestId) -> Option<TestResultItem> {
        lock(&self.state).items.get(test_id).cloned()
    }

    /// Returns the number of output bytes written so far.
    pub fn output_len(&self) -> u64 {
        lock(&self.state).output_len
    }

    /// Registers a listener for test changes.
    pub fn on_change(
        &self,
        callback: impl Fn(&TestResultItemChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.change.subscribe(callback)
    }

    /// Registers a listener called once the result completes.
    pub fn on_complete(&self, callback: impl Fn(&()) + Send + Sync + 'static) -> ListenerId {
        self.complete.subscribe(callback)
    }

    /// Adds a task. Every test already in the run gets an `Unset` state for
    /// it.
    pub fn add_task(&self, task: TestRunTask) {
        let mut state = lock(&self.state);
        for item in state.items.values_mut() {
            item.tasks.push(Default::default());
        }
        state.tasks.push(LiveTask {
            task,
            coverage: None,
        });
    }

    /// Adds a chain of tests to the run. The chain starts at the outermost
    /// test and ends with the test being run; every link not yet in the run
    /// is added with `Unset` states.
    pub fn add_test_chain_to_run(&self, controller_id: &str, chain: &[TestItem]) {
        let mut state = lock(&self.state);
        let task_count = state.tasks.len();
        let mut parent: Option<TestId> = None;

        for item in chain {
            let id = item.ext_id.clone();
            if let Some(existing) = state.items.get_mut(&id) {
                existing.item = item.clone();
                parent = Some(id);
                continue;
            }

            // The first link may hang off a test added by an earlier chain.
            let link_parent = parent.clone().or_else(|| {
                item.ext_id
                    .parent_id()
                    .filter(|parent_id| state.items.contains_key(parent_id))
            });
            if let Some(parent_item) = link_parent
                .as_ref()
                .and_then(|parent_id| state.items.get_mut(parent_id))
            {
                parent_item.children.push(id.clone());
            }

            state.items.insert(
                id.clone(),
                TestResultItem::new(controller_id.into(), link_parent, item.clone(), task_count),
            );
            parent = Some(id);
        }
    }

    /// Updates the state of a test within a task, then recomputes the
    /// computed states of the test and its ancestors.
    pub fn update_state(
        &self,
        test_id: &TestId,
        task_id: &str,
        new_state: TestResultState,
        duration: Option<Duration>,
    ) {
        let events = {
            let mut state = lock(&self.state);
            let Some(task_index) = state.task_index(task_id) else {
                debug!(result_id = %self.id, task_id, "ignoring state update for unknown task");
                return;
            };
            state.set_task_state(&self.id, test_id, task_index, new_state, duration)
        };
        self.fire_changes(events);
    }

    /// Appends raw output to the run.
    ///
    /// If both a test and a task are given, an output message referring to
    /// the appended bytes is also recorded for the test and returned.
    pub fn append_output(
        &self,
        data: &[u8],
        task_id: Option<&str>,
        location: Option<Location>,
        test_id: Option<&TestId>,
    ) -> Option<TestMessage> {
        let (offset, length) = {
            // Written under the state lock so that bytes reach the sink in
            // offset order.
            let mut state = lock(&self.state);
            let offset = state.output_len;
            let length = data.len() as u64;
            state.output_len += length;
            self.output.append(data);
            (offset, length)
        };

        let (Some(task_id), Some(test_id)) = (task_id, test_id) else {
            return None;
        };
        let message = TestMessage::Output {
            message: strip_ansi_escapes::strip_str(String::from_utf8_lossy(data)),
            offset,
            length,
            location,
        };
        self.append_message(test_id, task_id, message.clone());
        Some(message)
    }

    /// Records a message for a test within a task.
    pub fn append_message(&self, test_id: &TestId, task_id: &str, message: TestMessage) {
        let event = {
            let mut state = lock(&self.state);
            let Some(task_index) = state.task_index(task_id) else {
                debug!(result_id = %self.id, task_id, "ignoring message for unknown task");
                return;
            };
            let Some(item) = state.items.get_mut(test_id) else {
                debug!(
                    result_id = %self.id,
                    test_id = %test_id.display_path(),
                    "ignoring message for test not in run",
                );
                return;
            };
            item.tasks[task_index].messages.push(message.clone());
            TestResultItemChange {
                item: item.clone(),
                result_id: self.id.clone(),
                reason: TestResultItemChangeReason::NewMessage { message },
            }
        };
        self.change.fire(&event);
    }

    /// Marks tests as retired: their definitions changed after the run
    /// started. With `None`, every test in the run is retired; otherwise the
    /// named tests and their descendants are.
    pub fn mark_retired(&self, test_ids: Option<&[TestId]>) {
        let events: Vec<_> = {
            let mut state = lock(&self.state);
            state
                .items
                .values_mut()
                .filter(|item| !item.retired)
                .filter(|item| {
                    test_ids.is_none_or(|ids| {
                        ids.iter()
                            .any(|id| item.id() == id || item.id().is_child_of(id))
                    })
                })
                .map(|item| {
                    item.retired = true;
                    TestResultItemChange {
                        item: item.clone(),
                        result_id: self.id.clone(),
                        reason: TestResultItemChangeReason::Retired,
                    }
                })
                .collect()
        };
        self.fire_changes(events);
    }

    /// Marks a task complete. States of the task still queued or running are
    /// reset to `Unset`.
    pub fn mark_task_complete(&self, task_id: &str) {
        let events = {
            let mut state = lock(&self.state);
            let Some(task_index) = state.task_index(task_id) else {
                debug!(result_id = %self.id, task_id, "ignoring completion of unknown task");
                return;
            };
            state.mark_task_complete(&self.id, task_index)
        };
        self.fire_changes(events);
    }

    /// Signals that coverage for a task can be fetched from `provider`.
    pub fn signal_coverage_available(&self, task_id: &str, provider: Arc<dyn CoverageProvider>) {
        let mut state = lock(&self.state);
        match state.task_index(task_id) {
            Some(index) => {
                state.tasks[index].coverage = Some(Arc::new(CoverageSlot {
                    provider,
                    resolved: OnceCell::new(),
                }));
            }
            None => {
                debug!(result_id = %self.id, task_id, "ignoring coverage for unknown task");
            }
        }
    }

    /// Returns the coverage of a task, resolving it on first access. Returns
    /// `None` if no coverage was signalled for the task.
    pub async fn coverage(&self, task_id: &str) -> Option<Arc<Vec<FileCoverage>>> {
        let slot = {
            let state = lock(&self.state);
            let index = state.task_index(task_id)?;
            state.tasks[index].coverage.clone()?
        };
        let resolved = slot
            .resolved
            .get_or_init(|| async { Arc::new(slot.provider.resolve().await) })
            .await;
        Some(resolved.clone())
    }

    /// Completes the run: running tasks are completed and the completion time
    /// is recorded.
    ///
    /// Returns false, without notifying anyone, if the run had already
    /// completed.
    pub fn mark_complete(&self) -> bool {
        self.mark_complete_at(Utc::now())
    }

    /// Like [`Self::mark_complete`], with an explicit completion time.
    pub fn mark_complete_at(&self, completed_at: DateTime<Utc>) -> bool {
        let events = {
            let mut state = lock(&self.state);
            if state.completed_at.is_some() {
                debug!(result_id = %self.id, "result already complete");
                return false;
            }

            let mut events = Vec::new();
            for index in 0..state.tasks.len() {
                if state.tasks[index].task.running {
                    events.extend(state.mark_task_complete(&self.id, index));
                }
            }
            state.completed_at = Some(completed_at);
            events
        };

        self.fire_changes(events);
        self.complete.fire(&());
        true
    }

    /// Returns the persisted form of the result, or `None` if it hasn't
    /// completed yet.
    pub fn to_serialized(&self) -> Option<SerializedTestResult> {
        let name = self.name();
        let state = lock(&self.state);
        let completed_at = state.completed_at?;
        Some(SerializedTestResult {
            id: self.id.clone(),
            completed_at,
            name,
            tasks: state.tasks.iter().map(|task| task.task.clone()).collect(),
            test_states: state.items.values().map(|item| item.to_serialized()).collect(),
        })
    }

    fn fire_changes(&self, events: Vec<TestResultItemChange>) {
        for event in &events {
            self.change.fire(event);
        }
    }
}

impl LiveState {
    fn task_index(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.task.id == task_id)
    }

    fn mark_task_complete(
        &mut self,
        result_id: &str,
        task_index: usize,
    ) -> Vec<TestResultItemChange> {
        self.tasks[task_index].task.running = false;
        let in_progress: Vec<_> = self
            .items
            .iter()
            .filter(|(_, item)| item.tasks[task_index].state.is_in_progress())
            .map(|(id, _)| id.clone())
            .collect();

        in_progress
            .iter()
            .flat_map(|id| {
                self.set_task_state(result_id, id, task_index, TestResultState::Unset, None)
            })
            .collect()
    }

    fn set_task_state(
        &mut self,
        result_id: &str,
        test_id: &TestId,
        task_index: usize,
        new_state: TestResultState,
        duration: Option<Duration>,
    ) -> Vec<TestResultItemChange> {
        let Some(item) = self.items.get_mut(test_id) else {
            debug!(
                result_id,
                test_id = %test_id.display_path(),
                "ignoring state update for test not in run",
            );
            return Vec::new();
        };

        let task = &mut item.tasks[task_index];
        if task.state == new_state && duration.is_none() {
            return Vec::new();
        }
        task.state = new_state;
        if duration.is_some() {
            task.duration = duration;
        }

        let previous_state = item.own_computed_state;
        let previous_own_duration = item.own_duration;
        item.own_computed_state = max_priority(item.tasks.iter().map(|task| task.state));
        if duration.is_some() {
            item.own_duration = duration;
        }

        let mut events = Vec::new();
        self.refresh_computed_state(test_id);
        if let Some(item) = self.items.get(test_id) {
            events.push(TestResultItemChange {
                item: item.clone(),
                result_id: result_id.to_owned(),
                reason: TestResultItemChangeReason::OwnStateChange {
                    previous_state,
                    previous_own_duration,
                },
            });
        }

        // Walk up while computed states keep changing.
        let mut next = self.items.get(test_id).and_then(|item| item.parent.clone());
        while let Some(parent_id) = next {
            if !self.refresh_computed_state(&parent_id) {
                break;
            }
            let Some(parent) = self.items.get(&parent_id) else {
                break;
            };
            events.push(TestResultItemChange {
                item: parent.clone(),
                result_id: result_id.to_owned(),
                reason: TestResultItemChangeReason::ComputedStateChange,
            });
            next = parent.parent.clone();
        }

        events
    }

    /// Recomputes a test's computed state from its own state and its
    /// children's computed states. Returns true if it changed.
    fn refresh_computed_state(&mut self, test_id: &TestId) -> bool {
        let Some(item) = self.items.get(test_id) else {
            return false;
        };
        let computed = max_priority(
            std::iter::once(item.own_computed_state).chain(
                item.children
                    .iter()
                    .filter_map(|child| self.items.get(child))
                    .map(|child| child.computed_state),
            ),
        );

        match self.items.get_mut(test_id) {
            Some(item) if item.computed_state != computed => {
                item.computed_state = computed;
                true
            }
            _ => false,
        }
    }
}
