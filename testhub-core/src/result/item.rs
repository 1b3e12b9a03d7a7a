// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;
use testhub_metadata::{
    ControllerId, SerializedTaskState, SerializedTestResultItem, TestId, TestItem, TestMessage,
    TestResultState,
};

/// The state of a test within one task of a run.
pub type TaskState = SerializedTaskState;

/// A test as recorded in a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResultItem {
    /// The item as it was when added to the run.
    pub item: TestItem,
    /// The owning controller.
    pub controller_id: ControllerId,
    /// The parent test within this result, if any.
    pub parent: Option<TestId>,
    /// Children of this test within this result, in the order they were
    /// added.
    pub children: Vec<TestId>,
    /// State per task, in task order.
    pub tasks: Vec<TaskState>,
    /// The most significant state among this test's own tasks.
    pub own_computed_state: TestResultState,
    /// The most significant state among this test and its descendants.
    pub computed_state: TestResultState,
    /// Whether the test's definition changed after the run started.
    pub retired: bool,
    /// The test's own duration, if reported.
    pub own_duration: Option<Duration>,
}

impl TestResultItem {
    pub(crate) fn new(
        controller_id: ControllerId,
        parent: Option<TestId>,
        item: TestItem,
        task_count: usize,
    ) -> Self {
        Self {
            item,
            controller_id,
            parent,
            children: Vec::new(),
            tasks: vec![TaskState::default(); task_count],
            own_computed_state: TestResultState::Unset,
            computed_state: TestResultState::Unset,
            retired: false,
            own_duration: None,
        }
    }

    /// Returns the test's ID.
    pub fn id(&self) -> &TestId {
        &self.item.ext_id
    }

    /// Iterates over every message recorded for the test, across tasks.
    pub fn messages(&self) -> impl Iterator<Item = &TestMessage> + '_ {
        self.tasks.iter().flat_map(|task| task.messages.iter())
    }

    pub(crate) fn to_serialized(&self) -> SerializedTestResultItem {
        SerializedTestResultItem {
            controller_id: self.controller_id.clone(),
            parent: self.parent.clone(),
            item: self.item.clone(),
            tasks: self.tasks.clone(),
            own_computed_state: self.own_computed_state,
            computed_state: self.computed_state,
            retired: self.retired,
            own_duration: self.own_duration,
        }
    }

    pub(crate) fn from_serialized(serialized: SerializedTestResultItem) -> Self {
        Self {
            item: serialized.item,
            controller_id: serialized.controller_id,
            parent: serialized.parent,
            children: Vec::new(),
            tasks: serialized.tasks,
            own_computed_state: serialized.own_computed_state,
            computed_state: serialized.computed_state,
            retired: serialized.retired,
            own_duration: serialized.own_duration,
        }
    }
}

/// Why a [`TestResultItemChange`] was emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestResultItemChangeReason {
    /// The test was retired.
    Retired,

    /// The test's computed state changed because a descendant changed.
    ComputedStateChange,

    /// One of the test's own task states changed.
    OwnStateChange {
        /// The test's own computed state before the change.
        previous_state: TestResultState,
        /// The test's own duration before the change.
        previous_own_duration: Option<Duration>,
    },

    /// A message was recorded for the test.
    NewMessage {
        /// The message.
        message: TestMessage,
    },
}

/// A change to a test within a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResultItemChange {
    /// The test after the change.
    pub item: TestResultItem,
    /// The result the test belongs to.
    pub result_id: String,
    /// Why the change happened.
    pub reason: TestResultItemChangeReason,
}
