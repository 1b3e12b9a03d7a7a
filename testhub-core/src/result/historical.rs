// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::item::TestResultItem;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use testhub_metadata::{SerializedTestResult, TestId, TestRunTask};

/// A completed result loaded from storage. Never changes once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoricalTestResult {
    id: String,
    completed_at: DateTime<Utc>,
    name: String,
    tasks: Vec<TestRunTask>,
    items: IndexMap<TestId, TestResultItem>,
}

impl HistoricalTestResult {
    /// Rebuilds a result from its persisted form. Children lists are
    /// reconstructed from the recorded parents.
    pub fn from_serialized(serialized: SerializedTestResult) -> Self {
        let mut items: IndexMap<_, _> = serialized
            .test_states
            .into_iter()
            .map(|state| {
                let item = TestResultItem::from_serialized(state);
                (item.id().clone(), item)
            })
            .collect();

        let edges: Vec<(TestId, TestId)> = items
            .values()
            .filter_map(|item| Some((item.parent.clone()?, item.id().clone())))
            .collect();
        for (parent, child) in edges {
            if let Some(parent) = items.get_mut(&parent) {
                parent.children.push(child);
            }
        }

        Self {
            id: serialized.id,
            completed_at: serialized.completed_at,
            name: serialized.name,
            tasks: serialized
                .tasks
                .into_iter()
                .map(|task| TestRunTask {
                    running: false,
                    ..task
                })
                .collect(),
            items,
        }
    }

    /// Returns the result ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns when the run completed.
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    /// Returns the result's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tasks that ran.
    pub fn tasks(&self) -> &[TestRunTask] {
        &self.tasks
    }

    /// Iterates over every test in the result.
    pub fn tests(&self) -> impl Iterator<Item = &TestResultItem> + '_ {
        self.items.values()
    }

    /// Returns the recorded state of a test.
    pub fn get_state_by_id(&self, test_id: &TestId) -> Option<&TestResultItem> {
        self.items.get(test_id)
    }

    /// Returns the persisted form of the result.
    pub fn to_serialized(&self) -> SerializedTestResult {
        SerializedTestResult {
            id: self.id.clone(),
            completed_at: self.completed_at,
            name: self.name.clone(),
            tasks: self.tasks.clone(),
            test_states: self.items.values().map(|item| item.to_serialized()).collect(),
        }
    }
}
