// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Result states, messages and the persisted form of a run result.

use crate::{
    item::{Location, TestItem},
    test_id::{ControllerId, TestId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// The state of a test within one task of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestResultState {
    /// No state has been reported.
    #[default]
    Unset,
    /// The test will run but hasn't started.
    Queued,
    /// The test is running.
    Running,
    /// The test passed.
    Passed,
    /// The test failed an assertion.
    Failed,
    /// The test was skipped.
    Skipped,
    /// The test could not be run, for example because of a timeout.
    Errored,
}

impl TestResultState {
    /// Returns how significant this state is when summarizing several states.
    ///
    /// Higher wins: `Running > Errored > Failed > Queued > Passed > Skipped > Unset`.
    pub fn priority(self) -> u8 {
        match self {
            Self::Unset => 0,
            Self::Skipped => 1,
            Self::Passed => 2,
            Self::Queued => 3,
            Self::Failed => 4,
            Self::Errored => 5,
            Self::Running => 6,
        }
    }

    /// Returns true for states that represent a finished execution.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Skipped | Self::Errored
        )
    }

    /// Returns true if the test is queued or running.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Returns true if the state indicates a failure.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed | Self::Errored)
    }
}

impl fmt::Display for TestResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unset => "not yet run",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Returns the most significant of the given states, or
/// [`TestResultState::Unset`] if there are none.
pub fn max_priority(states: impl IntoIterator<Item = TestResultState>) -> TestResultState {
    states
        .into_iter()
        .max_by_key(|state| state.priority())
        .unwrap_or_default()
}

/// A message attached to a test within a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TestMessage {
    /// A failure or diagnostic message.
    Error {
        /// The message text.
        message: String,
        /// Expected value, for assertion failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<String>,
        /// Actual value, for assertion failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actual: Option<String>,
        /// Where the message originated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<Location>,
    },

    /// A reference to a slice of the run's output.
    Output {
        /// The output text, stripped of terminal escapes.
        message: String,
        /// Byte offset of the output within the run's output stream.
        offset: u64,
        /// Length of the output in bytes.
        length: u64,
        /// Where the output was produced.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<Location>,
    },
}

impl TestMessage {
    /// Creates an error message with only text.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            expected: None,
            actual: None,
            location: None,
        }
    }
}

/// Coverage counts for one kind of element in a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredCount {
    /// Number of covered elements.
    pub covered: u32,
    /// Total number of elements.
    pub total: u32,
}

/// Coverage summary for a single file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    /// The file's URI.
    pub uri: String,
    /// Statement coverage.
    pub statement: CoveredCount,
    /// Branch coverage, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<CoveredCount>,
    /// Function coverage, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<CoveredCount>,
}

/// A task that ran as part of a result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunTask {
    /// The task ID, unique within the run.
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether the task is still running.
    pub running: bool,
}

/// The persisted state of a test within one task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedTaskState {
    /// The reported state.
    pub state: TestResultState,
    /// How long the test took.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    /// Messages reported for the test.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<TestMessage>,
}

/// The persisted state of a single test in a result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTestResultItem {
    /// The owning controller.
    pub controller_id: ControllerId,
    /// The parent test, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TestId>,
    /// The item as it was when the run completed.
    pub item: TestItem,
    /// State per task, in task order.
    pub tasks: Vec<SerializedTaskState>,
    /// The summarized state of this test's own tasks.
    pub own_computed_state: TestResultState,
    /// The summarized state including all descendants.
    pub computed_state: TestResultState,
    /// Whether the test was retired while the run was live.
    #[serde(default)]
    pub retired: bool,
    /// The test's own duration, if any task reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_duration: Option<Duration>,
}

/// The persisted form of a completed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTestResult {
    /// The result ID.
    pub id: String,
    /// When the run completed.
    pub completed_at: DateTime<Utc>,
    /// Human-readable name of the run.
    #[serde(default)]
    pub name: String,
    /// Tasks that ran.
    pub tasks: Vec<TestRunTask>,
    /// Per-test states.
    pub test_states: Vec<SerializedTestResultItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use TestResultState::*;
    use test_case::test_case;

    #[test_case(&[], Unset ; "empty")]
    #[test_case(&[Passed, Unset], Passed ; "explicit beats unset")]
    #[test_case(&[Passed, Failed], Failed ; "failed beats passed")]
    #[test_case(&[Errored, Running], Running ; "running beats all")]
    #[test_case(&[Skipped, Passed], Passed ; "passed beats skipped")]
    #[test_case(&[Queued, Passed], Queued ; "queued beats passed")]
    fn max_priority_picks_most_significant(states: &[TestResultState], expected: TestResultState) {
        assert_eq!(max_priority(states.iter().copied()), expected);
    }

    #[test]
    fn messages_are_tagged() {
        let message = TestMessage::Output {
            message: "hello".to_owned(),
            offset: 4,
            length: 5,
            location: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(serde_json::from_value::<TestMessage>(json).unwrap(), message);
    }
}
