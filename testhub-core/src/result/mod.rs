// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test run results.
//!
//! A run starts out as a [`LiveTestResult`], which controllers update while the
//! run is in progress. Once stored and loaded again, a run is a
//! [`HistoricalTestResult`]. [`ResultRef`] refers to either.

mod historical;
mod item;
mod live;

pub use historical::*;
pub use item::*;
pub use live::*;

use chrono::{DateTime, Utc};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use std::sync::Arc;
use testhub_metadata::{SerializedTestResult, TestId, TestResultState};

/// The kind of [`ResultUuid`].
pub enum ResultUuidKind {}

impl TypedUuidKind for ResultUuidKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("testhub-result");
        TAG
    }
}

/// A unique ID for a test run.
pub type ResultUuid = TypedUuid<ResultUuidKind>;

/// A live or historical result.
#[derive(Clone, Debug)]
pub enum ResultRef {
    /// A run in progress, or a run that completed in this process.
    Live(Arc<LiveTestResult>),
    /// A run loaded from storage.
    Historical(Arc<HistoricalTestResult>),
}

impl ResultRef {
    /// Returns the result ID.
    pub fn id(&self) -> &str {
        match self {
            Self::Live(result) => result.id(),
            Self::Historical(result) => result.id(),
        }
    }

    /// Returns when the run completed, or `None` while it is running.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Live(result) => result.completed_at(),
            Self::Historical(result) => Some(result.completed_at()),
        }
    }

    /// Returns the recorded state of a test.
    pub fn get_state_by_id(&self, test_id: &TestId) -> Option<TestResultItem> {
        match self {
            Self::Live(result) => result.get_state_by_id(test_id),
            Self::Historical(result) => result.get_state_by_id(test_id).cloned(),
        }
    }

    /// Returns the computed state of a test, or `Unset` if it isn't in the
    /// result.
    pub fn computed_state(&self, test_id: &TestId) -> TestResultState {
        self.get_state_by_id(test_id)
            .map_or(TestResultState::Unset, |item| item.computed_state)
    }

    /// Returns every test in the result.
    pub fn tests(&self) -> Vec<TestResultItem> {
        match self {
            Self::Live(result) => result.tests(),
            Self::Historical(result) => result.tests().cloned().collect(),
        }
    }

    /// Returns the persisted form, or `None` for runs that are still going.
    pub fn to_serialized(&self) -> Option<SerializedTestResult> {
        match self {
            Self::Live(result) => result.to_serialized(),
            Self::Historical(result) => Some(result.to_serialized()),
        }
    }

    /// Returns whether the result should be written to storage once complete.
    pub fn persist(&self) -> bool {
        match self {
            Self::Live(result) => result.persist(),
            Self::Historical(_) => true,
        }
    }

    /// Returns the live result, if this is one.
    pub fn as_live(&self) -> Option<&Arc<LiveTestResult>> {
        match self {
            Self::Live(result) => Some(result),
            Self::Historical(_) => None,
        }
    }

    /// Returns true if both refer to the same result object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Live(a), Self::Live(b)) => Arc::ptr_eq(a, b),
            (Self::Historical(a), Self::Historical(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Arc<LiveTestResult>> for ResultRef {
    fn from(result: Arc<LiveTestResult>) -> Self {
        Self::Live(result)
    }
}

impl From<HistoricalTestResult> for ResultRef {
    fn from(result: HistoricalTestResult) -> Self {
        Self::Historical(Arc::new(result))
    }
}
