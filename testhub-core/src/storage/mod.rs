// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable storage for results and small pieces of workspace state.
//!
//! The result service talks to storage only through [`TestResultStorage`], and
//! exclusions only through [`StateStorage`]. Directory-backed and in-memory
//! implementations of both are provided.

mod file;
mod memory;
mod state;

pub use file::*;
pub use memory::*;
pub use state::*;

use crate::{errors::ResultStoreError, result::HistoricalTestResult};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;
use testhub_metadata::SerializedTestResult;

/// Where completed results and run output are stored.
pub trait TestResultStorage: Send + Sync {
    /// Reads persisted results, most recent first.
    fn read(&self) -> BoxFuture<'_, Result<Vec<HistoricalTestResult>, ResultStoreError>>;

    /// Replaces the persisted results with `results`, most recent first.
    ///
    /// Output belonging to results that are no longer present may be
    /// discarded.
    fn persist(
        &self,
        results: Vec<SerializedTestResult>,
    ) -> BoxFuture<'_, Result<(), ResultStoreError>>;

    /// Returns the sink that a run's raw output is appended to.
    fn output_sink(&self, result_id: &str) -> Arc<dyn OutputSink>;

    /// Reads back the output of a run, if any was stored.
    fn read_output(&self, result_id: &str)
    -> BoxFuture<'_, Result<Option<Bytes>, ResultStoreError>>;
}

/// An append-only byte sink for the raw output of one run.
pub trait OutputSink: Send + Sync {
    /// Appends `data` to the output.
    fn append(&self, data: &[u8]);
}
