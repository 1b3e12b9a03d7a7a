// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{OutputSink, TestResultStorage};
use crate::{errors::ResultStoreError, helpers::lock, result::HistoricalTestResult};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use testhub_metadata::SerializedTestResult;

/// Result storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryResultStorage {
    results: Mutex<Vec<SerializedTestResult>>,
    outputs: Mutex<HashMap<String, Arc<MemoryOutputSink>>>,
    persist_count: Mutex<usize>,
}

impl MemoryResultStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `results`, most recent first.
    pub fn with_results(results: Vec<SerializedTestResult>) -> Self {
        Self {
            results: Mutex::new(results),
            ..Default::default()
        }
    }

    /// Returns the results most recently passed to `persist`.
    pub fn persisted(&self) -> Vec<SerializedTestResult> {
        lock(&self.results).clone()
    }

    /// Returns how many times `persist` was called.
    pub fn persist_count(&self) -> usize {
        *lock(&self.persist_count)
    }
}

impl TestResultStorage for MemoryResultStorage {
    fn read(&self) -> BoxFuture<'_, Result<Vec<HistoricalTestResult>, ResultStoreError>> {
        let results = lock(&self.results)
            .iter()
            .cloned()
            .map(HistoricalTestResult::from_serialized)
            .collect();
        futures::future::ready(Ok(results)).boxed()
    }

    fn persist(
        &self,
        results: Vec<SerializedTestResult>,
    ) -> BoxFuture<'_, Result<(), ResultStoreError>> {
        let previous = std::mem::replace(&mut *lock(&self.results), results.clone());
        {
            let mut outputs = lock(&self.outputs);
            for dropped in previous
                .iter()
                .filter(|old| !results.iter().any(|result| result.id == old.id))
            {
                outputs.remove(&dropped.id);
            }
        }
        *lock(&self.persist_count) += 1;
        futures::future::ready(Ok(())).boxed()
    }

    fn output_sink(&self, result_id: &str) -> Arc<dyn OutputSink> {
        lock(&self.outputs)
            .entry(result_id.to_owned())
            .or_default()
            .clone()
    }

    fn read_output(
        &self,
        result_id: &str,
    ) -> BoxFuture<'_, Result<Option<Bytes>, ResultStoreError>> {
        let output = lock(&self.outputs)
            .get(result_id)
            .map(|sink| Bytes::from(lock(&sink.buffer).clone()));
        futures::future::ready(Ok(output)).boxed()
    }
}

/// An output sink backed by a growable buffer.
#[derive(Debug, Default)]
pub struct MemoryOutputSink {
    buffer: Mutex<Vec<u8>>,
}

impl OutputSink for MemoryOutputSink {
    fn append(&self, data: &[u8]) {
        lock(&self.buffer).extend_from_slice(data);
    }
}
