// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{OutputSink, TestResultStorage};
use crate::{errors::ResultStoreError, helpers::lock, result::HistoricalTestResult};
use atomicwrites::{AllowOverwrite, AtomicFile};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, FutureExt};
use std::{
    collections::HashSet,
    fmt::Write as _,
    fs::{File, OpenOptions},
    io::{self, Write},
    sync::{Arc, Mutex},
};
use testhub_metadata::SerializedTestResult;
use tracing::{debug, warn};

static RESULTS_JSON_FILE_NAME: &str = "results.json";
static OUTPUT_DIR_NAME: &str = "output";
static OUTPUT_EXTENSION: &str = "log";

/// Stores results in a directory.
///
/// The layout is:
///
/// ```text
/// <dir>/results.json        completed results, most recent first
/// <dir>/output/<id>.log     raw output of each run
/// ```
#[derive(Debug)]
pub struct FileResultStorage {
    dir: Utf8PathBuf,
    retain_max: usize,
}

impl FileResultStorage {
    /// Creates a store rooted at `dir`, keeping at most `retain_max` results.
    pub fn new(dir: impl Into<Utf8PathBuf>, retain_max: usize) -> Result<Self, ResultStoreError> {
        let dir = dir.into();
        let output_dir = dir.join(OUTPUT_DIR_NAME);
        std::fs::create_dir_all(&output_dir).map_err(|error| ResultStoreError::DirCreate {
            dir: output_dir,
            error,
        })?;
        Ok(Self { dir, retain_max })
    }

    /// Returns the directory the store is rooted at.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn results_json_path(&self) -> Utf8PathBuf {
        self.dir.join(RESULTS_JSON_FILE_NAME)
    }

    fn output_path(&self, result_id: &str) -> Utf8PathBuf {
        self.dir.join(OUTPUT_DIR_NAME).join(output_file_name(result_id))
    }

    fn read_sync(&self) -> Result<Vec<SerializedTestResult>, ResultStoreError> {
        let path = self.results_json_path();
        match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|error| ResultStoreError::ResultListDeserialize { path, error }),
            // If the file doesn't exist, nothing has been persisted yet.
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(error) => Err(ResultStoreError::ResultListRead { path, error }),
        }
    }

    fn persist_sync(&self, mut results: Vec<SerializedTestResult>) -> Result<(), ResultStoreError> {
        results.truncate(self.retain_max);

        // Output is only discarded for results that were stored before and
        // are being dropped now. Live runs have never been stored, so their
        // output is left alone.
        let previous = self.read_sync().unwrap_or_else(|error| {
            warn!(%error, "failed to read previous results, not pruning output");
            Vec::new()
        });

        let path = self.results_json_path();
        let json = serde_json::to_string_pretty(&results).map_err(|error| {
            ResultStoreError::ResultListSerialize {
                path: path.clone(),
                error,
            }
        })?;
        AtomicFile::new(&path, AllowOverwrite)
            .write(|file| file.write_all(json.as_bytes()))
            .map_err(|error| ResultStoreError::ResultListWrite { path, error })?;

        let kept: HashSet<_> = results.iter().map(|result| result.id.as_str()).collect();
        for dropped in previous
            .iter()
            .filter(|result| !kept.contains(result.id.as_str()))
        {
            let output_path = self.output_path(&dropped.id);
            debug!(path = %output_path, "removing output of discarded result");
            match std::fs::remove_file(&output_path) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    return Err(ResultStoreError::OutputRemove {
                        path: output_path,
                        error,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Returns the output file name for a result.
///
/// Result IDs come from controllers. Bytes other than ASCII alphanumerics,
/// `-` and `_` are written as `%xx`, so the name never contains a path
/// separator or `..` and distinct IDs map to distinct files.
fn output_file_name(result_id: &str) -> String {
    let mut name = String::with_capacity(result_id.len() + OUTPUT_EXTENSION.len() + 1);
    for byte in result_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(char::from(byte));
        } else {
            // Writing to a String can't fail.
            let _ = write!(name, "%{byte:02x}");
        }
    }
    let _ = write!(name, ".{OUTPUT_EXTENSION}");
    name
}

impl TestResultStorage for FileResultStorage {
    fn read(&self) -> BoxFuture<'_, Result<Vec<HistoricalTestResult>, ResultStoreError>> {
        async move {
            let results = self.read_sync()?;
            Ok(results
                .into_iter()
                .map(HistoricalTestResult::from_serialized)
                .collect())
        }
        .boxed()
    }

    fn persist(
        &self,
        results: Vec<SerializedTestResult>,
    ) -> BoxFuture<'_, Result<(), ResultStoreError>> {
        async move { self.persist_sync(results) }.boxed()
    }

    fn output_sink(&self, result_id: &str) -> Arc<dyn OutputSink> {
        Arc::new(FileOutputSink {
            path: self.output_path(result_id),
            file: Mutex::new(None),
        })
    }

    fn read_output(
        &self,
        result_id: &str,
    ) -> BoxFuture<'_, Result<Option<Bytes>, ResultStoreError>> {
        let path = self.output_path(result_id);
        async move {
            match std::fs::read(&path) {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(error) => Err(ResultStoreError::OutputRead { path, error }),
            }
        }
        .boxed()
    }
}

/// Appends a run's output to a file, opening it on first write.
#[derive(Debug)]
struct FileOutputSink {
    path: Utf8PathBuf,
    file: Mutex<Option<File>>,
}

impl OutputSink for FileOutputSink {
    fn append(&self, data: &[u8]) {
        let mut file = lock(&self.file);
        if file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(opened) => *file = Some(opened),
                Err(error) => {
                    warn!(path = %self.path, %error, "failed to open output file");
                    return;
                }
            }
        }

        if let Some(file) = file.as_mut()
            && let Err(error) = file.write_all(data)
        {
            warn!(path = %self.path, %error, "failed to write run output");
        }
    }
}
