// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{errors::StateStoreError, helpers::lock};
use atomicwrites::{AllowOverwrite, AtomicFile};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    collections::BTreeMap,
    io::{self, Write},
    sync::Mutex,
};

/// Keyed storage for small pieces of workspace state, such as the exclusion
/// set.
pub trait StateStorage: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>, StateStoreError>;

    /// Stores `value` under `key`.
    fn set(&self, key: &str, value: String) -> Result<(), StateStoreError>;

    /// Removes the value stored under `key`, if any.
    fn remove(&self, key: &str) -> Result<(), StateStoreError>;
}

/// State storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStateStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemoryStateStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StateStoreError> {
        lock(&self.values).insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateStoreError> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// State storage backed by a single JSON object on disk.
///
/// The file is read when the store is opened and rewritten atomically on
/// every change.
#[derive(Debug)]
pub struct JsonFileStateStorage {
    path: Utf8PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStateStorage {
    /// Opens the store at `path`. A missing file is treated as empty.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StateStoreError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).map_err(|error| {
                StateStoreError::Deserialize {
                    path: path.clone(),
                    error,
                }
            })?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(StateStoreError::Read { path, error }),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn write(&self, values: &BTreeMap<String, String>) -> Result<(), StateStoreError> {
        let json = serde_json::to_string_pretty(values).map_err(|error| {
            StateStoreError::Serialize {
                path: self.path.clone(),
                error,
            }
        })?;
        AtomicFile::new(&self.path, AllowOverwrite)
            .write(|file| file.write_all(json.as_bytes()))
            .map_err(|error| StateStoreError::Write {
                path: self.path.clone(),
                error,
            })
    }
}

impl StateStorage for JsonFileStateStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StateStoreError> {
        let mut values = lock(&self.values);
        values.insert(key.to_owned(), value);
        self.write(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StateStoreError> {
        let mut values = lock(&self.values);
        if values.remove(key).is_some() {
            self.write(&values)?;
        }
        Ok(())
    }
}
