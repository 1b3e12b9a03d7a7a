// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testhub.

use camino::Utf8PathBuf;
use config::ConfigError;
use std::io;
use thiserror::Error;

/// An error that occurred while loading the testhub config.
#[derive(Debug, Error)]
#[error("failed to parse testhub config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }
}

/// An error that occurred while reading or writing persisted results.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResultStoreError {
    /// Creating the store directory failed.
    #[error("error creating result store directory `{dir}`")]
    DirCreate {
        /// The directory that could not be created.
        dir: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Reading the result list failed.
    #[error("error reading result list from `{path}`")]
    ResultListRead {
        /// The file that could not be read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The result list could not be deserialized.
    #[error("error deserializing result list from `{path}`")]
    ResultListDeserialize {
        /// The file that could not be deserialized.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The result list could not be serialized.
    #[error("error serializing result list for `{path}`")]
    ResultListSerialize {
        /// The file the list was destined for.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// Writing the result list failed.
    #[error("error writing result list to `{path}`")]
    ResultListWrite {
        /// The file that could not be written.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: atomicwrites::Error<io::Error>,
    },

    /// Reading the output of a result failed.
    #[error("error reading output file `{path}`")]
    OutputRead {
        /// The file that could not be read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Removing the output of a discarded result failed.
    #[error("error removing output file `{path}`")]
    OutputRemove {
        /// The file that could not be removed.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while reading or writing small pieces of workspace
/// state, such as the exclusion set.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateStoreError {
    /// Reading the state file failed.
    #[error("error reading state from `{path}`")]
    Read {
        /// The state file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The state file could not be parsed.
    #[error("error deserializing state from `{path}`")]
    Deserialize {
        /// The state file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The state could not be serialized.
    #[error("error serializing state for `{path}`")]
    Serialize {
        /// The state file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// Writing the state file failed.
    #[error("error writing state to `{path}`")]
    Write {
        /// The state file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: atomicwrites::Error<io::Error>,
    },

    /// A value could not be encoded for storage.
    #[error("error encoding value for key `{key}`")]
    Encode {
        /// The key being written.
        key: String,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// A stored value could not be decoded.
    #[error("error decoding stored value for key `{key}`")]
    Decode {
        /// The key whose value was malformed.
        key: String,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error reported by a test controller, or by the channel used to reach it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// The controller reported a failure.
    #[error("controller `{controller_id}` failed: {message}")]
    Failed {
        /// The controller that failed.
        controller_id: String,
        /// The failure message.
        message: String,
    },

    /// The controller went away while a request was outstanding.
    #[error("controller `{controller_id}` disconnected")]
    Disconnected {
        /// The controller that disconnected.
        controller_id: String,
    },
}

impl ControllerError {
    /// Creates a [`ControllerError::Failed`].
    pub fn failed(controller_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            controller_id: controller_id.into(),
            message: message.into(),
        }
    }
}
