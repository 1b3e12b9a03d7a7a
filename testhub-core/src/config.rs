// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for testhub.

use crate::errors::ConfigParseError;
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::time::Duration;

/// Overall configuration for testhub.
///
/// The configuration is layered: the embedded default config is read first,
/// then the workspace's `.config/testhub.toml` (or an explicitly passed file)
/// is merged on top of it.
#[derive(Clone, Debug)]
pub struct TestHubConfig {
    workspace_root: Utf8PathBuf,
    inner: TestHubConfigImpl,
}

impl TestHubConfig {
    /// The default location of the config within the workspace root.
    pub const CONFIG_PATH: &'static str = ".config/testhub.toml";

    /// Contains the default config as a TOML file.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the config from `config_file`, or if not specified from
    /// `.config/testhub.toml` in the workspace root.
    ///
    /// A missing workspace config is not an error: the defaults are used.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let inner = Self::make_default_config()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new(config_file, err))?;

        Ok(Self {
            workspace_root,
            inner,
        })
    }

    /// Parses a config from a TOML string layered over the defaults.
    ///
    /// `origin` is only used to attribute errors.
    pub fn from_toml_str(
        workspace_root: impl Into<Utf8PathBuf>,
        origin: &Utf8Path,
        contents: &str,
    ) -> Result<Self, ConfigParseError> {
        let inner = Self::make_default_config()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new(origin, err))?;

        Ok(Self {
            workspace_root: workspace_root.into(),
            inner,
        })
    }

    /// Returns the default config.
    pub fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let inner = Self::make_default_config()
            .build()
            .expect("default config is always valid")
            .try_deserialize()
            .expect("default config is always valid");
        Self {
            workspace_root: workspace_root.into(),
            inner,
        }
    }

    /// Returns the workspace root.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the result retention settings.
    pub fn results(&self) -> &ResultsConfig {
        &self.inner.results
    }

    /// Returns the absolute directory where results and workspace state are
    /// stored.
    pub fn store_dir(&self) -> Utf8PathBuf {
        self.workspace_root.join(&self.inner.storage.dir)
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }
}

/// Settings for how many results are kept, and how eagerly they're written.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ResultsConfig {
    /// The maximum number of completed results to retain.
    pub retain_max: usize,

    /// How long to wait after a completion before persisting.
    #[serde(with = "humantime_serde")]
    pub persist_delay: Duration,
}

impl ResultsConfig {
    /// The default number of completed results to retain.
    pub const DEFAULT_RETAIN_MAX: usize = 128;

    /// The default persistence debounce delay.
    pub const DEFAULT_PERSIST_DELAY: Duration = Duration::from_millis(500);
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            retain_max: Self::DEFAULT_RETAIN_MAX,
            persist_delay: Self::DEFAULT_PERSIST_DELAY,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TestHubConfigImpl {
    results: ResultsConfig,
    storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StorageConfig {
    dir: Utf8PathBuf,
}
