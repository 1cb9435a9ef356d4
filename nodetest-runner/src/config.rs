// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for nodetest.
//!
//! Configuration is read from `nodetest.toml` at the workspace root (or an explicitly passed
//! file), layered over the defaults in `default-config.toml`.

use crate::{
    errors::{ConcurrencyParseError, ConfigParseError},
    helpers::get_num_cpus,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use nodetest_protocol::{ExtensionConfig, Isolation};
use serde::Deserialize;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};
use tracing::warn;

/// The number of test files run at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Concurrency {
    /// Run a specified number of files at once.
    Count(usize),

    /// Run as many files at once as there are logical CPUs.
    #[default]
    NumCpus,
}

impl Concurrency {
    /// Gets the actual concurrency computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(count) => count,
            Self::NumCpus => get_num_cpus(),
        }
    }

    fn from_signed(n: i64) -> Self {
        match n.cmp(&0) {
            Ordering::Greater => Self::Count(n as usize),
            Ordering::Equal => Self::NumCpus,
            Ordering::Less => Self::Count((get_num_cpus() as i64 + n).max(1) as usize),
        }
    }
}

impl FromStr for Concurrency {
    type Err = ConcurrencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        s.parse::<i64>()
            .map(Self::from_signed)
            .map_err(|_| ConcurrencyParseError::new(s))
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for Concurrency {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Concurrency;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "an integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(Concurrency::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Concurrency::from_signed(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Concurrency::Count(v as usize))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Handles warnings produced while reading configuration.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a config file.
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    );
}

/// The default [`ConfigWarnings`] implementation, which logs warnings through `tracing`.
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    ) {
        let mut unknown_str = String::new();
        if let [key] = unknown.iter().collect::<Vec<_>>().as_slice() {
            // Print this on the same line.
            unknown_str.push_str("key: ");
            unknown_str.push_str(key);
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!(
            "in config file {}, ignoring unknown configuration {unknown_str}",
            config_file
                .strip_prefix(workspace_root)
                .unwrap_or(config_file),
        )
    }
}

/// Overall configuration for nodetest.
#[derive(Clone, Debug)]
pub struct NodetestConfig {
    workspace_root: Utf8PathBuf,
    inner: NodetestConfigDeserialize,
}

impl NodetestConfig {
    /// The default location of the config within the workspace root.
    pub const CONFIG_PATH: &'static str = "nodetest.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the nodetest config from the given file, or if not specified from
    /// `nodetest.toml` in the workspace root.
    ///
    /// If the file isn't specified and the default location doesn't exist, the default config is
    /// used.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
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

        let builder = Self::make_default_config().add_source(source);
        let (inner, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|err| ConfigParseError::new(&config_file, err))?;

        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, &workspace_root, &unknown);
        }

        Ok(Self {
            workspace_root,
            inner,
        })
    }

    /// Returns the default nodetest config.
    #[cfg(test)]
    pub(crate) fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let config = Self::make_default_config()
            .build()
            .expect("default config is always valid");

        let mut unknown = BTreeSet::new();
        let inner: NodetestConfigDeserialize =
            serde_ignored::deserialize(config, |path: serde_ignored::Path| {
                unknown.insert(path.to_string());
            })
            .expect("default config is always valid");

        // Make sure there aren't any unknown keys in the default config, since it is
        // embedded/shipped with this binary.
        assert!(
            unknown.is_empty(),
            "found unknown keys in default config: {unknown:?}",
        );

        Self {
            workspace_root: workspace_root.into(),
            inner,
        }
    }

    /// Returns the workspace root that relative paths are resolved against.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the configured concurrency.
    pub fn concurrency(&self) -> Concurrency {
        self.inner.concurrency
    }

    /// Returns the configured Node.js executable, if any.
    ///
    /// Bare program names are returned as is so that they can be searched for on `PATH`.
    pub fn node_path(&self) -> Option<Utf8PathBuf> {
        self.inner.node_path.as_deref().map(|path| {
            if path.components().count() > 1 {
                self.workspace_root.join(path)
            } else {
                path.to_owned()
            }
        })
    }

    /// Returns the configured worker executable, if any.
    pub fn worker_path(&self) -> Option<Utf8PathBuf> {
        self.inner
            .worker_path
            .as_deref()
            .map(|path| self.workspace_root.join(path))
    }

    /// Returns true if test process output should be echoed in full.
    pub fn verbose(&self) -> bool {
        self.inner.verbose
    }

    /// Returns the configured isolation mode.
    pub fn isolation(&self) -> Isolation {
        self.inner.isolation
    }

    /// Returns true if test processes should be forced to exit once their tests complete.
    pub fn force_exit(&self) -> bool {
        self.inner.force_exit
    }

    /// Returns the V8 coverage output directory, if configured.
    pub fn coverage_dir(&self) -> Option<Utf8PathBuf> {
        self.inner
            .coverage_dir
            .as_deref()
            .map(|path| self.workspace_root.join(path))
    }

    /// Returns the extra environment for test processes.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.inner.env
    }

    /// Returns per-extension runtime parameters.
    pub fn extensions(&self) -> &[ExtensionConfig] {
        &self.inner.extensions
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(NodetestConfigDeserialize, BTreeSet<String>), ConfigError> {
        let config = builder.build_cloned()?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config = NodetestConfigDeserialize::deserialize(ignored_de)?;

        Ok((config, ignored))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct NodetestConfigDeserialize {
    concurrency: Concurrency,
    #[serde(default)]
    node_path: Option<Utf8PathBuf>,
    #[serde(default)]
    worker_path: Option<Utf8PathBuf>,
    verbose: bool,
    isolation: Isolation,
    force_exit: bool,
    #[serde(default)]
    coverage_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    extensions: Vec<ExtensionConfig>,
}
