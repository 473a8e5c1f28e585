// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the hybrid overlay master configuration file

use crate::allocator::ClusterSubnet;
use crate::nbctl::NbctlConfig;
use crate::node::PlatformClassifier;
use crate::watch::WatchConfig;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog_error_chain::SlogInlineError;
use thiserror::Error;

/// Configuration for the hybrid overlay master
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Process-wide logging configuration.
    pub log: ConfigLogging,
    /// Ranges from which target-platform nodes get host subnets, in the
    /// order they are used.
    pub cluster_subnets: Vec<ClusterSubnet>,
    /// How target-platform nodes are recognized.
    #[serde(default)]
    pub platform: PlatformClassifier,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub nbctl: NbctlConfig,
}

impl Config {
    /// Load and validate a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config_parsed
            .validate()
            .map_err(|err| LoadError::Validation { path: path.into(), err })?;
        Ok(config_parsed)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cluster_subnets.is_empty() {
            return Err(ValidationError::NoClusterSubnets);
        }
        if self.watch.workers == 0 {
            return Err(ValidationError::NoWorkers);
        }
        Ok(())
    }

    /// Build the root logger described by `log`.
    pub fn to_logger(&self) -> Result<Logger, std::io::Error> {
        self.log.to_logger("hybrid-overlay")
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ValidationError {
    #[error("at least one cluster subnet must be configured")]
    NoClusterSubnets,
    #[error("watch.workers must be greater than zero")]
    NoWorkers,
}

#[derive(Debug, Error, SlogInlineError)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid configuration in \"{path}\"")]
    Validation {
        path: Utf8PathBuf,
        #[source]
        err: ValidationError,
    },
}
