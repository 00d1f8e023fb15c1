//! Node configuration for the history subsystem.
//!
//! Configuration is a plain [`serde`] struct: assemble it in code, load it
//! from a JSON file, or pick up scalar overrides from the environment (via
//! `dotenvy`, so a `.env` file works in development). Keys mirror the
//! operator-facing names exactly, e.g. `CATCHUP_RECENT` and
//! `ARTIFICIALLY_ACCELERATE_TIME_FOR_TESTING`.

use std::path::Path;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::catchup::{CatchupConfiguration, CatchupMode};
use crate::checkpoint::CheckpointFrequency;

/// Shell-style command templates for one configured archive.
///
/// Templates accept positional placeholders: `{0}` is the source and `{1}`
/// the destination. Chronicle treats these as a configuration contract only;
/// process transport lives outside this crate.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ArchiveCommands {
    #[serde(default, rename = "getCmd")]
    pub get_cmd: Option<String>,
    #[serde(default, rename = "putCmd")]
    pub put_cmd: Option<String>,
    #[serde(default, rename = "mkdirCmd")]
    pub mkdir_cmd: Option<String>,
}

impl ArchiveCommands {
    /// An archive is writable when it can both create directories and put
    /// files.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.put_cmd.is_some() && self.mkdir_cmd.is_some()
    }

    /// Substitute `{0}`/`{1}` placeholders in a template.
    #[must_use]
    pub fn format(template: &str, source: &str, dest: &str) -> String {
        template.replace("{0}", source).replace("{1}", dest)
    }
}

/// Recognised configuration keys for the history subsystem.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    /// Archive name → command templates.
    pub history: FxHashMap<String, ArchiveCommands>,
    /// How many recent ledgers to replay during catchup; `None` means
    /// complete replay from the local last-closed ledger.
    pub catchup_recent: Option<u32>,
    /// Equivalent to `CATCHUP_RECENT = ∞`: always replay the full gap.
    pub catchup_complete: bool,
    /// Use checkpoint frequency 8 instead of 64.
    pub artificially_accelerate_time_for_testing: bool,
    /// When false, genesis is derived from a real archive state instead of
    /// the built-in one.
    pub use_config_for_genesis: bool,
    /// Protocol version carried into ledger headers and bucket metadata.
    pub ledger_protocol_version: u32,
    /// SQLite URL for the durable publish queue.
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history: FxHashMap::default(),
            catchup_recent: None,
            catchup_complete: true,
            artificially_accelerate_time_for_testing: false,
            use_config_for_genesis: true,
            ledger_protocol_version: 1,
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    #[diagnostic(code(chronicle::config::read))]
    Read { path: String, message: String },

    #[error("malformed config: {0}")]
    #[diagnostic(
        code(chronicle::config::parse),
        help("Check key spelling; recognised keys are SCREAMING_SNAKE_CASE.")
    )]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {message}")]
    #[diagnostic(code(chronicle::config::value))]
    Value { key: &'static str, message: String },
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply scalar overrides from the environment on top of `self`.
    ///
    /// Reads `.env` when present. Only the scalar keys are resolvable this
    /// way; the `HISTORY` archive map stays file/code-configured.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        if let Ok(v) = std::env::var("CATCHUP_RECENT") {
            let parsed = v.parse::<u32>().map_err(|e| ConfigError::Value {
                key: "CATCHUP_RECENT",
                message: e.to_string(),
            })?;
            self.catchup_recent = Some(parsed);
            self.catchup_complete = false;
        }
        if let Ok(v) = std::env::var("CATCHUP_COMPLETE") {
            self.catchup_complete = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("ARTIFICIALLY_ACCELERATE_TIME_FOR_TESTING") {
            self.artificially_accelerate_time_for_testing = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CHRONICLE_DATABASE_URL") {
            self.database_url = v;
        }
        Ok(self)
    }

    #[must_use]
    pub fn checkpoint_frequency(&self) -> CheckpointFrequency {
        if self.artificially_accelerate_time_for_testing {
            CheckpointFrequency::ACCELERATED
        } else {
            CheckpointFrequency::PRODUCTION
        }
    }

    /// Build the catchup configuration for a target ledger.
    ///
    /// `CATCHUP_COMPLETE` wins over `CATCHUP_RECENT`; otherwise a missing
    /// `CATCHUP_RECENT` also means complete replay.
    #[must_use]
    pub fn catchup_configuration(&self, to_ledger: u32, mode: CatchupMode) -> CatchupConfiguration {
        let recent = if self.catchup_complete {
            None
        } else {
            self.catchup_recent
        };
        CatchupConfiguration {
            to_ledger,
            recent,
            mode,
        }
    }
}
