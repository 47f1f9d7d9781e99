use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::{RecoveryPolicy, DEFAULT_RETRIES};
use crate::error::{ImportError, Result};
use crate::model::RecoverStrategy;
use crate::reactor::Backoff;

const CONFIG_DIR: &str = "entity-import";
const CONFIG_FILE: &str = "config.yaml";

/// Poll schedule of the task reactor, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReactorConfig {
    pub initial_ms: u64,
    pub step_ms: u64,
    pub max_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            step_ms: 1000,
            max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub recover: RecoverStrategy,
    pub retries: u32,
    pub reactor: ReactorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            username: None,
            password: None,
            data_dir: None,
            logfile: None,
            recover: RecoverStrategy::default(),
            retries: DEFAULT_RETRIES,
            reactor: ReactorConfig::default(),
        }
    }
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub recover: Option<RecoverStrategy>,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

impl Config {
    /// Read `path`, or the default location when `path` is `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ImportError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::parse(&raw)
            .map_err(|e| ImportError::Config(format!("'{}': {e}", path.display())))
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if overrides.server.is_some() {
            self.server = overrides.server;
        }
        if overrides.username.is_some() {
            self.username = overrides.username;
        }
        if overrides.password.is_some() {
            self.password = overrides.password;
        }
        if overrides.data_dir.is_some() {
            self.data_dir = overrides.data_dir;
        }
        if overrides.logfile.is_some() {
            self.logfile = overrides.logfile;
        }
        if let Some(recover) = overrides.recover {
            self.recover = recover;
        }
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| home().join(".transition_data"))
    }

    pub fn logfile(&self) -> PathBuf {
        self.logfile
            .clone()
            .unwrap_or_else(|| home().join("import.log"))
    }

    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            strategy: self.recover,
            retries: self.retries,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::from_millis(
            self.reactor.initial_ms,
            self.reactor.step_ms,
            self.reactor.max_ms,
        )
    }

    /// Server and credentials, required for anything that talks to the target.
    pub fn credentials(&self) -> Result<(&str, &str, &str)> {
        let missing = |what: &str| {
            ImportError::Config(format!(
                "no {what} configured (set it in the config file or pass --{what})"
            ))
        };
        let server = self.server.as_deref().ok_or_else(|| missing("server"))?;
        let username = self.username.as_deref().ok_or_else(|| missing("username"))?;
        let password = self.password.as_deref().ok_or_else(|| missing("password"))?;
        Ok((server, username, password))
    }
}
