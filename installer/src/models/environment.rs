// Generated environment file (read side)
//
// The environment file is produced by template rendering. Reading it back gives the
// installer the "domain environment signals": database / cache parameters, the current
// environment profile, the recorded version and the issued secrets. Process environment
// variables (`APP__DATABASE__HOST=…`) overlay the file.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::database::connection::ConnectionParams;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSection {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisParams {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSignals {
    #[serde(default)]
    pub version: Option<String>,
    /// Current environment profile (template directory name).
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub cookie_validation_key: Option<String>,
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub database: Option<ConnectionParams>,
    #[serde(default)]
    pub redis: Option<RedisParams>,
}

impl EnvironmentSignals {
    /// Read the environment file at `path` with the `APP__*` overlay.
    ///
    /// Returns `Ok(None)` when the file does not exist (not environmented yet); an existing
    /// but unreadable file is an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }

        let raw = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read environment file: {:?}", path))?;

        let signals: EnvironmentSignals = raw
            .try_deserialize()
            .with_context(|| format!("Invalid environment file: {:?}", path))?;
        Ok(Some(signals))
    }

    /// Version the environment was generated for, when recorded and parseable.
    pub fn instance_version(&self) -> Option<semver::Version> {
        self.version
            .as_deref()
            .and_then(|v| semver::Version::parse(v.trim()).ok())
    }

    /// Issued salt, ignoring blank values.
    pub fn salt(&self) -> Option<&str> {
        non_blank(&self.salt)
    }

    /// Issued cookie validation key, ignoring blank values.
    pub fn cookie_validation_key(&self) -> Option<&str> {
        non_blank(&self.cookie_validation_key)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}
