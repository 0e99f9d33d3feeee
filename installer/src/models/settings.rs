// Installer settings
//
// Loaded with the `config` crate from an optional `installer.toml` plus `INSTALLER__*`
// environment variables (`INSTALLER__MIGRATOR__PROGRAM=php`). Relative paths are resolved
// against the directory holding the settings file.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::path_resolver::resolve_relative;

pub const DEFAULT_SETTINGS_FILE: &str = "installer.toml";
pub const DEFAULT_ENVIRONMENT_FILE: &str = "env.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct SetupSettings {
    /// Display name used when no application is resolvable yet.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Version of the application being installed.
    #[serde(default = "default_version")]
    pub version: semver::Version,
    /// Root of the generated configuration tree.
    #[serde(default = "default_environment_path")]
    pub environment_path: PathBuf,
    /// The generated environment file; defaults to `<environment_path>/env.toml`.
    #[serde(default)]
    pub environment_file: Option<PathBuf>,
    /// Root holding one template directory per environment profile.
    #[serde(default = "default_templates_path")]
    pub templates_path: PathBuf,
    #[serde(default = "default_template_suffix")]
    pub template_suffix: String,
    #[serde(default)]
    pub migrator: MigratorSettings,
    #[serde(default)]
    pub database: ConnectSettings,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigratorSettings {
    #[serde(default = "default_migrator_program")]
    pub program: String,
    #[serde(default = "default_migrator_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// No timeout unless set; a stuck migrator blocks the pass.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for MigratorSettings {
    fn default() -> Self {
        Self {
            program: default_migrator_program(),
            args: default_migrator_args(),
            working_dir: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_connect_retries")]
    pub max_retries: u32,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_connect_retries(),
        }
    }
}

impl ConnectSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

fn default_app_name() -> String {
    "Application".to_string()
}

fn default_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

fn default_environment_path() -> PathBuf {
    PathBuf::from("config")
}

fn default_templates_path() -> PathBuf {
    PathBuf::from("environment-templates")
}

fn default_template_suffix() -> String {
    ".sample".to_string()
}

fn default_migrator_program() -> String {
    "php".to_string()
}

fn default_migrator_args() -> Vec<String> {
    vec!["yii".to_string()]
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_connect_retries() -> u32 {
    3
}

impl SetupSettings {
    /// Load settings. An explicit path must exist; otherwise `installer.toml` in the current
    /// directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_SETTINGS_FILE), false),
        };

        let raw = Config::builder()
            .add_source(
                File::from(file.as_path())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix("INSTALLER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("migrator.args"),
            )
            .build()
            .with_context(|| format!("Failed to read installer settings: {:?}", file))?;

        let mut settings: SetupSettings = raw
            .try_deserialize()
            .with_context(|| format!("Invalid installer settings: {:?}", file))?;

        let base = match file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        settings.rebase(&base);
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with every default, rooted at `base`.
    pub fn rooted_at(base: &Path) -> Self {
        let mut settings = SetupSettings {
            name: default_app_name(),
            version: default_version(),
            environment_path: default_environment_path(),
            environment_file: None,
            templates_path: default_templates_path(),
            template_suffix: default_template_suffix(),
            migrator: MigratorSettings::default(),
            database: ConnectSettings::default(),
            log_dir: None,
        };
        settings.rebase(base);
        settings
    }

    fn rebase(&mut self, base: &Path) {
        self.environment_path = resolve_relative(base, &self.environment_path);
        self.templates_path = resolve_relative(base, &self.templates_path);
        self.environment_file = self
            .environment_file
            .as_ref()
            .map(|p| resolve_relative(base, p));
        self.migrator.working_dir = self
            .migrator
            .working_dir
            .as_ref()
            .map(|p| resolve_relative(base, p));
        self.log_dir = self.log_dir.as_ref().map(|p| resolve_relative(base, p));
    }

    fn validate(&self) -> Result<()> {
        if self.template_suffix.trim().is_empty() {
            anyhow::bail!("template_suffix cannot be empty");
        }
        if self.name.trim().is_empty() {
            anyhow::bail!("name cannot be empty");
        }
        Ok(())
    }

    pub fn environment_file_path(&self) -> PathBuf {
        self.environment_file
            .clone()
            .unwrap_or_else(|| self.environment_path.join(DEFAULT_ENVIRONMENT_FILE))
    }
}
