use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keystage_domain::ResourceKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::apply::{ExecutorOptions, RetryPolicy};
use crate::error::ConfigError;
use crate::providers::{ExecProvider, ProviderRegistry};
use crate::workflow::DEFAULT_LOCK_TTL_SECS;

pub const CONFIG_FILE_NAME: &str = "keystage.toml";
pub const STATE_DIR_NAME: &str = ".keystage";
pub const STATE_FILE_NAME: &str = "state.json";
/// One year.
pub const MAX_LOCK_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;
/// One hour.
pub const MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;

/// Settings read from `keystage.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Execution record location; relative paths resolve against the
    /// manifest root.
    pub state_path: Option<PathBuf>,
    pub concurrency: usize,
    pub fail_fast: bool,
    pub lock_timeout_secs: u64,
    pub retry: RetryConfig,
    pub log: LogConfig,
    pub plugins: Vec<PluginConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: None,
            concurrency: ExecutorOptions::default().concurrency,
            fail_fast: false,
            lock_timeout_secs: DEFAULT_LOCK_TTL_SECS.unsigned_abs(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
            plugins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: u64::try_from(policy.initial_backoff.as_millis())
                .unwrap_or(u64::MAX),
            max_backoff_ms: u64::try_from(policy.max_backoff.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// An external provider binary and the resource kinds it handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub kinds: Vec<String>,
}

impl Config {
    /// Read and validate a config file. Relative plugin commands resolve
    /// against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(base) = path.parent() {
            for plugin in &mut config.plugins {
                let command = Path::new(&plugin.command);
                if command.is_relative() && command.components().count() > 1 {
                    plugin.command = base.join(command).to_string_lossy().into_owned();
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        if self.retry.max_backoff_ms > MAX_BACKOFF_MS {
            return Err(invalid(format!(
                "retry.max_backoff_ms must not exceed {MAX_BACKOFF_MS}"
            )));
        }
        if self.lock_timeout_secs == 0 {
            return Err(invalid("lock_timeout_secs must be at least 1"));
        }
        if self.lock_timeout_secs > MAX_LOCK_TIMEOUT_SECS {
            return Err(invalid(format!(
                "lock_timeout_secs must not exceed {MAX_LOCK_TIMEOUT_SECS}"
            )));
        }

        let mut names = BTreeSet::new();
        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(invalid("plugins.name must not be empty"));
            }
            if !names.insert(plugin.name.as_str()) {
                return Err(invalid(format!(
                    "plugin \"{}\" is declared twice",
                    plugin.name
                )));
            }
            if plugin.command.trim().is_empty() {
                return Err(invalid(format!(
                    "plugin \"{}\" needs a command",
                    plugin.name
                )));
            }
            if plugin.kinds.is_empty() || plugin.kinds.iter().any(|kind| kind.trim().is_empty()) {
                return Err(invalid(format!(
                    "plugin \"{}\" must list at least one non-empty kind",
                    plugin.name
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            concurrency: self.concurrency,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            },
            fail_fast: self.fail_fast,
        }
    }

    /// Lock time-to-live, capped at [`MAX_LOCK_TIMEOUT_SECS`].
    #[must_use]
    pub fn lock_ttl(&self) -> chrono::Duration {
        let seconds = self.lock_timeout_secs.min(MAX_LOCK_TIMEOUT_SECS);
        chrono::Duration::try_seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
            .unwrap_or(chrono::Duration::MAX)
    }

    #[must_use]
    pub fn state_path(&self, manifest_root: &Path) -> PathBuf {
        match &self.state_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => manifest_root.join(path),
            None => manifest_root.join(STATE_DIR_NAME).join(STATE_FILE_NAME),
        }
    }

    /// Configured plugins first, then the built-in providers.
    #[must_use]
    pub fn provider_registry(&self) -> ProviderRegistry {
        let plugins = self
            .plugins
            .iter()
            .map(|plugin| {
                let kinds: BTreeSet<ResourceKind> = plugin
                    .kinds
                    .iter()
                    .filter_map(|kind| kind.parse().ok())
                    .collect();
                ExecProvider::new(
                    plugin.name.clone(),
                    plugin.command.clone(),
                    plugin.args.clone(),
                    kinds,
                )
            })
            .collect();
        ProviderRegistry::with_plugins(plugins)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Candidate config files, most specific first.
#[must_use]
pub fn config_candidates(explicit: Option<&Path>, manifest_root: &Path) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut candidates = vec![manifest_root.join(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("keystage").join("config.toml"));
    }
    candidates
}

/// Load the first config file found, or the defaults.
///
/// An explicit path must exist; implicit locations are skipped when absent.
///
/// # Errors
///
/// Returns an error when the chosen file cannot be read, parsed or validated.
pub fn load_config(
    explicit: Option<&Path>,
    manifest_root: &Path,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    for candidate in config_candidates(explicit, manifest_root) {
        if explicit.is_some() || candidate.is_file() {
            debug!(path = %candidate.display(), "loading config");
            return Config::from_file(&candidate).map(|config| (config, Some(candidate)));
        }
    }
    Ok((Config::default(), None))
}
