use keystage_engine::{LogConfig, LogFormat};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::CliError;

/// Takes precedence over `--log-level` and the config file.
pub const LOG_ENV: &str = "KEYSTAGE_LOG";

/// Build the log filter from, in order: `KEYSTAGE_LOG`, the command line,
/// the config file.
pub fn log_filter(
    env_value: Option<&str>,
    cli_level: Option<&str>,
    config: &LogConfig,
) -> Result<EnvFilter, CliError> {
    let directives = env_value
        .filter(|value| !value.trim().is_empty())
        .or(cli_level)
        .unwrap_or(&config.level);
    EnvFilter::try_new(directives).map_err(|source| CliError::LogFilter {
        filter: directives.to_string(),
        source,
    })
}

/// Install the global subscriber. Logs go to stderr so that rendered reports
/// on stdout stay machine-readable. A second call is a no-op.
pub fn init_logging(filter: EnvFilter, format: LogFormat) {
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("log subscriber already installed");
    }
}
