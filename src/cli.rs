//! CLI for this application
//!
use std::time::Duration;

use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[clap(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Pause between dissemination retry rounds
    #[clap(
        long,
        default_value = settings::DEFAULT_RETRY_INTERVAL_MS,
        env("FLOODCAST_RETRY_INTERVAL_MS"),
        help = "Milliseconds to wait between broadcast retry rounds"
    )]
    pub retry_interval_ms: u64,

    // Log output format
    #[clap(
        long,
        default_value = "text",
        env("FLOODCAST_LOG_FORMAT"),
        help = "log-format: 'text' or 'json' (logs are written to stderr)"
    )]
    pub log_format: settings::LogFormat,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        settings::Settings {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            log_format: self.log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_cli_defaults() {
        let settings = Cli::parse_from(["floodcast"]).into_settings();
        assert_eq!(settings.retry_interval, Duration::from_secs(1));
        assert_eq!(settings.log_format, settings::LogFormat::Text);
    }

    #[test]
    fn test_cli_overrides() {
        let settings = Cli::parse_from([
            "floodcast",
            "--retry-interval-ms",
            "250",
            "--log-format",
            "json",
        ])
        .into_settings();
        assert_eq!(settings.retry_interval, Duration::from_millis(250));
        assert_eq!(settings.log_format, settings::LogFormat::Json);
    }
}
