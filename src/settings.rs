//! Floodcast application settings
use std::time::Duration;

use crate::config_error;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_RETRY_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_RETRY_INTERVAL_MS: &str = "1000";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    // Pause between dissemination retry rounds
    pub retry_interval: Duration,

    // Log output format (logs always go to stderr)
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(STANDARD_RETRY_INTERVAL_MS),
            log_format: LogFormat::Text,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval.is_zero() {
            return Err(config_error!("retry interval must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_zero_retry_interval_rejected() {
        let settings = Settings {
            retry_interval: Duration::ZERO,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert!(Settings::default().validate().is_ok());
    }
}
