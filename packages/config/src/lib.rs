// ABOUTME: Runtime settings for the sandbox, container service and pipeline
// ABOUTME: Loads validated configuration from SANDCASTLE_* environment variables with defaults

pub mod constants;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use constants::*;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Failure-threshold gate settings for the container runtime
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub reset_after: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_after: Duration::from_millis(30_000),
        }
    }
}

/// Backoff settings for 409 conflict responses
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

/// HTTP readiness probe settings
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessSettings {
    pub max_attempts: u32,
    pub delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            delay: Duration::from_millis(1_000),
            request_timeout: Duration::from_millis(2_000),
        }
    }
}

/// Limits applied to every sandboxed command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSettings {
    pub timeout: Duration,
    pub max_output_chars: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_output_chars: 50_000,
        }
    }
}

/// Inclusive host port range handed out to session containers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || start > end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty or invalid",
                start, end
            )));
        }
        if end - start < 1 {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} must contain at least two ports",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 4000,
            end: 4999,
        }
    }
}

/// Complete set of runtime settings consumed by the core services
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub readiness: ReadinessSettings,
    pub command: CommandSettings,
    pub ports: PortRange,
    pub sandbox_root: PathBuf,
    pub database_url: String,
    pub runtime_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            readiness: ReadinessSettings::default(),
            command: CommandSettings::default(),
            ports: PortRange::default(),
            sandbox_root: PathBuf::from("./.sandcastle/sandboxes"),
            database_url: "sqlite://.sandcastle/sandcastle.db".to_string(),
            runtime_image: "node:20-alpine".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Unset variables fall back to defaults; set-but-unparsable values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let breaker = BreakerSettings {
            threshold: parse_or(&lookup, SANDCASTLE_BREAKER_THRESHOLD, defaults.breaker.threshold)?,
            reset_after: millis_or(
                &lookup,
                SANDCASTLE_BREAKER_RESET_MS,
                defaults.breaker.reset_after,
            )?,
        };
        if breaker.threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker threshold must be at least 1".to_string(),
            ));
        }

        let retry = RetrySettings {
            max_attempts: parse_or(
                &lookup,
                SANDCASTLE_RETRY_MAX_ATTEMPTS,
                defaults.retry.max_attempts,
            )?,
            delay: millis_or(&lookup, SANDCASTLE_RETRY_DELAY_MS, defaults.retry.delay)?,
            backoff_multiplier: parse_or(
                &lookup,
                SANDCASTLE_RETRY_BACKOFF_MULTIPLIER,
                defaults.retry.backoff_multiplier,
            )?,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry backoff multiplier must be a finite value >= 1.0".to_string(),
            ));
        }

        let readiness = ReadinessSettings {
            max_attempts: parse_or(
                &lookup,
                SANDCASTLE_READINESS_MAX_ATTEMPTS,
                defaults.readiness.max_attempts,
            )?,
            delay: millis_or(&lookup, SANDCASTLE_READINESS_DELAY_MS, defaults.readiness.delay)?,
            request_timeout: millis_or(
                &lookup,
                SANDCASTLE_READINESS_REQUEST_TIMEOUT_MS,
                defaults.readiness.request_timeout,
            )?,
        };
        if readiness.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "readiness attempts must be at least 1".to_string(),
            ));
        }

        let command = CommandSettings {
            timeout: Duration::from_secs(parse_or(
                &lookup,
                SANDCASTLE_COMMAND_TIMEOUT_SECS,
                defaults.command.timeout.as_secs(),
            )?),
            max_output_chars: parse_or(
                &lookup,
                SANDCASTLE_OUTPUT_MAX_CHARS,
                defaults.command.max_output_chars,
            )?,
        };

        let ports = PortRange::new(
            parse_or(&lookup, SANDCASTLE_PORT_RANGE_START, defaults.ports.start)?,
            parse_or(&lookup, SANDCASTLE_PORT_RANGE_END, defaults.ports.end)?,
        )?;

        let sandbox_root = lookup(SANDCASTLE_SANDBOX_ROOT)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.sandbox_root);
        let database_url = lookup(SANDCASTLE_DATABASE_URL)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.database_url);
        let runtime_image = lookup(SANDCASTLE_RUNTIME_IMAGE)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.runtime_image);

        let config = Self {
            breaker,
            retry,
            readiness,
            command,
            ports,
            sandbox_root,
            database_url,
            runtime_image,
        };
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        _ => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.command.timeout, Duration::from_secs(120));
        assert_eq!(config.command.max_output_chars, 50_000);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            (SANDCASTLE_BREAKER_THRESHOLD, "3"),
            (SANDCASTLE_BREAKER_RESET_MS, "1500"),
            (SANDCASTLE_RETRY_BACKOFF_MULTIPLIER, "1.5"),
            (SANDCASTLE_PORT_RANGE_START, "4000"),
            (SANDCASTLE_PORT_RANGE_END, "4002"),
            (SANDCASTLE_RUNTIME_IMAGE, "node:22-slim"),
        ]))
        .unwrap();

        assert_eq!(config.breaker.threshold, 3);
        assert_eq!(config.breaker.reset_after, Duration::from_millis(1500));
        assert_eq!(config.retry.backoff_multiplier, 1.5);
        assert_eq!(config.ports, PortRange { start: 4000, end: 4002 });
        assert_eq!(config.runtime_image, "node:22-slim");
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[(SANDCASTLE_RETRY_MAX_ATTEMPTS, "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: SANDCASTLE_RETRY_MAX_ATTEMPTS,
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[(SANDCASTLE_BREAKER_THRESHOLD, "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_multiplier_below_one_is_rejected() {
        let result =
            Config::from_lookup(lookup_from(&[(SANDCASTLE_RETRY_BACKOFF_MULTIPLIER, "0.5")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_non_finite_multiplier_is_rejected() {
        for raw in ["inf", "NaN", "-inf"] {
            let result =
                Config::from_lookup(lookup_from(&[(SANDCASTLE_RETRY_BACKOFF_MULTIPLIER, raw)]));
            assert!(matches!(result, Err(ConfigError::Invalid(_))), "{} accepted", raw);
        }
    }

    #[test]
    fn test_port_range_validation() {
        assert!(PortRange::new(4000, 4001).is_ok());
        assert!(PortRange::new(4001, 4000).is_err());
        assert!(PortRange::new(4000, 4000).is_err());
        assert!(PortRange::new(0, 10).is_err());
        assert_eq!(PortRange::new(4000, 4002).unwrap().iter().count(), 3);
    }
}
