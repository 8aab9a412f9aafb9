//! Configuration loader
//!
//! ## Loading Strategy
//! 1. Load `.env` from the working directory if present
//! 2. Read the file named by `MAPLINK_CONFIG`, or the first file found by
//!    [`probe_config_paths`], or fall back to defaults
//! 3. Apply `MAPLINK_*` environment overrides
//! 4. Validate every section
//!
//! ## Environment Variables
//! - `MAPLINK_CONFIG`: explicit config file path
//! - `MAPLINK_LOG_FILTER`, `MAPLINK_LOG_FORMAT` (`pretty`/`json`)
//! - `MAPLINK_RETRY_MAX_ATTEMPTS`, `MAPLINK_RETRY_INITIAL_DELAY_MS`,
//!   `MAPLINK_RETRY_MAX_DELAY_MS`, `MAPLINK_RETRY_JITTER`,
//!   `MAPLINK_RETRY_TIMEOUT_MS`, `MAPLINK_RETRY_CAUTION_MAX_ATTEMPTS`
//! - `MAPLINK_BREAKER_FAILURE_THRESHOLD`, `MAPLINK_BREAKER_SUCCESS_THRESHOLD`,
//!   `MAPLINK_BREAKER_RECOVERY_TIMEOUT_MS`,
//!   `MAPLINK_BREAKER_MAX_RECOVERY_ATTEMPTS`
//! - `MAPLINK_HEALTH_INTERVAL_MS`, `MAPLINK_HEALTH_WINDOW_SIZE`,
//!   `MAPLINK_HEALTH_DEGRADED_LATENCY_MS`, `MAPLINK_HEALTH_PROBE_TIMEOUT_MS`
//!
//! ## File Locations
//! Probed in order, first match wins:
//! 1. `./maplink.toml`, `./maplink.json`, `./config.toml`, `./config.json`
//! 2. The same names one directory up
//! 3. The same names next to the executable

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use maplink_common::error::ConfigError;
use maplink_common::observability::LogFormat;
use tracing::{debug, info};

use super::MapLinkConfig;

const CONFIG_FILE_NAMES: [&str; 4] = ["maplink.toml", "maplink.json", "config.toml", "config.json"];

/// Load, override and validate the configuration
///
/// A missing config file is not an error; defaults are used instead.
///
/// # Errors
///
/// Returns [`ConfigError`] if `MAPLINK_CONFIG` names a missing file, a file
/// cannot be parsed, an override is malformed, or validation fails.
pub fn load() -> Result<MapLinkConfig, ConfigError> {
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
        Err(e) if e.not_found() => {}
        Err(e) => debug!(error = %e, "Ignoring unreadable .env file"),
    }

    let mut config = match std::env::var("MAPLINK_CONFIG") {
        Ok(path) => load_from_file(Some(PathBuf::from(path)))?,
        Err(_) => match probe_config_paths() {
            Some(path) => load_from_file(Some(path))?,
            None => {
                info!("No config file found, using defaults");
                MapLinkConfig::default()
            }
        },
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. The format is chosen
/// by extension (`.toml` or `.json`). The result is not validated.
///
/// # Errors
///
/// [`ConfigError::NotFound`] if no file exists, [`ConfigError::Io`] if it
/// cannot be read, [`ConfigError::Parse`] if it cannot be parsed.
pub fn load_from_file(path: Option<PathBuf>) -> Result<MapLinkConfig, ConfigError> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::NotFound { path: p.display().to_string() });
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| ConfigError::NotFound {
            path: "any of the standard locations".to_string(),
        })?,
    };

    info!(path = %config_path.display(), "Loading configuration from file");
    let contents = std::fs::read_to_string(&config_path)?;
    parse_config(&contents, &config_path)
}

/// Parse configuration contents; the format comes from `path`'s extension
fn parse_config(contents: &str, path: &Path) -> Result<MapLinkConfig, ConfigError> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| ConfigError::Parse { format: "TOML".to_string(), message: e.to_string() }),
        "json" => serde_json::from_str(contents)
            .map_err(|e| ConfigError::Parse { format: "JSON".to_string(), message: e.to_string() }),
        other => Err(ConfigError::Parse {
            format: other.to_string(),
            message: "unsupported config format, expected .toml or .json".to_string(),
        }),
    }
}

/// Find the first existing config file in the standard locations
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd.clone());
        roots.push(cwd.join(".."));
    }

    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        roots.push(exe_dir);
    }

    roots
        .iter()
        .flat_map(|root| CONFIG_FILE_NAMES.iter().map(move |name| root.join(name)))
        .find(|candidate| candidate.exists())
}

/// Apply `MAPLINK_*` environment overrides in place
///
/// Unset variables leave the current value alone.
///
/// # Errors
///
/// [`ConfigError::Env`] naming the variable whose value cannot be parsed.
pub fn apply_env_overrides(config: &mut MapLinkConfig) -> Result<(), ConfigError> {
    if let Ok(filter) = std::env::var("MAPLINK_LOG_FILTER") {
        config.logging.filter = filter;
    }
    if let Some(format) = env_parse::<LogFormatOverride>("MAPLINK_LOG_FORMAT")? {
        config.logging.format = format.0;
    }

    let retry = &mut config.retry;
    set_from_env(&mut retry.max_attempts, "MAPLINK_RETRY_MAX_ATTEMPTS")?;
    set_millis_from_env(&mut retry.initial_delay, "MAPLINK_RETRY_INITIAL_DELAY_MS")?;
    set_millis_from_env(&mut retry.max_delay, "MAPLINK_RETRY_MAX_DELAY_MS")?;
    set_millis_from_env(&mut retry.per_attempt_timeout, "MAPLINK_RETRY_TIMEOUT_MS")?;
    if let Some(EnvBool(jitter)) = env_parse("MAPLINK_RETRY_JITTER")? {
        retry.jitter_enabled = jitter;
    }
    if let Some(attempts) = env_parse("MAPLINK_RETRY_CAUTION_MAX_ATTEMPTS")? {
        retry.caution_max_attempts = Some(attempts);
    }

    let breaker = &mut config.circuit_breaker;
    set_from_env(&mut breaker.failure_threshold, "MAPLINK_BREAKER_FAILURE_THRESHOLD")?;
    set_from_env(&mut breaker.success_threshold, "MAPLINK_BREAKER_SUCCESS_THRESHOLD")?;
    set_millis_from_env(&mut breaker.recovery_timeout, "MAPLINK_BREAKER_RECOVERY_TIMEOUT_MS")?;
    set_from_env(&mut breaker.max_recovery_attempts, "MAPLINK_BREAKER_MAX_RECOVERY_ATTEMPTS")?;

    let health = &mut config.health;
    set_millis_from_env(&mut health.interval, "MAPLINK_HEALTH_INTERVAL_MS")?;
    set_from_env(&mut health.window_size, "MAPLINK_HEALTH_WINDOW_SIZE")?;
    set_millis_from_env(&mut health.degraded_latency, "MAPLINK_HEALTH_DEGRADED_LATENCY_MS")?;
    set_millis_from_env(&mut health.probe_timeout, "MAPLINK_HEALTH_PROBE_TIMEOUT_MS")?;

    Ok(())
}

struct LogFormatOverride(LogFormat);

impl FromStr for LogFormatOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self(LogFormat::Pretty)),
            "json" => Ok(Self(LogFormat::Json)),
            other => Err(format!("unknown log format '{other}', expected pretty or json")),
        }
    }
}

/// Boolean override value
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
struct EnvBool(bool);

impl FromStr for EnvBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Self(true)),
            "0" | "false" | "no" | "off" => Ok(Self(false)),
            other => Err(format!("'{other}' is not a boolean, expected true or false")),
        }
    }
}

/// Parse an optional environment variable
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Env { variable: key.to_string(), message: e.to_string() }),
        Err(_) => Ok(None),
    }
}

fn set_from_env<T>(target: &mut T, key: &str) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = env_parse(key)? {
        *target = value;
    }
    Ok(())
}

fn set_millis_from_env(target: &mut Duration, key: &str) -> Result<(), ConfigError> {
    if let Some(ms) = env_parse::<u64>(key)? {
        *target = Duration::from_millis(ms);
    }
    Ok(())
}
