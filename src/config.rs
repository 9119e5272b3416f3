//! Runtime configuration read from environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::instance::{InstanceConfig, ProcessMatch};
use crate::keep_alive::{self, KeepAliveConfig};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Required for `run` only; `status` and `cleanup` work without it.
    pub token: Option<SecretString>,
    pub api_base: String,
    pub poll_timeout: Duration,
}

impl TelegramConfig {
    pub fn require_token(&self) -> Result<SecretString, ConfigError> {
        self.token
            .clone()
            .ok_or_else(|| ConfigError::MissingEnvVar("BOT_TOKEN".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub telegram: TelegramConfig,
    pub keep_alive: KeepAliveConfig,
    pub instance: InstanceConfig,
    pub log_json: bool,
}

impl Config {
    /// Read the process environment.
    pub fn from_env(home_override: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), home_override)
    }

    /// Build the configuration from `lookup`, which returns a variable's
    /// value or `None` when unset.
    pub fn from_lookup<F>(lookup: F, home_override: Option<&Path>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let home = match home_override {
            Some(dir) => dir.to_path_buf(),
            None => match get("DECISTRIP_HOME") {
                Some(dir) => PathBuf::from(dir),
                None => dirs::home_dir()
                    .map(|h| h.join(".decistrip"))
                    .ok_or(ConfigError::NoHomeDirectory)?,
            },
        };

        let telegram = TelegramConfig {
            token: get("BOT_TOKEN").map(SecretString::from),
            api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            poll_timeout: Duration::from_secs(parse_or(&get, "TELEGRAM_POLL_TIMEOUT_SECS", 30)?),
        };

        let mut keep_alive =
            KeepAliveConfig::on_port(parse_or(&get, "PORT", KeepAliveConfig::DEFAULT_PORT)?);
        keep_alive.external_url = get("RENDER_EXTERNAL_URL");
        keep_alive.public_url = keep_alive::public_url(
            get("REPL_SLUG").as_deref(),
            get("REPL_OWNER").as_deref(),
        );

        let mut instance = InstanceConfig::in_dir(&home);
        instance.port = parse_or(&get, "DECISTRIP_LOCK_PORT", InstanceConfig::DEFAULT_PORT)?;
        instance.process_pattern = get("DECISTRIP_PROCESS_PATTERN")
            .map(ProcessMatch::CommandLine)
            .or_else(|| current_exe_name().map(ProcessMatch::Executable));
        let deadline: u64 = parse_or(&get, "DECISTRIP_SHUTDOWN_TIMEOUT_SECS", 30)?;
        if deadline == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DECISTRIP_SHUTDOWN_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        instance.shutdown_deadline = Duration::from_secs(deadline);

        Ok(Self {
            home,
            telegram,
            keep_alive,
            instance,
            log_json: parse_bool(&get, "DECISTRIP_LOG_JSON")?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

fn parse_bool<G>(get: &G, key: &str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

fn current_exe_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}
