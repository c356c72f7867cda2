//! Environment-backed configuration for the smoke run.

use std::{env, path::PathBuf, str::FromStr};

use bridge_core::{Credentials, LogLevel, Platform, SessionConfig};
use thiserror::Error;

/// Cookies used when no real credentials are configured; the loopback engine
/// accepts any numeric account id.
const LOOPBACK_C_USER: &str = "100000000000001";
const LOOPBACK_XS: &str = "loopback";
const DEFAULT_THREAD_ID: i64 = 1;
const DEFAULT_MESSAGE: &str = "hello from bridge-smoke";

/// Runtime configuration of the smoke binary.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Options the session is created with.
    pub session: SessionConfig,
    /// Whether the credentials came from the environment.
    pub credentials_from_env: bool,
    /// Log level set explicitly through `MESSENGER_LOG_LEVEL`.
    pub log_level: Option<LogLevel>,
    /// Thread the smoke message is sent to.
    pub thread_id: i64,
    pub message: String,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let c_user = optional_trimmed_env("MESSENGER_C_USER", &mut lookup);
        let xs = optional_trimmed_env("MESSENGER_XS", &mut lookup);
        let credentials_from_env = c_user.is_some() || xs.is_some();

        let mut credentials = if credentials_from_env {
            let mut credentials = Credentials::new();
            if let Some(c_user) = c_user {
                credentials = credentials.with("c_user", c_user);
            }
            if let Some(xs) = xs {
                credentials = credentials.with("xs", xs);
            }
            credentials
        } else {
            Credentials::new()
                .with("c_user", LOOPBACK_C_USER)
                .with("xs", LOOPBACK_XS)
        };
        for (key, cookie) in [("MESSENGER_DATR", "datr"), ("MESSENGER_FR", "fr")] {
            if let Some(value) = optional_trimmed_env(key, &mut lookup) {
                credentials = credentials.with(cookie, value);
            }
        }

        let log_level = parse_optional::<LogLevel, _>("MESSENGER_LOG_LEVEL", &mut lookup)?;
        let defaults = SessionConfig::default();
        let session = SessionConfig {
            credentials,
            platform: parse_optional("MESSENGER_PLATFORM", &mut lookup)?
                .unwrap_or(defaults.platform),
            device_path: optional_trimmed_env("MESSENGER_DEVICE_PATH", &mut lookup)
                .map(PathBuf::from),
            device_data: optional_trimmed_env("MESSENGER_DEVICE_DATA", &mut lookup),
            e2ee_memory_only: parse_optional_bool("MESSENGER_E2EE_MEMORY_ONLY", &mut lookup)?
                .unwrap_or(defaults.e2ee_memory_only),
            log_level: log_level.unwrap_or(defaults.log_level),
            enable_e2ee: parse_optional_bool("MESSENGER_ENABLE_E2EE", &mut lookup)?
                .unwrap_or(defaults.enable_e2ee),
            auto_reconnect: parse_optional_bool("MESSENGER_AUTO_RECONNECT", &mut lookup)?
                .unwrap_or(defaults.auto_reconnect),
            poll_timeout_ms: parse_optional("MESSENGER_POLL_TIMEOUT_MS", &mut lookup)?
                .unwrap_or(defaults.poll_timeout_ms),
            ..defaults
        };

        if session.poll_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MESSENGER_POLL_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let thread_id =
            parse_optional("MESSENGER_SMOKE_THREAD_ID", &mut lookup)?.unwrap_or(DEFAULT_THREAD_ID);
        let message = optional_trimmed_env("MESSENGER_SMOKE_MESSAGE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_owned());

        Ok(Self {
            session,
            credentials_from_env,
            log_level,
            thread_id,
            message,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn falls_back_to_loopback_credentials_and_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert!(!cfg.credentials_from_env);
        assert_eq!(cfg.session.credentials.get("xs"), Some(LOOPBACK_XS));
        assert!(cfg.session.e2ee_memory_only);
        assert!(cfg.session.enable_e2ee);
        assert!(!cfg.session.auto_reconnect);
        assert_eq!(cfg.log_level, None);
        assert_eq!(cfg.session.poll_timeout_ms, 500);
        assert_eq!(cfg.thread_id, DEFAULT_THREAD_ID);
    }

    #[test]
    fn parses_session_options() {
        let cfg = config_from_pairs(&[
            ("MESSENGER_C_USER", "42"),
            ("MESSENGER_XS", "secret"),
            ("MESSENGER_DATR", "d"),
            ("MESSENGER_PLATFORM", "instagram"),
            ("MESSENGER_DEVICE_PATH", "/tmp/device.json"),
            ("MESSENGER_E2EE_MEMORY_ONLY", "false"),
            ("MESSENGER_AUTO_RECONNECT", "yes"),
            ("MESSENGER_LOG_LEVEL", "debug"),
            ("MESSENGER_POLL_TIMEOUT_MS", "250"),
        ])
        .expect("config should parse");

        assert!(cfg.credentials_from_env);
        assert_eq!(cfg.session.credentials.account_id(), Some(42));
        assert_eq!(cfg.session.credentials.get("datr"), Some("d"));
        assert_eq!(cfg.session.platform, Platform::Instagram);
        assert_eq!(
            cfg.session.device_path,
            Some(PathBuf::from("/tmp/device.json"))
        );
        assert!(!cfg.session.e2ee_memory_only);
        assert!(cfg.session.auto_reconnect);
        assert_eq!(cfg.log_level, Some(LogLevel::Debug));
        assert_eq!(cfg.session.log_level, LogLevel::Debug);
        assert_eq!(cfg.session.poll_timeout_ms, 250);
    }

    #[test]
    fn partial_credentials_are_kept_for_the_bridge_to_reject() {
        let cfg = config_from_pairs(&[("MESSENGER_C_USER", "42")]).expect("config should parse");
        assert_eq!(cfg.session.credentials.missing_required(), vec!["xs"]);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[("MESSENGER_ENABLE_E2EE", "maybe")])
            .expect_err("invalid bool should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "MESSENGER_ENABLE_E2EE",
                ..
            }
        ));

        let err = config_from_pairs(&[("MESSENGER_POLL_TIMEOUT_MS", "0")])
            .expect_err("zero timeout should fail");
        assert!(err.to_string().contains("MESSENGER_POLL_TIMEOUT_MS"));

        assert!(config_from_pairs(&[("MESSENGER_PLATFORM", "myspace")]).is_err());
    }
}
