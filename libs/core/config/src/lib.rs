//! Environment-driven configuration shared by the broker crates.
//!
//! Every configurable component implements [`FromEnv`] and reads its knobs
//! through the small helpers below, so defaults and parse failures are
//! reported the same way everywhere.

pub mod broker;
pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Deployment flavour, selected by `APP_ENV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Read an environment variable, falling back to `default` when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read an environment variable or fail with [`ConfigError::MissingEnvVar`].
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Read and parse an environment variable, using `default` when unset.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_any_case() {
        for value in ["production", "PRODUCTION", "Production"] {
            temp_env::with_var("APP_ENV", Some(value), || {
                assert_eq!(Environment::from_env(), Environment::Production);
            });
        }
    }

    #[test]
    fn test_environment_unknown_value_is_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("BROKER_TEST_VAR", Some("set"), || {
            assert_eq!(env_or_default("BROKER_TEST_VAR", "fallback"), "set");
        });
        temp_env::with_var_unset("BROKER_TEST_VAR", || {
            assert_eq!(env_or_default("BROKER_TEST_VAR", "fallback"), "fallback");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("BROKER_REQUIRED", || {
            let err = env_required("BROKER_REQUIRED").unwrap_err();
            assert_eq!(err, ConfigError::MissingEnvVar("BROKER_REQUIRED".into()));
            assert!(err.to_string().contains("BROKER_REQUIRED"));
        });
    }

    #[test]
    fn test_env_parse_uses_default_and_value() {
        temp_env::with_var_unset("BROKER_NUMBER", || {
            assert_eq!(env_parse("BROKER_NUMBER", 7u64).unwrap(), 7);
        });
        temp_env::with_var("BROKER_NUMBER", Some(" 42 "), || {
            assert_eq!(env_parse("BROKER_NUMBER", 7u64).unwrap(), 42);
        });
    }

    #[test]
    fn test_env_parse_reports_key_on_failure() {
        temp_env::with_var("BROKER_NUMBER", Some("many"), || {
            let err = env_parse::<u64>("BROKER_NUMBER", 7).unwrap_err();
            match err {
                ConfigError::ParseError { key, .. } => assert_eq!(key, "BROKER_NUMBER"),
                other => panic!("unexpected error: {other:?}"),
            }
        });
    }
}
