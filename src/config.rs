//! Engine configuration.
//!
//! Deployment environment, state-store location, and compute-backend
//! settings. Loaded from a config file or assembled programmatically; every
//! field has a development-friendly default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Deployment environment the control plane runs in.
///
/// Dev skips the plan-approval gate; Staging and Production enforce it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("Invalid environment: {other}")),
        }
    }
}

/// Connection settings for the remote warehouse executor.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WarehouseConfig {
    pub endpoint: String,
    pub token: String,
    pub warehouse_id: Option<String>,
    /// HTTP client timeout; the warehouse executor sets its own bound rather
    /// than relying on the control plane's request lifetime.
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8780".to_string(),
            token: String::new(),
            warehouse_id: None,
            request_timeout_secs: 120,
            poll_interval_secs: 2,
        }
    }
}

/// Top-level engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    pub environment: Environment,
    pub database_url: String,
    pub tenant_id: String,
    pub default_cluster_size: String,
    /// Present when a remote warehouse is configured; absent in dev, where
    /// the local sandbox executor is used instead.
    pub warehouse: Option<WarehouseConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            database_url: "sqlite::memory:".to_string(),
            tenant_id: "default".to_string(),
            default_cluster_size: "small".to_string(),
            warehouse: None,
        }
    }
}

impl EngineConfig {
    /// True when plan execution should target the remote warehouse.
    pub fn warehouse_available(&self) -> bool {
        self.warehouse
            .as_ref()
            .map(|w| !w.endpoint.is_empty() && !w.token.is_empty())
            .unwrap_or(false)
    }
}

/// Install the global tracing subscriber. Call once at startup; repeated
/// calls are ignored so tests can call it freely.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_round_trip() {
        for env in [Environment::Dev, Environment::Staging, Environment::Production] {
            let parsed: Environment = env.as_str().parse().expect("parse");
            assert_eq!(parsed, env);
        }
        assert_eq!("prod".parse::<Environment>(), Ok(Environment::Production));
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_default_config_has_no_warehouse() {
        let config = EngineConfig::default();
        assert!(!config.warehouse_available());
        assert_eq!(config.environment, Environment::Dev);
    }
}
