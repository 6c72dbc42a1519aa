//! Configuration for the interconnect operator
//!
//! Every setting has a default and can be overridden through an environment
//! variable of the same name in upper case (see `OperatorConfig::from_env`).

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Invalid value '{value}' for {key}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Operator configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OperatorConfig {
    /// Namespace to watch; all namespaces when unset
    #[serde(default)]
    pub watch_namespace: Option<String>,

    /// Maximum number of Interconnects reconciled in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,

    /// Deadline for each cluster API call, in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// Deadline for a whole reconciliation pass, in seconds
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_secs: u64,

    /// First retry delay after a transient failure, in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Cap on the retry delay, in seconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Consecutive failures after which retries are logged as exhausted
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Periodic resync of converged Interconnects, in seconds
    #[serde(default = "default_resync")]
    pub resync_secs: u64,

    /// Poll interval while a workload kind transition is in flight, in seconds
    #[serde(default = "default_transition_poll")]
    pub transition_poll_secs: u64,

    /// Address serving /metrics and /healthz
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,

    /// Emit logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

fn default_concurrency() -> u16 {
    4
}

fn default_api_timeout() -> u64 {
    10
}

fn default_reconcile_timeout() -> u64 {
    60
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    300
}

fn default_retry_ceiling() -> u32 {
    10
}

fn default_resync() -> u64 {
    300
}

fn default_transition_poll() -> u64 {
    2
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            concurrency: default_concurrency(),
            api_timeout_secs: default_api_timeout(),
            reconcile_timeout_secs: default_reconcile_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            retry_ceiling: default_retry_ceiling(),
            resync_secs: default_resync(),
            transition_poll_secs: default_transition_poll(),
            metrics_addr: default_metrics_addr(),
            json_logs: false,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ns) = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()) {
            config.watch_namespace = Some(ns);
        }

        parse_into(&lookup, "OPERATOR_CONCURRENCY", &mut config.concurrency)?;
        parse_into(&lookup, "API_TIMEOUT_SECS", &mut config.api_timeout_secs)?;
        parse_into(&lookup, "RECONCILE_TIMEOUT_SECS", &mut config.reconcile_timeout_secs)?;
        parse_into(&lookup, "BACKOFF_BASE_MS", &mut config.backoff_base_ms)?;
        parse_into(&lookup, "BACKOFF_MAX_SECS", &mut config.backoff_max_secs)?;
        parse_into(&lookup, "RETRY_CEILING", &mut config.retry_ceiling)?;
        parse_into(&lookup, "RESYNC_SECS", &mut config.resync_secs)?;
        parse_into(&lookup, "TRANSITION_POLL_SECS", &mut config.transition_poll_secs)?;
        parse_into(&lookup, "METRICS_ADDR", &mut config.metrics_addr)?;

        if let Some(format) = lookup("LOG_FORMAT") {
            config.json_logs = match format.as_str() {
                "json" => true,
                "text" | "" => false,
                _ => {
                    return Err(ConfigError {
                        key: "LOG_FORMAT",
                        value: format,
                    })
                }
            };
        }

        Ok(config)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn transition_poll(&self) -> Duration {
        Duration::from_secs(self.transition_poll_secs)
    }
}

fn parse_into<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value
            .parse()
            .map_err(|_| ConfigError { key, value })?;
    }
    Ok(())
}
