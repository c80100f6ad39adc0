//! Bridge configuration.
//!
//! Read once from the environment at startup. Every field has a `with_*` override.

use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::engine::{CommandEngine, LaunchMode};
use crate::session::DEFAULT_FINISHED_RETENTION;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} is required: {reason}")]
    Missing { var: &'static str, reason: String },
}

/// How the command engine launches agents.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub launch_mode: LaunchMode,
    /// SIGTERM to SIGKILL grace period.
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            launch_mode: LaunchMode::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn build(&self) -> CommandEngine {
        CommandEngine::new(self.launch_mode.clone()).with_stop_grace(self.stop_grace)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub engine: EngineConfig,
    pub max_line_length: usize,
    pub finished_retention: usize,
    /// Bound on one engine stop call.
    pub stop_timeout: Duration,
    /// Bound on stopping every session at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            finished_retention: DEFAULT_FINISHED_RETENTION,
            stop_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let launch_mode = match get("TASKBRIDGE_LAUNCH_MODE").as_deref() {
            None | Some("container") => LaunchMode::Container {
                runtime: get("TASKBRIDGE_CONTAINER_RUNTIME").unwrap_or_else(|| "docker".to_string()),
            },
            Some("host") => {
                let command = get("TASKBRIDGE_AGENT_COMMAND").ok_or(ConfigError::Missing {
                    var: "TASKBRIDGE_AGENT_COMMAND",
                    reason: "host launch mode needs an agent program".to_string(),
                })?;
                let mut parts = command.split_whitespace().map(str::to_string);
                let program = parts.next().unwrap_or_default();
                LaunchMode::Host {
                    program,
                    args: parts.collect(),
                }
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "TASKBRIDGE_LAUNCH_MODE",
                    value: other.to_string(),
                    reason: "expected container or host".to_string(),
                });
            }
        };

        let config = Self {
            engine: EngineConfig {
                launch_mode,
                stop_grace: secs(&get, "TASKBRIDGE_STOP_GRACE_SECS", defaults.engine.stop_grace)?,
            },
            max_line_length: count(
                &get,
                "TASKBRIDGE_MAX_LINE_BYTES",
                defaults.max_line_length,
            )?,
            finished_retention: count(
                &get,
                "TASKBRIDGE_FINISHED_RETENTION",
                defaults.finished_retention,
            )?,
            stop_timeout: secs(&get, "TASKBRIDGE_STOP_TIMEOUT_SECS", defaults.stop_timeout)?,
            shutdown_timeout: secs(
                &get,
                "TASKBRIDGE_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
        };

        if config.max_line_length == 0 {
            return Err(ConfigError::Invalid {
                var: "TASKBRIDGE_MAX_LINE_BYTES",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(config)
    }

    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.engine.launch_mode = mode;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.engine.stop_grace = grace;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn count<G>(get: &G, var: &'static str, default: usize) -> Result<usize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

fn secs<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionEngine;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<BridgeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from(&[]).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(
            config.engine.launch_mode,
            LaunchMode::Container {
                runtime: "docker".to_string()
            }
        );
        assert_eq!(config.max_line_length, 16 * 1024 * 1024);
        assert_eq!(config.finished_retention, 4096);
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.engine.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn container_runtime_override() {
        let config = from(&[("TASKBRIDGE_CONTAINER_RUNTIME", "podman")]).unwrap();
        assert_eq!(
            config.engine.launch_mode,
            LaunchMode::Container {
                runtime: "podman".to_string()
            }
        );
    }

    #[test]
    fn host_mode_splits_command() {
        let config = from(&[
            ("TASKBRIDGE_LAUNCH_MODE", "host"),
            ("TASKBRIDGE_AGENT_COMMAND", "agent-cli --headless  --json"),
        ])
        .unwrap();
        assert_eq!(
            config.engine.launch_mode,
            LaunchMode::Host {
                program: "agent-cli".to_string(),
                args: vec!["--headless".to_string(), "--json".to_string()],
            }
        );
    }

    #[test]
    fn host_mode_requires_command() {
        let err = from(&[("TASKBRIDGE_LAUNCH_MODE", "host"), ("TASKBRIDGE_AGENT_COMMAND", "  ")])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                var: "TASKBRIDGE_AGENT_COMMAND",
                ..
            }
        ));
    }

    #[test]
    fn unknown_launch_mode_is_invalid() {
        let err = from(&[("TASKBRIDGE_LAUNCH_MODE", "vm")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"invalid value "vm" for TASKBRIDGE_LAUNCH_MODE: expected container or host"#
        );
    }

    #[test]
    fn numeric_overrides() {
        let config = from(&[
            ("TASKBRIDGE_STOP_GRACE_SECS", "1"),
            ("TASKBRIDGE_STOP_TIMEOUT_SECS", "10"),
            ("TASKBRIDGE_SHUTDOWN_TIMEOUT_SECS", "20"),
            ("TASKBRIDGE_MAX_LINE_BYTES", "1024"),
            ("TASKBRIDGE_FINISHED_RETENTION", "0"),
        ])
        .unwrap();
        assert_eq!(config.engine.stop_grace, Duration::from_secs(1));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(20));
        assert_eq!(config.max_line_length, 1024);
        assert_eq!(config.finished_retention, 0);
    }

    #[test]
    fn malformed_number_is_invalid() {
        let err = from(&[("TASKBRIDGE_STOP_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "TASKBRIDGE_STOP_TIMEOUT_SECS",
                ..
            }
        ));
    }

    #[test]
    fn zero_line_length_is_invalid() {
        assert!(from(&[("TASKBRIDGE_MAX_LINE_BYTES", "0")]).is_err());
    }

    #[test]
    fn builders_override() {
        let config = BridgeConfig::default()
            .with_launch_mode(LaunchMode::Host {
                program: "sh".to_string(),
                args: vec![],
            })
            .with_stop_grace(Duration::from_millis(100))
            .with_max_line_length(64)
            .with_finished_retention(2)
            .with_stop_timeout(Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_secs(2));
        assert_eq!(config.max_line_length, 64);
        assert_eq!(config.finished_retention, 2);
        assert_eq!(config.engine.stop_grace, Duration::from_millis(100));
        assert_eq!(config.engine.build().name(), "host");
    }
}
