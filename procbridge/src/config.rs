//! Bridge configuration: builder plus environment loading.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::error::ConfigError;
use crate::supervisor::RestartPolicy;

pub const ENV_WORKER: &str = "PROCBRIDGE_WORKER";
pub const ENV_WORKER_ARGS: &str = "PROCBRIDGE_WORKER_ARGS";
pub const ENV_TIMEOUT_MS: &str = "PROCBRIDGE_TIMEOUT_MS";
pub const ENV_MAX_RESTARTS: &str = "PROCBRIDGE_MAX_RESTARTS";
pub const ENV_INITIAL_BACKOFF_MS: &str = "PROCBRIDGE_INITIAL_BACKOFF_MS";
pub const ENV_MAX_BACKOFF_MS: &str = "PROCBRIDGE_MAX_BACKOFF_MS";
pub const ENV_MAX_LINE_BYTES: &str = "PROCBRIDGE_MAX_LINE_BYTES";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Deadline used by `process_topics`.
    pub default_deadline: Duration,
    pub restart: RestartPolicy,
    pub max_line_length: usize,
    /// Time a worker gets to exit after stdin closes, and again after SIGTERM.
    pub shutdown_grace: Duration,
}

impl BridgeConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            default_deadline: Duration::from_millis(1000),
            restart: RestartPolicy::default(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn with_max_line_length(mut self, bytes: usize) -> Self {
        self.max_line_length = bytes;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Load from `PROCBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let executable = lookup(ENV_WORKER)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_WORKER))?;
        let mut config = Self::new(executable);

        if let Some(args) = lookup(ENV_WORKER_ARGS) {
            config.args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(ms) = parse_u64(&lookup, ENV_TIMEOUT_MS)? {
            config.default_deadline = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, ENV_INITIAL_BACKOFF_MS)? {
            config.restart.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, ENV_MAX_BACKOFF_MS)? {
            config.restart.max_backoff = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_u64(&lookup, ENV_MAX_LINE_BYTES)? {
            config.max_line_length = usize::try_from(bytes).map_err(|e| ConfigError::Invalid {
                key: ENV_MAX_LINE_BYTES,
                value: bytes.to_string(),
                reason: e.to_string(),
            })?;
        }
        if let Some(value) = lookup(ENV_MAX_RESTARTS) {
            config.restart.max_consecutive_failures = match value.trim() {
                "unlimited" | "none" => None,
                n => Some(n.parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::Invalid {
                        key: ENV_MAX_RESTARTS,
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })?),
            };
        }
        Ok(config)
    }
}

fn parse_u64(
    lookup: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    lookup(key)
        .map(|value| {
            value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            })
        })
        .transpose()
}
