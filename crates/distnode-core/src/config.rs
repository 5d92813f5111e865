//! Configuration for distnode, sourced entirely from the process environment.
//!
//! Unlike a desktop application with a persisted config file, a distnode
//! instance is meant to be launched under a process supervisor (systemd,
//! a container orchestrator) that injects its identity and network
//! position as environment variables. There is nothing to load from disk
//! and nothing to write back.
//!
//! `NODE_ID`, `HOST`, and `PORT` are required; everything else has a
//! default matching spec §6.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while reading configuration from the environment.
/// Any of these is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    MissingVar(String),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
}

/// Backoff growth strategy for the outbound per-peer reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffMode {
    Exponential,
    Linear,
}

/// The five syslog-ish log levels accepted in `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Maps to the `tracing`/`EnvFilter` directive this level corresponds
    /// to. `Critical` has no direct tracing equivalent, so it maps to
    /// `error` (the coarsest level tracing offers).
    pub fn as_tracing_level(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

/// A bootstrap seed peer, parsed from `BOOTSTRAP_PEERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPeer {
    pub host: String,
    pub port: u16,
}

/// Full node configuration, loaded once at startup via [`NodeConfig::load`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub http_port: u16,
    pub log_level: LogLevel,
    pub log_file: Option<String>,
    pub bootstrap_peers: Vec<SeedPeer>,

    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub max_frame_size: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_mode: BackoffMode,
    pub idle_probe_interval: Duration,
    pub tcp_keepalive: bool,

    pub receive_timeout: Duration,
    pub accept_timeout: Duration,
    pub listen_backlog: u32,

    pub publisher_interval: Duration,
}

impl NodeConfig {
    /// Loads configuration from the process environment. `NODE_ID`, `HOST`,
    /// and `PORT` are required; every other variable is optional and falls
    /// back to the defaults in spec §6.
    /// `HTTP_PORT` defaults to `PORT + 1000` when unset, keeping the
    /// snapshot surface off the wire-protocol port without requiring an
    /// extra env var in the common case.
    pub fn load() -> Result<Self, ConfigError> {
        let node_id = require_env("NODE_ID")?;
        let host = require_env("HOST")?;
        let port = parse_port(&require_env("PORT")?)?;
        let http_port = match optional_env("HTTP_PORT") {
            Some(raw) => parse_port_named("HTTP_PORT", &raw)?,
            None => port.saturating_add(1000),
        };

        let log_level = match std::env::var("LOG_LEVEL") {
            Ok(raw) => parse_log_level(&raw)?,
            Err(_) => LogLevel::Info,
        };
        let log_file = optional_env("LOG_FILE");
        let bootstrap_peers = parse_peers(&optional_env("BOOTSTRAP_PEERS").unwrap_or_default())?;

        let connect_timeout = duration_secs_env("CONNECT_TIMEOUT_SECS", 2.0)?;
        let send_timeout = duration_secs_env("SEND_TIMEOUT_SECS", 2.0)?;
        let max_frame_size = u32_env("MAX_FRAME_SIZE", crate::protocol::DEFAULT_MAX_FRAME_SIZE)?;
        let initial_backoff = duration_secs_env("INITIAL_BACKOFF_SECS", 0.5)?;
        let max_backoff = duration_secs_env("MAX_BACKOFF_SECS", 10.0)?;
        let backoff_mode = match optional_env("BACKOFF_MODE") {
            Some(raw) => parse_backoff_mode(&raw)?,
            None => BackoffMode::Exponential,
        };
        let idle_probe_interval = duration_secs_env("IDLE_PROBE_INTERVAL_SECS", 1.0)?;
        let tcp_keepalive = bool_env("TCP_KEEPALIVE", true)?;

        let receive_timeout = duration_secs_env("RECEIVE_TIMEOUT_SECS", 1.0)?;
        let accept_timeout = duration_secs_env("ACCEPT_TIMEOUT_SECS", 1.0)?;
        let listen_backlog = u32_env("LISTEN_BACKLOG", 128)?;

        let publisher_interval = duration_secs_env("PUBLISHER_INTERVAL_SECS", 0.2)?;

        Ok(Self {
            node_id,
            host,
            port,
            http_port,
            log_level,
            log_file,
            bootstrap_peers,
            connect_timeout,
            send_timeout,
            max_frame_size,
            initial_backoff,
            max_backoff,
            backoff_mode,
            idle_probe_interval,
            tcp_keepalive,
            receive_timeout,
            accept_timeout,
            listen_backlog,
            publisher_interval,
        })
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    optional_env(name).ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    parse_port_named("PORT", raw)
}

fn parse_port_named(name: &str, raw: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.to_string(),
            reason: "must be an integer in 1..=65535".to_string(),
        })
        .and_then(|port| {
            if port == 0 {
                Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: raw.to_string(),
                    reason: "must be nonzero".to_string(),
                })
            } else {
                Ok(port)
            }
        })
}

fn parse_log_level(raw: &str) -> Result<LogLevel, ConfigError> {
    match raw.trim().to_uppercase().as_str() {
        "DEBUG" => Ok(LogLevel::Debug),
        "INFO" => Ok(LogLevel::Info),
        "WARNING" | "WARN" => Ok(LogLevel::Warning),
        "ERROR" => Ok(LogLevel::Error),
        "CRITICAL" => Ok(LogLevel::Critical),
        other => Err(ConfigError::InvalidValue {
            name: "LOG_LEVEL".to_string(),
            value: other.to_string(),
            reason: "expected one of DEBUG, INFO, WARNING, ERROR, CRITICAL".to_string(),
        }),
    }
}

fn parse_backoff_mode(raw: &str) -> Result<BackoffMode, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "exponential" => Ok(BackoffMode::Exponential),
        "linear" => Ok(BackoffMode::Linear),
        other => Err(ConfigError::InvalidValue {
            name: "BACKOFF_MODE".to_string(),
            value: other.to_string(),
            reason: "expected one of exponential, linear".to_string(),
        }),
    }
}

fn parse_peers(raw: &str) -> Result<Vec<SeedPeer>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    raw.split(',')
        .map(|item| {
            let item = item.trim();
            let (host, port) = item.split_once(':').ok_or_else(|| ConfigError::InvalidValue {
                name: "BOOTSTRAP_PEERS".to_string(),
                value: item.to_string(),
                reason: "expected host:port".to_string(),
            })?;
            let port = parse_port(port).map_err(|_| ConfigError::InvalidValue {
                name: "BOOTSTRAP_PEERS".to_string(),
                value: item.to_string(),
                reason: "expected host:port".to_string(),
            })?;
            Ok(SeedPeer {
                host: host.trim().to_string(),
                port,
            })
        })
        .collect()
}

fn duration_secs_env(name: &str, default_secs: f64) -> Result<Duration, ConfigError> {
    match optional_env(name) {
        None => Ok(Duration::from_secs_f64(default_secs)),
        Some(raw) => {
            let secs: f64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw.clone(),
                reason: "must be a non-negative number of seconds".to_string(),
            })?;
            if secs < 0.0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: raw,
                    reason: "must be a non-negative number of seconds".to_string(),
                });
            }
            Ok(Duration::from_secs_f64(secs))
        }
    }
}

fn u32_env(name: &str, default: u32) -> Result<u32, ConfigError> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
            reason: "must be a non-negative integer".to_string(),
        }),
    }
}

fn bool_env(name: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                value: other.to_string(),
                reason: "expected a boolean (true/false/1/0/yes/no/on/off)".to_string(),
            }),
        },
    }
}
