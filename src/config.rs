//! Configuration loading from environment variables.
//!
//! All values come from `SVCGATE_*` variables with defaults. Invalid values
//! fall back to defaults without crashing.
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SVCGATE_SOCKET_DIR` | /var/run/svcgate | Directory for listener sockets |
//! | `SVCGATE_PROVIDER_SOCKET` | /var/run/svcgate/upstream.sock | Real provider's socket |
//! | `SVCGATE_PORTS` | usb:hs=20,usb:hs:a=3 | Ports as `name=max_sessions` list |
//! | `SVCGATE_WORKER_THREADS` | 2 | Runtime worker threads (0 = auto) |
//! | `SVCGATE_FRAME_LIMIT` | 1048576 | Max wire frame size (bytes) |
//! | `SVCGATE_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown drain timeout (secs) |
//! | `SVCGATE_LOG_FORMAT` | json | `json` or `pretty` |
//! | `SVCGATE_LOG_LEVEL` | info | EnvFilter directive |

use std::path::PathBuf;
use std::time::Duration;

use crate::proxy::protocol::DEFAULT_FRAME_LIMIT;
use crate::proxy::server::PortConfig;
use crate::telemetry::{LogConfig, LogFormat};

/// Everything loaded from the environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub socket_dir: PathBuf,
    pub provider_socket: PathBuf,
    pub ports: Vec<PortConfig>,
    pub worker_threads: usize,
    pub frame_limit: usize,
    pub shutdown_timeout: Duration,
    pub log: LogConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/var/run/svcgate"),
            provider_socket: PathBuf::from("/var/run/svcgate/upstream.sock"),
            ports: default_ports(),
            worker_threads: 2,
            frame_limit: DEFAULT_FRAME_LIMIT,
            shutdown_timeout: Duration::from_secs(30),
            log: LogConfig::default(),
        }
    }
}

/// The intercepted service and its admin variant, with the session limits
/// the real provider advertises.
fn default_ports() -> Vec<PortConfig> {
    vec![
        PortConfig { name: "usb:hs".to_string(), max_sessions: 20 },
        PortConfig { name: "usb:hs:a".to_string(), max_sessions: 3 },
    ]
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_path(key: &str, default: &str) -> PathBuf {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => PathBuf::from(default),
    }
}

/// Parse a `name=max_sessions` comma list. Entries that fail to parse are
/// skipped; an empty result falls back to the defaults.
fn parse_ports(spec: &str) -> Vec<PortConfig> {
    let mut ports = Vec::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        // Port names may contain '=' only as the limit separator.
        let Some((name, max)) = entry.rsplit_once('=') else {
            continue;
        };
        let Ok(max_sessions) = max.parse::<usize>() else {
            continue;
        };
        if name.is_empty() || max_sessions == 0 {
            continue;
        }
        ports.push(PortConfig { name: name.to_string(), max_sessions });
    }
    if ports.is_empty() {
        default_ports()
    } else {
        ports
    }
}

fn load_log_config() -> LogConfig {
    let format = match std::env::var("SVCGATE_LOG_FORMAT").as_deref() {
        Ok("pretty") => LogFormat::Pretty,
        _ => LogFormat::Json,
    };
    let level = std::env::var("SVCGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    LogConfig { format, level }
}

/// Load the full configuration from the environment.
pub fn load() -> EnvConfig {
    let defaults = EnvConfig::default();

    let ports = match std::env::var("SVCGATE_PORTS") {
        Ok(spec) => parse_ports(&spec),
        Err(_) => defaults.ports.clone(),
    };

    EnvConfig {
        socket_dir: parse_path("SVCGATE_SOCKET_DIR", "/var/run/svcgate"),
        provider_socket: parse_path("SVCGATE_PROVIDER_SOCKET", "/var/run/svcgate/upstream.sock"),
        ports,
        worker_threads: parse_usize("SVCGATE_WORKER_THREADS", 2),
        frame_limit: parse_usize("SVCGATE_FRAME_LIMIT", DEFAULT_FRAME_LIMIT).max(1024),
        shutdown_timeout: Duration::from_secs(parse_u64("SVCGATE_SHUTDOWN_TIMEOUT", 30).max(1)),
        log: load_log_config(),
    }
}

/// Resolve the effective worker-thread count (0 means auto-detect).
pub fn effective_worker_threads(configured: usize) -> usize {
    if configured == 0 {
        num_cpus::get().max(1)
    } else {
        configured
    }
}
