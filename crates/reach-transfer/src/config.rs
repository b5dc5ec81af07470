//! Typed configuration read from `REACH_*` environment variables.
//!
//! Every setting has a default; a variable that is set but does not parse is
//! an error rather than silently falling back.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reach_protocol::{DEFAULT_PACKET_SIZE, MAX_PACKET_PAYLOAD, REACH_PORT};

use crate::error::ConfigError;
use crate::window::WindowConfig;

/// Responder settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub packet_size: u64,
    /// When set, request paths resolve below this directory.
    pub serve_root: Option<PathBuf>,
    /// Delay between consecutive FilePacket sends.
    pub send_pacing: Option<Duration>,
    pub session_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), REACH_PORT),
            packet_size: DEFAULT_PACKET_SIZE,
            serve_root: None,
            send_pacing: None,
            session_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host: IpAddr = env_or("REACH_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let port: u16 = env_or("REACH_PORT", REACH_PORT)?;
        let pacing_us: u64 = env_or("REACH_SEND_PACING_US", 0)?;

        let config = Self {
            bind_addr: SocketAddr::new(host, port),
            packet_size: env_or("REACH_PACKET_SIZE", DEFAULT_PACKET_SIZE)?,
            serve_root: std::env::var("REACH_SERVE_ROOT")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            send_pacing: (pacing_us > 0).then(|| Duration::from_micros(pacing_us)),
            session_timeout: Duration::from_secs(env_or("REACH_SESSION_TIMEOUT_SECS", 60)?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_size == 0 || self.packet_size > MAX_PACKET_PAYLOAD as u64 {
            return Err(ConfigError::Constraint(format!(
                "packet size {} must be between 1 and {}",
                self.packet_size, MAX_PACKET_PAYLOAD
            )));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::Constraint("session timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Fetch settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    /// How long to wait for a handshake or keepalive reply per attempt.
    pub receive_timeout: Duration,
    /// Attempts before a handshake gives up.
    pub send_retry: u32,
    pub window: WindowConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), REACH_PORT),
            receive_timeout: Duration::from_millis(500),
            send_retry: 5,
            window: WindowConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Read the tuning variables. The server address stays at its default;
    /// the CLI sets it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = WindowConfig::default();
        let window = WindowConfig {
            request_window: env_or("REACH_REQUEST_WINDOW", defaults.request_window)?,
            throttle_ceiling: env_or("REACH_THROTTLE_CEILING", defaults.throttle_ceiling)?,
            timeout_threshold: env_or("REACH_TIMEOUT_THRESHOLD", defaults.timeout_threshold)?,
            round_interval: Duration::from_millis(env_or("REACH_ROUND_INTERVAL_MS", 5)?),
            max_stalled_timeouts: env_or(
                "REACH_MAX_STALLED_TIMEOUTS",
                defaults.max_stalled_timeouts,
            )?,
        };

        let config = Self {
            receive_timeout: Duration::from_millis(env_or("REACH_RECEIVE_TIMEOUT_MS", 500)?),
            send_retry: env_or("REACH_SEND_RETRY", 5)?,
            window,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_retry == 0 {
            return Err(ConfigError::Constraint("send retry must be at least 1".into()));
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::Constraint("receive timeout must be non-zero".into()));
        }
        self.window.validate()
    }
}

fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => parse_value(key, &value),
        _ => Ok(default),
    }
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
