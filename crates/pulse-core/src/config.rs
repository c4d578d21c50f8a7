//! Pulse node configuration.
//!
//! Configuration is loaded from environment variables. The store URL may
//! carry credentials and is redacted in Debug output.

use crate::models::ModeKind;
use common::secret::SecretString;
use common::types::{SessionId, UserId};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default liveness poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 15;

/// Default heartbeat timeout in seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 60;

/// Default heartbeat write interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 10;

/// Default scheduler check tick in milliseconds.
pub const DEFAULT_CHECK_TICK_MS: u64 = 50;

/// Default rate staleness threshold in seconds.
pub const DEFAULT_RATE_STALENESS_SECONDS: u64 = 300;

/// Default Prometheus scrape endpoint.
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = "0.0.0.0:9464";

/// Role this device starts in (`PULSE_ROLE`).
///
/// Accepted forms: `solo`, `paired:<partner_id>`, `host:<session name>`,
/// `viewer:<session_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleConfig {
    Solo,
    Paired { partner_id: UserId },
    /// Create a session with this name and broadcast it.
    Host { session_name: String },
    Viewer { session_id: SessionId },
}

impl RoleConfig {
    #[must_use]
    pub fn kind(&self) -> ModeKind {
        match self {
            RoleConfig::Solo => ModeKind::Solo,
            RoleConfig::Paired { .. } => ModeKind::Paired,
            RoleConfig::Host { .. } => ModeKind::GroupHost,
            RoleConfig::Viewer { .. } => ModeKind::GroupViewer,
        }
    }
}

impl FromStr for RoleConfig {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidValue(format!("PULSE_ROLE: {reason}"));
        let (kind, arg) = match raw.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (raw, None),
        };

        match (kind, arg) {
            ("solo", None) => Ok(RoleConfig::Solo),
            ("paired", Some(partner)) => UserId::new(partner)
                .map(|partner_id| RoleConfig::Paired { partner_id })
                .map_err(|e| invalid(e.to_string())),
            ("host", Some(name)) if !name.trim().is_empty() => Ok(RoleConfig::Host {
                session_name: name.trim().to_string(),
            }),
            ("viewer", Some(session)) => SessionId::new(session)
                .map(|session_id| RoleConfig::Viewer { session_id })
                .map_err(|e| invalid(e.to_string())),
            _ => Err(invalid(format!("unrecognized role {raw:?}"))),
        }
    }
}

/// Pulse node configuration.
#[derive(Clone)]
pub struct Config {
    /// Store connection URL. Protected by `SecretString` to prevent
    /// accidental logging.
    pub store_url: SecretString,

    /// This device's user.
    pub user_id: UserId,

    /// Name shown in discovery listings (default: the user ID).
    pub display_name: String,

    /// Starting role (default: solo).
    pub role: RoleConfig,

    pub poll_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub check_tick: Duration,
    pub rate_staleness: Duration,

    /// Prometheus scrape endpoint (default: "0.0.0.0:9464").
    pub metrics_bind_address: SocketAddr,
}

/// Custom Debug implementation that redacts the store URL.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("store_url", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .field("role", &self.role)
            .field("poll_interval", &self.poll_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("check_tick", &self.check_tick)
            .field("rate_staleness", &self.rate_staleness)
            .field("metrics_bind_address", &self.metrics_bind_address)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn required<'a>(vars: &'a HashMap<String, String>, name: &str) -> Result<&'a String, ConfigError> {
    vars.get(name)
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}: {raw:?}"))),
    }
}

fn positive_seconds(vars: &HashMap<String, String>, name: &str, default: u64) -> Result<Duration, ConfigError> {
    let seconds: u64 = parse_or(vars, name, default)?;
    if seconds == 0 {
        return Err(ConfigError::InvalidValue(format!("{name} must be > 0")));
    }
    Ok(Duration::from_secs(seconds))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Missing required variables or unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Missing required variables or unparsable values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let store_url = SecretString::from(required(vars, "PULSE_STORE_URL")?.clone());

        let user_id = UserId::new(required(vars, "PULSE_USER_ID")?.clone())
            .map_err(|e| ConfigError::InvalidValue(format!("PULSE_USER_ID: {e}")))?;

        let display_name = vars
            .get("PULSE_DISPLAY_NAME")
            .cloned()
            .unwrap_or_else(|| user_id.to_string());

        let role = parse_or(vars, "PULSE_ROLE", RoleConfig::Solo)?;

        let poll_interval =
            positive_seconds(vars, "PULSE_POLL_INTERVAL_SECONDS", DEFAULT_POLL_INTERVAL_SECONDS)?;
        let heartbeat_timeout = positive_seconds(
            vars,
            "PULSE_HEARTBEAT_TIMEOUT_SECONDS",
            DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
        )?;
        let heartbeat_interval = positive_seconds(
            vars,
            "PULSE_HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;
        let rate_staleness = positive_seconds(
            vars,
            "PULSE_RATE_STALENESS_SECONDS",
            DEFAULT_RATE_STALENESS_SECONDS,
        )?;

        let check_tick_ms: u64 = parse_or(vars, "PULSE_CHECK_TICK_MS", DEFAULT_CHECK_TICK_MS)?;
        if check_tick_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "PULSE_CHECK_TICK_MS must be > 0".to_string(),
            ));
        }

        // Heartbeats slower than the timeout would make every peer flap.
        if heartbeat_interval >= heartbeat_timeout {
            return Err(ConfigError::InvalidValue(format!(
                "PULSE_HEARTBEAT_INTERVAL_SECONDS ({}) must be below PULSE_HEARTBEAT_TIMEOUT_SECONDS ({})",
                heartbeat_interval.as_secs(),
                heartbeat_timeout.as_secs()
            )));
        }

        let metrics_bind_address = parse_or(
            vars,
            "PULSE_METRICS_BIND_ADDRESS",
            SocketAddr::from(([0, 0, 0, 0], 9464)),
        )?;

        Ok(Config {
            store_url,
            user_id,
            display_name,
            role,
            poll_interval,
            heartbeat_timeout,
            heartbeat_interval,
            check_tick: Duration::from_millis(check_tick_ms),
            rate_staleness,
            metrics_bind_address,
        })
    }
}
