//! Client configuration.
//!
//! Defaults suit an interactive tool talking to a local server. Every
//! setting can be overridden from the environment:
//!
//! | Variable                               | Meaning                              |
//! |----------------------------------------|--------------------------------------|
//! | `ANALYSIS_CLIENT_REQUEST_TIMEOUT_SECS` | per-call deadline, `0` disables      |
//! | `ANALYSIS_CLIENT_STARTUP_TIMEOUT_SECS` | wait for `server.connected`          |
//! | `ANALYSIS_CLIENT_SHUTDOWN_TIMEOUT_SECS`| wait for `server.shutdown` reply     |
//! | `ANALYSIS_CLIENT_PING_INTERVAL_SECS`   | liveness ping period, `0` disables   |
//! | `ANALYSIS_CLIENT_PING_TIMEOUT_SECS`    | deadline for one liveness ping       |
//! | `ANALYSIS_CLIENT_FRAMING`              | `lines` or `content-length`          |
//! | `ANALYSIS_CLIENT_SUPPORTS_URIS`        | `true`/`false`                       |

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::transport::Framing;

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Default wait for the server handshake in seconds.
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
/// Default wait for the shutdown reply in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
/// Default deadline for one liveness ping in seconds.
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 10;

const ENV_PREFIX: &str = "ANALYSIS_CLIENT_";

/// Settings for an [`AnalysisClient`](crate::client::AnalysisClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline applied by `call`; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// How long `start` waits for `server.connected`.
    pub startup_timeout: Duration,
    /// How long `shutdown` waits for the server to acknowledge.
    pub shutdown_timeout: Duration,
    /// Period of liveness pings; `None` disables the watchdog.
    pub ping_interval: Option<Duration>,
    /// Deadline for a single liveness ping.
    pub ping_timeout: Duration,
    /// Wire framing.
    pub framing: Framing,
    /// Tell the server this client understands `file:` URIs.
    pub supports_uris: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ping_interval: None,
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
            framing: Framing::default(),
            supports_uris: false,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `ANALYSIS_CLIENT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` (keyed by full variable name).
    ///
    /// Malformed values are logged and ignored.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some(secs) = get("REQUEST_TIMEOUT_SECS").and_then(parse_env::<u64>) {
            self.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = get("STARTUP_TIMEOUT_SECS").and_then(parse_env::<u64>) {
            self.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = get("SHUTDOWN_TIMEOUT_SECS").and_then(parse_env::<u64>) {
            self.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = get("PING_INTERVAL_SECS").and_then(parse_env::<u64>) {
            self.ping_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = get("PING_TIMEOUT_SECS").and_then(parse_env::<u64>) {
            self.ping_timeout = Duration::from_secs(secs);
        }
        if let Some(framing) = get("FRAMING").and_then(parse_env::<Framing>) {
            self.framing = framing;
        }
        if let Some(flag) = get("SUPPORTS_URIS").and_then(parse_env::<bool>) {
            self.supports_uris = flag;
        }

        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }
}

fn parse_env<T>((key, value): (String, String)) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, value, e);
            None
        }
    }
}
