use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

use url::Url;

use crate::call::CallError;

pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:5000";
pub const DEFAULT_SIGNALING_PATH: &str = "/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Call settings. The origin is the application's own base URL; the
/// signaling socket and the REST join endpoint both live on it.
#[derive(Debug, Clone)]
pub struct CallConfig {
    origin: Url,
    signaling_path: String,
    reconnect_delay: Duration,
    keepalive_interval: Duration,
    ice_servers: Vec<String>,
}

impl CallConfig {
    pub fn new(origin: impl AsRef<str>) -> Result<Self, CallError> {
        let mut base = origin.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(CallError::InvalidConfig("origin cannot be empty".into()));
        }
        if !base.contains("://") {
            base = format!("{}{base}", infer_scheme(&base));
        }
        let origin = Url::parse(&base)
            .map_err(|err| CallError::InvalidConfig(format!("invalid origin {base}: {err}")))?;
        if origin.cannot_be_a_base() {
            return Err(CallError::InvalidConfig(format!("origin {base} is not a base url")));
        }
        Ok(Self {
            origin,
            signaling_path: DEFAULT_SIGNALING_PATH.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        })
    }

    /// Load configuration from `COURTSIDE_*` environment variables.
    pub fn from_env() -> Result<Self, CallError> {
        let origin = env_value("COURTSIDE_ORIGIN").unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
        Self::new(origin)?.apply_env()
    }

    /// Overlays the tunables found in the environment, leaving the origin.
    pub fn apply_env(mut self) -> Result<Self, CallError> {
        if let Some(path) = env_value("COURTSIDE_SIGNALING_PATH") {
            self = self.with_signaling_path(path);
        }
        if let Some(ms) = env_value("COURTSIDE_RECONNECT_DELAY_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                CallError::InvalidConfig(format!("COURTSIDE_RECONNECT_DELAY_MS must be an integer, got {ms}"))
            })?;
            self.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_value("COURTSIDE_KEEPALIVE_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                CallError::InvalidConfig(format!("COURTSIDE_KEEPALIVE_SECS must be an integer, got {secs}"))
            })?;
            self.keepalive_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(servers) = env_value("COURTSIDE_ICE_SERVERS") {
            self.ice_servers = split_list(&servers);
        }
        Ok(self)
    }

    pub fn with_signaling_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.signaling_path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn signaling_path(&self) -> &str {
        &self.signaling_path
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn infer_scheme(base: &str) -> &'static str {
    let host = base.split(['/', ':']).next().unwrap_or_default();
    if host == "localhost" || host.starts_with("127.") || host == "0.0.0.0" {
        "http://"
    } else {
        "https://"
    }
}
