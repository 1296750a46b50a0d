use crate::backend::Backend;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Global configuration for the wake gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Wake and polling settings
    #[serde(default)]
    pub wake: WakeSettings,

    /// Backends that can be woken, keyed by name
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// URL that receives finalize/waiting/expired callbacks for sessions
    pub callback_url: Option<String>,

    /// Timeout for a single callback delivery in seconds (default: 5)
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,

    /// Holding backends clients are parked on while their target starts
    #[serde(default)]
    pub fallback_order: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
            callback_url: None,
            callback_timeout_secs: default_callback_timeout(),
            fallback_order: Vec::new(),
        }
    }
}

/// How backend reachability is checked
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// A TCP connect to the backend address (default)
    #[default]
    Tcp,
    /// An HTTP GET against the backend's health path, 2xx is reachable
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WakeSettings {
    /// Deadline for a single health probe in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Delay between probes of a waiting client in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum time between two wake signals for the same backend in seconds
    #[serde(default = "default_wake_cooldown")]
    pub wake_cooldown_secs: u64,

    /// Delay before the first probe after a wake in seconds
    #[serde(default = "default_initial_poll_delay")]
    pub initial_poll_delay_secs: u64,

    /// Deadline for the wake request itself in seconds
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout_secs: u64,

    /// Deadline for the probe made while choosing a client's initial route
    #[serde(default = "default_selection_probe_timeout")]
    pub selection_probe_timeout_secs: u64,

    /// Unreachable probes after which a client stops waiting (0 = never)
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Default control endpoint path for wake signals
    #[serde(default = "default_control_path")]
    pub control_path: String,

    /// Probe kind used for all backends
    #[serde(default)]
    pub probe: ProbeKind,

    /// Default health path for HTTP probes
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for WakeSettings {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            poll_interval_secs: default_poll_interval(),
            wake_cooldown_secs: default_wake_cooldown(),
            initial_poll_delay_secs: default_initial_poll_delay(),
            wake_timeout_secs: default_wake_timeout(),
            selection_probe_timeout_secs: default_selection_probe_timeout(),
            max_poll_attempts: default_max_poll_attempts(),
            control_path: default_control_path(),
            probe: ProbeKind::default(),
            health_path: default_health_path(),
        }
    }
}

impl WakeSettings {
    /// Replace timing values below one second with their defaults.
    ///
    /// Returns the names of the fields that were replaced.
    pub fn normalize(&mut self) -> Vec<&'static str> {
        let mut replaced = Vec::new();
        let fields: [(&'static str, &mut u64, u64); 6] = [
            ("probe_timeout_secs", &mut self.probe_timeout_secs, default_probe_timeout()),
            ("poll_interval_secs", &mut self.poll_interval_secs, default_poll_interval()),
            ("wake_cooldown_secs", &mut self.wake_cooldown_secs, default_wake_cooldown()),
            (
                "initial_poll_delay_secs",
                &mut self.initial_poll_delay_secs,
                default_initial_poll_delay(),
            ),
            ("wake_timeout_secs", &mut self.wake_timeout_secs, default_wake_timeout()),
            (
                "selection_probe_timeout_secs",
                &mut self.selection_probe_timeout_secs,
                default_selection_probe_timeout(),
            ),
        ];

        for (name, value, default) in fields {
            if *value < 1 {
                warn!(field = name, default, "Invalid wake setting, using default");
                *value = default;
                replaced.push(name);
            }
        }

        replaced
    }

    /// Durations used by the coordinator and its poll tasks
    pub fn timings(&self) -> WakeTimings {
        WakeTimings {
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            wake_cooldown: Duration::from_secs(self.wake_cooldown_secs),
            initial_poll_delay: Duration::from_secs(self.initial_poll_delay_secs),
            selection_probe_timeout: Duration::from_secs(self.selection_probe_timeout_secs),
            max_poll_attempts: (self.max_poll_attempts > 0).then_some(self.max_poll_attempts),
        }
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_secs(self.wake_timeout_secs)
    }
}

/// Resolved timings for waking and polling
#[derive(Debug, Clone, PartialEq)]
pub struct WakeTimings {
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub wake_cooldown: Duration,
    pub initial_poll_delay: Duration,
    pub selection_probe_timeout: Duration,
    /// `None` lets a client wait forever
    pub max_poll_attempts: Option<u32>,
}

impl Default for WakeTimings {
    fn default() -> Self {
        WakeSettings::default().timings()
    }
}

/// Configuration for a single backend
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    /// Host the backend (and its wake endpoint) listens on
    pub host: String,

    /// Port the backend (and its wake endpoint) listens on
    pub port: u16,

    /// Control endpoint path (overrides `wake.control_path`)
    pub control_path: Option<String>,

    /// Protocol version sent along with health probes
    pub protocol_version: Option<i32>,

    /// Health path for HTTP probes (overrides `wake.health_path`)
    pub health_path: Option<String>,
}

impl BackendConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            control_path: None,
            protocol_version: None,
            health_path: None,
        }
    }

    pub fn control_path<'a>(&'a self, settings: &'a WakeSettings) -> &'a str {
        self.control_path.as_deref().unwrap_or(&settings.control_path)
    }

    pub fn health_path<'a>(&'a self, settings: &'a WakeSettings) -> &'a str {
        self.health_path.as_deref().unwrap_or(&settings.health_path)
    }

    /// Build the routing-time view of this backend
    pub fn to_backend(&self, name: &str, settings: &WakeSettings) -> Backend {
        Backend {
            name: name.to_string(),
            host: self.host.clone(),
            port: self.port,
            control_path: self.control_path(settings).to_string(),
            health_path: self.health_path(settings).to_string(),
            protocol_version: self.protocol_version,
        }
    }

    /// Validate the backend configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("Backend '{}': 'host' must not be empty", name));
        }

        if self.port == 0 {
            return Err(format!("Backend '{}': 'port' must be greater than 0", name));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_callback_timeout() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_poll_interval() -> u64 {
    10
}

fn default_wake_cooldown() -> u64 {
    120 // 2 minutes
}

fn default_initial_poll_delay() -> u64 {
    1
}

fn default_wake_timeout() -> u64 {
    5
}

fn default_selection_probe_timeout() -> u64 {
    10
}

fn default_max_poll_attempts() -> u32 {
    60 // 10 minutes at the default interval
}

fn default_control_path() -> String {
    "start".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse, normalize and validate configuration text
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.wake.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, backend) in &self.backends {
            if let Err(e) = backend.validate(name) {
                errors.push(e);
            }
        }

        for name in &self.server.fallback_order {
            if !self.backends.contains_key(name) {
                errors.push(format!("Fallback backend '{}' is not configured", name));
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
