//! Backends that can be woken and the registry that resolves them by name

use crate::config::{BackendConfig, WakeSettings};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// A named compute node clients can be routed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    /// Unique backend name
    pub name: String,
    /// Host of the backend and its wake endpoint
    pub host: String,
    /// Port of the backend and its wake endpoint
    pub port: u16,
    /// Path of the wake endpoint, without a leading slash
    pub control_path: String,
    /// Path used by HTTP probes
    pub health_path: String,
    /// Protocol version sent along with health probes
    pub protocol_version: Option<i32>,
}

impl Backend {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            control_path: "start".to_string(),
            health_path: "/health".to_string(),
            protocol_version: None,
        }
    }

    pub fn with_control_path(mut self, path: &str) -> Self {
        self.control_path = path.to_string();
        self
    }

    /// `host:port` of the backend
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL of the wake endpoint
    pub fn control_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.host,
            self.port,
            self.control_path.trim_start_matches('/')
        )
    }
}

/// Resolves backend names to routable backends
pub trait BackendRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Backend>;
}

/// Result of applying a new set of backends
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadResult {
    /// Newly added backends
    pub added: Vec<String>,
    /// Backends no longer configured
    pub removed: Vec<String>,
    /// Backends still configured (changes apply to the next routing decision)
    pub updated: Vec<String>,
}

struct RegistryState {
    backends: HashMap<String, BackendConfig>,
    settings: WakeSettings,
}

/// Backend registry built from configuration; supports hot reload
pub struct StaticRegistry {
    state: RwLock<RegistryState>,
}

impl StaticRegistry {
    pub fn new(backends: HashMap<String, BackendConfig>, settings: WakeSettings) -> Self {
        Self {
            state: RwLock::new(RegistryState { backends, settings }),
        }
    }

    /// Names of all configured backends, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace the configured backends and wake settings
    pub fn apply(
        &self,
        new_backends: HashMap<String, BackendConfig>,
        new_settings: WakeSettings,
    ) -> ReloadResult {
        let mut result = ReloadResult::default();
        let mut state = self.state.write();

        let new_names: HashSet<&String> = new_backends.keys().collect();
        for name in state.backends.keys() {
            if !new_names.contains(name) {
                info!(backend = %name, "Removing backend (config reload)");
                result.removed.push(name.clone());
            }
        }

        for name in new_backends.keys() {
            if state.backends.contains_key(name) {
                result.updated.push(name.clone());
            } else {
                info!(backend = %name, "Adding backend (config reload)");
                result.added.push(name.clone());
            }
        }

        state.backends = new_backends;
        state.settings = new_settings;

        result.added.sort();
        result.removed.sort();
        result.updated.sort();
        result
    }
}

impl BackendRegistry for StaticRegistry {
    fn resolve(&self, name: &str) -> Option<Backend> {
        let state = self.state.read();
        state
            .backends
            .get(name)
            .map(|config| config.to_backend(name, &state.settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_registry() -> StaticRegistry {
        let mut backends = HashMap::new();
        backends.insert("lobby-1".to_string(), BackendConfig::new("10.0.0.1", 25565));
        let mut lobby2 = BackendConfig::new("10.0.0.2", 25566);
        lobby2.control_path = Some("/wake".to_string());
        backends.insert("lobby-2".to_string(), lobby2);
        StaticRegistry::new(backends, WakeSettings::default())
    }

    #[test]
    fn test_control_url() {
        let backend = Backend::new("lobby-2", "10.0.0.2", 25566);
        assert_eq!(backend.control_url(), "http://10.0.0.2:25566/start");

        let backend = backend.with_control_path("/wake");
        assert_eq!(backend.control_url(), "http://10.0.0.2:25566/wake");
        assert_eq!(backend.address(), "10.0.0.2:25566");
    }

    #[test]
    fn test_resolve() {
        let registry = create_test_registry();

        let backend = registry.resolve("lobby-2").unwrap();
        assert_eq!(backend.port, 25566);
        assert_eq!(backend.control_url(), "http://10.0.0.2:25566/wake");

        assert!(registry.resolve("unknown").is_none());
        assert_eq!(registry.names(), vec!["lobby-1", "lobby-2"]);
    }

    #[test]
    fn test_apply_reports_changes() {
        let registry = create_test_registry();

        let mut backends = HashMap::new();
        backends.insert("lobby-2".to_string(), BackendConfig::new("10.0.0.9", 25566));
        backends.insert("survival".to_string(), BackendConfig::new("10.0.0.3", 25567));
        let result = registry.apply(backends, WakeSettings::default());

        assert_eq!(result.added, vec!["survival"]);
        assert_eq!(result.removed, vec!["lobby-1"]);
        assert_eq!(result.updated, vec!["lobby-2"]);
        assert_eq!(registry.resolve("lobby-2").unwrap().host, "10.0.0.9");
        assert!(registry.resolve("lobby-1").is_none());
    }

    #[test]
    fn test_apply_updates_default_control_path() {
        let registry = create_test_registry();
        let mut backends = HashMap::new();
        backends.insert("lobby-1".to_string(), BackendConfig::new("10.0.0.1", 25565));
        let settings = WakeSettings {
            control_path: "boot".to_string(),
            ..WakeSettings::default()
        };

        registry.apply(backends, settings);

        assert_eq!(
            registry.resolve("lobby-1").unwrap().control_url(),
            "http://10.0.0.1:25565/boot"
        );
    }
}
