use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

pub const SERVICE_ENV: &str = "SHARED_ACTIVITY_SERVICE";
pub const DEFAULT_SERVICE: &str = "org.sharedactivity.Tube";

/// Tube negotiation settings shared by every session a manager handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeConfig {
    /// Service identifier that marks this activity's tubes.
    pub service: String,
    /// Parameters attached to tubes this side offers.
    #[serde(default)]
    pub offer_params: HashMap<String, String>,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl TubeConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            offer_params: HashMap::new(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let service = env::var(SERVICE_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        Self::new(service)
    }

    pub fn with_offer_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.offer_params.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_uses_default_service() {
        let config = TubeConfig::default();
        assert_eq!(config.service, DEFAULT_SERVICE);
        assert!(config.offer_params.is_empty());
    }

    #[test]
    fn from_env_reads_service_and_ignores_blank() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var(SERVICE_ENV).ok();

        env::set_var(SERVICE_ENV, " org.example.Chat ");
        assert_eq!(TubeConfig::from_env().service, "org.example.Chat");

        env::set_var(SERVICE_ENV, "   ");
        assert_eq!(TubeConfig::from_env().service, DEFAULT_SERVICE);

        env::remove_var(SERVICE_ENV);
        assert_eq!(TubeConfig::from_env().service, DEFAULT_SERVICE);

        if let Some(orig) = original {
            env::set_var(SERVICE_ENV, orig);
        }
    }

    #[test]
    fn deserializes_without_offer_params() {
        let config: TubeConfig =
            serde_json::from_str(r#"{"service":"org.example.Draw"}"#).unwrap();
        assert_eq!(config, TubeConfig::new("org.example.Draw"));

        let config = TubeConfig::new("org.example.Draw").with_offer_param("color", "blue");
        assert_eq!(config.offer_params.get("color").map(String::as_str), Some("blue"));
    }
}
