use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `PAYWALL__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub presentation: PresentationConfig,
    #[serde(default)]
    pub events: EventConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of prepared units retained at once.
    #[serde(default = "default_max_units")]
    pub max_units: usize,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresentationConfig {
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
    #[serde(default = "default_locale")]
    pub default_locale: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    /// Parameter keys starting with this prefix belong to the SDK and are
    /// stripped before rule evaluation.
    #[serde(default = "default_reserved_prefix")]
    pub reserved_prefix: String,
    /// Event names the SDK tracks internally. Callers may not track them.
    #[serde(default = "default_reserved_names")]
    pub reserved_names: Vec<String>,
}

// Default functions
fn default_max_units() -> usize {
    8
}
fn default_maintenance_interval_ms() -> u64 {
    30_000
}
fn default_watchdog_timeout_ms() -> u64 {
    5000
}
fn default_locale() -> String {
    "en_US".to_string()
}
fn default_reserved_prefix() -> String {
    "$".to_string()
}
fn default_reserved_names() -> Vec<String> {
    [
        "app_open",
        "app_launch",
        "session_start",
        "paywall_open",
        "paywall_close",
        "trigger_fire",
        "transaction_complete",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_units: default_max_units(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            default_locale: default_locale(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            reserved_prefix: default_reserved_prefix(),
            reserved_names: default_reserved_names(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PAYWALL")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.cache.max_units, 8);
        assert_eq!(config.presentation.watchdog_timeout_ms, 5000);
        assert_eq!(config.presentation.default_locale, "en_US");
        assert_eq!(config.events.reserved_prefix, "$");
        assert!(config.events.reserved_names.contains(&"paywall_open".to_string()));
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"cache": {"max_units": 2}}"#).expect("valid config");
        assert_eq!(config.cache.max_units, 2);
        assert_eq!(config.cache.maintenance_interval_ms, 30_000);
        assert_eq!(config.presentation.watchdog_timeout_ms, 5000);
    }
}
