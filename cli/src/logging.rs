//! Tracing / logging initialisation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Build from CLI flags. `overrides` are `component=level` pairs;
    /// malformed entries are ignored.
    pub fn from_flags(level: &str, json: bool, overrides: &[String]) -> Self {
        let components = overrides
            .iter()
            .filter_map(|o| o.split_once('='))
            .map(|(c, l)| (c.trim().to_string(), l.trim().to_string()))
            .filter(|(c, l)| !c.is_empty() && !l.is_empty())
            .collect();
        Self {
            level: level.to_string(),
            components,
            json,
        }
    }

    /// `EnvFilter` directive string: "info,chaintrace_evm=debug" etc.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, replaces the
/// configured directives. Call once at startup.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_component_overrides() {
        let config = LogConfig::from_flags(
            "warn",
            false,
            &["chaintrace-evm=debug".into(), "tower_http=info".into()],
        );
        assert_eq!(config.directives(), "warn,chaintrace_evm=debug,tower_http=info");
    }

    #[test]
    fn malformed_overrides_are_dropped() {
        let config = LogConfig::from_flags("info", true, &["nolevel".into(), "=debug".into()]);
        assert!(config.components.is_empty());
        assert!(config.json);
        assert_eq!(config.directives(), "info");
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert_eq!(config.level, "info");
        assert!(config.json);
    }
}
