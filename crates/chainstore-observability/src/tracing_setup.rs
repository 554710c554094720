//! Logging initialisation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for an indexer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-crate overrides, e.g. `chainstore-storage` → `debug`.
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// The `EnvFilter` directive string this config describes, e.g.
    /// `"info,chainstore_storage=debug"`.
    fn directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(
                self.components
                    .iter()
                    .map(|(component, level)| format!("{}={level}", component.replace('-', "_"))),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Install the global subscriber. Call once at process startup.
pub fn init_tracing(config: &LogConfig) {
    let filter =
        EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_component_overrides() {
        let mut config = LogConfig::default();
        config
            .components
            .insert("chainstore-storage".into(), "debug".into());
        let directives = config.directives();
        assert!(directives.starts_with("info"));
        assert!(directives.contains("chainstore_storage=debug"));
    }
}
