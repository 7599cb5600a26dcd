//! Built-in placeholder providers: time, environment, static map, catalog

use super::ValueProvider;
use crate::error::Result;
use crate::plugins::PluginRegistry;
use async_trait::async_trait;
use chrono::{Local, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Serves `Date`, `Time`, `Today`, `DateTime`, `Timestamp`, `ISO8601`.
pub struct TimeProvider;

#[async_trait]
impl ValueProvider for TimeProvider {
    fn name(&self) -> &str {
        "time"
    }

    async fn value(&self, key: &str) -> Result<Option<String>> {
        let now = Local::now();
        let rendered = match key {
            "Date" => now.format("%Y-%m-%d").to_string(),
            "Time" => now.format("%H:%M:%S").to_string(),
            "Today" => now.format("%A, %B %d, %Y").to_string(),
            "DateTime" => now.format("%Y-%m-%d %H:%M:%S").to_string(),
            "Timestamp" => now.timestamp().to_string(),
            "ISO8601" => Utc::now().to_rfc3339(),
            _ => return Ok(None),
        };
        Ok(Some(rendered))
    }
}

/// Serves keys whose literal name is an OS environment variable matching
/// one of the configured prefixes.
///
/// A matching key whose variable is unset resolves to a visible marker so
/// downstream text clearly carries the omission.
pub struct EnvProvider {
    prefixes: Vec<String>,
}

impl EnvProvider {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(vec![
            "Tar".to_string(),
            "Var".to_string(),
            "ENV_".to_string(),
        ])
    }
}

#[async_trait]
impl ValueProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn value(&self, key: &str) -> Result<Option<String>> {
        if !self.prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            return Ok(None);
        }
        match std::env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Ok(Some(format!("[not configured {key}]"))),
        }
    }
}

/// In-memory map settable by the embedding application (and fed by
/// `static`-kind plugins).
pub struct StaticProvider {
    values: RwLock<HashMap<String, String>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, key: &str) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn extend(&self, entries: HashMap<String, String>) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(entries);
    }
}

impl Default for StaticProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValueProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }
}

/// Serves the placeholder values contributed by `static`-kind plugins.
pub struct PluginStaticProvider {
    registry: Arc<PluginRegistry>,
}

impl PluginStaticProvider {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ValueProvider for PluginStaticProvider {
    fn name(&self) -> &str {
        "plugin-static"
    }

    async fn value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.registry.static_values().await.get(key).cloned())
    }
}

/// Key under which the full tool catalog is served.
pub const ALL_TOOLS_KEY: &str = "VCPAllTools";

/// Resolves `VCPAllTools` and per-plugin `VCP<id>` keys from the plugin
/// runtime's catalog.
pub struct CatalogProvider {
    registry: Arc<PluginRegistry>,
}

impl CatalogProvider {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ValueProvider for CatalogProvider {
    fn name(&self) -> &str {
        "catalog"
    }

    async fn value(&self, key: &str) -> Result<Option<String>> {
        if key == ALL_TOOLS_KEY {
            let catalog = self.registry.tool_catalog().await;
            if catalog.is_empty() {
                return Ok(Some("(no tools registered)".to_string()));
            }
            let mut keys: Vec<&String> = catalog.keys().collect();
            keys.sort();
            let joined = keys
                .iter()
                .map(|k| catalog[*k].as_str())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");
            return Ok(Some(joined));
        }
        if key.starts_with("VCP") {
            return Ok(self.registry.tool_catalog().await.get(key).cloned());
        }
        Ok(None)
    }
}
