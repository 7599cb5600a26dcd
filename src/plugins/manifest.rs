//! On-disk plugin manifest (`plugin-manifest.json`)

use super::{Capabilities, PluginDescriptor, PluginKind, SubprocessSpec};
use crate::error::{Result, VcpError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub const MANIFEST_FILE: &str = "plugin-manifest.json";

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Parsed manifest of a disk-based plugin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// One of: subprocess, preprocessor, service, static, internal, direct
    #[serde(default)]
    pub plugin_type: Option<String>,
    #[serde(default)]
    pub entry_point: Option<EntryPoint>,
    #[serde(default)]
    pub communication: Option<Communication>,
    #[serde(default)]
    pub config_schema: HashMap<String, ConfigEntry>,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Placeholder values contributed by static plugins
    #[serde(default)]
    pub static_values: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryPoint {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Communication {
    /// Execution timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigEntry {
    #[serde(default)]
    pub default: Option<Value>,
}

impl PluginManifest {
    /// Read and parse `<dir>/plugin-manifest.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            VcpError::plugin_load(format!("cannot read {}: {e}", path.display()))
        })?;
        let manifest: Self = serde_json::from_str(&raw).map_err(|e| {
            VcpError::invalid_manifest(format!("malformed {}: {e}", path.display()))
        })?;
        if manifest.name.trim().is_empty() {
            return Err(VcpError::invalid_manifest(format!(
                "{} has an empty name",
                path.display()
            )));
        }
        Ok(manifest)
    }

    /// Effective plugin id (explicit `id`, falling back to `name`).
    pub fn plugin_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.communication
            .as_ref()
            .and_then(|c| c.timeout)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Config-schema defaults, stringified for the child environment.
    pub fn config_defaults(&self) -> HashMap<String, String> {
        self.config_schema
            .iter()
            .filter_map(|(name, entry)| {
                let default = entry.default.as_ref()?;
                let rendered = match default {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((name.clone(), rendered))
            })
            .collect()
    }

    /// Convert into a registry descriptor rooted at `dir`.
    pub fn into_descriptor(self, dir: &Path) -> Result<PluginDescriptor> {
        let id = self.plugin_id().to_string();
        let kind_label = self.plugin_type.as_deref().unwrap_or("subprocess");

        let subprocess_spec = || -> Result<SubprocessSpec> {
            let entry = self
                .entry_point
                .as_ref()
                .map(|e| e.command.clone())
                .ok_or_else(|| {
                    VcpError::invalid_manifest(format!("plugin {id} has no entryPoint.command"))
                })?;
            Ok(SubprocessSpec {
                directory: dir.to_path_buf(),
                entry,
                config_defaults: self.config_defaults(),
                timeout_ms: self.timeout_ms(),
            })
        };

        let kind = match kind_label {
            "subprocess" => PluginKind::Subprocess(subprocess_spec()?),
            "preprocessor" => PluginKind::Preprocessor(subprocess_spec()?),
            "service" => PluginKind::Service,
            "static" => PluginKind::Static {
                values: self.static_values.clone(),
            },
            "internal" => PluginKind::Internal,
            "direct" => PluginKind::Direct,
            "distributed" => {
                return Err(VcpError::invalid_manifest(format!(
                    "plugin {id}: distributed plugins register over the channel, not from disk"
                )))
            }
            other => {
                return Err(VcpError::invalid_manifest(format!(
                    "plugin {id} has unknown pluginType {other:?}"
                )))
            }
        };

        Ok(PluginDescriptor {
            id,
            name: self.name,
            version: self.version.unwrap_or_else(|| "0.0.0".to_string()),
            description: self.description.unwrap_or_default(),
            kind,
            capabilities: self.capabilities,
        })
    }
}
