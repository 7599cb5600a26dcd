//! Startup discovery of disk-based plugins
//!
//! Every subdirectory of the plugin root holding a `plugin-manifest.json`
//! is parsed and registered. A bad manifest skips that plugin only.

use super::manifest::{PluginManifest, MANIFEST_FILE};
use super::registry::PluginRegistry;
use std::path::Path;

/// Scan `root` and register everything that parses. Returns the number of
/// plugins registered.
pub async fn load_plugins(registry: &PluginRegistry, root: &Path) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %root.display(), error = %e, "plugin directory not readable");
            return 0;
        }
    };

    let mut loaded = 0;
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() || !dir.join(MANIFEST_FILE).is_file() {
            continue;
        }

        let descriptor = match PluginManifest::load(&dir).and_then(|m| m.into_descriptor(&dir)) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping plugin");
                continue;
            }
        };

        let id = descriptor.id.clone();
        match registry.register(descriptor).await {
            Ok(()) => {
                tracing::info!(id = %id, dir = %dir.display(), "plugin loaded");
                loaded += 1;
            }
            Err(e) => tracing::warn!(id = %id, error = %e, "plugin registration failed"),
        }
    }

    tracing::info!(count = loaded, dir = %root.display(), "plugin scan complete");
    loaded
}
