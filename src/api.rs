//! HTTP/WebSocket surface: application state and the channel router

mod handlers;

pub use handlers::create_router;

use crate::channels::distributed::{ChannelEvent, DistributedToolChannel};
use crate::channels::hub::BroadcastHub;
use crate::config::ServerConfig;
use crate::files::FileFetcher;
use crate::orchestrator::ToolOrchestrator;
use crate::plugins::{loader, PluginRegistry};
use crate::protocol::ToolCallParser;
use crate::template::providers::{
    CatalogProvider, EnvProvider, PluginStaticProvider, StaticProvider, TimeProvider,
};
use crate::template::{EngineConfig, TemplateEngine};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<PluginRegistry>,
    pub channel: Arc<DistributedToolChannel>,
    pub engine: Arc<TemplateEngine>,
    pub fetcher: Arc<FileFetcher>,
    pub orchestrator: Arc<ToolOrchestrator>,
    pub log_hub: Arc<BroadcastHub>,
    pub info_hub: Arc<BroadcastHub>,
    pub chrome_hub: Arc<BroadcastHub>,
    pub admin_hub: Arc<BroadcastHub>,
}

impl AppState {
    /// Build and wire every component: registry, distributed channel (as
    /// the registry's distributed executor and the catalog's tool feed),
    /// template engine with the built-in providers, file fetcher and the
    /// broadcast hubs. Also starts the channel→registry event bridge and
    /// scans the plugin directory.
    pub async fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(PluginRegistry::new(config.plugin_dir.clone()));
        let channel = Arc::new(DistributedToolChannel::new());
        registry.set_distributed_executor(channel.clone()).await;
        spawn_channel_bridge(registry.clone(), channel.clone());

        loader::load_plugins(&registry, &config.plugin_dir).await;

        let mut engine = TemplateEngine::new(EngineConfig::default());
        engine.register_provider(Arc::new(TimeProvider));
        engine.register_provider(Arc::new(StaticProvider::new()));
        engine.register_provider(Arc::new(PluginStaticProvider::new(registry.clone())));
        engine.register_provider(Arc::new(CatalogProvider::new(registry.clone())));
        engine.register_provider(Arc::new(EnvProvider::default()));

        let fetcher = Arc::new(FileFetcher::new(
            config.file_cache_dir.clone(),
            channel.clone(),
        ));
        let orchestrator = Arc::new(ToolOrchestrator::new(
            Arc::new(ToolCallParser::with_defaults()),
            registry.clone(),
        ));

        Self {
            config,
            registry,
            channel,
            engine: Arc::new(engine),
            fetcher,
            orchestrator,
            log_hub: Arc::new(BroadcastHub::new("log")),
            info_hub: Arc::new(BroadcastHub::new("info")),
            chrome_hub: Arc::new(BroadcastHub::new("chrome-observer")),
            admin_hub: Arc::new(BroadcastHub::new("admin-panel")),
        }
    }
}

/// Forward channel tool announcements into the plugin registry.
fn spawn_channel_bridge(registry: Arc<PluginRegistry>, channel: Arc<DistributedToolChannel>) {
    let mut events = channel.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::ToolsRegistered { session_id, tools }) => {
                    registry.bulk_register(&session_id, &tools).await;
                }
                Ok(ChannelEvent::ToolsUnregistered { session_id, tools }) => {
                    if tools.is_empty() {
                        registry.bulk_unregister(&session_id).await;
                    } else {
                        registry.unregister_names(&session_id, &tools).await;
                    }
                }
                Ok(ChannelEvent::AsyncToolResult { session_id, status, .. }) => {
                    tracing::info!(session = %session_id, status = %status, "worker pushed asynchronous tool result");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "channel event bridge lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Frame;
    use serde_json::json;
    use std::time::Duration;

    async fn test_state() -> AppState {
        let plugins = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        AppState::new(ServerConfig {
            port: 0,
            access_key: "secret".to_string(),
            plugin_dir: plugins.path().to_path_buf(),
            file_cache_dir: cache.path().to_path_buf(),
            debug_mode: false,
        })
        .await
    }

    #[tokio::test]
    async fn test_bridge_registers_and_drops_worker_tools() {
        let state = test_state().await;

        let (tx, mut rx) = tokio::sync::mpsc::channel(DistributedToolChannel::outbound_capacity());
        let session_id = state.channel.open_session(tx).await;
        let _ack = rx.recv().await.unwrap();

        state
            .channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "register_tools",
                    json!({"tools": [{
                        "name": "Remote",
                        "description": "remote tool",
                        "capabilities": {"invocationCommands": [
                            {"command": "run", "description": "runs remotely", "example": "run"}
                        ]}
                    }]}),
                )
                .to_text(),
            )
            .await;

        // The bridge task registers asynchronously
        let mut registered = false;
        for _ in 0..50 {
            if state.registry.tool_catalog().await.contains_key("VCPRemote") {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registered, "worker tool never reached the registry");

        // Catalog feeds the template engine
        let resolved = state.engine.resolve("{{VCPRemote}}").await.unwrap();
        assert!(resolved.contains("runs remotely"));

        state.channel.close_session(&session_id).await;
        for _ in 0..50 {
            if !state.registry.tool_catalog().await.contains_key("VCPRemote") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker tool survived disconnect");
    }
}
