//! Plugin registry: primary map, side tables, catalog and dispatch

use super::{
    subprocess, Capabilities, PluginDescriptor, PluginEvent, PluginKind, SubprocessSpec,
};
use crate::error::{ErrorKind, Result, VcpError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

/// Catalog keys are the plugin id behind this prefix.
pub const CATALOG_KEY_PREFIX: &str = "VCP";

const DISTRIBUTED_TIMEOUT: Duration = Duration::from_secs(30);
const INTERNAL_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 64;

/// Executes a tool on a remote worker session. Implemented by the
/// distributed-tool channel and injected via
/// [`PluginRegistry::set_distributed_executor`].
#[async_trait]
pub trait DistributedExecutor: Send + Sync {
    async fn execute(
        &self,
        session_id: &str,
        tool_name: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<Value>;
}

/// Request for an internal plugin that is not in the built-in table.
/// The registered handler must answer on `reply` within 5 s.
#[derive(Debug)]
pub struct InternalExecuteRequest {
    pub plugin_id: String,
    pub args: Value,
    pub reply: oneshot::Sender<Result<Value>>,
}

/// Handle to a service-kind plugin, mounted by the embedding layer.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub plugin_id: String,
    pub name: String,
    pub description: String,
}

#[derive(Default)]
struct RegistryState {
    plugins: HashMap<String, PluginDescriptor>,
    /// Derived per-plugin catalog strings, keyed `VCP<id>`
    catalog: HashMap<String, String>,
    preprocessor_order: Vec<String>,
    services: HashMap<String, ServiceHandle>,
    static_values: HashMap<String, String>,
}

/// The plugin runtime's registry. All mutation funnels through the write
/// lock; the catalog is rebuilt under the same lock so readers always see
/// a catalog consistent with the plugin set.
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    plugin_root: PathBuf,
    events: broadcast::Sender<PluginEvent>,
    distributed: RwLock<Option<Arc<dyn DistributedExecutor>>>,
    internal_handler: RwLock<Option<mpsc::Sender<InternalExecuteRequest>>>,
}

impl PluginRegistry {
    pub fn new(plugin_root: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            plugin_root,
            events,
            distributed: RwLock::new(None),
            internal_handler: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PluginEvent) {
        // Advisory; nobody listening is fine
        let _ = self.events.send(event);
    }

    pub async fn set_distributed_executor(&self, executor: Arc<dyn DistributedExecutor>) {
        *self.distributed.write().await = Some(executor);
    }

    pub async fn set_internal_handler(&self, handler: mpsc::Sender<InternalExecuteRequest>) {
        *self.internal_handler.write().await = Some(handler);
    }

    /// Register a plugin. Distributed duplicates are refused; other kinds
    /// overwrite the previous registration.
    pub async fn register(&self, descriptor: PluginDescriptor) -> Result<()> {
        if descriptor.id.trim().is_empty() || descriptor.name.trim().is_empty() {
            return Err(VcpError::plugin_load("plugin id and name are required"));
        }

        let id = descriptor.id.clone();
        {
            let mut state = self.state.write().await;
            if state.plugins.contains_key(&id) {
                if matches!(descriptor.kind, PluginKind::Distributed { .. }) {
                    tracing::warn!(id = %id, "refusing distributed plugin with duplicate id");
                    return Err(VcpError::plugin_load(format!(
                        "plugin id {id} is already registered"
                    )));
                }
                tracing::info!(id = %id, "overwriting registered plugin");
                Self::remove_side_entries(&mut state, &id);
            }

            match &descriptor.kind {
                PluginKind::Preprocessor(_) => {
                    if !state.preprocessor_order.contains(&id) {
                        state.preprocessor_order.push(id.clone());
                    }
                }
                PluginKind::Service => {
                    state.services.insert(
                        descriptor.name.clone(),
                        ServiceHandle {
                            plugin_id: id.clone(),
                            name: descriptor.name.clone(),
                            description: descriptor.description.clone(),
                        },
                    );
                }
                PluginKind::Static { values } => {
                    state.static_values.extend(values.clone());
                }
                _ => {}
            }

            state.plugins.insert(id.clone(), descriptor);
            Self::rebuild_catalog(&mut state);
        }

        tracing::info!(id = %id, "plugin registered");
        self.emit(PluginEvent::Registered { id });
        Ok(())
    }

    /// Remove a plugin and everything derived from it.
    pub async fn unload(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.plugins.contains_key(id) {
                return Err(VcpError::plugin_not_found(format!(
                    "no plugin registered under id {id}"
                )));
            }
            Self::remove_side_entries(&mut state, id);
            state.plugins.remove(id);
            Self::rebuild_catalog(&mut state);
        }
        tracing::info!(id, "plugin unloaded");
        self.emit(PluginEvent::Unloaded { id: id.to_string() });
        Ok(())
    }

    /// Register a worker session's advertised toolset. Invalid entries and
    /// id collisions are skipped with a warning; the catalog is rebuilt
    /// once at the end. Returns the accepted plugin ids.
    pub async fn bulk_register(&self, session_id: &str, tools: &[Value]) -> Vec<String> {
        let mut accepted: Vec<String> = Vec::new();
        {
            let mut state = self.state.write().await;
            for tool in tools {
                let Some(name) = tool
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|n| !n.trim().is_empty())
                else {
                    tracing::warn!(session = session_id, "skipping distributed tool without a name");
                    continue;
                };
                let id = tool
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or(name)
                    .to_string();
                if state.plugins.contains_key(&id) {
                    tracing::warn!(id = %id, session = session_id, "refusing distributed plugin with duplicate id");
                    continue;
                }

                let capabilities = tool
                    .get("capabilities")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<Capabilities>(v).ok())
                    .unwrap_or_default();

                state.plugins.insert(
                    id.clone(),
                    PluginDescriptor {
                        id: id.clone(),
                        name: name.to_string(),
                        version: tool
                            .get("version")
                            .and_then(Value::as_str)
                            .unwrap_or("0.0.0")
                            .to_string(),
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        kind: PluginKind::Distributed {
                            session_id: session_id.to_string(),
                        },
                        capabilities,
                    },
                );
                accepted.push(id);
            }
            Self::rebuild_catalog(&mut state);
        }

        if !accepted.is_empty() {
            tracing::info!(session = session_id, count = accepted.len(), "distributed tools registered");
        }
        for id in &accepted {
            self.emit(PluginEvent::Registered { id: id.clone() });
        }
        accepted
    }

    /// Drop every plugin owned by `session_id`. Returns the dropped ids.
    pub async fn bulk_unregister(&self, session_id: &str) -> Vec<String> {
        let dropped: Vec<String> = {
            let mut state = self.state.write().await;
            let ids: Vec<String> = state
                .plugins
                .iter()
                .filter(|(_, d)| d.session_id() == Some(session_id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                state.plugins.remove(id);
            }
            Self::rebuild_catalog(&mut state);
            ids
        };

        if !dropped.is_empty() {
            tracing::info!(session = session_id, count = dropped.len(), "distributed tools unregistered");
        }
        for id in &dropped {
            self.emit(PluginEvent::Unloaded { id: id.clone() });
        }
        dropped
    }

    /// Selective withdrawal of named tools belonging to `session_id`.
    pub async fn unregister_names(&self, session_id: &str, names: &[String]) -> Vec<String> {
        let dropped: Vec<String> = {
            let mut state = self.state.write().await;
            let ids: Vec<String> = state
                .plugins
                .iter()
                .filter(|(id, d)| {
                    d.session_id() == Some(session_id)
                        && (names.contains(id) || names.contains(&d.name))
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                state.plugins.remove(id);
            }
            Self::rebuild_catalog(&mut state);
            ids
        };
        for id in &dropped {
            self.emit(PluginEvent::Unloaded { id: id.clone() });
        }
        dropped
    }

    /// Snapshot of the rendered tool catalog, keyed `VCP<id>`.
    pub async fn tool_catalog(&self) -> HashMap<String, String> {
        self.state.read().await.catalog.clone()
    }

    /// Snapshot of placeholder values contributed by static plugins.
    pub async fn static_values(&self) -> HashMap<String, String> {
        self.state.read().await.static_values.clone()
    }

    pub async fn service(&self, name: &str) -> Option<ServiceHandle> {
        self.state.read().await.services.get(name).cloned()
    }

    /// Ids of all currently registered plugins (test and admin surface).
    pub async fn plugin_ids(&self) -> Vec<String> {
        self.state.read().await.plugins.keys().cloned().collect()
    }

    /// Run the preprocessor pipeline in registration order. A failing
    /// preprocessor is logged and the unmodified list moves on.
    pub async fn preprocess(&self, messages: Vec<Value>) -> Vec<Value> {
        let pipeline: Vec<(String, SubprocessSpec)> = {
            let state = self.state.read().await;
            state
                .preprocessor_order
                .iter()
                .filter_map(|id| match state.plugins.get(id).map(|d| &d.kind) {
                    Some(PluginKind::Preprocessor(spec)) => Some((id.clone(), spec.clone())),
                    _ => None,
                })
                .collect()
        };

        let mut current = messages;
        for (id, spec) in pipeline {
            match subprocess::run_preprocessor(&spec, &self.plugin_root, &id, &current).await {
                Ok(next) => current = next,
                Err(e) => {
                    tracing::warn!(plugin = %id, error = %e, "preprocessor failed, forwarding unmodified messages");
                }
            }
        }
        current
    }

    /// Execute a plugin by id. Exactly one of `Executed` / `Error` is
    /// emitted per call.
    pub async fn execute(&self, id: &str, args: &Value) -> Result<Value> {
        let result = self.dispatch(id, args).await;
        match &result {
            Ok(_) => self.emit(PluginEvent::Executed { id: id.to_string() }),
            Err(e) => self.emit(PluginEvent::Error {
                id: id.to_string(),
                message: e.to_string(),
            }),
        }
        result
    }

    async fn dispatch(&self, id: &str, args: &Value) -> Result<Value> {
        let descriptor = {
            let state = self.state.read().await;
            state.plugins.get(id).cloned()
        }
        .ok_or_else(|| VcpError::tool_not_found(format!("no plugin registered under id {id}")))?;

        let kind_label = descriptor.kind.label();
        match descriptor.kind {
            PluginKind::Subprocess(spec) => {
                subprocess::execute(&spec, &self.plugin_root, id, args).await
            }
            PluginKind::Distributed { session_id } => {
                let executor = self.distributed.read().await.clone().ok_or_else(|| {
                    VcpError::distributed_connection(format!(
                        "plugin {id} is distributed but no distributed executor is configured"
                    ))
                })?;
                match tokio::time::timeout(
                    DISTRIBUTED_TIMEOUT,
                    executor.execute(&session_id, id, args, DISTRIBUTED_TIMEOUT),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(VcpError::tool_timeout(format!(
                        "distributed plugin {id} timed out after {DISTRIBUTED_TIMEOUT:?}"
                    ))),
                }
            }
            PluginKind::Internal => self.execute_internal(id, args).await,
            PluginKind::Preprocessor(_)
            | PluginKind::Service
            | PluginKind::Static { .. }
            | PluginKind::Direct => Err(VcpError::new(
                ErrorKind::InvalidToolRequest,
                format!("plugin {id} (kind {kind_label}) is not executable via execute"),
            )),
        }
    }

    async fn execute_internal(&self, id: &str, args: &Value) -> Result<Value> {
        // Catalog-style internals answer with empty lists
        if matches!(id, "AgentAssistant" | "AgentMessage") {
            return Ok(Value::Array(Vec::new()));
        }

        let handler = self.internal_handler.read().await.clone().ok_or_else(|| {
            VcpError::new(
                ErrorKind::PluginInitError,
                format!("no internal handler registered for plugin {id}"),
            )
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        handler
            .send(InternalExecuteRequest {
                plugin_id: id.to_string(),
                args: args.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| VcpError::new(ErrorKind::PluginInitError, "internal handler is gone"))?;

        match tokio::time::timeout(INTERNAL_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VcpError::tool_execution_failed(format!(
                "internal handler dropped the request for {id}"
            ))),
            Err(_) => Err(VcpError::tool_timeout(format!(
                "internal plugin {id} timed out after {INTERNAL_TIMEOUT:?}"
            ))),
        }
    }

    fn remove_side_entries(state: &mut RegistryState, id: &str) {
        let Some(descriptor) = state.plugins.get(id) else {
            return;
        };
        match &descriptor.kind {
            PluginKind::Preprocessor(_) => {
                let id = id.to_string();
                state.preprocessor_order.retain(|p| p != &id);
            }
            PluginKind::Service => {
                state.services.retain(|_, handle| handle.plugin_id != id);
            }
            PluginKind::Static { values } => {
                let keys: Vec<String> = values.keys().cloned().collect();
                for key in keys {
                    state.static_values.remove(&key);
                }
            }
            _ => {}
        }
    }

    /// The catalog is a pure function of the plugin map: one rendered
    /// block per plugin with at least one described invocation command.
    fn rebuild_catalog(state: &mut RegistryState) {
        state.catalog.clear();
        for (id, plugin) in &state.plugins {
            let commands: Vec<_> = plugin
                .capabilities
                .invocation_commands
                .iter()
                .filter(|c| !c.description.is_empty())
                .collect();
            if commands.is_empty() {
                continue;
            }

            let mut blocks = Vec::new();
            for command in commands {
                let mut block =
                    format!("- {} ({}) - command: {}:\n", plugin.name, id, command.command);
                for line in command.description.lines() {
                    block.push_str("    ");
                    block.push_str(line);
                    block.push('\n');
                }
                if !command.example.is_empty() {
                    block.push_str("  call example:\n");
                    for line in command.example.lines() {
                        block.push_str("    ");
                        block.push_str(line);
                        block.push('\n');
                    }
                }
                blocks.push(block.trim_end().to_string());
            }
            state
                .catalog
                .insert(format!("{CATALOG_KEY_PREFIX}{id}"), blocks.join("\n\n"));
        }
    }
}
