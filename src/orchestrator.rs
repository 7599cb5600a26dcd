//! The tool-call turn: parse model output, dispatch each invocation
//! through the plugin runtime, format results for re-ingestion
//!
//! Fire-and-forget invocations are spawned and never awaited; their
//! outcome is logged only.

use crate::plugins::PluginRegistry;
use crate::protocol::ToolCallParser;
use serde_json::Value;
use std::sync::Arc;

pub struct ToolOrchestrator {
    parser: Arc<ToolCallParser>,
    registry: Arc<PluginRegistry>,
}

impl ToolOrchestrator {
    pub fn new(parser: Arc<ToolCallParser>, registry: Arc<PluginRegistry>) -> Self {
        Self { parser, registry }
    }

    pub fn parser(&self) -> &ToolCallParser {
        &self.parser
    }

    /// Run every tool request in `text`. Returns the formatted results to
    /// feed back to the model, or `None` when the text contains no
    /// awaitable invocations.
    pub async fn process(&self, text: &str) -> Option<String> {
        let invocations = self.parser.parse(text);
        if invocations.is_empty() {
            return None;
        }

        let mut sections = Vec::new();
        for invocation in invocations {
            let args = serde_json::to_value(&invocation.args).unwrap_or(Value::Null);

            if invocation.fire_and_forget {
                let registry = self.registry.clone();
                let name = invocation.name.clone();
                tracing::info!(plugin = %name, "dispatching fire-and-forget tool call");
                tokio::spawn(async move {
                    if let Err(e) = registry.execute(&name, &args).await {
                        tracing::warn!(plugin = %name, error = %e, "fire-and-forget tool call failed");
                    }
                });
                continue;
            }

            tracing::info!(plugin = %invocation.name, "executing tool call");
            let section = match self.registry.execute(&invocation.name, &args).await {
                Ok(result) => self
                    .parser
                    .format_result(&invocation.name, &result, true, None),
                Err(e) => self.parser.format_result(
                    &invocation.name,
                    &Value::Null,
                    false,
                    Some(&format!("{}: {e}", e.kind.code())),
                ),
            };
            sections.push(section);
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::MANIFEST_FILE;
    use crate::plugins::{loader, InternalExecuteRequest, PluginRegistry};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn registry_with_echo_plugin(root: &std::path::Path) -> Arc<PluginRegistry> {
        let dir = root.join("echo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            json!({
                "name": "Echo",
                "pluginType": "subprocess",
                "entryPoint": {"command": "cat"}
            })
            .to_string(),
        )
        .unwrap();
        let registry = Arc::new(PluginRegistry::new(root.to_path_buf()));
        assert_eq!(loader::load_plugins(&registry, root).await, 1);
        registry
    }

    fn orchestrator(registry: Arc<PluginRegistry>) -> ToolOrchestrator {
        ToolOrchestrator::new(Arc::new(ToolCallParser::with_defaults()), registry)
    }

    #[tokio::test]
    async fn test_plain_text_yields_nothing() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(registry_with_echo_plugin(root.path()).await);
        assert!(orchestrator.process("just words").await.is_none());
    }

    #[tokio::test]
    async fn test_invocation_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(registry_with_echo_plugin(root.path()).await);

        let out = orchestrator
            .process("<<<[TOOL_REQUEST]>>>tool_name:「始」Echo「末」,word:「始」ping「末」<<<[END_TOOL_REQUEST]>>>")
            .await
            .expect("formatted result");
        assert!(out.contains("[Tool \"Echo\" returned SUCCESS]"));
        // `cat` echoes the argument document back
        assert!(out.contains("ping"));
    }

    #[tokio::test]
    async fn test_unknown_tool_formats_failure() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(registry_with_echo_plugin(root.path()).await);

        let out = orchestrator
            .process("<<<[TOOL_REQUEST]>>>tool_name:「始」Ghost「末」<<<[END_TOOL_REQUEST]>>>")
            .await
            .expect("formatted result");
        assert!(out.contains("[Tool \"Ghost\" returned FAILURE]"));
        assert!(out.contains("tool-not-found"));
    }

    #[tokio::test]
    async fn test_fire_and_forget_executes_without_reply() {
        let root = tempfile::tempdir().unwrap();
        let registry = Arc::new(PluginRegistry::new(root.path().to_path_buf()));
        registry
            .register(crate::plugins::PluginDescriptor {
                id: "Notify".to_string(),
                name: "Notify".to_string(),
                version: "1.0.0".to_string(),
                description: String::new(),
                kind: crate::plugins::PluginKind::Internal,
                capabilities: crate::plugins::Capabilities::default(),
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel::<InternalExecuteRequest>(4);
        registry.set_internal_handler(tx).await;

        let orchestrator = orchestrator(registry);
        let out = orchestrator
            .process("<<<[TOOL_REQUEST]>>>tool_name:「始」Notify「末」,archery:「始」no_reply「末」<<<[END_TOOL_REQUEST]>>>")
            .await;
        // No synchronous section for an archery call
        assert!(out.is_none());

        // But the plugin did run in the background
        let request = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("handler invoked")
            .expect("request");
        assert_eq!(request.plugin_id, "Notify");
        let _ = request.reply.send(Ok(json!({"delivered": true})));
    }
}
