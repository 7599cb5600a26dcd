//! Distributed tool channel: worker sessions, request/response
//! correlation, timeouts and disconnect cleanup
//!
//! A worker node connects over WebSocket, advertises its toolset with
//! `register_tools`, and executes `execute_tool` frames on request. Every
//! in-flight call holds a pending record keyed by request id inside its
//! owning session; exactly one of the success, timeout or session-death
//! paths consumes it.

use super::Frame;
use crate::error::{Result, VcpError};
use crate::plugins::DistributedExecutor;
use async_trait::async_trait;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng as _;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);
const FILE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 64;

/// Advisory events emitted by the channel. The plugin runtime subscribes
/// to `ToolsRegistered` / `ToolsUnregistered` for bulk (un)registration.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    ServerConnected {
        session_id: String,
    },
    ToolsRegistered {
        session_id: String,
        tools: Vec<Value>,
    },
    ToolsUnregistered {
        session_id: String,
        tools: Vec<String>,
    },
    /// Worker-pushed `tool_result` without a request id
    AsyncToolResult {
        session_id: String,
        status: String,
        result: Value,
    },
    IpReport {
        session_id: String,
        local_ips: Vec<String>,
        public_ip: Option<String>,
    },
}

/// Enumeration snapshot of one worker session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: Option<String>,
    pub tools: Vec<String>,
    pub local_ips: Vec<String>,
    pub public_ip: Option<String>,
    /// Seconds since the last frame from this worker
    pub idle_secs: u64,
}

/// A file body fetched from a worker.
#[derive(Debug)]
pub struct FilePayload {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

struct WorkerSession {
    name: Option<String>,
    tools: Vec<String>,
    local_ips: Vec<String>,
    public_ip: Option<String>,
    last_activity: Instant,
    outbound: mpsc::Sender<Frame>,
    pending: HashMap<String, oneshot::Sender<Result<Value>>>,
}

/// Server side of the distributed-tool channel.
pub struct DistributedToolChannel {
    server_id: String,
    sessions: RwLock<HashMap<String, WorkerSession>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl DistributedToolChannel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            server_id: format!("vcp-server-{}", uuid::Uuid::new_v4()),
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Capacity the API layer should give each session's outbound queue.
    pub fn outbound_capacity() -> usize {
        OUTBOUND_CAPACITY
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Admit a new worker. `outbound` is drained by the socket writer
    /// task, which serializes all writes to that socket.
    pub async fn open_session(&self, outbound: mpsc::Sender<Frame>) -> String {
        let session_id = new_id("session");
        let ack = Frame::new(
            "connection_ack",
            json!({
                "serverId": self.server_id,
                "message": "distributed tool channel ready",
            }),
        );
        if outbound.send(ack).await.is_err() {
            tracing::warn!(session = %session_id, "worker went away before connection_ack");
        }

        self.sessions.write().await.insert(
            session_id.clone(),
            WorkerSession {
                name: None,
                tools: Vec::new(),
                local_ips: Vec::new(),
                public_ip: None,
                last_activity: Instant::now(),
                outbound,
                pending: HashMap::new(),
            },
        );

        tracing::info!(session = %session_id, "worker session opened");
        self.emit(ChannelEvent::ServerConnected {
            session_id: session_id.clone(),
        });
        session_id
    }

    /// Tear down a session: reject its waiters, announce its tools as
    /// gone, drop the record.
    pub async fn close_session(&self, session_id: &str) {
        let Some(session) = self.sessions.write().await.remove(session_id) else {
            return;
        };

        for (request_id, waiter) in session.pending {
            tracing::debug!(session = session_id, request = %request_id, "rejecting waiter on disconnect");
            let _ = waiter.send(Err(VcpError::distributed_connection(format!(
                "worker session {session_id} disconnected"
            ))));
        }

        tracing::info!(session = session_id, tools = session.tools.len(), "worker session closed");
        self.emit(ChannelEvent::ToolsUnregistered {
            session_id: session_id.to_string(),
            tools: session.tools,
        });
    }

    /// Handle one inbound text frame from a worker. Protocol violations
    /// are logged; the session stays open.
    pub async fn handle_frame(&self, session_id: &str, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "dropping unparseable frame");
                return;
            }
        };

        self.touch(session_id).await;

        match frame.kind.as_str() {
            "register_tools" => self.on_register_tools(session_id, &frame.data).await,
            "unregister_tools" => self.on_unregister_tools(session_id, &frame.data).await,
            "tool_result" => self.on_tool_result(session_id, frame.data).await,
            "file_result" => self.on_file_result(session_id, frame.data).await,
            "report_ip" => self.on_report_ip(session_id, &frame.data).await,
            "heartbeat" => {}
            other => {
                tracing::warn!(session = session_id, kind = other, "ignoring unknown frame type");
            }
        }
    }

    async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    async fn on_register_tools(&self, session_id: &str, data: &Value) {
        let tools: Vec<Value> = data
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut names: Vec<String> = Vec::new();
        for tool in &tools {
            let name = tool
                .get("name")
                .or_else(|| tool.get("id"))
                .and_then(Value::as_str);
            if let Some(name) = name {
                names.push(name.to_string());
            }
        }

        let reply = Frame::new(
            "register_ack",
            json!({"tools": names, "count": names.len()}),
        );
        {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            if let Some(server_name) = data.get("serverName").and_then(Value::as_str) {
                session.name = Some(server_name.to_string());
            }
            for name in &names {
                if !session.tools.contains(name) {
                    session.tools.push(name.clone());
                }
            }
            let _ = session.outbound.try_send(reply);
        }

        tracing::info!(session = session_id, count = names.len(), "worker advertised tools");
        self.emit(ChannelEvent::ToolsRegistered {
            session_id: session_id.to_string(),
            tools,
        });
    }

    async fn on_unregister_tools(&self, session_id: &str, data: &Value) {
        let names: Vec<String> = data
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if names.is_empty() {
            return;
        }

        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.tools.retain(|t| !names.contains(t));
        }

        tracing::info!(session = session_id, count = names.len(), "worker withdrew tools");
        self.emit(ChannelEvent::ToolsUnregistered {
            session_id: session_id.to_string(),
            tools: names,
        });
    }

    async fn on_tool_result(&self, session_id: &str, data: Value) {
        let Some(request_id) = data.get("requestId").and_then(Value::as_str) else {
            // Worker-pushed asynchronous result
            let status = data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let result = data.get("result").cloned().unwrap_or(Value::Null);
            self.emit(ChannelEvent::AsyncToolResult {
                session_id: session_id.to_string(),
                status,
                result,
            });
            return;
        };

        let outcome = if data.get("status").and_then(Value::as_str) == Some("success") {
            Ok(data.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let error = data
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("worker reported failure");
            Err(VcpError::tool_execution_failed(error))
        };
        self.resolve_pending(session_id, request_id, outcome).await;
    }

    async fn on_file_result(&self, session_id: &str, data: Value) {
        let Some(request_id) = data.get("requestId").and_then(Value::as_str) else {
            tracing::warn!(session = session_id, "file_result without requestId");
            return;
        };
        let request_id = request_id.to_string();
        self.resolve_pending(session_id, &request_id, Ok(data)).await;
    }

    async fn on_report_ip(&self, session_id: &str, data: &Value) {
        let local_ips: Vec<String> = data
            .get("localIPs")
            .and_then(Value::as_array)
            .map(|ips| {
                ips.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let public_ip = data
            .get("publicIP")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.local_ips.clone_from(&local_ips);
            session.public_ip.clone_from(&public_ip);
        }

        self.emit(ChannelEvent::IpReport {
            session_id: session_id.to_string(),
            local_ips,
            public_ip,
        });
    }

    async fn resolve_pending(
        &self,
        session_id: &str,
        request_id: &str,
        outcome: Result<Value>,
    ) {
        let waiter = self
            .sessions
            .write()
            .await
            .get_mut(session_id)
            .and_then(|session| session.pending.remove(request_id));

        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => {
                // Late result after timeout, or a request id we never issued
                tracing::warn!(
                    session = session_id,
                    request = request_id,
                    "discarding result with no pending request"
                );
            }
        }
    }

    async fn remove_pending(&self, session_id: &str, request_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.pending.remove(request_id);
        }
    }

    /// Send `frame` after registering a pending record for `request_id`.
    /// Fails with a connection error when the session is gone or its
    /// socket writer has shut down.
    async fn send_with_pending(
        &self,
        session_id: &str,
        request_id: &str,
        frame: Frame,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let (tx, rx) = oneshot::channel();
        let outbound = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(session_id).ok_or_else(|| {
                VcpError::distributed_connection(format!(
                    "no connected worker session {session_id}"
                ))
            })?;
            if session.outbound.is_closed() {
                return Err(VcpError::distributed_connection(format!(
                    "worker session {session_id} socket is not open"
                )));
            }
            session.pending.insert(request_id.to_string(), tx);
            session.outbound.clone()
        };

        if outbound.send(frame).await.is_err() {
            self.remove_pending(session_id, request_id).await;
            return Err(VcpError::distributed_connection(format!(
                "worker session {session_id} socket closed mid-send"
            )));
        }
        Ok(rx)
    }

    /// Execute a tool on a worker and await the correlated `tool_result`.
    pub async fn execute(
        &self,
        session_id: &str,
        tool_name: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = new_id("req");
        let frame = Frame::new(
            "execute_tool",
            json!({
                "requestId": request_id,
                "toolName": tool_name,
                "toolArgs": args,
            }),
        );
        let rx = self.send_with_pending(session_id, &request_id, frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(VcpError::distributed_connection(format!(
                "worker session {session_id} disconnected"
            ))),
            Err(_) => {
                self.remove_pending(session_id, &request_id).await;
                Err(VcpError::distributed_timeout(format!(
                    "tool {tool_name} on session {session_id} timed out after {timeout:?}"
                ))
                .with_details(json!({
                    "toolName": tool_name,
                    "sessionId": session_id,
                    "requestId": request_id,
                    "timeoutMs": timeout.as_millis() as u64,
                })))
            }
        }
    }

    /// Ask connected workers for a file, first success wins.
    pub async fn fetch_file(&self, path: &str) -> Result<FilePayload> {
        let session_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        if session_ids.is_empty() {
            return Err(VcpError::distributed_connection(
                "no worker sessions connected",
            ));
        }

        for session_id in session_ids {
            match self.request_file(&session_id, path).await {
                Ok(payload) => return Ok(payload),
                Err(e) => {
                    tracing::debug!(session = %session_id, path, error = %e, "worker could not provide file");
                }
            }
        }
        Err(VcpError::tool_execution_failed(format!(
            "no worker session could provide {path}"
        )))
    }

    async fn request_file(&self, session_id: &str, path: &str) -> Result<FilePayload> {
        let request_id = new_id("file");
        let frame = Frame::new(
            "fetch_file",
            json!({"requestId": request_id, "path": path}),
        );
        let rx = self.send_with_pending(session_id, &request_id, frame).await?;

        let data = match tokio::time::timeout(FILE_FETCH_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => {
                return Err(VcpError::distributed_connection(format!(
                    "worker session {session_id} disconnected"
                )))
            }
            Err(_) => {
                self.remove_pending(session_id, &request_id).await;
                return Err(VcpError::distributed_timeout(format!(
                    "file fetch on session {session_id} timed out"
                )));
            }
        };

        if data.get("status").and_then(Value::as_str) != Some("success") {
            let error = data
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("worker reported failure");
            return Err(VcpError::tool_execution_failed(error));
        }
        let content = data
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| VcpError::websocket_message("file_result without content"))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(content)
            .map_err(|e| VcpError::websocket_message(format!("file_result content is not base64: {e}")))?;
        let mime = data
            .get("mime")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(FilePayload { bytes, mime })
    }

    /// Snapshot of all connected sessions.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, session)| SessionInfo {
                id: id.clone(),
                name: session.name.clone(),
                tools: session.tools.clone(),
                local_ips: session.local_ips.clone(),
                public_ip: session.public_ip.clone(),
                idle_secs: session.last_activity.elapsed().as_secs(),
            })
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    async fn pending_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, |s| s.pending.len())
    }
}

impl Default for DistributedToolChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedExecutor for DistributedToolChannel {
    async fn execute(
        &self,
        session_id: &str,
        tool_name: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        DistributedToolChannel::execute(self, session_id, tool_name, args, timeout).await
    }
}

/// Opaque unique id: prefix, millisecond timestamp, random suffix.
fn new_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{prefix}-{}-{suffix}", chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn open_test_session(
        channel: &DistributedToolChannel,
    ) -> (String, mpsc::Receiver<Frame>) {
        let (tx, mut rx) = mpsc::channel(DistributedToolChannel::outbound_capacity());
        let session_id = channel.open_session(tx).await;
        let ack = rx.recv().await.expect("connection_ack");
        assert_eq!(ack.kind, "connection_ack");
        assert_eq!(ack.data["serverId"], channel.server_id());
        (session_id, rx)
    }

    #[tokio::test]
    async fn test_register_tools_acks_and_emits() {
        let channel = DistributedToolChannel::new();
        let mut events = channel.subscribe();
        let (session_id, mut rx) = open_test_session(&channel).await;
        // Drain the ServerConnected event
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::ServerConnected { .. }
        ));

        channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "register_tools",
                    json!({
                        "serverName": "worker-1",
                        "tools": [
                            {"name": "ImageGen", "description": "draws"},
                            {"id": "OnlyId"},
                        ]
                    }),
                )
                .to_text(),
            )
            .await;

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.kind, "register_ack");
        assert_eq!(ack.data["count"], 2);

        match events.recv().await.unwrap() {
            ChannelEvent::ToolsRegistered { session_id: sid, tools } => {
                assert_eq!(sid, session_id);
                assert_eq!(tools.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let sessions = channel.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name.as_deref(), Some("worker-1"));
        assert!(sessions[0].tools.contains(&"ImageGen".to_string()));
        assert!(sessions[0].tools.contains(&"OnlyId".to_string()));
    }

    #[tokio::test]
    async fn test_execute_timeout_clears_pending() {
        let channel = DistributedToolChannel::new();
        let (session_id, mut rx) = open_test_session(&channel).await;

        let err = channel
            .execute(&session_id, "Slow", &json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::DistributedTimeout);
        let details = err.details.unwrap();
        assert_eq!(details["sessionId"], session_id.as_str());
        assert_eq!(details["toolName"], "Slow");
        assert!(details["requestId"].as_str().is_some());
        assert_eq!(channel.pending_count(&session_id).await, 0);

        // The execute_tool frame did go out before the timeout
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, "execute_tool");
    }

    #[tokio::test]
    async fn test_tool_result_resolves_waiter() {
        let channel = std::sync::Arc::new(DistributedToolChannel::new());
        let (session_id, mut rx) = open_test_session(&channel).await;

        let exec_channel = channel.clone();
        let exec_session = session_id.clone();
        let call = tokio::spawn(async move {
            exec_channel
                .execute(
                    &exec_session,
                    "ImageGen",
                    &json!({"prompt": "cat"}),
                    Duration::from_secs(5),
                )
                .await
        });

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, "execute_tool");
        assert_eq!(sent.data["toolName"], "ImageGen");
        let request_id = sent.data["requestId"].as_str().unwrap().to_string();

        channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "tool_result",
                    json!({
                        "requestId": request_id,
                        "status": "success",
                        "result": {"url": "http://files/cat.png"},
                    }),
                )
                .to_text(),
            )
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["url"], "http://files/cat.png");
        assert_eq!(channel.pending_count(&session_id).await, 0);
    }

    #[tokio::test]
    async fn test_tool_result_error_rejects_waiter() {
        let channel = std::sync::Arc::new(DistributedToolChannel::new());
        let (session_id, mut rx) = open_test_session(&channel).await;

        let exec_channel = channel.clone();
        let exec_session = session_id.clone();
        let call = tokio::spawn(async move {
            exec_channel
                .execute(&exec_session, "Broken", &json!({}), Duration::from_secs(5))
                .await
        });

        let sent = rx.recv().await.unwrap();
        let request_id = sent.data["requestId"].as_str().unwrap().to_string();
        channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "tool_result",
                    json!({"requestId": request_id, "status": "error", "error": "boom"}),
                )
                .to_text(),
            )
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolExecutionFailed);
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_tool_result_without_request_id_is_async_event() {
        let channel = DistributedToolChannel::new();
        let mut events = channel.subscribe();
        let (session_id, _rx) = open_test_session(&channel).await;
        let _ = events.recv().await; // ServerConnected

        channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "tool_result",
                    json!({"status": "success", "result": {"note": "pushed"}}),
                )
                .to_text(),
            )
            .await;

        match events.recv().await.unwrap() {
            ChannelEvent::AsyncToolResult { status, result, .. } => {
                assert_eq!(status, "success");
                assert_eq!(result["note"], "pushed");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_drains_all_waiters() {
        let channel = std::sync::Arc::new(DistributedToolChannel::new());
        let mut events = channel.subscribe();
        let (session_id, mut rx) = open_test_session(&channel).await;
        let _ = events.recv().await; // ServerConnected

        channel
            .handle_frame(
                &session_id,
                &Frame::new("register_tools", json!({"tools": [{"name": "A"}, {"name": "B"}]}))
                    .to_text(),
            )
            .await;
        let _ = rx.recv().await; // register_ack
        let _ = events.recv().await; // ToolsRegistered

        let mut calls = Vec::new();
        for _ in 0..2 {
            let exec_channel = channel.clone();
            let exec_session = session_id.clone();
            calls.push(tokio::spawn(async move {
                exec_channel
                    .execute(&exec_session, "A", &json!({}), Duration::from_secs(30))
                    .await
            }));
        }
        // Both execute_tool frames are on the wire before we cut the cord
        assert_eq!(rx.recv().await.unwrap().kind, "execute_tool");
        assert_eq!(rx.recv().await.unwrap().kind, "execute_tool");

        channel.close_session(&session_id).await;

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert_eq!(err.kind, ErrorKind::DistributedConnectionError);
        }

        match events.recv().await.unwrap() {
            ChannelEvent::ToolsUnregistered { tools, .. } => {
                assert_eq!(tools, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The session id is dead for good
        let err = channel
            .execute(&session_id, "A", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DistributedConnectionError);
        assert_eq!(channel.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_keep_session_alive() {
        let channel = DistributedToolChannel::new();
        let (session_id, _rx) = open_test_session(&channel).await;

        channel.handle_frame(&session_id, "{{{ not json").await;
        channel
            .handle_frame(&session_id, &Frame::new("mystery", json!({})).to_text())
            .await;

        assert_eq!(channel.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_unregister_tools_is_selective() {
        let channel = DistributedToolChannel::new();
        let (session_id, _rx) = open_test_session(&channel).await;
        channel
            .handle_frame(
                &session_id,
                &Frame::new("register_tools", json!({"tools": [{"name": "A"}, {"name": "B"}]}))
                    .to_text(),
            )
            .await;
        channel
            .handle_frame(
                &session_id,
                &Frame::new("unregister_tools", json!({"tools": ["A"]})).to_text(),
            )
            .await;

        let sessions = channel.sessions().await;
        assert_eq!(sessions[0].tools, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_report_ip_updates_session() {
        let channel = DistributedToolChannel::new();
        let mut events = channel.subscribe();
        let (session_id, _rx) = open_test_session(&channel).await;
        let _ = events.recv().await; // ServerConnected

        channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "report_ip",
                    json!({"localIPs": ["10.0.0.5"], "publicIP": "203.0.113.9"}),
                )
                .to_text(),
            )
            .await;

        match events.recv().await.unwrap() {
            ChannelEvent::IpReport { local_ips, public_ip, .. } => {
                assert_eq!(local_ips, vec!["10.0.0.5".to_string()]);
                assert_eq!(public_ip.as_deref(), Some("203.0.113.9"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let sessions = channel.sessions().await;
        assert_eq!(sessions[0].public_ip.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn test_fetch_file_round_trip() {
        let channel = std::sync::Arc::new(DistributedToolChannel::new());
        let (session_id, mut rx) = open_test_session(&channel).await;

        let fetch_channel = channel.clone();
        let call = tokio::spawn(async move { fetch_channel.fetch_file("/notes/today.txt").await });

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, "fetch_file");
        assert_eq!(sent.data["path"], "/notes/today.txt");
        let request_id = sent.data["requestId"].as_str().unwrap().to_string();

        let encoded = base64::engine::general_purpose::STANDARD.encode(b"remote bytes");
        channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "file_result",
                    json!({
                        "requestId": request_id,
                        "status": "success",
                        "content": encoded,
                        "mime": "text/plain",
                    }),
                )
                .to_text(),
            )
            .await;

        let payload = call.await.unwrap().unwrap();
        assert_eq!(payload.bytes, b"remote bytes");
        assert_eq!(payload.mime.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_fetch_file_without_sessions() {
        let channel = DistributedToolChannel::new();
        let err = channel.fetch_file("/x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DistributedConnectionError);
    }

    #[tokio::test]
    async fn test_late_result_is_discarded() {
        let channel = DistributedToolChannel::new();
        let (session_id, _rx) = open_test_session(&channel).await;

        let err = channel
            .execute(&session_id, "Slow", &json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DistributedTimeout);
        let request_id = err.details.unwrap()["requestId"]
            .as_str()
            .unwrap()
            .to_string();

        // The worker answers after the deadline; nothing blows up
        channel
            .handle_frame(
                &session_id,
                &Frame::new(
                    "tool_result",
                    json!({"requestId": request_id, "status": "success", "result": 1}),
                )
                .to_text(),
            )
            .await;
        assert_eq!(channel.pending_count(&session_id).await, 0);
    }
}
