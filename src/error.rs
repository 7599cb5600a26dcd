//! Crate-wide error type with stable classification codes

use serde_json::Value;
use thiserror::Error;

/// Error raised by the parser, template engine, plugin runtime, channels
/// and file fetcher.
///
/// Carries a machine-readable [`ErrorKind`], a human message and optional
/// structured details for the log channels to present.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct VcpError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl VcpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn tool_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolNotFound, message)
    }

    pub fn tool_execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecutionFailed, message)
    }

    pub fn tool_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolTimeout, message)
    }

    pub fn circular_dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircularDependency, message)
    }

    pub fn max_recursion_depth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MaxRecursionDepth, message)
    }

    pub fn variable_resolve(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::VariableResolveError, message)
    }

    pub fn distributed_connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DistributedConnectionError, message)
    }

    pub fn distributed_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DistributedTimeout, message)
    }

    pub fn plugin_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PluginNotFound, message)
    }

    pub fn plugin_load(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PluginLoadError, message)
    }

    pub fn invalid_manifest(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPluginManifest, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn missing_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingRequiredConfig, message)
    }

    pub fn websocket_message(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WebSocketMessageError, message)
    }
}

/// Classification of every failure the core can surface.
#[allow(dead_code)] // The full catalogue is wire-visible; not every kind is raised by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolParseError,
    InvalidToolRequest,
    InvalidParameterFormat,
    ToolNotFound,
    ToolExecutionFailed,
    ToolTimeout,
    InvalidToolArgs,
    VariableResolveError,
    CircularDependency,
    MaxRecursionDepth,
    ProviderNotFound,
    DistributedConnectionError,
    DistributedTimeout,
    DistributedAuthFailed,
    PluginLoadError,
    PluginInitError,
    PluginNotFound,
    InvalidPluginManifest,
    WebSocketConnectionError,
    WebSocketAuthFailed,
    WebSocketMessageError,
    InvalidConfig,
    MissingRequiredConfig,
}

impl ErrorKind {
    /// Stable identifier used in frames and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProtocolParseError => "protocol-parse-error",
            Self::InvalidToolRequest => "invalid-tool-request",
            Self::InvalidParameterFormat => "invalid-parameter-format",
            Self::ToolNotFound => "tool-not-found",
            Self::ToolExecutionFailed => "tool-execution-failed",
            Self::ToolTimeout => "tool-timeout",
            Self::InvalidToolArgs => "invalid-tool-args",
            Self::VariableResolveError => "variable-resolve-error",
            Self::CircularDependency => "circular-dependency",
            Self::MaxRecursionDepth => "max-recursion-depth",
            Self::ProviderNotFound => "provider-not-found",
            Self::DistributedConnectionError => "distributed-connection-error",
            Self::DistributedTimeout => "distributed-timeout",
            Self::DistributedAuthFailed => "distributed-auth-failed",
            Self::PluginLoadError => "plugin-load-error",
            Self::PluginInitError => "plugin-init-error",
            Self::PluginNotFound => "plugin-not-found",
            Self::InvalidPluginManifest => "invalid-plugin-manifest",
            Self::WebSocketConnectionError => "websocket-connection-error",
            Self::WebSocketAuthFailed => "websocket-auth-failed",
            Self::WebSocketMessageError => "websocket-message-error",
            Self::InvalidConfig => "invalid-config",
            Self::MissingRequiredConfig => "missing-required-config",
        }
    }
}

pub type Result<T> = std::result::Result<T, VcpError>;
