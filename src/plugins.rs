//! Plugin runtime: descriptor model, registry, tool catalog and
//! execution dispatch
//!
//! A plugin is identified by a stable `id` and classified by a closed set
//! of kinds. Subprocess plugins run as child processes driven by an
//! on-disk manifest; distributed plugins are advertised by worker nodes
//! over the distributed-tool channel and executed remotely; the remaining
//! kinds feed side tables (preprocessor pipeline, service handles, static
//! placeholder values) or the internal dispatch table.

pub mod loader;
pub mod manifest;
pub mod registry;
mod subprocess;

pub use manifest::PluginManifest;
pub use registry::{DistributedExecutor, InternalExecuteRequest, PluginRegistry};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// What a plugin can be invoked to do, rendered into the tool catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, rename = "invocationCommands")]
    pub invocation_commands: Vec<InvocationCommand>,
}

/// One invocation command of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationCommand {
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub example: String,
}

/// Execution details for a subprocess-backed plugin.
///
/// The manifest is re-read from `directory` at execution time; the fields
/// captured here reflect registration time and feed the catalog.
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    /// Plugin directory (holds `plugin-manifest.json`, doubles as cwd)
    pub directory: PathBuf,
    /// Entry command, tokenized on spaces for argv construction
    pub entry: String,
    /// Config-schema defaults exported as child environment variables
    pub config_defaults: HashMap<String, String>,
    /// Execution timeout in milliseconds
    pub timeout_ms: u64,
}

/// The closed set of plugin kinds; each variant carries only the fields
/// relevant to its kind.
#[derive(Debug, Clone)]
pub enum PluginKind {
    /// Executed as a child process per the on-disk manifest
    Subprocess(SubprocessSpec),
    /// Owned by a worker session; executed over the distributed channel
    Distributed { session_id: String },
    /// Transforms message lists in the preprocessor pipeline
    Preprocessor(SubprocessSpec),
    /// Exposes a handle the embedding layer mounts separately
    Service,
    /// Contributes fixed placeholder values to the template engine
    Static { values: HashMap<String, String> },
    /// Served by the runtime's built-in dispatch table
    Internal,
    /// Accepted at registration; routed by the embedding layer
    Direct,
}

impl PluginKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Subprocess(_) => "subprocess",
            Self::Distributed { .. } => "distributed",
            Self::Preprocessor(_) => "preprocessor",
            Self::Service => "service",
            Self::Static { .. } => "static",
            Self::Internal => "internal",
            Self::Direct => "direct",
        }
    }
}

/// Registry record for one plugin.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub kind: PluginKind,
    pub capabilities: Capabilities,
}

impl PluginDescriptor {
    /// Session id for distributed plugins, `None` otherwise.
    pub fn session_id(&self) -> Option<&str> {
        match &self.kind {
            PluginKind::Distributed { session_id } => Some(session_id),
            _ => None,
        }
    }
}

/// Advisory events emitted by the registry.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    Registered { id: String },
    Executed { id: String },
    Error { id: String, message: String },
    Unloaded { id: String },
}
