//! Server configuration sourced from the environment

use crate::error::{Result, VcpError};
use std::path::PathBuf;

/// Runtime configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the HTTP/WebSocket listener binds to
    pub port: u16,
    /// Shared key embedded in every channel path (`VCP_Key=<key>`)
    pub access_key: String,
    /// Root directory of the on-disk plugin tree
    pub plugin_dir: PathBuf,
    /// Cache directory for the file fetcher
    pub file_cache_dir: PathBuf,
    /// Verbose frame logging on the debug channels
    pub debug_mode: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let port: u16 = std::env::var("VCP_PORT")
            .ok()
            .map(|p| {
                p.parse()
                    .map_err(|_| VcpError::invalid_config(format!("VCP_PORT is not a port: {p}")))
            })
            .transpose()?
            .unwrap_or(6005);

        let access_key = std::env::var("VCP_KEY")
            .map_err(|_| VcpError::missing_config("VCP_KEY must be set for channel auth"))?;

        let plugin_dir = std::env::var("VCP_PLUGIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./plugins"));

        let file_cache_dir = std::env::var("VCP_FILE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(format!("{home}/.vcp-server/file-cache"))
            });

        let debug_mode = std::env::var("VCP_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            port,
            access_key,
            plugin_dir,
            file_cache_dir,
            debug_mode,
        })
    }
}
