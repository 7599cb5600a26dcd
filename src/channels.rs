//! WebSocket channel hub: frame codec and shared-key path handling
//!
//! Every channel speaks the same outer envelope: UTF-8 JSON frames with a
//! `type` tag and the payload under `data`. Channels claim a path of the
//! form `/<channel>/VCP_Key=<key>`; the key is checked before the upgrade
//! is accepted.

pub mod distributed;
pub mod hub;

use crate::error::{Result, VcpError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of the final path segment carrying the shared key.
pub const KEY_SEGMENT_PREFIX: &str = "VCP_Key=";

/// One wire frame, on any channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| VcpError::websocket_message(format!("unparseable frame: {e}")))
    }
}

/// Extract the shared key from a `VCP_Key=<key>` path segment.
pub fn parse_key_segment(segment: &str) -> Option<&str> {
    segment
        .strip_prefix(KEY_SEGMENT_PREFIX)
        .filter(|key| !key.is_empty())
}
