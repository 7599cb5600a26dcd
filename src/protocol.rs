//! Tool-call protocol: extraction of tool requests from model output and
//! formatting of tool results for re-ingestion.
//!
//! A model asks for a tool by emitting a delimited block inside its text:
//!
//! ```text
//! <<<[TOOL_REQUEST]>>>
//! tool_name:「始」Fetch「末」,
//! url:「始」http://example.com「末」
//! <<<[END_TOOL_REQUEST]>>>
//! ```
//!
//! Parsing is lossy by contract: malformed blocks are logged and skipped,
//! never surfaced as errors to the caller.

#[cfg(test)]
mod proptests;

use crate::error::{Result, VcpError};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Reserved field naming the target plugin.
pub const FIELD_TOOL_NAME: &str = "tool_name";
/// Reserved field marking a fire-and-forget invocation.
pub const FIELD_ARCHERY: &str = "archery";

/// Delimiter set for tool request blocks. All four strings are
/// configurable; regexes are built from their escaped forms.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub request_open: String,
    pub request_close: String,
    pub value_open: String,
    pub value_close: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            request_open: "<<<[TOOL_REQUEST]>>>".to_string(),
            request_close: "<<<[END_TOOL_REQUEST]>>>".to_string(),
            value_open: "「始」".to_string(),
            value_close: "「末」".to_string(),
        }
    }
}

/// A single tool invocation recovered from model output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Target plugin id (the `tool_name` field)
    pub name: String,
    /// All non-reserved fields of the block
    pub args: HashMap<String, String>,
    /// True when the model does not await a synchronous reply
    pub fire_and_forget: bool,
    /// Original block body, kept for diagnostics
    pub raw_block: String,
}

/// Extracts [`ToolInvocation`]s from free-form text and renders results
/// back into text the model can re-ingest.
pub struct ToolCallParser {
    config: ParserConfig,
    field_re: Regex,
}

impl ToolCallParser {
    pub fn new(config: ParserConfig) -> Result<Self> {
        let pattern = format!(
            r"(?s)([A-Za-z0-9_]+)\s*:\s*{}(.*?){}\s*,?",
            regex::escape(&config.value_open),
            regex::escape(&config.value_close),
        );
        let field_re = Regex::new(&pattern)
            .map_err(|e| VcpError::invalid_config(format!("bad field delimiters: {e}")))?;
        Ok(Self { config, field_re })
    }

    pub fn with_defaults() -> Self {
        // Default delimiters always compile
        Self::new(ParserConfig::default()).expect("default delimiters")
    }

    /// Scan `text` for tool request blocks, in order of appearance.
    ///
    /// Blocks with no closing delimiter or no `tool_name` field are logged
    /// and skipped; parsing never fails.
    pub fn parse(&self, text: &str) -> Vec<ToolInvocation> {
        let mut invocations = Vec::new();
        let mut cursor = 0usize;

        while let Some(rel) = text[cursor..].find(&self.config.request_open) {
            let open_at = cursor + rel;
            let body_start = open_at + self.config.request_open.len();
            let Some(close_rel) = text[body_start..].find(&self.config.request_close) else {
                tracing::warn!(
                    offset = open_at,
                    "tool request block has no closing delimiter, skipping"
                );
                cursor = body_start;
                continue;
            };

            let body = &text[body_start..body_start + close_rel];
            if let Some(invocation) = self.parse_block(body) {
                invocations.push(invocation);
            }
            cursor = body_start + close_rel + self.config.request_close.len();
        }

        invocations
    }

    /// Cheap check for the presence of at least one complete block.
    pub fn has_invocations(&self, text: &str) -> bool {
        match text.find(&self.config.request_open) {
            Some(at) => text[at + self.config.request_open.len()..]
                .contains(&self.config.request_close),
            None => false,
        }
    }

    fn parse_block(&self, body: &str) -> Option<ToolInvocation> {
        let mut name: Option<String> = None;
        let mut fire_and_forget = false;
        let mut args = HashMap::new();

        for caps in self.field_re.captures_iter(body) {
            let field = caps.get(1).map(|m| m.as_str())?;
            let value = caps.get(2).map(|m| m.as_str().trim().to_string())?;
            match field {
                FIELD_TOOL_NAME => name = Some(value),
                FIELD_ARCHERY => {
                    fire_and_forget = value == "true" || value == "no_reply";
                }
                _ => {
                    args.insert(field.to_string(), value);
                }
            }
        }

        let Some(name) = name else {
            tracing::warn!(
                block = %body.trim(),
                "discarding tool request without a tool_name field"
            );
            return None;
        };
        if name.is_empty() {
            tracing::warn!("discarding tool request with an empty tool_name");
            return None;
        }

        Some(ToolInvocation {
            name,
            args,
            fire_and_forget,
            raw_block: body.trim().to_string(),
        })
    }

    /// Render a tool result as text the model can re-ingest.
    ///
    /// Structured payloads are JSON-stringified; strings pass through
    /// unchanged. Rich-content attachments (an `attachments` array of
    /// `{type, url|name}` objects) are appended as an enumerated list.
    pub fn format_result(
        &self,
        plugin: &str,
        payload: &Value,
        ok: bool,
        error: Option<&str>,
    ) -> String {
        let mut out = String::new();
        let status = if ok { "SUCCESS" } else { "FAILURE" };
        let _ = writeln!(out, "[Tool \"{plugin}\" returned {status}]");
        if let Some(err) = error {
            let _ = writeln!(out, "Error: {err}");
        }

        let rendered = match payload {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        let _ = writeln!(out, "```");
        let _ = writeln!(out, "{rendered}");
        let _ = writeln!(out, "```");

        if let Some(attachments) = payload.get("attachments").and_then(Value::as_array) {
            if !attachments.is_empty() {
                let _ = writeln!(out, "Attachments:");
                for (i, attachment) in attachments.iter().enumerate() {
                    let kind = attachment
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("file");
                    let location = attachment
                        .get("url")
                        .or_else(|| attachment.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("<unnamed>");
                    let _ = writeln!(out, "  {}. {kind}: {location}", i + 1);
                }
            }
        }

        out
    }
}
